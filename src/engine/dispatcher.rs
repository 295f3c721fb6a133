//! Engine: capture loop, worker pool, shutdown
//!
//! The capture loop is the sole packet producer. Decoded packets are
//! partitioned by flow-key hash across N workers, so all packets of one
//! flow are processed by one worker in capture order and plugins need no
//! locking. On shutdown the workers drain their queues, close every live
//! flow so in-flight transactions still emit, then exit under a hard
//! drain deadline.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::core::{decode_frame, Packet, Transport};
use crate::counters::{bump, Counters};
use crate::error::Result;
use crate::flow::{BoundFlow, FlowKey, PortTable};
use crate::protos::{build_port_table, build_proto_set, ProtoSet};
use crate::publish::{PublisherThread, Sink};
use crate::tcp::Reassembler;
use super::capture::{PacketSource, Sourced};

/// Packet-clock interval between housekeeping sweeps
const HOUSEKEEPING_INTERVAL_MS: i64 = 1_000;

/// Summary returned after a run completes
#[derive(Debug, Clone)]
pub struct EngineReport {
    pub packets: u64,
    pub summary: String,
}

/// Run the analyzer until the source is exhausted or shutdown is flagged
pub fn run(
    config: &Config,
    mut source: Box<dyn PacketSource>,
    sink: Box<dyn Sink>,
    shutdown: &AtomicBool,
) -> Result<EngineReport> {
    let counters = Arc::new(Counters::default());
    let publisher = PublisherThread::spawn(sink, &config.output, counters.clone());
    let ports = Arc::new(build_port_table(config));

    let num_workers = config.engine.actual_workers();
    info!("starting {} workers", num_workers);

    let mut senders: Vec<Sender<Packet>> = Vec::with_capacity(num_workers);
    let (done_tx, done_rx) = bounded::<usize>(num_workers);
    let mut handles = Vec::with_capacity(num_workers);

    for id in 0..num_workers {
        let (tx, rx) = bounded::<Packet>(config.engine.queue_depth);
        senders.push(tx);

        let mut worker = Worker {
            id,
            rx,
            ports: ports.clone(),
            reassembler: Reassembler::new(
                config.engine.max_flows / num_workers.max(1) + 1,
                config.engine.stream_buffer_size,
                counters.clone(),
            ),
            protos: build_proto_set(config, publisher.handle(), counters.clone()),
            last_ts: DateTime::<Utc>::default(),
            last_sweep: DateTime::<Utc>::default(),
        };
        let done = done_tx.clone();
        let handle = std::thread::Builder::new()
            .name(format!("apptap-worker-{}", id))
            .spawn(move || {
                worker.run();
                let _ = done.send(worker.id);
            })
            .expect("failed to spawn worker thread");
        handles.push(handle);
    }
    drop(done_tx);

    // Capture loop: single producer
    let mut stats_deadline = Instant::now() + stats_interval(config);
    loop {
        if shutdown.load(Ordering::Relaxed) {
            info!("shutdown requested, stopping capture");
            break;
        }
        match source.next_frame()? {
            Sourced::Eof => {
                debug!("packet source exhausted");
                break;
            }
            Sourced::Idle => continue,
            Sourced::Frame(frame) => {
                bump(&counters.packets);
                let pkt = match decode_frame(frame.link, frame.ts, &frame.data) {
                    Ok(pkt) => pkt,
                    Err(_) => {
                        bump(&counters.decode_errors);
                        continue;
                    }
                };
                let idx = worker_index(&FlowKey::from_packet(&pkt), num_workers);
                // Blocking send: a full queue backpressures capture
                if senders[idx].send(pkt).is_err() {
                    break;
                }
            }
        }

        if config.logging.stats_interval_secs > 0 && Instant::now() >= stats_deadline {
            info!("stats: {}", counters.summary());
            stats_deadline = Instant::now() + stats_interval(config);
        }
    }

    // Closing the channels tells workers to drain and flush
    drop(senders);
    let deadline = Instant::now() + config.engine.drain_timeout();
    let mut finished = 0;
    while finished < num_workers {
        let left = deadline.saturating_duration_since(Instant::now());
        match done_rx.recv_timeout(left) {
            Ok(_) => finished += 1,
            Err(_) => {
                warn!(
                    "drain deadline hit with {} workers still busy",
                    num_workers - finished
                );
                break;
            }
        }
    }
    let drained = finished == num_workers;
    if drained {
        for handle in handles {
            let _ = handle.join();
        }
        publisher.shutdown();
    } else {
        // Past the deadline the remaining pending transactions are lost;
        // leaking the stuck threads beats hanging the process on join
        warn!("dropping in-flight transactions after drain timeout");
        std::mem::forget(publisher);
    }

    let report = EngineReport {
        packets: counters.packets.load(Ordering::Relaxed),
        summary: counters.summary(),
    };
    info!("capture finished: {}", report.summary);
    Ok(report)
}

fn stats_interval(config: &Config) -> Duration {
    Duration::from_secs(config.logging.stats_interval_secs.max(1))
}

/// Stable flow-to-worker partitioning
fn worker_index(key: &FlowKey, workers: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % workers as u64) as usize
}

/// One worker: owns a reassembler and a plugin set
struct Worker {
    id: usize,
    rx: Receiver<Packet>,
    ports: Arc<PortTable>,
    reassembler: Reassembler,
    protos: ProtoSet,
    /// Latest packet timestamp seen; the worker's only clock
    last_ts: DateTime<Utc>,
    last_sweep: DateTime<Utc>,
}

impl Worker {
    fn run(&mut self) {
        debug!("worker {} up", self.id);
        loop {
            match self.rx.recv_timeout(Duration::from_millis(100)) {
                Ok(pkt) => {
                    self.process(pkt);
                }
                Err(RecvTimeoutError::Timeout) => {
                    // Idle; timers only advance with packet time
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        // Drain whatever is still queued, then close all live flows so
        // their pending transactions emit
        while let Ok(pkt) = self.rx.try_recv() {
            self.process(pkt);
        }
        self.protos.tick_all(self.last_ts);
        self.reassembler.flush_all(&mut self.protos);
        debug!("worker {} done", self.id);
    }

    fn process(&mut self, pkt: Packet) {
        if pkt.ts > self.last_ts {
            self.last_ts = pkt.ts;
        }

        match pkt.transport {
            Transport::Tcp => {
                self.reassembler.process(&pkt, &self.ports, &mut self.protos);
            }
            Transport::Udp => {
                if let Some(res) = self.ports.resolve(&pkt) {
                    let flow = BoundFlow::new(FlowKey::from_packet(&pkt), res.client);
                    if let Some(plugin) = self.protos.udp_mut(res.proto) {
                        plugin.parse_udp(&pkt, &flow);
                    }
                }
            }
        }

        // Housekeeping on the packet clock keeps replays deterministic
        if (self.last_ts - self.last_sweep).num_milliseconds() >= HOUSEKEEPING_INTERVAL_MS {
            self.last_sweep = self.last_ts;
            self.reassembler.expire(self.last_ts, &mut self.protos);
            self.protos.tick_all(self.last_ts);
        }
    }
}

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

/// Install SIGINT/SIGTERM handlers and return the flag they flip
pub fn shutdown_flag() -> &'static AtomicBool {
    if let Err(e) = ctrlc::set_handler(|| SHUTDOWN.store(true, Ordering::Relaxed)) {
        warn!("could not install signal handler: {}", e);
    }
    &SHUTDOWN
}
