//! Publisher adaptor
//!
//! The publisher decouples the parse path from the sink: workers enqueue
//! onto a bounded channel and never block. The delivery thread retries a
//! failing sink with exponential backoff up to a cap, then counts the
//! record lost.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use tracing::{debug, error, warn};

use crate::config::OutputSettings;
use crate::counters::{bump, Counters};
use super::record::Record;
use super::sink::Sink;

/// Cloneable handle used by workers to enqueue records
#[derive(Clone)]
pub struct Publisher {
    tx: Sender<Record>,
    counters: Arc<Counters>,
}

impl Publisher {
    /// Hand a record to the delivery thread without blocking.
    ///
    /// A full queue means the sink is backpressured past the high-water
    /// mark; the record is dropped and counted.
    pub fn publish(&self, record: Record) {
        match self.tx.try_send(record) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                bump(&self.counters.records_dropped);
            }
            Err(TrySendError::Disconnected(_)) => {
                bump(&self.counters.records_lost);
            }
        }
    }
}

/// Owns the delivery thread and the sending side's lifecycle
pub struct PublisherThread {
    tx: Option<Sender<Record>>,
    handle: Option<JoinHandle<()>>,
    counters: Arc<Counters>,
}

impl PublisherThread {
    /// Spawn the delivery thread over the given sink
    pub fn spawn(
        mut sink: Box<dyn Sink>,
        settings: &OutputSettings,
        counters: Arc<Counters>,
    ) -> Self {
        let (tx, rx): (Sender<Record>, Receiver<Record>) = bounded(settings.queue_size);
        let max_retries = settings.max_retries;
        let backoff_ms = settings.retry_backoff_ms;
        let thread_counters = counters.clone();

        let handle = std::thread::Builder::new()
            .name("apptap-publish".into())
            .spawn(move || {
                for record in rx.iter() {
                    deliver_with_retry(
                        sink.as_mut(),
                        &record,
                        max_retries,
                        backoff_ms,
                        &thread_counters,
                    );
                }
                if let Err(e) = sink.flush() {
                    error!("sink flush failed: {}", e);
                }
                debug!("publisher thread exiting");
            })
            .expect("failed to spawn publisher thread");

        Self {
            tx: Some(tx),
            handle: Some(handle),
            counters,
        }
    }

    /// Handle for workers
    pub fn handle(&self) -> Publisher {
        Publisher {
            tx: self.tx.clone().expect("publisher already shut down"),
            counters: self.counters.clone(),
        }
    }

    /// Close the queue and wait for the delivery thread to drain
    pub fn shutdown(mut self) {
        drop(self.tx.take());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for PublisherThread {
    fn drop(&mut self) {
        drop(self.tx.take());
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn deliver_with_retry(
    sink: &mut dyn Sink,
    record: &Record,
    max_retries: u32,
    backoff_ms: u64,
    counters: &Counters,
) {
    let mut backoff = Duration::from_millis(backoff_ms);
    for attempt in 0..=max_retries {
        match sink.deliver(record) {
            Ok(()) => return,
            Err(e) if attempt < max_retries => {
                warn!("sink delivery failed (attempt {}): {}", attempt + 1, e);
                std::thread::sleep(backoff);
                backoff *= 2;
            }
            Err(e) => {
                error!("record lost after {} retries: {}", max_retries, e);
                counters.records_lost.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publish::record::Status;
    use crate::publish::sink::CollectorSink;
    use chrono::{TimeZone, Utc};

    fn rec(type_: &'static str) -> Record {
        Record::new(Utc.timestamp_millis_opt(0).unwrap(), type_, Status::Ok)
    }

    #[test]
    fn test_publish_roundtrip() {
        let sink = CollectorSink::new();
        let collected = sink.clone();
        let counters = Arc::new(Counters::default());
        let publisher = PublisherThread::spawn(
            Box::new(sink),
            &OutputSettings::default(),
            counters.clone(),
        );

        let handle = publisher.handle();
        handle.publish(rec("http"));
        handle.publish(rec("dns"));
        drop(handle);
        publisher.shutdown();

        let records = collected.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].type_, "http");
        assert_eq!(records[1].type_, "dns");
        assert_eq!(counters.records_lost.load(Ordering::Relaxed), 0);
    }

    /// A sink that always fails, to exercise the retry/lost path
    struct FailingSink;

    impl Sink for FailingSink {
        fn deliver(&mut self, _: &Record) -> crate::error::Result<()> {
            Err(crate::error::TapError::SinkError("down".into()))
        }
    }

    #[test]
    fn test_lost_records_counted() {
        let counters = Arc::new(Counters::default());
        let settings = OutputSettings {
            max_retries: 1,
            retry_backoff_ms: 1,
            ..Default::default()
        };
        let publisher = PublisherThread::spawn(Box::new(FailingSink), &settings, counters.clone());
        publisher.handle().publish(rec("http"));
        publisher.shutdown();

        assert_eq!(counters.records_lost.load(Ordering::Relaxed), 1);
    }
}
