//! TCP reassembler and flow state
//!
//! One entry per live TCP flow: two directional stream buffers, next
//! expected sequence numbers, the bound plugin, and the plugin's opaque
//! parser state. Flow entries die on RST, both-sides FIN, idle timeout,
//! or eviction under the flow cap (oldest first).
//!
//! All timeouts advance on packet capture timestamps so a PCAP replay is
//! deterministic.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::{debug, trace};

use crate::core::{Direction, Packet};
use crate::counters::{bump, Counters};
use crate::flow::{BoundFlow, FlowKey, PortTable};
use crate::protos::{ParseResult, ParserState, ProtoSet, ProtocolId};
use super::stream::StreamBuffer;

/// Per-direction reassembly state
struct DirState {
    /// Next expected sequence number; `None` until the first segment
    next_seq: Option<u32>,
    stream: StreamBuffer,
    fin_seen: bool,
}

impl DirState {
    fn new(buffer_cap: usize) -> Self {
        Self {
            next_seq: None,
            stream: StreamBuffer::new(buffer_cap),
            fin_seen: false,
        }
    }
}

/// State for one live TCP flow
struct TcpFlow {
    bound: BoundFlow,
    proto: ProtocolId,
    last_seen: DateTime<Utc>,
    to_server: DirState,
    to_client: DirState,
    parser_state: ParserState,
    /// Plugin gave up on this flow; swallow bytes until it closes
    dead: bool,
}

impl TcpFlow {
    fn dir_state(&mut self, dir: Direction) -> &mut DirState {
        match dir {
            Direction::ToServer => &mut self.to_server,
            Direction::ToClient => &mut self.to_client,
        }
    }
}

/// The reassembler: flow table plus segment ordering logic
pub struct Reassembler {
    flows: HashMap<FlowKey, TcpFlow>,
    max_flows: usize,
    buffer_cap: usize,
    counters: Arc<Counters>,
}

impl Reassembler {
    pub fn new(max_flows: usize, buffer_cap: usize, counters: Arc<Counters>) -> Self {
        Self {
            flows: HashMap::with_capacity(max_flows.min(16_384)),
            max_flows,
            buffer_cap,
            counters,
        }
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    /// Feed one TCP packet through reassembly and the bound plugin
    pub fn process(&mut self, pkt: &Packet, ports: &PortTable, protos: &mut ProtoSet) {
        let Some(meta) = pkt.tcp else { return };
        let key = FlowKey::from_packet(pkt);

        if !self.flows.contains_key(&key) {
            // RST/FIN for an unknown flow carries nothing to reassemble
            if meta.flags.rst || (meta.flags.fin && pkt.payload.is_empty()) {
                return;
            }
            let Some(res) = ports.resolve(pkt) else {
                trace!("no plugin for {}:{} -> drop flow", pkt.dst_ip, pkt.dst_port);
                return;
            };
            if self.flows.len() >= self.max_flows {
                self.evict_oldest(protos);
            }
            let flow = TcpFlow {
                bound: BoundFlow::new(key, res.client),
                proto: res.proto,
                last_seen: pkt.ts,
                to_server: DirState::new(self.buffer_cap),
                to_client: DirState::new(self.buffer_cap),
                parser_state: ParserState::new(),
                dead: false,
            };
            self.flows.insert(key, flow);
            bump(&self.counters.flows_created);
            debug!("new {} flow {}", res.proto, key);
        }

        let flow = self.flows.get_mut(&key).expect("flow just ensured");
        flow.last_seen = pkt.ts;
        let dir = flow.bound.direction_of(pkt);

        let mut destroy = false;

        // SYN pins the initial sequence number; it consumes one seq slot
        if meta.flags.syn {
            flow.dir_state(dir).next_seq = Some(meta.seq.wrapping_add(1));
        } else if !pkt.payload.is_empty() && !flow.dead {
            Self::ingest_segment(flow, pkt, dir, meta.seq, protos, &self.counters);
        }

        if meta.flags.fin {
            let ds = flow.dir_state(dir);
            if !ds.fin_seen {
                ds.fin_seen = true;
                if !flow.dead {
                    protos
                        .tcp_mut(flow.proto)
                        .expect("bound plugin registered")
                        .fin(&flow.bound, dir, &mut flow.parser_state);
                }
            }
            if flow.to_server.fin_seen && flow.to_client.fin_seen {
                destroy = true;
            }
        }

        if meta.flags.rst {
            if !flow.dead {
                Self::fin_remaining(flow, protos);
            }
            destroy = true;
        }

        if destroy {
            self.flows.remove(&key);
        }
    }

    /// Order a data segment into the stream and run the plugin
    fn ingest_segment(
        flow: &mut TcpFlow,
        pkt: &Packet,
        dir: Direction,
        seq: u32,
        protos: &mut ProtoSet,
        counters: &Counters,
    ) {
        let proto = flow.proto;
        let payload: &[u8] = &pkt.payload;
        let ds = flow.dir_state(dir);

        let expected = match ds.next_seq {
            Some(e) => e,
            None => {
                // Joined mid-stream; accept this segment as the start
                ds.next_seq = Some(seq);
                seq
            }
        };

        let to_append: Option<&[u8]> = if seq == expected {
            Some(payload)
        } else if seq_after(seq, expected) {
            // Gap: bytes were lost between expected and seq
            let lost = seq.wrapping_sub(expected) as usize;
            bump(&counters.proto(proto).gaps);
            let drop_flow = protos
                .tcp_mut(proto)
                .expect("bound plugin registered")
                .gap(&flow.bound, dir, lost, &mut flow.parser_state);
            if drop_flow {
                flow.dead = true;
                flow.parser_state.clear();
                flow.to_server.stream.clear();
                flow.to_client.stream.clear();
                return;
            }
            // Plugin recovered; resume at the new sequence
            let ds = flow.dir_state(dir);
            ds.next_seq = Some(seq);
            Some(payload)
        } else {
            // Retransmission or overlap: trim the already-seen prefix
            let overlap = expected.wrapping_sub(seq) as usize;
            if overlap < payload.len() {
                Some(&payload[overlap..])
            } else {
                None
            }
        };

        let Some(bytes) = to_append else { return };
        if bytes.is_empty() {
            return;
        }

        let ds = flow.dir_state(dir);
        let base = ds.next_seq.unwrap_or(seq);
        ds.next_seq = Some(base.wrapping_add(bytes.len() as u32));
        if !ds.stream.append(bytes) {
            // Parser stopped consuming and the window is full
            debug!("stream buffer overflow on {} flow {}", proto, flow.bound.key);
            bump(&counters.proto(proto).parse_errors);
            flow.dead = true;
            flow.parser_state.clear();
            flow.to_server.stream.clear();
            flow.to_client.stream.clear();
            return;
        }

        Self::drive_parser(flow, pkt.ts, dir, protos);
    }

    /// Call the plugin until it needs more data or gives up
    fn drive_parser(
        flow: &mut TcpFlow,
        ts: DateTime<Utc>,
        dir: Direction,
        protos: &mut ProtoSet,
    ) {
        let plugin = protos.tcp_mut(flow.proto).expect("bound plugin registered");
        loop {
            let stream = match dir {
                Direction::ToServer => &mut flow.to_server.stream,
                Direction::ToClient => &mut flow.to_client.stream,
            };
            if stream.is_empty() {
                break;
            }
            let before = stream.consumed_offset();
            let result = plugin.parse(ts, &flow.bound, dir, stream, &mut flow.parser_state);
            match result {
                ParseResult::NeedMore => break,
                ParseResult::Drop => {
                    flow.dead = true;
                    flow.parser_state.clear();
                    flow.to_server.stream.clear();
                    flow.to_client.stream.clear();
                    break;
                }
                ParseResult::Ok => {
                    let stream = match dir {
                        Direction::ToServer => &flow.to_server.stream,
                        Direction::ToClient => &flow.to_client.stream,
                    };
                    // No forward progress means the contract was violated;
                    // stop rather than spin
                    if stream.consumed_offset() == before {
                        break;
                    }
                }
            }
        }
    }

    fn fin_remaining(flow: &mut TcpFlow, protos: &mut ProtoSet) {
        let plugin = protos.tcp_mut(flow.proto).expect("bound plugin registered");
        if !flow.to_server.fin_seen {
            flow.to_server.fin_seen = true;
            plugin.fin(&flow.bound, Direction::ToServer, &mut flow.parser_state);
        }
        if !flow.to_client.fin_seen {
            flow.to_client.fin_seen = true;
            plugin.fin(&flow.bound, Direction::ToClient, &mut flow.parser_state);
        }
    }

    /// Expire flows idle past their plugin's connection timeout
    pub fn expire(&mut self, now: DateTime<Utc>, protos: &mut ProtoSet) {
        let expired: Vec<FlowKey> = self
            .flows
            .iter()
            .filter(|(_, f)| {
                let timeout = ChronoDuration::from_std(protos.connection_timeout(f.proto))
                    .unwrap_or_else(|_| ChronoDuration::seconds(10));
                now - f.last_seen > timeout
            })
            .map(|(k, _)| *k)
            .collect();

        for key in expired {
            if let Some(mut flow) = self.flows.remove(&key) {
                debug!("flow {} timed out", key);
                if !flow.dead {
                    Self::fin_remaining(&mut flow, protos);
                }
                bump(&self.counters.flows_timed_out);
            }
        }
    }

    /// Shutdown path: fin every live flow so in-flight transactions emit
    pub fn flush_all(&mut self, protos: &mut ProtoSet) {
        for (_, mut flow) in self.flows.drain() {
            if !flow.dead {
                Self::fin_remaining(&mut flow, protos);
            }
        }
    }

    /// Drop the flow idle the longest to make room for a new one
    fn evict_oldest(&mut self, protos: &mut ProtoSet) {
        let oldest = self
            .flows
            .iter()
            .min_by_key(|(_, f)| f.last_seen)
            .map(|(k, _)| *k);
        if let Some(key) = oldest {
            if let Some(mut flow) = self.flows.remove(&key) {
                if !flow.dead {
                    Self::fin_remaining(&mut flow, protos);
                }
                bump(&self.counters.flows_evicted);
            }
        }
    }
}

/// True when sequence `a` is after `b`, mod 2^32
fn seq_after(a: u32, b: u32) -> bool {
    let diff = a.wrapping_sub(b);
    diff > 0 && diff < (1 << 31)
}
