//! DNS analyzer
//!
//! Each UDP datagram is one message; queries and responses correlate by
//! `(unordered flow key, transaction id)`. A query with no response inside
//! the transaction timeout is published request-only with an error status.
//! Over TCP the same decoder runs behind a 2-byte length prefix.

pub mod parser;
pub mod types;

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::debug;

use crate::config::DnsConfig;
use crate::core::{Direction, Packet};
use crate::counters::bump;
use crate::flow::{BoundFlow, FlowKey};
use crate::publish::{Endpoint, Status};
use crate::tcp::StreamBuffer;
use super::{
    ParseResult, ParserState, ProtocolId, TcpProtocol, Transaction, TxEmitter, UdpProtocol,
};
use types::{opcode_name, rcode_name, DnsMessage};

/// Correlation token: unordered flow key plus the wire transaction id
type Token = (FlowKey, u16);

struct PendingQuery {
    msg: DnsMessage,
    ts: DateTime<Utc>,
    client: Endpoint,
    server: Endpoint,
    raw: Option<Vec<u8>>,
}

/// Pending-query table shared by the UDP and TCP surfaces of one worker
struct DnsCorrelator {
    cfg: DnsConfig,
    emitter: TxEmitter,
    pending: HashMap<Token, PendingQuery>,
    /// Insertion order for deadline expiry and overflow eviction
    order: VecDeque<(DateTime<Utc>, Token)>,
}

impl DnsCorrelator {
    fn new(cfg: DnsConfig, emitter: TxEmitter) -> Self {
        Self {
            cfg,
            emitter,
            pending: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn timeout(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.cfg.transaction_timeout_ms as i64)
    }

    fn on_query(
        &mut self,
        key: FlowKey,
        msg: DnsMessage,
        ts: DateTime<Utc>,
        client: Endpoint,
        server: Endpoint,
        raw: Option<Vec<u8>>,
    ) {
        if self.pending.len() >= self.cfg.max_pending {
            self.evict_oldest();
        }
        let token = (key, msg.id);
        self.order.push_back((ts, token));
        self.pending.insert(
            token,
            PendingQuery {
                msg,
                ts,
                client,
                server,
                raw,
            },
        );
    }

    fn on_response(&mut self, key: FlowKey, msg: DnsMessage, ts: DateTime<Utc>) {
        let token = (key, msg.id);
        match self.pending.remove(&token) {
            Some(query) => {
                let mut tx = self.base_tx(&query);
                tx.ts_response = Some(ts);
                tx.status = if msg.rcode == 0 {
                    Status::Ok
                } else {
                    Status::Error
                };
                tx.bytes_out = msg.size as u64;
                fill_response_fields(&mut tx, &msg);
                self.emitter.emit(tx);
            }
            None => {
                debug!("dns response without matching request (id={})", msg.id);
                bump(&self.emitter.counters().dns.parse_errors);
            }
        }
    }

    /// Publish request-only transactions for queries past the deadline
    fn expire(&mut self, now: DateTime<Utc>) {
        let timeout = self.timeout();
        while let Some(&(ts, token)) = self.order.front() {
            if now - ts <= timeout {
                break;
            }
            self.order.pop_front();
            if let Some(query) = self.pending.remove(&token) {
                bump(&self.emitter.counters().dns.timeouts);
                let mut tx = self.base_tx(&query);
                tx.status = Status::Error;
                tx.note("no response");
                self.emitter.emit(tx);
            }
        }
    }

    /// Flush every pending query for a closing flow
    fn flush_flow(&mut self, key: &FlowKey) {
        let tokens: Vec<Token> = self
            .pending
            .keys()
            .filter(|(k, _)| k == key)
            .copied()
            .collect();
        for token in tokens {
            if let Some(query) = self.pending.remove(&token) {
                bump(&self.emitter.counters().dns.timeouts);
                let mut tx = self.base_tx(&query);
                tx.status = Status::Error;
                tx.note("no response");
                self.emitter.emit(tx);
            }
        }
    }

    /// Queries still pending at teardown are dropped, not silently: the
    /// timeout counter records them
    fn count_leftover(&mut self) {
        let leftover = self.pending.len() as u64;
        if leftover > 0 {
            self.emitter
                .counters()
                .dns
                .timeouts
                .fetch_add(leftover, std::sync::atomic::Ordering::Relaxed);
            self.pending.clear();
        }
    }

    fn evict_oldest(&mut self) {
        while let Some((_, token)) = self.order.pop_front() {
            if let Some(query) = self.pending.remove(&token) {
                bump(&self.emitter.counters().dns.overflows);
                let mut tx = self.base_tx(&query);
                tx.status = Status::Error;
                tx.note("dropped (overflow)");
                self.emitter.emit(tx);
                return;
            }
        }
    }

    fn base_tx(&self, query: &PendingQuery) -> Transaction {
        let mut tx = Transaction::new(
            ProtocolId::Dns,
            query.ts,
            query.client.clone(),
            query.server.clone(),
        );
        let msg = &query.msg;
        tx.method = Some(opcode_name(msg.opcode).to_string());
        if let Some(q) = msg.queries.first() {
            tx.path = q.name.clone();
            tx.query = Some(format!("class IN, type {}, {}", q.qtype, q.name));
        }
        tx.bytes_in = msg.size as u64;
        tx.request_raw = query.raw.clone();

        tx.fields.insert("id".into(), Value::from(msg.id));
        tx.fields
            .insert("op".into(), Value::from(opcode_name(msg.opcode)));
        if let Some(q) = msg.queries.first() {
            tx.fields.insert(
                "question".into(),
                json!({
                    "name": q.name,
                    "type": q.qtype.to_string(),
                }),
            );
        }
        tx
    }
}

impl Drop for DnsCorrelator {
    fn drop(&mut self) {
        self.count_leftover();
    }
}

fn fill_response_fields(tx: &mut Transaction, msg: &DnsMessage) {
    tx.fields
        .insert("response_code".into(), Value::from(rcode_name(msg.rcode)));
    tx.fields
        .insert("authoritative".into(), Value::from(msg.authoritative));
    tx.fields
        .insert("truncated".into(), Value::from(msg.truncated));
    tx.fields
        .insert("answers_count".into(), Value::from(msg.answers.len()));
    tx.fields
        .insert("authorities_count".into(), Value::from(msg.authorities.len()));
    tx.fields
        .insert("additionals_count".into(), Value::from(msg.additionals.len()));

    let answers: Vec<Value> = msg
        .answers
        .iter()
        .map(|a| {
            json!({
                "name": a.name,
                "type": a.rtype.to_string(),
                "ttl": a.ttl,
                "data": a.rdata.data_string(),
            })
        })
        .collect();
    if !answers.is_empty() {
        tx.fields.insert("answers".into(), Value::Array(answers));
    }
}

// =============================================================================
// UDP surface
// =============================================================================

/// DNS over UDP
pub struct DnsUdpPlugin {
    cfg: DnsConfig,
    correlator: DnsCorrelator,
}

impl DnsUdpPlugin {
    pub fn new(cfg: DnsConfig, emitter: TxEmitter) -> Self {
        Self {
            correlator: DnsCorrelator::new(cfg.clone(), emitter),
            cfg,
        }
    }
}

impl UdpProtocol for DnsUdpPlugin {
    fn id(&self) -> ProtocolId {
        ProtocolId::Dns
    }

    fn parse_udp(&mut self, pkt: &Packet, flow: &BoundFlow) {
        let Some(msg) = parser::parse_message(&pkt.payload) else {
            bump(&self.correlator.emitter.counters().dns.parse_errors);
            return;
        };

        if msg.is_response {
            self.correlator.on_response(flow.key, msg, pkt.ts);
        } else {
            let client = Endpoint::new(pkt.src_ip, pkt.src_port);
            let server = Endpoint::new(pkt.dst_ip, pkt.dst_port);
            let raw = self.cfg.send_request.then(|| pkt.payload.clone());
            self.correlator
                .on_query(flow.key, msg, pkt.ts, client, server, raw);
        }
    }

    fn tick(&mut self, now: DateTime<Utc>) {
        self.correlator.expire(now);
    }
}

// =============================================================================
// TCP surface
// =============================================================================

/// Per-flow framing state for DNS over TCP
#[derive(Default)]
struct DnsTcpFlowState {
    fin_server: bool,
    fin_client: bool,
}

/// DNS over TCP: identical semantics behind 2-byte length framing
pub struct DnsTcpPlugin {
    cfg: DnsConfig,
    correlator: DnsCorrelator,
}

impl DnsTcpPlugin {
    pub fn new(cfg: DnsConfig, emitter: TxEmitter) -> Self {
        Self {
            correlator: DnsCorrelator::new(cfg.clone(), emitter),
            cfg,
        }
    }
}

impl TcpProtocol for DnsTcpPlugin {
    fn id(&self) -> ProtocolId {
        ProtocolId::Dns
    }

    fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.cfg.transaction_timeout_ms)
    }

    fn parse(
        &mut self,
        ts: DateTime<Utc>,
        flow: &BoundFlow,
        dir: Direction,
        stream: &mut StreamBuffer,
        state: &mut ParserState,
    ) -> ParseResult {
        state.get_or_insert_with(DnsTcpFlowState::default);

        loop {
            let Some(len) = stream.peek_u16_be(0) else {
                return ParseResult::NeedMore;
            };
            let len = len as usize;
            if len > self.cfg.max_message_size {
                bump(&self.correlator.emitter.counters().dns.parse_errors);
                return ParseResult::Drop;
            }
            if stream.len() < 2 + len {
                return ParseResult::NeedMore;
            }
            stream.advance(2);
            let payload = stream.collect(len).expect("length checked");

            let Some(msg) = parser::parse_message(&payload) else {
                bump(&self.correlator.emitter.counters().dns.parse_errors);
                return ParseResult::Drop;
            };

            if msg.is_response {
                self.correlator.on_response(flow.key, msg, ts);
            } else {
                let (client_addr, server_addr) = match dir {
                    Direction::ToServer => (flow.client, flow.server()),
                    Direction::ToClient => (flow.server(), flow.client),
                };
                let client = Endpoint::new(client_addr.ip(), client_addr.port());
                let server = Endpoint::new(server_addr.ip(), server_addr.port());
                let raw = self.cfg.send_request.then(|| payload.clone());
                self.correlator
                    .on_query(flow.key, msg, ts, client, server, raw);
            }
        }
    }

    fn fin(&mut self, flow: &BoundFlow, dir: Direction, state: &mut ParserState) {
        let Some(st) = state.get_mut::<DnsTcpFlowState>() else {
            return;
        };
        match dir {
            Direction::ToServer => st.fin_server = true,
            Direction::ToClient => st.fin_client = true,
        }
        if st.fin_server && st.fin_client {
            self.correlator.flush_flow(&flow.key);
        }
    }

    fn gap(
        &mut self,
        _flow: &BoundFlow,
        _dir: Direction,
        _nbytes: usize,
        _state: &mut ParserState,
    ) -> bool {
        // Length-prefixed framing cannot resync after loss
        true
    }

    fn tick(&mut self, now: DateTime<Utc>) {
        self.correlator.expire(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OutputSettings;
    use crate::counters::Counters;
    use crate::core::Transport;
    use crate::publish::{CollectorSink, PublisherThread, Record};
    use chrono::TimeZone;
    use std::sync::Arc;

    fn ts(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    fn udp_pkt(src: (&str, u16), dst: (&str, u16), payload: Vec<u8>, ms: i64) -> Packet {
        Packet {
            ts: ts(ms),
            src_ip: src.0.parse().unwrap(),
            dst_ip: dst.0.parse().unwrap(),
            src_port: src.1,
            dst_port: dst.1,
            transport: Transport::Udp,
            tcp: None,
            payload,
        }
    }

    struct Harness {
        plugin: DnsUdpPlugin,
        publisher: Option<PublisherThread>,
        sink: CollectorSink,
        counters: Arc<Counters>,
    }

    impl Harness {
        fn new(cfg: DnsConfig) -> Self {
            let sink = CollectorSink::new();
            let counters = Arc::new(Counters::default());
            let publisher = PublisherThread::spawn(
                Box::new(sink.clone()),
                &OutputSettings::default(),
                counters.clone(),
            );
            let emitter = TxEmitter::new(
                ProtocolId::Dns,
                publisher.handle(),
                counters.clone(),
                Arc::new(Vec::new()),
                cfg.send_request,
                cfg.send_response,
            );
            Self {
                plugin: DnsUdpPlugin::new(cfg, emitter),
                publisher: Some(publisher),
                sink,
                counters,
            }
        }

        fn records(mut self) -> Vec<Record> {
            self.publisher.take().unwrap().shutdown();
            self.sink.records()
        }
    }

    fn flow_for(pkt: &Packet) -> BoundFlow {
        BoundFlow::new(FlowKey::from_packet(pkt), pkt.src())
    }

    #[test]
    fn test_query_response_pair() {
        // Boundary scenario: A query answered with 1.2.3.4
        let mut h = Harness::new(DnsConfig::default());

        let query = parser::encode_query(0x1234, "www.google.com", 1);
        let q_pkt = udp_pkt(("192.168.1.5", 40000), ("8.8.8.8", 53), query, 0);
        h.plugin.parse_udp(&q_pkt, &flow_for(&q_pkt));

        let response = parser::encode_a_response(0x1234, "www.google.com", [1, 2, 3, 4]);
        let r_pkt = udp_pkt(("8.8.8.8", 53), ("192.168.1.5", 40000), response, 12);
        // The router binds the reverse direction to the same unordered key
        let r_flow = BoundFlow::new(FlowKey::from_packet(&r_pkt), r_pkt.dst());
        h.plugin.parse_udp(&r_pkt, &r_flow);

        let records = h.records();
        assert_eq!(records.len(), 1);
        let rec = &records[0];
        assert_eq!(rec.type_, "dns");
        assert_eq!(rec.status, Status::Ok);
        assert_eq!(rec.path, "www.google.com");
        assert_eq!(rec.fields["id"], 4660);
        assert_eq!(rec.fields["question"]["name"], "www.google.com");
        assert_eq!(rec.fields["answers_count"], 1);
        assert_eq!(rec.fields["answers"][0]["data"], "1.2.3.4");
        assert_eq!(rec.responsetime, Some(12));
    }

    #[test]
    fn test_orphan_query_times_out() {
        // Boundary scenario: query with no response
        let mut h = Harness::new(DnsConfig::default());

        let query = parser::encode_query(0x0042, "orphan.example", 1);
        let q_pkt = udp_pkt(("192.168.1.5", 40001), ("8.8.8.8", 53), query, 0);
        h.plugin.parse_udp(&q_pkt, &flow_for(&q_pkt));

        // Default timeout is 10s of packet time
        h.plugin.tick(ts(10_001));

        let records = h.records();
        assert_eq!(records.len(), 1);
        let rec = &records[0];
        assert_eq!(rec.status, Status::Error);
        assert!(rec.notes.iter().any(|n| n.contains("no response")));
        assert!(rec.responsetime.is_none());
    }

    #[test]
    fn test_id_mismatch_not_correlated() {
        let mut h = Harness::new(DnsConfig::default());

        let query = parser::encode_query(0x0001, "a.example", 1);
        let q_pkt = udp_pkt(("192.168.1.5", 40002), ("8.8.8.8", 53), query, 0);
        h.plugin.parse_udp(&q_pkt, &flow_for(&q_pkt));

        let response = parser::encode_a_response(0x0002, "a.example", [1, 1, 1, 1]);
        let r_pkt = udp_pkt(("8.8.8.8", 53), ("192.168.1.5", 40002), response, 5);
        let r_flow = BoundFlow::new(FlowKey::from_packet(&r_pkt), r_pkt.dst());
        h.plugin.parse_udp(&r_pkt, &r_flow);

        // Unmatched response is counted, not published
        assert_eq!(
            h.counters.dns.parse_errors.load(std::sync::atomic::Ordering::Relaxed),
            1
        );
        assert!(h.records().is_empty());
    }

    #[test]
    fn test_nxdomain_is_error() {
        let mut h = Harness::new(DnsConfig::default());

        let query = parser::encode_query(7, "missing.example", 1);
        let q_pkt = udp_pkt(("192.168.1.5", 40003), ("8.8.8.8", 53), query, 0);
        h.plugin.parse_udp(&q_pkt, &flow_for(&q_pkt));

        // Craft a response with rcode NXDOMAIN and no answers
        let mut response = parser::encode_query(7, "missing.example", 1);
        response[2] = 0x81;
        response[3] = 0x83;
        let r_pkt = udp_pkt(("8.8.8.8", 53), ("192.168.1.5", 40003), response, 3);
        let r_flow = BoundFlow::new(FlowKey::from_packet(&r_pkt), r_pkt.dst());
        h.plugin.parse_udp(&r_pkt, &r_flow);

        let records = h.records();
        assert_eq!(records[0].status, Status::Error);
        assert_eq!(records[0].fields["response_code"], "NXDOMAIN");
    }

    #[test]
    fn test_overflow_evicts_oldest() {
        let cfg = DnsConfig {
            max_pending: 2,
            ..Default::default()
        };
        let mut h = Harness::new(cfg);

        for (i, port) in [40010u16, 40011, 40012].iter().enumerate() {
            let query = parser::encode_query(i as u16, "q.example", 1);
            let q_pkt = udp_pkt(("192.168.1.5", *port), ("8.8.8.8", 53), query, i as i64);
            h.plugin.parse_udp(&q_pkt, &flow_for(&q_pkt));
        }

        let records = h.records();
        assert_eq!(records.len(), 1);
        assert!(records[0]
            .notes
            .contains(&"dropped (overflow)".to_string()));
    }

    #[test]
    fn test_tcp_framing() {
        let sink = CollectorSink::new();
        let counters = Arc::new(Counters::default());
        let publisher = PublisherThread::spawn(
            Box::new(sink.clone()),
            &OutputSettings::default(),
            counters.clone(),
        );
        let emitter = TxEmitter::new(
            ProtocolId::Dns,
            publisher.handle(),
            counters,
            Arc::new(Vec::new()),
            false,
            false,
        );
        let mut plugin = DnsTcpPlugin::new(DnsConfig::default(), emitter);

        let client: std::net::SocketAddr = "192.168.1.5:40020".parse().unwrap();
        let server: std::net::SocketAddr = "8.8.8.8:53".parse().unwrap();
        let flow = BoundFlow::new(FlowKey::new(client, server), client);
        let mut state = ParserState::new();

        let query = parser::encode_query(0x0099, "tcp.example", 1);
        let mut req_stream = StreamBuffer::new(65536);
        let mut framed = (query.len() as u16).to_be_bytes().to_vec();
        framed.extend_from_slice(&query);
        // Deliver the frame in two pieces
        assert!(req_stream.append(&framed[..3]));
        let r = plugin.parse(ts(0), &flow, Direction::ToServer, &mut req_stream, &mut state);
        assert_eq!(r, ParseResult::NeedMore);
        assert!(req_stream.append(&framed[3..]));
        plugin.parse(ts(1), &flow, Direction::ToServer, &mut req_stream, &mut state);

        let response = parser::encode_a_response(0x0099, "tcp.example", [9, 9, 9, 9]);
        let mut resp_stream = StreamBuffer::new(65536);
        let mut framed = (response.len() as u16).to_be_bytes().to_vec();
        framed.extend_from_slice(&response);
        assert!(resp_stream.append(&framed));
        plugin.parse(ts(4), &flow, Direction::ToClient, &mut resp_stream, &mut state);

        publisher.shutdown();
        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].fields["answers"][0]["data"], "9.9.9.9");
        assert_eq!(records[0].responsetime, Some(4));
    }
}
