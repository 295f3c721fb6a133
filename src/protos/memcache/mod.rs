//! Memcache analyzer
//!
//! Detects the protocol variant from the first byte of a flow: 0x80/0x81
//! means binary, a printable ASCII command means text. Text requests pair
//! FIFO; `noreply` requests publish immediately. Binary requests pair by
//! opaque; quiet opcodes produce no response on success and are flushed
//! when a later response (or flow close) passes over them.

pub mod binary;
pub mod text;

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;

use crate::config::MemcacheConfig;
use crate::core::{Direction, Packet};
use crate::counters::bump;
use crate::flow::{BoundFlow, FlowKey};
use crate::publish::{Endpoint, Status};
use crate::tcp::StreamBuffer;
use super::{
    ParseResult, ParserState, ProtocolId, TcpProtocol, Transaction, TxEmitter, UdpProtocol,
};
use binary::{BinPacket, BinParse};
use text::{TextParse, TextRequest, TextResponse};

/// Bound on unanswered requests per flow
const MAX_PENDING: usize = 512;

/// Command families reported as `memcache.command_class`
fn classify(command: &str) -> &'static str {
    match command {
        "get" | "gets" | "getq" | "getk" | "getkq" | "gat" | "gatq" | "touch" => "Load",
        "set" | "add" | "replace" | "append" | "prepend" | "cas" | "setq" | "addq"
        | "replaceq" | "appendq" | "prependq" => "Store",
        "delete" | "deleteq" => "Delete",
        "incr" | "decr" | "incrq" | "decrq" => "Counter",
        "stats" | "stat" => "Stats",
        "version" | "verbosity" | "flush" | "flush_all" | "noop" | "quit" | "quitq" => "Info",
        cmd if cmd.starts_with("slabs") => "SlabCtrl",
        cmd if cmd.starts_with("lru_crawler") => "LRUCrawler",
        cmd if cmd.starts_with("sasl") => "Auth",
        _ => "UNKNOWN",
    }
}

/// Protocol variant bound to a flow after the first byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum Variant {
    #[default]
    Unknown,
    Text,
    Binary,
}

struct PendingText {
    req: TextRequest,
    ts: DateTime<Utc>,
}

struct PendingBin {
    pkt: BinPacket,
    ts: DateTime<Utc>,
}

#[derive(Default)]
struct McFlowState {
    variant: Variant,
    text_pending: VecDeque<PendingText>,
    bin_pending: VecDeque<PendingBin>,
    fin_server: bool,
    fin_client: bool,
}

/// The Memcache TCP plugin
pub struct MemcachePlugin {
    cfg: MemcacheConfig,
    emitter: TxEmitter,
}

impl MemcachePlugin {
    pub fn new(cfg: MemcacheConfig, emitter: TxEmitter) -> Self {
        Self { cfg, emitter }
    }

    fn endpoints(&self, flow: &BoundFlow) -> (Endpoint, Endpoint) {
        (
            Endpoint::new(flow.client.ip(), flow.client.port()),
            Endpoint::new(flow.server().ip(), flow.server().port()),
        )
    }

    // -------------------------------------------------------------------
    // Text variant
    // -------------------------------------------------------------------

    fn text_tx(&self, flow: &BoundFlow, req: &TextRequest, ts: DateTime<Utc>) -> Transaction {
        let (client, server) = self.endpoints(flow);
        let mut tx = Transaction::new(ProtocolId::Memcache, ts, client, server);
        tx.method = Some(req.command.clone());
        tx.path = req.keys.first().cloned().unwrap_or_default();
        tx.bytes_in = req.size;

        tx.fields.insert("protocol".into(), Value::from("text"));
        tx.fields
            .insert("command".into(), Value::from(req.command.clone()));
        tx.fields
            .insert("command_class".into(), Value::from(classify(&req.command)));
        if !req.keys.is_empty() {
            tx.fields.insert(
                "keys".into(),
                Value::Array(req.keys.iter().map(|k| Value::from(k.clone())).collect()),
            );
        }
        if let Some(flags) = req.flags {
            tx.fields.insert("flags".into(), Value::from(flags));
        }
        if let Some(exptime) = req.exptime {
            tx.fields.insert("exptime".into(), Value::from(exptime));
        }
        if let Some(bytes) = req.bytes {
            tx.fields.insert("bytes".into(), Value::from(bytes));
        }
        if let Some(cas) = req.cas {
            tx.fields.insert("cas".into(), Value::from(cas));
        }
        if req.noreply {
            tx.fields.insert(
                "request".into(),
                serde_json::json!({ "noreply": true }),
            );
        }
        tx
    }

    fn emit_text_pair(
        &self,
        flow: &BoundFlow,
        pending: PendingText,
        resp: TextResponse,
        ts_end: DateTime<Utc>,
    ) {
        let mut tx = self.text_tx(flow, &pending.req, pending.ts);
        tx.ts_response = Some(ts_end);
        tx.bytes_out = resp.size;
        tx.fields
            .insert("status".into(), Value::from(resp.status.clone()));
        if resp.error.is_some() {
            tx.status = Status::Error;
            tx.fields.insert(
                "error".into(),
                Value::from(resp.error.clone().unwrap_or_default()),
            );
        }
        if !resp.values.is_empty() {
            tx.fields
                .insert("value_count".into(), Value::from(resp.values.len()));
            if self.cfg.maxvalues > 0 {
                let values: Vec<Value> = resp
                    .values
                    .iter()
                    .take(self.cfg.maxvalues)
                    .map(|v| Value::from(String::from_utf8_lossy(&v.data).into_owned()))
                    .collect();
                tx.fields.insert("values".into(), Value::Array(values));
            }
        }
        self.emitter.emit(tx);
    }

    // -------------------------------------------------------------------
    // Binary variant
    // -------------------------------------------------------------------

    fn bin_tx(&self, flow: &BoundFlow, pending: &PendingBin) -> Transaction {
        let (client, server) = self.endpoints(flow);
        let mut tx = Transaction::new(ProtocolId::Memcache, pending.ts, client, server);
        let name = binary::opcode_name(pending.pkt.opcode);
        tx.method = Some(name.to_string());
        tx.path = pending.pkt.key.clone();
        tx.bytes_in = pending.pkt.size;

        tx.fields.insert("protocol".into(), Value::from("binary"));
        tx.fields.insert("command".into(), Value::from(name));
        tx.fields
            .insert("command_class".into(), Value::from(classify(name)));
        tx.fields
            .insert("opaque".into(), Value::from(pending.pkt.opaque));
        if !pending.pkt.key.is_empty() {
            tx.fields.insert(
                "keys".into(),
                Value::Array(vec![Value::from(pending.pkt.key.clone())]),
            );
        }
        if pending.pkt.cas != 0 {
            tx.fields.insert("cas".into(), Value::from(pending.pkt.cas));
        }
        if pending.pkt.value_len > 0 {
            tx.fields
                .insert("bytes".into(), Value::from(pending.pkt.value_len));
        }
        tx.fields.insert(
            "request".into(),
            serde_json::json!({ "quiet": binary::is_quiet(pending.pkt.opcode) }),
        );
        tx
    }

    /// Emit a quiet request that never saw a response
    fn emit_bin_flushed(&self, flow: &BoundFlow, pending: PendingBin) {
        let quiet = binary::is_quiet(pending.pkt.opcode);
        let mut tx = self.bin_tx(flow, &pending);
        if !quiet {
            bump(&self.emitter.counters().memcache.timeouts);
            tx.status = Status::Error;
            tx.note("no response");
        }
        self.emitter.emit(tx);
    }

    fn emit_bin_pair(
        &self,
        flow: &BoundFlow,
        pending: PendingBin,
        resp: &BinPacket,
        ts_end: DateTime<Utc>,
    ) {
        let mut tx = self.bin_tx(flow, &pending);
        tx.ts_response = Some(ts_end);
        tx.bytes_out = resp.size;
        tx.fields.insert(
            "status".into(),
            Value::from(binary::status_name(resp.status)),
        );
        tx.fields.insert(
            "status_class".into(),
            Value::from(if resp.status == 0 { "Success" } else { "Fail" }),
        );
        if resp.status != 0 {
            tx.status = Status::Error;
        }
        if resp.value_len > 0 {
            tx.fields
                .insert("value_bytes".into(), Value::from(resp.value_len));
        }
        self.emitter.emit(tx);
    }
}

impl TcpProtocol for MemcachePlugin {
    fn id(&self) -> ProtocolId {
        ProtocolId::Memcache
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
        let st = state.get_or_insert_with(McFlowState::default);

        if st.variant == Variant::Unknown {
            let Some(&first) = stream.as_slice().first() else {
                return ParseResult::NeedMore;
            };
            st.variant = if first == binary::MAGIC_REQUEST || first == binary::MAGIC_RESPONSE {
                Variant::Binary
            } else if text::looks_like_text(stream.as_slice()) {
                Variant::Text
            } else {
                debug!("memcache flow {} has unrecognizable first byte", flow.key);
                bump(&self.emitter.counters().memcache.parse_errors);
                return ParseResult::Drop;
            };
        }

        loop {
            if stream.is_empty() {
                return ParseResult::NeedMore;
            }
            if stream.len() > self.cfg.max_message_size {
                bump(&self.emitter.counters().memcache.parse_errors);
                return ParseResult::Drop;
            }

            match (st.variant, dir) {
                (Variant::Text, Direction::ToServer) => {
                    match text::parse_request(stream.as_slice()) {
                        TextParse::NeedMore => return ParseResult::NeedMore,
                        TextParse::Error(e) => {
                            debug!("memcache text parse error on {}: {}", flow.key, e);
                            bump(&self.emitter.counters().memcache.parse_errors);
                            return ParseResult::Drop;
                        }
                        TextParse::Done(req, used) => {
                            stream.advance(used);
                            if classify(&req.command) == "UNKNOWN" && !self.cfg.parseunknown {
                                debug!("memcache unknown command {:?}", req.command);
                                bump(&self.emitter.counters().memcache.parse_errors);
                                continue;
                            }
                            if req.noreply {
                                let tx = self.text_tx(flow, &req, ts);
                                self.emitter.emit(tx);
                            } else {
                                if st.text_pending.len() >= MAX_PENDING {
                                    bump(&self.emitter.counters().memcache.overflows);
                                    if let Some(evicted) = st.text_pending.pop_front() {
                                        let mut tx = self.text_tx(flow, &evicted.req, evicted.ts);
                                        tx.status = Status::Error;
                                        tx.note("dropped (overflow)");
                                        self.emitter.emit(tx);
                                    }
                                }
                                st.text_pending.push_back(PendingText { req, ts });
                            }
                        }
                    }
                }
                (Variant::Text, Direction::ToClient) => {
                    let max = self.effective_max_value();
                    match text::parse_response(stream.as_slice(), max) {
                        TextParse::NeedMore => return ParseResult::NeedMore,
                        TextParse::Error(e) => {
                            debug!("memcache text parse error on {}: {}", flow.key, e);
                            bump(&self.emitter.counters().memcache.parse_errors);
                            return ParseResult::Drop;
                        }
                        TextParse::Done(resp, used) => {
                            stream.advance(used);
                            match st.text_pending.pop_front() {
                                Some(pending) => self.emit_text_pair(flow, pending, resp, ts),
                                None => {
                                    debug!("memcache reply without pending command on {}", flow.key);
                                    bump(&self.emitter.counters().memcache.parse_errors);
                                }
                            }
                        }
                    }
                }
                (Variant::Binary, _) => {
                    match binary::parse_packet(stream.as_slice(), self.cfg.max_message_size) {
                        BinParse::NeedMore => return ParseResult::NeedMore,
                        BinParse::Error(e) => {
                            debug!("memcache binary parse error on {}: {}", flow.key, e);
                            bump(&self.emitter.counters().memcache.parse_errors);
                            return ParseResult::Drop;
                        }
                        BinParse::Done(pkt, used) => {
                            stream.advance(used);
                            if pkt.is_request {
                                if st.bin_pending.len() >= MAX_PENDING {
                                    bump(&self.emitter.counters().memcache.overflows);
                                    if let Some(evicted) = st.bin_pending.pop_front() {
                                        let mut tx = self.bin_tx(flow, &evicted);
                                        tx.status = Status::Error;
                                        tx.note("dropped (overflow)");
                                        self.emitter.emit(tx);
                                    }
                                }
                                st.bin_pending.push_back(PendingBin { pkt, ts });
                            } else {
                                // Quiet requests ahead of the matching
                                // opaque never got a response; flush them
                                // in request order
                                while let Some(front) = st.bin_pending.front() {
                                    if front.pkt.opaque == pkt.opaque {
                                        break;
                                    }
                                    let flushed =
                                        st.bin_pending.pop_front().expect("front checked");
                                    self.emit_bin_flushed(flow, flushed);
                                }
                                match st.bin_pending.pop_front() {
                                    Some(pending) => {
                                        self.emit_bin_pair(flow, pending, &pkt, ts)
                                    }
                                    None => {
                                        debug!(
                                            "memcache binary reply with unknown opaque {} on {}",
                                            pkt.opaque, flow.key
                                        );
                                        bump(&self.emitter.counters().memcache.parse_errors);
                                    }
                                }
                            }
                        }
                    }
                }
                (Variant::Unknown, _) => unreachable!("variant resolved above"),
            }
        }
    }

    fn fin(&mut self, flow: &BoundFlow, dir: Direction, state: &mut ParserState) {
        let Some(st) = state.get_mut::<McFlowState>() else {
            return;
        };
        match dir {
            Direction::ToServer => st.fin_server = true,
            Direction::ToClient => st.fin_client = true,
        }
        if st.fin_server && st.fin_client {
            while let Some(pending) = st.text_pending.pop_front() {
                bump(&self.emitter.counters().memcache.timeouts);
                let mut tx = self.text_tx(flow, &pending.req, pending.ts);
                tx.status = Status::Error;
                tx.note("no response");
                self.emitter.emit(tx);
            }
            while let Some(pending) = st.bin_pending.pop_front() {
                self.emit_bin_flushed(flow, pending);
            }
        }
    }

    fn gap(
        &mut self,
        flow: &BoundFlow,
        _dir: Direction,
        nbytes: usize,
        _state: &mut ParserState,
    ) -> bool {
        debug!("dropping memcache flow {} after {} lost bytes", flow.key, nbytes);
        true
    }
}

impl MemcachePlugin {
    fn effective_max_value(&self) -> usize {
        if self.cfg.maxbytespervalue == 0 {
            usize::MAX
        } else {
            self.cfg.maxbytespervalue
        }
    }
}

// =============================================================================
// UDP surface
// =============================================================================

/// The 8-byte memcache UDP frame header
fn parse_udp_header(payload: &[u8]) -> Option<(u16, &[u8])> {
    if payload.len() < 8 {
        return None;
    }
    let request_id = u16::from_be_bytes([payload[0], payload[1]]);
    Some((request_id, &payload[8..]))
}

struct PendingUdp {
    req: TextRequest,
    ts: DateTime<Utc>,
    client: Endpoint,
    server: Endpoint,
}

/// Memcache over UDP: text protocol behind a frame header, correlated by
/// the frame's request id
pub struct MemcacheUdpPlugin {
    cfg: MemcacheConfig,
    emitter: TxEmitter,
    pending: HashMap<(FlowKey, u16), PendingUdp>,
    order: VecDeque<(DateTime<Utc>, (FlowKey, u16))>,
}

impl MemcacheUdpPlugin {
    pub fn new(cfg: MemcacheConfig, emitter: TxEmitter) -> Self {
        Self {
            cfg,
            emitter,
            pending: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn tx_for(&self, pending: &PendingUdp) -> Transaction {
        let mut tx = Transaction::new(
            ProtocolId::Memcache,
            pending.ts,
            pending.client.clone(),
            pending.server.clone(),
        );
        tx.method = Some(pending.req.command.clone());
        tx.path = pending.req.keys.first().cloned().unwrap_or_default();
        tx.bytes_in = pending.req.size;
        tx.fields.insert("protocol".into(), Value::from("text"));
        tx.fields
            .insert("udp".into(), Value::from(true));
        tx.fields
            .insert("command".into(), Value::from(pending.req.command.clone()));
        tx.fields.insert(
            "command_class".into(),
            Value::from(classify(&pending.req.command)),
        );
        tx
    }
}

impl Drop for MemcacheUdpPlugin {
    fn drop(&mut self) {
        // Requests still pending at teardown are dropped, counted
        let leftover = self.pending.len() as u64;
        if leftover > 0 {
            self.emitter
                .counters()
                .memcache
                .timeouts
                .fetch_add(leftover, std::sync::atomic::Ordering::Relaxed);
        }
    }
}

impl UdpProtocol for MemcacheUdpPlugin {
    fn id(&self) -> ProtocolId {
        ProtocolId::Memcache
    }

    fn parse_udp(&mut self, pkt: &Packet, flow: &BoundFlow) {
        let Some((request_id, body)) = parse_udp_header(&pkt.payload) else {
            bump(&self.emitter.counters().memcache.parse_errors);
            return;
        };

        let is_request = pkt.src() == flow.client;
        let token = (flow.key, request_id);
        let max = if self.cfg.maxbytespervalue == 0 {
            usize::MAX
        } else {
            self.cfg.maxbytespervalue
        };

        if is_request {
            match text::parse_request(body) {
                TextParse::Done(req, _) => {
                    if req.noreply {
                        let pending = PendingUdp {
                            req,
                            ts: pkt.ts,
                            client: Endpoint::new(pkt.src_ip, pkt.src_port),
                            server: Endpoint::new(pkt.dst_ip, pkt.dst_port),
                        };
                        self.emitter.emit(self.tx_for(&pending));
                        return;
                    }
                    if self.pending.len() >= MAX_PENDING {
                        if let Some((_, token)) = self.order.pop_front() {
                            if let Some(evicted) = self.pending.remove(&token) {
                                bump(&self.emitter.counters().memcache.overflows);
                                let mut tx = self.tx_for(&evicted);
                                tx.status = Status::Error;
                                tx.note("dropped (overflow)");
                                self.emitter.emit(tx);
                            }
                        }
                    }
                    self.order.push_back((pkt.ts, token));
                    self.pending.insert(
                        token,
                        PendingUdp {
                            req,
                            ts: pkt.ts,
                            client: Endpoint::new(pkt.src_ip, pkt.src_port),
                            server: Endpoint::new(pkt.dst_ip, pkt.dst_port),
                        },
                    );
                }
                _ => bump(&self.emitter.counters().memcache.parse_errors),
            }
        } else {
            match text::parse_response(body, max) {
                TextParse::Done(resp, _) => match self.pending.remove(&token) {
                    Some(pending) => {
                        let mut tx = self.tx_for(&pending);
                        tx.ts_response = Some(pkt.ts);
                        tx.bytes_out = resp.size;
                        tx.fields
                            .insert("status".into(), Value::from(resp.status.clone()));
                        if resp.error.is_some() {
                            tx.status = Status::Error;
                        }
                        self.emitter.emit(tx);
                    }
                    None => bump(&self.emitter.counters().memcache.parse_errors),
                },
                _ => bump(&self.emitter.counters().memcache.parse_errors),
            }
        }
    }

    fn tick(&mut self, now: DateTime<Utc>) {
        let timeout = chrono::Duration::milliseconds(self.cfg.transaction_timeout_ms as i64);
        while let Some(&(ts, token)) = self.order.front() {
            if now - ts <= timeout {
                break;
            }
            self.order.pop_front();
            if let Some(pending) = self.pending.remove(&token) {
                bump(&self.emitter.counters().memcache.timeouts);
                let mut tx = self.tx_for(&pending);
                tx.status = Status::Error;
                tx.note("no response");
                self.emitter.emit(tx);
            }
        }
    }
}
