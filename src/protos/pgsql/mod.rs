//! PostgreSQL analyzer
//!
//! Tracks the simple (`Q`) and extended (`P`/`B`/`E`) query protocols. A
//! transaction closes on ReadyForQuery; an ErrorResponse before it marks
//! the transaction failed. Startup and authentication phases are consumed
//! without emitting records; SSL-upgraded sessions are dropped since the
//! stream becomes opaque.

pub mod parser;

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;

use crate::config::PgsqlConfig;
use crate::core::Direction;
use crate::counters::bump;
use crate::flow::BoundFlow;
use crate::publish::{Endpoint, Status};
use crate::tcp::StreamBuffer;
use super::{ParseResult, ParserState, ProtocolId, TcpProtocol, Transaction, TxEmitter};
use parser::*;

/// Bound on pipelined extended-protocol queries per flow
const MAX_PENDING: usize = 256;

struct PgRequest {
    query: String,
    ts: DateTime<Utc>,
    size: u64,
    raw: Option<Vec<u8>>,
}

/// Accumulated response state until ReadyForQuery
#[derive(Default)]
struct RespAccum {
    num_fields: Option<u16>,
    num_rows: u64,
    command_tag: Option<String>,
    error: Option<PgError>,
    bytes: u64,
    ts_last: Option<DateTime<Utc>>,
}

/// Per-flow PostgreSQL state
#[derive(Default)]
struct PgsqlFlowState {
    startup_done: bool,
    ssl_requested: bool,
    pending: VecDeque<PgRequest>,
    resp: RespAccum,
    fin_server: bool,
    fin_client: bool,
}

/// The PostgreSQL protocol plugin
pub struct PgsqlPlugin {
    cfg: PgsqlConfig,
    emitter: TxEmitter,
}

impl PgsqlPlugin {
    pub fn new(cfg: PgsqlConfig, emitter: TxEmitter) -> Self {
        Self { cfg, emitter }
    }

    fn emit(&self, flow: &BoundFlow, request: PgRequest, resp: Option<RespAccum>) {
        let client = Endpoint::new(flow.client.ip(), flow.client.port());
        let server = Endpoint::new(flow.server().ip(), flow.server().port());
        let mut tx = Transaction::new(ProtocolId::Pgsql, request.ts, client, server);

        tx.method = Some(parser_method(&request.query));
        tx.query = Some(request.query.clone());
        tx.bytes_in = request.size;
        tx.request_raw = request.raw;

        match resp {
            Some(resp) => {
                tx.ts_response = resp.ts_last;
                tx.bytes_out = resp.bytes;
                match resp.error {
                    Some(err) => {
                        tx.status = Status::Error;
                        tx.fields.insert("iserror".into(), Value::from(true));
                        tx.fields
                            .insert("error_code".into(), Value::from(err.code));
                        tx.fields
                            .insert("error_message".into(), Value::from(err.message));
                        tx.fields
                            .insert("error_severity".into(), Value::from(err.severity));
                    }
                    None => {
                        tx.fields.insert("iserror".into(), Value::from(false));
                        if let Some(fields) = resp.num_fields {
                            tx.fields.insert("num_fields".into(), Value::from(fields));
                            tx.fields.insert("num_rows".into(), Value::from(resp.num_rows));
                        }
                        if let Some(tag) = resp.command_tag {
                            tx.fields.insert("command_tag".into(), Value::from(tag));
                        }
                    }
                }
            }
            None => {
                tx.status = Status::Error;
                tx.note("no response");
            }
        }

        self.emitter.emit(tx);
    }
}

/// First keyword of the query, uppercased
fn parser_method(query: &str) -> String {
    query
        .trim_start()
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_uppercase()
}

impl TcpProtocol for PgsqlPlugin {
    fn id(&self) -> ProtocolId {
        ProtocolId::Pgsql
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
        let st = state.get_or_insert_with(PgsqlFlowState::default);

        loop {
            if stream.is_empty() {
                return ParseResult::NeedMore;
            }

            // Startup phase: length-framed messages without a type byte
            if dir == Direction::ToServer && !st.startup_done {
                let Some((code, len)) = read_startup(stream.as_slice()) else {
                    if stream.len() > 8 {
                        bump(&self.emitter.counters().pgsql.parse_errors);
                        return ParseResult::Drop;
                    }
                    return ParseResult::NeedMore;
                };
                stream.advance(len);
                match code {
                    SSL_REQUEST => {
                        // The stream turns into TLS we cannot read
                        st.ssl_requested = true;
                        debug!("pgsql flow {} requested SSL, dropping", flow.key);
                        return ParseResult::Drop;
                    }
                    CANCEL_REQUEST => continue,
                    PROTO_V3 => {
                        st.startup_done = true;
                        continue;
                    }
                    other => {
                        debug!("pgsql unknown startup code {:#x} on {}", other, flow.key);
                        bump(&self.emitter.counters().pgsql.parse_errors);
                        return ParseResult::Drop;
                    }
                }
            }

            let Some(msg) = read_message(stream.as_slice()) else {
                if stream.len() > self.cfg.max_message_size {
                    bump(&self.emitter.counters().pgsql.parse_errors);
                    return ParseResult::Drop;
                }
                return ParseResult::NeedMore;
            };
            stream.advance(msg.wire_len);

            match dir {
                Direction::ToServer => match msg.mtype {
                    b'Q' | b'P' => {
                        let query = if msg.mtype == b'Q' {
                            match read_cstring(&msg.payload) {
                                Some((q, _)) => q,
                                None => {
                                    bump(&self.emitter.counters().pgsql.parse_errors);
                                    return ParseResult::Drop;
                                }
                            }
                        } else {
                            // Parse: statement name, then the query text
                            let Some((_stmt, used)) = read_cstring(&msg.payload) else {
                                bump(&self.emitter.counters().pgsql.parse_errors);
                                return ParseResult::Drop;
                            };
                            match read_cstring(&msg.payload[used..]) {
                                Some((q, _)) => q,
                                None => {
                                    bump(&self.emitter.counters().pgsql.parse_errors);
                                    return ParseResult::Drop;
                                }
                            }
                        };
                        if st.pending.len() >= MAX_PENDING {
                            bump(&self.emitter.counters().pgsql.overflows);
                            if let Some(mut evicted) = st.pending.pop_front() {
                                evicted.raw = None;
                                self.emit_overflow(flow, evicted);
                            }
                        }
                        let raw = self
                            .cfg
                            .send_request
                            .then(|| query.clone().into_bytes());
                        st.pending.push_back(PgRequest {
                            query,
                            ts,
                            size: msg.wire_len as u64,
                            raw,
                        });
                    }
                    // Bind, Execute, Describe, Sync, Flush extend the
                    // current extended-protocol request
                    b'B' | b'E' | b'D' | b'S' | b'H' | b'C' => {
                        if let Some(req) = st.pending.back_mut() {
                            req.size += msg.wire_len as u64;
                        }
                    }
                    b'X' => continue, // Terminate
                    _ => continue,
                },
                Direction::ToClient => {
                    st.resp.bytes += msg.wire_len as u64;
                    st.resp.ts_last = Some(ts);
                    match msg.mtype {
                        b'T' => {
                            if msg.payload.len() >= 2 {
                                st.resp.num_fields = Some(u16::from_be_bytes([
                                    msg.payload[0],
                                    msg.payload[1],
                                ]));
                            }
                        }
                        b'D' => st.resp.num_rows += 1,
                        b'C' => {
                            st.resp.command_tag =
                                read_cstring(&msg.payload).map(|(tag, _)| tag);
                        }
                        b'E' => {
                            st.resp.error = Some(parse_error_fields(&msg.payload));
                        }
                        b'Z' => {
                            let resp = std::mem::take(&mut st.resp);
                            match st.pending.pop_front() {
                                Some(request) => self.emit(flow, request, Some(resp)),
                                // ReadyForQuery after auth carries no txn
                                None => {}
                            }
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    fn fin(&mut self, flow: &BoundFlow, dir: Direction, state: &mut ParserState) {
        let Some(st) = state.get_mut::<PgsqlFlowState>() else {
            return;
        };
        match dir {
            Direction::ToServer => st.fin_server = true,
            Direction::ToClient => st.fin_client = true,
        }
        if st.fin_server && st.fin_client {
            while let Some(request) = st.pending.pop_front() {
                bump(&self.emitter.counters().pgsql.timeouts);
                self.emit(flow, request, None);
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
        debug!("dropping pgsql flow {} after {} lost bytes", flow.key, nbytes);
        true
    }
}

impl PgsqlPlugin {
    fn emit_overflow(&self, flow: &BoundFlow, request: PgRequest) {
        let client = Endpoint::new(flow.client.ip(), flow.client.port());
        let server = Endpoint::new(flow.server().ip(), flow.server().port());
        let mut tx = Transaction::new(ProtocolId::Pgsql, request.ts, client, server);
        tx.method = Some(parser_method(&request.query));
        tx.query = Some(request.query);
        tx.bytes_in = request.size;
        tx.status = Status::Error;
        tx.note("dropped (overflow)");
        self.emitter.emit(tx);
    }
}
