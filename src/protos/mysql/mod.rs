//! MySQL analyzer
//!
//! One command is outstanding per connection at a time; a transaction is
//! the command plus its full response (OK, ERR, or a complete result
//! set). Handshake and authentication traffic is consumed silently.

pub mod parser;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;

use crate::config::MysqlConfig;
use crate::core::Direction;
use crate::counters::bump;
use crate::flow::BoundFlow;
use crate::publish::{Endpoint, Status};
use crate::tcp::StreamBuffer;
use super::{ParseResult, ParserState, ProtocolId, TcpProtocol, Transaction, TxEmitter};
use parser::*;

/// The command awaiting its response
struct MysqlRequest {
    cmd: u8,
    query: Option<String>,
    stmt_id: Option<u32>,
    ts: DateTime<Utc>,
    size: u64,
    raw: Option<Vec<u8>>,
}

/// Progress through a multi-packet response
enum ResponsePhase {
    /// Waiting for the first response packet
    Start,
    /// Consuming a result set: column defs, then rows, EOF-terminated
    ResultSet {
        columns: u64,
        eofs_seen: u8,
        rows: u64,
        bytes: u64,
    },
    /// Consuming a prepare response's definition packets
    PrepareDefs {
        packets_left: u32,
        bytes: u64,
    },
}

/// Per-flow MySQL state
struct MysqlFlowState {
    pending: Option<MysqlRequest>,
    phase: ResponsePhase,
    fin_server: bool,
    fin_client: bool,
}

impl Default for MysqlFlowState {
    fn default() -> Self {
        Self {
            pending: None,
            phase: ResponsePhase::Start,
            fin_server: false,
            fin_client: false,
        }
    }
}

/// The MySQL protocol plugin
pub struct MysqlPlugin {
    cfg: MysqlConfig,
    emitter: TxEmitter,
}

impl MysqlPlugin {
    pub fn new(cfg: MysqlConfig, emitter: TxEmitter) -> Self {
        Self { cfg, emitter }
    }

    fn base_tx(&self, flow: &BoundFlow, request: &MysqlRequest) -> Transaction {
        let client = Endpoint::new(flow.client.ip(), flow.client.port());
        let server = Endpoint::new(flow.server().ip(), flow.server().port());
        let mut tx = Transaction::new(ProtocolId::Mysql, request.ts, client, server);

        match request.cmd {
            COM_QUERY => {
                let query = request.query.clone().unwrap_or_default();
                tx.method = Some(query_method(&query));
                tx.query = Some(query);
            }
            COM_STMT_PREPARE => {
                let query = request.query.clone().unwrap_or_default();
                tx.method = Some("STMT_PREPARE".into());
                tx.query = Some(query);
            }
            COM_STMT_EXECUTE => {
                tx.method = Some("STMT_EXECUTE".into());
                if let Some(id) = request.stmt_id {
                    tx.fields.insert("stmt_id".into(), Value::from(id));
                }
            }
            other => {
                tx.method = Some(format!("COM_{:#04x}", other));
            }
        }
        tx.bytes_in = request.size;
        tx.request_raw = request.raw.clone();
        tx
    }

    fn emit_complete(
        &self,
        flow: &BoundFlow,
        request: MysqlRequest,
        ts_end: DateTime<Utc>,
        bytes_out: u64,
        outcome: ResponseOutcome,
    ) {
        // Only the commands of interest become records
        if !matches!(request.cmd, COM_QUERY | COM_STMT_PREPARE | COM_STMT_EXECUTE) {
            return;
        }
        let mut tx = self.base_tx(flow, &request);
        tx.ts_response = Some(ts_end);
        tx.bytes_out = bytes_out;

        match outcome {
            ResponseOutcome::Ok(ok) => {
                tx.fields.insert("iserror".into(), Value::from(false));
                tx.fields
                    .insert("affected_rows".into(), Value::from(ok.affected_rows));
                tx.fields.insert("insert_id".into(), Value::from(ok.insert_id));
            }
            ResponseOutcome::Err(err) => {
                tx.status = Status::Error;
                tx.fields.insert("iserror".into(), Value::from(true));
                tx.fields.insert("error_code".into(), Value::from(err.code));
                tx.fields
                    .insert("error_message".into(), Value::from(err.message));
            }
            ResponseOutcome::ResultSet { columns, rows } => {
                tx.fields.insert("iserror".into(), Value::from(false));
                tx.fields.insert("num_fields".into(), Value::from(columns));
                tx.fields.insert("num_rows".into(), Value::from(rows));
            }
        }

        self.emitter.emit(tx);
    }

    fn emit_unanswered(&self, flow: &BoundFlow, request: MysqlRequest) {
        if !matches!(request.cmd, COM_QUERY | COM_STMT_PREPARE | COM_STMT_EXECUTE) {
            return;
        }
        bump(&self.emitter.counters().mysql.timeouts);
        let mut tx = self.base_tx(flow, &request);
        tx.status = Status::Error;
        tx.note("no response");
        self.emitter.emit(tx);
    }
}

enum ResponseOutcome {
    Ok(OkPacket),
    Err(ErrPacket),
    ResultSet { columns: u64, rows: u64 },
}

impl TcpProtocol for MysqlPlugin {
    fn id(&self) -> ProtocolId {
        ProtocolId::Mysql
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
        let st = state.get_or_insert_with(MysqlFlowState::default);

        loop {
            let Some(frame) = read_frame(stream.as_slice()) else {
                if stream.len() > self.cfg.max_message_size {
                    bump(&self.emitter.counters().mysql.parse_errors);
                    return ParseResult::Drop;
                }
                return ParseResult::NeedMore;
            };
            stream.advance(frame.wire_len);

            match dir {
                Direction::ToServer => {
                    // Commands start a fresh sequence; anything else is
                    // handshake or auth payload
                    if frame.seq != 0 || frame.payload.is_empty() {
                        continue;
                    }
                    let cmd = frame.payload[0];
                    if cmd == COM_QUIT {
                        continue;
                    }
                    if let Some(prev) = st.pending.take() {
                        self.emit_unanswered(flow, prev);
                    }
                    let query = matches!(cmd, COM_QUERY | COM_STMT_PREPARE)
                        .then(|| String::from_utf8_lossy(&frame.payload[1..]).into_owned());
                    let stmt_id = (cmd == COM_STMT_EXECUTE && frame.payload.len() >= 5)
                        .then(|| {
                            u32::from_le_bytes([
                                frame.payload[1],
                                frame.payload[2],
                                frame.payload[3],
                                frame.payload[4],
                            ])
                        });
                    let raw = self.cfg.send_request.then(|| frame.payload.clone());
                    st.pending = Some(MysqlRequest {
                        cmd,
                        query,
                        stmt_id,
                        ts,
                        size: frame.wire_len as u64,
                        raw,
                    });
                    st.phase = ResponsePhase::Start;
                }
                Direction::ToClient => {
                    let Some(pending) = &st.pending else {
                        // Greeting or auth phase
                        continue;
                    };
                    let payload = &frame.payload;
                    match &mut st.phase {
                        ResponsePhase::Start => {
                            let first = payload.first().copied().unwrap_or(0xff);
                            if first == 0x00 && pending.cmd == COM_STMT_PREPARE {
                                // Prepare OK header, then param/column defs
                                if payload.len() < 12 {
                                    bump(&self.emitter.counters().mysql.parse_errors);
                                    return ParseResult::Drop;
                                }
                                let num_columns =
                                    u16::from_le_bytes([payload[5], payload[6]]) as u32;
                                let num_params =
                                    u16::from_le_bytes([payload[7], payload[8]]) as u32;
                                let mut defs = num_columns + num_params;
                                if num_columns > 0 {
                                    defs += 1; // EOF after column defs
                                }
                                if num_params > 0 {
                                    defs += 1; // EOF after param defs
                                }
                                if defs == 0 {
                                    let request = st.pending.take().expect("pending checked");
                                    self.emit_complete(
                                        flow,
                                        request,
                                        ts,
                                        frame.wire_len as u64,
                                        ResponseOutcome::Ok(OkPacket::default()),
                                    );
                                    st.phase = ResponsePhase::Start;
                                } else {
                                    st.phase = ResponsePhase::PrepareDefs {
                                        packets_left: defs,
                                        bytes: frame.wire_len as u64,
                                    };
                                }
                            } else if first == 0x00 {
                                let Some(ok) = parse_ok(payload) else {
                                    bump(&self.emitter.counters().mysql.parse_errors);
                                    return ParseResult::Drop;
                                };
                                let request = st.pending.take().expect("pending checked");
                                self.emit_complete(
                                    flow,
                                    request,
                                    ts,
                                    frame.wire_len as u64,
                                    ResponseOutcome::Ok(ok),
                                );
                            } else if first == 0xff {
                                let Some(err) = parse_err(payload) else {
                                    bump(&self.emitter.counters().mysql.parse_errors);
                                    return ParseResult::Drop;
                                };
                                let request = st.pending.take().expect("pending checked");
                                self.emit_complete(
                                    flow,
                                    request,
                                    ts,
                                    frame.wire_len as u64,
                                    ResponseOutcome::Err(err),
                                );
                            } else {
                                // Column count opens a result set
                                let Some((columns, _)) = read_lenc_int(payload) else {
                                    bump(&self.emitter.counters().mysql.parse_errors);
                                    return ParseResult::Drop;
                                };
                                st.phase = ResponsePhase::ResultSet {
                                    columns,
                                    eofs_seen: 0,
                                    rows: 0,
                                    bytes: frame.wire_len as u64,
                                };
                            }
                        }
                        ResponsePhase::ResultSet {
                            columns,
                            eofs_seen,
                            rows,
                            bytes,
                        } => {
                            *bytes += frame.wire_len as u64;
                            if payload.first() == Some(&0xff) {
                                let err = parse_err(payload).unwrap_or(ErrPacket {
                                    code: 0,
                                    message: "malformed ERR packet".into(),
                                });
                                let total = *bytes;
                                let request = st.pending.take().expect("pending checked");
                                self.emit_complete(
                                    flow,
                                    request,
                                    ts,
                                    total,
                                    ResponseOutcome::Err(err),
                                );
                                st.phase = ResponsePhase::Start;
                            } else if is_eof(payload) {
                                *eofs_seen += 1;
                                if *eofs_seen == 2 {
                                    let outcome = ResponseOutcome::ResultSet {
                                        columns: *columns,
                                        rows: *rows,
                                    };
                                    let bytes = *bytes;
                                    let request = st.pending.take().expect("pending checked");
                                    self.emit_complete(flow, request, ts, bytes, outcome);
                                    st.phase = ResponsePhase::Start;
                                }
                            } else if *eofs_seen == 1 {
                                *rows += 1;
                            }
                            // else: a column definition packet
                        }
                        ResponsePhase::PrepareDefs { packets_left, bytes } => {
                            *bytes += frame.wire_len as u64;
                            *packets_left -= 1;
                            if *packets_left == 0 {
                                let bytes = *bytes;
                                let request = st.pending.take().expect("pending checked");
                                self.emit_complete(
                                    flow,
                                    request,
                                    ts,
                                    bytes,
                                    ResponseOutcome::Ok(OkPacket::default()),
                                );
                                st.phase = ResponsePhase::Start;
                            }
                        }
                    }
                }
            }
        }
    }

    fn fin(&mut self, flow: &BoundFlow, dir: Direction, state: &mut ParserState) {
        let Some(st) = state.get_mut::<MysqlFlowState>() else {
            return;
        };
        match dir {
            Direction::ToServer => st.fin_server = true,
            Direction::ToClient => st.fin_client = true,
        }
        if st.fin_server && st.fin_client {
            if let Some(request) = st.pending.take() {
                self.emit_unanswered(flow, request);
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
        // Frame lengths are gone with the lost bytes; the stream cannot
        // be trusted afterwards
        debug!("dropping mysql flow {} after {} lost bytes", flow.key, nbytes);
        true
    }
}
