//! Thrift-RPC analyzer
//!
//! Pairs Call messages with their Reply or Exception by sequence id
//! within a flow. Oneway calls publish immediately. Without IDL files,
//! arguments and exceptions are rendered by field id.

pub mod parser;

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;

use crate::config::ThriftConfig;
use crate::core::Direction;
use crate::counters::bump;
use crate::flow::BoundFlow;
use crate::publish::{Endpoint, Status};
use crate::tcp::StreamBuffer;
use super::{ParseResult, ParserState, ProtocolId, TcpProtocol, Transaction, TxEmitter};
use parser::{Limits, MessageType, ThriftMessage, ThriftParse};

/// Bound on outstanding calls per flow
const MAX_PENDING: usize = 256;

struct PendingCall {
    msg: ThriftMessage,
    ts: DateTime<Utc>,
}

#[derive(Default)]
struct ThriftFlowState {
    pending: HashMap<i32, PendingCall>,
    order: VecDeque<i32>,
    fin_server: bool,
    fin_client: bool,
}

/// The Thrift protocol plugin
pub struct ThriftPlugin {
    cfg: ThriftConfig,
    emitter: TxEmitter,
}

impl ThriftPlugin {
    pub fn new(cfg: ThriftConfig, emitter: TxEmitter) -> Self {
        if !cfg.idl_files.is_empty() {
            // Field naming from IDL is optional and not wired in yet;
            // field ids are always available
            debug!("thrift idl_files configured but IDL naming is unavailable");
        }
        Self { cfg, emitter }
    }

    fn limits(&self) -> Limits {
        Limits {
            string_max: self.cfg.string_max_size,
            collection_max: self.cfg.collection_max_size,
        }
    }

    fn base_tx(&self, flow: &BoundFlow, call: &PendingCall) -> Transaction {
        let client = Endpoint::new(flow.client.ip(), flow.client.port());
        let server = Endpoint::new(flow.server().ip(), flow.server().port());
        let mut tx = Transaction::new(ProtocolId::Thrift, call.ts, client, server);
        tx.method = Some(call.msg.name.clone());
        tx.path = call.msg.name.clone();
        tx.bytes_in = call.msg.size;
        if let Some(params) = &call.msg.params {
            tx.query = Some(format!("{}{}", call.msg.name, params));
            tx.fields.insert("params".into(), Value::from(params.clone()));
        }
        tx.fields.insert("seqid".into(), Value::from(call.msg.seqid));
        tx
    }

    fn emit_pair(&self, flow: &BoundFlow, call: PendingCall, reply: &ThriftMessage, ts: DateTime<Utc>) {
        let mut tx = self.base_tx(flow, &call);
        tx.ts_response = Some(ts);
        tx.bytes_out = reply.size;
        tx.fields
            .insert("message_type".into(), Value::from(reply.mtype.as_str()));
        if let Some(ret) = &reply.returns {
            tx.fields.insert("return_value".into(), Value::from(ret.clone()));
        }
        if let Some(exceptions) = &reply.exceptions {
            tx.status = Status::Error;
            tx.fields
                .insert("exceptions".into(), Value::from(exceptions.clone()));
        }
        self.emitter.emit(tx);
    }

    fn emit_oneway(&self, flow: &BoundFlow, call: PendingCall) {
        let mut tx = self.base_tx(flow, &call);
        tx.fields
            .insert("message_type".into(), Value::from("oneway"));
        self.emitter.emit(tx);
    }

    fn emit_unanswered(&self, flow: &BoundFlow, call: PendingCall) {
        bump(&self.emitter.counters().thrift.timeouts);
        let mut tx = self.base_tx(flow, &call);
        tx.status = Status::Error;
        tx.note("no response");
        self.emitter.emit(tx);
    }
}

impl TcpProtocol for ThriftPlugin {
    fn id(&self) -> ProtocolId {
        ProtocolId::Thrift
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
        let st = state.get_or_insert_with(ThriftFlowState::default);
        let limits = self.limits();

        loop {
            if stream.is_empty() {
                return ParseResult::NeedMore;
            }
            let msg = match parser::parse_message(
                stream.as_slice(),
                limits,
                self.cfg.max_message_size,
            ) {
                ThriftParse::NeedMore => {
                    if stream.len() > self.cfg.max_message_size {
                        bump(&self.emitter.counters().thrift.parse_errors);
                        return ParseResult::Drop;
                    }
                    return ParseResult::NeedMore;
                }
                ThriftParse::Error(e) => {
                    debug!("thrift parse error on {}: {}", flow.key, e);
                    bump(&self.emitter.counters().thrift.parse_errors);
                    return ParseResult::Drop;
                }
                ThriftParse::Done(msg, used) => {
                    stream.advance(used);
                    msg
                }
            };

            match (dir, msg.mtype) {
                (Direction::ToServer, MessageType::Oneway) => {
                    self.emit_oneway(flow, PendingCall { msg, ts });
                }
                (Direction::ToServer, MessageType::Call) => {
                    if st.pending.len() >= MAX_PENDING {
                        bump(&self.emitter.counters().thrift.overflows);
                        if let Some(oldest) = st.order.pop_front() {
                            if let Some(evicted) = st.pending.remove(&oldest) {
                                let mut tx = self.base_tx(flow, &evicted);
                                tx.status = Status::Error;
                                tx.note("dropped (overflow)");
                                self.emitter.emit(tx);
                            }
                        }
                    }
                    st.order.push_back(msg.seqid);
                    st.pending.insert(msg.seqid, PendingCall { msg, ts });
                }
                (Direction::ToClient, MessageType::Reply | MessageType::Exception) => {
                    match st.pending.remove(&msg.seqid) {
                        Some(call) => {
                            st.order.retain(|&id| id != msg.seqid);
                            self.emit_pair(flow, call, &msg, ts);
                        }
                        None => {
                            debug!(
                                "thrift reply for unknown seqid {} on {}",
                                msg.seqid, flow.key
                            );
                            bump(&self.emitter.counters().thrift.parse_errors);
                        }
                    }
                }
                (d, t) => {
                    debug!(
                        "thrift unexpected {} message in direction {:?} on {}",
                        t.as_str(),
                        d,
                        flow.key
                    );
                }
            }
        }
    }

    fn fin(&mut self, flow: &BoundFlow, dir: Direction, state: &mut ParserState) {
        let Some(st) = state.get_mut::<ThriftFlowState>() else {
            return;
        };
        match dir {
            Direction::ToServer => st.fin_server = true,
            Direction::ToClient => st.fin_client = true,
        }
        if st.fin_server && st.fin_client {
            while let Some(id) = st.order.pop_front() {
                if let Some(call) = st.pending.remove(&id) {
                    self.emit_unanswered(flow, call);
                }
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
        debug!("dropping thrift flow {} after {} lost bytes", flow.key, nbytes);
        true
    }
}
