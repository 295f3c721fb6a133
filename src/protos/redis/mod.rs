//! Redis analyzer
//!
//! RESP request/response pairing is FIFO within a flow; pipelined
//! commands are answered strictly in order. An error reply (`-`) marks
//! the transaction as failed with `redis.error` populated.

pub mod parser;

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;

use crate::config::RedisConfig;
use crate::core::Direction;
use crate::counters::bump;
use crate::flow::BoundFlow;
use crate::publish::{Endpoint, Status};
use crate::tcp::StreamBuffer;
use super::{ParseResult, ParserState, ProtocolId, TcpProtocol, Transaction, TxEmitter};
use parser::{parse_value, RespValue};

/// Bound on unanswered pipelined commands per flow
const MAX_PENDING: usize = 1024;

/// Rendered value length cap in records
const RENDER_MAX: usize = 256;

struct RedisRequest {
    command: Vec<String>,
    ts: DateTime<Utc>,
    size: u64,
    raw: Option<Vec<u8>>,
}

/// Per-flow Redis state
#[derive(Default)]
struct RedisFlowState {
    pending: VecDeque<RedisRequest>,
    fin_server: bool,
    fin_client: bool,
}

/// The Redis protocol plugin
pub struct RedisPlugin {
    cfg: RedisConfig,
    emitter: TxEmitter,
}

impl RedisPlugin {
    pub fn new(cfg: RedisConfig, emitter: TxEmitter) -> Self {
        Self { cfg, emitter }
    }

    fn emit(&self, flow: &BoundFlow, request: RedisRequest, response: Option<(RespValue, DateTime<Utc>, u64, Option<Vec<u8>>)>) {
        let client = Endpoint::new(flow.client.ip(), flow.client.port());
        let server = Endpoint::new(flow.server().ip(), flow.server().port());
        let mut tx = Transaction::new(ProtocolId::Redis, request.ts, client, server);

        let method = request
            .command
            .first()
            .map(|c| c.to_uppercase())
            .unwrap_or_default();
        tx.method = Some(method.clone());
        tx.path = request.command.get(1).cloned().unwrap_or_default();
        tx.query = Some(request.command.join(" "));
        tx.bytes_in = request.size;
        tx.request_raw = request.raw;
        tx.fields.insert("method".into(), Value::from(method));

        match response {
            Some((value, ts_end, size, raw)) => {
                tx.ts_response = Some(ts_end);
                tx.bytes_out = size;
                tx.response_raw = raw;
                if let RespValue::Error(err) = &value {
                    tx.status = Status::Error;
                    tx.fields.insert("error".into(), Value::from(err.clone()));
                } else {
                    tx.fields
                        .insert("return_value".into(), Value::from(value.render(RENDER_MAX)));
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

impl TcpProtocol for RedisPlugin {
    fn id(&self) -> ProtocolId {
        ProtocolId::Redis
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
        let st = state.get_or_insert_with(RedisFlowState::default);

        loop {
            if stream.is_empty() {
                return ParseResult::NeedMore;
            }
            if stream.len() > self.cfg.max_message_size {
                bump(&self.emitter.counters().redis.parse_errors);
                return ParseResult::Drop;
            }

            let allow_inline = dir == Direction::ToServer;
            let parsed = match parse_value(stream.as_slice(), allow_inline) {
                Ok(Some(parsed)) => parsed,
                Ok(None) => return ParseResult::NeedMore,
                Err(e) => {
                    debug!("redis parse error on {}: {}", flow.key, e);
                    bump(&self.emitter.counters().redis.parse_errors);
                    return ParseResult::Drop;
                }
            };
            let (value, used) = parsed;
            let raw = if (dir == Direction::ToServer && self.cfg.send_request)
                || (dir == Direction::ToClient && self.cfg.send_response)
            {
                Some(stream.peek(used).expect("parsed within window").to_vec())
            } else {
                None
            };
            stream.advance(used);

            match dir {
                Direction::ToServer => {
                    let Some(command) = value.as_command() else {
                        debug!("redis request is not a command on {}", flow.key);
                        bump(&self.emitter.counters().redis.parse_errors);
                        return ParseResult::Drop;
                    };
                    if st.pending.len() >= MAX_PENDING {
                        bump(&self.emitter.counters().redis.overflows);
                        if let Some(evicted) = st.pending.pop_front() {
                            self.emit_overflow(flow, evicted);
                        }
                    }
                    st.pending.push_back(RedisRequest {
                        command,
                        ts,
                        size: used as u64,
                        raw,
                    });
                }
                Direction::ToClient => match st.pending.pop_front() {
                    Some(request) => {
                        self.emit(flow, request, Some((value, ts, used as u64, raw)));
                    }
                    None => {
                        debug!("redis reply without pending command on {}", flow.key);
                        bump(&self.emitter.counters().redis.parse_errors);
                    }
                },
            }
        }
    }

    fn fin(&mut self, flow: &BoundFlow, dir: Direction, state: &mut ParserState) {
        let Some(st) = state.get_mut::<RedisFlowState>() else {
            return;
        };
        match dir {
            Direction::ToServer => st.fin_server = true,
            Direction::ToClient => st.fin_client = true,
        }
        if st.fin_server && st.fin_client {
            while let Some(request) = st.pending.pop_front() {
                bump(&self.emitter.counters().redis.timeouts);
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
        // RESP framing cannot resync mid-stream
        debug!("dropping redis flow {} after {} lost bytes", flow.key, nbytes);
        true
    }
}

impl RedisPlugin {
    fn emit_overflow(&self, flow: &BoundFlow, mut request: RedisRequest) {
        request.raw = None;
        let client = Endpoint::new(flow.client.ip(), flow.client.port());
        let server = Endpoint::new(flow.server().ip(), flow.server().port());
        let mut tx = Transaction::new(ProtocolId::Redis, request.ts, client, server);
        tx.method = request.command.first().map(|c| c.to_uppercase());
        tx.path = request.command.get(1).cloned().unwrap_or_default();
        tx.query = Some(request.command.join(" "));
        tx.bytes_in = request.size;
        tx.status = Status::Error;
        tx.note("dropped (overflow)");
        self.emitter.emit(tx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OutputSettings;
    use crate::counters::Counters;
    use crate::flow::FlowKey;
    use crate::publish::{CollectorSink, PublisherThread, Record};
    use chrono::TimeZone;
    use std::net::SocketAddr;
    use std::sync::Arc;

    fn flow() -> BoundFlow {
        let client: SocketAddr = "192.168.1.5:40000".parse().unwrap();
        let server: SocketAddr = "10.0.0.1:6379".parse().unwrap();
        BoundFlow::new(FlowKey::new(client, server), client)
    }

    fn ts(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    struct Harness {
        plugin: RedisPlugin,
        publisher: Option<PublisherThread>,
        sink: CollectorSink,
        state: ParserState,
        req: StreamBuffer,
        resp: StreamBuffer,
    }

    impl Harness {
        fn new(cfg: RedisConfig) -> Self {
            let sink = CollectorSink::new();
            let counters = Arc::new(Counters::default());
            let publisher = PublisherThread::spawn(
                Box::new(sink.clone()),
                &OutputSettings::default(),
                counters.clone(),
            );
            let emitter = TxEmitter::new(
                ProtocolId::Redis,
                publisher.handle(),
                counters,
                Arc::new(Vec::new()),
                cfg.send_request,
                cfg.send_response,
            );
            Self {
                plugin: RedisPlugin::new(cfg, emitter),
                publisher: Some(publisher),
                sink,
                state: ParserState::new(),
                req: StreamBuffer::new(65536),
                resp: StreamBuffer::new(65536),
            }
        }

        fn feed(&mut self, dir: Direction, at_ms: i64, bytes: &[u8]) -> ParseResult {
            let stream = match dir {
                Direction::ToServer => &mut self.req,
                Direction::ToClient => &mut self.resp,
            };
            assert!(stream.append(bytes));
            self.plugin
                .parse(ts(at_ms), &flow(), dir, stream, &mut self.state)
        }

        fn records(mut self) -> Vec<Record> {
            self.publisher.take().unwrap().shutdown();
            self.sink.records()
        }
    }

    #[test]
    fn test_get_roundtrip() {
        let mut h = Harness::new(RedisConfig::default());
        h.feed(Direction::ToServer, 0, b"*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n");
        h.feed(Direction::ToClient, 2, b"$3\r\nbar\r\n");

        let records = h.records();
        assert_eq!(records.len(), 1);
        let rec = &records[0];
        assert_eq!(rec.type_, "redis");
        assert_eq!(rec.method.as_deref(), Some("GET"));
        assert_eq!(rec.path, "foo");
        assert_eq!(rec.query.as_deref(), Some("GET foo"));
        assert_eq!(rec.status, Status::Ok);
        assert_eq!(rec.fields["return_value"], "bar");
        assert_eq!(rec.responsetime, Some(2));
    }

    #[test]
    fn test_error_reply() {
        let mut h = Harness::new(RedisConfig::default());
        h.feed(Direction::ToServer, 0, b"*1\r\n$7\r\nFLUSHXY\r\n");
        h.feed(Direction::ToClient, 1, b"-ERR unknown command 'FLUSHXY'\r\n");

        let records = h.records();
        assert_eq!(records[0].status, Status::Error);
        assert_eq!(
            records[0].fields["error"],
            "ERR unknown command 'FLUSHXY'"
        );
    }

    #[test]
    fn test_pipelined_fifo() {
        let mut h = Harness::new(RedisConfig::default());
        h.feed(
            Direction::ToServer,
            0,
            b"*2\r\n$3\r\nGET\r\n$1\r\na\r\n*2\r\n$3\r\nGET\r\n$1\r\nb\r\n",
        );
        h.feed(Direction::ToClient, 1, b"$2\r\nv1\r\n$2\r\nv2\r\n");

        let records = h.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].path, "a");
        assert_eq!(records[0].fields["return_value"], "v1");
        assert_eq!(records[1].path, "b");
        assert_eq!(records[1].fields["return_value"], "v2");
    }

    #[test]
    fn test_split_bulk_reply() {
        let mut h = Harness::new(RedisConfig::default());
        h.feed(Direction::ToServer, 0, b"*2\r\n$3\r\nGET\r\n$1\r\nk\r\n");
        let r = h.feed(Direction::ToClient, 1, b"$10\r\nabcde");
        assert_eq!(r, ParseResult::NeedMore);
        h.feed(Direction::ToClient, 2, b"fghij\r\n");

        let records = h.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].fields["return_value"], "abcdefghij");
    }

    #[test]
    fn test_inline_ping() {
        let mut h = Harness::new(RedisConfig::default());
        h.feed(Direction::ToServer, 0, b"PING\r\n");
        h.feed(Direction::ToClient, 1, b"+PONG\r\n");

        let records = h.records();
        assert_eq!(records[0].method.as_deref(), Some("PING"));
        assert_eq!(records[0].fields["return_value"], "PONG");
    }

    #[test]
    fn test_close_flushes_pending() {
        let mut h = Harness::new(RedisConfig::default());
        h.feed(Direction::ToServer, 0, b"*2\r\n$3\r\nGET\r\n$1\r\nx\r\n");
        h.plugin.fin(&flow(), Direction::ToClient, &mut h.state);
        h.plugin.fin(&flow(), Direction::ToServer, &mut h.state);

        let records = h.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, Status::Error);
        assert!(records[0].notes.contains(&"no response".to_string()));
    }

    #[test]
    fn test_send_request_raw_roundtrip() {
        let cfg = RedisConfig {
            send_request: true,
            ..Default::default()
        };
        let mut h = Harness::new(cfg);
        let wire = b"*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n";
        h.feed(Direction::ToServer, 0, wire);
        h.feed(Direction::ToClient, 1, b"+OK\r\n");

        let records = h.records();
        assert_eq!(
            records[0].request.as_deref(),
            Some(std::str::from_utf8(wire).unwrap())
        );
    }
}
