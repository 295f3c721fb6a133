//! HTTP analyzer
//!
//! Reconstructs HTTP/1.x request/response pairs. Pipelined requests are
//! matched to responses FIFO within a flow, which is correct because the
//! reassembler never reorders across direction boundaries.

pub mod parser;

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;

use crate::config::HttpConfig;
use crate::core::Direction;
use crate::counters::bump;
use crate::flow::BoundFlow;
use crate::publish::{Endpoint, Status};
use crate::tcp::StreamBuffer;
use super::{ParseResult, ParserState, ProtocolId, TcpProtocol, Transaction, TxEmitter};
use parser::{Feed, HalfParser, HttpMessage};

/// Hard bound on unanswered pipelined requests per flow
const MAX_PENDING: usize = 512;

/// Per-flow HTTP state
struct HttpFlowState {
    request: HalfParser,
    response: HalfParser,
    /// Requests awaiting their response, oldest first
    pending: VecDeque<HttpMessage>,
    /// Latest packet timestamp seen on this flow; fin callbacks carry no
    /// time of their own and must stay on the packet clock
    last_ts: DateTime<Utc>,
    fin_server: bool,
    fin_client: bool,
}

impl HttpFlowState {
    fn new(cfg: &HttpConfig) -> Self {
        Self {
            request: HalfParser::new(true, cfg.send_request),
            response: HalfParser::new(false, cfg.send_response),
            pending: VecDeque::new(),
            last_ts: DateTime::<Utc>::default(),
            fin_server: false,
            fin_client: false,
        }
    }
}

/// The HTTP protocol plugin
pub struct HttpPlugin {
    cfg: HttpConfig,
    emitter: TxEmitter,
}

impl HttpPlugin {
    pub fn new(cfg: HttpConfig, emitter: TxEmitter) -> Self {
        Self { cfg, emitter }
    }

    fn correlate(&self, st: &mut HttpFlowState, flow: &BoundFlow, response: HttpMessage) {
        let Some(request) = st.pending.pop_front() else {
            debug!("http response without a pending request on {}", flow.key);
            bump(&self.emitter.counters().http.parse_errors);
            return;
        };
        self.emit_pair(flow, request, Some(response));
    }

    fn emit_pair(&self, flow: &BoundFlow, request: HttpMessage, response: Option<HttpMessage>) {
        let client = Endpoint::new(flow.client.ip(), flow.client.port());
        let server = Endpoint::new(flow.server().ip(), flow.server().port());
        let ts_request = request.ts_start.unwrap_or_default();
        let mut tx = Transaction::new(ProtocolId::Http, ts_request, client, server);

        tx.path = request.path().to_string();
        tx.resource = Some(resource_of(request.path()).to_string());
        tx.method = Some(request.method.clone());
        tx.query = Some(format!("{} {}", request.method, request.uri));
        tx.params = request.query_string().map(str::to_string);
        tx.bytes_in = request.size;
        tx.notes = request.notes;

        tx.fields
            .insert("request_headers".into(), headers_value(&request.headers));

        if !request.raw.is_empty() {
            tx.request_raw = Some(request.raw);
        }

        match response {
            Some(resp) => {
                tx.ts_response = resp.ts_end;
                tx.status = status_of(resp.code);
                tx.bytes_out = resp.size;
                tx.notes.extend(resp.notes);
                tx.fields.insert("code".into(), Value::from(resp.code));
                tx.fields.insert("phrase".into(), Value::from(resp.phrase));
                if let Some(len) = resp.content_length {
                    tx.fields.insert("content_length".into(), Value::from(len));
                }
                tx.fields
                    .insert("response_headers".into(), headers_value(&resp.headers));
                if !resp.raw.is_empty() {
                    tx.response_raw = Some(resp.raw);
                }
            }
            None => {
                tx.status = Status::Error;
                tx.note("no response");
            }
        }

        self.emitter.emit(tx);
    }

    /// Flush unanswered requests once both directions closed
    fn flush_pending(&self, st: &mut HttpFlowState, flow: &BoundFlow) {
        while let Some(request) = st.pending.pop_front() {
            bump(&self.emitter.counters().http.timeouts);
            self.emit_pair(flow, request, None);
        }
    }
}

impl TcpProtocol for HttpPlugin {
    fn id(&self) -> ProtocolId {
        ProtocolId::Http
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
        let cfg = self.cfg.clone();
        let st = state.get_or_insert_with(|| HttpFlowState::new(&cfg));
        st.last_ts = ts;

        loop {
            let head_hint = dir == Direction::ToClient
                && st.pending.front().map(|r| r.method == "HEAD").unwrap_or(false);
            let half = match dir {
                Direction::ToServer => &mut st.request,
                Direction::ToClient => &mut st.response,
            };
            match half.feed(ts, stream, &cfg, head_hint) {
                Feed::NeedMore => return ParseResult::NeedMore,
                Feed::Error(e) => {
                    debug!("http parse error on {}: {}", flow.key, e);
                    bump(&self.emitter.counters().http.parse_errors);
                    return ParseResult::Drop;
                }
                Feed::Message(msg) => {
                    if dir == Direction::ToServer {
                        if st.pending.len() >= MAX_PENDING {
                            bump(&self.emitter.counters().http.overflows);
                            if let Some(mut evicted) = st.pending.pop_front() {
                                evicted.notes.push("dropped (overflow)".into());
                                self.emit_pair(flow, evicted, None);
                            }
                        }
                        st.pending.push_back(msg);
                    } else {
                        self.correlate(st, flow, msg);
                    }
                }
            }
        }
    }

    fn fin(&mut self, flow: &BoundFlow, dir: Direction, state: &mut ParserState) {
        let Some(st) = state.get_mut::<HttpFlowState>() else {
            return;
        };
        match dir {
            Direction::ToClient => {
                st.fin_client = true;
                // Close delimits a read-until-close response body
                let finished = st.response.finish_on_close(st.last_ts);
                if let Some(msg) = finished {
                    self.correlate(st, flow, msg);
                }
            }
            Direction::ToServer => st.fin_server = true,
        }
        if st.fin_client && st.fin_server {
            self.flush_pending(st, flow);
        }
    }

    fn gap(
        &mut self,
        flow: &BoundFlow,
        dir: Direction,
        nbytes: usize,
        state: &mut ParserState,
    ) -> bool {
        let Some(st) = state.get_mut::<HttpFlowState>() else {
            return true;
        };
        let (half, label) = match dir {
            Direction::ToServer => (&mut st.request, "request"),
            Direction::ToClient => (&mut st.response, "response"),
        };

        if half.reading_until_close() {
            half.add_note(format!("Packet loss while capturing the {}", label));
            return false;
        }
        if let Some(remaining) = half.body_remaining() {
            if remaining >= nbytes as u64 {
                half.absorb_gap(nbytes as u64);
                half.add_note(format!("Packet loss while capturing the {}", label));
                return false;
            }
        }
        debug!("unrecoverable gap of {} bytes on {}", nbytes, flow.key);
        true
    }
}

/// OK for 1xx-3xx, Client Error for 4xx, Server Error for 5xx
fn status_of(code: u16) -> Status {
    match code {
        100..=399 => Status::Ok,
        400..=499 => Status::ClientError,
        _ => Status::ServerError,
    }
}

/// The path with its last segment removed: `/users/1` -> `/users`
fn resource_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => path,
        Some(idx) => &path[..idx],
    }
}

fn headers_value(headers: &std::collections::HashMap<String, String>) -> Value {
    let map: serde_json::Map<String, Value> = headers
        .iter()
        .map(|(k, v)| (k.clone(), Value::from(v.clone())))
        .collect();
    Value::Object(map)
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
        let server: SocketAddr = "10.0.0.1:80".parse().unwrap();
        BoundFlow::new(FlowKey::new(client, server), client)
    }

    fn ts(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    /// Drive a plugin and return what reached the sink
    struct Harness {
        plugin: HttpPlugin,
        publisher: Option<PublisherThread>,
        sink: CollectorSink,
        state: ParserState,
        req_stream: StreamBuffer,
        resp_stream: StreamBuffer,
    }

    impl Harness {
        fn new(mut cfg: HttpConfig) -> Self {
            cfg.send_request = true;
            cfg.send_response = true;
            let sink = CollectorSink::new();
            let counters = Arc::new(Counters::default());
            let publisher = PublisherThread::spawn(
                Box::new(sink.clone()),
                &OutputSettings::default(),
                counters.clone(),
            );
            let emitter = TxEmitter::new(
                ProtocolId::Http,
                publisher.handle(),
                counters,
                Arc::new(Vec::new()),
                true,
                true,
            );
            Self {
                plugin: HttpPlugin::new(cfg, emitter),
                publisher: Some(publisher),
                sink,
                state: ParserState::new(),
                req_stream: StreamBuffer::new(65536),
                resp_stream: StreamBuffer::new(65536),
            }
        }

        fn feed(&mut self, dir: Direction, at_ms: i64, bytes: &[u8]) -> ParseResult {
            let stream = match dir {
                Direction::ToServer => &mut self.req_stream,
                Direction::ToClient => &mut self.resp_stream,
            };
            assert!(stream.append(bytes));
            self.plugin
                .parse(ts(at_ms), &flow(), dir, stream, &mut self.state)
        }

        fn fin(&mut self, dir: Direction) {
            self.plugin.fin(&flow(), dir, &mut self.state);
        }

        fn records(mut self) -> Vec<Record> {
            self.publisher.take().unwrap().shutdown();
            self.sink.records()
        }
    }

    #[test]
    fn test_request_split_across_packets() {
        // Boundary scenario: request truncated mid-header, then completed
        let mut h = Harness::new(HttpConfig::default());

        let r1 = h.feed(Direction::ToServer, 0, b"GET /users/1 HTTP/1.1\r\nHost: ");
        assert_eq!(r1, ParseResult::NeedMore);
        h.feed(Direction::ToServer, 5, b"a\r\n\r\n");
        h.feed(
            Direction::ToClient,
            20,
            b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok",
        );

        let records = h.records();
        assert_eq!(records.len(), 1);
        let rec = &records[0];
        assert_eq!(rec.type_, "http");
        assert_eq!(rec.method.as_deref(), Some("GET"));
        assert_eq!(rec.path, "/users/1");
        assert_eq!(rec.resource.as_deref(), Some("/users"));
        assert_eq!(rec.status, Status::Ok);
        assert_eq!(rec.fields["code"], 200);
        assert_eq!(rec.bytes_in, Some(34));
        assert_eq!(rec.bytes_out, Some(40));
        assert_eq!(rec.responsetime, Some(20));
        // Round-trip law: stored request equals the wire bytes
        assert_eq!(
            rec.request.as_deref(),
            Some("GET /users/1 HTTP/1.1\r\nHost: a\r\n\r\n")
        );
    }

    #[test]
    fn test_http10_gap_in_body_until_close() {
        // Boundary scenario: HTTP/1.0 response, gap in body, then FIN
        let mut h = Harness::new(HttpConfig::default());

        h.feed(Direction::ToServer, 0, b"GET / HTTP/1.0\r\n\r\n");
        h.feed(
            Direction::ToClient,
            10,
            b"HTTP/1.0 200 OK\r\n\r\n01234567890123456789",
        );

        let dropped = h.plugin.gap(&flow(), Direction::ToClient, 10, &mut h.state);
        assert!(!dropped);

        h.fin(Direction::ToClient);
        h.fin(Direction::ToServer);

        let records = h.records();
        assert_eq!(records.len(), 1);
        let rec = &records[0];
        assert_eq!(rec.status, Status::Ok);
        assert!(rec
            .notes
            .contains(&"Packet loss while capturing the response".to_string()));
    }

    #[test]
    fn test_pipelined_requests_fifo() {
        let mut h = Harness::new(HttpConfig::default());

        h.feed(
            Direction::ToServer,
            0,
            b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n",
        );
        h.feed(
            Direction::ToClient,
            5,
            b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\nHTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n",
        );

        let records = h.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].path, "/a");
        assert_eq!(records[0].status, Status::Ok);
        assert_eq!(records[1].path, "/b");
        assert_eq!(records[1].status, Status::ClientError);
    }

    #[test]
    fn test_chunked_response() {
        let mut h = Harness::new(HttpConfig::default());

        h.feed(Direction::ToServer, 0, b"GET /x HTTP/1.1\r\n\r\n");
        h.feed(
            Direction::ToClient,
            1,
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n",
        );
        h.feed(Direction::ToClient, 2, b"4\r\nwiki\r\n");
        h.feed(Direction::ToClient, 3, b"5\r\npedia\r\n0\r\n\r\n");

        let records = h.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, Status::Ok);
        assert_eq!(records[0].responsetime, Some(3));
    }

    #[test]
    fn test_server_error_status() {
        let mut h = Harness::new(HttpConfig::default());
        h.feed(Direction::ToServer, 0, b"GET / HTTP/1.1\r\n\r\n");
        h.feed(
            Direction::ToClient,
            1,
            b"HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\n\r\n",
        );
        let records = h.records();
        assert_eq!(records[0].status, Status::ServerError);
    }

    #[test]
    fn test_head_response_has_no_body() {
        let mut h = Harness::new(HttpConfig::default());
        h.feed(Direction::ToServer, 0, b"HEAD /big HTTP/1.1\r\n\r\n");
        // Content-Length present but a HEAD response carries no body
        h.feed(
            Direction::ToClient,
            1,
            b"HTTP/1.1 200 OK\r\nContent-Length: 512\r\n\r\n",
        );
        let records = h.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].fields["content_length"], 512);
    }

    #[test]
    fn test_header_capture_comma_joins_duplicates() {
        let mut cfg = HttpConfig::default();
        cfg.send_headers = vec!["x-trace".into()];
        let mut h = Harness::new(cfg);

        h.feed(
            Direction::ToServer,
            0,
            b"GET / HTTP/1.1\r\nX-Trace: a\r\nX-Trace: b\r\n\r\n",
        );
        h.feed(
            Direction::ToClient,
            1,
            b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n",
        );

        let records = h.records();
        assert_eq!(records[0].fields["request_headers"]["x-trace"], "a, b");
    }

    #[test]
    fn test_flow_close_flushes_pending_as_error() {
        let mut h = Harness::new(HttpConfig::default());
        h.feed(Direction::ToServer, 0, b"GET /never HTTP/1.1\r\n\r\n");
        h.fin(Direction::ToClient);
        h.fin(Direction::ToServer);

        let records = h.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, Status::Error);
        assert!(records[0].notes.contains(&"no response".to_string()));
    }

    #[test]
    fn test_garbage_drops_flow() {
        let mut h = Harness::new(HttpConfig::default());
        let r = h.feed(Direction::ToServer, 0, b"\x00\x01\x02garbage here\r\n\r\n");
        assert_eq!(r, ParseResult::Drop);
    }

    #[test]
    fn test_resource_of() {
        assert_eq!(resource_of("/users/1"), "/users");
        assert_eq!(resource_of("/users"), "/users");
        assert_eq!(resource_of("/"), "/");
        assert_eq!(resource_of("/a/b/c"), "/a/b");
    }
}
