//! MongoDB analyzer
//!
//! Speaks the classic wire protocol (OP_QUERY, OP_GET_MORE, OP_INSERT,
//! OP_UPDATE, OP_DELETE, OP_REPLY) plus OP_MSG. Requests pair with
//! responses by `responseTo == requestID`; fire-and-forget writes publish
//! immediately as request-only transactions.

pub mod bson;

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::debug;

use crate::config::MongodbConfig;
use crate::core::Direction;
use crate::counters::bump;
use crate::flow::BoundFlow;
use crate::publish::{Endpoint, Status};
use crate::tcp::StreamBuffer;
use super::{ParseResult, ParserState, ProtocolId, TcpProtocol, Transaction, TxEmitter};

const OP_REPLY: i32 = 1;
const OP_UPDATE: i32 = 2001;
const OP_INSERT: i32 = 2002;
const OP_QUERY: i32 = 2004;
const OP_GET_MORE: i32 = 2005;
const OP_DELETE: i32 = 2006;
const OP_KILL_CURSORS: i32 = 2007;
const OP_MSG: i32 = 2013;

/// Bound on unanswered requests per flow
const MAX_PENDING: usize = 256;

struct MongoRequest {
    request_id: i32,
    method: String,
    collection: String,
    query_json: Option<String>,
    number_to_return: Option<i32>,
    ts: DateTime<Utc>,
    size: u64,
}

#[derive(Default)]
struct MongoFlowState {
    pending: HashMap<i32, MongoRequest>,
    order: VecDeque<i32>,
    fin_server: bool,
    fin_client: bool,
}

/// The MongoDB protocol plugin
pub struct MongodbPlugin {
    cfg: MongodbConfig,
    emitter: TxEmitter,
}

impl MongodbPlugin {
    pub fn new(cfg: MongodbConfig, emitter: TxEmitter) -> Self {
        Self { cfg, emitter }
    }

    fn base_tx(&self, flow: &BoundFlow, request: &MongoRequest) -> Transaction {
        let client = Endpoint::new(flow.client.ip(), flow.client.port());
        let server = Endpoint::new(flow.server().ip(), flow.server().port());
        let mut tx = Transaction::new(ProtocolId::Mongodb, request.ts, client, server);

        tx.method = Some(request.method.clone());
        tx.path = request.collection.clone();
        tx.resource = Some(request.collection.clone());
        tx.bytes_in = request.size;
        tx.fields.insert(
            "fullCollectionName".into(),
            Value::from(request.collection.clone()),
        );
        if let Some(q) = &request.query_json {
            tx.query = Some(truncate(q, self.cfg.max_doc_length));
            tx.fields
                .insert("query".into(), Value::from(truncate(q, self.cfg.max_doc_length)));
        }
        if let Some(n) = request.number_to_return {
            tx.fields.insert("numberToReturn".into(), Value::from(n));
        }
        tx
    }

    fn emit_with_reply(
        &self,
        flow: &BoundFlow,
        request: MongoRequest,
        reply: MongoReply,
        ts_end: DateTime<Utc>,
    ) {
        let mut tx = self.base_tx(flow, &request);
        tx.ts_response = Some(ts_end);
        tx.bytes_out = reply.size;
        if reply.is_error {
            tx.status = Status::Error;
        }
        if let Some(n) = reply.number_returned {
            tx.fields.insert("numberReturned".into(), Value::from(n));
        }
        if let Some(c) = reply.cursor_id {
            tx.fields.insert("cursorId".into(), Value::from(c));
        }
        if let Some(err) = reply.error {
            tx.fields.insert("error".into(), Value::from(err));
        }
        self.emitter.emit(tx);
    }

    fn emit_oneway(&self, flow: &BoundFlow, request: MongoRequest) {
        let tx = self.base_tx(flow, &request);
        self.emitter.emit(tx);
    }

    fn emit_unanswered(&self, flow: &BoundFlow, request: MongoRequest) {
        bump(&self.emitter.counters().mongodb.timeouts);
        let mut tx = self.base_tx(flow, &request);
        tx.status = Status::Error;
        tx.note("no response");
        self.emitter.emit(tx);
    }
}

struct MongoReply {
    number_returned: Option<i32>,
    cursor_id: Option<i64>,
    is_error: bool,
    error: Option<String>,
    size: u64,
}

impl TcpProtocol for MongodbPlugin {
    fn id(&self) -> ProtocolId {
        ProtocolId::Mongodb
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
        let st = state.get_or_insert_with(MongoFlowState::default);

        loop {
            let Some(msg_len) = stream.peek_u32_le(0) else {
                return ParseResult::NeedMore;
            };
            let msg_len = msg_len as usize;
            if msg_len < 16 || msg_len > self.cfg.max_message_size {
                bump(&self.emitter.counters().mongodb.parse_errors);
                return ParseResult::Drop;
            }
            if stream.len() < msg_len {
                return ParseResult::NeedMore;
            }
            let frame = stream.collect(msg_len).expect("length checked");

            let request_id = i32::from_le_bytes([frame[4], frame[5], frame[6], frame[7]]);
            let response_to = i32::from_le_bytes([frame[8], frame[9], frame[10], frame[11]]);
            let op_code = i32::from_le_bytes([frame[12], frame[13], frame[14], frame[15]]);
            let body = &frame[16..];

            match dir {
                Direction::ToServer => {
                    let request = match parse_request(op_code, request_id, body, ts, msg_len as u64)
                    {
                        Some(req) => req,
                        None => {
                            debug!("mongodb unparsable op {} on {}", op_code, flow.key);
                            bump(&self.emitter.counters().mongodb.parse_errors);
                            continue;
                        }
                    };

                    match op_code {
                        OP_INSERT | OP_UPDATE | OP_DELETE | OP_KILL_CURSORS => {
                            // Legacy writes get no reply
                            self.emit_oneway(flow, request);
                        }
                        _ => {
                            if st.pending.len() >= MAX_PENDING {
                                bump(&self.emitter.counters().mongodb.overflows);
                                if let Some(oldest) = st.order.pop_front() {
                                    if let Some(evicted) = st.pending.remove(&oldest) {
                                        let mut tx = self.base_tx(flow, &evicted);
                                        tx.status = Status::Error;
                                        tx.note("dropped (overflow)");
                                        self.emitter.emit(tx);
                                    }
                                }
                            }
                            st.order.push_back(request_id);
                            st.pending.insert(request_id, request);
                        }
                    }
                }
                Direction::ToClient => {
                    if op_code != OP_REPLY && op_code != OP_MSG {
                        continue;
                    }
                    let Some(request) = st.pending.remove(&response_to) else {
                        debug!("mongodb reply to unknown request {} on {}", response_to, flow.key);
                        bump(&self.emitter.counters().mongodb.parse_errors);
                        continue;
                    };
                    st.order.retain(|&id| id != response_to);
                    let reply = parse_reply(op_code, body, msg_len as u64);
                    self.emit_with_reply(flow, request, reply, ts);
                }
            }
        }
    }

    fn fin(&mut self, flow: &BoundFlow, dir: Direction, state: &mut ParserState) {
        let Some(st) = state.get_mut::<MongoFlowState>() else {
            return;
        };
        match dir {
            Direction::ToServer => st.fin_server = true,
            Direction::ToClient => st.fin_client = true,
        }
        if st.fin_server && st.fin_client {
            while let Some(id) = st.order.pop_front() {
                if let Some(request) = st.pending.remove(&id) {
                    self.emit_unanswered(flow, request);
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
        debug!("dropping mongodb flow {} after {} lost bytes", flow.key, nbytes);
        true
    }
}

fn parse_request(
    op_code: i32,
    request_id: i32,
    body: &[u8],
    ts: DateTime<Utc>,
    size: u64,
) -> Option<MongoRequest> {
    match op_code {
        OP_QUERY => {
            // flags, fullCollectionName, numberToSkip, numberToReturn, doc
            let (collection, used) = read_cstring(body.get(4..)?)?;
            let after = 4 + used;
            let number_to_return = i32::from_le_bytes(body.get(after + 4..after + 8)?.try_into().ok()?);
            let query_json = bson::parse_document(body.get(after + 8..)?)
                .map(|(doc, _)| doc.to_string());
            Some(MongoRequest {
                request_id,
                method: "query".into(),
                collection,
                query_json,
                number_to_return: Some(number_to_return),
                ts,
                size,
            })
        }
        OP_GET_MORE => {
            let (collection, used) = read_cstring(body.get(4..)?)?;
            let after = 4 + used;
            let number_to_return = i32::from_le_bytes(body.get(after..after + 4)?.try_into().ok()?);
            let cursor = i64::from_le_bytes(body.get(after + 4..after + 12)?.try_into().ok()?);
            Some(MongoRequest {
                request_id,
                method: "getmore".into(),
                collection,
                query_json: Some(format!("{{\"getMore\": {}}}", cursor)),
                number_to_return: Some(number_to_return),
                ts,
                size,
            })
        }
        OP_INSERT | OP_UPDATE | OP_DELETE => {
            let (collection, used) = read_cstring(body.get(4..)?)?;
            let method = match op_code {
                OP_INSERT => "insert",
                OP_UPDATE => "update",
                _ => "delete",
            };
            // Update/delete carry a selector doc after flags
            let doc_start = match op_code {
                OP_INSERT => 4 + used,
                _ => 4 + used + 4,
            };
            let query_json = body
                .get(doc_start..)
                .and_then(bson::parse_document)
                .map(|(doc, _)| doc.to_string());
            Some(MongoRequest {
                request_id,
                method: method.into(),
                collection,
                query_json,
                number_to_return: None,
                ts,
                size,
            })
        }
        OP_KILL_CURSORS => Some(MongoRequest {
            request_id,
            method: "killcursors".into(),
            collection: String::new(),
            query_json: None,
            number_to_return: None,
            ts,
            size,
        }),
        OP_MSG => {
            // flags u32, then section kind 0 carries the command document
            let doc = body.get(5..).and_then(bson::parse_document);
            let (method, collection, json) = match doc {
                Some((Value::Object(map), _)) => {
                    let method = map
                        .keys()
                        .next()
                        .cloned()
                        .unwrap_or_else(|| "msg".to_string());
                    let coll = map
                        .get(&method)
                        .and_then(|v| v.as_str())
                        .unwrap_or_default();
                    let db = map.get("$db").and_then(|v| v.as_str()).unwrap_or_default();
                    let full = if db.is_empty() || coll.is_empty() {
                        coll.to_string()
                    } else {
                        format!("{}.{}", db, coll)
                    };
                    (method, full, Some(Value::Object(map).to_string()))
                }
                _ => ("msg".to_string(), String::new(), None),
            };
            Some(MongoRequest {
                request_id,
                method,
                collection,
                query_json: json,
                number_to_return: None,
                ts,
                size,
            })
        }
        _ => None,
    }
}

fn parse_reply(op_code: i32, body: &[u8], size: u64) -> MongoReply {
    if op_code == OP_REPLY && body.len() >= 20 {
        let flags = i32::from_le_bytes([body[0], body[1], body[2], body[3]]);
        let cursor_id = i64::from_le_bytes(body[4..12].try_into().expect("length checked"));
        let number_returned =
            i32::from_le_bytes(body[16..20].try_into().expect("length checked"));
        let query_failure = flags & 0x02 != 0;
        let first_doc = body.get(20..).and_then(bson::parse_document);
        let error = first_doc.as_ref().and_then(|(doc, _)| {
            doc.get("$err")
                .and_then(|v| v.as_str())
                .map(str::to_string)
        });
        MongoReply {
            number_returned: Some(number_returned),
            cursor_id: Some(cursor_id),
            is_error: query_failure || error.is_some(),
            error,
            size,
        }
    } else if op_code == OP_MSG {
        let doc = body.get(5..).and_then(bson::parse_document);
        let (is_error, error) = match &doc {
            Some((value, _)) => {
                let failed = value.get("ok").and_then(|v| v.as_f64()) == Some(0.0);
                let msg = value
                    .get("errmsg")
                    .and_then(|v| v.as_str())
                    .map(str::to_string);
                (failed || msg.is_some(), msg)
            }
            None => (false, None),
        };
        MongoReply {
            number_returned: None,
            cursor_id: None,
            is_error,
            error,
            size,
        }
    } else {
        MongoReply {
            number_returned: None,
            cursor_id: None,
            is_error: false,
            error: None,
            size,
        }
    }
}

fn read_cstring(data: &[u8]) -> Option<(String, usize)> {
    let end = data.iter().position(|&b| b == 0)?;
    Some((String::from_utf8_lossy(&data[..end]).into_owned(), end + 1))
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() > max {
        let mut t: String = s.chars().take(max).collect();
        t.push_str("...");
        t
    } else {
        s.to_string()
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
    use serde_json::json;
    use std::net::SocketAddr;
    use std::sync::Arc;

    fn flow() -> BoundFlow {
        let client: SocketAddr = "192.168.1.5:40000".parse().unwrap();
        let server: SocketAddr = "10.0.0.1:27017".parse().unwrap();
        BoundFlow::new(FlowKey::new(client, server), client)
    }

    fn ts(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    fn header(len: usize, request_id: i32, response_to: i32, op: i32) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16);
        buf.extend_from_slice(&(len as i32).to_le_bytes());
        buf.extend_from_slice(&request_id.to_le_bytes());
        buf.extend_from_slice(&response_to.to_le_bytes());
        buf.extend_from_slice(&op.to_le_bytes());
        buf
    }

    fn op_query(request_id: i32, collection: &str, doc: &[u8], n_return: i32) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&0i32.to_le_bytes()); // flags
        body.extend_from_slice(collection.as_bytes());
        body.push(0);
        body.extend_from_slice(&0i32.to_le_bytes()); // numberToSkip
        body.extend_from_slice(&n_return.to_le_bytes());
        body.extend_from_slice(doc);
        let mut wire = header(16 + body.len(), request_id, 0, OP_QUERY);
        wire.extend_from_slice(&body);
        wire
    }

    fn op_reply(response_to: i32, docs: &[u8], n_returned: i32, cursor: i64) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&0i32.to_le_bytes()); // responseFlags
        body.extend_from_slice(&cursor.to_le_bytes());
        body.extend_from_slice(&0i32.to_le_bytes()); // startingFrom
        body.extend_from_slice(&n_returned.to_le_bytes());
        body.extend_from_slice(docs);
        let mut wire = header(16 + body.len(), 900, response_to, OP_REPLY);
        wire.extend_from_slice(&body);
        wire
    }

    struct Harness {
        plugin: MongodbPlugin,
        publisher: Option<PublisherThread>,
        sink: CollectorSink,
        state: ParserState,
        req: StreamBuffer,
        resp: StreamBuffer,
    }

    impl Harness {
        fn new() -> Self {
            let sink = CollectorSink::new();
            let counters = Arc::new(Counters::default());
            let publisher = PublisherThread::spawn(
                Box::new(sink.clone()),
                &OutputSettings::default(),
                counters.clone(),
            );
            let emitter = TxEmitter::new(
                ProtocolId::Mongodb,
                publisher.handle(),
                counters,
                Arc::new(Vec::new()),
                false,
                false,
            );
            Self {
                plugin: MongodbPlugin::new(MongodbConfig::default(), emitter),
                publisher: Some(publisher),
                sink,
                state: ParserState::new(),
                req: StreamBuffer::new(1 << 22),
                resp: StreamBuffer::new(1 << 22),
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
    fn test_query_reply_pair() {
        let mut h = Harness::new();
        let doc = bson::encode_document(&[("name", Value::from("x"))]);
        h.feed(Direction::ToServer, 0, &op_query(11, "app.users", &doc, 10));

        let result = bson::encode_document(&[("name", Value::from("x")), ("age", json!(3i64))]);
        h.feed(Direction::ToClient, 6, &op_reply(11, &result, 1, 0));

        let records = h.records();
        assert_eq!(records.len(), 1);
        let rec = &records[0];
        assert_eq!(rec.type_, "mongodb");
        assert_eq!(rec.status, Status::Ok);
        assert_eq!(rec.method.as_deref(), Some("query"));
        assert_eq!(rec.path, "app.users");
        assert_eq!(rec.fields["fullCollectionName"], "app.users");
        assert_eq!(rec.fields["numberToReturn"], 10);
        assert_eq!(rec.fields["numberReturned"], 1);
        assert_eq!(rec.fields["cursorId"], 0);
        assert!(rec.fields["query"].as_str().unwrap().contains("\"name\""));
        assert_eq!(rec.responsetime, Some(6));
    }

    #[test]
    fn test_insert_is_oneway() {
        let mut h = Harness::new();
        let doc = bson::encode_document(&[("v", json!(1i64))]);
        let mut body = Vec::new();
        body.extend_from_slice(&0i32.to_le_bytes());
        body.extend_from_slice(b"app.items\0");
        body.extend_from_slice(&doc);
        let mut wire = header(16 + body.len(), 21, 0, OP_INSERT);
        wire.extend_from_slice(&body);
        h.feed(Direction::ToServer, 0, &wire);

        let records = h.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].method.as_deref(), Some("insert"));
        assert_eq!(records[0].status, Status::Ok);
        assert!(records[0].responsetime.is_none());
    }

    #[test]
    fn test_query_failure_flag() {
        let mut h = Harness::new();
        let doc = bson::encode_document(&[]);
        h.feed(Direction::ToServer, 0, &op_query(31, "app.x", &doc, 1));

        let err_doc = bson::encode_document(&[("$err", Value::from("not authorized"))]);
        let mut reply = op_reply(31, &err_doc, 1, 0);
        // Set the queryFailure response flag
        reply[16] = 0x02;
        h.feed(Direction::ToClient, 1, &reply);

        let records = h.records();
        assert_eq!(records[0].status, Status::Error);
        assert_eq!(records[0].fields["error"], "not authorized");
    }

    #[test]
    fn test_message_split_mid_frame() {
        let mut h = Harness::new();
        let doc = bson::encode_document(&[("a", json!(1i64))]);
        let wire = op_query(41, "db.c", &doc, 5);
        let r = h.feed(Direction::ToServer, 0, &wire[..20]);
        assert_eq!(r, ParseResult::NeedMore);
        h.feed(Direction::ToServer, 1, &wire[20..]);
        h.feed(
            Direction::ToClient,
            2,
            &op_reply(41, &bson::encode_document(&[]), 0, 0),
        );

        assert_eq!(h.records().len(), 1);
    }

    #[test]
    fn test_op_msg_command() {
        let mut h = Harness::new();
        let doc = bson::encode_document(&[
            ("find", Value::from("users")),
            ("$db", Value::from("app")),
        ]);
        let mut body = Vec::new();
        body.extend_from_slice(&0u32.to_le_bytes()); // flagBits
        body.push(0); // section kind 0
        body.extend_from_slice(&doc);
        let mut wire = header(16 + body.len(), 51, 0, OP_MSG);
        wire.extend_from_slice(&body);
        h.feed(Direction::ToServer, 0, &wire);

        let ok = bson::encode_document(&[("ok", json!(1.0))]);
        let mut rbody = Vec::new();
        rbody.extend_from_slice(&0u32.to_le_bytes());
        rbody.push(0);
        rbody.extend_from_slice(&ok);
        let mut rwire = header(16 + rbody.len(), 900, 51, OP_MSG);
        rwire.extend_from_slice(&rbody);
        h.feed(Direction::ToClient, 2, &rwire);

        let records = h.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].method.as_deref(), Some("find"));
        assert_eq!(records[0].path, "app.users");
        assert_eq!(records[0].status, Status::Ok);
    }

    #[test]
    fn test_close_flushes_pending() {
        let mut h = Harness::new();
        let doc = bson::encode_document(&[]);
        h.feed(Direction::ToServer, 0, &op_query(61, "db.c", &doc, 1));
        h.plugin.fin(&flow(), Direction::ToServer, &mut h.state);
        h.plugin.fin(&flow(), Direction::ToClient, &mut h.state);

        let records = h.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, Status::Error);
        assert!(records[0].notes.contains(&"no response".to_string()));
    }
}
