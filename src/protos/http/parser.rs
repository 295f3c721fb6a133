//! HTTP/1.x incremental message parser
//!
//! Consumes bytes from a directional stream buffer phase by phase: start
//! line, headers, then a body framed by Content-Length, chunked
//! transfer-encoding, or connection close. Each direction of a flow owns
//! one [`HalfParser`]; a message survives any number of packet splits.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::config::HttpConfig;
use crate::tcp::StreamBuffer;

const METHODS: [&str; 9] = [
    "GET", "POST", "PUT", "DELETE", "HEAD", "OPTIONS", "PATCH", "CONNECT", "TRACE",
];

/// A parsed HTTP message (request or response)
#[derive(Debug, Clone, Default)]
pub struct HttpMessage {
    pub is_request: bool,
    pub method: String,
    pub uri: String,
    /// Minor version of HTTP/1.x
    pub version_minor: u8,
    pub code: u16,
    pub phrase: String,
    /// Captured headers per configuration, duplicates comma-joined
    pub headers: HashMap<String, String>,
    pub host: Option<String>,
    pub content_length: Option<u64>,
    pub content_type: Option<String>,
    pub chunked: bool,
    pub connection_close: bool,
    pub ts_start: Option<DateTime<Utc>>,
    pub ts_end: Option<DateTime<Utc>>,
    /// Bytes consumed for this message, framing included
    pub size: u64,
    /// Raw bytes retained for the record, capped
    pub raw: Vec<u8>,
    pub notes: Vec<String>,
}

impl HttpMessage {
    /// Path component of the request target, without the query string
    pub fn path(&self) -> &str {
        match self.uri.split_once('?') {
            Some((path, _)) => path,
            None => &self.uri,
        }
    }

    pub fn query_string(&self) -> Option<&str> {
        self.uri.split_once('?').map(|(_, q)| q)
    }
}

/// Body framing resolved from the headers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyMode {
    None,
    Length(u64),
    Chunked,
    UntilClose,
}

/// Parse phase of one direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    StartLine,
    Body(u64),
    ChunkSize,
    ChunkData(u64),
    /// CRLF after a chunk's data
    ChunkDataEnd,
    Trailer,
    UntilClose,
}

/// Outcome of one feed call
#[derive(Debug)]
pub enum Feed {
    Message(HttpMessage),
    NeedMore,
    Error(String),
}

/// Incremental parser for one direction of a flow
#[derive(Debug)]
pub struct HalfParser {
    is_request: bool,
    phase: Phase,
    msg: HttpMessage,
    /// Retain body bytes into `msg.raw`
    retain_body: bool,
    retain_raw: bool,
}

impl HalfParser {
    pub fn new(is_request: bool, retain_raw: bool) -> Self {
        Self {
            is_request,
            phase: Phase::StartLine,
            msg: HttpMessage::default(),
            retain_body: false,
            retain_raw,
        }
    }

    /// Whether a message is mid-parse
    pub fn in_message(&self) -> bool {
        self.msg.ts_start.is_some()
    }

    /// Whether the current message ends only when the connection closes
    pub fn reading_until_close(&self) -> bool {
        self.phase == Phase::UntilClose
    }

    /// Bytes of body still expected, when known
    pub fn body_remaining(&self) -> Option<u64> {
        match self.phase {
            Phase::Body(n) => Some(n),
            _ => None,
        }
    }

    /// Shrink the expected body after a capture gap swallowed `nbytes`
    pub fn absorb_gap(&mut self, nbytes: u64) {
        if let Phase::Body(remaining) = self.phase {
            let left = remaining.saturating_sub(nbytes);
            self.msg.size += nbytes.min(remaining);
            self.phase = Phase::Body(left);
        }
    }

    pub fn add_note(&mut self, note: impl Into<String>) {
        self.msg.notes.push(note.into());
    }

    /// Finish an until-close body because the peer closed its side
    pub fn finish_on_close(&mut self, ts: DateTime<Utc>) -> Option<HttpMessage> {
        if self.phase == Phase::UntilClose && self.in_message() {
            Some(self.complete(ts))
        } else {
            None
        }
    }

    /// Consume as much of the current message as the buffer allows.
    ///
    /// `head_response` suppresses the body of a response to a HEAD request.
    pub fn feed(
        &mut self,
        ts: DateTime<Utc>,
        stream: &mut StreamBuffer,
        cfg: &HttpConfig,
        head_response: bool,
    ) -> Feed {
        loop {
            match self.phase {
                Phase::StartLine => {
                    if stream.is_empty() {
                        return Feed::NeedMore;
                    }
                    if self.msg.ts_start.is_none() {
                        self.msg.ts_start = Some(ts);
                        self.msg.is_request = self.is_request;
                    }
                    let Some(header_len) = find_header_end(stream.as_slice()) else {
                        if stream.len() > cfg.max_message_size {
                            return Feed::Error("header block exceeds max_message_size".into());
                        }
                        return Feed::NeedMore;
                    };
                    let head = stream.peek(header_len).expect("window checked").to_vec();
                    if let Err(e) = self.parse_head(&head, cfg) {
                        return Feed::Error(e);
                    }
                    stream.advance(header_len);
                    self.msg.size += header_len as u64;
                    if self.retain_raw {
                        self.append_raw(&head, cfg);
                    }

                    let mode = if head_response && !self.is_request {
                        BodyMode::None
                    } else {
                        self.body_mode()
                    };
                    self.phase = match mode {
                        BodyMode::None => return Feed::Message(self.complete(ts)),
                        BodyMode::Length(0) => return Feed::Message(self.complete(ts)),
                        BodyMode::Length(n) => Phase::Body(n),
                        BodyMode::Chunked => Phase::ChunkSize,
                        BodyMode::UntilClose => Phase::UntilClose,
                    };
                }
                Phase::Body(remaining) => {
                    let take = (remaining as usize).min(stream.len());
                    if take == 0 {
                        return Feed::NeedMore;
                    }
                    self.consume_body(stream, take, cfg);
                    let left = remaining - take as u64;
                    if left == 0 {
                        return Feed::Message(self.complete(ts));
                    }
                    self.phase = Phase::Body(left);
                    return Feed::NeedMore;
                }
                Phase::ChunkSize => {
                    let Some(line_len) = find_crlf(stream.as_slice()) else {
                        return Feed::NeedMore;
                    };
                    let line = stream.peek(line_len).expect("window checked").to_vec();
                    let text = String::from_utf8_lossy(&line[..line_len - 2]);
                    let size_text = text.split(';').next().unwrap_or("").trim();
                    let Ok(size) = u64::from_str_radix(size_text, 16) else {
                        return Feed::Error(format!("bad chunk size {:?}", size_text));
                    };
                    stream.advance(line_len);
                    self.msg.size += line_len as u64;
                    self.phase = if size == 0 {
                        Phase::Trailer
                    } else {
                        Phase::ChunkData(size)
                    };
                }
                Phase::ChunkData(remaining) => {
                    let take = (remaining as usize).min(stream.len());
                    if take == 0 {
                        return Feed::NeedMore;
                    }
                    self.consume_body(stream, take, cfg);
                    let left = remaining - take as u64;
                    if left == 0 {
                        self.phase = Phase::ChunkDataEnd;
                    } else {
                        self.phase = Phase::ChunkData(left);
                        return Feed::NeedMore;
                    }
                }
                Phase::ChunkDataEnd => {
                    if stream.len() < 2 {
                        return Feed::NeedMore;
                    }
                    stream.advance(2);
                    self.msg.size += 2;
                    self.phase = Phase::ChunkSize;
                }
                Phase::Trailer => {
                    // Zero or more trailer lines, then a blank line
                    let Some(line_len) = find_crlf(stream.as_slice()) else {
                        return Feed::NeedMore;
                    };
                    stream.advance(line_len);
                    self.msg.size += line_len as u64;
                    if line_len == 2 {
                        return Feed::Message(self.complete(ts));
                    }
                }
                Phase::UntilClose => {
                    let take = stream.len();
                    if take == 0 {
                        return Feed::NeedMore;
                    }
                    self.consume_body(stream, take, cfg);
                    return Feed::NeedMore;
                }
            }
        }
    }

    fn consume_body(&mut self, stream: &mut StreamBuffer, take: usize, cfg: &HttpConfig) {
        let bytes = stream.collect(take).expect("window checked");
        self.msg.size += take as u64;
        if self.retain_raw && self.retain_body {
            self.append_raw(&bytes, cfg);
        }
    }

    fn append_raw(&mut self, bytes: &[u8], cfg: &HttpConfig) {
        let room = cfg.max_message_size.saturating_sub(self.msg.raw.len());
        self.msg.raw.extend_from_slice(&bytes[..bytes.len().min(room)]);
    }

    fn complete(&mut self, ts: DateTime<Utc>) -> HttpMessage {
        let mut msg = std::mem::take(&mut self.msg);
        msg.ts_end = Some(ts);
        self.phase = Phase::StartLine;
        self.retain_body = false;
        msg
    }

    /// Parse the start line and header block
    fn parse_head(&mut self, head: &[u8], cfg: &HttpConfig) -> Result<(), String> {
        let text = String::from_utf8_lossy(head);
        let mut lines = text.split("\r\n");
        let start = lines.next().ok_or("empty header block")?;

        if self.is_request {
            let mut parts = start.split(' ');
            let method = parts.next().unwrap_or("");
            let uri = parts.next().ok_or("request line missing target")?;
            let version = parts.next().ok_or("request line missing version")?;
            if !METHODS.contains(&method) {
                return Err(format!("unknown method {:?}", method));
            }
            self.msg.method = method.to_string();
            self.msg.uri = uri.to_string();
            self.msg.version_minor = parse_version_minor(version)?;
        } else {
            let mut parts = start.splitn(3, ' ');
            let version = parts.next().ok_or("empty status line")?;
            let code = parts
                .next()
                .and_then(|c| c.parse::<u16>().ok())
                .ok_or("status line missing code")?;
            self.msg.version_minor = parse_version_minor(version)?;
            self.msg.code = code;
            self.msg.phrase = parts.next().unwrap_or("").to_string();
        }

        for line in lines {
            if line.is_empty() {
                continue;
            }
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            let name = name.trim().to_lowercase();
            let value = value.trim();

            match name.as_str() {
                "host" => self.msg.host = Some(value.to_string()),
                "content-length" => {
                    self.msg.content_length =
                        Some(value.parse::<u64>().map_err(|_| "bad content-length")?)
                }
                "content-type" => self.msg.content_type = Some(value.to_string()),
                "transfer-encoding" => {
                    self.msg.chunked = value.to_lowercase().contains("chunked")
                }
                "connection" => {
                    self.msg.connection_close = value.eq_ignore_ascii_case("close")
                }
                _ => {}
            }

            if cfg.send_all_headers
                || cfg.send_headers.iter().any(|h| h.eq_ignore_ascii_case(&name))
            {
                self.msg
                    .headers
                    .entry(name)
                    .and_modify(|prev| {
                        prev.push_str(", ");
                        prev.push_str(value);
                    })
                    .or_insert_with(|| value.to_string());
            }
        }

        self.retain_body = self
            .msg
            .content_type
            .as_deref()
            .map(|ct| {
                cfg.include_body_for
                    .iter()
                    .any(|want| ct.starts_with(want.as_str()))
            })
            .unwrap_or(false);

        Ok(())
    }

    fn body_mode(&self) -> BodyMode {
        if self.msg.chunked {
            return BodyMode::Chunked;
        }
        if let Some(len) = self.msg.content_length {
            return BodyMode::Length(len);
        }

        if self.is_request {
            // A request cannot be delimited by close; without explicit
            // framing even POST/PUT/PATCH carry no body
            BodyMode::None
        } else if self.msg.code < 200 || self.msg.code == 204 || self.msg.code == 304 {
            BodyMode::None
        } else {
            BodyMode::UntilClose
        }
    }
}

/// Offset one past the blank line ending the header block
fn find_header_end(window: &[u8]) -> Option<usize> {
    window
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|p| p + 4)
}

/// Length of the first line including its CRLF
fn find_crlf(window: &[u8]) -> Option<usize> {
    window.windows(2).position(|w| w == b"\r\n").map(|p| p + 2)
}

fn parse_version_minor(version: &str) -> Result<u8, String> {
    match version {
        "HTTP/1.1" => Ok(1),
        "HTTP/1.0" => Ok(0),
        other => Err(format!("unsupported version {:?}", other)),
    }
}
