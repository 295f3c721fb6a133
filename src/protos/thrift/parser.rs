//! Thrift wire decoding
//!
//! Handles the strict binary protocol and the compact protocol, each over
//! framed or unframed transports. Values are rendered into bounded
//! human-readable strings keyed by field id; IDL naming is not required.

/// Message kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Call,
    Reply,
    Exception,
    Oneway,
}

impl MessageType {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(MessageType::Call),
            2 => Some(MessageType::Reply),
            3 => Some(MessageType::Exception),
            4 => Some(MessageType::Oneway),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Call => "call",
            MessageType::Reply => "reply",
            MessageType::Exception => "exception",
            MessageType::Oneway => "oneway",
        }
    }
}

/// Rendering limits from the analyzer configuration
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub string_max: usize,
    pub collection_max: usize,
}

/// A decoded Thrift message
#[derive(Debug, Clone)]
pub struct ThriftMessage {
    pub mtype: MessageType,
    pub name: String,
    pub seqid: i32,
    /// Rendered argument struct of a call
    pub params: Option<String>,
    /// Rendered field 0 of a reply
    pub returns: Option<String>,
    /// Rendered non-zero reply fields or TApplicationException
    pub exceptions: Option<String>,
    /// Wire size including any frame header
    pub size: u64,
}

/// Parse outcome
pub enum ThriftParse {
    Done(ThriftMessage, usize),
    NeedMore,
    Error(String),
}

const BINARY_VERSION_MASK: u32 = 0xffff_0000;
const BINARY_VERSION_1: u32 = 0x8001_0000;
const COMPACT_PROTOCOL_ID: u8 = 0x82;

/// Maximum sane frame or message size guard
const MAX_METHOD_NAME: usize = 1024;

/// Detect and parse one message, framed or unframed
pub fn parse_message(window: &[u8], limits: Limits, max_message: usize) -> ThriftParse {
    if window.len() < 4 {
        return ThriftParse::NeedMore;
    }

    // Framed transport: a positive big-endian length, then a message that
    // itself starts with a recognizable protocol byte
    if window[0] & 0x80 == 0 && window[0] != COMPACT_PROTOCOL_ID {
        let frame_len = u32::from_be_bytes([window[0], window[1], window[2], window[3]]) as usize;
        if frame_len == 0 || frame_len > max_message {
            return ThriftParse::Error(format!("implausible frame length {}", frame_len));
        }
        if window.len() < 4 + frame_len {
            return ThriftParse::NeedMore;
        }
        let inner = &window[4..4 + frame_len];
        return match parse_unframed(inner, limits) {
            ThriftParse::Done(mut msg, _) => {
                msg.size = (4 + frame_len) as u64;
                ThriftParse::Done(msg, 4 + frame_len)
            }
            ThriftParse::NeedMore => {
                ThriftParse::Error("frame shorter than its message".into())
            }
            err => err,
        };
    }

    parse_unframed(window, limits)
}

fn parse_unframed(window: &[u8], limits: Limits) -> ThriftParse {
    if window.first() == Some(&COMPACT_PROTOCOL_ID) {
        parse_compact(window, limits)
    } else {
        parse_binary(window, limits)
    }
}

// ---------------------------------------------------------------------------
// Strict binary protocol
// ---------------------------------------------------------------------------

struct BinReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BinReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let slice = self.data.get(self.pos..self.pos + n)?;
        self.pos += n;
        Some(slice)
    }

    fn u8(&mut self) -> Option<u8> {
        Some(self.take(1)?[0])
    }

    fn i16(&mut self) -> Option<i16> {
        let b = self.take(2)?;
        Some(i16::from_be_bytes([b[0], b[1]]))
    }

    fn i32(&mut self) -> Option<i32> {
        let b = self.take(4)?;
        Some(i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i64(&mut self) -> Option<i64> {
        let b = self.take(8)?;
        Some(i64::from_be_bytes(b.try_into().ok()?))
    }
}

fn parse_binary(window: &[u8], limits: Limits) -> ThriftParse {
    let mut r = BinReader::new(window);
    let Some(header) = r.i32() else {
        return ThriftParse::NeedMore;
    };
    let header = header as u32;
    if header & BINARY_VERSION_MASK != BINARY_VERSION_1 {
        return ThriftParse::Error(format!("bad binary protocol header {:#010x}", header));
    }
    let Some(mtype) = MessageType::from_u8((header & 0xff) as u8) else {
        return ThriftParse::Error("unknown message type".into());
    };

    let Some(name_len) = r.i32() else {
        return ThriftParse::NeedMore;
    };
    if name_len < 0 || name_len as usize > MAX_METHOD_NAME {
        return ThriftParse::Error(format!("implausible method name length {}", name_len));
    }
    let Some(name_bytes) = r.take(name_len as usize) else {
        return ThriftParse::NeedMore;
    };
    let name = String::from_utf8_lossy(name_bytes).into_owned();
    let Some(seqid) = r.i32() else {
        return ThriftParse::NeedMore;
    };

    let Some((success, others)) = render_binary_struct(&mut r, limits, 0) else {
        return ThriftParse::NeedMore;
    };

    let msg = assemble(mtype, name, seqid, success, others, r.pos as u64);
    ThriftParse::Done(msg, r.pos)
}

/// Render a struct's fields; returns (field-0 rendering, other fields)
fn render_binary_struct(
    r: &mut BinReader<'_>,
    limits: Limits,
    depth: u8,
) -> Option<(Option<String>, Vec<(i16, String)>)> {
    if depth > 8 {
        return None;
    }
    let mut zero = None;
    let mut others = Vec::new();
    loop {
        let ftype = r.u8()?;
        if ftype == 0 {
            return Some((zero, others));
        }
        let fid = r.i16()?;
        let value = render_binary_value(r, ftype, limits, depth)?;
        if fid == 0 {
            zero = Some(value);
        } else {
            others.push((fid, value));
        }
    }
}

fn render_binary_value(
    r: &mut BinReader<'_>,
    ftype: u8,
    limits: Limits,
    depth: u8,
) -> Option<String> {
    match ftype {
        2 => Some(if r.u8()? != 0 { "true" } else { "false" }.to_string()),
        3 => Some(r.u8().map(|v| (v as i8).to_string())?),
        4 => {
            let bits = r.i64()?;
            Some(f64::from_bits(bits as u64).to_string())
        }
        6 => Some(r.i16()?.to_string()),
        8 => Some(r.i32()?.to_string()),
        10 => Some(r.i64()?.to_string()),
        11 => {
            let len = r.i32()?;
            if len < 0 {
                return None;
            }
            let bytes = r.take(len as usize)?;
            Some(render_string(bytes, limits.string_max))
        }
        12 => {
            let (zero, others) = render_binary_struct(r, limits, depth + 1)?;
            Some(render_struct(zero, others))
        }
        13 => {
            let ktype = r.u8()?;
            let vtype = r.u8()?;
            let count = r.i32()?;
            if count < 0 {
                return None;
            }
            let mut items = Vec::new();
            for i in 0..count as usize {
                let k = render_binary_value(r, ktype, limits, depth + 1)?;
                let v = render_binary_value(r, vtype, limits, depth + 1)?;
                if i < limits.collection_max {
                    items.push(format!("{}: {}", k, v));
                }
            }
            Some(render_collection("{", items, count as usize, limits, "}"))
        }
        14 | 15 => {
            let etype = r.u8()?;
            let count = r.i32()?;
            if count < 0 {
                return None;
            }
            let mut items = Vec::new();
            for i in 0..count as usize {
                let v = render_binary_value(r, etype, limits, depth + 1)?;
                if i < limits.collection_max {
                    items.push(v);
                }
            }
            Some(render_collection("[", items, count as usize, limits, "]"))
        }
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Compact protocol
// ---------------------------------------------------------------------------

struct CompactReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> CompactReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let slice = self.data.get(self.pos..self.pos + n)?;
        self.pos += n;
        Some(slice)
    }

    fn u8(&mut self) -> Option<u8> {
        Some(self.take(1)?[0])
    }

    fn varint(&mut self) -> Option<u64> {
        let mut value = 0u64;
        let mut shift = 0;
        loop {
            let byte = self.u8()?;
            value |= ((byte & 0x7f) as u64) << shift;
            if byte & 0x80 == 0 {
                return Some(value);
            }
            shift += 7;
            if shift > 63 {
                return None;
            }
        }
    }

    fn zigzag(&mut self) -> Option<i64> {
        let v = self.varint()?;
        Some(((v >> 1) as i64) ^ -((v & 1) as i64))
    }
}

fn parse_compact(window: &[u8], limits: Limits) -> ThriftParse {
    let mut r = CompactReader::new(window);
    let Some(_proto) = r.u8() else {
        return ThriftParse::NeedMore;
    };
    let Some(type_version) = r.u8() else {
        return ThriftParse::NeedMore;
    };
    if type_version & 0x1f != 1 {
        return ThriftParse::Error("bad compact protocol version".into());
    }
    let Some(mtype) = MessageType::from_u8(type_version >> 5) else {
        return ThriftParse::Error("unknown message type".into());
    };
    let Some(seqid) = r.varint() else {
        return ThriftParse::NeedMore;
    };
    let Some(name_len) = r.varint() else {
        return ThriftParse::NeedMore;
    };
    if name_len as usize > MAX_METHOD_NAME {
        return ThriftParse::Error(format!("implausible method name length {}", name_len));
    }
    let Some(name_bytes) = r.take(name_len as usize) else {
        return ThriftParse::NeedMore;
    };
    let name = String::from_utf8_lossy(name_bytes).into_owned();

    let Some((zero, others)) = render_compact_struct(&mut r, limits, 0) else {
        return ThriftParse::NeedMore;
    };

    let msg = assemble(mtype, name, seqid as i32, zero, others, r.pos as u64);
    ThriftParse::Done(msg, r.pos)
}

fn render_compact_struct(
    r: &mut CompactReader<'_>,
    limits: Limits,
    depth: u8,
) -> Option<(Option<String>, Vec<(i16, String)>)> {
    if depth > 8 {
        return None;
    }
    let mut zero = None;
    let mut others = Vec::new();
    let mut last_fid: i16 = 0;
    loop {
        let head = r.u8()?;
        if head == 0 {
            return Some((zero, others));
        }
        let delta = head >> 4;
        let ctype = head & 0x0f;
        let fid = if delta != 0 {
            last_fid + delta as i16
        } else {
            r.zigzag()? as i16
        };
        last_fid = fid;
        let value = render_compact_value(r, ctype, limits, depth)?;
        if fid == 0 {
            zero = Some(value);
        } else {
            others.push((fid, value));
        }
    }
}

fn render_compact_value(
    r: &mut CompactReader<'_>,
    ctype: u8,
    limits: Limits,
    depth: u8,
) -> Option<String> {
    match ctype {
        1 => Some("true".to_string()),
        2 => Some("false".to_string()),
        3 => Some((r.u8()? as i8).to_string()),
        4 | 5 | 6 => Some(r.zigzag()?.to_string()),
        7 => {
            let b = r.take(8)?;
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(b);
            Some(f64::from_le_bytes(bytes).to_string())
        }
        8 => {
            let len = r.varint()? as usize;
            let bytes = r.take(len)?;
            Some(render_string(bytes, limits.string_max))
        }
        9 | 10 => {
            let head = r.u8()?;
            let etype = head & 0x0f;
            let count = if head >> 4 == 0x0f {
                r.varint()? as usize
            } else {
                (head >> 4) as usize
            };
            let mut items = Vec::new();
            for i in 0..count {
                let v = render_compact_value(r, etype, limits, depth + 1)?;
                if i < limits.collection_max {
                    items.push(v);
                }
            }
            Some(render_collection("[", items, count, limits, "]"))
        }
        11 => {
            let count = r.varint()? as usize;
            if count == 0 {
                return Some("{}".to_string());
            }
            let kv = r.u8()?;
            let ktype = kv >> 4;
            let vtype = kv & 0x0f;
            let mut items = Vec::new();
            for i in 0..count {
                let k = render_compact_value(r, ktype, limits, depth + 1)?;
                let v = render_compact_value(r, vtype, limits, depth + 1)?;
                if i < limits.collection_max {
                    items.push(format!("{}: {}", k, v));
                }
            }
            Some(render_collection("{", items, count, limits, "}"))
        }
        12 => {
            let (zero, others) = render_compact_struct(r, limits, depth + 1)?;
            Some(render_struct(zero, others))
        }
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

fn assemble(
    mtype: MessageType,
    name: String,
    seqid: i32,
    zero: Option<String>,
    others: Vec<(i16, String)>,
    size: u64,
) -> ThriftMessage {
    let mut msg = ThriftMessage {
        mtype,
        name,
        seqid,
        params: None,
        returns: None,
        exceptions: None,
        size,
    };
    match mtype {
        MessageType::Call | MessageType::Oneway => {
            let mut fields = Vec::new();
            if let Some(z) = zero {
                fields.push((0i16, z));
            }
            fields.extend(others);
            msg.params = Some(render_fields(&fields));
        }
        MessageType::Reply => {
            msg.returns = zero;
            if !others.is_empty() {
                msg.exceptions = Some(
                    others
                        .iter()
                        .map(|(fid, v)| format!("{}: {}", fid, v))
                        .collect::<Vec<_>>()
                        .join("; "),
                );
            }
        }
        MessageType::Exception => {
            // TApplicationException: field 1 message, field 2 type
            let message = others
                .iter()
                .find(|(fid, _)| *fid == 1)
                .map(|(_, v)| v.clone())
                .unwrap_or_else(|| "unknown exception".to_string());
            msg.exceptions = Some(message);
        }
    }
    msg
}

fn render_fields(fields: &[(i16, String)]) -> String {
    let rendered: Vec<String> = fields
        .iter()
        .map(|(fid, v)| format!("{}: {}", fid, v))
        .collect();
    format!("({})", rendered.join(", "))
}

fn render_struct(zero: Option<String>, others: Vec<(i16, String)>) -> String {
    let mut fields = Vec::new();
    if let Some(z) = zero {
        fields.push((0i16, z));
    }
    fields.extend(others);
    render_fields(&fields)
}

fn render_string(bytes: &[u8], max: usize) -> String {
    let text = String::from_utf8_lossy(bytes);
    if text.len() > max {
        let truncated: String = text.chars().take(max).collect();
        format!("\"{}...\"", truncated)
    } else {
        format!("\"{}\"", text)
    }
}

fn render_collection(
    open: &str,
    items: Vec<String>,
    total: usize,
    limits: Limits,
    close: &str,
) -> String {
    let mut body = items.join(", ");
    if total > limits.collection_max {
        body.push_str(", ...");
    }
    format!("{}{}{}", open, body, close)
}

// ---------------------------------------------------------------------------
// Test fixtures
// ---------------------------------------------------------------------------

#[cfg(test)]
pub fn encode_binary_call(name: &str, seqid: i32, mtype: u8, fields: &[(i16, &str)]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&(BINARY_VERSION_1 | mtype as u32).to_be_bytes());
    buf.extend_from_slice(&(name.len() as i32).to_be_bytes());
    buf.extend_from_slice(name.as_bytes());
    buf.extend_from_slice(&seqid.to_be_bytes());
    for (fid, value) in fields {
        buf.push(11); // string
        buf.extend_from_slice(&fid.to_be_bytes());
        buf.extend_from_slice(&(value.len() as i32).to_be_bytes());
        buf.extend_from_slice(value.as_bytes());
    }
    buf.push(0); // stop
    buf
}

#[cfg(test)]
pub fn frame(inner: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + inner.len());
    buf.extend_from_slice(&(inner.len() as u32).to_be_bytes());
    buf.extend_from_slice(inner);
    buf
}
