//! Memcache binary protocol parsing
//!
//! 24-byte header: magic, opcode, key length, extras length, data type,
//! vbucket/status, total body length, opaque, cas. Requests carry magic
//! 0x80, responses 0x81; correlation uses the opaque field.

pub const MAGIC_REQUEST: u8 = 0x80;
pub const MAGIC_RESPONSE: u8 = 0x81;

/// One parsed binary packet
#[derive(Debug, Clone)]
pub struct BinPacket {
    pub is_request: bool,
    pub opcode: u8,
    /// Status on responses, vbucket on requests
    pub status: u16,
    pub opaque: u32,
    pub cas: u64,
    pub key: String,
    pub extras: Vec<u8>,
    pub value_len: u64,
    /// Wire size including the header
    pub size: u64,
}

/// Parse outcome
pub enum BinParse {
    Done(BinPacket, usize),
    NeedMore,
    Error(String),
}

pub fn parse_packet(window: &[u8], max_message: usize) -> BinParse {
    if window.len() < 24 {
        return BinParse::NeedMore;
    }
    let magic = window[0];
    if magic != MAGIC_REQUEST && magic != MAGIC_RESPONSE {
        return BinParse::Error(format!("bad magic {:#04x}", magic));
    }
    let opcode = window[1];
    let key_len = u16::from_be_bytes([window[2], window[3]]) as usize;
    let extras_len = window[4] as usize;
    let status = u16::from_be_bytes([window[6], window[7]]);
    let body_len = u32::from_be_bytes([window[8], window[9], window[10], window[11]]) as usize;
    let opaque = u32::from_be_bytes([window[12], window[13], window[14], window[15]]);
    let cas = u64::from_be_bytes([
        window[16], window[17], window[18], window[19], window[20], window[21], window[22],
        window[23],
    ]);

    if body_len > max_message || key_len + extras_len > body_len {
        return BinParse::Error("inconsistent binary header".into());
    }
    let total = 24 + body_len;
    if window.len() < total {
        return BinParse::NeedMore;
    }

    let extras = window[24..24 + extras_len].to_vec();
    let key_start = 24 + extras_len;
    let key = String::from_utf8_lossy(&window[key_start..key_start + key_len]).into_owned();
    let value_len = (body_len - key_len - extras_len) as u64;

    BinParse::Done(
        BinPacket {
            is_request: magic == MAGIC_REQUEST,
            opcode,
            status,
            opaque,
            cas,
            key,
            extras,
            value_len,
            size: total as u64,
        },
        total,
    )
}

/// Quiet opcodes get no response on success (or miss, for gets)
pub fn is_quiet(opcode: u8) -> bool {
    matches!(
        opcode,
        0x09 | 0x0d | 0x11 | 0x12 | 0x13 | 0x14 | 0x15 | 0x16 | 0x17 | 0x19 | 0x1a | 0x1b | 0x1e
    )
}

/// Opcode mnemonic
pub fn opcode_name(opcode: u8) -> &'static str {
    match opcode {
        0x00 => "get",
        0x01 => "set",
        0x02 => "add",
        0x03 => "replace",
        0x04 => "delete",
        0x05 => "incr",
        0x06 => "decr",
        0x07 => "quit",
        0x08 => "flush",
        0x09 => "getq",
        0x0a => "noop",
        0x0b => "version",
        0x0c => "getk",
        0x0d => "getkq",
        0x0e => "append",
        0x0f => "prepend",
        0x10 => "stat",
        0x11 => "setq",
        0x12 => "addq",
        0x13 => "replaceq",
        0x14 => "deleteq",
        0x15 => "incrq",
        0x16 => "decrq",
        0x17 => "quitq",
        0x18 => "flushq",
        0x19 => "appendq",
        0x1a => "prependq",
        0x1c => "touch",
        0x1d => "gat",
        0x1e => "gatq",
        0x20 => "sasl_list_mechs",
        0x21 => "sasl_auth",
        0x22 => "sasl_step",
        _ => "unknown",
    }
}

/// Response status names
pub fn status_name(status: u16) -> &'static str {
    match status {
        0x0000 => "Success",
        0x0001 => "KeyNotFound",
        0x0002 => "KeyExists",
        0x0003 => "ValueTooLarge",
        0x0004 => "InvalidArguments",
        0x0005 => "ItemNotStored",
        0x0006 => "NonNumericValue",
        0x0020 => "AuthError",
        0x0081 => "UnknownCommand",
        0x0082 => "OutOfMemory",
        _ => "Unknown",
    }
}

/// Encode a packet for tests and fixtures
#[cfg(test)]
pub fn encode_packet(
    magic: u8,
    opcode: u8,
    status: u16,
    opaque: u32,
    key: &str,
    extras: &[u8],
    value: &[u8],
) -> Vec<u8> {
    let body_len = extras.len() + key.len() + value.len();
    let mut buf = Vec::with_capacity(24 + body_len);
    buf.push(magic);
    buf.push(opcode);
    buf.extend_from_slice(&(key.len() as u16).to_be_bytes());
    buf.push(extras.len() as u8);
    buf.push(0); // data type
    buf.extend_from_slice(&status.to_be_bytes());
    buf.extend_from_slice(&(body_len as u32).to_be_bytes());
    buf.extend_from_slice(&opaque.to_be_bytes());
    buf.extend_from_slice(&0u64.to_be_bytes());
    buf.extend_from_slice(extras);
    buf.extend_from_slice(key.as_bytes());
    buf.extend_from_slice(value);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_roundtrip() {
        let wire = encode_packet(MAGIC_REQUEST, 0x00, 0, 7, "key1", &[], &[]);
        let BinParse::Done(pkt, used) = parse_packet(&wire, 1 << 20) else {
            panic!("expected parse");
        };
        assert!(pkt.is_request);
        assert_eq!(pkt.opcode, 0x00);
        assert_eq!(pkt.opaque, 7);
        assert_eq!(pkt.key, "key1");
        assert_eq!(used, wire.len());
    }

    #[test]
    fn test_incomplete_packet() {
        let wire = encode_packet(MAGIC_REQUEST, 0x00, 0, 7, "key1", &[], &[]);
        assert!(matches!(
            parse_packet(&wire[..wire.len() - 1], 1 << 20),
            BinParse::NeedMore
        ));
    }

    #[test]
    fn test_bad_magic() {
        assert!(matches!(
            parse_packet(&[0x55; 24], 1 << 20),
            BinParse::Error(_)
        ));
    }

    #[test]
    fn test_quiet_opcodes() {
        assert!(is_quiet(0x09)); // getq
        assert!(is_quiet(0x11)); // setq
        assert!(!is_quiet(0x00)); // get
        assert!(!is_quiet(0x01)); // set
    }

    #[test]
    fn test_names() {
        assert_eq!(opcode_name(0x09), "getq");
        assert_eq!(status_name(0), "Success");
        assert_eq!(status_name(1), "KeyNotFound");
    }
}
