//! PostgreSQL wire format helpers
//!
//! After startup, every message is a 1-byte type plus a 4-byte big-endian
//! length that counts itself but not the type byte.

/// One framed backend/frontend message
#[derive(Debug, Clone)]
pub struct PgMessage {
    pub mtype: u8,
    pub payload: Vec<u8>,
    /// Bytes on the wire including type byte and length field
    pub wire_len: usize,
}

/// Peel one typed message off the window, if complete
pub fn read_message(window: &[u8]) -> Option<PgMessage> {
    if window.len() < 5 {
        return None;
    }
    let mtype = window[0];
    let len = u32::from_be_bytes([window[1], window[2], window[3], window[4]]) as usize;
    if len < 4 {
        return None;
    }
    let total = 1 + len;
    if window.len() < total {
        return None;
    }
    Some(PgMessage {
        mtype,
        payload: window[5..total].to_vec(),
        wire_len: total,
    })
}

/// Startup-phase messages carry no type byte; returns (code, wire_len)
pub fn read_startup(window: &[u8]) -> Option<(u32, usize)> {
    if window.len() < 8 {
        return None;
    }
    let len = u32::from_be_bytes([window[0], window[1], window[2], window[3]]) as usize;
    if len < 8 {
        return None;
    }
    let code = u32::from_be_bytes([window[4], window[5], window[6], window[7]]);
    if window.len() < len {
        return None;
    }
    Some((code, len))
}

/// Protocol version 3.0 in startup packet
pub const PROTO_V3: u32 = 0x0003_0000;
/// SSLRequest magic
pub const SSL_REQUEST: u32 = 80877103;
/// CancelRequest magic
pub const CANCEL_REQUEST: u32 = 80877102;

/// A decoded ErrorResponse
#[derive(Debug, Clone, Default)]
pub struct PgError {
    pub severity: String,
    pub code: String,
    pub message: String,
}

/// Parse ErrorResponse fields: (tag byte, C string) pairs until NUL
pub fn parse_error_fields(payload: &[u8]) -> PgError {
    let mut error = PgError::default();
    let mut pos = 0;
    while pos < payload.len() {
        let tag = payload[pos];
        if tag == 0 {
            break;
        }
        pos += 1;
        let end = payload[pos..]
            .iter()
            .position(|&b| b == 0)
            .map(|p| pos + p)
            .unwrap_or(payload.len());
        let value = String::from_utf8_lossy(&payload[pos..end]).into_owned();
        match tag {
            b'S' => error.severity = value,
            b'C' => error.code = value,
            b'M' => error.message = value,
            _ => {}
        }
        pos = end + 1;
    }
    error
}

/// NUL-terminated string at the start of the payload
pub fn read_cstring(payload: &[u8]) -> Option<(String, usize)> {
    let end = payload.iter().position(|&b| b == 0)?;
    Some((
        String::from_utf8_lossy(&payload[..end]).into_owned(),
        end + 1,
    ))
}

/// Frame a typed message for tests and fixtures
#[cfg(test)]
pub fn encode_message(mtype: u8, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(5 + payload.len());
    buf.push(mtype);
    buf.extend_from_slice(&((payload.len() + 4) as u32).to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_roundtrip() {
        let wire = encode_message(b'Q', b"SELECT 1\0");
        let msg = read_message(&wire).unwrap();
        assert_eq!(msg.mtype, b'Q');
        assert_eq!(msg.payload, b"SELECT 1\0");
        assert_eq!(msg.wire_len, wire.len());

        assert!(read_message(&wire[..wire.len() - 1]).is_none());
    }

    #[test]
    fn test_startup_detection() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&16u32.to_be_bytes());
        wire.extend_from_slice(&PROTO_V3.to_be_bytes());
        wire.extend_from_slice(b"user\0pg\0");
        let (code, len) = read_startup(&wire).unwrap();
        assert_eq!(code, PROTO_V3);
        assert_eq!(len, 16);
    }

    #[test]
    fn test_error_fields() {
        let mut payload = Vec::new();
        payload.extend_from_slice(b"SERROR\0");
        payload.extend_from_slice(b"C42P01\0");
        payload.extend_from_slice(b"Mrelation \"bad\" does not exist\0");
        payload.push(0);
        let err = parse_error_fields(&payload);
        assert_eq!(err.severity, "ERROR");
        assert_eq!(err.code, "42P01");
        assert_eq!(err.message, "relation \"bad\" does not exist");
    }

    #[test]
    fn test_cstring() {
        let (s, used) = read_cstring(b"hello\0rest").unwrap();
        assert_eq!(s, "hello");
        assert_eq!(used, 6);
        assert!(read_cstring(b"unterminated").is_none());
    }
}
