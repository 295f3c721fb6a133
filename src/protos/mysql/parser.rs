//! MySQL wire format helpers
//!
//! The client/server protocol frames every packet as a 3-byte
//! little-endian length, a 1-byte sequence id, and the payload.

/// One framed MySQL packet
#[derive(Debug, Clone)]
pub struct MysqlFrame {
    pub seq: u8,
    pub payload: Vec<u8>,
    /// Bytes on the wire including the 4-byte header
    pub wire_len: usize,
}

/// Peel one frame off the window, if complete
pub fn read_frame(window: &[u8]) -> Option<MysqlFrame> {
    if window.len() < 4 {
        return None;
    }
    let len = u32::from_le_bytes([window[0], window[1], window[2], 0]) as usize;
    if window.len() < 4 + len {
        return None;
    }
    Some(MysqlFrame {
        seq: window[3],
        payload: window[4..4 + len].to_vec(),
        wire_len: 4 + len,
    })
}

/// Length-encoded integer, returning the value and bytes used
pub fn read_lenc_int(data: &[u8]) -> Option<(u64, usize)> {
    let first = *data.first()?;
    match first {
        0xfb => Some((0, 1)), // NULL marker; callers decide meaning
        0xfc => {
            if data.len() < 3 {
                return None;
            }
            Some((u16::from_le_bytes([data[1], data[2]]) as u64, 3))
        }
        0xfd => {
            if data.len() < 4 {
                return None;
            }
            Some((u32::from_le_bytes([data[1], data[2], data[3], 0]) as u64, 4))
        }
        0xfe => {
            if data.len() < 9 {
                return None;
            }
            Some((
                u64::from_le_bytes([
                    data[1], data[2], data[3], data[4], data[5], data[6], data[7], data[8],
                ]),
                9,
            ))
        }
        v => Some((v as u64, 1)),
    }
}

/// Parsed OK packet fields
#[derive(Debug, Clone, Default)]
pub struct OkPacket {
    pub affected_rows: u64,
    pub insert_id: u64,
}

/// Parse an OK packet payload (first byte 0x00)
pub fn parse_ok(payload: &[u8]) -> Option<OkPacket> {
    if payload.first() != Some(&0x00) {
        return None;
    }
    let (affected_rows, used) = read_lenc_int(&payload[1..])?;
    let (insert_id, _) = read_lenc_int(&payload[1 + used..])?;
    Some(OkPacket {
        affected_rows,
        insert_id,
    })
}

/// Parsed ERR packet fields
#[derive(Debug, Clone)]
pub struct ErrPacket {
    pub code: u16,
    pub message: String,
}

/// Parse an ERR packet payload (first byte 0xff)
pub fn parse_err(payload: &[u8]) -> Option<ErrPacket> {
    if payload.first() != Some(&0xff) || payload.len() < 3 {
        return None;
    }
    let code = u16::from_le_bytes([payload[1], payload[2]]);
    // Skip the '#' + 5-char sqlstate when present
    let msg_start = if payload.get(3) == Some(&b'#') && payload.len() >= 9 {
        9
    } else {
        3
    };
    let message = String::from_utf8_lossy(&payload[msg_start..]).into_owned();
    Some(ErrPacket { code, message })
}

/// An EOF packet is 0xfe with a short payload (longer ones are
/// length-encoded row data that happens to start with 0xfe)
pub fn is_eof(payload: &[u8]) -> bool {
    payload.first() == Some(&0xfe) && payload.len() < 9
}

/// First keyword of a query, uppercased: the record's `method`
pub fn query_method(query: &str) -> String {
    query
        .trim_start()
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_uppercase()
}

/// Command byte names for the commands the analyzer reports
pub const COM_QUERY: u8 = 0x03;
pub const COM_STMT_PREPARE: u8 = 0x16;
pub const COM_STMT_EXECUTE: u8 = 0x17;
pub const COM_QUIT: u8 = 0x01;

/// Frame a payload for tests and fixtures
#[cfg(test)]
pub fn encode_frame(seq: u8, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes()[..3]);
    buf.push(seq);
    buf.extend_from_slice(payload);
    buf
}
