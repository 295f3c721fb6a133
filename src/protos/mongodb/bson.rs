//! Minimal BSON reader
//!
//! Renders wire BSON documents into `serde_json::Value` for the published
//! record. Unknown element types render as placeholders rather than
//! failing the whole document.

use serde_json::{json, Map, Value};

/// Parse one BSON document; returns the value and its wire length
pub fn parse_document(data: &[u8]) -> Option<(Value, usize)> {
    if data.len() < 5 {
        return None;
    }
    let len = i32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
    if len < 5 || data.len() < len || data[len - 1] != 0 {
        return None;
    }

    let mut map = Map::new();
    let mut pos = 4;
    while pos < len - 1 {
        let etype = data[pos];
        pos += 1;
        let (name, used) = read_cstring(&data[pos..len - 1])?;
        pos += used;
        let (value, used) = parse_element(etype, &data[pos..len - 1])?;
        pos += used;
        map.insert(name, value);
    }

    Some((Value::Object(map), len))
}

fn parse_element(etype: u8, data: &[u8]) -> Option<(Value, usize)> {
    match etype {
        0x01 => {
            // double
            let bytes: [u8; 8] = data.get(..8)?.try_into().ok()?;
            Some((json!(f64::from_le_bytes(bytes)), 8))
        }
        0x02 => {
            // string: i32 length including NUL
            let len = i32::from_le_bytes(data.get(..4)?.try_into().ok()?) as usize;
            let bytes = data.get(4..4 + len)?;
            let text = String::from_utf8_lossy(&bytes[..len.saturating_sub(1)]).into_owned();
            Some((Value::from(text), 4 + len))
        }
        0x03 => {
            // embedded document
            let (doc, used) = parse_document(data)?;
            Some((doc, used))
        }
        0x04 => {
            // array: a document with numeric keys
            let (doc, used) = parse_document(data)?;
            let items: Vec<Value> = match doc {
                Value::Object(map) => map.into_iter().map(|(_, v)| v).collect(),
                _ => Vec::new(),
            };
            Some((Value::Array(items), used))
        }
        0x05 => {
            // binary: i32 length + subtype + bytes
            let len = i32::from_le_bytes(data.get(..4)?.try_into().ok()?) as usize;
            data.get(5..5 + len)?;
            Some((Value::from(format!("<binary of {} bytes>", len)), 5 + len))
        }
        0x06 | 0x0a => Some((Value::Null, 0)), // undefined / null
        0x07 => {
            // ObjectId: 12 bytes rendered as hex
            let bytes = data.get(..12)?;
            let hex: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
            Some((Value::from(hex), 12))
        }
        0x08 => Some((Value::from(*data.first()? != 0), 1)),
        0x09 | 0x11 | 0x12 => {
            // datetime / timestamp / int64
            let bytes: [u8; 8] = data.get(..8)?.try_into().ok()?;
            Some((json!(i64::from_le_bytes(bytes)), 8))
        }
        0x0b => {
            // regex: two cstrings
            let (pattern, used1) = read_cstring(data)?;
            let (options, used2) = read_cstring(&data[used1..])?;
            Some((
                Value::from(format!("/{}/{}", pattern, options)),
                used1 + used2,
            ))
        }
        0x10 => {
            let bytes: [u8; 4] = data.get(..4)?.try_into().ok()?;
            Some((json!(i32::from_le_bytes(bytes)), 4))
        }
        0x13 => {
            // decimal128, rendered opaquely
            data.get(..16)?;
            Some((Value::from("<decimal128>"), 16))
        }
        0xff | 0x7f => Some((Value::Null, 0)), // min/max key
        _ => None,
    }
}

fn read_cstring(data: &[u8]) -> Option<(String, usize)> {
    let end = data.iter().position(|&b| b == 0)?;
    Some((String::from_utf8_lossy(&data[..end]).into_owned(), end + 1))
}

/// Encode a flat document for tests and fixtures
#[cfg(test)]
pub fn encode_document(pairs: &[(&str, Value)]) -> Vec<u8> {
    let mut body = Vec::new();
    for (name, value) in pairs {
        match value {
            Value::String(s) => {
                body.push(0x02);
                body.extend_from_slice(name.as_bytes());
                body.push(0);
                body.extend_from_slice(&((s.len() + 1) as i32).to_le_bytes());
                body.extend_from_slice(s.as_bytes());
                body.push(0);
            }
            Value::Number(n) if n.is_i64() => {
                body.push(0x12);
                body.extend_from_slice(name.as_bytes());
                body.push(0);
                body.extend_from_slice(&n.as_i64().unwrap().to_le_bytes());
            }
            Value::Number(n) => {
                body.push(0x01);
                body.extend_from_slice(name.as_bytes());
                body.push(0);
                body.extend_from_slice(&n.as_f64().unwrap().to_le_bytes());
            }
            Value::Bool(b) => {
                body.push(0x08);
                body.extend_from_slice(name.as_bytes());
                body.push(0);
                body.push(*b as u8);
            }
            _ => unimplemented!("fixture type"),
        }
    }
    let mut doc = Vec::with_capacity(body.len() + 5);
    doc.extend_from_slice(&((body.len() + 5) as i32).to_le_bytes());
    doc.extend_from_slice(&body);
    doc.push(0);
    doc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_and_int() {
        let doc = encode_document(&[
            ("name", Value::from("apptap")),
            ("count", json!(42i64)),
        ]);
        let (value, used) = parse_document(&doc).unwrap();
        assert_eq!(used, doc.len());
        assert_eq!(value["name"], "apptap");
        assert_eq!(value["count"], 42);
    }

    #[test]
    fn test_bool_and_double() {
        let doc = encode_document(&[("ok", json!(1.0)), ("flag", Value::from(true))]);
        let (value, _) = parse_document(&doc).unwrap();
        assert_eq!(value["ok"], 1.0);
        assert_eq!(value["flag"], true);
    }

    #[test]
    fn test_truncated_rejected() {
        let doc = encode_document(&[("x", json!(1i64))]);
        assert!(parse_document(&doc[..doc.len() - 2]).is_none());
    }

    #[test]
    fn test_empty_document() {
        let doc = encode_document(&[]);
        let (value, used) = parse_document(&doc).unwrap();
        assert_eq!(used, 5);
        assert_eq!(value, json!({}));
    }
}
