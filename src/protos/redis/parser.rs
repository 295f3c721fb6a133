//! RESP (REdis Serialization Protocol) value parser
//!
//! Parses one complete value out of a byte window: `+` simple string,
//! `-` error, `:` integer, `$` bulk string, `*` array. Inline commands
//! (bare text lines) are accepted on the request side.

/// A parsed RESP value
#[derive(Debug, Clone, PartialEq)]
pub enum RespValue {
    Simple(String),
    Error(String),
    Integer(i64),
    /// `None` is the null bulk string (`$-1`)
    Bulk(Option<Vec<u8>>),
    /// `None` is the null array (`*-1`)
    Array(Option<Vec<RespValue>>),
    /// Inline command line, already split on whitespace
    Inline(Vec<String>),
}

impl RespValue {
    /// Render for the published record, bounded by `max_len` characters
    pub fn render(&self, max_len: usize) -> String {
        let full = match self {
            RespValue::Simple(s) => s.clone(),
            RespValue::Error(e) => e.clone(),
            RespValue::Integer(n) => n.to_string(),
            RespValue::Bulk(Some(bytes)) => String::from_utf8_lossy(bytes).into_owned(),
            RespValue::Bulk(None) => "nil".to_string(),
            RespValue::Array(Some(items)) => {
                let rendered: Vec<String> = items.iter().map(|v| v.render(max_len)).collect();
                format!("[{}]", rendered.join(", "))
            }
            RespValue::Array(None) => "nil".to_string(),
            RespValue::Inline(parts) => parts.join(" "),
        };
        if full.len() > max_len {
            let mut truncated: String = full.chars().take(max_len).collect();
            truncated.push_str("...");
            truncated
        } else {
            full
        }
    }

    /// The command vector of a request value, if it is one
    pub fn as_command(&self) -> Option<Vec<String>> {
        match self {
            RespValue::Array(Some(items)) => {
                let mut parts = Vec::with_capacity(items.len());
                for item in items {
                    match item {
                        RespValue::Bulk(Some(bytes)) => {
                            parts.push(String::from_utf8_lossy(bytes).into_owned())
                        }
                        _ => return None,
                    }
                }
                if parts.is_empty() {
                    None
                } else {
                    Some(parts)
                }
            }
            RespValue::Inline(parts) if !parts.is_empty() => Some(parts.clone()),
            _ => None,
        }
    }
}

/// Parse outcome: the value and how many bytes it occupied
pub type Parsed = (RespValue, usize);

/// Attempt to parse one RESP value from the window.
///
/// `Ok(None)` means the value is incomplete; feed more bytes and retry.
pub fn parse_value(window: &[u8], allow_inline: bool) -> Result<Option<Parsed>, String> {
    let Some(&first) = window.first() else {
        return Ok(None);
    };

    match first {
        b'+' | b'-' | b':' => {
            let Some(line_end) = find_crlf(window) else {
                return Ok(None);
            };
            let text = String::from_utf8_lossy(&window[1..line_end]).into_owned();
            let used = line_end + 2;
            let value = match first {
                b'+' => RespValue::Simple(text),
                b'-' => RespValue::Error(text),
                _ => RespValue::Integer(
                    text.parse::<i64>()
                        .map_err(|_| format!("bad integer {:?}", text))?,
                ),
            };
            Ok(Some((value, used)))
        }
        b'$' => {
            let Some(line_end) = find_crlf(window) else {
                return Ok(None);
            };
            let len: i64 = String::from_utf8_lossy(&window[1..line_end])
                .parse()
                .map_err(|_| "bad bulk length")?;
            let header = line_end + 2;
            if len < 0 {
                return Ok(Some((RespValue::Bulk(None), header)));
            }
            let len = len as usize;
            if window.len() < header + len + 2 {
                return Ok(None);
            }
            let bytes = window[header..header + len].to_vec();
            Ok(Some((RespValue::Bulk(Some(bytes)), header + len + 2)))
        }
        b'*' => {
            let Some(line_end) = find_crlf(window) else {
                return Ok(None);
            };
            let count: i64 = String::from_utf8_lossy(&window[1..line_end])
                .parse()
                .map_err(|_| "bad array length")?;
            let mut used = line_end + 2;
            if count < 0 {
                return Ok(Some((RespValue::Array(None), used)));
            }
            let mut items = Vec::with_capacity(count as usize);
            for _ in 0..count {
                match parse_value(&window[used..], false)? {
                    Some((value, n)) => {
                        items.push(value);
                        used += n;
                    }
                    None => return Ok(None),
                }
            }
            Ok(Some((RespValue::Array(Some(items)), used)))
        }
        _ if allow_inline => {
            let Some(line_end) = find_crlf(window) else {
                return Ok(None);
            };
            let text = String::from_utf8_lossy(&window[..line_end]);
            let parts: Vec<String> = text.split_whitespace().map(str::to_string).collect();
            if parts.is_empty() {
                return Err("empty inline command".into());
            }
            Ok(Some((RespValue::Inline(parts), line_end + 2)))
        }
        other => Err(format!("unexpected RESP type byte 0x{:02x}", other)),
    }
}

fn find_crlf(window: &[u8]) -> Option<usize> {
    window.windows(2).position(|w| w == b"\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_string() {
        let (value, used) = parse_value(b"+OK\r\n", false).unwrap().unwrap();
        assert_eq!(value, RespValue::Simple("OK".into()));
        assert_eq!(used, 5);
    }

    #[test]
    fn test_error() {
        let (value, _) = parse_value(b"-ERR unknown command\r\n", false)
            .unwrap()
            .unwrap();
        assert_eq!(value, RespValue::Error("ERR unknown command".into()));
    }

    #[test]
    fn test_integer() {
        let (value, _) = parse_value(b":1000\r\n", false).unwrap().unwrap();
        assert_eq!(value, RespValue::Integer(1000));
    }

    #[test]
    fn test_bulk_and_null_bulk() {
        let (value, used) = parse_value(b"$5\r\nhello\r\n", false).unwrap().unwrap();
        assert_eq!(value, RespValue::Bulk(Some(b"hello".to_vec())));
        assert_eq!(used, 11);

        let (value, _) = parse_value(b"$-1\r\n", false).unwrap().unwrap();
        assert_eq!(value, RespValue::Bulk(None));
    }

    #[test]
    fn test_command_array() {
        let wire = b"*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n";
        let (value, used) = parse_value(wire, false).unwrap().unwrap();
        assert_eq!(used, wire.len());
        assert_eq!(
            value.as_command().unwrap(),
            vec!["GET".to_string(), "foo".to_string()]
        );
    }

    #[test]
    fn test_incomplete_returns_none() {
        assert!(parse_value(b"*2\r\n$3\r\nGE", false).unwrap().is_none());
        assert!(parse_value(b"$10\r\nshort\r\n", false).unwrap().is_none());
        assert!(parse_value(b"+OK", false).unwrap().is_none());
    }

    #[test]
    fn test_inline_command() {
        let (value, used) = parse_value(b"PING\r\n", true).unwrap().unwrap();
        assert_eq!(value.as_command().unwrap(), vec!["PING".to_string()]);
        assert_eq!(used, 6);
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(parse_value(b"\x00\x01\r\n", false).is_err());
    }

    #[test]
    fn test_render_truncates() {
        let value = RespValue::Bulk(Some(vec![b'x'; 100]));
        let rendered = value.render(10);
        assert_eq!(rendered, "xxxxxxxxxx...");
    }
}
