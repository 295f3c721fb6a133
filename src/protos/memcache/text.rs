//! Memcache text protocol parsing

/// A parsed text-protocol request
#[derive(Debug, Clone)]
pub struct TextRequest {
    pub command: String,
    pub keys: Vec<String>,
    pub flags: Option<u32>,
    pub exptime: Option<i64>,
    pub bytes: Option<u64>,
    pub cas: Option<u64>,
    pub noreply: bool,
    /// Wire size including the data block
    pub size: u64,
}

/// A parsed text-protocol response
#[derive(Debug, Clone)]
pub struct TextResponse {
    /// First token of the terminating line (STORED, END, ERROR, ...)
    pub status: String,
    /// Values returned by a get/gets
    pub values: Vec<TextValue>,
    pub error: Option<String>,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct TextValue {
    pub key: String,
    pub flags: u32,
    pub bytes: u64,
    pub cas: Option<u64>,
    pub data: Vec<u8>,
}

/// Commands followed by a data block: key flags exptime bytes [noreply]
const STORAGE_COMMANDS: [&str; 6] = ["set", "add", "replace", "append", "prepend", "cas"];

/// Parse outcome
pub enum TextParse<T> {
    Done(T, usize),
    NeedMore,
    Error(String),
}

fn find_line(window: &[u8]) -> Option<usize> {
    window.windows(2).position(|w| w == b"\r\n")
}

/// True when the first line looks like a printable ASCII command
pub fn looks_like_text(window: &[u8]) -> bool {
    window
        .first()
        .map(|&b| b.is_ascii_lowercase() || b.is_ascii_uppercase())
        .unwrap_or(false)
}

/// Parse one request off the window
pub fn parse_request(window: &[u8]) -> TextParse<TextRequest> {
    let Some(line_end) = find_line(window) else {
        return TextParse::NeedMore;
    };
    let line = String::from_utf8_lossy(&window[..line_end]).into_owned();
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let Some(&command) = tokens.first() else {
        return TextParse::Error("empty command line".into());
    };
    let command = command.to_lowercase();
    let noreply = tokens.last() == Some(&"noreply");

    let mut request = TextRequest {
        command: command.clone(),
        keys: Vec::new(),
        flags: None,
        exptime: None,
        bytes: None,
        cas: None,
        noreply,
        size: (line_end + 2) as u64,
    };

    if STORAGE_COMMANDS.contains(&command.as_str()) {
        if tokens.len() < 5 {
            return TextParse::Error(format!("short {} command", command));
        }
        request.keys.push(tokens[1].to_string());
        request.flags = tokens[2].parse().ok();
        request.exptime = tokens[3].parse().ok();
        let Some(bytes) = tokens[4].parse::<u64>().ok() else {
            return TextParse::Error("bad byte count".into());
        };
        request.bytes = Some(bytes);
        if command == "cas" {
            request.cas = tokens.get(5).and_then(|t| t.parse().ok());
        }

        // The data block plus its CRLF follows the command line
        let total = line_end + 2 + bytes as usize + 2;
        if window.len() < total {
            return TextParse::NeedMore;
        }
        request.size = total as u64;
        TextParse::Done(request, total)
    } else {
        match command.as_str() {
            "get" | "gets" => {
                request.keys = tokens[1..].iter().map(|t| t.to_string()).collect();
            }
            "delete" | "touch" | "incr" | "decr" => {
                if let Some(key) = tokens.get(1) {
                    request.keys.push(key.to_string());
                }
            }
            _ => {}
        }
        TextParse::Done(request, line_end + 2)
    }
}

/// Parse one response off the window
pub fn parse_response(window: &[u8], max_value: usize) -> TextParse<TextResponse> {
    let mut pos = 0;
    let mut values = Vec::new();

    loop {
        let Some(line_end) = find_line(&window[pos..]) else {
            return TextParse::NeedMore;
        };
        let line = String::from_utf8_lossy(&window[pos..pos + line_end]).into_owned();
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some(&first) = tokens.first() else {
            return TextParse::Error("empty response line".into());
        };

        match first {
            "VALUE" => {
                if tokens.len() < 4 {
                    return TextParse::Error("short VALUE line".into());
                }
                let Ok(bytes) = tokens[3].parse::<u64>() else {
                    return TextParse::Error("bad VALUE byte count".into());
                };
                let data_start = pos + line_end + 2;
                let data_end = data_start + bytes as usize;
                if window.len() < data_end + 2 {
                    return TextParse::NeedMore;
                }
                let keep = (bytes as usize).min(max_value);
                values.push(TextValue {
                    key: tokens[1].to_string(),
                    flags: tokens[2].parse().unwrap_or(0),
                    bytes,
                    cas: tokens.get(4).and_then(|t| t.parse().ok()),
                    data: window[data_start..data_start + keep].to_vec(),
                });
                pos = data_end + 2;
            }
            "STAT" => {
                pos += line_end + 2;
            }
            "END" => {
                let total = pos + line_end + 2;
                return TextParse::Done(
                    TextResponse {
                        status: "END".into(),
                        values,
                        error: None,
                        size: total as u64,
                    },
                    total,
                );
            }
            "ERROR" | "CLIENT_ERROR" | "SERVER_ERROR" => {
                let total = pos + line_end + 2;
                return TextParse::Done(
                    TextResponse {
                        status: first.to_string(),
                        values,
                        error: Some(line.clone()),
                        size: total as u64,
                    },
                    total,
                );
            }
            _ => {
                // Single-line reply: STORED, DELETED, NOT_FOUND, VERSION,
                // TOUCHED, a counter value, ...
                let total = pos + line_end + 2;
                return TextParse::Done(
                    TextResponse {
                        status: first.to_string(),
                        values,
                        error: None,
                        size: total as u64,
                    },
                    total,
                );
            }
        }
    }
}
