//! DNS wire decoding
//!
//! Decodes the header, question section, and resource records, including
//! compressed names. One UDP datagram is one message; over TCP a 2-byte
//! length prefix frames each message.

use std::net::{Ipv4Addr, Ipv6Addr};

use super::types::*;

/// Longest name we will follow through compression pointers
const MAX_NAME_LEN: usize = 255;

/// Decode one DNS message from a complete payload
pub fn parse_message(payload: &[u8]) -> Option<DnsMessage> {
    if payload.len() < 12 {
        return None;
    }

    let id = u16::from_be_bytes([payload[0], payload[1]]);
    let flags = u16::from_be_bytes([payload[2], payload[3]]);

    let mut msg = DnsMessage {
        id,
        is_response: (flags & 0x8000) != 0,
        opcode: ((flags >> 11) & 0x0f) as u8,
        authoritative: (flags & 0x0400) != 0,
        truncated: (flags & 0x0200) != 0,
        recursion_desired: (flags & 0x0100) != 0,
        recursion_available: (flags & 0x0080) != 0,
        rcode: (flags & 0x000f) as u8,
        size: payload.len(),
        ..Default::default()
    };

    let qdcount = u16::from_be_bytes([payload[4], payload[5]]) as usize;
    let ancount = u16::from_be_bytes([payload[6], payload[7]]) as usize;
    let nscount = u16::from_be_bytes([payload[8], payload[9]]) as usize;
    let arcount = u16::from_be_bytes([payload[10], payload[11]]) as usize;

    let mut offset = 12;

    for _ in 0..qdcount {
        let (query, next) = parse_question(payload, offset)?;
        msg.queries.push(query);
        offset = next;
    }
    for _ in 0..ancount {
        let (rr, next) = parse_resource_record(payload, offset)?;
        msg.answers.push(rr);
        offset = next;
    }
    for _ in 0..nscount {
        let (rr, next) = parse_resource_record(payload, offset)?;
        msg.authorities.push(rr);
        offset = next;
    }
    for _ in 0..arcount {
        let (rr, next) = parse_resource_record(payload, offset)?;
        msg.additionals.push(rr);
        offset = next;
    }

    Some(msg)
}

fn parse_question(payload: &[u8], offset: usize) -> Option<(DnsQuery, usize)> {
    let (name, offset) = parse_name(payload, offset)?;
    if offset + 4 > payload.len() {
        return None;
    }
    let qtype = u16::from_be_bytes([payload[offset], payload[offset + 1]]);
    let qclass = u16::from_be_bytes([payload[offset + 2], payload[offset + 3]]);
    Some((
        DnsQuery {
            name,
            qtype: DnsRecordType::from(qtype),
            qclass,
        },
        offset + 4,
    ))
}

fn parse_resource_record(payload: &[u8], offset: usize) -> Option<(DnsAnswer, usize)> {
    let (name, offset) = parse_name(payload, offset)?;
    if offset + 10 > payload.len() {
        return None;
    }

    let rtype = u16::from_be_bytes([payload[offset], payload[offset + 1]]);
    let rclass = u16::from_be_bytes([payload[offset + 2], payload[offset + 3]]);
    let ttl = u32::from_be_bytes([
        payload[offset + 4],
        payload[offset + 5],
        payload[offset + 6],
        payload[offset + 7],
    ]);
    let rdlength = u16::from_be_bytes([payload[offset + 8], payload[offset + 9]]) as usize;

    let rdata_offset = offset + 10;
    if rdata_offset + rdlength > payload.len() {
        return None;
    }

    let rtype = DnsRecordType::from(rtype);
    let rdata = parse_rdata(payload, rdata_offset, rdlength, rtype);

    Some((
        DnsAnswer {
            name,
            rtype,
            rclass,
            ttl,
            rdata,
        },
        rdata_offset + rdlength,
    ))
}

fn parse_rdata(payload: &[u8], offset: usize, len: usize, rtype: DnsRecordType) -> DnsRdata {
    let data = &payload[offset..offset + len];
    match rtype {
        DnsRecordType::A if len == 4 => {
            DnsRdata::A(Ipv4Addr::new(data[0], data[1], data[2], data[3]))
        }
        DnsRecordType::AAAA if len == 16 => {
            let mut bytes = [0u8; 16];
            bytes.copy_from_slice(data);
            DnsRdata::AAAA(Ipv6Addr::from(bytes))
        }
        DnsRecordType::CNAME => match parse_name(payload, offset) {
            Some((name, _)) => DnsRdata::CNAME(name),
            None => DnsRdata::Unknown(data.to_vec()),
        },
        DnsRecordType::NS => match parse_name(payload, offset) {
            Some((name, _)) => DnsRdata::NS(name),
            None => DnsRdata::Unknown(data.to_vec()),
        },
        DnsRecordType::PTR => match parse_name(payload, offset) {
            Some((name, _)) => DnsRdata::PTR(name),
            None => DnsRdata::Unknown(data.to_vec()),
        },
        DnsRecordType::MX if len >= 3 => {
            let preference = u16::from_be_bytes([data[0], data[1]]);
            match parse_name(payload, offset + 2) {
                Some((exchange, _)) => DnsRdata::MX {
                    preference,
                    exchange,
                },
                None => DnsRdata::Unknown(data.to_vec()),
            }
        }
        DnsRecordType::TXT => {
            // Sequence of length-prefixed character strings
            let mut text = String::new();
            let mut pos = 0;
            while pos < data.len() {
                let slen = data[pos] as usize;
                pos += 1;
                if pos + slen > data.len() {
                    break;
                }
                text.push_str(&String::from_utf8_lossy(&data[pos..pos + slen]));
                pos += slen;
            }
            DnsRdata::TXT(text)
        }
        DnsRecordType::SRV if len >= 7 => {
            let priority = u16::from_be_bytes([data[0], data[1]]);
            let weight = u16::from_be_bytes([data[2], data[3]]);
            let port = u16::from_be_bytes([data[4], data[5]]);
            match parse_name(payload, offset + 6) {
                Some((target, _)) => DnsRdata::SRV {
                    priority,
                    weight,
                    port,
                    target,
                },
                None => DnsRdata::Unknown(data.to_vec()),
            }
        }
        _ => DnsRdata::Unknown(data.to_vec()),
    }
}

/// Decode a possibly-compressed name starting at `offset`.
///
/// Returns the dotted name and the offset just past the name in the
/// original (non-pointer) position.
fn parse_name(payload: &[u8], mut offset: usize) -> Option<(String, usize)> {
    let mut name = String::new();
    let mut jumped = false;
    let mut end_offset = offset;
    let mut hops = 0;

    loop {
        let len = *payload.get(offset)? as usize;

        if len & 0xc0 == 0xc0 {
            // Compression pointer
            let low = *payload.get(offset + 1)? as usize;
            if !jumped {
                end_offset = offset + 2;
                jumped = true;
            }
            offset = ((len & 0x3f) << 8) | low;
            hops += 1;
            if hops > 16 {
                return None;
            }
            continue;
        }

        if len == 0 {
            if !jumped {
                end_offset = offset + 1;
            }
            break;
        }

        offset += 1;
        let label = payload.get(offset..offset + len)?;
        if !name.is_empty() {
            name.push('.');
        }
        name.push_str(&String::from_utf8_lossy(label));
        if name.len() > MAX_NAME_LEN {
            return None;
        }
        offset += len;
    }

    Some((name, end_offset))
}

/// Build a question-only message for tests and fixtures
#[cfg(test)]
pub fn encode_query(id: u16, name: &str, qtype: u16) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&id.to_be_bytes());
    buf.extend_from_slice(&0x0100u16.to_be_bytes()); // RD set
    buf.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
    buf.extend_from_slice(&[0, 0, 0, 0, 0, 0]);
    encode_name(&mut buf, name);
    buf.extend_from_slice(&qtype.to_be_bytes());
    buf.extend_from_slice(&1u16.to_be_bytes()); // IN
    buf
}

/// Build a response with one A answer for tests and fixtures
#[cfg(test)]
pub fn encode_a_response(id: u16, name: &str, addr: [u8; 4]) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.extend_from_slice(&id.to_be_bytes());
    buf.extend_from_slice(&0x8180u16.to_be_bytes()); // QR, RD, RA
    buf.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
    buf.extend_from_slice(&1u16.to_be_bytes()); // ANCOUNT
    buf.extend_from_slice(&[0, 0, 0, 0]);
    encode_name(&mut buf, name);
    buf.extend_from_slice(&1u16.to_be_bytes()); // A
    buf.extend_from_slice(&1u16.to_be_bytes()); // IN
    // Answer: pointer to the question name at offset 12
    buf.extend_from_slice(&[0xc0, 0x0c]);
    buf.extend_from_slice(&1u16.to_be_bytes());
    buf.extend_from_slice(&1u16.to_be_bytes());
    buf.extend_from_slice(&300u32.to_be_bytes());
    buf.extend_from_slice(&4u16.to_be_bytes());
    buf.extend_from_slice(&addr);
    buf
}

#[cfg(test)]
fn encode_name(buf: &mut Vec<u8>, name: &str) {
    for label in name.split('.') {
        buf.push(label.len() as u8);
        buf.extend_from_slice(label.as_bytes());
    }
    buf.push(0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_query() {
        let payload = encode_query(0x1234, "www.google.com", 1);
        let msg = parse_message(&payload).unwrap();
        assert_eq!(msg.id, 0x1234);
        assert!(!msg.is_response);
        assert_eq!(msg.queries.len(), 1);
        assert_eq!(msg.queries[0].name, "www.google.com");
        assert_eq!(msg.queries[0].qtype, DnsRecordType::A);
    }

    #[test]
    fn test_parse_response_with_compressed_name() {
        let payload = encode_a_response(0x1234, "www.google.com", [1, 2, 3, 4]);
        let msg = parse_message(&payload).unwrap();
        assert!(msg.is_response);
        assert_eq!(msg.answers.len(), 1);
        // The answer name is a pointer back to the question
        assert_eq!(msg.answers[0].name, "www.google.com");
        assert_eq!(msg.answers[0].rdata.data_string(), "1.2.3.4");
        assert_eq!(msg.answers[0].ttl, 300);
    }

    #[test]
    fn test_truncated_header_rejected() {
        assert!(parse_message(&[0x12, 0x34, 0x01]).is_none());
    }

    #[test]
    fn test_pointer_loop_rejected() {
        // Header + a name that points at itself
        let mut payload = vec![0u8; 12];
        payload[5] = 1; // QDCOUNT = 1
        payload.extend_from_slice(&[0xc0, 0x0c]); // pointer to offset 12 (itself)
        assert!(parse_message(&payload).is_none());
    }

    #[test]
    fn test_rcode_names() {
        assert_eq!(rcode_name(0), "NOERROR");
        assert_eq!(rcode_name(3), "NXDOMAIN");
        assert_eq!(opcode_name(0), "QUERY");
    }
}
