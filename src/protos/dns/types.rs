//! DNS message types

use std::net::{Ipv4Addr, Ipv6Addr};

/// DNS record types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsRecordType {
    A,
    NS,
    CNAME,
    SOA,
    PTR,
    MX,
    TXT,
    AAAA,
    SRV,
    ANY,
    Other(u16),
}

impl From<u16> for DnsRecordType {
    fn from(val: u16) -> Self {
        match val {
            1 => DnsRecordType::A,
            2 => DnsRecordType::NS,
            5 => DnsRecordType::CNAME,
            6 => DnsRecordType::SOA,
            12 => DnsRecordType::PTR,
            15 => DnsRecordType::MX,
            16 => DnsRecordType::TXT,
            28 => DnsRecordType::AAAA,
            33 => DnsRecordType::SRV,
            255 => DnsRecordType::ANY,
            other => DnsRecordType::Other(other),
        }
    }
}

impl std::fmt::Display for DnsRecordType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DnsRecordType::A => write!(f, "A"),
            DnsRecordType::NS => write!(f, "NS"),
            DnsRecordType::CNAME => write!(f, "CNAME"),
            DnsRecordType::SOA => write!(f, "SOA"),
            DnsRecordType::PTR => write!(f, "PTR"),
            DnsRecordType::MX => write!(f, "MX"),
            DnsRecordType::TXT => write!(f, "TXT"),
            DnsRecordType::AAAA => write!(f, "AAAA"),
            DnsRecordType::SRV => write!(f, "SRV"),
            DnsRecordType::ANY => write!(f, "ANY"),
            DnsRecordType::Other(n) => write!(f, "TYPE{}", n),
        }
    }
}

/// DNS record data
#[derive(Debug, Clone)]
pub enum DnsRdata {
    A(Ipv4Addr),
    AAAA(Ipv6Addr),
    CNAME(String),
    NS(String),
    PTR(String),
    MX { preference: u16, exchange: String },
    TXT(String),
    SRV {
        priority: u16,
        weight: u16,
        port: u16,
        target: String,
    },
    Unknown(Vec<u8>),
}

impl DnsRdata {
    /// Human-readable record data for the published record
    pub fn data_string(&self) -> String {
        match self {
            DnsRdata::A(addr) => addr.to_string(),
            DnsRdata::AAAA(addr) => addr.to_string(),
            DnsRdata::CNAME(name) | DnsRdata::NS(name) | DnsRdata::PTR(name) => name.clone(),
            DnsRdata::MX { preference, exchange } => format!("{} {}", preference, exchange),
            DnsRdata::TXT(text) => text.clone(),
            DnsRdata::SRV {
                priority,
                weight,
                port,
                target,
            } => format!("{} {} {} {}", priority, weight, port, target),
            DnsRdata::Unknown(bytes) => format!("[{} bytes]", bytes.len()),
        }
    }
}

/// DNS question
#[derive(Debug, Clone)]
pub struct DnsQuery {
    pub name: String,
    pub qtype: DnsRecordType,
    pub qclass: u16,
}

/// DNS answer/authority/additional resource record
#[derive(Debug, Clone)]
pub struct DnsAnswer {
    pub name: String,
    pub rtype: DnsRecordType,
    pub rclass: u16,
    pub ttl: u32,
    pub rdata: DnsRdata,
}

/// Response code names per RFC 1035 and friends
pub fn rcode_name(rcode: u8) -> &'static str {
    match rcode {
        0 => "NOERROR",
        1 => "FORMERR",
        2 => "SERVFAIL",
        3 => "NXDOMAIN",
        4 => "NOTIMP",
        5 => "REFUSED",
        _ => "UNKNOWN",
    }
}

/// Opcode names
pub fn opcode_name(opcode: u8) -> &'static str {
    match opcode {
        0 => "QUERY",
        1 => "IQUERY",
        2 => "STATUS",
        4 => "NOTIFY",
        5 => "UPDATE",
        _ => "UNKNOWN",
    }
}

/// A decoded DNS message (query or response)
#[derive(Debug, Clone, Default)]
pub struct DnsMessage {
    pub id: u16,
    pub is_response: bool,
    pub opcode: u8,
    pub authoritative: bool,
    pub truncated: bool,
    pub recursion_desired: bool,
    pub recursion_available: bool,
    pub rcode: u8,
    pub queries: Vec<DnsQuery>,
    pub answers: Vec<DnsAnswer>,
    pub authorities: Vec<DnsAnswer>,
    pub additionals: Vec<DnsAnswer>,
    /// Wire size in bytes
    pub size: usize,
}
