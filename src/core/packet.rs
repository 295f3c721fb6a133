//! Normalized packet representation
//!
//! One [`Packet`] per captured datagram, produced by the decoder and
//! consumed by the flow router. Lives only until parsing returns.

use std::net::{IpAddr, SocketAddr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// TCP flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TcpFlags {
    pub fin: bool,
    pub syn: bool,
    pub rst: bool,
    pub psh: bool,
    pub ack: bool,
    pub urg: bool,
}

impl TcpFlags {
    pub fn from_u8(flags: u8) -> Self {
        Self {
            fin: flags & 0x01 != 0,
            syn: flags & 0x02 != 0,
            rst: flags & 0x04 != 0,
            psh: flags & 0x08 != 0,
            ack: flags & 0x10 != 0,
            urg: flags & 0x20 != 0,
        }
    }
}

impl std::fmt::Display for TcpFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = String::new();
        if self.syn { s.push('S'); }
        if self.ack { s.push('A'); }
        if self.fin { s.push('F'); }
        if self.rst { s.push('R'); }
        if self.psh { s.push('P'); }
        if self.urg { s.push('U'); }
        if s.is_empty() { s.push('.'); }
        write!(f, "{}", s)
    }
}

/// TCP-only metadata carried alongside the payload
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpMeta {
    /// Sequence number of the first payload byte
    pub seq: u32,
    pub flags: TcpFlags,
}

/// Transport protocol of a decoded packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Tcp,
    Udp,
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transport::Tcp => write!(f, "tcp"),
            Transport::Udp => write!(f, "udp"),
        }
    }
}

/// Direction of a packet or message relative to the flow's client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Client to server (the endpoint that bound the flow to a plugin port)
    ToServer,
    /// Server to client
    ToClient,
}

impl Direction {
    pub fn reverse(self) -> Self {
        match self {
            Direction::ToServer => Direction::ToClient,
            Direction::ToClient => Direction::ToServer,
        }
    }
}

/// A decoded packet: capture timestamp, 5-tuple, transport, payload
#[derive(Debug, Clone)]
pub struct Packet {
    /// Capture timestamp (from the capture layer, not wall clock)
    pub ts: DateTime<Utc>,
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub transport: Transport,
    /// TCP sequence number and flags; `None` for UDP
    pub tcp: Option<TcpMeta>,
    /// Application payload (may be empty for control packets)
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn src(&self) -> SocketAddr {
        SocketAddr::new(self.src_ip, self.src_port)
    }

    pub fn dst(&self) -> SocketAddr {
        SocketAddr::new(self.dst_ip, self.dst_port)
    }

    /// Milliseconds since the Unix epoch, the resolution records carry
    pub fn ts_millis(&self) -> i64 {
        self.ts.timestamp_millis()
    }
}
