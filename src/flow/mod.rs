//! Flow identity and routing
//!
//! A flow is keyed by the ordered endpoint pair so both directions of a
//! connection land on the same entry; the direction of any packet is
//! recovered by comparing its source against the flow's client endpoint.

pub mod router;

use std::net::SocketAddr;

use crate::core::{Direction, Packet};

pub use router::{PortTable, Resolution};

/// Unique identifier for a flow: the endpoint pair in canonical order
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FlowKey {
    /// Lower endpoint (for consistent ordering)
    pub low: SocketAddr,
    /// Higher endpoint
    pub high: SocketAddr,
}

impl FlowKey {
    pub fn new(a: SocketAddr, b: SocketAddr) -> Self {
        if a < b {
            Self { low: a, high: b }
        } else {
            Self { low: b, high: a }
        }
    }

    pub fn from_packet(pkt: &Packet) -> Self {
        Self::new(pkt.src(), pkt.dst())
    }
}

impl std::fmt::Display for FlowKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}<->{}", self.low, self.high)
    }
}

/// A flow key together with the client endpoint, fixing packet direction
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BoundFlow {
    pub key: FlowKey,
    /// The endpoint that initiated the exchange
    pub client: SocketAddr,
}

impl BoundFlow {
    pub fn new(key: FlowKey, client: SocketAddr) -> Self {
        Self { key, client }
    }

    pub fn server(&self) -> SocketAddr {
        if self.client == self.key.low {
            self.key.high
        } else {
            self.key.low
        }
    }

    /// Direction of a packet within this flow
    pub fn direction_of(&self, pkt: &Packet) -> Direction {
        if pkt.src() == self.client {
            Direction::ToServer
        } else {
            Direction::ToClient
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Transport;
    use chrono::{TimeZone, Utc};
    use std::net::IpAddr;

    fn pkt(src: &str, sport: u16, dst: &str, dport: u16) -> Packet {
        Packet {
            ts: Utc.timestamp_millis_opt(0).unwrap(),
            src_ip: src.parse::<IpAddr>().unwrap(),
            dst_ip: dst.parse::<IpAddr>().unwrap(),
            src_port: sport,
            dst_port: dport,
            transport: Transport::Tcp,
            tcp: None,
            payload: Vec::new(),
        }
    }

    #[test]
    fn test_flow_key_symmetric() {
        let forward = FlowKey::from_packet(&pkt("192.168.1.5", 40000, "10.0.0.1", 80));
        let reverse = FlowKey::from_packet(&pkt("10.0.0.1", 80, "192.168.1.5", 40000));
        assert_eq!(forward, reverse);
    }

    #[test]
    fn test_bound_flow_direction() {
        let request = pkt("192.168.1.5", 40000, "10.0.0.1", 80);
        let key = FlowKey::from_packet(&request);
        let flow = BoundFlow::new(key, request.src());

        assert_eq!(flow.direction_of(&request), Direction::ToServer);
        let reply = pkt("10.0.0.1", 80, "192.168.1.5", 40000);
        assert_eq!(flow.direction_of(&reply), Direction::ToClient);
        assert_eq!(flow.server(), reply.src());
    }
}
