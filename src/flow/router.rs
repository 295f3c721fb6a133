//! Port-to-protocol routing
//!
//! Built once at startup from each plugin's configured ports; read-only
//! afterward. A new flow binds to the protocol claiming its destination
//! port, or its source port with the direction reversed, or is dropped.

use std::collections::HashMap;
use std::net::SocketAddr;

use crate::core::{Packet, Transport};
use crate::protos::ProtocolId;

/// Outcome of resolving a packet against the port table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub proto: ProtocolId,
    /// The endpoint acting as client for the new flow
    pub client: SocketAddr,
}

/// Immutable port-to-protocol table
#[derive(Debug, Default)]
pub struct PortTable {
    tcp: HashMap<u16, ProtocolId>,
    udp: HashMap<u16, ProtocolId>,
}

impl PortTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_tcp(&mut self, proto: ProtocolId, ports: &[u16]) {
        for &port in ports {
            self.tcp.insert(port, proto);
        }
    }

    pub fn register_udp(&mut self, proto: ProtocolId, ports: &[u16]) {
        for &port in ports {
            self.udp.insert(port, proto);
        }
    }

    /// Resolve a packet that opens a new flow.
    ///
    /// Destination port wins; a source-port match means we first saw the
    /// server side talking, so the destination is the client.
    pub fn resolve(&self, pkt: &Packet) -> Option<Resolution> {
        let table = match pkt.transport {
            Transport::Tcp => &self.tcp,
            Transport::Udp => &self.udp,
        };

        if let Some(&proto) = table.get(&pkt.dst_port) {
            return Some(Resolution {
                proto,
                client: pkt.src(),
            });
        }
        if let Some(&proto) = table.get(&pkt.src_port) {
            return Some(Resolution {
                proto,
                client: pkt.dst(),
            });
        }
        None
    }

    pub fn tcp_ports(&self) -> impl Iterator<Item = (&u16, &ProtocolId)> {
        self.tcp.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.tcp.is_empty() && self.udp.is_empty()
    }
}
