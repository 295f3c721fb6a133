//! Link-layer decoding
//!
//! Strips L2/L3/L4 headers off a captured frame and produces a normalized
//! [`Packet`]. Frames the decoder cannot parse are rejected with an error;
//! zero-payload TCP packets are still produced so the reassembler can see
//! SYN/FIN/RST.

use chrono::{DateTime, Utc};
use etherparse::{SlicedPacket, TransportSlice};

use crate::error::{Result, TapError};
use super::packet::{Packet, TcpFlags, TcpMeta, Transport};

/// Link type of the capture source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    /// Ethernet II frames
    Ethernet,
    /// Null/loopback: 4-byte address-family header, then raw IP
    Loopback,
    /// Raw IP datagrams, no link header
    RawIp,
}

impl LinkType {
    /// Map a pcap DLT value to a supported link type
    pub fn from_dlt(dlt: u32) -> Result<Self> {
        match dlt {
            0 => Ok(LinkType::Loopback),
            1 => Ok(LinkType::Ethernet),
            12 | 101 => Ok(LinkType::RawIp),
            other => Err(TapError::UnsupportedLinkType(other)),
        }
    }
}

/// Decode a raw frame into a [`Packet`]
pub fn decode_frame(link: LinkType, ts: DateTime<Utc>, raw: &[u8]) -> Result<Packet> {
    let sliced = match link {
        LinkType::Ethernet => SlicedPacket::from_ethernet(raw)
            .map_err(|e| TapError::DecodeError(e.to_string()))?,
        LinkType::Loopback => {
            if raw.len() < 4 {
                return Err(TapError::DecodeError("truncated loopback header".into()));
            }
            SlicedPacket::from_ip(&raw[4..])
                .map_err(|e| TapError::DecodeError(e.to_string()))?
        }
        LinkType::RawIp => SlicedPacket::from_ip(raw)
            .map_err(|e| TapError::DecodeError(e.to_string()))?,
    };

    decode_sliced(sliced, ts)
}

fn decode_sliced(sliced: SlicedPacket, ts: DateTime<Utc>) -> Result<Packet> {
    let (src_ip, dst_ip) = match &sliced.net {
        Some(etherparse::NetSlice::Ipv4(ipv4)) => {
            let header = ipv4.header();
            (
                std::net::IpAddr::from(header.source_addr()),
                std::net::IpAddr::from(header.destination_addr()),
            )
        }
        Some(etherparse::NetSlice::Ipv6(ipv6)) => {
            let header = ipv6.header();
            (
                std::net::IpAddr::from(header.source_addr()),
                std::net::IpAddr::from(header.destination_addr()),
            )
        }
        _ => return Err(TapError::NoIpLayer),
    };

    match &sliced.transport {
        Some(TransportSlice::Tcp(tcp)) => {
            let flags = TcpFlags {
                fin: tcp.fin(),
                syn: tcp.syn(),
                rst: tcp.rst(),
                psh: tcp.psh(),
                ack: tcp.ack(),
                urg: tcp.urg(),
            };

            Ok(Packet {
                ts,
                src_ip,
                dst_ip,
                src_port: tcp.source_port(),
                dst_port: tcp.destination_port(),
                transport: Transport::Tcp,
                tcp: Some(TcpMeta {
                    seq: tcp.sequence_number(),
                    flags,
                }),
                payload: tcp.payload().to_vec(),
            })
        }
        Some(TransportSlice::Udp(udp)) => Ok(Packet {
            ts,
            src_ip,
            dst_ip,
            src_port: udp.source_port(),
            dst_port: udp.destination_port(),
            transport: Transport::Udp,
            tcp: None,
            payload: udp.payload().to_vec(),
        }),
        _ => Err(TapError::DecodeError("transport is not TCP or UDP".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use etherparse::PacketBuilder;

    fn now() -> DateTime<Utc> {
        chrono::TimeZone::timestamp_millis_opt(&Utc, 1_700_000_000_000).unwrap()
    }

    #[test]
    fn test_decode_empty_fails() {
        assert!(decode_frame(LinkType::Ethernet, now(), &[]).is_err());
    }

    #[test]
    fn test_decode_tcp_ethernet() {
        let builder = PacketBuilder::ethernet2([1, 2, 3, 4, 5, 6], [7, 8, 9, 10, 11, 12])
            .ipv4([192, 168, 1, 10], [10, 0, 0, 1], 64)
            .tcp(44211, 80, 1000, 65535);
        let mut raw = Vec::new();
        builder.write(&mut raw, b"GET / HTTP/1.1\r\n").unwrap();

        let pkt = decode_frame(LinkType::Ethernet, now(), &raw).unwrap();
        assert_eq!(pkt.transport, Transport::Tcp);
        assert_eq!(pkt.src_port, 44211);
        assert_eq!(pkt.dst_port, 80);
        assert_eq!(pkt.payload, b"GET / HTTP/1.1\r\n");
        assert_eq!(pkt.tcp.unwrap().seq, 1000);
    }

    #[test]
    fn test_decode_udp_raw_ip() {
        let builder = PacketBuilder::ipv4([1, 2, 3, 4], [5, 6, 7, 8], 64).udp(5353, 53);
        let mut raw = Vec::new();
        builder.write(&mut raw, &[0xde, 0xad]).unwrap();

        let pkt = decode_frame(LinkType::RawIp, now(), &raw).unwrap();
        assert_eq!(pkt.transport, Transport::Udp);
        assert_eq!(pkt.dst_port, 53);
        assert_eq!(pkt.payload, vec![0xde, 0xad]);
        assert!(pkt.tcp.is_none());
    }

    #[test]
    fn test_decode_zero_payload_tcp() {
        let builder = PacketBuilder::ethernet2([0; 6], [0; 6])
            .ipv4([192, 168, 1, 10], [10, 0, 0, 1], 64)
            .tcp(44211, 80, 1000, 65535)
            .syn();
        let mut raw = Vec::new();
        builder.write(&mut raw, &[]).unwrap();

        let pkt = decode_frame(LinkType::Ethernet, now(), &raw).unwrap();
        assert!(pkt.payload.is_empty());
        assert!(pkt.tcp.unwrap().flags.syn);
    }

    #[test]
    fn test_dlt_mapping() {
        assert_eq!(LinkType::from_dlt(1).unwrap(), LinkType::Ethernet);
        assert_eq!(LinkType::from_dlt(0).unwrap(), LinkType::Loopback);
        assert!(LinkType::from_dlt(999).is_err());
    }
}
