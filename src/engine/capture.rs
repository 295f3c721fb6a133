//! Packet sources
//!
//! The engine consumes raw frames from a [`PacketSource`]: a live pcap
//! capture, a PCAP file replay, or an in-memory list for tests. BPF
//! filtering and IP defragmentation are the capture layer's business;
//! the engine only sees whole IP datagrams.

use std::collections::VecDeque;

use chrono::{DateTime, TimeZone, Utc};
use tracing::info;

use crate::config::CaptureSettings;
use crate::core::LinkType;
use crate::error::{Result, TapError};

/// One captured frame with its link type and timestamp
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub ts: DateTime<Utc>,
    pub link: LinkType,
    pub data: Vec<u8>,
}

/// What the source produced on this poll
#[derive(Debug)]
pub enum Sourced {
    Frame(RawFrame),
    /// Nothing right now; poll again (live captures time out periodically)
    Idle,
    /// The source is exhausted (end of file)
    Eof,
}

/// Abstraction over live and replayed captures
pub trait PacketSource: Send {
    fn next_frame(&mut self) -> Result<Sourced>;

    /// Kernel-side capture statistics, when the backend has them
    fn stats(&mut self) -> CaptureStats {
        CaptureStats::default()
    }
}

#[derive(Debug, Clone, Default)]
pub struct CaptureStats {
    pub received: u64,
    pub dropped: u64,
}

/// Build the configured source: file replay wins over live capture
pub fn open_source(settings: &CaptureSettings) -> Result<Box<dyn PacketSource>> {
    if let Some(path) = &settings.pcap_file {
        info!("replaying pcap file {}", path);
        return Ok(Box::new(PcapFileSource::open(path, settings)?));
    }
    if let Some(interface) = &settings.interface {
        info!("capturing live on {}", interface);
        return Ok(Box::new(LiveSource::open(interface, settings)?));
    }
    Err(TapError::ConfigError(
        "capture needs either pcap_file or interface".into(),
    ))
}

fn timeval_to_utc(tv: libc::timeval) -> DateTime<Utc> {
    Utc.timestamp_opt(tv.tv_sec as i64, (tv.tv_usec as u32) * 1000)
        .single()
        .unwrap_or_default()
}

/// PCAP file replay
pub struct PcapFileSource {
    capture: pcap::Capture<pcap::Offline>,
    link: LinkType,
    stats: CaptureStats,
}

impl PcapFileSource {
    pub fn open(path: &str, settings: &CaptureSettings) -> Result<Self> {
        let mut capture = pcap::Capture::from_file(path)
            .map_err(|e| TapError::CaptureError(e.to_string()))?;
        if let Some(filter) = &settings.bpf_filter {
            capture
                .filter(filter, true)
                .map_err(|e| TapError::CaptureError(e.to_string()))?;
        }
        let link = LinkType::from_dlt(capture.get_datalink().0 as u32)?;
        Ok(Self {
            capture,
            link,
            stats: CaptureStats::default(),
        })
    }
}

impl PacketSource for PcapFileSource {
    fn next_frame(&mut self) -> Result<Sourced> {
        match self.capture.next_packet() {
            Ok(packet) => {
                self.stats.received += 1;
                Ok(Sourced::Frame(RawFrame {
                    ts: timeval_to_utc(packet.header.ts),
                    link: self.link,
                    data: packet.data.to_vec(),
                }))
            }
            Err(pcap::Error::NoMorePackets) => Ok(Sourced::Eof),
            Err(e) => Err(TapError::CaptureError(e.to_string())),
        }
    }

    fn stats(&mut self) -> CaptureStats {
        self.stats.clone()
    }
}

/// Live capture on an interface
pub struct LiveSource {
    capture: pcap::Capture<pcap::Active>,
    link: LinkType,
    stats: CaptureStats,
}

impl LiveSource {
    pub fn open(interface: &str, settings: &CaptureSettings) -> Result<Self> {
        let mut capture = pcap::Capture::from_device(interface)
            .map_err(|e| TapError::CaptureError(e.to_string()))?
            .promisc(true)
            .snaplen(settings.snaplen as i32)
            .timeout(100)
            .open()
            .map_err(|e| TapError::CaptureError(e.to_string()))?;
        if let Some(filter) = &settings.bpf_filter {
            capture
                .filter(filter, true)
                .map_err(|e| TapError::CaptureError(e.to_string()))?;
        }
        let link = LinkType::from_dlt(capture.get_datalink().0 as u32)?;
        Ok(Self {
            capture,
            link,
            stats: CaptureStats::default(),
        })
    }
}

impl PacketSource for LiveSource {
    fn next_frame(&mut self) -> Result<Sourced> {
        match self.capture.next_packet() {
            Ok(packet) => {
                self.stats.received += 1;
                Ok(Sourced::Frame(RawFrame {
                    ts: timeval_to_utc(packet.header.ts),
                    link: self.link,
                    data: packet.data.to_vec(),
                }))
            }
            Err(pcap::Error::TimeoutExpired) => Ok(Sourced::Idle),
            Err(e) => Err(TapError::CaptureError(e.to_string())),
        }
    }

    fn stats(&mut self) -> CaptureStats {
        if let Ok(s) = self.capture.stats() {
            CaptureStats {
                received: s.received as u64,
                dropped: (s.dropped + s.if_dropped) as u64,
            }
        } else {
            self.stats.clone()
        }
    }
}

/// In-memory source for tests and fixtures
pub struct StaticSource {
    frames: VecDeque<RawFrame>,
}

impl StaticSource {
    pub fn new(frames: Vec<RawFrame>) -> Self {
        Self {
            frames: frames.into(),
        }
    }
}

impl PacketSource for StaticSource {
    fn next_frame(&mut self) -> Result<Sourced> {
        Ok(match self.frames.pop_front() {
            Some(frame) => Sourced::Frame(frame),
            None => Sourced::Eof,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_source_drains() {
        let frame = RawFrame {
            ts: Utc.timestamp_millis_opt(0).unwrap(),
            link: LinkType::Ethernet,
            data: vec![1, 2, 3],
        };
        let mut source = StaticSource::new(vec![frame.clone(), frame]);
        assert!(matches!(source.next_frame().unwrap(), Sourced::Frame(_)));
        assert!(matches!(source.next_frame().unwrap(), Sourced::Frame(_)));
        assert!(matches!(source.next_frame().unwrap(), Sourced::Eof));
    }

    #[test]
    fn test_open_source_requires_input() {
        let settings = CaptureSettings::default();
        assert!(open_source(&settings).is_err());
    }
}
