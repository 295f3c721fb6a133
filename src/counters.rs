//! Runtime counters
//!
//! Every non-fatal error path increments a counter here; nothing is
//! silently discarded. Counters are process-wide atomics, written by the
//! workers and read by the stats reporter.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::protos::ProtocolId;

/// Counters kept per protocol
#[derive(Debug, Default)]
pub struct ProtoCounters {
    /// Transactions handed to the publisher
    pub published: AtomicU64,
    /// Messages that failed to parse
    pub parse_errors: AtomicU64,
    /// Stream gaps observed by this protocol
    pub gaps: AtomicU64,
    /// Pending requests that timed out without a response
    pub timeouts: AtomicU64,
    /// Pending entries evicted due to map bounds
    pub overflows: AtomicU64,
}

/// Process-wide counter set
#[derive(Debug, Default)]
pub struct Counters {
    pub packets: AtomicU64,
    pub decode_errors: AtomicU64,
    pub flows_created: AtomicU64,
    pub flows_evicted: AtomicU64,
    pub flows_timed_out: AtomicU64,
    /// Records dropped because the publish queue was full
    pub records_dropped: AtomicU64,
    /// Records lost after sink delivery retries were exhausted
    pub records_lost: AtomicU64,

    pub http: ProtoCounters,
    pub mysql: ProtoCounters,
    pub pgsql: ProtoCounters,
    pub redis: ProtoCounters,
    pub thrift: ProtoCounters,
    pub mongodb: ProtoCounters,
    pub dns: ProtoCounters,
    pub memcache: ProtoCounters,
}

impl Counters {
    pub fn proto(&self, id: ProtocolId) -> &ProtoCounters {
        match id {
            ProtocolId::Http => &self.http,
            ProtocolId::Mysql => &self.mysql,
            ProtocolId::Pgsql => &self.pgsql,
            ProtocolId::Redis => &self.redis,
            ProtocolId::Thrift => &self.thrift,
            ProtocolId::Mongodb => &self.mongodb,
            ProtocolId::Dns => &self.dns,
            ProtocolId::Memcache => &self.memcache,
        }
    }

    /// One-line summary for the periodic stats log
    pub fn summary(&self) -> String {
        let published: u64 = ProtocolId::ALL
            .iter()
            .map(|&p| self.proto(p).published.load(Ordering::Relaxed))
            .sum();
        let parse_errors: u64 = ProtocolId::ALL
            .iter()
            .map(|&p| self.proto(p).parse_errors.load(Ordering::Relaxed))
            .sum();
        format!(
            "packets={} published={} parse_errors={} flows_created={} flows_evicted={} dropped={} lost={}",
            self.packets.load(Ordering::Relaxed),
            published,
            parse_errors,
            self.flows_created.load(Ordering::Relaxed),
            self.flows_evicted.load(Ordering::Relaxed),
            self.records_dropped.load(Ordering::Relaxed),
            self.records_lost.load(Ordering::Relaxed),
        )
    }
}

/// Relaxed increment helper; counters are monotonic and uncontended enough
pub fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}
