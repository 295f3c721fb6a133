//! Protocol plugin framework
//!
//! Defines the contract every protocol analyzer implements and the shared
//! transaction model they emit through. TCP analyzers are driven by the
//! reassembler with parse/fin/gap callbacks over a per-flow stream buffer;
//! UDP analyzers see one datagram per call. Parser state is an opaque
//! per-flow value owned by the plugin (see [`state::ParserState`]).

pub mod registry;
pub mod state;
pub mod tx;

pub mod dns;
pub mod http;
pub mod memcache;
pub mod mongodb;
pub mod mysql;
pub mod pgsql;
pub mod redis;
pub mod thrift;

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::core::{Direction, Packet};
use crate::flow::BoundFlow;
use crate::tcp::StreamBuffer;

pub use registry::{build_port_table, build_proto_set, ProtoSet};
pub use state::ParserState;
pub use tx::{Transaction, TxEmitter};

/// Identity of a registered protocol analyzer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolId {
    Http,
    Mysql,
    Pgsql,
    Redis,
    Thrift,
    Mongodb,
    Dns,
    Memcache,
}

impl ProtocolId {
    pub const ALL: [ProtocolId; 8] = [
        ProtocolId::Http,
        ProtocolId::Mysql,
        ProtocolId::Pgsql,
        ProtocolId::Redis,
        ProtocolId::Thrift,
        ProtocolId::Mongodb,
        ProtocolId::Dns,
        ProtocolId::Memcache,
    ];

    /// The `type` string carried by published records
    pub fn name(&self) -> &'static str {
        match self {
            ProtocolId::Http => "http",
            ProtocolId::Mysql => "mysql",
            ProtocolId::Pgsql => "pgsql",
            ProtocolId::Redis => "redis",
            ProtocolId::Thrift => "thrift",
            ProtocolId::Mongodb => "mongodb",
            ProtocolId::Dns => "dns",
            ProtocolId::Memcache => "memcache",
        }
    }
}

impl std::fmt::Display for ProtocolId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Result of a TCP parse call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseResult {
    /// Consumed a whole number of messages; there may be more later
    Ok,
    /// Need more data; retained bytes stay buffered
    NeedMore,
    /// Unrecoverable; drop the flow and clear parser state
    Drop,
}

/// Default idle timeout for TCP flows
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// TCP surface of a protocol analyzer.
///
/// Callbacks for one flow are strictly serialized in capture order. A
/// message is never delivered twice: consumed bytes are gone from the
/// stream buffer on the next call.
pub trait TcpProtocol: Send {
    fn id(&self) -> ProtocolId;

    /// Idle timeout after which the flow is closed with fin callbacks
    fn connection_timeout(&self) -> Duration {
        DEFAULT_CONNECTION_TIMEOUT
    }

    /// Consume newly buffered bytes for one direction.
    ///
    /// Called after the reassembler appended in-order data. The plugin
    /// consumes as many complete messages as the buffer holds and returns
    /// [`ParseResult::NeedMore`] once a partial message remains.
    fn parse(
        &mut self,
        ts: DateTime<Utc>,
        flow: &BoundFlow,
        dir: Direction,
        stream: &mut StreamBuffer,
        state: &mut ParserState,
    ) -> ParseResult;

    /// One direction of the flow saw FIN (or the flow is being destroyed)
    fn fin(&mut self, flow: &BoundFlow, dir: Direction, state: &mut ParserState);

    /// The stream lost `nbytes` to capture drops.
    ///
    /// Returns `true` when the plugin cannot recover and the flow should
    /// be dropped.
    fn gap(
        &mut self,
        flow: &BoundFlow,
        dir: Direction,
        nbytes: usize,
        state: &mut ParserState,
    ) -> bool;

    /// Advance the plugin's transaction clock (packet time, not wall time)
    fn tick(&mut self, _now: DateTime<Utc>) {}
}

/// UDP surface of a protocol analyzer: one datagram per call
pub trait UdpProtocol: Send {
    fn id(&self) -> ProtocolId;

    fn parse_udp(&mut self, pkt: &Packet, flow: &BoundFlow);

    /// Advance the plugin's transaction clock (packet time, not wall time)
    fn tick(&mut self, _now: DateTime<Utc>) {}
}
