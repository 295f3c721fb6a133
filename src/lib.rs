//! apptap: passive application-transaction analyzer
//!
//! Observes packets on a host or tap, reconstructs application-layer
//! exchanges for a fixed set of protocols (HTTP, MySQL, PostgreSQL,
//! Redis, Thrift-RPC, MongoDB, DNS, Memcache), correlates each request
//! with its response, and emits one structured record per transaction.
//!
//! ## Data plane
//!
//! ```text
//! capture -> decode -> flow router -+-> TCP reassembler -> protocol parser -> correlator -> publisher
//!                                   +-> UDP dispatcher  -> protocol parser ->
//! ```
//!
//! Packets are partitioned by flow-key hash across worker threads; within
//! a flow all parser callbacks run in capture order, so protocol plugins
//! are written single-threaded. All timeouts advance on packet timestamps
//! so replaying the same capture yields identical output.

pub mod config;
pub mod core;
pub mod counters;
pub mod engine;
pub mod error;
pub mod flow;
pub mod protos;
pub mod publish;
pub mod tcp;

pub use config::Config;
pub use counters::Counters;
pub use error::{Result, TapError};
