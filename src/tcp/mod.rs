//! TCP stream reassembly
//!
//! Maintains per-flow directional byte streams, reorders segments by
//! sequence number, detects gaps, and drives the bound protocol plugin
//! with parse/fin/gap callbacks.

pub mod reassembler;
pub mod stream;

pub use reassembler::Reassembler;
pub use stream::StreamBuffer;
