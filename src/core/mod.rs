//! Core packet model and link-layer decoding.
//!
//! The decoder strips L2/L3/L4 headers and produces a normalized [`Packet`]
//! carrying the 5-tuple, transport metadata, and the application payload.

pub mod decoder;
pub mod packet;

pub use decoder::{decode_frame, LinkType};
pub use packet::{Direction, Packet, TcpFlags, TcpMeta, Transport};
