//! Capture loop, worker pool, and lifecycle.

pub mod capture;
pub mod dispatcher;

pub use capture::{open_source, PacketSource, RawFrame, Sourced, StaticSource};
pub use dispatcher::{run, shutdown_flag, EngineReport};
