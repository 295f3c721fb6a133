//! Record assembly and delivery
//!
//! Builds the canonical output record for each completed transaction and
//! hands it to the sink without ever blocking a parser: the publish queue
//! is bounded and drops with a counter increment under backpressure.

pub mod publisher;
pub mod record;
pub mod sink;

pub use publisher::{Publisher, PublisherThread};
pub use record::{Endpoint, Record, Status};
pub use sink::{CollectorSink, FileSink, Sink, StdoutSink};
