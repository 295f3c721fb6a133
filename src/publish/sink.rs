//! Output sinks
//!
//! A sink consumes finished records. File and stdout sinks write one JSON
//! document per line; the collector sink buffers records for tests.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Result, TapError};
use super::record::Record;

/// Downstream consumer of transaction records
pub trait Sink: Send {
    fn deliver(&mut self, record: &Record) -> Result<()>;

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Writes newline-delimited JSON to a file
pub struct FileSink {
    writer: BufWriter<File>,
}

impl FileSink {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }
}

impl Sink for FileSink {
    fn deliver(&mut self, record: &Record) -> Result<()> {
        serde_json::to_writer(&mut self.writer, record)
            .map_err(|e| TapError::SinkError(e.to_string()))?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Writes newline-delimited JSON to stdout
#[derive(Default)]
pub struct StdoutSink;

impl Sink for StdoutSink {
    fn deliver(&mut self, record: &Record) -> Result<()> {
        let line =
            serde_json::to_string(record).map_err(|e| TapError::SinkError(e.to_string()))?;
        println!("{}", line);
        Ok(())
    }
}

/// Buffers records in memory; the test harness reads them back
#[derive(Clone, Default)]
pub struct CollectorSink {
    records: Arc<Mutex<Vec<Record>>>,
}

impl CollectorSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<Record> {
        self.records.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl Sink for CollectorSink {
    fn deliver(&mut self, record: &Record) -> Result<()> {
        self.records.lock().push(record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publish::record::Status;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_collector_sink() {
        let mut sink = CollectorSink::new();
        let handle = sink.clone();
        let rec = Record::new(Utc.timestamp_millis_opt(0).unwrap(), "http", Status::Ok);
        sink.deliver(&rec).unwrap();
        sink.deliver(&rec).unwrap();
        assert_eq!(handle.len(), 2);
        assert_eq!(handle.records()[0].type_, "http");
    }
}
