//! Canonical transaction record
//!
//! One record per transaction, serialized as a flat JSON document. The
//! required keys are always present: `@timestamp`, `type`, `count`,
//! `status`, `path`, `direction`.

use std::net::IpAddr;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};

/// Transaction status classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "Client Error")]
    ClientError,
    #[serde(rename = "Server Error")]
    ServerError,
    #[serde(rename = "Error")]
    Error,
}

/// One side of a transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub ip: IpAddr,
    pub port: u16,
    /// Owning process name, when the capture layer knows it
    #[serde(rename = "proc", skip_serializing_if = "Option::is_none")]
    pub proc_: Option<String>,
}

impl Endpoint {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port, proc_: None }
    }
}

/// The published record
#[derive(Debug, Clone)]
pub struct Record {
    pub timestamp: DateTime<Utc>,
    /// Protocol name: http | mysql | pgsql | redis | thrift | mongodb | dns | memcache
    pub type_: &'static str,
    /// Sampling count, >= 1
    pub count: u32,
    pub status: Status,
    pub direction: &'static str,
    pub path: String,

    pub method: Option<String>,
    pub resource: Option<String>,
    pub query: Option<String>,
    pub params: Option<String>,
    pub notes: Vec<String>,
    pub bytes_in: Option<u64>,
    pub bytes_out: Option<u64>,
    pub responsetime: Option<i64>,
    pub src: Option<Endpoint>,
    pub dst: Option<Endpoint>,

    /// Protocol-specific subdocument, keyed by the protocol name
    pub fields: Map<String, Value>,

    /// Raw request/response bytes when configured
    pub request: Option<String>,
    pub response: Option<String>,
}

impl Record {
    pub fn new(timestamp: DateTime<Utc>, type_: &'static str, status: Status) -> Self {
        Self {
            timestamp,
            type_,
            count: 1,
            status,
            direction: "in",
            path: String::new(),
            method: None,
            resource: None,
            query: None,
            params: None,
            notes: Vec::new(),
            bytes_in: None,
            bytes_out: None,
            responsetime: None,
            src: None,
            dst: None,
            fields: Map::new(),
            request: None,
            response: None,
        }
    }
}

impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry(
            "@timestamp",
            &self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
        )?;
        map.serialize_entry("type", self.type_)?;
        map.serialize_entry("count", &self.count)?;
        map.serialize_entry("status", &self.status)?;
        map.serialize_entry("direction", self.direction)?;
        map.serialize_entry("path", &self.path)?;

        if let Some(v) = &self.method {
            map.serialize_entry("method", v)?;
        }
        if let Some(v) = &self.resource {
            map.serialize_entry("resource", v)?;
        }
        if let Some(v) = &self.query {
            map.serialize_entry("query", v)?;
        }
        if let Some(v) = &self.params {
            map.serialize_entry("params", v)?;
        }
        if !self.notes.is_empty() {
            map.serialize_entry("notes", &self.notes)?;
        }
        if let Some(v) = self.bytes_in {
            map.serialize_entry("bytes_in", &v)?;
        }
        if let Some(v) = self.bytes_out {
            map.serialize_entry("bytes_out", &v)?;
        }
        if let Some(v) = self.responsetime {
            map.serialize_entry("responsetime", &v)?;
        }
        if let Some(v) = &self.src {
            map.serialize_entry("src", v)?;
        }
        if let Some(v) = &self.dst {
            map.serialize_entry("dst", v)?;
        }
        if !self.fields.is_empty() {
            map.serialize_entry(self.type_, &self.fields)?;
        }
        if let Some(v) = &self.request {
            map.serialize_entry("request", v)?;
        }
        if let Some(v) = &self.response {
            map.serialize_entry("response", v)?;
        }
        map.end()
    }
}
