//! Shared transaction model
//!
//! Plugins pair a request with its response into a [`Transaction`] and
//! hand it to a [`TxEmitter`], which assembles the canonical record,
//! applies the raw-byte configuration, and counts the publication.

use std::cell::Cell;
use std::net::IpAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::counters::{bump, Counters};
use crate::publish::{Endpoint, Publisher, Record, Status};
use super::ProtocolId;

/// A completed request/response exchange (response optional)
#[derive(Debug, Clone)]
pub struct Transaction {
    pub proto: ProtocolId,
    /// Start of the request (record `@timestamp`)
    pub ts_request: DateTime<Utc>,
    pub ts_response: Option<DateTime<Utc>>,
    pub status: Status,
    pub client: Endpoint,
    pub server: Endpoint,

    pub method: Option<String>,
    pub path: String,
    pub query: Option<String>,
    pub resource: Option<String>,
    pub params: Option<String>,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub notes: Vec<String>,

    /// Protocol subdocument
    pub fields: Map<String, Value>,

    pub request_raw: Option<Vec<u8>>,
    pub response_raw: Option<Vec<u8>>,
}

impl Transaction {
    pub fn new(proto: ProtocolId, ts_request: DateTime<Utc>, client: Endpoint, server: Endpoint) -> Self {
        Self {
            proto,
            ts_request,
            ts_response: None,
            status: Status::Ok,
            client,
            server,
            method: None,
            path: String::new(),
            query: None,
            resource: None,
            params: None,
            bytes_in: 0,
            bytes_out: 0,
            notes: Vec::new(),
            fields: Map::new(),
            request_raw: None,
            response_raw: None,
        }
    }

    pub fn note(&mut self, note: impl Into<String>) {
        self.notes.push(note.into());
    }

    /// Response time in whole milliseconds, clamped non-negative
    pub fn responsetime_ms(&self) -> Option<i64> {
        self.ts_response
            .map(|end| (end - self.ts_request).num_milliseconds().max(0))
    }
}

/// Per-plugin publication front end
#[derive(Clone)]
pub struct TxEmitter {
    proto: ProtocolId,
    publisher: Publisher,
    counters: Arc<Counters>,
    local_ips: Arc<Vec<IpAddr>>,
    send_request: bool,
    send_response: bool,
    /// Publish every Nth transaction; records carry `count = N`
    sample_every: u32,
    seen: Cell<u32>,
}

impl TxEmitter {
    pub fn new(
        proto: ProtocolId,
        publisher: Publisher,
        counters: Arc<Counters>,
        local_ips: Arc<Vec<IpAddr>>,
        send_request: bool,
        send_response: bool,
    ) -> Self {
        Self {
            proto,
            publisher,
            counters,
            local_ips,
            send_request,
            send_response,
            sample_every: 1,
            seen: Cell::new(0),
        }
    }

    pub fn with_sampling(mut self, sample_every: u32) -> Self {
        self.sample_every = sample_every.max(1);
        self
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    pub fn proto(&self) -> ProtocolId {
        self.proto
    }

    /// Build the canonical record and enqueue it.
    ///
    /// With sampling configured, only every Nth transaction is published
    /// and its record carries `count = N` to stand in for the rest.
    pub fn emit(&self, tx: Transaction) {
        if self.sample_every > 1 {
            let n = self.seen.get() + 1;
            if n < self.sample_every {
                self.seen.set(n);
                return;
            }
            self.seen.set(0);
        }

        let mut rec = Record::new(tx.ts_request, tx.proto.name(), tx.status);
        rec.count = self.sample_every;
        rec.direction = if self.local_ips.contains(&tx.client.ip) {
            "out"
        } else {
            "in"
        };
        rec.path = tx.path;
        rec.method = tx.method;
        rec.query = tx.query;
        rec.resource = tx.resource;
        rec.params = tx.params;
        rec.notes = tx.notes;
        rec.bytes_in = Some(tx.bytes_in);
        rec.bytes_out = Some(tx.bytes_out);
        rec.responsetime = tx
            .ts_response
            .map(|end| (end - tx.ts_request).num_milliseconds().max(0));
        rec.src = Some(tx.client);
        rec.dst = Some(tx.server);
        rec.fields = tx.fields;
        if self.send_request {
            rec.request = tx.request_raw.map(|b| String::from_utf8_lossy(&b).into_owned());
        }
        if self.send_response {
            rec.response = tx.response_raw.map(|b| String::from_utf8_lossy(&b).into_owned());
        }

        self.publisher.publish(rec);
        bump(&self.counters.proto(self.proto).published);
    }
}
