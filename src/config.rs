//! Configuration file support
//!
//! Loads analyzer configuration from TOML files with environment variable
//! overrides for deployment knobs. Every section has working defaults; a
//! config file only needs to state what differs.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TapError};

/// Root configuration structure
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Capture source settings
    pub capture: CaptureSettings,

    /// Engine and resource settings
    pub engine: EngineSettings,

    /// Output sink settings
    pub output: OutputSettings,

    /// Logging configuration
    pub logging: LoggingSettings,

    /// Per-protocol analyzer sections
    pub protocols: ProtocolsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            capture: CaptureSettings::default(),
            engine: EngineSettings::default(),
            output: OutputSettings::default(),
            logging: LoggingSettings::default(),
            protocols: ProtocolsConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| TapError::ConfigError(format!("failed to read config file: {}", e)))?;
        let mut config = Self::from_str(&content)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string
    pub fn from_str(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| TapError::ConfigError(format!("failed to parse config: {}", e)))
    }

    /// Serialize configuration to a TOML string
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| TapError::ConfigError(format!("failed to serialize config: {}", e)))
    }

    /// Default config file content with comments
    pub fn default_with_comments() -> &'static str {
        DEFAULT_CONFIG
    }

    /// Apply environment variable overrides.
    ///
    /// Supported variables:
    /// - APPTAP_INTERFACE, APPTAP_PCAP_FILE
    /// - APPTAP_WORKERS, APPTAP_MAX_FLOWS
    /// - APPTAP_OUTPUT_PATH, APPTAP_LOG_LEVEL
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("APPTAP_INTERFACE") {
            self.capture.interface = Some(v);
        }
        if let Ok(v) = std::env::var("APPTAP_PCAP_FILE") {
            self.capture.pcap_file = Some(v);
        }
        if let Ok(v) = std::env::var("APPTAP_WORKERS") {
            if let Ok(n) = v.parse() {
                self.engine.workers = n;
            }
        }
        if let Ok(v) = std::env::var("APPTAP_MAX_FLOWS") {
            if let Ok(n) = v.parse() {
                self.engine.max_flows = n;
            }
        }
        if let Ok(v) = std::env::var("APPTAP_OUTPUT_PATH") {
            self.output.file = Some(v);
        }
        if let Ok(v) = std::env::var("APPTAP_LOG_LEVEL") {
            self.logging.level = v;
        }
    }

    /// Reject configurations the engine cannot run with.
    ///
    /// Startup refuses on the first offending field rather than limping
    /// along with a silently corrected value.
    pub fn validate(&self) -> Result<()> {
        if self.engine.max_flows == 0 {
            return Err(TapError::ConfigError("engine.max_flows must be > 0".into()));
        }
        if self.engine.stream_buffer_size < 1024 {
            return Err(TapError::ConfigError(
                "engine.stream_buffer_size must be at least 1024 bytes".into(),
            ));
        }
        if self.output.queue_size == 0 {
            return Err(TapError::ConfigError("output.queue_size must be > 0".into()));
        }
        if self.output.sample_every == 0 {
            return Err(TapError::ConfigError(
                "output.sample_every must be >= 1".into(),
            ));
        }

        // A TCP port must resolve to exactly one protocol
        let mut seen: std::collections::HashMap<u16, &'static str> = std::collections::HashMap::new();
        for (name, ports) in self.protocols.tcp_port_claims() {
            for port in ports {
                if let Some(prev) = seen.insert(port, name) {
                    return Err(TapError::ConfigError(format!(
                        "port {} claimed by both {} and {}",
                        port, prev, name
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Capture source settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    /// Interface to sniff (live mode)
    pub interface: Option<String>,

    /// PCAP file to replay (file mode, takes precedence)
    pub pcap_file: Option<String>,

    /// Snapshot length in bytes
    pub snaplen: u32,

    /// BPF filter expression applied by the capture layer
    pub bpf_filter: Option<String>,

    /// Addresses of the monitored host; transactions initiated from one of
    /// these are reported with direction "out"
    pub local_ips: Vec<std::net::IpAddr>,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            interface: None,
            pcap_file: None,
            snaplen: 65535,
            bpf_filter: None,
            local_ips: Vec::new(),
        }
    }
}

/// Engine and resource settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Number of worker threads (0 = one per CPU)
    pub workers: usize,

    /// Packet queue depth per worker
    pub queue_depth: usize,

    /// Maximum concurrent live flows
    pub max_flows: usize,

    /// Stream buffer cap per TCP direction, in bytes
    pub stream_buffer_size: usize,

    /// Shutdown drain deadline in milliseconds
    pub drain_timeout_ms: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            workers: 0,
            queue_depth: 4096,
            max_flows: 65_536,
            stream_buffer_size: 64 * 1024,
            drain_timeout_ms: 5_000,
        }
    }
}

impl EngineSettings {
    /// Actual worker count after auto-detection
    pub fn actual_workers(&self) -> usize {
        if self.workers == 0 {
            num_cpus::get().max(1)
        } else {
            self.workers
        }
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

/// Output sink settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputSettings {
    /// Output file path (None = stdout)
    pub file: Option<String>,

    /// High-water mark of the publish queue; past it records drop
    pub queue_size: usize,

    /// Delivery retry attempts before a record is counted lost
    pub max_retries: u32,

    /// Initial retry backoff in milliseconds (doubles per attempt)
    pub retry_backoff_ms: u64,

    /// Publish every Nth transaction, with `count = N` on the record
    pub sample_every: u32,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            file: None,
            queue_size: 8192,
            max_retries: 3,
            retry_backoff_ms: 50,
            sample_every: 1,
        }
    }
}

/// Logging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Log level: "trace", "debug", "info", "warn", "error"
    pub level: String,

    /// Interval between stats log lines, in seconds (0 = disabled)
    pub stats_interval_secs: u64,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            stats_interval_secs: 30,
        }
    }
}

// =============================================================================
// Per-protocol sections
// =============================================================================

/// All protocol analyzer sections
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolsConfig {
    pub http: HttpConfig,
    pub mysql: MysqlConfig,
    pub pgsql: PgsqlConfig,
    pub redis: RedisConfig,
    pub thrift: ThriftConfig,
    pub mongodb: MongodbConfig,
    pub dns: DnsConfig,
    pub memcache: MemcacheConfig,
}

impl ProtocolsConfig {
    /// TCP port claims per protocol, used for conflict validation
    fn tcp_port_claims(&self) -> Vec<(&'static str, Vec<u16>)> {
        vec![
            ("http", self.http.ports.clone()),
            ("mysql", self.mysql.ports.clone()),
            ("pgsql", self.pgsql.ports.clone()),
            ("redis", self.redis.ports.clone()),
            ("thrift", self.thrift.ports.clone()),
            ("mongodb", self.mongodb.ports.clone()),
            ("dns", self.dns.tcp_ports.clone()),
            ("memcache", self.memcache.ports.clone()),
        ]
    }
}

/// HTTP analyzer settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub enabled: bool,
    pub ports: Vec<u16>,
    pub send_request: bool,
    pub send_response: bool,
    pub transaction_timeout_ms: u64,
    pub max_message_size: usize,

    /// Header names captured into the request/response header maps
    pub send_headers: Vec<String>,

    /// Capture every header instead of just `send_headers`
    pub send_all_headers: bool,

    /// Content types whose body is included in the raw request/response
    pub include_body_for: Vec<String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ports: vec![80, 8080, 8000, 5000, 8002],
            send_request: false,
            send_response: false,
            transaction_timeout_ms: 10_000,
            max_message_size: 10 * 1024 * 1024,
            send_headers: Vec::new(),
            send_all_headers: false,
            include_body_for: Vec::new(),
        }
    }
}

/// MySQL analyzer settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MysqlConfig {
    pub enabled: bool,
    pub ports: Vec<u16>,
    pub send_request: bool,
    pub send_response: bool,
    pub transaction_timeout_ms: u64,
    pub max_message_size: usize,

    /// Truncate captured row data past this many rows
    pub max_rows: usize,
}

impl Default for MysqlConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ports: vec![3306],
            send_request: false,
            send_response: false,
            transaction_timeout_ms: 10_000,
            max_message_size: 10 * 1024 * 1024,
            max_rows: 10,
        }
    }
}

/// PostgreSQL analyzer settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PgsqlConfig {
    pub enabled: bool,
    pub ports: Vec<u16>,
    pub send_request: bool,
    pub send_response: bool,
    pub transaction_timeout_ms: u64,
    pub max_message_size: usize,
    pub max_rows: usize,
}

impl Default for PgsqlConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ports: vec![5432],
            send_request: false,
            send_response: false,
            transaction_timeout_ms: 10_000,
            max_message_size: 10 * 1024 * 1024,
            max_rows: 10,
        }
    }
}

/// Redis analyzer settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub enabled: bool,
    pub ports: Vec<u16>,
    pub send_request: bool,
    pub send_response: bool,
    pub transaction_timeout_ms: u64,
    pub max_message_size: usize,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ports: vec![6379],
            send_request: false,
            send_response: false,
            transaction_timeout_ms: 10_000,
            max_message_size: 10 * 1024 * 1024,
        }
    }
}

/// Thrift-RPC analyzer settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ThriftConfig {
    pub enabled: bool,
    pub ports: Vec<u16>,
    pub send_request: bool,
    pub send_response: bool,
    pub transaction_timeout_ms: u64,
    pub max_message_size: usize,

    /// Optional IDL files used for method/field naming
    pub idl_files: Vec<String>,

    /// Strings longer than this are truncated with an ellipsis
    pub string_max_size: usize,

    /// Collections longer than this are truncated with an ellipsis
    pub collection_max_size: usize,
}

impl Default for ThriftConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ports: vec![9090],
            send_request: false,
            send_response: false,
            transaction_timeout_ms: 10_000,
            max_message_size: 10 * 1024 * 1024,
            idl_files: Vec::new(),
            string_max_size: 200,
            collection_max_size: 15,
        }
    }
}

/// MongoDB analyzer settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MongodbConfig {
    pub enabled: bool,
    pub ports: Vec<u16>,
    pub send_request: bool,
    pub send_response: bool,
    pub transaction_timeout_ms: u64,
    pub max_message_size: usize,

    /// Maximum documents rendered per reply
    pub max_docs: usize,

    /// Maximum rendered characters per document
    pub max_doc_length: usize,
}

impl Default for MongodbConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ports: vec![27017],
            send_request: false,
            send_response: false,
            transaction_timeout_ms: 10_000,
            max_message_size: 48 * 1024 * 1024,
            max_docs: 10,
            max_doc_length: 5000,
        }
    }
}

/// DNS analyzer settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsConfig {
    pub enabled: bool,

    /// UDP ports answered by resolvers we observe
    pub ports: Vec<u16>,

    /// TCP ports (2-byte length-prefixed framing)
    pub tcp_ports: Vec<u16>,

    pub send_request: bool,
    pub send_response: bool,
    pub transaction_timeout_ms: u64,
    pub max_message_size: usize,

    /// Pending-query table bound; oldest entries evict past it
    pub max_pending: usize,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ports: vec![53],
            tcp_ports: vec![53],
            send_request: false,
            send_response: false,
            transaction_timeout_ms: 10_000,
            max_message_size: 65_535,
            max_pending: 10_000,
        }
    }
}

/// Memcache analyzer settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MemcacheConfig {
    pub enabled: bool,
    pub ports: Vec<u16>,
    pub send_request: bool,
    pub send_response: bool,
    pub transaction_timeout_ms: u64,
    pub max_message_size: usize,

    /// Emit records for commands the classifier does not recognize
    pub parseunknown: bool,

    /// Maximum values captured per command
    pub maxvalues: usize,

    /// Maximum bytes captured per value
    pub maxbytespervalue: usize,
}

impl Default for MemcacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ports: vec![11211],
            send_request: false,
            send_response: false,
            transaction_timeout_ms: 10_000,
            max_message_size: 10 * 1024 * 1024,
            parseunknown: false,
            maxvalues: 0,
            maxbytespervalue: 0,
        }
    }
}

/// Default configuration file content with comments
const DEFAULT_CONFIG: &str = r#"# apptap configuration
# =====================

[capture]
# Live interface to sniff; leave unset when replaying a file
# interface = "eth0"
# PCAP file replay (takes precedence over interface)
# pcap_file = "trace.pcap"
snaplen = 65535
# bpf_filter = "tcp or udp"

[engine]
# Worker threads (0 = one per CPU)
workers = 0
# Packet queue depth per worker
queue_depth = 4096
# Live flow cap; oldest incomplete flows evict past it
max_flows = 65536
# Stream buffer per TCP direction, bytes
stream_buffer_size = 65536
# Shutdown drain deadline, milliseconds
drain_timeout_ms = 5000

[output]
# Records go to stdout unless a file is set
# file = "/var/log/apptap/transactions.jsonl"
queue_size = 8192
max_retries = 3
retry_backoff_ms = 50
# Publish every Nth transaction (records carry count = N)
sample_every = 1

[logging]
level = "info"
stats_interval_secs = 30

[protocols.http]
enabled = true
ports = [80, 8080, 8000, 5000, 8002]
send_request = false
send_response = false
# send_headers = ["host", "user-agent"]
send_all_headers = false
# include_body_for = ["application/json"]

[protocols.mysql]
enabled = true
ports = [3306]

[protocols.pgsql]
enabled = true
ports = [5432]

[protocols.redis]
enabled = true
ports = [6379]

[protocols.thrift]
enabled = true
ports = [9090]
string_max_size = 200
collection_max_size = 15

[protocols.mongodb]
enabled = true
ports = [27017]

[protocols.dns]
enabled = true
ports = [53]
tcp_ports = [53]
transaction_timeout_ms = 10000

[protocols.memcache]
enabled = true
ports = [11211]
parseunknown = false
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert!(config.protocols.http.enabled);
        assert_eq!(config.protocols.dns.ports, vec![53]);
    }

    #[test]
    fn test_parse_default_config() {
        let config = Config::from_str(DEFAULT_CONFIG).unwrap();
        assert_eq!(config.engine.stream_buffer_size, 65536);
        assert_eq!(config.protocols.mysql.ports, vec![3306]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_roundtrip() {
        let config = Config::default();
        let toml = config.to_toml().unwrap();
        let parsed = Config::from_str(&toml).unwrap();
        assert_eq!(config.engine.max_flows, parsed.engine.max_flows);
        assert_eq!(config.protocols.http.ports, parsed.protocols.http.ports);
    }

    #[test]
    fn test_port_conflict_rejected() {
        let mut config = Config::default();
        config.protocols.redis.ports = vec![3306];
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("3306"));
    }

    #[test]
    fn test_zero_flow_cap_rejected() {
        let mut config = Config::default();
        config.engine.max_flows = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_config() {
        let toml = r#"
[protocols.http]
ports = [8081]
send_all_headers = true
"#;
        let config = Config::from_str(toml).unwrap();
        assert_eq!(config.protocols.http.ports, vec![8081]);
        assert!(config.protocols.http.send_all_headers);
        // Untouched sections keep defaults
        assert_eq!(config.protocols.redis.ports, vec![6379]);
    }
}
