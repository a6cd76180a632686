//! Configuration for servers, clients and the wire layer.
//!
//! A [`NetworkConfig`] can be read from TOML (`from_file`, `from_toml`), layered
//! from `FRAMENET_*` environment variables (`from_env`), or built from defaults
//! with `default_with_overrides`. Durations are written as milliseconds.
//!
//! TLS material is not part of this structure: certificate paths are handed to the
//! server and client builders as explicit `TlsServerConfig` / `TlsClientConfig` values.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::Level;

use crate::error::{ProtocolError, Result};
use crate::utils::timeout;

/// Magic number opening every packet
pub const MAGIC: u32 = 0x1234_5678;

/// Wire format version written into every header
pub const PROTOCOL_VERSION: u8 = 1;

/// magic(4) + version(1) + type(2) + length(4) + checksum(4) + sequence(4)
pub const HEADER_SIZE: usize = 19;

/// Largest payload accepted by default (10 MiB)
pub const MAX_PACKET_SIZE: usize = 10 * 1024 * 1024;

/// Every tunable of a framenet deployment; each section falls back to its defaults.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct NetworkConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub client: ClientConfig,

    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

fn config_error(context: &str, err: impl std::fmt::Display) -> ProtocolError {
    ProtocolError::ConfigError(format!("{context}: {err}"))
}

impl NetworkConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| config_error(&format!("cannot read {}", path.display()), e))?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| config_error("invalid TOML", e))
    }

    /// Defaults overlaid with any `FRAMENET_*` variables that are set.
    ///
    /// Timeouts are given in milliseconds; `READ_TIMEOUT_MS` and `WRITE_TIMEOUT_MS`
    /// apply to both the server and the client.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(addr) = env_value::<String>("FRAMENET_SERVER_ADDRESS")? {
            config.server.address = addr;
        }
        if let Some(addr) = env_value::<String>("FRAMENET_CLIENT_ADDRESS")? {
            config.client.address = addr;
        }
        if let Some(n) = env_value("FRAMENET_MAX_CONNECTIONS")? {
            config.server.max_connections = n;
        }
        if let Some(n) = env_value("FRAMENET_WORKER_COUNT")? {
            config.server.worker_count = n;
        }
        if let Some(n) = env_value("FRAMENET_BACKPRESSURE_LIMIT")? {
            config.server.backpressure_limit = n;
        }
        if let Some(ms) = env_value("FRAMENET_READ_TIMEOUT_MS")? {
            config.server.read_timeout = Duration::from_millis(ms);
            config.client.read_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_value("FRAMENET_WRITE_TIMEOUT_MS")? {
            config.server.write_timeout = Duration::from_millis(ms);
            config.client.write_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_value("FRAMENET_RESPONSE_TIMEOUT_MS")? {
            config.client.response_timeout = Duration::from_millis(ms);
        }
        if let Some(n) = env_value("FRAMENET_MAX_PACKET_SIZE")? {
            config.transport.max_packet_size = n;
        }
        if let Some(level) = env_value::<String>("FRAMENET_LOG_LEVEL")? {
            config.logging.log_level =
                Level::from_str(&level).map_err(|e| config_error("FRAMENET_LOG_LEVEL", e))?;
        }

        Ok(config)
    }

    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// The default configuration rendered as TOML
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|e| format!("# default configuration unavailable: {e}"))
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let rendered = toml::to_string_pretty(self).map_err(|e| config_error("cannot render TOML", e))?;
        std::fs::write(path, rendered)
            .map_err(|e| config_error(&format!("cannot write {}", path.display()), e))
    }

    /// Every problem found across all sections; empty when the configuration is usable.
    pub fn validate(&self) -> Vec<String> {
        [
            self.server.validate(),
            self.client.validate(),
            self.transport.validate(),
            self.logging.validate(),
        ]
        .concat()
    }

    /// [`validate`](Self::validate) folded into a single `ConfigError`.
    pub fn validate_strict(&self) -> Result<()> {
        let problems = self.validate();
        if problems.is_empty() {
            return Ok(());
        }
        Err(ProtocolError::ConfigError(format!(
            "{} configuration problem(s):\n  - {}",
            problems.len(),
            problems.join("\n  - ")
        )))
    }
}

fn env_value<T: FromStr>(key: &str) -> Result<Option<T>> {
    let Ok(raw) = std::env::var(key) else {
        return Ok(None);
    };
    raw.parse()
        .map(Some)
        .map_err(|_| ProtocolError::ConfigError(format!("{key}: cannot parse '{raw}'")))
}

/// Accumulates validation problems under a section prefix.
struct Checks {
    section: &'static str,
    problems: Vec<String>,
}

impl Checks {
    fn new(section: &'static str) -> Self {
        Self {
            section,
            problems: Vec::new(),
        }
    }

    fn fail(&mut self, field: &str, problem: impl std::fmt::Display) {
        self.problems.push(format!("{}.{field} {problem}", self.section));
    }

    fn positive(&mut self, field: &str, value: usize) {
        if value == 0 {
            self.fail(field, "must be greater than 0");
        }
    }

    fn at_most(&mut self, field: &str, value: usize, max: usize) {
        if value > max {
            self.fail(field, format_args!("too large: {value} (limit {max})"));
        }
    }

    /// Zero means "no deadline" and always passes.
    fn deadline(&mut self, field: &str, value: Duration, min: Duration) {
        if !value.is_zero() && value < min {
            self.fail(
                field,
                format_args!("too short: {}ms (minimum {}ms, or 0 to disable)", value.as_millis(), min.as_millis()),
            );
        }
    }

    fn finish(self) -> Vec<String> {
        self.problems
    }
}

/// What the server does with a packet when the worker queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Run the handler on the connection's own receive task
    #[default]
    RunInline,
    /// Drop the packet and count it
    Drop,
}

/// Listener, admission and dispatch settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Bind address, `host:port`
    pub address: String,

    /// Maximum number of concurrent connections; further accepts are closed immediately
    pub max_connections: usize,

    /// Number of long-lived handler workers
    pub worker_count: usize,

    /// Capacity of the worker task queue
    pub backpressure_limit: usize,

    /// Per-receive deadline (zero disables)
    #[serde(with = "duration_serde")]
    pub read_timeout: Duration,

    /// Per-send deadline (zero disables)
    #[serde(with = "duration_serde")]
    pub write_timeout: Duration,

    /// Upper bound on waiting for connection loops during `stop()`
    #[serde(with = "duration_serde")]
    pub shutdown_timeout: Duration,

    /// Behaviour when the worker queue rejects a task
    #[serde(default)]
    pub overflow_policy: OverflowPolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: String::from("127.0.0.1:8080"),
            max_connections: 10_000,
            worker_count: 64,
            backpressure_limit: 1000,
            read_timeout: timeout::DEFAULT_TIMEOUT,
            write_timeout: timeout::DEFAULT_TIMEOUT,
            shutdown_timeout: timeout::SHUTDOWN_TIMEOUT,
            overflow_policy: OverflowPolicy::default(),
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut checks = Checks::new("server");

        if self.address.is_empty() {
            checks.fail("address", "cannot be empty");
        } else if self.address.parse::<std::net::SocketAddr>().is_err() {
            checks.fail(
                "address",
                format_args!("is not a socket address: '{}' (expected e.g. 0.0.0.0:7070)", self.address),
            );
        }

        checks.positive("max_connections", self.max_connections);
        checks.at_most("max_connections", self.max_connections, 1_000_000);
        checks.positive("worker_count", self.worker_count);
        checks.at_most("worker_count", self.worker_count, 10_000);
        checks.positive("backpressure_limit", self.backpressure_limit);
        checks.at_most("backpressure_limit", self.backpressure_limit, 1_000_000);

        checks.deadline("read_timeout", self.read_timeout, Duration::from_millis(100));
        checks.deadline("write_timeout", self.write_timeout, Duration::from_millis(100));

        if self.shutdown_timeout < Duration::from_secs(1) {
            checks.fail("shutdown_timeout", "too short (minimum 1s)");
        } else if self.shutdown_timeout > Duration::from_secs(60) {
            checks.fail("shutdown_timeout", "too long (maximum 60s)");
        }

        checks.finish()
    }
}

/// Dialing, deadlines and reconnect behaviour of a [`Client`](crate::service::Client)
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    /// Default server address, used when no explicit address was connected to
    pub address: String,

    /// Timeout for connection attempts (TCP dial plus TLS handshake)
    #[serde(with = "duration_serde")]
    pub connection_timeout: Duration,

    /// Per-receive deadline applied by the background reader (zero disables)
    #[serde(with = "duration_serde")]
    pub read_timeout: Duration,

    /// Per-send deadline (zero disables)
    #[serde(with = "duration_serde")]
    pub write_timeout: Duration,

    /// Default wait for correlated responses
    #[serde(with = "duration_serde")]
    pub response_timeout: Duration,

    /// Uncorrelated packets buffered for `receive()` before new ones are dropped
    pub inbound_capacity: usize,

    /// Attempts made by `reconnect()` before giving up
    pub max_reconnect_attempts: u32,

    /// Delay between reconnect attempts
    #[serde(with = "duration_serde")]
    pub reconnect_delay: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: String::from("127.0.0.1:8080"),
            connection_timeout: timeout::DEFAULT_TIMEOUT,
            read_timeout: Duration::ZERO,
            write_timeout: timeout::DEFAULT_TIMEOUT,
            response_timeout: Duration::from_secs(5),
            inbound_capacity: 1024,
            max_reconnect_attempts: 3,
            reconnect_delay: Duration::from_secs(1),
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut checks = Checks::new("client");

        if self.address.is_empty() {
            checks.fail("address", "cannot be empty");
        }
        if self.connection_timeout < Duration::from_millis(100) {
            checks.fail("connection_timeout", "too short (minimum 100ms)");
        }
        checks.deadline("read_timeout", self.read_timeout, Duration::from_millis(10));
        checks.deadline("write_timeout", self.write_timeout, Duration::from_millis(10));
        checks.deadline("response_timeout", self.response_timeout, Duration::from_millis(10));
        checks.positive("inbound_capacity", self.inbound_capacity);
        checks.positive("max_reconnect_attempts", self.max_reconnect_attempts as usize);
        if self.reconnect_delay > Duration::from_secs(60) {
            checks.fail("reconnect_delay", "too long (maximum 60s)");
        }

        checks.finish()
    }
}

/// Framing limits and decode buffer reuse
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransportConfig {
    /// Maximum accepted payload length in bytes
    pub max_packet_size: usize,

    /// Scratch buffers pre-allocated for packet decoding
    pub buffer_pool_size: usize,

    /// Scratch buffers whose capacity grows past this are not returned to the pool
    pub max_pooled_buffer_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_packet_size: MAX_PACKET_SIZE,
            buffer_pool_size: 32,
            max_pooled_buffer_size: 64 * 1024,
        }
    }
}

impl TransportConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut checks = Checks::new("transport");
        // the header's length field is 32 bits wide
        checks.positive("max_packet_size", self.max_packet_size);
        checks.at_most("max_packet_size", self.max_packet_size, u32::MAX as usize);
        checks.positive("max_pooled_buffer_size", self.max_pooled_buffer_size);
        checks.finish()
    }
}

/// Settings for [`init_logging`](crate::utils::logging::init_logging)
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Application name attached to the startup log line
    pub app_name: String,

    /// Default filter level when `RUST_LOG` is unset
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Emit one JSON object per event instead of plain lines
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("framenet"),
            log_level: Level::INFO,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut checks = Checks::new("logging");
        if self.app_name.is_empty() {
            checks.fail("app_name", "cannot be empty");
        } else if self.app_name.len() > 64 {
            checks.fail("app_name", format_args!("too long: {} characters (maximum 64)", self.app_name.len()));
        }
        checks.finish()
    }
}

/// Durations as whole milliseconds
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// `tracing::Level` as its lowercase name
mod log_level_serde {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};
    use tracing::Level;

    pub fn serialize<S: Serializer>(level: &Level, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&level.to_string().to_ascii_lowercase())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Level, D::Error> {
        let name = String::deserialize(deserializer)?;
        name.parse()
            .map_err(|_| D::Error::custom(format!("unknown log level '{name}'")))
    }
}
