//! Configuration for the bus, flow controller, transports, pool and gateway
//!
//! Every struct is serde-deserializable and carries a `validate()` that is
//! called once at startup; validation failures are fatal `ConfigError`s.

use crate::domain_types::{
    ChannelCapacity, DeadLetterCapacity, MaxMessageSize, MaxThroughput, TimeoutMs,
};
use crate::error::ConfigError;
use crate::retry::RetryPolicy;
use crate::transport::framing::FramingProtocol;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Message bus configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Cap on simultaneously dispatching messages
    pub max_concurrent: usize,
    /// Default per-dispatch timeout when a registration supplies none
    pub default_message_timeout: TimeoutMs,
    /// Dead-letter queue capacity
    pub dead_letter_capacity: DeadLetterCapacity,
    /// Capacity of the query result cache
    pub query_cache_capacity: ChannelCapacity,
    /// Flow controller settings
    pub flow: FlowConfig,
    /// Default retry policy applied when a registration supplies none
    pub default_retry: RetryPolicy,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 1024,
            default_message_timeout: TimeoutMs::default(),
            dead_letter_capacity: DeadLetterCapacity::default(),
            query_cache_capacity: ChannelCapacity::default(),
            flow: FlowConfig::default(),
            default_retry: RetryPolicy::none(),
        }
    }
}

impl BusConfig {
    /// Validates the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` when a field is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent == 0 {
            return Err(ConfigError::Invalid {
                field: "max_concurrent".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        self.flow.validate()
    }
}

/// Share of the admission rate held back for messages at or above a
/// priority; lower-priority admissions cannot consume it
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PriorityReservation {
    /// Messages with at least this priority may use the reserved share
    pub min_priority: i32,
    /// Fraction of `max_throughput` reserved (0, 1]
    pub ratio: f64,
}

/// Flow controller (global admission) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    /// Sustained admission rate in messages per second
    pub max_throughput: MaxThroughput,
    /// Sliding window over which the rate is measured
    pub window: TimeoutMs,
    /// How long a blocking admission may wait before rejection
    pub max_wait: TimeoutMs,
    /// Cap on concurrently admitted (unreleased) dispatches
    pub max_in_flight: usize,
    /// Queue depth beyond which the soft-backpressure signal trips
    pub backpressure_threshold: usize,
    /// Per-priority reservation ratios
    pub reservations: Vec<PriorityReservation>,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            max_throughput: MaxThroughput::default(),
            window: TimeoutMs::try_new(1000).unwrap_or_default(),
            max_wait: TimeoutMs::try_new(5000).unwrap_or_default(),
            max_in_flight: 4096,
            backpressure_threshold: 256,
            reservations: Vec::new(),
        }
    }
}

impl FlowConfig {
    /// Validates the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` when a field is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_in_flight == 0 {
            return Err(ConfigError::Invalid {
                field: "flow.max_in_flight".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        let mut total_ratio = 0.0;
        for reservation in &self.reservations {
            if reservation.ratio <= 0.0 || reservation.ratio > 1.0 || !reservation.ratio.is_finite()
            {
                return Err(ConfigError::Invalid {
                    field: "flow.reservations".to_string(),
                    reason: format!(
                        "ratio {} for priority {} must be in (0, 1]",
                        reservation.ratio, reservation.min_priority
                    ),
                });
            }
            total_ratio += reservation.ratio;
        }
        if total_ratio > 1.0 {
            return Err(ConfigError::Invalid {
                field: "flow.reservations".to_string(),
                reason: format!("reservation ratios sum to {total_ratio}, above 1.0"),
            });
        }
        Ok(())
    }
}

/// Payload compression settings shared by all transports
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    /// Whether payloads are compressed before framing
    pub enabled: bool,
    /// Payloads below this size are sent uncompressed
    pub min_size: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_size: 1024,
        }
    }
}

/// Automatic reconnection settings shared by all transports
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Whether a connected transport reconnects after a wire failure
    pub enabled: bool,
    /// Maximum reconnect attempts before giving up
    pub attempts: u32,
    /// Backoff policy between reconnect attempts
    pub backoff: RetryPolicy,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            attempts: 5,
            backoff: RetryPolicy::default(),
        }
    }
}

/// TLS settings passed through to the transport implementation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Path to the PEM certificate chain
    pub cert_path: Option<String>,
    /// Path to the PEM private key
    pub key_path: Option<String>,
    /// Expected server name for client connections
    pub server_name: Option<String>,
}

/// Settings common to every transport adapter
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Timeout for establishing a connection
    pub connect_timeout: TimeoutMs,
    /// Timeout for individual reads
    pub read_timeout: TimeoutMs,
    /// Timeout for individual writes
    pub write_timeout: TimeoutMs,
    /// Whether TCP keepalive (or the protocol's equivalent) is enabled
    pub keep_alive: bool,
    /// Keepalive probe interval
    pub keep_alive_interval: TimeoutMs,
    /// Whether the connection is wrapped in TLS
    pub use_tls: bool,
    /// TLS material, required when `use_tls` is set
    pub tls: TlsConfig,
    /// Payload compression
    pub compression: CompressionConfig,
    /// Automatic reconnection
    pub reconnect: ReconnectConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: TimeoutMs::try_new(10_000).unwrap_or_default(),
            read_timeout: TimeoutMs::default(),
            write_timeout: TimeoutMs::default(),
            keep_alive: true,
            keep_alive_interval: TimeoutMs::default(),
            use_tls: false,
            tls: TlsConfig::default(),
            compression: CompressionConfig::default(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl TransportConfig {
    /// Validates the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` when TLS is enabled without material.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.use_tls && self.tls.cert_path.is_none() && self.tls.server_name.is_none() {
            return Err(ConfigError::Invalid {
                field: "transport.tls".to_string(),
                reason: "use_tls requires cert_path (server) or server_name (client)".to_string(),
            });
        }
        Ok(())
    }
}

/// TCP transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpConfig {
    /// Settings shared with other transports
    pub common: TransportConfig,
    /// Server mode binds and accepts; client mode connects out
    pub is_server: bool,
    /// Bind host for server mode
    pub host: String,
    /// Bind port for server mode
    pub port: u16,
    /// Remote host for client mode
    pub remote_host: String,
    /// Remote port for client mode
    pub remote_port: u16,
    /// Cap on accepted connections in server mode
    pub max_connections: usize,
    /// Listen backlog
    pub backlog: u32,
    /// SO_RCVBUF hint; `None` leaves the OS default
    pub receive_buffer_size: Option<usize>,
    /// SO_SNDBUF hint; `None` leaves the OS default
    pub send_buffer_size: Option<usize>,
    /// TCP_NODELAY
    pub no_delay: bool,
    /// SO_LINGER duration; `None` disables linger
    pub linger: Option<Duration>,
    /// Frame delimiting protocol
    pub framing: FramingProtocol,
    /// Upper bound on a single frame's payload
    pub max_message_size: MaxMessageSize,
    /// Idle interval after which an empty heartbeat frame is written
    pub heartbeat_interval: Option<Duration>,
    /// Inactivity span after which the connection closes
    pub heartbeat_timeout: Option<Duration>,
    /// Whether client sends go through a connection pool
    pub use_connection_pooling: bool,
    /// Pool size when pooling is enabled
    pub connection_pool_size: usize,
    /// Pool acquire timeout when pooling is enabled
    pub connection_pool_timeout: TimeoutMs,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            common: TransportConfig::default(),
            is_server: false,
            host: "127.0.0.1".to_string(),
            port: 0,
            remote_host: "127.0.0.1".to_string(),
            remote_port: 0,
            max_connections: 1024,
            backlog: 128,
            receive_buffer_size: None,
            send_buffer_size: None,
            no_delay: true,
            linger: None,
            framing: FramingProtocol::LengthPrefixed,
            max_message_size: MaxMessageSize::default(),
            heartbeat_interval: None,
            heartbeat_timeout: None,
            use_connection_pooling: false,
            connection_pool_size: 4,
            connection_pool_timeout: TimeoutMs::try_new(5000).unwrap_or_default(),
        }
    }
}

impl TcpConfig {
    /// Validates the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` when a field combination is unusable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.common.validate()?;
        if self.is_server && self.max_connections == 0 {
            return Err(ConfigError::Invalid {
                field: "tcp.max_connections".to_string(),
                reason: "server mode requires at least 1".to_string(),
            });
        }
        if !self.is_server && self.remote_port == 0 {
            return Err(ConfigError::Invalid {
                field: "tcp.remote_port".to_string(),
                reason: "client mode requires a remote port".to_string(),
            });
        }
        if let (Some(interval), Some(timeout)) = (self.heartbeat_interval, self.heartbeat_timeout)
            && timeout <= interval
        {
            return Err(ConfigError::Invalid {
                field: "tcp.heartbeat_timeout".to_string(),
                reason: "must exceed heartbeat_interval".to_string(),
            });
        }
        if self.use_connection_pooling && self.connection_pool_size == 0 {
            return Err(ConfigError::Invalid {
                field: "tcp.connection_pool_size".to_string(),
                reason: "pooling requires at least 1 connection".to_string(),
            });
        }
        if let FramingProtocol::CustomDelimiter(delim) = &self.framing
            && delim.is_empty()
        {
            return Err(ConfigError::Invalid {
                field: "tcp.framing".to_string(),
                reason: "custom delimiter must be non-empty".to_string(),
            });
        }
        Ok(())
    }
}

/// Connection pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Connections kept open even when idle
    pub min: usize,
    /// Upper bound on open connections
    pub max: usize,
    /// Idle span after which a connection above `min` is closed
    pub idle_timeout: Duration,
    /// How long `acquire` may wait at `max` before timing out
    pub acquire_timeout: Duration,
    /// Cadence of the idle sweep and health probe task
    pub health_check_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min: 0,
            max: 8,
            idle_timeout: Duration::from_secs(60),
            acquire_timeout: Duration::from_secs(5),
            health_check_interval: Duration::from_secs(30),
        }
    }
}

impl PoolConfig {
    /// Validates the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` when bounds are inconsistent.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max == 0 {
            return Err(ConfigError::Invalid {
                field: "pool.max".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.min > self.max {
            return Err(ConfigError::Invalid {
                field: "pool.min".to_string(),
                reason: format!("min ({}) exceeds max ({})", self.min, self.max),
            });
        }
        Ok(())
    }
}

/// Load-balancing strategy applied when selecting an upstream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BalanceStrategy {
    /// Next index modulo count
    RoundRobin,
    /// Minimum active connections, ties broken round-robin
    LeastConnections,
    /// Uniform random choice
    Random,
    /// Deterministic hash of the client identity, for sticky sessions
    IpHash,
    /// Proportional to declared weights
    WeightedRoundRobin,
}

/// Token-bucket rate limit policy for one route
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Bucket capacity (burst size)
    pub capacity: f64,
    /// Tokens refilled per second
    pub refill_per_sec: f64,
}

impl RateLimitConfig {
    /// Validates the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` when capacity or rate is non-positive.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity < 1.0 || !self.capacity.is_finite() {
            return Err(ConfigError::Invalid {
                field: "rate_limit.capacity".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if self.refill_per_sec <= 0.0 || !self.refill_per_sec.is_finite() {
            return Err(ConfigError::Invalid {
                field: "rate_limit.refill_per_sec".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        Ok(())
    }
}

/// One upstream backend behind a gateway route
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Base URL of the backend
    pub url: String,
    /// Relative weight for weighted strategies
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

/// Header propagation rules for one route
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteHeaders {
    /// Request headers copied to the upstream request
    pub upstream: Vec<String>,
    /// Headers injected into the downstream response
    pub downstream: Vec<(String, String)>,
}

/// One gateway route
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    /// HTTP methods the route accepts
    pub methods: Vec<String>,
    /// Path pattern with `{name}` placeholders
    pub path: String,
    /// Upstream backends
    pub upstreams: Vec<UpstreamConfig>,
    /// Load-balancing strategy
    #[serde(default = "default_strategy")]
    pub strategy: BalanceStrategy,
    /// Per-client rate limit; `None` disables limiting
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
    /// Per-route upstream timeout
    #[serde(default)]
    pub timeout: Option<Duration>,
    /// Roles the caller must hold; empty means unauthenticated access
    #[serde(default)]
    pub required_roles: Vec<String>,
    /// Disabled routes never match
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Header propagation
    #[serde(default)]
    pub headers: RouteHeaders,
}

fn default_strategy() -> BalanceStrategy {
    BalanceStrategy::RoundRobin
}

fn default_enabled() -> bool {
    true
}

impl RouteConfig {
    /// Validates the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Invalid` for empty method sets, bad patterns,
    /// missing upstreams, or invalid rate limits.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.methods.is_empty() {
            return Err(ConfigError::Invalid {
                field: format!("route[{}].methods", self.path),
                reason: "must list at least one method".to_string(),
            });
        }
        if !self.path.starts_with('/') {
            return Err(ConfigError::Invalid {
                field: format!("route[{}].path", self.path),
                reason: "must start with '/'".to_string(),
            });
        }
        if self.upstreams.is_empty() {
            return Err(ConfigError::Invalid {
                field: format!("route[{}].upstreams", self.path),
                reason: "must list at least one upstream".to_string(),
            });
        }
        for upstream in &self.upstreams {
            if upstream.weight == 0 {
                return Err(ConfigError::Invalid {
                    field: format!("route[{}].upstreams", self.path),
                    reason: format!("upstream {} has zero weight", upstream.url),
                });
            }
        }
        if let Some(limit) = &self.rate_limit {
            limit.validate()?;
        }
        Ok(())
    }
}

/// Upstream health probing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// Probe cadence
    pub interval: Duration,
    /// Consecutive failures before an upstream is marked unhealthy
    pub unhealthy_threshold: u32,
    /// Consecutive successes before an unhealthy upstream recovers
    pub healthy_threshold: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            unhealthy_threshold: 3,
            healthy_threshold: 2,
        }
    }
}

/// Gateway configuration: global limits plus the route table
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Routes in registration order
    pub routes: Vec<RouteConfig>,
    /// Cap on simultaneous in-flight requests
    pub max_concurrent: usize,
    /// How long an over-cap request waits; zero means immediate 503
    pub queue_timeout: Duration,
    /// Upstream health probing
    pub health_check: HealthCheckConfig,
    /// Eviction horizon for idle rate-limiter client entries
    pub rate_limit_idle_eviction: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            routes: Vec::new(),
            max_concurrent: 1024,
            queue_timeout: Duration::ZERO,
            health_check: HealthCheckConfig::default(),
            rate_limit_idle_eviction: Duration::from_secs(300),
        }
    }
}

impl GatewayConfig {
    /// Validates the configuration
    ///
    /// # Errors
    ///
    /// Returns the first `ConfigError` found across global settings and routes.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent == 0 {
            return Err(ConfigError::Invalid {
                field: "gateway.max_concurrent".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        for route in &self.routes {
            route.validate()?;
        }
        Ok(())
    }
}
