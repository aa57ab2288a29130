//! Configuration types
//!
//! All knobs the control plane exposes, with defaults matching common
//! WireGuard deployments (25s keepalive, 5s handshake timeout). Every
//! section is optional in the JSON; defaults apply field by field.

use std::time::Duration;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::routing::LoadWeights;

/// Largest pool the allocator will accept (a /16)
pub const MAX_POOL_SIZE: usize = 65536;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Tunnel address pool
    #[serde(default)]
    pub pool: PoolConfig,
    /// Health monitor thresholds and cadence
    #[serde(default)]
    pub health: HealthConfig,
    /// Failover manager timing
    #[serde(default)]
    pub failover: FailoverConfig,
    /// Routing selector weights
    #[serde(default)]
    pub routing: RoutingConfig,
    /// Tunnel engine call handling
    #[serde(default)]
    pub engine: EngineConfig,
}

impl Config {
    /// Validate the whole configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` naming the first offending
    /// field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.pool.validate()?;
        self.health.validate()?;
        self.failover.validate()?;
        self.routing.validate()?;
        self.engine.validate()?;
        Ok(())
    }
}

/// Tunnel address pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// IPv4 network whose host addresses form the pool
    #[serde(default = "default_pool_network")]
    pub network: Ipv4Net,
}

fn default_pool_network() -> Ipv4Net {
    "10.8.0.0/24".parse().expect("valid default pool network")
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            network: default_pool_network(),
        }
    }
}

impl PoolConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.network.prefix_len() < 16 {
            return Err(ConfigError::ValidationError(format!(
                "pool.network {} exceeds {MAX_POOL_SIZE} addresses (prefix must be /16 or longer)",
                self.network
            )));
        }
        Ok(())
    }
}

/// Health monitor configuration
///
/// Durations are milliseconds so tests can shrink the whole state
/// machine into a few hundred ms.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Polling cadence
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Expected keepalive cadence; handshakes older than twice this
    /// degrade the peer
    #[serde(default = "default_keepalive_interval_ms")]
    pub keepalive_interval_ms: u64,
    /// Handshake timeout; handshakes older than three times this kill
    /// the peer
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    /// Packet loss percentage above which a peer degrades
    #[serde(default = "default_max_loss_pct")]
    pub max_loss_pct: f64,
    /// Latency ceiling above which a peer degrades
    #[serde(default = "default_max_latency_ms")]
    pub max_latency_ms: u64,
    /// Consecutive clear observation windows required before a degraded
    /// peer recovers
    #[serde(default = "default_recovery_windows")]
    pub recovery_windows: u32,
    /// Bound on the health-transition event queue
    #[serde(default = "default_event_queue_depth")]
    pub event_queue_depth: usize,
}

fn default_tick_interval_ms() -> u64 {
    2000
}

fn default_keepalive_interval_ms() -> u64 {
    25_000
}

fn default_handshake_timeout_ms() -> u64 {
    5000
}

fn default_max_loss_pct() -> f64 {
    5.0
}

fn default_max_latency_ms() -> u64 {
    200
}

fn default_recovery_windows() -> u32 {
    1
}

fn default_event_queue_depth() -> usize {
    256
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            keepalive_interval_ms: default_keepalive_interval_ms(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            max_loss_pct: default_max_loss_pct(),
            max_latency_ms: default_max_latency_ms(),
            recovery_windows: default_recovery_windows(),
            event_queue_depth: default_event_queue_depth(),
        }
    }
}

impl HealthConfig {
    /// Polling cadence as a Duration
    #[must_use]
    pub const fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Handshake age past which a peer is degraded (2× keepalive)
    #[must_use]
    pub const fn degraded_handshake_age(&self) -> Duration {
        Duration::from_millis(2 * self.keepalive_interval_ms)
    }

    /// Handshake age past which a peer is dead (3× handshake timeout)
    #[must_use]
    pub const fn dead_handshake_age(&self) -> Duration {
        Duration::from_millis(3 * self.handshake_timeout_ms)
    }

    /// Latency ceiling as a Duration
    #[must_use]
    pub const fn max_latency(&self) -> Duration {
        Duration::from_millis(self.max_latency_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "health.tick_interval_ms must be positive".into(),
            ));
        }
        if self.keepalive_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "health.keepalive_interval_ms must be positive".into(),
            ));
        }
        if self.handshake_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "health.handshake_timeout_ms must be positive".into(),
            ));
        }
        if !(0.0..=100.0).contains(&self.max_loss_pct) {
            return Err(ConfigError::ValidationError(format!(
                "health.max_loss_pct must be within 0-100, got {}",
                self.max_loss_pct
            )));
        }
        if self.recovery_windows == 0 {
            return Err(ConfigError::ValidationError(
                "health.recovery_windows must be positive".into(),
            ));
        }
        if self.event_queue_depth == 0 {
            return Err(ConfigError::ValidationError(
                "health.event_queue_depth must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Failover manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverConfig {
    /// How long to wait for a fresh handshake after retargeting to an
    /// alternate (one handshake-timeout window)
    #[serde(default = "default_handshake_wait_ms")]
    pub handshake_wait_ms: u64,
    /// Stats polling cadence while waiting for the handshake
    #[serde(default = "default_handshake_poll_ms")]
    pub handshake_poll_ms: u64,
    /// Bound on the unrecoverable-peer event queue
    #[serde(default = "default_event_queue_depth")]
    pub event_queue_depth: usize,
}

fn default_handshake_wait_ms() -> u64 {
    5000
}

fn default_handshake_poll_ms() -> u64 {
    250
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            handshake_wait_ms: default_handshake_wait_ms(),
            handshake_poll_ms: default_handshake_poll_ms(),
            event_queue_depth: default_event_queue_depth(),
        }
    }
}

impl FailoverConfig {
    /// Handshake wait window as a Duration
    #[must_use]
    pub const fn handshake_wait(&self) -> Duration {
        Duration::from_millis(self.handshake_wait_ms)
    }

    /// Polling cadence as a Duration
    #[must_use]
    pub const fn handshake_poll(&self) -> Duration {
        Duration::from_millis(self.handshake_poll_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.handshake_wait_ms == 0 {
            return Err(ConfigError::ValidationError(
                "failover.handshake_wait_ms must be positive".into(),
            ));
        }
        if self.handshake_poll_ms == 0 || self.handshake_poll_ms > self.handshake_wait_ms {
            return Err(ConfigError::ValidationError(
                "failover.handshake_poll_ms must be positive and no larger than the wait window"
                    .into(),
            ));
        }
        if self.event_queue_depth == 0 {
            return Err(ConfigError::ValidationError(
                "failover.event_queue_depth must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Routing selector configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Load score weights
    #[serde(default)]
    pub weights: LoadWeights,
}

impl RoutingConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        self.weights.validate()
    }
}

/// Tunnel engine call configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Deadline for every engine call
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    /// Backoff before the single transient retry
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

fn default_call_timeout_secs() -> u64 {
    5
}

fn default_retry_backoff_ms() -> u64 {
    100
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            call_timeout_secs: default_call_timeout_secs(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

impl EngineConfig {
    /// Per-call deadline as a Duration
    #[must_use]
    pub const fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    /// Retry backoff as a Duration
    #[must_use]
    pub const fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.call_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "engine.call_timeout_secs must be positive".into(),
            ));
        }
        Ok(())
    }
}
