//! Tunnel engine boundary
//!
//! The control plane does not implement key exchange or a data plane; it
//! orchestrates an existing tunnel primitive behind the [`TunnelEngine`]
//! trait (a WireGuard control interface in production, [`MockEngine`] in
//! tests). The [`EngineAdapter`] wraps every call with an explicit
//! deadline and retries transient failures once with a short backoff, so
//! callers never block indefinitely on a slow engine and never hand-roll
//! retry loops.

pub mod mock;

pub use mock::{EndpointBehavior, MockEngine};

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::peer::{PresharedKey, PublicKey};

/// Peer configuration pushed into the tunnel engine
#[derive(Debug, Clone)]
pub struct EnginePeerConfig {
    /// Peer identity
    pub public_key: PublicKey,
    /// Optional preshared key
    pub preshared_key: Option<PresharedKey>,
    /// Network endpoint to dial
    pub endpoint: SocketAddr,
    /// Allowed-IP prefixes
    pub allowed_ips: Vec<ipnet::IpNet>,
}

/// Per-peer counters reported by the engine
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EngineStats {
    /// Most recent completed handshake, if any
    pub last_handshake: Option<SystemTime>,
    /// Received bytes, absolute total
    pub rx_bytes: u64,
    /// Transmitted bytes, absolute total
    pub tx_bytes: u64,
    /// Received packets, absolute total
    pub rx_packets: u64,
    /// Transmitted packets, absolute total
    pub tx_packets: u64,
}

/// The consumed tunnel capability
///
/// Implementations must make `install_peer` idempotent from the caller's
/// perspective (reinstalling the same key replaces its config) and must
/// treat `uninstall_peer` of an unknown key as success.
#[async_trait]
pub trait TunnelEngine: Send + Sync {
    /// Install or replace a peer in the engine
    async fn install_peer(&self, config: &EnginePeerConfig) -> Result<(), EngineError>;

    /// Point an installed peer at a new endpoint
    async fn update_peer_endpoint(
        &self,
        key: &PublicKey,
        endpoint: SocketAddr,
    ) -> Result<(), EngineError>;

    /// Remove a peer from the engine; unknown keys are success
    async fn uninstall_peer(&self, key: &PublicKey) -> Result<(), EngineError>;

    /// Poll per-peer counters and handshake recency
    async fn peer_stats(&self, key: &PublicKey) -> Result<EngineStats, EngineError>;
}

/// Deadline-and-retry wrapper around a [`TunnelEngine`]
///
/// Cheap to clone; the health monitor, failover manager, and registry
/// each hold a clone of the same adapter.
#[derive(Clone)]
pub struct EngineAdapter {
    engine: Arc<dyn TunnelEngine>,
    call_timeout: Duration,
    retry_backoff: Duration,
}

impl EngineAdapter {
    /// Wrap an engine with the configured deadline and backoff
    #[must_use]
    pub fn new(engine: Arc<dyn TunnelEngine>, config: &EngineConfig) -> Self {
        Self {
            engine,
            call_timeout: config.call_timeout(),
            retry_backoff: config.retry_backoff(),
        }
    }

    /// Install or replace a peer, with deadline and one transient retry
    pub async fn install_peer(&self, config: &EnginePeerConfig) -> Result<(), EngineError> {
        self.call("install_peer", || self.engine.install_peer(config))
            .await
    }

    /// Retarget a peer's endpoint, with deadline and one transient retry
    pub async fn update_peer_endpoint(
        &self,
        key: &PublicKey,
        endpoint: SocketAddr,
    ) -> Result<(), EngineError> {
        self.call("update_peer_endpoint", || {
            self.engine.update_peer_endpoint(key, endpoint)
        })
        .await
    }

    /// Uninstall a peer, with deadline and one transient retry
    pub async fn uninstall_peer(&self, key: &PublicKey) -> Result<(), EngineError> {
        self.call("uninstall_peer", || self.engine.uninstall_peer(key))
            .await
    }

    /// Poll per-peer stats, with deadline and one transient retry
    pub async fn peer_stats(&self, key: &PublicKey) -> Result<EngineStats, EngineError> {
        self.call("peer_stats", || self.engine.peer_stats(key)).await
    }

    /// The configured per-call deadline
    #[must_use]
    pub const fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    async fn call<T, F, Fut>(&self, op: &'static str, f: F) -> Result<T, EngineError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        match self.once(&f).await {
            Err(e) if e.is_recoverable() => {
                debug!(op, error = %e, backoff_ms = self.retry_backoff.as_millis() as u64,
                    "transient engine failure, retrying once");
                tokio::time::sleep(self.retry_backoff).await;
                let result = self.once(&f).await;
                if let Err(e) = &result {
                    warn!(op, error = %e, "engine call failed after retry");
                }
                result
            }
            other => other,
        }
    }

    async fn once<T, F, Fut>(&self, f: &F) -> Result<T, EngineError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        match tokio::time::timeout(self.call_timeout, f()).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::Timeout {
                timeout_secs: self.call_timeout.as_secs(),
            }),
        }
    }
}

impl std::fmt::Debug for EngineAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineAdapter")
            .field("call_timeout", &self.call_timeout)
            .field("retry_backoff", &self.retry_backoff)
            .finish_non_exhaustive()
    }
}
