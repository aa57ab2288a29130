//! Scriptable in-memory tunnel engine
//!
//! Test double for the [`TunnelEngine`] boundary. Handshake behavior is
//! scripted per endpoint, install failures can be queued, and every call
//! is counted, which is enough to drive the health monitor and failover
//! manager through real scenarios without a kernel interface.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::error::EngineError;
use crate::peer::PublicKey;

use super::{EnginePeerConfig, EngineStats, TunnelEngine};

/// How an endpoint responds once a peer is pointed at it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointBehavior {
    /// Handshakes complete promptly; every install/retarget/stats poll
    /// refreshes the peer's handshake timestamp
    Handshakes,
    /// Reachable for config pushes but never completes a handshake
    Silent,
    /// Retarget calls to this endpoint fail transiently
    RejectsRetarget,
}

#[derive(Debug)]
struct InstalledPeer {
    endpoint: SocketAddr,
    stats: EngineStats,
}

/// In-memory [`TunnelEngine`] with scripted behavior
#[derive(Debug, Default)]
pub struct MockEngine {
    peers: DashMap<PublicKey, InstalledPeer>,
    behaviors: DashMap<SocketAddr, EndpointBehavior>,
    install_failures: Mutex<VecDeque<EngineError>>,
    install_calls: AtomicU64,
    update_calls: AtomicU64,
    uninstall_calls: AtomicU64,
    stats_calls: AtomicU64,
}

impl MockEngine {
    /// Create an engine where every endpoint handshakes by default
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the behavior of one endpoint
    pub fn set_behavior(&self, endpoint: SocketAddr, behavior: EndpointBehavior) {
        self.behaviors.insert(endpoint, behavior);
    }

    /// Queue a failure for the next `install_peer` call
    pub fn push_install_failure(&self, failure: EngineError) {
        self.install_failures.lock().push_back(failure);
    }

    /// Add traffic to a peer's counters
    pub fn feed_traffic(&self, key: &PublicKey, rx_bytes: u64, tx_bytes: u64) {
        if let Some(mut peer) = self.peers.get_mut(key) {
            peer.stats.rx_bytes += rx_bytes;
            peer.stats.tx_bytes += tx_bytes;
            peer.stats.rx_packets += rx_bytes.div_ceil(1400);
            peer.stats.tx_packets += tx_bytes.div_ceil(1400);
        }
    }

    /// Pin a peer's handshake timestamp, e.g. into the past to simulate
    /// staleness
    pub fn set_last_handshake(&self, key: &PublicKey, at: Option<SystemTime>) {
        if let Some(mut peer) = self.peers.get_mut(key) {
            peer.stats.last_handshake = at;
        }
    }

    /// Whether a peer is currently installed
    #[must_use]
    pub fn is_installed(&self, key: &PublicKey) -> bool {
        self.peers.contains_key(key)
    }

    /// The endpoint a peer is currently pointed at
    #[must_use]
    pub fn installed_endpoint(&self, key: &PublicKey) -> Option<SocketAddr> {
        self.peers.get(key).map(|p| p.endpoint)
    }

    /// Number of installed peers
    #[must_use]
    pub fn installed_count(&self) -> usize {
        self.peers.len()
    }

    /// Total `install_peer` calls
    #[must_use]
    pub fn install_calls(&self) -> u64 {
        self.install_calls.load(Ordering::SeqCst)
    }

    /// Total `update_peer_endpoint` calls
    #[must_use]
    pub fn update_calls(&self) -> u64 {
        self.update_calls.load(Ordering::SeqCst)
    }

    /// Total `uninstall_peer` calls
    #[must_use]
    pub fn uninstall_calls(&self) -> u64 {
        self.uninstall_calls.load(Ordering::SeqCst)
    }

    /// Total `peer_stats` calls
    #[must_use]
    pub fn stats_calls(&self) -> u64 {
        self.stats_calls.load(Ordering::SeqCst)
    }

    fn behavior(&self, endpoint: SocketAddr) -> EndpointBehavior {
        self.behaviors
            .get(&endpoint)
            .map_or(EndpointBehavior::Handshakes, |b| *b)
    }
}

#[async_trait::async_trait]
impl TunnelEngine for MockEngine {
    async fn install_peer(&self, config: &EnginePeerConfig) -> Result<(), EngineError> {
        self.install_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(failure) = self.install_failures.lock().pop_front() {
            return Err(failure);
        }

        let handshake = match self.behavior(config.endpoint) {
            EndpointBehavior::Handshakes => Some(SystemTime::now()),
            _ => None,
        };
        // Reinstall replaces config but keeps counters, like a real
        // control interface updating an existing peer
        match self.peers.entry(config.public_key) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                let peer = entry.get_mut();
                peer.endpoint = config.endpoint;
                if handshake.is_some() {
                    peer.stats.last_handshake = handshake;
                }
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(InstalledPeer {
                    endpoint: config.endpoint,
                    stats: EngineStats {
                        last_handshake: handshake,
                        ..EngineStats::default()
                    },
                });
            }
        }
        Ok(())
    }

    async fn update_peer_endpoint(
        &self,
        key: &PublicKey,
        endpoint: SocketAddr,
    ) -> Result<(), EngineError> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        let behavior = self.behavior(endpoint);
        if behavior == EndpointBehavior::RejectsRetarget {
            return Err(EngineError::transient("retarget rejected"));
        }
        let mut peer = self
            .peers
            .get_mut(key)
            .ok_or_else(|| EngineError::permanent("peer not installed"))?;
        peer.endpoint = endpoint;
        if behavior == EndpointBehavior::Handshakes {
            peer.stats.last_handshake = Some(SystemTime::now());
        }
        Ok(())
    }

    async fn uninstall_peer(&self, key: &PublicKey) -> Result<(), EngineError> {
        self.uninstall_calls.fetch_add(1, Ordering::SeqCst);
        // Unknown peers are success by contract
        self.peers.remove(key);
        Ok(())
    }

    async fn peer_stats(&self, key: &PublicKey) -> Result<EngineStats, EngineError> {
        self.stats_calls.fetch_add(1, Ordering::SeqCst);
        let mut peer = self
            .peers
            .get_mut(key)
            .ok_or_else(|| EngineError::permanent("peer not installed"))?;
        if self.behavior(peer.endpoint) == EndpointBehavior::Handshakes {
            peer.stats.last_handshake = Some(SystemTime::now());
        }
        Ok(peer.stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(key: PublicKey, endpoint: &str) -> EnginePeerConfig {
        EnginePeerConfig {
            public_key: key,
            preshared_key: None,
            endpoint: endpoint.parse().unwrap(),
            allowed_ips: vec!["10.8.0.0/24".parse().unwrap()],
        }
    }

    #[tokio::test]
    async fn test_install_and_stats() {
        let engine = MockEngine::new();
        let key = PublicKey::generate();
        engine.install_peer(&config(key, "203.0.113.1:51820")).await.unwrap();

        assert!(engine.is_installed(&key));
        let stats = engine.peer_stats(&key).await.unwrap();
        assert!(stats.last_handshake.is_some());
    }

    #[tokio::test]
    async fn test_silent_endpoint_never_handshakes() {
        let engine = MockEngine::new();
        let endpoint: SocketAddr = "203.0.113.1:51820".parse().unwrap();
        engine.set_behavior(endpoint, EndpointBehavior::Silent);

        let key = PublicKey::generate();
        engine.install_peer(&config(key, "203.0.113.1:51820")).await.unwrap();

        let stats = engine.peer_stats(&key).await.unwrap();
        assert!(stats.last_handshake.is_none());
    }

    #[tokio::test]
    async fn test_retarget_rejection() {
        let engine = MockEngine::new();
        let key = PublicKey::generate();
        engine.install_peer(&config(key, "203.0.113.1:51820")).await.unwrap();

        let bad: SocketAddr = "203.0.113.2:51820".parse().unwrap();
        engine.set_behavior(bad, EndpointBehavior::RejectsRetarget);

        let err = engine.update_peer_endpoint(&key, bad).await.unwrap_err();
        assert!(err.is_recoverable());
        // Endpoint unchanged after the rejection
        assert_eq!(
            engine.installed_endpoint(&key).unwrap(),
            "203.0.113.1:51820".parse::<SocketAddr>().unwrap()
        );
    }

    #[tokio::test]
    async fn test_uninstall_unknown_is_success() {
        let engine = MockEngine::new();
        engine.uninstall_peer(&PublicKey::generate()).await.unwrap();
        assert_eq!(engine.uninstall_calls(), 1);
    }

    #[tokio::test]
    async fn test_scripted_install_failure() {
        let engine = MockEngine::new();
        engine.push_install_failure(EngineError::permanent("malformed key"));

        let key = PublicKey::generate();
        let err = engine
            .install_peer(&config(key, "203.0.113.1:51820"))
            .await
            .unwrap_err();
        assert!(!err.is_recoverable());
        assert!(!engine.is_installed(&key));

        // Next install succeeds
        engine.install_peer(&config(key, "203.0.113.1:51820")).await.unwrap();
    }

    #[tokio::test]
    async fn test_feed_traffic_accumulates() {
        let engine = MockEngine::new();
        let key = PublicKey::generate();
        engine.install_peer(&config(key, "203.0.113.1:51820")).await.unwrap();

        engine.feed_traffic(&key, 2800, 1400);
        engine.feed_traffic(&key, 200, 0);

        let stats = engine.peer_stats(&key).await.unwrap();
        assert_eq!(stats.rx_bytes, 3000);
        assert_eq!(stats.tx_bytes, 1400);
        assert_eq!(stats.rx_packets, 3);
        assert_eq!(stats.tx_packets, 1);
    }
}
