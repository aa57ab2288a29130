//! Control plane facade
//!
//! Owns the registry, routing selector, and the two background workers
//! (health monitor and failover manager), wired together over bounded
//! channels. External callers — an HTTP layer, an admin CLI — talk to
//! this type only.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::allocator::AddressAllocator;
use crate::config::Config;
use crate::engine::{EngineAdapter, TunnelEngine};
use crate::error::Result;
use crate::failover::{FailoverManager, UnrecoverableEvent};
use crate::health::HealthMonitor;
use crate::peer::{Peer, PeerSnapshot, PeerSpec, PublicKey};
use crate::registry::PeerRegistry;
use crate::routing::RoutingSelector;

/// Result of provisioning one device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCreated {
    /// The provisioned identity
    pub public_key: PublicKey,
    /// Tunnel-internal address assigned from the pool
    pub tunnel_address: std::net::Ipv4Addr,
}

/// Aggregate traffic counters across all live peers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlaneTotals {
    /// Live peer count
    pub peers: usize,
    /// Received bytes across all peers
    pub rx_bytes: u64,
    /// Transmitted bytes across all peers
    pub tx_bytes: u64,
    /// Received packets across all peers
    pub rx_packets: u64,
    /// Transmitted packets across all peers
    pub tx_packets: u64,
}

/// The assembled control plane
pub struct ControlPlane {
    config: Config,
    registry: Arc<PeerRegistry>,
    selector: RoutingSelector,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    unrecoverable_tx: mpsc::Sender<UnrecoverableEvent>,
    unrecoverable_rx: Mutex<Option<mpsc::Receiver<UnrecoverableEvent>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl ControlPlane {
    /// Assemble a control plane over a tunnel engine
    ///
    /// # Errors
    ///
    /// Returns `ControlError::Config` if the configuration fails
    /// validation.
    pub fn new(config: Config, engine: Arc<dyn TunnelEngine>) -> Result<Self> {
        config.validate()?;

        let adapter = EngineAdapter::new(engine, &config.engine);
        let allocator = AddressAllocator::new(config.pool.network);
        let registry = Arc::new(PeerRegistry::new(allocator, adapter));
        let selector = RoutingSelector::new(Arc::clone(&registry));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (unrecoverable_tx, unrecoverable_rx) =
            mpsc::channel(config.failover.event_queue_depth);

        info!(
            pool = %config.pool.network,
            capacity = registry.allocator().capacity(),
            "control plane assembled"
        );
        Ok(Self {
            config,
            registry,
            selector,
            shutdown_tx,
            shutdown_rx,
            unrecoverable_tx,
            unrecoverable_rx: Mutex::new(Some(unrecoverable_rx)),
            workers: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        })
    }

    /// Spawn the health monitor and failover manager. Calling twice is a
    /// no-op.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("control plane already started");
            return;
        }

        let (health_tx, health_rx) = mpsc::channel(self.config.health.event_queue_depth);

        let monitor = HealthMonitor::new(
            Arc::clone(&self.registry),
            self.config.health.clone(),
            self.config.routing.weights,
            health_tx,
        );
        let manager = Arc::new(FailoverManager::new(
            Arc::clone(&self.registry),
            self.config.failover.clone(),
            self.unrecoverable_tx.clone(),
        ));

        let mut workers = self.workers.lock();
        workers.push(tokio::spawn(monitor.run(self.shutdown_rx.clone())));
        workers.push(tokio::spawn(manager.run(health_rx, self.shutdown_rx.clone())));
        info!("control plane started");
    }

    /// Signal shutdown and wait for the workers to drain
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "worker terminated abnormally");
            }
        }
        info!("control plane stopped");
    }

    /// Provision one device: allocate an address and install the peer
    ///
    /// # Errors
    ///
    /// `DuplicateKey` for a conflicting respecification of a live key,
    /// `PoolExhausted` when no address is free, or an engine error.
    pub async fn create_device(&self, spec: PeerSpec) -> Result<DeviceCreated> {
        let peer = self.registry.add_peer(spec).await?;
        Ok(DeviceCreated {
            public_key: peer.public_key(),
            tunnel_address: peer.tunnel_address(),
        })
    }

    /// Remove a device and reclaim its address
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown or already-removed keys.
    pub async fn remove_device(&self, key: &PublicKey) -> Result<()> {
        self.registry.remove_peer(key).await?;
        Ok(())
    }

    /// Point-in-time status of one device
    #[must_use]
    pub fn device_status(&self, key: &PublicKey) -> Option<PeerSnapshot> {
        self.registry.lookup(key).map(|peer| peer.snapshot())
    }

    /// Pick the egress peer for a destination
    ///
    /// # Errors
    ///
    /// `NoRoute` when no routable peer covers the destination.
    pub fn select_route(&self, destination: IpAddr) -> Result<Arc<Peer>> {
        Ok(self.selector.select_peer(destination)?)
    }

    /// Provision a whole peer set, e.g. at daemon startup. Replaying
    /// specs already provisioned is a no-op per peer, so feeding the
    /// same set twice converges instead of erroring.
    ///
    /// # Errors
    ///
    /// Stops at the first failing spec and surfaces its error.
    pub async fn bootstrap(&self, specs: Vec<PeerSpec>) -> Result<usize> {
        let total = specs.len();
        for spec in specs {
            self.registry.add_peer(spec).await?;
        }
        info!(peers = total, "bootstrap complete");
        Ok(total)
    }

    /// Aggregate counters across all live peers
    #[must_use]
    pub fn totals(&self) -> PlaneTotals {
        let mut totals = PlaneTotals::default();
        for snapshot in self.registry.snapshot_all() {
            totals.peers += 1;
            totals.rx_bytes += snapshot.rx_bytes;
            totals.tx_bytes += snapshot.tx_bytes;
            totals.rx_packets += snapshot.rx_packets;
            totals.tx_packets += snapshot.tx_packets;
        }
        totals
    }

    /// Take the unrecoverable-peer event stream. Yields `Some` exactly
    /// once; the caller owns draining it.
    #[must_use]
    pub fn take_unrecoverable_events(&self) -> Option<mpsc::Receiver<UnrecoverableEvent>> {
        self.unrecoverable_rx.lock().take()
    }

    /// The underlying registry, for status endpoints and tests
    #[must_use]
    pub const fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }
}

impl std::fmt::Debug for ControlPlane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlPlane")
            .field("registry", &self.registry)
            .field("started", &self.started.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::config::HealthConfig;
    use crate::engine::MockEngine;
    use crate::error::{ControlError, RegistryError};
    use crate::peer::PeerState;

    fn fast_plane(engine: Arc<MockEngine>) -> ControlPlane {
        let config = Config {
            health: HealthConfig {
                tick_interval_ms: 10,
                keepalive_interval_ms: 100,
                handshake_timeout_ms: 50,
                ..HealthConfig::default()
            },
            ..Config::default()
        };
        ControlPlane::new(config, engine).unwrap()
    }

    fn spec(endpoint: &str) -> PeerSpec {
        PeerSpec::new(
            PublicKey::generate(),
            endpoint.parse().unwrap(),
            vec!["192.0.2.0/24".parse().unwrap()],
        )
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let config = Config {
            health: HealthConfig {
                tick_interval_ms: 0,
                ..HealthConfig::default()
            },
            ..Config::default()
        };
        let result = ControlPlane::new(config, Arc::new(MockEngine::new()));
        assert!(matches!(result, Err(ControlError::Config(_))));
    }

    #[tokio::test]
    async fn test_create_status_remove() {
        let engine = Arc::new(MockEngine::new());
        let plane = fast_plane(Arc::clone(&engine));

        let created = plane.create_device(spec("203.0.113.1:51820")).await.unwrap();
        assert!(engine.is_installed(&created.public_key));

        let status = plane.device_status(&created.public_key).unwrap();
        assert_eq!(status.state, PeerState::Provisioning);
        assert_eq!(status.tunnel_address, created.tunnel_address);

        plane.remove_device(&created.public_key).await.unwrap();
        assert!(plane.device_status(&created.public_key).is_none());

        let err = plane.remove_device(&created.public_key).await.unwrap_err();
        assert!(matches!(
            err,
            ControlError::Registry(RegistryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_bootstrap_replay_converges() {
        let plane = fast_plane(Arc::new(MockEngine::new()));
        let specs = vec![spec("203.0.113.1:51820"), spec("203.0.113.2:51820")];

        assert_eq!(plane.bootstrap(specs.clone()).await.unwrap(), 2);
        assert_eq!(plane.bootstrap(specs).await.unwrap(), 2);
        assert_eq!(plane.registry().len(), 2);
        assert_eq!(plane.registry().allocator().assigned_count(), 2);
    }

    #[tokio::test]
    async fn test_workers_drive_peer_to_alive_and_route() {
        let plane = fast_plane(Arc::new(MockEngine::new()));
        plane.start();

        let created = plane.create_device(spec("203.0.113.1:51820")).await.unwrap();

        // A few 10ms ticks are enough for the first classification
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let status = plane.device_status(&created.public_key).unwrap();
        assert_eq!(status.state, PeerState::Alive);

        let route = plane.select_route("192.0.2.7".parse().unwrap()).unwrap();
        assert_eq!(route.public_key(), created.public_key);

        plane.shutdown().await;
    }

    #[tokio::test]
    async fn test_select_route_no_candidates() {
        let plane = fast_plane(Arc::new(MockEngine::new()));
        let err = plane.select_route("192.0.2.7".parse().unwrap()).unwrap_err();
        assert!(matches!(err, ControlError::Routing(_)));
    }

    #[tokio::test]
    async fn test_totals_aggregate() {
        let engine = Arc::new(MockEngine::new());
        let plane = fast_plane(Arc::clone(&engine));
        plane.start();

        let a = plane.create_device(spec("203.0.113.1:51820")).await.unwrap();
        let b = plane.create_device(spec("203.0.113.2:51820")).await.unwrap();
        engine.feed_traffic(&a.public_key, 1000, 500);
        engine.feed_traffic(&b.public_key, 2000, 0);

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        let totals = plane.totals();
        assert_eq!(totals.peers, 2);
        assert_eq!(totals.rx_bytes, 3000);
        assert_eq!(totals.tx_bytes, 500);

        plane.shutdown().await;
    }

    #[tokio::test]
    async fn test_unrecoverable_events_taken_once() {
        let plane = fast_plane(Arc::new(MockEngine::new()));
        assert!(plane.take_unrecoverable_events().is_some());
        assert!(plane.take_unrecoverable_events().is_none());
    }
}
