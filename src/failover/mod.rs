//! Failover manager
//!
//! Consumes health transitions and rotates degraded or dead peers
//! through their alternate endpoints in list order. Each alternate gets
//! one retarget plus one handshake-wait window; the first fresh
//! handshake wins and the peer is marked `Alive`. Exhausting the list
//! leaves the peer `Dead` and publishes an unrecoverable event for the
//! operator, with no automatic retry.
//!
//! Attempts are single-flight per peer key: a second `Degraded`/`Dead`
//! event arriving while an attempt is running is dropped.

use std::sync::Arc;
use std::time::SystemTime;

use dashmap::DashSet;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::FailoverConfig;
use crate::health::HealthEvent;
use crate::peer::{Peer, PeerState, PublicKey};
use crate::registry::PeerRegistry;

/// A peer whose alternates are all exhausted without recovery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnrecoverableEvent {
    /// The exhausted peer
    pub public_key: PublicKey,
    /// How many alternate endpoints were attempted
    pub attempted: usize,
}

/// Endpoint rotation driven by health events
pub struct FailoverManager {
    registry: Arc<PeerRegistry>,
    config: FailoverConfig,
    in_flight: DashSet<PublicKey>,
    unrecoverable: mpsc::Sender<UnrecoverableEvent>,
}

impl FailoverManager {
    /// Create a manager publishing exhausted peers on `unrecoverable`
    #[must_use]
    pub fn new(
        registry: Arc<PeerRegistry>,
        config: FailoverConfig,
        unrecoverable: mpsc::Sender<UnrecoverableEvent>,
    ) -> Self {
        Self {
            registry,
            config,
            in_flight: DashSet::new(),
            unrecoverable,
        }
    }

    /// Consume health events until the channel closes or shutdown flips
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<HealthEvent>, mut shutdown: watch::Receiver<bool>) {
        info!("failover manager started");
        loop {
            tokio::select! {
                maybe = events.recv() => match maybe {
                    Some(event) => self.dispatch(event),
                    None => break,
                },
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("failover manager stopped");
    }

    fn dispatch(self: &Arc<Self>, event: HealthEvent) {
        if !matches!(event.to, PeerState::Degraded | PeerState::Dead) {
            return;
        }
        // Single-flight: the insert loser drops the event
        if !self.in_flight.insert(event.public_key) {
            debug!(peer = %event.public_key, "failover already in flight, event dropped");
            return;
        }
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            manager.attempt(event.public_key).await;
            manager.in_flight.remove(&event.public_key);
        });
    }

    /// Rotate one peer through its alternates
    async fn attempt(&self, key: PublicKey) {
        let Some(peer) = self.registry.lookup(&key) else {
            return;
        };
        let alternates = peer.alternate_endpoints().to_vec();
        if alternates.is_empty() {
            debug!(peer = %key, "no alternate endpoints, nothing to rotate");
            return;
        }

        info!(peer = %key, alternates = alternates.len(), "failover started");
        for endpoint in &alternates {
            if peer.state() == PeerState::Removed {
                debug!(peer = %key, "peer removed mid-failover, abandoning");
                return;
            }
            let before = peer.last_handshake();
            if let Err(e) = self.registry.update_endpoint(&key, *endpoint).await {
                warn!(peer = %key, %endpoint, error = %e, "retarget failed, trying next alternate");
                continue;
            }
            if self.await_handshake(&peer, before).await {
                // Removal may have won while we were polling
                if peer.transition(PeerState::Alive).is_some() {
                    info!(peer = %key, %endpoint, "failover succeeded");
                }
                return;
            }
            debug!(peer = %key, %endpoint, "no handshake within the wait window");
        }

        if peer.state() == PeerState::Removed {
            return;
        }
        peer.transition(PeerState::Dead);
        warn!(peer = %key, attempted = alternates.len(), "all alternates exhausted, peer unrecoverable");
        let event = UnrecoverableEvent {
            public_key: key,
            attempted: alternates.len(),
        };
        if let Err(e) = self.unrecoverable.try_send(event) {
            warn!(peer = %key, error = %e, "unrecoverable event queue full, event dropped");
        }
    }

    /// Poll stats until a handshake newer than `before` lands or the
    /// wait window closes
    async fn await_handshake(&self, peer: &Arc<Peer>, before: Option<SystemTime>) -> bool {
        let deadline = Instant::now() + self.config.handshake_wait();
        loop {
            match self.registry.engine().peer_stats(&peer.public_key()).await {
                Ok(stats) => peer.record_engine_stats(&stats),
                Err(e) => debug!(peer = %peer.public_key(), error = %e, "stats poll failed during failover"),
            }
            let fresh = peer
                .last_handshake()
                .is_some_and(|hs| before.map_or(true, |b| hs > b));
            if fresh {
                return true;
            }
            if Instant::now() + self.config.handshake_poll() > deadline {
                return false;
            }
            tokio::time::sleep(self.config.handshake_poll()).await;
        }
    }
}

impl std::fmt::Debug for FailoverManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailoverManager")
            .field("config", &self.config)
            .field("in_flight", &self.in_flight.len())
            .finish_non_exhaustive()
    }
}
