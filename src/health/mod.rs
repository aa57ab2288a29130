//! Health monitor
//!
//! Periodic liveness classification. Each tick polls the tunnel engine
//! for every live peer, folds the stats into the peer, recomputes its
//! load score, and classifies it from a single snapshot. Transitions are
//! published on a bounded channel for the failover manager; a full queue
//! drops the event with a warning rather than stalling the tick.
//!
//! Classification is a pure function of one snapshot plus the config, so
//! the exact threshold behavior is unit-testable without a runtime.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

use crate::config::HealthConfig;
use crate::peer::{PeerSnapshot, PeerState, PublicKey};
use crate::registry::PeerRegistry;
use crate::routing::LoadWeights;

/// One observed liveness transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthEvent {
    /// Peer that transitioned
    pub public_key: PublicKey,
    /// State before the transition
    pub from: PeerState,
    /// State after the transition
    pub to: PeerState,
}

/// Classify a peer from one coherent snapshot
///
/// Rules, in priority order:
/// - no handshake ever: the peer stays in `Provisioning`
/// - handshake older than the dead ceiling: `Dead`
/// - loss, latency, or handshake age past the degradation thresholds:
///   `Degraded`
/// - otherwise `Alive` (including recovery from `Dead` on a fresh
///   handshake)
#[must_use]
pub fn classify(snapshot: &PeerSnapshot, config: &HealthConfig) -> PeerState {
    let Some(age) = snapshot.handshake_age() else {
        return PeerState::Provisioning;
    };
    if age >= config.dead_handshake_age() {
        return PeerState::Dead;
    }
    if snapshot.loss_pct > config.max_loss_pct
        || snapshot.latency > config.max_latency()
        || age >= config.degraded_handshake_age()
    {
        return PeerState::Degraded;
    }
    PeerState::Alive
}

/// Periodic classifier over the registry
pub struct HealthMonitor {
    registry: Arc<PeerRegistry>,
    config: HealthConfig,
    weights: LoadWeights,
    events: mpsc::Sender<HealthEvent>,
    /// Consecutive clear ticks per degraded peer, for hysteresis
    clear_streaks: DashMap<PublicKey, u32>,
}

impl HealthMonitor {
    /// Create a monitor publishing transitions on `events`
    #[must_use]
    pub fn new(
        registry: Arc<PeerRegistry>,
        config: HealthConfig,
        weights: LoadWeights,
        events: mpsc::Sender<HealthEvent>,
    ) -> Self {
        Self {
            registry,
            config,
            weights,
            events,
            clear_streaks: DashMap::new(),
        }
    }

    /// Run ticks until the shutdown signal flips
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.tick_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            tick_interval_ms = self.config.tick_interval_ms,
            "health monitor started"
        );
        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick().await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("health monitor stopped");
                        return;
                    }
                }
            }
        }
    }

    /// Evaluate every live peer once
    pub async fn tick(&self) {
        let peers = self.registry.live_peers();
        let mut live_keys = HashSet::with_capacity(peers.len());

        for peer in peers {
            let key = peer.public_key();
            live_keys.insert(key);

            match self.registry.engine().peer_stats(&key).await {
                Ok(stats) => peer.record_engine_stats(&stats),
                Err(e) => {
                    peer.record_handshake_failure();
                    debug!(peer = %key, error = %e, "stats poll failed");
                }
            }

            let outstanding = peer.take_byte_delta();
            let snapshot = peer.snapshot();
            peer.set_load_score(self.weights.score(
                outstanding,
                snapshot.latency,
                snapshot.loss_pct,
            ));

            let target = classify(&snapshot, &self.config);
            self.apply(&peer, &snapshot, target);
        }

        // Forget streaks of peers that no longer exist
        self.clear_streaks.retain(|key, _| live_keys.contains(key));
    }

    fn apply(&self, peer: &crate::peer::Peer, snapshot: &PeerSnapshot, target: PeerState) {
        let current = snapshot.state;
        if target == current {
            // A Degraded peer observed Degraded again is a relapse: the
            // recovery streak restarts from zero
            self.clear_streaks.remove(&snapshot.public_key);
            return;
        }

        // Degraded peers recover only after enough consecutive clear
        // ticks; everything else (including Dead -> Alive on a fresh
        // handshake) applies immediately.
        if current == PeerState::Degraded && target == PeerState::Alive {
            let streak = self
                .clear_streaks
                .entry(snapshot.public_key)
                .and_modify(|s| *s += 1)
                .or_insert(1);
            if *streak < self.config.recovery_windows {
                trace!(
                    peer = %snapshot.public_key,
                    streak = *streak,
                    required = self.config.recovery_windows,
                    "recovery streak building"
                );
                return;
            }
        }
        self.clear_streaks.remove(&snapshot.public_key);

        // None means the peer was removed mid-tick; removal wins
        let Some(from) = peer.transition(target) else {
            return;
        };
        info!(peer = %snapshot.public_key, %from, to = %target, "peer state changed");

        let event = HealthEvent {
            public_key: snapshot.public_key,
            from,
            to: target,
        };
        if let Err(e) = self.events.try_send(event) {
            warn!(peer = %snapshot.public_key, error = %e, "health event queue full, event dropped");
        }
    }
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
