//! Routing selector
//!
//! Picks the egress peer for a destination address. Candidates are the
//! live peers whose allowed-IP set covers the destination; `Alive` peers
//! always beat `Degraded` ones, and within a tier the lowest load score
//! wins. Ties break on the freshest handshake, then on public key, so a
//! given registry state always yields the same answer.

use std::cmp::Reverse;
use std::net::IpAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::{ConfigError, RoutingError};
use crate::peer::{Peer, PeerState};
use crate::registry::PeerRegistry;

/// Weights folding traffic, latency, and loss into one load score
///
/// The score is `outstanding_bytes * bytes + latency_ms * latency_ms +
/// loss_pct * loss_pct`, truncated to `u64`. Defaults make one
/// millisecond of latency as expensive as a kilobyte of backlog and one
/// percent of loss an order of magnitude worse than that.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadWeights {
    /// Weight per outstanding byte since the last health tick
    pub bytes: f64,
    /// Weight per millisecond of probed round-trip latency
    pub latency_ms: f64,
    /// Weight per percent of probed packet loss
    pub loss_pct: f64,
}

impl Default for LoadWeights {
    fn default() -> Self {
        Self {
            bytes: 1.0,
            latency_ms: 1000.0,
            loss_pct: 10_000.0,
        }
    }
}

impl LoadWeights {
    /// Reject weights that would make scores meaningless
    ///
    /// # Errors
    ///
    /// Returns `ValidationError` if any weight is negative or non-finite.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("bytes", self.bytes),
            ("latency_ms", self.latency_ms),
            ("loss_pct", self.loss_pct),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::ValidationError(format!(
                    "routing weight {name} must be finite and non-negative, got {value}"
                )));
            }
        }
        Ok(())
    }

    /// Fold one tick's observations into a load score
    #[must_use]
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn score(&self, outstanding_bytes: u64, latency: std::time::Duration, loss_pct: f64) -> u64 {
        let latency_ms = latency.as_secs_f64() * 1000.0;
        let score = outstanding_bytes as f64 * self.bytes
            + latency_ms * self.latency_ms
            + loss_pct.max(0.0) * self.loss_pct;
        score.min(u64::MAX as f64) as u64
    }
}

/// Deterministic egress peer selection over the registry
pub struct RoutingSelector {
    registry: Arc<PeerRegistry>,
}

impl RoutingSelector {
    /// Create a selector over a registry
    #[must_use]
    pub fn new(registry: Arc<PeerRegistry>) -> Self {
        Self { registry }
    }

    /// Pick the egress peer for a destination
    ///
    /// # Errors
    ///
    /// Returns [`RoutingError::NoRoute`] when no routable peer covers
    /// the destination.
    pub fn select_peer(&self, destination: IpAddr) -> Result<Arc<Peer>, RoutingError> {
        let candidates = self.registry.lookup_by_destination(destination);

        let selected = Self::best_in(&candidates, PeerState::Alive)
            .or_else(|| Self::best_in(&candidates, PeerState::Degraded));

        match selected {
            Some(peer) => {
                trace!(
                    %destination,
                    peer = %peer.public_key(),
                    state = %peer.state(),
                    load_score = peer.load_score(),
                    "route selected"
                );
                Ok(peer)
            }
            None => {
                debug!(%destination, candidates = candidates.len(), "no routable peer");
                Err(RoutingError::NoRoute(destination))
            }
        }
    }

    fn best_in(candidates: &[Arc<Peer>], tier: PeerState) -> Option<Arc<Peer>> {
        candidates
            .iter()
            .filter(|peer| peer.state() == tier)
            .min_by_key(|peer| {
                (
                    peer.load_score(),
                    Reverse(peer.last_handshake()),
                    peer.public_key(),
                )
            })
            .map(Arc::clone)
    }
}

impl std::fmt::Debug for RoutingSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingSelector").finish_non_exhaustive()
    }
}
