//! Peer liveness state machine
//!
//! ```text
//! Provisioning ──[first handshake]──> Alive <──────────────┐
//!      │                               │ ^                 │
//!      │                 [loss/latency/│ │[conditions      │[fresh
//!      │                  stale hs]    v │ clear]           │ handshake]
//!      │                            Degraded                │
//!      │                               │                    │
//!      │              [handshake age > dead ceiling]        │
//!      │                               v                    │
//!      │                             Dead ──────────────────┘
//!      │                               │
//!      └────────────[explicit removal, from any state]──> Removed
//! ```
//!
//! `Removed` is terminal: once set it wins every race, and no later
//! health or failover update may resurrect the peer.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Liveness state of a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum PeerState {
    /// Installed in the engine, no handshake observed yet
    Provisioning = 0,
    /// Healthy: recent handshake, loss and latency within thresholds
    Alive = 1,
    /// Unhealthy but possibly usable: some degradation condition holds
    Degraded = 2,
    /// No handshake within the absolute ceiling
    Dead = 3,
    /// Explicitly removed; terminal
    Removed = 4,
}

impl PeerState {
    /// Decode from the atomic storage representation
    #[must_use]
    pub const fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Provisioning,
            1 => Self::Alive,
            2 => Self::Degraded,
            3 => Self::Dead,
            _ => Self::Removed,
        }
    }

    /// Whether this state accepts no further transitions
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Removed)
    }

    /// Whether a routing selector may send traffic to a peer in this state.
    /// Degraded peers are routable but deprioritized below Alive.
    #[must_use]
    pub const fn is_routable(self) -> bool {
        matches!(self, Self::Alive | Self::Degraded)
    }

    /// Lowercase name, matching the serde representation
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Provisioning => "provisioning",
            Self::Alive => "alive",
            Self::Degraded => "degraded",
            Self::Dead => "dead",
            Self::Removed => "removed",
        }
    }
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_u8_roundtrip() {
        for state in [
            PeerState::Provisioning,
            PeerState::Alive,
            PeerState::Degraded,
            PeerState::Dead,
            PeerState::Removed,
        ] {
            assert_eq!(PeerState::from_u8(state as u8), state);
        }
    }

    #[test]
    fn test_terminal() {
        assert!(PeerState::Removed.is_terminal());
        assert!(!PeerState::Dead.is_terminal());
        assert!(!PeerState::Provisioning.is_terminal());
    }

    #[test]
    fn test_routable() {
        assert!(PeerState::Alive.is_routable());
        assert!(PeerState::Degraded.is_routable());
        assert!(!PeerState::Provisioning.is_routable());
        assert!(!PeerState::Dead.is_routable());
        assert!(!PeerState::Removed.is_routable());
    }

    #[test]
    fn test_serde_lowercase() {
        let json = serde_json::to_string(&PeerState::Degraded).unwrap();
        assert_eq!(json, "\"degraded\"");
        let back: PeerState = serde_json::from_str("\"alive\"").unwrap();
        assert_eq!(back, PeerState::Alive);
    }
}
