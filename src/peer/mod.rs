//! Peer data model
//!
//! A [`Peer`] represents one authorized tunnel endpoint. Identity, the
//! preshared key, the tunnel-internal address, and the alternate endpoint
//! list are immutable after provisioning. The active endpoint is replaced
//! by the failover manager; allowed-IP prefixes change only through
//! explicit registry updates. Counters are written exclusively by the
//! health monitor folding in engine stats, and all reads used for
//! classification go through a single [`PeerSnapshot`] per tick so no
//! decision is made on torn state.

mod key;
mod state;

pub use key::{KeyParseError, PresharedKey, PublicKey, KEY_LEN};
pub use state::PeerState;

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, SystemTime};

use ipnet::IpNet;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::engine::EngineStats;

/// Provisioning request for one peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSpec {
    /// Peer identity
    pub public_key: PublicKey,
    /// Optional preshared key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preshared_key: Option<PresharedKey>,
    /// Initial network endpoint
    pub endpoint: SocketAddr,
    /// Ordered backup endpoints tried by the failover manager
    #[serde(default)]
    pub alternate_endpoints: Vec<SocketAddr>,
    /// CIDR prefixes this peer may originate/receive traffic for
    pub allowed_ips: Vec<IpNet>,
}

impl PeerSpec {
    /// Create a spec with no preshared key and no alternates
    #[must_use]
    pub fn new(public_key: PublicKey, endpoint: SocketAddr, allowed_ips: Vec<IpNet>) -> Self {
        Self {
            public_key,
            preshared_key: None,
            endpoint,
            alternate_endpoints: Vec::new(),
            allowed_ips,
        }
    }

    /// Set the preshared key
    #[must_use]
    pub fn with_preshared_key(mut self, psk: PresharedKey) -> Self {
        self.preshared_key = Some(psk);
        self
    }

    /// Set the alternate endpoint list
    #[must_use]
    pub fn with_alternates(mut self, alternates: Vec<SocketAddr>) -> Self {
        self.alternate_endpoints = alternates;
        self
    }
}

/// One authorized tunnel peer
#[derive(Debug)]
pub struct Peer {
    public_key: PublicKey,
    preshared_key: Option<PresharedKey>,
    /// Tunnel-internal address assigned at provisioning, held until removal
    tunnel_address: Ipv4Addr,
    /// Endpoint from the provisioning spec; used for replay matching
    /// even after failover has moved the active endpoint
    provisioned_endpoint: SocketAddr,
    alternate_endpoints: Vec<SocketAddr>,

    endpoint: RwLock<SocketAddr>,
    allowed_ips: RwLock<Vec<IpNet>>,
    state: AtomicU8,

    // Monotonic counters, written only by the health monitor
    rx_bytes: AtomicU64,
    tx_bytes: AtomicU64,
    rx_packets: AtomicU64,
    tx_packets: AtomicU64,
    handshake_failures: AtomicU32,

    last_handshake: RwLock<Option<SystemTime>>,

    // Probe inputs fed by an external prober; microseconds and
    // hundredths of a percent so they fit in atomics
    latency_micros: AtomicU32,
    loss_hundredths: AtomicU32,

    /// Derived ranking value; recomputed each health tick, routing-only
    load_score: AtomicU64,
    /// Byte total at the previous tick, for outstanding-bytes deltas
    bytes_at_last_tick: AtomicU64,
}

impl Peer {
    /// Create a peer in `Provisioning` state from its spec and the
    /// address the allocator assigned
    #[must_use]
    pub fn new(spec: PeerSpec, tunnel_address: Ipv4Addr) -> Self {
        Self {
            public_key: spec.public_key,
            preshared_key: spec.preshared_key,
            tunnel_address,
            provisioned_endpoint: spec.endpoint,
            alternate_endpoints: spec.alternate_endpoints,
            endpoint: RwLock::new(spec.endpoint),
            allowed_ips: RwLock::new(spec.allowed_ips),
            state: AtomicU8::new(PeerState::Provisioning as u8),
            rx_bytes: AtomicU64::new(0),
            tx_bytes: AtomicU64::new(0),
            rx_packets: AtomicU64::new(0),
            tx_packets: AtomicU64::new(0),
            handshake_failures: AtomicU32::new(0),
            last_handshake: RwLock::new(None),
            latency_micros: AtomicU32::new(0),
            loss_hundredths: AtomicU32::new(0),
            load_score: AtomicU64::new(0),
            bytes_at_last_tick: AtomicU64::new(0),
        }
    }

    /// Peer identity
    #[must_use]
    pub const fn public_key(&self) -> PublicKey {
        self.public_key
    }

    /// Optional preshared key
    #[must_use]
    pub const fn preshared_key(&self) -> Option<PresharedKey> {
        self.preshared_key
    }

    /// Tunnel-internal address
    #[must_use]
    pub const fn tunnel_address(&self) -> Ipv4Addr {
        self.tunnel_address
    }

    /// Current active endpoint
    #[must_use]
    pub fn endpoint(&self) -> SocketAddr {
        *self.endpoint.read()
    }

    /// Replace the active endpoint (failover manager only)
    pub fn set_endpoint(&self, endpoint: SocketAddr) {
        *self.endpoint.write() = endpoint;
    }

    /// Ordered backup endpoints, fixed at provisioning
    #[must_use]
    pub fn alternate_endpoints(&self) -> &[SocketAddr] {
        &self.alternate_endpoints
    }

    /// Allowed-IP prefixes
    #[must_use]
    pub fn allowed_ips(&self) -> Vec<IpNet> {
        self.allowed_ips.read().clone()
    }

    /// Replace the allowed-IP set (explicit registry update only)
    pub fn set_allowed_ips(&self, nets: Vec<IpNet>) {
        *self.allowed_ips.write() = nets;
    }

    /// Whether any allowed-IP prefix covers the destination
    #[must_use]
    pub fn covers(&self, ip: std::net::IpAddr) -> bool {
        self.allowed_ips.read().iter().any(|net| net.contains(&ip))
    }

    /// Current liveness state
    #[must_use]
    pub fn state(&self) -> PeerState {
        PeerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Attempt a state transition. Returns the previous state if the
    /// transition was applied, or `None` if it was blocked: `Removed`
    /// is terminal and wins every race, including a second removal.
    pub fn transition(&self, to: PeerState) -> Option<PeerState> {
        let mut cur = self.state.load(Ordering::Acquire);
        loop {
            if PeerState::from_u8(cur).is_terminal() {
                return None;
            }
            match self.state.compare_exchange(
                cur,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(prev) => return Some(PeerState::from_u8(prev)),
                Err(actual) => cur = actual,
            }
        }
    }

    /// Mark the peer removed. Returns `true` for exactly one caller;
    /// concurrent or repeated removals get `false`.
    pub fn mark_removed(&self) -> bool {
        self.transition(PeerState::Removed).is_some()
    }

    /// Whether the provisioning spec matches this peer byte for byte.
    /// Used for idempotent bootstrap replay: an identical `add_peer`
    /// is a no-op, a conflicting one is a duplicate-key error.
    #[must_use]
    pub fn matches_spec(&self, spec: &PeerSpec) -> bool {
        self.public_key == spec.public_key
            && self.preshared_key == spec.preshared_key
            && self.provisioned_endpoint == spec.endpoint
            && self.alternate_endpoints == spec.alternate_endpoints
            && *self.allowed_ips.read() == spec.allowed_ips
    }

    /// Fold one engine stats poll into the peer. Counters only move
    /// forward: the engine reports absolute totals, and `fetch_max`
    /// keeps them monotonic even if polls land out of order.
    pub fn record_engine_stats(&self, stats: &EngineStats) {
        self.rx_bytes.fetch_max(stats.rx_bytes, Ordering::Relaxed);
        self.tx_bytes.fetch_max(stats.tx_bytes, Ordering::Relaxed);
        self.rx_packets.fetch_max(stats.rx_packets, Ordering::Relaxed);
        self.tx_packets.fetch_max(stats.tx_packets, Ordering::Relaxed);

        if let Some(hs) = stats.last_handshake {
            let mut last = self.last_handshake.write();
            if last.map_or(true, |prev| hs > prev) {
                *last = Some(hs);
            }
        }
    }

    /// Record one failed handshake or stats poll
    pub fn record_handshake_failure(&self) {
        self.handshake_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a latency/loss probe result
    pub fn record_probe(&self, latency: Duration, loss_pct: f64) {
        let micros = u32::try_from(latency.as_micros()).unwrap_or(u32::MAX);
        self.latency_micros.store(micros, Ordering::Relaxed);
        let hundredths = (loss_pct.clamp(0.0, 100.0) * 100.0) as u32;
        self.loss_hundredths.store(hundredths, Ordering::Relaxed);
    }

    /// Most recent handshake timestamp
    #[must_use]
    pub fn last_handshake(&self) -> Option<SystemTime> {
        *self.last_handshake.read()
    }

    /// Time since the most recent handshake
    #[must_use]
    pub fn handshake_age(&self) -> Option<Duration> {
        self.last_handshake()
            .map(|hs| SystemTime::now().duration_since(hs).unwrap_or_default())
    }

    /// Current load score (routing ranking only)
    #[must_use]
    pub fn load_score(&self) -> u64 {
        self.load_score.load(Ordering::Relaxed)
    }

    /// Store a freshly derived load score (health monitor only)
    pub fn set_load_score(&self, score: u64) {
        self.load_score.store(score, Ordering::Relaxed);
    }

    /// Bytes moved since the previous call; the health monitor calls
    /// this once per tick to derive the outstanding-bytes load input.
    pub fn take_byte_delta(&self) -> u64 {
        let total = self.rx_bytes.load(Ordering::Relaxed) + self.tx_bytes.load(Ordering::Relaxed);
        let prev = self.bytes_at_last_tick.swap(total, Ordering::Relaxed);
        total.saturating_sub(prev)
    }

    /// Take one coherent copy of everything classification and status
    /// queries need
    #[must_use]
    pub fn snapshot(&self) -> PeerSnapshot {
        PeerSnapshot {
            public_key: self.public_key,
            state: self.state(),
            tunnel_address: self.tunnel_address,
            endpoint: self.endpoint(),
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
            rx_packets: self.rx_packets.load(Ordering::Relaxed),
            tx_packets: self.tx_packets.load(Ordering::Relaxed),
            handshake_failures: self.handshake_failures.load(Ordering::Relaxed),
            last_handshake: self.last_handshake(),
            latency: Duration::from_micros(u64::from(
                self.latency_micros.load(Ordering::Relaxed),
            )),
            loss_pct: f64::from(self.loss_hundredths.load(Ordering::Relaxed)) / 100.0,
            load_score: self.load_score(),
        }
    }
}

/// One coherent, point-in-time view of a peer
#[derive(Debug, Clone, PartialEq)]
pub struct PeerSnapshot {
    /// Peer identity
    pub public_key: PublicKey,
    /// Liveness state at snapshot time
    pub state: PeerState,
    /// Tunnel-internal address
    pub tunnel_address: Ipv4Addr,
    /// Active endpoint at snapshot time
    pub endpoint: SocketAddr,
    /// Received bytes (engine total)
    pub rx_bytes: u64,
    /// Transmitted bytes (engine total)
    pub tx_bytes: u64,
    /// Received packets (engine total)
    pub rx_packets: u64,
    /// Transmitted packets (engine total)
    pub tx_packets: u64,
    /// Failed handshakes / stats polls
    pub handshake_failures: u32,
    /// Most recent handshake timestamp
    pub last_handshake: Option<SystemTime>,
    /// Latest probed round-trip latency
    pub latency: Duration,
    /// Latest probed packet loss, percent
    pub loss_pct: f64,
    /// Load score at snapshot time
    pub load_score: u64,
}

impl PeerSnapshot {
    /// Time since the most recent handshake, at evaluation time
    #[must_use]
    pub fn handshake_age(&self) -> Option<Duration> {
        self.last_handshake
            .map(|hs| SystemTime::now().duration_since(hs).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_spec() -> PeerSpec {
        PeerSpec::new(
            PublicKey::generate(),
            "203.0.113.10:51820".parse().unwrap(),
            vec!["10.8.0.0/24".parse().unwrap()],
        )
    }

    fn test_peer() -> Peer {
        Peer::new(test_spec(), "10.8.0.2".parse().unwrap())
    }

    #[test]
    fn test_new_peer_is_provisioning() {
        let peer = test_peer();
        assert_eq!(peer.state(), PeerState::Provisioning);
        assert!(peer.last_handshake().is_none());
        assert_eq!(peer.load_score(), 0);
    }

    #[test]
    fn test_transition_applies_and_reports_previous() {
        let peer = test_peer();
        assert_eq!(peer.transition(PeerState::Alive), Some(PeerState::Provisioning));
        assert_eq!(peer.transition(PeerState::Degraded), Some(PeerState::Alive));
        assert_eq!(peer.state(), PeerState::Degraded);
    }

    #[test]
    fn test_removed_is_terminal() {
        let peer = test_peer();
        assert!(peer.mark_removed());
        // Second removal loses the race
        assert!(!peer.mark_removed());
        // No resurrection
        assert_eq!(peer.transition(PeerState::Alive), None);
        assert_eq!(peer.state(), PeerState::Removed);
    }

    #[test]
    fn test_counters_are_monotonic() {
        let peer = test_peer();
        peer.record_engine_stats(&EngineStats {
            last_handshake: None,
            rx_bytes: 100,
            tx_bytes: 50,
            rx_packets: 10,
            tx_packets: 5,
        });
        // A stale poll must not move counters backwards
        peer.record_engine_stats(&EngineStats {
            last_handshake: None,
            rx_bytes: 80,
            tx_bytes: 60,
            rx_packets: 8,
            tx_packets: 6,
        });
        let snap = peer.snapshot();
        assert_eq!(snap.rx_bytes, 100);
        assert_eq!(snap.tx_bytes, 60);
        assert_eq!(snap.rx_packets, 10);
        assert_eq!(snap.tx_packets, 6);
    }

    #[test]
    fn test_last_handshake_keeps_newest() {
        let peer = test_peer();
        let earlier = SystemTime::now() - Duration::from_secs(60);
        let later = SystemTime::now();

        peer.record_engine_stats(&EngineStats {
            last_handshake: Some(later),
            ..EngineStats::default()
        });
        peer.record_engine_stats(&EngineStats {
            last_handshake: Some(earlier),
            ..EngineStats::default()
        });
        assert_eq!(peer.last_handshake(), Some(later));
    }

    #[test]
    fn test_byte_delta() {
        let peer = test_peer();
        peer.record_engine_stats(&EngineStats {
            rx_bytes: 1000,
            tx_bytes: 500,
            ..EngineStats::default()
        });
        assert_eq!(peer.take_byte_delta(), 1500);
        assert_eq!(peer.take_byte_delta(), 0);

        peer.record_engine_stats(&EngineStats {
            rx_bytes: 1200,
            tx_bytes: 500,
            ..EngineStats::default()
        });
        assert_eq!(peer.take_byte_delta(), 200);
    }

    #[test]
    fn test_probe_recording() {
        let peer = test_peer();
        peer.record_probe(Duration::from_millis(42), 3.5);
        let snap = peer.snapshot();
        assert_eq!(snap.latency, Duration::from_millis(42));
        assert!((snap.loss_pct - 3.5).abs() < 0.01);
    }

    #[test]
    fn test_matches_spec_survives_failover() {
        let spec = test_spec();
        let peer = Peer::new(spec.clone(), "10.8.0.3".parse().unwrap());
        assert!(peer.matches_spec(&spec));

        // Failover moves the active endpoint; replay matching still holds
        peer.set_endpoint("198.51.100.7:51820".parse().unwrap());
        assert!(peer.matches_spec(&spec));

        let mut other = spec;
        other.allowed_ips = vec!["10.9.0.0/24".parse().unwrap()];
        assert!(!peer.matches_spec(&other));
    }

    #[test]
    fn test_covers() {
        let peer = test_peer();
        assert!(peer.covers("10.8.0.77".parse().unwrap()));
        assert!(!peer.covers("192.0.2.1".parse().unwrap()));
    }

    #[test]
    fn test_concurrent_transitions_respect_removal() {
        use std::sync::Arc;
        use std::thread;

        let peer = Arc::new(test_peer());
        let mut handles = Vec::new();
        for i in 0..8 {
            let peer = Arc::clone(&peer);
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    if i == 0 {
                        peer.mark_removed();
                    } else {
                        peer.transition(PeerState::Alive);
                        peer.transition(PeerState::Degraded);
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(peer.state(), PeerState::Removed);
    }
}
