//! Peer registry
//!
//! The authoritative in-memory map of peer identity to peer state. The
//! registry exclusively owns peer lifetime: every other component
//! requests changes through its API. Provisioning follows an
//! allocate → install → commit sequence with compensation on failure, so
//! one invariant holds across every interleaving: the allocator's
//! assigned set is exactly the set of tunnel addresses held by
//! non-Removed peers.
//!
//! No lock is held across a tunnel engine call. The key→peer map is a
//! `DashMap`, so lookups never starve writers; individual peers use
//! atomics and short `RwLock` sections for their own mutable state.

use std::net::IpAddr;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use ipnet::IpNet;
use tracing::{debug, info, warn};

use crate::allocator::AddressAllocator;
use crate::engine::{EngineAdapter, EnginePeerConfig};
use crate::error::RegistryError;
use crate::peer::{Peer, PeerSnapshot, PeerSpec, PeerState, PublicKey};

/// Authoritative peer map plus the allocator and engine boundary it
/// keeps consistent
pub struct PeerRegistry {
    peers: DashMap<PublicKey, Arc<Peer>>,
    allocator: AddressAllocator,
    engine: EngineAdapter,
}

impl PeerRegistry {
    /// Create a registry over an allocator and an engine adapter
    #[must_use]
    pub fn new(allocator: AddressAllocator, engine: EngineAdapter) -> Self {
        Self {
            peers: DashMap::new(),
            allocator,
            engine,
        }
    }

    /// Provision a peer: allocate an address, install it in the engine,
    /// and commit the entry.
    ///
    /// Replaying a byte-identical spec for an existing peer returns the
    /// existing entry (idempotent bootstrap). A conflicting spec for a
    /// live key is [`RegistryError::DuplicateKey`]. If the engine rejects
    /// the install, the allocated address is released — no leak.
    ///
    /// # Errors
    ///
    /// `DuplicateKey`, `PoolExhausted` (via `Allocator`), or `Engine`.
    pub async fn add_peer(&self, spec: PeerSpec) -> Result<Arc<Peer>, RegistryError> {
        let key = spec.public_key;

        // Replay check before paying for an allocation
        if let Some(existing) = self.lookup(&key) {
            return Self::replay_or_duplicate(&existing, &spec);
        }

        let address = self.allocator.allocate()?;

        let engine_config = EnginePeerConfig {
            public_key: key,
            preshared_key: spec.preshared_key,
            endpoint: spec.endpoint,
            allowed_ips: spec.allowed_ips.clone(),
        };
        loop {
            // Engine call with no registry lock held; compensate on failure
            if let Err(e) = self.engine.install_peer(&engine_config).await {
                self.allocator.release(address);
                warn!(peer = %key, error = %e, "engine rejected install, address released");
                return Err(e.into());
            }

            match self.peers.entry(key) {
                Entry::Vacant(entry) => {
                    let peer = Arc::new(Peer::new(spec, address));
                    entry.insert(Arc::clone(&peer));
                    info!(peer = %key, tunnel_address = %address, "peer provisioned");
                    return Ok(peer);
                }
                Entry::Occupied(entry) => {
                    let existing = Arc::clone(entry.get());
                    drop(entry);
                    if existing.state() == PeerState::Removed {
                        // A removal of the previous holder is still tearing
                        // down its engine state. Its map entry clears only
                        // after the uninstall completes, so wait it out and
                        // install again: the fresh config must land after
                        // the concurrent uninstall, never before.
                        debug!(peer = %key, "waiting out an in-flight removal of the same key");
                        self.wait_for_removal(&key).await;
                        continue;
                    }
                    // Lost a same-key race after our install. Engine installs
                    // are idempotent per key, so the winner's entry stands;
                    // give back our address and classify against the winner.
                    self.allocator.release(address);
                    debug!(peer = %key, "concurrent provision of the same key");
                    return Self::replay_or_duplicate(&existing, &spec);
                }
            }
        }
    }

    /// Wait until a Removed peer's map entry is gone. Bounded: the
    /// removal path always removes the entry, and its engine call is
    /// bounded by the adapter deadline.
    async fn wait_for_removal(&self, key: &PublicKey) {
        loop {
            let removing = self
                .peers
                .get(key)
                .is_some_and(|entry| entry.value().state() == PeerState::Removed);
            if !removing {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    fn replay_or_duplicate(
        existing: &Arc<Peer>,
        spec: &PeerSpec,
    ) -> Result<Arc<Peer>, RegistryError> {
        if existing.matches_spec(spec) {
            debug!(peer = %spec.public_key, "identical spec replayed, no-op");
            Ok(Arc::clone(existing))
        } else {
            Err(RegistryError::DuplicateKey(spec.public_key))
        }
    }

    /// Remove a peer: mark `Removed` (wins all races), uninstall from
    /// the engine best-effort, release its address.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown keys and for repeated removals — the first
    /// call's effects are never doubled.
    pub async fn remove_peer(&self, key: &PublicKey) -> Result<(), RegistryError> {
        let peer = self
            .peers
            .get(key)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(RegistryError::NotFound(*key))?;

        // Exactly one caller wins the removal; the marker also stops any
        // in-flight health or failover update from committing.
        if !peer.mark_removed() {
            return Err(RegistryError::NotFound(*key));
        }

        // Best-effort: a failed uninstall leaves the engine entry for
        // the next reconcile, but never blocks reclaiming the address.
        if let Err(e) = self.engine.uninstall_peer(key).await {
            warn!(peer = %key, error = %e, "engine uninstall failed, continuing removal");
        }

        self.allocator.release(peer.tunnel_address());
        self.peers.remove(key);
        info!(peer = %key, tunnel_address = %peer.tunnel_address(), "peer removed");
        Ok(())
    }

    /// Look up a live peer by public key
    #[must_use]
    pub fn lookup(&self, key: &PublicKey) -> Option<Arc<Peer>> {
        self.peers
            .get(key)
            .map(|entry| Arc::clone(entry.value()))
            .filter(|peer| peer.state() != PeerState::Removed)
    }

    /// All live peers whose allowed-IP set covers the destination
    #[must_use]
    pub fn lookup_by_destination(&self, ip: IpAddr) -> Vec<Arc<Peer>> {
        self.peers
            .iter()
            .filter(|entry| entry.value().state() != PeerState::Removed)
            .filter(|entry| entry.value().covers(ip))
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Retarget a peer's endpoint (failover manager only). Removal wins:
    /// updating a removed or already-gone peer is a silent no-op.
    ///
    /// # Errors
    ///
    /// Surfaces engine failures; the in-memory endpoint is only updated
    /// after the engine accepted the retarget.
    pub async fn update_endpoint(
        &self,
        key: &PublicKey,
        endpoint: SocketAddr,
    ) -> Result<(), RegistryError> {
        let Some(peer) = self.lookup(key) else {
            debug!(peer = %key, "endpoint update for removed peer dropped");
            return Ok(());
        };

        self.engine.update_peer_endpoint(key, endpoint).await?;

        // Re-check after the engine call: no resurrection of peers
        // removed while we were waiting.
        if peer.state() == PeerState::Removed {
            debug!(peer = %key, "peer removed mid-update, endpoint commit dropped");
            return Ok(());
        }
        peer.set_endpoint(endpoint);
        debug!(peer = %key, %endpoint, "endpoint updated");
        Ok(())
    }

    /// Replace a peer's allowed-IP set via an idempotent engine
    /// reinstall.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown keys; surfaces engine failures.
    pub async fn update_allowed_ips(
        &self,
        key: &PublicKey,
        allowed_ips: Vec<IpNet>,
    ) -> Result<(), RegistryError> {
        let peer = self.lookup(key).ok_or(RegistryError::NotFound(*key))?;

        let engine_config = EnginePeerConfig {
            public_key: *key,
            preshared_key: peer.preshared_key(),
            endpoint: peer.endpoint(),
            allowed_ips: allowed_ips.clone(),
        };
        self.engine.install_peer(&engine_config).await?;

        if peer.state() == PeerState::Removed {
            return Ok(());
        }
        peer.set_allowed_ips(allowed_ips);
        info!(peer = %key, "allowed IPs updated");
        Ok(())
    }

    /// All live peers (health monitor iteration)
    #[must_use]
    pub fn live_peers(&self) -> Vec<Arc<Peer>> {
        self.peers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .filter(|peer| peer.state() != PeerState::Removed)
            .collect()
    }

    /// Snapshots of all live peers
    #[must_use]
    pub fn snapshot_all(&self) -> Vec<PeerSnapshot> {
        self.live_peers().iter().map(|p| p.snapshot()).collect()
    }

    /// Number of live peers
    #[must_use]
    pub fn len(&self) -> usize {
        self.live_peers().len()
    }

    /// Whether the registry holds no live peers
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The address allocator (invariant checks and capacity queries)
    #[must_use]
    pub const fn allocator(&self) -> &AddressAllocator {
        &self.allocator
    }

    /// The engine adapter shared with the health and failover workers
    #[must_use]
    pub const fn engine(&self) -> &EngineAdapter {
        &self.engine
    }
}

impl std::fmt::Debug for PeerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerRegistry")
            .field("peers", &self.peers.len())
            .field("allocator", &self.allocator)
            .finish_non_exhaustive()
    }
}
