//! vpn-control: VPN peer control plane
//!
//! This crate orchestrates an existing tunnel primitive (a WireGuard
//! control interface or compatible) at the control-plane level: peer
//! bookkeeping, tunnel address allocation, health-driven liveness
//! classification, endpoint failover, and load-aware route selection.
//!
//! # Features
//!
//! - **Address Allocation**: Lowest-free-address assignment from a
//!   configured IPv4 pool, with strict exclusivity and address reuse
//! - **Peer Registry**: Authoritative peer map with transactional
//!   provisioning (no address leaks on engine failure)
//! - **Health Monitoring**: Periodic classification into
//!   Provisioning/Alive/Degraded/Dead from handshake recency, latency,
//!   and packet loss
//! - **Failover**: Single-flight rotation through alternate endpoints
//!   on degradation, with an unrecoverable-peer event stream
//! - **Routing**: Deterministic lowest-load egress selection with
//!   Alive-over-Degraded tiering
//!
//! # Architecture
//!
//! ```text
//! Caller → ControlPlane → PeerRegistry → TunnelEngine (adapter)
//!                ↓              ↑
//!          HealthMonitor ──────┘
//!                ↓ events
//!          FailoverManager → unrecoverable events → Caller
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use vpn_control::config::load_config;
//! use vpn_control::{ControlPlane, MockEngine, PeerSpec, PublicKey};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = load_config("/etc/vpn-control/config.json")?;
//!
//! // Production wires a real engine here; MockEngine drives tests
//! let engine = Arc::new(MockEngine::new());
//! let plane = ControlPlane::new(config, engine)?;
//! plane.start();
//!
//! let spec = PeerSpec::new(
//!     PublicKey::generate(),
//!     "203.0.113.1:51820".parse()?,
//!     vec!["10.8.0.0/24".parse()?],
//! );
//! let device = plane.create_device(spec).await?;
//! println!("assigned {}", device.tunnel_address);
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`allocator`]: Tunnel address pool
//! - [`config`]: Configuration types and loading
//! - [`control`]: The assembled control plane facade
//! - [`engine`]: Tunnel engine boundary and adapter
//! - [`error`]: Error types
//! - [`failover`]: Alternate-endpoint rotation
//! - [`health`]: Liveness classification
//! - [`peer`]: Peer model, keys, and state machine
//! - [`registry`]: Authoritative peer map
//! - [`routing`]: Egress peer selection

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod allocator;
pub mod config;
pub mod control;
pub mod engine;
pub mod error;
pub mod failover;
pub mod health;
pub mod peer;
pub mod registry;
pub mod routing;

// Re-export commonly used types at the crate root
pub use allocator::AddressAllocator;
pub use config::{load_config, Config};
pub use control::{ControlPlane, DeviceCreated, PlaneTotals};
pub use engine::{EngineAdapter, EnginePeerConfig, EngineStats, MockEngine, TunnelEngine};
pub use error::{
    AllocatorError, ConfigError, ControlError, EngineError, RegistryError, RoutingError,
};
pub use failover::{FailoverManager, UnrecoverableEvent};
pub use health::{HealthEvent, HealthMonitor};
pub use peer::{Peer, PeerSnapshot, PeerSpec, PeerState, PresharedKey, PublicKey};
pub use registry::PeerRegistry;
pub use routing::{LoadWeights, RoutingSelector};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
