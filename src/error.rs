//! Error types for vpn-control
//!
//! This module defines the error hierarchy for the peer control plane.
//! Errors are categorized by subsystem and carry a recovery classification:
//! recoverable errors may be retried (by the caller or the next health
//! tick), unrecoverable ones must be surfaced.

use std::io;
use std::net::IpAddr;

use thiserror::Error;

use crate::peer::PublicKey;

/// Top-level error type for vpn-control
#[derive(Debug, Error)]
pub enum ControlError {
    /// Configuration errors (file parsing, validation)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Tunnel address allocation errors
    #[error("Allocator error: {0}")]
    Allocator(#[from] AllocatorError),

    /// Peer registry errors
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Tunnel engine boundary errors
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    /// Routing selection errors
    #[error("Routing error: {0}")]
    Routing(#[from] RoutingError),
}

impl ControlError {
    /// Check if this error is recoverable (can retry operation)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(_) => false,
            Self::Allocator(e) => e.is_recoverable(),
            Self::Registry(e) => e.is_recoverable(),
            Self::Engine(e) => e.is_recoverable(),
            Self::Routing(e) => e.is_recoverable(),
        }
    }
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found or inaccessible
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// JSON parsing error
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Validation error (invalid values, missing required fields)
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// Environment variable error
    #[error("Environment variable error: {name}: {reason}")]
    EnvError { name: String, reason: String },

    /// I/O error while reading config
    #[error("I/O error reading configuration: {0}")]
    IoError(#[from] io::Error),
}

impl ConfigError {
    /// Config errors are not recoverable without user intervention
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }
}

/// Tunnel address allocation errors
#[derive(Debug, Clone, Error)]
pub enum AllocatorError {
    /// No free addresses remain in the pool
    #[error("Address pool exhausted ({capacity} addresses assigned)")]
    PoolExhausted { capacity: usize },
}

impl AllocatorError {
    /// Exhaustion is surfaced to the caller; the allocator never retries
    /// internally. A retry only helps after a peer is removed.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }
}

/// Peer registry errors
#[derive(Debug, Error)]
pub enum RegistryError {
    /// A live peer with this public key already exists with a different
    /// provisioning spec. Replaying an identical spec is a no-op, not
    /// an error.
    #[error("Peer already provisioned: {0}")]
    DuplicateKey(PublicKey),

    /// No peer with this public key
    #[error("Peer not found: {0}")]
    NotFound(PublicKey),

    /// Address allocation failed
    #[error(transparent)]
    Allocator(#[from] AllocatorError),

    /// The tunnel engine rejected the operation
    #[error("Engine rejected operation: {0}")]
    Engine(#[from] EngineError),
}

impl RegistryError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::DuplicateKey(_) | Self::NotFound(_) => false,
            Self::Allocator(e) => e.is_recoverable(),
            Self::Engine(e) => e.is_recoverable(),
        }
    }
}

/// Tunnel engine boundary errors
///
/// Transient failures (connection reset, engine busy) are retried once
/// with backoff inside the adapter; permanent failures (malformed key)
/// surface immediately.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// Transient failure, retry-safe
    #[error("Transient engine failure: {0}")]
    Transient(String),

    /// Permanent failure, retrying will not help
    #[error("Permanent engine failure: {0}")]
    Permanent(String),

    /// The engine call exceeded its deadline
    #[error("Engine call timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },
}

impl EngineError {
    /// Check if this error is recoverable
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        match self {
            Self::Transient(_) | Self::Timeout { .. } => true,
            Self::Permanent(_) => false,
        }
    }

    /// Create a transient error
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    /// Create a permanent error
    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }
}

/// Routing selection errors
#[derive(Debug, Clone, Error)]
pub enum RoutingError {
    /// No alive or degraded peer covers the destination
    #[error("No route to {0}")]
    NoRoute(IpAddr),
}

impl RoutingError {
    /// The caller decides whether to queue, drop, or error the traffic;
    /// a later call may succeed once a peer recovers.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        true
    }
}

/// Type alias for Result with ControlError
pub type Result<T> = std::result::Result<T, ControlError>;
