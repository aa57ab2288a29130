//! Peer key types
//!
//! Fixed-length opaque key material, displayed and parsed as base64 the
//! way WireGuard tooling renders keys. The preshared key is never printed,
//! not even in debug output.

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Length of peer key material in bytes
pub const KEY_LEN: usize = 32;

/// Error parsing a key from its base64 form
#[derive(Debug, Clone, Error)]
pub enum KeyParseError {
    /// Not valid base64
    #[error("Invalid base64 key: {0}")]
    InvalidBase64(String),

    /// Decoded to the wrong number of bytes
    #[error("Invalid key length: expected {KEY_LEN} bytes, got {0}")]
    InvalidLength(usize),
}

fn decode_key(s: &str) -> Result<[u8; KEY_LEN], KeyParseError> {
    let bytes = STANDARD
        .decode(s)
        .map_err(|e| KeyParseError::InvalidBase64(e.to_string()))?;
    let len = bytes.len();
    bytes
        .try_into()
        .map_err(|_| KeyParseError::InvalidLength(len))
}

/// Peer identity: a fixed-length public key, unique and immutable
/// for the lifetime of the peer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicKey([u8; KEY_LEN]);

impl PublicKey {
    /// Create a key from raw bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Get the raw key bytes
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Generate a random key (test fixtures and mock peers; real keys
    /// come from the caller's key management)
    #[must_use]
    pub fn generate() -> Self {
        Self(rand::random())
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&STANDARD.encode(self.0))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Truncated form keeps log lines readable
        let b64 = STANDARD.encode(self.0);
        write!(f, "PublicKey({}…)", &b64[..8])
    }
}

impl FromStr for PublicKey {
    type Err = KeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode_key(s).map(Self)
    }
}

impl Serialize for PublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

/// Optional symmetric key mixed into the handshake. Immutable after
/// provisioning and redacted everywhere it might be printed.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PresharedKey([u8; KEY_LEN]);

impl PresharedKey {
    /// Create a key from raw bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Get the raw key bytes
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Generate a random preshared key
    #[must_use]
    pub fn generate() -> Self {
        Self(rand::random())
    }
}

impl fmt::Debug for PresharedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PresharedKey(redacted)")
    }
}

impl FromStr for PresharedKey {
    type Err = KeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode_key(s).map(Self)
    }
}

impl Serialize for PresharedKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(self.0))
    }
}

impl<'de> Deserialize<'de> for PresharedKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_key_roundtrip() {
        let key = PublicKey::from_bytes([42u8; KEY_LEN]);
        let encoded = key.to_string();
        let parsed: PublicKey = encoded.parse().unwrap();
        assert_eq!(key, parsed);
    }

    #[test]
    fn test_public_key_display_is_base64() {
        let key = PublicKey::from_bytes([0u8; KEY_LEN]);
        // 32 zero bytes in standard base64
        assert_eq!(
            key.to_string(),
            "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA="
        );
    }

    #[test]
    fn test_public_key_parse_invalid_base64() {
        let result = "not base64 !!!".parse::<PublicKey>();
        assert!(matches!(result, Err(KeyParseError::InvalidBase64(_))));
    }

    #[test]
    fn test_public_key_parse_wrong_length() {
        let short = STANDARD.encode([1u8; 16]);
        let result = short.parse::<PublicKey>();
        assert!(matches!(result, Err(KeyParseError::InvalidLength(16))));
    }

    #[test]
    fn test_public_key_debug_truncated() {
        let key = PublicKey::from_bytes([42u8; KEY_LEN]);
        let debug = format!("{key:?}");
        assert!(debug.starts_with("PublicKey("));
        assert!(debug.len() < key.to_string().len());
    }

    #[test]
    fn test_public_key_generate_unique() {
        let a = PublicKey::generate();
        let b = PublicKey::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn test_public_key_serde() {
        let key = PublicKey::generate();
        let json = serde_json::to_string(&key).unwrap();
        let back: PublicKey = serde_json::from_str(&json).unwrap();
        assert_eq!(key, back);
    }

    #[test]
    fn test_preshared_key_redacted_debug() {
        let psk = PresharedKey::from_bytes([9u8; KEY_LEN]);
        let debug = format!("{psk:?}");
        assert_eq!(debug, "PresharedKey(redacted)");
        assert!(!debug.contains("CQkJ")); // no base64 of the bytes
    }

    #[test]
    fn test_preshared_key_serde_roundtrip() {
        let psk = PresharedKey::generate();
        let json = serde_json::to_string(&psk).unwrap();
        let back: PresharedKey = serde_json::from_str(&json).unwrap();
        assert_eq!(psk, back);
    }
}
