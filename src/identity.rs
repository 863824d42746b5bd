//! # Connection Identity and World Keys
//!
//! This module defines the two identifiers used throughout whorl:
//!
//! - [`ConnId`]: opaque per-connection identifier assigned at accept time
//! - [`WorldKey`]: privacy-preserving group key derived from a network address
//!
//! ## Identity Model
//!
//! whorl deliberately has no accounts. A connection's only durable attribute
//! is the world it lands in, and that is derived from its network address:
//! every client arriving from the same public address resolves to the same
//! [`WorldKey`] and therefore shares a broadcast group. Connections behind
//! one NAT grouping together is the product, not an accident.
//!
//! ## Privacy Invariants
//!
//! The raw address is treated as sensitive:
//!
//! - P1: `WorldKey` derivation is deterministic within a process run
//! - P2: a `WorldKey` never contains a recoverable encoding of the address
//!   (one-way BLAKE3 digest, truncated to [`WORLD_KEY_DIGEST_LEN`] hex chars)
//! - P3: raw addresses never appear in logs above debug level
//!
//! The digest does not need to resist deliberate collision attacks; it needs
//! negligible accidental-collision probability across live connections and
//! strict one-wayness. Truncated BLAKE3 satisfies both at the expected scale.

use std::fmt;

/// Namespace prefix for world keys.
pub const WORLD_KEY_PREFIX: &str = "world-";

/// Number of hex characters of the address digest kept in a world key.
pub const WORLD_KEY_DIGEST_LEN: usize = 8;

/// Number of random bytes in a connection identifier.
pub const CONN_ID_LEN: usize = 8;

// ============================================================================
// ConnId
// ============================================================================

/// Opaque identifier for one live connection.
///
/// Assigned by the transport at accept time and unique for the process run.
/// Rendered as hex for logs and wire payloads.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnId([u8; CONN_ID_LEN]);

impl ConnId {
    /// Generate a fresh connection identifier from OS entropy.
    pub fn generate() -> Result<Self, getrandom::Error> {
        let mut id = [0u8; CONN_ID_LEN];
        getrandom::getrandom(&mut id)?;
        Ok(Self(id))
    }

    /// Construct from raw bytes. Used by tests to build deterministic ids.
    pub fn from_bytes(bytes: [u8; CONN_ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; CONN_ID_LEN] {
        &self.0
    }

    /// Hex rendering used in wire payloads (`new-thought` id, `user-left`).
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

// ============================================================================
// WorldKey
// ============================================================================

/// Group key placing connections that share a network-address fingerprint
/// into the same broadcast world.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct WorldKey(String);

impl WorldKey {
    /// Resolve a world key from a connection's addressing information.
    ///
    /// The candidate address is the first comma-separated entry of the
    /// forwarded-address chain (proxies such as Railway/Render prepend the
    /// client's public address), trimmed of surrounding whitespace. When the
    /// header is absent or its first entry is empty, the transport-reported
    /// address is used instead. There is no error path: some address is
    /// always available, so this always produces a key.
    pub fn resolve(forwarded: Option<&str>, transport_addr: &str) -> Self {
        let candidate = forwarded
            .and_then(|chain| chain.split(',').next())
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .unwrap_or(transport_addr);

        Self::from_address(candidate)
    }

    /// Derive the key for a single candidate address.
    ///
    /// One-way: the key keeps only a truncated BLAKE3 digest of the address.
    fn from_address(addr: &str) -> Self {
        let digest = blake3::hash(addr.as_bytes());
        let hex = digest.to_hex();
        Self(format!("{}{}", WORLD_KEY_PREFIX, &hex[..WORLD_KEY_DIGEST_LEN]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorldKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
