//! Client-scoped command identity.
//!
//! A command is named by (client instance identifier, per-client sequence
//! number). Retried transmissions of one logical write carry the same
//! identity; the sequence tracker uses it for exactly-once apply.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque 16-byte client instance identifier (UUID-shaped).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClientId([u8; 16]);

impl ClientId {
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Convenience constructor from a u128, big-endian.
    pub const fn from_u128(value: u128) -> Self {
        Self(value.to_be_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Debug for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientId({self})")
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Grouped hex, uuid-style.
        let b = &self.0;
        write!(
            f,
            "{:02x}{:02x}{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
            b[8], b[9], b[10], b[11], b[12], b[13], b[14], b[15],
        )
    }
}

/// Compound identity of one logical write operation.
///
/// For a given client, sequence numbers presented to the apply pipeline are
/// non-decreasing; a sequence number at or below the last applied value for
/// that client is a duplicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommandId {
    /// Client instance identifier.
    pub client: ClientId,
    /// Per-client monotonically increasing sequence number.
    pub sequence: u64,
}

impl CommandId {
    pub fn new(client: ClientId, sequence: u64) -> Self {
        Self { client, sequence }
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.client, self.sequence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_stable() {
        let id = CommandId::new(ClientId::from_u128(1), 7);
        assert_eq!(id.to_string(), "00000000-0000-0000-0000-000000000001:7");
    }
}
