//! Peer identity
//!
//! Every network participant is addressed by an opaque 32-byte identifier.
//! Identifiers render as lowercase hex and round-trip through serde as hex strings.

use crate::error::PeerError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Length of a peer identifier in bytes
pub const PEER_ID_LEN: usize = 32;

/// Unique identifier for a node in the network
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct PeerId([u8; PEER_ID_LEN]);

impl PeerId {
    /// Wrap raw identifier bytes
    pub const fn from_bytes(bytes: [u8; PEER_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Build an identifier from a slice, failing on the wrong length
    pub fn from_slice(bytes: &[u8]) -> Result<Self, PeerError> {
        let raw: [u8; PEER_ID_LEN] = bytes.try_into().map_err(|_| {
            PeerError::InvalidPeerId(format!(
                "expected {} bytes, got {}",
                PEER_ID_LEN,
                bytes.len()
            ))
        })?;
        Ok(Self(raw))
    }

    /// Raw identifier bytes
    pub fn as_bytes(&self) -> &[u8; PEER_ID_LEN] {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form keeps topology dumps readable
        write!(f, "PeerId({})", &hex::encode(self.0)[..12])
    }
}

impl FromStr for PeerId {
    type Err = PeerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|e| PeerError::InvalidPeerId(e.to_string()))?;
        Self::from_slice(&bytes)
    }
}

impl Serialize for PeerId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for PeerId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
