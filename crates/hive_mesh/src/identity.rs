//! Router identity — peer identifiers and self-description.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A unique identifier for a router on the mesh.
///
/// Generated identifiers are UUID v4 values in uppercase dashed hex, e.g.
/// `3F2504E0-4F89-41D3-9A0C-0305E82C3301`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub String);

impl PeerId {
    /// Generate a new random peer ID.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().hyphenated().to_string().to_uppercase())
    }

    /// Create a PeerId from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Return the inner string representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// How a router presents itself to its peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterIdentity {
    /// Random identifier, fixed for the lifetime of the router.
    pub peer_id: PeerId,
    /// Application-level type of this router (e.g. "main", "worker").
    pub peer_type: String,
}

impl RouterIdentity {
    /// Create a new identity with a fresh PeerId.
    pub fn generate(peer_type: impl Into<String>) -> Self {
        Self {
            peer_id: PeerId::generate(),
            peer_type: peer_type.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
