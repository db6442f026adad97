//! Mesh configuration for a router / node.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::MeshError;

/// Configuration for a mesh router.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Type this router announces to its peers.
    pub peer_type: String,

    /// How long a lookup may wait for responses before resolving to
    /// nothing. `None` waits forever.
    #[serde(with = "opt_duration_serde")]
    pub lookup_timeout: Option<Duration>,

    /// Suppress re-delivery of broadcasts already seen, keyed by origin and
    /// sequence. Off by default: broadcasts are flooded.
    pub broadcast_dedup: bool,

    /// Maximum number of remembered broadcast keys when dedup is on.
    pub dedup_capacity: usize,

    /// Whether `dispose` closes direct links after sending CLOSED.
    pub close_links_on_dispose: bool,

    /// Address for the WebSocket server, if this node accepts links.
    #[serde(with = "opt_socket_addr_serde")]
    pub listen_addr: Option<SocketAddr>,

    /// How often the node expires overdue lookups (milliseconds on disk).
    #[serde(with = "millis_serde")]
    pub tick_interval: Duration,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            peer_type: "main".to_string(),
            lookup_timeout: Some(Duration::from_secs(10)),
            broadcast_dedup: false,
            dedup_capacity: 4096,
            close_links_on_dispose: true,
            listen_addr: None,
            tick_interval: Duration::from_secs(1),
        }
    }
}

impl MeshConfig {
    /// Default config with the given router type.
    pub fn with_type(peer_type: impl Into<String>) -> Self {
        Self {
            peer_type: peer_type.into(),
            ..Self::default()
        }
    }

    /// Write the config as pretty JSON, creating parent directories.
    pub fn save_to_file(&self, path: &Path) -> Result<(), MeshError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        debug!("Mesh config written to {}", path.display());
        Ok(())
    }

    /// Read the config at `path`. A missing file yields the defaults; an
    /// unreadable or corrupt one is reported and also yields the defaults.
    pub fn load_or_default(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }
        let loaded = std::fs::read_to_string(path)
            .map_err(MeshError::from)
            .and_then(|raw| serde_json::from_str::<MeshConfig>(&raw).map_err(MeshError::from));
        match loaded {
            Ok(config) => config,
            Err(e) => {
                warn!("Ignoring mesh config at {}: {e}", path.display());
                Self::default()
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Serde helpers
// ---------------------------------------------------------------------------

mod opt_socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S: Serializer>(addr: &Option<SocketAddr>, s: S) -> Result<S::Ok, S::Error> {
        match addr {
            Some(addr) => s.serialize_some(&addr.to_string()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<SocketAddr>, D::Error> {
        Option::<String>::deserialize(d)?
            .map(|s| s.parse().map_err(serde::de::Error::custom))
            .transpose()
    }
}

mod millis_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(dur: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(dur.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

mod opt_duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(dur: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match dur {
            Some(dur) => s.serialize_some(&dur.as_secs()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_secs))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
