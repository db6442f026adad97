//! Hive Mesh — peer discovery and message routing between routers.
//!
//! Every participant runs a [`Router`] identified by a [`PeerId`] and a
//! free-form type string ("main", "worker", ...). Routers hold one
//! [`PeerSession`] per remote router they talk to. A session reaches its
//! peer either over a direct link supplied by a [`Transport`] or through
//! another session acting as gateway, so two routers without a direct
//! link can still exchange messages as long as a chain of routers connects
//! them.
//!
//! # Architecture
//!
//! - **Protocol**: JSON [`Envelope`]s with eight [`Action`]s (handshake,
//!   close, lookup and its responses, gateway connect, broadcast, message).
//! - **Sessions**: `Waiting → Ready → Closed`, with user messages queued
//!   until the handshake completes.
//! - **Discovery**: lookups ask every registered peer for a router of a
//!   given type; a hit becomes the gateway for a new session.
//! - **Transport**: WebSocket (via `tokio-tungstenite`) or in-memory.
//! - **Node**: a tokio task owning the router, driven through a
//!   [`MeshHandle`].
//!
//! # Quick start
//!
//! ```rust,no_run
//! use hive_mesh::{MeshConfig, MeshNode, NoopHandler};
//!
//! # async fn example() -> Result<(), hive_mesh::MeshError> {
//! let node = MeshNode::start_ws(MeshConfig::with_type("main"), Box::new(NoopHandler)).await?;
//! let session = node.open_session("ws://127.0.0.1:9480", "worker").await?;
//! node.send_message(session, serde_json::json!({"x": 1}), None).await?;
//! node.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod dedup;
pub mod error;
pub mod handler;
pub mod identity;
pub mod lookup;
pub mod memory;
pub mod message;
pub mod node;
pub mod peer;
pub mod router;
pub mod transport;

// ── Re-exports for convenience ──────────────────────────────────────────

pub use config::MeshConfig;
pub use error::MeshError;
pub use handler::{
    ChannelRouterHandler, ChannelSessionHandler, MeshEvent, NoopHandler, ReadyEvent, RouterHandler,
    SessionHandler,
};
pub use identity::{PeerId, RouterIdentity};
pub use lookup::{LookupCallback, LookupResult};
pub use memory::{Delivery, MemoryNetwork, MemoryTransport};
pub use message::{Action, Envelope, LookupHit};
pub use node::{MeshHandle, MeshNode};
pub use peer::{PeerSession, Route, SessionKey, SessionStatus, SessionTable};
pub use router::Router;
pub use transport::{LinkId, Transport, TransportEvent, WsTransport};
