//! Mesh error types.

use crate::identity::PeerId;
use crate::peer::{SessionKey, SessionStatus};
use crate::transport::LinkId;

/// Errors that can occur in the hive_mesh crate.
///
/// None of these cross the router's inbound dispatch boundary: they are
/// logged there and the offending envelope is dropped.
#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    /// An envelope was addressed to another router and no session to that
    /// router is registered here.
    #[error("Unknown destination: {0}")]
    UnknownDestination(PeerId),

    /// An envelope references an originating peer that is not registered.
    #[error("Unknown origin session: {0}")]
    UnknownOriginSession(PeerId),

    /// A session has neither a direct link nor a gateway attached.
    #[error("No transport attached to session")]
    NoTransportAttached,

    /// A session status change that would not strictly increase the status.
    #[error("Invalid status transition from {from:?} to {to:?}")]
    InvalidStatusTransition {
        from: SessionStatus,
        to: SessionStatus,
    },

    /// An envelope is missing obligatory fields or could not be decoded.
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// Resolving a session's gateway chain visited the same session twice.
    #[error("Gateway cycle detected at session {0}")]
    GatewayCycle(SessionKey),

    /// The referenced session handle does not exist (or was removed).
    #[error("Unknown session: {0}")]
    UnknownSession(SessionKey),

    /// The transport does not know the referenced link.
    #[error("Unknown link: {0}")]
    UnknownLink(LinkId),

    /// A transport-level error (connect/send).
    #[error("Transport error: {0}")]
    Transport(String),

    /// JSON serialization / deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The router has been disposed.
    #[error("Router disposed")]
    Disposed,

    /// The node task is no longer running.
    #[error("Node stopped")]
    NodeStopped,
}
