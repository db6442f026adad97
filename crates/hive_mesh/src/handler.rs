//! Embedder callbacks.
//!
//! Sessions and routers call into these traits synchronously while an
//! inbound envelope is being dispatched, so implementations must not block.
//! [`ChannelRouterHandler`] / [`ChannelSessionHandler`] turn the callbacks
//! into [`MeshEvent`]s on a channel for embedders that prefer to poll.

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::identity::PeerId;
use crate::peer::SessionKey;
use crate::transport::LinkId;

/// Details of a completed handshake.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadyEvent {
    pub session: SessionKey,
    pub peer_id: PeerId,
    pub peer_type: String,
    /// Direct link, when the peer is one hop away.
    pub link: Option<LinkId>,
    /// Peer relaying for this session, when routed through a gateway.
    pub gateway: Option<PeerId>,
    pub at: DateTime<Utc>,
}

/// Per-session callbacks.
#[allow(unused_variables)]
pub trait SessionHandler: Send {
    fn on_message(&mut self, data: &serde_json::Value, auth: Option<&str>) {}

    /// Called when a broadcast is delivered to this session's peer.
    fn on_broadcast_message(&mut self, data: &serde_json::Value, auth: Option<&str>) {}

    fn on_ready(&mut self, event: &ReadyEvent) {}

    /// The remote side closed the session or its link went away.
    fn on_closed(&mut self) {}
}

/// Router-wide callbacks.
#[allow(unused_variables)]
pub trait RouterHandler: Send {
    /// Called exactly once per inbound broadcast.
    fn on_broadcast_message(&mut self, data: &serde_json::Value, auth: Option<&str>) {}

    /// A session the embedder did not open (inbound handshake or CONNECT)
    /// just completed its handshake. The returned handler is attached
    /// before `on_ready` fires.
    fn on_incoming_session(&mut self, event: &ReadyEvent) -> Option<Box<dyn SessionHandler>> {
        None
    }
}

/// Router handler that ignores everything.
#[derive(Debug, Default)]
pub struct NoopHandler;

impl RouterHandler for NoopHandler {}

/// A callback, as an event.
#[derive(Debug, Clone, PartialEq)]
pub enum MeshEvent {
    Message {
        session: SessionKey,
        data: serde_json::Value,
        auth: Option<String>,
    },
    /// `session` is `None` for the router-wide broadcast callback.
    Broadcast {
        session: Option<SessionKey>,
        data: serde_json::Value,
        auth: Option<String>,
    },
    Ready(ReadyEvent),
    Closed {
        session: SessionKey,
    },
}

/// Session handler forwarding callbacks as [`MeshEvent`]s.
#[derive(Debug, Clone)]
pub struct ChannelSessionHandler {
    session: SessionKey,
    tx: mpsc::UnboundedSender<MeshEvent>,
}

impl ChannelSessionHandler {
    pub fn new(session: SessionKey, tx: mpsc::UnboundedSender<MeshEvent>) -> Self {
        Self { session, tx }
    }
}

impl SessionHandler for ChannelSessionHandler {
    fn on_message(&mut self, data: &serde_json::Value, auth: Option<&str>) {
        let _ = self.tx.send(MeshEvent::Message {
            session: self.session,
            data: data.clone(),
            auth: auth.map(str::to_string),
        });
    }

    fn on_broadcast_message(&mut self, data: &serde_json::Value, auth: Option<&str>) {
        let _ = self.tx.send(MeshEvent::Broadcast {
            session: Some(self.session),
            data: data.clone(),
            auth: auth.map(str::to_string),
        });
    }

    fn on_ready(&mut self, event: &ReadyEvent) {
        let _ = self.tx.send(MeshEvent::Ready(event.clone()));
    }

    fn on_closed(&mut self) {
        let _ = self.tx.send(MeshEvent::Closed {
            session: self.session,
        });
    }
}

/// Router handler forwarding callbacks as [`MeshEvent`]s. Incoming
/// sessions get a [`ChannelSessionHandler`] on the same channel.
#[derive(Debug, Clone)]
pub struct ChannelRouterHandler {
    tx: mpsc::UnboundedSender<MeshEvent>,
}

impl ChannelRouterHandler {
    pub fn new(tx: mpsc::UnboundedSender<MeshEvent>) -> Self {
        Self { tx }
    }

    /// Convenience: a handler plus the receiving end of its channel.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<MeshEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    /// Session handler for a locally opened session, on the same channel.
    pub fn session_handler(&self, session: SessionKey) -> ChannelSessionHandler {
        ChannelSessionHandler::new(session, self.tx.clone())
    }
}

impl RouterHandler for ChannelRouterHandler {
    fn on_broadcast_message(&mut self, data: &serde_json::Value, auth: Option<&str>) {
        let _ = self.tx.send(MeshEvent::Broadcast {
            session: None,
            data: data.clone(),
            auth: auth.map(str::to_string),
        });
    }

    fn on_incoming_session(&mut self, event: &ReadyEvent) -> Option<Box<dyn SessionHandler>> {
        Some(Box::new(self.session_handler(event.session)))
    }
}
