//! Peer sessions — per-remote-router state and the router's session arena.
//!
//! A [`PeerSession`] walks `Waiting → Ready → Closed`. It reaches its peer
//! either over a direct link or through another session acting as gateway.
//! Sessions live in a [`SessionTable`] owned by exactly one router;
//! gateways are referenced by [`SessionKey`], never by pointer, and the
//! gateway chain is resolved iteratively with cycle detection.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::error::MeshError;
use crate::handler::SessionHandler;
use crate::identity::{PeerId, RouterIdentity};
use crate::message::{Envelope, LookupHit};
use crate::transport::{LinkId, Transport};

/// Handle of a session inside its router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionKey(pub u64);

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// Session status. Ordered; transitions must strictly increase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Link or gateway chosen, handshake not complete. User messages queue.
    Waiting,
    /// Handshake complete.
    Ready,
    /// Terminal.
    Closed,
}

/// How a session reaches its peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Direct(LinkId),
    Gateway(SessionKey),
}

/// State kept about one remote router.
pub struct PeerSession {
    key: SessionKey,
    peer_id: Option<PeerId>,
    peer_type: Option<String>,
    /// Peer we expect to answer the handshake (known ahead for gateway
    /// sessions).
    expected_peer: Option<PeerId>,
    route: Option<Route>,
    status: SessionStatus,
    pending: VecDeque<Envelope>,
    send_counter: u64,
    acknowledged: bool,
    opened_locally: bool,
    connected_at: Option<DateTime<Utc>>,
    handler: Option<Box<dyn SessionHandler>>,
}

impl fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerSession")
            .field("key", &self.key)
            .field("peer_id", &self.peer_id)
            .field("peer_type", &self.peer_type)
            .field("route", &self.route)
            .field("status", &self.status)
            .field("pending", &self.pending.len())
            .field("send_counter", &self.send_counter)
            .finish_non_exhaustive()
    }
}

impl PeerSession {
    fn new(key: SessionKey, opened_locally: bool) -> Self {
        Self {
            key,
            peer_id: None,
            peer_type: None,
            expected_peer: None,
            route: None,
            status: SessionStatus::Waiting,
            pending: VecDeque::new(),
            send_counter: 0,
            acknowledged: false,
            opened_locally,
            connected_at: None,
            handler: None,
        }
    }

    pub fn key(&self) -> SessionKey {
        self.key
    }

    pub fn peer_id(&self) -> Option<&PeerId> {
        self.peer_id.as_ref()
    }

    pub fn peer_type(&self) -> Option<&str> {
        self.peer_type.as_deref()
    }

    pub fn expected_peer(&self) -> Option<&PeerId> {
        self.expected_peer.as_ref()
    }

    pub fn route(&self) -> Option<Route> {
        self.route
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn send_counter(&self) -> u64 {
        self.send_counter
    }

    /// Whether this side already sent its READY.
    pub fn acknowledged(&self) -> bool {
        self.acknowledged
    }

    pub fn opened_locally(&self) -> bool {
        self.opened_locally
    }

    pub fn connected_at(&self) -> Option<DateTime<Utc>> {
        self.connected_at
    }

    pub fn direct_link(&self) -> Option<LinkId> {
        match self.route {
            Some(Route::Direct(link)) => Some(link),
            _ => None,
        }
    }

    pub fn attach_link(&mut self, link: LinkId) {
        self.route = Some(Route::Direct(link));
    }

    pub fn attach_gateway(&mut self, gateway: SessionKey, peer_id: PeerId, peer_type: Option<String>) {
        self.route = Some(Route::Gateway(gateway));
        self.expected_peer = Some(peer_id);
        if peer_type.is_some() {
            self.peer_type = peer_type;
        }
    }

    /// Type the embedder asked for when opening the session.
    pub fn expect_type(&mut self, peer_type: impl Into<String>) {
        self.peer_type = Some(peer_type.into());
    }

    pub fn set_handler(&mut self, handler: Box<dyn SessionHandler>) {
        self.handler = Some(handler);
    }

    pub fn has_handler(&self) -> bool {
        self.handler.is_some()
    }

    pub fn handler_mut(&mut self) -> Option<&mut (dyn SessionHandler + 'static)> {
        self.handler.as_deref_mut()
    }

    /// Move to `status`. Non-increasing transitions leave the session
    /// untouched and return [`MeshError::InvalidStatusTransition`].
    pub fn set_status(&mut self, status: SessionStatus) -> Result<(), MeshError> {
        if status <= self.status {
            return Err(MeshError::InvalidStatusTransition {
                from: self.status,
                to: status,
            });
        }
        trace!("{} {:?} -> {:?}", self.key, self.status, status);
        self.status = status;
        Ok(())
    }

    fn next_seq(&mut self) -> u64 {
        let seq = self.send_counter;
        self.send_counter += 1;
        seq
    }

    /// The peer this session talks to, confirmed or expected.
    fn destination(&self) -> Option<&PeerId> {
        self.peer_id.as_ref().or(self.expected_peer.as_ref())
    }

    /// READY envelope announcing `local`.
    pub fn acknowledge(&mut self, local: &RouterIdentity) -> Envelope {
        self.acknowledged = true;
        let seq = self.next_seq();
        Envelope::ready(seq, local, self.destination())
    }

    /// CONNECT envelope asking the peer to open a session through our
    /// gateway.
    pub fn connect(&mut self, local: &RouterIdentity) -> Result<Envelope, MeshError> {
        let destination = self
            .destination()
            .cloned()
            .ok_or(MeshError::NoTransportAttached)?;
        let seq = self.next_seq();
        Ok(Envelope::connect(
            seq,
            local,
            &destination,
            self.peer_type.as_deref(),
        ))
    }

    pub fn close_envelope(&mut self, local: &RouterIdentity) -> Envelope {
        let seq = self.next_seq();
        Envelope::closed(seq, local, self.destination())
    }

    pub fn message_envelope(
        &mut self,
        local: &RouterIdentity,
        data: serde_json::Value,
        auth: Option<String>,
    ) -> Envelope {
        let seq = self.next_seq();
        let destination = self
            .destination()
            .map(|id| (id, self.peer_type.as_deref().unwrap_or_default()));
        Envelope::message(seq, local, destination, data, auth)
    }

    pub fn lookup_envelope(&mut self, local: &RouterIdentity, wanted_type: &str) -> Envelope {
        let seq = self.next_seq();
        Envelope::lookup(seq, local, self.destination(), wanted_type)
    }

    /// BROADCAST for this session's peer. `seq` is the router's broadcast
    /// sequence, shared by every copy of one broadcast.
    pub fn broadcast_envelope(
        &self,
        local: &RouterIdentity,
        seq: u64,
        data: serde_json::Value,
        auth: Option<String>,
    ) -> Envelope {
        Envelope::broadcast(seq, local, self.destination(), data, auth)
    }

    /// Answer a lookup received from this session's peer.
    pub fn lookup_reply(
        &mut self,
        local: &RouterIdentity,
        wanted_type: &str,
        hit: Option<&LookupHit>,
    ) -> Result<Envelope, MeshError> {
        let requester = self
            .peer_id
            .clone()
            .ok_or(MeshError::NoTransportAttached)?;
        let seq = self.next_seq();
        match hit {
            Some(hit) => Envelope::lookup_found(seq, local, &requester, wanted_type, hit),
            None => Ok(Envelope::lookup_not_found(seq, local, &requester, wanted_type)),
        }
    }

    /// Record the peer's identity and move to READY.
    fn mark_ready(&mut self, peer_id: PeerId, peer_type: String) -> Result<(), MeshError> {
        self.set_status(SessionStatus::Ready)?;
        self.peer_id = Some(peer_id);
        self.peer_type = Some(peer_type);
        self.connected_at = Some(Utc::now());
        Ok(())
    }

    /// Drain the queue, completing destinations that were unknown when the
    /// messages were queued.
    fn take_pending(&mut self) -> Vec<Envelope> {
        let peer_id = self.peer_id.clone();
        let peer_type = self.peer_type.clone().unwrap_or_default();
        self.pending
            .drain(..)
            .map(|env| match &peer_id {
                Some(id) => env.with_destination(id, &peer_type),
                None => env,
            })
            .collect()
    }
}

/// Arena of sessions plus the registry of handshaken peers.
///
/// The registry keeps insertion order, which is the order lookups scan.
#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: HashMap<SessionKey, PeerSession>,
    registry: IndexMap<PeerId, SessionKey>,
    next_key: u64,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a WAITING session with no route yet.
    pub fn create(&mut self, opened_locally: bool) -> SessionKey {
        self.next_key += 1;
        let key = SessionKey(self.next_key);
        self.sessions.insert(key, PeerSession::new(key, opened_locally));
        debug!("Created {key}");
        key
    }

    pub fn get(&self, key: SessionKey) -> Option<&PeerSession> {
        self.sessions.get(&key)
    }

    pub fn get_mut(&mut self, key: SessionKey) -> Result<&mut PeerSession, MeshError> {
        self.sessions
            .get_mut(&key)
            .ok_or(MeshError::UnknownSession(key))
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn keys(&self) -> Vec<SessionKey> {
        let mut keys: Vec<SessionKey> = self.sessions.keys().copied().collect();
        keys.sort();
        keys
    }

    /// Number of handshaken peers.
    pub fn registered_count(&self) -> usize {
        self.registry.len()
    }

    /// Handshaken peers in registration order.
    pub fn registered(&self) -> Vec<(PeerId, SessionKey)> {
        self.registry
            .iter()
            .map(|(id, key)| (id.clone(), *key))
            .collect()
    }

    pub fn lookup_peer(&self, peer_id: &PeerId) -> Option<SessionKey> {
        self.registry.get(peer_id).copied()
    }

    /// First registered session whose peer has `peer_type`, skipping
    /// `exclude`.
    pub fn find_by_type(&self, peer_type: &str, exclude: Option<&PeerId>) -> Option<(PeerId, SessionKey)> {
        self.registry
            .iter()
            .filter(|(id, _)| Some(*id) != exclude)
            .find(|(_, key)| {
                self.sessions
                    .get(*key)
                    .and_then(PeerSession::peer_type)
                    .is_some_and(|t| t == peer_type)
            })
            .map(|(id, key)| (id.clone(), *key))
    }

    /// An unregistered session waiting for a handshake from `peer_id`.
    pub fn pending_for_peer(&self, peer_id: &PeerId) -> Option<SessionKey> {
        self.sessions
            .values()
            .filter(|s| s.status == SessionStatus::Waiting)
            .find(|s| s.expected_peer.as_ref() == Some(peer_id))
            .map(PeerSession::key)
    }

    /// An unregistered session waiting for a handshake over `link`.
    pub fn pending_for_link(&self, link: LinkId) -> Option<SessionKey> {
        self.sessions
            .values()
            .filter(|s| s.status == SessionStatus::Waiting && s.expected_peer.is_none())
            .find(|s| s.direct_link() == Some(link))
            .map(PeerSession::key)
    }

    /// Any live session directly attached to `link`.
    pub fn session_for_link(&self, link: LinkId) -> Option<SessionKey> {
        self.sessions
            .values()
            .filter(|s| s.status != SessionStatus::Closed)
            .find(|s| s.direct_link() == Some(link))
            .map(PeerSession::key)
    }

    /// Sessions whose route goes through `gateway`.
    pub fn routed_through(&self, gateway: SessionKey) -> Vec<SessionKey> {
        let mut keys: Vec<SessionKey> = self
            .sessions
            .values()
            .filter(|s| s.route == Some(Route::Gateway(gateway)))
            .map(PeerSession::key)
            .collect();
        keys.sort();
        keys
    }

    /// Complete the handshake of `key`: record the peer, move to READY and
    /// register it. Queued messages stay queued until [`flush`](Self::flush).
    pub fn promote(&mut self, key: SessionKey, peer_id: PeerId, peer_type: String) -> Result<(), MeshError> {
        self.get_mut(key)?.mark_ready(peer_id.clone(), peer_type)?;

        if let Some(previous) = self.registry.insert(peer_id.clone(), key) {
            if previous != key {
                warn!("{peer_id} re-registered, replacing {previous} with {key}");
            }
        }
        debug!("Registered {peer_id} as {key}");
        Ok(())
    }

    /// Send everything queued on a READY session, in FIFO order, once.
    /// Returns how many envelopes went out.
    pub fn flush(&mut self, key: SessionKey, transport: &mut dyn Transport) -> Result<usize, MeshError> {
        let session = self.get_mut(key)?;
        if session.status != SessionStatus::Ready {
            return Ok(0);
        }
        let queued = session.take_pending();
        let mut sent = 0;

        for env in queued {
            match self.transmit(key, &env, transport) {
                Ok(()) => sent += 1,
                Err(e) => warn!("Dropping queued message #{} on {key}: {e}", env.seq),
            }
        }
        if sent > 0 {
            debug!("Flushed {sent} queued message(s) on {key}");
        }
        Ok(sent)
    }

    /// Remove a session and its registry entry.
    pub fn remove(&mut self, key: SessionKey) -> Option<PeerSession> {
        let session = self.sessions.remove(&key)?;
        if let Some(peer_id) = &session.peer_id {
            if self.registry.get(peer_id) == Some(&key) {
                self.registry.shift_remove(peer_id);
            }
        }
        debug!("Removed {key}");
        Some(session)
    }

    /// Follow the gateway chain of `key` down to a direct link.
    pub fn resolve_link(&self, key: SessionKey) -> Result<LinkId, MeshError> {
        let mut visited = HashSet::new();
        let mut current = key;

        loop {
            if !visited.insert(current) {
                return Err(MeshError::GatewayCycle(current));
            }
            let session = self
                .sessions
                .get(&current)
                .ok_or(MeshError::UnknownSession(current))?;
            match session.route {
                Some(Route::Direct(link)) => return Ok(link),
                Some(Route::Gateway(next)) => current = next,
                None => return Err(MeshError::NoTransportAttached),
            }
        }
    }

    /// Send an envelope over the session's route, whatever its status.
    pub fn transmit(
        &self,
        key: SessionKey,
        envelope: &Envelope,
        transport: &mut dyn Transport,
    ) -> Result<(), MeshError> {
        let link = self.resolve_link(key)?;
        trace!("{key} -> {link}: {:?} #{}", envelope.action, envelope.seq);
        transport.send(link, envelope)
    }

    /// Send an application message: queued while WAITING, transmitted
    /// when READY, dropped once CLOSED.
    pub fn send_user_message(
        &mut self,
        key: SessionKey,
        local: &RouterIdentity,
        data: serde_json::Value,
        auth: Option<String>,
        transport: &mut dyn Transport,
    ) -> Result<(), MeshError> {
        let session = self.get_mut(key)?;
        let env = session.message_envelope(local, data, auth);

        match session.status {
            SessionStatus::Waiting => {
                debug!("{key} still waiting, message #{} queued", env.seq);
                session.pending.push_back(env);
                Ok(())
            }
            SessionStatus::Ready => self.transmit(key, &env, transport),
            SessionStatus::Closed => {
                warn!("{key} is closed, message #{} dropped", env.seq);
                Ok(())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Action;

    /// Transport that records what would have gone out.
    #[derive(Default)]
    struct Recorder {
        sent: Vec<(LinkId, Envelope)>,
    }

    impl Transport for Recorder {
        fn open(&mut self, _target: &str) -> Result<LinkId, MeshError> {
            Ok(LinkId(99))
        }

        fn send(&mut self, link: LinkId, envelope: &Envelope) -> Result<(), MeshError> {
            self.sent.push((link, envelope.clone()));
            Ok(())
        }

        fn close(&mut self, _link: LinkId) {}
    }

    fn local() -> RouterIdentity {
        RouterIdentity {
            peer_id: PeerId::from_string("LOCAL"),
            peer_type: "main".to_string(),
        }
    }

    #[test]
    fn test_status_is_monotonic() {
        let mut table = SessionTable::new();
        let key = table.create(true);
        let session = table.get_mut(key).unwrap();

        assert_eq!(session.status(), SessionStatus::Waiting);
        assert!(session.set_status(SessionStatus::Waiting).is_err());
        session.set_status(SessionStatus::Ready).unwrap();

        let err = session.set_status(SessionStatus::Waiting).unwrap_err();
        assert!(matches!(
            err,
            MeshError::InvalidStatusTransition {
                from: SessionStatus::Ready,
                to: SessionStatus::Waiting
            }
        ));
        assert_eq!(session.status(), SessionStatus::Ready);

        session.set_status(SessionStatus::Closed).unwrap();
        assert!(session.set_status(SessionStatus::Ready).is_err());
        assert!(session.set_status(SessionStatus::Closed).is_err());
        assert_eq!(session.status(), SessionStatus::Closed);
    }

    #[test]
    fn test_status_can_skip_ready() {
        let mut table = SessionTable::new();
        let key = table.create(true);
        let session = table.get_mut(key).unwrap();
        session.set_status(SessionStatus::Closed).unwrap();
        assert_eq!(session.status(), SessionStatus::Closed);
    }

    #[test]
    fn test_send_without_route_fails() {
        let mut table = SessionTable::new();
        let key = table.create(true);
        let env = table.get_mut(key).unwrap().acknowledge(&local());

        let mut transport = Recorder::default();
        assert!(matches!(
            table.transmit(key, &env, &mut transport),
            Err(MeshError::NoTransportAttached)
        ));
        assert!(transport.sent.is_empty());
    }

    #[test]
    fn test_queue_flushes_in_order_once() {
        let mut table = SessionTable::new();
        let mut transport = Recorder::default();
        let key = table.create(true);
        table.get_mut(key).unwrap().attach_link(LinkId(1));

        for i in 0..3 {
            table
                .send_user_message(key, &local(), serde_json::json!(i), None, &mut transport)
                .unwrap();
        }
        assert!(transport.sent.is_empty());
        assert_eq!(table.get(key).unwrap().pending_len(), 3);

        table
            .promote(key, PeerId::from_string("REMOTE"), "worker".into())
            .unwrap();
        assert!(transport.sent.is_empty());
        assert_eq!(table.flush(key, &mut transport).unwrap(), 3);

        let payloads: Vec<_> = transport.sent.iter().map(|(_, e)| e.data.clone().unwrap()).collect();
        assert_eq!(payloads, vec![serde_json::json!(0), serde_json::json!(1), serde_json::json!(2)]);
        // Destinations are filled in on flush.
        assert!(transport
            .sent
            .iter()
            .all(|(_, e)| e.destination_id == Some(PeerId::from_string("REMOTE"))));
        assert_eq!(table.get(key).unwrap().pending_len(), 0);

        // A second promotion is rejected and a second flush sends nothing.
        assert!(table
            .promote(key, PeerId::from_string("REMOTE"), "worker".into())
            .is_err());
        assert_eq!(table.flush(key, &mut transport).unwrap(), 0);
        assert_eq!(transport.sent.len(), 3);
    }

    #[test]
    fn test_ready_session_sends_immediately() {
        let mut table = SessionTable::new();
        let mut transport = Recorder::default();
        let key = table.create(true);
        table.get_mut(key).unwrap().attach_link(LinkId(4));
        table
            .promote(key, PeerId::from_string("REMOTE"), "worker".into())
            .unwrap();

        table
            .send_user_message(key, &local(), serde_json::json!({"x": 1}), Some("t".into()), &mut transport)
            .unwrap();

        let (link, env) = &transport.sent[0];
        assert_eq!(*link, LinkId(4));
        assert_eq!(env.action, Action::Message);
        assert_eq!(env.authentication.as_deref(), Some("t"));
        assert_eq!(env.destination_type.as_deref(), Some("worker"));
    }

    #[test]
    fn test_gateway_chain_resolves_iteratively() {
        let mut table = SessionTable::new();
        let direct = table.create(true);
        let middle = table.create(false);
        let far = table.create(true);

        table.get_mut(direct).unwrap().attach_link(LinkId(7));
        table
            .get_mut(middle)
            .unwrap()
            .attach_gateway(direct, PeerId::from_string("MIDDLE"), None);
        table
            .get_mut(far)
            .unwrap()
            .attach_gateway(middle, PeerId::from_string("FAR"), Some("worker".into()));

        assert_eq!(table.resolve_link(far).unwrap(), LinkId(7));
        assert_eq!(table.routed_through(direct), vec![middle]);
    }

    #[test]
    fn test_gateway_cycle_detected() {
        let mut table = SessionTable::new();
        let a = table.create(true);
        let b = table.create(true);
        table.get_mut(a).unwrap().attach_gateway(b, PeerId::from_string("B"), None);
        table.get_mut(b).unwrap().attach_gateway(a, PeerId::from_string("A"), None);

        assert!(matches!(table.resolve_link(a), Err(MeshError::GatewayCycle(_))));
    }

    #[test]
    fn test_missing_gateway_reported() {
        let mut table = SessionTable::new();
        let gateway = table.create(true);
        let far = table.create(true);
        table
            .get_mut(far)
            .unwrap()
            .attach_gateway(gateway, PeerId::from_string("FAR"), None);
        table.remove(gateway);

        assert!(matches!(
            table.resolve_link(far),
            Err(MeshError::UnknownSession(k)) if k == gateway
        ));
    }

    #[test]
    fn test_registry_order_and_type_lookup() {
        let mut table = SessionTable::new();

        let mut keys = Vec::new();
        for (i, (id, peer_type)) in [("P1", "worker"), ("P2", "editor"), ("P3", "worker")]
            .into_iter()
            .enumerate()
        {
            let key = table.create(false);
            table.get_mut(key).unwrap().attach_link(LinkId(i as u64));
            table
                .promote(key, PeerId::from_string(id), peer_type.into())
                .unwrap();
            keys.push(key);
        }

        let (first, key) = table.find_by_type("worker", None).unwrap();
        assert_eq!(first.as_str(), "P1");
        assert_eq!(key, keys[0]);

        let (second, _) = table
            .find_by_type("worker", Some(&PeerId::from_string("P1")))
            .unwrap();
        assert_eq!(second.as_str(), "P3");
        assert!(table.find_by_type("viewer", None).is_none());

        table.remove(keys[1]);
        let order: Vec<String> = table
            .registered()
            .into_iter()
            .map(|(id, _)| id.0)
            .collect();
        assert_eq!(order, vec!["P1", "P3"]);
    }

    #[test]
    fn test_sequence_is_per_session() {
        let mut table = SessionTable::new();
        let a = table.create(true);
        let b = table.create(true);

        let first = table.get_mut(a).unwrap().acknowledge(&local());
        let second = table.get_mut(a).unwrap().close_envelope(&local());
        let other = table.get_mut(b).unwrap().acknowledge(&local());

        assert_eq!((first.seq, second.seq, other.seq), (0, 1, 0));
        assert_eq!(table.get(a).unwrap().send_counter(), 2);
    }
}
