//! Mesh router — session registry, inbound dispatch and the public API.
//!
//! Every inbound envelope is handled to completion by [`Router::handle_inbound`]
//! before the next one is looked at. Envelopes addressed to another router
//! are relayed through the session registered for that router; everything
//! else is dispatched by [`Action`]. Failures never escape dispatch: they
//! are logged and the envelope is dropped.
//!
//! ```text
//!   A                         B                         C
//!   | open link, READY ------>|                         |
//!   |<------------------ READY|                         |
//!   | LOOKUP "worker" ------->|                         |
//!   |<------ LOOKUP_FOUND (C) |                         |
//!   | CONNECT dest=C -------->| CONNECT hops=[B] ------>|
//!   |<------------ READY hops=[B] <--------- READY dest=A|
//!   | READY dest=C ---------->| ----------------------->|
//!   | MESSAGE dest=C -------->| ----------------------->|
//! ```

use std::collections::HashSet;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

use crate::config::MeshConfig;
use crate::dedup::SeenBroadcasts;
use crate::error::MeshError;
use crate::handler::{NoopHandler, ReadyEvent, RouterHandler, SessionHandler};
use crate::identity::{PeerId, RouterIdentity};
use crate::lookup::{LookupCallback, LookupResult, LookupWaiter, PendingLookup};
use crate::message::{Action, Envelope, LookupHit};
use crate::peer::{PeerSession, Route, SessionKey, SessionStatus, SessionTable};
use crate::transport::{LinkId, Transport, TransportEvent};

/// A mesh router. Owns its sessions exclusively.
pub struct Router {
    identity: RouterIdentity,
    config: MeshConfig,
    sessions: SessionTable,
    transport: Box<dyn Transport>,
    handler: Box<dyn RouterHandler>,
    lookups: Vec<PendingLookup>,
    next_lookup: u64,
    next_broadcast: u64,
    seen: Option<SeenBroadcasts>,
    disposed: bool,
}

impl Router {
    /// Create a router with a fresh identity and no router-level handler.
    pub fn new(config: MeshConfig, transport: Box<dyn Transport>) -> Self {
        Self::with_handler(config, transport, Box::new(NoopHandler))
    }

    pub fn with_handler(
        config: MeshConfig,
        transport: Box<dyn Transport>,
        handler: Box<dyn RouterHandler>,
    ) -> Self {
        let identity = RouterIdentity::generate(config.peer_type.clone());
        let seen = config
            .broadcast_dedup
            .then(|| SeenBroadcasts::new(config.dedup_capacity));
        info!(
            "Router '{}' created (peer_id: {})",
            identity.peer_type, identity.peer_id
        );

        Self {
            identity,
            config,
            sessions: SessionTable::new(),
            transport,
            handler,
            lookups: Vec::new(),
            next_lookup: 0,
            next_broadcast: 0,
            seen,
            disposed: false,
        }
    }

    pub fn set_handler(&mut self, handler: Box<dyn RouterHandler>) {
        self.handler = handler;
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.identity.peer_id
    }

    pub fn identity(&self) -> &RouterIdentity {
        &self.identity
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    pub fn session(&self, key: SessionKey) -> Option<&PeerSession> {
        self.sessions.get(key)
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    /// Handshaken peers in registration order.
    pub fn registered_peers(&self) -> Vec<(PeerId, SessionKey)> {
        self.sessions.registered()
    }

    /// Session registered for `peer_id`, if any.
    pub fn session_for_peer(&self, peer_id: &PeerId) -> Option<SessionKey> {
        self.sessions.lookup_peer(peer_id)
    }

    pub fn pending_lookups(&self) -> usize {
        self.lookups.len()
    }

    pub fn set_session_handler(
        &mut self,
        key: SessionKey,
        handler: Box<dyn SessionHandler>,
    ) -> Result<(), MeshError> {
        self.sessions.get_mut(key)?.set_handler(handler);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------------

    /// Feed one transport event into the router.
    pub fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Accepted { link, addr } => {
                debug!("Inbound {link} from {addr}, waiting for handshake");
            }
            TransportEvent::Message { link, text } => self.handle_raw(link, &text),
            TransportEvent::Disconnected { link } => self.handle_link_lost(link),
        }
    }

    /// Decode and dispatch a raw envelope received over `link`.
    pub fn handle_raw(&mut self, link: LinkId, text: &str) {
        match Envelope::from_json(text) {
            Ok(envelope) => self.handle_inbound(link, envelope),
            Err(e) => warn!("Bad envelope on {link}: {e}"),
        }
    }

    /// Dispatch one decoded envelope received over `link`.
    pub fn handle_inbound(&mut self, link: LinkId, envelope: Envelope) {
        if self.disposed {
            trace!("Disposed, ignoring {:?} on {link}", envelope.action);
            return;
        }
        debug!(
            "{link} <- {:?} #{} from {}",
            envelope.action, envelope.seq, envelope.origin_id
        );

        if let Err(e) = self.dispatch(link, envelope) {
            warn!("Dropped envelope on {link}: {e}");
        }
    }

    /// The transport lost `link`: the session on it is gone.
    pub fn handle_link_lost(&mut self, link: LinkId) {
        if self.disposed {
            return;
        }
        match self.sessions.session_for_link(link) {
            Some(key) => {
                info!("{link} lost, closing {key}");
                self.drop_session(key, true);
            }
            None => debug!("{link} lost, no session attached"),
        }
    }

    fn dispatch(&mut self, link: LinkId, envelope: Envelope) -> Result<(), MeshError> {
        if let Some(destination) = &envelope.destination_id {
            if destination != self.peer_id() {
                return self.forward(envelope);
            }
        }

        match envelope.action {
            Action::Ready => self.on_ready(link, envelope),
            Action::Closed => self.on_closed(envelope),
            Action::Lookup => self.on_lookup(envelope),
            Action::LookupFound => self.on_lookup_response(envelope, true),
            Action::LookupNotFound => self.on_lookup_response(envelope, false),
            Action::Connect => self.on_connect(envelope),
            Action::Broadcast => self.on_broadcast(envelope),
            Action::Message => self.on_message(envelope),
        }
    }

    /// Relay an envelope addressed to another router.
    fn forward(&mut self, envelope: Envelope) -> Result<(), MeshError> {
        let Some(destination) = envelope.destination_id.clone() else {
            return Ok(());
        };
        let key = self
            .sessions
            .lookup_peer(&destination)
            .ok_or_else(|| MeshError::UnknownDestination(destination.clone()))?;

        let relayed = envelope.forwarded_by(self.peer_id());
        debug!(
            "Forwarding {:?} from {} to {destination} ({} hops)",
            relayed.action,
            relayed.origin_id,
            relayed.hops.len()
        );
        self.sessions.transmit(key, &relayed, self.transport.as_mut())
    }

    fn on_ready(&mut self, link: LinkId, envelope: Envelope) -> Result<(), MeshError> {
        let origin = envelope.origin_id.clone();

        if let Some(key) = self.sessions.lookup_peer(&origin) {
            debug!("READY from {origin} already registered as {key}");
            return Ok(());
        }

        let key = match self
            .sessions
            .pending_for_peer(&origin)
            .or_else(|| self.sessions.pending_for_link(link))
        {
            Some(key) => key,
            None => self.accept_session(link, &envelope)?,
        };

        self.sessions
            .promote(key, origin.clone(), envelope.origin_type.clone())?;
        info!("Session {key} ready with {origin} ({})", envelope.origin_type);

        // Our READY has to reach the peer before anything queued, or the
        // peer would see messages from an origin it has not registered.
        let session = self.sessions.get_mut(key)?;
        if !session.acknowledged() {
            let reply = session.acknowledge(&self.identity);
            self.sessions.transmit(key, &reply, self.transport.as_mut())?;
        }
        self.sessions.flush(key, self.transport.as_mut())?;

        let event = self.ready_event(key)?;
        let session = self.sessions.get_mut(key)?;
        if !session.opened_locally() && !session.has_handler() {
            if let Some(handler) = self.handler.on_incoming_session(&event) {
                session.set_handler(handler);
            }
        }
        if let Some(handler) = session.handler_mut() {
            handler.on_ready(&event);
        }
        Ok(())
    }

    /// READY from a router nobody here is waiting for: the remote side
    /// opened a link to us. Routed envelopes reuse the last hop as gateway.
    fn accept_session(&mut self, link: LinkId, envelope: &Envelope) -> Result<SessionKey, MeshError> {
        let gateway = envelope
            .last_hop()
            .and_then(|hop| self.sessions.lookup_peer(hop));

        let key = self.sessions.create(false);
        let session = self.sessions.get_mut(key)?;
        match gateway {
            Some(gateway) => session.attach_gateway(gateway, envelope.origin_id.clone(), None),
            None => session.attach_link(link),
        }
        debug!("Accepted {key} for {}", envelope.origin_id);
        Ok(key)
    }

    fn ready_event(&self, key: SessionKey) -> Result<ReadyEvent, MeshError> {
        let session = self.sessions.get(key).ok_or(MeshError::UnknownSession(key))?;
        let gateway = match session.route() {
            Some(Route::Gateway(gateway)) => self
                .sessions
                .get(gateway)
                .and_then(|g| g.peer_id().cloned()),
            _ => None,
        };

        Ok(ReadyEvent {
            session: key,
            peer_id: session.peer_id().cloned().unwrap_or_default(),
            peer_type: session.peer_type().unwrap_or_default().to_string(),
            link: session.direct_link(),
            gateway,
            at: session.connected_at().unwrap_or_else(Utc::now),
        })
    }

    fn on_closed(&mut self, envelope: Envelope) -> Result<(), MeshError> {
        let key = self
            .sessions
            .lookup_peer(&envelope.origin_id)
            .ok_or_else(|| MeshError::UnknownOriginSession(envelope.origin_id.clone()))?;

        info!("{} closed {key}", envelope.origin_id);
        self.drop_session(key, true);
        Ok(())
    }

    fn on_lookup(&mut self, envelope: Envelope) -> Result<(), MeshError> {
        let requester = envelope.origin_id;
        let key = self
            .sessions
            .lookup_peer(&requester)
            .ok_or_else(|| MeshError::UnknownOriginSession(requester.clone()))?;
        let wanted = envelope.destination_type.unwrap_or_default();

        let hit = self
            .sessions
            .find_by_type(&wanted, Some(&requester))
            .map(|(peer_id, _)| LookupHit {
                peer_id,
                peer_type: wanted.clone(),
            });
        debug!(
            "Lookup for '{wanted}' from {requester}: {}",
            hit.as_ref().map_or("not found".to_string(), |h| h.peer_id.to_string())
        );

        let reply = self
            .sessions
            .get_mut(key)?
            .lookup_reply(&self.identity, &wanted, hit.as_ref())?;
        self.sessions.transmit(key, &reply, self.transport.as_mut())
    }

    fn on_lookup_response(&mut self, envelope: Envelope, found: bool) -> Result<(), MeshError> {
        let responder = envelope.origin_id.clone();
        let wanted = envelope.destination_type.clone().unwrap_or_default();

        let Some(index) = self
            .lookups
            .iter()
            .position(|l| l.wanted_type == wanted && l.awaits(&responder))
        else {
            debug!("Lookup response from {responder} for '{wanted}' with no pending lookup");
            return Ok(());
        };

        let gateway_session = self.sessions.lookup_peer(&responder);
        match (found, gateway_session) {
            (true, Some(gateway_session)) => {
                let hit = envelope.lookup_hit()?;
                let lookup = self.lookups.remove(index);
                let result = LookupResult {
                    hit,
                    gateway: responder,
                    gateway_session,
                };
                self.complete_lookup(lookup.release(true), Some(result));
            }
            _ => self.record_lookup_miss(index, &responder),
        }
        Ok(())
    }

    fn record_lookup_miss(&mut self, index: usize, responder: &PeerId) {
        if self.lookups[index].record_miss(responder) {
            let lookup = self.lookups.remove(index);
            self.complete_lookup(lookup.release(false), None);
        }
    }

    fn on_connect(&mut self, envelope: Envelope) -> Result<(), MeshError> {
        let origin = envelope.origin_id.clone();
        let gateway = envelope.last_hop().cloned().ok_or_else(|| {
            MeshError::MalformedEnvelope(format!("CONNECT from {origin} without a gateway hop"))
        })?;
        let gateway_key = self
            .sessions
            .lookup_peer(&gateway)
            .ok_or_else(|| MeshError::UnknownOriginSession(gateway.clone()))?;

        if let Some(existing) = self.sessions.lookup_peer(&origin) {
            debug!("CONNECT from {origin}, already registered as {existing}");
            return Ok(());
        }

        let key = match self.sessions.pending_for_peer(&origin) {
            Some(key) => key,
            None => self.sessions.create(false),
        };
        let session = self.sessions.get_mut(key)?;
        session.attach_gateway(gateway_key, origin.clone(), Some(envelope.origin_type.clone()));
        let reply = session.acknowledge(&self.identity);
        debug!("CONNECT from {origin} via {gateway}, answering on {key}");
        self.sessions.transmit(key, &reply, self.transport.as_mut())
    }

    fn on_broadcast(&mut self, envelope: Envelope) -> Result<(), MeshError> {
        if let Some(seen) = &mut self.seen {
            if !seen.insert((envelope.origin_id.clone(), envelope.seq)) {
                debug!(
                    "Duplicate broadcast #{} from {} suppressed",
                    envelope.seq, envelope.origin_id
                );
                return Ok(());
            }
        }

        let data = envelope.data.clone().unwrap_or_default();
        let auth = envelope.authentication.as_deref();
        self.handler.on_broadcast_message(&data, auth);

        // Flood to everyone except the origin and whoever handed it to us.
        let previous_hop = envelope.last_hop().cloned();
        let relayed = envelope.forwarded_by(self.peer_id());
        let targets: Vec<(PeerId, SessionKey)> = self
            .sessions
            .registered()
            .into_iter()
            .filter(|(id, _)| *id != envelope.origin_id && Some(id) != previous_hop.as_ref())
            .collect();

        for (peer_id, key) in targets {
            let outgoing = relayed.addressed_to(&peer_id);
            match self.sessions.transmit(key, &outgoing, self.transport.as_mut()) {
                Ok(()) => self.notify_broadcast(key, &data, auth),
                Err(e) => warn!("Broadcast relay to {peer_id} failed: {e}"),
            }
        }
        Ok(())
    }

    fn notify_broadcast(&mut self, key: SessionKey, data: &serde_json::Value, auth: Option<&str>) {
        if let Ok(session) = self.sessions.get_mut(key) {
            if let Some(handler) = session.handler_mut() {
                handler.on_broadcast_message(data, auth);
            }
        }
    }

    fn on_message(&mut self, envelope: Envelope) -> Result<(), MeshError> {
        let key = self
            .sessions
            .lookup_peer(&envelope.origin_id)
            .ok_or_else(|| MeshError::UnknownOriginSession(envelope.origin_id.clone()))?;

        let data = envelope.data.unwrap_or_default();
        match self.sessions.get_mut(key)?.handler_mut() {
            Some(handler) => handler.on_message(&data, envelope.authentication.as_deref()),
            None => debug!("Message #{} on {key} has no handler", envelope.seq),
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Public API
    // -----------------------------------------------------------------------

    /// Open (or join) a session with a router of `peer_type`.
    ///
    /// A registered session of that type is returned unchanged, so only one
    /// peer per type is tracked. Otherwise the known peers are asked for a
    /// router of that type; a hit is reached through the answering peer as
    /// gateway, a miss opens a direct link to `target`. Messages sent before
    /// the handshake completes are queued.
    pub fn open_session(&mut self, target: &str, peer_type: &str) -> Result<SessionKey, MeshError> {
        if self.disposed {
            return Err(MeshError::Disposed);
        }
        if let Some((peer_id, key)) = self.sessions.find_by_type(peer_type, None) {
            debug!("Reusing {key} ({peer_id}) for type '{peer_type}'");
            return Ok(key);
        }

        let key = self.sessions.create(true);
        self.sessions.get_mut(key)?.expect_type(peer_type);

        if self.sessions.registered_count() == 0 {
            self.open_direct(key, target)?;
        } else {
            self.start_lookup(
                peer_type,
                LookupWaiter::OpenSession {
                    session: key,
                    target: target.to_string(),
                },
            );
        }
        Ok(key)
    }

    fn open_direct(&mut self, key: SessionKey, target: &str) -> Result<(), MeshError> {
        let link = self.transport.open(target)?;
        let session = self.sessions.get_mut(key)?;
        session.attach_link(link);
        let hello = session.acknowledge(&self.identity);
        info!("Opened {link} to {target} for {key}");
        self.sessions.transmit(key, &hello, self.transport.as_mut())
    }

    fn continue_open(&mut self, key: SessionKey, target: &str, result: Option<LookupResult>) {
        match self.sessions.get(key) {
            Some(session) if session.status() == SessionStatus::Waiting => {}
            _ => {
                debug!("{key} went away before its lookup finished");
                return;
            }
        }

        let outcome = match result {
            Some(result) => self.connect_via(key, result),
            None => self.open_direct(key, target),
        };
        if let Err(e) = outcome {
            warn!("Opening {key} failed: {e}");
        }
    }

    fn connect_via(&mut self, key: SessionKey, result: LookupResult) -> Result<(), MeshError> {
        let session = self.sessions.get_mut(key)?;
        session.attach_gateway(
            result.gateway_session,
            result.hit.peer_id.clone(),
            Some(result.hit.peer_type.clone()),
        );
        let connect = session.connect(&self.identity)?;
        info!(
            "Connecting {key} to {} via {}",
            result.hit.peer_id, result.gateway
        );
        self.sessions.transmit(key, &connect, self.transport.as_mut())
    }

    /// Ask every registered peer for a router of `peer_type`. `callback`
    /// receives the first hit, or `None` once every peer answered
    /// negatively (immediately when there is nobody to ask).
    pub fn lookup(&mut self, peer_type: &str, callback: LookupCallback) {
        if self.disposed {
            callback(None);
            return;
        }
        self.start_lookup(peer_type, LookupWaiter::Callback(callback));
    }

    /// [`lookup`](Self::lookup) with the outcome delivered on a oneshot.
    pub fn lookup_async(&mut self, peer_type: &str) -> oneshot::Receiver<Option<LookupResult>> {
        let (tx, rx) = oneshot::channel();
        self.lookup(
            peer_type,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );
        rx
    }

    fn start_lookup(&mut self, peer_type: &str, waiter: LookupWaiter) {
        self.next_lookup += 1;
        let id = self.next_lookup;
        let mut awaiting = HashSet::new();

        for (peer_id, key) in self.sessions.registered() {
            let sent = self.send_on(key, |session, local| session.lookup_envelope(local, peer_type));
            match sent {
                Ok(()) => {
                    awaiting.insert(peer_id);
                }
                Err(e) => warn!("Lookup {id} could not reach {peer_id}: {e}"),
            }
        }

        debug!(
            "Lookup {id} for '{peer_type}' awaiting {} response(s)",
            awaiting.len()
        );
        if awaiting.is_empty() {
            self.complete_lookup(waiter, None);
            return;
        }

        let deadline = self.config.lookup_timeout.map(|t| Instant::now() + t);
        self.lookups
            .push(PendingLookup::new(id, peer_type, awaiting, deadline, waiter));
    }

    /// Build an envelope on session `key` and send it over its route.
    fn send_on(
        &mut self,
        key: SessionKey,
        build: impl FnOnce(&mut PeerSession, &RouterIdentity) -> Envelope,
    ) -> Result<(), MeshError> {
        let envelope = build(self.sessions.get_mut(key)?, &self.identity);
        self.sessions.transmit(key, &envelope, self.transport.as_mut())
    }

    fn complete_lookup(&mut self, waiter: LookupWaiter, result: Option<LookupResult>) {
        match waiter {
            LookupWaiter::Callback(callback) => callback(result),
            LookupWaiter::OpenSession { session, target } => {
                self.continue_open(session, &target, result)
            }
        }
    }

    /// Resolve every lookup whose deadline has passed to `None`. Returns
    /// how many were expired.
    pub fn expire_lookups(&mut self, now: Instant) -> usize {
        let (expired, live): (Vec<_>, Vec<_>) = std::mem::take(&mut self.lookups)
            .into_iter()
            .partition(|l| l.is_expired(now));
        self.lookups = live;

        let count = expired.len();
        for lookup in expired {
            warn!(
                "Lookup {} for '{}' timed out with {} response(s) missing",
                lookup.id,
                lookup.wanted_type,
                lookup.remaining()
            );
            self.complete_lookup(lookup.release(false), None);
        }
        count
    }

    /// Send an application message on a session. Queued until the session
    /// is READY.
    pub fn send_message(
        &mut self,
        key: SessionKey,
        data: serde_json::Value,
        auth: Option<String>,
    ) -> Result<(), MeshError> {
        if self.disposed {
            return Err(MeshError::Disposed);
        }
        self.sessions
            .send_user_message(key, &self.identity, data, auth, self.transport.as_mut())
    }

    /// Send a broadcast to every registered session. Returns how many
    /// sessions it went out to.
    pub fn broadcast(&mut self, data: serde_json::Value, auth: Option<String>) -> usize {
        if self.disposed {
            return 0;
        }

        // One sequence for every copy, so relayed copies dedup against
        // the direct ones.
        let seq = self.next_broadcast;
        self.next_broadcast += 1;
        if let Some(seen) = &mut self.seen {
            seen.insert((self.identity.peer_id.clone(), seq));
        }

        let mut sent = 0;
        for (peer_id, key) in self.sessions.registered() {
            let result = self.send_on(key, |session, local| {
                session.broadcast_envelope(local, seq, data.clone(), auth.clone())
            });
            match result {
                Ok(()) => {
                    sent += 1;
                    self.notify_broadcast(key, &data, auth.as_deref());
                }
                Err(e) => warn!("Broadcast to {peer_id} failed: {e}"),
            }
        }
        debug!("Broadcast #{seq} sent to {sent} session(s)");
        sent
    }

    /// Close a session: tell the peer, tear down its direct link and forget
    /// it.
    pub fn close_session(&mut self, key: SessionKey) -> Result<(), MeshError> {
        self.send_closed(key)?;
        if self.retire(key, true).is_some() {
            self.drop_dependents(key);
        }
        Ok(())
    }

    fn send_closed(&mut self, key: SessionKey) -> Result<(), MeshError> {
        let session = self.sessions.get_mut(key)?;
        if session.status() == SessionStatus::Closed {
            return Ok(());
        }
        let env = session.close_envelope(&self.identity);
        if let Err(e) = self.sessions.transmit(key, &env, self.transport.as_mut()) {
            warn!("Could not notify {key} of close: {e}");
        }
        Ok(())
    }

    /// Mark a session CLOSED and remove it, optionally closing its link.
    fn retire(&mut self, key: SessionKey, close_link: bool) -> Option<PeerSession> {
        if let Ok(session) = self.sessions.get_mut(key) {
            if let Err(e) = session.set_status(SessionStatus::Closed) {
                warn!("{key}: {e}");
            }
        }
        let session = self.sessions.remove(key)?;

        if close_link {
            if let Some(link) = session.direct_link() {
                self.transport.close(link);
            }
        }
        if let Some(peer_id) = session.peer_id() {
            self.forget_awaited(peer_id);
        }
        Some(session)
    }

    /// The peer closed (or its link died): fire `on_closed` and forget it,
    /// along with every session routed through it.
    fn drop_session(&mut self, key: SessionKey, close_link: bool) {
        if let Some(mut session) = self.retire(key, close_link) {
            if let Some(handler) = session.handler_mut() {
                handler.on_closed();
            }
            self.drop_dependents(key);
        }
    }

    /// Sessions routed through a retired gateway can no longer reach their
    /// peer. Sessions behind those go too.
    fn drop_dependents(&mut self, gateway: SessionKey) {
        for dependent in self.sessions.routed_through(gateway) {
            info!("{dependent} lost its gateway {gateway}, closing");
            self.drop_session(dependent, false);
        }
    }

    /// A peer that will never answer counts as a negative lookup response.
    fn forget_awaited(&mut self, peer_id: &PeerId) {
        let mut index = 0;
        while index < self.lookups.len() {
            if self.lookups[index].awaits(peer_id) && self.lookups[index].record_miss(peer_id) {
                let lookup = self.lookups.remove(index);
                self.complete_lookup(lookup.release(false), None);
                // `complete_lookup` may have started new lookups; rescan.
                index = 0;
            } else {
                index += 1;
            }
        }
    }

    /// Close every registered session, drop everything pending and stop
    /// accepting inbound envelopes.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }

        // Notify every peer first; a gateway must still be around while
        // the sessions routed through it say goodbye.
        let registered = self.sessions.registered();
        for (_, key) in &registered {
            if let Err(e) = self.send_closed(*key) {
                warn!("{key}: {e}");
            }
        }

        // Taken first so retiring sessions cannot resume an `open_session`.
        let lookups = std::mem::take(&mut self.lookups);
        for key in self.sessions.keys() {
            self.retire(key, self.config.close_links_on_dispose);
        }

        for lookup in lookups {
            if let LookupWaiter::Callback(callback) = lookup.release(false) {
                callback(None);
            }
        }

        self.disposed = true;
        info!(
            "Router {} disposed ({} session(s) closed)",
            self.identity.peer_id,
            registered.len()
        );
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
