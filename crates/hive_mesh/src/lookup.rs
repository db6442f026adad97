//! Pending lookups — one-shot listeners for LOOKUP responses.
//!
//! A lookup asks every registered peer whether it knows a router of some
//! type. The listener resolves with the first positive answer, or with
//! `None` once every queried peer has answered negatively, the deadline
//! passes, or the router is disposed. Resolution consumes the listener, so
//! it can only ever fire once.

use std::collections::HashSet;
use std::fmt;
use std::time::Instant;

use tracing::debug;

use crate::identity::PeerId;
use crate::message::LookupHit;
use crate::peer::SessionKey;

/// Outcome of a successful lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupResult {
    /// The router that matched.
    pub hit: LookupHit,
    /// The registered peer that answered, usable as gateway.
    pub gateway: PeerId,
    pub gateway_session: SessionKey,
}

/// Callback receiving the outcome of a lookup.
pub type LookupCallback = Box<dyn FnOnce(Option<LookupResult>) + Send>;

/// What to do with the outcome.
pub(crate) enum LookupWaiter {
    /// Embedder-supplied callback.
    Callback(LookupCallback),
    /// `open_session` continuing with the given session and fallback target.
    OpenSession { session: SessionKey, target: String },
}

impl fmt::Debug for LookupWaiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Callback(_) => f.write_str("Callback"),
            Self::OpenSession { session, target } => f
                .debug_struct("OpenSession")
                .field("session", session)
                .field("target", target)
                .finish(),
        }
    }
}

#[derive(Debug)]
pub(crate) struct PendingLookup {
    pub(crate) id: u64,
    pub(crate) wanted_type: String,
    awaiting: HashSet<PeerId>,
    deadline: Option<Instant>,
    waiter: LookupWaiter,
}

impl PendingLookup {
    pub(crate) fn new(
        id: u64,
        wanted_type: impl Into<String>,
        awaiting: HashSet<PeerId>,
        deadline: Option<Instant>,
        waiter: LookupWaiter,
    ) -> Self {
        Self {
            id,
            wanted_type: wanted_type.into(),
            awaiting,
            deadline,
            waiter,
        }
    }

    pub(crate) fn awaits(&self, peer: &PeerId) -> bool {
        self.awaiting.contains(peer)
    }

    /// Record a negative answer from `peer`. Returns true when nothing is
    /// left to wait for.
    pub(crate) fn record_miss(&mut self, peer: &PeerId) -> bool {
        self.awaiting.remove(peer);
        self.awaiting.is_empty()
    }

    pub(crate) fn remaining(&self) -> usize {
        self.awaiting.len()
    }

    pub(crate) fn is_expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|d| now >= d)
    }

    /// Release the listener, handing back whoever waits for the outcome.
    pub(crate) fn release(self, found: bool) -> LookupWaiter {
        debug!(
            "Lookup {} for '{}' released ({})",
            self.id,
            self.wanted_type,
            if found { "found" } else { "not found" }
        );
        self.waiter
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use parking_lot::Mutex;

    fn peers(ids: &[&str]) -> HashSet<PeerId> {
        ids.iter().map(|id| PeerId::from_string(*id)).collect()
    }

    #[test]
    fn test_record_miss_counts_down() {
        let mut lookup = PendingLookup::new(
            1,
            "worker",
            peers(&["A", "B"]),
            None,
            LookupWaiter::Callback(Box::new(|_| {})),
        );
        assert!(lookup.awaits(&PeerId::from_string("A")));
        assert!(!lookup.record_miss(&PeerId::from_string("A")));
        assert!(!lookup.awaits(&PeerId::from_string("A")));
        assert_eq!(lookup.remaining(), 1);
        assert!(lookup.record_miss(&PeerId::from_string("B")));
    }

    #[test]
    fn test_deadline() {
        let now = Instant::now();
        let lookup = PendingLookup::new(
            1,
            "worker",
            peers(&["A"]),
            Some(now + Duration::from_secs(5)),
            LookupWaiter::Callback(Box::new(|_| {})),
        );
        assert!(!lookup.is_expired(now));
        assert!(lookup.is_expired(now + Duration::from_secs(5)));

        let no_deadline = PendingLookup::new(
            2,
            "worker",
            peers(&["A"]),
            None,
            LookupWaiter::Callback(Box::new(|_| {})),
        );
        assert!(!no_deadline.is_expired(now + Duration::from_secs(3600)));
    }

    #[test]
    fn test_release_hands_back_callback() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let lookup = PendingLookup::new(
            1,
            "worker",
            peers(&["A"]),
            None,
            LookupWaiter::Callback(Box::new(move |result| sink.lock().push(result))),
        );

        match lookup.release(false) {
            LookupWaiter::Callback(callback) => callback(None),
            other => panic!("Expected callback waiter, got {other:?}"),
        }
        assert_eq!(*seen.lock(), vec![None]);
    }
}
