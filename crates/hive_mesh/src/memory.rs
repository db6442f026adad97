//! In-process transport.
//!
//! A [`MemoryNetwork`] connects named endpoints. Every envelope is encoded
//! to JSON on send and handed over as text, exactly like a socket would.
//! Nothing is delivered on its own: the owner pulls [`Delivery`] values off
//! the network in FIFO order with [`MemoryNetwork::next_delivery`] and feeds
//! them to the addressed router, which makes multi-router scenarios fully
//! deterministic.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::MeshError;
use crate::message::Envelope;
use crate::transport::{LinkId, Transport, TransportEvent};

/// One transport event waiting to be handed to endpoint `to`.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub to: String,
    pub event: TransportEvent,
}

#[derive(Debug, Default)]
struct NetworkState {
    endpoints: HashSet<String>,
    /// Each link end mapped to its owner and the opposite end.
    links: HashMap<LinkId, (String, LinkId)>,
    queue: VecDeque<Delivery>,
    next_link: u64,
    /// Envelopes sent since creation.
    sent: u64,
}

/// A set of endpoints linked in memory. Cheap to clone; clones share state.
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register endpoint `name` and return its transport. Other endpoints
    /// open links to it by name.
    pub fn transport(&self, name: impl Into<String>) -> MemoryTransport {
        let name = name.into();
        self.state.lock().endpoints.insert(name.clone());
        MemoryTransport {
            name,
            network: self.clone(),
        }
    }

    /// Pop the oldest pending delivery.
    pub fn next_delivery(&self) -> Option<Delivery> {
        self.state.lock().queue.pop_front()
    }

    pub fn pending(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Total envelopes sent over the network.
    pub fn sent(&self) -> u64 {
        self.state.lock().sent
    }

    /// Number of open link ends.
    pub fn link_ends(&self) -> usize {
        self.state.lock().links.len()
    }

    /// Drop the link behind `link` as if the connection died, notifying
    /// both ends.
    pub fn sever(&self, link: LinkId) {
        let mut state = self.state.lock();
        if let Some((owner, other)) = state.links.remove(&link) {
            if let Some((peer, _)) = state.links.remove(&other) {
                state.queue.push_back(Delivery {
                    to: peer,
                    event: TransportEvent::Disconnected { link: other },
                });
            }
            state.queue.push_back(Delivery {
                to: owner,
                event: TransportEvent::Disconnected { link },
            });
        }
    }
}

/// [`Transport`] endpoint on a [`MemoryNetwork`].
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    name: String,
    network: MemoryNetwork,
}

impl MemoryTransport {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Transport for MemoryTransport {
    fn open(&mut self, target: &str) -> Result<LinkId, MeshError> {
        let mut state = self.network.state.lock();
        if !state.endpoints.contains(target) {
            return Err(MeshError::Transport(format!("no endpoint named '{target}'")));
        }

        state.next_link += 1;
        let local = LinkId(state.next_link);
        state.next_link += 1;
        let remote = LinkId(state.next_link);

        state.links.insert(local, (self.name.clone(), remote));
        state.links.insert(remote, (target.to_string(), local));
        state.queue.push_back(Delivery {
            to: target.to_string(),
            event: TransportEvent::Accepted {
                link: remote,
                addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            },
        });
        debug!("{} opened {local} to {target} ({remote})", self.name);
        Ok(local)
    }

    fn send(&mut self, link: LinkId, envelope: &Envelope) -> Result<(), MeshError> {
        let text = envelope.to_json()?;
        let mut state = self.network.state.lock();
        let (_, remote) = state
            .links
            .get(&link)
            .cloned()
            .ok_or(MeshError::UnknownLink(link))?;
        let (peer, _) = state
            .links
            .get(&remote)
            .cloned()
            .ok_or(MeshError::UnknownLink(remote))?;

        trace!("{} -> {peer} over {link}: {text}", self.name);
        state.sent += 1;
        state.queue.push_back(Delivery {
            to: peer,
            event: TransportEvent::Message { link: remote, text },
        });
        Ok(())
    }

    fn close(&mut self, link: LinkId) {
        let mut state = self.network.state.lock();
        if let Some((_, remote)) = state.links.remove(&link) {
            if let Some((peer, _)) = state.links.remove(&remote) {
                state.queue.push_back(Delivery {
                    to: peer,
                    event: TransportEvent::Disconnected { link: remote },
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::RouterIdentity;

    #[test]
    fn test_open_send_close() {
        let network = MemoryNetwork::new();
        let mut a = network.transport("a");
        let _b = network.transport("b");

        let link = a.open("b").unwrap();
        let accepted = network.next_delivery().unwrap();
        assert_eq!(accepted.to, "b");
        let TransportEvent::Accepted { link: remote, .. } = accepted.event else {
            panic!("expected Accepted, got {:?}", accepted.event);
        };

        let env = Envelope::ready(0, &RouterIdentity::generate("main"), None);
        a.send(link, &env).unwrap();
        let delivery = network.next_delivery().unwrap();
        match delivery.event {
            TransportEvent::Message { link: l, text } => {
                assert_eq!(l, remote);
                assert_eq!(Envelope::from_json(&text).unwrap(), env);
            }
            other => panic!("expected Message, got {other:?}"),
        }

        a.close(link);
        let closed = network.next_delivery().unwrap();
        assert_eq!(closed.to, "b");
        assert!(matches!(closed.event, TransportEvent::Disconnected { link: l } if l == remote));
        assert!(matches!(a.send(link, &env), Err(MeshError::UnknownLink(_))));
        assert_eq!(network.link_ends(), 0);
    }

    #[test]
    fn test_open_unknown_endpoint() {
        let network = MemoryNetwork::new();
        let mut a = network.transport("a");
        assert!(matches!(a.open("nowhere"), Err(MeshError::Transport(_))));
    }

    #[test]
    fn test_sever_notifies_both_ends() {
        let network = MemoryNetwork::new();
        let mut a = network.transport("a");
        let _b = network.transport("b");
        let link = a.open("b").unwrap();
        network.next_delivery();

        network.sever(link);
        let mut targets: Vec<String> = std::iter::from_fn(|| network.next_delivery())
            .map(|d| d.to)
            .collect();
        targets.sort();
        assert_eq!(targets, vec!["a", "b"]);
    }
}
