//! MeshNode — runs a [`Router`] on its own task.
//!
//! The router is single-threaded by construction: one task owns it and
//! processes, one at a time,
//! - transport events (inbound envelopes, lost links)
//! - commands sent through a [`MeshHandle`]
//! - a periodic tick that expires overdue lookups
//!
//! Commands carry a oneshot for their reply, so every handle method is an
//! `async fn` that returns once the router has acted.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::MeshConfig;
use crate::error::MeshError;
use crate::handler::{RouterHandler, SessionHandler};
use crate::identity::PeerId;
use crate::lookup::LookupResult;
use crate::peer::SessionKey;
use crate::router::Router;
use crate::transport::{Transport, TransportEvent, WsTransport};

/// Builds the handler of a session once its key is known.
pub type HandlerFactory = Box<dyn FnOnce(SessionKey) -> Box<dyn SessionHandler> + Send>;

enum Command {
    OpenSession {
        target: String,
        peer_type: String,
        handler: Option<HandlerFactory>,
        reply: oneshot::Sender<Result<SessionKey, MeshError>>,
    },
    SendMessage {
        session: SessionKey,
        data: serde_json::Value,
        auth: Option<String>,
        reply: oneshot::Sender<Result<(), MeshError>>,
    },
    Broadcast {
        data: serde_json::Value,
        auth: Option<String>,
        reply: oneshot::Sender<usize>,
    },
    Lookup {
        peer_type: String,
        reply: oneshot::Sender<Option<LookupResult>>,
    },
    CloseSession {
        session: SessionKey,
        reply: oneshot::Sender<Result<(), MeshError>>,
    },
    SetSessionHandler {
        session: SessionKey,
        handler: Box<dyn SessionHandler>,
        reply: oneshot::Sender<Result<(), MeshError>>,
    },
    RegisteredPeers {
        reply: oneshot::Sender<Vec<(PeerId, SessionKey)>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Spawns router tasks.
pub struct MeshNode;

impl MeshNode {
    /// Run a router over `transport`, fed by `events`.
    pub fn spawn(
        config: MeshConfig,
        transport: Box<dyn Transport>,
        events: mpsc::Receiver<TransportEvent>,
        handler: Box<dyn RouterHandler>,
    ) -> MeshHandle {
        let (shutdown_tx, _) = broadcast::channel(4);
        Self::spawn_with_shutdown(config, transport, events, handler, shutdown_tx, None)
    }

    /// Run a router over WebSockets, listening on `config.listen_addr` when
    /// one is set.
    pub async fn start_ws(
        config: MeshConfig,
        handler: Box<dyn RouterHandler>,
    ) -> Result<MeshHandle, MeshError> {
        let (event_tx, event_rx) = mpsc::channel(256);
        let transport = WsTransport::new(event_tx);
        let (shutdown_tx, _) = broadcast::channel(4);

        let local_addr = match config.listen_addr {
            Some(addr) => Some(transport.listen(addr, shutdown_tx.subscribe()).await?),
            None => None,
        };

        Ok(Self::spawn_with_shutdown(
            config,
            Box::new(transport),
            event_rx,
            handler,
            shutdown_tx,
            local_addr,
        ))
    }

    fn spawn_with_shutdown(
        config: MeshConfig,
        transport: Box<dyn Transport>,
        events: mpsc::Receiver<TransportEvent>,
        handler: Box<dyn RouterHandler>,
        shutdown_tx: broadcast::Sender<()>,
        local_addr: Option<SocketAddr>,
    ) -> MeshHandle {
        let tick_interval = config.tick_interval;
        let lookup_timeout = config.lookup_timeout;
        let router = Router::with_handler(config, transport, handler);
        let peer_id = router.peer_id().clone();
        let (command_tx, command_rx) = mpsc::channel(64);

        let shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            Self::event_loop(router, events, command_rx, tick_interval, shutdown_rx).await;
        });

        MeshHandle {
            peer_id,
            local_addr,
            lookup_timeout,
            commands: command_tx,
            shutdown_tx,
        }
    }

    async fn event_loop(
        mut router: Router,
        mut events: mpsc::Receiver<TransportEvent>,
        mut commands: mpsc::Receiver<Command>,
        tick_interval: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut ticker = tokio::time::interval(tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                Some(event) = events.recv() => {
                    router.handle_transport_event(event);
                }
                command = commands.recv() => {
                    match command {
                        Some(Command::Shutdown { reply }) => {
                            router.dispose();
                            let _ = reply.send(());
                            break;
                        }
                        Some(command) => Self::handle_command(&mut router, command),
                        None => {
                            debug!("All mesh handles dropped");
                            break;
                        }
                    }
                }
                _ = ticker.tick() => {
                    let expired = router.expire_lookups(Instant::now());
                    if expired > 0 {
                        debug!("Expired {expired} lookup(s)");
                    }
                }
                _ = shutdown.recv() => {
                    debug!("Mesh node received shutdown signal");
                    break;
                }
            }
        }

        router.dispose();
        info!("Mesh node {} stopped", router.peer_id());
    }

    fn handle_command(router: &mut Router, command: Command) {
        match command {
            Command::OpenSession {
                target,
                peer_type,
                handler,
                reply,
            } => {
                let result = router.open_session(&target, &peer_type).and_then(|key| {
                    if let Some(make) = handler {
                        let has_handler = router.session(key).is_some_and(|s| s.has_handler());
                        if !has_handler {
                            router.set_session_handler(key, make(key))?;
                        }
                    }
                    Ok(key)
                });
                let _ = reply.send(result);
            }
            Command::SendMessage {
                session,
                data,
                auth,
                reply,
            } => {
                let _ = reply.send(router.send_message(session, data, auth));
            }
            Command::Broadcast { data, auth, reply } => {
                let _ = reply.send(router.broadcast(data, auth));
            }
            Command::Lookup { peer_type, reply } => {
                router.lookup(
                    &peer_type,
                    Box::new(move |result| {
                        let _ = reply.send(result);
                    }),
                );
            }
            Command::CloseSession { session, reply } => {
                let _ = reply.send(router.close_session(session));
            }
            Command::SetSessionHandler {
                session,
                handler,
                reply,
            } => {
                let _ = reply.send(router.set_session_handler(session, handler));
            }
            Command::RegisteredPeers { reply } => {
                let _ = reply.send(router.registered_peers());
            }
            Command::Shutdown { reply } => {
                warn!("Shutdown command reached the dispatcher");
                let _ = reply.send(());
            }
        }
    }
}

/// Cloneable handle to a running [`MeshNode`].
#[derive(Clone)]
pub struct MeshHandle {
    peer_id: PeerId,
    local_addr: Option<SocketAddr>,
    lookup_timeout: Option<Duration>,
    commands: mpsc::Sender<Command>,
    shutdown_tx: broadcast::Sender<()>,
}

impl MeshHandle {
    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    /// Address the WebSocket server is bound to, if the node listens.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, MeshError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| MeshError::NodeStopped)?;
        rx.await.map_err(|_| MeshError::NodeStopped)
    }

    /// Open (or join) a session with a router of `peer_type`.
    pub async fn open_session(&self, target: &str, peer_type: &str) -> Result<SessionKey, MeshError> {
        self.open(target, peer_type, None).await
    }

    /// Like [`open_session`](Self::open_session), attaching the handler
    /// built by `make` before any callback can fire. Ignored when an
    /// existing session with its own handler is reused.
    pub async fn open_session_with(
        &self,
        target: &str,
        peer_type: &str,
        make: impl FnOnce(SessionKey) -> Box<dyn SessionHandler> + Send + 'static,
    ) -> Result<SessionKey, MeshError> {
        self.open(target, peer_type, Some(Box::new(make))).await
    }

    async fn open(
        &self,
        target: &str,
        peer_type: &str,
        handler: Option<HandlerFactory>,
    ) -> Result<SessionKey, MeshError> {
        let target = target.to_string();
        let peer_type = peer_type.to_string();
        self.request(|reply| Command::OpenSession {
            target,
            peer_type,
            handler,
            reply,
        })
        .await?
    }

    pub async fn send_message(
        &self,
        session: SessionKey,
        data: serde_json::Value,
        auth: Option<String>,
    ) -> Result<(), MeshError> {
        self.request(|reply| Command::SendMessage {
            session,
            data,
            auth,
            reply,
        })
        .await?
    }

    /// Broadcast to every registered session. Returns the fan-out.
    pub async fn broadcast(
        &self,
        data: serde_json::Value,
        auth: Option<String>,
    ) -> Result<usize, MeshError> {
        self.request(|reply| Command::Broadcast { data, auth, reply })
            .await
    }

    /// Look up a router of `peer_type`. Resolves to `None` when nobody
    /// knows one or the lookup timed out.
    pub async fn lookup(&self, peer_type: &str) -> Result<Option<LookupResult>, MeshError> {
        let peer_type = peer_type.to_string();
        let pending = self.request(|reply| Command::Lookup { peer_type, reply });

        // The router expires lookups on its tick; this only bounds the wait
        // when the tick is coarser than the timeout.
        match self.lookup_timeout {
            Some(timeout) => match tokio::time::timeout(timeout * 2, pending).await {
                Ok(result) => result,
                Err(_) => Ok(None),
            },
            None => pending.await,
        }
    }

    pub async fn close_session(&self, session: SessionKey) -> Result<(), MeshError> {
        self.request(|reply| Command::CloseSession { session, reply })
            .await?
    }

    pub async fn set_session_handler(
        &self,
        session: SessionKey,
        handler: Box<dyn SessionHandler>,
    ) -> Result<(), MeshError> {
        self.request(|reply| Command::SetSessionHandler {
            session,
            handler,
            reply,
        })
        .await?
    }

    /// Handshaken peers in registration order.
    pub async fn registered_peers(&self) -> Result<Vec<(PeerId, SessionKey)>, MeshError> {
        self.request(|reply| Command::RegisteredPeers { reply })
            .await
    }

    /// Dispose the router and stop the node, including its listener.
    pub async fn shutdown(&self) {
        if self
            .request(|reply| Command::Shutdown { reply })
            .await
            .is_err()
        {
            debug!("Mesh node already stopped");
        }
        let _ = self.shutdown_tx.send(());
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{ChannelRouterHandler, MeshEvent, NoopHandler};
    use crate::memory::MemoryNetwork;

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<MeshEvent>) -> MeshEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for mesh event")
            .expect("event channel closed")
    }

    fn listening(peer_type: &str) -> MeshConfig {
        let mut config = MeshConfig::with_type(peer_type);
        config.listen_addr = Some("127.0.0.1:0".parse().unwrap());
        config
    }

    #[tokio::test]
    async fn test_node_start_shutdown() {
        let node = MeshNode::start_ws(listening("main"), Box::new(NoopHandler))
            .await
            .unwrap();
        assert!(node.local_addr().is_some());
        assert!(node.is_running());
        assert!(node.registered_peers().await.unwrap().is_empty());

        node.shutdown().await;
        assert!(matches!(
            node.registered_peers().await,
            Err(MeshError::NodeStopped)
        ));
    }

    #[tokio::test]
    async fn test_lookup_without_peers() {
        let network = MemoryNetwork::new();
        let (_tx, rx) = mpsc::channel(8);
        let node = MeshNode::spawn(
            MeshConfig::default(),
            Box::new(network.transport("solo")),
            rx,
            Box::new(NoopHandler),
        );

        assert_eq!(node.lookup("worker").await.unwrap(), None);
        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_two_nodes_exchange_message() {
        let (worker_handler, mut worker_events) = ChannelRouterHandler::channel();
        let worker = MeshNode::start_ws(listening("worker"), Box::new(worker_handler))
            .await
            .unwrap();
        let addr = worker.local_addr().unwrap();

        let (main_handler, mut main_events) = ChannelRouterHandler::channel();
        let main = MeshNode::start_ws(MeshConfig::with_type("main"), Box::new(main_handler.clone()))
            .await
            .unwrap();

        let session = main
            .open_session_with(&format!("ws://{addr}"), "worker", move |key| {
                Box::new(main_handler.session_handler(key))
            })
            .await
            .unwrap();

        // Queued until the handshake completes.
        main.send_message(session, serde_json::json!({"x": 1}), None)
            .await
            .unwrap();

        match next_event(&mut main_events).await {
            MeshEvent::Ready(event) => {
                assert_eq!(event.session, session);
                assert_eq!(event.peer_id, *worker.peer_id());
                assert_eq!(event.peer_type, "worker");
            }
            other => panic!("Expected Ready, got {other:?}"),
        }

        assert!(matches!(next_event(&mut worker_events).await, MeshEvent::Ready(_)));
        match next_event(&mut worker_events).await {
            MeshEvent::Message { data, auth, .. } => {
                assert_eq!(data, serde_json::json!({"x": 1}));
                assert_eq!(auth, None);
            }
            other => panic!("Expected Message, got {other:?}"),
        }

        let peers = worker.registered_peers().await.unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].0, *main.peer_id());

        main.shutdown().await;
        assert!(matches!(
            next_event(&mut worker_events).await,
            MeshEvent::Closed { .. }
        ));
        worker.shutdown().await;
    }
}
