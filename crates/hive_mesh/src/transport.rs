//! One-hop transport — the link primitive the router is built on.
//!
//! The router only needs three non-blocking operations from its transport:
//! open a link to a target, send an envelope over a link, close a link.
//! Inbound traffic flows the other way as [`TransportEvent`]s that the
//! embedder feeds into the router.
//!
//! [`WsTransport`] is the WebSocket implementation. Each link owns an
//! unbounded outbound queue drained by a writer task, so `send` never
//! waits on the socket.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{WebSocketStream, accept_async, connect_async};
use tracing::{debug, error, info, warn};

use crate::error::MeshError;
use crate::message::Envelope;

/// Handle of a one-hop link, allocated by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LinkId(pub u64);

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link-{}", self.0)
    }
}

/// The one-hop link collaborator supplied by the embedder.
pub trait Transport: Send {
    /// Open a direct link to `target` (an address meaningful to the
    /// transport). The link may still be connecting when this returns.
    fn open(&mut self, target: &str) -> Result<LinkId, MeshError>;

    /// Queue an envelope for delivery over `link`.
    fn send(&mut self, link: LinkId, envelope: &Envelope) -> Result<(), MeshError>;

    /// Tear down `link`. Unknown links are ignored.
    fn close(&mut self, link: LinkId);
}

/// An inbound event from the transport layer.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A remote endpoint opened a link to us.
    Accepted { link: LinkId, addr: SocketAddr },
    /// A raw envelope arrived over `link`.
    Message { link: LinkId, text: String },
    /// The link went away.
    Disconnected { link: LinkId },
}

type LinkTable = Arc<Mutex<HashMap<LinkId, mpsc::UnboundedSender<Message>>>>;

/// WebSocket transport (via `tokio-tungstenite`).
///
/// Must be used from within a tokio runtime: opening a link spawns the
/// connection task.
#[derive(Clone)]
pub struct WsTransport {
    links: LinkTable,
    next_link: Arc<AtomicU64>,
    event_tx: mpsc::Sender<TransportEvent>,
}

impl WsTransport {
    /// Create a transport that reports inbound traffic on `event_tx`.
    pub fn new(event_tx: mpsc::Sender<TransportEvent>) -> Self {
        Self {
            links: Arc::new(Mutex::new(HashMap::new())),
            next_link: Arc::new(AtomicU64::new(1)),
            event_tx,
        }
    }

    /// Number of links currently open.
    pub fn link_count(&self) -> usize {
        self.links.lock().len()
    }

    fn allocate(&self) -> (LinkId, mpsc::UnboundedReceiver<Message>) {
        let link = LinkId(self.next_link.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();
        self.links.lock().insert(link, tx);
        (link, rx)
    }

    /// Bind a WebSocket server on `addr` and accept links until `shutdown`
    /// fires. Returns the bound address (useful with port 0).
    pub async fn listen(
        &self,
        addr: SocketAddr,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<SocketAddr, MeshError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!("WebSocket server listening on {local_addr}");

        let transport = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, peer_addr)) => {
                                let transport = transport.clone();
                                tokio::spawn(async move {
                                    match accept_async(stream).await {
                                        Ok(ws) => {
                                            let (link, outbound) = transport.allocate();
                                            let _ = transport
                                                .event_tx
                                                .send(TransportEvent::Accepted { link, addr: peer_addr })
                                                .await;
                                            transport.run_link(link, ws, outbound).await;
                                        }
                                        Err(e) => {
                                            error!("WebSocket accept failed for {peer_addr}: {e}");
                                        }
                                    }
                                });
                            }
                            Err(e) => {
                                warn!("TCP accept error: {e}");
                            }
                        }
                    }
                    _ = shutdown.recv() => {
                        debug!("WebSocket server on {local_addr} shutting down");
                        break;
                    }
                }
            }
        });

        Ok(local_addr)
    }

    /// Pump one established socket until either side ends it.
    async fn run_link<S>(
        &self,
        link: LinkId,
        ws: WebSocketStream<S>,
        mut outbound: mpsc::UnboundedReceiver<Message>,
    ) where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut sink, mut stream) = ws.split();

        let writer = tokio::spawn(async move {
            while let Some(msg) = outbound.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if let Err(e) = sink.send(msg).await {
                    debug!("Write error on {link}: {e}");
                    break;
                }
                if closing {
                    break;
                }
            }
        });

        while let Some(msg) = stream.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    let text: &str = &text;
                    let _ = self
                        .event_tx
                        .send(TransportEvent::Message {
                            link,
                            text: text.to_owned(),
                        })
                        .await;
                }
                Ok(Message::Close(_)) => {
                    debug!("{link} closed by remote");
                    break;
                }
                Ok(_) => {} // Ignore binary/ping/pong
                Err(e) => {
                    debug!("Read error on {link}: {e}");
                    break;
                }
            }
        }

        writer.abort();
        // Links closed locally are already gone from the table.
        let still_open = self.links.lock().remove(&link).is_some();
        if still_open {
            let _ = self
                .event_tx
                .send(TransportEvent::Disconnected { link })
                .await;
        }
    }
}

impl Transport for WsTransport {
    fn open(&mut self, target: &str) -> Result<LinkId, MeshError> {
        let (link, outbound) = self.allocate();
        let transport = self.clone();
        let target = target.to_string();

        tokio::spawn(async move {
            match connect_async(target.as_str()).await {
                Ok((ws, _response)) => {
                    info!("Connected {link} to {target}");
                    transport.run_link(link, ws, outbound).await;
                }
                Err(e) => {
                    warn!("Failed to connect {link} to {target}: {e}");
                    transport.links.lock().remove(&link);
                    let _ = transport
                        .event_tx
                        .send(TransportEvent::Disconnected { link })
                        .await;
                }
            }
        });

        Ok(link)
    }

    fn send(&mut self, link: LinkId, envelope: &Envelope) -> Result<(), MeshError> {
        let json = envelope.to_json()?;
        let links = self.links.lock();
        let tx = links.get(&link).ok_or(MeshError::UnknownLink(link))?;
        tx.send(Message::Text(json.into()))
            .map_err(|_| MeshError::Transport(format!("{link} writer is gone")))
    }

    fn close(&mut self, link: LinkId) {
        if let Some(tx) = self.links.lock().remove(&link) {
            let _ = tx.send(Message::Close(None));
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::RouterIdentity;
    use std::time::Duration;

    #[test]
    fn test_link_id_display() {
        assert_eq!(LinkId(7).to_string(), "link-7");
    }

    #[tokio::test]
    async fn test_send_on_unknown_link() {
        let (event_tx, _event_rx) = mpsc::channel(8);
        let mut transport = WsTransport::new(event_tx);
        let env = Envelope::ready(0, &RouterIdentity::generate("main"), None);

        match transport.send(LinkId(42), &env) {
            Err(MeshError::UnknownLink(LinkId(42))) => {}
            other => panic!("Expected UnknownLink, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_ws_link_delivers_envelope() {
        let (server_tx, mut server_rx) = mpsc::channel(16);
        let server = WsTransport::new(server_tx);
        let (_shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let addr = server
            .listen("127.0.0.1:0".parse().unwrap(), shutdown_rx)
            .await
            .unwrap();

        let (client_tx, _client_rx) = mpsc::channel(16);
        let mut client = WsTransport::new(client_tx);
        let link = client.open(&format!("ws://{addr}")).unwrap();

        let env = Envelope::ready(0, &RouterIdentity::generate("main"), None);
        client.send(link, &env).unwrap();

        let received = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match server_rx.recv().await {
                    Some(TransportEvent::Message { text, .. }) => break text,
                    Some(_) => continue,
                    None => panic!("server event channel closed"),
                }
            }
        })
        .await
        .expect("envelope not delivered in time");

        assert_eq!(Envelope::from_json(&received).unwrap(), env);

        client.close(link);
        assert_eq!(client.link_count(), 0);
    }
}
