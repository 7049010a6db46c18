//! The only place in this crate that owns a peer socket. Each connection
//! gets its own task that does the 68-byte handshake, then forwards
//! decoded messages to the torrent's single dispatcher over a shared
//! channel and drains an outbound queue back onto the wire. Relocated out
//! of the teacher's `p2p::session::PeerSession` (which used to own both
//! the socket and the peer's logical state) so that state lives in exactly
//! one place: the dispatcher's `PeerSession` table.

use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::{net::TcpStream, sync::{mpsc, RwLock}, time};
use tokio_util::codec::Framed;
use tracing::Instrument;

use crate::{
    collab::ConnectionManager,
    p2p::{
        handshake::{Handshake, HandshakeCodec, PROTOCOL},
        message::{Message, MessageCodec},
        PeerError,
    },
    ID,
};

/// Everything the torrent's single dispatcher learns about a link from the
/// outside: a completed handshake, a decoded message, or the link closing.
/// Replaces the teacher's separate `PeerCommand::{Connected,Disconnected}`
/// variants sent over the torrent command channel with one event type fed
/// through the same inbound channel messages arrive on, so the dispatcher
/// never has to interleave two queues to learn a peer's lifecycle.
pub enum InboundEvent {
    Connected { peer: SocketAddr, peer_id: ID, supports_fast_peer: bool, supports_extended: bool, inbound: bool },
    Message { peer: SocketAddr, message: Message },
    Disconnected { peer: SocketAddr },
}

/// State shared between the manager's public API and the per-link tasks it
/// spawns. Kept behind its own `Arc` so spawning a link never requires the
/// caller to hand us an `Arc<TcpConnectionManager>`.
struct Shared {
    info_hash: ID,
    client_id: ID,
    inbound_tx: mpsc::UnboundedSender<InboundEvent>,
    links: RwLock<HashMap<SocketAddr, mpsc::UnboundedSender<Message>>>,
}

/// `ConnectionManager` backed by real TCP sockets. Holds one outbound
/// per-link channel per connected peer; the link task owns the socket and
/// is the only task that ever touches it.
pub struct TcpConnectionManager {
    shared: Arc<Shared>,
}

impl TcpConnectionManager {
    pub fn new(info_hash: ID, client_id: ID) -> (Self, mpsc::UnboundedReceiver<InboundEvent>) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            info_hash,
            client_id,
            inbound_tx,
            links: RwLock::new(HashMap::new()),
        });
        (Self { shared }, inbound_rx)
    }
}

async fn spawn_link(shared: Arc<Shared>, addr: SocketAddr, socket: Option<TcpStream>) {
    let (tx, rx) = mpsc::unbounded_channel();
    shared.links.write().await.insert(addr, tx);

    tokio::spawn(
        async move {
            if let Err(e) = run_link(&shared, addr, socket, rx).await {
                tracing::warn!("link to {} closed: {}", addr, e);
            }
            shared.links.write().await.remove(&addr);
        }
        .instrument(tracing::info_span!("peer-link", addr = %addr)),
    );
}

async fn run_link(
    shared: &Shared,
    addr: SocketAddr,
    socket: Option<TcpStream>,
    mut outbound_rx: mpsc::UnboundedReceiver<Message>,
) -> Result<(), PeerError> {
    let inbound = socket.is_some();
    let mut handshake_framed = if let Some(stream) = socket {
        Framed::new(stream, HandshakeCodec)
    } else {
        let stream = time::timeout(Duration::from_secs(10), TcpStream::connect(addr))
            .await
            .map_err(|_| PeerError::Timeout)??;
        Framed::new(stream, HandshakeCodec)
    };

    let handshake = Handshake::new(shared.info_hash, shared.client_id);
    if !inbound {
        handshake_framed.send(handshake).await?;
    }

    let peer_handshake = match handshake_framed.next().await {
        Some(Ok(hs)) => hs,
        _ => return Err(PeerError::NoHandshake),
    };
    if peer_handshake.protocol != PROTOCOL {
        return Err(PeerError::IncorrectProtocol);
    }
    if peer_handshake.info_hash != shared.info_hash {
        return Err(PeerError::IncorrectInfoHash);
    }
    if inbound {
        handshake_framed
            .send(Handshake::new(shared.info_hash, shared.client_id))
            .await?;
    }

    let connected = InboundEvent::Connected {
        peer: addr,
        peer_id: peer_handshake.peer_id,
        supports_fast_peer: peer_handshake.supports_fast_peer(),
        supports_extended: peer_handshake.supports_extended(),
        inbound,
    };
    if shared.inbound_tx.send(connected).is_err() {
        return Ok(());
    }

    let mut framed = Framed::new(handshake_framed.into_inner(), MessageCodec);
    let result = loop {
        tokio::select! {
            msg = framed.next() => {
                match msg {
                    Some(Ok(message)) => {
                        if shared.inbound_tx.send(InboundEvent::Message { peer: addr, message }).is_err() {
                            break Ok(());
                        }
                    }
                    Some(Err(e)) => break Err(e),
                    None => break Ok(()),
                }
            }
            outbound = outbound_rx.recv() => {
                match outbound {
                    Some(message) => {
                        if let Err(e) = framed.send(message).await {
                            break Err(e);
                        }
                    }
                    None => break Ok(()),
                }
            }
        }
    };

    let _ = shared.inbound_tx.send(InboundEvent::Disconnected { peer: addr });
    result
}

#[async_trait]
impl ConnectionManager for TcpConnectionManager {
    async fn connect(&self, addr: SocketAddr) -> std::io::Result<()> {
        spawn_link(self.shared.clone(), addr, None).await;
        Ok(())
    }

    async fn accept(&self, addr: SocketAddr, socket: TcpStream) {
        spawn_link(self.shared.clone(), addr, Some(socket)).await;
    }

    async fn send(&self, peer: SocketAddr, message: Message) -> std::io::Result<()> {
        let links = self.shared.links.read().await;
        match links.get(&peer) {
            Some(tx) => tx
                .send(message)
                .map_err(|_| std::io::Error::new(std::io::ErrorKind::NotConnected, "peer link closed")),
            None => Err(std::io::Error::new(std::io::ErrorKind::NotConnected, "unknown peer")),
        }
    }

    async fn disconnect(&self, peer: SocketAddr) {
        self.shared.links.write().await.remove(&peer);
    }
}
