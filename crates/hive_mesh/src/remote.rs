//! Remote peer manager: inbound connections accepted by our listener.
//!
//! Inbound peers are never redialed. Once one closes it is gone until the
//! remote side connects again.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use crate::error::MeshError;
use crate::manager::ManagerEvent;
use crate::peer::{Peer, PeerContext, PeerOrigin};
use crate::transport::{self, Connection};

/// Tracks every inbound peer from accept until removal.
pub struct RemotePeerManager {
    ctx: Arc<PeerContext>,
    events: mpsc::UnboundedSender<ManagerEvent>,
    peers: Mutex<HashMap<u64, Arc<Peer>>>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl RemotePeerManager {
    pub(crate) fn new(
        ctx: Arc<PeerContext>,
        events: mpsc::UnboundedSender<ManagerEvent>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            events,
            peers: Mutex::new(HashMap::new()),
            shutdown,
            tasks: TaskTracker::new(),
        })
    }

    /// Take ownership of an already upgraded inbound connection.
    pub fn accept(self: &Arc<Self>, conn: Connection) {
        let Some(peer) = self.register(conn.remote_addr()) else {
            return;
        };
        let this = Arc::clone(self);
        self.tasks.spawn(async move {
            this.serve(&peer, conn).await;
            this.peers.lock().remove(&peer.id());
        });
    }

    /// Take ownership of a raw accepted socket. The WebSocket upgrade counts
    /// against the connection timeout.
    pub fn accept_tcp(self: &Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        let Some(peer) = self.register(addr) else {
            return;
        };
        let this = Arc::clone(self);
        self.tasks.spawn(async move {
            match this.upgrade(&peer, stream, addr).await {
                Ok(conn) => this.serve(&peer, conn).await,
                Err(e) => {
                    debug!("Inbound upgrade from {addr} failed: {e}");
                    peer.mark_removed();
                }
            }
            this.peers.lock().remove(&peer.id());
        });
    }

    /// Kill every inbound peer whose socket address is `addr`.
    pub fn kill_peer(&self, addr: SocketAddr) -> bool {
        self.kill_where(|peer| peer.remote_addr() == addr)
    }

    /// Kill every inbound peer that either connects from `addr` or
    /// advertised `addr` as its listening endpoint.
    pub fn kill_matching(&self, addr: SocketAddr) -> bool {
        self.kill_where(|peer| {
            peer.remote_addr() == addr
                || peer
                    .advertisement()
                    .and_then(|ad| ad.parse::<SocketAddr>().ok())
                    .is_some_and(|ad| ad == addr)
        })
    }

    /// Inbound peers not yet removed, in accept order.
    pub fn peers(&self) -> Vec<Arc<Peer>> {
        let mut peers: Vec<_> = self.peers.lock().values().cloned().collect();
        peers.sort_by_key(|peer| peer.id());
        peers
    }

    /// Kill every inbound peer and wait for their workers to exit.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        self.peers.lock().clear();
    }

    fn register(&self, addr: SocketAddr) -> Option<Arc<Peer>> {
        if self.shutdown.is_cancelled() {
            debug!("Refusing inbound connection from {addr}: shutting down");
            return None;
        }
        let peer = Peer::new(addr, PeerOrigin::Remote, Arc::clone(&self.ctx), &self.shutdown);
        self.peers.lock().insert(peer.id(), Arc::clone(&peer));
        Some(peer)
    }

    async fn upgrade(
        &self,
        peer: &Arc<Peer>,
        stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<Connection, MeshError> {
        let timeout = self.ctx.options.connection_timeout;
        tokio::select! {
            _ = peer.killed() => Err(MeshError::Cancelled),
            upgraded = tokio::time::timeout(timeout, transport::upgrade(stream, addr)) => {
                upgraded.map_err(|_| MeshError::Timeout(timeout))?
            }
        }
    }

    async fn serve(&self, peer: &Arc<Peer>, conn: Connection) {
        let reader = match peer.handshake(conn).await {
            Ok(reader) => reader,
            Err(e) => {
                debug!("Inbound handshake with {} failed: {e}", peer.remote_addr());
                return;
            }
        };
        info!("Accepted {peer}");
        let _ = self.events.send(ManagerEvent::Connected(Arc::clone(peer)));
        peer.run(reader).await;
        if peer.mark_removed() {
            let _ = self.events.send(ManagerEvent::Removed(Arc::clone(peer)));
        }
    }

    fn kill_where(&self, predicate: impl Fn(&Peer) -> bool) -> bool {
        let doomed: Vec<_> = self
            .peers
            .lock()
            .values()
            .filter(|peer| predicate(peer))
            .cloned()
            .collect();
        for peer in &doomed {
            info!("Killing inbound {peer}");
            peer.kill();
        }
        !doomed.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
