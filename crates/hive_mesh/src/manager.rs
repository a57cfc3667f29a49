//! Peer manager: the authoritative set of connected peers.
//!
//! Local and remote managers report peer transitions on an internal channel.
//! One coordinator task consumes them in order, keeps exactly one live peer
//! per remote token and only then publishes [`MeshEvent`]s to subscribers.
//! Broadcast and unicast read snapshots of that set.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::MeshError;
use crate::identity::MeshToken;
use crate::local::LocalPeerManager;
use crate::message::{BroadcastStatus, Delivery, Payload};
use crate::peer::{Peer, PeerContext, PeerOrigin};
use crate::remote::RemotePeerManager;
use crate::transport::Dialer;

/// A change in the mesh, published after duplicate resolution.
#[derive(Debug, Clone)]
pub enum MeshEvent {
    /// A peer finished its handshake and joined the peer set.
    PeerConnected(Arc<Peer>),
    /// A peer from the peer set went away.
    PeerRemoved(Arc<Peer>),
    /// An outbound dial or handshake failed.
    DialFailed {
        addr: SocketAddr,
        attempt: u32,
        reason: String,
    },
    /// An address ran out of retries and is no longer dialed.
    AddressAbandoned { addr: SocketAddr },
}

/// Raw transitions reported by the local and remote managers.
#[derive(Debug)]
pub(crate) enum ManagerEvent {
    Connected(Arc<Peer>),
    Removed(Arc<Peer>),
    DialFailed {
        addr: SocketAddr,
        attempt: u32,
        reason: String,
    },
    Abandoned {
        addr: SocketAddr,
    },
}

type PeerSet = Arc<Mutex<HashMap<MeshToken, Arc<Peer>>>>;

/// Facade over the local and remote managers.
pub struct PeerManager {
    ctx: Arc<PeerContext>,
    local: Arc<LocalPeerManager>,
    remote: Arc<RemotePeerManager>,
    peers: PeerSet,
    events: broadcast::Sender<MeshEvent>,
    coordinator: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    coordinator_stop: CancellationToken,
}

impl PeerManager {
    /// Create both managers and spawn the coordinator. Cancelling
    /// `shutdown` kills every peer and dial loop.
    pub(crate) fn start(
        ctx: Arc<PeerContext>,
        dialer: Arc<dyn Dialer>,
        events: broadcast::Sender<MeshEvent>,
        shutdown: &CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let local = LocalPeerManager::new(Arc::clone(&ctx), dialer, tx.clone(), shutdown.child_token());
        let remote = RemotePeerManager::new(Arc::clone(&ctx), tx, shutdown.child_token());
        let peers = PeerSet::default();

        // Not a child of `shutdown`: the coordinator has to outlive the
        // managers to drain their final removals.
        let coordinator_stop = CancellationToken::new();
        let coordinator = Coordinator {
            peers: Arc::clone(&peers),
            events: events.clone(),
            local_token: ctx.token.clone(),
            race_window: ctx.options.connection_timeout,
        };
        let coordinator = tokio::spawn(coordinator.run(rx, coordinator_stop.clone()));

        Self {
            ctx,
            local,
            remote,
            peers,
            events,
            coordinator: tokio::sync::Mutex::new(Some(coordinator)),
            coordinator_stop,
        }
    }

    pub fn local(&self) -> &Arc<LocalPeerManager> {
        &self.local
    }

    pub fn remote(&self) -> &Arc<RemotePeerManager> {
        &self.remote
    }

    /// Start dialing `addr`. Returns `false` if it is already dialed.
    pub fn add(&self, addr: SocketAddr) -> bool {
        self.local.add(addr)
    }

    /// Stop dialing `addr`, or failing that, drop inbound connections from
    /// or advertising `addr`.
    pub fn remove(&self, addr: SocketAddr) -> bool {
        self.local.remove(addr) || self.remote.kill_matching(addr)
    }

    /// Snapshot of the peer set, oldest first.
    pub fn get_peers(&self) -> Vec<Arc<Peer>> {
        let mut peers: Vec<_> = self.peers.lock().values().cloned().collect();
        peers.sort_by_key(|peer| peer.id());
        peers
    }

    pub fn get_peers_where(&self, predicate: impl Fn(&Peer) -> bool) -> Vec<Arc<Peer>> {
        let mut peers = self.get_peers();
        peers.retain(|peer| predicate(peer));
        peers
    }

    pub fn find(&self, token: &MeshToken) -> Option<Arc<Peer>> {
        self.peers.lock().get(token).cloned()
    }

    pub fn count(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MeshEvent> {
        self.events.subscribe()
    }

    /// Send `payload` to every connected peer concurrently.
    pub async fn broadcast(
        &self,
        payload: Payload,
        cancel: &CancellationToken,
    ) -> Result<BroadcastStatus, MeshError> {
        let bytes = self.ctx.registry.encode_frame(&payload)?;
        let targets = self.get_peers_where(Peer::is_connected);
        let reached = fan_out(targets, bytes, cancel).await?;
        debug!("Broadcast of {} reached {} peer(s)", payload.kind(), reached.len());
        Ok(BroadcastStatus {
            reached,
            timestamp: Utc::now(),
            payload,
        })
    }

    /// Send `payload` to the peer authenticated as `token`. `Ok(None)` if
    /// there is no such peer or the write failed.
    pub async fn send(&self, token: &MeshToken, payload: &Payload) -> Result<Option<Delivery>, MeshError> {
        let bytes = self.ctx.registry.encode_frame(payload)?;
        let Some(peer) = self.find(token) else {
            return Ok(None);
        };
        let written = peer.emit_encoded(bytes).await;
        Ok(written.then(|| Delivery {
            destination: peer,
            payload: payload.clone(),
        }))
    }

    /// Stop both managers, then let the coordinator drain their final
    /// events before it exits.
    pub async fn stop(&self) {
        self.local.stop().await;
        self.remote.stop().await;
        self.coordinator_stop.cancel();
        if let Some(handle) = self.coordinator.lock().await.take() {
            let _ = handle.await;
        }
        self.peers.lock().clear();
    }
}

/// Write `bytes` to each distinct token once. Returns the peers written to
/// without error, in input order.
async fn fan_out(
    targets: Vec<Arc<Peer>>,
    bytes: Bytes,
    cancel: &CancellationToken,
) -> Result<Vec<Arc<Peer>>, MeshError> {
    let mut seen = HashSet::new();
    let targets: Vec<_> = targets
        .into_iter()
        .filter(|peer| peer.remote_token().is_some_and(|token| seen.insert(token.clone())))
        .collect();

    let sends = targets.iter().map(|peer| peer.emit_encoded(bytes.clone()));
    let results = tokio::select! {
        _ = cancel.cancelled() => return Err(MeshError::Cancelled),
        results = join_all(sends) => results,
    };

    Ok(targets
        .into_iter()
        .zip(results)
        .filter_map(|(peer, written)| written.then_some(peer))
        .collect())
}

/// Applies manager events to the peer set.
struct Coordinator {
    peers: PeerSet,
    events: broadcast::Sender<MeshEvent>,
    local_token: MeshToken,
    race_window: Duration,
}

impl Coordinator {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<ManagerEvent>, stop: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                event = rx.recv() => match event {
                    Some(event) => self.handle(event),
                    None => break,
                },
                _ = stop.cancelled() => {
                    while let Ok(event) = rx.try_recv() {
                        self.handle(event);
                    }
                    break;
                }
            }
        }
        debug!("Peer coordinator stopped");
    }

    fn handle(&self, event: ManagerEvent) {
        match event {
            ManagerEvent::Connected(peer) => self.on_connected(peer),
            ManagerEvent::Removed(peer) => self.on_removed(peer),
            ManagerEvent::DialFailed {
                addr,
                attempt,
                reason,
            } => self.publish(MeshEvent::DialFailed {
                addr,
                attempt,
                reason,
            }),
            ManagerEvent::Abandoned { addr } => self.publish(MeshEvent::AddressAbandoned { addr }),
        }
    }

    fn on_connected(&self, peer: Arc<Peer>) {
        let Some(token) = peer.remote_token().cloned() else {
            return;
        };
        if !peer.is_connected() {
            debug!("{peer} gone before it was registered");
            return;
        }

        let mut set = self.peers.lock();
        let existing = set.get(&token).cloned();
        match existing {
            Some(existing) if existing.is_connected() && !self.replaces(&peer, &existing) => {
                drop(set);
                info!("{peer} duplicates {existing}; keeping {existing}");
                peer.supersede(existing);
            }
            existing => {
                set.insert(token, Arc::clone(&peer));
                drop(set);
                if let Some(existing) = existing {
                    if existing.is_connected() {
                        info!("{existing} duplicates {peer}; keeping {peer}");
                        existing.supersede(Arc::clone(&peer));
                    }
                    self.publish(MeshEvent::PeerRemoved(existing));
                }
                info!("{peer} joined the mesh");
                self.publish(MeshEvent::PeerConnected(peer));
            }
        }
    }

    fn on_removed(&self, peer: Arc<Peer>) {
        let Some(token) = peer.remote_token() else {
            return;
        };
        let removed = {
            let mut set = self.peers.lock();
            match set.get(token) {
                Some(current) if Arc::ptr_eq(current, &peer) => set.remove(token),
                _ => None,
            }
        };
        if removed.is_some() {
            info!("{peer} left the mesh");
            self.publish(MeshEvent::PeerRemoved(peer));
        }
    }

    /// Whether `candidate` should displace the connected `existing` peer of
    /// the same token. The earlier handshake wins, except when both finished
    /// within the race window of each other: then the connection dialed by
    /// the smaller token wins, so both ends keep the same one.
    fn replaces(&self, candidate: &Peer, existing: &Peer) -> bool {
        let (Some(candidate_at), Some(existing_at)) = (candidate.connected_at(), existing.connected_at())
        else {
            return false;
        };
        let gap = (candidate_at - existing_at).num_milliseconds().unsigned_abs();
        if gap > self.race_window.as_millis() as u64 {
            return false;
        }
        match (self.dialer_key(candidate), self.dialer_key(existing)) {
            (Some(candidate), Some(existing)) => candidate < existing,
            _ => false,
        }
    }

    /// Public key of the node that dialed `peer`'s connection.
    fn dialer_key(&self, peer: &Peer) -> Option<[u8; 32]> {
        match peer.origin() {
            PeerOrigin::Local => Some(self.local_token.public_key_bytes()),
            PeerOrigin::Remote => peer.remote_token().map(MeshToken::public_key_bytes),
        }
    }

    fn publish(&self, event: MeshEvent) {
        let _ = self.events.send(event);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
