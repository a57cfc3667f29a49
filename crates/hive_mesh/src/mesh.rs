//! Mesh: top-level entry point of the overlay.
//!
//! [`Mesh`] owns the identity, options, message registry and inbox for the
//! lifetime of the node. Each [`start()`](Mesh::start) binds a listener,
//! spins up a fresh [`PeerManager`] and dials the discovered seeds; each
//! [`stop()`](Mesh::stop) tears all of that down again.

use std::any::Any;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::MeshOptions;
use crate::discovery::{PeerDiscovery, StaticSeeds};
use crate::error::MeshError;
use crate::identity::MeshToken;
use crate::inbox::MessageBox;
use crate::manager::{MeshEvent, PeerManager};
use crate::message::{BroadcastStatus, Delivery, MessageEnvelope, MessageRegistry};
use crate::peer::{Peer, PeerContext};
use crate::transport::{self, Dialer, WebSocketDialer};

const EVENT_CAPACITY: usize = 256;

/// Everything that only exists between `start` and `stop`.
struct Running {
    manager: PeerManager,
    shutdown: CancellationToken,
    listener: Mutex<Option<JoinHandle<()>>>,
    local_endpoint: SocketAddr,
}

/// A node of the mesh.
pub struct Mesh {
    ctx: Arc<PeerContext>,
    dialer: Arc<dyn Dialer>,
    discovery: Arc<dyn PeerDiscovery>,
    events: broadcast::Sender<MeshEvent>,
    lifecycle: tokio::sync::Mutex<()>,
    running: RwLock<Option<Arc<Running>>>,
}

impl Mesh {
    /// Create a mesh node with a freshly generated token.
    pub fn new(options: MeshOptions, registry: MessageRegistry) -> Result<Self, MeshError> {
        Self::with_token(options, registry, MeshToken::generate())
    }

    /// Create a mesh node with a caller-supplied token. The token must carry
    /// its private key.
    pub fn with_token(
        options: MeshOptions,
        registry: MessageRegistry,
        token: MeshToken,
    ) -> Result<Self, MeshError> {
        options.validate()?;
        if !token.can_sign() {
            return Err(MeshError::MissingPrivateKey);
        }
        let discovery = Arc::new(StaticSeeds::new(options.initial_peers.iter().copied()));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            ctx: Arc::new(PeerContext {
                token,
                options,
                registry: Arc::new(registry),
                inbox: Arc::new(MessageBox::new()),
            }),
            dialer: Arc::new(WebSocketDialer),
            discovery,
            events,
            lifecycle: tokio::sync::Mutex::new(()),
            running: RwLock::new(None),
        })
    }

    /// Replace the dialer used for outbound connections.
    pub fn with_dialer(mut self, dialer: impl Dialer + 'static) -> Self {
        self.dialer = Arc::new(dialer);
        self
    }

    /// Replace the seed provider consulted at start.
    pub fn with_discovery(mut self, discovery: impl PeerDiscovery + 'static) -> Self {
        self.discovery = Arc::new(discovery);
        self
    }

    pub fn local_token(&self) -> &MeshToken {
        &self.ctx.token
    }

    pub fn options(&self) -> &MeshOptions {
        &self.ctx.options
    }

    pub fn is_running(&self) -> bool {
        self.running.read().is_some()
    }

    /// The bound listener address while running.
    pub fn local_endpoint(&self) -> Option<SocketAddr> {
        self.running.read().as_ref().map(|running| running.local_endpoint)
    }

    /// Bind the listener and start connecting. Returns `Ok(false)` if the
    /// mesh is already running.
    pub async fn start(&self, backlog: u32) -> Result<bool, MeshError> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.is_running() {
            return Ok(false);
        }

        let listener = transport::bind(self.ctx.options.listen_addr, backlog)?;
        let local_endpoint = listener.local_addr()?;
        let shutdown = CancellationToken::new();

        self.ctx.inbox.start();
        let manager = PeerManager::start(
            Arc::clone(&self.ctx),
            Arc::clone(&self.dialer),
            self.events.clone(),
            &shutdown,
        );

        let remote = Arc::clone(manager.remote());
        let listener = tokio::spawn(transport::serve(
            listener,
            move |stream, addr| remote.accept_tcp(stream, addr),
            shutdown.child_token(),
        ));

        let seeds = match self.discovery.discover().await {
            Ok(seeds) => seeds,
            Err(e) => {
                warn!("Peer discovery failed (non-fatal): {e}");
                Vec::new()
            }
        };
        for seed in seeds {
            if seed == local_endpoint {
                continue;
            }
            manager.add(seed);
        }

        *self.running.write() = Some(Arc::new(Running {
            manager,
            shutdown,
            listener: Mutex::new(Some(listener)),
            local_endpoint,
        }));
        info!("Mesh {} listening on {local_endpoint}", self.ctx.token);
        Ok(true)
    }

    /// Disconnect every peer and release the listener. Messages still queued
    /// in the inbox are discarded. A no-op when not running.
    pub async fn stop(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        let running = self.running.write().take();
        let Some(running) = running else {
            return;
        };

        running.shutdown.cancel();
        let listener = running.listener.lock().take();
        if let Some(listener) = listener {
            let _ = listener.await;
        }
        running.manager.stop().await;
        self.ctx.inbox.stop();
        info!("Mesh {} stopped", self.ctx.token);
    }

    /// Wait for the next inbound application message.
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<MessageEnvelope, MeshError> {
        self.ctx.inbox.wait(cancel).await
    }

    /// Send `message` to every connected peer.
    pub async fn broadcast<T: Any + Send + Sync>(
        &self,
        message: T,
        cancel: &CancellationToken,
    ) -> Result<BroadcastStatus, MeshError> {
        let running = self.running()?;
        let payload = self.ctx.registry.payload(message)?;
        running.manager.broadcast(payload, cancel).await
    }

    /// Send `message` to the peer authenticated as `token`. `Ok(None)` when
    /// no such peer is connected or the write failed.
    pub async fn send<T: Any + Send + Sync>(
        &self,
        token: &MeshToken,
        message: T,
    ) -> Result<Option<Delivery>, MeshError> {
        let running = self.running()?;
        let payload = self.ctx.registry.payload(message)?;
        running.manager.send(token, &payload).await
    }

    /// Start dialing `addr`. `Ok(false)` if it is already dialed.
    pub fn add_peer(&self, addr: SocketAddr) -> Result<bool, MeshError> {
        Ok(self.running()?.manager.add(addr))
    }

    /// Stop dialing `addr`, or drop inbound connections matching it.
    pub fn remove_peer(&self, addr: SocketAddr) -> Result<bool, MeshError> {
        Ok(self.running()?.manager.remove(addr))
    }

    /// Snapshot of connected peers. Empty when not running.
    pub fn peers(&self) -> Vec<Arc<Peer>> {
        self.running()
            .map(|running| running.manager.get_peers())
            .unwrap_or_default()
    }

    pub fn peer_count(&self) -> usize {
        self.running()
            .map(|running| running.manager.count())
            .unwrap_or(0)
    }

    /// Addresses currently being dialed.
    pub fn dialed_addresses(&self) -> Vec<SocketAddr> {
        self.running()
            .map(|running| running.manager.local().addresses())
            .unwrap_or_default()
    }

    /// Subscribe to peer events. Subscriptions survive restarts.
    pub fn subscribe(&self) -> broadcast::Receiver<MeshEvent> {
        self.events.subscribe()
    }

    fn running(&self) -> Result<Arc<Running>, MeshError> {
        self.running.read().clone().ok_or(MeshError::NotRunning)
    }
}

impl Drop for Mesh {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.shutdown.cancel();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
