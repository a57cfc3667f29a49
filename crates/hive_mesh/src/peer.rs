//! Peer: one mesh connection and its lifecycle.
//!
//! A peer is created `Pending` as soon as a socket exists, moves through
//! `Handshaking` to `Connected`, and ends `Removed`. Removed is terminal: a
//! new [`Peer`] is built for every new connection, even to the same address.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::MeshOptions;
use crate::error::MeshError;
use crate::handshake;
use crate::identity::MeshToken;
use crate::inbox::MessageBox;
use crate::message::{Delivery, MessageRegistry, Payload};
use crate::transport::{Connection, ConnectionReader, ConnectionWriter};
use crate::wire::Frame;

static NEXT_PEER_ID: AtomicU64 = AtomicU64::new(1);

/// Connection state of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerState {
    /// Socket obtained, nothing exchanged yet.
    Pending,
    /// Handshake in progress.
    Handshaking,
    /// Handshake complete; messages flow.
    Connected,
    /// Gone for good.
    Removed,
}

/// Which side opened the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerOrigin {
    /// We dialed out.
    Local,
    /// The remote dialed us.
    Remote,
}

/// Everything a peer needs from its mesh.
pub(crate) struct PeerContext {
    pub token: MeshToken,
    pub options: MeshOptions,
    pub registry: Arc<MessageRegistry>,
    pub inbox: Arc<MessageBox>,
}

/// One connection to a remote node.
pub struct Peer {
    id: u64,
    remote_addr: SocketAddr,
    origin: PeerOrigin,
    ctx: Arc<PeerContext>,
    state: Mutex<PeerState>,
    remote_token: OnceLock<MeshToken>,
    advertisement: OnceLock<Option<String>>,
    connected_at: OnceLock<DateTime<Utc>>,
    writer: tokio::sync::Mutex<Option<ConnectionWriter>>,
    cancel: CancellationToken,
    removed: CancellationToken,
    superseded_by: OnceLock<Arc<Peer>>,
}

impl Peer {
    /// A fresh `Pending` peer for a socket to `remote_addr`. Cancelling
    /// `parent` kills the peer.
    pub(crate) fn new(
        remote_addr: SocketAddr,
        origin: PeerOrigin,
        ctx: Arc<PeerContext>,
        parent: &CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_PEER_ID.fetch_add(1, Ordering::Relaxed),
            remote_addr,
            origin,
            ctx,
            state: Mutex::new(PeerState::Pending),
            remote_token: OnceLock::new(),
            advertisement: OnceLock::new(),
            connected_at: OnceLock::new(),
            writer: tokio::sync::Mutex::new(None),
            cancel: parent.child_token(),
            removed: CancellationToken::new(),
            superseded_by: OnceLock::new(),
        })
    }

    /// Process-unique id of this peer object.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn origin(&self) -> PeerOrigin {
        self.origin
    }

    pub fn state(&self) -> PeerState {
        *self.state.lock()
    }

    /// The authenticated remote identity; `None` until the handshake is done.
    pub fn remote_token(&self) -> Option<&MeshToken> {
        self.remote_token.get()
    }

    /// The address the remote advertised about itself, if any.
    pub fn advertisement(&self) -> Option<&str> {
        self.advertisement.get().and_then(|ad| ad.as_deref())
    }

    pub fn connected_at(&self) -> Option<DateTime<Utc>> {
        self.connected_at.get().copied()
    }

    /// Connected and not being torn down.
    pub fn is_connected(&self) -> bool {
        self.state() == PeerState::Connected && !self.cancel.is_cancelled()
    }

    /// The peer that won a duplicate-identity race against this one.
    pub fn superseded_by(&self) -> Option<&Arc<Peer>> {
        self.superseded_by.get()
    }

    /// Tear the connection down. The peer's own worker performs the
    /// transition to `Removed`.
    pub fn kill(&self) {
        self.cancel.cancel();
    }

    /// Resolves once [`Peer::kill`] has been called or the parent token fired.
    pub(crate) async fn killed(&self) {
        self.cancel.cancelled().await;
    }

    /// Resolves once the peer has reached `Removed`.
    pub async fn removed(&self) {
        self.removed.cancelled().await;
    }

    /// Record the duplicate that survives and tear this connection down.
    pub(crate) fn supersede(&self, survivor: Arc<Peer>) {
        let _ = self.superseded_by.set(survivor);
        self.kill();
    }

    /// Move into `Removed`. Returns `true` only for the call that made the
    /// transition, so the removal is reported once.
    pub(crate) fn mark_removed(&self) -> bool {
        let mut state = self.state.lock();
        if *state == PeerState::Removed {
            return false;
        }
        *state = PeerState::Removed;
        drop(state);
        self.cancel.cancel();
        self.removed.cancel();
        true
    }

    fn transition(&self, next: PeerState) -> bool {
        let mut state = self.state.lock();
        if *state == PeerState::Removed {
            return false;
        }
        *state = next;
        true
    }

    /// Run the handshake over `conn`. On success the peer is `Connected`
    /// and the returned reader feeds [`Peer::run`]. On failure the peer is
    /// `Removed` and the connection closed.
    pub(crate) async fn handshake(
        self: &Arc<Self>,
        mut conn: Connection,
    ) -> Result<ConnectionReader, MeshError> {
        self.transition(PeerState::Handshaking);
        let result = tokio::select! {
            _ = self.cancel.cancelled() => Err(MeshError::Cancelled),
            r = handshake::perform(&mut conn, &self.ctx.token, &self.ctx.options) => r,
        };

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => {
                conn.close().await;
                self.mark_removed();
                return Err(e);
            }
        };

        let (writer, reader) = conn.split();
        *self.writer.lock().await = Some(writer);
        let _ = self.remote_token.set(outcome.remote_token);
        let _ = self.advertisement.set(outcome.advertisement);
        let _ = self.connected_at.set(Utc::now());
        if !self.transition(PeerState::Connected) || self.cancel.is_cancelled() {
            self.close_writer().await;
            self.mark_removed();
            return Err(MeshError::Cancelled);
        }
        debug!("{self} connected");
        Ok(reader)
    }

    /// The receive loop: forward application messages to the message box
    /// until the connection ends, a frame fails to decode, or the peer is
    /// killed. Closes the writer on exit; the caller marks the peer removed.
    pub(crate) async fn run(self: &Arc<Self>, mut reader: ConnectionReader) {
        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => break,
                next = reader.recv() => next,
            };
            match next {
                Ok(Some(Frame::Message { kind, body })) => {
                    match self.ctx.registry.decode(&kind, &body) {
                        Ok(payload) => self.ctx.inbox.on_message(Arc::clone(self), payload),
                        Err(e) => {
                            warn!("{self}: dropping connection, cannot decode {kind}: {e}");
                            break;
                        }
                    }
                }
                Ok(Some(other)) => {
                    warn!("{self}: unexpected {} frame after handshake", other.name());
                    break;
                }
                Ok(None) => {
                    debug!("{self} closed by remote");
                    break;
                }
                Err(e) => {
                    debug!("{self} read failed: {e}");
                    break;
                }
            }
        }
        self.close_writer().await;
    }

    /// Encode and send one message. Returns `None`, never an error, when the
    /// peer cannot take it right now.
    pub async fn emit(self: &Arc<Self>, payload: &Payload) -> Option<Delivery> {
        let bytes = match self.ctx.registry.encode_frame(payload) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("{self}: cannot encode {}: {e}", payload.kind());
                return None;
            }
        };
        self.emit_encoded(bytes).await.then(|| Delivery {
            destination: Arc::clone(self),
            payload: payload.clone(),
        })
    }

    /// Send an already encoded frame under the per-peer write lock.
    pub(crate) async fn emit_encoded(&self, bytes: Bytes) -> bool {
        if !self.is_connected() {
            return false;
        }
        let mut writer = self.writer.lock().await;
        let Some(writer) = writer.as_mut() else {
            return false;
        };
        match writer.send_encoded(bytes).await {
            Ok(()) => true,
            Err(e) => {
                debug!("{self}: write failed: {e}");
                false
            }
        }
    }

    async fn close_writer(&self) {
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            writer.close().await;
        }
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let origin = match self.origin {
            PeerOrigin::Local => "out",
            PeerOrigin::Remote => "in",
        };
        match self.remote_token() {
            Some(token) => write!(f, "peer#{} {origin} {} ({token})", self.id, self.remote_addr),
            None => write!(f, "peer#{} {origin} {}", self.id, self.remote_addr),
        }
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("origin", &self.origin)
            .field("state", &self.state())
            .field("remote_token", &self.remote_token().map(MeshToken::fingerprint))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
