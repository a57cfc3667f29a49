//! Hive Mesh: an authenticated peer-to-peer overlay.
//!
//! Nodes dial a list of seed addresses, accept inbound connections, prove
//! to each other that they hold the private key behind their token and
//! then exchange typed application messages by unicast or broadcast.
//!
//! # Architecture
//!
//! - **Transport**: WebSocket binary frames (via `tokio-tungstenite`), one
//!   protocol frame per message.
//! - **Handshake**: Hello / Check / CheckReply / Done, an Ed25519
//!   challenge-response in both directions. Nodes from a different network
//!   id are turned away.
//! - **Peers**: outbound links are redialed with bounded retries, inbound
//!   links live until they close. At most one peer per remote token is kept.
//! - **Messages**: registered in a [`MessageRegistry`] under a stable kind,
//!   received through the mesh's inbox.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use hive_mesh::{Mesh, MeshOptions, MessageRegistry};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), hive_mesh::MeshError> {
//! let mut registry = MessageRegistry::new();
//! registry.register::<String>("text")?;
//!
//! let mesh = Mesh::new(MeshOptions::default(), registry)?;
//! mesh.start(128).await?;
//! mesh.broadcast("hello".to_string(), &CancellationToken::new()).await?;
//! let envelope = mesh.wait(&CancellationToken::new()).await?;
//! println!("{} says {:?}", envelope.source, envelope.payload.downcast_ref::<String>());
//! mesh.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod discovery;
pub mod error;
pub mod handshake;
pub mod identity;
pub mod inbox;
pub mod local;
pub mod logging;
pub mod manager;
pub mod mesh;
pub mod message;
pub mod peer;
pub mod remote;
pub mod transport;
pub mod wire;

// ── Re-exports for convenience ──────────────────────────────────────────

pub use config::MeshOptions;
pub use discovery::{PeerDiscovery, StaticSeeds};
pub use error::MeshError;
pub use identity::MeshToken;
pub use manager::{MeshEvent, PeerManager};
pub use mesh::Mesh;
pub use message::{BroadcastStatus, Delivery, MessageEnvelope, MessageRegistry, Payload};
pub use peer::{Peer, PeerOrigin, PeerState};
pub use transport::{Connection, Dialer, WebSocketDialer};
