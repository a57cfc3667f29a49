//! Mesh error types.

use std::time::Duration;

/// Errors that can occur in the hive_mesh crate.
#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    /// A transport-level error (WebSocket connect/send/receive).
    #[error("Transport error: {0}")]
    Transport(String),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization / deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A frame was malformed or arrived out of protocol order.
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// The remote node belongs to a different logical mesh.
    #[error("Network id mismatch")]
    NetworkMismatch,

    /// The remote node presented our own token.
    #[error("Connected to self")]
    SelfConnection,

    /// The remote node failed to prove possession of its private key.
    #[error("Authentication failed")]
    Authentication,

    /// A public key or signature could not be parsed.
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Signing was attempted with a token that only carries a public key.
    #[error("Token has no private key")]
    MissingPrivateKey,

    /// An operation timed out.
    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    /// The connection was closed before the operation completed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The operation was cancelled.
    #[error("Cancelled")]
    Cancelled,

    /// The mesh (or its message box) is not running.
    #[error("Mesh not running")]
    NotRunning,

    /// No codec is registered for the message kind or type.
    #[error("Unregistered message: {0}")]
    UnregisteredMessage(String),

    /// A codec for this message kind or type is already registered.
    #[error("Duplicate message kind: {0}")]
    DuplicateMessageKind(String),

    /// The mesh options are unusable.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}
