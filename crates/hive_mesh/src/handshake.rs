//! Mutual proof-of-possession handshake.
//!
//! Both sides run the same four steps regardless of who dialed:
//!
//! 1. `Hello`: network id, advertised address and public key. A differing
//!    network id or our own key aborts.
//! 2. `Check`: a fresh random nonce.
//! 3. `CheckReply`: our signature over the peer's nonce.
//! 4. `Done`: sent once the peer's signature over our nonce verifies.
//!
//! Nothing here encrypts the channel. Failures are never explained to the
//! remote side; the connection is simply dropped.

use tracing::debug;

use crate::config::MeshOptions;
use crate::error::MeshError;
use crate::identity::MeshToken;
use crate::transport::Connection;
use crate::wire::{Frame, Hello, NONCE_LEN};

/// What a successful handshake learned about the remote node.
#[derive(Debug, Clone)]
pub struct HandshakeOutcome {
    pub remote_token: MeshToken,
    pub advertisement: Option<String>,
}

/// Run the handshake, bounded by `options.connection_timeout`.
pub async fn perform(
    conn: &mut Connection,
    local: &MeshToken,
    options: &MeshOptions,
) -> Result<HandshakeOutcome, MeshError> {
    let timeout = options.connection_timeout;
    match tokio::time::timeout(timeout, exchange(conn, local, options)).await {
        Ok(result) => result,
        Err(_) => Err(MeshError::Timeout(timeout)),
    }
}

async fn exchange(
    conn: &mut Connection,
    local: &MeshToken,
    options: &MeshOptions,
) -> Result<HandshakeOutcome, MeshError> {
    let addr = conn.remote_addr();

    conn.send(&Frame::Hello(Hello {
        network_id: options.network_id.clone(),
        advertisement: options.advertisement.clone(),
        public_key: local.public_key_bytes().to_vec(),
    }))
    .await?;
    let hello = match expect(conn).await? {
        Frame::Hello(hello) => hello,
        other => return Err(unexpected("hello", &other)),
    };
    if hello.network_id != options.network_id {
        debug!("Handshake with {addr}: network id mismatch");
        return Err(MeshError::NetworkMismatch);
    }
    let remote_token = MeshToken::from_public_key(&hello.public_key)?;
    if remote_token == *local {
        return Err(MeshError::SelfConnection);
    }

    let nonce: [u8; NONCE_LEN] = rand::random();
    conn.send(&Frame::Check { nonce }).await?;
    let their_nonce = match expect(conn).await? {
        Frame::Check { nonce } => nonce,
        other => return Err(unexpected("check", &other)),
    };

    let signature = local.sign(&their_nonce)?;
    conn.send(&Frame::CheckReply { signature }).await?;
    let their_signature = match expect(conn).await? {
        Frame::CheckReply { signature } => signature,
        other => return Err(unexpected("check_reply", &other)),
    };
    if !remote_token.verify(&their_signature, &nonce) {
        debug!("Handshake with {addr}: signature from {remote_token} rejected");
        return Err(MeshError::Authentication);
    }

    conn.send(&Frame::Done).await?;
    match expect(conn).await? {
        Frame::Done => {}
        other => return Err(unexpected("done", &other)),
    }

    debug!("Handshake with {addr} complete, remote token {remote_token}");
    Ok(HandshakeOutcome {
        remote_token,
        advertisement: hello.advertisement,
    })
}

async fn expect(conn: &mut Connection) -> Result<Frame, MeshError> {
    conn.recv().await?.ok_or(MeshError::ConnectionClosed)
}

fn unexpected(wanted: &str, got: &Frame) -> MeshError {
    MeshError::Protocol(format!("expected {wanted}, got {}", got.name()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
