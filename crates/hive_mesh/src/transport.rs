//! WebSocket transport: framed duplex connections between peers.
//!
//! Each [`Frame`] travels as one binary WebSocket message, so the transport
//! provides message boundaries and the frame codec only deals with bodies.
//! Server-accepted, client-dialed and in-memory sockets are all erased into
//! the same [`Connection`] type.

use std::net::SocketAddr;
use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{WebSocketStream, accept_async, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::MeshError;
use crate::wire::Frame;

type FrameSink = Pin<Box<dyn Sink<Message, Error = WsError> + Send>>;
type FrameStream = Pin<Box<dyn Stream<Item = Result<Message, WsError>> + Send>>;

/// An established duplex connection to a remote endpoint.
pub struct Connection {
    writer: ConnectionWriter,
    reader: ConnectionReader,
}

/// The write half of a [`Connection`].
pub struct ConnectionWriter {
    remote_addr: SocketAddr,
    sink: FrameSink,
}

/// The read half of a [`Connection`].
pub struct ConnectionReader {
    remote_addr: SocketAddr,
    stream: FrameStream,
}

impl Connection {
    /// Wrap an open WebSocket stream.
    pub fn new<S>(ws: WebSocketStream<S>, remote_addr: SocketAddr) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, stream) = ws.split();
        Self {
            writer: ConnectionWriter {
                remote_addr,
                sink: Box::pin(sink),
            },
            reader: ConnectionReader {
                remote_addr,
                stream: Box::pin(stream),
            },
        }
    }

    /// The remote socket address.
    pub fn remote_addr(&self) -> SocketAddr {
        self.writer.remote_addr
    }

    /// Send one frame.
    pub async fn send(&mut self, frame: &Frame) -> Result<(), MeshError> {
        self.writer.send(frame).await
    }

    /// Receive the next frame. `Ok(None)` means the remote closed.
    pub async fn recv(&mut self) -> Result<Option<Frame>, MeshError> {
        self.reader.recv().await
    }

    /// Close the connection gracefully.
    pub async fn close(&mut self) {
        self.writer.close().await;
    }

    /// Split into independently owned write and read halves.
    pub fn split(self) -> (ConnectionWriter, ConnectionReader) {
        (self.writer, self.reader)
    }
}

impl ConnectionWriter {
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Encode and send one frame.
    pub async fn send(&mut self, frame: &Frame) -> Result<(), MeshError> {
        self.send_encoded(frame.encode()?).await
    }

    /// Send an already encoded frame.
    pub async fn send_encoded(&mut self, bytes: Bytes) -> Result<(), MeshError> {
        self.sink
            .send(Message::Binary(bytes))
            .await
            .map_err(|e| MeshError::Transport(format!("Send to {} failed: {e}", self.remote_addr)))
    }

    /// Start the closing handshake. Errors are ignored; the socket is going
    /// away either way.
    pub async fn close(&mut self) {
        if let Err(e) = self.sink.close().await {
            debug!("Close of {} not clean: {e}", self.remote_addr);
        }
    }
}

impl ConnectionReader {
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Receive the next frame. `Ok(None)` means the remote closed.
    pub async fn recv(&mut self) -> Result<Option<Frame>, MeshError> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Binary(bytes))) => return Frame::decode(bytes).map(Some),
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Ok(Message::Text(_))) => {
                    return Err(MeshError::Protocol("unexpected text message".into()));
                }
                Some(Ok(_)) => {} // Ping/pong are answered by tungstenite
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => return Ok(None),
                Some(Err(e)) => {
                    return Err(MeshError::Transport(format!(
                        "Read from {} failed: {e}",
                        self.remote_addr
                    )));
                }
            }
        }
    }
}

/// Opens outbound connections.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, addr: SocketAddr) -> Result<Connection, MeshError>;
}

/// Dials peers over plain `ws://` WebSockets.
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketDialer;

#[async_trait]
impl Dialer for WebSocketDialer {
    async fn dial(&self, addr: SocketAddr) -> Result<Connection, MeshError> {
        let (ws, _) = connect_async(format!("ws://{addr}"))
            .await
            .map_err(|e| MeshError::Transport(format!("Connect to {addr} failed: {e}")))?;
        Ok(Connection::new(ws, addr))
    }
}

/// Complete the WebSocket upgrade of an accepted TCP stream.
pub async fn upgrade(stream: TcpStream, remote_addr: SocketAddr) -> Result<Connection, MeshError> {
    let ws = accept_async(stream)
        .await
        .map_err(|e| MeshError::Transport(format!("WebSocket accept from {remote_addr} failed: {e}")))?;
    Ok(Connection::new(ws, remote_addr))
}

/// Bind a TCP listener with an explicit accept backlog.
pub fn bind(addr: SocketAddr, backlog: u32) -> Result<TcpListener, MeshError> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    Ok(socket.listen(backlog)?)
}

/// Accept TCP connections until `shutdown` fires, handing each one to
/// `on_accept`.
pub async fn serve<F>(listener: TcpListener, on_accept: F, shutdown: CancellationToken)
where
    F: Fn(TcpStream, SocketAddr) + Send,
{
    if let Ok(addr) = listener.local_addr() {
        info!("Mesh listener accepting on {addr}");
    }
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, addr)) => {
                        debug!("Accepted TCP connection from {addr}");
                        on_accept(stream, addr);
                    }
                    Err(e) => {
                        error!("TCP accept failed: {e}");
                    }
                }
            }
            _ = shutdown.cancelled() => {
                info!("Mesh listener shutting down");
                break;
            }
        }
    }
}

/// An in-process connected pair, for tests and embedding.
///
/// The first connection reports `right` as its remote address, the second
/// reports `left`.
pub async fn memory_pair(left: SocketAddr, right: SocketAddr) -> (Connection, Connection) {
    let (a, b) = tokio::io::duplex(64 * 1024);
    let client = WebSocketStream::from_raw_socket(a, Role::Client, None).await;
    let server = WebSocketStream::from_raw_socket(b, Role::Server, None).await;
    (Connection::new(client, right), Connection::new(server, left))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
