//! Message box: the queue between peer receive loops and the consumer.
//!
//! The queue is unbounded: a slow consumer grows memory instead of stalling
//! peer I/O.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::MeshError;
use crate::message::{MessageEnvelope, Payload};
use crate::peer::Peer;

struct Queue {
    tx: mpsc::UnboundedSender<MessageEnvelope>,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<MessageEnvelope>>>,
}

/// Inbound application messages awaiting the consumer.
#[derive(Default)]
pub struct MessageBox {
    queue: Mutex<Option<Queue>>,
}

impl MessageBox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open the queue. Starting twice keeps the existing queue.
    pub fn start(&self) {
        let mut queue = self.queue.lock();
        if queue.is_none() {
            let (tx, rx) = mpsc::unbounded_channel();
            *queue = Some(Queue {
                tx,
                rx: Arc::new(tokio::sync::Mutex::new(rx)),
            });
        }
    }

    /// Close the queue, discarding anything not yet consumed.
    pub fn stop(&self) {
        self.queue.lock().take();
    }

    pub fn is_running(&self) -> bool {
        self.queue.lock().is_some()
    }

    /// Enqueue a message from `peer`. A no-op while stopped.
    pub fn on_message(&self, peer: Arc<Peer>, payload: Payload) {
        if let Some(queue) = self.queue.lock().as_ref() {
            let _ = queue.tx.send(MessageEnvelope::new(peer, payload));
        }
    }

    /// Take the next message, waiting for one if the queue is empty.
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<MessageEnvelope, MeshError> {
        let rx = self
            .queue
            .lock()
            .as_ref()
            .map(|queue| Arc::clone(&queue.rx))
            .ok_or(MeshError::NotRunning)?;

        tokio::select! {
            _ = cancel.cancelled() => Err(MeshError::Cancelled),
            envelope = async { rx.lock().await.recv().await } => {
                envelope.ok_or(MeshError::NotRunning)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
