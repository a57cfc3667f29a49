//! Local peer manager: outbound connections we dial and keep alive.
//!
//! Every managed address gets its own worker that dials, handshakes, runs
//! the connection until it ends and then redials after the recovery delay.
//! Consecutive failures are capped by `max_retries_per_peer`.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::error::MeshError;
use crate::manager::ManagerEvent;
use crate::peer::{Peer, PeerContext, PeerOrigin};
use crate::transport::{ConnectionReader, Dialer};

struct LocalEntry {
    generation: u64,
    cancel: CancellationToken,
}

/// Owns the dial loops for every address this node connects out to.
pub struct LocalPeerManager {
    ctx: Arc<PeerContext>,
    dialer: Arc<dyn Dialer>,
    events: mpsc::UnboundedSender<ManagerEvent>,
    entries: Mutex<HashMap<SocketAddr, LocalEntry>>,
    next_generation: AtomicU64,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl LocalPeerManager {
    pub(crate) fn new(
        ctx: Arc<PeerContext>,
        dialer: Arc<dyn Dialer>,
        events: mpsc::UnboundedSender<ManagerEvent>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            dialer,
            events,
            entries: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            shutdown,
            tasks: TaskTracker::new(),
        })
    }

    /// Start dialing `addr`. Returns `false` if it is already managed or the
    /// manager is shutting down.
    pub fn add(self: &Arc<Self>, addr: SocketAddr) -> bool {
        if self.shutdown.is_cancelled() {
            return false;
        }
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let cancel = self.shutdown.child_token();
        {
            let mut entries = self.entries.lock();
            if entries.contains_key(&addr) {
                return false;
            }
            entries.insert(
                addr,
                LocalEntry {
                    generation,
                    cancel: cancel.clone(),
                },
            );
        }

        info!("Dialing {addr}");
        let this = Arc::clone(self);
        self.tasks
            .spawn(async move { this.dial_loop(addr, generation, cancel).await });
        true
    }

    /// Stop dialing `addr` and tear down its live connection, if any.
    pub fn remove(&self, addr: SocketAddr) -> bool {
        match self.entries.lock().remove(&addr) {
            Some(entry) => {
                info!("No longer dialing {addr}");
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Whether `addr` has a running dial loop.
    pub fn contains(&self, addr: SocketAddr) -> bool {
        self.entries.lock().contains_key(&addr)
    }

    /// Addresses with a running dial loop.
    pub fn addresses(&self) -> Vec<SocketAddr> {
        let mut addrs: Vec<_> = self.entries.lock().keys().copied().collect();
        addrs.sort();
        addrs
    }

    /// Cancel every dial loop and wait for all of them to exit.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        self.entries.lock().clear();
        self.tasks.close();
        self.tasks.wait().await;
    }

    async fn dial_loop(self: Arc<Self>, addr: SocketAddr, generation: u64, cancel: CancellationToken) {
        let max_retries = self.ctx.options.max_retries_per_peer;
        let mut failures = 0u32;

        loop {
            match self.connect(addr, &cancel).await {
                Ok((peer, reader)) => {
                    failures = 0;
                    self.publish(ManagerEvent::Connected(Arc::clone(&peer)));
                    peer.run(reader).await;
                    if peer.mark_removed() {
                        self.publish(ManagerEvent::Removed(Arc::clone(&peer)));
                    }
                    if let Some(survivor) = peer.superseded_by() {
                        debug!("{addr} duplicates {survivor}; redialing once it is gone");
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = survivor.removed() => {}
                        }
                    }
                }
                Err(_) if cancel.is_cancelled() => break,
                Err(e) => {
                    failures += 1;
                    debug!("Attempt {failures} to reach {addr} failed: {e}");
                    self.publish(ManagerEvent::DialFailed {
                        addr,
                        attempt: failures,
                        reason: e.to_string(),
                    });
                    if max_retries > 0 && failures >= max_retries {
                        warn!("Giving up on {addr} after {failures} failed attempts");
                        self.forget(addr, generation);
                        self.publish(ManagerEvent::Abandoned { addr });
                        break;
                    }
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.ctx.options.connection_recovery_delay) => {}
            }
        }
        debug!("Dial loop for {addr} finished");
    }

    async fn connect(
        &self,
        addr: SocketAddr,
        cancel: &CancellationToken,
    ) -> Result<(Arc<Peer>, ConnectionReader), MeshError> {
        let timeout = self.ctx.options.connection_timeout;
        let conn = tokio::select! {
            _ = cancel.cancelled() => return Err(MeshError::Cancelled),
            dialed = tokio::time::timeout(timeout, self.dialer.dial(addr)) => {
                dialed.map_err(|_| MeshError::Timeout(timeout))??
            }
        };
        let peer = Peer::new(addr, PeerOrigin::Local, Arc::clone(&self.ctx), cancel);
        let reader = peer.handshake(conn).await?;
        Ok((peer, reader))
    }

    /// Drop the entry for `addr` if it still belongs to this loop.
    fn forget(&self, addr: SocketAddr, generation: u64) {
        let mut entries = self.entries.lock();
        if entries.get(&addr).is_some_and(|e| e.generation == generation) {
            entries.remove(&addr);
        }
    }

    fn publish(&self, event: ManagerEvent) {
        let _ = self.events.send(event);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MeshOptions;
    use crate::identity::MeshToken;
    use crate::inbox::MessageBox;
    use crate::message::MessageRegistry;
    use crate::transport::{Connection, memory_pair};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    fn context(max_retries: u32, network_id: &str) -> Arc<PeerContext> {
        let mut options = MeshOptions::default().with_network_id(network_id);
        options.max_retries_per_peer = max_retries;
        options.connection_timeout = Duration::from_millis(500);
        options.connection_recovery_delay = Duration::from_millis(10);
        let inbox = Arc::new(MessageBox::new());
        inbox.start();
        Arc::new(PeerContext {
            token: MeshToken::generate(),
            options,
            registry: Arc::new(MessageRegistry::new()),
            inbox,
        })
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    /// Always refuses, counting attempts.
    #[derive(Default)]
    struct RefusingDialer {
        attempts: AtomicU32,
    }

    #[async_trait]
    impl Dialer for RefusingDialer {
        async fn dial(&self, addr: SocketAddr) -> Result<Connection, MeshError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(MeshError::Transport(format!("Connect to {addr} refused")))
        }
    }

    /// Connects to an in-process node that accepts and handshakes every dial.
    struct InProcessDialer {
        remote: Arc<PeerContext>,
        accepted: Mutex<Vec<Arc<Peer>>>,
    }

    #[async_trait]
    impl Dialer for InProcessDialer {
        async fn dial(&self, target: SocketAddr) -> Result<Connection, MeshError> {
            let (ours, theirs) = memory_pair(addr(9999), target).await;
            let peer = Peer::new(
                theirs.remote_addr(),
                PeerOrigin::Remote,
                Arc::clone(&self.remote),
                &CancellationToken::new(),
            );
            self.accepted.lock().push(Arc::clone(&peer));
            tokio::spawn(async move {
                if let Ok(reader) = peer.handshake(theirs).await {
                    peer.run(reader).await;
                    peer.mark_removed();
                }
            });
            Ok(ours)
        }
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<ManagerEvent>) -> ManagerEvent {
        tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .expect("event in time")
            .expect("channel open")
    }

    #[tokio::test]
    async fn test_retries_exhaust_then_abandon() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let dialer = Arc::new(RefusingDialer::default());
        let manager = LocalPeerManager::new(context(3, "X"), dialer.clone(), tx, CancellationToken::new());

        assert!(manager.add(addr(7001)));
        for expected in 1..=3 {
            match next_event(&mut rx).await {
                ManagerEvent::DialFailed { addr: a, attempt, .. } => {
                    assert_eq!(a, addr(7001));
                    assert_eq!(attempt, expected);
                }
                other => panic!("expected DialFailed, got {other:?}"),
            }
        }
        assert!(matches!(
            next_event(&mut rx).await,
            ManagerEvent::Abandoned { addr: a } if a == addr(7001)
        ));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(dialer.attempts.load(Ordering::SeqCst), 3);
        assert!(!manager.contains(addr(7001)));

        // Re-adding starts over.
        assert!(manager.add(addr(7001)));
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_add_twice_is_noop() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let manager = LocalPeerManager::new(
            context(0, "X"),
            Arc::new(RefusingDialer::default()),
            tx,
            CancellationToken::new(),
        );
        assert!(manager.add(addr(7002)));
        assert!(!manager.add(addr(7002)));
        assert_eq!(manager.addresses(), vec![addr(7002)]);
        manager.stop().await;
        assert!(manager.addresses().is_empty());
        assert!(!manager.add(addr(7002)));
    }

    #[tokio::test]
    async fn test_remove_stops_retrying() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let dialer = Arc::new(RefusingDialer::default());
        let manager = LocalPeerManager::new(context(0, "X"), dialer.clone(), tx, CancellationToken::new());

        manager.add(addr(7003));
        next_event(&mut rx).await;
        assert!(manager.remove(addr(7003)));
        assert!(!manager.remove(addr(7003)));

        // Let the loop observe cancellation, then make sure it stays quiet.
        tokio::time::sleep(Duration::from_millis(50)).await;
        while rx.try_recv().is_ok() {}
        let attempts = dialer.attempts.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(dialer.attempts.load(Ordering::SeqCst), attempts);
        assert!(rx.try_recv().is_err());
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_connects_and_redials_after_close() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let remote = context(0, "X");
        let dialer = Arc::new(InProcessDialer {
            remote: Arc::clone(&remote),
            accepted: Mutex::new(Vec::new()),
        });
        let manager = LocalPeerManager::new(context(0, "X"), dialer.clone(), tx, CancellationToken::new());

        manager.add(addr(7004));
        let first = match next_event(&mut rx).await {
            ManagerEvent::Connected(peer) => peer,
            other => panic!("expected Connected, got {other:?}"),
        };
        assert_eq!(first.remote_token(), Some(&remote.token));
        assert_eq!(first.origin(), PeerOrigin::Local);
        assert_eq!(first.remote_addr(), addr(7004));

        // The remote hangs up; we see the removal and a fresh connection.
        let accepted = dialer.accepted.lock()[0].clone();
        accepted.kill();
        match next_event(&mut rx).await {
            ManagerEvent::Removed(peer) => assert_eq!(peer.id(), first.id()),
            other => panic!("expected Removed, got {other:?}"),
        }
        match next_event(&mut rx).await {
            ManagerEvent::Connected(peer) => assert_ne!(peer.id(), first.id()),
            other => panic!("expected Connected, got {other:?}"),
        }

        manager.stop().await;
    }

    #[tokio::test]
    async fn test_handshake_failure_counts_as_attempt() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let dialer = Arc::new(InProcessDialer {
            remote: context(0, "Y"),
            accepted: Mutex::new(Vec::new()),
        });
        let manager = LocalPeerManager::new(context(2, "X"), dialer, tx, CancellationToken::new());

        manager.add(addr(7005));
        for _ in 0..2 {
            assert!(matches!(next_event(&mut rx).await, ManagerEvent::DialFailed { .. }));
        }
        assert!(matches!(next_event(&mut rx).await, ManagerEvent::Abandoned { .. }));
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_stop_tears_down_live_connection() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let dialer = Arc::new(InProcessDialer {
            remote: context(0, "X"),
            accepted: Mutex::new(Vec::new()),
        });
        let manager = LocalPeerManager::new(context(0, "X"), dialer, tx, CancellationToken::new());

        manager.add(addr(7006));
        let peer = match next_event(&mut rx).await {
            ManagerEvent::Connected(peer) => peer,
            other => panic!("expected Connected, got {other:?}"),
        };
        tokio::time::timeout(Duration::from_secs(3), manager.stop())
            .await
            .unwrap();
        assert_eq!(peer.state(), crate::peer::PeerState::Removed);
        assert!(matches!(next_event(&mut rx).await, ManagerEvent::Removed(_)));
    }
}
