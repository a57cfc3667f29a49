use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use hive_mesh::{Mesh, MeshEvent, MeshOptions, MessageRegistry, PeerState};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Greeting {
    text: String,
}

fn options(network: &str, seeds: Vec<SocketAddr>) -> MeshOptions {
    let mut options = MeshOptions::default().with_network_id(network);
    options.listen_addr = SocketAddr::from(([127, 0, 0, 1], 0));
    options.connection_timeout = Duration::from_secs(2);
    options.connection_recovery_delay = Duration::from_millis(100);
    options.max_retries_per_peer = 3;
    options.initial_peers = seeds;
    options
}

fn mesh(options: MeshOptions) -> Mesh {
    let mut registry = MessageRegistry::new();
    registry.register::<Greeting>("greeting").unwrap();
    Mesh::new(options, registry).unwrap()
}

async fn started(options: MeshOptions) -> Mesh {
    let mesh = mesh(options);
    assert!(mesh.start(64).await.unwrap());
    mesh
}

async fn until(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn next_matching(
    rx: &mut broadcast::Receiver<MeshEvent>,
    matches: impl Fn(&MeshEvent) -> bool,
) -> MeshEvent {
    let wait = async {
        loop {
            match rx.recv().await {
                Ok(event) if matches(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(10), wait)
        .await
        .expect("expected event did not arrive")
}

#[tokio::test]
async fn greeting_reaches_seeded_peer() {
    let b = started(options("X", vec![])).await;
    let b_addr = b.local_endpoint().unwrap();
    let a = started(options("X", vec![b_addr])).await;

    until("both sides connected", || a.peer_count() == 1 && b.peer_count() == 1).await;

    let cancel = CancellationToken::new();
    let status = a
        .broadcast(Greeting { text: "hello".into() }, &cancel)
        .await
        .unwrap();
    assert_eq!(status.reached.len(), 1);
    assert_eq!(status.reached[0].remote_token(), Some(b.local_token()));

    let envelope = tokio::time::timeout(Duration::from_secs(5), b.wait(&cancel))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        envelope.payload.downcast_ref::<Greeting>(),
        Some(&Greeting { text: "hello".into() })
    );
    assert_eq!(envelope.source.remote_token(), Some(a.local_token()));

    // And back again by unicast.
    let delivery = b
        .send(a.local_token(), Greeting { text: "hi".into() })
        .await
        .unwrap()
        .expect("a is connected");
    assert_eq!(delivery.destination.remote_token(), Some(a.local_token()));
    let reply = tokio::time::timeout(Duration::from_secs(5), a.wait(&cancel))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply.payload.downcast_ref::<Greeting>().unwrap().text, "hi");

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn different_network_ids_never_connect() {
    let b = started(options("Y", vec![])).await;
    let b_addr = b.local_endpoint().unwrap();
    let mut b_events = b.subscribe();

    let mut a_opts = options("X", vec![b_addr]);
    a_opts.max_retries_per_peer = 2;
    let a = mesh(a_opts);
    let mut a_events = a.subscribe();
    a.start(64).await.unwrap();

    for expected in 1..=2 {
        match next_matching(&mut a_events, |_| true).await {
            MeshEvent::DialFailed { addr, attempt, .. } => {
                assert_eq!(addr, b_addr);
                assert_eq!(attempt, expected);
            }
            other => panic!("expected DialFailed, got {other:?}"),
        }
    }
    match next_matching(&mut a_events, |_| true).await {
        MeshEvent::AddressAbandoned { addr } => assert_eq!(addr, b_addr),
        other => panic!("expected AddressAbandoned, got {other:?}"),
    }

    assert_eq!(a.peer_count(), 0);
    assert_eq!(b.peer_count(), 0);
    assert!(a.dialed_addresses().is_empty());
    assert!(matches!(
        b_events.try_recv(),
        Err(broadcast::error::TryRecvError::Empty)
    ));

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn mutual_dial_converges_to_one_peer_each() {
    let a = started(options("X", vec![])).await;
    let a_addr = a.local_endpoint().unwrap();
    let b = started(options("X", vec![a_addr])).await;
    let b_addr = b.local_endpoint().unwrap();
    assert!(a.add_peer(b_addr).unwrap());

    until("both sides connected", || a.peer_count() == 1 && b.peer_count() == 1).await;

    // Give duplicate resolution and any redial a few recovery periods.
    tokio::time::sleep(Duration::from_millis(800)).await;
    let a_peers = a.peers();
    let b_peers = b.peers();
    assert_eq!(a_peers.len(), 1);
    assert_eq!(b_peers.len(), 1);
    assert_eq!(a_peers[0].remote_token(), Some(b.local_token()));
    assert_eq!(b_peers[0].remote_token(), Some(a.local_token()));
    assert_eq!(a_peers[0].state(), PeerState::Connected);
    assert_eq!(b_peers[0].state(), PeerState::Connected);

    // Both ends kept the same connection: a's outbound is b's inbound.
    assert_ne!(a_peers[0].origin(), b_peers[0].origin());

    let status = a
        .broadcast(Greeting { text: "once".into() }, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(status.reached.len(), 1);

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn remove_peer_stops_redialing() {
    let b = started(options("X", vec![])).await;
    let b_addr = b.local_endpoint().unwrap();
    let a = started(options("X", vec![b_addr])).await;
    until("connected", || a.peer_count() == 1 && b.peer_count() == 1).await;

    let mut a_events = a.subscribe();
    assert!(a.remove_peer(b_addr).unwrap());
    next_matching(&mut a_events, |e| matches!(e, MeshEvent::PeerRemoved(_))).await;
    until("b noticed", || b.peer_count() == 0).await;

    // Several recovery periods pass without a reconnect.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(a.peer_count(), 0);
    assert_eq!(b.peer_count(), 0);
    assert!(a.dialed_addresses().is_empty());
    while let Ok(event) = a_events.try_recv() {
        assert!(
            !matches!(event, MeshEvent::PeerConnected(_)),
            "unexpected reconnect: {event:?}"
        );
    }

    // Adding it back reconnects.
    assert!(a.add_peer(b_addr).unwrap());
    until("reconnected", || a.peer_count() == 1 && b.peer_count() == 1).await;

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn restarted_node_reconnects_with_same_identity() {
    let b = started(options("X", vec![])).await;
    let b_addr = b.local_endpoint().unwrap();
    let a = started(options("X", vec![b_addr])).await;
    until("connected", || b.peer_count() == 1).await;

    let mut b_events = b.subscribe();
    a.stop().await;
    assert!(!a.is_running());
    assert_eq!(a.peer_count(), 0);
    next_matching(&mut b_events, |e| matches!(e, MeshEvent::PeerRemoved(_))).await;
    assert_eq!(b.peer_count(), 0);

    assert!(a.start(64).await.unwrap());
    let event = next_matching(&mut b_events, |e| matches!(e, MeshEvent::PeerConnected(_))).await;
    let MeshEvent::PeerConnected(peer) = event else {
        unreachable!()
    };
    assert_eq!(peer.remote_token(), Some(a.local_token()));

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn stop_wakes_pending_wait() {
    let a = started(options("X", vec![])).await;
    let a = std::sync::Arc::new(a);
    let waiter = {
        let a = std::sync::Arc::clone(&a);
        tokio::spawn(async move { a.wait(&CancellationToken::new()).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    a.stop().await;

    let result = tokio::time::timeout(Duration::from_secs(2), waiter)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(hive_mesh::MeshError::NotRunning)));
}
