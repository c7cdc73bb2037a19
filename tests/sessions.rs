//! Identity-to-identity sessions over tunnels: friend gating,
//! acknowledged notifications, and publish/subscribe discovery.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use teapotnet::{Config, Keypair, Listener, Node, NodeId, Publisher, Subscriber};
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(120);

fn loopback_config() -> Config {
    Config {
        port: 0,
        listen_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
        port_mapping: false,
        min_connections: 1,
        tracker: None,
        ..Config::default()
    }
}

async fn spawn_node() -> Node {
    Node::bind(loopback_config()).await.expect("node must bind")
}

fn datagram_addr(node: &Node) -> SocketAddr {
    format!("127.0.0.1:{}", node.datagram_port()).parse().unwrap()
}

async fn link(a: &Node, b: &Node) {
    assert!(a.bootstrap(&[datagram_addr(b)]).await.expect("bootstrap"));
    timeout(Duration::from_secs(10), async {
        loop {
            if a.neighbors().contains(&b.node_id()) && b.neighbors().contains(&a.node_id()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("link must establish");
}

/// Poll a predicate until it holds or the deadline passes.
async fn wait_until<F: FnMut() -> bool>(deadline: Duration, what: &str, mut predicate: F) {
    timeout(deadline, async {
        loop {
            if predicate() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting: {}", what));
}

#[derive(Default)]
struct RecordingListener {
    notifications: Mutex<Vec<Vec<u8>>>,
}

impl Listener for RecordingListener {
    fn notification(&self, _local: &NodeId, _remote: &NodeId, payload: &[u8]) {
        self.notifications.lock().unwrap().push(payload.to_vec());
    }
}

#[derive(Default)]
struct RecordingSubscriber {
    received: Mutex<Vec<(String, NodeId)>>,
}

impl Subscriber for RecordingSubscriber {
    fn incoming(
        &self,
        _peer: Option<&NodeId>,
        prefix: &str,
        subpath: &str,
        target: &NodeId,
    ) -> bool {
        let path = if subpath == "/" {
            prefix.to_string()
        } else {
            format!("{}{}", prefix, subpath)
        };
        self.received.lock().unwrap().push((path, *target));
        false
    }
}

struct FixedPublisher {
    targets: Vec<NodeId>,
}

impl Publisher for FixedPublisher {
    fn announce(&self, _peer: Option<&NodeId>, _prefix: &str, _subpath: &str) -> Vec<NodeId> {
        self.targets.clone()
    }
}

/// Two nodes with one user identity each, listening for each other, with
/// an established session between bob and alice.
async fn session_fixture() -> (
    Node,
    Node,
    NodeId,
    NodeId,
    Arc<RecordingListener>,
    Arc<RecordingListener>,
) {
    let node_a = spawn_node().await;
    let node_b = spawn_node().await;
    link(&node_a, &node_b).await;

    let alice_keys = Keypair::generate().expect("alice keys");
    let bob_keys = Keypair::generate().expect("bob keys");
    let alice = alice_keys.node_id();
    let bob = bob_keys.node_id();

    node_a.add_identity(alice_keys).unwrap();
    node_b.add_identity(bob_keys).unwrap();

    let listener_a = Arc::new(RecordingListener::default());
    let listener_b = Arc::new(RecordingListener::default());
    node_a.listen(alice, bob, listener_a.clone());
    node_b.listen(bob, alice, listener_b.clone());

    // Identity publication is immediate on listen; the lookup behind
    // connect_identity resolves alice's node through the mesh.
    timeout(Duration::from_secs(30), async {
        loop {
            match node_b.connect_identity(&bob, alice).await {
                Ok(()) if node_b.network().has_session(&bob, &alice) => return,
                _ => tokio::time::sleep(Duration::from_millis(250)).await,
            }
        }
    })
    .await
    .expect("session must establish");

    // The inbound side registers its handler a beat later.
    wait_until(Duration::from_secs(10), "inbound session", || {
        node_a.network().has_session(&alice, &bob)
    })
    .await;

    (node_a, node_b, alice, bob, listener_a, listener_b)
}

#[tokio::test]
async fn session_establishes_and_carries_notifications() {
    timeout(TEST_TIMEOUT, async {
        let (node_a, node_b, alice, bob, listener_a, _listener_b) = session_fixture().await;

        node_b
            .send_notification(&bob, &alice, b"hello alice")
            .await
            .expect("notification must queue");

        wait_until(Duration::from_secs(10), "notification delivery", || {
            listener_a
                .notifications
                .lock()
                .unwrap()
                .iter()
                .any(|p| p == b"hello alice")
        })
        .await;

        let _ = (node_a, node_b);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn subscribe_receives_published_digests_without_polling() {
    timeout(TEST_TIMEOUT, async {
        let (node_a, node_b, _alice, _bob, _la, _lb) = session_fixture().await;

        // Alice's node publishes a digest under /files/music.
        let d1 = NodeId::hash(b"a song");
        node_a
            .publish("/files/music", Arc::new(FixedPublisher { targets: vec![d1] }))
            .await;

        // Bob subscribes above it; the subscription answer must carry the
        // digest without any further poll.
        let subscriber = Arc::new(RecordingSubscriber::default());
        node_b.subscribe("/files", subscriber.clone()).await;

        wait_until(Duration::from_secs(10), "subscription answer", || {
            subscriber
                .received
                .lock()
                .unwrap()
                .iter()
                .any(|(path, t)| path == "/files/music" && *t == d1)
        })
        .await;

        let _ = (node_a, node_b);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn publish_after_subscribe_pushes_to_peer() {
    timeout(TEST_TIMEOUT, async {
        let (node_a, node_b, _alice, _bob, _la, _lb) = session_fixture().await;

        // Bob subscribes first.
        let subscriber = Arc::new(RecordingSubscriber::default());
        node_b.subscribe("/files", subscriber.clone()).await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        // Alice publishes afterwards: the announcement is pushed.
        let d2 = NodeId::hash(b"a later song");
        node_a
            .publish("/files/video", Arc::new(FixedPublisher { targets: vec![d2] }))
            .await;

        wait_until(Duration::from_secs(10), "pushed publication", || {
            subscriber.received.lock().unwrap().iter().any(|(_, t)| *t == d2)
        })
        .await;

        let _ = (node_a, node_b);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn fetch_block_directly_from_session_peer() {
    timeout(TEST_TIMEOUT, async {
        let (node_a, node_b, alice, bob, _la, _lb) = session_fixture().await;

        // Stored on alice's node only and never announced to the mesh, so
        // the transfer can only run over the session's Call/Data records.
        let data: Vec<u8> = (0..12_345usize).map(|i| (i * 41 % 251) as u8).collect();
        let digest = node_a.store().store_block(data.clone());

        let fetched = node_b
            .fetch_from_peer(&bob, &alice, &digest, Duration::from_secs(30))
            .await
            .expect("block must transfer over the session");
        assert_eq!(fetched.as_ref(), &data, "fetched bytes must be byte-exact");

        // The transfer completed and cached the block locally.
        assert!(node_b.store().has_block(&digest));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn fetch_from_peer_without_session_reports_absence() {
    timeout(TEST_TIMEOUT, async {
        let node = spawn_node().await;
        let nobody_local = NodeId::hash(b"no local identity");
        let nobody_remote = NodeId::hash(b"no remote identity");

        let fetched = node
            .fetch_from_peer(
                &nobody_local,
                &nobody_remote,
                &NodeId::hash(b"some block"),
                Duration::from_secs(1),
            )
            .await;
        assert!(fetched.is_none(), "no session means no transfer");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn inbound_session_without_listener_is_rejected() {
    timeout(TEST_TIMEOUT, async {
        let node_a = spawn_node().await;
        let node_b = spawn_node().await;
        link(&node_a, &node_b).await;

        let alice_keys = Keypair::generate().unwrap();
        let bob_keys = Keypair::generate().unwrap();
        let alice = alice_keys.node_id();
        let bob = bob_keys.node_id();

        node_a.add_identity(alice_keys).unwrap();
        node_b.add_identity(bob_keys).unwrap();

        // Only bob listens; alice's node never authorized the pair, so
        // bob's inbound session must be rejected by node A.
        let listener_b = Arc::new(RecordingListener::default());
        node_b.listen(bob, alice, listener_b);
        // Publish alice's location manually since nobody listens on A.
        node_a.store_value(&alice, node_a.node_id().as_bytes());
        tokio::time::sleep(Duration::from_millis(300)).await;

        let _ = node_b.connect_identity(&bob, alice).await;
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(
            !node_a.network().has_session(&alice, &bob),
            "unauthorized inbound session must not register"
        );
    })
    .await
    .expect("test timed out");
}
