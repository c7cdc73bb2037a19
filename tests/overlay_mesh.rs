//! Overlay mesh integration: direct links, multi-hop routing, and the
//! distributed key-value store, over real sockets on loopback.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use teapotnet::{Config, Node, NodeId};
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(60);

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

/// Connect `a` to `b` and wait until both see each other as neighbours.
async fn link(a: &Node, b: &Node) {
    let connected = a.bootstrap(&[datagram_addr(b)]).await.expect("bootstrap");
    assert!(connected, "bootstrap connect must succeed");

    timeout(Duration::from_secs(10), async {
        loop {
            if a.neighbors().contains(&b.node_id()) && b.neighbors().contains(&a.node_id()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("both sides must register the link");
}

#[tokio::test]
async fn direct_connect_and_ping() {
    timeout(TEST_TIMEOUT, async {
        let a = spawn_node().await;
        let b = spawn_node().await;

        link(&a, &b).await;
        assert!(a.neighbors().contains(&b.node_id()));
        assert!(b.neighbors().contains(&a.node_id()));

        // Liveness round-trip with echoed content.
        assert!(
            a.ping(&b.node_id(), b"hi", Duration::from_secs(5)).await,
            "pong must come back"
        );
        assert!(
            b.ping(&a.node_id(), b"yo", Duration::from_secs(5)).await,
            "ping works in both directions"
        );
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn routed_delivery_over_middle_node() {
    timeout(TEST_TIMEOUT, async {
        let a = spawn_node().await;
        let b = spawn_node().await;
        let c = spawn_node().await;

        // Line topology: A - B - C. A and C never connect directly.
        link(&a, &b).await;
        link(&b, &c).await;
        assert_eq!(b.neighbor_count(), 2, "middle node holds both links");
        assert!(!a.neighbors().contains(&c.node_id()));

        // Pings cross the middle node in both directions.
        assert!(
            a.ping(&c.node_id(), b"through b", Duration::from_secs(5)).await,
            "A must reach C through B"
        );
        assert!(
            c.ping(&a.node_id(), b"back again", Duration::from_secs(5)).await,
            "C must reach A through B"
        );
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn store_and_retrieve_across_the_mesh() {
    timeout(TEST_TIMEOUT, async {
        let a = spawn_node().await;
        let b = spawn_node().await;
        let c = spawn_node().await;

        link(&a, &b).await;
        link(&b, &c).await;

        let key = NodeId::hash(b"hello");
        a.store_value(&key, b"stored by a");

        // Give the hop-by-hop store a moment to spread.
        tokio::time::sleep(Duration::from_millis(300)).await;

        let values = c.retrieve_value(&key).await;
        assert!(
            values.contains(&b"stored by a".to_vec()),
            "C must observe the value A stored, got {:?}",
            values.len()
        );
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn retrieve_missing_key_returns_empty() {
    timeout(TEST_TIMEOUT, async {
        let a = spawn_node().await;
        let b = spawn_node().await;
        link(&a, &b).await;

        let mut config = loopback_config();
        config.request_timeout_ms = 1_000; // keep the negative case fast
        let c = Node::bind(config).await.expect("bind");
        link(&b, &c).await;

        let values = c.retrieve_value(&NodeId::hash(b"never stored")).await;
        assert!(values.is_empty());
    })
    .await
    .expect("test timed out");
}
