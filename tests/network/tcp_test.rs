// TCP Messenger Tests
// Loopback tests on ephemeral ports

use lamport_ledger::mutex::{MutexConfig, ProcessId};
use lamport_ledger::network::{PeerMessage, PeerMessenger, PeerRegistry, TcpBinding, TcpMessengerConfig};
use lamport_ledger::{ClientId, Node};
use rust_decimal::Decimal;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

async fn bind() -> TcpBinding {
    TcpBinding::bind(TcpMessengerConfig::new().with_connect_timeout_ms(500))
        .await
        .unwrap()
}

fn registry(me: &str, peers: &[(&str, SocketAddr)]) -> PeerRegistry {
    PeerRegistry::from_peers(
        ProcessId::from(me),
        peers.iter().map(|(id, addr)| (ProcessId::from(*id), *addr)),
    )
    .unwrap()
}

#[tokio::test]
async fn test_messages_arrive_in_order() {
    let a = bind().await;
    let b = bind().await;
    let a_addr = a.local_addr().unwrap();
    let b_addr = b.local_addr().unwrap();

    let (a_messenger, _a_inbox) = a.start(registry("A", &[("B", b_addr)])).unwrap();
    let (_b_messenger, mut b_inbox) = b.start(registry("B", &[("A", a_addr)])).unwrap();

    let sent: Vec<PeerMessage> = (1..=20)
        .map(|timestamp| PeerMessage::Release {
            process_id: ProcessId::from("A"),
            timestamp,
        })
        .collect();
    for message in &sent {
        a_messenger.send(&ProcessId::from("B"), message.clone()).unwrap();
    }
    a_messenger.flush(&ProcessId::from("B")).await.unwrap();

    let mut received = Vec::new();
    while received.len() < sent.len() {
        let message = timeout(Duration::from_secs(5), b_inbox.recv())
            .await
            .expect("message should arrive")
            .unwrap();
        received.push(message);
    }
    assert_eq!(received, sent);
}

#[tokio::test]
async fn test_unreachable_peer_reported_on_flush() {
    // Bind then drop to get a port nobody listens on
    let dead_addr = bind().await.local_addr().unwrap();

    let a = bind().await;
    let (messenger, _inbox) = a.start(registry("A", &[("B", dead_addr)])).unwrap();

    messenger
        .send(
            &ProcessId::from("B"),
            PeerMessage::Release {
                process_id: ProcessId::from("A"),
                timestamp: 1,
            },
        )
        .unwrap();

    let err = messenger.flush(&ProcessId::from("B")).await.unwrap_err();
    assert_eq!(err.peer, ProcessId::from("B"));

    // The failure is reported once
    assert!(messenger.flush(&ProcessId::from("B")).await.is_ok());
}

#[tokio::test]
async fn test_transfer_replicates_over_tcp() {
    let bindings = [bind().await, bind().await, bind().await];
    let ids = ["A", "B", "C"];
    let addrs: Vec<SocketAddr> = bindings.iter().map(|b| b.local_addr().unwrap()).collect();

    let mut nodes = Vec::new();
    for (index, binding) in bindings.into_iter().enumerate() {
        let peers: Vec<(&str, SocketAddr)> = ids
            .iter()
            .zip(&addrs)
            .filter(|(id, _)| **id != ids[index])
            .map(|(id, addr)| (*id, *addr))
            .collect();
        let registry = registry(ids[index], &peers);
        let peer_ids = registry.peer_ids();
        let (messenger, inbox) = binding.start(registry).unwrap();

        let node = Arc::new(Node::new(
            ProcessId::from(ids[index]),
            peer_ids,
            Arc::new(messenger),
            Decimal::new(10, 0),
            MutexConfig::new(),
        ));
        node.spawn_inbox(inbox);
        nodes.push(node);
    }

    let receipt = timeout(
        Duration::from_secs(5),
        nodes[0].submit_transfer(ClientId::from("A"), ClientId::from("B"), Decimal::new(5, 0)),
    )
    .await
    .expect("transfer should complete")
    .unwrap();
    assert!(receipt.is_success());

    let converged = async {
        while !nodes.iter().all(|n| n.ledger().height() == 1) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    timeout(Duration::from_secs(5), converged).await.unwrap();

    for node in &nodes {
        assert_eq!(node.get_balance(&ClientId::from("A")), Decimal::new(5, 0));
        assert_eq!(node.get_balance(&ClientId::from("B")), Decimal::new(15, 0));
    }
}
