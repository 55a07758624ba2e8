// Transfer Tests
// End-to-end transfers across in-process nodes

use lamport_ledger::ledger::{Block, ClientId, Transaction, ValidationError};
use lamport_ledger::mutex::{MutexConfig, MutexError, MutexState, ProcessId};
use lamport_ledger::network::{LocalNetwork, PeerMessage};
use lamport_ledger::{Node, TransferError, TransferStatus};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

// ============================================================================
// HELPERS
// ============================================================================

fn dec(value: i64) -> Decimal {
    Decimal::new(value, 0)
}

fn client(name: &str) -> ClientId {
    ClientId::from(name)
}

fn cluster(ids: &[&str], config: MutexConfig) -> (LocalNetwork, Vec<Arc<Node>>) {
    cluster_with_balance(ids, config, dec(10))
}

fn cluster_with_balance(ids: &[&str], config: MutexConfig, initial_balance: Decimal) -> (LocalNetwork, Vec<Arc<Node>>) {
    let network = LocalNetwork::new();
    let all: Vec<ProcessId> = ids.iter().map(|id| ProcessId::from(*id)).collect();
    let nodes = all
        .iter()
        .map(|id| {
            let (messenger, inbox) = network.join(id.clone());
            let node = Arc::new(Node::new(id.clone(), all.clone(), Arc::new(messenger), initial_balance, config.clone()));
            node.spawn_inbox(inbox);
            node
        })
        .collect();
    (network, nodes)
}

async fn wait_for_height(nodes: &[Arc<Node>], height: usize) {
    let reached = async {
        while !nodes.iter().all(|n| n.ledger().height() == height) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    timeout(Duration::from_secs(5), reached)
        .await
        .expect("ledgers should converge");
}

// ============================================================================
// SCENARIOS
// ============================================================================

#[tokio::test]
async fn test_successful_transfer() {
    let (_network, nodes) = cluster(&["A", "B", "C"], MutexConfig::new());

    let receipt = nodes[0].submit_transfer(client("A"), client("B"), dec(5)).await.unwrap();

    assert_eq!(receipt.status, TransferStatus::Success);
    assert_eq!(receipt.before_balance, dec(10));
    assert_eq!(receipt.after_balance, dec(5));
    assert_eq!(receipt.rejection, None);

    let block = receipt.block.unwrap();
    assert_eq!(block.previous_hash(), None);
    assert_eq!(block.hash(), Block::compute_hash(block.transaction(), None));

    wait_for_height(&nodes, 1).await;
    for node in &nodes {
        assert_eq!(node.get_balance(&client("A")), dec(5));
        assert_eq!(node.get_balance(&client("B")), dec(15));
        assert_eq!(node.get_ledger(), vec![block.clone()]);
    }
}

#[tokio::test]
async fn test_overdraft_rejected_and_mutex_released() {
    let (_network, nodes) = cluster(&["A", "B", "C"], MutexConfig::new());

    let receipt = nodes[0].submit_transfer(client("A"), client("B"), dec(20)).await.unwrap();

    assert_eq!(receipt.status, TransferStatus::Failed);
    assert_eq!(receipt.block, None);
    assert_eq!(
        receipt.rejection,
        Some(ValidationError::InsufficientBalance {
            available: dec(10),
            required: dec(20)
        })
    );
    assert_eq!(receipt.before_balance, receipt.after_balance);
    assert!(nodes[0].get_ledger().is_empty());
    assert_eq!(nodes[0].mutex().state(), MutexState::Idle);

    // The mutex was released, so A can go again at once
    let retry = timeout(
        Duration::from_secs(5),
        nodes[0].submit_transfer(client("A"), client("B"), dec(10)),
    )
    .await
    .unwrap()
    .unwrap();
    assert!(retry.is_success());
    assert_eq!(nodes[0].get_balance(&client("A")), dec(0));
}

#[tokio::test]
async fn test_negative_amount_rejected_and_mutex_released() {
    let (_network, nodes) = cluster(&["A", "B"], MutexConfig::new());

    let receipt = nodes[0].submit_transfer(client("A"), client("B"), dec(-3)).await.unwrap();

    assert_eq!(receipt.status, TransferStatus::Failed);
    assert_eq!(receipt.rejection, Some(ValidationError::NonPositiveAmount(dec(-3))));
    assert_eq!(receipt.block, None);
    assert_eq!(nodes[0].get_balance(&client("A")), dec(10));
    assert_eq!(nodes[0].get_balance(&client("B")), dec(10));
    assert_eq!(nodes[0].mutex().state(), MutexState::Idle);

    // B was released too and can take the section
    let receipt = timeout(
        Duration::from_secs(5),
        nodes[1].submit_transfer(client("B"), client("A"), dec(1)),
    )
    .await
    .unwrap()
    .unwrap();
    assert!(receipt.is_success());
}

#[tokio::test]
async fn test_balance_overflow_rejected_and_mutex_released() {
    let (_network, nodes) = cluster_with_balance(&["A"], MutexConfig::new(), Decimal::MAX);

    let receipt = nodes[0].submit_transfer(client("A"), client("B"), dec(1)).await.unwrap();

    assert_eq!(receipt.status, TransferStatus::Failed);
    assert_eq!(receipt.rejection, Some(ValidationError::BalanceOverflow(client("B"))));
    assert_eq!(receipt.block, None);
    assert!(nodes[0].get_ledger().is_empty());
    assert_eq!(nodes[0].mutex().state(), MutexState::Idle);
    assert_eq!(nodes[0].get_balance(&client("B")), Decimal::MAX);
}

#[tokio::test]
async fn test_crashed_requester_stalls_transfers() {
    let (network, nodes) = cluster(&["A", "B", "C"], MutexConfig::new());
    let c = nodes[2].clone();

    c.mutex().request_mutex().unwrap();
    // Let A and B queue C's request
    let queued = async {
        while !(nodes[0].mutex().has_pending_request(&ProcessId::from("C"))
            && nodes[1].mutex().has_pending_request(&ProcessId::from("C")))
        {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    timeout(Duration::from_secs(5), queued).await.unwrap();
    network.disconnect(&ProcessId::from("C"));

    let stalled = timeout(
        Duration::from_millis(200),
        nodes[0].submit_transfer(client("A"), client("B"), dec(1)),
    )
    .await;

    assert!(stalled.is_err());
    assert_eq!(nodes[0].ledger().height(), 0);
}

#[tokio::test]
async fn test_request_timeout_fails_transfer() {
    let config = MutexConfig::new().with_request_timeout(Duration::from_millis(50));
    let (network, nodes) = cluster(&["A", "B", "C"], config);
    network.disconnect(&ProcessId::from("C"));

    let err = nodes[0]
        .submit_transfer(client("A"), client("B"), dec(1))
        .await
        .unwrap_err();

    assert_eq!(
        err,
        TransferError::Mutex(MutexError::Timeout {
            waited: Duration::from_millis(50)
        })
    );
    assert_eq!(nodes[0].get_balance(&client("A")), dec(10));
    assert_eq!(nodes[0].mutex().state(), MutexState::Idle);

    // B saw the withdrawal
    let withdrawn = async {
        while nodes[1].mutex().has_pending_request(&ProcessId::from("A")) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    timeout(Duration::from_secs(5), withdrawn).await.unwrap();
}

// ============================================================================
// PROPERTIES
// ============================================================================

#[tokio::test]
async fn test_concurrent_transfers_converge() {
    let (_network, nodes) = cluster(&["A", "B", "C"], MutexConfig::new());
    let plan = [("A", "B"), ("B", "C"), ("C", "A")];

    let mut tasks = Vec::new();
    for (node, (sender, receiver)) in nodes.iter().zip(plan) {
        let node = node.clone();
        tasks.push(tokio::spawn(async move {
            let mut committed: usize = 0;
            for amount in 1..=4 {
                let receipt = node
                    .submit_transfer(client(sender), client(receiver), dec(amount))
                    .await
                    .unwrap();
                if receipt.is_success() {
                    committed += 1;
                }
            }
            committed
        }));
    }

    let mut committed: usize = 0;
    for task in tasks {
        committed += timeout(Duration::from_secs(10), task).await.unwrap().unwrap();
    }
    assert_eq!(committed, 12);

    wait_for_height(&nodes, committed).await;

    let reference = nodes[0].get_ledger();
    let balances = nodes[0].ledger().balances();
    for node in &nodes {
        assert_eq!(node.get_ledger(), reference);
        assert_eq!(node.ledger().balances(), balances);
        assert_eq!(node.ledger().verify_chain(), Ok(()));
    }

    let total: Decimal = balances.iter().map(|(_, b)| *b).sum();
    assert_eq!(total, dec(30));
}

#[tokio::test]
async fn test_local_transfers_take_turns() {
    let (_network, nodes) = cluster(&["A", "B"], MutexConfig::new());
    let a = nodes[0].clone();

    let first = {
        let a = a.clone();
        tokio::spawn(async move { a.submit_transfer(client("A"), client("B"), dec(3)).await })
    };
    let second = {
        let a = a.clone();
        tokio::spawn(async move { a.submit_transfer(client("A"), client("C"), dec(3)).await })
    };

    assert!(first.await.unwrap().unwrap().is_success());
    assert!(second.await.unwrap().unwrap().is_success());
    assert_eq!(a.get_balance(&client("A")), dec(4));
}

#[tokio::test]
async fn test_replayed_block_is_ignored() {
    let (_network, nodes) = cluster(&["A", "B"], MutexConfig::new());

    let receipt = nodes[0].submit_transfer(client("A"), client("B"), dec(2)).await.unwrap();
    let block = receipt.block.unwrap();
    wait_for_height(&nodes, 1).await;

    nodes[1].handle(PeerMessage::Block(block));

    assert_eq!(nodes[1].ledger().height(), 1);
    assert_eq!(nodes[1].get_balance(&client("B")), dec(12));
    assert_eq!(nodes[1].stats().blocks_ignored, 1);
}

#[tokio::test]
async fn test_forged_block_is_rejected() {
    let (_network, nodes) = cluster(&["A", "B"], MutexConfig::new());

    let transaction = Transaction::new(client("A"), client("B"), dec(1));
    let forged = Block::from_parts(transaction, None, "00".repeat(32), 1);
    nodes[1].handle(PeerMessage::Block(forged));

    let status = nodes[1].status();
    assert_eq!(status.height, 0);
    assert_eq!(status.head_hash, None);
    assert_eq!(status.stats.blocks_rejected, 1);
}

#[tokio::test]
async fn test_status_reflects_activity() {
    let (_network, nodes) = cluster(&["A", "B"], MutexConfig::new());

    nodes[0].submit_transfer(client("A"), client("B"), dec(1)).await.unwrap();
    wait_for_height(&nodes, 1).await;

    let status = nodes[1].status();
    assert_eq!(status.process_id, ProcessId::from("B"));
    assert_eq!(status.state, MutexState::Idle);
    assert!(status.clock > 0);
    assert_eq!(status.head_hash, nodes[0].ledger().head_hash());
    assert_eq!(status.stats.requests_received, 1);
    assert_eq!(status.stats.blocks_applied, 1);
}
