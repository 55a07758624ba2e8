// Ledger State Tests
// Tests for validation, commits, replication and chain integrity

use lamport_ledger::ledger::{Block, ClientId, Ledger, LedgerError, Transaction, TransactionId, ValidationError};
use rust_decimal::Decimal;

fn dec(value: i64) -> Decimal {
    Decimal::new(value, 0)
}

fn transfer(sender: &str, receiver: &str, amount: i64) -> Transaction {
    Transaction::new(ClientId::from(sender), ClientId::from(receiver), dec(amount))
}

// ============================================================================
// VALIDATION
// ============================================================================

#[test]
fn test_unknown_client_has_initial_balance() {
    let ledger = Ledger::new(dec(10));
    assert_eq!(ledger.balance_of(&ClientId::from("nobody")), dec(10));
    assert_eq!(ledger.height(), 0);
    assert_eq!(ledger.head_hash(), None);
}

#[test]
fn test_validate_accepts_exact_balance() {
    let ledger = Ledger::new(dec(10));
    assert_eq!(ledger.validate(&transfer("A", "B", 10)), Ok(()));
}

#[test]
fn test_validate_rejects_overdraft() {
    let ledger = Ledger::new(dec(10));
    assert_eq!(
        ledger.validate(&transfer("A", "B", 20)),
        Err(ValidationError::InsufficientBalance {
            available: dec(10),
            required: dec(20)
        })
    );
}

#[test]
fn test_validate_rejects_non_positive_amount() {
    let ledger = Ledger::new(dec(10));
    assert_eq!(
        ledger.validate(&transfer("A", "B", 0)),
        Err(ValidationError::NonPositiveAmount(dec(0)))
    );
    assert!(ledger.validate(&transfer("A", "B", -3)).is_err());
}

// ============================================================================
// COMMIT
// ============================================================================

#[test]
fn test_commit_moves_balance() {
    let ledger = Ledger::new(dec(10));
    let block = ledger.commit(transfer("A", "B", 5), 3).unwrap();

    assert_eq!(ledger.balance_of(&ClientId::from("A")), dec(5));
    assert_eq!(ledger.balance_of(&ClientId::from("B")), dec(15));
    assert_eq!(block.timestamp(), 3);
    assert_eq!(block.previous_hash(), None);
    assert_eq!(ledger.head_hash().as_deref(), Some(block.hash()));
}

#[test]
fn test_rejected_commit_leaves_state_untouched() {
    let ledger = Ledger::new(dec(10));
    ledger.commit(transfer("A", "B", 4), 1).unwrap();

    let err = ledger.commit(transfer("A", "C", 7), 2).unwrap_err();
    assert!(matches!(err, ValidationError::InsufficientBalance { .. }));
    assert_eq!(ledger.height(), 1);
    assert_eq!(ledger.balance_of(&ClientId::from("A")), dec(6));
    assert_eq!(ledger.balance_of(&ClientId::from("C")), dec(10));
}

#[test]
fn test_decimal_amounts() {
    let ledger = Ledger::new(dec(10));
    let amount = Decimal::new(250, 2); // 2.50
    ledger
        .commit(Transaction::new(ClientId::from("A"), ClientId::from("B"), amount), 1)
        .unwrap();

    assert_eq!(ledger.balance_of(&ClientId::from("A")), Decimal::new(750, 2));
}

#[test]
fn test_self_transfer_nets_to_zero() {
    let ledger = Ledger::new(dec(10));
    ledger.commit(transfer("A", "A", 3), 1).unwrap();
    assert_eq!(ledger.balance_of(&ClientId::from("A")), dec(10));
}

#[test]
fn test_blocks_link_to_predecessor() {
    let ledger = Ledger::new(dec(10));
    let first = ledger.commit(transfer("A", "B", 1), 1).unwrap();
    let second = ledger.commit(transfer("B", "C", 2), 4).unwrap();

    assert_eq!(second.previous_hash(), Some(first.hash()));
    assert_eq!(second.hash(), Block::compute_hash(second.transaction(), Some(first.hash())));
    assert_eq!(ledger.chain(), vec![first, second]);
    assert_eq!(ledger.verify_chain(), Ok(()));
}

#[test]
fn test_balances_sorted_and_conserved() {
    let ledger = Ledger::new(dec(10));
    ledger.commit(transfer("C", "A", 4), 1).unwrap();
    ledger.commit(transfer("A", "B", 9), 2).unwrap();

    let balances = ledger.balances();
    let clients: Vec<&str> = balances.iter().map(|(c, _)| c.as_str()).collect();
    assert_eq!(clients, vec!["A", "B", "C"]);

    let total: Decimal = balances.iter().map(|(_, b)| *b).sum();
    assert_eq!(total, dec(30));
}

// ============================================================================
// REPLICATION
// ============================================================================

#[test]
fn test_replicated_block_applied() {
    let origin = Ledger::new(dec(10));
    let replica = Ledger::new(dec(10));

    let block = origin.commit(transfer("A", "B", 5), 1).unwrap();
    assert_eq!(replica.apply_replicated_block(block.clone()), Ok(true));

    assert_eq!(replica.chain(), origin.chain());
    assert_eq!(replica.balance_of(&ClientId::from("B")), dec(15));
}

#[test]
fn test_replicated_block_applied_once() {
    let origin = Ledger::new(dec(10));
    let replica = Ledger::new(dec(10));
    let block = origin.commit(transfer("A", "B", 5), 1).unwrap();

    assert_eq!(replica.apply_replicated_block(block.clone()), Ok(true));
    assert_eq!(replica.apply_replicated_block(block), Ok(false));
    assert_eq!(replica.height(), 1);
    assert_eq!(replica.balance_of(&ClientId::from("A")), dec(5));
}

#[test]
fn test_tampered_block_rejected() {
    let origin = Ledger::new(dec(10));
    let replica = Ledger::new(dec(10));
    let block = origin.commit(transfer("A", "B", 5), 1).unwrap();

    let inflated = Transaction::from_parts(
        ClientId::from("A"),
        ClientId::from("B"),
        dec(500),
        block.transaction().timestamp(),
        *block.transaction().id(),
    );
    let forged = Block::from_parts(inflated, None, block.hash().to_string(), 1);

    assert!(matches!(
        replica.apply_replicated_block(forged),
        Err(LedgerError::HashMismatch { .. })
    ));
    assert_eq!(replica.height(), 0);
}

#[test]
fn test_block_out_of_order_rejected() {
    let origin = Ledger::new(dec(10));
    let replica = Ledger::new(dec(10));
    origin.commit(transfer("A", "B", 1), 1).unwrap();
    let second = origin.commit(transfer("A", "B", 1), 2).unwrap();

    let err = replica.apply_replicated_block(second).unwrap_err();
    assert!(matches!(err, LedgerError::ChainMismatch { head: None, .. }));
    assert_eq!(replica.height(), 0);
}

#[test]
fn test_canonical_hash_is_deterministic() {
    let id = TransactionId::from_bytes([7u8; 16]);
    let a = Transaction::from_parts(ClientId::from("A"), ClientId::from("B"), dec(5), 1_700_000_000_000, id);
    let b = Transaction::from_parts(
        ClientId::from("A"),
        ClientId::from("B"),
        Decimal::new(500, 2),
        1_700_000_000_000,
        id,
    );

    assert_eq!(Block::compute_hash(&a, None), Block::compute_hash(&b, None));
    assert_ne!(Block::compute_hash(&a, None), Block::compute_hash(&a, Some("00")));
    assert_eq!(Block::compute_hash(&a, None).len(), 64);
}

#[test]
fn test_hash_distinguishes_names_containing_commas() {
    let id = TransactionId::from_bytes([3u8; 16]);
    let left = Transaction::from_parts(ClientId::from("A,B"), ClientId::from("C"), dec(1), 9, id);
    let right = Transaction::from_parts(ClientId::from("A"), ClientId::from("B,C"), dec(1), 9, id);

    assert_ne!(Block::compute_hash(&left, None), Block::compute_hash(&right, None));
}
