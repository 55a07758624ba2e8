// Ledger State - the hash chain and the balance table of one process
//
// Single writer: local commits and replicated blocks arrive on different
// tasks, so every mutation goes through one lock. Reads return snapshots
// taken under the same lock.

use crate::ledger::{Block, ClientId, Transaction};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracing::{debug, info};

/// Reasons a transaction is rejected before commit
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Insufficient balance: available {available}, required {required}")]
    InsufficientBalance { available: Decimal, required: Decimal },

    #[error("Invalid amount: {0} is not positive")]
    NonPositiveAmount(Decimal),

    #[error("Balance of {0} would overflow")]
    BalanceOverflow(ClientId),
}

/// Errors raised by ledger mutations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    #[error("Transaction rejected: {0}")]
    Rejected(#[from] ValidationError),

    #[error("Block hash {hash} does not match its contents")]
    HashMismatch { hash: String },

    #[error("Block does not extend the local chain: head {head:?}, block previous {previous:?}")]
    ChainMismatch {
        head: Option<String>,
        previous: Option<String>,
    },

    #[error("Chain broken at block {index}")]
    BrokenChain { index: usize },
}

#[derive(Debug, Default)]
struct LedgerInner {
    /// Blocks, oldest first
    blocks: Vec<Block>,
    /// Index of block hashes for duplicate detection
    known_hashes: HashSet<String>,
    balances: HashMap<ClientId, Decimal>,
}

impl LedgerInner {
    fn balance_of(&self, client: &ClientId, initial: Decimal) -> Decimal {
        self.balances.get(client).copied().unwrap_or(initial)
    }

    fn head_hash(&self) -> Option<String> {
        self.blocks.last().map(|b| b.hash().to_string())
    }

    /// Balances of sender and receiver after the transfer
    fn settle(&self, txn: &Transaction, initial: Decimal) -> Result<Vec<(ClientId, Decimal)>, ValidationError> {
        let amount = txn.amount();
        let sender_balance = self.balance_of(txn.sender(), initial);

        // A self-transfer nets to zero
        if txn.sender() == txn.receiver() {
            return Ok(vec![(txn.sender().clone(), sender_balance)]);
        }

        let sender_after = sender_balance
            .checked_sub(amount)
            .ok_or_else(|| ValidationError::BalanceOverflow(txn.sender().clone()))?;
        let receiver_after = self
            .balance_of(txn.receiver(), initial)
            .checked_add(amount)
            .ok_or_else(|| ValidationError::BalanceOverflow(txn.receiver().clone()))?;

        Ok(vec![
            (txn.sender().clone(), sender_after),
            (txn.receiver().clone(), receiver_after),
        ])
    }

    fn append(&mut self, block: Block, settled: Vec<(ClientId, Decimal)>) {
        self.balances.extend(settled);
        self.known_hashes.insert(block.hash().to_string());
        self.blocks.push(block);
    }
}

/// Append-only block chain plus balance table
#[derive(Debug)]
pub struct Ledger {
    /// Balance of a client that has never transacted
    initial_balance: Decimal,
    inner: Mutex<LedgerInner>,
}

impl Ledger {
    /// Create an empty ledger
    pub fn new(initial_balance: Decimal) -> Self {
        Self {
            initial_balance,
            inner: Mutex::new(LedgerInner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LedgerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Balance assigned to clients on first reference
    pub fn initial_balance(&self) -> Decimal {
        self.initial_balance
    }

    /// Check a transaction against the current balances
    pub fn validate(&self, transaction: &Transaction) -> Result<(), ValidationError> {
        let inner = self.lock();
        Self::check(&inner, transaction, self.initial_balance).map(|_| ())
    }

    fn check(
        inner: &LedgerInner,
        transaction: &Transaction,
        initial: Decimal,
    ) -> Result<Vec<(ClientId, Decimal)>, ValidationError> {
        let amount = transaction.amount();
        if amount <= Decimal::ZERO {
            return Err(ValidationError::NonPositiveAmount(amount));
        }

        let available = inner.balance_of(transaction.sender(), initial);
        if available < amount {
            return Err(ValidationError::InsufficientBalance {
                available,
                required: amount,
            });
        }

        inner.settle(transaction, initial)
    }

    /// Validate and append a transaction as a new block.
    ///
    /// Must only be called while the process holds the critical section.
    /// Validation is repeated under the lock so the check and the append are
    /// one atomic step.
    pub fn commit(&self, transaction: Transaction, timestamp: u64) -> Result<Block, ValidationError> {
        let mut inner = self.lock();
        let settled = Self::check(&inner, &transaction, self.initial_balance)?;

        let block = Block::new(transaction, inner.head_hash(), timestamp);
        inner.append(block.clone(), settled);

        info!(
            hash = %block.hash(),
            height = inner.blocks.len(),
            transaction = %block.transaction(),
            "Committed block"
        );
        Ok(block)
    }

    /// Apply a block committed by a peer.
    ///
    /// Balances are not re-validated, but a block whose amounts would overflow
    /// a balance is refused. Returns Ok(false) if the block is already in the
    /// chain.
    pub fn apply_replicated_block(&self, block: Block) -> Result<bool, LedgerError> {
        if !block.has_valid_hash() {
            return Err(LedgerError::HashMismatch {
                hash: block.hash().to_string(),
            });
        }

        let mut inner = self.lock();
        if inner.known_hashes.contains(block.hash()) {
            debug!(hash = %block.hash(), "Ignoring duplicate replicated block");
            return Ok(false);
        }

        let head = inner.head_hash();
        if head.as_deref() != block.previous_hash() {
            return Err(LedgerError::ChainMismatch {
                head,
                previous: block.previous_hash().map(str::to_string),
            });
        }

        let settled = inner.settle(block.transaction(), self.initial_balance)?;

        info!(
            hash = %block.hash(),
            height = inner.blocks.len() + 1,
            transaction = %block.transaction(),
            "Applied replicated block"
        );
        inner.append(block, settled);
        Ok(true)
    }

    /// Current balance of a client
    pub fn balance_of(&self, client: &ClientId) -> Decimal {
        self.lock().balance_of(client, self.initial_balance)
    }

    /// Snapshot of every balance that has been touched, sorted by client
    pub fn balances(&self) -> Vec<(ClientId, Decimal)> {
        let inner = self.lock();
        let mut balances: Vec<(ClientId, Decimal)> = inner
            .balances
            .iter()
            .map(|(client, balance)| (client.clone(), *balance))
            .collect();
        balances.sort_by(|a, b| a.0.cmp(&b.0));
        balances
    }

    /// Snapshot of the chain, oldest first
    pub fn chain(&self) -> Vec<Block> {
        self.lock().blocks.clone()
    }

    /// Number of blocks
    pub fn height(&self) -> usize {
        self.lock().blocks.len()
    }

    /// Hash of the newest block
    pub fn head_hash(&self) -> Option<String> {
        self.lock().head_hash()
    }

    /// Recompute every hash and link; report the first broken block
    pub fn verify_chain(&self) -> Result<(), LedgerError> {
        let inner = self.lock();
        let mut previous: Option<&str> = None;

        for (index, block) in inner.blocks.iter().enumerate() {
            if block.previous_hash() != previous || !block.has_valid_hash() {
                return Err(LedgerError::BrokenChain { index });
            }
            previous = Some(block.hash());
        }

        Ok(())
    }
}
