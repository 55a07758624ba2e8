// Block - one committed transaction linked to its predecessor by hash

use crate::ledger::Transaction;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// An immutable, hash-chained ledger entry
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    transaction: Transaction,
    /// Hash of the preceding block, None for the first block
    previous_hash: Option<String>,
    /// Hex SHA-256 of canonical transaction + previous hash
    hash: String,
    /// Lamport timestamp of the request that committed this block
    timestamp: u64,
}

impl Block {
    /// Create a block on top of `previous_hash`, computing its hash
    pub fn new(transaction: Transaction, previous_hash: Option<String>, timestamp: u64) -> Self {
        let hash = Self::compute_hash(&transaction, previous_hash.as_deref());
        Self {
            transaction,
            previous_hash,
            hash,
            timestamp,
        }
    }

    /// Reassemble a block from received parts without recomputing the hash
    pub fn from_parts(
        transaction: Transaction,
        previous_hash: Option<String>,
        hash: String,
        timestamp: u64,
    ) -> Self {
        Self {
            transaction,
            previous_hash,
            hash,
            timestamp,
        }
    }

    /// SHA256(serialize(transaction) + previous_hash_or_empty), hex encoded
    pub fn compute_hash(transaction: &Transaction, previous_hash: Option<&str>) -> String {
        let mut hasher = Sha256::new();
        hasher.update(transaction.to_canonical_string().as_bytes());
        hasher.update(previous_hash.unwrap_or("").as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn transaction(&self) -> &Transaction {
        &self.transaction
    }

    pub fn previous_hash(&self) -> Option<&str> {
        self.previous_hash.as_deref()
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    /// Check that the stored hash matches the block contents
    pub fn has_valid_hash(&self) -> bool {
        Self::compute_hash(&self.transaction, self.previous_hash()) == self.hash
    }
}
