// Transaction model
//
// A transfer of money between two clients. The canonical string form is
// what the block hash is computed over, so it must stay deterministic.

use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a client holding a balance
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClientId(String);

impl ClientId {
    /// Create a client ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the ID as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ClientId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Unique identifier of a transaction
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionId([u8; 16]);

impl TransactionId {
    /// Generate a random transaction ID
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// An immutable money transfer
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    sender: ClientId,
    receiver: ClientId,
    amount: Decimal,
    /// Wall-clock creation time in unix milliseconds
    timestamp: i64,
    id: TransactionId,
}

impl Transaction {
    /// Create a new transaction stamped with the current time and a fresh ID
    pub fn new(sender: ClientId, receiver: ClientId, amount: Decimal) -> Self {
        Self::from_parts(
            sender,
            receiver,
            amount,
            Utc::now().timestamp_millis(),
            TransactionId::generate(),
        )
    }

    /// Create a transaction from explicit parts
    pub fn from_parts(
        sender: ClientId,
        receiver: ClientId,
        amount: Decimal,
        timestamp: i64,
        id: TransactionId,
    ) -> Self {
        Self {
            sender,
            receiver,
            amount,
            timestamp,
            id,
        }
    }

    pub fn sender(&self) -> &ClientId {
        &self.sender
    }

    pub fn receiver(&self) -> &ClientId {
        &self.receiver
    }

    pub fn amount(&self) -> Decimal {
        self.amount
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn id(&self) -> &TransactionId {
        &self.id
    }

    /// Deterministic text form used as block hash input.
    /// Trailing zeros of the amount are dropped so 5 and 5.00 hash alike.
    /// Client names are length-prefixed since they may contain the delimiters.
    pub fn to_canonical_string(&self) -> String {
        format!(
            "<{}:{},{}:{},{},{},{}>",
            self.sender.as_str().len(),
            self.sender,
            self.receiver.as_str().len(),
            self.receiver,
            self.amount.normalize(),
            self.timestamp,
            self.id
        )
    }
}

impl fmt::Display for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}: {}", self.sender, self.receiver, self.amount)
    }
}
