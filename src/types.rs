//! Records shared by every component: nodes, wallets, accounts, batches and
//! transactions, plus the id newtypes and the millisecond clock.

use crate::lifecycle::TransactionStatus;
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Ledger amount in the smallest unit (raw)
pub type Amount = BigUint;

/// Block hash as reported by a node
pub type BlockHash = String;

/// Millisecond clock, swappable in tests
pub type Clock = Arc<dyn Fn() -> u64 + Send + Sync>;

/// Current Unix time in milliseconds
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Clock backed by the system time
pub fn system_clock() -> Clock {
    Arc::new(now_millis)
}

macro_rules! record_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

record_id!(
    /// Node row id
    NodeId
);
record_id!(
    /// Wallet row id
    WalletId
);
record_id!(
    /// Account row id
    AccountId
);
record_id!(
    /// Batch row id
    BatchId
);
record_id!(
    /// Transaction row id, also the idempotency id of the send call
    TransactionId
);

/// Which end of a transfer something refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Origin,
    Destination,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Origin => write!(f, "origin"),
            Side::Destination => write!(f, "destination"),
        }
    }
}

/// Remote ledger endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub url: String,
    /// Disabled nodes contribute no accounts to new transactions
    pub enabled: bool,
}

/// Node-side grouping of addresses
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wallet {
    pub id: WalletId,
    pub node: NodeId,
    /// Wallet identifier passed to wallet-scoped RPC calls
    pub remote_id: String,
}

/// Exclusive hold on an account for the lifetime of one transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountClaim {
    pub holder: TransactionId,
    pub claimed_at_ms: u64,
    pub expires_at_ms: u64,
}

impl AccountClaim {
    pub fn new(holder: TransactionId, now_ms: u64, ttl_ms: u64) -> Self {
        Self {
            holder,
            claimed_at_ms: now_ms,
            expires_at_ms: now_ms.saturating_add(ttl_ms),
        }
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at_ms
    }
}

/// Ledger address held in one wallet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    pub wallet: WalletId,
    pub address: String,
    /// Cached balance; the node is authoritative
    pub current_balance: Amount,
    /// Pre-generated proof of work for the next block, consumed by it
    pub work: Option<String>,
    /// Only changed through [`crate::Store::try_claim`] and [`crate::Store::release`]
    pub claim: Option<AccountClaim>,
}

impl Account {
    pub fn new(id: AccountId, wallet: WalletId, address: impl Into<String>, balance: Amount) -> Self {
        Self {
            id,
            wallet,
            address: address.into(),
            current_balance: balance,
            work: None,
            claim: None,
        }
    }

    /// Whether a live claim is held on the account
    pub fn is_in_use(&self, now_ms: u64) -> bool {
        self.claim.map(|c| !c.is_expired(now_ms)).unwrap_or(false)
    }
}

/// Group of transactions belonging to one test run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    pub id: BatchId,
    pub label: String,
    pub created_at: u64,
}

/// One transfer attempt between two accounts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub origin: AccountId,
    pub destination: AccountId,
    pub amount: Amount,
    pub batch: Option<BatchId>,
    pub status: TransactionStatus,
    pub created_at: u64,
    /// Set right before the send call is issued (Unix ms)
    pub start_send_timestamp: Option<u64>,
    /// Set right before the receive call is issued (Unix ms)
    pub start_receive_timestamp: Option<u64>,
    pub hash_sending: Option<BlockHash>,
    pub hash_receiving: Option<BlockHash>,
    /// Error message of the step that ended the transaction
    pub failure: Option<String>,
}

impl Transaction {
    pub fn new(
        id: TransactionId,
        origin: AccountId,
        destination: AccountId,
        amount: Amount,
        batch: Option<BatchId>,
        created_at: u64,
    ) -> Self {
        Self {
            id,
            origin,
            destination,
            amount,
            batch,
            status: TransactionStatus::Created,
            created_at,
            start_send_timestamp: None,
            start_receive_timestamp: None,
            hash_sending: None,
            hash_receiving: None,
            failure: None,
        }
    }

    /// Funds have left the origin on the remote ledger
    pub fn is_committed_on_ledger(&self) -> bool {
        self.hash_sending.is_some()
    }
}

/// Transfer leg a timing sample belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Leg {
    Send,
    Receive,
}

impl fmt::Display for Leg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Leg::Send => write!(f, "send"),
            Leg::Receive => write!(f, "receive"),
        }
    }
}

/// Measured duration of one RPC leg
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimingSample {
    pub transaction_id: TransactionId,
    pub leg: Leg,
    pub block: BlockHash,
    pub started_at_ms: u64,
    pub completed_at_ms: u64,
}

impl TimingSample {
    pub fn latency_ms(&self) -> u64 {
        self.completed_at_ms.saturating_sub(self.started_at_ms)
    }
}
