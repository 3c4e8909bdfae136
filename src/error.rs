//! Error types for the transaction coordinator

use crate::rpc::RpcError;
use crate::types::{AccountId, Amount, Side, TransactionId};
use thiserror::Error;

/// Coordinator error type
#[derive(Error, Debug)]
pub enum Error {
    /// The node reports a different balance than the cached one.
    /// The cached value has already been corrected when this is returned.
    #[error("Balance mismatch for account {address}: node reports {actual}, cached {cached}")]
    BalanceMismatch {
        address: String,
        actual: Amount,
        cached: Amount,
    },

    /// The origin cannot cover the amount
    #[error("Account {address} holds {balance} raw, not enough to send {amount}")]
    InsufficientFunds {
        address: String,
        balance: Amount,
        amount: Amount,
    },

    /// An address is not part of the wallet it is registered under
    #[error("The {side} address {address} does not exist on wallet {wallet}")]
    AddressNotInWallet {
        side: Side,
        address: String,
        wallet: String,
    },

    /// The origin has no proof-of-work token yet
    #[error("The proof of work on account {address} is not valid")]
    InvalidPow { address: String },

    /// Nothing arrived at the destination before polling gave up
    #[error("There were no incoming blocks to receive for the account: {address}")]
    NoIncomingBlocks { address: String },

    /// More than one block is waiting at the destination
    #[error("There were {count} incoming blocks for the account: {address}")]
    TooManyIncomingBlocks { address: String, count: usize },

    /// No eligible accounts for the requested pairing
    #[error("The specified node ({}) does not have any accounts", node.as_deref().unwrap_or("NA"))]
    NoAccounts { node: Option<String> },

    /// Remote node communication failed
    #[error("RPC failure: {0}")]
    Rpc(#[from] RpcError),

    /// More than one transaction row matched a unique id
    #[error("Transaction already exists: {0}")]
    DuplicateTransaction(TransactionId),

    /// Record not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Account is held by another transaction
    #[error("Account {account} is claimed by transaction {holder}")]
    AccountClaimed {
        account: AccountId,
        holder: TransactionId,
    },

    /// Operation does not apply to the transaction's current status
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Configuration error
    #[error("Config error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Short stable label, used to bucket failures in reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::BalanceMismatch { .. } => "balance_mismatch",
            Error::InsufficientFunds { .. } => "insufficient_funds",
            Error::AddressNotInWallet { .. } => "address_not_in_wallet",
            Error::InvalidPow { .. } => "invalid_pow",
            Error::NoIncomingBlocks { .. } => "no_incoming_blocks",
            Error::TooManyIncomingBlocks { .. } => "too_many_incoming_blocks",
            Error::NoAccounts { .. } => "no_accounts",
            Error::Rpc(_) => "rpc_failure",
            Error::DuplicateTransaction(_) => "duplicate_transaction",
            Error::NotFound(_) => "not_found",
            Error::AccountClaimed { .. } => "account_claimed",
            Error::InvalidState(_) => "invalid_state",
            Error::Config(_) => "config",
            Error::Internal(_) => "internal",
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
