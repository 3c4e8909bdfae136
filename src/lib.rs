//! # Ledger Speedtest Coordinator
//!
//! Times value transfers between independently operated ledger nodes and
//! drives each transfer from account selection to settlement.
//!
//! This crate provides:
//! - Exclusive, expiring account claims shared by concurrent workers
//! - A thin client for the node operations a transfer needs
//! - Transaction creation with random or node-constrained pairing
//! - The send, propagate and receive protocol with balance reconciliation
//! - Read-only transaction queries and latency statistics

#![warn(missing_docs, rust_2018_idioms)]
#![forbid(unsafe_code)]
#![allow(missing_docs)] // Internal implementation details

mod config;
mod coordinator;
mod effects;
mod error;
mod factory;
mod lifecycle;
mod lock;
mod query;
mod rpc;
mod store;
mod types;
mod worker;

#[cfg(test)]
mod testing;

pub use config::{RpcConfig, SpeedtestConfig};
pub use coordinator::{CoordinatorConfig, TransactionCoordinator};
pub use effects::{
    SideEffect, SideEffectConfig, SideEffectSender, SideEffectStats, SideEffectWorker, WorkError,
    WorkProvider,
};
pub use error::{Error, Result};
pub use factory::{base_amount, TransactionFactory};
pub use lifecycle::{LifecycleStatistics, TransactionStatus};
pub use lock::{AccountLock, DEFAULT_CLAIM_TTL_MS};
pub use query::{TransactionFilter, TransactionQuery, DEFAULT_RECENT_COUNT};
pub use rpc::{HttpConnector, HttpNodeClient, NodeConnector, NodeRpc, RpcError};
pub use store::{AccountFilter, ClaimOutcome, MemoryStore, ReleaseOutcome, Store};
pub use types::{
    now_millis, system_clock, Account, AccountClaim, AccountId, Amount, Batch, BatchId,
    BlockHash, Clock, Leg, Node, NodeId, Side, TimingSample, Transaction, TransactionId, Wallet,
    WalletId,
};
pub use worker::{spawn_workers, BatchReport, Pairing, TransactionWorker};
