//! Read-only accessors over persisted transactions

use crate::lifecycle::LifecycleStatistics;
use crate::store::Store;
use crate::types::{AccountId, BatchId, Transaction, TransactionId};
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Default length of [`TransactionQuery::recent`] listings
pub const DEFAULT_RECENT_COUNT: usize = 25;

/// Which transactions a listing includes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionFilter {
    /// Exact batch match. Takes precedence over `enabled_only`.
    pub batch: Option<BatchId>,

    /// Only transactions whose origin and destination nodes are both
    /// currently enabled
    pub enabled_only: bool,
}

impl Default for TransactionFilter {
    fn default() -> Self {
        Self {
            batch: None,
            enabled_only: true,
        }
    }
}

impl TransactionFilter {
    /// Every transaction, regardless of node state
    pub fn all() -> Self {
        Self {
            batch: None,
            enabled_only: false,
        }
    }

    pub fn batch(batch: BatchId) -> Self {
        Self {
            batch: Some(batch),
            enabled_only: false,
        }
    }
}

/// Transaction query layer
pub struct TransactionQuery {
    store: Arc<dyn Store>,
}

impl TransactionQuery {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Look up one transaction. Absence is `Ok(None)`; more than one
    /// row under the id is a `DuplicateTransaction` error.
    pub fn get(&self, id: TransactionId) -> Result<Option<Transaction>> {
        let mut rows = self.store.transactions_with_id(id)?;
        match rows.len() {
            0 => Ok(None),
            1 => Ok(rows.pop()),
            _ => Err(Error::DuplicateTransaction(id)),
        }
    }

    /// Transactions matching `filter`, in insertion order
    pub fn list(&self, filter: TransactionFilter) -> Result<Vec<Transaction>> {
        let all = self.store.transactions()?;

        if let Some(batch) = filter.batch {
            return Ok(all.into_iter().filter(|t| t.batch == Some(batch)).collect());
        }
        if !filter.enabled_only {
            return Ok(all);
        }

        let mut enabled = HashMap::new();
        let mut selected = Vec::new();
        for transaction in all {
            if self.account_enabled(transaction.origin, &mut enabled)?
                && self.account_enabled(transaction.destination, &mut enabled)?
            {
                selected.push(transaction);
            }
        }
        Ok(selected)
    }

    /// The `count` most recently created transactions, newest first
    pub fn recent(&self, count: usize) -> Result<Vec<Transaction>> {
        let mut all = self.store.transactions()?;
        all.reverse();
        all.truncate(count);
        Ok(all)
    }

    /// Status counts and leg latencies over the transactions in `filter`
    pub fn statistics(&self, filter: TransactionFilter) -> Result<LifecycleStatistics> {
        let transactions = self.list(filter)?;

        let mut samples = Vec::new();
        for transaction in &transactions {
            samples.extend(self.store.timings(transaction.id)?);
        }

        let stats = LifecycleStatistics::collect(&transactions, &samples);
        debug!(
            "Statistics over {} transactions ({} timing samples)",
            stats.total_count,
            samples.len()
        );
        Ok(stats)
    }

    /// Whether the node owning `account` is enabled. Unknown rows count
    /// as disabled.
    fn account_enabled(&self, account: AccountId, cache: &mut HashMap<AccountId, bool>) -> Result<bool> {
        if let Some(enabled) = cache.get(&account) {
            return Ok(*enabled);
        }

        let enabled = match self.store.account(account)? {
            Some(account) => match self.store.wallet(account.wallet)? {
                Some(wallet) => self
                    .store
                    .node(wallet.node)?
                    .map(|node| node.enabled)
                    .unwrap_or(false),
                None => false,
            },
            None => false,
        };
        cache.insert(account, enabled);
        Ok(enabled)
    }
}
