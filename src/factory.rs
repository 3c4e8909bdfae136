//! Transaction factory
//!
//! Picks origin and destination accounts, claims them and persists a new
//! transaction before anything is sent to a node.

use crate::lock::AccountLock;
use crate::store::{AccountFilter, ClaimOutcome, Store};
use crate::types::{
    system_clock, Account, AccountId, Amount, BatchId, Clock, NodeId, Transaction, TransactionId,
    WalletId,
};
use crate::{Error, Result};
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info};

/// Smallest transfer: 10^20 raw
pub fn base_amount() -> Amount {
    Amount::from(10u32).pow(20)
}

/// Builds locked, unsent transactions
pub struct TransactionFactory {
    store: Arc<dyn Store>,
    lock: AccountLock,
    current_time_fn: Clock,
}

impl TransactionFactory {
    pub fn new(store: Arc<dyn Store>, lock: AccountLock) -> Self {
        Self {
            store,
            lock,
            current_time_fn: system_clock(),
        }
    }

    /// Set the current time function (for testing)
    pub fn with_time_fn(mut self, clock: Clock) -> Self {
        self.current_time_fn = clock;
        self
    }

    /// Base amount times a uniform integer in [1, 9]
    pub fn random_amount(&self) -> Amount {
        let factor: u32 = rand::thread_rng().gen_range(1..=9);
        base_amount() * Amount::from(factor)
    }

    /// Random origin, random destination on a different node, random amount
    pub fn create_random(&self, batch: Option<BatchId>) -> Result<Transaction> {
        self.check_batch(batch)?;

        let candidates = self.store.accounts(&self.free_accounts(None))?;
        if candidates.is_empty() {
            return Err(Error::NoAccounts { node: None });
        }

        let id = self.store.next_transaction_id()?;
        let origin = self
            .claim_any(candidates.clone(), id)?
            .ok_or(Error::NoAccounts { node: None })?;

        let nodes = self.wallet_nodes(&candidates)?;
        let origin_node = nodes.get(&origin.wallet).copied();
        let destinations: Vec<Account> = candidates
            .into_iter()
            .filter(|a| a.id != origin.id)
            .filter(|a| nodes.get(&a.wallet).copied() != origin_node)
            .collect();

        let destination = self.claim_destination(destinations, &origin, id, None)?;
        self.persist(id, origin, destination, self.random_amount(), batch)
    }

    /// Random origin on `origin_node`, random destination on `destination_node`
    pub fn create_between(
        &self,
        origin_node: NodeId,
        destination_node: NodeId,
        batch: Option<BatchId>,
    ) -> Result<Transaction> {
        self.check_batch(batch)?;

        let origin_url = self.node_url(origin_node)?;
        let destination_url = self.node_url(destination_node)?;

        let origins = self.store.accounts(&self.free_accounts(Some(origin_node)))?;
        let destinations = self
            .store
            .accounts(&self.free_accounts(Some(destination_node)))?;

        if origins.is_empty() {
            return Err(Error::NoAccounts {
                node: Some(origin_url),
            });
        }
        if destinations.is_empty() {
            return Err(Error::NoAccounts {
                node: Some(destination_url),
            });
        }

        let id = self.store.next_transaction_id()?;
        let origin = self.claim_any(origins, id)?.ok_or_else(|| Error::NoAccounts {
            node: Some(origin_url),
        })?;

        // Both nodes may hold the same address; never send to ourselves
        let destinations: Vec<Account> = destinations
            .into_iter()
            .filter(|a| a.id != origin.id && a.address != origin.address)
            .collect();

        let destination =
            self.claim_destination(destinations, &origin, id, Some(destination_url))?;
        self.persist(id, origin, destination, self.random_amount(), batch)
    }

    /// Transaction between two given accounts
    pub fn create(
        &self,
        origin: &Account,
        destination: &Account,
        amount: Amount,
        batch: Option<BatchId>,
    ) -> Result<Transaction> {
        if origin.id == destination.id || origin.address == destination.address {
            return Err(Error::InvalidState(format!(
                "origin and destination are the same address {}",
                origin.address
            )));
        }
        self.check_batch(batch)?;

        let id = self.store.next_transaction_id()?;
        self.claim_exact(origin.id, id)?;
        if let Err(e) = self.claim_exact(destination.id, id) {
            self.give_back(origin, id);
            return Err(e);
        }
        self.persist(id, origin.clone(), destination.clone(), amount, batch)
    }

    fn free_accounts(&self, node: Option<NodeId>) -> AccountFilter {
        AccountFilter {
            node,
            unclaimed_at: Some((self.current_time_fn)()),
            enabled_only: true,
        }
    }

    fn check_batch(&self, batch: Option<BatchId>) -> Result<()> {
        match batch {
            Some(id) if self.store.batch(id)?.is_none() => {
                Err(Error::NotFound(format!("batch {}", id)))
            }
            _ => Ok(()),
        }
    }

    fn node_url(&self, id: NodeId) -> Result<String> {
        self.store
            .node(id)?
            .map(|node| node.url)
            .ok_or_else(|| Error::NotFound(format!("node {}", id)))
    }

    fn wallet_nodes(&self, accounts: &[Account]) -> Result<HashMap<WalletId, NodeId>> {
        let mut nodes = HashMap::new();
        for account in accounts {
            if nodes.contains_key(&account.wallet) {
                continue;
            }
            if let Some(wallet) = self.store.wallet(account.wallet)? {
                nodes.insert(wallet.id, wallet.node);
            }
        }
        Ok(nodes)
    }

    /// Claim a uniformly random account among those still claimable
    fn claim_any(&self, mut candidates: Vec<Account>, holder: TransactionId) -> Result<Option<Account>> {
        candidates.shuffle(&mut rand::thread_rng());
        for candidate in candidates {
            match self.lock.claim(candidate.id, holder)? {
                ClaimOutcome::Claimed => return Ok(Some(candidate)),
                ClaimOutcome::AlreadyClaimed { .. } => {
                    debug!("Account {} taken concurrently, trying next", candidate.address)
                }
            }
        }
        Ok(None)
    }

    /// Claim a destination, giving the origin back if none can be had
    fn claim_destination(
        &self,
        candidates: Vec<Account>,
        origin: &Account,
        holder: TransactionId,
        node: Option<String>,
    ) -> Result<Account> {
        let claimed = if candidates.is_empty() {
            Ok(None)
        } else {
            self.claim_any(candidates, holder)
        };

        match claimed {
            Ok(Some(destination)) => Ok(destination),
            Ok(None) => {
                self.give_back(origin, holder);
                Err(Error::NoAccounts { node })
            }
            Err(e) => {
                self.give_back(origin, holder);
                Err(e)
            }
        }
    }

    /// Release an origin on a failure path. The original error wins; a
    /// failed release is only logged and the claim lapses with its TTL.
    fn give_back(&self, origin: &Account, holder: TransactionId) {
        if let Err(e) = self.lock.release(origin.id, holder) {
            error!(
                "Failed to release account {} for transaction {}: {}",
                origin.address, holder, e
            );
        }
    }

    fn claim_exact(&self, account: AccountId, holder: TransactionId) -> Result<()> {
        match self.lock.claim(account, holder)? {
            ClaimOutcome::Claimed => Ok(()),
            ClaimOutcome::AlreadyClaimed { holder: current } => Err(Error::AccountClaimed {
                account,
                holder: current,
            }),
        }
    }

    fn persist(
        &self,
        id: TransactionId,
        origin: Account,
        destination: Account,
        amount: Amount,
        batch: Option<BatchId>,
    ) -> Result<Transaction> {
        let transaction = Transaction::new(
            id,
            origin.id,
            destination.id,
            amount,
            batch,
            (self.current_time_fn)(),
        );

        if let Err(e) = self.store.save_transaction(&transaction) {
            self.lock.release_pair(&transaction);
            return Err(e);
        }

        info!(
            "Created transaction {}: {} -> {} ({} raw)",
            transaction.id, origin.address, destination.address, transaction.amount
        );
        Ok(transaction)
    }
}
