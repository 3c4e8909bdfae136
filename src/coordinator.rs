//! Transaction coordinator
//!
//! Drives one transaction through balance reconciliation, the send leg,
//! propagation polling and the receive leg, keeping cached balances and
//! work tokens in step with the ledger. Both accounts are released on
//! every exit path once the outcome has been recorded.

use crate::effects::{SideEffect, SideEffectSender};
use crate::lifecycle::TransactionStatus;
use crate::lock::{AccountLock, DEFAULT_CLAIM_TTL_MS};
use crate::rpc::{NodeConnector, NodeRpc};
use crate::store::{ClaimOutcome, Store};
use crate::types::{
    system_clock, Account, AccountId, BlockHash, Clock, Leg, Side, TimingSample, Transaction,
    Wallet,
};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Pause between propagation polls (milliseconds)
    pub poll_interval_ms: u64,

    /// Propagation polls before giving up
    pub max_poll_attempts: u32,

    /// Lifetime of an account claim (milliseconds)
    pub claim_ttl_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 250,
            max_poll_attempts: 120,
            claim_ttl_ms: DEFAULT_CLAIM_TTL_MS,
        }
    }
}

/// One end of a transfer with everything needed to talk to its node
struct Party {
    account: Account,
    wallet: Wallet,
    rpc: Arc<dyn NodeRpc>,
}

/// Transaction coordinator
pub struct TransactionCoordinator {
    /// Configuration
    config: CoordinatorConfig,

    store: Arc<dyn Store>,

    nodes: Arc<dyn NodeConnector>,

    lock: AccountLock,

    /// Work regeneration and timing capture
    effects: SideEffectSender,

    current_time_fn: Clock,
}

impl TransactionCoordinator {
    /// Create a new transaction coordinator
    pub fn new(
        config: CoordinatorConfig,
        store: Arc<dyn Store>,
        nodes: Arc<dyn NodeConnector>,
        lock: AccountLock,
        effects: SideEffectSender,
    ) -> Self {
        Self {
            config,
            store,
            nodes,
            lock,
            effects,
            current_time_fn: system_clock(),
        }
    }

    /// Set the current time function (for testing)
    pub fn with_time_fn(mut self, clock: Clock) -> Self {
        self.current_time_fn = clock;
        self
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Execute a freshly created transaction on the ledger.
    ///
    /// Returns the settled transaction. Whatever happens, the origin and
    /// destination claims held by this transaction are released before
    /// returning.
    pub async fn send(&self, mut transaction: Transaction) -> Result<Transaction> {
        info!("Sending transaction {}", transaction.id);

        if transaction.status != TransactionStatus::Created {
            // Someone else owns this record's history; leave it untouched
            self.lock.release_pair(&transaction);
            return Err(Error::InvalidState(format!(
                "transaction {} is {}, expected Created",
                transaction.id, transaction.status
            )));
        }

        let outcome = self.drive(&mut transaction).await;
        self.conclude(transaction, outcome)
    }

    /// Finish a transaction whose send leg already landed on the ledger,
    /// e.g. after a worker restart. The send call is never repeated.
    pub async fn resume(&self, mut transaction: Transaction) -> Result<Transaction> {
        let hash = match (&transaction.status, &transaction.hash_sending) {
            (TransactionStatus::Sent, Some(hash)) => hash.clone(),
            _ => {
                return Err(Error::InvalidState(format!(
                    "transaction {} is {} and cannot be resumed",
                    transaction.id, transaction.status
                )))
            }
        };

        self.reclaim(&transaction)?;
        info!("Resuming transaction {} after send {}", transaction.id, hash);

        let outcome = self.resume_inner(&mut transaction, &hash).await;
        self.conclude(transaction, outcome)
    }

    async fn resume_inner(&self, transaction: &mut Transaction, hash: &str) -> Result<()> {
        let origin = self.party(transaction.origin)?;
        let mut destination = self.party(transaction.destination)?;
        self.settle(transaction, &origin, &mut destination, hash).await
    }

    /// Take both accounts back under this transaction's id
    fn reclaim(&self, transaction: &Transaction) -> Result<()> {
        for account in [transaction.origin, transaction.destination] {
            let failure = match self.lock.claim(account, transaction.id) {
                Ok(ClaimOutcome::Claimed) => continue,
                Ok(ClaimOutcome::AlreadyClaimed { holder }) => {
                    Error::AccountClaimed { account, holder }
                }
                Err(e) => e,
            };
            self.lock.release_pair(transaction);
            return Err(failure);
        }
        Ok(())
    }

    /// Record the outcome, then release both accounts
    fn conclude(&self, mut transaction: Transaction, outcome: Result<()>) -> Result<Transaction> {
        let result = match outcome {
            Ok(()) => {
                info!(
                    "Transaction {} settled (send: {:?}, receive: {:?})",
                    transaction.id, transaction.hash_sending, transaction.hash_receiving
                );
                Ok(())
            }
            Err(e) => {
                if !transaction.status.is_terminal() {
                    transaction.status = TransactionStatus::after_failure(&transaction);
                    transaction.failure = Some(e.to_string());
                    if let Err(save_error) = self.store.save_transaction(&transaction) {
                        error!(
                            "Failed to record outcome of transaction {}: {}",
                            transaction.id, save_error
                        );
                    }
                }
                if transaction.status == TransactionStatus::Failed {
                    error!(
                        "Transaction {} failed after funds left the origin: {}",
                        transaction.id, e
                    );
                } else {
                    warn!("Transaction {} abandoned: {}", transaction.id, e);
                }
                Err(e)
            }
        };

        self.lock.release_pair(&transaction);
        result.map(|()| transaction)
    }

    fn party(&self, id: AccountId) -> Result<Party> {
        let account = self
            .store
            .account(id)?
            .ok_or_else(|| Error::NotFound(format!("account {}", id)))?;
        let wallet = self
            .store
            .wallet(account.wallet)?
            .ok_or_else(|| Error::NotFound(format!("wallet {}", account.wallet)))?;
        let node = self
            .store
            .node(wallet.node)?
            .ok_or_else(|| Error::NotFound(format!("node {}", wallet.node)))?;
        let rpc = self.nodes.connect(&node)?;
        Ok(Party {
            account,
            wallet,
            rpc,
        })
    }

    async fn drive(&self, transaction: &mut Transaction) -> Result<()> {
        let mut origin = self.party(transaction.origin)?;
        let mut destination = self.party(transaction.destination)?;

        self.reconcile_balance(transaction, &mut origin).await?;
        self.verify_membership(&origin, Side::Origin).await?;
        self.verify_membership(&destination, Side::Destination).await?;
        let work = self.require_work(transaction, &origin).await?;

        let hash = self
            .send_leg(transaction, &mut origin, &mut destination, work)
            .await?;

        self.settle(transaction, &origin, &mut destination, &hash).await
    }

    /// The cached balance must match the node's before anything is sent
    async fn reconcile_balance(&self, transaction: &Transaction, origin: &mut Party) -> Result<()> {
        let live = origin.rpc.balance(&origin.account.address).await?;

        if live != origin.account.current_balance {
            let cached = std::mem::replace(&mut origin.account.current_balance, live.clone());
            self.store.save_account(&origin.account)?;
            return Err(Error::BalanceMismatch {
                address: origin.account.address.clone(),
                actual: live,
                cached,
            });
        }

        if live <= transaction.amount {
            return Err(Error::InsufficientFunds {
                address: origin.account.address.clone(),
                balance: live,
                amount: transaction.amount.clone(),
            });
        }
        Ok(())
    }

    async fn verify_membership(&self, party: &Party, side: Side) -> Result<()> {
        let contained = party
            .rpc
            .wallet_contains(&party.wallet.remote_id, &party.account.address)
            .await?;
        if !contained {
            return Err(Error::AddressNotInWallet {
                side,
                address: party.account.address.clone(),
                wallet: party.wallet.remote_id.clone(),
            });
        }
        Ok(())
    }

    /// The origin needs pre-generated work. Without it, ask for some and
    /// give up on this transaction.
    async fn require_work(&self, transaction: &Transaction, origin: &Party) -> Result<String> {
        // An empty token is as good as none
        if let Some(work) = origin.account.work.as_deref().filter(|w| !w.is_empty()) {
            return Ok(work.to_string());
        }

        match origin.rpc.frontier(&origin.account.address).await {
            Ok(frontier) => {
                info!("Requesting work during send for {}", origin.account.address);
                self.effects.submit(SideEffect::RegenerateWork {
                    address: origin.account.address.clone(),
                    frontier,
                });
            }
            Err(e) => error!(
                "Could not look up frontier of {} for work regeneration: {}",
                origin.account.address, e
            ),
        }

        warn!(
            "Transaction origin work is missing, transaction.id: {}",
            transaction.id
        );
        Err(Error::InvalidPow {
            address: origin.account.address.clone(),
        })
    }

    /// Issue the send. On success funds have irrevocably left the origin.
    async fn send_leg(
        &self,
        transaction: &mut Transaction,
        origin: &mut Party,
        destination: &mut Party,
        work: String,
    ) -> Result<BlockHash> {
        let started = (self.current_time_fn)();
        transaction.start_send_timestamp = Some(started);

        let hash = origin
            .rpc
            .send(
                &origin.wallet.remote_id,
                &origin.account.address,
                &destination.account.address,
                &transaction.amount,
                &work,
                &transaction.id.to_string(),
            )
            .await?;

        transaction.hash_sending = Some(hash.clone());
        transaction.status = TransactionStatus::Sent;
        origin.account.current_balance -= &transaction.amount;
        destination.account.current_balance += &transaction.amount;
        origin.account.work = None;

        self.record_timing(transaction, Leg::Send, &hash, started);

        self.store.save_account(&origin.account)?;
        self.store.save_account(&destination.account)?;
        self.store.save_transaction(transaction)?;

        debug!("Transaction {} sent as block {}", transaction.id, hash);
        Ok(hash)
    }

    /// Wait for the block at the destination, receive it and finalize
    async fn settle(
        &self,
        transaction: &mut Transaction,
        origin: &Party,
        destination: &mut Party,
        hash: &str,
    ) -> Result<()> {
        let block = self.await_incoming(transaction, origin, destination, hash).await?;

        let started = (self.current_time_fn)();
        transaction.start_receive_timestamp = Some(started);

        let received = destination
            .rpc
            .receive(
                &destination.wallet.remote_id,
                &destination.account.address,
                &block,
                destination.account.work.as_deref(),
            )
            .await?;

        transaction.hash_receiving = Some(received.clone());
        self.record_timing(transaction, Leg::Receive, &received, started);

        transaction.status = TransactionStatus::Settled;
        destination.account.work = None;
        self.store.save_account(&destination.account)?;
        self.store.save_transaction(transaction)?;

        self.effects.submit(SideEffect::RegenerateWork {
            address: origin.account.address.clone(),
            frontier: hash.to_string(),
        });
        self.effects.submit(SideEffect::RegenerateWork {
            address: destination.account.address.clone(),
            frontier: received,
        });
        Ok(())
    }

    /// Poll until exactly one block waits at the destination
    async fn await_incoming(
        &self,
        transaction: &Transaction,
        origin: &Party,
        destination: &mut Party,
        hash: &str,
    ) -> Result<BlockHash> {
        let interval = Duration::from_millis(self.config.poll_interval_ms);
        let address = destination.account.address.clone();
        let mut incoming = Vec::new();

        for attempt in 1..=self.config.max_poll_attempts {
            origin.rpc.republish(hash).await?;
            destination.rpc.search_pending_all().await?;
            incoming = destination.rpc.pending(&address).await?;

            if !incoming.is_empty() {
                debug!(
                    "Transaction {}: {} incoming block(s) after {} poll(s)",
                    transaction.id,
                    incoming.len(),
                    attempt
                );
                break;
            }
            if attempt < self.config.max_poll_attempts {
                tokio::time::sleep(interval).await;
            }
        }

        // The destination's work no longer matches its frontier once the
        // node accepts the block on its own
        match incoming.len() {
            1 => Ok(incoming.remove(0)),
            0 => {
                destination.account.work = None;
                self.store.save_account(&destination.account)?;
                error!("No incoming blocks, transaction.id: {}", transaction.id);
                Err(Error::NoIncomingBlocks { address })
            }
            count => {
                destination.account.work = None;
                self.store.save_account(&destination.account)?;
                Err(Error::TooManyIncomingBlocks { address, count })
            }
        }
    }

    fn record_timing(&self, transaction: &Transaction, leg: Leg, block: &str, started: u64) {
        self.effects.submit(SideEffect::RecordTiming(TimingSample {
            transaction_id: transaction.id,
            leg,
            block: block.to_string(),
            started_at_ms: started,
            completed_at_ms: (self.current_time_fn)(),
        }));
    }
}
