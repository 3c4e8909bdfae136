//! Persistence boundary
//!
//! Record-level accessors for nodes, wallets, accounts, batches, transactions
//! and timing samples. Account claims are only ever changed through the
//! atomic [`Store::try_claim`] / [`Store::release`] pair.

use crate::types::{
    Account, AccountClaim, AccountId, Amount, Batch, BatchId, Node, NodeId, TimingSample,
    Transaction, TransactionId, Wallet, WalletId,
};
use crate::{Error, Result};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Outcome of an atomic claim attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The caller now holds the account
    Claimed,
    /// A live claim by another transaction exists
    AlreadyClaimed { holder: TransactionId },
}

/// Outcome of releasing a claim
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    /// The claim was absent or held by someone else; nothing changed
    NotHeld,
}

/// Filter for account selection
#[derive(Debug, Clone, Default)]
pub struct AccountFilter {
    /// Only accounts whose wallet lives on this node
    pub node: Option<NodeId>,
    /// Only accounts without a live claim at this instant
    pub unclaimed_at: Option<u64>,
    /// Only accounts on enabled nodes
    pub enabled_only: bool,
}

/// Record storage used by every component
pub trait Store: Send + Sync {
    fn node(&self, id: NodeId) -> Result<Option<Node>>;
    fn save_node(&self, node: &Node) -> Result<()>;

    fn wallet(&self, id: WalletId) -> Result<Option<Wallet>>;
    fn save_wallet(&self, wallet: &Wallet) -> Result<()>;

    fn account(&self, id: AccountId) -> Result<Option<Account>>;
    /// Persist balance and work fields. Claim state is left untouched.
    fn save_account(&self, account: &Account) -> Result<()>;
    fn accounts(&self, filter: &AccountFilter) -> Result<Vec<Account>>;

    /// Compare-and-set on the account's claim. Succeeds when the account is
    /// unclaimed, its claim has expired, or `claim.holder` already holds it.
    fn try_claim(&self, id: AccountId, claim: AccountClaim, now_ms: u64) -> Result<ClaimOutcome>;
    /// Clear the claim if `holder` holds it.
    fn release(&self, id: AccountId, holder: TransactionId) -> Result<ReleaseOutcome>;

    fn create_batch(&self, label: &str, now_ms: u64) -> Result<Batch>;
    fn batch(&self, id: BatchId) -> Result<Option<Batch>>;

    fn next_transaction_id(&self) -> Result<TransactionId>;
    fn save_transaction(&self, transaction: &Transaction) -> Result<()>;
    /// Every row carrying `id`; more than one means the store is inconsistent.
    fn transactions_with_id(&self, id: TransactionId) -> Result<Vec<Transaction>>;
    /// All transactions in insertion order
    fn transactions(&self) -> Result<Vec<Transaction>>;

    fn save_timing(&self, sample: &TimingSample) -> Result<()>;
    fn timings(&self, id: TransactionId) -> Result<Vec<TimingSample>>;
}

/// In-process store backed by concurrent maps
pub struct MemoryStore {
    nodes: DashMap<NodeId, Node>,
    wallets: DashMap<WalletId, Wallet>,
    accounts: DashMap<AccountId, Account>,
    batches: DashMap<BatchId, Batch>,
    transactions: DashMap<TransactionId, Transaction>,
    timings: DashMap<TransactionId, Vec<TimingSample>>,
    next_id: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            nodes: DashMap::new(),
            wallets: DashMap::new(),
            accounts: DashMap::new(),
            batches: DashMap::new(),
            transactions: DashMap::new(),
            timings: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    fn allocate(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Register a node
    pub fn add_node(&self, url: impl Into<String>, enabled: bool) -> Node {
        let node = Node {
            id: NodeId(self.allocate()),
            url: url.into(),
            enabled,
        };
        self.nodes.insert(node.id, node.clone());
        node
    }

    /// Register a wallet on a node
    pub fn add_wallet(&self, node: NodeId, remote_id: impl Into<String>) -> Wallet {
        let wallet = Wallet {
            id: WalletId(self.allocate()),
            node,
            remote_id: remote_id.into(),
        };
        self.wallets.insert(wallet.id, wallet.clone());
        wallet
    }

    /// Register an account in a wallet
    pub fn add_account(
        &self,
        wallet: WalletId,
        address: impl Into<String>,
        balance: Amount,
        work: Option<String>,
    ) -> Account {
        let mut account = Account::new(AccountId(self.allocate()), wallet, address, balance);
        account.work = work;
        self.accounts.insert(account.id, account.clone());
        account
    }

    fn node_of(&self, account: &Account) -> Option<Node> {
        let wallet = self.wallets.get(&account.wallet)?;
        self.nodes.get(&wallet.node).map(|n| n.clone())
    }
}

impl Store for MemoryStore {
    fn node(&self, id: NodeId) -> Result<Option<Node>> {
        Ok(self.nodes.get(&id).map(|n| n.clone()))
    }

    fn save_node(&self, node: &Node) -> Result<()> {
        self.nodes.insert(node.id, node.clone());
        Ok(())
    }

    fn wallet(&self, id: WalletId) -> Result<Option<Wallet>> {
        Ok(self.wallets.get(&id).map(|w| w.clone()))
    }

    fn save_wallet(&self, wallet: &Wallet) -> Result<()> {
        self.wallets.insert(wallet.id, wallet.clone());
        Ok(())
    }

    fn account(&self, id: AccountId) -> Result<Option<Account>> {
        Ok(self.accounts.get(&id).map(|a| a.clone()))
    }

    fn save_account(&self, account: &Account) -> Result<()> {
        match self.accounts.get_mut(&account.id) {
            Some(mut stored) => {
                let claim = stored.claim;
                *stored = account.clone();
                stored.claim = claim;
            }
            None => {
                let mut fresh = account.clone();
                fresh.claim = None;
                self.accounts.insert(fresh.id, fresh);
            }
        }
        Ok(())
    }

    fn accounts(&self, filter: &AccountFilter) -> Result<Vec<Account>> {
        let mut selected: Vec<Account> = self
            .accounts
            .iter()
            .map(|entry| entry.value().clone())
            .filter(|account| match filter.unclaimed_at {
                Some(now) => !account.is_in_use(now),
                None => true,
            })
            .filter(|account| {
                if filter.node.is_none() && !filter.enabled_only {
                    return true;
                }
                match self.node_of(account) {
                    Some(node) => {
                        filter.node.map(|id| id == node.id).unwrap_or(true)
                            && (!filter.enabled_only || node.enabled)
                    }
                    None => false,
                }
            })
            .collect();
        selected.sort_by_key(|a| a.id);
        Ok(selected)
    }

    fn try_claim(&self, id: AccountId, claim: AccountClaim, now_ms: u64) -> Result<ClaimOutcome> {
        // The entry guard holds the shard lock for the whole read-modify-write
        let mut account = self
            .accounts
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("account {}", id)))?;

        if let Some(existing) = account.claim {
            if !existing.is_expired(now_ms) && existing.holder != claim.holder {
                return Ok(ClaimOutcome::AlreadyClaimed {
                    holder: existing.holder,
                });
            }
        }

        account.claim = Some(claim);
        debug!("Account {} claimed by transaction {}", id, claim.holder);
        Ok(ClaimOutcome::Claimed)
    }

    fn release(&self, id: AccountId, holder: TransactionId) -> Result<ReleaseOutcome> {
        let mut account = self
            .accounts
            .get_mut(&id)
            .ok_or_else(|| Error::NotFound(format!("account {}", id)))?;

        match account.claim {
            Some(existing) if existing.holder == holder => {
                account.claim = None;
                Ok(ReleaseOutcome::Released)
            }
            _ => Ok(ReleaseOutcome::NotHeld),
        }
    }

    fn create_batch(&self, label: &str, now_ms: u64) -> Result<Batch> {
        let batch = Batch {
            id: BatchId(self.allocate()),
            label: label.to_string(),
            created_at: now_ms,
        };
        self.batches.insert(batch.id, batch.clone());
        Ok(batch)
    }

    fn batch(&self, id: BatchId) -> Result<Option<Batch>> {
        Ok(self.batches.get(&id).map(|b| b.clone()))
    }

    fn next_transaction_id(&self) -> Result<TransactionId> {
        Ok(TransactionId(self.allocate()))
    }

    fn save_transaction(&self, transaction: &Transaction) -> Result<()> {
        self.transactions.insert(transaction.id, transaction.clone());
        Ok(())
    }

    fn transactions_with_id(&self, id: TransactionId) -> Result<Vec<Transaction>> {
        Ok(self.transactions.get(&id).map(|t| t.clone()).into_iter().collect())
    }

    fn transactions(&self) -> Result<Vec<Transaction>> {
        // Ids are allocated monotonically, so id order is insertion order
        let mut all: Vec<Transaction> = self
            .transactions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        all.sort_by_key(|t| t.id);
        Ok(all)
    }

    fn save_timing(&self, sample: &TimingSample) -> Result<()> {
        self.timings
            .entry(sample.transaction_id)
            .or_default()
            .push(sample.clone());
        Ok(())
    }

    fn timings(&self, id: TransactionId) -> Result<Vec<TimingSample>> {
        Ok(self.timings.get(&id).map(|t| t.clone()).unwrap_or_default())
    }
}
