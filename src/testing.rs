//! Test doubles: an in-memory ledger shared by several mock nodes, a
//! recording work provider and a ready-made two-node fixture.

use crate::effects::{SideEffectConfig, SideEffectSender, SideEffectWorker, WorkError, WorkProvider};
use crate::rpc::{NodeConnector, NodeRpc, RpcError};
use crate::store::{AccountFilter, ClaimOutcome, MemoryStore, ReleaseOutcome, Store};
use crate::types::{
    Account, AccountClaim, AccountId, Amount, Batch, BatchId, BlockHash, Node, NodeId,
    TimingSample, Transaction, TransactionId, Wallet, WalletId,
};
use crate::Error;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// 10^20 raw
pub(crate) fn units(n: u32) -> Amount {
    Amount::from(n) * Amount::from(10u32).pow(20)
}

/// How the ledger answers `pending` queries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PendingMode {
    /// Report real pending blocks
    Normal,
    /// Report nothing for the first `n` queries, then real blocks
    Delayed(u32),
    /// Never report anything
    Withheld,
    /// Report every real block plus a phantom one
    Duplicated,
}

struct PendingBlock {
    hash: BlockHash,
    amount: Amount,
}

struct LedgerState {
    balances: HashMap<String, Amount>,
    reported_balances: HashMap<String, Amount>,
    pending: HashMap<String, Vec<PendingBlock>>,
    sends_by_id: HashMap<String, BlockHash>,
    frontiers: HashMap<String, BlockHash>,
    pending_mode: PendingMode,
    failing: HashSet<&'static str>,
    calls: HashMap<&'static str, usize>,
    send_ids: Vec<String>,
    next_block: u64,
}

/// Ledger shared by every mock node
pub(crate) struct MockLedger {
    state: Mutex<LedgerState>,
}

impl MockLedger {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(LedgerState {
                balances: HashMap::new(),
                reported_balances: HashMap::new(),
                pending: HashMap::new(),
                sends_by_id: HashMap::new(),
                frontiers: HashMap::new(),
                pending_mode: PendingMode::Normal,
                failing: HashSet::new(),
                calls: HashMap::new(),
                send_ids: Vec::new(),
                next_block: 1,
            }),
        })
    }

    fn state(&self) -> std::sync::MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap()
    }

    pub(crate) fn set_balance(&self, address: &str, amount: Amount) {
        self.state().balances.insert(address.to_string(), amount);
    }

    pub(crate) fn balance_of(&self, address: &str) -> Amount {
        self.state().balances.get(address).cloned().unwrap_or_default()
    }

    /// Make `balance` report something other than the real balance
    pub(crate) fn report_balance(&self, address: &str, amount: Amount) {
        self.state().reported_balances.insert(address.to_string(), amount);
    }

    pub(crate) fn set_frontier(&self, address: &str, hash: &str) {
        self.state().frontiers.insert(address.to_string(), hash.to_string());
    }

    pub(crate) fn set_pending_mode(&self, mode: PendingMode) {
        self.state().pending_mode = mode;
    }

    pub(crate) fn fail(&self, method: &'static str) {
        self.state().failing.insert(method);
    }

    pub(crate) fn heal(&self, method: &'static str) {
        self.state().failing.remove(method);
    }

    pub(crate) fn calls(&self, method: &str) -> usize {
        self.state().calls.get(method).copied().unwrap_or(0)
    }

    pub(crate) fn send_ids(&self) -> Vec<String> {
        self.state().send_ids.clone()
    }

    pub(crate) fn pending_count(&self, address: &str) -> usize {
        self.state().pending.get(address).map(|p| p.len()).unwrap_or(0)
    }

    fn enter(&self, method: &'static str) -> Result<std::sync::MutexGuard<'_, LedgerState>, RpcError> {
        let mut state = self.state();
        *state.calls.entry(method).or_insert(0) += 1;
        if state.failing.contains(method) {
            return Err(RpcError::Node {
                method: method.to_string(),
                message: "injected failure".to_string(),
            });
        }
        Ok(state)
    }
}

impl LedgerState {
    fn block_hash(&mut self) -> BlockHash {
        let hash = format!("{:064X}", self.next_block);
        self.next_block += 1;
        hash
    }
}

/// One node's view of the shared ledger
pub(crate) struct MockNode {
    ledger: Arc<MockLedger>,
    wallets: Mutex<HashMap<String, HashSet<String>>>,
}

impl MockNode {
    pub(crate) fn new(ledger: Arc<MockLedger>) -> Arc<Self> {
        Arc::new(Self {
            ledger,
            wallets: Mutex::new(HashMap::new()),
        })
    }

    pub(crate) fn add_to_wallet(&self, wallet: &str, address: &str) {
        self.wallets
            .lock()
            .unwrap()
            .entry(wallet.to_string())
            .or_default()
            .insert(address.to_string());
    }

    pub(crate) fn remove_from_wallet(&self, wallet: &str, address: &str) {
        if let Some(set) = self.wallets.lock().unwrap().get_mut(wallet) {
            set.remove(address);
        }
    }
}

#[async_trait]
impl NodeRpc for MockNode {
    async fn balance(&self, address: &str) -> Result<Amount, RpcError> {
        let state = self.ledger.enter("balance")?;
        Ok(state
            .reported_balances
            .get(address)
            .or_else(|| state.balances.get(address))
            .cloned()
            .unwrap_or_default())
    }

    async fn wallet_contains(&self, wallet: &str, address: &str) -> Result<bool, RpcError> {
        drop(self.ledger.enter("wallet_contains")?);
        Ok(self
            .wallets
            .lock()
            .unwrap()
            .get(wallet)
            .map(|set| set.contains(address))
            .unwrap_or(false))
    }

    async fn frontier(&self, address: &str) -> Result<BlockHash, RpcError> {
        let state = self.ledger.enter("frontier")?;
        state.frontiers.get(address).cloned().ok_or_else(|| RpcError::Node {
            method: "frontier".to_string(),
            message: "Account not found".to_string(),
        })
    }

    async fn send(
        &self,
        _wallet: &str,
        source: &str,
        destination: &str,
        amount: &Amount,
        work: &str,
        id: &str,
    ) -> Result<BlockHash, RpcError> {
        let mut state = self.ledger.enter("send")?;
        state.send_ids.push(id.to_string());

        if let Some(hash) = state.sends_by_id.get(id) {
            return Ok(hash.clone());
        }
        if work.is_empty() {
            return Err(RpcError::Node {
                method: "send".to_string(),
                message: "Invalid work".to_string(),
            });
        }
        let balance = state.balances.get(source).cloned().unwrap_or_default();
        if &balance < amount {
            return Err(RpcError::Node {
                method: "send".to_string(),
                message: "Insufficient balance".to_string(),
            });
        }

        state.balances.insert(source.to_string(), balance - amount);
        let hash = state.block_hash();
        state.frontiers.insert(source.to_string(), hash.clone());
        state
            .pending
            .entry(destination.to_string())
            .or_default()
            .push(PendingBlock {
                hash: hash.clone(),
                amount: amount.clone(),
            });
        state.sends_by_id.insert(id.to_string(), hash.clone());
        Ok(hash)
    }

    async fn republish(&self, _hash: &str) -> Result<(), RpcError> {
        drop(self.ledger.enter("republish")?);
        Ok(())
    }

    async fn search_pending_all(&self) -> Result<(), RpcError> {
        drop(self.ledger.enter("search_pending_all")?);
        Ok(())
    }

    async fn pending(&self, address: &str) -> Result<Vec<BlockHash>, RpcError> {
        let mut state = self.ledger.enter("pending")?;
        let real: Vec<BlockHash> = state
            .pending
            .get(address)
            .map(|blocks| blocks.iter().map(|b| b.hash.clone()).collect())
            .unwrap_or_default();

        let mode = state.pending_mode;
        match mode {
            PendingMode::Normal => Ok(real),
            PendingMode::Delayed(0) => {
                state.pending_mode = PendingMode::Normal;
                Ok(real)
            }
            PendingMode::Delayed(n) => {
                state.pending_mode = PendingMode::Delayed(n - 1);
                Ok(Vec::new())
            }
            PendingMode::Withheld => Ok(Vec::new()),
            PendingMode::Duplicated => {
                let mut blocks = real;
                blocks.push(format!("{:064X}", u64::MAX));
                Ok(blocks)
            }
        }
    }

    async fn receive(
        &self,
        _wallet: &str,
        address: &str,
        block: &str,
        _work: Option<&str>,
    ) -> Result<BlockHash, RpcError> {
        let mut state = self.ledger.enter("receive")?;
        let blocks = state.pending.entry(address.to_string()).or_default();
        let position = blocks
            .iter()
            .position(|b| b.hash == block)
            .ok_or_else(|| RpcError::Node {
                method: "receive".to_string(),
                message: "Block not found".to_string(),
            })?;
        let received = blocks.remove(position);

        let balance = state.balances.get(address).cloned().unwrap_or_default();
        state
            .balances
            .insert(address.to_string(), balance + received.amount);
        let hash = state.block_hash();
        state.frontiers.insert(address.to_string(), hash.clone());
        Ok(hash)
    }
}

/// Connector resolving node URLs to mock nodes
#[derive(Default)]
pub(crate) struct MockConnector {
    nodes: Mutex<HashMap<String, Arc<MockNode>>>,
}

impl MockConnector {
    pub(crate) fn register(&self, url: &str, node: Arc<MockNode>) {
        self.nodes.lock().unwrap().insert(url.to_string(), node);
    }
}

impl NodeConnector for MockConnector {
    fn connect(&self, node: &Node) -> Result<Arc<dyn NodeRpc>, RpcError> {
        let nodes = self.nodes.lock().unwrap();
        let mock: Arc<dyn NodeRpc> = nodes.get(&node.url).cloned().ok_or_else(|| RpcError::Transport {
            url: node.url.clone(),
            reason: "connection refused".to_string(),
        })?;
        Ok(mock)
    }
}

/// Work provider that records requests and can fail a number of times first
#[derive(Default)]
pub(crate) struct RecordingWorkProvider {
    requests: Mutex<Vec<(String, String)>>,
    failures_left: AtomicU64,
    attempts: AtomicU64,
}

impl RecordingWorkProvider {
    pub(crate) fn failing(times: u64) -> Self {
        Self {
            failures_left: AtomicU64::new(times),
            ..Default::default()
        }
    }

    pub(crate) fn requests(&self) -> Vec<(String, String)> {
        self.requests.lock().unwrap().clone()
    }

    pub(crate) fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorkProvider for RecordingWorkProvider {
    async fn enqueue(&self, address: &str, frontier: &str) -> Result<(), WorkError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(WorkError {
                address: address.to_string(),
                reason: "queue unavailable".to_string(),
            });
        }
        self.requests
            .lock()
            .unwrap()
            .push((address.to_string(), frontier.to_string()));
        Ok(())
    }
}

/// Memory store with switchable faults
#[derive(Default)]
pub(crate) struct FaultyStore {
    pub inner: MemoryStore,
    /// Every transaction row comes back twice from `transactions_with_id`
    pub duplicate_rows: AtomicBool,
    /// `release` fails without touching the claim
    pub fail_release: AtomicBool,
}

impl Store for FaultyStore {
    fn node(&self, id: NodeId) -> crate::Result<Option<Node>> {
        self.inner.node(id)
    }
    fn save_node(&self, node: &Node) -> crate::Result<()> {
        self.inner.save_node(node)
    }
    fn wallet(&self, id: WalletId) -> crate::Result<Option<Wallet>> {
        self.inner.wallet(id)
    }
    fn save_wallet(&self, wallet: &Wallet) -> crate::Result<()> {
        self.inner.save_wallet(wallet)
    }
    fn account(&self, id: AccountId) -> crate::Result<Option<Account>> {
        self.inner.account(id)
    }
    fn save_account(&self, account: &Account) -> crate::Result<()> {
        self.inner.save_account(account)
    }
    fn accounts(&self, filter: &AccountFilter) -> crate::Result<Vec<Account>> {
        self.inner.accounts(filter)
    }
    fn try_claim(&self, id: AccountId, claim: AccountClaim, now_ms: u64) -> crate::Result<ClaimOutcome> {
        self.inner.try_claim(id, claim, now_ms)
    }
    fn release(&self, id: AccountId, holder: TransactionId) -> crate::Result<ReleaseOutcome> {
        if self.fail_release.load(Ordering::SeqCst) {
            return Err(Error::Internal(format!("release of account {} refused", id)));
        }
        self.inner.release(id, holder)
    }
    fn create_batch(&self, label: &str, now_ms: u64) -> crate::Result<Batch> {
        self.inner.create_batch(label, now_ms)
    }
    fn batch(&self, id: BatchId) -> crate::Result<Option<Batch>> {
        self.inner.batch(id)
    }
    fn next_transaction_id(&self) -> crate::Result<TransactionId> {
        self.inner.next_transaction_id()
    }
    fn save_transaction(&self, transaction: &Transaction) -> crate::Result<()> {
        self.inner.save_transaction(transaction)
    }
    fn transactions_with_id(&self, id: TransactionId) -> crate::Result<Vec<Transaction>> {
        let rows = self.inner.transactions_with_id(id)?;
        if self.duplicate_rows.load(Ordering::SeqCst) {
            return Ok(rows.iter().chain(rows.iter()).cloned().collect());
        }
        Ok(rows)
    }
    fn transactions(&self) -> crate::Result<Vec<Transaction>> {
        self.inner.transactions()
    }
    fn save_timing(&self, sample: &TimingSample) -> crate::Result<()> {
        self.inner.save_timing(sample)
    }
    fn timings(&self, id: TransactionId) -> crate::Result<Vec<TimingSample>> {
        self.inner.timings(id)
    }
}

/// Two enabled nodes with one wallet each, shared ledger and side-effect queue
pub(crate) struct Fixture {
    pub store: Arc<MemoryStore>,
    pub ledger: Arc<MockLedger>,
    pub connector: Arc<MockConnector>,
    pub work: Arc<RecordingWorkProvider>,
    pub effects: SideEffectSender,
    pub effect_worker: SideEffectWorker,
    pub node_a: Node,
    pub node_b: Node,
    pub wallet_a: Wallet,
    pub wallet_b: Wallet,
    pub mock_a: Arc<MockNode>,
    pub mock_b: Arc<MockNode>,
}

impl Fixture {
    pub(crate) fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let ledger = MockLedger::new();
        let connector = Arc::new(MockConnector::default());
        let work = Arc::new(RecordingWorkProvider::default());

        let node_a = store.add_node("http://node-a:7076", true);
        let node_b = store.add_node("http://node-b:7076", true);
        let wallet_a = store.add_wallet(node_a.id, "WALLET_A");
        let wallet_b = store.add_wallet(node_b.id, "WALLET_B");

        let mock_a = MockNode::new(ledger.clone());
        let mock_b = MockNode::new(ledger.clone());
        connector.register(&node_a.url, mock_a.clone());
        connector.register(&node_b.url, mock_b.clone());

        let store_dyn: Arc<dyn Store> = store.clone();
        let (effects, effect_worker) =
            SideEffectWorker::channel(SideEffectConfig::default(), work.clone(), store_dyn);

        Self {
            store,
            ledger,
            connector,
            work,
            effects,
            effect_worker,
            node_a,
            node_b,
            wallet_a,
            wallet_b,
            mock_a,
            mock_b,
        }
    }

    /// Account on node A, registered in the store, the wallet and the ledger
    pub(crate) fn account_a(&self, address: &str, balance: Amount, work: Option<&str>) -> Account {
        self.account(&self.wallet_a, &self.mock_a, address, balance, work)
    }

    /// Account on node B
    pub(crate) fn account_b(&self, address: &str, balance: Amount, work: Option<&str>) -> Account {
        self.account(&self.wallet_b, &self.mock_b, address, balance, work)
    }

    fn account(
        &self,
        wallet: &Wallet,
        mock: &MockNode,
        address: &str,
        balance: Amount,
        work: Option<&str>,
    ) -> Account {
        mock.add_to_wallet(&wallet.remote_id, address);
        self.ledger.set_balance(address, balance.clone());
        self.ledger
            .set_frontier(address, &format!("FRONTIER_{}", address.to_uppercase()));
        self.store
            .add_account(wallet.id, address, balance, work.map(str::to_string))
    }
}
