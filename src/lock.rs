//! Account lock
//!
//! Exclusive, expiring claims on accounts. The claim record on the account
//! row is the only source of truth; acquiring it is a single atomic
//! compare-and-set in the store, so two transactions can never both hold
//! the same account while the claim is live.

use crate::coordinator::CoordinatorConfig;
use crate::store::{ClaimOutcome, ReleaseOutcome, Store};
use crate::types::{system_clock, AccountClaim, AccountId, Clock, Transaction, TransactionId};
use crate::Result;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Default claim lifetime
pub const DEFAULT_CLAIM_TTL_MS: u64 = 60_000;

/// Claims and releases accounts on behalf of transactions
#[derive(Clone)]
pub struct AccountLock {
    store: Arc<dyn Store>,
    ttl_ms: u64,
    clock: Clock,
}

impl AccountLock {
    pub fn new(store: Arc<dyn Store>, ttl_ms: u64) -> Self {
        Self {
            store,
            ttl_ms,
            clock: system_clock(),
        }
    }

    /// Lock whose claims last `claim_ttl_ms` from the coordinator section
    pub fn from_config(store: Arc<dyn Store>, config: &CoordinatorConfig) -> Self {
        Self::new(store, config.claim_ttl_ms)
    }

    /// Set the clock (for testing)
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn ttl_ms(&self) -> u64 {
        self.ttl_ms
    }

    /// Try to take the account for `holder`
    pub fn claim(&self, account: AccountId, holder: TransactionId) -> Result<ClaimOutcome> {
        let now = (self.clock)();
        let outcome = self
            .store
            .try_claim(account, AccountClaim::new(holder, now, self.ttl_ms), now)?;

        if let ClaimOutcome::AlreadyClaimed { holder: current } = outcome {
            debug!(
                "Account {} not claimed for transaction {}: held by {}",
                account, holder, current
            );
        }
        Ok(outcome)
    }

    /// Give the account back
    pub fn release(&self, account: AccountId, holder: TransactionId) -> Result<()> {
        match self.store.release(account, holder)? {
            ReleaseOutcome::Released => debug!("Account {} released by {}", account, holder),
            ReleaseOutcome::NotHeld => warn!(
                "Account {} was not held by transaction {} at release",
                account, holder
            ),
        }
        Ok(())
    }

    /// Release both ends of a transaction. Both releases are always
    /// attempted; failures are logged.
    pub fn release_pair(&self, transaction: &Transaction) {
        for account in [transaction.origin, transaction.destination] {
            if let Err(e) = self.release(account, transaction.id) {
                error!(
                    "Failed to release account {} for transaction {}: {}",
                    account, transaction.id, e
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::Amount;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn setup() -> (Arc<MemoryStore>, AccountId, AccountId) {
        let store = Arc::new(MemoryStore::new());
        let node = store.add_node("http://a", true);
        let wallet = store.add_wallet(node.id, "W");
        let a = store.add_account(wallet.id, "xrb_a", Amount::from(1u32), None);
        let b = store.add_account(wallet.id, "xrb_b", Amount::from(1u32), None);
        (store, a.id, b.id)
    }

    #[test]
    fn test_claim_and_release() {
        let (store, a, _) = setup();
        let lock = AccountLock::new(store.clone(), DEFAULT_CLAIM_TTL_MS);

        assert_eq!(lock.claim(a, TransactionId(1)).unwrap(), ClaimOutcome::Claimed);
        assert!(matches!(
            lock.claim(a, TransactionId(2)).unwrap(),
            ClaimOutcome::AlreadyClaimed { .. }
        ));

        lock.release(a, TransactionId(1)).unwrap();
        assert_eq!(lock.claim(a, TransactionId(2)).unwrap(), ClaimOutcome::Claimed);
    }

    #[test]
    fn test_claim_expires_after_ttl() {
        let (store, a, _) = setup();
        let now = Arc::new(AtomicU64::new(0));
        let clock_now = now.clone();
        let lock = AccountLock::new(store.clone(), DEFAULT_CLAIM_TTL_MS)
            .with_clock(Arc::new(move || clock_now.load(Ordering::SeqCst)));

        lock.claim(a, TransactionId(1)).unwrap();

        now.store(59_999, Ordering::SeqCst);
        assert!(matches!(
            lock.claim(a, TransactionId(2)).unwrap(),
            ClaimOutcome::AlreadyClaimed { .. }
        ));

        now.store(60_000, Ordering::SeqCst);
        assert_eq!(lock.claim(a, TransactionId(2)).unwrap(), ClaimOutcome::Claimed);
    }

    #[test]
    fn test_configured_ttl_decides_expiry() {
        let (store, a, _) = setup();
        let now = Arc::new(AtomicU64::new(0));
        let clock_now = now.clone();
        let config = CoordinatorConfig {
            claim_ttl_ms: 1_000,
            ..Default::default()
        };
        let lock = AccountLock::from_config(store.clone(), &config)
            .with_clock(Arc::new(move || clock_now.load(Ordering::SeqCst)));
        assert_eq!(lock.ttl_ms(), 1_000);

        lock.claim(a, TransactionId(1)).unwrap();

        now.store(999, Ordering::SeqCst);
        assert!(matches!(
            lock.claim(a, TransactionId(2)).unwrap(),
            ClaimOutcome::AlreadyClaimed { .. }
        ));

        now.store(1_000, Ordering::SeqCst);
        assert_eq!(lock.claim(a, TransactionId(2)).unwrap(), ClaimOutcome::Claimed);
    }

    #[test]
    fn test_release_pair_releases_both_even_if_one_missing() {
        let (store, a, b) = setup();
        let lock = AccountLock::new(store.clone(), DEFAULT_CLAIM_TTL_MS);

        lock.claim(a, TransactionId(3)).unwrap();
        lock.claim(b, TransactionId(3)).unwrap();

        // Origin points at a row that does not exist; destination must still be released
        let tx = Transaction::new(TransactionId(3), AccountId(999), b, Amount::from(1u32), None, 0);
        lock.release_pair(&tx);
        assert!(store.account(b).unwrap().unwrap().claim.is_none());
        assert!(store.account(a).unwrap().unwrap().claim.is_some());
    }
}
