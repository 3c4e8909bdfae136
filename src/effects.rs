//! Side effects of a transfer that must not decide its outcome
//!
//! Work-token regeneration and timing capture are queued on a channel and
//! applied by a [`SideEffectWorker`] with bounded retries. Their failures
//! show up in logs and in [`SideEffectStats`], never in the transaction.

use crate::store::Store;
use crate::types::{BlockHash, TimingSample};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Proof-of-work service error
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("work request for {address} failed: {reason}")]
pub struct WorkError {
    pub address: String,
    pub reason: String,
}

/// External proof-of-work generator. The produced token is written back to
/// the account record by the generator itself.
#[async_trait]
pub trait WorkProvider: Send + Sync {
    async fn enqueue(&self, address: &str, frontier: &str) -> Result<(), WorkError>;
}

/// Work deferred out of the transfer protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SideEffect {
    /// Ask for a fresh work token on top of `frontier`
    RegenerateWork { address: String, frontier: BlockHash },
    /// Persist how long one leg took
    RecordTiming(TimingSample),
}

impl SideEffect {
    fn describe(&self) -> String {
        match self {
            SideEffect::RegenerateWork { address, .. } => format!("work regeneration for {}", address),
            SideEffect::RecordTiming(sample) => format!(
                "{} timing for transaction {}",
                sample.leg, sample.transaction_id
            ),
        }
    }
}

/// Retry policy for side effects
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SideEffectConfig {
    /// Attempts per effect, including the first
    pub max_attempts: u32,
    /// Delay before the first retry; doubles on every further retry
    pub backoff_ms: u64,
}

impl Default for SideEffectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 500,
        }
    }
}

/// Counters for applied side effects
#[derive(Debug, Default)]
pub struct SideEffectStats {
    applied: AtomicU64,
    retried: AtomicU64,
    dropped: AtomicU64,
}

impl SideEffectStats {
    pub fn applied(&self) -> u64 {
        self.applied.load(Ordering::Relaxed)
    }

    pub fn retried(&self) -> u64 {
        self.retried.load(Ordering::Relaxed)
    }

    /// Effects given up on after the last attempt
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Producer half handed to the coordinator
#[derive(Clone)]
pub struct SideEffectSender {
    tx: mpsc::UnboundedSender<SideEffect>,
}

impl SideEffectSender {
    /// Queue an effect. A closed queue is logged and otherwise ignored.
    pub fn submit(&self, effect: SideEffect) {
        let description = effect.describe();
        if let Err(e) = self.tx.send(effect) {
            error!("Dropping {}: side effect queue closed ({})", description, e);
        }
    }
}

/// Consumer half: applies queued effects
pub struct SideEffectWorker {
    rx: mpsc::UnboundedReceiver<SideEffect>,
    applier: Applier,
}

struct Applier {
    config: SideEffectConfig,
    work: Arc<dyn WorkProvider>,
    store: Arc<dyn Store>,
    stats: Arc<SideEffectStats>,
}

impl SideEffectWorker {
    /// Create the queue and its worker
    pub fn channel(
        config: SideEffectConfig,
        work: Arc<dyn WorkProvider>,
        store: Arc<dyn Store>,
    ) -> (SideEffectSender, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = Self {
            rx,
            applier: Applier {
                config,
                work,
                store,
                stats: Arc::new(SideEffectStats::default()),
            },
        };
        (SideEffectSender { tx }, worker)
    }

    pub fn stats(&self) -> Arc<SideEffectStats> {
        self.applier.stats.clone()
    }

    /// Apply everything currently queued without waiting for more
    pub async fn drain_pending(&mut self) -> usize {
        let mut count = 0;
        while let Ok(effect) = self.rx.try_recv() {
            self.applier.apply_with_retry(effect).await;
            count += 1;
        }
        if count > 0 {
            debug!("Applied {} queued side effects", count);
        }
        count
    }

    /// Run until every sender is dropped
    pub async fn run(self) {
        let Self { mut rx, applier } = self;
        while let Some(effect) = rx.recv().await {
            applier.apply_with_retry(effect).await;
        }
        info!(
            "Side effect worker stopped (applied: {}, dropped: {})",
            applier.stats.applied(),
            applier.stats.dropped()
        );
    }

    /// Start the worker as a background task
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}

impl Applier {
    async fn apply_with_retry(&self, effect: SideEffect) {
        let attempts = self.config.max_attempts.max(1);
        let mut delay = Duration::from_millis(self.config.backoff_ms);

        for attempt in 1..=attempts {
            match self.apply(&effect).await {
                Ok(()) => {
                    self.stats.applied.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(reason) if attempt < attempts => {
                    warn!(
                        "{} failed (attempt {}/{}): {}",
                        effect.describe(),
                        attempt,
                        attempts,
                        reason
                    );
                    self.stats.retried.fetch_add(1, Ordering::Relaxed);
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                }
                Err(reason) => {
                    error!(
                        "Giving up on {} after {} attempts: {}",
                        effect.describe(),
                        attempts,
                        reason
                    );
                    self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    async fn apply(&self, effect: &SideEffect) -> Result<(), String> {
        match effect {
            SideEffect::RegenerateWork { address, frontier } => self
                .work
                .enqueue(address, frontier)
                .await
                .map_err(|e| e.to_string()),
            SideEffect::RecordTiming(sample) => {
                self.store.save_timing(sample).map_err(|e| e.to_string())
            }
        }
    }
}
