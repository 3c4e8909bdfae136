//! Transaction workers
//!
//! A worker pairs a [`TransactionFactory`] with a [`TransactionCoordinator`]
//! and runs transfers one after another. Several workers may run at once;
//! they coordinate only through the shared store and account claims.

use crate::coordinator::TransactionCoordinator;
use crate::factory::TransactionFactory;
use crate::types::{BatchId, NodeId, Transaction};
use crate::{Error, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How a worker chooses the two accounts of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pairing {
    /// Any free origin, and a destination on another node
    Random,
    /// Origin on one node, destination on another
    Nodes { origin: NodeId, destination: NodeId },
}

/// Outcome of a run of transfers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub settled: usize,

    /// Failed transfers keyed by [`Error::kind`]
    pub failures: BTreeMap<&'static str, usize>,
}

impl BatchReport {
    pub fn attempted(&self) -> usize {
        self.settled + self.failed()
    }

    pub fn failed(&self) -> usize {
        self.failures.values().sum()
    }

    pub fn record(&mut self, outcome: &Result<Transaction>) {
        match outcome {
            Ok(_) => self.settled += 1,
            Err(e) => *self.failures.entry(e.kind()).or_insert(0) += 1,
        }
    }

    /// Fold another report into this one
    pub fn merge(&mut self, other: BatchReport) {
        self.settled += other.settled;
        for (kind, count) in other.failures {
            *self.failures.entry(kind).or_insert(0) += count;
        }
    }
}

/// Creates transactions and drives them to completion
pub struct TransactionWorker {
    factory: TransactionFactory,
    coordinator: TransactionCoordinator,
}

impl TransactionWorker {
    pub fn new(factory: TransactionFactory, coordinator: TransactionCoordinator) -> Self {
        Self {
            factory,
            coordinator,
        }
    }

    pub fn factory(&self) -> &TransactionFactory {
        &self.factory
    }

    pub fn coordinator(&self) -> &TransactionCoordinator {
        &self.coordinator
    }

    /// Create one transaction and send it
    pub async fn run_one(&self, pairing: Pairing, batch: Option<BatchId>) -> Result<Transaction> {
        let transaction = match pairing {
            Pairing::Random => self.factory.create_random(batch)?,
            Pairing::Nodes {
                origin,
                destination,
            } => self.factory.create_between(origin, destination, batch)?,
        };
        self.coordinator.send(transaction).await
    }

    /// Run `count` transfers one after another. Individual failures are
    /// counted, never fatal.
    pub async fn run_batch(
        &self,
        pairing: Pairing,
        batch: Option<BatchId>,
        count: usize,
    ) -> BatchReport {
        let mut report = BatchReport::default();

        for _ in 0..count {
            let outcome = self.run_one(pairing, batch).await;
            if let Err(e) = &outcome {
                debug!("Transfer failed ({}): {}", e.kind(), e);
            }
            report.record(&outcome);
        }

        info!(
            "Batch finished: {} settled, {} failed",
            report.settled,
            report.failed()
        );
        report
    }
}

/// Start `workers` concurrent tasks, each running `per_worker` transfers.
/// Resolves to the combined report.
pub fn spawn_workers(
    worker: Arc<TransactionWorker>,
    workers: usize,
    pairing: Pairing,
    batch: Option<BatchId>,
    per_worker: usize,
) -> JoinHandle<Result<BatchReport>> {
    let handles: Vec<JoinHandle<BatchReport>> = (0..workers)
        .map(|_| {
            let worker = worker.clone();
            tokio::spawn(async move { worker.run_batch(pairing, batch, per_worker).await })
        })
        .collect();

    tokio::spawn(async move {
        let mut combined = BatchReport::default();
        let mut failed = Vec::new();
        // Join every task before reporting so none is left detached
        for handle in handles {
            match handle.await {
                Ok(report) => combined.merge(report),
                Err(e) => {
                    warn!("Worker task ended abnormally: {}", e);
                    failed.push(e.to_string());
                }
            }
        }
        if failed.is_empty() {
            Ok(combined)
        } else {
            Err(Error::Internal(format!(
                "{} worker task(s) failed after {} transfers completed: {}",
                failed.len(),
                combined.attempted(),
                failed.join("; ")
            )))
        }
    })
}
