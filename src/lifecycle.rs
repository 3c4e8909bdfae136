//! Transaction lifecycle
//!
//! Tracks a transfer from creation through the send leg to local settlement,
//! and aggregates per-status counts and leg latencies for reporting.

use crate::types::{Leg, TimingSample, Transaction};
use serde::{Deserialize, Serialize};

/// Transaction status in the lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionStatus {
    /// Accounts are claimed, nothing has been sent yet
    Created,

    /// Funds left the origin on the ledger; the destination has not received them
    Sent,

    /// Both legs completed and local state is updated
    Settled,

    /// Stopped before anything was sent
    Abandoned,

    /// Stopped after the send leg; needs manual follow-up
    Failed,
}

impl TransactionStatus {
    /// Check if this is a terminal status
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Settled | TransactionStatus::Abandoned | TransactionStatus::Failed
        )
    }

    /// Check if this status indicates success
    pub fn is_successful(&self) -> bool {
        matches!(self, TransactionStatus::Settled)
    }

    /// Status a transaction ends in when a step fails
    pub fn after_failure(transaction: &Transaction) -> Self {
        if transaction.is_committed_on_ledger() {
            TransactionStatus::Failed
        } else {
            TransactionStatus::Abandoned
        }
    }
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionStatus::Created => write!(f, "Created"),
            TransactionStatus::Sent => write!(f, "Sent"),
            TransactionStatus::Settled => write!(f, "Settled"),
            TransactionStatus::Abandoned => write!(f, "Abandoned"),
            TransactionStatus::Failed => write!(f, "Failed"),
        }
    }
}

/// Lifecycle statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LifecycleStatistics {
    /// Total number of transactions
    pub total_count: usize,

    pub created_count: usize,
    pub sent_count: usize,
    pub settled_count: usize,
    pub abandoned_count: usize,
    pub failed_count: usize,

    /// Summed send-leg latency (milliseconds)
    pub total_send_latency_ms: u64,
    pub send_sample_count: usize,

    /// Summed receive-leg latency (milliseconds)
    pub total_receive_latency_ms: u64,
    pub receive_sample_count: usize,
}

impl LifecycleStatistics {
    /// Build statistics over transactions and their timing samples
    pub fn collect<'a>(
        transactions: impl IntoIterator<Item = &'a Transaction>,
        samples: impl IntoIterator<Item = &'a TimingSample>,
    ) -> Self {
        let mut stats = Self::default();

        for transaction in transactions {
            stats.total_count += 1;
            match transaction.status {
                TransactionStatus::Created => stats.created_count += 1,
                TransactionStatus::Sent => stats.sent_count += 1,
                TransactionStatus::Settled => stats.settled_count += 1,
                TransactionStatus::Abandoned => stats.abandoned_count += 1,
                TransactionStatus::Failed => stats.failed_count += 1,
            }
        }

        for sample in samples {
            match sample.leg {
                Leg::Send => {
                    stats.total_send_latency_ms += sample.latency_ms();
                    stats.send_sample_count += 1;
                }
                Leg::Receive => {
                    stats.total_receive_latency_ms += sample.latency_ms();
                    stats.receive_sample_count += 1;
                }
            }
        }

        stats
    }

    /// Get average send latency (milliseconds)
    pub fn average_send_latency_ms(&self) -> Option<f64> {
        if self.send_sample_count > 0 {
            Some(self.total_send_latency_ms as f64 / self.send_sample_count as f64)
        } else {
            None
        }
    }

    /// Get average receive latency (milliseconds)
    pub fn average_receive_latency_ms(&self) -> Option<f64> {
        if self.receive_sample_count > 0 {
            Some(self.total_receive_latency_ms as f64 / self.receive_sample_count as f64)
        } else {
            None
        }
    }

    /// Get success rate over terminal transactions (0.0 to 1.0)
    pub fn success_rate(&self) -> f64 {
        let finalized = self.settled_count + self.abandoned_count + self.failed_count;
        if finalized > 0 {
            self.settled_count as f64 / finalized as f64
        } else {
            0.0
        }
    }
}
