//! Checkpoint coordinator
//!
//! ```text
//! CheckpointStart (forced, marked)
//!   ├─ every transaction restates changes logged before the mark
//!   ├─ persistent stores flush
//! CheckpointEnd (forced)
//! truncate: the mark becomes the log start
//! ```
//!
//! While the flag on the environment is up, commits tell stores that
//! their change belongs to the checkpoint in progress. The coordinator is
//! serialized by its own lock; transactions keep running throughout.

use crate::registry::StoreRegistry;
use objmgr_concurrency::TransactionEnv;
use objmgr_core::{LogSequenceNumber, Result};
use objmgr_durability::LogRecord;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Cumulative checkpoint counters.
///
/// These accumulate over the lifetime of the object manager and are never
/// reset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckpointCounters {
    /// Checkpoints completed
    pub completed: u64,
    /// Checkpoints that failed part way
    pub failed: u64,
    /// Transactions restated across all checkpoints
    pub transactions_restated: u64,
    /// Transactions backed out because the log stayed too full
    pub forced_backouts: u64,
}

/// What one checkpoint did.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CheckpointOutcome {
    /// Sequence number of the `CheckpointStart` record
    pub start: LogSequenceNumber,
    /// Transactions asked to restate their changes
    pub transactions: usize,
    /// Log occupancy once the log was truncated
    pub occupancy: f64,
    /// Whether the largest persistent transaction was backed out
    pub backed_out_largest: bool,
}

pub(crate) struct Checkpointer {
    threshold: f64,
    running: Mutex<()>,
    completed: AtomicU64,
    failed: AtomicU64,
    restated: AtomicU64,
    forced_backouts: AtomicU64,
}

impl Checkpointer {
    pub(crate) fn new(threshold: f64) -> Self {
        Checkpointer {
            threshold,
            running: Mutex::new(()),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            restated: AtomicU64::new(0),
            forced_backouts: AtomicU64::new(0),
        }
    }

    pub(crate) fn counters(&self) -> CheckpointCounters {
        CheckpointCounters {
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            transactions_restated: self.restated.load(Ordering::Relaxed),
            forced_backouts: self.forced_backouts.load(Ordering::Relaxed),
        }
    }

    /// Take a checkpoint.
    pub(crate) fn run(
        &self,
        env: &Arc<TransactionEnv>,
        stores: &StoreRegistry,
    ) -> Result<CheckpointOutcome> {
        let _running = self.running.lock();
        let result = self.take(env, stores);
        env.set_checkpoint_starting(false);
        match &result {
            Ok(_) => {
                self.completed.fetch_add(1, Ordering::Relaxed);
            }
            Err(error) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                warn!(target: "objmgr::checkpoint", %error, "Checkpoint failed");
            }
        }
        result
    }

    fn take(&self, env: &Arc<TransactionEnv>, stores: &StoreRegistry) -> Result<CheckpointOutcome> {
        let log = env.log();
        env.set_checkpoint_starting(true);
        let start = log.mark_and_write_next(&LogRecord::CheckpointStart, 0, false, true)?;
        debug!(target: "objmgr::checkpoint", start, "Checkpoint started");

        let transactions = env.transactions();
        for txn in &transactions {
            txn.set_requires_checkpoint();
        }
        for txn in &transactions {
            txn.checkpoint(start)?;
        }
        self.restated
            .fetch_add(transactions.len() as u64, Ordering::Relaxed);

        stores.flush_persistent()?;
        env.set_checkpoint_starting(false);

        log.write_next(&LogRecord::CheckpointEnd, 0, false, true)?;
        log.truncate()?;

        let mut occupancy = log.occupancy();
        let mut backed_out_largest = false;
        if occupancy > self.threshold {
            if let Some(largest) = env.largest_persistent() {
                warn!(
                    target: "objmgr::checkpoint",
                    txn = largest.id(),
                    occupancy,
                    threshold = self.threshold,
                    "Log too full after checkpoint, backing out largest transaction"
                );
                largest.backout(false)?;
                self.forced_backouts.fetch_add(1, Ordering::Relaxed);
                backed_out_largest = true;
                occupancy = log.occupancy();
            }
        }

        info!(
            target: "objmgr::checkpoint",
            start,
            transactions = transactions.len(),
            occupancy,
            "Checkpoint completed"
        );
        Ok(CheckpointOutcome {
            start,
            transactions: transactions.len(),
            occupancy,
            backed_out_largest,
        })
    }
}
