//! Warm start replay
//!
//! ```text
//! Log (from the last complete checkpoint)
//!   CheckpointStart
//!   CheckpointTransaction(luw 7) ─┐
//!   Add(luw 9)                    ├─ redo into stand-in transactions
//!   Commit(luw 9)   ──────────────┼─ commit: stores change
//!   Replace(luw 7)                │
//!   CheckpointEnd                 │
//!   ...                           │
//! End of data ─────────────────── ┘ luw 7 has no outcome: orphan
//! ```
//!
//! Every unit of work seen in the log gets a stand-in transaction, created
//! against a [`NullLog`](objmgr_durability::NullLog) environment so replay
//! writes nothing. Terminal records complete their unit as they are met.
//! Whatever is left at the end of the log is resolved: a unit that had
//! started committing is committed, everything else is backed out, a
//! prepared unit included.

use crate::registry::StoreRegistry;
use objmgr_concurrency::{InternalTransaction, TransactionCallback, TransactionEnv};
use objmgr_core::{LogSequenceNumber, LogicalUnitOfWork, Result, TokenId};
use objmgr_durability::{FileLogReader, LogRecord, ReadStopReason};
use rustc_hash::FxHashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Receiver of user-defined log records during replay.
pub trait UserRecordHandler: Send + Sync {
    /// Replay one record written by
    /// [`ObjectManager::write_user_record`](crate::ObjectManager::write_user_record).
    fn replay(&self, payload: &[u8]) -> Result<()>;
}

/// What a warm start found in the log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryStats {
    /// Records read from the last complete checkpoint on
    pub records_replayed: u64,
    /// Records before the checkpoint that were skipped
    pub records_skipped: u64,
    /// Distinct units of work with changes in the log
    pub units_seen: u64,
    /// Units committed, by their commit record or at resolution
    pub committed: u64,
    /// Units backed out, by their backout record or at resolution
    pub backed_out: u64,
    /// Units with no outcome in the log
    pub orphans: u64,
    /// Orphans that had been prepared
    pub in_doubt: u64,
    /// User-defined records handed to the handler
    pub user_records: u64,
    /// Why the log scan ended
    pub stop_reason: Option<ReadStopReason>,
}

/// Replay state for one warm start.
struct Replay<'a> {
    env: &'a Arc<TransactionEnv>,
    stores: &'a StoreRegistry,
    handler: Option<&'a dyn UserRecordHandler>,
    units: FxHashMap<u64, Arc<InternalTransaction>>,
    sequence: LogSequenceNumber,
    stats: RecoveryStats,
}

impl<'a> Replay<'a> {
    /// Stand-in for `unit`, created on first sight.
    fn unit(&mut self, unit: &LogicalUnitOfWork) -> Result<Arc<InternalTransaction>> {
        if let Some(txn) = self.units.get(&unit.id) {
            return Ok(Arc::clone(txn));
        }
        self.env.observe_unit(unit.id);
        let txn = self.env.begin_internal()?;
        txn.adopt_unit(unit.clone());
        self.units.insert(unit.id, Arc::clone(&txn));
        self.stats.units_seen += 1;
        Ok(txn)
    }

    fn apply(&mut self, record: LogRecord) -> Result<()> {
        self.sequence += 1;
        let lsn = self.sequence;
        let stores = self.stores;
        let resolve = |id: TokenId| stores.resolve(id);

        match record {
            LogRecord::UserDefined { payload } => {
                if let Some(handler) = self.handler {
                    handler.replay(&payload)?;
                    self.stats.user_records += 1;
                }
            }
            LogRecord::Add { unit, object, .. } => {
                let token = resolve(object.token)?;
                self.unit(&unit)?.redo_add(&token, object.payload, lsn)?;
            }
            LogRecord::Replace { unit, object, .. } => {
                let token = resolve(object.token)?;
                self.unit(&unit)?.redo_replace(&token, object.payload, lsn)?;
            }
            LogRecord::Delete { unit, token, .. } => {
                let token = resolve(token)?;
                self.unit(&unit)?.redo_delete(&token, lsn)?;
            }
            LogRecord::OptimisticReplace { unit, batch, .. } => {
                self.unit(&unit)?
                    .redo_optimistic_replace(&batch, lsn, resolve)?;
            }
            LogRecord::CheckpointTransaction {
                unit,
                state,
                checkpoint,
            } => {
                self.unit(&unit)?
                    .redo_checkpoint(state, &checkpoint, lsn, resolve)?;
            }
            LogRecord::Prepare { unit, .. } => {
                // Nothing persistent was logged for a unit not seen yet
                if let Some(txn) = self.units.get(&unit.id) {
                    if !txn.state().is_prepared() {
                        txn.prepare()?;
                    }
                }
            }
            LogRecord::Commit { unit, .. } => {
                if let Some(txn) = self.units.remove(&unit.id) {
                    txn.commit(false)?;
                    self.stats.committed += 1;
                }
            }
            LogRecord::Backout { unit, .. } => {
                if let Some(txn) = self.units.remove(&unit.id) {
                    txn.backout(false)?;
                    self.stats.backed_out += 1;
                }
            }
            LogRecord::CheckpointStart | LogRecord::CheckpointEnd | LogRecord::Padding { .. } => {}
        }
        Ok(())
    }

    /// Finish every unit of work the log left without an outcome.
    fn resolve_orphans(&mut self, callback: Option<&Arc<dyn TransactionCallback>>) -> Result<()> {
        let mut orphans: Vec<_> = self.units.drain().collect();
        orphans.sort_by_key(|(unit, _)| *unit);

        for (_, txn) in &orphans {
            let state = txn.state();
            if let Some(callback) = callback {
                if state.is_active() || state.is_prepared() {
                    txn.request_callback(Arc::clone(callback))?;
                }
            }
            txn.recovery_completed();
        }

        for (unit, txn) in orphans {
            let state = txn.state();
            self.stats.orphans += 1;
            if state.is_committing() {
                txn.commit(false)?;
                self.stats.committed += 1;
                info!(target: "objmgr::recovery", unit, "Committing unit of work completed");
            } else {
                if state.is_prepared() {
                    self.stats.in_doubt += 1;
                    warn!(target: "objmgr::recovery", unit, "Prepared unit of work backed out");
                } else {
                    debug!(target: "objmgr::recovery", unit, ?state, "Orphaned unit of work backed out");
                }
                txn.backout(false)?;
                self.stats.backed_out += 1;
            }
        }
        Ok(())
    }
}

/// Replay the log from its last complete checkpoint and resolve every
/// unit of work left open.
///
/// `env` must write to a [`NullLog`](objmgr_durability::NullLog) and the
/// stores must already be open warm. When it returns, no recovered
/// transaction is left in `env` and every store holds the committed state.
/// `callback`, when given, is registered on each orphan that can still
/// take one, so it hears about recovery completion and the outcome.
///
/// # Errors
///
/// Fails if a record names an unknown store, if a redo is refused by the
/// transaction state machine, or if the user record handler fails.
pub fn perform_recovery(
    reader: &mut FileLogReader,
    env: &Arc<TransactionEnv>,
    stores: &StoreRegistry,
    handler: Option<&dyn UserRecordHandler>,
    callback: Option<&Arc<dyn TransactionCallback>>,
) -> Result<RecoveryStats> {
    let mut replay = Replay {
        env,
        stores,
        handler,
        units: FxHashMap::default(),
        sequence: 0,
        stats: RecoveryStats {
            records_skipped: reader.skipped_records() as u64,
            ..RecoveryStats::default()
        },
    };

    while let Some(record) = reader.read_next() {
        replay.apply(record)?;
    }
    replay.stats.records_replayed = replay.sequence;
    replay.stats.stop_reason = Some(reader.stop_reason());

    replay.resolve_orphans(callback)?;

    info!(
        target: "objmgr::recovery",
        records = replay.stats.records_replayed,
        skipped = replay.stats.records_skipped,
        units = replay.stats.units_seen,
        committed = replay.stats.committed,
        backed_out = replay.stats.backed_out,
        orphans = replay.stats.orphans,
        stop = ?replay.stats.stop_reason,
        "Log replayed"
    );
    Ok(replay.stats)
}
