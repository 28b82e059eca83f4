//! Shared state of every transaction of one object manager.
//!
//! The environment owns the log output transactions write to, the
//! registry of live transactions, and the identifier counters. The log
//! output can be swapped: recovery replays against a
//! [`NullLog`](objmgr_durability::NullLog) and installs the file writer
//! once replay is over.
//!
//! # Supervision
//!
//! Failures a transaction cannot handle itself are reported to an
//! optional [`Supervisor`]: a full log asks for a checkpoint, a permanent
//! I/O failure asks for shutdown.

use crate::internal::InternalTransaction;
use crate::transaction::Transaction;
use dashmap::DashMap;
use objmgr_core::{Error, LogSequenceNumber, Result, TransactionState, TxnId};
use objmgr_durability::{LogOutput, LogRecord};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// Receiver of failures that need action beyond the failing call.
pub trait Supervisor: Send + Sync {
    /// A write found the log full; a checkpoint would free space.
    fn log_full(&self) {}

    /// The log or a store hit an error after which it cannot be trusted.
    fn permanent_failure(&self, _error: &Error) {}
}

/// Cumulative transaction counters.
///
/// These accumulate over the lifetime of the environment and are never reset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionCounters {
    /// Transactions begun
    pub begun: u64,
    /// Units of work committed
    pub committed: u64,
    /// Units of work backed out
    pub backed_out: u64,
    /// Committed units of work that wrote a commit record
    pub persistent_commits: u64,
}

#[derive(Debug, Default)]
struct AtomicCounters {
    begun: AtomicU64,
    committed: AtomicU64,
    backed_out: AtomicU64,
    persistent_commits: AtomicU64,
}

/// Log, registry and counters shared by all transactions.
pub struct TransactionEnv {
    log: RwLock<Arc<dyn LogOutput>>,
    registry: DashMap<TxnId, Arc<InternalTransaction>>,
    active: AtomicUsize,
    next_txn: AtomicU64,
    next_unit: AtomicU64,
    checkpoint_starting: AtomicBool,
    max_active: usize,
    supervisor: RwLock<Option<Weak<dyn Supervisor>>>,
    counters: AtomicCounters,
}

impl TransactionEnv {
    /// Environment writing to `log` and allowing at most `max_active`
    /// registered transactions.
    pub fn new(log: Arc<dyn LogOutput>, max_active: usize) -> Arc<Self> {
        Arc::new(TransactionEnv {
            log: RwLock::new(log),
            registry: DashMap::new(),
            active: AtomicUsize::new(0),
            next_txn: AtomicU64::new(1),
            next_unit: AtomicU64::new(1),
            checkpoint_starting: AtomicBool::new(false),
            max_active,
            supervisor: RwLock::new(None),
            counters: AtomicCounters::default(),
        })
    }

    /// The current log output.
    pub fn log(&self) -> Arc<dyn LogOutput> {
        Arc::clone(&self.log.read())
    }

    /// Install a new log output and return the previous one.
    pub fn set_log(&self, log: Arc<dyn LogOutput>) -> Arc<dyn LogOutput> {
        std::mem::replace(&mut *self.log.write(), log)
    }

    /// Report failures to `supervisor` from now on.
    pub fn set_supervisor(&self, supervisor: Weak<dyn Supervisor>) {
        *self.supervisor.write() = Some(supervisor);
    }

    /// Begin a new transaction.
    pub fn begin(self: &Arc<Self>) -> Result<Transaction> {
        Ok(Transaction::bind(self.begin_internal()?))
    }

    /// Create and register a transaction without a handle, for replay.
    pub fn begin_internal(self: &Arc<Self>) -> Result<Arc<InternalTransaction>> {
        let max_active = self.max_active;
        self.active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |active| {
                (active < max_active).then_some(active + 1)
            })
            .map_err(|_| Error::TooManyTransactions { limit: max_active })?;
        let id = self.next_txn.fetch_add(1, Ordering::SeqCst);
        let unit = self.next_unit_id();
        let txn = Arc::new(InternalTransaction::new(id, unit, Arc::downgrade(self)));
        self.registry.insert(id, Arc::clone(&txn));
        self.counters.begun.fetch_add(1, Ordering::Relaxed);
        debug!(target: "objmgr::txn", txn = id, unit, "Transaction begun");
        Ok(txn)
    }

    pub(crate) fn next_unit_id(&self) -> u64 {
        self.next_unit.fetch_add(1, Ordering::SeqCst)
    }

    /// Make sure units of work created from now on are numbered above `id`.
    ///
    /// Recovery calls this for every unit it finds in the log.
    pub fn observe_unit(&self, id: u64) {
        self.next_unit.fetch_max(id + 1, Ordering::SeqCst);
    }

    /// Registered transaction by identifier.
    pub fn get(&self, id: TxnId) -> Option<Arc<InternalTransaction>> {
        self.registry.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// Snapshot of every registered transaction, ordered by identifier.
    pub fn transactions(&self) -> Vec<Arc<InternalTransaction>> {
        let mut all: Vec<_> = self
            .registry
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        all.sort_by_key(|txn| txn.id());
        all
    }

    /// Number of registered transactions.
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub(crate) fn deregister(&self, id: TxnId) {
        if self.registry.remove(&id).is_some() {
            self.active.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Mark the start or end of a checkpoint. While set, committed objects
    /// must be part of the running checkpoint's flush.
    pub fn set_checkpoint_starting(&self, starting: bool) {
        self.checkpoint_starting.store(starting, Ordering::SeqCst);
    }

    /// Whether a checkpoint is in progress.
    pub fn checkpoint_starting(&self) -> bool {
        self.checkpoint_starting.load(Ordering::SeqCst)
    }

    /// The active persistent transaction holding the most log space; the
    /// one to back out when a checkpoint cannot free enough of the log.
    pub fn largest_persistent(&self) -> Option<Arc<InternalTransaction>> {
        self.transactions()
            .into_iter()
            .filter(|txn| txn.state() == TransactionState::ActivePersistent)
            .max_by_key(|txn| txn.log_space_reserved())
    }

    /// Shut down every registered transaction and empty the registry.
    pub fn shutdown_all(&self) {
        for txn in self.transactions() {
            txn.shutdown();
            self.deregister(txn.id());
        }
    }

    /// Snapshot of the counters.
    pub fn counters(&self) -> TransactionCounters {
        TransactionCounters {
            begun: self.counters.begun.load(Ordering::Relaxed),
            committed: self.counters.committed.load(Ordering::Relaxed),
            backed_out: self.counters.backed_out.load(Ordering::Relaxed),
            persistent_commits: self.counters.persistent_commits.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn count_outcome(&self, committed: bool, persistent: bool) {
        if committed {
            self.counters.committed.fetch_add(1, Ordering::Relaxed);
            if persistent {
                self.counters.persistent_commits.fetch_add(1, Ordering::Relaxed);
            }
        } else {
            self.counters.backed_out.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Write through the current log, reporting failures to the supervisor.
    pub(crate) fn write(
        &self,
        record: &LogRecord,
        reserved_delta: i64,
        check_space: bool,
        force: bool,
    ) -> Result<LogSequenceNumber> {
        record.check_lengths()?;
        let log = self.log();
        log.write_next(record, reserved_delta, check_space, force)
            .map_err(|e| self.report(e))
    }

    /// Pass `error` to the supervisor if it needs action, then return it.
    pub(crate) fn report(&self, error: Error) -> Error {
        let supervisor = self.supervisor.read().as_ref().and_then(Weak::upgrade);
        match &error {
            Error::LogFull { .. } => {
                debug!(target: "objmgr::txn", %error, "Log full, requesting checkpoint");
                if let Some(supervisor) = supervisor {
                    supervisor.log_full();
                }
            }
            e if e.is_permanent() => {
                warn!(target: "objmgr::txn", %error, "Permanent failure");
                if let Some(supervisor) = supervisor {
                    supervisor.permanent_failure(&error);
                }
            }
            _ => {}
        }
        error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use objmgr_durability::MemoryLog;
    use parking_lot::Mutex;

    fn env(max_active: usize) -> Arc<TransactionEnv> {
        TransactionEnv::new(Arc::new(MemoryLog::new()), max_active)
    }

    #[test]
    fn test_begin_registers_until_limit() {
        let env = env(2);
        let a = env.begin().unwrap();
        let _b = env.begin().unwrap();
        assert!(matches!(
            env.begin(),
            Err(Error::TooManyTransactions { limit: 2 })
        ));
        a.commit(false).unwrap();
        env.begin().unwrap();
        assert_eq!(env.counters().begun, 3);
    }

    #[test]
    fn test_concurrent_begins_never_pass_limit() {
        let env = env(4);
        let barrier = std::sync::Barrier::new(16);
        let begun: Vec<_> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..16)
                .map(|_| {
                    scope.spawn(|| {
                        barrier.wait();
                        env.begin_internal().ok()
                    })
                })
                .collect();
            handles
                .into_iter()
                .filter_map(|handle| handle.join().unwrap())
                .collect()
        });

        assert_eq!(begun.len(), 4);
        assert_eq!(env.active_count(), 4);
        begun[0].terminate().unwrap();
        assert_eq!(env.active_count(), 3);
        assert!(env.begin_internal().is_ok());
    }

    #[test]
    fn test_shutdown_all_frees_every_slot() {
        let env = env(2);
        let _a = env.begin_internal().unwrap();
        let _b = env.begin_internal().unwrap();
        env.shutdown_all();
        assert_eq!(env.active_count(), 0);
        assert!(env.transactions().is_empty());
    }

    #[test]
    fn test_observed_units_are_not_reused() {
        let env = env(10);
        env.observe_unit(41);
        let txn = env.begin().unwrap();
        assert_eq!(txn.unit().unwrap().id, 42);
    }

    #[test]
    fn test_set_log_returns_previous() {
        let env = env(10);
        let replacement: Arc<dyn LogOutput> = Arc::new(MemoryLog::new());
        let previous = env.set_log(Arc::clone(&replacement));
        assert!(!Arc::ptr_eq(&previous, &replacement));
        assert!(Arc::ptr_eq(&env.log(), &replacement));
    }

    #[derive(Default)]
    struct Recorder {
        full: Mutex<usize>,
    }

    impl Supervisor for Recorder {
        fn log_full(&self) {
            *self.full.lock() += 1;
        }
    }

    #[test]
    fn test_log_full_is_reported() {
        let env = TransactionEnv::new(Arc::new(MemoryLog::with_capacity(16)), 10);
        let recorder = Arc::new(Recorder::default());
        let weak = Arc::downgrade(&recorder);
        let supervisor: Weak<dyn Supervisor> = weak;
        env.set_supervisor(supervisor);
        let err = env
            .write(&LogRecord::CheckpointStart, 0, true, true)
            .unwrap_err();
        assert!(err.is_capacity());
        assert_eq!(*recorder.full.lock(), 1);
    }
}
