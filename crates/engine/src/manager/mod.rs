//! The object manager
//!
//! Owns the log, the transaction environment and the registered stores,
//! and drives the start-up and shutdown sequences:
//!
//! ```text
//! open ──► OpeningLog ─┬─ no log ──► create log, stores cold ─────────► ColdStarted
//!                      └─ log ────► ReplayingLog: stores warm, replay ─► WarmStarted
//!                                   resolve orphans, reopen log
//! shutdown ──► ShutdownStarted: final checkpoint, close stores and log ──► Stopped
//! ```
//!
//! Both starts end with a checkpoint, so the log on disk always begins at
//! a complete one. A helper thread takes further checkpoints when asked,
//! for instance when a transaction finds the log full.

mod builder;
pub mod config;

pub use builder::ObjectManagerBuilder;

use crate::checkpoint::{CheckpointCounters, CheckpointOutcome, Checkpointer};
use crate::recovery::{perform_recovery, RecoveryStats, UserRecordHandler};
use crate::registry::StoreRegistry;
use config::ObjectManagerConfig;
use objmgr_concurrency::{
    Supervisor, Transaction, TransactionCallback, TransactionCounters, TransactionEnv,
};
use objmgr_core::{Error, LogSequenceNumber, ObjectStore, ObjectStoreId, OpenMode, Result};
use objmgr_durability::{FileLogReader, FileLogWriter, LogCounters, LogRecord, NullLog};
use parking_lot::{Condvar, Mutex as ParkingMutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use tracing::{error, info, warn};

/// Lifecycle of an object manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    /// Reading configuration and the log header
    OpeningLog,
    /// Replaying the log into the stores
    ReplayingLog,
    /// Running after replaying an existing log
    WarmStarted,
    /// Running on a freshly created log
    ColdStarted,
    /// Shutdown has begun; no new work is accepted
    ShutdownStarted,
    /// Log and stores are closed
    Stopped,
}

impl ManagerState {
    /// Whether transactions may run.
    pub fn is_running(self) -> bool {
        matches!(self, ManagerState::WarmStarted | ManagerState::ColdStarted)
    }
}

/// State shared with the checkpoint helper thread.
struct Shared {
    config: ObjectManagerConfig,
    env: Arc<TransactionEnv>,
    stores: StoreRegistry,
    state: RwLock<ManagerState>,
    writer: ParkingMutex<Option<Arc<FileLogWriter>>>,
    checkpointer: Checkpointer,
    requested: ParkingMutex<bool>,
    wake: Condvar,
    stopping: AtomicBool,
    failed: AtomicBool,
}

impl Shared {
    fn set_state(&self, state: ManagerState) {
        *self.state.write() = state;
    }

    fn checkpoint(&self) -> Result<CheckpointOutcome> {
        self.checkpointer.run(&self.env, &self.stores)
    }

    fn request_checkpoint(&self) {
        *self.requested.lock() = true;
        self.wake.notify_one();
    }

    fn helper_loop(&self) {
        loop {
            {
                let mut requested = self.requested.lock();
                while !*requested && !self.stopping.load(Ordering::SeqCst) {
                    self.wake.wait(&mut requested);
                }
                if self.stopping.load(Ordering::SeqCst) {
                    return;
                }
                *requested = false;
            }
            if self.failed.load(Ordering::SeqCst) {
                continue;
            }
            // Failures are counted and logged by the coordinator
            let _ = self.checkpoint();
        }
    }

    fn stop_helper(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        let _requested = self.requested.lock();
        self.wake.notify_all();
    }
}

impl Supervisor for Shared {
    fn log_full(&self) {
        self.request_checkpoint();
    }

    fn permanent_failure(&self, error: &Error) {
        if !self.failed.swap(true, Ordering::SeqCst) {
            error!(
                target: "objmgr::recovery",
                %error,
                "Permanent failure, refusing new work until shutdown"
            );
        }
    }
}

/// An open object manager.
///
/// Dropping it shuts it down; call [`shutdown`](Self::shutdown) to see
/// the outcome.
pub struct ObjectManager {
    dir: PathBuf,
    shared: Arc<Shared>,
    helper: ParkingMutex<Option<JoinHandle<()>>>,
    recovery: Option<RecoveryStats>,
}

impl ObjectManager {
    /// Builder for an object manager keeping its log in `dir`.
    pub fn builder(dir: impl Into<PathBuf>) -> ObjectManagerBuilder {
        ObjectManagerBuilder::new(dir)
    }

    /// Open with `stores` and the configuration in `dir/objmgr.toml`.
    pub fn open(dir: impl Into<PathBuf>, stores: Vec<Arc<dyn ObjectStore>>) -> Result<Self> {
        stores
            .into_iter()
            .fold(Self::builder(dir), |builder, store| builder.with_store(store))
            .open()
    }

    fn start(
        dir: PathBuf,
        config: ObjectManagerConfig,
        stores: StoreRegistry,
        user_records: Option<Arc<dyn UserRecordHandler>>,
        recovery_callback: Option<Arc<dyn TransactionCallback>>,
    ) -> Result<Self> {
        let env = TransactionEnv::new(Arc::new(NullLog::new()), config.max_active_transactions);
        let shared = Arc::new(Shared {
            checkpointer: Checkpointer::new(config.checkpoint_threshold),
            config,
            env,
            stores,
            state: RwLock::new(ManagerState::OpeningLog),
            writer: ParkingMutex::new(None),
            requested: ParkingMutex::new(false),
            wake: Condvar::new(),
            stopping: AtomicBool::new(false),
            failed: AtomicBool::new(false),
        });
        let weak = Arc::downgrade(&shared);
        let supervisor: Weak<dyn Supervisor> = weak;
        shared.env.set_supervisor(supervisor);

        let log_config = shared.config.log_config();
        let log_path = dir.join(&log_config.file_name);
        let mut recovery = None;

        let reader = if log_path.exists() {
            let reader = FileLogReader::open(&log_path)?;
            if reader.checkpoint_found() {
                Some(reader)
            } else {
                warn!(
                    target: "objmgr::recovery",
                    path = %log_path.display(),
                    "Log holds no complete checkpoint, starting cold"
                );
                None
            }
        } else {
            None
        };

        let writer = match reader {
            None => {
                shared.stores.open_all(OpenMode::Cold)?;
                Arc::new(FileLogWriter::create(&dir, &log_config)?)
            }
            Some(mut reader) => {
                shared.stores.open_all(OpenMode::Warm)?;
                shared.set_state(ManagerState::ReplayingLog);
                let stats = perform_recovery(
                    &mut reader,
                    &shared.env,
                    &shared.stores,
                    user_records.as_deref(),
                    recovery_callback.as_ref(),
                )?;
                let resume = reader.resume_point();
                drop(reader);

                let writer = Arc::new(FileLogWriter::open(&dir, &log_config, resume)?);
                writer.advance_sequence(stats.records_replayed);
                recovery = Some(stats);
                writer
            }
        };
        shared.env.set_log(writer.clone());
        *shared.writer.lock() = Some(writer);
        shared.checkpoint()?;

        let state = if recovery.is_some() {
            ManagerState::WarmStarted
        } else {
            ManagerState::ColdStarted
        };
        shared.set_state(state);

        let helper = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("objmgr-checkpoint".to_string())
                .spawn(move || shared.helper_loop())?
        };

        info!(
            target: "objmgr::recovery",
            dir = %dir.display(),
            ?state,
            stores = shared.stores.len(),
            "Object manager started"
        );
        Ok(ObjectManager {
            dir,
            shared,
            helper: ParkingMutex::new(Some(helper)),
            recovery,
        })
    }

    fn check_running(&self, operation: &'static str) -> Result<()> {
        let state = self.state();
        if !state.is_running() {
            return Err(Error::invalid_state("object manager", state, operation));
        }
        if self.shared.failed.load(Ordering::SeqCst) {
            return Err(Error::InvalidState {
                entity: "object manager".to_string(),
                state: "Failed".to_string(),
                operation,
            });
        }
        Ok(())
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ManagerState {
        *self.shared.state.read()
    }

    /// Directory holding the log and configuration.
    pub fn directory(&self) -> &Path {
        &self.dir
    }

    /// Configuration in effect.
    pub fn config(&self) -> &ObjectManagerConfig {
        &self.shared.config
    }

    /// The store registered under `id`.
    pub fn store(&self, id: ObjectStoreId) -> Option<Arc<dyn ObjectStore>> {
        self.shared.stores.get(id)
    }

    /// Every registered store.
    pub fn stores(&self) -> &StoreRegistry {
        &self.shared.stores
    }

    /// What the warm start found, `None` after a cold start.
    pub fn recovery_stats(&self) -> Option<&RecoveryStats> {
        self.recovery.as_ref()
    }

    /// Whether a permanent failure has stopped new work.
    pub fn has_failed(&self) -> bool {
        self.shared.failed.load(Ordering::SeqCst)
    }

    /// Begin a transaction.
    pub fn begin(&self) -> Result<Transaction> {
        self.check_running("begin a transaction in")?;
        self.shared.env.begin()
    }

    /// Number of transactions that have not terminated.
    pub fn active_transactions(&self) -> usize {
        self.shared.env.active_count()
    }

    /// Write a forced user-defined record, handed back to the
    /// [`UserRecordHandler`] if the log is replayed.
    pub fn write_user_record(&self, payload: Vec<u8>) -> Result<LogSequenceNumber> {
        self.check_running("write a user record to")?;
        let record = LogRecord::UserDefined { payload };
        record.check_lengths()?;
        self.shared.env.log().write_next(&record, 0, true, true)
    }

    /// Take a checkpoint now.
    pub fn checkpoint(&self) -> Result<CheckpointOutcome> {
        self.check_running("checkpoint")?;
        self.shared.checkpoint()
    }

    /// Ask the helper thread for a checkpoint and return at once.
    pub fn request_checkpoint(&self) {
        self.shared.request_checkpoint();
    }

    /// Snapshot of the transaction counters.
    pub fn transaction_counters(&self) -> TransactionCounters {
        self.shared.env.counters()
    }

    /// Snapshot of the checkpoint counters.
    pub fn checkpoint_counters(&self) -> CheckpointCounters {
        self.shared.checkpointer.counters()
    }

    /// Snapshot of the log counters, `None` once the log is closed.
    pub fn log_counters(&self) -> Option<LogCounters> {
        self.shared
            .writer
            .lock()
            .as_ref()
            .map(|writer| writer.counters())
    }

    /// Log occupancy between 0.0 and 1.0.
    pub fn log_occupancy(&self) -> f64 {
        self.shared.env.log().occupancy()
    }

    /// Shut down: final checkpoint, stop the helper, finish every
    /// transaction, close the stores and the log.
    ///
    /// Transactions still open are recovered as orphans at the next warm
    /// start. Calling it again does nothing.
    pub fn shutdown(&self) -> Result<()> {
        {
            let mut state = self.shared.state.write();
            match *state {
                ManagerState::ShutdownStarted | ManagerState::Stopped => return Ok(()),
                _ => *state = ManagerState::ShutdownStarted,
            }
        }

        self.shared.stop_helper();
        if let Some(handle) = self.helper.lock().take() {
            let _ = handle.join();
        }

        let checkpointed = if self.has_failed() {
            Ok(())
        } else {
            self.shared.checkpoint().map(|_| ())
        };
        self.shared.env.shutdown_all();
        let stores_closed = self.shared.stores.close_all();
        let log_closed = match self.shared.writer.lock().take() {
            Some(writer) => writer.close(),
            None => Ok(()),
        };
        self.shared.set_state(ManagerState::Stopped);

        info!(target: "objmgr::recovery", dir = %self.dir.display(), "Object manager stopped");
        checkpointed.and(stores_closed).and(log_closed)
    }
}

impl Drop for ObjectManager {
    fn drop(&mut self) {
        if let Err(error) = self.shutdown() {
            warn!(target: "objmgr::recovery", %error, "Shutdown on drop failed");
        }
    }
}

impl std::fmt::Debug for ObjectManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectManager")
            .field("dir", &self.dir)
            .field("state", &self.state())
            .field("stores", &self.shared.stores)
            .finish()
    }
}
