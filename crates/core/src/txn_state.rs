//! Transaction state machine tables.
//!
//! A transaction moves through Active, PrePrepared, Prepared and then
//! Committing or BackingOut. Each of those phases comes in three flavours
//! according to what the transaction has touched so far: nothing
//! (`Inactive`), only non-persistent objects, or at least one persistent
//! object. The persistent flavour is sticky because the transaction owes a
//! durable outcome record once anything was logged for it.
//!
//! Every operation is a [`TransitionEvent`]; [`TransactionState::next`]
//! looks up the resulting state, which is [`TransactionState::Error`] when
//! the event is not allowed.
//!
//! The state is also written into log records so that recovery can tell
//! how far a transaction had got.

use serde::{Deserialize, Serialize};

/// State of an internal transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TransactionState {
    /// A state error has occurred; the transaction is unusable
    Error = 0,
    /// No work done yet
    Inactive = 1,
    /// Only non-persistent objects involved
    ActiveNonPersistent = 2,
    /// At least one persistent object involved
    ActivePersistent = 3,
    /// About to prepare, nothing involved
    PrePreparedInactive = 4,
    /// About to prepare, non-persistent objects only
    PrePreparedNonPersistent = 5,
    /// About to prepare, persistent objects involved
    PrePreparedPersistent = 6,
    /// Prepared, nothing involved
    PreparedInactive = 7,
    /// Prepared, non-persistent objects only
    PreparedNonPersistent = 8,
    /// Prepared, persistent objects involved
    PreparedPersistent = 9,
    /// Must commit, nothing involved
    CommittingInactive = 10,
    /// Must commit, non-persistent objects only
    CommittingNonPersistent = 11,
    /// Must commit, persistent objects involved
    CommittingPersistent = 12,
    /// Must back out, nothing involved
    BackingOutInactive = 13,
    /// Must back out, non-persistent objects only
    BackingOutNonPersistent = 14,
    /// Must back out, persistent objects involved
    BackingOutPersistent = 15,
    /// Committed or backed out and not reusable
    Terminated = 16,
}

/// Events that drive the transaction state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionEvent {
    /// A non-persistent object joins the transaction
    InvolveNonPersistent,
    /// A persistent object joins the transaction
    InvolvePersistent,
    /// A persistent object is restored from a checkpoint record
    InvolvePersistentFromCheckpoint,
    /// A non-persistent object is optimistically replaced
    InvolveOptimisticNonPersistent,
    /// A persistent object is optimistically replaced
    InvolveOptimisticPersistent,
    /// An object asks to be told about the outcome
    RequestCallback,
    /// Callbacks are about to be driven ahead of prepare
    PrePrepare,
    /// Phase one of two-phase commit
    Prepare,
    /// Commit begins
    StartCommit,
    /// Commit is complete
    Commit,
    /// Backout begins
    StartBackout,
    /// Backout is complete
    Backout,
    /// The transaction is discarded after completion
    Terminate,
    /// The object manager is shutting down
    Shutdown,
}

use TransactionState::{
    ActiveNonPersistent as ANP, ActivePersistent as AP, BackingOutInactive as BI,
    BackingOutNonPersistent as BNP, BackingOutPersistent as BP, CommittingInactive as CI,
    CommittingNonPersistent as CNP, CommittingPersistent as CP, Error as E, Inactive as I,
    PrePreparedInactive as PPI, PrePreparedNonPersistent as PPNP, PrePreparedPersistent as PPP,
    PreparedInactive as PI, PreparedNonPersistent as PNP, PreparedPersistent as PP,
    Terminated as T,
};

type Table = [TransactionState; 17];

// Rows are indexed by the current state, in declaration order.
const INVOLVE_NON_PERSISTENT: Table = [E, ANP, ANP, AP, PPNP, PPNP, PPP, E, E, E, E, E, E, E, E, E, E];
const INVOLVE_PERSISTENT: Table = [E, AP, AP, AP, PPP, PPP, PPP, E, E, E, E, E, E, E, E, E, E];
const INVOLVE_PERSISTENT_FROM_CHECKPOINT: Table =
    [E, AP, E, AP, E, E, E, PP, E, PP, E, E, E, E, E, E, E];
const INVOLVE_OPTIMISTIC_NON_PERSISTENT: Table =
    [E, ANP, ANP, AP, PPNP, PPNP, PPP, PNP, PNP, PP, CNP, CNP, CP, BNP, BNP, BP, E];
const INVOLVE_OPTIMISTIC_PERSISTENT: Table =
    [E, AP, AP, AP, PPP, PPP, PPP, PP, PP, PP, E, E, CP, E, E, BP, E];
const REQUEST_CALLBACK: Table = [E, E, ANP, AP, E, E, E, E, PNP, PP, E, E, E, E, E, E, E];
const PRE_PREPARE: Table = [E, PPI, PPNP, PPP, E, E, PPP, E, E, E, E, E, E, E, E, E, E];
const PREPARE: Table = [E, PI, PNP, PP, PI, PNP, PP, PI, PNP, PP, E, E, E, E, E, E, E];
const START_COMMIT: Table = [E, E, E, CP, CI, CNP, CP, CI, CNP, CP, E, E, CP, E, E, E, E];
const COMMIT: Table = [E, E, E, E, E, E, E, E, E, E, I, I, I, E, E, E, E];
const START_BACKOUT: Table = [E, E, E, BP, BI, BNP, BP, BI, BNP, BP, E, E, E, E, E, BP, E];
const BACKOUT: Table = [E, E, E, E, E, E, E, E, E, E, E, E, E, I, I, I, E];
const TERMINATE: Table = [E, T, E, E, E, E, E, E, E, E, E, E, E, E, E, E, E];
const SHUTDOWN: Table = [E, T, T, T, T, T, T, T, T, T, T, T, T, T, T, T, T];

impl TransitionEvent {
    fn table(self) -> &'static Table {
        match self {
            TransitionEvent::InvolveNonPersistent => &INVOLVE_NON_PERSISTENT,
            TransitionEvent::InvolvePersistent => &INVOLVE_PERSISTENT,
            TransitionEvent::InvolvePersistentFromCheckpoint => &INVOLVE_PERSISTENT_FROM_CHECKPOINT,
            TransitionEvent::InvolveOptimisticNonPersistent => &INVOLVE_OPTIMISTIC_NON_PERSISTENT,
            TransitionEvent::InvolveOptimisticPersistent => &INVOLVE_OPTIMISTIC_PERSISTENT,
            TransitionEvent::RequestCallback => &REQUEST_CALLBACK,
            TransitionEvent::PrePrepare => &PRE_PREPARE,
            TransitionEvent::Prepare => &PREPARE,
            TransitionEvent::StartCommit => &START_COMMIT,
            TransitionEvent::Commit => &COMMIT,
            TransitionEvent::StartBackout => &START_BACKOUT,
            TransitionEvent::Backout => &BACKOUT,
            TransitionEvent::Terminate => &TERMINATE,
            TransitionEvent::Shutdown => &SHUTDOWN,
        }
    }

    /// Operation name used in invalid state errors.
    pub fn operation(self) -> &'static str {
        match self {
            TransitionEvent::InvolveNonPersistent | TransitionEvent::InvolvePersistent => {
                "involve an object in"
            }
            TransitionEvent::InvolvePersistentFromCheckpoint => "restore a checkpointed object in",
            TransitionEvent::InvolveOptimisticNonPersistent
            | TransitionEvent::InvolveOptimisticPersistent => "optimistically replace in",
            TransitionEvent::RequestCallback => "request a callback from",
            TransitionEvent::PrePrepare => "pre-prepare",
            TransitionEvent::Prepare => "prepare",
            TransitionEvent::StartCommit | TransitionEvent::Commit => "commit",
            TransitionEvent::StartBackout | TransitionEvent::Backout => "back out",
            TransitionEvent::Terminate => "terminate",
            TransitionEvent::Shutdown => "shut down",
        }
    }
}

impl TransactionState {
    /// All states in code order.
    pub const ALL: [TransactionState; 17] = [E, I, ANP, AP, PPI, PPNP, PPP, PI, PNP, PP, CI, CNP, CP, BI, BNP, BP, T];

    /// State reached from `self` on `event`; `Error` if not allowed.
    pub fn next(self, event: TransitionEvent) -> TransactionState {
        event.table()[self as usize]
    }

    /// Code written to the log.
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Decode a state written to the log.
    pub fn from_code(code: u8) -> Option<TransactionState> {
        Self::ALL.get(code as usize).copied()
    }

    /// Whether a persistent object has been involved.
    pub fn is_persistent(self) -> bool {
        matches!(self, AP | PPP | PP | CP | BP)
    }

    /// Whether a checkpoint must capture this transaction.
    pub fn requires_checkpoint(self) -> bool {
        self.is_persistent()
    }

    /// Active in any flavour.
    pub fn is_active(self) -> bool {
        matches!(self, ANP | AP)
    }

    /// PrePrepared in any flavour.
    pub fn is_pre_prepared(self) -> bool {
        matches!(self, PPI | PPNP | PPP)
    }

    /// Prepared in any flavour.
    pub fn is_prepared(self) -> bool {
        matches!(self, PI | PNP | PP)
    }

    /// Committing in any flavour.
    pub fn is_committing(self) -> bool {
        matches!(self, CI | CNP | CP)
    }

    /// Backing out in any flavour.
    pub fn is_backing_out(self) -> bool {
        matches!(self, BI | BNP | BP)
    }
}
