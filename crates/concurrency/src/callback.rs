//! Outcome notifications for objects that asked to hear about them.
//!
//! A [`TransactionCallback`] registered through
//! [`Transaction::request_callback`](crate::Transaction::request_callback)
//! is told about each phase of the unit of work it joined. Callbacks run
//! on the completing thread, after the transaction's own lock has been
//! released, and must not complete the transaction they are called for.

use objmgr_core::{LogicalUnitOfWork, Result};

/// Receiver of transaction outcome notifications.
///
/// Every method has a no-op default so implementations only override the
/// phases they care about. An error from `pre_prepare` stops the prepare,
/// commit or backout that triggered it before anything is logged; once an
/// outcome is decided it can no longer be refused.
pub trait TransactionCallback: Send + Sync {
    /// The transaction is about to be prepared, committed or backed out.
    fn pre_prepare(&self, _unit: &LogicalUnitOfWork) -> Result<()> {
        Ok(())
    }

    /// The outcome is commit and is about to be applied.
    fn pre_commit(&self, _unit: &LogicalUnitOfWork) {}

    /// Commit is complete and every lock is released.
    fn post_commit(&self, _unit: &LogicalUnitOfWork) {}

    /// The outcome is backout and is about to be applied.
    fn pre_backout(&self, _unit: &LogicalUnitOfWork) {}

    /// Backout is complete and every lock is released.
    fn post_backout(&self, _unit: &LogicalUnitOfWork) {}

    /// An optimistic replace including this callback's object was logged.
    fn optimistic_replace_logged(&self, _unit: &LogicalUnitOfWork) {}

    /// The log has been replayed and forward processing is about to start.
    fn recovery_completed(&self, _unit: &LogicalUnitOfWork) {}
}
