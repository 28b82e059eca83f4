//! Application transaction handle
//!
//! A [`Transaction`] is what applications hold. It forwards to the
//! [`InternalTransaction`] it is bound to and refuses everything once the
//! transaction has terminated, without writing anything to the log.
//!
//! Dropping a handle backs out an active unit of work. A prepared one is
//! left alone: its outcome belongs to the two-phase commit coordinator.

use crate::callback::TransactionCallback;
use crate::internal::InternalTransaction;
use objmgr_core::{
    Error, LogicalUnitOfWork, ManagedObject, Result, Token, TransactionState, TxnId,
};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::warn;

enum Binding {
    Live(Arc<InternalTransaction>),
    Terminated,
}

/// Handle on a transaction.
pub struct Transaction {
    id: TxnId,
    binding: RwLock<Binding>,
}

impl Transaction {
    pub(crate) fn bind(internal: Arc<InternalTransaction>) -> Self {
        Transaction {
            id: internal.id(),
            binding: RwLock::new(Binding::Live(internal)),
        }
    }

    fn internal(&self, operation: &'static str) -> Result<Arc<InternalTransaction>> {
        match &*self.binding.read() {
            Binding::Live(internal) => Ok(Arc::clone(internal)),
            Binding::Terminated => Err(Error::invalid_state(
                format!("transaction {}", self.id),
                TransactionState::Terminated,
                operation,
            )),
        }
    }

    fn unbind(&self) {
        *self.binding.write() = Binding::Terminated;
    }

    /// Transaction identifier.
    pub fn id(&self) -> TxnId {
        self.id
    }

    /// Current state.
    pub fn state(&self) -> TransactionState {
        match &*self.binding.read() {
            Binding::Live(internal) => internal.state(),
            Binding::Terminated => TransactionState::Terminated,
        }
    }

    /// Current logical unit of work.
    pub fn unit(&self) -> Result<LogicalUnitOfWork> {
        Ok(self.internal("read the unit of work of")?.unit())
    }

    /// Lock `object`, waiting while another transaction holds it.
    pub fn lock(&self, object: &Arc<ManagedObject>) -> Result<()> {
        self.internal("lock in")?.lock(object)
    }

    /// Add a newly allocated object.
    pub fn add(&self, object: &Arc<ManagedObject>) -> Result<()> {
        self.add_reserving(object, 0)
    }

    /// Add, reserving `extra_log_space` more log bytes for a later change.
    pub fn add_reserving(&self, object: &Arc<ManagedObject>, extra_log_space: u64) -> Result<()> {
        self.internal("add to")?.add(object, extra_log_space)
    }

    /// Log the new contents of a locked object.
    pub fn replace(&self, object: &Arc<ManagedObject>) -> Result<()> {
        self.replace_reserving(object, 0)
    }

    /// Replace, reserving `extra_log_space` more log bytes.
    pub fn replace_reserving(
        &self,
        object: &Arc<ManagedObject>,
        extra_log_space: u64,
    ) -> Result<()> {
        self.internal("replace in")?.replace(object, extra_log_space)
    }

    /// Delete a stored object.
    pub fn delete(&self, object: &Arc<ManagedObject>) -> Result<()> {
        self.delete_reserving(object, 0)
    }

    /// Delete, reserving `extra_log_space` more log bytes.
    pub fn delete_reserving(&self, object: &Arc<ManagedObject>, extra_log_space: u64) -> Result<()> {
        self.internal("delete in")?.delete(object, extra_log_space)
    }

    /// Apply `update` as one logged change.
    pub fn optimistic_replace(&self, update: &OptimisticUpdate) -> Result<()> {
        self.internal("optimistically replace in")?
            .optimistic_replace(update)
    }

    /// Phase one of two-phase commit.
    pub fn prepare(&self) -> Result<()> {
        self.internal("prepare")?.prepare()
    }

    /// Commit. Without `reuse` the handle is finished afterwards.
    pub fn commit(&self, reuse: bool) -> Result<()> {
        let internal = self.internal("commit")?;
        let result = internal.commit(reuse);
        if internal.state() == TransactionState::Terminated {
            self.unbind();
        }
        result
    }

    /// Back out. Without `reuse` the handle is finished afterwards.
    pub fn backout(&self, reuse: bool) -> Result<()> {
        let internal = self.internal("back out")?;
        let result = internal.backout(reuse);
        if internal.state() == TransactionState::Terminated {
            self.unbind();
        }
        result
    }

    /// Set the two-phase commit branch identifier.
    pub fn set_xid(&self, xid: Vec<u8>) -> Result<()> {
        self.internal("set the XID of")?.set_xid(xid)
    }

    /// Have `callback` told about the outcome of the current unit of work.
    pub fn request_callback(&self, callback: Arc<dyn TransactionCallback>) -> Result<()> {
        self.internal("request a callback from")?
            .request_callback(callback)
    }

    /// Finish an inactive transaction.
    pub fn terminate(&self) -> Result<()> {
        self.internal("terminate")?.terminate()?;
        self.unbind();
        Ok(())
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        let internal = match &*self.binding.read() {
            Binding::Live(internal) => Arc::clone(internal),
            Binding::Terminated => return,
        };
        let outcome = match internal.state() {
            state if state.is_active() => internal.backout(false),
            TransactionState::Inactive => internal.terminate(),
            _ => Ok(()),
        };
        if let Err(error) = outcome {
            warn!(target: "objmgr::txn", txn = self.id, %error, "Dropped transaction not finished");
        }
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

/// Changes applied together by [`Transaction::optimistic_replace`].
#[derive(Debug, Default, Clone)]
pub struct OptimisticUpdate {
    pub(crate) to_add: Vec<Arc<ManagedObject>>,
    pub(crate) to_replace: Vec<Arc<ManagedObject>>,
    pub(crate) to_delete: Vec<Arc<ManagedObject>>,
    pub(crate) to_notify: Vec<Token>,
    pub(crate) extra_log_space: u64,
}

impl OptimisticUpdate {
    /// Empty update.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a newly allocated object.
    pub fn add(mut self, object: &Arc<ManagedObject>) -> Self {
        self.to_add.push(Arc::clone(object));
        self
    }

    /// Replace an object without locking it.
    pub fn replace(mut self, object: &Arc<ManagedObject>) -> Self {
        self.to_replace.push(Arc::clone(object));
        self
    }

    /// Delete a stored object.
    pub fn delete(mut self, object: &Arc<ManagedObject>) -> Self {
        self.to_delete.push(Arc::clone(object));
        self
    }

    /// Name a token whose owner must hear about the outcome after recovery.
    pub fn notify(mut self, token: &Token) -> Self {
        self.to_notify.push(token.clone());
        self
    }

    /// Reserve more log bytes for later changes.
    pub fn with_extra_log_space(mut self, bytes: u64) -> Self {
        self.extra_log_space = bytes;
        self
    }

    /// True if the update changes nothing.
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty()
            && self.to_replace.is_empty()
            && self.to_delete.is_empty()
            && self.to_notify.is_empty()
    }
}
