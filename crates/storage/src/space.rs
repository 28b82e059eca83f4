//! Store space accounting.
//!
//! A store counts the bytes of the objects it holds (`used`) and the bytes
//! transactions have reserved for objects they have not committed yet
//! (`reserved`). Only reservations are checked against the capacity;
//! committing an object moves its size from the transaction's
//! reservation into `used`.
//!
//! When a reservation does not fit, the store's [`FullPolicy`] decides:
//! fail at once, or wait for releases up to a timeout. A caller that does
//! not accept pacing always fails at once.

use objmgr_core::{Error, FullPolicy, ObjectStoreId, Result};
use parking_lot::{Condvar, Mutex};
use std::time::Instant;
use tracing::debug;

#[derive(Debug, Default)]
struct Space {
    used: u64,
    reserved: u64,
}

/// Used and reserved bytes of one store.
#[derive(Debug)]
pub struct SpaceAccount {
    store: ObjectStoreId,
    capacity: Option<u64>,
    policy: FullPolicy,
    space: Mutex<Space>,
    released: Condvar,
}

impl SpaceAccount {
    /// Empty account.
    pub fn new(store: ObjectStoreId, capacity: Option<u64>, policy: FullPolicy) -> Self {
        SpaceAccount {
            store,
            capacity,
            policy,
            space: Mutex::new(Space::default()),
            released: Condvar::new(),
        }
    }

    /// Bytes held by stored objects.
    pub fn used(&self) -> u64 {
        self.space.lock().used
    }

    /// Bytes reserved for uncommitted objects.
    pub fn reserved(&self) -> u64 {
        self.space.lock().reserved
    }

    /// Bytes still available to reservations.
    pub fn available(&self) -> u64 {
        let space = self.space.lock();
        self.available_in(&space)
    }

    fn available_in(&self, space: &Space) -> u64 {
        match self.capacity {
            Some(capacity) => capacity.saturating_sub(space.used + space.reserved),
            None => u64::MAX,
        }
    }

    /// Reserve (positive) or release (negative) bytes.
    pub fn reserve(&self, delta: i64, pacing: bool) -> Result<()> {
        let mut space = self.space.lock();
        if delta <= 0 {
            space.reserved = space.reserved.saturating_sub(delta.unsigned_abs());
            drop(space);
            self.released.notify_all();
            return Ok(());
        }

        let requested = delta as u64;
        let deadline = match (self.policy, pacing) {
            (FullPolicy::Wait(timeout), true) => Some(Instant::now() + timeout),
            _ => None,
        };
        while self.available_in(&space) < requested {
            let timed_out = match deadline {
                Some(deadline) => self.released.wait_until(&mut space, deadline).timed_out(),
                None => true,
            };
            if timed_out && self.available_in(&space) < requested {
                let available = self.available_in(&space);
                debug!(
                    target: "objmgr::store",
                    store = %self.store,
                    requested,
                    available,
                    "Store full"
                );
                return Err(Error::StoreFull {
                    store: self.store,
                    requested,
                    available,
                });
            }
        }
        space.reserved += requested;
        Ok(())
    }

    /// An object's size changed from `old` to `new` bytes in the store.
    pub fn replace_used(&self, old: u64, new: u64) {
        let mut space = self.space.lock();
        space.used = space.used.saturating_sub(old) + new;
        drop(space);
        if new < old {
            self.released.notify_all();
        }
    }

    /// Forget everything, e.g. when the store's contents are replaced.
    pub fn reset(&self, used: u64) {
        let mut space = self.space.lock();
        space.used = used;
        space.reserved = 0;
        drop(space);
        self.released.notify_all();
    }
}
