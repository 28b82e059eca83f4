//! Per-store identity map.
//!
//! Maps a stored object identity to its single live [`Token`]. Entries
//! are weak, so a token nobody holds is reclaimed and re-created on the
//! next lookup; there is never more than one live instance per identity.
//! Lookups go through `DashMap` shards without a global lock, and
//! registration is an atomic put-if-absent on the shard entry.

use crate::error::{Error, Result};
use crate::managed::ManagedObject;
use crate::token::{Token, TokenInner};
use crate::traits::ObjectStore;
use crate::types::{ObjectStoreId, StoredObjectId, TokenId};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::{Arc, Weak};

/// Canonical tokens of one store plus its sequence counter.
pub struct IdentityMap {
    store_id: ObjectStoreId,
    store: Weak<dyn ObjectStore>,
    tokens: DashMap<StoredObjectId, Weak<TokenInner>>,
    /// Last sequence number handed out
    sequence: Mutex<u64>,
}

impl IdentityMap {
    /// Create the map for the store behind `store`.
    ///
    /// Stores usually build themselves with `Arc::new_cyclic` and pass
    /// their own weak reference here.
    pub fn new(store_id: ObjectStoreId, store: Weak<dyn ObjectStore>) -> Self {
        IdentityMap {
            store_id,
            store,
            tokens: DashMap::new(),
            sequence: Mutex::new(0),
        }
    }

    /// Give `object` the next sequence number and register its token.
    pub fn allocate(&self, object: &Arc<ManagedObject>) -> Result<Token> {
        if let Some(token) = object.token() {
            return Err(Error::invalid_state(
                format!("object {}", token.id()),
                object.state(),
                "allocate",
            ));
        }

        let id = {
            let mut sequence = self.sequence.lock();
            *sequence += 1;
            StoredObjectId(*sequence)
        };

        let token = match self.tokens.entry(id) {
            Entry::Occupied(mut entry) => {
                if entry.get().upgrade().is_some() {
                    return Err(Error::DuplicateIdentity(TokenId {
                        store: self.store_id,
                        object: id,
                    }));
                }
                let token = self.new_token(id);
                entry.insert(token.downgrade());
                token
            }
            Entry::Vacant(entry) => {
                let token = self.new_token(id);
                entry.insert(token.downgrade());
                token
            }
        };

        token.set_managed_object(Arc::clone(object))?;
        Ok(token)
    }

    /// The canonical token for `id`, registered if none is live.
    ///
    /// Also moves the sequence counter past `id` so that identities seen
    /// during recovery are never handed out again.
    pub fn like(&self, id: StoredObjectId) -> Token {
        {
            let mut sequence = self.sequence.lock();
            if *sequence < id.0 {
                *sequence = id.0;
            }
        }

        match self.tokens.entry(id) {
            Entry::Occupied(mut entry) => {
                if let Some(token) = Token::upgrade(entry.get()) {
                    return token;
                }
                let token = self.new_token(id);
                entry.insert(token.downgrade());
                token
            }
            Entry::Vacant(entry) => {
                let token = self.new_token(id);
                entry.insert(token.downgrade());
                token
            }
        }
    }

    fn new_token(&self, id: StoredObjectId) -> Token {
        Token::new(
            TokenId {
                store: self.store_id,
                object: id,
            },
            self.store.clone(),
        )
    }

    /// The live token for `id`, without registering one.
    pub fn get(&self, id: StoredObjectId) -> Option<Token> {
        self.tokens.get(&id).and_then(|weak| Token::upgrade(&weak))
    }

    /// Every live token.
    pub fn tokens(&self) -> HashSet<Token> {
        self.tokens
            .iter()
            .filter_map(|entry| Token::upgrade(entry.value()))
            .collect()
    }

    /// Last sequence number handed out.
    pub fn sequence(&self) -> u64 {
        *self.sequence.lock()
    }

    /// Reset the counter, e.g. to the value a store persisted.
    pub fn set_sequence(&self, sequence: u64) {
        *self.sequence.lock() = sequence;
    }

    /// Drop entries whose tokens are no longer held.
    pub fn purge(&self) {
        self.tokens.retain(|_, weak| weak.strong_count() > 0);
    }

    /// Invalidate every live token and forget them.
    pub fn invalidate_all(&self) {
        for token in self.tokens() {
            token.invalidate();
        }
        self.tokens.clear();
    }
}
