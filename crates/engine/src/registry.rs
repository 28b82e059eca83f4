//! Object stores known to an object manager.
//!
//! Log records name objects by [`TokenId`]; replay turns them back into
//! the canonical token through the store registered under the id.

use objmgr_core::{Error, ObjectStore, ObjectStoreId, OpenMode, Result, Token, TokenId};
use rustc_hash::FxHashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Stores keyed by identifier.
#[derive(Default)]
pub struct StoreRegistry {
    stores: FxHashMap<ObjectStoreId, Arc<dyn ObjectStore>>,
}

impl StoreRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `store`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if another store has the same identifier.
    pub fn register(&mut self, store: Arc<dyn ObjectStore>) -> Result<()> {
        let id = store.identifier();
        if self.stores.contains_key(&id) {
            return Err(Error::Config(format!(
                "two object stores share identifier {}",
                id
            )));
        }
        self.stores.insert(id, store);
        Ok(())
    }

    /// The store registered under `id`.
    pub fn get(&self, id: ObjectStoreId) -> Option<Arc<dyn ObjectStore>> {
        self.stores.get(&id).cloned()
    }

    /// Canonical token for a logged identity.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownStore`] if no store has the identity's store id.
    pub fn resolve(&self, id: TokenId) -> Result<Token> {
        self.stores
            .get(&id.store)
            .map(|store| store.like(id.object))
            .ok_or(Error::UnknownStore(id.store))
    }

    /// Every store, ordered by identifier.
    pub fn stores(&self) -> Vec<Arc<dyn ObjectStore>> {
        let mut stores: Vec<_> = self.stores.values().cloned().collect();
        stores.sort_by_key(|store| store.identifier());
        stores
    }

    /// Number of stores.
    pub fn len(&self) -> usize {
        self.stores.len()
    }

    /// True if no store is registered.
    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }

    pub(crate) fn open_all(&self, mode: OpenMode) -> Result<()> {
        for store in self.stores() {
            store.open(mode)?;
            debug!(target: "objmgr::store", store = store.name(), ?mode, "Store opened");
        }
        Ok(())
    }

    pub(crate) fn flush_persistent(&self) -> Result<()> {
        for store in self.stores() {
            if store.is_persistent() {
                store.flush()?;
            }
        }
        Ok(())
    }

    /// Close every store, carrying on past failures; the first is returned.
    pub(crate) fn close_all(&self) -> Result<()> {
        let mut first = None;
        for store in self.stores() {
            if let Err(error) = store.close() {
                warn!(target: "objmgr::store", store = store.name(), %error, "Store close failed");
                first.get_or_insert(error);
            }
        }
        first.map_or(Ok(()), Err)
    }
}

impl std::fmt::Debug for StoreRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.stores().iter().map(|store| store.name().to_string()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use objmgr_storage::{MemoryObjectStore, StoreConfig};

    #[test]
    fn test_resolve_returns_canonical_token() {
        let mut registry = StoreRegistry::new();
        let store = MemoryObjectStore::new(StoreConfig::new(3, "scratch")).unwrap();
        registry.register(store.clone()).unwrap();

        let first = registry.resolve(TokenId::new(3, 9)).unwrap();
        let second = registry.resolve(TokenId::new(3, 9)).unwrap();
        assert!(Token::ptr_eq(&first, &second));
    }

    #[test]
    fn test_resolve_unknown_store() {
        let registry = StoreRegistry::new();
        assert!(matches!(
            registry.resolve(TokenId::new(4, 1)),
            Err(Error::UnknownStore(ObjectStoreId(4)))
        ));
    }

    #[test]
    fn test_duplicate_identifier_refused() {
        let mut registry = StoreRegistry::new();
        registry
            .register(MemoryObjectStore::new(StoreConfig::new(1, "a")).unwrap())
            .unwrap();
        let err = registry
            .register(MemoryObjectStore::new(StoreConfig::new(1, "b")).unwrap())
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert_eq!(registry.len(), 1);
    }
}
