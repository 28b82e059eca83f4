//! Tokens: the canonical handle for a stored object.
//!
//! A [`Token`] names an object by its (store, sequence number) identity
//! and is the only way to reach the object's data. Each store keeps an
//! [`IdentityMap`](crate::IdentityMap) so that there is exactly one live
//! token instance per identity; the token in turn weakly references at
//! most one resident [`ManagedObject`].

use crate::error::{Error, Result};
use crate::managed::{ManagedObject, ObjectState};
use crate::traits::ObjectStore;
use crate::types::{ObjectStoreId, StoredObjectId, TokenId};
use parking_lot::RwLock;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Weak};

pub(crate) struct TokenInner {
    id: TokenId,
    store: RwLock<Option<Weak<dyn ObjectStore>>>,
    resident: RwLock<Weak<ManagedObject>>,
}

/// Handle to a stored object.
///
/// Cloning a token is cheap and yields the same instance; use
/// [`Token::ptr_eq`] to check instance identity. Equality and hashing
/// compare the identity only.
#[derive(Clone)]
pub struct Token {
    inner: Arc<TokenInner>,
}

impl Token {
    pub(crate) fn new(id: TokenId, store: Weak<dyn ObjectStore>) -> Token {
        Token {
            inner: Arc::new(TokenInner {
                id,
                store: RwLock::new(Some(store)),
                resident: RwLock::new(Weak::new()),
            }),
        }
    }

    pub(crate) fn downgrade(&self) -> Weak<TokenInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn upgrade(weak: &Weak<TokenInner>) -> Option<Token> {
        weak.upgrade().map(|inner| Token { inner })
    }

    /// The (store, object) identity.
    pub fn id(&self) -> TokenId {
        self.inner.id
    }

    /// Identifier of the owning store.
    pub fn store_id(&self) -> ObjectStoreId {
        self.inner.id.store
    }

    /// Sequence number within the owning store.
    pub fn object_id(&self) -> StoredObjectId {
        self.inner.id.object
    }

    /// Whether two handles are the same instance.
    pub fn ptr_eq(a: &Token, b: &Token) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    /// The owning store, unless the token was invalidated or the store dropped.
    pub fn store(&self) -> Result<Arc<dyn ObjectStore>> {
        self.inner
            .store
            .read()
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or_else(|| Error::InvalidState {
                entity: format!("token {}", self.id()),
                state: "Invalidated".to_string(),
                operation: "use",
            })
    }

    /// Whether the token is still linked to its store.
    pub fn is_valid(&self) -> bool {
        self.store().is_ok()
    }

    /// The resident object, without loading it.
    pub fn resident(&self) -> Option<Arc<ManagedObject>> {
        self.inner.resident.read().upgrade()
    }

    /// The object this token refers to, loading it from the store if it is
    /// not resident.
    ///
    /// Concurrent callers converge on one instance; the store is asked at
    /// most once. Returns `None` if the object was deleted or never stored.
    pub fn get_managed_object(&self) -> Result<Option<Arc<ManagedObject>>> {
        if let Some(object) = self.resident() {
            return Ok(Self::live(object));
        }

        let mut resident = self.inner.resident.write();
        // Another thread may have loaded it while we waited
        if let Some(object) = resident.upgrade() {
            return Ok(Self::live(object));
        }

        let store = self.store()?;
        let Some(payload) = store.load(self.object_id())? else {
            return Ok(None);
        };
        let object = ManagedObject::restored(payload);
        object.bind_token(self.clone())?;
        *resident = Arc::downgrade(&object);
        Ok(Some(object))
    }

    fn live(object: Arc<ManagedObject>) -> Option<Arc<ManagedObject>> {
        if object.state() == ObjectState::Deleted {
            None
        } else {
            Some(object)
        }
    }

    /// Make `object` the resident instance.
    ///
    /// If an instance is already resident it becomes a clone of `object`
    /// in place and is returned, so every existing holder sees the new
    /// contents. Otherwise `object` is adopted and returned.
    pub fn set_managed_object(&self, object: Arc<ManagedObject>) -> Result<Arc<ManagedObject>> {
        let mut resident = self.inner.resident.write();
        if let Some(existing) = resident.upgrade() {
            existing.become_clone_of(&object);
            return Ok(existing);
        }
        object.bind_token(self.clone())?;
        *resident = Arc::downgrade(&object);
        Ok(object)
    }

    /// Sever the link to the store and put any resident object into the
    /// error state. Used when the store closes.
    pub fn invalidate(&self) {
        *self.inner.store.write() = None;
        if let Some(object) = self.resident() {
            object.mark_error();
        }
    }
}

impl PartialEq for Token {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for Token {}

impl Hash for Token {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Token({})", self.inner.id)
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner.id)
    }
}
