//! Structural hash-consing cache for driver objects.
//!
//! The table holds weak references only. Each cached object carries a
//! [`Registration`] and removes its own entry from `Drop`, so an entry lives
//! exactly as long as some holder keeps the object alive.
//!
//! Lookups trust the 64-bit hash. Two structurally different requests that
//! collide resolve to the same object unless `verify_hits` is enabled, in
//! which case the stored descriptor is compared and a collision is reported.

use std::sync::{Arc, Weak};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, error, trace};

use gpurt_core::{Result, RuntimeError};

/// An object that can live in an [`ObjectCache`].
pub trait Cached: Send + Sync + 'static {
    /// Full structural description; compared on hit when verification is on.
    type Desc: PartialEq;

    /// Kind name used in logs and collision errors.
    const KIND: &'static str;

    fn desc(&self) -> &Self::Desc;
}

type Table<T> = DashMap<u64, Weak<T>>;

/// Back-reference from a cached object to the table that indexes it.
pub struct Registration<T> {
    hash: u64,
    table: Weak<Table<T>>,
}

impl<T> Registration<T> {
    /// Registration for an object that is not indexed by any cache.
    pub fn detached(hash: u64) -> Self {
        Self {
            hash,
            table: Weak::new(),
        }
    }

    pub fn hash(&self) -> u64 {
        self.hash
    }

    /// Remove the table entry if it still refers to `object`. Called once, from
    /// the object's `Drop`, before the driver handle is destroyed.
    pub fn unregister(&self, object: &T) {
        let Some(table) = self.table.upgrade() else {
            return;
        };
        let removed = table.remove_if(&self.hash, |_, weak| {
            std::ptr::eq(weak.as_ptr(), object as *const T)
        });
        if removed.is_some() {
            trace!(hash = self.hash, "cache entry unregistered");
        }
    }
}

pub struct ObjectCache<T: Cached> {
    table: Arc<Table<T>>,
    verify_hits: bool,
}

enum Lookup<T> {
    Hit(Arc<T>),
    Created(Arc<T>),
}

impl<T: Cached> ObjectCache<T> {
    pub fn new(verify_hits: bool) -> Self {
        Self {
            table: Arc::new(DashMap::new()),
            verify_hits,
        }
    }

    /// Return the live object for `hash`, or build one with `factory` and
    /// index it. The factory must construct the object as its final step: the
    /// table entry is locked while it runs.
    pub fn get_or_create<F>(&self, hash: u64, desc: &T::Desc, factory: F) -> Result<Arc<T>>
    where
        F: FnOnce(Registration<T>) -> Result<T>,
    {
        if let Some(existing) = self.get(hash) {
            return self.checked_hit(hash, desc, existing);
        }

        let registration = Registration {
            hash,
            table: Arc::downgrade(&self.table),
        };

        let lookup = match self.table.entry(hash) {
            Entry::Occupied(mut entry) => match entry.get().upgrade() {
                Some(existing) => Lookup::Hit(existing),
                None => {
                    let object = Arc::new(factory(registration)?);
                    entry.insert(Arc::downgrade(&object));
                    Lookup::Created(object)
                }
            },
            Entry::Vacant(entry) => {
                let object = Arc::new(factory(registration)?);
                entry.insert(Arc::downgrade(&object));
                Lookup::Created(object)
            }
        };

        match lookup {
            Lookup::Hit(existing) => self.checked_hit(hash, desc, existing),
            Lookup::Created(object) => {
                debug!(kind = T::KIND, hash, "cache miss, created object");
                Ok(object)
            }
        }
    }

    fn checked_hit(&self, hash: u64, desc: &T::Desc, existing: Arc<T>) -> Result<Arc<T>> {
        if self.verify_hits && existing.desc() != desc {
            error!(kind = T::KIND, hash, "structural hash collision");
            return Err(RuntimeError::HashCollision {
                kind: T::KIND,
                hash,
            });
        }
        trace!(kind = T::KIND, hash, "cache hit");
        Ok(existing)
    }

    /// Look up a live object without creating one.
    pub fn get(&self, hash: u64) -> Option<Arc<T>> {
        self.table.get(&hash).and_then(|entry| entry.value().upgrade())
    }

    /// Number of live cached objects.
    pub fn len(&self) -> usize {
        self.table
            .iter()
            .filter(|entry| entry.value().strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn verify_hits(&self) -> bool {
        self.verify_hits
    }
}
