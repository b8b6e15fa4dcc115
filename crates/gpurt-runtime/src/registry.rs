//! Caller-owned registry of shared objects.
//!
//! Subsystems that want "create once, share many" semantics for an object
//! (a pipeline set used by several features, for instance) look it up here by
//! name. The registry holds weak references only: the object lives as long as
//! some user keeps it, and the next request after that builds a fresh one.

use std::any::Any;
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tracing::debug;

use gpurt_core::{Result, RuntimeError};

type Entry = Weak<dyn Any + Send + Sync>;

#[derive(Default)]
pub struct SharedRegistry {
    entries: DashMap<String, Entry>,
}

impl SharedRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live object registered under `name`, if it exists and is a `T`.
    pub fn get<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        let object = self.entries.get(name).and_then(|e| e.value().upgrade())?;
        object.downcast::<T>().ok()
    }

    /// Return the live object under `name` or build it with `init`.
    ///
    /// `init` runs without any registry lock held, so it may itself use the
    /// registry. If another caller registers the same name meanwhile, that
    /// object wins and the freshly built one is dropped.
    pub fn get_or_init<T, F>(&self, name: &str, init: F) -> Result<Arc<T>>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> Result<T>,
    {
        if let Some(existing) = self.lookup::<T>(name)? {
            return Ok(existing);
        }

        let created = Arc::new(init()?);
        let as_any: Arc<dyn Any + Send + Sync> = created.clone();

        let winner = {
            let mut entry = self
                .entries
                .entry(name.to_string())
                .or_insert_with(|| Arc::downgrade(&as_any));
            match entry.value().upgrade() {
                Some(live) if !Arc::ptr_eq(&live, &as_any) => Some(live),
                Some(_) => None,
                None => {
                    *entry.value_mut() = Arc::downgrade(&as_any);
                    None
                }
            }
        };

        match winner {
            Some(live) => live.downcast::<T>().map_err(|_| RuntimeError::RegistryTypeMismatch {
                name: name.to_string(),
            }),
            None => {
                debug!(name, "shared object registered");
                Ok(created)
            }
        }
    }

    fn lookup<T: Any + Send + Sync>(&self, name: &str) -> Result<Option<Arc<T>>> {
        let Some(object) = self.entries.get(name).and_then(|e| e.value().upgrade()) else {
            return Ok(None);
        };
        object
            .downcast::<T>()
            .map(Some)
            .map_err(|_| RuntimeError::RegistryTypeMismatch {
                name: name.to_string(),
            })
    }

    /// Drop entries whose objects are gone. Returns how many were removed.
    pub fn purge(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, weak| weak.strong_count() > 0);
        before - self.entries.len()
    }

    /// Names with a live object behind them.
    pub fn live_names(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|e| e.value().strong_count() > 0)
            .map(|e| e.key().clone())
            .collect()
    }
}

impl std::fmt::Debug for SharedRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRegistry")
            .field("entries", &self.entries.len())
            .finish()
    }
}
