//! Pool that hands out resource binding instances.
//!
//! The pool owns the driver descriptor pool, the content-hash registry of
//! cached instances and a weak list of every live instance so that `reset`
//! can invalidate them in place.
//!
//! Lock order: an instance's state lock may be held while taking the pool
//! state lock or touching the registry. The pool never holds its own locks
//! while locking an instance.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use ash::vk;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use gpurt_core::config::BindingPoolConfig;
use gpurt_core::{Result, RuntimeError};

use crate::binding::{InstanceInner, ResourceBindingInstance};
use crate::driver::Driver;
use crate::layout::DescriptorSetLayout;

pub(crate) struct PoolState {
    pub(crate) handle: vk::DescriptorPool,
    pub(crate) destroyed: bool,
    /// Live instances counted against `max_sets`.
    pub(crate) reserved: u32,
}

pub(crate) struct PoolShared {
    pub(crate) driver: Arc<dyn Driver>,
    pub(crate) max_sets: u32,
    pub(crate) state: Mutex<PoolState>,
    pub(crate) registry: DashMap<u64, Weak<InstanceInner>>,
    instances: Mutex<Vec<Weak<InstanceInner>>>,
    next_id: AtomicU64,
}

impl PoolShared {
    /// Allocate a driver set for `layout`. Fails with `PoolDestroyed` once
    /// the pool is gone.
    pub(crate) fn allocate_set(&self, layout: &DescriptorSetLayout) -> Result<vk::DescriptorSet> {
        let state = self.state.lock();
        if state.destroyed {
            return Err(RuntimeError::PoolDestroyed);
        }
        let set = self
            .driver
            .allocate_descriptor_set(state.handle, layout.handle())
            .map_err(|e| {
                warn!(result = ?e, "descriptor set allocation failed");
                RuntimeError::driver("allocate_descriptor_sets", e)
            })?;
        Ok(set)
    }

    pub(crate) fn check_alive(&self) -> Result<()> {
        if self.state.lock().destroyed {
            Err(RuntimeError::PoolDestroyed)
        } else {
            Ok(())
        }
    }

    /// Return a set and the instance's reservation to the pool.
    pub(crate) fn release(&self, set: Option<vk::DescriptorSet>) {
        let mut state = self.state.lock();
        if state.destroyed {
            return;
        }
        state.reserved = state.reserved.saturating_sub(1);
        if let Some(set) = set {
            if let Err(e) = self.driver.free_descriptor_set(state.handle, set) {
                warn!(result = ?e, "failed to free descriptor set");
            }
        }
    }

    fn live_instances(&self) -> Vec<Arc<InstanceInner>> {
        let mut instances = self.instances.lock();
        instances.retain(|weak| weak.strong_count() > 0);
        instances.iter().filter_map(Weak::upgrade).collect()
    }
}

/// Allocates [`ResourceBindingInstance`]s and indexes the cached ones by
/// content hash.
pub struct ResourceBindingPool {
    shared: Arc<PoolShared>,
}

impl ResourceBindingPool {
    pub(crate) fn new(driver: &Arc<dyn Driver>, config: &BindingPoolConfig) -> Result<Self> {
        let sizes = config.driver_pool_sizes();
        let handle = driver
            .create_descriptor_pool(config.max_sets, &sizes)
            .map_err(|e| RuntimeError::driver("create_descriptor_pool", e))?;
        debug!(max_sets = config.max_sets, kinds = sizes.len(), "created binding pool");
        Ok(Self {
            shared: Arc::new(PoolShared {
                driver: Arc::clone(driver),
                max_sets: config.max_sets,
                state: Mutex::new(PoolState {
                    handle,
                    destroyed: false,
                    reserved: 0,
                }),
                registry: DashMap::new(),
                instances: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
        })
    }

    /// Create an empty instance for `layout`. No driver set is allocated
    /// until the first write.
    pub fn allocate(&self, layout: &Arc<DescriptorSetLayout>) -> Result<ResourceBindingInstance> {
        {
            let mut state = self.shared.state.lock();
            if state.destroyed {
                return Err(RuntimeError::PoolDestroyed);
            }
            if state.reserved >= self.shared.max_sets {
                warn!(max_sets = self.shared.max_sets, "binding pool exhausted");
                return Err(RuntimeError::PoolExhausted {
                    max_sets: self.shared.max_sets,
                });
            }
            state.reserved += 1;
        }

        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let instance = ResourceBindingInstance::new(id, Arc::clone(layout), Arc::clone(&self.shared));
        let mut instances = self.shared.instances.lock();
        instances.push(instance.downgrade());
        // Live instances never exceed max_sets; sweep dropped ones in bulk.
        if instances.len() > 2 * self.shared.max_sets as usize {
            instances.retain(|weak| weak.strong_count() > 0);
            trace!(tracked = instances.len(), "swept dropped binding instances");
        }
        drop(instances);
        Ok(instance)
    }

    /// Live cached instance whose content hash is `hash`, if any.
    pub fn find_cached(&self, hash: u64) -> Option<ResourceBindingInstance> {
        let inner = self.shared.registry.get(&hash).and_then(|e| e.value().upgrade())?;
        Some(ResourceBindingInstance::from_inner(inner))
    }

    /// Number of live instances in the content registry.
    pub fn cached_count(&self) -> usize {
        self.shared
            .registry
            .iter()
            .filter(|e| e.value().strong_count() > 0)
            .count()
    }

    /// Live instances allocated from this pool.
    pub fn live_count(&self) -> usize {
        self.shared.state.lock().reserved as usize
    }

    /// Instances the pool still tracks for `reset`, including dropped ones
    /// not yet swept. Never more than twice `max_sets`.
    pub fn tracked_count(&self) -> usize {
        self.shared.instances.lock().len()
    }

    pub fn max_sets(&self) -> u32 {
        self.shared.max_sets
    }

    pub fn is_destroyed(&self) -> bool {
        self.shared.state.lock().destroyed
    }

    pub fn handle(&self) -> vk::DescriptorPool {
        self.shared.state.lock().handle
    }

    /// Reclaim every driver set. Instances stay alive, lose their contents
    /// and cached status, and reallocate lazily on their next write.
    pub fn reset(&self) -> Result<()> {
        {
            let state = self.shared.state.lock();
            if state.destroyed {
                return Err(RuntimeError::PoolDestroyed);
            }
            self.shared
                .driver
                .reset_descriptor_pool(state.handle)
                .map_err(|e| RuntimeError::driver("reset_descriptor_pool", e))?;
        }
        self.shared.registry.clear();

        let instances = self.shared.live_instances();
        for instance in &instances {
            instance.invalidate();
        }
        info!(instances = instances.len(), "binding pool reset");
        Ok(())
    }

    /// Destroy the driver pool. Instances outlive it but every later write
    /// fails with `PoolDestroyed`.
    pub fn destroy(&self) {
        let handle = {
            let mut state = self.shared.state.lock();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
            state.reserved = 0;
            state.handle
        };
        self.shared.driver.destroy_descriptor_pool(handle);
        self.shared.registry.clear();

        let instances = self.shared.live_instances();
        for instance in &instances {
            instance.invalidate();
        }
        debug!(instances = instances.len(), "binding pool destroyed");
    }
}

impl Drop for ResourceBindingPool {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl std::fmt::Debug for ResourceBindingPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("ResourceBindingPool")
            .field("handle", &state.handle)
            .field("max_sets", &self.shared.max_sets)
            .field("reserved", &state.reserved)
            .field("destroyed", &state.destroyed)
            .finish()
    }
}
