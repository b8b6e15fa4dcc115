//! Resource binding instances: host mirrors of descriptor sets.
//!
//! An instance keeps one entry per array element of every layout binding.
//! Entries are written one at a time (`write`), in bulk (`write_batch`), or
//! staged without touching the driver (`set`) and flushed by `update`, which
//! issues one driver write per contiguous run of non-empty entries.
//!
//! Once every entry is populated an instance can be promoted into its pool's
//! content registry with `commit_cached`. Any later change to a cached
//! instance removes it from the registry before the change is applied.

use std::sync::{Arc, Weak};

use ash::vk;
use parking_lot::Mutex;
use tracing::{debug, trace};

use gpurt_core::hash::{combine, combine_unordered, fx_hash};
use gpurt_core::{Result, RuntimeError};

use crate::binding_pool::PoolShared;
use crate::driver::{DescriptorWrite, WritePayload};
use crate::layout::DescriptorSetLayout;

/// Closed set of resource kinds a binding entry can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Sampler,
    CombinedImageSampler,
    Image,
    TexelBufferView,
    Buffer,
}

impl ResourceKind {
    /// Resource kind accepted by a binding of `descriptor_type`.
    pub fn for_descriptor_type(descriptor_type: vk::DescriptorType) -> Option<Self> {
        match descriptor_type {
            vk::DescriptorType::SAMPLER => Some(ResourceKind::Sampler),
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER => Some(ResourceKind::CombinedImageSampler),
            vk::DescriptorType::SAMPLED_IMAGE | vk::DescriptorType::STORAGE_IMAGE => {
                Some(ResourceKind::Image)
            }
            vk::DescriptorType::UNIFORM_TEXEL_BUFFER | vk::DescriptorType::STORAGE_TEXEL_BUFFER => {
                Some(ResourceKind::TexelBufferView)
            }
            vk::DescriptorType::UNIFORM_BUFFER | vk::DescriptorType::STORAGE_BUFFER => {
                Some(ResourceKind::Buffer)
            }
            _ => None,
        }
    }
}

/// A resource reference stored in one binding entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindingResource {
    Sampler(vk::Sampler),
    CombinedImageSampler {
        sampler: vk::Sampler,
        view: vk::ImageView,
        layout: vk::ImageLayout,
    },
    Image {
        view: vk::ImageView,
        layout: vk::ImageLayout,
    },
    TexelBufferView(vk::BufferView),
    Buffer {
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        range: vk::DeviceSize,
    },
}

impl BindingResource {
    /// Sampled image in `SHADER_READ_ONLY_OPTIMAL`.
    pub fn sampled_image(view: vk::ImageView) -> Self {
        BindingResource::Image {
            view,
            layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        }
    }

    /// Storage image in `GENERAL`.
    pub fn storage_image(view: vk::ImageView) -> Self {
        BindingResource::Image {
            view,
            layout: vk::ImageLayout::GENERAL,
        }
    }

    /// The whole of `buffer`.
    pub fn whole_buffer(buffer: vk::Buffer) -> Self {
        BindingResource::Buffer {
            buffer,
            offset: 0,
            range: vk::WHOLE_SIZE,
        }
    }

    pub fn kind(&self) -> ResourceKind {
        match self {
            BindingResource::Sampler(_) => ResourceKind::Sampler,
            BindingResource::CombinedImageSampler { .. } => ResourceKind::CombinedImageSampler,
            BindingResource::Image { .. } => ResourceKind::Image,
            BindingResource::TexelBufferView(_) => ResourceKind::TexelBufferView,
            BindingResource::Buffer { .. } => ResourceKind::Buffer,
        }
    }

    fn payload_class(&self) -> PayloadClass {
        match self {
            BindingResource::Sampler(_)
            | BindingResource::CombinedImageSampler { .. }
            | BindingResource::Image { .. } => PayloadClass::Image,
            BindingResource::TexelBufferView(_) => PayloadClass::TexelBufferView,
            BindingResource::Buffer { .. } => PayloadClass::Buffer,
        }
    }
}

/// One entry of a bulk write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindingWrite {
    pub binding: u32,
    pub element: u32,
    pub resource: BindingResource,
}

impl BindingWrite {
    pub fn new(binding: u32, element: u32, resource: BindingResource) -> Self {
        Self {
            binding,
            element,
            resource,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PayloadClass {
    Image,
    Buffer,
    TexelBufferView,
}

/// Typed info lists reused across every run of one `update` call.
#[derive(Default)]
struct Scratch {
    images: Vec<vk::DescriptorImageInfo>,
    buffers: Vec<vk::DescriptorBufferInfo>,
    texel_views: Vec<vk::BufferView>,
}

impl Scratch {
    fn push(&mut self, resource: &BindingResource) {
        match *resource {
            BindingResource::Sampler(sampler) => self.images.push(vk::DescriptorImageInfo {
                sampler,
                image_view: vk::ImageView::null(),
                image_layout: vk::ImageLayout::UNDEFINED,
            }),
            BindingResource::CombinedImageSampler {
                sampler,
                view,
                layout,
            } => self.images.push(vk::DescriptorImageInfo {
                sampler,
                image_view: view,
                image_layout: layout,
            }),
            BindingResource::Image { view, layout } => self.images.push(vk::DescriptorImageInfo {
                sampler: vk::Sampler::null(),
                image_view: view,
                image_layout: layout,
            }),
            BindingResource::TexelBufferView(view) => self.texel_views.push(view),
            BindingResource::Buffer {
                buffer,
                offset,
                range,
            } => self.buffers.push(vk::DescriptorBufferInfo {
                buffer,
                offset,
                range,
            }),
        }
    }

    fn payload(&self, class: PayloadClass) -> WritePayload<'_> {
        match class {
            PayloadClass::Image => WritePayload::Images(&self.images),
            PayloadClass::Buffer => WritePayload::Buffers(&self.buffers),
            PayloadClass::TexelBufferView => WritePayload::TexelBufferViews(&self.texel_views),
        }
    }

    fn clear(&mut self) {
        self.images.clear();
        self.buffers.clear();
        self.texel_views.clear();
    }
}

#[derive(Debug, Clone)]
struct ArrayBinding {
    descriptor_type: vk::DescriptorType,
    entries: Vec<Option<BindingResource>>,
}

struct InstanceState {
    set: Option<vk::DescriptorSet>,
    bindings: Vec<ArrayBinding>,
    /// Entries changed by `set` and not yet flushed.
    staged: bool,
    cached_hash: Option<u64>,
    /// Reinsert into the registry after the next flush.
    recache: bool,
}

impl InstanceState {
    fn empty(layout: &DescriptorSetLayout) -> Self {
        Self {
            set: None,
            bindings: layout
                .bindings()
                .iter()
                .map(|b| ArrayBinding {
                    descriptor_type: b.descriptor_type,
                    entries: vec![None; b.count as usize],
                })
                .collect(),
            staged: false,
            cached_hash: None,
            recache: false,
        }
    }

    fn first_empty(&self) -> Option<(u32, u32)> {
        self.bindings.iter().enumerate().find_map(|(b, array)| {
            array
                .entries
                .iter()
                .position(Option::is_none)
                .map(|e| (b as u32, e as u32))
        })
    }

    fn content_hash(&self, layout_hash: u64) -> Result<u64> {
        if let Some((binding, element)) = self.first_empty() {
            return Err(RuntimeError::IncompleteBinding { binding, element });
        }
        let per_binding = self
            .bindings
            .iter()
            .enumerate()
            .map(|(index, array)| fx_hash(&(index as u32, array.descriptor_type, &array.entries)));
        Ok(combine(layout_hash, combine_unordered(per_binding)))
    }

    fn validate(&self, binding: u32, element: u32, resource: &BindingResource) -> Result<()> {
        let array = self
            .bindings
            .get(binding as usize)
            .ok_or(RuntimeError::BindingOutOfRange {
                binding,
                bindings: self.bindings.len() as u32,
            })?;
        if element as usize >= array.entries.len() {
            return Err(RuntimeError::ElementOutOfRange {
                binding,
                element,
                count: array.entries.len() as u32,
            });
        }
        if ResourceKind::for_descriptor_type(array.descriptor_type) != Some(resource.kind()) {
            return Err(RuntimeError::ResourceMismatch {
                binding,
                descriptor_type: array.descriptor_type,
            });
        }
        Ok(())
    }
}

pub(crate) struct InstanceInner {
    id: u64,
    layout: Arc<DescriptorSetLayout>,
    pool: Arc<PoolShared>,
    state: Mutex<InstanceState>,
}

impl InstanceInner {
    /// Drop driver contents after a pool reset or destroy.
    pub(crate) fn invalidate(&self) {
        let mut state = self.state.lock();
        *state = InstanceState::empty(&self.layout);
        trace!(instance = self.id, "binding instance invalidated");
    }

    fn ensure_set(&self, state: &mut InstanceState) -> Result<vk::DescriptorSet> {
        match state.set {
            Some(set) => Ok(set),
            None => {
                let set = self.pool.allocate_set(&self.layout)?;
                trace!(instance = self.id, set = ?set, "descriptor set allocated");
                state.set = Some(set);
                Ok(set)
            }
        }
    }

    /// Remove from the content registry ahead of a change.
    fn uncache(&self, state: &mut InstanceState) -> bool {
        let Some(hash) = state.cached_hash.take() else {
            return false;
        };
        let me: *const InstanceInner = self;
        self.pool
            .registry
            .remove_if(&hash, |_, weak| std::ptr::eq(weak.as_ptr(), me));
        true
    }

    fn register(self: &Arc<Self>, state: &mut InstanceState) -> Result<u64> {
        let hash = state.content_hash(self.layout.hash())?;
        match self.pool.registry.entry(hash) {
            dashmap::mapref::entry::Entry::Occupied(mut entry) => {
                let other = entry.get();
                if other.strong_count() > 0 && !std::ptr::eq(other.as_ptr(), Arc::as_ptr(self)) {
                    return Err(RuntimeError::DuplicateContent { hash });
                }
                entry.insert(Arc::downgrade(self));
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(Arc::downgrade(self));
            }
        }
        state.cached_hash = Some(hash);
        Ok(hash)
    }

    fn recache(self: &Arc<Self>, state: &mut InstanceState) {
        match self.register(state) {
            Ok(hash) => trace!(instance = self.id, hash, "binding instance recached"),
            Err(e) => debug!(instance = self.id, "binding instance left uncached: {}", e),
        }
    }

    fn write_one(
        &self,
        set: vk::DescriptorSet,
        binding: u32,
        element: u32,
        descriptor_type: vk::DescriptorType,
        resource: &BindingResource,
    ) {
        let mut scratch = Scratch::default();
        scratch.push(resource);
        self.pool.driver.write_descriptors(&DescriptorWrite {
            set,
            binding,
            first_element: element,
            descriptor_type,
            payload: scratch.payload(resource.payload_class()),
        });
    }

    /// Flush every non-empty run of every binding array. Returns the number
    /// of driver write calls issued.
    fn flush(&self, state: &mut InstanceState) -> Result<usize> {
        let set = self.ensure_set(state)?;
        let mut scratch = Scratch::default();
        let mut writes = 0;

        for (binding, array) in state.bindings.iter().enumerate() {
            let entries = &array.entries;
            let mut i = 0;
            while i < entries.len() {
                let Some(first) = entries[i] else {
                    i += 1;
                    continue;
                };
                let class = first.payload_class();
                let start = i;
                while let Some(Some(resource)) = entries.get(i) {
                    if resource.payload_class() != class {
                        break;
                    }
                    scratch.push(resource);
                    i += 1;
                }
                self.pool.driver.write_descriptors(&DescriptorWrite {
                    set,
                    binding: binding as u32,
                    first_element: start as u32,
                    descriptor_type: array.descriptor_type,
                    payload: scratch.payload(class),
                });
                scratch.clear();
                writes += 1;
            }
        }

        state.staged = false;
        Ok(writes)
    }
}

impl Drop for InstanceInner {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        let cached_hash = state.cached_hash.take();
        let set = state.set.take();
        if let Some(hash) = cached_hash {
            let me: *const InstanceInner = self;
            self.pool
                .registry
                .remove_if(&hash, |_, weak| std::ptr::eq(weak.as_ptr(), me));
        }
        self.pool.release(set);
    }
}

/// Shared handle to one binding instance. Clones refer to the same instance;
/// the descriptor set is released when the last clone drops.
#[derive(Clone)]
pub struct ResourceBindingInstance {
    inner: Arc<InstanceInner>,
}

impl ResourceBindingInstance {
    pub(crate) fn new(id: u64, layout: Arc<DescriptorSetLayout>, pool: Arc<PoolShared>) -> Self {
        let state = InstanceState::empty(&layout);
        Self {
            inner: Arc::new(InstanceInner {
                id,
                layout,
                pool,
                state: Mutex::new(state),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<InstanceInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<InstanceInner> {
        Arc::downgrade(&self.inner)
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn layout(&self) -> &Arc<DescriptorSetLayout> {
        &self.inner.layout
    }

    /// Write one entry and apply it to the driver set immediately, allocating
    /// the set on first use. Rewriting an entry with the same resource is a
    /// no-op.
    pub fn write(&self, binding: u32, element: u32, resource: BindingResource) -> Result<()> {
        self.inner.pool.check_alive()?;
        let mut state = self.inner.state.lock();
        state.validate(binding, element, &resource)?;

        let current = state.bindings[binding as usize].entries[element as usize];
        if current == Some(resource) && state.set.is_some() && !state.staged {
            trace!(instance = self.inner.id, binding, element, "identical write elided");
            return Ok(());
        }

        let set = self.inner.ensure_set(&mut state)?;
        let was_cached = self.inner.uncache(&mut state);

        let array = &mut state.bindings[binding as usize];
        array.entries[element as usize] = Some(resource);
        let descriptor_type = array.descriptor_type;
        self.inner
            .write_one(set, binding, element, descriptor_type, &resource);

        if was_cached {
            self.inner.recache(&mut state);
        }
        Ok(())
    }

    /// Apply a list of writes, one driver call per entry. The whole list is
    /// validated before anything is applied.
    pub fn write_batch(&self, writes: &[BindingWrite]) -> Result<()> {
        self.inner.pool.check_alive()?;
        let mut state = self.inner.state.lock();
        for w in writes {
            state.validate(w.binding, w.element, &w.resource)?;
        }
        if writes.is_empty() {
            return Ok(());
        }

        let set = self.inner.ensure_set(&mut state)?;
        let was_cached = self.inner.uncache(&mut state);
        let staged = state.staged;

        for w in writes {
            let array = &mut state.bindings[w.binding as usize];
            let slot = &mut array.entries[w.element as usize];
            if *slot == Some(w.resource) && !staged {
                continue;
            }
            *slot = Some(w.resource);
            let descriptor_type = array.descriptor_type;
            self.inner
                .write_one(set, w.binding, w.element, descriptor_type, &w.resource);
        }

        if was_cached {
            self.inner.recache(&mut state);
        }
        Ok(())
    }

    /// Stage an entry without a driver call; `update` applies it.
    pub fn set(&self, binding: u32, element: u32, resource: BindingResource) -> Result<()> {
        self.inner.pool.check_alive()?;
        let mut state = self.inner.state.lock();
        state.validate(binding, element, &resource)?;
        if state.bindings[binding as usize].entries[element as usize] == Some(resource) {
            return Ok(());
        }
        if self.inner.uncache(&mut state) {
            state.recache = true;
        }
        state.bindings[binding as usize].entries[element as usize] = Some(resource);
        state.staged = true;
        Ok(())
    }

    /// Clear an entry. The driver set keeps its old descriptor until the
    /// entry is written again; a cleared instance cannot be cached.
    pub fn clear(&self, binding: u32, element: u32) -> Result<()> {
        self.inner.pool.check_alive()?;
        let mut state = self.inner.state.lock();
        let count = state
            .bindings
            .get(binding as usize)
            .map(|a| a.entries.len() as u32)
            .ok_or(RuntimeError::BindingOutOfRange {
                binding,
                bindings: state.bindings.len() as u32,
            })?;
        if element >= count {
            return Err(RuntimeError::ElementOutOfRange {
                binding,
                element,
                count,
            });
        }
        self.inner.uncache(&mut state);
        state.recache = false;
        state.bindings[binding as usize].entries[element as usize] = None;
        Ok(())
    }

    /// Re-synchronize the whole driver set from the host entries. Issues one
    /// write per maximal contiguous run of non-empty entries and returns the
    /// number of writes issued.
    pub fn update(&self) -> Result<usize> {
        self.inner.pool.check_alive()?;
        let mut state = self.inner.state.lock();
        let writes = self.inner.flush(&mut state)?;
        if std::mem::take(&mut state.recache) {
            self.inner.recache(&mut state);
        }
        debug!(instance = self.inner.id, writes, "binding instance updated");
        Ok(writes)
    }

    /// Promote the instance into its pool's content registry. Fails with
    /// `IncompleteBinding` while any entry is empty, and with
    /// `DuplicateContent` when another live instance already holds the same
    /// content; the instance stays usable, uncached, in both cases.
    pub fn commit_cached(&self) -> Result<u64> {
        self.inner.pool.check_alive()?;
        let mut state = self.inner.state.lock();
        if let Some(hash) = state.cached_hash {
            return Ok(hash);
        }
        if let Some((binding, element)) = state.first_empty() {
            return Err(RuntimeError::IncompleteBinding { binding, element });
        }
        if state.staged || state.set.is_none() {
            self.inner.flush(&mut state)?;
        }
        state.recache = false;
        let hash = self.inner.register(&mut state)?;
        debug!(instance = self.inner.id, hash, "binding instance cached");
        Ok(hash)
    }

    /// Content hash of a fully populated instance.
    pub fn content_hash(&self) -> Result<u64> {
        let state = self.inner.state.lock();
        state.content_hash(self.inner.layout.hash())
    }

    pub fn is_cached(&self) -> bool {
        self.inner.state.lock().cached_hash.is_some()
    }

    pub fn is_complete(&self) -> bool {
        self.inner.state.lock().first_empty().is_none()
    }

    /// Entries staged with `set` that `update` has not flushed yet.
    pub fn has_staged(&self) -> bool {
        self.inner.state.lock().staged
    }

    pub fn descriptor_set(&self) -> Option<vk::DescriptorSet> {
        self.inner.state.lock().set
    }

    pub fn entry(&self, binding: u32, element: u32) -> Option<BindingResource> {
        let state = self.inner.state.lock();
        state
            .bindings
            .get(binding as usize)
            .and_then(|a| a.entries.get(element as usize).copied().flatten())
    }

    /// Descriptor set ready for binding: staged entries are flushed first.
    pub(crate) fn bindable_set(&self) -> Result<vk::DescriptorSet> {
        self.inner.pool.check_alive()?;
        let mut state = self.inner.state.lock();
        if state.staged {
            self.inner.flush(&mut state)?;
            if std::mem::take(&mut state.recache) {
                self.inner.recache(&mut state);
            }
        }
        state.set.ok_or(RuntimeError::Unallocated)
    }

    pub fn same_instance(&self, other: &ResourceBindingInstance) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for ResourceBindingInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("ResourceBindingInstance")
            .field("id", &self.inner.id)
            .field("set", &state.set)
            .field("cached_hash", &state.cached_hash)
            .field("staged", &state.staged)
            .finish()
    }
}
