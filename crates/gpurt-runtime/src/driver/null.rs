//! Host-only driver.
//!
//! Mints opaque handles, records every command per command buffer, enforces
//! descriptor pool capacity and simulates fence completion. Binary semaphores
//! are tracked so that signaling one that is already signaled is rejected.
//! Nothing executes; the recorded state is there to be inspected.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use ash::prelude::VkResult;
use ash::vk::{self, Handle};
use dashmap::DashMap;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use super::{DescriptorWrite, Driver, QueueSubmit};
use crate::layout::{LayoutBinding, PushConstantRange};
use crate::pipeline::PipelineDesc;
use crate::render_target::{Rect, RenderTargets, Viewport};
use crate::sampler::SamplerDesc;

/// How submitted fences become signaled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Signaled once this much time has passed since submission.
    Latency(Duration),
    /// Signaled only by [`NullDriver::complete_fence`] or [`NullDriver::complete_all`].
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    ShaderModule,
    DescriptorSetLayout,
    PipelineLayout,
    Pipeline,
    Sampler,
    DescriptorPool,
    DescriptorSet,
    Fence,
    Semaphore,
    CommandBuffer,
}

/// A command as recorded into a null command buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCommand {
    BindPipeline {
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    },
    BindVertexBuffers {
        first_binding: u32,
        buffers: Vec<vk::Buffer>,
        offsets: Vec<vk::DeviceSize>,
    },
    BindIndexBuffer {
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        index_type: vk::IndexType,
    },
    SetViewport(Viewport),
    SetScissor(Rect),
    PushConstants {
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: Vec<u8>,
    },
    BindDescriptorSet {
        bind_point: vk::PipelineBindPoint,
        set_index: u32,
        set: vk::DescriptorSet,
    },
    BeginRendering(RenderTargets),
    EndRendering,
    Draw {
        vertex_count: u32,
        instance_count: u32,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
    },
    DrawMeshTasks {
        x: u32,
        y: u32,
        z: u32,
    },
    Dispatch {
        x: u32,
        y: u32,
        z: u32,
    },
}

/// One recorded `write_descriptors` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteRecord {
    pub set: vk::DescriptorSet,
    pub binding: u32,
    pub first_element: u32,
    pub count: u32,
    pub descriptor_type: vk::DescriptorType,
}

#[derive(Debug)]
struct FenceState {
    signaled: bool,
    submitted_at: Option<Instant>,
}

#[derive(Debug)]
struct PoolState {
    max_sets: u32,
    capacity: FxHashMap<vk::DescriptorType, u32>,
    used: FxHashMap<vk::DescriptorType, u32>,
    sets: Vec<vk::DescriptorSet>,
}

pub struct NullDriver {
    completion: Completion,
    mesh_tasks: bool,
    next_handle: AtomicU64,
    device_lost: AtomicBool,
    fences: DashMap<u64, FenceState>,
    /// Signaled, or with a signal queued and no wait submitted since.
    semaphores: DashMap<u64, bool>,
    pools: DashMap<u64, PoolState>,
    /// Descriptor usage per layout, keyed by layout handle.
    layouts: DashMap<u64, Vec<(vk::DescriptorType, u32)>>,
    /// Owning pool and layout of each allocated set.
    sets: DashMap<u64, (u64, u64)>,
    commands: DashMap<u64, Vec<RecordedCommand>>,
    writes: Mutex<Vec<WriteRecord>>,
    created: DashMap<ObjectKind, usize>,
    destroyed: DashMap<ObjectKind, usize>,
    submits: AtomicUsize,
}

impl NullDriver {
    pub fn new(completion: Completion) -> Self {
        Self {
            completion,
            mesh_tasks: true,
            // Start well away from VK_NULL_HANDLE
            next_handle: AtomicU64::new(0x1000),
            device_lost: AtomicBool::new(false),
            fences: DashMap::new(),
            semaphores: DashMap::new(),
            pools: DashMap::new(),
            layouts: DashMap::new(),
            sets: DashMap::new(),
            commands: DashMap::new(),
            writes: Mutex::new(Vec::new()),
            created: DashMap::new(),
            destroyed: DashMap::new(),
            submits: AtomicUsize::new(0),
        }
    }

    /// Fences signal as soon as they are queried after submission.
    pub fn immediate() -> Self {
        Self::new(Completion::Latency(Duration::ZERO))
    }

    pub fn manual() -> Self {
        Self::new(Completion::Manual)
    }

    /// Report no mesh shading support.
    pub fn without_mesh_tasks(mut self) -> Self {
        self.mesh_tasks = false;
        self
    }

    pub fn completion(&self) -> Completion {
        self.completion
    }

    fn mint<H: Handle>(&self, kind: ObjectKind) -> H {
        let raw = self.next_handle.fetch_add(1, Ordering::Relaxed);
        *self.created.entry(kind).or_insert(0) += 1;
        H::from_raw(raw)
    }

    fn retire(&self, kind: ObjectKind, raw: u64) {
        if raw == 0 {
            return;
        }
        *self.destroyed.entry(kind).or_insert(0) += 1;
    }

    fn check_device(&self) -> VkResult<()> {
        if self.device_lost.load(Ordering::Acquire) {
            Err(vk::Result::ERROR_DEVICE_LOST)
        } else {
            Ok(())
        }
    }

    fn record(&self, command_buffer: vk::CommandBuffer, command: RecordedCommand) {
        if let Some(mut list) = self.commands.get_mut(&command_buffer.as_raw()) {
            trace!(command_buffer = command_buffer.as_raw(), ?command, "record");
            list.push(command);
        }
    }

    fn poll_fence(&self, state: &mut FenceState) -> bool {
        if !state.signaled {
            if let (Completion::Latency(latency), Some(at)) = (self.completion, state.submitted_at) {
                if at.elapsed() >= latency {
                    state.signaled = true;
                }
            }
        }
        state.signaled
    }

    // ── Inspection ──────────────────────────────────────────

    /// Number of objects of `kind` created so far.
    pub fn created(&self, kind: ObjectKind) -> usize {
        self.created.get(&kind).map(|c| *c).unwrap_or(0)
    }

    pub fn destroyed(&self, kind: ObjectKind) -> usize {
        self.destroyed.get(&kind).map(|c| *c).unwrap_or(0)
    }

    /// Objects of `kind` created and not yet destroyed.
    pub fn live(&self, kind: ObjectKind) -> usize {
        self.created(kind).saturating_sub(self.destroyed(kind))
    }

    /// Commands recorded into `command_buffer` since its last begin or reset.
    pub fn commands(&self, command_buffer: vk::CommandBuffer) -> Vec<RecordedCommand> {
        self.commands
            .get(&command_buffer.as_raw())
            .map(|list| list.value().clone())
            .unwrap_or_default()
    }

    /// Every descriptor write call since the last [`take_writes`](Self::take_writes).
    pub fn writes(&self) -> Vec<WriteRecord> {
        self.writes.lock().clone()
    }

    pub fn take_writes(&self) -> Vec<WriteRecord> {
        std::mem::take(&mut *self.writes.lock())
    }

    pub fn semaphore_signaled(&self, semaphore: vk::Semaphore) -> bool {
        self.semaphores
            .get(&semaphore.as_raw())
            .map(|s| *s)
            .unwrap_or(false)
    }

    pub fn submit_count(&self) -> usize {
        self.submits.load(Ordering::Relaxed)
    }

    /// Descriptor sets currently allocated from `pool`.
    pub fn allocated_sets(&self, pool: vk::DescriptorPool) -> usize {
        self.pools
            .get(&pool.as_raw())
            .map(|p| p.sets.len())
            .unwrap_or(0)
    }

    // ── Completion control ──────────────────────────────────

    /// Signal one submitted fence. Returns false if it was not in flight.
    pub fn complete_fence(&self, fence: vk::Fence) -> bool {
        match self.fences.get_mut(&fence.as_raw()) {
            Some(mut state) if state.submitted_at.is_some() && !state.signaled => {
                state.signaled = true;
                true
            }
            _ => false,
        }
    }

    /// Signal every in-flight fence. Returns how many were signaled.
    pub fn complete_all(&self) -> usize {
        let mut completed = 0;
        for mut state in self.fences.iter_mut() {
            if state.submitted_at.is_some() && !state.signaled {
                state.signaled = true;
                completed += 1;
            }
        }
        debug!(completed, "null driver completed in-flight fences");
        completed
    }

    /// Simulate device loss: fence queries and submissions fail from now on.
    pub fn set_device_lost(&self, lost: bool) {
        self.device_lost.store(lost, Ordering::Release);
    }
}

impl Default for NullDriver {
    fn default() -> Self {
        Self::immediate()
    }
}

impl std::fmt::Debug for NullDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NullDriver")
            .field("completion", &self.completion)
            .field("submits", &self.submit_count())
            .finish()
    }
}

impl Driver for NullDriver {
    fn name(&self) -> &str {
        "null"
    }

    fn supports_mesh_tasks(&self) -> bool {
        self.mesh_tasks
    }

    fn create_shader_module(&self, code: &[u32]) -> VkResult<vk::ShaderModule> {
        if code.is_empty() {
            return Err(vk::Result::ERROR_INITIALIZATION_FAILED);
        }
        Ok(self.mint(ObjectKind::ShaderModule))
    }

    fn destroy_shader_module(&self, module: vk::ShaderModule) {
        self.retire(ObjectKind::ShaderModule, module.as_raw());
    }

    fn create_descriptor_set_layout(
        &self,
        bindings: &[LayoutBinding],
    ) -> VkResult<vk::DescriptorSetLayout> {
        let layout: vk::DescriptorSetLayout = self.mint(ObjectKind::DescriptorSetLayout);
        let usage = bindings
            .iter()
            .map(|b| (b.descriptor_type, b.count))
            .collect();
        self.layouts.insert(layout.as_raw(), usage);
        Ok(layout)
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        self.layouts.remove(&layout.as_raw());
        self.retire(ObjectKind::DescriptorSetLayout, layout.as_raw());
    }

    fn create_pipeline_layout(
        &self,
        _set_layouts: &[vk::DescriptorSetLayout],
        _push_constants: &[PushConstantRange],
    ) -> VkResult<vk::PipelineLayout> {
        Ok(self.mint(ObjectKind::PipelineLayout))
    }

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        self.retire(ObjectKind::PipelineLayout, layout.as_raw());
    }

    fn create_pipeline(&self, desc: &PipelineDesc) -> VkResult<vk::Pipeline> {
        if desc.stages.is_empty() {
            return Err(vk::Result::ERROR_INITIALIZATION_FAILED);
        }
        Ok(self.mint(ObjectKind::Pipeline))
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        self.retire(ObjectKind::Pipeline, pipeline.as_raw());
    }

    fn create_sampler(&self, _desc: &SamplerDesc) -> VkResult<vk::Sampler> {
        Ok(self.mint(ObjectKind::Sampler))
    }

    fn destroy_sampler(&self, sampler: vk::Sampler) {
        self.retire(ObjectKind::Sampler, sampler.as_raw());
    }

    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        sizes: &[vk::DescriptorPoolSize],
    ) -> VkResult<vk::DescriptorPool> {
        let pool: vk::DescriptorPool = self.mint(ObjectKind::DescriptorPool);
        let mut capacity = FxHashMap::default();
        for size in sizes {
            *capacity.entry(size.ty).or_insert(0) += size.descriptor_count;
        }
        self.pools.insert(
            pool.as_raw(),
            PoolState {
                max_sets,
                capacity,
                used: FxHashMap::default(),
                sets: Vec::new(),
            },
        );
        Ok(pool)
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        if let Some((_, state)) = self.pools.remove(&pool.as_raw()) {
            for set in state.sets {
                self.sets.remove(&set.as_raw());
                self.retire(ObjectKind::DescriptorSet, set.as_raw());
            }
        }
        self.retire(ObjectKind::DescriptorPool, pool.as_raw());
    }

    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> VkResult<()> {
        let mut state = self
            .pools
            .get_mut(&pool.as_raw())
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        for set in state.sets.drain(..) {
            self.sets.remove(&set.as_raw());
            self.retire(ObjectKind::DescriptorSet, set.as_raw());
        }
        state.used.clear();
        Ok(())
    }

    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> VkResult<vk::DescriptorSet> {
        let usage = self
            .layouts
            .get(&layout.as_raw())
            .map(|u| u.value().clone())
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        let mut state = self
            .pools
            .get_mut(&pool.as_raw())
            .ok_or(vk::Result::ERROR_UNKNOWN)?;

        if state.sets.len() as u32 >= state.max_sets {
            return Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY);
        }
        for (ty, count) in &usage {
            let cap = state.capacity.get(ty).copied().unwrap_or(0);
            let used = state.used.get(ty).copied().unwrap_or(0);
            if used + count > cap {
                return Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY);
            }
        }
        for (ty, count) in &usage {
            *state.used.entry(*ty).or_insert(0) += count;
        }

        let set: vk::DescriptorSet = self.mint(ObjectKind::DescriptorSet);
        state.sets.push(set);
        self.sets.insert(set.as_raw(), (pool.as_raw(), layout.as_raw()));
        Ok(set)
    }

    fn free_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        set: vk::DescriptorSet,
    ) -> VkResult<()> {
        let Some((_, (_, layout))) = self.sets.remove(&set.as_raw()) else {
            return Ok(());
        };
        if let Some(mut state) = self.pools.get_mut(&pool.as_raw()) {
            state.sets.retain(|s| *s != set);
            if let Some(usage) = self.layouts.get(&layout) {
                for (ty, count) in usage.iter() {
                    if let Some(used) = state.used.get_mut(ty) {
                        *used = used.saturating_sub(*count);
                    }
                }
            }
        }
        self.retire(ObjectKind::DescriptorSet, set.as_raw());
        Ok(())
    }

    fn write_descriptors(&self, write: &DescriptorWrite<'_>) {
        self.writes.lock().push(WriteRecord {
            set: write.set,
            binding: write.binding,
            first_element: write.first_element,
            count: write.payload.len() as u32,
            descriptor_type: write.descriptor_type,
        });
    }

    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence> {
        let fence: vk::Fence = self.mint(ObjectKind::Fence);
        self.fences.insert(
            fence.as_raw(),
            FenceState {
                signaled,
                submitted_at: None,
            },
        );
        Ok(fence)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        self.fences.remove(&fence.as_raw());
        self.retire(ObjectKind::Fence, fence.as_raw());
    }

    fn fence_status(&self, fence: vk::Fence) -> VkResult<bool> {
        self.check_device()?;
        let mut state = self
            .fences
            .get_mut(&fence.as_raw())
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        Ok(self.poll_fence(&mut state))
    }

    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        let mut state = self
            .fences
            .get_mut(&fence.as_raw())
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        state.signaled = false;
        state.submitted_at = None;
        Ok(())
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> VkResult<bool> {
        let timeout = Duration::from_nanos(timeout_ns);
        let start = Instant::now();
        loop {
            if self.fence_status(fence)? {
                return Ok(true);
            }
            if start.elapsed() >= timeout {
                return Ok(false);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn create_semaphore(&self) -> VkResult<vk::Semaphore> {
        let semaphore: vk::Semaphore = self.mint(ObjectKind::Semaphore);
        self.semaphores.insert(semaphore.as_raw(), false);
        Ok(semaphore)
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        self.semaphores.remove(&semaphore.as_raw());
        self.retire(ObjectKind::Semaphore, semaphore.as_raw());
    }

    fn allocate_command_buffer(&self) -> VkResult<vk::CommandBuffer> {
        let command_buffer: vk::CommandBuffer = self.mint(ObjectKind::CommandBuffer);
        self.commands.insert(command_buffer.as_raw(), Vec::new());
        Ok(command_buffer)
    }

    fn free_command_buffer(&self, command_buffer: vk::CommandBuffer) {
        self.commands.remove(&command_buffer.as_raw());
        self.retire(ObjectKind::CommandBuffer, command_buffer.as_raw());
    }

    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        let mut list = self
            .commands
            .get_mut(&command_buffer.as_raw())
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        list.clear();
        Ok(())
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        if self.commands.contains_key(&command_buffer.as_raw()) {
            Ok(())
        } else {
            Err(vk::Result::ERROR_UNKNOWN)
        }
    }

    fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        self.begin_command_buffer(command_buffer)
    }

    fn queue_submit(&self, submit: &QueueSubmit<'_>) -> VkResult<()> {
        self.check_device()?;
        // A binary semaphore must be unsignaled when a signal is queued on it.
        let consumed = |s: &vk::Semaphore| submit.waits.iter().any(|w| w.semaphore == *s);
        if submit
            .signals
            .iter()
            .any(|s| self.semaphore_signaled(*s) && !consumed(s))
        {
            return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT);
        }
        if submit.fence != vk::Fence::null() {
            let mut state = self
                .fences
                .get_mut(&submit.fence.as_raw())
                .ok_or(vk::Result::ERROR_UNKNOWN)?;
            // A fence must be unsignaled and idle when handed to a submission.
            if state.signaled || state.submitted_at.is_some() {
                return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT);
            }
            state.submitted_at = Some(Instant::now());
        }
        for wait in submit.waits {
            if let Some(mut signaled) = self.semaphores.get_mut(&wait.semaphore.as_raw()) {
                *signaled = false;
            }
        }
        for signal in submit.signals {
            if let Some(mut signaled) = self.semaphores.get_mut(&signal.as_raw()) {
                *signaled = true;
            }
        }
        let n = self.submits.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(
            submit = n,
            command_buffers = submit.command_buffers.len(),
            waits = submit.waits.len(),
            signals = submit.signals.len(),
            "null queue submit"
        );
        Ok(())
    }

    fn cmd_bind_pipeline(
        &self,
        command_buffer: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    ) {
        self.record(
            command_buffer,
            RecordedCommand::BindPipeline {
                bind_point,
                pipeline,
            },
        );
    }

    fn cmd_bind_vertex_buffers(
        &self,
        command_buffer: vk::CommandBuffer,
        first_binding: u32,
        buffers: &[vk::Buffer],
        offsets: &[vk::DeviceSize],
    ) {
        self.record(
            command_buffer,
            RecordedCommand::BindVertexBuffers {
                first_binding,
                buffers: buffers.to_vec(),
                offsets: offsets.to_vec(),
            },
        );
    }

    fn cmd_bind_index_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        index_type: vk::IndexType,
    ) {
        self.record(
            command_buffer,
            RecordedCommand::BindIndexBuffer {
                buffer,
                offset,
                index_type,
            },
        );
    }

    fn cmd_set_viewport(&self, command_buffer: vk::CommandBuffer, viewport: &Viewport) {
        self.record(command_buffer, RecordedCommand::SetViewport(*viewport));
    }

    fn cmd_set_scissor(&self, command_buffer: vk::CommandBuffer, scissor: &Rect) {
        self.record(command_buffer, RecordedCommand::SetScissor(*scissor));
    }

    fn cmd_push_constants(
        &self,
        command_buffer: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: &[u8],
    ) {
        self.record(
            command_buffer,
            RecordedCommand::PushConstants {
                layout,
                stages,
                offset,
                data: data.to_vec(),
            },
        );
    }

    fn cmd_bind_descriptor_set(
        &self,
        command_buffer: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        _layout: vk::PipelineLayout,
        set_index: u32,
        set: vk::DescriptorSet,
    ) {
        self.record(
            command_buffer,
            RecordedCommand::BindDescriptorSet {
                bind_point,
                set_index,
                set,
            },
        );
    }

    fn cmd_begin_rendering(&self, command_buffer: vk::CommandBuffer, targets: &RenderTargets) {
        self.record(command_buffer, RecordedCommand::BeginRendering(targets.clone()));
    }

    fn cmd_end_rendering(&self, command_buffer: vk::CommandBuffer) {
        self.record(command_buffer, RecordedCommand::EndRendering);
    }

    fn cmd_draw(
        &self,
        command_buffer: vk::CommandBuffer,
        vertex_count: u32,
        instance_count: u32,
        _first_vertex: u32,
        _first_instance: u32,
    ) {
        self.record(
            command_buffer,
            RecordedCommand::Draw {
                vertex_count,
                instance_count,
            },
        );
    }

    fn cmd_draw_indexed(
        &self,
        command_buffer: vk::CommandBuffer,
        index_count: u32,
        instance_count: u32,
        _first_index: u32,
        _vertex_offset: i32,
        _first_instance: u32,
    ) {
        self.record(
            command_buffer,
            RecordedCommand::DrawIndexed {
                index_count,
                instance_count,
            },
        );
    }

    fn cmd_draw_mesh_tasks(&self, command_buffer: vk::CommandBuffer, x: u32, y: u32, z: u32) {
        self.record(command_buffer, RecordedCommand::DrawMeshTasks { x, y, z });
    }

    fn cmd_dispatch(&self, command_buffer: vk::CommandBuffer, x: u32, y: u32, z: u32) {
        self.record(command_buffer, RecordedCommand::Dispatch { x, y, z });
    }
}
