//! Command buffer recording and submission.
//!
//! A command buffer mirrors the last state it emitted (shadow state) and
//! skips bind, viewport, scissor and rendering-pass calls that would not
//! change anything. Shadow state is cleared by `begin` and `reset`; a
//! submitted buffer keeps it until one of them runs.
//!
//! `end_rendering` is deferred: the driver call is emitted when a different
//! target set begins, a dispatch is recorded, or recording ends, so
//! consecutive passes over the same targets share one begin/end pair.

use std::sync::Arc;

use ash::vk;
use tracing::{debug, trace, warn};

use gpurt_core::{Result, RuntimeError};

use crate::binding::ResourceBindingInstance;
use crate::driver::{Driver, QueueSubmit};
use crate::pipeline::Pipeline;
use crate::render_target::{Rect, RenderTargets, Viewport};
use crate::sync::{CommandBufferState, SubmissionTracker, SyncToken, WaitList};

/// Counters of driver commands emitted and elided since creation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommandStats {
    pub emitted: u64,
    pub elided: u64,
    pub submits: u64,
}

#[derive(Debug, Default)]
struct ShadowState {
    pipeline: Option<(vk::PipelineBindPoint, vk::Pipeline)>,
    layout: Option<vk::PipelineLayout>,
    vertex_buffers: Vec<Option<(vk::Buffer, vk::DeviceSize)>>,
    index_buffer: Option<(vk::Buffer, vk::DeviceSize, vk::IndexType)>,
    viewport: Option<Viewport>,
    scissor: Option<Rect>,
    descriptor_sets: Vec<Option<vk::DescriptorSet>>,
    rendering: Option<RenderTargets>,
    /// `end_rendering` was requested but not yet emitted.
    end_pending: bool,
}

pub struct CommandBuffer {
    driver: Arc<dyn Driver>,
    handle: vk::CommandBuffer,
    tracker: Arc<SubmissionTracker>,
    wait_list: Arc<WaitList>,
    shadow: ShadowState,
    bound_pipeline: Option<Arc<Pipeline>>,
    /// Kept alive until the next reset; the GPU may still read them.
    retained_pipelines: Vec<Arc<Pipeline>>,
    retained_bindings: Vec<ResourceBindingInstance>,
    stats: CommandStats,
}

impl CommandBuffer {
    pub(crate) fn new(driver: &Arc<dyn Driver>, default_timeout_ns: u64) -> Result<Self> {
        let handle = driver
            .allocate_command_buffer()
            .map_err(|e| RuntimeError::driver("allocate_command_buffers", e))?;
        let tracker = match SubmissionTracker::new(driver, default_timeout_ns) {
            Ok(t) => Arc::new(t),
            Err(e) => {
                driver.free_command_buffer(handle);
                return Err(e);
            }
        };
        tracker.set_state(CommandBufferState::Initial);
        Ok(Self {
            driver: Arc::clone(driver),
            handle,
            tracker,
            wait_list: Arc::new(WaitList::new()),
            shadow: ShadowState::default(),
            bound_pipeline: None,
            retained_pipelines: Vec::new(),
            retained_bindings: Vec::new(),
            stats: CommandStats::default(),
        })
    }

    pub fn handle(&self) -> vk::CommandBuffer {
        self.handle
    }

    /// Last observed lifecycle state. `Pending` turns into `Complete` only
    /// when completion is queried; see [`poll`](Self::poll).
    pub fn state(&self) -> CommandBufferState {
        self.tracker.state()
    }

    /// Query the fence and return the up-to-date state.
    pub fn poll(&self) -> Result<CommandBufferState> {
        if self.tracker.state() == CommandBufferState::Pending {
            self.tracker.is_complete(self.tracker.submit_id())?;
        }
        Ok(self.tracker.state())
    }

    pub fn submit_id(&self) -> u64 {
        self.tracker.submit_id()
    }

    pub fn stats(&self) -> CommandStats {
        self.stats
    }

    pub fn tracker(&self) -> &Arc<SubmissionTracker> {
        &self.tracker
    }

    /// Semaphores the next submission waits on and signals. Shared so that
    /// other producers can enqueue while this buffer records.
    pub fn wait_list(&self) -> &Arc<WaitList> {
        &self.wait_list
    }

    /// Token for the most recent submission (or for "never submitted").
    pub fn get_sync(&self) -> SyncToken {
        SyncToken::new(Arc::clone(&self.tracker))
    }

    fn require(&self, expected: CommandBufferState, op: &'static str) -> Result<()> {
        let state = self.tracker.state();
        if state == expected {
            Ok(())
        } else {
            Err(RuntimeError::InvalidState {
                op,
                state: state.name(),
            })
        }
    }

    fn emitted(&mut self) {
        self.stats.emitted += 1;
    }

    fn elided(&mut self, op: &'static str) {
        self.stats.elided += 1;
        trace!(op, "redundant command elided");
    }

    // ── Lifecycle ───────────────────────────────────────────

    pub fn begin(&mut self) -> Result<()> {
        self.require(CommandBufferState::Initial, "begin")?;
        self.driver
            .begin_command_buffer(self.handle)
            .map_err(|e| RuntimeError::driver("begin_command_buffer", e))?;
        self.shadow = ShadowState::default();
        self.bound_pipeline = None;
        self.tracker.set_state(CommandBufferState::Recording);
        Ok(())
    }

    pub fn end(&mut self) -> Result<()> {
        self.require(CommandBufferState::Recording, "end")?;
        self.close_rendering();
        self.driver
            .end_command_buffer(self.handle)
            .map_err(|e| RuntimeError::driver("end_command_buffer", e))?;
        self.tracker.set_state(CommandBufferState::Executable);
        Ok(())
    }

    /// Submit to the queue, signaling this buffer's fence plus whatever the
    /// wait list holds. Returns a token for this submission.
    ///
    /// If the queue rejects the submission nothing moves: the buffer stays
    /// `Executable`, its submission id is unchanged and the drained wait list
    /// entries are put back, so the call can be retried.
    pub fn submit(&mut self) -> Result<SyncToken> {
        self.submit_inner(false)
    }

    /// Like [`submit`](Self::submit), and also signal the completion
    /// semaphore. A consumer takes it with [`SyncToken::claim_semaphore`];
    /// until then further signaling submissions fail with
    /// [`RuntimeError::SemaphoreUnclaimed`].
    pub fn submit_signaling(&mut self) -> Result<SyncToken> {
        self.submit_inner(true)
    }

    fn submit_inner(&mut self, signal_completion: bool) -> Result<SyncToken> {
        let op = if signal_completion { "submit_signaling" } else { "submit" };
        self.require(CommandBufferState::Executable, op)?;
        if signal_completion {
            self.tracker.reserve_signal()?;
        }
        if let Err(e) = self.tracker.arm_fence() {
            if signal_completion {
                self.tracker.cancel_signal();
            }
            return Err(e);
        }

        let (waits, mut signals) = self.wait_list.drain();
        let queued_signals = signals.len();
        if signal_completion {
            signals.push(self.tracker.semaphore());
        }
        let command_buffers = [self.handle];
        let submitted = self.driver.queue_submit(&QueueSubmit {
            command_buffers: &command_buffers,
            waits: &waits,
            signals: &signals,
            fence: self.tracker.fence(),
        });
        if let Err(result) = submitted {
            warn!(
                submit_id = self.tracker.submit_id(),
                %result,
                "queue submit failed, wait list restored"
            );
            signals.truncate(queued_signals);
            self.wait_list.requeue(waits, signals);
            if signal_completion {
                self.tracker.cancel_signal();
            }
            return Err(RuntimeError::driver("queue_submit", result));
        }

        let submit_id = self.tracker.commit_submit();
        self.tracker.set_state(CommandBufferState::Pending);
        self.stats.submits += 1;
        debug!(
            submit_id,
            waits = waits.len(),
            signals = signals.len(),
            "command buffer submitted"
        );
        Ok(self.get_sync())
    }

    /// Return to `Initial`. A pending buffer can only be reset once its fence
    /// has signaled; a recording buffer must be ended first.
    pub fn reset(&mut self) -> Result<()> {
        match self.tracker.state() {
            CommandBufferState::Recording => {
                return Err(RuntimeError::InvalidState {
                    op: "reset",
                    state: CommandBufferState::Recording.name(),
                });
            }
            CommandBufferState::Pending => {
                let submit_id = self.tracker.submit_id();
                if !self.tracker.is_complete(submit_id)? {
                    warn!(submit_id, "reset rejected: command buffer still in flight");
                    return Err(RuntimeError::StillInFlight { submit_id });
                }
            }
            _ => {}
        }
        self.driver
            .reset_command_buffer(self.handle)
            .map_err(|e| RuntimeError::driver("reset_command_buffer", e))?;
        self.release_retained();
        self.shadow = ShadowState::default();
        self.tracker.set_state(CommandBufferState::Initial);
        trace!(submit_id = self.tracker.submit_id(), "command buffer reset");
        Ok(())
    }

    fn release_retained(&mut self) {
        self.bound_pipeline = None;
        self.retained_pipelines.clear();
        self.retained_bindings.clear();
    }

    // ── State ───────────────────────────────────────────────

    pub fn bind_pipeline(&mut self, pipeline: &Arc<Pipeline>) -> Result<()> {
        self.require(CommandBufferState::Recording, "bind_pipeline")?;
        let key = (pipeline.bind_point(), pipeline.handle());
        if self.shadow.pipeline == Some(key) {
            self.elided("bind_pipeline");
            return Ok(());
        }
        self.driver
            .cmd_bind_pipeline(self.handle, key.0, key.1);
        self.emitted();

        let layout = pipeline.layout().handle();
        if self.shadow.layout != Some(layout) {
            self.shadow.descriptor_sets.clear();
            self.shadow.layout = Some(layout);
        }
        self.shadow.pipeline = Some(key);
        self.bound_pipeline = Some(Arc::clone(pipeline));
        if !self
            .retained_pipelines
            .iter()
            .any(|p| Arc::ptr_eq(p, pipeline))
        {
            self.retained_pipelines.push(Arc::clone(pipeline));
        }
        Ok(())
    }

    pub fn bind_vertex_buffers(
        &mut self,
        first_binding: u32,
        buffers: &[(vk::Buffer, vk::DeviceSize)],
    ) -> Result<()> {
        self.require(CommandBufferState::Recording, "bind_vertex_buffers")?;
        if buffers.is_empty() {
            return Ok(());
        }
        let first = first_binding as usize;
        let unchanged = buffers.iter().enumerate().all(|(i, b)| {
            self.shadow.vertex_buffers.get(first + i).copied().flatten() == Some(*b)
        });
        if unchanged {
            self.elided("bind_vertex_buffers");
            return Ok(());
        }

        let handles: Vec<vk::Buffer> = buffers.iter().map(|b| b.0).collect();
        let offsets: Vec<vk::DeviceSize> = buffers.iter().map(|b| b.1).collect();
        self.driver
            .cmd_bind_vertex_buffers(self.handle, first_binding, &handles, &offsets);
        self.emitted();

        if self.shadow.vertex_buffers.len() < first + buffers.len() {
            self.shadow.vertex_buffers.resize(first + buffers.len(), None);
        }
        for (i, b) in buffers.iter().enumerate() {
            self.shadow.vertex_buffers[first + i] = Some(*b);
        }
        Ok(())
    }

    pub fn bind_index_buffer(
        &mut self,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        index_type: vk::IndexType,
    ) -> Result<()> {
        self.require(CommandBufferState::Recording, "bind_index_buffer")?;
        let key = (buffer, offset, index_type);
        if self.shadow.index_buffer == Some(key) {
            self.elided("bind_index_buffer");
            return Ok(());
        }
        self.driver
            .cmd_bind_index_buffer(self.handle, buffer, offset, index_type);
        self.emitted();
        self.shadow.index_buffer = Some(key);
        Ok(())
    }

    pub fn set_viewport(&mut self, viewport: Viewport) -> Result<()> {
        self.require(CommandBufferState::Recording, "set_viewport")?;
        if self.shadow.viewport == Some(viewport) {
            self.elided("set_viewport");
            return Ok(());
        }
        self.driver.cmd_set_viewport(self.handle, &viewport);
        self.emitted();
        self.shadow.viewport = Some(viewport);
        Ok(())
    }

    pub fn set_scissor(&mut self, scissor: Rect) -> Result<()> {
        self.require(CommandBufferState::Recording, "set_scissor")?;
        if self.shadow.scissor == Some(scissor) {
            self.elided("set_scissor");
            return Ok(());
        }
        self.driver.cmd_set_scissor(self.handle, &scissor);
        self.emitted();
        self.shadow.scissor = Some(scissor);
        Ok(())
    }

    /// Push constants through the layout of the bound pipeline. Never elided.
    pub fn push_constants<T: bytemuck::Pod>(
        &mut self,
        stages: vk::ShaderStageFlags,
        offset: u32,
        value: &T,
    ) -> Result<()> {
        self.push_constant_bytes(stages, offset, bytemuck::bytes_of(value))
    }

    pub fn push_constant_bytes(
        &mut self,
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: &[u8],
    ) -> Result<()> {
        self.require(CommandBufferState::Recording, "push_constants")?;
        let layout = self
            .shadow
            .layout
            .ok_or(RuntimeError::NoPipelineBound { op: "push_constants" })?;
        self.driver
            .cmd_push_constants(self.handle, layout, stages, offset, data);
        self.emitted();
        Ok(())
    }

    /// Bind a resource binding instance at `set_index` of the bound
    /// pipeline's layout. Staged entries are flushed first. The instance is
    /// retained until the next reset.
    pub fn bind_binding_set(
        &mut self,
        set_index: u32,
        instance: &ResourceBindingInstance,
    ) -> Result<()> {
        self.require(CommandBufferState::Recording, "bind_binding_set")?;
        let (bind_point, _) = self
            .shadow
            .pipeline
            .ok_or(RuntimeError::NoPipelineBound { op: "bind_binding_set" })?;
        let layout = self
            .shadow
            .layout
            .ok_or(RuntimeError::NoPipelineBound { op: "bind_binding_set" })?;
        let set = instance.bindable_set()?;

        if !self
            .retained_bindings
            .iter()
            .any(|b| b.same_instance(instance))
        {
            self.retained_bindings.push(instance.clone());
        }

        let slot = set_index as usize;
        if self.shadow.descriptor_sets.get(slot).copied().flatten() == Some(set) {
            self.elided("bind_descriptor_set");
            return Ok(());
        }
        self.driver
            .cmd_bind_descriptor_set(self.handle, bind_point, layout, set_index, set);
        self.emitted();
        if self.shadow.descriptor_sets.len() <= slot {
            self.shadow.descriptor_sets.resize(slot + 1, None);
        }
        self.shadow.descriptor_sets[slot] = Some(set);
        Ok(())
    }

    // ── Rendering passes ────────────────────────────────────

    /// Begin a rendering pass. If the same target set (by value) is already
    /// active, including one whose end is still deferred, nothing is emitted.
    pub fn begin_rendering(&mut self, targets: &RenderTargets) -> Result<()> {
        self.require(CommandBufferState::Recording, "begin_rendering")?;
        if self.shadow.rendering.as_ref() == Some(targets) {
            self.shadow.end_pending = false;
            self.elided("begin_rendering");
            return Ok(());
        }
        self.close_rendering();
        self.driver.cmd_begin_rendering(self.handle, targets);
        self.emitted();
        self.shadow.rendering = Some(targets.clone());
        self.shadow.end_pending = false;
        Ok(())
    }

    /// Mark the active pass as finished. The driver call is deferred.
    pub fn end_rendering(&mut self) -> Result<()> {
        self.require(CommandBufferState::Recording, "end_rendering")?;
        if self.shadow.rendering.is_none() || self.shadow.end_pending {
            return Err(RuntimeError::InvalidState {
                op: "end_rendering",
                state: "recording without a rendering pass",
            });
        }
        self.shadow.end_pending = true;
        Ok(())
    }

    /// True while a pass is open and not marked finished.
    pub fn in_rendering(&self) -> bool {
        self.shadow.rendering.is_some() && !self.shadow.end_pending
    }

    fn close_rendering(&mut self) {
        if self.shadow.rendering.take().is_some() {
            self.driver.cmd_end_rendering(self.handle);
            self.emitted();
        }
        self.shadow.end_pending = false;
    }

    // ── Work ────────────────────────────────────────────────

    fn require_draw(&self, op: &'static str) -> Result<()> {
        self.require(CommandBufferState::Recording, op)?;
        match self.shadow.pipeline {
            Some((vk::PipelineBindPoint::GRAPHICS, _)) => {}
            _ => return Err(RuntimeError::NoPipelineBound { op }),
        }
        if !self.in_rendering() {
            return Err(RuntimeError::InvalidState {
                op,
                state: "recording without a rendering pass",
            });
        }
        Ok(())
    }

    pub fn draw(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) -> Result<()> {
        self.require_draw("draw")?;
        self.driver.cmd_draw(
            self.handle,
            vertex_count,
            instance_count,
            first_vertex,
            first_instance,
        );
        self.emitted();
        Ok(())
    }

    pub fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) -> Result<()> {
        self.require_draw("draw_indexed")?;
        if self.shadow.index_buffer.is_none() {
            return Err(RuntimeError::InvalidState {
                op: "draw_indexed",
                state: "recording without an index buffer",
            });
        }
        self.driver.cmd_draw_indexed(
            self.handle,
            index_count,
            instance_count,
            first_index,
            vertex_offset,
            first_instance,
        );
        self.emitted();
        Ok(())
    }

    /// Fails with [`RuntimeError::Unsupported`] when the driver has no mesh
    /// shading.
    pub fn draw_mesh_tasks(&mut self, x: u32, y: u32, z: u32) -> Result<()> {
        self.require_draw("draw_mesh_tasks")?;
        if !self.driver.supports_mesh_tasks() {
            return Err(RuntimeError::Unsupported {
                op: "draw_mesh_tasks",
                feature: "VK_EXT_mesh_shader",
            });
        }
        self.driver.cmd_draw_mesh_tasks(self.handle, x, y, z);
        self.emitted();
        Ok(())
    }

    /// Record a compute dispatch. Any open rendering pass is closed first.
    pub fn dispatch(&mut self, x: u32, y: u32, z: u32) -> Result<()> {
        self.require(CommandBufferState::Recording, "dispatch")?;
        match self.shadow.pipeline {
            Some((vk::PipelineBindPoint::COMPUTE, _)) => {}
            _ => return Err(RuntimeError::NoPipelineBound { op: "dispatch" }),
        }
        self.close_rendering();
        self.driver.cmd_dispatch(self.handle, x, y, z);
        self.emitted();
        Ok(())
    }

    /// Pipelines and binding instances held until the next reset.
    pub fn retained(&self) -> (usize, usize) {
        (self.retained_pipelines.len(), self.retained_bindings.len())
    }

    pub fn bound_pipeline(&self) -> Option<&Arc<Pipeline>> {
        self.bound_pipeline.as_ref()
    }
}

impl Drop for CommandBuffer {
    fn drop(&mut self) {
        if self.tracker.state() == CommandBufferState::Pending {
            let submit_id = self.tracker.submit_id();
            match self.tracker.is_complete(submit_id) {
                Ok(true) => {}
                Ok(false) => {
                    warn!(submit_id, "dropping in-flight command buffer; waiting for completion");
                    if let Err(e) = self
                        .tracker
                        .wait(submit_id, self.tracker.default_timeout_ns())
                    {
                        warn!("wait on drop failed: {}", e);
                    }
                }
                Err(e) => warn!("completion query on drop failed: {}", e),
            }
        }
        self.tracker.set_state(CommandBufferState::Invalid);
        self.driver.free_command_buffer(self.handle);
    }
}

impl std::fmt::Debug for CommandBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandBuffer")
            .field("handle", &self.handle)
            .field("state", &self.tracker.state())
            .field("submit_id", &self.tracker.submit_id())
            .field("stats", &self.stats)
            .finish()
    }
}
