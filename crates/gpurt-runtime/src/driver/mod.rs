//! Boundary to the graphics driver.
//!
//! Everything the runtime needs from the driver goes through [`Driver`]. Two
//! implementations ship with the crate: [`NullDriver`] (host-only, used by
//! tests and the `verify` command) and [`AshDriver`] (a real Vulkan device).

use ash::prelude::VkResult;
use ash::vk;

use crate::layout::{LayoutBinding, PushConstantRange};
use crate::pipeline::PipelineDesc;
use crate::render_target::{Rect, RenderTargets, Viewport};
use crate::sampler::SamplerDesc;

pub mod null;
pub mod vulkan;

pub use null::{Completion, NullDriver, ObjectKind, RecordedCommand, WriteRecord};
pub use vulkan::AshDriver;

/// A semaphore the submission waits on, and the stages that wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SemaphoreWait {
    pub semaphore: vk::Semaphore,
    pub stage: vk::PipelineStageFlags,
}

/// One queue submission.
#[derive(Debug, Clone, Copy)]
pub struct QueueSubmit<'a> {
    pub command_buffers: &'a [vk::CommandBuffer],
    pub waits: &'a [SemaphoreWait],
    pub signals: &'a [vk::Semaphore],
    pub fence: vk::Fence,
}

/// Typed payload of a descriptor write. The variant selects which info array
/// the driver reads.
#[derive(Debug, Clone, Copy)]
pub enum WritePayload<'a> {
    Images(&'a [vk::DescriptorImageInfo]),
    Buffers(&'a [vk::DescriptorBufferInfo]),
    TexelBufferViews(&'a [vk::BufferView]),
}

impl WritePayload<'_> {
    pub fn len(&self) -> usize {
        match self {
            WritePayload::Images(infos) => infos.len(),
            WritePayload::Buffers(infos) => infos.len(),
            WritePayload::TexelBufferViews(views) => views.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One driver "write descriptor" call: `payload.len()` consecutive array
/// elements of `binding`, starting at `first_element`.
#[derive(Debug, Clone, Copy)]
pub struct DescriptorWrite<'a> {
    pub set: vk::DescriptorSet,
    pub binding: u32,
    pub first_element: u32,
    pub descriptor_type: vk::DescriptorType,
    pub payload: WritePayload<'a>,
}

pub trait Driver: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &str;

    /// `cmd_draw_mesh_tasks` records a real draw.
    fn supports_mesh_tasks(&self) -> bool;

    // ── Cached objects ──────────────────────────────────────

    fn create_shader_module(&self, code: &[u32]) -> VkResult<vk::ShaderModule>;
    fn destroy_shader_module(&self, module: vk::ShaderModule);

    fn create_descriptor_set_layout(
        &self,
        bindings: &[LayoutBinding],
    ) -> VkResult<vk::DescriptorSetLayout>;
    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout);

    fn create_pipeline_layout(
        &self,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constants: &[PushConstantRange],
    ) -> VkResult<vk::PipelineLayout>;
    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout);

    fn create_pipeline(&self, desc: &PipelineDesc) -> VkResult<vk::Pipeline>;
    fn destroy_pipeline(&self, pipeline: vk::Pipeline);

    fn create_sampler(&self, desc: &SamplerDesc) -> VkResult<vk::Sampler>;
    fn destroy_sampler(&self, sampler: vk::Sampler);

    // ── Descriptors ─────────────────────────────────────────

    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        sizes: &[vk::DescriptorPoolSize],
    ) -> VkResult<vk::DescriptorPool>;
    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool);
    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> VkResult<()>;
    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> VkResult<vk::DescriptorSet>;
    fn free_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        set: vk::DescriptorSet,
    ) -> VkResult<()>;
    fn write_descriptors(&self, write: &DescriptorWrite<'_>);

    // ── Fences and semaphores ───────────────────────────────

    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence>;
    fn destroy_fence(&self, fence: vk::Fence);
    fn fence_status(&self, fence: vk::Fence) -> VkResult<bool>;
    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()>;
    /// Block until the fence signals or `timeout_ns` elapses.
    /// Returns `Ok(false)` on timeout.
    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> VkResult<bool>;
    fn create_semaphore(&self) -> VkResult<vk::Semaphore>;
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);

    // ── Command buffers ─────────────────────────────────────

    fn allocate_command_buffer(&self) -> VkResult<vk::CommandBuffer>;
    fn free_command_buffer(&self, command_buffer: vk::CommandBuffer);
    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()>;
    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()>;
    fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()>;
    fn queue_submit(&self, submit: &QueueSubmit<'_>) -> VkResult<()>;

    // ── Recording ───────────────────────────────────────────

    fn cmd_bind_pipeline(
        &self,
        command_buffer: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    );
    fn cmd_bind_vertex_buffers(
        &self,
        command_buffer: vk::CommandBuffer,
        first_binding: u32,
        buffers: &[vk::Buffer],
        offsets: &[vk::DeviceSize],
    );
    fn cmd_bind_index_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        index_type: vk::IndexType,
    );
    fn cmd_set_viewport(&self, command_buffer: vk::CommandBuffer, viewport: &Viewport);
    fn cmd_set_scissor(&self, command_buffer: vk::CommandBuffer, scissor: &Rect);
    fn cmd_push_constants(
        &self,
        command_buffer: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: &[u8],
    );
    fn cmd_bind_descriptor_set(
        &self,
        command_buffer: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        set_index: u32,
        set: vk::DescriptorSet,
    );
    fn cmd_begin_rendering(&self, command_buffer: vk::CommandBuffer, targets: &RenderTargets);
    fn cmd_end_rendering(&self, command_buffer: vk::CommandBuffer);
    fn cmd_draw(
        &self,
        command_buffer: vk::CommandBuffer,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    );
    fn cmd_draw_indexed(
        &self,
        command_buffer: vk::CommandBuffer,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    );
    fn cmd_draw_mesh_tasks(&self, command_buffer: vk::CommandBuffer, x: u32, y: u32, z: u32);
    fn cmd_dispatch(&self, command_buffer: vk::CommandBuffer, x: u32, y: u32, z: u32);
}
