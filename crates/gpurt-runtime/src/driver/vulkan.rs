//! Vulkan driver built on `ash`.
//!
//! Owns the entry, instance and logical device it was created with and
//! destroys them when the last runtime object holding the driver goes away.
//! Every handle passed in must have been created by this driver. Graphics
//! pipelines use dynamic rendering (Vulkan 1.3) with dynamic viewport and
//! scissor.

use std::ffi::CString;

use ash::prelude::VkResult;
use ash::vk;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::{DescriptorWrite, Driver, QueueSubmit, WritePayload};
use crate::layout::{LayoutBinding, PushConstantRange};
use crate::pipeline::{PipelineDesc, PipelineKind};
use crate::render_target::{Rect, RenderTargets, Viewport};
use crate::sampler::SamplerDesc;

pub struct AshDriver {
    _entry: ash::Entry,
    instance: ash::Instance,
    device: ash::Device,
    mesh_shader: Option<ash::ext::mesh_shader::Device>,
    queue: Mutex<vk::Queue>,
    /// Allocation, free and reset of command buffers are serialized here.
    command_pool: Mutex<vk::CommandPool>,
    queue_family_index: u32,
}

impl AshDriver {
    /// Take ownership of a device created from `instance`. `mesh_shader`
    /// loads `VK_EXT_mesh_shader` entry points; the extension must have been
    /// enabled on the device.
    pub fn new(
        entry: ash::Entry,
        instance: ash::Instance,
        device: ash::Device,
        queue_family_index: u32,
        mesh_shader: bool,
    ) -> VkResult<Self> {
        let queue = unsafe { device.get_device_queue(queue_family_index, 0) };
        let pool_info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(queue_family_index);
        let command_pool = unsafe { device.create_command_pool(&pool_info, None)? };
        let mesh_shader = mesh_shader.then(|| ash::ext::mesh_shader::Device::new(&instance, &device));
        info!(queue_family_index, mesh = mesh_shader.is_some(), "ash driver ready");
        Ok(Self {
            _entry: entry,
            instance,
            device,
            mesh_shader,
            queue: Mutex::new(queue),
            command_pool: Mutex::new(command_pool),
            queue_family_index,
        })
    }

    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    pub fn queue_family_index(&self) -> u32 {
        self.queue_family_index
    }

    fn create_graphics_pipeline(
        &self,
        desc: &PipelineDesc,
        state: &crate::pipeline::GraphicsState,
        entry_points: &[CString],
    ) -> VkResult<vk::Pipeline> {
        let stages: Vec<vk::PipelineShaderStageCreateInfo> = desc
            .stages
            .iter()
            .zip(entry_points)
            .map(|(s, name)| {
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(s.stage())
                    .module(s.handle())
                    .name(name.as_c_str())
            })
            .collect();

        let vi_bindings: Vec<vk::VertexInputBindingDescription> = state
            .vertex_bindings
            .iter()
            .map(|b| vk::VertexInputBindingDescription {
                binding: b.binding,
                stride: b.stride,
                input_rate: b.input_rate,
            })
            .collect();
        let vi_attrs: Vec<vk::VertexInputAttributeDescription> = state
            .vertex_attributes
            .iter()
            .map(|a| vk::VertexInputAttributeDescription {
                location: a.location,
                binding: a.binding,
                format: a.format,
                offset: a.offset,
            })
            .collect();
        let vi_state = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&vi_bindings)
            .vertex_attribute_descriptions(&vi_attrs);
        let ia_state =
            vk::PipelineInputAssemblyStateCreateInfo::default().topology(state.topology);
        let vp_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);
        let rs_state = vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(state.polygon_mode)
            .cull_mode(state.cull_mode)
            .front_face(state.front_face)
            .line_width(1.0);
        let ms_state = vk::PipelineMultisampleStateCreateInfo::default()
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);
        let ds_state = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(state.depth_test)
            .depth_write_enable(state.depth_write)
            .depth_compare_op(state.depth_compare);

        let blend_attachments: Vec<vk::PipelineColorBlendAttachmentState> = state
            .color_formats
            .iter()
            .map(|_| {
                let attachment = vk::PipelineColorBlendAttachmentState::default()
                    .color_write_mask(vk::ColorComponentFlags::RGBA);
                if state.alpha_blend {
                    attachment
                        .blend_enable(true)
                        .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
                        .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
                        .color_blend_op(vk::BlendOp::ADD)
                        .src_alpha_blend_factor(vk::BlendFactor::ONE)
                        .dst_alpha_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
                        .alpha_blend_op(vk::BlendOp::ADD)
                } else {
                    attachment
                }
            })
            .collect();
        let cb_state =
            vk::PipelineColorBlendStateCreateInfo::default().attachments(&blend_attachments);
        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dyn_state =
            vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let mut rendering = vk::PipelineRenderingCreateInfo::default()
            .color_attachment_formats(&state.color_formats)
            .depth_attachment_format(state.depth_format.unwrap_or(vk::Format::UNDEFINED));

        let create_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vi_state)
            .input_assembly_state(&ia_state)
            .viewport_state(&vp_state)
            .rasterization_state(&rs_state)
            .multisample_state(&ms_state)
            .depth_stencil_state(&ds_state)
            .color_blend_state(&cb_state)
            .dynamic_state(&dyn_state)
            .layout(desc.layout.handle())
            .push_next(&mut rendering);

        match unsafe {
            self.device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[create_info], None)
        } {
            Ok(pipelines) => pipelines
                .into_iter()
                .next()
                .ok_or(vk::Result::ERROR_INITIALIZATION_FAILED),
            Err((pipelines, e)) => {
                for p in pipelines {
                    if p != vk::Pipeline::null() {
                        unsafe { self.device.destroy_pipeline(p, None) };
                    }
                }
                Err(e)
            }
        }
    }

    fn create_compute_pipeline(
        &self,
        desc: &PipelineDesc,
        entry_points: &[CString],
    ) -> VkResult<vk::Pipeline> {
        let (module, name) = desc
            .stages
            .first()
            .zip(entry_points.first())
            .ok_or(vk::Result::ERROR_INITIALIZATION_FAILED)?;
        let stage = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(module.handle())
            .name(name.as_c_str());
        let create_info = vk::ComputePipelineCreateInfo::default()
            .stage(stage)
            .layout(desc.layout.handle());
        match unsafe {
            self.device
                .create_compute_pipelines(vk::PipelineCache::null(), &[create_info], None)
        } {
            Ok(pipelines) => pipelines
                .into_iter()
                .next()
                .ok_or(vk::Result::ERROR_INITIALIZATION_FAILED),
            Err((_, e)) => Err(e),
        }
    }
}

impl Drop for AshDriver {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                warn!("device_wait_idle failed during teardown: {:?}", e);
            }
            self.device
                .destroy_command_pool(*self.command_pool.get_mut(), None);
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
        debug!("ash driver destroyed");
    }
}

impl Driver for AshDriver {
    fn name(&self) -> &str {
        "vulkan"
    }

    fn supports_mesh_tasks(&self) -> bool {
        self.mesh_shader.is_some()
    }

    fn create_shader_module(&self, code: &[u32]) -> VkResult<vk::ShaderModule> {
        let create_info = vk::ShaderModuleCreateInfo::default().code(code);
        unsafe { self.device.create_shader_module(&create_info, None) }
    }

    fn destroy_shader_module(&self, module: vk::ShaderModule) {
        unsafe { self.device.destroy_shader_module(module, None) };
    }

    fn create_descriptor_set_layout(
        &self,
        bindings: &[LayoutBinding],
    ) -> VkResult<vk::DescriptorSetLayout> {
        let vk_bindings: Vec<vk::DescriptorSetLayoutBinding> = bindings
            .iter()
            .map(|b| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(b.binding)
                    .descriptor_type(b.descriptor_type)
                    .descriptor_count(b.count)
                    .stage_flags(b.stages)
            })
            .collect();
        let create_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&vk_bindings);
        unsafe { self.device.create_descriptor_set_layout(&create_info, None) }
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        unsafe { self.device.destroy_descriptor_set_layout(layout, None) };
    }

    fn create_pipeline_layout(
        &self,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constants: &[PushConstantRange],
    ) -> VkResult<vk::PipelineLayout> {
        let ranges: Vec<vk::PushConstantRange> = push_constants
            .iter()
            .map(|r| vk::PushConstantRange {
                stage_flags: r.stages,
                offset: r.offset,
                size: r.size,
            })
            .collect();
        let create_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(set_layouts)
            .push_constant_ranges(&ranges);
        unsafe { self.device.create_pipeline_layout(&create_info, None) }
    }

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        unsafe { self.device.destroy_pipeline_layout(layout, None) };
    }

    fn create_pipeline(&self, desc: &PipelineDesc) -> VkResult<vk::Pipeline> {
        let entry_points = desc
            .stages
            .iter()
            .map(|s| CString::new(s.entry_point()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| vk::Result::ERROR_INITIALIZATION_FAILED)?;
        let pipeline = match &desc.kind {
            PipelineKind::Graphics(state) => {
                self.create_graphics_pipeline(desc, state, &entry_points)?
            }
            PipelineKind::Compute => self.create_compute_pipeline(desc, &entry_points)?,
        };
        debug!("created pipeline: {:?}", pipeline);
        Ok(pipeline)
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        unsafe { self.device.destroy_pipeline(pipeline, None) };
    }

    fn create_sampler(&self, desc: &SamplerDesc) -> VkResult<vk::Sampler> {
        let create_info = vk::SamplerCreateInfo::default()
            .mag_filter(desc.mag_filter)
            .min_filter(desc.min_filter)
            .mipmap_mode(desc.mipmap_mode)
            .address_mode_u(desc.address_mode_u)
            .address_mode_v(desc.address_mode_v)
            .address_mode_w(desc.address_mode_w)
            .mip_lod_bias(desc.mip_lod_bias)
            .anisotropy_enable(desc.max_anisotropy.is_some())
            .max_anisotropy(desc.max_anisotropy.unwrap_or(1.0))
            .compare_enable(desc.compare_op.is_some())
            .compare_op(desc.compare_op.unwrap_or(vk::CompareOp::ALWAYS))
            .min_lod(desc.min_lod)
            .max_lod(desc.max_lod)
            .border_color(desc.border_color);
        unsafe { self.device.create_sampler(&create_info, None) }
    }

    fn destroy_sampler(&self, sampler: vk::Sampler) {
        unsafe { self.device.destroy_sampler(sampler, None) };
    }

    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        sizes: &[vk::DescriptorPoolSize],
    ) -> VkResult<vk::DescriptorPool> {
        let create_info = vk::DescriptorPoolCreateInfo::default()
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
            .max_sets(max_sets)
            .pool_sizes(sizes);
        unsafe { self.device.create_descriptor_pool(&create_info, None) }
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        unsafe { self.device.destroy_descriptor_pool(pool, None) };
    }

    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> VkResult<()> {
        unsafe {
            self.device
                .reset_descriptor_pool(pool, vk::DescriptorPoolResetFlags::empty())
        }
    }

    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> VkResult<vk::DescriptorSet> {
        let layouts = [layout];
        let allocate_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(&layouts);
        let sets = unsafe { self.device.allocate_descriptor_sets(&allocate_info)? };
        sets.into_iter()
            .next()
            .ok_or(vk::Result::ERROR_OUT_OF_POOL_MEMORY)
    }

    fn free_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        set: vk::DescriptorSet,
    ) -> VkResult<()> {
        unsafe { self.device.free_descriptor_sets(pool, &[set]) }
    }

    fn write_descriptors(&self, write: &DescriptorWrite<'_>) {
        let base = vk::WriteDescriptorSet::default()
            .dst_set(write.set)
            .dst_binding(write.binding)
            .dst_array_element(write.first_element)
            .descriptor_type(write.descriptor_type);
        let vk_write = match write.payload {
            WritePayload::Images(infos) => base.image_info(infos),
            WritePayload::Buffers(infos) => base.buffer_info(infos),
            WritePayload::TexelBufferViews(views) => base.texel_buffer_view(views),
        };
        unsafe { self.device.update_descriptor_sets(&[vk_write], &[]) };
    }

    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let create_info = vk::FenceCreateInfo::default().flags(flags);
        unsafe { self.device.create_fence(&create_info, None) }
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.destroy_fence(fence, None) };
    }

    fn fence_status(&self, fence: vk::Fence) -> VkResult<bool> {
        unsafe { self.device.get_fence_status(fence) }
    }

    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        unsafe { self.device.reset_fences(&[fence]) }
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> VkResult<bool> {
        match unsafe { self.device.wait_for_fences(&[fence], true, timeout_ns) } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn create_semaphore(&self) -> VkResult<vk::Semaphore> {
        let create_info = vk::SemaphoreCreateInfo::default();
        unsafe { self.device.create_semaphore(&create_info, None) }
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.device.destroy_semaphore(semaphore, None) };
    }

    fn allocate_command_buffer(&self) -> VkResult<vk::CommandBuffer> {
        let pool = self.command_pool.lock();
        let allocate_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(*pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffers = unsafe { self.device.allocate_command_buffers(&allocate_info)? };
        buffers
            .into_iter()
            .next()
            .ok_or(vk::Result::ERROR_OUT_OF_HOST_MEMORY)
    }

    fn free_command_buffer(&self, command_buffer: vk::CommandBuffer) {
        let pool = self.command_pool.lock();
        unsafe { self.device.free_command_buffers(*pool, &[command_buffer]) };
    }

    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.device.begin_command_buffer(command_buffer, &begin_info) }
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        unsafe { self.device.end_command_buffer(command_buffer) }
    }

    fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        let _pool = self.command_pool.lock();
        unsafe {
            self.device
                .reset_command_buffer(command_buffer, vk::CommandBufferResetFlags::empty())
        }
    }

    fn queue_submit(&self, submit: &QueueSubmit<'_>) -> VkResult<()> {
        let wait_semaphores: Vec<vk::Semaphore> = submit.waits.iter().map(|w| w.semaphore).collect();
        let wait_stages: Vec<vk::PipelineStageFlags> = submit.waits.iter().map(|w| w.stage).collect();
        let mut submit_info = vk::SubmitInfo::default().command_buffers(submit.command_buffers);
        if !wait_semaphores.is_empty() {
            submit_info = submit_info
                .wait_semaphores(&wait_semaphores)
                .wait_dst_stage_mask(&wait_stages);
        }
        if !submit.signals.is_empty() {
            submit_info = submit_info.signal_semaphores(submit.signals);
        }
        let queue = self.queue.lock();
        unsafe { self.device.queue_submit(*queue, &[submit_info], submit.fence) }
    }

    fn cmd_bind_pipeline(
        &self,
        command_buffer: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    ) {
        unsafe {
            self.device
                .cmd_bind_pipeline(command_buffer, bind_point, pipeline)
        };
    }

    fn cmd_bind_vertex_buffers(
        &self,
        command_buffer: vk::CommandBuffer,
        first_binding: u32,
        buffers: &[vk::Buffer],
        offsets: &[vk::DeviceSize],
    ) {
        unsafe {
            self.device
                .cmd_bind_vertex_buffers(command_buffer, first_binding, buffers, offsets)
        };
    }

    fn cmd_bind_index_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        index_type: vk::IndexType,
    ) {
        unsafe {
            self.device
                .cmd_bind_index_buffer(command_buffer, buffer, offset, index_type)
        };
    }

    fn cmd_set_viewport(&self, command_buffer: vk::CommandBuffer, viewport: &Viewport) {
        unsafe {
            self.device
                .cmd_set_viewport(command_buffer, 0, &[viewport.to_vk()])
        };
    }

    fn cmd_set_scissor(&self, command_buffer: vk::CommandBuffer, scissor: &Rect) {
        unsafe {
            self.device
                .cmd_set_scissor(command_buffer, 0, &[scissor.to_vk()])
        };
    }

    fn cmd_push_constants(
        &self,
        command_buffer: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        stages: vk::ShaderStageFlags,
        offset: u32,
        data: &[u8],
    ) {
        unsafe {
            self.device
                .cmd_push_constants(command_buffer, layout, stages, offset, data)
        };
    }

    fn cmd_bind_descriptor_set(
        &self,
        command_buffer: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        set_index: u32,
        set: vk::DescriptorSet,
    ) {
        unsafe {
            self.device.cmd_bind_descriptor_sets(
                command_buffer,
                bind_point,
                layout,
                set_index,
                &[set],
                &[],
            )
        };
    }

    fn cmd_begin_rendering(&self, command_buffer: vk::CommandBuffer, targets: &RenderTargets) {
        let color: Vec<vk::RenderingAttachmentInfo> = targets
            .color
            .iter()
            .map(|c| {
                vk::RenderingAttachmentInfo::default()
                    .image_view(c.view)
                    .image_layout(c.layout)
                    .load_op(c.load_op)
                    .store_op(c.store_op)
                    .clear_value(c.clear_value())
            })
            .collect();
        let depth = targets.depth.map(|d| {
            vk::RenderingAttachmentInfo::default()
                .image_view(d.view)
                .image_layout(d.layout)
                .load_op(d.load_op)
                .store_op(d.store_op)
                .clear_value(d.clear_value())
        });

        let mut rendering_info = vk::RenderingInfo::default()
            .render_area(targets.area.to_vk())
            .layer_count(1)
            .color_attachments(&color);
        if let Some(depth) = depth.as_ref() {
            rendering_info = rendering_info.depth_attachment(depth);
        }
        unsafe { self.device.cmd_begin_rendering(command_buffer, &rendering_info) };
    }

    fn cmd_end_rendering(&self, command_buffer: vk::CommandBuffer) {
        unsafe { self.device.cmd_end_rendering(command_buffer) };
    }

    fn cmd_draw(
        &self,
        command_buffer: vk::CommandBuffer,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) {
        unsafe {
            self.device.cmd_draw(
                command_buffer,
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            )
        };
    }

    fn cmd_draw_indexed(
        &self,
        command_buffer: vk::CommandBuffer,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        unsafe {
            self.device.cmd_draw_indexed(
                command_buffer,
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            )
        };
    }

    fn cmd_draw_mesh_tasks(&self, command_buffer: vk::CommandBuffer, x: u32, y: u32, z: u32) {
        match &self.mesh_shader {
            Some(mesh) => unsafe { mesh.cmd_draw_mesh_tasks(command_buffer, x, y, z) },
            None => warn!("draw_mesh_tasks recorded without VK_EXT_mesh_shader; dropped"),
        }
    }

    fn cmd_dispatch(&self, command_buffer: vk::CommandBuffer, x: u32, y: u32, z: u32) {
        unsafe { self.device.cmd_dispatch(command_buffer, x, y, z) };
    }
}
