use std::sync::Arc;

use ash::vk;
use tracing::debug;

use gpurt_core::hash::{combine, fx_hash};
use gpurt_core::{Result, RuntimeError};

use crate::cache::{Cached, Registration};
use crate::driver::Driver;
use crate::layout::PipelineLayout;
use crate::shader::ShaderModule;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexBinding {
    pub binding: u32,
    pub stride: u32,
    pub input_rate: vk::VertexInputRate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexAttribute {
    pub location: u32,
    pub binding: u32,
    pub format: vk::Format,
    pub offset: u32,
}

/// Fixed-function state of a graphics pipeline. Viewport and scissor are
/// always dynamic; attachments are described by format for dynamic rendering.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GraphicsState {
    pub topology: vk::PrimitiveTopology,
    pub polygon_mode: vk::PolygonMode,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    pub color_formats: Vec<vk::Format>,
    pub depth_format: Option<vk::Format>,
    pub depth_test: bool,
    pub depth_write: bool,
    pub depth_compare: vk::CompareOp,
    pub alpha_blend: bool,
    pub vertex_bindings: Vec<VertexBinding>,
    pub vertex_attributes: Vec<VertexAttribute>,
}

impl Default for GraphicsState {
    fn default() -> Self {
        Self {
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::NONE,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            color_formats: Vec::new(),
            depth_format: None,
            depth_test: false,
            depth_write: false,
            depth_compare: vk::CompareOp::LESS_OR_EQUAL,
            alpha_blend: false,
            vertex_bindings: Vec::new(),
            vertex_attributes: Vec::new(),
        }
    }
}

impl GraphicsState {
    pub fn with_color_format(mut self, format: vk::Format) -> Self {
        self.color_formats.push(format);
        self
    }

    pub fn with_depth(mut self, format: vk::Format, write: bool) -> Self {
        self.depth_format = Some(format);
        self.depth_test = true;
        self.depth_write = write;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PipelineKind {
    Graphics(GraphicsState),
    Compute,
}

#[derive(Clone)]
pub struct PipelineDesc {
    pub stages: Vec<Arc<ShaderModule>>,
    pub layout: Arc<PipelineLayout>,
    pub kind: PipelineKind,
}

impl PartialEq for PipelineDesc {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.layout.desc() == other.layout.desc()
            && self.stages.len() == other.stages.len()
            && self
                .stages
                .iter()
                .zip(&other.stages)
                .all(|(a, b)| a.desc() == b.desc())
    }
}

impl PipelineDesc {
    pub fn graphics(
        stages: Vec<Arc<ShaderModule>>,
        layout: Arc<PipelineLayout>,
        state: GraphicsState,
    ) -> Self {
        Self {
            stages,
            layout,
            kind: PipelineKind::Graphics(state),
        }
    }

    pub fn compute(stage: Arc<ShaderModule>, layout: Arc<PipelineLayout>) -> Self {
        Self {
            stages: vec![stage],
            layout,
            kind: PipelineKind::Compute,
        }
    }

    pub fn bind_point(&self) -> vk::PipelineBindPoint {
        match self.kind {
            PipelineKind::Graphics(_) => vk::PipelineBindPoint::GRAPHICS,
            PipelineKind::Compute => vk::PipelineBindPoint::COMPUTE,
        }
    }

    /// True when the stage set is task/mesh based rather than vertex based.
    pub fn is_mesh(&self) -> bool {
        self.stages
            .iter()
            .any(|s| s.stage().contains(vk::ShaderStageFlags::MESH_EXT))
    }

    /// Combines each stage's own content hash with the layout hash and the
    /// fixed-function state. Bytecode is never rehashed here.
    pub fn structural_hash(&self) -> u64 {
        let seed = self
            .stages
            .iter()
            .fold(self.stages.len() as u64, |seed, s| combine(seed, s.hash()));
        let seed = combine(seed, self.layout.hash());
        combine(seed, fx_hash(&self.kind))
    }
}

pub struct Pipeline {
    driver: Arc<dyn Driver>,
    handle: vk::Pipeline,
    desc: PipelineDesc,
    registration: Registration<Self>,
}

impl Pipeline {
    pub(crate) fn create(
        driver: &Arc<dyn Driver>,
        desc: &PipelineDesc,
        registration: Registration<Self>,
    ) -> Result<Self> {
        let handle = driver
            .create_pipeline(desc)
            .map_err(|e| RuntimeError::driver("create_pipeline", e))?;
        debug!(
            hash = registration.hash(),
            stages = desc.stages.len(),
            bind_point = ?desc.bind_point(),
            "created pipeline"
        );
        Ok(Self {
            driver: Arc::clone(driver),
            handle,
            desc: desc.clone(),
            registration,
        })
    }

    pub fn handle(&self) -> vk::Pipeline {
        self.handle
    }

    pub fn hash(&self) -> u64 {
        self.registration.hash()
    }

    pub fn layout(&self) -> &Arc<PipelineLayout> {
        &self.desc.layout
    }

    pub fn bind_point(&self) -> vk::PipelineBindPoint {
        self.desc.bind_point()
    }

    pub fn stages(&self) -> &[Arc<ShaderModule>] {
        &self.desc.stages
    }
}

impl Cached for Pipeline {
    type Desc = PipelineDesc;
    const KIND: &'static str = "pipeline";

    fn desc(&self) -> &PipelineDesc {
        &self.desc
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.registration.unregister(self);
        self.driver.destroy_pipeline(self.handle);
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("handle", &self.handle)
            .field("hash", &self.hash())
            .field("bind_point", &self.bind_point())
            .finish()
    }
}
