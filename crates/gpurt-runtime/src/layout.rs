//! Descriptor-set layouts and pipeline layouts.

use std::sync::Arc;

use ash::vk;
use tracing::debug;

use gpurt_core::config::DescriptorKind;
use gpurt_core::hash::{combine, fx_hash};
use gpurt_core::{Result, RuntimeError};

use crate::cache::{Cached, Registration};
use crate::driver::Driver;

/// One slot array of a descriptor-set layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LayoutBinding {
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub count: u32,
    pub stages: vk::ShaderStageFlags,
}

impl LayoutBinding {
    pub fn new(
        binding: u32,
        descriptor_type: vk::DescriptorType,
        count: u32,
        stages: vk::ShaderStageFlags,
    ) -> Self {
        Self {
            binding,
            descriptor_type,
            count,
            stages,
        }
    }
}

/// Ordered slot schema of one descriptor set. Binding indices must run
/// 0..N-1 without gaps, and every type must be one a binding pool can be
/// sized for (no input attachments or dynamic buffers).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LayoutDesc {
    pub bindings: Vec<LayoutBinding>,
}

impl LayoutDesc {
    pub fn new(bindings: Vec<LayoutBinding>) -> Self {
        Self { bindings }
    }

    pub fn validate(&self) -> Result<()> {
        for (position, binding) in self.bindings.iter().enumerate() {
            if binding.binding != position as u32 {
                return Err(RuntimeError::NonContiguousLayout {
                    position: position as u32,
                    binding: binding.binding,
                });
            }
            if DescriptorKind::from_descriptor_type(binding.descriptor_type).is_none() {
                return Err(RuntimeError::UnsupportedDescriptorType {
                    binding: binding.binding,
                    descriptor_type: binding.descriptor_type,
                });
            }
        }
        Ok(())
    }

    pub fn structural_hash(&self) -> u64 {
        fx_hash(&self.bindings)
    }
}

pub struct DescriptorSetLayout {
    driver: Arc<dyn Driver>,
    handle: vk::DescriptorSetLayout,
    desc: LayoutDesc,
    registration: Registration<Self>,
}

impl DescriptorSetLayout {
    pub(crate) fn create(
        driver: &Arc<dyn Driver>,
        desc: &LayoutDesc,
        registration: Registration<Self>,
    ) -> Result<Self> {
        let handle = driver
            .create_descriptor_set_layout(&desc.bindings)
            .map_err(|e| RuntimeError::driver("create_descriptor_set_layout", e))?;
        debug!(
            hash = registration.hash(),
            bindings = desc.bindings.len(),
            "created descriptor set layout"
        );
        Ok(Self {
            driver: Arc::clone(driver),
            handle,
            desc: desc.clone(),
            registration,
        })
    }

    pub fn handle(&self) -> vk::DescriptorSetLayout {
        self.handle
    }

    pub fn hash(&self) -> u64 {
        self.registration.hash()
    }

    pub fn bindings(&self) -> &[LayoutBinding] {
        &self.desc.bindings
    }

    pub fn binding(&self, binding: u32) -> Option<&LayoutBinding> {
        self.desc.bindings.get(binding as usize)
    }
}

impl Cached for DescriptorSetLayout {
    type Desc = LayoutDesc;
    const KIND: &'static str = "descriptor_set_layout";

    fn desc(&self) -> &LayoutDesc {
        &self.desc
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        self.registration.unregister(self);
        self.driver.destroy_descriptor_set_layout(self.handle);
    }
}

impl std::fmt::Debug for DescriptorSetLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DescriptorSetLayout")
            .field("handle", &self.handle)
            .field("hash", &self.hash())
            .field("bindings", &self.desc.bindings.len())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PushConstantRange {
    pub stages: vk::ShaderStageFlags,
    pub offset: u32,
    pub size: u32,
}

#[derive(Clone)]
pub struct PipelineLayoutDesc {
    pub set_layouts: Vec<Arc<DescriptorSetLayout>>,
    pub push_constants: Vec<PushConstantRange>,
}

impl PartialEq for PipelineLayoutDesc {
    fn eq(&self, other: &Self) -> bool {
        self.push_constants == other.push_constants
            && self.set_layouts.len() == other.set_layouts.len()
            && self
                .set_layouts
                .iter()
                .zip(&other.set_layouts)
                .all(|(a, b)| a.desc() == b.desc())
    }
}

impl PipelineLayoutDesc {
    pub fn new(set_layouts: Vec<Arc<DescriptorSetLayout>>) -> Self {
        Self {
            set_layouts,
            push_constants: Vec::new(),
        }
    }

    pub fn with_push_constants(mut self, range: PushConstantRange) -> Self {
        self.push_constants.push(range);
        self
    }

    pub fn structural_hash(&self) -> u64 {
        let seed = self
            .set_layouts
            .iter()
            .fold(self.set_layouts.len() as u64, |seed, l| combine(seed, l.hash()));
        combine(seed, fx_hash(&self.push_constants))
    }
}

pub struct PipelineLayout {
    driver: Arc<dyn Driver>,
    handle: vk::PipelineLayout,
    desc: PipelineLayoutDesc,
    registration: Registration<Self>,
}

impl PipelineLayout {
    pub(crate) fn create(
        driver: &Arc<dyn Driver>,
        desc: &PipelineLayoutDesc,
        registration: Registration<Self>,
    ) -> Result<Self> {
        let set_handles: Vec<vk::DescriptorSetLayout> =
            desc.set_layouts.iter().map(|l| l.handle()).collect();
        let handle = driver
            .create_pipeline_layout(&set_handles, &desc.push_constants)
            .map_err(|e| RuntimeError::driver("create_pipeline_layout", e))?;
        Ok(Self {
            driver: Arc::clone(driver),
            handle,
            desc: desc.clone(),
            registration,
        })
    }

    pub fn handle(&self) -> vk::PipelineLayout {
        self.handle
    }

    pub fn hash(&self) -> u64 {
        self.registration.hash()
    }

    pub fn set_layouts(&self) -> &[Arc<DescriptorSetLayout>] {
        &self.desc.set_layouts
    }

    pub fn push_constants(&self) -> &[PushConstantRange] {
        &self.desc.push_constants
    }
}

impl Cached for PipelineLayout {
    type Desc = PipelineLayoutDesc;
    const KIND: &'static str = "pipeline_layout";

    fn desc(&self) -> &PipelineLayoutDesc {
        &self.desc
    }
}

impl Drop for PipelineLayout {
    fn drop(&mut self) {
        self.registration.unregister(self);
        self.driver.destroy_pipeline_layout(self.handle);
    }
}

impl std::fmt::Debug for PipelineLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineLayout")
            .field("handle", &self.handle)
            .field("hash", &self.hash())
            .field("sets", &self.desc.set_layouts.len())
            .finish()
    }
}
