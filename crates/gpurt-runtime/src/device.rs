//! Device context: the driver plus one structural cache per object kind.

use std::sync::Arc;

use tracing::info;

use gpurt_core::config::BindingPoolConfig;
use gpurt_core::{Result, RuntimeConfig};

use crate::binding_pool::ResourceBindingPool;
use crate::cache::ObjectCache;
use crate::command::CommandBuffer;
use crate::driver::Driver;
use crate::frame::FrameRing;
use crate::layout::{DescriptorSetLayout, LayoutDesc, PipelineLayout, PipelineLayoutDesc};
use crate::pipeline::{Pipeline, PipelineDesc};
use crate::registry::SharedRegistry;
use crate::sampler::{Sampler, SamplerDesc};
use crate::shader::{ShaderDesc, ShaderModule};

/// Live object counts per cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheCounts {
    pub shader_modules: usize,
    pub descriptor_set_layouts: usize,
    pub pipeline_layouts: usize,
    pub pipelines: usize,
    pub samplers: usize,
}

pub struct Device {
    driver: Arc<dyn Driver>,
    config: RuntimeConfig,
    shader_modules: ObjectCache<ShaderModule>,
    set_layouts: ObjectCache<DescriptorSetLayout>,
    pipeline_layouts: ObjectCache<PipelineLayout>,
    pipelines: ObjectCache<Pipeline>,
    samplers: ObjectCache<Sampler>,
    shared: SharedRegistry,
}

impl Device {
    pub fn new(driver: Arc<dyn Driver>, config: RuntimeConfig) -> Result<Self> {
        config.validate()?;
        let verify = config.cache.verify_hits;
        info!(
            driver = driver.name(),
            verify_hits = verify,
            max_sets = config.binding_pool.max_sets,
            "device context created"
        );
        Ok(Self {
            driver,
            config,
            shader_modules: ObjectCache::new(verify),
            set_layouts: ObjectCache::new(verify),
            pipeline_layouts: ObjectCache::new(verify),
            pipelines: ObjectCache::new(verify),
            samplers: ObjectCache::new(verify),
            shared: SharedRegistry::new(),
        })
    }

    pub fn with_defaults(driver: Arc<dyn Driver>) -> Result<Self> {
        Self::new(driver, RuntimeConfig::default())
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Caller-owned registry for objects shared across subsystems.
    pub fn shared(&self) -> &SharedRegistry {
        &self.shared
    }

    pub fn create_shader_module(&self, desc: &ShaderDesc) -> Result<Arc<ShaderModule>> {
        self.shader_modules
            .get_or_create(desc.structural_hash(), desc, |reg| {
                ShaderModule::create(&self.driver, desc, reg)
            })
    }

    pub fn create_descriptor_set_layout(&self, desc: &LayoutDesc) -> Result<Arc<DescriptorSetLayout>> {
        desc.validate()?;
        self.set_layouts
            .get_or_create(desc.structural_hash(), desc, |reg| {
                DescriptorSetLayout::create(&self.driver, desc, reg)
            })
    }

    pub fn create_pipeline_layout(&self, desc: &PipelineLayoutDesc) -> Result<Arc<PipelineLayout>> {
        self.pipeline_layouts
            .get_or_create(desc.structural_hash(), desc, |reg| {
                PipelineLayout::create(&self.driver, desc, reg)
            })
    }

    pub fn create_pipeline(&self, desc: &PipelineDesc) -> Result<Arc<Pipeline>> {
        self.pipelines
            .get_or_create(desc.structural_hash(), desc, |reg| {
                Pipeline::create(&self.driver, desc, reg)
            })
    }

    pub fn create_sampler(&self, desc: &SamplerDesc) -> Result<Arc<Sampler>> {
        self.samplers
            .get_or_create(desc.structural_hash(), desc, |reg| {
                Sampler::create(&self.driver, desc, reg)
            })
    }

    pub fn create_command_buffer(&self) -> Result<CommandBuffer> {
        CommandBuffer::new(&self.driver, self.config.sync.default_wait_timeout_ns)
    }

    /// Binding pool sized from the device configuration.
    pub fn create_binding_pool(&self) -> Result<ResourceBindingPool> {
        ResourceBindingPool::new(&self.driver, &self.config.binding_pool)
    }

    pub fn create_binding_pool_with(&self, config: &BindingPoolConfig) -> Result<ResourceBindingPool> {
        ResourceBindingPool::new(&self.driver, config)
    }

    pub fn create_frame_ring(&self) -> Result<FrameRing> {
        FrameRing::new(
            &self.driver,
            &self.config.frame_ring,
            self.config.sync.default_wait_timeout_ns,
        )
    }

    pub fn cache_counts(&self) -> CacheCounts {
        CacheCounts {
            shader_modules: self.shader_modules.len(),
            descriptor_set_layouts: self.set_layouts.len(),
            pipeline_layouts: self.pipeline_layouts.len(),
            pipelines: self.pipelines.len(),
            samplers: self.samplers.len(),
        }
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("driver", &self.driver.name())
            .field("caches", &self.cache_counts())
            .finish()
    }
}
