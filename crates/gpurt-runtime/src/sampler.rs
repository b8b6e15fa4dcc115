use std::hash::{Hash, Hasher};
use std::sync::Arc;

use ash::vk;

use gpurt_core::hash::fx_hash;
use gpurt_core::{Result, RuntimeError};

use crate::cache::{Cached, Registration};
use crate::driver::Driver;

/// Sampler parameters. Float fields hash by bit pattern, so `0.0` and `-0.0`
/// are distinct keys.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplerDesc {
    pub mag_filter: vk::Filter,
    pub min_filter: vk::Filter,
    pub mipmap_mode: vk::SamplerMipmapMode,
    pub address_mode_u: vk::SamplerAddressMode,
    pub address_mode_v: vk::SamplerAddressMode,
    pub address_mode_w: vk::SamplerAddressMode,
    pub mip_lod_bias: f32,
    pub max_anisotropy: Option<f32>,
    pub compare_op: Option<vk::CompareOp>,
    pub min_lod: f32,
    pub max_lod: f32,
    pub border_color: vk::BorderColor,
}

impl Default for SamplerDesc {
    fn default() -> Self {
        Self {
            mag_filter: vk::Filter::LINEAR,
            min_filter: vk::Filter::LINEAR,
            mipmap_mode: vk::SamplerMipmapMode::LINEAR,
            address_mode_u: vk::SamplerAddressMode::REPEAT,
            address_mode_v: vk::SamplerAddressMode::REPEAT,
            address_mode_w: vk::SamplerAddressMode::REPEAT,
            mip_lod_bias: 0.0,
            max_anisotropy: None,
            compare_op: None,
            min_lod: 0.0,
            max_lod: vk::LOD_CLAMP_NONE,
            border_color: vk::BorderColor::FLOAT_TRANSPARENT_BLACK,
        }
    }
}

impl SamplerDesc {
    pub fn nearest() -> Self {
        Self {
            mag_filter: vk::Filter::NEAREST,
            min_filter: vk::Filter::NEAREST,
            mipmap_mode: vk::SamplerMipmapMode::NEAREST,
            ..Self::default()
        }
    }

    pub fn clamped(mut self) -> Self {
        self.address_mode_u = vk::SamplerAddressMode::CLAMP_TO_EDGE;
        self.address_mode_v = vk::SamplerAddressMode::CLAMP_TO_EDGE;
        self.address_mode_w = vk::SamplerAddressMode::CLAMP_TO_EDGE;
        self
    }

    pub fn structural_hash(&self) -> u64 {
        fx_hash(self)
    }
}

impl Hash for SamplerDesc {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.mag_filter.hash(state);
        self.min_filter.hash(state);
        self.mipmap_mode.hash(state);
        self.address_mode_u.hash(state);
        self.address_mode_v.hash(state);
        self.address_mode_w.hash(state);
        self.mip_lod_bias.to_bits().hash(state);
        self.max_anisotropy.map(f32::to_bits).hash(state);
        self.compare_op.hash(state);
        self.min_lod.to_bits().hash(state);
        self.max_lod.to_bits().hash(state);
        self.border_color.hash(state);
    }
}

pub struct Sampler {
    driver: Arc<dyn Driver>,
    handle: vk::Sampler,
    desc: SamplerDesc,
    registration: Registration<Self>,
}

impl Sampler {
    pub(crate) fn create(
        driver: &Arc<dyn Driver>,
        desc: &SamplerDesc,
        registration: Registration<Self>,
    ) -> Result<Self> {
        let handle = driver
            .create_sampler(desc)
            .map_err(|e| RuntimeError::driver("create_sampler", e))?;
        Ok(Self {
            driver: Arc::clone(driver),
            handle,
            desc: *desc,
            registration,
        })
    }

    pub fn handle(&self) -> vk::Sampler {
        self.handle
    }

    pub fn hash(&self) -> u64 {
        self.registration.hash()
    }
}

impl Cached for Sampler {
    type Desc = SamplerDesc;
    const KIND: &'static str = "sampler";

    fn desc(&self) -> &SamplerDesc {
        &self.desc
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        self.registration.unregister(self);
        self.driver.destroy_sampler(self.handle);
    }
}

impl std::fmt::Debug for Sampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sampler")
            .field("handle", &self.handle)
            .field("hash", &self.hash())
            .finish()
    }
}
