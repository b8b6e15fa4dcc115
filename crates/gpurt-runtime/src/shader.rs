use std::sync::Arc;

use ash::vk;
use tracing::debug;

use gpurt_core::hash::{combine, fx_hash, hash_words};
use gpurt_core::{Result, RuntimeError};

use crate::cache::{Cached, Registration};
use crate::driver::Driver;

/// SPIR-V bytecode plus the stage and entry point it is used for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderDesc {
    pub code: Vec<u32>,
    pub stage: vk::ShaderStageFlags,
    pub entry_point: String,
}

impl ShaderDesc {
    pub fn new(code: Vec<u32>, stage: vk::ShaderStageFlags) -> Self {
        Self {
            code,
            stage,
            entry_point: "main".to_string(),
        }
    }

    /// Build from little-endian SPIR-V bytes. The length must be a multiple
    /// of four.
    pub fn from_bytes(bytes: &[u8], stage: vk::ShaderStageFlags) -> Result<Self> {
        if bytes.len() % 4 != 0 {
            return Err(RuntimeError::MalformedShader { len: bytes.len() });
        }
        let code = bytes
            .chunks_exact(4)
            .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
            .collect();
        Ok(Self::new(code, stage))
    }

    pub fn with_entry_point(mut self, entry_point: &str) -> Self {
        self.entry_point = entry_point.to_string();
        self
    }

    pub fn structural_hash(&self) -> u64 {
        let seed = hash_words(&self.code);
        combine(seed, fx_hash(&(self.stage, self.entry_point.as_str())))
    }
}

pub struct ShaderModule {
    driver: Arc<dyn Driver>,
    handle: vk::ShaderModule,
    desc: ShaderDesc,
    registration: Registration<Self>,
}

impl ShaderModule {
    pub(crate) fn create(
        driver: &Arc<dyn Driver>,
        desc: &ShaderDesc,
        registration: Registration<Self>,
    ) -> Result<Self> {
        let handle = driver
            .create_shader_module(&desc.code)
            .map_err(|e| RuntimeError::driver("create_shader_module", e))?;
        debug!(
            hash = registration.hash(),
            stage = ?desc.stage,
            words = desc.code.len(),
            "created shader module"
        );
        Ok(Self {
            driver: Arc::clone(driver),
            handle,
            desc: desc.clone(),
            registration,
        })
    }

    pub fn handle(&self) -> vk::ShaderModule {
        self.handle
    }

    /// Content hash; pipelines combine these instead of rehashing bytecode.
    pub fn hash(&self) -> u64 {
        self.registration.hash()
    }

    pub fn stage(&self) -> vk::ShaderStageFlags {
        self.desc.stage
    }

    pub fn entry_point(&self) -> &str {
        &self.desc.entry_point
    }
}

impl Cached for ShaderModule {
    type Desc = ShaderDesc;
    const KIND: &'static str = "shader_module";

    fn desc(&self) -> &ShaderDesc {
        &self.desc
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        self.registration.unregister(self);
        self.driver.destroy_shader_module(self.handle);
    }
}

impl std::fmt::Debug for ShaderModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShaderModule")
            .field("handle", &self.handle)
            .field("hash", &self.hash())
            .field("stage", &self.desc.stage)
            .finish()
    }
}
