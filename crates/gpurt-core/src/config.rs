use ash::vk;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Result, RuntimeError};

/// Environment variable that overrides the config file location.
pub const CONFIG_ENV: &str = "GPURT_CONFIG";

/// Top-level runtime configuration, loaded from gpurt.toml.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub binding_pool: BindingPoolConfig,
    #[serde(default)]
    pub frame_ring: FrameRingConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Compare the full descriptor on every cache hit instead of trusting the
    /// 64-bit structural hash. Off by default.
    #[serde(default)]
    pub verify_hits: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Timeout used by blocking waits that do not pass their own, in nanoseconds.
    #[serde(default = "default_wait_timeout_ns")]
    pub default_wait_timeout_ns: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingPoolConfig {
    /// Maximum number of descriptor sets a pool hands out before reset.
    #[serde(default = "default_max_sets")]
    pub max_sets: u32,
    /// Per-kind descriptor capacity of the backing driver pool.
    #[serde(default = "default_pool_sizes")]
    pub pool_sizes: Vec<PoolSize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSize {
    pub kind: DescriptorKind,
    pub count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameRingConfig {
    /// Frames created up front.
    #[serde(default = "default_initial_frames")]
    pub initial_frames: usize,
    /// Upper bound on ring growth. `None` lets the ring grow until the GPU
    /// catches up; with a bound the ring blocks on its oldest frame instead.
    #[serde(default)]
    pub max_frames: Option<usize>,
}

/// Descriptor kinds as spelled in configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DescriptorKind {
    Sampler,
    CombinedImageSampler,
    SampledImage,
    StorageImage,
    UniformTexelBuffer,
    StorageTexelBuffer,
    UniformBuffer,
    StorageBuffer,
}

impl DescriptorKind {
    pub const ALL: [DescriptorKind; 8] = [
        DescriptorKind::Sampler,
        DescriptorKind::CombinedImageSampler,
        DescriptorKind::SampledImage,
        DescriptorKind::StorageImage,
        DescriptorKind::UniformTexelBuffer,
        DescriptorKind::StorageTexelBuffer,
        DescriptorKind::UniformBuffer,
        DescriptorKind::StorageBuffer,
    ];

    pub fn descriptor_type(self) -> vk::DescriptorType {
        match self {
            DescriptorKind::Sampler => vk::DescriptorType::SAMPLER,
            DescriptorKind::CombinedImageSampler => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            DescriptorKind::SampledImage => vk::DescriptorType::SAMPLED_IMAGE,
            DescriptorKind::StorageImage => vk::DescriptorType::STORAGE_IMAGE,
            DescriptorKind::UniformTexelBuffer => vk::DescriptorType::UNIFORM_TEXEL_BUFFER,
            DescriptorKind::StorageTexelBuffer => vk::DescriptorType::STORAGE_TEXEL_BUFFER,
            DescriptorKind::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
            DescriptorKind::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
        }
    }

    pub fn from_descriptor_type(ty: vk::DescriptorType) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.descriptor_type() == ty)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            default_wait_timeout_ns: default_wait_timeout_ns(),
        }
    }
}

impl Default for BindingPoolConfig {
    fn default() -> Self {
        Self {
            max_sets: default_max_sets(),
            pool_sizes: default_pool_sizes(),
        }
    }
}

impl Default for FrameRingConfig {
    fn default() -> Self {
        Self {
            initial_frames: default_initial_frames(),
            max_frames: None,
        }
    }
}

impl BindingPoolConfig {
    /// Pool sizes in the driver's representation, summed per kind.
    pub fn driver_pool_sizes(&self) -> Vec<vk::DescriptorPoolSize> {
        let mut sizes: Vec<vk::DescriptorPoolSize> = Vec::new();
        for size in &self.pool_sizes {
            let ty = size.kind.descriptor_type();
            match sizes.iter_mut().find(|s| s.ty == ty) {
                Some(existing) => existing.descriptor_count += size.count,
                None => sizes.push(
                    vk::DescriptorPoolSize::default()
                        .ty(ty)
                        .descriptor_count(size.count),
                ),
            }
        }
        sizes
    }
}

impl RuntimeConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: RuntimeConfig =
            toml::from_str(&content).map_err(|e| RuntimeError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from file if it exists, otherwise return defaults.
    pub fn load_or_default(path: &str) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(RuntimeError::Io(_)) => Self::default(),
            Err(e) => {
                warn!(path, "ignoring invalid config: {}", e);
                Self::default()
            }
        }
    }

    /// Render the configuration as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| RuntimeError::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.binding_pool.max_sets == 0 {
            return Err(RuntimeError::Config(
                "binding_pool.max_sets must be at least 1".to_string(),
            ));
        }
        if self.frame_ring.initial_frames == 0 {
            return Err(RuntimeError::Config(
                "frame_ring.initial_frames must be at least 1".to_string(),
            ));
        }
        if let Some(max) = self.frame_ring.max_frames {
            if max < self.frame_ring.initial_frames {
                return Err(RuntimeError::Config(format!(
                    "frame_ring.max_frames ({}) is below initial_frames ({})",
                    max, self.frame_ring.initial_frames
                )));
            }
        }
        Ok(())
    }
}

/// Returns the config file path.
/// Search order:
/// 1. `$GPURT_CONFIG`
/// 2. System-wide config: `/etc/gpurt/gpurt.toml` (Linux/macOS) or `%PROGRAMDATA%\gpurt\gpurt.toml` (Windows)
/// 3. Local fallback: `./gpurt.toml`
pub fn default_config_path() -> String {
    if let Ok(path) = std::env::var(CONFIG_ENV) {
        return path;
    }
    #[cfg(windows)]
    {
        let programdata = std::env::var("PROGRAMDATA")
            .unwrap_or_else(|_| r"C:\ProgramData".to_string());
        let system_path = format!(r"{}\gpurt\gpurt.toml", programdata);
        if std::path::Path::new(&system_path).exists() {
            return system_path;
        }
    }
    #[cfg(not(windows))]
    {
        let system_path = "/etc/gpurt/gpurt.toml";
        if std::path::Path::new(system_path).exists() {
            return system_path.to_string();
        }
    }
    "gpurt.toml".to_string()
}

/// Effectively unbounded. TOML integers are signed 64-bit, so this is the
/// largest timeout a config file can carry.
fn default_wait_timeout_ns() -> u64 {
    i64::MAX as u64
}

fn default_max_sets() -> u32 {
    256
}

fn default_pool_sizes() -> Vec<PoolSize> {
    vec![
        PoolSize { kind: DescriptorKind::Sampler, count: 64 },
        PoolSize { kind: DescriptorKind::CombinedImageSampler, count: 256 },
        PoolSize { kind: DescriptorKind::SampledImage, count: 256 },
        PoolSize { kind: DescriptorKind::StorageImage, count: 64 },
        PoolSize { kind: DescriptorKind::UniformTexelBuffer, count: 32 },
        PoolSize { kind: DescriptorKind::StorageTexelBuffer, count: 32 },
        PoolSize { kind: DescriptorKind::UniformBuffer, count: 256 },
        PoolSize { kind: DescriptorKind::StorageBuffer, count: 128 },
    ]
}

fn default_initial_frames() -> usize {
    2
}
