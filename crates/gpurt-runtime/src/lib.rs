//! GPU resource lifecycle and synchronization engine.
//!
//! Driver objects are deduplicated through per-device structural caches,
//! command buffers track their own submissions through shared trackers, and
//! resource binding instances batch descriptor writes into contiguous runs.

pub mod binding;
pub mod binding_pool;
pub mod cache;
pub mod command;
pub mod device;
pub mod driver;
pub mod frame;
pub mod layout;
pub mod pipeline;
pub mod registry;
pub mod render_target;
pub mod sampler;
pub mod shader;
pub mod sync;

pub use binding::{BindingResource, BindingWrite, ResourceBindingInstance, ResourceKind};
pub use binding_pool::ResourceBindingPool;
pub use cache::{Cached, ObjectCache, Registration};
pub use command::{CommandBuffer, CommandStats};
pub use device::{CacheCounts, Device};
pub use driver::{AshDriver, Driver, NullDriver};
pub use frame::{Frame, FrameRing};
pub use layout::{
    DescriptorSetLayout, LayoutBinding, LayoutDesc, PipelineLayout, PipelineLayoutDesc,
    PushConstantRange,
};
pub use pipeline::{GraphicsState, Pipeline, PipelineDesc, PipelineKind};
pub use registry::SharedRegistry;
pub use render_target::{ColorAttachment, DepthAttachment, Rect, RenderTargets, Viewport};
pub use sampler::{Sampler, SamplerDesc};
pub use shader::{ShaderDesc, ShaderModule};
pub use sync::{CommandBufferState, SubmissionTracker, SyncToken, WaitList};

pub use gpurt_core::{ErrorClass, Result, RuntimeConfig, RuntimeError};
