use ash::vk;

pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Coarse failure classes. Callers branch on these to decide whether a call
/// order must be fixed, a pool must be grown, or the failure can be ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Call issued in the wrong lifecycle state; fix the call order.
    StateViolation,
    /// Driver or pool ran out of room; grow or rotate pools and retry.
    Allocation,
    /// Content does not satisfy the request; the object stays usable.
    ContentMismatch,
    /// Any other driver failure, including device loss.
    Driver,
    /// Configuration could not be loaded or is inconsistent.
    Config,
}

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("cannot {op} while command buffer is {state}")]
    InvalidState {
        op: &'static str,
        state: &'static str,
    },

    #[error("command buffer still in flight (submission {submit_id})")]
    StillInFlight { submit_id: u64 },

    #[error("completion semaphore of submission {submit_id} has not been claimed by a waiter")]
    SemaphoreUnclaimed { submit_id: u64 },

    #[error("{op} requires {feature}, which the driver does not support")]
    Unsupported {
        op: &'static str,
        feature: &'static str,
    },

    #[error("{op} requires a bound pipeline")]
    NoPipelineBound { op: &'static str },

    #[error("resource binding pool has been destroyed")]
    PoolDestroyed,

    #[error("resource binding pool exhausted: all {max_sets} sets reserved")]
    PoolExhausted { max_sets: u32 },

    #[error("descriptor set allocation failed: {0}")]
    DescriptorAllocation(vk::Result),

    #[error("driver call {op} failed: {result}")]
    Driver { op: &'static str, result: vk::Result },

    #[error("fence wait timed out after {timeout_ns}ns")]
    Timeout { timeout_ns: u64 },

    #[error("binding {binding}[{element}] is empty")]
    IncompleteBinding { binding: u32, element: u32 },

    #[error("binding {binding} is outside the layout ({bindings} bindings)")]
    BindingOutOfRange { binding: u32, bindings: u32 },

    #[error("element {element} is outside binding {binding} (array of {count})")]
    ElementOutOfRange { binding: u32, element: u32, count: u32 },

    #[error("resource does not match binding {binding} of type {descriptor_type:?}")]
    ResourceMismatch {
        binding: u32,
        descriptor_type: vk::DescriptorType,
    },

    #[error("binding {binding} uses unsupported descriptor type {descriptor_type:?}")]
    UnsupportedDescriptorType {
        binding: u32,
        descriptor_type: vk::DescriptorType,
    },

    #[error("SPIR-V length {len} is not a whole number of 4-byte words")]
    MalformedShader { len: usize },

    #[error("layout bindings must be contiguous: position {position} declares binding {binding}")]
    NonContiguousLayout { position: u32, binding: u32 },

    #[error("content {hash:#018x} is already cached by another instance")]
    DuplicateContent { hash: u64 },

    #[error("{kind} cache hash collision on {hash:#018x}")]
    HashCollision { kind: &'static str, hash: u64 },

    #[error("shared registry entry '{name}' holds a different type")]
    RegistryTypeMismatch { name: String },

    #[error("binding instance has no descriptor set allocated")]
    Unallocated,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RuntimeError {
    /// Wrap a failing driver result with the name of the call that produced it.
    pub fn driver(op: &'static str, result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL => {
                RuntimeError::DescriptorAllocation(result)
            }
            _ => RuntimeError::Driver { op, result },
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            RuntimeError::InvalidState { .. }
            | RuntimeError::StillInFlight { .. }
            | RuntimeError::SemaphoreUnclaimed { .. }
            | RuntimeError::NoPipelineBound { .. }
            | RuntimeError::PoolDestroyed
            | RuntimeError::Unallocated
            | RuntimeError::BindingOutOfRange { .. }
            | RuntimeError::ElementOutOfRange { .. } => ErrorClass::StateViolation,
            RuntimeError::PoolExhausted { .. } | RuntimeError::DescriptorAllocation(_) => {
                ErrorClass::Allocation
            }
            RuntimeError::IncompleteBinding { .. }
            | RuntimeError::ResourceMismatch { .. }
            | RuntimeError::NonContiguousLayout { .. }
            | RuntimeError::UnsupportedDescriptorType { .. }
            | RuntimeError::MalformedShader { .. }
            | RuntimeError::DuplicateContent { .. }
            | RuntimeError::HashCollision { .. }
            | RuntimeError::RegistryTypeMismatch { .. } => ErrorClass::ContentMismatch,
            RuntimeError::Driver { result, .. }
                if *result == vk::Result::ERROR_OUT_OF_HOST_MEMORY
                    || *result == vk::Result::ERROR_OUT_OF_DEVICE_MEMORY =>
            {
                ErrorClass::Allocation
            }
            RuntimeError::Driver { .. }
            | RuntimeError::Timeout { .. }
            | RuntimeError::Unsupported { .. } => ErrorClass::Driver,
            RuntimeError::Config(_) | RuntimeError::Io(_) => ErrorClass::Config,
        }
    }
}
