//! Shared building blocks for the GPU runtime: configuration, the error
//! taxonomy, and the structural hashing helpers every cache keys on.

pub mod config;
pub mod error;
pub mod hash;

pub use config::RuntimeConfig;
pub use error::{ErrorClass, Result, RuntimeError};
