//! Error types for the runtime crate.

use thiserror::Error;

/// Runtime errors.
///
/// Compiler, scheduling and validation failures keep their
/// [`rasternet_core::Error`] variant so callers can match on the shared
/// taxonomy.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Engine(#[from] rasternet_core::Error),

    /// GPU initialization failed.
    #[error("GPU initialization failed: {0}")]
    InitError(String),

    /// A host tensor does not match its declared shape or element type.
    #[error("Invalid tensor: {0}")]
    TensorError(String),

    /// Mapping the readback buffer failed.
    #[error("Buffer async error: {0}")]
    BufferAsyncError(#[from] wgpu::BufferAsyncError),
}

impl RuntimeError {
    pub(crate) fn gpu(message: impl Into<String>) -> Self {
        RuntimeError::Engine(rasternet_core::Error::GpuExecution(message.into()))
    }

    pub(crate) fn precondition(message: impl Into<String>) -> Self {
        RuntimeError::Engine(rasternet_core::Error::Precondition(message.into()))
    }

    /// Whether the error came from the device rather than from the caller.
    pub fn is_device_failure(&self) -> bool {
        matches!(
            self,
            RuntimeError::Engine(rasternet_core::Error::GpuExecution(_))
                | RuntimeError::BufferAsyncError(_)
        )
    }
}

impl From<rasternet_model::ModelError> for RuntimeError {
    fn from(err: rasternet_model::ModelError) -> Self {
        RuntimeError::Engine(err.into())
    }
}

/// Specialized Result type for runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;
