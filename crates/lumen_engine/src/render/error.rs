//! Rendering error types
//!
//! Every fallible GPU operation returns a [`RenderResult`]. A stale
//! presentation surface is not an error; it is reported through
//! [`AcquireOutcome`](crate::render::api::AcquireOutcome) and
//! [`PresentOutcome`](crate::render::api::PresentOutcome).

use thiserror::Error;

use crate::render::backends::vulkan::window::WindowError;

/// Errors produced by the rendering layer
#[derive(Error, Debug)]
pub enum RenderError {
    /// A device call failed with a driver-reported result
    #[error("Device error during {operation}: {message}")]
    Device {
        /// The operation that failed
        operation: &'static str,
        /// Driver message or result code
        message: String,
    },

    /// Host or device memory was exhausted
    #[error("Out of memory during {operation}")]
    OutOfMemory {
        /// The operation that failed
        operation: &'static str,
    },

    /// The logical device was lost
    #[error("Device lost")]
    DeviceLost,

    /// A CPU wait on a GPU fence exceeded its timeout
    #[error("Timed out waiting for {operation}")]
    Timeout {
        /// The wait that timed out
        operation: &'static str,
    },

    /// Instance, device or surface setup failed
    #[error("Initialization failed: {0}")]
    InitializationFailed(String),

    /// A descriptor set was requested outside the allocated range
    #[error("Descriptor set index {index} out of range ({allocated} allocated)")]
    DescriptorIndexOutOfRange {
        /// Computed frame-major index
        index: usize,
        /// Number of live descriptor sets
        allocated: usize,
    },

    /// An operation was attempted in a state that does not allow it
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Window system failure
    #[error("Window error: {0}")]
    Window(#[from] WindowError),

    /// Shader bytecode could not be read or is malformed
    #[error("Shader error: {0}")]
    Shader(String),

    /// Texture source could not be decoded
    #[error("Image load failed: {0}")]
    ImageLoad(String),
}

/// Result type for rendering operations
pub type RenderResult<T> = Result<T, RenderError>;
