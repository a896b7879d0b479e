//! Device backends
//!
//! The render thread never constructs a device directly. It receives a
//! [`BackendFactory`] and calls it on its own thread, so backends whose
//! handles are tied to the creating thread (windows, Vulkan surfaces) never
//! cross threads.

use std::sync::Arc;

use crate::core::EngineConfig;
use crate::render::api::GpuDevice;
use crate::render::RenderResult;

pub mod headless;
pub mod vulkan;

/// Creates a device on the thread that will use it
pub trait BackendFactory: Send + 'static {
    /// Device type produced
    type Device: GpuDevice + 'static;

    /// Build the device for a configuration
    fn create_device(&self, config: &EngineConfig) -> RenderResult<Arc<Self::Device>>;
}
