//! Vulkan backend
//!
//! [`VulkanDevice`] implements [`GpuDevice`](crate::render::api::GpuDevice)
//! on top of `ash` with a GLFW window. Everything here is created and used on
//! the render thread.

pub mod context;
pub mod device;
pub mod pipeline;
pub mod window;

use std::sync::Arc;

use ash::vk;

pub use device::VulkanDevice;
pub use window::{Window, WindowError};

use super::BackendFactory;
use crate::core::EngineConfig;
use crate::render::api::{
    AddressMode, BufferUsage, ColorSpace, Extent2D, Filter, ImageUsage, PixelFormat, PresentMode, SurfaceFormat,
};
use crate::render::{RenderError, RenderResult};

/// Factory that opens a window and builds a [`VulkanDevice`] for it
#[derive(Debug, Clone, Copy, Default)]
pub struct VulkanBackend;

impl VulkanBackend {
    /// Create the factory
    pub const fn new() -> Self {
        Self
    }
}

impl BackendFactory for VulkanBackend {
    type Device = VulkanDevice;

    fn create_device(&self, config: &EngineConfig) -> RenderResult<Arc<VulkanDevice>> {
        VulkanDevice::new(config).map(Arc::new)
    }
}

/// Error mapper for a failed Vulkan call
pub(crate) fn vk_error(operation: &'static str) -> impl Fn(vk::Result) -> RenderError {
    move |result| match result {
        vk::Result::ERROR_OUT_OF_HOST_MEMORY
        | vk::Result::ERROR_OUT_OF_DEVICE_MEMORY
        | vk::Result::ERROR_OUT_OF_POOL_MEMORY
        | vk::Result::ERROR_FRAGMENTED_POOL => RenderError::OutOfMemory { operation },
        vk::Result::ERROR_DEVICE_LOST => RenderError::DeviceLost,
        vk::Result::TIMEOUT => RenderError::Timeout { operation },
        other => RenderError::Device {
            operation,
            message: format!("{other:?}"),
        },
    }
}

impl From<vk::Format> for PixelFormat {
    fn from(format: vk::Format) -> Self {
        match format {
            vk::Format::B8G8R8A8_SRGB => Self::B8G8R8A8Srgb,
            vk::Format::B8G8R8A8_UNORM => Self::B8G8R8A8Unorm,
            vk::Format::R8G8B8A8_SRGB => Self::R8G8B8A8Srgb,
            vk::Format::R8G8B8A8_UNORM => Self::R8G8B8A8Unorm,
            other => Self::Other(other.as_raw()),
        }
    }
}

impl From<PixelFormat> for vk::Format {
    fn from(format: PixelFormat) -> Self {
        match format {
            PixelFormat::B8G8R8A8Srgb => Self::B8G8R8A8_SRGB,
            PixelFormat::B8G8R8A8Unorm => Self::B8G8R8A8_UNORM,
            PixelFormat::R8G8B8A8Srgb => Self::R8G8B8A8_SRGB,
            PixelFormat::R8G8B8A8Unorm => Self::R8G8B8A8_UNORM,
            PixelFormat::Other(raw) => Self::from_raw(raw),
        }
    }
}

impl From<vk::ColorSpaceKHR> for ColorSpace {
    fn from(color_space: vk::ColorSpaceKHR) -> Self {
        match color_space {
            vk::ColorSpaceKHR::SRGB_NONLINEAR => Self::SrgbNonlinear,
            other => Self::Other(other.as_raw()),
        }
    }
}

impl From<ColorSpace> for vk::ColorSpaceKHR {
    fn from(color_space: ColorSpace) -> Self {
        match color_space {
            ColorSpace::SrgbNonlinear => Self::SRGB_NONLINEAR,
            ColorSpace::Other(raw) => Self::from_raw(raw),
        }
    }
}

impl From<vk::SurfaceFormatKHR> for SurfaceFormat {
    fn from(format: vk::SurfaceFormatKHR) -> Self {
        Self {
            format: format.format.into(),
            color_space: format.color_space.into(),
        }
    }
}

impl From<PresentMode> for vk::PresentModeKHR {
    fn from(mode: PresentMode) -> Self {
        match mode {
            PresentMode::Immediate => Self::IMMEDIATE,
            PresentMode::Mailbox => Self::MAILBOX,
            PresentMode::Fifo => Self::FIFO,
            PresentMode::FifoRelaxed => Self::FIFO_RELAXED,
        }
    }
}

/// Present modes the engine knows about; shared-image modes are dropped
pub(crate) fn present_mode_from_vk(mode: vk::PresentModeKHR) -> Option<PresentMode> {
    match mode {
        vk::PresentModeKHR::IMMEDIATE => Some(PresentMode::Immediate),
        vk::PresentModeKHR::MAILBOX => Some(PresentMode::Mailbox),
        vk::PresentModeKHR::FIFO => Some(PresentMode::Fifo),
        vk::PresentModeKHR::FIFO_RELAXED => Some(PresentMode::FifoRelaxed),
        _ => None,
    }
}

impl From<vk::Extent2D> for Extent2D {
    fn from(extent: vk::Extent2D) -> Self {
        Self::new(extent.width, extent.height)
    }
}

impl From<Extent2D> for vk::Extent2D {
    fn from(extent: Extent2D) -> Self {
        Self {
            width: extent.width,
            height: extent.height,
        }
    }
}

impl From<BufferUsage> for vk::BufferUsageFlags {
    fn from(usage: BufferUsage) -> Self {
        let mut flags = Self::empty();
        if usage.contains(BufferUsage::VERTEX) {
            flags |= Self::VERTEX_BUFFER;
        }
        if usage.contains(BufferUsage::INDEX) {
            flags |= Self::INDEX_BUFFER;
        }
        if usage.contains(BufferUsage::UNIFORM) {
            flags |= Self::UNIFORM_BUFFER;
        }
        if usage.contains(BufferUsage::TRANSFER_SRC) {
            flags |= Self::TRANSFER_SRC;
        }
        flags
    }
}

impl From<ImageUsage> for vk::ImageUsageFlags {
    fn from(usage: ImageUsage) -> Self {
        let mut flags = Self::empty();
        if usage.contains(ImageUsage::SAMPLED) {
            flags |= Self::SAMPLED;
        }
        if usage.contains(ImageUsage::TRANSFER_DST) {
            flags |= Self::TRANSFER_DST;
        }
        if usage.contains(ImageUsage::COLOR_ATTACHMENT) {
            flags |= Self::COLOR_ATTACHMENT;
        }
        flags
    }
}

impl From<Filter> for vk::Filter {
    fn from(filter: Filter) -> Self {
        match filter {
            Filter::Nearest => Self::NEAREST,
            Filter::Linear => Self::LINEAR,
        }
    }
}

impl From<AddressMode> for vk::SamplerAddressMode {
    fn from(mode: AddressMode) -> Self {
        match mode {
            AddressMode::Repeat => Self::REPEAT,
            AddressMode::MirroredRepeat => Self::MIRRORED_REPEAT,
            AddressMode::ClampToEdge => Self::CLAMP_TO_EDGE,
        }
    }
}
