//! RAII ownership of raw device handles

use std::fmt;
use std::sync::Arc;

use crate::render::api::{
    BufferHandle, CommandBufferHandle, DescriptorPoolHandle, FenceHandle, FramebufferHandle, GpuDevice,
    ImageHandle, ImageViewHandle, SamplerHandle, SemaphoreHandle, SwapchainHandle,
};

/// A raw handle that knows how to give itself back to the device
pub trait GpuResource: Copy + fmt::Debug {
    /// Short name used in lifecycle logs
    const KIND: &'static str;

    /// Destroy or free the handle
    fn release<D: GpuDevice + ?Sized>(self, device: &D);
}

macro_rules! releasable {
    ($handle:ty, $kind:literal, $method:ident) => {
        impl GpuResource for $handle {
            const KIND: &'static str = $kind;

            fn release<D: GpuDevice + ?Sized>(self, device: &D) {
                device.$method(self);
            }
        }
    };
}

releasable!(FenceHandle, "fence", destroy_fence);
releasable!(SemaphoreHandle, "semaphore", destroy_semaphore);
releasable!(CommandBufferHandle, "command buffer", free_command_buffer);
releasable!(BufferHandle, "buffer", destroy_buffer);
releasable!(ImageHandle, "image", destroy_image);
releasable!(ImageViewHandle, "image view", destroy_image_view);
releasable!(SamplerHandle, "sampler", destroy_sampler);
releasable!(FramebufferHandle, "framebuffer", destroy_framebuffer);
releasable!(SwapchainHandle, "swapchain", destroy_swapchain);
releasable!(DescriptorPoolHandle, "descriptor pool", destroy_descriptor_pool);

/// Sole owner of a device handle
///
/// The handle can be copied out for use in device calls but is released only
/// by this owner, once, on drop.
pub struct Owned<D: GpuDevice, H: GpuResource> {
    device: Arc<D>,
    handle: H,
}

impl<D: GpuDevice, H: GpuResource> Owned<D, H> {
    /// Take ownership of a freshly created handle
    pub fn new(device: Arc<D>, handle: H) -> Self {
        Self { device, handle }
    }

    /// The raw handle
    pub fn handle(&self) -> H {
        self.handle
    }

    /// The owning device
    pub fn device(&self) -> &Arc<D> {
        &self.device
    }
}

impl<D: GpuDevice, H: GpuResource> fmt::Debug for Owned<D, H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Owned").field(&self.handle).finish()
    }
}

impl<D: GpuDevice, H: GpuResource> Drop for Owned<D, H> {
    fn drop(&mut self) {
        log::trace!("Releasing {} {:?}", H::KIND, self.handle);
        self.handle.release(&*self.device);
    }
}

/// Owned fence
pub type Fence<D> = Owned<D, FenceHandle>;
/// Owned semaphore
pub type Semaphore<D> = Owned<D, SemaphoreHandle>;
/// Owned primary command buffer
pub type CommandBuffer<D> = Owned<D, CommandBufferHandle>;
/// Owned image view
pub type ImageView<D> = Owned<D, ImageViewHandle>;
/// Owned sampler
pub type Sampler<D> = Owned<D, SamplerHandle>;
/// Owned framebuffer
pub type Framebuffer<D> = Owned<D, FramebufferHandle>;
/// Owned swap chain
pub type Swapchain<D> = Owned<D, SwapchainHandle>;
/// Owned descriptor pool
pub type DescriptorPool<D> = Owned<D, DescriptorPoolHandle>;

impl<D: GpuDevice> Fence<D> {
    /// Create a fence, optionally signaled
    pub fn create(device: &Arc<D>, signaled: bool) -> crate::render::RenderResult<Self> {
        let handle = device.create_fence(signaled)?;
        Ok(Self::new(Arc::clone(device), handle))
    }
}

impl<D: GpuDevice> Semaphore<D> {
    /// Create a binary semaphore
    pub fn create(device: &Arc<D>) -> crate::render::RenderResult<Self> {
        let handle = device.create_semaphore()?;
        Ok(Self::new(Arc::clone(device), handle))
    }
}

impl<D: GpuDevice> CommandBuffer<D> {
    /// Allocate `count` primary command buffers
    pub fn allocate(device: &Arc<D>, count: u32) -> crate::render::RenderResult<Vec<Self>> {
        Ok(device
            .allocate_command_buffers(count)?
            .into_iter()
            .map(|handle| Self::new(Arc::clone(device), handle))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::backends::headless::HeadlessDevice;

    #[test]
    fn handles_are_released_once_on_drop() {
        let device = Arc::new(HeadlessDevice::new());
        let fence = Fence::create(&device, true).unwrap();
        let semaphore = Semaphore::create(&device).unwrap();
        assert_eq!(device.live_object_count(), 2);

        drop(fence);
        assert_eq!(device.live_object_count(), 1);
        drop(semaphore);
        assert_eq!(device.live_object_count(), 0);
        assert!(device.validation_errors().is_empty());
    }

    #[test]
    fn command_buffers_return_to_pool() {
        let device = Arc::new(HeadlessDevice::new());
        let buffers = CommandBuffer::allocate(&device, 3).unwrap();
        assert_eq!(buffers.len(), 3);
        assert_eq!(device.live_object_count(), 3);
        drop(buffers);
        assert_eq!(device.live_object_count(), 0);
    }
}
