//! Owning wrappers for GPU objects
//!
//! Every wrapper holds an `Arc` of the device that created it and releases
//! its handle exactly once when dropped.

pub mod buffer;
pub mod descriptor_pool;
pub mod handle;
pub mod image;

pub use buffer::{BufferUpload, GpuBuffer, GrowableBuffer, MeshBuffers, UniformBuffer};
pub use descriptor_pool::{set_index, PoolChange, ResourcePool};
pub use handle::{CommandBuffer, DescriptorPool, Fence, Framebuffer, GpuResource, ImageView, Owned, Sampler, Semaphore, Swapchain};
pub use image::{Image, ImageResource, PresentImage, Texture};
