//! GPU device trait and the plain data exchanged across it

use bitflags::bitflags;

use crate::render::RenderResult;

macro_rules! gpu_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub u64);

        impl $name {
            /// Raw backend value
            pub fn raw(self) -> u64 {
                self.0
            }
        }
    };
}

gpu_handle!(
    /// CPU-waitable GPU completion primitive
    FenceHandle
);
gpu_handle!(
    /// GPU-to-GPU ordering primitive
    SemaphoreHandle
);
gpu_handle!(
    /// Primary command buffer
    CommandBufferHandle
);
gpu_handle!(
    /// Host-visible buffer with bound memory
    BufferHandle
);
gpu_handle!(
    /// Image, either owned or owned by a swap chain
    ImageHandle
);
gpu_handle!(
    /// View onto an image
    ImageViewHandle
);
gpu_handle!(
    /// Texture sampler
    SamplerHandle
);
gpu_handle!(
    /// Framebuffer compatible with the device render pass
    FramebufferHandle
);
gpu_handle!(
    /// Swap chain
    SwapchainHandle
);
gpu_handle!(
    /// Descriptor pool for uniform-buffer sets
    DescriptorPoolHandle
);
gpu_handle!(
    /// Descriptor set allocated from a pool
    DescriptorSetHandle
);

/// Width and height in pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Extent2D {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
}

impl Extent2D {
    /// Create an extent
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Whether either dimension is zero (e.g. a minimized window)
    pub const fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Width divided by height
    #[allow(clippy::cast_precision_loss)]
    pub fn aspect_ratio(&self) -> f32 {
        if self.height == 0 {
            1.0
        } else {
            self.width as f32 / self.height as f32
        }
    }
}

/// Pixel formats the engine distinguishes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// 8-bit BGRA, sRGB encoded
    B8G8R8A8Srgb,
    /// 8-bit BGRA, linear
    B8G8R8A8Unorm,
    /// 8-bit RGBA, sRGB encoded
    R8G8B8A8Srgb,
    /// 8-bit RGBA, linear
    R8G8B8A8Unorm,
    /// Any other backend format, by raw value
    Other(i32),
}

impl PixelFormat {
    /// Bytes per pixel, when known
    pub const fn bytes_per_pixel(self) -> Option<u32> {
        match self {
            Self::B8G8R8A8Srgb | Self::B8G8R8A8Unorm | Self::R8G8B8A8Srgb | Self::R8G8B8A8Unorm => Some(4),
            Self::Other(_) => None,
        }
    }
}

/// Color space of presented images
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColorSpace {
    /// Non-linear sRGB
    SrgbNonlinear,
    /// Any other backend color space, by raw value
    Other(i32),
}

/// Format plus color space pair supported by a surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SurfaceFormat {
    /// Pixel format
    pub format: PixelFormat,
    /// Color space
    pub color_space: ColorSpace,
}

/// Presentation scheduling mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PresentMode {
    /// No vsync, may tear
    Immediate,
    /// Triple buffering, latest image wins
    Mailbox,
    /// Vsync queue, always supported
    Fifo,
    /// Vsync that tears when late
    FifoRelaxed,
}

/// Sentinel for [`SurfaceCapabilities::current_extent`] meaning "chosen by the swap chain"
pub const EXTENT_UNDEFINED: u32 = u32::MAX;

/// Surface limits reported by the presentation engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceCapabilities {
    /// Minimum number of swap chain images
    pub min_image_count: u32,
    /// Maximum number of swap chain images, 0 for unbounded
    pub max_image_count: u32,
    /// Current surface size, or [`EXTENT_UNDEFINED`] in both dimensions
    pub current_extent: Extent2D,
    /// Smallest allowed extent
    pub min_image_extent: Extent2D,
    /// Largest allowed extent
    pub max_image_extent: Extent2D,
}

/// Everything needed to choose a swap chain configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SurfaceSupport {
    /// Surface limits
    pub capabilities: SurfaceCapabilities,
    /// Supported format and color space pairs, in driver order
    pub formats: Vec<SurfaceFormat>,
    /// Supported present modes
    pub present_modes: Vec<PresentMode>,
}

/// Parameters for swap chain creation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainDesc {
    /// Requested minimum image count
    pub image_count: u32,
    /// Image format and color space
    pub format: SurfaceFormat,
    /// Image extent
    pub extent: Extent2D,
    /// Present mode
    pub present_mode: PresentMode,
}

/// Result of asking the presentation engine for the next image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// An image was acquired and the semaphore will be signaled
    Acquired {
        /// Index into the swap chain images
        image_index: u32,
        /// The swap chain still works but no longer matches the surface
        suboptimal: bool,
    },
    /// The swap chain can no longer present; nothing was acquired
    OutOfDate,
}

/// Result of queueing an image for presentation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    /// Presented normally
    Presented,
    /// Presented, but the swap chain should be rebuilt
    Suboptimal,
    /// Not presented; the swap chain must be rebuilt
    OutOfDate,
}

impl PresentOutcome {
    /// Whether the swap chain should be rebuilt after this present
    pub const fn needs_recreate(self) -> bool {
        matches!(self, Self::Suboptimal | Self::OutOfDate)
    }
}

bitflags! {
    /// How a buffer will be bound
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        /// Vertex input
        const VERTEX = 1 << 0;
        /// Index input
        const INDEX = 1 << 1;
        /// Uniform buffer binding
        const UNIFORM = 1 << 2;
        /// Source of a transfer
        const TRANSFER_SRC = 1 << 3;
    }
}

bitflags! {
    /// How an image will be used
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ImageUsage: u32 {
        /// Sampled from shaders
        const SAMPLED = 1 << 0;
        /// Destination of a transfer
        const TRANSFER_DST = 1 << 1;
        /// Color attachment
        const COLOR_ATTACHMENT = 1 << 2;
    }
}

/// Parameters for image creation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageDesc {
    /// Size in pixels
    pub extent: Extent2D,
    /// Pixel format
    pub format: PixelFormat,
    /// Intended usage
    pub usage: ImageUsage,
}

/// Texel filtering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Filter {
    /// Nearest texel
    Nearest,
    /// Bilinear
    #[default]
    Linear,
}

/// Behaviour outside `[0, 1]` texture coordinates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddressMode {
    /// Tile
    #[default]
    Repeat,
    /// Tile with mirroring
    MirroredRepeat,
    /// Clamp to the edge texel
    ClampToEdge,
}

/// Sampler parameters carried by a texture
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SamplerSettings {
    /// Magnification and minification filter
    pub filter: Filter,
    /// Address mode on all axes
    pub address_mode: AddressMode,
    /// Maximum anisotropy, `None` to disable
    pub max_anisotropy: Option<f32>,
}

/// Slice of a buffer bound to a descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferRegion {
    /// Buffer
    pub buffer: BufferHandle,
    /// Byte offset, a multiple of the uniform alignment
    pub offset: u64,
    /// Byte length
    pub range: u64,
}

/// One indexed draw recorded into a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeshDraw {
    /// Vertex buffer bound at binding 0
    pub vertex_buffer: BufferHandle,
    /// 16-bit index buffer
    pub index_buffer: BufferHandle,
    /// Number of indices to draw
    pub index_count: u32,
    /// Set bound at set 0
    pub descriptor_set: DescriptorSetHandle,
}

/// Window events gathered since the last poll
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SurfaceEvents {
    /// The user asked to close the window
    pub close_requested: bool,
    /// The framebuffer size changed
    pub resized: bool,
}

/// Offset alignment of per-frame uniform regions
///
/// Vulkan guarantees `minUniformBufferOffsetAlignment` is at most 256.
pub const UNIFORM_REGION_ALIGNMENT: u64 = 256;

/// The operations the frame core needs from a GPU
///
/// Methods take `&self`; implementations use interior mutability for their
/// bookkeeping. Handles returned by `create_*` stay valid until the matching
/// `destroy_*` call. Descriptor sets are released with their pool.
pub trait GpuDevice {
    // Window and surface

    /// Pump the window system and report what happened
    fn poll_events(&self) -> SurfaceEvents;

    /// Current framebuffer size of the window
    fn window_extent(&self) -> Extent2D;

    /// Query surface capabilities, formats and present modes
    fn surface_support(&self) -> RenderResult<SurfaceSupport>;

    // Synchronization

    /// Create a binary semaphore
    fn create_semaphore(&self) -> RenderResult<SemaphoreHandle>;

    /// Destroy a semaphore
    fn destroy_semaphore(&self, semaphore: SemaphoreHandle);

    /// Create a fence, optionally already signaled
    fn create_fence(&self, signaled: bool) -> RenderResult<FenceHandle>;

    /// Destroy a fence
    fn destroy_fence(&self, fence: FenceHandle);

    /// Block until the fence is signaled or the timeout expires
    fn wait_for_fence(&self, fence: FenceHandle, timeout_ns: u64) -> RenderResult<()>;

    /// Return a signaled fence to the unsignaled state
    fn reset_fence(&self, fence: FenceHandle) -> RenderResult<()>;

    /// Block until all submitted work has finished
    fn wait_idle(&self) -> RenderResult<()>;

    // Swap chain

    /// Create a swap chain on the window surface
    fn create_swapchain(&self, desc: &SwapchainDesc) -> RenderResult<SwapchainHandle>;

    /// Images owned by a swap chain, in presentation index order
    fn swapchain_images(&self, swapchain: SwapchainHandle) -> RenderResult<Vec<ImageHandle>>;

    /// Destroy a swap chain and release its images
    fn destroy_swapchain(&self, swapchain: SwapchainHandle);

    /// Acquire the next presentable image, signaling `signal` when it is ready
    fn acquire_next_image(
        &self,
        swapchain: SwapchainHandle,
        signal: SemaphoreHandle,
    ) -> RenderResult<AcquireOutcome>;

    /// Queue an image for presentation after `wait` is signaled
    fn present(
        &self,
        swapchain: SwapchainHandle,
        image_index: u32,
        wait: SemaphoreHandle,
    ) -> RenderResult<PresentOutcome>;

    // Images

    /// Create a 2D color view onto an image
    fn create_image_view(&self, image: ImageHandle, format: PixelFormat) -> RenderResult<ImageViewHandle>;

    /// Destroy an image view
    fn destroy_image_view(&self, view: ImageViewHandle);

    /// Create a framebuffer for the device render pass
    fn create_framebuffer(&self, view: ImageViewHandle, extent: Extent2D) -> RenderResult<FramebufferHandle>;

    /// Destroy a framebuffer
    fn destroy_framebuffer(&self, framebuffer: FramebufferHandle);

    /// Create an image with bound device-local memory
    fn create_image(&self, desc: &ImageDesc) -> RenderResult<ImageHandle>;

    /// Upload tightly packed pixels and leave the image ready for sampling
    fn upload_image(&self, image: ImageHandle, desc: &ImageDesc, pixels: &[u8]) -> RenderResult<()>;

    /// Destroy an image and free its memory
    fn destroy_image(&self, image: ImageHandle);

    /// Create a sampler
    fn create_sampler(&self, settings: &SamplerSettings) -> RenderResult<SamplerHandle>;

    /// Destroy a sampler
    fn destroy_sampler(&self, sampler: SamplerHandle);

    // Buffers

    /// Create a host-visible, coherent buffer
    fn create_buffer(&self, size: u64, usage: BufferUsage) -> RenderResult<BufferHandle>;

    /// Copy bytes into a buffer at an offset
    fn write_buffer(&self, buffer: BufferHandle, offset: u64, data: &[u8]) -> RenderResult<()>;

    /// Destroy a buffer and free its memory
    fn destroy_buffer(&self, buffer: BufferHandle);

    // Descriptors

    /// Create a pool holding up to `max_sets` uniform-buffer sets
    fn create_descriptor_pool(&self, max_sets: u32) -> RenderResult<DescriptorPoolHandle>;

    /// Return every set of a pool to it
    fn reset_descriptor_pool(&self, pool: DescriptorPoolHandle) -> RenderResult<()>;

    /// Destroy a pool together with its sets
    fn destroy_descriptor_pool(&self, pool: DescriptorPoolHandle);

    /// Allocate `count` sets with the pipeline's set layout
    fn allocate_descriptor_sets(
        &self,
        pool: DescriptorPoolHandle,
        count: u32,
    ) -> RenderResult<Vec<DescriptorSetHandle>>;

    /// Point binding 0 of a set at a uniform buffer region
    fn write_uniform_descriptor(&self, set: DescriptorSetHandle, region: BufferRegion) -> RenderResult<()>;

    // Commands

    /// Allocate primary command buffers
    fn allocate_command_buffers(&self, count: u32) -> RenderResult<Vec<CommandBufferHandle>>;

    /// Return a command buffer to its pool
    fn free_command_buffer(&self, command_buffer: CommandBufferHandle);

    /// Reset and begin a command buffer, open the render pass and bind the pipeline
    fn begin_frame_commands(
        &self,
        command_buffer: CommandBufferHandle,
        framebuffer: FramebufferHandle,
        extent: Extent2D,
        clear_color: [f32; 4],
    ) -> RenderResult<()>;

    /// Record one indexed draw
    fn cmd_draw_mesh(&self, command_buffer: CommandBufferHandle, draw: &MeshDraw) -> RenderResult<()>;

    /// Close the render pass and finish recording
    fn end_frame_commands(&self, command_buffer: CommandBufferHandle) -> RenderResult<()>;

    /// Submit to the graphics queue: wait `wait` at color output, signal `signal` and `fence`
    fn submit(
        &self,
        command_buffer: CommandBufferHandle,
        wait: SemaphoreHandle,
        signal: SemaphoreHandle,
        fence: FenceHandle,
    ) -> RenderResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn empty_extent_detection() {
        assert!(Extent2D::new(0, 600).is_empty());
        assert!(Extent2D::new(800, 0).is_empty());
        assert!(!Extent2D::new(1, 1).is_empty());
    }

    #[test]
    fn aspect_ratio_guards_zero_height() {
        assert_relative_eq!(Extent2D::new(1600, 1000).aspect_ratio(), 1.6);
        assert_relative_eq!(Extent2D::new(1600, 0).aspect_ratio(), 1.0);
    }

    #[test]
    fn present_outcomes_that_trigger_rebuild() {
        assert!(!PresentOutcome::Presented.needs_recreate());
        assert!(PresentOutcome::Suboptimal.needs_recreate());
        assert!(PresentOutcome::OutOfDate.needs_recreate());
    }
}
