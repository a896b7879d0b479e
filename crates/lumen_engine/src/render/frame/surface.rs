//! Presentation surface management
//!
//! Owns the swap chain together with one view and one framebuffer per
//! swap chain image. The three always change together: a rebuild tears
//! down framebuffers, then views, then the swap chain, and recreates them
//! in the opposite order.

use std::sync::Arc;

use crate::render::api::{
    ColorSpace, Extent2D, FramebufferHandle, GpuDevice, ImageViewHandle, PixelFormat, PresentMode,
    SurfaceCapabilities, SurfaceFormat, SurfaceSupport, SwapchainDesc, SwapchainHandle, EXTENT_UNDEFINED,
};
use crate::render::resources::{Framebuffer, ImageResource, Owned, PresentImage, Swapchain};
use crate::render::{RenderError, RenderResult};

/// Prefer sRGB BGRA, otherwise take whatever the surface lists first
pub fn choose_surface_format(formats: &[SurfaceFormat]) -> Option<SurfaceFormat> {
    formats
        .iter()
        .find(|f| f.format == PixelFormat::B8G8R8A8Srgb && f.color_space == ColorSpace::SrgbNonlinear)
        .or_else(|| formats.first())
        .copied()
}

/// Prefer mailbox; FIFO is always available
pub fn choose_present_mode(modes: &[PresentMode]) -> PresentMode {
    if modes.contains(&PresentMode::Mailbox) {
        PresentMode::Mailbox
    } else {
        PresentMode::Fifo
    }
}

/// Surface extent, falling back to the clamped window size when the
/// surface leaves the choice to the swap chain
pub fn choose_extent(capabilities: &SurfaceCapabilities, window_extent: Extent2D) -> Extent2D {
    if capabilities.current_extent.width != EXTENT_UNDEFINED {
        return capabilities.current_extent;
    }
    Extent2D::new(
        window_extent
            .width
            .clamp(capabilities.min_image_extent.width, capabilities.max_image_extent.width),
        window_extent
            .height
            .clamp(capabilities.min_image_extent.height, capabilities.max_image_extent.height),
    )
}

/// One more than the minimum, within the maximum when there is one
pub fn choose_image_count(capabilities: &SurfaceCapabilities) -> u32 {
    let desired = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 {
        desired.min(capabilities.max_image_count)
    } else {
        desired
    }
}

/// Swap chain plus its per-image views and framebuffers
pub struct PresentationSurface<D: GpuDevice> {
    device: Arc<D>,
    framebuffers: Vec<Framebuffer<D>>,
    images: Vec<PresentImage<D>>,
    swapchain: Option<Swapchain<D>>,
    format: SurfaceFormat,
    present_mode: PresentMode,
    extent: Extent2D,
    generation: u64,
}

impl<D: GpuDevice> PresentationSurface<D> {
    /// Build the swap chain and everything that depends on it
    pub fn create(device: &Arc<D>, support: &SurfaceSupport, window_extent: Extent2D) -> RenderResult<Self> {
        let mut surface = Self {
            device: Arc::clone(device),
            framebuffers: Vec::new(),
            images: Vec::new(),
            swapchain: None,
            format: SurfaceFormat {
                format: PixelFormat::B8G8R8A8Srgb,
                color_space: ColorSpace::SrgbNonlinear,
            },
            present_mode: PresentMode::Fifo,
            extent: Extent2D::default(),
            generation: 0,
        };
        surface.build(support, window_extent)?;
        Ok(surface)
    }

    /// Tear everything down and rebuild with the current surface support
    ///
    /// The device must be idle.
    pub fn recreate(&mut self, support: &SurfaceSupport, window_extent: Extent2D) -> RenderResult<()> {
        self.release();
        self.build(support, window_extent)
    }

    /// Destroy framebuffers, then views, then the swap chain
    pub fn release(&mut self) {
        self.framebuffers.clear();
        self.images.clear();
        self.swapchain = None;
    }

    fn build(&mut self, support: &SurfaceSupport, window_extent: Extent2D) -> RenderResult<()> {
        let format = choose_surface_format(&support.formats)
            .ok_or_else(|| RenderError::InitializationFailed("Surface reports no formats".to_string()))?;
        let present_mode = choose_present_mode(&support.present_modes);
        let extent = choose_extent(&support.capabilities, window_extent);
        if extent.is_empty() {
            return Err(RenderError::InvalidOperation(format!(
                "Cannot build a {}x{} swap chain",
                extent.width, extent.height
            )));
        }

        let desc = SwapchainDesc {
            image_count: choose_image_count(&support.capabilities),
            format,
            extent,
            present_mode,
        };
        let swapchain = Owned::new(Arc::clone(&self.device), self.device.create_swapchain(&desc)?);

        // The driver may hand out more images than requested
        let images = self
            .device
            .swapchain_images(swapchain.handle())?
            .into_iter()
            .map(|image| PresentImage::new(&self.device, image, format.format, extent))
            .collect::<RenderResult<Vec<_>>>()?;
        let framebuffers = images
            .iter()
            .map(|image| {
                let handle = self.device.create_framebuffer(image.view(), extent)?;
                Ok(Owned::new(Arc::clone(&self.device), handle))
            })
            .collect::<RenderResult<Vec<_>>>()?;

        self.generation += 1;
        log::debug!(
            "Built swap chain #{}: {} images, {}x{}, {:?}, {:?}",
            self.generation,
            images.len(),
            extent.width,
            extent.height,
            format.format,
            present_mode
        );

        self.swapchain = Some(swapchain);
        self.images = images;
        self.framebuffers = framebuffers;
        self.format = format;
        self.present_mode = present_mode;
        self.extent = extent;
        Ok(())
    }

    /// Current swap chain
    pub fn swapchain(&self) -> RenderResult<SwapchainHandle> {
        self.swapchain
            .as_ref()
            .map(Owned::handle)
            .ok_or_else(|| RenderError::InvalidOperation("Presentation surface was released".to_string()))
    }

    /// Framebuffer targeting a swap chain image
    pub fn framebuffer(&self, image_index: u32) -> RenderResult<FramebufferHandle> {
        self.framebuffers
            .get(image_index as usize)
            .map(Owned::handle)
            .ok_or_else(|| {
                RenderError::InvalidOperation(format!(
                    "Image index {image_index} out of range for {} framebuffers",
                    self.framebuffers.len()
                ))
            })
    }

    /// Views onto the swap chain images, in presentation index order
    pub fn image_views(&self) -> Vec<ImageViewHandle> {
        self.images.iter().map(ImageResource::view).collect()
    }

    /// Number of swap chain images
    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Number of framebuffers
    pub fn framebuffer_count(&self) -> usize {
        self.framebuffers.len()
    }

    /// Image extent
    pub fn extent(&self) -> Extent2D {
        self.extent
    }

    /// Image format and color space
    pub fn format(&self) -> SurfaceFormat {
        self.format
    }

    /// Present mode in use
    pub fn present_mode(&self) -> PresentMode {
        self.present_mode
    }

    /// How many times the swap chain has been built
    pub fn generation(&self) -> u64 {
        self.generation
    }
}
