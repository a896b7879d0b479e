//! Images, swap chain images and textures
//!
//! A [`Texture`] is an [`Image`] plus the sampler it is read with. Owned
//! images and swap chain images both expose [`ImageResource`].

use std::path::Path;
use std::sync::Arc;

use crate::render::api::{
    Extent2D, GpuDevice, ImageDesc, ImageHandle, ImageUsage, ImageViewHandle, PixelFormat, SamplerHandle,
    SamplerSettings,
};
use crate::render::resources::handle::{ImageView, Owned, Sampler};
use crate::render::{RenderError, RenderResult};

/// Common view of anything backed by a GPU image
pub trait ImageResource {
    /// Image handle
    fn image(&self) -> ImageHandle;

    /// Color view of the whole image
    fn view(&self) -> ImageViewHandle;

    /// Pixel format
    fn format(&self) -> PixelFormat;

    /// Size in pixels
    fn extent(&self) -> Extent2D;
}

/// Image owned by the engine, with its view
pub struct Image<D: GpuDevice> {
    device: Arc<D>,
    image: ImageHandle,
    view: ImageViewHandle,
    desc: ImageDesc,
}

impl<D: GpuDevice> Image<D> {
    /// Create an image and a view onto it
    pub fn create(device: &Arc<D>, desc: ImageDesc) -> RenderResult<Self> {
        if desc.extent.is_empty() {
            return Err(RenderError::InvalidOperation(format!(
                "Cannot create a {}x{} image",
                desc.extent.width, desc.extent.height
            )));
        }
        let image = device.create_image(&desc)?;
        let view = match device.create_image_view(image, desc.format) {
            Ok(view) => view,
            Err(err) => {
                device.destroy_image(image);
                return Err(err);
            }
        };
        Ok(Self {
            device: Arc::clone(device),
            image,
            view,
            desc,
        })
    }

    /// Upload tightly packed pixels covering the whole image
    pub fn upload(&self, pixels: &[u8]) -> RenderResult<()> {
        let bytes_per_pixel = self.desc.format.bytes_per_pixel().ok_or_else(|| {
            RenderError::InvalidOperation(format!("Cannot upload to {:?} image", self.desc.format))
        })?;
        let expected = u64::from(self.desc.extent.width) * u64::from(self.desc.extent.height) * u64::from(bytes_per_pixel);
        if pixels.len() as u64 != expected {
            return Err(RenderError::InvalidOperation(format!(
                "Expected {expected} bytes of pixel data, got {}",
                pixels.len()
            )));
        }
        self.device.upload_image(self.image, &self.desc, pixels)
    }

    /// Creation parameters
    pub fn desc(&self) -> &ImageDesc {
        &self.desc
    }
}

impl<D: GpuDevice> ImageResource for Image<D> {
    fn image(&self) -> ImageHandle {
        self.image
    }

    fn view(&self) -> ImageViewHandle {
        self.view
    }

    fn format(&self) -> PixelFormat {
        self.desc.format
    }

    fn extent(&self) -> Extent2D {
        self.desc.extent
    }
}

impl<D: GpuDevice> Drop for Image<D> {
    fn drop(&mut self) {
        // View before the image it refers to
        self.device.destroy_image_view(self.view);
        self.device.destroy_image(self.image);
    }
}

/// Swap chain image: the image belongs to the swap chain, the view to us
pub struct PresentImage<D: GpuDevice> {
    image: ImageHandle,
    view: ImageView<D>,
    format: PixelFormat,
    extent: Extent2D,
}

impl<D: GpuDevice> PresentImage<D> {
    /// Create a view onto a swap chain image
    pub fn new(device: &Arc<D>, image: ImageHandle, format: PixelFormat, extent: Extent2D) -> RenderResult<Self> {
        let view = device.create_image_view(image, format)?;
        Ok(Self {
            image,
            view: Owned::new(Arc::clone(device), view),
            format,
            extent,
        })
    }
}

impl<D: GpuDevice> ImageResource for PresentImage<D> {
    fn image(&self) -> ImageHandle {
        self.image
    }

    fn view(&self) -> ImageViewHandle {
        self.view.handle()
    }

    fn format(&self) -> PixelFormat {
        self.format
    }

    fn extent(&self) -> Extent2D {
        self.extent
    }
}

/// Sampled RGBA image
pub struct Texture<D: GpuDevice> {
    image: Image<D>,
    sampler: Sampler<D>,
    settings: SamplerSettings,
}

impl<D: GpuDevice> Texture<D> {
    /// Create a texture from tightly packed RGBA8 pixels
    pub fn from_rgba8(
        device: &Arc<D>,
        extent: Extent2D,
        pixels: &[u8],
        settings: SamplerSettings,
    ) -> RenderResult<Self> {
        let image = Image::create(
            device,
            ImageDesc {
                extent,
                format: PixelFormat::R8G8B8A8Srgb,
                usage: ImageUsage::SAMPLED | ImageUsage::TRANSFER_DST,
            },
        )?;
        image.upload(pixels)?;
        let sampler = device.create_sampler(&settings)?;
        Ok(Self {
            image,
            sampler: Owned::new(Arc::clone(device), sampler),
            settings,
        })
    }

    /// Decode an image file and upload it
    pub fn load(device: &Arc<D>, path: impl AsRef<Path>, settings: SamplerSettings) -> RenderResult<Self> {
        let path = path.as_ref();
        log::debug!("Loading texture from {}", path.display());
        let decoded = ::image::open(path)
            .map_err(|e| RenderError::ImageLoad(format!("{}: {e}", path.display())))?
            .to_rgba8();
        let (width, height) = decoded.dimensions();
        log::info!("Loaded texture {width}x{height} from {}", path.display());
        Self::from_rgba8(device, Extent2D::new(width, height), decoded.as_raw(), settings)
    }

    /// Decode an in-memory image (PNG) and upload it
    pub fn from_encoded(device: &Arc<D>, bytes: &[u8], settings: SamplerSettings) -> RenderResult<Self> {
        let decoded = ::image::load_from_memory(bytes)
            .map_err(|e| RenderError::ImageLoad(e.to_string()))?
            .to_rgba8();
        let (width, height) = decoded.dimensions();
        Self::from_rgba8(device, Extent2D::new(width, height), decoded.as_raw(), settings)
    }

    /// Single-color texture
    pub fn solid_color(device: &Arc<D>, color: [u8; 4], settings: SamplerSettings) -> RenderResult<Self> {
        Self::from_rgba8(device, Extent2D::new(1, 1), &color, settings)
    }

    /// Sampler handle
    pub fn sampler(&self) -> SamplerHandle {
        self.sampler.handle()
    }

    /// Sampler parameters
    pub fn settings(&self) -> &SamplerSettings {
        &self.settings
    }
}

impl<D: GpuDevice> ImageResource for Texture<D> {
    fn image(&self) -> ImageHandle {
        self.image.image()
    }

    fn view(&self) -> ImageViewHandle {
        self.image.view()
    }

    fn format(&self) -> PixelFormat {
        self.image.format()
    }

    fn extent(&self) -> Extent2D {
        self.image.extent()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::api::Filter;
    use crate::render::backends::headless::HeadlessDevice;

    fn png_2x1() -> Vec<u8> {
        let pixels = ::image::RgbaImage::from_raw(2, 1, vec![255, 0, 0, 255, 0, 0, 255, 255]).unwrap();
        let mut encoded = std::io::Cursor::new(Vec::new());
        pixels.write_to(&mut encoded, ::image::ImageFormat::Png).unwrap();
        encoded.into_inner()
    }

    #[test]
    fn texture_owns_image_view_and_sampler() {
        let device = Arc::new(HeadlessDevice::new());
        let settings = SamplerSettings {
            filter: Filter::Nearest,
            ..SamplerSettings::default()
        };
        let texture = Texture::solid_color(&device, [255, 255, 255, 255], settings).unwrap();
        assert_eq!(texture.extent(), Extent2D::new(1, 1));
        assert_eq!(texture.settings().filter, Filter::Nearest);
        assert_eq!(device.live_object_count(), 3);

        drop(texture);
        assert_eq!(device.live_object_count(), 0);
        assert!(device.validation_errors().is_empty());
    }

    #[test]
    fn encoded_png_is_decoded_to_rgba() {
        let device = Arc::new(HeadlessDevice::new());
        let texture = Texture::from_encoded(&device, &png_2x1(), SamplerSettings::default()).unwrap();
        assert_eq!(texture.extent(), Extent2D::new(2, 1));
        assert_eq!(
            device.image_contents(texture.image()).unwrap(),
            vec![255, 0, 0, 255, 0, 0, 255, 255]
        );
    }

    #[test]
    fn pixel_size_mismatch_is_rejected() {
        let device = Arc::new(HeadlessDevice::new());
        let result = Texture::from_rgba8(&device, Extent2D::new(2, 2), &[0; 4], SamplerSettings::default());
        assert!(result.is_err());
        assert!(matches!(
            Texture::from_encoded(&device, b"not an image", SamplerSettings::default()),
            Err(RenderError::ImageLoad(_))
        ));
    }

    #[test]
    fn present_image_requires_live_swapchain_image() {
        let device = Arc::new(HeadlessDevice::new());
        let present = PresentImage::new(&device, ImageHandle(42), PixelFormat::B8G8R8A8Srgb, Extent2D::new(4, 4));
        // Image 42 is not a live device image, so view creation must fail
        assert!(present.is_err());
    }
}
