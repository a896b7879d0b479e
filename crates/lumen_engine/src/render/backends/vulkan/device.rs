//! [`GpuDevice`] on top of Vulkan
//!
//! Engine handles carry the raw Vulkan handle values. Buffers and images
//! remember the memory bound to them so destroying the handle frees both.

use std::cell::RefCell;
use std::collections::HashMap;
use std::ptr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use ash::vk::{self, Handle};

use super::context::{LogicalDevice, PhysicalDeviceInfo, VulkanInstance, WindowSurface};
use super::pipeline::{CommandPool, DescriptorSetLayout, GraphicsPipeline, RenderPass, ShaderModule};
use super::window::Window;
use super::{present_mode_from_vk, vk_error};
use crate::core::{EngineConfig, ShaderStage};
use crate::render::api::{
    AcquireOutcome, BufferHandle, BufferRegion, BufferUsage, CommandBufferHandle, DescriptorPoolHandle,
    DescriptorSetHandle, Extent2D, FenceHandle, FramebufferHandle, GpuDevice, ImageDesc, ImageHandle,
    ImageViewHandle, MeshDraw, PixelFormat, PresentOutcome, SamplerHandle, SamplerSettings, SemaphoreHandle,
    SurfaceCapabilities, SurfaceEvents, SurfaceSupport, SwapchainDesc, SwapchainHandle,
};
use crate::render::frame::surface::choose_surface_format;
use crate::render::{RenderError, RenderResult};

const COLOR_RANGE: vk::ImageSubresourceRange = vk::ImageSubresourceRange {
    aspect_mask: vk::ImageAspectFlags::COLOR,
    base_mip_level: 0,
    level_count: 1,
    base_array_layer: 0,
    layer_count: 1,
};

struct Allocation {
    memory: vk::DeviceMemory,
    size: u64,
}

#[derive(Default)]
struct Resources {
    buffers: HashMap<u64, Allocation>,
    images: HashMap<u64, vk::DeviceMemory>,
}

/// Vulkan implementation of [`GpuDevice`]
///
/// Owns the window, instance, surface, logical device and the fixed
/// pipeline objects. Fields are declared in destruction order.
pub struct VulkanDevice {
    resources: Mutex<Resources>,
    command_pool: CommandPool,
    pipeline: GraphicsPipeline,
    set_layout: DescriptorSetLayout,
    render_pass: RenderPass,
    logical: LogicalDevice,
    surface: WindowSurface,
    physical: PhysicalDeviceInfo,
    _instance: VulkanInstance,
    window: RefCell<Window>,
}

impl VulkanDevice {
    /// Open the window and bring up everything needed to draw into it
    pub fn new(config: &EngineConfig) -> RenderResult<Self> {
        let mut window = Window::new(&config.window)?;
        let instance = VulkanInstance::new(&window, &config.window.title, config.renderer.enable_validation)?;
        let surface = WindowSurface::new(&instance, &mut window)?;
        let physical = PhysicalDeviceInfo::select_suitable_device(&instance.instance, &surface)?;
        let logical = LogicalDevice::new(&instance.instance, &physical)?;

        // The render pass is built once, so the format is fixed for the
        // lifetime of the device
        let support = query_surface_support(&surface, physical.device)?;
        let format = choose_surface_format(&support.formats)
            .ok_or_else(|| RenderError::InitializationFailed("Surface reports no formats".to_string()))?;

        let device = &logical.device;
        let render_pass = RenderPass::new_color_pass(device.clone(), format.format.into())?;
        let set_layout = DescriptorSetLayout::new_uniform(device.clone())?;
        let vertex_shader = ShaderModule::from_file(device.clone(), shader_path(config, ShaderStage::Vertex)?)?;
        let fragment_shader = ShaderModule::from_file(device.clone(), shader_path(config, ShaderStage::Fragment)?)?;
        let pipeline = GraphicsPipeline::new(
            device.clone(),
            render_pass.handle(),
            set_layout.handle(),
            &vertex_shader,
            &fragment_shader,
        )?;
        let command_pool = CommandPool::new(device.clone(), physical.graphics_family)?;

        log::info!(
            "Vulkan device ready: graphics family {}, present family {}, format {:?}",
            physical.graphics_family,
            physical.present_family,
            format.format
        );

        Ok(Self {
            resources: Mutex::new(Resources::default()),
            command_pool,
            pipeline,
            set_layout,
            render_pass,
            logical,
            surface,
            physical,
            _instance: instance,
            window: RefCell::new(window),
        })
    }

    fn device(&self) -> &ash::Device {
        &self.logical.device
    }

    fn resources(&self) -> MutexGuard<'_, Resources> {
        self.resources.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn allocate_memory(
        &self,
        requirements: vk::MemoryRequirements,
        properties: vk::MemoryPropertyFlags,
        operation: &'static str,
    ) -> RenderResult<vk::DeviceMemory> {
        let memory_type = self
            .physical
            .find_memory_type(requirements.memory_type_bits, properties)?;
        let allocate_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type);
        // SAFETY: allocate_info is fully initialized
        unsafe { self.device().allocate_memory(&allocate_info, None) }.map_err(vk_error(operation))
    }

    /// Host-visible, coherent buffer with its memory bound
    fn create_host_buffer(
        &self,
        size: u64,
        usage: vk::BufferUsageFlags,
    ) -> RenderResult<(vk::Buffer, vk::DeviceMemory)> {
        let device = self.device();
        let create_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        // SAFETY: create_info is fully initialized
        let buffer = unsafe { device.create_buffer(&create_info, None) }.map_err(vk_error("create_buffer"))?;

        // SAFETY: buffer was just created on this device
        let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };
        let bound = self
            .allocate_memory(
                requirements,
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
                "allocate_buffer_memory",
            )
            .and_then(|memory| {
                // SAFETY: memory was allocated against this buffer's requirements
                match unsafe { device.bind_buffer_memory(buffer, memory, 0) } {
                    Ok(()) => Ok(memory),
                    Err(e) => {
                        // SAFETY: memory is not bound to anything
                        unsafe { device.free_memory(memory, None) };
                        Err(vk_error("bind_buffer_memory")(e))
                    }
                }
            });
        match bound {
            Ok(memory) => Ok((buffer, memory)),
            Err(e) => {
                // SAFETY: buffer has no memory and is unused
                unsafe { device.destroy_buffer(buffer, None) };
                Err(e)
            }
        }
    }

    fn copy_to_memory(&self, memory: vk::DeviceMemory, offset: u64, data: &[u8]) -> RenderResult<()> {
        let device = self.device();
        // SAFETY: the range lies inside the allocation and the memory is host visible
        unsafe {
            let mapped = device
                .map_memory(memory, offset, data.len() as u64, vk::MemoryMapFlags::empty())
                .map_err(vk_error("map_memory"))?;
            ptr::copy_nonoverlapping(data.as_ptr(), mapped.cast::<u8>(), data.len());
            device.unmap_memory(memory);
        }
        Ok(())
    }

    /// Record, submit and wait for a one-time command buffer
    fn submit_one_time(&self, record: impl FnOnce(&ash::Device, vk::CommandBuffer)) -> RenderResult<()> {
        let device = self.device();
        let allocate_info = vk::CommandBufferAllocateInfo::builder()
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_pool(self.command_pool.handle())
            .command_buffer_count(1);
        // SAFETY: the pool belongs to this device
        let command_buffer = unsafe { device.allocate_command_buffers(&allocate_info) }
            .map_err(vk_error("allocate_command_buffers"))?
            .into_iter()
            .next()
            .ok_or_else(|| RenderError::InvalidOperation("No command buffer allocated".to_string()))?;

        let begin_info = vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        let command_buffers = [command_buffer];
        // SAFETY: command_buffer is freshly allocated and only used here
        let result = unsafe {
            device
                .begin_command_buffer(command_buffer, &begin_info)
                .map_err(vk_error("begin_command_buffer"))
                .and_then(|()| {
                    record(device, command_buffer);
                    device
                        .end_command_buffer(command_buffer)
                        .map_err(vk_error("end_command_buffer"))
                })
                .and_then(|()| {
                    let submit_info = vk::SubmitInfo::builder().command_buffers(&command_buffers);
                    device
                        .queue_submit(self.logical.graphics_queue, &[submit_info.build()], vk::Fence::null())
                        .map_err(vk_error("queue_submit"))
                })
                .and_then(|()| {
                    device
                        .queue_wait_idle(self.logical.graphics_queue)
                        .map_err(vk_error("queue_wait_idle"))
                })
        };
        // SAFETY: the queue is idle or the buffer was never submitted
        unsafe { device.free_command_buffers(self.command_pool.handle(), &command_buffers) };
        result
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        // SAFETY: nothing can use the device any more; wait for the GPU
        // before freeing what callers leaked
        unsafe {
            let _ = self.logical.device.device_wait_idle();
            let resources = self.resources.get_mut().unwrap_or_else(PoisonError::into_inner);
            if !resources.buffers.is_empty() || !resources.images.is_empty() {
                log::warn!(
                    "Freeing {} leaked buffers and {} leaked images",
                    resources.buffers.len(),
                    resources.images.len()
                );
            }
            for (raw, allocation) in resources.buffers.drain() {
                self.logical.device.destroy_buffer(vk::Buffer::from_raw(raw), None);
                self.logical.device.free_memory(allocation.memory, None);
            }
            for (raw, memory) in resources.images.drain() {
                self.logical.device.destroy_image(vk::Image::from_raw(raw), None);
                self.logical.device.free_memory(memory, None);
            }
        }
        log::debug!("Vulkan device destroyed");
    }
}

fn shader_path(config: &EngineConfig, stage: ShaderStage) -> RenderResult<&std::path::Path> {
    config
        .shaders
        .path(stage)
        .ok_or_else(|| RenderError::Shader(format!("No {stage:?} shader configured")))
}

fn query_surface_support(surface: &WindowSurface, physical: vk::PhysicalDevice) -> RenderResult<SurfaceSupport> {
    let loader = &surface.loader;
    // SAFETY: surface and physical device belong to the same instance
    let (capabilities, formats, present_modes) = unsafe {
        (
            loader
                .get_physical_device_surface_capabilities(physical, surface.surface)
                .map_err(vk_error("get_physical_device_surface_capabilities"))?,
            loader
                .get_physical_device_surface_formats(physical, surface.surface)
                .map_err(vk_error("get_physical_device_surface_formats"))?,
            loader
                .get_physical_device_surface_present_modes(physical, surface.surface)
                .map_err(vk_error("get_physical_device_surface_present_modes"))?,
        )
    };

    Ok(SurfaceSupport {
        capabilities: SurfaceCapabilities {
            min_image_count: capabilities.min_image_count,
            max_image_count: capabilities.max_image_count,
            current_extent: capabilities.current_extent.into(),
            min_image_extent: capabilities.min_image_extent.into(),
            max_image_extent: capabilities.max_image_extent.into(),
        },
        formats: formats.into_iter().map(Into::into).collect(),
        present_modes: present_modes.into_iter().filter_map(present_mode_from_vk).collect(),
    })
}

fn image_barrier(
    image: vk::Image,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
    src_access: vk::AccessFlags,
    dst_access: vk::AccessFlags,
) -> vk::ImageMemoryBarrier {
    vk::ImageMemoryBarrier::builder()
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(COLOR_RANGE)
        .src_access_mask(src_access)
        .dst_access_mask(dst_access)
        .build()
}

impl GpuDevice for VulkanDevice {
    fn poll_events(&self) -> SurfaceEvents {
        self.window.borrow_mut().poll_events()
    }

    fn window_extent(&self) -> Extent2D {
        self.window.borrow().framebuffer_extent()
    }

    fn surface_support(&self) -> RenderResult<SurfaceSupport> {
        query_surface_support(&self.surface, self.physical.device)
    }

    fn create_semaphore(&self) -> RenderResult<SemaphoreHandle> {
        let create_info = vk::SemaphoreCreateInfo::builder();
        // SAFETY: create_info is fully initialized
        let semaphore =
            unsafe { self.device().create_semaphore(&create_info, None) }.map_err(vk_error("create_semaphore"))?;
        Ok(SemaphoreHandle(semaphore.as_raw()))
    }

    fn destroy_semaphore(&self, semaphore: SemaphoreHandle) {
        // SAFETY: the owner waited for every submission using it
        unsafe { self.device().destroy_semaphore(vk::Semaphore::from_raw(semaphore.raw()), None) };
    }

    fn create_fence(&self, signaled: bool) -> RenderResult<FenceHandle> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let create_info = vk::FenceCreateInfo::builder().flags(flags);
        // SAFETY: create_info is fully initialized
        let fence = unsafe { self.device().create_fence(&create_info, None) }.map_err(vk_error("create_fence"))?;
        Ok(FenceHandle(fence.as_raw()))
    }

    fn destroy_fence(&self, fence: FenceHandle) {
        // SAFETY: the owner waited on the fence first
        unsafe { self.device().destroy_fence(vk::Fence::from_raw(fence.raw()), None) };
    }

    fn wait_for_fence(&self, fence: FenceHandle, timeout_ns: u64) -> RenderResult<()> {
        let fences = [vk::Fence::from_raw(fence.raw())];
        // SAFETY: the fence is alive
        unsafe { self.device().wait_for_fences(&fences, true, timeout_ns) }.map_err(vk_error("wait_for_fences"))
    }

    fn reset_fence(&self, fence: FenceHandle) -> RenderResult<()> {
        let fences = [vk::Fence::from_raw(fence.raw())];
        // SAFETY: the fence is not part of a pending submission
        unsafe { self.device().reset_fences(&fences) }.map_err(vk_error("reset_fences"))
    }

    fn wait_idle(&self) -> RenderResult<()> {
        // SAFETY: no other thread submits to this device
        unsafe { self.device().device_wait_idle() }.map_err(vk_error("device_wait_idle"))
    }

    fn create_swapchain(&self, desc: &SwapchainDesc) -> RenderResult<SwapchainHandle> {
        // SAFETY: surface and physical device belong to the same instance
        let capabilities = unsafe {
            self.surface
                .loader
                .get_physical_device_surface_capabilities(self.physical.device, self.surface.surface)
        }
        .map_err(vk_error("get_physical_device_surface_capabilities"))?;

        let families = self.physical.queue_family_indices();
        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(self.surface.surface)
            .min_image_count(desc.image_count)
            .image_format(desc.format.format.into())
            .image_color_space(desc.format.color_space.into())
            .image_extent(desc.extent.into())
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(desc.present_mode.into())
            .clipped(true);
        let create_info = if families.len() > 1 {
            create_info
                .image_sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(&families)
        } else {
            create_info.image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        };

        // SAFETY: any previous swap chain on this surface was destroyed
        let swapchain = unsafe { self.logical.swapchain_loader.create_swapchain(&create_info, None) }
            .map_err(vk_error("create_swapchain"))?;
        Ok(SwapchainHandle(swapchain.as_raw()))
    }

    fn swapchain_images(&self, swapchain: SwapchainHandle) -> RenderResult<Vec<ImageHandle>> {
        // SAFETY: the swap chain is alive
        let images = unsafe {
            self.logical
                .swapchain_loader
                .get_swapchain_images(vk::SwapchainKHR::from_raw(swapchain.raw()))
        }
        .map_err(vk_error("get_swapchain_images"))?;
        Ok(images.into_iter().map(|image| ImageHandle(image.as_raw())).collect())
    }

    fn destroy_swapchain(&self, swapchain: SwapchainHandle) {
        // SAFETY: views and framebuffers onto its images are already gone
        unsafe {
            self.logical
                .swapchain_loader
                .destroy_swapchain(vk::SwapchainKHR::from_raw(swapchain.raw()), None);
        }
    }

    fn acquire_next_image(&self, swapchain: SwapchainHandle, signal: SemaphoreHandle) -> RenderResult<AcquireOutcome> {
        // SAFETY: the semaphore is unsignaled with no pending wait
        let result = unsafe {
            self.logical.swapchain_loader.acquire_next_image(
                vk::SwapchainKHR::from_raw(swapchain.raw()),
                u64::MAX,
                vk::Semaphore::from_raw(signal.raw()),
                vk::Fence::null(),
            )
        };
        match result {
            Ok((image_index, suboptimal)) => Ok(AcquireOutcome::Acquired { image_index, suboptimal }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::OutOfDate),
            Err(e) => Err(vk_error("acquire_next_image")(e)),
        }
    }

    fn present(&self, swapchain: SwapchainHandle, image_index: u32, wait: SemaphoreHandle) -> RenderResult<PresentOutcome> {
        let wait_semaphores = [vk::Semaphore::from_raw(wait.raw())];
        let swapchains = [vk::SwapchainKHR::from_raw(swapchain.raw())];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        // SAFETY: the image was acquired and rendered to by a submission signaling `wait`
        match unsafe { self.logical.swapchain_loader.queue_present(self.logical.present_queue, &present_info) } {
            Ok(false) => Ok(PresentOutcome::Presented),
            Ok(true) => Ok(PresentOutcome::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::OutOfDate),
            Err(e) => Err(vk_error("queue_present")(e)),
        }
    }

    fn create_image_view(&self, image: ImageHandle, format: PixelFormat) -> RenderResult<ImageViewHandle> {
        let create_info = vk::ImageViewCreateInfo::builder()
            .image(vk::Image::from_raw(image.raw()))
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format.into())
            .components(vk::ComponentMapping::default())
            .subresource_range(COLOR_RANGE);
        // SAFETY: the image is alive
        let view =
            unsafe { self.device().create_image_view(&create_info, None) }.map_err(vk_error("create_image_view"))?;
        Ok(ImageViewHandle(view.as_raw()))
    }

    fn destroy_image_view(&self, view: ImageViewHandle) {
        // SAFETY: framebuffers using the view are already gone
        unsafe { self.device().destroy_image_view(vk::ImageView::from_raw(view.raw()), None) };
    }

    fn create_framebuffer(&self, view: ImageViewHandle, extent: Extent2D) -> RenderResult<FramebufferHandle> {
        let attachments = [vk::ImageView::from_raw(view.raw())];
        let create_info = vk::FramebufferCreateInfo::builder()
            .render_pass(self.render_pass.handle())
            .attachments(&attachments)
            .width(extent.width)
            .height(extent.height)
            .layers(1);
        // SAFETY: the view and render pass are alive
        let framebuffer =
            unsafe { self.device().create_framebuffer(&create_info, None) }.map_err(vk_error("create_framebuffer"))?;
        Ok(FramebufferHandle(framebuffer.as_raw()))
    }

    fn destroy_framebuffer(&self, framebuffer: FramebufferHandle) {
        // SAFETY: no pending submission uses the framebuffer
        unsafe { self.device().destroy_framebuffer(vk::Framebuffer::from_raw(framebuffer.raw()), None) };
    }

    fn create_image(&self, desc: &ImageDesc) -> RenderResult<ImageHandle> {
        if desc.extent.is_empty() {
            return Err(RenderError::InvalidOperation("Image with zero extent".to_string()));
        }
        let device = self.device();
        let create_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: desc.extent.width,
                height: desc.extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .format(desc.format.into())
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(desc.usage.into())
            .samples(vk::SampleCountFlags::TYPE_1)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        // SAFETY: create_info is fully initialized
        let image = unsafe { device.create_image(&create_info, None) }.map_err(vk_error("create_image"))?;

        // SAFETY: image was just created on this device
        let requirements = unsafe { device.get_image_memory_requirements(image) };
        let bound = self
            .allocate_memory(requirements, vk::MemoryPropertyFlags::DEVICE_LOCAL, "allocate_image_memory")
            .and_then(|memory| {
                // SAFETY: memory was allocated against this image's requirements
                match unsafe { device.bind_image_memory(image, memory, 0) } {
                    Ok(()) => Ok(memory),
                    Err(e) => {
                        // SAFETY: memory is not bound to anything
                        unsafe { device.free_memory(memory, None) };
                        Err(vk_error("bind_image_memory")(e))
                    }
                }
            });
        match bound {
            Ok(memory) => {
                self.resources().images.insert(image.as_raw(), memory);
                Ok(ImageHandle(image.as_raw()))
            }
            Err(e) => {
                // SAFETY: image has no memory and is unused
                unsafe { device.destroy_image(image, None) };
                Err(e)
            }
        }
    }

    fn upload_image(&self, image: ImageHandle, desc: &ImageDesc, pixels: &[u8]) -> RenderResult<()> {
        if let Some(bytes_per_pixel) = desc.format.bytes_per_pixel() {
            let expected = u64::from(desc.extent.width) * u64::from(desc.extent.height) * u64::from(bytes_per_pixel);
            if pixels.len() as u64 != expected {
                return Err(RenderError::InvalidOperation(format!(
                    "Image upload of {} bytes, expected {expected}",
                    pixels.len()
                )));
            }
        }
        if pixels.is_empty() {
            return Err(RenderError::InvalidOperation("Image upload without pixels".to_string()));
        }

        let (staging, memory) = self.create_host_buffer(pixels.len() as u64, vk::BufferUsageFlags::TRANSFER_SRC)?;
        let image = vk::Image::from_raw(image.raw());
        let extent = desc.extent;
        let result = self.copy_to_memory(memory, 0, pixels).and_then(|()| {
            self.submit_one_time(|device, command_buffer| {
                let to_transfer = image_barrier(
                    image,
                    vk::ImageLayout::UNDEFINED,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    vk::AccessFlags::empty(),
                    vk::AccessFlags::TRANSFER_WRITE,
                );
                let region = vk::BufferImageCopy::builder()
                    .buffer_offset(0)
                    .buffer_row_length(0)
                    .buffer_image_height(0)
                    .image_subresource(vk::ImageSubresourceLayers {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        mip_level: 0,
                        base_array_layer: 0,
                        layer_count: 1,
                    })
                    .image_offset(vk::Offset3D { x: 0, y: 0, z: 0 })
                    .image_extent(vk::Extent3D {
                        width: extent.width,
                        height: extent.height,
                        depth: 1,
                    })
                    .build();
                let to_shader = image_barrier(
                    image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    vk::AccessFlags::TRANSFER_WRITE,
                    vk::AccessFlags::SHADER_READ,
                );
                // SAFETY: command_buffer is recording and every handle is alive
                unsafe {
                    device.cmd_pipeline_barrier(
                        command_buffer,
                        vk::PipelineStageFlags::TOP_OF_PIPE,
                        vk::PipelineStageFlags::TRANSFER,
                        vk::DependencyFlags::empty(),
                        &[],
                        &[],
                        &[to_transfer],
                    );
                    device.cmd_copy_buffer_to_image(
                        command_buffer,
                        staging,
                        image,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &[region],
                    );
                    device.cmd_pipeline_barrier(
                        command_buffer,
                        vk::PipelineStageFlags::TRANSFER,
                        vk::PipelineStageFlags::FRAGMENT_SHADER,
                        vk::DependencyFlags::empty(),
                        &[],
                        &[],
                        &[to_shader],
                    );
                }
            })
        });

        // SAFETY: the copy finished or was never submitted
        unsafe {
            self.device().destroy_buffer(staging, None);
            self.device().free_memory(memory, None);
        }
        result
    }

    fn destroy_image(&self, image: ImageHandle) {
        let Some(memory) = self.resources().images.remove(&image.raw()) else {
            log::warn!("Ignoring destroy of unknown image {:#x}", image.raw());
            return;
        };
        // SAFETY: views onto the image are already gone
        unsafe {
            self.device().destroy_image(vk::Image::from_raw(image.raw()), None);
            self.device().free_memory(memory, None);
        }
    }

    fn create_sampler(&self, settings: &SamplerSettings) -> RenderResult<SamplerHandle> {
        let filter = settings.filter.into();
        let address_mode = settings.address_mode.into();
        let anisotropy = settings
            .max_anisotropy
            .filter(|_| self.logical.anisotropy_enabled)
            .map(|max| max.min(self.physical.properties.limits.max_sampler_anisotropy));

        let create_info = vk::SamplerCreateInfo::builder()
            .mag_filter(filter)
            .min_filter(filter)
            .address_mode_u(address_mode)
            .address_mode_v(address_mode)
            .address_mode_w(address_mode)
            .anisotropy_enable(anisotropy.is_some())
            .max_anisotropy(anisotropy.unwrap_or(1.0))
            .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
            .unnormalized_coordinates(false)
            .compare_enable(false)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR);
        // SAFETY: create_info is fully initialized
        let sampler = unsafe { self.device().create_sampler(&create_info, None) }.map_err(vk_error("create_sampler"))?;
        Ok(SamplerHandle(sampler.as_raw()))
    }

    fn destroy_sampler(&self, sampler: SamplerHandle) {
        // SAFETY: no pending submission samples with it
        unsafe { self.device().destroy_sampler(vk::Sampler::from_raw(sampler.raw()), None) };
    }

    fn create_buffer(&self, size: u64, usage: BufferUsage) -> RenderResult<BufferHandle> {
        if size == 0 {
            return Err(RenderError::InvalidOperation("Buffer of zero bytes".to_string()));
        }
        let (buffer, memory) = self.create_host_buffer(size, usage.into())?;
        self.resources().buffers.insert(buffer.as_raw(), Allocation { memory, size });
        Ok(BufferHandle(buffer.as_raw()))
    }

    fn write_buffer(&self, buffer: BufferHandle, offset: u64, data: &[u8]) -> RenderResult<()> {
        let memory = {
            let resources = self.resources();
            let allocation = resources
                .buffers
                .get(&buffer.raw())
                .ok_or_else(|| RenderError::InvalidOperation(format!("Write to unknown buffer {:#x}", buffer.raw())))?;
            if offset + data.len() as u64 > allocation.size {
                return Err(RenderError::InvalidOperation(format!(
                    "Write of {} bytes at {offset} overflows a {} byte buffer",
                    data.len(),
                    allocation.size
                )));
            }
            allocation.memory
        };
        if data.is_empty() {
            return Ok(());
        }
        self.copy_to_memory(memory, offset, data)
    }

    fn destroy_buffer(&self, buffer: BufferHandle) {
        let Some(allocation) = self.resources().buffers.remove(&buffer.raw()) else {
            log::warn!("Ignoring destroy of unknown buffer {:#x}", buffer.raw());
            return;
        };
        // SAFETY: no pending submission reads the buffer
        unsafe {
            self.device().destroy_buffer(vk::Buffer::from_raw(buffer.raw()), None);
            self.device().free_memory(allocation.memory, None);
        }
    }

    fn create_descriptor_pool(&self, max_sets: u32) -> RenderResult<DescriptorPoolHandle> {
        let pool_sizes = [vk::DescriptorPoolSize::builder()
            .ty(vk::DescriptorType::UNIFORM_BUFFER)
            .descriptor_count(max_sets)
            .build()];
        let create_info = vk::DescriptorPoolCreateInfo::builder()
            .max_sets(max_sets)
            .pool_sizes(&pool_sizes);
        // SAFETY: pool_sizes outlives the call
        let pool = unsafe { self.device().create_descriptor_pool(&create_info, None) }
            .map_err(vk_error("create_descriptor_pool"))?;
        Ok(DescriptorPoolHandle(pool.as_raw()))
    }

    fn reset_descriptor_pool(&self, pool: DescriptorPoolHandle) -> RenderResult<()> {
        // SAFETY: no pending submission uses a set from this pool
        unsafe {
            self.device()
                .reset_descriptor_pool(vk::DescriptorPool::from_raw(pool.raw()), vk::DescriptorPoolResetFlags::empty())
        }
        .map_err(vk_error("reset_descriptor_pool"))
    }

    fn destroy_descriptor_pool(&self, pool: DescriptorPoolHandle) {
        // SAFETY: no pending submission uses a set from this pool
        unsafe {
            self.device()
                .destroy_descriptor_pool(vk::DescriptorPool::from_raw(pool.raw()), None);
        }
    }

    fn allocate_descriptor_sets(&self, pool: DescriptorPoolHandle, count: u32) -> RenderResult<Vec<DescriptorSetHandle>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let layouts = vec![self.set_layout.handle(); count as usize];
        let allocate_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(vk::DescriptorPool::from_raw(pool.raw()))
            .set_layouts(&layouts);
        // SAFETY: the pool and layout are alive
        let sets = unsafe { self.device().allocate_descriptor_sets(&allocate_info) }
            .map_err(vk_error("allocate_descriptor_sets"))?;
        Ok(sets.into_iter().map(|set| DescriptorSetHandle(set.as_raw())).collect())
    }

    fn write_uniform_descriptor(&self, set: DescriptorSetHandle, region: BufferRegion) -> RenderResult<()> {
        let buffer_info = [vk::DescriptorBufferInfo::builder()
            .buffer(vk::Buffer::from_raw(region.buffer.raw()))
            .offset(region.offset)
            .range(region.range)
            .build()];
        let write = vk::WriteDescriptorSet::builder()
            .dst_set(vk::DescriptorSet::from_raw(set.raw()))
            .dst_binding(0)
            .dst_array_element(0)
            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
            .buffer_info(&buffer_info)
            .build();
        // SAFETY: the set is not used by a pending submission
        unsafe { self.device().update_descriptor_sets(&[write], &[]) };
        Ok(())
    }

    fn allocate_command_buffers(&self, count: u32) -> RenderResult<Vec<CommandBufferHandle>> {
        let allocate_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.command_pool.handle())
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);
        // SAFETY: the pool belongs to this device
        let buffers = unsafe { self.device().allocate_command_buffers(&allocate_info) }
            .map_err(vk_error("allocate_command_buffers"))?;
        Ok(buffers.into_iter().map(|buffer| CommandBufferHandle(buffer.as_raw())).collect())
    }

    fn free_command_buffer(&self, command_buffer: CommandBufferHandle) {
        // SAFETY: the buffer is not pending
        unsafe {
            self.device().free_command_buffers(
                self.command_pool.handle(),
                &[vk::CommandBuffer::from_raw(command_buffer.raw())],
            );
        }
    }

    fn begin_frame_commands(
        &self,
        command_buffer: CommandBufferHandle,
        framebuffer: FramebufferHandle,
        extent: Extent2D,
        clear_color: [f32; 4],
    ) -> RenderResult<()> {
        let device = self.device();
        let command_buffer = vk::CommandBuffer::from_raw(command_buffer.raw());
        let begin_info = vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        let clear_values = [vk::ClearValue {
            color: vk::ClearColorValue { float32: clear_color },
        }];
        let render_area = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: extent.into(),
        };
        let render_pass_info = vk::RenderPassBeginInfo::builder()
            .render_pass(self.render_pass.handle())
            .framebuffer(vk::Framebuffer::from_raw(framebuffer.raw()))
            .render_area(render_area)
            .clear_values(&clear_values);
        #[allow(clippy::cast_precision_loss)]
        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };

        // SAFETY: the command buffer's fence was waited on, so it is not pending
        unsafe {
            device
                .reset_command_buffer(command_buffer, vk::CommandBufferResetFlags::empty())
                .map_err(vk_error("reset_command_buffer"))?;
            device
                .begin_command_buffer(command_buffer, &begin_info)
                .map_err(vk_error("begin_command_buffer"))?;
            device.cmd_begin_render_pass(command_buffer, &render_pass_info, vk::SubpassContents::INLINE);
            device.cmd_bind_pipeline(command_buffer, vk::PipelineBindPoint::GRAPHICS, self.pipeline.handle());
            device.cmd_set_viewport(command_buffer, 0, &[viewport]);
            device.cmd_set_scissor(command_buffer, 0, &[render_area]);
        }
        Ok(())
    }

    fn cmd_draw_mesh(&self, command_buffer: CommandBufferHandle, draw: &MeshDraw) -> RenderResult<()> {
        let device = self.device();
        let command_buffer = vk::CommandBuffer::from_raw(command_buffer.raw());
        // SAFETY: the command buffer is recording inside the render pass
        unsafe {
            device.cmd_bind_vertex_buffers(command_buffer, 0, &[vk::Buffer::from_raw(draw.vertex_buffer.raw())], &[0]);
            device.cmd_bind_index_buffer(
                command_buffer,
                vk::Buffer::from_raw(draw.index_buffer.raw()),
                0,
                vk::IndexType::UINT16,
            );
            device.cmd_bind_descriptor_sets(
                command_buffer,
                vk::PipelineBindPoint::GRAPHICS,
                self.pipeline.layout(),
                0,
                &[vk::DescriptorSet::from_raw(draw.descriptor_set.raw())],
                &[],
            );
            device.cmd_draw_indexed(command_buffer, draw.index_count, 1, 0, 0, 0);
        }
        Ok(())
    }

    fn end_frame_commands(&self, command_buffer: CommandBufferHandle) -> RenderResult<()> {
        let command_buffer = vk::CommandBuffer::from_raw(command_buffer.raw());
        // SAFETY: the command buffer is recording inside the render pass
        unsafe {
            self.device().cmd_end_render_pass(command_buffer);
            self.device()
                .end_command_buffer(command_buffer)
                .map_err(vk_error("end_command_buffer"))
        }
    }

    fn submit(
        &self,
        command_buffer: CommandBufferHandle,
        wait: SemaphoreHandle,
        signal: SemaphoreHandle,
        fence: FenceHandle,
    ) -> RenderResult<()> {
        let wait_semaphores = [vk::Semaphore::from_raw(wait.raw())];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let command_buffers = [vk::CommandBuffer::from_raw(command_buffer.raw())];
        let signal_semaphores = [vk::Semaphore::from_raw(signal.raw())];
        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        // SAFETY: the fence was reset and every referenced object is alive
        unsafe {
            self.device().queue_submit(
                self.logical.graphics_queue,
                &[submit_info.build()],
                vk::Fence::from_raw(fence.raw()),
            )
        }
        .map_err(vk_error("queue_submit"))
    }
}
