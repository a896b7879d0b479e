//! Headless recording device
//!
//! Implements [`GpuDevice`] without a GPU or a window. Every call is checked
//! against the rules a Vulkan validation layer would enforce for this engine
//! (handle liveness, fence and semaphore states, resources touched while a
//! submission still uses them) and recorded as a [`DeviceEvent`].
//!
//! Submitted work stays pending until a fence wait or an idle wait retires
//! it, which makes the number of frames in flight observable. Acquire and
//! present results can be scripted to simulate stale swap chains.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::core::EngineConfig;
use crate::render::api::{
    AcquireOutcome, BufferHandle, BufferRegion, BufferUsage, ColorSpace, CommandBufferHandle,
    DescriptorPoolHandle, DescriptorSetHandle, Extent2D, FenceHandle, FramebufferHandle, GpuDevice,
    ImageDesc, ImageHandle, ImageViewHandle, MeshDraw, PixelFormat, PresentMode, PresentOutcome,
    SamplerHandle, SamplerSettings, SemaphoreHandle, SurfaceCapabilities, SurfaceEvents,
    SurfaceFormat, SurfaceSupport, SwapchainDesc, SwapchainHandle,
};
use crate::render::backends::BackendFactory;
use crate::render::{RenderError, RenderResult};

/// Surface and window the headless device pretends to present to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadlessConfig {
    /// Reported surface support
    pub support: SurfaceSupport,
    /// Window framebuffer size
    pub window_extent: Extent2D,
    /// Number of images every swap chain gets, regardless of the request
    pub image_count_override: Option<u32>,
}

impl Default for HeadlessConfig {
    fn default() -> Self {
        let extent = Extent2D::new(800, 600);
        Self {
            support: SurfaceSupport {
                capabilities: SurfaceCapabilities {
                    min_image_count: 2,
                    max_image_count: 3,
                    current_extent: extent,
                    min_image_extent: Extent2D::new(1, 1),
                    max_image_extent: Extent2D::new(4096, 4096),
                },
                formats: vec![
                    SurfaceFormat {
                        format: PixelFormat::B8G8R8A8Unorm,
                        color_space: ColorSpace::SrgbNonlinear,
                    },
                    SurfaceFormat {
                        format: PixelFormat::B8G8R8A8Srgb,
                        color_space: ColorSpace::SrgbNonlinear,
                    },
                ],
                present_modes: vec![PresentMode::Fifo, PresentMode::Mailbox],
            },
            window_extent: extent,
            image_count_override: None,
        }
    }
}

/// Injected result for the next acquire, present or submit call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scripted {
    /// Succeed but report the swap chain as suboptimal
    Suboptimal,
    /// Report the swap chain as out of date
    OutOfDate,
    /// Fail with a lost device
    DeviceLost,
}

/// One recorded device call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// `wait_idle`
    WaitIdle,
    /// `wait_for_fence`
    FenceWaited(FenceHandle),
    /// `reset_fence`
    FenceReset(FenceHandle),
    /// `create_swapchain`
    SwapchainCreated {
        /// New swap chain
        handle: SwapchainHandle,
        /// Requested configuration
        desc: SwapchainDesc,
        /// Images actually created
        image_count: u32,
    },
    /// `destroy_swapchain`
    SwapchainDestroyed(SwapchainHandle),
    /// `create_framebuffer`
    FramebufferCreated(FramebufferHandle),
    /// `destroy_framebuffer`
    FramebufferDestroyed(FramebufferHandle),
    /// `create_descriptor_pool`
    DescriptorPoolCreated {
        /// New pool
        handle: DescriptorPoolHandle,
        /// Set capacity
        max_sets: u32,
    },
    /// `reset_descriptor_pool`
    DescriptorPoolReset(DescriptorPoolHandle),
    /// `destroy_descriptor_pool`
    DescriptorPoolDestroyed(DescriptorPoolHandle),
    /// `allocate_descriptor_sets`
    DescriptorSetsAllocated {
        /// Source pool
        pool: DescriptorPoolHandle,
        /// Number of sets
        count: u32,
    },
    /// `create_buffer`
    BufferCreated {
        /// New buffer
        handle: BufferHandle,
        /// Size in bytes
        size: u64,
    },
    /// `destroy_buffer`
    BufferDestroyed(BufferHandle),
    /// `acquire_next_image`
    Acquired(AcquireOutcome),
    /// `submit`
    Submitted {
        /// Submitted command buffer
        command_buffer: CommandBufferHandle,
        /// Fence signaled on completion
        fence: FenceHandle,
        /// Number of draws recorded
        draw_count: usize,
    },
    /// `present`
    Presented {
        /// Presented image
        image_index: u32,
        /// Reported result
        outcome: PresentOutcome,
    },
}

/// Work handed to the queue and not yet retired
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    /// Command buffer that was executed
    pub command_buffer: CommandBufferHandle,
    /// Fence signaled on completion
    pub fence: FenceHandle,
    /// Target framebuffer
    pub framebuffer: FramebufferHandle,
    /// Recorded draws
    pub draws: Vec<MeshDraw>,
    /// Uniform regions bound by those draws at submission time
    pub uniform_regions: Vec<BufferRegion>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Fence,
    Semaphore,
    CommandBuffer,
    Buffer,
    Image,
    SwapchainImage,
    ImageView,
    Sampler,
    Framebuffer,
    Swapchain,
    DescriptorPool,
    DescriptorSet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FenceState {
    Signaled,
    Unsignaled,
    Pending,
}

#[derive(Debug, Default)]
struct Recording {
    framebuffer: Option<FramebufferHandle>,
    draws: Vec<MeshDraw>,
    open: bool,
}

#[derive(Debug)]
struct SwapchainState {
    images: Vec<u64>,
    next_image: u32,
}

#[derive(Debug, Default)]
struct State {
    next_id: u64,
    objects: HashMap<u64, Kind>,
    fences: HashMap<u64, FenceState>,
    views: HashMap<u64, u64>,
    semaphores: HashMap<u64, bool>,
    buffers: HashMap<u64, Vec<u8>>,
    images: HashMap<u64, Vec<u8>>,
    swapchains: HashMap<u64, SwapchainState>,
    pools: HashMap<u64, (u32, Vec<u64>)>,
    descriptor_writes: HashMap<u64, BufferRegion>,
    recordings: HashMap<u64, Recording>,
    in_flight: Vec<Submission>,
    retired: usize,
    max_in_flight: usize,
    acquire_script: VecDeque<Scripted>,
    present_script: VecDeque<Scripted>,
    submit_script: VecDeque<Scripted>,
    events: Vec<DeviceEvent>,
    errors: Vec<String>,
    pending_events: SurfaceEvents,
    config: HeadlessConfig,
}

impl State {
    fn alloc(&mut self, kind: Kind) -> u64 {
        self.next_id += 1;
        self.objects.insert(self.next_id, kind);
        self.next_id
    }

    fn invalid(&mut self, message: String) -> RenderError {
        log::error!("[headless] {message}");
        self.errors.push(message.clone());
        RenderError::InvalidOperation(message)
    }

    fn expect_live(&mut self, raw: u64, kind: Kind) -> RenderResult<()> {
        match self.objects.get(&raw) {
            Some(&found) if found == kind => Ok(()),
            Some(&found) => {
                Err(self.invalid(format!("Handle {raw} is a {found:?}, expected {kind:?}")))
            }
            None => Err(self.invalid(format!("Use of dead or unknown {kind:?} handle {raw}"))),
        }
    }

    fn destroy(&mut self, raw: u64, kind: Kind) -> bool {
        if self.expect_live(raw, kind).is_err() {
            return false;
        }
        self.objects.remove(&raw);
        true
    }

    fn pending(&self) -> impl Iterator<Item = &Submission> {
        self.in_flight.iter()
    }

    fn buffer_in_flight(&self, buffer: BufferHandle) -> bool {
        self.pending().any(|s| {
            s.draws.iter().any(|d| d.vertex_buffer == buffer || d.index_buffer == buffer)
                || s.uniform_regions.iter().any(|r| r.buffer == buffer)
        })
    }

    fn set_in_flight(&self, set: u64) -> bool {
        self.pending()
            .any(|s| s.draws.iter().any(|d| d.descriptor_set.raw() == set))
    }

    fn retire_fence(&mut self, fence: u64) {
        let before = self.in_flight.len();
        self.in_flight.retain(|s| s.fence.raw() != fence);
        self.retired += before - self.in_flight.len();
        self.fences.insert(fence, FenceState::Signaled);
    }

    fn retire_all(&mut self) {
        let pending: Vec<u64> = self
            .fences
            .iter()
            .filter(|(_, state)| **state == FenceState::Pending)
            .map(|(&fence, _)| fence)
            .collect();
        for fence in pending {
            self.retire_fence(fence);
        }
    }
}

/// Recording device for tests and CI
#[derive(Debug, Default)]
pub struct HeadlessDevice {
    state: Mutex<State>,
}

impl HeadlessDevice {
    /// Create a device with the default 800x600 surface
    pub fn new() -> Self {
        Self::with_config(HeadlessConfig::default())
    }

    /// Create a device with a custom surface
    pub fn with_config(config: HeadlessConfig) -> Self {
        Self {
            state: Mutex::new(State {
                config,
                ..State::default()
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // Scripting

    /// Make the next acquire report `outcome`
    pub fn script_acquire(&self, outcome: Scripted) {
        self.state().acquire_script.push_back(outcome);
    }

    /// Make the next present report `outcome`
    pub fn script_present(&self, outcome: Scripted) {
        self.state().present_script.push_back(outcome);
    }

    /// Make the next submit report `outcome`
    ///
    /// Only [`Scripted::DeviceLost`] is a possible submit result; the stale
    /// swap chain outcomes are rejected as invalid scripts.
    pub fn script_submit(&self, outcome: Scripted) {
        self.state().submit_script.push_back(outcome);
    }

    /// Simulate the user closing the window
    pub fn request_close(&self) {
        self.state().pending_events.close_requested = true;
    }

    /// Simulate a framebuffer resize; the surface follows the window
    pub fn resize_window(&self, extent: Extent2D) {
        let mut state = self.state();
        state.config.window_extent = extent;
        state.config.support.capabilities.current_extent = extent;
        state.pending_events.resized = true;
    }

    /// Replace the reported surface support
    pub fn set_surface_support(&self, support: SurfaceSupport) {
        self.state().config.support = support;
    }

    /// Force the number of images future swap chains get
    pub fn set_image_count_override(&self, count: Option<u32>) {
        self.state().config.image_count_override = count;
    }

    // Inspection

    /// Every recorded call, oldest first
    pub fn events(&self) -> Vec<DeviceEvent> {
        self.state().events.clone()
    }

    /// Number of recorded calls matching a predicate
    pub fn count_events(&self, predicate: impl Fn(&DeviceEvent) -> bool) -> usize {
        self.state().events.iter().filter(|e| predicate(e)).count()
    }

    /// Forget recorded calls
    pub fn clear_events(&self) {
        self.state().events.clear();
    }

    /// Rule violations detected so far
    pub fn validation_errors(&self) -> Vec<String> {
        self.state().errors.clone()
    }

    /// Number of live objects of any kind, swap chain images included
    pub fn live_object_count(&self) -> usize {
        self.state().objects.len()
    }

    /// Whether a raw handle is still alive
    pub fn is_live(&self, raw: u64) -> bool {
        self.state().objects.contains_key(&raw)
    }

    /// Submissions not yet retired by a fence or idle wait
    pub fn in_flight(&self) -> Vec<Submission> {
        self.state().in_flight.clone()
    }

    /// Highest number of simultaneously pending submissions
    pub fn max_in_flight(&self) -> usize {
        self.state().max_in_flight
    }

    /// Total submissions retired
    pub fn retired_count(&self) -> usize {
        self.state().retired
    }

    /// Current contents of a buffer
    pub fn buffer_contents(&self, buffer: BufferHandle) -> Option<Vec<u8>> {
        self.state().buffers.get(&buffer.raw()).cloned()
    }

    /// Current contents of an owned image
    pub fn image_contents(&self, image: ImageHandle) -> Option<Vec<u8>> {
        self.state().images.get(&image.raw()).cloned()
    }

    /// Region last written to a descriptor set
    pub fn descriptor_binding(&self, set: DescriptorSetHandle) -> Option<BufferRegion> {
        self.state().descriptor_writes.get(&set.raw()).copied()
    }
}

impl GpuDevice for HeadlessDevice {
    fn poll_events(&self) -> SurfaceEvents {
        std::mem::take(&mut self.state().pending_events)
    }

    fn window_extent(&self) -> Extent2D {
        self.state().config.window_extent
    }

    fn surface_support(&self) -> RenderResult<SurfaceSupport> {
        Ok(self.state().config.support.clone())
    }

    fn create_semaphore(&self) -> RenderResult<SemaphoreHandle> {
        let mut state = self.state();
        let raw = state.alloc(Kind::Semaphore);
        state.semaphores.insert(raw, false);
        Ok(SemaphoreHandle(raw))
    }

    fn destroy_semaphore(&self, semaphore: SemaphoreHandle) {
        let mut state = self.state();
        if state.destroy(semaphore.raw(), Kind::Semaphore) {
            state.semaphores.remove(&semaphore.raw());
        }
    }

    fn create_fence(&self, signaled: bool) -> RenderResult<FenceHandle> {
        let mut state = self.state();
        let raw = state.alloc(Kind::Fence);
        let initial = if signaled {
            FenceState::Signaled
        } else {
            FenceState::Unsignaled
        };
        state.fences.insert(raw, initial);
        Ok(FenceHandle(raw))
    }

    fn destroy_fence(&self, fence: FenceHandle) {
        let mut state = self.state();
        if state.fences.get(&fence.raw()) == Some(&FenceState::Pending) {
            state.invalid(format!(
                "Fence {} destroyed while its submission is pending",
                fence.raw()
            ));
        }
        if state.destroy(fence.raw(), Kind::Fence) {
            state.fences.remove(&fence.raw());
        }
    }

    fn wait_for_fence(&self, fence: FenceHandle, _timeout_ns: u64) -> RenderResult<()> {
        let mut state = self.state();
        state.expect_live(fence.raw(), Kind::Fence)?;
        state.events.push(DeviceEvent::FenceWaited(fence));
        match state.fences.get(&fence.raw()).copied() {
            Some(FenceState::Signaled) => Ok(()),
            Some(FenceState::Pending) => {
                state.retire_fence(fence.raw());
                Ok(())
            }
            _ => {
                state.invalid(format!(
                    "Waiting on unsignaled fence {} that nothing will signal",
                    fence.raw()
                ));
                Err(RenderError::Timeout {
                    operation: "fence wait",
                })
            }
        }
    }

    fn reset_fence(&self, fence: FenceHandle) -> RenderResult<()> {
        let mut state = self.state();
        state.expect_live(fence.raw(), Kind::Fence)?;
        if state.fences.get(&fence.raw()) == Some(&FenceState::Pending) {
            return Err(state.invalid(format!(
                "Reset of fence {} while its submission is pending",
                fence.raw()
            )));
        }
        state.fences.insert(fence.raw(), FenceState::Unsignaled);
        state.events.push(DeviceEvent::FenceReset(fence));
        Ok(())
    }

    fn wait_idle(&self) -> RenderResult<()> {
        let mut state = self.state();
        state.retire_all();
        state.events.push(DeviceEvent::WaitIdle);
        Ok(())
    }

    fn create_swapchain(&self, desc: &SwapchainDesc) -> RenderResult<SwapchainHandle> {
        let mut state = self.state();
        if desc.extent.is_empty() {
            return Err(state.invalid("Swap chain with zero extent".to_string()));
        }
        if !state.config.support.present_modes.contains(&desc.present_mode) {
            return Err(state.invalid(format!("Unsupported present mode {:?}", desc.present_mode)));
        }
        let image_count = state.config.image_count_override.unwrap_or(desc.image_count);
        let handle = state.alloc(Kind::Swapchain);
        let images = (0..image_count).map(|_| state.alloc(Kind::SwapchainImage)).collect();
        state.swapchains.insert(
            handle,
            SwapchainState {
                images,
                next_image: 0,
            },
        );
        state.events.push(DeviceEvent::SwapchainCreated {
            handle: SwapchainHandle(handle),
            desc: *desc,
            image_count,
        });
        Ok(SwapchainHandle(handle))
    }

    fn swapchain_images(&self, swapchain: SwapchainHandle) -> RenderResult<Vec<ImageHandle>> {
        let mut state = self.state();
        state.expect_live(swapchain.raw(), Kind::Swapchain)?;
        Ok(state
            .swapchains
            .get(&swapchain.raw())
            .map(|s| s.images.iter().copied().map(ImageHandle).collect())
            .unwrap_or_default())
    }

    fn destroy_swapchain(&self, swapchain: SwapchainHandle) {
        let mut state = self.state();
        if !state.destroy(swapchain.raw(), Kind::Swapchain) {
            return;
        }
        if let Some(chain) = state.swapchains.remove(&swapchain.raw()) {
            let dangling = state
                .views
                .values()
                .filter(|image| chain.images.contains(image))
                .count();
            if dangling > 0 {
                state.invalid(format!(
                    "Swap chain {} destroyed while {dangling} views of its images are alive",
                    swapchain.raw()
                ));
            }
            for image in chain.images {
                state.objects.remove(&image);
            }
        }
        state.events.push(DeviceEvent::SwapchainDestroyed(swapchain));
    }

    fn acquire_next_image(
        &self,
        swapchain: SwapchainHandle,
        signal: SemaphoreHandle,
    ) -> RenderResult<AcquireOutcome> {
        let mut state = self.state();
        state.expect_live(swapchain.raw(), Kind::Swapchain)?;
        state.expect_live(signal.raw(), Kind::Semaphore)?;

        let scripted = state.acquire_script.pop_front();
        let outcome = match scripted {
            Some(Scripted::OutOfDate) => AcquireOutcome::OutOfDate,
            Some(Scripted::DeviceLost) => return Err(RenderError::DeviceLost),
            other => {
                if state.semaphores.get(&signal.raw()) == Some(&true) {
                    return Err(state.invalid(format!(
                        "Acquire signals semaphore {} with a pending signal",
                        signal.raw()
                    )));
                }
                state.semaphores.insert(signal.raw(), true);
                let chain = state
                    .swapchains
                    .get_mut(&swapchain.raw())
                    .ok_or_else(|| {
                        RenderError::InvalidOperation("Swap chain state missing".to_string())
                    })?;
                let count = u32::try_from(chain.images.len()).unwrap_or(u32::MAX).max(1);
                let image_index = chain.next_image % count;
                chain.next_image = chain.next_image.wrapping_add(1);
                AcquireOutcome::Acquired {
                    image_index,
                    suboptimal: other == Some(Scripted::Suboptimal),
                }
            }
        };
        state.events.push(DeviceEvent::Acquired(outcome));
        Ok(outcome)
    }

    fn present(
        &self,
        swapchain: SwapchainHandle,
        image_index: u32,
        wait: SemaphoreHandle,
    ) -> RenderResult<PresentOutcome> {
        let mut state = self.state();
        state.expect_live(swapchain.raw(), Kind::Swapchain)?;
        state.expect_live(wait.raw(), Kind::Semaphore)?;
        let image_count = state.swapchains.get(&swapchain.raw()).map_or(0, |s| s.images.len());
        if image_index as usize >= image_count {
            return Err(state.invalid(format!(
                "Present of image {image_index} from a {image_count}-image swap chain"
            )));
        }
        if state.semaphores.get(&wait.raw()) != Some(&true) {
            return Err(state.invalid(format!(
                "Present waits on semaphore {} that nothing signals",
                wait.raw()
            )));
        }
        state.semaphores.insert(wait.raw(), false);

        let outcome = match state.present_script.pop_front() {
            None => PresentOutcome::Presented,
            Some(Scripted::Suboptimal) => PresentOutcome::Suboptimal,
            Some(Scripted::OutOfDate) => PresentOutcome::OutOfDate,
            Some(Scripted::DeviceLost) => return Err(RenderError::DeviceLost),
        };
        state.events.push(DeviceEvent::Presented {
            image_index,
            outcome,
        });
        Ok(outcome)
    }

    fn create_image_view(
        &self,
        image: ImageHandle,
        _format: PixelFormat,
    ) -> RenderResult<ImageViewHandle> {
        let mut state = self.state();
        match state.objects.get(&image.raw()) {
            Some(Kind::Image | Kind::SwapchainImage) => {}
            _ => {
                return Err(state.invalid(format!("View of dead or unknown image {}", image.raw())))
            }
        }
        let raw = state.alloc(Kind::ImageView);
        state.views.insert(raw, image.raw());
        Ok(ImageViewHandle(raw))
    }

    fn destroy_image_view(&self, view: ImageViewHandle) {
        let mut state = self.state();
        if state.destroy(view.raw(), Kind::ImageView) {
            state.views.remove(&view.raw());
        }
    }

    fn create_framebuffer(
        &self,
        view: ImageViewHandle,
        extent: Extent2D,
    ) -> RenderResult<FramebufferHandle> {
        let mut state = self.state();
        state.expect_live(view.raw(), Kind::ImageView)?;
        if extent.is_empty() {
            return Err(state.invalid("Framebuffer with zero extent".to_string()));
        }
        let handle = FramebufferHandle(state.alloc(Kind::Framebuffer));
        state.events.push(DeviceEvent::FramebufferCreated(handle));
        Ok(handle)
    }

    fn destroy_framebuffer(&self, framebuffer: FramebufferHandle) {
        let mut state = self.state();
        if state.pending().any(|s| s.framebuffer == framebuffer) {
            state.invalid(format!("Framebuffer {} destroyed while in use", framebuffer.raw()));
        }
        if state.destroy(framebuffer.raw(), Kind::Framebuffer) {
            state.events.push(DeviceEvent::FramebufferDestroyed(framebuffer));
        }
    }

    fn create_image(&self, desc: &ImageDesc) -> RenderResult<ImageHandle> {
        let mut state = self.state();
        let bytes = desc.format.bytes_per_pixel().unwrap_or(4) as usize;
        let size = desc.extent.width as usize * desc.extent.height as usize * bytes;
        let raw = state.alloc(Kind::Image);
        state.images.insert(raw, vec![0; size]);
        Ok(ImageHandle(raw))
    }

    fn upload_image(
        &self,
        image: ImageHandle,
        _desc: &ImageDesc,
        pixels: &[u8],
    ) -> RenderResult<()> {
        let mut state = self.state();
        state.expect_live(image.raw(), Kind::Image)?;
        let contents = state
            .images
            .get_mut(&image.raw())
            .ok_or_else(|| RenderError::InvalidOperation("Image contents missing".to_string()))?;
        if contents.len() != pixels.len() {
            let message = format!(
                "Upload of {} bytes into {}-byte image",
                pixels.len(),
                contents.len()
            );
            return Err(state.invalid(message));
        }
        contents.copy_from_slice(pixels);
        Ok(())
    }

    fn destroy_image(&self, image: ImageHandle) {
        let mut state = self.state();
        if state.views.values().any(|&viewed| viewed == image.raw()) {
            state.invalid(format!("Image {} destroyed before its views", image.raw()));
        }
        if state.destroy(image.raw(), Kind::Image) {
            state.images.remove(&image.raw());
        }
    }

    fn create_sampler(&self, _settings: &SamplerSettings) -> RenderResult<SamplerHandle> {
        Ok(SamplerHandle(self.state().alloc(Kind::Sampler)))
    }

    fn destroy_sampler(&self, sampler: SamplerHandle) {
        self.state().destroy(sampler.raw(), Kind::Sampler);
    }

    fn create_buffer(&self, size: u64, _usage: BufferUsage) -> RenderResult<BufferHandle> {
        let mut state = self.state();
        let len = usize::try_from(size).map_err(|_| RenderError::OutOfMemory {
            operation: "create_buffer",
        })?;
        let raw = state.alloc(Kind::Buffer);
        state.buffers.insert(raw, vec![0; len]);
        state.events.push(DeviceEvent::BufferCreated {
            handle: BufferHandle(raw),
            size,
        });
        Ok(BufferHandle(raw))
    }

    fn write_buffer(&self, buffer: BufferHandle, offset: u64, data: &[u8]) -> RenderResult<()> {
        let mut state = self.state();
        state.expect_live(buffer.raw(), Kind::Buffer)?;
        let start = offset as usize;
        let end = start + data.len();

        let touches_pending = state.pending().any(|s| {
            s.draws.iter().any(|d| d.vertex_buffer == buffer || d.index_buffer == buffer)
                || s.uniform_regions.iter().any(|r| {
                    r.buffer == buffer
                        && (r.offset as usize) < end
                        && start < (r.offset + r.range) as usize
                })
        });
        if touches_pending {
            return Err(state.invalid(format!(
                "Write to bytes {start}..{end} of buffer {} while a pending submission reads them",
                buffer.raw()
            )));
        }

        let contents = state
            .buffers
            .get_mut(&buffer.raw())
            .ok_or_else(|| RenderError::InvalidOperation("Buffer contents missing".to_string()))?;
        if end > contents.len() {
            let message = format!("Write past end of {}-byte buffer", contents.len());
            return Err(state.invalid(message));
        }
        contents[start..end].copy_from_slice(data);
        Ok(())
    }

    fn destroy_buffer(&self, buffer: BufferHandle) {
        let mut state = self.state();
        if state.buffer_in_flight(buffer) {
            state.invalid(format!("Buffer {} destroyed while in use", buffer.raw()));
        }
        if state.destroy(buffer.raw(), Kind::Buffer) {
            state.buffers.remove(&buffer.raw());
            state.events.push(DeviceEvent::BufferDestroyed(buffer));
        }
    }

    fn create_descriptor_pool(&self, max_sets: u32) -> RenderResult<DescriptorPoolHandle> {
        let mut state = self.state();
        if max_sets == 0 {
            return Err(state.invalid("Descriptor pool with zero sets".to_string()));
        }
        let raw = state.alloc(Kind::DescriptorPool);
        state.pools.insert(raw, (max_sets, Vec::new()));
        let handle = DescriptorPoolHandle(raw);
        state.events.push(DeviceEvent::DescriptorPoolCreated { handle, max_sets });
        Ok(handle)
    }

    fn reset_descriptor_pool(&self, pool: DescriptorPoolHandle) -> RenderResult<()> {
        let mut state = self.state();
        state.expect_live(pool.raw(), Kind::DescriptorPool)?;
        let sets = state.pools.get(&pool.raw()).map(|(_, sets)| sets.clone()).unwrap_or_default();
        if sets.iter().any(|&set| state.set_in_flight(set)) {
            return Err(state.invalid(format!(
                "Descriptor pool {} reset while its sets are in use",
                pool.raw()
            )));
        }
        for set in &sets {
            state.objects.remove(set);
            state.descriptor_writes.remove(set);
        }
        if let Some((_, live)) = state.pools.get_mut(&pool.raw()) {
            live.clear();
        }
        state.events.push(DeviceEvent::DescriptorPoolReset(pool));
        Ok(())
    }

    fn destroy_descriptor_pool(&self, pool: DescriptorPoolHandle) {
        let mut state = self.state();
        let sets = state.pools.get(&pool.raw()).map(|(_, sets)| sets.clone()).unwrap_or_default();
        if sets.iter().any(|&set| state.set_in_flight(set)) {
            state.invalid(format!(
                "Descriptor pool {} destroyed while its sets are in use",
                pool.raw()
            ));
        }
        if !state.destroy(pool.raw(), Kind::DescriptorPool) {
            return;
        }
        for set in &sets {
            state.objects.remove(set);
            state.descriptor_writes.remove(set);
        }
        state.pools.remove(&pool.raw());
        state.events.push(DeviceEvent::DescriptorPoolDestroyed(pool));
    }

    fn allocate_descriptor_sets(
        &self,
        pool: DescriptorPoolHandle,
        count: u32,
    ) -> RenderResult<Vec<DescriptorSetHandle>> {
        let mut state = self.state();
        state.expect_live(pool.raw(), Kind::DescriptorPool)?;
        let (max_sets, live) = state
            .pools
            .get(&pool.raw())
            .map(|(m, s)| (*m, s.len()))
            .unwrap_or_default();
        if live + count as usize > max_sets as usize {
            return Err(RenderError::OutOfMemory {
                operation: "allocate_descriptor_sets",
            });
        }
        let sets: Vec<u64> = (0..count).map(|_| state.alloc(Kind::DescriptorSet)).collect();
        if let Some((_, live)) = state.pools.get_mut(&pool.raw()) {
            live.extend(&sets);
        }
        state.events.push(DeviceEvent::DescriptorSetsAllocated { pool, count });
        Ok(sets.into_iter().map(DescriptorSetHandle).collect())
    }

    fn write_uniform_descriptor(
        &self,
        set: DescriptorSetHandle,
        region: BufferRegion,
    ) -> RenderResult<()> {
        let mut state = self.state();
        state.expect_live(set.raw(), Kind::DescriptorSet)?;
        state.expect_live(region.buffer.raw(), Kind::Buffer)?;
        if state.set_in_flight(set.raw()) {
            return Err(state.invalid(format!("Descriptor set {} updated while in use", set.raw())));
        }
        state.descriptor_writes.insert(set.raw(), region);
        Ok(())
    }

    fn allocate_command_buffers(&self, count: u32) -> RenderResult<Vec<CommandBufferHandle>> {
        let mut state = self.state();
        Ok((0..count)
            .map(|_| {
                let raw = state.alloc(Kind::CommandBuffer);
                state.recordings.insert(raw, Recording::default());
                CommandBufferHandle(raw)
            })
            .collect())
    }

    fn free_command_buffer(&self, command_buffer: CommandBufferHandle) {
        let mut state = self.state();
        if state.pending().any(|s| s.command_buffer == command_buffer) {
            state.invalid(format!("Command buffer {} freed while pending", command_buffer.raw()));
        }
        if state.destroy(command_buffer.raw(), Kind::CommandBuffer) {
            state.recordings.remove(&command_buffer.raw());
        }
    }

    fn begin_frame_commands(
        &self,
        command_buffer: CommandBufferHandle,
        framebuffer: FramebufferHandle,
        _extent: Extent2D,
        _clear_color: [f32; 4],
    ) -> RenderResult<()> {
        let mut state = self.state();
        state.expect_live(command_buffer.raw(), Kind::CommandBuffer)?;
        state.expect_live(framebuffer.raw(), Kind::Framebuffer)?;
        if state.pending().any(|s| s.command_buffer == command_buffer) {
            return Err(state.invalid(format!(
                "Command buffer {} reset while pending",
                command_buffer.raw()
            )));
        }
        let recording = state.recordings.entry(command_buffer.raw()).or_default();
        recording.framebuffer = Some(framebuffer);
        recording.draws.clear();
        recording.open = true;
        Ok(())
    }

    fn cmd_draw_mesh(
        &self,
        command_buffer: CommandBufferHandle,
        draw: &MeshDraw,
    ) -> RenderResult<()> {
        let mut state = self.state();
        state.expect_live(draw.vertex_buffer.raw(), Kind::Buffer)?;
        state.expect_live(draw.index_buffer.raw(), Kind::Buffer)?;
        state.expect_live(draw.descriptor_set.raw(), Kind::DescriptorSet)?;
        if !state.descriptor_writes.contains_key(&draw.descriptor_set.raw()) {
            return Err(state.invalid(format!(
                "Draw binds descriptor set {} that was never written",
                draw.descriptor_set.raw()
            )));
        }
        match state.recordings.get_mut(&command_buffer.raw()) {
            Some(recording) if recording.open => {
                recording.draws.push(*draw);
                Ok(())
            }
            _ => Err(state.invalid(format!(
                "Draw into command buffer {} outside recording",
                command_buffer.raw()
            ))),
        }
    }

    fn end_frame_commands(&self, command_buffer: CommandBufferHandle) -> RenderResult<()> {
        let mut state = self.state();
        match state.recordings.get_mut(&command_buffer.raw()) {
            Some(recording) if recording.open => {
                recording.open = false;
                Ok(())
            }
            _ => Err(state.invalid(format!(
                "End of command buffer {} that is not recording",
                command_buffer.raw()
            ))),
        }
    }

    fn submit(
        &self,
        command_buffer: CommandBufferHandle,
        wait: SemaphoreHandle,
        signal: SemaphoreHandle,
        fence: FenceHandle,
    ) -> RenderResult<()> {
        let mut state = self.state();
        state.expect_live(command_buffer.raw(), Kind::CommandBuffer)?;
        state.expect_live(fence.raw(), Kind::Fence)?;
        if state.fences.get(&fence.raw()) != Some(&FenceState::Unsignaled) {
            return Err(state.invalid(format!(
                "Submit with fence {} that is not unsignaled",
                fence.raw()
            )));
        }
        if state.semaphores.get(&wait.raw()) != Some(&true) {
            return Err(state.invalid(format!(
                "Submit waits on semaphore {} that nothing signals",
                wait.raw()
            )));
        }
        if state.semaphores.get(&signal.raw()) != Some(&false) {
            return Err(state.invalid(format!(
                "Submit signals semaphore {} that is not unsignaled",
                signal.raw()
            )));
        }

        let (framebuffer, draws) = match state.recordings.get_mut(&command_buffer.raw()) {
            Some(recording) if !recording.open => (recording.framebuffer, recording.draws.clone()),
            _ => {
                return Err(state.invalid(format!(
                    "Submit of command buffer {} that is not executable",
                    command_buffer.raw()
                )))
            }
        };
        let framebuffer = framebuffer.ok_or_else(|| {
            RenderError::InvalidOperation("Submission without framebuffer".to_string())
        })?;
        state.expect_live(framebuffer.raw(), Kind::Framebuffer)?;

        match state.submit_script.pop_front() {
            None => {}
            Some(Scripted::DeviceLost) => return Err(RenderError::DeviceLost),
            Some(other) => return Err(state.invalid(format!("Submit cannot report {other:?}"))),
        }

        let mut seen = HashSet::new();
        let uniform_regions = draws
            .iter()
            .filter(|d| seen.insert(d.descriptor_set))
            .filter_map(|d| state.descriptor_writes.get(&d.descriptor_set.raw()).copied())
            .collect();

        state.semaphores.insert(wait.raw(), false);
        state.semaphores.insert(signal.raw(), true);
        state.fences.insert(fence.raw(), FenceState::Pending);
        state.events.push(DeviceEvent::Submitted {
            command_buffer,
            fence,
            draw_count: draws.len(),
        });
        state.in_flight.push(Submission {
            command_buffer,
            fence,
            framebuffer,
            draws,
            uniform_regions,
        });
        state.max_in_flight = state.max_in_flight.max(state.in_flight.len());
        Ok(())
    }
}

/// Factory handing the same shared headless device to the render thread
#[derive(Debug, Clone)]
pub struct HeadlessBackend {
    device: Arc<HeadlessDevice>,
}

impl HeadlessBackend {
    /// Wrap a device so the test keeps a handle for inspection
    pub fn new(device: Arc<HeadlessDevice>) -> Self {
        Self { device }
    }
}

impl BackendFactory for HeadlessBackend {
    type Device = HeadlessDevice;

    fn create_device(&self, config: &EngineConfig) -> RenderResult<Arc<HeadlessDevice>> {
        log::info!(
            "Using headless device for '{}' ({}x{})",
            config.window.title,
            config.window.width,
            config.window.height
        );
        Ok(Arc::clone(&self.device))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn submit_one(
        device: &HeadlessDevice,
        fence: FenceHandle,
    ) -> (SemaphoreHandle, SemaphoreHandle) {
        let image = device
            .create_image(&ImageDesc {
                extent: Extent2D::new(4, 4),
                format: PixelFormat::B8G8R8A8Srgb,
                usage: crate::render::api::ImageUsage::COLOR_ATTACHMENT,
            })
            .unwrap();
        let view = device.create_image_view(image, PixelFormat::B8G8R8A8Srgb).unwrap();
        let framebuffer = device.create_framebuffer(view, Extent2D::new(4, 4)).unwrap();
        let cb = device.allocate_command_buffers(1).unwrap()[0];
        let acquired = device.create_semaphore().unwrap();
        let finished = device.create_semaphore().unwrap();

        let desc = SwapchainDesc {
            image_count: 2,
            format: HeadlessConfig::default().support.formats[0],
            extent: Extent2D::new(4, 4),
            present_mode: PresentMode::Fifo,
        };
        let swapchain = device.create_swapchain(&desc).unwrap();
        device.acquire_next_image(swapchain, acquired).unwrap();
        device.begin_frame_commands(cb, framebuffer, Extent2D::new(4, 4), [0.0; 4]).unwrap();
        device.end_frame_commands(cb).unwrap();
        device.reset_fence(fence).unwrap();
        device.submit(cb, acquired, finished, fence).unwrap();
        (acquired, finished)
    }

    #[test]
    fn submission_stays_pending_until_fence_wait() {
        let device = HeadlessDevice::new();
        let fence = device.create_fence(true).unwrap();
        submit_one(&device, fence);

        assert_eq!(device.in_flight().len(), 1);
        assert!(device.reset_fence(fence).is_err());

        device.wait_for_fence(fence, u64::MAX).unwrap();
        assert!(device.in_flight().is_empty());
        assert_eq!(device.retired_count(), 1);
    }

    #[test]
    fn waiting_on_reset_fence_times_out() {
        let device = HeadlessDevice::new();
        let fence = device.create_fence(true).unwrap();
        device.reset_fence(fence).unwrap();
        assert!(matches!(
            device.wait_for_fence(fence, 1_000),
            Err(RenderError::Timeout { .. })
        ));
        assert_eq!(device.validation_errors().len(), 1);
    }

    #[test]
    fn scripted_outcomes_are_consumed_in_order() {
        let device = HeadlessDevice::new();
        let desc = SwapchainDesc {
            image_count: 2,
            format: HeadlessConfig::default().support.formats[0],
            extent: Extent2D::new(8, 8),
            present_mode: PresentMode::Fifo,
        };
        let swapchain = device.create_swapchain(&desc).unwrap();
        let semaphore = device.create_semaphore().unwrap();

        device.script_acquire(Scripted::OutOfDate);
        device.script_acquire(Scripted::Suboptimal);
        assert_eq!(
            device.acquire_next_image(swapchain, semaphore).unwrap(),
            AcquireOutcome::OutOfDate
        );
        assert_eq!(
            device.acquire_next_image(swapchain, semaphore).unwrap(),
            AcquireOutcome::Acquired {
                image_index: 0,
                suboptimal: true
            }
        );
        // The semaphore now has a pending signal; acquiring with it again is misuse
        assert!(device.acquire_next_image(swapchain, semaphore).is_err());
    }

    #[test]
    fn image_count_override_applies() {
        let device = HeadlessDevice::new();
        device.set_image_count_override(Some(5));
        let desc = SwapchainDesc {
            image_count: 3,
            format: HeadlessConfig::default().support.formats[0],
            extent: Extent2D::new(8, 8),
            present_mode: PresentMode::Fifo,
        };
        let swapchain = device.create_swapchain(&desc).unwrap();
        assert_eq!(device.swapchain_images(swapchain).unwrap().len(), 5);
        device.destroy_swapchain(swapchain);
        assert_eq!(device.live_object_count(), 0);
    }

    #[test]
    fn descriptor_pool_limits_and_reset() {
        let device = HeadlessDevice::new();
        let pool = device.create_descriptor_pool(4).unwrap();
        let sets = device.allocate_descriptor_sets(pool, 4).unwrap();
        assert!(matches!(
            device.allocate_descriptor_sets(pool, 1),
            Err(RenderError::OutOfMemory { .. })
        ));

        device.reset_descriptor_pool(pool).unwrap();
        assert!(!device.is_live(sets[0].raw()));
        assert_eq!(device.allocate_descriptor_sets(pool, 2).unwrap().len(), 2);

        device.destroy_descriptor_pool(pool);
        assert_eq!(device.live_object_count(), 0);
    }

    #[test]
    fn window_events_are_drained_by_poll() {
        let device = HeadlessDevice::new();
        device.resize_window(Extent2D::new(640, 480));
        device.request_close();

        let events = device.poll_events();
        assert!(events.resized && events.close_requested);
        assert_eq!(device.poll_events(), SurfaceEvents::default());
        assert_eq!(device.window_extent(), Extent2D::new(640, 480));
        assert_eq!(
            device.surface_support().unwrap().capabilities.current_extent,
            Extent2D::new(640, 480)
        );
    }
}
