//! Frame driver
//!
//! Runs the per-frame protocol on the render thread:
//!
//! 1. wait for the frame slot's fence
//! 2. bring GPU resources in line with the registry (new objects, mesh
//!    uploads, descriptor capacity)
//! 3. acquire a swap chain image
//! 4. record and submit the slot's command buffer
//! 5. present and advance the frame counter
//!
//! A stale swap chain is never an error. Out-of-date on acquire abandons
//! the frame and rebuilds the surface; suboptimal results and window
//! resizes rebuild it after the frame was presented.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::core::RendererConfig;
use crate::foundation::math::{utils, Mat4, Mat4Ext, Vec3};
use crate::foundation::task::StopSignal;
use crate::foundation::time::{FrameTiming, Timer};
use crate::render::api::{AcquireOutcome, CommandBufferHandle, GpuDevice, SurfaceEvents, UniformBufferObject};
use crate::render::frame::surface::{choose_extent, PresentationSurface};
use crate::render::frame::sync::FrameSlots;
use crate::render::resources::{MeshBuffers, ResourcePool, UniformBuffer};
use crate::render::RenderResult;
use crate::scene::{ObjectRegistry, RenderObject};

const CAMERA_EYE: [f32; 3] = [0.0, 0.0, 3.0];
const FIELD_OF_VIEW_DEGREES: f32 = 45.0;
const NEAR_PLANE: f32 = 0.1;
const FAR_PLANE: f32 = 100.0;

/// Back-off while the window is minimized
const MINIMIZED_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// What happened to one call of [`FrameDriver::render_frame`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// A frame was submitted and presented
    Presented,
    /// The swap chain was rebuilt; a frame may or may not have been presented
    Recreated,
    /// Nothing was rendered because the window has no area
    Skipped,
}

/// GPU half of a render object
struct ObjectResources<D: GpuDevice> {
    mesh: MeshBuffers<D>,
    uniform: UniformBuffer<D>,
    uploaded: (u64, u64),
}

impl<D: GpuDevice> ObjectResources<D> {
    fn new(device: &Arc<D>, frames: usize) -> RenderResult<Self> {
        Ok(Self {
            mesh: MeshBuffers::new(device),
            uniform: UniformBuffer::create(device, frames)?,
            uploaded: (0, 0),
        })
    }

    fn needs_upload(&self, object: &RenderObject) -> bool {
        object.mesh_revision() != self.uploaded
    }

    /// Copy changed mesh data; the device must be idle
    fn upload(&mut self, object: &RenderObject) -> RenderResult<()> {
        object.with_mesh(|mesh| {
            if mesh.vertex_revision != self.uploaded.0 {
                let outcome = self.mesh.upload_vertices(&mesh.vertices)?;
                log::trace!("Vertex upload ({} vertices): {outcome:?}", mesh.vertices.len());
                self.uploaded.0 = mesh.vertex_revision;
            }
            if mesh.index_revision != self.uploaded.1 {
                let outcome = self.mesh.upload_indices(&mesh.indices)?;
                log::trace!("Index upload ({} indices): {outcome:?}", mesh.indices.len());
                self.uploaded.1 = mesh.index_revision;
            }
            Ok(())
        })
    }
}

/// Owner of every per-frame GPU resource
pub struct FrameDriver<D: GpuDevice> {
    pool: ResourcePool<D>,
    slots: FrameSlots<D>,
    surface: PresentationSurface<D>,
    objects: Vec<ObjectResources<D>>,
    registry: Arc<ObjectRegistry>,
    device: Arc<D>,
    frame_counter: u64,
    surface_stale: bool,
    clear_color: [f32; 4],
    frame_timer: Timer,
    last_frame_time: f64,
    shut_down: bool,
}

impl<D: GpuDevice> FrameDriver<D> {
    /// Build the surface, the frame slots and the descriptor pool
    pub fn new(device: Arc<D>, registry: Arc<ObjectRegistry>, config: &RendererConfig) -> RenderResult<Self> {
        let support = device.surface_support()?;
        let surface = PresentationSurface::create(&device, &support, device.window_extent())?;
        let slots = FrameSlots::new(&device, config.frames_in_flight, config.fence_timeout_ns)?;
        let pool = ResourcePool::new(
            &device,
            config.frames_in_flight,
            registry.len(),
            config.descriptor_slack,
        )?;

        log::info!(
            "Frame driver ready: {} frames in flight, {} swap chain images, descriptor capacity {}",
            slots.len(),
            surface.image_count(),
            pool.capacity()
        );
        Ok(Self {
            pool,
            slots,
            surface,
            objects: Vec::new(),
            registry,
            device,
            frame_counter: 0,
            surface_stale: false,
            clear_color: config.clear_color,
            frame_timer: Timer::new(),
            last_frame_time: 0.0,
            shut_down: false,
        })
    }

    /// Render and present one frame
    pub fn render_frame(&mut self) -> RenderResult<FrameOutcome> {
        if self.surface_stale && !self.recreate_surface()? {
            return Ok(FrameOutcome::Skipped);
        }

        let frame = self.slots.begin_slot(self.frame_counter)?;
        let objects = self.sync_scene()?;

        let slot = self.slots.slot(frame)?;
        let (image_available, render_finished, fence, command_buffer) = (
            slot.image_available(),
            slot.render_finished(),
            slot.in_flight(),
            slot.command_buffer(),
        );
        let swapchain = self.surface.swapchain()?;

        let (image_index, suboptimal) = match self.device.acquire_next_image(swapchain, image_available)? {
            AcquireOutcome::Acquired { image_index, suboptimal } => (image_index, suboptimal),
            AcquireOutcome::OutOfDate => {
                log::warn!("Swap chain out of date on acquire, frame {} abandoned", self.frame_counter);
                return Ok(if self.recreate_surface()? {
                    FrameOutcome::Recreated
                } else {
                    FrameOutcome::Skipped
                });
            }
        };

        self.slots.reset(frame)?;
        self.record(frame, image_index, command_buffer, &objects)?;
        self.device.submit(command_buffer, image_available, render_finished, fence)?;
        let presented = self.device.present(swapchain, image_index, render_finished)?;

        self.frame_counter += 1;
        self.last_frame_time = self.frame_timer.tick();

        if suboptimal || presented.needs_recreate() || self.surface_stale {
            log::warn!(
                "Swap chain stale after frame {} (acquire suboptimal: {suboptimal}, present: {presented:?})",
                self.frame_counter - 1
            );
            self.surface_stale = true;
            if self.recreate_surface()? {
                return Ok(FrameOutcome::Recreated);
            }
        }
        Ok(FrameOutcome::Presented)
    }

    /// Render until `stop` is requested or the window is closed, then wait
    /// for the frames still in flight
    pub fn run(&mut self, stop: &StopSignal, timing: &FrameTiming) -> RenderResult<()> {
        log::info!("Render loop started");
        while !stop.is_requested() {
            let events = self.device.poll_events();
            if !self.handle_events(events) {
                break;
            }

            let presented_before = self.frame_counter;
            let outcome = self.render_frame()?;
            if self.frame_counter > presented_before {
                timing.record_frame(self.last_frame_time);
            }
            if outcome == FrameOutcome::Skipped {
                thread::sleep(MINIMIZED_POLL_INTERVAL);
            }
        }
        log::info!("Render loop finished after {} frames", self.frame_counter);
        self.slots.wait_all()
    }

    /// Apply window events; returns `false` once the window wants to close
    pub fn handle_events(&mut self, events: SurfaceEvents) -> bool {
        if events.close_requested {
            log::info!("Window close requested");
            return false;
        }
        if events.resized {
            log::debug!("Window resized, swap chain marked stale");
            self.surface_stale = true;
        }
        true
    }

    /// Wait for the GPU, then destroy every resource in dependency order
    ///
    /// Descriptor pool and frame slots go first, then the swap chain with its
    /// framebuffers and views, then the per-object buffers.
    pub fn shutdown(&mut self) -> RenderResult<()> {
        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;

        let idle = self.device.wait_idle();
        if let Err(e) = &idle {
            log::error!("Device did not go idle before teardown: {e}");
        }
        self.pool.release();
        self.slots.release();
        self.surface.release();
        self.objects.clear();
        log::debug!("Frame driver resources released");
        idle
    }

    /// Rebuild the swap chain, or mark it stale while the window has no area
    fn recreate_surface(&mut self) -> RenderResult<bool> {
        let window_extent = self.device.window_extent();
        let support = self.device.surface_support()?;
        if window_extent.is_empty() || choose_extent(&support.capabilities, window_extent).is_empty() {
            self.surface_stale = true;
            return Ok(false);
        }

        self.device.wait_idle()?;
        self.surface.recreate(&support, window_extent)?;
        self.surface_stale = false;
        log::debug!(
            "Swap chain rebuilt at {}x{}",
            self.surface.extent().width,
            self.surface.extent().height
        );
        Ok(true)
    }

    /// Create, upload and lay out GPU resources for the registry's objects
    fn sync_scene(&mut self) -> RenderResult<Vec<Arc<RenderObject>>> {
        let objects = self.registry.snapshot();

        while self.objects.len() < objects.len() {
            self.objects.push(ObjectResources::new(&self.device, self.slots.len())?);
        }

        let stale: Vec<usize> = objects
            .iter()
            .zip(&self.objects)
            .enumerate()
            .filter(|(_, (object, resources))| resources.needs_upload(object))
            .map(|(index, _)| index)
            .collect();
        if !stale.is_empty() {
            // Buffers may be rewritten or replaced while earlier frames read them
            self.device.wait_idle()?;
            for index in stale {
                self.objects[index].upload(&objects[index])?;
            }
        }

        self.pool.ensure_capacity(objects.len())?;
        Ok(objects)
    }

    fn record(
        &self,
        frame: usize,
        image_index: u32,
        command_buffer: CommandBufferHandle,
        objects: &[Arc<RenderObject>],
    ) -> RenderResult<()> {
        let extent = self.surface.extent();
        let view = Mat4::look_at(Vec3::from(CAMERA_EYE), Vec3::zeros(), Vec3::y());
        let proj = Mat4::perspective(
            utils::deg_to_rad(FIELD_OF_VIEW_DEGREES),
            extent.aspect_ratio(),
            NEAR_PLANE,
            FAR_PLANE,
        );

        let framebuffer = self.surface.framebuffer(image_index)?;
        self.device
            .begin_frame_commands(command_buffer, framebuffer, extent, self.clear_color)?;
        for (index, (object, resources)) in objects.iter().zip(&self.objects).enumerate() {
            let ubo = UniformBufferObject::new(object.transform().to_matrix(), view, proj);
            resources.uniform.write(frame, &ubo)?;
            self.pool.update(index, frame, resources.uniform.region(frame)?)?;

            if let Some(draw) = resources.mesh.draw(self.pool.bind(index, frame)?) {
                self.device.cmd_draw_mesh(command_buffer, &draw)?;
            }
        }
        self.device.end_frame_commands(command_buffer)
    }

    /// Frames presented so far
    pub fn frame_counter(&self) -> u64 {
        self.frame_counter
    }

    /// Interval between the last two presented frames in seconds
    pub fn last_frame_time(&self) -> f64 {
        self.last_frame_time
    }

    /// Presentation surface
    pub fn surface(&self) -> &PresentationSurface<D> {
        &self.surface
    }

    /// Descriptor pool manager
    pub fn pool(&self) -> &ResourcePool<D> {
        &self.pool
    }

    /// Frame slots
    pub fn slots(&self) -> &FrameSlots<D> {
        &self.slots
    }

    /// Whether the swap chain will be rebuilt before the next frame
    pub fn is_surface_stale(&self) -> bool {
        self.surface_stale
    }

    /// Number of objects with GPU resources
    pub fn resident_objects(&self) -> usize {
        self.objects.len()
    }

    /// Vertex and index buffers of a resident object
    pub fn mesh_buffers(&self, index: usize) -> Option<&MeshBuffers<D>> {
        self.objects.get(index).map(|resources| &resources.mesh)
    }
}

impl<D: GpuDevice> Drop for FrameDriver<D> {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            log::error!("Frame driver teardown failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::api::Extent2D;
    use crate::render::backends::headless::{DeviceEvent, HeadlessDevice};

    fn driver(device: &Arc<HeadlessDevice>) -> FrameDriver<HeadlessDevice> {
        FrameDriver::new(
            Arc::clone(device),
            Arc::new(ObjectRegistry::new()),
            &RendererConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn empty_scene_presents_clear_frames() {
        let device = Arc::new(HeadlessDevice::new());
        let mut driver = driver(&device);

        for _ in 0..3 {
            assert_eq!(driver.render_frame().unwrap(), FrameOutcome::Presented);
        }
        assert_eq!(driver.frame_counter(), 3);
        assert_eq!(device.count_events(|e| matches!(e, DeviceEvent::Presented { .. })), 3);
        assert!(device.validation_errors().is_empty());
    }

    #[test]
    fn resize_event_rebuilds_before_next_frame() {
        let device = Arc::new(HeadlessDevice::new());
        let mut driver = driver(&device);
        driver.render_frame().unwrap();

        device.resize_window(Extent2D::new(300, 200));
        assert!(driver.handle_events(device.poll_events()));
        assert!(driver.is_surface_stale());

        assert_eq!(driver.render_frame().unwrap(), FrameOutcome::Presented);
        assert!(!driver.is_surface_stale());
        assert_eq!(driver.surface().generation(), 2);
        assert_eq!(driver.surface().extent(), Extent2D::new(300, 200));
        assert!(device.validation_errors().is_empty());
    }

    #[test]
    fn run_stops_on_window_close() {
        let device = Arc::new(HeadlessDevice::new());
        let mut driver = driver(&device);
        let timing = FrameTiming::new();

        device.request_close();
        driver.run(&StopSignal::new(), &timing).unwrap();
        assert_eq!(driver.frame_counter(), 0);
        assert_eq!(timing.frames_rendered(), 0);
        let waits = device.count_events(|e| matches!(e, DeviceEvent::FenceWaited(_)));
        assert_eq!(waits, driver.slots().len());
        assert!(device.validation_errors().is_empty());
    }

    #[test]
    fn minimized_window_skips_frames_until_restored() {
        let device = Arc::new(HeadlessDevice::new());
        let mut driver = driver(&device);

        device.resize_window(Extent2D::new(0, 0));
        assert!(driver.handle_events(device.poll_events()));
        assert_eq!(driver.render_frame().unwrap(), FrameOutcome::Skipped);
        assert_eq!(driver.render_frame().unwrap(), FrameOutcome::Skipped);
        assert_eq!(driver.surface().generation(), 1);

        device.resize_window(Extent2D::new(640, 480));
        assert_eq!(driver.render_frame().unwrap(), FrameOutcome::Presented);
        assert_eq!(driver.surface().generation(), 2);
        assert_eq!(driver.surface().extent(), Extent2D::new(640, 480));
        assert!(device.validation_errors().is_empty());
    }

    #[test]
    fn shutdown_releases_everything_once() {
        let device = Arc::new(HeadlessDevice::new());
        let mut driver = driver(&device);
        driver.render_frame().unwrap();
        driver.render_frame().unwrap();

        driver.shutdown().unwrap();
        assert_eq!(device.live_object_count(), 0);
        assert!(device.validation_errors().is_empty());

        driver.shutdown().unwrap();
        drop(driver);
        assert_eq!(device.count_events(|e| *e == DeviceEvent::WaitIdle), 1);
    }
}
