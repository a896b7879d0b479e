//! Frame slot synchronization
//!
//! The CPU records frame `n + 1` while the GPU still executes frame `n`.
//! Each of the N slots owns the objects one in-flight frame needs:
//!
//! ```text
//! acquire ──signal──▶ image_available ──wait──▶ submit ──signal──▶ render_finished ──wait──▶ present
//!                                                  │
//!                                                  └──signal──▶ in_flight (fence, CPU waits here)
//! ```
//!
//! Slot `f = frame_counter mod N` is reused only after its fence signals,
//! so at most N frames are ever queued. Fences start signaled so the first
//! N frames do not block.

use std::sync::Arc;

use crate::render::api::{CommandBufferHandle, FenceHandle, GpuDevice, SemaphoreHandle};
use crate::render::resources::handle::{CommandBuffer, Fence, Semaphore};
use crate::render::{RenderError, RenderResult};

/// Synchronization objects and command buffer of one in-flight frame
pub struct FrameSlot<D: GpuDevice> {
    image_available: Semaphore<D>,
    render_finished: Semaphore<D>,
    in_flight: Fence<D>,
    command_buffer: CommandBuffer<D>,
}

impl<D: GpuDevice> FrameSlot<D> {
    fn new(device: &Arc<D>, command_buffer: CommandBuffer<D>) -> RenderResult<Self> {
        Ok(Self {
            image_available: Semaphore::create(device)?,
            render_finished: Semaphore::create(device)?,
            in_flight: Fence::create(device, true)?,
            command_buffer,
        })
    }

    /// Signaled by acquire, waited on by submit
    pub fn image_available(&self) -> SemaphoreHandle {
        self.image_available.handle()
    }

    /// Signaled by submit, waited on by present
    pub fn render_finished(&self) -> SemaphoreHandle {
        self.render_finished.handle()
    }

    /// Signaled when the slot's submission completes
    pub fn in_flight(&self) -> FenceHandle {
        self.in_flight.handle()
    }

    /// Primary command buffer re-recorded every time the slot is used
    pub fn command_buffer(&self) -> CommandBufferHandle {
        self.command_buffer.handle()
    }
}

/// The ring of N frame slots
pub struct FrameSlots<D: GpuDevice> {
    device: Arc<D>,
    slots: Vec<FrameSlot<D>>,
    fence_timeout_ns: u64,
}

impl<D: GpuDevice> FrameSlots<D> {
    /// Create `frames_in_flight` slots with signaled fences
    pub fn new(device: &Arc<D>, frames_in_flight: usize, fence_timeout_ns: u64) -> RenderResult<Self> {
        if frames_in_flight == 0 {
            return Err(RenderError::InvalidOperation("At least one frame slot is required".to_string()));
        }
        let count = u32::try_from(frames_in_flight)
            .map_err(|_| RenderError::InvalidOperation(format!("{frames_in_flight} frame slots")))?;
        let slots = CommandBuffer::allocate(device, count)?
            .into_iter()
            .map(|command_buffer| FrameSlot::new(device, command_buffer))
            .collect::<RenderResult<Vec<_>>>()?;

        log::debug!("Created {frames_in_flight} frame slots");
        Ok(Self {
            device: Arc::clone(device),
            slots,
            fence_timeout_ns,
        })
    }

    /// Number of slots (N)
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the slots were released
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Slot used by a frame number
    pub fn slot_index(&self, frame_counter: u64) -> usize {
        (frame_counter % self.slots.len().max(1) as u64) as usize
    }

    /// Block until the slot for `frame_counter` is free and return its index
    ///
    /// The fence is left signaled; [`Self::reset`] unsignals it right before
    /// submission so an abandoned frame never strands an unsignaled fence.
    pub fn begin_slot(&self, frame_counter: u64) -> RenderResult<usize> {
        let index = self.slot_index(frame_counter);
        let slot = self.slot(index)?;
        self.device.wait_for_fence(slot.in_flight(), self.fence_timeout_ns)?;
        Ok(index)
    }

    /// Unsignal a slot's fence ahead of its submission
    pub fn reset(&self, index: usize) -> RenderResult<()> {
        let slot = self.slot(index)?;
        self.device.reset_fence(slot.in_flight())
    }

    /// Slot by index
    pub fn slot(&self, index: usize) -> RenderResult<&FrameSlot<D>> {
        self.slots.get(index).ok_or_else(|| {
            RenderError::InvalidOperation(format!("Frame slot {index} out of range ({} slots)", self.slots.len()))
        })
    }

    /// Wait for every slot's last submission
    pub fn wait_all(&self) -> RenderResult<()> {
        for slot in &self.slots {
            self.device.wait_for_fence(slot.in_flight(), self.fence_timeout_ns)?;
        }
        Ok(())
    }

    /// Destroy all slots now; the device must be idle
    pub fn release(&mut self) {
        if !self.slots.is_empty() {
            log::debug!("Releasing {} frame slots", self.slots.len());
            self.slots.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::backends::headless::{DeviceEvent, HeadlessDevice};

    #[test]
    fn slots_are_used_round_robin() {
        let device = Arc::new(HeadlessDevice::new());
        let slots = FrameSlots::new(&device, 3, u64::MAX).unwrap();
        let indices: Vec<usize> = (0..7).map(|frame| slots.slot_index(frame)).collect();
        assert_eq!(indices, vec![0, 1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn each_slot_owns_distinct_objects() {
        let device = Arc::new(HeadlessDevice::new());
        let slots = FrameSlots::new(&device, 2, u64::MAX).unwrap();
        let a = slots.slot(0).unwrap();
        let b = slots.slot(1).unwrap();
        assert_ne!(a.in_flight(), b.in_flight());
        assert_ne!(a.image_available(), b.image_available());
        assert_ne!(a.render_finished(), a.image_available());
        assert_ne!(a.command_buffer(), b.command_buffer());
        // 2 semaphores, 1 fence and 1 command buffer per slot
        assert_eq!(device.live_object_count(), 8);
    }

    #[test]
    fn first_frames_do_not_block() {
        let device = Arc::new(HeadlessDevice::new());
        let slots = FrameSlots::new(&device, 2, u64::MAX).unwrap();
        assert_eq!(slots.begin_slot(0).unwrap(), 0);
        assert_eq!(slots.begin_slot(1).unwrap(), 1);
        assert!(device.validation_errors().is_empty());
        assert_eq!(
            device.count_events(|e| matches!(e, DeviceEvent::FenceWaited(_))),
            2
        );
    }

    #[test]
    fn waiting_after_reset_without_submit_is_detected() {
        let device = Arc::new(HeadlessDevice::new());
        let slots = FrameSlots::new(&device, 1, u64::MAX).unwrap();
        slots.reset(0).unwrap();
        assert!(slots.begin_slot(1).is_err());
    }

    #[test]
    fn release_destroys_everything() {
        let device = Arc::new(HeadlessDevice::new());
        let mut slots = FrameSlots::new(&device, 2, u64::MAX).unwrap();
        slots.wait_all().unwrap();
        slots.release();
        assert!(slots.is_empty());
        assert_eq!(device.live_object_count(), 0);
        assert!(FrameSlots::new(&device, 0, u64::MAX).is_err());
    }
}
