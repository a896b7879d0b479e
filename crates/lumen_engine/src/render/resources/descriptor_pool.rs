//! Descriptor resource pool
//!
//! Each object gets one uniform-buffer descriptor set per frame slot. Sets
//! are laid out frame-major: all objects for frame 0, then all objects for
//! frame 1, and so on. The pool is sized for `capacity` objects and is torn
//! down and rebuilt, larger, when the object count outgrows it.

use std::sync::Arc;

use crate::render::api::{BufferRegion, DescriptorPoolHandle, DescriptorSetHandle, GpuDevice};
use crate::render::resources::handle::DescriptorPool;
use crate::render::{RenderError, RenderResult};

/// Index of an object's set for a frame slot in the frame-major layout
pub const fn set_index(object_index: usize, frame_index: usize, object_count: usize) -> usize {
    object_index + frame_index * object_count
}

/// Object capacity after outgrowing `capacity` with `required` objects
pub fn grown_capacity(capacity: usize, required: usize) -> usize {
    (capacity * 2).max(required) + 1
}

/// What [`ResourcePool::ensure_capacity`] had to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolChange {
    /// Capacity and layout already matched
    Unchanged,
    /// Capacity sufficed; sets were re-laid out in the existing pool
    Reallocated,
    /// The pool was destroyed and rebuilt with more capacity
    Grown {
        /// Previous object capacity
        from: usize,
        /// New object capacity
        to: usize,
    },
}

/// Owner of the descriptor pool and every set allocated from it
pub struct ResourcePool<D: GpuDevice> {
    device: Arc<D>,
    frames: usize,
    capacity: usize,
    object_count: usize,
    pool: Option<DescriptorPool<D>>,
    sets: Vec<DescriptorSetHandle>,
}

impl<D: GpuDevice> ResourcePool<D> {
    /// Create a pool for `object_count` objects plus `slack` spare capacity
    pub fn new(device: &Arc<D>, frames: usize, object_count: usize, slack: usize) -> RenderResult<Self> {
        if frames == 0 {
            return Err(RenderError::InvalidOperation("Resource pool needs at least one frame".to_string()));
        }
        let mut pool = Self {
            device: Arc::clone(device),
            frames,
            capacity: 0,
            object_count: 0,
            pool: None,
            sets: Vec::new(),
        };
        pool.rebuild(object_count + slack)?;
        pool.allocate(object_count)?;
        Ok(pool)
    }

    /// Make room for `object_count` objects and lay out their sets
    ///
    /// May wait for the device to go idle. Sets handed out earlier are
    /// invalid after anything but [`PoolChange::Unchanged`].
    pub fn ensure_capacity(&mut self, object_count: usize) -> RenderResult<PoolChange> {
        if object_count > self.capacity {
            let from = self.capacity;
            let to = grown_capacity(self.capacity, object_count);
            log::debug!("Growing descriptor pool from {from} to {to} objects");

            self.device.wait_idle()?;
            self.rebuild(to)?;
            self.allocate(object_count)?;
            return Ok(PoolChange::Grown { from, to });
        }

        if object_count == self.object_count && self.sets.len() == object_count * self.frames {
            return Ok(PoolChange::Unchanged);
        }

        log::debug!(
            "Re-laying out descriptor sets for {object_count} objects (was {})",
            self.object_count
        );
        self.device.wait_idle()?;
        self.sets.clear();
        self.object_count = 0;
        if let Some(pool) = &self.pool {
            self.device.reset_descriptor_pool(pool.handle())?;
        }
        self.allocate(object_count)?;
        Ok(PoolChange::Reallocated)
    }

    /// Set of an object for a frame slot
    pub fn bind(&self, object_index: usize, frame_index: usize) -> RenderResult<DescriptorSetHandle> {
        let index = set_index(object_index, frame_index, self.object_count);
        if object_index >= self.object_count || frame_index >= self.frames {
            return Err(RenderError::DescriptorIndexOutOfRange {
                index,
                allocated: self.sets.len(),
            });
        }
        self.sets.get(index).copied().ok_or(RenderError::DescriptorIndexOutOfRange {
            index,
            allocated: self.sets.len(),
        })
    }

    /// Point an object's set for a frame slot at its uniform region
    pub fn update(&self, object_index: usize, frame_index: usize, region: BufferRegion) -> RenderResult<()> {
        let set = self.bind(object_index, frame_index)?;
        self.device.write_uniform_descriptor(set, region)
    }

    /// Objects the pool can hold without growing
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Objects with allocated sets
    pub fn object_count(&self) -> usize {
        self.object_count
    }

    /// Live descriptor sets
    pub fn set_count(&self) -> usize {
        self.sets.len()
    }

    /// Frame slots per object
    pub fn frames(&self) -> usize {
        self.frames
    }

    /// Current pool handle
    pub fn pool_handle(&self) -> Option<DescriptorPoolHandle> {
        self.pool.as_ref().map(DescriptorPool::handle)
    }

    /// Destroy the pool and its sets now; the device must be idle
    pub fn release(&mut self) {
        self.sets.clear();
        self.object_count = 0;
        if self.pool.take().is_some() {
            log::debug!("Released descriptor pool");
        }
    }

    fn rebuild(&mut self, capacity: usize) -> RenderResult<()> {
        self.release();
        self.capacity = 0;
        if capacity == 0 {
            return Ok(());
        }
        let max_sets = u32::try_from(capacity * self.frames)
            .map_err(|_| RenderError::OutOfMemory { operation: "create_descriptor_pool" })?;
        let handle = self.device.create_descriptor_pool(max_sets)?;
        self.pool = Some(DescriptorPool::new(Arc::clone(&self.device), handle));
        self.capacity = capacity;
        Ok(())
    }

    fn allocate(&mut self, object_count: usize) -> RenderResult<()> {
        let total = object_count * self.frames;
        if total > 0 {
            let pool = self.pool.as_ref().ok_or_else(|| {
                RenderError::InvalidOperation(format!("No descriptor pool for {object_count} objects"))
            })?;
            let count = u32::try_from(total)
                .map_err(|_| RenderError::OutOfMemory { operation: "allocate_descriptor_sets" })?;
            self.sets = self.device.allocate_descriptor_sets(pool.handle(), count)?;
        }
        self.object_count = object_count;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::backends::headless::{DeviceEvent, HeadlessDevice};

    fn pool_events(device: &HeadlessDevice) -> (usize, usize, usize) {
        (
            device.count_events(|e| matches!(e, DeviceEvent::DescriptorPoolCreated { .. })),
            device.count_events(|e| matches!(e, DeviceEvent::DescriptorPoolDestroyed(_))),
            device.count_events(|e| matches!(e, DeviceEvent::DescriptorSetsAllocated { .. })),
        )
    }

    #[test]
    fn frame_major_layout() {
        assert_eq!(set_index(0, 0, 4), 0);
        assert_eq!(set_index(3, 0, 4), 3);
        assert_eq!(set_index(0, 1, 4), 4);
        assert_eq!(set_index(2, 1, 4), 6);
    }

    #[test]
    fn growth_formula() {
        assert_eq!(grown_capacity(5, 6), 11);
        assert_eq!(grown_capacity(0, 1), 2);
        assert_eq!(grown_capacity(2, 10), 11);
    }

    #[test]
    fn initial_pool_includes_slack() {
        let device = Arc::new(HeadlessDevice::new());
        let pool = ResourcePool::new(&device, 2, 3, 10).unwrap();
        assert_eq!(pool.capacity(), 13);
        assert_eq!(pool.set_count(), 6);
        assert!(device.events().contains(&DeviceEvent::DescriptorPoolCreated {
            handle: pool.pool_handle().unwrap(),
            max_sets: 26,
        }));
    }

    #[test]
    fn every_binding_is_in_range_and_distinct() {
        let device = Arc::new(HeadlessDevice::new());
        let frames = 3;
        let objects = 5;
        let pool = ResourcePool::new(&device, frames, objects, 0).unwrap();

        let mut seen = std::collections::HashSet::new();
        for frame in 0..frames {
            for object in 0..objects {
                let index = set_index(object, frame, objects);
                assert!(index < pool.capacity() * frames);
                assert!(seen.insert(pool.bind(object, frame).unwrap()));
            }
        }
        assert!(matches!(
            pool.bind(objects, 0),
            Err(RenderError::DescriptorIndexOutOfRange { .. })
        ));
        assert!(pool.bind(0, frames).is_err());
    }

    #[test]
    fn sufficient_capacity_is_a_no_op() {
        let device = Arc::new(HeadlessDevice::new());
        let mut pool = ResourcePool::new(&device, 2, 4, 10).unwrap();
        device.clear_events();

        for _ in 0..3 {
            assert_eq!(pool.ensure_capacity(4).unwrap(), PoolChange::Unchanged);
        }
        assert_eq!(pool_events(&device), (0, 0, 0));
        assert_eq!(device.count_events(|e| *e == DeviceEvent::WaitIdle), 0);
    }

    #[test]
    fn added_object_within_capacity_relays_out_sets() {
        let device = Arc::new(HeadlessDevice::new());
        let mut pool = ResourcePool::new(&device, 2, 2, 10).unwrap();
        let handle = pool.pool_handle();
        device.clear_events();

        assert_eq!(pool.ensure_capacity(3).unwrap(), PoolChange::Reallocated);
        assert_eq!(pool.pool_handle(), handle);
        assert_eq!(pool.set_count(), 6);
        assert_eq!(pool_events(&device), (0, 0, 1));
        assert!(device.events().contains(&DeviceEvent::WaitIdle));
        assert!(pool.bind(2, 1).is_ok());
    }

    #[test]
    fn growth_rebuilds_pool_after_idle() {
        let device = Arc::new(HeadlessDevice::new());
        let mut pool = ResourcePool::new(&device, 2, 5, 0).unwrap();
        let old = pool.pool_handle().unwrap();
        device.clear_events();

        assert_eq!(pool.ensure_capacity(6).unwrap(), PoolChange::Grown { from: 5, to: 11 });
        let events = device.events();
        assert_eq!(events[0], DeviceEvent::WaitIdle);
        assert_eq!(events[1], DeviceEvent::DescriptorPoolDestroyed(old));
        assert!(matches!(events[2], DeviceEvent::DescriptorPoolCreated { max_sets: 22, .. }));
        assert_eq!(pool.set_count(), 12);
        assert!(!device.is_live(old.raw()));
    }

    #[test]
    fn update_writes_the_frame_set() {
        let device = Arc::new(HeadlessDevice::new());
        let pool = ResourcePool::new(&device, 2, 2, 0).unwrap();
        let buffer = device
            .create_buffer(512, crate::render::api::BufferUsage::UNIFORM)
            .unwrap();
        let region = BufferRegion { buffer, offset: 256, range: 192 };

        pool.update(1, 1, region).unwrap();
        assert_eq!(device.descriptor_binding(pool.bind(1, 1).unwrap()), Some(region));
        assert_eq!(device.descriptor_binding(pool.bind(1, 0).unwrap()), None);
    }

    #[test]
    fn empty_pool_starts_without_device_pool() {
        let device = Arc::new(HeadlessDevice::new());
        let mut pool = ResourcePool::new(&device, 2, 0, 0).unwrap();
        assert!(pool.pool_handle().is_none());
        assert_eq!(pool.ensure_capacity(0).unwrap(), PoolChange::Unchanged);
        assert_eq!(pool.ensure_capacity(1).unwrap(), PoolChange::Grown { from: 0, to: 2 });
    }

    #[test]
    fn empty_scene_with_slack_gets_a_pool_but_no_sets() {
        let device = Arc::new(HeadlessDevice::new());
        let pool = ResourcePool::new(&device, 2, 0, 10).unwrap();
        assert_eq!(pool.capacity(), 10);
        assert_eq!(pool.set_count(), 0);
        assert!(device.events().contains(&DeviceEvent::DescriptorPoolCreated {
            handle: pool.pool_handle().unwrap(),
            max_sets: 20,
        }));
        assert_eq!(
            device.count_events(|e| matches!(e, DeviceEvent::DescriptorSetsAllocated { .. })),
            0
        );
    }
}
