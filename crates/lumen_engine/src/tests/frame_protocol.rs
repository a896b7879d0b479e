use std::collections::HashSet;
use std::sync::Arc;

use super::{cube, driver};
use crate::core::RendererConfig;
use crate::render::api::Extent2D;
use crate::render::backends::headless::{DeviceEvent, HeadlessDevice, Scripted};
use crate::render::{FrameOutcome, RenderError};
use crate::scene::ObjectRegistry;

#[test]
fn frames_in_flight_never_exceed_slot_count() {
    for frames in 1..=3 {
        let device = Arc::new(HeadlessDevice::new());
        let registry = Arc::new(ObjectRegistry::new());
        registry.add(cube());
        let config = RendererConfig::default().with_frames_in_flight(frames);
        let mut driver = driver(&device, &registry, &config);

        for frame in 0..24 {
            match frame % 7 {
                3 => device.script_acquire(Scripted::OutOfDate),
                5 => device.script_present(Scripted::Suboptimal),
                _ => {}
            }
            if frame == 11 {
                registry.add(cube());
            }
            driver.render_frame().unwrap();
            assert!(device.in_flight().len() <= frames);
        }
        assert!(device.max_in_flight() <= frames);
        assert!(device.validation_errors().is_empty(), "{:?}", device.validation_errors());
    }
}

#[test]
fn slots_are_reused_round_robin() {
    let device = Arc::new(HeadlessDevice::new());
    let registry = Arc::new(ObjectRegistry::new());
    let mut driver = driver(&device, &registry, &RendererConfig::default().with_frames_in_flight(3));

    for _ in 0..6 {
        driver.render_frame().unwrap();
    }
    let fences: Vec<_> = device
        .events()
        .into_iter()
        .filter_map(|e| match e {
            DeviceEvent::Submitted { fence, .. } => Some(fence),
            _ => None,
        })
        .collect();
    assert_eq!(fences.len(), 6);
    assert_eq!(fences[..3], fences[3..]);
    assert_eq!(fences[..3].iter().collect::<HashSet<_>>().len(), 3);
}

#[test]
fn every_drawn_set_is_bound_within_capacity() {
    let device = Arc::new(HeadlessDevice::new());
    let registry = Arc::new(ObjectRegistry::new());
    for _ in 0..4 {
        registry.add(cube());
    }
    let config = RendererConfig::default().with_descriptor_slack(0);
    let mut driver = driver(&device, &registry, &config);

    for frame in 0..6 {
        if frame == 3 {
            registry.add(cube());
        }
        driver.render_frame().unwrap();
        let pool = driver.pool();
        assert!(pool.object_count() <= pool.capacity());
        for object in 0..pool.object_count() {
            for slot in 0..pool.frames() {
                assert!(pool.bind(object, slot).is_ok());
            }
        }
        assert!(pool.bind(pool.object_count(), 0).is_err());
        assert!(pool.bind(0, pool.frames()).is_err());
    }

    // Each (object, slot) pair owns a distinct set
    let sets: HashSet<_> = (0..5)
        .flat_map(|o| (0..2).map(move |f| (o, f)))
        .map(|(o, f)| driver.pool().bind(o, f).unwrap())
        .collect();
    assert_eq!(sets.len(), 10);
    assert!(device.validation_errors().is_empty());
}

#[test]
fn framebuffers_track_images_after_every_rebuild() {
    let device = Arc::new(HeadlessDevice::new());
    let registry = Arc::new(ObjectRegistry::new());
    let mut driver = driver(&device, &registry, &RendererConfig::default());
    assert_eq!(driver.surface().framebuffer_count(), driver.surface().image_count());

    for (count, outcome) in [(4, Scripted::Suboptimal), (2, Scripted::OutOfDate), (5, Scripted::Suboptimal)] {
        device.set_image_count_override(Some(count));
        device.script_present(outcome);
        assert_eq!(driver.render_frame().unwrap(), FrameOutcome::Recreated);
        assert_eq!(driver.surface().image_count(), count as usize);
        assert_eq!(driver.surface().framebuffer_count(), count as usize);
    }
    assert_eq!(driver.surface().generation(), 4);
    assert!(device.validation_errors().is_empty());
}

#[test]
fn sufficient_capacity_never_rebuilds_the_pool() {
    let device = Arc::new(HeadlessDevice::new());
    let registry = Arc::new(ObjectRegistry::new());
    registry.add(cube());
    let mut driver = driver(&device, &registry, &RendererConfig::default());

    for _ in 0..10 {
        driver.render_frame().unwrap();
    }
    assert_eq!(device.count_events(|e| matches!(e, DeviceEvent::DescriptorPoolCreated { .. })), 1);
    assert_eq!(device.count_events(|e| matches!(e, DeviceEvent::DescriptorPoolDestroyed(_))), 0);
    assert_eq!(device.count_events(|e| matches!(e, DeviceEvent::DescriptorPoolReset(_))), 0);
}

#[test]
fn out_of_date_acquire_abandons_the_frame() {
    let device = Arc::new(HeadlessDevice::new());
    let registry = Arc::new(ObjectRegistry::new());
    registry.add(cube());
    let mut driver = driver(&device, &registry, &RendererConfig::default());
    driver.render_frame().unwrap();
    device.clear_events();

    device.resize_window(Extent2D::new(1024, 768));
    device.script_acquire(Scripted::OutOfDate);
    assert_eq!(driver.render_frame().unwrap(), FrameOutcome::Recreated);
    assert_eq!(driver.frame_counter(), 1);
    assert_eq!(device.count_events(|e| matches!(e, DeviceEvent::Submitted { .. })), 0);
    assert_eq!(device.count_events(|e| matches!(e, DeviceEvent::FenceReset(_))), 0);
    assert_eq!(driver.surface().extent(), Extent2D::new(1024, 768));

    // The abandoned slot's fence is still signaled, so the retry cannot block
    assert_eq!(driver.render_frame().unwrap(), FrameOutcome::Presented);
    assert_eq!(driver.frame_counter(), 2);
    assert!(device.validation_errors().is_empty());
}

#[test]
fn lost_device_on_present_is_fatal() {
    let device = Arc::new(HeadlessDevice::new());
    let registry = Arc::new(ObjectRegistry::new());
    let mut driver = driver(&device, &registry, &RendererConfig::default());

    device.script_present(Scripted::DeviceLost);
    assert!(matches!(driver.render_frame(), Err(RenderError::DeviceLost)));
}

#[test]
fn lost_device_on_submit_is_fatal() {
    let device = Arc::new(HeadlessDevice::new());
    let registry = Arc::new(ObjectRegistry::new());
    registry.add(cube());
    let mut driver = driver(&device, &registry, &RendererConfig::default());
    driver.render_frame().unwrap();

    device.script_submit(Scripted::DeviceLost);
    assert!(matches!(driver.render_frame(), Err(RenderError::DeviceLost)));
    assert_eq!(driver.frame_counter(), 1);
    assert_eq!(device.count_events(|e| matches!(e, DeviceEvent::Submitted { .. })), 1);
    assert_eq!(device.count_events(|e| matches!(e, DeviceEvent::Presented { .. })), 1);

    driver.shutdown().unwrap();
    assert_eq!(device.live_object_count(), 0);
    assert!(device.validation_errors().is_empty(), "{:?}", device.validation_errors());
}

#[test]
fn suboptimal_acquire_presents_then_rebuilds() {
    let device = Arc::new(HeadlessDevice::new());
    let registry = Arc::new(ObjectRegistry::new());
    registry.add(cube());
    let mut driver = driver(&device, &registry, &RendererConfig::default());
    driver.render_frame().unwrap();

    device.script_acquire(Scripted::Suboptimal);
    assert_eq!(driver.render_frame().unwrap(), FrameOutcome::Recreated);
    assert_eq!(driver.frame_counter(), 2);
    assert_eq!(driver.surface().generation(), 2);
    assert!(!driver.is_surface_stale());

    let events = device.events();
    let presented = events
        .iter()
        .rposition(|e| matches!(e, DeviceEvent::Presented { .. }))
        .unwrap();
    let rebuilt = events
        .iter()
        .rposition(|e| matches!(e, DeviceEvent::SwapchainCreated { .. }))
        .unwrap();
    assert!(presented < rebuilt);
    assert_eq!(device.count_events(|e| matches!(e, DeviceEvent::Presented { .. })), 2);

    assert_eq!(driver.render_frame().unwrap(), FrameOutcome::Presented);
    assert!(device.validation_errors().is_empty(), "{:?}", device.validation_errors());
}
