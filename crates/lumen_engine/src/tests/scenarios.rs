use std::sync::Arc;

use approx::assert_relative_eq;

use super::{cube, cube_indices, cube_vertices, driver, submitted_uniforms};
use crate::core::RendererConfig;
use crate::foundation::math::{Mat4, Transform, Vec3};
use crate::render::api::Vertex;
use crate::render::backends::headless::{DeviceEvent, HeadlessDevice, Scripted};
use crate::render::FrameOutcome;
use crate::scene::{Behavior, ObjectRegistry, RenderObject};

struct Spin;

impl Behavior for Spin {
    fn update(&mut self, object: &RenderObject, delta_time: f32) {
        object.update_transform(|t| t.rotation += Vec3::repeat(delta_time));
    }
}

fn position(events: &[DeviceEvent], predicate: impl Fn(&DeviceEvent) -> bool) -> usize {
    events.iter().position(predicate).expect("event recorded")
}

#[test]
fn empty_scene_renders_without_descriptor_sets() {
    let device = Arc::new(HeadlessDevice::new());
    let registry = Arc::new(ObjectRegistry::new());
    let mut driver = driver(&device, &registry, &RendererConfig::default());

    for _ in 0..10 {
        assert_eq!(driver.render_frame().unwrap(), FrameOutcome::Presented);
    }
    driver.shutdown().unwrap();

    assert_eq!(driver.frame_counter(), 10);
    assert_eq!(device.count_events(|e| matches!(e, DeviceEvent::DescriptorSetsAllocated { .. })), 0);
    assert_eq!(device.count_events(|e| matches!(e, DeviceEvent::Submitted { draw_count: 0, .. })), 10);
    assert_eq!(device.live_object_count(), 0);
    assert!(device.validation_errors().is_empty());
}

#[test]
fn spinning_cube_uniforms_follow_update_ticks() {
    let device = Arc::new(HeadlessDevice::new());
    let registry = Arc::new(ObjectRegistry::new());
    let initial = Vec3::new(0.1, 0.2, 0.3);
    let object = registry.add(cube_with_behavior(Spin));
    object.update_transform(|t| t.rotation = initial);
    let mut driver = driver(&device, &registry, &RendererConfig::default());

    let dt = 1.0 / 60.0;
    for _ in 0..5 {
        registry.update_all(dt);
        assert_eq!(driver.render_frame().unwrap(), FrameOutcome::Presented);
    }

    let expected = Transform {
        position: Vec3::zeros(),
        rotation: initial + Vec3::repeat(5.0 * dt),
    };
    assert_relative_eq!(object.transform().rotation, expected.rotation, epsilon = 1e-6);

    let uniforms = submitted_uniforms(&device);
    assert_eq!(uniforms.len(), 1);
    assert_relative_eq!(Mat4::from(uniforms[0].model), expected.to_matrix(), epsilon = 1e-5);

    let submission = device.in_flight().pop().unwrap();
    assert_eq!(submission.draws.len(), 1);
    assert_eq!(submission.draws[0].index_count, 36);
}

fn cube_with_behavior(behavior: impl Behavior + 'static) -> RenderObject {
    let object = RenderObject::with_behavior(behavior);
    object.set_vertices(cube_vertices());
    object.set_indices(cube_indices());
    object
}

#[test]
fn sixth_object_grows_the_pool_before_it_is_drawn() {
    let device = Arc::new(HeadlessDevice::new());
    let registry = Arc::new(ObjectRegistry::new());
    for _ in 0..5 {
        registry.add(cube());
    }
    let config = RendererConfig::default()
        .with_frames_in_flight(2)
        .with_descriptor_slack(0);
    let mut driver = driver(&device, &registry, &config);
    assert_eq!(driver.pool().capacity(), 5);
    assert!(device
        .events()
        .contains(&DeviceEvent::DescriptorPoolCreated {
            handle: driver.pool().pool_handle().unwrap(),
            max_sets: 10,
        }));

    driver.render_frame().unwrap();
    device.clear_events();

    registry.add(cube());
    driver.render_frame().unwrap();

    let events = device.events();
    let idle = position(&events, |e| *e == DeviceEvent::WaitIdle);
    let grown = position(&events, |e| {
        matches!(e, DeviceEvent::DescriptorPoolCreated { max_sets, .. } if *max_sets >= 12)
    });
    let drawn = position(&events, |e| matches!(e, DeviceEvent::Submitted { draw_count: 6, .. }));
    assert!(idle < grown && grown < drawn);
    assert_eq!(driver.pool().capacity(), 11);
    assert_eq!(driver.pool().set_count(), 12);
    assert!(device.validation_errors().is_empty());
}

#[test]
fn suboptimal_present_rebuilds_the_whole_surface() {
    let device = Arc::new(HeadlessDevice::new());
    let registry = Arc::new(ObjectRegistry::new());
    registry.add(cube());
    let mut driver = driver(&device, &registry, &RendererConfig::default());
    driver.render_frame().unwrap();
    let old_images = driver.surface().image_count();
    let old_views = driver.surface().image_views();
    device.clear_events();

    device.set_image_count_override(Some(4));
    device.script_present(Scripted::Suboptimal);
    assert_eq!(driver.render_frame().unwrap(), FrameOutcome::Recreated);

    let events = device.events();
    let presented = position(&events, |e| matches!(e, DeviceEvent::Presented { .. }));
    let idle = position(&events, |e| *e == DeviceEvent::WaitIdle);
    let destroyed = position(&events, |e| matches!(e, DeviceEvent::SwapchainDestroyed(_)));
    let created = position(&events, |e| matches!(e, DeviceEvent::SwapchainCreated { .. }));
    assert!(presented < idle && idle < destroyed && destroyed < created);
    assert_eq!(
        device.count_events(|e| matches!(e, DeviceEvent::FramebufferDestroyed(_))),
        old_images
    );
    assert_eq!(device.count_events(|e| matches!(e, DeviceEvent::FramebufferCreated(_))), 4);
    assert!(old_views.iter().all(|view| !device.is_live(view.raw())));
    assert_eq!(driver.surface().image_views().len(), 4);
    assert_eq!(driver.surface().framebuffer_count(), 4);

    assert_eq!(driver.render_frame().unwrap(), FrameOutcome::Presented);
    let submission = device.in_flight().pop().unwrap();
    assert!(device.is_live(submission.framebuffer.raw()));
    assert!(device.validation_errors().is_empty());
}

#[test]
fn vertex_buffer_is_replaced_only_when_it_grows() {
    let device = Arc::new(HeadlessDevice::new());
    let registry = Arc::new(ObjectRegistry::new());
    let object = registry.add(cube());
    let mut driver = driver(&device, &registry, &RendererConfig::default());
    driver.render_frame().unwrap();
    let original = driver.mesh_buffers(0).and_then(|m| m.vertex_buffer()).unwrap();

    let mut larger = cube_vertices();
    larger.extend(cube_vertices().iter().map(|v| Vertex::new(v.position, [0.5; 3])));
    object.set_vertices(larger);
    driver.render_frame().unwrap();
    let grown = driver.mesh_buffers(0).and_then(|m| m.vertex_buffer()).unwrap();
    assert_ne!(grown, original);
    assert!(!device.is_live(original.raw()));

    let smaller: Vec<Vertex> = cube_vertices()
        .into_iter()
        .take(4)
        .map(|v| Vertex::new(v.position, [0.25; 3]))
        .collect();
    object.set_vertices(smaller.clone());
    driver.render_frame().unwrap();
    let reused = driver.mesh_buffers(0).and_then(|m| m.vertex_buffer()).unwrap();
    assert_eq!(reused, grown);

    let contents = device.buffer_contents(reused).unwrap();
    let written = bytemuck::cast_slice::<Vertex, u8>(&smaller);
    assert_eq!(&contents[..written.len()], written);
    assert!(device.validation_errors().is_empty());
}
