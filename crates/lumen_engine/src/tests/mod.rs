//! Cross-component tests running the frame protocol on the headless device

mod frame_protocol;
mod scenarios;

use std::sync::Arc;

use crate::core::RendererConfig;
use crate::render::api::{UniformBufferObject, Vertex};
use crate::render::backends::headless::HeadlessDevice;
use crate::render::FrameDriver;
use crate::scene::{ObjectRegistry, RenderObject};

/// Unit cube with one color per corner
fn cube_vertices() -> Vec<Vertex> {
    vec![
        Vertex::new([-0.5, -0.5, 0.5], [1.0, 0.0, 0.0]),
        Vertex::new([0.5, -0.5, 0.5], [0.0, 1.0, 0.0]),
        Vertex::new([0.5, 0.5, 0.5], [0.0, 0.0, 1.0]),
        Vertex::new([-0.5, 0.5, 0.5], [1.0, 1.0, 0.0]),
        Vertex::new([-0.5, -0.5, -0.5], [1.0, 0.0, 1.0]),
        Vertex::new([0.5, -0.5, -0.5], [0.0, 1.0, 1.0]),
        Vertex::new([0.5, 0.5, -0.5], [1.0, 1.0, 1.0]),
        Vertex::new([-0.5, 0.5, -0.5], [0.0, 0.0, 0.0]),
    ]
}

fn cube_indices() -> Vec<u16> {
    vec![
        0, 1, 2, 2, 3, 0, // front
        1, 5, 6, 6, 2, 1, // right
        5, 4, 7, 7, 6, 5, // back
        4, 0, 3, 3, 7, 4, // left
        3, 2, 6, 6, 7, 3, // top
        4, 5, 1, 1, 0, 4, // bottom
    ]
}

fn cube() -> RenderObject {
    let object = RenderObject::new();
    object.set_vertices(cube_vertices());
    object.set_indices(cube_indices());
    object
}

fn driver(
    device: &Arc<HeadlessDevice>,
    registry: &Arc<ObjectRegistry>,
    config: &RendererConfig,
) -> FrameDriver<HeadlessDevice> {
    FrameDriver::new(Arc::clone(device), Arc::clone(registry), config).unwrap()
}

/// Uniform data each draw of the newest pending submission reads
fn submitted_uniforms(device: &HeadlessDevice) -> Vec<UniformBufferObject> {
    let submission = device.in_flight().pop().expect("a pending submission");
    submission
        .uniform_regions
        .iter()
        .map(|region| {
            let bytes = device.buffer_contents(region.buffer).expect("live uniform buffer");
            let start = region.offset as usize;
            bytemuck::pod_read_unaligned(&bytes[start..start + std::mem::size_of::<UniformBufferObject>()])
        })
        .collect()
}
