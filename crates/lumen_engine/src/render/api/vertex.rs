//! Vertex and uniform layouts shared by the CPU and the shaders
//!
//! Both types are `#[repr(C)]` and `Pod` so they can be copied into mapped
//! GPU memory byte for byte. The backend describes [`Vertex`] to the
//! pipeline as two `R32G32B32_SFLOAT` attributes at locations 0 and 1.

use bytemuck::{Pod, Zeroable};

use crate::foundation::math::Mat4;

/// Position plus color vertex
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default, Pod, Zeroable)]
pub struct Vertex {
    /// Position in model space
    pub position: [f32; 3],
    /// Linear RGB color
    pub color: [f32; 3],
}

impl Vertex {
    /// Byte offset of the color attribute
    pub const COLOR_OFFSET: u32 = 12;

    /// Create a new vertex
    pub const fn new(position: [f32; 3], color: [f32; 3]) -> Self {
        Self { position, color }
    }
}

/// Per-object matrices consumed by the vertex shader at set 0, binding 0
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct UniformBufferObject {
    /// Model to world, column-major
    pub model: [[f32; 4]; 4],
    /// World to view, column-major
    pub view: [[f32; 4]; 4],
    /// View to clip, column-major
    pub proj: [[f32; 4]; 4],
}

impl UniformBufferObject {
    /// Pack the three matrices
    pub fn new(model: Mat4, view: Mat4, proj: Mat4) -> Self {
        Self {
            model: model.into(),
            view: view.into(),
            proj: proj.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::foundation::math::Vec3;

    #[test]
    fn layouts_match_shader_expectations() {
        assert_eq!(std::mem::size_of::<Vertex>(), 24);
        assert_eq!(std::mem::size_of::<UniformBufferObject>(), 192);
        let vertex = Vertex::new([1.0, 2.0, 3.0], [0.5, 0.25, 0.125]);
        let bytes = bytemuck::bytes_of(&vertex);
        let color: &[f32] = bytemuck::cast_slice(&bytes[Vertex::COLOR_OFFSET as usize..]);
        assert_eq!(color, &[0.5, 0.25, 0.125]);
    }

    #[test]
    fn matrices_are_stored_column_major() {
        let model = Mat4::new_translation(&Vec3::new(4.0, 5.0, 6.0));
        let ubo = UniformBufferObject::new(model, Mat4::identity(), Mat4::identity());
        assert_eq!(ubo.model[3], [4.0, 5.0, 6.0, 1.0]);
        assert_eq!(ubo.view[1], [0.0, 1.0, 0.0, 0.0]);
    }
}
