//! Vectors, matrices and transforms
//!
//! Thin aliases over `nalgebra` plus the handful of matrix builders the
//! renderer needs. Projection matrices target Vulkan clip space: depth in
//! `[0, 1]` and Y pointing down.

pub use nalgebra::{Matrix4, Vector3};

/// 3D vector type
pub type Vec3 = Vector3<f32>;

/// 4x4 matrix type
pub type Mat4 = Matrix4<f32>;

/// 3D point type
pub type Point3 = nalgebra::Point3<f32>;

/// Position plus Euler rotation (radians) of a renderable object
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    /// Position in world space
    pub position: Vec3,
    /// Rotation about the X, Y and Z axes in radians
    pub rotation: Vec3,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            position: Vec3::zeros(),
            rotation: Vec3::zeros(),
        }
    }
}

impl Transform {
    /// Create a transform at a position with no rotation
    pub fn from_position(position: Vec3) -> Self {
        Self {
            position,
            ..Default::default()
        }
    }

    /// Model matrix: `translate * rot_x * rot_y * rot_z`
    pub fn to_matrix(&self) -> Mat4 {
        Mat4::new_translation(&self.position)
            * Mat4::rotation_x(self.rotation.x)
            * Mat4::rotation_y(self.rotation.y)
            * Mat4::rotation_z(self.rotation.z)
    }
}

/// Matrix builders for rendering
pub trait Mat4Ext {
    /// Rotation around the X axis
    fn rotation_x(angle: f32) -> Mat4;

    /// Rotation around the Y axis
    fn rotation_y(angle: f32) -> Mat4;

    /// Rotation around the Z axis
    fn rotation_z(angle: f32) -> Mat4;

    /// Right-handed perspective projection into Vulkan clip space
    fn perspective(fov_y: f32, aspect: f32, near: f32, far: f32) -> Mat4;

    /// Right-handed view matrix
    fn look_at(eye: Vec3, target: Vec3, up: Vec3) -> Mat4;
}

impl Mat4Ext for Mat4 {
    fn rotation_x(angle: f32) -> Mat4 {
        Mat4::from_axis_angle(&Vec3::x_axis(), angle)
    }

    fn rotation_y(angle: f32) -> Mat4 {
        Mat4::from_axis_angle(&Vec3::y_axis(), angle)
    }

    fn rotation_z(angle: f32) -> Mat4 {
        Mat4::from_axis_angle(&Vec3::z_axis(), angle)
    }

    fn perspective(fov_y: f32, aspect: f32, near: f32, far: f32) -> Mat4 {
        let tan_half_fovy = (fov_y / 2.0).tan();
        let mut result = Mat4::zeros();

        result[(0, 0)] = 1.0 / (aspect * tan_half_fovy);
        // Negated so +Y in view space ends up at the top of the framebuffer
        result[(1, 1)] = -1.0 / tan_half_fovy;
        result[(2, 2)] = far / (near - far);
        result[(2, 3)] = (near * far) / (near - far);
        result[(3, 2)] = -1.0;

        result
    }

    fn look_at(eye: Vec3, target: Vec3, up: Vec3) -> Mat4 {
        Mat4::look_at_rh(&Point3::from(eye), &Point3::from(target), &up)
    }
}

/// Common math utility functions
pub mod utils {
    /// Convert degrees to radians
    pub fn deg_to_rad(degrees: f32) -> f32 {
        degrees.to_radians()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Vector4;

    #[test]
    fn identity_transform_is_identity_matrix() {
        assert_relative_eq!(Transform::default().to_matrix(), Mat4::identity());
    }

    #[test]
    fn model_matrix_rotates_z_first_then_translates() {
        let transform = Transform {
            position: Vec3::new(1.0, 2.0, 3.0),
            rotation: Vec3::new(0.0, 0.0, std::f32::consts::FRAC_PI_2),
        };
        let p = transform.to_matrix() * Vector4::new(1.0, 0.0, 0.0, 1.0);
        assert_relative_eq!(p, Vector4::new(1.0, 3.0, 3.0, 1.0), epsilon = 1e-5);
    }

    #[test]
    fn rotation_order_is_x_then_y_then_z() {
        let rotation = Vec3::new(0.3, -0.7, 1.1);
        let transform = Transform { position: Vec3::zeros(), rotation };
        let expected = Mat4::rotation_x(rotation.x) * Mat4::rotation_y(rotation.y) * Mat4::rotation_z(rotation.z);
        assert_relative_eq!(transform.to_matrix(), expected, epsilon = 1e-6);
    }

    #[test]
    fn perspective_maps_near_and_far_to_unit_depth() {
        let proj = Mat4::perspective(utils::deg_to_rad(45.0), 1.6, 0.1, 100.0);

        let near = proj * Vector4::new(0.0, 0.0, -0.1, 1.0);
        assert_relative_eq!(near.z / near.w, 0.0, epsilon = 1e-5);

        let far = proj * Vector4::new(0.0, 0.0, -100.0, 1.0);
        assert_relative_eq!(far.z / far.w, 1.0, epsilon = 1e-5);
    }

    #[test]
    fn perspective_flips_y_for_vulkan() {
        let proj = Mat4::perspective(utils::deg_to_rad(90.0), 1.0, 0.1, 100.0);
        let up = proj * Vector4::new(0.0, 1.0, -1.0, 1.0);
        assert!(up.y / up.w < 0.0);
    }

    #[test]
    fn look_at_moves_target_onto_negative_z() {
        let view = Mat4::look_at(Vec3::new(0.0, 0.0, 3.0), Vec3::zeros(), Vec3::y());
        let origin = view * Vector4::new(0.0, 0.0, 0.0, 1.0);
        assert_relative_eq!(origin, Vector4::new(0.0, 0.0, -3.0, 1.0), epsilon = 1e-6);
    }
}
