//! Backend-agnostic GPU interface
//!
//! The frame core is written against [`GpuDevice`]. The Vulkan backend
//! implements it for real hardware and the headless backend implements it
//! for tests.

pub mod device;
pub mod vertex;

pub use device::*;
pub use vertex::{UniformBufferObject, Vertex};
