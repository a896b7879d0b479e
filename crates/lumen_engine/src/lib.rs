//! # Lumen Engine
//!
//! A minimal real-time 3D renderer on Vulkan with explicit frame
//! synchronization.
//!
//! ## Features
//!
//! - **Frames in flight**: per-slot semaphores, fences and command buffers
//! - **Swap chain lifecycle**: rebuilt on resize, out-of-date and suboptimal
//! - **Per-object resources**: uniform regions and descriptor sets that grow
//!   with the scene
//! - **Headless backend**: the full frame protocol without a GPU, for tests
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use lumen_engine::prelude::*;
//!
//! struct Spin;
//!
//! impl Behavior for Spin {
//!     fn update(&mut self, object: &RenderObject, delta_time: f32) {
//!         object.update_transform(|t| t.rotation.y += delta_time);
//!     }
//! }
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut engine = Engine::new(EngineConfig::default(), VulkanBackend::new());
//!     engine.add_shader("shaders/cube.vert.spv", ShaderStage::Vertex);
//!     engine.add_shader("shaders/cube.frag.spv", ShaderStage::Fragment);
//!     engine.instantiate(Spin);
//!     engine.start()?;
//!     while engine.is_running() {
//!         std::thread::sleep(std::time::Duration::from_millis(16));
//!     }
//!     engine.stop()?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions, clippy::similar_names, clippy::too_many_arguments)]

pub mod config;
pub mod core;
pub mod engine;
pub mod foundation;
pub mod render;
pub mod scene;

#[cfg(test)]
mod tests;

pub use engine::{Engine, EngineError};

/// Common imports for engine users
pub mod prelude {
    pub use crate::{
        config::Config,
        core::{EngineConfig, RendererConfig, ShaderStage, UpdateConfig, WindowConfig},
        foundation::{
            logging,
            math::{Mat4, Transform, Vec3},
        },
        render::{
            api::Vertex,
            backends::{headless::HeadlessBackend, vulkan::VulkanBackend},
            RenderError,
        },
        scene::{Behavior, ObjectRegistry, RenderObject},
        Engine, EngineError,
    };
}
