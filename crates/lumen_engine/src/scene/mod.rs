//! Scene objects shared between the host, the update thread and the renderer
//!
//! The update thread only ever touches host-side state (transforms, mesh
//! data, behaviours). GPU resources for an object live in the frame driver.

mod object;
mod registry;

pub use object::{Behavior, MeshData, RenderObject};
pub use registry::ObjectRegistry;
