//! Rendering: the device seam, GPU resources, the frame core and backends

pub mod api;
pub mod backends;
pub mod error;
pub mod frame;
pub mod resources;

pub use error::{RenderError, RenderResult};
pub use frame::{FrameDriver, FrameOutcome};
