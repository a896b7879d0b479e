//! The frame core: slot synchronization, the presentation surface and the
//! driver that ties them together with the descriptor pool

pub mod driver;
pub mod surface;
pub mod sync;

pub use driver::{FrameDriver, FrameOutcome};
pub use surface::PresentationSurface;
pub use sync::{FrameSlot, FrameSlots};
