//! Reference render backend on wgpu.
//!
//! `WgpuBackend` implements the direct `Backend` API: the render thread of a
//! `RenderCommandQueue` replays records into it in encode order.
//!
//! # Invariants
//! - Every pipeline uses one fixed layout (constants, textures, samplers in
//!   groups 0, 1, 2); empty slots are filled with default objects.
//! - Pipelines are cached by the handles and states that built them and
//!   evicted when any of those handles is released.
//! - Targets must be bound again after every `present`.
//! - After a device loss every live object is rebuilt from its descriptor
//!   and initial data at the next `present`.

mod backend;
mod conversions;
mod pipeline;
mod resources;
mod surface;

pub use backend::WgpuBackend;
pub use pipeline::{CacheStats, PipelineCache, PipelineKey};
pub use resources::SlotTable;
pub use surface::SurfaceOptions;
