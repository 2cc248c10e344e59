//! Shared vocabulary of the render command core: resource handles, the
//! backend-neutral enums, and the descriptor structs callers fill in.
//!
//! # Invariants
//! - `ResourceHandle::NULL` (0) is never allocated and always means "unbound".
//! - Every enum variant is either mapped exactly by a backend or rejected by it.

mod desc;
mod enums;
mod types;

pub use desc::*;
pub use enums::*;
pub use types::{
    MAX_COLOR_TARGETS, MAX_STAGE_SLOTS, MAX_VERTEX_BUFFERS, ResourceHandle, ResourceKind,
};
