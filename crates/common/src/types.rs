use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum number of simultaneously bound vertex buffers.
pub const MAX_VERTEX_BUFFERS: usize = 8;
/// Maximum number of color targets bound at once (and blend targets per blend state).
pub const MAX_COLOR_TARGETS: usize = 8;
/// Constant buffer / texture / sampler slots per shader stage.
pub const MAX_STAGE_SLOTS: usize = 4;

/// Opaque index of a GPU resource in the fixed-capacity slot table.
///
/// Handles are handed out at encode time, before the backend object exists.
/// A handle may be used in later encoder calls right away; the backend only
/// sees the real object once the matching create record has been replayed.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct ResourceHandle(pub u32);

impl ResourceHandle {
    /// The reserved "nothing bound" handle. Never allocated.
    pub const NULL: Self = Self(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Index into flat per-slot tables.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What a live slot holds. Used to catch handle/kind mix-ups at encode time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    Buffer,
    Texture,
    Sampler,
    Shader,
    InputLayout,
    BlendState,
    DepthStencilState,
    RenderTarget,
    Query,
}

impl ResourceKind {
    /// Kinds that may be bound through `set_texture`.
    pub fn is_sampleable(self) -> bool {
        matches!(self, Self::Texture | Self::RenderTarget)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_handle_is_zero() {
        assert!(ResourceHandle::NULL.is_null());
        assert!(!ResourceHandle(1).is_null());
        assert_eq!(ResourceHandle::default(), ResourceHandle::NULL);
    }

    #[test]
    fn handle_display_and_index() {
        let h = ResourceHandle(42);
        assert_eq!(h.to_string(), "#42");
        assert_eq!(h.index(), 42);
    }

    #[test]
    fn sampleable_kinds() {
        assert!(ResourceKind::Texture.is_sampleable());
        assert!(ResourceKind::RenderTarget.is_sampleable());
        assert!(!ResourceKind::Buffer.is_sampleable());
    }
}
