//! Backend-neutral enums. Every backend maps each variant to a native value
//! or rejects it explicitly; none of them may silently substitute another.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Expected update pattern of a buffer or texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Usage {
    /// GPU read/write, occasional CPU updates through `update_buffer`.
    #[default]
    Default,
    /// Contents fixed at creation; initial data is required.
    Immutable,
    /// Rewritten by the CPU every frame.
    Dynamic,
    /// CPU-side copy source/destination.
    Staging,
}

bitflags! {
    /// How a resource may be bound to the pipeline.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct BindFlags: u32 {
        const VERTEX_BUFFER = 1 << 0;
        const INDEX_BUFFER = 1 << 1;
        const CONSTANT_BUFFER = 1 << 2;
        const SHADER_RESOURCE = 1 << 3;
        const RENDER_TARGET = 1 << 4;
        const DEPTH_STENCIL = 1 << 5;
        const UNORDERED_ACCESS = 1 << 6;
    }
}

bitflags! {
    /// CPU access requested for a resource.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct CpuAccess: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
    }
}

bitflags! {
    /// Per-channel color write enable.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct ColorWriteMask: u8 {
        const RED = 1 << 0;
        const GREEN = 1 << 1;
        const BLUE = 1 << 2;
        const ALPHA = 1 << 3;
        const ALL = Self::RED.bits() | Self::GREEN.bits() | Self::BLUE.bits() | Self::ALPHA.bits();
    }
}

impl Default for ColorWriteMask {
    fn default() -> Self {
        Self::ALL
    }
}

/// Texel formats for textures and render targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TextureFormat {
    R8Unorm,
    Rg8Unorm,
    Rgba8Unorm,
    Rgba8UnormSrgb,
    Bgra8Unorm,
    Bgra8UnormSrgb,
    Rgb10a2Unorm,
    R16Float,
    Rg16Float,
    Rgba16Float,
    R32Float,
    Rg32Float,
    Rgba32Float,
    R32Uint,
    Depth16Unorm,
    Depth24Stencil8,
    Depth32Float,
    Bc1Unorm,
    Bc3Unorm,
}

impl TextureFormat {
    pub fn is_depth(self) -> bool {
        matches!(
            self,
            Self::Depth16Unorm | Self::Depth24Stencil8 | Self::Depth32Float
        )
    }

    pub fn has_stencil(self) -> bool {
        matches!(self, Self::Depth24Stencil8)
    }

    pub fn is_compressed(self) -> bool {
        matches!(self, Self::Bc1Unorm | Self::Bc3Unorm)
    }

    /// Bytes per texel, or per 4x4 block for compressed formats.
    pub fn block_size(self) -> u32 {
        match self {
            Self::R8Unorm => 1,
            Self::Rg8Unorm | Self::R16Float | Self::Depth16Unorm => 2,
            Self::Rgba8Unorm
            | Self::Rgba8UnormSrgb
            | Self::Bgra8Unorm
            | Self::Bgra8UnormSrgb
            | Self::Rgb10a2Unorm
            | Self::Rg16Float
            | Self::R32Float
            | Self::R32Uint
            | Self::Depth24Stencil8
            | Self::Depth32Float => 4,
            Self::Rgba16Float | Self::Rg32Float | Self::Bc1Unorm => 8,
            Self::Rgba32Float | Self::Bc3Unorm => 16,
        }
    }

    /// Width/height of one block in texels.
    pub fn block_dim(self) -> u32 {
        if self.is_compressed() { 4 } else { 1 }
    }

    /// Tightly packed size of one 2D image of the given dimensions.
    pub fn image_size(self, width: u32, height: u32) -> u64 {
        let dim = self.block_dim();
        let blocks_x = width.div_ceil(dim) as u64;
        let blocks_y = height.div_ceil(dim) as u64;
        blocks_x * blocks_y * self.block_size() as u64
    }
}

/// Vertex attribute formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VertexFormat {
    Float32,
    Float32x2,
    Float32x3,
    Float32x4,
    Uint32,
    Uint32x2,
    Uint32x4,
    Sint32,
    Unorm8x4,
    Uint8x4,
    Float16x2,
    Float16x4,
}

impl VertexFormat {
    pub fn size(self) -> u32 {
        match self {
            Self::Float32 | Self::Uint32 | Self::Sint32 => 4,
            Self::Unorm8x4 | Self::Uint8x4 | Self::Float16x2 => 4,
            Self::Float32x2 | Self::Uint32x2 | Self::Float16x4 => 8,
            Self::Float32x3 => 12,
            Self::Float32x4 | Self::Uint32x4 => 16,
        }
    }
}

/// Whether an input element advances per vertex or per instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum InputRate {
    #[default]
    PerVertex,
    PerInstance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PrimitiveTopology {
    PointList,
    LineList,
    LineStrip,
    #[default]
    TriangleList,
    TriangleStrip,
}

impl PrimitiveTopology {
    pub fn is_strip(self) -> bool {
        matches!(self, Self::LineStrip | Self::TriangleStrip)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum IndexFormat {
    Uint16,
    #[default]
    Uint32,
}

impl IndexFormat {
    pub fn size(self) -> u32 {
        match self {
            Self::Uint16 => 2,
            Self::Uint32 => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ComparisonFunc {
    Never,
    #[default]
    Less,
    Equal,
    LessEqual,
    Greater,
    NotEqual,
    GreaterEqual,
    Always,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlendFactor {
    Zero,
    One,
    SrcColor,
    InvSrcColor,
    SrcAlpha,
    InvSrcAlpha,
    DestAlpha,
    InvDestAlpha,
    DestColor,
    InvDestColor,
    SrcAlphaSat,
    /// The constant passed to `set_blend_state`.
    BlendFactor,
    InvBlendFactor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum BlendOp {
    #[default]
    Add,
    Subtract,
    RevSubtract,
    Min,
    Max,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum StencilOp {
    #[default]
    Keep,
    Zero,
    Replace,
    IncrSat,
    DecrSat,
    Invert,
    Incr,
    Decr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum FillMode {
    #[default]
    Solid,
    Wireframe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CullMode {
    None,
    Front,
    #[default]
    Back,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Filter {
    Point,
    #[default]
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AddressMode {
    #[default]
    Wrap,
    Mirror,
    Clamp,
    Border,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShaderStage {
    Vertex,
    Pixel,
}

/// Encoding of the bytecode blob handed to `load_shader`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShaderFormat {
    /// UTF-8 WGSL source.
    Wgsl,
    /// Little-endian SPIR-V words.
    SpirV,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueryKind {
    /// Samples passing depth/stencil between begin and end.
    Occlusion,
    /// GPU time between begin and end, in nanoseconds.
    Timestamp,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_formats() {
        assert!(TextureFormat::Depth32Float.is_depth());
        assert!(TextureFormat::Depth24Stencil8.has_stencil());
        assert!(!TextureFormat::Depth32Float.has_stencil());
        assert!(!TextureFormat::Rgba8Unorm.is_depth());
    }

    #[test]
    fn image_size_handles_blocks() {
        assert_eq!(TextureFormat::Rgba8Unorm.image_size(4, 2), 32);
        // 5x5 texels round up to 2x2 BC1 blocks of 8 bytes.
        assert_eq!(TextureFormat::Bc1Unorm.image_size(5, 5), 32);
    }

    #[test]
    fn color_write_default_is_all() {
        let mask = ColorWriteMask::default();
        assert!(mask.contains(ColorWriteMask::RED | ColorWriteMask::ALPHA));
    }

    #[test]
    fn vertex_format_sizes() {
        assert_eq!(VertexFormat::Float32x3.size(), 12);
        assert_eq!(VertexFormat::Unorm8x4.size(), 4);
    }
}
