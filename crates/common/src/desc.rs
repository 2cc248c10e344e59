//! Creation and state descriptors passed to the encoder.
//!
//! All of these are plain values: the encoder copies them (and any slice they
//! come with) into the command record, so callers may drop or mutate their
//! own copy as soon as the encoder call returns.

use serde::{Deserialize, Serialize};

use crate::enums::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct BufferDesc {
    /// Size in bytes. Must be non-zero.
    pub size: u64,
    pub usage: Usage,
    pub bind: BindFlags,
    pub cpu_access: CpuAccess,
    /// Element stride for structured buffers, `0` otherwise.
    pub stride: u32,
}

impl BufferDesc {
    pub fn vertex(size: u64) -> Self {
        Self {
            size,
            bind: BindFlags::VERTEX_BUFFER,
            ..Default::default()
        }
    }

    pub fn index(size: u64) -> Self {
        Self {
            size,
            bind: BindFlags::INDEX_BUFFER,
            ..Default::default()
        }
    }

    pub fn constant(size: u64) -> Self {
        Self {
            size,
            usage: Usage::Dynamic,
            bind: BindFlags::CONSTANT_BUFFER,
            cpu_access: CpuAccess::WRITE,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TextureDimension {
    D1,
    #[default]
    D2,
    D3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TextureDesc {
    pub width: u32,
    pub height: u32,
    /// Depth for 3D textures, array layer count otherwise.
    pub depth_or_layers: u32,
    /// `0` requests the full mip chain.
    pub mip_levels: u32,
    pub format: TextureFormat,
    pub dimension: TextureDimension,
    pub sample_count: u32,
    pub usage: Usage,
    pub bind: BindFlags,
    pub cpu_access: CpuAccess,
}

impl TextureDesc {
    pub fn new_2d(width: u32, height: u32, format: TextureFormat) -> Self {
        Self {
            width,
            height,
            depth_or_layers: 1,
            mip_levels: 1,
            format,
            dimension: TextureDimension::D2,
            sample_count: 1,
            usage: Usage::Default,
            bind: BindFlags::SHADER_RESOURCE,
            cpu_access: CpuAccess::empty(),
        }
    }

    /// Number of levels in a full mip chain for this size.
    pub fn full_mip_chain(&self) -> u32 {
        let largest = self.width.max(self.height).max(1);
        u32::BITS - largest.leading_zeros()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum BorderColor {
    #[default]
    TransparentBlack,
    OpaqueBlack,
    OpaqueWhite,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SamplerDesc {
    pub min_filter: Filter,
    pub mag_filter: Filter,
    pub mip_filter: Filter,
    pub address_u: AddressMode,
    pub address_v: AddressMode,
    pub address_w: AddressMode,
    /// `1` disables anisotropic filtering.
    pub max_anisotropy: u16,
    /// Turns the sampler into a comparison sampler.
    pub compare: Option<ComparisonFunc>,
    pub lod_min: f32,
    pub lod_max: f32,
    pub border_color: BorderColor,
}

impl Default for SamplerDesc {
    fn default() -> Self {
        Self {
            min_filter: Filter::Linear,
            mag_filter: Filter::Linear,
            mip_filter: Filter::Linear,
            address_u: AddressMode::Wrap,
            address_v: AddressMode::Wrap,
            address_w: AddressMode::Wrap,
            max_anisotropy: 1,
            compare: None,
            lod_min: 0.0,
            lod_max: 32.0,
            border_color: BorderColor::TransparentBlack,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RasterDesc {
    pub fill: FillMode,
    pub cull: CullMode,
    /// Counter-clockwise winding is front facing.
    pub front_ccw: bool,
    pub depth_bias: i32,
    pub slope_scaled_depth_bias: f32,
    pub depth_bias_clamp: f32,
    pub depth_clip: bool,
    pub scissor_enable: bool,
}

impl Default for RasterDesc {
    fn default() -> Self {
        Self {
            fill: FillMode::Solid,
            cull: CullMode::Back,
            front_ccw: false,
            depth_bias: 0,
            slope_scaled_depth_bias: 0.0,
            depth_bias_clamp: 0.0,
            depth_clip: true,
            scissor_enable: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlendTargetDesc {
    pub enable: bool,
    pub src: BlendFactor,
    pub dst: BlendFactor,
    pub op: BlendOp,
    pub src_alpha: BlendFactor,
    pub dst_alpha: BlendFactor,
    pub op_alpha: BlendOp,
    pub write_mask: ColorWriteMask,
}

impl Default for BlendTargetDesc {
    fn default() -> Self {
        Self {
            enable: false,
            src: BlendFactor::One,
            dst: BlendFactor::Zero,
            op: BlendOp::Add,
            src_alpha: BlendFactor::One,
            dst_alpha: BlendFactor::Zero,
            op_alpha: BlendOp::Add,
            write_mask: ColorWriteMask::ALL,
        }
    }
}

impl BlendTargetDesc {
    /// Classic `src * a + dst * (1 - a)`.
    pub fn alpha_blend() -> Self {
        Self {
            enable: true,
            src: BlendFactor::SrcAlpha,
            dst: BlendFactor::InvSrcAlpha,
            src_alpha: BlendFactor::One,
            dst_alpha: BlendFactor::InvSrcAlpha,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct BlendDesc {
    pub alpha_to_coverage: bool,
    /// When false, `targets[0]` applies to every bound color target.
    pub independent: bool,
    pub targets: Vec<BlendTargetDesc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct StencilFaceDesc {
    pub fail: StencilOp,
    pub depth_fail: StencilOp,
    pub pass: StencilOp,
    pub func: ComparisonFunc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DepthStencilDesc {
    pub depth_enable: bool,
    pub depth_write: bool,
    pub depth_func: ComparisonFunc,
    pub stencil_enable: bool,
    pub stencil_read_mask: u8,
    pub stencil_write_mask: u8,
    pub front: StencilFaceDesc,
    pub back: StencilFaceDesc,
}

impl Default for DepthStencilDesc {
    fn default() -> Self {
        let face = StencilFaceDesc {
            func: ComparisonFunc::Always,
            ..Default::default()
        };
        Self {
            depth_enable: true,
            depth_write: true,
            depth_func: ComparisonFunc::Less,
            stencil_enable: false,
            stencil_read_mask: 0xff,
            stencil_write_mask: 0xff,
            front: face,
            back: face,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RenderTargetDesc {
    pub width: u32,
    pub height: u32,
    /// Depth formats create a depth/stencil target.
    pub format: TextureFormat,
    pub sample_count: u32,
    /// Also allow binding the target through `set_texture`.
    pub shader_visible: bool,
}

/// Borrowed shader input for `load_shader`; copied into a [`ShaderDesc`].
#[derive(Debug, Clone, Copy)]
pub struct ShaderSource<'a> {
    pub stage: ShaderStage,
    pub format: ShaderFormat,
    pub entry_point: &'a str,
    pub bytecode: &'a [u8],
}

impl ShaderSource<'_> {
    pub fn to_desc(&self) -> ShaderDesc {
        ShaderDesc {
            stage: self.stage,
            format: self.format,
            entry_point: self.entry_point.into(),
            bytecode: self.bytecode.into(),
        }
    }
}

/// Owned copy of a shader blob as it travels through the ring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShaderDesc {
    pub stage: ShaderStage,
    pub format: ShaderFormat,
    pub entry_point: Box<str>,
    pub bytecode: Box<[u8]>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InputElement {
    /// Shader input location.
    pub location: u32,
    pub format: VertexFormat,
    /// Vertex buffer slot the element reads from.
    pub buffer_slot: u32,
    /// Byte offset inside one vertex of that buffer.
    pub offset: u32,
    pub rate: InputRate,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

impl Viewport {
    pub fn full(width: u32, height: u32) -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: width as f32,
            height: height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ScissorRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Clear applied to the currently bound targets.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ClearDesc {
    pub color: Option<[f32; 4]>,
    pub depth: Option<f32>,
    pub stencil: Option<u32>,
}

impl ClearDesc {
    pub fn color(rgba: [f32; 4]) -> Self {
        Self {
            color: Some(rgba),
            ..Default::default()
        }
    }

    pub fn with_depth(mut self, depth: f32) -> Self {
        self.depth = Some(depth);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.color.is_none() && self.depth.is_none() && self.stencil.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_mip_chain_counts_levels() {
        let desc = TextureDesc::new_2d(256, 64, TextureFormat::Rgba8Unorm);
        assert_eq!(desc.full_mip_chain(), 9);
        let one = TextureDesc::new_2d(1, 1, TextureFormat::Rgba8Unorm);
        assert_eq!(one.full_mip_chain(), 1);
    }

    #[test]
    fn shader_source_copies_bytes() {
        let mut bytes = vec![1u8, 2, 3];
        let desc = ShaderSource {
            stage: ShaderStage::Vertex,
            format: ShaderFormat::SpirV,
            entry_point: "main",
            bytecode: &bytes,
        }
        .to_desc();
        bytes[0] = 9;
        assert_eq!(&*desc.bytecode, &[1, 2, 3]);
        assert_eq!(&*desc.entry_point, "main");
    }

    #[test]
    fn clear_desc_builders() {
        let clear = ClearDesc::color([0.0, 0.0, 0.0, 1.0]).with_depth(1.0);
        assert_eq!(clear.depth, Some(1.0));
        assert!(!clear.is_empty());
        assert!(ClearDesc::default().is_empty());
    }

    #[test]
    fn defaults_match_common_pipeline_state() {
        let raster = RasterDesc::default();
        assert_eq!(raster.cull, CullMode::Back);
        assert!(raster.depth_clip);
        let ds = DepthStencilDesc::default();
        assert!(ds.depth_enable && ds.depth_write);
        assert_eq!(ds.front.func, ComparisonFunc::Always);
    }
}
