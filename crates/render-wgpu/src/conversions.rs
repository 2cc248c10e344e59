//! Mapping of the backend-neutral enums onto wgpu.
//!
//! Every variant either maps exactly or fails with `Unsupported`; nothing is
//! silently replaced by a "close enough" value. Feature-gated mappings take
//! the device's enabled features.

use rhi_common::*;
use rhi_render::{BackendError, BackendResult};

pub fn texture_format(
    format: TextureFormat,
    features: wgpu::Features,
) -> BackendResult<wgpu::TextureFormat> {
    use wgpu::TextureFormat as W;
    let mapped = match format {
        TextureFormat::R8Unorm => W::R8Unorm,
        TextureFormat::Rg8Unorm => W::Rg8Unorm,
        TextureFormat::Rgba8Unorm => W::Rgba8Unorm,
        TextureFormat::Rgba8UnormSrgb => W::Rgba8UnormSrgb,
        TextureFormat::Bgra8Unorm => W::Bgra8Unorm,
        TextureFormat::Bgra8UnormSrgb => W::Bgra8UnormSrgb,
        TextureFormat::Rgb10a2Unorm => W::Rgb10a2Unorm,
        TextureFormat::R16Float => W::R16Float,
        TextureFormat::Rg16Float => W::Rg16Float,
        TextureFormat::Rgba16Float => W::Rgba16Float,
        TextureFormat::R32Float => W::R32Float,
        TextureFormat::Rg32Float => W::Rg32Float,
        TextureFormat::Rgba32Float => W::Rgba32Float,
        TextureFormat::R32Uint => W::R32Uint,
        TextureFormat::Depth16Unorm => W::Depth16Unorm,
        TextureFormat::Depth24Stencil8 => W::Depth24PlusStencil8,
        TextureFormat::Depth32Float => W::Depth32Float,
        TextureFormat::Bc1Unorm | TextureFormat::Bc3Unorm => {
            if !features.contains(wgpu::Features::TEXTURE_COMPRESSION_BC) {
                return Err(BackendError::unsupported(format!(
                    "{format:?} needs TEXTURE_COMPRESSION_BC"
                )));
            }
            if format == TextureFormat::Bc1Unorm {
                W::Bc1RgbaUnorm
            } else {
                W::Bc3RgbaUnorm
            }
        }
    };
    Ok(mapped)
}

pub fn vertex_format(format: VertexFormat) -> wgpu::VertexFormat {
    use wgpu::VertexFormat as W;
    match format {
        VertexFormat::Float32 => W::Float32,
        VertexFormat::Float32x2 => W::Float32x2,
        VertexFormat::Float32x3 => W::Float32x3,
        VertexFormat::Float32x4 => W::Float32x4,
        VertexFormat::Uint32 => W::Uint32,
        VertexFormat::Uint32x2 => W::Uint32x2,
        VertexFormat::Uint32x4 => W::Uint32x4,
        VertexFormat::Sint32 => W::Sint32,
        VertexFormat::Unorm8x4 => W::Unorm8x4,
        VertexFormat::Uint8x4 => W::Uint8x4,
        VertexFormat::Float16x2 => W::Float16x2,
        VertexFormat::Float16x4 => W::Float16x4,
    }
}

pub fn step_mode(rate: InputRate) -> wgpu::VertexStepMode {
    match rate {
        InputRate::PerVertex => wgpu::VertexStepMode::Vertex,
        InputRate::PerInstance => wgpu::VertexStepMode::Instance,
    }
}

pub fn topology(topology: PrimitiveTopology) -> wgpu::PrimitiveTopology {
    match topology {
        PrimitiveTopology::PointList => wgpu::PrimitiveTopology::PointList,
        PrimitiveTopology::LineList => wgpu::PrimitiveTopology::LineList,
        PrimitiveTopology::LineStrip => wgpu::PrimitiveTopology::LineStrip,
        PrimitiveTopology::TriangleList => wgpu::PrimitiveTopology::TriangleList,
        PrimitiveTopology::TriangleStrip => wgpu::PrimitiveTopology::TriangleStrip,
    }
}

pub fn index_format(format: IndexFormat) -> wgpu::IndexFormat {
    match format {
        IndexFormat::Uint16 => wgpu::IndexFormat::Uint16,
        IndexFormat::Uint32 => wgpu::IndexFormat::Uint32,
    }
}

pub fn compare(func: ComparisonFunc) -> wgpu::CompareFunction {
    use wgpu::CompareFunction as W;
    match func {
        ComparisonFunc::Never => W::Never,
        ComparisonFunc::Less => W::Less,
        ComparisonFunc::Equal => W::Equal,
        ComparisonFunc::LessEqual => W::LessEqual,
        ComparisonFunc::Greater => W::Greater,
        ComparisonFunc::NotEqual => W::NotEqual,
        ComparisonFunc::GreaterEqual => W::GreaterEqual,
        ComparisonFunc::Always => W::Always,
    }
}

pub fn blend_factor(factor: BlendFactor) -> wgpu::BlendFactor {
    use wgpu::BlendFactor as W;
    match factor {
        BlendFactor::Zero => W::Zero,
        BlendFactor::One => W::One,
        BlendFactor::SrcColor => W::Src,
        BlendFactor::InvSrcColor => W::OneMinusSrc,
        BlendFactor::SrcAlpha => W::SrcAlpha,
        BlendFactor::InvSrcAlpha => W::OneMinusSrcAlpha,
        BlendFactor::DestAlpha => W::DstAlpha,
        BlendFactor::InvDestAlpha => W::OneMinusDstAlpha,
        BlendFactor::DestColor => W::Dst,
        BlendFactor::InvDestColor => W::OneMinusDst,
        BlendFactor::SrcAlphaSat => W::SrcAlphaSaturated,
        BlendFactor::BlendFactor => W::Constant,
        BlendFactor::InvBlendFactor => W::OneMinusConstant,
    }
}

pub fn blend_op(op: BlendOp) -> wgpu::BlendOperation {
    match op {
        BlendOp::Add => wgpu::BlendOperation::Add,
        BlendOp::Subtract => wgpu::BlendOperation::Subtract,
        BlendOp::RevSubtract => wgpu::BlendOperation::ReverseSubtract,
        BlendOp::Min => wgpu::BlendOperation::Min,
        BlendOp::Max => wgpu::BlendOperation::Max,
    }
}

/// wgpu requires `One`/`One` factors for min and max; other factors are
/// ignored by D3D-style APIs but rejected here rather than rewritten.
fn blend_component(
    src: BlendFactor,
    dst: BlendFactor,
    op: BlendOp,
) -> BackendResult<wgpu::BlendComponent> {
    if matches!(op, BlendOp::Min | BlendOp::Max)
        && (src != BlendFactor::One || dst != BlendFactor::One)
    {
        return Err(BackendError::unsupported(format!(
            "{op:?} blending with factors {src:?}/{dst:?}; only One/One is expressible"
        )));
    }
    Ok(wgpu::BlendComponent {
        src_factor: blend_factor(src),
        dst_factor: blend_factor(dst),
        operation: blend_op(op),
    })
}

pub fn color_writes(mask: ColorWriteMask) -> wgpu::ColorWrites {
    let mut writes = wgpu::ColorWrites::empty();
    if mask.contains(ColorWriteMask::RED) {
        writes |= wgpu::ColorWrites::RED;
    }
    if mask.contains(ColorWriteMask::GREEN) {
        writes |= wgpu::ColorWrites::GREEN;
    }
    if mask.contains(ColorWriteMask::BLUE) {
        writes |= wgpu::ColorWrites::BLUE;
    }
    if mask.contains(ColorWriteMask::ALPHA) {
        writes |= wgpu::ColorWrites::ALPHA;
    }
    writes
}

pub fn color_target(
    desc: &BlendTargetDesc,
    format: wgpu::TextureFormat,
) -> BackendResult<wgpu::ColorTargetState> {
    let blend = if desc.enable {
        Some(wgpu::BlendState {
            color: blend_component(desc.src, desc.dst, desc.op)?,
            alpha: blend_component(desc.src_alpha, desc.dst_alpha, desc.op_alpha)?,
        })
    } else {
        None
    };
    Ok(wgpu::ColorTargetState {
        format,
        blend,
        write_mask: color_writes(desc.write_mask),
    })
}

pub fn stencil_op(op: StencilOp) -> wgpu::StencilOperation {
    use wgpu::StencilOperation as W;
    match op {
        StencilOp::Keep => W::Keep,
        StencilOp::Zero => W::Zero,
        StencilOp::Replace => W::Replace,
        StencilOp::IncrSat => W::IncrementClamp,
        StencilOp::DecrSat => W::DecrementClamp,
        StencilOp::Invert => W::Invert,
        StencilOp::Incr => W::IncrementWrap,
        StencilOp::Decr => W::DecrementWrap,
    }
}

fn stencil_face(face: &StencilFaceDesc) -> wgpu::StencilFaceState {
    wgpu::StencilFaceState {
        compare: compare(face.func),
        fail_op: stencil_op(face.fail),
        depth_fail_op: stencil_op(face.depth_fail),
        pass_op: stencil_op(face.pass),
    }
}

pub fn depth_stencil(
    desc: &DepthStencilDesc,
    raster: &RasterDesc,
    format: wgpu::TextureFormat,
) -> wgpu::DepthStencilState {
    let stencil = if desc.stencil_enable {
        wgpu::StencilState {
            front: stencil_face(&desc.front),
            back: stencil_face(&desc.back),
            read_mask: desc.stencil_read_mask as u32,
            write_mask: desc.stencil_write_mask as u32,
        }
    } else {
        wgpu::StencilState::default()
    };
    wgpu::DepthStencilState {
        format,
        depth_write_enabled: desc.depth_enable && desc.depth_write,
        depth_compare: if desc.depth_enable {
            compare(desc.depth_func)
        } else {
            wgpu::CompareFunction::Always
        },
        stencil,
        bias: wgpu::DepthBiasState {
            constant: raster.depth_bias,
            slope_scale: raster.slope_scaled_depth_bias,
            clamp: raster.depth_bias_clamp,
        },
    }
}

pub fn primitive(
    raster: &RasterDesc,
    topo: PrimitiveTopology,
    strip_index: Option<IndexFormat>,
    features: wgpu::Features,
) -> BackendResult<wgpu::PrimitiveState> {
    let polygon_mode = match raster.fill {
        FillMode::Solid => wgpu::PolygonMode::Fill,
        FillMode::Wireframe => {
            if !features.contains(wgpu::Features::POLYGON_MODE_LINE) {
                return Err(BackendError::unsupported(
                    "wireframe fill needs POLYGON_MODE_LINE",
                ));
            }
            wgpu::PolygonMode::Line
        }
    };
    if !raster.depth_clip && !features.contains(wgpu::Features::DEPTH_CLIP_CONTROL) {
        return Err(BackendError::unsupported(
            "disabling depth clip needs DEPTH_CLIP_CONTROL",
        ));
    }
    Ok(wgpu::PrimitiveState {
        topology: topology(topo),
        strip_index_format: if topo.is_strip() {
            strip_index.map(index_format)
        } else {
            None
        },
        front_face: if raster.front_ccw {
            wgpu::FrontFace::Ccw
        } else {
            wgpu::FrontFace::Cw
        },
        cull_mode: match raster.cull {
            CullMode::None => None,
            CullMode::Front => Some(wgpu::Face::Front),
            CullMode::Back => Some(wgpu::Face::Back),
        },
        unclipped_depth: !raster.depth_clip,
        polygon_mode,
        conservative: false,
    })
}

pub fn filter(filter: Filter) -> wgpu::FilterMode {
    match filter {
        Filter::Point => wgpu::FilterMode::Nearest,
        Filter::Linear => wgpu::FilterMode::Linear,
    }
}

pub fn address_mode(
    mode: AddressMode,
    features: wgpu::Features,
) -> BackendResult<wgpu::AddressMode> {
    Ok(match mode {
        AddressMode::Wrap => wgpu::AddressMode::Repeat,
        AddressMode::Mirror => wgpu::AddressMode::MirrorRepeat,
        AddressMode::Clamp => wgpu::AddressMode::ClampToEdge,
        AddressMode::Border => {
            if !features.contains(wgpu::Features::ADDRESS_MODE_CLAMP_TO_BORDER) {
                return Err(BackendError::unsupported(
                    "border addressing needs ADDRESS_MODE_CLAMP_TO_BORDER",
                ));
            }
            wgpu::AddressMode::ClampToBorder
        }
    })
}

pub fn border_color(color: BorderColor) -> wgpu::SamplerBorderColor {
    match color {
        BorderColor::TransparentBlack => wgpu::SamplerBorderColor::TransparentBlack,
        BorderColor::OpaqueBlack => wgpu::SamplerBorderColor::OpaqueBlack,
        BorderColor::OpaqueWhite => wgpu::SamplerBorderColor::OpaqueWhite,
    }
}

pub fn sampler<'a>(
    desc: &SamplerDesc,
    features: wgpu::Features,
) -> BackendResult<wgpu::SamplerDescriptor<'a>> {
    let anisotropy = desc.max_anisotropy.max(1);
    if anisotropy > 1
        && [desc.min_filter, desc.mag_filter, desc.mip_filter].contains(&Filter::Point)
    {
        return Err(BackendError::unsupported(
            "anisotropic filtering requires linear min, mag and mip filters",
        ));
    }
    let modes = [desc.address_u, desc.address_v, desc.address_w];
    Ok(wgpu::SamplerDescriptor {
        label: Some("rhi sampler"),
        address_mode_u: address_mode(desc.address_u, features)?,
        address_mode_v: address_mode(desc.address_v, features)?,
        address_mode_w: address_mode(desc.address_w, features)?,
        mag_filter: filter(desc.mag_filter),
        min_filter: filter(desc.min_filter),
        mipmap_filter: filter(desc.mip_filter),
        lod_min_clamp: desc.lod_min,
        lod_max_clamp: desc.lod_max,
        compare: desc.compare.map(compare),
        anisotropy_clamp: anisotropy,
        border_color: modes
            .contains(&AddressMode::Border)
            .then(|| border_color(desc.border_color)),
    })
}

pub fn buffer_usages(desc: &BufferDesc) -> wgpu::BufferUsages {
    let mut usages = wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::COPY_SRC;
    if desc.bind.contains(BindFlags::VERTEX_BUFFER) {
        usages |= wgpu::BufferUsages::VERTEX;
    }
    if desc.bind.contains(BindFlags::INDEX_BUFFER) {
        usages |= wgpu::BufferUsages::INDEX;
    }
    if desc.bind.contains(BindFlags::CONSTANT_BUFFER) {
        usages |= wgpu::BufferUsages::UNIFORM;
    }
    if desc
        .bind
        .intersects(BindFlags::SHADER_RESOURCE | BindFlags::UNORDERED_ACCESS)
    {
        usages |= wgpu::BufferUsages::STORAGE;
    }
    usages
}

pub fn texture_usages(bind: BindFlags) -> wgpu::TextureUsages {
    let mut usages = wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST;
    if bind.intersects(BindFlags::RENDER_TARGET | BindFlags::DEPTH_STENCIL) {
        usages |= wgpu::TextureUsages::RENDER_ATTACHMENT;
    }
    if bind.contains(BindFlags::UNORDERED_ACCESS) {
        usages |= wgpu::TextureUsages::STORAGE_BINDING;
    }
    usages
}

pub fn texture_dimension(dim: TextureDimension) -> wgpu::TextureDimension {
    match dim {
        TextureDimension::D1 => wgpu::TextureDimension::D1,
        TextureDimension::D2 => wgpu::TextureDimension::D2,
        TextureDimension::D3 => wgpu::TextureDimension::D3,
    }
}

pub fn color(rgba: [f32; 4]) -> wgpu::Color {
    wgpu::Color {
        r: rgba[0] as f64,
        g: rgba[1] as f64,
        b: rgba[2] as f64,
        a: rgba[3] as f64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bc_formats_need_feature() {
        let none = wgpu::Features::empty();
        assert!(matches!(
            texture_format(TextureFormat::Bc1Unorm, none),
            Err(BackendError::Unsupported(_))
        ));
        assert_eq!(
            texture_format(TextureFormat::Bc3Unorm, wgpu::Features::TEXTURE_COMPRESSION_BC)
                .unwrap(),
            wgpu::TextureFormat::Bc3RgbaUnorm
        );
        assert_eq!(
            texture_format(TextureFormat::Depth24Stencil8, none).unwrap(),
            wgpu::TextureFormat::Depth24PlusStencil8
        );
    }

    #[test]
    fn wireframe_needs_polygon_mode_line() {
        let raster = RasterDesc {
            fill: FillMode::Wireframe,
            ..Default::default()
        };
        let err = primitive(
            &raster,
            PrimitiveTopology::TriangleList,
            None,
            wgpu::Features::empty(),
        )
        .unwrap_err();
        assert!(err.is_misuse());
        let state = primitive(
            &raster,
            PrimitiveTopology::TriangleList,
            None,
            wgpu::Features::POLYGON_MODE_LINE,
        )
        .unwrap();
        assert_eq!(state.polygon_mode, wgpu::PolygonMode::Line);
    }

    #[test]
    fn strip_index_format_only_for_strips() {
        let raster = RasterDesc::default();
        let strip = primitive(
            &raster,
            PrimitiveTopology::TriangleStrip,
            Some(IndexFormat::Uint16),
            wgpu::Features::empty(),
        )
        .unwrap();
        assert_eq!(strip.strip_index_format, Some(wgpu::IndexFormat::Uint16));
        let list = primitive(
            &raster,
            PrimitiveTopology::TriangleList,
            Some(IndexFormat::Uint16),
            wgpu::Features::empty(),
        )
        .unwrap();
        assert_eq!(list.strip_index_format, None);
        assert_eq!(list.cull_mode, Some(wgpu::Face::Back));
        assert_eq!(list.front_face, wgpu::FrontFace::Cw);
    }

    #[test]
    fn border_addressing_is_feature_gated() {
        let desc = SamplerDesc {
            address_u: AddressMode::Border,
            ..Default::default()
        };
        assert!(sampler(&desc, wgpu::Features::empty()).is_err());
        let mapped = sampler(&desc, wgpu::Features::ADDRESS_MODE_CLAMP_TO_BORDER).unwrap();
        assert_eq!(mapped.address_mode_u, wgpu::AddressMode::ClampToBorder);
        assert_eq!(
            mapped.border_color,
            Some(wgpu::SamplerBorderColor::TransparentBlack)
        );
    }

    #[test]
    fn anisotropy_with_point_filter_rejected() {
        let desc = SamplerDesc {
            max_anisotropy: 8,
            mip_filter: Filter::Point,
            ..Default::default()
        };
        assert!(sampler(&desc, wgpu::Features::empty()).is_err());
    }

    #[test]
    fn blend_factors_map_one_to_one() {
        assert_eq!(
            blend_factor(BlendFactor::SrcAlphaSat),
            wgpu::BlendFactor::SrcAlphaSaturated
        );
        assert_eq!(
            blend_factor(BlendFactor::InvBlendFactor),
            wgpu::BlendFactor::OneMinusConstant
        );
        let target = color_target(
            &BlendTargetDesc::alpha_blend(),
            wgpu::TextureFormat::Rgba8Unorm,
        )
        .unwrap();
        let blend = target.blend.unwrap();
        assert_eq!(blend.color.src_factor, wgpu::BlendFactor::SrcAlpha);
        assert_eq!(blend.color.dst_factor, wgpu::BlendFactor::OneMinusSrcAlpha);
    }

    #[test]
    fn min_max_blend_requires_unit_factors() {
        let desc = BlendTargetDesc {
            enable: true,
            op: BlendOp::Max,
            src: BlendFactor::SrcAlpha,
            ..Default::default()
        };
        assert!(color_target(&desc, wgpu::TextureFormat::Rgba8Unorm).is_err());
    }

    #[test]
    fn stencil_wrap_and_clamp_are_distinct() {
        assert_eq!(stencil_op(StencilOp::IncrSat), wgpu::StencilOperation::IncrementClamp);
        assert_eq!(stencil_op(StencilOp::Incr), wgpu::StencilOperation::IncrementWrap);
    }

    #[test]
    fn disabled_depth_test_always_passes() {
        let desc = DepthStencilDesc {
            depth_enable: false,
            ..Default::default()
        };
        let state = depth_stencil(
            &desc,
            &RasterDesc::default(),
            wgpu::TextureFormat::Depth32Float,
        );
        assert_eq!(state.depth_compare, wgpu::CompareFunction::Always);
        assert!(!state.depth_write_enabled);
    }

    #[test]
    fn constant_buffers_get_uniform_usage() {
        let usages = buffer_usages(&BufferDesc::constant(256));
        assert!(usages.contains(wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST));
        assert!(!usages.contains(wgpu::BufferUsages::VERTEX));
    }
}
