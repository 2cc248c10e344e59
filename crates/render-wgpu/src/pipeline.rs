//! Fixed binding layout and the render pipeline cache.
//!
//! Every pipeline shares one layout: group 0 holds constant buffers, group 1
//! textures, group 2 samplers. Inside a group, vertex-stage slot `n` sits at
//! binding `n` and pixel-stage slot `n` at binding `MAX_STAGE_SLOTS + n`.

use rhi_common::*;
use std::collections::HashMap;

pub const GROUP_CONSTANTS: u32 = 0;
pub const GROUP_TEXTURES: u32 = 1;
pub const GROUP_SAMPLERS: u32 = 2;
pub const BINDINGS_PER_GROUP: usize = MAX_STAGE_SLOTS * 2;

pub fn binding_index(stage: ShaderStage, slot: u32) -> usize {
    match stage {
        ShaderStage::Vertex => slot as usize,
        ShaderStage::Pixel => MAX_STAGE_SLOTS + slot as usize,
    }
}

fn visibility(binding: usize) -> wgpu::ShaderStages {
    if binding < MAX_STAGE_SLOTS {
        wgpu::ShaderStages::VERTEX
    } else {
        wgpu::ShaderStages::FRAGMENT
    }
}

/// Bind group layouts plus the pipeline layout built from them.
pub struct FixedLayout {
    pub groups: [wgpu::BindGroupLayout; 3],
    pub pipeline: wgpu::PipelineLayout,
}

impl FixedLayout {
    pub fn new(device: &wgpu::Device) -> Self {
        let make = |label: &str, ty: wgpu::BindingType| {
            let entries: Vec<_> = (0..BINDINGS_PER_GROUP)
                .map(|binding| wgpu::BindGroupLayoutEntry {
                    binding: binding as u32,
                    visibility: visibility(binding),
                    ty,
                    count: None,
                })
                .collect();
            device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some(label),
                entries: &entries,
            })
        };
        let constants = make(
            "rhi constants",
            wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: false,
                min_binding_size: None,
            },
        );
        let textures = make(
            "rhi textures",
            wgpu::BindingType::Texture {
                sample_type: wgpu::TextureSampleType::Float { filterable: true },
                view_dimension: wgpu::TextureViewDimension::D2,
                multisampled: false,
            },
        );
        let samplers = make(
            "rhi samplers",
            wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
        );
        let pipeline = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("rhi pipeline layout"),
            bind_group_layouts: &[&constants, &textures, &samplers],
            push_constant_ranges: &[],
        });
        Self {
            groups: [constants, textures, samplers],
            pipeline,
        }
    }
}

/// Objects bound in place of empty slots so every bind group is complete.
pub struct Defaults {
    pub uniform: wgpu::Buffer,
    pub texture_view: wgpu::TextureView,
    pub sampler: wgpu::Sampler,
}

impl Defaults {
    pub fn new(device: &wgpu::Device) -> Self {
        let uniform = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("rhi default constants"),
            size: 256,
            usage: wgpu::BufferUsages::UNIFORM,
            mapped_at_creation: false,
        });
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("rhi default texture"),
            size: wgpu::Extent3d {
                width: 1,
                height: 1,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu::TextureFormat::Rgba8Unorm,
            usage: wgpu::TextureUsages::TEXTURE_BINDING,
            view_formats: &[],
        });
        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("rhi default sampler"),
            ..Default::default()
        });
        Self {
            uniform,
            texture_view: texture.create_view(&Default::default()),
            sampler,
        }
    }
}

/// Rasterizer state with its floats stored as bits so the key can hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RasterKey {
    pub fill: FillMode,
    pub cull: CullMode,
    pub front_ccw: bool,
    pub depth_bias: i32,
    pub slope_scaled_depth_bias: u32,
    pub depth_bias_clamp: u32,
    pub depth_clip: bool,
}

impl From<&RasterDesc> for RasterKey {
    fn from(desc: &RasterDesc) -> Self {
        Self {
            fill: desc.fill,
            cull: desc.cull,
            front_ccw: desc.front_ccw,
            depth_bias: desc.depth_bias,
            slope_scaled_depth_bias: desc.slope_scaled_depth_bias.to_bits(),
            depth_bias_clamp: desc.depth_bias_clamp.to_bits(),
            depth_clip: desc.depth_clip,
        }
    }
}

/// Everything that shapes a `wgpu::RenderPipeline`. Handles stand in for the
/// shader, layout and state objects they name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PipelineKey {
    pub vertex_shader: ResourceHandle,
    pub pixel_shader: ResourceHandle,
    pub input_layout: ResourceHandle,
    pub blend: ResourceHandle,
    pub depth_stencil: ResourceHandle,
    pub raster: RasterKey,
    pub topology: PrimitiveTopology,
    pub strip_index: Option<IndexFormat>,
    pub strides: [u32; MAX_VERTEX_BUFFERS],
    pub colors: Vec<wgpu::TextureFormat>,
    pub depth: Option<wgpu::TextureFormat>,
    pub sample_count: u32,
}

impl PipelineKey {
    pub fn references(&self, handle: ResourceHandle) -> bool {
        !handle.is_null()
            && [
                self.vertex_shader,
                self.pixel_shader,
                self.input_layout,
                self.blend,
                self.depth_stencil,
            ]
            .contains(&handle)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// Pipelines by key. Generic over the stored value so eviction can be tested
/// without a device.
#[derive(Debug)]
pub struct PipelineCache<P> {
    entries: HashMap<PipelineKey, P>,
    stats: CacheStats,
}

impl<P> Default for PipelineCache<P> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            stats: CacheStats::default(),
        }
    }
}

impl<P: Clone> PipelineCache<P> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached pipeline or builds, stores and returns a new one.
    /// A failed build leaves nothing behind.
    pub fn get_or_try_insert<E>(
        &mut self,
        key: &PipelineKey,
        build: impl FnOnce() -> Result<P, E>,
    ) -> Result<P, E> {
        if let Some(pipeline) = self.entries.get(key) {
            self.stats.hits += 1;
            return Ok(pipeline.clone());
        }
        self.stats.misses += 1;
        let pipeline = build()?;
        self.entries.insert(key.clone(), pipeline.clone());
        Ok(pipeline)
    }

    /// Drops every entry built from `handle`; the slot may be reused for a
    /// different object.
    pub fn evict(&mut self, handle: ResourceHandle) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, _| !key.references(handle));
        let evicted = before - self.entries.len();
        self.stats.evictions += evicted as u64;
        evicted
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(vs: u32, ps: u32) -> PipelineKey {
        PipelineKey {
            vertex_shader: ResourceHandle(vs),
            pixel_shader: ResourceHandle(ps),
            input_layout: ResourceHandle::NULL,
            blend: ResourceHandle::NULL,
            depth_stencil: ResourceHandle::NULL,
            raster: RasterKey::from(&RasterDesc::default()),
            topology: PrimitiveTopology::TriangleList,
            strip_index: None,
            strides: [0; MAX_VERTEX_BUFFERS],
            colors: vec![wgpu::TextureFormat::Bgra8UnormSrgb],
            depth: None,
            sample_count: 1,
        }
    }

    #[test]
    fn binding_indices_split_stages() {
        assert_eq!(binding_index(ShaderStage::Vertex, 3), 3);
        assert_eq!(binding_index(ShaderStage::Pixel, 0), MAX_STAGE_SLOTS);
        assert_eq!(visibility(MAX_STAGE_SLOTS), wgpu::ShaderStages::FRAGMENT);
    }

    #[test]
    fn cache_hits_after_first_build() {
        let mut cache = PipelineCache::new();
        let mut builds = 0;
        for _ in 0..3 {
            let value: Result<u32, ()> = cache.get_or_try_insert(&key(1, 2), || {
                builds += 1;
                Ok(7)
            });
            assert_eq!(value, Ok(7));
        }
        assert_eq!(builds, 1);
        assert_eq!(cache.stats().hits, 2);
    }

    #[test]
    fn failed_build_is_not_cached() {
        let mut cache: PipelineCache<u32> = PipelineCache::new();
        assert_eq!(cache.get_or_try_insert(&key(1, 2), || Err("bad")), Err("bad"));
        assert!(cache.is_empty());
    }

    #[test]
    fn evict_drops_entries_using_released_handle() {
        let mut cache = PipelineCache::new();
        let _ = cache.get_or_try_insert::<()>(&key(1, 2), || Ok(1u32));
        let _ = cache.get_or_try_insert::<()>(&key(1, 3), || Ok(2u32));
        let _ = cache.get_or_try_insert::<()>(&key(4, 3), || Ok(3u32));
        assert_eq!(cache.evict(ResourceHandle(1)), 2);
        assert_eq!(cache.len(), 1);
        // Rebuilt under the reused slot instead of returning the stale entry.
        let fresh = cache.get_or_try_insert::<()>(&key(1, 2), || Ok(9u32));
        assert_eq!(fresh, Ok(9));
    }

    #[test]
    fn null_handle_never_evicts() {
        let mut cache = PipelineCache::new();
        let _ = cache.get_or_try_insert::<()>(&key(1, 2), || Ok(1u32));
        assert_eq!(cache.evict(ResourceHandle::NULL), 0);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn raster_key_distinguishes_bias() {
        let a = RasterKey::from(&RasterDesc::default());
        let b = RasterKey::from(&RasterDesc {
            slope_scaled_depth_bias: 1.5,
            ..Default::default()
        });
        assert_ne!(a, b);
    }
}
