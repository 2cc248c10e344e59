use rhi_common::*;
use rhi_render::{Backend, BackendError, BackendResult, PresentReport};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use wgpu::util::DeviceExt;

use crate::conversions as conv;
use crate::pipeline::{
    BINDINGS_PER_GROUP, CacheStats, Defaults, FixedLayout, GROUP_CONSTANTS, GROUP_SAMPLERS,
    GROUP_TEXTURES, PipelineCache, PipelineKey, RasterKey, binding_index,
};
use crate::resources::*;
use crate::surface::{Acquired, Presenter, SurfaceOptions};

/// Optional device features used when the adapter offers them. Anything that
/// depends on a missing one is reported as `Unsupported` at replay time.
const OPTIONAL_FEATURES: wgpu::Features = wgpu::Features::POLYGON_MODE_LINE
    .union(wgpu::Features::DEPTH_CLIP_CONTROL)
    .union(wgpu::Features::ADDRESS_MODE_CLAMP_TO_BORDER)
    .union(wgpu::Features::TEXTURE_COMPRESSION_BC)
    .union(wgpu::Features::FLOAT32_FILTERABLE)
    .union(wgpu::Features::TIMESTAMP_QUERY)
    .union(wgpu::Features::TIMESTAMP_QUERY_INSIDE_ENCODERS);

const QUERY_RESULT_SIZE: u64 = 8;

fn creation_failed(handle: ResourceHandle, reason: impl Into<String>) -> BackendError {
    BackendError::CreationFailed {
        handle,
        reason: reason.into(),
    }
}

/// Runs `create` inside validation and out-of-memory error scopes.
fn scoped<T>(device: &wgpu::Device, create: impl FnOnce() -> T) -> Result<T, String> {
    device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
    device.push_error_scope(wgpu::ErrorFilter::Validation);
    let value = create();
    let validation = pollster::block_on(device.pop_error_scope());
    let oom = pollster::block_on(device.pop_error_scope());
    match validation.or(oom) {
        Some(error) => Err(error.to_string()),
        None => Ok(value),
    }
}

struct DeviceBundle {
    device: wgpu::Device,
    queue: wgpu::Queue,
    features: wgpu::Features,
    lost: Arc<AtomicBool>,
}

fn open_device(adapter: &wgpu::Adapter) -> BackendResult<DeviceBundle> {
    let features = adapter.features() & OPTIONAL_FEATURES;
    let (device, queue) = pollster::block_on(adapter.request_device(
        &wgpu::DeviceDescriptor {
            label: Some("rhi device"),
            required_features: features,
            required_limits: wgpu::Limits::default(),
            memory_hints: Default::default(),
        },
        None,
    ))
    .map_err(|e| BackendError::Init(e.to_string()))?;

    // Validation errors outside an error scope are logged, not fatal.
    device.on_uncaptured_error(Box::new(|error| {
        tracing::error!(%error, "uncaptured wgpu error");
    }));
    let lost = Arc::new(AtomicBool::new(false));
    let flag = lost.clone();
    device.set_device_lost_callback(move |reason, message| {
        tracing::warn!(?reason, %message, "device lost");
        flag.store(true, Ordering::Release);
    });
    Ok(DeviceBundle {
        device,
        queue,
        features,
        lost,
    })
}

#[derive(Clone, Copy, Default)]
struct VertexBinding {
    buffer: ResourceHandle,
    stride: u32,
    offset: u64,
}

/// Attachments chosen by the last `set_targets`. `NULL` colors are the
/// backbuffer.
#[derive(Clone)]
struct BoundTargets {
    colors: Vec<ResourceHandle>,
    depth: ResourceHandle,
    color_formats: Vec<wgpu::TextureFormat>,
    depth_format: Option<wgpu::TextureFormat>,
    sample_count: u32,
    size: (u32, u32),
}

impl BoundTargets {
    fn contains(&self, handle: ResourceHandle) -> bool {
        !handle.is_null() && (self.depth == handle || self.colors.contains(&handle))
    }
}

/// Pipeline state set through the `set_*` calls. Persists across draws and
/// frames except for the targets, which every frame binds anew.
#[derive(Default)]
struct DrawState {
    vertex_shader: ResourceHandle,
    pixel_shader: ResourceHandle,
    input_layout: ResourceHandle,
    vertex_buffers: [VertexBinding; MAX_VERTEX_BUFFERS],
    index_buffer: Option<(ResourceHandle, IndexFormat, u64)>,
    constants: [ResourceHandle; BINDINGS_PER_GROUP],
    textures: [ResourceHandle; BINDINGS_PER_GROUP],
    samplers: [ResourceHandle; BINDINGS_PER_GROUP],
    /// `None` marks a group that must be rebuilt before the next draw.
    groups: [Option<Arc<wgpu::BindGroup>>; 3],
    raster: RasterDesc,
    blend: ResourceHandle,
    blend_factor: [f32; 4],
    depth_stencil: ResourceHandle,
    stencil_ref: u32,
    viewport: Option<Viewport>,
    scissor: Option<ScissorRect>,
    targets: Option<BoundTargets>,
}

impl DrawState {
    /// Unbinds `handle` from every slot it occupies.
    fn scrub(&mut self, handle: ResourceHandle) {
        for (group, slots) in [
            (GROUP_CONSTANTS, &mut self.constants),
            (GROUP_TEXTURES, &mut self.textures),
            (GROUP_SAMPLERS, &mut self.samplers),
        ] {
            for slot in slots.iter_mut().filter(|h| **h == handle) {
                *slot = ResourceHandle::NULL;
                self.groups[group as usize] = None;
            }
        }
        for binding in self.vertex_buffers.iter_mut().filter(|b| b.buffer == handle) {
            *binding = VertexBinding::default();
        }
        if self.index_buffer.is_some_and(|(h, _, _)| h == handle) {
            self.index_buffer = None;
        }
        for bound in [
            &mut self.vertex_shader,
            &mut self.pixel_shader,
            &mut self.input_layout,
            &mut self.blend,
            &mut self.depth_stencil,
        ] {
            if *bound == handle {
                *bound = ResourceHandle::NULL;
            }
        }
    }
}

struct Frame {
    encoder: wgpu::CommandEncoder,
    pass: Option<wgpu::RenderPass<'static>>,
    /// Occlusion query begun inside the open pass.
    pass_occlusion: Option<ResourceHandle>,
    backbuffer: Option<Acquired>,
    /// Acquisition failed; draws into the backbuffer are skipped until present.
    backbuffer_failed: bool,
    recovered: bool,
}

impl Frame {
    fn begin(device: &wgpu::Device, markers: &[String]) -> Self {
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("rhi frame"),
        });
        // Debug groups still open from the previous frame continue here.
        for label in markers {
            encoder.push_debug_group(label);
        }
        Self {
            encoder,
            pass: None,
            pass_occlusion: None,
            backbuffer: None,
            backbuffer_failed: false,
            recovered: false,
        }
    }
}

/// Reference backend on wgpu.
///
/// One command encoder per frame; render passes open lazily at the first
/// draw (or pending clear) and close whenever something must happen outside
/// a pass: target changes, clears, buffer updates, markers, queries and
/// present. Buffer updates go through a staging copy so they land in encode
/// order relative to the draws around them.
pub struct WgpuBackend {
    name: String,
    _instance: wgpu::Instance,
    adapter: wgpu::Adapter,
    device: wgpu::Device,
    queue: wgpu::Queue,
    features: wgpu::Features,
    lost: Arc<AtomicBool>,
    presenter: Presenter,
    layout: FixedLayout,
    defaults: Defaults,
    objects: SlotTable<Native>,
    pipelines: PipelineCache<Arc<wgpu::RenderPipeline>>,
    state: DrawState,
    frame: Option<Frame>,
    pending_clear: Option<ClearDesc>,
    pending_resize: Option<(u32, u32)>,
    markers: Vec<String>,
    active_occlusion: Option<ResourceHandle>,
    ended_queries: Vec<ResourceHandle>,
    frame_index: u64,
}

impl WgpuBackend {
    /// Renders into a window surface. Call on the render thread, typically
    /// from the factory passed to `RenderCommandQueue::start`.
    pub fn new(
        target: impl Into<wgpu::SurfaceTarget<'static>>,
        options: SurfaceOptions,
    ) -> BackendResult<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });
        let surface = instance
            .create_surface(target)
            .map_err(|e| BackendError::Init(format!("create surface: {e}")))?;
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: Some(&surface),
            force_fallback_adapter: false,
        }))
        .ok_or_else(|| BackendError::Init("no adapter can present to this surface".into()))?;
        let bundle = open_device(&adapter)?;
        let presenter = Presenter::window(surface, &adapter, &bundle.device, &options)?;
        Self::assemble(instance, adapter, bundle, presenter)
    }

    /// Renders into an offscreen backbuffer; `present` only submits.
    pub fn headless(width: u32, height: u32) -> BackendResult<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .ok_or_else(|| BackendError::Init("no GPU adapter available".into()))?;
        let bundle = open_device(&adapter)?;
        let presenter = Presenter::headless(&bundle.device, width, height, 1);
        Self::assemble(instance, adapter, bundle, presenter)
    }

    fn assemble(
        instance: wgpu::Instance,
        adapter: wgpu::Adapter,
        bundle: DeviceBundle,
        presenter: Presenter,
    ) -> BackendResult<Self> {
        let samples = presenter.sample_count();
        if !adapter
            .get_texture_format_features(presenter.format())
            .flags
            .sample_count_supported(samples)
        {
            return Err(BackendError::Init(format!(
                "{samples}x MSAA is not supported for {:?}",
                presenter.format()
            )));
        }
        let info = adapter.get_info();
        let name = format!("wgpu/{}", info.backend.to_str());
        tracing::info!(
            adapter = %info.name,
            backend = info.backend.to_str(),
            features = ?bundle.features,
            format = ?presenter.format(),
            samples,
            headless = presenter.is_headless(),
            "wgpu backend initialized"
        );
        Ok(Self {
            name,
            _instance: instance,
            layout: FixedLayout::new(&bundle.device),
            defaults: Defaults::new(&bundle.device),
            adapter,
            device: bundle.device,
            queue: bundle.queue,
            features: bundle.features,
            lost: bundle.lost,
            presenter,
            objects: SlotTable::new(),
            pipelines: PipelineCache::new(),
            state: DrawState::default(),
            frame: None,
            pending_clear: None,
            pending_resize: None,
            markers: Vec::new(),
            active_occlusion: None,
            ended_queries: Vec::new(),
            frame_index: 0,
        })
    }

    pub fn features(&self) -> wgpu::Features {
        self.features
    }

    pub fn pipeline_stats(&self) -> CacheStats {
        self.pipelines.stats()
    }

    fn pass_open(&self) -> bool {
        self.frame.as_ref().is_some_and(|f| f.pass.is_some())
    }

    fn encoder(&mut self) -> &mut wgpu::CommandEncoder {
        &mut self
            .frame
            .get_or_insert_with(|| Frame::begin(&self.device, &self.markers))
            .encoder
    }

    /// The backbuffer view for this frame, acquiring it on first use. `None`
    /// when the surface has no image this frame.
    fn backbuffer(&mut self) -> Option<Arc<wgpu::TextureView>> {
        let frame = self
            .frame
            .get_or_insert_with(|| Frame::begin(&self.device, &self.markers));
        if frame.backbuffer_failed {
            return None;
        }
        if frame.backbuffer.is_none() {
            match self.presenter.acquire(&self.device) {
                Ok(acquired) => {
                    frame.recovered |= acquired.recovered;
                    frame.backbuffer = Some(acquired);
                }
                Err(error) => {
                    tracing::warn!(%error, "no backbuffer this frame; skipping its passes");
                    frame.backbuffer_failed = true;
                    return None;
                }
            }
        }
        frame.backbuffer.as_ref().map(|b| b.view.clone())
    }

    /// Opens a render pass on the bound targets if none is open. Returns
    /// false when the pass cannot exist this frame (no backbuffer image).
    fn ensure_pass(&mut self) -> BackendResult<bool> {
        if self.pass_open() {
            return Ok(true);
        }
        let Some(bound) = self.state.targets.clone() else {
            return Err(BackendError::misuse("no render targets bound"));
        };
        let mut colors = Vec::with_capacity(bound.colors.len());
        for &handle in &bound.colors {
            if handle.is_null() {
                let Some(backbuffer) = self.backbuffer() else {
                    self.pending_clear = None;
                    return Ok(false);
                };
                match self.presenter.msaa_view() {
                    Some(msaa) => colors.push((msaa.clone(), Some(backbuffer))),
                    None => colors.push((backbuffer, None)),
                }
            } else {
                colors.push((self.objects.render_target(handle)?.view.clone(), None));
            }
        }
        let depth = if bound.depth.is_null() {
            None
        } else {
            let target = self.objects.render_target(bound.depth)?;
            Some((target.view.clone(), target.format))
        };
        let occlusion_set = match self.active_occlusion {
            Some(handle) => Some(&self.objects.query(handle)?.set),
            None => None,
        };

        let clear = self.pending_clear.take().unwrap_or_default();
        let color_attachments: Vec<_> = colors
            .iter()
            .map(|(view, resolve)| {
                Some(wgpu::RenderPassColorAttachment {
                    view: &**view,
                    resolve_target: resolve.as_deref(),
                    ops: wgpu::Operations {
                        load: match clear.color {
                            Some(rgba) => wgpu::LoadOp::Clear(conv::color(rgba)),
                            None => wgpu::LoadOp::Load,
                        },
                        store: wgpu::StoreOp::Store,
                    },
                })
            })
            .collect();
        let depth_attachment =
            depth
                .as_ref()
                .map(|(view, format)| wgpu::RenderPassDepthStencilAttachment {
                    view: &**view,
                    depth_ops: Some(wgpu::Operations {
                        load: clear.depth.map_or(wgpu::LoadOp::Load, wgpu::LoadOp::Clear),
                        store: wgpu::StoreOp::Store,
                    }),
                    stencil_ops: format.has_stencil_aspect().then(|| wgpu::Operations {
                        load: clear.stencil.map_or(wgpu::LoadOp::Load, wgpu::LoadOp::Clear),
                        store: wgpu::StoreOp::Store,
                    }),
                });

        let frame = self
            .frame
            .get_or_insert_with(|| Frame::begin(&self.device, &self.markers));
        let mut pass = frame
            .encoder
            .begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("rhi pass"),
                color_attachments: &color_attachments,
                depth_stencil_attachment: depth_attachment,
                timestamp_writes: None,
                occlusion_query_set: occlusion_set,
            })
            .forget_lifetime();
        pass.set_blend_constant(conv::color(self.state.blend_factor));
        pass.set_stencil_reference(self.state.stencil_ref);
        apply_viewport(&mut pass, &self.state, bound.size);
        apply_scissor(&mut pass, &self.state, bound.size);
        if occlusion_set.is_some() {
            pass.begin_occlusion_query(0);
        }
        frame.pass = Some(pass);
        frame.pass_occlusion = self.active_occlusion;
        Ok(true)
    }

    /// Closes the open pass. A clear still pending is applied first by
    /// opening a pass just for it.
    fn end_pass(&mut self) -> BackendResult {
        if self.pending_clear.is_some() && !self.pass_open() {
            if self.state.targets.is_some() {
                self.ensure_pass()?;
            } else {
                self.pending_clear = None;
            }
        }
        if let Some(frame) = self.frame.as_mut() {
            if let Some(mut pass) = frame.pass.take() {
                if frame.pass_occlusion.take().is_some() {
                    pass.end_occlusion_query();
                }
            }
        }
        Ok(())
    }

    fn build_group(&self, group: u32) -> BackendResult<wgpu::BindGroup> {
        let layout = &self.layout.groups[group as usize];
        let label = Some("rhi bindings");
        let bind_group = match group {
            GROUP_CONSTANTS => {
                let mut buffers = Vec::with_capacity(BINDINGS_PER_GROUP);
                for &handle in &self.state.constants {
                    buffers.push(if handle.is_null() {
                        &self.defaults.uniform
                    } else {
                        &*self.objects.buffer(handle)?.buffer
                    });
                }
                let entries: Vec<_> = buffers
                    .iter()
                    .enumerate()
                    .map(|(i, buffer)| wgpu::BindGroupEntry {
                        binding: i as u32,
                        resource: buffer.as_entire_binding(),
                    })
                    .collect();
                self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                    label,
                    layout,
                    entries: &entries,
                })
            }
            GROUP_TEXTURES => {
                let mut views = Vec::with_capacity(BINDINGS_PER_GROUP);
                for &handle in &self.state.textures {
                    views.push(match self.objects.get(handle) {
                        None => &self.defaults.texture_view,
                        Some(Native::Texture(texture)) => &*texture.view,
                        Some(Native::RenderTarget(target)) => &*target.view,
                        Some(other) => {
                            return Err(BackendError::misuse(format!(
                                "{handle} is a {:?}, not a texture",
                                other.kind()
                            )));
                        }
                    });
                }
                let entries: Vec<_> = views
                    .iter()
                    .enumerate()
                    .map(|(i, view)| wgpu::BindGroupEntry {
                        binding: i as u32,
                        resource: wgpu::BindingResource::TextureView(view),
                    })
                    .collect();
                self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                    label,
                    layout,
                    entries: &entries,
                })
            }
            _ => {
                let mut samplers = Vec::with_capacity(BINDINGS_PER_GROUP);
                for &handle in &self.state.samplers {
                    samplers.push(if handle.is_null() {
                        &self.defaults.sampler
                    } else {
                        &**self.objects.sampler(handle)?.1
                    });
                }
                let entries: Vec<_> = samplers
                    .iter()
                    .enumerate()
                    .map(|(i, sampler)| wgpu::BindGroupEntry {
                        binding: i as u32,
                        resource: wgpu::BindingResource::Sampler(sampler),
                    })
                    .collect();
                self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                    label,
                    layout,
                    entries: &entries,
                })
            }
        };
        Ok(bind_group)
    }

    fn bind_groups(&mut self) -> BackendResult<[Arc<wgpu::BindGroup>; 3]> {
        for group in [GROUP_CONSTANTS, GROUP_TEXTURES, GROUP_SAMPLERS] {
            if self.state.groups[group as usize].is_none() {
                let built = self.build_group(group)?;
                self.state.groups[group as usize] = Some(Arc::new(built));
            }
        }
        match &self.state.groups {
            [Some(constants), Some(textures), Some(samplers)] => {
                Ok([constants.clone(), textures.clone(), samplers.clone()])
            }
            _ => Err(BackendError::misuse("bind groups incomplete")),
        }
    }

    fn pipeline(
        &mut self,
        topology: PrimitiveTopology,
        strip_index: Option<IndexFormat>,
    ) -> BackendResult<Arc<wgpu::RenderPipeline>> {
        let Some(bound) = &self.state.targets else {
            return Err(BackendError::misuse("no render targets bound"));
        };
        let key = PipelineKey {
            vertex_shader: self.state.vertex_shader,
            pixel_shader: self.state.pixel_shader,
            input_layout: self.state.input_layout,
            blend: self.state.blend,
            depth_stencil: self.state.depth_stencil,
            raster: RasterKey::from(&self.state.raster),
            topology,
            strip_index,
            strides: std::array::from_fn(|i| self.state.vertex_buffers[i].stride),
            colors: bound.color_formats.clone(),
            depth: bound.depth_format,
            sample_count: bound.sample_count,
        };
        self.pipelines.get_or_try_insert(&key, || {
            tracing::debug!(?key, "building render pipeline");
            build_pipeline(
                &self.device,
                &self.layout,
                &self.objects,
                &self.state.raster,
                &key,
                self.features,
            )
            .map(Arc::new)
        })
    }

    /// Validates the draw state and records pipeline, bindings and buffers
    /// into the open pass. Returns false when the draw is skipped because the
    /// frame has no backbuffer.
    fn prepare_draw(&mut self, topology: PrimitiveTopology, indexed: bool) -> BackendResult<bool> {
        let Some(bound) = &self.state.targets else {
            return Err(BackendError::misuse("draw with no render targets bound"));
        };
        if let Some(&handle) = self.state.textures.iter().find(|h| bound.contains(**h)) {
            return Err(BackendError::misuse(format!(
                "{handle} is bound both as a texture and as a render target"
            )));
        }
        let strip_index = match (indexed, self.state.index_buffer) {
            (false, _) => None,
            (true, Some((_, format, _))) => Some(format),
            (true, None) => {
                return Err(BackendError::misuse("indexed draw without an index buffer"));
            }
        };
        if !self.state.input_layout.is_null() {
            let elements = self.objects.input_layout(self.state.input_layout)?;
            if let Some(element) = elements
                .iter()
                .find(|e| self.state.vertex_buffers[e.buffer_slot as usize].buffer.is_null())
            {
                return Err(BackendError::misuse(format!(
                    "input location {} reads vertex buffer slot {}, which is unbound",
                    element.location, element.buffer_slot
                )));
            }
        }

        let pipeline = self.pipeline(topology, strip_index)?;
        let groups = self.bind_groups()?;
        let mut vertex_buffers = Vec::new();
        for (slot, binding) in self.state.vertex_buffers.iter().enumerate() {
            if !binding.buffer.is_null() {
                let buffer = self.objects.buffer(binding.buffer)?.buffer.clone();
                vertex_buffers.push((slot as u32, buffer, binding.offset));
            }
        }
        let index_buffer = match self.state.index_buffer {
            Some((handle, format, offset)) if indexed => Some((
                self.objects.buffer(handle)?.buffer.clone(),
                conv::index_format(format),
                offset,
            )),
            _ => None,
        };

        if !self.ensure_pass()? {
            return Ok(false);
        }
        let Some(pass) = self.frame.as_mut().and_then(|f| f.pass.as_mut()) else {
            return Ok(false);
        };
        pass.set_pipeline(&pipeline);
        for (index, group) in groups.iter().enumerate() {
            pass.set_bind_group(index as u32, &**group, &[]);
        }
        for (slot, buffer, offset) in &vertex_buffers {
            pass.set_vertex_buffer(*slot, buffer.slice(*offset..));
        }
        if let Some((buffer, format, offset)) = &index_buffer {
            pass.set_index_buffer(buffer.slice(*offset..), *format);
        }
        Ok(true)
    }

    fn with_pass(
        &mut self,
        f: impl FnOnce(&mut wgpu::RenderPass<'static>, &DrawState, (u32, u32)),
    ) {
        let size = self.state.targets.as_ref().map_or((1, 1), |t| t.size);
        if let Some(pass) = self.frame.as_mut().and_then(|f| f.pass.as_mut()) {
            f(pass, &self.state, size);
        }
    }

    fn create_query_object(&self, kind: QueryKind) -> Result<QueryObject, String> {
        let needed =
            wgpu::Features::TIMESTAMP_QUERY | wgpu::Features::TIMESTAMP_QUERY_INSIDE_ENCODERS;
        if kind == QueryKind::Timestamp && !self.features.contains(needed) {
            return Err(
                "timestamp queries need TIMESTAMP_QUERY and TIMESTAMP_QUERY_INSIDE_ENCODERS".into(),
            );
        }
        let count = match kind {
            QueryKind::Occlusion => 1,
            QueryKind::Timestamp => 2,
        };
        scoped(&self.device, || QueryObject {
            kind,
            set: self.device.create_query_set(&wgpu::QuerySetDescriptor {
                label: Some("rhi query"),
                ty: match kind {
                    QueryKind::Occlusion => wgpu::QueryType::Occlusion,
                    QueryKind::Timestamp => wgpu::QueryType::Timestamp,
                },
                count,
            }),
            resolve: self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("rhi query resolve"),
                size: count as u64 * QUERY_RESULT_SIZE,
                usage: wgpu::BufferUsages::QUERY_RESOLVE | wgpu::BufferUsages::COPY_SRC,
                mapped_at_creation: false,
            }),
            readback: self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("rhi query readback"),
                size: count as u64 * QUERY_RESULT_SIZE,
                usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            }),
            state: QueryState::Idle,
        })
    }

    /// Maps the readback buffers of the queries ended this frame and turns
    /// their raw values into results: samples for occlusion, nanoseconds for
    /// timestamps.
    fn read_queries(&mut self, ended: Vec<ResourceHandle>) -> Vec<(ResourceHandle, u64)> {
        let (tx, rx) = crossbeam_channel::unbounded();
        for &handle in &ended {
            if let Ok(query) = self.objects.query(handle) {
                let tx = tx.clone();
                query
                    .readback
                    .slice(..)
                    .map_async(wgpu::MapMode::Read, move |result| {
                        let _ = tx.send((handle, result.is_ok()));
                    });
            }
        }
        drop(tx);
        let _ = self.device.poll(wgpu::Maintain::Wait);

        let period = self.queue.get_timestamp_period() as f64;
        let mut results = Vec::with_capacity(ended.len());
        for (handle, mapped) in rx.try_iter() {
            let Ok(query) = self.objects.query_mut(handle) else {
                continue;
            };
            query.state = QueryState::Idle;
            if !mapped {
                tracing::warn!(%handle, "query readback failed to map");
                continue;
            }
            let raw: Vec<u64> = {
                let bytes = query.readback.slice(..).get_mapped_range();
                bytes
                    .chunks_exact(QUERY_RESULT_SIZE as usize)
                    .map(bytemuck::pod_read_unaligned::<u64>)
                    .collect()
            };
            query.readback.unmap();
            let value = match (query.kind, raw.as_slice()) {
                (QueryKind::Occlusion, [samples, ..]) => *samples,
                (QueryKind::Timestamp, [begin, end, ..]) => {
                    (end.saturating_sub(*begin) as f64 * period) as u64
                }
                _ => continue,
            };
            results.push((handle, value));
        }
        results
    }

    /// Replaces the device after a loss and rebuilds every live object from
    /// its stored descriptor and initial data. Contents written later through
    /// `update_buffer` or render passes are gone.
    fn recover_device(&mut self) -> BackendResult {
        tracing::warn!(live = self.objects.len(), "rebuilding device after loss");
        let bundle = open_device(&self.adapter)
            .map_err(|e| BackendError::DeviceLost(format!("device recreation failed: {e}")))?;
        self.device = bundle.device;
        self.queue = bundle.queue;
        self.features = bundle.features;
        self.lost = bundle.lost;
        self.layout = FixedLayout::new(&self.device);
        self.defaults = Defaults::new(&self.device);
        self.presenter.reconfigure(&self.device);
        self.pipelines.clear();
        self.state.groups = Default::default();
        self.frame = None;
        self.active_occlusion = None;
        self.ended_queries.clear();

        let handles: Vec<ResourceHandle> = self.objects.iter().map(|(h, _)| h).collect();
        let mut failed = 0usize;
        for handle in handles {
            if let Err(error) = self.rebuild_object(handle) {
                failed += 1;
                tracing::error!(%handle, %error, "could not rebuild object after device loss");
            }
        }
        tracing::info!(failed, "device recovered");
        Ok(())
    }

    fn rebuild_object(&mut self, handle: ResourceHandle) -> BackendResult {
        let rebuilt = match self.objects.get(handle) {
            Some(Native::Buffer(object)) => {
                let buffer = self.make_buffer(handle, &object.desc, object.initial.as_deref())?;
                Some(Native::Buffer(BufferObject {
                    buffer: Arc::new(buffer),
                    desc: object.desc,
                    initial: object.initial.clone(),
                }))
            }
            Some(Native::Texture(object)) => {
                let texture = self.make_texture(handle, &object.desc, object.initial.as_deref())?;
                Some(Native::Texture(TextureObject {
                    view: Arc::new(texture.create_view(&Default::default())),
                    texture,
                    desc: object.desc,
                    initial: object.initial.clone(),
                }))
            }
            Some(Native::Sampler { desc, .. }) => Some(Native::Sampler {
                sampler: Arc::new(self.make_sampler(handle, desc)?),
                desc: *desc,
            }),
            Some(Native::Shader(object)) => Some(Native::Shader(ShaderObject {
                module: Arc::new(self.make_shader(handle, &object.desc)?),
                desc: object.desc.clone(),
            })),
            Some(Native::RenderTarget(object)) => {
                Some(Native::RenderTarget(self.make_render_target(handle, &object.desc)?))
            }
            Some(Native::Query(object)) => Some(Native::Query(
                self.create_query_object(object.kind)
                    .map_err(|reason| creation_failed(handle, reason))?,
            )),
            _ => None,
        };
        if let (Some(rebuilt), Some(slot)) = (rebuilt, self.objects.get_mut(handle)) {
            *slot = rebuilt;
        }
        Ok(())
    }

    fn make_buffer(
        &self,
        handle: ResourceHandle,
        desc: &BufferDesc,
        data: Option<&[u8]>,
    ) -> BackendResult<wgpu::Buffer> {
        if data.is_some_and(|d| d.len() as u64 > desc.size) {
            return Err(BackendError::misuse(format!(
                "initial data for {handle} is larger than the buffer"
            )));
        }
        let size = desc.size.next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT);
        scoped(&self.device, || {
            let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("rhi buffer"),
                size,
                usage: conv::buffer_usages(desc),
                mapped_at_creation: data.is_some(),
            });
            if let Some(data) = data {
                buffer.slice(..).get_mapped_range_mut()[..data.len()].copy_from_slice(data);
                buffer.unmap();
            }
            buffer
        })
        .map_err(|reason| creation_failed(handle, reason))
    }

    /// Initial data is mip-major: every layer (or depth slice) of level 0,
    /// then level 1, and so on. Levels the data does not fully cover are left
    /// uninitialized.
    fn make_texture(
        &self,
        handle: ResourceHandle,
        desc: &TextureDesc,
        data: Option<&[u8]>,
    ) -> BackendResult<wgpu::Texture> {
        let format = conv::texture_format(desc.format, self.features)?;
        if desc.format.is_compressed() && (desc.width % 4 != 0 || desc.height % 4 != 0) {
            return Err(BackendError::unsupported(format!(
                "{:?} textures need a size that is a multiple of 4, got {}x{}",
                desc.format, desc.width, desc.height
            )));
        }
        let size = wgpu::Extent3d {
            width: desc.width,
            height: desc.height,
            depth_or_array_layers: desc.depth_or_layers,
        };
        let texture = scoped(&self.device, || {
            self.device.create_texture(&wgpu::TextureDescriptor {
                label: Some("rhi texture"),
                size,
                mip_level_count: desc.mip_levels,
                sample_count: desc.sample_count,
                dimension: conv::texture_dimension(desc.dimension),
                format,
                usage: conv::texture_usages(desc.bind),
                view_formats: &[],
            })
        })
        .map_err(|reason| creation_failed(handle, reason))?;

        if let Some(data) = data {
            let block = desc.format.block_dim();
            let mut offset = 0usize;
            let mut uploaded = 0;
            for mip in 0..desc.mip_levels {
                let width = (desc.width >> mip).max(1);
                let height = (desc.height >> mip).max(1);
                let layers = match desc.dimension {
                    TextureDimension::D3 => (desc.depth_or_layers >> mip).max(1),
                    _ => desc.depth_or_layers,
                };
                let image = desc.format.image_size(width, height) as usize;
                let bytes = image * layers as usize;
                let Some(level) = data.get(offset..offset + bytes) else {
                    break;
                };
                let blocks_x = width.div_ceil(block);
                let blocks_y = height.div_ceil(block);
                self.queue.write_texture(
                    wgpu::TexelCopyTextureInfo {
                        texture: &texture,
                        mip_level: mip,
                        origin: wgpu::Origin3d::ZERO,
                        aspect: wgpu::TextureAspect::All,
                    },
                    level,
                    wgpu::TexelCopyBufferLayout {
                        offset: 0,
                        bytes_per_row: Some(blocks_x * desc.format.block_size()),
                        rows_per_image: Some(blocks_y),
                    },
                    wgpu::Extent3d {
                        width: blocks_x * block,
                        height: blocks_y * block,
                        depth_or_array_layers: layers,
                    },
                );
                offset += bytes;
                uploaded += 1;
            }
            tracing::trace!(%handle, uploaded, levels = desc.mip_levels, "texture data uploaded");
        }
        Ok(texture)
    }

    fn make_sampler(
        &self,
        handle: ResourceHandle,
        desc: &SamplerDesc,
    ) -> BackendResult<wgpu::Sampler> {
        let descriptor = conv::sampler(desc, self.features)?;
        scoped(&self.device, || self.device.create_sampler(&descriptor))
            .map_err(|reason| creation_failed(handle, reason))
    }

    fn make_shader(
        &self,
        handle: ResourceHandle,
        desc: &ShaderDesc,
    ) -> BackendResult<wgpu::ShaderModule> {
        let source = match desc.format {
            ShaderFormat::Wgsl => {
                let text = std::str::from_utf8(&desc.bytecode).map_err(|e| {
                    creation_failed(handle, format!("WGSL source is not UTF-8: {e}"))
                })?;
                wgpu::ShaderSource::Wgsl(text.into())
            }
            ShaderFormat::SpirV => {
                if desc.bytecode.len() % 4 != 0 {
                    return Err(creation_failed(
                        handle,
                        "SPIR-V length is not a whole number of words",
                    ));
                }
                let words: Vec<u32> = desc
                    .bytecode
                    .chunks_exact(4)
                    .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
                    .collect();
                wgpu::ShaderSource::SpirV(words.into())
            }
        };
        scoped(&self.device, || {
            self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("rhi shader"),
                source,
            })
        })
        .map_err(|reason| creation_failed(handle, reason))
    }

    fn make_render_target(
        &self,
        handle: ResourceHandle,
        desc: &RenderTargetDesc,
    ) -> BackendResult<RenderTargetObject> {
        let format = conv::texture_format(desc.format, self.features)?;
        let mut usage = wgpu::TextureUsages::RENDER_ATTACHMENT;
        if desc.shader_visible {
            usage |= wgpu::TextureUsages::TEXTURE_BINDING;
        }
        let texture = scoped(&self.device, || {
            self.device.create_texture(&wgpu::TextureDescriptor {
                label: Some("rhi render target"),
                size: wgpu::Extent3d {
                    width: desc.width,
                    height: desc.height,
                    depth_or_array_layers: 1,
                },
                mip_level_count: 1,
                sample_count: desc.sample_count,
                dimension: wgpu::TextureDimension::D2,
                format,
                usage,
                view_formats: &[],
            })
        })
        .map_err(|reason| creation_failed(handle, reason))?;
        Ok(RenderTargetObject {
            desc: *desc,
            format,
            view: Arc::new(texture.create_view(&Default::default())),
            texture,
        })
    }

    fn check_stage_slot(slot: u32) -> BackendResult {
        if slot as usize >= MAX_STAGE_SLOTS {
            return Err(BackendError::misuse(format!(
                "stage slot {slot} out of range (max {MAX_STAGE_SLOTS})"
            )));
        }
        Ok(())
    }

    fn check_sampleable(
        &self,
        handle: ResourceHandle,
        format: TextureFormat,
        samples: u32,
        flat_2d: bool,
    ) -> BackendResult {
        let reason = if format.is_depth() {
            "depth formats cannot be sampled through the float texture bindings"
        } else if format == TextureFormat::R32Uint {
            "integer formats cannot be sampled through the float texture bindings"
        } else if matches!(
            format,
            TextureFormat::R32Float | TextureFormat::Rg32Float | TextureFormat::Rgba32Float
        ) && !self.features.contains(wgpu::Features::FLOAT32_FILTERABLE)
        {
            "32-bit float textures are not filterable on this device"
        } else if samples > 1 {
            "multisampled textures cannot be bound as textures"
        } else if !flat_2d {
            "only single-layer 2D textures can be bound"
        } else {
            return Ok(());
        };
        Err(BackendError::unsupported(format!("{handle}: {reason}")))
    }

    fn set_bound(&mut self, group: u32, stage: ShaderStage, slot: u32, handle: ResourceHandle) {
        let index = binding_index(stage, slot);
        let slots = match group {
            GROUP_CONSTANTS => &mut self.state.constants,
            GROUP_TEXTURES => &mut self.state.textures,
            _ => &mut self.state.samplers,
        };
        if slots[index] != handle {
            slots[index] = handle;
            self.state.groups[group as usize] = None;
        }
    }
}

fn apply_viewport(pass: &mut wgpu::RenderPass<'static>, state: &DrawState, size: (u32, u32)) {
    let Some(vp) = state.viewport else {
        return;
    };
    let fits = vp.x >= 0.0
        && vp.y >= 0.0
        && vp.width > 0.0
        && vp.height > 0.0
        && vp.x + vp.width <= size.0 as f32
        && vp.y + vp.height <= size.1 as f32;
    if fits {
        pass.set_viewport(vp.x, vp.y, vp.width, vp.height, vp.min_depth, vp.max_depth);
    } else {
        tracing::warn!(?vp, ?size, "viewport exceeds the bound targets; using the full target");
    }
}

fn apply_scissor(pass: &mut wgpu::RenderPass<'static>, state: &DrawState, size: (u32, u32)) {
    let (x, y, width, height) = match state.scissor {
        Some(rect) if state.raster.scissor_enable => {
            // Clipping against the target is what the rasterizer does anyway.
            let x = rect.x.min(size.0);
            let y = rect.y.min(size.1);
            (x, y, rect.width.min(size.0 - x), rect.height.min(size.1 - y))
        }
        _ => (0, 0, size.0, size.1),
    };
    pass.set_scissor_rect(x, y, width, height);
}

fn build_pipeline(
    device: &wgpu::Device,
    layout: &FixedLayout,
    objects: &SlotTable<Native>,
    raster: &RasterDesc,
    key: &PipelineKey,
    features: wgpu::Features,
) -> BackendResult<wgpu::RenderPipeline> {
    if key.vertex_shader.is_null() {
        return Err(BackendError::misuse("draw without a vertex shader"));
    }
    let vertex = objects.shader(key.vertex_shader)?;
    let pixel = if key.pixel_shader.is_null() {
        None
    } else {
        Some(objects.shader(key.pixel_shader)?)
    };
    if pixel.is_none() && !key.colors.is_empty() {
        return Err(BackendError::misuse(
            "draw into color targets without a pixel shader",
        ));
    }

    let elements: &[InputElement] = if key.input_layout.is_null() {
        &[]
    } else {
        objects.input_layout(key.input_layout)?
    };
    let slot_count = elements
        .iter()
        .map(|e| e.buffer_slot as usize + 1)
        .max()
        .unwrap_or(0);
    let mut attributes = vec![Vec::new(); slot_count];
    let mut step_modes = vec![None; slot_count];
    for element in elements {
        let slot = element.buffer_slot as usize;
        let mode = conv::step_mode(element.rate);
        match step_modes[slot] {
            Some(existing) if existing != mode => {
                return Err(BackendError::unsupported(format!(
                    "vertex buffer slot {slot} mixes per-vertex and per-instance elements"
                )));
            }
            _ => step_modes[slot] = Some(mode),
        }
        attributes[slot].push(wgpu::VertexAttribute {
            format: conv::vertex_format(element.format),
            offset: element.offset as u64,
            shader_location: element.location,
        });
    }
    let buffers: Vec<_> = attributes
        .iter()
        .enumerate()
        .map(|(slot, attributes)| wgpu::VertexBufferLayout {
            array_stride: key.strides[slot] as u64,
            step_mode: step_modes[slot].unwrap_or(wgpu::VertexStepMode::Vertex),
            attributes,
        })
        .collect();

    let blend = if key.blend.is_null() {
        BlendDesc::default()
    } else {
        objects.blend_state(key.blend)?.clone()
    };
    let mut targets = Vec::with_capacity(key.colors.len());
    for (i, format) in key.colors.iter().enumerate() {
        let index = if blend.independent { i } else { 0 };
        let desc = blend.targets.get(index).copied().unwrap_or_default();
        targets.push(Some(conv::color_target(&desc, *format)?));
    }

    let depth_stencil = match key.depth {
        Some(format) => {
            let desc = if key.depth_stencil.is_null() {
                DepthStencilDesc::default()
            } else {
                *objects.depth_stencil_state(key.depth_stencil)?
            };
            if desc.stencil_enable && !format.has_stencil_aspect() {
                return Err(BackendError::misuse(
                    "stencil enabled with a depth target that has no stencil",
                ));
            }
            Some(conv::depth_stencil(&desc, raster, format))
        }
        None => None,
    };
    let primitive = conv::primitive(raster, key.topology, key.strip_index, features)?;

    let vertex_entry = &*vertex.desc.entry_point;
    let pixel_entry = pixel.map(|p| &*p.desc.entry_point);
    scoped(device, || {
        device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("rhi pipeline"),
            layout: Some(&layout.pipeline),
            vertex: wgpu::VertexState {
                module: &vertex.module,
                entry_point: Some(vertex_entry),
                compilation_options: Default::default(),
                buffers: &buffers,
            },
            fragment: pixel.map(|p| wgpu::FragmentState {
                module: &p.module,
                entry_point: pixel_entry,
                compilation_options: Default::default(),
                targets: &targets,
            }),
            primitive,
            depth_stencil,
            multisample: wgpu::MultisampleState {
                count: key.sample_count,
                mask: !0,
                alpha_to_coverage_enabled: blend.alpha_to_coverage,
            },
            multiview: None,
            cache: None,
        })
    })
    .map_err(|reason| BackendError::misuse(format!("pipeline rejected: {reason}")))
}

impl Backend for WgpuBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn clear(&mut self, desc: &ClearDesc) -> BackendResult {
        if self.state.targets.is_none() {
            return Err(BackendError::misuse("clear with no render targets bound"));
        }
        if self.pass_open() {
            self.end_pass()?;
        }
        let pending = self.pending_clear.get_or_insert_with(ClearDesc::default);
        pending.color = desc.color.or(pending.color);
        pending.depth = desc.depth.or(pending.depth);
        pending.stencil = desc.stencil.or(pending.stencil);
        Ok(())
    }

    fn create_shader(&mut self, handle: ResourceHandle, desc: &ShaderDesc) -> BackendResult {
        let module = self.make_shader(handle, desc)?;
        self.objects.insert(
            handle,
            Native::Shader(ShaderObject {
                desc: desc.clone(),
                module: Arc::new(module),
            }),
        )
    }

    fn create_input_layout(
        &mut self,
        handle: ResourceHandle,
        elements: &[InputElement],
    ) -> BackendResult {
        if let Some(e) = elements
            .iter()
            .find(|e| e.buffer_slot as usize >= MAX_VERTEX_BUFFERS)
        {
            return Err(BackendError::misuse(format!(
                "input element reads vertex buffer slot {} (max {MAX_VERTEX_BUFFERS})",
                e.buffer_slot
            )));
        }
        self.objects
            .insert(handle, Native::InputLayout(elements.into()))
    }

    fn create_buffer(
        &mut self,
        handle: ResourceHandle,
        desc: &BufferDesc,
        data: Option<&[u8]>,
    ) -> BackendResult {
        let buffer = self.make_buffer(handle, desc, data)?;
        self.objects.insert(
            handle,
            Native::Buffer(BufferObject {
                desc: *desc,
                initial: data.map(Into::into),
                buffer: Arc::new(buffer),
            }),
        )
    }

    fn update_buffer(&mut self, handle: ResourceHandle, offset: u64, data: &[u8]) -> BackendResult {
        let object = self.objects.buffer(handle)?;
        if object.desc.usage == Usage::Immutable {
            return Err(BackendError::misuse(format!("{handle} is immutable")));
        }
        let end = offset + data.len() as u64;
        if end > object.desc.size {
            return Err(BackendError::misuse(format!(
                "update of {handle} ends at byte {end}, buffer holds {}",
                object.desc.size
            )));
        }
        if offset % wgpu::COPY_BUFFER_ALIGNMENT != 0
            || data.len() as u64 % wgpu::COPY_BUFFER_ALIGNMENT != 0
        {
            return Err(BackendError::unsupported(
                "buffer updates need 4-byte aligned offsets and sizes",
            ));
        }
        let target = object.buffer.clone();
        self.end_pass()?;
        let staging = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("rhi staging"),
                contents: data,
                usage: wgpu::BufferUsages::COPY_SRC,
            });
        self.encoder()
            .copy_buffer_to_buffer(&staging, 0, &target, offset, data.len() as u64);
        Ok(())
    }

    fn create_texture(
        &mut self,
        handle: ResourceHandle,
        desc: &TextureDesc,
        data: Option<&[u8]>,
    ) -> BackendResult {
        let texture = self.make_texture(handle, desc, data)?;
        self.objects.insert(
            handle,
            Native::Texture(TextureObject {
                desc: *desc,
                initial: data.map(Into::into),
                view: Arc::new(texture.create_view(&Default::default())),
                texture,
            }),
        )
    }

    fn create_sampler(&mut self, handle: ResourceHandle, desc: &SamplerDesc) -> BackendResult {
        let sampler = self.make_sampler(handle, desc)?;
        self.objects.insert(
            handle,
            Native::Sampler {
                desc: *desc,
                sampler: Arc::new(sampler),
            },
        )
    }

    fn create_blend_state(&mut self, handle: ResourceHandle, desc: &BlendDesc) -> BackendResult {
        self.objects.insert(handle, Native::BlendState(desc.clone()))
    }

    fn create_depth_stencil_state(
        &mut self,
        handle: ResourceHandle,
        desc: &DepthStencilDesc,
    ) -> BackendResult {
        self.objects.insert(handle, Native::DepthStencilState(*desc))
    }

    fn create_render_target(
        &mut self,
        handle: ResourceHandle,
        desc: &RenderTargetDesc,
    ) -> BackendResult {
        let target = self.make_render_target(handle, desc)?;
        self.objects.insert(handle, Native::RenderTarget(target))
    }

    fn create_query(&mut self, handle: ResourceHandle, kind: QueryKind) -> BackendResult {
        let query = self
            .create_query_object(kind)
            .map_err(|reason| creation_failed(handle, reason))?;
        self.objects.insert(handle, Native::Query(query))
    }

    fn set_shader(&mut self, stage: ShaderStage, handle: ResourceHandle) -> BackendResult {
        if !handle.is_null() {
            let shader = self.objects.shader(handle)?;
            if shader.desc.stage != stage {
                return Err(BackendError::misuse(format!(
                    "{handle} is a {:?} shader, bound as {stage:?}",
                    shader.desc.stage
                )));
            }
        }
        match stage {
            ShaderStage::Vertex => self.state.vertex_shader = handle,
            ShaderStage::Pixel => self.state.pixel_shader = handle,
        }
        Ok(())
    }

    fn set_input_layout(&mut self, handle: ResourceHandle) -> BackendResult {
        if !handle.is_null() {
            self.objects.input_layout(handle)?;
        }
        self.state.input_layout = handle;
        Ok(())
    }

    fn set_vertex_buffer(
        &mut self,
        slot: u32,
        handle: ResourceHandle,
        stride: u32,
        offset: u64,
    ) -> BackendResult {
        if slot as usize >= MAX_VERTEX_BUFFERS {
            return Err(BackendError::misuse(format!("vertex buffer slot {slot} out of range")));
        }
        if !handle.is_null() {
            let buffer = self.objects.buffer(handle)?;
            if !buffer.desc.bind.contains(BindFlags::VERTEX_BUFFER) {
                return Err(BackendError::misuse(format!("{handle} is not a vertex buffer")));
            }
            if offset > buffer.desc.size {
                return Err(BackendError::misuse(format!(
                    "offset {offset} past the end of {handle}"
                )));
            }
        }
        self.state.vertex_buffers[slot as usize] = VertexBinding {
            buffer: handle,
            stride,
            offset,
        };
        Ok(())
    }

    fn set_index_buffer(
        &mut self,
        handle: ResourceHandle,
        format: IndexFormat,
        offset: u64,
    ) -> BackendResult {
        if handle.is_null() {
            self.state.index_buffer = None;
            return Ok(());
        }
        let buffer = self.objects.buffer(handle)?;
        if !buffer.desc.bind.contains(BindFlags::INDEX_BUFFER) {
            return Err(BackendError::misuse(format!("{handle} is not an index buffer")));
        }
        if offset % format.size() as u64 != 0 || offset > buffer.desc.size {
            return Err(BackendError::misuse(format!(
                "index buffer offset {offset} is misaligned or out of range"
            )));
        }
        self.state.index_buffer = Some((handle, format, offset));
        Ok(())
    }

    fn set_constant_buffer(
        &mut self,
        stage: ShaderStage,
        slot: u32,
        handle: ResourceHandle,
    ) -> BackendResult {
        Self::check_stage_slot(slot)?;
        if !handle.is_null() {
            let buffer = self.objects.buffer(handle)?;
            if !buffer.desc.bind.contains(BindFlags::CONSTANT_BUFFER) {
                return Err(BackendError::misuse(format!("{handle} is not a constant buffer")));
            }
        }
        self.set_bound(GROUP_CONSTANTS, stage, slot, handle);
        Ok(())
    }

    fn set_texture(
        &mut self,
        stage: ShaderStage,
        slot: u32,
        handle: ResourceHandle,
    ) -> BackendResult {
        Self::check_stage_slot(slot)?;
        match self.objects.get(handle) {
            None if handle.is_null() => {}
            Some(Native::Texture(texture)) => {
                let desc = texture.desc;
                let flat = desc.dimension == TextureDimension::D2 && desc.depth_or_layers == 1;
                self.check_sampleable(handle, desc.format, desc.sample_count, flat)?;
            }
            Some(Native::RenderTarget(target)) => {
                let desc = target.desc;
                if !desc.shader_visible {
                    return Err(BackendError::misuse(format!(
                        "{handle} was not created shader-visible"
                    )));
                }
                self.check_sampleable(handle, desc.format, desc.sample_count, true)?;
            }
            Some(other) => {
                return Err(BackendError::misuse(format!(
                    "{handle} holds a {:?}, not a texture",
                    other.kind()
                )));
            }
            None => return Err(BackendError::misuse(format!("{handle} is empty"))),
        }
        self.set_bound(GROUP_TEXTURES, stage, slot, handle);
        Ok(())
    }

    fn set_sampler(
        &mut self,
        stage: ShaderStage,
        slot: u32,
        handle: ResourceHandle,
    ) -> BackendResult {
        Self::check_stage_slot(slot)?;
        if !handle.is_null() {
            let (desc, _) = self.objects.sampler(handle)?;
            if desc.compare.is_some() {
                return Err(BackendError::unsupported(format!(
                    "{handle} is a comparison sampler; the sampler bindings are filtering only"
                )));
            }
        }
        self.set_bound(GROUP_SAMPLERS, stage, slot, handle);
        Ok(())
    }

    fn set_raster_state(&mut self, desc: &RasterDesc) -> BackendResult {
        let scissor_changed = desc.scissor_enable != self.state.raster.scissor_enable;
        self.state.raster = *desc;
        if scissor_changed {
            self.with_pass(apply_scissor);
        }
        Ok(())
    }

    fn set_blend_state(&mut self, handle: ResourceHandle, blend_factor: [f32; 4]) -> BackendResult {
        if !handle.is_null() {
            self.objects.blend_state(handle)?;
        }
        self.state.blend = handle;
        self.state.blend_factor = blend_factor;
        self.with_pass(|pass, state, _| pass.set_blend_constant(conv::color(state.blend_factor)));
        Ok(())
    }

    fn set_depth_stencil_state(
        &mut self,
        handle: ResourceHandle,
        stencil_ref: u32,
    ) -> BackendResult {
        if !handle.is_null() {
            self.objects.depth_stencil_state(handle)?;
        }
        self.state.depth_stencil = handle;
        self.state.stencil_ref = stencil_ref;
        self.with_pass(|pass, state, _| pass.set_stencil_reference(state.stencil_ref));
        Ok(())
    }

    fn set_targets(&mut self, colors: &[ResourceHandle], depth: ResourceHandle) -> BackendResult {
        self.end_pass()?;
        self.state.targets = None;
        if colors.is_empty() && depth.is_null() {
            return Ok(());
        }
        let mut color_formats = Vec::with_capacity(colors.len());
        let mut shapes = Vec::with_capacity(colors.len() + 1);
        for &handle in colors {
            if handle.is_null() {
                color_formats.push(self.presenter.format());
                shapes.push((self.presenter.size(), self.presenter.sample_count()));
            } else {
                let target = self.objects.render_target(handle)?;
                if target.desc.format.is_depth() {
                    return Err(BackendError::misuse(format!(
                        "{handle} is a depth target bound as color"
                    )));
                }
                color_formats.push(target.format);
                shapes.push(((target.desc.width, target.desc.height), target.desc.sample_count));
            }
        }
        let depth_format = if depth.is_null() {
            None
        } else {
            let target = self.objects.render_target(depth)?;
            if !target.desc.format.is_depth() {
                return Err(BackendError::misuse(format!(
                    "{depth} is a color target bound as depth"
                )));
            }
            shapes.push(((target.desc.width, target.desc.height), target.desc.sample_count));
            Some(target.format)
        };
        let (size, sample_count) = shapes[0];
        if shapes.iter().any(|s| *s != (size, sample_count)) {
            return Err(BackendError::misuse(
                "bound targets differ in size or sample count",
            ));
        }
        self.state.targets = Some(BoundTargets {
            colors: colors.to_vec(),
            depth,
            color_formats,
            depth_format,
            sample_count,
            size,
        });
        Ok(())
    }

    fn set_viewport(&mut self, viewport: &Viewport) -> BackendResult {
        self.state.viewport = Some(*viewport);
        self.with_pass(apply_viewport);
        Ok(())
    }

    fn set_scissor(&mut self, rect: &ScissorRect) -> BackendResult {
        self.state.scissor = Some(*rect);
        self.with_pass(apply_scissor);
        Ok(())
    }

    fn draw(
        &mut self,
        vertex_count: u32,
        start_vertex: u32,
        topology: PrimitiveTopology,
    ) -> BackendResult {
        if self.prepare_draw(topology, false)? {
            self.with_pass(|pass, _, _| {
                pass.draw(start_vertex..start_vertex + vertex_count, 0..1);
            });
        }
        Ok(())
    }

    fn draw_indexed(
        &mut self,
        index_count: u32,
        start_index: u32,
        base_vertex: i32,
        topology: PrimitiveTopology,
    ) -> BackendResult {
        if self.prepare_draw(topology, true)? {
            self.with_pass(|pass, _, _| {
                pass.draw_indexed(start_index..start_index + index_count, base_vertex, 0..1);
            });
        }
        Ok(())
    }

    fn draw_instanced(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        start_vertex: u32,
        start_instance: u32,
        topology: PrimitiveTopology,
    ) -> BackendResult {
        if self.prepare_draw(topology, false)? {
            self.with_pass(|pass, _, _| {
                pass.draw(
                    start_vertex..start_vertex + vertex_count,
                    start_instance..start_instance + instance_count,
                );
            });
        }
        Ok(())
    }

    fn begin_query(&mut self, handle: ResourceHandle) -> BackendResult {
        let query = self.objects.query(handle)?;
        if query.state == QueryState::Active {
            return Err(BackendError::misuse(format!("{handle} is already active")));
        }
        let kind = query.kind;
        if kind == QueryKind::Occlusion && self.active_occlusion.is_some() {
            return Err(BackendError::misuse(
                "only one occlusion query may be active at a time",
            ));
        }
        self.end_pass()?;
        self.ended_queries.retain(|h| *h != handle);
        match kind {
            QueryKind::Occlusion => self.active_occlusion = Some(handle),
            QueryKind::Timestamp => {
                let frame = self
                    .frame
                    .get_or_insert_with(|| Frame::begin(&self.device, &self.markers));
                frame.encoder.write_timestamp(&self.objects.query(handle)?.set, 0);
            }
        }
        self.objects.query_mut(handle)?.state = QueryState::Active;
        Ok(())
    }

    fn end_query(&mut self, handle: ResourceHandle) -> BackendResult {
        let query = self.objects.query(handle)?;
        if query.state != QueryState::Active {
            return Err(BackendError::misuse(format!("{handle} was not begun")));
        }
        let kind = query.kind;
        self.end_pass()?;
        match kind {
            QueryKind::Occlusion => self.active_occlusion = None,
            QueryKind::Timestamp => {
                let frame = self
                    .frame
                    .get_or_insert_with(|| Frame::begin(&self.device, &self.markers));
                frame.encoder.write_timestamp(&self.objects.query(handle)?.set, 1);
            }
        }
        self.objects.query_mut(handle)?.state = QueryState::Ended;
        self.ended_queries.push(handle);
        Ok(())
    }

    fn push_marker(&mut self, label: &str) -> BackendResult {
        self.end_pass()?;
        self.encoder().push_debug_group(label);
        self.markers.push(label.to_owned());
        Ok(())
    }

    fn pop_marker(&mut self) -> BackendResult {
        if self.markers.is_empty() {
            return Err(BackendError::misuse("pop_marker without a matching push"));
        }
        self.end_pass()?;
        self.encoder().pop_debug_group();
        self.markers.pop();
        Ok(())
    }

    fn resize(&mut self, width: u32, height: u32) -> BackendResult {
        if width == 0 || height == 0 {
            return Err(BackendError::misuse("resize to an empty backbuffer"));
        }
        self.pending_resize = Some((width, height));
        Ok(())
    }

    fn present(&mut self) -> BackendResult<PresentReport> {
        self.end_pass()?;
        let mut frame = match self.frame.take() {
            Some(frame) => frame,
            None => Frame::begin(&self.device, &self.markers),
        };
        // Debug groups must balance within one submission; they reopen on
        // the next frame.
        for _ in &self.markers {
            frame.encoder.pop_debug_group();
        }
        let ended = std::mem::take(&mut self.ended_queries);
        for &handle in &ended {
            let query = self.objects.query(handle)?;
            let count = query.count();
            frame
                .encoder
                .resolve_query_set(&query.set, 0..count, &query.resolve, 0);
            frame.encoder.copy_buffer_to_buffer(
                &query.resolve,
                0,
                &query.readback,
                0,
                count as u64 * QUERY_RESULT_SIZE,
            );
        }
        self.queue.submit([frame.encoder.finish()]);
        let mut recovered = frame.recovered;
        if let Some(backbuffer) = frame.backbuffer {
            backbuffer.present();
        }
        let query_results = if ended.is_empty() {
            Vec::new()
        } else {
            self.read_queries(ended)
        };

        self.state.targets = None;
        if let Some((width, height)) = self.pending_resize.take() {
            self.presenter.resize(&self.device, width, height);
        }
        if self.lost.load(Ordering::Acquire) {
            self.recover_device()?;
            recovered = true;
        }
        self.frame_index += 1;
        Ok(PresentReport {
            frame: self.frame_index,
            query_results,
            recovered,
            size: self.presenter.size(),
        })
    }

    fn release(&mut self, kind: ResourceKind, handle: ResourceHandle) -> BackendResult {
        if self
            .state
            .targets
            .as_ref()
            .is_some_and(|t| t.contains(handle))
        {
            self.end_pass()?;
            self.state.targets = None;
        }
        if self.active_occlusion == Some(handle) {
            self.end_pass()?;
            self.active_occlusion = None;
        }
        self.objects.release(kind, handle)?;
        self.ended_queries.retain(|h| *h != handle);
        self.state.scrub(handle);
        let evicted = self.pipelines.evict(handle);
        tracing::trace!(%handle, ?kind, evicted, "released");
        Ok(())
    }

    fn shutdown(&mut self) {
        if let Err(error) = self.end_pass() {
            tracing::warn!(%error, "could not close the last pass");
        }
        if let Some(frame) = self.frame.take() {
            self.queue.submit([frame.encoder.finish()]);
        }
        let _ = self.device.poll(wgpu::Maintain::Wait);
        let stats = self.pipelines.stats();
        tracing::info!(
            live_objects = self.objects.len(),
            pipelines = self.pipelines.len(),
            hits = stats.hits,
            misses = stats.misses,
            "wgpu backend shut down"
        );
    }
}
