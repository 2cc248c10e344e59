//! The deferred API: one method per recorded operation.
//!
//! Handles are allocated optimistically. A resource-creating call returns its
//! handle immediately and the handle may be used in the calls that follow,
//! but the native object only exists once the render thread replayed the
//! create record. Argument misuse is caught here with assertions, on the
//! thread that made the mistake.

use rhi_common::*;
use rhi_render::Command;
use std::sync::atomic::Ordering;

use crate::queue::RenderCommandQueue;

const BUFFER_KINDS: &[ResourceKind] = &[ResourceKind::Buffer];
const SAMPLEABLE_KINDS: &[ResourceKind] = &[ResourceKind::Texture, ResourceKind::RenderTarget];

impl RenderCommandQueue {
    /// Appends one record. Publishing `put` is the last visible effect.
    fn push(&mut self, command: Command) {
        let capacity = self.ring.capacity();
        let pending = self.shared.pending.fetch_add(1, Ordering::AcqRel);
        assert!(
            pending < capacity,
            "command ring overflow: {pending} records pending, capacity {capacity}; flush more often or raise ring_capacity"
        );
        if let Err(rejected) = self.ring.try_push(command) {
            panic!(
                "command ring overflow: render thread has not consumed {capacity} records (next: {:?})",
                rejected.opcode()
            );
        }
    }

    fn allocate(&mut self, kind: ResourceKind) -> ResourceHandle {
        match self.slots.allocate(kind) {
            Ok(handle) => handle,
            Err(err) => panic!("{err}"),
        }
    }

    /// `NULL` is accepted and means "unbind".
    fn check_bindable(&self, handle: ResourceHandle, accepted: &[ResourceKind], call: &str) {
        if !handle.is_null() {
            self.check_live(handle, accepted, call);
        }
    }

    fn check_live(&self, handle: ResourceHandle, accepted: &[ResourceKind], call: &str) {
        let kind = self.slots.kind_of(handle);
        assert!(
            kind.is_some_and(|k| accepted.contains(&k)),
            "{call}: {handle} holds {kind:?}, expected one of {accepted:?}"
        );
    }

    fn check_stage_slot(slot: u32, call: &str) {
        assert!(
            (slot as usize) < MAX_STAGE_SLOTS,
            "{call}: slot {slot} out of range (max {MAX_STAGE_SLOTS})"
        );
    }

    // ---- resource creation ----

    pub fn load_shader(&mut self, source: &ShaderSource<'_>) -> ResourceHandle {
        assert!(!source.bytecode.is_empty(), "load_shader: empty bytecode");
        assert!(!source.entry_point.is_empty(), "load_shader: empty entry point");
        if source.format == ShaderFormat::SpirV {
            assert!(
                source.bytecode.len() % 4 == 0,
                "load_shader: SPIR-V length {} is not a multiple of 4",
                source.bytecode.len()
            );
        }
        let handle = self.allocate(ResourceKind::Shader);
        self.push(Command::CreateShader {
            handle,
            desc: Box::new(source.to_desc()),
        });
        handle
    }

    pub fn create_input_layout(&mut self, elements: &[InputElement]) -> ResourceHandle {
        assert!(!elements.is_empty(), "create_input_layout: no elements");
        for element in elements {
            assert!(
                (element.buffer_slot as usize) < MAX_VERTEX_BUFFERS,
                "create_input_layout: buffer slot {} out of range",
                element.buffer_slot
            );
        }
        let handle = self.allocate(ResourceKind::InputLayout);
        self.push(Command::CreateInputLayout {
            handle,
            elements: elements.into(),
        });
        handle
    }

    pub fn create_buffer(&mut self, desc: &BufferDesc, data: Option<&[u8]>) -> ResourceHandle {
        assert!(desc.size > 0, "create_buffer: zero-sized buffer");
        if let Some(data) = data {
            assert!(
                data.len() as u64 <= desc.size,
                "create_buffer: {} bytes of initial data for a {}-byte buffer",
                data.len(),
                desc.size
            );
        }
        assert!(
            desc.usage != Usage::Immutable || data.is_some(),
            "create_buffer: immutable buffer without initial data"
        );
        let handle = self.allocate(ResourceKind::Buffer);
        self.push(Command::CreateBuffer {
            handle,
            desc: *desc,
            data: data.map(Into::into),
        });
        handle
    }

    /// `mip_levels == 0` requests a full chain; `sample_count == 0` means 1.
    pub fn create_texture(&mut self, desc: &TextureDesc, data: Option<&[u8]>) -> ResourceHandle {
        assert!(
            desc.width >= 1 && desc.height >= 1 && desc.depth_or_layers >= 1,
            "create_texture: degenerate size {}x{}x{}",
            desc.width,
            desc.height,
            desc.depth_or_layers
        );
        let mut desc = *desc;
        if desc.mip_levels == 0 {
            desc.mip_levels = desc.full_mip_chain();
        }
        if desc.sample_count == 0 {
            desc.sample_count = 1;
        }
        if let Some(data) = data {
            let top_level =
                desc.format.image_size(desc.width, desc.height) * desc.depth_or_layers as u64;
            assert!(
                data.len() as u64 >= top_level,
                "create_texture: {} bytes of initial data, top level needs {top_level}",
                data.len()
            );
        }
        let handle = self.allocate(ResourceKind::Texture);
        self.push(Command::CreateTexture {
            handle,
            desc: Box::new(desc),
            data: data.map(Into::into),
        });
        handle
    }

    pub fn create_sampler(&mut self, desc: &SamplerDesc) -> ResourceHandle {
        let handle = self.allocate(ResourceKind::Sampler);
        self.push(Command::CreateSampler {
            handle,
            desc: Box::new(*desc),
        });
        handle
    }

    pub fn create_blend_state(&mut self, desc: &BlendDesc) -> ResourceHandle {
        assert!(
            desc.targets.len() <= MAX_COLOR_TARGETS,
            "create_blend_state: {} targets (max {MAX_COLOR_TARGETS})",
            desc.targets.len()
        );
        let handle = self.allocate(ResourceKind::BlendState);
        self.push(Command::CreateBlendState {
            handle,
            desc: Box::new(desc.clone()),
        });
        handle
    }

    pub fn create_depth_stencil_state(&mut self, desc: &DepthStencilDesc) -> ResourceHandle {
        let handle = self.allocate(ResourceKind::DepthStencilState);
        self.push(Command::CreateDepthStencilState {
            handle,
            desc: Box::new(*desc),
        });
        handle
    }

    pub fn create_render_target(&mut self, desc: &RenderTargetDesc) -> ResourceHandle {
        assert!(
            desc.width >= 1 && desc.height >= 1,
            "create_render_target: degenerate size {}x{}",
            desc.width,
            desc.height
        );
        let mut desc = *desc;
        desc.sample_count = desc.sample_count.max(1);
        let handle = self.allocate(ResourceKind::RenderTarget);
        self.push(Command::CreateRenderTarget { handle, desc });
        handle
    }

    pub fn create_query(&mut self, kind: QueryKind) -> ResourceHandle {
        let handle = self.allocate(ResourceKind::Query);
        self.push(Command::CreateQuery { handle, kind });
        handle
    }

    pub fn update_buffer(&mut self, buffer: ResourceHandle, offset: u64, data: &[u8]) {
        self.check_live(buffer, BUFFER_KINDS, "update_buffer");
        assert!(!data.is_empty(), "update_buffer: empty update");
        self.push(Command::UpdateBuffer {
            handle: buffer,
            offset,
            data: data.into(),
        });
    }

    // ---- state ----

    pub fn clear(&mut self, desc: ClearDesc) {
        if desc.is_empty() {
            return;
        }
        self.push(Command::Clear(desc));
    }

    pub fn set_shader(&mut self, stage: ShaderStage, shader: ResourceHandle) {
        self.check_bindable(shader, &[ResourceKind::Shader], "set_shader");
        self.push(Command::SetShader {
            stage,
            handle: shader,
        });
    }

    pub fn set_input_layout(&mut self, layout: ResourceHandle) {
        self.check_bindable(layout, &[ResourceKind::InputLayout], "set_input_layout");
        self.push(Command::SetInputLayout { handle: layout });
    }

    pub fn set_vertex_buffer(
        &mut self,
        buffer: ResourceHandle,
        slot: u32,
        stride: u32,
        offset: u64,
    ) {
        assert!(
            (slot as usize) < MAX_VERTEX_BUFFERS,
            "set_vertex_buffer: slot {slot} out of range (max {MAX_VERTEX_BUFFERS})"
        );
        self.check_bindable(buffer, BUFFER_KINDS, "set_vertex_buffer");
        self.push(Command::SetVertexBuffer {
            handle: buffer,
            slot,
            stride,
            offset,
        });
    }

    pub fn set_index_buffer(&mut self, buffer: ResourceHandle, format: IndexFormat, offset: u64) {
        self.check_bindable(buffer, BUFFER_KINDS, "set_index_buffer");
        self.push(Command::SetIndexBuffer {
            handle: buffer,
            format,
            offset,
        });
    }

    pub fn set_constant_buffer(&mut self, stage: ShaderStage, slot: u32, buffer: ResourceHandle) {
        Self::check_stage_slot(slot, "set_constant_buffer");
        self.check_bindable(buffer, BUFFER_KINDS, "set_constant_buffer");
        self.push(Command::SetConstantBuffer {
            stage,
            slot,
            handle: buffer,
        });
    }

    /// Accepts textures and shader-visible render targets.
    pub fn set_texture(&mut self, stage: ShaderStage, slot: u32, texture: ResourceHandle) {
        Self::check_stage_slot(slot, "set_texture");
        self.check_bindable(texture, SAMPLEABLE_KINDS, "set_texture");
        self.push(Command::SetTexture {
            stage,
            slot,
            handle: texture,
        });
    }

    pub fn set_sampler(&mut self, stage: ShaderStage, slot: u32, sampler: ResourceHandle) {
        Self::check_stage_slot(slot, "set_sampler");
        self.check_bindable(sampler, &[ResourceKind::Sampler], "set_sampler");
        self.push(Command::SetSampler {
            stage,
            slot,
            handle: sampler,
        });
    }

    pub fn set_raster_state(&mut self, desc: RasterDesc) {
        self.push(Command::SetRasterState(desc));
    }

    pub fn set_blend_state(&mut self, state: ResourceHandle, blend_factor: [f32; 4]) {
        self.check_bindable(state, &[ResourceKind::BlendState], "set_blend_state");
        self.push(Command::SetBlendState {
            handle: state,
            blend_factor,
        });
    }

    pub fn set_depth_stencil_state(&mut self, state: ResourceHandle, stencil_ref: u32) {
        self.check_bindable(
            state,
            &[ResourceKind::DepthStencilState],
            "set_depth_stencil_state",
        );
        self.push(Command::SetDepthStencilState {
            handle: state,
            stencil_ref,
        });
    }

    /// `NULL` in `colors` binds the swapchain backbuffer.
    pub fn set_targets(&mut self, colors: &[ResourceHandle], depth: ResourceHandle) {
        assert!(
            colors.len() <= MAX_COLOR_TARGETS,
            "set_targets: {} color targets (max {MAX_COLOR_TARGETS})",
            colors.len()
        );
        for color in colors {
            self.check_bindable(*color, &[ResourceKind::RenderTarget], "set_targets");
        }
        self.check_bindable(depth, &[ResourceKind::RenderTarget], "set_targets");
        self.push(Command::SetTargets {
            colors: colors.into(),
            depth,
        });
    }

    pub fn set_viewport(&mut self, viewport: Viewport) {
        self.push(Command::SetViewport(viewport));
    }

    pub fn set_scissor(&mut self, rect: ScissorRect) {
        self.push(Command::SetScissor(rect));
    }

    // ---- draws ----

    pub fn draw(&mut self, vertex_count: u32, start_vertex: u32, topology: PrimitiveTopology) {
        self.push(Command::Draw {
            vertex_count,
            start_vertex,
            topology,
        });
    }

    pub fn draw_indexed(
        &mut self,
        index_count: u32,
        start_index: u32,
        base_vertex: i32,
        topology: PrimitiveTopology,
    ) {
        self.push(Command::DrawIndexed {
            index_count,
            start_index,
            base_vertex,
            topology,
        });
    }

    pub fn draw_instanced(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        start_vertex: u32,
        start_instance: u32,
        topology: PrimitiveTopology,
    ) {
        self.push(Command::DrawInstanced {
            vertex_count,
            instance_count,
            start_vertex,
            start_instance,
            topology,
        });
    }

    // ---- queries, markers, frame ----

    pub fn begin_query(&mut self, query: ResourceHandle) {
        self.check_live(query, &[ResourceKind::Query], "begin_query");
        self.push(Command::BeginQuery { handle: query });
    }

    pub fn end_query(&mut self, query: ResourceHandle) {
        self.check_live(query, &[ResourceKind::Query], "end_query");
        self.push(Command::EndQuery { handle: query });
    }

    pub fn push_marker(&mut self, label: &str) {
        self.push(Command::PushMarker {
            label: label.into(),
        });
    }

    pub fn pop_marker(&mut self) {
        self.push(Command::PopMarker);
    }

    /// Takes effect at the next `present`.
    pub fn request_resize(&mut self, width: u32, height: u32) {
        assert!(
            width >= 1 && height >= 1,
            "request_resize: degenerate size {width}x{height}"
        );
        self.push(Command::Resize { width, height });
    }

    pub fn present(&mut self) {
        self.push(Command::Present);
    }

    // ---- release ----

    /// Frees the slot now and enqueues destruction of the backend object.
    /// Releasing `NULL` or an already-released handle does nothing.
    fn release(&mut self, kind: ResourceKind, handle: ResourceHandle) {
        let Some(live) = self.slots.kind_of(handle) else {
            tracing::trace!(%handle, ?kind, "release of non-live handle ignored");
            return;
        };
        assert_eq!(live, kind, "release of {handle} with the wrong kind");
        self.slots.release(handle);
        self.push(Command::Release { kind, handle });
    }

    pub fn release_buffer(&mut self, buffer: ResourceHandle) {
        self.release(ResourceKind::Buffer, buffer);
    }

    pub fn release_texture(&mut self, texture: ResourceHandle) {
        self.release(ResourceKind::Texture, texture);
    }

    pub fn release_sampler(&mut self, sampler: ResourceHandle) {
        self.release(ResourceKind::Sampler, sampler);
    }

    pub fn release_shader(&mut self, shader: ResourceHandle) {
        self.release(ResourceKind::Shader, shader);
    }

    pub fn release_input_layout(&mut self, layout: ResourceHandle) {
        self.release(ResourceKind::InputLayout, layout);
    }

    pub fn release_blend_state(&mut self, state: ResourceHandle) {
        self.release(ResourceKind::BlendState, state);
    }

    pub fn release_depth_stencil_state(&mut self, state: ResourceHandle) {
        self.release(ResourceKind::DepthStencilState, state);
    }

    pub fn release_render_target(&mut self, target: ResourceHandle) {
        self.release(ResourceKind::RenderTarget, target);
    }

    pub fn release_query(&mut self, query: ResourceHandle) {
        self.release(ResourceKind::Query, query);
    }
}

#[cfg(test)]
mod tests {
    use crate::config::QueueConfig;
    use crate::queue::RenderCommandQueue;
    use rhi_common::*;
    use rhi_render::{Command, CommandLog, Opcode, RecordingBackend};

    fn queue() -> (RenderCommandQueue, CommandLog) {
        let backend = RecordingBackend::new();
        let log = backend.log();
        let config = QueueConfig {
            ring_capacity: 64,
            slot_capacity: 16,
            strict: true,
            ..Default::default()
        };
        (
            RenderCommandQueue::start(config, move || Ok(backend)).unwrap(),
            log,
        )
    }

    fn drain(queue: &mut RenderCommandQueue) {
        queue.flush().unwrap();
        queue.flush().unwrap();
    }

    #[test]
    fn handles_unique_while_live() {
        let (mut queue, _log) = queue();
        let a = queue.create_sampler(&SamplerDesc::default());
        let b = queue.create_query(QueryKind::Timestamp);
        let c = queue.create_buffer(&BufferDesc::constant(64), None);
        assert!(a != b && b != c && a != c);
        assert!(![a, b, c].contains(&ResourceHandle::NULL));
        assert_eq!(queue.live_handles(), 3);
    }

    #[test]
    fn double_release_enqueues_once() {
        let (mut queue, log) = queue();
        let t = queue.create_render_target(&RenderTargetDesc {
            width: 8,
            height: 8,
            format: TextureFormat::Rgba8Unorm,
            sample_count: 0,
            shader_visible: false,
        });
        queue.release_render_target(t);
        queue.release_render_target(t);
        queue.release_render_target(ResourceHandle::NULL);
        drain(&mut queue);
        assert_eq!(
            log.opcodes(),
            vec![Opcode::CreateRenderTarget, Opcode::Release]
        );
        assert_eq!(queue.live_handles(), 0);
    }

    #[test]
    fn texture_descriptor_is_normalized() {
        let (mut queue, log) = queue();
        let mut desc = TextureDesc::new_2d(256, 64, TextureFormat::Rgba8Unorm);
        desc.mip_levels = 0;
        desc.sample_count = 0;
        queue.create_texture(&desc, None);
        drain(&mut queue);
        match &log.commands()[0] {
            Command::CreateTexture { desc, .. } => {
                assert_eq!(desc.mip_levels, 9);
                assert_eq!(desc.sample_count, 1);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn empty_clear_is_dropped() {
        let (mut queue, _log) = queue();
        queue.clear(ClearDesc::default());
        assert_eq!(queue.pending(), 0);
    }

    #[test]
    #[should_panic(expected = "set_texture")]
    fn sampler_bound_as_texture_panics() {
        let (mut queue, _log) = queue();
        let sampler = queue.create_sampler(&SamplerDesc::default());
        queue.set_texture(ShaderStage::Pixel, 0, sampler);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn vertex_slot_bounds_checked() {
        let (mut queue, _log) = queue();
        queue.set_vertex_buffer(ResourceHandle::NULL, MAX_VERTEX_BUFFERS as u32, 0, 0);
    }

    #[test]
    #[should_panic(expected = "wrong kind")]
    fn release_with_wrong_kind_panics() {
        let (mut queue, _log) = queue();
        let buffer = queue.create_buffer(&BufferDesc::vertex(4), None);
        queue.release_texture(buffer);
    }

    #[test]
    #[should_panic(expected = "exhausted")]
    fn slot_exhaustion_panics() {
        let (mut queue, _log) = queue();
        for _ in 0..16 {
            queue.create_query(QueryKind::Occlusion);
        }
    }

    #[test]
    fn render_target_bindable_as_texture() {
        let (mut queue, log) = queue();
        let target = queue.create_render_target(&RenderTargetDesc {
            width: 16,
            height: 16,
            format: TextureFormat::Rgba16Float,
            sample_count: 1,
            shader_visible: true,
        });
        queue.set_texture(ShaderStage::Pixel, 1, target);
        drain(&mut queue);
        assert_eq!(log.len(), 2);
    }
}
