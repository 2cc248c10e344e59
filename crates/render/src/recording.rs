use parking_lot::Mutex;
use rhi_common::*;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::backend::{Backend, BackendError, BackendResult, PresentReport};
use crate::command::{Command, Opcode};

/// Shared, cloneable view of everything a [`RecordingBackend`] executed.
///
/// The backend lives on the render thread; tests and tools keep a `CommandLog`
/// on their own thread and inspect it after a flush.
#[derive(Debug, Clone, Default)]
pub struct CommandLog {
    commands: Arc<Mutex<Vec<Command>>>,
}

impl CommandLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, command: Command) {
        self.commands.lock().push(command);
    }

    /// Copy of every record observed so far, in execution order.
    pub fn commands(&self) -> Vec<Command> {
        self.commands.lock().clone()
    }

    pub fn opcodes(&self) -> Vec<Opcode> {
        self.commands.lock().iter().map(Command::opcode).collect()
    }

    pub fn len(&self) -> usize {
        self.commands.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.lock().is_empty()
    }

    /// Number of records per opcode.
    pub fn histogram(&self) -> BTreeMap<Opcode, usize> {
        let mut counts = BTreeMap::new();
        for cmd in self.commands.lock().iter() {
            *counts.entry(cmd.opcode()).or_insert(0) += 1;
        }
        counts
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&*self.commands.lock())
    }

    /// Human-readable listing, one record per line.
    pub fn render_text(&self) -> String {
        let commands = self.commands.lock();
        let mut out = String::new();
        let _ = writeln!(out, "=== Command trace ({} records) ===", commands.len());
        for (i, cmd) in commands.iter().enumerate() {
            let slot = cmd.resource_slot();
            let _ = write!(out, "{i:>6} {:<24?}", cmd.opcode());
            if !slot.is_null() {
                let _ = write!(out, " {slot}");
            }
            let payload = cmd.payload_len();
            if payload > 0 {
                let _ = write!(out, " ({payload} B payload)");
            }
            out.push('\n');
        }
        out
    }
}

/// Backend that executes nothing on a GPU but validates and records every
/// record it receives.
///
/// It keeps a simulated slot table with the same rules a native backend
/// enforces, synthesizes query results at `present`, and can be told to
/// sleep on an opcode or fail creations, which makes it the mock of choice
/// for exercising the queue.
#[derive(Debug)]
pub struct RecordingBackend {
    log: CommandLog,
    slots: BTreeMap<ResourceHandle, ResourceKind>,
    queries: HashMap<ResourceHandle, QueryKind>,
    open_queries: HashMap<ResourceHandle, (u64, Instant)>,
    ready_queries: Vec<(ResourceHandle, u64)>,
    targets_bound: bool,
    draws: u64,
    marker_depth: u32,
    frame: u64,
    size: (u32, u32),
    pending_resize: Option<(u32, u32)>,
    delays: HashMap<Opcode, Duration>,
    failing: HashSet<Opcode>,
}

impl Default for RecordingBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self::with_log(CommandLog::new())
    }

    /// Records into an existing log, e.g. one created before the render
    /// thread was spawned.
    pub fn with_log(log: CommandLog) -> Self {
        Self {
            log,
            slots: BTreeMap::new(),
            queries: HashMap::new(),
            open_queries: HashMap::new(),
            ready_queries: Vec::new(),
            targets_bound: false,
            draws: 0,
            marker_depth: 0,
            frame: 0,
            size: (1280, 720),
            pending_resize: None,
            delays: HashMap::new(),
            failing: HashSet::new(),
        }
    }

    pub fn log(&self) -> CommandLog {
        self.log.clone()
    }

    /// Sleeps for `delay` whenever a record with this opcode executes.
    pub fn with_delay(mut self, opcode: Opcode, delay: Duration) -> Self {
        self.delays.insert(opcode, delay);
        self
    }

    /// Reports `CreationFailed` for every record with this opcode.
    pub fn failing(mut self, opcode: Opcode) -> Self {
        self.failing.insert(opcode);
        self
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.size = (width, height);
        self
    }

    /// Number of slots the simulated backend currently holds objects for.
    pub fn live_objects(&self) -> usize {
        self.slots.len()
    }

    fn observe(&mut self, command: Command) {
        if let Some(delay) = self.delays.get(&command.opcode()) {
            std::thread::sleep(*delay);
        }
        tracing::trace!(opcode = ?command.opcode(), "recording backend");
        self.log.push(command);
    }

    fn create(
        &mut self,
        handle: ResourceHandle,
        kind: ResourceKind,
        opcode: Opcode,
    ) -> BackendResult {
        if handle.is_null() {
            return Err(BackendError::misuse(format!("{opcode:?} into the null handle")));
        }
        if let Some(existing) = self.slots.get(&handle) {
            return Err(BackendError::misuse(format!(
                "{opcode:?} into slot {handle} still holding a {existing:?}"
            )));
        }
        if self.failing.contains(&opcode) {
            return Err(BackendError::CreationFailed {
                handle,
                reason: format!("injected failure for {opcode:?}"),
            });
        }
        self.slots.insert(handle, kind);
        Ok(())
    }

    /// `NULL` unbinds and is always accepted.
    fn expect_bindable(&self, handle: ResourceHandle, accepted: &[ResourceKind]) -> BackendResult {
        if handle.is_null() {
            return Ok(());
        }
        self.expect_live(handle, accepted)
    }

    fn expect_live(&self, handle: ResourceHandle, accepted: &[ResourceKind]) -> BackendResult {
        match self.slots.get(&handle) {
            Some(kind) if accepted.contains(kind) => Ok(()),
            Some(kind) => Err(BackendError::misuse(format!(
                "{handle} is a {kind:?}, expected one of {accepted:?}"
            ))),
            None => Err(BackendError::misuse(format!(
                "{handle} has no backend object (never created or already released)"
            ))),
        }
    }

    fn record_draw(&mut self) -> BackendResult {
        if !self.targets_bound {
            return Err(BackendError::misuse("draw with no render targets bound"));
        }
        self.draws += 1;
        Ok(())
    }
}

impl Backend for RecordingBackend {
    fn name(&self) -> &str {
        "recording"
    }

    fn clear(&mut self, desc: &ClearDesc) -> BackendResult {
        self.observe(Command::Clear(*desc));
        if !self.targets_bound {
            return Err(BackendError::misuse("clear with no render targets bound"));
        }
        Ok(())
    }

    fn create_shader(&mut self, handle: ResourceHandle, desc: &ShaderDesc) -> BackendResult {
        self.observe(Command::CreateShader {
            handle,
            desc: Box::new(desc.clone()),
        });
        self.create(handle, ResourceKind::Shader, Opcode::CreateShader)
    }

    fn create_input_layout(
        &mut self,
        handle: ResourceHandle,
        elements: &[InputElement],
    ) -> BackendResult {
        self.observe(Command::CreateInputLayout {
            handle,
            elements: elements.into(),
        });
        self.create(handle, ResourceKind::InputLayout, Opcode::CreateInputLayout)
    }

    fn create_buffer(
        &mut self,
        handle: ResourceHandle,
        desc: &BufferDesc,
        data: Option<&[u8]>,
    ) -> BackendResult {
        self.observe(Command::CreateBuffer {
            handle,
            desc: *desc,
            data: data.map(Into::into),
        });
        self.create(handle, ResourceKind::Buffer, Opcode::CreateBuffer)
    }

    fn update_buffer(
        &mut self,
        handle: ResourceHandle,
        offset: u64,
        data: &[u8],
    ) -> BackendResult {
        self.observe(Command::UpdateBuffer {
            handle,
            offset,
            data: data.into(),
        });
        self.expect_live(handle, &[ResourceKind::Buffer])
    }

    fn create_texture(
        &mut self,
        handle: ResourceHandle,
        desc: &TextureDesc,
        data: Option<&[u8]>,
    ) -> BackendResult {
        self.observe(Command::CreateTexture {
            handle,
            desc: Box::new(*desc),
            data: data.map(Into::into),
        });
        self.create(handle, ResourceKind::Texture, Opcode::CreateTexture)
    }

    fn create_sampler(&mut self, handle: ResourceHandle, desc: &SamplerDesc) -> BackendResult {
        self.observe(Command::CreateSampler {
            handle,
            desc: Box::new(*desc),
        });
        self.create(handle, ResourceKind::Sampler, Opcode::CreateSampler)
    }

    fn create_blend_state(&mut self, handle: ResourceHandle, desc: &BlendDesc) -> BackendResult {
        self.observe(Command::CreateBlendState {
            handle,
            desc: Box::new(desc.clone()),
        });
        self.create(handle, ResourceKind::BlendState, Opcode::CreateBlendState)
    }

    fn create_depth_stencil_state(
        &mut self,
        handle: ResourceHandle,
        desc: &DepthStencilDesc,
    ) -> BackendResult {
        self.observe(Command::CreateDepthStencilState {
            handle,
            desc: Box::new(*desc),
        });
        self.create(
            handle,
            ResourceKind::DepthStencilState,
            Opcode::CreateDepthStencilState,
        )
    }

    fn create_render_target(
        &mut self,
        handle: ResourceHandle,
        desc: &RenderTargetDesc,
    ) -> BackendResult {
        self.observe(Command::CreateRenderTarget {
            handle,
            desc: *desc,
        });
        self.create(handle, ResourceKind::RenderTarget, Opcode::CreateRenderTarget)
    }

    fn create_query(&mut self, handle: ResourceHandle, kind: QueryKind) -> BackendResult {
        self.observe(Command::CreateQuery { handle, kind });
        self.create(handle, ResourceKind::Query, Opcode::CreateQuery)?;
        self.queries.insert(handle, kind);
        Ok(())
    }

    fn set_shader(&mut self, stage: ShaderStage, handle: ResourceHandle) -> BackendResult {
        self.observe(Command::SetShader { stage, handle });
        self.expect_bindable(handle, &[ResourceKind::Shader])
    }

    fn set_input_layout(&mut self, handle: ResourceHandle) -> BackendResult {
        self.observe(Command::SetInputLayout { handle });
        self.expect_bindable(handle, &[ResourceKind::InputLayout])
    }

    fn set_vertex_buffer(
        &mut self,
        slot: u32,
        handle: ResourceHandle,
        stride: u32,
        offset: u64,
    ) -> BackendResult {
        self.observe(Command::SetVertexBuffer {
            handle,
            slot,
            stride,
            offset,
        });
        self.expect_bindable(handle, &[ResourceKind::Buffer])
    }

    fn set_index_buffer(
        &mut self,
        handle: ResourceHandle,
        format: IndexFormat,
        offset: u64,
    ) -> BackendResult {
        self.observe(Command::SetIndexBuffer {
            handle,
            format,
            offset,
        });
        self.expect_bindable(handle, &[ResourceKind::Buffer])
    }

    fn set_constant_buffer(
        &mut self,
        stage: ShaderStage,
        slot: u32,
        handle: ResourceHandle,
    ) -> BackendResult {
        self.observe(Command::SetConstantBuffer {
            stage,
            slot,
            handle,
        });
        self.expect_bindable(handle, &[ResourceKind::Buffer])
    }

    fn set_texture(
        &mut self,
        stage: ShaderStage,
        slot: u32,
        handle: ResourceHandle,
    ) -> BackendResult {
        self.observe(Command::SetTexture {
            stage,
            slot,
            handle,
        });
        self.expect_bindable(handle, &[ResourceKind::Texture, ResourceKind::RenderTarget])
    }

    fn set_sampler(
        &mut self,
        stage: ShaderStage,
        slot: u32,
        handle: ResourceHandle,
    ) -> BackendResult {
        self.observe(Command::SetSampler {
            stage,
            slot,
            handle,
        });
        self.expect_bindable(handle, &[ResourceKind::Sampler])
    }

    fn set_raster_state(&mut self, desc: &RasterDesc) -> BackendResult {
        self.observe(Command::SetRasterState(*desc));
        Ok(())
    }

    fn set_blend_state(
        &mut self,
        handle: ResourceHandle,
        blend_factor: [f32; 4],
    ) -> BackendResult {
        self.observe(Command::SetBlendState {
            handle,
            blend_factor,
        });
        self.expect_bindable(handle, &[ResourceKind::BlendState])
    }

    fn set_depth_stencil_state(
        &mut self,
        handle: ResourceHandle,
        stencil_ref: u32,
    ) -> BackendResult {
        self.observe(Command::SetDepthStencilState {
            handle,
            stencil_ref,
        });
        self.expect_bindable(handle, &[ResourceKind::DepthStencilState])
    }

    fn set_targets(&mut self, colors: &[ResourceHandle], depth: ResourceHandle) -> BackendResult {
        self.observe(Command::SetTargets {
            colors: colors.into(),
            depth,
        });
        for color in colors {
            self.expect_bindable(*color, &[ResourceKind::RenderTarget])?;
        }
        self.expect_bindable(depth, &[ResourceKind::RenderTarget])?;
        self.targets_bound = !colors.is_empty() || !depth.is_null();
        Ok(())
    }

    fn set_viewport(&mut self, viewport: &Viewport) -> BackendResult {
        self.observe(Command::SetViewport(*viewport));
        Ok(())
    }

    fn set_scissor(&mut self, rect: &ScissorRect) -> BackendResult {
        self.observe(Command::SetScissor(*rect));
        Ok(())
    }

    fn draw(
        &mut self,
        vertex_count: u32,
        start_vertex: u32,
        topology: PrimitiveTopology,
    ) -> BackendResult {
        self.observe(Command::Draw {
            vertex_count,
            start_vertex,
            topology,
        });
        self.record_draw()
    }

    fn draw_indexed(
        &mut self,
        index_count: u32,
        start_index: u32,
        base_vertex: i32,
        topology: PrimitiveTopology,
    ) -> BackendResult {
        self.observe(Command::DrawIndexed {
            index_count,
            start_index,
            base_vertex,
            topology,
        });
        self.record_draw()
    }

    fn draw_instanced(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        start_vertex: u32,
        start_instance: u32,
        topology: PrimitiveTopology,
    ) -> BackendResult {
        self.observe(Command::DrawInstanced {
            vertex_count,
            instance_count,
            start_vertex,
            start_instance,
            topology,
        });
        self.record_draw()
    }

    fn begin_query(&mut self, handle: ResourceHandle) -> BackendResult {
        self.observe(Command::BeginQuery { handle });
        self.expect_live(handle, &[ResourceKind::Query])?;
        if self
            .open_queries
            .insert(handle, (self.draws, Instant::now()))
            .is_some()
        {
            return Err(BackendError::misuse(format!("query {handle} begun twice")));
        }
        Ok(())
    }

    fn end_query(&mut self, handle: ResourceHandle) -> BackendResult {
        self.observe(Command::EndQuery { handle });
        let (draws_at_begin, started) = self
            .open_queries
            .remove(&handle)
            .ok_or_else(|| BackendError::misuse(format!("query {handle} ended without begin")))?;
        // Occlusion reports one "sample" per draw; timestamps report wall time.
        let value = match self.queries.get(&handle) {
            Some(QueryKind::Occlusion) => self.draws - draws_at_begin,
            Some(QueryKind::Timestamp) => started.elapsed().as_nanos() as u64,
            None => return Err(BackendError::misuse(format!("{handle} is not a query"))),
        };
        self.ready_queries.push((handle, value));
        Ok(())
    }

    fn push_marker(&mut self, label: &str) -> BackendResult {
        self.observe(Command::PushMarker {
            label: label.into(),
        });
        self.marker_depth += 1;
        Ok(())
    }

    fn pop_marker(&mut self) -> BackendResult {
        self.observe(Command::PopMarker);
        if self.marker_depth == 0 {
            return Err(BackendError::misuse("pop_marker without matching push"));
        }
        self.marker_depth -= 1;
        Ok(())
    }

    fn resize(&mut self, width: u32, height: u32) -> BackendResult {
        self.observe(Command::Resize { width, height });
        self.pending_resize = Some((width.max(1), height.max(1)));
        Ok(())
    }

    fn present(&mut self) -> BackendResult<PresentReport> {
        self.observe(Command::Present);
        if let Some(size) = self.pending_resize.take() {
            self.size = size;
        }
        self.frame += 1;
        self.targets_bound = false;
        Ok(PresentReport {
            frame: self.frame,
            query_results: std::mem::take(&mut self.ready_queries),
            recovered: false,
            size: self.size,
        })
    }

    fn release(&mut self, kind: ResourceKind, handle: ResourceHandle) -> BackendResult {
        self.observe(Command::Release { kind, handle });
        match self.slots.remove(&handle) {
            Some(existing) if existing == kind => {
                self.queries.remove(&handle);
                self.open_queries.remove(&handle);
                self.ready_queries.retain(|(h, _)| *h != handle);
                Ok(())
            }
            Some(existing) => {
                self.slots.insert(handle, existing);
                Err(BackendError::misuse(format!(
                    "release of {handle} as {kind:?}, but it holds a {existing:?}"
                )))
            }
            None => Err(BackendError::misuse(format!(
                "release of {handle} which holds no object"
            ))),
        }
    }

    fn shutdown(&mut self) {
        tracing::debug!(
            live = self.slots.len(),
            frames = self.frame,
            "recording backend shut down"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::execute;

    fn rt_desc() -> RenderTargetDesc {
        RenderTargetDesc {
            width: 64,
            height: 64,
            format: TextureFormat::Rgba8Unorm,
            sample_count: 1,
            shader_visible: true,
        }
    }

    #[test]
    fn records_in_order() {
        let mut backend = RecordingBackend::new();
        let log = backend.log();
        backend
            .create_buffer(ResourceHandle(1), &BufferDesc::vertex(16), None)
            .unwrap();
        backend.set_vertex_buffer(0, ResourceHandle(1), 16, 0).unwrap();
        assert_eq!(
            log.opcodes(),
            vec![Opcode::CreateBuffer, Opcode::SetVertexBuffer]
        );
    }

    #[test]
    fn create_into_live_slot_is_misuse() {
        let mut backend = RecordingBackend::new();
        backend
            .create_buffer(ResourceHandle(1), &BufferDesc::vertex(16), None)
            .unwrap();
        let err = backend
            .create_buffer(ResourceHandle(1), &BufferDesc::vertex(16), None)
            .unwrap_err();
        assert!(err.is_misuse());
    }

    #[test]
    fn binding_wrong_kind_is_misuse() {
        let mut backend = RecordingBackend::new();
        backend
            .create_sampler(ResourceHandle(2), &SamplerDesc::default())
            .unwrap();
        let err = backend
            .set_texture(ShaderStage::Pixel, 0, ResourceHandle(2))
            .unwrap_err();
        assert!(err.is_misuse());
        // Null always unbinds.
        backend
            .set_texture(ShaderStage::Pixel, 0, ResourceHandle::NULL)
            .unwrap();
    }

    #[test]
    fn clear_without_targets_is_misuse() {
        let mut backend = RecordingBackend::new();
        assert!(backend.clear(&ClearDesc::color([0.0; 4])).is_err());
        backend.set_targets(&[ResourceHandle::NULL], ResourceHandle::NULL).unwrap();
        backend.clear(&ClearDesc::color([0.0; 4])).unwrap();
    }

    #[test]
    fn injected_failure_leaves_slot_empty() {
        let mut backend = RecordingBackend::new().failing(Opcode::CreateRenderTarget);
        let err = backend
            .create_render_target(ResourceHandle(5), &rt_desc())
            .unwrap_err();
        assert!(matches!(err, BackendError::CreationFailed { .. }));
        assert_eq!(backend.live_objects(), 0);
    }

    #[test]
    fn occlusion_query_counts_draws_and_reports_at_present() {
        let mut backend = RecordingBackend::new();
        let q = ResourceHandle(9);
        execute(
            &mut backend,
            &Command::CreateQuery {
                handle: q,
                kind: QueryKind::Occlusion,
            },
        )
        .unwrap();
        backend.set_targets(&[ResourceHandle::NULL], ResourceHandle::NULL).unwrap();
        backend.begin_query(q).unwrap();
        backend.draw(3, 0, PrimitiveTopology::TriangleList).unwrap();
        backend.draw(3, 3, PrimitiveTopology::TriangleList).unwrap();
        backend.end_query(q).unwrap();
        let report = execute(&mut backend, &Command::Present).unwrap().unwrap();
        assert_eq!(report.frame, 1);
        assert_eq!(report.query_results, vec![(q, 2)]);
    }

    #[test]
    fn resize_applies_at_present() {
        let mut backend = RecordingBackend::new().with_size(100, 100);
        backend.resize(640, 480).unwrap();
        let report = backend.present().unwrap();
        assert_eq!(report.size, (640, 480));
    }

    #[test]
    fn release_then_recreate_same_slot() {
        let mut backend = RecordingBackend::new();
        let h = ResourceHandle(4);
        backend.create_render_target(h, &rt_desc()).unwrap();
        backend.release(ResourceKind::RenderTarget, h).unwrap();
        backend.create_buffer(h, &BufferDesc::vertex(4), None).unwrap();
        assert!(backend.release(ResourceKind::RenderTarget, h).is_err());
        assert_eq!(backend.live_objects(), 1);
    }

    #[test]
    fn released_query_reports_nothing_at_present() {
        let mut backend = RecordingBackend::new();
        let q = ResourceHandle(3);
        backend.create_query(q, QueryKind::Occlusion).unwrap();
        backend.set_targets(&[ResourceHandle::NULL], ResourceHandle::NULL).unwrap();
        backend.begin_query(q).unwrap();
        backend.draw(3, 0, PrimitiveTopology::TriangleList).unwrap();
        backend.end_query(q).unwrap();
        backend.release(ResourceKind::Query, q).unwrap();
        let report = backend.present().unwrap();
        assert!(report.query_results.is_empty());
    }

    #[test]
    fn render_text_lists_records() {
        let mut backend = RecordingBackend::new();
        let log = backend.log();
        backend
            .create_buffer(ResourceHandle(1), &BufferDesc::vertex(8), Some(&[0u8; 8]))
            .unwrap();
        let text = log.render_text();
        assert!(text.contains("1 records"));
        assert!(text.contains("CreateBuffer"));
        assert!(text.contains("8 B payload"));
    }
}
