use rhi_common::*;
use serde::{Deserialize, Serialize};

/// Errors a backend reports while replaying a record.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BackendError {
    #[error("failed to create resource {handle}: {reason}")]
    CreationFailed {
        handle: ResourceHandle,
        reason: String,
    },
    #[error("misuse: {0}")]
    Misuse(String),
    #[error("unsupported by this backend: {0}")]
    Unsupported(String),
    #[error("device lost: {0}")]
    DeviceLost(String),
    #[error("surface error: {0}")]
    Surface(String),
    #[error("backend initialization failed: {0}")]
    Init(String),
}

impl BackendError {
    /// Caller bugs: bad handles, wrong resource kinds, enum values the
    /// backend cannot express. Fatal in strict mode.
    pub fn is_misuse(&self) -> bool {
        matches!(self, Self::Misuse(_) | Self::Unsupported(_))
    }

    pub fn misuse(msg: impl Into<String>) -> Self {
        Self::Misuse(msg.into())
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }
}

pub type BackendResult<T = ()> = Result<T, BackendError>;

/// Per-frame bookkeeping applied at `present`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PresentReport {
    /// Frames presented so far, including this one.
    pub frame: u64,
    /// Query results that became available this frame.
    pub query_results: Vec<(ResourceHandle, u64)>,
    /// The swapchain or device had to be recreated.
    pub recovered: bool,
    /// Backbuffer size after any resize request was applied.
    pub size: (u32, u32),
}

/// The "direct" API: one entry point per opcode, called only on the render
/// thread, in encode order.
///
/// Resource-creating methods store their native object under `handle` in a
/// backend-owned table; the backend never invents its own numbering. A handle
/// always arrives released before it is created again.
pub trait Backend {
    fn name(&self) -> &str;

    /// Clears the currently bound targets. Clearing with nothing bound is misuse.
    fn clear(&mut self, desc: &ClearDesc) -> BackendResult;

    fn create_shader(&mut self, handle: ResourceHandle, desc: &ShaderDesc) -> BackendResult;
    fn create_input_layout(
        &mut self,
        handle: ResourceHandle,
        elements: &[InputElement],
    ) -> BackendResult;
    fn create_buffer(
        &mut self,
        handle: ResourceHandle,
        desc: &BufferDesc,
        data: Option<&[u8]>,
    ) -> BackendResult;
    fn update_buffer(&mut self, handle: ResourceHandle, offset: u64, data: &[u8])
    -> BackendResult;
    fn create_texture(
        &mut self,
        handle: ResourceHandle,
        desc: &TextureDesc,
        data: Option<&[u8]>,
    ) -> BackendResult;
    fn create_sampler(&mut self, handle: ResourceHandle, desc: &SamplerDesc) -> BackendResult;
    fn create_blend_state(&mut self, handle: ResourceHandle, desc: &BlendDesc) -> BackendResult;
    fn create_depth_stencil_state(
        &mut self,
        handle: ResourceHandle,
        desc: &DepthStencilDesc,
    ) -> BackendResult;
    fn create_render_target(
        &mut self,
        handle: ResourceHandle,
        desc: &RenderTargetDesc,
    ) -> BackendResult;
    fn create_query(&mut self, handle: ResourceHandle, kind: QueryKind) -> BackendResult;

    fn set_shader(&mut self, stage: ShaderStage, handle: ResourceHandle) -> BackendResult;
    fn set_input_layout(&mut self, handle: ResourceHandle) -> BackendResult;
    fn set_vertex_buffer(
        &mut self,
        slot: u32,
        handle: ResourceHandle,
        stride: u32,
        offset: u64,
    ) -> BackendResult;
    fn set_index_buffer(
        &mut self,
        handle: ResourceHandle,
        format: IndexFormat,
        offset: u64,
    ) -> BackendResult;
    fn set_constant_buffer(
        &mut self,
        stage: ShaderStage,
        slot: u32,
        handle: ResourceHandle,
    ) -> BackendResult;
    fn set_texture(&mut self, stage: ShaderStage, slot: u32, handle: ResourceHandle)
    -> BackendResult;
    fn set_sampler(&mut self, stage: ShaderStage, slot: u32, handle: ResourceHandle)
    -> BackendResult;
    fn set_raster_state(&mut self, desc: &RasterDesc) -> BackendResult;
    fn set_blend_state(&mut self, handle: ResourceHandle, blend_factor: [f32; 4])
    -> BackendResult;
    fn set_depth_stencil_state(
        &mut self,
        handle: ResourceHandle,
        stencil_ref: u32,
    ) -> BackendResult;
    /// `NULL` in a color slot binds the swapchain backbuffer.
    fn set_targets(&mut self, colors: &[ResourceHandle], depth: ResourceHandle) -> BackendResult;
    fn set_viewport(&mut self, viewport: &Viewport) -> BackendResult;
    fn set_scissor(&mut self, rect: &ScissorRect) -> BackendResult;

    fn draw(
        &mut self,
        vertex_count: u32,
        start_vertex: u32,
        topology: PrimitiveTopology,
    ) -> BackendResult;
    fn draw_indexed(
        &mut self,
        index_count: u32,
        start_index: u32,
        base_vertex: i32,
        topology: PrimitiveTopology,
    ) -> BackendResult;
    fn draw_instanced(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        start_vertex: u32,
        start_instance: u32,
        topology: PrimitiveTopology,
    ) -> BackendResult;

    fn begin_query(&mut self, handle: ResourceHandle) -> BackendResult;
    fn end_query(&mut self, handle: ResourceHandle) -> BackendResult;
    fn push_marker(&mut self, label: &str) -> BackendResult;
    fn pop_marker(&mut self) -> BackendResult;

    /// Records a resize request; applied at the next `present`.
    fn resize(&mut self, width: u32, height: u32) -> BackendResult;

    /// Ends the frame. Called once per frame; may block (vsync, readback).
    fn present(&mut self) -> BackendResult<PresentReport>;

    /// Destroys the native object stored under `handle`.
    fn release(&mut self, kind: ResourceKind, handle: ResourceHandle) -> BackendResult;

    /// Tears down the native context. Called once, on the render thread.
    fn shutdown(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn misuse_classification() {
        assert!(BackendError::misuse("bad slot").is_misuse());
        assert!(BackendError::unsupported("wireframe").is_misuse());
        let failed = BackendError::CreationFailed {
            handle: ResourceHandle(3),
            reason: "out of memory".into(),
        };
        assert!(!failed.is_misuse());
        assert_eq!(
            failed.to_string(),
            "failed to create resource #3: out of memory"
        );
    }
}
