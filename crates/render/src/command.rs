use rhi_common::*;
use serde::{Deserialize, Serialize};

use crate::backend::{Backend, BackendResult, PresentReport};

/// One recorded GPU operation.
///
/// Records travel by value through the command ring. Variable-length data is
/// owned by the record itself (`Box<[_]>`, `Vec<_>`, `Box<str>`) and is
/// dropped right after the backend executed the record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Command {
    Clear(ClearDesc),
    CreateShader {
        handle: ResourceHandle,
        desc: Box<ShaderDesc>,
    },
    CreateInputLayout {
        handle: ResourceHandle,
        elements: Box<[InputElement]>,
    },
    CreateBuffer {
        handle: ResourceHandle,
        desc: BufferDesc,
        data: Option<Box<[u8]>>,
    },
    UpdateBuffer {
        handle: ResourceHandle,
        offset: u64,
        data: Box<[u8]>,
    },
    CreateTexture {
        handle: ResourceHandle,
        desc: Box<TextureDesc>,
        data: Option<Box<[u8]>>,
    },
    CreateSampler {
        handle: ResourceHandle,
        desc: Box<SamplerDesc>,
    },
    CreateBlendState {
        handle: ResourceHandle,
        desc: Box<BlendDesc>,
    },
    CreateDepthStencilState {
        handle: ResourceHandle,
        desc: Box<DepthStencilDesc>,
    },
    CreateRenderTarget {
        handle: ResourceHandle,
        desc: RenderTargetDesc,
    },
    CreateQuery {
        handle: ResourceHandle,
        kind: QueryKind,
    },
    SetShader {
        stage: ShaderStage,
        handle: ResourceHandle,
    },
    SetInputLayout {
        handle: ResourceHandle,
    },
    SetVertexBuffer {
        handle: ResourceHandle,
        slot: u32,
        stride: u32,
        offset: u64,
    },
    SetIndexBuffer {
        handle: ResourceHandle,
        format: IndexFormat,
        offset: u64,
    },
    SetConstantBuffer {
        stage: ShaderStage,
        slot: u32,
        handle: ResourceHandle,
    },
    SetTexture {
        stage: ShaderStage,
        slot: u32,
        handle: ResourceHandle,
    },
    SetSampler {
        stage: ShaderStage,
        slot: u32,
        handle: ResourceHandle,
    },
    SetRasterState(RasterDesc),
    SetBlendState {
        handle: ResourceHandle,
        blend_factor: [f32; 4],
    },
    SetDepthStencilState {
        handle: ResourceHandle,
        stencil_ref: u32,
    },
    SetTargets {
        colors: Box<[ResourceHandle]>,
        depth: ResourceHandle,
    },
    SetViewport(Viewport),
    SetScissor(ScissorRect),
    Draw {
        vertex_count: u32,
        start_vertex: u32,
        topology: PrimitiveTopology,
    },
    DrawIndexed {
        index_count: u32,
        start_index: u32,
        base_vertex: i32,
        topology: PrimitiveTopology,
    },
    DrawInstanced {
        vertex_count: u32,
        instance_count: u32,
        start_vertex: u32,
        start_instance: u32,
        topology: PrimitiveTopology,
    },
    BeginQuery {
        handle: ResourceHandle,
    },
    EndQuery {
        handle: ResourceHandle,
    },
    PushMarker {
        label: Box<str>,
    },
    PopMarker,
    Resize {
        width: u32,
        height: u32,
    },
    Present,
    Release {
        kind: ResourceKind,
        handle: ResourceHandle,
    },
}

/// Tag of a [`Command`], for logging, statistics and test assertions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Opcode {
    Clear,
    CreateShader,
    CreateInputLayout,
    CreateBuffer,
    UpdateBuffer,
    CreateTexture,
    CreateSampler,
    CreateBlendState,
    CreateDepthStencilState,
    CreateRenderTarget,
    CreateQuery,
    SetShader,
    SetInputLayout,
    SetVertexBuffer,
    SetIndexBuffer,
    SetConstantBuffer,
    SetTexture,
    SetSampler,
    SetRasterState,
    SetBlendState,
    SetDepthStencilState,
    SetTargets,
    SetViewport,
    SetScissor,
    Draw,
    DrawIndexed,
    DrawInstanced,
    BeginQuery,
    EndQuery,
    PushMarker,
    PopMarker,
    Resize,
    Present,
    Release,
}

impl Command {
    pub fn opcode(&self) -> Opcode {
        match self {
            Self::Clear(_) => Opcode::Clear,
            Self::CreateShader { .. } => Opcode::CreateShader,
            Self::CreateInputLayout { .. } => Opcode::CreateInputLayout,
            Self::CreateBuffer { .. } => Opcode::CreateBuffer,
            Self::UpdateBuffer { .. } => Opcode::UpdateBuffer,
            Self::CreateTexture { .. } => Opcode::CreateTexture,
            Self::CreateSampler { .. } => Opcode::CreateSampler,
            Self::CreateBlendState { .. } => Opcode::CreateBlendState,
            Self::CreateDepthStencilState { .. } => Opcode::CreateDepthStencilState,
            Self::CreateRenderTarget { .. } => Opcode::CreateRenderTarget,
            Self::CreateQuery { .. } => Opcode::CreateQuery,
            Self::SetShader { .. } => Opcode::SetShader,
            Self::SetInputLayout { .. } => Opcode::SetInputLayout,
            Self::SetVertexBuffer { .. } => Opcode::SetVertexBuffer,
            Self::SetIndexBuffer { .. } => Opcode::SetIndexBuffer,
            Self::SetConstantBuffer { .. } => Opcode::SetConstantBuffer,
            Self::SetTexture { .. } => Opcode::SetTexture,
            Self::SetSampler { .. } => Opcode::SetSampler,
            Self::SetRasterState(_) => Opcode::SetRasterState,
            Self::SetBlendState { .. } => Opcode::SetBlendState,
            Self::SetDepthStencilState { .. } => Opcode::SetDepthStencilState,
            Self::SetTargets { .. } => Opcode::SetTargets,
            Self::SetViewport(_) => Opcode::SetViewport,
            Self::SetScissor(_) => Opcode::SetScissor,
            Self::Draw { .. } => Opcode::Draw,
            Self::DrawIndexed { .. } => Opcode::DrawIndexed,
            Self::DrawInstanced { .. } => Opcode::DrawInstanced,
            Self::BeginQuery { .. } => Opcode::BeginQuery,
            Self::EndQuery { .. } => Opcode::EndQuery,
            Self::PushMarker { .. } => Opcode::PushMarker,
            Self::PopMarker => Opcode::PopMarker,
            Self::Resize { .. } => Opcode::Resize,
            Self::Present => Opcode::Present,
            Self::Release { .. } => Opcode::Release,
        }
    }

    /// The resource slot this record creates, updates or releases, if any.
    ///
    /// Binding commands report `NULL`: they reference a slot but do not own it.
    pub fn resource_slot(&self) -> ResourceHandle {
        match self {
            Self::CreateShader { handle, .. }
            | Self::CreateInputLayout { handle, .. }
            | Self::CreateBuffer { handle, .. }
            | Self::UpdateBuffer { handle, .. }
            | Self::CreateTexture { handle, .. }
            | Self::CreateSampler { handle, .. }
            | Self::CreateBlendState { handle, .. }
            | Self::CreateDepthStencilState { handle, .. }
            | Self::CreateRenderTarget { handle, .. }
            | Self::CreateQuery { handle, .. }
            | Self::Release { handle, .. } => *handle,
            _ => ResourceHandle::NULL,
        }
    }

    /// Bytes of out-of-line payload owned by this record.
    pub fn payload_len(&self) -> usize {
        match self {
            Self::CreateShader { desc, .. } => desc.bytecode.len() + desc.entry_point.len(),
            Self::CreateInputLayout { elements, .. } => {
                elements.len() * std::mem::size_of::<InputElement>()
            }
            Self::CreateBuffer { data, .. } | Self::CreateTexture { data, .. } => {
                data.as_ref().map_or(0, |d| d.len())
            }
            Self::UpdateBuffer { data, .. } => data.len(),
            Self::CreateBlendState { desc, .. } => {
                desc.targets.len() * std::mem::size_of::<BlendTargetDesc>()
            }
            Self::SetTargets { colors, .. } => colors.len() * std::mem::size_of::<ResourceHandle>(),
            Self::PushMarker { label } => label.len(),
            _ => 0,
        }
    }

}

impl Opcode {
    /// Records that put a new object into their handle's slot.
    pub fn creates_resource(self) -> bool {
        matches!(
            self,
            Self::CreateShader
                | Self::CreateInputLayout
                | Self::CreateBuffer
                | Self::CreateTexture
                | Self::CreateSampler
                | Self::CreateBlendState
                | Self::CreateDepthStencilState
                | Self::CreateRenderTarget
                | Self::CreateQuery
        )
    }
}

/// Replays one record on a backend.
///
/// This is the only place that maps records to backend entry points; adding a
/// variant to [`Command`] fails to compile until it is handled here.
/// Returns the present report when the record was `Present`.
pub fn execute<B: Backend + ?Sized>(
    backend: &mut B,
    command: &Command,
) -> BackendResult<Option<PresentReport>> {
    match command {
        Command::Clear(desc) => backend.clear(desc)?,
        Command::CreateShader { handle, desc } => backend.create_shader(*handle, desc)?,
        Command::CreateInputLayout { handle, elements } => {
            backend.create_input_layout(*handle, elements)?
        }
        Command::CreateBuffer { handle, desc, data } => {
            backend.create_buffer(*handle, desc, data.as_deref())?
        }
        Command::UpdateBuffer {
            handle,
            offset,
            data,
        } => backend.update_buffer(*handle, *offset, data)?,
        Command::CreateTexture { handle, desc, data } => {
            backend.create_texture(*handle, desc, data.as_deref())?
        }
        Command::CreateSampler { handle, desc } => backend.create_sampler(*handle, desc)?,
        Command::CreateBlendState { handle, desc } => backend.create_blend_state(*handle, desc)?,
        Command::CreateDepthStencilState { handle, desc } => {
            backend.create_depth_stencil_state(*handle, desc)?
        }
        Command::CreateRenderTarget { handle, desc } => {
            backend.create_render_target(*handle, desc)?
        }
        Command::CreateQuery { handle, kind } => backend.create_query(*handle, *kind)?,
        Command::SetShader { stage, handle } => backend.set_shader(*stage, *handle)?,
        Command::SetInputLayout { handle } => backend.set_input_layout(*handle)?,
        Command::SetVertexBuffer {
            handle,
            slot,
            stride,
            offset,
        } => backend.set_vertex_buffer(*slot, *handle, *stride, *offset)?,
        Command::SetIndexBuffer {
            handle,
            format,
            offset,
        } => backend.set_index_buffer(*handle, *format, *offset)?,
        Command::SetConstantBuffer {
            stage,
            slot,
            handle,
        } => backend.set_constant_buffer(*stage, *slot, *handle)?,
        Command::SetTexture {
            stage,
            slot,
            handle,
        } => backend.set_texture(*stage, *slot, *handle)?,
        Command::SetSampler {
            stage,
            slot,
            handle,
        } => backend.set_sampler(*stage, *slot, *handle)?,
        Command::SetRasterState(desc) => backend.set_raster_state(desc)?,
        Command::SetBlendState {
            handle,
            blend_factor,
        } => backend.set_blend_state(*handle, *blend_factor)?,
        Command::SetDepthStencilState {
            handle,
            stencil_ref,
        } => backend.set_depth_stencil_state(*handle, *stencil_ref)?,
        Command::SetTargets { colors, depth } => backend.set_targets(colors, *depth)?,
        Command::SetViewport(viewport) => backend.set_viewport(viewport)?,
        Command::SetScissor(rect) => backend.set_scissor(rect)?,
        Command::Draw {
            vertex_count,
            start_vertex,
            topology,
        } => backend.draw(*vertex_count, *start_vertex, *topology)?,
        Command::DrawIndexed {
            index_count,
            start_index,
            base_vertex,
            topology,
        } => backend.draw_indexed(*index_count, *start_index, *base_vertex, *topology)?,
        Command::DrawInstanced {
            vertex_count,
            instance_count,
            start_vertex,
            start_instance,
            topology,
        } => backend.draw_instanced(
            *vertex_count,
            *instance_count,
            *start_vertex,
            *start_instance,
            *topology,
        )?,
        Command::BeginQuery { handle } => backend.begin_query(*handle)?,
        Command::EndQuery { handle } => backend.end_query(*handle)?,
        Command::PushMarker { label } => backend.push_marker(label)?,
        Command::PopMarker => backend.pop_marker()?,
        Command::Resize { width, height } => backend.resize(*width, *height)?,
        Command::Present => return backend.present().map(Some),
        Command::Release { kind, handle } => backend.release(*kind, *handle)?,
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_and_slot_of_create() {
        let cmd = Command::CreateBuffer {
            handle: ResourceHandle(7),
            desc: BufferDesc::vertex(64),
            data: Some(vec![0u8; 64].into_boxed_slice()),
        };
        assert_eq!(cmd.opcode(), Opcode::CreateBuffer);
        assert_eq!(cmd.resource_slot(), ResourceHandle(7));
        assert_eq!(cmd.payload_len(), 64);
    }

    #[test]
    fn binding_commands_own_no_slot() {
        let cmd = Command::SetVertexBuffer {
            handle: ResourceHandle(3),
            slot: 0,
            stride: 16,
            offset: 0,
        };
        assert_eq!(cmd.resource_slot(), ResourceHandle::NULL);
        assert_eq!(cmd.payload_len(), 0);
    }

    #[test]
    fn creating_opcodes_are_flagged() {
        assert!(Opcode::CreateTexture.creates_resource());
        assert!(Opcode::CreateQuery.creates_resource());
        assert!(!Opcode::UpdateBuffer.creates_resource());
        assert!(!Opcode::Release.creates_resource());
    }

    #[test]
    fn command_serializes_to_json() {
        let cmd = Command::PushMarker {
            label: "shadow pass".into(),
        };
        let json = serde_json::to_string(&cmd).unwrap();
        assert!(json.contains("shadow pass"));
        let back: Command = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cmd);
    }
}
