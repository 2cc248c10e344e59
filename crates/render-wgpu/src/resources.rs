use rhi_common::*;
use rhi_render::{BackendError, BackendResult};
use std::sync::Arc;

/// Handle-indexed table of backend objects. The queue hands out the indices;
/// the table only checks that creates land in empty slots and lookups in
/// occupied ones.
#[derive(Debug)]
pub struct SlotTable<T> {
    entries: Vec<Option<T>>,
    live: usize,
}

impl<T> Default for SlotTable<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            live: 0,
        }
    }
}

impl<T> SlotTable<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, handle: ResourceHandle, value: T) -> BackendResult {
        if handle.is_null() {
            return Err(BackendError::misuse("create into the NULL handle"));
        }
        let index = handle.index();
        if index >= self.entries.len() {
            self.entries.resize_with(index + 1, || None);
        }
        if self.entries[index].is_some() {
            return Err(BackendError::misuse(format!("slot {handle} is already occupied")));
        }
        self.entries[index] = Some(value);
        self.live += 1;
        Ok(())
    }

    pub fn get(&self, handle: ResourceHandle) -> Option<&T> {
        self.entries.get(handle.index())?.as_ref()
    }

    pub fn get_mut(&mut self, handle: ResourceHandle) -> Option<&mut T> {
        self.entries.get_mut(handle.index())?.as_mut()
    }

    pub fn remove(&mut self, handle: ResourceHandle) -> Option<T> {
        let value = self.entries.get_mut(handle.index())?.take();
        if value.is_some() {
            self.live -= 1;
        }
        value
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (ResourceHandle, &T)> {
        self.entries
            .iter()
            .enumerate()
            .filter_map(|(i, e)| e.as_ref().map(|v| (ResourceHandle(i as u32), v)))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (ResourceHandle, &mut T)> {
        self.entries
            .iter_mut()
            .enumerate()
            .filter_map(|(i, e)| e.as_mut().map(|v| (ResourceHandle(i as u32), v)))
    }
}

pub struct BufferObject {
    pub desc: BufferDesc,
    /// Kept for rebuilding after device loss.
    pub initial: Option<Box<[u8]>>,
    pub buffer: Arc<wgpu::Buffer>,
}

pub struct TextureObject {
    pub desc: TextureDesc,
    pub initial: Option<Box<[u8]>>,
    pub texture: wgpu::Texture,
    pub view: Arc<wgpu::TextureView>,
}

pub struct ShaderObject {
    pub desc: ShaderDesc,
    pub module: Arc<wgpu::ShaderModule>,
}

pub struct RenderTargetObject {
    pub desc: RenderTargetDesc,
    pub format: wgpu::TextureFormat,
    pub texture: wgpu::Texture,
    pub view: Arc<wgpu::TextureView>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryState {
    Idle,
    Active,
    /// Ended this frame; resolved and read back at present.
    Ended,
}

pub struct QueryObject {
    pub kind: QueryKind,
    pub set: wgpu::QuerySet,
    pub resolve: wgpu::Buffer,
    pub readback: wgpu::Buffer,
    pub state: QueryState,
}

impl QueryObject {
    /// Query slots used inside the set: one for occlusion, begin and end
    /// stamps for timestamps.
    pub fn count(&self) -> u32 {
        match self.kind {
            QueryKind::Occlusion => 1,
            QueryKind::Timestamp => 2,
        }
    }
}

/// Everything a handle can name on this backend. Blend, depth-stencil and
/// input-layout objects are plain descriptors; they only take native form
/// inside cached pipelines.
pub enum Native {
    Buffer(BufferObject),
    Texture(TextureObject),
    Sampler {
        desc: SamplerDesc,
        sampler: Arc<wgpu::Sampler>,
    },
    Shader(ShaderObject),
    InputLayout(Box<[InputElement]>),
    BlendState(BlendDesc),
    DepthStencilState(DepthStencilDesc),
    RenderTarget(RenderTargetObject),
    Query(QueryObject),
}

impl Native {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Self::Buffer(_) => ResourceKind::Buffer,
            Self::Texture(_) => ResourceKind::Texture,
            Self::Sampler { .. } => ResourceKind::Sampler,
            Self::Shader(_) => ResourceKind::Shader,
            Self::InputLayout(_) => ResourceKind::InputLayout,
            Self::BlendState(_) => ResourceKind::BlendState,
            Self::DepthStencilState(_) => ResourceKind::DepthStencilState,
            Self::RenderTarget(_) => ResourceKind::RenderTarget,
            Self::Query(_) => ResourceKind::Query,
        }
    }
}

fn wrong_kind(
    handle: ResourceHandle,
    wanted: ResourceKind,
    found: Option<&Native>,
) -> BackendError {
    match found {
        Some(native) => BackendError::misuse(format!(
            "{handle} holds a {:?}, expected a {wanted:?}",
            native.kind()
        )),
        None => BackendError::misuse(format!("{handle} is empty, expected a {wanted:?}")),
    }
}

macro_rules! typed_getter {
    ($name:ident, $variant:ident, $ty:ty) => {
        pub fn $name(&self, handle: ResourceHandle) -> BackendResult<&$ty> {
            match self.get(handle) {
                Some(Native::$variant(object)) => Ok(object),
                other => Err(wrong_kind(handle, ResourceKind::$variant, other)),
            }
        }
    };
}

impl SlotTable<Native> {
    typed_getter!(buffer, Buffer, BufferObject);
    typed_getter!(texture, Texture, TextureObject);
    typed_getter!(shader, Shader, ShaderObject);
    typed_getter!(input_layout, InputLayout, Box<[InputElement]>);
    typed_getter!(blend_state, BlendState, BlendDesc);
    typed_getter!(depth_stencil_state, DepthStencilState, DepthStencilDesc);
    typed_getter!(render_target, RenderTarget, RenderTargetObject);
    typed_getter!(query, Query, QueryObject);

    pub fn sampler(
        &self,
        handle: ResourceHandle,
    ) -> BackendResult<(&SamplerDesc, &Arc<wgpu::Sampler>)> {
        match self.get(handle) {
            Some(Native::Sampler { desc, sampler }) => Ok((desc, sampler)),
            other => Err(wrong_kind(handle, ResourceKind::Sampler, other)),
        }
    }

    pub fn query_mut(&mut self, handle: ResourceHandle) -> BackendResult<&mut QueryObject> {
        match self.get_mut(handle) {
            Some(Native::Query(object)) => Ok(object),
            _ => Err(BackendError::misuse(format!("{handle} is not a live query"))),
        }
    }

    /// Removes `handle` only if it holds `kind`; anything else is left alone.
    pub fn release(&mut self, kind: ResourceKind, handle: ResourceHandle) -> BackendResult<Native> {
        match self.get(handle) {
            Some(native) if native.kind() == kind => {}
            other => return Err(wrong_kind(handle, kind, other)),
        }
        self.remove(handle)
            .ok_or_else(|| BackendError::misuse(format!("{handle} vanished during release")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_rejects_null_and_occupied() {
        let mut table = SlotTable::new();
        assert!(table.insert(ResourceHandle::NULL, 1u32).is_err());
        table.insert(ResourceHandle(5), 1u32).unwrap();
        let err = table.insert(ResourceHandle(5), 2).unwrap_err();
        assert!(err.is_misuse());
        assert_eq!(table.get(ResourceHandle(5)), Some(&1));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn remove_frees_slot_for_reuse() {
        let mut table = SlotTable::new();
        table.insert(ResourceHandle(2), "a").unwrap();
        assert_eq!(table.remove(ResourceHandle(2)), Some("a"));
        assert_eq!(table.remove(ResourceHandle(2)), None);
        assert!(table.is_empty());
        table.insert(ResourceHandle(2), "b").unwrap();
        assert_eq!(table.get(ResourceHandle(2)), Some(&"b"));
    }

    #[test]
    fn lookups_past_the_end_are_empty() {
        let table: SlotTable<u8> = SlotTable::new();
        assert!(table.get(ResourceHandle(9000)).is_none());
    }

    #[test]
    fn iter_yields_live_handles_in_order() {
        let mut table = SlotTable::new();
        for h in [7u32, 3, 11] {
            table.insert(ResourceHandle(h), h * 10).unwrap();
        }
        table.remove(ResourceHandle(3));
        let seen: Vec<_> = table.iter().map(|(h, v)| (h.0, *v)).collect();
        assert_eq!(seen, vec![(7, 70), (11, 110)]);
    }

    #[test]
    fn typed_release_checks_kind() {
        let mut table = SlotTable::new();
        table
            .insert(ResourceHandle(1), Native::BlendState(BlendDesc::default()))
            .unwrap();
        let err = table
            .release(ResourceKind::Buffer, ResourceHandle(1))
            .err()
            .unwrap();
        assert!(err.to_string().contains("BlendState"));
        assert!(table.blend_state(ResourceHandle(1)).is_ok());
        assert!(table.release(ResourceKind::BlendState, ResourceHandle(1)).is_ok());
        assert!(table.blend_state(ResourceHandle(1)).is_err());
    }
}
