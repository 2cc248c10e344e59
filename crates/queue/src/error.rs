use rhi_common::ResourceHandle;
use rhi_render::{BackendError, Opcode};
use std::time::Duration;

/// Errors surfaced to the thread that owns the queue.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("resource slot table exhausted ({capacity} slots)")]
    SlotsExhausted { capacity: usize },
    #[error("backend failed to initialize: {0}")]
    BackendInit(#[source] BackendError),
    #[error("render thread did not pick up the flush within {waited:?}")]
    RenderThreadStalled { waited: Duration },
    #[error("render thread has terminated")]
    RenderThreadGone,
    #[error("invalid queue configuration: {0}")]
    InvalidConfig(String),
    #[error("failed to spawn render thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// A record the backend could not execute.
///
/// Collected on the render thread and handed to the producer by
/// `RenderCommandQueue::take_failures`.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandFailure {
    pub opcode: Opcode,
    /// Resource slot the record targeted, `NULL` for state and draw records.
    pub handle: ResourceHandle,
    pub error: BackendError,
}

impl std::fmt::Display for CommandFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.handle.is_null() {
            write!(f, "{:?}: {}", self.opcode, self.error)
        } else {
            write!(f, "{:?} {}: {}", self.opcode, self.handle, self.error)
        }
    }
}
