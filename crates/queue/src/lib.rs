//! Deferred command submission: a single producer encodes GPU work into a
//! ring, a dedicated render thread replays it on a [`rhi_render::Backend`].
//!
//! # Invariants
//! - Records execute exactly once, in encode order.
//! - `flush` returns once the render thread has snapshotted the stream,
//!   not once it has executed it.
//! - Unread records are never overwritten; exceeding the ring between two
//!   flushes panics.
//! - Handle `0` is never allocated; releasing a dead handle is a no-op.

mod config;
mod dispatch;
mod encoder;
mod error;
mod queue;
mod ring;
mod semaphore;
mod slots;
mod stats;

pub use config::QueueConfig;
pub use error::{CommandFailure, QueueError};
pub use queue::RenderCommandQueue;
pub use ring::{RingConsumer, RingProducer, ring};
pub use semaphore::Semaphore;
pub use slots::SlotAllocator;
pub use stats::{DispatchStats, DrainTimer};
