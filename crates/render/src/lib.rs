//! Command records and the backend contract.
//!
//! Everything the encoder produces is a [`Command`]; everything that turns a
//! command into GPU work implements [`Backend`]. [`execute`] is the single
//! dispatch switch between the two.
//!
//! # Invariants
//! - A backend is only ever driven from one thread, in encode order.
//! - Records own their payloads; nothing in a record borrows caller memory.
//! - A backend stores native objects under the handle it is given and never
//!   allocates handles itself.

mod backend;
mod command;
mod recording;

pub use backend::{Backend, BackendError, BackendResult, PresentReport};
pub use command::{Command, Opcode, execute};
pub use recording::{CommandLog, RecordingBackend};
