//! Access layer.
//!
//! Opcodes, messages and the bookkeeping of acknowledged sends. The
//! application-level response timeout lives here, independent of the
//! segment timers of the lower transport layer.

mod layer;
mod message;
mod opcode;

pub use layer::{AccessLayer, OutstandingSend};
pub use message::{AccessMessage, MeshMessage, MessageSecurity};
pub use opcode::Opcode;
