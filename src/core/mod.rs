//! Core types, constants, errors and external interfaces.
//!
//! This module has no knowledge of any single layer; everything here is
//! shared by the whole pipeline.

mod constants;
mod error;
mod timer;
mod traits;
mod types;

pub use constants::*;
pub use error::*;
pub use timer::{TimerHandle, TimerQueue};
pub use traits::*;
pub use types::*;
