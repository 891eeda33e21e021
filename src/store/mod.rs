//! Configuration store and sequence persistence.
//!
//! - [`MeshNetwork`]: keys, IV index, elements, models and publications
//! - [`SequenceStore`]: durable sequence number reservations

mod network;
mod sequence;

pub use network::*;
pub use sequence::*;
