//! Security layer.
//!
//! Implements the cryptographic building blocks used by the pipeline:
//! - AES-CCM encryption with 32- or 64-bit MICs
//! - AES-CMAC key derivation (`s1`, `k1`..`k4`)
//! - Nonce construction for every nonce type
//! - Network, application and device keys with key refresh

mod keys;
mod nonce;
mod primitives;

pub use keys::*;
pub use nonce::*;
pub use primitives::*;
