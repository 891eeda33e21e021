//! Upper transport layer.
//!
//! Encrypts Access PDUs with an application or device key and selects the
//! candidate keys for inbound ones.

mod layer;

pub use layer::{DecryptedAccessPdu, DecryptionKey, decrypt, encrypt};
