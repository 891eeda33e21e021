//! Network layer.
//!
//! Encrypts and obfuscates Network PDUs, selects the network key and IV
//! index for inbound traffic, rejects replays and authenticates secure
//! network beacons.

mod beacon;
mod layer;
mod pdu;
mod replay;

pub use beacon::SecureNetworkBeacon;
pub use layer::{NetworkLayer, ReceivedNetworkPdu};
pub use pdu::{NetworkPdu, NetworkPduKind, peek_ivi_nid};
pub use replay::{ReplayCache, ReplayWindow};
