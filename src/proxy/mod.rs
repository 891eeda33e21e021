//! Proxy protocol.
//!
//! Link segmentation for bearers whose MTU is smaller than a Network PDU,
//! proxy configuration messages, and a [`Bearer`](crate::core::Bearer)
//! built on both.

mod bearer;
mod configuration;
mod sar;

pub use bearer::{GattBearer, LinkWriter};
pub use configuration::{FilterType, ProxyConfigurationMessage};
pub use sar::ProxyProtocolHandler;
