//! Coordinating manager.
//!
//! - [`Pipeline`]: the layers wired together, driven synchronously
//! - [`MeshNetworkManager`]: tokio actor around a pipeline (`runtime` feature)
//! - [`NetworkParameters`]: timers and limits
//! - [`PublicationSchedule`]: publication retransmissions

#[cfg(feature = "runtime")]
mod network_manager;
mod parameters;
mod pipeline;
mod publication;
mod request;

#[cfg(feature = "runtime")]
#[cfg_attr(docsrs, doc(cfg(feature = "runtime")))]
pub use network_manager::{MeshNetworkManager, MeshNetworkManagerBuilder};
pub use parameters::{NetworkParameters, NetworkParametersBuilder};
pub use pipeline::{Notification, Pipeline};
pub use publication::PublicationSchedule;
pub use request::SendRequest;
