//! # mesh-protocol
//!
//! A managed-flooding mesh networking stack. Messages travel through four
//! layers, each with its own PDU format:
//!
//! - **Access**: opcodes, parameters, transaction identifiers and
//!   request/response tracking
//! - **Upper transport**: AES-CCM encryption with application or device keys
//! - **Lower transport**: segmentation, reassembly, segment acknowledgment
//!   and retransmission
//! - **Network**: obfuscated, authenticated Network PDUs with replay protection
//!
//! A [`manager::Pipeline`] coordinates the layers without doing any I/O;
//! [`manager::MeshNetworkManager`] runs it on tokio and reports outcomes to a
//! [`MeshObserver`](core::MeshObserver).
//!
//! ## Feature Flags
//!
//! - `runtime` (default): the tokio network manager
//!
//! ## Example Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Instant;
//!
//! use mesh_protocol::prelude::*;
//!
//! #[derive(Default)]
//! struct Loopback;
//!
//! impl Bearer for Loopback {
//!     fn send(&self, _data: &[u8], _pdu_type: PduType) -> Result<(), BearerError> {
//!         Ok(())
//!     }
//! }
//!
//! let local = Address::new(0x0001);
//! let network = MeshNetwork::new(IvIndex::new(0), local)
//!     .with_network_key(NetworkKey::new(KeyIndex::PRIMARY, [0x11; 16]))
//!     .with_application_key(ApplicationKey::new(KeyIndex::PRIMARY, KeyIndex::PRIMARY, [0x22; 16]))
//!     .with_node(Node::new(DeviceKey::new([0x33; 16])).with_element(Element::new(local)));
//!
//! let mut pipeline = Pipeline::new(
//!     Arc::new(network),
//!     Arc::new(Loopback),
//!     NetworkParameters::default(),
//!     Box::new(MemorySequenceStore::new()),
//! );
//!
//! let message = AccessMessage::new(Opcode::new(0xC202).unwrap(), vec![0x01, 0x00]);
//! let handle = MessageHandle::from_raw(1);
//! pipeline.send(handle, SendRequest::new(message, MeshAddress::new(Address::new(0x0005))), Instant::now());
//!
//! assert!(matches!(pipeline.take_notifications()[..], [Notification::Sent { .. }]));
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

// Shared types, errors and external interfaces
pub mod core;

// Keys and primitives
pub mod crypto;

// Network configuration and sequence persistence
pub mod store;

// Layers, bottom-up
pub mod network;
pub mod lower;
pub mod upper;
pub mod access;

// Coordination
pub mod manager;

// Proxy protocol
pub mod proxy;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::core::{
        Address, Bearer, BearerError, ErrorKind, IvIndex, MeshAddress, MeshError, MeshObserver,
        MessageHandle, PduType,
    };

    pub use crate::access::{AccessMessage, MeshMessage, MessageSecurity, Opcode};
    pub use crate::crypto::{ApplicationKey, DeviceKey, KeyIndex, NetworkKey};
    pub use crate::manager::{NetworkParameters, Notification, Pipeline, SendRequest};
    pub use crate::proxy::{GattBearer, LinkWriter, ProxyConfigurationMessage};
    pub use crate::store::{
        Element, FileSequenceStore, MemorySequenceStore, MeshNetwork, Model, ModelId, Node, Publish,
        Retransmit, SequenceStore,
    };

    #[cfg(feature = "runtime")]
    pub use crate::manager::MeshNetworkManager;
}

// Re-export commonly used items at crate root
pub use core::{Address, MeshAddress, MeshError, MeshObserver, MessageHandle};

#[cfg(feature = "runtime")]
pub use manager::MeshNetworkManager;
