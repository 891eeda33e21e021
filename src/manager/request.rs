//! Outbound send requests.

use std::sync::Arc;

use crate::access::MeshMessage;
use crate::core::{Address, MeshAddress};
use crate::crypto::KeyIndex;

/// Everything the pipeline needs to send one message.
///
/// ```
/// use mesh_protocol::prelude::*;
///
/// let message = AccessMessage::new(Opcode::new(0xC402).unwrap(), vec![0x01, 0x00]);
/// let request = SendRequest::new(message, MeshAddress::new(Address::new(0x0005)))
///     .with_application_key(KeyIndex::PRIMARY)
///     .with_ttl(3);
/// assert_eq!(request.ttl, Some(3));
/// ```
#[derive(Debug, Clone)]
pub struct SendRequest {
    /// The message.
    pub message: Arc<dyn MeshMessage>,
    /// Local source element; the primary element when `None`.
    pub source: Option<Address>,
    /// Destination.
    pub destination: MeshAddress,
    /// Application key, for messages not using a device key.
    pub application_key: Option<KeyIndex>,
    /// TTL; the configured default when `None`.
    pub ttl: Option<u8>,
    /// Reuse the previous transaction identifier.
    pub retransmit: bool,
}

impl SendRequest {
    /// Request sending `message` to `destination`.
    pub fn new(message: impl MeshMessage + 'static, destination: MeshAddress) -> Self {
        Self::from_shared(Arc::new(message), destination)
    }

    /// Request sending an already shared message.
    pub fn from_shared(message: Arc<dyn MeshMessage>, destination: MeshAddress) -> Self {
        Self {
            message,
            source: None,
            destination,
            application_key: None,
            ttl: None,
            retransmit: false,
        }
    }

    /// Send from a specific local element.
    pub fn from_element(mut self, source: Address) -> Self {
        self.source = Some(source);
        self
    }

    /// Encrypt with an application key.
    pub fn with_application_key(mut self, index: KeyIndex) -> Self {
        self.application_key = Some(index);
        self
    }

    /// Override the TTL.
    pub fn with_ttl(mut self, ttl: u8) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Mark as a retransmission of an earlier send.
    pub fn retransmitted(mut self) -> Self {
        self.retransmit = true;
        self
    }
}
