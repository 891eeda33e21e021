//! Interfaces to the collaborators outside the pipeline.
//!
//! The bearer carries bytes, the observer consumes outcomes. Both are
//! supplied by the application.

use super::error::{BearerError, MeshError, PduError};
use super::types::{Address, MeshAddress};
use crate::access::{AccessMessage, MeshMessage};
use crate::network::SecureNetworkBeacon;
use crate::proxy::ProxyConfigurationMessage;

/// Type of a link-level PDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PduType {
    /// Network PDU carrying mesh messages.
    NetworkPdu = 0x00,
    /// Mesh beacon.
    MeshBeacon = 0x01,
    /// Proxy configuration message.
    ProxyConfiguration = 0x02,
    /// Provisioning PDU, not handled by the pipeline.
    ProvisioningPdu = 0x03,
}

impl PduType {
    /// Parse from the 6-bit type field.
    pub fn from_byte(byte: u8) -> Result<Self, PduError> {
        match byte {
            0x00 => Ok(Self::NetworkPdu),
            0x01 => Ok(Self::MeshBeacon),
            0x02 => Ok(Self::ProxyConfiguration),
            0x03 => Ok(Self::ProvisioningPdu),
            other => Err(PduError::UnknownPduType(other)),
        }
    }

    /// Byte value of the type field.
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

/// Outbound side of the external bearer.
///
/// Called once per Network-PDU-sized chunk from inside the manager's
/// serialization domain, so implementations must not block: queue the
/// bytes and return.
pub trait Bearer: Send + Sync {
    /// Accept `data` for transmission.
    fn send(&self, data: &[u8], pdu_type: PduType) -> Result<(), BearerError>;

    /// Whether the bearer can carry `pdu_type` at all.
    fn supports(&self, pdu_type: PduType) -> bool {
        let _ = pdu_type;
        true
    }
}

/// Receiver of pipeline outcomes.
///
/// Callbacks run on a dedicated notification task, one at a time and in
/// the order the pipeline produced them. They never run while pipeline
/// state is being mutated, so calling back into the manager is safe.
pub trait MeshObserver: Send + Sync {
    /// A message addressed to a local element was decoded.
    fn did_receive_message(&self, message: &AccessMessage, source: Address, destination: MeshAddress);

    /// An outbound message was delivered to the bearer (and, for segmented
    /// unicast messages, acknowledged by the destination).
    fn did_send_message(&self, message: &dyn MeshMessage, source: Address, destination: MeshAddress);

    /// An outbound message failed permanently.
    fn failed_to_send_message(
        &self,
        message: &dyn MeshMessage,
        source: Address,
        destination: MeshAddress,
        error: &MeshError,
    );

    /// A proxy configuration message was received.
    fn did_receive_proxy_configuration(&self, message: &ProxyConfigurationMessage, source: Address) {
        let _ = (message, source);
    }

    /// An authenticated secure network beacon was received.
    fn did_receive_beacon(&self, beacon: &SecureNetworkBeacon) {
        let _ = beacon;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pdu_type_bytes() {
        for pdu_type in [
            PduType::NetworkPdu,
            PduType::MeshBeacon,
            PduType::ProxyConfiguration,
            PduType::ProvisioningPdu,
        ] {
            assert_eq!(PduType::from_byte(pdu_type.as_byte()), Ok(pdu_type));
        }
        assert_eq!(PduType::from_byte(0x04), Err(PduError::UnknownPduType(0x04)));
    }
}
