//! Access messages.
//!
//! ```text
//! Access PDU = [ opcode (1..3) ] [ parameters ]
//! ```

use std::fmt;

use super::opcode::Opcode;
use crate::core::PduError;

/// TransMIC size requested for segmented messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MessageSecurity {
    /// 32-bit TransMIC.
    #[default]
    Low,
    /// 64-bit TransMIC when the message is segmented.
    High,
}

/// A message the access layer can send.
///
/// Implemented by [`AccessMessage`] and by application types that build
/// their parameters on demand.
pub trait MeshMessage: fmt::Debug + Send + Sync {
    /// Opcode.
    fn opcode(&self) -> Opcode;

    /// Encoded parameters.
    fn parameters(&self) -> Vec<u8>;

    /// Requested TransMIC size.
    fn security(&self) -> MessageSecurity {
        MessageSecurity::Low
    }

    /// Send segmented even if the message would fit unsegmented.
    fn is_segmented(&self) -> bool {
        false
    }

    /// Opcode of the expected response. Messages that have one are
    /// acknowledged.
    fn response_opcode(&self) -> Option<Opcode> {
        None
    }

    /// Whether the message is encrypted with a device key.
    fn uses_device_key(&self) -> bool {
        false
    }

    /// Position of the transaction identifier byte in the parameters.
    fn transaction_id_index(&self) -> Option<usize> {
        None
    }

    /// Whether a response is expected.
    fn is_acknowledged(&self) -> bool {
        self.response_opcode().is_some()
    }

    /// Opcode followed by the parameters.
    fn access_pdu(&self) -> Vec<u8> {
        let mut pdu = self.opcode().to_bytes();
        pdu.extend_from_slice(&self.parameters());
        pdu
    }
}

/// A message with fixed parameters.
///
/// Inbound messages are always decoded into this type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessMessage {
    opcode: Opcode,
    parameters: Vec<u8>,
    security: MessageSecurity,
    segmented: bool,
    response_opcode: Option<Opcode>,
    device_key: bool,
    transaction_id_index: Option<usize>,
}

impl AccessMessage {
    /// Unacknowledged message with application key security.
    pub fn new(opcode: Opcode, parameters: impl Into<Vec<u8>>) -> Self {
        Self {
            opcode,
            parameters: parameters.into(),
            security: MessageSecurity::Low,
            segmented: false,
            response_opcode: None,
            device_key: false,
            transaction_id_index: None,
        }
    }

    /// Parse an Access PDU.
    pub fn decode(access_pdu: &[u8]) -> Result<Self, PduError> {
        let (opcode, len) = Opcode::decode(access_pdu)?;
        Ok(Self::new(opcode, &access_pdu[len..]))
    }

    /// Expect a response with `opcode`.
    pub fn acknowledged(mut self, opcode: Opcode) -> Self {
        self.response_opcode = Some(opcode);
        self
    }

    /// Request the 64-bit TransMIC.
    pub fn with_security(mut self, security: MessageSecurity) -> Self {
        self.security = security;
        self
    }

    /// Always send segmented.
    pub fn segmented(mut self) -> Self {
        self.segmented = true;
        self
    }

    /// Encrypt with a device key.
    pub fn with_device_key(mut self) -> Self {
        self.device_key = true;
        self
    }

    /// Mark the byte at `index` of the parameters as a transaction
    /// identifier maintained by the access layer.
    pub fn with_transaction_id(mut self, index: usize) -> Self {
        self.transaction_id_index = Some(index);
        self
    }

    /// Parameters as received or built.
    pub fn parameter_bytes(&self) -> &[u8] {
        &self.parameters
    }
}

impl MeshMessage for AccessMessage {
    fn opcode(&self) -> Opcode {
        self.opcode
    }

    fn parameters(&self) -> Vec<u8> {
        self.parameters.clone()
    }

    fn security(&self) -> MessageSecurity {
        self.security
    }

    fn is_segmented(&self) -> bool {
        self.segmented
    }

    fn response_opcode(&self) -> Option<Opcode> {
        self.response_opcode
    }

    fn uses_device_key(&self) -> bool {
        self.device_key
    }

    fn transaction_id_index(&self) -> Option<usize> {
        self.transaction_id_index
    }
}
