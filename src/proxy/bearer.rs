//! [`Bearer`] over a link with a small MTU.

use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::trace;

use super::sar::ProxyProtocolHandler;
use crate::core::{Bearer, BearerError, DEFAULT_LINK_MTU, PduType};

/// Raw write side of a link, e.g. a GATT characteristic.
pub trait LinkWriter: Send + Sync {
    /// Write one chunk of at most [`mtu`](Self::mtu) bytes.
    fn write(&self, chunk: &[u8]) -> Result<(), BearerError>;

    /// Largest chunk the link accepts.
    fn mtu(&self) -> usize {
        DEFAULT_LINK_MTU
    }
}

/// A bearer segmenting PDUs for a [`LinkWriter`].
///
/// Inbound chunks are passed to [`receive`](Self::receive); every complete
/// PDU it returns goes to the network manager's `handle_incoming`.
#[derive(Debug)]
pub struct GattBearer<W> {
    writer: W,
    handler: Mutex<ProxyProtocolHandler>,
}

impl<W: LinkWriter> GattBearer<W> {
    /// Wrap a link writer.
    pub fn new(writer: W) -> Self {
        let mtu = writer.mtu();
        Self {
            writer,
            handler: Mutex::new(ProxyProtocolHandler::new(mtu)),
        }
    }

    /// The wrapped writer.
    pub fn writer(&self) -> &W {
        &self.writer
    }

    /// Feed a chunk read from the link.
    pub fn receive(&self, chunk: &[u8]) -> Option<(PduType, Vec<u8>)> {
        self.handler().reassemble(chunk)
    }

    fn handler(&self) -> MutexGuard<'_, ProxyProtocolHandler> {
        self.handler.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<W: LinkWriter> Bearer for GattBearer<W> {
    fn send(&self, data: &[u8], pdu_type: PduType) -> Result<(), BearerError> {
        if !self.supports(pdu_type) {
            return Err(BearerError::PduTypeNotSupported(pdu_type));
        }
        let chunks = self.handler().segment(data, pdu_type);
        trace!(?pdu_type, len = data.len(), chunks = chunks.len(), "Writing to link");
        for chunk in &chunks {
            self.writer.write(chunk)?;
        }
        Ok(())
    }

    fn supports(&self, pdu_type: PduType) -> bool {
        pdu_type != PduType::ProvisioningPdu
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        chunks: Mutex<Vec<Vec<u8>>>,
        closed: bool,
    }

    impl LinkWriter for Recorder {
        fn write(&self, chunk: &[u8]) -> Result<(), BearerError> {
            if self.closed {
                return Err(BearerError::LinkClosed);
            }
            self.chunks.lock().unwrap().push(chunk.to_vec());
            Ok(())
        }

        fn mtu(&self) -> usize {
            10
        }
    }

    #[test]
    fn test_send_then_receive() {
        let tx = GattBearer::new(Recorder::default());
        let rx = GattBearer::new(Recorder::default());
        let pdu: Vec<u8> = (0..29).collect();
        tx.send(&pdu, PduType::NetworkPdu).unwrap();

        let chunks = tx.writer().chunks.lock().unwrap().clone();
        assert_eq!(chunks.len(), 4);
        let mut out = None;
        for chunk in &chunks {
            out = rx.receive(chunk);
        }
        assert_eq!(out, Some((PduType::NetworkPdu, pdu)));
    }

    #[test]
    fn test_errors() {
        let bearer = GattBearer::new(Recorder::default());
        assert_eq!(
            bearer.send(&[0], PduType::ProvisioningPdu),
            Err(BearerError::PduTypeNotSupported(PduType::ProvisioningPdu))
        );

        let closed = GattBearer::new(Recorder {
            closed: true,
            ..Default::default()
        });
        assert_eq!(closed.send(&[0], PduType::NetworkPdu), Err(BearerError::LinkClosed));
    }
}
