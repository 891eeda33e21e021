//! Link-level segmentation and reassembly.
//!
//! ```text
//! [ SAR (2) | PDU type (6) ] [ payload (..MTU-1) ]
//!
//! SAR: 0b00 complete, 0b01 first, 0b10 continuation, 0b11 last
//! ```
//!
//! Only one PDU is assembled at a time. A new first segment discards any
//! partial PDU; a continuation without a first segment is dropped.

use tracing::{debug, trace};

use crate::core::{MAX_LINK_PDU_SIZE, MIN_LINK_MTU, PduType};

const SAR_COMPLETE: u8 = 0b00;
const SAR_FIRST: u8 = 0b01;
const SAR_CONTINUATION: u8 = 0b10;
const SAR_LAST: u8 = 0b11;

fn header(sar: u8, pdu_type: PduType) -> u8 {
    (sar << 6) | (pdu_type.as_byte() & 0x3F)
}

#[derive(Debug)]
struct Partial {
    pdu_type: PduType,
    data: Vec<u8>,
}

/// Splits PDUs into link-sized chunks and reassembles them.
#[derive(Debug)]
pub struct ProxyProtocolHandler {
    mtu: usize,
    partial: Option<Partial>,
}

impl ProxyProtocolHandler {
    /// Handler for a link carrying at most `mtu` bytes per write.
    pub fn new(mtu: usize) -> Self {
        Self {
            mtu: mtu.max(MIN_LINK_MTU),
            partial: None,
        }
    }

    /// Link MTU.
    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Whether a partial PDU is buffered.
    pub fn is_assembling(&self) -> bool {
        self.partial.is_some()
    }

    /// Split `data` into chunks of at most MTU bytes, header included.
    pub fn segment(&self, data: &[u8], pdu_type: PduType) -> Vec<Vec<u8>> {
        let payload = self.mtu - 1;
        if data.len() <= payload {
            let mut chunk = Vec::with_capacity(1 + data.len());
            chunk.push(header(SAR_COMPLETE, pdu_type));
            chunk.extend_from_slice(data);
            return vec![chunk];
        }

        let count = data.len().div_ceil(payload);
        data.chunks(payload)
            .enumerate()
            .map(|(i, part)| {
                let sar = match i {
                    0 => SAR_FIRST,
                    i if i + 1 == count => SAR_LAST,
                    _ => SAR_CONTINUATION,
                };
                let mut chunk = Vec::with_capacity(1 + part.len());
                chunk.push(header(sar, pdu_type));
                chunk.extend_from_slice(part);
                chunk
            })
            .collect()
    }

    /// Feed one received chunk. Returns a PDU once one is complete.
    pub fn reassemble(&mut self, chunk: &[u8]) -> Option<(PduType, Vec<u8>)> {
        let (&first, payload) = chunk.split_first()?;
        let sar = first >> 6;
        let pdu_type = match PduType::from_byte(first & 0x3F) {
            Ok(pdu_type) => pdu_type,
            Err(err) => {
                trace!(%err, "Dropping link chunk");
                return None;
            }
        };

        match sar {
            SAR_COMPLETE => {
                if self.partial.take().is_some() {
                    debug!("Complete PDU discards partial link PDU");
                }
                Some((pdu_type, payload.to_vec()))
            }
            SAR_FIRST => {
                if self.partial.is_some() {
                    debug!("New first segment discards partial link PDU");
                }
                self.partial = Some(Partial {
                    pdu_type,
                    data: payload.to_vec(),
                });
                None
            }
            _ => {
                let Some(mut partial) = self.partial.take() else {
                    trace!("Continuation without first segment");
                    return None;
                };
                if partial.pdu_type != pdu_type {
                    debug!(expected = ?partial.pdu_type, actual = ?pdu_type, "PDU type changed mid-PDU");
                    return None;
                }
                if partial.data.len() + payload.len() > MAX_LINK_PDU_SIZE {
                    debug!("Link PDU too large, discarding");
                    return None;
                }
                partial.data.extend_from_slice(payload);
                if sar == SAR_LAST {
                    Some((partial.pdu_type, partial.data))
                } else {
                    debug_assert_eq!(sar, SAR_CONTINUATION);
                    self.partial = Some(partial);
                    None
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_pdu_is_complete() {
        let handler = ProxyProtocolHandler::new(20);
        let chunks = handler.segment(&[1, 2, 3], PduType::NetworkPdu);
        assert_eq!(chunks, vec![vec![0x00, 1, 2, 3]]);
    }

    #[test]
    fn test_segment_and_reassemble() {
        let data: Vec<u8> = (0..=60).collect();
        let sender = ProxyProtocolHandler::new(20);
        let chunks = sender.segment(&data, PduType::ProxyConfiguration);
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[0][0], 0x42);
        assert_eq!(chunks[1][0], 0x82);
        assert_eq!(chunks[3][0], 0xC2);
        assert!(chunks.iter().all(|chunk| chunk.len() <= 20));

        let mut receiver = ProxyProtocolHandler::new(20);
        let mut out = None;
        for chunk in &chunks {
            out = receiver.reassemble(chunk);
        }
        assert_eq!(out, Some((PduType::ProxyConfiguration, data)));
        assert!(!receiver.is_assembling());
    }

    #[test]
    fn test_last_start_wins() {
        let sender = ProxyProtocolHandler::new(4);
        let first = sender.segment(&[1, 2, 3, 4, 5, 6], PduType::NetworkPdu);
        let second = sender.segment(&[7, 8, 9, 10, 11, 12, 13], PduType::NetworkPdu);

        let mut receiver = ProxyProtocolHandler::new(4);
        assert_eq!(receiver.reassemble(&first[0]), None);
        let mut out = None;
        for chunk in &second {
            out = receiver.reassemble(chunk);
        }
        assert_eq!(out, Some((PduType::NetworkPdu, vec![7, 8, 9, 10, 11, 12, 13])));
    }

    #[test]
    fn test_continuation_while_idle_is_dropped() {
        let sender = ProxyProtocolHandler::new(4);
        let chunks = sender.segment(&[1, 2, 3, 4, 5, 6, 7], PduType::MeshBeacon);
        let mut receiver = ProxyProtocolHandler::new(4);
        assert_eq!(receiver.reassemble(&chunks[1]), None);
        assert_eq!(receiver.reassemble(&chunks[2]), None);
        assert!(!receiver.is_assembling());
    }

    #[test]
    fn test_mtu_floor() {
        let handler = ProxyProtocolHandler::new(0);
        assert_eq!(handler.mtu(), MIN_LINK_MTU);
        assert_eq!(handler.segment(&[1, 2], PduType::NetworkPdu).len(), 2);
    }
}
