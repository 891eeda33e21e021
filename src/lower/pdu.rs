//! Lower Transport PDU formats.
//!
//! ```text
//! unsegmented access:   [ 0|AKF|AID(6) ] [ Upper Transport PDU (5..15) ]
//! segmented access:     [ 1|AKF|AID(6) ] [ SZMIC|SeqZero(13)|SegO(5)|SegN(5) ] [ segment (1..12) ]
//! unsegmented control:  [ 0|Opcode(7)  ] [ parameters (0..11) ]
//! segmented control:    [ 1|Opcode(7)  ] [ RFU|SeqZero(13)|SegO(5)|SegN(5) ]   [ segment (1..8) ]
//! ```

use crate::core::{
    PduError, SEGMENT_ACK_OPCODE, SEGMENTED_ACCESS_SEGMENT_SIZE, SEGMENTED_CONTROL_SEGMENT_SIZE,
    SEGMENTED_HEADER_SIZE, SEQ_ZERO_MASK, UNSEGMENTED_ACCESS_MAX_SIZE,
    UNSEGMENTED_CONTROL_MAX_SIZE,
};

/// Fields shared by segmented access and control PDUs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    /// SZMIC for access messages; reserved (zero) for control messages.
    pub szmic: bool,
    /// Low 13 bits of SeqAuth.
    pub seq_zero: u16,
    /// Index of this segment.
    pub seg_o: u8,
    /// Index of the last segment.
    pub seg_n: u8,
}

impl SegmentHeader {
    fn encode(&self) -> [u8; 3] {
        let packed = (u32::from(self.szmic) << 23)
            | ((u32::from(self.seq_zero) & SEQ_ZERO_MASK) << 10)
            | ((u32::from(self.seg_o) & 0x1F) << 5)
            | (u32::from(self.seg_n) & 0x1F);
        let bytes = packed.to_be_bytes();
        [bytes[1], bytes[2], bytes[3]]
    }

    fn decode(bytes: &[u8]) -> Result<Self, PduError> {
        let packed = u32::from_be_bytes([0, bytes[0], bytes[1], bytes[2]]);
        let header = Self {
            szmic: packed & 0x80_0000 != 0,
            seq_zero: ((packed >> 10) & SEQ_ZERO_MASK) as u16,
            seg_o: ((packed >> 5) & 0x1F) as u8,
            seg_n: (packed & 0x1F) as u8,
        };
        if header.seg_o > header.seg_n {
            return Err(PduError::SegmentOutOfRange {
                seg_o: header.seg_o,
                seg_n: header.seg_n,
            });
        }
        Ok(header)
    }
}

/// A decoded Lower Transport PDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LowerTransportPdu {
    /// Access message in a single Network PDU.
    UnsegmentedAccess {
        /// Application Key Flag.
        akf: bool,
        /// Application key identifier.
        aid: u8,
        /// Upper Transport PDU.
        upper_pdu: Vec<u8>,
    },
    /// One segment of an access message.
    SegmentedAccess {
        /// Application Key Flag.
        akf: bool,
        /// Application key identifier.
        aid: u8,
        /// Segment header.
        header: SegmentHeader,
        /// Segment payload.
        segment: Vec<u8>,
    },
    /// Control message in a single Network PDU.
    UnsegmentedControl {
        /// Control opcode.
        opcode: u8,
        /// Parameters.
        parameters: Vec<u8>,
    },
    /// One segment of a control message.
    SegmentedControl {
        /// Control opcode.
        opcode: u8,
        /// Segment header.
        header: SegmentHeader,
        /// Segment payload.
        segment: Vec<u8>,
    },
}

impl LowerTransportPdu {
    /// Parse a transport PDU carried in a Network PDU with the given CTL.
    pub fn decode(ctl: bool, data: &[u8]) -> Result<Self, PduError> {
        let first = *data.first().ok_or(PduError::TooShort {
            expected: 1,
            actual: 0,
        })?;
        let segmented = first & 0x80 != 0;

        match (ctl, segmented) {
            (false, false) => {
                let upper_pdu = data[1..].to_vec();
                if upper_pdu.is_empty() {
                    return Err(PduError::TooShort {
                        expected: 2,
                        actual: data.len(),
                    });
                }
                if upper_pdu.len() > UNSEGMENTED_ACCESS_MAX_SIZE {
                    return Err(PduError::TooLong {
                        max: UNSEGMENTED_ACCESS_MAX_SIZE + 1,
                        actual: data.len(),
                    });
                }
                Ok(Self::UnsegmentedAccess {
                    akf: first & 0x40 != 0,
                    aid: first & 0x3F,
                    upper_pdu,
                })
            }
            (false, true) => {
                let (header, segment) = Self::split_segment(data, SEGMENTED_ACCESS_SEGMENT_SIZE)?;
                Ok(Self::SegmentedAccess {
                    akf: first & 0x40 != 0,
                    aid: first & 0x3F,
                    header,
                    segment,
                })
            }
            (true, false) => {
                let parameters = data[1..].to_vec();
                if parameters.len() > UNSEGMENTED_CONTROL_MAX_SIZE {
                    return Err(PduError::TooLong {
                        max: UNSEGMENTED_CONTROL_MAX_SIZE + 1,
                        actual: data.len(),
                    });
                }
                Ok(Self::UnsegmentedControl {
                    opcode: first & 0x7F,
                    parameters,
                })
            }
            (true, true) => {
                let (header, segment) = Self::split_segment(data, SEGMENTED_CONTROL_SEGMENT_SIZE)?;
                if header.szmic {
                    return Err(PduError::InvalidField("RFU"));
                }
                Ok(Self::SegmentedControl {
                    opcode: first & 0x7F,
                    header,
                    segment,
                })
            }
        }
    }

    fn split_segment(data: &[u8], max_segment: usize) -> Result<(SegmentHeader, Vec<u8>), PduError> {
        if data.len() < SEGMENTED_HEADER_SIZE + 1 {
            return Err(PduError::TooShort {
                expected: SEGMENTED_HEADER_SIZE + 1,
                actual: data.len(),
            });
        }
        if data.len() > SEGMENTED_HEADER_SIZE + max_segment {
            return Err(PduError::TooLong {
                max: SEGMENTED_HEADER_SIZE + max_segment,
                actual: data.len(),
            });
        }
        let header = SegmentHeader::decode(&data[1..4])?;
        Ok((header, data[SEGMENTED_HEADER_SIZE..].to_vec()))
    }

    /// Serialize into transport PDU bytes.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Self::UnsegmentedAccess { akf, aid, upper_pdu } => {
                let mut out = Vec::with_capacity(1 + upper_pdu.len());
                out.push((u8::from(*akf) << 6) | (aid & 0x3F));
                out.extend_from_slice(upper_pdu);
                out
            }
            Self::SegmentedAccess {
                akf,
                aid,
                header,
                segment,
            } => {
                let mut out = Vec::with_capacity(SEGMENTED_HEADER_SIZE + segment.len());
                out.push(0x80 | (u8::from(*akf) << 6) | (aid & 0x3F));
                out.extend_from_slice(&header.encode());
                out.extend_from_slice(segment);
                out
            }
            Self::UnsegmentedControl { opcode, parameters } => {
                let mut out = Vec::with_capacity(1 + parameters.len());
                out.push(opcode & 0x7F);
                out.extend_from_slice(parameters);
                out
            }
            Self::SegmentedControl {
                opcode,
                header,
                segment,
            } => {
                let mut out = Vec::with_capacity(SEGMENTED_HEADER_SIZE + segment.len());
                out.push(0x80 | (opcode & 0x7F));
                let header = SegmentHeader {
                    szmic: false,
                    ..*header
                };
                out.extend_from_slice(&header.encode());
                out.extend_from_slice(segment);
                out
            }
        }
    }
}

/// Segment Acknowledgment control message.
///
/// ```text
/// [ OBO|SeqZero(13)|RFU(2) ] [ BlockAck (4) ]
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentAcknowledgment {
    /// Sent by a friend on behalf of a low power node.
    pub obo: bool,
    /// SeqZero of the acknowledged transmission.
    pub seq_zero: u16,
    /// Bit `n` set when segment `n` was received. Zero means busy.
    pub block_ack: u32,
}

impl SegmentAcknowledgment {
    const SIZE: usize = 6;

    /// Parse from control parameters.
    pub fn decode(parameters: &[u8]) -> Result<Self, PduError> {
        if parameters.len() != Self::SIZE {
            return Err(PduError::TooShort {
                expected: Self::SIZE,
                actual: parameters.len(),
            });
        }
        let head = u16::from_be_bytes([parameters[0], parameters[1]]);
        Ok(Self {
            obo: head & 0x8000 != 0,
            seq_zero: (head >> 2) & SEQ_ZERO_MASK as u16,
            block_ack: u32::from_be_bytes([parameters[2], parameters[3], parameters[4], parameters[5]]),
        })
    }

    /// Wrap as an unsegmented control PDU.
    pub fn to_pdu(&self) -> LowerTransportPdu {
        let head = (u16::from(self.obo) << 15) | ((self.seq_zero & SEQ_ZERO_MASK as u16) << 2);
        let mut parameters = Vec::with_capacity(Self::SIZE);
        parameters.extend_from_slice(&head.to_be_bytes());
        parameters.extend_from_slice(&self.block_ack.to_be_bytes());
        LowerTransportPdu::UnsegmentedControl {
            opcode: SEGMENT_ACK_OPCODE,
            parameters,
        }
    }
}
