//! Outbound segmented transmissions.
//!
//! Tracks which segments the destination acknowledged and how many
//! transmission rounds were spent.

use crate::core::{
    Address, MessageHandle, SEGMENTED_ACCESS_SEGMENT_SIZE, SEQ_ZERO_MASK, TimerHandle,
};
use crate::crypto::KeyIndex;

use super::pdu::{LowerTransportPdu, SegmentHeader};
use super::reassembly::full_mask;

/// Split an Upper Transport PDU into encoded segmented access PDUs.
pub fn segment_access(akf: bool, aid: u8, szmic: bool, seq_zero: u16, upper_pdu: &[u8]) -> Vec<Vec<u8>> {
    let chunks: Vec<&[u8]> = upper_pdu.chunks(SEGMENTED_ACCESS_SEGMENT_SIZE).collect();
    let seg_n = chunks.len().saturating_sub(1) as u8;
    chunks
        .into_iter()
        .enumerate()
        .map(|(seg_o, chunk)| {
            LowerTransportPdu::SegmentedAccess {
                akf,
                aid,
                header: SegmentHeader {
                    szmic,
                    seq_zero,
                    seg_o: seg_o as u8,
                    seg_n,
                },
                segment: chunk.to_vec(),
            }
            .encode()
        })
        .collect()
}

/// A segmented message waiting for acknowledgment.
#[derive(Debug, Clone)]
pub struct OutboundTransmission {
    /// Handle of the originating send.
    pub handle: MessageHandle,
    /// Source element.
    pub src: Address,
    /// Destination.
    pub dst: Address,
    /// TTL of every segment.
    pub ttl: u8,
    /// Network key used for every segment.
    pub network_key_index: KeyIndex,
    /// Sequence number of the message.
    pub seq_auth: u32,
    /// Encoded segments, indexed by SegO.
    pub segments: Vec<Vec<u8>>,
    /// Segments acknowledged so far.
    pub acked: u32,
    /// Transmission rounds performed.
    pub transmissions: u32,
    /// Armed acknowledgment timer.
    pub ack_timer: Option<TimerHandle>,
    /// Armed transmission timer.
    pub transmission_timer: Option<TimerHandle>,
}

impl OutboundTransmission {
    /// Track a transmission that has not been sent yet.
    pub fn new(
        handle: MessageHandle,
        src: Address,
        dst: Address,
        ttl: u8,
        network_key_index: KeyIndex,
        seq_auth: u32,
        segments: Vec<Vec<u8>>,
    ) -> Self {
        Self {
            handle,
            src,
            dst,
            ttl,
            network_key_index,
            seq_auth,
            segments,
            acked: 0,
            transmissions: 0,
            ack_timer: None,
            transmission_timer: None,
        }
    }

    /// SeqZero carried in every segment.
    pub fn seq_zero(&self) -> u16 {
        (self.seq_auth & SEQ_ZERO_MASK) as u16
    }

    /// Mask with a bit for every segment.
    pub fn full_mask(&self) -> u32 {
        full_mask(self.segments.len().saturating_sub(1) as u8)
    }

    /// Whether the destination acknowledges segments at all.
    pub fn expects_ack(&self) -> bool {
        self.dst.is_unicast()
    }

    /// Record a Block Ack. Returns `true` once every segment is acknowledged.
    pub fn acknowledge(&mut self, block_ack: u32) -> bool {
        self.acked |= block_ack & self.full_mask();
        self.is_complete()
    }

    /// Whether every segment is acknowledged.
    pub fn is_complete(&self) -> bool {
        self.acked == self.full_mask()
    }

    /// Segments not acknowledged yet, with their SegO.
    pub fn unacked(&self) -> impl Iterator<Item = (usize, &Vec<u8>)> {
        let acked = self.acked;
        self.segments
            .iter()
            .enumerate()
            .filter(move |(seg_o, _)| acked & (1u32 << *seg_o) == 0)
    }

    /// Whether another retransmission round is allowed under `limit`.
    pub fn can_retransmit(&self, limit: u8) -> bool {
        self.transmissions <= u32::from(limit)
    }
}
