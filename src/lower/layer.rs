//! Lower transport layer state machine.
//!
//! Owns its timers. Every entry point returns the events the coordinator
//! has to act on: PDUs to transmit, messages to deliver upward and the
//! outcome of segmented sends.

use std::collections::HashMap;
use std::time::Instant;

use tracing::{debug, trace, warn};

use super::outbound::{OutboundTransmission, segment_access};
use super::pdu::{LowerTransportPdu, SegmentAcknowledgment};
use super::reassembly::{
    CompletedTransmission, ReassemblySession, ReassemblyTable, SegmentedKind, full_mask, seq_auth,
};
use crate::core::{
    Address, MAX_SEGMENTS, MeshError, MessageHandle, PduError, SEGMENT_ACK_OPCODE,
    SEGMENTED_ACCESS_SEGMENT_SIZE, SEGMENTED_CONTROL_SEGMENT_SIZE, SEQ_ZERO_MASK, TimerQueue,
    UNSEGMENTED_ACCESS_MAX_SIZE,
};
use crate::crypto::KeyIndex;
use crate::manager::NetworkParameters;
use crate::network::ReceivedNetworkPdu;

/// An encrypted access message handed down by the upper transport layer.
#[derive(Debug, Clone)]
pub struct OutboundAccessPdu {
    /// Send this PDU belongs to.
    pub handle: MessageHandle,
    /// Source element.
    pub src: Address,
    /// Destination.
    pub dst: Address,
    /// TTL.
    pub ttl: u8,
    /// Network key to send under.
    pub network_key_index: KeyIndex,
    /// Sequence number used in the upper transport nonce.
    pub seq: u32,
    /// Application Key Flag.
    pub akf: bool,
    /// Application key identifier.
    pub aid: u8,
    /// 64-bit TransMIC flag.
    pub szmic: bool,
    /// Send as segments even if the PDU would fit one Network PDU.
    pub segmented: bool,
    /// Upper Transport PDU.
    pub upper_pdu: Vec<u8>,
}

/// A transport PDU ready for the network layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundPdu {
    /// Send this PDU belongs to, if any.
    pub handle: Option<MessageHandle>,
    /// Source element.
    pub src: Address,
    /// Destination.
    pub dst: Address,
    /// TTL.
    pub ttl: u8,
    /// Control message flag.
    pub ctl: bool,
    /// Sequence number to use, or `None` for a fresh one.
    pub sequence: Option<u32>,
    /// Network key to send under.
    pub network_key_index: KeyIndex,
    /// Lower Transport PDU bytes.
    pub transport_pdu: Vec<u8>,
}

/// An inbound Upper Transport PDU, complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundAccessPdu {
    /// Source element.
    pub src: Address,
    /// Destination.
    pub dst: Address,
    /// Application Key Flag.
    pub akf: bool,
    /// Application key identifier.
    pub aid: u8,
    /// 64-bit TransMIC flag.
    pub szmic: bool,
    /// Sequence number of the upper transport nonce.
    pub seq_auth: u32,
    /// IV index of the upper transport nonce.
    pub iv_index: u32,
    /// Network key it arrived under.
    pub network_key_index: KeyIndex,
    /// TTL of the (first) Network PDU.
    pub ttl: u8,
    /// Upper Transport PDU.
    pub upper_pdu: Vec<u8>,
}

/// Outcome of a lower transport operation.
#[derive(Debug)]
pub enum LowerEvent {
    /// Send a PDU through the network layer.
    Transmit(OutboundPdu),
    /// An access message for the upper transport layer.
    Deliver(InboundAccessPdu),
    /// A transport control message other than Segment Acknowledgment.
    Control {
        /// Source element.
        src: Address,
        /// Destination.
        dst: Address,
        /// Control opcode.
        opcode: u8,
        /// Parameters.
        parameters: Vec<u8>,
    },
    /// A send finished at the lower transport level.
    SendCompleted(MessageHandle),
    /// A send failed permanently.
    SendFailed(MessageHandle, MeshError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LowerTimer {
    SegmentAck { src: Address, seq_zero: u16 },
    Incomplete { src: Address, seq_zero: u16 },
    SegmentRetransmission { dst: Address, seq_zero: u16 },
    SegmentTransmission { dst: Address, seq_zero: u16 },
}

/// Lower transport layer.
#[derive(Debug)]
pub struct LowerTransportLayer {
    params: NetworkParameters,
    timers: TimerQueue<LowerTimer>,
    reassembly: ReassemblyTable,
    outbound: HashMap<(Address, u16), OutboundTransmission>,
}

impl LowerTransportLayer {
    /// Create the layer.
    pub fn new(params: NetworkParameters) -> Self {
        Self {
            reassembly: ReassemblyTable::new(params.max_reassembly_sessions, params.replay_cache_capacity),
            params,
            timers: TimerQueue::new(),
            outbound: HashMap::new(),
        }
    }

    /// Replace the parameters. Running timers keep their deadlines.
    pub fn set_parameters(&mut self, params: NetworkParameters) {
        self.reassembly
            .set_capacity(params.max_reassembly_sessions, params.replay_cache_capacity);
        self.params = params;
    }

    /// Number of active reassembly sessions.
    pub fn session_count(&self) -> usize {
        self.reassembly.len()
    }

    /// Number of segmented sends waiting for acknowledgment.
    pub fn outbound_count(&self) -> usize {
        self.outbound.len()
    }

    /// Earliest timer deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    /// Send an Upper Transport PDU, segmenting it when needed.
    pub fn send(&mut self, msg: OutboundAccessPdu, now: Instant) -> Result<Vec<LowerEvent>, MeshError> {
        let segmented = msg.segmented || msg.szmic || msg.upper_pdu.len() > UNSEGMENTED_ACCESS_MAX_SIZE;

        if !segmented {
            let transport_pdu = LowerTransportPdu::UnsegmentedAccess {
                akf: msg.akf,
                aid: msg.aid,
                upper_pdu: msg.upper_pdu,
            }
            .encode();
            return Ok(vec![
                LowerEvent::Transmit(OutboundPdu {
                    handle: Some(msg.handle),
                    src: msg.src,
                    dst: msg.dst,
                    ttl: msg.ttl,
                    ctl: false,
                    sequence: Some(msg.seq),
                    network_key_index: msg.network_key_index,
                    transport_pdu,
                }),
                LowerEvent::SendCompleted(msg.handle),
            ]);
        }

        let max = MAX_SEGMENTS * SEGMENTED_ACCESS_SEGMENT_SIZE;
        if msg.upper_pdu.len() > max {
            return Err(MeshError::MessageTooLong {
                size: msg.upper_pdu.len(),
                max,
            });
        }

        let seq_zero = (msg.seq & SEQ_ZERO_MASK) as u16;
        let segments = segment_access(msg.akf, msg.aid, msg.szmic, seq_zero, &msg.upper_pdu);
        let mut transmission = OutboundTransmission::new(
            msg.handle,
            msg.src,
            msg.dst,
            msg.ttl,
            msg.network_key_index,
            msg.seq,
            segments,
        );
        debug!(
            handle = %msg.handle,
            src = %msg.src,
            dst = %msg.dst,
            seq_zero,
            segments = transmission.segments.len(),
            "Sending segmented message"
        );

        let mut events = Self::transmit_round(&transmission, true);
        transmission.transmissions = 1;

        if transmission.expects_ack() {
            let deadline = now + self.params.acknowledgment_timer(transmission.ttl);
            transmission.ack_timer = Some(self.timers.arm(
                deadline,
                LowerTimer::SegmentRetransmission {
                    dst: transmission.dst,
                    seq_zero,
                },
            ));
            if let Some(previous) = self.outbound.insert((transmission.dst, seq_zero), transmission) {
                self.disarm_outbound(&previous);
            }
        } else {
            events.push(LowerEvent::SendCompleted(msg.handle));
        }
        Ok(events)
    }

    /// Stop a segmented send. Returns `false` if nothing was in flight.
    pub fn cancel(&mut self, handle: MessageHandle) -> bool {
        let key = self
            .outbound
            .iter()
            .find(|(_, t)| t.handle == handle)
            .map(|(key, _)| *key);
        match key.and_then(|key| self.outbound.remove(&key)) {
            Some(transmission) => {
                self.disarm_outbound(&transmission);
                debug!(%handle, "Segmented send cancelled");
                true
            }
            None => false,
        }
    }

    /// Process a Network PDU addressed to a local destination.
    pub fn receive(&mut self, received: &ReceivedNetworkPdu, now: Instant) -> Result<Vec<LowerEvent>, MeshError> {
        let net = &received.pdu;
        let pdu = LowerTransportPdu::decode(net.ctl, &net.transport_pdu)?;

        match pdu {
            LowerTransportPdu::UnsegmentedAccess { akf, aid, upper_pdu } => {
                Ok(vec![LowerEvent::Deliver(InboundAccessPdu {
                    src: net.src,
                    dst: net.dst,
                    akf,
                    aid,
                    szmic: false,
                    seq_auth: net.seq,
                    iv_index: received.iv_index,
                    network_key_index: received.network_key_index,
                    ttl: net.ttl,
                    upper_pdu,
                })])
            }
            LowerTransportPdu::UnsegmentedControl { opcode, parameters } => {
                if opcode == SEGMENT_ACK_OPCODE {
                    let ack = SegmentAcknowledgment::decode(&parameters)?;
                    Ok(self.on_segment_ack(net.src, net.dst, ack))
                } else {
                    Ok(vec![LowerEvent::Control {
                        src: net.src,
                        dst: net.dst,
                        opcode,
                        parameters,
                    }])
                }
            }
            LowerTransportPdu::SegmentedAccess {
                akf,
                aid,
                header,
                segment,
            } => self.on_segment(
                received,
                SegmentedKind::Access {
                    akf,
                    aid,
                    szmic: header.szmic,
                },
                header.seq_zero,
                header.seg_o,
                header.seg_n,
                segment,
                now,
            ),
            LowerTransportPdu::SegmentedControl {
                opcode,
                header,
                segment,
            } => self.on_segment(
                received,
                SegmentedKind::Control { opcode },
                header.seq_zero,
                header.seg_o,
                header.seg_n,
                segment,
                now,
            ),
        }
    }

    /// Fire every timer due at `now`.
    pub fn poll_timers(&mut self, now: Instant) -> Vec<LowerEvent> {
        let mut events = Vec::new();
        while let Some(timer) = self.timers.pop_expired(now) {
            match timer {
                LowerTimer::SegmentAck { src, seq_zero } => self.on_ack_timer(src, seq_zero, &mut events),
                LowerTimer::Incomplete { src, seq_zero } => {
                    if let Some(session) = self.reassembly.remove(src, seq_zero) {
                        if let Some(handle) = session.ack_timer {
                            self.timers.cancel(handle);
                        }
                        debug!(
                            %src,
                            seq_zero,
                            received = session.received,
                            "Incomplete segmented message abandoned"
                        );
                    }
                }
                LowerTimer::SegmentRetransmission { dst, seq_zero } => {
                    self.on_retransmission_timer(dst, seq_zero, now, &mut events)
                }
                LowerTimer::SegmentTransmission { dst, seq_zero } => {
                    if let Some(transmission) = self.outbound.remove(&(dst, seq_zero)) {
                        warn!(
                            handle = %transmission.handle,
                            %dst,
                            seq_zero,
                            attempts = transmission.transmissions,
                            "Segments not acknowledged"
                        );
                        events.push(LowerEvent::SendFailed(
                            transmission.handle,
                            MeshError::RetransmissionLimitExceeded {
                                attempts: transmission.transmissions,
                            },
                        ));
                    }
                }
            }
        }
        events
    }

    fn transmit_round(transmission: &OutboundTransmission, first: bool) -> Vec<LowerEvent> {
        transmission
            .unacked()
            .map(|(seg_o, segment)| {
                LowerEvent::Transmit(OutboundPdu {
                    handle: Some(transmission.handle),
                    src: transmission.src,
                    dst: transmission.dst,
                    ttl: transmission.ttl,
                    ctl: false,
                    // The first segment of the first round reuses the message SEQ.
                    sequence: (first && seg_o == 0).then_some(transmission.seq_auth),
                    network_key_index: transmission.network_key_index,
                    transport_pdu: segment.clone(),
                })
            })
            .collect()
    }

    fn disarm_outbound(&mut self, transmission: &OutboundTransmission) {
        if let Some(handle) = transmission.ack_timer {
            self.timers.cancel(handle);
        }
        if let Some(handle) = transmission.transmission_timer {
            self.timers.cancel(handle);
        }
    }

    fn on_segment_ack(&mut self, src: Address, dst: Address, ack: SegmentAcknowledgment) -> Vec<LowerEvent> {
        let key = (src, ack.seq_zero);
        let Some(transmission) = self.outbound.get_mut(&key) else {
            trace!(%src, seq_zero = ack.seq_zero, "Segment ack for unknown transmission");
            return Vec::new();
        };
        if transmission.src != dst {
            return Vec::new();
        }

        if ack.block_ack == 0 {
            let handle = transmission.handle;
            if let Some(transmission) = self.outbound.remove(&key) {
                self.disarm_outbound(&transmission);
            }
            warn!(%handle, %src, "Receiver busy");
            return vec![LowerEvent::SendFailed(handle, MeshError::ReceiverBusy)];
        }

        if transmission.acknowledge(ack.block_ack) {
            let handle = transmission.handle;
            if let Some(transmission) = self.outbound.remove(&key) {
                self.disarm_outbound(&transmission);
            }
            debug!(%handle, %src, "Segmented message acknowledged");
            return vec![LowerEvent::SendCompleted(handle)];
        }

        trace!(%src, block_ack = ack.block_ack, "Partial segment ack");
        Vec::new()
    }

    fn on_retransmission_timer(&mut self, dst: Address, seq_zero: u16, now: Instant, events: &mut Vec<LowerEvent>) {
        let Some(transmission) = self.outbound.get_mut(&(dst, seq_zero)) else {
            return;
        };
        transmission.ack_timer = None;

        if transmission.can_retransmit(self.params.retransmission_limit) {
            debug!(
                handle = %transmission.handle,
                %dst,
                seq_zero,
                round = transmission.transmissions + 1,
                "Retransmitting unacknowledged segments"
            );
            events.extend(Self::transmit_round(transmission, false));
            transmission.transmissions += 1;
            let deadline = now + self.params.acknowledgment_timer(transmission.ttl);
            transmission.ack_timer = Some(
                self.timers
                    .arm(deadline, LowerTimer::SegmentRetransmission { dst, seq_zero }),
            );
        } else {
            let deadline = now + self.params.transmission_timer(transmission.ttl);
            transmission.transmission_timer = Some(
                self.timers
                    .arm(deadline, LowerTimer::SegmentTransmission { dst, seq_zero }),
            );
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn on_segment(
        &mut self,
        received: &ReceivedNetworkPdu,
        kind: SegmentedKind,
        seq_zero: u16,
        seg_o: u8,
        seg_n: u8,
        segment: Vec<u8>,
        now: Instant,
    ) -> Result<Vec<LowerEvent>, MeshError> {
        let net = &received.pdu;
        let src = net.src;

        if usize::from(seg_n) + 1 > self.params.max_segments {
            return Err(PduError::InvalidField("SegN").into());
        }
        let segment_size = match kind {
            SegmentedKind::Access { .. } => SEGMENTED_ACCESS_SEGMENT_SIZE,
            SegmentedKind::Control { .. } => SEGMENTED_CONTROL_SEGMENT_SIZE,
        };
        if seg_o < seg_n && segment.len() != segment_size {
            return Err(PduError::InvalidField("segment length").into());
        }
        let seq_auth = seq_auth(net.seq, seq_zero).ok_or(PduError::InvalidField("SeqZero"))?;

        if let Some(done) = self.reassembly.completed_mut(src) {
            if done.seq_auth == seq_auth {
                if done.dst.is_unicast() && done.ack_timer.is_none() {
                    let deadline = now + self.params.block_ack_delay();
                    done.ack_timer = Some(self.timers.arm(deadline, LowerTimer::SegmentAck { src, seq_zero }));
                }
                trace!(%src, seq_zero, "Segment of completed message, re-acknowledging");
                return Ok(Vec::new());
            }
            if seq_auth < done.seq_auth {
                trace!(%src, seq_zero, "Segment of an older message");
                return Ok(Vec::new());
            }
        }

        if let Some(existing) = self.reassembly.get(src, seq_zero) {
            if existing.seq_auth > seq_auth {
                return Ok(Vec::new());
            }
            if existing.seq_auth < seq_auth {
                if let Some(stale) = self.reassembly.remove(src, seq_zero) {
                    self.disarm_session(&stale);
                }
            }
        }

        if self.reassembly.get(src, seq_zero).is_none() {
            if self.reassembly.is_full() {
                if let Some(evicted) = self.reassembly.evict_oldest() {
                    debug!(src = %evicted.src, "Reassembly table full, evicting oldest session");
                    self.disarm_session(&evicted);
                }
            }
            let session = ReassemblySession::new(
                src,
                net.dst,
                seq_auth,
                received.iv_index,
                received.network_key_index,
                kind,
                seg_n,
                now + self.params.incomplete_message_timeout,
            );
            self.reassembly.insert(seq_zero, session);
            trace!(%src, seq_zero, seg_n, "Reassembly started");
        }

        let Some(session) = self.reassembly.get_mut(src, seq_zero) else {
            return Ok(Vec::new());
        };
        if !session.insert(seg_o, seg_n, segment)? {
            return Ok(Vec::new());
        }

        if let Some(handle) = session.incomplete_timer.take() {
            self.timers.cancel(handle);
        }

        if session.is_complete() {
            let mut ack_timer = session.ack_timer;
            if session.dst.is_unicast() && ack_timer.is_none() {
                let deadline = now + self.params.block_ack_delay();
                ack_timer = Some(self.timers.arm(deadline, LowerTimer::SegmentAck { src, seq_zero }));
            }
            let Some(session) = self.reassembly.remove(src, seq_zero) else {
                return Ok(Vec::new());
            };
            let evicted = self.reassembly.mark_completed(
                src,
                CompletedTransmission {
                    seq_auth: session.seq_auth,
                    seg_n: session.seg_n,
                    dst: session.dst,
                    network_key_index: session.network_key_index,
                    ack_timer,
                },
            );
            if let Some(handle) = evicted.and_then(|done| done.ack_timer) {
                self.timers.cancel(handle);
            }
            debug!(%src, seq_zero, segments = usize::from(session.seg_n) + 1, "Segmented message reassembled");

            let payload = session.assemble();
            let event = match session.kind {
                SegmentedKind::Access { akf, aid, szmic } => LowerEvent::Deliver(InboundAccessPdu {
                    src,
                    dst: session.dst,
                    akf,
                    aid,
                    szmic,
                    seq_auth: session.seq_auth,
                    iv_index: session.iv_index,
                    network_key_index: session.network_key_index,
                    ttl: net.ttl,
                    upper_pdu: payload,
                }),
                SegmentedKind::Control { opcode } => LowerEvent::Control {
                    src,
                    dst: session.dst,
                    opcode,
                    parameters: payload,
                },
            };
            return Ok(vec![event]);
        }

        session.deadline = now + self.params.incomplete_message_timeout;
        session.incomplete_timer = Some(
            self.timers
                .arm(session.deadline, LowerTimer::Incomplete { src, seq_zero }),
        );
        if session.dst.is_unicast() && session.ack_timer.is_none() {
            let deadline = now + self.params.block_ack_delay();
            session.ack_timer = Some(self.timers.arm(deadline, LowerTimer::SegmentAck { src, seq_zero }));
        }
        Ok(Vec::new())
    }

    fn disarm_session(&mut self, session: &ReassemblySession) {
        if let Some(handle) = session.incomplete_timer {
            self.timers.cancel(handle);
        }
        if let Some(handle) = session.ack_timer {
            self.timers.cancel(handle);
        }
    }

    fn on_ack_timer(&mut self, src: Address, seq_zero: u16, events: &mut Vec<LowerEvent>) {
        let ack = if let Some(session) = self.reassembly.get_mut(src, seq_zero) {
            session.ack_timer = None;
            Some((session.dst, session.network_key_index, session.received))
        } else if let Some(done) = self.reassembly.completed_mut(src) {
            if (done.seq_auth & SEQ_ZERO_MASK) as u16 == seq_zero {
                done.ack_timer = None;
                Some((done.dst, done.network_key_index, full_mask(done.seg_n)))
            } else {
                None
            }
        } else {
            None
        };

        let Some((local, network_key_index, block_ack)) = ack else {
            return;
        };
        if !local.is_unicast() {
            return;
        }

        trace!(%src, seq_zero, block_ack, "Sending segment ack");
        let transport_pdu = SegmentAcknowledgment {
            obo: false,
            seq_zero,
            block_ack,
        }
        .to_pdu()
        .encode();
        events.push(LowerEvent::Transmit(OutboundPdu {
            handle: None,
            src: local,
            dst: src,
            ttl: self.params.default_ttl,
            ctl: true,
            sequence: None,
            network_key_index,
            transport_pdu,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::NetworkPdu;
    use std::time::Duration;

    const LOCAL: Address = Address::new(0x0001);
    const PEER: Address = Address::new(0x0002);

    fn params() -> NetworkParameters {
        NetworkParameters::builder()
            .block_ack_delay(Duration::from_millis(50), Duration::ZERO)
            .build()
    }

    fn access(handle: u64, dst: Address, len: usize, seq: u32) -> OutboundAccessPdu {
        OutboundAccessPdu {
            handle: MessageHandle::from_raw(handle),
            src: LOCAL,
            dst,
            ttl: 5,
            network_key_index: KeyIndex::PRIMARY,
            seq,
            akf: true,
            aid: 0x11,
            szmic: false,
            segmented: false,
            upper_pdu: (0..len).map(|i| i as u8).collect(),
        }
    }

    fn as_received(pdu: &OutboundPdu, seq: u32) -> ReceivedNetworkPdu {
        ReceivedNetworkPdu {
            pdu: NetworkPdu {
                ctl: pdu.ctl,
                ttl: pdu.ttl,
                seq,
                src: pdu.src,
                dst: pdu.dst,
                transport_pdu: pdu.transport_pdu.clone(),
            },
            network_key_index: pdu.network_key_index,
            iv_index: 0,
        }
    }

    fn transmits(events: &[LowerEvent]) -> Vec<OutboundPdu> {
        events
            .iter()
            .filter_map(|event| match event {
                LowerEvent::Transmit(pdu) => Some(pdu.clone()),
                _ => None,
            })
            .collect()
    }

    /// Feed transmitted PDUs into a receiver, assigning sequence numbers.
    fn deliver(
        receiver: &mut LowerTransportLayer,
        pdus: &[OutboundPdu],
        next_seq: &mut u32,
        now: Instant,
    ) -> Vec<LowerEvent> {
        let mut events = Vec::new();
        for pdu in pdus {
            let seq = pdu.sequence.unwrap_or_else(|| {
                *next_seq += 1;
                *next_seq
            });
            events.extend(receiver.receive(&as_received(pdu, seq), now).unwrap());
        }
        events
    }

    #[test]
    fn test_unsegmented_send() {
        let mut layer = LowerTransportLayer::new(params());
        let events = layer.send(access(1, PEER, 10, 7), Instant::now()).unwrap();
        assert_eq!(events.len(), 2);
        let pdus = transmits(&events);
        assert_eq!(pdus[0].sequence, Some(7));
        assert!(matches!(events[1], LowerEvent::SendCompleted(_)));
        assert_eq!(layer.outbound_count(), 0);
    }

    #[test]
    fn test_segmented_roundtrip_all_sizes() {
        let now = Instant::now();
        for len in 1..=MAX_SEGMENTS * SEGMENTED_ACCESS_SEGMENT_SIZE {
            let mut sender = LowerTransportLayer::new(params());
            let mut receiver = LowerTransportLayer::new(params());
            let mut msg = access(1, PEER, len, 100);
            msg.segmented = true;
            let expected = msg.upper_pdu.clone();

            let pdus = transmits(&sender.send(msg, now).unwrap());
            let mut seq = 100;
            let events = deliver(&mut receiver, &pdus, &mut seq, now);
            let delivered: Vec<_> = events
                .iter()
                .filter_map(|event| match event {
                    LowerEvent::Deliver(pdu) => Some(pdu),
                    _ => None,
                })
                .collect();
            assert_eq!(delivered.len(), 1, "size {len}");
            assert_eq!(delivered[0].upper_pdu, expected, "size {len}");
            assert_eq!(delivered[0].seq_auth, 100);
            assert_eq!(receiver.session_count(), 0);
        }
    }

    #[test]
    fn test_block_ack_completes_send() {
        let now = Instant::now();
        let mut sender = LowerTransportLayer::new(params());
        let mut receiver = LowerTransportLayer::new(params());

        let pdus = transmits(&sender.send(access(9, PEER, 40, 500), now).unwrap());
        assert_eq!(pdus.len(), 4);
        assert_eq!(sender.outbound_count(), 1);

        let mut seq = 500;
        deliver(&mut receiver, &pdus, &mut seq, now);
        let acks = transmits(&receiver.poll_timers(now + Duration::from_millis(50)));
        assert_eq!(acks.len(), 1);
        assert!(acks[0].ctl);
        assert_eq!(acks[0].dst, LOCAL);

        let mut ack = as_received(&acks[0], 1);
        ack.pdu.src = PEER;
        let events = sender.receive(&ack, now).unwrap();
        assert!(matches!(events[..], [LowerEvent::SendCompleted(h)] if h == MessageHandle::from_raw(9)));
        assert_eq!(sender.outbound_count(), 0);
        assert!(sender.next_deadline().is_none());
    }

    #[test]
    fn test_retransmission_limit() {
        let start = Instant::now();
        let mut layer = LowerTransportLayer::new(params());
        let first = transmits(&layer.send(access(3, PEER, 20, 1), start).unwrap());
        assert_eq!(first.len(), 2);

        let mut rounds = 1;
        let mut failure = None;
        let mut now = start;
        while let Some(deadline) = layer.next_deadline() {
            now = deadline;
            for event in layer.poll_timers(now) {
                match event {
                    LowerEvent::Transmit(pdu) if pdu.transport_pdu == first[0].transport_pdu => rounds += 1,
                    LowerEvent::SendFailed(handle, err) => failure = Some((handle, err)),
                    _ => {}
                }
            }
        }

        assert_eq!(rounds, 3);
        let (handle, err) = failure.unwrap();
        assert_eq!(handle, MessageHandle::from_raw(3));
        assert!(matches!(err, MeshError::RetransmissionLimitExceeded { attempts: 3 }));
        // 150+250 ms per ack round, then the 200+250 ms transmission timer.
        assert_eq!(now - start, Duration::from_millis(400 * 3 + 450));
    }

    #[test]
    fn test_partial_ack_retransmits_only_missing() {
        let now = Instant::now();
        let mut layer = LowerTransportLayer::new(params());
        let seq = 0x2005;
        layer.send(access(4, PEER, 30, seq), now).unwrap();

        let ack = SegmentAcknowledgment {
            obo: false,
            seq_zero: (seq & SEQ_ZERO_MASK) as u16,
            block_ack: 0b101,
        };
        let ack_pdu = OutboundPdu {
            handle: None,
            src: PEER,
            dst: LOCAL,
            ttl: 5,
            ctl: true,
            sequence: None,
            network_key_index: KeyIndex::PRIMARY,
            transport_pdu: ack.to_pdu().encode(),
        };
        assert!(layer.receive(&as_received(&ack_pdu, 1), now).unwrap().is_empty());

        let deadline = layer.next_deadline().unwrap();
        let resent = transmits(&layer.poll_timers(deadline));
        assert_eq!(resent.len(), 1);
        match LowerTransportPdu::decode(false, &resent[0].transport_pdu).unwrap() {
            LowerTransportPdu::SegmentedAccess { header, .. } => assert_eq!(header.seg_o, 1),
            other => panic!("unexpected pdu {other:?}"),
        }
    }

    #[test]
    fn test_busy_receiver_fails_send() {
        let now = Instant::now();
        let mut layer = LowerTransportLayer::new(params());
        layer.send(access(5, PEER, 30, 10), now).unwrap();

        let busy = OutboundPdu {
            handle: None,
            src: PEER,
            dst: LOCAL,
            ttl: 5,
            ctl: true,
            sequence: None,
            network_key_index: KeyIndex::PRIMARY,
            transport_pdu: SegmentAcknowledgment {
                obo: false,
                seq_zero: 10,
                block_ack: 0,
            }
            .to_pdu()
            .encode(),
        };
        let events = layer.receive(&as_received(&busy, 1), now).unwrap();
        assert!(matches!(events[..], [LowerEvent::SendFailed(_, MeshError::ReceiverBusy)]));
        assert_eq!(layer.outbound_count(), 0);
    }

    #[test]
    fn test_group_send_completes_immediately() {
        let mut layer = LowerTransportLayer::new(params());
        let events = layer.send(access(6, Address::new(0xC000), 40, 1), Instant::now()).unwrap();
        assert_eq!(transmits(&events).len(), 4);
        assert!(matches!(events.last(), Some(LowerEvent::SendCompleted(_))));
        assert!(layer.next_deadline().is_none());
    }

    #[test]
    fn test_cancel_disarms_timers() {
        let mut layer = LowerTransportLayer::new(params());
        layer.send(access(7, PEER, 40, 1), Instant::now()).unwrap();
        assert!(layer.cancel(MessageHandle::from_raw(7)));
        assert!(!layer.cancel(MessageHandle::from_raw(7)));
        assert_eq!(layer.outbound_count(), 0);
        assert!(layer.next_deadline().is_none());
    }

    #[test]
    fn test_incomplete_session_times_out() {
        let now = Instant::now();
        let mut sender = LowerTransportLayer::new(params());
        let mut receiver = LowerTransportLayer::new(params());
        let pdus = transmits(&sender.send(access(8, PEER, 40, 1), now).unwrap());

        let mut seq = 1;
        deliver(&mut receiver, &pdus[..2], &mut seq, now);
        assert_eq!(receiver.session_count(), 1);

        let acks = transmits(&receiver.poll_timers(now + Duration::from_millis(50)));
        assert_eq!(acks.len(), 1);

        receiver.poll_timers(now + Duration::from_secs(11));
        assert_eq!(receiver.session_count(), 0);
        assert!(receiver.next_deadline().is_none());
    }

    #[test]
    fn test_duplicate_after_completion_is_reacked_not_redelivered() {
        let now = Instant::now();
        let mut sender = LowerTransportLayer::new(params());
        let mut receiver = LowerTransportLayer::new(params());
        let pdus = transmits(&sender.send(access(10, PEER, 30, 40), now).unwrap());

        let mut seq = 40;
        let first = deliver(&mut receiver, &pdus, &mut seq, now);
        assert_eq!(first.iter().filter(|e| matches!(e, LowerEvent::Deliver(_))).count(), 1);
        receiver.poll_timers(now + Duration::from_millis(50));

        let again = deliver(&mut receiver, &pdus[1..2], &mut seq, now + Duration::from_secs(1));
        assert!(again.is_empty());
        let acks = transmits(&receiver.poll_timers(now + Duration::from_secs(2)));
        assert_eq!(acks.len(), 1);
    }

    #[test]
    fn test_oversized_seg_n_dropped() {
        let mut params = params();
        params.max_segments = 4;
        let mut receiver = LowerTransportLayer::new(params);
        let mut sender = LowerTransportLayer::new(NetworkParameters::default());
        let pdus = transmits(&sender.send(access(11, PEER, 100, 1), Instant::now()).unwrap());

        let err = receiver.receive(&as_received(&pdus[0], 1), Instant::now()).unwrap_err();
        assert!(err.is_silent_drop());
        assert_eq!(receiver.session_count(), 0);
    }

    #[test]
    fn test_session_cap_evicts_oldest() {
        let mut params = params();
        params.max_reassembly_sessions = 2;
        let mut receiver = LowerTransportLayer::new(params);
        let start = Instant::now();

        for (i, src) in [0x0010u16, 0x0011, 0x0012].iter().enumerate() {
            let mut sender = LowerTransportLayer::new(NetworkParameters::default());
            let pdus = transmits(&sender.send(access(1, PEER, 40, 1), start).unwrap());
            let mut first = as_received(&pdus[0], 1);
            first.pdu.src = Address::new(*src);
            receiver
                .receive(&first, start + Duration::from_millis(i as u64))
                .unwrap();
        }
        assert_eq!(receiver.session_count(), 2);
    }
}
