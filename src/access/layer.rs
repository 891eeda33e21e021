//! Access layer: Access PDU construction, transaction identifiers and the
//! table of acknowledged sends waiting for their response.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use super::message::MeshMessage;
use super::opcode::Opcode;
use crate::core::{
    Address, MAX_SEGMENTS, MAX_TRANSACTION_PEERS, MeshAddress, MeshError, MessageHandle,
    SEGMENTED_ACCESS_SEGMENT_SIZE, TimerHandle, TimerQueue,
};
use crate::crypto::MicSize;

/// An acknowledged send waiting for its response.
#[derive(Debug, Clone)]
pub struct OutstandingSend {
    /// Local element that sent the request.
    pub src: Address,
    /// Destination of the request.
    pub dst: MeshAddress,
    /// Opcode the response must carry.
    pub response_opcode: Opcode,
    timer: TimerHandle,
}

/// Access layer state.
#[derive(Debug)]
pub struct AccessLayer {
    timeout: Duration,
    timers: TimerQueue<MessageHandle>,
    outstanding: HashMap<MessageHandle, OutstandingSend>,
    transaction_ids: HashMap<(Address, Address), (u64, u8)>,
    transaction_capacity: usize,
    tick: u64,
}

impl AccessLayer {
    /// Create the layer with the response timeout of acknowledged sends.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            timers: TimerQueue::new(),
            outstanding: HashMap::new(),
            transaction_ids: HashMap::new(),
            transaction_capacity: MAX_TRANSACTION_PEERS,
            tick: 0,
        }
    }

    /// Change the response timeout for sends started from now on.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Build the Access PDU of an outbound message.
    ///
    /// A message with a transaction identifier gets a fresh TID per
    /// (source, destination) pair, or the previous one when `retransmit`
    /// is set. Only the most recently used pairs are remembered.
    pub fn encode(
        &mut self,
        message: &dyn MeshMessage,
        src: Address,
        dst: Address,
        retransmit: bool,
        mic: MicSize,
    ) -> Result<Vec<u8>, MeshError> {
        let mut pdu = message.access_pdu();

        let max = MAX_SEGMENTS * SEGMENTED_ACCESS_SEGMENT_SIZE - mic.len();
        if pdu.len() > max {
            return Err(MeshError::MessageTooLong { size: pdu.len(), max });
        }

        if let Some(index) = message.transaction_id_index() {
            let position = message.opcode().len() + index;
            if let Some(slot) = pdu.get_mut(position) {
                self.tick += 1;
                let key = (src, dst);
                if !self.transaction_ids.contains_key(&key) && self.transaction_ids.len() >= self.transaction_capacity {
                    self.evict_oldest_transaction();
                }
                let (last_used, tid) = self.transaction_ids.entry(key).or_insert((self.tick, *slot));
                *last_used = self.tick;
                if !retransmit {
                    *tid = tid.wrapping_add(1);
                }
                *slot = *tid;
                trace!(%src, %dst, tid = *tid, retransmit, "Transaction identifier assigned");
            }
        }
        Ok(pdu)
    }

    fn evict_oldest_transaction(&mut self) {
        let oldest = self
            .transaction_ids
            .iter()
            .min_by_key(|(_, (last_used, _))| *last_used)
            .map(|(key, _)| *key);
        if let Some((src, dst)) = oldest {
            trace!(%src, %dst, "Forgetting transaction identifier");
            self.transaction_ids.remove(&(src, dst));
        }
    }

    /// Start waiting for the response to an acknowledged send.
    pub fn track(&mut self, handle: MessageHandle, message: &dyn MeshMessage, src: Address, dst: MeshAddress, now: Instant) {
        let Some(response_opcode) = message.response_opcode() else {
            return;
        };
        let timer = self.timers.arm(now + self.timeout, handle);
        if let Some(previous) = self.outstanding.insert(
            handle,
            OutstandingSend {
                src,
                dst,
                response_opcode,
                timer,
            },
        ) {
            self.timers.cancel(previous.timer);
        }
    }

    /// Whether `handle` is still waiting for a response.
    pub fn is_outstanding(&self, handle: MessageHandle) -> bool {
        self.outstanding.contains_key(&handle)
    }

    /// Number of sends waiting for a response.
    pub fn outstanding_count(&self) -> usize {
        self.outstanding.len()
    }

    /// Match an inbound message against the outstanding sends.
    ///
    /// A response resolves the oldest send from `dst` to `src` expecting
    /// `opcode`. Sends to group or virtual addresses accept a response from
    /// any source.
    pub fn on_response(&mut self, src: Address, dst: Address, opcode: Opcode) -> Option<(MessageHandle, OutstandingSend)> {
        let handle = self
            .outstanding
            .iter()
            .filter(|(_, send)| {
                send.response_opcode == opcode
                    && send.src == dst
                    && (!send.dst.address().is_unicast() || send.dst.address() == src)
            })
            .map(|(handle, _)| *handle)
            .min()?;
        let send = self.resolve(handle)?;
        debug!(%handle, %src, %opcode, "Response received");
        Some((handle, send))
    }

    /// Stop waiting for a response. Used for cancellation and failures.
    pub fn resolve(&mut self, handle: MessageHandle) -> Option<OutstandingSend> {
        let send = self.outstanding.remove(&handle)?;
        self.timers.cancel(send.timer);
        Some(send)
    }

    /// Earliest response deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    /// Sends whose response did not arrive in time.
    pub fn poll_timers(&mut self, now: Instant) -> Vec<(MessageHandle, OutstandingSend)> {
        let mut expired = Vec::new();
        while let Some(handle) = self.timers.pop_expired(now) {
            if let Some(send) = self.outstanding.remove(&handle) {
                debug!(%handle, dst = %send.dst, "No response to acknowledged message");
                expired.push((handle, send));
            }
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::AccessMessage;

    const LOCAL: Address = Address::new(0x0001);
    const PEER: Address = Address::new(0x0002);

    fn op(value: u32) -> Opcode {
        Opcode::new(value).unwrap()
    }

    fn get() -> AccessMessage {
        AccessMessage::new(op(0xC401), vec![0x00]).acknowledged(op(0x04))
    }

    #[test]
    fn test_transaction_ids() {
        let mut layer = AccessLayer::new(Duration::from_secs(30));
        let message = AccessMessage::new(op(0xC402), vec![0x01, 0x00]).with_transaction_id(1);

        let first = layer.encode(&message, LOCAL, PEER, false, MicSize::Small).unwrap();
        let second = layer.encode(&message, LOCAL, PEER, false, MicSize::Small).unwrap();
        let again = layer.encode(&message, LOCAL, PEER, true, MicSize::Small).unwrap();
        assert_eq!(first[3], 1);
        assert_eq!(second[3], 2);
        assert_eq!(again[3], 2);

        let other = layer.encode(&message, LOCAL, Address::new(0xC000), false, MicSize::Small).unwrap();
        assert_eq!(other[3], 1);
    }

    #[test]
    fn test_transaction_ids_are_bounded() {
        let mut layer = AccessLayer::new(Duration::from_secs(30));
        layer.transaction_capacity = 2;
        let message = AccessMessage::new(op(0xC402), vec![0x01, 0x00]).with_transaction_id(1);

        for dst in 1..=100u16 {
            layer.encode(&message, LOCAL, Address::new(dst), false, MicSize::Small).unwrap();
        }
        assert_eq!(layer.transaction_ids.len(), 2);

        // The most recent pairs keep counting; forgotten ones restart.
        let recent = layer.encode(&message, LOCAL, Address::new(100), false, MicSize::Small).unwrap();
        assert_eq!(recent[3], 2);
        let forgotten = layer.encode(&message, LOCAL, Address::new(1), false, MicSize::Small).unwrap();
        assert_eq!(forgotten[3], 1);
        assert_eq!(layer.transaction_ids.len(), 2);
    }

    #[test]
    fn test_size_limit_depends_on_mic() {
        let mut layer = AccessLayer::new(Duration::from_secs(30));
        let message = AccessMessage::new(op(0x01), vec![0u8; 379]);
        assert!(layer.encode(&message, LOCAL, PEER, false, MicSize::Small).is_ok());
        assert!(matches!(
            layer.encode(&message, LOCAL, PEER, false, MicSize::Large),
            Err(MeshError::MessageTooLong { size: 380, max: 376 })
        ));
    }

    #[test]
    fn test_response_resolves_send() {
        let now = Instant::now();
        let mut layer = AccessLayer::new(Duration::from_secs(30));
        let handle = MessageHandle::from_raw(1);
        layer.track(handle, &get(), LOCAL, MeshAddress::new(PEER), now);
        assert!(layer.is_outstanding(handle));

        assert!(layer.on_response(Address::new(0x0003), LOCAL, op(0x04)).is_none());
        assert!(layer.on_response(PEER, LOCAL, op(0x05)).is_none());

        let (resolved, send) = layer.on_response(PEER, LOCAL, op(0x04)).unwrap();
        assert_eq!(resolved, handle);
        assert_eq!(send.dst, MeshAddress::new(PEER));
        assert_eq!(layer.outstanding_count(), 0);
        assert!(layer.next_deadline().is_none());
    }

    #[test]
    fn test_unacknowledged_not_tracked() {
        let mut layer = AccessLayer::new(Duration::from_secs(30));
        let message = AccessMessage::new(op(0x01), vec![]);
        layer.track(MessageHandle::from_raw(1), &message, LOCAL, MeshAddress::new(PEER), Instant::now());
        assert_eq!(layer.outstanding_count(), 0);
    }

    #[test]
    fn test_timeout() {
        let now = Instant::now();
        let mut layer = AccessLayer::new(Duration::from_secs(30));
        layer.track(MessageHandle::from_raw(1), &get(), LOCAL, MeshAddress::new(PEER), now);
        layer.track(MessageHandle::from_raw(2), &get(), LOCAL, MeshAddress::new(PEER), now + Duration::from_secs(5));

        assert!(layer.poll_timers(now + Duration::from_secs(29)).is_empty());
        let expired = layer.poll_timers(now + Duration::from_secs(30));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].0, MessageHandle::from_raw(1));
        assert!(layer.resolve(MessageHandle::from_raw(2)).is_some());
        assert!(layer.poll_timers(now + Duration::from_secs(60)).is_empty());
    }
}
