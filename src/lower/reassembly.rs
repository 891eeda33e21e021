//! Inbound segment reassembly.
//!
//! A session is keyed by (source, SeqZero) and is only ever extended by
//! segments agreeing on its SegN. Completed transmissions are remembered
//! per source so late duplicates can be re-acknowledged without being
//! delivered twice.

use std::collections::HashMap;
use std::time::Instant;

use tracing::trace;

use crate::core::{Address, PduError, TimerHandle};
use crate::crypto::KeyIndex;

/// What a reassembled message is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentedKind {
    /// Access message.
    Access {
        /// Application Key Flag.
        akf: bool,
        /// Application key identifier.
        aid: u8,
        /// 64-bit TransMIC flag.
        szmic: bool,
    },
    /// Control message.
    Control {
        /// Control opcode.
        opcode: u8,
    },
}

/// State of one incoming segmented transmission.
#[derive(Debug)]
pub struct ReassemblySession {
    /// Source element.
    pub src: Address,
    /// Destination.
    pub dst: Address,
    /// Full sequence number authenticating the message.
    pub seq_auth: u32,
    /// IV index of the first segment.
    pub iv_index: u32,
    /// Network key the segments arrived under.
    pub network_key_index: KeyIndex,
    /// Access or control.
    pub kind: SegmentedKind,
    /// Index of the last segment.
    pub seg_n: u8,
    /// Bit `n` set once segment `n` was received.
    pub received: u32,
    segments: Vec<Option<Vec<u8>>>,
    /// Absolute abandonment deadline.
    pub deadline: Instant,
    /// Armed incomplete timer.
    pub incomplete_timer: Option<TimerHandle>,
    /// Armed Block Ack timer.
    pub ack_timer: Option<TimerHandle>,
}

impl ReassemblySession {
    /// Start an empty session.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        src: Address,
        dst: Address,
        seq_auth: u32,
        iv_index: u32,
        network_key_index: KeyIndex,
        kind: SegmentedKind,
        seg_n: u8,
        deadline: Instant,
    ) -> Self {
        Self {
            src,
            dst,
            seq_auth,
            iv_index,
            network_key_index,
            kind,
            seg_n,
            received: 0,
            segments: vec![None; usize::from(seg_n) + 1],
            deadline,
            incomplete_timer: None,
            ack_timer: None,
        }
    }

    /// Store a segment. Returns `false` for a duplicate.
    pub fn insert(&mut self, seg_o: u8, seg_n: u8, segment: Vec<u8>) -> Result<bool, PduError> {
        if seg_n != self.seg_n {
            return Err(PduError::SegNMismatch {
                expected: self.seg_n,
                actual: seg_n,
            });
        }
        if seg_o > self.seg_n {
            return Err(PduError::SegmentOutOfRange { seg_o, seg_n });
        }
        let bit = 1u32 << seg_o;
        if self.received & bit != 0 {
            return Ok(false);
        }
        self.received |= bit;
        self.segments[usize::from(seg_o)] = Some(segment);
        Ok(true)
    }

    /// Mask with a bit for every segment of the message.
    pub fn full_mask(&self) -> u32 {
        full_mask(self.seg_n)
    }

    /// Whether every segment arrived.
    pub fn is_complete(&self) -> bool {
        self.received == self.full_mask()
    }

    /// Concatenate the segments of a complete session.
    pub fn assemble(&self) -> Vec<u8> {
        self.segments.iter().flatten().flatten().copied().collect()
    }
}

/// Block Ack mask covering segments `0..=seg_n`.
pub fn full_mask(seg_n: u8) -> u32 {
    if seg_n >= 31 {
        u32::MAX
    } else {
        (1u32 << (seg_n + 1)) - 1
    }
}

/// Largest SeqAuth not above `seq` whose low 13 bits equal `seq_zero`.
pub fn seq_auth(seq: u32, seq_zero: u16) -> Option<u32> {
    let delta = seq.wrapping_sub(u32::from(seq_zero)) & crate::core::SEQ_ZERO_MASK;
    seq.checked_sub(delta)
}

/// Last completed transmission of a source.
#[derive(Debug, Clone)]
pub struct CompletedTransmission {
    /// SeqAuth of the completed message.
    pub seq_auth: u32,
    /// Index of its last segment.
    pub seg_n: u8,
    /// Local element it was addressed to.
    pub dst: Address,
    /// Network key it arrived under.
    pub network_key_index: KeyIndex,
    /// Pending re-acknowledgment.
    pub ack_timer: Option<TimerHandle>,
}

/// Bounded reassembly table plus the per-source completed cache.
///
/// The completed cache keeps the sources that most recently finished a
/// transmission; the least recent one is evicted when it is full.
#[derive(Debug)]
pub struct ReassemblyTable {
    sessions: HashMap<(Address, u16), ReassemblySession>,
    completed: HashMap<Address, (u64, CompletedTransmission)>,
    capacity: usize,
    completed_capacity: usize,
    tick: u64,
}

impl ReassemblyTable {
    /// Table holding at most `capacity` sessions and remembering the last
    /// transmission of at most `completed_capacity` sources.
    pub fn new(capacity: usize, completed_capacity: usize) -> Self {
        Self {
            sessions: HashMap::new(),
            completed: HashMap::new(),
            capacity: capacity.max(1),
            completed_capacity: completed_capacity.max(1),
            tick: 0,
        }
    }

    /// Change both caps. Existing sessions are kept.
    pub fn set_capacity(&mut self, capacity: usize, completed_capacity: usize) {
        self.capacity = capacity.max(1);
        self.completed_capacity = completed_capacity.max(1);
    }

    /// Whether adding a session requires eviction first.
    pub fn is_full(&self) -> bool {
        self.sessions.len() >= self.capacity
    }

    /// Remove the session with the earliest deadline.
    pub fn evict_oldest(&mut self) -> Option<ReassemblySession> {
        let key = self
            .sessions
            .iter()
            .min_by_key(|(_, session)| session.deadline)
            .map(|(key, _)| *key)?;
        self.sessions.remove(&key)
    }

    /// Active session.
    pub fn get_mut(&mut self, src: Address, seq_zero: u16) -> Option<&mut ReassemblySession> {
        self.sessions.get_mut(&(src, seq_zero))
    }

    /// Active session, read-only.
    pub fn get(&self, src: Address, seq_zero: u16) -> Option<&ReassemblySession> {
        self.sessions.get(&(src, seq_zero))
    }

    /// Add a session.
    pub fn insert(&mut self, seq_zero: u16, session: ReassemblySession) {
        self.sessions.insert((session.src, seq_zero), session);
    }

    /// Remove a session.
    pub fn remove(&mut self, src: Address, seq_zero: u16) -> Option<ReassemblySession> {
        self.sessions.remove(&(src, seq_zero))
    }

    /// Number of active sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no session is active.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Last completed transmission from `src`.
    pub fn completed(&self, src: Address) -> Option<&CompletedTransmission> {
        self.completed.get(&src).map(|(_, done)| done)
    }

    /// Last completed transmission from `src`, mutable.
    pub fn completed_mut(&mut self, src: Address) -> Option<&mut CompletedTransmission> {
        self.completed.get_mut(&src).map(|(_, done)| done)
    }

    /// Number of sources in the completed cache.
    pub fn completed_len(&self) -> usize {
        self.completed.len()
    }

    /// Record a completed transmission, replacing older ones from `src`.
    ///
    /// Returns the entry evicted to make room, if any.
    pub fn mark_completed(&mut self, src: Address, completed: CompletedTransmission) -> Option<CompletedTransmission> {
        self.tick += 1;
        let mut evicted = None;
        if !self.completed.contains_key(&src) && self.completed.len() >= self.completed_capacity {
            let oldest = self
                .completed
                .iter()
                .min_by_key(|(_, (tick, _))| *tick)
                .map(|(src, _)| *src);
            if let Some(oldest) = oldest {
                trace!(src = %oldest, "Completed cache full, forgetting oldest source");
                evicted = self.completed.remove(&oldest).map(|(_, done)| done);
            }
        }
        self.completed.insert(src, (self.tick, completed));
        evicted
    }
}
