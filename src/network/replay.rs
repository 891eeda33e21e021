//! Replay protection.
//!
//! One entry per source: the IV index it last used and a sliding window
//! over its sequence numbers. PDUs from an older IV index, below the
//! window, or already marked in the window are rejected. The number of
//! tracked sources is bounded; the least recently used entry is evicted.

use std::collections::HashMap;

use tracing::trace;

use crate::core::{Address, MeshError, REPLAY_WINDOW_SIZE};

/// Anti-replay sliding window over one source's sequence numbers.
///
/// Bit `n` of the bitmap marks `highest - n` as seen.
#[derive(Debug, Clone, Default)]
pub struct ReplayWindow {
    bitmap: u64,
    highest: u32,
    initialized: bool,
}

impl ReplayWindow {
    /// Create an empty window.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if a sequence number is a replay (without updating).
    pub fn is_replay(&self, seq: u32) -> bool {
        if !self.initialized || seq > self.highest {
            return false;
        }
        let diff = self.highest - seq;
        if diff >= REPLAY_WINDOW_SIZE {
            return true;
        }
        self.bitmap & (1 << diff) != 0
    }

    /// Mark `seq` as seen. Returns `false` if it was a replay.
    pub fn check_and_update(&mut self, seq: u32) -> bool {
        if !self.initialized {
            self.highest = seq;
            self.bitmap = 1;
            self.initialized = true;
            return true;
        }

        if seq > self.highest {
            let shift = seq - self.highest;
            self.bitmap = if shift >= REPLAY_WINDOW_SIZE {
                0
            } else {
                self.bitmap << shift
            };
            self.highest = seq;
            self.bitmap |= 1;
            return true;
        }

        if self.is_replay(seq) {
            return false;
        }
        self.bitmap |= 1 << (self.highest - seq);
        true
    }

    /// Highest sequence number accepted.
    pub fn highest(&self) -> Option<u32> {
        self.initialized.then_some(self.highest)
    }
}

#[derive(Debug, Clone)]
struct Entry {
    iv_index: u32,
    window: ReplayWindow,
    last_used: u64,
}

/// Bounded per-source replay cache.
#[derive(Debug)]
pub struct ReplayCache {
    entries: HashMap<Address, Entry>,
    capacity: usize,
    tick: u64,
}

impl ReplayCache {
    /// Cache tracking at most `capacity` sources.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            capacity: capacity.max(1),
            tick: 0,
        }
    }

    /// Whether `(src, seq, iv_index)` was already accepted.
    pub fn is_replay(&self, src: Address, seq: u32, iv_index: u32) -> bool {
        match self.entries.get(&src) {
            None => false,
            Some(entry) if iv_index < entry.iv_index => true,
            Some(entry) if iv_index > entry.iv_index => false,
            Some(entry) => entry.window.is_replay(seq),
        }
    }

    /// Accept `(src, seq, iv_index)`, or reject it as a replay.
    pub fn check_and_update(&mut self, src: Address, seq: u32, iv_index: u32) -> Result<(), MeshError> {
        if self.is_replay(src, seq, iv_index) {
            trace!(%src, seq, iv_index, "Replay rejected");
            return Err(MeshError::Replay { src, seq });
        }

        self.tick += 1;
        let tick = self.tick;
        if !self.entries.contains_key(&src) && self.entries.len() >= self.capacity {
            self.evict_oldest();
        }

        let entry = self.entries.entry(src).or_insert_with(|| Entry {
            iv_index,
            window: ReplayWindow::new(),
            last_used: tick,
        });
        if iv_index > entry.iv_index {
            entry.iv_index = iv_index;
            entry.window = ReplayWindow::new();
        }
        entry.window.check_and_update(seq);
        entry.last_used = tick;
        Ok(())
    }

    /// Number of tracked sources.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no source is tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_used)
            .map(|(src, _)| *src);
        if let Some(src) = oldest {
            trace!(%src, "Evicting replay entry");
            self.entries.remove(&src);
        }
    }
}
