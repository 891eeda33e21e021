//! Sequence number allocation and persistence.
//!
//! Sequence numbers are handed out from blocks reserved in a
//! [`SequenceStore`]. The store records the first value that may be used
//! after a restart, so numbers handed out after a restart are always
//! greater than any number used before it, even if the process died in the
//! middle of a block.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::{Address, MeshError, SEQUENCE_MAX, SEQUENCE_RESERVATION_BLOCK, StoreError};

/// Durable record of the next usable sequence number per source.
pub trait SequenceStore: Send {
    /// Value reserved for `source`, if any was ever saved.
    fn load(&mut self, source: Address) -> Result<Option<u32>, StoreError>;

    /// Record that every value below `next` may have been used.
    fn save(&mut self, source: Address, next: u32) -> Result<(), StoreError>;
}

/// In-memory store, lost on restart.
#[derive(Debug, Default, Clone)]
pub struct MemorySequenceStore {
    values: HashMap<Address, u32>,
}

impl MemorySequenceStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl SequenceStore for MemorySequenceStore {
    fn load(&mut self, source: Address) -> Result<Option<u32>, StoreError> {
        Ok(self.values.get(&source).copied())
    }

    fn save(&mut self, source: Address, next: u32) -> Result<(), StoreError> {
        self.values.insert(source, next);
        Ok(())
    }
}

/// Sequence file content.
#[derive(Serialize, Deserialize, Debug, Default)]
struct SequenceState {
    sources: BTreeMap<u16, u32>,
}

/// JSON file store.
#[derive(Debug)]
pub struct FileSequenceStore {
    path: PathBuf,
    state: SequenceState,
}

impl FileSequenceStore {
    /// Open the store at `path`, creating it on first save.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let state = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            serde_json::from_str(&content)?
        } else {
            SequenceState::default()
        };
        debug!(path = %path.display(), sources = state.sources.len(), "Opened sequence store");
        Ok(Self { path, state })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(&self.state)?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl SequenceStore for FileSequenceStore {
    fn load(&mut self, source: Address) -> Result<Option<u32>, StoreError> {
        Ok(self.state.sources.get(&source.value()).copied())
    }

    fn save(&mut self, source: Address, next: u32) -> Result<(), StoreError> {
        self.state.sources.insert(source.value(), next);
        self.flush()
    }
}

#[derive(Debug, Clone, Copy)]
struct Counter {
    next: u32,
    reserved_until: u32,
}

/// Hands out strictly increasing 24-bit sequence numbers per source.
pub struct SequenceAllocator {
    store: Box<dyn SequenceStore>,
    counters: HashMap<Address, Counter>,
}

impl SequenceAllocator {
    /// Allocate from `store`.
    pub fn new(store: Box<dyn SequenceStore>) -> Self {
        Self {
            store,
            counters: HashMap::new(),
        }
    }

    /// Next sequence number for `source`.
    pub fn next(&mut self, source: Address) -> Result<u32, MeshError> {
        let mut counter = match self.counters.get(&source) {
            Some(counter) => *counter,
            None => {
                let start = self.store.load(source)?.unwrap_or(0);
                Counter {
                    next: start,
                    reserved_until: start,
                }
            }
        };

        if counter.next > SEQUENCE_MAX {
            warn!(%source, "Sequence numbers exhausted");
            return Err(MeshError::SequenceExhausted(source));
        }

        if counter.next >= counter.reserved_until {
            let until = counter
                .next
                .saturating_add(SEQUENCE_RESERVATION_BLOCK)
                .min(SEQUENCE_MAX + 1);
            self.store.save(source, until)?;
            counter.reserved_until = until;
            debug!(%source, until, "Reserved sequence block");
        }

        let seq = counter.next;
        counter.next += 1;
        self.counters.insert(source, counter);
        Ok(seq)
    }

    /// Next value [`next`](Self::next) would return, without consuming it.
    pub fn peek(&self, source: Address) -> Option<u32> {
        self.counters.get(&source).map(|counter| counter.next)
    }
}

impl std::fmt::Debug for SequenceAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequenceAllocator")
            .field("sources", &self.counters.len())
            .finish_non_exhaustive()
    }
}
