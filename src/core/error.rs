//! Error types for the mesh pipeline.
//!
//! Inbound errors are never surfaced to the observer: malformed, replayed
//! and undecryptable PDUs are dropped after logging. Outbound errors reach
//! the observer as a failed send.

use thiserror::Error;

use super::traits::PduType;
use super::types::Address;

/// Malformed-input errors raised while decoding a PDU.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PduError {
    /// Input shorter than the format requires.
    #[error("pdu too short: expected at least {expected} bytes, got {actual}")]
    TooShort {
        /// Minimum size.
        expected: usize,
        /// Actual size.
        actual: usize,
    },

    /// Input longer than the format allows.
    #[error("pdu too long: at most {max} bytes allowed, got {actual}")]
    TooLong {
        /// Maximum size.
        max: usize,
        /// Actual size.
        actual: usize,
    },

    /// Opcode bytes do not follow the variable-length encoding.
    #[error("invalid opcode encoding")]
    InvalidOpcode,

    /// Segment index outside the declared segment count.
    #[error("segment {seg_o} out of range (SegN = {seg_n})")]
    SegmentOutOfRange {
        /// Segment offset.
        seg_o: u8,
        /// Last segment number.
        seg_n: u8,
    },

    /// A segment disagrees with the SegN of its reassembly session.
    #[error("SegN mismatch: session expects {expected}, segment declares {actual}")]
    SegNMismatch {
        /// SegN the session was created with.
        expected: u8,
        /// SegN carried by the segment.
        actual: u8,
    },

    /// A header field holds a value the format forbids.
    #[error("invalid field: {0}")]
    InvalidField(&'static str),

    /// Unknown PDU type byte.
    #[error("unknown pdu type: {0:#04x}")]
    UnknownPduType(u8),
}

/// Errors in the crypto layer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// AES-CCM encryption failed.
    #[error("AES-CCM encryption failed")]
    EncryptionFailed,

    /// MIC verification failed under every candidate key.
    #[error("authentication failed (no key produced a valid MIC)")]
    AuthenticationFailed,

    /// No key is available for this PDU.
    #[error("no decryption key found")]
    NoKeyFound,
}

/// Errors reported by the external bearer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BearerError {
    /// The bearer cannot carry this PDU type.
    #[error("pdu type {0:?} not supported by bearer")]
    PduTypeNotSupported(PduType),

    /// The link is closed.
    #[error("link closed")]
    LinkClosed,
}

/// Errors from configuration lookups.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Unknown network key index.
    #[error("network key {0} not found")]
    NetworkKeyNotFound(u16),

    /// Unknown application key index.
    #[error("application key {0} not found")]
    ApplicationKeyNotFound(u16),

    /// No device key for this node.
    #[error("device key for {0} not found")]
    DeviceKeyNotFound(Address),

    /// The address is not an element of the local node.
    #[error("element {0} is not local")]
    ElementNotLocal(Address),

    /// No such model on the element.
    #[error("model {model_id:#010x} not found on element {element}")]
    ModelNotFound {
        /// Element address.
        element: Address,
        /// Model identifier.
        model_id: u32,
    },

    /// The model has no publication configured.
    #[error("model {model_id:#010x} on element {element} is not published")]
    ModelNotPublished {
        /// Element address.
        element: Address,
        /// Model identifier.
        model_id: u32,
    },

    /// Key index out of the 12-bit range.
    #[error("invalid key index {0}")]
    InvalidKeyIndex(u16),

    /// Destination cannot be used for this message.
    #[error("invalid destination {0}")]
    InvalidDestination(Address),
}

/// Errors from the persistent sequence store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Stored data could not be parsed.
    #[error("corrupt store: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Classification of failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Recovered locally by retry, surfaced only once the policy is exhausted.
    Transient,
    /// Bad input, dropped silently.
    Malformed,
    /// Duplicate sequence number, dropped silently.
    Replay,
    /// Surfaced immediately without retry.
    Permanent,
}

/// Top-level pipeline errors.
#[derive(Debug, Error)]
pub enum MeshError {
    /// Malformed PDU.
    #[error("pdu error: {0}")]
    Pdu(#[from] PduError),

    /// Crypto error.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Bearer error.
    #[error("bearer error: {0}")]
    Bearer(#[from] BearerError),

    /// Configuration lookup failed.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Sequence store failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// PDU already seen.
    #[error("replay detected from {src} (seq {seq})")]
    Replay {
        /// Source address.
        src: Address,
        /// Sequence number.
        seq: u32,
    },

    /// Access PDU larger than the segmentation limit.
    #[error("message too long: {size} bytes, at most {max} allowed")]
    MessageTooLong {
        /// Access PDU size.
        size: usize,
        /// Maximum size.
        max: usize,
    },

    /// Segments were not acknowledged within the retransmission limit.
    #[error("segments not acknowledged after {attempts} transmissions")]
    RetransmissionLimitExceeded {
        /// Total transmission rounds.
        attempts: u32,
    },

    /// The receiver reported it cannot accept the segmented message.
    #[error("receiver busy")]
    ReceiverBusy,

    /// No response arrived for an acknowledged message.
    #[error("acknowledged message timed out")]
    AcknowledgmentTimeout,

    /// Incomplete segmented message abandoned.
    #[error("incomplete message timed out")]
    IncompleteTimeout,

    /// The send was cancelled by the caller.
    #[error("cancelled")]
    Cancelled,

    /// The 24-bit sequence space of a source is exhausted.
    #[error("sequence numbers exhausted for {0}")]
    SequenceExhausted(Address),

    /// The manager task is no longer running.
    #[error("network manager stopped")]
    ManagerStopped,
}

impl MeshError {
    /// Classify the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            MeshError::Pdu(_) => ErrorKind::Malformed,
            MeshError::Replay { .. } => ErrorKind::Replay,
            MeshError::Crypto(_)
            | MeshError::RetransmissionLimitExceeded { .. }
            | MeshError::AcknowledgmentTimeout
            | MeshError::IncompleteTimeout => ErrorKind::Transient,
            MeshError::Bearer(_)
            | MeshError::Config(_)
            | MeshError::Store(_)
            | MeshError::MessageTooLong { .. }
            | MeshError::ReceiverBusy
            | MeshError::Cancelled
            | MeshError::SequenceExhausted(_)
            | MeshError::ManagerStopped => ErrorKind::Permanent,
        }
    }

    /// Whether an inbound PDU failing with this error is dropped without
    /// any observer notification.
    ///
    /// Crypto failures count as "not for us".
    pub fn is_silent_drop(&self) -> bool {
        matches!(
            self,
            MeshError::Pdu(_) | MeshError::Replay { .. } | MeshError::Crypto(_)
        )
    }
}
