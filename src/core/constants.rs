//! Protocol constants for the mesh pipeline.
//!
//! Sizes and field widths are fixed by the wire format and MUST NOT be
//! changed. Timing values are defaults and floors; the effective values
//! come from [`NetworkParameters`](crate::manager::NetworkParameters).

use std::time::Duration;

// =============================================================================
// KEYS AND CRYPTOGRAPHY
// =============================================================================

/// Size of every mesh key (NetKey, AppKey, DevKey).
pub const KEY_SIZE: usize = 16;

/// AES-CCM nonce size used by every layer.
pub const NONCE_SIZE: usize = 13;

/// Size of a label UUID for virtual addresses.
pub const LABEL_UUID_SIZE: usize = 16;

/// Largest valid key index (12 bits on the wire).
pub const MAX_KEY_INDEX: u16 = 0x0FFF;

/// NetMIC size for access messages (CTL = 0).
pub const NET_MIC_SIZE_ACCESS: usize = 4;

/// NetMIC size for control messages (CTL = 1).
pub const NET_MIC_SIZE_CONTROL: usize = 8;

/// TransMIC size for unsegmented and low-security segmented messages.
pub const TRANS_MIC_SIZE_SMALL: usize = 4;

/// TransMIC size for high-security segmented messages (SZMIC = 1).
pub const TRANS_MIC_SIZE_LARGE: usize = 8;

// =============================================================================
// NONCE TYPES
// =============================================================================

/// Network nonce type.
pub const NONCE_TYPE_NETWORK: u8 = 0x00;

/// Application nonce type.
pub const NONCE_TYPE_APPLICATION: u8 = 0x01;

/// Device nonce type.
pub const NONCE_TYPE_DEVICE: u8 = 0x02;

/// Proxy nonce type.
pub const NONCE_TYPE_PROXY: u8 = 0x03;

// =============================================================================
// NETWORK PDU
// =============================================================================

/// Network PDU header size (IVI/NID, CTL/TTL, SEQ, SRC, DST).
pub const NETWORK_HEADER_SIZE: usize = 9;

/// Largest Network PDU on an advertising-style bearer.
pub const NETWORK_PDU_MAX_SIZE: usize = 29;

/// Smallest decodable Network PDU (header + 1 byte transport + NetMIC).
pub const NETWORK_PDU_MIN_SIZE: usize = NETWORK_HEADER_SIZE + 1 + NET_MIC_SIZE_ACCESS;

/// Largest sequence number (24 bits).
pub const SEQUENCE_MAX: u32 = 0x00FF_FFFF;

/// Largest TTL value carried in the header (7 bits).
pub const TTL_MAX: u8 = 127;

/// Smallest TTL the manager will use for outbound messages.
pub const TTL_MIN_OUTBOUND: u8 = 2;

/// Default TTL for outbound messages.
pub const DEFAULT_TTL: u8 = 5;

// =============================================================================
// LOWER TRANSPORT
// =============================================================================

/// Largest Upper Transport PDU that fits an unsegmented access message.
pub const UNSEGMENTED_ACCESS_MAX_SIZE: usize = 15;

/// Segment payload size for segmented access messages.
pub const SEGMENTED_ACCESS_SEGMENT_SIZE: usize = 12;

/// Largest parameter block of an unsegmented control message.
pub const UNSEGMENTED_CONTROL_MAX_SIZE: usize = 11;

/// Segment payload size for segmented control messages.
pub const SEGMENTED_CONTROL_SEGMENT_SIZE: usize = 8;

/// Segmented lower transport header size.
pub const SEGMENTED_HEADER_SIZE: usize = 4;

/// Maximum number of segments (SegN is 5 bits).
pub const MAX_SEGMENTS: usize = 32;

/// Mask for the 13-bit SeqZero field.
pub const SEQ_ZERO_MASK: u32 = 0x1FFF;

/// Segment Acknowledgment control opcode.
pub const SEGMENT_ACK_OPCODE: u8 = 0x00;

/// Largest Access PDU (32 segments of 12 bytes minus the small TransMIC).
pub const MAX_ACCESS_PDU_SIZE: usize =
    MAX_SEGMENTS * SEGMENTED_ACCESS_SEGMENT_SIZE - TRANS_MIC_SIZE_SMALL;

// =============================================================================
// TIMING
// =============================================================================

/// Base of the sender acknowledgment timer.
pub const ACK_TIMER_BASE: Duration = Duration::from_millis(150);

/// Base of the sender transmission timer.
pub const TRANSMISSION_TIMER_BASE: Duration = Duration::from_millis(200);

/// Per-hop addition to both sender timers.
pub const TIMER_PER_HOP: Duration = Duration::from_millis(50);

/// Minimum lifetime of an incomplete reassembly session.
pub const MIN_INCOMPLETE_TIMEOUT: Duration = Duration::from_secs(10);

/// Minimum time to wait for an acknowledged message's response.
pub const MIN_ACK_MESSAGE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default delay before a receiver returns a Block Acknowledgment.
pub const DEFAULT_BLOCK_ACK_DELAY: Duration = Duration::from_millis(50);

/// Default upper bound of the random jitter added to the Block Ack delay.
pub const DEFAULT_BLOCK_ACK_JITTER: Duration = Duration::from_millis(20);

/// Largest accepted Block Ack jitter.
pub const MAX_BLOCK_ACK_JITTER: Duration = Duration::from_millis(100);

/// Default number of segment retransmission rounds.
pub const DEFAULT_RETRANSMISSION_LIMIT: u8 = 2;

/// Largest accepted segment retransmission limit.
pub const MAX_RETRANSMISSION_LIMIT: u8 = 8;

// =============================================================================
// CACHES
// =============================================================================

/// Default cap on concurrent reassembly sessions.
pub const DEFAULT_MAX_REASSEMBLY_SESSIONS: usize = 16;

/// Default number of sources tracked by the replay cache.
pub const DEFAULT_REPLAY_CACHE_CAPACITY: usize = 256;

/// (source, destination) pairs whose last transaction identifier is kept.
pub const MAX_TRANSACTION_PEERS: usize = 256;

/// Width of the per-source out-of-order acceptance window.
pub const REPLAY_WINDOW_SIZE: u32 = 64;

/// Sequence numbers reserved per persistence write.
pub const SEQUENCE_RESERVATION_BLOCK: u32 = 32;

// =============================================================================
// LINK SEGMENTATION
// =============================================================================

/// Smallest usable link MTU (header byte + one payload byte).
pub const MIN_LINK_MTU: usize = 2;

/// Default link MTU for a GATT-style link (ATT MTU 23 minus 3).
pub const DEFAULT_LINK_MTU: usize = 20;

/// Largest PDU the link reassembler will buffer.
pub const MAX_LINK_PDU_SIZE: usize = 1024;
