//! Nonce construction for AES-CCM.
//!
//! All nonces are 13 bytes and start with a type byte:
//!
//! ```text
//! network:      [ 0x00 | CTL|TTL | SEQ (3) | SRC (2) | 0x0000     | IV index (4) ]
//! application:  [ 0x01 | ASZMIC<<7 | SEQ (3) | SRC (2) | DST (2)  | IV index (4) ]
//! device:       [ 0x02 | ASZMIC<<7 | SEQ (3) | SRC (2) | DST (2)  | IV index (4) ]
//! proxy:        [ 0x03 | 0x00    | SEQ (3) | SRC (2) | 0x0000     | IV index (4) ]
//! ```

use crate::core::{
    Address, NONCE_SIZE, NONCE_TYPE_APPLICATION, NONCE_TYPE_DEVICE, NONCE_TYPE_NETWORK,
    NONCE_TYPE_PROXY,
};

/// Which access nonce to build.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessNonceType {
    /// Application key (0x01).
    Application,
    /// Device key (0x02).
    Device,
}

impl AccessNonceType {
    /// Get the byte representation.
    pub fn as_byte(self) -> u8 {
        match self {
            AccessNonceType::Application => NONCE_TYPE_APPLICATION,
            AccessNonceType::Device => NONCE_TYPE_DEVICE,
        }
    }
}

fn build(
    nonce_type: u8,
    second: u8,
    seq: u32,
    src: Address,
    dst: Address,
    iv_index: u32,
) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[0] = nonce_type;
    nonce[1] = second;
    nonce[2..5].copy_from_slice(&seq.to_be_bytes()[1..4]);
    nonce[5..7].copy_from_slice(&src.to_be_bytes());
    nonce[7..9].copy_from_slice(&dst.to_be_bytes());
    nonce[9..13].copy_from_slice(&iv_index.to_be_bytes());
    nonce
}

/// Network nonce.
pub fn network_nonce(ctl: bool, ttl: u8, seq: u32, src: Address, iv_index: u32) -> [u8; NONCE_SIZE] {
    let ctl_ttl = (u8::from(ctl) << 7) | (ttl & 0x7F);
    build(NONCE_TYPE_NETWORK, ctl_ttl, seq, src, Address::UNASSIGNED, iv_index)
}

/// Application or device nonce.
pub fn access_nonce(
    nonce_type: AccessNonceType,
    aszmic: bool,
    seq: u32,
    src: Address,
    dst: Address,
    iv_index: u32,
) -> [u8; NONCE_SIZE] {
    build(nonce_type.as_byte(), u8::from(aszmic) << 7, seq, src, dst, iv_index)
}

/// Proxy nonce.
pub fn proxy_nonce(seq: u32, src: Address, iv_index: u32) -> [u8; NONCE_SIZE] {
    build(NONCE_TYPE_PROXY, 0x00, seq, src, Address::UNASSIGNED, iv_index)
}
