//! AES-based primitives used by every layer.
//!
//! - AES-ECB single block `e` (network header obfuscation)
//! - AES-CMAC and the key derivation functions `s1`, `k1`..`k4`
//! - AES-CCM with a 13-byte nonce and a 4- or 8-byte MIC

use aes::Aes128;
use aes::cipher::{BlockEncrypt, KeyInit};
use ccm::Ccm;
use ccm::aead::{Aead, Payload};
use ccm::consts::{U4, U8, U13};
use cmac::{Cmac, Mac};

use crate::core::{
    Address, CryptoError, KEY_SIZE, LABEL_UUID_SIZE, NONCE_SIZE, TRANS_MIC_SIZE_LARGE,
    TRANS_MIC_SIZE_SMALL,
};

type CcmMic32 = Ccm<Aes128, U4, U13>;
type CcmMic64 = Ccm<Aes128, U8, U13>;

/// Size of the authentication tag appended by [`ccm_encrypt`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MicSize {
    /// 32-bit MIC.
    Small,
    /// 64-bit MIC.
    Large,
}

impl MicSize {
    /// MIC length in bytes.
    pub const fn len(self) -> usize {
        match self {
            MicSize::Small => TRANS_MIC_SIZE_SMALL,
            MicSize::Large => TRANS_MIC_SIZE_LARGE,
        }
    }
}

/// AES-128 encryption of a single block.
pub fn e(key: &[u8; KEY_SIZE], plaintext: &[u8; 16]) -> [u8; 16] {
    let cipher = Aes128::new(key.into());
    let mut block = aes::Block::from(*plaintext);
    cipher.encrypt_block(&mut block);
    block.into()
}

/// AES-CMAC over `data`.
pub fn aes_cmac(key: &[u8; KEY_SIZE], data: &[u8]) -> [u8; 16] {
    let mut mac = <Cmac<Aes128> as Mac>::new(key.into());
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Salt generation function: AES-CMAC with a zero key.
pub fn s1(m: &[u8]) -> [u8; 16] {
    aes_cmac(&[0u8; KEY_SIZE], m)
}

/// Generic derivation: `AES-CMAC(AES-CMAC(salt, n), p)`.
pub fn k1(n: &[u8], salt: &[u8; 16], p: &[u8]) -> [u8; 16] {
    let t = aes_cmac(salt, n);
    aes_cmac(&t, p)
}

/// Network key material derivation.
///
/// Returns `(NID, EncryptionKey, PrivacyKey)`.
pub fn k2(n: &[u8; KEY_SIZE], p: &[u8]) -> (u8, [u8; 16], [u8; 16]) {
    let salt = s1(b"smk2");
    let t = aes_cmac(&salt, n);

    let mut input = Vec::with_capacity(16 + p.len() + 1);
    input.extend_from_slice(p);
    input.push(0x01);
    let t1 = aes_cmac(&t, &input);

    input.clear();
    input.extend_from_slice(&t1);
    input.extend_from_slice(p);
    input.push(0x02);
    let t2 = aes_cmac(&t, &input);

    input.clear();
    input.extend_from_slice(&t2);
    input.extend_from_slice(p);
    input.push(0x03);
    let t3 = aes_cmac(&t, &input);

    (t1[15] & 0x7F, t2, t3)
}

/// Network ID derivation (64 bits).
pub fn k3(n: &[u8; KEY_SIZE]) -> [u8; 8] {
    let salt = s1(b"smk3");
    let t = aes_cmac(&salt, n);
    let full = aes_cmac(&t, b"id64\x01");
    let mut id = [0u8; 8];
    id.copy_from_slice(&full[8..16]);
    id
}

/// Application key identifier derivation (6 bits).
pub fn k4(n: &[u8; KEY_SIZE]) -> u8 {
    let salt = s1(b"smk4");
    let t = aes_cmac(&salt, n);
    aes_cmac(&t, b"id6\x01")[15] & 0x3F
}

/// Beacon key used to authenticate secure network beacons.
pub fn beacon_key(n: &[u8; KEY_SIZE]) -> [u8; 16] {
    k1(n, &s1(b"nkbk"), b"id128\x01")
}

/// Virtual address of a label UUID.
pub fn virtual_address(label: &[u8; LABEL_UUID_SIZE]) -> Address {
    let salt = s1(b"vtad");
    let hash = aes_cmac(&salt, label);
    let value = u16::from_be_bytes([hash[14], hash[15]]) & 0x3FFF;
    Address::new(0x8000 | value)
}

/// AES-CCM encryption; the MIC is appended to the ciphertext.
pub fn ccm_encrypt(
    key: &[u8; KEY_SIZE],
    nonce: &[u8; NONCE_SIZE],
    plaintext: &[u8],
    aad: &[u8],
    mic: MicSize,
) -> Result<Vec<u8>, CryptoError> {
    let payload = Payload { msg: plaintext, aad };
    let result = match mic {
        MicSize::Small => CcmMic32::new(key.into()).encrypt(nonce.into(), payload),
        MicSize::Large => CcmMic64::new(key.into()).encrypt(nonce.into(), payload),
    };
    result.map_err(|_| CryptoError::EncryptionFailed)
}

/// AES-CCM decryption of `ciphertext || MIC`.
pub fn ccm_decrypt(
    key: &[u8; KEY_SIZE],
    nonce: &[u8; NONCE_SIZE],
    ciphertext: &[u8],
    aad: &[u8],
    mic: MicSize,
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.len() < mic.len() {
        return Err(CryptoError::AuthenticationFailed);
    }

    let payload = Payload {
        msg: ciphertext,
        aad,
    };
    let result = match mic {
        MicSize::Small => CcmMic32::new(key.into()).decrypt(nonce.into(), payload),
        MicSize::Large => CcmMic64::new(key.into()).decrypt(nonce.into(), payload),
    };
    result.map_err(|_| CryptoError::AuthenticationFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(hex_str: &str) -> [u8; 16] {
        hex::decode(hex_str).unwrap().try_into().unwrap()
    }

    #[test]
    fn test_s1_sample() {
        assert_eq!(hex::encode(s1(b"test")), "b73cefbd641ef2ea598c2b6efb62f79c");
    }

    #[test]
    fn test_k2_sample() {
        let (nid, encryption_key, privacy_key) = k2(&key("f7a2a44f8e8a8029064f173ddc1e2b00"), &[0x00]);
        assert_eq!(nid, 0x7f);
        assert_eq!(hex::encode(encryption_key), "9f589181a0f50de73c8070c7a6d27f46");
        assert_eq!(hex::encode(privacy_key), "4c715bd4a64b938f99b453351653124f");
    }

    #[test]
    fn test_k3_sample() {
        let id = k3(&key("f7a2a44f8e8a8029064f173ddc1e2b00"));
        assert_eq!(hex::encode(id), "ff046958233db014");
    }

    #[test]
    fn test_k4_sample() {
        assert_eq!(k4(&key("3216d1509884b533248541792b877f98")), 0x38);
    }

    #[test]
    fn test_message_one_keys() {
        let (nid, _, _) = k2(&key("7dd7364cd842ad18c17c2b820c84c3d6"), &[0x00]);
        assert_eq!(nid, 0x68);
        assert_eq!(k4(&key("63964771734fbd76e3b40519d1d94a48")), 0x26);
    }

    #[test]
    fn test_ccm_roundtrip_both_mic_sizes() {
        let key = [0x11; KEY_SIZE];
        let nonce = [0x22; NONCE_SIZE];
        let plaintext = b"mesh payload";

        for mic in [MicSize::Small, MicSize::Large] {
            let sealed = ccm_encrypt(&key, &nonce, plaintext, &[], mic).unwrap();
            assert_eq!(sealed.len(), plaintext.len() + mic.len());

            let opened = ccm_decrypt(&key, &nonce, &sealed, &[], mic).unwrap();
            assert_eq!(opened, plaintext);
        }
    }

    #[test]
    fn test_ccm_is_deterministic() {
        let key = [0x11; KEY_SIZE];
        let nonce = [0x22; NONCE_SIZE];
        let a = ccm_encrypt(&key, &nonce, b"same input", &[], MicSize::Small).unwrap();
        let b = ccm_encrypt(&key, &nonce, b"same input", &[], MicSize::Small).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_ccm_rejects_wrong_key_and_flipped_mic() {
        let key = [0x11; KEY_SIZE];
        let nonce = [0x22; NONCE_SIZE];
        let mut sealed = ccm_encrypt(&key, &nonce, b"secret", &[], MicSize::Small).unwrap();

        let wrong = ccm_decrypt(&[0x12; KEY_SIZE], &nonce, &sealed, &[], MicSize::Small);
        assert_eq!(wrong, Err(CryptoError::AuthenticationFailed));

        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        let flipped = ccm_decrypt(&key, &nonce, &sealed, &[], MicSize::Small);
        assert_eq!(flipped, Err(CryptoError::AuthenticationFailed));
    }

    #[test]
    fn test_ccm_aad_is_authenticated() {
        let key = [0x11; KEY_SIZE];
        let nonce = [0x22; NONCE_SIZE];
        let sealed = ccm_encrypt(&key, &nonce, b"virtual", &[0xAA; 16], MicSize::Small).unwrap();
        assert!(ccm_decrypt(&key, &nonce, &sealed, &[0xAB; 16], MicSize::Small).is_err());
    }

    #[test]
    fn test_ccm_short_input() {
        let result = ccm_decrypt(&[0; KEY_SIZE], &[0; NONCE_SIZE], &[1, 2], &[], MicSize::Large);
        assert_eq!(result, Err(CryptoError::AuthenticationFailed));
    }

    #[test]
    fn test_virtual_address_range() {
        for byte in 0..8u8 {
            assert!(virtual_address(&[byte; LABEL_UUID_SIZE]).is_virtual());
        }
    }
}
