//! Network PDU wire format.
//!
//! ```text
//! +---------+---------+--------+-------+---------------------------------+
//! | IVI|NID | CTL|TTL  | SEQ    | SRC   | DST | TransportPDU | NetMIC     |
//! | 1       | 1       | 3      | 2     | 2   | 1..16        | 4 or 8     |
//! +---------+---------+--------+-------+---------------------------------+
//!            \______ obfuscated ______/ \__________ encrypted ___________/
//! ```
//!
//! Obfuscation XORs the CTL..SRC bytes with the first six bytes of
//! `e(PrivacyKey, 0x0000000000 || IV index || PrivacyRandom)`, where
//! PrivacyRandom is the first seven bytes of the encrypted part.

use crate::core::{
    Address, MeshError, NET_MIC_SIZE_ACCESS, NET_MIC_SIZE_CONTROL, NETWORK_PDU_MAX_SIZE,
    NETWORK_PDU_MIN_SIZE, PduError, SEQUENCE_MAX,
};
use crate::crypto::{
    MicSize, NetworkKeyMaterial, ccm_decrypt, ccm_encrypt, e, network_nonce, proxy_nonce,
};

/// Which nonce protects the PDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkPduKind {
    /// Mesh traffic, network nonce.
    Mesh,
    /// Proxy configuration, proxy nonce.
    ProxyConfiguration,
}

/// A decrypted Network PDU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkPdu {
    /// Control message flag.
    pub ctl: bool,
    /// Time to live.
    pub ttl: u8,
    /// 24-bit sequence number.
    pub seq: u32,
    /// Source element.
    pub src: Address,
    /// Destination.
    pub dst: Address,
    /// Lower Transport PDU.
    pub transport_pdu: Vec<u8>,
}

/// IVI bit and NID of a raw Network PDU, readable without any key.
pub fn peek_ivi_nid(data: &[u8]) -> Result<(bool, u8), PduError> {
    let first = *data.first().ok_or(PduError::TooShort {
        expected: NETWORK_PDU_MIN_SIZE,
        actual: 0,
    })?;
    Ok((first & 0x80 != 0, first & 0x7F))
}

fn mic_size(ctl: bool) -> MicSize {
    if ctl { MicSize::Large } else { MicSize::Small }
}

fn net_mic_len(ctl: bool) -> usize {
    if ctl {
        NET_MIC_SIZE_CONTROL
    } else {
        NET_MIC_SIZE_ACCESS
    }
}

fn pecb(privacy_key: &[u8; 16], iv_index: u32, privacy_random: &[u8]) -> [u8; 16] {
    let mut input = [0u8; 16];
    input[5..9].copy_from_slice(&iv_index.to_be_bytes());
    input[9..16].copy_from_slice(&privacy_random[..7]);
    e(privacy_key, &input)
}

fn nonce(kind: NetworkPduKind, ctl: bool, ttl: u8, seq: u32, src: Address, iv_index: u32) -> [u8; 13] {
    match kind {
        NetworkPduKind::Mesh => network_nonce(ctl, ttl, seq, src, iv_index),
        NetworkPduKind::ProxyConfiguration => proxy_nonce(seq, src, iv_index),
    }
}

impl NetworkPdu {
    /// Encrypt, obfuscate and frame the PDU.
    pub fn encode(
        &self,
        key: &NetworkKeyMaterial,
        iv_index: u32,
        kind: NetworkPduKind,
    ) -> Result<Vec<u8>, MeshError> {
        if self.seq > SEQUENCE_MAX {
            return Err(PduError::InvalidField("seq").into());
        }
        let size = 9 + self.transport_pdu.len() + net_mic_len(self.ctl);
        if size > NETWORK_PDU_MAX_SIZE {
            return Err(PduError::TooLong {
                max: NETWORK_PDU_MAX_SIZE,
                actual: size,
            }
            .into());
        }

        let mut plaintext = Vec::with_capacity(2 + self.transport_pdu.len());
        plaintext.extend_from_slice(&self.dst.to_be_bytes());
        plaintext.extend_from_slice(&self.transport_pdu);

        let nonce = nonce(kind, self.ctl, self.ttl, self.seq, self.src, iv_index);
        let encrypted = ccm_encrypt(key.encryption_key(), &nonce, &plaintext, &[], mic_size(self.ctl))?;

        let mut header = [0u8; 6];
        header[0] = (u8::from(self.ctl) << 7) | (self.ttl & 0x7F);
        header[1..4].copy_from_slice(&self.seq.to_be_bytes()[1..4]);
        header[4..6].copy_from_slice(&self.src.to_be_bytes());

        let pecb = pecb(key.privacy_key(), iv_index, &encrypted);
        for (byte, mask) in header.iter_mut().zip(pecb.iter()) {
            *byte ^= mask;
        }

        let mut out = Vec::with_capacity(size);
        out.push((((iv_index & 1) as u8) << 7) | key.nid());
        out.extend_from_slice(&header);
        out.extend_from_slice(&encrypted);
        Ok(out)
    }

    /// Deobfuscate and decrypt a raw PDU with one candidate key.
    pub fn decode(
        data: &[u8],
        key: &NetworkKeyMaterial,
        iv_index: u32,
        kind: NetworkPduKind,
    ) -> Result<Self, MeshError> {
        if data.len() < NETWORK_PDU_MIN_SIZE {
            return Err(PduError::TooShort {
                expected: NETWORK_PDU_MIN_SIZE,
                actual: data.len(),
            }
            .into());
        }
        if data.len() > NETWORK_PDU_MAX_SIZE {
            return Err(PduError::TooLong {
                max: NETWORK_PDU_MAX_SIZE,
                actual: data.len(),
            }
            .into());
        }

        let encrypted = &data[7..];
        let pecb = pecb(key.privacy_key(), iv_index, encrypted);
        let mut header = [0u8; 6];
        for (i, byte) in header.iter_mut().enumerate() {
            *byte = data[1 + i] ^ pecb[i];
        }

        let ctl = header[0] & 0x80 != 0;
        let ttl = header[0] & 0x7F;
        let seq = u32::from_be_bytes([0, header[1], header[2], header[3]]);
        let src = Address::from_be_bytes([header[4], header[5]]);

        // Control PDUs need the 8-byte NetMIC plus at least one transport byte.
        if encrypted.len() < 2 + 1 + net_mic_len(ctl) {
            return Err(PduError::TooShort {
                expected: 7 + 2 + 1 + net_mic_len(ctl),
                actual: data.len(),
            }
            .into());
        }

        let nonce = nonce(kind, ctl, ttl, seq, src, iv_index);
        let plaintext = ccm_decrypt(key.encryption_key(), &nonce, encrypted, &[], mic_size(ctl))?;

        Ok(Self {
            ctl,
            ttl,
            seq,
            src,
            dst: Address::from_be_bytes([plaintext[0], plaintext[1]]),
            transport_pdu: plaintext[2..].to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::CryptoError;

    fn sample() -> NetworkPdu {
        NetworkPdu {
            ctl: false,
            ttl: 4,
            seq: 0x3129AB,
            src: Address::new(0x0003),
            dst: Address::new(0x1201),
            transport_pdu: vec![0x66, 0x01, 0x02, 0x03, 0x04],
        }
    }

    fn key() -> NetworkKeyMaterial {
        NetworkKeyMaterial::derive([0x7d; 16])
    }

    #[test]
    fn test_encode_decode() {
        let key = key();
        let pdu = sample();
        let bytes = pdu.encode(&key, 0x12345678, NetworkPduKind::Mesh).unwrap();

        assert_eq!(bytes.len(), 9 + 5 + NET_MIC_SIZE_ACCESS);
        assert_eq!(peek_ivi_nid(&bytes).unwrap(), (false, key.nid()));

        let decoded = NetworkPdu::decode(&bytes, &key, 0x12345678, NetworkPduKind::Mesh).unwrap();
        assert_eq!(decoded, pdu);
    }

    #[test]
    fn test_header_is_obfuscated() {
        let bytes = sample().encode(&key(), 0, NetworkPduKind::Mesh).unwrap();
        let clear = [0x04, 0x31, 0x29, 0xAB, 0x00, 0x03];
        assert_ne!(&bytes[1..7], &clear);
    }

    #[test]
    fn test_control_pdu_uses_long_mic() {
        let pdu = NetworkPdu {
            ctl: true,
            ..sample()
        };
        let key = key();
        let bytes = pdu.encode(&key, 1, NetworkPduKind::Mesh).unwrap();
        assert_eq!(bytes.len(), 9 + 5 + NET_MIC_SIZE_CONTROL);
        assert!(peek_ivi_nid(&bytes).unwrap().0);
        assert_eq!(
            NetworkPdu::decode(&bytes, &key, 1, NetworkPduKind::Mesh).unwrap(),
            pdu
        );
    }

    #[test]
    fn test_wrong_iv_or_kind_fails() {
        let key = key();
        let bytes = sample().encode(&key, 5, NetworkPduKind::Mesh).unwrap();
        assert!(NetworkPdu::decode(&bytes, &key, 6, NetworkPduKind::Mesh).is_err());
        assert!(NetworkPdu::decode(&bytes, &key, 5, NetworkPduKind::ProxyConfiguration).is_err());
    }

    #[test]
    fn test_tampered_pdu_rejected() {
        let key = key();
        let mut bytes = sample().encode(&key, 0, NetworkPduKind::Mesh).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x80;
        assert!(matches!(
            NetworkPdu::decode(&bytes, &key, 0, NetworkPduKind::Mesh),
            Err(MeshError::Crypto(CryptoError::AuthenticationFailed))
        ));
    }

    #[test]
    fn test_size_limits() {
        let pdu = NetworkPdu {
            transport_pdu: vec![0; 17],
            ..sample()
        };
        assert!(matches!(
            pdu.encode(&key(), 0, NetworkPduKind::Mesh),
            Err(MeshError::Pdu(PduError::TooLong { .. }))
        ));
        assert!(matches!(
            NetworkPdu::decode(&[0u8; 8], &key(), 0, NetworkPduKind::Mesh),
            Err(MeshError::Pdu(PduError::TooShort { .. }))
        ));
    }
}
