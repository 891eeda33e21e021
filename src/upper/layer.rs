//! Upper Transport PDU encryption.
//!
//! ```text
//! Upper Transport PDU = AES-CCM(AppKey | DevKey, nonce, Access PDU, label?) || TransMIC (4 | 8)
//! ```

use tracing::trace;

use crate::core::{Address, CryptoError, MeshAddress, MeshError};
use crate::crypto::{AccessNonceType, KeyIndex, KeySet, MicSize, access_nonce, ccm_decrypt, ccm_encrypt};
use crate::lower::InboundAccessPdu;
use crate::store::MeshNetwork;

/// Key that authenticated an inbound Upper Transport PDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecryptionKey {
    /// An application key.
    Application(KeyIndex),
    /// The device key of the node at this address.
    Device(Address),
}

/// A decrypted Access PDU with the context it arrived in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptedAccessPdu {
    /// Access PDU (opcode and parameters).
    pub access_pdu: Vec<u8>,
    /// Source element.
    pub src: Address,
    /// Destination, with its label for virtual addresses.
    pub dst: MeshAddress,
    /// Key that decrypted it.
    pub key: DecryptionKey,
    /// Network key it arrived under.
    pub network_key_index: KeyIndex,
    /// TTL it arrived with.
    pub ttl: u8,
}

fn mic_size(aszmic: bool) -> MicSize {
    if aszmic { MicSize::Large } else { MicSize::Small }
}

/// Encrypt an Access PDU.
pub fn encrypt(
    access_pdu: &[u8],
    keys: &KeySet,
    seq: u32,
    src: Address,
    dst: &MeshAddress,
    iv_index: u32,
) -> Result<Vec<u8>, MeshError> {
    let nonce_type = if keys.access_key.akf() {
        AccessNonceType::Application
    } else {
        AccessNonceType::Device
    };
    let nonce = access_nonce(nonce_type, keys.aszmic, seq, src, dst.address(), iv_index);
    let aad = dst.label().map(|label| label.as_slice()).unwrap_or(&[]);
    let upper_pdu = ccm_encrypt(keys.access_key.key(), &nonce, access_pdu, aad, mic_size(keys.aszmic))?;
    Ok(upper_pdu)
}

/// Decrypt an inbound Upper Transport PDU with the keys the local node
/// holds for its destination.
///
/// Application keys are narrowed by AID and tried in index order, new key
/// material before old. Device keys are tried for the source node first
/// (responses to our configuration messages), then for the local node.
pub fn decrypt(pdu: &InboundAccessPdu, network: &MeshNetwork) -> Result<DecryptedAccessPdu, MeshError> {
    let labels = if pdu.dst.is_virtual() {
        let labels = network.virtual_labels(pdu.dst);
        if labels.is_empty() {
            trace!(dst = %pdu.dst, "No label for virtual destination");
            return Err(CryptoError::NoKeyFound.into());
        }
        labels.into_iter().map(MeshAddress::from_label).collect()
    } else {
        vec![MeshAddress::new(pdu.dst)]
    };

    let mic = mic_size(pdu.szmic);
    let mut tried = false;

    if pdu.akf {
        for index in network.receiving_app_keys(pdu.dst) {
            let Ok(app_key) = network.application_key(index) else {
                continue;
            };
            for material in app_key.receive_candidates() {
                if material.aid() != pdu.aid {
                    continue;
                }
                tried = true;
                for dst in &labels {
                    let nonce = access_nonce(
                        AccessNonceType::Application,
                        pdu.szmic,
                        pdu.seq_auth,
                        pdu.src,
                        pdu.dst,
                        pdu.iv_index,
                    );
                    let aad = dst.label().map(|label| label.as_slice()).unwrap_or(&[]);
                    if let Ok(access_pdu) = ccm_decrypt(material.key(), &nonce, &pdu.upper_pdu, aad, mic) {
                        return Ok(DecryptedAccessPdu {
                            access_pdu,
                            src: pdu.src,
                            dst: *dst,
                            key: DecryptionKey::Application(index),
                            network_key_index: pdu.network_key_index,
                            ttl: pdu.ttl,
                        });
                    }
                }
            }
        }
    } else if pdu.dst.is_unicast() {
        let nonce = access_nonce(
            AccessNonceType::Device,
            pdu.szmic,
            pdu.seq_auth,
            pdu.src,
            pdu.dst,
            pdu.iv_index,
        );
        for owner in [pdu.src, pdu.dst] {
            let Ok(device_key) = network.device_key(owner) else {
                continue;
            };
            tried = true;
            if let Ok(access_pdu) = ccm_decrypt(device_key.as_bytes(), &nonce, &pdu.upper_pdu, &[], mic) {
                return Ok(DecryptedAccessPdu {
                    access_pdu,
                    src: pdu.src,
                    dst: MeshAddress::new(pdu.dst),
                    key: DecryptionKey::Device(owner),
                    network_key_index: pdu.network_key_index,
                    ttl: pdu.ttl,
                });
            }
        }
    }

    if tried {
        trace!(src = %pdu.src, dst = %pdu.dst, seq_auth = pdu.seq_auth, "TransMIC mismatch");
        Err(CryptoError::AuthenticationFailed.into())
    } else {
        Err(CryptoError::NoKeyFound.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{IvIndex, KEY_SIZE};
    use crate::crypto::{ApplicationKey, DeviceKey, NetworkKey};
    use crate::store::{Element, Model, ModelId, Node};

    const LOCAL: Address = Address::new(0x0001);
    const PEER: Address = Address::new(0x0100);
    const LABEL: [u8; 16] = [0x0F; 16];

    fn app(index: u16) -> KeyIndex {
        KeyIndex::new(index).unwrap()
    }

    fn network() -> MeshNetwork {
        let local = Node::new(DeviceKey::new([0x01; KEY_SIZE])).with_element(
            Element::new(LOCAL).with_model(
                Model::new(ModelId::sig(0x1000))
                    .bind(app(0))
                    .bind(app(1))
                    .subscribe(MeshAddress::from_label(LABEL)),
            ),
        );
        let peer = Node::new(DeviceKey::new([0x02; KEY_SIZE])).with_element(Element::new(PEER));
        MeshNetwork::new(IvIndex::new(0x1234), LOCAL)
            .with_network_key(NetworkKey::new(KeyIndex::PRIMARY, [0x10; KEY_SIZE]))
            .with_application_key(ApplicationKey::new(app(0), KeyIndex::PRIMARY, [0x20; KEY_SIZE]))
            .with_application_key(ApplicationKey::new(app(1), KeyIndex::PRIMARY, [0x21; KEY_SIZE]))
            .with_node(local)
            .with_node(peer)
    }

    fn inbound(keys: &KeySet, dst: &MeshAddress, upper_pdu: Vec<u8>) -> InboundAccessPdu {
        InboundAccessPdu {
            src: PEER,
            dst: dst.address(),
            akf: keys.access_key.akf(),
            aid: keys.access_key.aid(),
            szmic: keys.aszmic,
            seq_auth: 42,
            iv_index: 0x1234,
            network_key_index: KeyIndex::PRIMARY,
            ttl: 4,
            upper_pdu,
        }
    }

    #[test]
    fn test_application_key_roundtrip() {
        let net = network();
        let dst = MeshAddress::new(LOCAL);
        for aszmic in [false, true] {
            let keys = net.application_key_set(app(1), aszmic).unwrap();
            let upper = encrypt(b"\x82\x02hello", &keys, 42, PEER, &dst, 0x1234).unwrap();
            assert_eq!(upper.len(), 7 + if aszmic { 8 } else { 4 });

            let decrypted = decrypt(&inbound(&keys, &dst, upper), &net).unwrap();
            assert_eq!(decrypted.access_pdu, b"\x82\x02hello");
            assert_eq!(decrypted.key, DecryptionKey::Application(app(1)));
        }
    }

    #[test]
    fn test_encryption_is_deterministic() {
        let net = network();
        let keys = net.application_key_set(app(0), false).unwrap();
        let dst = MeshAddress::new(LOCAL);
        let a = encrypt(&[1, 2, 3], &keys, 7, PEER, &dst, 1).unwrap();
        let b = encrypt(&[1, 2, 3], &keys, 7, PEER, &dst, 1).unwrap();
        assert_eq!(a, b);
        let c = encrypt(&[1, 2, 3], &keys, 8, PEER, &dst, 1).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_flipped_mic_is_rejected() {
        let net = network();
        let keys = net.application_key_set(app(0), false).unwrap();
        let dst = MeshAddress::new(LOCAL);
        let mut upper = encrypt(&[0x01, 0x02], &keys, 42, PEER, &dst, 0x1234).unwrap();
        let last = upper.len() - 1;
        upper[last] ^= 0x01;

        let err = decrypt(&inbound(&keys, &dst, upper), &net).unwrap_err();
        assert!(matches!(err, MeshError::Crypto(CryptoError::AuthenticationFailed)));
        assert!(err.is_silent_drop());
    }

    #[test]
    fn test_foreign_application_key_is_dropped() {
        let net = network();
        let foreign = MeshNetwork::new(IvIndex::new(0), LOCAL)
            .with_network_key(NetworkKey::new(KeyIndex::PRIMARY, [0x10; KEY_SIZE]))
            .with_application_key(ApplicationKey::new(app(0), KeyIndex::PRIMARY, [0x77; KEY_SIZE]));
        let keys = foreign.application_key_set(app(0), false).unwrap();
        let dst = MeshAddress::new(LOCAL);
        let upper = encrypt(&[0x01], &keys, 42, PEER, &dst, 0x1234).unwrap();

        let err = decrypt(&inbound(&keys, &dst, upper), &net).unwrap_err();
        assert!(err.is_silent_drop());
    }

    #[test]
    fn test_device_key_of_source_then_local() {
        let net = network();
        let dst = MeshAddress::new(LOCAL);

        // A status from the peer, encrypted with the peer's device key.
        let keys = net.device_key_set(PEER, false).unwrap();
        let upper = encrypt(&[0x80, 0x02, 0x00], &keys, 42, PEER, &dst, 0x1234).unwrap();
        let decrypted = decrypt(&inbound(&keys, &dst, upper), &net).unwrap();
        assert_eq!(decrypted.key, DecryptionKey::Device(PEER));

        // A request to the local node, encrypted with its own device key.
        let keys = net.device_key_set(LOCAL, false).unwrap();
        let upper = encrypt(&[0x80, 0x08, 0x00], &keys, 42, PEER, &dst, 0x1234).unwrap();
        let decrypted = decrypt(&inbound(&keys, &dst, upper), &net).unwrap();
        assert_eq!(decrypted.key, DecryptionKey::Device(LOCAL));
    }

    #[test]
    fn test_virtual_destination_uses_label() {
        let net = network();
        let dst = MeshAddress::from_label(LABEL);
        let keys = net.application_key_set(app(0), false).unwrap();
        let upper = encrypt(&[0x04, 0x05], &keys, 42, PEER, &dst, 0x1234).unwrap();

        let decrypted = decrypt(&inbound(&keys, &dst, upper.clone()), &net).unwrap();
        assert_eq!(decrypted.dst, dst);

        // Same bytes, no label as AAD: different tag.
        let plain = MeshAddress::new(LOCAL);
        let unlabelled = encrypt(&[0x04, 0x05], &keys, 42, PEER, &MeshAddress::new(dst.address()), 0x1234).unwrap();
        assert_ne!(upper, unlabelled);
        assert!(decrypt(&inbound(&keys, &plain, upper), &net).is_err());
    }
}
