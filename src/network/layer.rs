//! Network layer state: sequence allocation, key selection and replay
//! protection around the Network PDU codec.

use tracing::{debug, trace};

use super::pdu::{NetworkPdu, NetworkPduKind, peek_ivi_nid};
use super::replay::ReplayCache;
use crate::core::{Address, CryptoError, MeshError, PduError};
use crate::crypto::{KeyIndex, NetworkKeyMaterial};
use crate::store::{MeshNetwork, SequenceAllocator, SequenceStore};

/// A Network PDU accepted by the network layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedNetworkPdu {
    /// The decrypted PDU.
    pub pdu: NetworkPdu,
    /// Network key that decrypted it.
    pub network_key_index: KeyIndex,
    /// IV index it was sent with.
    pub iv_index: u32,
}

/// Network layer.
#[derive(Debug)]
pub struct NetworkLayer {
    sequences: SequenceAllocator,
    replay: ReplayCache,
}

impl NetworkLayer {
    /// Create the layer with a sequence store and a replay cache capacity.
    pub fn new(store: Box<dyn SequenceStore>, replay_capacity: usize) -> Self {
        Self {
            sequences: SequenceAllocator::new(store),
            replay: ReplayCache::new(replay_capacity),
        }
    }

    /// Next sequence number of a local source element.
    pub fn next_sequence(&mut self, src: Address) -> Result<u32, MeshError> {
        self.sequences.next(src)
    }

    /// Encrypt an outbound PDU with `key` under the network's IV index.
    pub fn encode(
        &self,
        network: &MeshNetwork,
        key: &NetworkKeyMaterial,
        pdu: &NetworkPdu,
    ) -> Result<Vec<u8>, MeshError> {
        let iv_index = network.iv_index().transmit_index();
        let bytes = pdu.encode(key, iv_index, NetworkPduKind::Mesh)?;
        trace!(src = %pdu.src, dst = %pdu.dst, seq = pdu.seq, ttl = pdu.ttl, ctl = pdu.ctl, "Network PDU encoded");
        Ok(bytes)
    }

    /// Decrypt and validate an inbound mesh PDU.
    pub fn decode(&mut self, network: &MeshNetwork, data: &[u8]) -> Result<ReceivedNetworkPdu, MeshError> {
        let received = self.decrypt(network, data, NetworkPduKind::Mesh)?;
        let pdu = &received.pdu;

        if network.is_local_element(pdu.src) {
            trace!(src = %pdu.src, seq = pdu.seq, "Dropping own PDU");
            return Err(MeshError::Replay {
                src: pdu.src,
                seq: pdu.seq,
            });
        }
        if pdu.ttl == 0 {
            return Err(PduError::InvalidField("ttl").into());
        }
        if !pdu.dst.is_assigned() {
            return Err(PduError::InvalidField("dst").into());
        }

        self.replay
            .check_and_update(pdu.src, pdu.seq, received.iv_index)?;
        Ok(received)
    }

    /// Encrypt a proxy configuration message.
    pub fn encode_proxy_configuration(
        &mut self,
        network: &MeshNetwork,
        payload: &[u8],
    ) -> Result<Vec<u8>, MeshError> {
        let src = network.local_address();
        let pdu = NetworkPdu {
            ctl: true,
            ttl: 0,
            seq: self.next_sequence(src)?,
            src,
            dst: Address::UNASSIGNED,
            transport_pdu: payload.to_vec(),
        };
        let key = network.primary_network_key()?.transmit_material();
        pdu.encode(key, network.iv_index().transmit_index(), NetworkPduKind::ProxyConfiguration)
    }

    /// Decrypt an inbound proxy configuration message.
    pub fn decode_proxy_configuration(
        &mut self,
        network: &MeshNetwork,
        data: &[u8],
    ) -> Result<ReceivedNetworkPdu, MeshError> {
        let received = self.decrypt(network, data, NetworkPduKind::ProxyConfiguration)?;
        if !received.pdu.ctl || received.pdu.dst.is_assigned() {
            return Err(PduError::InvalidField("proxy configuration header").into());
        }
        self.replay
            .check_and_update(received.pdu.src, received.pdu.seq, received.iv_index)?;
        Ok(received)
    }

    /// Try every key whose NID matches, new keys before old ones.
    ///
    /// A key that fails to decode is skipped; the header is deobfuscated
    /// per key, so a colliding NID may yield a bogus CTL or length.
    fn decrypt(
        &self,
        network: &MeshNetwork,
        data: &[u8],
        kind: NetworkPduKind,
    ) -> Result<ReceivedNetworkPdu, MeshError> {
        let (ivi, nid) = peek_ivi_nid(data)?;
        let iv_index = network.iv_index().receive_index(ivi);

        let mut matched = false;
        let mut malformed = None;
        for net_key in network.network_keys() {
            for material in net_key.receive_candidates() {
                if material.nid() != nid {
                    continue;
                }
                matched = true;
                match NetworkPdu::decode(data, material, iv_index, kind) {
                    Ok(pdu) => {
                        return Ok(ReceivedNetworkPdu {
                            pdu,
                            network_key_index: net_key.index(),
                            iv_index,
                        });
                    }
                    Err(MeshError::Crypto(_)) => continue,
                    Err(err) => {
                        trace!(%err, index = %net_key.index(), "Network PDU not decodable under key");
                        malformed = Some(err);
                    }
                }
            }
        }

        if let Some(err) = malformed {
            return Err(err);
        }
        if matched {
            debug!(nid, "Network PDU failed authentication");
            Err(CryptoError::AuthenticationFailed.into())
        } else {
            Err(CryptoError::NoKeyFound.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::IvIndex;
    use crate::crypto::{DeviceKey, NetworkKey};
    use crate::store::{Element, MemorySequenceStore, Node};

    fn network(local: u16, iv: u32) -> MeshNetwork {
        MeshNetwork::new(IvIndex::new(iv), Address::new(local))
            .with_network_key(NetworkKey::new(KeyIndex::PRIMARY, [0x44; 16]))
            .with_node(Node::new(DeviceKey::new([0; 16])).with_element(Element::new(Address::new(local))))
    }

    fn layer() -> NetworkLayer {
        NetworkLayer::new(Box::new(MemorySequenceStore::new()), 16)
    }

    fn pdu(seq: u32, ttl: u8) -> NetworkPdu {
        NetworkPdu {
            ctl: false,
            ttl,
            seq,
            src: Address::new(0x0001),
            dst: Address::new(0x0002),
            transport_pdu: vec![0x00, 0xAA, 0xBB],
        }
    }

    fn encode(sender: &MeshNetwork, pdu: &NetworkPdu) -> Vec<u8> {
        let key = sender.primary_network_key().unwrap().transmit_material();
        layer().encode(sender, key, pdu).unwrap()
    }

    #[test]
    fn test_decode_and_replay() {
        let sender = network(0x0001, 3);
        let receiver = network(0x0002, 3);
        let mut rx = layer();

        let bytes = encode(&sender, &pdu(10, 5));
        let received = rx.decode(&receiver, &bytes).unwrap();
        assert_eq!(received.pdu, pdu(10, 5));
        assert_eq!(received.iv_index, 3);
        assert_eq!(received.network_key_index, KeyIndex::PRIMARY);

        assert!(matches!(
            rx.decode(&receiver, &bytes),
            Err(MeshError::Replay { seq: 10, .. })
        ));
    }

    #[test]
    fn test_drops_ttl_zero_and_own_source() {
        let sender = network(0x0001, 0);
        let mut rx = layer();

        let receiver = network(0x0002, 0);
        let bytes = encode(&sender, &pdu(1, 0));
        assert!(matches!(
            rx.decode(&receiver, &bytes),
            Err(MeshError::Pdu(PduError::InvalidField("ttl")))
        ));

        let echo = encode(&sender, &pdu(2, 5));
        assert!(rx.decode(&sender, &echo).unwrap_err().is_silent_drop());
    }

    #[test]
    fn test_unknown_network_key() {
        let sender = network(0x0001, 0);
        let stranger = MeshNetwork::new(IvIndex::new(0), Address::new(0x0002))
            .with_network_key(NetworkKey::new(KeyIndex::PRIMARY, [0x45; 16]));
        let bytes = encode(&sender, &pdu(1, 5));
        let err = layer().decode(&stranger, &bytes).unwrap_err();
        assert!(matches!(err, MeshError::Crypto(_)));
    }

    #[test]
    fn test_old_key_accepted_during_refresh() {
        let sender = network(0x0001, 0);
        let mut receiver = network(0x0002, 0);
        receiver
            .network_key_mut(KeyIndex::PRIMARY)
            .unwrap()
            .begin_refresh([0x99; 16]);

        let bytes = encode(&sender, &pdu(1, 5));
        assert!(layer().decode(&receiver, &bytes).is_ok());
    }

    /// A key different from `key` whose NID is the same.
    fn colliding_key(key: [u8; 16]) -> [u8; 16] {
        let nid = NetworkKey::new(KeyIndex::PRIMARY, key).transmit_material().nid();
        (1..=u16::MAX)
            .map(|i| {
                let mut candidate = key;
                candidate[..2].copy_from_slice(&i.to_be_bytes());
                candidate
            })
            .find(|candidate| {
                candidate != &key && NetworkKey::new(KeyIndex::PRIMARY, *candidate).transmit_material().nid() == nid
            })
            .unwrap()
    }

    #[test]
    fn test_every_colliding_key_is_tried() {
        let right = [0x44; 16];
        let wrong = colliding_key(right);
        let sender = network(0x0001, 0);
        let receiver = MeshNetwork::new(IvIndex::new(0), Address::new(0x0002))
            .with_network_key(NetworkKey::new(KeyIndex::PRIMARY, wrong))
            .with_network_key(NetworkKey::new(KeyIndex::new(1).unwrap(), right));

        let key = sender.primary_network_key().unwrap().transmit_material();
        let mut rx = layer();
        for seq in 0..40 {
            let bytes = layer().encode(&sender, key, &pdu(seq, 5)).unwrap();
            let received = rx.decode(&receiver, &bytes).unwrap();
            assert_eq!(received.network_key_index, KeyIndex::new(1).unwrap());
            assert_eq!(received.pdu, pdu(seq, 5));
        }
    }

    #[test]
    fn test_old_key_tried_after_colliding_new_key() {
        let old = [0x44; 16];
        let sender = network(0x0001, 0);
        let mut receiver = network(0x0002, 0);
        receiver
            .network_key_mut(KeyIndex::PRIMARY)
            .unwrap()
            .begin_refresh(colliding_key(old));

        let mut rx = layer();
        for seq in 0..40 {
            let bytes = encode(&sender, &pdu(seq, 5));
            assert_eq!(rx.decode(&receiver, &bytes).unwrap().pdu.seq, seq);
        }
    }

    #[test]
    fn test_proxy_configuration_roundtrip() {
        let sender = network(0x0001, 0);
        let receiver = network(0x0002, 0);
        let bytes = layer()
            .encode_proxy_configuration(&sender, &[0x00, 0x01])
            .unwrap();

        let mut rx = layer();
        assert!(rx.decode(&receiver, &bytes).is_err());
        let received = rx.decode_proxy_configuration(&receiver, &bytes).unwrap();
        assert_eq!(received.pdu.transport_pdu, vec![0x00, 0x01]);
        assert_eq!(received.pdu.src, Address::new(0x0001));
    }

    #[test]
    fn test_sequence_numbers_increase() {
        let mut layer = layer();
        let a = layer.next_sequence(Address::new(1)).unwrap();
        let b = layer.next_sequence(Address::new(1)).unwrap();
        assert!(b > a);
    }
}
