//! Secure network beacons.
//!
//! ```text
//! [ type 0x01 | flags (1) | Network ID (8) | IV index (4) | auth (8) ]
//! ```
//!
//! The authentication value is the first eight bytes of
//! `AES-CMAC(BeaconKey, flags || Network ID || IV index)`.

use crate::core::{IvIndex, MeshError, PduError};
use crate::crypto::{KeyIndex, NetworkKeyMaterial, aes_cmac};
use crate::store::MeshNetwork;

const SECURE_BEACON_TYPE: u8 = 0x01;
const SECURE_BEACON_SIZE: usize = 22;
const FLAG_KEY_REFRESH: u8 = 0x01;
const FLAG_IV_UPDATE: u8 = 0x02;

/// An authenticated secure network beacon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecureNetworkBeacon {
    /// Key refresh flag.
    pub key_refresh: bool,
    /// IV Update flag.
    pub iv_update_active: bool,
    /// Network the beacon belongs to.
    pub network_id: [u8; 8],
    /// Advertised IV index.
    pub iv_index: u32,
    /// Local index of the network key that authenticated it.
    pub network_key_index: KeyIndex,
}

fn authentication(key: &NetworkKeyMaterial, body: &[u8]) -> [u8; 8] {
    let mac = aes_cmac(key.beacon_key(), body);
    let mut auth = [0u8; 8];
    auth.copy_from_slice(&mac[..8]);
    auth
}

impl SecureNetworkBeacon {
    /// Advertised IV index state.
    pub fn iv(&self) -> IvIndex {
        IvIndex {
            index: self.iv_index,
            update_active: self.iv_update_active,
        }
    }

    /// Frame and authenticate the beacon with `key`.
    pub fn encode(&self, key: &NetworkKeyMaterial) -> Vec<u8> {
        let mut out = Vec::with_capacity(SECURE_BEACON_SIZE);
        out.push(SECURE_BEACON_TYPE);
        let mut flags = 0;
        if self.key_refresh {
            flags |= FLAG_KEY_REFRESH;
        }
        if self.iv_update_active {
            flags |= FLAG_IV_UPDATE;
        }
        out.push(flags);
        out.extend_from_slice(key.network_id());
        out.extend_from_slice(&self.iv_index.to_be_bytes());
        let auth = authentication(key, &out[1..14]);
        out.extend_from_slice(&auth);
        out
    }

    /// Parse and authenticate a beacon against the known network keys.
    pub fn decode(data: &[u8], network: &MeshNetwork) -> Result<Self, MeshError> {
        let first = *data.first().ok_or(PduError::TooShort {
            expected: SECURE_BEACON_SIZE,
            actual: 0,
        })?;
        if first != SECURE_BEACON_TYPE {
            return Err(PduError::InvalidField("beacon type").into());
        }
        if data.len() != SECURE_BEACON_SIZE {
            return Err(PduError::TooShort {
                expected: SECURE_BEACON_SIZE,
                actual: data.len(),
            }
            .into());
        }

        let flags = data[1];
        let mut network_id = [0u8; 8];
        network_id.copy_from_slice(&data[2..10]);
        let iv_index = u32::from_be_bytes([data[10], data[11], data[12], data[13]]);

        for net_key in network.network_keys() {
            for material in net_key.receive_candidates() {
                if material.network_id() != &network_id {
                    continue;
                }
                if authentication(material, &data[1..14])[..] == data[14..22] {
                    return Ok(Self {
                        key_refresh: flags & FLAG_KEY_REFRESH != 0,
                        iv_update_active: flags & FLAG_IV_UPDATE != 0,
                        network_id,
                        iv_index,
                        network_key_index: net_key.index(),
                    });
                }
            }
        }
        Err(crate::core::CryptoError::AuthenticationFailed.into())
    }
}
