//! Mesh key management.
//!
//! Network, application and device keys are 128-bit secrets referenced on
//! the wire by a 12-bit key index. Derived material (NID, encryption and
//! privacy keys, AID) is computed once when the key is installed. Every
//! secret is zeroized on drop.

use std::fmt;

use zeroize::Zeroize;

use super::primitives::{beacon_key, k2, k3, k4};
use crate::core::{ConfigError, KEY_SIZE, MAX_KEY_INDEX};

/// Index of a network or application key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyIndex(u16);

impl KeyIndex {
    /// Validate a 12-bit key index.
    pub fn new(index: u16) -> Result<Self, ConfigError> {
        if index > MAX_KEY_INDEX {
            return Err(ConfigError::InvalidKeyIndex(index));
        }
        Ok(Self(index))
    }

    /// The primary network key index.
    pub const PRIMARY: Self = Self(0);

    /// Raw index value.
    pub const fn value(self) -> u16 {
        self.0
    }
}

impl fmt::Display for KeyIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Key refresh procedure phase of a network key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyRefreshPhase {
    /// No refresh in progress; only the current key exists.
    #[default]
    Normal,
    /// New keys are being distributed. Transmit with the old key, accept both.
    Distributing,
    /// New keys are in use. Transmit with the new key, accept both.
    Finalizing,
}

/// Key material derived from one network key.
#[derive(Clone)]
pub struct NetworkKeyMaterial {
    key: [u8; KEY_SIZE],
    nid: u8,
    encryption_key: [u8; KEY_SIZE],
    privacy_key: [u8; KEY_SIZE],
    network_id: [u8; 8],
    beacon_key: [u8; KEY_SIZE],
}

impl NetworkKeyMaterial {
    /// Derive all material from the raw key.
    pub fn derive(key: [u8; KEY_SIZE]) -> Self {
        let (nid, encryption_key, privacy_key) = k2(&key, &[0x00]);
        Self {
            nid,
            encryption_key,
            privacy_key,
            network_id: k3(&key),
            beacon_key: beacon_key(&key),
            key,
        }
    }

    /// Raw network key.
    pub fn key(&self) -> &[u8; KEY_SIZE] {
        &self.key
    }

    /// 7-bit network identifier carried in every Network PDU.
    pub fn nid(&self) -> u8 {
        self.nid
    }

    /// Key used for AES-CCM over the Network PDU.
    pub fn encryption_key(&self) -> &[u8; KEY_SIZE] {
        &self.encryption_key
    }

    /// Key used for header obfuscation.
    pub fn privacy_key(&self) -> &[u8; KEY_SIZE] {
        &self.privacy_key
    }

    /// 64-bit network identifier carried in beacons.
    pub fn network_id(&self) -> &[u8; 8] {
        &self.network_id
    }

    /// Key authenticating secure network beacons.
    pub fn beacon_key(&self) -> &[u8; KEY_SIZE] {
        &self.beacon_key
    }
}

impl Drop for NetworkKeyMaterial {
    fn drop(&mut self) {
        self.key.zeroize();
        self.encryption_key.zeroize();
        self.privacy_key.zeroize();
        self.beacon_key.zeroize();
    }
}

impl fmt::Debug for NetworkKeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkKeyMaterial")
            .field("nid", &self.nid)
            .finish_non_exhaustive()
    }
}

/// A network key, possibly mid-refresh.
#[derive(Debug, Clone)]
pub struct NetworkKey {
    index: KeyIndex,
    phase: KeyRefreshPhase,
    current: NetworkKeyMaterial,
    old: Option<NetworkKeyMaterial>,
}

impl NetworkKey {
    /// Install a network key.
    pub fn new(index: KeyIndex, key: [u8; KEY_SIZE]) -> Self {
        Self {
            index,
            phase: KeyRefreshPhase::Normal,
            current: NetworkKeyMaterial::derive(key),
            old: None,
        }
    }

    /// Key index.
    pub fn index(&self) -> KeyIndex {
        self.index
    }

    /// Current refresh phase.
    pub fn phase(&self) -> KeyRefreshPhase {
        self.phase
    }

    /// Start a key refresh: the installed key becomes the old key.
    pub fn begin_refresh(&mut self, new_key: [u8; KEY_SIZE]) {
        let previous = std::mem::replace(&mut self.current, NetworkKeyMaterial::derive(new_key));
        self.old = Some(previous);
        self.phase = KeyRefreshPhase::Distributing;
    }

    /// Move to `phase`. Returning to [`KeyRefreshPhase::Normal`] revokes
    /// the old key.
    pub fn set_phase(&mut self, phase: KeyRefreshPhase) {
        self.phase = phase;
        if phase == KeyRefreshPhase::Normal {
            self.old = None;
        }
    }

    /// Material used for outbound PDUs.
    pub fn transmit_material(&self) -> &NetworkKeyMaterial {
        match (self.phase, self.old.as_ref()) {
            (KeyRefreshPhase::Distributing, Some(old)) => old,
            _ => &self.current,
        }
    }

    /// Material tried for inbound PDUs: the new key first, then the old one.
    pub fn receive_candidates(&self) -> impl Iterator<Item = &NetworkKeyMaterial> {
        std::iter::once(&self.current).chain(self.old.iter())
    }
}

/// Key material of one application key.
#[derive(Clone)]
pub struct ApplicationKeyMaterial {
    key: [u8; KEY_SIZE],
    aid: u8,
}

impl ApplicationKeyMaterial {
    /// Derive the AID from the raw key.
    pub fn derive(key: [u8; KEY_SIZE]) -> Self {
        Self { aid: k4(&key), key }
    }

    /// Raw application key.
    pub fn key(&self) -> &[u8; KEY_SIZE] {
        &self.key
    }

    /// 6-bit application key identifier.
    pub fn aid(&self) -> u8 {
        self.aid
    }
}

impl Drop for ApplicationKeyMaterial {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl fmt::Debug for ApplicationKeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApplicationKeyMaterial")
            .field("aid", &self.aid)
            .finish_non_exhaustive()
    }
}

/// An application key bound to a network key.
///
/// It follows the refresh phase of its bound network key.
#[derive(Debug, Clone)]
pub struct ApplicationKey {
    index: KeyIndex,
    bound_network_key: KeyIndex,
    current: ApplicationKeyMaterial,
    old: Option<ApplicationKeyMaterial>,
}

impl ApplicationKey {
    /// Install an application key.
    pub fn new(index: KeyIndex, bound_network_key: KeyIndex, key: [u8; KEY_SIZE]) -> Self {
        Self {
            index,
            bound_network_key,
            current: ApplicationKeyMaterial::derive(key),
            old: None,
        }
    }

    /// Key index.
    pub fn index(&self) -> KeyIndex {
        self.index
    }

    /// Index of the network key this key is bound to.
    pub fn bound_network_key(&self) -> KeyIndex {
        self.bound_network_key
    }

    /// Replace the key, keeping the installed one as the old key.
    pub fn begin_refresh(&mut self, new_key: [u8; KEY_SIZE]) {
        let previous = std::mem::replace(&mut self.current, ApplicationKeyMaterial::derive(new_key));
        self.old = Some(previous);
    }

    /// Drop the old key once the refresh completes.
    pub fn finish_refresh(&mut self) {
        self.old = None;
    }

    /// Material for outbound messages under the bound key's `phase`.
    pub fn transmit_material(&self, phase: KeyRefreshPhase) -> &ApplicationKeyMaterial {
        match (phase, self.old.as_ref()) {
            (KeyRefreshPhase::Distributing, Some(old)) => old,
            _ => &self.current,
        }
    }

    /// Material tried for inbound messages: the new key first.
    pub fn receive_candidates(&self) -> impl Iterator<Item = &ApplicationKeyMaterial> {
        std::iter::once(&self.current).chain(self.old.iter())
    }
}

/// A node's device key.
#[derive(Clone)]
pub struct DeviceKey([u8; KEY_SIZE]);

impl DeviceKey {
    /// Wrap raw key bytes.
    pub fn new(key: [u8; KEY_SIZE]) -> Self {
        Self(key)
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl Drop for DeviceKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl fmt::Debug for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DeviceKey(..)")
    }
}

/// Key protecting the Upper Transport PDU.
#[derive(Debug, Clone)]
pub enum AccessKey {
    /// An application key (AKF = 1).
    Application {
        /// Key index, reported back on receipt.
        index: KeyIndex,
        /// Resolved key material.
        material: ApplicationKeyMaterial,
    },
    /// A device key (AKF = 0).
    Device(DeviceKey),
}

impl AccessKey {
    /// Application Key Flag.
    pub fn akf(&self) -> bool {
        matches!(self, AccessKey::Application { .. })
    }

    /// AID carried in the lower transport header; zero for device keys.
    pub fn aid(&self) -> u8 {
        match self {
            AccessKey::Application { material, .. } => material.aid(),
            AccessKey::Device(_) => 0,
        }
    }

    /// Raw key bytes.
    pub fn key(&self) -> &[u8; KEY_SIZE] {
        match self {
            AccessKey::Application { material, .. } => material.key(),
            AccessKey::Device(key) => key.as_bytes(),
        }
    }

    /// Application key index, if any.
    pub fn application_index(&self) -> Option<KeyIndex> {
        match self {
            AccessKey::Application { index, .. } => Some(*index),
            AccessKey::Device(_) => None,
        }
    }
}

/// Keys resolved for one outbound message.
#[derive(Debug, Clone)]
pub struct KeySet {
    /// Index of the network key.
    pub network_key_index: KeyIndex,
    /// Network key material used for transmission.
    pub network_key: NetworkKeyMaterial,
    /// Application or device key.
    pub access_key: AccessKey,
    /// Whether the 64-bit TransMIC is used.
    pub aszmic: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_index_range() {
        assert_eq!(KeyIndex::new(0x0FFF).unwrap().value(), 0x0FFF);
        assert_eq!(KeyIndex::new(0x1000), Err(ConfigError::InvalidKeyIndex(0x1000)));
    }

    #[test]
    fn test_network_key_derivation() {
        let key: [u8; 16] = hex::decode("7dd7364cd842ad18c17c2b820c84c3d6")
            .unwrap()
            .try_into()
            .unwrap();
        let net_key = NetworkKey::new(KeyIndex::PRIMARY, key);
        assert_eq!(net_key.transmit_material().nid(), 0x68);
        assert_eq!(net_key.receive_candidates().count(), 1);
    }

    #[test]
    fn test_refresh_phases() {
        let mut net_key = NetworkKey::new(KeyIndex::PRIMARY, [0x01; KEY_SIZE]);
        let old_nid = net_key.transmit_material().nid();

        net_key.begin_refresh([0x02; KEY_SIZE]);
        let new_nid = NetworkKeyMaterial::derive([0x02; KEY_SIZE]).nid();
        assert_eq!(net_key.phase(), KeyRefreshPhase::Distributing);
        assert_eq!(net_key.transmit_material().nid(), old_nid);

        let candidates: Vec<u8> = net_key.receive_candidates().map(|m| m.nid()).collect();
        assert_eq!(candidates, vec![new_nid, old_nid]);

        net_key.set_phase(KeyRefreshPhase::Finalizing);
        assert_eq!(net_key.transmit_material().nid(), new_nid);
        assert_eq!(net_key.receive_candidates().count(), 2);

        net_key.set_phase(KeyRefreshPhase::Normal);
        assert_eq!(net_key.receive_candidates().count(), 1);
    }

    #[test]
    fn test_application_key_follows_phase() {
        let mut app_key = ApplicationKey::new(KeyIndex::PRIMARY, KeyIndex::PRIMARY, [0x03; KEY_SIZE]);
        let old_aid = app_key.transmit_material(KeyRefreshPhase::Normal).aid();
        app_key.begin_refresh([0x04; KEY_SIZE]);

        assert_eq!(app_key.transmit_material(KeyRefreshPhase::Distributing).aid(), old_aid);
        assert_eq!(
            app_key.transmit_material(KeyRefreshPhase::Finalizing).aid(),
            ApplicationKeyMaterial::derive([0x04; KEY_SIZE]).aid()
        );
    }

    #[test]
    fn test_access_key_flags() {
        let device = AccessKey::Device(DeviceKey::new([0x05; KEY_SIZE]));
        assert!(!device.akf());
        assert_eq!(device.aid(), 0);
        assert_eq!(device.application_index(), None);

        let material = ApplicationKeyMaterial::derive([0x06; KEY_SIZE]);
        let aid = material.aid();
        let app = AccessKey::Application {
            index: KeyIndex::PRIMARY,
            material,
        };
        assert!(app.akf());
        assert_eq!(app.aid(), aid);
    }

    #[test]
    fn test_debug_hides_secrets() {
        let rendered = format!("{:?}", DeviceKey::new([0xAB; KEY_SIZE]));
        assert!(!rendered.contains("171"));
    }
}
