//! Shared value types: addresses, IV index and message handles.

use std::fmt;

use super::constants::LABEL_UUID_SIZE;

/// Classification of a 16-bit mesh address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressKind {
    /// `0x0000`, never valid as a source or destination of mesh traffic.
    Unassigned,
    /// `0x0001..=0x7FFF`, a single element.
    Unicast,
    /// `0x8000..=0xBFFF`, hash of a label UUID.
    Virtual,
    /// `0xC000..=0xFFFE`, including the fixed group addresses.
    Group,
    /// `0xFFFF`, every node.
    AllNodes,
}

/// A 16-bit mesh address.
///
/// The classification is a pure function of the bit pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Address(u16);

impl Address {
    /// The unassigned address.
    pub const UNASSIGNED: Self = Self(0x0000);
    /// All proxies fixed group.
    pub const ALL_PROXIES: Self = Self(0xFFFC);
    /// All friends fixed group.
    pub const ALL_FRIENDS: Self = Self(0xFFFD);
    /// All relays fixed group.
    pub const ALL_RELAYS: Self = Self(0xFFFE);
    /// All nodes fixed group.
    pub const ALL_NODES: Self = Self(0xFFFF);

    /// Wrap a raw address.
    pub const fn new(value: u16) -> Self {
        Self(value)
    }

    /// Raw 16-bit value.
    pub const fn value(self) -> u16 {
        self.0
    }

    /// Classify the address.
    pub const fn kind(self) -> AddressKind {
        match self.0 {
            0x0000 => AddressKind::Unassigned,
            0x0001..=0x7FFF => AddressKind::Unicast,
            0x8000..=0xBFFF => AddressKind::Virtual,
            0xC000..=0xFFFE => AddressKind::Group,
            0xFFFF => AddressKind::AllNodes,
        }
    }

    /// Whether this is a unicast (element) address.
    pub const fn is_unicast(self) -> bool {
        matches!(self.kind(), AddressKind::Unicast)
    }

    /// Whether this is a virtual address.
    pub const fn is_virtual(self) -> bool {
        matches!(self.kind(), AddressKind::Virtual)
    }

    /// Whether this is a group address, fixed groups included.
    pub const fn is_group(self) -> bool {
        matches!(self.kind(), AddressKind::Group | AddressKind::AllNodes)
    }

    /// Whether this address is anything other than unassigned.
    pub const fn is_assigned(self) -> bool {
        self.0 != 0
    }

    /// Big-endian wire encoding.
    pub const fn to_be_bytes(self) -> [u8; 2] {
        self.0.to_be_bytes()
    }

    /// Parse from big-endian wire bytes.
    pub const fn from_be_bytes(bytes: [u8; 2]) -> Self {
        Self(u16::from_be_bytes(bytes))
    }
}

impl From<u16> for Address {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04X}", self.0)
    }
}

/// A destination address, with the label UUID when it is virtual.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MeshAddress {
    address: Address,
    label: Option<[u8; LABEL_UUID_SIZE]>,
}

impl MeshAddress {
    /// A plain (unicast or group) destination.
    pub const fn new(address: Address) -> Self {
        Self {
            address,
            label: None,
        }
    }

    /// A virtual destination computed from its label UUID.
    pub fn from_label(label: [u8; LABEL_UUID_SIZE]) -> Self {
        Self {
            address: crate::crypto::virtual_address(&label),
            label: Some(label),
        }
    }

    /// The 16-bit address carried in the Network PDU.
    pub const fn address(&self) -> Address {
        self.address
    }

    /// Label UUID for virtual destinations.
    pub fn label(&self) -> Option<&[u8; LABEL_UUID_SIZE]> {
        self.label.as_ref()
    }
}

impl From<Address> for MeshAddress {
    fn from(address: Address) -> Self {
        Self::new(address)
    }
}

impl fmt::Display for MeshAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.address.fmt(f)
    }
}

/// The network-wide IV index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct IvIndex {
    /// Current IV index.
    pub index: u32,
    /// Whether the IV Update procedure is in progress.
    pub update_active: bool,
}

impl IvIndex {
    /// IV index in normal operation.
    pub const fn new(index: u32) -> Self {
        Self {
            index,
            update_active: false,
        }
    }

    /// Index used for outbound PDUs.
    ///
    /// During an IV Update the previous index keeps being used for sending.
    pub const fn transmit_index(&self) -> u32 {
        if self.update_active {
            self.index.saturating_sub(1)
        } else {
            self.index
        }
    }

    /// Index a received PDU was sent with, selected by its IVI bit.
    pub const fn receive_index(&self, ivi: bool) -> u32 {
        if (self.index & 1 == 1) == ivi {
            self.index
        } else {
            self.index.saturating_sub(1)
        }
    }
}

/// Opaque identifier of an in-flight send, used for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageHandle(u64);

impl MessageHandle {
    /// Wrap a raw handle value.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw handle value.
    pub const fn as_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for MessageHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_classification() {
        assert_eq!(Address::new(0x0000).kind(), AddressKind::Unassigned);
        assert_eq!(Address::new(0x0001).kind(), AddressKind::Unicast);
        assert_eq!(Address::new(0x7FFF).kind(), AddressKind::Unicast);
        assert_eq!(Address::new(0x8000).kind(), AddressKind::Virtual);
        assert_eq!(Address::new(0xBFFF).kind(), AddressKind::Virtual);
        assert_eq!(Address::new(0xC000).kind(), AddressKind::Group);
        assert_eq!(Address::ALL_RELAYS.kind(), AddressKind::Group);
        assert_eq!(Address::ALL_NODES.kind(), AddressKind::AllNodes);

        assert!(Address::ALL_NODES.is_group());
        assert!(!Address::new(0x1234).is_group());
        assert!(!Address::UNASSIGNED.is_assigned());
    }

    #[test]
    fn test_address_wire_bytes() {
        let address = Address::new(0x1201);
        assert_eq!(address.to_be_bytes(), [0x12, 0x01]);
        assert_eq!(Address::from_be_bytes([0x12, 0x01]), address);
        assert_eq!(address.to_string(), "0x1201");
    }

    #[test]
    fn test_iv_index_selection() {
        let iv = IvIndex::new(0x1234_5679);
        assert_eq!(iv.transmit_index(), 0x1234_5679);
        assert_eq!(iv.receive_index(true), 0x1234_5679);
        assert_eq!(iv.receive_index(false), 0x1234_5678);

        let updating = IvIndex {
            index: 10,
            update_active: true,
        };
        assert_eq!(updating.transmit_index(), 9);
        assert_eq!(updating.receive_index(false), 10);
        assert_eq!(updating.receive_index(true), 9);
    }

    #[test]
    fn test_virtual_address_from_label() {
        let destination = MeshAddress::from_label([0x42; LABEL_UUID_SIZE]);
        assert!(destination.address().is_virtual());
        assert_eq!(destination.label(), Some(&[0x42; LABEL_UUID_SIZE]));
    }
}
