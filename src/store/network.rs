//! Read-only view of the mesh network configuration.
//!
//! Holds keys, the IV index and the node/element/model table the pipeline
//! resolves against. Provisioning and configuration messages that would
//! mutate it live outside this crate; the application builds a
//! [`MeshNetwork`] and hands it to the manager.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::core::{Address, ConfigError, DEFAULT_TTL, IvIndex, LABEL_UUID_SIZE, MeshAddress};
use crate::crypto::{AccessKey, ApplicationKey, DeviceKey, KeyIndex, KeySet, NetworkKey};

/// Model identifier: a 16-bit SIG model or a 32-bit vendor model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModelId(u32);

impl ModelId {
    /// A Bluetooth SIG model.
    pub const fn sig(id: u16) -> Self {
        Self(id as u32)
    }

    /// A vendor model.
    pub const fn vendor(company: u16, id: u16) -> Self {
        Self(((company as u32) << 16) | id as u32)
    }

    /// Raw identifier.
    pub const fn value(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// Publication retransmission policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Retransmit {
    /// Additional sends after the first one.
    pub count: u8,
    /// Interval between sends.
    pub interval: Duration,
}

/// Publication settings of a model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    /// Publication address.
    pub address: MeshAddress,
    /// Application key used for publishing.
    pub app_key_index: KeyIndex,
    /// TTL, or `None` for the node default.
    pub ttl: Option<u8>,
    /// Retransmission policy.
    pub retransmit: Retransmit,
}

/// A model on an element.
#[derive(Debug, Clone)]
pub struct Model {
    id: ModelId,
    bound_app_keys: Vec<KeyIndex>,
    subscriptions: Vec<MeshAddress>,
    publish: Option<Publish>,
}

impl Model {
    /// Model with no bindings.
    pub fn new(id: ModelId) -> Self {
        Self {
            id,
            bound_app_keys: Vec::new(),
            subscriptions: Vec::new(),
            publish: None,
        }
    }

    /// Bind an application key.
    pub fn bind(mut self, key: KeyIndex) -> Self {
        if !self.bound_app_keys.contains(&key) {
            self.bound_app_keys.push(key);
            self.bound_app_keys.sort();
        }
        self
    }

    /// Subscribe to a group or virtual address.
    pub fn subscribe(mut self, address: MeshAddress) -> Self {
        self.subscriptions.push(address);
        self
    }

    /// Configure publication.
    pub fn with_publish(mut self, publish: Publish) -> Self {
        self.publish = Some(publish);
        self
    }

    /// Model identifier.
    pub fn id(&self) -> ModelId {
        self.id
    }

    /// Bound application keys, in index order.
    pub fn bound_app_keys(&self) -> &[KeyIndex] {
        &self.bound_app_keys
    }

    /// Subscription list.
    pub fn subscriptions(&self) -> &[MeshAddress] {
        &self.subscriptions
    }

    /// Publication settings.
    pub fn publish(&self) -> Option<&Publish> {
        self.publish.as_ref()
    }

    fn is_subscribed(&self, address: Address) -> bool {
        self.subscriptions.iter().any(|s| s.address() == address)
    }
}

/// An element of a node.
#[derive(Debug, Clone)]
pub struct Element {
    address: Address,
    models: Vec<Model>,
}

impl Element {
    /// Element at `address`.
    pub fn new(address: Address) -> Self {
        Self {
            address,
            models: Vec::new(),
        }
    }

    /// Add a model.
    pub fn with_model(mut self, model: Model) -> Self {
        self.models.push(model);
        self
    }

    /// Unicast address.
    pub fn address(&self) -> Address {
        self.address
    }

    /// Models on this element.
    pub fn models(&self) -> &[Model] {
        &self.models
    }
}

/// A node in the network.
#[derive(Debug, Clone)]
pub struct Node {
    device_key: DeviceKey,
    network_keys: Vec<KeyIndex>,
    elements: Vec<Element>,
    default_ttl: u8,
}

impl Node {
    /// Node with a device key and no elements yet.
    pub fn new(device_key: DeviceKey) -> Self {
        Self {
            device_key,
            network_keys: vec![KeyIndex::PRIMARY],
            elements: Vec::new(),
            default_ttl: DEFAULT_TTL,
        }
    }

    /// Add an element. The first element is the primary one.
    pub fn with_element(mut self, element: Element) -> Self {
        self.elements.push(element);
        self
    }

    /// Replace the list of network keys known to the node.
    pub fn with_network_keys(mut self, keys: Vec<KeyIndex>) -> Self {
        self.network_keys = keys;
        self
    }

    /// Default TTL.
    pub fn with_default_ttl(mut self, ttl: u8) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Primary element address.
    pub fn primary_address(&self) -> Address {
        self.elements
            .first()
            .map(Element::address)
            .unwrap_or(Address::UNASSIGNED)
    }

    /// Device key.
    pub fn device_key(&self) -> &DeviceKey {
        &self.device_key
    }

    /// Elements in address order of declaration.
    pub fn elements(&self) -> &[Element] {
        &self.elements
    }

    /// Default TTL.
    pub fn default_ttl(&self) -> u8 {
        self.default_ttl
    }

    fn contains(&self, address: Address) -> bool {
        self.elements.iter().any(|e| e.address == address)
    }
}

/// Keys, IV index and node table of one mesh network.
#[derive(Debug, Clone)]
pub struct MeshNetwork {
    iv_index: IvIndex,
    network_keys: BTreeMap<KeyIndex, NetworkKey>,
    application_keys: BTreeMap<KeyIndex, ApplicationKey>,
    nodes: Vec<Node>,
    local_address: Address,
}

impl MeshNetwork {
    /// Network whose local node has primary element `local_address`.
    pub fn new(iv_index: IvIndex, local_address: Address) -> Self {
        Self {
            iv_index,
            network_keys: BTreeMap::new(),
            application_keys: BTreeMap::new(),
            nodes: Vec::new(),
            local_address,
        }
    }

    /// Add a network key.
    pub fn with_network_key(mut self, key: NetworkKey) -> Self {
        self.network_keys.insert(key.index(), key);
        self
    }

    /// Add an application key.
    pub fn with_application_key(mut self, key: ApplicationKey) -> Self {
        self.application_keys.insert(key.index(), key);
        self
    }

    /// Add a node.
    pub fn with_node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    /// Current IV index.
    pub fn iv_index(&self) -> IvIndex {
        self.iv_index
    }

    /// Update the IV index.
    pub fn set_iv_index(&mut self, iv_index: IvIndex) {
        self.iv_index = iv_index;
    }

    /// Primary address of the local node.
    pub fn local_address(&self) -> Address {
        self.local_address
    }

    /// Network key by index.
    pub fn network_key(&self, index: KeyIndex) -> Result<&NetworkKey, ConfigError> {
        self.network_keys
            .get(&index)
            .ok_or(ConfigError::NetworkKeyNotFound(index.value()))
    }

    /// Mutable network key, for key refresh.
    pub fn network_key_mut(&mut self, index: KeyIndex) -> Result<&mut NetworkKey, ConfigError> {
        self.network_keys
            .get_mut(&index)
            .ok_or(ConfigError::NetworkKeyNotFound(index.value()))
    }

    /// All network keys in index order.
    pub fn network_keys(&self) -> impl Iterator<Item = &NetworkKey> {
        self.network_keys.values()
    }

    /// Application key by index.
    pub fn application_key(&self, index: KeyIndex) -> Result<&ApplicationKey, ConfigError> {
        self.application_keys
            .get(&index)
            .ok_or(ConfigError::ApplicationKeyNotFound(index.value()))
    }

    /// Mutable application key, for key refresh.
    pub fn application_key_mut(
        &mut self,
        index: KeyIndex,
    ) -> Result<&mut ApplicationKey, ConfigError> {
        self.application_keys
            .get_mut(&index)
            .ok_or(ConfigError::ApplicationKeyNotFound(index.value()))
    }

    /// Node owning the element `address`.
    pub fn node(&self, address: Address) -> Option<&Node> {
        self.nodes.iter().find(|node| node.contains(address))
    }

    /// The local node.
    pub fn local_node(&self) -> Result<&Node, ConfigError> {
        self.node(self.local_address)
            .ok_or(ConfigError::ElementNotLocal(self.local_address))
    }

    /// Whether `address` is an element of the local node.
    pub fn is_local_element(&self, address: Address) -> bool {
        self.local_node().is_ok_and(|node| node.contains(address))
    }

    /// Local element at `address`.
    pub fn local_element(&self, address: Address) -> Result<&Element, ConfigError> {
        self.local_node()?
            .elements
            .iter()
            .find(|e| e.address == address)
            .ok_or(ConfigError::ElementNotLocal(address))
    }

    /// Model on a local element.
    pub fn model(&self, element: Address, model_id: ModelId) -> Result<&Model, ConfigError> {
        self.local_element(element)?
            .models
            .iter()
            .find(|m| m.id == model_id)
            .ok_or(ConfigError::ModelNotFound {
                element,
                model_id: model_id.value(),
            })
    }

    /// Publication settings of a local model.
    pub fn publication(&self, element: Address, model_id: ModelId) -> Result<&Publish, ConfigError> {
        self.model(element, model_id)?
            .publish()
            .ok_or(ConfigError::ModelNotPublished {
                element,
                model_id: model_id.value(),
            })
    }

    /// Device key of the node owning `address`.
    pub fn device_key(&self, address: Address) -> Result<&DeviceKey, ConfigError> {
        self.node(address)
            .map(Node::device_key)
            .ok_or(ConfigError::DeviceKeyNotFound(address))
    }

    /// Default TTL of the local node.
    pub fn default_ttl(&self) -> u8 {
        self.local_node().map(Node::default_ttl).unwrap_or(DEFAULT_TTL)
    }

    /// Whether the local node accepts traffic sent to `destination`.
    pub fn is_local_destination(&self, destination: Address) -> bool {
        if destination == Address::ALL_NODES {
            return true;
        }
        if destination.is_unicast() {
            return self.is_local_element(destination);
        }
        self.local_models().any(|m| m.is_subscribed(destination))
    }

    /// Application keys bound to any local model that receives
    /// `destination`, in index order.
    pub fn receiving_app_keys(&self, destination: Address) -> Vec<KeyIndex> {
        let mut keys: Vec<KeyIndex> = match self.local_node() {
            Ok(node) => node
                .elements
                .iter()
                .flat_map(|element| {
                    element.models.iter().filter(move |model| {
                        element.address == destination
                            || destination == Address::ALL_NODES
                            || model.is_subscribed(destination)
                    })
                })
                .flat_map(|model| model.bound_app_keys.iter().copied())
                .collect(),
            Err(_) => Vec::new(),
        };
        keys.sort();
        keys.dedup();
        keys
    }

    /// Label UUIDs known locally whose virtual address is `address`.
    pub fn virtual_labels(&self, address: Address) -> Vec<[u8; LABEL_UUID_SIZE]> {
        let mut labels: Vec<[u8; LABEL_UUID_SIZE]> = Vec::new();
        for model in self.local_models() {
            let publication = model.publish.iter().map(|p| &p.address);
            for candidate in model.subscriptions.iter().chain(publication) {
                if candidate.address() == address {
                    if let Some(label) = candidate.label() {
                        if !labels.contains(label) {
                            labels.push(*label);
                        }
                    }
                }
            }
        }
        labels
    }

    fn local_models(&self) -> impl Iterator<Item = &Model> {
        self.local_node()
            .into_iter()
            .flat_map(|node| node.elements.iter())
            .flat_map(|element| element.models.iter())
    }

    /// Resolve the keys for a message encrypted with an application key.
    pub fn application_key_set(&self, index: KeyIndex, aszmic: bool) -> Result<KeySet, ConfigError> {
        let app_key = self.application_key(index)?;
        let net_key = self.network_key(app_key.bound_network_key())?;
        Ok(KeySet {
            network_key_index: net_key.index(),
            network_key: net_key.transmit_material().clone(),
            access_key: AccessKey::Application {
                index,
                material: app_key.transmit_material(net_key.phase()).clone(),
            },
            aszmic,
        })
    }

    /// Resolve the keys for a message to or from `node` encrypted with its
    /// device key.
    pub fn device_key_set(&self, node: Address, aszmic: bool) -> Result<KeySet, ConfigError> {
        let device_key = self.device_key(node)?;
        let net_key = self.device_network_key(node)?;
        Ok(KeySet {
            network_key_index: net_key.index(),
            network_key: net_key.transmit_material().clone(),
            access_key: AccessKey::Device(device_key.clone()),
            aszmic,
        })
    }

    /// Network key shared with `node`: the lowest index both sides know.
    fn device_network_key(&self, node: Address) -> Result<&NetworkKey, ConfigError> {
        let known = self.node(node).map(|n| n.network_keys.as_slice()).unwrap_or(&[]);
        known
            .iter()
            .find_map(|index| self.network_keys.get(index))
            .or_else(|| self.network_keys.values().next())
            .ok_or(ConfigError::NetworkKeyNotFound(KeyIndex::PRIMARY.value()))
    }

    /// Key set for a proxy configuration message: the primary network key.
    pub fn primary_network_key(&self) -> Result<&NetworkKey, ConfigError> {
        self.network_keys
            .values()
            .next()
            .ok_or(ConfigError::NetworkKeyNotFound(KeyIndex::PRIMARY.value()))
    }
}
