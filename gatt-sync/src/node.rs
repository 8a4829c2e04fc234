//! The mirrored GATT hierarchy
//!
//! Nodes are plain data, owned by their parent's child collection and only
//! ever mutated by the [`CentralEngine`](crate::CentralEngine). Upward
//! navigation is via the id paths stored in each node.

use std::collections::HashSet;

use uuid::Uuid;

use crate::characteristic::CharacteristicProperties;
use crate::value::{CharacteristicKind, DescriptorKind, ServiceKind, Value};
use crate::{CharacteristicPath, DescriptorPath, Handle, OpToken, ServicePath};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PeripheralState {
    Discovered,
    Connecting,
    Connected,
    DiscoveringServices,
    Ready,
    Disconnecting,
    Disconnected,
}

impl PeripheralState {
    /// True for every state where a GATT connection is (believed to be) open
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            PeripheralState::Connected | PeripheralState::DiscoveringServices | PeripheralState::Ready
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ServiceState {
    Discovered,
    DiscoveringCharacteristics,
    Ready,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CharacteristicState {
    Discovered,
    DiscoveringDescriptors,
    Ready,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum OpKind {
    Connect,
    Disconnect,
    DiscoverServices,
    DiscoverCharacteristics,
    DiscoverDescriptors,
    Read,
    Write,
    // Only used for characteristics on transports without a visible
    // configuration descriptor
    SetNotify(bool),
}

/// The single in-flight operation a node may have
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Pending {
    pub(crate) kind: OpKind,
    pub(crate) token: OpToken,
}

/// Anything stored in a [`ChildMap`]
pub trait Keyed {
    fn key(&self) -> Uuid;
}

/// An insertion-ordered collection of nodes, keyed by their id
///
/// XXX: we expect fairly tiny collections so linear lookups are fine
#[derive(Clone, Debug)]
pub struct ChildMap<T> {
    items: Vec<T>,
}

impl<T> Default for ChildMap<T> {
    fn default() -> Self {
        Self { items: vec![] }
    }
}

impl<T: Keyed> ChildMap<T> {
    pub fn get(&self, id: &Uuid) -> Option<&T> {
        self.items.iter().find(|item| item.key() == *id)
    }

    pub(crate) fn get_mut(&mut self, id: &Uuid) -> Option<&mut T> {
        self.items.iter_mut().find(|item| item.key() == *id)
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.get(id).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.items.iter_mut()
    }

    pub fn ids(&self) -> Vec<Uuid> {
        self.items.iter().map(|item| item.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Returns the existing node for `id` (and `false`), or inserts the node
    /// built by `create` at the end (and `true`)
    pub(crate) fn upsert_with(&mut self, id: Uuid, create: impl FnOnce() -> T) -> (&mut T, bool) {
        match self.items.iter().position(|item| item.key() == id) {
            Some(i) => (&mut self.items[i], false),
            None => {
                self.items.push(create());
                let last = self.items.len() - 1;
                (&mut self.items[last], true)
            }
        }
    }

    pub(crate) fn remove(&mut self, id: &Uuid) -> Option<T> {
        let i = self.items.iter().position(|item| item.key() == *id)?;
        Some(self.items.remove(i))
    }

    pub(crate) fn drain(&mut self) -> std::vec::Drain<'_, T> {
        self.items.drain(..)
    }
}

#[derive(Clone, Debug)]
pub struct PeripheralNode {
    pub(crate) id: Uuid,
    pub(crate) handle: Handle,
    pub(crate) name: Option<String>,
    pub(crate) rssi: i16,
    pub(crate) advertised_services: HashSet<Uuid>,
    pub(crate) state: PeripheralState,
    pub(crate) pending: Option<Pending>,
    // Distinguishes a caller initiated disconnect from a lost link
    pub(crate) disconnect_requested: bool,
    pub(crate) services: ChildMap<ServiceNode>,
}

impl Keyed for PeripheralNode {
    fn key(&self) -> Uuid {
        self.id
    }
}

impl PeripheralNode {
    pub(crate) fn new(id: Uuid, handle: Handle, name: Option<String>, rssi: i16) -> Self {
        Self {
            id,
            handle,
            name,
            rssi,
            advertised_services: HashSet::new(),
            state: PeripheralState::Discovered,
            pending: None,
            disconnect_requested: false,
            services: ChildMap::default(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }
    pub fn handle(&self) -> Handle {
        self.handle
    }
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
    pub fn rssi(&self) -> i16 {
        self.rssi
    }
    pub fn state(&self) -> PeripheralState {
        self.state
    }
    /// Service ids seen in advertisements (which may be incomplete)
    pub fn advertised_services(&self) -> &HashSet<Uuid> {
        &self.advertised_services
    }
    pub fn services(&self) -> &ChildMap<ServiceNode> {
        &self.services
    }
    pub fn is_busy(&self) -> bool {
        self.pending.is_some()
    }
}

#[derive(Clone, Debug)]
pub struct ServiceNode {
    pub(crate) path: ServicePath,
    pub(crate) handle: Handle,
    pub(crate) is_primary: bool,
    pub(crate) kind: ServiceKind,
    pub(crate) state: ServiceState,
    pub(crate) pending: Option<Pending>,
    pub(crate) characteristics: ChildMap<CharacteristicNode>,
}

impl Keyed for ServiceNode {
    fn key(&self) -> Uuid {
        self.path.service
    }
}

impl ServiceNode {
    pub(crate) fn new(path: ServicePath, handle: Handle, is_primary: bool) -> Self {
        Self {
            path,
            handle,
            is_primary,
            kind: ServiceKind::from_uuid(path.service),
            state: ServiceState::Discovered,
            pending: None,
            characteristics: ChildMap::default(),
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.path.service
    }
    pub fn path(&self) -> ServicePath {
        self.path
    }
    pub fn handle(&self) -> Handle {
        self.handle
    }
    pub fn is_primary(&self) -> bool {
        self.is_primary
    }
    pub fn kind(&self) -> ServiceKind {
        self.kind
    }
    pub fn state(&self) -> ServiceState {
        self.state
    }
    pub fn characteristics(&self) -> &ChildMap<CharacteristicNode> {
        &self.characteristics
    }
}

#[derive(Clone, Debug)]
pub struct CharacteristicNode {
    pub(crate) path: CharacteristicPath,
    pub(crate) handle: Handle,
    pub(crate) properties: CharacteristicProperties,
    pub(crate) kind: CharacteristicKind,
    pub(crate) state: CharacteristicState,
    pub(crate) pending: Option<Pending>,
    pub(crate) value: Option<Vec<u8>>,
    pub(crate) notifying: bool,
    pub(crate) descriptors: ChildMap<DescriptorNode>,
}

impl Keyed for CharacteristicNode {
    fn key(&self) -> Uuid {
        self.path.characteristic
    }
}

impl CharacteristicNode {
    pub(crate) fn new(path: CharacteristicPath, handle: Handle, properties: CharacteristicProperties) -> Self {
        Self {
            path,
            handle,
            properties,
            kind: CharacteristicKind::from_uuid(path.characteristic),
            state: CharacteristicState::Discovered,
            pending: None,
            value: None,
            notifying: false,
            descriptors: ChildMap::default(),
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.path.characteristic
    }
    pub fn path(&self) -> CharacteristicPath {
        self.path
    }
    pub fn handle(&self) -> Handle {
        self.handle
    }
    pub fn properties(&self) -> CharacteristicProperties {
        self.properties
    }
    pub fn kind(&self) -> CharacteristicKind {
        self.kind
    }
    pub fn state(&self) -> CharacteristicState {
        self.state
    }
    pub fn is_busy(&self) -> bool {
        self.pending.is_some()
    }
    /// The last value read or notified, if any
    pub fn value(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }
    pub fn decoded(&self) -> Option<Value> {
        self.value.as_deref().and_then(|bytes| self.kind.decode(bytes))
    }
    pub fn is_notifying(&self) -> bool {
        self.notifying
    }
    pub fn descriptors(&self) -> &ChildMap<DescriptorNode> {
        &self.descriptors
    }
}

#[derive(Clone, Debug)]
pub struct DescriptorNode {
    pub(crate) path: DescriptorPath,
    pub(crate) handle: Handle,
    pub(crate) kind: DescriptorKind,
    pub(crate) pending: Option<Pending>,
    // Set on write completion so we know what to cache
    pub(crate) written: Option<Vec<u8>>,
    pub(crate) value: Option<Vec<u8>>,
}

impl Keyed for DescriptorNode {
    fn key(&self) -> Uuid {
        self.path.descriptor
    }
}

impl DescriptorNode {
    pub(crate) fn new(path: DescriptorPath, handle: Handle) -> Self {
        Self {
            path,
            handle,
            kind: DescriptorKind::from_uuid(path.descriptor),
            pending: None,
            written: None,
            value: None,
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.path.descriptor
    }
    pub fn path(&self) -> DescriptorPath {
        self.path
    }
    pub fn handle(&self) -> Handle {
        self.handle
    }
    pub fn kind(&self) -> DescriptorKind {
        self.kind
    }
    pub fn is_busy(&self) -> bool {
        self.pending.is_some()
    }
    pub fn value(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }
    pub fn decoded(&self) -> Option<Value> {
        self.value.as_deref().and_then(|bytes| self.kind.decode(bytes))
    }
}
