use std::collections::HashMap;
use std::time::Duration;

use log::{debug, trace, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::characteristic::{CharacteristicProperties, WriteType};
use crate::criteria::{Advertisement, DuplicatePolicy, ScanCriteria};
use crate::node::{
    CharacteristicNode, CharacteristicState, ChildMap, DescriptorNode, OpKind, Pending, PeripheralNode,
    PeripheralState, ServiceNode, ServiceState,
};
use crate::transport::{
    DiscoveredCharacteristic, DiscoveredDescriptor, DiscoveredService, Scheduler, Transport, TransportEvent,
    UNSPECIFIED_FAILURE,
};
use crate::uuid::BluetoothUuid;
use crate::value::{ClientConfiguration, CharacteristicKind, DescriptorKind, Value};
use crate::{
    CharacteristicPath, DescriptorPath, Error, Event, GattError, Handle, NodePath, OpToken, Result, ServicePath,
};

/// What happens to a peripheral once its connection closes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReconnectPolicy {
    /// Keep the (emptied) peripheral in the `Disconnected` state until the
    /// application connects again
    Manual,
    /// Immediately try to reconnect after an unexpected disconnect
    Auto,
    /// Drop the peripheral and its whole subtree
    Forget,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub connect_timeout: Duration,
    pub disconnect_timeout: Duration,
    pub discovery_timeout: Duration,
    /// Applies to reads, writes and notification subscription changes
    pub io_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    /// How many observer events can be buffered per subscriber before the
    /// slowest subscriber starts to lag
    pub event_capacity: usize,
    /// The criteria used until `start_scanning` provides new ones
    pub criteria: ScanCriteria,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            disconnect_timeout: Duration::from_secs(5),
            discovery_timeout: Duration::from_secs(10),
            io_timeout: Duration::from_secs(5),
            reconnect: ReconnectPolicy::Manual,
            event_capacity: 256,
            criteria: ScanCriteria::default(),
        }
    }
}

// Everything the engine talks to, kept apart from the tree itself so
// handlers can issue commands while holding a mutable borrow of a node.
#[derive(Debug)]
struct Dispatch {
    transport: Box<dyn Transport>,
    scheduler: Box<dyn Scheduler>,
    event_bus: broadcast::Sender<Event>,
    next_token: u64,
    connect_timeout: Duration,
    disconnect_timeout: Duration,
    discovery_timeout: Duration,
    io_timeout: Duration,
}

impl Dispatch {
    fn emit(&self, event: Event) {
        trace!("Notifying {:?}", event);
        // No subscribers isn't an error
        let _ = self.event_bus.send(event);
    }

    /// Allocates a token for a newly dispatched operation and arms its timer
    fn begin(&mut self, kind: OpKind, handle: Handle) -> Pending {
        let token = OpToken(self.next_token);
        self.next_token += 1;
        let timeout = match kind {
            OpKind::Connect => self.connect_timeout,
            OpKind::Disconnect => self.disconnect_timeout,
            OpKind::DiscoverServices | OpKind::DiscoverCharacteristics | OpKind::DiscoverDescriptors => {
                self.discovery_timeout
            }
            OpKind::Read | OpKind::Write | OpKind::SetNotify(_) => self.io_timeout,
        };
        self.scheduler.arm(handle, token, timeout);
        Pending { kind, token }
    }

    fn finish(&self, pending: Pending) {
        self.scheduler.cancel(pending.token);
    }

    fn set_peripheral_state(&self, peripheral: &mut PeripheralNode, state: PeripheralState) {
        if peripheral.state != state {
            debug!("Peripheral {}: {:?} -> {:?}", peripheral.id, peripheral.state, state);
            peripheral.state = state;
            self.emit(Event::PeripheralStateChanged {
                peripheral: peripheral.id,
                state,
            });
        }
    }
}

type HandleIndex = HashMap<Handle, NodePath>;

/// The root of the mirrored GATT hierarchy
///
/// The engine owns every node, issues commands to the [`Transport`] and is
/// the only thing that mutates the tree: either from a command (`connect()`,
/// `read_characteristic()` etc.) or from [`on_transport_event()`] which is the
/// single intake point for everything the transport reports.
///
/// All mutation happens through `&mut self` so the engine needs to be driven
/// from one serialized context. [`Session`](crate::session::Session) does
/// that for async applications.
///
/// [`on_transport_event()`]: Self::on_transport_event
#[derive(Debug)]
pub struct CentralEngine {
    config: EngineConfig,
    dispatch: Dispatch,
    criteria: ScanCriteria,
    is_scanning: bool,
    peripherals: ChildMap<PeripheralNode>,

    // Every live node is reachable from its transport handle. Entries are
    // added when nodes are created and purged when they are destroyed.
    handles: HandleIndex,
}

impl CentralEngine {
    pub fn new(config: EngineConfig, transport: Box<dyn Transport>, scheduler: Box<dyn Scheduler>) -> Self {
        let (event_bus, _) = broadcast::channel(config.event_capacity.max(1));
        let dispatch = Dispatch {
            transport,
            scheduler,
            event_bus,
            next_token: 0,
            connect_timeout: config.connect_timeout,
            disconnect_timeout: config.disconnect_timeout,
            discovery_timeout: config.discovery_timeout,
            io_timeout: config.io_timeout,
        };
        Self {
            criteria: config.criteria.clone(),
            config,
            dispatch,
            is_scanning: false,
            peripherals: ChildMap::default(),
            handles: HashMap::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Subscribe to the observer bus. Events are delivered in the order they
    /// are generated; drop the receiver to unsubscribe.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.dispatch.event_bus.subscribe()
    }

    pub(crate) fn event_bus(&self) -> broadcast::Sender<Event> {
        self.dispatch.event_bus.clone()
    }

    pub fn is_scanning(&self) -> bool {
        self.is_scanning
    }

    pub fn criteria(&self) -> &ScanCriteria {
        &self.criteria
    }

    pub fn peripherals(&self) -> &ChildMap<PeripheralNode> {
        &self.peripherals
    }

    pub fn peripheral(&self, id: Uuid) -> Option<&PeripheralNode> {
        self.peripherals.get(&id)
    }

    pub fn service(&self, path: &ServicePath) -> Option<&ServiceNode> {
        self.peripherals.get(&path.peripheral)?.services.get(&path.service)
    }

    pub fn characteristic(&self, path: &CharacteristicPath) -> Option<&CharacteristicNode> {
        self.service(&path.service())?.characteristics.get(&path.characteristic)
    }

    pub fn descriptor(&self, path: &DescriptorPath) -> Option<&DescriptorNode> {
        self.characteristic(&path.characteristic())?.descriptors.get(&path.descriptor)
    }

    /// Look up which node a transport handle currently refers to
    pub fn resolve(&self, handle: Handle) -> Option<NodePath> {
        self.handles.get(&handle).copied()
    }

    /// Starts (or keeps) scanning
    ///
    /// Calling this while already scanning only replaces the criteria used
    /// to filter subsequent advertisements.
    pub fn start_scanning(&mut self, criteria: ScanCriteria) -> Result<()> {
        if self.is_scanning {
            debug!("Already scanning; updating scan criteria");
            self.criteria = criteria;
            return Ok(());
        }

        self.dispatch.transport.scan(&criteria)?;
        self.criteria = criteria;
        self.is_scanning = true;
        Ok(())
    }

    pub fn stop_scanning(&mut self) {
        if self.is_scanning {
            if let Err(err) = self.dispatch.transport.stop_scan() {
                warn!("Failed to stop transport scan: {}", err);
            }
        }
        self.is_scanning = false;
    }

    pub fn connect(&mut self, id: Uuid) -> Result<()> {
        let peripheral = self.peripherals.get_mut(&id).ok_or(Error::UnknownPeripheral(id))?;
        match peripheral.state {
            PeripheralState::Connecting
            | PeripheralState::Connected
            | PeripheralState::DiscoveringServices
            | PeripheralState::Ready => {
                trace!("connect(): {} already {:?}", id, peripheral.state);
                return Ok(());
            }
            PeripheralState::Disconnecting => {
                return Err(Error::InvalidState("peripheral is disconnecting"));
            }
            PeripheralState::Discovered | PeripheralState::Disconnected => {}
        }

        self.dispatch.transport.connect(peripheral.handle)?;
        peripheral.pending = Some(self.dispatch.begin(OpKind::Connect, peripheral.handle));
        peripheral.disconnect_requested = false;
        self.dispatch.set_peripheral_state(peripheral, PeripheralState::Connecting);
        Ok(())
    }

    /// Requests a disconnect, whatever state the peripheral is in
    ///
    /// Any outstanding operations in the peripheral's subtree are cancelled
    /// and the peripheral moves to `Disconnecting` until the transport
    /// confirms the disconnect (or the disconnect times out).
    pub fn disconnect(&mut self, id: Uuid) -> Result<()> {
        let peripheral = self.peripherals.get_mut(&id).ok_or(Error::UnknownPeripheral(id))?;

        self.dispatch.transport.disconnect(peripheral.handle)?;
        cancel_subtree(&self.dispatch, peripheral);
        peripheral.disconnect_requested = true;
        peripheral.pending = Some(self.dispatch.begin(OpKind::Disconnect, peripheral.handle));
        self.dispatch.set_peripheral_state(peripheral, PeripheralState::Disconnecting);
        Ok(())
    }

    /// Drops a peripheral and everything discovered under it
    pub fn forget(&mut self, id: Uuid) -> Result<()> {
        let mut peripheral = self.peripherals.remove(&id).ok_or(Error::UnknownPeripheral(id))?;
        if peripheral.state.is_connected() || peripheral.state == PeripheralState::Connecting {
            if let Err(err) = self.dispatch.transport.disconnect(peripheral.handle) {
                warn!("Failed to disconnect forgotten peripheral {}: {}", id, err);
            }
        }
        clear_services(&self.dispatch, &mut self.handles, &mut peripheral);
        if let Some(pending) = peripheral.pending.take() {
            self.dispatch.finish(pending);
        }
        self.handles.remove(&peripheral.handle);
        self.dispatch.emit(Event::PeripheralRemoved { peripheral: id });
        Ok(())
    }

    /// Explicitly (re-)discovers the services of a connected peripheral
    ///
    /// Services are discovered automatically on connection so this is only
    /// needed to retry after a failure or to refresh a device whose services
    /// may have changed. All previously discovered services are dropped.
    pub fn discover_services(&mut self, id: Uuid) -> Result<()> {
        let peripheral = self.peripherals.get_mut(&id).ok_or(Error::UnknownPeripheral(id))?;
        if !peripheral.state.is_connected() {
            return Err(Error::InvalidState("peripheral is not connected"));
        }
        if peripheral.pending.is_some() {
            return Err(Error::InvalidState("peripheral has an operation in progress"));
        }

        clear_services(&self.dispatch, &mut self.handles, peripheral);
        request_services(&mut self.dispatch, peripheral)
    }

    pub fn discover_characteristics(&mut self, path: &ServicePath) -> Result<()> {
        check_connected(&self.peripherals, path.peripheral)?;
        let service = find_service(&mut self.peripherals, path).ok_or(Error::UnknownNode)?;
        if service.pending.is_some() {
            return Err(Error::InvalidState("service has an operation in progress"));
        }

        clear_characteristics(&self.dispatch, &mut self.handles, service);
        request_characteristics(&mut self.dispatch, service)
    }

    pub fn discover_descriptors(&mut self, path: &CharacteristicPath) -> Result<()> {
        check_connected(&self.peripherals, path.peripheral)?;
        let characteristic = find_characteristic(&mut self.peripherals, path).ok_or(Error::UnknownNode)?;
        if characteristic.pending.is_some() {
            return Err(Error::InvalidState("characteristic has an operation in progress"));
        }

        for descriptor in characteristic.descriptors.drain() {
            purge_descriptor(&self.dispatch, &mut self.handles, descriptor);
        }
        request_descriptors(&mut self.dispatch, characteristic)
    }

    /// Requests a characteristic read
    ///
    /// The value arrives later as a `CharacteristicValueChanged` event.
    pub fn read_characteristic(&mut self, path: &CharacteristicPath) -> Result<()> {
        check_connected(&self.peripherals, path.peripheral)?;
        let characteristic = find_characteristic(&mut self.peripherals, path).ok_or(Error::UnknownNode)?;
        if !characteristic.properties.contains(CharacteristicProperties::READ) {
            return Err(Error::NotReadable);
        }
        check_idle(characteristic)?;

        self.dispatch.transport.read(characteristic.handle)?;
        characteristic.pending = Some(self.dispatch.begin(OpKind::Read, characteristic.handle));
        Ok(())
    }

    /// Requests a characteristic write, returning the kind of write that was
    /// actually issued
    ///
    /// An unacknowledged write to a characteristic that only supports
    /// acknowledged writes is upgraded. Requiring an acknowledgement from a
    /// characteristic that can't give one fails with `NotWritable`.
    /// Acknowledged writes complete with a `CharacteristicWritten` event,
    /// unacknowledged writes complete as soon as they are dispatched.
    pub fn write_characteristic(
        &mut self,
        path: &CharacteristicPath,
        data: &[u8],
        require_ack: bool,
    ) -> Result<WriteType> {
        check_connected(&self.peripherals, path.peripheral)?;
        let characteristic = find_characteristic(&mut self.peripherals, path).ok_or(Error::UnknownNode)?;
        let properties = characteristic.properties;
        let with_response = properties.contains(CharacteristicProperties::WRITE);
        let without_response = properties.contains(CharacteristicProperties::WRITE_WITHOUT_RESPONSE);
        let write_type = match (with_response, without_response) {
            (false, false) => return Err(Error::NotWritable),
            (true, false) => WriteType::WithResponse,
            (false, true) if require_ack => return Err(Error::NotWritable),
            (false, true) => WriteType::WithoutResponse,
            (true, true) if require_ack => WriteType::WithResponse,
            (true, true) => WriteType::WithoutResponse,
        };
        if require_ack != (write_type == WriteType::WithResponse) {
            debug!("Writing {} {:?} (requested ack = {})", path.characteristic.short(), write_type, require_ack);
        }
        check_idle(characteristic)?;

        match write_type {
            WriteType::WithResponse => {
                self.dispatch.transport.write(characteristic.handle, data, true)?;
                characteristic.pending = Some(self.dispatch.begin(OpKind::Write, characteristic.handle));
            }
            WriteType::WithoutResponse => {
                self.dispatch.transport.write(characteristic.handle, data, false)?;
            }
        }
        Ok(write_type)
    }

    /// Enables or disables notifications (or indications, if notifications
    /// aren't supported) for a characteristic
    ///
    /// This writes the characteristic's client configuration descriptor if
    /// one has been discovered, otherwise the transport is asked to manage
    /// the subscription itself.
    pub fn set_notifications(&mut self, path: &CharacteristicPath, enabled: bool) -> Result<()> {
        check_connected(&self.peripherals, path.peripheral)?;
        let characteristic = find_characteristic(&mut self.peripherals, path).ok_or(Error::UnknownNode)?;
        let properties = characteristic.properties;
        if !properties.intersects(CharacteristicProperties::NOTIFY | CharacteristicProperties::INDICATE) {
            return Err(Error::NotNotifiable);
        }
        check_idle(characteristic)?;

        let config = if !enabled {
            ClientConfiguration::empty()
        } else if properties.contains(CharacteristicProperties::NOTIFY) {
            ClientConfiguration::NOTIFY
        } else {
            ClientConfiguration::INDICATE
        };

        let handle = characteristic.handle;
        match characteristic
            .descriptors
            .iter_mut()
            .find(|descriptor| descriptor.kind == DescriptorKind::ClientConfiguration)
        {
            Some(descriptor) => {
                if descriptor.pending.is_some() {
                    return Err(Error::InvalidState("configuration descriptor has an operation in progress"));
                }
                let bytes = config.to_le_bytes();
                self.dispatch.transport.write(descriptor.handle, &bytes, true)?;
                descriptor.written = Some(bytes.to_vec());
                descriptor.pending = Some(self.dispatch.begin(OpKind::Write, descriptor.handle));
            }
            None => {
                debug!("No configuration descriptor for {}; using transport subscription", path.characteristic.short());
                self.dispatch.transport.set_notify(handle, enabled)?;
                characteristic.pending = Some(self.dispatch.begin(OpKind::SetNotify(enabled), handle));
            }
        }
        Ok(())
    }

    pub fn read_descriptor(&mut self, path: &DescriptorPath) -> Result<()> {
        check_connected(&self.peripherals, path.peripheral)?;
        let descriptor = find_descriptor(&mut self.peripherals, path).ok_or(Error::UnknownNode)?;
        if descriptor.pending.is_some() {
            return Err(Error::InvalidState("descriptor has an operation in progress"));
        }

        self.dispatch.transport.read(descriptor.handle)?;
        descriptor.pending = Some(self.dispatch.begin(OpKind::Read, descriptor.handle));
        Ok(())
    }

    /// Descriptor writes are always acknowledged
    pub fn write_descriptor(&mut self, path: &DescriptorPath, data: &[u8]) -> Result<()> {
        check_connected(&self.peripherals, path.peripheral)?;
        let descriptor = find_descriptor(&mut self.peripherals, path).ok_or(Error::UnknownNode)?;
        if descriptor.pending.is_some() {
            return Err(Error::InvalidState("descriptor has an operation in progress"));
        }

        self.dispatch.transport.write(descriptor.handle, data, true)?;
        descriptor.written = Some(data.to_vec());
        descriptor.pending = Some(self.dispatch.begin(OpKind::Write, descriptor.handle));
        Ok(())
    }

    /// The single entry point for everything reported by the transport
    /// (and for timeouts synthesized by the scheduler)
    ///
    /// Events are never rejected: anything that can't be applied to the
    /// tree is logged and, for unknown handles, reported as a protocol
    /// anomaly on the observer bus.
    pub fn on_transport_event(&mut self, event: TransportEvent) {
        trace!("Transport event: {:?}", event);

        if let TransportEvent::AdvertisementSeen { handle, id, name, rssi, services } = event {
            self.on_advertisement(handle, id, name, rssi, services);
            return;
        }

        let handle = event.handle();
        let path = match self.handles.get(&handle) {
            Some(path) => *path,
            None => {
                if let TransportEvent::Timeout { .. } = event {
                    trace!("Ignoring timeout for destroyed node {}", handle);
                } else {
                    self.on_protocol_anomaly(handle, &event);
                }
                return;
            }
        };

        match (event, path) {
            (TransportEvent::Connected { .. }, NodePath::Peripheral(id)) => {
                self.on_connected(id);
            }
            (TransportEvent::Disconnected { code, .. }, NodePath::Peripheral(id)) => {
                self.on_disconnected(id, code);
            }
            (TransportEvent::ServicesListed { services, .. }, NodePath::Peripheral(id)) => {
                self.on_services_listed(id, services);
            }
            (TransportEvent::CharacteristicsListed { characteristics, .. }, NodePath::Service(path)) => {
                self.on_characteristics_listed(path, characteristics);
            }
            (TransportEvent::DescriptorsListed { descriptors, .. }, NodePath::Characteristic(path)) => {
                self.on_descriptors_listed(path, descriptors);
            }
            (TransportEvent::ValueUpdated { value, .. }, NodePath::Characteristic(path)) => {
                self.on_characteristic_value(path, value);
            }
            (TransportEvent::ValueUpdated { value, .. }, NodePath::Descriptor(path)) => {
                self.on_descriptor_value(path, value);
            }
            (TransportEvent::WriteCompleted { .. }, NodePath::Characteristic(path)) => {
                self.on_characteristic_written(path);
            }
            (TransportEvent::WriteCompleted { .. }, NodePath::Descriptor(path)) => {
                self.on_descriptor_written(path);
            }
            (TransportEvent::OperationFailed { code, .. }, path) => {
                self.fail_operation(path, GattError::Transport(code));
            }
            (TransportEvent::Timeout { token, .. }, path) => {
                if self.pending(&path).map(|pending| pending.token) == Some(token) {
                    debug!("Operation on {:?} timed out", path);
                    self.fail_operation(path, GattError::Timeout);
                } else {
                    trace!("Ignoring stale timeout {:?} for {:?}", token, path);
                }
            }
            (event, path) => {
                log::error!("Dropping {:?}: doesn't apply to {:?}", event, path);
                self.dispatch.emit(Event::Error {
                    scope: Some(path),
                    error: GattError::ProtocolAnomaly(handle),
                });
            }
        }
    }

    fn on_protocol_anomaly(&self, handle: Handle, event: &TransportEvent) {
        log::error!("Dropping {:?} for unknown handle {}", event, handle);
        self.dispatch.emit(Event::Error {
            scope: None,
            error: GattError::ProtocolAnomaly(handle),
        });
    }

    fn pending(&self, path: &NodePath) -> Option<Pending> {
        match path {
            NodePath::Peripheral(id) => self.peripheral(*id)?.pending,
            NodePath::Service(path) => self.service(path)?.pending,
            NodePath::Characteristic(path) => self.characteristic(path)?.pending,
            NodePath::Descriptor(path) => self.descriptor(path)?.pending,
        }
    }

    fn on_advertisement(&mut self, handle: Handle, id: Uuid, name: Option<String>, rssi: i16, services: Vec<Uuid>) {
        if !self.is_scanning {
            trace!("Ignoring advertisement from {} while not scanning", id);
            return;
        }
        let advertisement = Advertisement {
            id,
            name: name.as_deref(),
            services: &services,
            rssi,
        };
        if !self.criteria.accept(&advertisement) {
            trace!("Advertisement from {} rejected by scan criteria", id);
            return;
        }
        let duplicates = self.criteria.duplicates();

        let (peripheral, is_new) = self
            .peripherals
            .upsert_with(id, || PeripheralNode::new(id, handle, name.clone(), rssi));
        if peripheral.handle != handle {
            debug!("Peripheral {} handle changed {} -> {}", id, peripheral.handle, handle);
            self.handles.remove(&peripheral.handle);
            peripheral.handle = handle;
        }
        self.handles.insert(handle, NodePath::Peripheral(id));
        if name.is_some() {
            peripheral.name = name;
        }
        peripheral.rssi = rssi;
        peripheral.advertised_services.extend(services);

        let report = if is_new {
            true
        } else {
            match peripheral.state {
                PeripheralState::Disconnected => {
                    self.dispatch.set_peripheral_state(peripheral, PeripheralState::Discovered);
                    true
                }
                PeripheralState::Discovered => duplicates == DuplicatePolicy::Report,
                _ => false,
            }
        };
        if report {
            self.dispatch.emit(Event::PeripheralDiscovered {
                peripheral: id,
                name: peripheral.name.clone(),
                rssi,
            });
        }
    }

    fn on_connected(&mut self, id: Uuid) {
        let peripheral = match self.peripherals.get_mut(&id) {
            Some(peripheral) => peripheral,
            None => return,
        };
        match peripheral.state {
            PeripheralState::Connecting | PeripheralState::Discovered | PeripheralState::Disconnected => {
                if let Some(pending) = peripheral.pending.take() {
                    self.dispatch.finish(pending);
                }
                self.dispatch.set_peripheral_state(peripheral, PeripheralState::Connected);

                if let Err(err) = request_services(&mut self.dispatch, peripheral) {
                    log::error!("Failed to request service discovery for {}: {}", id, err);
                }
            }
            PeripheralState::Disconnecting => {
                warn!("Ignoring Connected notification for {} while disconnecting", id);
            }
            _ => {
                warn!("Spurious, unbalanced/redundant Connected notification from transport");
            }
        }
    }

    fn on_disconnected(&mut self, id: Uuid, code: Option<i32>) {
        let peripheral = match self.peripherals.get_mut(&id) {
            Some(peripheral) => peripheral,
            None => return,
        };
        match peripheral.state {
            PeripheralState::Discovered | PeripheralState::Disconnected => {
                warn!("Spurious, unbalanced/redundant Disconnected notification from transport");
                return;
            }
            PeripheralState::Connecting if !peripheral.disconnect_requested => {
                // The connection attempt failed
                if let Some(pending) = peripheral.pending.take() {
                    self.dispatch.finish(pending);
                }
                self.dispatch.set_peripheral_state(peripheral, PeripheralState::Discovered);
                self.dispatch.emit(Event::Error {
                    scope: Some(NodePath::Peripheral(id)),
                    error: GattError::Transport(code.unwrap_or(UNSPECIFIED_FAILURE)),
                });
                return;
            }
            _ => {}
        }
        self.complete_disconnect(id, code);
    }

    // Collapses the subtree and applies the reconnect policy
    fn complete_disconnect(&mut self, id: Uuid, code: Option<i32>) {
        let peripheral = match self.peripherals.get_mut(&id) {
            Some(peripheral) => peripheral,
            None => return,
        };
        let requested = peripheral.disconnect_requested;

        clear_services(&self.dispatch, &mut self.handles, peripheral);
        if let Some(pending) = peripheral.pending.take() {
            self.dispatch.finish(pending);
        }
        peripheral.disconnect_requested = false;
        self.dispatch.set_peripheral_state(peripheral, PeripheralState::Disconnected);

        if !requested {
            if let Some(code) = code {
                self.dispatch.emit(Event::Error {
                    scope: Some(NodePath::Peripheral(id)),
                    error: GattError::Transport(code),
                });
            }
        }

        match self.config.reconnect {
            ReconnectPolicy::Manual => {}
            ReconnectPolicy::Auto => {
                if !requested {
                    debug!("Reconnecting to {} after unexpected disconnect", id);
                    if let Err(err) = self.connect(id) {
                        log::error!("Failed to reconnect to {}: {}", id, err);
                    }
                }
            }
            ReconnectPolicy::Forget => {
                if let Some(peripheral) = self.peripherals.remove(&id) {
                    self.handles.remove(&peripheral.handle);
                }
                self.dispatch.emit(Event::PeripheralRemoved { peripheral: id });
            }
        }
    }

    fn on_services_listed(&mut self, id: Uuid, services: Vec<DiscoveredService>) {
        let peripheral = match self.peripherals.get_mut(&id) {
            Some(peripheral) => peripheral,
            None => return,
        };
        match peripheral.pending {
            Some(pending) if pending.kind == OpKind::DiscoverServices => {
                self.dispatch.finish(pending);
                peripheral.pending = None;
            }
            _ => {
                if !peripheral.state.is_connected() {
                    warn!("Ignoring service list for {} in state {:?}", id, peripheral.state);
                    return;
                }
                warn!("Unsolicited service list for {}; updating in place", id);
            }
        }

        for discovered in services {
            let path = ServicePath {
                peripheral: id,
                service: discovered.uuid,
            };
            let (service, is_new) = peripheral
                .services
                .upsert_with(discovered.uuid, || ServiceNode::new(path, discovered.handle, discovered.is_primary));
            if service.handle != discovered.handle {
                self.handles.remove(&service.handle);
                service.handle = discovered.handle;
            }
            service.is_primary = discovered.is_primary;
            self.handles.insert(discovered.handle, NodePath::Service(path));

            if is_new {
                trace!("New service {} for {}", discovered.uuid.short(), id);
                if let Err(err) = request_characteristics(&mut self.dispatch, service) {
                    log::error!("Failed to request characteristics of {}: {}", discovered.uuid.short(), err);
                }
            } else {
                debug!("Service {} re-discovered; updated in place", discovered.uuid.short());
            }
        }

        self.refresh_readiness(id);
    }

    fn on_characteristics_listed(&mut self, path: ServicePath, characteristics: Vec<DiscoveredCharacteristic>) {
        let service = match find_service(&mut self.peripherals, &path) {
            Some(service) => service,
            None => return,
        };
        match service.pending {
            Some(pending) if pending.kind == OpKind::DiscoverCharacteristics => {
                self.dispatch.finish(pending);
                service.pending = None;
            }
            _ => warn!("Unsolicited characteristic list for {}; updating in place", path.service.short()),
        }

        for discovered in characteristics {
            let characteristic_path = path.characteristic(discovered.uuid);
            let (characteristic, is_new) = service.characteristics.upsert_with(discovered.uuid, || {
                CharacteristicNode::new(characteristic_path, discovered.handle, discovered.properties)
            });
            if characteristic.handle != discovered.handle {
                self.handles.remove(&characteristic.handle);
                characteristic.handle = discovered.handle;
            }
            characteristic.properties = discovered.properties;
            self.handles
                .insert(discovered.handle, NodePath::Characteristic(characteristic_path));

            if is_new {
                if let Err(err) = request_descriptors(&mut self.dispatch, characteristic) {
                    log::error!("Failed to request descriptors of {}: {}", discovered.uuid.short(), err);
                }
            } else {
                debug!("Characteristic {} re-discovered; updated in place", discovered.uuid.short());
            }
        }

        self.refresh_readiness(path.peripheral);
    }

    fn on_descriptors_listed(&mut self, path: CharacteristicPath, descriptors: Vec<DiscoveredDescriptor>) {
        let characteristic = match find_characteristic(&mut self.peripherals, &path) {
            Some(characteristic) => characteristic,
            None => return,
        };
        match characteristic.pending {
            Some(pending) if pending.kind == OpKind::DiscoverDescriptors => {
                self.dispatch.finish(pending);
                characteristic.pending = None;
            }
            _ => warn!("Unsolicited descriptor list for {}; updating in place", path.characteristic.short()),
        }

        for discovered in descriptors {
            let descriptor_path = path.descriptor(discovered.uuid);
            let (descriptor, is_new) = characteristic
                .descriptors
                .upsert_with(discovered.uuid, || DescriptorNode::new(descriptor_path, discovered.handle));
            if descriptor.handle != discovered.handle {
                self.handles.remove(&descriptor.handle);
                descriptor.handle = discovered.handle;
            }
            self.handles.insert(discovered.handle, NodePath::Descriptor(descriptor_path));
            if is_new {
                self.dispatch.emit(Event::DescriptorReady {
                    descriptor: descriptor_path,
                });
            }
        }

        if characteristic.state == CharacteristicState::DiscoveringDescriptors && characteristic.pending.is_none() {
            characteristic.state = CharacteristicState::Ready;
            self.dispatch.emit(Event::CharacteristicReady { characteristic: path });
        }

        self.refresh_readiness(path.peripheral);
    }

    // Promotes services whose characteristics are all ready, then the
    // peripheral once all of its services are ready
    fn refresh_readiness(&mut self, id: Uuid) {
        let peripheral = match self.peripherals.get_mut(&id) {
            Some(peripheral) => peripheral,
            None => return,
        };

        for service in peripheral.services.iter_mut() {
            if service.state == ServiceState::DiscoveringCharacteristics
                && service.pending.is_none()
                && service
                    .characteristics
                    .iter()
                    .all(|characteristic| characteristic.state == CharacteristicState::Ready)
            {
                service.state = ServiceState::Ready;
                self.dispatch.emit(Event::ServiceReady { service: service.path });
            }
        }

        if peripheral.state == PeripheralState::DiscoveringServices
            && peripheral.pending.is_none()
            && peripheral
                .services
                .iter()
                .all(|service| service.state == ServiceState::Ready)
        {
            self.dispatch.set_peripheral_state(peripheral, PeripheralState::Ready);
        }
    }

    fn on_characteristic_value(&mut self, path: CharacteristicPath, value: Vec<u8>) {
        let characteristic = match find_characteristic(&mut self.peripherals, &path) {
            Some(characteristic) => characteristic,
            None => return,
        };
        if let Some(pending) = characteristic.pending {
            if pending.kind == OpKind::Read {
                self.dispatch.finish(pending);
                characteristic.pending = None;
            }
        }

        let decoded = characteristic.kind.decode(&value);
        let kind = characteristic.kind;
        characteristic.value = Some(value.clone());
        self.dispatch.emit(Event::CharacteristicValueChanged {
            characteristic: path,
            value,
            decoded: decoded.clone(),
        });

        if kind == CharacteristicKind::ServiceChanged {
            if let Some(Value::ServiceChanged { start, end }) = decoded {
                self.on_service_changed(path.peripheral, start, end);
            }
        }
    }

    // Only the services inside the affected attribute range are re-discovered,
    // unless the range covers everything (or nothing we can identify).
    fn on_service_changed(&mut self, id: Uuid, start: u16, end: u16) {
        let peripheral = match self.peripherals.get_mut(&id) {
            Some(peripheral) => peripheral,
            None => return,
        };
        if !peripheral.state.is_connected() || peripheral.pending.is_some() {
            debug!("Ignoring Service Changed for {} in state {:?}", id, peripheral.state);
            return;
        }

        let range = start as u32..=end as u32;
        let affected: Vec<Uuid> = peripheral
            .services
            .iter()
            .filter(|service| range.contains(&service.handle.0))
            .map(|service| service.uuid())
            .collect();
        debug!("Service Changed for {}: {:#06x}..={:#06x} affects {:?}", id, start, end, affected);

        if affected.is_empty() || affected.len() == peripheral.services.len() {
            clear_services(&self.dispatch, &mut self.handles, peripheral);
            if let Err(err) = request_services(&mut self.dispatch, peripheral) {
                log::error!("Failed to re-discover services for {}: {}", id, err);
            }
            return;
        }

        for uuid in affected {
            if let Some(service) = peripheral.services.get_mut(&uuid) {
                if service.pending.is_some() {
                    continue;
                }
                clear_characteristics(&self.dispatch, &mut self.handles, service);
                if let Err(err) = request_characteristics(&mut self.dispatch, service) {
                    log::error!("Failed to re-discover characteristics of {}: {}", uuid.short(), err);
                }
            }
        }
    }

    fn on_descriptor_value(&mut self, path: DescriptorPath, value: Vec<u8>) {
        let descriptor = match find_descriptor(&mut self.peripherals, &path) {
            Some(descriptor) => descriptor,
            None => return,
        };
        if let Some(pending) = descriptor.pending {
            if pending.kind == OpKind::Read {
                self.dispatch.finish(pending);
                descriptor.pending = None;
            }
        }

        let decoded = descriptor.kind.decode(&value);
        descriptor.value = Some(value.clone());
        self.dispatch.emit(Event::DescriptorValueChanged {
            descriptor: path,
            value,
            decoded,
        });
    }

    fn on_characteristic_written(&mut self, path: CharacteristicPath) {
        let characteristic = match find_characteristic(&mut self.peripherals, &path) {
            Some(characteristic) => characteristic,
            None => return,
        };
        match characteristic.pending {
            Some(pending) if pending.kind == OpKind::Write => {
                self.dispatch.finish(pending);
                characteristic.pending = None;
                self.dispatch.emit(Event::CharacteristicWritten { characteristic: path });
            }
            Some(pending) if matches!(pending.kind, OpKind::SetNotify(_)) => {
                self.dispatch.finish(pending);
                characteristic.pending = None;
                if let OpKind::SetNotify(enabled) = pending.kind {
                    characteristic.notifying = enabled;
                    self.dispatch.emit(Event::NotificationsChanged {
                        characteristic: path,
                        enabled,
                    });
                }
            }
            _ => warn!("Spurious write completion for {}", path.characteristic.short()),
        }
    }

    fn on_descriptor_written(&mut self, path: DescriptorPath) {
        let characteristic = match find_characteristic(&mut self.peripherals, &path.characteristic()) {
            Some(characteristic) => characteristic,
            None => return,
        };
        let descriptor = match characteristic.descriptors.get_mut(&path.descriptor) {
            Some(descriptor) => descriptor,
            None => return,
        };
        match descriptor.pending {
            Some(pending) if pending.kind == OpKind::Write => {
                self.dispatch.finish(pending);
                descriptor.pending = None;
            }
            _ => {
                warn!("Spurious write completion for descriptor {}", path.descriptor.short());
                return;
            }
        }
        if let Some(written) = descriptor.written.take() {
            descriptor.value = Some(written);
        }
        let notifying = match (descriptor.kind, descriptor.decoded()) {
            (DescriptorKind::ClientConfiguration, Some(Value::ClientConfiguration(config))) => Some(!config.is_empty()),
            _ => None,
        };
        self.dispatch.emit(Event::DescriptorWritten { descriptor: path });

        if let Some(enabled) = notifying {
            characteristic.notifying = enabled;
            self.dispatch.emit(Event::NotificationsChanged {
                characteristic: path.characteristic(),
                enabled,
            });
        }
    }

    // Shared by transport failures and timeouts: clears the node's pending
    // operation, regresses discovery by one level and reports the error
    // scoped to the node.
    fn fail_operation(&mut self, path: NodePath, error: GattError) {
        match path {
            NodePath::Peripheral(id) => {
                let peripheral = match self.peripherals.get_mut(&id) {
                    Some(peripheral) => peripheral,
                    None => return,
                };
                let pending = peripheral.pending.take();
                if let Some(pending) = pending {
                    self.dispatch.finish(pending);
                }
                match pending.map(|pending| pending.kind) {
                    Some(OpKind::Connect) => {
                        if error == GattError::Timeout {
                            // Abandon the stalled attempt
                            if let Err(err) = self.dispatch.transport.disconnect(peripheral.handle) {
                                warn!("Failed to cancel connection attempt to {}: {}", id, err);
                            }
                        }
                        self.dispatch.set_peripheral_state(peripheral, PeripheralState::Discovered);
                    }
                    Some(OpKind::DiscoverServices) => {
                        self.dispatch.set_peripheral_state(peripheral, PeripheralState::Connected);
                    }
                    Some(OpKind::Disconnect) => {
                        warn!("Disconnect of {} failed ({}); treating as disconnected", id, error);
                        self.complete_disconnect(id, None);
                    }
                    _ => warn!("Failure reported for idle peripheral {}", id),
                }
            }
            NodePath::Service(service_path) => {
                let service = match find_service(&mut self.peripherals, &service_path) {
                    Some(service) => service,
                    None => return,
                };
                if let Some(pending) = service.pending.take() {
                    self.dispatch.finish(pending);
                    if pending.kind == OpKind::DiscoverCharacteristics {
                        service.state = ServiceState::Discovered;
                    }
                }
            }
            NodePath::Characteristic(characteristic_path) => {
                let characteristic = match find_characteristic(&mut self.peripherals, &characteristic_path) {
                    Some(characteristic) => characteristic,
                    None => return,
                };
                if let Some(pending) = characteristic.pending.take() {
                    self.dispatch.finish(pending);
                    if pending.kind == OpKind::DiscoverDescriptors {
                        characteristic.state = CharacteristicState::Discovered;
                    }
                }
            }
            NodePath::Descriptor(descriptor_path) => {
                let descriptor = match find_descriptor(&mut self.peripherals, &descriptor_path) {
                    Some(descriptor) => descriptor,
                    None => return,
                };
                if let Some(pending) = descriptor.pending.take() {
                    self.dispatch.finish(pending);
                }
                descriptor.written = None;
            }
        }

        self.dispatch.emit(Event::Error {
            scope: Some(path),
            error,
        });
    }
}

fn find_service<'a>(peripherals: &'a mut ChildMap<PeripheralNode>, path: &ServicePath) -> Option<&'a mut ServiceNode> {
    peripherals.get_mut(&path.peripheral)?.services.get_mut(&path.service)
}

fn find_characteristic<'a>(
    peripherals: &'a mut ChildMap<PeripheralNode>,
    path: &CharacteristicPath,
) -> Option<&'a mut CharacteristicNode> {
    find_service(peripherals, &path.service())?
        .characteristics
        .get_mut(&path.characteristic)
}

fn find_descriptor<'a>(
    peripherals: &'a mut ChildMap<PeripheralNode>,
    path: &DescriptorPath,
) -> Option<&'a mut DescriptorNode> {
    find_characteristic(peripherals, &path.characteristic())?
        .descriptors
        .get_mut(&path.descriptor)
}

fn check_connected(peripherals: &ChildMap<PeripheralNode>, id: Uuid) -> Result<()> {
    let peripheral = peripherals.get(&id).ok_or(Error::UnknownPeripheral(id))?;
    if peripheral.state.is_connected() {
        Ok(())
    } else {
        Err(Error::InvalidState("peripheral is not connected"))
    }
}

fn check_idle(characteristic: &CharacteristicNode) -> Result<()> {
    if characteristic.state != CharacteristicState::Ready {
        return Err(Error::InvalidState("characteristic discovery is incomplete"));
    }
    if characteristic.pending.is_some() {
        return Err(Error::InvalidState("characteristic has an operation in progress"));
    }
    Ok(())
}

fn request_services(dispatch: &mut Dispatch, peripheral: &mut PeripheralNode) -> Result<()> {
    dispatch.transport.discover_services(peripheral.handle)?;
    peripheral.pending = Some(dispatch.begin(OpKind::DiscoverServices, peripheral.handle));
    dispatch.set_peripheral_state(peripheral, PeripheralState::DiscoveringServices);
    Ok(())
}

fn request_characteristics(dispatch: &mut Dispatch, service: &mut ServiceNode) -> Result<()> {
    dispatch.transport.discover_characteristics(service.handle)?;
    service.pending = Some(dispatch.begin(OpKind::DiscoverCharacteristics, service.handle));
    service.state = ServiceState::DiscoveringCharacteristics;
    Ok(())
}

fn request_descriptors(dispatch: &mut Dispatch, characteristic: &mut CharacteristicNode) -> Result<()> {
    dispatch.transport.discover_descriptors(characteristic.handle)?;
    characteristic.pending = Some(dispatch.begin(OpKind::DiscoverDescriptors, characteristic.handle));
    characteristic.state = CharacteristicState::DiscoveringDescriptors;
    Ok(())
}

// Cancels every outstanding operation (and timer) under and including the
// peripheral, without removing any nodes
fn cancel_subtree(dispatch: &Dispatch, peripheral: &mut PeripheralNode) {
    let mut cancelled = 0;
    let mut cancel = |pending: &mut Option<Pending>| {
        if let Some(pending) = pending.take() {
            dispatch.finish(pending);
            cancelled += 1;
        }
    };

    cancel(&mut peripheral.pending);
    for service in peripheral.services.iter_mut() {
        cancel(&mut service.pending);
        for characteristic in service.characteristics.iter_mut() {
            cancel(&mut characteristic.pending);
            for descriptor in characteristic.descriptors.iter_mut() {
                cancel(&mut descriptor.pending);
                descriptor.written = None;
            }
        }
    }
    if cancelled > 0 {
        debug!("Cancelled {} outstanding operations for {}", cancelled, peripheral.id);
    }
}

fn clear_services(dispatch: &Dispatch, handles: &mut HandleIndex, peripheral: &mut PeripheralNode) {
    trace!("Invalidating GATT state for {}", peripheral.id);
    for service in peripheral.services.drain() {
        purge_service(dispatch, handles, service);
    }
}

fn clear_characteristics(dispatch: &Dispatch, handles: &mut HandleIndex, service: &mut ServiceNode) {
    for characteristic in service.characteristics.drain() {
        purge_characteristic(dispatch, handles, characteristic);
    }
}

fn purge_service(dispatch: &Dispatch, handles: &mut HandleIndex, mut service: ServiceNode) {
    if let Some(pending) = service.pending.take() {
        dispatch.finish(pending);
    }
    handles.remove(&service.handle);
    clear_characteristics(dispatch, handles, &mut service);
}

fn purge_characteristic(dispatch: &Dispatch, handles: &mut HandleIndex, mut characteristic: CharacteristicNode) {
    if let Some(pending) = characteristic.pending.take() {
        dispatch.finish(pending);
    }
    handles.remove(&characteristic.handle);
    for descriptor in characteristic.descriptors.drain() {
        purge_descriptor(dispatch, handles, descriptor);
    }
}

fn purge_descriptor(dispatch: &Dispatch, handles: &mut HandleIndex, mut descriptor: DescriptorNode) {
    if let Some(pending) = descriptor.pending.take() {
        dispatch.finish(pending);
    }
    handles.remove(&descriptor.handle);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{Command, FakeTransport, ManualScheduler};
    use crate::uuid::*;

    const SENSOR: Uuid = uuid_from_u16(0xBA77);
    const PERIPHERAL: Handle = Handle(1);
    const BATTERY: Handle = Handle(10);
    const LEVEL: Handle = Handle(11);
    const LEVEL_CONFIG: Handle = Handle(12);

    struct Harness {
        engine: CentralEngine,
        transport: FakeTransport,
        timers: ManualScheduler,
        events: broadcast::Receiver<Event>,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_config(EngineConfig::default())
        }

        fn with_config(config: EngineConfig) -> Self {
            let transport = FakeTransport::new();
            let timers = ManualScheduler::new();
            let engine = CentralEngine::new(config, Box::new(transport.clone()), Box::new(timers.clone()));
            let events = engine.subscribe();
            Self {
                engine,
                transport,
                timers,
                events,
            }
        }

        fn feed(&mut self, event: TransportEvent) {
            self.engine.on_transport_event(event);
        }

        fn events(&mut self) -> Vec<Event> {
            let mut events = vec![];
            while let Ok(event) = self.events.try_recv() {
                events.push(event);
            }
            events
        }

        fn advertise(&mut self, handle: Handle, id: Uuid, services: &[Uuid], rssi: i16) {
            self.feed(TransportEvent::AdvertisementSeen {
                handle,
                id,
                name: None,
                rssi,
                services: services.to_vec(),
            });
        }

        fn connect_sensor(&mut self) {
            self.engine.start_scanning(ScanCriteria::new()).unwrap();
            self.advertise(PERIPHERAL, SENSOR, &[BATTERY_SERVICE], -50);
            self.engine.connect(SENSOR).unwrap();
            self.feed(TransportEvent::Connected { handle: PERIPHERAL });
        }

        fn list_battery_service(&mut self) {
            self.feed(TransportEvent::ServicesListed {
                handle: PERIPHERAL,
                services: vec![battery_service()],
            });
        }

        fn list_level(&mut self, properties: CharacteristicProperties) {
            self.feed(TransportEvent::CharacteristicsListed {
                handle: BATTERY,
                characteristics: vec![DiscoveredCharacteristic {
                    handle: LEVEL,
                    uuid: BATTERY_LEVEL,
                    properties,
                }],
            });
        }

        /// Walks the battery sensor all the way to `Ready`, then forgets
        /// about the commands and events that took
        fn ready_sensor_with(
            &mut self,
            properties: CharacteristicProperties,
            descriptors: Vec<DiscoveredDescriptor>,
        ) -> CharacteristicPath {
            self.connect_sensor();
            self.list_battery_service();
            self.list_level(properties);
            self.feed(TransportEvent::DescriptorsListed {
                handle: LEVEL,
                descriptors,
            });
            assert_eq!(self.engine.peripheral(SENSOR).unwrap().state(), PeripheralState::Ready);
            self.transport.take_commands();
            self.events();
            level_path()
        }

        fn ready_sensor(&mut self) -> CharacteristicPath {
            self.ready_sensor_with(
                CharacteristicProperties::READ | CharacteristicProperties::NOTIFY,
                vec![level_config()],
            )
        }
    }

    fn battery_service() -> DiscoveredService {
        DiscoveredService {
            handle: BATTERY,
            uuid: BATTERY_SERVICE,
            is_primary: true,
        }
    }

    fn level_config() -> DiscoveredDescriptor {
        DiscoveredDescriptor {
            handle: LEVEL_CONFIG,
            uuid: CLIENT_CHARACTERISTIC_CONFIGURATION,
        }
    }

    fn battery_path() -> ServicePath {
        ServicePath {
            peripheral: SENSOR,
            service: BATTERY_SERVICE,
        }
    }

    fn level_path() -> CharacteristicPath {
        battery_path().characteristic(BATTERY_LEVEL)
    }

    fn state_changes(events: &[Event]) -> Vec<PeripheralState> {
        events
            .iter()
            .filter_map(|event| match event {
                Event::PeripheralStateChanged { state, .. } => Some(*state),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn scan_criteria_filter_advertisements() {
        let mut h = Harness::new();
        let heart_monitor = uuid_from_u16(0x0002);
        let criteria = ScanCriteria::new().with_service(BATTERY_SERVICE);
        h.engine.start_scanning(criteria.clone()).unwrap();

        h.advertise(PERIPHERAL, SENSOR, &[BATTERY_SERVICE], -50);
        h.advertise(Handle(2), heart_monitor, &[HEART_RATE_SERVICE], -40);

        assert_eq!(h.engine.peripherals().ids(), vec![SENSOR]);
        assert_eq!(
            h.events(),
            vec![Event::PeripheralDiscovered {
                peripheral: SENSOR,
                name: None,
                rssi: -50
            }]
        );
        assert_eq!(h.transport.commands(), vec![Command::Scan(criteria)]);
    }

    #[test]
    fn advertisements_ignored_unless_scanning() {
        let mut h = Harness::new();
        h.advertise(PERIPHERAL, SENSOR, &[], -50);
        assert!(h.engine.peripherals().is_empty());

        h.engine.start_scanning(ScanCriteria::new()).unwrap();
        h.engine.stop_scanning();
        h.advertise(PERIPHERAL, SENSOR, &[], -50);
        assert!(h.engine.peripherals().is_empty());
        assert!(!h.engine.is_scanning());
        assert_eq!(h.transport.commands(), vec![Command::Scan(ScanCriteria::new()), Command::StopScan]);
    }

    #[test]
    fn duplicate_advertisements_update_in_place() {
        let mut h = Harness::new();
        h.engine.start_scanning(ScanCriteria::new()).unwrap();

        h.advertise(PERIPHERAL, SENSOR, &[BATTERY_SERVICE], -70);
        h.feed(TransportEvent::AdvertisementSeen {
            handle: PERIPHERAL,
            id: SENSOR,
            name: Some("Sensor".to_string()),
            rssi: -40,
            services: vec![CURRENT_TIME_SERVICE],
        });
        assert_eq!(h.engine.peripherals().len(), 1);
        assert_eq!(h.events().len(), 1);

        let node = h.engine.peripheral(SENSOR).unwrap();
        assert_eq!(node.rssi(), -40);
        assert_eq!(node.name(), Some("Sensor"));
        assert_eq!(node.advertised_services().len(), 2);

        // Only the criteria change when already scanning
        h.engine
            .start_scanning(ScanCriteria::new().with_duplicates(DuplicatePolicy::Report))
            .unwrap();
        h.advertise(PERIPHERAL, SENSOR, &[], -45);
        assert_eq!(
            h.events(),
            vec![Event::PeripheralDiscovered {
                peripheral: SENSOR,
                name: Some("Sensor".to_string()),
                rssi: -45
            }]
        );
        assert_eq!(h.transport.commands().len(), 1);
    }

    #[test]
    fn connect_unknown_peripheral() {
        let mut h = Harness::new();
        assert!(matches!(h.engine.connect(SENSOR), Err(Error::UnknownPeripheral(id)) if id == SENSOR));
        assert!(h.transport.commands().is_empty());
    }

    #[test]
    fn connect_is_idempotent() {
        let mut h = Harness::new();
        h.engine.start_scanning(ScanCriteria::new()).unwrap();
        h.advertise(PERIPHERAL, SENSOR, &[], -50);
        h.transport.take_commands();

        h.engine.connect(SENSOR).unwrap();
        h.engine.connect(SENSOR).unwrap();
        assert_eq!(h.transport.commands(), vec![Command::Connect(PERIPHERAL)]);
        assert_eq!(state_changes(&h.events()), vec![PeripheralState::Connecting]);
        assert_eq!(h.timers.live().len(), 1);
    }

    #[test]
    fn refused_connect_leaves_state_untouched() {
        let mut h = Harness::new();
        h.engine.start_scanning(ScanCriteria::new()).unwrap();
        h.advertise(PERIPHERAL, SENSOR, &[], -50);

        h.transport.set_refuse(true);
        assert!(h.engine.connect(SENSOR).is_err());
        assert_eq!(h.engine.peripheral(SENSOR).unwrap().state(), PeripheralState::Discovered);
        assert!(h.timers.live().is_empty());
    }

    #[test]
    fn discovery_cascades_to_ready() {
        let mut h = Harness::new();
        h.connect_sensor();
        assert_eq!(
            h.transport.take_commands()[1..],
            [Command::Connect(PERIPHERAL), Command::DiscoverServices(PERIPHERAL)]
        );
        assert_eq!(
            h.engine.peripheral(SENSOR).unwrap().state(),
            PeripheralState::DiscoveringServices
        );

        h.list_battery_service();
        assert_eq!(h.transport.take_commands(), vec![Command::DiscoverCharacteristics(BATTERY)]);
        assert_eq!(
            h.engine.service(&battery_path()).unwrap().state(),
            ServiceState::DiscoveringCharacteristics
        );

        h.list_level(CharacteristicProperties::READ);
        assert_eq!(h.transport.take_commands(), vec![Command::DiscoverDescriptors(LEVEL)]);
        assert_ne!(h.engine.peripheral(SENSOR).unwrap().state(), PeripheralState::Ready);
        h.events();

        h.feed(TransportEvent::DescriptorsListed {
            handle: LEVEL,
            descriptors: vec![level_config()],
        });
        assert_eq!(
            h.events(),
            vec![
                Event::DescriptorReady {
                    descriptor: level_path().descriptor(CLIENT_CHARACTERISTIC_CONFIGURATION)
                },
                Event::CharacteristicReady {
                    characteristic: level_path()
                },
                Event::ServiceReady { service: battery_path() },
                Event::PeripheralStateChanged {
                    peripheral: SENSOR,
                    state: PeripheralState::Ready
                },
            ]
        );
        assert!(h.timers.live().is_empty());
        assert_eq!(h.engine.resolve(LEVEL), Some(NodePath::Characteristic(level_path())));
    }

    #[test]
    fn peripheral_without_services_is_ready() {
        let mut h = Harness::new();
        h.connect_sensor();
        h.feed(TransportEvent::ServicesListed {
            handle: PERIPHERAL,
            services: vec![],
        });
        assert_eq!(h.engine.peripheral(SENSOR).unwrap().state(), PeripheralState::Ready);
    }

    #[test]
    fn repeated_service_listing_updates_in_place() {
        let mut h = Harness::new();
        let path = h.ready_sensor();
        h.list_battery_service();

        let node = h.engine.peripheral(SENSOR).unwrap();
        assert_eq!(node.services().len(), 1);
        assert_eq!(node.state(), PeripheralState::Ready);
        assert!(h.engine.characteristic(&path).is_some());
        assert!(h.transport.commands().is_empty());
    }

    #[test]
    fn read_battery_level() {
        let mut h = Harness::new();
        let path = h.ready_sensor();

        h.engine.read_characteristic(&path).unwrap();
        assert_eq!(h.transport.take_commands(), vec![Command::Read(LEVEL)]);
        assert!(h.engine.characteristic(&path).unwrap().is_busy());

        h.feed(TransportEvent::ValueUpdated {
            handle: LEVEL,
            value: vec![0x32],
        });
        assert_eq!(
            h.events(),
            vec![Event::CharacteristicValueChanged {
                characteristic: path,
                value: vec![0x32],
                decoded: Some(Value::BatteryLevel(50)),
            }]
        );
        let node = h.engine.characteristic(&path).unwrap();
        assert!(!node.is_busy());
        assert_eq!(node.value(), Some(&[0x32][..]));
        assert!(h.timers.live().is_empty());
    }

    #[test]
    fn read_preconditions() {
        let mut h = Harness::new();
        h.connect_sensor();
        h.list_battery_service();
        h.list_level(CharacteristicProperties::READ);
        h.transport.take_commands();

        // Descriptors are still being discovered
        assert!(matches!(
            h.engine.read_characteristic(&level_path()),
            Err(Error::InvalidState(_))
        ));

        h.feed(TransportEvent::DescriptorsListed {
            handle: LEVEL,
            descriptors: vec![],
        });
        h.engine.read_characteristic(&level_path()).unwrap();
        assert!(matches!(
            h.engine.read_characteristic(&level_path()),
            Err(Error::InvalidState(_))
        ));
        assert_eq!(h.transport.commands(), vec![Command::Read(LEVEL)]);

        let unknown = battery_path().characteristic(SERIAL_NUMBER);
        assert!(matches!(h.engine.read_characteristic(&unknown), Err(Error::UnknownNode)));
    }

    #[test]
    fn capabilities_are_checked() {
        let mut h = Harness::new();
        let path = h.ready_sensor_with(CharacteristicProperties::INDICATE, vec![]);

        assert!(matches!(h.engine.read_characteristic(&path), Err(Error::NotReadable)));
        assert!(matches!(
            h.engine.write_characteristic(&path, &[1], true),
            Err(Error::NotWritable)
        ));
        assert!(h.transport.commands().is_empty());

        let mut h = Harness::new();
        let path = h.ready_sensor_with(CharacteristicProperties::READ, vec![]);
        assert!(matches!(h.engine.set_notifications(&path, true), Err(Error::NotNotifiable)));
    }

    #[test]
    fn commands_need_a_connection() {
        let mut h = Harness::new();
        let path = h.ready_sensor();
        h.engine.disconnect(SENSOR).unwrap();
        assert!(matches!(h.engine.read_characteristic(&path), Err(Error::InvalidState(_))));
        assert!(matches!(h.engine.discover_services(SENSOR), Err(Error::InvalidState(_))));
    }

    #[test]
    fn unacknowledged_write_is_upgraded_when_unsupported() {
        let mut h = Harness::new();
        let path = h.ready_sensor_with(CharacteristicProperties::WRITE, vec![]);

        let write_type = h.engine.write_characteristic(&path, &[1, 2], false).unwrap();
        assert_eq!(write_type, WriteType::WithResponse);
        assert_eq!(
            h.transport.take_commands(),
            vec![Command::Write {
                handle: LEVEL,
                data: vec![1, 2],
                ack: true
            }]
        );
        assert!(matches!(
            h.engine.write_characteristic(&path, &[3], false),
            Err(Error::InvalidState(_))
        ));

        h.feed(TransportEvent::WriteCompleted { handle: LEVEL });
        assert_eq!(h.events(), vec![Event::CharacteristicWritten { characteristic: path }]);
        assert!(h.timers.live().is_empty());
    }

    #[test]
    fn unacknowledged_write_completes_immediately() {
        let mut h = Harness::new();
        let path = h.ready_sensor_with(CharacteristicProperties::WRITE_WITHOUT_RESPONSE, vec![]);

        let write_type = h.engine.write_characteristic(&path, &[7], false).unwrap();
        assert_eq!(write_type, WriteType::WithoutResponse);
        assert!(!h.engine.characteristic(&path).unwrap().is_busy());
        assert!(h.timers.live().is_empty());

        // So another write can follow straight away
        h.engine.write_characteristic(&path, &[8], false).unwrap();
        assert_eq!(h.transport.commands().len(), 2);
    }

    #[test]
    fn acknowledged_write_needs_write_with_response() {
        let mut h = Harness::new();
        let path = h.ready_sensor_with(CharacteristicProperties::WRITE_WITHOUT_RESPONSE, vec![]);

        assert!(matches!(
            h.engine.write_characteristic(&path, &[7], true),
            Err(Error::NotWritable)
        ));
        assert!(h.transport.take_commands().is_empty());
        assert!(h.events().is_empty());
    }

    #[test]
    fn notifications_via_client_configuration() {
        let mut h = Harness::new();
        let path = h.ready_sensor();

        h.engine.set_notifications(&path, true).unwrap();
        assert_eq!(
            h.transport.take_commands(),
            vec![Command::Write {
                handle: LEVEL_CONFIG,
                data: vec![0x01, 0x00],
                ack: true
            }]
        );
        h.feed(TransportEvent::WriteCompleted { handle: LEVEL_CONFIG });
        assert_eq!(
            h.events(),
            vec![
                Event::DescriptorWritten {
                    descriptor: path.descriptor(CLIENT_CHARACTERISTIC_CONFIGURATION)
                },
                Event::NotificationsChanged {
                    characteristic: path,
                    enabled: true
                },
            ]
        );
        assert!(h.engine.characteristic(&path).unwrap().is_notifying());

        // Identical values are still reported every time
        h.feed(TransportEvent::ValueUpdated {
            handle: LEVEL,
            value: vec![80],
        });
        h.feed(TransportEvent::ValueUpdated {
            handle: LEVEL,
            value: vec![80],
        });
        assert_eq!(h.events().len(), 2);
    }

    #[test]
    fn indications_are_used_when_notifications_are_unsupported() {
        let mut h = Harness::new();
        let path = h.ready_sensor_with(CharacteristicProperties::INDICATE, vec![level_config()]);

        h.engine.set_notifications(&path, true).unwrap();
        assert_eq!(
            h.transport.take_commands(),
            vec![Command::Write {
                handle: LEVEL_CONFIG,
                data: vec![0x02, 0x00],
                ack: true
            }]
        );
    }

    #[test]
    fn notifications_without_configuration_descriptor() {
        let mut h = Harness::new();
        let path = h.ready_sensor_with(CharacteristicProperties::NOTIFY, vec![]);

        h.engine.set_notifications(&path, true).unwrap();
        assert_eq!(
            h.transport.take_commands(),
            vec![Command::SetNotify {
                handle: LEVEL,
                enabled: true
            }]
        );
        h.feed(TransportEvent::WriteCompleted { handle: LEVEL });
        assert_eq!(
            h.events(),
            vec![Event::NotificationsChanged {
                characteristic: path,
                enabled: true
            }]
        );
    }

    #[test]
    fn descriptor_read_and_write() {
        let mut h = Harness::new();
        let path = h.ready_sensor().descriptor(CLIENT_CHARACTERISTIC_CONFIGURATION);

        h.engine.read_descriptor(&path).unwrap();
        assert!(matches!(h.engine.read_descriptor(&path), Err(Error::InvalidState(_))));
        h.feed(TransportEvent::ValueUpdated {
            handle: LEVEL_CONFIG,
            value: vec![0, 0],
        });
        assert_eq!(
            h.events(),
            vec![Event::DescriptorValueChanged {
                descriptor: path,
                value: vec![0, 0],
                decoded: Some(Value::ClientConfiguration(ClientConfiguration::empty())),
            }]
        );

        h.engine.write_descriptor(&path, &[0x01, 0x00]).unwrap();
        h.feed(TransportEvent::WriteCompleted { handle: LEVEL_CONFIG });
        assert_eq!(h.engine.descriptor(&path).unwrap().value(), Some(&[0x01, 0x00][..]));
        assert!(h.engine.characteristic(&level_path()).unwrap().is_notifying());
    }

    #[test]
    fn unknown_handles_are_protocol_anomalies() {
        let mut h = Harness::new();
        h.ready_sensor();

        h.feed(TransportEvent::OperationFailed {
            handle: Handle(999),
            code: 5,
        });
        assert_eq!(
            h.events(),
            vec![Event::Error {
                scope: None,
                error: GattError::ProtocolAnomaly(Handle(999))
            }]
        );

        // Known handle, but the event makes no sense for a peripheral
        h.feed(TransportEvent::ValueUpdated {
            handle: PERIPHERAL,
            value: vec![1],
        });
        assert_eq!(
            h.events(),
            vec![Event::Error {
                scope: Some(NodePath::Peripheral(SENSOR)),
                error: GattError::ProtocolAnomaly(PERIPHERAL)
            }]
        );
        assert_eq!(h.engine.peripheral(SENSOR).unwrap().state(), PeripheralState::Ready);
    }

    #[test]
    fn redundant_connection_events_are_ignored() {
        let mut h = Harness::new();
        h.ready_sensor();
        h.feed(TransportEvent::Connected { handle: PERIPHERAL });
        assert!(h.events().is_empty());
        assert!(h.transport.commands().is_empty());
        assert_eq!(h.engine.peripheral(SENSOR).unwrap().state(), PeripheralState::Ready);
    }

    #[test]
    fn connection_failure_regresses_to_discovered() {
        let mut h = Harness::new();
        h.engine.start_scanning(ScanCriteria::new()).unwrap();
        h.advertise(PERIPHERAL, SENSOR, &[], -50);
        h.engine.connect(SENSOR).unwrap();
        h.events();

        h.feed(TransportEvent::Disconnected {
            handle: PERIPHERAL,
            code: Some(62),
        });
        assert_eq!(
            h.events(),
            vec![
                Event::PeripheralStateChanged {
                    peripheral: SENSOR,
                    state: PeripheralState::Discovered
                },
                Event::Error {
                    scope: Some(NodePath::Peripheral(SENSOR)),
                    error: GattError::Transport(62)
                },
            ]
        );
        assert!(h.timers.live().is_empty());

        // And the same when the transport reports the failure directly
        h.engine.connect(SENSOR).unwrap();
        h.feed(TransportEvent::OperationFailed {
            handle: PERIPHERAL,
            code: 133,
        });
        assert_eq!(h.engine.peripheral(SENSOR).unwrap().state(), PeripheralState::Discovered);
    }

    #[test]
    fn service_discovery_failure_regresses_to_connected() {
        let mut h = Harness::new();
        h.connect_sensor();
        h.events();
        h.transport.take_commands();

        h.feed(TransportEvent::OperationFailed {
            handle: PERIPHERAL,
            code: 133,
        });
        assert_eq!(
            h.events(),
            vec![
                Event::PeripheralStateChanged {
                    peripheral: SENSOR,
                    state: PeripheralState::Connected
                },
                Event::Error {
                    scope: Some(NodePath::Peripheral(SENSOR)),
                    error: GattError::Transport(133)
                },
            ]
        );

        h.engine.discover_services(SENSOR).unwrap();
        assert_eq!(h.transport.commands(), vec![Command::DiscoverServices(PERIPHERAL)]);
    }

    #[test]
    fn characteristic_discovery_can_be_retried() {
        let mut h = Harness::new();
        h.connect_sensor();
        h.list_battery_service();
        h.feed(TransportEvent::OperationFailed { handle: BATTERY, code: 10 });

        assert_eq!(h.engine.service(&battery_path()).unwrap().state(), ServiceState::Discovered);
        assert_eq!(
            h.engine.peripheral(SENSOR).unwrap().state(),
            PeripheralState::DiscoveringServices
        );

        h.engine.discover_characteristics(&battery_path()).unwrap();
        h.list_level(CharacteristicProperties::READ);
        h.feed(TransportEvent::DescriptorsListed {
            handle: LEVEL,
            descriptors: vec![],
        });
        assert_eq!(h.engine.peripheral(SENSOR).unwrap().state(), PeripheralState::Ready);
    }

    #[test]
    fn read_times_out() {
        let mut h = Harness::new();
        let path = h.ready_sensor();

        h.engine.read_characteristic(&path).unwrap();
        let timeout = h.timers.expire(LEVEL).unwrap();
        h.feed(timeout.clone());
        assert_eq!(
            h.events(),
            vec![Event::Error {
                scope: Some(NodePath::Characteristic(path)),
                error: GattError::Timeout
            }]
        );
        assert!(!h.engine.characteristic(&path).unwrap().is_busy());

        // A late timeout for the old read doesn't affect a new one
        h.engine.read_characteristic(&path).unwrap();
        h.feed(timeout);
        assert!(h.events().is_empty());
        assert!(h.engine.characteristic(&path).unwrap().is_busy());
    }

    #[test]
    fn connect_timeout_abandons_the_attempt() {
        let mut h = Harness::new();
        h.engine.start_scanning(ScanCriteria::new()).unwrap();
        h.advertise(PERIPHERAL, SENSOR, &[], -50);
        h.engine.connect(SENSOR).unwrap();
        h.transport.take_commands();

        let timeout = h.timers.expire(PERIPHERAL).unwrap();
        h.feed(timeout);
        assert_eq!(h.engine.peripheral(SENSOR).unwrap().state(), PeripheralState::Discovered);
        assert_eq!(h.transport.commands(), vec![Command::Disconnect(PERIPHERAL)]);

        // The transport confirming the cancellation changes nothing
        h.events();
        h.feed(TransportEvent::Disconnected {
            handle: PERIPHERAL,
            code: None,
        });
        assert!(h.events().is_empty());
    }

    #[test]
    fn disconnect_discards_the_tree() {
        let mut h = Harness::new();
        let path = h.ready_sensor();
        h.engine.read_characteristic(&path).unwrap();

        h.engine.disconnect(SENSOR).unwrap();
        let timers = h.timers.live();
        assert_eq!(timers.len(), 1);
        assert_eq!(timers[0].handle, PERIPHERAL);
        assert_eq!(state_changes(&h.events()), vec![PeripheralState::Disconnecting]);

        h.feed(TransportEvent::Disconnected {
            handle: PERIPHERAL,
            code: None,
        });
        assert_eq!(
            h.events(),
            vec![Event::PeripheralStateChanged {
                peripheral: SENSOR,
                state: PeripheralState::Disconnected
            }]
        );
        let node = h.engine.peripheral(SENSOR).unwrap();
        assert!(node.services().is_empty());
        assert_eq!(h.engine.resolve(LEVEL), None);
        assert_eq!(h.engine.resolve(PERIPHERAL), Some(NodePath::Peripheral(SENSOR)));
        assert!(h.timers.live().is_empty());

        // Late value for the dropped characteristic
        h.feed(TransportEvent::ValueUpdated {
            handle: LEVEL,
            value: vec![1],
        });
        assert_eq!(
            h.events(),
            vec![Event::Error {
                scope: None,
                error: GattError::ProtocolAnomaly(LEVEL)
            }]
        );

        h.feed(TransportEvent::Disconnected {
            handle: PERIPHERAL,
            code: None,
        });
        assert!(h.events().is_empty());
    }

    #[test]
    fn disconnect_timeout_forces_disconnected() {
        let mut h = Harness::new();
        h.ready_sensor();
        h.engine.disconnect(SENSOR).unwrap();

        let timeout = h.timers.expire(PERIPHERAL).unwrap();
        h.feed(timeout);
        let node = h.engine.peripheral(SENSOR).unwrap();
        assert_eq!(node.state(), PeripheralState::Disconnected);
        assert!(node.services().is_empty());
    }

    #[test]
    fn reconnect_rediscovers_from_scratch() {
        let mut h = Harness::new();
        h.ready_sensor();
        h.engine.disconnect(SENSOR).unwrap();
        h.feed(TransportEvent::Disconnected {
            handle: PERIPHERAL,
            code: None,
        });
        h.events();

        h.advertise(PERIPHERAL, SENSOR, &[BATTERY_SERVICE], -55);
        assert_eq!(
            state_changes(&h.events()),
            vec![PeripheralState::Discovered]
        );

        h.transport.take_commands();
        h.engine.connect(SENSOR).unwrap();
        h.feed(TransportEvent::Connected { handle: PERIPHERAL });
        assert_eq!(
            h.transport.commands(),
            vec![Command::Connect(PERIPHERAL), Command::DiscoverServices(PERIPHERAL)]
        );
    }

    #[test]
    fn auto_reconnect_after_link_loss() {
        let mut h = Harness::with_config(EngineConfig {
            reconnect: ReconnectPolicy::Auto,
            ..EngineConfig::default()
        });
        h.ready_sensor();

        h.feed(TransportEvent::Disconnected {
            handle: PERIPHERAL,
            code: Some(8),
        });
        let events = h.events();
        assert_eq!(
            state_changes(&events),
            vec![PeripheralState::Disconnected, PeripheralState::Connecting]
        );
        assert!(events.contains(&Event::Error {
            scope: Some(NodePath::Peripheral(SENSOR)),
            error: GattError::Transport(8)
        }));
        assert_eq!(h.transport.take_commands(), vec![Command::Connect(PERIPHERAL)]);

        // A requested disconnect is left alone
        h.feed(TransportEvent::Connected { handle: PERIPHERAL });
        h.transport.take_commands();
        h.engine.disconnect(SENSOR).unwrap();
        h.feed(TransportEvent::Disconnected {
            handle: PERIPHERAL,
            code: None,
        });
        assert_eq!(h.transport.commands(), vec![Command::Disconnect(PERIPHERAL)]);
        assert_eq!(h.engine.peripheral(SENSOR).unwrap().state(), PeripheralState::Disconnected);
    }

    #[test]
    fn forget_policy_removes_disconnected_peripherals() {
        let mut h = Harness::with_config(EngineConfig {
            reconnect: ReconnectPolicy::Forget,
            ..EngineConfig::default()
        });
        h.ready_sensor();

        h.feed(TransportEvent::Disconnected {
            handle: PERIPHERAL,
            code: None,
        });
        assert_eq!(
            h.events().last(),
            Some(&Event::PeripheralRemoved { peripheral: SENSOR })
        );
        assert!(h.engine.peripherals().is_empty());
        assert_eq!(h.engine.resolve(PERIPHERAL), None);
    }

    #[test]
    fn forget_disconnects_and_purges() {
        let mut h = Harness::new();
        h.ready_sensor();

        h.engine.forget(SENSOR).unwrap();
        assert_eq!(h.transport.commands(), vec![Command::Disconnect(PERIPHERAL)]);
        assert_eq!(h.events(), vec![Event::PeripheralRemoved { peripheral: SENSOR }]);
        assert_eq!(h.engine.resolve(PERIPHERAL), None);
        assert_eq!(h.engine.resolve(LEVEL), None);
        assert!(matches!(h.engine.forget(SENSOR), Err(Error::UnknownPeripheral(_))));
    }

    fn ready_sensor_with_service_changed(h: &mut Harness) {
        h.connect_sensor();
        h.feed(TransportEvent::ServicesListed {
            handle: PERIPHERAL,
            services: vec![
                DiscoveredService {
                    handle: Handle(2),
                    uuid: GENERIC_ATTRIBUTE_SERVICE,
                    is_primary: true,
                },
                battery_service(),
            ],
        });
        h.feed(TransportEvent::CharacteristicsListed {
            handle: Handle(2),
            characteristics: vec![DiscoveredCharacteristic {
                handle: Handle(3),
                uuid: SERVICE_CHANGED,
                properties: CharacteristicProperties::INDICATE,
            }],
        });
        h.feed(TransportEvent::DescriptorsListed {
            handle: Handle(3),
            descriptors: vec![],
        });
        h.list_level(CharacteristicProperties::READ);
        h.feed(TransportEvent::DescriptorsListed {
            handle: LEVEL,
            descriptors: vec![],
        });
        assert_eq!(h.engine.peripheral(SENSOR).unwrap().state(), PeripheralState::Ready);
        h.transport.take_commands();
    }

    #[test]
    fn service_changed_rediscovers_affected_services() {
        let mut h = Harness::new();
        ready_sensor_with_service_changed(&mut h);

        h.feed(TransportEvent::ValueUpdated {
            handle: Handle(3),
            value: vec![10, 0, 15, 0],
        });
        assert_eq!(h.transport.commands(), vec![Command::DiscoverCharacteristics(BATTERY)]);
        assert_eq!(
            h.engine.service(&battery_path()).unwrap().state(),
            ServiceState::DiscoveringCharacteristics
        );
        assert!(h.engine.characteristic(&level_path()).is_none());
        assert_eq!(h.engine.resolve(LEVEL), None);
    }

    #[test]
    fn service_changed_over_everything_rediscovers_services() {
        let mut h = Harness::new();
        ready_sensor_with_service_changed(&mut h);

        h.feed(TransportEvent::ValueUpdated {
            handle: Handle(3),
            value: vec![0x01, 0x00, 0xFF, 0xFF],
        });
        assert_eq!(h.transport.commands(), vec![Command::DiscoverServices(PERIPHERAL)]);
        let node = h.engine.peripheral(SENSOR).unwrap();
        assert_eq!(node.state(), PeripheralState::DiscoveringServices);
        assert!(node.services().is_empty());
    }

    #[test]
    fn engine_config_from_json() {
        let config: EngineConfig = serde_json::from_str(r#"{ "reconnect": "Auto" }"#).unwrap();
        assert_eq!(config.reconnect, ReconnectPolicy::Auto);
        assert_eq!(config.event_capacity, 256);

        let json = serde_json::to_string(&EngineConfig::default()).unwrap();
        let parsed: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, EngineConfig::default());
    }
}
