use bitflags::bitflags;
use log::trace;
use uuid::Uuid;

use crate::descriptor::Descriptor;
use crate::node::CharacteristicState;
use crate::service::Service;
use crate::session::{wait_for, Session};
use crate::value::{CharacteristicKind, Value};
use crate::{CharacteristicPath, Error, Event, NodePath, PeripheralState, Result};

// For the public API a Characteristic is just a thin wrapper over a
// Session and the path to a characteristic node.
//
// Nothing is cached here; every accessor looks the node up in the engine,
// so a Characteristic whose node has been dropped (e.g. after a disconnect)
// will report `Error::UnknownNode` until it's re-discovered.

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Characteristic {
    session: Session,
    path: CharacteristicPath,
}

bitflags! {
    pub struct CharacteristicProperties: u32 {
        const NONE = 0;

        const BROADCAST = 0x01;
        const READ = 0x02;
        const WRITE_WITHOUT_RESPONSE = 0x04;
        const WRITE = 0x08;
        const NOTIFY = 0x10;
        const INDICATE = 0x20;
        const AUTHENTICATED_SIGNED_WRITES = 0x40;
        const EXTENDED_PROPERTIES = 0x80;
        const RELIABLE_WRITES = 0x100;
        const WRITABLE_AUXILIARIES = 0x200;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum WriteType {
    WithResponse,
    WithoutResponse,
}

impl Characteristic {
    pub(crate) fn wrap(session: Session, path: CharacteristicPath) -> Self {
        Self { session, path }
    }

    fn with_node<R>(&self, f: impl FnOnce(&crate::node::CharacteristicNode) -> R) -> Result<R> {
        self.session
            .with_engine(|engine| engine.characteristic(&self.path).map(f))
            .ok_or(Error::UnknownNode)
    }

    pub fn path(&self) -> CharacteristicPath {
        self.path
    }

    pub fn uuid(&self) -> Uuid {
        self.path.characteristic
    }

    pub fn service(&self) -> Service {
        Service::wrap(self.session.clone(), self.path.service())
    }

    pub fn properties(&self) -> Result<CharacteristicProperties> {
        self.with_node(|node| node.properties())
    }

    pub fn kind(&self) -> CharacteristicKind {
        CharacteristicKind::from_uuid(self.path.characteristic)
    }

    pub fn state(&self) -> Result<CharacteristicState> {
        self.with_node(|node| node.state())
    }

    /// The last value read or notified
    ///
    /// This won't initiate any IO.
    pub fn value(&self) -> Result<Option<Vec<u8>>> {
        self.with_node(|node| node.value().map(|value| value.to_vec()))
    }

    pub fn decoded(&self) -> Result<Option<Value>> {
        self.with_node(|node| node.decoded())
    }

    pub fn is_notifying(&self) -> Result<bool> {
        self.with_node(|node| node.is_notifying())
    }

    pub fn descriptors(&self) -> Result<Vec<Descriptor>> {
        self.with_node(|node| {
            node.descriptors()
                .iter()
                .map(|descriptor| Descriptor::wrap(self.session.clone(), descriptor.path()))
                .collect()
        })
    }

    pub fn descriptor(&self, uuid: Uuid) -> Option<Descriptor> {
        self.with_node(|node| node.descriptors().contains(&uuid))
            .ok()
            .filter(|found| *found)
            .map(|_| Descriptor::wrap(self.session.clone(), self.path.descriptor(uuid)))
    }

    /// Requests a read; the value is delivered as a
    /// [`CharacteristicValueChanged`](Event::CharacteristicValueChanged) event
    pub fn read(&self) -> Result<()> {
        trace!("read()");
        self.session.engine().read_characteristic(&self.path)
    }

    /// Reads the characteristic and waits for the value
    ///
    /// NB: a notification that arrives while the read is outstanding is
    /// indistinguishable from the read completion and will be returned.
    pub async fn read_value(&self) -> Result<Vec<u8>> {
        let events = self.session.events()?;
        self.read()?;
        let path = self.path;
        wait_for(events, |event| match event {
            Event::CharacteristicValueChanged { characteristic, value, .. } if *characteristic == path => {
                Some(Ok(value.clone()))
            }
            _ => operation_aborted(event, path),
        })
        .await
    }

    /// Requests a write, returning the kind of write actually issued (the
    /// characteristic's supported write modes take precedence over
    /// `write_type`)
    pub fn write(&self, data: &[u8], write_type: WriteType) -> Result<WriteType> {
        trace!("write({:?})", write_type);
        self.session
            .engine()
            .write_characteristic(&self.path, data, write_type == WriteType::WithResponse)
    }

    /// Writes the characteristic, waiting for the acknowledgement if the
    /// write was issued with a response
    pub async fn write_value(&self, data: &[u8], write_type: WriteType) -> Result<()> {
        let events = self.session.events()?;
        if self.write(data, write_type)? == WriteType::WithoutResponse {
            return Ok(());
        }
        let path = self.path;
        wait_for(events, |event| match event {
            Event::CharacteristicWritten { characteristic } if *characteristic == path => Some(Ok(())),
            _ => operation_aborted(event, path),
        })
        .await
    }

    pub fn set_notifications(&self, enabled: bool) -> Result<()> {
        trace!("set_notifications({})", enabled);
        self.session.engine().set_notifications(&self.path, enabled)
    }

    /// Enables notifications (or indications) and waits for confirmation
    pub async fn subscribe(&self) -> Result<()> {
        self.change_notifications(true).await
    }

    pub async fn unsubscribe(&self) -> Result<()> {
        self.change_notifications(false).await
    }

    async fn change_notifications(&self, enabled: bool) -> Result<()> {
        let events = self.session.events()?;
        self.set_notifications(enabled)?;
        let path = self.path;
        wait_for(events, |event| match event {
            Event::NotificationsChanged { characteristic, .. } if *characteristic == path => Some(Ok(())),
            Event::Error {
                scope: Some(NodePath::Descriptor(descriptor)),
                error,
            } if descriptor.characteristic() == path => Some(Err(error.clone().into())),
            _ => operation_aborted(event, path),
        })
        .await
    }

    pub fn discover_descriptors(&self) -> Result<()> {
        self.session.engine().discover_descriptors(&self.path)
    }
}

// Failures that end any wait on a characteristic operation
fn operation_aborted<T>(event: &Event, path: CharacteristicPath) -> Option<Result<T>> {
    match event {
        Event::Error {
            scope: Some(NodePath::Characteristic(characteristic)),
            error,
        } if *characteristic == path => Some(Err(error.clone().into())),
        Event::PeripheralStateChanged { peripheral, state }
            if *peripheral == path.peripheral
                && matches!(state, PeripheralState::Disconnecting | PeripheralState::Disconnected) =>
        {
            Some(Err(Error::InvalidState("peripheral disconnected")))
        }
        Event::PeripheralRemoved { peripheral } if *peripheral == path.peripheral => Some(Err(Error::UnknownNode)),
        _ => None,
    }
}
