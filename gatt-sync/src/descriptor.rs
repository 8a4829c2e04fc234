use uuid::Uuid;

use crate::characteristic::Characteristic;
use crate::session::{wait_for, Session};
use crate::value::{DescriptorKind, Value};
use crate::{DescriptorPath, Error, Event, NodePath, PeripheralState, Result};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Descriptor {
    session: Session,
    path: DescriptorPath,
}

impl Descriptor {
    pub(crate) fn wrap(session: Session, path: DescriptorPath) -> Self {
        Self { session, path }
    }

    fn with_node<R>(&self, f: impl FnOnce(&crate::node::DescriptorNode) -> R) -> Result<R> {
        self.session
            .with_engine(|engine| engine.descriptor(&self.path).map(f))
            .ok_or(Error::UnknownNode)
    }

    pub fn path(&self) -> DescriptorPath {
        self.path
    }

    pub fn uuid(&self) -> Uuid {
        self.path.descriptor
    }

    pub fn kind(&self) -> DescriptorKind {
        DescriptorKind::from_uuid(self.path.descriptor)
    }

    pub fn characteristic(&self) -> Characteristic {
        Characteristic::wrap(self.session.clone(), self.path.characteristic())
    }

    pub fn value(&self) -> Result<Option<Vec<u8>>> {
        self.with_node(|node| node.value().map(|value| value.to_vec()))
    }

    pub fn decoded(&self) -> Result<Option<Value>> {
        self.with_node(|node| node.decoded())
    }

    pub fn read(&self) -> Result<()> {
        self.session.engine().read_descriptor(&self.path)
    }

    pub fn write(&self, data: &[u8]) -> Result<()> {
        self.session.engine().write_descriptor(&self.path, data)
    }

    pub async fn read_value(&self) -> Result<Vec<u8>> {
        let events = self.session.events()?;
        self.read()?;
        let path = self.path;
        wait_for(events, |event| match event {
            Event::DescriptorValueChanged { descriptor, value, .. } if *descriptor == path => Some(Ok(value.clone())),
            _ => operation_aborted(event, path),
        })
        .await
    }

    pub async fn write_value(&self, data: &[u8]) -> Result<()> {
        let events = self.session.events()?;
        self.write(data)?;
        let path = self.path;
        wait_for(events, |event| match event {
            Event::DescriptorWritten { descriptor } if *descriptor == path => Some(Ok(())),
            _ => operation_aborted(event, path),
        })
        .await
    }
}

fn operation_aborted<T>(event: &Event, path: DescriptorPath) -> Option<Result<T>> {
    match event {
        Event::Error {
            scope: Some(NodePath::Descriptor(descriptor)),
            error,
        } if *descriptor == path => Some(Err(error.clone().into())),
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
