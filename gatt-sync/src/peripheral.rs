use std::collections::HashSet;

use futures::Stream;
use log::trace;
use uuid::Uuid;

use crate::service::Service;
use crate::session::{wait_for, Session};
use crate::{Error, Event, NodePath, PeripheralState, Result};

// For the public API a Peripheral is just a thin wrapper over a Session and
// the id of a peripheral node.
//
// It's notably not used internally: the engine only deals with ids and
// paths so that the tree never holds references back to the Session.

#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct Peripheral {
    session: Session,
    id: Uuid,
}

impl Peripheral {
    pub(crate) fn wrap(session: Session, id: Uuid) -> Self {
        Self { session, id }
    }

    fn with_node<R>(&self, f: impl FnOnce(&crate::node::PeripheralNode) -> R) -> Result<R> {
        let id = self.id;
        self.session
            .with_engine(|engine| engine.peripheral(id).map(f))
            .ok_or(Error::UnknownPeripheral(id))
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn name(&self) -> Result<Option<String>> {
        self.with_node(|node| node.name().map(str::to_string))
    }

    /// The RSSI of the most recent advertisement
    pub fn rssi(&self) -> Result<i16> {
        self.with_node(|node| node.rssi())
    }

    pub fn state(&self) -> Result<PeripheralState> {
        self.with_node(|node| node.state())
    }

    /// A (potentially incomplete) set of service UUIDs seen in
    /// advertisements from this peripheral.
    ///
    /// A complete list of services can only be reliably discovered after
    /// connecting to the device.
    pub fn advertised_services(&self) -> Result<HashSet<Uuid>> {
        self.with_node(|node| node.advertised_services().clone())
    }

    /// Requests to connect to the peripheral.
    ///
    /// A successful result means that the request has been _initiated_.
    /// Once connected, services, characteristics and descriptors are
    /// discovered automatically and the peripheral becomes
    /// [`Ready`](PeripheralState::Ready) when discovery is complete (see
    /// [`ready()`](Self::ready)).
    ///
    /// You can cancel a request to connect by calling
    /// [`disconnect()`](Self::disconnect)
    pub fn connect(&self) -> Result<()> {
        trace!("connect()");
        self.session.engine().connect(self.id)
    }

    pub fn disconnect(&self) -> Result<()> {
        trace!("disconnect()");
        self.session.engine().disconnect(self.id)
    }

    /// Drops the peripheral and all of its discovered state, disconnecting
    /// first if necessary
    pub fn forget(&self) -> Result<()> {
        self.session.engine().forget(self.id)
    }

    /// Re-runs service discovery, dropping all previously discovered
    /// services
    ///
    /// # Errors
    ///
    /// The peripheral should be connected and idle and this will return
    /// `Error::InvalidState` if not.
    pub fn discover_services(&self) -> Result<()> {
        self.session.engine().discover_services(self.id)
    }

    /// Waits until the peripheral is connected and fully discovered
    ///
    /// Fails if the peripheral disconnects first, or if discovery fails for
    /// any of its services, characteristics or descriptors.
    pub async fn ready(&self) -> Result<()> {
        let events = self.session.events()?;
        if self.state()? == PeripheralState::Ready {
            return Ok(());
        }
        let id = self.id;
        wait_for(events, |event| match event {
            Event::PeripheralStateChanged { peripheral, state } if *peripheral == id => match state {
                PeripheralState::Ready => Some(Ok(())),
                PeripheralState::Disconnecting | PeripheralState::Disconnected => {
                    Some(Err(Error::InvalidState("peripheral disconnected")))
                }
                _ => None,
            },
            Event::Error {
                scope: Some(scope),
                error,
            } if scope.peripheral() == id => Some(Err(error.clone().into())),
            Event::PeripheralRemoved { peripheral } if *peripheral == id => Some(Err(Error::UnknownPeripheral(id))),
            _ => None,
        })
        .await
    }

    /// Events relating to this peripheral (plus any events that don't
    /// relate to a specific peripheral)
    pub fn events(&self) -> Result<impl Stream<Item = Event>> {
        self.session.peripheral_events(self)
    }

    /// Get a discovered service by its `uuid`
    ///
    /// This won't initiate any IO, so it will only return a service that has
    /// been previously discovered.
    pub fn service(&self, uuid: Uuid) -> Option<Service> {
        self.with_node(|node| node.services().contains(&uuid))
            .ok()
            .filter(|found| *found)
            .map(|_| Service::wrap(self.session.clone(), crate::ServicePath { peripheral: self.id, service: uuid }))
    }

    /// Fetch all the services that have been discovered for this
    /// `Peripheral`, in discovery order
    pub fn services(&self) -> Result<Vec<Service>> {
        self.with_node(|node| {
            node.services()
                .iter()
                .map(|service| Service::wrap(self.session.clone(), service.path()))
                .collect()
        })
    }
}
