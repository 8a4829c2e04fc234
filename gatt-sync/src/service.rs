use uuid::Uuid;

use crate::characteristic::Characteristic;
use crate::node::ServiceState;
use crate::peripheral::Peripheral;
use crate::session::Session;
use crate::value::ServiceKind;
use crate::{Error, Result, ServicePath};

// For the public API a Service is just a thin wrapper over a Session and
// the path to a service node.

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Service {
    session: Session,
    path: ServicePath,
}

impl Service {
    pub(crate) fn wrap(session: Session, path: ServicePath) -> Self {
        Self { session, path }
    }

    fn with_node<R>(&self, f: impl FnOnce(&crate::node::ServiceNode) -> R) -> Result<R> {
        self.session
            .with_engine(|engine| engine.service(&self.path).map(f))
            .ok_or(Error::UnknownNode)
    }

    pub fn path(&self) -> ServicePath {
        self.path
    }

    pub fn uuid(&self) -> Uuid {
        self.path.service
    }

    pub fn kind(&self) -> ServiceKind {
        ServiceKind::from_uuid(self.path.service)
    }

    pub fn peripheral(&self) -> Peripheral {
        Peripheral::wrap(self.session.clone(), self.path.peripheral)
    }

    pub fn is_primary(&self) -> Result<bool> {
        self.with_node(|node| node.is_primary())
    }

    pub fn state(&self) -> Result<ServiceState> {
        self.with_node(|node| node.state())
    }

    /// Re-discovers this service's characteristics, dropping any that were
    /// previously discovered
    pub fn discover_characteristics(&self) -> Result<()> {
        self.session.engine().discover_characteristics(&self.path)
    }

    pub fn characteristic(&self, uuid: Uuid) -> Option<Characteristic> {
        self.with_node(|node| node.characteristics().contains(&uuid))
            .ok()
            .filter(|found| *found)
            .map(|_| Characteristic::wrap(self.session.clone(), self.path.characteristic(uuid)))
    }

    pub fn characteristics(&self) -> Result<Vec<Characteristic>> {
        self.with_node(|node| {
            node.characteristics()
                .iter()
                .map(|characteristic| Characteristic::wrap(self.session.clone(), characteristic.path()))
                .collect()
        })
    }
}
