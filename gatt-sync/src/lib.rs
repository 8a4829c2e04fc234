use ::uuid::Uuid;
use std::fmt;

pub mod uuid;

pub mod criteria;
pub use criteria::{Advertisement, DuplicatePolicy, ScanCriteria};

pub mod transport;
pub use transport::{Scheduler, Transport, TransportEvent};

pub mod node;
pub use node::{CharacteristicState, PeripheralState, ServiceState};

pub mod value;
pub use value::Value;

pub mod engine;
pub use engine::{CentralEngine, EngineConfig, ReconnectPolicy};

pub mod session;
pub use session::{Session, SessionConfig};

pub mod peripheral;
pub use peripheral::Peripheral;

pub mod service;
pub use service::Service;

pub mod characteristic;
pub use characteristic::{Characteristic, CharacteristicProperties, WriteType};

pub mod descriptor;
pub use descriptor::Descriptor;

pub mod fake;

/// An opaque, transport-assigned handle for a node in the GATT hierarchy
///
/// Every event delivered by a [`Transport`] is tagged with the handle of the
/// node it relates to and the engine maintains an index from handles back to
/// nodes. Handles only need to be unique within a single transport.
///
/// On transports where it's supported a handle should correspond to the
/// underlying ATT attribute handle (which is also what Service Changed
/// indications refer to).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(pub u32);

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identifies one outstanding operation (and its timer)
///
/// Tokens are never re-used by an engine so a timer that fires after its
/// operation has completed (or been cancelled) can be recognised as stale.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpToken(pub(crate) u64);

// Parent references are represented as paths of identifiers that are
// resolved by lookup from the root, so a child never keeps its parent
// alive and there are no ownership cycles in the tree.

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ServicePath {
    pub peripheral: Uuid,
    pub service: Uuid,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CharacteristicPath {
    pub peripheral: Uuid,
    pub service: Uuid,
    pub characteristic: Uuid,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DescriptorPath {
    pub peripheral: Uuid,
    pub service: Uuid,
    pub characteristic: Uuid,
    pub descriptor: Uuid,
}

impl ServicePath {
    pub fn characteristic(&self, characteristic: Uuid) -> CharacteristicPath {
        CharacteristicPath {
            peripheral: self.peripheral,
            service: self.service,
            characteristic,
        }
    }
}

impl CharacteristicPath {
    pub fn service(&self) -> ServicePath {
        ServicePath {
            peripheral: self.peripheral,
            service: self.service,
        }
    }

    pub fn descriptor(&self, descriptor: Uuid) -> DescriptorPath {
        DescriptorPath {
            peripheral: self.peripheral,
            service: self.service,
            characteristic: self.characteristic,
            descriptor,
        }
    }
}

impl DescriptorPath {
    pub fn characteristic(&self) -> CharacteristicPath {
        CharacteristicPath {
            peripheral: self.peripheral,
            service: self.service,
            characteristic: self.characteristic,
        }
    }
}

/// The location of any node in the hierarchy
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NodePath {
    Peripheral(Uuid),
    Service(ServicePath),
    Characteristic(CharacteristicPath),
    Descriptor(DescriptorPath),
}

impl NodePath {
    pub fn peripheral(&self) -> Uuid {
        match self {
            NodePath::Peripheral(id) => *id,
            NodePath::Service(path) => path.peripheral,
            NodePath::Characteristic(path) => path.peripheral,
            NodePath::Descriptor(path) => path.peripheral,
        }
    }
}

/// Asynchronous failures, as reported on the observer bus
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum GattError {
    #[error("Transport failure (code {0})")]
    Transport(i32),

    #[error("Operation timed out")]
    Timeout,

    #[error("Event referenced an unknown handle {0}")]
    ProtocolAnomaly(Handle),
}

#[non_exhaustive]
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    /// A peripheral was seen advertising and passed the scan criteria
    ///
    /// Depending on the [`DuplicatePolicy`] this may also be re-sent for
    /// each new advertisement (with a refreshed `rssi`) until the peripheral
    /// is connected.
    PeripheralDiscovered {
        peripheral: Uuid,
        name: Option<String>,
        rssi: i16,
    },
    PeripheralStateChanged {
        peripheral: Uuid,
        state: PeripheralState,
    },
    /// The peripheral (and its whole subtree) was dropped by the engine,
    /// either via `forget()` or the `Forget` reconnect policy.
    PeripheralRemoved {
        peripheral: Uuid,
    },
    ServiceReady {
        service: ServicePath,
    },
    CharacteristicReady {
        characteristic: CharacteristicPath,
    },
    /// Sent for every read completion and every notification/indication,
    /// even if the value is identical to the last one.
    CharacteristicValueChanged {
        characteristic: CharacteristicPath,
        value: Vec<u8>,
        decoded: Option<Value>,
    },
    CharacteristicWritten {
        characteristic: CharacteristicPath,
    },
    NotificationsChanged {
        characteristic: CharacteristicPath,
        enabled: bool,
    },
    DescriptorReady {
        descriptor: DescriptorPath,
    },
    DescriptorValueChanged {
        descriptor: DescriptorPath,
        value: Vec<u8>,
        decoded: Option<Value>,
    },
    DescriptorWritten {
        descriptor: DescriptorPath,
    },
    /// An asynchronous failure. `scope` is `None` for failures that can't
    /// be associated with any node (such as protocol anomalies)
    Error {
        scope: Option<NodePath>,
        error: GattError,
    },
}

impl Event {
    /// The peripheral this event relates to, if any
    pub fn peripheral(&self) -> Option<Uuid> {
        match self {
            Event::PeripheralDiscovered { peripheral, .. } => Some(*peripheral),
            Event::PeripheralStateChanged { peripheral, .. } => Some(*peripheral),
            Event::PeripheralRemoved { peripheral } => Some(*peripheral),
            Event::ServiceReady { service } => Some(service.peripheral),
            Event::CharacteristicReady { characteristic } => Some(characteristic.peripheral),
            Event::CharacteristicValueChanged { characteristic, .. } => Some(characteristic.peripheral),
            Event::CharacteristicWritten { characteristic } => Some(characteristic.peripheral),
            Event::NotificationsChanged { characteristic, .. } => Some(characteristic.peripheral),
            Event::DescriptorReady { descriptor } => Some(descriptor.peripheral),
            Event::DescriptorValueChanged { descriptor, .. } => Some(descriptor.peripheral),
            Event::DescriptorWritten { descriptor } => Some(descriptor.peripheral),
            Event::Error { scope, .. } => scope.map(|scope| scope.peripheral()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("No peripheral known with id {0}")]
    UnknownPeripheral(Uuid),

    #[error("No such node in the GATT hierarchy")]
    UnknownNode,

    #[error("Invalid state: {0}")]
    InvalidState(&'static str),

    #[error("Characteristic is not readable")]
    NotReadable,

    #[error("Characteristic is not writable")]
    NotWritable,

    #[error("Characteristic doesn't support notifications or indications")]
    NotNotifiable,

    #[error("Transport failure (code {0})")]
    TransportFailure(i32),

    #[error("Operation timed out")]
    OperationTimeout,

    #[error("Event referenced an unknown handle {0}")]
    ProtocolAnomaly(Handle),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<GattError> for Error {
    fn from(err: GattError) -> Self {
        match err {
            GattError::Transport(code) => Error::TransportFailure(code),
            GattError::Timeout => Error::OperationTimeout,
            GattError::ProtocolAnomaly(handle) => Error::ProtocolAnomaly(handle),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
