use std::fmt::Debug;
use std::time::Duration;

use uuid::Uuid;

use crate::characteristic::CharacteristicProperties;
use crate::criteria::ScanCriteria;
use crate::{Handle, OpToken, Result};

/// Reported in place of a status code when the transport didn't provide one
pub const UNSPECIFIED_FAILURE: i32 = -1;

// The command side of the radio stack.
//
// Every command is fire-and-forget: returning `Ok(())` only means the request
// was dispatched. Completion (or failure) is reported later as a
// `TransportEvent` tagged with the handle of the node concerned. An `Err`
// should only be returned if the request couldn't be dispatched at all.
//
// Commands are issued while the engine is being mutated so implementations
// must not block or call back into the engine synchronously; events should
// be queued (e.g. on the session's transport bus) instead.
pub trait Transport: Debug + Send {
    fn scan(&self, criteria: &ScanCriteria) -> Result<()>;
    fn stop_scan(&self) -> Result<()>;

    fn connect(&self, peripheral: Handle) -> Result<()>;
    fn disconnect(&self, peripheral: Handle) -> Result<()>;

    fn discover_services(&self, peripheral: Handle) -> Result<()>;
    fn discover_characteristics(&self, service: Handle) -> Result<()>;
    fn discover_descriptors(&self, characteristic: Handle) -> Result<()>;

    /// Read a characteristic or descriptor value
    fn read(&self, handle: Handle) -> Result<()>;

    /// Write a characteristic or descriptor value
    ///
    /// A `WriteCompleted` event is only expected for acknowledged writes
    fn write(&self, handle: Handle, data: &[u8], ack: bool) -> Result<()>;

    /// Enable/disable notifications for a characteristic on transports that
    /// manage the client configuration descriptor themselves. Completion is
    /// reported with a `WriteCompleted` event for the characteristic.
    fn set_notify(&self, characteristic: Handle, enabled: bool) -> Result<()>;
}

/// Arms and cancels operation timers for the engine
///
/// When a timer expires the scheduler must deliver a
/// [`TransportEvent::Timeout`] through the same path as transport events so
/// there's only one way the tree ever gets mutated.
pub trait Scheduler: Debug + Send {
    fn arm(&self, handle: Handle, token: OpToken, after: Duration);
    fn cancel(&self, token: OpToken);
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiscoveredService {
    pub handle: Handle,
    pub uuid: Uuid,
    pub is_primary: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiscoveredCharacteristic {
    pub handle: Handle,
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiscoveredDescriptor {
    pub handle: Handle,
    pub uuid: Uuid,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    AdvertisementSeen {
        handle: Handle,
        id: Uuid,
        name: Option<String>,
        rssi: i16,
        services: Vec<Uuid>,
    },
    Connected {
        handle: Handle,
    },
    Disconnected {
        handle: Handle,
        /// The reason code, if the link was lost rather than closed on request
        code: Option<i32>,
    },
    /// Result of `discover_services`; `handle` is the peripheral
    ServicesListed {
        handle: Handle,
        services: Vec<DiscoveredService>,
    },
    /// Result of `discover_characteristics`; `handle` is the service
    CharacteristicsListed {
        handle: Handle,
        characteristics: Vec<DiscoveredCharacteristic>,
    },
    /// Result of `discover_descriptors`; `handle` is the characteristic
    DescriptorsListed {
        handle: Handle,
        descriptors: Vec<DiscoveredDescriptor>,
    },
    /// A read completion, notification or indication for a characteristic
    /// or descriptor
    ValueUpdated {
        handle: Handle,
        value: Vec<u8>,
    },
    WriteCompleted {
        handle: Handle,
    },
    OperationFailed {
        handle: Handle,
        code: i32,
    },
    /// Synthesized by a [`Scheduler`] when an operation timer expires
    Timeout {
        handle: Handle,
        token: OpToken,
    },
}

impl TransportEvent {
    pub fn handle(&self) -> Handle {
        match self {
            TransportEvent::AdvertisementSeen { handle, .. }
            | TransportEvent::Connected { handle }
            | TransportEvent::Disconnected { handle, .. }
            | TransportEvent::ServicesListed { handle, .. }
            | TransportEvent::CharacteristicsListed { handle, .. }
            | TransportEvent::DescriptorsListed { handle, .. }
            | TransportEvent::ValueUpdated { handle, .. }
            | TransportEvent::WriteCompleted { handle }
            | TransportEvent::OperationFailed { handle, .. }
            | TransportEvent::Timeout { handle, .. } => *handle,
        }
    }
}
