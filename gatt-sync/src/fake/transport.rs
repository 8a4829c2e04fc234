use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use log::{trace, warn};
use tokio::sync::mpsc;

use crate::criteria::ScanCriteria;
use crate::transport::{Transport, TransportEvent};
use crate::{Error, Handle, Result};

use super::{lock, FakeDevice};

/// A transport command, as recorded by [`FakeTransport`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Scan(ScanCriteria),
    StopScan,
    Connect(Handle),
    Disconnect(Handle),
    DiscoverServices(Handle),
    DiscoverCharacteristics(Handle),
    DiscoverDescriptors(Handle),
    Read(Handle),
    Write { handle: Handle, data: Vec<u8>, ack: bool },
    SetNotify { handle: Handle, enabled: bool },
}

#[derive(Debug, Default)]
struct FakeTransportInner {
    commands: Mutex<Vec<Command>>,
    devices: Mutex<Vec<FakeDevice>>,
    refuse: AtomicBool,

    // Responses are posted to the bus once attached, otherwise they're
    // queued for the test to collect with `take_events()`
    bus: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
    outbox: Mutex<Vec<TransportEvent>>,
}

/// A cheaply cloneable handle on a fake radio stack
#[derive(Clone, Debug, Default)]
pub struct FakeTransport {
    inner: Arc<FakeTransportInner>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport that posts its events straight to a session's transport bus
    pub fn with_bus(bus: mpsc::UnboundedSender<TransportEvent>) -> Self {
        let transport = Self::new();
        transport.attach(bus);
        transport
    }

    pub fn attach(&self, bus: mpsc::UnboundedSender<TransportEvent>) {
        *lock(&self.inner.bus) = Some(bus);
    }

    pub fn add_device(&self, device: FakeDevice) {
        lock(&self.inner.devices).push(device);
    }

    pub fn set_unresponsive(&self, unresponsive: bool) {
        for device in lock(&self.inner.devices).iter_mut() {
            device.unresponsive = unresponsive;
        }
    }

    /// Makes every subsequent command fail to dispatch
    pub fn set_refuse(&self, refuse: bool) {
        self.inner.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn commands(&self) -> Vec<Command> {
        lock(&self.inner.commands).clone()
    }

    pub fn take_commands(&self) -> Vec<Command> {
        lock(&self.inner.commands).drain(..).collect()
    }

    pub fn take_events(&self) -> Vec<TransportEvent> {
        lock(&self.inner.outbox).drain(..).collect()
    }

    /// Delivers an event as if the radio stack had produced it
    pub fn inject(&self, event: TransportEvent) {
        let bus = lock(&self.inner.bus);
        match bus.as_ref() {
            Some(bus) => {
                if bus.send(event).is_err() {
                    warn!("Fake transport event dropped; session has gone");
                }
            }
            None => lock(&self.inner.outbox).push(event),
        }
    }

    /// Simulates a notification (or indication) from a device, updating its
    /// stored value too
    pub fn notify(&self, handle: Handle, value: &[u8]) {
        for device in lock(&self.inner.devices).iter_mut() {
            if device.store(handle, value) {
                break;
            }
        }
        self.inject(TransportEvent::ValueUpdated {
            handle,
            value: value.to_vec(),
        });
    }

    fn dispatch(&self, command: Command) -> Result<()> {
        if self.inner.refuse.load(Ordering::SeqCst) {
            return Err(Error::Other(anyhow!("Fake transport refused {:?}", command)));
        }
        trace!("Fake transport: {:?}", command);

        let responses: Vec<TransportEvent> = lock(&self.inner.devices)
            .iter_mut()
            .flat_map(|device| device.respond(&command))
            .collect();
        lock(&self.inner.commands).push(command);
        for response in responses {
            self.inject(response);
        }
        Ok(())
    }
}

impl Transport for FakeTransport {
    fn scan(&self, criteria: &ScanCriteria) -> Result<()> {
        self.dispatch(Command::Scan(criteria.clone()))
    }
    fn stop_scan(&self) -> Result<()> {
        self.dispatch(Command::StopScan)
    }

    fn connect(&self, peripheral: Handle) -> Result<()> {
        self.dispatch(Command::Connect(peripheral))
    }
    fn disconnect(&self, peripheral: Handle) -> Result<()> {
        self.dispatch(Command::Disconnect(peripheral))
    }

    fn discover_services(&self, peripheral: Handle) -> Result<()> {
        self.dispatch(Command::DiscoverServices(peripheral))
    }
    fn discover_characteristics(&self, service: Handle) -> Result<()> {
        self.dispatch(Command::DiscoverCharacteristics(service))
    }
    fn discover_descriptors(&self, characteristic: Handle) -> Result<()> {
        self.dispatch(Command::DiscoverDescriptors(characteristic))
    }

    fn read(&self, handle: Handle) -> Result<()> {
        self.dispatch(Command::Read(handle))
    }
    fn write(&self, handle: Handle, data: &[u8], ack: bool) -> Result<()> {
        self.dispatch(Command::Write {
            handle,
            data: data.to_vec(),
            ack,
        })
    }
    fn set_notify(&self, characteristic: Handle, enabled: bool) -> Result<()> {
        self.dispatch(Command::SetNotify {
            handle: characteristic,
            enabled,
        })
    }
}
