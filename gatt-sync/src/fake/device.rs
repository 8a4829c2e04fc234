use uuid::Uuid;

use crate::characteristic::CharacteristicProperties;
use crate::transport::{DiscoveredCharacteristic, DiscoveredDescriptor, DiscoveredService, TransportEvent};
use crate::uuid::{BATTERY_LEVEL, BATTERY_SERVICE, CLIENT_CHARACTERISTIC_CONFIGURATION};
use crate::Handle;

use super::Command;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FakeDescriptor {
    pub handle: Handle,
    pub uuid: Uuid,
    pub value: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FakeCharacteristic {
    pub handle: Handle,
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
    pub value: Vec<u8>,
    pub descriptors: Vec<FakeDescriptor>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FakeService {
    pub handle: Handle,
    pub uuid: Uuid,
    pub is_primary: bool,
    pub characteristics: Vec<FakeCharacteristic>,
}

/// A simulated peripheral and its GATT database
///
/// Handles must be unique across every device added to the same
/// [`FakeTransport`](super::FakeTransport).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FakeDevice {
    pub handle: Handle,
    pub id: Uuid,
    pub name: Option<String>,
    pub rssi: i16,
    pub services: Vec<FakeService>,
    /// Stops the device from answering anything but scans, to simulate a
    /// stalled link
    pub unresponsive: bool,
}

impl FakeDevice {
    pub fn new(handle: Handle, id: Uuid, name: Option<&str>) -> Self {
        Self {
            handle,
            id,
            name: name.map(str::to_string),
            rssi: -60,
            services: vec![],
            unresponsive: false,
        }
    }

    /// A device exposing a Battery service with a readable, notifiable
    /// Battery Level characteristic
    ///
    /// Attribute handles are allocated from `handle`: the service is at
    /// `handle + 10`, the level at `handle + 11` and its client
    /// configuration descriptor at `handle + 12`.
    pub fn battery_sensor(handle: Handle, id: Uuid, level: u8) -> Self {
        let mut device = Self::new(handle, id, Some("Battery Sensor"));
        device.services.push(FakeService {
            handle: Handle(handle.0 + 10),
            uuid: BATTERY_SERVICE,
            is_primary: true,
            characteristics: vec![FakeCharacteristic {
                handle: Handle(handle.0 + 11),
                uuid: BATTERY_LEVEL,
                properties: CharacteristicProperties::READ | CharacteristicProperties::NOTIFY,
                value: vec![level],
                descriptors: vec![FakeDescriptor {
                    handle: Handle(handle.0 + 12),
                    uuid: CLIENT_CHARACTERISTIC_CONFIGURATION,
                    value: vec![0, 0],
                }],
            }],
        });
        device
    }

    fn advertised_services(&self) -> Vec<Uuid> {
        self.services
            .iter()
            .filter(|service| service.is_primary)
            .map(|service| service.uuid)
            .collect()
    }

    fn service(&self, handle: Handle) -> Option<&FakeService> {
        self.services.iter().find(|service| service.handle == handle)
    }

    fn characteristic_mut(&mut self, handle: Handle) -> Option<&mut FakeCharacteristic> {
        self.services
            .iter_mut()
            .flat_map(|service| service.characteristics.iter_mut())
            .find(|characteristic| characteristic.handle == handle)
    }

    fn descriptor_mut(&mut self, handle: Handle) -> Option<&mut FakeDescriptor> {
        self.services
            .iter_mut()
            .flat_map(|service| service.characteristics.iter_mut())
            .flat_map(|characteristic| characteristic.descriptors.iter_mut())
            .find(|descriptor| descriptor.handle == handle)
    }

    /// Updates a stored characteristic or descriptor value, returning false
    /// if the handle isn't part of this device
    pub(crate) fn store(&mut self, handle: Handle, value: &[u8]) -> bool {
        if let Some(characteristic) = self.characteristic_mut(handle) {
            characteristic.value = value.to_vec();
            true
        } else if let Some(descriptor) = self.descriptor_mut(handle) {
            descriptor.value = value.to_vec();
            true
        } else {
            false
        }
    }

    /// The events this device would produce in response to `command`
    pub(crate) fn respond(&mut self, command: &Command) -> Vec<TransportEvent> {
        if let Command::Scan(_) = command {
            return vec![TransportEvent::AdvertisementSeen {
                handle: self.handle,
                id: self.id,
                name: self.name.clone(),
                rssi: self.rssi,
                services: self.advertised_services(),
            }];
        }
        if self.unresponsive {
            return vec![];
        }

        let event = match *command {
            Command::Connect(handle) if handle == self.handle => TransportEvent::Connected { handle },
            Command::Disconnect(handle) if handle == self.handle => TransportEvent::Disconnected { handle, code: None },
            Command::DiscoverServices(handle) if handle == self.handle => TransportEvent::ServicesListed {
                handle,
                services: self
                    .services
                    .iter()
                    .map(|service| DiscoveredService {
                        handle: service.handle,
                        uuid: service.uuid,
                        is_primary: service.is_primary,
                    })
                    .collect(),
            },
            Command::DiscoverCharacteristics(handle) => match self.service(handle) {
                Some(service) => TransportEvent::CharacteristicsListed {
                    handle,
                    characteristics: service
                        .characteristics
                        .iter()
                        .map(|characteristic| DiscoveredCharacteristic {
                            handle: characteristic.handle,
                            uuid: characteristic.uuid,
                            properties: characteristic.properties,
                        })
                        .collect(),
                },
                None => return vec![],
            },
            Command::DiscoverDescriptors(handle) => match self.characteristic_mut(handle) {
                Some(characteristic) => TransportEvent::DescriptorsListed {
                    handle,
                    descriptors: characteristic
                        .descriptors
                        .iter()
                        .map(|descriptor| DiscoveredDescriptor {
                            handle: descriptor.handle,
                            uuid: descriptor.uuid,
                        })
                        .collect(),
                },
                None => return vec![],
            },
            Command::Read(handle) => {
                let value = match self.characteristic_mut(handle) {
                    Some(characteristic) => characteristic.value.clone(),
                    None => match self.descriptor_mut(handle) {
                        Some(descriptor) => descriptor.value.clone(),
                        None => return vec![],
                    },
                };
                TransportEvent::ValueUpdated { handle, value }
            }
            Command::Write { handle, ref data, ack } => {
                if !self.store(handle, data) || !ack {
                    return vec![];
                }
                TransportEvent::WriteCompleted { handle }
            }
            Command::SetNotify { handle, .. } => match self.characteristic_mut(handle) {
                Some(_) => TransportEvent::WriteCompleted { handle },
                None => return vec![],
            },
            _ => return vec![],
        };
        vec![event]
    }
}
