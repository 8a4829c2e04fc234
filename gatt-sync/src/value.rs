//! Decoding of well-known characteristic and descriptor values
//!
//! Nodes only ever store raw bytes. When a node is created its UUID is
//! matched against the registry below to pick a "kind" and that kind is what
//! knows how to interpret the bytes. Anything not in the registry is
//! `Other` and just has no decoded form.

use bitflags::bitflags;
use log::debug;
use uuid::Uuid;

use crate::uuid::*;

bitflags! {
    /// Client Characteristic Configuration bits (0x2902)
    pub struct ClientConfiguration: u16 {
        const NOTIFY = 0x0001;
        const INDICATE = 0x0002;
    }
}

impl ClientConfiguration {
    pub fn to_le_bytes(self) -> [u8; 2] {
        self.bits().to_le_bytes()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DateTime {
    pub year: u16,
    pub month: u8,
    pub day: u8,
    pub hours: u8,
    pub minutes: u8,
    pub seconds: u8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CurrentTime {
    pub date_time: DateTime,
    /// 1 = Monday .. 7 = Sunday, 0 = unknown
    pub day_of_week: u8,
    pub fractions256: u8,
    pub adjust_reason: u8,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Value {
    /// Percentage, 0..=100
    BatteryLevel(u8),
    CurrentTime(CurrentTime),
    DateTime(DateTime),
    /// The affected attribute handle range from a Service Changed indication
    ServiceChanged { start: u16, end: u16 },
    Text(String),
    ClientConfiguration(ClientConfiguration),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServiceKind {
    GenericAccess,
    GenericAttribute,
    CurrentTime,
    DeviceInformation,
    HeartRate,
    Battery,
    Other,
}

impl ServiceKind {
    pub fn from_uuid(uuid: Uuid) -> Self {
        match uuid {
            GENERIC_ACCESS_SERVICE => ServiceKind::GenericAccess,
            GENERIC_ATTRIBUTE_SERVICE => ServiceKind::GenericAttribute,
            CURRENT_TIME_SERVICE => ServiceKind::CurrentTime,
            DEVICE_INFORMATION_SERVICE => ServiceKind::DeviceInformation,
            HEART_RATE_SERVICE => ServiceKind::HeartRate,
            BATTERY_SERVICE => ServiceKind::Battery,
            _ => ServiceKind::Other,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CharacteristicKind {
    DeviceName,
    ServiceChanged,
    DateTime,
    BatteryLevel,
    ModelNumber,
    SerialNumber,
    FirmwareRevision,
    ManufacturerName,
    CurrentTime,
    Other,
}

impl CharacteristicKind {
    pub fn from_uuid(uuid: Uuid) -> Self {
        match uuid {
            DEVICE_NAME => CharacteristicKind::DeviceName,
            SERVICE_CHANGED => CharacteristicKind::ServiceChanged,
            DATE_TIME => CharacteristicKind::DateTime,
            BATTERY_LEVEL => CharacteristicKind::BatteryLevel,
            MODEL_NUMBER => CharacteristicKind::ModelNumber,
            SERIAL_NUMBER => CharacteristicKind::SerialNumber,
            FIRMWARE_REVISION => CharacteristicKind::FirmwareRevision,
            MANUFACTURER_NAME => CharacteristicKind::ManufacturerName,
            CURRENT_TIME => CharacteristicKind::CurrentTime,
            _ => CharacteristicKind::Other,
        }
    }

    pub fn decode(&self, bytes: &[u8]) -> Option<Value> {
        let value = match self {
            CharacteristicKind::BatteryLevel => decode_battery_level(bytes),
            CharacteristicKind::ServiceChanged => decode_service_changed(bytes),
            CharacteristicKind::DateTime => decode_date_time(bytes).map(Value::DateTime),
            CharacteristicKind::CurrentTime => decode_current_time(bytes),
            CharacteristicKind::DeviceName
            | CharacteristicKind::ModelNumber
            | CharacteristicKind::SerialNumber
            | CharacteristicKind::FirmwareRevision
            | CharacteristicKind::ManufacturerName => decode_text(bytes),
            CharacteristicKind::Other => return None,
        };
        if value.is_none() {
            debug!("Failed to decode {:?} value {:02x?}", self, bytes);
        }
        value
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DescriptorKind {
    UserDescription,
    ClientConfiguration,
    Other,
}

impl DescriptorKind {
    pub fn from_uuid(uuid: Uuid) -> Self {
        match uuid {
            CHARACTERISTIC_USER_DESCRIPTION => DescriptorKind::UserDescription,
            CLIENT_CHARACTERISTIC_CONFIGURATION => DescriptorKind::ClientConfiguration,
            _ => DescriptorKind::Other,
        }
    }

    pub fn decode(&self, bytes: &[u8]) -> Option<Value> {
        match self {
            DescriptorKind::UserDescription => decode_text(bytes),
            DescriptorKind::ClientConfiguration => decode_client_configuration(bytes),
            DescriptorKind::Other => None,
        }
    }
}

fn le_u16(bytes: &[u8], offset: usize) -> Option<u16> {
    let lo = *bytes.get(offset)?;
    let hi = *bytes.get(offset + 1)?;
    Some(u16::from_le_bytes([lo, hi]))
}

fn decode_battery_level(bytes: &[u8]) -> Option<Value> {
    match bytes.first() {
        Some(&level) if level <= 100 => Some(Value::BatteryLevel(level)),
        _ => None,
    }
}

fn decode_service_changed(bytes: &[u8]) -> Option<Value> {
    Some(Value::ServiceChanged {
        start: le_u16(bytes, 0)?,
        end: le_u16(bytes, 2)?,
    })
}

fn decode_date_time(bytes: &[u8]) -> Option<DateTime> {
    if bytes.len() < 7 {
        return None;
    }
    Some(DateTime {
        year: le_u16(bytes, 0)?,
        month: bytes[2],
        day: bytes[3],
        hours: bytes[4],
        minutes: bytes[5],
        seconds: bytes[6],
    })
}

fn decode_current_time(bytes: &[u8]) -> Option<Value> {
    if bytes.len() < 10 {
        return None;
    }
    Some(Value::CurrentTime(CurrentTime {
        date_time: decode_date_time(bytes)?,
        day_of_week: bytes[7],
        fractions256: bytes[8],
        adjust_reason: bytes[9],
    }))
}

fn decode_text(bytes: &[u8]) -> Option<Value> {
    // Some devices include a trailing nul
    let bytes = match bytes.iter().position(|b| *b == 0) {
        Some(end) => &bytes[..end],
        None => bytes,
    };
    std::str::from_utf8(bytes).ok().map(|s| Value::Text(s.to_string()))
}

fn decode_client_configuration(bytes: &[u8]) -> Option<Value> {
    le_u16(bytes, 0).map(|bits| Value::ClientConfiguration(ClientConfiguration::from_bits_truncate(bits)))
}
