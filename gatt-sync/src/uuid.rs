use std::fmt;

use uuid::Uuid;

const BLUETOOTH_BASE_UUID: u128 = 0x00000000_0000_1000_8000_00805f9b34fb;
const BLUETOOTH_BASE_MASK_32: u128 = 0x00000000_ffff_ffff_ffff_ffffffffffff;
const BLUETOOTH_BASE_MASK_16: u128 = 0xffff0000_ffff_ffff_ffff_ffffffffffff;

pub trait BluetoothUuid {
    fn as_u16(&self) -> Option<u16>;
    fn as_u32(&self) -> Option<u32>;
    fn from_u16(v: u16) -> Uuid;
    fn from_u32(v: u32) -> Uuid;

    /// Formats SIG-assigned ids in their short `0x180F` form and anything
    /// else as a full hyphenated Uuid. Mainly for logging.
    fn short(&self) -> ShortUuid;
}

impl BluetoothUuid for Uuid {
    fn as_u16(&self) -> Option<u16> {
        let value = self.as_u128();
        if value & BLUETOOTH_BASE_MASK_16 == BLUETOOTH_BASE_UUID {
            Some((value >> 96) as u16)
        } else {
            None
        }
    }

    fn as_u32(&self) -> Option<u32> {
        let value = self.as_u128();
        if value & BLUETOOTH_BASE_MASK_32 == BLUETOOTH_BASE_UUID {
            Some((value >> 96) as u32)
        } else {
            None
        }
    }

    fn from_u16(v: u16) -> Uuid {
        uuid_from_u16(v)
    }

    fn from_u32(v: u32) -> Uuid {
        uuid_from_u32(v)
    }

    fn short(&self) -> ShortUuid {
        ShortUuid(*self)
    }
}

pub struct ShortUuid(Uuid);

impl fmt::Display for ShortUuid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.0.as_u16() {
            Some(short) => write!(f, "0x{:04X}", short),
            None => write!(f, "{}", self.0),
        }
    }
}

// It's useful to have const functions so apps can declare const Uuids but
// unfortunately we can't have const functions in traits yet

pub const fn uuid_from_u16(v: u16) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((v as u128) << 96))
}
pub const fn uuid_from_u32(v: u32) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((v as u128) << 96))
}

// Services
pub const GENERIC_ACCESS_SERVICE: Uuid = uuid_from_u16(0x1800);
pub const GENERIC_ATTRIBUTE_SERVICE: Uuid = uuid_from_u16(0x1801);
pub const CURRENT_TIME_SERVICE: Uuid = uuid_from_u16(0x1805);
pub const DEVICE_INFORMATION_SERVICE: Uuid = uuid_from_u16(0x180A);
pub const HEART_RATE_SERVICE: Uuid = uuid_from_u16(0x180D);
pub const BATTERY_SERVICE: Uuid = uuid_from_u16(0x180F);

// Characteristics
pub const DEVICE_NAME: Uuid = uuid_from_u16(0x2A00);
pub const SERVICE_CHANGED: Uuid = uuid_from_u16(0x2A05);
pub const DATE_TIME: Uuid = uuid_from_u16(0x2A08);
pub const BATTERY_LEVEL: Uuid = uuid_from_u16(0x2A19);
pub const MODEL_NUMBER: Uuid = uuid_from_u16(0x2A24);
pub const SERIAL_NUMBER: Uuid = uuid_from_u16(0x2A25);
pub const FIRMWARE_REVISION: Uuid = uuid_from_u16(0x2A26);
pub const MANUFACTURER_NAME: Uuid = uuid_from_u16(0x2A29);
pub const CURRENT_TIME: Uuid = uuid_from_u16(0x2A2B);

// Descriptors
pub const CHARACTERISTIC_USER_DESCRIPTION: Uuid = uuid_from_u16(0x2901);
pub const CLIENT_CHARACTERISTIC_CONFIGURATION: Uuid = uuid_from_u16(0x2902);

#[test]
fn short_uuid_two_way() {
    let uuid = uuid_from_u16(0x180F);
    assert_eq!(uuid.as_u16(), Some(0x180F));
    assert_eq!(uuid.as_u32(), Some(0x180F));
    assert_eq!(uuid.short().to_string(), "0x180F");
    assert_eq!(
        uuid.to_string(),
        "0000180f-0000-1000-8000-00805f9b34fb"
    );

    let custom = Uuid::from_u128(0x18c2a267_a539_4423_aecc_edeeb2784bcc);
    assert_eq!(custom.as_u16(), None);
    assert_eq!(custom.short().to_string(), "18c2a267-a539-4423-aecc-edeeb2784bcc");
}
