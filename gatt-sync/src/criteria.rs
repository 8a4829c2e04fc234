use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Whether repeated advertisements from a peripheral that has already been
/// discovered (but isn't connected) are reported again
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DuplicatePolicy {
    /// Re-send `PeripheralDiscovered` for every accepted sighting, e.g. so a
    /// UI can refresh the signal strength
    Report,
    Suppress,
}

impl Default for DuplicatePolicy {
    fn default() -> Self {
        DuplicatePolicy::Suppress
    }
}

/// The parts of an advertisement that scan filtering looks at
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Advertisement<'a> {
    pub id: Uuid,
    pub name: Option<&'a str>,
    pub services: &'a [Uuid],
    pub rssi: i16,
}

/// An immutable filter deciding which advertisements surface peripherals
///
/// Built with the `with_*` methods, e.g.
///
/// ```
/// use gatt_sync::ScanCriteria;
/// use gatt_sync::uuid::BATTERY_SERVICE;
///
/// let criteria = ScanCriteria::new()
///     .with_service(BATTERY_SERVICE)
///     .with_min_rssi(-80);
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanCriteria {
    #[serde(default)]
    services: HashSet<Uuid>,
    #[serde(default)]
    name_contains: Option<String>,
    #[serde(default)]
    min_rssi: Option<i16>,
    #[serde(default)]
    duplicates: DuplicatePolicy,
}

impl ScanCriteria {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_service(mut self, uuid: Uuid) -> Self {
        self.services.insert(uuid);
        self
    }

    pub fn with_services(mut self, uuids: impl IntoIterator<Item = Uuid>) -> Self {
        self.services.extend(uuids);
        self
    }

    /// Only accept peripherals whose name contains `needle` (ignoring case)
    pub fn with_name_containing(mut self, needle: &str) -> Self {
        self.name_contains = Some(needle.to_lowercase());
        self
    }

    pub fn with_min_rssi(mut self, rssi: i16) -> Self {
        self.min_rssi = Some(rssi);
        self
    }

    pub fn with_duplicates(mut self, policy: DuplicatePolicy) -> Self {
        self.duplicates = policy;
        self
    }

    pub fn services(&self) -> &HashSet<Uuid> {
        &self.services
    }

    pub fn duplicates(&self) -> DuplicatePolicy {
        self.duplicates
    }

    pub fn accept(&self, advertisement: &Advertisement<'_>) -> bool {
        if let Some(floor) = self.min_rssi {
            if advertisement.rssi < floor {
                return false;
            }
        }

        if !self.services.is_empty()
            && !advertisement
                .services
                .iter()
                .any(|uuid| self.services.contains(uuid))
        {
            return false;
        }

        match &self.name_contains {
            // A nameless advertisement can never match a name filter
            Some(needle) => advertisement
                .name
                .map(|name| name.to_lowercase().contains(needle.as_str()))
                .unwrap_or(false),
            None => true,
        }
    }
}
