//! Device type metadata: display name and physical LED count per `deviceType`.

use crate::color::LedTopology;
use std::collections::HashMap;

pub const GENERIC_DEVICE_NAME: &str = "Tuya device";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceTypeInfo {
    pub name: String,
    /// Number of physical LEDs (segments) the device exposes.
    pub leds: usize,
}

impl DeviceTypeInfo {
    pub fn new(name: impl Into<String>, leds: usize) -> Self {
        Self {
            name: name.into(),
            leds,
        }
    }
}

pub trait DeviceCatalog: Send + Sync {
    fn lookup(&self, device_type: u32) -> Option<DeviceTypeInfo>;

    /// Topology for `device_type`, a single LED when the type is unknown.
    fn topology_for(&self, device_type: u32) -> LedTopology {
        LedTopology::new(self.lookup(device_type).map_or(1, |info| info.leds))
    }

    /// `"<type name> - <id>"` for known non-generic types, `"Tuya device <id>"` otherwise.
    fn display_name(&self, device_type: u32, id: &str) -> String {
        match self.lookup(device_type) {
            Some(info) if device_type != 0 => format!("{} - {}", info.name, id),
            _ => format!("{} {}", GENERIC_DEVICE_NAME, id),
        }
    }
}

/// In-memory catalog. Type `0` is always the generic single-LED device.
#[derive(Debug, Clone)]
pub struct StaticCatalog {
    types: HashMap<u32, DeviceTypeInfo>,
}

impl Default for StaticCatalog {
    fn default() -> Self {
        let mut types = HashMap::new();
        types.insert(0, DeviceTypeInfo::new(GENERIC_DEVICE_NAME, 1));
        Self { types }
    }
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_type(mut self, device_type: u32, name: impl Into<String>, leds: usize) -> Self {
        self.types
            .insert(device_type, DeviceTypeInfo::new(name, leds));
        self
    }
}

impl DeviceCatalog for StaticCatalog {
    fn lookup(&self, device_type: u32) -> Option<DeviceTypeInfo> {
        self.types.get(&device_type).cloned()
    }
}
