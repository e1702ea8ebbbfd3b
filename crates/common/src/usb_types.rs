//! USB device descriptions shared by device discovery and the front end

use serde::{Deserialize, Serialize};
use std::fmt;

/// Interface class of the device bridge (vendor specific)
pub const BRIDGE_CLASS: u8 = 0xff;
/// Interface subclass of the device bridge
pub const BRIDGE_SUBCLASS: u8 = 0x42;
/// Interface protocol of the device bridge
pub const BRIDGE_PROTOCOL: u8 = 0x01;

/// Vendors whose devices are offered first during device selection
pub const DEFAULT_VENDOR_FILTERS: &[(u16, &str)] = &[
    (0x18d1, "Google"),
    (0x04e8, "Samsung"),
    (0x12d1, "Huawei"),
    (0x2717, "Xiaomi"),
    (0x2a70, "OnePlus"),
    (0x22d9, "OPPO"),
    (0x2d95, "vivo"),
];

/// Human-readable vendor name for a known vendor id
pub fn vendor_name(vendor_id: u16) -> Option<&'static str> {
    DEFAULT_VENDOR_FILTERS
        .iter()
        .find(|(id, _)| *id == vendor_id)
        .map(|(_, name)| *name)
}

/// Parse a `0xVVVV` vendor id string
pub fn parse_hex_id(value: &str) -> Option<u16> {
    let hex = value.strip_prefix("0x").or_else(|| value.strip_prefix("0X"))?;
    if hex.is_empty() || hex.len() > 4 {
        return None;
    }
    u16::from_str_radix(hex, 16).ok()
}

/// A USB device as presented to the device chooser
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub vendor_id: u16,
    pub product_id: u16,
    pub bus_number: u8,
    pub device_address: u8,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
}

impl DeviceInfo {
    /// Best available name: product string, then vendor name, then ids
    pub fn display_name(&self) -> String {
        match (&self.manufacturer, &self.product) {
            (Some(m), Some(p)) => format!("{} {}", m, p),
            (None, Some(p)) => p.clone(),
            _ => match vendor_name(self.vendor_id) {
                Some(vendor) => format!("{} device {:04x}", vendor, self.product_id),
                None => format!("{:04x}:{:04x}", self.vendor_id, self.product_id),
            },
        }
    }
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{:04x}:{:04x}] bus {} addr {}",
            self.display_name(),
            self.vendor_id,
            self.product_id,
            self.bus_number,
            self.device_address
        )?;
        if let Some(serial) = &self.serial_number {
            write!(f, " serial {}", serial)?;
        }
        Ok(())
    }
}
