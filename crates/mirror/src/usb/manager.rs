//! Device discovery and selection
//!
//! Enumerates attached USB devices, narrows them to known phone vendors
//! (falling back to every device when none match), and lets a caller-supplied
//! chooser pick one. An explicit serial number skips the prompt.

use crate::usb::device::UsbDevice;
use crate::usb::transfers::map_rusb_error;
use crate::usb::transport::{Transport, UsbTransport};
use async_trait::async_trait;
use common::usb_types::DEFAULT_VENDOR_FILTERS;
use common::{DeviceInfo, TransportError};
use rusb::{Context, UsbContext};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Asks the user which device to mirror
#[async_trait]
pub trait DeviceChooser: Send + Sync {
    /// Return the index of the chosen candidate, or `None` to cancel
    async fn choose(&self, candidates: &[DeviceInfo]) -> Option<usize>;
}

/// Chooser that always takes the first candidate
#[derive(Debug, Clone, Copy, Default)]
pub struct FirstDevice;

#[async_trait]
impl DeviceChooser for FirstDevice {
    async fn choose(&self, candidates: &[DeviceInfo]) -> Option<usize> {
        (!candidates.is_empty()).then_some(0)
    }
}

/// How the session picks its device
#[derive(Clone)]
pub struct DeviceSelector {
    pub vendor_filters: Vec<u16>,
    /// Pin the device by serial number instead of prompting
    pub serial: Option<String>,
    pub chooser: Arc<dyn DeviceChooser>,
}

impl DeviceSelector {
    pub fn new(chooser: Arc<dyn DeviceChooser>) -> Self {
        Self {
            vendor_filters: DEFAULT_VENDOR_FILTERS.iter().map(|(id, _)| *id).collect(),
            serial: None,
            chooser,
        }
    }

    pub fn with_serial(mut self, serial: impl Into<String>) -> Self {
        self.serial = Some(serial.into());
        self
    }

    pub fn with_vendor_filters(mut self, vendor_filters: Vec<u16>) -> Self {
        self.vendor_filters = vendor_filters;
        self
    }
}

impl std::fmt::Debug for DeviceSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSelector")
            .field("vendor_filters", &self.vendor_filters)
            .field("serial", &self.serial)
            .finish_non_exhaustive()
    }
}

/// Source of transports for the session controller
#[async_trait]
pub trait DeviceProvider: Send + Sync {
    async fn open_device(
        &self,
        selector: &DeviceSelector,
    ) -> Result<Arc<dyn Transport>, TransportError>;
}

/// Candidate filtering, independent of libusb
pub struct DeviceManager;

impl DeviceManager {
    /// Indices of the devices to offer
    ///
    /// With a serial, only that device qualifies. Otherwise devices from
    /// the vendor filter list, or every device if none of them match.
    pub fn candidates(devices: &[DeviceInfo], selector: &DeviceSelector) -> Vec<usize> {
        if let Some(serial) = &selector.serial {
            return devices
                .iter()
                .enumerate()
                .filter(|(_, d)| d.serial_number.as_deref() == Some(serial.as_str()))
                .map(|(i, _)| i)
                .collect();
        }

        let matching: Vec<usize> = devices
            .iter()
            .enumerate()
            .filter(|(_, d)| Self::check_filter(d.vendor_id, &selector.vendor_filters))
            .map(|(i, _)| i)
            .collect();

        if matching.is_empty() {
            debug!("No device matches the vendor filters, offering all devices");
            (0..devices.len()).collect()
        } else {
            matching
        }
    }

    /// Check if a vendor id is in the filter list
    fn check_filter(vendor_id: u16, filters: &[u16]) -> bool {
        filters.contains(&vendor_id)
    }

    /// Pick a device: pinned serial, single candidate, or the chooser
    pub async fn select(
        devices: &[DeviceInfo],
        selector: &DeviceSelector,
    ) -> Result<usize, TransportError> {
        let candidates = Self::candidates(devices, selector);
        if candidates.is_empty() {
            if let Some(serial) = &selector.serial {
                warn!("No attached device has serial {}", serial);
            }
            return Err(TransportError::NoDeviceSelected);
        }

        if selector.serial.is_some() {
            return Ok(candidates[0]);
        }

        let offered: Vec<DeviceInfo> = candidates.iter().map(|i| devices[*i].clone()).collect();
        let choice = selector
            .chooser
            .choose(&offered)
            .await
            .ok_or(TransportError::NoDeviceSelected)?;

        candidates
            .get(choice)
            .copied()
            .ok_or(TransportError::NoDeviceSelected)
    }
}

/// Production provider backed by libusb
pub struct UsbDeviceProvider {
    poll_timeout: Duration,
}

impl UsbDeviceProvider {
    pub fn new(poll_timeout: Duration) -> Self {
        Self { poll_timeout }
    }

    /// Enumerate attached devices (blocking)
    fn enumerate() -> Result<Vec<(DeviceInfo, UsbDevice)>, TransportError> {
        let context = Context::new().map_err(map_rusb_error)?;
        let devices = context.devices().map_err(map_rusb_error)?;

        let mut found = Vec::new();
        for device in devices.iter() {
            match UsbDevice::new(device) {
                Ok(device) => found.push((device.device_info(), device)),
                Err(e) => debug!("Skipping device without descriptor: {}", e),
            }
        }

        debug!("Enumerated {} devices", found.len());
        Ok(found)
    }
}

#[async_trait]
impl DeviceProvider for UsbDeviceProvider {
    async fn open_device(
        &self,
        selector: &DeviceSelector,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        let mut found = tokio::task::spawn_blocking(Self::enumerate)
            .await
            .map_err(|e| TransportError::Io(format!("Device enumeration panicked: {}", e)))??;

        let infos: Vec<DeviceInfo> = found.iter().map(|(info, _)| info.clone()).collect();
        let index = DeviceManager::select(&infos, selector).await?;
        let (info, device) = found.swap_remove(index);
        drop(found);
        info!("Selected {}", info);

        let poll_timeout = self.poll_timeout;
        let transport = tokio::task::spawn_blocking(move || UsbTransport::open(device, poll_timeout))
            .await
            .map_err(|e| TransportError::Io(format!("Device open panicked: {}", e)))??;

        Ok(Arc::new(transport))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(vendor_id: u16, serial: &str) -> DeviceInfo {
        DeviceInfo {
            vendor_id,
            product_id: 0x4ee7,
            bus_number: 1,
            device_address: 2,
            manufacturer: None,
            product: None,
            serial_number: Some(serial.to_string()),
        }
    }

    struct Pick(Option<usize>);

    #[async_trait]
    impl DeviceChooser for Pick {
        async fn choose(&self, _candidates: &[DeviceInfo]) -> Option<usize> {
            self.0
        }
    }

    #[test]
    fn test_vendor_filter_narrows_candidates() {
        let devices = vec![device(0x046d, "mouse"), device(0x18d1, "pixel")];
        let selector = DeviceSelector::new(Arc::new(FirstDevice));
        assert_eq!(DeviceManager::candidates(&devices, &selector), vec![1]);
    }

    #[test]
    fn test_falls_back_to_all_devices() {
        let devices = vec![device(0x046d, "mouse"), device(0x1234, "other")];
        let selector = DeviceSelector::new(Arc::new(FirstDevice));
        assert_eq!(DeviceManager::candidates(&devices, &selector), vec![0, 1]);
    }

    #[tokio::test]
    async fn test_serial_pins_choice() {
        let devices = vec![device(0x18d1, "a"), device(0x18d1, "b")];
        let selector = DeviceSelector::new(Arc::new(Pick(None))).with_serial("b");
        assert_eq!(DeviceManager::select(&devices, &selector).await, Ok(1));

        let selector = DeviceSelector::new(Arc::new(FirstDevice)).with_serial("zzz");
        assert_eq!(
            DeviceManager::select(&devices, &selector).await,
            Err(TransportError::NoDeviceSelected)
        );
    }

    #[tokio::test]
    async fn test_chooser_decides() {
        let devices = vec![device(0x18d1, "a"), device(0x046d, "mouse"), device(0x04e8, "b")];

        let selector = DeviceSelector::new(Arc::new(Pick(Some(1))));
        assert_eq!(DeviceManager::select(&devices, &selector).await, Ok(2));

        let selector = DeviceSelector::new(Arc::new(Pick(None)));
        assert_eq!(
            DeviceManager::select(&devices, &selector).await,
            Err(TransportError::NoDeviceSelected)
        );

        let selector = DeviceSelector::new(Arc::new(Pick(Some(7))));
        assert_eq!(
            DeviceManager::select(&devices, &selector).await,
            Err(TransportError::NoDeviceSelected)
        );
    }

    #[tokio::test]
    async fn test_no_devices() {
        let selector = DeviceSelector::new(Arc::new(FirstDevice));
        assert_eq!(
            DeviceManager::select(&[], &selector).await,
            Err(TransportError::NoDeviceSelected)
        );
    }
}
