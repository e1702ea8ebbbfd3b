//! USB device abstraction
//!
//! Wraps `rusb::Device` with its cached descriptor and locates the device
//! bridge interface (vendor class, subclass 0x42, protocol 0x01) together
//! with its bulk endpoint pair.

use crate::usb::transfers::map_rusb_error;
use common::usb_types::{BRIDGE_CLASS, BRIDGE_PROTOCOL, BRIDGE_SUBCLASS};
use common::{DeviceInfo, TransportError};
use rusb::{Context, Device, DeviceDescriptor, DeviceHandle, Direction, TransferType};
use tracing::{debug, warn};

/// Location of the bridge interface within the active configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeInterface {
    pub number: u8,
    pub alt_setting: u8,
    pub endpoint_in: u8,
    pub endpoint_out: u8,
    /// Max packet size of the OUT endpoint, used for zero-length packets
    pub max_packet_size: u16,
}

/// USB device wrapper with cached information
pub struct UsbDevice {
    device: Device<Context>,
    descriptor: DeviceDescriptor,
    handle: Option<DeviceHandle<Context>>,
    claimed: Option<BridgeInterface>,
    detached_kernel_driver: bool,
}

impl UsbDevice {
    /// Create a new USB device wrapper
    ///
    /// Reads and caches the device descriptor.
    pub fn new(device: Device<Context>) -> Result<Self, rusb::Error> {
        let descriptor = device.device_descriptor()?;

        Ok(Self {
            device,
            descriptor,
            handle: None,
            claimed: None,
            detached_kernel_driver: false,
        })
    }

    pub fn vendor_id(&self) -> u16 {
        self.descriptor.vendor_id()
    }

    /// Describe the device for selection
    ///
    /// String descriptors are read when the device can be opened; devices
    /// without permission still get listed with ids only.
    pub fn device_info(&self) -> DeviceInfo {
        let (manufacturer, product, serial_number) = match &self.handle {
            Some(handle) => self.read_string_descriptors(handle),
            None => self
                .device
                .open()
                .map(|handle| self.read_string_descriptors(&handle))
                .unwrap_or((None, None, None)),
        };

        DeviceInfo {
            vendor_id: self.descriptor.vendor_id(),
            product_id: self.descriptor.product_id(),
            bus_number: self.device.bus_number(),
            device_address: self.device.address(),
            manufacturer,
            product,
            serial_number,
        }
    }

    /// Find the bridge interface in the active configuration
    pub fn find_bridge_interface(&self) -> Option<BridgeInterface> {
        let config = self.device.active_config_descriptor().ok()?;

        for interface in config.interfaces() {
            for alt in interface.descriptors() {
                if alt.class_code() != BRIDGE_CLASS
                    || alt.sub_class_code() != BRIDGE_SUBCLASS
                    || alt.protocol_code() != BRIDGE_PROTOCOL
                {
                    continue;
                }

                let mut endpoint_in = None;
                let mut endpoint_out = None;
                for endpoint in alt.endpoint_descriptors() {
                    if endpoint.transfer_type() != TransferType::Bulk {
                        continue;
                    }
                    match endpoint.direction() {
                        Direction::In => endpoint_in = Some(endpoint.address()),
                        Direction::Out => {
                            endpoint_out =
                                Some((endpoint.address(), endpoint.max_packet_size()))
                        }
                    }
                }

                if let (Some(endpoint_in), Some((endpoint_out, max_packet_size))) =
                    (endpoint_in, endpoint_out)
                {
                    return Some(BridgeInterface {
                        number: alt.interface_number(),
                        alt_setting: alt.setting_number(),
                        endpoint_in,
                        endpoint_out,
                        max_packet_size,
                    });
                }
            }
        }

        None
    }

    /// Open the device and claim its bridge interface
    ///
    /// Detaches a kernel driver bound to the interface first.
    pub fn open(&mut self) -> Result<BridgeInterface, TransportError> {
        if let Some(interface) = self.claimed {
            return Ok(interface);
        }

        let interface = self.find_bridge_interface().ok_or_else(|| {
            TransportError::Io("device has no debugging bridge interface enabled".to_string())
        })?;

        let handle = self.device.open().map_err(|e| {
            warn!("Failed to open device: {}", e);
            map_rusb_error(e)
        })?;

        match handle.kernel_driver_active(interface.number) {
            Ok(true) => {
                debug!(
                    "Detaching kernel driver from interface {}",
                    interface.number
                );
                match handle.detach_kernel_driver(interface.number) {
                    Ok(()) => self.detached_kernel_driver = true,
                    Err(e) => warn!(
                        "Failed to detach kernel driver from interface {}: {}",
                        interface.number, e
                    ),
                }
            }
            Ok(false) => {}
            Err(e) => {
                debug!(
                    "Could not check kernel driver status for interface {}: {}",
                    interface.number, e
                );
            }
        }

        handle.claim_interface(interface.number).map_err(|e| {
            warn!("Failed to claim interface {}: {}", interface.number, e);
            map_rusb_error(e)
        })?;

        if interface.alt_setting != 0
            && let Err(e) =
                handle.set_alternate_setting(interface.number, interface.alt_setting)
        {
            warn!("Failed to select alternate setting: {}", e);
        }

        debug!("Claimed interface {}", interface.number);
        self.handle = Some(handle);
        self.claimed = Some(interface);
        Ok(interface)
    }

    /// Release the interface and close the handle
    ///
    /// Idempotent. Failures are logged; the handle is dropped regardless.
    pub fn close(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Some(interface) = self.claimed.take() {
                if let Err(e) = handle.release_interface(interface.number) {
                    warn!("Failed to release interface {}: {}", interface.number, e);
                }

                if self.detached_kernel_driver {
                    if let Err(e) = handle.attach_kernel_driver(interface.number) {
                        debug!(
                            "Could not reattach kernel driver to interface {}: {}",
                            interface.number, e
                        );
                    }
                    self.detached_kernel_driver = false;
                }
            }

            debug!("Closed device");
        }
    }

    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    /// Device handle, if open
    pub fn handle(&self) -> Option<&DeviceHandle<Context>> {
        self.handle.as_ref()
    }

    fn read_string_descriptors(
        &self,
        handle: &DeviceHandle<Context>,
    ) -> (Option<String>, Option<String>, Option<String>) {
        let manufacturer = self
            .descriptor
            .manufacturer_string_index()
            .and_then(|idx| handle.read_string_descriptor_ascii(idx).ok());

        let product = self
            .descriptor
            .product_string_index()
            .and_then(|idx| handle.read_string_descriptor_ascii(idx).ok());

        let serial_number = self
            .descriptor
            .serial_number_string_index()
            .and_then(|idx| handle.read_string_descriptor_ascii(idx).ok());

        (manufacturer, product, serial_number)
    }
}

impl Drop for UsbDevice {
    fn drop(&mut self) {
        self.close();
    }
}
