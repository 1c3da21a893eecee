/*
 *  display/drivers/usb.rs
 *
 *  usbd480fb - USB raster display driver
 *  (c) 2020-26 Stuart Hunter
 *
 *  USB transport backed by nusb
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU General Public License for more details.
 *
 *  See <http://www.gnu.org/licenses/> to get a copy of the GNU General
 *  Public License.
 *
 */

use std::time::Duration;

use log::{debug, info};
use nusb::transfer::{Control, ControlType, Recipient, TransferError};

use crate::display::error::TransportError;
use crate::display::traits::{ControlSetup, UsbTransport};

/// bInterfaceClass of the vendor specific display interface
const VENDOR_CLASS: u8 = 0xFF;

/// A USB device seen during a bus scan
#[derive(Debug, Clone)]
pub struct UsbCandidate {
    pub info: nusb::DeviceInfo,
    pub vendor: u16,
    pub product: u16,
    /// Stable identifier derived from the bus position
    pub id: String,
}

/// Every device on the bus whose vendor/product pair satisfies `wanted`
pub fn scan(wanted: impl Fn(u16, u16) -> bool) -> Result<Vec<UsbCandidate>, TransportError> {
    let devices = nusb::list_devices()
        .map_err(|e| TransportError::Failed(format!("USB enumeration: {e}")))?;

    Ok(devices
        .filter(|dev| wanted(dev.vendor_id(), dev.product_id()))
        .map(|dev| UsbCandidate {
            id: format!("usb-{:03}-{:03}", dev.bus_number(), dev.device_address()),
            vendor: dev.vendor_id(),
            product: dev.product_id(),
            info: dev,
        })
        .collect())
}

fn map_error(error: TransferError, timeout: Duration) -> TransportError {
    match error {
        TransferError::Cancelled => TransportError::Timeout(timeout),
        TransferError::Stall => TransportError::Stall,
        TransferError::Disconnected => TransportError::Disconnected,
        other => TransportError::Failed(other.to_string()),
    }
}

/// Claimed display interface of one USBD480
pub struct NusbTransport {
    interface: nusb::Interface,
    interface_number: u8,
}

impl NusbTransport {
    /// Open the device and claim its vendor specific interface
    pub fn open(info: &nusb::DeviceInfo) -> Result<Self, TransportError> {
        let interface_number = info
            .interfaces()
            .find(|iface| iface.class() == VENDOR_CLASS)
            .map(|iface| iface.interface_number())
            .unwrap_or(0);

        let device = info
            .open()
            .map_err(|e| TransportError::Failed(format!("USB open: {e}")))?;

        // nusb detaches a bound kernel driver when claiming
        let interface = device.claim_interface(interface_number).map_err(|e| {
            TransportError::Failed(format!("claim interface {interface_number}: {e}"))
        })?;

        info!(
            "opened {:04x}:{:04x} at bus {} address {}, interface {}",
            info.vendor_id(),
            info.product_id(),
            info.bus_number(),
            info.device_address(),
            interface_number
        );

        Ok(Self {
            interface,
            interface_number,
        })
    }

    fn control(&self, setup: ControlSetup) -> Control {
        Control {
            control_type: ControlType::Vendor,
            recipient: Recipient::Interface,
            request: setup.request,
            value: setup.value,
            index: setup.index,
        }
    }
}

impl UsbTransport for NusbTransport {
    fn control_in(
        &self,
        setup: ControlSetup,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        self.interface
            .control_in_blocking(self.control(setup), buf, timeout)
            .map_err(|e| map_error(e, timeout))
    }

    fn control_out(
        &self,
        setup: ControlSetup,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        self.interface
            .control_out_blocking(self.control(setup), data, timeout)
            .map_err(|e| map_error(e, timeout))
    }

    fn bulk_out(&self, endpoint: u8, data: &[u8], timeout: Duration) -> Result<usize, TransportError> {
        // only ever called from blocking worker threads of the runtime
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| TransportError::Failed(format!("bulk transfer outside runtime: {e}")))?;

        let transfer = self.interface.bulk_out(endpoint, data.to_vec());
        let completion = runtime
            .block_on(tokio::time::timeout(timeout, transfer))
            .map_err(|_| TransportError::Timeout(timeout))?;

        let sent = completion
            .into_result()
            .map_err(|e| map_error(e, timeout))?
            .actual_length();
        debug!(
            "bulk ep {:#04x} on interface {}: {} of {} bytes",
            endpoint,
            self.interface_number,
            sent,
            data.len()
        );
        Ok(sent)
    }
}
