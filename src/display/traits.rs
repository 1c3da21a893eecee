/*
 *  display/traits.rs
 *
 *  usbd480fb - USB raster display driver
 *  (c) 2020-26 Stuart Hunter
 *
 *  Seams to the external collaborators: USB transport, pixel-buffer host,
 *  attribute host and diagnostics
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

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use log::warn;

use crate::display::error::{AttributeError, RegistrationError, TransportError};
use crate::display::memory::WeakFrame;

/// Data stage direction of a control transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Device to host
    In,
    /// Host to device
    Out,
}

/// Setup packet of a vendor request addressed to the display interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlSetup {
    pub request: u8,
    pub direction: Direction,
    pub value: u16,
    pub index: u16,
}

/// Minimal USB transport - everything the driver needs from the host stack
///
/// Device enumeration and hotplug live outside this trait; an implementation
/// is handed to the session once the vendor/product match has happened.
/// All calls block until the transfer completes or `timeout` elapses.
pub trait UsbTransport: Send + Sync {
    /// Vendor request with a device-to-host data stage. Returns bytes read.
    fn control_in(
        &self,
        setup: ControlSetup,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransportError>;

    /// Vendor request with an optional host-to-device data stage.
    fn control_out(
        &self,
        setup: ControlSetup,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransportError>;

    /// Bulk OUT transfer. Returns the number of bytes the device accepted.
    fn bulk_out(&self, endpoint: u8, data: &[u8], timeout: Duration)
        -> Result<usize, TransportError>;
}

/// One color channel inside a packed pixel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bitfield {
    pub offset: u8,
    pub length: u8,
}

/// Packed pixel layout of an exposed frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelFormat {
    pub bits_per_pixel: u8,
    pub red: Bitfield,
    pub green: Bitfield,
    pub blue: Bitfield,
}

impl PixelFormat {
    /// 16-bit 5/6/5 true color, no alpha
    pub const RGB565: PixelFormat = PixelFormat {
        bits_per_pixel: 16,
        red: Bitfield { offset: 11, length: 5 },
        green: Bitfield { offset: 5, length: 6 },
        blue: Bitfield { offset: 0, length: 5 },
    };

    pub fn bytes_per_pixel(&self) -> usize {
        (self.bits_per_pixel as usize).div_ceil(8)
    }
}

/// Fixed geometry of a frame handed to the pixel-buffer host
///
/// Virtual resolution equals the visible one (no panning) and no
/// acceleration capabilities are advertised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelBufferInfo {
    /// Device identifier the buffer belongs to
    pub device: String,
    pub width: u32,
    pub height: u32,
    /// Bytes per row
    pub line_length: usize,
    /// Meaningful bytes in the region (`line_length * height`)
    pub size: usize,
    pub format: PixelFormat,
}

impl PixelBufferInfo {
    pub fn rgb565(device: &str, width: u32, height: u32) -> Self {
        let format = PixelFormat::RGB565;
        let line_length = width as usize * format.bytes_per_pixel();
        Self {
            device: device.to_string(),
            width,
            height,
            line_length,
            size: line_length * height as usize,
            format,
        }
    }
}

/// Token returned by a successful pixel-buffer registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u32);

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fb{}", self.0)
    }
}

/// The application-facing pixel-buffer abstraction
///
/// The session owns the frame memory; the host gets a [`WeakFrame`] and
/// upgrades it per access. After `unregister` the memory may be gone.
pub trait PixelBufferHost: Send + Sync {
    fn register(
        &self,
        info: PixelBufferInfo,
        frame: WeakFrame,
    ) -> Result<BufferId, RegistrationError>;

    fn unregister(&self, id: BufferId);
}

/// A single text attribute of a device
pub trait Attribute: Send + Sync {
    /// Current value as text
    fn show(&self) -> String;

    /// Parse and apply a new value
    fn store(&self, input: &str) -> Result<(), AttributeError>;

    fn writable(&self) -> bool {
        false
    }
}

/// Per-device key/value attribute registry
pub trait AttributeHost: Send + Sync {
    fn expose(
        &self,
        device: &str,
        name: &'static str,
        attribute: Arc<dyn Attribute>,
    ) -> Result<(), AttributeError>;

    fn remove(&self, device: &str, name: &'static str);
}

/// Which transport operation a fault came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    GetDeviceDetails,
    SetBrightness,
    SetWriteAddress,
    SetShowAddress,
    BulkUpload,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::GetDeviceDetails => "get-device-details",
            Operation::SetBrightness => "set-brightness",
            Operation::SetWriteAddress => "set-write-address",
            Operation::SetShowAddress => "set-show-address",
            Operation::BulkUpload => "bulk-upload",
        };
        f.write_str(name)
    }
}

/// A transport failure that was absorbed instead of propagated
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportFault {
    pub device: String,
    pub operation: Operation,
    pub error: TransportError,
}

/// Receives every non-fatal transport failure of a session
pub trait DiagnosticSink: Send + Sync {
    fn transport_fault(&self, fault: &TransportFault);
}

/// Default sink: log and carry on
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl DiagnosticSink for LogSink {
    fn transport_fault(&self, fault: &TransportFault) {
        warn!("{}: {} failed: {}", fault.device, fault.operation, fault.error);
    }
}
