/*
 *  display/control.rs
 *
 *  usbd480fb - USB raster display driver
 *  (c) 2020-26 Stuart Hunter
 *
 *  Vendor control requests and the serialized device link
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

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::debug;

use crate::display::error::TransportError;
use crate::display::traits::{ControlSetup, Direction, UsbTransport};

pub const GET_DEVICE_DETAILS: u8 = 0x80;
pub const SET_BRIGHTNESS: u8 = 0x81;
pub const SET_ADDRESS: u8 = 0xC0;
pub const SET_FRAME_START_ADDRESS: u8 = 0xC4;

/// Size of the GET_DEVICE_DETAILS response
pub const DETAILS_LEN: usize = 64;
/// The device name occupies the head of the details block, not NUL terminated
pub const NAME_LEN: usize = 20;
const WIDTH_OFFSET: usize = 20;
const HEIGHT_OFFSET: usize = 22;

pub const DEFAULT_CONTROL_TIMEOUT: Duration = Duration::from_millis(1000);

/// What the device reports about itself. Immutable after discovery.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeviceDescriptor {
    pub name: String,
    pub width: u32,
    pub height: u32,
}

impl DeviceDescriptor {
    /// Decode a GET_DEVICE_DETAILS response block
    pub fn parse(block: &[u8]) -> Result<Self, TransportError> {
        if block.len() < HEIGHT_OFFSET + 2 {
            return Err(TransportError::ShortResponse {
                expected: HEIGHT_OFFSET + 2,
                actual: block.len(),
            });
        }

        let width = u16::from_le_bytes([block[WIDTH_OFFSET], block[WIDTH_OFFSET + 1]]);
        let height = u16::from_le_bytes([block[HEIGHT_OFFSET], block[HEIGHT_OFFSET + 1]]);

        let raw = &block[..NAME_LEN];
        let end = raw.iter().position(|&b| b == 0).unwrap_or(NAME_LEN);
        let name = String::from_utf8_lossy(&raw[..end]).into_owned();

        Ok(Self {
            name,
            width: width as u32,
            height: height as u32,
        })
    }

    /// Bytes needed for one RGB565 frame, `None` when it would not fit `usize`
    pub fn frame_len(&self) -> Option<usize> {
        (self.width as usize)
            .checked_mul(self.height as usize)?
            .checked_mul(2)
    }

    pub fn has_geometry(&self) -> bool {
        self.width > 0 && self.height > 0
    }
}

/// Serialized access to one device
///
/// Every control and bulk transfer of a session goes through here and holds
/// the link lock for its whole duration, so no two transfers of the same
/// device are ever in flight together, whoever issues them.
pub struct ControlChannel {
    transport: Arc<dyn UsbTransport>,
    link: Mutex<()>,
    timeout: Duration,
}

impl ControlChannel {
    pub fn new(transport: Arc<dyn UsbTransport>, timeout: Duration) -> Self {
        Self {
            transport,
            link: Mutex::new(()),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    // the guarded unit carries no data, a poisoned lock is still usable
    fn lock(&self) -> MutexGuard<'_, ()> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Query name and geometry
    pub fn get_device_details(&self) -> Result<DeviceDescriptor, TransportError> {
        let mut block = [0u8; DETAILS_LEN];
        let setup = ControlSetup {
            request: GET_DEVICE_DETAILS,
            direction: Direction::In,
            value: 0,
            index: 0,
        };

        let read = {
            let _link = self.lock();
            self.transport.control_in(setup, &mut block, self.timeout)?
        };
        debug!("device details: {} bytes", read);

        DeviceDescriptor::parse(&block[..read.min(DETAILS_LEN)])
    }

    pub fn set_brightness(&self, level: u8) -> Result<(), TransportError> {
        self.command(SET_BRIGHTNESS, level as u16, 0)
    }

    /// Device memory offset the next bulk upload lands at
    pub fn set_write_address(&self, offset: u32) -> Result<(), TransportError> {
        self.command(SET_ADDRESS, (offset & 0xFFFF) as u16, (offset >> 16) as u16)
    }

    /// Device memory offset the panel scans out from
    pub fn set_show_address(&self, offset: u32) -> Result<(), TransportError> {
        self.command(
            SET_FRAME_START_ADDRESS,
            (offset & 0xFFFF) as u16,
            (offset >> 16) as u16,
        )
    }

    /// Push a frame to the bulk endpoint. Returns bytes accepted.
    pub fn upload(
        &self,
        endpoint: u8,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        let _link = self.lock();
        self.transport.bulk_out(endpoint, data, timeout)
    }

    fn command(&self, request: u8, value: u16, index: u16) -> Result<(), TransportError> {
        let setup = ControlSetup {
            request,
            direction: Direction::Out,
            value,
            index,
        };
        let _link = self.lock();
        self.transport.control_out(setup, &[], self.timeout)?;
        Ok(())
    }
}
