/*
 *  display/attributes.rs
 *
 *  usbd480fb - USB raster display driver
 *  (c) 2020-26 Stuart Hunter
 *
 *  Device attributes: brightness, width, height, name
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

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use log::debug;

use crate::display::control::{ControlChannel, DeviceDescriptor};
use crate::display::error::AttributeError;
use crate::display::traits::{Attribute, AttributeHost, DiagnosticSink, Operation, TransportFault};

/// Session fields shared with the attribute host
pub struct DeviceState {
    id: String,
    descriptor: DeviceDescriptor,
    brightness: AtomicU8,
    channel: Arc<ControlChannel>,
    sink: Arc<dyn DiagnosticSink>,
}

impl DeviceState {
    pub fn new(
        id: &str,
        descriptor: DeviceDescriptor,
        channel: Arc<ControlChannel>,
        sink: Arc<dyn DiagnosticSink>,
    ) -> Self {
        Self {
            id: id.to_string(),
            descriptor,
            brightness: AtomicU8::new(0),
            channel,
            sink,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    /// Last brightness written, whether or not the device took it
    pub fn brightness(&self) -> u8 {
        self.brightness.load(Ordering::Relaxed)
    }

    /// Cache `level` and send it to the device; a transport failure is
    /// reported and otherwise ignored
    pub fn set_brightness(&self, level: u8) {
        self.brightness.store(level, Ordering::Relaxed);
        match self.channel.set_brightness(level) {
            Ok(()) => debug!("{}: brightness {}", self.id, level),
            Err(error) => self.sink.transport_fault(&TransportFault {
                device: self.id.clone(),
                operation: Operation::SetBrightness,
                error,
            }),
        }
    }
}

/// Parse brightness text: a decimal unsigned integer, values above 255
/// saturate
pub fn parse_brightness(input: &str) -> Result<u8, AttributeError> {
    let text = input.trim();
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return Err(AttributeError::InvalidValue {
            name: AttributeKind::Brightness.name(),
            input: input.to_string(),
        });
    }
    // all digits: the only way to fail is overflow
    let value = text.parse::<u64>().unwrap_or(u64::MAX);
    Ok(value.min(u8::MAX as u64) as u8)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeKind {
    Brightness,
    Width,
    Height,
    Name,
}

impl AttributeKind {
    /// Export order; removal runs in reverse
    pub const ALL: [AttributeKind; 4] = [
        AttributeKind::Brightness,
        AttributeKind::Width,
        AttributeKind::Height,
        AttributeKind::Name,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            AttributeKind::Brightness => "brightness",
            AttributeKind::Width => "width",
            AttributeKind::Height => "height",
            AttributeKind::Name => "name",
        }
    }
}

struct ExportedAttribute {
    kind: AttributeKind,
    state: Arc<DeviceState>,
}

impl Attribute for ExportedAttribute {
    fn show(&self) -> String {
        let descriptor = self.state.descriptor();
        match self.kind {
            AttributeKind::Brightness => format!("{}\n", self.state.brightness()),
            AttributeKind::Width => format!("{}\n", descriptor.width),
            AttributeKind::Height => format!("{}\n", descriptor.height),
            AttributeKind::Name => format!("{}\n", descriptor.name),
        }
    }

    fn store(&self, input: &str) -> Result<(), AttributeError> {
        match self.kind {
            AttributeKind::Brightness => {
                let level = parse_brightness(input)?;
                self.state.set_brightness(level);
                Ok(())
            }
            other => Err(AttributeError::ReadOnly(other.name())),
        }
    }

    fn writable(&self) -> bool {
        self.kind == AttributeKind::Brightness
    }
}

/// Exposed attributes of one session
///
/// Entries are exposed in [`AttributeKind::ALL`] order and removed in reverse
/// when this guard drops. A failure halfway through removes the entries that
/// already made it.
pub struct AttributeExport {
    host: Arc<dyn AttributeHost>,
    device: String,
    exposed: Vec<&'static str>,
}

impl AttributeExport {
    pub fn expose(host: Arc<dyn AttributeHost>, state: &Arc<DeviceState>) -> Result<Self, AttributeError> {
        let mut export = Self {
            host,
            device: state.id().to_string(),
            exposed: Vec::with_capacity(AttributeKind::ALL.len()),
        };

        for kind in AttributeKind::ALL {
            let attribute = Arc::new(ExportedAttribute {
                kind,
                state: Arc::clone(state),
            });
            export.host.expose(&export.device, kind.name(), attribute)?;
            export.exposed.push(kind.name());
        }

        debug!("{}: exposed {:?}", export.device, export.exposed);
        Ok(export)
    }

    pub fn names(&self) -> &[&'static str] {
        &self.exposed
    }
}

impl Drop for AttributeExport {
    fn drop(&mut self) {
        for name in self.exposed.drain(..).rev() {
            self.host.remove(&self.device, name);
        }
        debug!("{}: attributes removed", self.device);
    }
}
