/*
 *  display/drivers/mock.rs
 *
 *  usbd480fb - USB raster display driver
 *  (c) 2020-26 Stuart Hunter
 *
 *  Simulated USB transport for testing without hardware
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

use crate::display::control::{DETAILS_LEN, NAME_LEN, SET_BRIGHTNESS};
use crate::display::error::TransportError;
use crate::display::traits::{ControlSetup, DiagnosticSink, TransportFault, UsbTransport};

/// One recorded transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    ControlIn { request: u8, value: u16, index: u16, len: usize },
    ControlOut { request: u8, value: u16, index: u16 },
    BulkOut { endpoint: u8, len: usize },
}

/// Mock USB transport
///
/// Simulates a USBD480 on the other end of the cable. Useful for:
/// - Unit and integration tests
/// - `--simulate` runs without hardware
///
/// Every transfer is recorded, failures and slow uploads can be switched on
/// through the shared state.
#[derive(Debug, Clone)]
pub struct MockTransport {
    state: Arc<Mutex<MockTransportState>>,
}

/// Internal state of the mock transport (shared for inspection in tests)
#[derive(Debug)]
pub struct MockTransportState {
    /// Response to GET_DEVICE_DETAILS
    pub details: [u8; DETAILS_LEN],

    /// Every transfer in issue order
    pub events: Vec<TransportEvent>,

    /// Total bytes accepted on bulk endpoints
    pub bytes_uploaded: usize,

    /// Payload of the most recent bulk transfer
    pub last_upload: Vec<u8>,

    /// Last value sent with SET_BRIGHTNESS
    pub last_brightness: Option<u16>,

    /// Set when a transfer started while another was still running
    pub overlap_detected: bool,
    in_flight: bool,

    /// Simulate failures (for error testing)
    pub simulate_details_failure: bool,
    pub simulate_control_failure: bool,
    pub simulate_bulk_failure: bool,
    /// Accept only the first half of every bulk payload
    pub simulate_short_upload: bool,

    /// Make every bulk transfer take this long
    pub bulk_delay: Option<Duration>,
}

impl Default for MockTransportState {
    fn default() -> Self {
        Self {
            details: [0u8; DETAILS_LEN],
            events: Vec::new(),
            bytes_uploaded: 0,
            last_upload: Vec::new(),
            last_brightness: None,
            overlap_detected: false,
            in_flight: false,
            simulate_details_failure: false,
            simulate_control_failure: false,
            simulate_bulk_failure: false,
            simulate_short_upload: false,
            bulk_delay: None,
        }
    }
}

/// Build a GET_DEVICE_DETAILS response block
pub fn details_block(name: &str, width: u16, height: u16) -> [u8; DETAILS_LEN] {
    let mut block = [0u8; DETAILS_LEN];
    let name = name.as_bytes();
    let n = name.len().min(NAME_LEN);
    block[..n].copy_from_slice(&name[..n]);
    block[20..22].copy_from_slice(&width.to_le_bytes());
    block[22..24].copy_from_slice(&height.to_le_bytes());
    block
}

impl MockTransport {
    pub fn new(details: [u8; DETAILS_LEN]) -> Self {
        let state = MockTransportState {
            details,
            ..Default::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// A device reporting the given name and geometry
    pub fn with_geometry(name: &str, width: u16, height: u16) -> Self {
        Self::new(details_block(name, width, height))
    }

    /// Get reference to state for inspection in tests
    pub fn state(&self) -> Arc<Mutex<MockTransportState>> {
        Arc::clone(&self.state)
    }

    fn lock(&self) -> MutexGuard<'_, MockTransportState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of the recorded transfers
    pub fn events(&self) -> Vec<TransportEvent> {
        self.lock().events.clone()
    }

    pub fn clear_events(&self) {
        self.lock().events.clear();
    }

    pub fn bulk_count(&self) -> usize {
        self.lock()
            .events
            .iter()
            .filter(|e| matches!(e, TransportEvent::BulkOut { .. }))
            .count()
    }

    fn begin(&self, event: TransportEvent) {
        let mut state = self.lock();
        if state.in_flight {
            state.overlap_detected = true;
        }
        state.in_flight = true;
        state.events.push(event);
    }

    fn end(&self) {
        self.lock().in_flight = false;
    }
}

impl UsbTransport for MockTransport {
    fn control_in(
        &self,
        setup: ControlSetup,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        self.begin(TransportEvent::ControlIn {
            request: setup.request,
            value: setup.value,
            index: setup.index,
            len: buf.len(),
        });

        let result = {
            let state = self.lock();
            if state.simulate_details_failure || state.simulate_control_failure {
                Err(TransportError::Timeout(timeout))
            } else {
                let n = buf.len().min(DETAILS_LEN);
                buf[..n].copy_from_slice(&state.details[..n]);
                Ok(n)
            }
        };

        self.end();
        result
    }

    fn control_out(
        &self,
        setup: ControlSetup,
        _data: &[u8],
        _timeout: Duration,
    ) -> Result<usize, TransportError> {
        self.begin(TransportEvent::ControlOut {
            request: setup.request,
            value: setup.value,
            index: setup.index,
        });

        let result = {
            let mut state = self.lock();
            if state.simulate_control_failure {
                Err(TransportError::Stall)
            } else {
                if setup.request == SET_BRIGHTNESS {
                    state.last_brightness = Some(setup.value);
                }
                Ok(0)
            }
        };

        self.end();
        result
    }

    fn bulk_out(
        &self,
        endpoint: u8,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        self.begin(TransportEvent::BulkOut {
            endpoint,
            len: data.len(),
        });

        let delay = self.lock().bulk_delay;
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }

        let result = {
            let mut state = self.lock();
            if state.simulate_bulk_failure {
                Err(TransportError::Timeout(timeout))
            } else {
                let accepted = if state.simulate_short_upload { data.len() / 2 } else { data.len() };
                state.bytes_uploaded += accepted;
                state.last_upload.clear();
                state.last_upload.extend_from_slice(&data[..accepted]);
                Ok(accepted)
            }
        };

        self.end();
        result
    }
}

/// Diagnostic sink that keeps every fault for later inspection
#[derive(Debug, Default, Clone)]
pub struct RecordingSink {
    faults: Arc<Mutex<Vec<TransportFault>>>,
}

impl RecordingSink {
    pub fn faults(&self) -> Vec<TransportFault> {
        self.faults.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl DiagnosticSink for RecordingSink {
    fn transport_fault(&self, fault: &TransportFault) {
        self.faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(fault.clone());
    }
}
