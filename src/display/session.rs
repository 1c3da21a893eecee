/*
 *  display/session.rs
 *
 *  usbd480fb - USB raster display driver
 *  (c) 2020-26 Stuart Hunter
 *
 *  Device session lifecycle: attach, discovery, memory, registration,
 *  refresh, teardown
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
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use crate::display::attributes::{AttributeExport, DeviceState};
use crate::display::control::{ControlChannel, DEFAULT_CONTROL_TIMEOUT, DeviceDescriptor};
use crate::display::error::{RegistrationError, SessionError};
use crate::display::memory::{FrameAllocator, FrameLease, MmapAllocator, WeakFrame};
use crate::display::scheduler::{
    RefreshCycle, RefreshScheduler, SchedulerConfig, StatsSnapshot,
};
use crate::display::traits::{
    AttributeHost, BufferId, DiagnosticSink, LogSink, Operation, PixelBufferHost,
    PixelBufferInfo, TransportFault, UsbTransport,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Attached,
    DetailsKnown,
    MemoryReady,
    Registered,
    Running,
    Detaching,
    Released,
    Error,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Attached => "attached",
            SessionState::DetailsKnown => "details-known",
            SessionState::MemoryReady => "memory-ready",
            SessionState::Registered => "registered",
            SessionState::Running => "running",
            SessionState::Detaching => "detaching",
            SessionState::Released => "released",
            SessionState::Error => "error",
        };
        f.write_str(name)
    }
}

/// What to do when the device does not answer GET_DEVICE_DETAILS
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DiscoveryPolicy {
    /// Abort attach
    #[default]
    Strict,
    /// Report the fault and continue with the fallback geometry, if any
    Lenient,
}

impl FromStr for DiscoveryPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "strict" => Ok(DiscoveryPolicy::Strict),
            "lenient" => Ok(DiscoveryPolicy::Lenient),
            other => Err(format!("unknown discovery policy '{other}' (strict|lenient)")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub control_timeout: Duration,
    pub discovery: DiscoveryPolicy,
    /// Geometry used by [`DiscoveryPolicy::Lenient`] when discovery fails
    pub fallback_geometry: Option<(u32, u32)>,
    /// Sent once right after discovery
    pub initial_brightness: Option<u8>,
    pub scheduler: SchedulerConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            control_timeout: DEFAULT_CONTROL_TIMEOUT,
            discovery: DiscoveryPolicy::default(),
            fallback_geometry: None,
            initial_brightness: None,
            scheduler: SchedulerConfig::default(),
        }
    }
}

/// The collaborators a session plugs into
#[derive(Clone)]
pub struct SessionEnv {
    pub pixel_host: Arc<dyn PixelBufferHost>,
    pub attributes: Arc<dyn AttributeHost>,
    pub allocator: Arc<dyn FrameAllocator>,
    pub diagnostics: Arc<dyn DiagnosticSink>,
}

impl SessionEnv {
    /// Anonymous mappings for frame memory, faults go to the log
    pub fn new(pixel_host: Arc<dyn PixelBufferHost>, attributes: Arc<dyn AttributeHost>) -> Self {
        Self {
            pixel_host,
            attributes,
            allocator: Arc::new(MmapAllocator),
            diagnostics: Arc::new(LogSink),
        }
    }

    pub fn with_allocator(mut self, allocator: Arc<dyn FrameAllocator>) -> Self {
        self.allocator = allocator;
        self
    }

    pub fn with_diagnostics(mut self, diagnostics: Arc<dyn DiagnosticSink>) -> Self {
        self.diagnostics = diagnostics;
        self
    }
}

/// A live pixel-buffer registration, undone on drop
struct Registration {
    host: Arc<dyn PixelBufferHost>,
    id: BufferId,
    device: String,
}

impl Registration {
    fn register(
        host: Arc<dyn PixelBufferHost>,
        info: PixelBufferInfo,
        frame: WeakFrame,
    ) -> Result<Self, RegistrationError> {
        let device = info.device.clone();
        let id = host.register(info, frame)?;
        Ok(Self { host, id, device })
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.host.unregister(self.id);
        debug!("{}: pixel buffer {} unregistered", self.device, self.id);
    }
}

/// What a completed detach leaves behind
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetachReport {
    pub stats: StatsSnapshot,
    /// Every state the session went through, in order
    pub states: Vec<SessionState>,
}

/// One attached display
///
/// Resources are held in acquisition order and the fields are declared in
/// reverse, so dropping a session without [`DisplaySession::detach`] still
/// tears down scheduler first and device handle last. Only `detach` waits
/// for an in-flight refresh cycle though.
pub struct DisplaySession {
    scheduler: Option<RefreshScheduler>,
    attributes: Option<AttributeExport>,
    registration: Option<Registration>,
    frame: Option<FrameLease>,
    device: Arc<DeviceState>,
    channel: Arc<ControlChannel>,
    buffer: BufferId,
    history: Vec<SessionState>,
}

impl fmt::Debug for DisplaySession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DisplaySession")
            .field("buffer", &self.buffer)
            .field("history", &self.history)
            .finish_non_exhaustive()
    }
}

impl DisplaySession {
    /// Bring a matched device up to `Running`
    ///
    /// Has to be called from within a tokio runtime, the refresh task is
    /// spawned on it. On failure everything acquired so far has been released
    /// again, newest first, before the error is returned.
    pub fn attach(
        id: &str,
        transport: Arc<dyn UsbTransport>,
        env: &SessionEnv,
        config: &SessionConfig,
    ) -> Result<Self, SessionError> {
        info!("{}: attaching", id);
        let mut history = vec![SessionState::Attached];

        match Self::bring_up(id, transport, env, config, &mut history) {
            Ok(session) => {
                info!(
                    "{}: running, {}x{} '{}' as {}",
                    id,
                    session.device.descriptor().width,
                    session.device.descriptor().height,
                    session.device.descriptor().name,
                    session.buffer
                );
                Ok(session)
            }
            Err(e) => {
                let reached = history.last().copied().unwrap_or(SessionState::Attached);
                history.push(SessionState::Error);
                error!("{}: attach failed after {}: {}", id, reached, e);
                debug!("{}: {:?}", id, history);
                Err(e)
            }
        }
    }

    fn bring_up(
        id: &str,
        transport: Arc<dyn UsbTransport>,
        env: &SessionEnv,
        config: &SessionConfig,
        history: &mut Vec<SessionState>,
    ) -> Result<Self, SessionError> {
        // locals unwind in reverse on every early return
        let channel = Arc::new(ControlChannel::new(transport, config.control_timeout));

        let descriptor = discover(id, &channel, env, config)?;
        history.push(SessionState::DetailsKnown);
        debug!("{}: {:?}", id, descriptor);

        let device = Arc::new(DeviceState::new(
            id,
            descriptor,
            Arc::clone(&channel),
            Arc::clone(&env.diagnostics),
        ));

        let (width, height) = (device.descriptor().width, device.descriptor().height);
        let len = device
            .descriptor()
            .frame_len()
            .filter(|_| device.descriptor().has_geometry())
            .ok_or(SessionError::InvalidGeometry { width, height })?;

        if let Some(level) = config.initial_brightness {
            device.set_brightness(level);
        }

        let memory = env.allocator.allocate(len)?;
        let frame = FrameLease::new(Arc::clone(&env.allocator), memory, id);
        info!(
            "{}: {} KiB of frame memory at {:#x}",
            id,
            frame.memory().allocated_len() / 1024,
            frame.memory().base_addr()
        );
        history.push(SessionState::MemoryReady);

        let info = PixelBufferInfo::rgb565(id, width, height);
        let registration = Registration::register(Arc::clone(&env.pixel_host), info, frame.share_weak())?;
        history.push(SessionState::Registered);

        let attributes = AttributeExport::expose(Arc::clone(&env.attributes), &device)?;

        let cycle = RefreshCycle::new(
            id,
            Arc::clone(&channel),
            frame.share(),
            &config.scheduler,
            Arc::clone(&env.diagnostics),
        )?;
        let scheduler = RefreshScheduler::start(cycle, &config.scheduler)?;
        history.push(SessionState::Running);

        Ok(Self {
            buffer: registration.id,
            scheduler: Some(scheduler),
            attributes: Some(attributes),
            registration: Some(registration),
            frame: Some(frame),
            device,
            channel,
            history: std::mem::take(history),
        })
    }

    pub fn id(&self) -> &str {
        self.device.id()
    }

    pub fn state(&self) -> SessionState {
        self.history.last().copied().unwrap_or(SessionState::Attached)
    }

    pub fn history(&self) -> &[SessionState] {
        &self.history
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        self.device.descriptor()
    }

    /// Pixel buffer this session registered
    pub fn buffer_id(&self) -> BufferId {
        self.buffer
    }

    pub fn brightness(&self) -> u8 {
        self.device.brightness()
    }

    pub fn set_brightness(&self, level: u8) {
        self.device.set_brightness(level);
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.scheduler.as_ref().map(|s| s.stats()).unwrap_or_default()
    }

    pub fn control_timeout(&self) -> Duration {
        self.channel.timeout()
    }

    fn enter(&mut self, state: SessionState) {
        debug!("{}: {} -> {}", self.id(), self.state(), state);
        self.history.push(state);
    }

    /// Stop refreshing and give everything back
    ///
    /// Returns once the refresh task has exited; only then are the
    /// attributes, the pixel buffer, the frame memory and the device handle
    /// released, in that order.
    pub async fn detach(mut self) -> DetachReport {
        self.enter(SessionState::Detaching);

        let stats = match self.scheduler.take() {
            Some(scheduler) => scheduler.stop().await,
            None => StatsSnapshot::default(),
        };

        drop(self.attributes.take());
        drop(self.registration.take());
        drop(self.frame.take());

        self.enter(SessionState::Released);
        info!(
            "{}: released after {} refresh cycles ({} upload failures)",
            self.id(),
            stats.cycles,
            stats.upload_failures
        );

        DetachReport {
            stats,
            states: std::mem::take(&mut self.history),
        }
    }
}

impl Drop for DisplaySession {
    fn drop(&mut self) {
        if self.scheduler.is_some() {
            warn!("{}: session dropped without detach", self.device.id());
        }
    }
}

fn discover(
    id: &str,
    channel: &ControlChannel,
    env: &SessionEnv,
    config: &SessionConfig,
) -> Result<DeviceDescriptor, SessionError> {
    let error = match channel.get_device_details() {
        Ok(descriptor) => return Ok(descriptor),
        Err(error) => error,
    };

    match config.discovery {
        DiscoveryPolicy::Strict => Err(SessionError::Discovery(error)),
        DiscoveryPolicy::Lenient => {
            env.diagnostics.transport_fault(&TransportFault {
                device: id.to_string(),
                operation: Operation::GetDeviceDetails,
                error,
            });
            let (width, height) = config.fallback_geometry.unwrap_or((0, 0));
            warn!("{}: no device details, assuming {}x{}", id, width, height);
            Ok(DeviceDescriptor {
                name: String::new(),
                width,
                height,
            })
        }
    }
}
