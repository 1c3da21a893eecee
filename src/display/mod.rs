/*
 *  display/mod.rs
 *
 *  usbd480fb - USB raster display driver
 *  (c) 2020-26 Stuart Hunter
 *
 *  Display subsystem - sessions, refresh protocol and collaborator seams
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

// Core trait definitions
pub mod traits;
pub mod error;

// Device protocol and resources
pub mod control;
pub mod memory;
pub mod scheduler;
pub mod attributes;
pub mod session;
pub mod registry;

// In-process collaborators
pub mod canvas;
pub mod hosts;

// Transport backends
pub mod drivers;

// Re-exports for convenience
pub use traits::{
    Attribute, AttributeHost, BufferId, DiagnosticSink, LogSink, Operation, PixelBufferHost,
    PixelBufferInfo, PixelFormat, TransportFault, UsbTransport,
};
pub use error::{AttributeError, RegistrationError, RegistryError, SessionError, TransportError};
pub use control::{ControlChannel, DeviceDescriptor};
pub use memory::{FrameAllocator, FrameHandle, FrameMemory, MmapAllocator, WeakFrame};
pub use scheduler::{FlipMode, PageState, SchedulerConfig, StatsSnapshot};
pub use session::{DetachReport, DiscoveryPolicy, DisplaySession, SessionConfig, SessionEnv, SessionState};
pub use registry::{DeviceId, DriverRegistry, SessionFactory, Usbd480Factory};
pub use canvas::{FrameCanvas, FrameReleased};
pub use hosts::{AttributeTable, FrameRegistry};
