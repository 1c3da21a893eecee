/*
 *  display/error.rs
 *
 *  usbd480fb - USB raster display driver
 *  (c) 2020-26 Stuart Hunter
 *
 *  Error types for the display subsystem
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
use thiserror::Error;

/// A control or bulk transfer that did not complete.
///
/// Transport errors are never retried. Outside of detail discovery they are
/// reported to the session's diagnostic sink and otherwise absorbed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("transfer timed out after {0:?}")]
    Timeout(Duration),

    #[error("device disconnected")]
    Disconnected,

    #[error("endpoint stalled")]
    Stall,

    #[error("short response: expected {expected} bytes, got {actual}")]
    ShortResponse { expected: usize, actual: usize },

    #[error("transfer failed: {0}")]
    Failed(String),
}

/// Errors raised by the attribute interface.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AttributeError {
    #[error("attribute '{0}' is read-only")]
    ReadOnly(&'static str),

    #[error("invalid value for '{name}': {input:?}")]
    InvalidValue { name: &'static str, input: String },

    #[error("attribute '{0}' already exposed for device {1}")]
    Duplicate(&'static str, String),

    #[error("no attribute '{0}' for device {1}")]
    Unknown(String, String),
}

/// The pixel-buffer collaborator refused a registration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistrationError {
    #[error("geometry {width}x{height} rejected: {reason}")]
    GeometryRejected { width: u32, height: u32, reason: String },

    #[error("pixel buffer '{0}' is already registered")]
    Duplicate(String),
}

/// Fatal errors while bringing a display session up.
///
/// Any of these aborts attach; every resource acquired before the failing
/// step has already been released when the error reaches the caller.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("device detail discovery failed: {0}")]
    Discovery(#[source] TransportError),

    #[error("device reported unusable geometry {width}x{height}")]
    InvalidGeometry { width: u32, height: u32 },

    #[error("unable to allocate {size} bytes of frame memory: {reason}")]
    Allocation { size: usize, reason: String },

    #[error("pixel buffer registration failed: {0}")]
    Registration(#[from] RegistrationError),

    #[error("attribute export failed: {0}")]
    AttributeExport(#[from] AttributeError),

    #[error("refresh scheduler could not be started: {0}")]
    SchedulerStart(String),
}

/// Errors from the device registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("no driver registered for {vendor:04x}:{product:04x}")]
    UnknownDevice { vendor: u16, product: u16 },

    #[error(transparent)]
    Session(#[from] SessionError),
}
