/*
 *  display/registry.rs
 *
 *  usbd480fb - USB raster display driver
 *  (c) 2020-26 Stuart Hunter
 *
 *  Vendor/product to session factory registry
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

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use log::{debug, info};

use crate::display::error::{RegistryError, SessionError};
use crate::display::session::{DisplaySession, SessionConfig, SessionEnv};
use crate::display::traits::UsbTransport;

pub const USBD480_VENDOR_ID: u16 = 0x16C0;
pub const USBD480_PRODUCT_ID: u16 = 0x08A6;

/// USB vendor/product pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId {
    pub vendor: u16,
    pub product: u16,
}

impl DeviceId {
    pub const USBD480: DeviceId = DeviceId {
        vendor: USBD480_VENDOR_ID,
        product: USBD480_PRODUCT_ID,
    };

    pub fn new(vendor: u16, product: u16) -> Self {
        Self { vendor, product }
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor, self.product)
    }
}

/// Creates sessions for one kind of device
pub trait SessionFactory: Send + Sync {
    fn name(&self) -> &'static str;

    fn create(
        &self,
        id: &str,
        transport: Arc<dyn UsbTransport>,
        env: &SessionEnv,
    ) -> Result<DisplaySession, SessionError>;
}

/// Type alias for boxed session factories
pub type BoxedFactory = Box<dyn SessionFactory>;

/// Sessions for the USBD480 family
pub struct Usbd480Factory {
    config: SessionConfig,
}

impl Usbd480Factory {
    pub fn new(config: SessionConfig) -> Self {
        Self { config }
    }
}

impl SessionFactory for Usbd480Factory {
    fn name(&self) -> &'static str {
        "usbd480"
    }

    fn create(
        &self,
        id: &str,
        transport: Arc<dyn UsbTransport>,
        env: &SessionEnv,
    ) -> Result<DisplaySession, SessionError> {
        DisplaySession::attach(id, transport, env, &self.config)
    }
}

/// Which factory serves which device
///
/// Owned by whoever runs the bus scan; vendor/product matching happens here,
/// before any session exists.
#[derive(Default)]
pub struct DriverRegistry {
    factories: BTreeMap<DeviceId, BoxedFactory>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// USBD480 sessions under `device`
    pub fn with_usbd480(device: DeviceId, config: SessionConfig) -> Self {
        let mut registry = Self::new();
        registry.register(device, Box::new(Usbd480Factory::new(config)));
        registry
    }

    /// Returns the factory previously registered for `device`, if any
    pub fn register(&mut self, device: DeviceId, factory: BoxedFactory) -> Option<BoxedFactory> {
        debug!("registering '{}' for {}", factory.name(), device);
        self.factories.insert(device, factory)
    }

    pub fn supports(&self, vendor: u16, product: u16) -> bool {
        self.factories.contains_key(&DeviceId::new(vendor, product))
    }

    pub fn devices(&self) -> Vec<DeviceId> {
        self.factories.keys().copied().collect()
    }

    /// Create a session for a matched device
    pub fn attach(
        &self,
        device: DeviceId,
        id: &str,
        transport: Arc<dyn UsbTransport>,
        env: &SessionEnv,
    ) -> Result<DisplaySession, RegistryError> {
        let factory = self.factories.get(&device).ok_or(RegistryError::UnknownDevice {
            vendor: device.vendor,
            product: device.product,
        })?;

        info!("{}: {} device {}", id, factory.name(), device);
        Ok(factory.create(id, transport, env)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::drivers::mock::MockTransport;
    use crate::display::hosts::{AttributeTable, FrameRegistry};

    fn env() -> SessionEnv {
        SessionEnv::new(Arc::new(FrameRegistry::new()), Arc::new(AttributeTable::new()))
    }

    struct Refusing;

    impl SessionFactory for Refusing {
        fn name(&self) -> &'static str {
            "refusing"
        }

        fn create(
            &self,
            _id: &str,
            _transport: Arc<dyn UsbTransport>,
            _env: &SessionEnv,
        ) -> Result<DisplaySession, SessionError> {
            Err(SessionError::InvalidGeometry { width: 0, height: 0 })
        }
    }

    #[test]
    fn test_device_id_display() {
        assert_eq!(DeviceId::USBD480.to_string(), "16c0:08a6");
    }

    #[test]
    fn test_unknown_device_is_rejected() {
        let registry = DriverRegistry::with_usbd480(DeviceId::USBD480, SessionConfig::default());
        assert!(registry.supports(0x16C0, 0x08A6));
        assert!(!registry.supports(0x16C0, 0x0001));

        let mock = MockTransport::with_geometry("USBD480", 480, 272);
        let result = registry.attach(DeviceId::new(0x1234, 0x5678), "usb-9", Arc::new(mock.clone()), &env());
        assert!(matches!(
            result,
            Err(RegistryError::UnknownDevice { vendor: 0x1234, product: 0x5678 })
        ));
        assert!(mock.events().is_empty());
    }

    #[test]
    fn test_register_replaces() {
        let mut registry = DriverRegistry::new();
        assert!(registry.register(DeviceId::USBD480, Box::new(Refusing)).is_none());
        let old = registry.register(DeviceId::USBD480, Box::new(Usbd480Factory::new(SessionConfig::default())));
        assert_eq!(old.map(|f| f.name()), Some("refusing"));
        assert_eq!(registry.devices(), vec![DeviceId::USBD480]);
    }

    #[test]
    fn test_factory_errors_pass_through() {
        let mut registry = DriverRegistry::new();
        registry.register(DeviceId::USBD480, Box::new(Refusing));
        let mock = MockTransport::with_geometry("USBD480", 480, 272);
        let result = registry.attach(DeviceId::USBD480, "usb-1", Arc::new(mock), &env());
        assert!(matches!(
            result,
            Err(RegistryError::Session(SessionError::InvalidGeometry { .. }))
        ));
    }

    #[tokio::test]
    async fn test_attach_through_registry() {
        let registry = DriverRegistry::with_usbd480(DeviceId::USBD480, SessionConfig::default());
        let mock = MockTransport::with_geometry("USBD480-LQ043", 480, 272);
        let session = registry
            .attach(DeviceId::USBD480, "usb-1", Arc::new(mock), &env())
            .unwrap();
        assert_eq!(session.descriptor().width, 480);
        session.detach().await;
    }
}
