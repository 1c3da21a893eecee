/*
 *  display/hosts.rs
 *
 *  usbd480fb - USB raster display driver
 *  (c) 2020-26 Stuart Hunter
 *
 *  In-process attribute and pixel-buffer hosts
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
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, info};

use crate::display::canvas::FrameCanvas;
use crate::display::error::{AttributeError, RegistrationError};
use crate::display::memory::WeakFrame;
use crate::display::traits::{Attribute, AttributeHost, BufferId, PixelBufferHost, PixelBufferInfo};

type AttributeKey = (String, &'static str);

fn locked<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Key/value attribute store, one namespace per device
#[derive(Default)]
pub struct AttributeTable {
    entries: Mutex<BTreeMap<AttributeKey, Arc<dyn Attribute>>>,
}

impl AttributeTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lookup(&self, device: &str, name: &str) -> Result<Arc<dyn Attribute>, AttributeError> {
        locked(&self.entries)
            .iter()
            .find(|((d, n), _)| d == device && *n == name)
            .map(|(_, attr)| Arc::clone(attr))
            .ok_or_else(|| AttributeError::Unknown(name.to_string(), device.to_string()))
    }

    pub fn read(&self, device: &str, name: &str) -> Result<String, AttributeError> {
        Ok(self.lookup(device, name)?.show())
    }

    /// The table lock is not held while the attribute applies the value
    pub fn write(&self, device: &str, name: &str, input: &str) -> Result<(), AttributeError> {
        self.lookup(device, name)?.store(input)
    }

    pub fn is_writable(&self, device: &str, name: &str) -> Result<bool, AttributeError> {
        Ok(self.lookup(device, name)?.writable())
    }

    /// Attribute names exposed for `device`
    pub fn names(&self, device: &str) -> Vec<&'static str> {
        locked(&self.entries)
            .keys()
            .filter(|(d, _)| d == device)
            .map(|(_, n)| *n)
            .collect()
    }

    pub fn len(&self) -> usize {
        locked(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AttributeHost for AttributeTable {
    fn expose(
        &self,
        device: &str,
        name: &'static str,
        attribute: Arc<dyn Attribute>,
    ) -> Result<(), AttributeError> {
        let mut entries = locked(&self.entries);
        let key = (device.to_string(), name);
        if entries.contains_key(&key) {
            return Err(AttributeError::Duplicate(name, device.to_string()));
        }
        entries.insert(key, attribute);
        Ok(())
    }

    fn remove(&self, device: &str, name: &'static str) {
        locked(&self.entries).remove(&(device.to_string(), name));
    }
}

struct Registered {
    info: PixelBufferInfo,
    frame: WeakFrame,
}

/// Pixel-buffer host keeping every registered frame addressable by id
///
/// Frames are held weakly: the owning session decides when the memory goes
/// away, whatever handles applications still keep.
pub struct FrameRegistry {
    buffers: Mutex<BTreeMap<BufferId, Registered>>,
    next_id: AtomicU32,
    max_resolution: Option<(u32, u32)>,
}

impl Default for FrameRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameRegistry {
    pub fn new() -> Self {
        Self {
            buffers: Mutex::new(BTreeMap::new()),
            next_id: AtomicU32::new(0),
            max_resolution: None,
        }
    }

    /// Reject frames larger than `width` x `height`
    pub fn with_max_resolution(width: u32, height: u32) -> Self {
        Self {
            max_resolution: Some((width, height)),
            ..Self::new()
        }
    }

    pub fn get(&self, id: BufferId) -> Option<(PixelBufferInfo, WeakFrame)> {
        locked(&self.buffers)
            .get(&id)
            .map(|r| (r.info.clone(), r.frame.clone()))
    }

    /// Buffer registered for `device`
    pub fn find(&self, device: &str) -> Option<BufferId> {
        locked(&self.buffers)
            .iter()
            .find(|(_, r)| r.info.device == device)
            .map(|(id, _)| *id)
    }

    /// Drawing surface over a registered buffer
    pub fn canvas(&self, id: BufferId) -> Option<FrameCanvas> {
        self.get(id).map(|(info, frame)| FrameCanvas::new(frame, &info))
    }

    pub fn ids(&self) -> Vec<BufferId> {
        locked(&self.buffers).keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        locked(&self.buffers).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PixelBufferHost for FrameRegistry {
    fn register(
        &self,
        info: PixelBufferInfo,
        frame: WeakFrame,
    ) -> Result<BufferId, RegistrationError> {
        if let Some((max_w, max_h)) = self.max_resolution {
            if info.width > max_w || info.height > max_h {
                return Err(RegistrationError::GeometryRejected {
                    width: info.width,
                    height: info.height,
                    reason: format!("exceeds {}x{}", max_w, max_h),
                });
            }
        }
        let allocated = {
            let Some(memory) = frame.upgrade() else {
                return Err(RegistrationError::GeometryRejected {
                    width: info.width,
                    height: info.height,
                    reason: "frame memory already released".to_string(),
                });
            };
            if memory.len() < info.size {
                return Err(RegistrationError::GeometryRejected {
                    width: info.width,
                    height: info.height,
                    reason: format!("region of {} bytes, {} needed", memory.len(), info.size),
                });
            }
            memory.allocated_len()
        };

        let mut buffers = locked(&self.buffers);
        if buffers.values().any(|r| r.info.device == info.device) {
            return Err(RegistrationError::Duplicate(info.device));
        }

        let id = BufferId(self.next_id.fetch_add(1, Ordering::Relaxed));
        info!(
            "{}: {} {}x{} RGB565, {} KiB",
            id,
            info.device,
            info.width,
            info.height,
            allocated / 1024
        );
        buffers.insert(id, Registered { info, frame });
        Ok(id)
    }

    fn unregister(&self, id: BufferId) {
        if locked(&self.buffers).remove(&id).is_some() {
            debug!("{}: unregistered", id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::memory::{FrameAllocator, FrameHandle, MmapAllocator};

    struct Fixed(&'static str);

    impl Attribute for Fixed {
        fn show(&self) -> String {
            format!("{}\n", self.0)
        }

        fn store(&self, _input: &str) -> Result<(), AttributeError> {
            Err(AttributeError::ReadOnly("fixed"))
        }
    }

    fn frame_for(info: &PixelBufferInfo) -> FrameHandle {
        Arc::new(MmapAllocator.allocate(info.size).unwrap())
    }

    #[test]
    fn test_attribute_table_namespaces() {
        let table = AttributeTable::new();
        table.expose("a", "name", Arc::new(Fixed("first"))).unwrap();
        table.expose("b", "name", Arc::new(Fixed("second"))).unwrap();

        assert_eq!(table.read("a", "name").unwrap(), "first\n");
        assert_eq!(table.read("b", "name").unwrap(), "second\n");
        assert_eq!(table.names("a"), vec!["name"]);
        assert!(!table.is_writable("a", "name").unwrap());
        assert!(matches!(table.read("c", "name"), Err(AttributeError::Unknown(..))));
    }

    #[test]
    fn test_attribute_table_rejects_duplicates() {
        let table = AttributeTable::new();
        table.expose("a", "width", Arc::new(Fixed("1"))).unwrap();
        assert_eq!(
            table.expose("a", "width", Arc::new(Fixed("2"))),
            Err(AttributeError::Duplicate("width", "a".to_string()))
        );
        table.remove("a", "width");
        assert!(table.is_empty());
    }

    #[test]
    fn test_frame_registry_roundtrip() {
        let registry = FrameRegistry::new();
        let info = PixelBufferInfo::rgb565("usb-1", 480, 272);
        let frame = frame_for(&info);

        let id = registry.register(info.clone(), Arc::downgrade(&frame)).unwrap();
        assert_eq!(registry.find("usb-1"), Some(id));
        assert_eq!(Arc::strong_count(&frame), 1);

        let (got, weak) = registry.get(id).unwrap();
        assert_eq!(got, info);
        assert!(Arc::ptr_eq(&weak.upgrade().unwrap(), &frame));
        drop(weak);

        registry.unregister(id);
        assert!(registry.is_empty());
        assert_eq!(Arc::weak_count(&frame), 0);
    }

    #[test]
    fn test_frame_registry_does_not_keep_memory_alive() {
        let registry = FrameRegistry::new();
        let info = PixelBufferInfo::rgb565("usb-1", 16, 16);
        let frame = frame_for(&info);
        let id = registry.register(info, Arc::downgrade(&frame)).unwrap();
        let canvas = registry.canvas(id).unwrap();

        drop(frame);
        assert!(registry.get(id).unwrap().1.upgrade().is_none());
        assert_eq!(canvas.pixel(embedded_graphics::prelude::Point::zero()), None);
    }

    #[test]
    fn test_frame_registry_rejects_released_frame() {
        let registry = FrameRegistry::new();
        let info = PixelBufferInfo::rgb565("usb-1", 16, 16);
        let frame = frame_for(&info);
        let weak = Arc::downgrade(&frame);
        drop(frame);
        assert!(matches!(
            registry.register(info, weak),
            Err(RegistrationError::GeometryRejected { .. })
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_frame_registry_max_resolution() {
        let registry = FrameRegistry::with_max_resolution(320, 240);
        let info = PixelBufferInfo::rgb565("usb-1", 480, 272);
        let frame = frame_for(&info);
        let err = registry.register(info.clone(), Arc::downgrade(&frame)).unwrap_err();
        assert!(matches!(err, RegistrationError::GeometryRejected { width: 480, .. }));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_frame_registry_rejects_second_buffer_for_device() {
        let registry = FrameRegistry::new();
        let info = PixelBufferInfo::rgb565("usb-1", 16, 16);
        let (first, second) = (frame_for(&info), frame_for(&info));
        registry.register(info.clone(), Arc::downgrade(&first)).unwrap();
        assert_eq!(
            registry.register(info.clone(), Arc::downgrade(&second)),
            Err(RegistrationError::Duplicate("usb-1".to_string()))
        );
        assert_eq!(registry.len(), 1);
    }
}
