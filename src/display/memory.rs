/*
 *  display/memory.rs
 *
 *  usbd480fb - USB raster display driver
 *  (c) 2020-26 Stuart Hunter
 *
 *  Host side frame memory: page aligned, zeroed, owned by the session
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

use std::mem::ManuallyDrop;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use log::{debug, warn};
use memmap2::MmapMut;

use crate::display::error::SessionError;

/// Shared reference to a session's frame memory
pub type FrameHandle = Arc<FrameMemory>;

/// Non-owning reference handed to the pixel-buffer host and its canvases
pub type WeakFrame = Weak<FrameMemory>;

const FALLBACK_PAGE_SIZE: usize = 4096;

/// Page size of the running system
pub fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 { size as usize } else { FALLBACK_PAGE_SIZE }
}

/// Round `len` up to a whole number of pages
pub fn round_to_pages(len: usize) -> usize {
    len.div_ceil(page_size()) * page_size()
}

/// One frame worth of pixels
///
/// The mapping is at least `len` bytes and a whole number of pages; only the
/// first `len` bytes are meaningful. Writers (applications drawing through
/// the pixel-buffer host) and the uploader take the region lock for the
/// duration of one copy only, so a frame may be uploaded between two draw
/// calls. That tears at most one frame and is accepted.
pub struct FrameMemory {
    region: Mutex<MmapMut>,
    len: usize,
    allocated: usize,
    base: usize,
}

impl FrameMemory {
    fn from_map(map: MmapMut, len: usize) -> Self {
        let allocated = map.len();
        let base = map.as_ptr() as usize;
        Self {
            region: Mutex::new(map),
            len,
            allocated,
            base,
        }
    }

    // bytes have no invariant to protect, a poisoned lock is still usable
    fn lock(&self) -> MutexGuard<'_, MmapMut> {
        self.region.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Logical frame size in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Size of the underlying allocation
    pub fn allocated_len(&self) -> usize {
        self.allocated
    }

    pub fn base_addr(&self) -> usize {
        self.base
    }

    pub fn is_page_aligned(&self) -> bool {
        self.base % page_size() == 0
    }

    /// Read access to the logical prefix
    pub fn read<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let map = self.lock();
        f(&map[..self.len])
    }

    /// Write access to the logical prefix
    pub fn write<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut map = self.lock();
        f(&mut map[..self.len])
    }

    /// Copy the current frame into `staging`, reusing its capacity
    pub fn snapshot_into(&self, staging: &mut Vec<u8>) {
        let map = self.lock();
        staging.clear();
        staging.extend_from_slice(&map[..self.len]);
    }
}

impl std::fmt::Debug for FrameMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameMemory")
            .field("len", &self.len)
            .field("allocated", &self.allocated)
            .field("base", &format_args!("{:#x}", self.base))
            .finish()
    }
}

/// Platform capability that hands out and takes back frame memory
pub trait FrameAllocator: Send + Sync {
    /// Zeroed, page aligned region of at least `len` bytes
    fn allocate(&self, len: usize) -> Result<FrameMemory, SessionError>;

    fn release(&self, frame: FrameMemory) {
        drop(frame);
    }
}

/// Anonymous private mappings: page aligned and zero filled by the kernel
#[derive(Debug, Default, Clone, Copy)]
pub struct MmapAllocator;

impl FrameAllocator for MmapAllocator {
    fn allocate(&self, len: usize) -> Result<FrameMemory, SessionError> {
        if len == 0 {
            return Err(SessionError::Allocation {
                size: len,
                reason: "zero sized frame".to_string(),
            });
        }
        let rounded = round_to_pages(len);
        let map = MmapMut::map_anon(rounded).map_err(|e| SessionError::Allocation {
            size: rounded,
            reason: e.to_string(),
        })?;

        let frame = FrameMemory::from_map(map, len);
        if !frame.is_page_aligned() {
            return Err(SessionError::Allocation {
                size: rounded,
                reason: format!("mapping at {:#x} is not page aligned", frame.base_addr()),
            });
        }
        debug!("mapped {} bytes of frame memory ({} used)", rounded, len);
        Ok(frame)
    }
}

/// Ownership of a session's frame memory
///
/// Dropping the lease gives the memory back to its allocator, exactly once.
/// The refresh task holds the only other strong [`FrameHandle`] and is
/// stopped first; hosts and canvases only ever see a [`WeakFrame`]. A strong
/// handle still alive at that point (a task aborted mid-cycle) keeps the
/// mapping valid and frees it when it drops instead.
pub(crate) struct FrameLease {
    allocator: Arc<dyn FrameAllocator>,
    frame: ManuallyDrop<FrameHandle>,
    device: String,
}

impl FrameLease {
    pub(crate) fn new(allocator: Arc<dyn FrameAllocator>, frame: FrameMemory, device: &str) -> Self {
        Self {
            allocator,
            frame: ManuallyDrop::new(Arc::new(frame)),
            device: device.to_string(),
        }
    }

    pub(crate) fn share(&self) -> FrameHandle {
        Arc::clone(&self.frame)
    }

    pub(crate) fn share_weak(&self) -> WeakFrame {
        Arc::downgrade(&self.frame)
    }

    pub(crate) fn memory(&self) -> &FrameMemory {
        &self.frame
    }
}

impl Drop for FrameLease {
    fn drop(&mut self) {
        // SAFETY: taken exactly once, the field is not touched afterwards
        let frame = unsafe { ManuallyDrop::take(&mut self.frame) };
        match Arc::try_unwrap(frame) {
            Ok(memory) => {
                debug!("{}: releasing {} bytes of frame memory", self.device, memory.allocated_len());
                self.allocator.release(memory);
            }
            Err(shared) => {
                warn!(
                    "{}: frame memory still referenced by {} handle(s), freed when the last one drops",
                    self.device,
                    Arc::strong_count(&shared) - 1
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingAllocator {
        released: AtomicUsize,
    }

    impl FrameAllocator for CountingAllocator {
        fn allocate(&self, len: usize) -> Result<FrameMemory, SessionError> {
            MmapAllocator.allocate(len)
        }

        fn release(&self, frame: FrameMemory) {
            self.released.fetch_add(1, Ordering::SeqCst);
            drop(frame);
        }
    }

    #[test]
    fn test_allocation_covers_frame_and_is_aligned() {
        for (w, h) in [(480usize, 272usize), (640, 480), (240, 320), (800, 256), (1, 1), (33, 7)] {
            let len = w * h * 2;
            let frame = MmapAllocator.allocate(len).unwrap();
            assert_eq!(frame.len(), len);
            assert!(frame.allocated_len() >= len);
            assert_eq!(frame.allocated_len() % page_size(), 0);
            assert!(frame.is_page_aligned(), "{}x{} not aligned", w, h);
        }
    }

    #[test]
    fn test_allocation_is_zeroed() {
        let frame = MmapAllocator.allocate(480 * 272 * 2).unwrap();
        assert!(frame.read(|bytes| bytes.iter().all(|&b| b == 0)));
    }

    #[test]
    fn test_zero_sized_allocation_fails() {
        assert!(matches!(
            MmapAllocator.allocate(0),
            Err(SessionError::Allocation { size: 0, .. })
        ));
    }

    #[test]
    fn test_round_to_pages() {
        let page = page_size();
        assert_eq!(round_to_pages(1), page);
        assert_eq!(round_to_pages(page), page);
        assert_eq!(round_to_pages(page + 1), 2 * page);
        assert!(round_to_pages(261120) >= 261120);
    }

    #[test]
    fn test_snapshot_copies_logical_prefix_only() {
        let frame = MmapAllocator.allocate(100).unwrap();
        frame.write(|bytes| bytes.fill(0xAB));
        let mut staging = Vec::new();
        frame.snapshot_into(&mut staging);
        assert_eq!(staging.len(), 100);
        assert!(staging.iter().all(|&b| b == 0xAB));
    }

    #[test]
    fn test_lease_releases_once() {
        let allocator = Arc::new(CountingAllocator::default());
        let memory = allocator.allocate(4096).unwrap();
        let lease = FrameLease::new(allocator.clone(), memory, "test");
        let handle = lease.share();
        drop(handle);
        drop(lease);
        assert_eq!(allocator.released.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_weak_share_does_not_hold_back_release() {
        let allocator = Arc::new(CountingAllocator::default());
        let memory = allocator.allocate(4096).unwrap();
        let lease = FrameLease::new(allocator.clone(), memory, "test");
        let weak = lease.share_weak();
        assert!(weak.upgrade().is_some());

        drop(lease);
        assert_eq!(allocator.released.load(Ordering::SeqCst), 1);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn test_lease_with_outstanding_handle_does_not_release() {
        let allocator = Arc::new(CountingAllocator::default());
        let memory = allocator.allocate(4096).unwrap();
        let lease = FrameLease::new(allocator.clone(), memory, "test");
        let handle = lease.share();
        drop(lease);
        assert_eq!(allocator.released.load(Ordering::SeqCst), 0);
        // still valid memory
        handle.write(|bytes| bytes[0] = 1);
        assert_eq!(handle.read(|bytes| bytes[0]), 1);
    }
}
