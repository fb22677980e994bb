//! # Memory manager context
//!
//! [`MemoryManager`] bundles what every memory object needs: the frame pool,
//! the physical mapper used to touch frame contents, the shared zero frame and
//! the registries of live inode-backed and purgeable objects. It is built once when memory
//! management comes up and handed to every object constructor as an
//! `Arc<MemoryManager>`; there is no global state.
//!
//! ```text
//!                 ┌────────────────── MemoryManager ──────────────────────┐
//!  VmObject ────► │ FramePool   PhysMapper   zero frame   inodes  purgeable │
//!                 └──────┬────────────┬───────────────────────┬────────┬────┘
//!                        ▼            ▼                       ▼        ▼
//!                   buddy zones   frame bytes     InodeId → [Weak]   [Weak]
//! ```
//!
//! When the pool has no uncommitted frame left, [`MemoryManager::allocate_frame`]
//! purges the volatile pages of every registered anonymous object once and
//! retries before reporting exhaustion. Objects whose slot lock is held, the
//! faulting object included, are skipped.

use crate::inode::InodeId;
use crate::{FRAME_BYTES, VmError, VmObject, VmObjectKind};
use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::{fmt, ptr, slice};
use kernel_alloc::phys_mapper::{self, PhysMapper};
use kernel_alloc::{FrameHandle, FramePool};
use log::{debug, info, warn};
use spin::Mutex;

pub struct MemoryManager {
    pool: FramePool,
    mapper: Arc<dyn PhysMapper>,
    shared_zero: FrameHandle,
    inode_objects: Mutex<BTreeMap<InodeId, Vec<Weak<VmObject>>>>,
    purgeable: Mutex<Vec<Weak<VmObject>>>,
}

impl MemoryManager {
    /// Bring up memory management on top of `pool`.
    ///
    /// One frame is withdrawn from the pool for good and zeroed to serve as the
    /// shared zero frame.
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`] if the pool has no frame to spare.
    pub fn new(pool: FramePool, mapper: Arc<dyn PhysMapper>) -> Result<Arc<Self>, VmError> {
        let zero = pool.allocate_permanent().ok_or(VmError::OutOfMemory)?;
        // SAFETY: the frame was just taken out of the pool and nobody else sees it.
        unsafe { phys_mapper::zero_frame(&*mapper, zero) };

        info!(
            "memory manager up: {} frames, shared zero frame at {zero:?}",
            pool.total_frames()
        );
        Ok(Arc::new(Self {
            pool,
            mapper,
            shared_zero: FrameHandle::non_returnable(zero),
            inode_objects: Mutex::new(BTreeMap::new()),
            purgeable: Mutex::new(Vec::new()),
        }))
    }

    #[must_use]
    pub const fn pool(&self) -> &FramePool {
        &self.pool
    }

    #[must_use]
    pub fn mapper(&self) -> &dyn PhysMapper {
        &*self.mapper
    }

    /// The frame every read-but-never-written anonymous page maps.
    #[must_use]
    pub const fn shared_zero_frame(&self) -> &FrameHandle {
        &self.shared_zero
    }

    #[must_use]
    pub fn is_shared_zero(&self, frame: &FrameHandle) -> bool {
        FrameHandle::ptr_eq(frame, &self.shared_zero)
    }

    /// Whether a write to `frame` must first move to a private copy.
    ///
    /// True for the shared zero frame and for returnable frames with more than
    /// one owner. Non-returnable frames (device memory) are written in place.
    ///
    /// Every live [`FrameHandle`] counts as an owner, including one a caller
    /// kept from [`VmObject::slot_at`] or [`VmObject::populate_or_cow`].
    #[must_use]
    pub fn needs_copy(&self, frame: &FrameHandle) -> bool {
        self.is_shared_zero(frame) || (frame.is_returnable() && frame.ref_count() > 1)
    }

    /// One frame from the uncommitted share of the pool.
    ///
    /// If the pool is exhausted, volatile memory is purged and the allocation
    /// retried once.
    #[must_use]
    pub fn allocate_frame(&self) -> Option<FrameHandle> {
        if let Some(frame) = self.pool.allocate_frame() {
            return Some(frame);
        }
        if self.purge_volatile() == 0 {
            return None;
        }
        debug!("retrying allocation after purge");
        self.pool.allocate_frame()
    }

    /// Purge every registered object with volatile pages; returns the pages released.
    ///
    /// Objects that are busy (their slot lock is held) are left alone.
    pub fn purge_volatile(&self) -> usize {
        let objects: Vec<_> = {
            let mut registry = self.purgeable.lock();
            registry.retain(|weak| weak.strong_count() > 0);
            registry.iter().filter_map(Weak::upgrade).collect()
        };
        let purged: usize = objects.iter().map(|object| object.try_purge()).sum();
        if purged > 0 {
            info!("purged {purged} volatile pages from {} objects", objects.len());
        }
        purged
    }

    pub(crate) fn register_purgeable(&self, object: &Arc<VmObject>) {
        let mut registry = self.purgeable.lock();
        registry.retain(|weak| weak.strong_count() > 0);
        if !registry.iter().any(|weak| ptr::eq(weak.as_ptr(), Arc::as_ptr(object))) {
            registry.push(Arc::downgrade(object));
        }
    }

    /// Copy `buf.len()` bytes out of `frame`, starting at `offset`.
    ///
    /// # Errors
    /// [`VmError::ByteRange`] if the range leaves the frame.
    pub fn read_frame(&self, frame: &FrameHandle, offset: usize, buf: &mut [u8]) -> Result<(), VmError> {
        check_byte_range(offset, buf.len())?;
        // SAFETY: the handle keeps the frame allocated; the range is checked.
        unsafe { phys_mapper::read_bytes(self.mapper(), frame.paddr(), offset, buf) };
        Ok(())
    }

    /// Copy `data` into `frame`, starting at `offset`.
    ///
    /// # Errors
    /// [`VmError::ProtocolViolation`] when targeting the shared zero frame,
    /// [`VmError::ByteRange`] if the range leaves the frame.
    pub fn write_frame(&self, frame: &FrameHandle, offset: usize, data: &[u8]) -> Result<(), VmError> {
        if self.is_shared_zero(frame) {
            return Err(VmError::ProtocolViolation("write through the shared zero frame"));
        }
        check_byte_range(offset, data.len())?;
        // SAFETY: the handle keeps the frame allocated; the range is checked.
        unsafe { phys_mapper::write_bytes(self.mapper(), frame.paddr(), offset, data) };
        Ok(())
    }

    pub(crate) fn zero_frame(&self, frame: &FrameHandle) {
        debug_assert!(!self.is_shared_zero(frame));
        // SAFETY: callers pass frames they hold exclusively (fresh allocations).
        unsafe { phys_mapper::zero_frame(self.mapper(), frame.paddr()) };
    }

    pub(crate) fn copy_frame(&self, src: &FrameHandle, dst: &FrameHandle) {
        debug_assert!(!self.is_shared_zero(dst));
        // SAFETY: both handles keep their frames allocated; `dst` is a fresh
        // allocation only the caller can see.
        unsafe { phys_mapper::copy_frame(self.mapper(), src.paddr(), dst.paddr()) };
    }

    /// Run `f` over the bytes of `frame`.
    pub(crate) fn with_frame_bytes<R>(&self, frame: &FrameHandle, f: impl FnOnce(&[u8]) -> R) -> R {
        let ptr = self.mapper.phys_to_ptr(frame.paddr());
        // SAFETY: the handle keeps the frame allocated and mapped for the call.
        let bytes = unsafe { slice::from_raw_parts(ptr.cast_const(), FRAME_BYTES) };
        f(bytes)
    }

    /// Run `f` over the bytes of `frame` mutably.
    ///
    /// Callers hold the slot lock of the only object allowed to write `frame`.
    pub(crate) fn with_frame_bytes_mut<R>(&self, frame: &FrameHandle, f: impl FnOnce(&mut [u8]) -> R) -> R {
        debug_assert!(!self.is_shared_zero(frame));
        let ptr = self.mapper.phys_to_ptr(frame.paddr());
        // SAFETY: the handle keeps the frame allocated; writers are serialized
        // by the owning object's slot lock.
        let bytes = unsafe { slice::from_raw_parts_mut(ptr, FRAME_BYTES) };
        f(bytes)
    }

    pub(crate) fn register_inode_object(&self, inode: InodeId, object: &Arc<VmObject>) {
        self.inode_objects
            .lock()
            .entry(inode)
            .or_default()
            .push(Arc::downgrade(object));
    }

    /// Return the live shared object of `inode`, creating it if there is none.
    pub(crate) fn shared_inode_object(
        &self,
        inode: InodeId,
        create: impl FnOnce() -> Arc<VmObject>,
    ) -> Arc<VmObject> {
        let mut registry = self.inode_objects.lock();
        let entry = registry.entry(inode).or_default();
        entry.retain(|weak| weak.strong_count() > 0);

        if let Some(existing) = entry
            .iter()
            .filter_map(Weak::upgrade)
            .find(|object| object.kind() == VmObjectKind::SharedInode)
        {
            return existing;
        }

        let object = create();
        entry.push(Arc::downgrade(&object));
        object
    }

    /// Live objects backed by `inode`, pruning dead registrations.
    #[must_use]
    pub fn inode_objects(&self, inode: InodeId) -> Vec<Arc<VmObject>> {
        let mut registry = self.inode_objects.lock();
        let Some(entry) = registry.get_mut(&inode) else {
            return Vec::new();
        };
        let live: Vec<_> = entry.iter().filter_map(Weak::upgrade).collect();
        entry.retain(|weak| weak.strong_count() > 0);
        if entry.is_empty() {
            registry.remove(&inode);
        }
        live
    }

    /// Tell every live object of `inode` that `[offset, offset + len)` was rewritten.
    ///
    /// Returns the number of objects updated.
    pub fn inode_contents_changed(&self, inode: InodeId, offset: u64, len: u64) -> usize {
        let objects = self.inode_objects(inode);
        let updated = objects
            .iter()
            .filter(|object| match object.inode_contents_changed(offset, len) {
                Ok(()) => true,
                Err(e) => {
                    warn!("inode {inode}: content change not applied to {} object: {e}", object.kind());
                    false
                }
            })
            .count();
        debug!("inode {inode}: bytes {offset}+{len} changed, {updated} objects updated");
        updated
    }

    /// Tell every live object of `inode` that its size went from `old_size` to `new_size`.
    ///
    /// Returns the number of objects updated.
    pub fn inode_size_changed(&self, inode: InodeId, old_size: u64, new_size: u64) -> usize {
        let objects = self.inode_objects(inode);
        let updated = objects
            .iter()
            .filter(|object| match object.inode_size_changed(old_size, new_size) {
                Ok(()) => true,
                Err(e) => {
                    warn!("inode {inode}: resize not applied to {} object: {e}", object.kind());
                    false
                }
            })
            .count();
        debug!("inode {inode}: size {old_size} -> {new_size}, {updated} objects updated");
        updated
    }
}

impl fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryManager")
            .field("total_frames", &self.pool.total_frames())
            .field("available", &self.pool.available())
            .field("committed", &self.pool.committed())
            .field("shared_zero", &self.shared_zero.paddr())
            .finish_non_exhaustive()
    }
}

/// Reject byte ranges that leave a frame.
pub(crate) const fn check_byte_range(offset: usize, len: usize) -> Result<(), VmError> {
    match offset.checked_add(len) {
        Some(end) if end <= FRAME_BYTES => Ok(()),
        _ => Err(VmError::ByteRange { offset, len }),
    }
}
