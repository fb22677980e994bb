//! # Inode-backed memory objects
//!
//! File mappings come in two flavours:
//!
//! - **Shared** (`MAP_SHARED`): one object per inode. Every mapping aliases it,
//!   writes land in the page frames directly and reach the file on
//!   [`sync`](VmObject::sync).
//! - **Private** (`MAP_PRIVATE`): each mapping gets its own object. Pages are
//!   loaded from the inode, and written pages become private copies that never
//!   reach the file.
//!
//! Both track which pages were written in a dirty bitmap. Clean pages can be
//! dropped at any time ([`release_all_clean_pages`](VmObject::release_all_clean_pages))
//! because the next fault reloads them from the inode.
//!
//! ## Locking
//!
//! Faults and reclamation on one object serialize on its slot lock. A fault
//! keeps the lock while it reads the inode, so reclamation never sees a
//! half-loaded page and a fault after reclamation simply reloads.

use crate::fault::Access;
use crate::page_bitmap::PageBitmap;
use crate::vmobject::{Backing, Pages};
use crate::{MemoryManager, VmError, VmObject};
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use kernel_alloc::FrameHandle;
use kernel_memory_addresses::FRAME_SIZE;
use log::{debug, trace, warn};

/// Identifies an inode across the registry.
pub type InodeId = u64;

/// The file-layer collaborator backing an inode object.
pub trait Inode: Send + Sync {
    fn identifier(&self) -> InodeId;

    /// Current size in bytes.
    fn size(&self) -> u64;

    /// Read up to `buf.len()` bytes at `offset`; returns the number read.
    ///
    /// # Errors
    /// [`InodeError`] if the backing store fails or `offset` is past the end.
    fn read_bytes(&self, offset: u64, buf: &mut [u8]) -> Result<usize, InodeError>;

    /// Write `data` at `offset`; returns the number of bytes written.
    ///
    /// # Errors
    /// [`InodeError`] if the backing store fails or `offset` is past the end.
    fn write_bytes(&self, offset: u64, data: &[u8]) -> Result<usize, InodeError>;
}

/// Errors reported by an [`Inode`].
#[derive(Debug, thiserror::Error, Copy, Clone, Eq, PartialEq)]
pub enum InodeError {
    #[error("I/O error")]
    Io,
    #[error("offset {0} lies beyond the end of the inode")]
    OutOfBounds(u64),
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum Sharing {
    Shared,
    Private,
}

pub(crate) struct InodeState {
    inode: Arc<dyn Inode>,
    dirty: PageBitmap,
}

impl InodeState {
    fn new(inode: Arc<dyn Inode>) -> (Self, usize) {
        let pages = page_count_for(inode.size());
        let state = Self {
            inode,
            dirty: PageBitmap::new(pages),
        };
        (state, pages)
    }

    pub(crate) fn inode(&self) -> &Arc<dyn Inode> {
        &self.inode
    }

    /// Independent state for a private clone: same inode, copied dirty bits.
    pub(crate) fn duplicate(&self) -> Self {
        Self {
            inode: self.inode.clone(),
            dirty: self.dirty.clone(),
        }
    }

    pub(crate) fn resolve(
        &mut self,
        mm: &MemoryManager,
        slot: &mut Option<FrameHandle>,
        index: usize,
        access: Access,
        sharing: Sharing,
    ) -> Result<FrameHandle, VmError> {
        let current = match slot.take() {
            Some(frame) => frame,
            None => self.load_page(mm, index)?,
        };

        let frame = if access == Access::Write && sharing == Sharing::Private && mm.needs_copy(&current) {
            match allocate_frame(mm) {
                Ok(fresh) => {
                    trace!("private inode copy-on-write of page {index}");
                    mm.copy_frame(&current, &fresh);
                    fresh
                }
                Err(e) => {
                    *slot = Some(current);
                    return Err(e);
                }
            }
        } else {
            current
        };

        if access == Access::Write {
            self.dirty.set(index);
        }
        *slot = Some(frame.clone());
        Ok(frame)
    }

    /// Fresh frame holding page `index` of the inode, zero past the end.
    fn load_page(&self, mm: &MemoryManager, index: usize) -> Result<FrameHandle, VmError> {
        let frame = allocate_frame(mm)?;
        let offset = index as u64 * FRAME_SIZE;
        #[allow(clippy::cast_possible_truncation)]
        let len = self.inode.size().saturating_sub(offset).min(FRAME_SIZE) as usize;

        let read = mm.with_frame_bytes_mut(&frame, |bytes| {
            let read = if len == 0 {
                0
            } else {
                self.inode.read_bytes(offset, &mut bytes[..len])?.min(len)
            };
            bytes[read..].fill(0);
            Ok::<_, InodeError>(read)
        })?;

        trace!(
            "loaded page {index} of inode {}: {read} bytes",
            self.inode.identifier()
        );
        Ok(frame)
    }
}

fn allocate_frame(mm: &MemoryManager) -> Result<FrameHandle, VmError> {
    mm.allocate_frame().ok_or_else(|| {
        warn!("inode fault: out of memory");
        VmError::OutOfMemory
    })
}

fn page_count_for(size: u64) -> usize {
    usize::try_from(size.div_ceil(FRAME_SIZE)).unwrap_or(usize::MAX)
}

impl VmObject {
    /// The shared object of `inode`, created on first use.
    ///
    /// Every `MAP_SHARED` mapping of one inode gets the same instance.
    #[must_use]
    pub fn create_shared_inode(mm: &Arc<MemoryManager>, inode: Arc<dyn Inode>) -> Arc<Self> {
        let id = inode.identifier();
        mm.shared_inode_object(id, || {
            let (state, pages) = InodeState::new(inode);
            debug!("shared inode object for inode {id}: {pages} pages");
            Self::new(mm.clone(), vec![None; pages], Backing::SharedInode(state))
        })
    }

    /// A new private object over `inode`.
    #[must_use]
    pub fn create_private_inode(mm: &Arc<MemoryManager>, inode: Arc<dyn Inode>) -> Arc<Self> {
        let id = inode.identifier();
        let (state, pages) = InodeState::new(inode);
        debug!("private inode object for inode {id}: {pages} pages");
        let object = Self::new(mm.clone(), vec![None; pages], Backing::PrivateInode(state));
        mm.register_inode_object(id, &object);
        object
    }

    /// The backing inode, for inode objects.
    #[must_use]
    pub fn inode(&self) -> Option<Arc<dyn Inode>> {
        self.lock()
            .backing
            .inode_state()
            .map(|(state, _)| state.inode().clone())
    }

    /// Pages whose contents differ from the inode.
    ///
    /// For objects without an inode every resident page counts as dirty,
    /// since none of them can be recovered.
    #[must_use]
    pub fn amount_dirty(&self) -> usize {
        let dirty = self
            .lock()
            .backing
            .inode_state()
            .map(|(state, _)| state.dirty.count_ones());
        dirty.unwrap_or_else(|| self.resident_pages())
    }

    /// Populated pages that could be reloaded from the inode.
    #[must_use]
    pub fn amount_clean(&self) -> usize {
        let pages = self.lock();
        match pages.backing.inode_state() {
            Some((state, _)) => pages
                .slots
                .iter()
                .enumerate()
                .filter(|(i, slot)| slot.is_some() && !state.dirty.get(*i))
                .count(),
            None => 0,
        }
    }

    /// Drop every clean populated page; returns how many were released.
    ///
    /// # Errors
    /// [`VmError::ProtocolViolation`] on objects without an inode.
    pub fn release_all_clean_pages(&self) -> Result<usize, VmError> {
        let mut pages = self.lock();
        let Pages { slots, backing } = &mut *pages;
        let (state, _) = backing
            .inode_state_mut()
            .ok_or(VmError::ProtocolViolation("reclaiming clean pages of a non-inode object"))?;

        let mut released = 0;
        for (index, slot) in slots.iter_mut().enumerate() {
            if slot.is_some() && !state.dirty.get(index) {
                *slot = None;
                released += 1;
            }
        }
        debug!(
            "released {released} clean pages of inode {}",
            state.inode.identifier()
        );
        Ok(released)
    }

    /// The inode rewrote `[offset, offset + len)` behind our back.
    ///
    /// Clean pages in the range are dropped and reload on the next fault.
    /// Dirty pages of a shared object get the new bytes merged in; dirty pages
    /// of a private object belong to the mapping and are left alone.
    ///
    /// # Errors
    /// [`VmError::ProtocolViolation`] on objects without an inode,
    /// [`VmError::Inode`] if merging fails.
    pub fn inode_contents_changed(&self, offset: u64, len: u64) -> Result<(), VmError> {
        let mut pages = self.lock();
        let Pages { slots, backing } = &mut *pages;
        let (state, sharing) = backing
            .inode_state_mut()
            .ok_or(VmError::ProtocolViolation("content change on a non-inode object"))?;
        if len == 0 {
            return Ok(());
        }

        let end = offset.saturating_add(len);
        let first = usize::try_from(offset / FRAME_SIZE).unwrap_or(usize::MAX);
        let last = page_count_for(end).min(slots.len());
        let size = state.inode.size();
        let (mut released, mut merged) = (0, 0);

        for index in first..last {
            let Some(frame) = slots[index].as_ref() else {
                continue;
            };
            if !state.dirty.get(index) {
                slots[index] = None;
                released += 1;
                continue;
            }
            if sharing == Sharing::Private {
                continue;
            }

            let page_start = index as u64 * FRAME_SIZE;
            let lo = offset.max(page_start);
            let hi = end.min(page_start + FRAME_SIZE).min(size);
            if hi <= lo {
                continue;
            }
            #[allow(clippy::cast_possible_truncation)]
            let (at, n) = ((lo - page_start) as usize, (hi - lo) as usize);
            let inode = &state.inode;
            self.memory_manager()
                .with_frame_bytes_mut(frame, |bytes| inode.read_bytes(lo, &mut bytes[at..at + n]))?;
            merged += 1;
        }

        debug!(
            "inode {}: {offset}+{len} changed, {released} pages released, {merged} merged",
            state.inode.identifier()
        );
        Ok(())
    }

    /// The inode was truncated or extended from `old_size` to `new_size` bytes.
    ///
    /// # Errors
    /// [`VmError::ProtocolViolation`] on objects without an inode.
    pub fn inode_size_changed(&self, old_size: u64, new_size: u64) -> Result<(), VmError> {
        let mut pages = self.lock();
        let Pages { slots, backing } = &mut *pages;
        let (state, sharing) = backing
            .inode_state_mut()
            .ok_or(VmError::ProtocolViolation("size change on a non-inode object"))?;

        let old_pages = slots.len();
        let new_pages = page_count_for(new_size);
        slots.resize(new_pages, None);
        state.dirty.resize(new_pages);

        let tail = new_size % FRAME_SIZE;
        if new_size < old_size && tail != 0 {
            let last = new_pages - 1;
            if let Some(frame) = slots[last].as_ref() {
                if !state.dirty.get(last) {
                    slots[last] = None;
                } else if sharing == Sharing::Shared {
                    #[allow(clippy::cast_possible_truncation)]
                    let tail = tail as usize;
                    self.memory_manager()
                        .with_frame_bytes_mut(frame, |bytes| bytes[tail..].fill(0));
                }
            }
        }

        debug!(
            "inode {}: size {old_size} -> {new_size}, {old_pages} -> {new_pages} pages",
            state.inode.identifier()
        );
        Ok(())
    }

    /// Write every dirty page back to the inode; returns the pages written.
    ///
    /// # Errors
    /// [`VmError::ProtocolViolation`] on anything but a shared inode object,
    /// [`VmError::Inode`] if the inode rejects a write (the page stays dirty).
    pub fn sync(&self) -> Result<usize, VmError> {
        let mut pages = self.lock();
        let Pages { slots, backing } = &mut *pages;
        let Backing::SharedInode(state) = backing else {
            return Err(VmError::ProtocolViolation("sync requires a shared inode object"));
        };
        debug_assert_eq!(state.dirty.len(), slots.len());

        let size = state.inode.size();
        let dirty: Vec<usize> = state.dirty.ones().collect();
        let mut written = 0;
        for index in dirty {
            let Some(frame) = slots[index].as_ref() else {
                state.dirty.clear(index);
                continue;
            };
            let offset = index as u64 * FRAME_SIZE;
            if offset < size {
                #[allow(clippy::cast_possible_truncation)]
                let len = (size - offset).min(FRAME_SIZE) as usize;
                let inode = &state.inode;
                self.memory_manager()
                    .with_frame_bytes(frame, |bytes| inode.write_bytes(offset, &bytes[..len]))?;
            }
            state.dirty.clear(index);
            written += 1;
        }

        debug!("synced {written} pages of inode {}", state.inode.identifier());
        Ok(written)
    }
}
