//! # Memory objects
//!
//! A [`VmObject`] is an ordered array of page slots, each empty or holding a
//! [`FrameHandle`], plus the backing that decides how slots get populated and
//! what cloning means:
//!
//! | Kind | Populated by | Clone (fork) |
//! |------|--------------|--------------|
//! | [`Anonymous`](VmObjectKind::Anonymous) | zero frame on read, private frame on write | new object sharing every frame (copy-on-write) |
//! | [`SharedInode`](VmObjectKind::SharedInode) | inode contents | the same object |
//! | [`PrivateInode`](VmObjectKind::PrivateInode) | inode contents | new object sharing every frame (copy-on-write) |
//! | [`Contiguous`](VmObjectKind::Contiguous) | one physical run at creation | deep copy into a new run |
//!
//! ## Slot lifecycle (anonymous)
//!
//! ```text
//!  Empty ──read──► Populated(zero frame) ──write──► Populated(private)
//!    │                                                 ▲      │
//!    └────────────────────write────────────────────────┘      │ clone
//!                                                             ▼
//!                                          Populated(shared) ──write──► Populated(private copy)
//! ```
//!
//! Every slot mutation happens under the object's slot lock. Frame reference
//! counts are shared with other objects and are only ever compared, never
//! assumed stable, outside that lock.

use crate::anonymous::AnonymousState;
use crate::fault::Access;
use crate::inode::{InodeError, InodeState, Sharing};
use crate::manager::check_byte_range;
use crate::{MemoryManager, anonymous, contiguous};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use kernel_alloc::FrameHandle;
use kernel_memory_addresses::{FRAME_SIZE, PhysicalAddress};
use log::{debug, trace};
use spin::Mutex;

/// Which variant a [`VmObject`] is.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum VmObjectKind {
    Anonymous,
    SharedInode,
    PrivateInode,
    Contiguous,
}

impl VmObjectKind {
    #[must_use]
    pub const fn class_name(self) -> &'static str {
        match self {
            Self::Anonymous => "AnonymousVMObject",
            Self::SharedInode => "SharedInodeVMObject",
            Self::PrivateInode => "PrivateInodeVMObject",
            Self::Contiguous => "ContiguousVMObject",
        }
    }

    #[must_use]
    pub const fn is_inode(self) -> bool {
        matches!(self, Self::SharedInode | Self::PrivateInode)
    }
}

impl fmt::Display for VmObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.class_name())
    }
}

/// Per-variant state, guarded together with the slots.
pub(crate) enum Backing {
    Anonymous(AnonymousState),
    SharedInode(InodeState),
    PrivateInode(InodeState),
    Contiguous,
}

impl Backing {
    const fn kind(&self) -> VmObjectKind {
        match self {
            Self::Anonymous(_) => VmObjectKind::Anonymous,
            Self::SharedInode(_) => VmObjectKind::SharedInode,
            Self::PrivateInode(_) => VmObjectKind::PrivateInode,
            Self::Contiguous => VmObjectKind::Contiguous,
        }
    }

    pub(crate) fn inode_state(&self) -> Option<(&InodeState, Sharing)> {
        match self {
            Self::SharedInode(state) => Some((state, Sharing::Shared)),
            Self::PrivateInode(state) => Some((state, Sharing::Private)),
            Self::Anonymous(_) | Self::Contiguous => None,
        }
    }

    pub(crate) fn inode_state_mut(&mut self) -> Option<(&mut InodeState, Sharing)> {
        match self {
            Self::SharedInode(state) => Some((state, Sharing::Shared)),
            Self::PrivateInode(state) => Some((state, Sharing::Private)),
            Self::Anonymous(_) | Self::Contiguous => None,
        }
    }
}

/// Everything behind the slot lock.
pub(crate) struct Pages {
    pub(crate) slots: Vec<Option<FrameHandle>>,
    pub(crate) backing: Backing,
}

impl Pages {
    pub(crate) fn check_index(&self, index: usize) -> Result<(), VmError> {
        let page_count = self.slots.len();
        debug_assert!(
            index < page_count,
            "page index {index} out of range for {page_count} pages"
        );
        if index < page_count {
            Ok(())
        } else {
            Err(VmError::InvalidRange { index, page_count })
        }
    }

    /// Make slot `index` usable for `access` and return its frame.
    pub(crate) fn resolve(
        &mut self,
        mm: &MemoryManager,
        index: usize,
        access: Access,
    ) -> Result<FrameHandle, VmError> {
        self.check_index(index)?;
        let slot = &mut self.slots[index];
        match &mut self.backing {
            Backing::Anonymous(state) => state.resolve(mm, slot, access),
            Backing::SharedInode(state) => state.resolve(mm, slot, index, access, Sharing::Shared),
            Backing::PrivateInode(state) => state.resolve(mm, slot, index, access, Sharing::Private),
            Backing::Contiguous => slot
                .clone()
                .ok_or(VmError::ProtocolViolation("contiguous object with an empty slot")),
        }
    }
}

/// A backing-store object for a range of virtual memory.
pub struct VmObject {
    mm: Arc<MemoryManager>,
    kind: VmObjectKind,
    pages: Mutex<Pages>,
}

impl VmObject {
    pub(crate) fn new(mm: Arc<MemoryManager>, slots: Vec<Option<FrameHandle>>, backing: Backing) -> Arc<Self> {
        let kind = backing.kind();
        trace!("new {kind} of {} pages", slots.len());
        Arc::new(Self {
            mm,
            kind,
            pages: Mutex::new(Pages { slots, backing }),
        })
    }

    #[must_use]
    pub const fn kind(&self) -> VmObjectKind {
        self.kind
    }

    #[must_use]
    pub const fn memory_manager(&self) -> &Arc<MemoryManager> {
        &self.mm
    }

    pub(crate) fn lock(&self) -> spin::MutexGuard<'_, Pages> {
        self.pages.lock()
    }

    /// Purge volatile pages unless the slot lock is already held.
    pub(crate) fn try_purge(&self) -> usize {
        self.pages
            .try_lock()
            .map_or(0, |mut pages| anonymous::purge_locked(&self.mm, &mut pages))
    }

    #[must_use]
    pub fn page_count(&self) -> usize {
        self.pages.lock().slots.len()
    }

    #[must_use]
    pub fn size_in_bytes(&self) -> u64 {
        self.page_count() as u64 * FRAME_SIZE
    }

    /// Current content of slot `page_index`, without faulting.
    ///
    /// The returned handle is an owner of the frame. Holding it makes the
    /// object copy the page on its next write; drop it once inspected.
    ///
    /// # Errors
    /// [`VmError::InvalidRange`] for an index past the end (asserts in debug builds).
    pub fn slot_at(&self, page_index: usize) -> Result<Option<FrameHandle>, VmError> {
        let pages = self.pages.lock();
        pages.check_index(page_index)?;
        Ok(pages.slots[page_index].clone())
    }

    /// Populate slot `page_index`, resolving copy-on-write for writes.
    ///
    /// As with [`slot_at`](Self::slot_at), a retained handle forces the next
    /// write fault to copy. Callers that only install a mapping should use
    /// [`map_page`](Self::map_page).
    ///
    /// # Errors
    /// - [`VmError::OutOfMemory`] if a frame was needed and none is left.
    /// - [`VmError::InvalidRange`] for an index past the end (asserts in debug builds).
    /// - [`VmError::Inode`] if an inode page could not be read.
    pub fn populate_or_cow(&self, page_index: usize, write: bool) -> Result<FrameHandle, VmError> {
        let access = if write { Access::Write } else { Access::Read };
        self.pages.lock().resolve(&self.mm, page_index, access)
    }

    /// Populate slot `page_index` like [`populate_or_cow`](Self::populate_or_cow)
    /// and return only the frame address, leaving the slot the sole owner.
    ///
    /// # Errors
    /// As [`populate_or_cow`](Self::populate_or_cow).
    pub fn map_page(&self, page_index: usize, write: bool) -> Result<PhysicalAddress, VmError> {
        self.populate_or_cow(page_index, write).map(|frame| frame.paddr())
    }

    /// Read bytes of page `page_index` as a faulting read would see them.
    ///
    /// # Errors
    /// As [`populate_or_cow`](Self::populate_or_cow), plus [`VmError::ByteRange`].
    pub fn read(&self, page_index: usize, offset: usize, buf: &mut [u8]) -> Result<(), VmError> {
        check_byte_range(offset, buf.len())?;
        let frame = self.pages.lock().resolve(&self.mm, page_index, Access::Read)?;
        self.mm.read_frame(&frame, offset, buf)
    }

    /// Write bytes into page `page_index`, taking the write-fault path first.
    ///
    /// # Errors
    /// As [`populate_or_cow`](Self::populate_or_cow), plus [`VmError::ByteRange`].
    pub fn write(&self, page_index: usize, offset: usize, data: &[u8]) -> Result<(), VmError> {
        check_byte_range(offset, data.len())?;
        let mut pages = self.pages.lock();
        let frame = pages.resolve(&self.mm, page_index, Access::Write)?;
        self.mm.write_frame(&frame, offset, data)
    }

    /// Clone for fork.
    ///
    /// Shared inode objects return themselves. Anonymous and private inode
    /// objects return a new object sharing every frame; both sides copy on
    /// their next write. Contiguous objects are deep-copied.
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`] if a contiguous copy cannot be allocated or a
    /// committed anonymous object cannot commit frames for its shared pages;
    /// no partial clone is left behind.
    pub fn try_clone(self: &Arc<Self>) -> Result<Arc<Self>, VmError> {
        let mut pages = self.pages.lock();
        let Pages { slots, backing } = &mut *pages;
        let (backing, inode) = match backing {
            Backing::SharedInode(_) => return Ok(Arc::clone(self)),
            Backing::Contiguous => return contiguous::deep_copy(&self.mm, slots),
            Backing::Anonymous(state) => (Backing::Anonymous(state.fork(&self.mm, slots)?), None),
            Backing::PrivateInode(state) => (
                Backing::PrivateInode(state.duplicate()),
                Some(state.inode().identifier()),
            ),
        };
        // Every frame gains its new reference here, while the source still
        // holds its own; nothing is released on this path.
        let slots = slots.clone();
        drop(pages);

        let child = Self::new(self.mm.clone(), slots, backing);
        if let Some(inode) = inode {
            self.mm.register_inode_object(inode, &child);
        }
        debug!("cloned {} of {} pages", self.kind, child.page_count());
        Ok(child)
    }

    /// Populated pages not backed by the shared zero frame.
    #[must_use]
    pub fn resident_pages(&self) -> usize {
        let pages = self.pages.lock();
        pages
            .slots
            .iter()
            .flatten()
            .filter(|frame| !self.mm.is_shared_zero(frame))
            .count()
    }

    /// Resident pages whose frame is also referenced elsewhere.
    #[must_use]
    pub fn shared_pages(&self) -> usize {
        let pages = self.pages.lock();
        pages
            .slots
            .iter()
            .flatten()
            .filter(|frame| !self.mm.is_shared_zero(frame) && frame.ref_count() > 1)
            .count()
    }

    /// Populated pages whose next write would copy.
    #[must_use]
    pub fn cow_pages(&self) -> usize {
        let pages = self.pages.lock();
        match pages.backing {
            Backing::Anonymous(_) | Backing::PrivateInode(_) => pages
                .slots
                .iter()
                .flatten()
                .filter(|frame| self.mm.needs_copy(frame))
                .count(),
            Backing::SharedInode(_) | Backing::Contiguous => 0,
        }
    }
}

impl Drop for VmObject {
    fn drop(&mut self) {
        let pages = self.pages.get_mut();
        if let Backing::Anonymous(state) = &mut pages.backing {
            state.release_reservation(&self.mm);
        }
        trace!("dropping {} of {} pages", self.kind, pages.slots.len());
    }
}

impl fmt::Debug for VmObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmObject")
            .field("kind", &self.kind)
            .field("pages", &self.page_count())
            .finish_non_exhaustive()
    }
}

/// Errors reported by memory objects.
#[derive(Debug, thiserror::Error, Copy, Clone, Eq, PartialEq)]
pub enum VmError {
    #[error("out of memory")]
    OutOfMemory,
    #[error("page index {index} out of range for an object of {page_count} pages")]
    InvalidRange { index: usize, page_count: usize },
    #[error("byte range {offset}+{len} exceeds the frame size")]
    ByteRange { offset: usize, len: usize },
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),
    #[error("inode error: {0}")]
    Inode(#[from] InodeError),
}
