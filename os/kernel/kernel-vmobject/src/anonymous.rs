//! Anonymous memory: zero-fill on demand, copy-on-write after fork, and
//! wrappers around physical ranges that nobody allocates.
//!
//! Pages can be marked volatile. Their contents may then be discarded when
//! memory runs short; a purged page reads as zeros, and clearing the volatile
//! mark reports whether that happened.

use crate::fault::Access;
use crate::page_bitmap::PageBitmap;
use crate::vmobject::{Backing, Pages};
use crate::{MemoryManager, VmError, VmObject};
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::ops::Range;
use kernel_alloc::FrameHandle;
use kernel_memory_addresses::{FRAME_SIZE, PhysicalAddress, Size4K};
use log::{debug, trace, warn};
use spin::Mutex;

/// How an anonymous object obtains frames for its pages.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub enum AllocationStrategy {
    /// Allocate on first write; a write fault may run out of memory.
    #[default]
    None,
    /// Commit one frame per page up front; write faults cannot fail.
    Reserve,
    /// Back every page with a zeroed private frame immediately.
    AllocateNow,
}

pub(crate) struct AnonymousState {
    strategy: AllocationStrategy,
    /// Frames still committed to this object and not yet drawn.
    unused_committed: usize,
    /// Frames committed at fork for copying shared pages, drawn by both sides.
    cow_commit: Option<Arc<CowCommit>>,
    volatile: PageBitmap,
    /// Volatile pages whose contents were discarded since the mark was set.
    purged: PageBitmap,
}

/// Frames committed when a committed object was forked.
///
/// Parent and child each hold a reference; whatever is left when the last one
/// goes away is uncommitted.
pub(crate) struct CowCommit {
    mm: Arc<MemoryManager>,
    remaining: Mutex<usize>,
}

impl CowCommit {
    fn take(&self) -> bool {
        let mut remaining = self.remaining.lock();
        if *remaining == 0 {
            return false;
        }
        *remaining -= 1;
        true
    }

    fn remaining(&self) -> usize {
        *self.remaining.lock()
    }
}

impl Drop for CowCommit {
    fn drop(&mut self) {
        let remaining = *self.remaining.get_mut();
        if remaining > 0 {
            self.mm.pool().uncommit(remaining);
        }
    }
}

impl AnonymousState {
    /// State without a reservation; clones and wrapped frames start here.
    pub(crate) fn unreserved(page_count: usize) -> Self {
        Self {
            strategy: AllocationStrategy::None,
            unused_committed: 0,
            cow_commit: None,
            volatile: PageBitmap::new(page_count),
            purged: PageBitmap::new(page_count),
        }
    }

    /// State for the child of a fork over `slots`.
    ///
    /// A committed object commits one more frame per shared page, so neither
    /// side can run out of memory copying them later. The child starts with
    /// no volatile pages.
    pub(crate) fn fork(
        &mut self,
        mm: &Arc<MemoryManager>,
        slots: &[Option<FrameHandle>],
    ) -> Result<Self, VmError> {
        let mut child = Self::unreserved(slots.len());
        if self.strategy == AllocationStrategy::None {
            return Ok(child);
        }
        let shared = slots
            .iter()
            .flatten()
            .filter(|frame| frame.is_returnable())
            .count();
        if shared == 0 {
            return Ok(child);
        }
        if !mm.pool().try_commit(shared) {
            warn!("fork of a committed object: cannot commit {shared} copy-on-write frames");
            return Err(VmError::OutOfMemory);
        }

        let commit = Arc::new(CowCommit {
            mm: mm.clone(),
            remaining: Mutex::new(shared),
        });
        self.cow_commit = Some(commit.clone());
        child.cow_commit = Some(commit);
        debug!("committed {shared} frames for copy-on-write after fork");
        Ok(child)
    }

    pub(crate) fn resolve(
        &mut self,
        mm: &MemoryManager,
        slot: &mut Option<FrameHandle>,
        access: Access,
    ) -> Result<FrameHandle, VmError> {
        if access == Access::Read {
            if let Some(frame) = slot.as_ref() {
                return Ok(frame.clone());
            }
            trace!("zero-fill read fault");
            let zero = mm.shared_zero_frame().clone();
            *slot = Some(zero.clone());
            return Ok(zero);
        }

        if let Some(frame) = slot.as_ref()
            && !mm.needs_copy(frame)
        {
            return Ok(frame.clone());
        }

        let cow = slot.as_ref().is_some_and(|old| !mm.is_shared_zero(old));
        let fresh = self.allocate_private(mm, cow)?;
        match slot.as_ref() {
            Some(old) if !mm.is_shared_zero(old) => {
                trace!("copy-on-write from {:?} to {:?}", old.paddr(), fresh.paddr());
                mm.copy_frame(old, &fresh);
            }
            _ => mm.zero_frame(&fresh),
        }

        // The private frame is installed before the old reference goes away.
        let old = slot.replace(fresh.clone());
        drop(old);
        Ok(fresh)
    }

    fn allocate_private(&mut self, mm: &MemoryManager, cow: bool) -> Result<FrameHandle, VmError> {
        let frame = if cow && self.cow_commit.as_ref().is_some_and(|commit| commit.take()) {
            mm.pool().allocate_committed()
        } else if self.unused_committed > 0 {
            self.unused_committed -= 1;
            mm.pool().allocate_committed()
        } else {
            mm.allocate_frame()
        };
        frame.ok_or_else(|| {
            warn!("anonymous write fault: out of memory");
            VmError::OutOfMemory
        })
    }

    /// Drop every exclusively owned frame of a volatile page.
    ///
    /// Frames shared with a fork stay, since dropping them frees nothing.
    /// A committed object recommits the released frames so its later write
    /// faults keep their guarantee.
    fn purge(&mut self, mm: &MemoryManager, slots: &mut [Option<FrameHandle>]) -> usize {
        let mut released = Vec::new();
        for index in self.volatile.ones() {
            if let Some(frame) = slots[index].take_if(|frame| frame.is_returnable() && frame.ref_count() == 1) {
                released.push(frame);
                self.purged.set(index);
            }
        }
        let count = released.len();
        if count == 0 {
            return 0;
        }

        if self.strategy == AllocationStrategy::None {
            drop(released);
        } else {
            let granted = mm.pool().release_and_commit(released);
            self.unused_committed += granted;
            if granted < count {
                warn!("purge recommitted {granted} of {count} frames");
            }
        }
        debug!("purged {count} volatile pages");
        count
    }

    pub(crate) fn release_reservation(&mut self, mm: &MemoryManager) {
        if self.unused_committed > 0 {
            mm.pool().uncommit(self.unused_committed);
            self.unused_committed = 0;
        }
    }
}

impl VmObject {
    /// Anonymous object of `page_count` pages.
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`] if `Reserve` cannot commit or `AllocateNow`
    /// cannot allocate every page.
    pub fn create_with_size(
        mm: &Arc<MemoryManager>,
        page_count: usize,
        strategy: AllocationStrategy,
    ) -> Result<Arc<Self>, VmError> {
        let mut state = AnonymousState {
            strategy,
            ..AnonymousState::unreserved(page_count)
        };

        let slots = match strategy {
            AllocationStrategy::None => vec![None; page_count],
            AllocationStrategy::Reserve => {
                if !mm.pool().try_commit(page_count) {
                    return Err(VmError::OutOfMemory);
                }
                state.unused_committed = page_count;
                vec![None; page_count]
            }
            AllocationStrategy::AllocateNow => {
                if !mm.pool().try_commit(page_count) {
                    return Err(VmError::OutOfMemory);
                }
                state.unused_committed = page_count;
                let mut slots = Vec::with_capacity(page_count);
                for _ in 0..page_count {
                    match state.allocate_private(mm, false) {
                        Ok(frame) => {
                            mm.zero_frame(&frame);
                            slots.push(Some(frame));
                        }
                        Err(e) => {
                            state.release_reservation(mm);
                            return Err(e);
                        }
                    }
                }
                slots
            }
        };

        debug!("anonymous object of {page_count} pages ({strategy:?})");
        Ok(Self::new(mm.clone(), slots, Backing::Anonymous(state)))
    }

    /// Anonymous object over the fixed physical range `[base, base + page_count pages)`.
    ///
    /// The frames are wrapped non-returnable and written in place, never copied.
    ///
    /// # Errors
    /// [`VmError::ProtocolViolation`] if `base` is not page aligned or the
    /// range overflows.
    pub fn create_for_physical_range(
        mm: &Arc<MemoryManager>,
        base: PhysicalAddress,
        page_count: usize,
    ) -> Result<Arc<Self>, VmError> {
        if !base.is_aligned::<Size4K>() {
            return Err(VmError::ProtocolViolation("physical range is not page aligned"));
        }
        (page_count as u64)
            .checked_mul(FRAME_SIZE)
            .and_then(|bytes| base.checked_add(bytes))
            .ok_or(VmError::ProtocolViolation("physical range overflows"))?;

        let slots = (0..page_count as u64)
            .map(|i| Some(FrameHandle::non_returnable(base + i * FRAME_SIZE)))
            .collect();
        Ok(Self::new(
            mm.clone(),
            slots,
            Backing::Anonymous(AnonymousState::unreserved(page_count)),
        ))
    }

    /// Single-page anonymous object holding `frame`.
    #[must_use]
    pub fn create_with_physical_page(mm: &Arc<MemoryManager>, frame: FrameHandle) -> Arc<Self> {
        Self::create_with_physical_pages(mm, vec![frame])
    }

    /// Anonymous object holding `frames` in order.
    #[must_use]
    pub fn create_with_physical_pages(mm: &Arc<MemoryManager>, frames: Vec<FrameHandle>) -> Arc<Self> {
        let state = AnonymousState::unreserved(frames.len());
        let slots = frames.into_iter().map(Some).collect();
        Self::new(mm.clone(), slots, Backing::Anonymous(state))
    }

    /// Allocation strategy of an anonymous object.
    #[must_use]
    pub fn allocation_strategy(&self) -> Option<AllocationStrategy> {
        match &self.lock().backing {
            Backing::Anonymous(state) => Some(state.strategy),
            _ => None,
        }
    }

    /// Frames still committed to this object.
    #[must_use]
    pub fn unused_committed_pages(&self) -> usize {
        match &self.lock().backing {
            Backing::Anonymous(state) => state.unused_committed,
            _ => 0,
        }
    }

    /// Frames still committed for copying pages shared by a fork.
    #[must_use]
    pub fn committed_cow_pages(&self) -> usize {
        match &self.lock().backing {
            Backing::Anonymous(state) => state.cow_commit.as_ref().map_or(0, |commit| commit.remaining()),
            _ => 0,
        }
    }

    /// Mark pages `range` volatile or not.
    ///
    /// Returns whether any page in the range was purged while volatile; the
    /// purged marks are cleared when the range stops being volatile.
    ///
    /// # Errors
    /// [`VmError::ProtocolViolation`] on non-anonymous objects or an inverted
    /// range, [`VmError::InvalidRange`] past the end.
    pub fn set_volatile(self: &Arc<Self>, range: Range<usize>, volatile: bool) -> Result<bool, VmError> {
        if range.start > range.end {
            return Err(VmError::ProtocolViolation("inverted page range"));
        }
        let mut pages = self.lock();
        if range.end > 0 {
            pages.check_index(range.end - 1)?;
        }
        let Backing::Anonymous(state) = &mut pages.backing else {
            return Err(VmError::ProtocolViolation("volatile pages on a non-anonymous object"));
        };

        let was_purged = range.clone().any(|index| state.purged.get(index));
        for index in range.clone() {
            if volatile {
                state.volatile.set(index);
            } else {
                state.volatile.clear(index);
                state.purged.clear(index);
            }
        }
        drop(pages);

        trace!("pages {range:?} volatile: {volatile}");
        if volatile {
            self.memory_manager().register_purgeable(self);
        }
        Ok(was_purged)
    }

    /// Whether any page is currently marked volatile.
    #[must_use]
    pub fn is_any_volatile(&self) -> bool {
        match &self.lock().backing {
            Backing::Anonymous(state) => state.volatile.count_ones() > 0,
            _ => false,
        }
    }

    /// Discard the contents of every volatile page; returns the pages released.
    pub fn purge(&self) -> usize {
        purge_locked(self.memory_manager(), &mut self.lock())
    }
}

/// Purge an object whose slot lock the caller holds.
pub(crate) fn purge_locked(mm: &MemoryManager, pages: &mut Pages) -> usize {
    let Pages { slots, backing } = pages;
    match backing {
        Backing::Anonymous(state) => state.purge(mm, slots),
        _ => 0,
    }
}
