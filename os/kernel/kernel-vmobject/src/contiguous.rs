//! Physically contiguous memory for devices that DMA into it.
//!
//! All pages are backed at creation by one run from a single zone and stay
//! populated for the object's lifetime. Contiguity cannot survive
//! copy-on-write, so a clone copies every page into a new run.

use crate::vmobject::Backing;
use crate::{MemoryManager, VmError, VmObject};
use alloc::sync::Arc;
use kernel_alloc::FrameHandle;
use kernel_memory_addresses::PhysicalAddress;
use log::{debug, warn};

impl VmObject {
    /// Contiguous object of `page_count` zeroed pages.
    ///
    /// # Errors
    /// [`VmError::OutOfMemory`] if no zone holds a large enough free run.
    pub fn create_contiguous(mm: &Arc<MemoryManager>, page_count: usize) -> Result<Arc<Self>, VmError> {
        let frames = allocate_run(mm, page_count)?;
        for frame in &frames {
            mm.zero_frame(frame);
        }
        debug!("contiguous object of {page_count} pages at {:?}", frames.first().map(FrameHandle::paddr));
        Ok(Self::new(mm.clone(), frames.into_iter().map(Some).collect(), Backing::Contiguous))
    }

    /// Physical address of the first page of a contiguous object.
    #[must_use]
    pub fn physical_base(&self) -> Option<PhysicalAddress> {
        let pages = self.lock();
        match pages.backing {
            Backing::Contiguous => pages.slots.first().and_then(|slot| slot.as_ref()).map(FrameHandle::paddr),
            _ => None,
        }
    }
}

fn allocate_run(mm: &MemoryManager, page_count: usize) -> Result<alloc::vec::Vec<FrameHandle>, VmError> {
    let run = mm.pool().allocate_contiguous(page_count).or_else(|| {
        if mm.purge_volatile() == 0 {
            return None;
        }
        mm.pool().allocate_contiguous(page_count)
    });
    run.ok_or_else(|| {
        warn!("no contiguous run of {page_count} frames left");
        VmError::OutOfMemory
    })
}

/// Copy `slots` into a fresh contiguous object.
pub(crate) fn deep_copy(
    mm: &Arc<MemoryManager>,
    slots: &[Option<FrameHandle>],
) -> Result<Arc<VmObject>, VmError> {
    let frames = allocate_run(mm, slots.len())?;
    for (src, dst) in slots.iter().zip(&frames) {
        match src {
            Some(src) => mm.copy_frame(src, dst),
            None => mm.zero_frame(dst),
        }
    }
    debug!("deep-copied contiguous object of {} pages", slots.len());
    Ok(VmObject::new(mm.clone(), frames.into_iter().map(Some).collect(), Backing::Contiguous))
}
