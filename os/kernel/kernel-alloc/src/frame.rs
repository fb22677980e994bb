//! # Reference-counted physical frames
//!
//! A [`FrameHandle`] is a shared reference to one 4 KiB physical frame. Cloning
//! a handle takes a reference, dropping it releases one. When the last
//! reference of a *returnable* frame goes away, the frame is handed back to
//! the [`FrameAllocator`] it came from exactly once.
//!
//! Non-returnable frames describe memory the allocator does not own (MMIO,
//! firmware tables, the shared zero frame). They are never returned.
//!
//! ```text
//!  FrameHandle ─┐
//!  FrameHandle ─┼──► PhysicalFrame { paddr, owner } ──(last drop)──► owner.deallocate()
//!  FrameHandle ─┘
//! ```
//!
//! ## Ordering
//!
//! Taking a reference uses the standard `Arc` increment; releasing one
//! decrements with release semantics followed by an acquire fence before the
//! frame is returned. Code that transfers a frame between owners must clone
//! the new reference before dropping the old one.

use crate::{FrameAllocator, FrameRun};
use alloc::sync::Arc;
use core::fmt;
use kernel_memory_addresses::PhysicalAddress;
use log::trace;

/// The shared part of a frame: its address and where it goes when released.
pub struct PhysicalFrame {
    paddr: PhysicalAddress,
    owner: Option<Arc<dyn FrameAllocator>>,
}

impl Drop for PhysicalFrame {
    fn drop(&mut self) {
        if let Some(owner) = self.owner.take() {
            trace!("returning frame {:?}", self.paddr);
            owner.deallocate(FrameRun::new(self.paddr, 0));
        }
    }
}

/// Shared, reference-counted handle to one physical frame.
#[derive(Clone)]
pub struct FrameHandle(Arc<PhysicalFrame>);

impl FrameHandle {
    /// Wrap a frame obtained from `owner`; it is returned there on last release.
    #[must_use]
    pub fn create(paddr: PhysicalAddress, owner: Arc<dyn FrameAllocator>) -> Self {
        Self(Arc::new(PhysicalFrame {
            paddr,
            owner: Some(owner),
        }))
    }

    /// Wrap a frame that no allocator owns; releasing it does nothing.
    #[must_use]
    pub fn non_returnable(paddr: PhysicalAddress) -> Self {
        Self(Arc::new(PhysicalFrame { paddr, owner: None }))
    }

    #[inline]
    #[must_use]
    pub fn paddr(&self) -> PhysicalAddress {
        self.0.paddr
    }

    #[inline]
    #[must_use]
    pub fn is_returnable(&self) -> bool {
        self.0.owner.is_some()
    }

    /// Number of live handles to this frame.
    #[inline]
    #[must_use]
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    /// Whether both handles refer to the same frame record.
    #[inline]
    #[must_use]
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }
}

impl fmt::Debug for FrameHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameHandle")
            .field("paddr", &self.paddr())
            .field("returnable", &self.is_returnable())
            .field("refs", &self.ref_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spin::Mutex;
    use std::vec::Vec;

    /// Records every run handed back to it.
    #[derive(Default)]
    struct Recorder {
        returned: Mutex<Vec<FrameRun>>,
    }

    impl FrameAllocator for Recorder {
        fn allocate(&self, _order: u8) -> Option<FrameRun> {
            None
        }

        fn deallocate(&self, run: FrameRun) {
            self.returned.lock().push(run);
        }

        fn available(&self) -> usize {
            0
        }
    }

    #[test]
    fn last_release_returns_exactly_once() {
        let recorder = Arc::new(Recorder::default());
        let pa = PhysicalAddress::new(0x5000);

        let first = FrameHandle::create(pa, recorder.clone());
        let second = first.clone();
        let third = second.clone();
        assert_eq!(first.ref_count(), 3);

        drop(first);
        drop(third);
        assert!(recorder.returned.lock().is_empty());
        assert_eq!(second.ref_count(), 1);

        drop(second);
        assert_eq!(*recorder.returned.lock(), vec![FrameRun::new(pa, 0)]);
    }

    #[test]
    fn non_returnable_frames_are_never_returned() {
        let frame = FrameHandle::non_returnable(PhysicalAddress::new(0xFEE0_0000));
        assert!(!frame.is_returnable());
        let copy = frame.clone();
        assert!(FrameHandle::ptr_eq(&frame, &copy));
        drop(copy);
        drop(frame);
    }

    #[test]
    fn concurrent_release_returns_once() {
        let recorder = Arc::new(Recorder::default());
        let frame = FrameHandle::create(PhysicalAddress::new(0x9000), recorder.clone());

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let handle = frame.clone();
                std::thread::spawn(move || {
                    let extra = handle.clone();
                    drop(handle);
                    drop(extra);
                })
            })
            .collect();
        drop(frame);
        for t in threads {
            t.join().expect("thread");
        }

        assert_eq!(recorder.returned.lock().len(), 1);
    }
}
