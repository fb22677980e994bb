//! # Frame pool
//!
//! The [`FramePool`] fronts a set of buddy [`Zone`]s and is what the rest of
//! the kernel allocates from. On top of the zones it keeps a *commitment*
//! counter: frames promised to memory objects that will fault them in later.
//! Uncommitted allocations may only use frames nobody has been promised, so a
//! committed allocation never fails.
//!
//! ```text
//!   total ─┬─ allocated
//!          └─ available ─┬─ committed   (reserved, still on free lists)
//!                        └─ uncommitted (free for anyone)
//! ```
//!
//! Lock order is commitment lock first, then zone lock. Returning a frame only
//! takes the zone lock.

use crate::{FrameAllocator, FrameHandle, FrameRun, MAX_ORDER, Zone, ZoneConfig, ZoneConfigError};
use alloc::sync::Arc;
use alloc::vec::Vec;
use kernel_memory_addresses::{FRAME_SIZE, PhysicalAddress};
use log::{debug, info, warn};
use spin::Mutex;

pub struct FramePool {
    zones: Vec<Arc<Zone>>,
    /// Frames promised to memory objects but not yet allocated.
    committed: Mutex<usize>,
}

impl FramePool {
    #[must_use]
    pub fn new(zones: Vec<Zone>) -> Self {
        let zones: Vec<_> = zones.into_iter().map(Arc::new).collect();
        info!(
            "frame pool: {} zones, {} frames",
            zones.len(),
            zones.iter().map(|z| z.config().frame_count()).sum::<usize>()
        );
        Self {
            zones,
            committed: Mutex::new(0),
        }
    }

    /// Split `[base, base + frame_count frames)` into zones of at most
    /// `2^max_order` frames each.
    ///
    /// # Errors
    /// Propagates the first [`ZoneConfigError`].
    pub fn from_range(
        base: PhysicalAddress,
        frame_count: usize,
        max_order: u8,
    ) -> Result<Self, ZoneConfigError> {
        if frame_count == 0 {
            return Err(ZoneConfigError::Empty);
        }
        if max_order > MAX_ORDER {
            return Err(ZoneConfigError::OrderTooLarge {
                max_order,
                limit: MAX_ORDER,
            });
        }

        let zone_frames = 1usize << max_order;
        let mut zones = Vec::with_capacity(frame_count.div_ceil(zone_frames));
        let mut start = 0;
        while start < frame_count {
            let frames = zone_frames.min(frame_count - start);
            let zone_base = base
                .checked_add(start as u64 * FRAME_SIZE)
                .ok_or(ZoneConfigError::AddressOverflow)?;
            zones.push(Zone::new(ZoneConfig::new(zone_base, frames, max_order)?));
            start += frames;
        }
        Ok(Self::new(zones))
    }

    #[must_use]
    pub fn zones(&self) -> &[Arc<Zone>] {
        &self.zones
    }

    #[must_use]
    pub fn total_frames(&self) -> usize {
        self.zones.iter().map(|z| z.config().frame_count()).sum()
    }

    /// Free frames across all zones, committed or not.
    #[must_use]
    pub fn available(&self) -> usize {
        self.zones.iter().map(|z| z.available()).sum()
    }

    #[must_use]
    pub fn committed(&self) -> usize {
        *self.committed.lock()
    }

    /// Free frames nobody has been promised.
    #[must_use]
    pub fn uncommitted(&self) -> usize {
        let committed = self.committed.lock();
        self.available().saturating_sub(*committed)
    }

    /// Reserve `count` frames for later [`allocate_committed`](Self::allocate_committed) calls.
    ///
    /// Returns `false` (reserving nothing) if fewer than `count` uncommitted frames remain.
    pub fn try_commit(&self, count: usize) -> bool {
        let mut committed = self.committed.lock();
        let uncommitted = self.available().saturating_sub(*committed);
        if uncommitted < count {
            warn!("cannot commit {count} frames, only {uncommitted} uncommitted");
            return false;
        }
        *committed += count;
        debug!("committed {count} frames ({} total)", *committed);
        true
    }

    /// Give back `count` reserved frames that will not be used.
    ///
    /// # Panics
    /// If more frames are released than were committed.
    pub fn uncommit(&self, count: usize) {
        let mut committed = self.committed.lock();
        assert!(
            *committed >= count,
            "uncommitting {count} frames with only {} committed",
            *committed
        );
        *committed -= count;
        debug!("uncommitted {count} frames ({} remain)", *committed);
    }

    /// Drop `frames` and commit as many of them as came back, in one step.
    ///
    /// Returns how many were committed. Frames still referenced elsewhere do
    /// not come back and are not committed. No uncommitted allocation can
    /// slip in between the release and the commitment.
    pub fn release_and_commit(&self, frames: Vec<FrameHandle>) -> usize {
        let mut committed = self.committed.lock();
        let count = frames.len();
        drop(frames);
        let granted = count.min(self.available().saturating_sub(*committed));
        *committed += granted;
        debug!("released and committed {granted} of {count} frames");
        granted
    }

    /// Allocate one frame from the uncommitted share.
    pub fn allocate_frame(&self) -> Option<FrameHandle> {
        let committed = self.committed.lock();
        if self.available() <= *committed {
            warn!("out of uncommitted frames");
            return None;
        }
        self.allocate_single()
    }

    /// Allocate one frame against an earlier [`try_commit`](Self::try_commit).
    ///
    /// # Panics
    /// If nothing is committed.
    pub fn allocate_committed(&self) -> Option<FrameHandle> {
        let mut committed = self.committed.lock();
        assert!(*committed > 0, "committed allocation without a commitment");
        *committed -= 1;
        let frame = self.allocate_single();
        if frame.is_none() {
            warn!("committed frame unavailable, pool accounting is off");
        }
        frame
    }

    /// Allocate `count` physically contiguous frames as individual handles.
    ///
    /// The smallest power-of-two block covering `count` is taken from a
    /// single zone; frames past `count` are handed straight back.
    pub fn allocate_contiguous(&self, count: usize) -> Option<Vec<FrameHandle>> {
        if count == 0 {
            return Some(Vec::new());
        }
        let order = u8::try_from(count.next_power_of_two().trailing_zeros()).ok()?;

        let committed = self.committed.lock();
        if self.available().saturating_sub(*committed) < count {
            warn!("cannot allocate {count} contiguous frames, not enough uncommitted frames");
            return None;
        }

        for zone in &self.zones {
            let Some(run) = zone.allocate(order) else {
                continue;
            };

            // The tail goes back before the commit lock is released, so
            // `available()` never dips below the committed count.
            let owner: Arc<dyn FrameAllocator> = zone.clone();
            let mut frames = Vec::with_capacity(count);
            for (i, pa) in run.frames().enumerate() {
                if i < count {
                    frames.push(FrameHandle::create(pa, owner.clone()));
                } else {
                    zone.deallocate(FrameRun::new(pa, 0));
                }
            }
            drop(committed);
            debug!("allocated {count} contiguous frames at {}", run.base());
            return Some(frames);
        }

        warn!("no zone holds a free order-{order} block for {count} contiguous frames");
        None
    }

    /// Take one frame out of circulation for good.
    ///
    /// The frame is never returned; it suits kernel-lifetime frames such as
    /// the shared zero frame.
    pub fn allocate_permanent(&self) -> Option<PhysicalAddress> {
        let committed = self.committed.lock();
        if self.available() <= *committed {
            return None;
        }
        let run = self.zones.iter().find_map(|zone| zone.allocate(0))?;
        Some(run.base())
    }

    fn allocate_single(&self) -> Option<FrameHandle> {
        self.zones.iter().find_map(|zone| {
            let run = zone.allocate(0)?;
            let owner: Arc<dyn FrameAllocator> = zone.clone();
            Some(FrameHandle::create(run.base(), owner))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(frames: usize, max_order: u8) -> FramePool {
        FramePool::from_range(PhysicalAddress::new(0x20_0000), frames, max_order).expect("pool")
    }

    #[test]
    fn range_is_split_into_zones() {
        let pool = pool(40, 4);
        let sizes: Vec<_> = pool.zones().iter().map(|z| z.config().frame_count()).collect();
        assert_eq!(sizes, vec![16, 16, 8]);
        assert_eq!(
            pool.zones()[1].config().base(),
            PhysicalAddress::new(0x20_0000 + 16 * FRAME_SIZE)
        );
        assert_eq!(pool.total_frames(), 40);
        assert_eq!(pool.available(), 40);
    }

    #[test]
    fn frames_return_to_their_zone() {
        let pool = pool(32, 4);
        let frame = pool.allocate_frame().expect("frame");
        assert_eq!(pool.available(), 31);
        let copy = frame.clone();
        drop(frame);
        assert_eq!(pool.available(), 31);
        drop(copy);
        assert_eq!(pool.available(), 32);
        for zone in pool.zones() {
            zone.assert_consistent();
        }
    }

    #[test]
    fn commitment_blocks_uncommitted_allocations() {
        let pool = pool(4, 2);
        assert!(pool.try_commit(3));
        assert!(!pool.try_commit(2));
        assert_eq!(pool.uncommitted(), 1);

        let loose = pool.allocate_frame().expect("one uncommitted frame");
        assert!(pool.allocate_frame().is_none());

        let reserved: Vec<_> = (0..3).map(|_| pool.allocate_committed().expect("committed")).collect();
        assert_eq!(pool.committed(), 0);
        assert_eq!(pool.available(), 0);

        drop(loose);
        drop(reserved);
        assert_eq!(pool.available(), 4);
    }

    #[test]
    fn uncommit_releases_the_reservation() {
        let pool = pool(8, 3);
        assert!(pool.try_commit(8));
        assert!(pool.allocate_frame().is_none());
        pool.uncommit(5);
        assert_eq!(pool.uncommitted(), 5);
        assert!(pool.allocate_frame().is_some());
    }

    #[test]
    #[should_panic(expected = "uncommitting")]
    fn uncommit_more_than_committed_panics() {
        let pool = pool(8, 3);
        assert!(pool.try_commit(1));
        pool.uncommit(2);
    }

    #[test]
    fn released_frames_are_committed_before_anyone_else_sees_them() {
        let pool = pool(4, 2);
        let frames: Vec<_> = (0..4).map(|_| pool.allocate_frame().expect("frame")).collect();
        let kept = frames[3].clone();

        assert_eq!(pool.release_and_commit(frames), 3);
        assert_eq!(pool.committed(), 3);
        assert_eq!(pool.available(), 3);
        assert!(pool.allocate_frame().is_none());

        drop(kept);
        assert!(pool.allocate_frame().is_some());
        pool.uncommit(3);
    }

    #[test]
    fn contiguous_run_trims_the_tail() {
        let pool = pool(16, 4);
        let frames = pool.allocate_contiguous(5).expect("run");
        assert_eq!(frames.len(), 5);
        for pair in frames.windows(2) {
            assert_eq!(pair[1].paddr() - pair[0].paddr(), FRAME_SIZE);
        }
        assert_eq!(pool.available(), 11);
        pool.zones()[0].assert_consistent();

        drop(frames);
        assert_eq!(pool.available(), 16);
        assert_eq!(pool.zones()[0].free_blocks(4).len(), 1);
    }

    #[test]
    fn contiguous_run_larger_than_a_zone_fails() {
        let pool = pool(64, 4);
        assert!(pool.allocate_contiguous(17).is_none());
        assert_eq!(pool.available(), 64);
    }

    #[test]
    fn permanent_frames_never_come_back() {
        let pool = pool(4, 2);
        let pa = pool.allocate_permanent().expect("frame");
        assert_eq!(pa, PhysicalAddress::new(0x20_0000));
        assert_eq!(pool.available(), 3);
    }
}
