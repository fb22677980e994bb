//! # Buddy Zone
//!
//! A [`Zone`] manages one contiguous physical range of `N` frames with a binary
//! buddy system. Blocks of order `k` span `2^k` frames and start at a frame
//! index (relative to the zone base) that is a multiple of `2^k`.
//!
//! ```text
//! frame index   0   1   2   3   4   5   6   7
//! order 3     [               0               ]
//! order 2     [       0       ][      4       ]
//! order 1     [   0   ][   2  ][   4  ][  6   ]
//! order 0     [ 0 ][ 1][ 2][ 3][ 4][ 5][ 6][ 7]
//! ```
//!
//! ## Free lists
//!
//! Each order has a doubly linked free list threaded through a per-frame link
//! table (indices, not pointers). Allocation pops from the head and freeing
//! pushes to the head, so the most recently freed block is reused first.
//!
//! ## Splitting and coalescing
//!
//! - Allocating order `k` takes the smallest non-empty order `j >= k`. While
//!   `j > k` the block is halved: the lower half is kept, the upper half is
//!   pushed onto the free list of order `j - 1`.
//! - Freeing a block of order `k` merges it with its buddy
//!   (`index ^ (1 << k)`) for as long as the buddy lies inside the zone and is
//!   itself free at order `k`. Buddy state is read from the [split
//!   bitmap](crate::split_bitmap).
//!
//! ## Invariants
//!
//! - Free blocks never overlap and two free buddies of the same order never
//!   coexist; they are always merged.
//! - `available()` equals the number of frames on all free lists.
//! - Bookkeeping corruption (double free, foreign runs, a buddy bit without a
//!   matching free block) is a kernel bug and panics.

use crate::split_bitmap::SplitBitmap;
use crate::{FrameAllocator, MAX_ORDER};
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;
use kernel_memory_addresses::{FRAME_SIZE, PhysicalAddress, Size4K};
use log::{debug, trace};
use spin::Mutex;

/// Geometry of a single zone.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ZoneConfig {
    base: PhysicalAddress,
    frame_count: usize,
    max_order: u8,
}

impl ZoneConfig {
    /// Describe a zone of `frame_count` frames starting at `base`.
    ///
    /// # Errors
    /// Returns a [`ZoneConfigError`] if `base` is not frame aligned, the zone
    /// is empty or too large, its end overflows, or `max_order` exceeds
    /// [`MAX_ORDER`].
    pub fn new(
        base: PhysicalAddress,
        frame_count: usize,
        max_order: u8,
    ) -> Result<Self, ZoneConfigError> {
        if !base.is_aligned::<Size4K>() {
            return Err(ZoneConfigError::MisalignedBase(base));
        }
        if frame_count == 0 {
            return Err(ZoneConfigError::Empty);
        }
        if max_order > MAX_ORDER {
            return Err(ZoneConfigError::OrderTooLarge {
                max_order,
                limit: MAX_ORDER,
            });
        }
        if u32::try_from(frame_count).is_err() {
            return Err(ZoneConfigError::TooManyFrames(frame_count));
        }
        (frame_count as u64)
            .checked_mul(FRAME_SIZE)
            .and_then(|bytes| base.checked_add(bytes))
            .ok_or(ZoneConfigError::AddressOverflow)?;

        Ok(Self {
            base,
            frame_count,
            max_order,
        })
    }

    #[inline]
    #[must_use]
    pub const fn base(&self) -> PhysicalAddress {
        self.base
    }

    #[inline]
    #[must_use]
    pub const fn frame_count(&self) -> usize {
        self.frame_count
    }

    #[inline]
    #[must_use]
    pub const fn max_order(&self) -> u8 {
        self.max_order
    }

    /// First address past the zone.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.base.as_u64() + self.frame_count as u64 * FRAME_SIZE)
    }

    #[inline]
    #[must_use]
    pub const fn contains(&self, pa: PhysicalAddress) -> bool {
        pa.as_u64() >= self.base.as_u64() && pa.as_u64() < self.end().as_u64()
    }
}

/// Errors produced while describing a zone.
#[derive(Debug, thiserror::Error, Copy, Clone, Eq, PartialEq)]
pub enum ZoneConfigError {
    #[error("zone base {0:?} is not frame aligned")]
    MisalignedBase(PhysicalAddress),
    #[error("zone must contain at least one frame")]
    Empty,
    #[error("maximum order {max_order} exceeds the supported limit of {limit}")]
    OrderTooLarge { max_order: u8, limit: u8 },
    #[error("zone of {0} frames exceeds the addressable frame count")]
    TooManyFrames(usize),
    #[error("zone end overflows the physical address space")]
    AddressOverflow,
}

/// A naturally aligned run of `2^order` frames.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct FrameRun {
    base: PhysicalAddress,
    order: u8,
}

impl FrameRun {
    #[inline]
    #[must_use]
    pub const fn new(base: PhysicalAddress, order: u8) -> Self {
        Self { base, order }
    }

    #[inline]
    #[must_use]
    pub const fn base(self) -> PhysicalAddress {
        self.base
    }

    #[inline]
    #[must_use]
    pub const fn order(self) -> u8 {
        self.order
    }

    #[inline]
    #[must_use]
    pub const fn frame_count(self) -> usize {
        1 << self.order
    }

    #[inline]
    #[must_use]
    pub const fn size_in_bytes(self) -> u64 {
        FRAME_SIZE << self.order
    }

    #[inline]
    #[must_use]
    pub const fn contains(self, pa: PhysicalAddress) -> bool {
        pa.as_u64() >= self.base.as_u64()
            && pa.as_u64() < self.base.as_u64() + self.size_in_bytes()
    }

    /// Base address of every frame in the run, lowest first.
    pub fn frames(self) -> impl Iterator<Item = PhysicalAddress> {
        (0..self.frame_count() as u64).map(move |i| self.base + i * FRAME_SIZE)
    }
}

/// Per-frame free-list link. Only meaningful on the first frame of a free block.
#[derive(Copy, Clone, Default)]
struct Link {
    prev: Option<u32>,
    next: Option<u32>,
    /// `Some(k)` iff this frame heads a free block of order `k`.
    free_order: Option<u8>,
}

/// Frame indices fit in `u32`; [`ZoneConfig::new`] rejects larger zones.
#[allow(clippy::cast_possible_truncation)]
#[inline]
const fn slot(index: usize) -> u32 {
    index as u32
}

struct BuddyState {
    frame_count: usize,
    max_order: u8,
    heads: Vec<Option<u32>>,
    links: Vec<Link>,
    split: SplitBitmap,
    free_frames: usize,
}

impl BuddyState {
    /// Carve `[0, frame_count)` into the largest naturally aligned blocks.
    fn new(frame_count: usize, max_order: u8) -> Self {
        let mut state = Self {
            frame_count,
            max_order,
            heads: vec![None; usize::from(max_order) + 1],
            links: vec![Link::default(); frame_count],
            split: SplitBitmap::new(frame_count, max_order),
            free_frames: 0,
        };

        let mut index = 0;
        while index < frame_count {
            let mut order = max_order;
            while order > 0 && (index % (1 << order) != 0 || index + (1 << order) > frame_count) {
                order -= 1;
            }
            state.push(index, order);
            state.free_frames += 1 << order;
            index += 1 << order;
        }
        state
    }

    fn push(&mut self, index: usize, order: u8) {
        assert!(
            self.links[index].free_order.is_none(),
            "frame {index} already heads a free block"
        );
        let old_head = self.heads[usize::from(order)];
        self.links[index] = Link {
            prev: None,
            next: old_head,
            free_order: Some(order),
        };
        if let Some(old) = old_head {
            self.links[old as usize].prev = Some(slot(index));
        }
        self.heads[usize::from(order)] = Some(slot(index));
        if self.split.tracks(order) {
            self.split.toggle(order, index);
        }
    }

    fn remove(&mut self, index: usize, order: u8) {
        let link = self.links[index];
        assert_eq!(
            link.free_order,
            Some(order),
            "frame {index} does not head a free order-{order} block"
        );
        match link.prev {
            Some(prev) => self.links[prev as usize].next = link.next,
            None => self.heads[usize::from(order)] = link.next,
        }
        if let Some(next) = link.next {
            self.links[next as usize].prev = link.prev;
        }
        self.links[index] = Link::default();
        if self.split.tracks(order) {
            self.split.toggle(order, index);
        }
    }

    fn allocate(&mut self, order: u8) -> Option<usize> {
        let source = (order..=self.max_order).find(|&k| self.heads[usize::from(k)].is_some())?;
        let index = self.heads[usize::from(source)]? as usize;
        self.remove(index, source);

        let mut current = source;
        while current > order {
            current -= 1;
            self.push(index + (1 << current), current);
        }

        self.free_frames -= 1 << order;
        Some(index)
    }

    fn deallocate(&mut self, mut index: usize, mut order: u8) {
        assert!(
            index % (1 << order) == 0 && index + (1 << order) <= self.frame_count,
            "block {index} of order {order} is not a valid block of this zone"
        );
        self.assert_allocated(index, order);

        self.free_frames += 1 << order;
        while order < self.max_order {
            let buddy = index ^ (1 << order);
            if buddy + (1 << order) > self.frame_count || !self.split.is_set(order, index) {
                break;
            }
            self.remove(buddy, order);
            index = index.min(buddy);
            order += 1;
        }
        self.push(index, order);
    }

    /// Panic unless every frame of the block is allocated: no free block may
    /// contain it, and no free block may start inside it.
    fn assert_allocated(&self, index: usize, order: u8) {
        for k in order..=self.max_order {
            let head = index & !((1 << k) - 1);
            assert!(
                self.links[head].free_order != Some(k),
                "double free of block {index} (order {order}): inside free block {head} of order {k}"
            );
        }
        if let Some(offset) = self.links[index..index + (1 << order)]
            .iter()
            .position(|link| link.free_order.is_some())
        {
            panic!(
                "double free of block {index} (order {order}): frame {} is already free",
                index + offset
            );
        }
    }

    fn free_blocks(&self, order: u8) -> Vec<usize> {
        let mut blocks = Vec::new();
        let mut cursor = self.heads[usize::from(order)];
        while let Some(index) = cursor {
            blocks.push(index as usize);
            cursor = self.links[index as usize].next;
        }
        blocks
    }

    fn assert_consistent(&self) {
        let mut covered = vec![false; self.frame_count];
        let mut free = 0;
        let mut heads = 0;

        for order in 0..=self.max_order {
            let size = 1usize << order;
            let mut prev = None;
            let mut cursor = self.heads[usize::from(order)];
            while let Some(index) = cursor {
                let index = index as usize;
                let link = self.links[index];
                assert_eq!(link.free_order, Some(order), "list {order} holds frame {index} of another order");
                assert_eq!(link.prev, prev, "broken back link at frame {index}");
                assert_eq!(index % size, 0, "free block {index} is misaligned for order {order}");
                assert!(index + size <= self.frame_count, "free block {index} exceeds the zone");

                for frame in &mut covered[index..index + size] {
                    assert!(!*frame, "free blocks overlap at frame {index}");
                    *frame = true;
                }

                if order < self.max_order {
                    let buddy = index ^ size;
                    if buddy + size <= self.frame_count {
                        assert_ne!(
                            self.links[buddy].free_order,
                            Some(order),
                            "buddies {index} and {buddy} left unmerged"
                        );
                    }
                    assert!(self.split.is_set(order, index), "split bit clear for free block {index}");
                }

                free += size;
                heads += 1;
                prev = Some(slot(index));
                cursor = link.next;
            }
        }

        assert_eq!(free, self.free_frames, "free counter out of sync");
        assert_eq!(
            heads,
            self.links.iter().filter(|l| l.free_order.is_some()).count(),
            "stray free-block marker"
        );
    }
}

/// A buddy-managed physical zone.
pub struct Zone {
    config: ZoneConfig,
    state: Mutex<BuddyState>,
}

impl Zone {
    /// Build a zone with every frame free.
    #[must_use]
    pub fn new(config: ZoneConfig) -> Self {
        debug!(
            "zone {}..{}: {} frames, max order {}",
            config.base(),
            config.end(),
            config.frame_count(),
            config.max_order()
        );
        Self {
            state: Mutex::new(BuddyState::new(config.frame_count(), config.max_order())),
            config,
        }
    }

    #[inline]
    #[must_use]
    pub const fn config(&self) -> &ZoneConfig {
        &self.config
    }

    #[inline]
    #[must_use]
    pub const fn contains(&self, pa: PhysicalAddress) -> bool {
        self.config.contains(pa)
    }

    /// Allocate a block of `2^order` frames.
    ///
    /// Returns `None` when `order` exceeds the zone's maximum order or no free
    /// block of sufficient order exists.
    pub fn allocate(&self, order: u8) -> Option<FrameRun> {
        if order > self.config.max_order() {
            trace!("order {order} exceeds zone maximum {}", self.config.max_order());
            return None;
        }
        let Some(index) = self.state.lock().allocate(order) else {
            trace!("zone {} exhausted at order {order}", self.config.base());
            return None;
        };
        Some(FrameRun::new(self.address_of(index), order))
    }

    /// Return a block to the zone, merging it with free buddies.
    ///
    /// # Panics
    /// If the run does not belong to this zone or is already free.
    pub fn deallocate(&self, run: FrameRun) {
        assert!(
            run.order() <= self.config.max_order(),
            "order {} exceeds zone maximum",
            run.order()
        );
        let index = self.index_of(run.base());
        self.state.lock().deallocate(index, run.order());
    }

    /// Number of free frames.
    #[must_use]
    pub fn available(&self) -> usize {
        self.state.lock().free_frames
    }

    /// Number of frames currently handed out.
    #[must_use]
    pub fn allocated(&self) -> usize {
        self.config.frame_count() - self.available()
    }

    /// Base addresses of the free blocks of `order`, in reuse order.
    #[must_use]
    pub fn free_blocks(&self, order: u8) -> Vec<PhysicalAddress> {
        if order > self.config.max_order() {
            return Vec::new();
        }
        self.state
            .lock()
            .free_blocks(order)
            .into_iter()
            .map(|index| self.address_of(index))
            .collect()
    }

    /// Walk every free list and the split bitmap.
    ///
    /// # Panics
    /// If any allocator invariant is violated.
    pub fn assert_consistent(&self) {
        self.state.lock().assert_consistent();
    }

    fn address_of(&self, index: usize) -> PhysicalAddress {
        self.config.base() + index as u64 * FRAME_SIZE
    }

    fn index_of(&self, pa: PhysicalAddress) -> usize {
        assert!(
            self.contains(pa) && pa.is_aligned::<Size4K>(),
            "{pa:?} is not a frame of zone {}",
            self.config.base()
        );
        #[allow(clippy::cast_possible_truncation)]
        let index = ((pa - self.config.base()) / FRAME_SIZE) as usize;
        index
    }
}

impl FrameAllocator for Zone {
    fn allocate(&self, order: u8) -> Option<FrameRun> {
        Self::allocate(self, order)
    }

    fn deallocate(&self, run: FrameRun) {
        Self::deallocate(self, run);
    }

    fn available(&self) -> usize {
        Self::available(self)
    }
}

impl fmt::Debug for Zone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Zone")
            .field("base", &self.config.base())
            .field("frame_count", &self.config.frame_count())
            .field("max_order", &self.config.max_order())
            .field("available", &self.available())
            .finish()
    }
}
