//! # Physical Frame Allocation
//!
//! This crate owns physical memory: it hands out 4 KiB frames and runs of
//! frames, tracks who still references them, and takes them back when the
//! last reference disappears. Everything above it (memory objects, page
//! tables, DMA buffers) holds frames through a [`FrameHandle`].
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                    Frame Pool                       │
//! │    • Commitment accounting (reserve / draw down)    │
//! │    • Single frames and contiguous runs              │
//! └─────────────────┬───────────────────────────────────┘
//!                   │ allocate(order) / deallocate(run)
//! ┌─────────────────▼───────────────────────────────────┐
//! │                 Buddy Zones                         │
//! │    • Per-order LIFO free lists                      │
//! │    • Split bitmap for O(1) buddy checks             │
//! │    • Split on allocation, coalesce on free          │
//! └─────────────────┬───────────────────────────────────┘
//!                   │ FrameHandle (last drop returns frame)
//! ┌─────────────────▼───────────────────────────────────┐
//! │              Physical Mapper                        │
//! │    • Frame address → pointer (HHDM or host arena)   │
//! │    • Zero / copy / read / write helpers             │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Components
//!
//! ### Buddy Zones ([`zone`])
//!
//! A [`Zone`] manages `N` contiguous frames. Blocks of order `k` cover `2^k`
//! frames; orders run from `0` to the zone's configured maximum (at most
//! [`MAX_ORDER`]). Allocation takes the smallest sufficient free block and
//! splits it, freeing merges a block with its buddy while both are free.
//!
//! ### Frame Handles ([`frame`])
//!
//! [`FrameHandle`] is a shared, reference-counted frame. A returnable frame is
//! given back to its zone exactly once, when the last handle is dropped.
//! Non-returnable frames (MMIO, the shared zero frame) are never given back.
//!
//! ### Frame Pool ([`pool`])
//!
//! [`FramePool`] spreads allocations over all zones and keeps the count of
//! frames committed to memory objects, so reserved memory cannot be taken by
//! someone else in the meantime.
//!
//! ### Physical Mapper ([`phys_mapper`])
//!
//! [`PhysMapper`](phys_mapper::PhysMapper) converts frame addresses into
//! pointers. [`HhdmPhysMapper`](phys_mapper::HhdmPhysMapper) serves kernels
//! with a direct map, [`ArenaPhysMapper`](phys_mapper::ArenaPhysMapper) backs
//! a fake physical range with heap memory for hosted tests.
//!
//! ## Usage
//!
//! ```rust
//! use kernel_alloc::FramePool;
//! use kernel_memory_addresses::PhysicalAddress;
//!
//! let pool = FramePool::from_range(PhysicalAddress::new(0x10_0000), 64, 4).unwrap();
//! let frame = pool.allocate_frame().unwrap();
//! assert_eq!(pool.available(), 63);
//!
//! let alias = frame.clone();
//! drop(frame);
//! assert_eq!(alias.ref_count(), 1);
//! drop(alias);
//! assert_eq!(pool.available(), 64);
//! ```
//!
//! ## Concurrency
//!
//! Each zone serializes its free lists behind a spin lock. Frame handles are
//! `Send + Sync` and may be released from any thread; releasing only takes
//! the owning zone's lock.

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

pub mod frame;
pub mod phys_mapper;
pub mod pool;
mod split_bitmap;
pub mod zone;

pub use frame::{FrameHandle, PhysicalFrame};
pub use pool::FramePool;
pub use zone::{FrameRun, Zone, ZoneConfig, ZoneConfigError};

/// Largest block order any zone may be configured with (`2^20` frames, 4 GiB).
pub const MAX_ORDER: u8 = 20;

/// A source of physical frame runs.
///
/// Returnable [`FrameHandle`]s keep their allocator alive and hand the frame
/// back through [`deallocate`](Self::deallocate) on last release.
pub trait FrameAllocator: Send + Sync {
    /// Allocate `2^order` naturally aligned frames.
    fn allocate(&self, order: u8) -> Option<FrameRun>;

    /// Return a run previously produced by [`allocate`](Self::allocate), or any
    /// naturally aligned sub-run of it.
    fn deallocate(&self, run: FrameRun);

    /// Number of free frames.
    fn available(&self) -> usize;
}
