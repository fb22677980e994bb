//! # Physical Memory Address Types
//!
//! Strongly typed physical addresses used by the frame allocator and the
//! memory-object layer.
//!
//! ## Overview
//!
//! | Type | Generic | Description |
//! |------|---------|-------------|
//! | [`PhysicalAddress`] | – | A raw 64-bit physical address (RAM or MMIO). |
//! | [`Size4K`] | [`PageSize`] | The frame size, carried at the type level. |
//!
//! Frames are always 4 KiB ([`Size4K`]); the [`PageSize`] trait keeps the
//! size at the type level so conversions stay explicit.
//!
//! ## Typical Usage
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let pa = PhysicalAddress::new(0x0000_0010_2000_0042);
//! assert_eq!(pa.offset_in_page::<Size4K>(), 0x42);
//! assert_eq!(pa.page_number::<Size4K>(), 0x0000_0010_2000_0042 >> 12);
//! assert!(PhysicalAddress::new(0x2000).is_aligned::<Size4K>());
//! ```
//!
//! ## Design Notes
//!
//! - [`PhysicalAddress`] is `#[repr(transparent)]` and implements `Copy`, `Eq`,
//!   `Ord` and `Hash`, making it suitable as a map key.
//! - All alignment and offset calculations are `const fn`.

#![cfg_attr(not(any(test, doctest)), no_std)]

mod page_size;
mod physical_address;

pub use page_size::{PageSize, Size4K};
pub use physical_address::PhysicalAddress;

/// Size of one physical frame in bytes.
pub const FRAME_SIZE: u64 = Size4K::SIZE;
