//! # Physical memory access
//!
//! Frame contents can only be touched through a virtual address. A
//! [`PhysMapper`] turns a physical frame address into a pointer usable in the
//! current address space; the memory-object layer uses it to zero, copy, read
//! and write frames.
//!
//! Two strategies are provided:
//!
//! - [`HhdmPhysMapper`]: kernels with a higher-half direct map, where every
//!   physical address is visible at `offset + pa`.
//! - [`ArenaPhysMapper`]: a heap arena standing in for a physical range, for
//!   hosted builds and tests.
//!
//! ## Example
//! ```rust
//! use kernel_alloc::phys_mapper::{ArenaPhysMapper, PhysMapper, copy_frame, zero_frame};
//! use kernel_memory_addresses::{FRAME_SIZE, PhysicalAddress};
//!
//! let base = PhysicalAddress::new(0x10_0000);
//! let mapper = ArenaPhysMapper::new(base, 2);
//! unsafe {
//!     mapper.phys_to_ptr(base).write(0xAB);
//!     copy_frame(&mapper, base, base + FRAME_SIZE);
//!     assert_eq!(mapper.phys_to_ptr(base + FRAME_SIZE).read(), 0xAB);
//!     zero_frame(&mapper, base);
//!     assert_eq!(mapper.phys_to_ptr(base).read(), 0);
//! }
//! ```

use alloc::alloc::{Layout, alloc_zeroed, dealloc, handle_alloc_error};
use core::ptr::{self, NonNull};
use kernel_memory_addresses::{FRAME_SIZE, PhysicalAddress};

#[allow(clippy::cast_possible_truncation)]
const FRAME_BYTES: usize = FRAME_SIZE as usize;

/// Translate physical frame addresses into dereferenceable pointers.
pub trait PhysMapper: Send + Sync {
    /// Pointer to the byte at `pa` in the current address space.
    ///
    /// Computing the pointer is safe; dereferencing it is only sound while
    /// the frame is owned by the caller and mapped by this strategy.
    fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8;
}

/// Fill the frame at `frame` with zeroes.
///
/// # Safety
/// The caller must own the frame (e.g. hold its handle) and no other code may
/// access it concurrently.
pub unsafe fn zero_frame(mapper: &dyn PhysMapper, frame: PhysicalAddress) {
    let dst = mapper.phys_to_ptr(frame);
    // SAFETY: caller guarantees exclusive access to a mapped frame.
    unsafe { ptr::write_bytes(dst, 0, FRAME_BYTES) };
}

/// Copy one full frame from `src` to `dst`.
///
/// # Safety
/// Both frames must be mapped and owned by the caller, `dst` must not be
/// accessed concurrently and the frames must differ.
pub unsafe fn copy_frame(mapper: &dyn PhysMapper, src: PhysicalAddress, dst: PhysicalAddress) {
    debug_assert_ne!(src, dst, "copying a frame onto itself");
    let from = mapper.phys_to_ptr(src);
    let to = mapper.phys_to_ptr(dst);
    // SAFETY: distinct frames never overlap; caller guarantees ownership.
    unsafe { ptr::copy_nonoverlapping(from, to, FRAME_BYTES) };
}

/// Copy `buf.len()` bytes starting at `offset` within `frame` into `buf`.
///
/// # Safety
/// The frame must be mapped and held by the caller; `offset + buf.len()` must
/// not exceed the frame size.
pub unsafe fn read_bytes(mapper: &dyn PhysMapper, frame: PhysicalAddress, offset: usize, buf: &mut [u8]) {
    debug_assert!(offset + buf.len() <= FRAME_BYTES);
    let from = mapper.phys_to_ptr(frame);
    // SAFETY: range checked by the caller; `buf` is a distinct Rust allocation.
    unsafe { ptr::copy_nonoverlapping(from.add(offset), buf.as_mut_ptr(), buf.len()) };
}

/// Copy `data` into `frame` starting at `offset`.
///
/// # Safety
/// The frame must be mapped and exclusively held by the caller;
/// `offset + data.len()` must not exceed the frame size.
pub unsafe fn write_bytes(mapper: &dyn PhysMapper, frame: PhysicalAddress, offset: usize, data: &[u8]) {
    debug_assert!(offset + data.len() <= FRAME_BYTES);
    let to = mapper.phys_to_ptr(frame);
    // SAFETY: range checked by the caller; `data` is a distinct Rust allocation.
    unsafe { ptr::copy_nonoverlapping(data.as_ptr(), to.add(offset), data.len()) };
}

/// [`PhysMapper`] for kernels with a higher-half direct map (HHDM).
///
/// # Safety
/// - The HHDM mapping must be present and cover the referenced physical range.
/// - The returned pointer must only be used for valid, mapped, and writable memory.
#[derive(Debug, Copy, Clone)]
pub struct HhdmPhysMapper {
    offset: u64,
}

impl HhdmPhysMapper {
    /// Mapper for a direct map starting at virtual address `offset`.
    #[must_use]
    pub const fn new(offset: u64) -> Self {
        Self { offset }
    }
}

impl PhysMapper for HhdmPhysMapper {
    fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8 {
        (self.offset + pa.as_u64()) as *mut u8
    }
}

/// Heap-backed stand-in for a physical range `[base, base + frames)`.
///
/// The arena is zero-initialized and page aligned; it is freed when the
/// mapper is dropped, so the mapper must outlive every frame access.
pub struct ArenaPhysMapper {
    base: PhysicalAddress,
    memory: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the arena is plain memory; callers synchronize frame access through
// frame ownership exactly as with real physical memory.
unsafe impl Send for ArenaPhysMapper {}
// SAFETY: see `Send`.
unsafe impl Sync for ArenaPhysMapper {}

impl ArenaPhysMapper {
    /// Allocate a zeroed arena covering `frames` frames starting at `base`.
    ///
    /// # Panics
    /// If `frames` is zero or the arena size overflows.
    #[must_use]
    pub fn new(base: PhysicalAddress, frames: usize) -> Self {
        assert!(frames > 0, "arena must cover at least one frame");
        let layout = frames
            .checked_mul(FRAME_BYTES)
            .and_then(|size| Layout::from_size_align(size, FRAME_BYTES).ok());
        let Some(layout) = layout else {
            panic!("arena of {frames} frames is too large");
        };
        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc_zeroed(layout) };
        let Some(memory) = NonNull::new(raw) else {
            handle_alloc_error(layout)
        };
        Self {
            base,
            memory,
            layout,
        }
    }

    #[must_use]
    pub const fn base(&self) -> PhysicalAddress {
        self.base
    }

    #[must_use]
    pub const fn frame_count(&self) -> usize {
        self.layout.size() / FRAME_BYTES
    }
}

impl PhysMapper for ArenaPhysMapper {
    /// # Panics
    /// If `pa` lies outside the arena.
    fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8 {
        let offset = pa
            .as_u64()
            .checked_sub(self.base.as_u64())
            .and_then(|o| usize::try_from(o).ok())
            .filter(|&o| o < self.layout.size());
        let Some(offset) = offset else {
            panic!("{pa:?} lies outside the arena at {}", self.base);
        };
        // SAFETY: offset is within the allocation.
        unsafe { self.memory.as_ptr().add(offset) }
    }
}

impl Drop for ArenaPhysMapper {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with the same layout.
        unsafe { dealloc(self.memory.as_ptr(), self.layout) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hhdm_adds_the_offset() {
        let mapper = HhdmPhysMapper::new(0xFFFF_8000_0000_0000);
        let ptr = mapper.phys_to_ptr(PhysicalAddress::new(0x1234_0000));
        assert_eq!(ptr as u64, 0xFFFF_8000_1234_0000);
    }

    #[test]
    fn arena_starts_zeroed_and_round_trips_bytes() {
        let base = PhysicalAddress::new(0x40_0000);
        let mapper = ArenaPhysMapper::new(base, 2);
        assert_eq!(mapper.frame_count(), 2);

        let frame = base + FRAME_SIZE;
        let mut buf = [0xFFu8; 8];
        unsafe { read_bytes(&mapper, frame, 100, &mut buf) };
        assert_eq!(buf, [0; 8]);

        unsafe { write_bytes(&mapper, frame, 100, b"physical") };
        unsafe { read_bytes(&mapper, frame, 100, &mut buf) };
        assert_eq!(&buf, b"physical");

        unsafe { copy_frame(&mapper, frame, base) };
        unsafe { read_bytes(&mapper, base, 100, &mut buf) };
        assert_eq!(&buf, b"physical");

        unsafe { zero_frame(&mapper, frame) };
        unsafe { read_bytes(&mapper, frame, 100, &mut buf) };
        assert_eq!(buf, [0; 8]);
    }

    #[test]
    #[should_panic(expected = "outside the arena")]
    fn arena_rejects_foreign_addresses() {
        let mapper = ArenaPhysMapper::new(PhysicalAddress::new(0x40_0000), 1);
        let _ = mapper.phys_to_ptr(PhysicalAddress::new(0x40_1000));
    }
}
