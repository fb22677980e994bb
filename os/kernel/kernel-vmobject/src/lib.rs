//! # Virtual Memory Objects
//!
//! Backing-store objects for ranges of virtual memory, independent of any
//! address space. A page-fault handler asks a [`VmObject`] for the frame
//! behind a page; fork clones objects; the file layer notifies inode-backed
//! objects when the file changes underneath them.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │   Region / page-fault handler / file layer (callers) │
//! └──────────────────┬───────────────────────────────────┘
//!                    │ populate_or_cow · try_clone · notifications
//! ┌──────────────────▼───────────────────────────────────┐
//! │                     VmObject                         │
//! │  Anonymous │ SharedInode │ PrivateInode │ Contiguous │
//! │  slots: [Option<FrameHandle>] behind a spin lock     │
//! └──────────────────┬───────────────────────────────────┘
//!                    │
//! ┌──────────────────▼───────────────────────────────────┐
//! │                  MemoryManager                       │
//! │  FramePool · PhysMapper · shared zero frame · inodes │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Components
//!
//! ### Memory manager ([`manager`])
//!
//! [`MemoryManager`] is constructed once and passed to every object. It owns
//! the [`FramePool`](kernel_alloc::FramePool), the shared zero frame and the
//! registry of inode objects that receive file notifications.
//!
//! ### Memory objects ([`vmobject`])
//!
//! [`VmObject`] is a closed set of four variants sharing one slot array:
//!
//! - **Anonymous** ([`anonymous`]): zero-fill on demand; reads map the shared
//!   zero frame, writes get private frames. See [`AllocationStrategy`].
//!   Pages marked volatile may be purged when memory runs short.
//! - **Shared / private inode** ([`inode`]): pages loaded from an [`Inode`],
//!   dirty tracking, reclamation of clean pages, write-back for shared
//!   mappings.
//! - **Contiguous** ([`contiguous`]): one physical run for DMA.
//!
//! ### Faults ([`fault`])
//!
//! [`VmObject::handle_fault`] turns a [`PageFault`] into a
//! [`PageFaultResponse`].
//!
//! ## Copy-on-write
//!
//! A write to a slot copies first when the frame is the shared zero frame or a
//! returnable frame with more than one owner. Fork shares frames by cloning
//! handles into the child before anything on the parent side is released.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use kernel_alloc::FramePool;
//! use kernel_alloc::phys_mapper::ArenaPhysMapper;
//! use kernel_memory_addresses::PhysicalAddress;
//! use kernel_vmobject::{AllocationStrategy, MemoryManager, VmObject};
//!
//! let base = PhysicalAddress::new(0x10_0000);
//! let mapper = Arc::new(ArenaPhysMapper::new(base, 16));
//! let mm = MemoryManager::new(FramePool::from_range(base, 16, 4).unwrap(), mapper).unwrap();
//!
//! let parent = VmObject::create_with_size(&mm, 2, AllocationStrategy::None).unwrap();
//! parent.write(0, 0, b"parent").unwrap();
//!
//! let child = parent.try_clone().unwrap();
//! child.write(0, 0, b"child!").unwrap();
//!
//! let mut buf = [0u8; 6];
//! parent.read(0, 0, &mut buf).unwrap();
//! assert_eq!(&buf, b"parent");
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]

extern crate alloc;

pub mod anonymous;
pub mod contiguous;
pub mod fault;
pub mod inode;
pub mod manager;
mod page_bitmap;
pub mod vmobject;

pub use anonymous::AllocationStrategy;
pub use fault::{Access, PageFault, PageFaultResponse};
pub use inode::{Inode, InodeError, InodeId};
pub use manager::MemoryManager;
pub use vmobject::{VmError, VmObject, VmObjectKind};

#[allow(clippy::cast_possible_truncation)]
pub(crate) const FRAME_BYTES: usize = kernel_memory_addresses::FRAME_SIZE as usize;
