#![allow(dead_code)]

use kernel_alloc::FramePool;
use kernel_alloc::phys_mapper::ArenaPhysMapper;
use kernel_memory_addresses::{FRAME_SIZE, PhysicalAddress};
use kernel_vmobject::{Inode, InodeError, InodeId, MemoryManager, VmObject};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub const BASE: u64 = 0x100_0000;
pub const PAGE: usize = FRAME_SIZE as usize;

/// Frames past the pool that only the arena covers, standing in for device memory.
pub const DEVICE_FRAMES: usize = 4;

/// Memory manager over `frames` pool frames; one of them becomes the zero frame.
pub fn memory_manager(frames: usize) -> Arc<MemoryManager> {
    let base = PhysicalAddress::new(BASE);
    let mapper = Arc::new(ArenaPhysMapper::new(base, frames + DEVICE_FRAMES));
    let pool = FramePool::from_range(base, frames, 4).expect("pool");
    MemoryManager::new(pool, mapper).expect("memory manager")
}

/// First address past the pool of a [`memory_manager`] with `frames` frames.
pub fn device_base(frames: usize) -> PhysicalAddress {
    PhysicalAddress::new(BASE + frames as u64 * FRAME_SIZE)
}

pub fn read_page(object: &VmObject, page: usize) -> Vec<u8> {
    let mut buf = vec![0u8; PAGE];
    object.read(page, 0, &mut buf).expect("read");
    buf
}

pub fn read_at(object: &VmObject, page: usize, offset: usize, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    object.read(page, offset, &mut buf).expect("read");
    buf
}

pub fn checksum(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .fold(0xcbf2_9ce4_8422_2325, |h, &b| (h ^ u64::from(b)).wrapping_mul(0x100_0000_01b3))
}

/// An in-memory file.
pub struct MemoryInode {
    id: InodeId,
    data: Mutex<Vec<u8>>,
    fail_reads: AtomicBool,
    reads: AtomicUsize,
}

impl MemoryInode {
    pub fn new(id: InodeId, data: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            id,
            data: Mutex::new(data),
            fail_reads: AtomicBool::new(false),
            reads: AtomicUsize::new(0),
        })
    }

    /// File of `pages` pages where every byte of page `i` is `i + 1`.
    pub fn patterned(id: InodeId, pages: usize) -> Arc<Self> {
        let data = (0..pages).flat_map(|i| vec![(i + 1) as u8; PAGE]).collect();
        Self::new(id, data)
    }

    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().unwrap().clone()
    }

    /// Change the file without telling anybody.
    pub fn overwrite(&self, offset: usize, bytes: &[u8]) {
        self.data.lock().unwrap()[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    pub fn set_len(&self, len: usize) {
        self.data.lock().unwrap().resize(len, 0);
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

impl Inode for MemoryInode {
    fn identifier(&self) -> InodeId {
        self.id
    }

    fn size(&self) -> u64 {
        self.data.lock().unwrap().len() as u64
    }

    fn read_bytes(&self, offset: u64, buf: &mut [u8]) -> Result<usize, InodeError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(InodeError::Io);
        }
        self.reads.fetch_add(1, Ordering::SeqCst);
        let data = self.data.lock().unwrap();
        let offset = usize::try_from(offset).map_err(|_| InodeError::OutOfBounds(offset))?;
        if offset > data.len() {
            return Err(InodeError::OutOfBounds(offset as u64));
        }
        let n = buf.len().min(data.len() - offset);
        buf[..n].copy_from_slice(&data[offset..offset + n]);
        Ok(n)
    }

    fn write_bytes(&self, offset: u64, bytes: &[u8]) -> Result<usize, InodeError> {
        let mut data = self.data.lock().unwrap();
        let offset = usize::try_from(offset).map_err(|_| InodeError::OutOfBounds(offset))?;
        if offset > data.len() {
            return Err(InodeError::OutOfBounds(offset as u64));
        }
        let end = offset + bytes.len();
        if end > data.len() {
            data.resize(end, 0);
        }
        data[offset..end].copy_from_slice(bytes);
        Ok(bytes.len())
    }
}
