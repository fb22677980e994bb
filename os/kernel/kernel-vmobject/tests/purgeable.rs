mod common;

use common::{MemoryInode, PAGE, device_base, memory_manager, read_at, read_page};
use kernel_vmobject::{AllocationStrategy, VmError, VmObject};
use std::sync::{Arc, Barrier};
use std::thread;

#[test]
fn purge_releases_volatile_pages() {
    let mm = memory_manager(16);
    let object = VmObject::create_with_size(&mm, 4, AllocationStrategy::None).unwrap();
    for page in 0..4 {
        object.write(page, 0, b"cached").unwrap();
    }
    let available = mm.pool().available();

    assert!(!object.is_any_volatile());
    assert_eq!(object.set_volatile(1..3, true), Ok(false));
    assert!(object.is_any_volatile());
    assert_eq!(object.purge(), 2);
    assert_eq!(mm.pool().available(), available + 2);
    assert_eq!(object.resident_pages(), 2);

    assert!(read_page(&object, 1).iter().all(|&b| b == 0));
    assert_eq!(read_at(&object, 0, 0, 6), b"cached");
    assert_eq!(read_at(&object, 3, 0, 6), b"cached");

    assert_eq!(object.set_volatile(0..4, false), Ok(true));
    assert_eq!(object.set_volatile(1..3, false), Ok(false));
    assert!(!object.is_any_volatile());
    assert_eq!(object.purge(), 0);
}

#[test]
fn allocation_purges_volatile_memory_before_failing() {
    let mm = memory_manager(8);
    let cache = VmObject::create_with_size(&mm, 4, AllocationStrategy::None).unwrap();
    for page in 0..4 {
        cache.write(page, 0, b"cache").unwrap();
    }
    cache.set_volatile(0..4, true).unwrap();

    let worker = VmObject::create_with_size(&mm, 4, AllocationStrategy::None).unwrap();
    for page in 0..3 {
        worker.write(page, 0, b"work").unwrap();
    }
    assert_eq!(mm.pool().available(), 0);

    worker.write(3, 0, b"work").unwrap();
    assert_eq!(cache.resident_pages(), 0);
    assert_eq!(mm.pool().available(), 3);
    assert_eq!(cache.set_volatile(0..4, false), Ok(true));
    assert!(read_page(&cache, 2).iter().all(|&b| b == 0));
}

#[test]
fn contiguous_allocation_purges_before_failing() {
    let mm = memory_manager(8);
    let cache = VmObject::create_with_size(&mm, 4, AllocationStrategy::None).unwrap();
    for page in 0..4 {
        cache.write(page, 0, b"cache").unwrap();
    }
    cache.set_volatile(0..4, true).unwrap();

    let dma = VmObject::create_contiguous(&mm, 4).unwrap();
    assert!(dma.physical_base().is_some());
    assert_eq!(cache.resident_pages(), 0);
}

#[test]
fn exhaustion_is_reported_once_nothing_is_left_to_purge() {
    let mm = memory_manager(4);
    let cache = VmObject::create_with_size(&mm, 1, AllocationStrategy::None).unwrap();
    cache.write(0, 0, b"keep").unwrap();

    let worker = VmObject::create_with_size(&mm, 3, AllocationStrategy::None).unwrap();
    worker.write(0, 0, b"a").unwrap();
    worker.write(1, 0, b"b").unwrap();
    assert_eq!(worker.write(2, 0, b"c"), Err(VmError::OutOfMemory));
    assert_eq!(read_at(&cache, 0, 0, 4), b"keep");
}

#[test]
fn purged_pages_of_a_reserved_object_stay_committed() {
    let mm = memory_manager(16);
    let object = VmObject::create_with_size(&mm, 2, AllocationStrategy::Reserve).unwrap();
    object.write(0, 0, b"zero").unwrap();
    object.write(1, 0, b"one").unwrap();
    assert_eq!(mm.pool().committed(), 0);

    object.set_volatile(0..2, true).unwrap();
    assert_eq!(mm.purge_volatile(), 2);
    assert_eq!(mm.pool().committed(), 2);
    assert_eq!(object.unused_committed_pages(), 2);

    let greedy: Vec<_> = std::iter::from_fn(|| mm.pool().allocate_frame()).collect();
    assert_eq!(greedy.len(), 13);

    object.write(0, 0, b"again").unwrap();
    object.write(1, 0, b"again").unwrap();
    assert_eq!(read_at(&object, 1, 0, 5), b"again");
    assert_eq!(mm.pool().committed(), 0);

    drop(greedy);
    drop(object);
    assert_eq!(mm.pool().available(), 15);
}

#[test]
fn shared_device_and_zero_pages_are_never_purged() {
    let frames = 16;
    let mm = memory_manager(frames);

    let device = VmObject::create_for_physical_range(&mm, device_base(frames), 2).unwrap();
    device.set_volatile(0..2, true).unwrap();
    assert_eq!(device.purge(), 0);
    assert_eq!(device.resident_pages(), 2);

    let zero_filled = VmObject::create_with_size(&mm, 1, AllocationStrategy::None).unwrap();
    zero_filled.populate_or_cow(0, false).unwrap();
    zero_filled.set_volatile(0..1, true).unwrap();
    assert_eq!(zero_filled.purge(), 0);
    assert!(zero_filled.slot_at(0).unwrap().is_some());

    let parent = VmObject::create_with_size(&mm, 1, AllocationStrategy::None).unwrap();
    parent.write(0, 0, b"forked").unwrap();
    let child = parent.try_clone().unwrap();
    parent.set_volatile(0..1, true).unwrap();
    assert!(!child.is_any_volatile());
    assert_eq!(parent.purge(), 0);
    assert_eq!(read_at(&parent, 0, 0, 6), b"forked");
    assert_eq!(read_at(&child, 0, 0, 6), b"forked");
}

#[test]
fn volatile_marks_only_apply_to_anonymous_memory() {
    let mm = memory_manager(16);
    let inode = VmObject::create_shared_inode(&mm, MemoryInode::patterned(3, 2));
    assert!(matches!(inode.set_volatile(0..1, true), Err(VmError::ProtocolViolation(_))));
    assert!(!inode.is_any_volatile());
    assert_eq!(inode.purge(), 0);

    let object = VmObject::create_with_size(&mm, 2, AllocationStrategy::None).unwrap();
    let (start, end) = (2, 1);
    assert!(matches!(object.set_volatile(start..end, true), Err(VmError::ProtocolViolation(_))));
    assert_eq!(object.set_volatile(1..1, true), Ok(false));
    assert!(!object.is_any_volatile());
}

#[test]
fn purging_races_with_writes() {
    let mm = memory_manager(32);
    let cache = VmObject::create_with_size(&mm, 8, AllocationStrategy::None).unwrap();
    cache.set_volatile(0..8, true).unwrap();
    let barrier = Arc::new(Barrier::new(2));

    let writer = {
        let cache = cache.clone();
        let barrier = barrier.clone();
        thread::spawn(move || {
            barrier.wait();
            for round in 0..200 {
                let page = round % 8;
                cache.write(page, PAGE - 4, b"last").unwrap();
            }
        })
    };
    let purger = {
        let mm = mm.clone();
        thread::spawn(move || {
            barrier.wait();
            (0..200).map(|_| mm.purge_volatile()).sum::<usize>()
        })
    };
    writer.join().unwrap();
    purger.join().unwrap();

    cache.purge();
    assert_eq!(cache.resident_pages(), 0);
    drop(cache);
    assert_eq!(mm.pool().available(), 31);
    for zone in mm.pool().zones() {
        zone.assert_consistent();
    }
}
