use kernel_alloc::{FrameAllocator, FrameRun, Zone, ZoneConfig};
use kernel_memory_addresses::{FRAME_SIZE, PhysicalAddress};
use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use std::thread;

const BASE: u64 = 0x80_0000;

fn zone(frames: usize, max_order: u8) -> Zone {
    Zone::new(ZoneConfig::new(PhysicalAddress::new(BASE), frames, max_order).unwrap())
}

fn snapshot(zone: &Zone) -> Vec<Vec<PhysicalAddress>> {
    (0..=zone.config().max_order())
        .map(|order| zone.free_blocks(order))
        .collect()
}

/// Small deterministic generator so failures reproduce.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        self.0 >> 33
    }
}

#[test]
fn allocate_four_frame_run_from_sixteen() {
    let zone = zone(16, 4);
    let run = zone.allocate(2).expect("order-2 run");
    assert_eq!(run.frame_count(), 4);
    assert_eq!(zone.available(), 12);
    zone.deallocate(run);
    assert_eq!(zone.available(), 16);
    zone.assert_consistent();
}

#[test]
fn two_frame_zone_runs_dry() {
    let zone = zone(2, 1);
    let a = zone.allocate(0).expect("first");
    let b = zone.allocate(0).expect("second");
    assert_ne!(a.base(), b.base());
    assert!(!a.contains(b.base()));
    assert!(zone.allocate(0).is_none());
}

#[test]
fn allocate_then_free_restores_free_lists() {
    let zone = zone(64, 5);
    let mut rng = Lcg(7);
    let mut held = Vec::new();

    for step in 0..200 {
        let before = snapshot(&zone);
        let order = u8::try_from(rng.next() % 4).unwrap();
        if let Some(run) = zone.allocate(order) {
            zone.deallocate(run);
            assert_eq!(snapshot(&zone), before, "step {step}, order {order}");
        }

        // perturb the state so later round trips start from fragmented lists
        if rng.next() % 2 == 0 {
            if let Some(run) = zone.allocate(0) {
                held.push(run);
            }
        } else if !held.is_empty() {
            let victim = (rng.next() as usize) % held.len();
            zone.deallocate(held.swap_remove(victim));
        }
    }

    for run in held {
        zone.deallocate(run);
    }
    assert_eq!(zone.free_blocks(5).len(), 2);
}

#[test]
fn random_workload_keeps_invariants() {
    let zone = zone(100, 4);
    let mut rng = Lcg(0x5eed);
    let mut held: Vec<FrameRun> = Vec::new();

    for _ in 0..2_000 {
        if rng.next() % 3 != 0 {
            let order = u8::try_from(rng.next() % 5).unwrap();
            if let Some(run) = zone.allocate(order) {
                assert_eq!((run.base().as_u64() - BASE) / FRAME_SIZE % run.frame_count() as u64, 0);
                for other in &held {
                    assert!(!other.contains(run.base()) && !run.contains(other.base()));
                }
                held.push(run);
            }
        } else if !held.is_empty() {
            let victim = (rng.next() as usize) % held.len();
            zone.deallocate(held.swap_remove(victim));
        }

        let in_use: usize = held.iter().map(|r| r.frame_count()).sum();
        assert_eq!(zone.available() + in_use, 100);
    }
    zone.assert_consistent();

    for run in held.drain(..) {
        zone.deallocate(run);
    }
    assert_eq!(zone.available(), 100);
    zone.assert_consistent();
}

#[test]
fn concurrent_allocations_are_disjoint() {
    let threads = 8;
    let per_thread = 24;
    let zone = Arc::new(zone(256, 8));
    let start = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let zone = Arc::clone(&zone);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                let mut mine = Vec::new();
                for i in 0..per_thread {
                    let order = u8::try_from((t + i) % 2).unwrap();
                    if let Some(run) = FrameAllocator::allocate(&*zone, order) {
                        mine.push(run);
                    }
                }
                mine
            })
        })
        .collect();

    let runs: Vec<FrameRun> = handles
        .into_iter()
        .flat_map(|h| h.join().expect("thread"))
        .collect();

    let mut frames = HashSet::new();
    for run in &runs {
        for pa in run.frames() {
            assert!(frames.insert(pa), "{pa:?} handed out twice");
        }
    }
    assert_eq!(zone.available(), 256 - frames.len());
    zone.assert_consistent();

    for run in runs {
        zone.deallocate(run);
    }
    assert_eq!(zone.available(), 256);
    assert_eq!(zone.free_blocks(8).len(), 1);
}
