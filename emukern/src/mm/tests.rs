extern crate std;

use core::ops::Range;

use alloc::vec;
use alloc::vec::Vec;

use crate::platform::mock::MockPlatform;
use crate::platform::page_mgmt::{MemoryRegionPermissions, PageManagementProvider};

use super::{
    AddressSpace, AreaBacking, FileBackingId, MapError, MapRequestFlags, PAGE_SIZE, ProtectError,
    VmFlags,
};

type Space = AddressSpace<MockPlatform, PAGE_SIZE>;

const RW: MemoryRegionPermissions =
    MemoryRegionPermissions::READ.union(MemoryRegionPermissions::WRITE);
const RO: MemoryRegionPermissions = MemoryRegionPermissions::READ;

fn new_space() -> Space {
    Space::new(MockPlatform::new()).unwrap()
}

fn regions(space: &Space) -> Vec<Range<usize>> {
    space.mappings().into_iter().map(|(r, _)| r).collect()
}

/// Every region must be page-aligned, inside the task range, and disjoint
/// from its neighbors.
fn assert_invariants(space: &Space) {
    let mappings = space.mappings();
    for (range, _) in &mappings {
        assert_eq!(range.start % PAGE_SIZE, 0, "{range:?} start misaligned");
        assert_eq!(range.end % PAGE_SIZE, 0, "{range:?} end misaligned");
        assert!(range.start >= <MockPlatform as PageManagementProvider<PAGE_SIZE>>::TASK_ADDR_MIN);
        assert!(range.end <= <MockPlatform as PageManagementProvider<PAGE_SIZE>>::TASK_ADDR_MAX);
    }
    for pair in mappings.windows(2) {
        assert!(
            pair[0].0.end <= pair[1].0.start,
            "overlap between {:?} and {:?}",
            pair[0].0,
            pair[1].0
        );
    }
}

#[test]
fn map_unmap_split() {
    let space = new_space();
    let base = 0x1_0000;

    let addr = space
        .map_anonymous(base, 12 * PAGE_SIZE, RW, MapRequestFlags::FIXED)
        .unwrap();
    assert_eq!(addr, base);
    assert_eq!(regions(&space), vec![base..base + 12 * PAGE_SIZE]);

    // Punch a hole in the middle; the region splits in two.
    space.unmap(base + 2 * PAGE_SIZE, 2 * PAGE_SIZE).unwrap();
    assert_eq!(
        regions(&space),
        vec![
            base..base + 2 * PAGE_SIZE,
            base + 4 * PAGE_SIZE..base + 12 * PAGE_SIZE
        ]
    );

    // Unmapping the same hole again is not an error.
    space.unmap(base + 2 * PAGE_SIZE, 2 * PAGE_SIZE).unwrap();
    assert_eq!(regions(&space).len(), 2);

    assert_invariants(&space);
}

#[test]
fn map_rejects_bad_arguments() {
    let space = new_space();
    assert_eq!(
        space.map_anonymous(0x1001, PAGE_SIZE, RW, MapRequestFlags::empty()),
        Err(MapError::Unaligned)
    );
    assert_eq!(
        space.map_anonymous(0, 0, RW, MapRequestFlags::empty()),
        Err(MapError::InvalidLength)
    );
    assert_eq!(
        space.map_anonymous(0, PAGE_SIZE, RW, MapRequestFlags::FIXED),
        Err(MapError::InvalidRange)
    );
}

#[test]
fn lowest_gap_at_or_above_hint() {
    let space = new_space();
    let min = <MockPlatform as PageManagementProvider<PAGE_SIZE>>::TASK_ADDR_MIN;

    // No hint: the lowest gap in the whole range.
    let a = space
        .map_anonymous(0, 2 * PAGE_SIZE, RW, MapRequestFlags::empty())
        .unwrap();
    assert_eq!(a, min);

    // A hint above the first mapping is honored when free.
    let hint = min + 0x10_0000;
    let b = space
        .map_anonymous(hint, PAGE_SIZE, RW, MapRequestFlags::empty())
        .unwrap();
    assert_eq!(b, hint);

    // No hint again: the gap between the two mappings is the lowest fit.
    let c = space
        .map_anonymous(0, PAGE_SIZE, RW, MapRequestFlags::empty())
        .unwrap();
    assert_eq!(c, min + 2 * PAGE_SIZE);

    // A hint inside an existing mapping slides up to the next free gap.
    let d = space
        .map_anonymous(hint, PAGE_SIZE, RW, MapRequestFlags::empty())
        .unwrap();
    assert_eq!(d, hint + PAGE_SIZE);

    assert_invariants(&space);
}

#[test]
fn protect_requires_fully_mapped_range() {
    let space = new_space();
    let base = 0x2_0000;
    space
        .map_anonymous(base, 4 * PAGE_SIZE, RW, MapRequestFlags::FIXED)
        .unwrap();
    space.unmap(base + PAGE_SIZE, PAGE_SIZE).unwrap();

    assert!(matches!(
        space.protect(base, 4 * PAGE_SIZE, RO),
        Err(ProtectError::NotMapped(_))
    ));
    // The still-mapped prefix alone is fine.
    space.protect(base, PAGE_SIZE, RO).unwrap();
}

#[test]
fn protect_splits_regions() {
    let space = new_space();
    let base = 0x3_0000;
    space
        .map_anonymous(base, 6 * PAGE_SIZE, RW, MapRequestFlags::FIXED)
        .unwrap();

    space.protect(base + 2 * PAGE_SIZE, 2 * PAGE_SIZE, RO).unwrap();
    let mappings = space.mappings();
    assert_eq!(mappings.len(), 3);
    assert!(mappings[0].1.flags().contains(VmFlags::VM_WRITE));
    assert!(!mappings[1].1.flags().contains(VmFlags::VM_WRITE));
    assert!(mappings[1].1.flags().contains(VmFlags::VM_READ));
    assert!(mappings[2].1.flags().contains(VmFlags::VM_WRITE));
    assert_invariants(&space);
}

#[test]
fn set_break_grows_shrinks_and_is_idempotent() {
    let space = new_space();
    let heap = 0x40_0000;
    space.init_break(heap);

    let b1 = heap + 3 * PAGE_SIZE + 123;
    assert_eq!(space.set_break(b1), Ok(b1));
    // Same request again: idempotent, same answer.
    assert_eq!(space.set_break(b1), Ok(b1));
    assert_eq!(space.current_break(), b1);
    assert_eq!(regions(&space), vec![heap..heap + 4 * PAGE_SIZE]);

    // Shrink back to the base.
    assert_eq!(space.set_break(heap), Ok(heap));
    assert_eq!(regions(&space), Vec::<Range<usize>>::new());

    // Below the base is refused.
    assert!(space.set_break(heap - PAGE_SIZE).is_err());
}

#[test]
fn set_break_collision_reports_out_of_memory() {
    let space = new_space();
    let heap = 0x40_0000;
    space.init_break(heap);
    // Plant a mapping two pages above the heap base.
    space
        .map_anonymous(heap + 2 * PAGE_SIZE, PAGE_SIZE, RW, MapRequestFlags::FIXED)
        .unwrap();

    let before = space.current_break();
    assert!(space.set_break(heap + 4 * PAGE_SIZE).is_err());
    // The break is unchanged; the caller reports it to the guest.
    assert_eq!(space.current_break(), before);

    // Growth that stops short of the obstacle still works.
    assert_eq!(
        space.set_break(heap + 2 * PAGE_SIZE),
        Ok(heap + 2 * PAGE_SIZE)
    );
}

/// The scenario from the design's testable properties: map RW, downgrade to
/// read-only, overwrite with a fixed mapping, then unmap to empty.
#[test]
fn map_protect_fixed_overwrite_unmap_scenario() {
    let space = new_space();

    let x = space
        .map_anonymous(0, PAGE_SIZE, RW, MapRequestFlags::empty())
        .unwrap();
    assert_eq!(regions(&space), vec![x..x + PAGE_SIZE]);
    assert!(space.mappings()[0].1.flags().contains(VmFlags::VM_WRITE));

    space.protect(x, PAGE_SIZE, RO).unwrap();
    assert!(!space.mappings()[0].1.flags().contains(VmFlags::VM_WRITE));

    // A fixed mapping at the same address replaces the old region.
    let y = space
        .map_anonymous(x, PAGE_SIZE, RW, MapRequestFlags::FIXED)
        .unwrap();
    assert_eq!(y, x);
    assert_eq!(regions(&space), vec![x..x + PAGE_SIZE]);
    assert!(space.mappings()[0].1.flags().contains(VmFlags::VM_WRITE));

    space.unmap(x, PAGE_SIZE).unwrap();
    assert!(space.mappings().is_empty());
}

#[test]
fn fork_duplicate_is_independent() {
    let space = new_space();
    let base = 0x5_0000;
    space
        .map_anonymous(base, 2 * PAGE_SIZE, RW, MapRequestFlags::FIXED)
        .unwrap();
    space.init_break(0x40_0000);

    let child = space.fork_duplicate().unwrap();
    assert_eq!(regions(&child), regions(&space));
    assert_eq!(child.current_break(), space.current_break());

    child.unmap(base, PAGE_SIZE).unwrap();
    assert_eq!(regions(&space), vec![base..base + 2 * PAGE_SIZE]);
    assert_eq!(regions(&child), vec![base + PAGE_SIZE..base + 2 * PAGE_SIZE]);
}

#[test]
fn file_backed_areas_are_recorded() {
    let space = new_space();
    let addr = space
        .map(
            0,
            2 * PAGE_SIZE,
            RO,
            MapRequestFlags::empty(),
            AreaBacking::File {
                file: FileBackingId(7),
                offset: PAGE_SIZE as u64,
            },
            // The init callback sees the chosen base address.
            Some(|base: usize| {
                assert_eq!(base % PAGE_SIZE, 0);
                Ok(())
            }),
        )
        .unwrap();
    let (_, vma) = &space.mappings()[0];
    assert!(vma.is_file_backed());
    assert_eq!(
        vma.backing(),
        AreaBacking::File {
            file: FileBackingId(7),
            offset: PAGE_SIZE as u64
        }
    );
    let _ = addr;
}

/// Deterministic pseudo-random map/unmap churn; the region set must stay
/// non-overlapping and page-aligned throughout.
#[test]
fn random_map_unmap_invariant_fuzz() {
    let space = new_space();
    let min = <MockPlatform as PageManagementProvider<PAGE_SIZE>>::TASK_ADDR_MIN;
    let mut seed: u64 = 0x5eed_cafe_f00d_1234;
    let mut next = move || {
        // xorshift64
        seed ^= seed << 13;
        seed ^= seed >> 7;
        seed ^= seed << 17;
        seed
    };

    for i in 0..500 {
        let r = next();
        let page = (r as usize >> 8) % 4096;
        let addr = min + page * PAGE_SIZE;
        let pages = 1 + (r as usize >> 24) % 16;
        let len = pages * PAGE_SIZE;
        match r % 3 {
            0 => {
                let _ = space.map_anonymous(addr, len, RW, MapRequestFlags::FIXED);
            }
            1 => {
                let _ = space.map_anonymous(addr, len, RW, MapRequestFlags::empty());
            }
            _ => {
                let _ = space.unmap(addr, len);
            }
        }
        if i % 16 == 0 {
            assert_invariants(&space);
        }
    }
    assert_invariants(&space);
}
