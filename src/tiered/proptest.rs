//! Property-Based Tests for the Region Allocator
//!
//! # Test Properties
//!
//! 1. **Conservation**: free bytes + allocated bytes = capacity
//! 2. **Merge Invariant**: no two free regions are adjacent or overlapping
//! 3. **Exclusivity**: a best-fit offset never overlaps a live allocation

#![cfg(test)]

use proptest::prelude::*;

use super::allocator::RegionAllocator;
use super::region::Region;

// =============================================================================
// Property Strategies
// =============================================================================

/// One step of an allocation workload.
#[derive(Debug, Clone)]
enum Op {
    /// Allocate this many bytes
    Alloc(u64),
    /// Free the live allocation at this index (modulo live count)
    Free(usize),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (1u64..=4096).prop_map(Op::Alloc),
        2 => any::<usize>().prop_map(Op::Free),
    ]
}

fn workload_strategy() -> impl Strategy<Value = Vec<Op>> {
    prop::collection::vec(op_strategy(), 1..200)
}

fn assert_free_list_well_formed(free: &[Region], capacity: u64) {
    for region in free {
        assert!(region.start < region.end, "empty free region {:?}", region);
        assert!(region.end <= capacity);
    }
    for pair in free.windows(2) {
        assert!(
            pair[0].end < pair[1].start,
            "free regions {:?} and {:?} overlap or touch",
            pair[0],
            pair[1]
        );
    }
}

// =============================================================================
// Invariant Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Free plus allocated bytes always equals capacity, and the free list
    /// stays sorted and fully merged after every operation.
    #[test]
    fn prop_conservation_and_merge(
        capacity in 4096u64..=65536,
        ops in workload_strategy(),
    ) {
        let alloc = RegionAllocator::new(capacity);
        let mut live: Vec<Region> = Vec::new();

        for op in ops {
            match op {
                Op::Alloc(size) => {
                    if let Ok(offset) = alloc.alloc_best_fit(size) {
                        live.push(Region::at(offset, size));
                    }
                }
                Op::Free(idx) => {
                    if !live.is_empty() {
                        let region = live.swap_remove(idx % live.len());
                        alloc.free(region.start, region.size());
                    }
                }
            }

            let allocated: u64 = live.iter().map(Region::size).sum();
            prop_assert_eq!(alloc.free_space() + allocated, capacity);
            assert_free_list_well_formed(&alloc.free_regions(), capacity);
        }
    }

    /// No two live allocations ever overlap.
    #[test]
    fn prop_allocations_disjoint(
        capacity in 4096u64..=65536,
        ops in workload_strategy(),
    ) {
        let alloc = RegionAllocator::new(capacity);
        let mut live: Vec<Region> = Vec::new();

        for op in ops {
            match op {
                Op::Alloc(size) => {
                    if let Ok(offset) = alloc.alloc_best_fit(size) {
                        let fresh = Region::at(offset, size);
                        prop_assert!(fresh.end <= capacity);
                        for existing in &live {
                            prop_assert!(
                                !fresh.overlaps(existing),
                                "{:?} overlaps live {:?}",
                                fresh,
                                existing
                            );
                        }
                        live.push(fresh);
                    }
                }
                Op::Free(idx) => {
                    if !live.is_empty() {
                        let region = live.swap_remove(idx % live.len());
                        alloc.free(region.start, region.size());
                    }
                }
            }
        }
    }

    /// Allocation only fails when no free region is large enough.
    #[test]
    fn prop_exhaustion_is_honest(
        capacity in 1024u64..=16384,
        sizes in prop::collection::vec(1u64..=2048, 1..64),
    ) {
        let alloc = RegionAllocator::new(capacity);
        for size in sizes {
            let largest = alloc.largest_free_block();
            match alloc.alloc_best_fit(size) {
                Ok(_) => prop_assert!(size <= largest),
                Err(_) => prop_assert!(size > largest),
            }
        }
    }

    /// Freeing everything restores a single region spanning the reserved
    /// remainder.
    #[test]
    fn prop_free_all_restores_space(
        header in 1u64..=512,
        sizes in prop::collection::vec(1u64..=1024, 1..32),
    ) {
        let capacity = 32 * 1024;
        let alloc = RegionAllocator::new(capacity);
        alloc.alloc_at(0, header).unwrap();

        let mut live = Vec::new();
        for size in sizes {
            if let Ok(offset) = alloc.alloc_best_fit(size) {
                live.push((offset, size));
            }
        }
        live.reverse();
        for (offset, size) in live {
            alloc.free(offset, size);
        }

        prop_assert_eq!(alloc.free_regions(), vec![Region::new(header, capacity)]);
    }
}
