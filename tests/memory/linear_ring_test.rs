/*!
 * Linear Pool Tests
 * Ring buffer wrap-around and double stack through a custom pool
 */

use super::common::{assert_disjoint, setup, KB};
use pretty_assertions::assert_eq;
use region_suballoc::{
    Algorithm, Allocation, AllocationDesc, AllocationFlags, Allocator, PlacementCategory, PoolDesc,
};
use std::collections::VecDeque;

const BUFFER: u64 = 64 * KB;
const CAPACITY: u64 = 300;

fn ring_pool(allocator: &Allocator) -> region_suballoc::Pool {
    allocator
        .create_pool(
            PoolDesc::new(PlacementCategory::Upload)
                .with_algorithm(Algorithm::Linear)
                .with_block_size(BUFFER * CAPACITY)
                .with_block_count(1, 1)
                .with_name("ring"),
        )
        .expect("ring pool")
}

fn push(allocator: &Allocator, pool: u64, live: &mut VecDeque<(Allocation, u64)>) -> u64 {
    let allocation = allocator
        .allocate(&AllocationDesc::new(BUFFER, 1).in_pool(pool))
        .expect("ring allocation must not fail");
    let offset = allocator.get_allocation_info(allocation).unwrap().offset;
    live.push_back((allocation, offset));
    offset
}

#[test]
fn test_ring_wraps_to_freed_front() {
    let (_provider, allocator) = setup();
    let pool = ring_pool(&allocator);
    let mut live = VecDeque::new();

    for _ in 0..100 {
        push(&allocator, pool.id(), &mut live);
    }

    let mut wrapped = 0;
    for _round in 0..60 {
        for _ in 0..10 {
            let (oldest, _) = live.pop_front().unwrap();
            allocator.free(oldest).unwrap();
        }

        let previous_top = live.back().map(|&(_, offset)| offset).unwrap();
        let oldest = live.front().map(|&(_, offset)| offset).unwrap();
        for _ in 0..10 {
            let offset = push(&allocator, pool.id(), &mut live);
            if offset < previous_top {
                // Wrapped below the oldest live allocation instead of failing
                wrapped += 1;
                assert!(
                    offset + BUFFER <= oldest,
                    "wrapped offset {} overlaps live batch starting at {}",
                    offset,
                    oldest
                );
            }
        }
        assert!(pool.validate());
    }

    assert!(wrapped > 0, "ring never wrapped");
    assert_eq!(pool.block_count(), 1);
    assert_eq!(pool.allocation_count(), 100);

    let infos: Vec<_> = live
        .iter()
        .map(|&(a, _)| allocator.get_allocation_info(a).unwrap())
        .collect();
    for (i, a) in infos.iter().enumerate() {
        for b in &infos[i + 1..] {
            assert_disjoint(a, b);
        }
    }
}

#[test]
fn test_ring_full_fails_without_growth() {
    let (_provider, allocator) = setup();
    let pool = ring_pool(&allocator);
    let mut live = VecDeque::new();
    for _ in 0..CAPACITY {
        push(&allocator, pool.id(), &mut live);
    }
    let err = allocator
        .allocate(&AllocationDesc::new(BUFFER, 1).in_pool(pool.id()))
        .unwrap_err();
    assert!(err.is_out_of_memory());
    assert_eq!(pool.block_count(), 1);
}

#[test]
fn test_upper_address_double_stack() {
    let (_provider, allocator) = setup();
    let pool = ring_pool(&allocator);

    let low = allocator
        .allocate(&AllocationDesc::new(BUFFER, 1).in_pool(pool.id()))
        .unwrap();
    let high = allocator
        .allocate(
            &AllocationDesc::new(BUFFER, 1)
                .in_pool(pool.id())
                .with_flags(AllocationFlags::UPPER_ADDRESS),
        )
        .unwrap();

    let low = allocator.get_allocation_info(low).unwrap();
    let high = allocator.get_allocation_info(high).unwrap();
    assert_eq!(low.offset, 0);
    assert_eq!(high.offset, BUFFER * (CAPACITY - 1));
    assert_disjoint(&low, &high);
}

#[test]
fn test_upper_address_rejected_outside_single_block_linear() {
    let (_provider, allocator) = setup();
    let general = allocator
        .create_pool(PoolDesc::new(PlacementCategory::DeviceLocal).with_block_size(KB * KB))
        .unwrap();
    let growable = allocator
        .create_pool(
            PoolDesc::new(PlacementCategory::DeviceLocal)
                .with_algorithm(Algorithm::Linear)
                .with_block_count(0, 4),
        )
        .unwrap();

    for pool in [&general, &growable] {
        let err = allocator
            .allocate(
                &AllocationDesc::new(KB, 1)
                    .in_pool(pool.id())
                    .with_flags(AllocationFlags::UPPER_ADDRESS),
            )
            .unwrap_err();
        assert!(matches!(err, region_suballoc::AllocError::InvalidArgument(_)));
    }
}
