/*!
 * Statistics and Budget Tests
 */

use super::common::{setup, setup_with, KB, MB};
use pretty_assertions::assert_eq;
use region_suballoc::{
    AllocationDesc, AllocatorConfig, MemorySegment, PlacementCategory, PoolDesc,
    SimulatedProvider,
};

#[test]
fn test_totals_split_by_category_and_segment() {
    let (_provider, allocator) = setup();
    allocator
        .allocate(&AllocationDesc::new(100 * KB, 1))
        .unwrap();
    allocator
        .allocate(&AllocationDesc::new(10 * KB, 1).with_category(PlacementCategory::Upload))
        .unwrap();
    allocator
        .allocate(&AllocationDesc::new(20 * KB, 1).with_category(PlacementCategory::Readback))
        .unwrap();

    let totals = allocator.calculate_statistics();
    assert_eq!(
        totals.category(PlacementCategory::DeviceLocal).stats.allocation_bytes,
        100 * KB
    );
    assert_eq!(
        totals.segment(MemorySegment::NonLocal).stats.allocation_bytes,
        30 * KB
    );
    assert_eq!(totals.segment(MemorySegment::NonLocal).stats.allocation_count, 2);
    assert_eq!(totals.total.stats.allocation_count, 3);
    assert_eq!(totals.total.stats.block_count, 3);
    assert_eq!(totals.total.allocation_size_min, 10 * KB);
    assert_eq!(totals.total.allocation_size_max, 100 * KB);

    let upload = allocator.category_statistics(PlacementCategory::Upload);
    assert_eq!(upload.stats.allocation_count, 1);
}

#[test]
fn test_uma_puts_everything_in_local() {
    let (_provider, allocator) = setup_with(
        SimulatedProvider::unlimited().with_uma(true),
        AllocatorConfig::default(),
    );
    allocator
        .allocate(&AllocationDesc::new(KB, 1).with_category(PlacementCategory::Upload))
        .unwrap();

    let totals = allocator.calculate_statistics();
    assert_eq!(totals.segment(MemorySegment::Local).stats.allocation_count, 1);
    assert_eq!(totals.segment(MemorySegment::NonLocal).stats.allocation_count, 0);
}

#[test]
fn test_fast_and_detailed_statistics_agree() {
    let (_provider, allocator) = setup();
    let pool = allocator
        .create_pool(PoolDesc::new(PlacementCategory::DeviceLocal).with_block_size(MB))
        .unwrap();
    let mut live = Vec::new();
    for i in 0..40u64 {
        live.push(
            allocator
                .allocate(&AllocationDesc::new((i + 1) * KB, 1).in_pool(pool.id()))
                .unwrap(),
        );
    }
    for allocation in live.drain(..).step_by(3) {
        allocator.free(allocation).unwrap();
    }

    let fast = pool.statistics();
    let detailed = pool.calculate_statistics();
    assert_eq!(fast, detailed.stats);
    assert!(detailed.unused_range_count >= 1);
    assert!(detailed.average_allocation_size() > 0);
}

#[test]
fn test_dedicated_counted_as_block() {
    let (_provider, allocator) = setup();
    let big = allocator
        .allocate(&AllocationDesc::new(40 * MB, 1))
        .unwrap();
    let pool = allocator.default_pool(PlacementCategory::DeviceLocal);

    let stats = pool.statistics();
    assert_eq!(stats.block_count, 1);
    assert_eq!(stats.block_bytes, 40 * MB);
    assert_eq!(stats.allocation_bytes, 40 * MB);
    assert_eq!(pool.calculate_statistics().stats, stats);

    allocator.free(big).unwrap();
    assert_eq!(pool.statistics().block_count, 0);
}

#[test]
fn test_budget_from_config() {
    let config = AllocatorConfig {
        local_budget: Some(100 * MB),
        ..AllocatorConfig::default()
    };
    let (_provider, allocator) = setup_with(SimulatedProvider::unlimited(), config);
    allocator.allocate(&AllocationDesc::new(KB, 1)).unwrap();

    let local = allocator.get_budget(MemorySegment::Local);
    assert_eq!(local.budget_bytes, 100 * MB);
    assert_eq!(local.usage_bytes, local.stats.block_bytes);
    assert!(local.usage_bytes > 0);
    assert_eq!(local.headroom(), 100 * MB - local.usage_bytes);

    let non_local = allocator.get_budget(MemorySegment::NonLocal);
    assert_eq!(non_local.budget_bytes, u64::MAX);
    assert_eq!(non_local.usage_bytes, 0);
}

#[test]
fn test_budget_from_provider() {
    let (provider, allocator) = setup_with(
        SimulatedProvider::unlimited().with_segment_budget(MemorySegment::NonLocal, 64 * MB),
        AllocatorConfig::default(),
    );
    allocator
        .allocate(&AllocationDesc::new(KB, 1).with_category(PlacementCategory::Readback))
        .unwrap();

    let budget = allocator.get_budget(MemorySegment::NonLocal);
    assert_eq!(budget.budget_bytes, 64 * MB);
    assert_eq!(budget.usage_bytes, provider.used_bytes());
    assert_eq!(budget.stats.allocation_count, 1);
}

#[test]
fn test_statistics_serialize() {
    let (_provider, allocator) = setup();
    allocator.allocate(&AllocationDesc::new(KB, 1)).unwrap();
    let json = serde_json::to_value(allocator.calculate_statistics()).unwrap();
    assert_eq!(json["total"]["stats"]["allocation_count"], 1);
}
