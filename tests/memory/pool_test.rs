/*!
 * Pool Tests
 * Custom pool limits, default pool routing, handles and per-allocation data
 */

use super::common::{assert_disjoint, setup, setup_with, KB, MB};
use pretty_assertions::assert_eq;
use region_suballoc::{
    AllocError, AllocationDesc, AllocationFlags, AllocatorConfig, MemorySegment,
    PlacementCategory, PoolDesc, SimulatedProvider,
};

#[test]
fn test_general_pool_reuses_freed_range() {
    let (_provider, allocator) = setup();
    let pool = allocator
        .create_pool(
            PoolDesc::new(PlacementCategory::DeviceLocal)
                .with_block_size(16 * MB)
                .with_block_count(1, 1),
        )
        .unwrap();

    let first = allocator
        .allocate(&AllocationDesc::new(8 * MB, 1).in_pool(pool.id()))
        .unwrap();
    let second = allocator
        .allocate(&AllocationDesc::new(4 * MB, 1).in_pool(pool.id()))
        .unwrap();
    let first_info = allocator.get_allocation_info(first).unwrap();
    let second_info = allocator.get_allocation_info(second).unwrap();
    assert!(first_info.offset < 16 * MB);
    assert_disjoint(&first_info, &second_info);

    let err = allocator
        .allocate(&AllocationDesc::new(8 * MB, 1).in_pool(pool.id()))
        .unwrap_err();
    assert!(err.is_out_of_memory(), "unexpected error: {}", err);

    allocator.free(second).unwrap();
    let third = allocator
        .allocate(&AllocationDesc::new(8 * MB, 1).in_pool(pool.id()))
        .unwrap();
    let third_info = allocator.get_allocation_info(third).unwrap();
    assert_disjoint(&first_info, &third_info);
    assert_eq!(pool.block_count(), 1);
    assert!(pool.validate());
}

#[test]
fn test_pool_block_count_limits() {
    let (provider, allocator) = setup();
    let pool = allocator
        .create_pool(
            PoolDesc::new(PlacementCategory::DeviceLocal)
                .with_block_size(11 * MB)
                .with_block_count(1, 2),
        )
        .unwrap();
    assert_eq!(pool.block_count(), 1);
    assert_eq!(provider.live_regions(), 1);

    let mut allocations = Vec::new();
    for _ in 0..4 {
        allocations.push(
            allocator
                .allocate(&AllocationDesc::new(5 * MB, 1).in_pool(pool.id()))
                .unwrap(),
        );
    }
    assert_eq!(pool.block_count(), 2);

    let err = allocator
        .allocate(&AllocationDesc::new(5 * MB, 1).in_pool(pool.id()))
        .unwrap_err();
    assert!(err.is_out_of_memory());

    allocator.free(allocations.pop().unwrap()).unwrap();
    allocator
        .allocate(&AllocationDesc::new(5 * MB, 1).in_pool(pool.id()))
        .expect("retry after free");
    assert_eq!(pool.block_count(), 2);
}

#[test]
fn test_empty_block_released_above_min_count() {
    let (provider, allocator) = setup();
    let pool = allocator
        .create_pool(
            PoolDesc::new(PlacementCategory::Upload)
                .with_block_size(MB)
                .with_block_count(1, 0),
        )
        .unwrap();

    let a = allocator
        .allocate(&AllocationDesc::new(MB, 1).in_pool(pool.id()))
        .unwrap();
    let b = allocator
        .allocate(&AllocationDesc::new(MB, 1).in_pool(pool.id()))
        .unwrap();
    assert_eq!(pool.block_count(), 2);

    allocator.free(b).unwrap();
    assert_eq!(pool.block_count(), 1);
    allocator.free(a).unwrap();
    assert_eq!(pool.block_count(), 1, "min_block_count keeps the last block");
    assert_eq!(provider.live_regions(), 1);
}

#[test]
fn test_never_allocate_uses_existing_blocks_only() {
    let (_provider, allocator) = setup();
    let pool = allocator
        .create_pool(PoolDesc::new(PlacementCategory::DeviceLocal).with_block_size(MB))
        .unwrap();
    assert_eq!(pool.block_count(), 0);

    let desc = AllocationDesc::new(KB, 1)
        .in_pool(pool.id())
        .with_flags(AllocationFlags::NEVER_ALLOCATE);
    assert!(allocator.allocate(&desc).unwrap_err().is_out_of_memory());

    allocator
        .allocate(&AllocationDesc::new(KB, 1).in_pool(pool.id()))
        .unwrap();
    assert_eq!(pool.block_count(), 1);
    allocator.allocate(&desc).expect("fits in the existing block");
    assert_eq!(pool.block_count(), 1);
}

#[test]
fn test_committed_flag_validation() {
    let (_provider, allocator) = setup();
    let fixed = allocator
        .create_pool(PoolDesc::new(PlacementCategory::DeviceLocal).with_block_size(MB))
        .unwrap();

    let in_fixed = AllocationDesc::new(KB, 1)
        .in_pool(fixed.id())
        .with_flags(AllocationFlags::COMMITTED);
    assert!(matches!(
        allocator.allocate(&in_fixed),
        Err(AllocError::InvalidArgument(_))
    ));

    let contradictory = AllocationDesc::new(KB, 1)
        .with_flags(AllocationFlags::COMMITTED | AllocationFlags::NEVER_ALLOCATE);
    assert!(matches!(
        allocator.allocate(&contradictory),
        Err(AllocError::InvalidArgument(_))
    ));
}

#[test]
fn test_default_pool_routes_large_requests_to_dedicated() {
    let (provider, allocator) = setup();
    let preferred = allocator.config().preferred_block_size;

    let large = allocator
        .allocate(&AllocationDesc::new(preferred / 2 + 1, 1))
        .unwrap();
    let info = allocator.get_allocation_info(large).unwrap();
    assert!(info.is_dedicated());
    assert_eq!(info.offset, 0);
    assert_eq!(
        allocator
            .default_pool(PlacementCategory::DeviceLocal)
            .block_count(),
        0
    );

    let small = allocator.allocate(&AllocationDesc::new(KB, 1)).unwrap();
    assert!(!allocator.get_allocation_info(small).unwrap().is_dedicated());

    let committed = allocator
        .allocate(&AllocationDesc::new(KB, 1).with_flags(AllocationFlags::COMMITTED))
        .unwrap();
    assert!(allocator.get_allocation_info(committed).unwrap().is_dedicated());

    let regions = provider.live_regions();
    allocator.free(large).unwrap();
    allocator.free(committed).unwrap();
    assert_eq!(provider.live_regions(), regions - 2);
}

#[test]
fn test_always_committed_config() {
    let config = AllocatorConfig {
        always_committed: true,
        ..AllocatorConfig::default()
    };
    let (_provider, allocator) = setup_with(SimulatedProvider::unlimited(), config);
    let a = allocator.allocate(&AllocationDesc::new(256, 1)).unwrap();
    assert!(allocator.get_allocation_info(a).unwrap().is_dedicated());
}

#[test]
fn test_default_pool_falls_back_to_dedicated() {
    let (provider, allocator) = setup_with(
        SimulatedProvider::new(3 * MB),
        AllocatorConfig::default(),
    );
    // Every block size the pool tries exceeds the 3MB capacity
    let a = allocator
        .allocate(&AllocationDesc::new(2 * MB, 1))
        .expect("dedicated fallback");
    assert!(allocator.get_allocation_info(a).unwrap().is_dedicated());
    assert_eq!(provider.used_bytes(), 2 * MB);

    let err = allocator
        .allocate(&AllocationDesc::new(2 * MB, 1))
        .unwrap_err();
    assert!(err.is_out_of_memory());
}

#[test]
fn test_provider_failure_leaves_pool_untouched() {
    let (provider, allocator) = setup();
    let pool = allocator
        .create_pool(PoolDesc::new(PlacementCategory::Readback).with_block_size(MB))
        .unwrap();

    provider.fail_next_creates(1);
    let err = allocator
        .allocate(&AllocationDesc::new(KB, 1).in_pool(pool.id()))
        .unwrap_err();
    assert!(matches!(err, AllocError::ProviderFailure(_)));
    assert_eq!(pool.block_count(), 0);
    assert_eq!(pool.allocation_count(), 0);

    allocator
        .allocate(&AllocationDesc::new(KB, 1).in_pool(pool.id()))
        .expect("provider recovered");
}

#[test]
fn test_stale_and_foreign_handles_rejected() {
    let (_provider, allocator) = setup();
    let a = allocator.allocate(&AllocationDesc::new(KB, 1)).unwrap();
    allocator.free(a).unwrap();

    assert!(matches!(allocator.free(a), Err(AllocError::InvalidArgument(_))));
    assert!(allocator.get_allocation_info(a).is_err());
    assert!(allocator.set_user_data(a, 1).is_err());

    // Slot reuse must not revive the old handle
    let b = allocator.allocate(&AllocationDesc::new(KB, 1)).unwrap();
    assert_ne!(a, b);
    assert!(allocator.get_allocation_info(a).is_err());

    let (_other_provider, other) = setup();
    assert!(other.free(b).is_err());
    assert!(allocator.free(b).is_ok());
}

#[test]
fn test_user_data_name_and_frame() {
    let (_provider, allocator) = setup();
    allocator.set_current_frame_index(42);
    let a = allocator
        .allocate(
            &AllocationDesc::new(3 * KB, 256)
                .with_category(PlacementCategory::Upload)
                .with_user_data(7)
                .with_name("vertex-buffer"),
        )
        .unwrap();

    let info = allocator.get_allocation_info(a).unwrap();
    assert_eq!(info.category, PlacementCategory::Upload);
    assert_eq!(info.size, 3 * KB);
    assert_eq!(info.alignment, 256);
    assert_eq!(info.offset % 256, 0);
    assert_eq!(info.user_data, 7);
    assert_eq!(info.name.as_ref().map(|n| n.as_str()), Some("vertex-buffer"));
    assert_eq!(info.creation_frame, 42);

    allocator.set_user_data(a, 99).unwrap();
    allocator.set_name(a, None).unwrap();
    let info = allocator.get_allocation_info(a).unwrap();
    assert_eq!(info.user_data, 99);
    assert!(info.name.is_none());
}

#[test]
fn test_zeroed_only_for_untouched_ranges() {
    let (_provider, allocator) = setup();
    let pool = allocator
        .create_pool(PoolDesc::new(PlacementCategory::DeviceLocal).with_block_size(MB))
        .unwrap();

    let a = allocator
        .allocate(&AllocationDesc::new(64 * KB, 1).in_pool(pool.id()))
        .unwrap();
    assert!(allocator.get_allocation_info(a).unwrap().zeroed);
    let keep = allocator
        .allocate(&AllocationDesc::new(64 * KB, 1).in_pool(pool.id()))
        .unwrap();
    allocator.free(a).unwrap();

    let reused = allocator
        .allocate(
            &AllocationDesc::new(64 * KB, 1)
                .in_pool(pool.id())
                .with_flags(AllocationFlags::STRATEGY_MIN_OFFSET),
        )
        .unwrap();
    let info = allocator.get_allocation_info(reused).unwrap();
    assert_eq!(info.offset, 0);
    assert!(!info.zeroed);
    allocator.free(keep).unwrap();
}

#[test]
fn test_dirty_provider_and_not_zeroed_config() {
    let (_provider, allocator) = setup_with(
        SimulatedProvider::unlimited().with_dirty_regions(),
        AllocatorConfig::default(),
    );
    let a = allocator.allocate(&AllocationDesc::new(KB, 1)).unwrap();
    assert!(!allocator.get_allocation_info(a).unwrap().zeroed);

    let config = AllocatorConfig {
        default_pools_not_zeroed: true,
        ..AllocatorConfig::default()
    };
    let (_provider, allocator) = setup_with(SimulatedProvider::unlimited(), config);
    let b = allocator.allocate(&AllocationDesc::new(KB, 1)).unwrap();
    assert!(!allocator.get_allocation_info(b).unwrap().zeroed);
}

#[test]
fn test_within_budget_blocks_growth() {
    let provider = SimulatedProvider::unlimited().with_segment_budget(MemorySegment::Local, 4 * MB);
    let (_provider, allocator) = setup_with(provider, AllocatorConfig::default());
    let pool = allocator
        .create_pool(PoolDesc::new(PlacementCategory::DeviceLocal).with_block_size(3 * MB))
        .unwrap();

    let desc = AllocationDesc::new(2 * MB, 1)
        .in_pool(pool.id())
        .with_flags(AllocationFlags::WITHIN_BUDGET);
    allocator.allocate(&desc).expect("first block fits the budget");

    // A second 3MB block would cross 4MB
    assert!(allocator.allocate(&desc).unwrap_err().is_out_of_memory());

    // Without the flag the budget is advisory
    allocator
        .allocate(&AllocationDesc::new(2 * MB, 1).in_pool(pool.id()))
        .expect("over budget is allowed without the flag");
    assert!(allocator.get_budget(MemorySegment::Local).usage_bytes > 4 * MB);
}

#[test]
fn test_min_reserved_bytes_prewarms_blocks() {
    let (provider, allocator) = setup();
    let pool = allocator
        .create_pool(
            PoolDesc::new(PlacementCategory::DeviceLocal)
                .with_block_size(MB)
                .with_min_reserved_bytes(3 * MB),
        )
        .unwrap();
    assert_eq!(pool.block_count(), 3);

    pool.set_min_reserved_bytes(0).unwrap();
    assert_eq!(pool.block_count(), 0);
    assert_eq!(provider.live_regions(), 0);

    allocator
        .set_default_pool_min_bytes(PlacementCategory::Readback, 2 * MB)
        .unwrap();
    assert!(
        allocator
            .default_pool(PlacementCategory::Readback)
            .statistics()
            .block_bytes
            >= 2 * MB
    );
}

#[test]
fn test_invalid_pool_descriptions() {
    let (_provider, allocator) = setup();
    assert!(allocator
        .create_pool(PoolDesc::new(PlacementCategory::DeviceLocal).with_block_count(3, 2))
        .is_err());
    assert!(allocator
        .create_pool(
            PoolDesc::new(PlacementCategory::DeviceLocal).with_min_allocation_alignment(3)
        )
        .is_err());
    assert!(allocator.allocate(&AllocationDesc::new(0, 1)).is_err());
    assert!(allocator.allocate(&AllocationDesc::new(KB, 3)).is_err());
    assert!(allocator
        .allocate(&AllocationDesc::new(KB, 1).in_pool(u64::MAX))
        .is_err());
}

#[test]
fn test_huge_request_in_flexible_pool_fails_cleanly() {
    let (provider, allocator) = setup_with(SimulatedProvider::new(MB * KB), AllocatorConfig::default());
    let pool = allocator
        .create_pool(PoolDesc::new(PlacementCategory::DeviceLocal))
        .unwrap();
    let small = allocator
        .allocate(&AllocationDesc::new(KB, 1).in_pool(pool.id()))
        .unwrap();
    let regions = provider.live_regions();

    for size in [(1u64 << 63) + 1, u64::MAX - 4, u64::MAX] {
        let err = allocator
            .allocate(&AllocationDesc::new(size, 1).in_pool(pool.id()))
            .unwrap_err();
        assert!(err.is_out_of_memory(), "size {}: {}", size, err);
    }

    assert_eq!(provider.live_regions(), regions);
    assert_eq!(pool.block_count(), 1);
    assert!(pool.validate());
    allocator.free(small).unwrap();
}

#[test]
fn test_huge_request_with_debug_margin_fails_cleanly() {
    let config = AllocatorConfig {
        debug_margin: 16,
        ..AllocatorConfig::default()
    };
    let (_provider, allocator) = setup_with(SimulatedProvider::unlimited(), config);
    let pool = allocator
        .create_pool(PoolDesc::new(PlacementCategory::DeviceLocal).with_block_size(MB))
        .unwrap();

    let err = allocator
        .allocate(&AllocationDesc::new(u64::MAX - 4, 1).in_pool(pool.id()))
        .unwrap_err();
    assert!(matches!(err, AllocError::OutOfMemory { .. }), "unexpected error: {}", err);
    assert_eq!(pool.block_count(), 0);
}

#[test]
fn test_huge_request_in_default_pool_fails_cleanly() {
    let (provider, allocator) = setup_with(
        SimulatedProvider::unlimited().with_granularity(64 * KB),
        AllocatorConfig::default(),
    );
    for category in [PlacementCategory::DeviceLocal, PlacementCategory::Upload] {
        let err = allocator
            .allocate(&AllocationDesc::new(u64::MAX - 4, 1).with_category(category))
            .unwrap_err();
        assert!(err.is_out_of_memory(), "{:?}: {}", category, err);
    }
    assert_eq!(provider.live_regions(), 0);
    assert!(allocator.validate());
}

#[test]
fn test_pool_capacity_overflow_rejected() {
    let (_provider, allocator) = setup();
    let err = allocator
        .create_pool(
            PoolDesc::new(PlacementCategory::DeviceLocal)
                .with_block_size(u64::MAX / 2)
                .with_block_count(0, 4)
                .with_min_reserved_bytes(MB),
        )
        .unwrap_err();
    assert!(matches!(err, AllocError::InvalidArgument(_)), "unexpected error: {}", err);

    // The largest capacity that still fits is accepted
    allocator
        .create_pool(
            PoolDesc::new(PlacementCategory::DeviceLocal)
                .with_block_size(u64::MAX / 4)
                .with_block_count(0, 4),
        )
        .unwrap();
}

#[test]
fn test_pool_name_and_destroy() {
    let (provider, allocator) = setup();
    let pool = allocator
        .create_pool(
            PoolDesc::new(PlacementCategory::DeviceLocal)
                .with_block_size(MB)
                .with_block_count(1, 0)
                .with_name("meshes"),
        )
        .unwrap();
    assert_eq!(pool.name().as_ref().map(|n| n.as_str()), Some("meshes"));
    pool.set_name(None);
    assert!(pool.name().is_none());

    let a = allocator
        .allocate(&AllocationDesc::new(KB, 1).in_pool(pool.id()))
        .unwrap();
    assert!(allocator.destroy_pool(pool.id()).is_err());
    allocator.free(a).unwrap();

    let id = pool.id();
    allocator.destroy_pool(id).unwrap();
    assert!(allocator.pool(id).is_none());
    assert!(allocator.destroy_pool(id).is_err());

    // Regions go away with the last handle
    assert_eq!(provider.live_regions(), 1);
    drop(pool);
    assert_eq!(provider.live_regions(), 0);

    let default_id = allocator.default_pool(PlacementCategory::Upload).id();
    assert!(allocator.destroy_pool(default_id).is_err());
}
