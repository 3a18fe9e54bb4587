/*!
 * Invariant Tests
 * Randomized workloads checking no-overlap and byte conservation
 */

use super::common::{assert_sorted_disjoint, setup, KB};
use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use region_suballoc::memory::metadata::Metadata;
use region_suballoc::memory::traits::BlockMetadata;
use region_suballoc::Strategy as SearchStrategy;
use region_suballoc::{
    Algorithm, AllocationDesc, PlacementCategory, PoolDesc, VirtualAllocationDesc, VirtualBlock,
    VirtualBlockDesc,
};

#[derive(Debug, Clone)]
enum Op {
    Alloc { size: u64, align_shift: u32 },
    Free { index: usize },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (1u64..=8 * KB, 0u32..=10).prop_map(|(size, align_shift)| Op::Alloc { size, align_shift }),
        2 => any::<usize>().prop_map(|index| Op::Free { index }),
    ]
}

fn check_conservation(metadata: &Metadata) {
    let allocations = metadata.allocations();
    assert_sorted_disjoint(&allocations);
    let live: u64 = allocations.iter().map(|a| a.size).sum();
    let margins = metadata.allocation_count() as u64 * metadata.debug_margin();
    assert_eq!(live + margins + metadata.sum_free_size(), metadata.size());
    assert!(metadata.validate());
}

fn run_metadata_ops(algorithm: Algorithm, margin: u64, ops: &[Op], strategy: SearchStrategy) {
    let mut metadata = Metadata::new(algorithm, 256 * KB, margin, false);
    let mut live = Vec::new();
    for op in ops {
        match *op {
            Op::Alloc { size, align_shift } => {
                if let Some(request) =
                    metadata.allocate(size, 1 << align_shift, false, strategy, 0)
                {
                    assert_eq!(request.offset % (1 << align_shift), 0);
                    live.push(request.handle);
                }
            }
            Op::Free { index } => {
                if !live.is_empty() {
                    let handle = live.swap_remove(index % live.len());
                    metadata.free(handle);
                }
            }
        }
        check_conservation(&metadata);
    }

    for handle in live {
        metadata.free(handle);
    }
    assert!(metadata.is_empty());
    assert!(
        metadata
            .allocate(256 * KB - margin, 1, false, SearchStrategy::MinMemory, 0)
            .is_some(),
        "full-block allocation must succeed after freeing everything"
    );
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_general_no_overlap_and_conservation(
        ops in prop::collection::vec(op_strategy(), 1..200),
        strategy in prop_oneof![
            Just(SearchStrategy::MinMemory),
            Just(SearchStrategy::MinTime),
            Just(SearchStrategy::MinOffset),
        ],
    ) {
        run_metadata_ops(Algorithm::General, 0, &ops, strategy);
    }

    #[test]
    fn prop_general_with_margin(ops in prop::collection::vec(op_strategy(), 1..200)) {
        run_metadata_ops(Algorithm::General, 32, &ops, SearchStrategy::MinMemory);
    }

    #[test]
    fn prop_linear_no_overlap_and_conservation(
        ops in prop::collection::vec(op_strategy(), 1..200),
    ) {
        run_metadata_ops(Algorithm::Linear, 0, &ops, SearchStrategy::MinMemory);
    }

    #[test]
    fn prop_virtual_block_handles(sizes in prop::collection::vec(1u64..=4 * KB, 1..64)) {
        let mut block = VirtualBlock::new(VirtualBlockDesc::new(128 * KB)).unwrap();
        let mut live = Vec::new();
        for size in &sizes {
            if let Ok((handle, offset)) = block.allocate(&VirtualAllocationDesc::new(*size, 1)) {
                live.push((handle, offset, *size));
            }
        }
        for (handle, offset, size) in &live {
            let info = block.get_allocation_info(*handle).unwrap();
            prop_assert_eq!(info.offset, *offset);
            prop_assert_eq!(info.size, *size);
        }
        for (handle, _, _) in live {
            block.free(handle).unwrap();
            prop_assert!(block.free(handle).is_err());
        }
        prop_assert!(block.is_empty());
    }
}

#[test]
fn test_pool_random_workload_stays_consistent() {
    let (_provider, allocator) = setup();
    let pool = allocator
        .create_pool(
            PoolDesc::new(PlacementCategory::DeviceLocal)
                .with_block_size(512 * KB)
                .with_block_count(0, 8),
        )
        .unwrap();

    let mut rng = StdRng::seed_from_u64(0xdead_beef);
    let mut live = Vec::new();
    for step in 0..2_000 {
        if live.is_empty() || rng.gen_bool(0.6) {
            let desc = AllocationDesc::new(rng.gen_range(1..=32 * KB), 1 << rng.gen_range(0..8u32))
                .in_pool(pool.id());
            if let Ok(allocation) = allocator.allocate(&desc) {
                live.push(allocation);
            }
        } else {
            let victim = live.swap_remove(rng.gen_range(0..live.len()));
            allocator.free(victim).unwrap();
        }

        if step % 100 == 0 {
            assert!(pool.validate(), "pool inconsistent at step {}", step);
        }
    }

    let mut infos: Vec<_> = live
        .iter()
        .map(|a| allocator.get_allocation_info(*a).unwrap())
        .collect();
    infos.sort_by_key(|info| (info.region, info.offset));
    for pair in infos.windows(2) {
        if pair[0].region == pair[1].region {
            assert!(pair[0].end() <= pair[1].offset);
        }
    }

    for allocation in live {
        allocator.free(allocation).unwrap();
    }
    assert_eq!(pool.allocation_count(), 0);
    assert_eq!(pool.block_count(), 0);
}
