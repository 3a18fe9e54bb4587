/*!
 * Concurrency Stress Tests
 * One allocator shared by many threads allocating, freeing and reading statistics
 */

use super::common::{setup, KB, MB};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use region_suballoc::{AllocationDesc, PlacementCategory, PoolDesc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

const THREADS: u64 = 8;
const OPS_PER_THREAD: usize = 3_000;

#[test]
fn test_shared_allocator_stress() {
    let (provider, allocator) = setup();
    let allocator = Arc::new(allocator);
    let pool = allocator
        .create_pool(PoolDesc::new(PlacementCategory::DeviceLocal).with_block_size(4 * MB))
        .unwrap();
    let pool_id = pool.id();

    let allocated = Arc::new(AtomicU64::new(0));
    let mut handles = Vec::new();

    for seed in 0..THREADS {
        let allocator = Arc::clone(&allocator);
        let allocated = Arc::clone(&allocated);

        handles.push(thread::spawn(move || {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut live = Vec::new();
            for _ in 0..OPS_PER_THREAD {
                match rng.gen_range(0..10u32) {
                    0..=5 => {
                        let mut desc =
                            AllocationDesc::new(rng.gen_range(1..=64u64) * KB, 1 << rng.gen_range(0..8u32))
                                .with_user_data(seed);
                        if rng.gen_bool(0.5) {
                            desc = desc.in_pool(pool_id);
                        } else if rng.gen_bool(0.3) {
                            desc = desc.with_category(PlacementCategory::Upload);
                        }
                        let allocation = allocator.allocate(&desc).unwrap();
                        allocated.fetch_add(1, Ordering::Relaxed);
                        live.push(allocation);
                    }
                    6..=8 => {
                        if !live.is_empty() {
                            let victim = live.swap_remove(rng.gen_range(0..live.len()));
                            allocator.free(victim).unwrap();
                        }
                    }
                    _ => {
                        let totals = allocator.calculate_statistics();
                        assert!(totals.total.stats.allocation_bytes <= totals.total.stats.block_bytes);
                    }
                }
            }

            // Every handle this thread holds still resolves to its own data
            for allocation in &live {
                let info = allocator.get_allocation_info(*allocation).unwrap();
                assert_eq!(info.user_data, seed);
            }
            for allocation in live {
                allocator.free(allocation).unwrap();
            }
        }));
    }

    for handle in handles {
        handle.join().unwrap();
    }

    assert!(allocated.load(Ordering::Relaxed) > 0);
    assert!(allocator.validate());
    assert_eq!(allocator.calculate_statistics().total.stats.allocation_count, 0);
    assert_eq!(pool.block_count(), 0);
    assert_eq!(provider.live_regions(), 0);
}

#[test]
fn test_concurrent_pool_creation_and_destruction() {
    let (provider, allocator) = setup();
    let allocator = Arc::new(allocator);
    let mut handles = Vec::new();

    for seed in 0..THREADS {
        let allocator = Arc::clone(&allocator);
        handles.push(thread::spawn(move || {
            for round in 0..50u64 {
                let pool = allocator
                    .create_pool(
                        PoolDesc::new(PlacementCategory::Readback)
                            .with_block_size(MB)
                            .with_block_count(0, 2),
                    )
                    .unwrap();
                let allocation = allocator
                    .allocate(
                        &AllocationDesc::new(64 * KB, 256)
                            .in_pool(pool.id())
                            .with_user_data(seed * 1_000 + round),
                    )
                    .unwrap();
                assert_eq!(
                    allocator.get_allocation_info(allocation).unwrap().user_data,
                    seed * 1_000 + round
                );
                allocator.free(allocation).unwrap();
                allocator.destroy_pool(pool.id()).unwrap();
            }
        }));
    }

    for handle in handles {
        handle.join().unwrap();
    }

    assert!(allocator.validate());
    assert_eq!(provider.live_regions(), 0);
}
