/*!
 * Sub-Allocator Simulation - Main Entry Point
 *
 * Drives the allocator against a simulated provider:
 * - Fragmenting workload over default and custom pools
 * - Full defragmentation with byte copies through the provider
 * - Statistics snapshots before and after, as JSON
 */

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use region_suballoc::monitoring::span_operation;
use region_suballoc::{
    init_tracing, Allocation, AllocationDesc, Allocator, AllocatorConfig,
    DefragmentationAlgorithm, DefragmentationDesc, MemorySegment, PassOutcome, PlacementCategory,
    PoolDesc, RegionProvider, SimulatedProvider,
};
use std::sync::Arc;
use tracing::{info, warn};

const KB: u64 = 1024;
const MB: u64 = 1024 * KB;

fn main() -> Result<()> {
    init_tracing();

    let config = AllocatorConfig::from_env().context("invalid SUBALLOC_* configuration")?;
    let capacity = std::env::var("SUBALLOC_SIM_CAPACITY")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(1024 * MB);
    let seed = std::env::var("SUBALLOC_SIM_SEED")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(0x5eed);

    info!("Sub-allocator simulation starting...");
    info!(capacity, seed, ?config, "configuration loaded");

    let provider = Arc::new(SimulatedProvider::new(capacity).with_granularity(64 * KB));
    let allocator = Allocator::with_config(provider.clone(), config)?;

    let pool = allocator.create_pool(
        PoolDesc::new(PlacementCategory::DeviceLocal)
            .with_block_size(16 * MB)
            .with_block_count(1, 0)
            .with_name("textures"),
    )?;

    let mut rng = StdRng::seed_from_u64(seed);
    let mut live: Vec<Allocation> = Vec::new();

    {
        let span = span_operation("workload");
        let _entered = span.enter();
        for round in 0..2_000u32 {
            allocator.set_current_frame_index(round / 100);
            let size = rng.gen_range(1..=256u64) * KB;
            let alignment = 1u64 << rng.gen_range(0..=12u32);
            let desc = AllocationDesc::new(size, alignment)
                .in_pool(pool.id())
                .with_user_data(round as u64);
            match allocator.allocate(&desc) {
                Ok(allocation) => {
                    let info = allocator.get_allocation_info(allocation)?;
                    provider.write_bytes(info.region, info.offset, &round.to_le_bytes())?;
                    live.push(allocation);
                }
                Err(e) => warn!(error = %e, size, "allocation failed"),
            }

            // Free roughly half, leaving holes everywhere
            if !live.is_empty() && rng.gen_bool(0.45) {
                let victim = live.swap_remove(rng.gen_range(0..live.len()));
                allocator.free(victim)?;
            }
        }

        for i in 0..64u64 {
            let desc = AllocationDesc::new(4 * KB, 256)
                .with_category(PlacementCategory::Upload)
                .with_name("staging");
            live.push(allocator.allocate(&desc.with_user_data(i))?);
        }
        span.record_items_processed(live.len());
    }

    report(&allocator, "before defragmentation")?;

    let mut context = pool.begin_defragmentation(DefragmentationDesc::new(
        DefragmentationAlgorithm::Full,
    ))?;
    while let Some(mut pass) = context.begin_pass()? {
        for mv in pass.iter_mut() {
            provider.copy_bytes(
                mv.destination_region(),
                mv.destination_offset(),
                mv.source_region(),
                mv.source_offset(),
                mv.size(),
            )?;
        }
        if context.end_pass(pass)? == PassOutcome::Complete {
            break;
        }
    }
    let defrag_stats = context.stats();
    drop(context);
    info!(stats = %serde_json::to_string(&defrag_stats)?, "defragmentation finished");

    verify_contents(&allocator, &provider, &live)?;
    report(&allocator, "after defragmentation")?;

    for allocation in live.drain(..) {
        allocator.free(allocation)?;
    }
    allocator.destroy_pool(pool.id())?;
    drop(pool);
    info!(live_regions = provider.live_regions(), "simulation complete");
    Ok(())
}

fn report(allocator: &Allocator, label: &str) -> Result<()> {
    let stats = allocator.calculate_statistics();
    info!(label, total = %serde_json::to_string(&stats.total)?, "statistics");
    for segment in MemorySegment::ALL {
        let budget = allocator.get_budget(segment);
        info!(
            label,
            segment = ?segment,
            usage = budget.usage_bytes,
            blocks = budget.stats.block_count,
            "budget"
        );
    }
    Ok(())
}

/// Every pool allocation still starts with the round number written at creation
fn verify_contents(
    allocator: &Allocator,
    provider: &SimulatedProvider,
    live: &[Allocation],
) -> Result<()> {
    for &allocation in live {
        let info = allocator.get_allocation_info(allocation)?;
        if info.category != PlacementCategory::DeviceLocal {
            continue;
        }
        let bytes = provider.read_bytes(info.region, info.offset, 4)?;
        let expected = (info.user_data as u32).to_le_bytes();
        anyhow::ensure!(
            bytes == expected,
            "allocation {:?} lost its contents after defragmentation",
            allocation
        );
    }
    info!(checked = live.len(), "contents verified");
    Ok(())
}
