/*!
 * Allocator
 *
 * Entry point of the engine. Owns one default pool per placement
 * category and a registry of custom pools, routes requests, and sums
 * per-pool statistics on demand.
 */

use super::config::AllocatorConfig;
use super::defrag::{DefragmentationContext, DefragmentationDesc};
use super::pool::{Allocation, Pool, PoolSettings};
use super::provider::RegionProvider;
use super::stats::{Budget, DetailedStatistics, TotalStatistics};
use super::types::{
    AllocationDesc, AllocationFlags, AllocationInfo, MemorySegment, PlacementCategory, PoolDesc,
};
use crate::core::data_structures::InlineString;
use crate::core::errors::{AllocError, AllocResult};
use crate::core::types::{DeviceSize, FrameIndex, PoolId, UserData};
use ahash::RandomState;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct Allocator {
    config: AllocatorConfig,
    provider: Arc<dyn RegionProvider>,
    default_pools: [Pool; PlacementCategory::COUNT],
    custom_pools: DashMap<PoolId, Pool, RandomState>,
    frame_index: AtomicU32,
}

impl std::fmt::Debug for Allocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Allocator")
            .field("config", &self.config)
            .field("custom_pools", &self.custom_pools.len())
            .field("frame_index", &self.current_frame_index())
            .finish()
    }
}

impl Allocator {
    /// Create an allocator with default configuration
    pub fn new(provider: Arc<dyn RegionProvider>) -> AllocResult<Self> {
        Self::with_config(provider, AllocatorConfig::default())
    }

    pub fn with_config(
        provider: Arc<dyn RegionProvider>,
        config: AllocatorConfig,
    ) -> AllocResult<Self> {
        config.validate()?;

        let make_default = |category: PlacementCategory| {
            Pool::create(
                provider.clone(),
                PoolSettings {
                    desc: PoolDesc::new(category),
                    is_default: true,
                    preferred_block_size: config.preferred_block_size,
                    debug_margin: config.debug_margin,
                    min_allocation_alignment: config.min_allocation_alignment,
                    default_strategy: config.default_strategy,
                    always_committed: config.always_committed,
                    zeroed_allowed: !config.default_pools_not_zeroed,
                },
            )
        };
        let default_pools = [
            make_default(PlacementCategory::DeviceLocal)?,
            make_default(PlacementCategory::Upload)?,
            make_default(PlacementCategory::Readback)?,
            make_default(PlacementCategory::GpuUpload)?,
        ];

        info!(
            preferred_block_size = config.preferred_block_size,
            debug_margin = config.debug_margin,
            uma = provider.is_uma(),
            "allocator initialized"
        );

        Ok(Self {
            config,
            provider,
            default_pools,
            custom_pools: DashMap::with_hasher(RandomState::new()),
            frame_index: AtomicU32::new(0),
        })
    }

    #[inline]
    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    #[inline]
    pub fn provider(&self) -> &Arc<dyn RegionProvider> {
        &self.provider
    }

    /// Default pool of a placement category
    #[inline]
    pub fn default_pool(&self, category: PlacementCategory) -> &Pool {
        &self.default_pools[category.index()]
    }

    /// Custom or default pool by id
    pub fn pool(&self, id: PoolId) -> Option<Pool> {
        self.default_pools
            .iter()
            .find(|p| p.id() == id)
            .cloned()
            .or_else(|| self.custom_pools.get(&id).map(|p| p.value().clone()))
    }

    fn resolve_pool(&self, id: PoolId) -> AllocResult<Pool> {
        self.pool(id)
            .ok_or_else(|| AllocError::invalid(format!("unknown pool {}", id)))
    }

    pub fn allocate(&self, desc: &AllocationDesc) -> AllocResult<Allocation> {
        if desc.size == 0 {
            return Err(AllocError::invalid("allocation size must be non-zero"));
        }
        if desc.alignment != 0 && !desc.alignment.is_power_of_two() {
            return Err(AllocError::invalid("alignment must be 0 or a power of two"));
        }

        let pool = match desc.pool {
            Some(id) => self.resolve_pool(id)?,
            None => self.default_pool(desc.category).clone(),
        };

        let headroom = if desc.flags.contains(AllocationFlags::WITHIN_BUDGET) {
            let segment = pool.category().segment(self.provider.is_uma());
            Some(self.get_budget(segment).headroom())
        } else {
            None
        };

        let result = pool.allocate(desc, self.current_frame_index(), headroom);
        if let Err(e) = &result {
            debug!(pool = pool.id(), size = desc.size, error = %e, "allocation failed");
        }
        result
    }

    pub fn free(&self, allocation: Allocation) -> AllocResult<()> {
        self.resolve_pool(allocation.pool())?.free(allocation)
    }

    pub fn set_user_data(&self, allocation: Allocation, user_data: UserData) -> AllocResult<()> {
        self.resolve_pool(allocation.pool())?
            .set_user_data(allocation, user_data)
    }

    pub fn set_name(&self, allocation: Allocation, name: Option<&str>) -> AllocResult<()> {
        self.resolve_pool(allocation.pool())?
            .set_allocation_name(allocation, name.map(InlineString::from))
    }

    pub fn get_allocation_info(&self, allocation: Allocation) -> AllocResult<AllocationInfo> {
        self.resolve_pool(allocation.pool())?
            .allocation_info(allocation)
    }

    /// Register a custom pool
    pub fn create_pool(&self, desc: PoolDesc) -> AllocResult<Pool> {
        let pool = Pool::create(
            self.provider.clone(),
            PoolSettings {
                desc,
                is_default: false,
                preferred_block_size: self.config.preferred_block_size,
                debug_margin: self.config.debug_margin,
                min_allocation_alignment: self.config.min_allocation_alignment,
                default_strategy: self.config.default_strategy,
                always_committed: false,
                zeroed_allowed: true,
            },
        )?;
        self.custom_pools.insert(pool.id(), pool.clone());
        Ok(pool)
    }

    /// Unregister a custom pool; it must not hold live allocations
    ///
    /// The pool's regions are released once every clone of the handle is gone.
    pub fn destroy_pool(&self, id: PoolId) -> AllocResult<()> {
        let pool = match self.custom_pools.get(&id) {
            Some(entry) => entry.value().clone(),
            None => {
                return Err(AllocError::invalid(format!(
                    "unknown or default pool {}",
                    id
                )))
            }
        };
        let live = pool.allocation_count();
        if live > 0 {
            return Err(AllocError::invalid(format!(
                "pool {} still holds {} allocations",
                id, live
            )));
        }
        self.custom_pools.remove(&id);
        info!(pool = id, "destroyed pool");
        Ok(())
    }

    /// Walk every pool and sum detailed statistics
    pub fn calculate_statistics(&self) -> TotalStatistics {
        let is_uma = self.provider.is_uma();
        let mut total = TotalStatistics::default();

        let mut add = |pool: &Pool| {
            let stats = pool.calculate_statistics();
            let category = pool.category();
            total.categories[category.index()].add(&stats);
            total.segments[category.segment(is_uma).index()].add(&stats);
            total.total.add(&stats);
        };
        self.default_pools.iter().for_each(&mut add);
        for entry in self.custom_pools.iter() {
            add(entry.value());
        }
        total
    }

    /// Usage and budget of one memory segment
    pub fn get_budget(&self, segment: MemorySegment) -> Budget {
        let is_uma = self.provider.is_uma();
        let mut budget = Budget::default();

        let mut add = |pool: &Pool| {
            if pool.category().segment(is_uma) == segment {
                budget.stats.add(&pool.statistics());
            }
        };
        self.default_pools.iter().for_each(&mut add);
        for entry in self.custom_pools.iter() {
            add(entry.value());
        }

        match self.provider.segment_budget(segment) {
            Some(reported) => {
                budget.usage_bytes = reported.usage_bytes;
                budget.budget_bytes = reported.budget_bytes;
            }
            None => {
                budget.usage_bytes = budget.stats.block_bytes;
                budget.budget_bytes = self
                    .config
                    .segment_budget(segment)
                    .unwrap_or(DeviceSize::MAX);
            }
        }
        if budget.usage_bytes > budget.budget_bytes {
            warn!(
                segment = ?segment,
                usage = budget.usage_bytes,
                budget = budget.budget_bytes,
                "memory segment over budget"
            );
        }
        budget
    }

    /// Defragment every default pool
    pub fn begin_defragmentation(
        &self,
        desc: DefragmentationDesc,
    ) -> AllocResult<DefragmentationContext> {
        DefragmentationContext::new(self.default_pools.to_vec(), desc)
    }

    /// Stamp subsequent allocations with `frame`
    pub fn set_current_frame_index(&self, frame: FrameIndex) {
        self.frame_index.store(frame, Ordering::Relaxed);
    }

    #[inline]
    pub fn current_frame_index(&self) -> FrameIndex {
        self.frame_index.load(Ordering::Relaxed)
    }

    /// Keep at least `bytes` reserved in the default pool of `category`
    pub fn set_default_pool_min_bytes(
        &self,
        category: PlacementCategory,
        bytes: DeviceSize,
    ) -> AllocResult<()> {
        self.default_pool(category).set_min_reserved_bytes(bytes)
    }

    /// Summed detailed statistics of one category
    pub fn category_statistics(&self, category: PlacementCategory) -> DetailedStatistics {
        *self.calculate_statistics().category(category)
    }

    /// Check every pool's consistency
    pub fn validate(&self) -> bool {
        self.default_pools.iter().all(Pool::validate)
            && self.custom_pools.iter().all(|entry| entry.value().validate())
    }
}
