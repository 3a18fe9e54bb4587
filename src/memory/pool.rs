/*!
 * Memory Pool
 *
 * A block vector plus the records of every allocation made through it.
 * Default pools (one per placement category) and custom pools share this
 * type; default pools additionally route large requests to dedicated
 * regions and fall back to them when block growth fails.
 *
 * All mutable state sits behind one `parking_lot::Mutex`. Regions are
 * destroyed after the lock is released.
 */

use super::block_vector::{BlockRequest, BlockVector, BlockVectorDesc};
use super::defrag::{DefragmentationContext, DefragmentationDesc};
use super::metadata::{AllocHandle, RangeDump};
use super::provider::{Region, RegionProvider};
use super::stats::{DetailedStatistics, Statistics};
use super::traits::BlockMetadata;
use super::types::{
    Algorithm, AllocationDesc, AllocationFlags, AllocationInfo, PlacementCategory, PoolDesc,
    Strategy,
};
use crate::core::data_structures::{InlineString, SlotKey, SlotTable};
use crate::core::errors::{AllocError, AllocResult};
use crate::core::limits::{COMMITTED_SIZE_DIVISOR, MIN_ALIGNMENT};
use crate::core::types::{BlockId, DeviceSize, FrameIndex, PoolId, UserData};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Pool ids are unique per process so handles never alias across allocators
static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Handle to a live allocation
///
/// Small and `Copy`. Freed handles are detected through the slot
/// generation and rejected with [`AllocError::InvalidArgument`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Allocation {
    pool: PoolId,
    key: SlotKey,
}

impl Allocation {
    /// Pool the allocation belongs to
    #[inline]
    pub fn pool(&self) -> PoolId {
        self.pool
    }

    #[inline]
    pub(crate) fn key(&self) -> SlotKey {
        self.key
    }
}

/// Where the bytes of an allocation live
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Placement {
    Block { block: BlockId, handle: AllocHandle },
    Dedicated { region: Region },
}

#[derive(Debug, Clone)]
pub(crate) struct AllocationRecord {
    pub placement: Placement,
    pub offset: DeviceSize,
    pub size: DeviceSize,
    pub alignment: DeviceSize,
    pub user_data: UserData,
    pub name: Option<InlineString>,
    pub zeroed: bool,
    pub creation_frame: FrameIndex,
}

/// Settings fixed at pool creation
#[derive(Debug, Clone)]
pub(crate) struct PoolSettings {
    pub desc: PoolDesc,
    pub is_default: bool,
    pub preferred_block_size: DeviceSize,
    pub debug_margin: DeviceSize,
    pub min_allocation_alignment: DeviceSize,
    pub default_strategy: Strategy,
    pub always_committed: bool,
    pub zeroed_allowed: bool,
}

pub(crate) struct PoolState {
    pub name: Option<InlineString>,
    pub vector: BlockVector,
    pub records: SlotTable<AllocationRecord>,
    pub allocation_count: usize,
    pub allocation_bytes: DeviceSize,
    pub dedicated_count: usize,
    pub dedicated_bytes: DeviceSize,
}

impl PoolState {
    /// Remove a record and return its range to the owner
    ///
    /// Returns the region to destroy once the lock is dropped, if any.
    pub fn release_record(&mut self, key: SlotKey) -> Option<(AllocationRecord, Option<Region>)> {
        let record = self.records.remove(key)?;
        self.allocation_count -= 1;
        self.allocation_bytes -= record.size;
        let region = match record.placement {
            Placement::Block { block, handle } => self.vector.free(block, handle),
            Placement::Dedicated { region } => {
                self.dedicated_count -= 1;
                self.dedicated_bytes -= region.size;
                Some(region)
            }
        };
        Some((record, region))
    }
}

pub(crate) struct PoolInner {
    id: PoolId,
    settings: PoolSettings,
    provider: Arc<dyn RegionProvider>,
    state: Mutex<PoolState>,
    defragmenting: AtomicBool,
}

/// Shared handle to a pool
///
/// Cloning is cheap. The pool's regions are released when the last clone
/// is dropped.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("id", &self.inner.id)
            .field("category", &self.inner.settings.desc.category)
            .field("algorithm", &self.inner.settings.desc.algorithm)
            .field("is_default", &self.inner.settings.is_default)
            .finish()
    }
}

impl Pool {
    pub(crate) fn create(
        provider: Arc<dyn RegionProvider>,
        settings: PoolSettings,
    ) -> AllocResult<Self> {
        validate_pool_desc(&settings.desc)?;

        let desc = &settings.desc;
        let explicit = desc.block_size != 0;
        let vector = BlockVector::new(BlockVectorDesc {
            category: desc.category,
            algorithm: desc.algorithm,
            preferred_block_size: if explicit {
                desc.block_size
            } else {
                settings.preferred_block_size
            },
            explicit_block_size: explicit,
            min_block_count: desc.min_block_count,
            max_block_count: desc.max_block_count,
            min_bytes: desc.min_reserved_bytes,
            min_allocation_alignment: desc
                .min_allocation_alignment
                .max(settings.min_allocation_alignment),
            debug_margin: settings.debug_margin,
        });

        let id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);
        let pool = Pool {
            inner: Arc::new(PoolInner {
                id,
                state: Mutex::new(PoolState {
                    name: desc.name.clone(),
                    vector,
                    records: SlotTable::new(),
                    allocation_count: 0,
                    allocation_bytes: 0,
                    dedicated_count: 0,
                    dedicated_bytes: 0,
                }),
                settings,
                provider,
                defragmenting: AtomicBool::new(false),
            }),
        };

        // On failure the partially created blocks go away with `pool`
        pool.create_min_blocks()?;

        info!(
            pool = id,
            category = ?pool.category(),
            algorithm = ?pool.algorithm(),
            default = pool.is_default(),
            "created pool"
        );
        Ok(pool)
    }

    #[inline]
    pub fn id(&self) -> PoolId {
        self.inner.id
    }

    #[inline]
    pub fn category(&self) -> PlacementCategory {
        self.inner.settings.desc.category
    }

    #[inline]
    pub fn algorithm(&self) -> Algorithm {
        self.inner.settings.desc.algorithm
    }

    #[inline]
    pub fn is_default(&self) -> bool {
        self.inner.settings.is_default
    }

    pub fn name(&self) -> Option<InlineString> {
        self.inner.state.lock().name.clone()
    }

    pub fn set_name(&self, name: Option<InlineString>) {
        self.inner.state.lock().name = name;
    }

    pub fn allocation_count(&self) -> usize {
        self.inner.state.lock().allocation_count
    }

    pub fn block_count(&self) -> usize {
        self.inner.state.lock().vector.block_count()
    }

    /// Incrementally maintained counters
    pub fn statistics(&self) -> Statistics {
        let state = self.inner.state.lock();
        Statistics {
            block_count: state.vector.block_count() + state.dedicated_count,
            allocation_count: state.allocation_count,
            block_bytes: state.vector.total_bytes() + state.dedicated_bytes,
            allocation_bytes: state.allocation_bytes,
        }
    }

    /// Walk every block's metadata and dedicated region
    pub fn calculate_statistics(&self) -> DetailedStatistics {
        let state = self.inner.state.lock();
        let mut stats = DetailedStatistics::default();
        state.vector.add_detailed_statistics(&mut stats);
        for (_, record) in state.records.iter() {
            if let Placement::Dedicated { region } = record.placement {
                stats.stats.block_count += 1;
                stats.stats.block_bytes += region.size;
                stats.add_allocation(record.size);
                if region.size > record.size {
                    stats.add_unused_range(region.size - record.size);
                }
            }
        }
        stats
    }

    /// Raise or lower the bytes kept reserved, creating or releasing blocks
    pub fn set_min_reserved_bytes(&self, bytes: DeviceSize) -> AllocResult<()> {
        let (released, result) = {
            let mut state = self.inner.state.lock();
            match state.vector.set_min_bytes(self.inner.provider.as_ref(), bytes) {
                Ok(released) => (released, Ok(())),
                Err(e) => (Vec::new(), Err(e)),
            }
        };
        self.destroy_regions(released);
        result
    }

    /// Create the blocks required by `min_block_count` and the byte floor
    pub fn create_min_blocks(&self) -> AllocResult<()> {
        let mut state = self.inner.state.lock();
        state.vector.create_min_blocks(self.inner.provider.as_ref())
    }

    /// Start defragmenting this pool
    pub fn begin_defragmentation(
        &self,
        desc: DefragmentationDesc,
    ) -> AllocResult<DefragmentationContext> {
        DefragmentationContext::new(vec![self.clone()], desc)
    }

    /// Ranges of every block, keyed by block id
    pub fn debug_dump(&self) -> Vec<(BlockId, Vec<RangeDump>)> {
        let state = self.inner.state.lock();
        state
            .vector
            .blocks()
            .iter()
            .map(|b| (b.id(), b.metadata().debug_dump()))
            .collect()
    }

    /// Check metadata consistency and that every record matches its block
    pub fn validate(&self) -> bool {
        let state = self.inner.state.lock();
        if !state.vector.validate() || state.records.len() != state.allocation_count {
            return false;
        }
        let consistent = state.records.iter().all(|(key, record)| match record.placement {
            Placement::Block { block, handle } => state
                .vector
                .block(block)
                .and_then(|b| b.metadata().allocation_info(handle))
                .map_or(false, |sub| {
                    sub.offset == record.offset
                        && sub.size == record.size
                        && sub.user_data == key.to_bits()
                }),
            Placement::Dedicated { region } => record.size <= region.size,
        });
        consistent
    }

    pub(crate) fn allocate(
        &self,
        desc: &AllocationDesc,
        frame: FrameIndex,
        budget_headroom: Option<DeviceSize>,
    ) -> AllocResult<Allocation> {
        let settings = &self.inner.settings;
        let flags = desc.flags;
        let committed = flags.contains(AllocationFlags::COMMITTED);
        let never_allocate = flags.contains(AllocationFlags::NEVER_ALLOCATE);
        let upper_address = flags.contains(AllocationFlags::UPPER_ADDRESS);

        if committed && never_allocate {
            return Err(AllocError::invalid(
                "COMMITTED cannot be combined with NEVER_ALLOCATE",
            ));
        }
        if committed && settings.desc.block_size != 0 {
            return Err(AllocError::invalid(
                "COMMITTED is not allowed in a pool with a fixed block size",
            ));
        }
        if upper_address
            && !(settings.desc.algorithm == Algorithm::Linear && settings.desc.max_block_count == 1)
        {
            return Err(AllocError::invalid(
                "UPPER_ADDRESS requires a linear pool with max_block_count == 1",
            ));
        }

        let alignment = desc
            .alignment
            .max(settings.desc.min_allocation_alignment)
            .max(settings.min_allocation_alignment)
            .max(MIN_ALIGNMENT);

        let heuristic_dedicated = settings.is_default
            && !never_allocate
            && !upper_address
            && (settings.always_committed
                || desc.size > settings.preferred_block_size / COMMITTED_SIZE_DIVISOR);

        if committed {
            return self.allocate_dedicated(desc, alignment, frame, budget_headroom);
        }
        if heuristic_dedicated {
            match self.allocate_dedicated(desc, alignment, frame, budget_headroom) {
                Ok(allocation) => return Ok(allocation),
                Err(e) => debug!(
                    pool = self.id(),
                    size = desc.size,
                    error = %e,
                    "dedicated allocation failed, trying blocks"
                ),
            }
        }

        let request = BlockRequest {
            size: desc.size,
            alignment,
            upper_address,
            strategy: desc.flags.strategy().unwrap_or(settings.default_strategy),
            never_allocate,
            budget_headroom,
            user_data: 0,
        };

        let result = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            match state.vector.allocate(self.inner.provider.as_ref(), &request) {
                Ok(placed) => {
                    let key = state.records.insert(AllocationRecord {
                        placement: Placement::Block {
                            block: placed.block,
                            handle: placed.request.handle,
                        },
                        offset: placed.request.offset,
                        size: desc.size,
                        alignment,
                        user_data: desc.user_data,
                        name: desc.name.clone(),
                        zeroed: placed.zeroed && settings.zeroed_allowed,
                        creation_frame: frame,
                    });
                    if let Some(block) = state.vector.block_mut(placed.block) {
                        block
                            .metadata_mut()
                            .set_user_data(placed.request.handle, key.to_bits());
                    }
                    state.allocation_count += 1;
                    state.allocation_bytes += desc.size;
                    debug!(
                        pool = self.id(),
                        block = placed.block,
                        offset = placed.request.offset,
                        size = desc.size,
                        "allocated from block"
                    );
                    Ok(Allocation {
                        pool: self.id(),
                        key,
                    })
                }
                Err(e) => Err(e),
            }
        };

        match result {
            Err(e) if settings.is_default && !never_allocate && !heuristic_dedicated => {
                debug!(
                    pool = self.id(),
                    size = desc.size,
                    error = %e,
                    "block allocation failed, falling back to dedicated"
                );
                self.allocate_dedicated(desc, alignment, frame, budget_headroom)
                    .map_err(|_| e)
            }
            other => other,
        }
    }

    fn allocate_dedicated(
        &self,
        desc: &AllocationDesc,
        alignment: DeviceSize,
        frame: FrameIndex,
        budget_headroom: Option<DeviceSize>,
    ) -> AllocResult<Allocation> {
        if let Some(headroom) = budget_headroom {
            if desc.size > headroom {
                return Err(AllocError::out_of_memory(
                    desc.size,
                    "dedicated region would exceed the memory budget",
                ));
            }
        }

        let region = self
            .inner
            .provider
            .create_dedicated_region(desc.size, self.category())?;

        let record = AllocationRecord {
            placement: Placement::Dedicated { region },
            offset: 0,
            size: desc.size,
            alignment,
            user_data: desc.user_data,
            name: desc.name.clone(),
            zeroed: region.zeroed && self.inner.settings.zeroed_allowed,
            creation_frame: frame,
        };

        let mut state = self.inner.state.lock();
        let key = state.records.insert(record);
        state.allocation_count += 1;
        state.allocation_bytes += desc.size;
        state.dedicated_count += 1;
        state.dedicated_bytes += region.size;
        debug!(
            pool = self.id(),
            region = region.handle.0,
            size = desc.size,
            "allocated dedicated region"
        );
        Ok(Allocation {
            pool: self.id(),
            key,
        })
    }

    pub(crate) fn free(&self, allocation: Allocation) -> AllocResult<()> {
        let released = {
            let mut state = self.inner.state.lock();
            let (record, region) = state
                .release_record(allocation.key)
                .ok_or_else(|| AllocError::invalid("stale or foreign allocation handle"))?;
            debug!(
                pool = self.id(),
                offset = record.offset,
                size = record.size,
                "freed allocation"
            );
            region
        };
        if let Some(region) = released {
            self.destroy_regions(vec![region]);
        }
        Ok(())
    }

    pub(crate) fn set_user_data(&self, allocation: Allocation, user_data: UserData) -> AllocResult<()> {
        let mut state = self.inner.state.lock();
        let record = state
            .records
            .get_mut(allocation.key)
            .ok_or_else(|| AllocError::invalid("stale or foreign allocation handle"))?;
        record.user_data = user_data;
        Ok(())
    }

    pub(crate) fn set_allocation_name(
        &self,
        allocation: Allocation,
        name: Option<InlineString>,
    ) -> AllocResult<()> {
        let mut state = self.inner.state.lock();
        let record = state
            .records
            .get_mut(allocation.key)
            .ok_or_else(|| AllocError::invalid("stale or foreign allocation handle"))?;
        record.name = name;
        Ok(())
    }

    pub(crate) fn allocation_info(&self, allocation: Allocation) -> AllocResult<AllocationInfo> {
        let state = self.inner.state.lock();
        let record = state
            .records
            .get(allocation.key)
            .ok_or_else(|| AllocError::invalid("stale or foreign allocation handle"))?;
        let (block, region) = match record.placement {
            Placement::Block { block, .. } => {
                let region = state
                    .vector
                    .block(block)
                    .map(|b| b.handle())
                    .ok_or_else(|| AllocError::invalid("allocation refers to a released block"))?;
                (Some(block), region)
            }
            Placement::Dedicated { region } => (None, region.handle),
        };
        Ok(AllocationInfo {
            pool: self.id(),
            category: self.category(),
            block,
            region,
            offset: record.offset,
            size: record.size,
            alignment: record.alignment,
            user_data: record.user_data,
            name: record.name.clone(),
            zeroed: record.zeroed,
            creation_frame: record.creation_frame,
        })
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        self.inner.state.lock()
    }

    pub(crate) fn handle_for(&self, key: SlotKey) -> Allocation {
        Allocation {
            pool: self.id(),
            key,
        }
    }

    /// Claim the pool for a defragmentation context
    pub(crate) fn try_begin_defragmentation(&self) -> bool {
        self.inner
            .defragmenting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn end_defragmentation(&self) {
        self.inner.defragmenting.store(false, Ordering::Release);
    }

    pub(crate) fn destroy_regions(&self, regions: Vec<Region>) {
        for region in regions {
            self.inner.provider.destroy_region(region.handle);
        }
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if state.allocation_count > 0 {
            warn!(
                pool = self.id,
                live = state.allocation_count,
                "pool dropped with live allocations"
            );
        }
        let mut regions = state.vector.take_regions();
        regions.extend(state.records.iter().filter_map(|(_, r)| match r.placement {
            Placement::Dedicated { region } => Some(region),
            Placement::Block { .. } => None,
        }));
        state.records.clear();
        for region in regions {
            self.provider.destroy_region(region.handle);
        }
    }
}

pub(crate) fn validate_pool_desc(desc: &PoolDesc) -> AllocResult<()> {
    if desc.max_block_count != 0 && desc.min_block_count > desc.max_block_count {
        return Err(AllocError::invalid(
            "min_block_count exceeds max_block_count",
        ));
    }
    if desc.min_allocation_alignment != 0 && !desc.min_allocation_alignment.is_power_of_two() {
        return Err(AllocError::invalid(
            "min_allocation_alignment must be 0 or a power of two",
        ));
    }
    if desc.block_size != 0 && desc.max_block_count != 0 {
        let capacity = desc
            .block_size
            .checked_mul(desc.max_block_count as DeviceSize)
            .ok_or_else(|| AllocError::invalid("block_size * max_block_count overflows"))?;
        if desc.min_reserved_bytes > capacity {
            return Err(AllocError::invalid(
                "min_reserved_bytes cannot be met within max_block_count",
            ));
        }
    }
    Ok(())
}
