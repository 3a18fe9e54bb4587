/*!
 * Block Vector
 *
 * Ordered list of blocks of one placement category and the policy that
 * decides when blocks are created and released. Callers hold the owning
 * pool's lock; regions that must be destroyed are handed back so the
 * provider is called after the lock is dropped.
 */

use super::block::MemoryBlock;
use super::metadata::{AllocHandle, AllocationRequest};
use super::provider::{Region, RegionProvider};
use super::stats::{DetailedStatistics, Statistics};
use super::traits::BlockMetadata;
use super::types::{Algorithm, PlacementCategory, Strategy};
use crate::core::errors::{AllocError, AllocResult, ProviderError};
use crate::core::limits::{MIN_ALIGNMENT, NEW_BLOCK_SIZE_SHIFT_MAX};
use crate::core::types::{BlockId, DeviceSize, UserData};
use tracing::{debug, info, warn};

/// Construction parameters of a [`BlockVector`]
#[derive(Debug, Clone, Copy)]
pub struct BlockVectorDesc {
    pub category: PlacementCategory,
    pub algorithm: Algorithm,
    pub preferred_block_size: DeviceSize,
    /// Every block is exactly `preferred_block_size`
    pub explicit_block_size: bool,
    pub min_block_count: usize,
    /// 0 means unlimited
    pub max_block_count: usize,
    pub min_bytes: DeviceSize,
    pub min_allocation_alignment: DeviceSize,
    pub debug_margin: DeviceSize,
}

/// One allocation request as seen by the block vector
#[derive(Debug, Clone, Copy)]
pub struct BlockRequest {
    pub size: DeviceSize,
    pub alignment: DeviceSize,
    pub upper_address: bool,
    pub strategy: Strategy,
    pub never_allocate: bool,
    /// Bytes that may still be reserved before crossing the budget
    pub budget_headroom: Option<DeviceSize>,
    pub user_data: UserData,
}

/// Where a request landed
#[derive(Debug, Clone, Copy)]
pub struct BlockPlacement {
    pub block: BlockId,
    pub request: AllocationRequest,
    pub zeroed: bool,
}

#[derive(Debug)]
pub struct BlockVector {
    desc: BlockVectorDesc,
    /// Ascending by id, which is creation order
    blocks: Vec<MemoryBlock>,
    next_block_id: BlockId,
    total_bytes: DeviceSize,
}

impl BlockVector {
    pub fn new(desc: BlockVectorDesc) -> Self {
        Self {
            desc,
            blocks: Vec::new(),
            next_block_id: 0,
            total_bytes: 0,
        }
    }

    #[inline]
    pub fn desc(&self) -> &BlockVectorDesc {
        &self.desc
    }

    #[inline]
    pub fn algorithm(&self) -> Algorithm {
        self.desc.algorithm
    }

    #[inline]
    pub fn blocks(&self) -> &[MemoryBlock] {
        &self.blocks
    }

    #[inline]
    pub fn blocks_mut(&mut self) -> &mut [MemoryBlock] {
        &mut self.blocks
    }

    #[inline]
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    #[inline]
    pub fn total_bytes(&self) -> DeviceSize {
        self.total_bytes
    }

    #[inline]
    pub fn debug_margin(&self) -> DeviceSize {
        self.desc.debug_margin
    }

    fn max_blocks(&self) -> usize {
        match self.desc.max_block_count {
            0 => usize::MAX,
            max => max,
        }
    }

    pub fn block_index(&self, id: BlockId) -> Option<usize> {
        self.blocks.binary_search_by_key(&id, |b| b.id()).ok()
    }

    pub fn block(&self, id: BlockId) -> Option<&MemoryBlock> {
        self.block_index(id).map(|i| &self.blocks[i])
    }

    pub fn block_mut(&mut self, id: BlockId) -> Option<&mut MemoryBlock> {
        self.block_index(id).map(move |i| &mut self.blocks[i])
    }

    /// Place a request in an existing block, creating a new block if allowed
    pub fn allocate(
        &mut self,
        provider: &dyn RegionProvider,
        request: &BlockRequest,
    ) -> AllocResult<BlockPlacement> {
        let size = request.size;
        let alignment = request
            .alignment
            .max(self.desc.min_allocation_alignment)
            .max(MIN_ALIGNMENT);
        let footprint = size.checked_add(self.desc.debug_margin).ok_or_else(|| {
            AllocError::out_of_memory(size, "request size overflows with the debug margin")
        })?;

        if self.desc.explicit_block_size && footprint > self.desc.preferred_block_size {
            return Err(AllocError::out_of_memory(
                size,
                "request exceeds the pool's block size",
            ));
        }

        if let Some(placement) = self.allocate_from_existing(request, alignment) {
            return Ok(placement);
        }

        if request.never_allocate {
            return Err(AllocError::out_of_memory(
                size,
                "no existing block fits and NEVER_ALLOCATE forbids growth",
            ));
        }
        if self.blocks.len() >= self.max_blocks() {
            return Err(AllocError::out_of_memory(
                size,
                "pool reached its maximum block count",
            ));
        }

        let id = self.grow(provider, footprint, request.budget_headroom)?;
        let index = self.blocks.len() - 1;
        let block = &mut self.blocks[index];
        match block.allocate(
            size,
            alignment,
            request.upper_address,
            request.strategy,
            request.user_data,
        ) {
            Some((placed, zeroed)) => Ok(BlockPlacement {
                block: id,
                request: placed,
                zeroed,
            }),
            None => Err(AllocError::out_of_memory(
                size,
                "fresh block cannot satisfy the alignment",
            )),
        }
    }

    fn allocate_from_existing(
        &mut self,
        request: &BlockRequest,
        alignment: DeviceSize,
    ) -> Option<BlockPlacement> {
        let candidates = match self.desc.algorithm {
            Algorithm::Linear => {
                let last = self.blocks.len().checked_sub(1)?;
                last..self.blocks.len()
            }
            Algorithm::General => 0..self.blocks.len(),
        };

        for index in candidates {
            let block = &mut self.blocks[index];
            if let Some((placed, zeroed)) = block.allocate(
                request.size,
                alignment,
                request.upper_address,
                request.strategy,
                request.user_data,
            ) {
                return Some(BlockPlacement {
                    block: block.id(),
                    request: placed,
                    zeroed,
                });
            }
        }
        None
    }

    /// Create one block large enough for `needed` bytes
    ///
    /// Flexible vectors start small while no large block exists yet, then
    /// halve again on provider failure as long as the request still fits.
    fn grow(
        &mut self,
        provider: &dyn RegionProvider,
        needed: DeviceSize,
        headroom: Option<DeviceSize>,
    ) -> AllocResult<BlockId> {
        let mut block_size = self.desc.preferred_block_size;
        let mut shift = 0;

        if !self.desc.explicit_block_size {
            let max_existing = self.blocks.iter().map(|b| b.size()).max().unwrap_or(0);
            while shift < NEW_BLOCK_SIZE_SHIFT_MAX {
                let smaller = block_size / 2;
                if smaller > max_existing && smaller >= needed.saturating_mul(2) {
                    block_size = smaller;
                    shift += 1;
                } else {
                    break;
                }
            }
            block_size = block_size.max(needed);
        }

        let mut result = self.try_create_block(provider, block_size, headroom);
        if !self.desc.explicit_block_size {
            while result.is_err() && shift < NEW_BLOCK_SIZE_SHIFT_MAX {
                let smaller = block_size / 2;
                if smaller < needed {
                    break;
                }
                block_size = smaller;
                shift += 1;
                debug!(block_size, "retrying block creation with a smaller size");
                result = self.try_create_block(provider, block_size, headroom);
            }
        }
        result
    }

    fn try_create_block(
        &mut self,
        provider: &dyn RegionProvider,
        block_size: DeviceSize,
        headroom: Option<DeviceSize>,
    ) -> AllocResult<BlockId> {
        if let Some(headroom) = headroom {
            if block_size > headroom {
                return Err(AllocError::out_of_memory(
                    block_size,
                    "new block would exceed the memory budget",
                ));
            }
        }
        self.create_block(provider, block_size)
            .map_err(AllocError::from)
    }

    /// Ask the provider for a region and append it as the newest block
    pub fn create_block(
        &mut self,
        provider: &dyn RegionProvider,
        block_size: DeviceSize,
    ) -> Result<BlockId, ProviderError> {
        let region = provider.create_region(block_size, self.desc.category)?;
        let id = self.next_block_id;
        self.next_block_id += 1;
        self.total_bytes = self.total_bytes.saturating_add(region.size);
        self.blocks.push(MemoryBlock::new(
            id,
            region,
            self.desc.algorithm,
            self.desc.debug_margin,
        ));
        info!(
            block = id,
            size = region.size,
            category = ?self.desc.category,
            "created memory block"
        );
        Ok(id)
    }

    /// Free a block allocation, returning the block's region if it was released
    pub fn free(&mut self, block: BlockId, handle: AllocHandle) -> Option<Region> {
        let index = match self.block_index(block) {
            Some(index) => index,
            None => {
                warn!(block, "free on unknown block");
                return None;
            }
        };
        self.blocks[index].free(handle);
        if self.can_release(index) {
            Some(self.remove_block(index))
        } else {
            None
        }
    }

    fn can_release(&self, index: usize) -> bool {
        let block = &self.blocks[index];
        block.is_empty()
            && self.blocks.len() > self.desc.min_block_count
            && self.total_bytes - block.size() >= self.desc.min_bytes
    }

    fn remove_block(&mut self, index: usize) -> Region {
        let block = self.blocks.remove(index);
        self.total_bytes -= block.size();
        debug!(block = block.id(), size = block.size(), "released empty block");
        block.region()
    }

    /// Release every empty block the limits allow, newest first
    pub fn release_empty_blocks(&mut self) -> Vec<Region> {
        let mut released = Vec::new();
        let mut index = self.blocks.len();
        while index > 0 {
            index -= 1;
            if self.can_release(index) {
                released.push(self.remove_block(index));
            }
        }
        released
    }

    /// Create blocks until both `min_block_count` and `min_bytes` are met
    pub fn create_min_blocks(&mut self, provider: &dyn RegionProvider) -> AllocResult<()> {
        while self.blocks.len() < self.desc.min_block_count
            || self.total_bytes < self.desc.min_bytes
        {
            if self.blocks.len() >= self.max_blocks() {
                break;
            }
            self.create_block(provider, self.desc.preferred_block_size)?;
        }
        Ok(())
    }

    /// Change the reserved byte floor, releasing or creating blocks to match
    pub fn set_min_bytes(
        &mut self,
        provider: &dyn RegionProvider,
        min_bytes: DeviceSize,
    ) -> AllocResult<Vec<Region>> {
        self.desc.min_bytes = min_bytes;
        let released = self.release_empty_blocks();
        self.create_min_blocks(provider)?;
        Ok(released)
    }

    /// Drop every block, returning their regions
    pub fn take_regions(&mut self) -> Vec<Region> {
        self.total_bytes = 0;
        self.blocks.drain(..).map(|b| b.region()).collect()
    }

    pub fn add_statistics(&self, stats: &mut Statistics) {
        for block in &self.blocks {
            block.metadata().add_statistics(stats);
        }
    }

    pub fn add_detailed_statistics(&self, stats: &mut DetailedStatistics) {
        for block in &self.blocks {
            block.metadata().add_detailed_statistics(stats);
        }
    }

    /// Check every block's metadata
    pub fn validate(&self) -> bool {
        self.blocks.iter().all(|b| b.metadata().validate())
            && self.blocks.windows(2).all(|w| w[0].id() < w[1].id())
            && self.total_bytes == self.blocks.iter().map(|b| b.size()).sum::<DeviceSize>()
    }
}
