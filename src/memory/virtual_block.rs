/*!
 * Virtual Block
 *
 * Block metadata exposed directly: offsets are handed out from an
 * address range that has no backing memory. Useful for sub-allocating
 * inside a buffer the caller manages. Never applies a debug margin.
 *
 * Not synchronized; wrap in a lock for shared use.
 */

use super::metadata::{AllocHandle, Metadata, RangeDump};
use super::stats::{DetailedStatistics, Statistics};
use super::traits::BlockMetadata;
use super::types::{
    Algorithm, AllocationFlags, VirtualAllocationDesc, VirtualAllocationInfo, VirtualBlockDesc,
};
use crate::core::data_structures::{SlotKey, SlotTable};
use crate::core::errors::{AllocError, AllocResult};
use crate::core::limits::MIN_ALIGNMENT;
use crate::core::types::{DeviceSize, UserData};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_VIRTUAL_BLOCK_ID: AtomicU64 = AtomicU64::new(1);

/// Handle to an allocation inside a [`VirtualBlock`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VirtualAllocation {
    block: u64,
    key: SlotKey,
}

#[derive(Debug)]
pub struct VirtualBlock {
    id: u64,
    metadata: Metadata,
    allocations: SlotTable<AllocHandle>,
}

impl VirtualBlock {
    pub fn new(desc: VirtualBlockDesc) -> AllocResult<Self> {
        if desc.size == 0 {
            return Err(AllocError::invalid("virtual block size must be non-zero"));
        }
        Ok(Self {
            id: NEXT_VIRTUAL_BLOCK_ID.fetch_add(1, Ordering::Relaxed),
            metadata: Metadata::new(desc.algorithm, desc.size, 0, true),
            allocations: SlotTable::new(),
        })
    }

    #[inline]
    pub fn size(&self) -> DeviceSize {
        self.metadata.size()
    }

    #[inline]
    pub fn algorithm(&self) -> Algorithm {
        self.metadata.algorithm()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.metadata.is_empty()
    }

    #[inline]
    pub fn allocation_count(&self) -> usize {
        self.metadata.allocation_count()
    }

    /// Reserve a range, returning its handle and offset
    pub fn allocate(
        &mut self,
        desc: &VirtualAllocationDesc,
    ) -> AllocResult<(VirtualAllocation, DeviceSize)> {
        if desc.size == 0 {
            return Err(AllocError::invalid("allocation size must be non-zero"));
        }
        if desc.alignment != 0 && !desc.alignment.is_power_of_two() {
            return Err(AllocError::invalid("alignment must be 0 or a power of two"));
        }
        let upper_address = desc.flags.contains(AllocationFlags::UPPER_ADDRESS);
        if upper_address && self.algorithm() != Algorithm::Linear {
            return Err(AllocError::invalid(
                "UPPER_ADDRESS requires a linear virtual block",
            ));
        }

        let request = self
            .metadata
            .create_allocation_request(
                desc.size,
                desc.alignment.max(MIN_ALIGNMENT),
                upper_address,
                desc.flags.strategy().unwrap_or_default(),
            )
            .ok_or_else(|| {
                AllocError::out_of_memory(desc.size, "virtual block has no fitting free range")
            })?;
        self.metadata.alloc(&request, desc.private_data);
        let key = self.allocations.insert(request.handle);

        Ok((VirtualAllocation { block: self.id, key }, request.offset))
    }

    pub fn free(&mut self, allocation: VirtualAllocation) -> AllocResult<()> {
        self.check_owner(allocation)?;
        let handle = self
            .allocations
            .remove(allocation.key)
            .ok_or_else(stale_handle)?;
        self.metadata.free(handle);
        Ok(())
    }

    /// Free everything at once; outstanding handles become stale
    pub fn clear(&mut self) {
        self.metadata.clear();
        self.allocations.clear();
    }

    pub fn get_allocation_info(
        &self,
        allocation: VirtualAllocation,
    ) -> AllocResult<VirtualAllocationInfo> {
        let handle = self.resolve(allocation)?;
        let sub = self
            .metadata
            .allocation_info(handle)
            .ok_or_else(stale_handle)?;
        Ok(VirtualAllocationInfo {
            offset: sub.offset,
            size: sub.size,
            private_data: sub.user_data,
        })
    }

    pub fn set_private_data(
        &mut self,
        allocation: VirtualAllocation,
        private_data: UserData,
    ) -> AllocResult<()> {
        let handle = self.resolve(allocation)?;
        self.metadata.set_user_data(handle, private_data);
        Ok(())
    }

    /// Cheap counters
    pub fn statistics(&self) -> Statistics {
        let mut stats = Statistics::default();
        self.metadata.add_statistics(&mut stats);
        stats
    }

    /// Counters plus range size extremes
    pub fn calculate_statistics(&self) -> DetailedStatistics {
        let mut stats = DetailedStatistics::default();
        self.metadata.add_detailed_statistics(&mut stats);
        stats
    }

    pub fn debug_dump(&self) -> Vec<RangeDump> {
        self.metadata.debug_dump()
    }

    pub fn validate(&self) -> bool {
        self.metadata.validate() && self.allocations.len() == self.metadata.allocation_count()
    }

    fn check_owner(&self, allocation: VirtualAllocation) -> AllocResult<()> {
        if allocation.block == self.id {
            Ok(())
        } else {
            Err(AllocError::invalid(
                "allocation belongs to another virtual block",
            ))
        }
    }

    fn resolve(&self, allocation: VirtualAllocation) -> AllocResult<AllocHandle> {
        self.check_owner(allocation)?;
        self.allocations
            .get(allocation.key)
            .copied()
            .ok_or_else(stale_handle)
    }
}

fn stale_handle() -> AllocError {
    AllocError::invalid("stale virtual allocation handle")
}
