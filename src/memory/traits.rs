/*!
 * Memory Traits
 * Free-space tracking abstraction shared by both block algorithms
 */

use super::metadata::{AllocHandle, AllocationRequest, RangeDump, SubAllocation};
use super::stats::{DetailedStatistics, Statistics};
use super::types::Strategy;
use crate::core::types::{DeviceSize, UserData};

/// Per-block free-space tracker
///
/// Allocation is two-step: `create_allocation_request` finds a place
/// (and may reorder internal lists), `alloc` commits it. Callers that
/// only probe, such as defragmentation comparing offsets, can drop the
/// request without side effects on occupancy.
pub trait BlockMetadata {
    /// Total bytes tracked
    fn size(&self) -> DeviceSize;

    /// Virtual blocks never apply a debug margin
    fn is_virtual(&self) -> bool;

    /// Padding reserved after every allocation
    fn debug_margin(&self) -> DeviceSize;

    fn allocation_count(&self) -> usize;

    fn free_regions_count(&self) -> usize;

    fn sum_free_size(&self) -> DeviceSize;

    fn is_empty(&self) -> bool;

    /// Find room for `size` bytes aligned to `alignment`
    ///
    /// `alignment` must be a power of two; 0 and 1 mean no extra alignment.
    fn create_allocation_request(
        &mut self,
        size: DeviceSize,
        alignment: DeviceSize,
        upper_address: bool,
        strategy: Strategy,
    ) -> Option<AllocationRequest>;

    /// Commit a request produced by `create_allocation_request` on this block
    fn alloc(&mut self, request: &AllocationRequest, user_data: UserData);

    /// Return a live allocation's range to the free space
    fn free(&mut self, handle: AllocHandle);

    fn allocation_info(&self, handle: AllocHandle) -> Option<SubAllocation>;

    fn set_user_data(&mut self, handle: AllocHandle, user_data: UserData);

    /// Live allocations in ascending offset order
    fn allocations(&self) -> Vec<SubAllocation>;

    /// Size of the free range directly after `handle`, 0 if none
    fn next_free_region_size(&self, handle: AllocHandle) -> DeviceSize;

    /// Drop every allocation at once
    fn clear(&mut self);

    fn add_statistics(&self, stats: &mut Statistics);

    fn add_detailed_statistics(&self, stats: &mut DetailedStatistics);

    /// Every range, free or used, in ascending offset order
    fn debug_dump(&self) -> Vec<RangeDump>;

    /// Check internal consistency, intended for tests and debug assertions
    fn validate(&self) -> bool;

    /// Request and commit in one step
    fn allocate(
        &mut self,
        size: DeviceSize,
        alignment: DeviceSize,
        upper_address: bool,
        strategy: Strategy,
        user_data: UserData,
    ) -> Option<AllocationRequest> {
        let request = self.create_allocation_request(size, alignment, upper_address, strategy)?;
        self.alloc(&request, user_data);
        Some(request)
    }
}
