/*!
 * Region Sub-Allocator Library
 * Places variable-sized, aligned allocations inside large backing regions
 * obtained from an external provider, with pools, virtual blocks and
 * incremental defragmentation
 */

pub mod core;
pub mod memory;
pub mod monitoring;

// Re-exports
pub use crate::core::data_structures::InlineString;
pub use crate::core::errors::{AllocError, AllocResult, ProviderError};
pub use crate::core::types::{BlockId, DeviceSize, FrameIndex, PoolId, UserData};
pub use memory::{
    Algorithm, Allocation, AllocationDesc, AllocationFlags, AllocationInfo, Allocator,
    AllocatorConfig, Budget, DefragmentationAlgorithm, DefragmentationContext,
    DefragmentationDesc, DefragmentationMove, DefragmentationPass, DefragmentationStats,
    DetailedStatistics, MemorySegment, MoveOperation, PassOutcome, PlacementCategory, Pool,
    PoolDesc, Region, RegionHandle, RegionProvider, SegmentBudget, SimulatedProvider, Statistics,
    Strategy, TotalStatistics, VirtualAllocation, VirtualAllocationDesc, VirtualAllocationInfo,
    VirtualBlock, VirtualBlockDesc,
};
pub use monitoring::init_tracing;
