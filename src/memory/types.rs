/*!
 * Memory Types
 * Request descriptors, placement categories and allocation info
 */

use crate::core::data_structures::InlineString;
use crate::core::types::{BlockId, DeviceSize, FrameIndex, PoolId, UserData};
use crate::memory::provider::RegionHandle;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Broad placement category of a pool (heap type in graphics terms)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlacementCategory {
    #[default]
    DeviceLocal,
    Upload,
    Readback,
    GpuUpload,
}

impl PlacementCategory {
    pub const COUNT: usize = 4;

    pub const ALL: [PlacementCategory; Self::COUNT] = [
        PlacementCategory::DeviceLocal,
        PlacementCategory::Upload,
        PlacementCategory::Readback,
        PlacementCategory::GpuUpload,
    ];

    #[inline]
    pub const fn index(self) -> usize {
        match self {
            PlacementCategory::DeviceLocal => 0,
            PlacementCategory::Upload => 1,
            PlacementCategory::Readback => 2,
            PlacementCategory::GpuUpload => 3,
        }
    }

    /// Memory segment the category draws from. On UMA systems everything is local.
    pub const fn segment(self, is_uma: bool) -> MemorySegment {
        if is_uma {
            return MemorySegment::Local;
        }
        match self {
            PlacementCategory::DeviceLocal | PlacementCategory::GpuUpload => MemorySegment::Local,
            PlacementCategory::Upload | PlacementCategory::Readback => MemorySegment::NonLocal,
        }
    }
}

/// Physical memory segment used for budget accounting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemorySegment {
    Local,
    NonLocal,
}

impl MemorySegment {
    pub const COUNT: usize = 2;
    pub const ALL: [MemorySegment; Self::COUNT] = [MemorySegment::Local, MemorySegment::NonLocal];

    #[inline]
    pub const fn index(self) -> usize {
        match self {
            MemorySegment::Local => 0,
            MemorySegment::NonLocal => 1,
        }
    }
}

/// Free-space algorithm of a block, chosen once per pool or virtual block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    /// Two-level segregated free lists
    #[default]
    General,
    /// Stack, double stack or ring buffer
    Linear,
}

/// Search strategy of the general algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Best-fit bucket first
    #[default]
    MinMemory,
    /// Next larger bucket first, fewer list walks
    MinTime,
    /// Lowest offset that fits
    MinOffset,
}

bitflags! {
    /// Per-request flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AllocationFlags: u32 {
        /// Give the allocation its own dedicated region
        const COMMITTED = 1 << 0;
        /// Only use existing blocks, never ask the provider for a new one
        const NEVER_ALLOCATE = 1 << 1;
        /// Fail instead of growing past the segment budget
        const WITHIN_BUDGET = 1 << 2;
        /// Allocate from the upper end of a linear double stack
        const UPPER_ADDRESS = 1 << 3;

        const STRATEGY_MIN_MEMORY = 1 << 16;
        const STRATEGY_MIN_TIME = 1 << 17;
        const STRATEGY_MIN_OFFSET = 1 << 18;
    }
}

impl AllocationFlags {
    /// Strategy requested through the flags, if any
    pub fn strategy(self) -> Option<Strategy> {
        if self.contains(AllocationFlags::STRATEGY_MIN_OFFSET) {
            Some(Strategy::MinOffset)
        } else if self.contains(AllocationFlags::STRATEGY_MIN_TIME) {
            Some(Strategy::MinTime)
        } else if self.contains(AllocationFlags::STRATEGY_MIN_MEMORY) {
            Some(Strategy::MinMemory)
        } else {
            None
        }
    }
}

/// Allocation request routed through [`crate::Allocator::allocate`]
#[derive(Debug, Clone, Default)]
pub struct AllocationDesc {
    pub size: DeviceSize,
    /// Power of two, or 0 for no extra alignment
    pub alignment: DeviceSize,
    pub flags: AllocationFlags,
    /// Default pool to use when `pool` is `None`
    pub category: PlacementCategory,
    pub pool: Option<PoolId>,
    pub user_data: UserData,
    pub name: Option<InlineString>,
}

impl AllocationDesc {
    pub fn new(size: DeviceSize, alignment: DeviceSize) -> Self {
        Self {
            size,
            alignment,
            ..Default::default()
        }
    }

    pub fn with_flags(mut self, flags: AllocationFlags) -> Self {
        self.flags |= flags;
        self
    }

    pub fn with_category(mut self, category: PlacementCategory) -> Self {
        self.category = category;
        self
    }

    pub fn in_pool(mut self, pool: PoolId) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn with_user_data(mut self, user_data: UserData) -> Self {
        self.user_data = user_data;
        self
    }

    pub fn with_name(mut self, name: impl Into<InlineString>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Custom pool parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolDesc {
    pub category: PlacementCategory,
    pub algorithm: Algorithm,
    /// Fixed block size, 0 lets the pool size blocks itself
    pub block_size: DeviceSize,
    /// Blocks created up front and never released
    pub min_block_count: usize,
    /// Hard ceiling on blocks, 0 means unlimited
    pub max_block_count: usize,
    /// Empty blocks are kept while the pool holds less than this
    pub min_reserved_bytes: DeviceSize,
    pub min_allocation_alignment: DeviceSize,
    pub name: Option<InlineString>,
}

impl Default for PoolDesc {
    fn default() -> Self {
        Self {
            category: PlacementCategory::DeviceLocal,
            algorithm: Algorithm::General,
            block_size: 0,
            min_block_count: 0,
            max_block_count: 0,
            min_reserved_bytes: 0,
            min_allocation_alignment: 0,
            name: None,
        }
    }
}

impl PoolDesc {
    pub fn new(category: PlacementCategory) -> Self {
        Self {
            category,
            ..Default::default()
        }
    }

    pub fn with_algorithm(mut self, algorithm: Algorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    pub fn with_block_size(mut self, block_size: DeviceSize) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn with_block_count(mut self, min: usize, max: usize) -> Self {
        self.min_block_count = min;
        self.max_block_count = max;
        self
    }

    pub fn with_min_reserved_bytes(mut self, bytes: DeviceSize) -> Self {
        self.min_reserved_bytes = bytes;
        self
    }

    pub fn with_min_allocation_alignment(mut self, alignment: DeviceSize) -> Self {
        self.min_allocation_alignment = alignment;
        self
    }

    pub fn with_name(mut self, name: impl Into<InlineString>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Snapshot of a live allocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AllocationInfo {
    pub pool: PoolId,
    pub category: PlacementCategory,
    /// `None` for dedicated allocations
    pub block: Option<BlockId>,
    pub region: RegionHandle,
    pub offset: DeviceSize,
    pub size: DeviceSize,
    pub alignment: DeviceSize,
    pub user_data: UserData,
    pub name: Option<InlineString>,
    pub zeroed: bool,
    pub creation_frame: FrameIndex,
}

impl AllocationInfo {
    #[inline]
    pub fn is_dedicated(&self) -> bool {
        self.block.is_none()
    }

    /// End offset (exclusive)
    #[inline]
    pub fn end(&self) -> DeviceSize {
        self.offset + self.size
    }
}

/// Virtual block parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualBlockDesc {
    pub size: DeviceSize,
    pub algorithm: Algorithm,
}

impl VirtualBlockDesc {
    pub fn new(size: DeviceSize) -> Self {
        Self {
            size,
            algorithm: Algorithm::General,
        }
    }

    pub fn linear(size: DeviceSize) -> Self {
        Self {
            size,
            algorithm: Algorithm::Linear,
        }
    }
}

/// Request against a virtual block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VirtualAllocationDesc {
    pub size: DeviceSize,
    pub alignment: DeviceSize,
    /// Only `UPPER_ADDRESS` and strategy flags are meaningful here
    pub flags: AllocationFlags,
    pub private_data: UserData,
}

impl VirtualAllocationDesc {
    pub fn new(size: DeviceSize, alignment: DeviceSize) -> Self {
        Self {
            size,
            alignment,
            ..Default::default()
        }
    }

    pub fn with_flags(mut self, flags: AllocationFlags) -> Self {
        self.flags |= flags;
        self
    }

    pub fn with_private_data(mut self, private_data: UserData) -> Self {
        self.private_data = private_data;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualAllocationInfo {
    pub offset: DeviceSize,
    pub size: DeviceSize,
    pub private_data: UserData,
}
