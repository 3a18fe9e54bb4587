/*!
 * Backing Region Provider
 *
 * The engine never creates real memory. Blocks and dedicated allocations
 * are backed by regions obtained through [`RegionProvider`], implemented
 * by the caller on top of a GPU or OS allocator.
 */

mod simulated;

pub use simulated::SimulatedProvider;

use super::types::{MemorySegment, PlacementCategory};
use crate::core::errors::ProviderError;
use crate::core::types::DeviceSize;
use serde::{Deserialize, Serialize};

/// Opaque identifier of a backing region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RegionHandle(pub u64);

/// A region handed out by the provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub handle: RegionHandle,
    /// Actual size, at least the requested size hint
    pub size: DeviceSize,
    /// The provider guarantees the bytes start out as zero
    pub zeroed: bool,
}

/// Usage and budget of one memory segment as reported by the provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentBudget {
    pub usage_bytes: DeviceSize,
    pub budget_bytes: DeviceSize,
}

/// Source of backing memory
pub trait RegionProvider: Send + Sync {
    /// Create a region of at least `size_hint` bytes for a pool block
    fn create_region(
        &self,
        size_hint: DeviceSize,
        category: PlacementCategory,
    ) -> Result<Region, ProviderError>;

    /// Create a region for one dedicated allocation
    fn create_dedicated_region(
        &self,
        size: DeviceSize,
        category: PlacementCategory,
    ) -> Result<Region, ProviderError> {
        self.create_region(size, category)
    }

    /// Release a region with no live allocations left in it
    fn destroy_region(&self, handle: RegionHandle);

    /// Copy bytes between regions
    ///
    /// Only callers processing a defragmentation pass use this; the
    /// engine never moves data itself.
    fn copy_bytes(
        &self,
        _dst: RegionHandle,
        _dst_offset: DeviceSize,
        _src: RegionHandle,
        _src_offset: DeviceSize,
        _size: DeviceSize,
    ) -> Result<(), ProviderError> {
        Err(ProviderError::Unsupported("copy_bytes".into()))
    }

    /// Usage and budget reported by the platform, if it tracks them
    fn segment_budget(&self, _segment: MemorySegment) -> Option<SegmentBudget> {
        None
    }

    /// Unified memory architecture: every category draws from local memory
    fn is_uma(&self) -> bool {
        false
    }
}
