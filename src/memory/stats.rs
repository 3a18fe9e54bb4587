/*!
 * Allocation Statistics
 * Counters kept per pool and summed on demand by the allocator
 */

use super::types::{MemorySegment, PlacementCategory};
use crate::core::types::DeviceSize;
use serde::{Deserialize, Serialize};

/// Cheap counters, maintained incrementally under the pool lock
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statistics {
    /// Blocks plus dedicated regions
    pub block_count: usize,
    pub allocation_count: usize,
    pub block_bytes: DeviceSize,
    pub allocation_bytes: DeviceSize,
}

impl Statistics {
    pub fn add(&mut self, other: &Statistics) {
        self.block_count += other.block_count;
        self.allocation_count += other.allocation_count;
        self.block_bytes += other.block_bytes;
        self.allocation_bytes += other.allocation_bytes;
    }

    /// Bytes reserved in blocks but not handed out
    #[inline]
    pub fn unused_bytes(&self) -> DeviceSize {
        self.block_bytes.saturating_sub(self.allocation_bytes)
    }
}

/// Counters plus size extremes, computed by walking block metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetailedStatistics {
    pub stats: Statistics,
    pub unused_range_count: usize,
    pub allocation_size_min: DeviceSize,
    pub allocation_size_max: DeviceSize,
    pub unused_range_size_min: DeviceSize,
    pub unused_range_size_max: DeviceSize,
}

impl Default for DetailedStatistics {
    fn default() -> Self {
        Self {
            stats: Statistics::default(),
            unused_range_count: 0,
            allocation_size_min: DeviceSize::MAX,
            allocation_size_max: 0,
            unused_range_size_min: DeviceSize::MAX,
            unused_range_size_max: 0,
        }
    }
}

impl DetailedStatistics {
    #[inline]
    pub fn add_allocation(&mut self, size: DeviceSize) {
        self.stats.allocation_count += 1;
        self.stats.allocation_bytes += size;
        self.allocation_size_min = self.allocation_size_min.min(size);
        self.allocation_size_max = self.allocation_size_max.max(size);
    }

    #[inline]
    pub fn add_unused_range(&mut self, size: DeviceSize) {
        self.unused_range_count += 1;
        self.unused_range_size_min = self.unused_range_size_min.min(size);
        self.unused_range_size_max = self.unused_range_size_max.max(size);
    }

    pub fn add(&mut self, other: &DetailedStatistics) {
        self.stats.add(&other.stats);
        self.unused_range_count += other.unused_range_count;
        self.allocation_size_min = self.allocation_size_min.min(other.allocation_size_min);
        self.allocation_size_max = self.allocation_size_max.max(other.allocation_size_max);
        self.unused_range_size_min = self.unused_range_size_min.min(other.unused_range_size_min);
        self.unused_range_size_max = self.unused_range_size_max.max(other.unused_range_size_max);
    }

    /// Mean live allocation size, 0 when there are none
    pub fn average_allocation_size(&self) -> DeviceSize {
        if self.stats.allocation_count == 0 {
            0
        } else {
            self.stats.allocation_bytes / self.stats.allocation_count as DeviceSize
        }
    }

    /// Mean free range size, 0 when there are none
    pub fn average_unused_range_size(&self) -> DeviceSize {
        if self.unused_range_count == 0 {
            0
        } else {
            self.stats.unused_bytes() / self.unused_range_count as DeviceSize
        }
    }
}

/// Allocator-wide snapshot: per category, per segment, and overall
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TotalStatistics {
    pub categories: [DetailedStatistics; PlacementCategory::COUNT],
    pub segments: [DetailedStatistics; MemorySegment::COUNT],
    pub total: DetailedStatistics,
}

impl TotalStatistics {
    #[inline]
    pub fn category(&self, category: PlacementCategory) -> &DetailedStatistics {
        &self.categories[category.index()]
    }

    #[inline]
    pub fn segment(&self, segment: MemorySegment) -> &DetailedStatistics {
        &self.segments[segment.index()]
    }
}

/// Usage against budget for one memory segment
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Budget {
    pub stats: Statistics,
    pub usage_bytes: DeviceSize,
    pub budget_bytes: DeviceSize,
}

impl Budget {
    /// Bytes that can still be reserved before crossing the budget
    #[inline]
    pub fn headroom(&self) -> DeviceSize {
        self.budget_bytes.saturating_sub(self.usage_bytes)
    }
}
