/*!
 * Allocator Limits and Constants
 *
 * Centralized location for block sizing, free-list geometry and
 * defragmentation thresholds.
 *
 * - Performance-critical constants are marked with [PERF]
 * - Values mirroring the reference TLSF layout are marked with [TLSF]
 */

use crate::core::types::DeviceSize;

// =============================================================================
// BLOCK SIZING
// =============================================================================

/// Preferred size of a block in a flexible pool (64MB)
/// Also the ceiling that geometric growth works towards
pub const DEFAULT_PREFERRED_BLOCK_SIZE: DeviceSize = 64 * 1024 * 1024;

/// Number of times a new flexible block may be halved (1/8, 1/4, 1/2)
/// Applies both to first-block sizing and to provider failure retries
pub const NEW_BLOCK_SIZE_SHIFT_MAX: u32 = 3;

/// Default pools route requests larger than preferred / this to dedicated regions
pub const COMMITTED_SIZE_DIVISOR: DeviceSize = 2;

/// Smallest alignment handed out when the caller passes 0
pub const MIN_ALIGNMENT: DeviceSize = 1;

// =============================================================================
// GENERAL (TLSF) METADATA
// =============================================================================

/// Requests up to this size share the first memory class [TLSF]
pub const TLSF_SMALL_BUFFER_SIZE: DeviceSize = 256;

/// log2 of the number of second-level lists per memory class [TLSF]
pub const TLSF_SECOND_LEVEL_INDEX: u32 = 5;

/// Memory classes start at 2^7 so class 0 covers the small buffer range [TLSF]
pub const TLSF_MEMORY_CLASS_SHIFT: u32 = 7;

/// Upper bound of memory classes for 64-bit sizes [TLSF]
pub const TLSF_MAX_MEMORY_CLASSES: usize = 65 - TLSF_MEMORY_CLASS_SHIFT as usize;

// =============================================================================
// LINEAR METADATA
// =============================================================================

/// Minimum number of entries before the 1st vector is compacted
/// [PERF] Below this, compaction costs more than scanning the holes
pub const LINEAR_COMPACT_MIN_ITEMS: usize = 32;

// =============================================================================
// DEFRAGMENTATION
// =============================================================================

/// Consecutive over-budget candidates tolerated before a pass ends
pub const DEFRAG_MAX_ALLOCS_TO_IGNORE: u32 = 16;

/// Metadata tag of a destination reserved by an in-flight pass
/// Never a valid packed slot key because slot indices stay below u32::MAX
pub const DEFRAG_RESERVED_TAG: u64 = u64::MAX;
