/*!
 * Core Types
 * Common types used across the allocator
 */

/// Byte size or offset inside a backing region
pub type DeviceSize = u64;

/// Monotonic creation index of a memory block inside its pool
pub type BlockId = u64;

/// Identifier of a pool registered with an allocator
pub type PoolId = u64;

/// Opaque caller tag stored next to every allocation
pub type UserData = u64;

/// Frame counter stamped onto allocations for diagnostics
pub type FrameIndex = u32;

/// Round `value` up to the next multiple of `alignment` (power of two or 1)
#[inline]
pub const fn align_up(value: DeviceSize, alignment: DeviceSize) -> DeviceSize {
    if alignment <= 1 {
        return value;
    }
    (value + alignment - 1) & !(alignment - 1)
}

/// [`align_up`] that reports overflow instead of wrapping
#[inline]
pub const fn checked_align_up(value: DeviceSize, alignment: DeviceSize) -> Option<DeviceSize> {
    if alignment <= 1 {
        return Some(value);
    }
    match value.checked_add(alignment - 1) {
        Some(bumped) => Some(bumped & !(alignment - 1)),
        None => None,
    }
}

/// Round `value` down to a multiple of `alignment` (power of two or 1)
#[inline]
pub const fn align_down(value: DeviceSize, alignment: DeviceSize) -> DeviceSize {
    if alignment <= 1 {
        return value;
    }
    value & !(alignment - 1)
}
