/*!
 * Shared fixtures for memory tests
 */

use region_suballoc::memory::metadata::SubAllocation;
use region_suballoc::{AllocationInfo, Allocator, AllocatorConfig, SimulatedProvider};
use std::sync::Arc;

pub const KB: u64 = 1024;
pub const MB: u64 = 1024 * KB;

/// Allocator over an unlimited simulated provider
pub fn setup() -> (Arc<SimulatedProvider>, Allocator) {
    setup_with(SimulatedProvider::unlimited(), AllocatorConfig::default())
}

pub fn setup_with(
    provider: SimulatedProvider,
    config: AllocatorConfig,
) -> (Arc<SimulatedProvider>, Allocator) {
    let provider = Arc::new(provider);
    let allocator =
        Allocator::with_config(provider.clone(), config).expect("allocator creation failed");
    (provider, allocator)
}

/// Two allocations in the same region must not share a byte
pub fn assert_disjoint(a: &AllocationInfo, b: &AllocationInfo) {
    if a.region != b.region {
        return;
    }
    assert!(
        a.end() <= b.offset || b.end() <= a.offset,
        "ranges overlap: [{}, {}) and [{}, {})",
        a.offset,
        a.end(),
        b.offset,
        b.end()
    );
}

/// Sub-allocations in ascending offset order must not overlap
pub fn assert_sorted_disjoint(allocations: &[SubAllocation]) {
    for pair in allocations.windows(2) {
        assert!(
            pair[0].end() <= pair[1].offset,
            "sub-allocations overlap: {:?} and {:?}",
            pair[0],
            pair[1]
        );
    }
}
