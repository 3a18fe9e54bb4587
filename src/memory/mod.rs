/*!
 * Memory Module
 * Sub-allocation engine: block metadata, pools, allocator and defragmentation
 */

mod allocator;
mod block;
mod block_vector;
mod config;
pub mod defrag;
pub mod metadata;
mod pool;
pub mod provider;
pub mod stats;
pub mod traits;
pub mod types;
mod virtual_block;

// Re-export for convenience
pub use allocator::Allocator;
pub use config::AllocatorConfig;
pub use defrag::{
    DefragmentationAlgorithm, DefragmentationContext, DefragmentationDesc, DefragmentationMove,
    DefragmentationPass, DefragmentationStats, MoveOperation, PassOutcome,
};
pub use pool::{Allocation, Pool};
pub use provider::{Region, RegionHandle, RegionProvider, SegmentBudget, SimulatedProvider};
pub use stats::{Budget, DetailedStatistics, Statistics, TotalStatistics};
pub use traits::*;
pub use types::*;
pub use virtual_block::{VirtualAllocation, VirtualBlock};
