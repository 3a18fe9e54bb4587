/*!
 * Defragmentation
 *
 * Incremental, move-based compaction. Each pass proposes moves and
 * reserves their destinations as temporary allocations; the caller copies
 * the bytes (or marks moves `Ignore`/`Destroy`) and hands the pass back to
 * [`DefragmentationContext::end_pass`], which commits the result.
 *
 * ```text
 * Created -> (begin_pass -> caller copies -> end_pass)* -> Finished
 * ```
 */

mod algorithm;

use super::metadata::AllocHandle;
use super::pool::{Allocation, Placement, Pool, PoolState};
use super::provider::RegionHandle;
use super::traits::BlockMetadata;
use super::types::Algorithm;
use crate::core::data_structures::SlotKey;
use crate::core::errors::{AllocError, AllocResult};
use crate::core::types::{BlockId, DeviceSize};
use crate::monitoring::span_operation;
use ahash::RandomState;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, info, warn};

/// How aggressively allocations are moved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefragmentationAlgorithm {
    /// Only moves between blocks
    Fast,
    /// Moves between blocks, plus in-block moves when the gaps around an
    /// allocation are large relative to the pool's averages
    #[default]
    Balanced,
    /// Every allocation goes to the lowest block and offset it fits
    Full,
}

/// Parameters of a defragmentation run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DefragmentationDesc {
    pub algorithm: DefragmentationAlgorithm,
    /// Bytes moved per pass, 0 = unlimited
    pub max_bytes_per_pass: DeviceSize,
    /// Moves per pass, 0 = unlimited
    pub max_allocations_per_pass: u32,
}

impl DefragmentationDesc {
    pub fn new(algorithm: DefragmentationAlgorithm) -> Self {
        Self {
            algorithm,
            ..Default::default()
        }
    }

    pub fn with_max_bytes_per_pass(mut self, bytes: DeviceSize) -> Self {
        self.max_bytes_per_pass = bytes;
        self
    }

    pub fn with_max_allocations_per_pass(mut self, count: u32) -> Self {
        self.max_allocations_per_pass = count;
        self
    }
}

/// Cumulative results of a context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DefragmentationStats {
    pub bytes_moved: DeviceSize,
    pub allocations_moved: u32,
    pub bytes_freed: DeviceSize,
    pub blocks_freed: u32,
}

/// What the caller did with a proposed move
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MoveOperation {
    /// Bytes were copied to the destination; commit the move
    #[default]
    Copy,
    /// Leave the allocation where it is and stop proposing it
    Ignore,
    /// The caller destroyed the allocation instead of moving it
    Destroy,
}

/// One proposed relocation
#[derive(Debug)]
pub struct DefragmentationMove {
    pub operation: MoveOperation,
    source: Allocation,
    src_region: RegionHandle,
    src_offset: DeviceSize,
    dst_region: RegionHandle,
    dst_offset: DeviceSize,
    size: DeviceSize,

    target: usize,
    src_block: BlockId,
    src_handle: AllocHandle,
    dst_block: BlockId,
    dst_handle: AllocHandle,
}

impl DefragmentationMove {
    #[inline]
    pub fn source(&self) -> Allocation {
        self.source
    }

    #[inline]
    pub fn source_region(&self) -> RegionHandle {
        self.src_region
    }

    #[inline]
    pub fn source_offset(&self) -> DeviceSize {
        self.src_offset
    }

    #[inline]
    pub fn destination_region(&self) -> RegionHandle {
        self.dst_region
    }

    #[inline]
    pub fn destination_offset(&self) -> DeviceSize {
        self.dst_offset
    }

    #[inline]
    pub fn destination_block(&self) -> BlockId {
        self.dst_block
    }

    #[inline]
    pub fn size(&self) -> DeviceSize {
        self.size
    }

    pub fn ignore(&mut self) {
        self.operation = MoveOperation::Ignore;
    }

    pub fn destroy(&mut self) {
        self.operation = MoveOperation::Destroy;
    }
}

/// Moves of one pass, handed back to [`DefragmentationContext::end_pass`]
#[derive(Debug)]
pub struct DefragmentationPass {
    id: u64,
    pub moves: Vec<DefragmentationMove>,
}

impl DefragmentationPass {
    #[inline]
    pub fn len(&self) -> usize {
        self.moves.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.moves.is_empty()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, DefragmentationMove> {
        self.moves.iter_mut()
    }
}

/// Result of [`DefragmentationContext::end_pass`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PassOutcome {
    /// Something changed, another pass may find more work
    Incomplete,
    /// Nothing left to do
    Complete,
}

/// Running averages used by the balanced algorithm
#[derive(Debug, Clone, Copy)]
pub(crate) struct BalancedState {
    pub avg_alloc_size: DeviceSize,
    pub avg_free_size: DeviceSize,
}

pub(crate) struct PoolTarget {
    pub pool: Pool,
    pub ignored: HashSet<SlotKey, RandomState>,
    pub balanced: Option<BalancedState>,
}

/// Defragmentation over one pool or every default pool
///
/// Holds the pools' in-progress flags until dropped.
pub struct DefragmentationContext {
    desc: DefragmentationDesc,
    targets: Vec<PoolTarget>,
    stats: DefragmentationStats,
    next_pass: u64,
    /// Destinations reserved by the pass the caller currently holds
    outstanding: Option<(u64, Vec<(usize, BlockId, AllocHandle)>)>,
    finished: bool,
}

impl DefragmentationContext {
    pub(crate) fn new(pools: Vec<Pool>, desc: DefragmentationDesc) -> AllocResult<Self> {
        if let Some(pool) = pools.iter().find(|p| p.algorithm() == Algorithm::Linear) {
            return Err(AllocError::invalid(format!(
                "pool {} uses the linear algorithm and cannot be defragmented",
                pool.id()
            )));
        }

        let mut claimed: Vec<Pool> = Vec::with_capacity(pools.len());
        for pool in pools {
            if !pool.try_begin_defragmentation() {
                for p in &claimed {
                    p.end_defragmentation();
                }
                return Err(AllocError::AlreadyInProgress);
            }
            claimed.push(pool);
        }

        info!(
            pools = claimed.len(),
            algorithm = ?desc.algorithm,
            "defragmentation started"
        );

        Ok(Self {
            desc,
            targets: claimed
                .into_iter()
                .map(|pool| PoolTarget {
                    pool,
                    ignored: HashSet::with_hasher(RandomState::new()),
                    balanced: None,
                })
                .collect(),
            stats: DefragmentationStats::default(),
            next_pass: 0,
            outstanding: None,
            finished: false,
        })
    }

    /// Cumulative statistics of every ended pass
    #[inline]
    pub fn stats(&self) -> DefragmentationStats {
        self.stats
    }

    #[inline]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Compute the next batch of moves; `None` once nothing is left to move
    pub fn begin_pass(&mut self) -> AllocResult<Option<DefragmentationPass>> {
        if self.outstanding.is_some() {
            return Err(AllocError::invalid(
                "previous defragmentation pass has not been ended",
            ));
        }
        if self.finished {
            return Ok(None);
        }

        let moves = algorithm::compute_moves(&self.desc, &mut self.targets);
        if moves.is_empty() {
            self.finished = true;
            debug!("defragmentation found nothing to move");
            return Ok(None);
        }

        let id = self.next_pass;
        self.next_pass += 1;
        let reserved = moves
            .iter()
            .map(|m| (m.target, m.dst_block, m.dst_handle))
            .collect();
        self.outstanding = Some((id, reserved));
        debug!(pass = id, moves = moves.len(), "defragmentation pass begun");
        Ok(Some(DefragmentationPass { id, moves }))
    }

    /// Commit a pass returned by [`begin_pass`](Self::begin_pass)
    pub fn end_pass(&mut self, pass: DefragmentationPass) -> AllocResult<PassOutcome> {
        let reserved = match self.outstanding.take() {
            Some((id, reserved)) if id == pass.id => reserved,
            other => {
                self.outstanding = other;
                return Err(AllocError::invalid(
                    "pass does not belong to this defragmentation context",
                ));
            }
        };

        // Destinations of moves the caller dropped from the pass
        for (target, block, handle) in reserved {
            let kept = pass
                .moves
                .iter()
                .any(|m| m.target == target && m.dst_block == block && m.dst_handle == handle);
            if !kept {
                if let Some(t) = self.targets.get(target) {
                    free_in_block(&mut t.pool.lock_state(), block, handle);
                }
            }
        }

        let span = span_operation("defragmentation_pass");
        span.record_items_processed(pass.moves.len());
        let bytes_before = self.stats.bytes_moved;

        let mut changed = false;
        for (index, target) in self.targets.iter_mut().enumerate() {
            let moves: Vec<&DefragmentationMove> =
                pass.moves.iter().filter(|m| m.target == index).collect();
            if moves.is_empty() {
                continue;
            }

            let released = {
                let mut state = target.pool.lock_state();
                let state = &mut *state;
                for m in moves {
                    let key = m.source.key();
                    let valid = state.records.get(key).map_or(false, |r| {
                        r.placement
                            == Placement::Block {
                                block: m.src_block,
                                handle: m.src_handle,
                            }
                    });
                    if !valid {
                        warn!(pass = pass.id, "defragmentation source changed during pass");
                        free_in_block(state, m.dst_block, m.dst_handle);
                        continue;
                    }

                    match m.operation {
                        MoveOperation::Copy => {
                            if let Some(block) = state.vector.block_mut(m.dst_block) {
                                block.metadata_mut().set_user_data(m.dst_handle, key.to_bits());
                            }
                            if let Some(record) = state.records.get_mut(key) {
                                record.placement = Placement::Block {
                                    block: m.dst_block,
                                    handle: m.dst_handle,
                                };
                                record.offset = m.dst_offset;
                                record.zeroed = false;
                            }
                            free_in_block(state, m.src_block, m.src_handle);
                            self.stats.bytes_moved += m.size;
                            self.stats.allocations_moved += 1;
                            changed = true;
                        }
                        MoveOperation::Ignore => {
                            free_in_block(state, m.dst_block, m.dst_handle);
                            target.ignored.insert(key);
                        }
                        MoveOperation::Destroy => {
                            free_in_block(state, m.dst_block, m.dst_handle);
                            if let Some(record) = state.records.remove(key) {
                                state.allocation_count -= 1;
                                state.allocation_bytes -= record.size;
                            }
                            free_in_block(state, m.src_block, m.src_handle);
                            changed = true;
                        }
                    }
                }
                state.vector.release_empty_blocks()
            };

            if !released.is_empty() {
                changed = true;
                self.stats.blocks_freed += released.len() as u32;
                self.stats.bytes_freed += released.iter().map(|r| r.size).sum::<DeviceSize>();
            }
            target.pool.destroy_regions(released);
        }

        span.record_bytes(self.stats.bytes_moved - bytes_before);
        debug!(
            pass = pass.id,
            moved = self.stats.allocations_moved,
            blocks_freed = self.stats.blocks_freed,
            "defragmentation pass ended"
        );

        if changed {
            Ok(PassOutcome::Incomplete)
        } else {
            Ok(PassOutcome::Complete)
        }
    }
}

/// Free a range without releasing its block; empty blocks are swept at pass end
fn free_in_block(state: &mut PoolState, block: BlockId, handle: AllocHandle) {
    if let Some(block) = state.vector.block_mut(block) {
        block.free(handle);
    }
}

impl Drop for DefragmentationContext {
    fn drop(&mut self) {
        if let Some((_, reserved)) = self.outstanding.take() {
            for (target, block, handle) in reserved {
                if let Some(t) = self.targets.get(target) {
                    let mut state = t.pool.lock_state();
                    free_in_block(&mut state, block, handle);
                }
            }
        }
        for target in &self.targets {
            let released = target.pool.lock_state().vector.release_empty_blocks();
            target.pool.destroy_regions(released);
            target.pool.end_defragmentation();
        }
        info!(
            moved = self.stats.allocations_moved,
            bytes_moved = self.stats.bytes_moved,
            blocks_freed = self.stats.blocks_freed,
            "defragmentation finished"
        );
    }
}
