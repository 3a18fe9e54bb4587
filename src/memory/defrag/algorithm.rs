/*!
 * Move Planning
 *
 * Candidates are taken from the newest blocks, highest offsets first.
 * Destinations are searched with the min-offset strategy in the oldest
 * blocks and committed right away under a reserved tag, so later
 * allocations cannot take them before the pass ends.
 */

use super::{
    BalancedState, DefragmentationAlgorithm, DefragmentationDesc, DefragmentationMove,
    MoveOperation, PoolTarget,
};
use crate::core::data_structures::SlotKey;
use crate::core::limits::{DEFRAG_MAX_ALLOCS_TO_IGNORE, DEFRAG_RESERVED_TAG};
use crate::core::types::{BlockId, DeviceSize};
use crate::memory::metadata::AllocHandle;
use crate::memory::pool::{Pool, PoolState};
use crate::memory::provider::RegionHandle;
use crate::memory::stats::DetailedStatistics;
use crate::memory::traits::BlockMetadata;
use crate::memory::types::Strategy;
use ahash::RandomState;
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CounterStatus {
    Pass,
    Ignore,
    End,
}

/// Per-pass limits shared by every pool of the context
struct PassBudget {
    max_bytes: DeviceSize,
    max_allocations: u32,
    bytes_moved: DeviceSize,
    allocations_moved: u32,
    ignored: u32,
}

impl PassBudget {
    fn new(desc: &DefragmentationDesc) -> Self {
        Self {
            max_bytes: match desc.max_bytes_per_pass {
                0 => DeviceSize::MAX,
                n => n,
            },
            max_allocations: match desc.max_allocations_per_pass {
                0 => u32::MAX,
                n => n,
            },
            bytes_moved: 0,
            allocations_moved: 0,
            ignored: 0,
        }
    }

    fn check(&mut self, bytes: DeviceSize) -> CounterStatus {
        if self.bytes_moved.saturating_add(bytes) > self.max_bytes {
            self.ignored += 1;
            if self.ignored < DEFRAG_MAX_ALLOCS_TO_IGNORE {
                CounterStatus::Ignore
            } else {
                CounterStatus::End
            }
        } else {
            CounterStatus::Pass
        }
    }

    /// Account for one move; true when the pass is full
    fn increment(&mut self, bytes: DeviceSize) -> bool {
        self.bytes_moved = self.bytes_moved.saturating_add(bytes);
        self.allocations_moved += 1;
        if self.allocations_moved >= self.max_allocations || self.bytes_moved >= self.max_bytes {
            self.ignored = 0;
            true
        } else {
            false
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    key: SlotKey,
    block: BlockId,
    handle: AllocHandle,
    region: RegionHandle,
    offset: DeviceSize,
    size: DeviceSize,
    alignment: DeviceSize,
}

struct Planner<'a> {
    target: usize,
    pool: &'a Pool,
    ignored: &'a HashSet<SlotKey, RandomState>,
    state: &'a mut PoolState,
    budget: &'a mut PassBudget,
    moves: &'a mut Vec<DefragmentationMove>,
}

/// Plan one pass over every target
pub(super) fn compute_moves(
    desc: &DefragmentationDesc,
    targets: &mut [PoolTarget],
) -> Vec<DefragmentationMove> {
    let mut budget = PassBudget::new(desc);
    let mut moves = Vec::new();

    for (index, target) in targets.iter_mut().enumerate() {
        let mut guard = target.pool.lock_state();
        let mut planner = Planner {
            target: index,
            pool: &target.pool,
            ignored: &target.ignored,
            state: &mut *guard,
            budget: &mut budget,
            moves: &mut moves,
        };
        if planner.run(desc.algorithm, &mut target.balanced) {
            break;
        }
    }
    moves
}

impl Planner<'_> {
    /// Returns true when the pass budget is exhausted
    fn run(
        &mut self,
        algorithm: DefragmentationAlgorithm,
        balanced: &mut Option<BalancedState>,
    ) -> bool {
        match self.state.vector.block_count() {
            0 => false,
            1 => self.realloc_within_single_block(),
            _ => match algorithm {
                DefragmentationAlgorithm::Fast => self.fast(),
                DefragmentationAlgorithm::Balanced => self.balanced(balanced),
                DefragmentationAlgorithm::Full => self.full(),
            },
        }
    }

    fn realloc_within_single_block(&mut self) -> bool {
        for candidate in self.candidates(0) {
            match self.budget.check(candidate.size) {
                CounterStatus::Ignore => continue,
                CounterStatus::End => return true,
                CounterStatus::Pass => {}
            }
            if self.realloc_in_block(0, &candidate) && self.budget.increment(candidate.size) {
                return true;
            }
        }
        false
    }

    fn fast(&mut self) -> bool {
        let count = self.state.vector.block_count();
        for i in (1..count).rev() {
            for candidate in self.candidates(i) {
                match self.budget.check(candidate.size) {
                    CounterStatus::Ignore => continue,
                    CounterStatus::End => return true,
                    CounterStatus::Pass => {}
                }
                if self.alloc_in_other_block(0, i, &candidate)
                    && self.budget.increment(candidate.size)
                {
                    return true;
                }
            }
        }
        false
    }

    fn balanced(&mut self, state: &mut Option<BalancedState>) -> bool {
        let fresh = state.is_none();
        let averages = *state.get_or_insert_with(|| self.averages());
        let before = self.moves.len();

        if self.balanced_scan(averages) {
            return true;
        }
        if self.moves.len() == before && !fresh {
            // Averages may be stale after earlier passes
            let averages = self.averages();
            *state = Some(averages);
            return self.balanced_scan(averages);
        }
        false
    }

    fn balanced_scan(&mut self, averages: BalancedState) -> bool {
        let count = self.state.vector.block_count();
        let min_free_region = averages.avg_free_size / 2;

        for i in (1..count).rev() {
            let mut next_free = 0;
            for candidate in self.candidates(i) {
                match self.budget.check(candidate.size) {
                    CounterStatus::Ignore => continue,
                    CounterStatus::End => return true,
                    CounterStatus::Pass => {}
                }
                if self.alloc_in_other_block(0, i, &candidate) {
                    if self.budget.increment(candidate.size) {
                        return true;
                    }
                    continue;
                }

                let prev_free = next_free;
                next_free = self.state.vector.blocks()[i]
                    .metadata()
                    .next_free_region_size(candidate.handle);
                let worth_it = prev_free >= min_free_region
                    || next_free >= min_free_region
                    || candidate.size <= averages.avg_free_size
                    || candidate.size <= averages.avg_alloc_size;
                if worth_it
                    && self.realloc_in_block(i, &candidate)
                    && self.budget.increment(candidate.size)
                {
                    return true;
                }
            }
        }
        false
    }

    fn full(&mut self) -> bool {
        let count = self.state.vector.block_count();
        for i in (0..count).rev() {
            for candidate in self.candidates(i) {
                match self.budget.check(candidate.size) {
                    CounterStatus::Ignore => continue,
                    CounterStatus::End => return true,
                    CounterStatus::Pass => {}
                }
                let moved = self.alloc_in_other_block(0, i, &candidate)
                    || self.realloc_in_block(i, &candidate);
                if moved && self.budget.increment(candidate.size) {
                    return true;
                }
            }
        }
        false
    }

    fn averages(&self) -> BalancedState {
        let mut stats = DetailedStatistics::default();
        self.state.vector.add_detailed_statistics(&mut stats);
        BalancedState {
            avg_alloc_size: stats.average_allocation_size(),
            avg_free_size: stats.average_unused_range_size(),
        }
    }

    /// Movable allocations of block `index`, highest offset first
    fn candidates(&self, index: usize) -> Vec<Candidate> {
        let block = &self.state.vector.blocks()[index];
        block
            .metadata()
            .allocations()
            .into_iter()
            .rev()
            .filter(|sub| sub.user_data != DEFRAG_RESERVED_TAG)
            .filter_map(|sub| {
                let key = SlotKey::from_bits(sub.user_data);
                if self.ignored.contains(&key) {
                    return None;
                }
                let record = self.state.records.get(key)?;
                Some(Candidate {
                    key,
                    block: block.id(),
                    handle: sub.handle,
                    region: block.handle(),
                    offset: record.offset,
                    size: record.size,
                    alignment: record.alignment,
                })
            })
            .collect()
    }

    /// Reserve a destination in blocks `start..end`
    fn alloc_in_other_block(&mut self, start: usize, end: usize, candidate: &Candidate) -> bool {
        for j in start..end {
            let block = &mut self.state.vector.blocks_mut()[j];
            if block.metadata().sum_free_size() < candidate.size {
                continue;
            }
            let request = match block.metadata_mut().create_allocation_request(
                candidate.size,
                candidate.alignment,
                false,
                Strategy::MinOffset,
            ) {
                Some(request) => request,
                None => continue,
            };
            block.commit(&request, DEFRAG_RESERVED_TAG);
            let (dst_block, dst_region) = (block.id(), block.handle());
            self.push_move(candidate, dst_block, dst_region, request.handle, request.offset);
            return true;
        }
        false
    }

    /// Reserve a lower offset inside the candidate's own block
    fn realloc_in_block(&mut self, index: usize, candidate: &Candidate) -> bool {
        let block = &mut self.state.vector.blocks_mut()[index];
        if candidate.offset == 0 || block.metadata().sum_free_size() < candidate.size {
            return false;
        }
        let request = match block.metadata_mut().create_allocation_request(
            candidate.size,
            candidate.alignment,
            false,
            Strategy::MinOffset,
        ) {
            Some(request) if request.offset < candidate.offset => request,
            _ => return false,
        };
        block.commit(&request, DEFRAG_RESERVED_TAG);
        let (dst_block, dst_region) = (block.id(), block.handle());
        self.push_move(candidate, dst_block, dst_region, request.handle, request.offset);
        true
    }

    fn push_move(
        &mut self,
        candidate: &Candidate,
        dst_block: BlockId,
        dst_region: RegionHandle,
        dst_handle: AllocHandle,
        dst_offset: DeviceSize,
    ) {
        self.moves.push(DefragmentationMove {
            operation: MoveOperation::Copy,
            source: self.pool.handle_for(candidate.key),
            src_region: candidate.region,
            src_offset: candidate.offset,
            dst_region,
            dst_offset,
            size: candidate.size,
            target: self.target,
            src_block: candidate.block,
            src_handle: candidate.handle,
            dst_block,
            dst_handle,
        });
    }
}
