/*!
 * Linear Block Metadata
 *
 * Two suballocation vectors over one block:
 *
 * - the 1st vector grows upward from offset 0 in allocation order
 * - the 2nd vector is either empty, the wrapped part of a ring buffer
 *   (ascending offsets below the 1st vector), or the upper stack of a
 *   double stack (descending offsets from the top)
 *
 * Freed entries that are not at a vector boundary stay in place as null
 * items until everything between them and the boundary is freed too.
 * Handles are `offset + 1` so that no live handle is zero.
 */

use super::{AllocHandle, AllocationRequest, RangeDump, RequestKind, SubAllocation};
use crate::core::limits::LINEAR_COMPACT_MIN_ITEMS;
use crate::core::types::{align_down, align_up, DeviceSize, UserData};
use crate::memory::stats::{DetailedStatistics, Statistics};
use crate::memory::traits::BlockMetadata;
use crate::memory::types::Strategy;

#[derive(Debug, Clone, Copy)]
struct Suballocation {
    offset: DeviceSize,
    /// Occupied bytes, debug margin included
    size: DeviceSize,
    user_data: UserData,
    free: bool,
}

impl Suballocation {
    #[inline]
    fn end(&self) -> DeviceSize {
        self.offset + self.size
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SecondVectorMode {
    Empty,
    RingBuffer,
    DoubleStack,
}

/// Linear metadata
#[derive(Debug, Clone)]
pub struct LinearMetadata {
    size: DeviceSize,
    is_virtual: bool,
    debug_margin: DeviceSize,
    sum_free_size: DeviceSize,

    vectors: [Vec<Suballocation>; 2],
    first_vector_index: usize,
    second_vector_mode: SecondVectorMode,

    /// Null items at the start of the 1st vector
    first_null_items_begin_count: usize,
    /// Null items elsewhere in the 1st vector
    first_null_items_middle_count: usize,
    second_null_items_count: usize,
}

#[inline]
fn handle_for(offset: DeviceSize) -> AllocHandle {
    AllocHandle(offset + 1)
}

#[inline]
fn offset_of(handle: AllocHandle) -> DeviceSize {
    handle.0.wrapping_sub(1)
}

impl LinearMetadata {
    pub fn new(size: DeviceSize, debug_margin: DeviceSize, is_virtual: bool) -> Self {
        Self {
            size,
            is_virtual,
            debug_margin: if is_virtual { 0 } else { debug_margin },
            sum_free_size: size,
            vectors: [Vec::new(), Vec::new()],
            first_vector_index: 0,
            second_vector_mode: SecondVectorMode::Empty,
            first_null_items_begin_count: 0,
            first_null_items_middle_count: 0,
            second_null_items_count: 0,
        }
    }

    #[inline]
    fn first(&self) -> &Vec<Suballocation> {
        &self.vectors[self.first_vector_index]
    }

    #[inline]
    fn second(&self) -> &Vec<Suballocation> {
        &self.vectors[self.first_vector_index ^ 1]
    }

    #[inline]
    fn first_mut(&mut self) -> &mut Vec<Suballocation> {
        &mut self.vectors[self.first_vector_index]
    }

    #[inline]
    fn second_mut(&mut self) -> &mut Vec<Suballocation> {
        &mut self.vectors[self.first_vector_index ^ 1]
    }

    fn create_request_lower(
        &self,
        size: DeviceSize,
        alignment: DeviceSize,
    ) -> Option<AllocationRequest> {
        let extent = size.checked_add(self.debug_margin)?;
        let first = self.first();
        let second = self.second();

        if matches!(
            self.second_vector_mode,
            SecondVectorMode::Empty | SecondVectorMode::DoubleStack
        ) {
            // End of the 1st vector
            let base = first.last().map_or(0, Suballocation::end);
            let offset = align_up(base, alignment);
            let free_space_end = match self.second_vector_mode {
                SecondVectorMode::DoubleStack => second.last().map_or(self.size, |s| s.offset),
                _ => self.size,
            };
            if offset.checked_add(extent)? <= free_space_end {
                return Some(AllocationRequest {
                    handle: handle_for(offset),
                    offset,
                    size,
                    kind: RequestKind::EndOf1st,
                });
            }
        }

        if matches!(
            self.second_vector_mode,
            SecondVectorMode::Empty | SecondVectorMode::RingBuffer
        ) {
            // Wrap around: end of the 2nd vector, bounded by the oldest live 1st item
            let base = second.last().map_or(0, Suballocation::end);
            let offset = align_up(base, alignment);
            let limit = first
                .get(self.first_null_items_begin_count)
                .map_or(self.size, |s| s.offset);
            if offset.checked_add(extent)? <= limit {
                return Some(AllocationRequest {
                    handle: handle_for(offset),
                    offset,
                    size,
                    kind: RequestKind::EndOf2nd,
                });
            }
        }

        None
    }

    fn create_request_upper(
        &self,
        size: DeviceSize,
        alignment: DeviceSize,
    ) -> Option<AllocationRequest> {
        if self.second_vector_mode == SecondVectorMode::RingBuffer {
            return None;
        }

        let extent = size.checked_add(self.debug_margin)?;
        let top = self.second().last().map_or(self.size, |s| s.offset);
        if extent > top {
            return None;
        }
        let offset = align_down(top - extent, alignment);

        let end_of_first = self.first().last().map_or(0, Suballocation::end);
        if end_of_first <= offset {
            return Some(AllocationRequest {
                handle: handle_for(offset),
                offset,
                size,
                kind: RequestKind::UpperAddress,
            });
        }
        None
    }

    /// Find the live entry at `offset` and return (in_first, index)
    fn locate(&self, offset: DeviceSize) -> Option<(bool, usize)> {
        let begin = self.first_null_items_begin_count;
        if let Ok(pos) = self.first()[begin..].binary_search_by_key(&offset, |s| s.offset) {
            let index = begin + pos;
            if !self.first()[index].free {
                return Some((true, index));
            }
        }

        let found = match self.second_vector_mode {
            SecondVectorMode::Empty => return None,
            SecondVectorMode::RingBuffer => {
                self.second().binary_search_by_key(&offset, |s| s.offset)
            }
            SecondVectorMode::DoubleStack => {
                self.second().binary_search_by(|probe| offset.cmp(&probe.offset))
            }
        };
        match found {
            Ok(index) if !self.second()[index].free => Some((false, index)),
            _ => None,
        }
    }

    fn should_compact_first(&self) -> bool {
        let null_items = self.first_null_items_begin_count + self.first_null_items_middle_count;
        let count = self.first().len();
        count > LINEAR_COMPACT_MIN_ITEMS && null_items * 2 >= (count - null_items) * 3
    }

    fn cleanup_after_free(&mut self) {
        if self.is_empty() {
            self.vectors[0].clear();
            self.vectors[1].clear();
            self.first_null_items_begin_count = 0;
            self.first_null_items_middle_count = 0;
            self.second_null_items_count = 0;
            self.second_vector_mode = SecondVectorMode::Empty;
            return;
        }

        let first_count = self.first().len();

        // More null items at the beginning of the 1st vector
        while self.first_null_items_begin_count < first_count
            && self.first()[self.first_null_items_begin_count].free
        {
            self.first_null_items_begin_count += 1;
            self.first_null_items_middle_count -= 1;
        }

        // Null items at the end of the 1st vector
        while self.first_null_items_middle_count > 0
            && self.first().last().is_some_and(|s| s.free)
        {
            self.first_null_items_middle_count -= 1;
            self.first_mut().pop();
        }

        // Null items at the end of the 2nd vector
        while self.second_null_items_count > 0 && self.second().last().is_some_and(|s| s.free) {
            self.second_null_items_count -= 1;
            self.second_mut().pop();
        }

        // Null items at the beginning of the 2nd vector
        while self.second_null_items_count > 0 && self.second().first().is_some_and(|s| s.free) {
            self.second_null_items_count -= 1;
            self.second_mut().remove(0);
        }

        if self.should_compact_first() {
            self.first_mut().retain(|s| !s.free);
            self.first_null_items_begin_count = 0;
            self.first_null_items_middle_count = 0;
        }

        if self.second().is_empty() {
            self.second_vector_mode = SecondVectorMode::Empty;
        }

        if self.first().len() == self.first_null_items_begin_count {
            self.first_mut().clear();
            self.first_null_items_begin_count = 0;

            if !self.second().is_empty()
                && self.second_vector_mode == SecondVectorMode::RingBuffer
            {
                // The wrapped part becomes the new 1st vector
                self.second_vector_mode = SecondVectorMode::Empty;
                self.first_null_items_middle_count = self.second_null_items_count;
                self.second_null_items_count = 0;
                self.first_vector_index ^= 1;
                while self.first_null_items_begin_count < self.first().len()
                    && self.first()[self.first_null_items_begin_count].free
                {
                    self.first_null_items_begin_count += 1;
                    self.first_null_items_middle_count -= 1;
                }
            }
        }

        debug_assert!(self.validate());
    }

    /// Live entries in ascending offset order
    fn live_in_offset_order(&self) -> Vec<Suballocation> {
        let first = self.first()[self.first_null_items_begin_count..]
            .iter()
            .filter(|s| !s.free)
            .copied();
        let second = self.second().iter().filter(|s| !s.free).copied();
        match self.second_vector_mode {
            SecondVectorMode::RingBuffer => second.chain(first).collect(),
            SecondVectorMode::DoubleStack => {
                let mut upper: Vec<_> = second.collect();
                upper.reverse();
                first.chain(upper).collect()
            }
            SecondVectorMode::Empty => first.collect(),
        }
    }

    fn to_sub_allocation(&self, s: &Suballocation) -> SubAllocation {
        SubAllocation {
            handle: handle_for(s.offset),
            offset: s.offset,
            size: s.size - self.debug_margin,
            user_data: s.user_data,
        }
    }

    /// Free gaps between live entries, in ascending offset order
    fn gaps(&self) -> Vec<(DeviceSize, DeviceSize)> {
        let mut gaps = Vec::new();
        let mut cursor = 0;
        for s in self.live_in_offset_order() {
            if s.offset > cursor {
                gaps.push((cursor, s.offset - cursor));
            }
            cursor = s.end();
        }
        if cursor < self.size {
            gaps.push((cursor, self.size - cursor));
        }
        gaps
    }
}

impl BlockMetadata for LinearMetadata {
    fn size(&self) -> DeviceSize {
        self.size
    }

    fn is_virtual(&self) -> bool {
        self.is_virtual
    }

    fn debug_margin(&self) -> DeviceSize {
        self.debug_margin
    }

    fn allocation_count(&self) -> usize {
        self.first().len() - self.first_null_items_begin_count - self.first_null_items_middle_count
            + self.second().len()
            - self.second_null_items_count
    }

    fn free_regions_count(&self) -> usize {
        self.gaps().len()
    }

    fn sum_free_size(&self) -> DeviceSize {
        self.sum_free_size
    }

    fn is_empty(&self) -> bool {
        self.allocation_count() == 0
    }

    fn create_allocation_request(
        &mut self,
        size: DeviceSize,
        alignment: DeviceSize,
        upper_address: bool,
        _strategy: Strategy,
    ) -> Option<AllocationRequest> {
        if size == 0 {
            return None;
        }
        if upper_address {
            self.create_request_upper(size, alignment)
        } else {
            self.create_request_lower(size, alignment)
        }
    }

    fn alloc(&mut self, request: &AllocationRequest, user_data: UserData) {
        let entry = Suballocation {
            offset: request.offset,
            size: request.size + self.debug_margin,
            user_data,
            free: false,
        };

        match request.kind {
            RequestKind::UpperAddress => {
                debug_assert_ne!(
                    self.second_vector_mode,
                    SecondVectorMode::RingBuffer,
                    "double stack requested on a ring buffer"
                );
                self.second_mut().push(entry);
                self.second_vector_mode = SecondVectorMode::DoubleStack;
            }
            RequestKind::EndOf1st => {
                debug_assert!(self.first().last().map_or(true, |s| entry.offset >= s.end()));
                debug_assert!(entry.end() <= self.size);
                self.first_mut().push(entry);
            }
            RequestKind::EndOf2nd => {
                debug_assert_ne!(
                    self.second_vector_mode,
                    SecondVectorMode::DoubleStack,
                    "ring buffer requested on a double stack"
                );
                self.second_vector_mode = SecondVectorMode::RingBuffer;
                self.second_mut().push(entry);
            }
            RequestKind::FreeNode(_) => {
                debug_assert!(false, "general request passed to linear metadata");
                return;
            }
        }

        self.sum_free_size -= entry.size;
    }

    fn free(&mut self, handle: AllocHandle) {
        let offset = offset_of(handle);

        // Oldest live item of the 1st vector
        let begin = self.first_null_items_begin_count;
        if let Some(first) = self.first_mut().get_mut(begin) {
            if first.offset == offset && !first.free {
                first.free = true;
                first.user_data = 0;
                let size = first.size;
                self.sum_free_size += size;
                self.first_null_items_begin_count += 1;
                self.cleanup_after_free();
                return;
            }
        }

        // Top of the ring's wrapped part or of the upper stack
        match self.second_vector_mode {
            SecondVectorMode::RingBuffer | SecondVectorMode::DoubleStack => {
                if let Some(last) = self.second().last().copied() {
                    if last.offset == offset && !last.free {
                        self.sum_free_size += last.size;
                        self.second_mut().pop();
                        self.cleanup_after_free();
                        return;
                    }
                }
            }
            SecondVectorMode::Empty => {
                if let Some(last) = self.first().last().copied() {
                    if last.offset == offset && !last.free {
                        self.sum_free_size += last.size;
                        self.first_mut().pop();
                        self.cleanup_after_free();
                        return;
                    }
                }
            }
        }

        match self.locate(offset) {
            Some((true, index)) => {
                let entry = &mut self.first_mut()[index];
                entry.free = true;
                entry.user_data = 0;
                let size = entry.size;
                self.sum_free_size += size;
                self.first_null_items_middle_count += 1;
                self.cleanup_after_free();
            }
            Some((false, index)) => {
                let entry = &mut self.second_mut()[index];
                entry.free = true;
                entry.user_data = 0;
                let size = entry.size;
                self.sum_free_size += size;
                self.second_null_items_count += 1;
                self.cleanup_after_free();
            }
            None => debug_assert!(false, "allocation to free not found: {:?}", handle),
        }
    }

    fn allocation_info(&self, handle: AllocHandle) -> Option<SubAllocation> {
        let (in_first, index) = self.locate(offset_of(handle))?;
        let entry = if in_first {
            &self.first()[index]
        } else {
            &self.second()[index]
        };
        Some(self.to_sub_allocation(entry))
    }

    fn set_user_data(&mut self, handle: AllocHandle, user_data: UserData) {
        match self.locate(offset_of(handle)) {
            Some((true, index)) => self.first_mut()[index].user_data = user_data,
            Some((false, index)) => self.second_mut()[index].user_data = user_data,
            None => {}
        }
    }

    fn allocations(&self) -> Vec<SubAllocation> {
        self.live_in_offset_order()
            .iter()
            .map(|s| self.to_sub_allocation(s))
            .collect()
    }

    fn next_free_region_size(&self, handle: AllocHandle) -> DeviceSize {
        let offset = offset_of(handle);
        let live = self.live_in_offset_order();
        let Some(pos) = live.iter().position(|s| s.offset == offset) else {
            return 0;
        };
        let end = live[pos].end();
        let next_start = live.get(pos + 1).map_or(self.size, |s| s.offset);
        next_start.saturating_sub(end)
    }

    fn clear(&mut self) {
        self.sum_free_size = self.size;
        self.vectors[0].clear();
        self.vectors[1].clear();
        self.first_vector_index = 0;
        self.second_vector_mode = SecondVectorMode::Empty;
        self.first_null_items_begin_count = 0;
        self.first_null_items_middle_count = 0;
        self.second_null_items_count = 0;
    }

    fn add_statistics(&self, stats: &mut Statistics) {
        let count = self.allocation_count();
        stats.block_count += 1;
        stats.allocation_count += count;
        stats.block_bytes += self.size;
        stats.allocation_bytes +=
            self.size - self.sum_free_size - count as DeviceSize * self.debug_margin;
    }

    fn add_detailed_statistics(&self, stats: &mut DetailedStatistics) {
        stats.stats.block_count += 1;
        stats.stats.block_bytes += self.size;
        for s in self.live_in_offset_order() {
            stats.add_allocation(s.size - self.debug_margin);
        }
        for (_, size) in self.gaps() {
            stats.add_unused_range(size);
        }
    }

    fn debug_dump(&self) -> Vec<RangeDump> {
        let mut ranges: Vec<RangeDump> = self
            .live_in_offset_order()
            .into_iter()
            .map(|s| RangeDump {
                offset: s.offset,
                size: s.size,
                free: false,
                user_data: Some(s.user_data),
            })
            .chain(self.gaps().into_iter().map(|(offset, size)| RangeDump {
                offset,
                size,
                free: true,
                user_data: None,
            }))
            .collect();
        ranges.sort_by_key(|r| r.offset);
        ranges
    }

    fn validate(&self) -> bool {
        let first = self.first();
        let second = self.second();

        if second.is_empty() != (self.second_vector_mode == SecondVectorMode::Empty) {
            return false;
        }
        let null_items = self.first_null_items_begin_count + self.first_null_items_middle_count;
        if first.is_empty() && null_items != 0 {
            return false;
        }
        if self.first_null_items_begin_count > first.len() {
            return false;
        }
        if first[..self.first_null_items_begin_count].iter().any(|s| !s.free) {
            return false;
        }

        let middle_nulls = first[self.first_null_items_begin_count..]
            .iter()
            .filter(|s| s.free)
            .count();
        let second_nulls = second.iter().filter(|s| s.free).count();
        if middle_nulls != self.first_null_items_middle_count
            || second_nulls != self.second_null_items_count
        {
            return false;
        }

        let ascending = |v: &[Suballocation]| v.windows(2).all(|w| w[0].end() <= w[1].offset);
        if !ascending(&first[self.first_null_items_begin_count..]) {
            return false;
        }
        match self.second_vector_mode {
            SecondVectorMode::RingBuffer => {
                if !ascending(second.as_slice()) {
                    return false;
                }
                let ring_end = second.last().map_or(0, Suballocation::end);
                let first_start = first
                    .get(self.first_null_items_begin_count)
                    .map_or(self.size, |s| s.offset);
                if ring_end > first_start {
                    return false;
                }
            }
            SecondVectorMode::DoubleStack => {
                if !second.windows(2).all(|w| w[1].end() <= w[0].offset) {
                    return false;
                }
                let lower_end = first.last().map_or(0, Suballocation::end);
                let upper_start = second.last().map_or(self.size, |s| s.offset);
                if lower_end > upper_start {
                    return false;
                }
            }
            SecondVectorMode::Empty => {}
        }

        let used: DeviceSize = first
            .iter()
            .chain(second.iter())
            .filter(|s| !s.free)
            .map(|s| s.size)
            .sum();
        let max_end = first
            .iter()
            .chain(second.iter())
            .filter(|s| !s.free)
            .map(Suballocation::end)
            .max()
            .unwrap_or(0);

        used + self.sum_free_size == self.size && max_end <= self.size
    }
}
