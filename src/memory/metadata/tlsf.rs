/*!
 * General Block Metadata (TLSF)
 *
 * Two-level segregated fit: free ranges are bucketed by a logarithmic
 * memory class and 2^5 linear sub-classes. Two bitmaps locate the first
 * non-empty bucket at or above a size in O(1).
 *
 * Physical ranges form a doubly linked chain in offset order that always
 * ends with the "null block": the untouched tail of the block. The null
 * block is free but never sits in a bucket.
 *
 * A debug margin, when set, is part of the occupied node: an allocation
 * of `size` bytes takes `size + margin` bytes and the margin trails it.
 */

use super::{AllocHandle, AllocationRequest, RangeDump, RequestKind, SubAllocation};
use crate::core::limits::{
    TLSF_MAX_MEMORY_CLASSES, TLSF_MEMORY_CLASS_SHIFT, TLSF_SECOND_LEVEL_INDEX,
    TLSF_SMALL_BUFFER_SIZE,
};
use crate::core::types::{align_up, DeviceSize, UserData};
use crate::memory::stats::{DetailedStatistics, Statistics};
use crate::memory::traits::BlockMetadata;
use crate::memory::types::Strategy;

type NodeId = usize;

#[derive(Debug, Clone)]
struct Node {
    offset: DeviceSize,
    size: DeviceSize,
    prev_physical: Option<NodeId>,
    next_physical: Option<NodeId>,
    free: bool,
    prev_free: Option<NodeId>,
    next_free: Option<NodeId>,
    user_data: UserData,
}

impl Node {
    fn null_block(offset: DeviceSize, size: DeviceSize, prev_physical: Option<NodeId>) -> Self {
        Self {
            offset,
            size,
            prev_physical,
            next_physical: None,
            free: true,
            prev_free: None,
            next_free: None,
            user_data: 0,
        }
    }
}

/// General-purpose metadata
#[derive(Debug, Clone)]
pub struct TlsfMetadata {
    size: DeviceSize,
    is_virtual: bool,
    debug_margin: DeviceSize,

    nodes: Vec<Node>,
    vacant: Vec<NodeId>,
    null_block: NodeId,

    alloc_count: usize,
    blocks_free_count: usize,
    blocks_free_size: DeviceSize,

    is_free_bitmap: u64,
    inner_is_free_bitmap: [u32; TLSF_MAX_MEMORY_CLASSES],
    free_list: Vec<Option<NodeId>>,
    lists_count: usize,
    memory_classes: usize,
}

#[inline]
fn bit_scan_msb(value: DeviceSize) -> u32 {
    63 - value.leading_zeros()
}

#[inline]
fn size_to_memory_class(size: DeviceSize) -> usize {
    if size > TLSF_SMALL_BUFFER_SIZE {
        (bit_scan_msb(size) - TLSF_MEMORY_CLASS_SHIFT) as usize
    } else {
        0
    }
}

impl TlsfMetadata {
    pub fn new(size: DeviceSize, debug_margin: DeviceSize, is_virtual: bool) -> Self {
        let mut metadata = Self {
            size,
            is_virtual,
            debug_margin: if is_virtual { 0 } else { debug_margin },
            nodes: Vec::new(),
            vacant: Vec::new(),
            null_block: 0,
            alloc_count: 0,
            blocks_free_count: 0,
            blocks_free_size: 0,
            is_free_bitmap: 0,
            inner_is_free_bitmap: [0; TLSF_MAX_MEMORY_CLASSES],
            free_list: Vec::new(),
            lists_count: 0,
            memory_classes: 0,
        };

        let memory_class = size_to_memory_class(size);
        let second_index = metadata.size_to_second_index(size, memory_class) as usize;
        let mut lists_count = if memory_class == 0 {
            0
        } else {
            (memory_class - 1) * (1 << TLSF_SECOND_LEVEL_INDEX) + second_index
        } + 1;
        lists_count += if is_virtual {
            1 << TLSF_SECOND_LEVEL_INDEX
        } else {
            4
        };

        metadata.lists_count = lists_count;
        metadata.memory_classes = memory_class + 2;
        metadata.free_list = vec![None; lists_count];
        metadata.nodes.push(Node::null_block(0, size, None));
        metadata
    }

    // ===== Indexing =====

    fn size_to_second_index(&self, size: DeviceSize, memory_class: usize) -> u32 {
        if memory_class == 0 {
            let step = if self.is_virtual { 8 } else { 64 };
            return (size.saturating_sub(1) / step) as u32;
        }
        let shift = memory_class as u32 + TLSF_MEMORY_CLASS_SHIFT - TLSF_SECOND_LEVEL_INDEX;
        ((size >> shift) ^ (1 << TLSF_SECOND_LEVEL_INDEX)) as u32
    }

    fn list_index(&self, memory_class: usize, second_index: u32) -> usize {
        if memory_class == 0 {
            return second_index as usize;
        }
        let index = (memory_class - 1) * (1 << TLSF_SECOND_LEVEL_INDEX) + second_index as usize;
        if self.is_virtual {
            index + (1 << TLSF_SECOND_LEVEL_INDEX)
        } else {
            index + 4
        }
    }

    fn list_index_for_size(&self, size: DeviceSize) -> usize {
        let memory_class = size_to_memory_class(size);
        self.list_index(memory_class, self.size_to_second_index(size, memory_class))
    }

    // ===== Node arena =====

    fn alloc_node(&mut self, node: Node) -> NodeId {
        match self.vacant.pop() {
            Some(id) => {
                self.nodes[id] = node;
                id
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        }
    }

    fn release_node(&mut self, id: NodeId) {
        let node = &mut self.nodes[id];
        node.free = true;
        node.prev_physical = None;
        node.next_physical = None;
        node.prev_free = None;
        node.next_free = None;
        self.vacant.push(id);
    }

    /// Physical successor of a taken node; the null block always terminates the chain
    fn next_of(&self, id: NodeId) -> NodeId {
        debug_assert!(self.nodes[id].next_physical.is_some() || id == self.null_block);
        self.nodes[id].next_physical.unwrap_or(self.null_block)
    }

    // ===== Free lists =====

    fn insert_free_block(&mut self, id: NodeId) {
        debug_assert_ne!(id, self.null_block);
        debug_assert!(!self.nodes[id].free, "cannot insert a block twice");

        let size = self.nodes[id].size;
        let memory_class = size_to_memory_class(size);
        let second_index = self.size_to_second_index(size, memory_class);
        let index = self.list_index(memory_class, second_index);
        debug_assert!(index < self.lists_count);

        let head = self.free_list[index];
        let node = &mut self.nodes[id];
        node.free = true;
        node.prev_free = None;
        node.next_free = head;
        self.free_list[index] = Some(id);

        match head {
            Some(next) => self.nodes[next].prev_free = Some(id),
            None => {
                self.inner_is_free_bitmap[memory_class] |= 1u32 << second_index;
                self.is_free_bitmap |= 1u64 << memory_class;
            }
        }

        self.blocks_free_count += 1;
        self.blocks_free_size += size;
    }

    fn remove_free_block(&mut self, id: NodeId) {
        debug_assert_ne!(id, self.null_block);
        debug_assert!(self.nodes[id].free);

        let (prev, next, size) = {
            let node = &self.nodes[id];
            (node.prev_free, node.next_free, node.size)
        };

        if let Some(next) = next {
            self.nodes[next].prev_free = prev;
        }
        match prev {
            Some(prev) => self.nodes[prev].next_free = next,
            None => {
                let memory_class = size_to_memory_class(size);
                let second_index = self.size_to_second_index(size, memory_class);
                let index = self.list_index(memory_class, second_index);
                debug_assert_eq!(self.free_list[index], Some(id));
                self.free_list[index] = next;
                if next.is_none() {
                    self.inner_is_free_bitmap[memory_class] &= !(1u32 << second_index);
                    if self.inner_is_free_bitmap[memory_class] == 0 {
                        self.is_free_bitmap &= !(1u64 << memory_class);
                    }
                }
            }
        }

        let node = &mut self.nodes[id];
        node.free = false;
        node.prev_free = None;
        node.next_free = None;
        node.user_data = 0;

        self.blocks_free_count -= 1;
        self.blocks_free_size -= size;
    }

    /// First bucket at or above `size`: `(list index, head)`, or `(lists_count, None)`
    fn find_free_block(&self, size: DeviceSize) -> (usize, Option<NodeId>) {
        let mut memory_class = size_to_memory_class(size);
        if memory_class >= TLSF_MAX_MEMORY_CLASSES {
            return (self.lists_count, None);
        }
        let second_index = self.size_to_second_index(size, memory_class);
        let mut inner_free_map = self.inner_is_free_bitmap[memory_class]
            & u32::MAX.checked_shl(second_index).unwrap_or(0);

        if inner_free_map == 0 {
            let free_map =
                self.is_free_bitmap & u64::MAX.checked_shl(memory_class as u32 + 1).unwrap_or(0);
            if free_map == 0 {
                return (self.lists_count, None);
            }
            memory_class = free_map.trailing_zeros() as usize;
            inner_free_map = self.inner_is_free_bitmap[memory_class];
        }

        let index = self.list_index(memory_class, inner_free_map.trailing_zeros());
        (index, self.free_list[index])
    }

    /// Test one free node; on success move it to the front of its bucket
    fn check_block(
        &mut self,
        id: NodeId,
        list_index: usize,
        alloc_size: DeviceSize,
        alignment: DeviceSize,
    ) -> Option<AllocationRequest> {
        let (offset, size) = {
            let node = &self.nodes[id];
            debug_assert!(node.free, "block is already taken");
            (node.offset, node.size)
        };

        let aligned_offset = align_up(offset, alignment);
        let needed = alloc_size.checked_add(aligned_offset - offset)?;
        if size < needed {
            return None;
        }

        if list_index != self.lists_count {
            if let Some(prev) = self.nodes[id].prev_free {
                let next = self.nodes[id].next_free;
                self.nodes[prev].next_free = next;
                if let Some(next) = next {
                    self.nodes[next].prev_free = Some(prev);
                }
                let head = self.free_list[list_index];
                self.nodes[id].prev_free = None;
                self.nodes[id].next_free = head;
                self.free_list[list_index] = Some(id);
                if let Some(head) = head {
                    self.nodes[head].prev_free = Some(id);
                }
            }
        }

        Some(AllocationRequest {
            handle: AllocHandle(id as u64),
            offset: aligned_offset,
            size: alloc_size - self.debug_margin,
            kind: RequestKind::FreeNode(id),
        })
    }

    fn check_list(
        &mut self,
        mut cursor: Option<NodeId>,
        list_index: usize,
        alloc_size: DeviceSize,
        alignment: DeviceSize,
    ) -> Option<AllocationRequest> {
        while let Some(id) = cursor {
            if let Some(request) = self.check_block(id, list_index, alloc_size, alignment) {
                return Some(request);
            }
            cursor = self.nodes[id].next_free;
        }
        None
    }

    fn check_null_block(
        &mut self,
        alloc_size: DeviceSize,
        alignment: DeviceSize,
    ) -> Option<AllocationRequest> {
        let null_block = self.null_block;
        let lists_count = self.lists_count;
        self.check_block(null_block, lists_count, alloc_size, alignment)
    }

    fn merge_block(&mut self, id: NodeId, prev: NodeId) {
        debug_assert_eq!(self.nodes[id].prev_physical, Some(prev));
        debug_assert!(!self.nodes[prev].free, "cannot merge a block that is in a free list");

        let (prev_offset, prev_size, prev_prev) = {
            let node = &self.nodes[prev];
            (node.offset, node.size, node.prev_physical)
        };
        let node = &mut self.nodes[id];
        node.offset = prev_offset;
        node.size += prev_size;
        node.prev_physical = prev_prev;
        if let Some(prev_prev) = prev_prev {
            self.nodes[prev_prev].next_physical = Some(id);
        }
        self.release_node(prev);
    }

    /// Nodes in physical order, null block last
    fn physical_chain(&self) -> Vec<NodeId> {
        let mut chain = Vec::with_capacity(self.alloc_count + self.blocks_free_count + 1);
        let mut cursor = Some(self.null_block);
        while let Some(id) = cursor {
            chain.push(id);
            cursor = self.nodes[id].prev_physical;
        }
        chain.reverse();
        chain
    }

    fn taken_node(&self, handle: AllocHandle) -> Option<&Node> {
        let id = handle.0 as usize;
        if id == self.null_block {
            return None;
        }
        self.nodes.get(id).filter(|node| !node.free)
    }
}

impl BlockMetadata for TlsfMetadata {
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
        self.alloc_count
    }

    fn free_regions_count(&self) -> usize {
        self.blocks_free_count + usize::from(self.nodes[self.null_block].size > 0)
    }

    fn sum_free_size(&self) -> DeviceSize {
        self.blocks_free_size + self.nodes[self.null_block].size
    }

    fn is_empty(&self) -> bool {
        self.nodes[self.null_block].offset == 0
    }

    fn create_allocation_request(
        &mut self,
        size: DeviceSize,
        alignment: DeviceSize,
        _upper_address: bool,
        strategy: Strategy,
    ) -> Option<AllocationRequest> {
        let alloc_size = size.checked_add(self.debug_margin)?;
        if alloc_size == 0 || alloc_size > self.sum_free_size() {
            return None;
        }

        if self.blocks_free_count == 0 {
            return self.check_null_block(alloc_size, alignment);
        }

        // Smallest size guaranteed to land in the next bucket up
        let small_size_step = TLSF_SMALL_BUFFER_SIZE
            / if self.is_virtual {
                1 << TLSF_SECOND_LEVEL_INDEX
            } else {
                4
            };
        let size_for_next_list = if alloc_size > TLSF_SMALL_BUFFER_SIZE {
            alloc_size
                .saturating_add(1 << (bit_scan_msb(alloc_size) - TLSF_SECOND_LEVEL_INDEX))
        } else if alloc_size > TLSF_SMALL_BUFFER_SIZE - small_size_step {
            TLSF_SMALL_BUFFER_SIZE + 1
        } else {
            alloc_size + small_size_step
        };

        let (mut next_list_index, next_list_block) = self.find_free_block(size_for_next_list);

        match strategy {
            Strategy::MinTime => {
                if let Some(id) = next_list_block {
                    if let Some(request) =
                        self.check_block(id, next_list_index, alloc_size, alignment)
                    {
                        return Some(request);
                    }
                }
                if let Some(request) = self.check_null_block(alloc_size, alignment) {
                    return Some(request);
                }
                let head = self.free_list.get(next_list_index).copied().flatten();
                if let Some(request) =
                    self.check_list(head, next_list_index, alloc_size, alignment)
                {
                    return Some(request);
                }
                let (prev_list_index, prev_list_block) = self.find_free_block(alloc_size);
                if let Some(request) =
                    self.check_list(prev_list_block, prev_list_index, alloc_size, alignment)
                {
                    return Some(request);
                }
            }
            Strategy::MinMemory => {
                let (prev_list_index, prev_list_block) = self.find_free_block(alloc_size);
                if let Some(request) =
                    self.check_list(prev_list_block, prev_list_index, alloc_size, alignment)
                {
                    return Some(request);
                }
                if let Some(request) = self.check_null_block(alloc_size, alignment) {
                    return Some(request);
                }
                let head = self.free_list.get(next_list_index).copied().flatten();
                if let Some(request) =
                    self.check_list(head, next_list_index, alloc_size, alignment)
                {
                    return Some(request);
                }
            }
            Strategy::MinOffset => {
                let candidates: Vec<NodeId> = self
                    .physical_chain()
                    .into_iter()
                    .filter(|&id| {
                        id != self.null_block
                            && self.nodes[id].free
                            && self.nodes[id].size >= alloc_size
                    })
                    .collect();
                for id in candidates {
                    let list_index = self.list_index_for_size(self.nodes[id].size);
                    if let Some(request) = self.check_block(id, list_index, alloc_size, alignment)
                    {
                        return Some(request);
                    }
                }
                return self.check_null_block(alloc_size, alignment);
            }
        }

        // Worst case: walk every larger bucket
        while next_list_index + 1 < self.lists_count {
            next_list_index += 1;
            let head = self.free_list[next_list_index];
            if let Some(request) = self.check_list(head, next_list_index, alloc_size, alignment) {
                return Some(request);
            }
        }

        None
    }

    fn alloc(&mut self, request: &AllocationRequest, user_data: UserData) {
        let current = match request.kind {
            RequestKind::FreeNode(id) => id,
            other => {
                debug_assert!(false, "linear request {:?} passed to general metadata", other);
                return;
            }
        };
        let offset = request.offset;
        debug_assert!(self.nodes[current].offset <= offset);

        if current != self.null_block {
            self.remove_free_block(current);
        }

        // Alignment padding goes to the previous free range or becomes one
        let missing_alignment = offset - self.nodes[current].offset;
        if missing_alignment > 0 {
            let prev = self.nodes[current].prev_physical;
            debug_assert!(prev.is_some(), "no missing alignment at offset 0");

            match prev {
                Some(prev) if self.nodes[prev].free => {
                    let old_list = self.list_index_for_size(self.nodes[prev].size);
                    let grown = self.nodes[prev].size + missing_alignment;
                    if old_list != self.list_index_for_size(grown) {
                        self.remove_free_block(prev);
                        self.nodes[prev].size = grown;
                        self.insert_free_block(prev);
                    } else {
                        self.nodes[prev].size = grown;
                        self.blocks_free_size += missing_alignment;
                    }
                }
                _ => {
                    let padding = self.alloc_node(Node {
                        offset: self.nodes[current].offset,
                        size: missing_alignment,
                        prev_physical: prev,
                        next_physical: Some(current),
                        free: false,
                        prev_free: None,
                        next_free: None,
                        user_data: 0,
                    });
                    self.nodes[current].prev_physical = Some(padding);
                    if let Some(prev) = prev {
                        self.nodes[prev].next_physical = Some(padding);
                    }
                    self.insert_free_block(padding);
                }
            }

            let node = &mut self.nodes[current];
            node.size -= missing_alignment;
            node.offset += missing_alignment;
        }

        let size = request.size + self.debug_margin;
        let current_size = self.nodes[current].size;
        if current_size == size {
            if current == self.null_block {
                let tail_offset = self.nodes[current].offset + size;
                let new_null = self.alloc_node(Node::null_block(tail_offset, 0, Some(current)));
                self.null_block = new_null;
                self.nodes[current].next_physical = Some(new_null);
                self.nodes[current].free = false;
            }
        } else {
            debug_assert!(current_size > size, "chosen block is smaller than the request");

            let remainder = self.alloc_node(Node {
                offset: self.nodes[current].offset + size,
                size: current_size - size,
                prev_physical: Some(current),
                next_physical: self.nodes[current].next_physical,
                free: false,
                prev_free: None,
                next_free: None,
                user_data: 0,
            });
            self.nodes[current].next_physical = Some(remainder);
            self.nodes[current].size = size;

            if current == self.null_block {
                self.null_block = remainder;
                self.nodes[remainder].free = true;
                self.nodes[current].free = false;
            } else {
                if let Some(next) = self.nodes[remainder].next_physical {
                    self.nodes[next].prev_physical = Some(remainder);
                }
                self.insert_free_block(remainder);
            }
        }

        self.nodes[current].user_data = user_data;
        self.alloc_count += 1;
    }

    fn free(&mut self, handle: AllocHandle) {
        let mut id = handle.0 as usize;
        if self.taken_node(handle).is_none() {
            debug_assert!(false, "freeing a range that is not allocated: {:?}", handle);
            return;
        }

        self.alloc_count -= 1;
        self.nodes[id].user_data = 0;

        if let Some(prev) = self.nodes[id].prev_physical {
            if self.nodes[prev].free {
                self.remove_free_block(prev);
                self.merge_block(id, prev);
            }
        }

        let next = self.next_of(id);
        if !self.nodes[next].free {
            self.insert_free_block(id);
        } else if next == self.null_block {
            self.merge_block(next, id);
        } else {
            self.remove_free_block(next);
            self.merge_block(next, id);
            id = next;
            self.insert_free_block(id);
        }
    }

    fn allocation_info(&self, handle: AllocHandle) -> Option<SubAllocation> {
        self.taken_node(handle).map(|node| SubAllocation {
            handle,
            offset: node.offset,
            size: node.size - self.debug_margin,
            user_data: node.user_data,
        })
    }

    fn set_user_data(&mut self, handle: AllocHandle, user_data: UserData) {
        if self.taken_node(handle).is_some() {
            self.nodes[handle.0 as usize].user_data = user_data;
        }
    }

    fn allocations(&self) -> Vec<SubAllocation> {
        self.physical_chain()
            .into_iter()
            .filter(|&id| !self.nodes[id].free)
            .map(|id| {
                let node = &self.nodes[id];
                SubAllocation {
                    handle: AllocHandle(id as u64),
                    offset: node.offset,
                    size: node.size - self.debug_margin,
                    user_data: node.user_data,
                }
            })
            .collect()
    }

    fn next_free_region_size(&self, handle: AllocHandle) -> DeviceSize {
        match self.taken_node(handle) {
            Some(_) => {
                let next = self.next_of(handle.0 as usize);
                if self.nodes[next].free {
                    self.nodes[next].size
                } else {
                    0
                }
            }
            None => 0,
        }
    }

    fn clear(&mut self) {
        self.nodes.clear();
        self.vacant.clear();
        self.nodes.push(Node::null_block(0, self.size, None));
        self.null_block = 0;
        self.alloc_count = 0;
        self.blocks_free_count = 0;
        self.blocks_free_size = 0;
        self.is_free_bitmap = 0;
        self.inner_is_free_bitmap = [0; TLSF_MAX_MEMORY_CLASSES];
        self.free_list.iter_mut().for_each(|head| *head = None);
    }

    fn add_statistics(&self, stats: &mut Statistics) {
        stats.block_count += 1;
        stats.allocation_count += self.alloc_count;
        stats.block_bytes += self.size;
        stats.allocation_bytes += self.size
            - self.sum_free_size()
            - self.alloc_count as DeviceSize * self.debug_margin;
    }

    fn add_detailed_statistics(&self, stats: &mut DetailedStatistics) {
        stats.stats.block_count += 1;
        stats.stats.block_bytes += self.size;
        for id in self.physical_chain() {
            let node = &self.nodes[id];
            if node.free {
                if node.size > 0 {
                    stats.add_unused_range(node.size);
                }
            } else {
                stats.add_allocation(node.size - self.debug_margin);
            }
        }
    }

    fn debug_dump(&self) -> Vec<RangeDump> {
        self.physical_chain()
            .into_iter()
            .filter(|&id| self.nodes[id].size > 0)
            .map(|id| {
                let node = &self.nodes[id];
                RangeDump {
                    offset: node.offset,
                    size: node.size,
                    free: node.free,
                    user_data: (!node.free).then_some(node.user_data),
                }
            })
            .collect()
    }

    fn validate(&self) -> bool {
        let null = &self.nodes[self.null_block];
        if null.next_physical.is_some() || !null.free || null.offset + null.size != self.size {
            return false;
        }

        let mut expected_offset = 0;
        let mut alloc_count = 0;
        let mut free_count = 0;
        let mut free_size = 0;
        let mut prev: Option<NodeId> = None;
        for id in self.physical_chain() {
            let node = &self.nodes[id];
            if node.offset != expected_offset || node.prev_physical != prev {
                return false;
            }
            if let Some(prev) = prev {
                if self.nodes[prev].next_physical != Some(id) {
                    return false;
                }
            }
            if id != self.null_block {
                if node.free {
                    free_count += 1;
                    free_size += node.size;
                    if node.size == 0 {
                        return false;
                    }
                } else {
                    alloc_count += 1;
                    if node.size < self.debug_margin {
                        return false;
                    }
                }
            }
            expected_offset += node.size;
            prev = Some(id);
        }

        let mut listed = 0;
        for (index, head) in self.free_list.iter().enumerate() {
            let mut cursor = *head;
            let mut prev_free = None;
            while let Some(id) = cursor {
                let node = &self.nodes[id];
                if !node.free
                    || node.prev_free != prev_free
                    || self.list_index_for_size(node.size) != index
                {
                    return false;
                }
                listed += 1;
                prev_free = Some(id);
                cursor = node.next_free;
            }
        }

        expected_offset == self.size
            && alloc_count == self.alloc_count
            && free_count == self.blocks_free_count
            && listed == self.blocks_free_count
            && free_size == self.blocks_free_size
            && self.memory_classes >= 2
    }
}
