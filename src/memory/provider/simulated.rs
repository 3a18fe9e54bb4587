/*!
 * Simulated Region Provider
 * Host-memory stand-in for a device allocator, with capacity limits,
 * failure injection and lazily materialized byte storage
 */

use super::{Region, RegionHandle, RegionProvider, SegmentBudget};
use crate::core::errors::ProviderError;
use crate::core::types::{checked_align_up, DeviceSize};
use crate::memory::types::{MemorySegment, PlacementCategory};
use ahash::RandomState;
use dashmap::DashMap;
use log::{debug, info, warn};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

#[derive(Debug, Clone, Copy)]
struct SimulatedRegion {
    size: DeviceSize,
    segment: MemorySegment,
}

/// Provider backed by host memory
///
/// Region bytes are only allocated when first written, so large simulated
/// heaps cost nothing until used.
pub struct SimulatedProvider {
    capacity: DeviceSize,
    granularity: DeviceSize,
    zeroed: bool,
    uma: bool,
    budgets: [Option<DeviceSize>; MemorySegment::COUNT],

    next_handle: AtomicU64,
    used: AtomicU64,
    segment_usage: [AtomicU64; MemorySegment::COUNT],
    fail_next: AtomicU32,
    created: AtomicU64,
    destroyed: AtomicU64,

    regions: DashMap<RegionHandle, SimulatedRegion, RandomState>,
    storage: DashMap<RegionHandle, Vec<u8>, RandomState>,
}

impl SimulatedProvider {
    /// Provider with a hard capacity across all regions
    pub fn new(capacity: DeviceSize) -> Self {
        info!("Simulated region provider initialized with {} bytes", capacity);
        Self {
            capacity,
            granularity: 1,
            zeroed: true,
            uma: false,
            budgets: [None; MemorySegment::COUNT],
            next_handle: AtomicU64::new(1),
            used: AtomicU64::new(0),
            segment_usage: [AtomicU64::new(0), AtomicU64::new(0)],
            fail_next: AtomicU32::new(0),
            created: AtomicU64::new(0),
            destroyed: AtomicU64::new(0),
            regions: DashMap::with_hasher(RandomState::new()),
            storage: DashMap::with_hasher(RandomState::new()),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(DeviceSize::MAX)
    }

    /// Round every region up to a multiple of `granularity`
    pub fn with_granularity(mut self, granularity: DeviceSize) -> Self {
        self.granularity = granularity.max(1);
        self
    }

    /// Report regions as not pre-zeroed
    pub fn with_dirty_regions(mut self) -> Self {
        self.zeroed = false;
        self
    }

    pub fn with_uma(mut self, uma: bool) -> Self {
        self.uma = uma;
        self
    }

    /// Report a budget for `segment` through [`RegionProvider::segment_budget`]
    pub fn with_segment_budget(mut self, segment: MemorySegment, bytes: DeviceSize) -> Self {
        self.budgets[segment.index()] = Some(bytes);
        self
    }

    /// Make the next `count` region creations fail with out-of-memory
    pub fn fail_next_creates(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    pub fn used_bytes(&self) -> DeviceSize {
        self.used.load(Ordering::SeqCst)
    }

    pub fn live_regions(&self) -> usize {
        self.regions.len()
    }

    pub fn created_count(&self) -> u64 {
        self.created.load(Ordering::SeqCst)
    }

    pub fn destroyed_count(&self) -> u64 {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn region_size(&self, handle: RegionHandle) -> Option<DeviceSize> {
        self.regions.get(&handle).map(|region| region.size)
    }

    /// Write bytes into a region
    pub fn write_bytes(
        &self,
        handle: RegionHandle,
        offset: DeviceSize,
        data: &[u8],
    ) -> Result<(), ProviderError> {
        let size = self.checked_range(handle, offset, data.len() as DeviceSize)?;
        let mut entry = self
            .storage
            .entry(handle)
            .or_insert_with(|| vec![0u8; size as usize]);
        let start = offset as usize;
        entry[start..start + data.len()].copy_from_slice(data);
        debug!(
            "Wrote {} bytes to region {} at offset {}",
            data.len(),
            handle.0,
            offset
        );
        Ok(())
    }

    /// Read bytes from a region; never-written bytes read as zero
    pub fn read_bytes(
        &self,
        handle: RegionHandle,
        offset: DeviceSize,
        size: DeviceSize,
    ) -> Result<Vec<u8>, ProviderError> {
        self.checked_range(handle, offset, size)?;
        let start = offset as usize;
        let end = start + size as usize;
        Ok(match self.storage.get(&handle) {
            Some(bytes) => bytes[start..end].to_vec(),
            None => vec![0u8; size as usize],
        })
    }

    /// Validate `[offset, offset + len)` against the region and return its size
    fn checked_range(
        &self,
        handle: RegionHandle,
        offset: DeviceSize,
        len: DeviceSize,
    ) -> Result<DeviceSize, ProviderError> {
        let region = self.regions.get(&handle).ok_or_else(|| {
            ProviderError::Rejected(format!("unknown region {}", handle.0).into())
        })?;
        match offset.checked_add(len) {
            Some(end) if end <= region.size => Ok(region.size),
            _ => Err(ProviderError::Rejected(
                format!(
                    "range {}+{} outside region {} of {} bytes",
                    offset, len, handle.0, region.size
                )
                .into(),
            )),
        }
    }

    fn create(
        &self,
        size_hint: DeviceSize,
        category: PlacementCategory,
    ) -> Result<Region, ProviderError> {
        if size_hint == 0 {
            return Err(ProviderError::Rejected("zero-sized region".into()));
        }

        if self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            warn!("Injected region creation failure ({} bytes)", size_hint);
            return Err(ProviderError::OutOfMemory {
                requested: size_hint,
                available: 0,
            });
        }

        let size = match checked_align_up(size_hint, self.granularity) {
            Some(size) => size,
            None => {
                warn!("Region size {} overflows when rounded up", size_hint);
                return Err(ProviderError::OutOfMemory {
                    requested: size_hint,
                    available: self.capacity.saturating_sub(self.used.load(Ordering::SeqCst)),
                });
            }
        };
        let reserved = self
            .used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                used.checked_add(size).filter(|&total| total <= self.capacity)
            });
        if let Err(used) = reserved {
            warn!(
                "Simulated provider out of memory: requested {} bytes, {} of {} used",
                size, used, self.capacity
            );
            return Err(ProviderError::OutOfMemory {
                requested: size,
                available: self.capacity.saturating_sub(used),
            });
        }

        let segment = category.segment(self.uma);
        self.segment_usage[segment.index()].fetch_add(size, Ordering::SeqCst);
        self.created.fetch_add(1, Ordering::SeqCst);

        let handle = RegionHandle(self.next_handle.fetch_add(1, Ordering::SeqCst));
        self.regions.insert(handle, SimulatedRegion { size, segment });
        info!(
            "Created region {} of {} bytes for {:?}",
            handle.0, size, category
        );

        Ok(Region {
            handle,
            size,
            zeroed: self.zeroed,
        })
    }
}

impl RegionProvider for SimulatedProvider {
    fn create_region(
        &self,
        size_hint: DeviceSize,
        category: PlacementCategory,
    ) -> Result<Region, ProviderError> {
        self.create(size_hint, category)
    }

    fn destroy_region(&self, handle: RegionHandle) {
        match self.regions.remove(&handle) {
            Some((_, region)) => {
                self.storage.remove(&handle);
                self.used.fetch_sub(region.size, Ordering::SeqCst);
                self.segment_usage[region.segment.index()].fetch_sub(region.size, Ordering::SeqCst);
                self.destroyed.fetch_add(1, Ordering::SeqCst);
                info!("Destroyed region {} ({} bytes)", handle.0, region.size);
            }
            None => warn!("Destroy of unknown region {}", handle.0),
        }
    }

    fn copy_bytes(
        &self,
        dst: RegionHandle,
        dst_offset: DeviceSize,
        src: RegionHandle,
        src_offset: DeviceSize,
        size: DeviceSize,
    ) -> Result<(), ProviderError> {
        let bytes = self.read_bytes(src, src_offset, size)?;
        self.write_bytes(dst, dst_offset, &bytes)
    }

    fn segment_budget(&self, segment: MemorySegment) -> Option<SegmentBudget> {
        self.budgets[segment.index()].map(|budget_bytes| SegmentBudget {
            usage_bytes: self.segment_usage[segment.index()].load(Ordering::SeqCst),
            budget_bytes,
        })
    }

    fn is_uma(&self) -> bool {
        self.uma
    }
}

impl Default for SimulatedProvider {
    fn default() -> Self {
        Self::unlimited()
    }
}
