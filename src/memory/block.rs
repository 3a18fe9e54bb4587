/*!
 * Memory Block
 * One backing region plus the metadata tracking its free space
 */

use super::metadata::{AllocHandle, AllocationRequest, Metadata};
use super::provider::{Region, RegionHandle};
use super::traits::BlockMetadata;
use super::types::{Algorithm, Strategy};
use crate::core::types::{BlockId, DeviceSize, UserData};

#[derive(Debug)]
pub struct MemoryBlock {
    id: BlockId,
    region: Region,
    metadata: Metadata,
    /// Highest byte ever handed out; everything above is still pristine
    high_water: DeviceSize,
}

impl MemoryBlock {
    pub fn new(id: BlockId, region: Region, algorithm: Algorithm, debug_margin: DeviceSize) -> Self {
        Self {
            id,
            region,
            metadata: Metadata::new(algorithm, region.size, debug_margin, false),
            high_water: 0,
        }
    }

    #[inline]
    pub fn id(&self) -> BlockId {
        self.id
    }

    #[inline]
    pub fn region(&self) -> Region {
        self.region
    }

    #[inline]
    pub fn handle(&self) -> RegionHandle {
        self.region.handle
    }

    #[inline]
    pub fn size(&self) -> DeviceSize {
        self.region.size
    }

    #[inline]
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    #[inline]
    pub fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.metadata.is_empty()
    }

    /// Find and commit a placement, returning it with its zero-initialized flag
    pub fn allocate(
        &mut self,
        size: DeviceSize,
        alignment: DeviceSize,
        upper_address: bool,
        strategy: Strategy,
        user_data: UserData,
    ) -> Option<(AllocationRequest, bool)> {
        let request =
            self.metadata
                .create_allocation_request(size, alignment, upper_address, strategy)?;
        let zeroed = self.commit(&request, user_data);
        Some((request, zeroed))
    }

    /// Commit a request found on this block
    pub fn commit(&mut self, request: &AllocationRequest, user_data: UserData) -> bool {
        self.metadata.alloc(request, user_data);
        let zeroed = self.region.zeroed && request.offset >= self.high_water;
        let end = request.offset + request.size + self.metadata.debug_margin();
        self.high_water = self.high_water.max(end);
        zeroed
    }

    pub fn free(&mut self, handle: AllocHandle) {
        self.metadata.free(handle);
    }
}
