/*!
 * Block Metadata
 *
 * Free-space tracking for one block. Two algorithms share the
 * [`BlockMetadata`] trait and are selected once through [`Metadata`]:
 *
 * - [`TlsfMetadata`]: two-level segregated free lists with coalescing
 * - [`LinearMetadata`]: stack, double stack and ring buffer
 */

mod linear;
mod tlsf;

pub use linear::LinearMetadata;
pub use tlsf::TlsfMetadata;

use super::stats::{DetailedStatistics, Statistics};
use super::traits::BlockMetadata;
use super::types::{Algorithm, Strategy};
use crate::core::types::{DeviceSize, UserData};
use serde::Serialize;

/// Algorithm-specific reference to a live allocation inside one block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct AllocHandle(pub(crate) u64);

impl AllocHandle {
    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Where a request would be placed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// Carve from a free node of the general algorithm
    FreeNode(usize),
    EndOf1st,
    EndOf2nd,
    UpperAddress,
}

/// Placement found by [`BlockMetadata::create_allocation_request`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationRequest {
    pub handle: AllocHandle,
    /// Final aligned offset of the allocation
    pub offset: DeviceSize,
    /// Requested size, without debug margin
    pub size: DeviceSize,
    pub kind: RequestKind,
}

/// A live allocation as seen by the metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SubAllocation {
    pub handle: AllocHandle,
    pub offset: DeviceSize,
    pub size: DeviceSize,
    pub user_data: UserData,
}

impl SubAllocation {
    #[inline]
    pub fn end(&self) -> DeviceSize {
        self.offset + self.size
    }
}

/// One range of a debug dump
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RangeDump {
    pub offset: DeviceSize,
    pub size: DeviceSize,
    pub free: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_data: Option<UserData>,
}

/// Metadata of one block, dispatching to the selected algorithm
#[derive(Debug, Clone)]
pub enum Metadata {
    General(TlsfMetadata),
    Linear(LinearMetadata),
}

impl Metadata {
    pub fn new(
        algorithm: Algorithm,
        size: DeviceSize,
        debug_margin: DeviceSize,
        is_virtual: bool,
    ) -> Self {
        match algorithm {
            Algorithm::General => {
                Metadata::General(TlsfMetadata::new(size, debug_margin, is_virtual))
            }
            Algorithm::Linear => {
                Metadata::Linear(LinearMetadata::new(size, debug_margin, is_virtual))
            }
        }
    }

    pub fn algorithm(&self) -> Algorithm {
        match self {
            Metadata::General(_) => Algorithm::General,
            Metadata::Linear(_) => Algorithm::Linear,
        }
    }
}

macro_rules! dispatch {
    ($self:ident, $inner:ident => $body:expr) => {
        match $self {
            Metadata::General($inner) => $body,
            Metadata::Linear($inner) => $body,
        }
    };
}

impl BlockMetadata for Metadata {
    fn size(&self) -> DeviceSize {
        dispatch!(self, m => m.size())
    }

    fn is_virtual(&self) -> bool {
        dispatch!(self, m => m.is_virtual())
    }

    fn debug_margin(&self) -> DeviceSize {
        dispatch!(self, m => m.debug_margin())
    }

    fn allocation_count(&self) -> usize {
        dispatch!(self, m => m.allocation_count())
    }

    fn free_regions_count(&self) -> usize {
        dispatch!(self, m => m.free_regions_count())
    }

    fn sum_free_size(&self) -> DeviceSize {
        dispatch!(self, m => m.sum_free_size())
    }

    fn is_empty(&self) -> bool {
        dispatch!(self, m => m.is_empty())
    }

    fn create_allocation_request(
        &mut self,
        size: DeviceSize,
        alignment: DeviceSize,
        upper_address: bool,
        strategy: Strategy,
    ) -> Option<AllocationRequest> {
        dispatch!(self, m => m.create_allocation_request(size, alignment, upper_address, strategy))
    }

    fn alloc(&mut self, request: &AllocationRequest, user_data: UserData) {
        dispatch!(self, m => m.alloc(request, user_data))
    }

    fn free(&mut self, handle: AllocHandle) {
        dispatch!(self, m => m.free(handle))
    }

    fn allocation_info(&self, handle: AllocHandle) -> Option<SubAllocation> {
        dispatch!(self, m => m.allocation_info(handle))
    }

    fn set_user_data(&mut self, handle: AllocHandle, user_data: UserData) {
        dispatch!(self, m => m.set_user_data(handle, user_data))
    }

    fn allocations(&self) -> Vec<SubAllocation> {
        dispatch!(self, m => m.allocations())
    }

    fn next_free_region_size(&self, handle: AllocHandle) -> DeviceSize {
        dispatch!(self, m => m.next_free_region_size(handle))
    }

    fn clear(&mut self) {
        dispatch!(self, m => m.clear())
    }

    fn add_statistics(&self, stats: &mut Statistics) {
        dispatch!(self, m => m.add_statistics(stats))
    }

    fn add_detailed_statistics(&self, stats: &mut DetailedStatistics) {
        dispatch!(self, m => m.add_detailed_statistics(stats))
    }

    fn debug_dump(&self) -> Vec<RangeDump> {
        dispatch!(self, m => m.debug_dump())
    }

    fn validate(&self) -> bool {
        dispatch!(self, m => m.validate())
    }
}
