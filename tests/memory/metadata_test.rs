/*!
 * Block Metadata Tests
 * General (TLSF) and linear free-space tracking through the shared trait
 */

use super::common::{assert_sorted_disjoint, KB};
use pretty_assertions::assert_eq;
use region_suballoc::memory::metadata::{LinearMetadata, Metadata, TlsfMetadata};
use region_suballoc::memory::traits::BlockMetadata;
use region_suballoc::{Algorithm, Strategy};

fn conserved(metadata: &impl BlockMetadata) -> bool {
    let live: u64 = metadata.allocations().iter().map(|a| a.size).sum();
    let margins = metadata.allocation_count() as u64 * metadata.debug_margin();
    live + margins + metadata.sum_free_size() == metadata.size()
}

#[test]
fn test_general_fills_block_exactly() {
    let mut metadata = TlsfMetadata::new(64 * KB, 0, false);
    for i in 0..16u64 {
        let request = metadata
            .allocate(4 * KB, 1, false, Strategy::MinMemory, i)
            .expect("block should have room");
        assert_eq!(request.offset, i * 4 * KB);
    }
    assert_eq!(metadata.sum_free_size(), 0);
    assert!(metadata
        .create_allocation_request(1, 1, false, Strategy::MinMemory)
        .is_none());
    assert!(metadata.validate());
}

#[test]
fn test_general_free_coalesces_into_one_range() {
    let mut metadata = TlsfMetadata::new(1024 * KB, 0, false);
    let handles: Vec<_> = (0..8)
        .map(|i| {
            metadata
                .allocate(100 * KB, 1, false, Strategy::MinMemory, i)
                .unwrap()
                .handle
        })
        .collect();

    // Odd ones first, then even: every free must merge with its neighbours
    for handle in handles.iter().skip(1).step_by(2) {
        metadata.free(*handle);
        assert!(conserved(&metadata));
    }
    for handle in handles.iter().step_by(2) {
        metadata.free(*handle);
        assert!(conserved(&metadata));
    }

    assert!(metadata.is_empty());
    assert_eq!(metadata.free_regions_count(), 1);
    let whole = metadata
        .allocate(1024 * KB, 1, false, Strategy::MinMemory, 0)
        .expect("full-block allocation after round trip");
    assert_eq!(whole.offset, 0);
}

#[test]
fn test_general_alignment_is_honoured() {
    let mut metadata = TlsfMetadata::new(1024 * KB, 0, false);
    metadata
        .allocate(3, 1, false, Strategy::MinMemory, 0)
        .unwrap();
    for alignment in [16, 256, 4 * KB, 64 * KB] {
        let request = metadata
            .allocate(100, alignment, false, Strategy::MinMemory, 0)
            .unwrap();
        assert_eq!(request.offset % alignment, 0, "alignment {}", alignment);
    }
    assert_sorted_disjoint(&metadata.allocations());
    assert!(conserved(&metadata));
    assert!(metadata.validate());
}

#[test]
fn test_strategies_agree_on_fit() {
    for strategy in [Strategy::MinMemory, Strategy::MinTime, Strategy::MinOffset] {
        let mut metadata = TlsfMetadata::new(256 * KB, 0, false);
        let a = metadata.allocate(64 * KB, 1, false, strategy, 1).unwrap();
        metadata.allocate(64 * KB, 1, false, strategy, 2).unwrap();
        metadata.free(a.handle);

        let b = metadata
            .allocate(32 * KB, 1, false, strategy, 3)
            .expect("a fitting range exists");
        assert!(b.offset == 0 || b.offset >= 128 * KB, "{:?}", strategy);
        assert!(metadata.validate(), "{:?}", strategy);
    }
}

#[test]
fn test_user_data_and_info() {
    let mut metadata = Metadata::new(Algorithm::General, 64 * KB, 0, false);
    let request = metadata
        .allocate(1000, 8, false, Strategy::MinMemory, 7)
        .unwrap();
    let info = metadata.allocation_info(request.handle).unwrap();
    assert_eq!(info.size, 1000);
    assert_eq!(info.user_data, 7);

    metadata.set_user_data(request.handle, 9);
    assert_eq!(metadata.allocation_info(request.handle).unwrap().user_data, 9);

    metadata.free(request.handle);
    assert!(metadata.allocation_info(request.handle).is_none());
}

#[test]
fn test_margin_is_reserved_after_each_allocation() {
    for algorithm in [Algorithm::General, Algorithm::Linear] {
        let mut metadata = Metadata::new(algorithm, 64 * KB, 256, false);
        let first = metadata
            .allocate(1000, 1, false, Strategy::MinMemory, 0)
            .unwrap();
        let second = metadata
            .allocate(1000, 1, false, Strategy::MinMemory, 0)
            .unwrap();
        assert!(second.offset >= first.offset + 1000 + 256, "{:?}", algorithm);
        assert!(conserved(&metadata), "{:?}", algorithm);
    }
}

#[test]
fn test_detailed_statistics_walk() {
    let mut metadata = Metadata::new(Algorithm::General, 100 * KB, 0, false);
    let a = metadata
        .allocate(10 * KB, 1, false, Strategy::MinMemory, 0)
        .unwrap();
    metadata
        .allocate(20 * KB, 1, false, Strategy::MinMemory, 0)
        .unwrap();
    metadata.free(a.handle);

    let mut stats = region_suballoc::DetailedStatistics::default();
    metadata.add_detailed_statistics(&mut stats);
    assert_eq!(stats.stats.block_count, 1);
    assert_eq!(stats.stats.allocation_count, 1);
    assert_eq!(stats.stats.allocation_bytes, 20 * KB);
    assert_eq!(stats.unused_range_count, 2);
    assert_eq!(stats.unused_range_size_min, 10 * KB);
    assert_eq!(stats.unused_range_size_max, 70 * KB);
}

#[test]
fn test_linear_stack_and_clear() {
    let mut metadata = LinearMetadata::new(16 * KB, 0, false);
    let mut offsets = Vec::new();
    for _ in 0..4 {
        offsets.push(
            metadata
                .allocate(4 * KB, 1, false, Strategy::MinMemory, 0)
                .unwrap()
                .offset,
        );
    }
    assert_eq!(offsets, vec![0, 4 * KB, 8 * KB, 12 * KB]);
    assert!(metadata
        .create_allocation_request(1, 1, false, Strategy::MinMemory)
        .is_none());

    metadata.clear();
    assert!(metadata.is_empty());
    assert_eq!(metadata.sum_free_size(), 16 * KB);
    assert!(metadata.validate());
}

#[test]
fn test_linear_double_stack() {
    let mut metadata = LinearMetadata::new(16 * KB, 0, false);
    let low = metadata
        .allocate(6 * KB, 1, false, Strategy::MinMemory, 0)
        .unwrap();
    let high = metadata
        .allocate(6 * KB, 1, true, Strategy::MinMemory, 0)
        .unwrap();
    assert_eq!(low.offset, 0);
    assert_eq!(high.offset, 10 * KB);

    // 4KB left in the middle
    assert!(metadata
        .create_allocation_request(5 * KB, 1, true, Strategy::MinMemory)
        .is_none());
    assert!(metadata
        .create_allocation_request(5 * KB, 1, false, Strategy::MinMemory)
        .is_none());
    let middle = metadata
        .allocate(4 * KB, 1, true, Strategy::MinMemory, 0)
        .unwrap();
    assert_eq!(middle.offset, 6 * KB);
    assert_sorted_disjoint(&metadata.allocations());
    assert!(metadata.validate());
}
