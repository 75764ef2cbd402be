#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(coverage_nightly, coverage(off))]
#![cfg(test)]

use std::ops::Range;

use tagalloc::{Allocator, BlockRef, MemLib, layout::DSIZE};

fn new_allocator() -> Allocator<MemLib> {
    Allocator::init(MemLib::new()).unwrap()
}

fn assert_consistent(allocator: &Allocator<MemLib>) {
    let violations = allocator.violations();
    assert!(violations.is_empty(), "heap is inconsistent: {violations:?}");
}

fn block_size(allocator: &Allocator<MemLib>, block: BlockRef) -> usize {
    allocator
        .blocks()
        .find(|info| info.offset == block.offset())
        .unwrap()
        .size()
}

/// Small deterministic generator so the workload is reproducible.
struct XorShift(u64);

impl XorShift {
    fn next(&mut self) -> u64 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        self.0
    }

    fn below(&mut self, bound: usize) -> usize {
        usize::try_from(self.next() % u64::try_from(bound).unwrap()).unwrap()
    }
}

#[test]
fn freed_block_is_reused_before_growing() {
    let mut allocator = new_allocator();
    let p1 = allocator.allocate(100).unwrap();
    let p2 = allocator.allocate(200).unwrap();
    allocator.deallocate(Some(p1));
    let heap_size = allocator.source().heap_size();

    let p3 = allocator.allocate(90).unwrap();
    assert_eq!(p3, p1);
    assert_eq!(allocator.source().heap_size(), heap_size);

    allocator.deallocate(Some(p2));
    allocator.deallocate(Some(p3));
    assert_consistent(&allocator);
}

#[test]
fn large_request_grows_heap() {
    let mut allocator = new_allocator();
    let small = allocator.allocate(16);
    allocator.deallocate(small);
    let heap_size = allocator.source().heap_size();

    let big = allocator.allocate(4096).unwrap();
    assert!(allocator.source().heap_size() > heap_size);
    assert!(allocator.usable_size(big) >= 4096);
    assert_consistent(&allocator);
}

#[test]
fn adjacent_frees_merge_into_one_block() {
    let mut allocator = new_allocator();
    let a = allocator.allocate(72).unwrap();
    let b = allocator.allocate(300).unwrap();
    let _guard = allocator.allocate(8).unwrap();
    let expected = block_size(&allocator, a) + block_size(&allocator, b);

    allocator.deallocate(Some(a));
    allocator.deallocate(Some(b));

    assert_eq!(block_size(&allocator, a), expected);
    let stats = allocator.stats();
    // the merged block and the untouched tail of the first chunk
    assert_eq!(stats.free_blocks, 2);
    assert_consistent(&allocator);
}

#[test]
fn reallocate_to_zero_frees() {
    let mut allocator = new_allocator();
    let block = allocator.allocate(128);
    let before = allocator.stats();

    assert_eq!(allocator.reallocate(block, 0), None);
    let after = allocator.stats();
    assert_eq!(after.allocated_blocks, before.allocated_blocks - 1);
    assert_eq!(after.free_blocks, 1);
    assert_consistent(&allocator);
}

#[test]
fn copying_reallocation_preserves_contents() {
    let mut allocator = new_allocator();
    let block = allocator.allocate(200).unwrap();
    let _guard = allocator.allocate(1).unwrap();
    for (i, b) in allocator.payload_mut(block)[..200].iter_mut().enumerate() {
        *b = u8::try_from(i % 251).unwrap();
    }

    let moved = allocator.reallocate(Some(block), 5000).unwrap();
    assert_ne!(moved, block);
    for (i, &b) in allocator.payload(moved)[..200].iter().enumerate() {
        assert_eq!(b, u8::try_from(i % 251).unwrap());
    }

    // shrinking keeps the block where it is
    let same = allocator.reallocate(Some(moved), 10).unwrap();
    assert_eq!(same, moved);
    assert_consistent(&allocator);
}

#[test]
fn exhausted_heap_returns_none() {
    let mut allocator = Allocator::init(MemLib::with_capacity(64 * 1024)).unwrap();
    let mut blocks = Vec::new();
    while let Some(block) = allocator.allocate(1000) {
        blocks.push(block);
    }
    assert!(!blocks.is_empty());
    assert_consistent(&allocator);

    for block in blocks {
        allocator.deallocate(Some(block));
    }
    assert_eq!(allocator.stats().free_blocks, 1);
    assert_consistent(&allocator);
    assert!(allocator.allocate(1000).is_some());
}

#[test]
fn random_workload_keeps_invariants() {
    let mut allocator = new_allocator();
    let mut rng = XorShift(0x2545_f491_4f6c_dd1d);
    // live blocks with the byte pattern written into them
    let mut live: Vec<(BlockRef, usize, u8)> = Vec::new();

    for step in 0..2000 {
        match rng.below(10) {
            0..=4 => {
                let size = 1 + rng.below(2048);
                let block = allocator.allocate(size).unwrap();
                assert!(block.offset().is_multiple_of(DSIZE));
                let pattern = u8::try_from(step % 256).unwrap();
                allocator.payload_mut(block)[..size].fill(pattern);
                live.push((block, size, pattern));
            }
            5..=7 if !live.is_empty() => {
                let (block, size, pattern) = live.swap_remove(rng.below(live.len()));
                assert!(allocator.payload(block)[..size].iter().all(|&b| b == pattern));
                allocator.deallocate(Some(block));
            }
            8..=9 if !live.is_empty() => {
                let index = rng.below(live.len());
                let (block, size, pattern) = live[index];
                let new_size = 1 + rng.below(4096);
                let block = allocator.reallocate(Some(block), new_size).unwrap();
                let kept = size.min(new_size);
                assert!(allocator.payload(block)[..kept].iter().all(|&b| b == pattern));
                allocator.payload_mut(block)[..new_size].fill(pattern);
                live[index] = (block, new_size, pattern);
            }
            _ => {}
        }

        if step % 100 == 0 {
            assert_consistent(&allocator);
        }
    }

    // live payloads never overlap
    let mut ranges = live
        .iter()
        .map(|&(block, size, _)| block.offset()..block.offset() + size)
        .collect::<Vec<Range<usize>>>();
    ranges.sort_by_key(|range| range.start);
    for pair in ranges.windows(2) {
        assert!(pair[0].end <= pair[1].start);
    }

    // freeing everything leaves one coalesced free block
    for (block, _, _) in live {
        allocator.deallocate(Some(block));
    }
    assert_consistent(&allocator);
    let stats = allocator.stats();
    assert_eq!(stats.free_blocks, 1);
    assert_eq!(stats.allocated_blocks, 0);
}
