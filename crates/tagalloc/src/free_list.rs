//! Explicit free list.
//!
//! Free blocks are chained into one doubly-linked list whose links are stored
//! in the first two payload words of each free block. The links are arena
//! offsets of other free blocks' payloads; offset `0` never names a block (it
//! is the arena's alignment padding) and stands for "no link".
//!
//! Insertion pushes at the head (LIFO order) and removal unlinks a block using
//! its own links, so both are O(1) no matter where the block sits in the list.

use crate::layout::{self, MIN_BLOCK_SIZE, WSIZE};

const NO_LINK: usize = 0;

const fn decode(link: usize) -> Option<usize> {
    if link == NO_LINK { None } else { Some(link) }
}

const fn encode(link: Option<usize>) -> usize {
    match link {
        Some(bp) => bp,
        None => NO_LINK,
    }
}

pub(crate) fn prev_link(mem: &[u8], bp: usize) -> Option<usize> {
    decode(layout::read_word(mem, bp))
}

pub(crate) fn next_link(mem: &[u8], bp: usize) -> Option<usize> {
    decode(layout::read_word(mem, bp + WSIZE))
}

fn set_prev_link(mem: &mut [u8], bp: usize, prev: Option<usize>) {
    layout::write_word(mem, bp, encode(prev));
}

fn set_next_link(mem: &mut [u8], bp: usize, next: Option<usize>) {
    layout::write_word(mem, bp + WSIZE, encode(next));
}

/// Head of the list of free blocks.
///
/// The list does not own the memory its nodes live in; every operation takes
/// the arena bytes explicitly.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FreeList {
    head: Option<usize>,
}

impl FreeList {
    /// Creates an empty free list.
    #[must_use]
    pub const fn new() -> Self {
        Self { head: None }
    }

    /// Returns the most recently inserted free block.
    #[must_use]
    pub const fn head(&self) -> Option<usize> {
        self.head
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Counts the blocks in the list by walking it.
    #[must_use]
    pub fn len(&self, mem: &[u8]) -> usize {
        self.iter(mem).count()
    }

    /// Pushes the free block `bp` at the head of the list.
    ///
    /// The block's tags must already mark it free, and it must not be in the
    /// list.
    pub fn insert(&mut self, mem: &mut [u8], bp: usize) {
        debug_assert!(layout::block_size(mem, bp) >= MIN_BLOCK_SIZE);
        debug_assert!(!layout::is_allocated(mem, bp));

        set_prev_link(mem, bp, None);
        set_next_link(mem, bp, self.head);
        if let Some(old_head) = self.head {
            set_prev_link(mem, old_head, Some(bp));
        }
        self.head = Some(bp);
    }

    /// Unlinks block `bp` from the list.
    ///
    /// `bp` must currently be a member of the list.
    pub fn remove(&mut self, mem: &mut [u8], bp: usize) {
        debug_assert!(layout::block_size(mem, bp) >= MIN_BLOCK_SIZE);

        let prev = prev_link(mem, bp);
        let next = next_link(mem, bp);
        match prev {
            Some(prev) => set_next_link(mem, prev, next),
            None => {
                debug_assert_eq!(self.head, Some(bp), "unlinked block is not the head");
                self.head = next;
            }
        }
        if let Some(next) = next {
            set_prev_link(mem, next, prev);
        }
    }

    /// Returns an iterator over the blocks in list order, starting at the head.
    #[must_use]
    pub fn iter<'a>(&self, mem: &'a [u8]) -> Iter<'a> {
        Iter {
            mem,
            cursor: self.head,
        }
    }
}

/// Iterator over the payload offsets of the blocks in a [`FreeList`].
#[derive(Debug, Clone)]
pub struct Iter<'a> {
    mem: &'a [u8],
    cursor: Option<usize>,
}

impl Iterator for Iter<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<Self::Item> {
        let bp = self.cursor?;
        self.cursor = next_link(self.mem, bp);
        Some(bp)
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use alloc::{vec, vec::Vec};

    use super::*;
    use crate::layout::DSIZE;

    /// Lays out `count` adjacent free minimum-sized blocks and returns the
    /// arena with their payload offsets.
    fn free_blocks(count: usize) -> (Vec<u8>, Vec<usize>) {
        let mut mem = vec![0_u8; DSIZE + count * MIN_BLOCK_SIZE];
        let blocks = (0..count)
            .map(|i| DSIZE + i * MIN_BLOCK_SIZE)
            .collect::<Vec<_>>();
        for &bp in &blocks {
            layout::write_block(&mut mem, bp, MIN_BLOCK_SIZE, false);
        }
        (mem, blocks)
    }

    fn collect(list: &FreeList, mem: &[u8]) -> Vec<usize> {
        list.iter(mem).collect()
    }

    #[test]
    fn test_insert_is_lifo() {
        let (mut mem, blocks) = free_blocks(3);
        let mut list = FreeList::new();
        assert!(list.is_empty());

        for &bp in &blocks {
            list.insert(&mut mem, bp);
        }

        assert_eq!(list.head(), Some(blocks[2]));
        assert_eq!(collect(&list, &mem), [blocks[2], blocks[1], blocks[0]]);
        assert_eq!(list.len(&mem), 3);
        assert_eq!(prev_link(&mem, blocks[2]), None);
        assert_eq!(prev_link(&mem, blocks[1]), Some(blocks[2]));
        assert_eq!(next_link(&mem, blocks[0]), None);
    }

    #[test]
    fn test_remove_head() {
        let (mut mem, blocks) = free_blocks(3);
        let mut list = FreeList::new();
        for &bp in &blocks {
            list.insert(&mut mem, bp);
        }

        list.remove(&mut mem, blocks[2]);
        assert_eq!(list.head(), Some(blocks[1]));
        assert_eq!(prev_link(&mem, blocks[1]), None);
        assert_eq!(collect(&list, &mem), [blocks[1], blocks[0]]);
    }

    #[test]
    fn test_remove_middle_and_tail() {
        let (mut mem, blocks) = free_blocks(4);
        let mut list = FreeList::new();
        for &bp in &blocks {
            list.insert(&mut mem, bp);
        }

        list.remove(&mut mem, blocks[1]);
        assert_eq!(collect(&list, &mem), [blocks[3], blocks[2], blocks[0]]);
        assert_eq!(prev_link(&mem, blocks[0]), Some(blocks[2]));

        list.remove(&mut mem, blocks[0]);
        assert_eq!(collect(&list, &mem), [blocks[3], blocks[2]]);
        assert_eq!(next_link(&mem, blocks[2]), None);
    }

    #[test]
    fn test_remove_all_then_reinsert() {
        let (mut mem, blocks) = free_blocks(2);
        let mut list = FreeList::new();
        list.insert(&mut mem, blocks[0]);
        list.insert(&mut mem, blocks[1]);

        list.remove(&mut mem, blocks[0]);
        list.remove(&mut mem, blocks[1]);
        assert!(list.is_empty());
        assert_eq!(list.len(&mem), 0);

        list.insert(&mut mem, blocks[0]);
        assert_eq!(collect(&list, &mem), [blocks[0]]);
    }
}
