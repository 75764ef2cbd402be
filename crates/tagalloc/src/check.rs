//! Heap consistency checker.
//!
//! These routines walk the whole arena and the whole free list, so they are
//! meant for tests and debugging only. The adjacency check compares every
//! pair of free-list members and is quadratic in the free-list length.

use alloc::vec::Vec;
use core::fmt;

use log::{error, info};

use crate::{
    engine::Allocator,
    free_list,
    layout::{self, DSIZE, MIN_BLOCK_SIZE, Tag},
    memlib::HeapSource,
};

/// A broken heap invariant found by the checker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display, derive_more::IsVariant)]
pub enum Violation {
    #[display("bad prologue: header={header}, footer={footer}")]
    BadPrologue { header: Tag, footer: Tag },
    #[display("bad epilogue header at {offset:#x}: {header}")]
    BadEpilogue { offset: usize, header: Tag },
    #[display("heap ends without an epilogue at {offset:#x}")]
    MissingEpilogue { offset: usize },
    #[display("block at {offset:#x} overruns the heap: size={size}")]
    Overrun { offset: usize, size: usize },
    #[display("block at {offset:#x} is not doubleword aligned")]
    Misaligned { offset: usize },
    #[display("block at {offset:#x}: header {header} does not match footer {footer}")]
    TagMismatch {
        offset: usize,
        header: Tag,
        footer: Tag,
    },
    #[display("allocated block {offset:#x} in free list")]
    AllocatedInFreeList { offset: usize },
    #[display("free list member {offset:#x} is out of heap bounds")]
    OutOfBounds { offset: usize },
    #[display("free list does not terminate within {limit} blocks")]
    FreeListCycle { limit: usize },
    #[display("adjacent free blocks {first:#x} and {second:#x} missed coalescing")]
    Uncoalesced { first: usize, second: usize },
    #[display("free block count mismatch: heap={heap}, free_list={free_list}")]
    FreeCountMismatch { heap: usize, free_list: usize },
}

/// One block found by walking the heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// Payload offset of the block.
    pub offset: usize,
    pub header: Tag,
    pub footer: Tag,
}

impl BlockInfo {
    #[must_use]
    pub const fn size(&self) -> usize {
        self.header.size()
    }

    #[must_use]
    pub const fn is_allocated(&self) -> bool {
        self.header.is_allocated()
    }
}

impl fmt::Display for BlockInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:#x}: header: {} footer: {}",
            self.offset, self.header, self.footer
        )
    }
}

/// Iterator over the ordinary blocks of the heap, in address order.
///
/// The walk stops at the epilogue, or early at a block whose size would take
/// it past the end of the arena.
#[derive(Debug, Clone)]
pub struct Blocks<'a> {
    mem: &'a [u8],
    cursor: usize,
    /// Offset and size of the block that ended the walk early.
    overrun: Option<(usize, usize)>,
}

impl<'a> Blocks<'a> {
    fn new(mem: &'a [u8], first: usize) -> Self {
        Self {
            mem,
            cursor: first,
            overrun: None,
        }
    }
}

impl Iterator for Blocks<'_> {
    type Item = BlockInfo;

    fn next(&mut self) -> Option<Self::Item> {
        let bp = self.cursor;
        if self.overrun.is_some() || bp > self.mem.len() {
            return None;
        }
        let header = layout::read_tag(self.mem, layout::header(bp));
        let size = header.size();
        if size == 0 {
            return None;
        }
        let Some(end) = bp.checked_add(size).filter(|&end| end <= self.mem.len()) else {
            self.overrun = Some((bp, size));
            return None;
        };
        let footer = layout::read_tag(self.mem, end - DSIZE);
        self.cursor = end;
        Some(BlockInfo {
            offset: bp,
            header,
            footer,
        })
    }
}

/// Summary of heap usage.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    /// Bytes obtained from the heap source, sentinels included.
    pub heap_size: usize,
    pub free_blocks: usize,
    pub free_bytes: usize,
    pub allocated_blocks: usize,
    pub allocated_bytes: usize,
}

/// Human-readable listing of every block in the heap.
pub struct HeapDump<'a, H> {
    allocator: &'a Allocator<H>,
}

impl<H> fmt::Display for HeapDump<'_, H>
where
    H: HeapSource,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let allocator = self.allocator;
        let mem = allocator.source.bytes();
        let prologue = BlockInfo {
            offset: allocator.heap_start,
            header: layout::read_tag(mem, layout::header(allocator.heap_start)),
            footer: layout::read_tag(mem, allocator.heap_start),
        };
        writeln!(f, "Heap ({:#x}):", allocator.heap_start)?;
        writeln!(f, "{prologue}")?;
        let mut walk = allocator.blocks();
        for block in walk.by_ref() {
            writeln!(f, "{block}")?;
        }
        write!(f, "{:#x}: end of heap", walk.cursor)
    }
}

impl<H> Allocator<H>
where
    H: HeapSource,
{
    /// Returns an iterator over every block between the prologue and the
    /// epilogue.
    #[must_use]
    pub fn blocks(&self) -> Blocks<'_> {
        Blocks::new(self.source.bytes(), self.heap_start + DSIZE)
    }

    #[must_use]
    pub fn stats(&self) -> HeapStats {
        let mut stats = HeapStats {
            heap_size: self.source.bytes().len() - self.arena_start,
            ..HeapStats::default()
        };
        for block in self.blocks() {
            if block.is_allocated() {
                stats.allocated_blocks += 1;
                stats.allocated_bytes += block.size();
            } else {
                stats.free_blocks += 1;
                stats.free_bytes += block.size();
            }
        }
        stats
    }

    /// Returns a displayable listing of the heap.
    #[must_use]
    pub const fn dump(&self) -> HeapDump<'_, H> {
        HeapDump { allocator: self }
    }

    /// Checks every heap invariant and returns the violations found.
    ///
    /// An empty result means the heap is consistent.
    #[must_use]
    pub fn violations(&self) -> Vec<Violation> {
        let mem = self.source.bytes();
        let mut violations = Vec::new();

        let header = layout::read_tag(mem, layout::header(self.heap_start));
        let footer = layout::read_tag(mem, self.heap_start);
        if header != Tag::PROLOGUE || footer != Tag::PROLOGUE {
            violations.push(Violation::BadPrologue { header, footer });
        }

        let heap_free = self.check_blocks(mem, &mut violations);
        let members = self.check_free_list(mem, &mut violations);

        for &first in &members {
            let Some(next) = first.checked_add(layout::block_size(mem, first)) else {
                continue;
            };
            for &second in &members {
                if next == second {
                    violations.push(Violation::Uncoalesced { first, second });
                }
            }
        }

        if heap_free != members.len() {
            violations.push(Violation::FreeCountMismatch {
                heap: heap_free,
                free_list: members.len(),
            });
        }

        violations
    }

    /// Walks the heap, checking each block and the epilogue. Returns the
    /// number of free blocks seen.
    fn check_blocks(&self, mem: &[u8], violations: &mut Vec<Violation>) -> usize {
        let mut heap_free = 0;
        let mut walk = self.blocks();
        for block in walk.by_ref() {
            if block.header != block.footer {
                violations.push(Violation::TagMismatch {
                    offset: block.offset,
                    header: block.header,
                    footer: block.footer,
                });
            }
            if !block.is_allocated() {
                heap_free += 1;
            }
        }

        // a sized block sitting in the final word means the epilogue was lost
        match walk.overrun {
            Some((offset, _)) if offset == mem.len() => {
                violations.push(Violation::MissingEpilogue { offset });
                return heap_free;
            }
            Some((offset, size)) => {
                violations.push(Violation::Overrun { offset, size });
                return heap_free;
            }
            None => {}
        }

        let end = walk.cursor;
        let header = layout::read_tag(mem, layout::header(end));
        if header != Tag::EPILOGUE || end != mem.len() {
            violations.push(Violation::BadEpilogue { offset: end, header });
        }
        heap_free
    }

    /// Walks the free list, checking that every member is a free block inside
    /// the heap. Returns the members visited.
    fn check_free_list(&self, mem: &[u8], violations: &mut Vec<Violation>) -> Vec<usize> {
        let limit = mem.len() / MIN_BLOCK_SIZE;
        let mut members = Vec::new();
        let mut cursor = self.free_list.head();
        while let Some(bp) = cursor {
            if members.len() >= limit {
                violations.push(Violation::FreeListCycle { limit });
                break;
            }
            if bp <= self.heap_start || bp.checked_add(DSIZE).is_none_or(|end| end > mem.len()) {
                violations.push(Violation::OutOfBounds { offset: bp });
                break;
            }
            if !bp.is_multiple_of(DSIZE) {
                violations.push(Violation::Misaligned { offset: bp });
                break;
            }
            if layout::is_allocated(mem, bp) {
                violations.push(Violation::AllocatedInFreeList { offset: bp });
            }
            members.push(bp);
            cursor = free_list::next_link(mem, bp);
        }
        members
    }

    /// Runs the checker and logs the result.
    ///
    /// Each violation is logged at error level. When `verbose` is set, the
    /// whole heap listing is logged at info level first.
    pub fn check_heap(&self, verbose: bool) {
        if verbose {
            info!("{}", self.dump());
        }
        for violation in self.violations() {
            error!("heap check: {violation}");
        }
    }

    /// Runs the checker and writes the result to `out`.
    pub fn check_heap_to<W>(&self, out: &mut W, verbose: bool) -> fmt::Result
    where
        W: fmt::Write,
    {
        if verbose {
            writeln!(out, "{}", self.dump())?;
        }
        for violation in self.violations() {
            writeln!(out, "Error: {violation}")?;
        }
        Ok(())
    }
}
