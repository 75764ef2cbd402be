//! Boundary-tag allocator engine.
//!
//! The engine manages one arena obtained from a [`HeapSource`]. The arena is
//! bracketed by two sentinel blocks so that neighbor lookups never leave it:
//!
//! ```text
//! offset 0
//! ┌─────────┬──────────┬──────────┬─────────────────────────────┬──────────┐
//! │ padding │ prologue │ prologue │   ordinary blocks ...       │ epilogue │
//! │   (0)   │ hdr 16/a │ ftr 16/a │                             │ hdr 0/a  │
//! └─────────┴──────────┴──────────┴─────────────────────────────┴──────────┘
//!                      ▲                                                   ▲
//!                      └── heap start (prologue payload)            break ─┘
//! ```
//!
//! (Sizes shown for a 64-bit target.) Free blocks are kept in an explicit
//! [`FreeList`]; allocation is first-fit over that list, and freeing coalesces
//! with both address-neighbors in O(1) through the boundary tags.

use core::fmt;

use log::{debug, trace, warn};
use snafu::{Location, OptionExt as _, ResultExt as _, Snafu, ensure};

use crate::{
    free_list::FreeList,
    layout::{self, CHUNKSIZE, DSIZE, MIN_BLOCK_SIZE, Tag, WSIZE},
    memlib::{GrowError, HeapSource},
};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ExtendError {
    #[snafu(display("failed to grow heap by {bytes} bytes: {source}"))]
    Grow {
        bytes: usize,
        source: GrowError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("heap extension size overflows: words={words}"))]
    Overflow {
        words: usize,
        #[snafu(implicit)]
        location: Location,
    },
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum InitError {
    #[snafu(display("failed to create the initial heap: {source}"))]
    InitialHeap {
        source: GrowError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("heap source returned a misaligned start offset: start={start:#x}"))]
    MisalignedStart {
        start: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("failed to extend the initial heap with a free chunk: {source}"))]
    FirstChunk {
        source: ExtendError,
        #[snafu(implicit)]
        location: Location,
    },
}

/// Reference to an allocated block.
///
/// Holds the arena offset of the block's payload. Only the allocator creates
/// these; a reference stays meaningful until the block is deallocated or
/// moved by [`Allocator::reallocate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockRef(usize);

impl BlockRef {
    /// Returns the arena offset of the payload.
    #[must_use]
    pub const fn offset(self) -> usize {
        self.0
    }
}

impl fmt::Display for BlockRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Tunable allocator parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    chunk_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    /// Returns the default configuration (extend the heap by [`CHUNKSIZE`]).
    #[must_use]
    pub const fn new() -> Self {
        Self {
            chunk_size: CHUNKSIZE,
        }
    }

    /// Sets the minimum number of bytes requested from the heap source per
    /// extension.
    ///
    /// The value is rounded up to a multiple of [`DSIZE`] and raised to at
    /// least [`MIN_BLOCK_SIZE`].
    #[must_use]
    pub fn with_chunk_size(mut self, bytes: usize) -> Self {
        self.chunk_size = bytes
            .max(MIN_BLOCK_SIZE)
            .checked_next_multiple_of(DSIZE)
            .unwrap_or(usize::MAX & !(DSIZE - 1));
        self
    }

    #[must_use]
    pub const fn chunk_size(&self) -> usize {
        self.chunk_size
    }
}

/// A first-fit, explicit-free-list allocator with boundary-tag coalescing.
///
/// # Thread Safety
///
/// Every mutating operation takes `&mut self`. Sharing an allocator between
/// threads requires wrapping the whole value in a lock.
#[derive(Debug)]
pub struct Allocator<H> {
    pub(crate) source: H,
    /// Offset of the first byte handed out by the heap source.
    pub(crate) arena_start: usize,
    /// Payload offset of the prologue block; heap walks start here.
    pub(crate) heap_start: usize,
    pub(crate) free_list: FreeList,
    config: Config,
}

impl<H> Allocator<H>
where
    H: HeapSource,
{
    /// Creates an allocator over `source` with the default [`Config`].
    pub fn init(source: H) -> Result<Self, InitError> {
        Self::init_with_config(source, Config::default())
    }

    /// Creates an allocator over `source`.
    ///
    /// Lays out the prologue and epilogue sentinels, then extends the heap by
    /// one chunk to create the first free block.
    pub fn init_with_config(mut source: H, config: Config) -> Result<Self, InitError> {
        let start = source.grow(4 * WSIZE).context(InitialHeapSnafu)?;
        ensure!(start.is_multiple_of(DSIZE), MisalignedStartSnafu { start });

        let mem = source.bytes_mut();
        layout::write_word(mem, start, 0);
        layout::write_tag(mem, start + WSIZE, Tag::PROLOGUE);
        layout::write_tag(mem, start + 2 * WSIZE, Tag::PROLOGUE);
        layout::write_tag(mem, start + 3 * WSIZE, Tag::EPILOGUE);

        let mut this = Self {
            source,
            arena_start: start,
            heap_start: start + 2 * WSIZE,
            free_list: FreeList::new(),
            config,
        };
        this.extend_heap(config.chunk_size() / WSIZE)
            .context(FirstChunkSnafu)?;

        debug!(
            "allocator initialized: heap_start={:#x}, chunk_size={}",
            this.heap_start,
            config.chunk_size()
        );
        Ok(this)
    }

    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the heap source backing the arena.
    #[must_use]
    pub const fn source(&self) -> &H {
        &self.source
    }

    /// Consumes the allocator, returning its heap source.
    pub fn into_source(self) -> H {
        self.source
    }

    /// Allocates a block with at least `size` bytes of payload.
    ///
    /// Returns `None` when `size` is zero, when `size` exceeds `isize::MAX`, or
    /// when the heap source cannot supply more memory. The payload offset is
    /// always double-word aligned.
    #[must_use]
    pub fn allocate(&mut self, size: usize) -> Option<BlockRef> {
        if size == 0 {
            return None;
        }
        let Some(asize) = layout::adjusted_size(size) else {
            warn!("allocate({size}): request too large");
            return None;
        };

        if let Some(bp) = self.find_fit(asize) {
            self.place(bp, asize);
            return Some(BlockRef(bp));
        }

        let extend_size = asize.max(self.config.chunk_size());
        let bp = match self.extend_heap(extend_size / WSIZE) {
            Ok(bp) => bp,
            Err(err) => {
                warn!("allocate({size}): out of memory: {err}");
                return None;
            }
        };
        self.place(bp, asize);
        Some(BlockRef(bp))
    }

    /// Frees `block`. `None` is ignored.
    ///
    /// References that do not name an allocated block (for example a block
    /// that was already freed) are rejected with a warning and leave the heap
    /// unchanged.
    pub fn deallocate(&mut self, block: Option<BlockRef>) {
        let Some(block) = block else {
            return;
        };
        let Some(size) = self.allocated_size(block) else {
            warn!("deallocate({block}): not an allocated block");
            return;
        };

        layout::write_block(self.source.bytes_mut(), block.0, size, false);
        self.coalesce(block.0);
    }

    /// Resizes `block` to hold at least `size` bytes of payload.
    ///
    /// - `size == 0` frees the block and returns `None`.
    /// - `block == None` behaves like [`allocate`](Self::allocate).
    /// - A block that is already large enough is returned unchanged.
    /// - A block followed by a free block large enough to cover the request
    ///   absorbs that neighbor and keeps its address.
    /// - Otherwise the payload moves to a new block and the old one is freed.
    ///   If that allocation fails, `None` is returned and `block` remains
    ///   valid and untouched.
    #[must_use]
    pub fn reallocate(&mut self, block: Option<BlockRef>, size: usize) -> Option<BlockRef> {
        if size == 0 {
            self.deallocate(block);
            return None;
        }
        if size > isize::MAX.unsigned_abs() {
            warn!("reallocate({size}): request too large");
            return None;
        }
        let Some(block) = block else {
            return self.allocate(size);
        };
        let Some(current) = self.allocated_size(block) else {
            warn!("reallocate({block}, {size}): not an allocated block");
            return None;
        };

        let required = size.checked_add(DSIZE)?;
        if current >= required {
            trace!("reallocate({block}, {size}): fits in place, size={current}");
            return Some(block);
        }

        let bp = block.0;
        let mem = self.source.bytes_mut();
        let next = layout::next_block(mem, bp);
        if !layout::is_allocated(mem, next) {
            let combined = current + layout::block_size(mem, next);
            if combined >= required {
                trace!("reallocate({block}, {size}): absorbing next block, size={combined}");
                self.free_list.remove(mem, next);
                layout::write_block(mem, bp, combined, true);
                return Some(block);
            }
        }

        let Some(moved) = self.allocate(size) else {
            warn!("reallocate({block}, {size}): out of memory, block left in place");
            return None;
        };
        let copy_len = (current - DSIZE).min(size);
        self.source
            .bytes_mut()
            .copy_within(bp..bp + copy_len, moved.0);
        trace!("reallocate({block}, {size}): moved to {moved}, copied={copy_len}");
        self.deallocate(Some(block));
        Some(moved)
    }

    /// Returns the number of payload bytes usable through `block`.
    ///
    /// # Panics
    ///
    /// Panics if `block` does not name an allocated block.
    #[must_use]
    pub fn usable_size(&self, block: BlockRef) -> usize {
        self.checked_size(block) - DSIZE
    }

    /// Returns the payload of `block`.
    ///
    /// # Panics
    ///
    /// Panics if `block` does not name an allocated block.
    #[must_use]
    pub fn payload(&self, block: BlockRef) -> &[u8] {
        let size = self.checked_size(block);
        &self.source.bytes()[block.0..block.0 + size - DSIZE]
    }

    /// Returns the payload of `block`, mutably.
    ///
    /// # Panics
    ///
    /// Panics if `block` does not name an allocated block.
    #[must_use]
    pub fn payload_mut(&mut self, block: BlockRef) -> &mut [u8] {
        let size = self.checked_size(block);
        &mut self.source.bytes_mut()[block.0..block.0 + size - DSIZE]
    }

    fn checked_size(&self, block: BlockRef) -> usize {
        self.allocated_size(block)
            .unwrap_or_else(|| panic!("{block} is not an allocated block"))
    }

    /// Returns the size of the allocated block `block`, or `None` if the
    /// reference does not name a well-formed allocated block.
    fn allocated_size(&self, block: BlockRef) -> Option<usize> {
        let mem = self.source.bytes();
        let bp = block.0;
        if bp <= self.heap_start || !bp.is_multiple_of(DSIZE) || bp >= mem.len() {
            return None;
        }
        let tag = layout::read_tag(mem, layout::header(bp));
        let size = tag.size();
        if !tag.is_allocated() || size < MIN_BLOCK_SIZE {
            return None;
        }
        // the footer must lie below the epilogue header
        let footer = bp.checked_add(size)? - DSIZE;
        if footer + DSIZE > mem.len() || layout::read_tag(mem, footer) != tag {
            return None;
        }
        Some(size)
    }

    /// Extends the heap by `words` words (rounded up to an even count) and
    /// returns the resulting free block, coalesced with a free predecessor.
    fn extend_heap(&mut self, words: usize) -> Result<usize, ExtendError> {
        let size = words
            .checked_next_multiple_of(2)
            .and_then(|words| words.checked_mul(WSIZE))
            .context(OverflowSnafu { words })?;
        let bp = self.source.grow(size).context(GrowSnafu { bytes: size })?;

        // the new block's header overwrites the old epilogue
        let mem = self.source.bytes_mut();
        layout::write_block(mem, bp, size, false);
        layout::write_tag(mem, layout::header(bp + size), Tag::EPILOGUE);
        debug!("heap extended: block={bp:#x}, size={size}, break={:#x}", mem.len());

        Ok(self.coalesce(bp))
    }

    /// Merges the free block `bp` with its free address-neighbors and links
    /// the result into the free list.
    fn coalesce(&mut self, bp: usize) -> usize {
        let mem = self.source.bytes_mut();
        let prev_allocated = layout::prev_allocated(mem, bp);
        let next = layout::next_block(mem, bp);
        let next_allocated = layout::is_allocated(mem, next);
        let mut size = layout::block_size(mem, bp);

        let bp = match (prev_allocated, next_allocated) {
            (true, true) => bp,
            (true, false) => {
                size += layout::block_size(mem, next);
                self.free_list.remove(mem, next);
                layout::write_block(mem, bp, size, false);
                bp
            }
            (false, true) => {
                let prev = layout::prev_block(mem, bp);
                size += layout::block_size(mem, prev);
                self.free_list.remove(mem, prev);
                layout::write_block(mem, prev, size, false);
                prev
            }
            (false, false) => {
                let prev = layout::prev_block(mem, bp);
                size += layout::block_size(mem, prev) + layout::block_size(mem, next);
                self.free_list.remove(mem, prev);
                self.free_list.remove(mem, next);
                layout::write_block(mem, prev, size, false);
                prev
            }
        };
        trace!("coalesced: block={bp:#x}, size={size}");

        self.free_list.insert(mem, bp);
        bp
    }

    /// Returns the first block in free-list order of at least `asize` bytes.
    fn find_fit(&self, asize: usize) -> Option<usize> {
        let mem = self.source.bytes();
        self.free_list
            .iter(mem)
            .find(|&bp| layout::block_size(mem, bp) >= asize)
    }

    /// Allocates `asize` bytes at the start of the free block `bp`, splitting
    /// off the remainder when it can form a block of its own.
    fn place(&mut self, bp: usize, asize: usize) {
        let mem = self.source.bytes_mut();
        let csize = layout::block_size(mem, bp);
        debug_assert!(csize >= asize);

        self.free_list.remove(mem, bp);
        if csize - asize >= MIN_BLOCK_SIZE {
            layout::write_block(mem, bp, asize, true);
            let rest = bp + asize;
            layout::write_block(mem, rest, csize - asize, false);
            self.free_list.insert(mem, rest);
            trace!("placed: block={bp:#x}, size={asize}, remainder={}", csize - asize);
        } else {
            layout::write_block(mem, bp, csize, true);
            trace!("placed: block={bp:#x}, size={csize}, no split");
        }
    }
}
