//! Boundary-tag block layout.
//!
//! Every block in the arena starts with a header word and ends with a footer
//! word. Both hold the same [`Tag`]: the total block size with the allocated
//! flag packed into the low bit. Because sizes are always multiples of
//! [`DSIZE`], the low `DSIZE - 1` bits of a tag are free for flags.
//!
//! ```text
//! Allocated block:                      Free block:
//! ┌────────┬──────────────┬────────┐    ┌────────┬──────┬──────┬─────┬────────┐
//! │ header │   payload    │ footer │    │ header │ prev │ next │ ... │ footer │
//! └────────┴──────────────┴────────┘    └────────┴──────┴──────┴─────┴────────┘
//!          ▲                                     ▲
//!          └── block reference (payload offset)  └── links live in the payload
//! ```
//!
//! All addresses are byte offsets into the arena. A block is identified by the
//! offset of its payload (`bp`); the header sits one word before it.

use core::fmt;

/// Word size in bytes. Tags and free-list links are one word each.
pub const WSIZE: usize = size_of::<usize>();

/// Double-word size in bytes. Block sizes and payload offsets are multiples of
/// this.
pub const DSIZE: usize = 2 * WSIZE;

/// Smallest block that can hold a header, a footer and two free-list links.
pub const MIN_BLOCK_SIZE: usize = 2 * DSIZE;

/// Default amount (in bytes) by which the heap is extended.
pub const CHUNKSIZE: usize = 1 << 12;

const SIZE_MASK: usize = !(DSIZE - 1);
const ALLOCATED_BIT: usize = 0x1;

/// A boundary tag: block size and allocated flag packed into one word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tag(usize);

impl Tag {
    /// Tag of the zero-sized epilogue sentinel.
    pub const EPILOGUE: Self = Self::pack(0, true);

    /// Tag of the prologue sentinel.
    pub const PROLOGUE: Self = Self::pack(DSIZE, true);

    /// Packs a block size and allocated flag into a tag.
    #[must_use]
    pub const fn pack(size: usize, allocated: bool) -> Self {
        debug_assert!((size & !SIZE_MASK) == 0);
        Self(size | if allocated { ALLOCATED_BIT } else { 0 })
    }

    #[must_use]
    pub const fn from_word(word: usize) -> Self {
        Self(word)
    }

    #[must_use]
    pub const fn to_word(self) -> usize {
        self.0
    }

    /// Returns the total block size, ignoring the flag bits.
    #[must_use]
    pub const fn size(self) -> usize {
        self.0 & SIZE_MASK
    }

    #[must_use]
    pub const fn is_allocated(self) -> bool {
        self.0 & ALLOCATED_BIT != 0
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.is_allocated() { 'a' } else { 'f' };
        write!(f, "[{}:{state}]", self.size())
    }
}

/// Reads the native-endian word stored at `offset`.
///
/// # Panics
///
/// Panics if the word does not lie entirely within `mem`.
#[must_use]
pub fn read_word(mem: &[u8], offset: usize) -> usize {
    let mut bytes = [0; WSIZE];
    bytes.copy_from_slice(&mem[offset..offset + WSIZE]);
    usize::from_ne_bytes(bytes)
}

/// Writes `value` as a native-endian word at `offset`.
///
/// # Panics
///
/// Panics if the word does not lie entirely within `mem`.
pub fn write_word(mem: &mut [u8], offset: usize, value: usize) {
    mem[offset..offset + WSIZE].copy_from_slice(&value.to_ne_bytes());
}

#[must_use]
pub fn read_tag(mem: &[u8], offset: usize) -> Tag {
    Tag::from_word(read_word(mem, offset))
}

pub fn write_tag(mem: &mut [u8], offset: usize, tag: Tag) {
    write_word(mem, offset, tag.to_word());
}

/// Returns the offset of the header of the block whose payload starts at `bp`.
#[must_use]
pub const fn header(bp: usize) -> usize {
    bp - WSIZE
}

/// Returns the offset of the footer of block `bp`, using the size in its
/// header.
#[must_use]
pub fn footer(mem: &[u8], bp: usize) -> usize {
    bp + block_size(mem, bp) - DSIZE
}

#[must_use]
pub fn block_size(mem: &[u8], bp: usize) -> usize {
    read_tag(mem, header(bp)).size()
}

#[must_use]
pub fn is_allocated(mem: &[u8], bp: usize) -> bool {
    read_tag(mem, header(bp)).is_allocated()
}

/// Returns the block immediately following `bp` in the arena.
#[must_use]
pub fn next_block(mem: &[u8], bp: usize) -> usize {
    bp + block_size(mem, bp)
}

/// Returns the block immediately preceding `bp` in the arena.
///
/// The size of the preceding block is read from its footer, which sits right
/// before the header of `bp`.
#[must_use]
pub fn prev_block(mem: &[u8], bp: usize) -> usize {
    bp - read_tag(mem, bp - DSIZE).size()
}

/// Returns whether the block preceding `bp` is allocated, read from its
/// footer.
#[must_use]
pub fn prev_allocated(mem: &[u8], bp: usize) -> bool {
    read_tag(mem, bp - DSIZE).is_allocated()
}

/// Writes matching header and footer tags for a block of `size` bytes at `bp`.
///
/// The footer position is derived from `size`, not from the previous header,
/// so this can be used to resize a block.
pub fn write_block(mem: &mut [u8], bp: usize, size: usize, allocated: bool) {
    let tag = Tag::pack(size, allocated);
    write_tag(mem, header(bp), tag);
    write_tag(mem, bp + size - DSIZE, tag);
}

/// Computes the block size needed to serve a payload of `size` bytes.
///
/// The result includes header and footer overhead, is a multiple of
/// [`DSIZE`] and is at least [`MIN_BLOCK_SIZE`]. Returns `None` for sizes that
/// do not fit in `isize` or whose block size would overflow.
#[must_use]
pub fn adjusted_size(size: usize) -> Option<usize> {
    if size > isize::MAX.unsigned_abs() {
        return None;
    }
    if size <= DSIZE {
        return Some(MIN_BLOCK_SIZE);
    }
    size.checked_add(DSIZE)?
        .checked_next_multiple_of(DSIZE)
        .filter(|&asize| asize <= isize::MAX.unsigned_abs())
}
