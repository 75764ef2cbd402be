//! Heap growth service.
//!
//! The allocator never obtains memory on its own: it asks a [`HeapSource`] to
//! move a break pointer forward and hands out pieces of the bytes below it.
//! [`MemLib`] is a simulated break-pointer heap with a fixed upper bound, which
//! is what the allocator runs on in tests and in hosted environments.

use alloc::{collections::TryReserveError, vec::Vec};

use snafu::{Location, ResultExt as _, Snafu, ensure};

/// Default upper bound of a [`MemLib`] heap (20 MiB).
pub const MAX_HEAP: usize = 20 * (1 << 20);

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum GrowError {
    #[snafu(display("heap exhausted: requested={requested}, available={available}"))]
    OutOfMemory {
        requested: usize,
        available: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("failed to reserve backing storage: requested={requested}"))]
    Reserve {
        requested: usize,
        source: TryReserveError,
        #[snafu(implicit)]
        location: Location,
    },
}

/// A contiguous region that only grows at its high end.
///
/// Implementations must guarantee that
///
/// - every extent returned by [`grow`](Self::grow) starts exactly where the
///   previous one ended,
/// - bytes below the break are never moved or discarded, and
/// - [`bytes`](Self::bytes) covers everything from offset `0` up to the
///   current break.
pub trait HeapSource {
    /// Moves the break forward by `incr` bytes and returns the offset of the
    /// first new byte.
    fn grow(&mut self, incr: usize) -> Result<usize, GrowError>;

    /// Returns the bytes below the current break.
    fn bytes(&self) -> &[u8];

    /// Returns the bytes below the current break, mutably.
    fn bytes_mut(&mut self) -> &mut [u8];
}

/// A simulated break-pointer heap bounded by a maximum size.
#[derive(Debug, Clone)]
pub struct MemLib {
    heap: Vec<u8>,
    max_heap: usize,
}

impl Default for MemLib {
    fn default() -> Self {
        Self::new()
    }
}

impl MemLib {
    /// Creates an empty heap that may grow up to [`MAX_HEAP`] bytes.
    #[must_use]
    pub const fn new() -> Self {
        Self::with_capacity(MAX_HEAP)
    }

    /// Creates an empty heap that may grow up to `max_heap` bytes.
    #[must_use]
    pub const fn with_capacity(max_heap: usize) -> Self {
        Self {
            heap: Vec::new(),
            max_heap,
        }
    }

    /// Empties the heap, moving the break back to offset `0`.
    pub fn reset_brk(&mut self) {
        self.heap.clear();
    }

    /// Offset of the first heap byte.
    #[must_use]
    pub const fn heap_lo(&self) -> usize {
        0
    }

    /// Offset of the last heap byte, or `0` for an empty heap.
    #[must_use]
    pub fn heap_hi(&self) -> usize {
        self.heap.len().saturating_sub(1)
    }

    /// Current heap size in bytes.
    #[must_use]
    pub fn heap_size(&self) -> usize {
        self.heap.len()
    }

    /// Maximum heap size in bytes.
    #[must_use]
    pub const fn max_heap(&self) -> usize {
        self.max_heap
    }
}

impl HeapSource for MemLib {
    fn grow(&mut self, incr: usize) -> Result<usize, GrowError> {
        let brk = self.heap.len();
        let available = self.max_heap - brk;
        ensure!(
            incr <= available,
            OutOfMemorySnafu {
                requested: incr,
                available,
            }
        );
        self.heap
            .try_reserve(incr)
            .context(ReserveSnafu { requested: incr })?;
        self.heap.resize(brk + incr, 0);
        Ok(brk)
    }

    fn bytes(&self) -> &[u8] {
        &self.heap
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.heap
    }
}
