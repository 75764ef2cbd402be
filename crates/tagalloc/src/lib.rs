//! A boundary-tag memory allocator over a single growable arena.
//!
//! This crate implements the classic explicit-free-list allocator: one
//! contiguous heap that only grows at its high end, variable-sized blocks
//! carved out of it, and no bookkeeping outside the heap itself.
//!
//! # Design
//!
//! - **Boundary tags** ([`layout`]): every block carries its size and
//!   allocated flag in a header word and a matching footer word, so both
//!   address-neighbors of a block can be inspected in O(1).
//! - **Explicit free list** ([`free_list`]): free blocks are chained through
//!   links stored in their own payloads. Insertion is LIFO at the head and
//!   removal is O(1) from any position.
//! - **First fit**: allocation takes the first sufficiently large block in
//!   free-list order and splits off the remainder when it can form a block of
//!   its own.
//! - **Immediate coalescing**: freeing merges the block with free neighbors
//!   right away, so no two adjacent blocks are ever both free.
//! - **Heap growth** ([`memlib`]): when no free block fits, the heap is
//!   extended through a [`HeapSource`] by at least one chunk.
//!
//! All addresses are byte offsets into the arena. The allocator hands out
//! [`BlockRef`] values and gives access to payload bytes through
//! [`Allocator::payload`] and [`Allocator::payload_mut`].
//!
//! # Usage Example
//!
//! ```rust
//! use tagalloc::{Allocator, MemLib};
//!
//! let mut allocator = Allocator::init(MemLib::new()).unwrap();
//!
//! let block = allocator.allocate(100).unwrap();
//! allocator.payload_mut(block)[..5].copy_from_slice(b"hello");
//!
//! // grow the block; the payload is preserved
//! let block = allocator.reallocate(Some(block), 1000).unwrap();
//! assert_eq!(&allocator.payload(block)[..5], b"hello");
//!
//! allocator.deallocate(Some(block));
//! assert!(allocator.violations().is_empty());
//! ```
//!
//! # Performance Characteristics
//!
//! | Operation | Cost |
//! |-----------|------|
//! | `allocate` | O(n) in the number of free blocks |
//! | `deallocate` | O(1) |
//! | `reallocate` | O(1) in place, otherwise `allocate` plus a copy |
//! | `violations` | O(heap blocks + n²) |
//!
//! # Thread Safety
//!
//! The allocator is a plain value with `&mut self` operations. It can be
//! moved between threads but requires external synchronization (e.g., a
//! mutex around the whole allocator) for concurrent access.

#![cfg_attr(not(test), no_std)]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

extern crate alloc;

pub mod check;
pub mod engine;
pub mod free_list;
pub mod layout;
pub mod memlib;

pub use self::{
    check::{BlockInfo, HeapStats, Violation},
    engine::{Allocator, BlockRef, Config, ExtendError, InitError},
    memlib::{GrowError, HeapSource, MemLib},
};
