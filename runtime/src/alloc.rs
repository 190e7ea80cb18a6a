// Copyright 2024 autortfm contributors
// SPDX-License-Identifier: Apache-2.0

//! Bump-pointer arena allocation and object pools.
//!
//! Every per-transaction data structure is backed by one of these so that
//! beginning and resolving transactions at high frequency does not churn the
//! global heap. None of the types here are thread safe; a transaction stack
//! is owned by exactly one thread by design.

use std::alloc::{alloc, dealloc, handle_alloc_error, Layout};
use std::ptr::NonNull;

/// One raw heap block. Deallocated on drop.
pub(crate) struct RawBlock {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl RawBlock {
    pub(crate) fn new(size: usize, align: usize) -> Self {
        debug_assert!(size > 0);
        let layout = Layout::from_size_align(size, align).expect("invalid block layout");
        // Uninitialized contents; callers only read what they wrote.
        let ptr = unsafe { alloc(layout) };
        let ptr = match NonNull::new(ptr) {
            Some(p) => p,
            None => handle_alloc_error(layout),
        };
        Self { ptr, layout }
    }

    pub(crate) fn base(&self) -> NonNull<u8> {
        self.ptr
    }

    pub(crate) fn capacity(&self) -> usize {
        self.layout.size()
    }
}

impl Drop for RawBlock {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

const DEFAULT_ALIGN: usize = 16;

/// Single-threaded bump allocator.
///
/// The head block is allocated once at construction and survives
/// [`BlockAllocator::free_all`]; every later block grows geometrically by
/// `growth_percent` over the previous capacity (or to the requested size if
/// larger) and is released wholesale by `free_all`. There is no per-object
/// free.
pub struct BlockAllocator {
    blocks: Vec<RawBlock>,
    /// Bump offset into the last block.
    cursor: usize,
    growth_percent: usize,
}

impl BlockAllocator {
    pub fn new(head_capacity: usize, growth_percent: usize) -> Self {
        Self {
            blocks: vec![RawBlock::new(head_capacity, DEFAULT_ALIGN)],
            cursor: 0,
            growth_percent,
        }
    }

    /// Hands out `size` bytes aligned to `align` (at most 16).
    pub fn allocate(&mut self, size: usize, align: usize) -> NonNull<u8> {
        debug_assert!(align <= DEFAULT_ALIGN && align.is_power_of_two());
        debug_assert!(size > 0);

        let aligned = (self.cursor + align - 1) & !(align - 1);
        let block = self.blocks.last().expect("allocator has no head block");
        if aligned + size > block.capacity() {
            self.grow(size);
            return self.allocate(size, align);
        }

        self.cursor = aligned + size;
        // Within the block we just range checked.
        unsafe { NonNull::new_unchecked(block.base().as_ptr().add(aligned)) }
    }

    fn grow(&mut self, at_least: usize) {
        let prev = self.blocks.last().map(RawBlock::capacity).unwrap_or(0);
        let grown = prev + prev * self.growth_percent / 100;
        let capacity = grown.max(at_least);
        self.blocks.push(RawBlock::new(capacity, DEFAULT_ALIGN));
        self.cursor = 0;
    }

    /// Releases every block except the head one and rewinds the cursor.
    /// Everything previously handed out becomes invalid.
    pub fn free_all(&mut self) {
        self.blocks.truncate(1);
        self.cursor = 0;
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }
}

/// Typed free-list pool. `take` constructs a value (reusing a previously
/// returned allocation when one is available), `put_back` recycles it.
pub struct Pool<T> {
    free: Vec<Box<T>>,
}

impl<T> Pool<T> {
    pub fn new() -> Self {
        Self { free: Vec::new() }
    }

    pub fn take(&mut self, make: impl FnOnce() -> T) -> Box<T> {
        match self.free.pop() {
            Some(mut boxed) => {
                *boxed = make();
                boxed
            }
            None => Box::new(make()),
        }
    }

    pub fn put_back(&mut self, value: Box<T>) {
        self.free.push(value);
    }

    pub fn idle(&self) -> usize {
        self.free.len()
    }
}

impl<T> Default for Pool<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Hook for values recycled in place instead of reconstructed.
///
/// The counterpart of the original's intrusive pool: `reset` plays the role
/// of the resurrect/suppress pair, wiping logical state while keeping the
/// value's internal allocations (write-log blocks, hash tables) warm.
pub trait Recycle {
    fn reset(&mut self);
}

/// Free-list pool for high-frequency objects where full reconstruction is
/// too expensive. Values keep their heavy allocations across reuse and are
/// `reset` when taken.
pub struct RecyclePool<T: Recycle + Default> {
    free: Vec<Box<T>>,
}

impl<T: Recycle + Default> RecyclePool<T> {
    pub fn new() -> Self {
        Self { free: Vec::new() }
    }

    pub fn take(&mut self) -> Box<T> {
        match self.free.pop() {
            Some(mut boxed) => {
                boxed.reset();
                boxed
            }
            None => Box::new(T::default()),
        }
    }

    pub fn put_back(&mut self, value: Box<T>) {
        self.free.push(value);
    }

    pub fn idle(&self) -> usize {
        self.free.len()
    }
}

impl<T: Recycle + Default> Default for RecyclePool<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_allocator_bump_and_grow() {
        let mut a = BlockAllocator::new(64, 50);
        assert_eq!(a.block_count(), 1);

        let p0 = a.allocate(16, 8);
        let p1 = a.allocate(16, 8);
        assert_eq!(p1.as_ptr() as usize - p0.as_ptr() as usize, 16);
        assert_eq!(a.block_count(), 1);

        // exhaust the head block
        let _ = a.allocate(48, 8);
        assert_eq!(a.block_count(), 2);

        a.free_all();
        assert_eq!(a.block_count(), 1);

        // head block reusable after free_all
        let p2 = a.allocate(16, 8);
        assert_eq!(p2.as_ptr(), p0.as_ptr());
    }

    #[test]
    fn test_block_allocator_oversized_request() {
        let mut a = BlockAllocator::new(32, 100);
        let p = a.allocate(1024, 16);
        unsafe { p.as_ptr().write_bytes(0xab, 1024) };
        assert_eq!(a.block_count(), 2);
    }

    #[test]
    fn test_pool_reuses_allocations() {
        let mut pool: Pool<Vec<u8>> = Pool::new();
        let a = pool.take(|| vec![1, 2, 3]);
        let addr = &*a as *const Vec<u8>;
        pool.put_back(a);
        let b = pool.take(Vec::new);
        assert_eq!(&*b as *const Vec<u8>, addr);
        assert!(b.is_empty());
    }

    #[derive(Default)]
    struct Counter {
        generation: usize,
        live: bool,
    }

    impl Recycle for Counter {
        fn reset(&mut self) {
            self.generation += 1;
            self.live = false;
        }
    }

    #[test]
    fn test_recycle_pool_resets_instead_of_reconstructing() {
        let mut pool: RecyclePool<Counter> = RecyclePool::new();
        let mut c = pool.take();
        c.live = true;
        pool.put_back(c);

        let c = pool.take();
        assert_eq!(c.generation, 1);
        assert!(!c.live);
    }
}
