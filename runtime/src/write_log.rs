// Copyright 2024 autortfm contributors
// SPDX-License-Identifier: Apache-2.0

//! The write log: an append-only, bidirectionally iterable log of
//! `(address, saved bytes, size)` records captured before every logged
//! memory write. Replaying the saved bytes in reverse program order is the
//! undo path; the log is never replayed on commit.
//!
//! Records and payload share fixed-size blocks: payload bytes pack upward
//! from the block base while the fixed-size records pack downward from the
//! block end, so there is no fragmentation between metadata and payload.
//! Blocks come from a [`BlockAllocator`] whose head block survives `reset`.

use crate::alloc::BlockAllocator;
use std::ptr::NonNull;

/// Hard cap on a single record's size; larger writes are split.
pub const MAX_ENTRY_SIZE: usize = 0x7fff;

/// Block size. Must fit one maximum-size record plus its payload.
const BLOCK_BYTES: usize = 64 * 1024;

const RECORD_BYTES: usize = std::mem::size_of::<Record>();

/// The fixed-size half of an entry, stored at the tail end of a block.
#[derive(Clone, Copy)]
struct Record {
    address: usize,
    data: *const u8,
    size: u16,
    no_validation: bool,
}

/// A decoded view of one entry.
pub struct Entry<'a> {
    pub address: usize,
    pub data: &'a [u8],
    pub no_validation: bool,
}

/// Result of hashing the current memory contents of logged entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WriteHash {
    pub hash: u64,
    pub bytes: u64,
    pub records: u64,
}

impl WriteHash {
    /// Folds another hash in, order dependent.
    pub fn combine(&mut self, other: WriteHash) {
        self.hash = self.hash.wrapping_mul(31).wrapping_add(1) ^ other.hash;
        self.bytes += other.bytes;
        self.records += other.records;
    }
}

struct BlockState {
    base: NonNull<u8>,
    /// Payload bytes used from the base upward.
    data_used: usize,
    /// Records packed from the block end downward.
    records: usize,
}

impl BlockState {
    fn new(base: NonNull<u8>) -> Self {
        Self {
            base,
            data_used: 0,
            records: 0,
        }
    }

    fn fits(&self, payload: usize) -> bool {
        self.data_used + payload + (self.records + 1) * RECORD_BYTES <= BLOCK_BYTES
    }

    fn fits_payload(&self, payload: usize) -> bool {
        self.data_used + payload + self.records * RECORD_BYTES <= BLOCK_BYTES
    }

    fn record_ptr(&self, index: usize) -> *mut Record {
        debug_assert!(index < (BLOCK_BYTES / RECORD_BYTES));
        // Records grow downward from the block end.
        unsafe {
            self.base
                .as_ptr()
                .add(BLOCK_BYTES - (index + 1) * RECORD_BYTES)
                .cast::<Record>()
        }
    }

    unsafe fn record(&self, index: usize) -> Record {
        debug_assert!(index < self.records);
        *self.record_ptr(index)
    }

    fn data_frontier(&self) -> *mut u8 {
        unsafe { self.base.as_ptr().add(self.data_used) }
    }
}

/// The undo log of one transaction.
pub struct WriteLog {
    allocator: BlockAllocator,
    blocks: Vec<BlockState>,
    entries: usize,
    data_bytes: usize,
}

impl WriteLog {
    pub fn new() -> Self {
        // Growth percent zero keeps every block exactly BLOCK_BYTES.
        let mut allocator = BlockAllocator::new(BLOCK_BYTES, 0);
        let base = allocator.allocate(BLOCK_BYTES, 16);
        Self {
            allocator,
            blocks: vec![BlockState::new(base)],
            entries: 0,
            data_bytes: 0,
        }
    }

    pub fn entry_count(&self) -> usize {
        self.entries
    }

    pub fn bytes_logged(&self) -> usize {
        self.data_bytes
    }

    pub fn is_empty(&self) -> bool {
        self.entries == 0
    }

    /// Appends a record of the `size` bytes currently at `address`,
    /// splitting into multiple records above [`MAX_ENTRY_SIZE`].
    ///
    /// # Safety
    /// `address..address + size` must be readable. Callers record BEFORE
    /// performing the actual write; the captured bytes are the pre-write
    /// snapshot the undo path restores.
    pub unsafe fn record(&mut self, address: *const u8, size: usize, no_validation: bool) {
        let mut cursor = address;
        let mut remaining = size;
        while remaining > 0 {
            let chunk = remaining.min(MAX_ENTRY_SIZE);
            self.record_chunk(cursor as usize, cursor, chunk, no_validation);
            cursor = cursor.add(chunk);
            remaining -= chunk;
        }
    }

    /// Appends a record whose saved bytes come from `saved` instead of the
    /// live memory at `address`. Used when merging a child log whose
    /// snapshots are already the authoritative pre-write bytes.
    pub fn record_saved(&mut self, address: usize, saved: &[u8], no_validation: bool) {
        let mut offset = 0;
        while offset < saved.len() {
            let chunk = (saved.len() - offset).min(MAX_ENTRY_SIZE);
            unsafe {
                self.record_chunk(
                    address + offset,
                    saved.as_ptr().add(offset),
                    chunk,
                    no_validation,
                )
            };
            offset += chunk;
        }
    }

    /// The one unchecked primitive both paths funnel through.
    ///
    /// # Safety
    /// `src..src + size` must be readable and `size <= MAX_ENTRY_SIZE`.
    unsafe fn record_chunk(&mut self, address: usize, src: *const u8, size: usize, no_validation: bool) {
        debug_assert!(size > 0 && size <= MAX_ENTRY_SIZE);

        // Fold byte-by-byte writers: extend the previous record when this
        // chunk continues it directly at the payload frontier.
        let block = self.blocks.last_mut().expect("write log has no block");
        if block.records > 0 {
            let last_ptr = block.record_ptr(block.records - 1);
            let last = *last_ptr;
            if last.address + last.size as usize == address
                && last.no_validation == no_validation
                && last.size as usize + size <= MAX_ENTRY_SIZE
                && block.fits_payload(size)
            {
                std::ptr::copy_nonoverlapping(src, block.data_frontier(), size);
                (*last_ptr).size = last.size + size as u16;
                block.data_used += size;
                self.data_bytes += size;
                return;
            }
        }

        if !block.fits(size) {
            let base = self.allocator.allocate(BLOCK_BYTES, 16);
            self.blocks.push(BlockState::new(base));
        }

        let block = self.blocks.last_mut().expect("write log has no block");
        let data = block.data_frontier();
        std::ptr::copy_nonoverlapping(src, data, size);
        let record = Record {
            address,
            data,
            size: size as u16,
            no_validation,
        };
        unsafe { block.record_ptr(block.records).write(record) };
        block.data_used += size;
        block.records += 1;
        self.entries += 1;
        self.data_bytes += size;
    }

    /// Iterates entries in program order. The iterator is double ended;
    /// `rev()` gives exact reverse program order for the undo path.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            log: self,
            front_block: 0,
            front_record: 0,
            back_block: self.blocks.len() - 1,
            back_record: self.blocks.last().map(|b| b.records).unwrap_or(0),
            remaining: self.entries,
        }
    }

    /// Hashes the CURRENT memory contents of the first `first_n` entries
    /// (re-read from each logical address, not from the saved bytes).
    /// Entries carrying the no-validation flag are skipped.
    ///
    /// The hash is order dependent across entries: `h = h*31 ^ byte` over
    /// every byte in sequence.
    ///
    /// # Safety
    /// Every logged address range must still be readable.
    pub unsafe fn hash_first(&self, first_n: usize) -> WriteHash {
        let mut out = WriteHash::default();
        for entry in self.iter().take(first_n) {
            if entry.no_validation {
                continue;
            }
            let live = std::slice::from_raw_parts(entry.address as *const u8, entry.data.len());
            out.hash = hash_bytes(out.hash, live);
            out.bytes += live.len() as u64;
            out.records += 1;
        }
        out
    }

    /// # Safety
    /// See [`WriteLog::hash_first`].
    pub unsafe fn hash_all(&self) -> WriteHash {
        self.hash_first(self.entries)
    }

    /// Frees all but the first block; O(blocks).
    pub fn reset(&mut self) {
        self.allocator.free_all();
        let base = self.allocator.allocate(BLOCK_BYTES, 16);
        self.blocks.clear();
        self.blocks.push(BlockState::new(base));
        self.entries = 0;
        self.data_bytes = 0;
    }
}

impl Default for WriteLog {
    fn default() -> Self {
        Self::new()
    }
}

/// Rolling `h = h*31 ^ byte`, with an 8-byte-unrolled inner loop as the
/// fast path. Bit-identical to the plain byte loop.
fn hash_bytes(mut h: u64, bytes: &[u8]) -> u64 {
    let mut chunks = bytes.chunks_exact(8);
    for chunk in &mut chunks {
        h = h.wrapping_mul(31) ^ chunk[0] as u64;
        h = h.wrapping_mul(31) ^ chunk[1] as u64;
        h = h.wrapping_mul(31) ^ chunk[2] as u64;
        h = h.wrapping_mul(31) ^ chunk[3] as u64;
        h = h.wrapping_mul(31) ^ chunk[4] as u64;
        h = h.wrapping_mul(31) ^ chunk[5] as u64;
        h = h.wrapping_mul(31) ^ chunk[6] as u64;
        h = h.wrapping_mul(31) ^ chunk[7] as u64;
    }
    for &b in chunks.remainder() {
        h = h.wrapping_mul(31) ^ b as u64;
    }
    h
}

pub struct Iter<'a> {
    log: &'a WriteLog,
    front_block: usize,
    front_record: usize,
    back_block: usize,
    back_record: usize,
    remaining: usize,
}

impl<'a> Iter<'a> {
    fn entry_at(&self, block: usize, record: usize) -> Entry<'a> {
        let raw = unsafe { self.log.blocks[block].record(record) };
        Entry {
            address: raw.address,
            data: unsafe { std::slice::from_raw_parts(raw.data, raw.size as usize) },
            no_validation: raw.no_validation,
        }
    }
}

impl<'a> Iterator for Iter<'a> {
    type Item = Entry<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        while self.front_record >= self.log.blocks[self.front_block].records {
            self.front_block += 1;
            self.front_record = 0;
        }
        let entry = self.entry_at(self.front_block, self.front_record);
        self.front_record += 1;
        self.remaining -= 1;
        Some(entry)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl<'a> DoubleEndedIterator for Iter<'a> {
    fn next_back(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        while self.back_record == 0 {
            self.back_block -= 1;
            self.back_record = self.log.blocks[self.back_block].records;
        }
        self.back_record -= 1;
        self.remaining -= 1;
        Some(self.entry_at(self.back_block, self.back_record))
    }
}

impl<'a> ExactSizeIterator for Iter<'a> {}
