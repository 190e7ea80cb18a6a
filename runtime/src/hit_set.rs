// Copyright 2024 autortfm contributors
// SPDX-License-Identifier: Apache-2.0

//! A probabilistic membership set deduplicating repeated writes to the same
//! small address range within one transaction.
//!
//! Entries pack `(48-bit address, 15-bit size, 1-bit no-validation flag)`
//! into a single word and are never removed individually; the set only ever
//! grows, gets wholesale `reset`, or is torn down. The hottest instrumented
//! path uses the non-resizing probe so its worst-case latency stays bounded;
//! a resizing variant is the slow-path fallback.

use crate::error::RuntimeError;

/// Probe depth before insertion gives up on the current table.
const PROBE_DEPTH: usize = 32;

const ADDRESS_BITS: u32 = 48;
const SIZE_BITS: u32 = 15;
const ADDRESS_MASK: u64 = (1 << ADDRESS_BITS) - 1;
const SIZE_MASK: u64 = (1 << SIZE_BITS) - 1;

/// `(address, size, no-validation)` packed into one word. The zero word is
/// reserved as the empty slot marker, which is safe because a zero-size
/// entry is never constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HitSetEntry(u64);

impl HitSetEntry {
    /// Largest size a hit-set entry can carry. The record-write path only
    /// consults the set for writes up to 16 bytes, well under this.
    pub const MAX_SIZE: usize = SIZE_MASK as usize;

    pub fn new(address: usize, size: usize, no_validation: bool) -> Self {
        debug_assert!(size > 0 && size <= Self::MAX_SIZE);
        debug_assert!(address as u64 & !ADDRESS_MASK == 0 || cfg!(not(target_pointer_width = "64")));
        let packed = (address as u64 & ADDRESS_MASK)
            | ((size as u64 & SIZE_MASK) << ADDRESS_BITS)
            | ((no_validation as u64) << (ADDRESS_BITS + SIZE_BITS));
        Self(packed)
    }

    pub fn address(&self) -> usize {
        (self.0 & ADDRESS_MASK) as usize
    }

    pub fn size(&self) -> usize {
        ((self.0 >> ADDRESS_BITS) & SIZE_MASK) as usize
    }

    pub fn no_validation(&self) -> bool {
        (self.0 >> (ADDRESS_BITS + SIZE_BITS)) != 0
    }
}

/// Open-addressed, linearly probed set of packed entries.
pub struct HitSet {
    table: Vec<u64>,
    mask: usize,
    len: usize,
    max_capacity: usize,
}

const INITIAL_CAPACITY: usize = 256;
const DEFAULT_MAX_CAPACITY: usize = 1 << 20;

impl HitSet {
    pub fn new() -> Self {
        Self::with_max_capacity(DEFAULT_MAX_CAPACITY)
    }

    pub fn with_max_capacity(max_capacity: usize) -> Self {
        debug_assert!(max_capacity.is_power_of_two());
        Self {
            table: vec![0; INITIAL_CAPACITY],
            mask: INITIAL_CAPACITY - 1,
            len: 0,
            max_capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.table.len()
    }

    fn slot_of(&self, packed: u64) -> usize {
        // Fibonacci hashing spreads the packed word before masking.
        (packed.wrapping_mul(0x9e37_79b9_7f4a_7c15) >> 32) as usize & self.mask
    }

    /// Non-resizing membership-or-insert: `Ok(true)` if the exact entry was
    /// already present, `Ok(false)` if it was inserted, `Err` when the
    /// probe window is full. Never allocates.
    pub fn find_or_try_insert(&mut self, entry: HitSetEntry) -> Result<bool, RuntimeError> {
        let packed = entry.0;
        debug_assert!(packed != 0);
        let start = self.slot_of(packed);
        for probe in 0..PROBE_DEPTH {
            let slot = (start + probe) & self.mask;
            let current = self.table[slot];
            if current == packed {
                return Ok(true);
            }
            if current == 0 {
                self.table[slot] = packed;
                self.len += 1;
                return Ok(false);
            }
        }
        Err(RuntimeError::HitSetExhausted)
    }

    /// Resizing slow path: grows by powers of two until the entry fits or
    /// the configured maximum capacity is reached.
    pub fn find_or_insert(&mut self, entry: HitSetEntry) -> Result<bool, RuntimeError> {
        loop {
            match self.find_or_try_insert(entry) {
                Ok(present) => return Ok(present),
                Err(_) if self.capacity() < self.max_capacity => self.grow(),
                Err(e) => return Err(e),
            }
        }
    }

    fn grow(&mut self) {
        let new_capacity = self.capacity() * 2;
        let old = std::mem::replace(&mut self.table, vec![0; new_capacity]);
        self.mask = new_capacity - 1;
        self.len = 0;
        for packed in old {
            if packed != 0 {
                // Reinsertion into a larger table can itself exhaust a probe
                // window; chain the growth while the cap allows. At the cap
                // the entry is dropped, which only costs a duplicate log
                // record the next time that write repeats.
                if self.find_or_try_insert(HitSetEntry(packed)).is_err()
                    && self.capacity() < self.max_capacity
                {
                    self.grow();
                    let _ = self.find_or_try_insert(HitSetEntry(packed));
                }
            }
        }
    }

    /// Iterates the stored entries in unspecified order (merge path).
    pub fn iter(&self) -> impl Iterator<Item = HitSetEntry> + '_ {
        self.table
            .iter()
            .filter(|&&packed| packed != 0)
            .map(|&packed| HitSetEntry(packed))
    }

    /// Clears all entries, keeping the current capacity.
    pub fn reset(&mut self) {
        self.table.fill(0);
        self.len = 0;
    }
}

impl Default for HitSet {
    fn default() -> Self {
        Self::new()
    }
}
