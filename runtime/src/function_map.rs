// Copyright 2024 autortfm contributors
// SPDX-License-Identifier: Apache-2.0

//! The process-wide mapping from "open" function pointers to their
//! "closed" (instrumented) counterparts.
//!
//! The hot lookup path never touches the table or its mutex: the companion
//! compiler pass plants a tagged 64-bit word immediately before each
//! instrumented function's machine code, carrying the closed counterpart's
//! address. Only pointers without the tag fall back to the locked
//! open-addressed table, with one level of import-thunk chasing in between.

use crate::error::{Result, RuntimeError};
use lazy_static::lazy_static;
use std::sync::Mutex;

/// Tag in the top 16 bits of the prefix word; the low 48 bits hold the
/// closed function's address.
pub const CLOSED_FUNCTION_TAG: u64 = 0xa273;

const TAG_SHIFT: u32 = 48;
const ADDRESS_MASK: u64 = (1 << TAG_SHIFT) - 1;

/// Builds the prefix word the compiler pass emits (exposed for tests and
/// for embedders generating trampolines at runtime).
pub fn make_prefix_word(closed: usize) -> u64 {
    debug_assert!(closed as u64 & !ADDRESS_MASK == 0);
    (CLOSED_FUNCTION_TAG << TAG_SHIFT) | (closed as u64 & ADDRESS_MASK)
}

/// Open-addressed open→closed pointer table, Fibonacci hashed with linear
/// probing. The zero key is reserved as the empty marker.
pub struct FunctionMap {
    keys: Vec<usize>,
    values: Vec<usize>,
    mask: usize,
    len: usize,
}

const INITIAL_CAPACITY: usize = 256;

impl FunctionMap {
    pub fn new() -> Self {
        Self {
            keys: vec![0; INITIAL_CAPACITY],
            values: vec![0; INITIAL_CAPACITY],
            mask: INITIAL_CAPACITY - 1,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn slot_of(&self, key: usize) -> usize {
        ((key as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15) >> 32) as usize & self.mask
    }

    /// Ensures room for `additional` more mappings without growth during
    /// insertion (registration happens before transactions run; keeping
    /// the resize out of `add` keeps its cost predictable).
    pub fn reserve(&mut self, additional: usize) {
        // Stay under half full.
        let needed = (self.len + additional) * 2;
        if needed <= self.keys.len() {
            return;
        }
        let capacity = needed.next_power_of_two();
        let old_keys = std::mem::replace(&mut self.keys, vec![0; capacity]);
        let old_values = std::mem::replace(&mut self.values, vec![0; capacity]);
        self.mask = capacity - 1;
        self.len = 0;
        for (key, value) in old_keys.into_iter().zip(old_values) {
            if key != 0 {
                self.add(key, value);
            }
        }
    }

    /// Inserts or replaces the mapping for `open`.
    pub fn add(&mut self, open: usize, closed: usize) {
        debug_assert!(open != 0);
        if (self.len + 1) * 2 > self.keys.len() {
            self.reserve(1);
        }
        let mut slot = self.slot_of(open);
        loop {
            if self.keys[slot] == 0 {
                self.keys[slot] = open;
                self.values[slot] = closed;
                self.len += 1;
                return;
            }
            if self.keys[slot] == open {
                self.values[slot] = closed;
                return;
            }
            slot = (slot + 1) & self.mask;
        }
    }

    pub fn get(&self, open: usize) -> Option<usize> {
        let mut slot = self.slot_of(open);
        loop {
            let key = self.keys[slot];
            if key == open {
                return Some(self.values[slot]);
            }
            if key == 0 {
                return None;
            }
            slot = (slot + 1) & self.mask;
        }
    }

    /// Removes a mapping with backward-shift deletion so lookups never need
    /// tombstones.
    pub fn remove(&mut self, open: usize) -> bool {
        let mut slot = self.slot_of(open);
        loop {
            let key = self.keys[slot];
            if key == 0 {
                return false;
            }
            if key == open {
                break;
            }
            slot = (slot + 1) & self.mask;
        }

        self.len -= 1;
        let mut hole = slot;
        let mut probe = (slot + 1) & self.mask;
        while self.keys[probe] != 0 {
            let home = self.slot_of(self.keys[probe]);
            // Shift back entries whose home slot is at or before the hole
            // (cyclic comparison).
            let wrapped = probe.wrapping_sub(home) & self.mask;
            let distance = probe.wrapping_sub(hole) & self.mask;
            if wrapped >= distance {
                self.keys[hole] = self.keys[probe];
                self.values[hole] = self.values[probe];
                hole = probe;
            }
            probe = (probe + 1) & self.mask;
        }
        self.keys[hole] = 0;
        self.values[hole] = 0;
        true
    }
}

impl Default for FunctionMap {
    fn default() -> Self {
        Self::new()
    }
}

lazy_static! {
    static ref MAP: Mutex<FunctionMap> = Mutex::new(FunctionMap::new());
}

fn with_map<R>(f: impl FnOnce(&mut FunctionMap) -> R) -> R {
    match MAP.lock() {
        Ok(mut map) => f(&mut map),
        Err(poisoned) => f(&mut poisoned.into_inner()),
    }
}

/// Registers a batch of open→closed pairs (static-table registration).
pub fn register_pairs(pairs: &[(usize, usize)]) {
    with_map(|map| {
        map.reserve(pairs.len());
        for &(open, closed) in pairs {
            if open != 0 {
                map.add(open, closed);
            }
        }
    });
}

/// Withdraws a previously registered batch.
pub fn unregister_pairs(pairs: &[(usize, usize)]) {
    with_map(|map| {
        for &(open, _) in pairs {
            if open != 0 {
                map.remove(open);
            }
        }
    });
}

/// Reads the tagged prefix word immediately preceding `open`'s machine
/// code, if present.
///
/// # Safety
/// `open` must point at function machine code with at least 8 readable
/// bytes before it (true for all compiler-emitted functions).
unsafe fn prefix_lookup(open: usize) -> Option<usize> {
    let word = std::ptr::read_unaligned((open - 8) as *const u64);
    if word >> TAG_SHIFT == CLOSED_FUNCTION_TAG {
        Some((word & ADDRESS_MASK) as usize)
    } else {
        None
    }
}

/// Resolves one level of import-thunk indirection: a `jmp [rip+disp32]`
/// stub forwards to the address stored in its target slot.
///
/// # Safety
/// `open` must point at readable machine code.
#[cfg(target_arch = "x86_64")]
unsafe fn chase_thunk(open: usize) -> Option<usize> {
    let code = open as *const u8;
    if std::ptr::read_unaligned(code) != 0xff || std::ptr::read_unaligned(code.add(1)) != 0x25 {
        return None;
    }
    let disp = std::ptr::read_unaligned(code.add(2) as *const i32);
    let slot = (open as i64 + 6 + disp as i64) as usize;
    Some(std::ptr::read_unaligned(slot as *const u64) as usize)
}

#[cfg(not(target_arch = "x86_64"))]
unsafe fn chase_thunk(_open: usize) -> Option<usize> {
    None
}

/// Resolves the closed counterpart of `open`: prefix word first, then the
/// locked table, then the table again through one level of import thunk.
///
/// # Safety
/// `open` must point at function machine code with 8 readable bytes
/// before it.
pub unsafe fn lookup(open: usize) -> Result<usize> {
    if let Some(closed) = prefix_lookup(open) {
        return Ok(closed);
    }
    if let Some(closed) = with_map(|map| map.get(open)) {
        return Ok(closed);
    }
    if let Some(target) = chase_thunk(open) {
        if let Some(closed) = prefix_lookup(target) {
            return Ok(closed);
        }
        if let Some(closed) = with_map(|map| map.get(target)) {
            return Ok(closed);
        }
    }
    Err(RuntimeError::MissingClosedFunction(open))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_get_remove() {
        let mut map = FunctionMap::new();
        for i in 1..=1000usize {
            map.add(i * 8, i * 8 + 1);
        }
        assert_eq!(map.len(), 1000);
        for i in 1..=1000usize {
            assert_eq!(map.get(i * 8), Some(i * 8 + 1));
        }
        assert_eq!(map.get(7), None);

        for i in 1..=500usize {
            assert!(map.remove(i * 8));
        }
        assert!(!map.remove(8));
        for i in 501..=1000usize {
            assert_eq!(map.get(i * 8), Some(i * 8 + 1));
        }
        assert_eq!(map.len(), 500);
    }

    #[test]
    fn test_replacing_add() {
        let mut map = FunctionMap::new();
        map.add(0x100, 0x200);
        map.add(0x100, 0x300);
        assert_eq!(map.len(), 1);
        assert_eq!(map.get(0x100), Some(0x300));
    }

    // Lays out [prefix word][8 bytes of "code"] and returns the pointer to
    // the code, as the compiler pass would emit it.
    fn tagged_function(buffer: &mut [u8; 16], closed: usize) -> usize {
        buffer[..8].copy_from_slice(&make_prefix_word(closed).to_ne_bytes());
        buffer.as_ptr() as usize + 8
    }

    #[test]
    fn test_prefix_fast_path_skips_the_table() {
        let mut buffer = [0u8; 16];
        let open = tagged_function(&mut buffer, 0xbeef_0000);
        // never registered anywhere
        assert_eq!(unsafe { lookup(open) }.unwrap(), 0xbeef_0000);
    }

    #[test]
    fn test_untagged_pointer_falls_back_to_the_table() {
        let buffer = [0u8; 16];
        let open = buffer.as_ptr() as usize + 8;

        assert!(matches!(
            unsafe { lookup(open) },
            Err(RuntimeError::MissingClosedFunction(_))
        ));

        register_pairs(&[(open, 0x1234_5678)]);
        assert_eq!(unsafe { lookup(open) }.unwrap(), 0x1234_5678);
        unregister_pairs(&[(open, 0x1234_5678)]);
        assert!(unsafe { lookup(open) }.is_err());
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_import_thunk_is_chased_one_level() {
        // [8 pad][ff 25 disp32][..][slot: 8 bytes]
        let mut buffer = [0u8; 32];
        let base = buffer.as_ptr() as usize;
        let open = base + 8;
        let slot = base + 24;

        let mut target_buffer = [0u8; 16];
        let target = tagged_function(&mut target_buffer, 0xcafe_0000);

        buffer[8] = 0xff;
        buffer[9] = 0x25;
        let disp = (slot as i64 - (open as i64 + 6)) as i32;
        buffer[10..14].copy_from_slice(&disp.to_ne_bytes());
        buffer[24..32].copy_from_slice(&(target as u64).to_ne_bytes());

        assert_eq!(unsafe { lookup(open) }.unwrap(), 0xcafe_0000);
    }
}
