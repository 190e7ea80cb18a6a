// Copyright 2024 autortfm contributors
// SPDX-License-Identifier: Apache-2.0

//! Thread stack introspection.
//!
//! A transaction never undo-logs writes into its own stack frames: those
//! frames may be gone by abort time and their contents are invisible
//! outside the transaction's lexical scope. The range is bounded below by
//! the thread's stack floor from the platform and above by the frame
//! address captured when the transaction begins.

/// `[low, high)` byte range of stack addresses owned by a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackRange {
    pub low: usize,
    pub high: usize,
}

impl StackRange {
    /// The range owned by a transaction whose innermost frame lives at
    /// `frame`. Falls back to a single-frame window when the platform
    /// cannot report a stack floor.
    pub fn for_current_frame(frame: usize) -> Self {
        let low = thread_stack_low_bound().unwrap_or(frame);
        Self { low, high: frame }
    }

    pub fn contains(&self, address: usize, size: usize) -> bool {
        address >= self.low && address.saturating_add(size) <= self.high
    }
}

/// Lowest valid address of the calling thread's stack, if the platform can
/// tell us.
#[cfg(all(unix, not(target_os = "macos")))]
pub fn thread_stack_low_bound() -> Option<usize> {
    unsafe {
        let mut attr: libc::pthread_attr_t = std::mem::zeroed();
        if libc::pthread_getattr_np(libc::pthread_self(), &mut attr) != 0 {
            return None;
        }
        let mut addr: *mut libc::c_void = std::ptr::null_mut();
        let mut size: libc::size_t = 0;
        let rc = libc::pthread_attr_getstack(&attr, &mut addr, &mut size);
        libc::pthread_attr_destroy(&mut attr);
        if rc != 0 {
            return None;
        }
        Some(addr as usize)
    }
}

#[cfg(target_os = "macos")]
pub fn thread_stack_low_bound() -> Option<usize> {
    unsafe {
        let thread = libc::pthread_self();
        // On this platform the reported stack address is the HIGH end.
        let top = libc::pthread_get_stackaddr_np(thread) as usize;
        let size = libc::pthread_get_stacksize_np(thread);
        Some(top - size)
    }
}

#[cfg(not(unix))]
pub fn thread_stack_low_bound() -> Option<usize> {
    None
}

/// Address of the caller's frame, used as the upper stack bound when a
/// transaction begins.
#[inline(never)]
pub fn current_frame_address() -> usize {
    let probe = 0u8;
    &probe as *const u8 as usize
}
