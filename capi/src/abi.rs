// Copyright 2024 autortfm contributors
// SPDX-License-Identifier: Apache-2.0

//! ABI handshake between the companion compiler pass and this runtime.
//!
//! There is no versioning within a build: the compiler and the runtime
//! must be built from matching sources, and the compiler proves it at
//! startup by handing over the constants it was built with.

use autortfm::function_map::CLOSED_FUNCTION_TAG;
use autortfm::write_log::MAX_ENTRY_SIZE;
use libc::{c_char, c_void};

pub const AUTORTFM_ABI_VERSION_MAJOR: u32 = 1;
pub const AUTORTFM_ABI_VERSION_MINOR: u32 = 0;

/// The constants both sides must agree on. The compiler pass embeds its
/// copy and passes it to [`autortfm_check_abi`](crate::autortfm_check_abi).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutortfmAbiConstants {
    pub version_major: u32,
    pub version_minor: u32,
    /// Tag in the top 16 bits of the prefix word before every
    /// instrumented function.
    pub closed_function_tag: u64,
    /// Largest single write-log record; larger writes split.
    pub max_write_record_size: u64,
}

impl AutortfmAbiConstants {
    pub fn current() -> Self {
        Self {
            version_major: AUTORTFM_ABI_VERSION_MAJOR,
            version_minor: AUTORTFM_ABI_VERSION_MINOR,
            closed_function_tag: CLOSED_FUNCTION_TAG,
            max_write_record_size: MAX_ENTRY_SIZE as u64,
        }
    }
}

/// The callback table the embedder injects at initialization: message
/// sinks for warnings, recoverable errors and fatal errors. All fields are
/// optional; missing sinks fall back to the runtime's own logging.
///
/// `size` carries `size_of` the table as the embedder compiled it, so a
/// table from a mismatched build is rejected instead of misread.
#[repr(C)]
pub struct AutortfmExternApi {
    pub size: usize,
    pub warning: Option<unsafe extern "C" fn(*const c_char)>,
    pub error: Option<unsafe extern "C" fn(*const c_char)>,
    pub fatal: Option<unsafe extern "C" fn(*const c_char)>,
}

/// One open→closed function pair in a compiler-emitted static table.
#[repr(C)]
pub struct AutortfmOpenToClosedMapping {
    pub open: *const c_void,
    pub closed: *const c_void,
}

/// A compiler-emitted static registration table. Tables form an intrusive
/// linked list through `next` so they can chain before the runtime (or any
/// heap) is up; registration walks the whole chain.
#[repr(C)]
pub struct AutortfmOpenToClosedTable {
    pub mappings: *const AutortfmOpenToClosedMapping,
    pub count: usize,
    pub next: *const AutortfmOpenToClosedTable,
}

pub(crate) fn constants_match(theirs: &AutortfmAbiConstants, size: usize) -> bool {
    if size != std::mem::size_of::<AutortfmAbiConstants>() {
        return false;
    }
    *theirs == AutortfmAbiConstants::current()
}
