// Copyright 2024 autortfm contributors
// SPDX-License-Identifier: Apache-2.0

//! The fixed `extern "C"` entry points compiler-generated code calls.
//!
//! Everything here is thin dispatch into the runtime crate. Entry points
//! that can unwind (the abort family, and anything invoking a caller
//! callback that may abort) are `extern "C-unwind"`: an abort travels as a
//! Rust panic from the abort intrinsic through the foreign frames back to
//! the `transact` boundary that catches it.

pub mod abi;

use abi::{
    constants_match, AutortfmAbiConstants, AutortfmExternApi, AutortfmOpenToClosedTable,
};
use autortfm::report::{self, Sinks};
use autortfm::{EnabledPrecedence, ErrorPolicy, MemoryValidationLevel, RetryPolicy, TransactionOutcome};
use libc::c_void;

/// A transaction body or callback handed across the ABI.
pub type AutortfmWorkFn = Option<unsafe extern "C-unwind" fn(*mut c_void)>;

pub const AUTORTFM_COMMITTED: u32 = 0;
pub const AUTORTFM_ABORTED_BY_REQUEST: u32 = 1;
pub const AUTORTFM_ABORTED_BY_LANGUAGE: u32 = 2;
pub const AUTORTFM_ABORTED_BY_CASCADE: u32 = 3;
pub const AUTORTFM_ABORTED_BY_TRANSACT_IN_ON_COMMIT: u32 = 4;
pub const AUTORTFM_ABORTED_BY_TRANSACT_IN_ON_ABORT: u32 = 5;
/// Returned by [`autortfm_transaction_status`] when no sticky status is set.
pub const AUTORTFM_STATUS_NONE: u32 = u32::MAX;

fn outcome_code(outcome: TransactionOutcome) -> u32 {
    match outcome {
        TransactionOutcome::Committed => AUTORTFM_COMMITTED,
        TransactionOutcome::AbortedByRequest => AUTORTFM_ABORTED_BY_REQUEST,
        TransactionOutcome::AbortedByLanguage => AUTORTFM_ABORTED_BY_LANGUAGE,
        TransactionOutcome::AbortedByCascade => AUTORTFM_ABORTED_BY_CASCADE,
        TransactionOutcome::AbortedByTransactInOnCommit => {
            AUTORTFM_ABORTED_BY_TRANSACT_IN_ON_COMMIT
        }
        TransactionOutcome::AbortedByTransactInOnAbort => AUTORTFM_ABORTED_BY_TRANSACT_IN_ON_ABORT,
    }
}

// ---- lifecycle -----------------------------------------------------------

/// Installs the embedder's callback table. Returns false (and installs
/// nothing) for a table whose layout does not match this build.
///
/// # Safety
/// `extern_api` must be null or point at a live [`AutortfmExternApi`].
#[no_mangle]
pub unsafe extern "C" fn autortfm_initialize(extern_api: *const AutortfmExternApi) -> bool {
    if extern_api.is_null() {
        return true;
    }
    let table = &*extern_api;
    if table.size != std::mem::size_of::<AutortfmExternApi>() {
        log::error!(
            "extern api table size mismatch: got {}, built with {}",
            table.size,
            std::mem::size_of::<AutortfmExternApi>()
        );
        return false;
    }
    report::install_sinks(Sinks {
        warning: table.warning,
        error: table.error,
        fatal: table.fatal,
    });
    true
}

/// Verifies the compiler pass and this runtime were built from matching
/// sources.
///
/// # Safety
/// `constants` must point at `size` readable bytes.
#[no_mangle]
pub unsafe extern "C" fn autortfm_check_abi(
    constants: *const AutortfmAbiConstants,
    size: usize,
) -> bool {
    if constants.is_null() {
        return false;
    }
    constants_match(&*constants, size)
}

#[no_mangle]
pub extern "C" fn autortfm_is_transactional() -> bool {
    autortfm::is_transactional()
}

#[no_mangle]
pub extern "C" fn autortfm_is_closed() -> bool {
    autortfm::is_closed()
}

// ---- transact family -----------------------------------------------------

/// Runs `instrumented(arg)` transactionally, or `uninstrumented(arg)`
/// plainly when the runtime is disabled.
///
/// # Safety
/// The non-null function pointer must be callable with `arg`.
#[no_mangle]
pub unsafe extern "C-unwind" fn autortfm_transact(
    uninstrumented: AutortfmWorkFn,
    instrumented: AutortfmWorkFn,
    arg: *mut c_void,
) -> u32 {
    if !autortfm::with_context(|cx| cx.config.enabled.is_enabled()) {
        if let Some(open_fn) = uninstrumented {
            open_fn(arg);
        }
        return AUTORTFM_COMMITTED;
    }
    let Some(closed_fn) = instrumented else {
        return AUTORTFM_ABORTED_BY_LANGUAGE;
    };
    outcome_code(autortfm::transact(|| closed_fn(arg)))
}

/// Like [`autortfm_transact`], with the body running in an open region.
///
/// # Safety
/// See [`autortfm_transact`].
#[no_mangle]
pub unsafe extern "C-unwind" fn autortfm_transact_then_open(
    uninstrumented: AutortfmWorkFn,
    arg: *mut c_void,
) -> u32 {
    let Some(open_fn) = uninstrumented else {
        return AUTORTFM_ABORTED_BY_LANGUAGE;
    };
    if !autortfm::with_context(|cx| cx.config.enabled.is_enabled()) {
        open_fn(arg);
        return AUTORTFM_COMMITTED;
    }
    outcome_code(autortfm::transact_then_open(|| open_fn(arg)))
}

/// Commits the current explicit transaction level.
#[no_mangle]
pub extern "C" fn autortfm_commit() -> u32 {
    match autortfm::commit_transaction() {
        Ok(outcome) => outcome_code(outcome),
        Err(e) => {
            autortfm::with_context(|cx| cx.report_error(&e));
            AUTORTFM_ABORTED_BY_LANGUAGE
        }
    }
}

/// Aborts the enclosing transaction; unwinds to the `transact` boundary.
#[no_mangle]
pub extern "C-unwind" fn autortfm_abort() -> ! {
    autortfm::abort()
}

// ---- explicit transaction control ----------------------------------------

#[no_mangle]
pub extern "C" fn autortfm_start_transaction() -> bool {
    match autortfm::start_transaction() {
        Ok(()) => true,
        Err(e) => {
            autortfm::with_context(|cx| cx.report_error(&e));
            false
        }
    }
}

#[no_mangle]
pub extern "C" fn autortfm_commit_transaction() -> u32 {
    autortfm_commit()
}

/// Aborts the current explicit transaction and unwinds to the enclosing
/// `transact` boundary, tearing down intervening levels.
#[no_mangle]
pub extern "C-unwind" fn autortfm_abort_transaction() -> ! {
    autortfm::abort_transaction()
}

/// Aborts the current explicit transaction in place; the caller continues
/// with a sticky aborted status.
#[no_mangle]
pub extern "C" fn autortfm_rollback_transaction() -> bool {
    match autortfm::rollback_transaction() {
        Ok(()) => true,
        Err(e) => {
            autortfm::with_context(|cx| cx.report_error(&e));
            false
        }
    }
}

/// Raises a cascading abort through every enclosing transaction.
#[no_mangle]
pub extern "C-unwind" fn autortfm_cascading_rollback_transaction() -> ! {
    autortfm::cascading_rollback_transaction()
}

#[no_mangle]
pub extern "C" fn autortfm_clear_transaction_status() {
    autortfm::clear_transaction_status();
}

#[no_mangle]
pub extern "C" fn autortfm_transaction_status() -> u32 {
    autortfm::transaction_status()
        .map(outcome_code)
        .unwrap_or(AUTORTFM_STATUS_NONE)
}

// ---- open/closed transitions ---------------------------------------------

/// Runs `work(arg)` as an open region (write interception off).
///
/// # Safety
/// `work` must be callable with `arg`.
#[no_mangle]
pub unsafe extern "C-unwind" fn autortfm_open(work: AutortfmWorkFn, arg: *mut c_void) {
    if let Some(work) = work {
        autortfm::open(|| work(arg));
    }
}

/// [`autortfm_open`] with an explicit validation level for the region:
/// 0 disabled, 1 warn, 2 fatal.
///
/// # Safety
/// `work` must be callable with `arg`.
#[no_mangle]
pub unsafe extern "C-unwind" fn autortfm_open_explicit_validation(
    validation_level: u32,
    work: AutortfmWorkFn,
    arg: *mut c_void,
) {
    let level = match validation_level {
        1 => MemoryValidationLevel::Warn,
        2 => MemoryValidationLevel::Fatal,
        _ => MemoryValidationLevel::Disabled,
    };
    if let Some(work) = work {
        autortfm::open_with_validation(level, || work(arg));
    }
}

/// Runs `work(arg)` as closed code from inside an open region.
///
/// # Safety
/// `work` must be callable with `arg`.
#[no_mangle]
pub unsafe extern "C-unwind" fn autortfm_close(work: AutortfmWorkFn, arg: *mut c_void) {
    if let Some(work) = work {
        autortfm::call_closed_nest(|| work(arg));
    }
}

/// Closed → open transition half, bracketing a foreign open call. `site`
/// is the call site identity (the compiler passes the return address).
#[no_mangle]
pub extern "C" fn autortfm_pre_open(site: *const c_void) {
    autortfm::pre_open(site as usize);
}

/// The matching open → closed half.
#[no_mangle]
pub extern "C" fn autortfm_post_open() {
    autortfm::post_open();
}

// ---- write interception --------------------------------------------------

/// Records the pre-write bytes at `data`; call BEFORE the actual write.
///
/// # Safety
/// `data..data + size` must be readable.
#[no_mangle]
pub unsafe extern "C" fn autortfm_record_write(data: *const c_void, size: usize) {
    autortfm::record_write(data as *const u8, size);
}

macro_rules! sized_record_write {
    ($name:ident, $size:literal) => {
        /// Fixed-size variant of [`autortfm_record_write`].
        ///
        /// # Safety
        #[doc = concat!("`data` must have ", stringify!($size), " readable bytes.")]
        #[no_mangle]
        pub unsafe extern "C" fn $name(data: *const c_void) {
            autortfm::record_write(data as *const u8, $size);
        }
    };
}

sized_record_write!(autortfm_record_write_1, 1);
sized_record_write!(autortfm_record_write_2, 2);
sized_record_write!(autortfm_record_write_4, 4);
sized_record_write!(autortfm_record_write_8, 8);

/// Records only the bytes selected by `mask` (bit i covers `data + i`,
/// low bits first; `size` is capped at 64). Runs of selected bytes become
/// contiguous records.
///
/// # Safety
/// Every selected byte must be readable.
#[no_mangle]
pub unsafe extern "C" fn autortfm_record_write_masked(
    data: *const c_void,
    size: usize,
    mask: u64,
) {
    let size = size.min(64);
    let base = data as *const u8;
    let mut start = None;
    for i in 0..=size {
        let selected = i < size && mask & (1 << i) != 0;
        match (selected, start) {
            (true, None) => start = Some(i),
            (false, Some(from)) => {
                autortfm::record_write(base.add(from), i - from);
                start = None;
            }
            _ => {}
        }
    }
}

/// # Safety
/// `ptr` must be the base of a live allocation of `size` bytes.
#[no_mangle]
pub unsafe extern "C" fn autortfm_did_allocate(ptr: *const c_void, size: usize) {
    autortfm::did_allocate(ptr as usize, size);
}

/// # Safety
/// `ptr` must be the base of the allocation being freed.
#[no_mangle]
pub unsafe extern "C" fn autortfm_did_free(ptr: *const c_void, size: usize) {
    autortfm::did_free(ptr as usize, size);
}

// ---- deferred tasks ------------------------------------------------------

/// Defers `work(arg)` to the outermost commit (runs immediately outside a
/// transaction).
///
/// # Safety
/// `work` and `arg` must stay valid until the transaction resolves.
#[no_mangle]
pub unsafe extern "C-unwind" fn autortfm_on_commit(work: AutortfmWorkFn, arg: *mut c_void) {
    if let Some(work) = work {
        let arg = arg as usize;
        autortfm::on_commit(move || work(arg as *mut c_void));
    }
}

/// Defers `work(arg)` to run if the transaction aborts.
///
/// # Safety
/// `work` and `arg` must stay valid until the transaction resolves.
#[no_mangle]
pub unsafe extern "C-unwind" fn autortfm_on_abort(work: AutortfmWorkFn, arg: *mut c_void) {
    if let Some(work) = work {
        let arg = arg as usize;
        autortfm::on_abort(move || work(arg as *mut c_void));
    }
}

/// Keyed [`autortfm_on_commit`]; the handler can be withdrawn with
/// [`autortfm_pop_on_commit_handler`].
///
/// # Safety
/// See [`autortfm_on_commit`].
#[no_mangle]
pub unsafe extern "C-unwind" fn autortfm_push_on_commit_handler(
    key: *const c_void,
    work: AutortfmWorkFn,
    arg: *mut c_void,
) {
    if let Some(work) = work {
        let arg = arg as usize;
        if let Err(e) =
            autortfm::push_on_commit_keyed(key as usize, move || work(arg as *mut c_void))
        {
            autortfm::with_context(|cx| cx.report_error(&e));
        }
    }
}

#[no_mangle]
pub extern "C" fn autortfm_pop_on_commit_handler(key: *const c_void) -> bool {
    autortfm::pop_on_commit_keyed(key as usize).unwrap_or(false)
}

/// Keyed [`autortfm_on_abort`].
///
/// # Safety
/// See [`autortfm_on_abort`].
#[no_mangle]
pub unsafe extern "C-unwind" fn autortfm_push_on_abort_handler(
    key: *const c_void,
    work: AutortfmWorkFn,
    arg: *mut c_void,
) {
    if let Some(work) = work {
        let arg = arg as usize;
        if let Err(e) =
            autortfm::push_on_abort_keyed(key as usize, move || work(arg as *mut c_void))
        {
            autortfm::with_context(|cx| cx.report_error(&e));
        }
    }
}

#[no_mangle]
pub extern "C" fn autortfm_pop_on_abort_handler(key: *const c_void) -> bool {
    autortfm::pop_on_abort_keyed(key as usize).unwrap_or(false)
}

// ---- function map --------------------------------------------------------

fn collect_table(table: *const AutortfmOpenToClosedTable) -> Vec<(usize, usize)> {
    let mut pairs = Vec::new();
    let mut cursor = table;
    // Walk the intrusive chain of static tables.
    while !cursor.is_null() {
        let t = unsafe { &*cursor };
        if !t.mappings.is_null() {
            for i in 0..t.count {
                let m = unsafe { &*t.mappings.add(i) };
                pairs.push((m.open as usize, m.closed as usize));
            }
        }
        cursor = t.next;
    }
    pairs
}

/// Registers a chain of compiler-emitted open→closed tables.
///
/// # Safety
/// `table` must be null or the head of a valid table chain.
#[no_mangle]
pub unsafe extern "C" fn autortfm_register_open_to_closed_functions(
    table: *const AutortfmOpenToClosedTable,
) {
    autortfm::function_map::register_pairs(&collect_table(table));
}

/// Withdraws a previously registered chain (module unload).
///
/// # Safety
/// See [`autortfm_register_open_to_closed_functions`].
#[no_mangle]
pub unsafe extern "C" fn autortfm_unregister_open_to_closed_functions(
    table: *const AutortfmOpenToClosedTable,
) {
    autortfm::function_map::unregister_pairs(&collect_table(table));
}

/// Resolves the closed counterpart of `open_fn` (prefix word fast path,
/// then the registration table). Null when no mapping exists.
///
/// # Safety
/// `open_fn` must point at function machine code with 8 readable bytes
/// before it.
#[no_mangle]
pub unsafe extern "C" fn autortfm_lookup_closed_function(open_fn: *const c_void) -> *const c_void {
    match autortfm::function_map::lookup(open_fn as usize) {
        Ok(closed) => closed as *const c_void,
        Err(_) => std::ptr::null(),
    }
}

// ---- static local initializer guards -------------------------------------

/// Brackets the lazy-init guard of a function-local static: records the
/// guard word so an abort mid-initialization rolls it back to
/// "uninitialized" instead of leaving it stuck "initializing". The guard
/// is deliberately excluded from memory validation.
///
/// # Safety
/// `guard` must point at the 8-byte initialization guard.
#[no_mangle]
pub unsafe extern "C" fn autortfm_pre_static_local_initializer(guard: *mut c_void) {
    autortfm::record_write_no_validation(guard as *const u8, 8);
}

/// The matching post hook; pairing is enforced by the compiler pass.
///
/// # Safety
/// Must follow a matching [`autortfm_pre_static_local_initializer`].
#[no_mangle]
pub unsafe extern "C" fn autortfm_post_static_local_initializer(_guard: *mut c_void) {}

// ---- configuration surface -----------------------------------------------

/// Requests enabling/disabling the runtime: precedence 0 set, 1 overridden,
/// 2 forced. Returns whether the request took effect.
#[no_mangle]
pub extern "C" fn autortfm_set_enabled(enabled: bool, precedence: u32) -> bool {
    let precedence = match precedence {
        0 => EnabledPrecedence::Set,
        1 => EnabledPrecedence::Overridden,
        _ => EnabledPrecedence::Forced,
    };
    autortfm::request_enabled(enabled, precedence)
}

#[no_mangle]
pub extern "C" fn autortfm_is_enabled() -> bool {
    autortfm::with_context(|cx| cx.config.enabled.is_enabled())
}

/// 0 attempts disables retrying on failed lock acquisition.
#[no_mangle]
pub extern "C" fn autortfm_set_retry_policy(max_attempts: u32) {
    autortfm::configure(|config| {
        config.retry_policy = if max_attempts == 0 {
            RetryPolicy::NoRetry
        } else {
            RetryPolicy::RetryOnFailedLockAcquisition {
                max_attempts: max_attempts as usize,
            }
        };
    });
}

/// 0 crash, 1 ensure-and-continue, 2 disable-and-retry.
#[no_mangle]
pub extern "C" fn autortfm_set_error_policy(policy: u32) -> bool {
    let policy = match policy {
        0 => ErrorPolicy::Crash,
        1 => ErrorPolicy::EnsureAndContinue,
        2 => ErrorPolicy::DisableAndRetry,
        _ => return false,
    };
    autortfm::configure(|config| config.error_policy = policy);
    true
}

/// 0 disabled, 1 warn, 2 fatal.
#[no_mangle]
pub extern "C" fn autortfm_set_memory_validation_level(level: u32) -> bool {
    let level = match level {
        0 => MemoryValidationLevel::Disabled,
        1 => MemoryValidationLevel::Warn,
        2 => MemoryValidationLevel::Fatal,
        _ => return false,
    };
    autortfm::configure(|config| config.validation_level = level);
    true
}

#[no_mangle]
pub extern "C" fn autortfm_set_memory_validation_throttling(enabled: bool) {
    autortfm::configure(|config| config.validation_throttling = enabled);
}

#[no_mangle]
pub extern "C" fn autortfm_set_target_fraction_hashing(target: f64) {
    autortfm::set_target_fraction_hashing(target);
}
