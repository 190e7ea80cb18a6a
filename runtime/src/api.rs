// Copyright 2024 autortfm contributors
// SPDX-License-Identifier: Apache-2.0

//! The public surface: free functions over the thread-local context.
//!
//! Closed code re-enters the runtime from arbitrary call depths, so the
//! context lives in a thread local and every entry point takes a short
//! exclusive borrow. No borrow is ever held across user code; transaction
//! bodies and commit/abort tasks run between borrows.
//!
//! Aborts travel as an [`Interrupt`] payload raised with `panic_any` and
//! consumed at the nearest `transact` boundary. Frames between the abort
//! point and the boundary unwind normally, but transactionally relevant
//! cleanup must live in commit/abort tasks, not in destructors: a
//! destructor cannot tell an abort from ordinary control flow.

use crate::config::{EnabledPrecedence, ErrorPolicy, MemoryValidationLevel, RetryPolicy, RuntimeConfig};
use crate::context::Context;
use crate::error::{Interrupt, RuntimeError, TransactionOutcome};
use crate::stack::current_frame_address;
use std::cell::RefCell;
use std::panic::{catch_unwind, panic_any, resume_unwind, AssertUnwindSafe};

thread_local! {
    static CONTEXT: RefCell<Context> = RefCell::new(Context::new());
}

/// Runs `f` under a short exclusive borrow of this thread's context.
/// Must not re-enter the runtime from inside `f`.
pub fn with_context<R>(f: impl FnOnce(&mut Context) -> R) -> R {
    CONTEXT.with(|cell| f(&mut cell.borrow_mut()))
}

/// True while any transaction (materialized or deferred) is on this
/// thread's stack.
pub fn is_transactional() -> bool {
    with_context(|cx| cx.is_transactional())
}

/// True while the innermost transaction is running closed code.
pub fn is_closed() -> bool {
    with_context(|cx| cx.is_closed())
}

pub fn transaction_depth() -> usize {
    with_context(|cx| cx.depth())
}

/// Undo-log entries currently held across this thread's transaction stack.
pub fn logged_write_count() -> usize {
    with_context(|cx| cx.logged_write_count())
}

/// Adjusts this thread's runtime configuration. Safe points only: never
/// call while a transaction is in flight on this thread.
pub fn configure(f: impl FnOnce(&mut RuntimeConfig)) {
    with_context(|cx| f(&mut cx.config));
}

/// Requests enabling/disabling the runtime under the precedence lattice.
/// Returns whether the request took effect.
pub fn request_enabled(enabled: bool, precedence: EnabledPrecedence) -> bool {
    with_context(|cx| cx.config.enabled.request(enabled, precedence))
}

/// Changes the fraction of wall-clock time memory validation may spend
/// hashing. Safe points only.
pub fn set_target_fraction_hashing(target: f64) {
    with_context(|cx| cx.set_target_fraction_hashing(target));
}

/// Installs the hook invoked after a cascading abort, before the
/// transaction is re-run non-transactionally under the disable-and-retry
/// policy.
pub fn set_post_abort_hook(hook: Option<Box<dyn FnMut()>>) {
    with_context(|cx| cx.set_post_abort_hook(hook));
}

// ---- transact ------------------------------------------------------------

/// Runs `body` transactionally and resolves to a commit or an abort.
///
/// With the runtime disabled the body runs plainly and the call reports
/// [`TransactionOutcome::Committed`]. Nested calls push a child
/// transaction; a cascading abort inside a nested call propagates through
/// every enclosing level.
pub fn transact(mut body: impl FnMut()) -> TransactionOutcome {
    let frame = current_frame_address();
    if !with_context(|cx| cx.config.enabled.is_enabled()) {
        body();
        return TransactionOutcome::Committed;
    }
    if let Err(outcome) = with_context(|cx| cx.begin_scoped(frame)) {
        return outcome;
    }

    let mut attempts: usize = 0;
    loop {
        match catch_unwind(AssertUnwindSafe(&mut body)) {
            Ok(()) => match with_context(|cx| cx.resolve_commit()) {
                Ok(None) => return TransactionOutcome::Committed,
                Ok(Some(mut tasks)) => {
                    tasks.run_forward();
                    with_context(|cx| cx.finish_tasks());
                    return TransactionOutcome::Committed;
                }
                Err(e) => {
                    with_context(|cx| cx.report_error(&e));
                    resolve_abort_and_run_tasks();
                    return TransactionOutcome::AbortedByLanguage;
                }
            },
            Err(payload) => {
                let interrupt = match payload.downcast::<Interrupt>() {
                    Ok(boxed) => *boxed,
                    Err(other) => {
                        // A foreign panic tears the transaction down like
                        // an abort, then keeps unwinding.
                        resolve_abort_and_run_tasks();
                        resume_unwind(other);
                    }
                };
                resolve_abort_and_run_tasks();

                match interrupt {
                    Interrupt::AbortedByRequest => return TransactionOutcome::AbortedByRequest,
                    Interrupt::AbortedByLanguage => return TransactionOutcome::AbortedByLanguage,
                    Interrupt::FailedLockAcquisition => {
                        let retry = with_context(|cx| match cx.config.retry_policy {
                            RetryPolicy::RetryOnFailedLockAcquisition { max_attempts } => {
                                attempts + 1 < max_attempts
                            }
                            RetryPolicy::NoRetry => false,
                        });
                        if !retry {
                            return TransactionOutcome::AbortedByLanguage;
                        }
                        attempts += 1;
                        match with_context(|cx| cx.begin_scoped(frame)) {
                            Ok(()) => continue,
                            Err(outcome) => return outcome,
                        }
                    }
                    Interrupt::Cascade => {
                        if with_context(|cx| cx.is_transactional()) {
                            // Nested boundary: this level is resolved, the
                            // cascade keeps unwinding.
                            panic_any(Interrupt::Cascade);
                        }
                        let degrade = with_context(|cx| {
                            cx.config.error_policy == ErrorPolicy::DisableAndRetry
                        });
                        if !degrade {
                            return TransactionOutcome::AbortedByCascade;
                        }
                        // Fail open: disable the runtime for the rest of
                        // the process and re-run plainly.
                        with_context(|cx| {
                            cx.config
                                .enabled
                                .request(false, EnabledPrecedence::Overridden);
                        });
                        log::warn!(
                            "cascading abort under disable-and-retry: runtime disabled, re-running non-transactionally"
                        );
                        let mut hook = with_context(|cx| cx.take_post_abort_hook());
                        if let Some(hook) = hook.as_mut() {
                            hook();
                        }
                        with_context(|cx| cx.restore_post_abort_hook(hook));
                        body();
                        return TransactionOutcome::Committed;
                    }
                }
            }
        }
    }
}

/// [`transact`], with the body running in an open region.
pub fn transact_then_open(mut body: impl FnMut()) -> TransactionOutcome {
    transact(move || open(&mut body))
}

fn resolve_abort_and_run_tasks() {
    match with_context(|cx| cx.resolve_abort()) {
        Ok(mut lists) => {
            for list in &mut lists {
                list.run_reverse();
            }
        }
        Err(e) => with_context(|cx| cx.report_error(&e)),
    }
    with_context(|cx| cx.finish_tasks());
}

// ---- aborting ------------------------------------------------------------

/// Aborts the enclosing transaction at the user's request. Unwinds to the
/// nearest `transact` boundary; never returns.
pub fn abort() -> ! {
    panic_any(Interrupt::AbortedByRequest)
}

/// Aborts because the runtime cannot safely continue.
pub fn abort_by_language() -> ! {
    panic_any(Interrupt::AbortedByLanguage)
}

/// Aborts every enclosing transaction on this thread.
pub fn cascading_abort() -> ! {
    panic_any(Interrupt::Cascade)
}

/// Aborts so the `transact` loop can re-run the body under the configured
/// retry policy (lock-contention path).
pub fn retry_after_failed_lock_acquisition() -> ! {
    panic_any(Interrupt::FailedLockAcquisition)
}

// ---- open/closed regions -------------------------------------------------

/// Runs `f` as an open region: write interception off, memory validation
/// sampling this call site around it. Outside a transaction this is a
/// plain call.
#[track_caller]
pub fn open<R>(f: impl FnOnce() -> R) -> R {
    let site = std::panic::Location::caller() as *const _ as usize;
    open_at(site, None, f)
}

/// [`open`] with an explicit validation level for this region.
#[track_caller]
pub fn open_with_validation<R>(level: MemoryValidationLevel, f: impl FnOnce() -> R) -> R {
    let site = std::panic::Location::caller() as *const _ as usize;
    open_at(site, Some(level), f)
}

fn open_at<R>(site: usize, level: Option<MemoryValidationLevel>, f: impl FnOnce() -> R) -> R {
    if !is_transactional() {
        return f();
    }
    if let Err(e) = with_context(|cx| cx.open_region_with_validation(site, level)) {
        with_context(|cx| cx.report_error(&e));
        return f();
    }
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => {
            if let Err(e) = with_context(|cx| cx.close_region()) {
                with_context(|cx| cx.report_error(&e));
            }
            result
        }
        // The enclosing transaction is unwinding; its open-nest records go
        // with it.
        Err(payload) => resume_unwind(payload),
    }
}

/// Closed → open transition half, for callers that cannot use the scoped
/// [`open`] (paired hooks around a foreign open call).
pub fn pre_open(site: usize) {
    if !is_transactional() {
        return;
    }
    if let Err(e) = with_context(|cx| cx.open_region(site)) {
        with_context(|cx| cx.report_error(&e));
    }
}

/// The matching open → closed half.
pub fn post_open() {
    if !is_transactional() {
        return;
    }
    if let Err(e) = with_context(|cx| cx.close_region()) {
        with_context(|cx| cx.report_error(&e));
    }
}

/// Runs `f` as closed code from inside an open region, restoring the open
/// state afterwards. An abort inside `f` unwinds through this boundary to
/// the enclosing `transact`.
pub fn call_closed_nest<R>(f: impl FnOnce() -> R) -> R {
    if !is_transactional() {
        return f();
    }
    if let Err(e) = with_context(|cx| cx.reenter_closed()) {
        with_context(|cx| cx.report_error(&e));
        return f();
    }
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => {
            if let Err(e) = with_context(|cx| cx.reexit_closed()) {
                with_context(|cx| cx.report_error(&e));
            }
            result
        }
        Err(payload) => resume_unwind(payload),
    }
}

// ---- write interception --------------------------------------------------

/// Records the pre-write bytes at `address` so an abort can restore them.
/// Call BEFORE performing the actual write. No-op outside a transaction or
/// in open code.
///
/// # Safety
/// `address..address + size` must be readable.
#[inline]
pub unsafe fn record_write(address: *const u8, size: usize) {
    with_context(|cx| cx.record_write(address, size, false));
}

/// [`record_write`] for memory deliberately shared with open code; skipped
/// by memory validation.
///
/// # Safety
/// Same as [`record_write`].
#[inline]
pub unsafe fn record_write_no_validation(address: *const u8, size: usize) {
    with_context(|cx| cx.record_write(address, size, true));
}

/// Transactional assignment: records the destination, then writes.
#[inline]
pub fn write<T: Copy>(dest: &mut T, value: T) {
    unsafe {
        record_write(dest as *mut T as *const u8, std::mem::size_of::<T>());
    }
    *dest = value;
}

/// Reports memory newly allocated inside the transaction; writes fully
/// inside it are exempt from undo logging.
pub fn did_allocate(address: usize, size: usize) {
    with_context(|cx| cx.did_allocate(address, size));
}

/// Reports a free. Frees of pre-transaction memory must be deferred to a
/// commit task by the caller; an abort needs the memory intact.
pub fn did_free(address: usize, size: usize) {
    with_context(|cx| cx.did_free(address, size));
}

// ---- deferred tasks ------------------------------------------------------

/// Defers `task` to the outermost commit. Outside a transaction it runs
/// immediately.
pub fn on_commit(task: impl FnOnce() + 'static) {
    if !is_transactional() {
        task();
        return;
    }
    if let Err(e) = with_context(|cx| cx.on_commit(task)) {
        with_context(|cx| cx.report_error(&e));
    }
}

/// Defers `task` to run if the transaction aborts. Outside a transaction
/// it is dropped: with no transaction there is nothing to abort.
pub fn on_abort(task: impl FnOnce() + 'static) {
    if !is_transactional() {
        return;
    }
    if let Err(e) = with_context(|cx| cx.on_abort(task)) {
        with_context(|cx| cx.report_error(&e));
    }
}

pub fn push_on_commit_keyed(key: usize, task: impl FnOnce() + 'static) -> Result<(), RuntimeError> {
    with_context(|cx| cx.push_on_commit_keyed(key, task))
}

pub fn pop_on_commit_keyed(key: usize) -> Result<bool, RuntimeError> {
    with_context(|cx| cx.pop_on_commit_keyed(key))
}

pub fn push_on_abort_keyed(key: usize, task: impl FnOnce() + 'static) -> Result<(), RuntimeError> {
    with_context(|cx| cx.push_on_abort_keyed(key, task))
}

pub fn pop_on_abort_keyed(key: usize) -> Result<bool, RuntimeError> {
    with_context(|cx| cx.pop_on_abort_keyed(key))
}

// ---- explicit transaction control ----------------------------------------

/// Starts an explicit (non-scoped) transaction as a child of the current
/// one. Must already be inside a transaction.
pub fn start_transaction() -> Result<(), RuntimeError> {
    let frame = current_frame_address();
    with_context(|cx| cx.begin_explicit(frame))
}

/// Commits the current explicit transaction level.
pub fn commit_transaction() -> Result<TransactionOutcome, RuntimeError> {
    match with_context(|cx| cx.resolve_commit_explicit())? {
        None => Ok(TransactionOutcome::Committed),
        Some(mut tasks) => {
            tasks.run_forward();
            with_context(|cx| cx.finish_tasks());
            Ok(TransactionOutcome::Committed)
        }
    }
}

/// Aborts the current explicit transaction and unwinds to the enclosing
/// `transact` boundary (tearing down intervening levels).
pub fn abort_transaction() -> ! {
    panic_any(Interrupt::AbortedByRequest)
}

/// Aborts the current explicit transaction in place; execution continues
/// after the call with a sticky aborted status, observable via
/// [`transaction_status`] until [`clear_transaction_status`].
pub fn rollback_transaction() -> Result<(), RuntimeError> {
    let mut tasks = with_context(|cx| cx.resolve_rollback_in_place())?;
    tasks.run_reverse();
    Ok(())
}

/// Raises a cascading abort: every enclosing transaction on this thread
/// unwinds.
pub fn cascading_rollback_transaction() -> ! {
    panic_any(Interrupt::Cascade)
}

pub fn transaction_status() -> Option<TransactionOutcome> {
    with_context(|cx| cx.explicit_status())
}

pub fn clear_transaction_status() {
    with_context(|cx| cx.clear_explicit_status());
}
