// Copyright 2024 autortfm contributors
// SPDX-License-Identifier: Apache-2.0

//! Software transactional memory runtime for compiler-instrumented code.
//!
//! A transaction intercepts every memory write performed by closed
//! (instrumented) code and snapshots the pre-write bytes into an undo log.
//! Commit is cheap: the writes already happened in place, so the outermost
//! commit only runs deferred commit tasks. Abort replays the undo log in
//! reverse and runs abort tasks last-registered-first. Transactions nest;
//! a nested commit folds its log, new-memory ranges and tasks into the
//! parent, and a cascading abort unwinds every level.
//!
//! One transaction stack per OS thread, no cross-thread isolation: an
//! uncommitted write is an ordinary globally visible store. The only
//! process-wide shared structure is the open→closed function map.
//!
//! The crate exposes three layers: the data structures (write log, hit
//! set, interval tree, throttler, allocators), the per-thread
//! [`context::Context`] orchestrating them, and the free-function surface
//! in [`api`] (re-exported at the root) that instrumented code calls.

pub mod alloc;
pub mod api;
pub mod config;
pub mod context;
pub mod error;
pub mod function_map;
pub mod hit_set;
pub mod interval_tree;
pub mod report;
pub mod stack;
pub mod tasks;
pub mod throttler;
pub mod transaction;
pub mod write_log;

pub use api::{
    abort, abort_by_language, abort_transaction, call_closed_nest, cascading_abort,
    cascading_rollback_transaction, clear_transaction_status, commit_transaction, configure,
    did_allocate, did_free, is_closed, is_transactional, logged_write_count, on_abort, on_commit, open,
    open_with_validation, pop_on_abort_keyed, pop_on_commit_keyed, post_open, pre_open,
    push_on_abort_keyed, push_on_commit_keyed, record_write, record_write_no_validation,
    request_enabled, retry_after_failed_lock_acquisition, rollback_transaction,
    set_post_abort_hook, set_target_fraction_hashing, start_transaction, transact,
    transact_then_open, transaction_depth, transaction_status, with_context, write,
};
pub use config::{
    EnabledPrecedence, ErrorPolicy, MemoryValidationLevel, RetryPolicy, RuntimeConfig,
};
pub use error::{Interrupt, RuntimeError, TransactionOutcome};
