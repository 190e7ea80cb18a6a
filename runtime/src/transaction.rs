// Copyright 2024 autortfm contributors
// SPDX-License-Identifier: Apache-2.0

//! One (possibly nested) transaction: the write log, the skip structures in
//! front of it, the deferred task lists, and the state machine tying them
//! together.
//!
//! A transaction is exclusively owned by the thread whose context pushed
//! it. Nothing here locks; cross-thread isolation is the context's problem.
//! The context also drives resolution: the methods here merge, undo and
//! hand back task lists, while the context decides when tasks actually run
//! and what status the thread is in while they do.

use crate::alloc::Recycle;
use crate::config::MemoryValidationLevel;
use crate::error::{Result, RuntimeError};
use crate::hit_set::{HitSet, HitSetEntry};
use crate::interval_tree::IntervalTree;
use crate::stack::StackRange;
use crate::tasks::TaskList;
use crate::write_log::{WriteHash, WriteLog};

/// Writes at or under this size are deduplicated through the hit set.
const HIT_SET_MAX_WRITE: usize = 16;

/// Where a transaction is in its lifecycle.
///
/// Active means this transaction is the current one; inactive means a
/// descendant is. The open/closed half says which kind of code is running
/// while it is (or was last) active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Uninitialized,
    OpenActive,
    ClosedActive,
    OpenInactive,
    ClosedInactive,
    Done,
}

fn transition_allowed(from: TransactionState, to: TransactionState) -> bool {
    use TransactionState::*;
    matches!(
        (from, to),
        (Uninitialized, OpenActive)
            | (Uninitialized, ClosedActive)
            | (OpenActive, OpenInactive)
            | (OpenActive, ClosedActive)
            | (OpenActive, Done)
            | (ClosedActive, ClosedInactive)
            | (ClosedActive, OpenActive)
            | (ClosedActive, Done)
            | (OpenInactive, OpenActive)
            | (ClosedInactive, ClosedActive)
    )
}

pub struct Transaction {
    state: TransactionState,
    /// Lexical `transact` scope (true) vs explicit start/commit/abort
    /// sequencing (false).
    scoped: bool,
    /// Stack addresses owned by this transaction; writes here are never
    /// undo-logged.
    stack_range: Option<StackRange>,
    validation_level: MemoryValidationLevel,
    write_log: WriteLog,
    hit_set: HitSet,
    new_memory: IntervalTree,
    commit_tasks: TaskList,
    abort_tasks: TaskList,
}

impl Default for Transaction {
    fn default() -> Self {
        Self {
            state: TransactionState::Uninitialized,
            scoped: false,
            stack_range: None,
            validation_level: MemoryValidationLevel::Disabled,
            write_log: WriteLog::new(),
            hit_set: HitSet::new(),
            new_memory: IntervalTree::new(),
            commit_tasks: TaskList::new(),
            abort_tasks: TaskList::new(),
        }
    }
}

impl Recycle for Transaction {
    /// Back to blank while keeping the log blocks and hash table warm.
    fn reset(&mut self) {
        self.state = TransactionState::Uninitialized;
        self.scoped = false;
        self.stack_range = None;
        self.validation_level = MemoryValidationLevel::Disabled;
        self.write_log.reset();
        self.hit_set.reset();
        self.new_memory.reset();
        self.commit_tasks.clear();
        self.abort_tasks.clear();
    }
}

impl Transaction {
    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn is_scoped(&self) -> bool {
        self.scoped
    }

    pub fn is_done(&self) -> bool {
        self.state == TransactionState::Done
    }

    pub fn is_open(&self) -> bool {
        matches!(
            self.state,
            TransactionState::OpenActive | TransactionState::OpenInactive
        )
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self.state,
            TransactionState::OpenActive | TransactionState::ClosedActive
        )
    }

    pub fn validation_level(&self) -> MemoryValidationLevel {
        self.validation_level
    }

    pub fn set_validation_level(&mut self, level: MemoryValidationLevel) {
        self.validation_level = level;
    }

    pub fn stack_range(&self) -> Option<StackRange> {
        self.stack_range
    }

    pub fn write_count(&self) -> usize {
        self.write_log.entry_count()
    }

    /// Moves `self` to `to`, rejecting anything outside the lifecycle
    /// diagram. A rejected transition is a programming error in the caller.
    pub fn transition(&mut self, to: TransactionState) -> Result<()> {
        if !transition_allowed(self.state, to) {
            return Err(RuntimeError::BadTransition {
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }

    /// Brings an [`TransactionState::Uninitialized`] transaction to life.
    pub fn begin(
        &mut self,
        scoped: bool,
        stack_range: StackRange,
        validation_level: MemoryValidationLevel,
    ) -> Result<()> {
        self.transition(TransactionState::ClosedActive)?;
        self.scoped = scoped;
        self.stack_range = Some(stack_range);
        self.validation_level = validation_level;
        Ok(())
    }

    /// Records the pre-write bytes of `address..address + size` unless one
    /// of the skip structures proves logging unnecessary:
    /// transaction-local stack memory, an exact repeat already in the hit
    /// set, or memory allocated during this transaction.
    ///
    /// Callers record BEFORE performing the actual write. The order is
    /// load-bearing: the captured bytes are what undo restores.
    ///
    /// # Safety
    /// `address..address + size` must be readable.
    pub unsafe fn record_write(&mut self, address: *const u8, size: usize, no_validation: bool) {
        if size == 0 {
            return;
        }
        let addr = address as usize;

        if let Some(range) = self.stack_range {
            if range.contains(addr, size) {
                return;
            }
        }

        if size <= HIT_SET_MAX_WRITE {
            let entry = HitSetEntry::new(addr, size, no_validation);
            match self.hit_set.find_or_try_insert(entry) {
                Ok(true) => return,
                Ok(false) => {}
                // Probe window full: take the resizing slow path; if the
                // set is at max capacity, log unconditionally.
                Err(_) => match self.hit_set.find_or_insert(entry) {
                    Ok(true) => return,
                    Ok(false) | Err(_) => {}
                },
            }
        }

        if self.new_memory.contains(addr, size) {
            return;
        }

        self.write_log.record(address, size, no_validation);
    }

    /// Tracks `address..address + size` as allocated during this
    /// transaction. Future writes fully inside it skip the undo log.
    pub fn did_allocate(&mut self, address: usize, size: usize) -> Result<()> {
        if self.new_memory.insert(address, size) {
            Ok(())
        } else {
            Err(RuntimeError::OverlappingNewMemory)
        }
    }

    /// Interception symmetry for `did_allocate`: forgets a freed range so
    /// the allocator can hand the same addresses out again within this
    /// transaction. Only memory allocated during this transaction is
    /// tracked; freeing pre-transaction memory must be deferred to a
    /// commit task by the caller since an abort would need it intact.
    pub fn did_free(&mut self, address: usize, size: usize) {
        if !self.new_memory.remove(address, size) && size > 0 {
            log::trace!(
                "did_free of untracked range {:#x}..{:#x}",
                address,
                address + size
            );
        }
    }

    pub fn on_commit(&mut self, task: impl FnOnce() + 'static) {
        self.commit_tasks.push(task);
    }

    pub fn on_abort(&mut self, task: impl FnOnce() + 'static) {
        self.abort_tasks.push(task);
    }

    pub fn push_on_commit_keyed(&mut self, key: usize, task: impl FnOnce() + 'static) {
        self.commit_tasks.push_keyed(key, task);
    }

    pub fn pop_on_commit_keyed(&mut self, key: usize) -> bool {
        self.commit_tasks.pop_keyed(key)
    }

    pub fn push_on_abort_keyed(&mut self, key: usize, task: impl FnOnce() + 'static) {
        self.abort_tasks.push_keyed(key, task);
    }

    pub fn pop_on_abort_keyed(&mut self, key: usize) -> bool {
        self.abort_tasks.pop_keyed(key)
    }

    /// Hashes the current memory contents of the first `first_n` entries
    /// this transaction has logged (memory validation input, combined
    /// across the nesting chain by the context).
    ///
    /// # Safety
    /// Every logged address range must still be readable.
    pub unsafe fn hash_writes(&self, first_n: usize) -> WriteHash {
        self.write_log.hash_first(first_n)
    }

    /// Folds a committing child into `parent`: write-log entries are
    /// re-deduplicated against the parent's hit set and dropped when they
    /// land in the parent's stack range, new-memory ranges and both task
    /// lists are appended. Nothing is durable at this level; the merged
    /// state resolves when the outermost transaction does.
    pub fn resolve_commit_nested(&mut self, parent: &mut Transaction) -> Result<()> {
        self.transition(TransactionState::Done)?;

        for entry in self.write_log.iter() {
            let size = entry.data.len();
            if let Some(range) = parent.stack_range {
                if range.contains(entry.address, size) {
                    continue;
                }
            }
            if size <= HIT_SET_MAX_WRITE {
                let packed = HitSetEntry::new(entry.address, size, entry.no_validation);
                if let Ok(true) = parent.hit_set.find_or_insert(packed) {
                    // The parent logged this exact range before the child
                    // began; its snapshot is the older, authoritative one.
                    continue;
                }
            }
            parent
                .write_log
                .record_saved(entry.address, entry.data, entry.no_validation);
        }

        parent.new_memory.merge(&self.new_memory);
        parent.commit_tasks.append(&mut self.commit_tasks);
        parent.abort_tasks.append(&mut self.abort_tasks);
        Ok(())
    }

    /// Resolves the outermost commit. The writes already happened in
    /// place, so this only hands back the commit tasks for the context to
    /// run in forward order; pending abort tasks are dropped unrun.
    pub fn resolve_commit_outermost(&mut self) -> Result<TaskList> {
        self.transition(TransactionState::Done)?;
        self.abort_tasks.clear();
        Ok(std::mem::take(&mut self.commit_tasks))
    }

    /// Undoes every logged write (most recent first) and hands back the
    /// abort tasks for the context to run in reverse order. Pending commit
    /// tasks are dropped unrun.
    pub fn resolve_abort(&mut self) -> Result<TaskList> {
        self.transition(TransactionState::Done)?;
        self.commit_tasks.clear();
        // Safety: the logged targets are non-stack, still-mapped memory by
        // the record_write contract.
        unsafe { self.undo_writes() };
        Ok(std::mem::take(&mut self.abort_tasks))
    }

    unsafe fn undo_writes(&mut self) {
        for entry in self.write_log.iter().rev() {
            std::ptr::copy_nonoverlapping(
                entry.data.as_ptr(),
                entry.address as *mut u8,
                entry.data.len(),
            );
        }
    }
}
