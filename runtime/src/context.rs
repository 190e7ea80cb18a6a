// Copyright 2024 autortfm contributors
// SPDX-License-Identifier: Apache-2.0

//! Per-thread orchestration of the transaction stack.
//!
//! The context owns the stack of live transactions, the pool they are
//! recycled through, the open-hash throttler and the effective
//! configuration. It never runs user callbacks itself: commit/abort tasks
//! and transaction bodies re-enter the runtime through the thread-local
//! accessor in [`crate::api`], so every method here takes a short
//! exclusive borrow and hands task lists back out for the caller to run.
//!
//! A context is bound to exactly one OS thread. Transactions on different
//! threads are fully independent; nothing in here is shared or locked.

use crate::alloc::RecyclePool;
use crate::config::{EnabledPrecedence, MemoryValidationLevel, RuntimeConfig};
use crate::error::{Interrupt, Result, RuntimeError, TransactionOutcome};
use crate::report;
use crate::stack::StackRange;
use crate::tasks::TaskList;
use crate::throttler::OpenHashThrottler;
use crate::transaction::{Transaction, TransactionState};
use crate::write_log::WriteHash;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use std::thread::ThreadId;
use std::time::Instant;

/// Minimum wall-clock slice between throttler adjustment passes.
const THROTTLER_UPDATE_SLICE: std::time::Duration = std::time::Duration::from_millis(100);

/// What the thread is doing right now, as far as the runtime cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextStatus {
    Idle,
    /// Inside one or more transactions, body running.
    OnTrack,
    /// Running commit tasks of a resolved outermost transaction.
    Committing,
    /// Running abort tasks.
    Aborting,
}

/// One un-instrumented region entered from closed code. Remembers the
/// baseline write hash when this entry was sampled for validation.
struct OpenNest {
    /// Index into the transaction stack this nest belongs to.
    depth: usize,
    site: usize,
    baseline: Option<HashBaseline>,
}

/// A validation sample taken on entry to an open region. Entries logged
/// after the sample (closed nests and nested commits run inside the
/// region append legitimately) stay out of the exit comparison, so the
/// per-level log lengths at sampling time are kept alongside the hash.
struct HashBaseline {
    hash: WriteHash,
    entry_counts: Vec<usize>,
}

pub struct Context {
    pub config: RuntimeConfig,
    status: ContextStatus,
    owner: Option<ThreadId>,
    transactions: Vec<Box<Transaction>>,
    pool: RecyclePool<Transaction>,
    /// Scoped begins whose Transaction object has not been materialized
    /// yet; holds the captured frame address per deferred level. A level
    /// stays deferred until something actually needs the object (a write,
    /// a task registration, an open transition), so an empty transaction
    /// costs two counter bumps.
    deferred_frames: Vec<usize>,
    open_nests: Vec<OpenNest>,
    throttler: OpenHashThrottler,
    last_throttler_update: Instant,
    /// Sticky status of the last explicit (non-scoped) rollback, observable
    /// until cleared.
    explicit_status: Option<TransactionOutcome>,
    /// Invoked after a cascading abort before the transaction is re-run
    /// non-transactionally under the disable-and-retry policy.
    post_abort_hook: Option<Box<dyn FnMut()>>,
}

impl Context {
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    pub fn with_config(config: RuntimeConfig) -> Self {
        let mut rng = SmallRng::from_entropy();
        let mut config = config;
        // Canary coin toss, drawn exactly once per context.
        if config.coin_toss_disable_probability > 0.0
            && rng.gen_bool(config.coin_toss_disable_probability.clamp(0.0, 1.0))
        {
            config.enabled.request(false, EnabledPrecedence::Set);
            log::info!("transactional runtime disabled by coin toss");
        }
        let throttler =
            OpenHashThrottler::new(config.target_fraction_hashing, config.stats_period);
        Self {
            config,
            status: ContextStatus::Idle,
            owner: None,
            transactions: Vec::new(),
            pool: RecyclePool::new(),
            deferred_frames: Vec::new(),
            open_nests: Vec::new(),
            throttler,
            last_throttler_update: Instant::now(),
            explicit_status: None,
            post_abort_hook: None,
        }
    }

    pub fn status(&self) -> ContextStatus {
        self.status
    }

    pub fn is_transactional(&self) -> bool {
        !self.transactions.is_empty() || !self.deferred_frames.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        !self.deferred_frames.is_empty()
            || self
                .transactions
                .last()
                .map(|tx| tx.state() == TransactionState::ClosedActive)
                .unwrap_or(false)
    }

    pub fn depth(&self) -> usize {
        self.transactions.len() + self.deferred_frames.len()
    }

    /// Total undo-log entries across the stack (diagnostics).
    pub fn logged_write_count(&self) -> usize {
        self.transactions.iter().map(|tx| tx.write_count()).sum()
    }

    pub fn explicit_status(&self) -> Option<TransactionOutcome> {
        self.explicit_status
    }

    pub fn clear_explicit_status(&mut self) {
        self.explicit_status = None;
    }

    pub fn set_post_abort_hook(&mut self, hook: Option<Box<dyn FnMut()>>) {
        self.post_abort_hook = hook;
    }

    pub fn take_post_abort_hook(&mut self) -> Option<Box<dyn FnMut()>> {
        self.post_abort_hook.take()
    }

    pub fn restore_post_abort_hook(&mut self, hook: Option<Box<dyn FnMut()>>) {
        if self.post_abort_hook.is_none() {
            self.post_abort_hook = hook;
        }
    }

    fn ensure_owner(&mut self) -> Result<()> {
        let current = std::thread::current().id();
        match self.owner {
            None => {
                self.owner = Some(current);
                Ok(())
            }
            Some(owner) if owner == current => Ok(()),
            Some(_) => Err(RuntimeError::WrongThread),
        }
    }

    /// Routes an internal error through the configured policy. Callers
    /// treat a return as permission to degrade (the crash policy never
    /// returns).
    pub fn report_error(&self, error: &RuntimeError) {
        report::internal_error(self.config.error_policy, &error.to_string());
    }

    // ---- begin ----------------------------------------------------------

    /// Opens a new scoped nesting level. The transaction object itself is
    /// deferred until first use.
    pub fn begin_scoped(
        &mut self,
        frame: usize,
    ) -> std::result::Result<(), TransactionOutcome> {
        match self.status {
            ContextStatus::Committing => {
                return Err(TransactionOutcome::AbortedByTransactInOnCommit)
            }
            ContextStatus::Aborting => {
                return Err(TransactionOutcome::AbortedByTransactInOnAbort)
            }
            ContextStatus::Idle | ContextStatus::OnTrack => {}
        }
        if let Err(e) = self.ensure_owner() {
            self.report_error(&e);
            return Err(TransactionOutcome::AbortedByLanguage);
        }
        self.deferred_frames.push(frame);
        self.status = ContextStatus::OnTrack;
        Ok(())
    }

    /// Starts an explicit (non-scoped) transaction as a child of the
    /// current one.
    pub fn begin_explicit(&mut self, frame: usize) -> Result<()> {
        if !self.is_transactional() {
            return Err(RuntimeError::NotInTransaction);
        }
        self.materialize_deferred()?;
        self.push_transaction(false, frame)?;
        Ok(())
    }

    fn push_transaction(&mut self, scoped: bool, frame: usize) -> Result<()> {
        if let Some(current) = self.transactions.last_mut() {
            let to = match current.state() {
                TransactionState::ClosedActive => TransactionState::ClosedInactive,
                TransactionState::OpenActive => TransactionState::OpenInactive,
                other => {
                    return Err(RuntimeError::BadTransition {
                        from: other,
                        to: TransactionState::ClosedInactive,
                    })
                }
            };
            current.transition(to)?;
        }
        let mut tx = self.pool.take();
        tx.begin(
            scoped,
            StackRange::for_current_frame(frame),
            self.config.validation_level,
        )?;
        self.transactions.push(tx);
        Ok(())
    }

    /// Turns every deferred level into a real transaction, outermost
    /// first.
    fn materialize_deferred(&mut self) -> Result<()> {
        let frames: Vec<usize> = self.deferred_frames.drain(..).collect();
        for frame in frames {
            self.push_transaction(true, frame)?;
        }
        Ok(())
    }

    fn reactivate_parent(&mut self) -> Result<()> {
        if let Some(parent) = self.transactions.last_mut() {
            let to = match parent.state() {
                TransactionState::ClosedInactive => TransactionState::ClosedActive,
                TransactionState::OpenInactive => TransactionState::OpenActive,
                other => {
                    return Err(RuntimeError::BadTransition {
                        from: other,
                        to: TransactionState::ClosedActive,
                    })
                }
            };
            parent.transition(to)?;
        }
        Ok(())
    }

    // ---- instrumented operations ----------------------------------------

    fn current(&mut self) -> Result<&mut Transaction> {
        self.materialize_deferred()?;
        self.transactions
            .last_mut()
            .map(|tx| tx.as_mut())
            .ok_or(RuntimeError::NotInTransaction)
    }

    /// The write interception path. Outside a transaction this is a no-op
    /// (the instrumentation may run while the runtime is idle).
    ///
    /// # Safety
    /// `address..address + size` must be readable.
    pub unsafe fn record_write(&mut self, address: *const u8, size: usize, no_validation: bool) {
        if !self.is_transactional() || size == 0 {
            return;
        }
        if let Err(e) = self.materialize_deferred() {
            self.report_error(&e);
            return;
        }

        // For a non-scoped chain the innermost scoped ancestor's stack
        // range also shields the write: an explicit transaction shares its
        // creator's frames.
        let addr = address as usize;
        for tx in self.transactions.iter().rev() {
            if let Some(range) = tx.stack_range() {
                if range.contains(addr, size) {
                    return;
                }
            }
            if tx.is_scoped() {
                break;
            }
        }

        if let Some(tx) = self.transactions.last_mut() {
            if tx.state() == TransactionState::ClosedActive {
                tx.record_write(address, size, no_validation);
            }
        }
    }

    pub fn did_allocate(&mut self, address: usize, size: usize) {
        if !self.is_transactional() || size == 0 {
            return;
        }
        let result = self
            .current()
            .and_then(|tx| tx.did_allocate(address, size));
        if let Err(e) = result {
            self.report_error(&e);
        }
    }

    pub fn did_free(&mut self, address: usize, size: usize) {
        if !self.is_transactional() {
            return;
        }
        if let Ok(tx) = self.current() {
            tx.did_free(address, size);
        }
    }

    /// Registers a commit task on the current transaction. The caller must
    /// have checked [`Context::is_transactional`].
    pub fn on_commit(&mut self, task: impl FnOnce() + 'static) -> Result<()> {
        self.current().map(|tx| tx.on_commit(task))
    }

    pub fn on_abort(&mut self, task: impl FnOnce() + 'static) -> Result<()> {
        self.current().map(|tx| tx.on_abort(task))
    }

    pub fn push_on_commit_keyed(&mut self, key: usize, task: impl FnOnce() + 'static) -> Result<()> {
        self.current().map(|tx| tx.push_on_commit_keyed(key, task))
    }

    pub fn pop_on_commit_keyed(&mut self, key: usize) -> Result<bool> {
        self.current().map(|tx| tx.pop_on_commit_keyed(key))
    }

    pub fn push_on_abort_keyed(&mut self, key: usize, task: impl FnOnce() + 'static) -> Result<()> {
        self.current().map(|tx| tx.push_on_abort_keyed(key, task))
    }

    pub fn pop_on_abort_keyed(&mut self, key: usize) -> Result<bool> {
        self.current().map(|tx| tx.pop_on_abort_keyed(key))
    }

    // ---- open/closed transitions ----------------------------------------

    /// Closed → open: suspends write interception for an un-instrumented
    /// region entered at `site`. Samples a baseline write hash when memory
    /// validation decides to look at this transition.
    pub fn open_region(&mut self, site: usize) -> Result<()> {
        self.open_region_with_validation(site, None)
    }

    /// Like [`Context::open_region`], with an explicit validation level for
    /// this region overriding the transaction's.
    pub fn open_region_with_validation(
        &mut self,
        site: usize,
        level: Option<MemoryValidationLevel>,
    ) -> Result<()> {
        self.materialize_deferred()?;
        let depth = self
            .transactions
            .len()
            .checked_sub(1)
            .ok_or(RuntimeError::NotInTransaction)?;

        let tx = &mut self.transactions[depth];
        tx.transition(TransactionState::OpenActive)?;
        let effective = level.unwrap_or_else(|| tx.validation_level());

        let wants_hash = effective != MemoryValidationLevel::Disabled
            && (!self.config.validation_throttling || self.throttler.should_hash_for(site));
        let baseline = if wants_hash {
            let entry_counts: Vec<usize> =
                self.transactions.iter().map(|tx| tx.write_count()).collect();
            let hash = self.sample_write_hash(site, &entry_counts);
            Some(HashBaseline { hash, entry_counts })
        } else {
            None
        };

        self.open_nests.push(OpenNest {
            depth,
            site,
            baseline,
        });
        Ok(())
    }

    /// Open → closed: resumes write interception and, when this transition
    /// was sampled, compares the write hash against the baseline. A
    /// mismatch means the open region modified transactionally logged
    /// memory.
    pub fn close_region(&mut self) -> Result<()> {
        let nest = self.open_nests.pop().ok_or(RuntimeError::NotInTransaction)?;
        let tx = self
            .transactions
            .last_mut()
            .ok_or(RuntimeError::NotInTransaction)?;
        tx.transition(TransactionState::ClosedActive)?;
        let level = tx.validation_level();

        if let Some(baseline) = nest.baseline {
            let current = self.sample_write_hash(nest.site, &baseline.entry_counts);
            if current.hash != baseline.hash.hash {
                let message = format!(
                    "memory validation mismatch at open region {:#x}: logged writes changed while open ({} record(s), {} byte(s) hashed)",
                    nest.site, current.records, current.bytes
                );
                match level {
                    MemoryValidationLevel::Disabled => {}
                    MemoryValidationLevel::Warn => report::warning(&message),
                    MemoryValidationLevel::Fatal => {
                        report::internal_error(self.config.error_policy, &message)
                    }
                }
            }
        }

        self.maybe_update_throttler();
        Ok(())
    }

    /// Open → closed for the duration of a nested closed call from open
    /// code; [`Context::reexit_closed`] flips back.
    pub fn reenter_closed(&mut self) -> Result<()> {
        let tx = self
            .transactions
            .last_mut()
            .ok_or(RuntimeError::NotInTransaction)?;
        tx.transition(TransactionState::ClosedActive)
    }

    pub fn reexit_closed(&mut self) -> Result<()> {
        let tx = self
            .transactions
            .last_mut()
            .ok_or(RuntimeError::NotInTransaction)?;
        tx.transition(TransactionState::OpenActive)
    }

    /// Hashes the current memory of the first `entry_counts[i]` log entries
    /// of each stack level. Entry and exit of an open region use the same
    /// counts, taken at entry, so only entries that already existed when
    /// the region opened participate in the comparison.
    fn sample_write_hash(&mut self, site: usize, entry_counts: &[usize]) -> WriteHash {
        let start = Instant::now();
        let mut hash = WriteHash::default();
        for (tx, &first_n) in self.transactions.iter().zip(entry_counts) {
            // Safety: logged targets are readable per the record_write
            // contract and the transaction is still live.
            hash.combine(unsafe { tx.hash_writes(first_n) });
        }
        let end = Instant::now();
        self.throttler
            .on_hash(start, end, site, hash.bytes, hash.records);
        hash
    }

    /// Changes the hashing time budget, keeping the live throttler in step
    /// with the configuration.
    pub fn set_target_fraction_hashing(&mut self, target: f64) {
        self.config.target_fraction_hashing = target.clamp(0.0, 1.0);
        self.throttler
            .set_target_fraction(self.config.target_fraction_hashing);
    }

    /// Drops open-nest records belonging to transaction levels that are no
    /// longer on the stack (their regions unwound with the level).
    fn drop_open_nests_of_popped_levels(&mut self) {
        let depth = self.transactions.len();
        self.open_nests.retain(|nest| nest.depth < depth);
    }

    fn maybe_update_throttler(&mut self) {
        let now = Instant::now();
        let dt = now.duration_since(self.last_throttler_update);
        if dt >= THROTTLER_UPDATE_SLICE {
            self.throttler.update(dt);
            self.last_throttler_update = now;
        }
    }

    #[cfg(test)]
    pub(crate) fn throttler_mut(&mut self) -> &mut OpenHashThrottler {
        &mut self.throttler
    }

    // ---- resolution ------------------------------------------------------

    /// Commits the innermost level. Nested commits merge into the parent
    /// and return `None`; the outermost commit returns its commit tasks
    /// and leaves the context in [`ContextStatus::Committing`] until
    /// [`Context::finish_tasks`].
    pub fn resolve_commit(&mut self) -> Result<Option<TaskList>> {
        if !self.deferred_frames.is_empty() {
            self.deferred_frames.pop();
            if !self.is_transactional() {
                self.status = ContextStatus::Idle;
            }
            return Ok(None);
        }

        let mut tx = self
            .transactions
            .pop()
            .ok_or(RuntimeError::NotInTransaction)?;
        self.drop_open_nests_of_popped_levels();

        if let Some(parent) = self.transactions.last_mut() {
            tx.resolve_commit_nested(parent)?;
            self.pool.put_back(tx);
            self.reactivate_parent()?;
            Ok(None)
        } else {
            let tasks = tx.resolve_commit_outermost()?;
            self.pool.put_back(tx);
            self.status = ContextStatus::Committing;
            Ok(Some(tasks))
        }
    }

    /// Aborts from the innermost level down to (and including) the nearest
    /// scoped transaction, undoing writes at each level. Unresolved
    /// explicit children between the abort point and the scoped boundary
    /// are torn down with it.
    ///
    /// Returns one task list per aborted level, innermost first; the
    /// caller runs each in reverse registration order. The context stays in
    /// [`ContextStatus::Aborting`] until [`Context::finish_tasks`].
    pub fn resolve_abort(&mut self) -> Result<Vec<TaskList>> {
        if !self.deferred_frames.is_empty() {
            // Nothing was materialized, so there is nothing to undo.
            self.deferred_frames.pop();
            self.status = ContextStatus::Aborting;
            return Ok(Vec::new());
        }

        let mut lists = Vec::new();
        loop {
            let mut tx = self
                .transactions
                .pop()
                .ok_or(RuntimeError::NotInTransaction)?;
            self.drop_open_nests_of_popped_levels();
            if !tx.is_active() {
                let to = match tx.state() {
                    TransactionState::ClosedInactive => TransactionState::ClosedActive,
                    TransactionState::OpenInactive => TransactionState::OpenActive,
                    other => {
                        return Err(RuntimeError::BadTransition {
                            from: other,
                            to: TransactionState::ClosedActive,
                        })
                    }
                };
                tx.transition(to)?;
            }
            // An abort point inside an open region resolves from there.
            if tx.state() == TransactionState::OpenActive {
                tx.transition(TransactionState::ClosedActive)?;
            }
            let scoped = tx.is_scoped();
            lists.push(tx.resolve_abort()?);
            self.pool.put_back(tx);
            if scoped || self.transactions.is_empty() {
                break;
            }
        }
        self.reactivate_parent()?;
        self.status = ContextStatus::Aborting;
        Ok(lists)
    }

    /// Aborts exactly the current level in place (explicit rollback); the
    /// caller keeps executing afterwards. Returns the level's abort tasks.
    pub fn resolve_rollback_in_place(&mut self) -> Result<TaskList> {
        self.materialize_deferred()?;
        let mut tx = self
            .transactions
            .pop()
            .ok_or(RuntimeError::NotInTransaction)?;
        self.drop_open_nests_of_popped_levels();
        let tasks = tx.resolve_abort()?;
        self.pool.put_back(tx);
        self.reactivate_parent()?;
        self.explicit_status = Some(TransactionOutcome::AbortedByRequest);
        Ok(tasks)
    }

    /// Commits exactly the current level (explicit commit). Same return
    /// contract as [`Context::resolve_commit`].
    pub fn resolve_commit_explicit(&mut self) -> Result<Option<TaskList>> {
        self.materialize_deferred()?;
        self.resolve_commit()
    }

    /// Leaves the Committing/Aborting window after the caller has run the
    /// returned task lists.
    pub fn finish_tasks(&mut self) {
        self.status = if self.is_transactional() {
            ContextStatus::OnTrack
        } else {
            ContextStatus::Idle
        };
    }

    /// Maps an interrupt to the outcome `transact` reports for it.
    pub fn outcome_of(interrupt: Interrupt) -> TransactionOutcome {
        match interrupt {
            Interrupt::AbortedByRequest => TransactionOutcome::AbortedByRequest,
            Interrupt::AbortedByLanguage | Interrupt::FailedLockAcquisition => {
                TransactionOutcome::AbortedByLanguage
            }
            Interrupt::Cascade => TransactionOutcome::AbortedByCascade,
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::current_frame_address;

    fn begin(cx: &mut Context) {
        cx.begin_scoped(current_frame_address()).unwrap();
    }

    #[test]
    fn test_begin_is_deferred_until_first_use() {
        let mut cx = Context::new();
        begin(&mut cx);
        assert!(cx.is_transactional());
        assert!(cx.is_closed());
        assert_eq!(cx.depth(), 1);

        // trivial commit never materializes a transaction
        assert!(cx.resolve_commit().unwrap().is_none());
        assert!(!cx.is_transactional());
        assert_eq!(cx.status(), ContextStatus::Idle);
        assert_eq!(cx.pool.idle(), 0);
    }

    #[test]
    fn test_write_materializes_and_undoes_on_abort() {
        let mut cx = Context::new();
        let mut value = Box::new(7u64);
        begin(&mut cx);

        unsafe { cx.record_write(&*value as *const u64 as *const u8, 8, false) };
        *value = 42;
        assert_eq!(cx.depth(), 1);

        let mut lists = cx.resolve_abort().unwrap();
        for list in &mut lists {
            list.run_reverse();
        }
        cx.finish_tasks();
        assert_eq!(*value, 7);
        assert_eq!(cx.status(), ContextStatus::Idle);
        // the transaction went back to the pool
        assert_eq!(cx.pool.idle(), 1);
    }

    #[test]
    fn test_nested_commit_merges_then_outer_abort_undoes() {
        let mut cx = Context::new();
        let mut value = Box::new(0u64);
        let ptr = &*value as *const u64 as *const u8;

        begin(&mut cx);
        unsafe { cx.record_write(ptr, 8, false) };
        *value = 1;

        begin(&mut cx);
        unsafe { cx.record_write(ptr, 8, false) };
        *value = 2;
        assert!(cx.resolve_commit().unwrap().is_none());

        let mut lists = cx.resolve_abort().unwrap();
        for list in &mut lists {
            list.run_reverse();
        }
        cx.finish_tasks();
        assert_eq!(*value, 0);
    }

    #[test]
    fn test_transact_rejected_while_committing() {
        let mut cx = Context::new();
        begin(&mut cx);
        let _ = cx.on_commit(|| {});
        let tasks = cx.resolve_commit().unwrap();
        assert!(tasks.is_some());

        assert_eq!(
            cx.begin_scoped(current_frame_address()),
            Err(TransactionOutcome::AbortedByTransactInOnCommit)
        );
        cx.finish_tasks();
        assert!(cx.begin_scoped(current_frame_address()).is_ok());
    }

    #[test]
    fn test_explicit_child_is_torn_down_by_scoped_abort() {
        let mut cx = Context::new();
        let mut value = Box::new(5u64);
        let ptr = &*value as *const u64 as *const u8;

        begin(&mut cx);
        unsafe { cx.record_write(ptr, 8, false) };
        *value = 6;

        cx.begin_explicit(current_frame_address()).unwrap();
        unsafe { cx.record_write(ptr, 8, false) };
        *value = 7;

        // the abort pops the unresolved explicit child AND the scoped level
        let lists = cx.resolve_abort().unwrap();
        assert_eq!(lists.len(), 2);
        cx.finish_tasks();
        assert_eq!(*value, 5);
        assert!(!cx.is_transactional());
    }

    #[test]
    fn test_rollback_in_place_sets_sticky_status() {
        let mut cx = Context::new();
        let mut value = Box::new(1u64);
        let ptr = &*value as *const u64 as *const u8;

        begin(&mut cx);
        cx.begin_explicit(current_frame_address()).unwrap();
        unsafe { cx.record_write(ptr, 8, false) };
        *value = 2;

        cx.resolve_rollback_in_place().unwrap();
        assert_eq!(*value, 1);
        assert_eq!(
            cx.explicit_status(),
            Some(TransactionOutcome::AbortedByRequest)
        );
        cx.clear_explicit_status();
        assert!(cx.explicit_status().is_none());

        // the enclosing scoped level is still live and committable
        assert!(cx.is_transactional());
        assert!(cx.resolve_commit().unwrap().is_some());
        cx.finish_tasks();
    }

    #[test]
    fn test_open_close_round_trip() {
        let mut cx = Context::new();
        begin(&mut cx);
        let value = Box::new(3u64);
        unsafe { cx.record_write(&*value as *const u64 as *const u8, 8, false) };

        cx.open_region(0x1000).unwrap();
        assert!(!cx.is_closed());
        // open code calls back into closed code
        cx.reenter_closed().unwrap();
        assert!(cx.is_closed());
        cx.reexit_closed().unwrap();
        cx.close_region().unwrap();
        assert!(cx.is_closed());

        assert!(cx.resolve_commit().unwrap().is_some());
        cx.finish_tasks();
    }

    #[test]
    fn test_closed_nest_writes_while_open_do_not_trip_validation() {
        let mut cx = Context::new();
        cx.config.validation_level = MemoryValidationLevel::Fatal;
        cx.config.validation_throttling = false;
        begin(&mut cx);

        let mut before = Box::new(1u64);
        unsafe { cx.record_write(&*before as *const u64 as *const u8, 8, false) };
        *before = 2;

        cx.open_region(0x2000).unwrap();
        // open code re-enters closed code, which logs a new location
        cx.reenter_closed().unwrap();
        let mut during = Box::new(0u64);
        unsafe { cx.record_write(&*during as *const u64 as *const u8, 8, false) };
        *during = 3;
        cx.reexit_closed().unwrap();
        // a fatal validation mismatch here would take the process down
        cx.close_region().unwrap();

        assert!(cx.resolve_commit().unwrap().is_some());
        cx.finish_tasks();
        assert_eq!(*during, 3);
    }

    #[test]
    fn test_explicit_without_enclosing_transaction_is_rejected() {
        let mut cx = Context::new();
        assert!(matches!(
            cx.begin_explicit(current_frame_address()),
            Err(RuntimeError::NotInTransaction)
        ));
    }
}
