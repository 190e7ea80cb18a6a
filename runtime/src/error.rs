// Copyright 2024 autortfm contributors
// SPDX-License-Identifier: Apache-2.0

use crate::transaction::TransactionState;

/// Global result type for fallible runtime internals.
pub type Result<T> = core::result::Result<T, RuntimeError>;

/// The resolution of a call to [`crate::transact`] or to the explicit
/// commit/rollback entry points. This is the only thing callers ever
/// observe about how a transaction ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionOutcome {
    /// The transaction committed; all of its writes are in place.
    Committed,

    /// The user explicitly requested the abort.
    AbortedByRequest,

    /// The runtime decided it could not safely continue, e.g. a missing
    /// open-to-closed function mapping.
    AbortedByLanguage,

    /// An abort that unwound through every enclosing transaction.
    AbortedByCascade,

    /// `transact` was called while the context was running commit tasks.
    AbortedByTransactInOnCommit,

    /// `transact` was called while the context was running abort tasks.
    AbortedByTransactInOnAbort,
}

/// The non-local-exit signal carrying an abort out of a transaction body.
///
/// The original design longjmps from the abort point to the enclosing
/// `Transact` frame. Here the same control transfer rides an unwind: abort
/// points raise an [`Interrupt`] with `panic_any` and the `transact` (or
/// closed-nest) boundary downcasts and consumes it. C frames in between
/// unwind too, which is why the entry points use the `C-unwind` ABI.
///
/// Destructors between an abort point and the transact boundary are NOT a
/// safe place for transactionally relevant side effects; cleanup belongs in
/// commit/abort tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Interrupt {
    #[error("transaction aborted by request")]
    AbortedByRequest,

    #[error("transaction aborted by the language runtime")]
    AbortedByLanguage,

    #[error("cascading abort")]
    Cascade,

    #[error("transaction retried after a failed lock acquisition")]
    FailedLockAcquisition,
}

/// Internal/programming errors. These funnel through the context's
/// `report_error` path whose action is policy controlled.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("illegal transaction state transition ({from:?} -> {to:?})")]
    BadTransition {
        from: TransactionState,
        to: TransactionState,
    },

    #[error("operation requires an active transaction")]
    NotInTransaction,

    #[error("context is bound to another thread")]
    WrongThread,

    #[error("hit set reached its configured maximum capacity")]
    HitSetExhausted,

    #[error("new-memory range overlaps an already tracked range")]
    OverlappingNewMemory,

    #[error("no closed variant registered for open function {0:#x}")]
    MissingClosedFunction(usize),
}
