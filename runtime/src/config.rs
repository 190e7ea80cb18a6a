// Copyright 2024 autortfm contributors
// SPDX-License-Identifier: Apache-2.0

//! Runtime configuration.
//!
//! The original design keeps these as namespace-scoped mutable globals.
//! Here they live in an explicit [`RuntimeConfig`] owned by each per-thread
//! context; the process-wide defaults behind the C configuration surface are
//! copied into a context at transaction start. All setters share the same
//! contract as the original globals: apply at safe points only, never while
//! a transaction is in flight on the affected thread.

use std::time::Duration;

/// How aggressively memory validation reacts to a write-hash mismatch.
///
/// A mismatch means open code touched memory the transaction logged, which
/// is a likely future memory-corruption bug in caller code. It is never
/// silently ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MemoryValidationLevel {
    /// No hashing, no checks.
    Disabled,

    /// Log a warning on mismatch and keep going.
    Warn,

    /// Treat a mismatch as an internal error (routed through the error
    /// policy, fatal by default).
    Fatal,
}

impl Default for MemoryValidationLevel {
    fn default() -> Self {
        MemoryValidationLevel::Disabled
    }
}

/// What to do when the runtime itself aborts a transaction because a lock
/// acquisition inside the transaction body failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Surface the abort as a language abort.
    NoRetry,

    /// Re-run the transaction body; invisible in the final outcome if a
    /// later attempt succeeds.
    RetryOnFailedLockAcquisition {
        /// Attempts before giving up and surfacing a language abort.
        max_attempts: usize,
    },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::RetryOnFailedLockAcquisition { max_attempts: 16 }
    }
}

/// The configured action of the single `report_error` funnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorPolicy {
    /// Crash the process with a diagnostic (production default).
    Crash,

    /// Log and continue (soft rollout).
    EnsureAndContinue,

    /// Permanently disable the transactional runtime for the remainder of
    /// the process and re-run the failing transaction as plain code.
    DisableAndRetry,
}

impl Default for ErrorPolicy {
    fn default() -> Self {
        ErrorPolicy::Crash
    }
}

/// Precedence lattice for the runtime enable flag. A request only takes
/// effect if its precedence is at least as strong as whatever set the
/// current value, regardless of call order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EnabledPrecedence {
    Default,
    Set,
    Overridden,
    Forced,
}

/// The runtime enable flag together with who set it.
#[derive(Debug, Clone, Copy)]
pub struct EnabledState {
    enabled: bool,
    precedence: EnabledPrecedence,
}

impl Default for EnabledState {
    fn default() -> Self {
        Self {
            enabled: true,
            precedence: EnabledPrecedence::Default,
        }
    }
}

impl EnabledState {
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Applies `enabled` if `precedence` wins over the current setter.
    /// Returns whether the request took effect.
    pub fn request(&mut self, enabled: bool, precedence: EnabledPrecedence) -> bool {
        if precedence >= self.precedence {
            self.enabled = enabled;
            self.precedence = precedence;
            true
        } else {
            false
        }
    }
}

/// Everything tunable about one context's runtime behavior.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub enabled: EnabledState,
    pub retry_policy: RetryPolicy,
    pub error_policy: ErrorPolicy,
    pub validation_level: MemoryValidationLevel,

    /// Whether the open-hash throttler gates validation hashing at all.
    /// With throttling off every open/close transition hashes.
    pub validation_throttling: bool,

    /// Target fraction of wall-clock time the throttler allows for
    /// validation hashing.
    pub target_fraction_hashing: f64,

    /// How often the throttler flushes human-readable statistics.
    pub stats_period: Duration,

    /// Probability in [0,1] that initialization disables the whole runtime
    /// for this process (canarying). Drawn exactly once.
    pub coin_toss_disable_probability: f64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            enabled: EnabledState::default(),
            retry_policy: RetryPolicy::default(),
            error_policy: ErrorPolicy::default(),
            validation_level: MemoryValidationLevel::default(),
            validation_throttling: true,
            target_fraction_hashing: 0.10,
            stats_period: Duration::from_secs(10),
            coin_toss_disable_probability: 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enabled_precedence() {
        let mut state = EnabledState::default();
        assert!(state.is_enabled());

        assert!(state.request(false, EnabledPrecedence::Set));
        assert!(!state.is_enabled());

        // an overridden request beats a plain set, in either order
        assert!(state.request(true, EnabledPrecedence::Overridden));
        assert!(!state.request(false, EnabledPrecedence::Set));
        assert!(state.is_enabled());

        // forced beats overridden and sticks
        assert!(state.request(false, EnabledPrecedence::Forced));
        assert!(!state.request(true, EnabledPrecedence::Overridden));
        assert!(!state.is_enabled());
    }
}
