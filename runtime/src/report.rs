// Copyright 2024 autortfm contributors
// SPDX-License-Identifier: Apache-2.0

//! The single funnel for internal errors and validation mismatches.
//!
//! Embedders inject their own warning/fatal sinks at initialization; until
//! then (and in tests) everything lands on the `log` facade. Only the
//! `Crash` policy ever terminates the process, and only through here.

use crate::config::ErrorPolicy;
use lazy_static::lazy_static;
use std::os::raw::c_char;
use std::sync::Mutex;

/// Message sinks injected by the embedding process. The pointers receive a
/// NUL-terminated UTF-8 message and must not retain it past the call.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sinks {
    pub warning: Option<unsafe extern "C" fn(*const c_char)>,
    pub error: Option<unsafe extern "C" fn(*const c_char)>,
    pub fatal: Option<unsafe extern "C" fn(*const c_char)>,
}

lazy_static! {
    static ref SINKS: Mutex<Sinks> = Mutex::new(Sinks::default());
}

/// Installs the embedder's sinks, replacing any previous set.
pub fn install_sinks(sinks: Sinks) {
    match SINKS.lock() {
        Ok(mut slot) => *slot = sinks,
        Err(poisoned) => *poisoned.into_inner() = sinks,
    }
}

fn sinks() -> Sinks {
    match SINKS.lock() {
        Ok(slot) => *slot,
        Err(poisoned) => *poisoned.into_inner(),
    }
}

fn send(sink: Option<unsafe extern "C" fn(*const c_char)>, message: &str) -> bool {
    if let Some(f) = sink {
        let owned = std::ffi::CString::new(message.replace('\0', "?"))
            .unwrap_or_else(|_| std::ffi::CString::default());
        unsafe { f(owned.as_ptr()) };
        true
    } else {
        false
    }
}

/// A soft diagnostic that must not be silently dropped.
pub fn warning(message: &str) {
    if !send(sinks().warning, message) {
        log::warn!("{message}");
    }
}

/// Terminates the process through the embedder's fatal sink when one is
/// installed. The sink is expected not to return; if it does, or none is
/// installed, the process aborts.
pub fn fatal(message: &str) -> ! {
    send(sinks().fatal, message);
    log::error!("fatal: {message}");
    std::process::abort();
}

/// Reports an internal invariant violation under `policy`.
///
/// Returns only for the non-crashing policies; the caller decides whether
/// `DisableAndRetry` additionally tears the current transaction down.
pub fn internal_error(policy: ErrorPolicy, message: &str) {
    match policy {
        ErrorPolicy::Crash => fatal(message),
        ErrorPolicy::EnsureAndContinue | ErrorPolicy::DisableAndRetry => {
            if !send(sinks().error, message) {
                log::error!("{message}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static WARNINGS: AtomicUsize = AtomicUsize::new(0);

    unsafe extern "C" fn count_warning(_message: *const c_char) {
        WARNINGS.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn test_installed_sink_receives_warnings() {
        install_sinks(Sinks {
            warning: Some(count_warning),
            ..Sinks::default()
        });
        warning("probe");
        assert!(WARNINGS.load(Ordering::SeqCst) >= 1);
        install_sinks(Sinks::default());
    }

    #[test]
    fn test_ensure_policy_does_not_terminate() {
        internal_error(ErrorPolicy::EnsureAndContinue, "survivable");
    }
}
