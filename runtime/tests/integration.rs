// Copyright 2024 autortfm contributors
// SPDX-License-Identifier: Apache-2.0

use autortfm::{
    EnabledPrecedence, MemoryValidationLevel, RetryPolicy, TransactionOutcome,
};
use proptest::prelude::*;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

#[ctor::ctor]
/// This function will be run before any of the tests
fn init_logger() {
    let _ = env_logger::builder()
        .is_test(true)
        .filter_level(log::LevelFilter::Debug)
        .try_init();
}

#[test]
fn test_simple_abort_restores_original_value() {
    let mut value = Box::new(7u64);
    let outcome = autortfm::transact(|| {
        autortfm::write(&mut *value, 42);
        autortfm::abort();
    });
    assert_eq!(outcome, TransactionOutcome::AbortedByRequest);
    assert_eq!(*value, 7);
}

#[test]
fn test_commit_is_a_no_op_on_top_of_in_place_writes() {
    let data: Vec<u8> = rand_utils::random::bytestring(256);

    let mut direct = data.clone();
    for (i, byte) in direct.iter_mut().enumerate() {
        *byte = byte.wrapping_add(i as u8);
    }

    let mut transacted = data;
    let outcome = autortfm::transact(|| {
        for i in 0..transacted.len() {
            let next = transacted[i].wrapping_add(i as u8);
            autortfm::write(&mut transacted[i], next);
        }
    });
    assert_eq!(outcome, TransactionOutcome::Committed);
    assert_eq!(transacted, direct);
}

#[test]
fn test_nested_commit_folds_into_outer_abort() {
    let mut value = Box::new(0u64);
    let outcome = autortfm::transact(|| {
        autortfm::write(&mut *value, 1);
        let inner = autortfm::transact(|| autortfm::write(&mut *value, 2));
        assert_eq!(inner, TransactionOutcome::Committed);
        assert_eq!(*value, 2);
        autortfm::abort();
    });
    assert_eq!(outcome, TransactionOutcome::AbortedByRequest);
    assert_eq!(*value, 0);
}

#[test]
fn test_deep_nesting_unwinds_every_level() {
    let mut values = vec![0u64; 8].into_boxed_slice();

    fn descend(values: &mut [u64], depth: usize) -> TransactionOutcome {
        autortfm::transact(|| {
            autortfm::write(&mut values[depth], depth as u64 + 1);
            if depth + 1 < values.len() {
                let inner = descend(values, depth + 1);
                assert_eq!(inner, TransactionOutcome::Committed);
            }
        })
    }

    let outcome = autortfm::transact(|| {
        descend(&mut values, 0);
        autortfm::abort();
    });
    assert_eq!(outcome, TransactionOutcome::AbortedByRequest);
    assert!(values.iter().all(|&v| v == 0));
}

#[test]
fn test_repeat_writes_produce_one_log_entry() {
    let mut value = Box::new(0u64);
    autortfm::transact(|| {
        for i in 0..1000u64 {
            autortfm::write(&mut *value, i);
        }
        assert_eq!(autortfm::logged_write_count(), 1);
        autortfm::abort();
    });
    assert_eq!(*value, 0);
}

#[test]
fn test_new_memory_is_not_logged_and_not_undone() {
    let mut leaked: usize = 0;
    let outcome = autortfm::transact(|| {
        // simulates an allocator reporting a fresh allocation
        let fresh: Box<u64> = Box::new(0);
        let addr = &*fresh as *const u64 as usize;
        autortfm::did_allocate(addr, 8);

        let raw = Box::into_raw(fresh);
        unsafe {
            autortfm::record_write(raw as *const u8, 8);
            *raw = 5;
        }
        assert_eq!(autortfm::logged_write_count(), 0);
        leaked = raw as usize;
        autortfm::abort();
    });
    assert_eq!(outcome, TransactionOutcome::AbortedByRequest);
    // the allocation was never touched by undo; reclaim it
    let fresh = unsafe { Box::from_raw(leaked as *mut u64) };
    assert_eq!(*fresh, 5);
}

#[test]
fn test_transaction_local_stack_writes_are_not_logged() {
    autortfm::transact(|| {
        let local = 3u64;
        unsafe { autortfm::record_write(&local as *const u64 as *const u8, 8) };
        assert_eq!(autortfm::logged_write_count(), 0);
    });
}

#[test]
fn test_task_ordering_on_abort_and_commit() {
    let order = Arc::new(AtomicU32::new(0));
    let push = |order: &Arc<AtomicU32>, digit: u32| {
        let order = order.clone();
        move || {
            let _ = order.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                Some(v * 10 + digit)
            });
        }
    };

    let outcome = autortfm::transact(|| {
        autortfm::on_abort(push(&order, 1));
        autortfm::on_abort(push(&order, 2));
        autortfm::on_abort(push(&order, 3));
        autortfm::abort();
    });
    assert_eq!(outcome, TransactionOutcome::AbortedByRequest);
    assert_eq!(order.load(Ordering::SeqCst), 321);

    order.store(0, Ordering::SeqCst);
    let outcome = autortfm::transact(|| {
        autortfm::on_commit(push(&order, 1));
        autortfm::on_commit(push(&order, 2));
        autortfm::on_commit(push(&order, 3));
    });
    assert_eq!(outcome, TransactionOutcome::Committed);
    assert_eq!(order.load(Ordering::SeqCst), 123);
}

#[test]
fn test_nested_tasks_merge_preserving_order() {
    let order = Arc::new(AtomicU32::new(0));
    let push = |order: &Arc<AtomicU32>, digit: u32| {
        let order = order.clone();
        move || {
            let _ = order.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                Some(v * 10 + digit)
            });
        }
    };

    let outcome = autortfm::transact(|| {
        autortfm::on_abort(push(&order, 1));
        autortfm::transact(|| {
            autortfm::on_abort(push(&order, 2));
        });
        autortfm::on_abort(push(&order, 3));
        autortfm::abort();
    });
    assert_eq!(outcome, TransactionOutcome::AbortedByRequest);
    // reverse registration order across the merged lists
    assert_eq!(order.load(Ordering::SeqCst), 321);
}

#[test]
fn test_keyed_handlers_can_be_withdrawn() {
    let order = Arc::new(AtomicU32::new(0));
    let flag = order.clone();
    let outcome = autortfm::transact(|| {
        let flag = flag.clone();
        autortfm::push_on_abort_keyed(0x10, move || flag.store(1, Ordering::SeqCst)).unwrap();
        assert!(autortfm::pop_on_abort_keyed(0x10).unwrap());
        assert!(!autortfm::pop_on_abort_keyed(0x10).unwrap());
        autortfm::abort();
    });
    assert_eq!(outcome, TransactionOutcome::AbortedByRequest);
    assert_eq!(order.load(Ordering::SeqCst), 0);
}

#[test]
fn test_open_writes_survive_abort_and_closed_nest_writes_do_not() {
    let mut open_value = Box::new(0u64);
    let mut closed_value = Box::new(0u64);
    let open_ptr: *mut u64 = &mut *open_value;

    let outcome = autortfm::transact(|| {
        autortfm::open(|| {
            unsafe { *open_ptr = 1 };
            autortfm::call_closed_nest(|| {
                autortfm::write(&mut *closed_value, 2);
            });
        });
        autortfm::abort();
    });
    assert_eq!(outcome, TransactionOutcome::AbortedByRequest);
    assert_eq!(*open_value, 1);
    assert_eq!(*closed_value, 0);
}

#[test]
fn test_explicit_transaction_commit_and_rollback() {
    let mut value = Box::new(0u64);
    let outcome = autortfm::transact(|| {
        autortfm::start_transaction().unwrap();
        autortfm::write(&mut *value, 1);
        autortfm::commit_transaction().unwrap();

        autortfm::start_transaction().unwrap();
        autortfm::write(&mut *value, 2);
        autortfm::rollback_transaction().unwrap();
        assert_eq!(*value, 1);
        assert_eq!(
            autortfm::transaction_status(),
            Some(TransactionOutcome::AbortedByRequest)
        );
        autortfm::clear_transaction_status();
    });
    assert_eq!(outcome, TransactionOutcome::Committed);
    assert_eq!(*value, 1);
}

#[test]
fn test_transact_inside_commit_task_is_rejected() {
    let observed = Arc::new(AtomicU32::new(u32::MAX));
    let slot = observed.clone();
    let outcome = autortfm::transact(|| {
        let slot = slot.clone();
        autortfm::on_commit(move || {
            let rejected = autortfm::transact(|| {});
            slot.store(
                match rejected {
                    TransactionOutcome::AbortedByTransactInOnCommit => 1,
                    _ => 0,
                },
                Ordering::SeqCst,
            );
        });
    });
    assert_eq!(outcome, TransactionOutcome::Committed);
    assert_eq!(observed.load(Ordering::SeqCst), 1);
}

#[test]
fn test_retry_policy_caps_attempts() {
    autortfm::configure(|config| {
        config.retry_policy = RetryPolicy::RetryOnFailedLockAcquisition { max_attempts: 4 }
    });
    let mut runs = 0u32;
    let outcome = autortfm::transact(|| {
        runs += 1;
        autortfm::retry_after_failed_lock_acquisition();
    });
    assert_eq!(outcome, TransactionOutcome::AbortedByLanguage);
    assert_eq!(runs, 4);
}

#[test]
fn test_memory_validation_clean_open_region_passes() {
    autortfm::configure(|config| {
        config.validation_level = MemoryValidationLevel::Fatal;
        config.validation_throttling = false;
    });
    let mut logged = Box::new(1u64);
    let mut untracked = Box::new(0u64);
    let untracked_ptr: *mut u64 = &mut *untracked;

    let outcome = autortfm::transact(|| {
        autortfm::write(&mut *logged, 2);
        autortfm::open(|| {
            // does not touch the logged location, so the hashes agree
            unsafe { *untracked_ptr = 9 };
        });
    });
    assert_eq!(outcome, TransactionOutcome::Committed);
    assert_eq!(*logged, 2);
    assert_eq!(*untracked, 9);
}

#[test]
fn test_memory_validation_mismatch_warns_and_continues() {
    autortfm::configure(|config| {
        config.validation_level = MemoryValidationLevel::Warn;
        config.validation_throttling = false;
    });
    let mut logged = Box::new(1u64);
    let logged_ptr: *mut u64 = &mut *logged;

    let outcome = autortfm::transact(|| {
        autortfm::write(&mut *logged, 2);
        autortfm::open(|| {
            // open code stomping logged memory: reported, not fatal
            unsafe { *logged_ptr = 77 };
        });
    });
    assert_eq!(outcome, TransactionOutcome::Committed);
    assert_eq!(*logged, 77);
}

#[test]
fn test_memory_validation_allows_closed_nest_writes_while_open() {
    autortfm::configure(|config| {
        config.validation_level = MemoryValidationLevel::Fatal;
        config.validation_throttling = false;
    });
    let mut logged = Box::new(1u64);
    let mut nested = Box::new(0u64);

    let outcome = autortfm::transact(|| {
        autortfm::write(&mut *logged, 2);
        autortfm::open(|| {
            // a closed nest legitimately extends the log while open
            autortfm::call_closed_nest(|| {
                autortfm::write(&mut *nested, 3);
            });
        });
    });
    assert_eq!(outcome, TransactionOutcome::Committed);
    assert_eq!(*logged, 2);
    assert_eq!(*nested, 3);
}

#[test]
fn test_allocator_address_reuse_within_a_transaction() {
    let slab = Box::new([0u8; 64]);
    let addr = slab.as_ptr() as usize;
    let outcome = autortfm::transact(|| {
        autortfm::did_allocate(addr, 64);
        autortfm::did_free(addr, 64);
        // the allocator handing the same block out again is not a double
        // allocation
        autortfm::did_allocate(addr, 64);
    });
    assert_eq!(outcome, TransactionOutcome::Committed);
}

#[test]
fn test_disabled_runtime_runs_bodies_plainly() {
    assert!(autortfm::request_enabled(false, EnabledPrecedence::Set));
    let mut value = Box::new(0u64);
    let outcome = autortfm::transact(|| {
        assert!(!autortfm::is_transactional());
        autortfm::write(&mut *value, 1);
    });
    assert_eq!(outcome, TransactionOutcome::Committed);
    assert_eq!(*value, 1);
    assert!(autortfm::request_enabled(true, EnabledPrecedence::Set));
}

#[test]
fn test_threads_have_independent_transaction_stacks() {
    let handles: Vec<_> = (0..4u64)
        .map(|seed| {
            std::thread::spawn(move || {
                let mut value = Box::new(seed);
                let outcome = autortfm::transact(|| {
                    autortfm::write(&mut *value, seed + 100);
                    if seed % 2 == 0 {
                        autortfm::abort();
                    }
                });
                match outcome {
                    TransactionOutcome::Committed => assert_eq!(*value, seed + 100),
                    TransactionOutcome::AbortedByRequest => assert_eq!(*value, seed),
                    other => panic!("unexpected outcome {other:?}"),
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
}

fn write_ops() -> impl Strategy<Value = Vec<(usize, Vec<u8>)>> {
    prop::collection::vec(
        (0usize..256, prop::collection::vec(any::<u8>(), 1..32)),
        0..24,
    )
}

fn apply(buffer: &mut [u8], offset: usize, data: &[u8]) {
    let offset = offset.min(buffer.len() - 1);
    let end = (offset + data.len()).min(buffer.len());
    let span = end - offset;
    unsafe { autortfm::record_write(buffer[offset..].as_ptr(), span) };
    buffer[offset..end].copy_from_slice(&data[..span]);
}

proptest! {
    /// Abort restores every touched byte, for arbitrary overlapping write
    /// sequences.
    #[test]
    fn prop_abort_round_trips_memory(ops in write_ops()) {
        let mut buffer = vec![0xa5u8; 256];
        let snapshot = buffer.clone();

        let outcome = autortfm::transact(|| {
            for (offset, data) in &ops {
                apply(&mut buffer, *offset, data);
            }
            autortfm::abort();
        });
        prop_assert_eq!(outcome, TransactionOutcome::AbortedByRequest);
        prop_assert_eq!(&buffer, &snapshot);
    }

    /// Commit leaves exactly the state of applying the writes directly.
    #[test]
    fn prop_commit_matches_direct_application(ops in write_ops()) {
        let mut direct = vec![0x5au8; 256];
        for (offset, data) in &ops {
            let offset = (*offset).min(direct.len() - 1);
            let end = (offset + data.len()).min(direct.len());
            direct[offset..end].copy_from_slice(&data[..end - offset]);
        }

        let mut buffer = vec![0x5au8; 256];
        let outcome = autortfm::transact(|| {
            for (offset, data) in &ops {
                apply(&mut buffer, *offset, data);
            }
        });
        prop_assert_eq!(outcome, TransactionOutcome::Committed);
        prop_assert_eq!(&buffer, &direct);
    }
}
