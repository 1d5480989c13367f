mod common;

use common::*;
use ferrolog_storage::{
    Dependent, LockDuration, LockManager, LockMode, LogBody, Lsn, ResourceId, StoreId,
    TransactionId, TxnState,
};

// ========== COMMIT / ABORT LIFECYCLE ==========

#[test]
fn test_commit_walks_the_full_state_path() {
    let env = create_test_engine();
    let txn = env.engine.begin().unwrap();
    let recorder = RecordingDependent::new();
    let dep: std::sync::Arc<dyn Dependent> = recorder.clone();
    txn.register_dependent(&dep);

    txn.log_insert(update_body(64)).unwrap();
    assert!(txn.first_lsn().valid());
    txn.commit().unwrap();

    assert_eq!(txn.state(), TxnState::Ended);
    assert_eq!(
        recorder.states(),
        vec![
            (TxnState::Active, TxnState::Active), // synthetic on register
            (TxnState::Active, TxnState::Committing),
            (TxnState::Committing, TxnState::FreeingSpace),
            (TxnState::FreeingSpace, TxnState::Ended),
        ]
    );
    // Every observed edge is a legal path through the state machine.
    for (old, new) in recorder.states().iter().skip(1) {
        assert!(old.can_transition_to(*new), "{old:?} -> {new:?}");
    }

    // The freeing-space and end records are in the log.
    let records = env.wal.read_all().unwrap();
    assert!(records.iter().any(|r| matches!(r.body, LogBody::FreeingSpace)));
    assert!(records.iter().any(|r| matches!(r.body, LogBody::End)));
}

#[test]
fn test_read_only_commit_skips_logging() {
    let env = create_test_engine();
    let txn = env.engine.begin().unwrap();
    let recorder = RecordingDependent::new();
    let dep: std::sync::Arc<dyn Dependent> = recorder.clone();
    txn.register_dependent(&dep);

    assert!(txn.is_read_only());
    txn.commit().unwrap();

    assert_eq!(txn.state(), TxnState::Ended);
    assert_eq!(
        recorder.states(),
        vec![
            (TxnState::Active, TxnState::Active),
            (TxnState::Active, TxnState::Ended),
        ]
    );
    assert!(env.wal.read_all().unwrap().is_empty());
}

#[test]
fn test_abort_undoes_and_writes_abort_records() {
    let applier = CountingApplier::new();
    let env = create_test_engine_with_applier(applier.clone());
    let txn = env.engine.begin().unwrap();

    txn.log_insert(update_body(32)).unwrap();
    txn.log_insert(update_body(32)).unwrap();
    txn.abort().unwrap();

    assert_eq!(txn.state(), TxnState::Ended);
    assert_eq!(applier.applied_count(), 2);

    let records = env.wal.read_all().unwrap();
    let compensations = records.iter().filter(|r| r.is_compensation()).count();
    assert_eq!(compensations, 2);
    assert!(records.iter().any(|r| matches!(r.body, LogBody::FreeingSpace)));
    assert!(records.iter().any(|r| matches!(r.body, LogBody::Abort)));
    assert!(env.engine.lookup(txn.tid()).is_none());
}

#[test]
fn test_commit_frees_marked_stores_and_releases_locks() {
    let env = create_test_engine();
    let txn = env.engine.begin().unwrap();
    let tid = txn.tid();

    txn.acquire_lock(ResourceId(42), LockMode::EX, LockDuration::Long)
        .unwrap();
    txn.mark_store_for_deletion(StoreId(7));
    txn.log_insert(update_body(16)).unwrap();
    assert_eq!(txn.stores_to_free(), vec![StoreId(7)]);

    txn.commit().unwrap();
    assert!(txn.stores_to_free().is_empty());
    assert_eq!(
        env.engine.lock_manager().query(tid, ResourceId(42)),
        LockMode::NL
    );
}

// ========== DIRECTORY AND TID WATERMARKS ==========

#[test]
fn test_tids_are_monotonic_and_watermarked() {
    let env = create_test_engine();
    let a = env.engine.begin().unwrap();
    let b = env.engine.begin().unwrap();
    assert!(b.tid() > a.tid());
    assert_eq!(env.engine.oldest_tid(), a.tid());
    assert_eq!(env.engine.youngest_tid(), b.tid());
    assert_eq!(env.engine.count_active(), 2);

    // A recovery-injected tid bumps the watermark for future begins.
    let recovered = env
        .engine
        .begin_recovered(
            TransactionId::with_raw(500),
            TxnState::Active,
            Lsn::NULL,
            Lsn::NULL,
        )
        .unwrap();
    let c = env.engine.begin().unwrap();
    assert!(c.tid().raw() > 500);
    assert_eq!(env.engine.youngest_tid(), c.tid());

    a.commit().unwrap();
    assert_eq!(env.engine.oldest_tid(), b.tid());
    b.commit().unwrap();
    recovered.commit().unwrap();
    c.commit().unwrap();
    assert_eq!(env.engine.count_active(), 0);
    assert!(!env.engine.oldest_tid().is_valid());
}

#[test]
fn test_for_each_visits_in_tid_order_and_tolerates_reentry() {
    let env = create_test_engine();
    let txns: Vec<_> = (0..4).map(|_| env.engine.begin().unwrap()).collect();

    let mut seen = Vec::new();
    env.engine.for_each_active_transaction(|txn| {
        // Visitors may call back into the directory without deadlocking.
        assert!(env.engine.lookup(txn.tid()).is_some());
        seen.push(txn.tid());
    });
    let mut sorted = seen.clone();
    sorted.sort();
    assert_eq!(seen, sorted);
    assert_eq!(seen.len(), 4);

    for txn in txns {
        txn.abort().unwrap();
    }
}

// ========== CHAINING ==========

#[test]
fn test_chain_rearms_the_same_record() {
    let env = create_test_engine();
    let txn = env.engine.begin().unwrap();
    let recorder = RecordingDependent::new();
    let dep: std::sync::Arc<dyn Dependent> = recorder.clone();
    txn.register_dependent(&dep);

    txn.acquire_lock(ResourceId(9), LockMode::EX, LockDuration::Long)
        .unwrap();
    txn.log_insert(update_body(32)).unwrap();
    let old_tid = txn.tid();

    txn.chain(false).unwrap();

    // Fresh tid, reset log cursor, state back to Active.
    let new_tid = txn.tid();
    assert!(new_tid > old_tid);
    assert_eq!(txn.state(), TxnState::Active);
    assert!(txn.is_read_only());
    assert_eq!(txn.reservation().reserved(), 0);

    // The directory now knows the record under the new tid only.
    assert!(env.engine.lookup(old_tid).is_none());
    assert!(env.engine.lookup(new_tid).is_some());

    // Chaining keeps the locks (they are inherited, not released).
    assert_eq!(
        env.engine.lock_manager().query(old_tid, ResourceId(9)),
        LockMode::EX
    );

    // Dependents were re-armed through the chain reset.
    let states = recorder.states();
    assert!(states.contains(&(TxnState::Active, TxnState::Chaining)));
    assert!(states.contains(&(TxnState::Chaining, TxnState::Active)));
    // The reset notification already carries the new tid.
    let reset = recorder
        .transitions()
        .into_iter()
        .find(|(_, old, new)| *old == TxnState::Chaining && *new == TxnState::Active)
        .unwrap();
    assert_eq!(reset.0, new_tid);

    txn.commit().unwrap();
    assert_eq!(txn.state(), TxnState::Ended);
}

// ========== PROTOCOL VIOLATIONS ==========

#[test]
fn test_commit_after_end_is_rejected() {
    let env = create_test_engine();
    let txn = env.engine.begin().unwrap();
    txn.commit().unwrap();
    assert!(txn.commit().is_err());
    assert!(txn.abort().is_err());
}

#[test]
fn test_logging_is_rejected_once_prepared() {
    let env = create_test_engine();
    let txn = env.engine.begin().unwrap();
    txn.log_insert(update_body(8)).unwrap();
    txn.prepare().unwrap();
    assert!(txn.log_insert(update_body(8)).is_err());
    txn.commit().unwrap();
}
