mod common;

use common::*;
use ferrolog_storage::{LogDevice, Lsn, TxnState};

// ========== SAVEPOINTS ==========

#[test]
fn test_rollback_stops_exactly_at_the_savepoint() {
    let applier = CountingApplier::new();
    let env = create_test_engine_with_applier(applier.clone());
    let txn = env.engine.begin().unwrap();

    txn.log_insert(update_body(16)).unwrap();
    let r2 = txn.log_insert(update_body(16)).unwrap();
    let savepoint = txn.save_point().unwrap();
    assert_eq!(savepoint, r2);

    let r3 = txn.log_insert(update_body(16)).unwrap();
    let r4 = txn.log_insert(update_body(16)).unwrap();

    txn.rollback_to(savepoint).unwrap();

    // Only the records after the savepoint were undone, newest first.
    assert_eq!(applier.applied.lock().unwrap().clone(), vec![r4, r3]);
    assert_eq!(txn.undo_nxt(), r2);

    // A second rollback to the same savepoint has nothing left to undo.
    txn.rollback_to(savepoint).unwrap();
    assert_eq!(applier.applied_count(), 2);

    txn.abort().unwrap();
    // The final abort undid the two records before the savepoint.
    assert_eq!(applier.applied_count(), 4);
}

#[test]
fn test_full_rollback_reaches_log_start() {
    let applier = CountingApplier::new();
    let env = create_test_engine_with_applier(applier.clone());
    let txn = env.engine.begin().unwrap();

    for _ in 0..3 {
        txn.log_insert(update_body(8)).unwrap();
    }
    txn.rollback_to(Lsn::NULL).unwrap();

    assert_eq!(applier.applied_count(), 3);
    assert!(!txn.undo_nxt().valid());
    txn.abort().unwrap();
    // Nothing further to undo during the abort.
    assert_eq!(applier.applied_count(), 3);
}

// ========== TOP-LEVEL ACTIONS ==========

#[test]
fn test_top_level_action_compensates_once() {
    let applier = CountingApplier::new();
    let env = create_test_engine_with_applier(applier.clone());
    let txn = env.engine.begin().unwrap();

    let anchor = txn.begin_top_level_action().unwrap();
    assert!(!anchor.lsn().valid()); // nothing logged yet
    txn.log_insert(update_body(16)).unwrap();
    txn.log_insert(update_body(16)).unwrap();
    txn.end_top_level_action(true).unwrap();

    // The release patched the newest record in place: exactly one
    // compensation, no extra record.
    let records = env.wal.read_all().unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records.iter().filter(|r| r.is_compensation()).count(), 1);

    // The action's effects are already compensated away, so the abort has
    // nothing to undo.
    txn.abort().unwrap();
    assert_eq!(applier.applied_count(), 0);
    assert_eq!(txn.state(), TxnState::Ended);
}

#[test]
fn test_nested_top_level_actions_share_the_outer_anchor() {
    let env = create_test_engine();
    let txn = env.engine.begin().unwrap();

    let base = txn.log_insert(update_body(8)).unwrap();
    let outer = txn.begin_top_level_action().unwrap();
    assert_eq!(outer.lsn(), base);
    txn.log_insert(update_body(8)).unwrap();

    // The inner action must not re-snapshot the anchor.
    let inner = txn.begin_top_level_action().unwrap();
    assert_eq!(inner.lsn(), base);
    txn.log_insert(update_body(8)).unwrap();
    txn.end_top_level_action(false).unwrap();

    // Only the outer close compensates, back to the outer anchor.
    txn.end_top_level_action(true).unwrap();
    assert_eq!(txn.undo_nxt(), base);

    txn.commit().unwrap();
}

#[test]
fn test_compensation_is_idempotent() {
    let env = create_test_engine();
    let txn = env.engine.begin().unwrap();

    let r1 = txn.log_insert(update_body(8)).unwrap();
    txn.log_insert(update_body(8)).unwrap();

    txn.compensate(r1).unwrap();
    let target_after_first = txn.undo_nxt();
    let count_after_first = env.wal.read_all().unwrap().len();

    // Compensating again with no intervening insertion changes nothing.
    txn.compensate(r1).unwrap();
    assert_eq!(txn.undo_nxt(), target_after_first);
    assert_eq!(env.wal.read_all().unwrap().len(), count_after_first);
    assert_eq!(target_after_first, r1);

    txn.abort().unwrap();
}

#[test]
fn test_compensation_falls_back_to_a_fresh_record_after_flush() {
    let env = create_test_engine();
    let txn = env.engine.begin().unwrap();

    let r1 = txn.log_insert(update_body(8)).unwrap();
    let r2 = txn.log_insert(update_body(8)).unwrap();
    // Flushing frames the records out, so in-place patching is no longer
    // possible and a zero-payload compensation is written instead.
    env.engine.log_device().flush(r2, true).unwrap();

    txn.compensate(r1).unwrap();
    assert_eq!(txn.undo_nxt(), r1);
    let records = env.wal.read_all().unwrap();
    assert_eq!(records.len(), 3);
    let clr = records.last().unwrap();
    assert!(clr.is_compensation());
    assert_eq!(clr.undo_nxt, r1);

    txn.abort().unwrap();
}
