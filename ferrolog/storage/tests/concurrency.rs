mod common;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use common::*;
use ferrolog_storage::{
    EngineConfig, FileLog, FileLogConfig, InMemoryBufferPool, LogDevice, LogRecord, Lsn,
    NullUndoApplier, StorageError, StorageResult, TableLockManager, TransactionId, TxnEngine,
    TxnError,
};

/// Log-device decorator asserting that no two threads ever insert on the
/// same transaction's behalf concurrently (the single-writer log gate).
struct GateProbeLog {
    inner: Arc<FileLog>,
    in_flight: Mutex<HashMap<u64, u32>>,
    max_per_tid: AtomicU32,
}

impl GateProbeLog {
    fn new(inner: Arc<FileLog>) -> Self {
        Self {
            inner,
            in_flight: Mutex::new(HashMap::new()),
            max_per_tid: AtomicU32::new(0),
        }
    }

    fn enter(&self, tid: TransactionId) {
        let mut map = self.in_flight.lock().unwrap();
        let count = map.entry(tid.raw()).or_insert(0);
        *count += 1;
        self.max_per_tid.fetch_max(*count, Ordering::SeqCst);
    }

    fn exit(&self, tid: TransactionId) {
        let mut map = self.in_flight.lock().unwrap();
        *map.get_mut(&tid.raw()).unwrap() -= 1;
    }
}

impl LogDevice for GateProbeLog {
    fn insert(&self, record: LogRecord) -> StorageResult<(Lsn, u64)> {
        let tid = record.tid;
        self.enter(tid);
        // Widen the race window; overlap would be visible in max_per_tid.
        thread::sleep(Duration::from_micros(200));
        let result = self.inner.insert(record);
        self.exit(tid);
        result
    }

    fn fetch(&self, lsn: Lsn) -> StorageResult<LogRecord> {
        self.inner.fetch(lsn)
    }

    fn flush(&self, upto: Lsn, block: bool) -> StorageResult<()> {
        self.inner.flush(upto, block)
    }

    fn durable_lsn(&self) -> Lsn {
        self.inner.durable_lsn()
    }

    fn reserve_space(&self, bytes: u64) -> bool {
        self.inner.reserve_space(bytes)
    }

    fn release_space(&self, bytes: u64) {
        self.inner.release_space(bytes)
    }

    fn compensate(&self, target: Lsn, undo_nxt: Lsn) -> Result<(), ()> {
        self.inner.compensate(target, undo_nxt)
    }

    fn global_min_lsn(&self) -> Lsn {
        self.inner.global_min_lsn()
    }

    fn space_left(&self) -> u64 {
        self.inner.space_left()
    }

    fn truncate_until(&self, lsn: Lsn) -> StorageResult<()> {
        self.inner.truncate_until(lsn)
    }
}

fn probe_engine() -> (Arc<TxnEngine>, Arc<GateProbeLog>, tempfile::TempDir) {
    let dir = tempfile::TempDir::new().unwrap();
    let config = EngineConfig {
        log: FileLogConfig {
            path: dir.path().join("wal.log"),
            capacity: 64 * 1024 * 1024,
        },
        ..Default::default()
    };
    let file_log = Arc::new(FileLog::open(config.log.clone()).unwrap());
    let probe = Arc::new(GateProbeLog::new(file_log));
    let engine = TxnEngine::with_collaborators(
        config,
        probe.clone(),
        Arc::new(TableLockManager::new()),
        Arc::new(InMemoryBufferPool::new()),
        Arc::new(NullUndoApplier),
    );
    (engine, probe, dir)
}

// ========== SINGLE-WRITER LOG GATE ==========

#[test]
fn test_log_gate_admits_one_writer_per_transaction() {
    let (engine, probe, _dir) = probe_engine();
    let txn = engine.begin().unwrap();

    let mut handles = Vec::new();
    for _ in 0..4 {
        let stream = txn.fork_log_stream().unwrap();
        handles.push(thread::spawn(move || {
            for _ in 0..25 {
                stream.log_insert(update_body(32)).unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    // Concurrent stress, yet never two writers inside the gate at once.
    assert_eq!(probe.max_per_tid.load(Ordering::SeqCst), 1);

    // All streams dropped; the base thread can commit again.
    assert_eq!(txn.attached_threads(), 1);
    txn.commit().unwrap();
}

#[test]
fn test_log_order_matches_insertion_order() {
    let (engine, _probe, _dir) = probe_engine();
    let txn = engine.begin().unwrap();
    let mut lsns = Vec::new();
    for _ in 0..10 {
        lsns.push(txn.log_insert(update_body(8)).unwrap());
    }
    let mut sorted = lsns.clone();
    sorted.sort();
    assert_eq!(lsns, sorted);
    txn.commit().unwrap();
}

// ========== MULTI-THREAD ATTACHMENT PROTOCOL ==========

#[test]
fn test_commit_with_forked_stream_is_two_thread_error() {
    let env = create_test_engine();
    let txn = env.engine.begin().unwrap();
    let mut stream = txn.fork_log_stream().unwrap();

    let err = txn.commit().unwrap_err();
    assert!(matches!(
        err,
        StorageError::Transaction(TxnError::TwoThread(_))
    ));
    let err = txn.save_point().unwrap_err();
    assert!(matches!(
        err,
        StorageError::Transaction(TxnError::TwoThread(_))
    ));

    stream.close().unwrap();
    txn.commit().unwrap();
}

#[test]
fn test_closing_last_stream_requires_idle_transaction() {
    let env = create_test_engine();
    let txn = env.engine.begin().unwrap();
    let mut stream = txn.fork_log_stream().unwrap();

    let busy = txn.update_scope();
    let err = stream.close().unwrap_err();
    assert!(matches!(
        err,
        StorageError::Transaction(TxnError::OneThread(_))
    ));

    drop(busy);
    stream.close().unwrap();
    txn.commit().unwrap();
}

// ========== CONCURRENT BEGINS ==========

#[test]
fn test_concurrent_begins_issue_unique_increasing_tids() {
    let env = create_test_engine();
    let engine = env.engine.clone();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let engine = engine.clone();
        handles.push(thread::spawn(move || {
            let mut tids = Vec::new();
            for _ in 0..20 {
                let watermark = engine.youngest_tid();
                let txn = engine.begin().unwrap();
                // Freshly issued tids sit above every tid live at the time.
                assert!(txn.tid() > watermark || !watermark.is_valid());
                tids.push(txn.tid().raw());
                txn.commit().unwrap();
            }
            tids
        }));
    }

    let mut all: Vec<u64> = handles
        .into_iter()
        .flat_map(|handle| handle.join().unwrap())
        .collect();
    let len = all.len();
    all.sort();
    all.dedup();
    assert_eq!(all.len(), len);
    assert_eq!(env.engine.count_active(), 0);
}
