#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use ferrolog_storage::{
    Dependent, EngineConfig, FileLog, FileLogConfig, LogBody, PageId, TransactionId, TxnEngine,
    TxnState, UndoApplier,
};
use tempfile::TempDir;

/// An engine plus the typed handle to its file log (so tests can read the
/// records back) and the temp dir keeping the log file alive.
pub struct TestEnv {
    pub engine: Arc<TxnEngine>,
    pub wal: Arc<FileLog>,
    _dir: TempDir,
}

pub fn create_test_engine() -> TestEnv {
    create_test_engine_with(64 * 1024 * 1024, None)
}

pub fn create_test_engine_with_capacity(capacity: u64) -> TestEnv {
    create_test_engine_with(capacity, None)
}

pub fn create_test_engine_with_applier(applier: Arc<dyn UndoApplier>) -> TestEnv {
    create_test_engine_with(64 * 1024 * 1024, Some(applier))
}

fn create_test_engine_with(capacity: u64, applier: Option<Arc<dyn UndoApplier>>) -> TestEnv {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = TempDir::new().unwrap();
    let config = EngineConfig {
        log: FileLogConfig {
            path: dir.path().join("wal.log"),
            capacity,
        },
        ..Default::default()
    };
    let wal = Arc::new(FileLog::open(config.log.clone()).unwrap());
    let engine = TxnEngine::with_collaborators(
        config,
        wal.clone(),
        Arc::new(ferrolog_storage::TableLockManager::new()),
        Arc::new(ferrolog_storage::InMemoryBufferPool::new()),
        applier.unwrap_or_else(|| Arc::new(ferrolog_storage::NullUndoApplier)),
    );
    TestEnv { engine, wal, _dir: dir }
}

/// An undoable forward record with a payload of the given size.
pub fn update_body(payload: usize) -> LogBody {
    LogBody::Update {
        undoable: true,
        logical: false,
        page: PageId(1),
        redo: vec![0xab; payload],
        undo: vec![0xcd; payload],
    }
}

/// Dependent that records every transition it observes.
pub struct RecordingDependent {
    transitions: Mutex<Vec<(TransactionId, TxnState, TxnState)>>,
}

impl RecordingDependent {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            transitions: Mutex::new(Vec::new()),
        })
    }

    pub fn transitions(&self) -> Vec<(TransactionId, TxnState, TxnState)> {
        self.transitions.lock().unwrap().clone()
    }

    pub fn states(&self) -> Vec<(TxnState, TxnState)> {
        self.transitions
            .lock()
            .unwrap()
            .iter()
            .map(|(_, old, new)| (*old, *new))
            .collect()
    }
}

impl Dependent for RecordingDependent {
    fn on_transition(&self, tid: TransactionId, old: TxnState, new: TxnState) {
        self.transitions.lock().unwrap().push((tid, old, new));
    }
}

/// Undo applier that counts the records it was asked to undo.
#[derive(Default)]
pub struct CountingApplier {
    pub applied: Mutex<Vec<ferrolog_storage::Lsn>>,
}

impl CountingApplier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn applied_count(&self) -> usize {
        self.applied.lock().unwrap().len()
    }
}

impl UndoApplier for CountingApplier {
    fn apply(
        &self,
        record: &ferrolog_storage::LogRecord,
        _page: Option<&ferrolog_storage::Page>,
    ) -> ferrolog_storage::StorageResult<()> {
        self.applied.lock().unwrap().push(record.lsn);
        Ok(())
    }
}
