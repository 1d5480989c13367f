//! The engine context object.
//!
//! All cross-transaction shared state (directory, tid watermark, log-space
//! budget, checkpoint gate) lives here instead of in file-scope statics,
//! so a process can run multiple independent engines (one per test, for
//! instance).

use std::sync::Arc;

use ferrolog_transaction::lock::{LockManager, LockTimeout};
use ferrolog_transaction::lsn::Lsn;
use ferrolog_transaction::state::TxnState;
use ferrolog_transaction::tid::TransactionId;

use crate::buffer::{BufferPool, InMemoryBufferPool};
use crate::checkpoint::CheckpointManager;
use crate::directory::TransactionDirectory;
use crate::error::StorageResult;
use crate::lock::TableLockManager;
use crate::transaction::{TransactionRecord, TxnStats};
use crate::undo::{NullUndoApplier, UndoApplier};
use crate::wal::LogDevice;
use crate::wal::file_log::{FileLog, FileLogConfig};

const DEFAULT_UNDO_FUDGE_FACTOR: u64 = 2;
const DEFAULT_RESERVATION_RETRIES: u32 = 5;

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub log: FileLogConfig,
    /// Multiple of each forward record's length set aside for its undo:
    /// at least 1 covers one compensation record, the default leaves slack
    /// for the asymmetric end-of-transaction records as well.
    pub undo_fudge_factor: u64,
    /// Bounded retry budget for log-space reservation before
    /// `OutOfLogSpace` is surfaced.
    pub reservation_retries: u32,
    pub default_lock_timeout: LockTimeout,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            log: FileLogConfig::default(),
            undo_fudge_factor: DEFAULT_UNDO_FUDGE_FACTOR,
            reservation_retries: DEFAULT_RESERVATION_RETRIES,
            default_lock_timeout: LockTimeout::WaitForever,
        }
    }
}

/// The transaction engine: directory, log device, checkpoint manager, and
/// the collaborator interfaces, owned together and injected everywhere.
pub struct TxnEngine {
    pub(crate) directory: TransactionDirectory,
    pub(crate) log: Arc<dyn LogDevice>,
    pub(crate) checkpoint: CheckpointManager,
    pub(crate) locks: Arc<dyn LockManager>,
    pub(crate) buffer: Arc<dyn BufferPool>,
    pub(crate) undo_applier: Arc<dyn UndoApplier>,
    pub(crate) config: EngineConfig,
}

impl TxnEngine {
    /// Engine with a file-backed log and in-memory collaborator doubles.
    pub fn new(config: EngineConfig) -> StorageResult<Arc<Self>> {
        let log = Arc::new(FileLog::open(config.log.clone())?);
        Ok(Self::with_collaborators(
            config,
            log,
            Arc::new(TableLockManager::new()),
            Arc::new(InMemoryBufferPool::new()),
            Arc::new(NullUndoApplier),
        ))
    }

    /// Engine with explicit collaborators (real lock manager, buffer pool,
    /// access-method undo, or a stub log device).
    pub fn with_collaborators(
        config: EngineConfig,
        log: Arc<dyn LogDevice>,
        locks: Arc<dyn LockManager>,
        buffer: Arc<dyn BufferPool>,
        undo_applier: Arc<dyn UndoApplier>,
    ) -> Arc<Self> {
        Arc::new(Self {
            directory: TransactionDirectory::new(),
            log,
            checkpoint: CheckpointManager::new(),
            locks,
            buffer,
            undo_applier,
            config,
        })
    }

    // ---- Transaction lifecycle ----

    pub fn begin(self: &Arc<Self>) -> StorageResult<Arc<TransactionRecord>> {
        self.begin_with(None, None)
    }

    /// Begin a transaction, optionally attaching a statistics target and a
    /// lock-timeout override.
    pub fn begin_with(
        self: &Arc<Self>,
        stats: Option<Arc<TxnStats>>,
        timeout: Option<LockTimeout>,
    ) -> StorageResult<Arc<TransactionRecord>> {
        // Begins are serialized against checkpoints, so a checkpoint never
        // sees a transaction that is only half-registered.
        let _chk = self.checkpoint.serial_pair();
        let tid = self.directory.next_tid()?;
        let txn = Arc::new(TransactionRecord::new(
            Arc::downgrade(self),
            tid,
            timeout.unwrap_or(self.config.default_lock_timeout),
            stats,
        ));
        self.directory.insert(txn.clone());
        Ok(txn)
    }

    /// Recovery-time construction from an explicit (tid, state, last_lsn,
    /// undo_nxt) tuple. Bypasses ordered tid assignment but still bumps the
    /// watermark, so future `begin` calls never collide.
    pub fn begin_recovered(
        self: &Arc<Self>,
        tid: TransactionId,
        state: TxnState,
        last_lsn: Lsn,
        undo_nxt: Lsn,
    ) -> StorageResult<Arc<TransactionRecord>> {
        self.directory.note_recovered_tid(tid)?;
        let txn = Arc::new(TransactionRecord::recovered(
            Arc::downgrade(self),
            tid,
            state,
            last_lsn,
            undo_nxt,
            self.config.default_lock_timeout,
        ));
        self.directory.insert(txn.clone());
        Ok(txn)
    }

    // ---- Directory views ----

    pub fn lookup(&self, tid: TransactionId) -> Option<Arc<TransactionRecord>> {
        self.directory.lookup(tid)
    }

    pub fn oldest_tid(&self) -> TransactionId {
        self.directory.oldest_tid()
    }

    pub fn youngest_tid(&self) -> TransactionId {
        self.directory.youngest_tid()
    }

    pub fn count_active(&self) -> u32 {
        self.directory.count_active()
    }

    /// Visit every live (non-ended) transaction, for checkpoint
    /// transaction-table records.
    pub fn for_each_active_transaction<F>(&self, mut visitor: F)
    where
        F: FnMut(&Arc<TransactionRecord>),
    {
        self.directory.for_each(|txn| {
            if !txn.state().is_terminal() {
                visitor(txn);
            }
        });
    }

    /// Visit every prepared transaction, for checkpoint records and for
    /// coordinator recovery queries.
    pub fn for_each_prepared_transaction<F>(&self, mut visitor: F)
    where
        F: FnMut(&Arc<TransactionRecord>),
    {
        self.directory.for_each(|txn| {
            if txn.state() == TxnState::Prepared {
                visitor(txn);
            }
        });
    }

    // ---- Collaborator access ----

    pub fn log_device(&self) -> &Arc<dyn LogDevice> {
        &self.log
    }

    pub fn lock_manager(&self) -> &Arc<dyn LockManager> {
        &self.locks
    }

    pub fn buffer_pool(&self) -> &Arc<dyn BufferPool> {
        &self.buffer
    }

    pub fn checkpoint_manager(&self) -> &CheckpointManager {
        &self.checkpoint
    }

    /// Take a checkpoint now. `redo_low` is the buffer pool's minimum
    /// recovery LSN, when the embedder tracks one.
    pub fn take_checkpoint(&self, redo_low: Option<Lsn>) -> StorageResult<Lsn> {
        self.checkpoint.take(self, redo_low)
    }
}
