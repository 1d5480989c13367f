//! Transaction manager and write-ahead-log core of the ferrolog storage
//! engine.
//!
//! The engine tracks active transactions in a tid-ordered directory,
//! serializes each transaction's log insertion behind a per-transaction
//! gate, enforces log-space reservation against future undo so rollback
//! can never fail for lack of log space, and drives commit/abort/chain
//! through a state machine coordinated with an asynchronous checkpoint
//! thread. Lock management, the buffer pool, and access-method undo are
//! collaborators behind traits; in-memory doubles are provided for tests
//! and light embedders.

pub mod buffer;
pub mod checkpoint;
pub mod dependent;
pub mod directory;
pub mod engine;
pub mod error;
pub mod gates;
pub mod lock;
pub mod reservation;
pub mod store;
pub mod transaction;
pub mod undo;
pub mod wal;

pub use buffer::{BufferPool, InMemoryBufferPool, LatchMode, Page, PageId};
pub use checkpoint::CheckpointManager;
pub use dependent::Dependent;
pub use directory::TransactionDirectory;
pub use engine::{EngineConfig, TxnEngine};
pub use error::{CheckpointError, LogError, StorageError, StorageResult};
// Re-export the substrate types alongside the engine
pub use ferrolog_transaction::{
    LockDuration, LockError, LockManager, LockMode, LockTimeout, Lsn, ResourceId, TidError,
    TransactionId, TxnError, TxnState, Vote,
};
pub use lock::{LockInfo, TableLockManager};
pub use reservation::LogReservation;
pub use store::StoreId;
pub use transaction::{LogStream, TransactionRecord, TxnStats, UpdateScope};
pub use undo::{Anchor, NullUndoApplier, UndoApplier};
pub use wal::file_log::{FileLog, FileLogConfig, FileLogIter};
pub use wal::{
    CoordinatorHandle, GlobalTid, LogBody, LogDevice, LogRecord, PREPARE_CHUNK, TxnTableEntry,
};
