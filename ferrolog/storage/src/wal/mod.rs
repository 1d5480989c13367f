//! Logical log-record model and the log-device interface.
//!
//! The transaction core does not own an on-disk page format; its wire
//! obligation is limited to the logical record kinds it must emit. A record
//! whose `undo_nxt` is valid is a compensation: rollback skips directly to
//! that LSN instead of undoing anything at or before the record itself.

pub mod file_log;

use ferrolog_transaction::lock::{LockMode, ResourceId};
use ferrolog_transaction::lsn::Lsn;
use ferrolog_transaction::state::TxnState;
use ferrolog_transaction::tid::TransactionId;
use serde::{Deserialize, Serialize};

use crate::buffer::PageId;
use crate::error::{LogError, StorageError, StorageResult};
use crate::store::StoreId;

/// Number of lock or transaction-table entries packed into one record.
pub const PREPARE_CHUNK: usize = 16;

/// Bytes of frame header (length + checksum) per stored record.
pub(crate) const FRAME_HEADER: usize = 8;

/// Worst-case growth of a record between size estimation (LSN still null)
/// and insertion (LSN assigned): one u64 varint.
pub(crate) const INSERT_SLACK: u64 = 10;

/// Exact stored size of a record as the device will frame it.
pub(crate) fn encoded_len(record: &LogRecord) -> StorageResult<u64> {
    let payload = postcard::to_allocvec(record)
        .map_err(|e| StorageError::Log(LogError::SerializationFailed(e.to_string())))?;
    Ok((payload.len() + FRAME_HEADER) as u64)
}

/// Global transaction identifier assigned by an external 2PC coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalTid(pub Vec<u8>);

/// Opaque handle naming the external 2PC coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorHandle(pub u64);

/// One live transaction's entry in a checkpoint transaction-table record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxnTableEntry {
    pub tid: TransactionId,
    pub state: TxnState,
    pub first_lsn: Lsn,
    pub last_lsn: Lsn,
    pub undo_nxt: Lsn,
}

/// A log record as inserted into the shared log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    /// Assigned by the device at insertion; `NULL` before.
    pub lsn: Lsn,
    pub tid: TransactionId,
    /// The transaction's previous record (`NULL` for its first).
    pub prev: Lsn,
    /// Set when this record is a compensation; rollback then skips to
    /// `undo_nxt` instead of undoing. A null `undo_nxt` with `clr` set
    /// means "everything before is already undone".
    pub clr: bool,
    /// Compensation target; meaningful only when `clr` is set.
    pub undo_nxt: Lsn,
    pub body: LogBody,
}

impl LogRecord {
    pub fn new(tid: TransactionId, prev: Lsn, body: LogBody) -> Self {
        Self {
            lsn: Lsn::NULL,
            tid,
            prev,
            clr: false,
            undo_nxt: Lsn::NULL,
            body,
        }
    }

    /// True if rollback should skip to `undo_nxt` instead of undoing.
    pub fn is_compensation(&self) -> bool {
        self.clr
    }

    /// True if rollback must apply this record's undo.
    pub fn is_undoable(&self) -> bool {
        matches!(self.body, LogBody::Update { undoable: true, .. })
    }
}

/// The record kinds the transaction core emits or consumes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LogBody {
    /// A forward action logged by an access method.
    Update {
        /// False for actions that need no undo (e.g. page formats).
        undoable: bool,
        /// Logical undo does not fix the page; physical undo does.
        logical: bool,
        page: PageId,
        redo: Vec<u8>,
        undo: Vec<u8>,
    },
    /// Zero-payload compensation; the target lives in `undo_nxt`.
    Compensation,
    /// Prepare vote record; `gtid` is set for external 2PC participants.
    Prepare { gtid: Option<GlobalTid> },
    /// Exclusive locks held at prepare, packed into fixed-capacity chunks.
    PrepareLocks { locks: Vec<(ResourceId, LockMode)> },
    /// Stores the prepared transaction will free on commit.
    PrepareStoresToFree { stores: Vec<StoreId> },
    /// End-of-transaction space release has begun.
    FreeingSpace,
    /// Commit completed.
    End,
    /// Abort completed.
    Abort,
    /// Checkpoint-time snapshot of the live transaction table.
    CheckpointTxnTable { entries: Vec<TxnTableEntry> },
}

/// The shared log device consumed by the transaction core.
///
/// LSNs are assigned strictly increasing in insertion order, under the
/// device's own serialization; the order in which transactions' log gates
/// are granted is therefore the order their records receive LSNs.
pub trait LogDevice: Send + Sync {
    /// Insert a record, assigning its LSN. Returns the LSN and the number
    /// of bytes of log space the record accounts for.
    fn insert(&self, record: LogRecord) -> StorageResult<(Lsn, u64)>;

    /// Fetch the record at `lsn`. Positions before the start of the
    /// retained log yield `LogError::Eof`.
    fn fetch(&self, lsn: Lsn) -> StorageResult<LogRecord>;

    /// Flush records up to and including `upto`. With `block`, the call
    /// also syncs to stable storage before returning.
    fn flush(&self, upto: Lsn, block: bool) -> StorageResult<()>;

    /// Highest LSN known durable.
    fn durable_lsn(&self) -> Lsn;

    /// Draw `bytes` from the global log-space budget. Returns false when
    /// the budget cannot cover the request.
    fn reserve_space(&self, bytes: u64) -> bool;

    /// Return `bytes` to the global log-space budget.
    fn release_space(&self, bytes: u64);

    /// Patch the still-buffered record at `target` into a compensation
    /// pointing at `undo_nxt`. Fails if the record already left the buffer.
    fn compensate(&self, target: Lsn, undo_nxt: Lsn) -> Result<(), ()>;

    /// Lowest LSN still retained by the device.
    fn global_min_lsn(&self) -> Lsn;

    /// Bytes left in the global log-space budget.
    fn space_left(&self) -> u64;

    /// Drop all records below `lsn` (checkpoint-driven reclamation).
    fn truncate_until(&self, lsn: Lsn) -> StorageResult<()>;
}
