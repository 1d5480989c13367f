//! Checkpoint coordination.
//!
//! The checkpoint manager owns the global serialization gate shared with
//! every transaction: state-change-plus-log-record pairs take the read
//! side, a checkpoint takes the write side, so a checkpoint never observes
//! a transaction state without its justifying log record (or vice versa).
//! It also carries the wakeup used to nudge a checkpoint when log space
//! runs critically low.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use ferrolog_transaction::lsn::Lsn;
use ferrolog_transaction::tid::TransactionId;
use log::{debug, warn};
use parking_lot::{Condvar, Mutex, RwLock, RwLockReadGuard};

use crate::engine::TxnEngine;
use crate::error::StorageResult;
use crate::wal::{LogBody, LogRecord, PREPARE_CHUNK};

#[derive(Default)]
pub struct CheckpointManager {
    gate: RwLock<()>,
    wakeup: Mutex<bool>,
    takers: Condvar,
    last_checkpoint_lsn: AtomicU64,
}

impl CheckpointManager {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Serialize a "change state + emit its log record" pair against a
    /// concurrent checkpoint. Held for the duration of the pair.
    pub(crate) fn serial_pair(&self) -> RwLockReadGuard<'_, ()> {
        self.gate.read()
    }

    /// Nudge an in-progress or future checkpoint; called when log space is
    /// critically low.
    pub fn wakeup_and_take(&self) {
        *self.wakeup.lock() = true;
        self.takers.notify_all();
    }

    /// Block the dedicated checkpoint thread until nudged or `timeout`
    /// elapses. Returns true if a nudge arrived.
    pub fn wait_for_wakeup(&self, timeout: Duration) -> bool {
        let mut requested = self.wakeup.lock();
        if !*requested {
            self.takers.wait_for(&mut requested, timeout);
        }
        std::mem::take(&mut *requested)
    }

    /// LSN of the most recent checkpoint's first record.
    pub fn last_checkpoint_lsn(&self) -> Lsn {
        Lsn::with_raw(self.last_checkpoint_lsn.load(Ordering::Acquire))
    }

    /// Take a checkpoint: under the write side of the gate, snapshot the
    /// live transaction table into chunked log records, flush, and reclaim
    /// log space below the recovery floor. `redo_low` is the buffer pool's
    /// minimum recovery LSN, when the embedder tracks one.
    pub fn take(&self, engine: &TxnEngine, redo_low: Option<Lsn>) -> StorageResult<Lsn> {
        let _gate = self.gate.write();

        let mut entries = Vec::new();
        engine.directory.for_each(|txn| entries.push(txn.table_entry()));

        let undo_low = entries
            .iter()
            .map(|entry| entry.first_lsn)
            .filter(|lsn| lsn.valid())
            .min();

        // At least one record is always written, so an empty table still
        // yields a checkpoint LSN.
        let mut chunks: Vec<_> = entries.chunks(PREPARE_CHUNK).map(<[_]>::to_vec).collect();
        if chunks.is_empty() {
            chunks.push(Vec::new());
        }
        let mut first = Lsn::NULL;
        let mut last = Lsn::NULL;
        for chunk in chunks {
            let record = LogRecord::new(
                TransactionId::INVALID,
                last,
                LogBody::CheckpointTxnTable { entries: chunk },
            );
            let (lsn, _) = engine.log.insert(record)?;
            if !first.valid() {
                first = lsn;
            }
            last = lsn;
        }
        engine.log.flush(last, true)?;

        // Everything below the floor is no longer needed for recovery.
        let floor = [redo_low, undo_low, Some(first)]
            .into_iter()
            .flatten()
            .min()
            .expect("checkpoint floor always has the checkpoint lsn");
        if floor > engine.log.global_min_lsn() {
            if let Err(e) = engine.log.truncate_until(floor) {
                // Reclamation failure is not fatal to the checkpoint itself.
                warn!("log truncation to {floor} failed: {e}");
            }
        }

        self.last_checkpoint_lsn.store(first.raw(), Ordering::Release);
        debug!(
            "checkpoint at {first}: {} live transactions, floor {floor}",
            engine.directory.count_active()
        );
        Ok(first)
    }
}
