//! Rollback, compensation, and nested top-level actions.
//!
//! Rollback walks backward from `undo_nxt`, applying each undoable
//! record's undo and emitting a compensation record per undone action, so
//! that a crash mid-rollback never undoes the same effect twice. A record
//! that is itself a compensation short-circuits the walk to its target.

use ferrolog_transaction::lsn::Lsn;
use log::debug;

use crate::buffer::{LatchMode, Page};
use crate::engine::TxnEngine;
use crate::error::{LogError, StorageError, StorageResult};
use crate::transaction::{LogCursor, TransactionRecord};
use crate::wal::{LogBody, LogRecord, encoded_len};

/// Applies the undo half of an update record. Access methods implement
/// this; the engine only orchestrates page fixing and the undo chain.
pub trait UndoApplier: Send + Sync {
    fn apply(&self, record: &LogRecord, page: Option<&Page>) -> StorageResult<()>;
}

/// Applier for embedders whose undo is purely logical bookkeeping, and for
/// tests that only exercise the chain mechanics.
pub struct NullUndoApplier;

impl UndoApplier for NullUndoApplier {
    fn apply(&self, _record: &LogRecord, _page: Option<&Page>) -> StorageResult<()> {
        Ok(())
    }
}

/// Anchor of a top-level action: where rollback resumes once the action is
/// compensated away.
#[derive(Debug, Clone, Copy)]
pub struct Anchor {
    lsn: Lsn,
}

impl Anchor {
    pub fn lsn(&self) -> Lsn {
        self.lsn
    }
}

impl TransactionRecord {
    /// Open a (possibly nested) top-level action. Only the outermost open
    /// snapshots the anchor; inner opens must not re-snapshot it.
    pub fn begin_top_level_action(&self) -> StorageResult<Anchor> {
        let mut cursor = self.log_cursor.acquire();
        cursor.depth += 1;
        if cursor.depth == 1 {
            cursor.anchor = cursor.last_lsn;
        }
        Ok(Anchor { lsn: cursor.anchor })
    }

    /// Close the innermost top-level action. Only the outermost close
    /// clears the anchor, optionally compensating back to it first.
    pub fn end_top_level_action(&self, compensate: bool) -> StorageResult<()> {
        let engine = self.engine()?;
        let mut cursor = self.log_cursor.acquire();
        assert!(
            cursor.depth > 0,
            "top-level action close without a matching open ({})",
            self.tid()
        );
        cursor.depth -= 1;
        if cursor.depth == 0 {
            let anchor = cursor.anchor;
            cursor.anchor = Lsn::NULL;
            if compensate {
                self.compensate_locked(&engine, &mut cursor, anchor)?;
            }
        }
        Ok(())
    }

    /// Mark the most recent record as a compensation pointing back to
    /// `anchor`. Idempotent: compensating to the current target (or an
    /// earlier one twice) is a no-op, never a corrupted chain.
    pub fn compensate(&self, anchor: Lsn) -> StorageResult<()> {
        let engine = self.engine()?;
        let mut cursor = self.log_cursor.acquire();
        self.compensate_locked(&engine, &mut cursor, anchor)
    }

    fn compensate_locked(
        &self,
        engine: &std::sync::Arc<TxnEngine>,
        cursor: &mut LogCursor,
        anchor: Lsn,
    ) -> StorageResult<()> {
        if !cursor.last_lsn.valid() {
            return Ok(()); // nothing logged, nothing to skip
        }
        if cursor.undo_nxt <= anchor {
            return Ok(()); // already compensated to here or earlier
        }
        if anchor > cursor.last_lsn {
            return Ok(()); // stale anchor from a chained predecessor
        }
        if engine.log.compensate(cursor.last_lsn, anchor).is_ok() {
            cursor.undo_nxt = anchor;
        } else {
            // The record already left the buffer; write a fresh
            // zero-payload compensation instead.
            let mut clr = LogRecord::new(self.tid(), cursor.last_lsn, LogBody::Compensation);
            clr.clr = true;
            clr.undo_nxt = anchor;
            let (lsn, bytes) = engine.log.insert(clr)?;
            cursor.last_lsn = lsn;
            cursor.undo_nxt = anchor;
            let consumed = self.reservation.charge_end(bytes);
            if consumed > 0 {
                engine.log.release_space(consumed);
            }
        }
        if let Some(stats) = self.stats() {
            stats.note_compensation();
        }
        Ok(())
    }

    /// Roll back to `savepoint` (exclusive); `Lsn::NULL` rolls back
    /// everything. Requires single-thread attachment, and must not be
    /// called while a rollback is already in progress.
    pub fn rollback_to(&self, savepoint: Lsn) -> StorageResult<()> {
        self.single_thread_attached().map_err(StorageError::from)?;
        let was_rolling_back = self
            .rolling_back
            .swap(true, std::sync::atomic::Ordering::SeqCst);
        assert!(!was_rolling_back, "rollback may not nest ({})", self.tid());
        let result = self.rollback_walk(savepoint);
        self.rolling_back
            .store(false, std::sync::atomic::Ordering::SeqCst);
        result
    }

    fn rollback_walk(&self, savepoint: Lsn) -> StorageResult<()> {
        let engine = self.engine()?;
        let mut cursor = self.log_cursor.acquire();
        let mut walk = cursor.undo_nxt;
        let mut reached_eof = false;
        while walk.valid() && walk > savepoint {
            let record = match engine.log.fetch(walk) {
                Ok(record) => record,
                Err(StorageError::Log(LogError::Eof)) => {
                    // The log device's start was reached: rollback complete.
                    reached_eof = true;
                    break;
                }
                Err(e) => return Err(e),
            };
            if record.is_compensation() {
                walk = record.undo_nxt;
                continue;
            }
            if record.is_undoable() {
                let fixed = match &record.body {
                    LogBody::Update {
                        logical: false,
                        page,
                        ..
                    } => Some(engine.buffer.fix(*page, LatchMode::Exclusive)?),
                    _ => None,
                };
                engine.undo_applier.apply(&record, fixed.as_ref())?;

                // The compensation record marks this undo complete.
                let mut clr = LogRecord::new(self.tid(), cursor.last_lsn, LogBody::Compensation);
                clr.clr = true;
                clr.undo_nxt = record.prev;
                let (lsn, _bytes) = engine.log.insert(clr)?;
                cursor.last_lsn = lsn;

                let undone = encoded_len(&record)?;
                self.reservation.charge_undo(undone);
                engine.log.release_space(undone);
                if let Some(stats) = self.stats() {
                    stats.note_compensation();
                }
                walk = record.prev;
                continue;
            }
            walk = record.prev;
        }
        cursor.undo_nxt = if reached_eof { Lsn::NULL } else { walk };
        debug!("{} rolled back to {}", self.tid(), cursor.undo_nxt);
        if let Some(stats) = self.stats() {
            stats.note_rollback();
        }
        // Undo may have collapsed multi-page stores; drop stale descriptors.
        self.structural
            .acquire_after(&cursor)
            .with(|s| s.sdesc.clear());
        Ok(())
    }
}
