//! The process-wide registry of live transactions.
//!
//! The directory is the single source of truth for "which transactions
//! currently exist". The skip map keeps entries in ascending tid order
//! structurally, so the oldest/youngest watermarks are cheap to maintain
//! and an order violation cannot be represented at all. Membership changes
//! go through a reentrant gate, so a visitor that calls back into the
//! directory does not deadlock.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_skiplist::SkipMap;
use ferrolog_transaction::error::TidError;
use ferrolog_transaction::tid::{TidGenerator, TransactionId};
use parking_lot::ReentrantMutex;

use crate::transaction::TransactionRecord;

pub struct TransactionDirectory {
    txns: SkipMap<TransactionId, Arc<TransactionRecord>>,
    membership: ReentrantMutex<()>,
    oldest: AtomicU64,
    youngest: AtomicU64,
    tid_gen: TidGenerator,
}

impl Default for TransactionDirectory {
    fn default() -> Self {
        Self {
            txns: SkipMap::new(),
            membership: ReentrantMutex::new(()),
            oldest: AtomicU64::new(0),
            youngest: AtomicU64::new(0),
            tid_gen: TidGenerator::new(),
        }
    }
}

impl TransactionDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a fresh tid, strictly greater than any previously issued.
    pub(crate) fn next_tid(&self) -> Result<TransactionId, TidError> {
        self.tid_gen.next()
    }

    /// Bump the tid watermark past a recovery-assigned tid.
    pub(crate) fn note_recovered_tid(&self, tid: TransactionId) -> Result<(), TidError> {
        self.tid_gen.update_if_greater(tid)
    }

    /// The tid watermark: the next tid that would be issued.
    pub fn tid_watermark(&self) -> TransactionId {
        self.tid_gen.current()
    }

    pub fn lookup(&self, tid: TransactionId) -> Option<Arc<TransactionRecord>> {
        self.txns.get(&tid).map(|entry| entry.value().clone())
    }

    /// Minimum live tid; `INVALID` when the directory is empty. The value
    /// is a cached watermark and may be stale immediately after the read.
    pub fn oldest_tid(&self) -> TransactionId {
        TransactionId::with_raw(self.oldest.load(Ordering::SeqCst))
    }

    /// Maximum live tid; `INVALID` when the directory is empty.
    pub fn youngest_tid(&self) -> TransactionId {
        TransactionId::with_raw(self.youngest.load(Ordering::SeqCst))
    }

    /// Snapshot count of live transactions. Stale as soon as it returns.
    pub fn count_active(&self) -> u32 {
        self.txns.len() as u32
    }

    /// Visit every live transaction in ascending tid order. The membership
    /// gate is held only while the snapshot is taken, never across the
    /// visitor, so visitors may call back into the directory freely.
    pub fn for_each<F>(&self, mut visitor: F)
    where
        F: FnMut(&Arc<TransactionRecord>),
    {
        let snapshot: Vec<_> = {
            let _gate = self.membership.lock();
            self.txns.iter().map(|entry| entry.value().clone()).collect()
        };
        for txn in &snapshot {
            visitor(txn);
        }
    }

    pub(crate) fn insert(&self, txn: Arc<TransactionRecord>) {
        let _gate = self.membership.lock();
        self.txns.insert(txn.tid(), txn);
        self.update_watermarks();
    }

    pub(crate) fn remove(&self, tid: TransactionId) {
        let _gate = self.membership.lock();
        self.txns.remove(&tid);
        self.update_watermarks();
    }

    /// Atomically move a chaining transaction from its old tid to its new
    /// one: one membership-gated step, so no observer sees the record
    /// missing or doubled.
    pub(crate) fn rebind(&self, old: TransactionId, new: TransactionId) {
        let _gate = self.membership.lock();
        if let Some(entry) = self.txns.remove(&old) {
            self.txns.insert(new, entry.value().clone());
        }
        self.update_watermarks();
    }

    fn update_watermarks(&self) {
        let oldest = self.txns.front().map_or(0, |entry| entry.key().raw());
        let youngest = self.txns.back().map_or(0, |entry| entry.key().raw());
        self.oldest.store(oldest, Ordering::SeqCst);
        self.youngest.store(youngest, Ordering::SeqCst);
    }
}
