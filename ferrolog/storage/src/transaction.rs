//! The transaction record and its commit protocol.
//!
//! A [`TransactionRecord`] is the entity representing one transaction:
//! identity, state, lock info, log cursor, dependents, and log-reservation
//! counters. Exactly one thread is attached by default; forked log streams
//! may raise the attachment count transiently, but commit, abort, prepare,
//! savepoint, and rollback all require single-thread attachment.
//!
//! Gate order, outermost first: checkpoint gate, log gate, structural gate.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use ferrolog_transaction::error::TxnError;
use ferrolog_transaction::lock::{LockDuration, LockMode, LockTimeout, ResourceId};
use ferrolog_transaction::lsn::Lsn;
use ferrolog_transaction::state::{TxnState, Vote};
use ferrolog_transaction::tid::TransactionId;
use log::debug;

use crate::dependent::{Dependent, DependentList};
use crate::engine::TxnEngine;
use crate::error::{StorageError, StorageResult};
use crate::gates::{LogGate, StructuralGate, StructuralGuard};
use crate::lock::{LockInfo, acquire_lock_info, recycle_lock_info};
use crate::reservation::LogReservation;
use crate::store::{SdescCache, StoreId};
use crate::wal::{
    CoordinatorHandle, GlobalTid, LogBody, LogRecord, PREPARE_CHUNK, TxnTableEntry, encoded_len,
    INSERT_SLACK,
};

/// Optional per-transaction statistics target.
#[derive(Debug, Default)]
pub struct TxnStats {
    log_records: AtomicU64,
    log_bytes: AtomicU64,
    compensations: AtomicU64,
    rollbacks: AtomicU64,
}

impl TxnStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log_records(&self) -> u64 {
        self.log_records.load(Ordering::Acquire)
    }

    pub fn log_bytes(&self) -> u64 {
        self.log_bytes.load(Ordering::Acquire)
    }

    pub fn compensations(&self) -> u64 {
        self.compensations.load(Ordering::Acquire)
    }

    pub fn rollbacks(&self) -> u64 {
        self.rollbacks.load(Ordering::Acquire)
    }

    pub(crate) fn note_insert(&self, bytes: u64) {
        self.log_records.fetch_add(1, Ordering::AcqRel);
        self.log_bytes.fetch_add(bytes, Ordering::AcqRel);
    }

    pub(crate) fn note_compensation(&self) {
        self.compensations.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn note_rollback(&self) {
        self.rollbacks.fetch_add(1, Ordering::AcqRel);
    }
}

/// Log-cursor state, protected by the log gate. The anchor is valid iff
/// `depth > 0`; it is cleared exactly when the depth returns to zero.
pub(crate) struct LogCursor {
    pub(crate) first_lsn: Lsn,
    pub(crate) last_lsn: Lsn,
    pub(crate) undo_nxt: Lsn,
    pub(crate) anchor: Lsn,
    pub(crate) depth: u32,
}

impl LogCursor {
    fn fresh() -> Self {
        Self {
            first_lsn: Lsn::NULL,
            last_lsn: Lsn::NULL,
            undo_nxt: Lsn::NULL,
            anchor: Lsn::NULL,
            depth: 0,
        }
    }
}

/// Structural state, protected by the structural gate.
pub(crate) struct Structural {
    pub(crate) state: TxnState,
    pub(crate) dependents: DependentList,
    pub(crate) stores_to_free: Vec<StoreId>,
    pub(crate) load_stores: Vec<StoreId>,
    pub(crate) gtid: Option<GlobalTid>,
    pub(crate) coordinator: Option<CoordinatorHandle>,
    pub(crate) vote: Option<Vote>,
    pub(crate) quark_depth: u32,
    pub(crate) lock_info: Option<Box<LockInfo>>,
    pub(crate) sdesc: SdescCache,
}

pub struct TransactionRecord {
    engine: Weak<TxnEngine>,
    tid: AtomicU64,
    timeout: LockTimeout,
    stats: Option<Arc<TxnStats>>,
    pub(crate) reservation: LogReservation,
    pub(crate) log_cursor: LogGate<LogCursor>,
    pub(crate) structural: StructuralGate<Structural>,
    attached: AtomicU32,
    updating_ops: AtomicU32,
    pub(crate) rolling_back: AtomicBool,
}

impl TransactionRecord {
    pub(crate) fn new(
        engine: Weak<TxnEngine>,
        tid: TransactionId,
        timeout: LockTimeout,
        stats: Option<Arc<TxnStats>>,
    ) -> Self {
        Self::with_cursor(engine, tid, TxnState::Active, LogCursor::fresh(), timeout, stats)
    }

    /// Recovery constructor: an explicit (tid, state, last_lsn, undo_nxt)
    /// tuple from a checkpoint record. The tid watermark is bumped by the
    /// engine before this is called.
    pub(crate) fn recovered(
        engine: Weak<TxnEngine>,
        tid: TransactionId,
        state: TxnState,
        last_lsn: Lsn,
        undo_nxt: Lsn,
        timeout: LockTimeout,
    ) -> Self {
        let cursor = LogCursor {
            first_lsn: last_lsn,
            last_lsn,
            undo_nxt,
            anchor: Lsn::NULL,
            depth: 0,
        };
        Self::with_cursor(engine, tid, state, cursor, timeout, None)
    }

    fn with_cursor(
        engine: Weak<TxnEngine>,
        tid: TransactionId,
        state: TxnState,
        cursor: LogCursor,
        timeout: LockTimeout,
        stats: Option<Arc<TxnStats>>,
    ) -> Self {
        Self {
            engine,
            tid: AtomicU64::new(tid.raw()),
            timeout,
            stats,
            reservation: LogReservation::new(),
            log_cursor: LogGate::new(cursor),
            structural: StructuralGate::new(Structural {
                state,
                dependents: DependentList::default(),
                stores_to_free: Vec::new(),
                load_stores: Vec::new(),
                gtid: None,
                coordinator: None,
                vote: None,
                quark_depth: 0,
                lock_info: Some(acquire_lock_info()),
                sdesc: SdescCache::default(),
            }),
            attached: AtomicU32::new(1),
            updating_ops: AtomicU32::new(0),
            rolling_back: AtomicBool::new(false),
        }
    }

    // ---- Identity and cursor reads ----

    pub fn tid(&self) -> TransactionId {
        TransactionId::with_raw(self.tid.load(Ordering::SeqCst))
    }

    pub fn state(&self) -> TxnState {
        self.structural.acquire().with(|s| s.state)
    }

    pub fn timeout(&self) -> LockTimeout {
        self.timeout
    }

    pub fn stats(&self) -> Option<&Arc<TxnStats>> {
        self.stats.as_ref()
    }

    pub fn reservation(&self) -> &LogReservation {
        &self.reservation
    }

    pub fn first_lsn(&self) -> Lsn {
        self.log_cursor.acquire().first_lsn
    }

    pub fn last_lsn(&self) -> Lsn {
        self.log_cursor.acquire().last_lsn
    }

    pub fn undo_nxt(&self) -> Lsn {
        self.log_cursor.acquire().undo_nxt
    }

    /// A transaction that never logged is read-only.
    pub fn is_read_only(&self) -> bool {
        !self.first_lsn().valid()
    }

    pub fn attached_threads(&self) -> u32 {
        self.attached.load(Ordering::Acquire)
    }

    pub(crate) fn engine(&self) -> StorageResult<Arc<TxnEngine>> {
        self.engine
            .upgrade()
            .ok_or(StorageError::Transaction(TxnError::EngineShutdown))
    }

    pub(crate) fn single_thread_attached(&self) -> Result<(), TxnError> {
        if self.attached.load(Ordering::Acquire) != 1 {
            return Err(TxnError::TwoThread(self.tid()));
        }
        Ok(())
    }

    // ---- Dependents ----

    pub fn register_dependent(&self, dependent: &Arc<dyn Dependent>) {
        let guard = self.structural.acquire();
        let state = guard.with(|s| {
            s.dependents.register(dependent);
            s.state
        });
        // Synthetic no-op transition lets the dependent initialize.
        dependent.on_transition(self.tid(), state, state);
    }

    pub fn unregister_dependent(&self, dependent: &Arc<dyn Dependent>) {
        self.structural
            .acquire()
            .with(|s| s.dependents.unregister(dependent));
    }

    /// Transition to `next` and notify every dependent. Callbacks run over
    /// a snapshot, so a callback may unregister other dependents.
    pub(crate) fn change_state(&self, guard: &StructuralGuard<'_, Structural>, next: TxnState) {
        let (old, snapshot) = guard.with(|s| {
            let old = s.state;
            assert!(
                old.can_transition_to(next),
                "illegal transaction state transition {old:?} -> {next:?} for {}",
                self.tid()
            );
            s.state = next;
            (old, s.dependents.snapshot())
        });
        let tid = self.tid();
        for dependent in snapshot {
            dependent.on_transition(tid, old, next);
        }
    }

    // ---- Stores ----

    /// Mark a store for physical deletion at commit.
    pub fn mark_store_for_deletion(&self, store: StoreId) {
        self.structural
            .acquire()
            .with(|s| s.stores_to_free.push(store));
    }

    /// Register a load/temporary store; it converts to a regular store at
    /// commit or prepare, and is simply forgotten on abort.
    pub fn add_load_store(&self, store: StoreId) {
        self.structural.acquire().with(|s| s.load_stores.push(store));
    }

    pub fn stores_to_free(&self) -> Vec<StoreId> {
        self.structural.acquire().with(|s| s.stores_to_free.clone())
    }

    pub fn cache_store_descriptor(&self, store: StoreId) {
        self.structural.acquire().with(|s| s.sdesc.remember(store));
    }

    pub fn cached_store_descriptor(&self) -> Option<StoreId> {
        self.structural.acquire().with(|s| s.sdesc.cached())
    }

    // ---- Locks ----

    /// Acquire a lock through the engine's lock manager, recording it in
    /// this transaction's lock info.
    pub fn acquire_lock(
        &self,
        resource: ResourceId,
        mode: LockMode,
        duration: LockDuration,
    ) -> StorageResult<()> {
        let engine = self.engine()?;
        let tid = self.tid();
        self.structural.acquire().with(|s| {
            if let Some(info) = s.lock_info.as_mut() {
                info.set_wait(Some(resource));
            }
        });
        let result = engine.locks.acquire(tid, resource, mode, duration, self.timeout);
        self.structural.acquire().with(|s| {
            if let Some(info) = s.lock_info.as_mut() {
                info.set_wait(None);
                if result.is_ok() {
                    info.note_held(resource, mode, duration);
                }
            }
        });
        result.map_err(StorageError::from)
    }

    // ---- Quarks (early lock release scopes) ----

    pub fn open_quark(&self) {
        self.structural.acquire().with(|s| s.quark_depth += 1);
    }

    /// Close the innermost quark; closing the outermost releases all
    /// short-duration locks early.
    pub fn close_quark(&self) -> StorageResult<()> {
        let engine = self.engine()?;
        let depth = self.structural.acquire().with(|s| {
            assert!(s.quark_depth > 0, "quark close without a matching open");
            s.quark_depth -= 1;
            s.quark_depth
        });
        if depth == 0 {
            engine
                .locks
                .release_all(self.tid(), LockDuration::Short, false);
        }
        Ok(())
    }

    pub fn in_quark(&self) -> bool {
        self.structural.acquire().with(|s| s.quark_depth > 0)
    }

    // ---- Two-phase commit ----

    /// Enroll in external two-phase commit under a coordinator-assigned
    /// global transaction id.
    pub fn enter_2pc(
        &self,
        gtid: GlobalTid,
        coordinator: CoordinatorHandle,
    ) -> StorageResult<()> {
        let tid = self.tid();
        self.structural
            .acquire()
            .with(|s| {
                if s.gtid.is_some() {
                    return Err(TxnError::Extern2pc(tid));
                }
                if s.state != TxnState::Active {
                    return Err(TxnError::NotActive(s.state));
                }
                s.gtid = Some(gtid);
                s.coordinator = Some(coordinator);
                Ok(())
            })
            .map_err(StorageError::from)
    }

    pub fn global_tid(&self) -> Option<GlobalTid> {
        self.structural.acquire().with(|s| s.gtid.clone())
    }

    pub fn coordinator(&self) -> Option<CoordinatorHandle> {
        self.structural.acquire().with(|s| s.coordinator)
    }

    pub fn vote(&self) -> Option<Vote> {
        self.structural.acquire().with(|s| s.vote)
    }

    // ---- Logging ----

    /// Track an in-flight updating operation; the last forked log stream
    /// cannot close while one is open.
    pub fn update_scope(&self) -> UpdateScope<'_> {
        self.bump_updating();
        UpdateScope(self)
    }

    /// Insert a forward log record on this transaction's behalf. The log
    /// gate serializes concurrent callers; the reservation layer guarantees
    /// the record's eventual undo can be paid for before the record is
    /// allowed in.
    pub fn log_insert(&self, body: LogBody) -> StorageResult<Lsn> {
        let engine = self.engine()?;
        let _op = self.update_scope();
        let mut cursor = self.log_cursor.acquire();
        {
            let guard = self.structural.acquire_after(&cursor);
            let state = guard.with(|s| s.state);
            if state != TxnState::Active {
                return Err(TxnError::NotActive(state).into());
            }
        }
        self.insert_reserved(&engine, &mut cursor, body)
    }

    /// Reserved insertion: used for forward records and prepare records.
    pub(crate) fn insert_reserved(
        &self,
        engine: &Arc<TxnEngine>,
        cursor: &mut LogCursor,
        body: LogBody,
    ) -> StorageResult<Lsn> {
        let record = LogRecord::new(self.tid(), cursor.last_lsn, body);
        let est = encoded_len(&record)? + INSERT_SLACK;
        self.reservation.ensure_ready(engine, est)?;
        let (lsn, bytes) = engine.log.insert(record)?;
        if !cursor.first_lsn.valid() {
            cursor.first_lsn = lsn;
        }
        cursor.last_lsn = lsn;
        cursor.undo_nxt = lsn;
        self.reservation
            .charge_forward(bytes, engine.config.undo_fudge_factor);
        engine.log.release_space(bytes);
        if let Some(stats) = &self.stats {
            stats.note_insert(bytes);
        }
        Ok(lsn)
    }

    /// End-of-transaction record insertion: draws on the undo budget set
    /// aside by forward logging instead of reserving anew, so commit and
    /// abort cannot fail for lack of log space.
    fn insert_protocol(
        &self,
        engine: &Arc<TxnEngine>,
        cursor: &mut LogCursor,
        body: LogBody,
    ) -> StorageResult<Lsn> {
        let record = LogRecord::new(self.tid(), cursor.last_lsn, body);
        let (lsn, bytes) = engine.log.insert(record)?;
        cursor.last_lsn = lsn;
        let consumed = self.reservation.charge_end(bytes);
        if consumed > 0 {
            engine.log.release_space(consumed);
        }
        if let Some(stats) = &self.stats {
            stats.note_insert(bytes);
        }
        Ok(lsn)
    }

    /// Take a savepoint: the LSN rollback_to will stop at (exclusive).
    pub fn save_point(&self) -> StorageResult<Lsn> {
        self.single_thread_attached()?;
        Ok(self.log_cursor.acquire().last_lsn)
    }

    /// Snapshot for checkpoint transaction-table records.
    pub(crate) fn table_entry(&self) -> TxnTableEntry {
        let cursor = self.log_cursor.acquire();
        let state = self.structural.acquire_after(&cursor).with(|s| s.state);
        TxnTableEntry {
            tid: self.tid(),
            state,
            first_lsn: cursor.first_lsn,
            last_lsn: cursor.last_lsn,
            undo_nxt: cursor.undo_nxt,
        }
    }

    // ---- Prepare ----

    /// Vote in two-phase commit. Read-only transactions vote `Readonly`
    /// without logging; logged transactions write a prepare record (plus
    /// exclusive-lock and store enumerations when enrolled with an external
    /// coordinator), flush it, and vote `Commit`.
    pub fn prepare(&self) -> StorageResult<Vote> {
        self.single_thread_attached()?;
        let engine = self.engine()?;
        let _chk = engine.checkpoint.serial_pair();
        let mut cursor = self.log_cursor.acquire();
        let guard = self.structural.acquire_after(&cursor);

        let state = guard.with(|s| s.state);
        if state != TxnState::Active {
            return Err(TxnError::NotActive(state).into());
        }
        if guard.with(|s| s.quark_depth > 0) {
            return Err(TxnError::InQuark(self.tid()).into());
        }

        // Load stores become regular before the vote, so prepared state is
        // unambiguous about store durability.
        guard.with(|s| s.load_stores.clear());

        self.change_state(&guard, TxnState::Preparing);

        if !cursor.first_lsn.valid() {
            guard.with(|s| s.vote = Some(Vote::Readonly));
            self.change_state(&guard, TxnState::Prepared);
            return Ok(Vote::Readonly);
        }

        let (gtid, stores) = guard.with(|s| (s.gtid.clone(), s.stores_to_free.clone()));
        self.insert_reserved(&engine, &mut cursor, LogBody::Prepare { gtid: gtid.clone() })?;
        if gtid.is_some() {
            let locks = engine.locks.exclusive_locks_of(self.tid());
            for chunk in locks.chunks(PREPARE_CHUNK) {
                self.insert_reserved(
                    &engine,
                    &mut cursor,
                    LogBody::PrepareLocks {
                        locks: chunk.to_vec(),
                    },
                )?;
            }
            for chunk in stores.chunks(PREPARE_CHUNK) {
                self.insert_reserved(
                    &engine,
                    &mut cursor,
                    LogBody::PrepareStoresToFree {
                        stores: chunk.to_vec(),
                    },
                )?;
            }
        }
        // The vote must be durable before it is given.
        engine.log.flush(cursor.last_lsn, true)?;

        guard.with(|s| s.vote = Some(Vote::Commit));
        self.change_state(&guard, TxnState::Prepared);
        Ok(Vote::Commit)
    }

    // ---- Commit / chain ----

    pub fn commit(&self) -> StorageResult<()> {
        self.commit_inner(false, false)
    }

    /// Lazy commit: the end records stay buffered instead of being synced.
    pub fn commit_lazy(&self) -> StorageResult<()> {
        self.commit_inner(true, false)
    }

    /// Commit the work so far and immediately re-arm this record as a new
    /// transaction that inherits the locks.
    pub fn chain(&self, lazy: bool) -> StorageResult<()> {
        self.commit_inner(lazy, true)
    }

    fn commit_inner(&self, lazy: bool, chain: bool) -> StorageResult<()> {
        self.single_thread_attached()?;
        let engine = self.engine()?;
        let _chk = engine.checkpoint.serial_pair();
        let mut cursor = self.log_cursor.acquire();
        let guard = self.structural.acquire_after(&cursor);

        let state = guard.with(|s| s.state);
        if !matches!(state, TxnState::Active | TxnState::Prepared) {
            return Err(TxnError::NotActive(state).into());
        }

        // Load stores become regular stores at commit.
        guard.with(|s| s.load_stores.clear());

        let logged = cursor.last_lsn.valid();
        if logged {
            self.change_state(&guard, if chain { TxnState::Chaining } else { TxnState::Committing });
            if !chain {
                self.change_state(&guard, TxnState::FreeingSpace);
            }
            self.insert_protocol(&engine, &mut cursor, LogBody::FreeingSpace)?;
            if !lazy {
                engine.log.flush(cursor.last_lsn, true)?;
            }

            // Physically free the stores marked for deletion.
            let freed = guard.with(|s| std::mem::take(&mut s.stores_to_free));
            if !freed.is_empty() {
                debug!("{} freeing {} stores at commit", self.tid(), freed.len());
            }

            if !chain {
                engine
                    .locks
                    .release_all(self.tid(), LockDuration::Long, true);
            }

            self.insert_protocol(&engine, &mut cursor, LogBody::End)?;
            if !lazy {
                engine.log.flush(cursor.last_lsn, true)?;
            }
        } else {
            if chain {
                self.change_state(&guard, TxnState::Chaining);
            } else {
                engine
                    .locks
                    .release_all(self.tid(), LockDuration::Long, true);
            }
        }

        if chain {
            self.rearm(&engine, &mut cursor, &guard)?;
        } else {
            self.change_state(&guard, TxnState::Ended);
            self.finish(&engine, &guard);
        }
        Ok(())
    }

    /// Chain reset: the same record continues as a fresh transaction. The
    /// directory rebind is one membership-gated step, and dependents are
    /// re-armed by the `Chaining -> Active` notification carrying the new
    /// tid.
    fn rearm(
        &self,
        engine: &Arc<TxnEngine>,
        cursor: &mut LogCursor,
        guard: &StructuralGuard<'_, Structural>,
    ) -> StorageResult<()> {
        self.reservation.release_all(&*engine.log);
        let old = self.tid();
        let new = engine.directory.next_tid()?;
        engine.directory.rebind(old, new);
        self.tid.store(new.raw(), Ordering::SeqCst);
        cursor.first_lsn = Lsn::NULL;
        cursor.last_lsn = Lsn::NULL;
        cursor.undo_nxt = Lsn::NULL;
        cursor.anchor = Lsn::NULL;
        cursor.depth = 0;
        guard.with(|s| {
            s.vote = None;
            s.sdesc.clear();
        });
        self.change_state(guard, TxnState::Active);
        debug!("chained {old} -> {new}");
        Ok(())
    }

    fn finish(&self, engine: &Arc<TxnEngine>, guard: &StructuralGuard<'_, Structural>) {
        engine.directory.remove(self.tid());
        self.reservation.release_all(&*engine.log);
        if let Some(info) = guard.with(|s| s.lock_info.take()) {
            recycle_lock_info(info);
        }
        // Detach from the driving thread.
        self.attached.fetch_sub(1, Ordering::AcqRel);
    }

    // ---- Abort ----

    /// Roll back everything and end the transaction.
    pub fn abort(&self) -> StorageResult<()> {
        self.single_thread_attached()?;
        let engine = self.engine()?;
        {
            let guard = self.structural.acquire();
            let state = guard.with(|s| s.state);
            if !matches!(
                state,
                TxnState::Active | TxnState::Preparing | TxnState::Prepared
            ) {
                return Err(TxnError::NotActive(state).into());
            }
            // Load stores are never destroyed-and-rolled-back, just forgotten.
            guard.with(|s| s.load_stores.clear());
            self.change_state(&guard, TxnState::Aborting);
        }

        // Undo everything before the end records are written.
        self.rollback_to(Lsn::NULL)?;

        let _chk = engine.checkpoint.serial_pair();
        let mut cursor = self.log_cursor.acquire();
        let guard = self.structural.acquire_after(&cursor);

        guard.with(|s| s.stores_to_free.clear());
        engine
            .locks
            .release_all(self.tid(), LockDuration::Long, true);

        if cursor.last_lsn.valid() {
            self.change_state(&guard, TxnState::FreeingSpace);
            self.insert_protocol(&engine, &mut cursor, LogBody::FreeingSpace)?;
            self.insert_protocol(&engine, &mut cursor, LogBody::Abort)?;
            engine.log.flush(cursor.last_lsn, true)?;
        }
        self.change_state(&guard, TxnState::Ended);
        self.finish(&engine, &guard);
        Ok(())
    }

    // ---- Crash simulation ----

    /// Force-release everything and mark `Ended` without logging or undo.
    /// Deliberately violates transaction semantics; reachable only from
    /// fault-injection harnesses.
    #[cfg(any(test, feature = "fault-injection"))]
    pub fn dispose(&self) -> StorageResult<()> {
        let engine = self.engine()?;
        let guard = self.structural.acquire();
        let (old, snapshot) = guard.with(|s| {
            let old = s.state;
            s.state = TxnState::Ended;
            s.stores_to_free.clear();
            s.load_stores.clear();
            (old, s.dependents.snapshot())
        });
        let tid = self.tid();
        for dependent in snapshot {
            dependent.on_transition(tid, old, TxnState::Ended);
        }
        engine.locks.release_all(tid, LockDuration::Long, true);
        engine.directory.remove(tid);
        self.reservation.release_all(&*engine.log);
        if let Some(info) = guard.with(|s| s.lock_info.take()) {
            recycle_lock_info(info);
        }
        self.attached.store(0, Ordering::Release);
        Ok(())
    }

    // ---- Forked log streams ----

    /// Fork a log stream, attaching another thread to this transaction.
    /// The log gate still admits only one logger at a time.
    pub fn fork_log_stream(self: &Arc<Self>) -> StorageResult<LogStream> {
        let state = self.state();
        if state != TxnState::Active {
            return Err(TxnError::NotActive(state).into());
        }
        self.attached.fetch_add(1, Ordering::AcqRel);
        Ok(LogStream {
            xct: Arc::clone(self),
            closed: false,
        })
    }

    pub(crate) fn updating_ops(&self) -> u32 {
        self.updating_ops.load(Ordering::Acquire)
    }

    pub(crate) fn bump_updating(&self) {
        self.updating_ops.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn drop_updating(&self) {
        self.updating_ops.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Drop for TransactionRecord {
    fn drop(&mut self) {
        // Safety net: a record dropped without commit or abort rolls back,
        // best-effort. During engine teardown the weak engine reference is
        // already dead and this is a no-op.
        if !self.state().is_terminal() {
            let _ = self.abort();
        }
    }
}

/// RAII marker for an in-flight updating operation.
pub struct UpdateScope<'a>(&'a TransactionRecord);

impl Drop for UpdateScope<'_> {
    fn drop(&mut self) {
        self.0.drop_updating();
    }
}

/// Handle for a forked log stream. Dropping detaches silently; `close`
/// enforces that the transaction is otherwise idle first.
pub struct LogStream {
    xct: Arc<TransactionRecord>,
    closed: bool,
}

impl LogStream {
    pub fn xct(&self) -> &Arc<TransactionRecord> {
        &self.xct
    }

    pub fn log_insert(&self, body: LogBody) -> StorageResult<Lsn> {
        self.xct.log_insert(body)
    }

    /// Close the stream. Closing the last extra stream while update
    /// operations are in flight is refused with `OneThread`.
    pub fn close(&mut self) -> StorageResult<()> {
        if self.closed {
            return Ok(());
        }
        if self.xct.attached.load(Ordering::Acquire) == 2 && self.xct.updating_ops() > 0 {
            return Err(TxnError::OneThread(self.xct.tid()).into());
        }
        self.closed = true;
        self.xct.attached.fetch_sub(1, Ordering::AcqRel);
        Ok(())
    }
}

impl Drop for LogStream {
    fn drop(&mut self) {
        if !self.closed {
            self.xct.attached.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::PageId;
    use crate::engine::EngineConfig;
    use crate::wal::file_log::FileLogConfig;

    fn test_engine() -> (Arc<TxnEngine>, tempfile::TempDir) {
        let dir = tempfile::TempDir::new().unwrap();
        let config = EngineConfig {
            log: FileLogConfig {
                path: dir.path().join("wal.log"),
                capacity: 1024 * 1024,
            },
            ..Default::default()
        };
        (TxnEngine::new(config).unwrap(), dir)
    }

    fn update_body() -> LogBody {
        LogBody::Update {
            undoable: true,
            logical: false,
            page: PageId(1),
            redo: vec![1, 2, 3],
            undo: vec![3, 2, 1],
        }
    }

    #[test]
    fn test_stats_counters() {
        let stats = TxnStats::new();
        stats.note_insert(100);
        stats.note_insert(20);
        stats.note_compensation();
        stats.note_rollback();
        assert_eq!(stats.log_records(), 2);
        assert_eq!(stats.log_bytes(), 120);
        assert_eq!(stats.compensations(), 1);
        assert_eq!(stats.rollbacks(), 1);
    }

    #[test]
    fn test_dispose_skips_logging_and_undo() {
        let (engine, _dir) = test_engine();
        let txn = engine.begin().unwrap();
        txn.log_insert(update_body()).unwrap();
        assert!(engine.lookup(txn.tid()).is_some());

        txn.dispose().unwrap();
        assert_eq!(txn.state(), TxnState::Ended);
        assert!(engine.lookup(txn.tid()).is_none());
        // No compensation, freeing-space, or end records were written: the
        // log still holds exactly the one forward record.
        let mut count = 0usize;
        engine.for_each_active_transaction(|_| count += 1);
        assert_eq!(count, 0);
        assert_eq!(txn.reservation().reserved(), 0);
    }

    #[test]
    fn test_update_scope_counts() {
        let (engine, _dir) = test_engine();
        let txn = engine.begin().unwrap();
        assert_eq!(txn.updating_ops(), 0);
        {
            let _a = txn.update_scope();
            let _b = txn.update_scope();
            assert_eq!(txn.updating_ops(), 2);
        }
        assert_eq!(txn.updating_ops(), 0);
        txn.commit().unwrap();
    }
}
