//! Per-transaction lock bookkeeping and an in-memory lock table.
//!
//! The real lock manager is a collaborator behind the [`LockManager`]
//! trait; [`TableLockManager`] is the in-memory implementation used by
//! tests and by embedders that have no external lock manager.

use std::cell::RefCell;
use std::collections::HashMap;

use ferrolog_transaction::lock::{
    LockDuration, LockError, LockManager, LockMode, LockTimeout, ResourceId,
};
use ferrolog_transaction::tid::TransactionId;
use parking_lot::Mutex;

/// Per-transaction lock state, exclusively owned by the transaction record.
#[derive(Debug, Default)]
pub struct LockInfo {
    held: Vec<(ResourceId, LockMode, LockDuration)>,
    wait_on: Option<ResourceId>,
}

impl LockInfo {
    pub(crate) fn note_held(&mut self, resource: ResourceId, mode: LockMode, dur: LockDuration) {
        self.held.push((resource, mode, dur));
    }

    pub fn held(&self) -> &[(ResourceId, LockMode, LockDuration)] {
        &self.held
    }

    pub(crate) fn set_wait(&mut self, resource: Option<ResourceId>) {
        self.wait_on = resource;
    }

    pub fn waiting_on(&self) -> Option<ResourceId> {
        self.wait_on
    }

    fn reset(&mut self) {
        self.held.clear();
        self.wait_on = None;
    }
}

const FREE_LIST_CAP: usize = 8;

thread_local! {
    static LOCK_INFO_FREE_LIST: RefCell<Vec<Box<LockInfo>>> = const { RefCell::new(Vec::new()) };
}

/// Take a lock-info box from the calling thread's free list.
pub(crate) fn acquire_lock_info() -> Box<LockInfo> {
    LOCK_INFO_FREE_LIST.with(|list| list.borrow_mut().pop().unwrap_or_default())
}

/// Return a lock-info box to the calling thread's free list for reuse.
pub(crate) fn recycle_lock_info(mut info: Box<LockInfo>) {
    info.reset();
    LOCK_INFO_FREE_LIST.with(|list| {
        let mut list = list.borrow_mut();
        if list.len() < FREE_LIST_CAP {
            list.push(info);
        }
    });
}

fn compatible(a: LockMode, b: LockMode) -> bool {
    use LockMode::*;
    match (a, b) {
        (NL, _) | (_, NL) => true,
        (IS, EX) | (EX, IS) => false,
        (IS, _) | (_, IS) => true,
        (IX, IX) => true,
        (SH, SH) | (SH, UD) => true,
        (UD, SH) => true,
        _ => false,
    }
}

/// In-memory lock table. Conflicts are reported immediately as timeouts
/// rather than blocking; real lock managers queue and schedule waits.
#[derive(Default)]
pub struct TableLockManager {
    table: Mutex<HashMap<ResourceId, Vec<(TransactionId, LockMode, LockDuration)>>>,
}

impl TableLockManager {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LockManager for TableLockManager {
    fn acquire(
        &self,
        tid: TransactionId,
        resource: ResourceId,
        mode: LockMode,
        duration: LockDuration,
        _timeout: LockTimeout,
    ) -> Result<(), LockError> {
        let mut table = self.table.lock();
        let holders = table.entry(resource).or_default();
        for (holder, held_mode, _) in holders.iter() {
            if *holder != tid && !compatible(*held_mode, mode) {
                return Err(LockError::Timeout(resource));
            }
        }
        holders.push((tid, mode, duration));
        Ok(())
    }

    fn release_all(&self, tid: TransactionId, duration_floor: LockDuration, _free_extents: bool) {
        let mut table = self.table.lock();
        table.retain(|_, holders| {
            holders.retain(|(holder, _, dur)| *holder != tid || *dur > duration_floor);
            !holders.is_empty()
        });
    }

    fn query(&self, tid: TransactionId, resource: ResourceId) -> LockMode {
        let table = self.table.lock();
        table
            .get(&resource)
            .into_iter()
            .flatten()
            .filter(|(holder, _, _)| *holder == tid)
            .map(|(_, mode, _)| *mode)
            .max()
            .unwrap_or(LockMode::NL)
    }

    fn exclusive_locks_of(&self, tid: TransactionId) -> Vec<(ResourceId, LockMode)> {
        let table = self.table.lock();
        let mut locks: Vec<_> = table
            .iter()
            .flat_map(|(resource, holders)| {
                holders
                    .iter()
                    .filter(|(holder, mode, _)| *holder == tid && mode.is_exclusive())
                    .map(|(_, mode, _)| (*resource, *mode))
            })
            .collect();
        locks.sort_by_key(|(resource, _)| resource.0);
        locks
    }
}
