//! Dependent notification.
//!
//! Auxiliary structures (caches, lock info, coordinators) register as weak
//! dependents of a transaction and are called back on every state change.
//! The transaction owns the list; dependents must deregister before their
//! own destruction, and dead weak entries are pruned lazily.

use std::sync::{Arc, Weak};

use ferrolog_transaction::state::TxnState;
use ferrolog_transaction::tid::TransactionId;

/// Observer of transaction state transitions.
///
/// Callbacks run under the transaction's structural gate (which is
/// reentrant, so a callback may call back into structural-gate methods)
/// and, during commit processing, under the log gate as well — a callback
/// must therefore not log or read the log cursor. A callback may
/// unregister *other* dependents of the same transaction: notification
/// iterates over a snapshot, never the live list.
pub trait Dependent: Send + Sync {
    fn on_transition(&self, tid: TransactionId, old: TxnState, new: TxnState);
}

/// The per-transaction dependent list, protected by the structural gate.
#[derive(Default)]
pub(crate) struct DependentList {
    entries: Vec<Weak<dyn Dependent>>,
}

impl DependentList {
    pub(crate) fn register(&mut self, dependent: &Arc<dyn Dependent>) {
        self.entries.push(Arc::downgrade(dependent));
    }

    pub(crate) fn unregister(&mut self, dependent: &Arc<dyn Dependent>) {
        self.entries
            .retain(|w| !std::ptr::addr_eq(w.as_ptr(), Arc::as_ptr(dependent)));
    }

    /// Upgrade the live entries and prune the dead ones.
    pub(crate) fn snapshot(&mut self) -> Vec<Arc<dyn Dependent>> {
        let mut live = Vec::with_capacity(self.entries.len());
        self.entries.retain(|w| match w.upgrade() {
            Some(strong) => {
                live.push(strong);
                true
            }
            None => false,
        });
        live
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
