//! Lock-collaborator vocabulary and the consumed lock-manager interface.
//!
//! The engine core never implements lock scheduling itself; it talks to a
//! [`LockManager`] collaborator through this trait.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::tid::TransactionId;

/// Lock modes in increasing strength: NL < IS < IX < SH < SIX < UD < EX.
/// The derived order follows declaration order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum LockMode {
    /// No lock.
    NL,
    /// Intention shared.
    IS,
    /// Intention exclusive.
    IX,
    /// Shared.
    SH,
    /// Shared with intention exclusive.
    SIX,
    /// Update.
    UD,
    /// Exclusive.
    EX,
}

impl LockMode {
    /// Modes that must be re-established before a prepared transaction can
    /// be rolled back; these are the ones enumerated in prepare-lock records.
    pub fn is_exclusive(&self) -> bool {
        matches!(self, LockMode::IX | LockMode::SIX | LockMode::UD | LockMode::EX)
    }
}

/// Identifier of a lockable resource (page, record, store...). The mapping
/// from database entities to resource ids is owned by the lock manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceId(pub u64);

/// How long a lock is held. `release_all` takes a duration floor: every lock
/// with a duration at or below the floor is released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockDuration {
    /// Released as soon as the protected operation completes.
    Instant,
    /// Released at quark close or statement end.
    Short,
    /// Held to end of transaction.
    Long,
}

/// Wait budget for a lock request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockTimeout {
    /// Block until granted.
    WaitForever,
    /// Fail immediately on conflict.
    WaitImmediate,
    /// Block up to the given number of milliseconds.
    Millis(u64),
}

/// Errors surfaced by a lock manager.
#[derive(Error, Debug)]
pub enum LockError {
    #[error("lock wait timed out on {0:?}")]
    Timeout(ResourceId),

    #[error("deadlock detected while waiting on {0:?}")]
    Deadlock(ResourceId),

    #[error("lock upgrade rejected on {0:?}")]
    Upgrade(ResourceId),
}

/// The lock-manager interface consumed by the engine core.
pub trait LockManager: Send + Sync {
    /// Acquire `resource` in `mode` on behalf of `tid`, blocking according
    /// to `timeout`.
    fn acquire(
        &self,
        tid: TransactionId,
        resource: ResourceId,
        mode: LockMode,
        duration: LockDuration,
        timeout: LockTimeout,
    ) -> Result<(), LockError>;

    /// Release every lock of `tid` whose duration is at or below
    /// `duration_floor`. `free_extents` additionally returns freed extents
    /// to the space manager (commit/abort pass true, quark close false).
    fn release_all(&self, tid: TransactionId, duration_floor: LockDuration, free_extents: bool);

    /// The strongest mode `tid` holds on `resource` (`NL` if none).
    fn query(&self, tid: TransactionId, resource: ResourceId) -> LockMode;

    /// All exclusive-class locks held by `tid`, for prepare-lock records.
    fn exclusive_locks_of(&self, tid: TransactionId) -> Vec<(ResourceId, LockMode)>;
}
