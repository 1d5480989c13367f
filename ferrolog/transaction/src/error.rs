use thiserror::Error;

use crate::state::TxnState;
use crate::tid::TransactionId;

/// Errors from the transaction id generator.
#[derive(Error, Debug)]
pub enum TidError {
    #[error("transaction id overflow, reached {0}")]
    Overflow(u64),
}

/// Protocol and resource errors surfaced to callers of the transaction core.
///
/// Invariant violations (reservation underflow, nested rollback, illegal
/// state transitions) are deliberately *not* represented here; they are
/// bugs, and the core panics with a diagnostic instead of returning them.
#[derive(Error, Debug)]
pub enum TxnError {
    #[error("more than one thread attached to {0}")]
    TwoThread(TransactionId),

    #[error("last log stream of {0} closed while update operations are in flight")]
    OneThread(TransactionId),

    #[error("{0} holds an open early-lock-release scope")]
    InQuark(TransactionId),

    #[error("{0} already participates in external two-phase commit")]
    Extern2pc(TransactionId),

    #[error("out of log space after {0} reservation attempts")]
    OutOfLogSpace(u32),

    #[error("transaction not found: {0}")]
    NotFound(TransactionId),

    #[error("operation requires an active transaction, state is {0:?}")]
    NotActive(TxnState),

    #[error("engine has shut down")]
    EngineShutdown,

    #[error(transparent)]
    Tid(#[from] TidError),
}
