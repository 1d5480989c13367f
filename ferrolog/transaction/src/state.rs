//! The transaction state machine.
//!
//! States progress monotonically from `Active` to `Ended`, with one
//! exception: a chained transaction is reset from `Chaining` back to
//! `Active` under a freshly assigned transaction id.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxnState {
    /// Normal forward processing.
    Active,
    /// A prepare call is in flight.
    Preparing,
    /// The transaction voted in two-phase commit and awaits the decision.
    Prepared,
    /// Commit processing has begun.
    Committing,
    /// Commit-and-chain processing has begun; the record will be reused.
    Chaining,
    /// Abort processing has begun.
    Aborting,
    /// End-of-transaction log space is being released.
    FreeingSpace,
    /// Terminal state; the record is about to be destroyed (or rearmed).
    Ended,
}

impl TxnState {
    /// Returns true if `next` is a legal successor of `self`.
    ///
    /// `Chaining -> Active` is the only non-monotonic edge; it is always
    /// accompanied by a transaction-id change and a log-cursor reset.
    pub fn can_transition_to(self, next: TxnState) -> bool {
        use TxnState::*;
        matches!(
            (self, next),
            (Active, Preparing)
                | (Active, Committing)
                | (Active, Chaining)
                | (Active, Aborting)
                | (Active, Ended)
                | (Preparing, Prepared)
                | (Preparing, Aborting)
                | (Prepared, Committing)
                | (Prepared, Chaining)
                | (Prepared, Aborting)
                | (Prepared, Ended)
                | (Committing, FreeingSpace)
                | (Aborting, FreeingSpace)
                | (Aborting, Ended)
                | (Chaining, Active)
                | (FreeingSpace, Ended)
        )
    }

    /// Returns true if the transaction has finished.
    pub fn is_terminal(self) -> bool {
        matches!(self, TxnState::Ended)
    }
}

/// Outcome of the voting phase of two-phase commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vote {
    /// The transaction logged work and is ready to commit.
    Commit,
    /// The transaction logged nothing; the coordinator may forget it.
    Readonly,
    /// The transaction cannot commit.
    Abort,
}
