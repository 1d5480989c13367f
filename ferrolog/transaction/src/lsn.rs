//! Log sequence numbers.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A totally ordered position in the write-ahead log. Zero is the null
/// sentinel: it compares below every valid LSN, which makes "rollback to the
/// beginning" expressible as `rollback_to(Lsn::NULL)`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Lsn(u64);

impl Lsn {
    /// The null LSN; no record ever carries it.
    pub const NULL: Lsn = Lsn(0);

    /// The greatest representable LSN, used as an "everything" flush bound.
    pub const MAX: Lsn = Lsn(u64::MAX);

    /// Create an LSN from a raw value.
    pub fn with_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw value.
    pub fn raw(&self) -> u64 {
        self.0
    }

    /// Returns true if this LSN points at an actual record.
    pub fn valid(&self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lsn:{}", self.0)
    }
}
