//! Transaction identifiers and the watermarked id generator.
//!
//! Transaction ids are globally unique and monotonically increasing. The
//! generator keeps a watermark so that ids injected during recovery can never
//! collide with ids handed out by later `begin` calls.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::TidError;

/// A globally unique, monotonically increasing transaction identifier.
/// Zero is reserved as the invalid sentinel.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct TransactionId(u64);

impl TransactionId {
    /// The invalid (never-issued) transaction id.
    pub const INVALID: TransactionId = TransactionId(0);

    /// Create a transaction id from a raw value.
    pub fn with_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw value of the id.
    pub fn raw(&self) -> u64 {
        self.0
    }

    /// Returns true if this id was actually issued.
    pub fn is_valid(&self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tid:{}", self.0)
    }
}

/// Transaction id generator with a recovery watermark.
///
/// `next` hands out strictly increasing ids; `update_if_greater` lets
/// recovery-assigned ids bump the watermark so future `next` calls never
/// collide with an id observed in the log.
pub struct TidGenerator {
    counter: AtomicU64,
}

impl TidGenerator {
    /// Create a new generator. The first issued id is 1.
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(1),
        }
    }

    /// Create a generator with a starting value.
    pub fn with_start(start: u64) -> Self {
        Self {
            counter: AtomicU64::new(start),
        }
    }

    /// Issue the next transaction id.
    pub fn next(&self) -> Result<TransactionId, TidError> {
        let mut cur = self.counter.load(Ordering::SeqCst);
        loop {
            if cur == u64::MAX {
                return Err(TidError::Overflow(cur));
            }
            match self.counter.compare_exchange_weak(
                cur,
                cur + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Ok(TransactionId::with_raw(cur)),
                Err(actual) => cur = actual,
            }
        }
    }

    /// The watermark: the next id that would be issued.
    pub fn current(&self) -> TransactionId {
        TransactionId::with_raw(self.counter.load(Ordering::SeqCst))
    }

    /// Bump the watermark past an externally assigned id (recovery path).
    pub fn update_if_greater(&self, tid: TransactionId) -> Result<(), TidError> {
        if tid.raw() == u64::MAX {
            return Err(TidError::Overflow(tid.raw()));
        }
        self.counter.fetch_max(tid.raw() + 1, Ordering::SeqCst);
        Ok(())
    }
}

impl Default for TidGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tids_are_monotonic() {
        let generator = TidGenerator::new();
        let a = generator.next().unwrap();
        let b = generator.next().unwrap();
        assert!(a.is_valid());
        assert!(b > a);
        assert_eq!(generator.current().raw(), b.raw() + 1);
    }

    #[test]
    fn test_update_if_greater_bumps_watermark() {
        let generator = TidGenerator::new();
        generator
            .update_if_greater(TransactionId::with_raw(100))
            .unwrap();
        let next = generator.next().unwrap();
        assert_eq!(next.raw(), 101);

        // A smaller id must not move the watermark backwards.
        generator
            .update_if_greater(TransactionId::with_raw(5))
            .unwrap();
        assert!(generator.next().unwrap().raw() > 101);
    }

    #[test]
    fn test_overflow_is_reported() {
        let generator = TidGenerator::with_start(u64::MAX);
        assert!(matches!(generator.next(), Err(TidError::Overflow(_))));
    }
}
