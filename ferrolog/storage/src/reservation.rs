//! Per-transaction log-space reservation.
//!
//! Every byte of forward logging sets aside a multiple of its length for
//! the compensation record an eventual rollback would write, so that
//! rollback can never fail for lack of log space. The three counters:
//!
//! - `used`    : bytes already written during forward processing
//! - `ready`   : bytes available for further forward logging
//! - `reserved`: bytes set aside for undoing what has been logged so far
//!
//! `ready + reserved` is drawn from, and returned to, the shared log-space
//! budget owned by the log device.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use ferrolog_transaction::error::TxnError;
use log::debug;

use crate::engine::TxnEngine;
use crate::wal::LogDevice;

const RETRY_BACKOFF: Duration = Duration::from_millis(10);

#[derive(Debug, Default)]
pub struct LogReservation {
    used: AtomicU64,
    ready: AtomicU64,
    reserved: AtomicU64,
}

impl LogReservation {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub fn used(&self) -> u64 {
        self.used.load(Ordering::Acquire)
    }

    pub fn ready(&self) -> u64 {
        self.ready.load(Ordering::Acquire)
    }

    pub fn reserved(&self) -> u64 {
        self.reserved.load(Ordering::Acquire)
    }

    /// Make sure `ready` can cover a record of `min_bytes` plus the undo
    /// budget it will require. On a shortfall, the global pool is asked for
    /// the difference; between bounded retries the checkpoint thread is
    /// nudged and the caller's old dirty pages are forced, which is what
    /// frees reclaimable log space. Exhausting the retry budget surfaces
    /// `OutOfLogSpace`: the only safe response is to abort the transaction.
    pub(crate) fn ensure_ready(&self, engine: &TxnEngine, min_bytes: u64) -> Result<(), TxnError> {
        let fudge = engine.config.undo_fudge_factor;
        let needed = min_bytes.saturating_mul(1 + fudge);
        let have = self.ready.load(Ordering::Acquire);
        if have >= needed {
            return Ok(());
        }
        let want = needed - have;
        let retries = engine.config.reservation_retries;
        for attempt in 0..retries {
            if engine.log.reserve_space(want) {
                self.ready.fetch_add(want, Ordering::AcqRel);
                return Ok(());
            }
            debug!(
                "log space low ({} left, want {want}), attempt {attempt}",
                engine.log.space_left()
            );
            engine.checkpoint.wakeup_and_take();
            engine.buffer.force_my_dirty_old_pages(None);
            std::thread::sleep(RETRY_BACKOFF);
        }
        Err(TxnError::OutOfLogSpace(retries))
    }

    /// Account for a durably inserted forward record of `len` bytes:
    /// `len` moves from `ready` to `used` and `len × fudge` from `ready`
    /// to `reserved`. The caller releases the `used` share back to the
    /// pool, since the written content is now accounted by the device.
    pub(crate) fn charge_forward(&self, len: u64, fudge: u64) {
        let take = len.saturating_mul(1 + fudge);
        let prev = self.ready.fetch_sub(take, Ordering::AcqRel);
        assert!(
            prev >= take,
            "log reservation ready underflow ({prev} < {take}); \
             forward logging outran ensure_ready"
        );
        self.used.fetch_add(len, Ordering::AcqRel);
        self.reserved.fetch_add(len * fudge, Ordering::AcqRel);
    }

    /// Account for undoing a record of `len` bytes. Underflow here means
    /// the reservation arithmetic is broken, which would let a future
    /// rollback run out of space; that is a bug, not a runtime condition.
    pub(crate) fn charge_undo(&self, len: u64) {
        let prev = self.reserved.fetch_sub(len, Ordering::AcqRel);
        assert!(
            prev >= len,
            "log reservation underflow while undoing ({prev} < {len}); \
             reservation accounting bug"
        );
    }

    /// Draw up to `len` bytes of end-of-transaction record space out of
    /// `reserved`. Returns how much was actually drawn; the asymmetric
    /// end records may exceed what a tiny transaction reserved, and the
    /// remainder is absorbed by the device's content accounting.
    pub(crate) fn charge_end(&self, len: u64) -> u64 {
        let mut cur = self.reserved.load(Ordering::Acquire);
        loop {
            let take = cur.min(len);
            match self.reserved.compare_exchange_weak(
                cur,
                cur - take,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return take,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Return everything still held to the global pool and zero the
    /// counters. Called at transaction end and at chaining.
    pub(crate) fn release_all(&self, log: &dyn LogDevice) -> u64 {
        let freed = self.ready.swap(0, Ordering::AcqRel) + self.reserved.swap(0, Ordering::AcqRel);
        self.used.store(0, Ordering::Release);
        if freed > 0 {
            log.release_space(freed);
        }
        freed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_charge_moves_ready_to_reserved() {
        let res = LogReservation::new();
        res.ready.store(300, Ordering::Release);
        res.charge_forward(100, 2);
        assert_eq!(res.ready(), 0);
        assert_eq!(res.used(), 100);
        assert_eq!(res.reserved(), 200);
    }

    #[test]
    fn test_undo_charge_draws_from_reserved() {
        let res = LogReservation::new();
        res.ready.store(300, Ordering::Release);
        res.charge_forward(100, 2);
        res.charge_undo(150);
        assert_eq!(res.reserved(), 50);
    }

    #[test]
    #[should_panic(expected = "reservation accounting bug")]
    fn test_undo_underflow_panics() {
        let res = LogReservation::new();
        res.charge_undo(1);
    }

    #[test]
    fn test_end_charge_saturates() {
        let res = LogReservation::new();
        res.ready.store(30, Ordering::Release);
        res.charge_forward(10, 2);
        assert_eq!(res.charge_end(15), 15);
        assert_eq!(res.charge_end(15), 5);
        assert_eq!(res.reserved(), 0);
    }
}
