//! The buffer-pool collaborator interface.
//!
//! Page formats and replacement policy belong to the buffer pool itself;
//! the transaction core only needs to fix pages exclusively for physical
//! undo and to force dirty pages when log space runs low.

use std::sync::atomic::{AtomicU64, Ordering};

use ferrolog_transaction::lsn::Lsn;
use serde::{Deserialize, Serialize};

use crate::error::StorageResult;

/// Identifier of a page in the buffer pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PageId(pub u64);

/// Latch mode requested when fixing a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatchMode {
    Shared,
    Exclusive,
}

/// A fixed page handle. The pool unfixes on drop; the transaction core
/// treats the contents as opaque.
#[derive(Debug)]
pub struct Page {
    pub id: PageId,
    pub rec_lsn: Lsn,
}

/// The buffer-pool interface consumed by the engine core.
pub trait BufferPool: Send + Sync {
    /// Fix `page` under `mode`.
    fn fix(&self, page: PageId, mode: LatchMode) -> StorageResult<Page>;

    /// Force the caller's old dirty pages (or just `page`, if given) to
    /// disk so their log records become reclaimable. Returns true if
    /// anything was written.
    fn force_my_dirty_old_pages(&self, page: Option<PageId>) -> bool;

    /// Force every page whose recovery LSN is at or below `lsn`.
    fn force_until_lsn(&self, lsn: Lsn) -> Result<(), ()>;
}

/// In-memory buffer pool double used by tests and embedders without a real
/// page cache. Counts calls so tests can assert the low-space path nudged it.
#[derive(Debug, Default)]
pub struct InMemoryBufferPool {
    fixes: AtomicU64,
    forces: AtomicU64,
}

impl InMemoryBufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fix_count(&self) -> u64 {
        self.fixes.load(Ordering::Acquire)
    }

    pub fn force_count(&self) -> u64 {
        self.forces.load(Ordering::Acquire)
    }
}

impl BufferPool for InMemoryBufferPool {
    fn fix(&self, page: PageId, _mode: LatchMode) -> StorageResult<Page> {
        self.fixes.fetch_add(1, Ordering::AcqRel);
        Ok(Page {
            id: page,
            rec_lsn: Lsn::NULL,
        })
    }

    fn force_my_dirty_old_pages(&self, _page: Option<PageId>) -> bool {
        self.forces.fetch_add(1, Ordering::AcqRel);
        false
    }

    fn force_until_lsn(&self, _lsn: Lsn) -> Result<(), ()> {
        self.forces.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}
