//! Store identifiers and the per-transaction store-descriptor cache.

use serde::{Deserialize, Serialize};

/// Identifier of a store: a page-allocation unit owned by an access method.
/// Store contents and formats belong to the access-method collaborators;
/// the transaction core only tracks stores pending deletion or pending
/// conversion from load/temporary status at commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StoreId(pub u32);

/// Per-transaction cache of the most recently used store descriptor.
///
/// The cache must be dropped after rollback: undo may have collapsed a
/// multi-page store back to a single-page one, leaving the cached
/// descriptor stale.
#[derive(Debug, Default)]
pub(crate) struct SdescCache {
    last: Option<StoreId>,
}

impl SdescCache {
    pub(crate) fn remember(&mut self, store: StoreId) {
        self.last = Some(store);
    }

    pub(crate) fn cached(&self) -> Option<StoreId> {
        self.last
    }

    pub(crate) fn clear(&mut self) {
        self.last = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_roundtrip_and_clear() {
        let mut cache = SdescCache::default();
        assert_eq!(cache.cached(), None);
        cache.remember(StoreId(7));
        assert_eq!(cache.cached(), Some(StoreId(7)));
        cache.clear();
        assert_eq!(cache.cached(), None);
    }
}
