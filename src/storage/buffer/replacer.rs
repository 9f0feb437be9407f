use std::fmt::Debug;

use crate::storage::page::VirtualPageId;

/// Chooses which unreferenced cached page to scavenge next.
pub trait Replacer: Send + Sync + Debug {
    /// Select a page to evict. Returns None if no page can be evicted.
    fn evict(&mut self) -> Option<VirtualPageId>;

    /// Mark a page as referenced (not evictable).
    fn pin(&mut self, page_id: VirtualPageId);

    /// Mark a page as unreferenced (evictable).
    fn unpin(&mut self, page_id: VirtualPageId);

    /// Forget a page that left the cache.
    fn remove(&mut self, page_id: VirtualPageId);

    /// Get the number of evictable pages.
    fn size(&self) -> usize;
}
