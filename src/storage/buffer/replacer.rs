use crate::storage::page::PageId;
use std::fmt::Debug;

pub trait Replacer: Send + Sync + Debug {
    /// Mark a page as just used, making it the last candidate for eviction.
    fn record_access(&mut self, page_id: PageId);

    /// Select a page to evict and stop tracking it. Returns None if nothing is tracked.
    fn evict(&mut self) -> Option<PageId>;

    /// Stop tracking a page without evicting it.
    fn remove(&mut self, page_id: PageId);

    /// Get the number of tracked pages.
    fn size(&self) -> usize;

    fn clear(&mut self);
}
