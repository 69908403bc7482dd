use super::lru::LruReplacer;
use super::replacer::Replacer;
use super::CacheStats;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::{Page, PageId, PageRef};
use crate::storage::resource::ResourceManager;
use log::debug;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::{Arc, Weak};

/// Cache that hands out the same page instance while anything holds it.
///
/// Every page that passes through is remembered by weak reference, and the
/// `capacity` most recently used ones are also pinned strongly. A page falls
/// out only when it has left the pinned set and no caller holds it anymore.
pub struct ReferenceCachedResourceManager<R> {
    inner: R,
    capacity: usize,
    state: Mutex<ReferenceState>,
}

struct ReferenceState {
    weak: HashMap<PageId, Weak<RwLock<Page>>>,
    pinned: HashMap<PageId, PageRef>,
    replacer: LruReplacer,
    stats: CacheStats,
}

impl ReferenceState {
    fn lookup(&self, page_id: PageId) -> Option<PageRef> {
        if let Some(page) = self.pinned.get(&page_id) {
            return Some(page.clone());
        }
        self.weak.get(&page_id).and_then(Weak::upgrade)
    }

    fn admit(&mut self, page_id: PageId, page: &PageRef, capacity: usize) {
        self.weak.insert(page_id, Arc::downgrade(page));

        if capacity > 0 {
            if !self.pinned.contains_key(&page_id) {
                while self.pinned.len() >= capacity {
                    let Some(victim) = self.replacer.evict() else {
                        break;
                    };
                    self.pinned.remove(&victim);
                    self.stats.evictions += 1;
                    debug!("unpinned page {}", victim);
                }
            }
            self.pinned.insert(page_id, page.clone());
            self.replacer.record_access(page_id);
        }

        self.prune();
    }

    /// Drop weak entries whose page is gone.
    fn prune(&mut self) {
        if self.weak.len() > 2 * self.pinned.len().max(16) {
            self.weak.retain(|_, page| page.strong_count() > 0);
        }
    }

    fn forget(&mut self, page_id: PageId) -> bool {
        self.replacer.remove(page_id);
        let pinned = self.pinned.remove(&page_id).is_some();
        let tracked = self.weak.remove(&page_id).is_some();
        pinned || tracked
    }

    fn clear(&mut self) {
        self.weak.clear();
        self.pinned.clear();
        self.replacer.clear();
    }
}

impl<R: ResourceManager> ReferenceCachedResourceManager<R> {
    pub fn new(inner: R, capacity: usize) -> Self {
        Self {
            inner,
            capacity,
            state: Mutex::new(ReferenceState {
                weak: HashMap::new(),
                pinned: HashMap::with_capacity(capacity),
                replacer: LruReplacer::with_capacity(capacity),
                stats: CacheStats::default(),
            }),
        }
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> CacheStats {
        self.state.lock().stats
    }

    /// Forget a page entirely, pinned or not. The next fetch yields a new
    /// instance even if the old one is still held somewhere.
    pub fn evict(&self, page_id: PageId) -> bool {
        self.state.lock().forget(page_id)
    }

    pub fn invalidate(&self) {
        self.state.lock().clear();
    }

    fn ensure_open(&self) -> StorageResult<()> {
        if self.inner.is_open() {
            Ok(())
        } else {
            Err(StorageError::ResourceNotOpen("cached resource".to_string()))
        }
    }
}

impl<R: ResourceManager> ResourceManager for ReferenceCachedResourceManager<R> {
    fn open(&self) -> StorageResult<()> {
        self.invalidate();
        self.inner.open()
    }

    fn close(&self) -> StorageResult<()> {
        self.invalidate();
        self.inner.close()
    }

    fn is_open(&self) -> bool {
        self.inner.is_open()
    }

    fn page_size(&self) -> usize {
        self.inner.page_size()
    }

    fn num_pages(&self) -> StorageResult<usize> {
        self.inner.num_pages()
    }

    fn has_page(&self, id: PageId) -> StorageResult<bool> {
        self.inner.has_page(id)
    }

    fn create_page(&self) -> StorageResult<PageRef> {
        let page = self.inner.create_page()?;
        let id = page.read().id();
        self.state.lock().admit(id, &page, self.capacity);
        Ok(page)
    }

    fn get_page(&self, id: PageId) -> StorageResult<PageRef> {
        self.ensure_open()?;
        {
            let mut state = self.state.lock();
            if let Some(page) = state.lookup(id) {
                state.stats.hits += 1;
                // Re-pin a page that was only reachable through its weak entry.
                state.admit(id, &page, self.capacity);
                return Ok(page);
            }
            state.stats.misses += 1;
        }

        let page = self.inner.get_page(id)?;
        self.state.lock().admit(id, &page, self.capacity);
        Ok(page)
    }

    fn write_page(&self, page: &PageRef) -> StorageResult<()> {
        self.inner.write_page(page)?;

        let id = page.read().id();
        let mut state = self.state.lock();
        let same = state
            .lookup(id)
            .map(|resident| Arc::ptr_eq(&resident, page))
            .unwrap_or(false);
        if !same {
            state.admit(id, page, self.capacity);
        }
        Ok(())
    }

    fn remove_page(&self, id: PageId) -> StorageResult<()> {
        self.inner.remove_page(id)?;
        self.state.lock().forget(id);
        Ok(())
    }

    fn sync(&self) -> StorageResult<()> {
        self.inner.sync()
    }

    fn clear(&self) -> StorageResult<()> {
        self.invalidate();
        self.inner.clear()
    }
}
