//! Caching decorators for resource managers.
//!
//! Both decorators serve `get_page`/`create_page` from memory before asking
//! the wrapped manager. Neither writes pages back on eviction: a page that
//! falls out of the cache is simply dropped, so the node layer must write
//! every mutation through before it returns.
//!
//! - [`LruCachedResourceManager`] keeps at most `capacity` pages and evicts
//!   the least recently used one. A page fetched again after eviction is a new
//!   in-memory instance.
//! - [`ReferenceCachedResourceManager`] additionally remembers every page it
//!   handed out through a weak reference, so repeated fetches return the same
//!   instance for as long as anybody still holds it.

pub mod lru;
pub mod reference;
pub mod replacer;

pub use reference::ReferenceCachedResourceManager;

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::{PageId, PageRef};
use crate::storage::resource::ResourceManager;
use log::debug;
use lru::LruReplacer;
use parking_lot::Mutex;
use replacer::Replacer;
use std::collections::HashMap;
use std::sync::Arc;

/// Counters describing how a cache has been used since it was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

pub struct LruCachedResourceManager<R> {
    inner: R,
    capacity: usize,
    state: Mutex<LruState>,
}

struct LruState {
    pages: HashMap<PageId, PageRef>,
    replacer: LruReplacer,
    stats: CacheStats,
}

impl LruState {
    fn admit(&mut self, page_id: PageId, page: PageRef, capacity: usize) {
        if capacity == 0 {
            return;
        }

        if !self.pages.contains_key(&page_id) {
            while self.pages.len() >= capacity {
                let Some(victim) = self.replacer.evict() else {
                    break;
                };
                self.pages.remove(&victim);
                self.stats.evictions += 1;
                debug!("evicted page {} from cache", victim);
            }
        }

        self.pages.insert(page_id, page);
        self.replacer.record_access(page_id);
    }

    fn forget(&mut self, page_id: PageId) -> bool {
        self.replacer.remove(page_id);
        self.pages.remove(&page_id).is_some()
    }

    fn clear(&mut self) {
        self.pages.clear();
        self.replacer.clear();
    }
}

impl<R: ResourceManager> LruCachedResourceManager<R> {
    pub fn new(inner: R, capacity: usize) -> Self {
        Self {
            inner,
            capacity,
            state: Mutex::new(LruState {
                pages: HashMap::with_capacity(capacity),
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

    pub fn resident(&self) -> usize {
        self.state.lock().pages.len()
    }

    /// Drop one page from the cache. Returns whether it was resident.
    pub fn evict(&self, page_id: PageId) -> bool {
        self.state.lock().forget(page_id)
    }

    /// Drop every cached page.
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

impl<R: ResourceManager> ResourceManager for LruCachedResourceManager<R> {
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
        self.state.lock().admit(id, page.clone(), self.capacity);
        Ok(page)
    }

    fn get_page(&self, id: PageId) -> StorageResult<PageRef> {
        self.ensure_open()?;
        {
            let mut state = self.state.lock();
            if let Some(page) = state.pages.get(&id).cloned() {
                state.replacer.record_access(id);
                state.stats.hits += 1;
                return Ok(page);
            }
            state.stats.misses += 1;
        }

        let page = self.inner.get_page(id)?;
        self.state.lock().admit(id, page.clone(), self.capacity);
        Ok(page)
    }

    fn write_page(&self, page: &PageRef) -> StorageResult<()> {
        self.inner.write_page(page)?;

        // Whatever was written last is what the cache should serve.
        let id = page.read().id();
        let mut state = self.state.lock();
        if let Some(resident) = state.pages.get(&id) {
            if !Arc::ptr_eq(resident, page) {
                state.pages.insert(id, page.clone());
            }
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
