use super::replacer::Replacer;
use crate::storage::page::PageId;
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Default)]
pub struct LruReplacer {
    /// Access tick -> page, least recently used first
    order: BTreeMap<u64, PageId>,
    /// Last access tick of every tracked page
    ticks: HashMap<PageId, u64>,
    next_tick: u64,
}

impl LruReplacer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            order: BTreeMap::new(),
            ticks: HashMap::with_capacity(capacity),
            next_tick: 0,
        }
    }
}

impl Replacer for LruReplacer {
    fn record_access(&mut self, page_id: PageId) {
        let tick = self.next_tick;
        self.next_tick += 1;

        if let Some(old) = self.ticks.insert(page_id, tick) {
            self.order.remove(&old);
        }
        self.order.insert(tick, page_id);
    }

    fn evict(&mut self) -> Option<PageId> {
        let (_, page_id) = self.order.pop_first()?;
        self.ticks.remove(&page_id);
        Some(page_id)
    }

    fn remove(&mut self, page_id: PageId) {
        if let Some(tick) = self.ticks.remove(&page_id) {
            self.order.remove(&tick);
        }
    }

    fn size(&self) -> usize {
        self.ticks.len()
    }

    fn clear(&mut self) {
        self.order.clear();
        self.ticks.clear();
    }
}
