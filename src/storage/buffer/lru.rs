use super::replacer::Replacer;
use crate::storage::page::VirtualPageId;
use std::collections::{BTreeMap, HashMap};

#[derive(Debug)]
pub struct LruReplacer {
    /// Evictable pages keyed by the tick they became evictable (oldest first)
    lru_list: BTreeMap<u64, VirtualPageId>,
    /// Tick of each evictable page for O(log n) removal
    page_map: HashMap<VirtualPageId, u64>,
    next_tick: u64,
    /// Maximum number of pages
    max_size: usize,
}

impl LruReplacer {
    pub fn new(max_size: usize) -> Self {
        Self {
            lru_list: BTreeMap::new(),
            page_map: HashMap::with_capacity(max_size),
            next_tick: 0,
            max_size,
        }
    }
}

impl Replacer for LruReplacer {
    fn evict(&mut self) -> Option<VirtualPageId> {
        let (_, page_id) = self.lru_list.pop_first()?;
        self.page_map.remove(&page_id);
        Some(page_id)
    }

    fn pin(&mut self, page_id: VirtualPageId) {
        self.remove(page_id);
    }

    fn unpin(&mut self, page_id: VirtualPageId) {
        if !self.page_map.contains_key(&page_id) && self.lru_list.len() < self.max_size {
            let tick = self.next_tick;
            self.next_tick += 1;
            self.lru_list.insert(tick, page_id);
            self.page_map.insert(page_id, tick);
        }
    }

    fn remove(&mut self, page_id: VirtualPageId) {
        if let Some(tick) = self.page_map.remove(&page_id) {
            self.lru_list.remove(&tick);
        }
    }

    fn size(&self) -> usize {
        self.lru_list.len()
    }
}
