use crate::models::FetchedBlock;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

struct CacheEntry {
    payload: Arc<FetchedBlock>,
    last_access: u64,
}

struct CacheState {
    entries: HashMap<u64, CacheEntry>,
    tick: u64,
}

impl CacheState {
    fn touch(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }
}

/// Bounded least-recently-used store of fetched blocks, keyed by block number.
pub struct BlockCache {
    capacity: usize,
    state: Mutex<CacheState>,
}

impl BlockCache {
    pub fn new(capacity: usize) -> Self {
        BlockCache {
            capacity: capacity.max(1),
            state: Mutex::new(CacheState {
                entries: HashMap::with_capacity(capacity + 1),
                tick: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        // Entries are only replaced whole, so a poisoned map is still consistent.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, number: u64) -> Option<Arc<FetchedBlock>> {
        let mut state = self.lock();
        let tick = state.touch();
        let entry = state.entries.get_mut(&number)?;
        entry.last_access = tick;
        Some(entry.payload.clone())
    }

    pub fn contains(&self, number: u64) -> bool {
        self.lock().entries.contains_key(&number)
    }

    /// Stores `payload`, evicting the least recently used entry when over capacity.
    /// Returns the evicted block number, if any.
    pub fn insert(&self, payload: Arc<FetchedBlock>) -> Option<u64> {
        let mut state = self.lock();
        let tick = state.touch();
        state.entries.insert(
            payload.number(),
            CacheEntry {
                payload,
                last_access: tick,
            },
        );
        if state.entries.len() <= self.capacity {
            return None;
        }
        let oldest = state
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.last_access)
            .map(|(number, _)| *number)?;
        state.entries.remove(&oldest);
        Some(oldest)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.lock().entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RawBlock;

    fn block(number: u64) -> Arc<FetchedBlock> {
        Arc::new(FetchedBlock {
            block: RawBlock {
                number,
                hash: format!("0x{number:064x}"),
                timestamp: 0,
                transactions: vec![],
            },
            receipts: Default::default(),
        })
    }

    #[test]
    fn evicts_least_recently_accessed() {
        let cache = BlockCache::new(3);
        cache.insert(block(1));
        cache.insert(block(2));
        cache.insert(block(3));
        assert!(cache.get(1).is_some());

        assert_eq!(cache.insert(block(4)), Some(2));
        assert!(cache.contains(1));
        assert!(!cache.contains(2));
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn reinserting_does_not_grow() {
        let cache = BlockCache::new(2);
        cache.insert(block(1));
        cache.insert(block(1));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.insert(block(2)), None);

        cache.clear();
        assert!(cache.is_empty());
        assert!(cache.get(2).is_none());
    }
}
