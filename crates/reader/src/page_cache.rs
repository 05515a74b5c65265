//! Size-bounded cache of encoded page bytes with distance-aware eviction.
//!
//! Every entry may carry the page index it belongs to. When room is needed,
//! the cache prefers to throw away pages the reader is moving *away* from:
//! entries behind the direction of travel go before entries ahead of it, and
//! within each side the farthest from the current position go first. Locked
//! entries (the page on screen) are never evicted.

use crate::error::{ErrorKind, Result};
use bytes::Bytes;
use derive_more::Display;
use parking_lot::RwLock;
use std::cmp::Reverse;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Display, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Direction {
    #[default]
    #[display("forward")]
    Forward,
    #[display("backward")]
    Backward,
}
impl Direction {
    /// Direction of travel from `from` to `to`. Staying put counts as
    /// forward.
    pub fn between(from: usize, to: usize) -> Self {
        if to < from { Self::Backward } else { Self::Forward }
    }
}

/// Identifies one page: the container it lives in and its entry name there.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PageKey {
    pub container: PathBuf,
    pub entry: String,
}
impl PageKey {
    pub fn new(container: impl Into<PathBuf>, entry: impl Into<String>) -> Self {
        Self { container: container.into(), entry: entry.into() }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entry_count: usize,
    pub total_bytes: u64,
    pub max_bytes: u64,
    pub locked_count: usize,
}

/// The viewing position eviction is measured from.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Position {
    container: PathBuf,
    index: usize,
    direction: Direction,
}

struct Slot {
    bytes: Bytes,
    page_index: Option<usize>,
    locks: u32,
    /// Tick of the most recent read, bumped under the shared lock.
    last_access: AtomicU64,
    /// Insertion order.
    seq: u64,
}
impl Slot {
    fn size(&self) -> u64 {
        self.bytes.len() as u64
    }
}

#[derive(Default)]
struct Inner {
    entries: HashMap<PageKey, Slot>,
    total_bytes: u64,
    next_seq: u64,
    position: Option<Position>,
}
impl Inner {
    /// Unlocked entries in the order they should be evicted.
    fn victims(&self, position: Option<&Position>, exclude: Option<&PageKey>) -> Vec<PageKey> {
        let mut candidates: Vec<_> = self
            .entries
            .iter()
            .filter(|(key, slot)| slot.locks == 0 && Some(*key) != exclude)
            .map(|(key, slot)| {
                let placement = position.and_then(|position| {
                    let index = slot.page_index.filter(|_| key.container == position.container)?;
                    let ahead = match position.direction {
                        Direction::Forward => index >= position.index,
                        Direction::Backward => index <= position.index,
                    };
                    Some((ahead, index.abs_diff(position.index)))
                });
                // Pages that can't be placed relative to the position (other
                // containers, no index) go first, least recently read first.
                let sort = match placement {
                    Some((ahead, distance)) => (ahead, Reverse(distance), 0, slot.seq),
                    None => (false, Reverse(usize::MAX), slot.last_access.load(Ordering::Relaxed), slot.seq),
                };
                (sort, key.clone())
            })
            .collect();
        candidates.sort_by(|a, b| a.0.cmp(&b.0));
        candidates.into_iter().map(|(_, key)| key).collect()
    }

    fn remove(&mut self, key: &PageKey) -> Option<Slot> {
        let slot = self.entries.remove(key)?;
        self.total_bytes -= slot.size();
        Some(slot)
    }

    /// Evict until `total_bytes + incoming <= max`. Evicts nothing and
    /// returns `None` when that isn't reachable.
    fn make_room(&mut self, max: u64, incoming: u64, position: Option<&Position>, exclude: Option<&PageKey>) -> Option<Vec<PageKey>> {
        let excluded = exclude.and_then(|key| self.entries.get(key)).map_or(0, Slot::size);
        let mut used = self.total_bytes - excluded;
        if used + incoming <= max {
            return Some(Vec::new());
        }
        let mut chosen = Vec::new();
        for key in self.victims(position, exclude) {
            if used + incoming <= max {
                break;
            }
            used -= self.entries.get(&key).map_or(0, Slot::size);
            chosen.push(key);
        }
        if used + incoming > max {
            return None;
        }
        for key in &chosen {
            self.remove(key);
        }
        Some(chosen)
    }
}

pub struct PageCache {
    max_bytes: AtomicU64,
    inner: RwLock<Inner>,
    clock: AtomicU64,
}
impl PageCache {
    pub fn new(max_bytes: u64) -> Self {
        Self { max_bytes: AtomicU64::new(max_bytes), inner: RwLock::default(), clock: AtomicU64::new(0) }
    }

    fn max(&self) -> u64 {
        self.max_bytes.load(Ordering::Relaxed)
    }

    pub fn get(&self, key: &PageKey) -> Option<Bytes> {
        let inner = self.inner.read();
        let slot = inner.entries.get(key)?;
        slot.last_access.store(self.clock.fetch_add(1, Ordering::Relaxed), Ordering::Relaxed);
        Some(slot.bytes.clone())
    }

    pub fn contains(&self, key: &PageKey) -> bool {
        self.inner.read().entries.contains_key(key)
    }

    /// Store a page, evicting by distance from the current position if
    /// needed.
    ///
    /// Re-inserting a key replaces its payload and keeps its lock count.
    /// Fails with [`ErrorKind::CacheFull`] (changing nothing) if the payload
    /// can't fit even after evicting every unlocked entry.
    pub fn insert(&self, key: PageKey, bytes: Bytes, page_index: Option<usize>) -> Result<()> {
        let size = bytes.len() as u64;
        let max = self.max();
        let mut inner = self.inner.write();
        let position = inner.position.clone();
        let Some(evicted) = inner.make_room(max, size, position.as_ref(), Some(&key)) else {
            tracing::debug!(container = %key.container.display(), entry = %key.entry, size, "page does not fit in cache");
            exn::bail!(ErrorKind::CacheFull(size));
        };
        if !evicted.is_empty() {
            tracing::trace!(evicted = evicted.len(), "evicted pages to make room");
        }
        let locks = inner.remove(&key).map_or(0, |slot| slot.locks);
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.total_bytes += size;
        let last_access = AtomicU64::new(self.clock.fetch_add(1, Ordering::Relaxed));
        inner.entries.insert(key, Slot { bytes, page_index, locks, last_access, seq });
        Ok(())
    }

    /// Pin an entry against eviction. Locks nest. Returns `false` if the key
    /// isn't cached.
    pub fn lock(&self, key: &PageKey) -> bool {
        match self.inner.write().entries.get_mut(key) {
            Some(slot) => {
                slot.locks += 1;
                true
            },
            None => false,
        }
    }

    /// Undo one [`lock`](Self::lock). Returns `false` if the key isn't
    /// cached or wasn't locked.
    pub fn unlock(&self, key: &PageKey) -> bool {
        match self.inner.write().entries.get_mut(key) {
            Some(slot) if slot.locks > 0 => {
                slot.locks -= 1;
                true
            },
            _ => false,
        }
    }

    /// Record the viewing position that insert-triggered eviction measures
    /// from.
    pub fn set_position(&self, container: impl Into<PathBuf>, index: usize, direction: Direction) {
        self.inner.write().position = Some(Position { container: container.into(), index, direction });
    }

    /// Evict unlocked entries, measured from `origin` in `container`, until
    /// the cache is within its maximum. Returns the evicted keys in eviction
    /// order.
    pub fn evict_by_distance(&self, container: impl AsRef<Path>, origin: usize, direction: Direction) -> Vec<PageKey> {
        let position = Position { container: container.as_ref().to_path_buf(), index: origin, direction };
        let max = self.max();
        let mut inner = self.inner.write();
        let mut evicted = Vec::new();
        for key in inner.victims(Some(&position), None) {
            if inner.total_bytes <= max {
                break;
            }
            inner.remove(&key);
            evicted.push(key);
        }
        evicted
    }

    /// Drop every page of one container, locked or not.
    pub fn remove_container(&self, container: impl AsRef<Path>) -> usize {
        let container = container.as_ref();
        let mut inner = self.inner.write();
        let keys: Vec<_> = inner.entries.keys().filter(|key| key.container == container).cloned().collect();
        for key in &keys {
            inner.remove(key);
        }
        keys.len()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.entries.clear();
        inner.total_bytes = 0;
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.read();
        CacheStats {
            entry_count: inner.entries.len(),
            total_bytes: inner.total_bytes,
            max_bytes: self.max(),
            locked_count: inner.entries.values().filter(|slot| slot.locks > 0).count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const BOOK: &str = "book.cbz";

    fn key(page: usize) -> PageKey {
        PageKey::new(BOOK, format!("{page:03}.png"))
    }

    fn insert(cache: &PageCache, page: usize, size: usize) -> Result<()> {
        cache.insert(key(page), Bytes::from(vec![0u8; size]), Some(page))
    }

    fn cached_pages(cache: &PageCache) -> Vec<usize> {
        let mut pages: Vec<_> = (0..20).filter(|page| cache.contains(&key(*page))).collect();
        pages.sort();
        pages
    }

    #[test]
    fn test_backward_entry_goes_before_forward_entry() {
        let cache = PageCache::new(100);
        cache.set_position(BOOK, 2, Direction::Forward);
        insert(&cache, 3, 40).unwrap();
        insert(&cache, 0, 40).unwrap();
        insert(&cache, 4, 40).unwrap();
        // Page 0 is behind the reader; page 3 is the nearest page ahead.
        assert_eq!(cached_pages(&cache), vec![3, 4]);
        assert_eq!(cache.stats().total_bytes, 80);
    }

    #[test]
    fn test_farthest_backward_goes_first() {
        let cache = PageCache::new(100);
        cache.set_position(BOOK, 2, Direction::Forward);
        insert(&cache, 1, 40).unwrap();
        insert(&cache, 0, 40).unwrap();
        insert(&cache, 3, 40).unwrap();
        assert_eq!(cached_pages(&cache), vec![1, 3]);
    }

    #[test]
    fn test_direction_flips_eviction_side() {
        let cache = PageCache::new(100);
        cache.set_position(BOOK, 5, Direction::Backward);
        insert(&cache, 4, 40).unwrap();
        insert(&cache, 9, 40).unwrap();
        insert(&cache, 3, 40).unwrap();
        assert_eq!(cached_pages(&cache), vec![3, 4]);
    }

    #[test]
    fn test_ahead_side_goes_farthest_first() {
        let cache = PageCache::new(100);
        cache.set_position(BOOK, 5, Direction::Forward);
        insert(&cache, 8, 30).unwrap();
        insert(&cache, 2, 30).unwrap();
        insert(&cache, 10, 30).unwrap();
        // 2 is behind, so it goes; then 10 (farther ahead) before 8.
        insert(&cache, 6, 60).unwrap();
        assert_eq!(cached_pages(&cache), vec![6, 8]);
    }

    #[test]
    fn test_equal_distance_evicts_oldest_first() {
        let cache = PageCache::new(60);
        cache.set_position(BOOK, 5, Direction::Forward);
        cache.insert(PageKey::new(BOOK, "007.jpg"), Bytes::from(vec![0; 20]), Some(7)).unwrap();
        cache.insert(PageKey::new(BOOK, "007.png"), Bytes::from(vec![0; 20]), Some(7)).unwrap();
        cache.get(&PageKey::new(BOOK, "007.jpg"));
        insert(&cache, 6, 40).unwrap();
        assert!(!cache.contains(&PageKey::new(BOOK, "007.jpg")));
        assert!(cache.contains(&PageKey::new(BOOK, "007.png")));
    }

    #[test]
    fn test_direction_decides_between_equal_distances() {
        let cache = PageCache::new(60);
        cache.set_position(BOOK, 5, Direction::Forward);
        insert(&cache, 3, 30).unwrap();
        insert(&cache, 7, 30).unwrap();
        cache.set_position(BOOK, 5, Direction::Backward);
        // 3 and 7 are both two pages away; 7 is now behind the reader.
        insert(&cache, 5, 30).unwrap();
        assert_eq!(cached_pages(&cache), vec![3, 5]);
    }

    #[test]
    fn test_evict_by_distance_orders_victims() {
        let cache = PageCache::new(1_000);
        for page in [0, 1, 3, 6, 9] {
            insert(&cache, page, 100).unwrap();
        }
        assert!(cache.evict_by_distance(BOOK, 4, Direction::Forward).is_empty());

        let cache = PageCache::new(500);
        for page in [0, 1, 3, 6, 9] {
            insert(&cache, page, 100).unwrap();
        }
        cache.max_bytes.store(150, Ordering::Relaxed);
        let evicted = cache.evict_by_distance(BOOK, 4, Direction::Forward);
        assert_eq!(evicted, vec![key(0), key(1), key(3), key(9)]);
        assert_eq!(cached_pages(&cache), vec![6]);
    }

    #[test]
    fn test_locked_entries_are_never_evicted() {
        let cache = PageCache::new(100);
        cache.set_position(BOOK, 5, Direction::Forward);
        insert(&cache, 0, 50).unwrap();
        assert!(cache.lock(&key(0)));
        insert(&cache, 6, 50).unwrap();
        insert(&cache, 7, 50).unwrap();
        assert_eq!(cached_pages(&cache), vec![0, 7]);
        assert_eq!(cache.stats().locked_count, 1);

        // With everything else locked too, there's nowhere to make room.
        assert!(cache.lock(&key(7)));
        let err = insert(&cache, 8, 10).unwrap_err();
        assert!(matches!(&*err, ErrorKind::CacheFull(10)));
        assert_eq!(cached_pages(&cache), vec![0, 7]);
    }

    #[test]
    fn test_locks_nest() {
        let cache = PageCache::new(100);
        insert(&cache, 1, 10).unwrap();
        assert!(cache.lock(&key(1)));
        assert!(cache.lock(&key(1)));
        assert!(cache.unlock(&key(1)));
        assert_eq!(cache.stats().locked_count, 1);
        assert!(cache.unlock(&key(1)));
        assert!(!cache.unlock(&key(1)));
        assert!(!cache.lock(&key(2)));
    }

    #[test]
    fn test_oversized_payload_is_rejected() {
        let cache = PageCache::new(100);
        insert(&cache, 1, 60).unwrap();
        assert!(insert(&cache, 2, 101).is_err());
        assert_eq!(cached_pages(&cache), vec![1]);
        assert_eq!(cache.stats().total_bytes, 60);
    }

    #[test]
    fn test_reinsert_replaces_with_exact_accounting() {
        let cache = PageCache::new(100);
        insert(&cache, 1, 60).unwrap();
        assert!(cache.lock(&key(1)));
        // Replacing a locked entry doesn't need to evict it to make room.
        insert(&cache, 1, 90).unwrap();
        let stats = cache.stats();
        assert_eq!((stats.entry_count, stats.total_bytes, stats.locked_count), (1, 90, 1));
        assert_eq!(cache.get(&key(1)).unwrap().len(), 90);
    }

    #[test]
    fn test_other_containers_go_first_least_recently_read() {
        let cache = PageCache::new(100);
        cache.set_position(BOOK, 0, Direction::Forward);
        cache.insert(PageKey::new("other.cbz", "a.png"), Bytes::from(vec![0; 30]), Some(0)).unwrap();
        cache.insert(PageKey::new("other.cbz", "b.png"), Bytes::from(vec![0; 30]), Some(1)).unwrap();
        insert(&cache, 5, 30).unwrap();
        cache.get(&PageKey::new("other.cbz", "a.png"));
        insert(&cache, 6, 30).unwrap();
        assert!(cache.contains(&PageKey::new("other.cbz", "a.png")));
        assert!(!cache.contains(&PageKey::new("other.cbz", "b.png")));
        assert_eq!(cached_pages(&cache), vec![5, 6]);
    }

    #[rstest]
    #[case(&[30, 30, 30, 30, 30])]
    #[case(&[99, 1, 50, 50, 2])]
    #[case(&[10; 25])]
    fn test_total_never_exceeds_maximum(#[case] sizes: &[usize]) {
        let cache = PageCache::new(100);
        for (page, size) in sizes.iter().enumerate() {
            cache.set_position(BOOK, page, Direction::between(page.saturating_sub(1), page));
            insert(&cache, page, *size).unwrap();
            let stats = cache.stats();
            assert!(stats.total_bytes <= 100);
            let summed: u64 = (0..sizes.len()).filter_map(|p| cache.get(&key(p))).map(|b| b.len() as u64).sum();
            assert_eq!(summed, stats.total_bytes);
        }
    }

    #[test]
    fn test_remove_container_and_clear() {
        let cache = PageCache::new(1_000);
        insert(&cache, 1, 10).unwrap();
        insert(&cache, 2, 10).unwrap();
        cache.lock(&key(2));
        cache.insert(PageKey::new("other.cbz", "a.png"), Bytes::from_static(b"abc"), None).unwrap();
        assert_eq!(cache.remove_container(BOOK), 2);
        assert_eq!(cache.stats(), CacheStats { entry_count: 1, total_bytes: 3, max_bytes: 1_000, locked_count: 0 });
        cache.clear();
        assert_eq!(cache.stats().entry_count, 0);
        assert_eq!(cache.stats().total_bytes, 0);
    }
}
