//! Userspace model of the inode-name cache the eBPF producer maintains
//! natively as a bounded LRU BPF map. This copy exists so the cache's
//! idempotence property (repeated lookups of the same inode don't re-emit
//! a name, eviction re-admits it) has something plain-Rust to exercise in
//! tests; the kernel-side cache enforces the same semantics through
//! `aya_ebpf::maps::LruHashMap`'s native eviction, not this code.
//!
//! Modeled after the original tracer's fixed arena + open-addressed hash +
//! intrusive LRU list (`trace_inode.c`): a single `Vec<Entry>` arena serves
//! as both hash bucket storage and LRU list nodes, avoiding a second
//! allocation per entry.

use std::collections::HashMap;

#[derive(Clone)]
struct Entry {
    key: (u64, u64),
    prev: Option<usize>,
    next: Option<usize>,
}

/// Bounded LRU set of `(dev_id, inode)` pairs the daemon has already told
/// the consumer about. `touch` returns `true` on a cache hit (no name
/// record owed) and `false` on a miss (name record owed, and the entry is
/// inserted as most-recently-used).
pub struct InodeCache {
    capacity: usize,
    index: HashMap<(u64, u64), usize>,
    arena: Vec<Entry>,
    head: Option<usize>, // most recently used
    tail: Option<usize>, // least recently used
    free: Vec<usize>,
}

impl InodeCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            index: HashMap::new(),
            arena: Vec::new(),
            head: None,
            tail: None,
            free: Vec::new(),
        }
    }

    pub fn touch(&mut self, dev_id: u64, inode: u64) -> bool {
        let key = (dev_id, inode);
        if let Some(&idx) = self.index.get(&key) {
            self.move_to_front(idx);
            return true;
        }
        let idx = self.alloc_entry(key);
        self.push_front(idx);
        self.index.insert(key, idx);
        if self.index.len() > self.capacity {
            self.evict_tail();
        }
        false
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains(&self, dev_id: u64, inode: u64) -> bool {
        self.index.contains_key(&(dev_id, inode))
    }

    fn alloc_entry(&mut self, key: (u64, u64)) -> usize {
        let entry = Entry {
            key,
            prev: None,
            next: None,
        };
        if let Some(idx) = self.free.pop() {
            self.arena[idx] = entry;
            idx
        } else {
            self.arena.push(entry);
            self.arena.len() - 1
        }
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = (self.arena[idx].prev, self.arena[idx].next);
        match prev {
            Some(p) => self.arena[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.arena[n].prev = prev,
            None => self.tail = prev,
        }
        self.arena[idx].prev = None;
        self.arena[idx].next = None;
    }

    fn push_front(&mut self, idx: usize) {
        self.arena[idx].prev = None;
        self.arena[idx].next = self.head;
        if let Some(h) = self.head {
            self.arena[h].prev = Some(idx);
        }
        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
    }

    fn move_to_front(&mut self, idx: usize) {
        if self.head == Some(idx) {
            return;
        }
        self.unlink(idx);
        self.push_front(idx);
    }

    fn evict_tail(&mut self) {
        let Some(tail) = self.tail else { return };
        let key = self.arena[tail].key;
        self.unlink(tail);
        self.index.remove(&key);
        self.free.push(tail);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_lookup_is_a_miss_repeat_is_a_hit() {
        let mut cache = InodeCache::new(4);
        assert!(!cache.touch(1, 100));
        assert!(cache.touch(1, 100));
        assert!(cache.touch(1, 100));
    }

    #[test]
    fn eviction_makes_the_name_owed_again() {
        let mut cache = InodeCache::new(2);
        assert!(!cache.touch(1, 1));
        assert!(!cache.touch(1, 2));
        assert!(!cache.touch(1, 3)); // evicts (1,1), the LRU entry
        assert!(!cache.touch(1, 1), "evicted entry must miss again");
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn recently_touched_entries_survive_eviction() {
        let mut cache = InodeCache::new(2);
        cache.touch(1, 1);
        cache.touch(1, 2);
        cache.touch(1, 1); // refresh (1,1) to MRU
        cache.touch(1, 3); // should evict (1,2), not (1,1)
        assert!(cache.contains(1, 1));
        assert!(!cache.contains(1, 2));
        assert!(cache.contains(1, 3));
    }

    #[test]
    fn distinct_devices_do_not_alias() {
        let mut cache = InodeCache::new(8);
        assert!(!cache.touch(1, 42));
        assert!(!cache.touch(2, 42));
        assert!(cache.touch(1, 42));
        assert!(cache.touch(2, 42));
    }
}
