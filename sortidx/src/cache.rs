// Bounded cache from a query interval to its packed per-slice hit spans.
// Slots are verified by full key comparison after a rapidhash probe, and a
// probation window disables the cache entirely for workloads that never
// repeat a query.

use crate::key::IndexKey;
#[cfg(test)]
use test_log::test;

pub(crate) const MAX_SLOTS: usize = 128;
pub(crate) const MAX_BYTES: usize = 256 * 1024;

// Lookups observed before the hit-ratio heuristic may disable the cache.
const PROBATION: u64 = 64;

/// `(slice, start, length)` spans with non-zero length, in slice order.
pub(crate) type StartLengths = Vec<(usize, usize, usize)>;

#[derive(Debug)]
struct Slot<T> {
    key: (T, T),
    hash: u64,
    spans: StartLengths,
    size: usize,
    stamp: u64,
}

#[derive(Debug)]
pub(crate) struct LimBoundsCache<T> {
    slots: Vec<Slot<T>>,
    itemsize: usize,
    nbytes: usize,
    max_slots: usize,
    max_bytes: usize,
    clock: u64,
    lookups: u64,
    hits: u64,
    enabled: bool,
}

impl<T: IndexKey> LimBoundsCache<T> {
    pub(crate) fn new(itemsize: usize) -> LimBoundsCache<T> {
        Self::with_limits(itemsize, MAX_SLOTS, MAX_BYTES)
    }

    pub(crate) fn with_limits(
        itemsize: usize,
        max_slots: usize,
        max_bytes: usize,
    ) -> LimBoundsCache<T> {
        LimBoundsCache {
            slots: Vec::new(),
            itemsize,
            nbytes: 0,
            max_slots,
            max_bytes,
            clock: 0,
            lookups: 0,
            hits: 0,
            enabled: true,
        }
    }

    fn hash_key(&self, key: &(T, T)) -> u64 {
        let w = T::width(self.itemsize);
        let mut buf = vec![0u8; 2 * w];
        key.0.write_to(&mut buf[..w]);
        key.1.write_to(&mut buf[w..]);
        rapidhash::rapidhash(&buf)
    }

    pub(crate) fn getslot(&mut self, key: &(T, T)) -> Option<usize> {
        if !self.enabled {
            return None;
        }
        self.lookups += 1;
        if self.lookups > PROBATION && self.hits * 10 < self.lookups {
            // Under 10% hits after the probation window: the workload does
            // not repeat queries, stop paying for the cache.
            self.enabled = false;
            self.slots.clear();
            self.nbytes = 0;
            return None;
        }
        let hash = self.hash_key(key);
        let clock = {
            self.clock += 1;
            self.clock
        };
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if slot.hash == hash && slot.key == *key {
                slot.stamp = clock;
                self.hits += 1;
                return Some(i);
            }
        }
        None
    }

    pub(crate) fn getitem(&self, slot: usize) -> &StartLengths {
        &self.slots[slot].spans
    }

    /// Whether an insert is currently worthwhile.
    pub(crate) fn could_enable_cache(&self) -> bool {
        self.enabled
    }

    pub(crate) fn setitem(&mut self, key: (T, T), spans: StartLengths, size: usize) {
        if !self.enabled || size > self.max_bytes {
            return;
        }
        while self.slots.len() >= self.max_slots || self.nbytes + size > self.max_bytes {
            let Some(oldest) = self
                .slots
                .iter()
                .enumerate()
                .min_by_key(|(_, s)| s.stamp)
                .map(|(i, _)| i)
            else {
                break;
            };
            self.nbytes -= self.slots[oldest].size;
            self.slots.swap_remove(oldest);
        }
        let hash = self.hash_key(&key);
        self.clock += 1;
        self.nbytes += size;
        self.slots.push(Slot {
            key,
            hash,
            spans,
            size,
            stamp: self.clock,
        });
    }
}

#[test]
fn test_cache_hit_and_eviction() {
    let mut cache: LimBoundsCache<i64> = LimBoundsCache::with_limits(0, 2, 1024);
    assert_eq!(cache.getslot(&(1, 2)), None);
    cache.setitem((1, 2), vec![(0, 3, 4)], 17);
    let slot = cache.getslot(&(1, 2)).unwrap();
    assert_eq!(cache.getitem(slot), &vec![(0, 3, 4)]);
    // Two more inserts overflow the two slots; the least recently used key
    // (3,4) goes first.
    cache.setitem((3, 4), vec![(1, 0, 1)], 17);
    assert!(cache.getslot(&(1, 2)).is_some());
    cache.setitem((5, 6), vec![(2, 0, 2)], 17);
    assert!(cache.getslot(&(3, 4)).is_none());
    assert!(cache.getslot(&(1, 2)).is_some());
}

#[test]
fn test_cache_probation_disables() {
    let mut cache: LimBoundsCache<i64> = LimBoundsCache::new(0);
    for i in 0..200 {
        assert_eq!(cache.getslot(&(i, i + 1)), None);
    }
    assert!(!cache.could_enable_cache());
    // Inserts after disablement are dropped.
    cache.setitem((0, 1), vec![(0, 0, 1)], 17);
    assert_eq!(cache.getslot(&(0, 1)), None);
}
