//! Expiry Index
//!
//! Concurrent set of expirable references ordered by `(expiry_time, id)`.
//! Inserts and removals are lock-free and may run while the set is being
//! iterated; only the full [`clean`](ExpiryIndex::clean) sweep takes a lock.

use crossbeam_skiplist::SkipSet;
use parking_lot::Mutex;
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};

use super::ExpirableReference;

#[derive(Default)]
pub struct ExpiryIndex {
    set: SkipSet<ExpirableReference>,
    tokens: AtomicU64,
    clean_lock: Mutex<()>,
}

impl ExpiryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `reference`. Returns `false` if an entry with the same
    /// `(expiry_time, id)` already exists; the existing entry is kept.
    pub fn put(&self, mut reference: ExpirableReference) -> bool {
        let token = self.tokens.fetch_add(1, Ordering::Relaxed) + 1;
        reference.token = token;
        let entry = self.set.get_or_insert(reference);
        entry.value().token == token
    }

    /// Earliest-expiring entry, `None` when the index is empty
    pub fn first(&self) -> Option<ExpirableReference> {
        self.set.front().map(|entry| entry.value().clone())
    }

    /// First entry ordered strictly after `reference`
    pub fn first_after(&self, reference: &ExpirableReference) -> Option<ExpirableReference> {
        self.set
            .lower_bound(Bound::Excluded(reference))
            .map(|entry| entry.value().clone())
    }

    /// Remove the entry equal to `reference`. Absent entries return `false`.
    pub fn remove(&self, reference: &ExpirableReference) -> bool {
        self.set.remove(reference).is_some()
    }

    /// Remove every entry whose item was reclaimed or has left the store.
    /// Returns the number removed. O(n).
    pub fn clean(&self) -> usize {
        let _guard = self.clean_lock.lock();
        let mut cleaned = 0;
        for entry in self.set.iter() {
            if entry.value().is_stale() && entry.remove() {
                cleaned += 1;
            }
        }
        cleaned
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    pub fn size(&self) -> usize {
        self.set.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expiry::expirable::tests::TestItem;
    use crate::expiry::Expirable;
    use std::sync::atomic::Ordering as AtomicOrdering;
    use std::sync::Arc;
    use std::thread;

    fn reference(item: &Arc<dyn Expirable>) -> ExpirableReference {
        ExpirableReference::new(item)
            .unwrap()
            .with_expiry_time(item.expiry_time())
    }

    #[test]
    fn test_first_is_minimum() {
        let index = ExpiryIndex::new();
        assert!(index.first().is_none());

        let items: Vec<_> = [(5, 300), (3, 100), (9, 100), (1, 200)]
            .iter()
            .map(|&(id, at)| TestItem::new(id, at).as_expirable())
            .collect();
        for item in &items {
            assert!(index.put(reference(item)));
            let min = items
                .iter()
                .take_while(|i| !Arc::ptr_eq(i, item))
                .chain(std::iter::once(item))
                .map(|i| (i.expiry_time(), i.id()))
                .min()
                .unwrap();
            let first = index.first().unwrap();
            assert_eq!((first.expiry_time(), first.id()), min);
        }
        assert_eq!(index.size(), 4);

        let first = index.first().unwrap();
        assert_eq!((first.expiry_time(), first.id()), (100, 3));
        let next = index.first_after(&first).unwrap();
        assert_eq!((next.expiry_time(), next.id()), (100, 9));
    }

    #[test]
    fn test_duplicate_pair_is_rejected() {
        let index = ExpiryIndex::new();
        let original = TestItem::new(4, 100).as_expirable();
        let impostor = TestItem::new(4, 100).as_expirable();

        assert!(index.put(reference(&original)));
        assert!(!index.put(reference(&impostor)));
        assert_eq!(index.size(), 1);

        let kept = index.first().unwrap().expirable().unwrap();
        assert!(Arc::ptr_eq(&kept, &original));
    }

    #[test]
    fn test_same_deadline_different_ids_coexist() {
        let index = ExpiryIndex::new();
        let a = TestItem::new(1, 100).as_expirable();
        let b = TestItem::new(2, 100).as_expirable();
        assert!(index.put(reference(&a)));
        assert!(index.put(reference(&b)));
        assert_eq!(index.size(), 2);
    }

    #[test]
    fn test_remove_absent_is_false() {
        let index = ExpiryIndex::new();
        let item = TestItem::new(1, 100).as_expirable();
        let r = reference(&item);
        assert!(!index.remove(&r));
        assert!(index.put(r.clone()));
        assert!(index.remove(&r));
        assert!(!index.remove(&r));
        assert!(index.is_empty());
    }

    #[test]
    fn test_clean_removes_only_stale() {
        let index = ExpiryIndex::new();
        let live = TestItem::new(1, 100);
        let departed = TestItem::new(2, 200);
        let reclaimed = TestItem::new(3, 300);

        assert!(index.put(reference(&live.as_expirable())));
        assert!(index.put(reference(&departed.as_expirable())));
        assert!(index.put(reference(&reclaimed.as_expirable())));

        departed.in_store.store(false, AtomicOrdering::SeqCst);
        drop(reclaimed);

        assert_eq!(index.clean(), 2);
        assert_eq!(index.size(), 1);
        assert_eq!(index.first().unwrap().id(), 1);
        assert_eq!(index.clean(), 0);
    }

    #[test]
    fn test_concurrent_put_and_clean() {
        let index = Arc::new(ExpiryIndex::new());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let index = index.clone();
                thread::spawn(move || {
                    let mut keep = Vec::new();
                    for i in 0..200 {
                        let item = TestItem::new(t * 1000 + i + 1, i);
                        assert!(index.put(reference(&item.as_expirable())));
                        if i % 2 == 0 {
                            keep.push(item);
                        }
                        if i % 50 == 0 {
                            index.clean();
                        }
                    }
                    keep
                })
            })
            .collect();

        let kept: Vec<_> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        index.clean();
        assert_eq!(index.size(), kept.len());
    }
}
