//! Array-backed binary heap with a key → position index.
//!
//! `std::collections::BinaryHeap` cannot find, re-rank or remove an element
//! by key. [`KeyedHeap`] keeps a `HashMap<Key, usize>` alongside the array so
//! that lookup is O(1) and insert / update / remove are O(log n).
//!
//! # Invariants
//!
//! - For every position `i`: `index[items[i].key()] == i`
//! - `index.len() == items.len()`; no key appears twice
//! - For every `i > 0`: `!less(items[i], items[(i - 1) / 2])`
//!
//! Every swap goes through [`KeyedHeap::swap`], which moves both the array
//! slots and the index entries.

use std::collections::HashMap;
use std::hash::Hash;

/// Element that exposes a unique key
pub trait Keyed {
    type Key: Eq + Hash + Clone;

    fn key(&self) -> &Self::Key;
}

/// Returns true when the first argument ranks ahead of the second
pub type LessFn<T> = fn(&T, &T) -> bool;

pub struct KeyedHeap<T: Keyed> {
    items: Vec<T>,
    index: HashMap<T::Key, usize>,
    less: LessFn<T>,
}

impl<T: Keyed> KeyedHeap<T> {
    pub fn new(less: LessFn<T>) -> Self {
        Self {
            items: Vec::new(),
            index: HashMap::new(),
            less,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn contains(&self, key: &T::Key) -> bool {
        self.index.contains_key(key)
    }

    /// O(1) lookup by key
    pub fn get(&self, key: &T::Key) -> Option<&T> {
        self.index.get(key).map(|&i| &self.items[i])
    }

    /// Highest-ranked element
    pub fn peek(&self) -> Option<&T> {
        self.items.first()
    }

    /// Insert an element. If its key is already present the stored element is
    /// replaced in place, re-ranked, and the old one returned.
    pub fn insert(&mut self, item: T) -> Option<T> {
        if let Some(&i) = self.index.get(item.key()) {
            let old = std::mem::replace(&mut self.items[i], item);
            self.fix(i);
            return Some(old);
        }

        let i = self.items.len();
        self.index.insert(item.key().clone(), i);
        self.items.push(item);
        self.sift_up(i);
        None
    }

    /// Mutate the element stored under `key` and restore heap order.
    /// The closure must not change the element's key.
    pub fn update_rank(&mut self, key: &T::Key, f: impl FnOnce(&mut T)) -> bool {
        let Some(&i) = self.index.get(key) else {
            return false;
        };
        f(&mut self.items[i]);
        debug_assert!(self.items[i].key() == key, "update_rank changed the key");
        self.fix(i);
        true
    }

    /// Remove and return the element stored under `key`
    pub fn remove(&mut self, key: &T::Key) -> Option<T> {
        let i = *self.index.get(key)?;
        self.remove_at(i)
    }

    /// Remove and return the highest-ranked element
    pub fn pop(&mut self) -> Option<T> {
        self.remove_at(0)
    }

    /// Iterate in storage (not rank) order
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    /// Remove every element, in storage order
    pub fn drain(&mut self) -> Vec<T> {
        self.index.clear();
        std::mem::take(&mut self.items)
    }

    fn remove_at(&mut self, i: usize) -> Option<T> {
        let last = self.items.len().checked_sub(1)?;
        if i != last {
            self.swap(i, last);
        }

        let item = self.items.pop()?;
        self.index.remove(item.key());

        if i < self.items.len() {
            self.fix(i);
        }
        Some(item)
    }

    fn fix(&mut self, i: usize) {
        if self.sift_up(i) == i {
            self.sift_down(i);
        }
    }

    fn sift_up(&mut self, mut i: usize) -> usize {
        while i > 0 {
            let parent = (i - 1) / 2;
            if !(self.less)(&self.items[i], &self.items[parent]) {
                break;
            }
            self.swap(i, parent);
            i = parent;
        }
        i
    }

    fn sift_down(&mut self, mut i: usize) {
        let len = self.items.len();
        loop {
            let left = 2 * i + 1;
            if left >= len {
                break;
            }
            let right = left + 1;
            let mut best = left;
            if right < len && (self.less)(&self.items[right], &self.items[left]) {
                best = right;
            }
            if !(self.less)(&self.items[best], &self.items[i]) {
                break;
            }
            self.swap(i, best);
            i = best;
        }
    }

    fn swap(&mut self, i: usize, j: usize) {
        self.items.swap(i, j);
        if let Some(slot) = self.index.get_mut(self.items[i].key()) {
            *slot = i;
        }
        if let Some(slot) = self.index.get_mut(self.items[j].key()) {
            *slot = j;
        }
    }

    #[cfg(test)]
    pub(crate) fn assert_invariants(&self) {
        assert_eq!(self.items.len(), self.index.len(), "map and array diverged");
        for (i, item) in self.items.iter().enumerate() {
            assert_eq!(self.index.get(item.key()), Some(&i), "stale index entry");
            if i > 0 {
                let parent = (i - 1) / 2;
                assert!(
                    !(self.less)(item, &self.items[parent]),
                    "heap order violated at {}",
                    i
                );
            }
        }
    }
}

impl<T: Keyed + std::fmt::Debug> std::fmt::Debug for KeyedHeap<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyedHeap")
            .field("items", &self.items)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    #[derive(Debug, Clone, PartialEq)]
    struct Item {
        key: u8,
        rank: i32,
    }

    impl Keyed for Item {
        type Key = u8;

        fn key(&self) -> &u8 {
            &self.key
        }
    }

    fn max_first(a: &Item, b: &Item) -> bool {
        (a.rank, std::cmp::Reverse(a.key)) > (b.rank, std::cmp::Reverse(b.key))
    }

    #[test]
    fn test_pop_order() {
        let mut heap = KeyedHeap::new(max_first);
        for (key, rank) in [(1, 5), (2, 9), (3, 1), (4, 7)] {
            heap.insert(Item { key, rank });
        }

        let order: Vec<u8> = std::iter::from_fn(|| heap.pop()).map(|i| i.key).collect();
        assert_eq!(order, vec![2, 4, 1, 3]);
        assert!(heap.is_empty());
    }

    #[test]
    fn test_duplicate_insert_updates_in_place() {
        let mut heap = KeyedHeap::new(max_first);
        heap.insert(Item { key: 1, rank: 1 });
        heap.insert(Item { key: 2, rank: 2 });

        let old = heap.insert(Item { key: 1, rank: 10 });
        assert_eq!(old, Some(Item { key: 1, rank: 1 }));
        assert_eq!(heap.len(), 2);
        assert_eq!(heap.peek().map(|i| i.key), Some(1));
        heap.assert_invariants();
    }

    #[test]
    fn test_update_rank_and_remove() {
        let mut heap = KeyedHeap::new(max_first);
        for key in 0..10 {
            heap.insert(Item {
                key,
                rank: key as i32,
            });
        }

        assert!(heap.update_rank(&0, |i| i.rank = 100));
        assert_eq!(heap.peek().map(|i| i.key), Some(0));
        assert!(!heap.update_rank(&42, |i| i.rank = 0));

        assert_eq!(heap.remove(&0).map(|i| i.rank), Some(100));
        assert_eq!(heap.remove(&5).map(|i| i.rank), Some(5));
        assert!(heap.remove(&5).is_none());
        assert_eq!(heap.get(&9).map(|i| i.rank), Some(9));
        assert!(!heap.contains(&5));
        heap.assert_invariants();
    }

    #[derive(Debug, Clone)]
    enum Op {
        Insert(u8, i32),
        Update(u8, i32),
        Remove(u8),
        Pop,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..32, -50i32..50).prop_map(|(k, r)| Op::Insert(k, r)),
            (0u8..32, -50i32..50).prop_map(|(k, r)| Op::Update(k, r)),
            (0u8..32).prop_map(Op::Remove),
            Just(Op::Pop),
        ]
    }

    proptest! {
        #[test]
        fn prop_index_stays_consistent(ops in proptest::collection::vec(op(), 1..200)) {
            let mut heap = KeyedHeap::new(max_first);
            let mut model: BTreeMap<u8, i32> = BTreeMap::new();

            for op in ops {
                match op {
                    Op::Insert(key, rank) => {
                        heap.insert(Item { key, rank });
                        model.insert(key, rank);
                    }
                    Op::Update(key, rank) => {
                        let updated = heap.update_rank(&key, |i| i.rank = rank);
                        prop_assert_eq!(updated, model.contains_key(&key));
                        if updated {
                            model.insert(key, rank);
                        }
                    }
                    Op::Remove(key) => {
                        let removed = heap.remove(&key).map(|i| i.rank);
                        prop_assert_eq!(removed, model.remove(&key));
                    }
                    Op::Pop => {
                        let expected = model
                            .iter()
                            .max_by_key(|(k, r)| (**r, std::cmp::Reverse(**k)))
                            .map(|(k, r)| (*k, *r));
                        let popped = heap.pop().map(|i| (i.key, i.rank));
                        prop_assert_eq!(popped, expected);
                        if let Some((k, _)) = popped {
                            model.remove(&k);
                        }
                    }
                }

                heap.assert_invariants();
                prop_assert_eq!(heap.len(), model.len());
                for (k, r) in &model {
                    prop_assert_eq!(heap.get(k).map(|i| i.rank), Some(*r));
                }
            }
        }
    }
}
