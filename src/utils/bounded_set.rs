use indexmap::{Equivalent, IndexSet};
use std::hash::Hash;

/// Default capacity used when no explicit limit is configured
pub const DEFAULT_MAX_LEN: usize = 10_000;

/// Insertion-ordered set with a maximum size.
///
/// Adding a new item to a full set evicts the oldest one. `touch` moves an
/// existing item to the most-recent position so that it outlives items that
/// were added before the touch.
///
/// Not synchronized; owners wrap it in their own lock.
#[derive(Debug, Clone)]
pub struct BoundedOrderedSet<T: Hash + Eq> {
    items: IndexSet<T>,
    max_len: usize,
    total_evictions: u64,
}

impl<T: Hash + Eq + Clone> BoundedOrderedSet<T> {
    /// A zero `max_len` is treated as one.
    pub fn new(max_len: usize) -> Self {
        Self {
            items: IndexSet::new(),
            max_len: max_len.max(1),
            total_evictions: 0,
        }
    }

    /// Build from an iterator, keeping only the last `max_len` items.
    pub fn from_iter_with_capacity<I: IntoIterator<Item = T>>(iter: I, max_len: usize) -> Self {
        let mut set = Self::new(max_len);
        for item in iter {
            set.add(item);
        }
        set
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }

    pub fn total_evictions(&self) -> u64 {
        self.total_evictions
    }

    /// Add an item. Existing items keep their position.
    /// Returns the evicted item, if the add pushed one out.
    pub fn add(&mut self, item: T) -> Option<T> {
        if self.items.contains(&item) {
            return None;
        }

        let evicted = if self.items.len() >= self.max_len {
            self.total_evictions += 1;
            self.items.shift_remove_index(0)
        } else {
            None
        };

        self.items.insert(item);
        evicted
    }

    /// Refresh an item to the most-recent position. Returns false if absent.
    pub fn touch<Q>(&mut self, item: &Q) -> bool
    where
        Q: ?Sized + Hash + Equivalent<T>,
    {
        match self.items.get_index_of(item) {
            Some(index) => {
                let last = self.items.len() - 1;
                self.items.move_index(index, last);
                true
            }
            None => false,
        }
    }

    pub fn discard<Q>(&mut self, item: &Q) -> bool
    where
        Q: ?Sized + Hash + Equivalent<T>,
    {
        self.items.shift_remove(item)
    }

    /// Remove every item yielded by `other`.
    pub fn remove_all<'a, I>(&mut self, other: I)
    where
        I: IntoIterator<Item = &'a T>,
        T: 'a,
    {
        for item in other {
            self.items.shift_remove(item);
        }
    }

    pub fn contains<Q>(&self, item: &Q) -> bool
    where
        Q: ?Sized + Hash + Equivalent<T>,
    {
        self.items.contains(item)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Iterate oldest first
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    pub fn as_list(&self) -> Vec<T> {
        self.items.iter().cloned().collect()
    }

    pub fn as_set(&self) -> std::collections::HashSet<T> {
        self.items.iter().cloned().collect()
    }
}

impl<T: Hash + Eq + Clone> Default for BoundedOrderedSet<T> {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LEN)
    }
}

/// Equality compares contents only, not order, capacity or eviction count.
impl<T: Hash + Eq> PartialEq for BoundedOrderedSet<T> {
    fn eq(&self, other: &Self) -> bool {
        self.items.len() == other.items.len() && self.items.iter().all(|i| other.items.contains(i))
    }
}

impl<T: Hash + Eq> Eq for BoundedOrderedSet<T> {}
