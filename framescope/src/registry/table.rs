//! Copy-on-growth table shared by both registries
//!
//! ## Layout
//!
//! The table publishes a slot array through an [`ArcSwap`] and a separate
//! atomic length:
//!
//! ```text
//!   len ──▶ 3
//!   slots ─▶ [ e0 | e1 | e2 | ∅ ]      (capacity 4)
//! ```
//!
//! - **Append within capacity**: the writer fills the next empty slot of the
//!   current array in place (a `OnceLock`, so it is published exactly once),
//!   then bumps `len` with release ordering.
//! - **Append at capacity**: the writer builds a new array of twice the
//!   capacity, clones every existing `Arc<T>` into it, adds the new entry,
//!   swaps the array in, and only then bumps `len`.
//!
//! Readers load `len` with acquire ordering before loading the array, so any
//! array they observe holds every slot below the length they observed. Old
//! arrays stay alive until the last reader holding them drops its guard. The
//! entries themselves are behind `Arc`, so an entry handed out once never
//! moves and is never invalidated by growth.
//!
//! Writers are serialized by a single mutex that also owns the key → index map
//! used by create-or-get.

use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

const INITIAL_CAPACITY: usize = 16;

type Slots<T> = Vec<OnceLock<Arc<T>>>;

/// Result of [`GrowableTable::get_or_insert_with`].
pub struct Resolved<T> {
    pub index: u32,
    pub entry: Arc<T>,
    pub created: bool,
}

/// Append-only table with lock-free reads.
pub struct GrowableTable<K, T> {
    slots: ArcSwap<Slots<T>>,
    len: AtomicUsize,
    keys: Mutex<HashMap<K, u32>>,
}

impl<K: Eq + Hash, T> GrowableTable<K, T> {
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: ArcSwap::from_pointee(empty_slots(capacity.max(1))),
            len: AtomicUsize::new(0),
            keys: Mutex::new(HashMap::new()),
        }
    }

    /// Number of published entries.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current capacity of the published slot array.
    pub fn capacity(&self) -> usize {
        self.slots.load().len()
    }

    /// Entry at `index`, or `None` if it has not been published.
    ///
    /// Never takes a lock.
    pub fn get(&self, index: usize) -> Option<Arc<T>> {
        let len = self.len.load(Ordering::Acquire);
        if index >= len {
            return None;
        }
        let slots = self.slots.load();
        slots.get(index).and_then(OnceLock::get).cloned()
    }

    /// Index previously assigned to `key`, if any.
    pub fn find(&self, key: &K) -> Option<u32> {
        self.keys.lock().unwrap_or_else(PoisonError::into_inner).get(key).copied()
    }

    /// Return the entry for `key`, creating it with `make(index)` if absent.
    ///
    /// `make` runs under the writer lock and must not call back into the table.
    /// Returns `None` only if the index space is exhausted.
    pub fn get_or_insert_with(&self, key: K, make: impl FnOnce(u32) -> T) -> Option<Resolved<T>> {
        let mut keys = self.keys.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(&index) = keys.get(&key) {
            let entry = self.get(index as usize)?;
            return Some(Resolved { index, entry, created: false });
        }

        let next = self.len.load(Ordering::Relaxed);
        let index = u32::try_from(next).ok()?;
        let entry = Arc::new(make(index));

        let current = self.slots.load_full();
        if next < current.len() {
            // Only the writer fills slots, and slot `next` is still empty.
            let _ = current[next].set(Arc::clone(&entry));
        } else {
            let mut grown = empty_slots(current.len() * 2);
            for (dst, src) in grown.iter_mut().zip(current.iter()) {
                if let Some(existing) = src.get() {
                    *dst = OnceLock::from(Arc::clone(existing));
                }
            }
            grown[next] = OnceLock::from(Arc::clone(&entry));
            self.slots.store(Arc::new(grown));
        }

        self.len.store(next + 1, Ordering::Release);
        keys.insert(key, index);

        Some(Resolved { index, entry, created: true })
    }

    /// All entries published so far, in index order.
    pub fn snapshot(&self) -> Vec<Arc<T>> {
        self.snapshot_from(0)
    }

    /// Entries with index `>= start`, in index order.
    pub fn snapshot_from(&self, start: usize) -> Vec<Arc<T>> {
        let len = self.len.load(Ordering::Acquire);
        let slots = self.slots.load();
        slots
            .iter()
            .take(len)
            .skip(start)
            .filter_map(OnceLock::get)
            .cloned()
            .collect()
    }
}

impl<K: Eq + Hash, T> Default for GrowableTable<K, T> {
    fn default() -> Self {
        Self::new()
    }
}

fn empty_slots<T>(capacity: usize) -> Slots<T> {
    std::iter::repeat_with(OnceLock::new).take(capacity).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_insert_and_get() {
        let table: GrowableTable<&str, String> = GrowableTable::new();
        let a = table.get_or_insert_with("a", |i| format!("a{i}")).unwrap();
        let b = table.get_or_insert_with("b", |i| format!("b{i}")).unwrap();

        assert_eq!((a.index, b.index), (0, 1));
        assert!(a.created && b.created);
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(1).as_deref().map(String::as_str), Some("b1"));
        assert!(table.get(2).is_none());
    }

    #[test]
    fn test_existing_key_is_not_rebuilt() {
        let table: GrowableTable<&str, u32> = GrowableTable::new();
        let first = table.get_or_insert_with("k", |i| i + 100).unwrap();
        let second = table.get_or_insert_with("k", |_| panic!("must not rebuild")).unwrap();

        assert_eq!(first.index, second.index);
        assert!(!second.created);
        assert!(Arc::ptr_eq(&first.entry, &second.entry));
    }

    #[test]
    fn test_growth_preserves_entry_identity() {
        let table: GrowableTable<u32, u32> = GrowableTable::with_capacity(2);
        let first = table.get_or_insert_with(0, |i| i).unwrap().entry;

        for key in 1..100 {
            table.get_or_insert_with(key, |i| i).unwrap();
        }

        assert!(table.capacity() >= 100);
        assert!(Arc::ptr_eq(&first, &table.get(0).unwrap()));
        for i in 0..100 {
            assert_eq!(*table.get(i).unwrap(), u32::try_from(i).unwrap());
        }
    }

    #[test]
    fn test_snapshot_from_skips_prefix() {
        let table: GrowableTable<u32, u32> = GrowableTable::new();
        for key in 0..5 {
            table.get_or_insert_with(key, |i| i * 10).unwrap();
        }
        let tail: Vec<u32> = table.snapshot_from(3).iter().map(|e| **e).collect();
        assert_eq!(tail, vec![30, 40]);
    }

    #[test]
    fn test_readers_see_consistent_entries_during_growth() {
        let table: Arc<GrowableTable<u32, u32>> = Arc::new(GrowableTable::with_capacity(1));

        let writer = {
            let table = Arc::clone(&table);
            thread::spawn(move || {
                for key in 0..2_000 {
                    table.get_or_insert_with(key, |i| i).unwrap();
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let table = Arc::clone(&table);
                thread::spawn(move || {
                    while table.len() < 2_000 {
                        let len = table.len();
                        for i in 0..len {
                            let entry = table.get(i).expect("published slot must be readable");
                            assert_eq!(*entry as usize, i);
                        }
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
    }
}
