use std::{
    hash::Hash,
    sync::{Arc, Mutex, PoisonError},
};

use rustc_hash::FxHashSet as HashSet;

/// An append-only, content-addressed table.
///
/// Values are compared structurally on insertion; an equal value already in the table is returned
/// instead of the new one, so every distinct value has exactly one shared instance.
#[derive(Debug)]
pub struct InternCache<V> {
    map: Arc<Mutex<HashSet<Arc<V>>>>,
}

impl<V> Clone for InternCache<V> {
    fn clone(&self) -> Self {
        Self {
            map: self.map.clone(),
        }
    }
}

impl<V> Default for InternCache<V> {
    fn default() -> Self {
        Self {
            map: Default::default(),
        }
    }
}

impl<V> InternCache<V>
where
    V: Eq + Hash,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Checkout the unique instance equal to `value`, inserting it if it is not yet present.
    pub fn checkout(&self, value: V) -> Arc<V> {
        let mut map = self.map.lock().unwrap_or_else(PoisonError::into_inner);
        match map.get(&value) {
            Some(item) => item.clone(),
            None => {
                let item = Arc::new(value);
                map.insert(item.clone());
                item
            }
        }
    }

    /// Number of distinct values interned so far.
    pub fn len(&self) -> usize {
        self.map.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::InternCache;

    #[test]
    fn test_checkout_dedup() {
        let cache = InternCache::<Vec<u32>>::new();
        let a = cache.checkout(vec![1, 2, 3]);
        let b = cache.checkout(vec![1, 2, 3]);
        let c = cache.checkout(vec![3, 2, 1]);

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_shared_between_clones() {
        let cache = InternCache::<String>::new();
        let other = cache.clone();
        let a = cache.checkout("blocked".into());
        let b = other.checkout("blocked".into());
        assert!(Arc::ptr_eq(&a, &b));

        let handle = std::thread::spawn(move || other.checkout("shared".into()));
        let c = handle.join().unwrap();
        assert!(Arc::ptr_eq(&c, &cache.checkout("shared".into())));
    }
}
