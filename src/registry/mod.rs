//! Keyed lookup tables for tiles, task classes, and in-flight tasks.
//!
//! A [`Registry`] is a bucket-chained table over 64-bit composite keys.
//! Buckets are locked individually, so operations on distinct keys hashing to
//! distinct buckets never contend, and all operations on one key are
//! linearizable through its bucket lock. The bucket count is fixed at
//! construction (a prime count keeps the `key % buckets` distribution even)
//! and the table never rehashes.

use parking_lot::Mutex;

/// A concurrent bucket-chained map from `u64` keys to values.
#[derive(Debug)]
pub struct Registry<V> {
    buckets: Box<[Mutex<Vec<(u64, V)>>]>,
}

impl<V: Clone> Registry<V> {
    /// Create a registry with the given bucket count.
    pub fn new(buckets: usize) -> Self {
        assert!(buckets > 0, "registry needs at least one bucket");
        let buckets = (0..buckets).map(|_| Mutex::new(Vec::new())).collect();
        Self { buckets }
    }

    #[inline]
    fn bucket(&self, key: u64) -> &Mutex<Vec<(u64, V)>> {
        let index = (key % self.buckets.len() as u64) as usize;
        &self.buckets[index]
    }

    /// Insert a value under `key`, returning the displaced value if the key
    /// was already present.
    pub fn insert(&self, key: u64, value: V) -> Option<V> {
        let mut chain = self.bucket(key).lock();
        for entry in chain.iter_mut() {
            if entry.0 == key {
                return Some(std::mem::replace(&mut entry.1, value));
            }
        }
        chain.push((key, value));
        None
    }

    /// Look up the value stored under `key`.
    pub fn find(&self, key: u64) -> Option<V> {
        let chain = self.bucket(key).lock();
        chain
            .iter()
            .find(|entry| entry.0 == key)
            .map(|entry| entry.1.clone())
    }

    /// Remove and return the value stored under `key`.
    pub fn remove(&self, key: u64) -> Option<V> {
        let mut chain = self.bucket(key).lock();
        let index = chain.iter().position(|entry| entry.0 == key)?;
        Some(chain.swap_remove(index).1)
    }

    /// Return the value under `key`, creating it with `init` while holding
    /// the bucket lock if absent. Two racing callers observe one creation.
    pub fn get_or_try_insert_with<E>(
        &self,
        key: u64,
        init: impl FnOnce() -> Result<V, E>,
    ) -> Result<V, E> {
        let mut chain = self.bucket(key).lock();
        if let Some(entry) = chain.iter().find(|entry| entry.0 == key) {
            return Ok(entry.1.clone());
        }
        let value = init()?;
        chain.push((key, value.clone()));
        Ok(value)
    }

    /// Remove and return every value in the table.
    pub fn drain(&self) -> Vec<V> {
        let mut values = Vec::new();
        for bucket in self.buckets.iter() {
            let mut chain = bucket.lock();
            values.extend(chain.drain(..).map(|entry| entry.1));
        }
        values
    }

    /// Number of entries across all buckets.
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|bucket| bucket.lock().len()).sum()
    }

    /// Check if the table is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
