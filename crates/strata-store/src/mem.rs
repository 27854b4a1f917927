use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

use crate::{validate_key, ObjectStore, StoreError, StoreStat};

/// In-memory store for tests: counts fetches per operation and can inject
/// transient failures to exercise the retry path.
#[derive(Debug, Default)]
pub struct MemStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    get_calls: AtomicU64,
    get_range_calls: AtomicU64,
    put_calls: AtomicU64,
    head_calls: AtomicU64,
    fail_gets: AtomicU32,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `n` get/get_range calls fail with a transient io error.
    pub fn fail_next_gets(&self, n: u32) {
        self.fail_gets.store(n, Ordering::SeqCst);
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn get_calls(&self) -> u64 {
        self.get_calls.load(Ordering::Relaxed)
    }

    pub fn get_range_calls(&self) -> u64 {
        self.get_range_calls.load(Ordering::Relaxed)
    }

    pub fn put_calls(&self) -> u64 {
        self.put_calls.load(Ordering::Relaxed)
    }

    pub fn head_calls(&self) -> u64 {
        self.head_calls.load(Ordering::Relaxed)
    }

    /// Total objects fetched through `get` and `get_range` so far.
    pub fn fetched_objects(&self) -> u64 {
        self.get_calls() + self.get_range_calls()
    }

    fn maybe_fail(&self, key: &str) -> Result<(), StoreError> {
        let mut remaining = self.fail_gets.load(Ordering::SeqCst);
        while remaining > 0 {
            match self.fail_gets.compare_exchange(
                remaining,
                remaining - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Err(StoreError::io(key, "injected transient failure")),
                Err(cur) => remaining = cur,
            }
        }
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>>, StoreError> {
        self.objects
            .lock()
            .map_err(|_| StoreError::io("<mem>", "store mutex poisoned"))
    }
}

impl ObjectStore for MemStore {
    fn head(&self, key: &str) -> Result<StoreStat, StoreError> {
        validate_key(key)?;
        self.head_calls.fetch_add(1, Ordering::Relaxed);
        let objects = self.lock()?;
        Ok(match objects.get(key) {
            Some(bytes) => StoreStat {
                exists: true,
                size: bytes.len() as u64,
                etag: None,
            },
            None => StoreStat {
                exists: false,
                size: 0,
                etag: None,
            },
        })
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        validate_key(key)?;
        self.maybe_fail(key)?;
        self.get_calls.fetch_add(1, Ordering::Relaxed);
        let objects = self.lock()?;
        objects
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    fn get_range(&self, key: &str, start: u64, len: u64) -> Result<Vec<u8>, StoreError> {
        validate_key(key)?;
        self.maybe_fail(key)?;
        self.get_range_calls.fetch_add(1, Ordering::Relaxed);
        let objects = self.lock()?;
        let bytes = objects
            .get(key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        let size = bytes.len() as u64;
        let end = start.checked_add(len).filter(|e| *e <= size);
        let Some(end) = end else {
            return Err(StoreError::RangeUnsatisfiable {
                key: key.to_string(),
                start,
                len,
                size,
            });
        };
        Ok(bytes[start as usize..end as usize].to_vec())
    }

    fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        validate_key(key)?;
        self.put_calls.fetch_add(1, Ordering::Relaxed);
        let mut objects = self.lock()?;
        objects.insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let objects = self.lock()?;
        Ok(objects
            .keys()
            .filter(|k| prefix.is_empty() || k.starts_with(&format!("{prefix}/")))
            .cloned()
            .collect())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        validate_key(key)?;
        let mut objects = self.lock()?;
        objects.remove(key);
        Ok(())
    }

    fn presign(&self, _key: &str) -> Result<String, StoreError> {
        Err(StoreError::Unsupported { op: "presign" })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_fetches() {
        let store = MemStore::new();
        store.put("a", b"1234").unwrap();
        store.get("a").unwrap();
        store.get("a").unwrap();
        store.get_range("a", 0, 2).unwrap();
        assert_eq!(store.get_calls(), 2);
        assert_eq!(store.get_range_calls(), 1);
        assert_eq!(store.put_calls(), 1);
        assert_eq!(store.fetched_objects(), 3);
    }

    #[test]
    fn injected_failures_are_transient() {
        let store = MemStore::new();
        store.put("a", b"x").unwrap();
        store.fail_next_gets(1);
        let err = store.get("a").unwrap_err();
        assert!(err.is_transient());
        assert_eq!(store.get("a").unwrap(), b"x");
    }
}
