use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::{validate_key, ObjectStore, StoreError, StoreStat};

/// Filesystem-backed store. Doubles as the `local:` network-mount backend,
/// where the only difference is that readers skip the chunk cache.
#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
    is_mount: bool,
}

impl FsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            is_mount: false,
        }
    }

    pub fn mount(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            is_mount: true,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }
}

fn io_err(key: &str, err: std::io::Error) -> StoreError {
    if err.kind() == std::io::ErrorKind::NotFound {
        StoreError::NotFound(key.to_string())
    } else {
        StoreError::io(key, err)
    }
}

impl ObjectStore for FsStore {
    fn head(&self, key: &str) -> Result<StoreStat, StoreError> {
        let path = self.path_for(key)?;
        match std::fs::metadata(&path) {
            Ok(meta) => Ok(StoreStat {
                exists: meta.is_file(),
                size: meta.len(),
                etag: None,
            }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(StoreStat {
                exists: false,
                size: 0,
                etag: None,
            }),
            Err(err) => Err(StoreError::io(key, err)),
        }
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.path_for(key)?;
        std::fs::read(&path).map_err(|e| io_err(key, e))
    }

    fn get_range(&self, key: &str, start: u64, len: u64) -> Result<Vec<u8>, StoreError> {
        let path = self.path_for(key)?;
        let mut file = std::fs::File::open(&path).map_err(|e| io_err(key, e))?;
        let size = file.metadata().map_err(|e| StoreError::io(key, e))?.len();
        let end = start.checked_add(len);
        if end.is_none() || end.unwrap_or(u64::MAX) > size {
            return Err(StoreError::RangeUnsatisfiable {
                key: key.to_string(),
                start,
                len,
                size,
            });
        }
        file.seek(SeekFrom::Start(start))
            .map_err(|e| StoreError::io(key, e))?;
        let len = usize::try_from(len).map_err(|e| StoreError::io(key, e))?;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf)
            .map_err(|e| StoreError::io(key, e))?;
        Ok(buf)
    }

    fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        let parent = path
            .parent()
            .ok_or_else(|| StoreError::InvalidKey(key.to_string()))?;
        std::fs::create_dir_all(parent).map_err(|e| StoreError::io(key, e))?;

        let tmp = path.with_file_name(format!(
            "{}.tmp.{}.{}",
            path.file_name()
                .and_then(|s| s.to_str())
                .unwrap_or("object"),
            std::process::id(),
            strata_observe::time::unix_time_ms()
        ));
        let result = (|| -> std::io::Result<()> {
            let mut f = std::fs::OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&tmp)?;
            f.write_all(bytes)?;
            f.sync_all()?;
            drop(f);
            std::fs::rename(&tmp, &path)
        })();
        if let Err(err) = result {
            let _ = std::fs::remove_file(&tmp);
            return Err(StoreError::io(key, err));
        }
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        if !prefix.is_empty() {
            validate_key(prefix)?;
        }
        let base = self.root.join(prefix);
        if !base.is_dir() {
            return Ok(Vec::new());
        }

        let mut out = Vec::new();
        let mut stack = vec![base];
        while let Some(dir) = stack.pop() {
            let entries = std::fs::read_dir(&dir)
                .map_err(|e| StoreError::io(dir.display().to_string(), e))?;
            for entry in entries {
                let entry = entry.map_err(|e| StoreError::io(prefix, e))?;
                let path = entry.path();
                let meta = entry.metadata().map_err(|e| StoreError::io(prefix, e))?;
                if meta.is_dir() {
                    stack.push(path);
                } else if meta.is_file() {
                    let rel = path
                        .strip_prefix(&self.root)
                        .unwrap_or(&path)
                        .to_string_lossy()
                        .replace('\\', "/");
                    out.push(rel);
                }
            }
        }
        out.sort();
        Ok(out)
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        let path = self.path_for(key)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StoreError::io(key, err)),
        }
    }

    fn presign(&self, key: &str) -> Result<String, StoreError> {
        let path = self.path_for(key)?;
        Ok(format!("file://{}", path.display()))
    }

    fn prefers_cache(&self) -> bool {
        !self.is_mount
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store(test_name: &str) -> FsStore {
        let mut root = std::env::temp_dir();
        root.push(format!(
            "strata-store-{test_name}-{}-{}",
            std::process::id(),
            strata_observe::time::unix_time_ms()
        ));
        std::fs::create_dir_all(&root).unwrap();
        FsStore::new(root)
    }

    #[test]
    fn put_get_head_delete() {
        let store = temp_store("put-get");
        store.put("a/b.bin", b"hello").unwrap();

        let stat = store.head("a/b.bin").unwrap();
        assert!(stat.exists);
        assert_eq!(stat.size, 5);

        assert_eq!(store.get("a/b.bin").unwrap(), b"hello");
        store.delete("a/b.bin").unwrap();
        assert!(!store.head("a/b.bin").unwrap().exists);
        assert!(matches!(
            store.get("a/b.bin"),
            Err(StoreError::NotFound(_))
        ));
        // Deleting an absent key is idempotent.
        store.delete("a/b.bin").unwrap();
    }

    #[test]
    fn get_range_is_exact_or_unsatisfiable() {
        let store = temp_store("range");
        store.put("d.bin", &(0u8..100).collect::<Vec<_>>()).unwrap();

        assert_eq!(store.get_range("d.bin", 10, 5).unwrap(), vec![10, 11, 12, 13, 14]);
        assert_eq!(store.get_range("d.bin", 0, 0).unwrap(), Vec::<u8>::new());
        assert!(matches!(
            store.get_range("d.bin", 95, 10),
            Err(StoreError::RangeUnsatisfiable { size: 100, .. })
        ));
    }

    #[test]
    fn list_is_recursive_and_sorted() {
        let store = temp_store("list");
        store.put("z.bin", b"z").unwrap();
        store.put("_partials/worker-0-1.json", b"{}").unwrap();
        store.put("_partials/worker-0-0.json", b"{}").unwrap();

        let all = store.list("").unwrap();
        assert_eq!(
            all,
            vec![
                "_partials/worker-0-0.json".to_string(),
                "_partials/worker-0-1.json".to_string(),
                "z.bin".to_string(),
            ]
        );
        let partials = store.list("_partials").unwrap();
        assert_eq!(partials.len(), 2);
        assert!(store.list("absent").unwrap().is_empty());
    }

    #[test]
    fn puts_are_atomic_under_overwrite() {
        let store = temp_store("atomic");
        store.put("x.bin", b"first").unwrap();
        store.put("x.bin", b"second").unwrap();
        assert_eq!(store.get("x.bin").unwrap(), b"second");
        // No temp leftovers.
        let all = store.list("").unwrap();
        assert_eq!(all, vec!["x.bin".to_string()]);
    }
}
