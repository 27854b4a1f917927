use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use std::sync::Mutex;

use strata_core::error::StrataError;
use strata_format::chunk::write_atomic;

/// Bounded on-disk cache of downloaded chunk files.
///
/// The directory may be shared by several worker processes on one machine:
/// admissions go through temp + rename, and a per-chunk `.lock` file makes
/// sure only one process downloads a given chunk while the others wait.
/// Pins are per-process reference counts; a pinned chunk is never evicted by
/// its own process, and an unlinked file stays readable through any fd that
/// already has it open.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub dir: PathBuf,
    pub max_bytes: u64,
    /// A `.lock` older than this is considered abandoned and broken.
    pub lock_stale_after: Duration,
    /// Upper bound on waiting for another process's download.
    pub wait_timeout: Duration,
}

impl CacheConfig {
    pub fn new(dir: impl Into<PathBuf>, max_bytes: u64) -> Self {
        Self {
            dir: dir.into(),
            max_bytes,
            lock_stale_after: Duration::from_secs(60),
            wait_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Default)]
struct CacheState {
    /// filename -> pin refcount.
    pins: HashMap<String, u32>,
    /// filename -> recency sequence (larger = more recent).
    recency: HashMap<String, u64>,
    next_seq: u64,
}

#[derive(Debug)]
pub struct ChunkCache {
    cfg: CacheConfig,
    state: Mutex<CacheState>,
}

impl ChunkCache {
    pub fn new(cfg: CacheConfig) -> Result<Self, StrataError> {
        if cfg.max_bytes == 0 {
            return Err(StrataError::config("max_cache_size must be > 0"));
        }
        std::fs::create_dir_all(&cfg.dir).map_err(|e| StrataError::io_from(e, &cfg.dir))?;
        Ok(Self {
            cfg,
            state: Mutex::new(CacheState::default()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.cfg.dir
    }

    fn chunk_path(&self, filename: &str) -> PathBuf {
        self.cfg.dir.join(filename)
    }

    fn lock_path(&self, filename: &str) -> PathBuf {
        self.cfg.dir.join(format!("{filename}.lock"))
    }

    fn state(&self) -> Result<std::sync::MutexGuard<'_, CacheState>, StrataError> {
        self.state
            .lock()
            .map_err(|_| StrataError::io("cache state mutex poisoned", "<cache>"))
    }

    fn touch(state: &mut CacheState, filename: &str) {
        state.next_seq += 1;
        let seq = state.next_seq;
        state.recency.insert(filename.to_string(), seq);
    }

    /// Ensures the chunk is present, downloading through `fetch` on a miss,
    /// and pins it for the caller. Exactly one process downloads; the rest
    /// wait for the rename to land.
    pub fn ensure_pinned(
        &self,
        filename: &str,
        fetch: impl FnOnce() -> Result<Vec<u8>, StrataError>,
    ) -> Result<(PathBuf, bool), StrataError> {
        let path = self.chunk_path(filename);
        if path.is_file() {
            self.pin(filename)?;
            return Ok((path, true));
        }

        let lock_path = self.lock_path(filename);
        let deadline = Instant::now() + self.cfg.wait_timeout;
        loop {
            match std::fs::OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&lock_path)
            {
                Ok(mut lock) => {
                    use std::io::Write;
                    let _ = write!(
                        lock,
                        "pid={}\nunix_time_ms={}\n",
                        std::process::id(),
                        strata_observe::time::unix_time_ms()
                    );
                    drop(lock);

                    // Another process may have admitted the chunk between our
                    // presence test and the lock acquisition.
                    let result = if path.is_file() {
                        self.pin(filename)
                    } else {
                        fetch().and_then(|bytes| self.admit_inner(filename, &bytes, true))
                    };
                    let _ = std::fs::remove_file(&lock_path);
                    result?;
                    return Ok((path, false));
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    if path.is_file() {
                        self.pin(filename)?;
                        return Ok((path, true));
                    }
                    if lock_is_stale(&lock_path, self.cfg.lock_stale_after) {
                        tracing::warn!(
                            target: "strata_flow",
                            event = "cache_lock_broken",
                            filename = filename,
                            "breaking stale chunk download lock"
                        );
                        let _ = std::fs::remove_file(&lock_path);
                        continue;
                    }
                    if Instant::now() >= deadline {
                        return Err(StrataError::io(
                            "timed out waiting for concurrent chunk download",
                            self.chunk_path(filename).display().to_string(),
                        ));
                    }
                    std::thread::sleep(Duration::from_millis(50));
                }
                Err(err) => return Err(StrataError::io_from(err, &lock_path)),
            }
        }
    }

    /// Writes the chunk atomically and evicts down to the byte budget.
    /// Fails with `CacheFull` when even full eviction of unpinned entries
    /// cannot fit the new chunk next to the pinned working set.
    pub fn admit(&self, filename: &str, bytes: &[u8]) -> Result<(), StrataError> {
        self.admit_inner(filename, bytes, false)
    }

    fn admit_inner(
        &self,
        filename: &str,
        bytes: &[u8],
        keep_pinned: bool,
    ) -> Result<(), StrataError> {
        let needed = bytes.len() as u64;
        if needed > self.cfg.max_bytes {
            let pinned = self.pinned_chunk_ids()?;
            return Err(StrataError::CacheFull {
                needed_bytes: needed,
                max_cache_size: self.cfg.max_bytes,
                pinned,
            });
        }

        // Make room first so the byte budget holds at every instant.
        let target = self.cfg.max_bytes - needed;
        let remaining = self.evict_unpinned_until(target)?;
        if remaining > target {
            let pinned = self.pinned_chunk_ids()?;
            return Err(StrataError::CacheFull {
                needed_bytes: needed,
                max_cache_size: self.cfg.max_bytes,
                pinned,
            });
        }

        write_atomic(&self.chunk_path(filename), bytes)?;
        if keep_pinned {
            self.pin(filename)?;
        } else {
            let mut state = self.state()?;
            Self::touch(&mut state, filename);
        }
        Ok(())
    }

    pub fn pin(&self, filename: &str) -> Result<(), StrataError> {
        let mut state = self.state()?;
        *state.pins.entry(filename.to_string()).or_insert(0) += 1;
        Self::touch(&mut state, filename);
        Ok(())
    }

    /// Unpins the chunk; with no remaining pins it becomes immediately
    /// evictable, and eviction runs opportunistically.
    pub fn done_with(&self, filename: &str) -> Result<(), StrataError> {
        {
            let mut state = self.state()?;
            match state.pins.get_mut(filename) {
                Some(count) if *count > 1 => *count -= 1,
                Some(_) => {
                    state.pins.remove(filename);
                }
                None => {}
            }
        }
        let _ = self.evict_unpinned_until(self.cfg.max_bytes)?;
        Ok(())
    }

    /// Total bytes of chunk files currently in the cache directory.
    pub fn disk_usage(&self) -> Result<u64, StrataError> {
        Ok(self.chunk_files()?.iter().map(|(_, size, _)| size).sum())
    }

    pub fn chunk_file_count(&self) -> Result<usize, StrataError> {
        Ok(self.chunk_files()?.len())
    }

    fn pinned_chunk_ids(&self) -> Result<Vec<u64>, StrataError> {
        let state = self.state()?;
        let mut ids: Vec<u64> = state
            .pins
            .keys()
            .filter_map(|name| parse_chunk_id(name))
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    /// `(filename, size, mtime_ms)` for every chunk file on disk.
    fn chunk_files(&self) -> Result<Vec<(String, u64, u64)>, StrataError> {
        let mut out = Vec::new();
        let entries = std::fs::read_dir(&self.cfg.dir)
            .map_err(|e| StrataError::io_from(e, &self.cfg.dir))?;
        for entry in entries {
            let entry = entry.map_err(|e| StrataError::io_from(e, &self.cfg.dir))?;
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with("chunk-") || !name.ends_with(".bin") {
                continue;
            }
            let meta = match entry.metadata() {
                Ok(meta) => meta,
                // Raced with another process's eviction.
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(StrataError::io_from(err, &self.cfg.dir)),
            };
            let mtime_ms = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_millis().min(u64::MAX as u128) as u64)
                .unwrap_or(0);
            out.push((name, meta.len(), mtime_ms));
        }
        Ok(out)
    }

    /// Deletes least-recently-used unpinned chunks until the directory holds
    /// at most `target` bytes (best effort: pinned entries are untouchable).
    /// Returns the bytes remaining on disk.
    pub fn evict_unpinned_until(&self, target: u64) -> Result<u64, StrataError> {
        let files = self.chunk_files()?;
        let total: u64 = files.iter().map(|(_, size, _)| size).sum();
        if total <= target {
            return Ok(total);
        }

        let (pins, recency): (HashMap<String, u32>, HashMap<String, u64>) = {
            let state = self.state()?;
            (state.pins.clone(), state.recency.clone())
        };

        // Unknown files (admitted by another process) order by mtime, which
        // recency sequences dominate for files this process touched.
        let mut candidates: Vec<(u64, String, u64)> = files
            .iter()
            .filter(|(name, _, _)| !pins.contains_key(name))
            .map(|(name, size, mtime_ms)| {
                let rank = recency.get(name).copied().unwrap_or(*mtime_ms / 1000);
                (rank, name.clone(), *size)
            })
            .collect();
        candidates.sort();

        let mut remaining = total;
        for (_, name, size) in candidates {
            if remaining <= target {
                break;
            }
            let path = self.chunk_path(&name);
            match std::fs::remove_file(&path) {
                Ok(()) => {
                    remaining = remaining.saturating_sub(size);
                    let mut state = self.state()?;
                    state.recency.remove(&name);
                    tracing::debug!(
                        target: "strata_flow",
                        event = "cache_evicted",
                        filename = %name,
                        bytes = size,
                        "evicted chunk"
                    );
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    remaining = remaining.saturating_sub(size);
                }
                Err(err) => return Err(StrataError::io_from(err, &path)),
            }
        }

        Ok(remaining)
    }
}

fn lock_is_stale(lock_path: &Path, stale_after: Duration) -> bool {
    let Ok(meta) = std::fs::metadata(lock_path) else {
        return false;
    };
    let Ok(modified) = meta.modified() else {
        return false;
    };
    modified
        .elapsed()
        .map(|age| age >= stale_after)
        .unwrap_or(false)
}

/// Best-effort chunk id out of `chunk-…-<id>.bin` names, for diagnostics.
fn parse_chunk_id(filename: &str) -> Option<u64> {
    let stem = filename.strip_prefix("chunk-")?.strip_suffix(".bin")?;
    stem.rsplit('-').next()?.parse().ok()
}
