#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

pub mod fs;
pub mod mem;
pub mod retry;
#[cfg(feature = "s3")]
pub mod s3;

use thiserror::Error;

use strata_core::error::StrataError;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("range [{start}, +{len}) unsatisfiable for {key} (object size {size})")]
    RangeUnsatisfiable {
        key: String,
        start: u64,
        len: u64,
        size: u64,
    },
    #[error("unsupported store root: {0}")]
    UnsupportedRoot(String),
    #[error("{op} is not supported by this store")]
    Unsupported { op: &'static str },
    #[error("invalid object key: {0}")]
    InvalidKey(String),
    #[error("io error at {key} after {retries} retries: {message}")]
    Io {
        key: String,
        message: String,
        retries: u32,
    },
}

impl StoreError {
    pub fn io(key: impl Into<String>, err: impl std::fmt::Display) -> Self {
        StoreError::Io {
            key: key.into(),
            message: err.to_string(),
            retries: 0,
        }
    }

    /// Only io failures are worth another attempt; everything else is a
    /// stable answer from the backend.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Io { .. })
    }
}

impl From<StoreError> for StrataError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Io {
                key,
                message,
                retries,
            } => StrataError::Io {
                message,
                path: key,
                retry_count: retries,
            },
            StoreError::UnsupportedRoot(root) => {
                StrataError::config(format!("unsupported store root: {root}"))
            }
            StoreError::InvalidKey(key) => {
                StrataError::config(format!("invalid object key: {key}"))
            }
            other @ (StoreError::NotFound(_)
            | StoreError::RangeUnsatisfiable { .. }
            | StoreError::Unsupported { .. }) => StrataError::Io {
                message: other.to_string(),
                path: String::new(),
                retry_count: 0,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreStat {
    pub exists: bool,
    pub size: u64,
    pub etag: Option<String>,
}

/// Uniform capability set over remote and local dataset roots.
///
/// Keys are `/`-separated paths relative to the root. The trait is
/// synchronous; backends that are async inside bridge with their own runtime
/// handle. Callers that must not block a cooperative scheduler wrap calls in
/// `spawn_blocking`.
pub trait ObjectStore: Send + Sync + 'static {
    fn head(&self, key: &str) -> Result<StoreStat, StoreError>;
    fn get(&self, key: &str) -> Result<Vec<u8>, StoreError>;
    /// Exactly the bytes `[start, start + len)` or `RangeUnsatisfiable`.
    fn get_range(&self, key: &str, start: u64, len: u64) -> Result<Vec<u8>, StoreError>;
    fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError>;
    /// Keys under `prefix`, sorted ascending.
    fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
    fn delete(&self, key: &str) -> Result<(), StoreError>;
    fn presign(&self, key: &str) -> Result<String, StoreError>;

    /// Whether readers should copy chunks into the local cache. Network
    /// mounts answer false: their files are already local enough.
    fn prefers_cache(&self) -> bool {
        true
    }
}

pub(crate) fn validate_key(key: &str) -> Result<(), StoreError> {
    let bad = key.trim().is_empty()
        || key.starts_with('/')
        || key.split('/').any(|part| {
            part.is_empty() || part == "." || part == ".." || part.contains('\\')
        });
    if bad {
        return Err(StoreError::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// Opens a store from a dataset root URL.
///
/// - `s3://bucket/prefix`: S3 (requires feature `s3`)
/// - `local:/mnt/data`: network-mounted filesystem, chunk caching disabled
/// - plain path: local filesystem
///
/// `gs://` and `azure://` roots are recognized but not built into this
/// binary; they fail with `UnsupportedRoot` naming the backend.
pub fn open_from_root(root: &str) -> Result<Box<dyn ObjectStore>, StoreError> {
    let trimmed = root.trim();
    if trimmed.is_empty() {
        return Err(StoreError::UnsupportedRoot(root.to_string()));
    }

    if let Some(rest) = trimmed.strip_prefix("s3://") {
        #[cfg(feature = "s3")]
        {
            return Ok(Box::new(s3::S3Store::from_env_url(rest)?));
        }
        #[cfg(not(feature = "s3"))]
        {
            let _ = rest;
            return Err(StoreError::UnsupportedRoot(format!(
                "s3://... requires feature 's3' (got {root:?})"
            )));
        }
    }

    for scheme in ["gs://", "azure://"] {
        if trimmed.starts_with(scheme) {
            return Err(StoreError::UnsupportedRoot(format!(
                "{scheme}... backend is not built into this binary (got {root:?})"
            )));
        }
    }

    if let Some(rest) = trimmed.strip_prefix("local:") {
        return Ok(Box::new(fs::FsStore::mount(rest.trim())));
    }

    Ok(Box::new(fs::FsStore::new(trimmed)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_validation() {
        assert!(validate_key("index.json").is_ok());
        assert!(validate_key("_partials/worker-0-0.json").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("/abs").is_err());
        assert!(validate_key("a//b").is_err());
        assert!(validate_key("a/../b").is_err());
        assert!(validate_key("a\\b").is_err());
    }

    #[test]
    fn open_rejects_unknown_backends() {
        assert!(matches!(
            open_from_root("gs://bucket/x"),
            Err(StoreError::UnsupportedRoot(_))
        ));
        assert!(matches!(
            open_from_root("azure://container/x"),
            Err(StoreError::UnsupportedRoot(_))
        ));
        assert!(matches!(
            open_from_root("   "),
            Err(StoreError::UnsupportedRoot(_))
        ));
    }

    #[test]
    fn mount_roots_disable_caching() {
        let store = open_from_root("local:/tmp").unwrap();
        assert!(!store.prefers_cache());
        let store = open_from_root("/tmp").unwrap();
        assert!(store.prefers_cache());
    }
}
