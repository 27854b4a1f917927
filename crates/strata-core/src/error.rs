use thiserror::Error;

/// The error taxonomy shared by every strata crate.
///
/// Each variant carries the structured fields a consumer needs to act on the
/// failure without parsing the message: the object path, the chunk and sample
/// ids when known, and how many retries were spent.
#[derive(Debug, Error)]
pub enum StrataError {
    #[error("config error: {message}")]
    Config { message: String },

    #[error("format error at {path}: {message}")]
    Format {
        message: String,
        path: String,
        chunk_id: Option<u64>,
        sample_id: Option<u64>,
    },

    #[error("io error at {path} after {retry_count} retries: {message}")]
    Io {
        message: String,
        path: String,
        retry_count: u32,
    },

    #[error(
        "cache full: admitting {needed_bytes} bytes would exceed max_cache_size {max_cache_size} \
         with pinned chunks {pinned:?}"
    )]
    CacheFull {
        needed_bytes: u64,
        max_cache_size: u64,
        pinned: Vec<u64>,
    },

    #[error("assignment error: {message}")]
    Assignment { message: String },

    #[error("user fn failed on item {item_index} after {retry_count} retries: {message}")]
    UserFn {
        message: String,
        item_index: u64,
        retry_count: u32,
    },
}

/// Coarse classification used by CLI drivers to pick an exit code and by the
/// retry layer to decide whether an error is worth another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Config,
    Format,
    Io,
    CacheFull,
    Assignment,
    UserFn,
}

impl StrataError {
    pub fn config(message: impl Into<String>) -> Self {
        StrataError::Config {
            message: message.into(),
        }
    }

    pub fn format(message: impl Into<String>, path: impl Into<String>) -> Self {
        StrataError::Format {
            message: message.into(),
            path: path.into(),
            chunk_id: None,
            sample_id: None,
        }
    }

    pub fn format_in_chunk(
        message: impl Into<String>,
        path: impl Into<String>,
        chunk_id: u64,
    ) -> Self {
        StrataError::Format {
            message: message.into(),
            path: path.into(),
            chunk_id: Some(chunk_id),
            sample_id: None,
        }
    }

    pub fn io(message: impl Into<String>, path: impl Into<String>) -> Self {
        StrataError::Io {
            message: message.into(),
            path: path.into(),
            retry_count: 0,
        }
    }

    pub fn io_from(err: std::io::Error, path: &std::path::Path) -> Self {
        StrataError::Io {
            message: err.to_string(),
            path: path.display().to_string(),
            retry_count: 0,
        }
    }

    pub fn assignment(message: impl Into<String>) -> Self {
        StrataError::Assignment {
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            StrataError::Config { .. } => ErrorKind::Config,
            StrataError::Format { .. } => ErrorKind::Format,
            StrataError::Io { .. } => ErrorKind::Io,
            StrataError::CacheFull { .. } => ErrorKind::CacheFull,
            StrataError::Assignment { .. } => ErrorKind::Assignment,
            StrataError::UserFn { .. } => ErrorKind::UserFn,
        }
    }

    /// Attaches a sample id to a format error; other variants pass through.
    pub fn with_sample_id(self, sample_id: u64) -> Self {
        match self {
            StrataError::Format {
                message,
                path,
                chunk_id,
                ..
            } => StrataError::Format {
                message,
                path,
                chunk_id,
                sample_id: Some(sample_id),
            },
            other => other,
        }
    }

    /// Records the number of retries spent before an io error surfaced.
    pub fn with_retry_count(self, retries: u32) -> Self {
        match self {
            StrataError::Io { message, path, .. } => StrataError::Io {
                message,
                path,
                retry_count: retries,
            },
            StrataError::UserFn {
                message,
                item_index,
                ..
            } => StrataError::UserFn {
                message,
                item_index,
                retry_count: retries,
            },
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, StrataError>;
