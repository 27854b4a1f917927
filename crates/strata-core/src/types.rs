use serde::{Deserialize, Serialize};
use thiserror::Error;

/// On-disk chunk format version. Readers reject anything else.
pub const CHUNK_FORMAT_VERSION: u16 = 2;

/// `index.json` schema version.
pub const INDEX_VERSION: u32 = 2;

/// Magic bytes at offset 0 of every chunk file.
pub const CHUNK_MAGIC: [u8; 4] = *b"LTDC";

/// Payload compression applied to the chunk payload region.
///
/// The header and offset table are always stored uncompressed; the id byte
/// lives at offset 26 of the chunk header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    Zstd,
    Lz4,
}

impl Compression {
    pub fn id(self) -> u8 {
        match self {
            Compression::None => 0,
            Compression::Zstd => 1,
            Compression::Lz4 => 2,
        }
    }

    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(Compression::None),
            1 => Some(Compression::Zstd),
            2 => Some(Compression::Lz4),
            _ => None,
        }
    }

    /// Parses the writer-facing option value (`null | zstd | lz4`).
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "null" | "none" => Some(Compression::None),
            "zstd" => Some(Compression::Zstd),
            "lz4" => Some(Compression::Lz4),
            _ => None,
        }
    }

    pub fn as_str(self) -> Option<&'static str> {
        match self {
            Compression::None => None,
            Compression::Zstd => Some("zstd"),
            Compression::Lz4 => Some("lz4"),
        }
    }
}

/// One consuming stream's position in the read world.
///
/// The world is the cross product of data-parallel ranks and data-loader
/// workers per rank; `stream_index` enumerates it row-major so that
/// assignments are stable under any iteration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorldSlot {
    pub rank: u32,
    pub num_ranks: u32,
    pub worker: u32,
    pub workers_per_rank: u32,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WorldSlotError {
    #[error("num_ranks and workers_per_rank must be > 0")]
    EmptyWorld,
    #[error("rank {rank} out of range (num_ranks {num_ranks})")]
    RankOutOfRange { rank: u32, num_ranks: u32 },
    #[error("worker {worker} out of range (workers_per_rank {workers_per_rank})")]
    WorkerOutOfRange { worker: u32, workers_per_rank: u32 },
}

impl WorldSlot {
    /// The single-process, single-worker world.
    pub fn solo() -> Self {
        Self {
            rank: 0,
            num_ranks: 1,
            worker: 0,
            workers_per_rank: 1,
        }
    }

    pub fn validate(&self) -> Result<(), WorldSlotError> {
        if self.num_ranks == 0 || self.workers_per_rank == 0 {
            return Err(WorldSlotError::EmptyWorld);
        }
        if self.rank >= self.num_ranks {
            return Err(WorldSlotError::RankOutOfRange {
                rank: self.rank,
                num_ranks: self.num_ranks,
            });
        }
        if self.worker >= self.workers_per_rank {
            return Err(WorldSlotError::WorkerOutOfRange {
                worker: self.worker,
                workers_per_rank: self.workers_per_rank,
            });
        }
        Ok(())
    }

    pub fn total_streams(&self) -> u32 {
        self.num_ranks.saturating_mul(self.workers_per_rank)
    }

    pub fn stream_index(&self) -> u32 {
        self.rank
            .saturating_mul(self.workers_per_rank)
            .saturating_add(self.worker)
    }
}

/// Descriptor for one published chunk, as recorded in the dataset index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkDescriptor {
    pub id: u64,
    pub filename: String,
    pub bytes: u64,
    pub samples: u32,
    /// First global sample id in the chunk (inclusive).
    pub first: u64,
    /// Last global sample id in the chunk (inclusive).
    pub last: u64,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChunkDescriptorError {
    #[error("filename must be non-empty")]
    EmptyFilename,
    #[error("chunk {id} holds zero samples")]
    EmptyChunk { id: u64 },
    #[error("chunk {id} sample range [{first}, {last}] disagrees with count {samples}")]
    RangeMismatch {
        id: u64,
        first: u64,
        last: u64,
        samples: u32,
    },
}

impl ChunkDescriptor {
    pub fn validate(&self) -> Result<(), ChunkDescriptorError> {
        if self.filename.trim().is_empty() {
            return Err(ChunkDescriptorError::EmptyFilename);
        }
        if self.samples == 0 {
            return Err(ChunkDescriptorError::EmptyChunk { id: self.id });
        }
        let span = self.last.saturating_sub(self.first).saturating_add(1);
        if span != u64::from(self.samples) {
            return Err(ChunkDescriptorError::RangeMismatch {
                id: self.id,
                first: self.first,
                last: self.last,
                samples: self.samples,
            });
        }
        Ok(())
    }
}

/// Canonical chunk filename: `chunk-<zeropad id>.bin`.
pub fn chunk_filename(chunk_id: u64) -> String {
    format!("chunk-{chunk_id:010}.bin")
}
