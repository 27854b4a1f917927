use std::path::Path;

use serde::{Deserialize, Serialize};

use strata_core::error::StrataError;
use strata_core::types::{ChunkDescriptor, Compression, INDEX_VERSION};

use crate::serialize::Field;

/// The dataset manifest (`index.json`): schema, compression, the ordered
/// chunk descriptor list, and the producing config's hash.
///
/// Serialized with stable key order (struct order) so identical datasets
/// produce byte-identical documents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetIndex {
    pub version: u32,
    pub compression: Option<String>,
    pub schema: Vec<Field>,
    pub chunks: Vec<ChunkDescriptor>,
    pub total_samples: u64,
    pub config_hash: String,
}

/// Basename of the manifest inside a dataset directory.
pub const INDEX_FILE_NAME: &str = "index.json";

/// Store prefix under which per-worker partial indices are staged.
pub const PARTIALS_PREFIX: &str = "_partials";

impl DatasetIndex {
    pub fn new(
        schema: Vec<Field>,
        compression: Compression,
        chunks: Vec<ChunkDescriptor>,
        config_hash: String,
    ) -> Result<Self, StrataError> {
        let total_samples = chunks.iter().map(|c| u64::from(c.samples)).sum();
        let index = Self {
            version: INDEX_VERSION,
            compression: compression.as_str().map(str::to_string),
            schema,
            chunks,
            total_samples,
            config_hash,
        };
        index.validate()?;
        Ok(index)
    }

    /// Checks the sample-space invariants: descriptors valid and id-ordered,
    /// ranges contiguous from 0 with no overlap, count totals consistent.
    pub fn validate(&self) -> Result<(), StrataError> {
        if self.version != INDEX_VERSION {
            return Err(StrataError::format(
                format!("unsupported index version {}", self.version),
                INDEX_FILE_NAME,
            ));
        }
        if self.schema.is_empty() {
            return Err(StrataError::format(
                "index declares an empty schema",
                INDEX_FILE_NAME,
            ));
        }
        if let Some(c) = &self.compression {
            if Compression::parse(c).is_none() {
                return Err(StrataError::format(
                    format!("unknown compression {c:?}"),
                    INDEX_FILE_NAME,
                ));
            }
        }

        let mut next_id = 0u64;
        let mut next_sample = 0u64;
        for chunk in &self.chunks {
            chunk.validate().map_err(|e| {
                StrataError::format_in_chunk(e.to_string(), INDEX_FILE_NAME, chunk.id)
            })?;
            if chunk.id != next_id {
                return Err(StrataError::format_in_chunk(
                    format!("expected chunk id {next_id}, found {}", chunk.id),
                    INDEX_FILE_NAME,
                    chunk.id,
                ));
            }
            if chunk.first != next_sample {
                return Err(StrataError::format_in_chunk(
                    format!(
                        "expected first sample {next_sample}, found {}",
                        chunk.first
                    ),
                    INDEX_FILE_NAME,
                    chunk.id,
                ));
            }
            next_id += 1;
            next_sample = chunk.last + 1;
        }
        if next_sample != self.total_samples {
            return Err(StrataError::format(
                format!(
                    "chunks cover {next_sample} samples, total_samples says {}",
                    self.total_samples
                ),
                INDEX_FILE_NAME,
            ));
        }
        Ok(())
    }

    pub fn compression(&self) -> Result<Compression, StrataError> {
        match &self.compression {
            None => Ok(Compression::None),
            Some(c) => Compression::parse(c).ok_or_else(|| {
                StrataError::format(format!("unknown compression {c:?}"), INDEX_FILE_NAME)
            }),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.total_samples == 0
    }

    /// Maps a global sample id to `(chunk index, intra-chunk position)`.
    pub fn locate(&self, sample_id: u64) -> Result<(usize, u32), StrataError> {
        if sample_id >= self.total_samples {
            return Err(StrataError::assignment(format!(
                "sample id {sample_id} out of range (total_samples {})",
                self.total_samples
            )));
        }
        let idx = self
            .chunks
            .partition_point(|c| c.last < sample_id);
        let chunk = &self.chunks[idx];
        Ok((idx, (sample_id - chunk.first) as u32))
    }

    pub fn to_json_bytes(&self) -> Result<Vec<u8>, StrataError> {
        serde_json::to_vec_pretty(self)
            .map_err(|e| StrataError::format(format!("index encode failed: {e}"), INDEX_FILE_NAME))
    }

    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, StrataError> {
        let index: Self = serde_json::from_slice(bytes).map_err(|e| {
            StrataError::format(format!("index parse failed: {e}"), INDEX_FILE_NAME)
        })?;
        index.validate()?;
        Ok(index)
    }

    pub fn save(&self, dir: &Path) -> Result<(), StrataError> {
        let bytes = self.to_json_bytes()?;
        crate::chunk::write_atomic(&dir.join(INDEX_FILE_NAME), &bytes)
    }

    pub fn load(dir: &Path) -> Result<Self, StrataError> {
        let path = dir.join(INDEX_FILE_NAME);
        let bytes = std::fs::read(&path).map_err(|e| StrataError::io_from(e, &path))?;
        Self::from_json_bytes(&bytes)
    }
}

/// Index fragment produced by one optimize worker before the merge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialIndex {
    pub rank: u32,
    pub worker: u32,
    pub compression: Option<String>,
    pub schema: Vec<Field>,
    /// Descriptors with writer-local ids, in emission order.
    pub chunks: Vec<ChunkDescriptor>,
}

impl PartialIndex {
    /// Store key for this fragment under the dataset root.
    pub fn object_key(rank: u32, worker: u32) -> String {
        format!("{PARTIALS_PREFIX}/worker-{rank}-{worker}.json")
    }

    pub fn to_json_bytes(&self) -> Result<Vec<u8>, StrataError> {
        serde_json::to_vec_pretty(self).map_err(|e| {
            StrataError::format(format!("partial index encode failed: {e}"), "<partial>")
        })
    }

    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, StrataError> {
        serde_json::from_slice(bytes).map_err(|e| {
            StrataError::format(format!("partial index parse failed: {e}"), "<partial>")
        })
    }
}

/// Merges per-worker fragments into the global index.
///
/// Fragments are ordered by `(rank, worker)`, then local chunk id; global
/// chunk ids are reassigned contiguously and sample ranges accumulated.
/// Filenames are kept as uploaded (worker-scoped names carry the producing
/// worker in the name, so no object rename is needed).
pub fn merge_partials(
    mut partials: Vec<PartialIndex>,
    config_hash: String,
) -> Result<DatasetIndex, StrataError> {
    if partials.is_empty() {
        return Err(StrataError::config("cannot merge zero partial indices"));
    }
    partials.sort_by_key(|p| (p.rank, p.worker));

    // A worker whose shard produced nothing publishes an empty fragment;
    // the schema is taken from the first non-empty one.
    let reference = partials
        .iter()
        .find(|p| !p.schema.is_empty())
        .ok_or_else(|| StrataError::config("all workers produced zero samples"))?;
    let schema = reference.schema.clone();
    let compression = reference.compression.clone();
    for p in &partials {
        if p.schema.is_empty() && p.chunks.is_empty() {
            continue;
        }
        if p.schema != schema {
            return Err(StrataError::format(
                format!(
                    "schema mismatch between workers ({},{}) and ({},{})",
                    reference.rank, reference.worker, p.rank, p.worker
                ),
                "<partial>",
            ));
        }
        if p.compression != compression {
            return Err(StrataError::format(
                format!(
                    "compression mismatch between workers ({},{}) and ({},{})",
                    reference.rank, reference.worker, p.rank, p.worker
                ),
                "<partial>",
            ));
        }
    }

    let mut chunks = Vec::new();
    let mut next_id = 0u64;
    let mut next_sample = 0u64;
    for partial in &partials {
        let mut prev_local: Option<u64> = None;
        for chunk in &partial.chunks {
            if let Some(prev) = prev_local {
                if chunk.id <= prev {
                    return Err(StrataError::format(
                        format!(
                            "worker ({},{}) chunk ids not increasing: {} then {}",
                            partial.rank, partial.worker, prev, chunk.id
                        ),
                        "<partial>",
                    ));
                }
            }
            prev_local = Some(chunk.id);

            let samples = u64::from(chunk.samples);
            chunks.push(ChunkDescriptor {
                id: next_id,
                filename: chunk.filename.clone(),
                bytes: chunk.bytes,
                samples: chunk.samples,
                first: next_sample,
                last: next_sample + samples - 1,
            });
            next_id += 1;
            next_sample += samples;
        }
    }

    let compression = match &compression {
        None => Compression::None,
        Some(c) => Compression::parse(c).ok_or_else(|| {
            StrataError::format(format!("unknown compression {c:?}"), "<partial>")
        })?,
    };

    DatasetIndex::new(schema, compression, chunks, config_hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::types::chunk_filename;

    fn field() -> Vec<Field> {
        vec![Field {
            name: "x".to_string(),
            codec: "int".to_string(),
        }]
    }

    fn descriptor(id: u64, samples: u32, first: u64) -> ChunkDescriptor {
        ChunkDescriptor {
            id,
            filename: chunk_filename(id),
            bytes: 100,
            samples,
            first,
            last: first + u64::from(samples) - 1,
        }
    }

    #[test]
    fn build_and_locate() {
        let index = DatasetIndex::new(
            field(),
            Compression::None,
            vec![
                descriptor(0, 4, 0),
                descriptor(1, 4, 4),
                descriptor(2, 2, 8),
            ],
            "h".to_string(),
        )
        .unwrap();
        assert_eq!(index.total_samples, 10);
        assert_eq!(index.locate(0).unwrap(), (0, 0));
        assert_eq!(index.locate(5).unwrap(), (1, 1));
        assert_eq!(index.locate(9).unwrap(), (2, 1));
        assert!(index.locate(10).is_err());
    }

    #[test]
    fn json_round_trip_is_stable() {
        let index = DatasetIndex::new(
            field(),
            Compression::Zstd,
            vec![descriptor(0, 4, 0)],
            "abc".to_string(),
        )
        .unwrap();
        let a = index.to_json_bytes().unwrap();
        let parsed = DatasetIndex::from_json_bytes(&a).unwrap();
        assert_eq!(parsed, index);
        let b = parsed.to_json_bytes().unwrap();
        assert_eq!(a, b, "serialization must be byte-stable");
    }

    #[test]
    fn validate_rejects_gaps_and_bad_totals() {
        let mut index = DatasetIndex::new(
            field(),
            Compression::None,
            vec![descriptor(0, 4, 0), descriptor(1, 4, 4)],
            "h".to_string(),
        )
        .unwrap();

        index.chunks[1].first = 5;
        index.chunks[1].last = 8;
        assert!(index.validate().is_err());
    }

    #[test]
    fn merge_orders_by_rank_then_worker_and_reassigns_ids() {
        fn partial(rank: u32, worker: u32, counts: &[u32]) -> PartialIndex {
            let mut first = 0u64;
            let chunks = counts
                .iter()
                .enumerate()
                .map(|(i, &samples)| {
                    let d = ChunkDescriptor {
                        id: i as u64,
                        filename: format!("chunk-{rank}-{worker}-{i:010}.bin"),
                        bytes: 64,
                        samples,
                        first,
                        last: first + u64::from(samples) - 1,
                    };
                    first += u64::from(samples);
                    d
                })
                .collect();
            PartialIndex {
                rank,
                worker,
                compression: None,
                schema: field(),
                chunks,
            }
        }

        // Deliberately out of order.
        let merged = merge_partials(
            vec![
                partial(1, 0, &[2]),
                partial(0, 1, &[3, 1]),
                partial(0, 0, &[4]),
            ],
            "cfg".to_string(),
        )
        .unwrap();

        assert_eq!(merged.total_samples, 10);
        let ids: Vec<u64> = merged.chunks.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3]);
        let files: Vec<&str> = merged
            .chunks
            .iter()
            .map(|c| c.filename.as_str())
            .collect();
        assert_eq!(
            files,
            vec![
                "chunk-0-0-0000000000.bin",
                "chunk-0-1-0000000000.bin",
                "chunk-0-1-0000000001.bin",
                "chunk-1-0-0000000000.bin",
            ]
        );
        let firsts: Vec<u64> = merged.chunks.iter().map(|c| c.first).collect();
        assert_eq!(firsts, vec![0, 4, 7, 8]);
        merged.validate().unwrap();
    }

    #[test]
    fn merge_rejects_schema_mismatch() {
        let a = PartialIndex {
            rank: 0,
            worker: 0,
            compression: None,
            schema: field(),
            chunks: vec![descriptor(0, 1, 0)],
        };
        let mut b = a.clone();
        b.worker = 1;
        b.schema = vec![Field {
            name: "y".to_string(),
            codec: "int".to_string(),
        }];
        assert!(merge_partials(vec![a, b], "h".to_string()).is_err());
    }

    #[test]
    fn merge_tolerates_empty_workers() {
        let full = PartialIndex {
            rank: 0,
            worker: 0,
            compression: None,
            schema: field(),
            chunks: vec![descriptor(0, 3, 0)],
        };
        let empty = PartialIndex {
            rank: 0,
            worker: 1,
            compression: None,
            schema: Vec::new(),
            chunks: Vec::new(),
        };
        let merged = merge_partials(vec![empty.clone(), full], "h".to_string()).unwrap();
        assert_eq!(merged.total_samples, 3);

        let err = merge_partials(vec![empty], "h".to_string()).unwrap_err();
        assert!(err.to_string().contains("zero samples"));
    }

    #[test]
    fn merge_determinism() {
        let make = || {
            vec![
                PartialIndex {
                    rank: 0,
                    worker: 0,
                    compression: None,
                    schema: field(),
                    chunks: vec![descriptor(0, 2, 0)],
                },
                PartialIndex {
                    rank: 0,
                    worker: 1,
                    compression: None,
                    schema: field(),
                    chunks: vec![descriptor(0, 3, 0)],
                },
            ]
        };
        let a = merge_partials(make(), "h".to_string())
            .unwrap()
            .to_json_bytes()
            .unwrap();
        let b = merge_partials(make(), "h".to_string())
            .unwrap()
            .to_json_bytes()
            .unwrap();
        assert_eq!(a, b);
    }
}
