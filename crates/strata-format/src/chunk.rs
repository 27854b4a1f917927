use std::io::Write;
use std::path::{Path, PathBuf};

use strata_core::config::ChunkBudget;
use strata_core::error::StrataError;
use strata_core::sample::Sample;
use strata_core::types::{ChunkDescriptor, Compression, CHUNK_FORMAT_VERSION, CHUNK_MAGIC};

use crate::serialize::{Registry, Schema};

/// Fixed header length: magic(4) version(2) chunk_id(8) sample_count(4)
/// payload_len(8) compression(1) flags(1).
pub const HEADER_LEN: usize = 28;

/// Zstd level for chunk payloads.
const ZSTD_LEVEL: i32 = 3;

/// Offsets in the table index the *uncompressed* payload; when the
/// compression id is non-zero the stored payload region is one compressed
/// frame and `payload_len` is its stored length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub version: u16,
    pub chunk_id: u64,
    pub sample_count: u32,
    pub payload_len: u64,
    pub compression: Compression,
    pub flags: u8,
}

impl ChunkHeader {
    pub fn parse(bytes: &[u8], path: &str) -> Result<Self, StrataError> {
        if bytes.len() < HEADER_LEN {
            return Err(StrataError::format(
                format!("chunk header needs {HEADER_LEN} bytes, got {}", bytes.len()),
                path,
            ));
        }
        if bytes[0..4] != CHUNK_MAGIC {
            return Err(StrataError::format(
                format!("bad magic {:02x?}", &bytes[0..4]),
                path,
            ));
        }
        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        if version != CHUNK_FORMAT_VERSION {
            return Err(StrataError::format(
                format!("unsupported chunk format version {version}"),
                path,
            ));
        }
        let chunk_id = u64::from_le_bytes([
            bytes[6], bytes[7], bytes[8], bytes[9], bytes[10], bytes[11], bytes[12], bytes[13],
        ]);
        let sample_count = u32::from_le_bytes([bytes[14], bytes[15], bytes[16], bytes[17]]);
        let payload_len = u64::from_le_bytes([
            bytes[18], bytes[19], bytes[20], bytes[21], bytes[22], bytes[23], bytes[24], bytes[25],
        ]);
        let compression = Compression::from_id(bytes[26]).ok_or_else(|| {
            StrataError::format_in_chunk(
                format!("unknown compression id {}", bytes[26]),
                path,
                chunk_id,
            )
        })?;
        Ok(Self {
            version,
            chunk_id,
            sample_count,
            payload_len,
            compression,
            flags: bytes[27],
        })
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&CHUNK_MAGIC);
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&self.chunk_id.to_le_bytes());
        out.extend_from_slice(&self.sample_count.to_le_bytes());
        out.extend_from_slice(&self.payload_len.to_le_bytes());
        out.push(self.compression.id());
        out.push(self.flags);
    }

    /// Byte length of the offset table that follows the header.
    pub fn offset_table_len(&self) -> usize {
        (self.sample_count as usize + 1) * 4
    }

    /// File offset at which the payload region starts.
    pub fn payload_start(&self) -> u64 {
        HEADER_LEN as u64 + self.offset_table_len() as u64
    }
}

fn parse_offsets(
    header: &ChunkHeader,
    table: &[u8],
    path: &str,
) -> Result<Vec<u32>, StrataError> {
    let want = header.offset_table_len();
    if table.len() < want {
        return Err(StrataError::format_in_chunk(
            format!("offset table needs {want} bytes, got {}", table.len()),
            path,
            header.chunk_id,
        ));
    }
    let offsets: Vec<u32> = table[..want]
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    if offsets.first() != Some(&0) {
        return Err(StrataError::format_in_chunk(
            "offset table must start at 0",
            path,
            header.chunk_id,
        ));
    }
    for pair in offsets.windows(2) {
        if pair[1] < pair[0] {
            return Err(StrataError::format_in_chunk(
                format!("offset table decreases: {} then {}", pair[0], pair[1]),
                path,
                header.chunk_id,
            ));
        }
    }
    Ok(offsets)
}

/// Header plus offset table, parsed from a byte-range read of the file
/// prefix. Lets a random-access reader fetch one sample's bytes without
/// downloading the chunk.
#[derive(Debug, Clone)]
pub struct ChunkPrefix {
    pub header: ChunkHeader,
    offsets: Vec<u32>,
}

impl ChunkPrefix {
    pub fn parse(bytes: &[u8], path: &str) -> Result<Self, StrataError> {
        let header = ChunkHeader::parse(bytes, path)?;
        let offsets = parse_offsets(&header, &bytes[HEADER_LEN..], path)?;
        Ok(Self { header, offsets })
    }

    /// Absolute file span `[start, start+len)` of sample `j`'s blob. Range
    /// access requires an uncompressed payload.
    pub fn sample_span(&self, j: u32, path: &str) -> Result<(u64, u32), StrataError> {
        if self.header.compression != Compression::None {
            return Err(StrataError::format_in_chunk(
                "byte-range sample access requires an uncompressed chunk",
                path,
                self.header.chunk_id,
            ));
        }
        if j >= self.header.sample_count {
            return Err(StrataError::format_in_chunk(
                format!(
                    "sample index {j} out of range (chunk holds {})",
                    self.header.sample_count
                ),
                path,
                self.header.chunk_id,
            ));
        }
        let start = self.offsets[j as usize];
        let end = self.offsets[j as usize + 1];
        Ok((
            self.header.payload_start() + u64::from(start),
            end - start,
        ))
    }
}

/// A fully materialized chunk: validated header, offsets, and the
/// uncompressed payload.
#[derive(Debug, Clone)]
pub struct ChunkReader {
    header: ChunkHeader,
    offsets: Vec<u32>,
    payload: Vec<u8>,
    path: String,
}

impl ChunkReader {
    pub fn parse(bytes: &[u8], path: &str) -> Result<Self, StrataError> {
        let header = ChunkHeader::parse(bytes, path)?;
        let offsets = parse_offsets(&header, &bytes[HEADER_LEN..], path)?;

        let payload_start = header.payload_start() as usize;
        let stored = bytes.get(payload_start..).ok_or_else(|| {
            StrataError::format_in_chunk("truncated payload region", path, header.chunk_id)
        })?;
        if stored.len() as u64 != header.payload_len {
            return Err(StrataError::format_in_chunk(
                format!(
                    "payload region is {} bytes, header says {}",
                    stored.len(),
                    header.payload_len
                ),
                path,
                header.chunk_id,
            ));
        }

        let payload = match header.compression {
            Compression::None => stored.to_vec(),
            Compression::Zstd => zstd::decode_all(stored).map_err(|e| {
                StrataError::format_in_chunk(
                    format!("zstd decompress failed: {e}"),
                    path,
                    header.chunk_id,
                )
            })?,
            Compression::Lz4 => lz4_flex::decompress_size_prepended(stored).map_err(|e| {
                StrataError::format_in_chunk(
                    format!("lz4 decompress failed: {e}"),
                    path,
                    header.chunk_id,
                )
            })?,
        };

        let last = *offsets.last().unwrap_or(&0);
        if u64::from(last) != payload.len() as u64 {
            return Err(StrataError::format_in_chunk(
                format!(
                    "last offset {last} does not equal payload length {}",
                    payload.len()
                ),
                path,
                header.chunk_id,
            ));
        }

        Ok(Self {
            header,
            offsets,
            payload,
            path: path.to_string(),
        })
    }

    pub fn open(path: &Path) -> Result<Self, StrataError> {
        let bytes = std::fs::read(path).map_err(|e| StrataError::io_from(e, path))?;
        Self::parse(&bytes, &path.display().to_string())
    }

    pub fn header(&self) -> &ChunkHeader {
        &self.header
    }

    pub fn sample_count(&self) -> u32 {
        self.header.sample_count
    }

    /// Raw blob of sample `j`.
    pub fn sample_bytes(&self, j: u32) -> Result<&[u8], StrataError> {
        if j >= self.header.sample_count {
            return Err(StrataError::format_in_chunk(
                format!(
                    "sample index {j} out of range (chunk holds {})",
                    self.header.sample_count
                ),
                &self.path,
                self.header.chunk_id,
            ));
        }
        let start = self.offsets[j as usize] as usize;
        let end = self.offsets[j as usize + 1] as usize;
        Ok(&self.payload[start..end])
    }

    pub fn decode_sample(
        &self,
        j: u32,
        schema: &Schema,
        registry: &Registry,
    ) -> Result<Sample, StrataError> {
        let blob = self.sample_bytes(j)?;
        schema.decode_sample(registry, blob)
    }

    /// The whole uncompressed payload; used by the flat-token item loader.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

/// How closed chunk files are named.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkNaming {
    /// `chunk-<zeropad id>.bin`: single-writer datasets, ids are global.
    Global,
    /// `chunk-<rank>-<worker>-<zeropad id>.bin`: multi-worker production;
    /// ids are writer-local until the index merge assigns global ones.
    WorkerScoped { rank: u32, worker: u32 },
}

impl ChunkNaming {
    pub fn filename(&self, chunk_id: u64) -> String {
        match self {
            ChunkNaming::Global => strata_core::types::chunk_filename(chunk_id),
            ChunkNaming::WorkerScoped { rank, worker } => {
                format!("chunk-{rank}-{worker}-{chunk_id:010}.bin")
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChunkWriterConfig {
    pub out_dir: PathBuf,
    pub budget: ChunkBudget,
    pub compression: Compression,
    pub naming: ChunkNaming,
}

/// A chunk that has been closed and atomically published to `out_dir`.
#[derive(Debug, Clone)]
pub struct ClosedChunk {
    pub path: PathBuf,
    pub descriptor: ChunkDescriptor,
}

/// Streams samples into size-bounded chunk files.
///
/// Files are never observed half-written: each close writes to a temp path,
/// fsyncs, and renames into place. Ids are assigned monotonically per writer.
pub struct ChunkWriter {
    cfg: ChunkWriterConfig,
    schema: Schema,
    registry: Registry,
    next_chunk_id: u64,
    samples_emitted: u64,
    offsets: Vec<u32>,
    payload: Vec<u8>,
}

impl ChunkWriter {
    pub fn new(
        cfg: ChunkWriterConfig,
        schema: Schema,
        registry: Registry,
    ) -> Result<Self, StrataError> {
        cfg.budget.validate()?;
        std::fs::create_dir_all(&cfg.out_dir)
            .map_err(|e| StrataError::io_from(e, &cfg.out_dir))?;
        Ok(Self {
            cfg,
            schema,
            registry,
            next_chunk_id: 0,
            samples_emitted: 0,
            offsets: vec![0],
            payload: Vec::new(),
        })
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    fn buffered_samples(&self) -> u32 {
        (self.offsets.len() - 1) as u32
    }

    fn would_exceed_budget(&self, blob_len: usize) -> bool {
        if self.buffered_samples() == 0 {
            // An oversized single sample still gets its own chunk.
            return false;
        }
        match self.cfg.budget {
            ChunkBudget::Bytes(max) => (self.payload.len() + blob_len) as u64 > max,
            ChunkBudget::Samples(max) => self.buffered_samples() + 1 > max,
        }
    }

    /// Appends one sample; returns the closed chunk when this push forced the
    /// previous buffer to publication.
    pub fn push(&mut self, sample: &Sample) -> Result<Option<ClosedChunk>, StrataError> {
        let blob = self.schema.encode_sample(&self.registry, sample)?;
        let closed = if self.would_exceed_budget(blob.len()) {
            Some(self.close_current()?)
        } else {
            None
        };

        self.payload.extend_from_slice(&blob);
        let end = u32::try_from(self.payload.len())
            .map_err(|_| StrataError::config("chunk payload exceeds u32 offset space"))?;
        self.offsets.push(end);
        Ok(closed)
    }

    /// Publishes the trailing partial chunk, if any.
    pub fn finish(&mut self) -> Result<Option<ClosedChunk>, StrataError> {
        if self.buffered_samples() == 0 {
            return Ok(None);
        }
        Ok(Some(self.close_current()?))
    }

    fn close_current(&mut self) -> Result<ClosedChunk, StrataError> {
        let sample_count = self.buffered_samples();
        let chunk_id = self.next_chunk_id;

        let stored: Vec<u8> = match self.cfg.compression {
            Compression::None => std::mem::take(&mut self.payload),
            Compression::Zstd => {
                let out = zstd::encode_all(&self.payload[..], ZSTD_LEVEL).map_err(|e| {
                    StrataError::io(format!("zstd compress failed: {e}"), "<chunk buffer>")
                })?;
                self.payload.clear();
                out
            }
            Compression::Lz4 => {
                let out = lz4_flex::compress_prepend_size(&self.payload);
                self.payload.clear();
                out
            }
        };

        let header = ChunkHeader {
            version: CHUNK_FORMAT_VERSION,
            chunk_id,
            sample_count,
            payload_len: stored.len() as u64,
            compression: self.cfg.compression,
            flags: 0,
        };

        let mut bytes =
            Vec::with_capacity(HEADER_LEN + header.offset_table_len() + stored.len());
        header.write_to(&mut bytes);
        for off in &self.offsets {
            bytes.extend_from_slice(&off.to_le_bytes());
        }
        bytes.extend_from_slice(&stored);

        let filename = self.cfg.naming.filename(chunk_id);
        let path = self.cfg.out_dir.join(&filename);
        write_atomic(&path, &bytes)?;

        let first = self.samples_emitted;
        let last = first + u64::from(sample_count) - 1;
        self.samples_emitted = last + 1;
        self.next_chunk_id += 1;
        self.offsets.clear();
        self.offsets.push(0);

        tracing::info!(
            target: "strata_flow",
            event = "chunk_closed",
            chunk_id = chunk_id,
            samples = sample_count,
            file_bytes = bytes.len() as u64,
            filename = %filename,
            "closed chunk"
        );

        Ok(ClosedChunk {
            path,
            descriptor: ChunkDescriptor {
                id: chunk_id,
                filename,
                bytes: bytes.len() as u64,
                samples: sample_count,
                first,
                last,
            },
        })
    }
}

/// Temp write + fsync + rename. A failed write discards the temp file; the
/// destination is either absent or complete.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StrataError> {
    let parent = path
        .parent()
        .ok_or_else(|| StrataError::io("path must have a parent", path.display().to_string()))?;
    std::fs::create_dir_all(parent).map_err(|e| StrataError::io_from(e, parent))?;

    let file_name = path
        .file_name()
        .and_then(|s| s.to_str())
        .ok_or_else(|| StrataError::io("bad filename", path.display().to_string()))?;
    let tmp = path.with_file_name(format!(
        "{file_name}.tmp.{}.{}",
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
        std::fs::rename(&tmp, path)
    })();

    if let Err(err) = result {
        let _ = std::fs::remove_file(&tmp);
        return Err(StrataError::io_from(err, path));
    }
    Ok(())
}
