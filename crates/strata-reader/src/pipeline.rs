use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use tokio::task::JoinHandle;

use strata_core::error::StrataError;
use strata_core::sample::{Sample, Value};
use strata_core::types::ChunkDescriptor;
use strata_format::chunk::ChunkReader;
use strata_format::index::DatasetIndex;
use strata_format::serialize::{Registry, Schema};
use strata_observe::trace::TraceProfiler;
use strata_store::retry::{with_retries, RetryPolicy};
use strata_store::ObjectStore;

use crate::assigner::SampleRef;
use crate::cache::ChunkCache;
use crate::SharedReaderMetrics;

/// Default bounded in-flight window of chunk downloads per stream.
pub const DEFAULT_PREFETCH_CHUNKS: usize = 3;

/// How chunk contents become consumer items.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemLoader {
    /// Discrete samples, decoded by the dataset schema.
    Default,
    /// The chunk is a flat token buffer sliced into fixed-size blocks.
    Tokens { block_size: u32 },
}

impl ItemLoader {
    /// Parses the reader option value: `default` or `tokens(<block_size>)`.
    pub fn parse(raw: &str) -> Result<Self, StrataError> {
        let s = raw.trim();
        if s.is_empty() || s == "default" {
            return Ok(ItemLoader::Default);
        }
        if let Some(inner) = s.strip_prefix("tokens(").and_then(|r| r.strip_suffix(')')) {
            let block_size: u32 = inner
                .trim()
                .parse()
                .map_err(|_| StrataError::config(format!("invalid item_loader {raw:?}")))?;
            if block_size == 0 {
                return Err(StrataError::config("tokens block_size must be > 0"));
            }
            return Ok(ItemLoader::Tokens { block_size });
        }
        Err(StrataError::config(format!(
            "unknown item_loader {raw:?} (expected default or tokens(<block_size>))"
        )))
    }
}

/// One delivered item.
#[derive(Debug, Clone, PartialEq)]
pub enum Item {
    Sample { sample_id: u64, sample: Sample },
    TokenBlock { block: Value },
}

impl Item {
    pub fn sample_id(&self) -> Option<u64> {
        match self {
            Item::Sample { sample_id, .. } => Some(*sample_id),
            Item::TokenBlock { .. } => None,
        }
    }
}

/// Downloads chunks into the cache (or straight to memory for mounts) with
/// retries, and parses them.
pub struct ChunkFetcher {
    pub store: Arc<dyn ObjectStore>,
    pub cache: Option<Arc<ChunkCache>>,
    pub retry: RetryPolicy,
    pub metrics: SharedReaderMetrics,
    pub profiler: Option<Arc<TraceProfiler>>,
    pub tid: u32,
}

pub struct FetchedChunk {
    pub reader: ChunkReader,
    /// Cache filename to release via `done_with` once consumed.
    pub pinned_as: Option<String>,
}

impl ChunkFetcher {
    /// Blocking; run under `spawn_blocking`.
    pub fn fetch_blocking(&self, descriptor: &ChunkDescriptor) -> Result<FetchedChunk, StrataError> {
        let _span = self.profiler.as_deref().map(|p| p.span("download", self.tid));
        let started = Instant::now();
        let filename = descriptor.filename.clone();

        match &self.cache {
            Some(cache) => {
                let store = Arc::clone(&self.store);
                let retry = self.retry;
                let key = filename.clone();
                let (path, was_hit) = cache.ensure_pinned(&filename, move || {
                    let bytes = with_retries(&retry, "get_chunk", || store.get(&key))?;
                    Ok(bytes)
                })?;
                self.metrics.stream.cache_lookup(was_hit);
                if !was_hit {
                    self.metrics.stream.chunk_downloaded();
                    self.metrics
                        .downloads
                        .record(descriptor.bytes, started.elapsed());
                }
                let reader = ChunkReader::open(&path).inspect_err(|_| {
                    let _ = cache.done_with(&filename);
                })?;
                Ok(FetchedChunk {
                    reader,
                    pinned_as: Some(filename),
                })
            }
            None => {
                let bytes =
                    with_retries(&self.retry, "get_chunk", || self.store.get(&filename))?;
                self.metrics.stream.chunk_downloaded();
                self.metrics
                    .downloads
                    .record(bytes.len() as u64, started.elapsed());
                let reader = ChunkReader::parse(&bytes, &filename)?;
                Ok(FetchedChunk {
                    reader,
                    pinned_as: None,
                })
            }
        }
    }
}

/// A run of consecutive assignment entries that share one chunk.
#[derive(Debug, Clone)]
struct ChunkGroup {
    chunk_index: u32,
    positions: Vec<u32>,
}

fn group_assignment(entries: &[SampleRef]) -> Vec<ChunkGroup> {
    let mut groups: Vec<ChunkGroup> = Vec::new();
    for entry in entries {
        match groups.last_mut() {
            Some(group) if group.chunk_index == entry.chunk_index => {
                group.positions.push(entry.position);
            }
            _ => groups.push(ChunkGroup {
                chunk_index: entry.chunk_index,
                positions: vec![entry.position],
            }),
        }
    }
    groups
}

enum CurrentItems {
    Samples { positions: Vec<u32>, cursor: usize },
    Blocks { blocks: Vec<Value>, cursor: usize },
}

struct CurrentChunk {
    chunk_index: u32,
    fetched: FetchedChunk,
    items: CurrentItems,
}

/// Turns one stream's assignment into an ordered item stream.
///
/// Downloads run ahead of the consumer inside a bounded window and may
/// complete out of order; delivery never does. Crossing a chunk boundary
/// releases the previous chunk's cache pin.
pub struct PrefetchPipeline {
    index: Arc<DatasetIndex>,
    schema: Schema,
    registry: Registry,
    fetcher: Arc<ChunkFetcher>,
    loader: ItemLoader,
    groups: Vec<ChunkGroup>,
    next_to_spawn: usize,
    /// Group index the head of `inflight` belongs to.
    next_to_deliver: usize,
    inflight: VecDeque<JoinHandle<Result<FetchedChunk, StrataError>>>,
    current: Option<CurrentChunk>,
    window: usize,
    /// Items still to discard before delivery starts (resume fast-forward).
    skip_remaining: u64,
    profiler: Option<Arc<TraceProfiler>>,
    tid: u32,
}

impl PrefetchPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        index: Arc<DatasetIndex>,
        schema: Schema,
        registry: Registry,
        fetcher: Arc<ChunkFetcher>,
        loader: ItemLoader,
        assignment: &[SampleRef],
        start_cursor: u64,
        window: usize,
        profiler: Option<Arc<TraceProfiler>>,
        tid: u32,
    ) -> Result<Self, StrataError> {
        if window == 0 {
            return Err(StrataError::config("max_prefetch_chunks must be > 0"));
        }
        if let ItemLoader::Tokens { .. } = loader {
            token_field_width(&schema)?;
        }

        let mut groups = group_assignment(assignment);
        let mut next_to_spawn = 0;
        let mut skip_remaining = start_cursor;

        // Discrete samples have known per-group lengths, so whole groups can
        // be skipped without downloading them. Token block counts are only
        // known after decode; those groups are skipped by consuming.
        if matches!(loader, ItemLoader::Default) {
            while next_to_spawn < groups.len() {
                let len = groups[next_to_spawn].positions.len() as u64;
                if skip_remaining < len {
                    break;
                }
                skip_remaining -= len;
                next_to_spawn += 1;
            }
            if next_to_spawn > 0 {
                groups.drain(..next_to_spawn);
                next_to_spawn = 0;
            }
        }

        Ok(Self {
            index,
            schema,
            registry,
            fetcher,
            loader,
            groups,
            next_to_spawn,
            next_to_deliver: 0,
            inflight: VecDeque::new(),
            current: None,
            window,
            skip_remaining,
            profiler,
            tid,
        })
    }

    fn top_up(&mut self) {
        while self.inflight.len() < self.window && self.next_to_spawn < self.groups.len() {
            let group = &self.groups[self.next_to_spawn];
            let descriptor = self.index.chunks[group.chunk_index as usize].clone();
            let fetcher = Arc::clone(&self.fetcher);
            fetcher.metrics.inflight.enter();
            let handle = tokio::task::spawn_blocking(move || {
                let result = fetcher.fetch_blocking(&descriptor);
                fetcher.metrics.inflight.exit();
                result
            });
            self.inflight.push_back(handle);
            self.next_to_spawn += 1;
        }
    }

    fn release_current(&mut self) {
        if let Some(current) = self.current.take() {
            if let Some(filename) = current.fetched.pinned_as {
                if let Some(cache) = &self.fetcher.cache {
                    let _ = cache.done_with(&filename);
                }
            }
        }
    }

    async fn advance_chunk(&mut self) -> Result<bool, StrataError> {
        self.release_current();
        self.top_up();

        let Some(handle) = self.inflight.pop_front() else {
            return Ok(false);
        };
        let group = self.groups[self.next_to_deliver].clone();
        self.next_to_deliver += 1;

        let fetched = handle
            .await
            .map_err(|e| StrataError::io(format!("prefetch task failed: {e}"), "<pipeline>"))??;
        self.top_up();

        let descriptor = &self.index.chunks[group.chunk_index as usize];
        if fetched.reader.sample_count() != descriptor.samples {
            return Err(StrataError::format_in_chunk(
                format!(
                    "chunk holds {} samples but the index records {}",
                    fetched.reader.sample_count(),
                    descriptor.samples
                ),
                &descriptor.filename,
                descriptor.id,
            ));
        }

        let items = match self.loader {
            ItemLoader::Default => CurrentItems::Samples {
                positions: group.positions,
                cursor: 0,
            },
            ItemLoader::Tokens { block_size } => {
                let blocks = token_blocks(
                    &fetched.reader,
                    &self.schema,
                    &self.registry,
                    block_size,
                )?;
                CurrentItems::Blocks { blocks, cursor: 0 }
            }
        };
        self.current = Some(CurrentChunk {
            chunk_index: group.chunk_index,
            fetched,
            items,
        });
        Ok(true)
    }

    /// The next item in strict assignment order, or `None` at end of epoch.
    pub async fn next_item(&mut self) -> Result<Option<Item>, StrataError> {
        loop {
            let produced = match &mut self.current {
                Some(current) => Self::take_from_current(
                    current,
                    &self.index,
                    &self.schema,
                    &self.registry,
                    &self.fetcher.metrics,
                    self.profiler.as_deref(),
                    self.tid,
                )?,
                None => None,
            };

            match produced {
                Some(item) => {
                    if self.skip_remaining > 0 {
                        self.skip_remaining -= 1;
                        continue;
                    }
                    self.fetcher.metrics.stream.sample_delivered();
                    return Ok(Some(item));
                }
                None => {
                    if !self.advance_chunk().await? {
                        return Ok(None);
                    }
                }
            }
        }
    }

    fn take_from_current(
        current: &mut CurrentChunk,
        index: &DatasetIndex,
        schema: &Schema,
        registry: &Registry,
        metrics: &SharedReaderMetrics,
        profiler: Option<&TraceProfiler>,
        tid: u32,
    ) -> Result<Option<Item>, StrataError> {
        match &mut current.items {
            CurrentItems::Samples { positions, cursor } => {
                let Some(position) = positions.get(*cursor).copied() else {
                    return Ok(None);
                };
                *cursor += 1;

                let _span = profiler.map(|p| p.span("decode", tid));
                let started = Instant::now();
                let blob = current.fetched.reader.sample_bytes(position)?;
                let sample = schema.decode_sample(registry, blob)?;
                metrics.decodes.record(blob.len() as u64, started.elapsed());

                let first = index.chunks[current.chunk_index as usize].first;
                Ok(Some(Item::Sample {
                    sample_id: first + u64::from(position),
                    sample,
                }))
            }
            CurrentItems::Blocks { blocks, cursor } => {
                let Some(block) = blocks.get(*cursor).cloned() else {
                    return Ok(None);
                };
                *cursor += 1;
                Ok(Some(Item::TokenBlock { block }))
            }
        }
    }

    /// Aborts outstanding downloads. Partial cache writes are temp files the
    /// admission path discards on its own.
    pub fn cancel(&mut self) {
        for handle in self.inflight.drain(..) {
            handle.abort();
        }
        self.release_current();
        self.next_to_spawn = self.groups.len();
    }
}

impl Drop for PrefetchPipeline {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Token element width in bytes for the single tokens field of the schema.
fn token_field_width(schema: &Schema) -> Result<usize, StrataError> {
    let fields = schema.fields();
    if fields.len() != 1 {
        return Err(StrataError::config(format!(
            "tokens item_loader requires a single-field schema, got {} fields",
            fields.len()
        )));
    }
    match fields[0].codec.as_str() {
        "tokens:u16" => Ok(2),
        "tokens:u32" => Ok(4),
        other => Err(StrataError::config(format!(
            "tokens item_loader requires a tokens field, got codec {other:?}"
        ))),
    }
}

/// Flattens every sample's token payload in the chunk into one buffer and
/// slices it into `block_size`-token blocks; a trailing partial block is
/// dropped.
fn token_blocks(
    reader: &ChunkReader,
    schema: &Schema,
    registry: &Registry,
    block_size: u32,
) -> Result<Vec<Value>, StrataError> {
    let width = token_field_width(schema)?;

    let mut flat: Vec<u8> = Vec::new();
    for j in 0..reader.sample_count() {
        let sample = reader.decode_sample(j, schema, registry)?;
        for value in sample.values() {
            match value {
                Value::TokensU16(tokens) => {
                    for t in tokens {
                        flat.extend_from_slice(&t.to_le_bytes());
                    }
                }
                Value::TokensU32(tokens) => {
                    for t in tokens {
                        flat.extend_from_slice(&t.to_le_bytes());
                    }
                }
                other => {
                    return Err(StrataError::config(format!(
                        "tokens item_loader found a {} field",
                        other.type_name()
                    )))
                }
            }
        }
    }

    let block_bytes = block_size as usize * width;
    let mut blocks = Vec::with_capacity(flat.len() / block_bytes.max(1));
    for window in flat.chunks_exact(block_bytes) {
        let block = match width {
            2 => Value::TokensU16(
                window
                    .chunks_exact(2)
                    .map(|c| u16::from_le_bytes([c[0], c[1]]))
                    .collect(),
            ),
            _ => Value::TokensU32(
                window
                    .chunks_exact(4)
                    .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
            ),
        };
        blocks.push(block);
    }
    Ok(blocks)
}
