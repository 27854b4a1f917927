use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::Instrument;

use strata_core::config::parse_byte_size;
use strata_core::error::StrataError;
use strata_core::sample::Sample;
use strata_core::types::WorldSlot;
use strata_format::chunk::{ChunkHeader, ChunkPrefix, HEADER_LEN};
use strata_format::index::{DatasetIndex, INDEX_FILE_NAME};
use strata_format::serialize::{Registry, Schema};
use strata_format::sha256_hex;
use strata_observe::trace::TraceProfiler;
use strata_store::retry::{with_retries, RetryPolicy};
use strata_store::{open_from_root, ObjectStore};

use crate::assigner::{assignment_for, AssignOptions, DEFAULT_SEED};
use crate::cache::{CacheConfig, ChunkCache};
use crate::pipeline::{
    ChunkFetcher, Item, ItemLoader, PrefetchPipeline, DEFAULT_PREFETCH_CHUNKS,
};
use crate::ReaderMetrics;

/// Reader-side configuration surface.
#[derive(Debug, Clone)]
pub struct ReaderConfig {
    pub input_dir: String,
    pub shuffle: bool,
    pub seed: u64,
    pub drop_last: bool,
    /// Byte count with optional `KB`/`MB`/`GB` suffix.
    pub max_cache_size: String,
    /// Defaults to a per-dataset directory under the system temp dir.
    pub cache_dir: Option<PathBuf>,
    pub item_loader: ItemLoader,
    /// When nonzero, a Chrome Trace Event JSON covering the first this-many
    /// items is written to `result.json`.
    pub profile_batches: u32,
    pub max_prefetch_chunks: usize,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            input_dir: String::new(),
            shuffle: false,
            seed: DEFAULT_SEED,
            drop_last: false,
            max_cache_size: "100GB".to_string(),
            cache_dir: None,
            item_loader: ItemLoader::Default,
            profile_batches: 0,
            max_prefetch_chunks: DEFAULT_PREFETCH_CHUNKS,
        }
    }
}

impl ReaderConfig {
    pub fn validate(&self) -> Result<(), StrataError> {
        if self.input_dir.trim().is_empty() {
            return Err(StrataError::config("input_dir must be set"));
        }
        parse_byte_size(&self.max_cache_size)?;
        if self.max_prefetch_chunks == 0 {
            return Err(StrataError::config("max_prefetch_chunks must be > 0"));
        }
        Ok(())
    }
}

/// Resumable position of one `(rank, worker)` stream. The assignment itself
/// is re-derived from `(epoch, seed, world)`, so the cursor is all the state
/// a resume needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeState {
    pub state_version: u32,
    pub epoch: u32,
    pub cursor: u64,
}

pub const RESUME_STATE_VERSION: u32 = 1;

impl ResumeState {
    pub fn to_json_bytes(&self) -> Result<Vec<u8>, StrataError> {
        serde_json::to_vec_pretty(self)
            .map_err(|e| StrataError::config(format!("state encode failed: {e}")))
    }

    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, StrataError> {
        let state: Self = serde_json::from_slice(bytes)
            .map_err(|e| StrataError::config(format!("state parse failed: {e}")))?;
        if state.state_version != RESUME_STATE_VERSION {
            return Err(StrataError::config(format!(
                "unsupported resume state version {}",
                state.state_version
            )));
        }
        Ok(state)
    }
}

/// One stream's view of a chunked dataset in an object store.
pub struct StreamingDataset {
    cfg: ReaderConfig,
    slot: WorldSlot,
    index: Arc<DatasetIndex>,
    schema: Schema,
    registry: Registry,
    fetcher: Arc<ChunkFetcher>,
    profiler: Option<Arc<TraceProfiler>>,
    profile_written: bool,
    epoch: u32,
    cursor: u64,
    pipeline: Option<PrefetchPipeline>,
    /// Carries `rank`/`worker`/`epoch` on every event this stream emits.
    span: tracing::Span,
}

impl StreamingDataset {
    /// Opens the dataset at `cfg.input_dir`, resolving the store backend from
    /// the URL form.
    pub fn open(cfg: ReaderConfig, slot: WorldSlot) -> Result<Self, StrataError> {
        cfg.validate()?;
        let store: Arc<dyn ObjectStore> = Arc::from(open_from_root(&cfg.input_dir)?);
        Self::open_with_store(cfg, slot, store, Registry::builtin())
    }

    /// Opens against an injected store and codec registry; the test path and
    /// the extension point for custom codecs.
    pub fn open_with_store(
        cfg: ReaderConfig,
        slot: WorldSlot,
        store: Arc<dyn ObjectStore>,
        registry: Registry,
    ) -> Result<Self, StrataError> {
        cfg.validate()?;
        slot.validate()
            .map_err(|e| StrataError::assignment(e.to_string()))?;

        let retry = RetryPolicy::default();
        let index_bytes = with_retries(&retry, "get_index", || store.get(INDEX_FILE_NAME))
            .map_err(StrataError::from)?;
        let index = Arc::new(DatasetIndex::from_json_bytes(&index_bytes)?);
        let schema = Schema::new(index.schema.clone(), &registry)?;

        let cache = if store.prefers_cache() {
            let max_bytes = parse_byte_size(&cfg.max_cache_size)?;
            let dir = match &cfg.cache_dir {
                Some(dir) => dir.clone(),
                None => {
                    let mut dir = std::env::temp_dir();
                    dir.push("strata-cache");
                    dir.push(&sha256_hex(cfg.input_dir.trim().as_bytes())[..16]);
                    dir
                }
            };
            Some(Arc::new(ChunkCache::new(CacheConfig::new(dir, max_bytes))?))
        } else {
            None
        };

        let profiler = (cfg.profile_batches > 0).then(|| Arc::new(TraceProfiler::new()));

        let metrics = Arc::new(ReaderMetrics::default());
        let fetcher = Arc::new(ChunkFetcher {
            store,
            cache,
            retry,
            metrics,
            profiler: profiler.clone(),
            tid: slot.stream_index(),
        });

        let span = strata_observe::logging::stream_span(slot.rank, slot.worker, 0);
        span.in_scope(|| {
            tracing::info!(
                target: "strata_flow",
                event = "dataset_opened",
                input_dir = %cfg.input_dir,
                total_samples = index.total_samples,
                chunks = index.chunks.len(),
                "opened streaming dataset"
            );
        });

        Ok(Self {
            cfg,
            slot,
            index,
            schema,
            registry,
            fetcher,
            profiler,
            profile_written: false,
            epoch: 0,
            cursor: 0,
            pipeline: None,
            span,
        })
    }

    pub fn total_samples(&self) -> u64 {
        self.index.total_samples
    }

    pub fn index(&self) -> &DatasetIndex {
        &self.index
    }

    pub fn metrics(&self) -> Arc<ReaderMetrics> {
        Arc::clone(&self.fetcher.metrics)
    }

    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    fn assign_options(&self) -> AssignOptions {
        AssignOptions {
            shuffle: self.cfg.shuffle,
            drop_last: self.cfg.drop_last,
            seed: self.cfg.seed,
        }
    }

    fn build_pipeline(&mut self) -> Result<(), StrataError> {
        let assignment = assignment_for(&self.index, &self.slot, self.epoch, self.assign_options())?;
        let pipeline = PrefetchPipeline::new(
            Arc::clone(&self.index),
            self.schema.clone(),
            self.registry.clone(),
            Arc::clone(&self.fetcher),
            self.cfg.item_loader,
            &assignment,
            self.cursor,
            self.cfg.max_prefetch_chunks,
            self.profiler.clone(),
            self.slot.stream_index(),
        )?;
        self.pipeline = Some(pipeline);
        Ok(())
    }

    /// The next item of this epoch in assignment order; `None` when the
    /// epoch's assignment is exhausted. Call `set_epoch` to start the next.
    pub async fn next_item(&mut self) -> Result<Option<Item>, StrataError> {
        if self.pipeline.is_none() {
            self.build_pipeline()?;
        }
        let span = self.span.clone();
        let pipeline = self
            .pipeline
            .as_mut()
            .ok_or_else(|| StrataError::config("pipeline not initialized"))?;

        let item = pipeline.next_item().instrument(span).await?;
        if item.is_some() {
            self.cursor += 1;
            self.maybe_write_profile()?;
        }
        Ok(item)
    }

    fn maybe_write_profile(&mut self) -> Result<(), StrataError> {
        let Some(profiler) = &self.profiler else {
            return Ok(());
        };
        if self.profile_written || self.cursor < u64::from(self.cfg.profile_batches) {
            return Ok(());
        }
        let path = Path::new("result.json");
        profiler
            .write_to(path)
            .map_err(|e| StrataError::io_from(e, path))?;
        self.profile_written = true;
        tracing::info!(
            target: "strata_flow",
            event = "profile_written",
            items = self.cursor,
            "wrote chrome trace profile to result.json"
        );
        Ok(())
    }

    /// Fetches one sample by global id through byte-range reads: header,
    /// offset table, then just that sample's bytes. Bypasses the assignment
    /// and the chunk cache; requires uncompressed chunks.
    pub fn load_sample(&self, sample_id: u64) -> Result<Sample, StrataError> {
        let (chunk_index, position) = self.index.locate(sample_id)?;
        let descriptor = &self.index.chunks[chunk_index];
        let store = &self.fetcher.store;
        let retry = self.fetcher.retry;

        let header_bytes = with_retries(&retry, "get_chunk_header", || {
            store.get_range(&descriptor.filename, 0, HEADER_LEN as u64)
        })
        .map_err(StrataError::from)?;
        let header = ChunkHeader::parse(&header_bytes, &descriptor.filename)?;

        let prefix_len = HEADER_LEN + header.offset_table_len();
        let prefix_bytes = with_retries(&retry, "get_chunk_prefix", || {
            store.get_range(&descriptor.filename, 0, prefix_len as u64)
        })
        .map_err(StrataError::from)?;
        let prefix = ChunkPrefix::parse(&prefix_bytes, &descriptor.filename)?;

        let (start, len) = prefix.sample_span(position, &descriptor.filename)?;
        let blob = with_retries(&retry, "get_sample_range", || {
            store.get_range(&descriptor.filename, start, u64::from(len))
        })
        .map_err(StrataError::from)?;
        self.schema.decode_sample(&self.registry, &blob)
    }

    /// Moves to `epoch`, resetting the cursor and dropping any in-flight
    /// prefetches.
    pub fn set_epoch(&mut self, epoch: u32) {
        self.epoch = epoch;
        self.cursor = 0;
        self.pipeline = None;
        self.span = strata_observe::logging::stream_span(self.slot.rank, self.slot.worker, epoch);
    }

    pub fn state_dict(&self) -> ResumeState {
        ResumeState {
            state_version: RESUME_STATE_VERSION,
            epoch: self.epoch,
            cursor: self.cursor,
        }
    }

    /// Restores a saved position; the next `next_item` call fast-forwards the
    /// re-derived assignment to the cursor.
    pub fn load_state_dict(&mut self, state: ResumeState) -> Result<(), StrataError> {
        if state.state_version != RESUME_STATE_VERSION {
            return Err(StrataError::config(format!(
                "unsupported resume state version {}",
                state.state_version
            )));
        }
        self.epoch = state.epoch;
        self.cursor = state.cursor;
        self.pipeline = None;
        self.span =
            strata_observe::logging::stream_span(self.slot.rank, self.slot.worker, state.epoch);
        Ok(())
    }
}
