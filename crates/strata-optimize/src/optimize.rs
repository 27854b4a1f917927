use std::sync::Arc;
use std::time::{Duration, Instant};

use strata_core::config::ChunkBudget;
use strata_core::error::StrataError;
use strata_core::sample::Sample;
use strata_core::types::Compression;
use strata_format::chunk::{ChunkNaming, ChunkWriter, ChunkWriterConfig, ClosedChunk};
use strata_format::index::{merge_partials, DatasetIndex, PartialIndex, INDEX_FILE_NAME};
use strata_format::serialize::{Registry, Schema};
use strata_store::retry::{with_retries, RetryPolicy};
use strata_store::{open_from_root, ObjectStore};

use crate::{config_hash, partition_positions, FnOutput, OptimizeConfig, OptimizeError, Plan};

const MERGE_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Result of one node's `optimize` participation. The merged index is only
/// present on the leader and on nodes that observed it before the timeout.
#[derive(Debug)]
pub struct OptimizeReport {
    pub config_hash: String,
    pub total_samples: u64,
    pub total_chunks: u64,
    pub index: DatasetIndex,
}

/// Runs this node's share of the optimize job against the configured store
/// root, then coordinates the index merge through the store.
pub fn optimize<I, F>(
    cfg: &OptimizeConfig,
    inputs: &[I],
    user_fn: F,
) -> Result<OptimizeReport, OptimizeError>
where
    I: Sync,
    F: Fn(&I) -> Result<FnOutput, String> + Sync,
{
    let store: Arc<dyn ObjectStore> = Arc::from(open_from_root(&cfg.output_root)?);
    optimize_with_store(cfg, inputs, user_fn, store)
}

pub fn optimize_with_store<I, F>(
    cfg: &OptimizeConfig,
    inputs: &[I],
    user_fn: F,
    store: Arc<dyn ObjectStore>,
) -> Result<OptimizeReport, OptimizeError>
where
    I: Sync,
    F: Fn(&I) -> Result<FnOutput, String> + Sync,
{
    let budget = cfg.validate()?;
    if inputs.is_empty() {
        return Err(OptimizeError::EmptyInputs);
    }

    let plan = cfg.plan;
    let total_workers = plan.total_workers();
    let hash = config_hash(cfg, inputs.len() as u64)?;
    let shards = partition_positions(inputs.len() as u64, total_workers);
    let scratch_root = cfg.scratch_root();

    tracing::info!(
        target: "strata_flow",
        event = "optimize_start",
        output_root = %cfg.output_root,
        node_rank = cfg.node_rank,
        num_nodes = plan.num_nodes,
        workers_per_node = plan.workers_per_node,
        inputs = inputs.len() as u64,
        config_hash = %hash,
        machine = cfg.machine.as_deref().unwrap_or(""),
        "starting optimize job"
    );

    let retry = RetryPolicy::default();
    let worker_results: Vec<Result<PartialIndex, OptimizeError>> = std::thread::scope(|s| {
        let mut handles = Vec::new();
        for worker in 0..plan.workers_per_node {
            let shard_index = cfg.node_rank * plan.workers_per_node + worker;
            let positions = &shards[shard_index as usize];
            let store = Arc::clone(&store);
            let scratch_root = scratch_root.clone();
            let user_fn = &user_fn;
            let cfg_ref = cfg;
            handles.push(s.spawn(move || {
                run_worker(WorkerContext {
                    store,
                    retry,
                    node_rank: cfg_ref.node_rank,
                    worker,
                    single_writer: total_workers == 1,
                    budget,
                    compression: cfg_ref.compression,
                    item_retries: cfg_ref.item_retries,
                    scratch_root,
                    inputs,
                    positions,
                    user_fn,
                })
            }));
        }
        handles
            .into_iter()
            .map(|h| {
                h.join().unwrap_or_else(|_| {
                    Err(OptimizeError::Core(StrataError::io(
                        "worker thread panicked",
                        "<worker>",
                    )))
                })
            })
            .collect()
    });

    let mut node_samples = 0u64;
    let mut node_chunks = 0u64;
    for result in worker_results {
        let partial = result?;
        node_samples += partial
            .chunks
            .iter()
            .map(|c| u64::from(c.samples))
            .sum::<u64>();
        node_chunks += partial.chunks.len() as u64;
    }

    let _ = std::fs::remove_dir_all(&scratch_root);

    let index = if cfg.node_rank == 0 {
        leader_merge(store.as_ref(), &retry, plan, hash.clone(), cfg.merge_timeout)?
    } else {
        wait_for_index(store.as_ref(), cfg.merge_timeout)?
    };

    tracing::info!(
        target: "strata_flow",
        event = "optimize_complete",
        node_rank = cfg.node_rank,
        node_samples = node_samples,
        node_chunks = node_chunks,
        total_samples = index.total_samples,
        total_chunks = index.chunks.len() as u64,
        "optimize job complete"
    );

    Ok(OptimizeReport {
        config_hash: hash,
        total_samples: index.total_samples,
        total_chunks: index.chunks.len() as u64,
        index,
    })
}

struct WorkerContext<'a, I, F> {
    store: Arc<dyn ObjectStore>,
    retry: RetryPolicy,
    node_rank: u32,
    worker: u32,
    single_writer: bool,
    budget: ChunkBudget,
    compression: Compression,
    item_retries: u32,
    scratch_root: std::path::PathBuf,
    inputs: &'a [I],
    positions: &'a [u64],
    user_fn: &'a F,
}

fn run_worker<I, F>(ctx: WorkerContext<'_, I, F>) -> Result<PartialIndex, OptimizeError>
where
    F: Fn(&I) -> Result<FnOutput, String>,
{
    let _span = strata_observe::logging::producer_span(ctx.node_rank, ctx.worker).entered();
    let registry = Registry::builtin();
    let scratch = ctx
        .scratch_root
        .join(format!("worker-{}-{}", ctx.node_rank, ctx.worker));

    let naming = if ctx.single_writer {
        ChunkNaming::Global
    } else {
        ChunkNaming::WorkerScoped {
            rank: ctx.node_rank,
            worker: ctx.worker,
        }
    };

    let mut writer: Option<ChunkWriter> = None;
    let mut schema: Option<Schema> = None;
    let mut chunks = Vec::new();

    for &position in ctx.positions {
        let item = &ctx.inputs[position as usize];
        let output = invoke_with_retries(ctx.user_fn, item, position, ctx.item_retries)?;

        for sample in output {
            if writer.is_none() {
                let inferred = Schema::infer(&sample, &registry)?;
                writer = Some(ChunkWriter::new(
                    ChunkWriterConfig {
                        out_dir: scratch.clone(),
                        budget: ctx.budget,
                        compression: ctx.compression,
                        naming,
                    },
                    inferred.clone(),
                    registry.clone(),
                )?);
                schema = Some(inferred);
            }
            let writer = writer
                .as_mut()
                .ok_or_else(|| StrataError::config("writer not initialized"))?;
            if let Some(closed) = writer.push(&sample)? {
                chunks.push(upload_chunk(&ctx, closed)?);
            }
        }
    }

    if let Some(writer) = writer.as_mut() {
        if let Some(closed) = writer.finish()? {
            chunks.push(upload_chunk(&ctx, closed)?);
        }
    }

    let partial = PartialIndex {
        rank: ctx.node_rank,
        worker: ctx.worker,
        compression: ctx.compression.as_str().map(str::to_string),
        schema: schema.map(|s| s.fields().to_vec()).unwrap_or_default(),
        chunks,
    };
    let key = PartialIndex::object_key(ctx.node_rank, ctx.worker);
    let bytes = partial.to_json_bytes()?;
    with_retries(&ctx.retry, "put_partial_index", || {
        ctx.store.put(&key, &bytes)
    })?;

    tracing::info!(
        target: "strata_flow",
        event = "worker_done",
        items = ctx.positions.len() as u64,
        chunks = partial.chunks.len() as u64,
        "worker published partial index"
    );

    Ok(partial)
}

/// Upload-then-record: the descriptor only joins the partial index after the
/// object store accepted the chunk, and only then is the local file deleted.
fn upload_chunk<I, F>(
    ctx: &WorkerContext<'_, I, F>,
    closed: ClosedChunk,
) -> Result<strata_core::types::ChunkDescriptor, OptimizeError> {
    let bytes = std::fs::read(&closed.path)
        .map_err(|e| StrataError::io_from(e, &closed.path))?;
    with_retries(&ctx.retry, "put_chunk", || {
        ctx.store.put(&closed.descriptor.filename, &bytes)
    })?;
    let _ = std::fs::remove_file(&closed.path);

    tracing::debug!(
        target: "strata_flow",
        event = "chunk_uploaded",
        filename = %closed.descriptor.filename,
        bytes = closed.descriptor.bytes,
        samples = closed.descriptor.samples,
        "uploaded chunk"
    );
    Ok(closed.descriptor)
}

fn invoke_with_retries<I, F>(
    user_fn: &F,
    item: &I,
    position: u64,
    item_retries: u32,
) -> Result<FnOutput, OptimizeError>
where
    F: Fn(&I) -> Result<FnOutput, String>,
{
    let mut attempt = 0u32;
    loop {
        match user_fn(item) {
            Ok(output) => return Ok(output),
            Err(message) if attempt < item_retries => {
                attempt += 1;
                tracing::warn!(
                    target: "strata_flow",
                    event = "user_fn_retry",
                    item_index = position,
                    attempt = attempt,
                    error = %message,
                    "user fn failed, retrying item"
                );
            }
            Err(message) => {
                return Err(OptimizeError::Core(StrataError::UserFn {
                    message,
                    item_index: position,
                    retry_count: item_retries,
                }))
            }
        }
    }
}

/// Node 0 waits for every worker's partial index, merges them, publishes the
/// global `index.json`, and removes the partials.
fn leader_merge(
    store: &dyn ObjectStore,
    retry: &RetryPolicy,
    plan: Plan,
    hash: String,
    timeout: Duration,
) -> Result<DatasetIndex, OptimizeError> {
    let keys: Vec<String> = (0..plan.num_nodes)
        .flat_map(|rank| {
            (0..plan.workers_per_node).map(move |worker| PartialIndex::object_key(rank, worker))
        })
        .collect();

    let start = Instant::now();
    loop {
        let mut missing = 0usize;
        for key in &keys {
            let stat = with_retries(retry, "head_partial", || store.head(key))?;
            if !stat.exists {
                missing += 1;
            }
        }
        if missing == 0 {
            break;
        }
        if start.elapsed() >= timeout {
            return Err(OptimizeError::MergeTimeout { missing, timeout });
        }
        std::thread::sleep(MERGE_POLL_INTERVAL);
    }

    let mut partials = Vec::with_capacity(keys.len());
    for key in &keys {
        let bytes = with_retries(retry, "get_partial", || store.get(key))?;
        partials.push(PartialIndex::from_json_bytes(&bytes)?);
    }

    let index = merge_partials(partials, hash)?;
    let bytes = index.to_json_bytes()?;
    with_retries(retry, "put_index", || store.put(INDEX_FILE_NAME, &bytes))?;
    for key in &keys {
        with_retries(retry, "delete_partial", || store.delete(key))?;
    }

    tracing::info!(
        target: "strata_flow",
        event = "index_merged",
        workers = keys.len(),
        total_samples = index.total_samples,
        total_chunks = index.chunks.len(),
        "merged partial indices and published index"
    );
    Ok(index)
}

/// Non-leader nodes poll for the published index.
fn wait_for_index(
    store: &dyn ObjectStore,
    timeout: Duration,
) -> Result<DatasetIndex, OptimizeError> {
    let start = Instant::now();
    loop {
        match store.get(INDEX_FILE_NAME) {
            Ok(bytes) => return Ok(DatasetIndex::from_json_bytes(&bytes)?),
            Err(strata_store::StoreError::NotFound(_)) => {}
            Err(err) => return Err(err.into()),
        }
        if start.elapsed() >= timeout {
            return Err(OptimizeError::MergeTimeout {
                missing: 1,
                timeout,
            });
        }
        std::thread::sleep(MERGE_POLL_INTERVAL);
    }
}

/// Convenience wrapper: a user fn that yields exactly one sample per item.
pub fn one_sample<I, F>(f: F) -> impl Fn(&I) -> Result<FnOutput, String> + Sync
where
    F: Fn(&I) -> Result<Sample, String> + Sync,
{
    move |item| f(item).map(FnOutput::One)
}

/// Reads the published dataset index through a store for verification.
pub fn load_published_index(root: &str) -> Result<DatasetIndex, OptimizeError> {
    let store = open_from_root(root)?;
    let bytes = store.get(INDEX_FILE_NAME)?;
    Ok(DatasetIndex::from_json_bytes(&bytes)?)
}
