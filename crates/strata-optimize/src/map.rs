use std::sync::Arc;

use strata_core::error::StrataError;
use strata_store::retry::{with_retries, RetryPolicy};
use strata_store::{open_from_root, ObjectStore};

use crate::{partition_positions, OptimizeError, Plan};

/// One output object a `map` fn produced for an item: a store key relative
/// to the output root, and its bytes.
pub type MapOutput = Vec<(String, Vec<u8>)>;

/// `map` configuration: the same partitioning and lifecycle as `optimize`,
/// but outputs are arbitrary user files and no global index is published.
#[derive(Debug, Clone)]
pub struct MapConfig {
    pub output_root: String,
    pub plan: Plan,
    pub node_rank: u32,
    pub item_retries: u32,
    pub machine: Option<String>,
}

impl Default for MapConfig {
    fn default() -> Self {
        Self {
            output_root: String::new(),
            plan: Plan::solo(),
            node_rank: 0,
            item_retries: 2,
            machine: None,
        }
    }
}

impl MapConfig {
    pub fn validate(&self) -> Result<(), StrataError> {
        if self.output_root.trim().is_empty() {
            return Err(StrataError::config("output_root must be set"));
        }
        self.plan.validate()?;
        if self.node_rank >= self.plan.num_nodes {
            return Err(StrataError::config(format!(
                "node_rank {} out of range (num_nodes {})",
                self.node_rank, self.plan.num_nodes
            )));
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct MapReport {
    pub items_processed: u64,
    pub files_written: u64,
}

pub fn map<I, F>(cfg: &MapConfig, inputs: &[I], user_fn: F) -> Result<MapReport, OptimizeError>
where
    I: Sync,
    F: Fn(&I) -> Result<MapOutput, String> + Sync,
{
    let store: Arc<dyn ObjectStore> = Arc::from(open_from_root(&cfg.output_root)?);
    map_with_store(cfg, inputs, user_fn, store)
}

pub fn map_with_store<I, F>(
    cfg: &MapConfig,
    inputs: &[I],
    user_fn: F,
    store: Arc<dyn ObjectStore>,
) -> Result<MapReport, OptimizeError>
where
    I: Sync,
    F: Fn(&I) -> Result<MapOutput, String> + Sync,
{
    cfg.validate()?;
    if inputs.is_empty() {
        return Err(OptimizeError::EmptyInputs);
    }

    let shards = partition_positions(inputs.len() as u64, cfg.plan.total_workers());
    let retry = RetryPolicy::default();

    tracing::info!(
        target: "strata_flow",
        event = "map_start",
        output_root = %cfg.output_root,
        node_rank = cfg.node_rank,
        inputs = inputs.len() as u64,
        machine = cfg.machine.as_deref().unwrap_or(""),
        "starting map job"
    );

    let results: Vec<Result<(u64, u64), OptimizeError>> = std::thread::scope(|s| {
        let mut handles = Vec::new();
        for worker in 0..cfg.plan.workers_per_node {
            let shard_index = cfg.node_rank * cfg.plan.workers_per_node + worker;
            let positions = &shards[shard_index as usize];
            let store = Arc::clone(&store);
            let user_fn = &user_fn;
            let item_retries = cfg.item_retries;
            let node_rank = cfg.node_rank;
            handles.push(s.spawn(move || {
                let _span =
                    strata_observe::logging::producer_span(node_rank, worker).entered();
                let mut items = 0u64;
                let mut files = 0u64;
                for &position in positions {
                    let item = &inputs[position as usize];
                    let outputs =
                        invoke_map_with_retries(user_fn, item, position, item_retries)?;
                    for (key, bytes) in outputs {
                        with_retries(&retry, "put_map_output", || store.put(&key, &bytes))?;
                        files += 1;
                    }
                    items += 1;
                }
                Ok((items, files))
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

    let mut items_processed = 0u64;
    let mut files_written = 0u64;
    for result in results {
        let (items, files) = result?;
        items_processed += items;
        files_written += files;
    }

    tracing::info!(
        target: "strata_flow",
        event = "map_complete",
        node_rank = cfg.node_rank,
        items = items_processed,
        files = files_written,
        "map job complete"
    );

    Ok(MapReport {
        items_processed,
        files_written,
    })
}

fn invoke_map_with_retries<I, F>(
    user_fn: &F,
    item: &I,
    position: u64,
    item_retries: u32,
) -> Result<MapOutput, OptimizeError>
where
    F: Fn(&I) -> Result<MapOutput, String>,
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
                    "map fn failed, retrying item"
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
