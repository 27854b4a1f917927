#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

pub mod map;
pub mod optimize;

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use strata_core::config::ChunkBudget;
use strata_core::error::{ErrorKind, StrataError};
use strata_core::mix::splitmix64;
use strata_core::sample::Sample;
use strata_core::types::Compression;

#[derive(Debug, Error)]
pub enum OptimizeError {
    #[error(transparent)]
    Core(#[from] StrataError),
    #[error("no inputs to partition")]
    EmptyInputs,
    #[error("timed out waiting for {missing} partial indices after {timeout:?}")]
    MergeTimeout { missing: usize, timeout: Duration },
}

impl From<strata_store::StoreError> for OptimizeError {
    fn from(err: strata_store::StoreError) -> Self {
        OptimizeError::Core(err.into())
    }
}

/// CLI exit code for a job failure, per the driver contract:
/// 2 config, 3 partition, 4 worker failure, 5 upload failure, 6 merge
/// timeout.
pub fn exit_code(err: &OptimizeError) -> i32 {
    match err {
        OptimizeError::EmptyInputs => 3,
        OptimizeError::MergeTimeout { .. } => 6,
        OptimizeError::Core(core) => match core.kind() {
            ErrorKind::Config => 2,
            ErrorKind::UserFn => 4,
            ErrorKind::Io => 5,
            ErrorKind::Format | ErrorKind::CacheFull | ErrorKind::Assignment => 1,
        },
    }
}

/// The parallelism plan: how many nodes participate and how many producer
/// workers each runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Plan {
    pub num_nodes: u32,
    pub workers_per_node: u32,
}

impl Plan {
    pub fn solo() -> Self {
        Self {
            num_nodes: 1,
            workers_per_node: 1,
        }
    }

    pub fn total_workers(&self) -> u32 {
        self.num_nodes.saturating_mul(self.workers_per_node)
    }

    pub fn validate(&self) -> Result<(), StrataError> {
        if self.num_nodes == 0 || self.workers_per_node == 0 {
            return Err(StrataError::config(
                "num_nodes and num_workers must be > 0",
            ));
        }
        Ok(())
    }
}

/// Writer-side configuration surface.
#[derive(Debug, Clone)]
pub struct OptimizeConfig {
    /// Store URL the chunks and index are published under.
    pub output_root: String,
    pub plan: Plan,
    /// Which node this process is; the leader is node 0.
    pub node_rank: u32,
    pub chunk_bytes: Option<u64>,
    pub chunk_size: Option<u32>,
    pub compression: Compression,
    /// Extra attempts per input item after the first failure.
    pub item_retries: u32,
    /// How long the leader waits for every partial index, and how long other
    /// nodes wait for the merged `index.json`.
    pub merge_timeout: Duration,
    /// Opaque machine descriptor handed to the orchestration layer.
    pub machine: Option<String>,
    /// Local staging area for chunks awaiting upload.
    pub scratch_dir: Option<PathBuf>,
}

impl Default for OptimizeConfig {
    fn default() -> Self {
        Self {
            output_root: String::new(),
            plan: Plan::solo(),
            node_rank: 0,
            chunk_bytes: None,
            chunk_size: None,
            compression: Compression::None,
            item_retries: 2,
            merge_timeout: Duration::from_secs(300),
            machine: None,
            scratch_dir: None,
        }
    }
}

impl OptimizeConfig {
    pub fn validate(&self) -> Result<ChunkBudget, StrataError> {
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
        ChunkBudget::from_options(self.chunk_bytes, self.chunk_size)
    }

    pub(crate) fn scratch_root(&self) -> PathBuf {
        match &self.scratch_dir {
            Some(dir) => dir.clone(),
            None => {
                let mut dir = std::env::temp_dir();
                dir.push(format!("strata-optimize-{}", std::process::id()));
                dir
            }
        }
    }
}

/// What one `fn` invocation produced: a single sample or a lazy finite
/// sequence the writer drains.
pub enum FnOutput {
    One(Sample),
    Many(Box<dyn Iterator<Item = Sample> + Send>),
}

impl IntoIterator for FnOutput {
    type Item = Sample;
    type IntoIter = Box<dyn Iterator<Item = Sample> + Send>;

    fn into_iter(self) -> Self::IntoIter {
        match self {
            FnOutput::One(sample) => Box::new(std::iter::once(sample)),
            FnOutput::Many(iter) => iter,
        }
    }
}

/// Deterministic shard for an input position. Same position, same worker
/// count, same shard, on every run of the plan.
pub fn shard_for_position(position: u64, total_workers: u32) -> u32 {
    (splitmix64(position) % u64::from(total_workers.max(1))) as u32
}

/// Groups input positions into per-worker shards, preserving input order
/// within each shard.
pub fn partition_positions(input_count: u64, total_workers: u32) -> Vec<Vec<u64>> {
    let mut shards: Vec<Vec<u64>> = vec![Vec::new(); total_workers.max(1) as usize];
    for position in 0..input_count {
        shards[shard_for_position(position, total_workers) as usize].push(position);
    }
    shards
}

/// Hash of the producing configuration, stored in the index so identical
/// re-runs are recognizable. Excludes anything time- or host-dependent.
pub fn config_hash(cfg: &OptimizeConfig, input_count: u64) -> Result<String, StrataError> {
    #[derive(Serialize)]
    struct HashedConfig<'a> {
        plan: Plan,
        chunk_bytes: Option<u64>,
        chunk_size: Option<u32>,
        compression: Option<&'a str>,
        input_count: u64,
    }
    let canonical = serde_json::to_vec(&HashedConfig {
        plan: cfg.plan,
        chunk_bytes: cfg.chunk_bytes,
        chunk_size: cfg.chunk_size,
        compression: cfg.compression.as_str(),
        input_count,
    })
    .map_err(|e| StrataError::config(format!("config hash encode failed: {e}")))?;
    Ok(strata_format::sha256_hex(&canonical))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partitioning_is_deterministic_and_covering() {
        let a = partition_positions(1000, 8);
        let b = partition_positions(1000, 8);
        assert_eq!(a, b);

        let mut all: Vec<u64> = a.iter().flatten().copied().collect();
        all.sort_unstable();
        let want: Vec<u64> = (0..1000).collect();
        assert_eq!(all, want);

        // Roughly balanced: no shard more than twice the ideal size.
        for shard in &a {
            assert!(shard.len() < 2 * 1000 / 8);
        }
    }

    #[test]
    fn shards_preserve_input_order() {
        for shard in partition_positions(500, 4) {
            assert!(shard.windows(2).all(|w| w[0] < w[1]));
        }
    }

    #[test]
    fn config_validation() {
        let mut cfg = OptimizeConfig {
            output_root: "/tmp/out".to_string(),
            chunk_bytes: Some(1 << 20),
            ..OptimizeConfig::default()
        };
        cfg.validate().unwrap();

        cfg.chunk_size = Some(10);
        assert!(cfg.validate().is_err(), "both budgets set");

        cfg.chunk_bytes = None;
        cfg.chunk_size = None;
        assert!(cfg.validate().is_err(), "no budget set");

        cfg.chunk_size = Some(10);
        cfg.node_rank = 5;
        assert!(cfg.validate().is_err(), "node_rank out of range");
    }

    #[test]
    fn config_hash_ignores_machine_and_scratch() {
        let base = OptimizeConfig {
            output_root: "/tmp/out".to_string(),
            chunk_size: Some(10),
            ..OptimizeConfig::default()
        };
        let a = config_hash(&base, 100).unwrap();

        let mut other = base.clone();
        other.machine = Some("a100x8".to_string());
        other.scratch_dir = Some(PathBuf::from("/scratch"));
        assert_eq!(config_hash(&other, 100).unwrap(), a);

        let mut different = base;
        different.chunk_size = Some(11);
        assert_ne!(config_hash(&different, 100).unwrap(), a);
    }

    #[test]
    fn exit_codes_follow_the_driver_contract() {
        assert_eq!(exit_code(&OptimizeError::EmptyInputs), 3);
        assert_eq!(
            exit_code(&OptimizeError::MergeTimeout {
                missing: 1,
                timeout: Duration::from_secs(1)
            }),
            6
        );
        assert_eq!(
            exit_code(&OptimizeError::Core(StrataError::config("x"))),
            2
        );
        assert_eq!(
            exit_code(&OptimizeError::Core(StrataError::UserFn {
                message: "boom".to_string(),
                item_index: 3,
                retry_count: 2,
            })),
            4
        );
        assert_eq!(
            exit_code(&OptimizeError::Core(StrataError::io("net", "k"))),
            5
        );
    }
}
