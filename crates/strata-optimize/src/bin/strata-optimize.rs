#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use strata_core::config::parse_byte_size;
use strata_core::error::StrataError;
use strata_core::sample::{sample_from_pairs, Value};
use strata_core::types::Compression;
use strata_optimize::optimize::{one_sample, optimize};
use strata_optimize::{exit_code, OptimizeConfig, OptimizeError, Plan};

/// Packs every file under `--input-dir` into a chunked dataset at
/// `--output-dir`. Each sample carries the file's relative path and bytes.
#[derive(Debug, Parser)]
#[command(name = "strata-optimize")]
struct Args {
    #[arg(long, env = "STRATA_INPUT_DIR")]
    input_dir: PathBuf,

    /// Store URL: a directory path, `local:<mount>`, or `s3://bucket/prefix`.
    #[arg(long, env = "STRATA_OUTPUT_DIR")]
    output_dir: String,

    #[arg(long, env = "STRATA_NUM_WORKERS", default_value_t = 1)]
    num_workers: u32,

    #[arg(long, env = "STRATA_NUM_NODES", default_value_t = 1)]
    num_nodes: u32,

    #[arg(long, env = "STRATA_NODE_RANK", default_value_t = 0)]
    node_rank: u32,

    /// Max payload bytes per chunk, with optional KB/MB/GB suffix.
    #[arg(long, env = "STRATA_CHUNK_BYTES")]
    chunk_bytes: Option<String>,

    /// Max samples per chunk; mutually exclusive with --chunk-bytes.
    #[arg(long, env = "STRATA_CHUNK_SIZE")]
    chunk_size: Option<u32>,

    /// null | zstd | lz4
    #[arg(long, env = "STRATA_COMPRESSION", default_value = "null")]
    compression: String,

    #[arg(long, env = "STRATA_ITEM_RETRIES", default_value_t = 2)]
    item_retries: u32,

    #[arg(long, env = "STRATA_MERGE_TIMEOUT_SECS", default_value_t = 300)]
    merge_timeout_secs: u64,

    /// Opaque machine descriptor forwarded to the orchestration layer.
    #[arg(long, env = "STRATA_MACHINE")]
    machine: Option<String>,
}

fn collect_inputs(root: &PathBuf) -> Result<Vec<(String, PathBuf)>> {
    anyhow::ensure!(root.is_dir(), "input dir {} not found", root.display());
    let mut files = Vec::new();
    let mut stack = vec![root.clone()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir)
            .with_context(|| format!("read_dir failed: {}", dir.display()))?
        {
            let entry = entry?;
            let path = entry.path();
            let meta = entry.metadata()?;
            if meta.is_dir() {
                stack.push(path);
            } else if meta.is_file() {
                let rel = path
                    .strip_prefix(root)
                    .unwrap_or(&path)
                    .to_string_lossy()
                    .replace('\\', "/");
                files.push((rel, path));
            }
        }
    }
    files.sort();
    Ok(files)
}

fn build_config(args: &Args) -> Result<OptimizeConfig, OptimizeError> {
    let chunk_bytes = match &args.chunk_bytes {
        Some(raw) => Some(parse_byte_size(raw)?),
        None => None,
    };
    let compression = Compression::parse(&args.compression).ok_or_else(|| {
        StrataError::config(format!("unknown compression {:?}", args.compression))
    })?;
    Ok(OptimizeConfig {
        output_root: args.output_dir.clone(),
        plan: Plan {
            num_nodes: args.num_nodes,
            workers_per_node: args.num_workers,
        },
        node_rank: args.node_rank,
        chunk_bytes,
        chunk_size: args.chunk_size,
        compression,
        item_retries: args.item_retries,
        merge_timeout: Duration::from_secs(args.merge_timeout_secs),
        machine: args.machine.clone(),
        scratch_dir: None,
    })
}

fn run(args: &Args) -> Result<(), OptimizeError> {
    let cfg = build_config(args)?;
    let inputs = collect_inputs(&args.input_dir).map_err(|e| {
        OptimizeError::Core(StrataError::io(
            e.to_string(),
            args.input_dir.display().to_string(),
        ))
    })?;

    let report = optimize(
        &cfg,
        &inputs,
        one_sample(|(rel, path): &(String, PathBuf)| {
            let bytes = std::fs::read(path).map_err(|e| format!("read {rel}: {e}"))?;
            Ok(sample_from_pairs([
                ("path", Value::Str(rel.clone())),
                ("data", Value::Bytes(bytes)),
            ]))
        }),
    )?;

    tracing::info!(
        target: "strata_flow",
        event = "cli_done",
        total_samples = report.total_samples,
        total_chunks = report.total_chunks,
        config_hash = %report.config_hash,
        "dataset published"
    );
    Ok(())
}

fn main() {
    strata_observe::logging::init_tracing();
    let args = Args::parse();
    if let Err(err) = run(&args) {
        tracing::error!(
            target: "strata_flow",
            event = "cli_failed",
            error = %err,
            "optimize job failed"
        );
        std::process::exit(exit_code(&err));
    }
}
