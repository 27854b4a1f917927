use std::path::{Path, PathBuf};

use anyhow::Result;

use strata_core::config::ChunkBudget;
use strata_core::sample::{sample_from_pairs, Value};
use strata_core::types::{Compression, WorldSlot};
use strata_format::chunk::{ChunkNaming, ChunkWriter, ChunkWriterConfig};
use strata_format::index::DatasetIndex;
use strata_format::serialize::{Registry, Schema};
use strata_reader::dataset::{ReaderConfig, StreamingDataset};

fn temp_dir(test_name: &str) -> Result<PathBuf> {
    let mut root = std::env::temp_dir();
    root.push(format!(
        "strata-cache-bound-{test_name}-{}-{}",
        std::process::id(),
        strata_observe::time::unix_time_ms()
    ));
    std::fs::create_dir_all(&root)?;
    Ok(root)
}

/// 10 chunks of identical byte size, 4 samples each.
fn build_dataset(dir: &Path) -> Result<u64> {
    let registry = Registry::builtin();
    let probe = sample_from_pairs([("b", Value::Bytes(vec![0u8; 256]))]);
    let schema = Schema::infer(&probe, &registry)?;
    let mut writer = ChunkWriter::new(
        ChunkWriterConfig {
            out_dir: dir.to_path_buf(),
            budget: ChunkBudget::Samples(4),
            compression: Compression::None,
            naming: ChunkNaming::Global,
        },
        schema.clone(),
        registry,
    )?;

    let mut chunks = Vec::new();
    let mut chunk_bytes = 0u64;
    for i in 0..40u8 {
        let sample = sample_from_pairs([("b", Value::Bytes(vec![i; 256]))]);
        if let Some(closed) = writer.push(&sample)? {
            chunk_bytes = closed.descriptor.bytes;
            chunks.push(closed.descriptor);
        }
    }
    if let Some(closed) = writer.finish()? {
        chunks.push(closed.descriptor);
    }
    assert_eq!(chunks.len(), 10);

    let index = DatasetIndex::new(
        schema.fields().to_vec(),
        Compression::None,
        chunks,
        "cache-bound-config".to_string(),
    )?;
    index.save(dir)?;
    Ok(chunk_bytes)
}

fn cache_chunk_file_count(cache_dir: &Path) -> usize {
    let Ok(entries) = std::fs::read_dir(cache_dir) else {
        return 0;
    };
    entries
        .filter_map(|e| e.ok())
        .filter(|e| {
            let name = e.file_name();
            let name = name.to_string_lossy();
            name.starts_with("chunk-") && name.ends_with(".bin")
        })
        .count()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn linear_pass_never_holds_more_than_two_chunks() -> Result<()> {
    let data_dir = temp_dir("data")?;
    let chunk_bytes = build_dataset(&data_dir)?;
    let cache_dir = data_dir.join("cache");

    let cfg = ReaderConfig {
        input_dir: data_dir.display().to_string(),
        max_cache_size: (2 * chunk_bytes).to_string(),
        cache_dir: Some(cache_dir.clone()),
        max_prefetch_chunks: 1,
        ..ReaderConfig::default()
    };
    let mut dataset = StreamingDataset::open(cfg, WorldSlot::solo())?;

    let mut delivered = 0u64;
    let mut max_observed = 0usize;
    while let Some(_item) = dataset.next_item().await? {
        delivered += 1;
        max_observed = max_observed.max(cache_chunk_file_count(&cache_dir));
    }

    assert_eq!(delivered, 40);
    assert!(
        max_observed <= 2,
        "observed {max_observed} chunk files in the cache, budget allows 2"
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn undersized_budget_for_pinned_set_reports_cache_full() -> Result<()> {
    let data_dir = temp_dir("tiny")?;
    let chunk_bytes = build_dataset(&data_dir)?;
    let cache_dir = data_dir.join("cache");

    // One chunk of budget cannot hold the pinned chunk plus its prefetched
    // successor; the failure must be the structured fatal kind.
    let cfg = ReaderConfig {
        input_dir: data_dir.display().to_string(),
        max_cache_size: chunk_bytes.to_string(),
        cache_dir: Some(cache_dir.clone()),
        max_prefetch_chunks: 1,
        ..ReaderConfig::default()
    };
    let mut dataset = StreamingDataset::open(cfg, WorldSlot::solo())?;

    let mut saw_cache_full = false;
    loop {
        match dataset.next_item().await {
            Ok(Some(_)) => continue,
            Ok(None) => break,
            Err(strata_core::error::StrataError::CacheFull { pinned, .. }) => {
                assert!(!pinned.is_empty(), "diagnostic must list pinned chunks");
                saw_cache_full = true;
                break;
            }
            Err(other) => anyhow::bail!("expected CacheFull, got {other:?}"),
        }
    }
    assert!(saw_cache_full);
    Ok(())
}
