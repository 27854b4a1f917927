use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;

use strata_core::config::ChunkBudget;
use strata_core::sample::{sample_from_pairs, Value};
use strata_core::types::{Compression, WorldSlot};
use strata_format::chunk::{ChunkNaming, ChunkWriter, ChunkWriterConfig};
use strata_format::index::DatasetIndex;
use strata_format::serialize::{Registry, Schema};
use strata_reader::dataset::{ReaderConfig, StreamingDataset};
use strata_reader::pipeline::{Item, ItemLoader};
use strata_store::mem::MemStore;
use strata_store::ObjectStore;

fn temp_dir(test_name: &str) -> Result<PathBuf> {
    let mut root = std::env::temp_dir();
    root.push(format!(
        "strata-reader-{test_name}-{}-{}",
        std::process::id(),
        strata_observe::time::unix_time_ms()
    ));
    std::fs::create_dir_all(&root)?;
    Ok(root)
}

fn build_int_dataset(dir: &Path, total: i64, chunk_samples: u32) -> Result<()> {
    let registry = Registry::builtin();
    let probe = sample_from_pairs([("x", Value::Int(0))]);
    let schema = Schema::infer(&probe, &registry)?;
    let mut writer = ChunkWriter::new(
        ChunkWriterConfig {
            out_dir: dir.to_path_buf(),
            budget: ChunkBudget::Samples(chunk_samples),
            compression: Compression::None,
            naming: ChunkNaming::Global,
        },
        schema.clone(),
        registry,
    )?;

    let mut chunks = Vec::new();
    for i in 0..total {
        if let Some(closed) = writer.push(&sample_from_pairs([("x", Value::Int(i))]))? {
            chunks.push(closed.descriptor);
        }
    }
    if let Some(closed) = writer.finish()? {
        chunks.push(closed.descriptor);
    }

    let index = DatasetIndex::new(
        schema.fields().to_vec(),
        Compression::None,
        chunks,
        "test-config".to_string(),
    )?;
    index.save(dir)?;
    Ok(())
}

fn mem_store_from_dir(dir: &Path) -> Result<Arc<MemStore>> {
    let store = Arc::new(MemStore::new());
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        store.put(&name, &std::fs::read(entry.path())?)?;
    }
    Ok(store)
}

async fn drain_ids(dataset: &mut StreamingDataset) -> Result<Vec<i64>> {
    let mut out = Vec::new();
    while let Some(item) = dataset.next_item().await? {
        match item {
            Item::Sample { sample, .. } => {
                out.push(sample.get("x").and_then(|v| v.as_int()).unwrap());
            }
            Item::TokenBlock { .. } => anyhow::bail!("unexpected token block"),
        }
    }
    Ok(out)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sequential_read_yields_all_samples_in_order() -> Result<()> {
    let dir = temp_dir("sequential")?;
    build_int_dataset(&dir, 25, 4)?;

    let cfg = ReaderConfig {
        input_dir: dir.display().to_string(),
        cache_dir: Some(dir.join("cache")),
        ..ReaderConfig::default()
    };
    let mut dataset = StreamingDataset::open(cfg, WorldSlot::solo())?;
    assert_eq!(dataset.total_samples(), 25);

    let got = drain_ids(&mut dataset).await?;
    let want: Vec<i64> = (0..25).collect();
    assert_eq!(got, want);

    let metrics = dataset.metrics();
    assert_eq!(metrics.stream.samples_delivered(), 25);
    assert_eq!(metrics.stream.chunks_downloaded(), 7);
    assert_eq!(metrics.downloads.count(), 7);
    assert!(metrics.downloads.bytes() > 0);
    assert_eq!(metrics.decodes.count(), 25);
    assert!(metrics.inflight.high_water() >= 1);
    assert_eq!(metrics.inflight.current(), 0, "window drains at end of epoch");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sharded_streams_partition_the_dataset() -> Result<()> {
    let dir = temp_dir("sharded")?;
    build_int_dataset(&dir, 40, 5)?;

    let mut all: Vec<i64> = Vec::new();
    for worker in 0..2 {
        for rank in 0..2 {
            let cfg = ReaderConfig {
                input_dir: dir.display().to_string(),
                cache_dir: Some(dir.join(format!("cache-{rank}-{worker}"))),
                ..ReaderConfig::default()
            };
            let slot = WorldSlot {
                rank,
                num_ranks: 2,
                worker,
                workers_per_rank: 2,
            };
            let mut dataset = StreamingDataset::open(cfg, slot)?;
            all.extend(drain_ids(&mut dataset).await?);
        }
    }
    all.sort_unstable();
    let want: Vec<i64> = (0..40).collect();
    assert_eq!(all, want, "4 streams together cover the dataset exactly once");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn second_epoch_pass_hits_the_cache() -> Result<()> {
    let dir = temp_dir("cache-idempotent")?;
    build_int_dataset(&dir, 20, 4)?;
    let store = mem_store_from_dir(&dir)?;

    let cfg = ReaderConfig {
        input_dir: "mem://cache-idempotent".to_string(),
        cache_dir: Some(dir.join("cache")),
        ..ReaderConfig::default()
    };
    let mut dataset = StreamingDataset::open_with_store(
        cfg,
        WorldSlot::solo(),
        store.clone(),
        Registry::builtin(),
    )?;

    let first = drain_ids(&mut dataset).await?;
    let fetches_after_first = store.fetched_objects();
    assert!(fetches_after_first >= 5, "first pass downloads every chunk");

    dataset.set_epoch(0);
    let second = drain_ids(&mut dataset).await?;
    assert_eq!(first, second, "replaying the epoch returns identical data");
    assert_eq!(
        store.fetched_objects(),
        fetches_after_first,
        "second pass must be served from the local cache"
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn random_access_uses_byte_ranges_only() -> Result<()> {
    let dir = temp_dir("random-access")?;
    build_int_dataset(&dir, 25, 4)?;
    let store = mem_store_from_dir(&dir)?;

    let cfg = ReaderConfig {
        input_dir: "mem://random-access".to_string(),
        cache_dir: Some(dir.join("cache")),
        ..ReaderConfig::default()
    };
    let dataset = StreamingDataset::open_with_store(
        cfg,
        WorldSlot::solo(),
        store.clone(),
        Registry::builtin(),
    )?;

    let full_gets_before = store.get_calls();
    let sample = dataset.load_sample(7)?;
    assert_eq!(sample.get("x").and_then(|v| v.as_int()), Some(7));
    assert_eq!(
        store.get_calls(),
        full_gets_before,
        "random access must not download whole chunks"
    );
    assert_eq!(store.get_range_calls(), 3, "header, offsets, sample");

    assert!(dataset.load_sample(25).is_err(), "out of range id rejected");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shuffled_epochs_replay_and_differ() -> Result<()> {
    let dir = temp_dir("shuffled")?;
    build_int_dataset(&dir, 32, 4)?;

    let cfg = ReaderConfig {
        input_dir: dir.display().to_string(),
        shuffle: true,
        seed: 42,
        cache_dir: Some(dir.join("cache")),
        ..ReaderConfig::default()
    };

    let mut a = StreamingDataset::open(cfg.clone(), WorldSlot::solo())?;
    let epoch0_a = drain_ids(&mut a).await?;

    let mut b = StreamingDataset::open(cfg.clone(), WorldSlot::solo())?;
    let epoch0_b = drain_ids(&mut b).await?;
    assert_eq!(epoch0_a, epoch0_b);

    a.set_epoch(1);
    let epoch1 = drain_ids(&mut a).await?;
    assert_ne!(epoch0_a, epoch1);

    let mut sorted = epoch0_a.clone();
    sorted.sort_unstable();
    assert_eq!(sorted, (0..32).collect::<Vec<i64>>());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tokens_loader_yields_fixed_blocks() -> Result<()> {
    let dir = temp_dir("tokens")?;

    let registry = Registry::builtin();
    let probe = sample_from_pairs([("tokens", Value::TokensU16(vec![0]))]);
    let schema = Schema::infer(&probe, &registry)?;
    let mut writer = ChunkWriter::new(
        ChunkWriterConfig {
            out_dir: dir.clone(),
            budget: ChunkBudget::Samples(4),
            compression: Compression::None,
            naming: ChunkNaming::Global,
        },
        schema.clone(),
        registry,
    )?;

    // 12 samples x 8 tokens = 96 tokens, 3 chunks of 32 tokens each.
    let mut chunks = Vec::new();
    for i in 0..12u16 {
        let tokens: Vec<u16> = (0..8).map(|t| i * 8 + t).collect();
        let sample = sample_from_pairs([("tokens", Value::TokensU16(tokens))]);
        if let Some(closed) = writer.push(&sample)? {
            chunks.push(closed.descriptor);
        }
    }
    if let Some(closed) = writer.finish()? {
        chunks.push(closed.descriptor);
    }
    let index = DatasetIndex::new(
        schema.fields().to_vec(),
        Compression::None,
        chunks,
        "tokens-config".to_string(),
    )?;
    index.save(&dir)?;

    let cfg = ReaderConfig {
        input_dir: dir.display().to_string(),
        item_loader: ItemLoader::Tokens { block_size: 16 },
        cache_dir: Some(dir.join("cache")),
        ..ReaderConfig::default()
    };
    let mut dataset = StreamingDataset::open(cfg, WorldSlot::solo())?;

    let mut blocks = Vec::new();
    while let Some(item) = dataset.next_item().await? {
        match item {
            Item::TokenBlock { block } => match block {
                Value::TokensU16(tokens) => blocks.push(tokens),
                other => anyhow::bail!("unexpected value {}", other.type_name()),
            },
            Item::Sample { .. } => anyhow::bail!("expected token blocks"),
        }
    }

    // 32 tokens per chunk / 16 per block = 2 blocks per chunk, 3 chunks.
    assert_eq!(blocks.len(), 6);
    assert!(blocks.iter().all(|b| b.len() == 16));
    let flat: Vec<u16> = blocks.into_iter().flatten().collect();
    let want: Vec<u16> = (0..96).collect();
    assert_eq!(flat, want);
    Ok(())
}
