use std::collections::BTreeSet;

use strata_core::types::{chunk_filename, ChunkDescriptor, Compression};
use strata_format::index::DatasetIndex;
use strata_format::serialize::Field;
use strata_reader::assigner::{plan_epoch, AssignOptions, SampleRef};

fn index_with_chunks(chunk_sizes: &[u32]) -> DatasetIndex {
    let mut chunks = Vec::new();
    let mut first = 0u64;
    for (id, &samples) in chunk_sizes.iter().enumerate() {
        chunks.push(ChunkDescriptor {
            id: id as u64,
            filename: chunk_filename(id as u64),
            bytes: 1024,
            samples,
            first,
            last: first + u64::from(samples) - 1,
        });
        first += u64::from(samples);
    }
    DatasetIndex::new(
        vec![Field {
            name: "x".to_string(),
            codec: "int".to_string(),
        }],
        Compression::None,
        chunks,
        "test".to_string(),
    )
    .unwrap()
}

fn all_ids(streams: &[Vec<SampleRef>]) -> Vec<u64> {
    streams
        .iter()
        .flat_map(|s| s.iter().map(|r| r.sample_id))
        .collect()
}

fn collect_streams(
    index: &DatasetIndex,
    num_streams: u32,
    epoch: u32,
    opts: AssignOptions,
) -> Vec<Vec<SampleRef>> {
    let plan = plan_epoch(index, num_streams, epoch, opts).unwrap();
    (0..num_streams)
        .map(|s| plan.stream(s).unwrap().to_vec())
        .collect()
}

#[test]
fn coverage_without_drop_last() {
    for (chunk_sizes, num_streams) in [
        (vec![4u32; 25], 4u32),
        (vec![10, 3, 7, 5, 1], 3),
        (vec![100], 4),
        (vec![2, 2, 2], 8),
    ] {
        let index = index_with_chunks(&chunk_sizes);
        let total = index.total_samples;
        for epoch in [0u32, 1, 5] {
            let streams = collect_streams(
                &index,
                num_streams,
                epoch,
                AssignOptions {
                    shuffle: true,
                    drop_last: false,
                    seed: 42,
                },
            );
            let ids = all_ids(&streams);
            let distinct: BTreeSet<u64> = ids.iter().copied().collect();
            let want: BTreeSet<u64> = (0..total).collect();
            assert_eq!(distinct, want, "every sample is assigned at least once");

            // Padded streams stay in lockstep: all non-empty streams share
            // one length.
            let lens: BTreeSet<usize> = streams
                .iter()
                .filter(|s| !s.is_empty())
                .map(Vec::len)
                .collect();
            assert!(lens.len() <= 1, "streams must be padded to equal length");
        }
    }
}

#[test]
fn drop_last_truncates_to_lockstep_minimum() {
    let index = index_with_chunks(&[10, 3, 7, 5, 1]);
    let streams = collect_streams(
        &index,
        3,
        0,
        AssignOptions {
            shuffle: false,
            drop_last: true,
            seed: 42,
        },
    );
    let lens: BTreeSet<usize> = streams.iter().map(Vec::len).collect();
    assert_eq!(lens.len(), 1, "all streams share the truncated length");

    let ids = all_ids(&streams);
    let distinct: BTreeSet<u64> = ids.iter().copied().collect();
    assert_eq!(distinct.len(), ids.len(), "no duplicates under drop_last");
    assert!(ids.iter().all(|id| *id < index.total_samples));
}

#[test]
fn unshuffled_assignment_deals_chunks_in_id_order() {
    let index = index_with_chunks(&[2, 2, 2, 2]);
    let streams = collect_streams(
        &index,
        2,
        0,
        AssignOptions {
            shuffle: false,
            drop_last: false,
            seed: 0,
        },
    );
    // Chunks 0,2 -> stream 0; chunks 1,3 -> stream 1; intra order ascending.
    let ids0: Vec<u64> = streams[0].iter().map(|r| r.sample_id).collect();
    let ids1: Vec<u64> = streams[1].iter().map(|r| r.sample_id).collect();
    assert_eq!(ids0, vec![0, 1, 4, 5]);
    assert_eq!(ids1, vec![2, 3, 6, 7]);
}

#[test]
fn each_chunk_is_read_by_one_stream() {
    let index = index_with_chunks(&[4; 12]);
    let streams = collect_streams(
        &index,
        4,
        3,
        AssignOptions {
            shuffle: true,
            drop_last: true,
            seed: 7,
        },
    );
    let mut owners: Vec<BTreeSet<u32>> = Vec::new();
    for stream in &streams {
        owners.push(stream.iter().map(|r| r.chunk_index).collect());
    }
    for a in 0..owners.len() {
        for b in a + 1..owners.len() {
            assert!(
                owners[a].is_disjoint(&owners[b]),
                "chunk visited by streams {a} and {b}"
            );
        }
    }
}

#[test]
fn sharded_shuffle_is_deterministic_and_epoch_sensitive() {
    // 100 samples over 25 chunks, 4 streams, seed 42.
    let index = index_with_chunks(&[4; 25]);
    let opts = AssignOptions {
        shuffle: true,
        drop_last: false,
        seed: 42,
    };

    let epoch0_a = collect_streams(&index, 4, 0, opts);
    let epoch0_b = collect_streams(&index, 4, 0, opts);
    assert_eq!(epoch0_a, epoch0_b, "epoch 0 must replay identically");

    let epoch1 = collect_streams(&index, 4, 1, opts);
    assert_ne!(epoch0_a, epoch1, "epoch 1 must differ from epoch 0");

    // The shuffle is a real permutation, not the identity.
    let flat: Vec<u64> = all_ids(&epoch0_a);
    let mut sorted = flat.clone();
    sorted.sort_unstable();
    assert_ne!(flat, sorted, "seeded shuffle should not be the identity");

    // And a different seed shuffles differently.
    let other_seed = collect_streams(
        &index,
        4,
        0,
        AssignOptions {
            shuffle: true,
            drop_last: false,
            seed: 43,
        },
    );
    assert_ne!(epoch0_a, other_seed);
}

#[test]
fn intra_chunk_order_is_shuffled_per_chunk() {
    let index = index_with_chunks(&[64]);
    let streams = collect_streams(
        &index,
        1,
        0,
        AssignOptions {
            shuffle: true,
            drop_last: false,
            seed: 42,
        },
    );
    let positions: Vec<u32> = streams[0].iter().map(|r| r.position).collect();
    let mut sorted = positions.clone();
    sorted.sort_unstable();
    assert_eq!(sorted, (0..64).collect::<Vec<u32>>());
    assert_ne!(positions, sorted);
}

#[test]
fn world_mismatch_is_an_assignment_error() {
    let mut index = index_with_chunks(&[4, 4]);
    index.total_samples = 9;
    let err = plan_epoch(&index, 2, 0, AssignOptions::default()).unwrap_err();
    assert!(matches!(
        err,
        strata_core::error::StrataError::Assignment { .. }
    ));
}
