use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use strata_core::error::StrataError;
use strata_core::types::WorldSlot;
use strata_format::index::DatasetIndex;

pub use strata_core::mix::mix_seed;

/// Knobs that shape an epoch's assignment. Same options, same index, same
/// epoch: byte-identical output, on every platform.
#[derive(Debug, Clone, Copy)]
pub struct AssignOptions {
    pub shuffle: bool,
    pub drop_last: bool,
    pub seed: u64,
}

impl Default for AssignOptions {
    fn default() -> Self {
        Self {
            shuffle: false,
            drop_last: false,
            seed: DEFAULT_SEED,
        }
    }
}

pub const DEFAULT_SEED: u64 = 42;

/// One entry of a stream's assignment: which chunk, which intra-chunk
/// position, and the global sample id they resolve to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleRef {
    pub chunk_index: u32,
    pub position: u32,
    pub sample_id: u64,
}

/// The full epoch plan: one ordered sample list per stream.
#[derive(Debug, Clone)]
pub struct EpochPlan {
    epoch: u32,
    streams: Vec<Vec<SampleRef>>,
}

impl EpochPlan {
    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    pub fn num_streams(&self) -> u32 {
        self.streams.len() as u32
    }

    pub fn stream(&self, stream_index: u32) -> Result<&[SampleRef], StrataError> {
        self.streams
            .get(stream_index as usize)
            .map(Vec::as_slice)
            .ok_or_else(|| {
                StrataError::assignment(format!(
                    "stream index {stream_index} out of range ({} streams)",
                    self.streams.len()
                ))
            })
    }
}

/// Builds the deterministic epoch plan for every stream of a `W`-wide world.
///
/// Chunk-aligned: each chunk is visited whole by exactly one stream, so a
/// worker reads contiguous chunk files instead of jumping across them.
/// Chunks are dealt round-robin in shuffled (or ascending-id) order; the
/// intra-chunk visit order is independently shuffled per chunk.
pub fn plan_epoch(
    index: &DatasetIndex,
    num_streams: u32,
    epoch: u32,
    opts: AssignOptions,
) -> Result<EpochPlan, StrataError> {
    if num_streams == 0 {
        return Err(StrataError::assignment("world has zero streams"));
    }

    let covered: u64 = index
        .chunks
        .iter()
        .map(|c| u64::from(c.samples))
        .sum();
    if covered != index.total_samples {
        return Err(StrataError::assignment(format!(
            "index chunks cover {covered} samples but total_samples records {}",
            index.total_samples
        )));
    }

    let mut chunk_order: Vec<u32> = (0..index.chunks.len() as u32).collect();
    if opts.shuffle {
        let mut rng = ChaCha8Rng::seed_from_u64(mix_seed(&[opts.seed, u64::from(epoch)]));
        chunk_order.shuffle(&mut rng);
    }

    let mut streams: Vec<Vec<SampleRef>> = vec![Vec::new(); num_streams as usize];
    for (deal, chunk_index) in chunk_order.iter().copied().enumerate() {
        let stream = deal % num_streams as usize;
        let chunk = &index.chunks[chunk_index as usize];

        let mut positions: Vec<u32> = (0..chunk.samples).collect();
        if opts.shuffle {
            let mut rng = ChaCha8Rng::seed_from_u64(mix_seed(&[
                opts.seed,
                u64::from(epoch),
                chunk.id,
            ]));
            positions.shuffle(&mut rng);
        }

        streams[stream].extend(positions.into_iter().map(|position| SampleRef {
            chunk_index,
            position,
            sample_id: chunk.first + u64::from(position),
        }));
    }

    if opts.drop_last {
        let min_len = streams.iter().map(Vec::len).min().unwrap_or(0);
        for stream in &mut streams {
            stream.truncate(min_len);
        }
    } else {
        let max_len = streams.iter().map(Vec::len).max().unwrap_or(0);
        for stream in &mut streams {
            if stream.is_empty() {
                continue;
            }
            // Pad by wrapping the stream's own assignment from the start.
            let orig_len = stream.len();
            let mut i = 0;
            while stream.len() < max_len {
                let repeat = stream[i % orig_len];
                stream.push(repeat);
                i += 1;
            }
        }
    }

    tracing::debug!(
        target: "strata_flow",
        event = "epoch_planned",
        epoch = epoch,
        num_streams = num_streams,
        total_samples = index.total_samples,
        shuffle = opts.shuffle,
        drop_last = opts.drop_last,
        "planned epoch assignment"
    );

    Ok(EpochPlan {
        epoch,
        streams,
    })
}

/// The plan restricted to one `(rank, worker)` slot.
pub fn assignment_for(
    index: &DatasetIndex,
    slot: &WorldSlot,
    epoch: u32,
    opts: AssignOptions,
) -> Result<Vec<SampleRef>, StrataError> {
    slot.validate()
        .map_err(|e| StrataError::assignment(e.to_string()))?;
    let plan = plan_epoch(index, slot.total_streams(), epoch, opts)?;
    Ok(plan.stream(slot.stream_index())?.to_vec())
}

