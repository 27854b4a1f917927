use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use strata_core::error::StrataError;

use crate::assigner::mix_seed;
use crate::dataset::StreamingDataset;
use crate::pipeline::Item;

/// What the combined stream does when one source runs out of samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExhaustionMode {
    /// Roll the exhausted source into its next epoch and keep drawing.
    #[default]
    Wrap,
    /// End the combined stream at the first exhausted source.
    Stop,
}

/// Picks the source dataset for one draw. Pure in `(seed, step)`: the source
/// sequence is reproducible regardless of how fast each source is consumed,
/// and a resumed stream re-derives the same picks from its step counter.
pub fn source_for_step(seed: u64, weights: &[f64], step: u64) -> usize {
    let mut rng = ChaCha8Rng::seed_from_u64(mix_seed(&[seed, step]));
    let draw: f64 = rng.gen();
    let mut acc = 0.0;
    for (i, w) in weights.iter().enumerate() {
        acc += w;
        if draw < acc {
            return i;
        }
    }
    weights.len().saturating_sub(1)
}

fn normalize_weights(weights: &[f64]) -> Result<Vec<f64>, StrataError> {
    if weights.is_empty() {
        return Err(StrataError::config("mixer needs at least one weight"));
    }
    if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
        return Err(StrataError::config(
            "mixer weights must be finite and non-negative",
        ));
    }
    let total: f64 = weights.iter().sum();
    if total <= 0.0 {
        return Err(StrataError::config("mixer weights must sum to > 0"));
    }
    Ok(weights.iter().map(|w| w / total).collect())
}

/// Weighted per-draw mixture over several streaming datasets.
///
/// Each underlying dataset keeps its own independent cursor; weights are
/// fractional and applied on every draw rather than by pre-interleaving.
pub struct CombinedDataset {
    datasets: Vec<StreamingDataset>,
    weights: Vec<f64>,
    seed: u64,
    step: u64,
    mode: ExhaustionMode,
}

impl std::fmt::Debug for CombinedDataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CombinedDataset")
            .field("datasets", &self.datasets.len())
            .field("weights", &self.weights)
            .field("seed", &self.seed)
            .field("step", &self.step)
            .field("mode", &self.mode)
            .finish()
    }
}

impl CombinedDataset {
    pub fn new(
        datasets: Vec<StreamingDataset>,
        weights: &[f64],
        seed: u64,
        mode: ExhaustionMode,
    ) -> Result<Self, StrataError> {
        if datasets.is_empty() {
            return Err(StrataError::config("mixer needs at least one dataset"));
        }
        if datasets.len() != weights.len() {
            return Err(StrataError::config(format!(
                "{} datasets but {} weights",
                datasets.len(),
                weights.len()
            )));
        }
        let weights = normalize_weights(weights)?;
        Ok(Self {
            datasets,
            weights,
            seed,
            step: 0,
            mode,
        })
    }

    pub fn step(&self) -> u64 {
        self.step
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    /// Draws the next source and pulls one item from it. Returns the source
    /// index alongside the item.
    pub async fn next_item(&mut self) -> Result<Option<(usize, Item)>, StrataError> {
        let source = source_for_step(self.seed, &self.weights, self.step);
        self.step += 1;
        let mode = self.mode;

        let dataset = &mut self.datasets[source];
        match dataset.next_item().await? {
            Some(item) => Ok(Some((source, item))),
            None => match mode {
                ExhaustionMode::Stop => {
                    tracing::info!(
                        target: "strata_flow",
                        event = "mixer_stopped",
                        source = source,
                        step = self.step,
                        "source exhausted, stopping combined stream"
                    );
                    Ok(None)
                }
                ExhaustionMode::Wrap => {
                    let next_epoch = dataset.epoch() + 1;
                    dataset.set_epoch(next_epoch);
                    match dataset.next_item().await? {
                        Some(item) => Ok(Some((source, item))),
                        // An empty source cannot wrap into anything.
                        None => Ok(None),
                    }
                }
            },
        }
    }
}
