use std::time::Instant;

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_xorshift::XorShiftRng;

use super::{pairwise_loss, FitParameters};
use crate::data::{Partition, Split};
use crate::evaluation::{evaluate, SplitMetrics, MAP_CUTOFF};
use crate::{FittingError, PairwiseRankingModel, SamplingError};

/// Metrics recorded at one point of training.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Number of iterations completed (1-based).
    pub iteration: usize,
    /// Mean pairwise loss of the updates since the previous snapshot.
    pub loss: Option<f32>,
    /// Iterations skipped since the previous snapshot because no negative
    /// offer could be sampled.
    pub skipped: usize,
    /// Metrics on the training split.
    pub train: SplitMetrics,
    /// Metrics on the test split.
    pub test: SplitMetrics,
}

/// Snapshots recorded during one call to `fit`, in iteration order.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingHistory {
    snapshots: Vec<Snapshot>,
}

impl TrainingHistory {
    /// All snapshots.
    pub fn snapshots(&self) -> &[Snapshot] {
        &self.snapshots
    }

    /// The most recent snapshot.
    pub fn last(&self) -> Option<&Snapshot> {
        self.snapshots.last()
    }

    /// Iterations at which snapshots were taken.
    pub fn iterations(&self) -> Vec<usize> {
        self.snapshots.iter().map(|x| x.iteration).collect()
    }

    /// Pairwise accuracy trajectory of a split.
    pub fn accuracy(&self, split: Split) -> Vec<(usize, Option<f32>)> {
        self.snapshots
            .iter()
            .map(|x| (x.iteration, x.metrics(split).accuracy))
            .collect()
    }

    /// Mean Recall@k trajectory of a split.
    pub fn recall(&self, split: Split, k: usize) -> Vec<(usize, Option<f32>)> {
        self.snapshots
            .iter()
            .map(|x| (x.iteration, x.metrics(split).ranking.mean_recall(k)))
            .collect()
    }

    /// Mean MAP trajectory of a split.
    pub fn map(&self, split: Split) -> Vec<(usize, Option<f32>)> {
        self.snapshots
            .iter()
            .map(|x| (x.iteration, x.metrics(split).ranking.mean_map()))
            .collect()
    }

    /// Mean position bias trajectory of a split.
    pub fn position_bias(&self, split: Split) -> Vec<(usize, Option<f32>)> {
        self.snapshots
            .iter()
            .map(|x| (x.iteration, x.metrics(split).ranking.mean_position_bias()))
            .collect()
    }

    /// Total number of skipped iterations.
    pub fn skipped(&self) -> usize {
        self.snapshots.iter().map(|x| x.skipped).sum()
    }
}

impl Snapshot {
    /// Metrics of one split.
    pub fn metrics(&self, split: Split) -> &SplitMetrics {
        match split {
            Split::Train => &self.train,
            Split::Test => &self.test,
        }
    }
}

/// A model that can be trained by sampling (user, chosen offer, rejected
/// offer) triplets.
pub(crate) trait PairwiseModel: PairwiseRankingModel + Sync {
    /// Reset all parameters.
    fn initialize(&mut self, rng: &mut XorShiftRng);
    /// Draw a rejected offer of `request_id` that the model can update.
    fn sample_negative<'a>(
        &self,
        partition: &'a Partition,
        request_id: &str,
        rng: &mut XorShiftRng,
    ) -> Result<&'a str, SamplingError>;
    /// Apply one SGD step and return the clipped margin `f_i - f_j`
    /// computed before the update.
    fn step(
        &mut self,
        user_id: &str,
        positive: &str,
        negative: &str,
        learning_rate: f32,
        l2_penalty: f32,
    ) -> Result<f32, FittingError>;
}

/// Sample uniformly from the rejected offers of a request.
pub(crate) fn sample_uniform_negative<'a>(
    partition: &'a Partition,
    request_id: &str,
    rng: &mut XorShiftRng,
) -> Result<&'a str, SamplingError> {
    partition
        .requests()
        .negatives(request_id)
        .and_then(|negatives| negatives.choose(rng))
        .map(|x| x.as_str())
        .ok_or_else(|| SamplingError::NoNegatives {
            request_id: request_id.to_owned(),
        })
}

/// Number of iterations between snapshots.
fn snapshot_interval(num_iterations: usize, num_snapshots: usize) -> usize {
    (num_iterations / num_snapshots).max(1)
}

pub(crate) fn fit_pairwise_model<T: PairwiseModel>(
    model: &mut T,
    partition: &Partition,
    parameters: &FitParameters,
    num_snapshots: usize,
    recall_cutoffs: &[usize],
    seed: u64,
) -> Result<TrainingHistory, FittingError> {
    parameters.validate()?;

    if partition.reduced_train().is_empty() {
        return Err(FittingError::NoInteractions);
    }

    let mut rng = XorShiftRng::seed_from_u64(seed);
    model.initialize(&mut rng);

    let interval = snapshot_interval(parameters.num_iterations, num_snapshots);
    let total_snapshots = parameters.num_iterations / interval;

    let mut history = TrainingHistory::default();
    let mut loss_value = 0.0;
    let mut num_updates = 0;
    let mut skipped = 0;

    let start = Instant::now();

    for iteration in 1..=parameters.num_iterations {
        let sample = partition
            .reduced_train()
            .choose(&mut rng)
            .ok_or(FittingError::NoInteractions)?;

        match model.sample_negative(partition, sample.request_id(), &mut rng) {
            Ok(negative) => {
                let margin = model.step(
                    sample.user_id(),
                    sample.offer_id(),
                    negative,
                    parameters.learning_rate,
                    parameters.l2_penalty,
                )?;

                loss_value += pairwise_loss(margin);
                num_updates += 1;
            }
            Err(error) => {
                debug!("Skipping iteration {}: {}", iteration, error);
                skipped += 1;
            }
        }

        if iteration % interval == 0 {
            let frozen: &T = &*model;
            let (train, test) = rayon::join(
                || evaluate(frozen, partition, Split::Train, recall_cutoffs),
                || evaluate(frozen, partition, Split::Test, recall_cutoffs),
            );

            let snapshot = Snapshot {
                iteration,
                loss: if num_updates > 0 {
                    Some(loss_value / num_updates as f32)
                } else {
                    None
                },
                skipped,
                train: train?,
                test: test?,
            };

            info!(
                "{}/{} (iteration {}): loss {:?}, accuracy train {:?} test {:?}, \
                 MAP@{} train {:?} test {:?} ({:?})",
                history.snapshots.len() + 1,
                total_snapshots,
                iteration,
                snapshot.loss,
                snapshot.train.accuracy,
                snapshot.test.accuracy,
                MAP_CUTOFF,
                snapshot.train.ranking.mean_map(),
                snapshot.test.ranking.mean_map(),
                start.elapsed()
            );

            history.snapshots.push(snapshot);
            loss_value = 0.0;
            num_updates = 0;
            skipped = 0;
        }
    }

    Ok(history)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_interval() {
        assert_eq!(snapshot_interval(100_000, 12), 8333);
        assert_eq!(snapshot_interval(100_000, 10), 10_000);
        assert_eq!(snapshot_interval(5, 10), 1);
        assert_eq!(snapshot_interval(1, 12), 1);
    }
}
