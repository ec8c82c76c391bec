//! Models module.
use ndarray::Array2;
use rand::Rng;
use rand_distr::{Distribution, Normal};

use crate::data::DataError;
use crate::FittingError;

pub mod factorization;
pub mod fm;
mod pairwise_model;

pub use self::pairwise_model::{Snapshot, TrainingHistory};

/// Score differences below this value are clipped before the logistic
/// function is applied.
pub const MIN_MARGIN: f32 = -10.0;

/// Clip a score difference `f_i - f_j` from below.
pub fn clip_margin(margin: f32) -> f32 {
    if margin < MIN_MARGIN {
        MIN_MARGIN
    } else {
        margin
    }
}

/// Gradient weight of the pairwise logistic loss, `1 - sigmoid(margin)`.
pub fn pairwise_weight(margin: f32) -> f32 {
    let exponential = (-clip_margin(margin)).exp();
    exponential / (1.0 + exponential)
}

/// Probability that the first offer of a pair is preferred.
pub fn win_probability(margin: f32) -> f32 {
    1.0 / (1.0 + (-clip_margin(margin)).exp())
}

/// The BPR loss `-ln sigmoid(margin)`.
pub fn pairwise_loss(margin: f32) -> f32 {
    (1.0 + (-clip_margin(margin)).exp()).ln()
}

/// Draw a `rows x cols` matrix from `Normal(0, 1 / cols)`.
pub(crate) fn embedding_init<R: Rng>(rows: usize, cols: usize, rng: &mut R) -> Array2<f32> {
    match Normal::new(0.0, 1.0 / cols as f32) {
        Ok(normal) => Array2::from_shape_fn((rows, cols), |_| normal.sample(&mut *rng)),
        Err(_) => Array2::zeros((rows, cols)),
    }
}

/// Hyperparameters shared by both models.
///
/// These are fixed when the model is built; the per-run settings live in
/// [`FitParameters`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Hyperparameters {
    latent_dim: usize,
    test_fraction: f64,
    split_seed: u64,
    seed: u64,
    num_snapshots: Option<usize>,
    recall_cutoffs: Vec<usize>,
}

impl Default for Hyperparameters {
    fn default() -> Self {
        Hyperparameters::new(5)
    }
}

impl Hyperparameters {
    /// Build new hyperparameters with latent dimension `latent_dim`.
    pub fn new(latent_dim: usize) -> Self {
        Hyperparameters {
            latent_dim,
            test_fraction: 0.1,
            split_seed: 42,
            seed: 42,
            num_snapshots: None,
            recall_cutoffs: vec![1, 5, 10],
        }
    }

    /// Set the latent dimension.
    pub fn latent_dim(mut self, latent_dim: usize) -> Self {
        self.latent_dim = latent_dim;
        self
    }

    /// Set the fraction of each user's chosen offers held out for testing.
    pub fn test_fraction(mut self, test_fraction: f64) -> Self {
        self.test_fraction = test_fraction;
        self
    }

    /// Set the seed of the train/test split.
    pub fn split_seed(mut self, split_seed: u64) -> Self {
        self.split_seed = split_seed;
        self
    }

    /// Set the seed used for initialisation and sampling.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Set the number of metric snapshots taken per fit.
    pub fn num_snapshots(mut self, num_snapshots: usize) -> Self {
        self.num_snapshots = Some(num_snapshots);
        self
    }

    /// Set the Recall@k cutoffs.
    pub fn recall_cutoffs(mut self, recall_cutoffs: Vec<usize>) -> Self {
        self.recall_cutoffs = recall_cutoffs;
        self
    }

    fn validate(&self) -> Result<(), DataError> {
        if self.latent_dim == 0 {
            return Err(DataError::InvalidParameter {
                name: "latent_dim",
                value: self.latent_dim.to_string(),
            });
        }
        if self.num_snapshots == Some(0) {
            return Err(DataError::InvalidParameter {
                name: "num_snapshots",
                value: "0".to_owned(),
            });
        }
        if self.recall_cutoffs.is_empty() || self.recall_cutoffs.contains(&0) {
            return Err(DataError::InvalidParameter {
                name: "recall_cutoffs",
                value: format!("{:?}", self.recall_cutoffs),
            });
        }

        Ok(())
    }
}

/// Settings of a single training run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitParameters {
    num_iterations: usize,
    learning_rate: f32,
    l2_penalty: f32,
}

impl Default for FitParameters {
    fn default() -> Self {
        FitParameters {
            num_iterations: 100_000,
            learning_rate: 0.1,
            l2_penalty: 0.01,
        }
    }
}

impl FitParameters {
    /// Set the number of SGD steps.
    pub fn num_iterations(mut self, num_iterations: usize) -> Self {
        self.num_iterations = num_iterations;
        self
    }

    /// Set the learning rate.
    pub fn learning_rate(mut self, learning_rate: f32) -> Self {
        self.learning_rate = learning_rate;
        self
    }

    /// Set the L2 penalty.
    pub fn l2_penalty(mut self, l2_penalty: f32) -> Self {
        self.l2_penalty = l2_penalty;
        self
    }

    /// The number of SGD steps.
    pub fn get_num_iterations(&self) -> usize {
        self.num_iterations
    }

    fn validate(&self) -> Result<(), FittingError> {
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(FittingError::InvalidParameter {
                name: "learning_rate",
                value: self.learning_rate.to_string(),
            });
        }
        if !(self.l2_penalty.is_finite() && self.l2_penalty >= 0.0) {
            return Err(FittingError::InvalidParameter {
                name: "l2_penalty",
                value: self.l2_penalty.to_string(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clipping_is_idempotent() {
        for &margin in &[-10.0, -10.5, -20.0, -1e6] {
            assert_eq!(pairwise_weight(margin), pairwise_weight(MIN_MARGIN));
            assert_eq!(win_probability(margin), win_probability(MIN_MARGIN));
            assert_eq!(pairwise_loss(margin), pairwise_loss(MIN_MARGIN));
        }
        assert!(pairwise_weight(-9.0) < pairwise_weight(MIN_MARGIN));
    }

    #[test]
    fn test_logistic_helpers() {
        assert_eq!(win_probability(0.0), 0.5);
        assert_eq!(pairwise_weight(0.0), 0.5);
        assert!((pairwise_weight(2.0) - (1.0 - win_probability(2.0))).abs() < 1e-6);
        assert!((pairwise_loss(0.0) - 2.0f32.ln()).abs() < 1e-6);
        assert!(pairwise_weight(50.0) >= 0.0);
    }

    #[test]
    fn test_parameter_validation() {
        assert!(Hyperparameters::new(0).validate().is_err());
        assert!(Hyperparameters::new(4).num_snapshots(0).validate().is_err());
        assert!(Hyperparameters::new(4)
            .recall_cutoffs(vec![])
            .validate()
            .is_err());
        assert!(Hyperparameters::default().validate().is_ok());

        assert!(FitParameters::default().learning_rate(0.0).validate().is_err());
        assert!(FitParameters::default()
            .l2_penalty(std::f32::NAN)
            .validate()
            .is_err());
        assert!(FitParameters::default().validate().is_ok());
    }

    #[test]
    fn test_embedding_init() {
        use rand::SeedableRng;
        use rand_xorshift::XorShiftRng;

        let mut rng = XorShiftRng::seed_from_u64(42);
        let embeddings = embedding_init(200, 4, &mut rng);

        assert_eq!(embeddings.dim(), (200, 4));
        assert!(embeddings.iter().all(|x| x.is_finite()));
        assert!(embeddings.iter().any(|&x| x != 0.0));
        assert!(embeddings.mean().unwrap().abs() < 0.1);
    }
}
