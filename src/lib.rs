#![deny(missing_docs)]
//! # offer-rank
//!
//! `offer_rank` learns personalised rankings of mobility offers: given the
//! trip alternatives returned for a travel request, the model learns to score
//! the offer the user actually chose above the offers they passed over.
//!
//! Models are trained with Bayesian Personalised Ranking (BPR), sampling one
//! chosen offer and one rejected offer of the same request at a time. Two
//! models are provided:
//!
//! - [`models::factorization::FactorizationModel`]: latent user and item vectors;
//! - [`models::fm::FactorizationMachine`]: a factorization machine over the
//!   user identity and the category scores (Quick, Cheap, ...) of each offer.
//!
//! ## Example
//! Fitting a factorization machine on a small synthetic dataset:
//!
//! ```rust
//! # extern crate offer_rank;
//! # extern crate rand;
//! # extern crate rand_xorshift;
//! use rand::SeedableRng;
//! use rand_xorshift::XorShiftRng;
//!
//! use offer_rank::datasets;
//! use offer_rank::models::fm::FactorizationMachine;
//! use offer_rank::models::{FitParameters, Hyperparameters};
//!
//! let mut rng = XorShiftRng::seed_from_u64(42);
//! let data = datasets::synthetic(20, 30, 8, 6, &mut rng);
//!
//! let hyper = Hyperparameters::new(8).test_fraction(0.25).seed(42);
//! let mut model = FactorizationMachine::new(&data, hyper).unwrap();
//!
//! let fit = FitParameters::default()
//!     .num_iterations(2_000)
//!     .learning_rate(0.05);
//! let history = model.fit(&fit).unwrap();
//!
//! let last = history.last().unwrap();
//! println!(
//!     "Iteration {}: train accuracy {:?}, test accuracy {:?}",
//!     last.iteration, last.train.accuracy, last.test.accuracy
//! );
//! ```
#[macro_use]
extern crate serde_derive;

#[macro_use]
extern crate failure;
#[macro_use]
extern crate itertools;
#[macro_use]
extern crate log;

pub mod config;
pub mod data;
pub mod datasets;
pub mod evaluation;
pub mod index;
pub mod models;

/// Alias for mobility request identifiers.
pub type RequestId = String;
/// Alias for user identifiers.
pub type UserId = String;
/// Alias for offer identifiers.
pub type OfferId = String;

/// Prediction error types.
#[derive(Debug, Fail, Clone, PartialEq)]
pub enum PredictionError {
    /// Failed prediction due to numerical issues.
    #[fail(display = "Invalid prediction value: non-finite or not a number.")]
    InvalidPredictionValue,
    /// The model has no parameters yet.
    #[fail(display = "Model must be fitted first.")]
    NotFitted,
    /// The offer has no feature row.
    #[fail(display = "Unknown offer: {}", offer_id)]
    UnknownOffer {
        /// The offer that could not be resolved.
        offer_id: OfferId,
    },
}

/// Negative sampling error types.
///
/// These are recoverable: the trainer skips the iteration.
#[derive(Debug, Fail, Clone, PartialEq)]
pub enum SamplingError {
    /// The request has no rejected offers.
    #[fail(display = "Request {} has no negative offers.", request_id)]
    NoNegatives {
        /// The request being sampled.
        request_id: RequestId,
    },
    /// None of the drawn negatives could be scored.
    #[fail(
        display = "No valid negative offer for request {} after {} attempts.",
        request_id, attempts
    )]
    NoValidNegative {
        /// The request being sampled.
        request_id: RequestId,
        /// Number of draws made.
        attempts: usize,
    },
}

/// Fitting error types.
#[derive(Debug, Fail)]
pub enum FittingError {
    /// No positive interactions to train on.
    #[fail(display = "No interactions to train on.")]
    NoInteractions,
    /// A fitting parameter is out of range.
    #[fail(display = "Invalid value for {}: {}", name, value)]
    InvalidParameter {
        /// Parameter name.
        name: &'static str,
        /// The offending value.
        value: String,
    },
    /// A training identifier has no parameter row.
    #[fail(display = "Identifier {} is not indexed.", id)]
    UnindexedId {
        /// The identifier.
        id: String,
    },
    /// Evaluation during fitting failed.
    #[fail(display = "Evaluation failed: {}", _0)]
    Prediction(#[cause] PredictionError),
}

impl From<PredictionError> for FittingError {
    fn from(error: PredictionError) -> Self {
        FittingError::Prediction(error)
    }
}

/// Trait describing models that score offers for users.
///
/// Higher scores rank first. Implementations must be usable from several
/// threads at once during evaluation.
pub trait PairwiseRankingModel {
    /// Score `offer_id` for `user_id`.
    fn predict(&self, user_id: &str, offer_id: &str) -> Result<f32, PredictionError>;
}
