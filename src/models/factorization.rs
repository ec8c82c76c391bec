//! Matrix factorization trained with BPR.
//!
//! Every user and every chosen offer of the training split gets a latent
//! vector; the score of an offer is the dot product of the two.
use std::sync::Arc;

use ndarray::Array2;
use rand::seq::SliceRandom;
use rand_xorshift::XorShiftRng;

use super::pairwise_model::{fit_pairwise_model, PairwiseModel, TrainingHistory};
use super::{clip_margin, embedding_init, pairwise_weight, FitParameters, Hyperparameters};
use crate::data::{DataError, Interactions, Partition};
use crate::index::IdIndex;
use crate::{FittingError, PairwiseRankingModel, PredictionError, SamplingError};

const DEFAULT_NUM_SNAPSHOTS: usize = 12;
const MAX_NEGATIVE_ATTEMPTS: usize = 50;

#[derive(Clone, Debug)]
struct Parameters {
    user_vecs: Array2<f32>,
    item_vecs: Array2<f32>,
}

/// BPR matrix factorization model.
#[derive(Clone, Debug)]
pub struct FactorizationModel {
    hyper: Hyperparameters,
    partition: Arc<Partition>,
    users: IdIndex,
    items: IdIndex,
    parameters: Option<Parameters>,
    history: TrainingHistory,
}

fn lookup(index: &IdIndex, id: &str) -> Result<usize, FittingError> {
    index.get(id).ok_or_else(|| FittingError::UnindexedId { id: id.to_owned() })
}

impl FactorizationModel {
    /// Split `interactions` and index the users and offers of the training
    /// split.
    pub fn new(interactions: &Interactions, hyper: Hyperparameters) -> Result<Self, DataError> {
        hyper.validate()?;

        let partition = Partition::new(interactions, hyper.test_fraction, hyper.split_seed)?;

        let users = IdIndex::new(partition.reduced_train().iter().map(|x| x.user_id()));
        let items = IdIndex::new(partition.reduced_train().iter().map(|x| x.offer_id()));

        Ok(FactorizationModel {
            hyper,
            partition: Arc::new(partition),
            users,
            items,
            parameters: None,
            history: TrainingHistory::default(),
        })
    }

    /// Reinitialise the parameters and train for
    /// `parameters.num_iterations` steps.
    pub fn fit(&mut self, parameters: &FitParameters) -> Result<&TrainingHistory, FittingError> {
        let partition = self.partition.clone();
        let num_snapshots = self.hyper.num_snapshots.unwrap_or(DEFAULT_NUM_SNAPSHOTS);
        let recall_cutoffs = self.hyper.recall_cutoffs.clone();
        let seed = self.hyper.seed;

        self.history = fit_pairwise_model(
            self,
            &partition,
            parameters,
            num_snapshots,
            &recall_cutoffs,
            seed,
        )?;

        Ok(&self.history)
    }

    /// Snapshots of the last fit.
    pub fn history(&self) -> &TrainingHistory {
        &self.history
    }

    /// User vectors, one row per indexed user.
    pub fn user_vectors(&self) -> Option<&Array2<f32>> {
        self.parameters.as_ref().map(|x| &x.user_vecs)
    }

    /// Item vectors, one row per indexed offer.
    pub fn item_vectors(&self) -> Option<&Array2<f32>> {
        self.parameters.as_ref().map(|x| &x.item_vecs)
    }

    /// User index.
    pub fn users(&self) -> &IdIndex {
        &self.users
    }

    /// Offer index.
    pub fn items(&self) -> &IdIndex {
        &self.items
    }

    /// Train/test partition of the data.
    pub fn partition(&self) -> &Partition {
        &self.partition
    }
}

impl PairwiseRankingModel for FactorizationModel {
    /// Unknown users and unknown offers score zero.
    fn predict(&self, user_id: &str, offer_id: &str) -> Result<f32, PredictionError> {
        let user = match self.users.get(user_id) {
            Some(user) => user,
            None => return Ok(0.0),
        };
        let parameters = self.parameters.as_ref().ok_or(PredictionError::NotFitted)?;
        let item = match self.items.get(offer_id) {
            Some(item) => item,
            None => return Ok(0.0),
        };

        let score = parameters
            .user_vecs
            .row(user)
            .dot(&parameters.item_vecs.row(item));

        if score.is_finite() {
            Ok(score)
        } else {
            Err(PredictionError::InvalidPredictionValue)
        }
    }
}

impl PairwiseModel for FactorizationModel {
    fn initialize(&mut self, rng: &mut XorShiftRng) {
        let latent_dim = self.hyper.latent_dim;

        let user_vecs = embedding_init(self.users.len(), latent_dim, rng);
        let item_vecs = embedding_init(self.items.len(), latent_dim, rng);

        self.parameters = Some(Parameters {
            user_vecs,
            item_vecs,
        });
    }

    /// Only offers with an item vector can be updated, so draws are retried
    /// until one is found.
    fn sample_negative<'a>(
        &self,
        partition: &'a Partition,
        request_id: &str,
        rng: &mut XorShiftRng,
    ) -> Result<&'a str, SamplingError> {
        let negatives = partition
            .requests()
            .negatives(request_id)
            .filter(|x| !x.is_empty())
            .ok_or_else(|| SamplingError::NoNegatives {
                request_id: request_id.to_owned(),
            })?;

        for _ in 0..MAX_NEGATIVE_ATTEMPTS {
            if let Some(candidate) = negatives.choose(rng) {
                if self.items.get(candidate).is_some() {
                    return Ok(candidate.as_str());
                }
            }
        }

        Err(SamplingError::NoValidNegative {
            request_id: request_id.to_owned(),
            attempts: MAX_NEGATIVE_ATTEMPTS,
        })
    }

    fn step(
        &mut self,
        user_id: &str,
        positive: &str,
        negative: &str,
        learning_rate: f32,
        l2_penalty: f32,
    ) -> Result<f32, FittingError> {
        let user = lookup(&self.users, user_id)?;
        let positive_idx = lookup(&self.items, positive)?;
        let negative_idx = lookup(&self.items, negative)?;

        let margin = clip_margin(self.predict(user_id, positive)? - self.predict(user_id, negative)?);
        let weight = pairwise_weight(margin);

        let Parameters {
            user_vecs,
            item_vecs,
        } = self
            .parameters
            .as_mut()
            .ok_or(FittingError::Prediction(PredictionError::NotFitted))?;

        let item_diff = &item_vecs.row(positive_idx) - &item_vecs.row(negative_idx);
        user_vecs
            .row_mut(user)
            .zip_mut_with(&item_diff, |u, &diff| {
                *u += learning_rate * (weight * diff + l2_penalty * *u)
            });

        // Item updates use the updated user vector.
        let user_vec = user_vecs.row(user);
        item_vecs
            .row_mut(positive_idx)
            .zip_mut_with(&user_vec, |i, &u| {
                *i += learning_rate * (weight * u + l2_penalty * *i)
            });
        item_vecs
            .row_mut(negative_idx)
            .zip_mut_with(&user_vec, |j, &u| {
                *j += learning_rate * (-weight * u + l2_penalty * *j)
            });

        Ok(margin)
    }
}

#[cfg(test)]
mod tests {
    use ndarray::arr2;
    use rand::SeedableRng;

    use super::*;
    use crate::data::{Interaction, Split};
    use crate::datasets;

    /// Two users with one request each. Only `a` and `b` are ever chosen, so
    /// `c` and `d` have no item vector.
    fn two_user_data() -> Interactions {
        Interactions::from(vec![
            Interaction::new("r1", "u1", "a", true),
            Interaction::new("r1", "u1", "b", false),
            Interaction::new("r1", "u1", "c", false),
            Interaction::new("r2", "u2", "b", true),
            Interaction::new("r2", "u2", "a", false),
            Interaction::new("r2", "u2", "c", false),
            Interaction::new("r3", "u2", "b", true),
            Interaction::new("r3", "u2", "c", false),
            Interaction::new("r3", "u2", "d", false),
        ])
    }

    #[test]
    fn test_unknown_user_scores_zero() {
        let model = FactorizationModel::new(&two_user_data(), Hyperparameters::new(2)).unwrap();

        assert_eq!(model.predict("nobody", "a"), Ok(0.0));
        assert_eq!(model.predict("u1", "a"), Err(PredictionError::NotFitted));
    }

    #[test]
    fn test_indices() {
        let model = FactorizationModel::new(&two_user_data(), Hyperparameters::new(2)).unwrap();

        assert_eq!(model.users().len(), 2);
        assert_eq!(model.items().len(), 2);
        assert_eq!(model.items().get("c"), None);
        assert!(model.user_vectors().is_none());
    }

    #[test]
    fn test_single_step() {
        let mut model = FactorizationModel::new(&two_user_data(), Hyperparameters::new(2)).unwrap();
        model.parameters = Some(Parameters {
            user_vecs: arr2(&[[1.0, 0.0], [0.0, 1.0]]),
            item_vecs: arr2(&[[0.5, 0.0], [0.0, 0.5]]),
        });

        let (lr, lambda) = (0.1, 0.01);
        let margin = model.step("u1", "a", "b", lr, lambda).unwrap();
        assert!((margin - 0.5f32).abs() < 1e-6);

        let sigma = (-0.5f32).exp() / (1.0 + (-0.5f32).exp());
        let u = [
            1.0 + lr * (sigma * 0.5 + lambda * 1.0),
            0.0 + lr * (sigma * -0.5 + lambda * 0.0),
        ];
        let a = [
            0.5 + lr * (sigma * u[0] + lambda * 0.5),
            0.0 + lr * (sigma * u[1] + lambda * 0.0),
        ];
        let b = [
            0.0 + lr * (-sigma * u[0] + lambda * 0.0),
            0.5 + lr * (-sigma * u[1] + lambda * 0.5),
        ];

        let user_vecs = model.user_vectors().unwrap();
        let item_vecs = model.item_vectors().unwrap();
        for f in 0..2 {
            assert!((user_vecs[[0, f]] - u[f]).abs() < 1e-6);
            assert!((item_vecs[[0, f]] - a[f]).abs() < 1e-6);
            assert!((item_vecs[[1, f]] - b[f]).abs() < 1e-6);
        }

        // The other user is untouched.
        assert_eq!(user_vecs.row(1).to_vec(), vec![0.0, 1.0]);
    }

    #[test]
    fn test_step_rejects_unindexed_offers() {
        let mut model = FactorizationModel::new(&two_user_data(), Hyperparameters::new(2)).unwrap();
        model.initialize(&mut XorShiftRng::seed_from_u64(1));

        match model.step("u1", "a", "c", 0.1, 0.01) {
            Err(FittingError::UnindexedId { id }) => assert_eq!(id, "c"),
            other => panic!("Unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_sampler_only_returns_indexed_offers() {
        let model = FactorizationModel::new(&two_user_data(), Hyperparameters::new(2)).unwrap();
        let partition = model.partition();
        let mut rng = XorShiftRng::seed_from_u64(3);

        for _ in 0..20 {
            assert_eq!(model.sample_negative(partition, "r1", &mut rng), Ok("b"));
            assert_eq!(model.sample_negative(partition, "r2", &mut rng), Ok("a"));
        }

        assert_eq!(
            model.sample_negative(partition, "r3", &mut rng),
            Err(SamplingError::NoValidNegative {
                request_id: "r3".to_owned(),
                attempts: MAX_NEGATIVE_ATTEMPTS,
            })
        );
        assert_eq!(
            model.sample_negative(partition, "missing", &mut rng),
            Err(SamplingError::NoNegatives {
                request_id: "missing".to_owned(),
            })
        );
    }

    #[test]
    fn test_fit_records_snapshots() {
        let mut model = FactorizationModel::new(&two_user_data(), Hyperparameters::new(2)).unwrap();

        let history = model
            .fit(&FitParameters::default().num_iterations(1))
            .unwrap();
        assert_eq!(history.iterations(), vec![1]);

        let history = model
            .fit(&FitParameters::default().num_iterations(24))
            .unwrap();
        assert_eq!(history.snapshots().len(), 12);
        assert_eq!(history.iterations()[0], 2);
        assert!(history.skipped() <= 24);
    }

    #[test]
    fn test_fit_rejects_bad_parameters() {
        let mut model = FactorizationModel::new(&two_user_data(), Hyperparameters::new(2)).unwrap();

        assert!(model
            .fit(&FitParameters::default().learning_rate(-1.0))
            .is_err());
    }

    #[test]
    fn test_deterministic_fit() {
        let mut rng = XorShiftRng::seed_from_u64(42);
        let data = datasets::synthetic(10, 15, 6, 5, &mut rng);

        let hyper = Hyperparameters::new(4).test_fraction(0.2).seed(7);
        let fit = FitParameters::default().num_iterations(500);

        let mut first = FactorizationModel::new(&data, hyper.clone()).unwrap();
        let mut second = FactorizationModel::new(&data, hyper).unwrap();
        first.fit(&fit).unwrap();
        second.fit(&fit).unwrap();

        assert_eq!(first.user_vectors(), second.user_vectors());
        assert_eq!(first.item_vectors(), second.item_vectors());
        assert_eq!(
            first.history().accuracy(Split::Test),
            second.history().accuracy(Split::Test)
        );
    }

    #[test]
    fn test_fitting_improves_training_accuracy() {
        let mut rng = XorShiftRng::seed_from_u64(42);
        let data = datasets::synthetic(20, 12, 10, 4, &mut rng);

        let mut model =
            FactorizationModel::new(&data, Hyperparameters::new(8).num_snapshots(2)).unwrap();
        let history = model
            .fit(
                &FitParameters::default()
                    .num_iterations(20_000)
                    .learning_rate(0.05)
                    .l2_penalty(0.0),
            )
            .unwrap();

        let accuracy = history.last().unwrap().train.accuracy.unwrap();
        assert!(accuracy > 0.6, "Train accuracy {}", accuracy);
    }
}
