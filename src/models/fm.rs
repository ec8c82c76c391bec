//! Factorization machine trained with BPR.
//!
//! The feature vector of a (user, offer) pair is the one-hot encoding of the
//! user followed by the eleven category scores of the offer:
//!
//! ```text
//! x = [0, .., 1, .., 0 ; quick, reliable, cheap, .., healthy]
//! ```
//!
//! and the score is the usual second-order factorization machine
//!
//! ```text
//! f(x) = bias + <w, x> + 0.5 * sum_f [(sum_i x_i v_if)^2 - sum_i x_i^2 v_if^2]
//! ```
//!
//! Only the user's row and the category rows are ever non-zero, so feature
//! vectors are kept as lists of active `(row, value)` pairs.
use std::sync::Arc;

use ndarray::{Array1, Array2};
use rand_xorshift::XorShiftRng;

use super::pairwise_model::{
    fit_pairwise_model, sample_uniform_negative, PairwiseModel, TrainingHistory,
};
use super::{clip_margin, embedding_init, pairwise_weight, FitParameters, Hyperparameters};
use crate::data::{DataError, Interactions, Partition, NUM_CATEGORIES};
use crate::index::{IdIndex, OfferFeatures};
use crate::{FittingError, PairwiseRankingModel, PredictionError, SamplingError};

const DEFAULT_NUM_SNAPSHOTS: usize = 10;

#[derive(Clone, Debug)]
struct Parameters {
    bias: f32,
    strengths: Array1<f32>,
    feature_factors: Array2<f32>,
}

/// BPR factorization machine over users and offer categories.
#[derive(Clone, Debug)]
pub struct FactorizationMachine {
    hyper: Hyperparameters,
    partition: Arc<Partition>,
    users: IdIndex,
    offers: OfferFeatures,
    parameters: Option<Parameters>,
    history: TrainingHistory,
}

type ActiveFeatures = Vec<(usize, f32)>;

impl FactorizationMachine {
    /// Split `interactions`, index every user, and collect the category
    /// scores of every offer in the table.
    ///
    /// Fails with [`DataError::MissingCategories`] if any offer has no
    /// category scores.
    pub fn new(interactions: &Interactions, hyper: Hyperparameters) -> Result<Self, DataError> {
        hyper.validate()?;

        let offers = OfferFeatures::new(interactions.data())?;
        let users = IdIndex::new(interactions.data().iter().map(|x| x.user_id()));
        let partition = Partition::new(interactions, hyper.test_fraction, hyper.split_seed)?;

        Ok(FactorizationMachine {
            hyper,
            partition: Arc::new(partition),
            users,
            offers,
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

    /// Length of the feature vector.
    pub fn num_features(&self) -> usize {
        self.users.len() + NUM_CATEGORIES
    }

    /// Snapshots of the last fit.
    pub fn history(&self) -> &TrainingHistory {
        &self.history
    }

    /// Global bias.
    pub fn bias(&self) -> Option<f32> {
        self.parameters.as_ref().map(|x| x.bias)
    }

    /// Linear weights, one per feature.
    pub fn strengths(&self) -> Option<&Array1<f32>> {
        self.parameters.as_ref().map(|x| &x.strengths)
    }

    /// Latent factors, one row per feature.
    pub fn feature_factors(&self) -> Option<&Array2<f32>> {
        self.parameters.as_ref().map(|x| &x.feature_factors)
    }

    /// User index; user `u` owns feature row `u`.
    pub fn users(&self) -> &IdIndex {
        &self.users
    }

    /// Category scores of every offer.
    pub fn offers(&self) -> &OfferFeatures {
        &self.offers
    }

    /// Train/test partition of the data.
    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    fn active_features(&self, user: usize, offer_row: usize) -> ActiveFeatures {
        let num_users = self.users.len();

        let mut active = Vec::with_capacity(NUM_CATEGORIES + 1);
        active.push((user, 1.0));
        active.extend(
            self.offers
                .row(offer_row)
                .iter()
                .enumerate()
                .map(|(category, &value)| (num_users + category, value)),
        );

        active
    }

    fn resolve(&self, user_id: &str, offer_id: &str) -> Result<ActiveFeatures, FittingError> {
        let user = self
            .users
            .get(user_id)
            .ok_or_else(|| FittingError::UnindexedId {
                id: user_id.to_owned(),
            })?;
        let offer = self
            .offers
            .get(offer_id)
            .ok_or_else(|| FittingError::UnindexedId {
                id: offer_id.to_owned(),
            })?;

        Ok(self.active_features(user, offer))
    }
}

/// Score of `active` and the per-factor sums `sum_i x_i v_if`.
fn score(parameters: &Parameters, active: &[(usize, f32)]) -> (f32, Array1<f32>) {
    let latent_dim = parameters.feature_factors.ncols();

    let mut linear = parameters.bias;
    let mut first_sums = Array1::<f32>::zeros(latent_dim);
    let mut second_sums = Array1::<f32>::zeros(latent_dim);

    for &(feature, value) in active {
        let factors = parameters.feature_factors.row(feature);

        linear += parameters.strengths[feature] * value;
        first_sums.scaled_add(value, &factors);
        second_sums.scaled_add(value * value, &factors.mapv(|x| x * x));
    }

    let pairwise: f32 = izip!(first_sums.iter(), second_sums.iter())
        .map(|(first, second)| first * first - second)
        .sum();

    (linear + 0.5 * pairwise, first_sums)
}

impl PairwiseRankingModel for FactorizationMachine {
    /// Unknown users score zero; an unknown offer of a known user is an
    /// error.
    fn predict(&self, user_id: &str, offer_id: &str) -> Result<f32, PredictionError> {
        let user = match self.users.get(user_id) {
            Some(user) => user,
            None => return Ok(0.0),
        };
        let parameters = self.parameters.as_ref().ok_or(PredictionError::NotFitted)?;
        let offer = self
            .offers
            .get(offer_id)
            .ok_or_else(|| PredictionError::UnknownOffer {
                offer_id: offer_id.to_owned(),
            })?;

        let (prediction, _) = score(parameters, &self.active_features(user, offer));

        if prediction.is_finite() {
            Ok(prediction)
        } else {
            Err(PredictionError::InvalidPredictionValue)
        }
    }
}

impl PairwiseModel for FactorizationMachine {
    fn initialize(&mut self, rng: &mut XorShiftRng) {
        let num_features = self.num_features();

        self.parameters = Some(Parameters {
            bias: 0.0,
            strengths: Array1::ones(num_features),
            feature_factors: embedding_init(num_features, self.hyper.latent_dim, rng),
        });
    }

    fn sample_negative<'a>(
        &self,
        partition: &'a Partition,
        request_id: &str,
        rng: &mut XorShiftRng,
    ) -> Result<&'a str, SamplingError> {
        sample_uniform_negative(partition, request_id, rng)
    }

    /// The bias is not updated. The penalty term applies to every strength
    /// and factor row, but only the rows active in either feature vector get
    /// a gradient.
    fn step(
        &mut self,
        user_id: &str,
        positive: &str,
        negative: &str,
        learning_rate: f32,
        l2_penalty: f32,
    ) -> Result<f32, FittingError> {
        let active_i = self.resolve(user_id, positive)?;
        let active_j = self.resolve(user_id, negative)?;

        let parameters = self
            .parameters
            .as_mut()
            .ok_or(FittingError::Prediction(PredictionError::NotFitted))?;

        let (f_i, first_sums_i) = score(parameters, &active_i);
        let (f_j, first_sums_j) = score(parameters, &active_j);

        if !(f_i.is_finite() && f_j.is_finite()) {
            return Err(PredictionError::InvalidPredictionValue.into());
        }

        let margin = clip_margin(f_i - f_j);
        let weight = pairwise_weight(margin);

        // Both vectors activate the same rows in the same order.
        let gradients: Vec<(usize, f32, Array1<f32>)> = active_i
            .iter()
            .zip(active_j.iter())
            .map(|(&(row, x_i), &(_, x_j))| {
                let factor_gradient = izip!(
                    first_sums_i.iter(),
                    first_sums_j.iter(),
                    parameters.feature_factors.row(row).iter()
                )
                .map(|(s_i, s_j, v)| (x_i * s_i - v * x_i * x_i) - (x_j * s_j - v * x_j * x_j))
                .collect();

                (row, x_i - x_j, factor_gradient)
            })
            .collect();

        // theta += lr * (sigma * gradient + lambda * theta), with the gradient
        // zero outside the active rows.
        let penalty = 1.0 + learning_rate * l2_penalty;
        parameters.strengths *= penalty;
        parameters.feature_factors *= penalty;

        for (row, strength_gradient, factor_gradient) in gradients {
            parameters.strengths[row] += learning_rate * weight * strength_gradient;
            parameters
                .feature_factors
                .row_mut(row)
                .scaled_add(learning_rate * weight, &factor_gradient);
        }

        Ok(margin)
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;

    use super::*;
    use crate::data::{CategoryScores, Interaction, Split};
    use crate::datasets;

    fn scores(values: &[(usize, f32)]) -> CategoryScores {
        let mut scores = [0.0; NUM_CATEGORIES];
        for &(category, value) in values {
            scores[category] = value;
        }
        CategoryScores::new(scores)
    }

    fn offer(request: &str, user: &str, offer: &str, selected: bool) -> Interaction {
        let categories = match offer {
            "a" => scores(&[(0, 1.0), (4, 0.25)]),
            "b" => scores(&[(1, 1.0), (2, 0.5)]),
            _ => scores(&[(2, 0.5), (10, 0.75)]),
        };

        Interaction::new(request, user, offer, selected).with_categories(categories)
    }

    /// Two users and three offers.
    fn two_user_data() -> Interactions {
        Interactions::from(vec![
            offer("r1", "u1", "a", true),
            offer("r1", "u1", "b", false),
            offer("r1", "u1", "c", false),
            offer("r2", "u2", "b", true),
            offer("r2", "u2", "a", false),
            offer("r2", "u2", "c", false),
        ])
    }

    fn fitted_model() -> FactorizationMachine {
        let mut model = FactorizationMachine::new(&two_user_data(), Hyperparameters::new(3)).unwrap();
        model.initialize(&mut XorShiftRng::seed_from_u64(42));

        // Perturb the strengths so the linear term is exercised too.
        if let Some(parameters) = model.parameters.as_mut() {
            for (idx, strength) in parameters.strengths.iter_mut().enumerate() {
                *strength = 0.1 * idx as f32 - 0.3;
            }
            parameters.bias = 0.2;
        }

        model
    }

    fn dense_features(model: &FactorizationMachine, user_id: &str, offer_id: &str) -> Array1<f32> {
        let mut x = Array1::zeros(model.num_features());
        for (row, value) in model.resolve(user_id, offer_id).unwrap() {
            x[row] = value;
        }
        x
    }

    fn brute_force_score(model: &FactorizationMachine, x: &Array1<f32>) -> f32 {
        let parameters = model.parameters.as_ref().unwrap();
        let factors = &parameters.feature_factors;

        let mut prediction = parameters.bias + parameters.strengths.dot(x);
        for i in 0..x.len() {
            for j in (i + 1)..x.len() {
                prediction += factors.row(i).dot(&factors.row(j)) * x[i] * x[j];
            }
        }

        prediction
    }

    #[test]
    fn test_score_matches_pairwise_expansion() {
        let model = fitted_model();

        for &user_id in &["u1", "u2"] {
            for &offer_id in &["a", "b", "c"] {
                let x = dense_features(&model, user_id, offer_id);
                let expected = brute_force_score(&model, &x);
                let prediction = model.predict(user_id, offer_id).unwrap();

                assert!(
                    (prediction - expected).abs() < 1e-5,
                    "{} vs {}",
                    prediction,
                    expected
                );
            }
        }
    }

    #[test]
    fn test_unknown_identifiers() {
        let mut model = FactorizationMachine::new(&two_user_data(), Hyperparameters::new(3)).unwrap();

        assert_eq!(model.predict("nobody", "a"), Ok(0.0));
        assert_eq!(model.predict("u1", "a"), Err(PredictionError::NotFitted));

        model.initialize(&mut XorShiftRng::seed_from_u64(1));

        assert_eq!(model.predict("nobody", "zzz"), Ok(0.0));
        assert_eq!(
            model.predict("u1", "zzz"),
            Err(PredictionError::UnknownOffer {
                offer_id: "zzz".to_owned(),
            })
        );
    }

    #[test]
    fn test_missing_categories() {
        let data = Interactions::from(vec![
            offer("r1", "u1", "a", true),
            Interaction::new("r1", "u1", "b", false),
        ]);

        match FactorizationMachine::new(&data, Hyperparameters::new(3)) {
            Err(DataError::MissingCategories { offer_id }) => assert_eq!(offer_id, "b"),
            other => panic!("Unexpected result: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_single_step() {
        let mut model = fitted_model();
        let (lr, lambda) = (0.1, 0.01);

        let x_i = dense_features(&model, "u1", "a");
        let x_j = dense_features(&model, "u1", "b");
        let f_i = brute_force_score(&model, &x_i);
        let f_j = brute_force_score(&model, &x_j);

        let before = model.parameters.clone().unwrap();
        let first_sums_i = x_i.dot(&before.feature_factors);
        let first_sums_j = x_j.dot(&before.feature_factors);

        let margin = model.step("u1", "a", "b", lr, lambda).unwrap();
        assert!((margin - clip_margin(f_i - f_j)).abs() < 1e-5);

        let sigma = (-margin).exp() / (1.0 + (-margin).exp());
        let after = model.parameters.as_ref().unwrap();

        assert_eq!(after.bias, before.bias);

        for row in 0..model.num_features() {
            let strength = before.strengths[row]
                + lr * (sigma * (x_i[row] - x_j[row]) + lambda * before.strengths[row]);
            assert!((after.strengths[row] - strength).abs() < 1e-5);

            for f in 0..3 {
                let v = before.feature_factors[[row, f]];
                let gradient = (x_i[row] * first_sums_i[f] - v * x_i[row] * x_i[row])
                    - (x_j[row] * first_sums_j[f] - v * x_j[row] * x_j[row]);
                let factor = v + lr * (sigma * gradient + lambda * v);

                assert!((after.feature_factors[[row, f]] - factor).abs() < 1e-5);
            }
        }
    }

    #[test]
    fn test_sampler_returns_offers_never_chosen() {
        let model = FactorizationMachine::new(&two_user_data(), Hyperparameters::new(3)).unwrap();
        let partition = model.partition();
        let mut rng = XorShiftRng::seed_from_u64(3);

        // `c` is rejected in both requests and never chosen.
        assert!(partition.reduced_train().iter().all(|x| x.offer_id() != "c"));

        let samples: Vec<&str> = (0..50)
            .map(|_| model.sample_negative(partition, "r1", &mut rng).unwrap())
            .collect();

        assert!(samples.iter().all(|&x| x == "b" || x == "c"));
        assert!(samples.contains(&"c"));
        assert_eq!(
            model.sample_negative(partition, "missing", &mut rng),
            Err(SamplingError::NoNegatives {
                request_id: "missing".to_owned(),
            })
        );
    }

    #[test]
    fn test_default_snapshot_count() {
        let mut model = FactorizationMachine::new(&two_user_data(), Hyperparameters::new(3)).unwrap();
        let history = model
            .fit(&FitParameters::default().num_iterations(100))
            .unwrap();

        assert_eq!(history.snapshots().len(), 10);
        assert_eq!(history.skipped(), 0);
        assert!(history.snapshots().iter().all(|x| x.loss.is_some()));
        assert!(model.strengths().is_some());
        assert_eq!(model.bias(), Some(0.0));
    }

    #[test]
    fn test_fitting_improves_training_accuracy() {
        let mut rng = XorShiftRng::seed_from_u64(42);
        let data = datasets::synthetic(20, 12, 10, 4, &mut rng);

        let mut model =
            FactorizationMachine::new(&data, Hyperparameters::new(5).num_snapshots(2)).unwrap();
        let history = model
            .fit(
                &FitParameters::default()
                    .num_iterations(20_000)
                    .learning_rate(0.05)
                    .l2_penalty(0.0),
            )
            .unwrap();

        let accuracy = history.accuracy(Split::Train);
        let last = accuracy.last().and_then(|x| x.1).unwrap();
        assert!(last > 0.6, "Train accuracy {}", last);
    }
}
