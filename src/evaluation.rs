//! Ranking quality metrics: pairwise accuracy, Recall@k, MAP and position bias.
use std::collections::BTreeMap;

use itertools::Itertools;
use rayon::prelude::*;

use crate::data::{Partition, RequestIndex, RequestOffers, Split, UserRequests};
use crate::models::clip_margin;
use crate::{OfferId, PairwiseRankingModel, PredictionError, UserId};

/// Cutoff at which MAP and position bias are computed.
pub const MAP_CUTOFF: usize = 5;

/// Per-user metric values.
pub type UserScores = BTreeMap<UserId, f32>;

/// Metrics derived from the full ranking of every request.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RankingMetrics {
    /// Recall@k per cutoff, per user.
    pub recall: BTreeMap<usize, UserScores>,
    /// Mean average precision at [`MAP_CUTOFF`], per user.
    pub map: UserScores,
    /// Log-discounted reward for the rank of the chosen offer, per user.
    pub position_bias: UserScores,
}

impl RankingMetrics {
    /// Recall@k averaged over users.
    pub fn mean_recall(&self, k: usize) -> Option<f32> {
        self.recall.get(&k).and_then(mean)
    }

    /// MAP averaged over users.
    pub fn mean_map(&self) -> Option<f32> {
        mean(&self.map)
    }

    /// Position bias averaged over users.
    pub fn mean_position_bias(&self) -> Option<f32> {
        mean(&self.position_bias)
    }
}

/// All metrics of one split.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SplitMetrics {
    /// Pairwise accuracy; `None` when the split has no requests.
    pub accuracy: Option<f32>,
    /// Ranking metrics.
    pub ranking: RankingMetrics,
}

fn mean(scores: &UserScores) -> Option<f32> {
    if scores.is_empty() {
        None
    } else {
        Some(scores.values().sum::<f32>() / scores.len() as f32)
    }
}

fn heaviside(positive: f32, negative: f32) -> f32 {
    if positive > negative {
        1.0
    } else {
        0.0
    }
}

/// Evaluate every metric on one side of `partition`.
pub fn evaluate<T: PairwiseRankingModel + Sync>(
    model: &T,
    partition: &Partition,
    split: Split,
    recall_cutoffs: &[usize],
) -> Result<SplitMetrics, PredictionError> {
    let accuracy = pairwise_accuracy(
        model,
        partition.reduced_groups(split),
        partition.requests(),
    )?;
    let ranking = ranking_metrics(
        model,
        partition.full_groups(split),
        partition.requests(),
        recall_cutoffs,
    )?;

    Ok(SplitMetrics { accuracy, ranking })
}

/// Fraction of rejected offers scored strictly below the chosen offer.
///
/// `groups` holds the chosen offer of each request as its first offer.
/// Averaged within each request, then across requests.
pub fn pairwise_accuracy<T: PairwiseRankingModel + Sync>(
    model: &T,
    groups: &[UserRequests],
    requests: &RequestIndex,
) -> Result<Option<f32>, PredictionError> {
    let user_requests: Vec<(&str, &RequestOffers)> = groups
        .iter()
        .flat_map(|user| {
            user.requests
                .iter()
                .map(move |request| (user.user_id.as_str(), request))
        })
        .collect();

    let accuracies: Vec<f32> = user_requests
        .par_iter()
        .filter_map(|&(user_id, request)| {
            let positive = request.offers.first()?;
            let negatives = requests
                .negatives(&request.request_id)
                .filter(|x| !x.is_empty())?;

            Some(request_accuracy(model, user_id, positive, negatives))
        })
        .collect::<Result<_, _>>()?;

    if accuracies.is_empty() {
        Ok(None)
    } else {
        Ok(Some(
            accuracies.iter().sum::<f32>() / accuracies.len() as f32,
        ))
    }
}

fn request_accuracy<T: PairwiseRankingModel>(
    model: &T,
    user_id: &str,
    positive: &str,
    negatives: &[OfferId],
) -> Result<f32, PredictionError> {
    let positive_score = model.predict(user_id, positive)?;
    let mut wins = 0.0;

    for negative in negatives {
        wins += heaviside(positive_score, model.predict(user_id, negative)?);
    }

    Ok(wins / negatives.len() as f32)
}

/// Round-robin comparison of every offer pair of a request.
#[derive(Debug)]
struct Tournament<'a> {
    offers: Vec<&'a str>,
    votes: Vec<usize>,
}

impl<'a> Tournament<'a> {
    fn play<T: PairwiseRankingModel>(
        model: &T,
        user_id: &str,
        offers: &'a [OfferId],
    ) -> Result<Self, PredictionError> {
        let offers: Vec<&'a str> = offers.iter().map(|x| x.as_str()).unique().collect();
        let scores = offers
            .iter()
            .map(|offer| model.predict(user_id, offer))
            .collect::<Result<Vec<f32>, _>>()?;

        let mut votes = vec![0; offers.len()];

        for i in 0..offers.len() {
            for j in (i + 1)..offers.len() {
                // sigmoid(margin) > 0.5 exactly when margin > 0; comparing the
                // margin avoids the sigmoid rounding to 0.5 in f32.
                if clip_margin(scores[i] - scores[j]) > 0.0 {
                    votes[i] += 1;
                } else {
                    votes[j] += 1;
                }
            }
        }

        Ok(Tournament { offers, votes })
    }

    /// Offers by descending votes; equal votes fall back to offer id order.
    fn ranking(&self) -> Vec<&'a str> {
        let mut order: Vec<usize> = (0..self.offers.len()).collect();
        order.sort_by(|&a, &b| {
            self.votes[b]
                .cmp(&self.votes[a])
                .then_with(|| self.offers[a].cmp(self.offers[b]))
        });

        order.into_iter().map(|idx| self.offers[idx]).collect()
    }
}

/// 1-based rank of `offer` in `ranking`.
fn rank_of(ranking: &[&str], offer: &str) -> Option<usize> {
    ranking.iter().position(|&x| x == offer).map(|x| x + 1)
}

struct UserRanking {
    user_id: UserId,
    recall: Vec<f32>,
    map: f32,
    position_bias: f32,
}

/// Rank every request of every user by pairwise votes and score the position
/// of the chosen offer.
pub fn ranking_metrics<T: PairwiseRankingModel + Sync>(
    model: &T,
    groups: &[UserRequests],
    requests: &RequestIndex,
    recall_cutoffs: &[usize],
) -> Result<RankingMetrics, PredictionError> {
    let users: Vec<UserRanking> = groups
        .par_iter()
        .map(|user| rank_user(model, user, requests, recall_cutoffs))
        .collect::<Result<_, _>>()?;

    let mut metrics = RankingMetrics::default();

    for &k in recall_cutoffs {
        metrics.recall.insert(k, UserScores::new());
    }

    for user in users {
        for (&k, &recall) in recall_cutoffs.iter().zip(user.recall.iter()) {
            if let Some(scores) = metrics.recall.get_mut(&k) {
                scores.insert(user.user_id.clone(), recall);
            }
        }
        metrics.map.insert(user.user_id.clone(), user.map);
        metrics.position_bias.insert(user.user_id, user.position_bias);
    }

    Ok(metrics)
}

fn rank_user<T: PairwiseRankingModel>(
    model: &T,
    user: &UserRequests,
    requests: &RequestIndex,
    recall_cutoffs: &[usize],
) -> Result<UserRanking, PredictionError> {
    let mut hits = vec![0; recall_cutoffs.len()];
    let mut average_precision = 0.0;
    let mut position_bias = 0.0;

    for request in &user.requests {
        let tournament = Tournament::play(model, &user.user_id, &request.offers)?;
        let ranking = tournament.ranking();

        let rank = match requests
            .positive(&request.request_id)
            .and_then(|positive| rank_of(&ranking, positive))
        {
            Some(rank) => rank,
            None => continue,
        };

        for (hit, &k) in hits.iter_mut().zip(recall_cutoffs) {
            if rank <= k {
                *hit += 1;
            }
        }

        if rank <= MAP_CUTOFF {
            average_precision += 1.0 / rank as f32;
            position_bias += 1.0 / (1.0 + rank as f32).ln();
        }
    }

    let num_requests = user.requests.len().max(1) as f32;

    Ok(UserRanking {
        user_id: user.user_id.clone(),
        recall: hits
            .into_iter()
            .map(|hit| hit as f32 / num_requests)
            .collect(),
        map: average_precision / num_requests,
        position_bias: position_bias / num_requests,
    })
}
