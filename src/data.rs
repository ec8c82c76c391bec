//! Interaction records and the train/test partition built from them.
use std::collections::{BTreeMap, HashMap, HashSet};

use rand::seq::index;
use rand::SeedableRng;
use rand_xorshift::XorShiftRng;

use crate::{OfferId, RequestId, UserId};

/// Number of offer categories.
pub const NUM_CATEGORIES: usize = 11;

/// Offer categories produced by the feature pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Category {
    /// Short travel time.
    Quick,
    /// Low probability of delays.
    Reliable,
    /// Low price.
    Cheap,
    /// Seating quality and privacy.
    Comfortable,
    /// Door-to-door.
    D2D,
    /// Low emissions.
    #[serde(rename = "Env_Friendly")]
    EnvFriendly,
    /// Short distance and few legs.
    Short,
    /// Possible to work while travelling.
    Multitasking,
    /// Shared with other travellers.
    Social,
    /// Scenic.
    Panoramic,
    /// Walking and cycling.
    Healthy,
}

impl Category {
    /// All categories, in feature-vector order.
    pub const ALL: [Category; NUM_CATEGORIES] = [
        Category::Quick,
        Category::Reliable,
        Category::Cheap,
        Category::Comfortable,
        Category::D2D,
        Category::EnvFriendly,
        Category::Short,
        Category::Multitasking,
        Category::Social,
        Category::Panoramic,
        Category::Healthy,
    ];

    /// Column name of the category in the input table.
    pub fn name(self) -> &'static str {
        match self {
            Category::Quick => "Quick",
            Category::Reliable => "Reliable",
            Category::Cheap => "Cheap",
            Category::Comfortable => "Comfortable",
            Category::D2D => "D2D",
            Category::EnvFriendly => "Env_Friendly",
            Category::Short => "Short",
            Category::Multitasking => "Multitasking",
            Category::Social => "Social",
            Category::Panoramic => "Panoramic",
            Category::Healthy => "Healthy",
        }
    }
}

/// Category scores of a single offer, in [`Category::ALL`] order.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CategoryScores([f32; NUM_CATEGORIES]);

impl CategoryScores {
    /// Build from scores in [`Category::ALL`] order.
    pub fn new(scores: [f32; NUM_CATEGORIES]) -> Self {
        CategoryScores(scores)
    }

    /// Score of a single category.
    pub fn get(&self, category: Category) -> f32 {
        self.0[category as usize]
    }

    /// All scores.
    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }
}

/// A single offer shown for a mobility request, and whether the user chose it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Interaction {
    request_id: RequestId,
    user_id: UserId,
    offer_id: OfferId,
    selected: bool,
    categories: Option<CategoryScores>,
}

impl Interaction {
    /// Build a new interaction without category scores.
    pub fn new<R, U, O>(request_id: R, user_id: U, offer_id: O, selected: bool) -> Self
    where
        R: Into<RequestId>,
        U: Into<UserId>,
        O: Into<OfferId>,
    {
        Interaction {
            request_id: request_id.into(),
            user_id: user_id.into(),
            offer_id: offer_id.into(),
            selected,
            categories: None,
        }
    }

    /// Attach category scores.
    pub fn with_categories(mut self, categories: CategoryScores) -> Self {
        self.categories = Some(categories);
        self
    }

    /// Request identifier.
    pub fn request_id(&self) -> &str {
        &self.request_id
    }
    /// User identifier.
    pub fn user_id(&self) -> &str {
        &self.user_id
    }
    /// Offer identifier.
    pub fn offer_id(&self) -> &str {
        &self.offer_id
    }
    /// Whether the user chose this offer.
    pub fn selected(&self) -> bool {
        self.selected
    }
    /// Category scores, if present.
    pub fn categories(&self) -> Option<&CategoryScores> {
        self.categories.as_ref()
    }
}

/// Errors raised while validating and partitioning interactions.
#[derive(Debug, Fail, Clone, PartialEq)]
pub enum DataError {
    /// No interactions at all.
    #[fail(display = "The interaction table is empty.")]
    Empty,
    /// A response outside {0, 1}.
    #[fail(display = "Invalid response {} for offer {}.", response, offer_id)]
    InvalidResponse {
        /// Offer of the offending row.
        offer_id: OfferId,
        /// The response value.
        response: u8,
    },
    /// A request without exactly one chosen offer.
    #[fail(
        display = "Request {} has {} selected offers; exactly one is required.",
        request_id, count
    )]
    PositiveCount {
        /// The request.
        request_id: RequestId,
        /// Number of selected offers.
        count: usize,
    },
    /// A request without rejected offers.
    #[fail(display = "Request {} has no rejected offers.", request_id)]
    NoNegatives {
        /// The request.
        request_id: RequestId,
    },
    /// A request whose rows belong to several users.
    #[fail(display = "Request {} belongs to more than one user.", request_id)]
    MixedUsers {
        /// The request.
        request_id: RequestId,
    },
    /// An offer without category scores.
    #[fail(display = "Offer {} has no category scores.", offer_id)]
    MissingCategories {
        /// The offer.
        offer_id: OfferId,
    },
    /// An offer with some, but not all, category scores.
    #[fail(display = "Offer {} is missing the {} category score.", offer_id, category)]
    IncompleteCategories {
        /// The offer.
        offer_id: OfferId,
        /// Name of the first missing category.
        category: &'static str,
    },
    /// A construction parameter is out of range.
    #[fail(display = "Invalid value for {}: {}", name, value)]
    InvalidParameter {
        /// Parameter name.
        name: &'static str,
        /// The offending value.
        value: String,
    },
}

/// A table of interactions.
#[derive(Clone, Debug, Default)]
pub struct Interactions {
    interactions: Vec<Interaction>,
}

impl Interactions {
    /// Build an empty table.
    pub fn new() -> Self {
        Interactions {
            interactions: Vec::new(),
        }
    }

    /// Append an interaction.
    pub fn push(&mut self, interaction: Interaction) {
        self.interactions.push(interaction);
    }

    /// All interactions, in table order.
    pub fn data(&self) -> &[Interaction] {
        &self.interactions
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.interactions.len()
    }

    /// Whether the table has no rows.
    pub fn is_empty(&self) -> bool {
        self.interactions.is_empty()
    }

    /// Number of distinct users.
    pub fn num_users(&self) -> usize {
        self.interactions
            .iter()
            .map(|x| x.user_id())
            .collect::<HashSet<_>>()
            .len()
    }

    /// Number of distinct requests.
    pub fn num_requests(&self) -> usize {
        self.interactions
            .iter()
            .map(|x| x.request_id())
            .collect::<HashSet<_>>()
            .len()
    }
}

impl From<Vec<Interaction>> for Interactions {
    fn from(interactions: Vec<Interaction>) -> Interactions {
        Interactions { interactions }
    }
}

/// The user and offers of a validated request.
#[derive(Clone, Debug)]
pub struct RequestEntry {
    user_id: UserId,
    positive: OfferId,
    negatives: Vec<OfferId>,
}

impl RequestEntry {
    /// The user who made the request.
    pub fn user_id(&self) -> &str {
        &self.user_id
    }
    /// The chosen offer.
    pub fn positive(&self) -> &str {
        &self.positive
    }
    /// The rejected offers, in table order.
    pub fn negatives(&self) -> &[OfferId] {
        &self.negatives
    }
}

/// Lookup from request to its chosen and rejected offers.
#[derive(Clone, Debug, Default)]
pub struct RequestIndex {
    requests: HashMap<RequestId, RequestEntry>,
}

impl RequestIndex {
    /// Group and validate the rows of `interactions` by request.
    pub fn new(interactions: &[Interaction]) -> Result<Self, DataError> {
        let mut grouped: HashMap<&str, Vec<&Interaction>> = HashMap::new();
        let mut order = Vec::new();

        for interaction in interactions {
            grouped
                .entry(interaction.request_id())
                .or_insert_with(|| {
                    order.push(interaction.request_id());
                    Vec::new()
                })
                .push(interaction);
        }

        let mut requests = HashMap::with_capacity(order.len());

        for request_id in order {
            let rows = &grouped[request_id];
            let user_id = rows[0].user_id();

            if rows.iter().any(|row| row.user_id() != user_id) {
                return Err(DataError::MixedUsers {
                    request_id: request_id.to_owned(),
                });
            }

            let (positives, negatives): (Vec<&Interaction>, Vec<&Interaction>) =
                rows.iter().copied().partition(|row| row.selected());

            if positives.len() != 1 {
                return Err(DataError::PositiveCount {
                    request_id: request_id.to_owned(),
                    count: positives.len(),
                });
            }
            if negatives.is_empty() {
                return Err(DataError::NoNegatives {
                    request_id: request_id.to_owned(),
                });
            }

            requests.insert(
                request_id.to_owned(),
                RequestEntry {
                    user_id: user_id.to_owned(),
                    positive: positives[0].offer_id().to_owned(),
                    negatives: negatives.iter().map(|x| x.offer_id().to_owned()).collect(),
                },
            );
        }

        Ok(RequestIndex { requests })
    }

    /// Look up a request.
    pub fn get(&self, request_id: &str) -> Option<&RequestEntry> {
        self.requests.get(request_id)
    }

    /// The chosen offer of a request.
    pub fn positive(&self, request_id: &str) -> Option<&str> {
        self.get(request_id).map(|x| x.positive())
    }

    /// The rejected offers of a request.
    pub fn negatives(&self, request_id: &str) -> Option<&[OfferId]> {
        self.get(request_id).map(|x| x.negatives())
    }

    /// Number of requests.
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    /// Whether there are no requests.
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

/// The offers of one request, in table order.
#[derive(Clone, Debug, PartialEq)]
pub struct RequestOffers {
    /// Request identifier.
    pub request_id: RequestId,
    /// Offers of the request.
    pub offers: Vec<OfferId>,
}

/// All requests of one user.
#[derive(Clone, Debug, PartialEq)]
pub struct UserRequests {
    /// User identifier.
    pub user_id: UserId,
    /// Requests, in order of first appearance.
    pub requests: Vec<RequestOffers>,
}

/// Group rows by user (sorted) and then by request (first appearance).
pub fn group_by_user(interactions: &[Interaction]) -> Vec<UserRequests> {
    let mut users: BTreeMap<&str, Vec<RequestOffers>> = BTreeMap::new();
    let mut positions: HashMap<(&str, &str), usize> = HashMap::new();

    for interaction in interactions {
        let requests = users.entry(interaction.user_id()).or_insert_with(Vec::new);
        let key = (interaction.user_id(), interaction.request_id());

        let position = *positions.entry(key).or_insert_with(|| {
            requests.push(RequestOffers {
                request_id: interaction.request_id().to_owned(),
                offers: Vec::new(),
            });
            requests.len() - 1
        });

        requests[position]
            .offers
            .push(interaction.offer_id().to_owned());
    }

    users
        .into_iter()
        .map(|(user_id, requests)| UserRequests {
            user_id: user_id.to_owned(),
            requests,
        })
        .collect()
}

/// One side of the partition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Split {
    /// Training data.
    Train,
    /// Held-out data.
    Test,
}

/// Number of positives a user needs before any are held out.
const MIN_POSITIVES_FOR_TEST: usize = 3;

/// Partition of the interaction table into positives, negatives, and
/// per-user train/test splits.
///
/// The `reduced` splits only hold the chosen offers; the full splits hold
/// every offer of the requests in the corresponding reduced split.
#[derive(Clone, Debug)]
pub struct Partition {
    positive: Vec<Interaction>,
    negative: Vec<Interaction>,
    reduced_train: Vec<Interaction>,
    reduced_test: Vec<Interaction>,
    train: Vec<Interaction>,
    test: Vec<Interaction>,
    requests: RequestIndex,
    reduced_train_groups: Vec<UserRequests>,
    reduced_test_groups: Vec<UserRequests>,
    train_groups: Vec<UserRequests>,
    test_groups: Vec<UserRequests>,
}

impl Partition {
    /// Validate `interactions` and split them.
    ///
    /// Every user with more than two chosen offers has
    /// `ceil(test_fraction * n)` of them, sampled without replacement,
    /// moved to the test split. The sample only depends on `seed`.
    pub fn new(
        interactions: &Interactions,
        test_fraction: f64,
        seed: u64,
    ) -> Result<Self, DataError> {
        if !(test_fraction > 0.0 && test_fraction < 1.0) {
            return Err(DataError::InvalidParameter {
                name: "test_fraction",
                value: test_fraction.to_string(),
            });
        }
        let requests = RequestIndex::new(interactions.data())?;

        if requests.is_empty() {
            return Err(DataError::Empty);
        }

        let (positive, negative): (Vec<Interaction>, Vec<Interaction>) = interactions
            .data()
            .iter()
            .cloned()
            .partition(|x| x.selected());

        let mut by_user: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
        for (row, interaction) in positive.iter().enumerate() {
            by_user
                .entry(interaction.user_id())
                .or_insert_with(Vec::new)
                .push(row);
        }

        let mut rng = XorShiftRng::seed_from_u64(seed);
        let mut is_test = vec![false; positive.len()];

        for rows in by_user.values() {
            if rows.len() < MIN_POSITIVES_FOR_TEST {
                continue;
            }

            let num_test = test_size(test_fraction, rows.len());

            for sampled in index::sample(&mut rng, rows.len(), num_test).into_iter() {
                is_test[rows[sampled]] = true;
            }
        }

        let (reduced_test, reduced_train): (Vec<_>, Vec<_>) = positive
            .iter()
            .zip(is_test.iter())
            .partition(|&(_, &test)| test);
        let reduced_train: Vec<Interaction> =
            reduced_train.into_iter().map(|(x, _)| x.clone()).collect();
        let reduced_test: Vec<Interaction> =
            reduced_test.into_iter().map(|(x, _)| x.clone()).collect();

        let train = expand_requests(interactions.data(), &reduced_train);
        let test = expand_requests(interactions.data(), &reduced_test);

        if reduced_test.is_empty() {
            warn!("No user has enough chosen offers for a test split.");
        }

        Ok(Partition {
            reduced_train_groups: group_by_user(&reduced_train),
            reduced_test_groups: group_by_user(&reduced_test),
            train_groups: group_by_user(&train),
            test_groups: group_by_user(&test),
            positive,
            negative,
            reduced_train,
            reduced_test,
            train,
            test,
            requests,
        })
    }

    /// All chosen offers.
    pub fn positive(&self) -> &[Interaction] {
        &self.positive
    }
    /// All rejected offers.
    pub fn negative(&self) -> &[Interaction] {
        &self.negative
    }
    /// Chosen offers used for training.
    pub fn reduced_train(&self) -> &[Interaction] {
        &self.reduced_train
    }
    /// Chosen offers held out for testing.
    pub fn reduced_test(&self) -> &[Interaction] {
        &self.reduced_test
    }
    /// Every offer of the training requests.
    pub fn train(&self) -> &[Interaction] {
        &self.train
    }
    /// Every offer of the test requests.
    pub fn test(&self) -> &[Interaction] {
        &self.test
    }
    /// Request lookups over the whole table.
    pub fn requests(&self) -> &RequestIndex {
        &self.requests
    }

    /// Chosen offers of a split, grouped by user and request.
    pub fn reduced_groups(&self, split: Split) -> &[UserRequests] {
        match split {
            Split::Train => &self.reduced_train_groups,
            Split::Test => &self.reduced_test_groups,
        }
    }

    /// Every offer of a split, grouped by user and request.
    pub fn full_groups(&self, split: Split) -> &[UserRequests] {
        match split {
            Split::Train => &self.train_groups,
            Split::Test => &self.test_groups,
        }
    }
}

fn test_size(test_fraction: f64, num_positives: usize) -> usize {
    (test_fraction * num_positives as f64).ceil() as usize
}

fn expand_requests(all: &[Interaction], reduced: &[Interaction]) -> Vec<Interaction> {
    let request_ids: HashSet<&str> = reduced.iter().map(|x| x.request_id()).collect();

    all.iter()
        .filter(|x| request_ids.contains(x.request_id()))
        .cloned()
        .collect()
}
