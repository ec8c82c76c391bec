//! Loading interaction tables, and generating synthetic ones for testing and
//! experimentation.
#[cfg(feature = "csv")]
use std::fs::File;
#[cfg(feature = "csv")]
use std::io::Read;
#[cfg(feature = "csv")]
use std::path::Path;

use itertools::Itertools;
use rand::seq::index;
use rand::Rng;

#[cfg(feature = "csv")]
use crate::data::{Category, DataError};
use crate::data::{CategoryScores, Interaction, Interactions, NUM_CATEGORIES};

/// One row of the input table.
#[cfg(feature = "csv")]
#[derive(Debug, Deserialize)]
struct Record {
    request_id: String,
    user_id: String,
    #[serde(alias = "id")]
    offer_id: String,
    #[serde(rename = "Response")]
    response: u8,
    #[serde(rename = "Quick")]
    quick: Option<f32>,
    #[serde(rename = "Reliable")]
    reliable: Option<f32>,
    #[serde(rename = "Cheap")]
    cheap: Option<f32>,
    #[serde(rename = "Comfortable")]
    comfortable: Option<f32>,
    #[serde(rename = "D2D")]
    d2d: Option<f32>,
    #[serde(rename = "Env_Friendly")]
    env_friendly: Option<f32>,
    #[serde(rename = "Short")]
    short: Option<f32>,
    #[serde(rename = "Multitasking")]
    multitasking: Option<f32>,
    #[serde(rename = "Social")]
    social: Option<f32>,
    #[serde(rename = "Panoramic")]
    panoramic: Option<f32>,
    #[serde(rename = "Healthy")]
    healthy: Option<f32>,
}

#[cfg(feature = "csv")]
impl Record {
    fn categories(&self) -> Result<Option<CategoryScores>, DataError> {
        let values = [
            self.quick,
            self.reliable,
            self.cheap,
            self.comfortable,
            self.d2d,
            self.env_friendly,
            self.short,
            self.multitasking,
            self.social,
            self.panoramic,
            self.healthy,
        ];

        if values.iter().all(|x| x.is_none()) {
            return Ok(None);
        }

        let mut scores = [0.0; NUM_CATEGORIES];
        for (score, (value, category)) in scores
            .iter_mut()
            .zip(values.iter().zip(Category::ALL.iter()))
        {
            *score = value.ok_or_else(|| DataError::IncompleteCategories {
                offer_id: self.offer_id.clone(),
                category: category.name(),
            })?;
        }

        Ok(Some(CategoryScores::new(scores)))
    }

    fn into_interaction(self) -> Result<Interaction, DataError> {
        let selected = match self.response {
            0 => false,
            1 => true,
            response => {
                return Err(DataError::InvalidResponse {
                    offer_id: self.offer_id,
                    response,
                })
            }
        };
        let categories = self.categories()?;

        let interaction = Interaction::new(self.request_id, self.user_id, self.offer_id, selected);

        Ok(match categories {
            Some(categories) => interaction.with_categories(categories),
            None => interaction,
        })
    }
}

/// Read an interaction table from CSV.
///
/// The table needs `request_id`, `user_id`, `offer_id` (or `id`) and
/// `Response` columns. The eleven category columns are optional, but a row
/// that fills some of them must fill all of them.
#[cfg(feature = "csv")]
pub fn from_reader<R: Read>(reader: R) -> Result<Interactions, failure::Error> {
    let mut reader = csv::Reader::from_reader(reader);
    let mut interactions = Interactions::new();

    for record in reader.deserialize() {
        let record: Record = record?;
        interactions.push(record.into_interaction()?);
    }

    info!(
        "Read {} interactions from {} requests of {} users.",
        interactions.len(),
        interactions.num_requests(),
        interactions.num_users()
    );

    Ok(interactions)
}

/// Read an interaction table from a CSV file.
#[cfg(feature = "csv")]
pub fn load_csv<P: AsRef<Path>>(path: P) -> Result<Interactions, failure::Error> {
    from_reader(File::open(path)?)
}

/// Generate a random interaction table.
///
/// Each of `num_items` catalogue items gets random category scores, and each
/// user a hidden preference over the categories, drawn around a preference
/// shared by everybody. Every request shows `offers_per_request` distinct
/// items and the user chooses the one they like best.
///
/// Offers per request are clamped to `[2, num_items]`; with fewer than two
/// items the table is empty.
pub fn synthetic<R: Rng>(
    num_users: usize,
    num_items: usize,
    requests_per_user: usize,
    offers_per_request: usize,
    rng: &mut R,
) -> Interactions {
    let mut interactions = Interactions::new();

    if num_items < 2 {
        return interactions;
    }

    let offers_per_request = offers_per_request.max(2).min(num_items);

    let catalogue: Vec<[f32; NUM_CATEGORIES]> = (0..num_items)
        .map(|_| {
            let mut scores = [0.0; NUM_CATEGORIES];
            for score in scores.iter_mut() {
                *score = rng.gen::<f32>();
            }
            scores
        })
        .collect();

    let mut shared = [0.0; NUM_CATEGORIES];
    for weight in shared.iter_mut() {
        *weight = rng.gen_range(-1.0..1.0);
    }

    for user in 0..num_users {
        let user_id = format!("user-{}", user);

        let mut preference = shared;
        for weight in preference.iter_mut() {
            *weight += rng.gen_range(-0.5..0.5);
        }

        for request in 0..requests_per_user {
            let request_id = format!("{}-request-{}", user_id, request);
            let offers = index::sample(rng, num_items, offers_per_request).into_vec();

            let utility = |item: usize| -> f32 {
                preference
                    .iter()
                    .zip(catalogue[item].iter())
                    .map(|(weight, score)| weight * score)
                    .sum()
            };

            let chosen = offers
                .iter()
                .position_max_by(|&&a, &&b| {
                    utility(a)
                        .partial_cmp(&utility(b))
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .unwrap_or(0);

            for (position, &item) in offers.iter().enumerate() {
                interactions.push(
                    Interaction::new(
                        request_id.clone(),
                        user_id.clone(),
                        format!("item-{}", item),
                        position == chosen,
                    )
                    .with_categories(CategoryScores::new(catalogue[item])),
                );
            }
        }
    }

    interactions
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_xorshift::XorShiftRng;

    use super::*;
    use crate::data::Partition;

    #[test]
    fn test_synthetic_is_valid() {
        let mut rng = XorShiftRng::seed_from_u64(42);
        let data = synthetic(5, 10, 4, 3, &mut rng);

        assert_eq!(data.len(), 5 * 4 * 3);
        assert_eq!(data.num_users(), 5);
        assert_eq!(data.num_requests(), 20);
        assert_eq!(data.data().iter().filter(|x| x.selected()).count(), 20);
        assert!(data.data().iter().all(|x| x.categories().is_some()));

        let partition = Partition::new(&data, 0.25, 42).unwrap();
        assert_eq!(partition.reduced_test().len(), 5);
    }

    #[test]
    fn test_synthetic_is_reproducible() {
        let first = synthetic(3, 8, 2, 4, &mut XorShiftRng::seed_from_u64(1));
        let second = synthetic(3, 8, 2, 4, &mut XorShiftRng::seed_from_u64(1));

        assert_eq!(first.data(), second.data());
        assert!(synthetic(3, 1, 2, 4, &mut XorShiftRng::seed_from_u64(1)).is_empty());
    }

    #[cfg(feature = "csv")]
    const HEADER: &str = "request_id,user_id,id,Response,Quick,Reliable,Cheap,Comfortable,\
                          D2D,Env_Friendly,Short,Multitasking,Social,Panoramic,Healthy\n";

    #[cfg(feature = "csv")]
    #[test]
    fn test_read_csv_with_categories() {
        let csv = format!(
            "{}{}{}",
            HEADER,
            "r1,7,o1,1,0.1,0.2,0.3,0.4,0.5,0.6,0.7,0.8,0.9,1.0,0.0\n",
            "r1,7,o2,0,1,1,1,1,1,1,1,1,1,1,1\n"
        );
        let data = from_reader(csv.as_bytes()).unwrap();

        assert_eq!(data.len(), 2);

        let first = &data.data()[0];
        assert_eq!(first.request_id(), "r1");
        assert_eq!(first.user_id(), "7");
        assert_eq!(first.offer_id(), "o1");
        assert!(first.selected());
        assert_eq!(first.categories().unwrap().get(Category::Cheap), 0.3);
        assert_eq!(first.categories().unwrap().get(Category::Healthy), 0.0);
        assert!(!data.data()[1].selected());
    }

    #[cfg(feature = "csv")]
    #[test]
    fn test_read_csv_without_categories() {
        let csv = "request_id,user_id,offer_id,Response\nr1,u1,o1,1\nr1,u1,o2,0\n";
        let data = from_reader(csv.as_bytes()).unwrap();

        assert_eq!(data.len(), 2);
        assert!(data.data().iter().all(|x| x.categories().is_none()));
    }

    #[cfg(feature = "csv")]
    #[test]
    fn test_read_csv_rejects_bad_rows() {
        let partial = format!("{}{}", HEADER, "r1,u1,o1,1,0.1,0.2,,,,,,,,,\n");
        let error = from_reader(partial.as_bytes()).unwrap_err();
        assert_eq!(
            error.downcast::<DataError>().unwrap(),
            DataError::IncompleteCategories {
                offer_id: "o1".to_owned(),
                category: "Cheap",
            }
        );

        let response = "request_id,user_id,offer_id,Response\nr1,u1,o1,2\n";
        let error = from_reader(response.as_bytes()).unwrap_err();
        assert_eq!(
            error.downcast::<DataError>().unwrap(),
            DataError::InvalidResponse {
                offer_id: "o1".to_owned(),
                response: 2,
            }
        );
    }
}
