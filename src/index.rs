//! Lookups from identifiers to parameter rows.
use std::collections::HashMap;

use ndarray::{Array2, ArrayView1};

use crate::data::{DataError, Interaction, NUM_CATEGORIES};

/// Dense indices `0..n` for a set of identifiers, assigned in sorted order.
#[derive(Clone, Debug, Default)]
pub struct IdIndex {
    positions: HashMap<String, usize>,
}

impl IdIndex {
    /// Index the distinct values of `ids`.
    pub fn new<'a, I: IntoIterator<Item = &'a str>>(ids: I) -> Self {
        let mut ids: Vec<String> = ids.into_iter().map(|x| x.to_owned()).collect();
        ids.sort();
        ids.dedup();

        let positions = ids
            .into_iter()
            .enumerate()
            .map(|(idx, id)| (id, idx))
            .collect();

        IdIndex { positions }
    }

    /// Index of `id`, if present.
    pub fn get(&self, id: &str) -> Option<usize> {
        self.positions.get(id).cloned()
    }

    /// Number of indexed identifiers.
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    /// Whether nothing is indexed.
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

/// Category scores of every offer in the table, one row per offer.
///
/// When an offer id appears more than once its first row is kept.
#[derive(Clone, Debug)]
pub struct OfferFeatures {
    rows: HashMap<String, usize>,
    values: Array2<f32>,
}

impl OfferFeatures {
    /// Collect category rows, failing on any offer without scores.
    pub fn new(interactions: &[Interaction]) -> Result<Self, DataError> {
        let mut rows = HashMap::new();
        let mut values = Vec::new();

        for interaction in interactions {
            if rows.contains_key(interaction.offer_id()) {
                continue;
            }

            let scores = interaction
                .categories()
                .ok_or_else(|| DataError::MissingCategories {
                    offer_id: interaction.offer_id().to_owned(),
                })?;

            let row = rows.len();
            rows.insert(interaction.offer_id().to_owned(), row);
            values.extend_from_slice(scores.as_slice());
        }

        let values = Array2::from_shape_vec((rows.len(), NUM_CATEGORIES), values)
            .map_err(|err| DataError::InvalidParameter {
                name: "category scores",
                value: err.to_string(),
            })?;

        Ok(OfferFeatures { rows, values })
    }

    /// Row of `offer_id`, if present.
    pub fn get(&self, offer_id: &str) -> Option<usize> {
        self.rows.get(offer_id).cloned()
    }

    /// Category scores stored at `row`.
    pub fn row(&self, row: usize) -> ArrayView1<f32> {
        self.values.row(row)
    }

    /// Number of offers.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether there are no offers.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::CategoryScores;

    #[test]
    fn test_sorted_indices() {
        let index = IdIndex::new(vec!["b", "c", "a", "b"]);

        assert_eq!(index.len(), 3);
        assert_eq!(index.get("a"), Some(0));
        assert_eq!(index.get("c"), Some(2));
        assert_eq!(index.get("b"), Some(1));
        assert_eq!(index.get("d"), None);
    }

    #[test]
    fn test_offer_features_keep_first_row() {
        let mut first = [0.0; NUM_CATEGORIES];
        first[0] = 1.0;
        let mut second = [0.0; NUM_CATEGORIES];
        second[0] = 2.0;

        let rows = vec![
            Interaction::new("r1", "u", "o", true).with_categories(CategoryScores::new(first)),
            Interaction::new("r2", "u", "o", true).with_categories(CategoryScores::new(second)),
            Interaction::new("r2", "u", "p", false).with_categories(CategoryScores::new(second)),
        ];
        let features = OfferFeatures::new(&rows).unwrap();

        assert_eq!(features.len(), 2);
        assert_eq!(features.row(features.get("o").unwrap())[0], 1.0);
        assert_eq!(features.row(features.get("p").unwrap())[0], 2.0);
        assert!(features.get("q").is_none());
    }

    #[test]
    fn test_offer_features_require_categories() {
        let rows = vec![Interaction::new("r", "u", "o", true)];

        assert_eq!(
            OfferFeatures::new(&rows).unwrap_err(),
            DataError::MissingCategories {
                offer_id: "o".to_owned(),
            }
        );
    }
}
