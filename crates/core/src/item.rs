//! Content items and the enrichment records attached to them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::ItemId;

/// Embedding of a content item.
///
/// Written once by the vectorizer and immutable afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vector {
    pub item_id: ItemId,
    pub data: Vec<f32>,
}

impl Vector {
    pub fn new(item_id: ItemId, data: Vec<f32>) -> Self {
        Self { item_id, data }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn dimension(&self) -> usize {
        self.data.len()
    }
}

/// Near-duplicate verdict for a content item.
///
/// - no record: detection has not run yet
/// - `parent_id == None`: detection ran and found no qualifying neighbor
/// - `parent_id == Some(p)`: the item is a near duplicate of `p`, and `p < item_id`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityInfo {
    pub item_id: ItemId,
    pub parent_id: Option<ItemId>,
    pub distance: Option<f32>,
}

impl SimilarityInfo {
    /// Verdict pointing at an older item.
    ///
    /// Parents must have a strictly smaller id so that similarity edges form a DAG.
    pub fn with_parent(item_id: ItemId, parent_id: ItemId, distance: f32) -> DomainResult<Self> {
        if parent_id >= item_id {
            return Err(DomainError::invariant(format!(
                "similarity parent {parent_id} must be older than item {item_id}"
            )));
        }
        if !distance.is_finite() {
            return Err(DomainError::validation(format!(
                "similarity distance must be finite, got {distance}"
            )));
        }
        Ok(Self {
            item_id,
            parent_id: Some(parent_id),
            distance: Some(distance),
        })
    }

    /// Verdict for an item with no qualifying neighbor.
    pub fn without_parent(item_id: ItemId) -> Self {
        Self {
            item_id,
            parent_id: None,
            distance: None,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        self.parent_id.is_some()
    }
}

/// A content item as loaded for enrichment, with its associations preloaded.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentItem {
    pub id: ItemId,
    pub publish_date: DateTime<Utc>,
    pub vector: Option<Vector>,
    pub similarity: Option<SimilarityInfo>,
}

impl ContentItem {
    pub fn new(id: ItemId, publish_date: DateTime<Utc>) -> Self {
        Self {
            id,
            publish_date,
            vector: None,
            similarity: None,
        }
    }

    pub fn with_vector(mut self, data: Vec<f32>) -> Self {
        self.vector = Some(Vector::new(self.id, data));
        self
    }

    pub fn with_similarity(mut self, similarity: SimilarityInfo) -> Self {
        self.similarity = Some(similarity);
        self
    }

    /// The vector, if present and non-empty.
    pub fn usable_vector(&self) -> Option<&Vector> {
        self.vector.as_ref().filter(|v| !v.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn parent_must_be_older() {
        let err = SimilarityInfo::with_parent(ItemId::new(5), ItemId::new(5), 0.1).unwrap_err();
        assert!(matches!(err, DomainError::InvariantViolation(_)));

        let err = SimilarityInfo::with_parent(ItemId::new(5), ItemId::new(6), 0.1).unwrap_err();
        assert!(matches!(err, DomainError::InvariantViolation(_)));

        let info = SimilarityInfo::with_parent(ItemId::new(5), ItemId::new(4), 0.1).unwrap();
        assert!(info.is_duplicate());
        assert_eq!(info.parent_id, Some(ItemId::new(4)));
    }

    #[test]
    fn rejects_non_finite_distance() {
        let err =
            SimilarityInfo::with_parent(ItemId::new(5), ItemId::new(4), f32::NAN).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn empty_vector_is_not_usable() {
        let at = Utc.with_ymd_and_hms(2000, 2, 1, 12, 0, 0).unwrap();
        let item = ContentItem::new(ItemId::new(1), at).with_vector(vec![]);
        assert!(item.usable_vector().is_none());

        let item = ContentItem::new(ItemId::new(1), at).with_vector(vec![0.5, 0.5]);
        assert_eq!(item.usable_vector().map(Vector::dimension), Some(2));
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig {
                cases: 256,
                ..ProptestConfig::default()
            })]

            /// Property: a verdict can never point at a newer or equal item,
            /// so two items can never mark each other as parent.
            #[test]
            fn verdicts_are_asymmetric(a in 1i64..10_000, b in 1i64..10_000) {
                let ab = SimilarityInfo::with_parent(ItemId::new(a), ItemId::new(b), 0.1);
                let ba = SimilarityInfo::with_parent(ItemId::new(b), ItemId::new(a), 0.1);
                prop_assert!(!(ab.is_ok() && ba.is_ok()));
                prop_assert_eq!(ab.is_ok(), b < a);
            }
        }
    }
}
