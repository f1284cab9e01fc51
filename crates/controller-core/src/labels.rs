//! Label-filter and release-type predicates.

use std::collections::{HashMap, HashSet};

use crate::types::ReleaseType;

/// One conjunctive filter group: every `(key, value)` pair must be present
/// in the entity's labels.
pub type LabelFilter = HashMap<String, String>;

/// Evaluates a disjunction of conjunctive filter groups.
///
/// An entity matches if it matches any group; an empty filter list accepts
/// every entity.
#[must_use]
pub fn match_label_filters(labels: &HashMap<String, String>, filters: &[LabelFilter]) -> bool {
    if filters.is_empty() {
        return true;
    }
    filters.iter().any(|group| {
        group
            .iter()
            .all(|(key, value)| labels.get(key) == Some(value))
    })
}

/// Membership matcher over release types.
#[derive(Debug, Clone)]
pub struct ReleaseTypeMatcher {
    types: HashSet<ReleaseType>,
}

impl ReleaseTypeMatcher {
    /// An empty set (or a set containing [`ReleaseType::Any`]) matches all.
    #[must_use]
    pub fn new(types: impl IntoIterator<Item = ReleaseType>) -> Self {
        Self {
            types: types.into_iter().collect(),
        }
    }

    /// Whether `release_type` passes the filter.
    #[must_use]
    pub fn matches(&self, release_type: ReleaseType) -> bool {
        self.types.is_empty()
            || self.types.contains(&ReleaseType::Any)
            || self.types.contains(&release_type)
    }
}
