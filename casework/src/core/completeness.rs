//! Case-completeness scoring.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::core::types::DocumentCategory;

/// Fraction of required categories covered by successfully classified documents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completeness {
    pub score: f64,
    pub present: Vec<DocumentCategory>,
    pub missing: Vec<DocumentCategory>,
}

impl Completeness {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty() && !self.present.is_empty()
    }
}

/// Compute completeness from the categories of successfully classified documents.
///
/// `Unknown` never counts toward a requirement. An empty case, or an empty
/// requirement list, scores 0.
pub fn case_completeness<I>(required: &[DocumentCategory], classified: I) -> Completeness
where
    I: IntoIterator<Item = DocumentCategory>,
{
    let found: BTreeSet<DocumentCategory> = classified
        .into_iter()
        .filter(|category| *category != DocumentCategory::Unknown)
        .collect();
    let required: BTreeSet<DocumentCategory> = required.iter().copied().collect();

    let (present, missing): (Vec<_>, Vec<_>) =
        required.iter().copied().partition(|c| found.contains(c));

    let score = if required.is_empty() {
        0.0
    } else {
        present.len() as f64 / required.len() as f64
    };

    Completeness {
        score,
        present,
        missing,
    }
}
