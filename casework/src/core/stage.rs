//! Stage transition rules.
//!
//! A document moves forward exactly one stage at a time. Regression, repeats,
//! and skipping stages are rejected before any file is touched.

use crate::core::types::Stage;

/// Why a requested stage transition is not allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionViolation {
    AlreadyInStage,
    Regression,
    Skip { expected: Stage },
}

impl TransitionViolation {
    pub fn describe(&self) -> String {
        match self {
            TransitionViolation::AlreadyInStage => "document is already in that stage".to_string(),
            TransitionViolation::Regression => "stage regression is not allowed".to_string(),
            TransitionViolation::Skip { expected } => {
                format!("stage skipping is not allowed (next stage is {expected})")
            }
        }
    }
}

/// Check a transition from `from` to `to`.
pub fn check_transition(from: Stage, to: Stage) -> Result<(), TransitionViolation> {
    if from == to {
        return Err(TransitionViolation::AlreadyInStage);
    }
    if to < from {
        return Err(TransitionViolation::Regression);
    }
    match from.next() {
        Some(expected) if expected == to => Ok(()),
        Some(expected) => Err(TransitionViolation::Skip { expected }),
        // Processed has no successor, and nothing orders after it.
        None => Err(TransitionViolation::Regression),
    }
}
