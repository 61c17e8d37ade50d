//! Structured recovery for deterministic resolution failures.
//!
//! A failed resolution step is packaged as an [`ActionFailure`] and handed to
//! the reasoning layer, which picks a corrective action, asks the caller a
//! question, or reports the failure. Corrective attempts are bounded.

use anyhow::Result;
use minijinja::context;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{info, instrument, warn};

use crate::blackboard::{Blackboard, HistoryEntry, HistoryKind};
use crate::core::types::ErrorKind;
use crate::io::prompt::Template;
use crate::io::structured::{CallSite, Consultant};

pub const FEEDBACK_SITE: CallSite = CallSite {
    name: "feedback.decide",
    schema: include_str!("../schemas/feedback_decision.schema.json"),
};

pub const ACTION_FAILED: &str = "action_failed";

const FEEDBACK: &str = "feedback";

/// An operation the session can run to repair its own state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "op", content = "arg", rename_all = "snake_case")]
pub enum Corrective {
    SwitchCase(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SuggestedAction {
    pub name: String,
    pub description: String,
    /// Present when the session can run this action itself.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub corrective: Option<Corrective>,
}

impl SuggestedAction {
    pub fn corrective(name: &str, description: impl Into<String>, corrective: Corrective) -> Self {
        Self {
            name: name.to_string(),
            description: description.into(),
            corrective: Some(corrective),
        }
    }

    pub fn advice(name: &str, description: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            description: description.into(),
            corrective: None,
        }
    }
}

/// The `action_failed` record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionFailure {
    #[serde(rename = "type")]
    pub record_type: &'static str,
    pub what_failed: String,
    pub why_failed: String,
    pub error_kind: ErrorKind,
    pub current_state: Value,
    pub suggested_next_actions: Vec<SuggestedAction>,
}

impl ActionFailure {
    pub fn new(
        what_failed: impl Into<String>,
        why_failed: impl Into<String>,
        error_kind: ErrorKind,
        current_state: Value,
        suggested_next_actions: Vec<SuggestedAction>,
    ) -> Self {
        Self {
            record_type: ACTION_FAILED,
            what_failed: what_failed.into(),
            why_failed: why_failed.into(),
            error_kind,
            current_state,
            suggested_next_actions,
        }
    }

    fn first_corrective(&self) -> Option<&SuggestedAction> {
        self.suggested_next_actions
            .iter()
            .find(|action| action.corrective.is_some())
    }

    fn action_named(&self, name: &str) -> Option<&SuggestedAction> {
        self.suggested_next_actions
            .iter()
            .find(|action| action.name == name && action.corrective.is_some())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedbackResponse {
    Corrective,
    Disambiguate,
    Report,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackDecision {
    pub response: FeedbackResponse,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub question: Option<String>,
    #[serde(default)]
    pub reason: String,
}

impl FeedbackDecision {
    /// Run the first runnable suggestion, otherwise report.
    fn fallback(failure: &ActionFailure) -> Self {
        match failure.first_corrective() {
            Some(action) => Self {
                response: FeedbackResponse::Corrective,
                action: Some(action.name.clone()),
                question: None,
                reason: "first runnable suggestion".to_string(),
            },
            None => Self {
                response: FeedbackResponse::Report,
                action: None,
                question: None,
                reason: "no runnable suggestion".to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FeedbackOutcome<T> {
    Resolved {
        value: T,
        corrections: Vec<String>,
    },
    NeedsInput {
        question: String,
        failure: ActionFailure,
        trail: Vec<String>,
    },
    Failed {
        failure: ActionFailure,
        trail: Vec<String>,
    },
}

pub struct FeedbackLoop<'a> {
    consultant: &'a Consultant<'a>,
    max_attempts: u32,
}

impl<'a> FeedbackLoop<'a> {
    pub fn new(consultant: &'a Consultant<'a>, max_attempts: u32) -> Self {
        Self {
            consultant,
            max_attempts,
        }
    }

    fn decide(&self, request: &str, failure: &ActionFailure, trail: &[String]) -> FeedbackDecision {
        let decided = self.consultant.ask(
            &FEEDBACK_SITE,
            Template::FeedbackDecision,
            context! {
                request => request,
                failure => failure,
                trail => trail,
                schema => FEEDBACK_SITE.schema,
            },
            || FeedbackDecision::fallback(failure),
        );
        let decision = decided.value;
        if decision.response == FeedbackResponse::Corrective
            && decision
                .action
                .as_deref()
                .and_then(|name| failure.action_named(name))
                .is_none()
        {
            warn!(action = ?decision.action, "feedback chose an unknown action");
            return FeedbackDecision::fallback(failure);
        }
        decision
    }

    /// Run `attempt`, repairing `state` with `correct` between failures.
    ///
    /// Every failure is written to `board` history before it is acted on.
    #[instrument(skip_all)]
    pub fn resolve<S, T>(
        &self,
        request: &str,
        board: &mut Blackboard,
        state: &mut S,
        mut attempt: impl FnMut(&mut S) -> Result<T, ActionFailure>,
        mut correct: impl FnMut(&mut S, &Corrective) -> Result<()>,
    ) -> FeedbackOutcome<T> {
        let mut trail: Vec<String> = Vec::new();
        let mut corrections: Vec<String> = Vec::new();
        loop {
            let failure = match attempt(state) {
                Ok(value) => return FeedbackOutcome::Resolved { value, corrections },
                Err(failure) => failure,
            };
            board.record_event(HistoryEntry::new(
                HistoryKind::Event,
                FEEDBACK,
                ACTION_FAILED,
                failure.error_kind.as_str(),
                json!(failure),
            ));
            trail.push(format!("{}: {}", failure.what_failed, failure.why_failed));

            if corrections.len() >= self.max_attempts as usize {
                warn!(attempts = corrections.len(), "corrective attempts exhausted");
                trail.push(format!("gave up after {} corrective attempt(s)", corrections.len()));
                self.record(board, "exhausted", json!({ "trail": trail }));
                return FeedbackOutcome::Failed { failure, trail };
            }

            let decision = self.decide(request, &failure, &trail);
            match decision.response {
                FeedbackResponse::Corrective => {
                    let Some(action) = decision
                        .action
                        .as_deref()
                        .and_then(|name| failure.action_named(name))
                        .cloned()
                    else {
                        self.record(board, "report", json!({ "reason": decision.reason }));
                        return FeedbackOutcome::Failed { failure, trail };
                    };
                    let Some(corrective) = action.corrective.as_ref() else {
                        return FeedbackOutcome::Failed { failure, trail };
                    };
                    match correct(state, corrective) {
                        Ok(()) => {
                            info!(action = %action.name, "corrective action applied");
                            self.record(board, "corrective_applied", json!({ "action": action.name }));
                            trail.push(format!("ran {}", action.name));
                            corrections.push(action.name);
                        }
                        Err(err) => {
                            warn!(action = %action.name, error = %format!("{err:#}"), "corrective action failed");
                            trail.push(format!("{} failed: {err:#}", action.name));
                            self.record(board, "corrective_failed", json!({ "action": action.name }));
                            return FeedbackOutcome::Failed { failure, trail };
                        }
                    }
                }
                FeedbackResponse::Disambiguate => {
                    let question = decision
                        .question
                        .filter(|question| !question.trim().is_empty())
                        .unwrap_or_else(|| format!("{} Which would you like to do?", failure.why_failed));
                    self.record(board, "disambiguate", json!({ "question": question }));
                    return FeedbackOutcome::NeedsInput {
                        question,
                        failure,
                        trail,
                    };
                }
                FeedbackResponse::Report => {
                    self.record(board, "report", json!({ "reason": decision.reason }));
                    return FeedbackOutcome::Failed { failure, trail };
                }
            }
        }
    }

    fn record(&self, board: &mut Blackboard, action: &str, details: Value) {
        board.record_event(HistoryEntry::new(HistoryKind::Event, FEEDBACK, action, "recorded", details));
    }
}
