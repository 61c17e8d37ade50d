//! Case sessions: resolve what a request refers to, then run the planner on it.
//!
//! A session remembers the active case between requests. Resolution is the
//! deterministic step the feedback loop guards: a request naming a document
//! of another case, or of no case at all, becomes an `action_failed` record
//! the reasoning layer can correct.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{info, instrument, warn};

use crate::agents::Specialist;
use crate::agents::classification::{ClassificationAgent, completeness_for};
use crate::agents::extraction::ExtractionAgent;
use crate::agents::intake::IntakeAgent;
use crate::blackboard::{Blackboard, HistoryEntry};
use crate::core::completeness::Completeness;
use crate::core::document_id::{find_document_refs, normalize_case_reference, parse_document_id};
use crate::core::types::{
    AgentKind, ClassificationStatus, DocumentStatus, ErrorKind, ExtractionStatus, Stage, WorkflowPhase,
};
use crate::feedback::{ActionFailure, Corrective, FeedbackLoop, FeedbackOutcome, SuggestedAction};
use crate::io::config::{ClassificationConfig, PipelineConfig};
use crate::io::metadata::{DocumentRecord, StagedDocumentMetadataManager};
use crate::io::structured::Consultant;
use crate::io::workers::{ClassificationWorker, Extractors};
use crate::planner::{PlanOutcome, Planner, ProcessingRequest, SkippedStep};

/// One request as the caller phrased it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionRequest {
    pub text: String,
    /// Explicit case reference; overrides the active case.
    pub case: Option<String>,
    pub files: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocumentReport {
    pub document_id: String,
    pub original_filename: String,
    pub stage: Stage,
    pub status: DocumentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_type: Option<String>,
    pub shortfalls: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvalidFile {
    pub file: String,
    pub reason: String,
}

/// Final aggregate of one processed request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CaseReport {
    pub case_reference: String,
    pub phase: WorkflowPhase,
    pub documents: Vec<DocumentReport>,
    pub invalid_files: Vec<InvalidFile>,
    pub completeness: Completeness,
    pub skipped_steps: Vec<SkippedStep>,
    /// Reasoning calls that used their deterministic fallback.
    pub fallbacks: usize,
    pub suggestions: Vec<String>,
}

impl CaseReport {
    /// Completed with no shortfalls and no rejected files.
    pub fn is_clean(&self) -> bool {
        self.phase == WorkflowPhase::Completed
            && self.invalid_files.is_empty()
            && self.documents.iter().all(|doc| doc.shortfalls.is_empty())
    }

    pub fn document(&self, document_id: &str) -> Option<&DocumentReport> {
        self.documents.iter().find(|doc| doc.document_id == document_id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutcome {
    Processed(CaseReport),
    NeedsInput {
        question: String,
        failure: ActionFailure,
        trail: Vec<String>,
    },
    Unresolved {
        failure: ActionFailure,
        trail: Vec<String>,
    },
}

#[derive(Debug, Clone, Default)]
struct Target {
    requested: Option<String>,
    active: Option<String>,
}

#[derive(Debug)]
struct Resolved {
    case: String,
    document_ids: Vec<String>,
}

fn current_state(target: &Target, refs: &[String]) -> Value {
    json!({
        "active_case": target.active,
        "requested_case": target.requested,
        "document_refs": refs,
    })
}

fn case_suggestions(metadata: &StagedDocumentMetadataManager, refs: &[String]) -> Vec<SuggestedAction> {
    let mut suggestions: Vec<SuggestedAction> = Vec::new();
    for raw in refs {
        if let Some(id) = parse_document_id(raw)
            && metadata.case_exists(&id.case_reference)
        {
            let name = format!("switch_case:{}", id.case_reference);
            if !suggestions.iter().any(|s| s.name == name) {
                suggestions.push(SuggestedAction::corrective(
                    &name,
                    format!("Make {} the active case, then retry", id.case_reference),
                    Corrective::SwitchCase(id.case_reference),
                ));
            }
        }
    }
    suggestions.push(SuggestedAction::advice(
        "specify_case",
        "Name the case explicitly with the request",
    ));
    suggestions
}

fn resolve_target(
    metadata: &StagedDocumentMetadataManager,
    request: &SessionRequest,
    refs: &[String],
    target: &Target,
) -> Result<Resolved, ActionFailure> {
    let case = match &target.requested {
        Some(raw) => Some(normalize_case_reference(raw).map_err(|reason| {
            ActionFailure::new(
                format!("use case reference '{raw}'"),
                reason,
                ErrorKind::ValidationError,
                current_state(target, refs),
                vec![SuggestedAction::advice(
                    "fix_case_reference",
                    "Use letters, digits, '-' and '_' only",
                )],
            )
        })?),
        None => target.active.clone(),
    };

    let Some(case) = case else {
        let what_failed = match refs.first() {
            Some(first) => format!("resolve document {first}"),
            None => format!("choose a case for {} file(s)", request.files.len()),
        };
        return Err(ActionFailure::new(
            what_failed,
            "no active case",
            ErrorKind::ValidationError,
            current_state(target, refs),
            case_suggestions(metadata, refs),
        ));
    };

    for raw in refs {
        let Some(id) = parse_document_id(raw) else {
            return Err(ActionFailure::new(
                format!("resolve document {raw}"),
                format!("'{raw}' is not a document id"),
                ErrorKind::ValidationError,
                current_state(target, refs),
                vec![SuggestedAction::advice(
                    "list_pending",
                    format!("List the pending documents of case {case}"),
                )],
            ));
        };
        if id.case_reference != case {
            return Err(ActionFailure::new(
                format!("resolve document {raw}"),
                format!("{raw} belongs to case {}, not {case}", id.case_reference),
                ErrorKind::ValidationError,
                current_state(target, refs),
                case_suggestions(metadata, std::slice::from_ref(raw)),
            ));
        }
        if let Err(err) = metadata.load_document(&case, raw) {
            return Err(ActionFailure::new(
                format!("resolve document {raw}"),
                err.to_string(),
                err.kind(),
                current_state(target, refs),
                vec![SuggestedAction::advice(
                    "list_pending",
                    format!("List the pending documents of case {case}"),
                )],
            ));
        }
    }

    Ok(Resolved {
        case,
        document_ids: refs.to_vec(),
    })
}

fn apply_corrective(
    metadata: &StagedDocumentMetadataManager,
    target: &mut Target,
    corrective: &Corrective,
) -> Result<()> {
    let Corrective::SwitchCase(case) = corrective;
    if !metadata.case_exists(case) {
        bail!("case {case} does not exist");
    }
    target.active = Some(case.clone());
    target.requested = None;
    Ok(())
}

/// Gaps that keep a document from counting as cleanly processed.
pub fn shortfalls(record: &DocumentRecord, config: &ClassificationConfig) -> Vec<String> {
    let mut gaps = Vec::new();
    if record.status == DocumentStatus::Failed {
        gaps.push("processing failed".to_string());
    } else if record.stage != Stage::Processed {
        gaps.push(format!("waiting at {} stage", record.stage));
    }
    if let Some(extraction) = &record.extraction {
        if extraction.status == ExtractionStatus::Error {
            gaps.push(format!(
                "extraction error: {}",
                extraction.error.as_deref().unwrap_or("unknown")
            ));
        } else if extraction.low_quality {
            gaps.push(format!("low extraction quality ({:.2})", extraction.quality_score));
        }
    }
    if let Some(classification) = &record.classification {
        if classification.status == ClassificationStatus::Failed {
            gaps.push(format!(
                "classification failed: {}",
                classification.error.as_deref().unwrap_or("unknown")
            ));
        } else if classification.confidence < config.confidence_threshold {
            gaps.push(format!(
                "low classification confidence ({:.2})",
                classification.confidence
            ));
        }
    }
    gaps
}

pub struct CaseSession<'a> {
    config: &'a PipelineConfig,
    metadata: StagedDocumentMetadataManager,
    consultant: Consultant<'a>,
    extractors: &'a Extractors,
    classifier: &'a dyn ClassificationWorker,
    active_case: Option<String>,
}

impl<'a> CaseSession<'a> {
    pub fn new(
        config: &'a PipelineConfig,
        consultant: Consultant<'a>,
        extractors: &'a Extractors,
        classifier: &'a dyn ClassificationWorker,
    ) -> Self {
        Self {
            config,
            metadata: StagedDocumentMetadataManager::new(&config.cases_dir),
            consultant,
            extractors,
            classifier,
            active_case: None,
        }
    }

    pub fn metadata(&self) -> &StagedDocumentMetadataManager {
        &self.metadata
    }

    pub fn active_case(&self) -> Option<&str> {
        self.active_case.as_deref()
    }

    /// Make an existing case active.
    pub fn switch_case(&mut self, case_reference: &str) -> Result<String> {
        let case = normalize_case_reference(case_reference).map_err(anyhow::Error::msg)?;
        if !self.metadata.case_exists(&case) {
            bail!("case {case} does not exist");
        }
        self.active_case = Some(case.clone());
        Ok(case)
    }

    /// Resolve `request`, then analyze, plan and execute it.
    ///
    /// Errors are reserved for storage that cannot be opened at all; every
    /// processing failure is reported inside the outcome.
    #[instrument(skip_all, fields(case = ?request.case))]
    pub fn process(&mut self, request: &SessionRequest) -> Result<SessionOutcome> {
        let refs = find_document_refs(&request.text);
        let mut target = Target {
            requested: request.case.clone(),
            active: self.active_case.clone(),
        };
        let mut resolution = Blackboard::in_memory();
        let feedback = FeedbackLoop::new(&self.consultant, self.config.feedback.max_corrective_attempts);
        let metadata = &self.metadata;
        let outcome = feedback.resolve(
            &request.text,
            &mut resolution,
            &mut target,
            |target| resolve_target(metadata, request, &refs, target),
            |target, corrective| apply_corrective(metadata, target, corrective),
        );

        let resolved = match outcome {
            FeedbackOutcome::Resolved { value, corrections } => {
                if !corrections.is_empty() {
                    info!(?corrections, case = %value.case, "request resolved after correction");
                }
                value
            }
            FeedbackOutcome::NeedsInput {
                question,
                failure,
                trail,
            } => {
                self.keep_history(resolution.history());
                return Ok(SessionOutcome::NeedsInput {
                    question,
                    failure,
                    trail,
                });
            }
            FeedbackOutcome::Failed { failure, trail } => {
                self.keep_history(resolution.history());
                return Ok(SessionOutcome::Unresolved { failure, trail });
            }
        };

        let case = self
            .metadata
            .ensure_case(&resolved.case)
            .with_context(|| format!("open case {}", resolved.case))?;
        self.active_case = Some(case.clone());
        let mut board = Blackboard::open_case(&self.metadata.case_dir(&case));
        for entry in resolution.history() {
            board.record_event(entry.clone());
        }

        let intake = IntakeAgent::new(&self.metadata, &self.config.intake);
        let extraction = ExtractionAgent::new(&self.metadata, self.extractors, &self.config.extraction);
        let classification = ClassificationAgent::new(&self.metadata, self.classifier, &self.config.classification);
        let specialists: Vec<&dyn Specialist> = vec![&intake, &extraction, &classification];
        let planner = Planner::new(&self.consultant, specialists);
        let outcome = planner.run(
            &ProcessingRequest {
                text: request.text.clone(),
                case_reference: case.clone(),
                files: request.files.clone(),
                document_ids: resolved.document_ids,
            },
            &mut board,
        );
        if board.persist_failures() > 0 {
            warn!(failures = board.persist_failures(), "workflow memory was not fully persisted");
        }

        let report = self.report(&case, &outcome)?;
        Ok(SessionOutcome::Processed(report))
    }

    /// Write resolution history to the active case, when there is one.
    fn keep_history(&self, history: &[HistoryEntry]) {
        let Some(case) = self.active_case.as_deref() else {
            return;
        };
        let mut board = Blackboard::open_case(&self.metadata.case_dir(case));
        for entry in history {
            board.record_event(entry.clone());
        }
    }

    fn report(&self, case: &str, outcome: &PlanOutcome) -> Result<CaseReport> {
        let records = self
            .metadata
            .load_documents(case)
            .with_context(|| format!("load documents of {case}"))?;
        let documents = records
            .iter()
            .map(|record| DocumentReport {
                document_id: record.document_id.clone(),
                original_filename: record.original_filename.clone(),
                stage: record.stage,
                status: record.status,
                document_type: record
                    .classification
                    .as_ref()
                    .map(|c| c.document_type.clone()),
                shortfalls: shortfalls(record, &self.config.classification),
            })
            .collect();
        let invalid_files = outcome
            .result_for(AgentKind::Intake)
            .map(|result| {
                result
                    .outcomes
                    .iter()
                    .filter(|o| !o.ok && o.document_id.is_none())
                    .map(|o| InvalidFile {
                        file: o.item.clone(),
                        reason: o.detail.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(CaseReport {
            case_reference: case.to_string(),
            phase: outcome.phase,
            documents,
            invalid_files,
            completeness: completeness_for(&records, &self.config.classification),
            skipped_steps: outcome.skipped.clone(),
            fallbacks: outcome.results.iter().map(|r| r.fallbacks.len()).sum(),
            suggestions: outcome
                .results
                .iter()
                .flat_map(|r| r.suggestions.iter().cloned())
                .collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::prompt::PromptEngine;
    use crate::io::reasoner::{RetryPolicy, UnavailableReasoner};
    use crate::io::workers::Prediction;
    use crate::test_support::{ScriptedClassifier, write_file};

    fn config(cases_dir: &std::path::Path) -> PipelineConfig {
        PipelineConfig {
            cases_dir: cases_dir.to_path_buf(),
            ..PipelineConfig::default()
        }
    }

    #[test]
    fn processes_new_file_into_fresh_case() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = config(&temp.path().join("cases"));
        let prompts = PromptEngine::new();
        let extractors = Extractors::text_only();
        let classifier = ScriptedClassifier::new()
            .with("KYC-1_DOC_001.txt", Some(Prediction::new("Passport", 0.93)));
        let consultant = Consultant::new(&UnavailableReasoner, RetryPolicy::immediate(0), &prompts);
        let mut session = CaseSession::new(&config, consultant, &extractors, &classifier);
        let file = write_file(temp.path(), "passport_scan.txt", "PASSPORT Republic of Example No X1234567");

        let outcome = session
            .process(&SessionRequest {
                text: "register this passport".to_string(),
                case: Some("kyc-1".to_string()),
                files: vec![file],
            })
            .expect("process");

        let SessionOutcome::Processed(report) = outcome else {
            panic!("expected a report, got {outcome:?}");
        };
        assert_eq!(report.case_reference, "KYC-1");
        assert_eq!(report.phase, WorkflowPhase::Completed);
        let doc = report.document("KYC-1_DOC_001.txt").expect("document");
        assert_eq!(doc.stage, Stage::Processed);
        assert_eq!(doc.status, DocumentStatus::Processed);
        assert_eq!(doc.document_type.as_deref(), Some("Passport"));
        assert!(doc.shortfalls.is_empty(), "{:?}", doc.shortfalls);
        assert_eq!(session.active_case(), Some("KYC-1"));
        assert!(temp.path().join("cases/KYC-1/workflow_memory.json").exists());
    }

    #[test]
    fn unknown_explicit_case_reference_is_rejected_without_storage() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = config(&temp.path().join("cases"));
        let prompts = PromptEngine::new();
        let extractors = Extractors::text_only();
        let classifier = ScriptedClassifier::new();
        let consultant = Consultant::new(&UnavailableReasoner, RetryPolicy::immediate(0), &prompts);
        let mut session = CaseSession::new(&config, consultant, &extractors, &classifier);

        let outcome = session
            .process(&SessionRequest {
                text: "process".to_string(),
                case: Some("bad/case".to_string()),
                files: Vec::new(),
            })
            .expect("process");

        match outcome {
            SessionOutcome::Unresolved { failure, .. } => {
                assert_eq!(failure.error_kind, ErrorKind::ValidationError);
                assert!(failure.why_failed.contains("invalid character"));
            }
            other => panic!("expected Unresolved, got {other:?}"),
        }
        assert!(!temp.path().join("cases").exists());
    }

    #[test]
    fn shortfalls_name_each_gap() {
        let temp = tempfile::tempdir().expect("tempdir");
        let metadata = StagedDocumentMetadataManager::new(temp.path());
        let file = write_file(temp.path(), "scan.txt", "text");
        let mut record = metadata.add_document("C1", &file).expect("add");
        let config = ClassificationConfig::default();

        assert_eq!(shortfalls(&record, &config), vec!["waiting at intake stage"]);

        record.status = DocumentStatus::Failed;
        assert_eq!(shortfalls(&record, &config), vec!["processing failed"]);
    }

    #[test]
    fn unparseable_reference_is_an_action_failure() {
        let temp = tempfile::tempdir().expect("tempdir");
        let metadata = StagedDocumentMetadataManager::new(temp.path());
        metadata.ensure_case("KYC-1").expect("case");
        let target = Target {
            requested: None,
            active: Some("KYC-1".to_string()),
        };
        let refs = vec!["KYC-1_DOC_1".to_string()];

        let failure = resolve_target(&metadata, &SessionRequest::default(), &refs, &target)
            .expect_err("not a document id");
        assert_eq!(failure.what_failed, "resolve document KYC-1_DOC_1");
        assert_eq!(failure.error_kind, ErrorKind::ValidationError);
        assert_eq!(failure.suggested_next_actions[0].name, "list_pending");
    }

    #[test]
    fn switch_case_requires_an_existing_case() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = config(temp.path());
        let prompts = PromptEngine::new();
        let extractors = Extractors::text_only();
        let classifier = ScriptedClassifier::new();
        let consultant = Consultant::new(&UnavailableReasoner, RetryPolicy::immediate(0), &prompts);
        let mut session = CaseSession::new(&config, consultant, &extractors, &classifier);

        assert!(session.switch_case("KYC-9").is_err());
        session.metadata().ensure_case("KYC-9").expect("case");
        assert_eq!(session.switch_case("kyc-9").expect("switch"), "KYC-9");
        assert_eq!(session.active_case(), Some("KYC-9"));
    }
}
