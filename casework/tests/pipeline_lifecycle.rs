//! Session-level tests for full pipeline lifecycle scenarios.
//!
//! These tests drive `CaseSession::process` against a temporary cases
//! directory to verify end-to-end behavior: registration, stage placement,
//! persisted records, feedback recovery and reasoning fallbacks.

use std::fs;
use std::path::Path;

use casework::blackboard::{Blackboard, HistoryKind, WORKFLOW_MEMORY_FILE};
use casework::core::types::{ClassificationStatus, DocumentStatus, ExtractionStatus, IntakeStatus, Stage, WorkflowPhase};
use casework::feedback::ACTION_FAILED;
use casework::io::metadata::StagedDocumentMetadataManager;
use casework::io::prompt::PromptEngine;
use casework::io::reasoner::{RetryPolicy, UnavailableReasoner};
use casework::io::structured::Consultant;
use casework::io::workers::{Extractors, Prediction, UnconfiguredClassifier};
use casework::session::{CaseReport, CaseSession, SessionOutcome, SessionRequest};
use casework::test_support::{ScriptedClassifier, ScriptedReasoner, scratch_config, write_file};

fn expect_report(outcome: SessionOutcome) -> CaseReport {
    match outcome {
        SessionOutcome::Processed(report) => report,
        other => panic!("expected a processed report, got {other:?}"),
    }
}

/// Stage directories that currently hold `document_id`.
fn stages_holding(case_dir: &Path, document_id: &str) -> Vec<Stage> {
    Stage::ALL
        .into_iter()
        .filter(|stage| case_dir.join(stage.as_str()).join(document_id).exists())
        .collect()
}

/// Single passport file into a fresh case.
///
/// Expected sequence:
/// 1. Intake registers `KYC-TEST-001_DOC_001.txt` (status validated).
/// 2. Extraction reads the text directly.
/// 3. Classification records a document type and moves the file to `processed/`.
#[test]
fn passport_sample_runs_through_every_stage() {
    let (temp, config) = scratch_config();
    let prompts = PromptEngine::new();
    let extractors = Extractors::text_only();
    let classifier = ScriptedClassifier::new()
        .with("KYC-TEST-001_DOC_001.txt", Some(Prediction::new("Passport", 0.91)));
    let consultant = Consultant::new(&UnavailableReasoner, RetryPolicy::immediate(0), &prompts);
    let mut session = CaseSession::new(&config, consultant, &extractors, &classifier);
    let file = write_file(
        temp.path(),
        "passport_sample.txt",
        "PASSPORT\nSurname: DOE\nGiven names: JANE\nPassport No: X1234567\n",
    );

    let report = expect_report(
        session
            .process(&SessionRequest {
                text: "Please process this passport".to_string(),
                case: Some("KYC-TEST-001".to_string()),
                files: vec![file],
            })
            .expect("process"),
    );

    assert_eq!(report.phase, WorkflowPhase::Completed);
    let record = session
        .metadata()
        .load_document("KYC-TEST-001", "KYC-TEST-001_DOC_001.txt")
        .expect("record");
    assert_eq!(record.intake.status, IntakeStatus::Validated);
    let extraction = record.extraction.as_ref().expect("extraction block");
    assert!(matches!(extraction.status, ExtractionStatus::Completed | ExtractionStatus::Error));
    assert_eq!(extraction.method.as_str(), "direct_text");
    let classification = record.classification.as_ref().expect("classification block");
    assert!(matches!(
        classification.status,
        ClassificationStatus::Completed | ClassificationStatus::Failed
    ));
    assert_eq!(classification.document_type, "Passport");
    assert_eq!(record.stage, Stage::Processed);
    assert_eq!(record.status, DocumentStatus::Processed);

    let case_dir = temp.path().join("cases/KYC-TEST-001");
    assert_eq!(stages_holding(&case_dir, "KYC-TEST-001_DOC_001.txt"), vec![Stage::Processed]);
    assert!(case_dir.join("KYC-TEST-001_DOC_001.txt.metadata.json").exists());
    assert!(case_dir.join("case_metadata.json").exists());

    let raw: serde_json::Value = serde_json::from_str(
        &fs::read_to_string(case_dir.join("KYC-TEST-001_DOC_001.txt.metadata.json")).expect("read record"),
    )
    .expect("parse record");
    assert_eq!(raw["intake"]["status"], "validated");
    assert_eq!(raw["classification"]["document_type"], "Passport");
}

/// A scanned passport with no text reader configured.
///
/// Expected sequence:
/// 1. Intake registers `KYC-TEST-001_DOC_001.pdf`.
/// 2. Extraction records an error and still moves the document on.
/// 3. Classification works from the stored file and moves it to `processed/`.
#[test]
fn extraction_error_still_reaches_classification() {
    let (temp, config) = scratch_config();
    let prompts = PromptEngine::new();
    let extractors = Extractors::text_only();
    let classifier = ScriptedClassifier::new()
        .with("KYC-TEST-001_DOC_001.pdf", Some(Prediction::new("Passport", 0.91)));
    let consultant = Consultant::new(&UnavailableReasoner, RetryPolicy::immediate(0), &prompts);
    let mut session = CaseSession::new(&config, consultant, &extractors, &classifier);
    let file = write_file(temp.path(), "passport_sample.pdf", "%PDF-1.4 scanned image only");

    let report = expect_report(
        session
            .process(&SessionRequest {
                text: "Please process this passport".to_string(),
                case: Some("KYC-TEST-001".to_string()),
                files: vec![file],
            })
            .expect("process"),
    );

    assert_eq!(report.phase, WorkflowPhase::Completed);
    assert!(report.skipped_steps.is_empty(), "skipped: {:?}", report.skipped_steps);
    let record = session
        .metadata()
        .load_document("KYC-TEST-001", "KYC-TEST-001_DOC_001.pdf")
        .expect("record");
    assert_eq!(record.extraction.as_ref().expect("extraction block").status, ExtractionStatus::Error);
    let classification = record.classification.as_ref().expect("classification block");
    assert_eq!(classification.status, ClassificationStatus::Completed);
    assert_eq!(classification.document_type, "Passport");
    assert_eq!(record.stage, Stage::Processed);

    let doc = report.document("KYC-TEST-001_DOC_001.pdf").expect("document");
    assert!(doc.shortfalls.iter().any(|s| s.starts_with("extraction error")));
    assert!(!report.is_clean());
}

#[test]
fn null_classification_still_yields_a_classification_block() {
    let (temp, config) = scratch_config();
    let prompts = PromptEngine::new();
    let extractors = Extractors::text_only();
    let classifier = ScriptedClassifier::new()
        .with("KYC-2_DOC_001.txt", Some(Prediction::new("Utility Bill", 0.8)))
        .with("KYC-2_DOC_002.txt", None);
    let consultant = Consultant::new(&UnavailableReasoner, RetryPolicy::immediate(0), &prompts);
    let mut session = CaseSession::new(&config, consultant, &extractors, &classifier);
    let first = write_file(temp.path(), "electricity_bill.txt", "Electricity bill for March, amount due 42.00");
    let second = write_file(temp.path(), "statement.txt", "Monthly account statement, closing balance 1200.00");

    let report = expect_report(
        session
            .process(&SessionRequest {
                text: "process both".to_string(),
                case: Some("KYC-2".to_string()),
                files: vec![first, second],
            })
            .expect("process"),
    );

    let summary = session.metadata().get_case_summary("KYC-2").expect("summary");
    assert_eq!(summary.documents.len(), 2);
    assert!(summary.documents.iter().all(|doc| doc.classification.is_some()));
    let failed = summary.documents[1].classification.as_ref().expect("block");
    assert_eq!(failed.status, ClassificationStatus::Failed);
    assert_eq!(failed.document_type, "unknown");
    assert_eq!(summary.stage_summary.get(&Stage::Processed), Some(&2));

    // Partial success is reported, not raised.
    assert_eq!(report.phase, WorkflowPhase::Completed);
    assert!(!report.is_clean());
    let second_report = report.document("KYC-2_DOC_002.txt").expect("second");
    assert!(second_report.shortfalls.iter().any(|s| s.starts_with("classification failed")));
    assert!((report.completeness.score - 1.0 / 3.0).abs() < 1e-9);
}

/// Feedback recovery: a document id with no active case.
///
/// Expected sequence:
/// 1. Resolution fails with an `action_failed` record suggesting the owning case.
/// 2. The fallback decision runs the suggested switch.
/// 3. The retry resolves and the document resumes from intake.
#[test]
fn document_reference_without_active_case_recovers_through_feedback() {
    let (temp, config) = scratch_config();
    let metadata = StagedDocumentMetadataManager::new(&config.cases_dir);
    let scan = write_file(temp.path(), "bank_statement.pdf", "%PDF-1.4 not really");
    let registered = metadata.add_document("KYC-2026-001", &scan).expect("register");
    assert_eq!(registered.document_id, "KYC-2026-001_DOC_001.pdf");

    let prompts = PromptEngine::new();
    let extractors = Extractors::text_only();
    let consultant = Consultant::new(&UnavailableReasoner, RetryPolicy::immediate(0), &prompts);
    let mut session = CaseSession::new(&config, consultant, &extractors, &UnconfiguredClassifier);
    assert_eq!(session.active_case(), None);

    let report = expect_report(
        session
            .process(&SessionRequest {
                text: "process KYC-2026-001_DOC_001.pdf".to_string(),
                case: None,
                files: Vec::new(),
            })
            .expect("process"),
    );

    assert_eq!(report.case_reference, "KYC-2026-001");
    assert_eq!(session.active_case(), Some("KYC-2026-001"));
    let record = metadata
        .load_document("KYC-2026-001", "KYC-2026-001_DOC_001.pdf")
        .expect("record");
    assert_eq!(record.stage, Stage::Processed);
    assert!(record.classification.is_some());

    let board = Blackboard::for_case(&metadata.case_dir("KYC-2026-001")).expect("board");
    let failure = board
        .history()
        .iter()
        .find(|entry| entry.kind == HistoryKind::Event && entry.action == ACTION_FAILED)
        .expect("action_failed in history");
    assert_eq!(failure.details["type"], "action_failed");
    assert_eq!(failure.details["why_failed"], "no active case");
    let suggestions = failure.details["suggested_next_actions"]
        .as_array()
        .expect("suggestions");
    assert!(!suggestions.is_empty());
    assert_eq!(suggestions[0]["name"], "switch_case:KYC-2026-001");
}

#[test]
fn reference_to_unknown_case_needs_the_caller() {
    let (temp, config) = scratch_config();
    let prompts = PromptEngine::new();
    let extractors = Extractors::text_only();
    let reasoner = ScriptedReasoner::new().with_answer(
        "feedback.decide",
        r#"{"response":"disambiguate","question":"Which case does KYC-404_DOC_001.pdf belong to?"}"#,
    );
    let consultant = Consultant::new(&reasoner, RetryPolicy::immediate(0), &prompts);
    let mut session = CaseSession::new(&config, consultant, &extractors, &UnconfiguredClassifier);

    let outcome = session
        .process(&SessionRequest {
            text: "process KYC-404_DOC_001.pdf".to_string(),
            ..SessionRequest::default()
        })
        .expect("process");

    match outcome {
        SessionOutcome::NeedsInput { question, failure, .. } => {
            assert_eq!(question, "Which case does KYC-404_DOC_001.pdf belong to?");
            assert_eq!(failure.suggested_next_actions.len(), 1);
            assert_eq!(failure.suggested_next_actions[0].name, "specify_case");
        }
        other => panic!("expected NeedsInput, got {other:?}"),
    }
    assert!(!temp.path().join("cases/KYC-404").exists());
}

/// Verifies malformed reasoning at every call site never escapes a session.
#[test]
fn malformed_reasoning_everywhere_still_produces_a_report() {
    let (temp, config) = scratch_config();
    let prompts = PromptEngine::new();
    let extractors = Extractors::text_only();
    let classifier = ScriptedClassifier::new()
        .with("KYC-3_DOC_001.txt", Some(Prediction::new("PAN Card", 0.7)));
    let reasoner = ScriptedReasoner::new().with_default("I think you should {probably} do it");
    let consultant = Consultant::new(&reasoner, RetryPolicy::immediate(1), &prompts);
    let mut session = CaseSession::new(&config, consultant, &extractors, &classifier);
    let file = write_file(temp.path(), "pan_card.txt", "Permanent Account Number ABCDE1234F");

    let report = expect_report(
        session
            .process(&SessionRequest {
                text: "process".to_string(),
                case: Some("KYC-3".to_string()),
                files: vec![file],
            })
            .expect("process"),
    );

    assert_eq!(report.phase, WorkflowPhase::Completed);
    assert!(report.fallbacks > 0);
    let doc = report.document("KYC-3_DOC_001.txt").expect("document");
    assert_eq!(doc.stage, Stage::Processed);
    assert_eq!(doc.document_type.as_deref(), Some("PAN Card"));
    assert!(!reasoner.calls().is_empty());
}

#[test]
fn case_summary_is_stable_across_reads_and_sessions() {
    let (temp, config) = scratch_config();
    let prompts = PromptEngine::new();
    let extractors = Extractors::text_only();
    let consultant = Consultant::new(&UnavailableReasoner, RetryPolicy::immediate(0), &prompts);
    let mut session = CaseSession::new(&config, consultant, &extractors, &UnconfiguredClassifier);
    let file = write_file(temp.path(), "lease.txt", "Lease agreement between landlord and tenant");
    session
        .process(&SessionRequest {
            text: "process".to_string(),
            case: Some("KYC-4".to_string()),
            files: vec![file],
        })
        .expect("process");

    let first = session.metadata().get_case_summary("KYC-4").expect("first");
    let second = session.metadata().get_case_summary("KYC-4").expect("second");
    assert_eq!(first, second);

    // A second request on the same case reloads the board and finds nothing pending.
    let report = expect_report(
        session
            .process(&SessionRequest {
                text: "anything left?".to_string(),
                ..SessionRequest::default()
            })
            .expect("resume"),
    );
    assert_eq!(report.documents.len(), 1);
    let third = session.metadata().get_case_summary("KYC-4").expect("third");
    assert_eq!(first, third);
}

#[test]
fn document_reference_is_matched_whatever_its_letter_case() {
    let (temp, config) = scratch_config();
    let prompts = PromptEngine::new();
    let extractors = Extractors::text_only();
    let classifier = ScriptedClassifier::new()
        .with("KYC-1_DOC_001.txt", Some(Prediction::new("Passport", 0.9)));
    let consultant = Consultant::new(&UnavailableReasoner, RetryPolicy::immediate(0), &prompts);
    let mut session = CaseSession::new(&config, consultant, &extractors, &classifier);
    let scan = write_file(temp.path(), "passport.txt", "PASSPORT No X1234567");
    session.metadata().add_document("KYC-1", &scan).expect("register");
    session.switch_case("KYC-1").expect("switch");

    let report = expect_report(
        session
            .process(&SessionRequest {
                text: "process kyc-1_doc_001.TXT please".to_string(),
                ..SessionRequest::default()
            })
            .expect("process"),
    );

    let doc = report.document("KYC-1_DOC_001.txt").expect("document");
    assert_eq!(doc.stage, Stage::Processed);
    assert_eq!(doc.document_type.as_deref(), Some("Passport"));
    assert_eq!(classifier.calls(), vec!["KYC-1_DOC_001.txt"]);
}

#[test]
fn workflow_steps_describe_only_the_latest_request() {
    let (temp, config) = scratch_config();
    let prompts = PromptEngine::new();
    let extractors = Extractors::text_only();
    let consultant = Consultant::new(&UnavailableReasoner, RetryPolicy::immediate(0), &prompts);
    let mut session = CaseSession::new(&config, consultant, &extractors, &UnconfiguredClassifier);
    let good = write_file(temp.path(), "lease.txt", "Lease agreement between landlord and tenant");
    let bad = write_file(temp.path(), "virus.exe", "MZ");

    session
        .process(&SessionRequest {
            text: "process".to_string(),
            case: Some("KYC-5".to_string()),
            files: vec![good],
        })
        .expect("first");
    let report = expect_report(
        session
            .process(&SessionRequest {
                text: "process".to_string(),
                case: Some("KYC-5".to_string()),
                files: vec![bad],
            })
            .expect("second"),
    );

    assert_eq!(report.phase, WorkflowPhase::Failed);
    assert_eq!(report.invalid_files.len(), 1);
    let board = Blackboard::for_case(&session.metadata().case_dir("KYC-5")).expect("board");
    let workflow = board.workflow_state();
    assert!(workflow.completed_steps.is_empty(), "completed: {:?}", workflow.completed_steps);
    assert_eq!(workflow.failed_steps, vec!["intake", "extraction", "classification"]);
    // The first request is still in the history.
    assert!(board.history().iter().any(|entry| entry.status == "completed"));
}

#[test]
fn unreadable_workflow_memory_does_not_stop_a_request() {
    let (temp, config) = scratch_config();
    let prompts = PromptEngine::new();
    let extractors = Extractors::text_only();
    let consultant = Consultant::new(&UnavailableReasoner, RetryPolicy::immediate(0), &prompts);
    let mut session = CaseSession::new(&config, consultant, &extractors, &UnconfiguredClassifier);
    let case_dir = session.metadata().case_dir("KYC-6");
    session.metadata().ensure_case("KYC-6").expect("case");
    fs::write(case_dir.join(WORKFLOW_MEMORY_FILE), "{ truncated").expect("corrupt");
    let file = write_file(temp.path(), "statement.txt", "Monthly account statement");

    let report = expect_report(
        session
            .process(&SessionRequest {
                text: "process".to_string(),
                case: Some("KYC-6".to_string()),
                files: vec![file],
            })
            .expect("process"),
    );

    assert_eq!(report.documents.len(), 1);
    assert!(Blackboard::for_case(&case_dir).is_ok());
    let aside = fs::read_dir(&case_dir)
        .expect("list")
        .filter_map(|entry| entry.ok())
        .any(|entry| entry.file_name().to_string_lossy().starts_with("workflow_memory.json.corrupt-"));
    assert!(aside);
}
