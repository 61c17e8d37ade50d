//! Intake: validate submitted files and register them in the case.

use std::fs;
use std::path::Path;

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::agents::{ActOutput, AgentTask, ItemHint, ItemOutcome, Observation, PlannedAction, Reasoning, Specialist};
use crate::blackboard::Blackboard;
use crate::core::heuristics::{CategoryHint, filename_anomalies, hint_from_filename};
use crate::core::types::{AgentKind, ErrorKind, IntakeStatus};
use crate::io::config::IntakeConfig;
use crate::io::metadata::{DocumentPatch, IntakeRecord, StagedDocumentMetadataManager};

/// Board key listing files rejected at intake.
pub const FAILED_DOCUMENTS_KEY: &str = "failed_documents";

#[derive(Debug, Clone, PartialEq, Serialize)]
struct FileFacts {
    path: String,
    file_name: String,
    extension: String,
    size_bytes: Option<u64>,
    hint: CategoryHint,
    anomalies: Vec<String>,
}

fn file_facts(path: &Path) -> FileFacts {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let size_bytes = fs::metadata(path).ok().filter(|m| m.is_file()).map(|m| m.len());
    FileFacts {
        path: path.display().to_string(),
        extension: path
            .extension()
            .map(|ext| ext.to_string_lossy().into_owned())
            .unwrap_or_default(),
        size_bytes,
        hint: hint_from_filename(&file_name),
        anomalies: filename_anomalies(&file_name, size_bytes.unwrap_or(0)),
        file_name,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
struct Rejection {
    file: String,
    reason: String,
    error_kind: ErrorKind,
}

pub struct IntakeAgent<'a> {
    metadata: &'a StagedDocumentMetadataManager,
    config: &'a IntakeConfig,
}

impl<'a> IntakeAgent<'a> {
    pub fn new(metadata: &'a StagedDocumentMetadataManager, config: &'a IntakeConfig) -> Self {
        Self { metadata, config }
    }

    /// Deterministic checks; `Err` carries the reason the file is invalid.
    fn validate(&self, facts: &FileFacts) -> Result<(), String> {
        let Some(size) = facts.size_bytes else {
            return Err(format!("{} is not a readable file", facts.path));
        };
        if !self.config.allows_extension(&facts.extension) {
            return Err(format!(
                "extension '{}' is not allowed (allowed: {})",
                facts.extension,
                self.config.allowed_extensions.join(", ")
            ));
        }
        if size > self.config.max_document_bytes() {
            return Err(format!(
                "{size} bytes exceeds the {} MB limit",
                self.config.max_document_size_mb
            ));
        }
        Ok(())
    }

    fn register(&self, case_reference: &str, facts: FileFacts) -> Result<ItemOutcome, ItemOutcome> {
        let record = self
            .metadata
            .add_document(case_reference, Path::new(&facts.path))
            .map_err(|err| ItemOutcome::failed(&facts.path, None, err.kind(), err.to_string()))?;
        let document_id = record.document_id.clone();
        let annotated = self.metadata.update_document(
            &document_id,
            DocumentPatch {
                intake: Some(IntakeRecord {
                    status: IntakeStatus::Validated,
                    timestamp: record.intake.timestamp,
                    inferred: Some(facts.hint.clone()),
                    anomalies: facts.anomalies.clone(),
                }),
                ..DocumentPatch::default()
            },
        );
        if let Err(err) = annotated {
            warn!(document_id = %document_id, err = %err, "could not store intake hints");
        }
        debug!(document_id = %document_id, "registered");
        Ok(ItemOutcome::ok(
            &facts.path,
            Some(document_id.clone()),
            format!("registered as {document_id} ({})", facts.hint.document_type),
        ))
    }
}

impl Specialist for IntakeAgent<'_> {
    fn kind(&self) -> AgentKind {
        AgentKind::Intake
    }

    fn role(&self) -> &'static str {
        "You validate submitted files and register them under the case."
    }

    fn actions(&self) -> &'static [&'static str] {
        &["register"]
    }

    fn observe(&self, task: &AgentTask, _board: &Blackboard) -> Result<Observation> {
        let facts: Vec<FileFacts> = task.files.iter().map(|path| file_facts(path)).collect();
        Ok(Observation {
            items: facts.iter().map(|f| f.path.clone()).collect(),
            details: json!({
                "case_reference": task.case_reference,
                "allowed_extensions": self.config.allowed_extensions,
                "max_document_size_mb": self.config.max_document_size_mb,
                "files": facts,
            }),
        })
    }

    fn annotate(&self, observation: &Observation) -> Vec<ItemHint> {
        observation
            .items
            .iter()
            .map(|item| {
                let facts = file_facts(Path::new(item));
                let mut note = format!(
                    "likely {} ({})",
                    facts.hint.document_type,
                    facts.hint.category.as_str()
                );
                if !facts.anomalies.is_empty() {
                    note.push_str(&format!("; anomalies: {}", facts.anomalies.join(", ")));
                }
                ItemHint {
                    item: item.clone(),
                    note,
                }
            })
            .collect()
    }

    fn act(
        &self,
        task: &AgentTask,
        plan: &[PlannedAction],
        _reasoning: &Reasoning,
        board: &mut Blackboard,
    ) -> Result<ActOutput> {
        let mut outcomes = Vec::new();
        let mut registered = Vec::new();
        let mut rejected = Vec::new();
        for action in plan {
            let facts = file_facts(Path::new(&action.target));
            if let Err(reason) = self.validate(&facts) {
                rejected.push(Rejection {
                    file: facts.path.clone(),
                    reason: reason.clone(),
                    error_kind: ErrorKind::ValidationError,
                });
                outcomes.push(ItemOutcome::failed(
                    &facts.path,
                    None,
                    ErrorKind::ValidationError,
                    reason,
                ));
                continue;
            }
            match self.register(&task.case_reference, facts) {
                Ok(outcome) => {
                    registered.extend(outcome.document_id.clone());
                    outcomes.push(outcome);
                }
                Err(outcome) => {
                    rejected.push(Rejection {
                        file: outcome.item.clone(),
                        reason: outcome.detail.clone(),
                        error_kind: outcome.error_kind.unwrap_or(ErrorKind::ValidationError),
                    });
                    outcomes.push(outcome);
                }
            }
        }

        if !rejected.is_empty() {
            let mut failed: Vec<Value> = board
                .get(FAILED_DOCUMENTS_KEY)
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            for rejection in &rejected {
                let mut entry = json!(rejection);
                entry["timestamp"] = json!(Utc::now());
                failed.push(entry);
            }
            board.update(FAILED_DOCUMENTS_KEY, Value::Array(failed), AgentKind::Intake.as_str());
        }

        Ok(ActOutput {
            outcomes,
            data: json!({ "registered": registered, "rejected": rejected }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{canned_plan, execute};
    use crate::core::types::{AgentStatus, DocumentCategory, Stage};
    use crate::io::prompt::PromptEngine;
    use crate::io::reasoner::{RetryPolicy, UnavailableReasoner};
    use crate::io::structured::Consultant;
    use crate::test_support::write_file;

    fn agent_task(files: Vec<std::path::PathBuf>) -> AgentTask {
        AgentTask {
            description: "register files".to_string(),
            case_reference: "KYC-TEST-001".to_string(),
            files,
            document_ids: Vec::new(),
        }
    }

    #[test]
    fn registers_valid_file_with_hint() {
        let temp = tempfile::tempdir().expect("tempdir");
        let manager = StagedDocumentMetadataManager::new(temp.path().join("cases"));
        let config = IntakeConfig::default();
        let agent = IntakeAgent::new(&manager, &config);
        let file = write_file(temp.path(), "passport_sample.txt", "PASSPORT Name: JANE DOE");
        let task = agent_task(vec![file]);
        let mut board = Blackboard::in_memory();

        let plan = canned_plan(&agent.observe(&task, &board).expect("observe").items, "register");
        let act = agent
            .act(&task, &plan, &Reasoning::conservative(String::new(), Vec::new()), &mut board)
            .expect("act");

        assert!(act.outcomes[0].ok);
        let id = act.outcomes[0].document_id.clone().expect("id");
        assert_eq!(id, "KYC-TEST-001_DOC_001.txt");
        let record = manager.load_document("KYC-TEST-001", &id).expect("record");
        assert_eq!(record.stage, Stage::Intake);
        assert_eq!(record.intake.status, IntakeStatus::Validated);
        let hint = record.intake.inferred.expect("hint");
        assert_eq!(hint.category, DocumentCategory::IdentityProof);
    }

    /// Verifies one invalid file is rejected without stopping its siblings.
    #[test]
    fn invalid_file_does_not_halt_siblings() {
        let temp = tempfile::tempdir().expect("tempdir");
        let manager = StagedDocumentMetadataManager::new(temp.path().join("cases"));
        let config = IntakeConfig::default();
        let agent = IntakeAgent::new(&manager, &config);
        let bad = write_file(temp.path(), "payload.exe", "MZ");
        let missing = temp.path().join("missing.pdf");
        let good = write_file(temp.path(), "bank_statement.txt", "Statement of account");
        let prompts = PromptEngine::new();
        let consultant = Consultant::new(&UnavailableReasoner, RetryPolicy::immediate(0), &prompts);
        let mut board = Blackboard::in_memory();

        let result = execute(
            &agent,
            &consultant,
            &agent_task(vec![bad, missing, good]),
            &mut board,
        );

        assert_eq!(result.status, AgentStatus::Partial);
        let oks: Vec<bool> = result.outcomes.iter().map(|o| o.ok).collect();
        assert_eq!(oks, vec![false, false, true]);
        assert_eq!(
            result.outcomes[0].error_kind,
            Some(ErrorKind::ValidationError)
        );
        assert_eq!(
            manager.document_ids("KYC-TEST-001").expect("ids"),
            vec!["KYC-TEST-001_DOC_001.txt"]
        );
        let failed = board
            .get(FAILED_DOCUMENTS_KEY)
            .and_then(Value::as_array)
            .expect("failed documents");
        assert_eq!(failed.len(), 2);
        assert!(failed[0]["reason"].as_str().expect("reason").contains("not allowed"));
    }

    #[test]
    fn oversized_file_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let manager = StagedDocumentMetadataManager::new(temp.path().join("cases"));
        let config = IntakeConfig {
            max_document_size_mb: 1,
            ..IntakeConfig::default()
        };
        let agent = IntakeAgent::new(&manager, &config);
        let big = temp.path().join("scan.pdf");
        fs::write(&big, vec![b'x'; 1024 * 1024 + 1]).expect("write");

        let err = agent.validate(&file_facts(&big)).expect_err("too big");
        assert!(err.contains("exceeds"));
    }

    #[test]
    fn hints_mention_anomalies() {
        let temp = tempfile::tempdir().expect("tempdir");
        let manager = StagedDocumentMetadataManager::new(temp.path().join("cases"));
        let config = IntakeConfig::default();
        let agent = IntakeAgent::new(&manager, &config);
        let odd = write_file(temp.path(), "passport.pdf.txt", "x");
        let observation = agent
            .observe(&agent_task(vec![odd]), &Blackboard::in_memory())
            .expect("observe");

        let hints = agent.annotate(&observation);
        assert_eq!(hints.len(), 1);
        assert!(hints[0].note.starts_with("likely Passport"));
        assert!(hints[0].note.contains("anomalies"));
    }
}
