//! Classification: label extracted documents and score case completeness.

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};

use crate::agents::extraction::waiting_documents;
use crate::agents::{ActOutput, AgentTask, ItemHint, ItemOutcome, Observation, PlannedAction, Reasoning, Specialist};
use crate::blackboard::Blackboard;
use crate::core::completeness::{Completeness, case_completeness};
use crate::core::heuristics::hint_from_filename;
use crate::core::types::{AgentKind, ClassificationStatus, ErrorKind, Stage};
use crate::io::config::ClassificationConfig;
use crate::io::metadata::{ClassificationRecord, DocumentPatch, DocumentRecord, StagedDocumentMetadataManager};
use crate::io::workers::ClassificationWorker;

/// Board key holding the latest [`Completeness`] of the case.
pub const COMPLETENESS_KEY: &str = "case_completeness";

/// Completeness over every classified document recorded for the case.
pub fn completeness_for(
    documents: &[DocumentRecord],
    config: &ClassificationConfig,
) -> Completeness {
    case_completeness(
        &config.required_categories,
        documents
            .iter()
            .filter_map(|doc| doc.classification.as_ref())
            .filter(|c| c.counts_toward_completeness(config.confidence_threshold))
            .map(|c| c.category),
    )
}

pub struct ClassificationAgent<'a> {
    metadata: &'a StagedDocumentMetadataManager,
    classifier: &'a dyn ClassificationWorker,
    config: &'a ClassificationConfig,
}

impl<'a> ClassificationAgent<'a> {
    pub fn new(
        metadata: &'a StagedDocumentMetadataManager,
        classifier: &'a dyn ClassificationWorker,
        config: &'a ClassificationConfig,
    ) -> Self {
        Self {
            metadata,
            classifier,
            config,
        }
    }

    fn classify_one(&self, record: &DocumentRecord) -> ClassificationRecord {
        let hint = hint_from_filename(&record.original_filename);
        match self.classifier.classify(&record.stored_path) {
            Ok(Some(prediction)) => ClassificationRecord {
                status: ClassificationStatus::Completed,
                category: self.config.category_for(&prediction.predicted_class),
                document_type: prediction.predicted_class,
                confidence: prediction.confidence,
                probabilities: prediction.probabilities,
                hint: Some(hint),
                error: None,
                error_kind: None,
                timestamp: Utc::now(),
            },
            Ok(None) => ClassificationRecord::failed(
                "classifier returned no result".to_string(),
                ErrorKind::ClassificationError,
                Some(hint),
            ),
            Err(err) => {
                warn!(document_id = %record.document_id, err = %err, "classification failed");
                ClassificationRecord::failed(
                    err.to_string(),
                    err.kind(ErrorKind::ClassificationError),
                    Some(hint),
                )
            }
        }
    }

    /// Classify, record, and move the document through to `processed`.
    ///
    /// A document already at `classification` keeps its recorded result and is
    /// only moved on.
    fn process_one(&self, record: &DocumentRecord) -> ItemOutcome {
        let id = record.document_id.clone();
        if record.stage == Stage::Classification
            && let Some(classification) = &record.classification
        {
            info!(document_id = %id, "finishing move of classified document");
            return self.finish(&id, classification);
        }
        let classification = self.classify_one(record);
        let mut notes = Vec::new();
        if classification.status == ClassificationStatus::Completed
            && !classification.counts_toward_completeness(self.config.confidence_threshold)
        {
            notes.push(format!(
                "classified as {} ({:.2}) but does not count toward completeness",
                classification.document_type, classification.confidence
            ));
        }
        let patch = DocumentPatch {
            classification: Some(classification),
            notes,
            ..DocumentPatch::default()
        };
        match self.metadata.advance_stage(&id, Stage::Classification, patch) {
            Ok(updated) => match &updated.classification {
                Some(classification) => self.finish(&id, classification),
                None => ItemOutcome::failed(
                    &id,
                    Some(id.clone()),
                    ErrorKind::ClassificationError,
                    "classification not recorded",
                ),
            },
            Err(err) => ItemOutcome::failed(&id, Some(id.clone()), err.kind(), err.to_string()),
        }
    }

    /// Move a classified document to `processed`. A failed move leaves it at
    /// `classification`, where the next pass picks it up again.
    fn finish(&self, id: &str, classification: &ClassificationRecord) -> ItemOutcome {
        if let Err(err) = self.metadata.advance_stage(id, Stage::Processed, DocumentPatch::default()) {
            warn!(document_id = %id, err = %err, "move to processed failed");
            return ItemOutcome::failed(id, Some(id.to_string()), err.kind(), err.to_string());
        }
        if classification.status == ClassificationStatus::Completed {
            ItemOutcome::ok(
                id,
                Some(id.to_string()),
                format!(
                    "{} -> {} ({:.2})",
                    classification.document_type,
                    classification.category.as_str(),
                    classification.confidence
                ),
            )
        } else {
            ItemOutcome::failed(
                id,
                Some(id.to_string()),
                classification.error_kind.unwrap_or(ErrorKind::ClassificationError),
                classification.error.clone().unwrap_or_else(|| "classification failed".to_string()),
            )
        }
    }
}

impl Specialist for ClassificationAgent<'_> {
    fn kind(&self) -> AgentKind {
        AgentKind::Classification
    }

    fn role(&self) -> &'static str {
        "You classify documents into compliance categories and judge whether the case is complete."
    }

    fn actions(&self) -> &'static [&'static str] {
        &["classify"]
    }

    fn observe(&self, task: &AgentTask, _board: &Blackboard) -> Result<Observation> {
        let mut documents = waiting_documents(
            self.metadata,
            &task.case_reference,
            Stage::Extraction,
            &task.document_ids,
        )?;
        documents.extend(waiting_documents(
            self.metadata,
            &task.case_reference,
            Stage::Classification,
            &task.document_ids,
        )?);
        let details: Vec<_> = documents
            .iter()
            .map(|doc| {
                json!({
                    "document_id": doc.document_id,
                    "original_filename": doc.original_filename,
                    "extraction_status": doc.extraction.as_ref().map(|e| e.status),
                    "low_quality": doc.extraction.as_ref().is_some_and(|e| e.low_quality),
                })
            })
            .collect();
        Ok(Observation {
            items: documents.iter().map(|doc| doc.document_id.clone()).collect(),
            details: json!({
                "documents": details,
                "required_categories": self.config.required_categories,
            }),
        })
    }

    fn annotate(&self, observation: &Observation) -> Vec<ItemHint> {
        let Some(docs) = observation.details.get("documents").and_then(|d| d.as_array()) else {
            return Vec::new();
        };
        docs.iter()
            .filter_map(|doc| {
                let id = doc.get("document_id")?.as_str()?;
                let name = doc.get("original_filename")?.as_str()?;
                let hint = hint_from_filename(name);
                Some(ItemHint {
                    item: id.to_string(),
                    note: format!(
                        "filename suggests {} ({}, confidence {:.1})",
                        hint.document_type,
                        hint.category.as_str(),
                        hint.confidence
                    ),
                })
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
        for action in plan {
            match self.metadata.load_document(&task.case_reference, &action.target) {
                Ok(record) => outcomes.push(self.process_one(&record)),
                Err(err) => outcomes.push(ItemOutcome::failed(
                    &action.target,
                    Some(action.target.clone()),
                    err.kind(),
                    err.to_string(),
                )),
            }
        }

        let documents = self
            .metadata
            .load_documents(&task.case_reference)
            .with_context(|| format!("load documents for {}", task.case_reference))?;
        let completeness = completeness_for(&documents, self.config);
        info!(score = completeness.score, missing = ?completeness.missing, "case completeness");
        board.update(COMPLETENESS_KEY, json!(completeness), AgentKind::Classification.as_str());

        Ok(ActOutput {
            data: json!({ "completeness": completeness }),
            outcomes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{DocumentCategory, DocumentStatus};
    use crate::io::workers::Prediction;
    use crate::test_support::{ScriptedClassifier, write_file};

    fn extracted_document(manager: &StagedDocumentMetadataManager, dir: &std::path::Path, name: &str) -> String {
        let file = write_file(dir, name, "some text");
        let id = manager.add_document("C1", &file).expect("add").document_id;
        manager
            .advance_stage(&id, Stage::Extraction, DocumentPatch::default())
            .expect("advance");
        id
    }

    fn run(agent: &ClassificationAgent<'_>, board: &mut Blackboard) -> ActOutput {
        let task = AgentTask {
            case_reference: "C1".to_string(),
            ..AgentTask::default()
        };
        let observation = agent.observe(&task, board).expect("observe");
        let plan = crate::agents::canned_plan(&observation.items, "classify");
        agent
            .act(&task, &plan, &Reasoning::conservative(String::new(), Vec::new()), board)
            .expect("act")
    }

    #[test]
    fn null_result_is_recorded_as_failure() {
        let temp = tempfile::tempdir().expect("tempdir");
        let manager = StagedDocumentMetadataManager::new(temp.path().join("cases"));
        let config = ClassificationConfig::default();
        let good = extracted_document(&manager, temp.path(), "passport.txt");
        let null = extracted_document(&manager, temp.path(), "selfie.txt");
        let classifier = ScriptedClassifier::new()
            .with(&good, Some(Prediction::new("Passport", 0.93)))
            .with(&null, None);
        let agent = ClassificationAgent::new(&manager, &classifier, &config);
        let mut board = Blackboard::in_memory();

        let act = run(&agent, &mut board);

        assert_eq!(act.outcomes.len(), 2);
        let record = manager.load_document("C1", &null).expect("record");
        assert_eq!(record.stage, Stage::Processed);
        assert_eq!(record.status, DocumentStatus::Processed);
        let classification = record.classification.expect("classification");
        assert_eq!(classification.status, ClassificationStatus::Failed);
        assert_eq!(classification.category, DocumentCategory::Unknown);
        assert_eq!(classification.confidence, 0.0);
        assert_eq!(classification.document_type, "unknown");

        let record = manager.load_document("C1", &good).expect("record");
        let classification = record.classification.expect("classification");
        assert_eq!(classification.category, DocumentCategory::IdentityProof);
        assert_eq!(
            classification.hint.expect("hint").category,
            DocumentCategory::IdentityProof
        );
    }

    /// Verifies completeness counts one of three required categories as 1/3.
    #[test]
    fn completeness_reaches_board() {
        let temp = tempfile::tempdir().expect("tempdir");
        let manager = StagedDocumentMetadataManager::new(temp.path().join("cases"));
        let config = ClassificationConfig::default();
        let id = extracted_document(&manager, temp.path(), "bank_statement.txt");
        let classifier =
            ScriptedClassifier::new().with(&id, Some(Prediction::new("Bank Statement", 0.8)));
        let agent = ClassificationAgent::new(&manager, &classifier, &config);
        let mut board = Blackboard::in_memory();

        run(&agent, &mut board);

        let completeness: Completeness = board.get_as(COMPLETENESS_KEY).expect("completeness");
        assert!((completeness.score - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(completeness.present, vec![DocumentCategory::FinancialDocument]);
        assert_eq!(completeness.missing.len(), 2);
    }

    #[test]
    fn low_confidence_does_not_count() {
        let temp = tempfile::tempdir().expect("tempdir");
        let manager = StagedDocumentMetadataManager::new(temp.path().join("cases"));
        let config = ClassificationConfig {
            confidence_threshold: 0.7,
            ..ClassificationConfig::default()
        };
        let id = extracted_document(&manager, temp.path(), "passport.txt");
        let classifier = ScriptedClassifier::new().with(&id, Some(Prediction::new("Passport", 0.4)));
        let agent = ClassificationAgent::new(&manager, &classifier, &config);
        let mut board = Blackboard::in_memory();

        let act = run(&agent, &mut board);

        assert!(act.outcomes[0].ok);
        let completeness: Completeness = board.get_as(COMPLETENESS_KEY).expect("completeness");
        assert_eq!(completeness.score, 0.0);
        let record = manager.load_document("C1", &id).expect("record");
        assert!(record.notes.iter().any(|n| n.contains("does not count")));
    }

    #[test]
    fn blocked_processed_move_is_finished_on_the_next_pass() {
        let temp = tempfile::tempdir().expect("tempdir");
        let manager = StagedDocumentMetadataManager::new(temp.path().join("cases"));
        let config = ClassificationConfig::default();
        let id = extracted_document(&manager, temp.path(), "passport.txt");
        let classifier = ScriptedClassifier::new().with(&id, Some(Prediction::new("Passport", 0.9)));
        let agent = ClassificationAgent::new(&manager, &classifier, &config);
        let mut board = Blackboard::in_memory();
        let blocker = manager.case_dir("C1").join("processed").join(&id);
        std::fs::create_dir_all(blocker.join("inner")).expect("blocker");

        let act = run(&agent, &mut board);
        assert!(!act.outcomes[0].ok);
        assert_eq!(act.outcomes[0].error_kind, Some(ErrorKind::TransactionalMoveFailure));
        let stuck = manager.load_document("C1", &id).expect("record");
        assert_eq!(stuck.stage, Stage::Classification);
        assert_eq!(manager.get_pending_documents("C1").expect("pending").len(), 1);

        std::fs::remove_dir_all(&blocker).expect("unblock");
        let act = run(&agent, &mut board);
        assert!(act.outcomes[0].ok);
        let record = manager.load_document("C1", &id).expect("record");
        assert_eq!(record.stage, Stage::Processed);
        assert_eq!(record.status, DocumentStatus::Processed);
        assert_eq!(record.classification.expect("classification").document_type, "Passport");
        assert_eq!(classifier.calls(), vec![id.clone()]);
        assert!(manager.get_pending_documents("C1").expect("pending").is_empty());
    }

    #[test]
    fn only_extracted_documents_are_observed() {
        let temp = tempfile::tempdir().expect("tempdir");
        let manager = StagedDocumentMetadataManager::new(temp.path().join("cases"));
        let config = ClassificationConfig::default();
        let classifier = ScriptedClassifier::new();
        let agent = ClassificationAgent::new(&manager, &classifier, &config);
        let waiting = extracted_document(&manager, temp.path(), "passport.txt");
        manager
            .add_document("C1", &write_file(temp.path(), "lease.txt", "lease"))
            .expect("add");

        let task = AgentTask {
            case_reference: "C1".to_string(),
            ..AgentTask::default()
        };
        let observation = agent.observe(&task, &Blackboard::in_memory()).expect("observe");
        assert_eq!(observation.items, vec![waiting.clone()]);
        let hints = agent.annotate(&observation);
        assert!(hints[0].note.contains("Passport"));
    }
}
