//! Extraction: pull text out of registered documents and score its quality.

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::agents::{ActOutput, AgentTask, ItemHint, ItemOutcome, Observation, PlannedAction, Reasoning, Specialist};
use crate::blackboard::Blackboard;
use crate::core::heuristics::{extraction_methods, format_family};
use crate::core::quality::{is_low_quality, text_quality_score};
use crate::core::types::{AgentKind, DocumentStatus, ErrorKind, ExtractionMethod, ExtractionStatus, Stage};
use crate::io::config::ExtractionConfig;
use crate::io::metadata::{DocumentPatch, DocumentRecord, ExtractionRecord, MetadataError, StagedDocumentMetadataManager};
use crate::io::workers::{ExtractedText, Extractors};

const METHODS: [ExtractionMethod; 3] = [
    ExtractionMethod::DirectText,
    ExtractionMethod::OcrLocal,
    ExtractionMethod::OcrRemote,
];

/// Documents at `stage` that are still in flight, optionally limited to `only`.
pub(crate) fn waiting_documents(
    metadata: &StagedDocumentMetadataManager,
    case_reference: &str,
    stage: Stage,
    only: &[String],
) -> Result<Vec<DocumentRecord>> {
    let documents = metadata
        .get_documents_by_stage(case_reference, stage)
        .with_context(|| format!("list {stage} documents for {case_reference}"))?;
    Ok(documents
        .into_iter()
        .filter(|doc| !doc.status.is_terminal())
        .filter(|doc| only.is_empty() || only.contains(&doc.document_id))
        .collect())
}

fn extension_of(record: &DocumentRecord) -> &str {
    record
        .document_id
        .rsplit_once('.')
        .map_or("", |(_, ext)| ext)
}

/// Move the method named in a "prefer ..." note to the front of `methods`.
fn apply_preference(methods: &mut Vec<ExtractionMethod>, notes: &[&str]) {
    let preferred = notes
        .iter()
        .filter(|note| note.contains("prefer"))
        .find_map(|note| {
            METHODS
                .into_iter()
                .filter_map(|method| note.find(method.as_str()).map(|pos| (pos, method)))
                .min_by_key(|(pos, _)| *pos)
                .map(|(_, method)| method)
        });
    if let Some(method) = preferred
        && let Some(pos) = methods.iter().position(|m| *m == method)
    {
        let method = methods.remove(pos);
        methods.insert(0, method);
    }
}

pub struct ExtractionAgent<'a> {
    metadata: &'a StagedDocumentMetadataManager,
    extractors: &'a Extractors,
    config: &'a ExtractionConfig,
}

impl<'a> ExtractionAgent<'a> {
    pub fn new(
        metadata: &'a StagedDocumentMetadataManager,
        extractors: &'a Extractors,
        config: &'a ExtractionConfig,
    ) -> Self {
        Self {
            metadata,
            extractors,
            config,
        }
    }

    fn planned_methods(&self, record: &DocumentRecord) -> Vec<ExtractionMethod> {
        extraction_methods(
            format_family(extension_of(record)),
            self.extractors.has_remote_ocr(),
        )
    }

    /// Try `methods` in order; the first success wins.
    fn run_methods(
        &self,
        record: &DocumentRecord,
        methods: &[ExtractionMethod],
    ) -> (ExtractionMethod, Result<ExtractedText, (ErrorKind, String)>, Vec<String>) {
        let mut attempts = Vec::new();
        let mut last_method = methods.first().copied().unwrap_or(ExtractionMethod::DirectText);
        let mut last_error = (
            ErrorKind::ExtractionError,
            "no extraction method is configured for this format".to_string(),
        );
        for &method in methods {
            let Some(worker) = self.extractors.get(method) else {
                attempts.push(format!("{}: not configured", method.as_str()));
                continue;
            };
            last_method = method;
            match worker.extract(&record.stored_path) {
                Ok(text) => {
                    attempts.push(format!("{}: ok", method.as_str()));
                    return (method, Ok(text), attempts);
                }
                Err(err) => {
                    warn!(document_id = %record.document_id, method = method.as_str(), err = %err, "extraction method failed");
                    attempts.push(format!("{}: {err}", method.as_str()));
                    last_error = (err.kind(ErrorKind::ExtractionError), err.to_string());
                }
            }
        }
        (last_method, Err(last_error), attempts)
    }

    fn extract_one(&self, record: &DocumentRecord, reasoning: &Reasoning) -> ItemOutcome {
        let id = record.document_id.clone();
        let mut methods = self.planned_methods(record);
        apply_preference(&mut methods, &reasoning.notes_for(&id));

        let (method, result, attempts) = self.run_methods(record, &methods);
        let mut notes = Vec::new();
        let extraction = match result {
            Ok(extracted) => {
                let quality_score = text_quality_score(&extracted.text);
                let low_quality = is_low_quality(quality_score, self.config.low_quality_threshold);
                if low_quality {
                    notes.push(format!("low quality extraction (score {quality_score:.2})"));
                }
                let text_file = match self.metadata.write_case_artifact(
                    &record.case_reference,
                    &format!("{id}.extracted.txt"),
                    &extracted.text,
                ) {
                    Ok(name) => Some(name),
                    Err(err) => {
                        warn!(document_id = %id, err = %err, "could not store extracted text");
                        notes.push(format!("extracted text not stored: {err}"));
                        None
                    }
                };
                ExtractionRecord {
                    status: ExtractionStatus::Completed,
                    method,
                    quality_score,
                    confidence: extracted.confidence,
                    low_quality,
                    text_file,
                    char_count: extracted.text.chars().count(),
                    attempts,
                    error: None,
                    error_kind: None,
                    timestamp: Utc::now(),
                }
            }
            Err((kind, error)) => ExtractionRecord {
                status: ExtractionStatus::Error,
                method,
                quality_score: 0.0,
                confidence: 0.0,
                low_quality: true,
                text_file: None,
                char_count: 0,
                attempts,
                error: Some(error),
                error_kind: Some(kind),
                timestamp: Utc::now(),
            },
        };

        let completed = extraction.status == ExtractionStatus::Completed;
        let detail = match (&extraction.error, extraction.low_quality) {
            (Some(error), _) => error.clone(),
            (None, true) => format!("{} text, low quality", method.as_str()),
            (None, false) => format!("{} text, quality {:.2}", method.as_str(), extraction.quality_score),
        };
        let error_kind = extraction.error_kind;
        let patch = DocumentPatch {
            extraction: Some(extraction),
            notes,
            ..DocumentPatch::default()
        };
        match self.metadata.advance_stage(&id, Stage::Extraction, patch) {
            Ok(_) if completed => ItemOutcome::ok(&id, Some(id.clone()), detail),
            Ok(_) => ItemOutcome::failed(
                &id,
                Some(id.clone()),
                error_kind.unwrap_or(ErrorKind::ExtractionError),
                detail,
            ),
            Err(err) => self.stage_failure(&id, err),
        }
    }

    fn stage_failure(&self, id: &str, err: MetadataError) -> ItemOutcome {
        warn!(document_id = %id, err = %err, "stage move failed");
        if matches!(err, MetadataError::MissingFile { .. }) {
            let marked = self.metadata.update_document(
                id,
                DocumentPatch {
                    status: Some(DocumentStatus::Failed),
                    notes: vec![err.to_string()],
                    ..DocumentPatch::default()
                },
            );
            if let Err(mark_err) = marked {
                warn!(document_id = %id, err = %mark_err, "could not mark document failed");
            }
        }
        ItemOutcome::failed(id, Some(id.to_string()), err.kind(), err.to_string())
    }
}

impl Specialist for ExtractionAgent<'_> {
    fn kind(&self) -> AgentKind {
        AgentKind::Extraction
    }

    fn role(&self) -> &'static str {
        "You choose how to extract text from each document (direct text, local OCR, remote OCR) and in what order."
    }

    fn actions(&self) -> &'static [&'static str] {
        &["extract"]
    }

    fn observe(&self, task: &AgentTask, _board: &Blackboard) -> Result<Observation> {
        let documents = waiting_documents(
            self.metadata,
            &task.case_reference,
            Stage::Intake,
            &task.document_ids,
        )?;
        let details: Vec<_> = documents
            .iter()
            .map(|doc| {
                json!({
                    "document_id": doc.document_id,
                    "original_filename": doc.original_filename,
                    "mime_type": doc.mime_type,
                    "size_bytes": doc.size_bytes,
                    "methods": self.planned_methods(doc).iter().map(|m| m.as_str()).collect::<Vec<_>>(),
                })
            })
            .collect();
        Ok(Observation {
            items: documents.iter().map(|doc| doc.document_id.clone()).collect(),
            details: json!({ "documents": details, "remote_ocr": self.extractors.has_remote_ocr() }),
        })
    }

    fn annotate(&self, observation: &Observation) -> Vec<ItemHint> {
        observation
            .details
            .get("documents")
            .and_then(|docs| docs.as_array())
            .map(|docs| {
                docs.iter()
                    .filter_map(|doc| {
                        let id = doc.get("document_id")?.as_str()?;
                        let methods: Vec<&str> = doc
                            .get("methods")?
                            .as_array()?
                            .iter()
                            .filter_map(|m| m.as_str())
                            .collect();
                        Some(ItemHint {
                            item: id.to_string(),
                            note: format!("planned methods: {}", methods.join(" > ")),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn act(
        &self,
        task: &AgentTask,
        plan: &[PlannedAction],
        reasoning: &Reasoning,
        _board: &mut Blackboard,
    ) -> Result<ActOutput> {
        let mut outcomes = Vec::new();
        let mut low_quality = Vec::new();
        for action in plan {
            let record = match self.metadata.load_document(&task.case_reference, &action.target) {
                Ok(record) => record,
                Err(err) => {
                    outcomes.push(ItemOutcome::failed(&action.target, Some(action.target.clone()), err.kind(), err.to_string()));
                    continue;
                }
            };
            let outcome = self.extract_one(&record, reasoning);
            if outcome.ok && outcome.detail.contains("low quality") {
                low_quality.push(record.document_id.clone());
            }
            debug!(document_id = %record.document_id, ok = outcome.ok, "extraction finished");
            outcomes.push(outcome);
        }
        let extracted: Vec<_> = outcomes
            .iter()
            .filter(|o| o.ok)
            .filter_map(|o| o.document_id.clone())
            .collect();
        info!(extracted = extracted.len(), total = outcomes.len(), "extraction pass done");
        Ok(ActOutput {
            data: json!({ "extracted": extracted, "low_quality": low_quality }),
            outcomes,
        })
    }
}
