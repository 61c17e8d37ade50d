//! Staged document metadata: identity, stage placement, and atomic stage moves.
//!
//! Layout per case:
//!
//! ```text
//! <cases_dir>/<CASE>/
//!   intake/ extraction/ classification/ processed/   stage directories
//!   <document_id>.metadata.json                      one record per document
//!   case_metadata.json                               {document_id, status} list + counts
//! ```
//!
//! The per-document records are the single source of truth. The case summary
//! list is an index; [`StagedDocumentMetadataManager::get_case_summary`] always
//! rescans the records.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::core::document_id::{
    format_document_id, normalize_case_reference, next_sequence, parse_document_id,
};
use crate::core::heuristics::CategoryHint;
use crate::core::stage::check_transition;
use crate::core::types::{
    ClassificationStatus, DocumentCategory, DocumentStatus, ErrorKind, ExtractionMethod,
    ExtractionStatus, IntakeStatus, Stage,
};
use crate::io::fs::{read_json, write_json_atomic};

const RECORD_SUFFIX: &str = ".metadata.json";
const CASE_METADATA_FILE: &str = "case_metadata.json";

#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("invalid case reference: {0}")]
    InvalidCase(String),

    #[error("malformed document id '{0}'")]
    InvalidDocumentId(String),

    #[error("document {0} not found")]
    NotFound(String),

    #[error("cannot move {document_id} from {from} to {to}: {reason}")]
    InvalidTransition {
        document_id: String,
        from: Stage,
        to: Stage,
        reason: String,
    },

    #[error("stored file for {document_id} missing at {}", path.display())]
    MissingFile { document_id: String, path: PathBuf },

    #[error("moving {document_id} to {to} failed: {source}")]
    MoveFailed {
        document_id: String,
        to: Stage,
        #[source]
        source: io::Error,
    },

    #[error("writing record for {document_id} failed, file moved back: {reason}")]
    RecordWriteFailed { document_id: String, reason: String },

    #[error("writing record for {document_id} failed and moving the file back failed too: {reason}")]
    RollbackFailed { document_id: String, reason: String },

    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl MetadataError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            MetadataError::InvalidCase(_)
            | MetadataError::InvalidDocumentId(_)
            | MetadataError::NotFound(_)
            | MetadataError::InvalidTransition { .. } => ErrorKind::ValidationError,
            MetadataError::MissingFile { .. }
            | MetadataError::MoveFailed { .. }
            | MetadataError::RecordWriteFailed { .. }
            | MetadataError::RollbackFailed { .. } => ErrorKind::TransactionalMoveFailure,
            MetadataError::Io { .. } | MetadataError::Store(_) => ErrorKind::TransportError,
        }
    }
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> MetadataError + '_ {
    move |source| MetadataError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntakeRecord {
    pub status: IntakeStatus,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inferred: Option<CategoryHint>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub anomalies: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionRecord {
    pub status: ExtractionStatus,
    /// Method that produced the text, or the last one tried on error.
    pub method: ExtractionMethod,
    pub quality_score: f64,
    pub confidence: f64,
    pub low_quality: bool,
    /// Extracted text file, relative to the case directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_file: Option<String>,
    pub char_count: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attempts: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationRecord {
    pub status: ClassificationStatus,
    pub document_type: String,
    pub category: DocumentCategory,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub probabilities: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<CategoryHint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    pub timestamp: DateTime<Utc>,
}

impl ClassificationRecord {
    /// Structured failure record: category unknown, confidence 0.
    pub fn failed(error: String, kind: ErrorKind, hint: Option<CategoryHint>) -> Self {
        Self {
            status: ClassificationStatus::Failed,
            document_type: "unknown".to_string(),
            category: DocumentCategory::Unknown,
            confidence: 0.0,
            probabilities: BTreeMap::new(),
            hint,
            error: Some(error),
            error_kind: Some(kind),
            timestamp: Utc::now(),
        }
    }

    pub fn counts_toward_completeness(&self, confidence_threshold: f64) -> bool {
        self.status == ClassificationStatus::Completed
            && self.category != DocumentCategory::Unknown
            && self.confidence >= confidence_threshold
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageChange {
    pub stage: Stage,
    pub at: DateTime<Utc>,
}

/// Per-document record, `<document_id>.metadata.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub document_id: String,
    pub case_reference: String,
    pub original_filename: String,
    pub original_path: PathBuf,
    pub stored_path: PathBuf,
    pub stage: Stage,
    pub status: DocumentStatus,
    pub size_bytes: u64,
    pub content_hash: String,
    pub mime_type: String,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub intake: IntakeRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extraction: Option<ExtractionRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classification: Option<ClassificationRecord>,
    #[serde(default)]
    pub stage_history: Vec<StageChange>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
}

/// Fields to merge into a record. `None` leaves the field unchanged.
#[derive(Debug, Clone, Default)]
pub struct DocumentPatch {
    pub status: Option<DocumentStatus>,
    pub intake: Option<IntakeRecord>,
    pub extraction: Option<ExtractionRecord>,
    pub classification: Option<ClassificationRecord>,
    pub notes: Vec<String>,
}

impl DocumentPatch {
    fn apply(self, record: &mut DocumentRecord) {
        if let Some(status) = self.status {
            record.status = status;
        }
        if let Some(intake) = self.intake {
            record.intake = intake;
        }
        if let Some(extraction) = self.extraction {
            record.extraction = Some(extraction);
        }
        if let Some(classification) = self.classification {
            record.classification = Some(classification);
        }
        record.notes.extend(self.notes);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseDocumentEntry {
    pub document_id: String,
    pub status: DocumentStatus,
}

/// `case_metadata.json`: an index of ids and statuses, never per-document fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseMetadata {
    pub case_reference: String,
    pub documents: Vec<CaseDocumentEntry>,
    pub document_summary: BTreeMap<DocumentStatus, usize>,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl CaseMetadata {
    fn upsert(&mut self, document_id: &str, status: DocumentStatus) {
        match self
            .documents
            .iter_mut()
            .find(|entry| entry.document_id == document_id)
        {
            Some(entry) => entry.status = status,
            None => self.documents.push(CaseDocumentEntry {
                document_id: document_id.to_string(),
                status,
            }),
        }
        self.document_summary = count_statuses(self.documents.iter().map(|e| e.status));
        self.last_updated = Utc::now();
    }
}

/// Case view recomputed from the per-document records.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CaseSummary {
    pub case_reference: String,
    pub documents: Vec<DocumentRecord>,
    pub document_summary: BTreeMap<DocumentStatus, usize>,
    pub stage_summary: BTreeMap<Stage, usize>,
    pub created_at: DateTime<Utc>,
}

fn count_statuses(statuses: impl Iterator<Item = DocumentStatus>) -> BTreeMap<DocumentStatus, usize> {
    let mut counts = BTreeMap::new();
    for status in statuses {
        *counts.entry(status).or_insert(0) += 1;
    }
    counts
}

/// Owns document identity and stage placement for every case under `cases_dir`.
#[derive(Debug, Clone)]
pub struct StagedDocumentMetadataManager {
    cases_dir: PathBuf,
}

impl StagedDocumentMetadataManager {
    pub fn new(cases_dir: impl Into<PathBuf>) -> Self {
        Self {
            cases_dir: cases_dir.into(),
        }
    }

    pub fn cases_dir(&self) -> &Path {
        &self.cases_dir
    }

    pub fn case_dir(&self, case_reference: &str) -> PathBuf {
        self.cases_dir.join(case_reference)
    }

    fn record_path(&self, case_reference: &str, document_id: &str) -> PathBuf {
        self.case_dir(case_reference)
            .join(format!("{document_id}{RECORD_SUFFIX}"))
    }

    fn stage_path(&self, case_reference: &str, stage: Stage, document_id: &str) -> PathBuf {
        self.case_dir(case_reference)
            .join(stage.as_str())
            .join(document_id)
    }

    fn case_of(document_id: &str) -> Result<String, MetadataError> {
        parse_document_id(document_id)
            .map(|id| id.case_reference)
            .ok_or_else(|| MetadataError::InvalidDocumentId(document_id.to_string()))
    }

    pub fn case_exists(&self, case_reference: &str) -> bool {
        normalize_case_reference(case_reference)
            .map(|case| self.case_dir(&case).join(CASE_METADATA_FILE).exists())
            .unwrap_or(false)
    }

    /// Create the case layout on first reference; returns the normalized reference.
    #[instrument(skip(self))]
    pub fn ensure_case(&self, case_reference: &str) -> Result<String, MetadataError> {
        let case = normalize_case_reference(case_reference).map_err(MetadataError::InvalidCase)?;
        let case_dir = self.case_dir(&case);
        for stage in Stage::ALL {
            let dir = case_dir.join(stage.as_str());
            fs::create_dir_all(&dir).map_err(io_err(&dir))?;
        }
        let meta_path = case_dir.join(CASE_METADATA_FILE);
        if !meta_path.exists() {
            let now = Utc::now();
            let meta = CaseMetadata {
                case_reference: case.clone(),
                documents: Vec::new(),
                document_summary: BTreeMap::new(),
                created_at: now,
                last_updated: now,
            };
            write_json_atomic(&meta_path, &meta)?;
            info!(case = %case, "created case");
        }
        Ok(case)
    }

    pub fn load_case_metadata(&self, case_reference: &str) -> Result<CaseMetadata, MetadataError> {
        let case = normalize_case_reference(case_reference).map_err(MetadataError::InvalidCase)?;
        let path = self.case_dir(&case).join(CASE_METADATA_FILE);
        if !path.exists() {
            return Err(MetadataError::NotFound(format!("case {case}")));
        }
        Ok(read_json(&path)?)
    }

    fn write_case_entry(&self, case_reference: &str, document_id: &str, status: DocumentStatus) -> Result<(), MetadataError> {
        let mut meta = self.load_case_metadata(case_reference)?;
        meta.upsert(document_id, status);
        write_json_atomic(&self.case_dir(case_reference).join(CASE_METADATA_FILE), &meta)?;
        Ok(())
    }

    /// Ids of every document recorded for the case, sorted.
    pub fn document_ids(&self, case_reference: &str) -> Result<Vec<String>, MetadataError> {
        let case_dir = self.case_dir(case_reference);
        if !case_dir.exists() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in fs::read_dir(&case_dir).map_err(io_err(&case_dir))? {
            let entry = entry.map_err(io_err(&case_dir))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(id) = name.strip_suffix(RECORD_SUFFIX) {
                ids.push(id.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Register `source` in the case: allocate an id, copy into `intake/`, write
    /// the record, and append `{document_id, status}` to the case index.
    #[instrument(skip(self), fields(source = %source.display()))]
    pub fn add_document(&self, case_reference: &str, source: &Path) -> Result<DocumentRecord, MetadataError> {
        let case = self.ensure_case(case_reference)?;
        let file_meta = fs::metadata(source).map_err(io_err(source))?;
        if !file_meta.is_file() {
            return Err(MetadataError::Io {
                path: source.to_path_buf(),
                source: io::Error::new(io::ErrorKind::InvalidInput, "not a regular file"),
            });
        }

        let existing = self.document_ids(&case)?;
        let seq = next_sequence(&case, existing.iter().map(String::as_str));
        let extension = source
            .extension()
            .map(|ext| ext.to_string_lossy().into_owned())
            .unwrap_or_default();
        let document_id = format_document_id(&case, seq, &extension);

        let stored_path = self.stage_path(&case, Stage::Intake, &document_id);
        let content_hash = hash_file(source)?;
        fs::copy(source, &stored_path).map_err(io_err(&stored_path))?;

        let now = Utc::now();
        let record = DocumentRecord {
            document_id: document_id.clone(),
            case_reference: case.clone(),
            original_filename: source
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default(),
            original_path: source.to_path_buf(),
            stored_path,
            stage: Stage::Intake,
            status: DocumentStatus::Validated,
            size_bytes: file_meta.len(),
            content_hash,
            mime_type: mime_guess::from_path(source)
                .first_or_octet_stream()
                .essence_str()
                .to_string(),
            created_at: now,
            last_updated: now,
            intake: IntakeRecord {
                status: IntakeStatus::Validated,
                timestamp: now,
                inferred: None,
                anomalies: Vec::new(),
            },
            extraction: None,
            classification: None,
            stage_history: vec![StageChange {
                stage: Stage::Intake,
                at: now,
            }],
            notes: Vec::new(),
        };
        if let Err(err) = write_json_atomic(&self.record_path(&case, &document_id), &record) {
            // Do not leave an unrecorded file in the stage directory.
            if let Err(cleanup) = fs::remove_file(&record.stored_path) {
                warn!(err = %cleanup, "failed to remove copied file after record write failure");
            }
            return Err(err.into());
        }
        self.write_case_entry(&case, &document_id, record.status)?;
        info!(document_id = %document_id, "document registered");
        Ok(record)
    }

    pub fn load_document(&self, case_reference: &str, document_id: &str) -> Result<DocumentRecord, MetadataError> {
        let path = self.record_path(case_reference, document_id);
        if !path.exists() {
            return Err(MetadataError::NotFound(document_id.to_string()));
        }
        Ok(read_json(&path)?)
    }

    /// Merge `patch` into a record without moving the file.
    #[instrument(skip(self, patch))]
    pub fn update_document(&self, document_id: &str, patch: DocumentPatch) -> Result<DocumentRecord, MetadataError> {
        let case = Self::case_of(document_id)?;
        let mut record = self.load_document(&case, document_id)?;
        let previous_status = record.status;
        patch.apply(&mut record);
        record.last_updated = Utc::now();
        write_json_atomic(&self.record_path(&case, document_id), &record)?;
        if record.status != previous_status
            && let Err(err) = self.write_case_entry(&case, document_id, record.status)
        {
            warn!(err = %err, "case index update failed; records remain authoritative");
        }
        Ok(record)
    }

    /// Move a document to `target` and update its record as one operation.
    ///
    /// If the move fails nothing changes. If the record write fails the file is
    /// moved back, so file and record always agree on the stage.
    #[instrument(skip(self, patch), fields(target = %target))]
    pub fn advance_stage(
        &self,
        document_id: &str,
        target: Stage,
        patch: DocumentPatch,
    ) -> Result<DocumentRecord, MetadataError> {
        let case = Self::case_of(document_id)?;
        let record = self.load_document(&case, document_id)?;
        check_transition(record.stage, target).map_err(|violation| {
            MetadataError::InvalidTransition {
                document_id: document_id.to_string(),
                from: record.stage,
                to: target,
                reason: violation.describe(),
            }
        })?;

        let from_path = self.stage_path(&case, record.stage, document_id);
        if !from_path.is_file() {
            return Err(MetadataError::MissingFile {
                document_id: document_id.to_string(),
                path: from_path,
            });
        }
        let to_path = self.stage_path(&case, target, document_id);
        let move_failed = |source: io::Error| MetadataError::MoveFailed {
            document_id: document_id.to_string(),
            to: target,
            source,
        };
        if let Some(parent) = to_path.parent() {
            fs::create_dir_all(parent).map_err(move_failed)?;
        }
        if to_path.exists() {
            return Err(move_failed(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} already exists", to_path.display()),
            )));
        }
        fs::rename(&from_path, &to_path).map_err(move_failed)?;

        let mut updated = record.clone();
        let now = Utc::now();
        updated.stage = target;
        updated.status = DocumentStatus::for_stage(target);
        updated.stored_path = to_path.clone();
        updated.stage_history.push(StageChange { stage: target, at: now });
        updated.last_updated = now;
        patch.apply(&mut updated);

        if let Err(err) = write_json_atomic(&self.record_path(&case, document_id), &updated) {
            let reason = format!("{err:#}");
            return match fs::rename(&to_path, &from_path) {
                Ok(()) => {
                    warn!(%reason, "record write failed, stage move rolled back");
                    Err(MetadataError::RecordWriteFailed {
                        document_id: document_id.to_string(),
                        reason,
                    })
                }
                Err(rollback) => {
                    error!(%reason, err = %rollback, "stage move rollback failed");
                    Err(MetadataError::RollbackFailed {
                        document_id: document_id.to_string(),
                        reason: format!("{reason}; rollback: {rollback}"),
                    })
                }
            };
        }

        if let Err(err) = self.write_case_entry(&case, document_id, updated.status) {
            warn!(err = %err, "case index update failed; records remain authoritative");
        }
        debug!(from = %record.stage, "stage advanced");
        Ok(updated)
    }

    /// All records of a case, sorted by id. Reads records only; writes nothing.
    pub fn load_documents(&self, case_reference: &str) -> Result<Vec<DocumentRecord>, MetadataError> {
        let case = normalize_case_reference(case_reference).map_err(MetadataError::InvalidCase)?;
        self.document_ids(&case)?
            .iter()
            .map(|id| self.load_document(&case, id))
            .collect()
    }

    /// Case view recomputed from the per-document records.
    pub fn get_case_summary(&self, case_reference: &str) -> Result<CaseSummary, MetadataError> {
        let meta = self.load_case_metadata(case_reference)?;
        let documents = self.load_documents(&meta.case_reference)?;
        let document_summary = count_statuses(documents.iter().map(|d| d.status));
        let mut stage_summary = BTreeMap::new();
        for doc in &documents {
            *stage_summary.entry(doc.stage).or_insert(0) += 1;
        }
        Ok(CaseSummary {
            case_reference: meta.case_reference,
            documents,
            document_summary,
            stage_summary,
            created_at: meta.created_at,
        })
    }

    pub fn get_stage_summary(&self, case_reference: &str) -> Result<BTreeMap<Stage, usize>, MetadataError> {
        Ok(self.get_case_summary(case_reference)?.stage_summary)
    }

    /// Documents not yet in a terminal status.
    pub fn get_pending_documents(&self, case_reference: &str) -> Result<Vec<DocumentRecord>, MetadataError> {
        Ok(self
            .load_documents(case_reference)?
            .into_iter()
            .filter(|doc| !doc.status.is_terminal())
            .collect())
    }

    pub fn get_documents_by_stage(
        &self,
        case_reference: &str,
        stage: Stage,
    ) -> Result<Vec<DocumentRecord>, MetadataError> {
        Ok(self
            .load_documents(case_reference)?
            .into_iter()
            .filter(|doc| doc.stage == stage)
            .collect())
    }

    /// Case references with a case index, sorted.
    pub fn list_cases(&self) -> Result<Vec<String>, MetadataError> {
        if !self.cases_dir.exists() {
            return Ok(Vec::new());
        }
        let mut cases = Vec::new();
        for entry in fs::read_dir(&self.cases_dir).map_err(io_err(&self.cases_dir))? {
            let entry = entry.map_err(io_err(&self.cases_dir))?;
            if entry.path().join(CASE_METADATA_FILE).is_file() {
                cases.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        cases.sort();
        Ok(cases)
    }

    /// Write text next to the records, returning the path relative to the case dir.
    pub fn write_case_artifact(&self, case_reference: &str, file_name: &str, contents: &str) -> Result<String, MetadataError> {
        let path = self.case_dir(case_reference).join(file_name);
        crate::io::fs::write_atomic(&path, contents.as_bytes())?;
        Ok(file_name.to_string())
    }
}

fn hash_file(path: &Path) -> Result<String, MetadataError> {
    let mut file = fs::File::open(path).map_err(io_err(path))?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher).map_err(io_err(path))?;
    Ok(hex::encode(hasher.finalize()))
}
