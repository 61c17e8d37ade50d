//! Shared deterministic types for the casework core.
//!
//! These types are the stable vocabulary persisted in metadata records and the
//! blackboard. Their serialized spellings are part of the on-disk format.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Position of a document in the staged lifecycle.
///
/// Declaration order is lifecycle order: each stage directory names the last
/// processing step the document completed. Extraction precedes classification
/// on purpose, not the intake, classification, extraction, processed listing
/// used by older case layouts: directories follow the order the steps run in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Intake,
    Extraction,
    Classification,
    Processed,
}

impl Stage {
    pub const ALL: [Stage; 4] = [
        Stage::Intake,
        Stage::Extraction,
        Stage::Classification,
        Stage::Processed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Intake => "intake",
            Stage::Extraction => "extraction",
            Stage::Classification => "classification",
            Stage::Processed => "processed",
        }
    }

    /// The only stage a document may move to from `self`.
    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::Intake => Some(Stage::Extraction),
            Stage::Extraction => Some(Stage::Classification),
            Stage::Classification => Some(Stage::Processed),
            Stage::Processed => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s.trim().to_ascii_lowercase())
            .ok_or_else(|| {
                format!("unknown stage '{s}' (expected intake, extraction, classification, processed)")
            })
    }
}

/// Summary status of a document, as listed in `case_metadata.json`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Validated,
    Extracted,
    Classified,
    Processed,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DocumentStatus::Validated => "validated",
            DocumentStatus::Extracted => "extracted",
            DocumentStatus::Classified => "classified",
            DocumentStatus::Processed => "processed",
            DocumentStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, DocumentStatus::Processed | DocumentStatus::Failed)
    }

    /// Status a document carries once it has arrived in `stage`.
    pub fn for_stage(stage: Stage) -> Self {
        match stage {
            Stage::Intake => DocumentStatus::Validated,
            Stage::Extraction => DocumentStatus::Extracted,
            Stage::Classification => DocumentStatus::Classified,
            Stage::Processed => DocumentStatus::Processed,
        }
    }
}

/// Intake outcome stored on a record. Rejected files are never registered, so
/// every record carries `validated`; rejections live on the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntakeStatus {
    Validated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractionStatus {
    Completed,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClassificationStatus {
    Completed,
    Failed,
}

/// Outcome of one agent execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Success,
    Partial,
    Failed,
}

impl AgentStatus {
    /// Aggregate per-item outcomes: all ok is success, none ok is failed.
    pub fn from_counts(succeeded: usize, total: usize) -> Self {
        if total == 0 || succeeded == total {
            AgentStatus::Success
        } else if succeeded == 0 {
            AgentStatus::Failed
        } else {
            AgentStatus::Partial
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AgentStatus::Success => "success",
            AgentStatus::Partial => "partial",
            AgentStatus::Failed => "failed",
        }
    }
}

/// Failure taxonomy recorded in history and per-document records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Deterministic check failed; terminal for that document.
    ValidationError,
    ExtractionError,
    ClassificationError,
    /// Worker or reasoning call failed in transit; retryable.
    TransportError,
    ReasoningMalformedOutput,
    TransactionalMoveFailure,
    DependencyUnmet,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::ValidationError => "validation_error",
            ErrorKind::ExtractionError => "extraction_error",
            ErrorKind::ClassificationError => "classification_error",
            ErrorKind::TransportError => "transport_error",
            ErrorKind::ReasoningMalformedOutput => "reasoning_malformed_output",
            ErrorKind::TransactionalMoveFailure => "transactional_move_failure",
            ErrorKind::DependencyUnmet => "dependency_unmet",
        }
    }

    /// The document still reached the step's stage; only its record carries the error.
    pub fn is_degraded(self) -> bool {
        matches!(
            self,
            ErrorKind::ExtractionError
                | ErrorKind::ClassificationError
                | ErrorKind::TransportError
                | ErrorKind::ReasoningMalformedOutput
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowPhase {
    Planning,
    Execution,
    Reflection,
    Completed,
    Failed,
}

/// Specialist agents the planner can delegate to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    Intake,
    Extraction,
    Classification,
}

impl AgentKind {
    pub const ALL: [AgentKind; 3] = [
        AgentKind::Intake,
        AgentKind::Extraction,
        AgentKind::Classification,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AgentKind::Intake => "intake",
            AgentKind::Extraction => "extraction",
            AgentKind::Classification => "classification",
        }
    }

    /// Stage a document reaches once this agent has handled it.
    pub fn completes_stage(self) -> Stage {
        match self {
            AgentKind::Intake => Stage::Intake,
            AgentKind::Extraction => Stage::Extraction,
            AgentKind::Classification => Stage::Classification,
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AgentKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s.trim().to_ascii_lowercase())
            .ok_or_else(|| format!("unknown agent '{s}'"))
    }
}

/// Compliance category a classified document counts toward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentCategory {
    IdentityProof,
    AddressProof,
    FinancialDocument,
    Unknown,
}

impl DocumentCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            DocumentCategory::IdentityProof => "identity_proof",
            DocumentCategory::AddressProof => "address_proof",
            DocumentCategory::FinancialDocument => "financial_document",
            DocumentCategory::Unknown => "unknown",
        }
    }
}

/// Text extraction method chosen per document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionMethod {
    DirectText,
    OcrLocal,
    OcrRemote,
}

impl ExtractionMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            ExtractionMethod::DirectText => "direct_text",
            ExtractionMethod::OcrLocal => "ocr_local",
            ExtractionMethod::OcrRemote => "ocr_remote",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Normal,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Simple,
    Moderate,
    Complex,
}
