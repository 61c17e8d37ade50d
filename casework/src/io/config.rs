//! Pipeline configuration stored as `casework.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::document_id::normalize_extension;
use crate::core::types::DocumentCategory;

/// Pipeline configuration (TOML).
///
/// Missing fields default to values that run fully offline: no reasoning
/// provider and no remote workers, so every call site uses its fallback.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Root directory holding one subdirectory per case.
    pub cases_dir: PathBuf,
    pub intake: IntakeConfig,
    pub extraction: ExtractionConfig,
    pub classification: ClassificationConfig,
    pub reasoning: ReasoningConfig,
    pub workers: WorkerConfig,
    pub feedback: FeedbackConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IntakeConfig {
    /// Accepted file extensions, with leading dot.
    pub allowed_extensions: Vec<String>,
    pub max_document_size_mb: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExtractionConfig {
    /// Quality scores below this are flagged as low quality.
    pub low_quality_threshold: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClassificationConfig {
    pub required_categories: Vec<DocumentCategory>,
    /// Maps a worker's `predicted_class` to a compliance category.
    pub class_map: BTreeMap<String, DocumentCategory>,
    /// Predictions below this confidence are recorded but do not count toward completeness.
    pub confidence_threshold: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReasoningConfig {
    /// Command that reads a prompt on stdin and answers on stdout. Empty disables reasoning.
    pub command: Vec<String>,
    pub timeout_secs: u64,
    /// Retries after a transport failure (so `max_retries + 1` attempts).
    pub max_retries: u32,
    pub backoff_ms: u64,
    pub output_limit_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkerConfig {
    /// Base URL of the classification service (`POST {url}/predict`).
    pub classifier_url: Option<String>,
    /// Endpoint of the remote OCR service.
    pub ocr_url: Option<String>,
    /// Local OCR command; `{path}` is replaced by the document path. Empty disables it.
    pub local_ocr_command: Vec<String>,
    pub timeout_secs: u64,
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FeedbackConfig {
    pub max_corrective_attempts: u32,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            allowed_extensions: [".pdf", ".jpg", ".jpeg", ".png", ".tiff", ".tif", ".txt", ".docx"]
                .iter()
                .map(|ext| ext.to_string())
                .collect(),
            max_document_size_mb: 50,
        }
    }
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            low_quality_threshold: 0.5,
        }
    }
}

impl Default for ClassificationConfig {
    fn default() -> Self {
        let class_map = [
            ("Passport", DocumentCategory::IdentityProof),
            ("Driving License", DocumentCategory::IdentityProof),
            ("PAN Card", DocumentCategory::IdentityProof),
            ("Aadhar", DocumentCategory::IdentityProof),
            ("Voter ID", DocumentCategory::IdentityProof),
            ("Utility Bill", DocumentCategory::AddressProof),
            ("Lease Agreement", DocumentCategory::AddressProof),
            ("Bank Statement", DocumentCategory::FinancialDocument),
            ("Tax Return", DocumentCategory::FinancialDocument),
        ]
        .into_iter()
        .map(|(class, category)| (class.to_string(), category))
        .collect();
        Self {
            required_categories: vec![
                DocumentCategory::IdentityProof,
                DocumentCategory::AddressProof,
                DocumentCategory::FinancialDocument,
            ],
            class_map,
            confidence_threshold: 0.0,
        }
    }
}

impl Default for ReasoningConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            timeout_secs: 60,
            max_retries: 2,
            backoff_ms: 500,
            output_limit_bytes: 100_000,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            classifier_url: None,
            ocr_url: None,
            local_ocr_command: Vec::new(),
            timeout_secs: 30,
            max_attempts: 3,
            backoff_ms: 1_000,
        }
    }
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            max_corrective_attempts: 2,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            cases_dir: PathBuf::from("cases"),
            intake: IntakeConfig::default(),
            extraction: ExtractionConfig::default(),
            classification: ClassificationConfig::default(),
            reasoning: ReasoningConfig::default(),
            workers: WorkerConfig::default(),
            feedback: FeedbackConfig::default(),
        }
    }
}

impl IntakeConfig {
    pub fn max_document_bytes(&self) -> u64 {
        self.max_document_size_mb.saturating_mul(1024 * 1024)
    }

    /// Whether `extension` (any case, with or without dot) is allowed.
    pub fn allows_extension(&self, extension: &str) -> bool {
        let wanted = normalize_extension(extension);
        !wanted.is_empty()
            && self
                .allowed_extensions
                .iter()
                .any(|ext| normalize_extension(ext) == wanted)
    }
}

impl ClassificationConfig {
    pub fn category_for(&self, predicted_class: &str) -> DocumentCategory {
        self.class_map
            .iter()
            .find(|(class, _)| class.eq_ignore_ascii_case(predicted_class.trim()))
            .map(|(_, category)| *category)
            .unwrap_or(DocumentCategory::Unknown)
    }
}

impl ReasoningConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

impl WorkerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.cases_dir.as_os_str().is_empty() {
            return Err(anyhow!("cases_dir must not be empty"));
        }
        if self.intake.allowed_extensions.is_empty() {
            return Err(anyhow!("intake.allowed_extensions must not be empty"));
        }
        if self.intake.max_document_size_mb == 0 {
            return Err(anyhow!("intake.max_document_size_mb must be > 0"));
        }
        if !(0.0..=1.0).contains(&self.extraction.low_quality_threshold) {
            return Err(anyhow!("extraction.low_quality_threshold must be within [0, 1]"));
        }
        if !(0.0..=1.0).contains(&self.classification.confidence_threshold) {
            return Err(anyhow!(
                "classification.confidence_threshold must be within [0, 1]"
            ));
        }
        if self.classification.required_categories.is_empty() {
            return Err(anyhow!(
                "classification.required_categories must not be empty"
            ));
        }
        if self
            .classification
            .required_categories
            .contains(&DocumentCategory::Unknown)
        {
            return Err(anyhow!(
                "classification.required_categories must not contain 'unknown'"
            ));
        }
        if self.reasoning.timeout_secs == 0 {
            return Err(anyhow!("reasoning.timeout_secs must be > 0"));
        }
        if self.reasoning.output_limit_bytes == 0 {
            return Err(anyhow!("reasoning.output_limit_bytes must be > 0"));
        }
        if self
            .reasoning
            .command
            .first()
            .is_some_and(|program| program.trim().is_empty())
        {
            return Err(anyhow!("reasoning.command must start with a program name"));
        }
        if self.workers.timeout_secs == 0 {
            return Err(anyhow!("workers.timeout_secs must be > 0"));
        }
        if self.workers.max_attempts == 0 {
            return Err(anyhow!("workers.max_attempts must be > 0"));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `PipelineConfig::default()`.
pub fn load_config(path: &Path) -> Result<PipelineConfig> {
    if !path.exists() {
        let cfg = PipelineConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: PipelineConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &PipelineConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    crate::io::fs::write_atomic(path, buf.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, PipelineConfig::default());
        assert_eq!(cfg.extraction.low_quality_threshold, 0.5);
        assert_eq!(cfg.feedback.max_corrective_attempts, 2);
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("casework.toml");
        let mut cfg = PipelineConfig::default();
        cfg.workers.classifier_url = Some("http://localhost:8000".to_string());
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("casework.toml");
        fs::write(
            &path,
            "cases_dir = \"data\"\n[extraction]\nlow_quality_threshold = 0.7\n",
        )
        .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.cases_dir, PathBuf::from("data"));
        assert_eq!(cfg.extraction.low_quality_threshold, 0.7);
        assert_eq!(cfg.reasoning.max_retries, 2);
    }

    #[test]
    fn rejects_out_of_range_threshold() {
        let mut cfg = PipelineConfig::default();
        cfg.extraction.low_quality_threshold = 1.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn extension_check_ignores_case_and_dot() {
        let intake = IntakeConfig::default();
        assert!(intake.allows_extension("PDF"));
        assert!(intake.allows_extension(".txt"));
        assert!(!intake.allows_extension(".exe"));
        assert!(!intake.allows_extension(""));
    }

    #[test]
    fn class_map_lookup_is_case_insensitive() {
        let cfg = ClassificationConfig::default();
        assert_eq!(cfg.category_for("passport"), DocumentCategory::IdentityProof);
        assert_eq!(cfg.category_for("Selfie"), DocumentCategory::Unknown);
    }
}
