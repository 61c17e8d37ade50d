//! Extraction and classification workers.
//!
//! Workers wrap the external capabilities the specialists depend on. Each
//! worker is a trait object so agents can be driven by scripted workers in
//! tests and by HTTP or command-backed workers in production.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::thread;
use std::time::Duration;

use reqwest::blocking::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::core::heuristics::{FormatFamily, format_family};
use crate::core::types::{ErrorKind, ExtractionMethod};
use crate::io::config::WorkerConfig;
use crate::io::process::run_with_input;

#[derive(Error, Debug)]
pub enum WorkerError {
    /// The call did not complete (connection, timeout, 5xx). Retryable.
    #[error("transport error: {0}")]
    Transport(String),

    /// The worker answered but refused the document.
    #[error("worker rejected document: {0}")]
    Rejected(String),

    /// The worker cannot handle this kind of input.
    #[error("unsupported input: {0}")]
    Unsupported(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkerError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, WorkerError::Transport(_))
    }

    /// Taxonomy entry when the failure happened during `stage_kind` work.
    pub fn kind(&self, stage_kind: ErrorKind) -> ErrorKind {
        if self.is_retryable() {
            ErrorKind::TransportError
        } else {
            stage_kind
        }
    }
}

impl From<reqwest::Error> for WorkerError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            WorkerError::Transport(err.to_string())
        } else if let Some(status) = err.status()
            && status.is_server_error()
        {
            WorkerError::Transport(err.to_string())
        } else {
            WorkerError::Rejected(err.to_string())
        }
    }
}

/// Text recovered from a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedText {
    pub text: String,
    pub confidence: f64,
    #[serde(default)]
    pub metadata: Value,
}

/// Answer from a classification worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub predicted_class: String,
    pub confidence: f64,
    #[serde(default)]
    pub probabilities: BTreeMap<String, f64>,
    #[serde(default = "default_success")]
    pub success: bool,
}

fn default_success() -> bool {
    true
}

impl Prediction {
    pub fn new(predicted_class: &str, confidence: f64) -> Self {
        Self {
            predicted_class: predicted_class.to_string(),
            confidence,
            probabilities: BTreeMap::from([(predicted_class.to_string(), confidence)]),
            success: true,
        }
    }
}

pub trait ExtractionWorker {
    fn method(&self) -> ExtractionMethod;
    fn extract(&self, path: &Path) -> Result<ExtractedText, WorkerError>;
}

pub trait ClassificationWorker {
    /// `Ok(None)` is a null answer: the worker ran but produced no prediction.
    fn classify(&self, path: &Path) -> Result<Option<Prediction>, WorkerError>;
}

/// Retry `call` on transport errors, doubling `backoff` after each failure.
pub fn with_retries<T, F>(max_attempts: u32, backoff: Duration, mut call: F) -> Result<T, WorkerError>
where
    F: FnMut() -> Result<T, WorkerError>,
{
    let mut attempt = 1u32;
    let mut delay = backoff;
    loop {
        match call() {
            Err(err) if err.is_retryable() && attempt < max_attempts => {
                warn!(attempt, max_attempts, err = %err, "worker call failed, retrying");
                if !delay.is_zero() {
                    thread::sleep(delay);
                }
                delay = delay.saturating_mul(2);
                attempt += 1;
            }
            other => return other,
        }
    }
}

/// Direct text extraction for plain-text formats.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextFileExtractor;

impl ExtractionWorker for TextFileExtractor {
    fn method(&self) -> ExtractionMethod {
        ExtractionMethod::DirectText
    }

    fn extract(&self, path: &Path) -> Result<ExtractedText, WorkerError> {
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or_default();
        if format_family(extension) != FormatFamily::Text {
            return Err(WorkerError::Unsupported(format!(
                "no embedded text reader for '.{extension}'"
            )));
        }
        let bytes = fs::read(path)?;
        Ok(ExtractedText {
            text: String::from_utf8_lossy(&bytes).into_owned(),
            confidence: 1.0,
            metadata: serde_json::json!({ "bytes": bytes.len() }),
        })
    }
}

/// Local OCR through an external command that prints recognized text.
#[derive(Debug, Clone)]
pub struct CommandOcr {
    argv: Vec<String>,
    timeout: Duration,
}

impl CommandOcr {
    pub fn new(argv: Vec<String>, timeout: Duration) -> Self {
        Self { argv, timeout }
    }
}

impl ExtractionWorker for CommandOcr {
    fn method(&self) -> ExtractionMethod {
        ExtractionMethod::OcrLocal
    }

    #[instrument(skip_all, fields(path = %path.display()))]
    fn extract(&self, path: &Path) -> Result<ExtractedText, WorkerError> {
        let path_arg = path.display().to_string();
        let argv: Vec<String> = self
            .argv
            .iter()
            .map(|arg| arg.replace("{path}", &path_arg))
            .collect();
        let output = run_with_input(&argv, b"", self.timeout, 4 * 1024 * 1024)
            .map_err(|err| WorkerError::Transport(format!("{err:#}")))?;
        if let Some(reason) = output.failure(self.timeout) {
            return Err(if output.timed_out {
                WorkerError::Transport(reason)
            } else {
                WorkerError::Rejected(reason)
            });
        }
        Ok(ExtractedText {
            text: output.stdout_text(),
            // Local OCR reports no confidence of its own.
            confidence: 0.85,
            metadata: serde_json::json!({ "engine": argv.first() }),
        })
    }
}

fn file_part(path: &Path) -> Result<Part, WorkerError> {
    let bytes = fs::read(path)?;
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document".to_string());
    let mime = mime_guess::from_path(path).first_or_octet_stream();
    Part::bytes(bytes)
        .file_name(file_name)
        .mime_str(mime.essence_str())
        .map_err(|err| WorkerError::Rejected(err.to_string()))
}

fn http_client(timeout: Duration) -> Result<reqwest::blocking::Client, WorkerError> {
    reqwest::blocking::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|err| WorkerError::Transport(format!("build HTTP client: {err}")))
}

/// Remote OCR service: multipart `file` upload answered by `{text, confidence, metadata}`.
pub struct HttpOcr {
    url: String,
    client: reqwest::blocking::Client,
    max_attempts: u32,
    backoff: Duration,
}

impl HttpOcr {
    pub fn new(url: &str, config: &WorkerConfig) -> Result<Self, WorkerError> {
        Ok(Self {
            url: url.trim_end_matches('/').to_string(),
            client: http_client(config.timeout())?,
            max_attempts: config.max_attempts,
            backoff: config.backoff(),
        })
    }
}

impl ExtractionWorker for HttpOcr {
    fn method(&self) -> ExtractionMethod {
        ExtractionMethod::OcrRemote
    }

    #[instrument(skip_all, fields(url = %self.url, path = %path.display()))]
    fn extract(&self, path: &Path) -> Result<ExtractedText, WorkerError> {
        with_retries(self.max_attempts, self.backoff, || {
            let form = Form::new().part("file", file_part(path)?);
            let response = self.client.post(&self.url).multipart(form).send()?;
            let response = response.error_for_status()?;
            let extracted: ExtractedText = response.json()?;
            debug!(chars = extracted.text.len(), "remote OCR answered");
            Ok(extracted)
        })
    }
}

/// Remote classifier: `POST {base}/predict` with a multipart `file`.
pub struct HttpClassifier {
    base_url: String,
    client: reqwest::blocking::Client,
    max_attempts: u32,
    backoff: Duration,
}

impl HttpClassifier {
    pub fn new(base_url: &str, config: &WorkerConfig) -> Result<Self, WorkerError> {
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: http_client(config.timeout())?,
            max_attempts: config.max_attempts,
            backoff: config.backoff(),
        })
    }
}

impl ClassificationWorker for HttpClassifier {
    #[instrument(skip_all, fields(base_url = %self.base_url, path = %path.display()))]
    fn classify(&self, path: &Path) -> Result<Option<Prediction>, WorkerError> {
        let url = format!("{}/predict", self.base_url);
        with_retries(self.max_attempts, self.backoff, || {
            let form = Form::new().part("file", file_part(path)?);
            let response = self.client.post(&url).multipart(form).send()?;
            let response = response.error_for_status()?;
            let body: Option<Prediction> = response.json()?;
            Ok(body.filter(|prediction| prediction.success))
        })
    }
}

/// Classifier used when no service is configured: always a null answer.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnconfiguredClassifier;

impl ClassificationWorker for UnconfiguredClassifier {
    fn classify(&self, _path: &Path) -> Result<Option<Prediction>, WorkerError> {
        Ok(None)
    }
}

/// The extraction capabilities available to the extraction specialist.
pub struct Extractors {
    pub direct: Box<dyn ExtractionWorker>,
    pub local_ocr: Option<Box<dyn ExtractionWorker>>,
    pub remote_ocr: Option<Box<dyn ExtractionWorker>>,
}

impl Extractors {
    /// Direct text only.
    pub fn text_only() -> Self {
        Self {
            direct: Box::new(TextFileExtractor),
            local_ocr: None,
            remote_ocr: None,
        }
    }

    pub fn from_config(config: &WorkerConfig) -> Result<Self, WorkerError> {
        let local_ocr: Option<Box<dyn ExtractionWorker>> = if config.local_ocr_command.is_empty() {
            None
        } else {
            Some(Box::new(CommandOcr::new(
                config.local_ocr_command.clone(),
                config.timeout(),
            )))
        };
        let remote_ocr: Option<Box<dyn ExtractionWorker>> = match &config.ocr_url {
            Some(url) => Some(Box::new(HttpOcr::new(url, config)?)),
            None => None,
        };
        Ok(Self {
            direct: Box::new(TextFileExtractor),
            local_ocr,
            remote_ocr,
        })
    }

    pub fn get(&self, method: ExtractionMethod) -> Option<&dyn ExtractionWorker> {
        match method {
            ExtractionMethod::DirectText => Some(self.direct.as_ref()),
            ExtractionMethod::OcrLocal => self.local_ocr.as_deref(),
            ExtractionMethod::OcrRemote => self.remote_ocr.as_deref(),
        }
    }

    pub fn has_remote_ocr(&self) -> bool {
        self.remote_ocr.is_some()
    }
}

pub fn classifier_from_config(
    config: &WorkerConfig,
) -> Result<Box<dyn ClassificationWorker>, WorkerError> {
    Ok(match &config.classifier_url {
        Some(url) => Box::new(HttpClassifier::new(url, config)?),
        None => Box::new(UnconfiguredClassifier),
    })
}
