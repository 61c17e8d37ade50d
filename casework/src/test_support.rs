//! Test-only fakes for the reasoning and worker seams, plus fixture helpers.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow};
use tempfile::TempDir;

use crate::io::config::PipelineConfig;
use crate::io::reasoner::{Reasoner, ReasoningRequest};
use crate::io::workers::{ClassificationWorker, Prediction, WorkerError};

/// Write `contents` to `dir/name` and return the path.
pub fn write_file(dir: &Path, name: &str, contents: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, contents).expect("write fixture file");
    path
}

/// Default config rooted in a fresh temp dir (`<temp>/cases`).
///
/// Keep the `TempDir` alive for as long as the config is used.
pub fn scratch_config() -> (TempDir, PipelineConfig) {
    let temp = tempfile::tempdir().expect("create temp dir");
    let config = PipelineConfig {
        cases_dir: temp.path().join("cases"),
        ..PipelineConfig::default()
    };
    (temp, config)
}

/// Reasoner that answers from per-call-site queues.
///
/// A call site with an empty queue gets the default answer, or a transport
/// error when no default is set.
#[derive(Default)]
pub struct ScriptedReasoner {
    answers: RefCell<BTreeMap<String, Vec<String>>>,
    default: Option<String>,
    calls: RefCell<Vec<ReasoningRequest>>,
}

impl ScriptedReasoner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `answer` for `call_site`.
    pub fn with_answer(self, call_site: &str, answer: &str) -> Self {
        self.answers
            .borrow_mut()
            .entry(call_site.to_string())
            .or_default()
            .push(answer.to_string());
        self
    }

    pub fn with_default(mut self, answer: &str) -> Self {
        self.default = Some(answer.to_string());
        self
    }

    /// Call sites in the order they were asked.
    pub fn calls(&self) -> Vec<String> {
        self.calls
            .borrow()
            .iter()
            .map(|request| request.call_site.clone())
            .collect()
    }

    pub fn prompts_for(&self, call_site: &str) -> Vec<String> {
        self.calls
            .borrow()
            .iter()
            .filter(|request| request.call_site == call_site)
            .map(|request| request.prompt.clone())
            .collect()
    }
}

impl Reasoner for ScriptedReasoner {
    fn complete(&self, request: &ReasoningRequest) -> Result<String> {
        self.calls.borrow_mut().push(request.clone());
        let mut answers = self.answers.borrow_mut();
        if let Some(queue) = answers.get_mut(&request.call_site)
            && !queue.is_empty()
        {
            return Ok(queue.remove(0));
        }
        self.default
            .clone()
            .ok_or_else(|| anyhow!("no scripted answer for {}", request.call_site))
    }
}

/// Classifier keyed by stored file name (the document id). Unknown files get a null answer.
#[derive(Default)]
pub struct ScriptedClassifier {
    answers: BTreeMap<String, Result<Option<Prediction>, String>>,
    calls: RefCell<Vec<String>>,
}

impl ScriptedClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, document_id: &str, answer: Option<Prediction>) -> Self {
        self.answers.insert(document_id.to_string(), Ok(answer));
        self
    }

    /// Make `document_id` fail with a transport error.
    pub fn failing(mut self, document_id: &str, message: &str) -> Self {
        self.answers
            .insert(document_id.to_string(), Err(message.to_string()));
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }
}

impl ClassificationWorker for ScriptedClassifier {
    fn classify(&self, path: &Path) -> Result<Option<Prediction>, WorkerError> {
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.calls.borrow_mut().push(name.clone());
        match self.answers.get(&name) {
            Some(Ok(answer)) => Ok(answer.clone()),
            Some(Err(message)) => Err(WorkerError::Transport(message.clone())),
            None => Ok(None),
        }
    }
}
