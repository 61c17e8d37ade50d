//! Shared, versioned state for one case session.
//!
//! The blackboard holds keyed entries, a message log between agents, the
//! workflow state, and an append-only history. Every mutation is persisted to
//! `workflow_memory.json` in the case directory. Persistence is best-effort:
//! the in-memory state stays authoritative when a write fails.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::core::types::WorkflowPhase;
use crate::io::fs::{read_json, write_json_atomic};

pub const WORKFLOW_MEMORY_FILE: &str = "workflow_memory.json";

/// Recipient that every agent receives.
pub const BROADCAST: &str = "all";

const RECENT_ACTIONS: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlackboardEntry {
    pub key: String,
    pub value: Value,
    pub updated_by: String,
    pub timestamp: DateTime<Utc>,
    pub version: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMessage {
    pub from: String,
    pub to: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub current_phase: WorkflowPhase,
    pub completed_steps: Vec<String>,
    pub pending_steps: Vec<String>,
    pub failed_steps: Vec<String>,
}

impl Default for WorkflowState {
    fn default() -> Self {
        Self {
            current_phase: WorkflowPhase::Planning,
            completed_steps: Vec::new(),
            pending_steps: Vec::new(),
            failed_steps: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryKind {
    Update,
    Message,
    AgentAction,
    Workflow,
    Event,
}

/// One append-only history record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    #[serde(rename = "type")]
    pub kind: HistoryKind,
    pub agent: String,
    pub action: String,
    pub status: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub details: Value,
}

impl HistoryEntry {
    pub fn new(
        kind: HistoryKind,
        agent: &str,
        action: &str,
        status: &str,
        details: Value,
    ) -> Self {
        Self {
            kind,
            agent: agent.to_string(),
            action: action.to_string(),
            status: status.to_string(),
            timestamp: Utc::now(),
            details,
        }
    }
}

/// Changes to the workflow state. Step lists are merged without duplicates.
#[derive(Debug, Clone, Default)]
pub struct WorkflowUpdate {
    pub phase: Option<WorkflowPhase>,
    pub completed: Vec<String>,
    pub failed: Vec<String>,
    /// Replaces the pending list when set.
    pub pending: Option<Vec<String>>,
    /// Clear every step list before applying the rest of the update.
    pub reset_steps: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowSummary {
    pub phase: WorkflowPhase,
    pub completed_steps: Vec<String>,
    pub pending_steps: Vec<String>,
    pub failed_steps: Vec<String>,
    pub entry_count: usize,
    pub message_count: usize,
    pub history_len: usize,
}

/// What an agent sees of the board before it acts.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentContext {
    pub phase: WorkflowPhase,
    pub completed_steps: Vec<String>,
    pub pending_steps: Vec<String>,
    pub messages: Vec<AgentMessage>,
    pub keys: Vec<String>,
    pub recent_actions: Vec<HistoryEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct BoardState {
    #[serde(default)]
    entries: BTreeMap<String, BlackboardEntry>,
    #[serde(default)]
    messages: Vec<AgentMessage>,
    #[serde(default)]
    workflow_state: WorkflowState,
    #[serde(default)]
    history: Vec<HistoryEntry>,
}

#[derive(Debug)]
pub struct Blackboard {
    state: BoardState,
    path: Option<PathBuf>,
    persist_failures: u32,
}

fn push_unique(list: &mut Vec<String>, item: &str) {
    if !list.iter().any(|existing| existing == item) {
        list.push(item.to_string());
    }
}

impl Blackboard {
    /// A board that is never written to disk.
    pub fn in_memory() -> Self {
        Self {
            state: BoardState::default(),
            path: None,
            persist_failures: 0,
        }
    }

    /// Load the board persisted at `path`, or start empty if there is none.
    pub fn load(path: &Path) -> Result<Self> {
        let state = if path.exists() {
            read_json(path)?
        } else {
            BoardState::default()
        };
        Ok(Self {
            state,
            path: Some(path.to_path_buf()),
            persist_failures: 0,
        })
    }

    /// The board for a case directory (`<case_dir>/workflow_memory.json`).
    pub fn for_case(case_dir: &Path) -> Result<Self> {
        Self::load(&case_dir.join(WORKFLOW_MEMORY_FILE))
    }

    /// Open the case board, starting empty when the stored file cannot be read.
    ///
    /// An unreadable file is renamed to `workflow_memory.json.corrupt-<time>`
    /// and left next to the new one.
    pub fn open_case(case_dir: &Path) -> Self {
        let path = case_dir.join(WORKFLOW_MEMORY_FILE);
        match Self::load(&path) {
            Ok(board) => board,
            Err(err) => {
                let aside = case_dir.join(format!(
                    "{WORKFLOW_MEMORY_FILE}.corrupt-{}",
                    Utc::now().format("%Y%m%dT%H%M%S%.3fZ")
                ));
                warn!(
                    path = %path.display(),
                    err = %format!("{err:#}"),
                    aside = %aside.display(),
                    "workflow memory unreadable, starting a fresh board"
                );
                if let Err(rename) = std::fs::rename(&path, &aside) {
                    warn!(path = %path.display(), err = %rename, "could not move unreadable workflow memory aside");
                }
                Self {
                    state: BoardState::default(),
                    path: Some(path),
                    persist_failures: 0,
                }
            }
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Number of persist calls that failed even after the retry.
    pub fn persist_failures(&self) -> u32 {
        self.persist_failures
    }

    /// Write the full state to disk, retrying once. Never fails the caller.
    pub fn persist(&mut self) {
        let Some(path) = self.path.as_deref() else {
            return;
        };
        let Err(first) = write_json_atomic(path, &self.state) else {
            return;
        };
        warn!(path = %path.display(), err = %format!("{first:#}"), "blackboard persist failed, retrying");
        if let Err(second) = write_json_atomic(path, &self.state) {
            warn!(
                path = %path.display(),
                err = %format!("{second:#}"),
                "blackboard persist failed again; continuing in memory"
            );
            self.persist_failures += 1;
        }
    }

    fn append(&mut self, entry: HistoryEntry) {
        self.state.history.push(entry);
    }

    /// Write `value` under `key` and return its new version.
    #[instrument(skip(self, value))]
    pub fn update(&mut self, key: &str, value: Value, agent: &str) -> u64 {
        let version = self.state.entries.get(key).map_or(0, |e| e.version) + 1;
        self.state.entries.insert(
            key.to_string(),
            BlackboardEntry {
                key: key.to_string(),
                value: value.clone(),
                updated_by: agent.to_string(),
                timestamp: Utc::now(),
                version,
            },
        );
        self.append(HistoryEntry::new(
            HistoryKind::Update,
            agent,
            key,
            "written",
            serde_json::json!({ "version": version, "value": value }),
        ));
        debug!(version, "blackboard updated");
        self.persist();
        version
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.state.entries.get(key).map(|entry| &entry.value)
    }

    /// Typed read; `None` when the key is unset or holds a different shape.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get(key)
            .and_then(|value| serde_json::from_value(value.clone()).ok())
    }

    pub fn get_entry(&self, key: &str) -> Option<&BlackboardEntry> {
        self.state.entries.get(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.state.entries.keys().cloned().collect()
    }

    pub fn post_message(&mut self, from: &str, to: &str, message: &str, data: Option<Value>) {
        self.state.messages.push(AgentMessage {
            from: from.to_string(),
            to: to.to_string(),
            message: message.to_string(),
            timestamp: Utc::now(),
            data,
        });
        self.append(HistoryEntry::new(
            HistoryKind::Message,
            from,
            "post_message",
            "sent",
            serde_json::json!({ "to": to, "message": message }),
        ));
        self.persist();
    }

    /// Messages addressed to `agent` or broadcast, in posting order.
    pub fn get_messages_for(&self, agent: &str) -> Vec<&AgentMessage> {
        self.state
            .messages
            .iter()
            .filter(|msg| msg.to == agent || msg.to == BROADCAST)
            .collect()
    }

    pub fn record_event(&mut self, entry: HistoryEntry) {
        self.append(entry);
        self.persist();
    }

    pub fn record_agent_action(&mut self, agent: &str, action: &str, status: &str, details: Value) {
        self.record_event(HistoryEntry::new(
            HistoryKind::AgentAction,
            agent,
            action,
            status,
            details,
        ));
    }

    pub fn history(&self) -> &[HistoryEntry] {
        &self.state.history
    }

    pub fn workflow_state(&self) -> &WorkflowState {
        &self.state.workflow_state
    }

    pub fn update_workflow_state(&mut self, update: WorkflowUpdate) {
        let workflow = &mut self.state.workflow_state;
        if let Some(phase) = update.phase {
            workflow.current_phase = phase;
        }
        if update.reset_steps {
            workflow.completed_steps.clear();
            workflow.pending_steps.clear();
            workflow.failed_steps.clear();
        }
        if let Some(pending) = update.pending {
            workflow.pending_steps.clear();
            for step in &pending {
                push_unique(&mut workflow.pending_steps, step);
            }
        }
        for step in &update.completed {
            push_unique(&mut workflow.completed_steps, step);
            workflow.pending_steps.retain(|pending| pending != step);
            workflow.failed_steps.retain(|failed| failed != step);
        }
        for step in &update.failed {
            push_unique(&mut workflow.failed_steps, step);
            workflow.pending_steps.retain(|pending| pending != step);
            workflow.completed_steps.retain(|done| done != step);
        }
        let details = serde_json::to_value(&*workflow).unwrap_or(Value::Null);
        let phase = workflow.current_phase;
        self.append(HistoryEntry::new(
            HistoryKind::Workflow,
            "planner",
            "update_workflow_state",
            phase_name(phase),
            details,
        ));
        self.persist();
    }

    pub fn get_workflow_summary(&self) -> WorkflowSummary {
        let workflow = &self.state.workflow_state;
        WorkflowSummary {
            phase: workflow.current_phase,
            completed_steps: workflow.completed_steps.clone(),
            pending_steps: workflow.pending_steps.clone(),
            failed_steps: workflow.failed_steps.clone(),
            entry_count: self.state.entries.len(),
            message_count: self.state.messages.len(),
            history_len: self.state.history.len(),
        }
    }

    pub fn context_for_agent(&self, agent: &str) -> AgentContext {
        let workflow = &self.state.workflow_state;
        let mut recent_actions: Vec<HistoryEntry> = self
            .state
            .history
            .iter()
            .rev()
            .filter(|entry| entry.kind == HistoryKind::AgentAction && entry.agent == agent)
            .take(RECENT_ACTIONS)
            .cloned()
            .collect();
        recent_actions.reverse();
        AgentContext {
            phase: workflow.current_phase,
            completed_steps: workflow.completed_steps.clone(),
            pending_steps: workflow.pending_steps.clone(),
            messages: self.get_messages_for(agent).into_iter().cloned().collect(),
            keys: self.keys(),
            recent_actions,
        }
    }
}

fn phase_name(phase: WorkflowPhase) -> &'static str {
    match phase {
        WorkflowPhase::Planning => "planning",
        WorkflowPhase::Execution => "execution",
        WorkflowPhase::Reflection => "reflection",
        WorkflowPhase::Completed => "completed",
        WorkflowPhase::Failed => "failed",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;

    #[test]
    fn versions_increase_per_key() {
        let mut board = Blackboard::in_memory();
        assert_eq!(board.update("k", json!("v1"), "intake"), 1);
        assert_eq!(board.update("k", json!("v2"), "extraction"), 2);
        assert_eq!(board.update("other", json!(1), "intake"), 1);

        let entry = board.get_entry("k").expect("entry");
        assert_eq!(entry.value, json!("v2"));
        assert_eq!(entry.version, 2);
        assert_eq!(entry.updated_by, "extraction");
        assert!(board.get("missing").is_none());
    }

    #[test]
    fn every_write_is_kept_in_history() {
        let mut board = Blackboard::in_memory();
        board.update("k", json!("v1"), "a");
        board.update("k", json!("v2"), "a");
        let updates: Vec<_> = board
            .history()
            .iter()
            .filter(|entry| entry.kind == HistoryKind::Update)
            .map(|entry| entry.details["value"].clone())
            .collect();
        assert_eq!(updates, vec![json!("v1"), json!("v2")]);
    }

    #[test]
    fn messages_are_delivered_to_recipient_and_broadcast() {
        let mut board = Blackboard::in_memory();
        board.post_message("intake", "extraction", "two files", None);
        board.post_message("planner", BROADCAST, "start", Some(json!({"case": "C1"})));
        board.post_message("intake", "classification", "hint", None);

        let got: Vec<_> = board
            .get_messages_for("extraction")
            .iter()
            .map(|msg| msg.message.clone())
            .collect();
        assert_eq!(got, vec!["two files", "start"]);
        assert_eq!(board.get_messages_for("classification").len(), 2);
    }

    #[test]
    fn workflow_lists_are_deduplicated() {
        let mut board = Blackboard::in_memory();
        board.update_workflow_state(WorkflowUpdate {
            phase: Some(WorkflowPhase::Execution),
            pending: Some(vec!["intake".into(), "extraction".into(), "intake".into()]),
            ..WorkflowUpdate::default()
        });
        board.update_workflow_state(WorkflowUpdate {
            completed: vec!["intake".into()],
            ..WorkflowUpdate::default()
        });
        board.update_workflow_state(WorkflowUpdate {
            completed: vec!["intake".into()],
            failed: vec!["extraction".into()],
            ..WorkflowUpdate::default()
        });

        let summary = board.get_workflow_summary();
        assert_eq!(summary.phase, WorkflowPhase::Execution);
        assert_eq!(summary.completed_steps, vec!["intake"]);
        assert_eq!(summary.failed_steps, vec!["extraction"]);
        assert!(summary.pending_steps.is_empty());
    }

    #[test]
    fn agent_context_includes_recent_own_actions() {
        let mut board = Blackboard::in_memory();
        for i in 0..7 {
            board.record_agent_action("intake", &format!("act-{i}"), "success", Value::Null);
        }
        board.record_agent_action("extraction", "other", "success", Value::Null);
        board.update("k", json!(1), "intake");

        let ctx = board.context_for_agent("intake");
        let actions: Vec<_> = ctx.recent_actions.iter().map(|e| e.action.as_str()).collect();
        assert_eq!(actions, vec!["act-2", "act-3", "act-4", "act-5", "act-6"]);
        assert_eq!(ctx.keys, vec!["k"]);
    }

    #[test]
    fn persisted_board_reloads() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut board = Blackboard::for_case(temp.path()).expect("open");
        board.update("k", json!("v1"), "a");
        board.post_message("a", "b", "hello", None);

        let reloaded = Blackboard::for_case(temp.path()).expect("reload");
        assert_eq!(reloaded.get_entry("k").expect("entry").version, 1);
        assert_eq!(reloaded.get_messages_for("b").len(), 1);
        assert_eq!(reloaded.history().len(), board.history().len());
    }

    #[test]
    fn unreadable_board_is_moved_aside() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join(WORKFLOW_MEMORY_FILE), "{ not json").expect("write");
        assert!(Blackboard::for_case(temp.path()).is_err());

        let mut board = Blackboard::open_case(temp.path());
        assert!(board.history().is_empty());
        board.update("k", json!(1), "a");

        let names: Vec<String> = fs::read_dir(temp.path())
            .expect("list")
            .map(|entry| entry.expect("entry").file_name().to_string_lossy().into_owned())
            .collect();
        assert!(names.iter().any(|name| name.starts_with("workflow_memory.json.corrupt-")));
        let reloaded = Blackboard::for_case(temp.path()).expect("reload");
        assert_eq!(reloaded.get("k"), Some(&json!(1)));
    }

    #[test]
    fn failing_a_step_removes_it_from_completed() {
        let mut board = Blackboard::in_memory();
        board.update_workflow_state(WorkflowUpdate {
            completed: vec!["intake".into(), "extraction".into()],
            ..WorkflowUpdate::default()
        });
        board.update_workflow_state(WorkflowUpdate {
            failed: vec!["intake".into()],
            ..WorkflowUpdate::default()
        });
        assert_eq!(board.workflow_state().completed_steps, vec!["extraction"]);
        assert_eq!(board.workflow_state().failed_steps, vec!["intake"]);

        board.update_workflow_state(WorkflowUpdate {
            reset_steps: true,
            pending: Some(vec!["classification".into()]),
            ..WorkflowUpdate::default()
        });
        let summary = board.get_workflow_summary();
        assert!(summary.completed_steps.is_empty());
        assert!(summary.failed_steps.is_empty());
        assert_eq!(summary.pending_steps, vec!["classification"]);
        assert!(board.history().len() >= 3);
    }

    /// Verifies a persist failure is counted but never surfaces as an error.
    #[test]
    fn persist_failure_is_not_fatal() {
        let temp = tempfile::tempdir().expect("tempdir");
        let blocker = temp.path().join("blocker");
        fs::write(&blocker, "file").expect("write");
        let mut board = Blackboard::load(&blocker.join(WORKFLOW_MEMORY_FILE)).expect("open");

        assert_eq!(board.update("k", json!(1), "a"), 1);
        assert_eq!(board.get("k"), Some(&json!(1)));
        assert_eq!(board.persist_failures(), 1);
    }
}
