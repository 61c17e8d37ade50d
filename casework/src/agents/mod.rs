//! Specialist agents and the Observe/Reason/Plan/Act/Reflect loop they share.
//!
//! A [`Specialist`] supplies the deterministic parts of each phase: what it
//! observes, the hints it derives, its fallback reasoning, and how it acts.
//! [`execute`] runs the five phases in order, consults the reasoner for the
//! reason, plan and reflect phases, and records one board update and one
//! history entry per phase. Nothing a specialist or the reasoner does makes
//! `execute` fail; failures end up in the returned [`AgentResult`].

use std::path::PathBuf;

use anyhow::Result;
use minijinja::context;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{info, instrument, warn};

use crate::blackboard::{Blackboard, HistoryEntry, HistoryKind};
use crate::core::types::{AgentKind, AgentStatus, ErrorKind};
use crate::io::prompt::Template;
use crate::io::structured::{CallSite, Consultant, Decided, Provenance};

pub mod classification;
pub mod extraction;
pub mod intake;

pub const REASON_SITE: CallSite = CallSite {
    name: "agent.reason",
    schema: include_str!("../../schemas/agent_reasoning.schema.json"),
};

pub const PLAN_SITE: CallSite = CallSite {
    name: "agent.plan",
    schema: include_str!("../../schemas/agent_plan.schema.json"),
};

pub const REFLECT_SITE: CallSite = CallSite {
    name: "agent.reflect",
    schema: include_str!("../../schemas/agent_reflection.schema.json"),
};

/// Work delegated to one specialist.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AgentTask {
    pub description: String,
    pub case_reference: String,
    /// New files to register (intake).
    pub files: Vec<PathBuf>,
    /// Restrict work to these documents. Empty means every document waiting
    /// at the specialist's input stage.
    pub document_ids: Vec<String>,
}

/// What a specialist saw: the items it may act on, plus details for the prompt.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Observation {
    pub items: Vec<String>,
    pub details: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemHint {
    pub item: String,
    pub note: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reasoning {
    pub analysis: String,
    pub concerns: Vec<String>,
    pub approach: String,
    #[serde(default)]
    pub hints: Vec<ItemHint>,
}

impl Reasoning {
    pub fn conservative(analysis: String, hints: Vec<ItemHint>) -> Self {
        Self {
            analysis,
            concerns: Vec::new(),
            approach: "conservative".to_string(),
            hints,
        }
    }

    /// Notes for `item`, reasoned ones first.
    pub fn notes_for(&self, item: &str) -> Vec<&str> {
        self.hints
            .iter()
            .filter(|hint| hint.item == item)
            .map(|hint| hint.note.as_str())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedAction {
    pub target: String,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ActionPlanAnswer {
    actions: Vec<PlannedAction>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notify {
    pub to: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reflection {
    pub success: bool,
    pub quality_score: f64,
    pub issues: Vec<String>,
    pub suggestions: Vec<String>,
    #[serde(default)]
    pub notify: Vec<Notify>,
}

/// Outcome of acting on one item.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemOutcome {
    pub item: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_id: Option<String>,
    pub ok: bool,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl ItemOutcome {
    pub fn ok(item: &str, document_id: Option<String>, detail: impl Into<String>) -> Self {
        Self {
            item: item.to_string(),
            document_id,
            ok: true,
            detail: detail.into(),
            error_kind: None,
        }
    }

    pub fn failed(
        item: &str,
        document_id: Option<String>,
        kind: ErrorKind,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            item: item.to_string(),
            document_id,
            ok: false,
            detail: detail.into(),
            error_kind: Some(kind),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ActOutput {
    pub outcomes: Vec<ItemOutcome>,
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentResult {
    pub agent: AgentKind,
    pub status: AgentStatus,
    pub data: Value,
    pub outcomes: Vec<ItemOutcome>,
    pub reasoning: Reasoning,
    pub reflection: Reflection,
    pub suggestions: Vec<String>,
    /// Phases that used their deterministic default, with the reason.
    pub fallbacks: Vec<String>,
}

/// The deterministic half of a specialist.
pub trait Specialist {
    fn kind(&self) -> AgentKind;

    /// One sentence describing the job, used in prompts.
    fn role(&self) -> &'static str;

    /// Actions the plan phase may assign; the first is the default.
    fn actions(&self) -> &'static [&'static str];

    /// Read-only look at the task and the stored state.
    fn observe(&self, task: &AgentTask, board: &Blackboard) -> Result<Observation>;

    /// Deterministic per-item hints, computed before any reasoning or worker call.
    fn annotate(&self, observation: &Observation) -> Vec<ItemHint>;

    fn reason_fallback(&self, observation: &Observation, hints: Vec<ItemHint>) -> Reasoning {
        Reasoning::conservative(
            format!("{} item(s) observed", observation.items.len()),
            hints,
        )
    }

    /// Run the planned actions. One item's failure must not stop the others.
    fn act(
        &self,
        task: &AgentTask,
        plan: &[PlannedAction],
        reasoning: &Reasoning,
        board: &mut Blackboard,
    ) -> Result<ActOutput>;
}

fn phase_key(agent: &str, phase: &str) -> String {
    format!("{agent}.{phase}")
}

fn provenance_status<T>(decided: &Decided<T>) -> &'static str {
    match decided.provenance {
        Provenance::Reasoned => "reasoned",
        Provenance::Fallback { .. } => "fallback",
    }
}

fn note_fallback<T>(fallbacks: &mut Vec<String>, phase: &str, decided: &Decided<T>) {
    if let Some(reason) = decided.fallback_reason() {
        fallbacks.push(format!("{phase}: {reason}"));
    }
}

/// One action per item, in observation order.
pub fn canned_plan(items: &[String], default_action: &str) -> Vec<PlannedAction> {
    items
        .iter()
        .map(|item| PlannedAction {
            target: item.clone(),
            action: default_action.to_string(),
            priority: None,
        })
        .collect()
}

/// Make a reasoned plan safe to run.
///
/// Unknown targets and actions are dropped, repeated targets keep their first
/// action, actions run in priority order (unprioritized last), and observed
/// items the plan forgot are appended with the default action.
pub fn reconcile_plan(
    proposed: Vec<PlannedAction>,
    items: &[String],
    allowed_actions: &[&str],
) -> Vec<PlannedAction> {
    let default_action = allowed_actions.first().copied().unwrap_or("process");
    let mut plan: Vec<PlannedAction> = Vec::new();
    for action in proposed {
        let known_target = items.contains(&action.target);
        let known_action = allowed_actions.contains(&action.action.as_str());
        if !known_target || !known_action {
            warn!(target = %action.target, action = %action.action, "dropping unusable planned action");
            continue;
        }
        if plan.iter().any(|planned| planned.target == action.target) {
            continue;
        }
        plan.push(action);
    }
    plan.sort_by_key(|action| action.priority.unwrap_or(i64::MAX));
    for item in items {
        if !plan.iter().any(|planned| &planned.target == item) {
            plan.push(PlannedAction {
                target: item.clone(),
                action: default_action.to_string(),
                priority: None,
            });
        }
    }
    plan
}

fn merge_hints(reasoning: &mut Reasoning, deterministic: Vec<ItemHint>) {
    for hint in deterministic {
        if !reasoning.hints.contains(&hint) {
            reasoning.hints.push(hint);
        }
    }
}

fn fallback_reflection(status: AgentStatus, outcomes: &[ItemOutcome]) -> Reflection {
    Reflection {
        success: status == AgentStatus::Success,
        quality_score: 0.5,
        issues: outcomes
            .iter()
            .filter(|outcome| !outcome.ok)
            .map(|outcome| format!("{}: {}", outcome.item, outcome.detail))
            .collect(),
        suggestions: vec!["Review execution manually".to_string()],
        notify: Vec::new(),
    }
}

fn outcome_lines(outcomes: &[ItemOutcome]) -> Vec<String> {
    outcomes
        .iter()
        .map(|outcome| {
            format!(
                "{} [{}]: {}",
                outcome.document_id.as_deref().unwrap_or(&outcome.item),
                if outcome.ok { "ok" } else { "failed" },
                outcome.detail
            )
        })
        .collect()
}

/// Run one task through Observe, Reason, Plan, Act and Reflect.
#[instrument(skip_all, fields(agent = %agent.kind(), case = %task.case_reference))]
pub fn execute<S: Specialist + ?Sized>(
    agent: &S,
    consultant: &Consultant<'_>,
    task: &AgentTask,
    board: &mut Blackboard,
) -> AgentResult {
    let name = agent.kind().as_str();
    let mut fallbacks = Vec::new();

    // Observe
    let (observation, observe_error) = match agent.observe(task, board) {
        Ok(observation) => (observation, None),
        Err(err) => {
            let reason = format!("{err:#}");
            warn!(%reason, "observe failed");
            (Observation::default(), Some(reason))
        }
    };
    board.update(&phase_key(name, "observation"), json!(observation), name);
    board.record_agent_action(
        name,
        "observe",
        if observe_error.is_some() { "failed" } else { "completed" },
        json!({ "items": observation.items.len(), "error": observe_error }),
    );

    // Reason
    let hints = agent.annotate(&observation);
    let hint_lines: Vec<String> = hints
        .iter()
        .map(|hint| format!("{}: {}", hint.item, hint.note))
        .collect();
    let observation_text =
        serde_json::to_string_pretty(&observation).unwrap_or_else(|_| "{}".to_string());
    let decided = consultant.ask(
        &REASON_SITE,
        Template::AgentReason,
        context! {
            agent => name,
            role => agent.role(),
            task => &task.description,
            observation => observation_text,
            hints => hint_lines,
            schema => REASON_SITE.schema,
        },
        || agent.reason_fallback(&observation, hints.clone()),
    );
    note_fallback(&mut fallbacks, "reason", &decided);
    let reason_status = provenance_status(&decided);
    let mut reasoning = decided.value;
    merge_hints(&mut reasoning, hints);
    board.update(&phase_key(name, "reasoning"), json!(reasoning), name);
    board.record_agent_action(
        name,
        "reason",
        reason_status,
        json!({ "approach": reasoning.approach, "concerns": reasoning.concerns }),
    );

    // Plan
    let default_action = agent.actions().first().copied().unwrap_or("process");
    let canned = canned_plan(&observation.items, default_action);
    let plan = if observation.items.is_empty() {
        Vec::new()
    } else {
        let decided = consultant.ask(
            &PLAN_SITE,
            Template::AgentPlan,
            context! {
                agent => name,
                role => agent.role(),
                task => &task.description,
                reasoning => format!("{} (approach: {})", reasoning.analysis, reasoning.approach),
                items => &observation.items,
                actions => agent.actions(),
                schema => PLAN_SITE.schema,
            },
            || ActionPlanAnswer {
                actions: canned.clone(),
            },
        );
        note_fallback(&mut fallbacks, "plan", &decided);
        reconcile_plan(decided.value.actions, &observation.items, agent.actions())
    };
    board.update(&phase_key(name, "plan"), json!(plan), name);
    board.record_agent_action(name, "plan", "completed", json!({ "actions": plan.len() }));

    // Act
    let act = if let Some(reason) = &observe_error {
        ActOutput {
            outcomes: vec![ItemOutcome::failed(
                name,
                None,
                ErrorKind::TransportError,
                format!("could not read stored state: {reason}"),
            )],
            data: Value::Null,
        }
    } else {
        match agent.act(task, &plan, &reasoning, board) {
            Ok(act) => act,
            Err(err) => ActOutput {
                outcomes: vec![ItemOutcome::failed(
                    name,
                    None,
                    ErrorKind::TransportError,
                    format!("{err:#}"),
                )],
                data: Value::Null,
            },
        }
    };
    for outcome in act.outcomes.iter().filter(|outcome| !outcome.ok) {
        board.record_event(HistoryEntry::new(
            HistoryKind::Event,
            name,
            "item_failed",
            outcome.error_kind.map_or("failed", ErrorKind::as_str),
            json!(outcome),
        ));
    }
    let succeeded = act.outcomes.iter().filter(|outcome| outcome.ok).count();
    let status = AgentStatus::from_counts(succeeded, act.outcomes.len());
    board.update(
        &phase_key(name, "result"),
        json!({ "status": status, "outcomes": act.outcomes, "data": act.data }),
        name,
    );
    board.record_agent_action(
        name,
        "act",
        status.as_str(),
        json!({ "succeeded": succeeded, "total": act.outcomes.len() }),
    );

    // Reflect
    let decided = consultant.ask(
        &REFLECT_SITE,
        Template::AgentReflect,
        context! {
            agent => name,
            task => &task.description,
            status => status.as_str(),
            outcomes => outcome_lines(&act.outcomes),
            schema => REFLECT_SITE.schema,
        },
        || fallback_reflection(status, &act.outcomes),
    );
    note_fallback(&mut fallbacks, "reflect", &decided);
    let reflect_status = provenance_status(&decided);
    let reflection = decided.value;
    for notify in &reflection.notify {
        board.post_message(name, &notify.to, &notify.message, None);
    }
    board.update(&phase_key(name, "reflection"), json!(reflection), name);
    board.record_agent_action(
        name,
        "reflect",
        reflect_status,
        json!({ "success": reflection.success, "quality_score": reflection.quality_score }),
    );

    info!(status = status.as_str(), succeeded, total = act.outcomes.len(), "agent finished");
    AgentResult {
        agent: agent.kind(),
        status,
        data: act.data,
        outcomes: act.outcomes,
        suggestions: reflection.suggestions.clone(),
        reasoning,
        reflection,
        fallbacks,
    }
}
