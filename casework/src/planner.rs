//! Supervisor: analyze a request, plan it, and delegate each step.
//!
//! The planner performs no domain work. It decides which specialists run and
//! in what order, checks step dependencies against the workflow state on the
//! blackboard, and rewrites the remaining plan when a step fails entirely.

use std::collections::VecDeque;
use std::path::PathBuf;

use minijinja::context;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, instrument, warn};

use crate::agents::{AgentResult, AgentTask, Specialist, execute};
use crate::blackboard::{Blackboard, HistoryEntry, HistoryKind, WorkflowUpdate};
use crate::core::plan::{
    ExecutionPlan, PlanStep, adapt_to_failure, default_plan, planning_status, sanitize_plan, unmet_dependencies,
};
use crate::core::types::{AgentKind, AgentStatus, Complexity, ErrorKind, Priority, WorkflowPhase};
use crate::io::prompt::Template;
use crate::io::structured::{CallSite, Consultant, Decided, Provenance};

pub const ANALYZE_SITE: CallSite = CallSite {
    name: "planner.analyze_request",
    schema: include_str!("../schemas/request_analysis.schema.json"),
};

pub const PLAN_SITE: CallSite = CallSite {
    name: "planner.create_plan",
    schema: include_str!("../schemas/execution_plan.schema.json"),
};

pub const DEPENDENCY_SITE: CallSite = CallSite {
    name: "planner.dependency_failure",
    schema: include_str!("../schemas/dependency_decision.schema.json"),
};

const PLANNER: &str = "planner";

/// A processing request for one case.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcessingRequest {
    pub text: String,
    pub case_reference: String,
    pub files: Vec<PathBuf>,
    /// Existing documents to resume.
    pub document_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestAnalysis {
    pub intent: String,
    pub required_processing: Vec<AgentKind>,
    pub priority: Priority,
    pub complexity: Complexity,
}

impl RequestAnalysis {
    /// Full processing at normal priority.
    pub fn document_processing(file_count: usize) -> Self {
        Self {
            intent: "document_processing".to_string(),
            required_processing: AgentKind::ALL.to_vec(),
            priority: Priority::Normal,
            complexity: match file_count {
                0..=1 => Complexity::Simple,
                2..=5 => Complexity::Moderate,
                _ => Complexity::Complex,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyChoice {
    Skip,
    Retry,
    Wait,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyDecision {
    pub decision: DependencyChoice,
    #[serde(default)]
    pub reason: String,
}

/// A step the planner did not run, and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedStep {
    pub agent: AgentKind,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanOutcome {
    pub phase: WorkflowPhase,
    pub analysis: RequestAnalysis,
    pub plan: ExecutionPlan,
    pub results: Vec<AgentResult>,
    pub skipped: Vec<SkippedStep>,
}

impl PlanOutcome {
    pub fn result_for(&self, agent: AgentKind) -> Option<&AgentResult> {
        self.results.iter().rev().find(|result| result.agent == agent)
    }
}

pub struct Planner<'a> {
    consultant: &'a Consultant<'a>,
    specialists: Vec<&'a dyn Specialist>,
}

impl<'a> Planner<'a> {
    pub fn new(consultant: &'a Consultant<'a>, specialists: Vec<&'a dyn Specialist>) -> Self {
        Self {
            consultant,
            specialists,
        }
    }

    fn specialist(&self, agent: AgentKind) -> Option<&'a dyn Specialist> {
        self.specialists
            .iter()
            .copied()
            .find(|specialist| specialist.kind() == agent)
    }

    fn record(&self, board: &mut Blackboard, action: &str, status: &str, details: serde_json::Value) {
        board.record_event(HistoryEntry::new(HistoryKind::Event, PLANNER, action, status, details));
    }

    /// Classify the request. Falls back to full document processing.
    #[instrument(skip_all)]
    pub fn analyze_request(
        &self,
        request: &ProcessingRequest,
        board: &mut Blackboard,
    ) -> Decided<RequestAnalysis> {
        let file_count = request.files.len();
        let mut decided = self.consultant.ask(
            &ANALYZE_SITE,
            Template::AnalyzeRequest,
            context! {
                request => &request.text,
                case_reference => &request.case_reference,
                file_count => file_count,
                document_count => request.document_ids.len(),
                schema => ANALYZE_SITE.schema,
            },
            || RequestAnalysis::document_processing(file_count),
        );
        if decided.value.required_processing.is_empty() {
            decided = Decided {
                value: RequestAnalysis {
                    required_processing: AgentKind::ALL.to_vec(),
                    ..decided.value
                },
                provenance: Provenance::Fallback {
                    kind: ErrorKind::ReasoningMalformedOutput,
                    reason: "analysis named no processing".to_string(),
                },
            };
        }
        board.update("analysis", json!(decided.value), PLANNER);
        self.record(
            board,
            "analyze_request",
            provenance_status(&decided),
            json!({ "intent": decided.value.intent, "fallback": decided.fallback_reason() }),
        );
        decided
    }

    /// Build the execution plan. Falls back to the fixed sequential plan.
    #[instrument(skip_all)]
    pub fn create_plan(&self, analysis: &RequestAnalysis, board: &mut Blackboard) -> Decided<ExecutionPlan> {
        let required = analysis.required_processing.clone();
        let decided = self.consultant.ask(
            &PLAN_SITE,
            Template::CreatePlan,
            context! { analysis => analysis, schema => PLAN_SITE.schema },
            || default_plan(&required),
        );
        let decided = match decided.provenance {
            Provenance::Reasoned => match sanitize_plan(decided.value) {
                Ok(plan) => Decided {
                    value: plan,
                    provenance: Provenance::Reasoned,
                },
                Err(reason) => Decided {
                    value: default_plan(&required),
                    provenance: Provenance::Fallback {
                        kind: ErrorKind::ReasoningMalformedOutput,
                        reason,
                    },
                },
            },
            fallback => Decided {
                value: decided.value,
                provenance: fallback,
            },
        };
        board.update("execution_plan", json!(decided.value), PLANNER);
        self.record(
            board,
            "create_plan",
            provenance_status(&decided),
            json!({
                "steps": decided.value.steps.iter().map(|s| s.agent).collect::<Vec<_>>(),
                "fallback": decided.fallback_reason(),
            }),
        );
        decided
    }

    /// Ask what to do about a step whose dependencies have not completed.
    ///
    /// Undecidable answers become `skip`.
    pub fn handle_dependency_failure(
        &self,
        step: &PlanStep,
        unmet: &[AgentKind],
        board: &mut Blackboard,
    ) -> DependencyDecision {
        let workflow = board.workflow_state().clone();
        let decided = self.consultant.ask(
            &DEPENDENCY_SITE,
            Template::DependencyFailure,
            context! {
                step => step,
                unmet => unmet,
                completed => workflow.completed_steps,
                failed => workflow.failed_steps,
                schema => DEPENDENCY_SITE.schema,
            },
            || DependencyDecision {
                decision: DependencyChoice::Skip,
                reason: "no usable decision; skipping".to_string(),
            },
        );
        if let Some(reason) = decided.fallback_reason() {
            warn!(agent = %step.agent, %reason, "dependency decision undecidable, skipping step");
        }
        self.record(
            board,
            "dependency_unmet",
            ErrorKind::DependencyUnmet.as_str(),
            json!({
                "agent": step.agent,
                "unmet": unmet,
                "decision": decided.value.decision,
                "reason": decided.value.reason,
            }),
        );
        decided.value
    }

    fn task_for(&self, step: &PlanStep, request: &ProcessingRequest, scope: &[String]) -> AgentTask {
        AgentTask {
            description: step.task.clone(),
            case_reference: request.case_reference.clone(),
            files: if step.agent == AgentKind::Intake {
                request.files.clone()
            } else {
                Vec::new()
            },
            document_ids: scope.to_vec(),
        }
    }

    fn skip(&self, board: &mut Blackboard, skipped: &mut Vec<SkippedStep>, agent: AgentKind, reason: String) {
        info!(agent = %agent, %reason, "step skipped");
        self.record(board, "skip_step", "skipped", json!({ "agent": agent, "reason": reason }));
        board.update_workflow_state(WorkflowUpdate {
            failed: vec![agent.as_str().to_string()],
            ..WorkflowUpdate::default()
        });
        skipped.push(SkippedStep { agent, reason });
    }

    /// Run the plan step by step, adapting it after failures.
    #[instrument(skip_all, fields(case = %request.case_reference))]
    pub fn execute_plan(
        &self,
        plan: &ExecutionPlan,
        request: &ProcessingRequest,
        board: &mut Blackboard,
    ) -> (Vec<AgentResult>, Vec<SkippedStep>) {
        board.update_workflow_state(WorkflowUpdate {
            phase: Some(WorkflowPhase::Execution),
            pending: Some(plan.steps.iter().map(|s| s.agent.as_str().to_string()).collect()),
            ..WorkflowUpdate::default()
        });

        let mut queue: VecDeque<PlanStep> = plan.steps.iter().cloned().collect();
        let mut results = Vec::new();
        let mut skipped = Vec::new();
        let mut retried: Vec<AgentKind> = Vec::new();
        let mut deferred: Vec<AgentKind> = Vec::new();
        // A resumed request is scoped to its documents plus whatever intake registers.
        let mut scope = request.document_ids.clone();

        while let Some(step) = queue.pop_front() {
            let unmet = unmet_dependencies(&step, &board.workflow_state().completed_steps);
            if !unmet.is_empty() {
                let decision = self.handle_dependency_failure(&step, &unmet, board);
                match decision.decision {
                    DependencyChoice::Retry if !retried.contains(&step.agent) => {
                        retried.push(step.agent);
                        let agent = step.agent;
                        queue.push_front(step);
                        for dep in unmet.iter().rev() {
                            let queued = queue
                                .iter()
                                .position(|queued| queued.agent == *dep)
                                .and_then(|position| queue.remove(position));
                            queue.push_front(queued.unwrap_or_else(|| PlanStep {
                                agent: *dep,
                                task: format!("Re-run {dep} for {agent}"),
                                dependencies: Vec::new(),
                            }));
                        }
                        continue;
                    }
                    DependencyChoice::Wait if !deferred.contains(&step.agent) && !queue.is_empty() => {
                        deferred.push(step.agent);
                        queue.push_back(step);
                        continue;
                    }
                    _ => {
                        let reason = format!("unmet dependencies: {}", join(&unmet));
                        self.skip(board, &mut skipped, step.agent, reason);
                        continue;
                    }
                }
            }

            let Some(specialist) = self.specialist(step.agent) else {
                self.skip(board, &mut skipped, step.agent, format!("no specialist for {}", step.agent));
                continue;
            };
            let task = self.task_for(&step, request, &scope);
            let result = execute(specialist, self.consultant, &task, board);
            if !scope.is_empty() {
                for id in result.outcomes.iter().filter(|o| o.ok).filter_map(|o| o.document_id.as_ref()) {
                    if !scope.contains(id) {
                        scope.push(id.clone());
                    }
                }
            }
            let status = planning_status(
                result.status,
                result.outcomes.iter().filter_map(|o| o.error_kind),
            );
            if status != result.status {
                info!(agent = %step.agent, "step failed for every item but moved documents on");
            }
            let name = step.agent.as_str().to_string();
            board.update_workflow_state(if status == AgentStatus::Failed {
                WorkflowUpdate {
                    failed: vec![name],
                    ..WorkflowUpdate::default()
                }
            } else {
                WorkflowUpdate {
                    completed: vec![name],
                    ..WorkflowUpdate::default()
                }
            });

            let adaptation = adapt_to_failure(step.agent, status, queue.drain(..).collect());
            queue = adaptation.remaining.into();
            for (agent, reason) in adaptation.dropped {
                self.skip(board, &mut skipped, agent, reason);
            }
            results.push(result);
        }
        (results, skipped)
    }

    /// Analyze, plan, execute, then settle the workflow phase.
    ///
    /// The request fails only if no step completed.
    #[instrument(skip_all, fields(case = %request.case_reference))]
    pub fn run(&self, request: &ProcessingRequest, board: &mut Blackboard) -> PlanOutcome {
        // Step lists describe this request only; earlier requests stay in history.
        board.update_workflow_state(WorkflowUpdate {
            phase: Some(WorkflowPhase::Planning),
            reset_steps: true,
            ..WorkflowUpdate::default()
        });
        let analysis = self.analyze_request(request, board).value;
        let plan = self.create_plan(&analysis, board).value;
        let (results, skipped) = self.execute_plan(&plan, request, board);

        board.update_workflow_state(WorkflowUpdate {
            phase: Some(WorkflowPhase::Reflection),
            ..WorkflowUpdate::default()
        });
        let any_completed = results.iter().any(|r| r.status != AgentStatus::Failed);
        let phase = if any_completed {
            WorkflowPhase::Completed
        } else {
            WorkflowPhase::Failed
        };
        let suggestions: Vec<&String> = results.iter().flat_map(|r| r.suggestions.iter()).collect();
        board.update(
            "plan_outcome",
            json!({
                "phase": phase,
                "statuses": results.iter().map(|r| (r.agent, r.status)).collect::<Vec<_>>(),
                "skipped": skipped,
                "suggestions": suggestions,
            }),
            PLANNER,
        );
        board.update_workflow_state(WorkflowUpdate {
            phase: Some(phase),
            ..WorkflowUpdate::default()
        });
        info!(?phase, steps = results.len(), skipped = skipped.len(), "plan finished");
        PlanOutcome {
            phase,
            analysis,
            plan,
            results,
            skipped,
        }
    }
}

fn provenance_status<T>(decided: &Decided<T>) -> &'static str {
    if decided.is_fallback() { "fallback" } else { "reasoned" }
}

fn join(agents: &[AgentKind]) -> String {
    agents.iter().map(|a| a.as_str()).collect::<Vec<_>>().join(", ")
}
