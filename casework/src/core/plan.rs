//! Execution plan shape and the deterministic rules the planner applies to it.

use serde::{Deserialize, Serialize};

use crate::core::types::{AgentKind, AgentStatus, ErrorKind};

/// One delegated step of an execution plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanStep {
    pub agent: AgentKind,
    pub task: String,
    #[serde(default)]
    pub dependencies: Vec<AgentKind>,
}

/// Ordered list of steps; mutable while the plan runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub steps: Vec<PlanStep>,
    #[serde(default)]
    pub rationale: String,
}

fn default_task(agent: AgentKind) -> &'static str {
    match agent {
        AgentKind::Intake => "Validate and register submitted documents",
        AgentKind::Extraction => "Extract text from registered documents",
        AgentKind::Classification => "Classify documents and score case completeness",
    }
}

/// Fixed fallback plan: the requested agents in lifecycle order, each
/// depending on the one before it.
pub fn default_plan(required: &[AgentKind]) -> ExecutionPlan {
    let mut agents: Vec<AgentKind> = AgentKind::ALL
        .into_iter()
        .filter(|agent| required.contains(agent))
        .collect();
    if agents.is_empty() {
        agents = AgentKind::ALL.to_vec();
    }

    let mut steps = Vec::with_capacity(agents.len());
    let mut previous: Option<AgentKind> = None;
    for agent in agents {
        steps.push(PlanStep {
            agent,
            task: default_task(agent).to_string(),
            dependencies: previous.into_iter().collect(),
        });
        previous = Some(agent);
    }
    ExecutionPlan {
        steps,
        rationale: "default sequential plan".to_string(),
    }
}

/// Clean a reasoned plan: drop repeated agents and self-dependencies.
///
/// Returns an error message when nothing usable is left.
pub fn sanitize_plan(plan: ExecutionPlan) -> Result<ExecutionPlan, String> {
    let mut seen: Vec<AgentKind> = Vec::new();
    let mut steps = Vec::new();
    for mut step in plan.steps {
        if seen.contains(&step.agent) {
            continue;
        }
        seen.push(step.agent);
        let mut deps: Vec<AgentKind> = Vec::new();
        for dep in step.dependencies {
            if dep != step.agent && !deps.contains(&dep) {
                deps.push(dep);
            }
        }
        step.dependencies = deps;
        if step.task.trim().is_empty() {
            step.task = default_task(step.agent).to_string();
        }
        steps.push(step);
    }
    if steps.is_empty() {
        return Err("plan has no steps".to_string());
    }
    Ok(ExecutionPlan {
        steps,
        rationale: plan.rationale,
    })
}

/// Dependencies of `step` not yet listed as completed.
pub fn unmet_dependencies(step: &PlanStep, completed: &[String]) -> Vec<AgentKind> {
    step.dependencies
        .iter()
        .copied()
        .filter(|dep| !completed.iter().any(|done| done == dep.as_str()))
        .collect()
}

/// Status the planner acts on for a finished step.
///
/// A failed step whose failures include a degraded one still moved documents
/// forward, so later steps treat it as partial.
pub fn planning_status(status: AgentStatus, failure_kinds: impl IntoIterator<Item = ErrorKind>) -> AgentStatus {
    if status == AgentStatus::Failed && failure_kinds.into_iter().any(ErrorKind::is_degraded) {
        AgentStatus::Partial
    } else {
        status
    }
}

/// Result of adapting the remaining plan after a step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Adaptation {
    pub remaining: Vec<PlanStep>,
    pub dropped: Vec<(AgentKind, String)>,
}

/// Rewrite the remaining steps after `agent` finished with `status`.
///
/// Only a step that failed entirely changes the plan:
/// - failed intake leaves nothing to process, so every remaining step is dropped;
/// - failed extraction drops classification;
/// - any step that depends, directly or transitively, on the failed agent is dropped.
pub fn adapt_to_failure(agent: AgentKind, status: AgentStatus, remaining: Vec<PlanStep>) -> Adaptation {
    if status != AgentStatus::Failed {
        return Adaptation {
            remaining,
            dropped: Vec::new(),
        };
    }

    let mut failed: Vec<AgentKind> = vec![agent];
    let mut kept = Vec::new();
    let mut dropped = Vec::new();
    for step in remaining {
        let reason = if agent == AgentKind::Intake {
            Some("intake failed for every document".to_string())
        } else if agent == AgentKind::Extraction && step.agent == AgentKind::Classification {
            Some("extraction failed for every document".to_string())
        } else {
            step.dependencies
                .iter()
                .find(|dep| failed.contains(dep))
                .map(|dep| format!("depends on failed step '{dep}'"))
        };
        match reason {
            Some(reason) => {
                failed.push(step.agent);
                dropped.push((step.agent, reason));
            }
            None => kept.push(step),
        }
    }
    Adaptation {
        remaining: kept,
        dropped,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(agent: AgentKind, deps: &[AgentKind]) -> PlanStep {
        PlanStep {
            agent,
            task: format!("{agent} task"),
            dependencies: deps.to_vec(),
        }
    }

    #[test]
    fn default_plan_chains_dependencies() {
        let plan = default_plan(&AgentKind::ALL);
        let agents: Vec<_> = plan.steps.iter().map(|s| s.agent).collect();
        assert_eq!(agents, AgentKind::ALL.to_vec());
        assert!(plan.steps[0].dependencies.is_empty());
        assert_eq!(plan.steps[1].dependencies, vec![AgentKind::Intake]);
        assert_eq!(plan.steps[2].dependencies, vec![AgentKind::Extraction]);
    }

    #[test]
    fn default_plan_respects_requested_subset_in_lifecycle_order() {
        let plan = default_plan(&[AgentKind::Classification, AgentKind::Intake]);
        let agents: Vec<_> = plan.steps.iter().map(|s| s.agent).collect();
        assert_eq!(agents, vec![AgentKind::Intake, AgentKind::Classification]);
        assert_eq!(plan.steps[1].dependencies, vec![AgentKind::Intake]);
    }

    #[test]
    fn sanitize_drops_repeats_and_rejects_empty() {
        let plan = ExecutionPlan {
            steps: vec![
                step(AgentKind::Intake, &[AgentKind::Intake]),
                step(AgentKind::Intake, &[]),
            ],
            rationale: String::new(),
        };
        let clean = sanitize_plan(plan).expect("sanitize");
        assert_eq!(clean.steps.len(), 1);
        assert!(clean.steps[0].dependencies.is_empty());

        let empty = ExecutionPlan {
            steps: Vec::new(),
            rationale: String::new(),
        };
        assert!(sanitize_plan(empty).is_err());
    }

    #[test]
    fn unmet_dependencies_checks_completed_names() {
        let s = step(AgentKind::Classification, &[AgentKind::Intake, AgentKind::Extraction]);
        let completed = vec!["intake".to_string()];
        assert_eq!(unmet_dependencies(&s, &completed), vec![AgentKind::Extraction]);
    }

    #[test]
    fn failed_extraction_drops_classification() {
        let remaining = vec![step(AgentKind::Classification, &[])];
        let adapted = adapt_to_failure(AgentKind::Extraction, AgentStatus::Failed, remaining);
        assert!(adapted.remaining.is_empty());
        assert_eq!(adapted.dropped[0].0, AgentKind::Classification);
    }

    #[test]
    fn partial_result_keeps_plan() {
        let remaining = vec![step(AgentKind::Classification, &[AgentKind::Extraction])];
        let adapted = adapt_to_failure(AgentKind::Extraction, AgentStatus::Partial, remaining.clone());
        assert_eq!(adapted.remaining, remaining);
        assert!(adapted.dropped.is_empty());
    }

    #[test]
    fn degraded_extraction_failure_keeps_classification() {
        let status = planning_status(AgentStatus::Failed, [ErrorKind::ExtractionError]);
        assert_eq!(status, AgentStatus::Partial);
        let remaining = vec![step(AgentKind::Classification, &[AgentKind::Extraction])];
        let adapted = adapt_to_failure(AgentKind::Extraction, status, remaining.clone());
        assert_eq!(adapted.remaining, remaining);

        let fatal = planning_status(AgentStatus::Failed, [ErrorKind::TransactionalMoveFailure]);
        assert_eq!(fatal, AgentStatus::Failed);
        assert_eq!(planning_status(AgentStatus::Success, []), AgentStatus::Success);
    }

    #[test]
    fn failed_intake_drops_everything() {
        let remaining = vec![
            step(AgentKind::Extraction, &[]),
            step(AgentKind::Classification, &[]),
        ];
        let adapted = adapt_to_failure(AgentKind::Intake, AgentStatus::Failed, remaining);
        assert!(adapted.remaining.is_empty());
        assert_eq!(adapted.dropped.len(), 2);
    }
}
