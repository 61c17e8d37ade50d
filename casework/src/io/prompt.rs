//! Prompt rendering for every reasoning call site.
//!
//! Templates live in `io/prompts/` and are compiled into the binary. Each
//! template ends with a `<contract>` block carrying the call site's schema.

use anyhow::{Context, Result};
use minijinja::Environment;
use serde::Serialize;

const AGENT_REASON_TEMPLATE: &str = include_str!("prompts/agent_reason.md");
const AGENT_PLAN_TEMPLATE: &str = include_str!("prompts/agent_plan.md");
const AGENT_REFLECT_TEMPLATE: &str = include_str!("prompts/agent_reflect.md");
const ANALYZE_REQUEST_TEMPLATE: &str = include_str!("prompts/analyze_request.md");
const CREATE_PLAN_TEMPLATE: &str = include_str!("prompts/create_plan.md");
const DEPENDENCY_FAILURE_TEMPLATE: &str = include_str!("prompts/dependency_failure.md");
const FEEDBACK_DECISION_TEMPLATE: &str = include_str!("prompts/feedback_decision.md");

/// Known prompt templates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Template {
    AgentReason,
    AgentPlan,
    AgentReflect,
    AnalyzeRequest,
    CreatePlan,
    DependencyFailure,
    FeedbackDecision,
}

impl Template {
    const ALL: [Template; 7] = [
        Template::AgentReason,
        Template::AgentPlan,
        Template::AgentReflect,
        Template::AnalyzeRequest,
        Template::CreatePlan,
        Template::DependencyFailure,
        Template::FeedbackDecision,
    ];

    fn name(self) -> &'static str {
        match self {
            Template::AgentReason => "agent_reason",
            Template::AgentPlan => "agent_plan",
            Template::AgentReflect => "agent_reflect",
            Template::AnalyzeRequest => "analyze_request",
            Template::CreatePlan => "create_plan",
            Template::DependencyFailure => "dependency_failure",
            Template::FeedbackDecision => "feedback_decision",
        }
    }

    fn source(self) -> &'static str {
        match self {
            Template::AgentReason => AGENT_REASON_TEMPLATE,
            Template::AgentPlan => AGENT_PLAN_TEMPLATE,
            Template::AgentReflect => AGENT_REFLECT_TEMPLATE,
            Template::AnalyzeRequest => ANALYZE_REQUEST_TEMPLATE,
            Template::CreatePlan => CREATE_PLAN_TEMPLATE,
            Template::DependencyFailure => DEPENDENCY_FAILURE_TEMPLATE,
            Template::FeedbackDecision => FEEDBACK_DECISION_TEMPLATE,
        }
    }
}

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
}

impl Default for PromptEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl PromptEngine {
    pub fn new() -> Self {
        let mut env = Environment::new();
        for template in Template::ALL {
            env.add_template(template.name(), template.source())
                .expect("embedded prompt templates should be valid");
        }
        Self { env }
    }

    /// Render `template` with `ctx`, trimming surrounding blank lines.
    pub fn render<S: Serialize>(&self, template: Template, ctx: S) -> Result<String> {
        let compiled = self.env.get_template(template.name())?;
        let rendered = compiled
            .render(ctx)
            .with_context(|| format!("render prompt {}", template.name()))?;
        Ok(rendered.trim().to_string())
    }
}
