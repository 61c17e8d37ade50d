//! Schema-validated parsing of reasoning output with a typed fallback.
//!
//! Every reasoning call site declares a JSON Schema. An answer is accepted only
//! if a JSON payload can be found in it, validates against the schema, and
//! deserializes into the call site's type. Otherwise the call is repeated once
//! with a stricter instruction, then the call site's fallback is used.

use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow};
use jsonschema::validator_for;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::core::types::ErrorKind;
use crate::io::prompt::{PromptEngine, Template};
use crate::io::reasoner::{Reasoner, ReasoningRequest, RetryPolicy, complete_with_retry};

static FENCED_JSON_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:json)?\s*(\{.*?\})\s*```").expect("fence regex should be valid")
});

/// A reasoning call site: its name and the schema its answers must satisfy.
#[derive(Debug, Clone, Copy)]
pub struct CallSite {
    pub name: &'static str,
    pub schema: &'static str,
}

/// Where a decision came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum Provenance {
    Reasoned,
    Fallback { kind: ErrorKind, reason: String },
}

/// A typed value plus its provenance.
#[derive(Debug, Clone, PartialEq)]
pub struct Decided<T> {
    pub value: T,
    pub provenance: Provenance,
}

impl<T> Decided<T> {
    pub fn is_fallback(&self) -> bool {
        matches!(self.provenance, Provenance::Fallback { .. })
    }

    pub fn fallback_reason(&self) -> Option<&str> {
        match &self.provenance {
            Provenance::Fallback { reason, .. } => Some(reason),
            Provenance::Reasoned => None,
        }
    }
}

/// Find the JSON object carried by free text.
///
/// Accepts a bare object, a fenced ```json block, or the outermost `{...}`
/// span embedded in prose.
pub fn extract_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(trimmed) {
        return Some(value);
    }
    if let Some(caps) = FENCED_JSON_RE.captures(trimmed)
        && let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(&caps[1])
    {
        return Some(value);
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end <= start {
        return None;
    }
    match serde_json::from_str::<Value>(&trimmed[start..=end]) {
        Ok(value @ Value::Object(_)) => Some(value),
        _ => None,
    }
}

/// Validate `instance` against the JSON Schema text `schema`.
pub fn validate_against(schema: &str, instance: &Value) -> Result<()> {
    let schema_value: Value = serde_json::from_str(schema).context("parse embedded schema")?;
    let compiled = validator_for(&schema_value).map_err(|err| anyhow!("invalid schema: {}", err))?;
    let messages: Vec<String> = compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        return Err(anyhow!("schema validation failed: {}", messages.join("; ")));
    }
    Ok(())
}

/// Parse one answer into `T`, or explain why it is unusable.
pub fn parse_answer<T: DeserializeOwned>(site: &CallSite, text: &str) -> Result<T> {
    let value = extract_json(text).ok_or_else(|| anyhow!("no JSON object in answer"))?;
    validate_against(site.schema, &value)?;
    serde_json::from_value(value).with_context(|| format!("deserialize {} answer", site.name))
}

fn stricter_prompt(site: &CallSite, prompt: &str, problem: &str) -> String {
    format!(
        "{prompt}\n\n<correction>\nYour previous answer could not be used: {problem}.\n\
         Respond with ONLY one JSON object, no prose and no code fences, \
         matching this JSON Schema:\n{schema}\n</correction>\n",
        schema = site.schema.trim()
    )
}

/// Ask the reasoner at `site` and return a typed answer or the fallback.
///
/// Never fails: transport exhaustion and malformed output both resolve to
/// `fallback()`, tagged with the reason.
#[instrument(skip_all, fields(call_site = site.name))]
pub fn decide<R, T, F>(
    reasoner: &R,
    policy: RetryPolicy,
    site: &CallSite,
    prompt: String,
    fallback: F,
) -> Decided<T>
where
    R: Reasoner,
    T: DeserializeOwned,
    F: FnOnce() -> T,
{
    let fall_back = |kind: ErrorKind, reason: String, fallback: F| {
        warn!(kind = kind.as_str(), %reason, "using fallback decision");
        Decided {
            value: fallback(),
            provenance: Provenance::Fallback { kind, reason },
        }
    };

    if !reasoner.is_available() {
        return fall_back(
            ErrorKind::TransportError,
            "reasoning provider unavailable".to_string(),
            fallback,
        );
    }

    let mut request = ReasoningRequest {
        call_site: site.name.to_string(),
        prompt,
    };
    let mut problem = String::new();
    for attempt in 0..2 {
        if attempt == 1 {
            request.prompt = stricter_prompt(site, &request.prompt, &problem);
        }
        let text = match complete_with_retry(reasoner, &request, policy) {
            Ok(text) => text,
            Err(err) => return fall_back(ErrorKind::TransportError, format!("{err:#}"), fallback),
        };
        match parse_answer::<T>(site, &text) {
            Ok(value) => {
                debug!(attempt, "accepted reasoning answer");
                return Decided {
                    value,
                    provenance: Provenance::Reasoned,
                };
            }
            Err(err) => {
                warn!(attempt, err = %format!("{err:#}"), "malformed reasoning answer");
                problem = format!("{err:#}");
            }
        }
    }
    fall_back(ErrorKind::ReasoningMalformedOutput, problem, fallback)
}

/// Reasoner, retry policy and prompts bundled for the call sites that consult them.
pub struct Consultant<'a> {
    reasoner: &'a dyn Reasoner,
    policy: RetryPolicy,
    prompts: &'a PromptEngine,
}

impl<'a> Consultant<'a> {
    pub fn new(reasoner: &'a dyn Reasoner, policy: RetryPolicy, prompts: &'a PromptEngine) -> Self {
        Self {
            reasoner,
            policy,
            prompts,
        }
    }

    /// Render `template` with `ctx` and [`decide`] at `site`.
    ///
    /// A template that fails to render is treated like a malformed answer.
    pub fn ask<T, C, F>(&self, site: &CallSite, template: Template, ctx: C, fallback: F) -> Decided<T>
    where
        T: DeserializeOwned,
        C: Serialize,
        F: FnOnce() -> T,
    {
        match self.prompts.render(template, ctx) {
            Ok(prompt) => decide(&self.reasoner, self.policy, site, prompt, fallback),
            Err(err) => {
                let reason = format!("{err:#}");
                warn!(call_site = site.name, %reason, "prompt render failed, using fallback");
                Decided {
                    value: fallback(),
                    provenance: Provenance::Fallback {
                        kind: ErrorKind::ReasoningMalformedOutput,
                        reason,
                    },
                }
            }
        }
    }
}
