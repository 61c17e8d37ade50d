//! Reasoning provider abstraction.
//!
//! The [`Reasoner`] trait decouples agents and the planner from the backend
//! that answers prompts. Production uses [`CommandReasoner`], which pipes the
//! prompt through a configured command; tests use scripted reasoners.

use std::thread;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::io::config::ReasoningConfig;
use crate::io::process::run_with_input;

/// One prompt sent to a reasoning provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReasoningRequest {
    /// Stable name of the call site (e.g. `intake.reason`), for logs and scripting.
    pub call_site: String,
    pub prompt: String,
}

/// Abstraction over reasoning backends.
pub trait Reasoner {
    /// Answer `request` with free text expected to carry a JSON payload.
    ///
    /// Errors are transport failures; malformed answers are returned as text.
    fn complete(&self, request: &ReasoningRequest) -> Result<String>;

    /// Whether the backend is configured at all. Unavailable backends are not called.
    fn is_available(&self) -> bool {
        true
    }
}

impl<R: Reasoner + ?Sized> Reasoner for &R {
    fn complete(&self, request: &ReasoningRequest) -> Result<String> {
        (**self).complete(request)
    }

    fn is_available(&self) -> bool {
        (**self).is_available()
    }
}

impl<R: Reasoner + ?Sized> Reasoner for Box<R> {
    fn complete(&self, request: &ReasoningRequest) -> Result<String> {
        (**self).complete(request)
    }

    fn is_available(&self) -> bool {
        (**self).is_available()
    }
}

/// Reasoner that runs an external command: prompt on stdin, answer on stdout.
#[derive(Debug, Clone)]
pub struct CommandReasoner {
    argv: Vec<String>,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl CommandReasoner {
    pub fn new(argv: Vec<String>, timeout: Duration, output_limit_bytes: usize) -> Self {
        Self {
            argv,
            timeout,
            output_limit_bytes,
        }
    }
}

impl Reasoner for CommandReasoner {
    #[instrument(skip_all, fields(call_site = %request.call_site))]
    fn complete(&self, request: &ReasoningRequest) -> Result<String> {
        let output = run_with_input(
            &self.argv,
            request.prompt.as_bytes(),
            self.timeout,
            self.output_limit_bytes,
        )?;
        if let Some(reason) = output.failure(self.timeout) {
            warn!(%reason, "reasoning command failed");
            return Err(anyhow!("reasoning command {reason}"));
        }
        debug!(bytes = output.stdout.len(), "reasoning command answered");
        Ok(output.stdout_text())
    }
}

/// Reasoner used when no provider is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnavailableReasoner;

impl Reasoner for UnavailableReasoner {
    fn complete(&self, _request: &ReasoningRequest) -> Result<String> {
        Err(anyhow!("no reasoning provider configured"))
    }

    fn is_available(&self) -> bool {
        false
    }
}

/// Build the reasoner described by `config`.
pub fn reasoner_from_config(config: &ReasoningConfig) -> Box<dyn Reasoner> {
    if config.command.is_empty() {
        info!("no reasoning command configured, using deterministic fallbacks");
        Box::new(UnavailableReasoner)
    } else {
        Box::new(CommandReasoner::new(
            config.command.clone(),
            config.timeout(),
            config.output_limit_bytes,
        ))
    }
}

/// Retry budget for transport failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry; doubles on each further retry.
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &ReasoningConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            backoff: config.backoff(),
        }
    }

    /// No waiting between retries; for tests and offline runs.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            backoff: Duration::ZERO,
        }
    }

    pub fn delay_before(&self, retry: u32) -> Duration {
        self.backoff
            .saturating_mul(2u32.saturating_pow(retry.saturating_sub(1)))
    }
}

/// Call the reasoner, retrying transport failures with exponential backoff.
pub fn complete_with_retry<R: Reasoner>(
    reasoner: &R,
    request: &ReasoningRequest,
    policy: RetryPolicy,
) -> Result<String> {
    let mut retry = 0u32;
    loop {
        match reasoner.complete(request) {
            Ok(text) => return Ok(text),
            Err(err) if retry < policy.max_retries => {
                retry += 1;
                let delay = policy.delay_before(retry);
                warn!(
                    call_site = %request.call_site,
                    retry,
                    delay_ms = delay.as_millis() as u64,
                    err = %err,
                    "reasoning call failed, retrying"
                );
                if !delay.is_zero() {
                    thread::sleep(delay);
                }
            }
            Err(err) => {
                return Err(err.context(format!(
                    "reasoning call '{}' failed after {} attempts",
                    request.call_site,
                    retry + 1
                )));
            }
        }
    }
}
