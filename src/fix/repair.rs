//! Repair-suggestion capability.
//!
//! The loop hands a [`RepairContext`] to a [`RepairAgent`] and gets raw text
//! back; parsing is the loop's job (see [`super::parser`]), so agents may
//! answer in JSON, fenced JSON or a unified diff.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::FixError;
use crate::llm::{GenerationRequest, LlmProvider, Message};
use crate::metrics::{MetricsCollector, TokenUsage};

use super::config::{FixConfig, TokenPricing};
use super::types::{Attempt, CodeContext, Provenance, TestFailure};

/// Longest log excerpt included in a prompt.
const MAX_LOG_CHARS: usize = 8_000;
/// Longest single source file included in a prompt.
const MAX_FILE_CHARS: usize = 12_000;

/// What a prior iteration tried and how it went.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttemptSummary {
    pub iteration: u32,
    pub description: String,
    pub outcome: String,
}

impl From<&Attempt> for AttemptSummary {
    fn from(attempt: &Attempt) -> Self {
        Self {
            iteration: attempt.iteration,
            description: attempt
                .patch
                .as_ref()
                .map(|p| p.description.clone())
                .unwrap_or_else(|| "no patch produced".to_string()),
            outcome: attempt.outcome(),
        }
    }
}

/// Input to one repair request.
#[derive(Debug, Clone, Serialize)]
pub struct RepairContext {
    pub job_id: String,
    pub iteration: u32,
    pub max_iterations: u32,
    pub failure: TestFailure,
    pub code: CodeContext,
    pub previous_attempts: Vec<AttemptSummary>,
}

/// Raw repair output plus where it came from.
#[derive(Debug, Clone)]
pub struct RepairResponse {
    pub text: String,
    pub provenance: Provenance,
}

#[async_trait]
pub trait RepairAgent: Send + Sync {
    async fn generate(&self, ctx: &RepairContext) -> Result<RepairResponse, FixError>;
}

const REPAIR_SYSTEM_PROMPT: &str = r#"You are a senior software engineer repairing generated code so that its test suite passes.

You are given the failing tests, the test output, the relevant source files, and a summary of earlier repair attempts that did not work. Do not repeat an approach that already failed.

Output Format:
Respond with ONLY a JSON object in this exact format:
{
  "analysis": "<root cause of the failure>",
  "changes": [
    {
      "file": "<path relative to the project root>",
      "action": "create" | "modify" | "delete",
      "content": "<complete new file contents; omit for delete>",
      "explanation": "<why this change fixes the failure>"
    }
  ],
  "description": "<one-line summary of the fix>",
  "confidence": <number between 0 and 1>
}

Always send complete file contents for create and modify. Paths must stay inside the project."#;

/// Builds the user prompt for one iteration.
pub fn build_repair_prompt(ctx: &RepairContext) -> String {
    let mut prompt = format!(
        "Repair job {} (iteration {} of {}).\n\n## Failure\n{}\n",
        ctx.job_id, ctx.iteration, ctx.max_iterations, ctx.failure.message
    );

    if !ctx.failure.failing_tests.is_empty() {
        prompt.push_str("\n## Failing tests\n");
        for test in &ctx.failure.failing_tests {
            prompt.push_str(&format!("- {}\n", test));
        }
    }

    if !ctx.failure.logs.is_empty() {
        prompt.push_str(&format!(
            "\n## Test output\n```\n{}\n```\n",
            tail(&ctx.failure.logs, MAX_LOG_CHARS)
        ));
    }

    if let Some(language) = &ctx.code.language {
        prompt.push_str(&format!("\nLanguage: {}\n", language));
    }
    if let Some(notes) = &ctx.code.notes {
        prompt.push_str(&format!("\n## Notes\n{}\n", notes));
    }

    if !ctx.code.files.is_empty() {
        prompt.push_str("\n## Source files\n");
        for file in &ctx.code.files {
            prompt.push_str(&format!(
                "\n### {}\n```\n{}\n```\n",
                file.path,
                head(&file.content, MAX_FILE_CHARS)
            ));
        }
    }

    if ctx.previous_attempts.is_empty() {
        prompt.push_str("\nThis is the first repair attempt.\n");
    } else {
        prompt.push_str("\n## Previous attempts\n");
        for attempt in &ctx.previous_attempts {
            prompt.push_str(&format!(
                "- Iteration {}: {} => {}\n",
                attempt.iteration, attempt.description, attempt.outcome
            ));
        }
    }

    prompt
}

fn tail(text: &str, max_chars: usize) -> &str {
    let count = text.chars().count();
    if count <= max_chars {
        return text;
    }
    let skip = count - max_chars;
    let start = text.char_indices().nth(skip).map(|(i, _)| i).unwrap_or(0);
    &text[start..]
}

fn head(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((end, _)) => &text[..end],
        None => text,
    }
}

/// [`RepairAgent`] backed by a chat-completion provider.
pub struct LlmRepairAgent {
    llm: Arc<dyn LlmProvider>,
    model: String,
    temperature: f64,
    max_tokens: u32,
    pricing: TokenPricing,
    metrics: MetricsCollector,
}

impl LlmRepairAgent {
    pub fn new(llm: Arc<dyn LlmProvider>, config: &FixConfig) -> Self {
        Self {
            llm,
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            pricing: config.pricing,
            metrics: MetricsCollector::new(),
        }
    }
}

#[async_trait]
impl RepairAgent for LlmRepairAgent {
    async fn generate(&self, ctx: &RepairContext) -> Result<RepairResponse, FixError> {
        let request = GenerationRequest::new(
            self.model.clone(),
            vec![
                Message::system(REPAIR_SYSTEM_PROMPT),
                Message::user(build_repair_prompt(ctx)),
            ],
        )
        .with_temperature(self.temperature)
        .with_max_tokens(self.max_tokens);

        let started = Instant::now();
        let response = self.llm.generate(request).await?;
        let latency_ms = started.elapsed().as_millis() as u64;

        let text = response
            .first_content()
            .ok_or_else(|| FixError::Repair("empty response from repair provider".to_string()))?
            .to_string();

        let usage = &response.usage;
        let cost_usd = self.pricing.cost(usage.prompt_tokens, usage.completion_tokens);
        self.metrics.record_repair(
            &response.model,
            TokenUsage::new(usage.prompt_tokens as u64, usage.completion_tokens as u64),
            cost_usd,
        );

        tracing::debug!(
            job_id = %ctx.job_id,
            iteration = ctx.iteration,
            model = %response.model,
            tokens = usage.total_tokens,
            cost_usd,
            latency_ms,
            "Repair suggestion received"
        );

        Ok(RepairResponse {
            text,
            provenance: Provenance {
                provider: self.llm.name().to_string(),
                model: response.model.clone(),
                cost_usd,
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
                latency_ms,
            },
        })
    }
}
