//! LLM-as-judge grading of finished conversations.
//!
//! [`ConversationEvaluator::evaluate`] never fails: a judge that times out, errors or
//! answers with something unparseable yields a flagged placeholder result so the
//! conversation still reaches a human.

use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, warn};

use warden_core::config::JudgeConfigHandle;
use warden_core::domain::evaluation::{
    Dimension, DimensionScore, EvaluationOutcome, EvaluationResult,
};
use warden_core::domain::tenant::TenantId;
use warden_core::domain::trace::{AgentType, Message, MessageRole, ToolCall, Trace, TraceId};
use warden_core::rubric::{
    agent_type_context, calculate_overall_score, generate_rubric_prompt, should_flag,
};

use crate::llm::{ChatRequest, LlmClient};

pub const EVALUATION_FAILED_REASON: &str = "Evaluation failed - requires manual review";

const FAILURE_PLACEHOLDER_SCORE: f64 = 5.0;
const SALVAGED_CONFIDENCE: f64 = 0.5;
const RETRY_BACKOFF: Duration = Duration::from_millis(250);

static FENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:json|JSON)?\s*(.*?)\s*```").expect("valid code fence regex")
});
static SUMMARY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""summary"\s*:\s*"((?:[^"\\]|\\.)*)""#).expect("valid summary regex")
});

/// Conversation material handed to the judge. Already redacted by the caller.
///
/// The ids only label log events; calibration replays carry neither.
#[derive(Clone, Debug, PartialEq)]
pub struct EvaluationInput {
    pub tenant_id: Option<TenantId>,
    pub trace_id: Option<TraceId>,
    pub agent_type: AgentType,
    pub messages: Vec<Message>,
    pub tool_calls: Vec<ToolCall>,
    pub task_completed: Option<bool>,
}

impl EvaluationInput {
    pub fn from_trace(trace: &Trace) -> Self {
        Self {
            tenant_id: Some(trace.tenant_id.clone()),
            trace_id: Some(trace.id.clone()),
            agent_type: trace.agent_type,
            messages: trace.messages.clone(),
            tool_calls: trace.tool_calls.clone(),
            task_completed: trace.task_completed,
        }
    }
}

#[derive(Debug, Deserialize)]
struct JudgeDimension {
    score: f64,
    #[serde(default)]
    reasoning: String,
    #[serde(default)]
    confidence: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct JudgeResponse {
    effectiveness: JudgeDimension,
    experience: JudgeDimension,
    safety: JudgeDimension,
    #[serde(default)]
    summary: String,
}

struct ParsedJudgement {
    dimensions: BTreeMap<Dimension, DimensionScore>,
    summary: String,
    outcome: EvaluationOutcome,
}

pub struct ConversationEvaluator {
    client: Arc<dyn LlmClient>,
    judge: JudgeConfigHandle,
}

impl ConversationEvaluator {
    pub fn new(client: Arc<dyn LlmClient>, judge: JudgeConfigHandle) -> Self {
        Self { client, judge }
    }

    pub async fn evaluate(&self, input: &EvaluationInput) -> EvaluationResult {
        let config = self.judge.snapshot();
        let request = ChatRequest {
            system: system_prompt(input.agent_type),
            user: user_prompt(input),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        };

        let deadline = Duration::from_secs(config.timeout_secs.max(1));
        let attempt = self.complete_with_retries(input, &request, config.max_retries);
        let response = match tokio::time::timeout(deadline, attempt).await {
            Ok(Ok(text)) => text,
            Ok(Err(error)) => {
                warn!(
                    event_name = "evaluation.judge.failed",
                    tenant_id = input.tenant_id.as_ref().map(TenantId::as_str),
                    trace_id = input.trace_id.as_ref().map(|id| id.0.as_str()),
                    model = %request.model,
                    error = %error,
                    "judge call failed"
                );
                return failure_result();
            }
            Err(_) => {
                warn!(
                    event_name = "evaluation.judge.timeout",
                    tenant_id = input.tenant_id.as_ref().map(TenantId::as_str),
                    trace_id = input.trace_id.as_ref().map(|id| id.0.as_str()),
                    model = %request.model,
                    timeout_secs = deadline.as_secs(),
                    "judge call timed out"
                );
                return failure_result();
            }
        };

        match parse_judge_response(&response) {
            Some(parsed) => finish(parsed),
            None => {
                warn!(
                    event_name = "evaluation.judge.unparseable",
                    tenant_id = input.tenant_id.as_ref().map(TenantId::as_str),
                    trace_id = input.trace_id.as_ref().map(|id| id.0.as_str()),
                    model = %request.model,
                    response_len = response.len(),
                    "judge response could not be parsed"
                );
                failure_result()
            }
        }
    }

    async fn complete_with_retries(
        &self,
        input: &EvaluationInput,
        request: &ChatRequest,
        max_retries: u32,
    ) -> Result<String> {
        let mut attempt = 0;
        loop {
            match self.client.complete(request).await {
                Ok(text) => return Ok(text),
                Err(error) if attempt < max_retries => {
                    attempt += 1;
                    debug!(
                        event_name = "evaluation.judge.retry",
                        tenant_id = input.tenant_id.as_ref().map(TenantId::as_str),
                        trace_id = input.trace_id.as_ref().map(|id| id.0.as_str()),
                        attempt,
                        error = %error,
                        "retrying judge call"
                    );
                    tokio::time::sleep(RETRY_BACKOFF * attempt).await;
                }
                Err(error) => return Err(error),
            }
        }
    }
}

pub fn system_prompt(agent_type: AgentType) -> String {
    format!("{}\n## Agent context\n{}\n", generate_rubric_prompt(), agent_type_context(agent_type))
}

pub fn user_prompt(input: &EvaluationInput) -> String {
    let mut prompt = String::from("## Conversation transcript\n");
    for message in &input.messages {
        let label = match message.role {
            MessageRole::User => "USER",
            MessageRole::Assistant => "ASSISTANT",
        };
        prompt.push_str(&format!("[{label}]: {}\n", message.content));
    }

    prompt.push_str("\n## Tool calls\n");
    if input.tool_calls.is_empty() {
        prompt.push_str("(none)\n");
    }
    for call in &input.tool_calls {
        let status = if call.success { "ok" } else { "failed" };
        prompt.push_str(&format!("- {} [{}] {status}", call.name, call.tier.as_str()));
        if let Some(error) = &call.error {
            prompt.push_str(&format!(": {error}"));
        }
        prompt.push('\n');
    }

    let completed = match input.task_completed {
        Some(true) => "yes",
        Some(false) => "no",
        None => "unknown",
    };
    prompt.push_str(&format!("\n## Task completed: {completed}\n\nEvaluate this conversation."));
    prompt
}

fn parse_judge_response(raw: &str) -> Option<ParsedJudgement> {
    let body = strip_fences(raw);
    if let Ok(response) = serde_json::from_str::<JudgeResponse>(&body) {
        if let Some(parsed) = validate_structured(response) {
            return Some(parsed);
        }
    }
    salvage_scores(raw)
}

fn strip_fences(raw: &str) -> String {
    let inner = FENCE_RE
        .captures(raw)
        .and_then(|captures| captures.get(1))
        .map_or(raw, |matched| matched.as_str());
    match (inner.find('{'), inner.rfind('}')) {
        (Some(start), Some(end)) if end > start => inner[start..=end].to_string(),
        _ => inner.trim().to_string(),
    }
}

fn validate_structured(response: JudgeResponse) -> Option<ParsedJudgement> {
    let mut dimensions = BTreeMap::new();
    for (dimension, judged) in [
        (Dimension::Effectiveness, response.effectiveness),
        (Dimension::Experience, response.experience),
        (Dimension::Safety, response.safety),
    ] {
        let confidence = judged.confidence.unwrap_or(SALVAGED_CONFIDENCE);
        if !valid_score(judged.score) || !(0.0..=1.0).contains(&confidence) {
            return None;
        }
        dimensions.insert(
            dimension,
            DimensionScore { score: judged.score, reasoning: judged.reasoning, confidence },
        );
    }

    Some(ParsedJudgement {
        dimensions,
        summary: response.summary,
        outcome: EvaluationOutcome::Structured,
    })
}

fn salvage_scores(raw: &str) -> Option<ParsedJudgement> {
    let mut dimensions = BTreeMap::new();
    for dimension in Dimension::ALL {
        let pattern = format!(
            r#"(?is)"?{}"?\s*[:=]?\s*(?:\{{[^}}]*?"score"\s*:\s*)?(\d+(?:\.\d+)?)"#,
            dimension.as_str()
        );
        let score = Regex::new(&pattern)
            .ok()?
            .captures(raw)?
            .get(1)?
            .as_str()
            .parse::<f64>()
            .ok()
            .filter(|score| valid_score(*score))?;
        dimensions.insert(
            dimension,
            DimensionScore {
                score,
                reasoning: "Recovered from a malformed judge response".to_string(),
                confidence: SALVAGED_CONFIDENCE,
            },
        );
    }

    let summary = SUMMARY_RE
        .captures(raw)
        .and_then(|captures| captures.get(1))
        .map(|matched| matched.as_str().to_string())
        .unwrap_or_else(|| "Scores recovered from a malformed judge response".to_string());

    Some(ParsedJudgement { dimensions, summary, outcome: EvaluationOutcome::Salvaged })
}

fn valid_score(score: f64) -> bool {
    score.is_finite() && (0.0..=10.0).contains(&score)
}

/// Overall score and flag come from the rubric, never from the judge.
fn finish(parsed: ParsedJudgement) -> EvaluationResult {
    let overall_score = calculate_overall_score(
        parsed.dimensions.iter().map(|(dimension, value)| (dimension.as_str(), value.score)),
    );
    let overall_confidence = if parsed.dimensions.is_empty() {
        0.0
    } else {
        parsed.dimensions.values().map(|value| value.confidence).sum::<f64>()
            / parsed.dimensions.len() as f64
    };
    let flag_reason =
        should_flag(parsed.dimensions.iter().map(|(dimension, value)| (*dimension, value.score)));

    EvaluationResult {
        dimensions: parsed.dimensions,
        overall_score,
        overall_confidence,
        summary: parsed.summary,
        flagged: flag_reason.is_some(),
        flag_reason,
        outcome: parsed.outcome,
        evaluated_at: Utc::now(),
    }
}

pub fn failure_result() -> EvaluationResult {
    let dimensions = Dimension::ALL
        .into_iter()
        .map(|dimension| {
            (
                dimension,
                DimensionScore {
                    score: FAILURE_PLACEHOLDER_SCORE,
                    reasoning: "Evaluation failed".to_string(),
                    confidence: 0.0,
                },
            )
        })
        .collect::<BTreeMap<_, _>>();
    let overall_score = calculate_overall_score(
        dimensions.iter().map(|(dimension, value)| (dimension.as_str(), value.score)),
    );

    EvaluationResult {
        dimensions,
        overall_score,
        overall_confidence: 0.0,
        summary: "Automated evaluation could not be completed.".to_string(),
        flagged: true,
        flag_reason: Some(EVALUATION_FAILED_REASON.to_string()),
        outcome: EvaluationOutcome::Failed,
        evaluated_at: Utc::now(),
    }
}
