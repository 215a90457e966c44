use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::domain::evaluation::EvaluationResult;
use crate::domain::review::{ReviewRecord, ReviewStatus};
use crate::domain::tenant::TenantId;

/// Separator used when several flag reasons accumulate on one trace.
pub const FLAG_REASON_SEPARATOR: &str = "; ";

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TraceId(pub String);

impl TraceId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    Customer,
    Onboarding,
    Admin,
}

impl AgentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Customer => "customer",
            Self::Onboarding => "onboarding",
            Self::Admin => "admin",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "customer" => Some(Self::Customer),
            "onboarding" => Some(Self::Onboarding),
            "admin" => Some(Self::Admin),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// Only set for assistant responses.
    pub latency_ms: Option<u64>,
    pub token_count: u32,
}

/// Tool risk classification.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TrustTier {
    /// Read-only.
    T1,
    /// Mutating but reversible.
    T2,
    /// Consequential and irreversible.
    T3,
}

impl TrustTier {
    pub const ALL: [TrustTier; 3] = [TrustTier::T1, TrustTier::T2, TrustTier::T3];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::T1 => "T1",
            Self::T2 => "T2",
            Self::T3 => "T3",
        }
    }

    pub fn index(&self) -> usize {
        match self {
            Self::T1 => 0,
            Self::T2 => 1,
            Self::T3 => 2,
        }
    }
}

/// Tool input or output as seen by the governance layer. Tool-specific shapes are
/// only interpreted by the tool implementation itself.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ToolPayload(pub Value);

impl ToolPayload {
    pub fn empty() -> Self {
        Self(Value::Null)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Executed,
    Proposed,
    Denied,
    Failed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    Pending,
    Confirmed,
    Rejected,
    Expired,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    pub input: ToolPayload,
    pub output: ToolPayload,
    pub latency_ms: u64,
    pub tier: TrustTier,
    pub success: bool,
    pub error: Option<String>,
    pub execution_state: ExecutionState,
    pub proposal_id: Option<String>,
    pub proposal_status: Option<ProposalStatus>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceMetrics {
    pub turn_count: u32,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub estimated_cost: Decimal,
    pub total_latency_ms: u64,
    pub max_latency_ms: u64,
    pub assistant_responses: u32,
    pub tool_call_count: u32,
    pub error_count: u32,
    pub cache_hit: bool,
}

impl TraceMetrics {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    pub fn average_latency_ms(&self) -> Option<u64> {
        (self.assistant_responses > 0)
            .then(|| self.total_latency_ms / u64::from(self.assistant_responses))
    }
}

/// Durable record of one agent conversation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    pub id: TraceId,
    pub tenant_id: TenantId,
    pub session_id: SessionId,
    pub agent_type: AgentType,
    pub messages: Vec<Message>,
    pub tool_calls: Vec<ToolCall>,
    pub metrics: TraceMetrics,
    /// `None` until the agent loop reports an outcome.
    pub task_completed: Option<bool>,
    pub flagged: bool,
    pub flag_reason: Option<String>,
    pub review_status: Option<ReviewStatus>,
    pub evaluation: Option<EvaluationResult>,
    /// Set when the judge was consulted but produced nothing storable.
    #[serde(default)]
    pub evaluation_failed_at: Option<DateTime<Utc>>,
    pub review: Option<ReviewRecord>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Trace {
    pub fn new(
        id: TraceId,
        tenant_id: TenantId,
        session_id: SessionId,
        agent_type: AgentType,
        started_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            tenant_id,
            session_id,
            agent_type,
            messages: Vec::new(),
            tool_calls: Vec::new(),
            metrics: TraceMetrics::default(),
            task_completed: None,
            flagged: false,
            flag_reason: None,
            review_status: None,
            evaluation: None,
            evaluation_failed_at: None,
            review: None,
            started_at,
            updated_at: started_at,
        }
    }

    /// True once an evaluation was attempted, whether or not it produced scores.
    pub fn is_evaluated(&self) -> bool {
        self.evaluation.is_some() || self.evaluation_failed_at.is_some()
    }

    pub fn eval_score(&self) -> Option<f64> {
        self.evaluation.as_ref().map(|evaluation| evaluation.overall_score)
    }
}

/// Appends `reason` to an existing joined reason, skipping exact duplicates.
pub fn append_flag_reason(existing: Option<&str>, reason: &str) -> String {
    let reason = reason.trim();
    match existing.map(str::trim).filter(|value| !value.is_empty()) {
        None => reason.to_string(),
        Some(current) if reason.is_empty() => current.to_string(),
        Some(current) => {
            if current.split(FLAG_REASON_SEPARATOR).any(|part| part == reason) {
                current.to_string()
            } else {
                format!("{current}{FLAG_REASON_SEPARATOR}{reason}")
            }
        }
    }
}
