use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::tenant::TenantId;
use crate::domain::trace::{AgentType, TraceId, FLAG_REASON_SEPARATOR};
use crate::errors::ApplicationError;

pub const MAX_REVIEWER_LEN: usize = 255;
pub const MAX_REVIEW_NOTES_LEN: usize = 5000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    Pending,
    Reviewed,
    Actioned,
}

impl ReviewStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Reviewed => "reviewed",
            Self::Actioned => "actioned",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "reviewed" => Some(Self::Reviewed),
            "actioned" => Some(Self::Actioned),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewActionKind {
    None,
    Approve,
    Reject,
    Escalate,
    PromptUpdated,
    BugFiled,
    Retrain,
}

impl ReviewActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Approve => "approve",
            Self::Reject => "reject",
            Self::Escalate => "escalate",
            Self::PromptUpdated => "prompt_updated",
            Self::BugFiled => "bug_filed",
            Self::Retrain => "retrain",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "none" => Some(Self::None),
            "approve" => Some(Self::Approve),
            "reject" => Some(Self::Reject),
            "escalate" => Some(Self::Escalate),
            "prompt_updated" => Some(Self::PromptUpdated),
            "bug_filed" => Some(Self::BugFiled),
            "retrain" => Some(Self::Retrain),
            _ => None,
        }
    }

    /// Status a trace ends in once a review with this action is applied.
    pub fn resulting_status(&self) -> ReviewStatus {
        match self {
            Self::None => ReviewStatus::Reviewed,
            _ => ReviewStatus::Actioned,
        }
    }
}

/// Reviewer decision as submitted by the review surface.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReviewSubmission {
    pub reviewed_by: String,
    pub notes: Option<String>,
    pub corrected_score: Option<f64>,
    pub action: ReviewActionKind,
}

impl ReviewSubmission {
    pub fn validate(&self) -> Result<(), ApplicationError> {
        let reviewer = self.reviewed_by.trim();
        if reviewer.is_empty() || reviewer.chars().count() > MAX_REVIEWER_LEN {
            return Err(ApplicationError::Validation(format!(
                "reviewed_by must be 1..={MAX_REVIEWER_LEN} characters"
            )));
        }

        if let Some(notes) = &self.notes {
            if notes.chars().count() > MAX_REVIEW_NOTES_LEN {
                return Err(ApplicationError::Validation(format!(
                    "notes must be at most {MAX_REVIEW_NOTES_LEN} characters"
                )));
            }
        }

        if let Some(score) = self.corrected_score {
            if !score.is_finite() || !(0.0..=10.0).contains(&score) {
                return Err(ApplicationError::Validation(
                    "corrected score must be within 0..=10".to_string(),
                ));
            }
        }

        Ok(())
    }
}

/// Latest reviewer decision stored on the trace itself.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReviewRecord {
    pub reviewed_by: String,
    pub reviewed_at: DateTime<Utc>,
    pub notes: Option<String>,
    pub corrected_score: Option<f64>,
}

/// Append-only audit entry for a non-`none` review decision.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReviewAction {
    pub id: String,
    pub tenant_id: TenantId,
    pub trace_id: TraceId,
    pub action: ReviewActionKind,
    pub notes: Option<String>,
    pub corrected_score: Option<f64>,
    pub performed_by: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlaggedOrder {
    /// Lowest score first, unscored last, then most recent.
    #[default]
    WorstScore,
    MostRecent,
    Oldest,
}

impl FlaggedOrder {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "worst_score" | "score" => Some(Self::WorstScore),
            "most_recent" | "recent" => Some(Self::MostRecent),
            "oldest" => Some(Self::Oldest),
            _ => None,
        }
    }
}

pub const DEFAULT_FLAGGED_LIMIT: u32 = 50;
pub const MAX_FLAGGED_LIMIT: u32 = 200;

/// Listing options for the review queue.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FlaggedQuery {
    pub limit: u32,
    pub agent_type: Option<AgentType>,
    pub max_score: Option<f64>,
    pub review_status: Option<ReviewStatus>,
    pub order: FlaggedOrder,
}

impl Default for FlaggedQuery {
    fn default() -> Self {
        Self {
            limit: DEFAULT_FLAGGED_LIMIT,
            agent_type: None,
            max_score: None,
            review_status: None,
            order: FlaggedOrder::default(),
        }
    }
}

impl FlaggedQuery {
    pub fn effective_limit(&self) -> u32 {
        self.limit.clamp(1, MAX_FLAGGED_LIMIT)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlagCategory {
    LowScore,
    Safety,
    LongConversation,
    SlowResponse,
    EvaluationFailed,
    Injection,
    Other,
}

impl FlagCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LowScore => "low_score",
            Self::Safety => "safety",
            Self::LongConversation => "long_conversation",
            Self::SlowResponse => "slow_response",
            Self::EvaluationFailed => "evaluation_failed",
            Self::Injection => "injection",
            Self::Other => "other",
        }
    }
}

/// Keyword classification of one joined flag reason into its distinct categories.
pub fn classify_flag_reason(reason: &str) -> BTreeSet<FlagCategory> {
    reason
        .split(FLAG_REASON_SEPARATOR)
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            let lower = part.to_ascii_lowercase();
            if lower.contains("evaluation failed") {
                FlagCategory::EvaluationFailed
            } else if lower.contains("injection") {
                FlagCategory::Injection
            } else if lower.contains("safety") {
                FlagCategory::Safety
            } else if lower.contains("low ") && lower.contains("score") {
                FlagCategory::LowScore
            } else if lower.contains("turns") {
                FlagCategory::LongConversation
            } else if lower.contains("latency") || lower.contains("slow") {
                FlagCategory::SlowResponse
            } else {
                FlagCategory::Other
            }
        })
        .collect()
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending_count: u64,
    pub reviewed_today: u64,
    pub average_flagged_score: Option<f64>,
    pub flag_breakdown: BTreeMap<String, u64>,
}

impl QueueStats {
    pub fn count_reason(&mut self, reason: &str) {
        for category in classify_flag_reason(reason) {
            *self.flag_breakdown.entry(category.as_str().to_string()).or_insert(0) += 1;
        }
    }
}
