use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use warden_core::domain::review::{
    FlaggedQuery, QueueStats, ReviewAction, ReviewRecord, ReviewStatus, ReviewSubmission,
};
use warden_core::domain::tenant::TenantId;
use warden_core::domain::trace::{AgentType, SessionId, Trace, TraceId};
use warden_core::errors::ApplicationError;
use warden_core::pii::{
    redact_messages, redact_messages_for_preview, redact_tool_calls, PreviewMessage,
    DEFAULT_PREVIEW_LENGTH,
};
use warden_db::TraceRepository;

/// One row of the flagged-conversation listing.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FlaggedConversation {
    pub trace_id: TraceId,
    pub session_id: SessionId,
    pub agent_type: AgentType,
    pub eval_score: Option<f64>,
    pub flag_reason: Option<String>,
    pub review_status: Option<ReviewStatus>,
    pub turn_count: u32,
    pub task_completed: Option<bool>,
    pub started_at: DateTime<Utc>,
    pub preview: Vec<PreviewMessage>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ConversationDetail {
    /// Messages and tool payloads are redacted.
    pub trace: Trace,
    pub review: Option<ReviewRecord>,
    pub review_actions: Vec<ReviewAction>,
}

pub struct ReviewQueue {
    repository: Arc<dyn TraceRepository>,
    preview_length: usize,
}

impl ReviewQueue {
    pub fn new(repository: Arc<dyn TraceRepository>) -> Self {
        Self { repository, preview_length: DEFAULT_PREVIEW_LENGTH }
    }

    pub fn with_preview_length(mut self, preview_length: usize) -> Self {
        self.preview_length = preview_length;
        self
    }

    pub async fn get_flagged_conversations(
        &self,
        tenant_id: &TenantId,
        query: &FlaggedQuery,
    ) -> Result<Vec<FlaggedConversation>, ApplicationError> {
        let traces = self.repository.list_flagged(tenant_id, query).await?;
        Ok(traces
            .into_iter()
            .map(|trace| FlaggedConversation {
                preview: redact_messages_for_preview(&trace.messages, self.preview_length),
                eval_score: trace.eval_score(),
                trace_id: trace.id,
                session_id: trace.session_id,
                agent_type: trace.agent_type,
                flag_reason: trace.flag_reason,
                review_status: trace.review_status,
                turn_count: trace.metrics.turn_count,
                task_completed: trace.task_completed,
                started_at: trace.started_at,
            })
            .collect())
    }

    pub async fn get_conversation(
        &self,
        tenant_id: &TenantId,
        trace_id: &TraceId,
    ) -> Result<ConversationDetail, ApplicationError> {
        let mut trace = self
            .repository
            .find_for_tenant(tenant_id, trace_id)
            .await?
            .ok_or(ApplicationError::NotFound)?;
        let review_actions = self.repository.list_review_actions(tenant_id, trace_id).await?;

        trace.messages = redact_messages(&trace.messages);
        trace.tool_calls = redact_tool_calls(&trace.tool_calls);
        Ok(ConversationDetail { review: trace.review.clone(), trace, review_actions })
    }

    /// Validates and applies a reviewer decision. Returns the appended audit entry for
    /// any action other than `none`.
    pub async fn submit_review(
        &self,
        tenant_id: &TenantId,
        trace_id: &TraceId,
        submission: &ReviewSubmission,
    ) -> Result<Option<ReviewAction>, ApplicationError> {
        submission.validate()?;

        let action =
            self.repository.apply_review(tenant_id, trace_id, submission, Utc::now()).await?;
        info!(
            event_name = "review.submitted",
            tenant_id = %tenant_id,
            trace_id = %trace_id,
            action = submission.action.as_str(),
            status = submission.action.resulting_status().as_str(),
            corrected_score = ?submission.corrected_score,
            "review applied"
        );
        Ok(action)
    }

    pub async fn get_queue_stats(
        &self,
        tenant_id: &TenantId,
    ) -> Result<QueueStats, ApplicationError> {
        Ok(self.repository.queue_stats(tenant_id, start_of_day(Utc::now())).await?)
    }

    pub async fn list_review_actions(
        &self,
        tenant_id: &TenantId,
        trace_id: &TraceId,
    ) -> Result<Vec<ReviewAction>, ApplicationError> {
        Ok(self.repository.list_review_actions(tenant_id, trace_id).await?)
    }
}

fn start_of_day(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive().and_hms_opt(0, 0, 0).map_or(now, |midnight| midnight.and_utc())
}
