use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use warden_core::domain::evaluation::EvaluationResult;
use warden_core::domain::review::{
    FlaggedOrder, FlaggedQuery, QueueStats, ReviewAction, ReviewActionKind, ReviewRecord,
    ReviewStatus, ReviewSubmission,
};
use warden_core::domain::tenant::TenantId;
use warden_core::domain::trace::{append_flag_reason, Trace, TraceId};

use super::{RepositoryError, TraceRepository};

/// Process-local trace store with the same tenant and flag semantics as the SQL store.
#[derive(Default)]
pub struct InMemoryTraceRepository {
    traces: RwLock<HashMap<TraceId, Trace>>,
    actions: RwLock<Vec<ReviewAction>>,
    fail_writes: AtomicBool,
}

impl InMemoryTraceRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent write fail with a database error.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.traces.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.traces.read().await.is_empty()
    }

    fn check_writable(&self) -> Result<(), RepositoryError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(RepositoryError::Database(sqlx::Error::PoolTimedOut));
        }
        Ok(())
    }
}

#[async_trait]
impl TraceRepository for InMemoryTraceRepository {
    async fn save(&self, trace: &Trace) -> Result<(), RepositoryError> {
        self.check_writable()?;
        let mut traces = self.traces.write().await;

        match traces.get_mut(&trace.id) {
            None => {
                traces.insert(trace.id.clone(), trace.clone());
            }
            Some(existing) if existing.tenant_id != trace.tenant_id => {
                return Err(RepositoryError::NotFound);
            }
            Some(existing) => {
                existing.messages = trace.messages.clone();
                existing.tool_calls = trace.tool_calls.clone();
                existing.metrics = trace.metrics.clone();
                existing.task_completed = trace.task_completed;
                existing.flagged |= trace.flagged;
                if let Some(reason) = trace.flag_reason.as_deref() {
                    existing.flag_reason =
                        Some(merge_reason(existing.flag_reason.as_deref(), reason));
                }
                if existing.review_status.is_none() {
                    existing.review_status = trace.review_status;
                }
                existing.updated_at = trace.updated_at;
            }
        }
        Ok(())
    }

    async fn find_for_tenant(
        &self,
        tenant_id: &TenantId,
        id: &TraceId,
    ) -> Result<Option<Trace>, RepositoryError> {
        let traces = self.traces.read().await;
        Ok(traces.get(id).filter(|trace| &trace.tenant_id == tenant_id).cloned())
    }

    async fn list_unevaluated(
        &self,
        tenant_id: &TenantId,
        started_before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<TraceId>, RepositoryError> {
        let traces = self.traces.read().await;
        let mut candidates = traces
            .values()
            .filter(|trace| {
                &trace.tenant_id == tenant_id
                    && !trace.is_evaluated()
                    && trace.started_at < started_before
            })
            .collect::<Vec<_>>();
        candidates.sort_by_key(|trace| trace.started_at);
        Ok(candidates.into_iter().take(limit as usize).map(|trace| trace.id.clone()).collect())
    }

    async fn record_evaluation(
        &self,
        tenant_id: &TenantId,
        id: &TraceId,
        evaluation: &EvaluationResult,
    ) -> Result<bool, RepositoryError> {
        self.check_writable()?;
        let mut traces = self.traces.write().await;
        let Some(trace) = traces.get_mut(id).filter(|trace| &trace.tenant_id == tenant_id) else {
            return Ok(false);
        };
        if trace.is_evaluated() {
            return Ok(false);
        }

        if (trace.flagged || evaluation.flagged) && trace.review_status.is_none() {
            trace.review_status = Some(ReviewStatus::Pending);
        }
        trace.flagged |= evaluation.flagged;
        if let Some(reason) = evaluation.flag_reason.as_deref() {
            trace.flag_reason = Some(merge_reason(trace.flag_reason.as_deref(), reason));
        }
        trace.updated_at = evaluation.evaluated_at;
        trace.evaluation = Some(evaluation.clone());
        Ok(true)
    }

    async fn mark_evaluation_failed(
        &self,
        tenant_id: &TenantId,
        id: &TraceId,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        self.check_writable()?;
        let mut traces = self.traces.write().await;
        let Some(trace) = traces.get_mut(id).filter(|trace| &trace.tenant_id == tenant_id) else {
            return Ok(false);
        };
        if trace.is_evaluated() {
            return Ok(false);
        }

        trace.flagged = true;
        trace.flag_reason = Some(merge_reason(trace.flag_reason.as_deref(), reason));
        trace.review_status.get_or_insert(ReviewStatus::Pending);
        trace.evaluation_failed_at = Some(at);
        trace.updated_at = at;
        Ok(true)
    }

    async fn list_flagged(
        &self,
        tenant_id: &TenantId,
        query: &FlaggedQuery,
    ) -> Result<Vec<Trace>, RepositoryError> {
        let traces = self.traces.read().await;
        let mut matches = traces
            .values()
            .filter(|trace| &trace.tenant_id == tenant_id && trace.flagged)
            .filter(|trace| query.agent_type.map_or(true, |agent| trace.agent_type == agent))
            .filter(|trace| {
                query.max_score.map_or(true, |max| trace.eval_score().is_some_and(|s| s <= max))
            })
            .filter(|trace| {
                query.review_status.map_or(true, |status| trace.review_status == Some(status))
            })
            .cloned()
            .collect::<Vec<_>>();

        match query.order {
            FlaggedOrder::WorstScore => matches.sort_by(|left, right| {
                match (left.eval_score(), right.eval_score()) {
                    (Some(a), Some(b)) => a.total_cmp(&b),
                    (Some(_), None) => std::cmp::Ordering::Less,
                    (None, Some(_)) => std::cmp::Ordering::Greater,
                    (None, None) => std::cmp::Ordering::Equal,
                }
                .then_with(|| right.started_at.cmp(&left.started_at))
            }),
            FlaggedOrder::MostRecent => matches.sort_by(|a, b| b.started_at.cmp(&a.started_at)),
            FlaggedOrder::Oldest => matches.sort_by_key(|trace| trace.started_at),
        }
        matches.truncate(query.effective_limit() as usize);
        Ok(matches)
    }

    async fn apply_review(
        &self,
        tenant_id: &TenantId,
        id: &TraceId,
        submission: &ReviewSubmission,
        reviewed_at: DateTime<Utc>,
    ) -> Result<Option<ReviewAction>, RepositoryError> {
        self.check_writable()?;
        let mut traces = self.traces.write().await;
        let trace = traces
            .get_mut(id)
            .filter(|trace| &trace.tenant_id == tenant_id)
            .ok_or(RepositoryError::NotFound)?;

        let reviewed_by = submission.reviewed_by.trim().to_string();
        let corrected_score = submission
            .corrected_score
            .or_else(|| trace.review.as_ref().and_then(|review| review.corrected_score));
        trace.review_status = Some(submission.action.resulting_status());
        trace.review = Some(ReviewRecord {
            reviewed_by: reviewed_by.clone(),
            reviewed_at,
            notes: submission.notes.clone(),
            corrected_score,
        });
        trace.updated_at = reviewed_at;

        if submission.action == ReviewActionKind::None {
            return Ok(None);
        }

        let action = ReviewAction {
            id: Uuid::new_v4().to_string(),
            tenant_id: tenant_id.clone(),
            trace_id: id.clone(),
            action: submission.action,
            notes: submission.notes.clone(),
            corrected_score: submission.corrected_score,
            performed_by: reviewed_by,
            created_at: reviewed_at,
        };
        self.actions.write().await.push(action.clone());
        Ok(Some(action))
    }

    async fn queue_stats(
        &self,
        tenant_id: &TenantId,
        day_start: DateTime<Utc>,
    ) -> Result<QueueStats, RepositoryError> {
        let traces = self.traces.read().await;
        let mut stats = QueueStats::default();
        let mut flagged_scores = Vec::new();

        for trace in traces.values().filter(|trace| &trace.tenant_id == tenant_id) {
            let pending = trace.review_status == Some(ReviewStatus::Pending);
            if pending {
                stats.pending_count += 1;
            }
            if trace.review.as_ref().is_some_and(|review| review.reviewed_at >= day_start) {
                stats.reviewed_today += 1;
            }
            if trace.flagged {
                if let Some(score) = trace.eval_score() {
                    flagged_scores.push(score);
                }
                if pending {
                    if let Some(reason) = trace.flag_reason.as_deref() {
                        stats.count_reason(reason);
                    }
                }
            }
        }

        if !flagged_scores.is_empty() {
            stats.average_flagged_score =
                Some(flagged_scores.iter().sum::<f64>() / flagged_scores.len() as f64);
        }
        Ok(stats)
    }

    async fn list_review_actions(
        &self,
        tenant_id: &TenantId,
        id: &TraceId,
    ) -> Result<Vec<ReviewAction>, RepositoryError> {
        let actions = self.actions.read().await;
        Ok(actions
            .iter()
            .filter(|action| &action.tenant_id == tenant_id && &action.trace_id == id)
            .cloned()
            .collect())
    }
}

fn merge_reason(existing: Option<&str>, reason: &str) -> String {
    match existing {
        Some(current) if current.contains(reason) => current.to_string(),
        Some(current) if reason.starts_with(current) && !current.is_empty() => reason.to_string(),
        _ => append_flag_reason(existing, reason),
    }
}
