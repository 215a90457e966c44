//! Sampling, redaction and persistence around the evaluator.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use rand::Rng;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use warden_core::config::EvaluationConfig;
use warden_core::domain::evaluation::{EvaluationOutcome, EvaluationResult};
use warden_core::domain::tenant::TenantId;
use warden_core::domain::trace::{Trace, TraceId};
use warden_core::errors::ApplicationError;
use warden_core::pii::{redact_messages, redact_tool_calls};
use warden_db::TraceRepository;

use crate::evaluator::{ConversationEvaluator, EvaluationInput, EVALUATION_FAILED_REASON};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EvaluationMode {
    /// Evaluate before returning.
    Sync,
    /// Detach into the pipeline's task set and return immediately.
    Async,
}

/// Whether unflagged, successful traces go through the sampling draw.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Sampling {
    #[default]
    Configured,
    Always,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    AlreadyEvaluated,
    NotSampled,
}

#[derive(Clone, Debug, PartialEq)]
pub enum SubmitOutcome {
    Evaluated(EvaluationResult),
    Skipped(SkipReason),
    Queued,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub evaluated: usize,
    pub flagged: usize,
    pub skipped: usize,
    pub not_found: usize,
    pub failed: usize,
}

impl BatchReport {
    fn record(&mut self, outcome: &Result<SubmitOutcome, ApplicationError>) {
        match outcome {
            Ok(SubmitOutcome::Evaluated(result)) => {
                self.evaluated += 1;
                if result.needs_review() {
                    self.flagged += 1;
                }
            }
            Ok(SubmitOutcome::Skipped(_)) | Ok(SubmitOutcome::Queued) => self.skipped += 1,
            Err(ApplicationError::NotFound) => self.not_found += 1,
            Err(_) => self.failed += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.evaluated + self.skipped + self.not_found + self.failed
    }
}

struct PipelineInner {
    repository: Arc<dyn TraceRepository>,
    evaluator: ConversationEvaluator,
    config: EvaluationConfig,
}

/// Detached evaluations. `window` holds at most `max_pending_evaluations` tasks; a full
/// window is handed to a drain task in `draining` so submitters never wait on the judge.
#[derive(Default)]
struct PendingEvaluations {
    window: JoinSet<()>,
    draining: JoinSet<()>,
}

/// Decrements the outstanding counter when a detached evaluation ends, panics included.
struct OutstandingGuard(Arc<AtomicUsize>);

impl Drop for OutstandingGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Cheap to clone; clones share the evaluator, repository and pending task set.
#[derive(Clone)]
pub struct EvaluationPipeline {
    inner: Arc<PipelineInner>,
    pending: Arc<Mutex<PendingEvaluations>>,
    outstanding: Arc<AtomicUsize>,
}

impl EvaluationPipeline {
    pub fn new(
        repository: Arc<dyn TraceRepository>,
        evaluator: ConversationEvaluator,
        config: EvaluationConfig,
    ) -> Self {
        Self {
            inner: Arc::new(PipelineInner { repository, evaluator, config }),
            pending: Arc::new(Mutex::new(PendingEvaluations::default())),
            outstanding: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub async fn submit(
        &self,
        tenant_id: &TenantId,
        trace_id: &TraceId,
        mode: EvaluationMode,
    ) -> Result<SubmitOutcome, ApplicationError> {
        match mode {
            EvaluationMode::Sync => {
                self.inner.evaluate_trace(tenant_id, trace_id, Sampling::Configured).await
            }
            EvaluationMode::Async => {
                let mut pending = self.pending.lock().await;
                reap_finished(&mut pending.window);
                reap_finished(&mut pending.draining);

                if pending.window.len() >= self.inner.config.max_pending_evaluations.max(1) {
                    debug!(
                        event_name = "evaluation.pending.drain",
                        pending = pending.window.len(),
                        "pending evaluations reached capacity; draining in background"
                    );
                    let mut full = std::mem::take(&mut pending.window);
                    pending.draining.spawn(async move { drain(&mut full).await });
                }

                let inner = Arc::clone(&self.inner);
                let tenant_id = tenant_id.clone();
                let trace_id = trace_id.clone();
                self.outstanding.fetch_add(1, Ordering::SeqCst);
                let guard = OutstandingGuard(Arc::clone(&self.outstanding));
                pending.window.spawn(async move {
                    let _guard = guard;
                    if let Err(error) =
                        inner.evaluate_trace(&tenant_id, &trace_id, Sampling::Configured).await
                    {
                        warn!(
                            event_name = "evaluation.async.failed",
                            tenant_id = %tenant_id,
                            trace_id = %trace_id,
                            error = %error,
                            "background evaluation failed"
                        );
                    }
                });
                Ok(SubmitOutcome::Queued)
            }
        }
    }

    /// Awaits every detached evaluation submitted so far.
    pub async fn wait_for_pending(&self) {
        let PendingEvaluations { mut window, mut draining } =
            std::mem::take(&mut *self.pending.lock().await);
        drain(&mut draining).await;
        drain(&mut window).await;
    }

    /// Detached evaluations that have not finished yet.
    pub fn pending_count(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Evaluates `trace_ids` in fixed-size chunks, each chunk concurrently.
    pub async fn process_batch(
        &self,
        tenant_id: &TenantId,
        trace_ids: &[TraceId],
        sampling: Sampling,
    ) -> BatchReport {
        let mut report = BatchReport::default();
        for chunk in trace_ids.chunks(self.inner.config.batch_size.max(1)) {
            let mut join_set = JoinSet::new();
            for trace_id in chunk {
                let inner = Arc::clone(&self.inner);
                let tenant_id = tenant_id.clone();
                let trace_id = trace_id.clone();
                join_set.spawn(async move {
                    inner.evaluate_trace(&tenant_id, &trace_id, sampling).await
                });
            }

            while let Some(joined) = join_set.join_next().await {
                match joined {
                    Ok(outcome) => report.record(&outcome),
                    Err(error) => {
                        warn!(
                            event_name = "evaluation.batch.join_failed",
                            tenant_id = %tenant_id,
                            error = %error,
                            "batch evaluation task ended abnormally"
                        );
                        report.failed += 1;
                    }
                }
            }
        }

        info!(
            event_name = "evaluation.batch.completed",
            tenant_id = %tenant_id,
            evaluated = report.evaluated,
            flagged = report.flagged,
            skipped = report.skipped,
            not_found = report.not_found,
            failed = report.failed,
            "evaluation batch completed"
        );
        report
    }

    /// Unevaluated traces old enough to be considered finished, oldest first.
    pub async fn get_unevaluated_traces(
        &self,
        tenant_id: &TenantId,
        limit: u32,
    ) -> Result<Vec<TraceId>, ApplicationError> {
        let grace = self.inner.config.grace_period_secs.min(u64::from(u32::MAX)) as i64;
        let cutoff = Utc::now() - ChronoDuration::seconds(grace);
        Ok(self.inner.repository.list_unevaluated(tenant_id, cutoff, limit).await?)
    }

    /// Fetches up to `limit` unevaluated traces and evaluates them synchronously.
    pub async fn evaluate_pending(
        &self,
        tenant_id: &TenantId,
        limit: u32,
        sampling: Sampling,
    ) -> Result<BatchReport, ApplicationError> {
        let trace_ids = self.get_unevaluated_traces(tenant_id, limit).await?;
        Ok(self.process_batch(tenant_id, &trace_ids, sampling).await)
    }
}

impl PipelineInner {
    async fn evaluate_trace(
        &self,
        tenant_id: &TenantId,
        trace_id: &TraceId,
        sampling: Sampling,
    ) -> Result<SubmitOutcome, ApplicationError> {
        let trace = self
            .repository
            .find_for_tenant(tenant_id, trace_id)
            .await?
            .ok_or(ApplicationError::NotFound)?;

        if trace.is_evaluated() {
            return Ok(SubmitOutcome::Skipped(SkipReason::AlreadyEvaluated));
        }

        if !self.should_sample(&trace, sampling) {
            debug!(
                event_name = "evaluation.sampling.skipped",
                tenant_id = %tenant_id,
                trace_id = %trace_id,
                sampling_rate = self.config.sampling_rate,
                "trace not selected for evaluation"
            );
            return Ok(SubmitOutcome::Skipped(SkipReason::NotSampled));
        }

        let input = EvaluationInput {
            messages: redact_messages(&trace.messages),
            tool_calls: redact_tool_calls(&trace.tool_calls),
            ..EvaluationInput::from_trace(&trace)
        };
        let result = self.evaluator.evaluate(&input).await;

        let written = match self.persist(tenant_id, trace_id, &result).await {
            Ok(written) => written,
            Err(error) => {
                warn!(
                    event_name = "evaluation.persist.failed",
                    tenant_id = %tenant_id,
                    trace_id = %trace_id,
                    error = %error,
                    "evaluation result could not be stored"
                );
                self.mark_failed(tenant_id, trace_id).await;
                return Err(error);
            }
        };

        if !written {
            return Ok(SubmitOutcome::Skipped(SkipReason::AlreadyEvaluated));
        }

        info!(
            event_name = "evaluation.recorded",
            tenant_id = %tenant_id,
            trace_id = %trace_id,
            overall_score = result.overall_score,
            flagged = result.flagged,
            outcome = ?result.outcome,
            "conversation evaluated"
        );
        Ok(SubmitOutcome::Evaluated(result))
    }

    fn should_sample(&self, trace: &Trace, sampling: Sampling) -> bool {
        if sampling == Sampling::Always || trace.flagged || trace.task_completed == Some(false) {
            return true;
        }
        rand::thread_rng().gen::<f64>() < self.config.sampling_rate
    }

    /// Failed judge results carry placeholder scores, so only the failure is stored.
    async fn persist(
        &self,
        tenant_id: &TenantId,
        trace_id: &TraceId,
        result: &EvaluationResult,
    ) -> Result<bool, ApplicationError> {
        let written = if result.outcome == EvaluationOutcome::Failed {
            self.repository
                .mark_evaluation_failed(tenant_id, trace_id, EVALUATION_FAILED_REASON, Utc::now())
                .await?
        } else {
            self.repository.record_evaluation(tenant_id, trace_id, result).await?
        };
        Ok(written)
    }

    async fn mark_failed(&self, tenant_id: &TenantId, trace_id: &TraceId) {
        if let Err(error) = self
            .repository
            .mark_evaluation_failed(tenant_id, trace_id, EVALUATION_FAILED_REASON, Utc::now())
            .await
        {
            warn!(
                event_name = "evaluation.mark_failed.failed",
                tenant_id = %tenant_id,
                trace_id = %trace_id,
                error = %error,
                "could not mark trace for manual review"
            );
        }
    }
}

fn reap_finished(tasks: &mut JoinSet<()>) {
    while let Some(joined) = tasks.try_join_next() {
        log_join_failure(joined);
    }
}

fn log_join_failure(joined: Result<(), tokio::task::JoinError>) {
    if let Err(error) = joined {
        warn!(
            event_name = "evaluation.async.join_failed",
            error = %error,
            "background evaluation task ended abnormally"
        );
    }
}

async fn drain(pending: &mut JoinSet<()>) {
    while let Some(joined) = pending.join_next().await {
        log_join_failure(joined);
    }
}
