//! Incremental recording of one agent session into a persisted [`Trace`].
//!
//! Each session owns a tracer. Writes go to a dedicated writer task over a bounded
//! channel, so persistence is ordered and never blocks the agent loop. Persistence
//! failures are logged and dropped; the conversation carries on regardless.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use warden_core::config::TracerConfig;
use warden_core::cost::estimate_cost;
use warden_core::domain::tenant::TenantId;
use warden_core::domain::trace::{
    append_flag_reason, AgentType, Message, MessageRole, SessionId, ToolCall, Trace, TraceId,
};
use warden_db::TraceRepository;

enum WriteCommand {
    Persist(Box<Trace>),
    Barrier(oneshot::Sender<()>),
}

struct ActiveTrace {
    trace: Trace,
    dirty: bool,
    writer: mpsc::Sender<WriteCommand>,
    writer_task: JoinHandle<()>,
    persisted: Arc<AtomicBool>,
}

pub struct ConversationTracer {
    config: TracerConfig,
    repository: Arc<dyn TraceRepository>,
    active: Option<ActiveTrace>,
}

impl ConversationTracer {
    pub fn new(config: TracerConfig, repository: Arc<dyn TraceRepository>) -> Self {
        Self { config, repository, active: None }
    }

    /// Starts a trace. Calling it again while a trace is active keeps the current one.
    pub fn initialize(
        &mut self,
        tenant_id: TenantId,
        session_id: SessionId,
        agent_type: AgentType,
    ) -> TraceId {
        if let Some(active) = &self.active {
            debug!(
                event_name = "tracer.initialize.ignored",
                trace_id = %active.trace.id,
                "tracer already initialized for this session"
            );
            return active.trace.id.clone();
        }

        let trace =
            Trace::new(TraceId::generate(), tenant_id, session_id, agent_type, Utc::now());
        let id = trace.id.clone();
        let (writer, receiver) = mpsc::channel(self.config.write_queue_capacity.max(1));
        let persisted = Arc::new(AtomicBool::new(false));
        let writer_task =
            tokio::spawn(run_writer(Arc::clone(&self.repository), receiver, Arc::clone(&persisted)));

        self.active = Some(ActiveTrace { trace, dirty: true, writer, writer_task, persisted });
        id
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn trace_id(&self) -> Option<&TraceId> {
        self.active.as_ref().map(|active| &active.trace.id)
    }

    /// In-memory view of the trace being recorded.
    pub fn current(&self) -> Option<&Trace> {
        self.active.as_ref().map(|active| &active.trace)
    }

    pub fn record_user_message(&mut self, content: impl Into<String>, token_count: u32) {
        let Some(active) = self.active.as_mut() else {
            return;
        };

        let now = Utc::now();
        let trace = &mut active.trace;
        trace.messages.push(Message {
            role: MessageRole::User,
            content: content.into(),
            timestamp: now,
            latency_ms: None,
            token_count,
        });
        trace.metrics.turn_count += 1;
        trace.metrics.input_tokens += u64::from(token_count);
        trace.metrics.estimated_cost +=
            estimate_cost(&self.config.model, u64::from(token_count), 0);
        trace.updated_at = now;
        active.dirty = true;

        self.apply_auto_flags(None);
    }

    pub fn record_assistant_response(
        &mut self,
        content: impl Into<String>,
        latency_ms: u64,
        token_count: u32,
    ) {
        let Some(active) = self.active.as_mut() else {
            return;
        };

        let now = Utc::now();
        let trace = &mut active.trace;
        trace.messages.push(Message {
            role: MessageRole::Assistant,
            content: content.into(),
            timestamp: now,
            latency_ms: Some(latency_ms),
            token_count,
        });
        let metrics = &mut trace.metrics;
        metrics.output_tokens += u64::from(token_count);
        metrics.estimated_cost += estimate_cost(&self.config.model, 0, u64::from(token_count));
        metrics.assistant_responses += 1;
        metrics.total_latency_ms += latency_ms;
        metrics.max_latency_ms = metrics.max_latency_ms.max(latency_ms);
        trace.updated_at = now;
        active.dirty = true;

        self.apply_auto_flags(Some(latency_ms));
    }

    pub fn record_tool_call(&mut self, call: ToolCall) {
        let Some(active) = self.active.as_mut() else {
            return;
        };

        let trace = &mut active.trace;
        trace.metrics.tool_call_count += 1;
        if !call.success {
            trace.metrics.error_count += 1;
        }
        trace.updated_at = Utc::now();
        trace.tool_calls.push(call);
        active.dirty = true;
    }

    /// Marks the trace for review. Reasons accumulate; duplicates are dropped.
    pub fn flag(&mut self, reason: &str) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        let trace = &mut active.trace;
        let merged = append_flag_reason(trace.flag_reason.as_deref(), reason);
        if trace.flagged && trace.flag_reason.as_deref() == Some(merged.as_str()) {
            return;
        }
        trace.flagged = true;
        trace.flag_reason = Some(merged);
        active.dirty = true;
    }

    pub fn set_cache_hit(&mut self, cache_hit: bool) {
        if let Some(active) = self.active.as_mut() {
            if active.trace.metrics.cache_hit != cache_hit {
                active.trace.metrics.cache_hit = cache_hit;
                active.dirty = true;
            }
        }
    }

    pub fn set_task_completed(&mut self, completed: bool) {
        if let Some(active) = self.active.as_mut() {
            if active.trace.task_completed != Some(completed) {
                active.trace.task_completed = Some(completed);
                active.dirty = true;
            }
        }
    }

    /// Queues the current state for persistence without waiting. No-op when nothing changed.
    pub fn flush(&mut self) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        if !active.dirty {
            return;
        }

        enforce_size_caps(&mut active.trace, &self.config);
        let snapshot = Box::new(active.trace.clone());
        match active.writer.try_send(WriteCommand::Persist(snapshot)) {
            Ok(()) => active.dirty = false,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    event_name = "tracer.flush.queue_full",
                    trace_id = %active.trace.id,
                    "trace write queue full; will retry on next flush"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!(
                    event_name = "tracer.flush.writer_closed",
                    trace_id = %active.trace.id,
                    "trace writer stopped; dropping flush"
                );
            }
        }
    }

    /// Resolves once every write queued so far has been attempted.
    pub async fn wait_for_pending_writes(&self) {
        let Some(active) = self.active.as_ref() else {
            return;
        };
        let (done, wait) = oneshot::channel();
        if active.writer.send(WriteCommand::Barrier(done)).await.is_ok() {
            let _ = wait.await;
        }
    }

    /// Flushes, waits for the writer and clears the session.
    ///
    /// Returns the trace id if at least one write reached storage.
    pub async fn finalize(&mut self) -> Option<TraceId> {
        if let Some(active) = self.active.as_mut() {
            if active.dirty {
                enforce_size_caps(&mut active.trace, &self.config);
                let snapshot = Box::new(active.trace.clone());
                if active.writer.send(WriteCommand::Persist(snapshot)).await.is_ok() {
                    active.dirty = false;
                }
            }
        }

        let active = self.active.take()?;
        let ActiveTrace { trace, writer, writer_task, persisted, .. } = active;
        drop(writer);
        if let Err(error) = writer_task.await {
            warn!(
                event_name = "tracer.writer.join_failed",
                trace_id = %trace.id,
                error = %error,
                "trace writer task ended abnormally"
            );
        }

        if persisted.load(Ordering::SeqCst) {
            Some(trace.id)
        } else {
            warn!(
                event_name = "tracer.finalize.not_persisted",
                trace_id = %trace.id,
                tenant_id = %trace.tenant_id,
                "trace finalized without a successful write"
            );
            None
        }
    }

    fn apply_auto_flags(&mut self, latency_ms: Option<u64>) {
        let max_turns = self.config.max_turns_before_flag;
        let max_latency = self.config.max_latency_ms;
        let Some(turns) = self.active.as_ref().map(|active| active.trace.metrics.turn_count) else {
            return;
        };

        if turns > max_turns {
            self.flag(&format!("Conversation exceeded {max_turns} turns"));
        }
        if let Some(latency) = latency_ms.filter(|latency| *latency > max_latency) {
            self.flag(&format!("Slow response latency: {latency}ms exceeded {max_latency}ms"));
        }
    }
}

async fn run_writer(
    repository: Arc<dyn TraceRepository>,
    mut receiver: mpsc::Receiver<WriteCommand>,
    persisted: Arc<AtomicBool>,
) {
    while let Some(command) = receiver.recv().await {
        match command {
            WriteCommand::Persist(trace) => match repository.save(&trace).await {
                Ok(()) => persisted.store(true, Ordering::SeqCst),
                Err(error) => warn!(
                    event_name = "tracer.flush.failed",
                    tenant_id = %trace.tenant_id,
                    trace_id = %trace.id,
                    error = %error,
                    "trace persistence failed; continuing without it"
                ),
            },
            WriteCommand::Barrier(done) => {
                let _ = done.send(());
            }
        }
    }
}

/// Keeps the most recent entries once a serialized list exceeds its byte cap.
fn enforce_size_caps(trace: &mut Trace, config: &TracerConfig) {
    if serialized_len(&trace.messages) > config.max_messages_bytes {
        keep_tail(&mut trace.messages, config.retained_messages);
    }
    if serialized_len(&trace.tool_calls) > config.max_tool_calls_bytes {
        keep_tail(&mut trace.tool_calls, config.retained_tool_calls);
    }
}

fn serialized_len<T: serde::Serialize>(items: &[T]) -> usize {
    serde_json::to_vec(items).map(|bytes| bytes.len()).unwrap_or(usize::MAX)
}

fn keep_tail<T>(items: &mut Vec<T>, keep: usize) {
    if items.len() > keep {
        items.drain(..items.len() - keep);
    }
}
