use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite};
use tracing::warn;
use uuid::Uuid;

use warden_core::domain::evaluation::{
    Dimension, DimensionScore, EvaluationOutcome, EvaluationResult,
};
use warden_core::domain::review::{
    FlaggedOrder, FlaggedQuery, QueueStats, ReviewAction, ReviewActionKind, ReviewRecord,
    ReviewStatus, ReviewSubmission,
};
use warden_core::domain::tenant::TenantId;
use warden_core::domain::trace::{
    AgentType, Message, SessionId, ToolCall, Trace, TraceId, TraceMetrics,
};

use super::{RepositoryError, TraceRepository};
use crate::crypto::FieldCipher;
use crate::DbPool;

const TRACE_COLUMNS: &str = "id, tenant_id, session_id, agent_type, messages, tool_calls,
    turn_count, input_tokens, output_tokens, estimated_cost, total_latency_ms, max_latency_ms,
    assistant_responses, tool_call_count, error_count, cache_hit, task_completed, flagged,
    flag_reason, review_status, eval_score, eval_confidence, eval_summary, eval_breakdown,
    eval_outcome, eval_flagged, eval_flag_reason, evaluated_at, reviewed_by, reviewed_at,
    review_notes, corrected_score, started_at, updated_at";

/// SQLite trace store. Message and tool-call payloads are encrypted on write and
/// decrypted on read; rows that fail to decrypt are treated as absent.
pub struct SqlTraceRepository {
    pool: DbPool,
    cipher: Arc<FieldCipher>,
}

impl SqlTraceRepository {
    pub fn new(pool: DbPool, cipher: FieldCipher) -> Self {
        Self { pool, cipher: Arc::new(cipher) }
    }

    fn trace_from_row(&self, row: &SqliteRow) -> Result<Trace, RepositoryError> {
        let messages_raw = self.cipher.decrypt(&row.try_get::<String, _>("messages")?)?;
        let tool_calls_raw = self.cipher.decrypt(&row.try_get::<String, _>("tool_calls")?)?;
        let messages: Vec<Message> = serde_json::from_str(&messages_raw)?;
        let tool_calls: Vec<ToolCall> = serde_json::from_str(&tool_calls_raw)?;

        let tenant_raw = row.try_get::<String, _>("tenant_id")?;
        let tenant_id = TenantId::parse(&tenant_raw)
            .map_err(|error| RepositoryError::Decode(format!("invalid tenant_id: {error}")))?;

        let agent_raw = row.try_get::<String, _>("agent_type")?;
        let agent_type = AgentType::parse(&agent_raw)
            .ok_or_else(|| RepositoryError::Decode(format!("unknown agent_type `{agent_raw}`")))?;

        let review_status = row
            .try_get::<Option<String>, _>("review_status")?
            .map(|value| {
                ReviewStatus::parse(&value).ok_or_else(|| {
                    RepositoryError::Decode(format!("unknown review_status `{value}`"))
                })
            })
            .transpose()?;

        let estimated_cost_raw = row.try_get::<String, _>("estimated_cost")?;
        let estimated_cost = Decimal::from_str(&estimated_cost_raw).map_err(|error| {
            RepositoryError::Decode(format!("invalid estimated_cost `{estimated_cost_raw}`: {error}"))
        })?;

        let metrics = TraceMetrics {
            turn_count: parse_u32("turn_count", row.try_get("turn_count")?)?,
            input_tokens: parse_u64("input_tokens", row.try_get("input_tokens")?)?,
            output_tokens: parse_u64("output_tokens", row.try_get("output_tokens")?)?,
            estimated_cost,
            total_latency_ms: parse_u64("total_latency_ms", row.try_get("total_latency_ms")?)?,
            max_latency_ms: parse_u64("max_latency_ms", row.try_get("max_latency_ms")?)?,
            assistant_responses: parse_u32(
                "assistant_responses",
                row.try_get("assistant_responses")?,
            )?,
            tool_call_count: parse_u32("tool_call_count", row.try_get("tool_call_count")?)?,
            error_count: parse_u32("error_count", row.try_get("error_count")?)?,
            cache_hit: row.try_get::<i64, _>("cache_hit")? != 0,
        };

        let review = match row.try_get::<Option<String>, _>("reviewed_by")? {
            Some(reviewed_by) => Some(ReviewRecord {
                reviewed_by,
                reviewed_at: parse_timestamp("reviewed_at", row.try_get("reviewed_at")?)?,
                notes: row.try_get("review_notes")?,
                corrected_score: row.try_get("corrected_score")?,
            }),
            None => None,
        };

        let evaluation = evaluation_from_row(row)?;
        let outcome = row.try_get::<Option<String>, _>("eval_outcome")?;
        let evaluation_failed_at = match (&evaluation, outcome.as_deref()) {
            (None, Some("failed")) => {
                parse_optional_timestamp("evaluated_at", row.try_get("evaluated_at")?)?
            }
            _ => None,
        };

        Ok(Trace {
            id: TraceId(row.try_get("id")?),
            tenant_id,
            session_id: SessionId(row.try_get("session_id")?),
            agent_type,
            messages,
            tool_calls,
            metrics,
            task_completed: row.try_get::<Option<i64>, _>("task_completed")?.map(|value| value != 0),
            flagged: row.try_get::<i64, _>("flagged")? != 0,
            flag_reason: row.try_get("flag_reason")?,
            review_status,
            evaluation,
            evaluation_failed_at,
            review,
            started_at: parse_timestamp("started_at", row.try_get("started_at")?)?,
            updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
        })
    }
}

#[async_trait::async_trait]
impl TraceRepository for SqlTraceRepository {
    async fn save(&self, trace: &Trace) -> Result<(), RepositoryError> {
        let messages = self.cipher.encrypt(&serde_json::to_string(&trace.messages)?)?;
        let tool_calls = self.cipher.encrypt(&serde_json::to_string(&trace.tool_calls)?)?;
        let metrics = &trace.metrics;

        let result = sqlx::query(
            "INSERT INTO conversation_trace (
                id,
                tenant_id,
                session_id,
                agent_type,
                messages,
                tool_calls,
                turn_count,
                input_tokens,
                output_tokens,
                estimated_cost,
                total_latency_ms,
                max_latency_ms,
                assistant_responses,
                tool_call_count,
                error_count,
                cache_hit,
                task_completed,
                flagged,
                flag_reason,
                review_status,
                started_at,
                updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                messages = excluded.messages,
                tool_calls = excluded.tool_calls,
                turn_count = excluded.turn_count,
                input_tokens = excluded.input_tokens,
                output_tokens = excluded.output_tokens,
                estimated_cost = excluded.estimated_cost,
                total_latency_ms = excluded.total_latency_ms,
                max_latency_ms = excluded.max_latency_ms,
                assistant_responses = excluded.assistant_responses,
                tool_call_count = excluded.tool_call_count,
                error_count = excluded.error_count,
                cache_hit = excluded.cache_hit,
                task_completed = excluded.task_completed,
                flagged = MAX(conversation_trace.flagged, excluded.flagged),
                flag_reason = CASE
                    WHEN excluded.flag_reason IS NULL OR excluded.flag_reason = ''
                        THEN conversation_trace.flag_reason
                    WHEN conversation_trace.flag_reason IS NULL OR conversation_trace.flag_reason = ''
                        THEN excluded.flag_reason
                    WHEN instr(excluded.flag_reason, conversation_trace.flag_reason) = 1
                        THEN excluded.flag_reason
                    WHEN instr(conversation_trace.flag_reason, excluded.flag_reason) > 0
                        THEN conversation_trace.flag_reason
                    ELSE conversation_trace.flag_reason || '; ' || excluded.flag_reason
                END,
                review_status = COALESCE(conversation_trace.review_status, excluded.review_status),
                updated_at = excluded.updated_at
             WHERE conversation_trace.tenant_id = excluded.tenant_id",
        )
        .bind(&trace.id.0)
        .bind(trace.tenant_id.as_str())
        .bind(&trace.session_id.0)
        .bind(trace.agent_type.as_str())
        .bind(messages)
        .bind(tool_calls)
        .bind(i64::from(metrics.turn_count))
        .bind(to_i64(metrics.input_tokens))
        .bind(to_i64(metrics.output_tokens))
        .bind(metrics.estimated_cost.to_string())
        .bind(to_i64(metrics.total_latency_ms))
        .bind(to_i64(metrics.max_latency_ms))
        .bind(i64::from(metrics.assistant_responses))
        .bind(i64::from(metrics.tool_call_count))
        .bind(i64::from(metrics.error_count))
        .bind(i64::from(metrics.cache_hit))
        .bind(trace.task_completed.map(i64::from))
        .bind(i64::from(trace.flagged))
        .bind(trace.flag_reason.as_deref())
        .bind(trace.review_status.as_ref().map(ReviewStatus::as_str))
        .bind(encode_timestamp(trace.started_at))
        .bind(encode_timestamp(trace.updated_at))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn find_for_tenant(
        &self,
        tenant_id: &TenantId,
        id: &TraceId,
    ) -> Result<Option<Trace>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {TRACE_COLUMNS} FROM conversation_trace WHERE tenant_id = ? AND id = ?"
        ))
        .bind(tenant_id.as_str())
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        match self.trace_from_row(&row) {
            Ok(trace) => Ok(Some(trace)),
            Err(RepositoryError::Cipher(error)) => {
                warn!(
                    event_name = "storage.trace.decrypt_failed",
                    tenant_id = %tenant_id,
                    trace_id = %id,
                    error = %error,
                    "trace payload could not be decrypted"
                );
                Ok(None)
            }
            Err(error) => Err(error),
        }
    }

    async fn list_unevaluated(
        &self,
        tenant_id: &TenantId,
        started_before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<TraceId>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id
             FROM conversation_trace
             WHERE tenant_id = ? AND evaluated_at IS NULL AND started_at < ?
             ORDER BY started_at ASC
             LIMIT ?",
        )
        .bind(tenant_id.as_str())
        .bind(encode_timestamp(started_before))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| Ok(TraceId(row.try_get::<String, _>("id")?)))
            .collect()
    }

    async fn record_evaluation(
        &self,
        tenant_id: &TenantId,
        id: &TraceId,
        evaluation: &EvaluationResult,
    ) -> Result<bool, RepositoryError> {
        let breakdown = serde_json::to_string(&evaluation.dimensions)?;
        let evaluated_at = encode_timestamp(evaluation.evaluated_at);

        let result = sqlx::query(
            "UPDATE conversation_trace SET
                eval_score = ?1,
                eval_confidence = ?2,
                eval_summary = ?3,
                eval_breakdown = ?4,
                eval_outcome = ?5,
                eval_flagged = ?6,
                eval_flag_reason = ?7,
                evaluated_at = ?8,
                review_status = CASE
                    WHEN (flagged = 1 OR ?6 = 1) AND review_status IS NULL THEN 'pending'
                    ELSE review_status
                END,
                flagged = CASE WHEN flagged = 1 OR ?6 = 1 THEN 1 ELSE 0 END,
                flag_reason = CASE
                    WHEN ?7 IS NULL OR ?7 = '' THEN flag_reason
                    WHEN flag_reason IS NULL OR flag_reason = '' THEN ?7
                    WHEN instr(flag_reason, ?7) > 0 THEN flag_reason
                    ELSE flag_reason || '; ' || ?7
                END,
                updated_at = ?8
             WHERE tenant_id = ?9 AND id = ?10 AND evaluated_at IS NULL",
        )
        .bind(evaluation.overall_score)
        .bind(evaluation.overall_confidence)
        .bind(&evaluation.summary)
        .bind(breakdown)
        .bind(outcome_as_str(evaluation.outcome))
        .bind(i64::from(evaluation.flagged))
        .bind(evaluation.flag_reason.as_deref())
        .bind(evaluated_at)
        .bind(tenant_id.as_str())
        .bind(&id.0)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_evaluation_failed(
        &self,
        tenant_id: &TenantId,
        id: &TraceId,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query(
            "UPDATE conversation_trace SET
                flagged = 1,
                flag_reason = CASE
                    WHEN flag_reason IS NULL OR flag_reason = '' THEN ?1
                    WHEN instr(flag_reason, ?1) > 0 THEN flag_reason
                    ELSE flag_reason || '; ' || ?1
                END,
                review_status = COALESCE(review_status, 'pending'),
                eval_outcome = 'failed',
                evaluated_at = ?2,
                updated_at = ?2
             WHERE tenant_id = ?3 AND id = ?4 AND evaluated_at IS NULL",
        )
        .bind(reason)
        .bind(encode_timestamp(at))
        .bind(tenant_id.as_str())
        .bind(&id.0)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_flagged(
        &self,
        tenant_id: &TenantId,
        query: &FlaggedQuery,
    ) -> Result<Vec<Trace>, RepositoryError> {
        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {TRACE_COLUMNS} FROM conversation_trace WHERE tenant_id = "
        ));
        qb.push_bind(tenant_id.as_str());
        qb.push(" AND flagged = 1");

        if let Some(agent_type) = query.agent_type {
            qb.push(" AND agent_type = ");
            qb.push_bind(agent_type.as_str());
        }
        if let Some(max_score) = query.max_score {
            qb.push(" AND eval_score IS NOT NULL AND eval_score <= ");
            qb.push_bind(max_score);
        }
        if let Some(status) = query.review_status {
            qb.push(" AND review_status = ");
            qb.push_bind(status.as_str());
        }

        qb.push(match query.order {
            FlaggedOrder::WorstScore => {
                " ORDER BY eval_score IS NULL ASC, eval_score ASC, started_at DESC"
            }
            FlaggedOrder::MostRecent => " ORDER BY started_at DESC",
            FlaggedOrder::Oldest => " ORDER BY started_at ASC",
        });
        qb.push(" LIMIT ");
        qb.push_bind(i64::from(query.effective_limit()));

        let rows = qb.build().fetch_all(&self.pool).await?;

        let mut traces = Vec::with_capacity(rows.len());
        for row in rows {
            match self.trace_from_row(&row) {
                Ok(trace) => traces.push(trace),
                Err(RepositoryError::Cipher(error)) => {
                    let trace_id = row.try_get::<String, _>("id").unwrap_or_default();
                    warn!(
                        event_name = "storage.trace.decrypt_failed",
                        tenant_id = %tenant_id,
                        trace_id = %trace_id,
                        error = %error,
                        "skipping undecryptable trace in flagged listing"
                    );
                }
                Err(error) => return Err(error),
            }
        }
        Ok(traces)
    }

    async fn apply_review(
        &self,
        tenant_id: &TenantId,
        id: &TraceId,
        submission: &ReviewSubmission,
        reviewed_at: DateTime<Utc>,
    ) -> Result<Option<ReviewAction>, RepositoryError> {
        let reviewed_at_raw = encode_timestamp(reviewed_at);
        let reviewed_by = submission.reviewed_by.trim();
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            "UPDATE conversation_trace SET
                review_status = ?,
                reviewed_by = ?,
                reviewed_at = ?,
                review_notes = ?,
                corrected_score = COALESCE(?, corrected_score),
                updated_at = ?
             WHERE tenant_id = ? AND id = ?",
        )
        .bind(submission.action.resulting_status().as_str())
        .bind(reviewed_by)
        .bind(&reviewed_at_raw)
        .bind(submission.notes.as_deref())
        .bind(submission.corrected_score)
        .bind(&reviewed_at_raw)
        .bind(tenant_id.as_str())
        .bind(&id.0)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(RepositoryError::NotFound);
        }

        let action = if submission.action == ReviewActionKind::None {
            None
        } else {
            let action = ReviewAction {
                id: Uuid::new_v4().to_string(),
                tenant_id: tenant_id.clone(),
                trace_id: id.clone(),
                action: submission.action,
                notes: submission.notes.clone(),
                corrected_score: submission.corrected_score,
                performed_by: reviewed_by.to_string(),
                created_at: reviewed_at,
            };

            sqlx::query(
                "INSERT INTO review_action (
                    id,
                    tenant_id,
                    trace_id,
                    action,
                    notes,
                    corrected_score,
                    performed_by,
                    created_at
                 ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&action.id)
            .bind(action.tenant_id.as_str())
            .bind(&action.trace_id.0)
            .bind(action.action.as_str())
            .bind(action.notes.as_deref())
            .bind(action.corrected_score)
            .bind(&action.performed_by)
            .bind(&reviewed_at_raw)
            .execute(&mut *tx)
            .await?;

            Some(action)
        };

        tx.commit().await?;
        Ok(action)
    }

    async fn queue_stats(
        &self,
        tenant_id: &TenantId,
        day_start: DateTime<Utc>,
    ) -> Result<QueueStats, RepositoryError> {
        let row = sqlx::query(
            "SELECT
                COALESCE(SUM(CASE WHEN review_status = 'pending' THEN 1 ELSE 0 END), 0)
                    AS pending_count,
                COALESCE(SUM(CASE WHEN reviewed_at >= ? THEN 1 ELSE 0 END), 0)
                    AS reviewed_today,
                AVG(CASE WHEN flagged = 1 THEN eval_score END) AS average_flagged_score
             FROM conversation_trace
             WHERE tenant_id = ?",
        )
        .bind(encode_timestamp(day_start))
        .bind(tenant_id.as_str())
        .fetch_one(&self.pool)
        .await?;

        let mut stats = QueueStats {
            pending_count: parse_u64("pending_count", row.try_get("pending_count")?)?,
            reviewed_today: parse_u64("reviewed_today", row.try_get("reviewed_today")?)?,
            average_flagged_score: row.try_get("average_flagged_score")?,
            flag_breakdown: BTreeMap::new(),
        };

        let reasons = sqlx::query(
            "SELECT flag_reason
             FROM conversation_trace
             WHERE tenant_id = ? AND flagged = 1 AND review_status = 'pending'
                AND flag_reason IS NOT NULL",
        )
        .bind(tenant_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        for row in reasons {
            let reason = row.try_get::<String, _>("flag_reason")?;
            stats.count_reason(&reason);
        }

        Ok(stats)
    }

    async fn list_review_actions(
        &self,
        tenant_id: &TenantId,
        id: &TraceId,
    ) -> Result<Vec<ReviewAction>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT
                id,
                tenant_id,
                trace_id,
                action,
                notes,
                corrected_score,
                performed_by,
                created_at
             FROM review_action
             WHERE tenant_id = ? AND trace_id = ?
             ORDER BY created_at ASC, id ASC",
        )
        .bind(tenant_id.as_str())
        .bind(&id.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(review_action_from_row).collect()
    }
}

fn evaluation_from_row(row: &SqliteRow) -> Result<Option<EvaluationResult>, RepositoryError> {
    let Some(overall_score) = row.try_get::<Option<f64>, _>("eval_score")? else {
        return Ok(None);
    };

    let dimensions: BTreeMap<Dimension, DimensionScore> =
        match row.try_get::<Option<String>, _>("eval_breakdown")? {
            Some(raw) => serde_json::from_str(&raw)?,
            None => BTreeMap::new(),
        };

    let outcome_raw = row.try_get::<Option<String>, _>("eval_outcome")?;
    let outcome = match outcome_raw.as_deref() {
        Some("structured") | None => EvaluationOutcome::Structured,
        Some("salvaged") => EvaluationOutcome::Salvaged,
        Some("failed") => EvaluationOutcome::Failed,
        Some(other) => {
            return Err(RepositoryError::Decode(format!("unknown eval_outcome `{other}`")))
        }
    };

    let evaluated_at = parse_optional_timestamp("evaluated_at", row.try_get("evaluated_at")?)?
        .ok_or_else(|| RepositoryError::Decode("eval_score without evaluated_at".to_string()))?;

    Ok(Some(EvaluationResult {
        dimensions,
        overall_score,
        overall_confidence: row.try_get::<Option<f64>, _>("eval_confidence")?.unwrap_or(0.0),
        summary: row.try_get::<Option<String>, _>("eval_summary")?.unwrap_or_default(),
        flagged: row.try_get::<Option<i64>, _>("eval_flagged")?.unwrap_or(0) != 0,
        flag_reason: row.try_get("eval_flag_reason")?,
        outcome,
        evaluated_at,
    }))
}

fn review_action_from_row(row: SqliteRow) -> Result<ReviewAction, RepositoryError> {
    let action_raw = row.try_get::<String, _>("action")?;
    let action = ReviewActionKind::parse(&action_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown review action `{action_raw}`")))?;
    let tenant_raw = row.try_get::<String, _>("tenant_id")?;
    let tenant_id = TenantId::parse(&tenant_raw)
        .map_err(|error| RepositoryError::Decode(format!("invalid tenant_id: {error}")))?;

    Ok(ReviewAction {
        id: row.try_get("id")?,
        tenant_id,
        trace_id: TraceId(row.try_get("trace_id")?),
        action,
        notes: row.try_get("notes")?,
        corrected_score: row.try_get("corrected_score")?,
        performed_by: row.try_get("performed_by")?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
    })
}

fn outcome_as_str(outcome: EvaluationOutcome) -> &'static str {
    match outcome {
        EvaluationOutcome::Structured => "structured",
        EvaluationOutcome::Salvaged => "salvaged",
        EvaluationOutcome::Failed => "failed",
    }
}

/// Fixed precision keeps lexical order equal to chronological order.
pub(crate) fn encode_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn parse_u32(column: &str, value: i64) -> Result<u32, RepositoryError> {
    u32::try_from(value).map_err(|_| {
        RepositoryError::Decode(format!(
            "invalid value for `{column}` (expected non-negative u32): {value}"
        ))
    })
}

fn parse_u64(column: &str, value: i64) -> Result<u64, RepositoryError> {
    u64::try_from(value).map_err(|_| {
        RepositoryError::Decode(format!(
            "invalid value for `{column}` (expected non-negative integer): {value}"
        ))
    })
}

fn parse_timestamp(column: &str, value: String) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(&value).map(|timestamp| timestamp.with_timezone(&Utc)).map_err(
        |error| {
            RepositoryError::Decode(format!("invalid timestamp in `{column}`: `{value}` ({error})"))
        },
    )
}

fn parse_optional_timestamp(
    column: &str,
    value: Option<String>,
) -> Result<Option<DateTime<Utc>>, RepositoryError> {
    value.map(|timestamp| parse_timestamp(column, timestamp)).transpose()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::{DateTime, Duration, Utc};
    use rust_decimal::Decimal;
    use sqlx::Row;

    use warden_core::domain::evaluation::{
        Dimension, DimensionScore, EvaluationOutcome, EvaluationResult,
    };
    use warden_core::domain::review::{
        FlaggedQuery, ReviewActionKind, ReviewStatus, ReviewSubmission,
    };
    use warden_core::domain::tenant::TenantId;
    use warden_core::domain::trace::{
        AgentType, Message, MessageRole, SessionId, Trace, TraceId,
    };

    use super::SqlTraceRepository;
    use crate::crypto::FieldCipher;
    use crate::repositories::{RepositoryError, TraceRepository};
    use crate::{connect_with_settings, migrations, DbPool};

    const KEY: &str = "0123456789abcdef0123456789abcdef";

    async fn setup_pool() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        pool
    }

    fn repo(pool: &DbPool) -> SqlTraceRepository {
        SqlTraceRepository::new(pool.clone(), FieldCipher::from_secret(KEY).expect("cipher"))
    }

    fn tenant(raw: &str) -> TenantId {
        TenantId::parse(raw).expect("tenant")
    }

    fn sample_trace(tenant_id: &TenantId, id: &str, started_at: DateTime<Utc>) -> Trace {
        let mut trace = Trace::new(
            TraceId(id.to_string()),
            tenant_id.clone(),
            SessionId(format!("session-{id}")),
            AgentType::Customer,
            started_at,
        );
        trace.messages.push(Message {
            role: MessageRole::User,
            content: "book a trim for friday".to_string(),
            timestamp: started_at,
            latency_ms: None,
            token_count: 6,
        });
        trace.metrics.turn_count = 1;
        trace.metrics.input_tokens = 6;
        trace.metrics.estimated_cost = Decimal::new(18, 6);
        trace
    }

    fn evaluation(score: f64, flagged: bool) -> EvaluationResult {
        let dimensions = Dimension::ALL
            .into_iter()
            .map(|dimension| {
                (dimension, DimensionScore { score, reasoning: "ok".to_string(), confidence: 0.8 })
            })
            .collect::<BTreeMap<_, _>>();
        EvaluationResult {
            dimensions,
            overall_score: score,
            overall_confidence: 0.8,
            summary: "summary".to_string(),
            flagged,
            flag_reason: flagged.then(|| format!("Low effectiveness score: {score}")),
            outcome: EvaluationOutcome::Structured,
            evaluated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn save_then_find_round_trips_and_encrypts_payloads() {
        let pool = setup_pool().await;
        let repo = repo(&pool);
        let tenant_a = tenant("tenant-a");
        let trace = sample_trace(&tenant_a, "T-1", Utc::now());

        repo.save(&trace).await.expect("save");
        let found = repo.find_for_tenant(&tenant_a, &trace.id).await.expect("find");
        let found = found.expect("trace present");
        assert_eq!(found.messages, trace.messages);
        assert_eq!(found.metrics.estimated_cost, trace.metrics.estimated_cost);

        let raw = sqlx::query("SELECT messages FROM conversation_trace WHERE id = 'T-1'")
            .fetch_one(&pool)
            .await
            .expect("raw row")
            .get::<String, _>("messages");
        assert!(raw.starts_with("enc:v1:"));
        assert!(!raw.contains("friday"));
    }

    #[tokio::test]
    async fn foreign_tenant_sees_nothing_and_cannot_overwrite() {
        let pool = setup_pool().await;
        let repo = repo(&pool);
        let tenant_a = tenant("tenant-a");
        let tenant_b = tenant("tenant-b");
        let trace = sample_trace(&tenant_a, "T-1", Utc::now());
        repo.save(&trace).await.expect("save");

        assert!(repo.find_for_tenant(&tenant_b, &trace.id).await.expect("find").is_none());

        let hijack = sample_trace(&tenant_b, "T-1", Utc::now());
        assert!(matches!(repo.save(&hijack).await, Err(RepositoryError::NotFound)));

        let submission = ReviewSubmission {
            reviewed_by: "mallory".to_string(),
            notes: None,
            corrected_score: None,
            action: ReviewActionKind::Approve,
        };
        let result = repo.apply_review(&tenant_b, &trace.id, &submission, Utc::now()).await;
        assert!(matches!(result, Err(RepositoryError::NotFound)));
        assert!(repo.list_review_actions(&tenant_a, &trace.id).await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn undecryptable_rows_read_as_absent() {
        let pool = setup_pool().await;
        let tenant_a = tenant("tenant-a");
        let trace = sample_trace(&tenant_a, "T-1", Utc::now());
        repo(&pool).save(&trace).await.expect("save");

        let other_key = SqlTraceRepository::new(
            pool.clone(),
            FieldCipher::from_secret("a-different-key-a-different-key!").expect("cipher"),
        );
        assert!(other_key.find_for_tenant(&tenant_a, &trace.id).await.expect("find").is_none());
    }

    #[tokio::test]
    async fn legacy_plaintext_rows_are_readable() {
        let pool = setup_pool().await;
        let tenant_a = tenant("tenant-a");
        let trace = sample_trace(&tenant_a, "T-1", Utc::now());
        repo(&pool).save(&trace).await.expect("save");

        let plaintext = serde_json::to_string(&trace.messages).expect("json");
        sqlx::query("UPDATE conversation_trace SET messages = ?, tool_calls = '[]' WHERE id = 'T-1'")
            .bind(plaintext)
            .execute(&pool)
            .await
            .expect("downgrade row");

        let found = repo(&pool).find_for_tenant(&tenant_a, &trace.id).await.expect("find");
        assert_eq!(found.map(|trace| trace.messages), Some(trace.messages));
    }

    #[tokio::test]
    async fn unevaluated_listing_respects_tenant_and_grace_window() {
        let pool = setup_pool().await;
        let repo = repo(&pool);
        let tenant_a = tenant("tenant-a");
        let tenant_b = tenant("tenant-b");
        let now = Utc::now();

        repo.save(&sample_trace(&tenant_a, "A-old", now - Duration::minutes(30))).await.expect("save");
        repo.save(&sample_trace(&tenant_a, "A-fresh", now - Duration::minutes(1))).await.expect("save");
        repo.save(&sample_trace(&tenant_b, "B-old", now - Duration::minutes(30))).await.expect("save");

        let ids = repo
            .list_unevaluated(&tenant_a, now - Duration::minutes(5), 10)
            .await
            .expect("list");
        assert_eq!(ids, vec![TraceId("A-old".to_string())]);
    }

    #[tokio::test]
    async fn evaluation_ors_flags_and_opens_pending_review_once() {
        let pool = setup_pool().await;
        let repo = repo(&pool);
        let tenant_a = tenant("tenant-a");
        let mut trace = sample_trace(&tenant_a, "T-1", Utc::now());
        trace.flagged = true;
        trace.flag_reason = Some("Conversation exceeded 8 turns".to_string());
        repo.save(&trace).await.expect("save");

        let written = repo
            .record_evaluation(&tenant_a, &trace.id, &evaluation(9.0, false))
            .await
            .expect("record");
        assert!(written);

        let again = repo
            .record_evaluation(&tenant_a, &trace.id, &evaluation(2.0, true))
            .await
            .expect("record twice");
        assert!(!again, "second evaluation must not overwrite the first");

        let found = repo.find_for_tenant(&tenant_a, &trace.id).await.expect("find").expect("some");
        assert!(found.flagged, "existing flag must survive a clean evaluation");
        assert_eq!(found.review_status, Some(ReviewStatus::Pending));
        assert_eq!(found.eval_score(), Some(9.0));
        assert_eq!(found.flag_reason.as_deref(), Some("Conversation exceeded 8 turns"));
    }

    #[tokio::test]
    async fn failed_evaluation_reads_back_as_attempted_without_scores() {
        let pool = setup_pool().await;
        let repo = repo(&pool);
        let tenant_a = tenant("tenant-a");
        let trace = sample_trace(&tenant_a, "T-1", Utc::now() - Duration::minutes(30));
        repo.save(&trace).await.expect("save");

        let marked = repo
            .mark_evaluation_failed(&tenant_a, &trace.id, "judge unavailable", Utc::now())
            .await
            .expect("mark failed");
        assert!(marked);

        let found = repo.find_for_tenant(&tenant_a, &trace.id).await.expect("find").expect("some");
        assert!(found.evaluation.is_none());
        assert!(found.evaluation_failed_at.is_some());
        assert!(found.is_evaluated());
        assert!(found.flagged);

        let written = repo
            .record_evaluation(&tenant_a, &trace.id, &evaluation(9.0, false))
            .await
            .expect("record");
        assert!(!written);
        assert!(repo.list_unevaluated(&tenant_a, Utc::now(), 10).await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn review_updates_status_and_appends_audit_trail() {
        let pool = setup_pool().await;
        let repo = repo(&pool);
        let tenant_a = tenant("tenant-a");
        let trace = sample_trace(&tenant_a, "T-1", Utc::now());
        repo.save(&trace).await.expect("save");
        repo.record_evaluation(&tenant_a, &trace.id, &evaluation(3.0, true))
            .await
            .expect("record");

        let flagged = repo.list_flagged(&tenant_a, &FlaggedQuery::default()).await.expect("list");
        assert_eq!(flagged.len(), 1);

        let note_only = ReviewSubmission {
            reviewed_by: "ops".to_string(),
            notes: Some("seen".to_string()),
            corrected_score: None,
            action: ReviewActionKind::None,
        };
        let appended =
            repo.apply_review(&tenant_a, &trace.id, &note_only, Utc::now()).await.expect("review");
        assert!(appended.is_none());

        let escalate = ReviewSubmission {
            reviewed_by: "ops".to_string(),
            notes: Some("prompt needs work".to_string()),
            corrected_score: Some(4.5),
            action: ReviewActionKind::PromptUpdated,
        };
        let appended =
            repo.apply_review(&tenant_a, &trace.id, &escalate, Utc::now()).await.expect("review");
        assert!(appended.is_some());

        let found = repo.find_for_tenant(&tenant_a, &trace.id).await.expect("find").expect("some");
        assert_eq!(found.review_status, Some(ReviewStatus::Actioned));
        assert_eq!(found.review.and_then(|review| review.corrected_score), Some(4.5));

        let actions = repo.list_review_actions(&tenant_a, &trace.id).await.expect("actions");
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].action, ReviewActionKind::PromptUpdated);

        let stats = repo
            .queue_stats(&tenant_a, Utc::now() - Duration::hours(1))
            .await
            .expect("stats");
        assert_eq!(stats.pending_count, 0);
        assert_eq!(stats.reviewed_today, 1);
        assert_eq!(stats.average_flagged_score, Some(3.0));
    }
}
