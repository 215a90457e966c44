use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use warden_core::domain::evaluation::EvaluationResult;
use warden_core::domain::review::{FlaggedQuery, QueueStats, ReviewAction, ReviewSubmission};
use warden_core::domain::tenant::TenantId;
use warden_core::domain::trace::{Trace, TraceId};
use warden_core::errors::ApplicationError;

use crate::crypto::CipherError;

pub mod memory;
pub mod trace;

pub use memory::InMemoryTraceRepository;
pub use trace::SqlTraceRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("cipher error: {0}")]
    Cipher(#[from] CipherError),
    /// Absent, or owned by another tenant. The two are never distinguished.
    #[error("not found")]
    NotFound,
}

impl From<RepositoryError> for ApplicationError {
    fn from(value: RepositoryError) -> Self {
        match value {
            RepositoryError::NotFound => ApplicationError::NotFound,
            other => ApplicationError::Persistence(other.to_string()),
        }
    }
}

/// Tenant-scoped storage for conversation traces and their review trail.
///
/// Every method takes the tenant explicitly and applies it in the storage predicate.
#[async_trait]
pub trait TraceRepository: Send + Sync {
    /// Creates the trace on first call and updates the tracer-owned fields thereafter.
    /// Never moves a trace between tenants.
    async fn save(&self, trace: &Trace) -> Result<(), RepositoryError>;

    /// `None` when absent, foreign or undecryptable.
    async fn find_for_tenant(
        &self,
        tenant_id: &TenantId,
        id: &TraceId,
    ) -> Result<Option<Trace>, RepositoryError>;

    /// Ids without an evaluation attempt that started before `started_before`, oldest first.
    async fn list_unevaluated(
        &self,
        tenant_id: &TenantId,
        started_before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<TraceId>, RepositoryError>;

    /// Writes the result once. Flags are OR-ed with any existing flag and a flagged
    /// result opens a pending review. Returns `false` if the trace was not found or
    /// already evaluated.
    async fn record_evaluation(
        &self,
        tenant_id: &TenantId,
        id: &TraceId,
        evaluation: &EvaluationResult,
    ) -> Result<bool, RepositoryError>;

    async fn mark_evaluation_failed(
        &self,
        tenant_id: &TenantId,
        id: &TraceId,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError>;

    async fn list_flagged(
        &self,
        tenant_id: &TenantId,
        query: &FlaggedQuery,
    ) -> Result<Vec<Trace>, RepositoryError>;

    /// Ownership check and mutation in one statement; the audit row is written in the
    /// same transaction. Returns the appended action, if any.
    async fn apply_review(
        &self,
        tenant_id: &TenantId,
        id: &TraceId,
        submission: &ReviewSubmission,
        reviewed_at: DateTime<Utc>,
    ) -> Result<Option<ReviewAction>, RepositoryError>;

    async fn queue_stats(
        &self,
        tenant_id: &TenantId,
        day_start: DateTime<Utc>,
    ) -> Result<QueueStats, RepositoryError>;

    async fn list_review_actions(
        &self,
        tenant_id: &TenantId,
        id: &TraceId,
    ) -> Result<Vec<ReviewAction>, RepositoryError>;
}
