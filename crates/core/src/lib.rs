pub mod calibration;
pub mod config;
pub mod cost;
pub mod domain;
pub mod errors;
pub mod governance;
pub mod pii;
pub mod rubric;

pub use calibration::{
    golden_conversations, validate_calibration, CalibrationCheck, CalibrationReport,
    GoldenConversation,
};
pub use domain::evaluation::{Dimension, DimensionScore, EvaluationOutcome, EvaluationResult};
pub use domain::review::{
    QueueStats, ReviewAction, ReviewActionKind, ReviewRecord, ReviewStatus, ReviewSubmission,
};
pub use domain::tenant::TenantId;
pub use domain::trace::{
    AgentType, Message, MessageRole, SessionId, ToolCall, ToolPayload, Trace, TraceId,
    TraceMetrics, TrustTier,
};
pub use errors::{ApplicationError, DomainError, InterfaceError};
pub use governance::{RateDecision, TierBudgetTracker, ToolRateLimiter};
