//! Agent Governance Runtime - tool gating, tracing and LLM-as-judge evaluation
//!
//! This crate provides the async half of warden, the pieces an agent loop calls into:
//! - Gates every tool call on rate limits and trust-tier budgets
//! - Screens user text for prompt injection before it reaches the model
//! - Records each session into a persisted, encrypted conversation trace
//! - Grades finished conversations with a second LLM acting as judge
//! - Surfaces low-scoring or unsafe conversations to human reviewers
//!
//! # Architecture
//!
//! 1. **Guardrails** (`guardrails`) - `ToolGate` turns limiter and budget state into a
//!    `GuardrailDecision`
//! 2. **Tool boundary** (`tools`) - `ToolRegistry::invoke` runs a tool through the gate and
//!    records the outcome on the tracer
//! 3. **Tracing** (`tracer`) - `ConversationTracer` buffers a session and writes it through
//!    a per-session writer task
//! 4. **Evaluation** (`evaluator`, `pipeline`) - sampling, PII redaction, judge call and
//!    score persistence
//! 5. **Review** (`review_queue`, `calibration`) - reviewer operations and judge drift checks
//!
//! # Safety Principle
//!
//! The judge only proposes dimension scores. The overall score and the flag decision are
//! always recomputed from the rubric, and a judge failure becomes a flagged conversation,
//! never a silent pass.

pub mod calibration;
pub mod evaluator;
pub mod guardrails;
pub mod llm;
pub mod pipeline;
pub mod review_queue;
pub mod tools;
pub mod tracer;

pub use calibration::CalibrationHarness;
pub use evaluator::{ConversationEvaluator, EvaluationInput};
pub use guardrails::{GuardrailDecision, ToolGate};
pub use llm::{ChatRequest, HttpChatClient, LlmClient};
pub use pipeline::{BatchReport, EvaluationMode, EvaluationPipeline, Sampling, SubmitOutcome};
pub use review_queue::{ConversationDetail, FlaggedConversation, ReviewQueue};
pub use tools::{Tool, ToolOutput, ToolRegistry};
pub use tracer::ConversationTracer;
