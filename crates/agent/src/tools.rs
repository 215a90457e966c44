use std::collections::HashMap;
use std::time::Instant;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use tracing::warn;

use warden_core::domain::trace::{
    ExecutionState, ProposalStatus, ToolCall, ToolPayload, TrustTier,
};

use crate::guardrails::{GuardrailDecision, ToolGate};
use crate::tracer::ConversationTracer;

/// What a business tool hands back to the governance layer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ToolOutput {
    pub payload: ToolPayload,
    /// Set when the tool staged an action that still needs user confirmation.
    pub proposal_id: Option<String>,
}

impl ToolOutput {
    pub fn executed(payload: ToolPayload) -> Self {
        Self { payload, proposal_id: None }
    }

    pub fn proposed(payload: ToolPayload, proposal_id: impl Into<String>) -> Self {
        Self { payload, proposal_id: Some(proposal_id.into()) }
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;
    fn tier(&self) -> TrustTier;
    async fn execute(&self, input: ToolPayload) -> Result<ToolOutput>;
}

#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn register<T>(&mut self, tool: T)
    where
        T: Tool + 'static,
    {
        self.tools.insert(tool.name().to_string(), Box::new(tool));
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn tier_of(&self, name: &str) -> Option<TrustTier> {
        self.tools.get(name).map(|tool| tool.tier())
    }

    /// Runs one tool call through the gate and records the outcome on the tracer.
    ///
    /// Denied and failed calls are recorded too. Unknown tools are denied as T3.
    pub async fn invoke(
        &self,
        gate: &mut ToolGate,
        tracer: &mut ConversationTracer,
        name: &str,
        input: ToolPayload,
    ) -> ToolCall {
        let started = Instant::now();

        let Some(tool) = self.tools.get(name) else {
            let call = denied_call(name, TrustTier::T3, input, "unknown tool".to_string());
            tracer.record_tool_call(call.clone());
            return call;
        };

        let tier = tool.tier();
        let decision = gate.authorize(name, tier);
        if let GuardrailDecision::Deny { user_message, .. }
        | GuardrailDecision::Degrade { user_message, .. } = decision
        {
            let call = denied_call(name, tier, input, user_message);
            tracer.record_tool_call(call.clone());
            return call;
        }

        let result = tool.execute(input.clone()).await;
        gate.record_execution(name);
        let latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let call = match result {
            Ok(output) => {
                let (execution_state, proposal_status) = match output.proposal_id {
                    Some(_) => (ExecutionState::Proposed, Some(ProposalStatus::Pending)),
                    None => (ExecutionState::Executed, None),
                };
                ToolCall {
                    name: name.to_string(),
                    input,
                    output: output.payload,
                    latency_ms,
                    tier,
                    success: true,
                    error: None,
                    execution_state,
                    proposal_id: output.proposal_id,
                    proposal_status,
                    timestamp: Utc::now(),
                }
            }
            Err(error) => {
                warn!(
                    event_name = "governance.tool.failed",
                    tool = name,
                    tier = tier.as_str(),
                    error = %error,
                    "tool execution failed"
                );
                ToolCall {
                    name: name.to_string(),
                    input,
                    output: ToolPayload::empty(),
                    latency_ms,
                    tier,
                    success: false,
                    error: Some(error.to_string()),
                    execution_state: ExecutionState::Failed,
                    proposal_id: None,
                    proposal_status: None,
                    timestamp: Utc::now(),
                }
            }
        };

        tracer.record_tool_call(call.clone());
        call
    }
}

fn denied_call(name: &str, tier: TrustTier, input: ToolPayload, reason: String) -> ToolCall {
    ToolCall {
        name: name.to_string(),
        input,
        output: ToolPayload::empty(),
        latency_ms: 0,
        tier,
        success: false,
        error: Some(reason),
        execution_state: ExecutionState::Denied,
        proposal_id: None,
        proposal_status: None,
        timestamp: Utc::now(),
    }
}
