use tracing::{info, warn};

use warden_core::calibration::{
    golden_conversations, validate_calibration, CalibrationReport, GoldenConversation,
};

use crate::evaluator::{ConversationEvaluator, EvaluationInput};

/// Replays golden conversations through the evaluator to catch judge drift.
pub struct CalibrationHarness<'a> {
    evaluator: &'a ConversationEvaluator,
}

impl<'a> CalibrationHarness<'a> {
    pub fn new(evaluator: &'a ConversationEvaluator) -> Self {
        Self { evaluator }
    }

    pub async fn run_builtin(&self) -> CalibrationReport {
        self.run(&golden_conversations()).await
    }

    pub async fn run(&self, golden: &[GoldenConversation]) -> CalibrationReport {
        let mut checks = Vec::with_capacity(golden.len());
        for conversation in golden {
            let input = EvaluationInput {
                tenant_id: None,
                trace_id: None,
                agent_type: conversation.agent_type,
                messages: conversation.messages.clone(),
                tool_calls: conversation.tool_calls.clone(),
                task_completed: conversation.task_completed,
            };
            let result = self.evaluator.evaluate(&input).await;
            let check = validate_calibration(conversation, &result);
            if check.passed {
                info!(
                    event_name = "calibration.check.passed",
                    golden = %check.name,
                    overall_score = result.overall_score,
                    "golden conversation within expectations"
                );
            } else {
                warn!(
                    event_name = "calibration.check.failed",
                    golden = %check.name,
                    mismatches = ?check.mismatches,
                    "golden conversation outside expectations"
                );
            }
            checks.push(check);
        }

        CalibrationReport::from_checks(checks)
    }
}
