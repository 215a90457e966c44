use std::sync::Arc;

use warden_agent::{ConversationEvaluator, EvaluationPipeline, HttpChatClient, Sampling};
use warden_core::config::JudgeConfigHandle;

use crate::commands::{build_runtime, load_config, open_repository, parse_tenant, CommandResult};

/// Evaluates up to `limit` finished, unevaluated traces for one tenant.
///
/// With `evaluate_all` every trace is graded instead of the configured sample.
pub fn run(tenant: &str, limit: u32, evaluate_all: bool) -> CommandResult {
    let tenant_id = match parse_tenant("evaluate", tenant) {
        Ok(tenant_id) => tenant_id,
        Err(failure) => return failure,
    };
    let config = match load_config("evaluate") {
        Ok(config) => config,
        Err(failure) => return failure,
    };
    let runtime = match build_runtime("evaluate") {
        Ok(runtime) => runtime,
        Err(failure) => return failure,
    };

    let sampling = if evaluate_all { Sampling::Always } else { Sampling::Configured };
    let result = runtime.block_on(async {
        let repository = Arc::new(open_repository(&config).await?);
        let judge = JudgeConfigHandle::new(config.judge.clone());
        let evaluator =
            ConversationEvaluator::new(Arc::new(HttpChatClient::new(judge.clone())), judge);
        let pipeline = EvaluationPipeline::new(repository, evaluator, config.evaluation.clone());

        pipeline
            .evaluate_pending(&tenant_id, limit.max(1), sampling)
            .await
            .map_err(|error| ("storage", error.to_string(), 6u8))
    });

    match result {
        Ok(report) => CommandResult::success_with_data(
            "evaluate",
            format!(
                "evaluated {} of {} traces for tenant `{tenant_id}` ({} flagged)",
                report.evaluated,
                report.total(),
                report.flagged
            ),
            &report,
        ),
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("evaluate", error_class, message, exit_code)
        }
    }
}
