use std::sync::Arc;

use warden_agent::{CalibrationHarness, ConversationEvaluator, HttpChatClient};
use warden_core::calibration::DEFAULT_MIN_PASS_RATE;
use warden_core::config::JudgeConfigHandle;

use crate::commands::{build_runtime, load_config, CommandResult};

/// Replays the golden set against the configured judge.
///
/// Exits 7 when the pass rate falls below `min_pass_rate`.
pub fn run(min_pass_rate: Option<f64>) -> CommandResult {
    let min_pass_rate = min_pass_rate.unwrap_or(DEFAULT_MIN_PASS_RATE);
    if !min_pass_rate.is_finite() || !(0.0..=1.0).contains(&min_pass_rate) {
        return CommandResult::failure(
            "calibrate",
            "invalid_argument",
            "--min-pass-rate must be within 0.0..=1.0",
            8,
        );
    }

    let config = match load_config("calibrate") {
        Ok(config) => config,
        Err(failure) => return failure,
    };
    let runtime = match build_runtime("calibrate") {
        Ok(runtime) => runtime,
        Err(failure) => return failure,
    };

    let judge = JudgeConfigHandle::new(config.judge.clone());
    let evaluator =
        ConversationEvaluator::new(Arc::new(HttpChatClient::new(judge.clone())), judge);
    let report =
        runtime.block_on(async { CalibrationHarness::new(&evaluator).run_builtin().await });

    let message = format!(
        "{}/{} golden conversations within expectations (pass rate {:.2}, required {:.2})",
        report.passed, report.total, report.pass_rate, min_pass_rate
    );
    if report.meets(min_pass_rate) {
        CommandResult::success_with_data("calibrate", message, &report)
    } else {
        CommandResult::failure_with_data(
            "calibrate",
            "calibration_below_threshold",
            message,
            7,
            &report,
        )
    }
}
