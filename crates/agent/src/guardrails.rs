use tracing::{info, warn};

use warden_core::config::GovernanceConfig;
use warden_core::domain::trace::TrustTier;
use warden_core::governance::{
    detect, matched_families, sanitize_for_context, InjectionFamily, TierBudgetTracker, TierCounts,
    ToolRateLimiter,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GuardrailDecision {
    Allow,
    Deny { reason_code: &'static str, user_message: String, fallback_path: &'static str },
    Degrade { reason_code: &'static str, user_message: String, fallback_path: &'static str },
}

impl GuardrailDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }

    pub fn reason_code(&self) -> Option<&'static str> {
        match self {
            Self::Allow => None,
            Self::Deny { reason_code, .. } | Self::Degrade { reason_code, .. } => Some(reason_code),
        }
    }
}

/// User text after screening, ready to be placed into the agent context.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScreenedText {
    pub text: String,
    pub families: Vec<InjectionFamily>,
    pub decision: GuardrailDecision,
}

impl ScreenedText {
    /// Flag reason suitable for the conversation trace, if anything matched.
    pub fn flag_reason(&self) -> Option<String> {
        if self.families.is_empty() {
            return None;
        }
        let names = self.families.iter().map(InjectionFamily::as_str).collect::<Vec<_>>();
        Some(format!("Prompt injection suspected: {}", names.join(", ")))
    }
}

/// Per-session tool governance: rate limits, tier budgets and injection screening.
///
/// Owned by a single session; the agent loop calls [`ToolGate::begin_turn`] on every new
/// user message and [`ToolGate::authorize`] before every tool call.
#[derive(Clone, Debug)]
pub struct ToolGate {
    limiter: ToolRateLimiter,
    budget: TierBudgetTracker,
    sanitize_max_length: usize,
}

impl ToolGate {
    pub fn new(config: &GovernanceConfig) -> Self {
        Self {
            limiter: ToolRateLimiter::new(config),
            budget: TierBudgetTracker::new(config.tier_budgets),
            sanitize_max_length: config.sanitize_max_length,
        }
    }

    /// Resets per-turn counters and budgets. Session counters persist.
    pub fn begin_turn(&mut self) {
        self.limiter.reset_turn();
        self.budget.reset_turn();
    }

    pub fn screen_user_text(&self, text: &str) -> ScreenedText {
        if !detect(text) {
            return ScreenedText {
                text: sanitize_for_context(text, self.sanitize_max_length),
                families: Vec::new(),
                decision: GuardrailDecision::Allow,
            };
        }

        let families = matched_families(text);
        warn!(
            event_name = "governance.injection.detected",
            families = ?families.iter().map(InjectionFamily::as_str).collect::<Vec<_>>(),
            "user text matched injection patterns; sanitizing before use"
        );
        ScreenedText {
            text: sanitize_for_context(text, self.sanitize_max_length),
            families,
            decision: GuardrailDecision::Degrade {
                reason_code: "prompt_injection_suspected",
                user_message: "Part of that message looked like instructions to the assistant \
                               and was ignored."
                    .to_string(),
                fallback_path: "sanitized_context",
            },
        }
    }

    /// Checks the rate limiter, then consumes one unit of the tier budget.
    ///
    /// Nothing is consumed when the call is denied. A permitted call must be followed by
    /// [`ToolGate::record_execution`] once it has run.
    pub fn authorize(&mut self, tool: &str, tier: TrustTier) -> GuardrailDecision {
        let rate = self.limiter.can_call(tool);
        if !rate.allowed {
            let reason = rate.reason.unwrap_or_else(|| "rate limit reached".to_string());
            info!(
                event_name = "governance.tool.rate_limited",
                tool,
                tier = tier.as_str(),
                reason = %reason,
                "tool call denied by rate limiter"
            );
            return GuardrailDecision::Deny {
                reason_code: "tool_rate_limited",
                user_message: reason,
                fallback_path: "retry_next_turn",
            };
        }

        if !self.budget.consume(tier) {
            info!(
                event_name = "governance.tool.budget_exhausted",
                tool,
                tier = tier.as_str(),
                "tool call denied by tier budget"
            );
            return GuardrailDecision::Deny {
                reason_code: "tier_budget_exhausted",
                user_message: format!(
                    "The per-turn budget for {} actions is used up. Confirm with the user \
                     before continuing.",
                    tier.as_str()
                ),
                fallback_path: "confirm_with_user",
            };
        }

        GuardrailDecision::Allow
    }

    pub fn record_execution(&mut self, tool: &str) {
        self.limiter.record_call(tool);
    }

    pub fn remaining_budget(&self) -> TierCounts {
        self.budget.remaining()
    }

    pub fn used_budget(&self) -> TierCounts {
        self.budget.used()
    }

    pub fn session_calls(&self, tool: &str) -> u32 {
        self.limiter.session_count(tool)
    }
}
