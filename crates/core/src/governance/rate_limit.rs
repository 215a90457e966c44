use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use crate::config::{GovernanceConfig, ToolLimit};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateDecision {
    pub allowed: bool,
    pub reason: Option<String>,
}

impl RateDecision {
    fn allow() -> Self {
        Self { allowed: true, reason: None }
    }

    fn deny(reason: String) -> Self {
        Self { allowed: false, reason: Some(reason) }
    }
}

/// Per-session call counters. Owned by one session, so no interior locking.
#[derive(Clone, Debug)]
pub struct ToolRateLimiter {
    default_limit: ToolLimit,
    limits: BTreeMap<String, ToolLimit>,
    turn_counts: HashMap<String, u32>,
    session_counts: HashMap<String, u32>,
}

impl ToolRateLimiter {
    pub fn new(config: &GovernanceConfig) -> Self {
        Self {
            default_limit: config.default_tool_limit,
            limits: config.tool_limits.clone(),
            turn_counts: HashMap::new(),
            session_counts: HashMap::new(),
        }
    }

    pub fn limit_for(&self, tool: &str) -> ToolLimit {
        self.limits.get(tool).copied().unwrap_or(self.default_limit)
    }

    pub fn can_call(&self, tool: &str) -> RateDecision {
        let limit = self.limit_for(tool);

        let session = self.session_count(tool);
        if session >= limit.max_per_session {
            return RateDecision::deny(format!(
                "Tool '{tool}' reached its session limit of {}",
                limit.max_per_session
            ));
        }

        let turn = self.turn_count(tool);
        if turn >= limit.max_per_turn {
            return RateDecision::deny(format!(
                "Tool '{tool}' reached its per-turn limit of {}",
                limit.max_per_turn
            ));
        }

        RateDecision::allow()
    }

    /// Call only after a permitted call has executed.
    pub fn record_call(&mut self, tool: &str) {
        *self.turn_counts.entry(tool.to_string()).or_insert(0) += 1;
        *self.session_counts.entry(tool.to_string()).or_insert(0) += 1;
    }

    pub fn reset_turn(&mut self) {
        self.turn_counts.clear();
    }

    pub fn turn_count(&self, tool: &str) -> u32 {
        self.turn_counts.get(tool).copied().unwrap_or(0)
    }

    pub fn session_count(&self, tool: &str) -> u32 {
        self.session_counts.get(tool).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::ToolRateLimiter;
    use crate::config::{GovernanceConfig, ToolLimit};

    fn limiter() -> ToolRateLimiter {
        let mut config = GovernanceConfig::default();
        config
            .tool_limits
            .insert("create_booking".to_string(), ToolLimit { max_per_turn: 1, max_per_session: 2 });
        ToolRateLimiter::new(&config)
    }

    #[test]
    fn per_turn_limit_blocks_until_reset() {
        let mut limiter = limiter();
        assert!(limiter.can_call("create_booking").allowed);
        limiter.record_call("create_booking");

        let blocked = limiter.can_call("create_booking");
        assert!(!blocked.allowed);
        assert!(blocked.reason.as_deref().is_some_and(|reason| reason.contains("per-turn")));

        limiter.reset_turn();
        assert_eq!(limiter.turn_count("create_booking"), 0);
        assert_eq!(limiter.session_count("create_booking"), 1);
        assert!(limiter.can_call("create_booking").allowed);
    }

    #[test]
    fn session_limit_survives_turn_reset() {
        let mut limiter = limiter();
        limiter.record_call("create_booking");
        limiter.reset_turn();
        limiter.record_call("create_booking");
        limiter.reset_turn();

        let blocked = limiter.can_call("create_booking");
        assert!(!blocked.allowed);
        assert!(blocked.reason.as_deref().is_some_and(|reason| reason.contains("session")));
    }

    #[test]
    fn unknown_tools_use_default_limits_independently() {
        let mut limiter = limiter();
        for _ in 0..5 {
            assert!(limiter.can_call("lookup_hours").allowed);
            limiter.record_call("lookup_hours");
        }
        assert!(!limiter.can_call("lookup_hours").allowed);
        assert!(limiter.can_call("create_booking").allowed);
    }

    #[test]
    fn can_call_does_not_consume() {
        let limiter = limiter();
        for _ in 0..10 {
            assert!(limiter.can_call("create_booking").allowed);
        }
        assert_eq!(limiter.session_count("create_booking"), 0);
    }
}
