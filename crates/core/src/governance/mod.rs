pub mod budget;
pub mod injection;
pub mod rate_limit;

pub use budget::{TierBudgetTracker, TierCounts};
pub use injection::{detect, matched_families, sanitize_for_context, InjectionFamily};
pub use rate_limit::{RateDecision, ToolRateLimiter};
