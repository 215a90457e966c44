use serde::{Deserialize, Serialize};

use crate::config::TierBudgets;
use crate::domain::trace::TrustTier;

/// Snapshot of per-tier counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierCounts {
    pub t1: u32,
    pub t2: u32,
    pub t3: u32,
}

impl TierCounts {
    pub fn get(&self, tier: TrustTier) -> u32 {
        match tier {
            TrustTier::T1 => self.t1,
            TrustTier::T2 => self.t2,
            TrustTier::T3 => self.t3,
        }
    }

    fn slot(&mut self, tier: TrustTier) -> &mut u32 {
        match tier {
            TrustTier::T1 => &mut self.t1,
            TrustTier::T2 => &mut self.t2,
            TrustTier::T3 => &mut self.t3,
        }
    }
}

impl From<TierBudgets> for TierCounts {
    fn from(budgets: TierBudgets) -> Self {
        Self { t1: budgets.t1, t2: budgets.t2, t3: budgets.t3 }
    }
}

/// Per-turn tool budgets by trust tier.
#[derive(Clone, Debug)]
pub struct TierBudgetTracker {
    budgets: TierCounts,
    remaining: TierCounts,
    used: TierCounts,
}

impl TierBudgetTracker {
    pub fn new(budgets: TierBudgets) -> Self {
        let budgets = TierCounts::from(budgets);
        Self { budgets, remaining: budgets, used: TierCounts::default() }
    }

    /// Takes one unit from `tier`. Returns `false` and leaves every counter untouched
    /// once the tier is exhausted.
    pub fn consume(&mut self, tier: TrustTier) -> bool {
        let remaining = self.remaining.slot(tier);
        if *remaining == 0 {
            return false;
        }
        *remaining -= 1;
        *self.used.slot(tier) += 1;
        true
    }

    pub fn remaining(&self) -> TierCounts {
        self.remaining
    }

    pub fn used(&self) -> TierCounts {
        self.used
    }

    pub fn reset_turn(&mut self) {
        self.remaining = self.budgets;
        self.used = TierCounts::default();
    }
}
