//! Cost accrual.
//!
//! Five categories, all integer cents, accumulated as shadow prices: cost
//! counters never debit settlement balances. Rates are exact rationals,
//! applications truncate toward zero.
//!
//! Per tick, after settlements and collateral actions:
//! - liquidity: overdraft rate (basis points) applied to credit in use
//! - delay: delay rate applied to every queued remaining amount, with the
//!   overdue multiplier for overdue residents
//! - collateral: carry rate (basis points) applied to posted collateral
//! - deadline penalty: one-shot on the first tick a transaction goes overdue
//! - split friction: one-shot per child at the tick of a split

use crate::num::{ArithmeticError, Ratio};
use serde::{Deserialize, Serialize};

/// Rate configuration, fixed at scenario validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostRates {
    /// Basis points of `credit_used`, per tick.
    pub overdraft_bps_per_tick: Ratio,

    /// Cost per cent of queued remaining value, per tick.
    pub delay_cost_per_tick_per_cent: Ratio,

    /// Basis points of posted collateral, per tick.
    pub collateral_cost_per_tick_bps: Ratio,

    /// One-shot penalty (cents) when a transaction first goes overdue.
    pub deadline_penalty: i64,

    /// One-shot cost (cents) per child created by a split.
    pub split_friction_per_child: i64,

    /// Delay-cost multiplier for overdue queue residents.
    pub overdue_delay_multiplier: Ratio,
}

impl Default for CostRates {
    fn default() -> Self {
        Self {
            overdraft_bps_per_tick: Ratio::from_int(1),
            delay_cost_per_tick_per_cent: Ratio::new(1, 10_000).expect("const"),
            collateral_cost_per_tick_bps: Ratio::new(1, 5).expect("const"),
            deadline_penalty: 50_000,
            split_friction_per_child: 1_000,
            overdue_delay_multiplier: Ratio::from_int(5),
        }
    }
}

impl CostRates {
    /// `trunc(credit_used * bps / 10_000)`.
    pub fn liquidity_cost(&self, credit_used: i64) -> Result<i64, ArithmeticError> {
        apply_bps(self.overdraft_bps_per_tick, credit_used)
    }

    /// `trunc(remaining * rate)`, multiplied first when overdue.
    pub fn delay_cost(&self, remaining: i64, overdue: bool) -> Result<i64, ArithmeticError> {
        let rate = if overdue {
            self.delay_cost_per_tick_per_cent
                .checked_mul(self.overdue_delay_multiplier)?
        } else {
            self.delay_cost_per_tick_per_cent
        };
        rate.mul_trunc(remaining)
    }

    /// `trunc(posted * bps / 10_000)`.
    pub fn collateral_cost(&self, posted: i64) -> Result<i64, ArithmeticError> {
        apply_bps(self.collateral_cost_per_tick_bps, posted)
    }
}

fn apply_bps(bps: Ratio, base: i64) -> Result<i64, ArithmeticError> {
    bps.checked_div(Ratio::from_int(10_000))?.mul_trunc(base)
}

/// Costs accrued by one agent within one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostBreakdown {
    pub liquidity: i64,
    pub delay: i64,
    pub collateral: i64,
    pub deadline_penalty: i64,
    pub split_friction: i64,
}

impl CostBreakdown {
    pub fn total(&self) -> i64 {
        self.liquidity + self.delay + self.collateral + self.deadline_penalty + self.split_friction
    }

    pub fn is_zero(&self) -> bool {
        *self == CostBreakdown::default()
    }
}

/// Lifetime cost totals for one agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostTotals {
    pub liquidity: i64,
    pub delay: i64,
    pub collateral: i64,
    pub deadline_penalty: i64,
    pub split_friction: i64,
}

impl CostTotals {
    pub fn add(&mut self, tick_costs: &CostBreakdown) {
        self.liquidity += tick_costs.liquidity;
        self.delay += tick_costs.delay;
        self.collateral += tick_costs.collateral;
        self.deadline_penalty += tick_costs.deadline_penalty;
        self.split_friction += tick_costs.split_friction;
    }

    pub fn total(&self) -> i64 {
        self.liquidity + self.delay + self.collateral + self.deadline_penalty + self.split_friction
    }
}
