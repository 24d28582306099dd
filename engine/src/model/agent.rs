//! Agent (bank) state.
//!
//! Each agent owns a settlement balance, an unsecured overdraft line,
//! posted collateral behind a haircut, daily bilateral/multilateral
//! limits, a deferred-credit accumulator, its internal queue (Q1), named
//! state registers, and accumulated cost counters.
//!
//! The credit invariant: after every settlement,
//! `credit_used <= credit_limit + floor(posted_collateral * (1 - haircut))`.
//! A would-be violation fails the settlement; nothing overdraws silently.

use crate::costs::CostTotals;
use crate::model::transaction::TxId;
use crate::num::Ratio;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AgentError {
    #[error("insufficient liquidity: required {required}, available {available}")]
    InsufficientLiquidity { required: i64, available: i64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    id: String,

    /// Settlement account balance (cents). Negative means intraday credit
    /// is in use.
    balance: i64,

    /// Unsecured overdraft cap (cents, >= 0).
    credit_limit: i64,

    /// Collateral currently posted (cents, >= 0).
    posted_collateral: i64,

    /// Discount applied to collateral when counting it toward credit
    /// capacity. In `[0, 1]`.
    collateral_haircut: Ratio,

    /// Tick of the most recent post; anchors the minimum holding period.
    collateral_posted_at_tick: Option<usize>,

    /// Optional ceiling on posted collateral.
    collateral_capacity: Option<i64>,

    /// Per-counterparty daily sending caps (configured).
    bilateral_limit_caps: BTreeMap<String, i64>,

    /// Per-counterparty remaining-today amounts.
    bilateral_remaining: BTreeMap<String, i64>,

    /// Daily cap on total gross outflow (configured).
    multilateral_limit_cap: Option<i64>,

    /// Remaining-today multilateral capacity.
    multilateral_remaining: Option<i64>,

    /// Credits received this tick under deferred crediting; applied to the
    /// balance at end of tick.
    deferred_credits: i64,

    /// Internal queue of transactions awaiting a policy release.
    queue1: Vec<TxId>,

    /// Named scratch registers the bank tree may set and any tree may read.
    state_registers: BTreeMap<String, i64>,

    /// Per-tick cap on policy releases. `None` = unlimited. Reset each tick.
    #[serde(skip)]
    release_budget: Option<i64>,

    /// Lifetime accrued costs.
    costs: CostTotals,
}

impl Agent {
    pub fn new(id: String, opening_balance: i64, credit_limit: i64) -> Self {
        assert!(credit_limit >= 0, "credit_limit must be non-negative");
        Self {
            id,
            balance: opening_balance,
            credit_limit,
            posted_collateral: 0,
            collateral_haircut: Ratio::ZERO,
            collateral_posted_at_tick: None,
            collateral_capacity: None,
            bilateral_limit_caps: BTreeMap::new(),
            bilateral_remaining: BTreeMap::new(),
            multilateral_limit_cap: None,
            multilateral_remaining: None,
            deferred_credits: 0,
            queue1: Vec::new(),
            state_registers: BTreeMap::new(),
            release_budget: None,
            costs: CostTotals::default(),
        }
    }

    pub fn with_collateral(mut self, posted: i64, haircut: Ratio) -> Self {
        assert!(posted >= 0, "posted collateral must be non-negative");
        self.posted_collateral = posted;
        self.collateral_haircut = haircut;
        self
    }

    pub fn with_collateral_capacity(mut self, capacity: i64) -> Self {
        self.collateral_capacity = Some(capacity);
        self
    }

    pub fn with_bilateral_limits(mut self, limits: BTreeMap<String, i64>) -> Self {
        self.bilateral_remaining = limits.clone();
        self.bilateral_limit_caps = limits;
        self
    }

    pub fn with_multilateral_limit(mut self, limit: i64) -> Self {
        self.multilateral_limit_cap = Some(limit);
        self.multilateral_remaining = Some(limit);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn balance(&self) -> i64 {
        self.balance
    }

    pub fn credit_limit(&self) -> i64 {
        self.credit_limit
    }

    pub fn set_credit_limit(&mut self, limit: i64) {
        assert!(limit >= 0, "credit_limit must be non-negative");
        self.credit_limit = limit;
    }

    pub fn posted_collateral(&self) -> i64 {
        self.posted_collateral
    }

    pub fn collateral_haircut(&self) -> Ratio {
        self.collateral_haircut
    }

    pub fn collateral_posted_at_tick(&self) -> Option<usize> {
        self.collateral_posted_at_tick
    }

    pub fn collateral_capacity(&self) -> Option<i64> {
        self.collateral_capacity
    }

    /// Haircut-adjusted credit capacity of the posted collateral:
    /// `floor(posted * (1 - haircut))`.
    pub fn collateral_value(&self) -> i64 {
        let h = self.collateral_haircut;
        let num = h.den() - h.num();
        let v = self.posted_collateral as i128 * num as i128 / h.den() as i128;
        v as i64
    }

    /// Total permitted overdraft: unsecured line plus collateral value.
    pub fn overdraft_cap(&self) -> i64 {
        self.credit_limit + self.collateral_value()
    }

    pub fn credit_used(&self) -> i64 {
        if self.balance < 0 {
            -self.balance
        } else {
            0
        }
    }

    pub fn is_using_credit(&self) -> bool {
        self.balance < 0
    }

    /// Positive balance plus unused overdraft headroom.
    pub fn available_liquidity(&self) -> i64 {
        let cash = self.balance.max(0);
        let headroom = (self.overdraft_cap() - self.credit_used()).max(0);
        cash + headroom
    }

    pub fn can_pay(&self, amount: i64) -> bool {
        amount <= self.available_liquidity()
    }

    /// The post-settlement safety condition.
    pub fn credit_invariant_holds(&self) -> bool {
        self.credit_used() <= self.overdraft_cap()
    }

    /// Debit with the liquidity guard. Settlement paths must use this;
    /// only netting (which nets to zero) bypasses it.
    pub fn debit(&mut self, amount: i64) -> Result<(), AgentError> {
        assert!(amount >= 0, "debit amount must be non-negative");
        if !self.can_pay(amount) {
            return Err(AgentError::InsufficientLiquidity {
                required: amount,
                available: self.available_liquidity(),
            });
        }
        self.balance -= amount;
        Ok(())
    }

    pub fn credit(&mut self, amount: i64) {
        assert!(amount >= 0, "credit amount must be non-negative");
        self.balance += amount;
    }

    /// Unchecked balance adjustment for netting legs and scenario-driven
    /// transfers; callers are responsible for the credit invariant.
    pub fn adjust_balance(&mut self, delta: i64) {
        self.balance += delta;
    }

    pub fn add_deferred_credit(&mut self, amount: i64) {
        assert!(amount >= 0, "deferred credit must be non-negative");
        self.deferred_credits += amount;
    }

    pub fn deferred_credits(&self) -> i64 {
        self.deferred_credits
    }

    /// Drain the accumulator (end-of-tick application).
    pub fn take_deferred_credits(&mut self) -> i64 {
        std::mem::take(&mut self.deferred_credits)
    }

    // ------------------------------------------------------------------
    // Collateral
    // ------------------------------------------------------------------

    /// Raise posted collateral and restart the holding clock.
    pub fn post_collateral(&mut self, amount: i64, tick: usize) {
        assert!(amount > 0, "collateral post must be positive");
        self.posted_collateral += amount;
        self.collateral_posted_at_tick = Some(tick);
    }

    /// Lower posted collateral. Holding-period and hysteresis gates are
    /// the collateral manager's concern, not this accessor's.
    pub fn withdraw_collateral(&mut self, amount: i64) {
        assert!(amount > 0 && amount <= self.posted_collateral);
        self.posted_collateral -= amount;
        if self.posted_collateral == 0 {
            self.collateral_posted_at_tick = None;
        }
    }

    /// Unconditional scenario-event adjustment (positive or negative
    /// delta, clamped at zero).
    pub fn adjust_collateral(&mut self, delta: i64, tick: usize) -> i64 {
        let before = self.posted_collateral;
        self.posted_collateral = (self.posted_collateral + delta).max(0);
        if delta > 0 {
            self.collateral_posted_at_tick = Some(tick);
        } else if self.posted_collateral == 0 {
            self.collateral_posted_at_tick = None;
        }
        self.posted_collateral - before
    }

    // ------------------------------------------------------------------
    // Daily limits
    // ------------------------------------------------------------------

    /// Remaining bilateral capacity toward `counterparty`. `None` means
    /// unlimited.
    pub fn bilateral_remaining_to(&self, counterparty: &str) -> Option<i64> {
        if self.bilateral_limit_caps.is_empty() {
            return None;
        }
        self.bilateral_remaining.get(counterparty).copied()
    }

    pub fn multilateral_remaining(&self) -> Option<i64> {
        self.multilateral_remaining
    }

    /// Consume limit capacity after a gross settlement.
    pub fn consume_limits(&mut self, counterparty: &str, amount: i64) {
        if let Some(rem) = self.bilateral_remaining.get_mut(counterparty) {
            *rem -= amount;
        }
        if let Some(rem) = self.multilateral_remaining.as_mut() {
            *rem -= amount;
        }
    }

    /// Restore daily limit accumulators to their configured caps.
    pub fn reset_daily_limits(&mut self) {
        self.bilateral_remaining = self.bilateral_limit_caps.clone();
        self.multilateral_remaining = self.multilateral_limit_cap;
    }

    // ------------------------------------------------------------------
    // Queue 1
    // ------------------------------------------------------------------

    pub fn queue1(&self) -> &[TxId] {
        &self.queue1
    }

    pub fn queue1_len(&self) -> usize {
        self.queue1.len()
    }

    pub fn enqueue1(&mut self, tx: TxId) {
        self.queue1.push(tx);
    }

    pub fn remove_from_queue1(&mut self, tx: TxId) {
        self.queue1.retain(|t| *t != tx);
    }

    /// Replace Q1 contents (used when re-ordering for a policy walk).
    pub fn set_queue1(&mut self, queue: Vec<TxId>) {
        self.queue1 = queue;
    }

    // ------------------------------------------------------------------
    // Registers and budgets
    // ------------------------------------------------------------------

    pub fn register(&self, name: &str) -> i64 {
        self.state_registers.get(name).copied().unwrap_or(0)
    }

    pub fn set_register(&mut self, name: &str, value: i64) {
        self.state_registers.insert(name.to_string(), value);
    }

    pub fn state_registers(&self) -> &BTreeMap<String, i64> {
        &self.state_registers
    }

    pub fn release_budget(&self) -> Option<i64> {
        self.release_budget
    }

    pub fn set_release_budget(&mut self, budget: Option<i64>) {
        self.release_budget = budget;
    }

    /// Try to consume one unit of release budget. True if a release is
    /// allowed (including the unlimited case).
    pub fn consume_release_budget(&mut self) -> bool {
        match self.release_budget.as_mut() {
            None => true,
            Some(b) if *b > 0 => {
                *b -= 1;
                true
            }
            Some(_) => false,
        }
    }

    // ------------------------------------------------------------------
    // Costs
    // ------------------------------------------------------------------

    pub fn costs(&self) -> &CostTotals {
        &self.costs
    }

    pub fn costs_mut(&mut self) -> &mut CostTotals {
        &mut self.costs
    }
}
