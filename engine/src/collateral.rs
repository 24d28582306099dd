//! Collateral manager.
//!
//! Policy-driven posts and withdrawals pass through two gates:
//!
//! - hysteresis: posting requires `liquidity_gap / pending_outflows`
//!   above the posting threshold; withdrawal requires
//!   `excess_liquidity / pending_outflows` above the withdrawal
//!   threshold. Comparisons are exact (cross-multiplied rationals).
//! - holding period: withdrawal is permitted only once
//!   `current_tick - collateral_posted_at_tick >= min_holding_ticks`.
//!   Withdrawal at exactly the boundary succeeds.
//!
//! A refused action is a normal outcome, not an error: the caller emits
//! no event for it (an implied hold). Scenario-event collateral
//! adjustments bypass both gates.

use crate::model::agent::Agent;
use crate::scenario::CollateralSettings;

/// Result of a policy-driven collateral action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollateralOutcome {
    Posted {
        amount: i64,
        total_posted: i64,
        /// Change in available liquidity.
        headroom_delta: i64,
    },
    Withdrawn {
        amount: i64,
        total_posted: i64,
        headroom_delta: i64,
        ticks_held: usize,
    },
    /// Gate refused the action; no event is emitted.
    Refused { why: RefusalReason },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefusalReason {
    /// Hysteresis gate not met.
    BelowThreshold,
    /// Holding period not yet satisfied.
    HoldingPeriod,
    /// Nothing to act on (zero amount, no collateral posted, capacity
    /// exhausted).
    Nothing,
}

/// Largest withdrawal that keeps drawn credit backed: after removal,
/// `floor(posted * (1 - haircut))` must still cover
/// `credit_used - credit_limit`.
fn max_unencumbered(agent: &Agent) -> i64 {
    let needed_value = (agent.credit_used() - agent.credit_limit()).max(0);
    if needed_value == 0 {
        return agent.posted_collateral();
    }
    let haircut = agent.collateral_haircut();
    let keep_num = haircut.den() - haircut.num();
    if keep_num == 0 {
        // A 100% haircut means the collateral backs nothing.
        return agent.posted_collateral();
    }
    let min_posted = ((needed_value as i128 * haircut.den() as i128 + keep_num as i128 - 1)
        / keep_num as i128) as i64;
    (agent.posted_collateral() - min_posted).max(0)
}

/// `gap / pending > threshold`, evaluated without division.
fn exceeds_threshold(numerator: i64, pending: i64, threshold: crate::num::Ratio) -> bool {
    if pending <= 0 {
        // No pending outflows: a gap cannot exist, an excess always does.
        return numerator > 0;
    }
    (numerator as i128) * (threshold.den() as i128)
        > (threshold.num() as i128) * (pending as i128)
}

/// Policy-driven post, gated by hysteresis and clamped to capacity.
pub fn try_post(
    agent: &mut Agent,
    amount: i64,
    pending_outflows: i64,
    tick: usize,
    settings: &CollateralSettings,
) -> CollateralOutcome {
    if amount <= 0 {
        return CollateralOutcome::Refused {
            why: RefusalReason::Nothing,
        };
    }
    let amount = match agent.collateral_capacity() {
        Some(cap) => amount.min(cap - agent.posted_collateral()),
        None => amount,
    };
    if amount <= 0 {
        return CollateralOutcome::Refused {
            why: RefusalReason::Nothing,
        };
    }

    let liquidity_gap = (pending_outflows - agent.available_liquidity()).max(0);
    if !exceeds_threshold(liquidity_gap, pending_outflows, settings.posting_threshold_pct) {
        return CollateralOutcome::Refused {
            why: RefusalReason::BelowThreshold,
        };
    }

    let before = agent.available_liquidity();
    agent.post_collateral(amount, tick);
    CollateralOutcome::Posted {
        amount,
        total_posted: agent.posted_collateral(),
        headroom_delta: agent.available_liquidity() - before,
    }
}

/// Policy-driven withdrawal, gated by holding period then hysteresis,
/// clamped to the posted amount.
pub fn try_withdraw(
    agent: &mut Agent,
    amount: i64,
    pending_outflows: i64,
    tick: usize,
    settings: &CollateralSettings,
) -> CollateralOutcome {
    if amount <= 0 || agent.posted_collateral() == 0 {
        return CollateralOutcome::Refused {
            why: RefusalReason::Nothing,
        };
    }
    let posted_at = match agent.collateral_posted_at_tick() {
        Some(t) => t,
        None => {
            return CollateralOutcome::Refused {
                why: RefusalReason::Nothing,
            }
        }
    };
    let ticks_held = tick.saturating_sub(posted_at);
    if ticks_held < settings.min_holding_ticks {
        return CollateralOutcome::Refused {
            why: RefusalReason::HoldingPeriod,
        };
    }

    let excess = (agent.available_liquidity() - pending_outflows).max(0);
    if !exceeds_threshold(excess, pending_outflows, settings.withdrawal_threshold_pct) {
        return CollateralOutcome::Refused {
            why: RefusalReason::BelowThreshold,
        };
    }

    // Credit currently drawn against the collateral stays backed: clamp
    // the withdrawal so the post-withdrawal cap still covers credit_used.
    let amount = amount
        .min(agent.posted_collateral())
        .min(max_unencumbered(agent));
    if amount <= 0 {
        return CollateralOutcome::Refused {
            why: RefusalReason::Nothing,
        };
    }
    let before = agent.available_liquidity();
    agent.withdraw_collateral(amount);
    CollateralOutcome::Withdrawn {
        amount,
        total_posted: agent.posted_collateral(),
        headroom_delta: agent.available_liquidity() - before,
        ticks_held,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::num::Ratio;

    fn settings() -> CollateralSettings {
        CollateralSettings {
            min_holding_ticks: 5,
            posting_threshold_pct: Ratio::new(1, 10).unwrap(),
            withdrawal_threshold_pct: Ratio::new(1, 5).unwrap(),
        }
    }

    fn agent(balance: i64) -> Agent {
        Agent::new("A".to_string(), balance, 0)
    }

    #[test]
    fn post_requires_a_real_gap() {
        let mut a = agent(100_000);
        // Pending 50k, available 100k: no gap, refuse.
        let out = try_post(&mut a, 10_000, 50_000, 0, &settings());
        assert_eq!(
            out,
            CollateralOutcome::Refused {
                why: RefusalReason::BelowThreshold
            }
        );

        // Pending 200k, available 100k: gap 100k / 200k = 0.5 > 0.1.
        let out = try_post(&mut a, 10_000, 200_000, 3, &settings());
        match out {
            CollateralOutcome::Posted {
                amount,
                total_posted,
                headroom_delta,
            } => {
                assert_eq!(amount, 10_000);
                assert_eq!(total_posted, 10_000);
                assert_eq!(headroom_delta, 10_000); // zero haircut
            }
            other => panic!("expected post, got {:?}", other),
        }
        assert_eq!(a.collateral_posted_at_tick(), Some(3));
    }

    #[test]
    fn post_clamps_to_capacity() {
        let mut a = agent(0).with_collateral_capacity(5_000);
        let out = try_post(&mut a, 10_000, 100_000, 0, &settings());
        match out {
            CollateralOutcome::Posted { amount, .. } => assert_eq!(amount, 5_000),
            other => panic!("expected post, got {:?}", other),
        }
        // Capacity exhausted now.
        let out = try_post(&mut a, 1, 100_000, 1, &settings());
        assert_eq!(
            out,
            CollateralOutcome::Refused {
                why: RefusalReason::Nothing
            }
        );
    }

    #[test]
    fn withdrawal_respects_holding_period_boundary() {
        let mut a = agent(1_000_000);
        a.post_collateral(50_000, 10);
        // Before the boundary: refused, no event.
        for tick in 11..15 {
            let out = try_withdraw(&mut a, 50_000, 0, tick, &settings());
            assert_eq!(
                out,
                CollateralOutcome::Refused {
                    why: RefusalReason::HoldingPeriod
                }
            );
        }
        // At exactly posted_at + min_holding_ticks: succeeds.
        let out = try_withdraw(&mut a, 50_000, 0, 15, &settings());
        match out {
            CollateralOutcome::Withdrawn {
                amount, ticks_held, ..
            } => {
                assert_eq!(amount, 50_000);
                assert_eq!(ticks_held, 5);
            }
            other => panic!("expected withdrawal, got {:?}", other),
        }
    }

    #[test]
    fn withdrawal_needs_excess_liquidity() {
        let mut a = agent(100_000);
        a.post_collateral(50_000, 0);
        // Pending 400k dwarfs available 150k: no excess.
        let out = try_withdraw(&mut a, 10_000, 400_000, 10, &settings());
        assert_eq!(
            out,
            CollateralOutcome::Refused {
                why: RefusalReason::BelowThreshold
            }
        );
        // Pending 100k, available 150k: excess 50k / 100k = 0.5 > 0.2.
        let out = try_withdraw(&mut a, 10_000, 100_000, 10, &settings());
        assert!(matches!(out, CollateralOutcome::Withdrawn { .. }));
    }

    #[test]
    fn withdrawal_keeps_drawn_credit_backed() {
        // balance -25_000 with credit_limit 20_000: 5_000 of the draw is
        // collateral-backed and must stay covered.
        let mut a = Agent::new("A".to_string(), -25_000, 20_000);
        a.post_collateral(20_000, 0);
        assert!(a.credit_invariant_holds());
        let out = try_withdraw(&mut a, 20_000, 0, 10, &settings());
        match out {
            CollateralOutcome::Withdrawn { amount, .. } => assert_eq!(amount, 15_000),
            other => panic!("expected clamped withdrawal, got {:?}", other),
        }
        assert!(a.credit_invariant_holds());
        assert_eq!(a.posted_collateral(), 5_000);
    }

    #[test]
    fn withdrawal_clamps_to_posted() {
        let mut a = agent(1_000_000);
        a.post_collateral(20_000, 0);
        let out = try_withdraw(&mut a, 99_999, 0, 10, &settings());
        match out {
            CollateralOutcome::Withdrawn { amount, total_posted, .. } => {
                assert_eq!(amount, 20_000);
                assert_eq!(total_posted, 0);
            }
            other => panic!("expected withdrawal, got {:?}", other),
        }
    }
}
