//! Queue ordering rules and priority escalation.
//!
//! Q1 (per agent) is walked in a configurable order; Q2 (central) is
//! kept in release-priority order: highest effective priority first,
//! ties broken by earlier arrival, then lexicographic transaction id.
//! Escalation raises the *effective* priority with time in queue — the
//! stored priority on the transaction is never mutated.

use crate::model::state::SystemState;
use crate::model::transaction::TxId;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Queue1Ordering {
    /// Insertion order.
    Fifo,
    /// Priority descending, then earlier deadline, then earlier arrival,
    /// then id.
    PriorityDeadline,
}

impl Default for Queue1Ordering {
    fn default() -> Self {
        Queue1Ordering::Fifo
    }
}

/// How waiting time maps to a priority boost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "curve", rename_all = "snake_case")]
pub enum EscalationCurve {
    /// One point of boost every `ticks_per_step` ticks in queue.
    Linear { ticks_per_step: usize },
    /// `boost_per_step` points every `step_ticks` ticks in queue.
    Stepwise { step_ticks: usize, boost_per_step: u8 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorityEscalation {
    pub curve: EscalationCurve,
    /// Ceiling on the boost, not on the resulting priority.
    pub max_boost: u8,
}

impl PriorityEscalation {
    /// Boost earned after `waited` ticks in queue.
    pub fn boost(&self, waited: usize) -> u8 {
        let raw = match self.curve {
            EscalationCurve::Linear { ticks_per_step } => {
                if ticks_per_step == 0 {
                    0
                } else {
                    (waited / ticks_per_step).min(u8::MAX as usize) as u8
                }
            }
            EscalationCurve::Stepwise {
                step_ticks,
                boost_per_step,
            } => {
                if step_ticks == 0 {
                    0
                } else {
                    let steps = (waited / step_ticks).min(u8::MAX as usize) as u8;
                    steps.saturating_mul(boost_per_step)
                }
            }
        };
        raw.min(self.max_boost)
    }
}

/// Effective priority of a Q2 resident at `tick`, recomputed on demand.
pub fn effective_priority(
    priority: u8,
    entered_tick: Option<usize>,
    tick: usize,
    escalation: Option<&PriorityEscalation>,
) -> u8 {
    let boost = match (escalation, entered_tick) {
        (Some(esc), Some(entered)) => esc.boost(tick.saturating_sub(entered)),
        _ => 0,
    };
    priority.saturating_add(boost).min(10)
}

/// Sort the central queue into release order.
pub fn sort_queue2(state: &mut SystemState, tick: usize, escalation: Option<&PriorityEscalation>) {
    let mut entries: Vec<(Reverse<u8>, usize, String, TxId)> = state
        .queue2()
        .iter()
        .map(|id| {
            let tx = state.tx(*id);
            (
                Reverse(effective_priority(
                    tx.priority(),
                    tx.queue2_entered_tick(),
                    tick,
                    escalation,
                )),
                tx.arrival_tick(),
                tx.external_id().to_string(),
                *id,
            )
        })
        .collect();
    entries.sort();
    *state.queue2_mut() = entries.into_iter().map(|(_, _, _, id)| id).collect();
}

/// Order a Q1 snapshot for the policy walk.
pub fn order_queue1(
    state: &SystemState,
    queue: &[TxId],
    ordering: Queue1Ordering,
) -> Vec<TxId> {
    match ordering {
        Queue1Ordering::Fifo => queue.to_vec(),
        Queue1Ordering::PriorityDeadline => {
            let mut entries: Vec<(Reverse<u8>, usize, usize, String, TxId)> = queue
                .iter()
                .map(|id| {
                    let tx = state.tx(*id);
                    (
                        Reverse(tx.priority()),
                        tx.deadline_tick(),
                        tx.arrival_tick(),
                        tx.external_id().to_string(),
                        *id,
                    )
                })
                .collect();
            entries.sort();
            entries.into_iter().map(|(_, _, _, _, id)| id).collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::agent::Agent;
    use crate::model::event::BlockReason;
    use crate::model::transaction::Transaction;

    fn state_with(txs: Vec<Transaction>) -> (SystemState, Vec<TxId>) {
        let mut state = SystemState::new(vec![
            Agent::new("A".to_string(), 0, 0),
            Agent::new("B".to_string(), 0, 0),
        ]);
        let ids = txs
            .into_iter()
            .map(|tx| state.insert_tx(tx).unwrap())
            .collect();
        (state, ids)
    }

    fn tx(id: &str, amount: i64, priority: u8, arrival: usize, deadline: usize) -> Transaction {
        Transaction::new(
            id.to_string(),
            "A".to_string(),
            "B".to_string(),
            amount,
            arrival,
            deadline,
        )
        .with_priority(priority)
    }

    #[test]
    fn linear_boost_is_bounded() {
        let esc = PriorityEscalation {
            curve: EscalationCurve::Linear { ticks_per_step: 2 },
            max_boost: 3,
        };
        assert_eq!(esc.boost(0), 0);
        assert_eq!(esc.boost(2), 1);
        assert_eq!(esc.boost(5), 2);
        assert_eq!(esc.boost(100), 3);
    }

    #[test]
    fn stepwise_boost() {
        let esc = PriorityEscalation {
            curve: EscalationCurve::Stepwise {
                step_ticks: 5,
                boost_per_step: 2,
            },
            max_boost: 5,
        };
        assert_eq!(esc.boost(4), 0);
        assert_eq!(esc.boost(5), 2);
        assert_eq!(esc.boost(10), 4);
        assert_eq!(esc.boost(25), 5);
    }

    #[test]
    fn queue2_order_priority_then_arrival_then_id() {
        let (mut state, ids) = state_with(vec![
            tx("tx_b", 100, 5, 2, 50),
            tx("tx_a", 100, 5, 2, 50),
            tx("tx_c", 100, 8, 3, 50),
            tx("tx_d", 100, 5, 1, 50),
        ]);
        for id in &ids {
            state
                .tx_mut(*id)
                .place_in_queue2(3, BlockReason::InsufficientLiquidity);
            state.push_queue2(*id);
        }
        sort_queue2(&mut state, 3, None);
        let order: Vec<&str> = state
            .queue2()
            .iter()
            .map(|id| state.tx(*id).external_id())
            .collect();
        assert_eq!(order, vec!["tx_c", "tx_d", "tx_a", "tx_b"]);
    }

    #[test]
    fn escalation_reorders_queue2() {
        let (mut state, ids) = state_with(vec![
            tx("tx_old", 100, 2, 0, 50),
            tx("tx_new", 100, 5, 10, 50),
        ]);
        state
            .tx_mut(ids[0])
            .place_in_queue2(0, BlockReason::InsufficientLiquidity);
        state
            .tx_mut(ids[1])
            .place_in_queue2(10, BlockReason::InsufficientLiquidity);
        state.push_queue2(ids[0]);
        state.push_queue2(ids[1]);

        let esc = PriorityEscalation {
            curve: EscalationCurve::Linear { ticks_per_step: 2 },
            max_boost: 8,
        };
        // At tick 10, tx_old has waited 10 ticks: boost 5 => effective 7.
        sort_queue2(&mut state, 10, Some(&esc));
        assert_eq!(state.tx(state.queue2()[0]).external_id(), "tx_old");
        // Raw priority is untouched.
        assert_eq!(state.tx(ids[0]).priority(), 2);
    }

    #[test]
    fn queue1_priority_deadline_ordering() {
        let (state, ids) = state_with(vec![
            tx("tx_1", 100, 5, 0, 30),
            tx("tx_2", 100, 9, 0, 40),
            tx("tx_3", 100, 5, 0, 20),
        ]);
        let ordered = order_queue1(&state, &ids, Queue1Ordering::PriorityDeadline);
        let names: Vec<&str> = ordered
            .iter()
            .map(|id| state.tx(*id).external_id())
            .collect();
        assert_eq!(names, vec!["tx_2", "tx_3", "tx_1"]);

        let fifo = order_queue1(&state, &ids, Queue1Ordering::Fifo);
        assert_eq!(fifo, ids);
    }
}
