//! Q2 liquidity-release cascade.
//!
//! Whenever an agent's available liquidity increases (settlement inflow,
//! collateral post, deferred-credit application, queue-entry offset) that
//! agent's queued outgoing transactions are re-attempted in release order
//! until the first failure. Each settlement may in turn wake the
//! receiver, so triggers are processed as a worklist; total settlements
//! per cascade are bounded and anything left is reconsidered next tick.

use crate::engine::TickError;
use crate::model::event::{Event, ReleaseReason};
use crate::model::state::SystemState;
use crate::model::transaction::TxId;
use crate::queues::{effective_priority, PriorityEscalation};
use crate::settlement::rtgs;
use std::cmp::Reverse;
use std::collections::VecDeque;
use tracing::trace;

/// Default bound on settlements per cascade invocation.
pub const MAX_CASCADE_SETTLEMENTS: usize = 10_000;

#[derive(Debug, Clone, Copy)]
pub struct CascadeConfig<'a> {
    pub escalation: Option<&'a PriorityEscalation>,
    pub deferred_crediting: bool,
    pub max_settlements: usize,
}

/// An agent's Q2 entries in release order: effective priority desc,
/// arrival asc, id lex.
pub fn release_order(
    state: &SystemState,
    sender_id: &str,
    tick: usize,
    escalation: Option<&PriorityEscalation>,
) -> Vec<TxId> {
    let mut entries: Vec<(Reverse<u8>, usize, String, TxId)> = state
        .queue2_for_sender(sender_id)
        .into_iter()
        .map(|id| {
            let tx = state.tx(id);
            (
                Reverse(effective_priority(
                    tx.priority(),
                    tx.queue2_entered_tick(),
                    tick,
                    escalation,
                )),
                tx.arrival_tick(),
                tx.external_id().to_string(),
                id,
            )
        })
        .collect();
    entries.sort();
    entries.into_iter().map(|(_, _, _, id)| id).collect()
}

/// Drain the trigger worklist, settling what liquidity now allows.
///
/// Events are appended in settlement order. Returns the number of
/// settlements made.
pub fn run_cascade(
    state: &mut SystemState,
    triggers: Vec<(String, ReleaseReason)>,
    tick: usize,
    cfg: &CascadeConfig,
    events: &mut Vec<Event>,
) -> Result<usize, TickError> {
    let mut worklist: VecDeque<(String, ReleaseReason)> = triggers.into();
    let mut settled = 0usize;

    while let Some((agent_id, reason)) = worklist.pop_front() {
        if settled >= cfg.max_settlements {
            trace!(agent = %agent_id, "cascade bound reached, deferring to next tick");
            break;
        }
        let ordered = release_order(state, &agent_id, tick, cfg.escalation);
        for tx_id in ordered {
            if settled >= cfg.max_settlements {
                break;
            }
            if state.tx(tx_id).is_fully_settled() {
                state.remove_from_queue2(tx_id);
                continue;
            }
            match rtgs::admission_check(state, tx_id)? {
                Some(_) => break, // release order: stop at the first failure
                None => {
                    let result = rtgs::settle_gross(state, tx_id, tick, cfg.deferred_crediting)?;
                    state.remove_from_queue2(tx_id);
                    settled += 1;

                    let tx = state.tx(tx_id);
                    let wait = tick.saturating_sub(tx.arrival_tick());
                    events.push(Event::Queue2LiquidityRelease {
                        tick,
                        tx_id: tx.external_id().to_string(),
                        sender_id: tx.sender_id().to_string(),
                        receiver_id: tx.receiver_id().to_string(),
                        amount: result.amount,
                        queue_wait_ticks: wait,
                        release_reason: reason,
                    });
                    if let Some(since) = tx.overdue_since_tick() {
                        events.push(Event::OverdueTransactionSettled {
                            tick,
                            tx_id: tx.external_id().to_string(),
                            agent_id: tx.sender_id().to_string(),
                            ticks_overdue: tick.saturating_sub(since),
                        });
                    }

                    if !cfg.deferred_crediting {
                        let receiver = state.tx(tx_id).receiver_id().to_string();
                        worklist.push_back((receiver, ReleaseReason::IncomingPayment));
                    }
                }
            }
        }
    }

    Ok(settled)
}
