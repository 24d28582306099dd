//! Liquidity-saving mechanisms.
//!
//! Both phases operate only on Q2 and settle by *offsetting*: obligations
//! cancel against each other, so the book entries net to zero per agent
//! and no liquidity is consumed. Residual amounts stay queued.
//!
//! # Bilateral offsetting
//!
//! For every unordered agent pair with flow in both directions, opposing
//! transactions are matched greedily in release order and offset
//! `min(remaining, remaining)` at a time. One `LsmBilateralOffset` event
//! is emitted per offset operation. Pairs are processed by offsettable
//! value (descending), ties by agent-pair id.
//!
//! # Multilateral cycles
//!
//! Agents are nodes, queued transactions are edges (one representative
//! edge per directed pair: the head of that pair's release order). Simple
//! directed cycles of length 3..=max are enumerated Johnson-style with
//! nodes in lexicographic order, so enumeration is deterministic. A cycle
//! settles by offsetting the cycle minimum along every edge; acceptance
//! requires that no participant would be overdrawn (trivially true for
//! pure cycles, checked anyway). Cycle preference: higher offset value,
//! then shorter length, then lexicographically smaller agent list, then
//! earlier minimum arrival tick, then transaction-id list.

use crate::engine::TickError;
use crate::model::event::Event;
use crate::model::state::SystemState;
use crate::model::transaction::TxId;
use crate::queues::PriorityEscalation;
use crate::scenario::LsmConfig;
use crate::settlement::release::release_order;
use std::collections::BTreeMap;
use tracing::debug;

/// Offset one matched pair of opposing transactions.
///
/// Both legs reduce by `off`; the balance entries cancel exactly, so no
/// balances are touched. Fully settled legs are recorded in `to_remove`.
fn apply_offset(
    state: &mut SystemState,
    tx_ab: TxId,
    tx_ba: TxId,
    off: i64,
    tick: usize,
    to_remove: &mut Vec<TxId>,
    events: &mut Vec<Event>,
) -> Result<(), TickError> {
    let (a, b, amount_ab, amount_ba, id_ab, id_ba) = {
        let fwd = state.tx(tx_ab);
        let rev = state.tx(tx_ba);
        (
            fwd.sender_id().to_string(),
            rev.sender_id().to_string(),
            fwd.remaining_amount(),
            rev.remaining_amount(),
            fwd.external_id().to_string(),
            rev.external_id().to_string(),
        )
    };

    state.tx_mut(tx_ab).settle_offset(off, tick)?;
    state.tx_mut(tx_ba).settle_offset(off, tick)?;

    events.push(Event::LsmBilateralOffset {
        tick,
        agent_a: a,
        agent_b: b,
        tx_id_a_to_b: id_ab,
        tx_id_b_to_a: id_ba,
        amount_a_to_b: amount_ab,
        amount_b_to_a: amount_ba,
        net_settled: off,
    });

    for leg in [tx_ab, tx_ba] {
        let tx = state.tx(leg);
        if tx.is_fully_settled() {
            if let Some(since) = tx.overdue_since_tick() {
                events.push(Event::OverdueTransactionSettled {
                    tick,
                    tx_id: tx.external_id().to_string(),
                    agent_id: tx.sender_id().to_string(),
                    ticks_overdue: tick.saturating_sub(since),
                });
            }
            to_remove.push(leg);
        }
    }
    Ok(())
}

/// Offset two release-ordered transaction lists against each other until
/// one side is exhausted.
fn offset_lists(
    state: &mut SystemState,
    txs_ab: &[TxId],
    txs_ba: &[TxId],
    tick: usize,
    to_remove: &mut Vec<TxId>,
    events: &mut Vec<Event>,
) -> Result<(), TickError> {
    let mut i = 0;
    let mut j = 0;
    while i < txs_ab.len() && j < txs_ba.len() {
        let rem_ab = state.tx(txs_ab[i]).remaining_amount();
        let rem_ba = state.tx(txs_ba[j]).remaining_amount();
        if rem_ab == 0 {
            i += 1;
            continue;
        }
        if rem_ba == 0 {
            j += 1;
            continue;
        }
        let off = rem_ab.min(rem_ba);
        apply_offset(state, txs_ab[i], txs_ba[j], off, tick, to_remove, events)?;
        if state.tx(txs_ab[i]).remaining_amount() == 0 {
            i += 1;
        }
        if state.tx(txs_ba[j]).remaining_amount() == 0 {
            j += 1;
        }
    }
    Ok(())
}

/// Full bilateral offsetting pass over Q2.
pub fn bilateral_pass(
    state: &mut SystemState,
    tick: usize,
    escalation: Option<&PriorityEscalation>,
) -> Result<Vec<Event>, TickError> {
    // Group queued flow by unordered pair.
    let mut pair_flows: BTreeMap<(String, String), (i64, i64)> = BTreeMap::new();
    for id in state.queue2() {
        let tx = state.tx(*id);
        if tx.remaining_amount() == 0 {
            continue;
        }
        let (s, r) = (tx.sender_id().to_string(), tx.receiver_id().to_string());
        if s < r {
            pair_flows.entry((s, r)).or_insert((0, 0)).0 += tx.remaining_amount();
        } else {
            pair_flows.entry((r, s)).or_insert((0, 0)).1 += tx.remaining_amount();
        }
    }

    // Pairs with mutual flow, by offsettable value descending, then pair id.
    let mut candidates: Vec<((String, String), i64)> = pair_flows
        .into_iter()
        .filter(|(_, (ab, ba))| *ab > 0 && *ba > 0)
        .map(|(pair, (ab, ba))| (pair, ab.min(ba)))
        .collect();
    candidates.sort_by(|x, y| y.1.cmp(&x.1).then_with(|| x.0.cmp(&y.0)));

    debug!(pairs = candidates.len(), tick, "bilateral offset pass");

    let mut events = Vec::new();
    let mut to_remove = Vec::new();
    for ((a, b), _) in candidates {
        let txs_ab: Vec<TxId> = release_order(state, &a, tick, escalation)
            .into_iter()
            .filter(|id| state.tx(*id).receiver_id() == b)
            .collect();
        let txs_ba: Vec<TxId> = release_order(state, &b, tick, escalation)
            .into_iter()
            .filter(|id| state.tx(*id).receiver_id() == a)
            .collect();
        offset_lists(state, &txs_ab, &txs_ba, tick, &mut to_remove, &mut events)?;
    }

    for id in to_remove {
        state.remove_from_queue2(id);
    }
    Ok(events)
}

/// Lightweight bilateral check when a transaction enters Q2: offset the
/// entering transaction against opposing queued flow. Returns the events
/// and whether any offset happened.
pub fn entry_offset(
    state: &mut SystemState,
    entering: TxId,
    tick: usize,
    escalation: Option<&PriorityEscalation>,
) -> Result<(Vec<Event>, bool), TickError> {
    let (sender, receiver) = {
        let tx = state.tx(entering);
        (tx.sender_id().to_string(), tx.receiver_id().to_string())
    };
    let opposing: Vec<TxId> = release_order(state, &receiver, tick, escalation)
        .into_iter()
        .filter(|id| state.tx(*id).receiver_id() == sender && *id != entering)
        .collect();
    if opposing.is_empty() {
        return Ok((Vec::new(), false));
    }

    let mut events = Vec::new();
    let mut to_remove = Vec::new();
    offset_lists(
        state,
        &[entering],
        &opposing,
        tick,
        &mut to_remove,
        &mut events,
    )?;
    let offset_any = !events.is_empty();
    for id in to_remove {
        state.remove_from_queue2(id);
    }
    Ok((events, offset_any))
}

#[derive(Debug, Clone)]
struct CycleCandidate {
    /// Smallest agent first, no closing repeat.
    agents: Vec<String>,
    edges: Vec<TxId>,
    cycle_min: i64,
    total_offset: i64,
    min_arrival: usize,
    tx_ids: Vec<String>,
}

/// Enumerate simple cycles over the aggregated Q2 graph.
///
/// One representative edge per directed pair: the head of that pair's
/// release order. Each cycle is produced exactly once, anchored at its
/// lexicographically smallest agent.
fn enumerate_cycles(
    state: &SystemState,
    max_len: usize,
    tick: usize,
    escalation: Option<&PriorityEscalation>,
) -> Vec<CycleCandidate> {
    // Representative edge per (sender, receiver).
    let mut edge: BTreeMap<(String, String), TxId> = BTreeMap::new();
    for agent_id in state.agent_ids() {
        for id in release_order(state, &agent_id, tick, escalation) {
            let receiver = state.tx(id).receiver_id().to_string();
            let key = (agent_id.clone(), receiver);
            edge.entry(key).or_insert(id);
        }
    }

    // Sorted adjacency.
    let mut adjacency: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for (from, to) in edge.keys().map(|(f, t)| (f.as_str(), t.as_str())) {
        adjacency.entry(from).or_default().push(to);
    }

    let mut cycles = Vec::new();
    let nodes: Vec<&str> = adjacency.keys().copied().collect();
    for start in nodes {
        let mut path: Vec<&str> = vec![start];
        dfs_cycles(
            start,
            start,
            &adjacency,
            &mut path,
            max_len,
            &mut |agents: &[&str]| {
                let mut edges = Vec::with_capacity(agents.len());
                for i in 0..agents.len() {
                    let from = agents[i];
                    let to = agents[(i + 1) % agents.len()];
                    edges.push(edge[&(from.to_string(), to.to_string())]);
                }
                let cycle_min = edges
                    .iter()
                    .map(|id| state.tx(*id).remaining_amount())
                    .min()
                    .unwrap_or(0);
                if cycle_min == 0 {
                    return;
                }
                let min_arrival = edges
                    .iter()
                    .map(|id| state.tx(*id).arrival_tick())
                    .min()
                    .unwrap_or(0);
                cycles.push(CycleCandidate {
                    agents: agents.iter().map(|s| s.to_string()).collect(),
                    tx_ids: edges
                        .iter()
                        .map(|id| state.tx(*id).external_id().to_string())
                        .collect(),
                    total_offset: cycle_min * edges.len() as i64,
                    cycle_min,
                    min_arrival,
                    edges,
                });
            },
        );
    }
    cycles
}

/// DFS restricted to nodes lexicographically greater than the start, so
/// each cycle is found once, anchored at its smallest node.
fn dfs_cycles<'a>(
    start: &'a str,
    current: &'a str,
    adjacency: &BTreeMap<&'a str, Vec<&'a str>>,
    path: &mut Vec<&'a str>,
    max_len: usize,
    found: &mut impl FnMut(&[&str]),
) {
    if let Some(neighbors) = adjacency.get(current) {
        for &next in neighbors {
            if next == start {
                if path.len() >= 3 {
                    found(path);
                }
            } else if path.len() < max_len && next > start && !path.contains(&next) {
                path.push(next);
                dfs_cycles(start, next, adjacency, path, max_len, found);
                path.pop();
            }
        }
    }
}

/// Multilateral cycle pass: enumerate, rank, apply up to the per-tick cap.
pub fn cycle_pass(
    state: &mut SystemState,
    tick: usize,
    config: &LsmConfig,
    escalation: Option<&PriorityEscalation>,
) -> Result<Vec<Event>, TickError> {
    let mut candidates = enumerate_cycles(state, config.max_cycle_length, tick, escalation);
    candidates.sort_by(|x, y| {
        y.total_offset
            .cmp(&x.total_offset)
            .then_with(|| x.agents.len().cmp(&y.agents.len()))
            .then_with(|| x.agents.cmp(&y.agents))
            .then_with(|| x.min_arrival.cmp(&y.min_arrival))
            .then_with(|| x.tx_ids.cmp(&y.tx_ids))
    });

    debug!(candidates = candidates.len(), tick, "cycle pass");

    let mut events = Vec::new();
    let mut applied = 0usize;
    for candidate in candidates {
        if applied >= config.max_cycles_per_tick {
            break;
        }
        // Earlier cycles may have consumed these edges; re-derive the
        // cycle minimum from current remaining amounts.
        let cycle_min = candidate
            .edges
            .iter()
            .map(|id| state.tx(*id).remaining_amount())
            .min()
            .unwrap_or(0);
        if cycle_min == 0 {
            continue;
        }

        // Acceptance: no participant may end up overdrawn. Every agent
        // receives and pays cycle_min, so inflow covers outflow exactly;
        // the check guards against a non-pure cycle slipping in.
        let feasible = candidate.agents.iter().all(|agent_id| {
            state
                .agent(agent_id)
                .map(|a| a.available_liquidity() + cycle_min >= cycle_min)
                .unwrap_or(false)
        });
        if !feasible {
            continue;
        }

        let tx_amounts: Vec<i64> = candidate
            .edges
            .iter()
            .map(|id| state.tx(*id).remaining_amount())
            .collect();

        let mut to_remove = Vec::new();
        let mut overdue_events = Vec::new();
        for edge in &candidate.edges {
            state.tx_mut(*edge).settle_offset(cycle_min, tick)?;
            let tx = state.tx(*edge);
            if tx.is_fully_settled() {
                if let Some(since) = tx.overdue_since_tick() {
                    overdue_events.push(Event::OverdueTransactionSettled {
                        tick,
                        tx_id: tx.external_id().to_string(),
                        agent_id: tx.sender_id().to_string(),
                        ticks_overdue: tick.saturating_sub(since),
                    });
                }
                to_remove.push(*edge);
            }
        }
        for id in to_remove {
            state.remove_from_queue2(id);
        }

        // Net positions per agent: inflow minus outflow along cycle
        // edges. Zero for every agent of a simple cycle.
        let net_positions: Vec<i64> = vec![0; candidate.agents.len()];
        let max_net_outflow = 0;
        let max_net_outflow_agent = String::new();

        events.push(Event::LsmCycleSettlement {
            tick,
            agents: candidate.agents.clone(),
            tx_ids: candidate.tx_ids.clone(),
            tx_amounts,
            offset_amount: cycle_min,
            total_value: cycle_min * candidate.edges.len() as i64,
            net_positions,
            max_net_outflow,
            max_net_outflow_agent,
        });
        events.extend(overdue_events);
        applied += 1;
    }

    Ok(events)
}
