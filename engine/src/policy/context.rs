//! Evaluation contexts and the field vocabulary.
//!
//! A context is a snapshot of named `Ratio` values built from live state
//! just before a tree is evaluated. The vocabulary is partitioned by tree
//! kind: the payment tree sees transaction fields on top of the agent
//! fields; bank and collateral trees see agent fields only. A reference
//! to a field outside its tree's vocabulary fails validation before any
//! evaluation happens.

use crate::clock::SimClock;
use crate::model::agent::Agent;
use crate::model::transaction::Transaction;
use crate::num::Ratio;
use crate::policy::ast::TreeKind;
use std::collections::BTreeMap;

/// Agent-level fields, visible in every tree.
pub const AGENT_FIELDS: &[&str] = &[
    "balance",
    "credit_limit",
    "credit_used",
    "available_liquidity",
    "posted_collateral",
    "collateral_value",
    "deferred_credits",
    "q1_size",
    "q2_size",
    "pending_outflows",
    "current_tick",
    "tick_in_day",
    "ticks_remaining_in_day",
    "day_progress_fraction",
    "is_eod_rush",
    "cost_liquidity",
    "cost_delay",
    "cost_collateral",
    "cost_deadline_penalty",
    "cost_split_friction",
];

/// Transaction-level fields, visible only in the payment tree.
pub const PAYMENT_FIELDS: &[&str] = &[
    "amount",
    "remaining_amount",
    "priority",
    "arrival_tick",
    "deadline_tick",
    "ticks_to_deadline",
    "queue_age",
    "is_split",
    "is_overdue",
    "divisible",
];

/// Registers are addressed as `reg_<name>`; the prefix is validated
/// structurally and unset registers read as zero.
pub const REGISTER_PREFIX: &str = "reg_";

/// Whether `field` may appear in a tree of the given kind.
pub fn is_field_valid(kind: TreeKind, field: &str) -> bool {
    if AGENT_FIELDS.contains(&field) || field.starts_with(REGISTER_PREFIX) {
        return true;
    }
    kind == TreeKind::Payment && PAYMENT_FIELDS.contains(&field)
}

/// Inputs for the agent-level portion of a context that live outside the
/// `Agent` record itself.
#[derive(Debug, Clone, Copy)]
pub struct AgentSnapshot {
    /// Number of this agent's transactions in Q2.
    pub q2_count: usize,
    /// Total remaining value across the agent's Q1 and Q2 entries.
    pub pending_outflows: i64,
}

#[derive(Debug, Clone)]
pub struct EvalContext {
    fields: BTreeMap<String, Ratio>,
}

impl EvalContext {
    /// Context for bank and collateral trees.
    pub fn for_agent(
        agent: &Agent,
        snapshot: AgentSnapshot,
        clock: &SimClock,
        eod_rush_threshold: Ratio,
    ) -> Self {
        let mut fields = BTreeMap::new();
        insert_agent_fields(&mut fields, agent, snapshot, clock, eod_rush_threshold);
        Self { fields }
    }

    /// Context for the payment tree: agent fields plus the transaction
    /// under evaluation.
    pub fn for_payment(
        tx: &Transaction,
        agent: &Agent,
        snapshot: AgentSnapshot,
        clock: &SimClock,
        eod_rush_threshold: Ratio,
    ) -> Self {
        let mut fields = BTreeMap::new();
        insert_agent_fields(&mut fields, agent, snapshot, clock, eod_rush_threshold);

        let tick = clock.current_tick();
        put(&mut fields, "amount", tx.amount());
        put(&mut fields, "remaining_amount", tx.remaining_amount());
        put(&mut fields, "priority", tx.priority() as i64);
        put(&mut fields, "arrival_tick", tx.arrival_tick() as i64);
        put(&mut fields, "deadline_tick", tx.deadline_tick() as i64);
        put(
            &mut fields,
            "ticks_to_deadline",
            tx.deadline_tick() as i64 - tick as i64,
        );
        put(
            &mut fields,
            "queue_age",
            tick.saturating_sub(tx.arrival_tick()) as i64,
        );
        put_bool(&mut fields, "is_split", tx.is_split_child());
        put_bool(&mut fields, "is_overdue", tx.is_overdue());
        put_bool(&mut fields, "divisible", tx.is_divisible());

        Self { fields }
    }

    pub fn get(&self, name: &str) -> Option<Ratio> {
        if let Some(v) = self.fields.get(name) {
            return Some(*v);
        }
        // Unset registers read as zero.
        if name.starts_with(REGISTER_PREFIX) {
            return Some(Ratio::ZERO);
        }
        None
    }

    pub fn has(&self, name: &str) -> bool {
        self.fields.contains_key(name) || name.starts_with(REGISTER_PREFIX)
    }
}

fn put(fields: &mut BTreeMap<String, Ratio>, name: &str, value: i64) {
    fields.insert(name.to_string(), Ratio::from_int(value));
}

fn put_bool(fields: &mut BTreeMap<String, Ratio>, name: &str, value: bool) {
    put(fields, name, if value { 1 } else { 0 });
}

fn insert_agent_fields(
    fields: &mut BTreeMap<String, Ratio>,
    agent: &Agent,
    snapshot: AgentSnapshot,
    clock: &SimClock,
    eod_rush_threshold: Ratio,
) {
    put(fields, "balance", agent.balance());
    put(fields, "credit_limit", agent.credit_limit());
    put(fields, "credit_used", agent.credit_used());
    put(fields, "available_liquidity", agent.available_liquidity());
    put(fields, "posted_collateral", agent.posted_collateral());
    put(fields, "collateral_value", agent.collateral_value());
    put(fields, "deferred_credits", agent.deferred_credits());
    put(fields, "q1_size", agent.queue1_len() as i64);
    put(fields, "q2_size", snapshot.q2_count as i64);
    put(fields, "pending_outflows", snapshot.pending_outflows);

    put(fields, "current_tick", clock.current_tick() as i64);
    put(fields, "tick_in_day", clock.tick_in_day() as i64);
    put(
        fields,
        "ticks_remaining_in_day",
        clock.ticks_remaining_in_day() as i64,
    );
    let progress = clock.day_progress();
    fields.insert("day_progress_fraction".to_string(), progress);
    put_bool(fields, "is_eod_rush", progress >= eod_rush_threshold);

    let costs = agent.costs();
    put(fields, "cost_liquidity", costs.liquidity);
    put(fields, "cost_delay", costs.delay);
    put(fields, "cost_collateral", costs.collateral);
    put(fields, "cost_deadline_penalty", costs.deadline_penalty);
    put(fields, "cost_split_friction", costs.split_friction);

    for (name, value) in agent.state_registers() {
        put(fields, &format!("{}{}", REGISTER_PREFIX, name), *value);
    }
}
