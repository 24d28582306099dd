//! The observable event stream.
//!
//! Every state change the engine makes is described by exactly one
//! variant, and every variant carries all display-relevant fields
//! directly: replay from a persisted event stream reconstructs the
//! original display without any look-aside into live state.
//!
//! Events are appended in emission order; the order within a tick is part
//! of the observable contract and follows the phase order of the tick
//! loop. Events are never mutated after emission.

use crate::costs::CostBreakdown;
use serde::{Deserialize, Serialize};

/// First admission check that failed, sending a submission to Q2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockReason {
    BilateralLimit,
    MultilateralLimit,
    InsufficientLiquidity,
}

/// Why a Q2 resident became settleable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseReason {
    /// Credit capacity appeared (deferred credits applied, scenario-driven
    /// balance or collateral change).
    NewLiquidity,
    /// The sender posted collateral this tick.
    CollateralPosted,
    /// A settlement inflow landed on the sender's balance.
    IncomingPayment,
    /// A queue-entry bilateral offset removed obligations ahead of this one.
    Q2EntryOffset,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A new transaction entered the system (generated or injected).
    TransactionArrival {
        tick: usize,
        tx_id: String,
        sender_id: String,
        receiver_id: String,
        amount: i64,
        priority: u8,
        deadline_tick: usize,
        divisible: bool,
    },

    /// Payment tree released a transaction from Q1 for settlement.
    PolicySubmit {
        tick: usize,
        agent_id: String,
        tx_id: String,
    },

    /// Payment tree held a transaction in Q1.
    PolicyHold {
        tick: usize,
        agent_id: String,
        tx_id: String,
        reason: String,
    },

    /// Payment tree dropped a transaction (terminal).
    PolicyDrop {
        tick: usize,
        agent_id: String,
        tx_id: String,
        reason: String,
    },

    /// Payment tree split a transaction into children.
    PolicySplit {
        tick: usize,
        agent_id: String,
        tx_id: String,
        num_splits: usize,
        child_ids: Vec<String>,
        staggered: bool,
    },

    /// Immediate gross settlement through RTGS.
    RtgsImmediateSettlement {
        tick: usize,
        tx_id: String,
        sender_id: String,
        receiver_id: String,
        amount: i64,
        sender_balance_before: i64,
        sender_balance_after: i64,
    },

    /// A submission failed admission and entered the central retry queue.
    RtgsQueued {
        tick: usize,
        tx_id: String,
        sender_id: String,
        reason: BlockReason,
    },

    /// A Q2 resident settled after its sender's liquidity improved.
    Queue2LiquidityRelease {
        tick: usize,
        tx_id: String,
        sender_id: String,
        receiver_id: String,
        amount: i64,
        queue_wait_ticks: usize,
        release_reason: ReleaseReason,
    },

    /// One bilateral offset operation between two opposing Q2 transactions.
    LsmBilateralOffset {
        tick: usize,
        agent_a: String,
        agent_b: String,
        tx_id_a_to_b: String,
        tx_id_b_to_a: String,
        amount_a_to_b: i64,
        amount_b_to_a: i64,
        net_settled: i64,
    },

    /// A multilateral cycle offset `offset_amount` along every edge.
    LsmCycleSettlement {
        tick: usize,
        /// Cycle agents, smallest id first, without the closing repeat.
        agents: Vec<String>,
        /// One transaction per edge, in cycle order.
        tx_ids: Vec<String>,
        /// Remaining amount of each edge transaction before the offset.
        tx_amounts: Vec<i64>,
        /// Amount offset along every edge (the cycle minimum).
        offset_amount: i64,
        /// Total value offset across all edges.
        total_value: i64,
        /// Net position per agent, aligned with `agents`.
        net_positions: Vec<i64>,
        max_net_outflow: i64,
        max_net_outflow_agent: String,
    },

    /// Policy-driven collateral post (hysteresis gate passed).
    CollateralPosted {
        tick: usize,
        agent_id: String,
        amount: i64,
        reason: String,
        total_posted: i64,
        /// Change in available liquidity caused by the post.
        headroom_delta: i64,
    },

    /// Collateral withdrawal (holding period satisfied, gate passed).
    CollateralWithdrawn {
        tick: usize,
        agent_id: String,
        amount: i64,
        reason: String,
        total_posted: i64,
        headroom_delta: i64,
        ticks_held: usize,
    },

    /// End-of-tick application of accumulated deferred credits.
    DeferredCreditApplied {
        tick: usize,
        agent_id: String,
        amount: i64,
    },

    /// Per-agent cost accrual for the tick (emitted only when non-zero).
    CostAccrual {
        tick: usize,
        agent_id: String,
        costs: CostBreakdown,
    },

    /// First observed deadline breach of a queued transaction.
    TransactionWentOverdue {
        tick: usize,
        tx_id: String,
        agent_id: String,
        deadline_tick: usize,
    },

    /// An overdue transaction finally settled.
    OverdueTransactionSettled {
        tick: usize,
        tx_id: String,
        agent_id: String,
        ticks_overdue: usize,
    },

    /// Bank tree wrote a named state register.
    StateRegisterSet {
        tick: usize,
        agent_id: String,
        register: String,
        value: i64,
    },

    /// Bank tree set the per-tick release budget.
    BankBudgetSet {
        tick: usize,
        agent_id: String,
        budget: i64,
    },

    /// A scheduled scenario event was applied.
    ScenarioEventApplied {
        tick: usize,
        description: String,
    },

    /// End-of-day summary; daily limit accumulators reset afterwards.
    EndOfDay {
        tick: usize,
        day: usize,
        settled_count: usize,
        settled_value: i64,
        unsettled_q1: usize,
        unsettled_q2: usize,
        overdue_count: usize,
        day_costs: i64,
    },
}

impl Event {
    pub fn tick(&self) -> usize {
        match self {
            Event::TransactionArrival { tick, .. }
            | Event::PolicySubmit { tick, .. }
            | Event::PolicyHold { tick, .. }
            | Event::PolicyDrop { tick, .. }
            | Event::PolicySplit { tick, .. }
            | Event::RtgsImmediateSettlement { tick, .. }
            | Event::RtgsQueued { tick, .. }
            | Event::Queue2LiquidityRelease { tick, .. }
            | Event::LsmBilateralOffset { tick, .. }
            | Event::LsmCycleSettlement { tick, .. }
            | Event::CollateralPosted { tick, .. }
            | Event::CollateralWithdrawn { tick, .. }
            | Event::DeferredCreditApplied { tick, .. }
            | Event::CostAccrual { tick, .. }
            | Event::TransactionWentOverdue { tick, .. }
            | Event::OverdueTransactionSettled { tick, .. }
            | Event::StateRegisterSet { tick, .. }
            | Event::BankBudgetSet { tick, .. }
            | Event::ScenarioEventApplied { tick, .. }
            | Event::EndOfDay { tick, .. } => *tick,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Event::TransactionArrival { .. } => "TransactionArrival",
            Event::PolicySubmit { .. } => "PolicySubmit",
            Event::PolicyHold { .. } => "PolicyHold",
            Event::PolicyDrop { .. } => "PolicyDrop",
            Event::PolicySplit { .. } => "PolicySplit",
            Event::RtgsImmediateSettlement { .. } => "RtgsImmediateSettlement",
            Event::RtgsQueued { .. } => "RtgsQueued",
            Event::Queue2LiquidityRelease { .. } => "Queue2LiquidityRelease",
            Event::LsmBilateralOffset { .. } => "LsmBilateralOffset",
            Event::LsmCycleSettlement { .. } => "LsmCycleSettlement",
            Event::CollateralPosted { .. } => "CollateralPosted",
            Event::CollateralWithdrawn { .. } => "CollateralWithdrawn",
            Event::DeferredCreditApplied { .. } => "DeferredCreditApplied",
            Event::CostAccrual { .. } => "CostAccrual",
            Event::TransactionWentOverdue { .. } => "TransactionWentOverdue",
            Event::OverdueTransactionSettled { .. } => "OverdueTransactionSettled",
            Event::StateRegisterSet { .. } => "StateRegisterSet",
            Event::BankBudgetSet { .. } => "BankBudgetSet",
            Event::ScenarioEventApplied { .. } => "ScenarioEventApplied",
            Event::EndOfDay { .. } => "EndOfDay",
        }
    }

    /// Transaction this event concerns, if any.
    pub fn tx_id(&self) -> Option<&str> {
        match self {
            Event::TransactionArrival { tx_id, .. }
            | Event::PolicySubmit { tx_id, .. }
            | Event::PolicyHold { tx_id, .. }
            | Event::PolicyDrop { tx_id, .. }
            | Event::PolicySplit { tx_id, .. }
            | Event::RtgsImmediateSettlement { tx_id, .. }
            | Event::RtgsQueued { tx_id, .. }
            | Event::Queue2LiquidityRelease { tx_id, .. }
            | Event::TransactionWentOverdue { tx_id, .. }
            | Event::OverdueTransactionSettled { tx_id, .. } => Some(tx_id),
            _ => None,
        }
    }

    /// Primary agent of this event, if any.
    pub fn agent_id(&self) -> Option<&str> {
        match self {
            Event::TransactionArrival { sender_id, .. }
            | Event::RtgsImmediateSettlement { sender_id, .. }
            | Event::RtgsQueued { sender_id, .. }
            | Event::Queue2LiquidityRelease { sender_id, .. } => Some(sender_id),
            Event::PolicySubmit { agent_id, .. }
            | Event::PolicyHold { agent_id, .. }
            | Event::PolicyDrop { agent_id, .. }
            | Event::PolicySplit { agent_id, .. }
            | Event::CollateralPosted { agent_id, .. }
            | Event::CollateralWithdrawn { agent_id, .. }
            | Event::DeferredCreditApplied { agent_id, .. }
            | Event::CostAccrual { agent_id, .. }
            | Event::TransactionWentOverdue { agent_id, .. }
            | Event::OverdueTransactionSettled { agent_id, .. }
            | Event::StateRegisterSet { agent_id, .. }
            | Event::BankBudgetSet { agent_id, .. } => Some(agent_id),
            _ => None,
        }
    }
}

/// Append-only log of every event emitted so far.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventLog {
    events: Vec<Event>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: Event) {
        self.events.push(event);
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn events_at_tick(&self, tick: usize) -> Vec<&Event> {
        self.events.iter().filter(|e| e.tick() == tick).collect()
    }

    pub fn events_of_kind(&self, kind: &str) -> Vec<&Event> {
        self.events.iter().filter(|e| e.kind() == kind).collect()
    }

    pub fn events_for_tx(&self, tx_id: &str) -> Vec<&Event> {
        self.events
            .iter()
            .filter(|e| e.tx_id() == Some(tx_id))
            .collect()
    }

    pub fn events_for_agent(&self, agent_id: &str) -> Vec<&Event> {
        self.events
            .iter()
            .filter(|e| e.agent_id() == Some(agent_id))
            .collect()
    }
}
