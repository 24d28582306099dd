//! System state: everything the settlement engines operate on.
//!
//! The orchestrator exclusively owns one `SystemState`; per-tick component
//! functions receive it by mutable reference. Agents are stored in
//! insertion order and iterated in that order everywhere — stable
//! iteration is part of the determinism contract.

use crate::model::agent::Agent;
use crate::model::transaction::{Transaction, TransactionError, TxArena, TxId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemState {
    /// Agents in scenario insertion order.
    agents: Vec<Agent>,

    /// Agent id -> position in `agents`.
    agent_index: BTreeMap<String, usize>,

    /// All transactions ever created this episode.
    arena: TxArena,

    /// Central RTGS retry queue (Q2), kept in release-priority order.
    queue2: Vec<TxId>,

    /// Stagger-split children waiting to enter their sender's Q1:
    /// `(due_tick, tx)`.
    scheduled_queue1: Vec<(usize, TxId)>,
}

impl SystemState {
    pub fn new(agents: Vec<Agent>) -> Self {
        let agent_index = agents
            .iter()
            .enumerate()
            .map(|(i, a)| (a.id().to_string(), i))
            .collect();
        Self {
            agents,
            agent_index,
            arena: TxArena::new(),
            queue2: Vec::new(),
            scheduled_queue1: Vec::new(),
        }
    }

    pub fn num_agents(&self) -> usize {
        self.agents.len()
    }

    pub fn agents(&self) -> &[Agent] {
        &self.agents
    }

    /// Agent ids in insertion order.
    pub fn agent_ids(&self) -> Vec<String> {
        self.agents.iter().map(|a| a.id().to_string()).collect()
    }

    pub fn agent(&self, id: &str) -> Option<&Agent> {
        self.agent_index.get(id).map(|i| &self.agents[*i])
    }

    pub fn agent_mut(&mut self, id: &str) -> Option<&mut Agent> {
        let idx = *self.agent_index.get(id)?;
        Some(&mut self.agents[idx])
    }

    pub fn has_agent(&self, id: &str) -> bool {
        self.agent_index.contains_key(id)
    }

    pub fn arena(&self) -> &TxArena {
        &self.arena
    }

    pub fn tx(&self, id: TxId) -> &Transaction {
        self.arena.get(id)
    }

    pub fn tx_mut(&mut self, id: TxId) -> &mut Transaction {
        self.arena.get_mut(id)
    }

    pub fn insert_tx(&mut self, tx: Transaction) -> Result<TxId, TransactionError> {
        self.arena.insert(tx)
    }

    pub fn lookup_tx(&self, external_id: &str) -> Option<TxId> {
        self.arena.lookup(external_id)
    }

    // ------------------------------------------------------------------
    // Queue 2
    // ------------------------------------------------------------------

    pub fn queue2(&self) -> &[TxId] {
        &self.queue2
    }

    pub fn queue2_mut(&mut self) -> &mut Vec<TxId> {
        &mut self.queue2
    }

    pub fn queue2_len(&self) -> usize {
        self.queue2.len()
    }

    pub fn push_queue2(&mut self, tx: TxId) {
        self.queue2.push(tx);
    }

    pub fn remove_from_queue2(&mut self, tx: TxId) {
        self.queue2.retain(|t| *t != tx);
    }

    /// Q2 entries sent by `agent_id`, in current queue order.
    pub fn queue2_for_sender(&self, agent_id: &str) -> Vec<TxId> {
        self.queue2
            .iter()
            .copied()
            .filter(|id| self.arena.get(*id).sender_id() == agent_id)
            .collect()
    }

    pub fn queue2_count_for_sender(&self, agent_id: &str) -> usize {
        self.queue2
            .iter()
            .filter(|id| self.arena.get(**id).sender_id() == agent_id)
            .count()
    }

    /// Total remaining value an agent has committed across Q1 and Q2.
    pub fn pending_outflows(&self, agent_id: &str) -> i64 {
        let q1: i64 = self
            .agent(agent_id)
            .map(|a| {
                a.queue1()
                    .iter()
                    .map(|id| self.arena.get(*id).remaining_amount())
                    .sum()
            })
            .unwrap_or(0);
        let q2: i64 = self
            .queue2
            .iter()
            .filter(|id| self.arena.get(**id).sender_id() == agent_id)
            .map(|id| self.arena.get(*id).remaining_amount())
            .sum();
        q1 + q2
    }

    // ------------------------------------------------------------------
    // Scheduled Q1 entries (stagger splits)
    // ------------------------------------------------------------------

    pub fn schedule_queue1_entry(&mut self, due_tick: usize, tx: TxId) {
        self.scheduled_queue1.push((due_tick, tx));
    }

    /// Remove and return the entries due at `tick`, in scheduling order.
    pub fn take_due_queue1_entries(&mut self, tick: usize) -> Vec<TxId> {
        let mut due = Vec::new();
        self.scheduled_queue1.retain(|(t, tx)| {
            if *t <= tick {
                due.push(*tx);
                false
            } else {
                true
            }
        });
        due
    }

    pub fn scheduled_queue1(&self) -> &[(usize, TxId)] {
        &self.scheduled_queue1
    }

    // ------------------------------------------------------------------
    // Aggregates
    // ------------------------------------------------------------------

    pub fn total_balance(&self) -> i64 {
        self.agents.iter().map(|a| a.balance()).sum()
    }

    pub fn total_deferred_credits(&self) -> i64 {
        self.agents.iter().map(|a| a.deferred_credits()).sum()
    }

    pub fn total_queue1_len(&self) -> usize {
        self.agents.iter().map(|a| a.queue1_len()).sum()
    }

    /// Live transactions in any queue that are past their deadline.
    pub fn overdue_count(&self) -> usize {
        self.arena
            .iter()
            .filter(|(_, tx)| tx.is_live() && tx.is_overdue())
            .count()
    }
}
