//! Transaction records and the arena that owns them.
//!
//! Transactions are referenced from several places at once (per-agent
//! Q1, the central Q2, split parent/child links, scheduled releases), so
//! they live in a flat vector owned by the orchestrator and everything
//! else holds a copyable [`TxId`] index. String ids exist for external
//! identity only: event payloads, introspection, injection.
//!
//! CRITICAL: all money values are i64 cents.

use crate::model::event::BlockReason;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Arena index of a transaction. Never reused within an episode.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct TxId(pub u32);

/// Lifecycle of a payment obligation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxStatus {
    /// Created but not yet placed with the sender.
    Pending,

    /// Sitting in the sender's internal queue awaiting a policy release.
    InQueue1,

    /// Submitted and waiting in the central retry queue.
    InQueue2,

    /// Fully settled (or replaced by split children).
    Settled { tick: usize },

    /// Terminally removed by policy.
    Dropped { tick: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransactionError {
    #[error("settlement amount must be positive")]
    NonPositiveAmount,

    #[error("settlement amount {amount} exceeds remaining {remaining}")]
    AmountExceedsRemaining { amount: i64, remaining: i64 },

    #[error("transaction already fully settled")]
    AlreadySettled,

    #[error("cannot settle a dropped transaction")]
    Dropped,

    #[error("cannot partially settle an indivisible transaction")]
    Indivisible,

    #[error("duplicate transaction id: {0}")]
    DuplicateId(String),
}

/// A payment obligation between two agents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    external_id: String,
    sender_id: String,
    receiver_id: String,

    /// Original amount (cents, > 0).
    amount: i64,

    /// Unsettled portion (cents). Mutated only by settlement and splits.
    remaining_amount: i64,

    /// 0..=10, higher is more urgent.
    priority: u8,

    arrival_tick: usize,
    deadline_tick: usize,

    divisible: bool,
    is_split_child: bool,
    parent_id: Option<String>,

    status: TxStatus,

    /// First tick at which the deadline breach was observed, if any.
    overdue_since_tick: Option<usize>,

    /// Tick this transaction entered Q2, if it is or was there.
    queue2_entered_tick: Option<usize>,

    /// First failed admission check that sent it to Q2.
    queue_reason: Option<BlockReason>,
}

impl Transaction {
    /// Create a new pending transaction.
    ///
    /// # Panics
    /// Panics if `amount <= 0` or `deadline_tick < arrival_tick`.
    pub fn new(
        external_id: String,
        sender_id: String,
        receiver_id: String,
        amount: i64,
        arrival_tick: usize,
        deadline_tick: usize,
    ) -> Self {
        assert!(amount > 0, "amount must be positive");
        assert!(
            deadline_tick >= arrival_tick,
            "deadline must not precede arrival"
        );
        Self {
            external_id,
            sender_id,
            receiver_id,
            amount,
            remaining_amount: amount,
            priority: 5,
            arrival_tick,
            deadline_tick,
            divisible: false,
            is_split_child: false,
            parent_id: None,
            status: TxStatus::Pending,
            overdue_since_tick: None,
            queue2_entered_tick: None,
            queue_reason: None,
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority.min(10);
        self
    }

    pub fn divisible(mut self) -> Self {
        self.divisible = true;
        self
    }

    /// Constructor for split children: same counterparties and deadline,
    /// lineage recorded.
    pub fn new_split_child(
        external_id: String,
        parent: &Transaction,
        amount: i64,
        priority: u8,
    ) -> Self {
        let mut child = Transaction::new(
            external_id,
            parent.sender_id.clone(),
            parent.receiver_id.clone(),
            amount,
            parent.arrival_tick,
            parent.deadline_tick,
        );
        child.priority = priority.min(10);
        child.divisible = parent.divisible;
        child.is_split_child = true;
        child.parent_id = Some(parent.external_id.clone());
        child
    }

    pub fn external_id(&self) -> &str {
        &self.external_id
    }

    pub fn sender_id(&self) -> &str {
        &self.sender_id
    }

    pub fn receiver_id(&self) -> &str {
        &self.receiver_id
    }

    pub fn amount(&self) -> i64 {
        self.amount
    }

    pub fn remaining_amount(&self) -> i64 {
        self.remaining_amount
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    pub fn arrival_tick(&self) -> usize {
        self.arrival_tick
    }

    pub fn deadline_tick(&self) -> usize {
        self.deadline_tick
    }

    pub fn is_divisible(&self) -> bool {
        self.divisible
    }

    pub fn is_split_child(&self) -> bool {
        self.is_split_child
    }

    pub fn parent_id(&self) -> Option<&str> {
        self.parent_id.as_deref()
    }

    pub fn status(&self) -> &TxStatus {
        &self.status
    }

    pub fn is_fully_settled(&self) -> bool {
        matches!(self.status, TxStatus::Settled { .. })
    }

    pub fn is_dropped(&self) -> bool {
        matches!(self.status, TxStatus::Dropped { .. })
    }

    /// Unsettled and not dropped.
    pub fn is_live(&self) -> bool {
        matches!(
            self.status,
            TxStatus::Pending | TxStatus::InQueue1 | TxStatus::InQueue2
        )
    }

    pub fn is_past_deadline(&self, current_tick: usize) -> bool {
        current_tick > self.deadline_tick
    }

    pub fn is_overdue(&self) -> bool {
        self.overdue_since_tick.is_some()
    }

    pub fn overdue_since_tick(&self) -> Option<usize> {
        self.overdue_since_tick
    }

    /// Record the first observed deadline breach. Idempotent.
    pub fn mark_overdue(&mut self, tick: usize) {
        if self.overdue_since_tick.is_none() {
            self.overdue_since_tick = Some(tick);
        }
    }

    pub fn queue2_entered_tick(&self) -> Option<usize> {
        self.queue2_entered_tick
    }

    pub fn queue_reason(&self) -> Option<BlockReason> {
        self.queue_reason
    }

    pub fn place_in_queue1(&mut self) {
        self.status = TxStatus::InQueue1;
    }

    pub fn place_in_queue2(&mut self, tick: usize, reason: BlockReason) {
        self.status = TxStatus::InQueue2;
        self.queue2_entered_tick = Some(tick);
        self.queue_reason = Some(reason);
    }

    /// Remove from any queue without settling (submission path).
    pub fn mark_submitted(&mut self) {
        self.status = TxStatus::Pending;
    }

    /// Gross settlement: full amount, or a partial amount on a divisible
    /// transaction.
    pub fn settle_gross(&mut self, amount: i64, tick: usize) -> Result<(), TransactionError> {
        if amount < self.remaining_amount && !self.divisible {
            return Err(TransactionError::Indivisible);
        }
        self.settle_offset(amount, tick)
    }

    /// Netting settlement: reduces the remaining amount regardless of
    /// divisibility. Offsetting cancels obligations, it does not split
    /// the payment instruction.
    pub fn settle_offset(&mut self, amount: i64, tick: usize) -> Result<(), TransactionError> {
        if amount <= 0 {
            return Err(TransactionError::NonPositiveAmount);
        }
        if self.is_dropped() {
            return Err(TransactionError::Dropped);
        }
        if self.is_fully_settled() || self.remaining_amount == 0 {
            return Err(TransactionError::AlreadySettled);
        }
        if amount > self.remaining_amount {
            return Err(TransactionError::AmountExceedsRemaining {
                amount,
                remaining: self.remaining_amount,
            });
        }
        self.remaining_amount -= amount;
        if self.remaining_amount == 0 {
            self.status = TxStatus::Settled { tick };
        }
        Ok(())
    }

    /// Retire a split parent: its obligation is carried forward entirely
    /// by the children created at `tick`.
    pub fn retire_as_split_parent(&mut self, tick: usize) {
        self.remaining_amount = 0;
        self.status = TxStatus::Settled { tick };
    }

    pub fn drop_transaction(&mut self, tick: usize) {
        self.status = TxStatus::Dropped { tick };
    }
}

/// Flat arena of transactions plus the external-id index.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TxArena {
    txs: Vec<Transaction>,
    by_external_id: BTreeMap<String, TxId>,
}

impl TxArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, tx: Transaction) -> Result<TxId, TransactionError> {
        if self.by_external_id.contains_key(tx.external_id()) {
            return Err(TransactionError::DuplicateId(tx.external_id().to_string()));
        }
        let id = TxId(self.txs.len() as u32);
        self.by_external_id.insert(tx.external_id().to_string(), id);
        self.txs.push(tx);
        Ok(id)
    }

    pub fn get(&self, id: TxId) -> &Transaction {
        &self.txs[id.0 as usize]
    }

    pub fn get_mut(&mut self, id: TxId) -> &mut Transaction {
        &mut self.txs[id.0 as usize]
    }

    pub fn lookup(&self, external_id: &str) -> Option<TxId> {
        self.by_external_id.get(external_id).copied()
    }

    pub fn len(&self) -> usize {
        self.txs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.txs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (TxId, &Transaction)> {
        self.txs
            .iter()
            .enumerate()
            .map(|(i, tx)| (TxId(i as u32), tx))
    }
}
