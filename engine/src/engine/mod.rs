//! The orchestrator: phase-ordered composition of every component.
//!
//! One `Orchestrator` exclusively owns all simulation state. `tick()`
//! advances one step through the twelve phases:
//!
//! 1. apply due scenario events
//! 2. generate arrivals into Q1 (plus scheduled stagger children)
//! 3. per agent: bank tree, then strategic collateral tree
//! 4. per agent: walk Q1 and evaluate the payment tree per transaction
//! 5. submitted transactions attempt RTGS; failures enter Q2
//! 6. LSM bilateral then multilateral (cascades interleave unless
//!    `algorithm_sequencing`)
//! 7. drain any remaining release triggers (bounded)
//! 8. per agent: end-of-tick collateral tree
//! 9. deferred-credit application, then a bounded release pass
//! 10. overdue scan (Q1 + Q2), deadline penalties
//! 11. per-agent cost accrual
//! 12. end-of-day statistics and daily limit reset
//!
//! The engine is single-threaded logical time: no step suspends, nothing
//! reads the wall clock, and the cancel hook is honored only between
//! ticks. Same seed + same scenario => byte-identical event stream.

mod digest;

use crate::arrivals::ArrivalEngine;
use crate::clock::SimClock;
use crate::collateral::{self, CollateralOutcome};
use crate::costs::{CostBreakdown, CostTotals};
use crate::model::agent::Agent;
use crate::model::event::{Event, EventLog, ReleaseReason};
use crate::model::state::SystemState;
use crate::model::transaction::{Transaction, TransactionError, TxId};
use crate::num::{add_cents, ArithmeticError};
use crate::policy::{evaluate_tree, ActionKind, EvalContext, EvalError, PolicyDef, TreeKind};
use crate::policy::context::AgentSnapshot;
use crate::queues::order_queue1;
use crate::rng::DetRng;
use crate::scenario::{
    CustomArrival, Scenario, ScenarioError, ScenarioEvent, ScheduledEvent,
};
use crate::settlement::release::{run_cascade, CascadeConfig, MAX_CASCADE_SETTLEMENTS};
use crate::settlement::{lsm, rtgs};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::warn;

/// Fatal failures of a running episode. These indicate engine bugs or
/// corrupt state and are never silently recovered; policy refusals and
/// liquidity failures are events, not errors.
#[derive(Debug, Error)]
pub enum TickError {
    #[error("money arithmetic overflow: {0}")]
    Arithmetic(#[from] ArithmeticError),

    #[error("credit invariant violated for {agent}: used {used} exceeds cap {cap}")]
    CreditInvariantViolated { agent: String, used: i64, cap: i64 },

    #[error("policy evaluation failed for {agent}: {source}")]
    PolicyEvaluation { agent: String, source: EvalError },

    #[error("transaction state error: {0}")]
    Transaction(#[from] TransactionError),

    #[error("unknown agent referenced internally: {0}")]
    UnknownAgent(String),

    #[error("episode already finished")]
    EpisodeFinished,

    #[error("internal engine fault: {0}")]
    Internal(String),
}

/// Running totals for the current day's EndOfDay summary.
#[derive(Debug, Clone, Copy, Default)]
struct DayStats {
    settlements: usize,
    settled_value: i64,
    costs: i64,
}

pub struct Orchestrator {
    clock: SimClock,
    rng: DetRng,
    state: SystemState,
    arrivals: ArrivalEngine,
    settings: crate::scenario::GlobalSettings,
    policies: BTreeMap<String, PolicyDef>,
    scenario_events: Vec<ScheduledEvent>,
    log: EventLog,
    sink: Option<Box<dyn FnMut(&Event)>>,
    next_tx_seq: usize,
    /// Liquidity-increase notifications awaiting a release cascade.
    pending_releases: Vec<(String, ReleaseReason)>,
    /// One-shot costs charged earlier in the current tick.
    tick_costs: BTreeMap<String, CostBreakdown>,
    day: DayStats,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("current_tick", &self.clock.current_tick())
            .field("num_agents", &self.state.num_agents())
            .field("num_transactions", &self.state.arena().len())
            .field("events", &self.log.len())
            .finish()
    }
}

impl Orchestrator {
    /// Build an engine from a scenario. All validation happens here;
    /// nothing runs on a scenario that fails.
    pub fn new(scenario: Scenario) -> Result<Self, ScenarioError> {
        scenario.validate()?;

        let mut agents = Vec::with_capacity(scenario.agents.len());
        let mut policies = BTreeMap::new();
        let mut profiles = BTreeMap::new();
        for spec in &scenario.agents {
            let mut agent = Agent::new(spec.id.clone(), spec.opening_balance, spec.credit_limit);
            if spec.posted_collateral > 0 {
                agent = agent.with_collateral(spec.posted_collateral, spec.collateral_haircut);
            } else {
                agent = agent.with_collateral(0, spec.collateral_haircut);
            }
            if let Some(cap) = spec.collateral_capacity {
                agent = agent.with_collateral_capacity(cap);
            }
            if !spec.bilateral_limits.is_empty() {
                agent = agent.with_bilateral_limits(spec.bilateral_limits.clone());
            }
            if let Some(limit) = spec.multilateral_limit {
                agent = agent.with_multilateral_limit(limit);
            }
            agents.push(agent);

            if let Some(policy) = &spec.policy {
                policies.insert(spec.id.clone(), policy.clone());
            }
            if let Some(profile) = spec.arrival_profile() {
                profiles.insert(spec.id.clone(), profile);
            }
        }

        let all_ids: Vec<String> = scenario.agents.iter().map(|a| a.id.clone()).collect();
        let arrivals = ArrivalEngine::new(
            profiles,
            all_ids,
            scenario.settings.deadline_cap_at_eod,
        );

        Ok(Self {
            clock: SimClock::new(scenario.ticks_per_day, scenario.num_days),
            rng: DetRng::new(scenario.rng_seed),
            state: SystemState::new(agents),
            arrivals,
            settings: scenario.settings,
            policies,
            scenario_events: scenario.scenario_events,
            log: EventLog::new(),
            sink: None,
            next_tx_seq: 0,
            pending_releases: Vec::new(),
            tick_costs: BTreeMap::new(),
            day: DayStats::default(),
        })
    }

    // ==================================================================
    // Control surface
    // ==================================================================

    pub fn current_tick(&self) -> usize {
        self.clock.current_tick()
    }

    pub fn is_finished(&self) -> bool {
        self.clock.is_finished()
    }

    pub fn agent_state(&self, id: &str) -> Option<&Agent> {
        self.state.agent(id)
    }

    pub fn queue1_contents(&self, id: &str) -> Vec<String> {
        self.state
            .agent(id)
            .map(|a| {
                a.queue1()
                    .iter()
                    .map(|tx| self.state.tx(*tx).external_id().to_string())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn q2_contents(&self) -> Vec<String> {
        self.state
            .queue2()
            .iter()
            .map(|tx| self.state.tx(*tx).external_id().to_string())
            .collect()
    }

    pub fn accumulated_costs(&self, id: &str) -> Option<&CostTotals> {
        self.state.agent(id).map(|a| a.costs())
    }

    pub fn transaction(&self, id: &str) -> Option<&Transaction> {
        self.state.lookup_tx(id).map(|tx| self.state.tx(tx))
    }

    pub fn events(&self) -> &[Event] {
        self.log.events()
    }

    /// Install (or clear) the synchronous per-event sink. The callback
    /// must not re-enter the orchestrator.
    pub fn set_event_sink(&mut self, sink: Option<Box<dyn FnMut(&Event)>>) {
        self.sink = sink;
    }

    /// SHA-256 over the canonically serialized engine state (clock, RNG,
    /// agents, arena, queues). Two runs with equal digests have
    /// bit-identical state.
    pub fn state_digest(&self) -> String {
        digest::state_digest(&self.clock, &self.rng, &self.state)
    }

    /// Inject an out-of-band arrival into the sender's Q1 at the current
    /// tick. Returns the transaction's external id.
    pub fn inject_transaction(&mut self, arrival: CustomArrival) -> Result<String, ScenarioError> {
        let tick = self.clock.current_tick();
        self.create_arrival(&arrival, tick)
    }

    /// Run the remaining episode, checking the cancel hook between ticks.
    pub fn run(&mut self, mut cancel: impl FnMut() -> bool) -> Result<(), TickError> {
        while !self.clock.is_finished() {
            if cancel() {
                return Ok(());
            }
            self.tick()?;
        }
        Ok(())
    }

    // ==================================================================
    // Event emission
    // ==================================================================

    /// Single choke point: state is committed before the event exists,
    /// and the sink observes exactly the logged sequence.
    fn emit(&mut self, event: Event) {
        match &event {
            Event::RtgsImmediateSettlement { amount, .. }
            | Event::Queue2LiquidityRelease { amount, .. } => {
                self.day.settlements += 1;
                self.day.settled_value += amount;
            }
            Event::LsmBilateralOffset { net_settled, .. } => {
                self.day.settlements += 1;
                self.day.settled_value += 2 * net_settled;
            }
            Event::LsmCycleSettlement { total_value, .. } => {
                self.day.settlements += 1;
                self.day.settled_value += total_value;
            }
            _ => {}
        }
        if let Some(sink) = self.sink.as_mut() {
            sink(&event);
        }
        self.log.push(event);
    }

    fn emit_all(&mut self, events: Vec<Event>) {
        for event in events {
            self.emit(event);
        }
    }

    // ==================================================================
    // The tick loop
    // ==================================================================

    pub fn tick(&mut self) -> Result<Vec<Event>, TickError> {
        if self.clock.is_finished() {
            return Err(TickError::EpisodeFinished);
        }
        let tick = self.clock.current_tick();
        let log_start = self.log.len();
        self.tick_costs.clear();

        // Release budgets are per tick; unset means unlimited.
        for id in self.state.agent_ids() {
            if let Some(agent) = self.state.agent_mut(&id) {
                agent.set_release_budget(None);
            }
        }

        self.apply_scenario_events(tick)?;
        self.generate_arrivals(tick)?;
        self.bank_and_strategic_collateral(tick)?;
        let submissions = self.walk_queue1(tick)?;
        self.settle_submissions(submissions, tick)?;
        crate::queues::sort_queue2(
            &mut self.state,
            tick,
            self.settings.priority_escalation.as_ref(),
        );
        // With strict sequencing, the LSM phases see the full residual
        // queue and all release cascades wait until after them; otherwise
        // cascades interleave with the LSM phases.
        if !self.settings.algorithm_sequencing {
            self.drain_releases(tick)?;
        }
        self.run_lsm(tick)?;
        self.drain_releases(tick)?;
        self.end_of_tick_collateral(tick)?;
        self.apply_deferred_credits(tick)?;
        self.scan_overdue(tick);
        self.accrue_costs(tick)?;
        if self.clock.is_last_tick_of_day() {
            self.end_of_day(tick);
        }
        self.clock.advance();

        Ok(self.log.events()[log_start..].to_vec())
    }

    // ------------------------------------------------------------------
    // Phase 1: scenario events
    // ------------------------------------------------------------------

    fn apply_scenario_events(&mut self, tick: usize) -> Result<(), TickError> {
        let due: Vec<ScenarioEvent> = self
            .scenario_events
            .iter()
            .filter(|s| s.schedule.should_fire(tick))
            .map(|s| s.event.clone())
            .collect();

        for event in due {
            let description = event.describe();
            match &event {
                ScenarioEvent::DirectTransfer {
                    from_agent,
                    to_agent,
                    amount,
                } => {
                    if !self.state.has_agent(from_agent) || !self.state.has_agent(to_agent) {
                        warn!(%description, "scenario event targets unknown agent; skipped");
                        continue;
                    }
                    self.state
                        .agent_mut(from_agent)
                        .expect("checked above")
                        .adjust_balance(-*amount);
                    self.state
                        .agent_mut(to_agent)
                        .expect("checked above")
                        .adjust_balance(*amount);
                    self.emit(Event::ScenarioEventApplied { tick, description });
                    self.pending_releases
                        .push((to_agent.clone(), ReleaseReason::NewLiquidity));
                }
                ScenarioEvent::CustomTransactionArrival { arrival } => {
                    self.emit(Event::ScenarioEventApplied { tick, description });
                    if let Err(e) = self.create_arrival(arrival, tick) {
                        warn!(error = %e, "custom arrival skipped");
                    }
                }
                ScenarioEvent::CollateralAdjustment { agent, delta } => {
                    let (applied, info) = match self.state.agent_mut(agent) {
                        Some(a) => {
                            let before_avail = a.available_liquidity();
                            let held_since = a.collateral_posted_at_tick();
                            let applied = a.adjust_collateral(*delta, tick);
                            (
                                applied,
                                Some((
                                    a.posted_collateral(),
                                    a.available_liquidity() - before_avail,
                                    held_since,
                                )),
                            )
                        }
                        None => {
                            warn!(%description, "scenario event targets unknown agent; skipped");
                            (0, None)
                        }
                    };
                    let Some((total_posted, headroom_delta, held_since)) = info else {
                        continue;
                    };
                    self.emit(Event::ScenarioEventApplied { tick, description });
                    if applied > 0 {
                        self.emit(Event::CollateralPosted {
                            tick,
                            agent_id: agent.clone(),
                            amount: applied,
                            reason: "scenario_adjustment".to_string(),
                            total_posted,
                            headroom_delta,
                        });
                        self.pending_releases
                            .push((agent.clone(), ReleaseReason::NewLiquidity));
                    } else if applied < 0 {
                        self.emit(Event::CollateralWithdrawn {
                            tick,
                            agent_id: agent.clone(),
                            amount: -applied,
                            reason: "scenario_adjustment".to_string(),
                            total_posted,
                            headroom_delta,
                            ticks_held: held_since.map_or(0, |t| tick.saturating_sub(t)),
                        });
                    }
                }
                ScenarioEvent::GlobalArrivalRateChange { multiplier } => {
                    self.arrivals.multiply_all_rates(*multiplier);
                    self.emit(Event::ScenarioEventApplied { tick, description });
                }
                ScenarioEvent::AgentArrivalRateChange { agent, multiplier } => {
                    self.arrivals.multiply_agent_rate(agent, *multiplier);
                    self.emit(Event::ScenarioEventApplied { tick, description });
                }
                ScenarioEvent::CounterpartyWeightChange {
                    agent,
                    counterparty,
                    new_weight,
                    auto_balance_others,
                } => {
                    self.arrivals.set_counterparty_weight(
                        agent,
                        counterparty,
                        *new_weight,
                        *auto_balance_others,
                    );
                    self.emit(Event::ScenarioEventApplied { tick, description });
                }
                ScenarioEvent::DeadlineWindowChange {
                    min_ticks_multiplier,
                    max_ticks_multiplier,
                } => {
                    self.arrivals
                        .scale_deadline_windows(*min_ticks_multiplier, *max_ticks_multiplier);
                    self.emit(Event::ScenarioEventApplied { tick, description });
                }
            }
        }
        Ok(())
    }

    /// Create a transaction from an injected arrival, emit its arrival
    /// event, and place it in the sender's Q1.
    fn create_arrival(
        &mut self,
        arrival: &CustomArrival,
        tick: usize,
    ) -> Result<String, ScenarioError> {
        if !self.state.has_agent(&arrival.sender_id) {
            return Err(ScenarioError::UnknownAgent(arrival.sender_id.clone()));
        }
        if !self.state.has_agent(&arrival.receiver_id) {
            return Err(ScenarioError::UnknownAgent(arrival.receiver_id.clone()));
        }
        let external_id = match &arrival.id {
            Some(id) => id.clone(),
            None => self.next_tx_id(),
        };
        let mut tx = Transaction::new(
            external_id.clone(),
            arrival.sender_id.clone(),
            arrival.receiver_id.clone(),
            arrival.amount,
            tick,
            arrival.deadline_tick.max(tick),
        )
        .with_priority(arrival.priority);
        if arrival.divisible {
            tx = tx.divisible();
        }
        let amount = tx.amount();
        let priority = tx.priority();
        let deadline_tick = tx.deadline_tick();
        let divisible = tx.is_divisible();
        let tx_id = self
            .state
            .insert_tx(tx)
            .map_err(|_| ScenarioError::DuplicateTransactionId(external_id.clone()))?;
        self.emit(Event::TransactionArrival {
            tick,
            tx_id: external_id.clone(),
            sender_id: arrival.sender_id.clone(),
            receiver_id: arrival.receiver_id.clone(),
            amount,
            priority,
            deadline_tick,
            divisible,
        });
        self.state.tx_mut(tx_id).place_in_queue1();
        self.state
            .agent_mut(&arrival.sender_id)
            .expect("checked above")
            .enqueue1(tx_id);
        Ok(external_id)
    }

    fn next_tx_id(&mut self) -> String {
        let id = format!("tx_{:08}", self.next_tx_seq);
        self.next_tx_seq += 1;
        id
    }

    // ------------------------------------------------------------------
    // Phase 2: arrivals
    // ------------------------------------------------------------------

    fn generate_arrivals(&mut self, tick: usize) -> Result<(), TickError> {
        // Stagger-split children scheduled for this tick enter Q1 first.
        for tx_id in self.state.take_due_queue1_entries(tick) {
            let sender = self.state.tx(tx_id).sender_id().to_string();
            self.state.tx_mut(tx_id).place_in_queue1();
            self.state
                .agent_mut(&sender)
                .ok_or(TickError::UnknownAgent(sender.clone()))?
                .enqueue1(tx_id);
        }

        for agent_id in self.state.agent_ids() {
            let draws = self
                .arrivals
                .generate_for_agent(&agent_id, &self.clock, &mut self.rng);
            for draw in draws {
                let external_id = self.next_tx_id();
                let mut tx = Transaction::new(
                    external_id.clone(),
                    agent_id.clone(),
                    draw.receiver_id.clone(),
                    draw.amount,
                    tick,
                    draw.deadline_tick.max(tick),
                )
                .with_priority(draw.priority);
                if draw.divisible {
                    tx = tx.divisible();
                }
                let deadline_tick = tx.deadline_tick();
                let tx_id = self
                    .state
                    .insert_tx(tx)
                    .map_err(TickError::Transaction)?;
                self.emit(Event::TransactionArrival {
                    tick,
                    tx_id: external_id,
                    sender_id: agent_id.clone(),
                    receiver_id: draw.receiver_id,
                    amount: draw.amount,
                    priority: draw.priority,
                    deadline_tick,
                    divisible: draw.divisible,
                });
                self.state.tx_mut(tx_id).place_in_queue1();
                self.state
                    .agent_mut(&agent_id)
                    .ok_or(TickError::UnknownAgent(agent_id.clone()))?
                    .enqueue1(tx_id);
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Phases 3 and 8: agent-level trees
    // ------------------------------------------------------------------

    fn agent_context(&self, agent_id: &str) -> Result<EvalContext, TickError> {
        let agent = self
            .state
            .agent(agent_id)
            .ok_or_else(|| TickError::UnknownAgent(agent_id.to_string()))?;
        Ok(EvalContext::for_agent(
            agent,
            AgentSnapshot {
                q2_count: self.state.queue2_count_for_sender(agent_id),
                pending_outflows: self.state.pending_outflows(agent_id),
            },
            &self.clock,
            self.settings.eod_rush_threshold,
        ))
    }

    fn bank_and_strategic_collateral(&mut self, tick: usize) -> Result<(), TickError> {
        for agent_id in self.state.agent_ids() {
            self.run_bank_tree(&agent_id, tick)?;
            self.run_collateral_tree(&agent_id, TreeKind::StrategicCollateral, tick)?;
        }
        Ok(())
    }

    fn end_of_tick_collateral(&mut self, tick: usize) -> Result<(), TickError> {
        for agent_id in self.state.agent_ids() {
            self.run_collateral_tree(&agent_id, TreeKind::EndOfTickCollateral, tick)?;
        }
        Ok(())
    }

    fn run_bank_tree(&mut self, agent_id: &str, tick: usize) -> Result<(), TickError> {
        let Some(policy) = self.policies.get(agent_id) else {
            return Ok(());
        };
        let Some(root) = policy.bank_tree.clone() else {
            return Ok(());
        };
        let params = policy.parameters.clone();
        let ctx = self.agent_context(agent_id)?;
        let outcome = evaluate_tree(&root, &ctx, &params).map_err(|source| {
            TickError::PolicyEvaluation {
                agent: agent_id.to_string(),
                source,
            }
        })?;
        match outcome.action {
            ActionKind::SetReleaseBudget => {
                let budget = outcome.int_arg("budget").unwrap_or(0).max(0);
                self.state
                    .agent_mut(agent_id)
                    .ok_or_else(|| TickError::UnknownAgent(agent_id.to_string()))?
                    .set_release_budget(Some(budget));
                self.emit(Event::BankBudgetSet {
                    tick,
                    agent_id: agent_id.to_string(),
                    budget,
                });
            }
            ActionKind::SetStateRegister => {
                let register = outcome
                    .register
                    .clone()
                    .ok_or_else(|| TickError::Internal("SetStateRegister without register".into()))?;
                let value = outcome.int_arg("value").unwrap_or(0);
                self.state
                    .agent_mut(agent_id)
                    .ok_or_else(|| TickError::UnknownAgent(agent_id.to_string()))?
                    .set_register(&register, value);
                self.emit(Event::StateRegisterSet {
                    tick,
                    agent_id: agent_id.to_string(),
                    register,
                    value,
                });
            }
            // Hold is the bank tree's no-op leaf.
            _ => {}
        }
        Ok(())
    }

    fn run_collateral_tree(
        &mut self,
        agent_id: &str,
        kind: TreeKind,
        tick: usize,
    ) -> Result<(), TickError> {
        let Some(policy) = self.policies.get(agent_id) else {
            return Ok(());
        };
        let Some(root) = policy.tree(kind).cloned() else {
            return Ok(());
        };
        let params = policy.parameters.clone();
        let ctx = self.agent_context(agent_id)?;
        let outcome = evaluate_tree(&root, &ctx, &params).map_err(|source| {
            TickError::PolicyEvaluation {
                agent: agent_id.to_string(),
                source,
            }
        })?;

        let pending = self.state.pending_outflows(agent_id);
        let settings = self.settings.collateral.clone();
        let agent = self
            .state
            .agent_mut(agent_id)
            .ok_or_else(|| TickError::UnknownAgent(agent_id.to_string()))?;

        match outcome.action {
            ActionKind::PostCollateral => {
                let amount = outcome.int_arg("amount").unwrap_or(0);
                match collateral::try_post(agent, amount, pending, tick, &settings) {
                    CollateralOutcome::Posted {
                        amount,
                        total_posted,
                        headroom_delta,
                    } => {
                        self.emit(Event::CollateralPosted {
                            tick,
                            agent_id: agent_id.to_string(),
                            amount,
                            reason: format!("policy:{}", outcome.node_id),
                            total_posted,
                            headroom_delta,
                        });
                        self.pending_releases
                            .push((agent_id.to_string(), ReleaseReason::CollateralPosted));
                    }
                    // Refusal is an implied hold: no event.
                    _ => {}
                }
            }
            ActionKind::WithdrawCollateral => {
                let amount = outcome.int_arg("amount").unwrap_or(0);
                match collateral::try_withdraw(agent, amount, pending, tick, &settings) {
                    CollateralOutcome::Withdrawn {
                        amount,
                        total_posted,
                        headroom_delta,
                        ticks_held,
                    } => {
                        self.emit(Event::CollateralWithdrawn {
                            tick,
                            agent_id: agent_id.to_string(),
                            amount,
                            reason: format!("policy:{}", outcome.node_id),
                            total_posted,
                            headroom_delta,
                            ticks_held,
                        });
                    }
                    _ => {}
                }
            }
            // HoldCollateral: leave it as it is.
            _ => {}
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Phase 4: Q1 walk
    // ------------------------------------------------------------------

    fn walk_queue1(&mut self, tick: usize) -> Result<Vec<TxId>, TickError> {
        let mut submissions = Vec::new();
        for agent_id in self.state.agent_ids() {
            let snapshot = {
                let agent = self
                    .state
                    .agent(&agent_id)
                    .ok_or_else(|| TickError::UnknownAgent(agent_id.clone()))?;
                order_queue1(&self.state, agent.queue1(), self.settings.queue1_ordering)
            };
            for tx_id in snapshot {
                if !matches!(
                    self.state.tx(tx_id).status(),
                    crate::model::transaction::TxStatus::InQueue1
                ) {
                    continue;
                }
                self.decide_payment(&agent_id, tx_id, tick, &mut submissions)?;
            }
        }
        Ok(submissions)
    }

    fn decide_payment(
        &mut self,
        agent_id: &str,
        tx_id: TxId,
        tick: usize,
        submissions: &mut Vec<TxId>,
    ) -> Result<(), TickError> {
        // No policy or no payment tree: release everything (FIFO baseline).
        let decision = match self.policies.get(agent_id) {
            Some(policy) if policy.payment_tree.is_some() => {
                let root = policy.payment_tree.clone().expect("checked");
                let params = policy.parameters.clone();
                let agent = self
                    .state
                    .agent(agent_id)
                    .ok_or_else(|| TickError::UnknownAgent(agent_id.to_string()))?;
                let ctx = EvalContext::for_payment(
                    self.state.tx(tx_id),
                    agent,
                    AgentSnapshot {
                        q2_count: self.state.queue2_count_for_sender(agent_id),
                        pending_outflows: self.state.pending_outflows(agent_id),
                    },
                    &self.clock,
                    self.settings.eod_rush_threshold,
                );
                Some(evaluate_tree(&root, &ctx, &params).map_err(|source| {
                    TickError::PolicyEvaluation {
                        agent: agent_id.to_string(),
                        source,
                    }
                })?)
            }
            _ => None,
        };

        let external_id = self.state.tx(tx_id).external_id().to_string();
        let (action, node_id, outcome) = match &decision {
            Some(o) => (o.action, o.node_id.clone(), Some(o)),
            None => (ActionKind::Release, String::new(), None),
        };

        match action {
            ActionKind::Release => {
                if !self.consume_budget(agent_id)? {
                    self.emit(Event::PolicyHold {
                        tick,
                        agent_id: agent_id.to_string(),
                        tx_id: external_id,
                        reason: "budget_exhausted".to_string(),
                    });
                    return Ok(());
                }
                self.remove_from_queue1(agent_id, tx_id)?;
                self.state.tx_mut(tx_id).mark_submitted();
                submissions.push(tx_id);
                self.emit(Event::PolicySubmit {
                    tick,
                    agent_id: agent_id.to_string(),
                    tx_id: external_id,
                });
            }
            ActionKind::Hold => {
                self.emit(Event::PolicyHold {
                    tick,
                    agent_id: agent_id.to_string(),
                    tx_id: external_id,
                    reason: format!("policy:{}", node_id),
                });
            }
            ActionKind::Drop => {
                self.remove_from_queue1(agent_id, tx_id)?;
                self.state.tx_mut(tx_id).drop_transaction(tick);
                self.emit(Event::PolicyDrop {
                    tick,
                    agent_id: agent_id.to_string(),
                    tx_id: external_id,
                    reason: format!("policy:{}", node_id),
                });
            }
            ActionKind::Split | ActionKind::StaggerSplit => {
                let o = outcome.expect("split decisions always come from a tree");
                self.apply_split(agent_id, tx_id, tick, o.clone(), submissions)?;
            }
            // Remaining actions are unreachable: validation rejects them
            // for the payment tree.
            _ => {}
        }
        Ok(())
    }

    fn consume_budget(&mut self, agent_id: &str) -> Result<bool, TickError> {
        Ok(self
            .state
            .agent_mut(agent_id)
            .ok_or_else(|| TickError::UnknownAgent(agent_id.to_string()))?
            .consume_release_budget())
    }

    fn remove_from_queue1(&mut self, agent_id: &str, tx_id: TxId) -> Result<(), TickError> {
        self.state
            .agent_mut(agent_id)
            .ok_or_else(|| TickError::UnknownAgent(agent_id.to_string()))?
            .remove_from_queue1(tx_id);
        Ok(())
    }

    fn apply_split(
        &mut self,
        agent_id: &str,
        tx_id: TxId,
        tick: usize,
        outcome: crate::policy::Outcome,
        submissions: &mut Vec<TxId>,
    ) -> Result<(), TickError> {
        let external_id = self.state.tx(tx_id).external_id().to_string();
        let staggered = outcome.action == ActionKind::StaggerSplit;

        if !self.state.tx(tx_id).is_divisible() {
            self.emit(Event::PolicyHold {
                tick,
                agent_id: agent_id.to_string(),
                tx_id: external_id,
                reason: "non_divisible".to_string(),
            });
            return Ok(());
        }
        let num_splits = outcome.int_arg("num_splits").unwrap_or(0);
        if num_splits < 2 || self.state.tx(tx_id).remaining_amount() < num_splits {
            self.emit(Event::PolicyHold {
                tick,
                agent_id: agent_id.to_string(),
                tx_id: external_id,
                reason: "invalid_split".to_string(),
            });
            return Ok(());
        }
        if !self.consume_budget(agent_id)? {
            self.emit(Event::PolicyHold {
                tick,
                agent_id: agent_id.to_string(),
                tx_id: external_id,
                reason: "budget_exhausted".to_string(),
            });
            return Ok(());
        }

        let n = num_splits as usize;
        let (remaining, parent_priority) = {
            let parent = self.state.tx(tx_id);
            (parent.remaining_amount(), parent.priority())
        };
        let base = remaining / num_splits;
        let boost = if staggered {
            outcome.int_arg("priority_boost_children").unwrap_or(0).max(0) as u8
        } else {
            0
        };
        let child_priority = parent_priority.saturating_add(boost).min(10);
        let gap = outcome
            .int_arg("stagger_gap_ticks")
            .unwrap_or(1)
            .max(1) as usize;
        let first_immediate = outcome.int_arg("first_child_immediate").unwrap_or(1) != 0;

        // First n-1 children take floor(remaining / n); the last absorbs
        // the remainder so the amounts sum exactly.
        let mut child_ids = Vec::with_capacity(n);
        for i in 0..n {
            let amount = if i == n - 1 {
                remaining - base * (num_splits - 1)
            } else {
                base
            };
            let child_external = self.next_tx_id();
            let child = {
                let parent = self.state.tx(tx_id);
                Transaction::new_split_child(child_external.clone(), parent, amount, child_priority)
            };
            let child_id = self.state.insert_tx(child).map_err(TickError::Transaction)?;
            child_ids.push(child_external);

            if !staggered {
                submissions.push(child_id);
            } else {
                let offset = if first_immediate { i } else { i + 1 };
                if offset == 0 {
                    submissions.push(child_id);
                } else {
                    self.state.schedule_queue1_entry(tick + offset * gap, child_id);
                }
            }
        }

        self.remove_from_queue1(agent_id, tx_id)?;
        self.state.tx_mut(tx_id).retire_as_split_parent(tick);

        let friction = self
            .settings
            .cost_rates
            .split_friction_per_child
            .checked_mul(num_splits)
            .ok_or(ArithmeticError::Overflow)?;
        self.tick_costs
            .entry(agent_id.to_string())
            .or_default()
            .split_friction += friction;

        self.emit(Event::PolicySplit {
            tick,
            agent_id: agent_id.to_string(),
            tx_id: external_id,
            num_splits: n,
            child_ids,
            staggered,
        });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Phase 5: RTGS submissions
    // ------------------------------------------------------------------

    fn settle_submissions(
        &mut self,
        submissions: Vec<TxId>,
        tick: usize,
    ) -> Result<(), TickError> {
        for tx_id in submissions {
            match rtgs::admission_check(&self.state, tx_id)? {
                None => {
                    let result = rtgs::settle_gross(
                        &mut self.state,
                        tx_id,
                        tick,
                        self.settings.deferred_crediting,
                    )?;
                    let tx = self.state.tx(tx_id);
                    let sender = tx.sender_id().to_string();
                    let receiver = tx.receiver_id().to_string();
                    let external = tx.external_id().to_string();
                    let overdue_since = tx.overdue_since_tick();
                    self.emit(Event::RtgsImmediateSettlement {
                        tick,
                        tx_id: external.clone(),
                        sender_id: sender,
                        receiver_id: receiver.clone(),
                        amount: result.amount,
                        sender_balance_before: result.sender_balance_before,
                        sender_balance_after: result.sender_balance_after,
                    });
                    if let Some(since) = overdue_since {
                        self.emit(Event::OverdueTransactionSettled {
                            tick,
                            tx_id: external,
                            agent_id: self.state.tx(tx_id).sender_id().to_string(),
                            ticks_overdue: tick.saturating_sub(since),
                        });
                    }
                    if !self.settings.deferred_crediting {
                        self.pending_releases
                            .push((receiver, ReleaseReason::IncomingPayment));
                    }
                }
                Some(reason) => {
                    let (external, sender, receiver) = {
                        let tx = self.state.tx(tx_id);
                        (
                            tx.external_id().to_string(),
                            tx.sender_id().to_string(),
                            tx.receiver_id().to_string(),
                        )
                    };
                    self.state.tx_mut(tx_id).place_in_queue2(tick, reason);
                    self.state.push_queue2(tx_id);
                    self.emit(Event::RtgsQueued {
                        tick,
                        tx_id: external,
                        sender_id: sender.clone(),
                        reason,
                    });
                    if self.settings.entry_disposition_offsetting {
                        let (events, offset_any) = lsm::entry_offset(
                            &mut self.state,
                            tx_id,
                            tick,
                            self.settings.priority_escalation.as_ref(),
                        )?;
                        self.emit_all(events);
                        if offset_any {
                            self.pending_releases
                                .push((sender, ReleaseReason::Q2EntryOffset));
                            self.pending_releases
                                .push((receiver, ReleaseReason::Q2EntryOffset));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Phases 6/7: LSM and release cascades
    // ------------------------------------------------------------------

    fn drain_releases(&mut self, tick: usize) -> Result<(), TickError> {
        if self.pending_releases.is_empty() {
            return Ok(());
        }
        let triggers = std::mem::take(&mut self.pending_releases);
        let escalation = self.settings.priority_escalation;
        let cfg = CascadeConfig {
            escalation: escalation.as_ref(),
            deferred_crediting: self.settings.deferred_crediting,
            max_settlements: MAX_CASCADE_SETTLEMENTS,
        };
        let mut events = Vec::new();
        run_cascade(&mut self.state, triggers, tick, &cfg, &mut events)?;
        self.emit_all(events);
        Ok(())
    }

    fn run_lsm(&mut self, tick: usize) -> Result<(), TickError> {
        let escalation = self.settings.priority_escalation;
        let sequenced = self.settings.algorithm_sequencing;

        if self.settings.lsm.enable_bilateral && !self.state.queue2().is_empty() {
            let events = lsm::bilateral_pass(&mut self.state, tick, escalation.as_ref())?;
            self.emit_all(events);
            if !sequenced {
                // Netting frees no liquidity, so offsets trigger no
                // releases; this drain only serves cascades still pending
                // from the submission phase or entry offsets.
                self.drain_releases(tick)?;
            }
        }

        if self.settings.lsm.enable_cycles && !self.state.queue2().is_empty() {
            let events =
                lsm::cycle_pass(&mut self.state, tick, &self.settings.lsm, escalation.as_ref())?;
            self.emit_all(events);
            if !sequenced {
                self.drain_releases(tick)?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Phase 9: deferred crediting
    // ------------------------------------------------------------------

    fn apply_deferred_credits(&mut self, tick: usize) -> Result<(), TickError> {
        if self.settings.deferred_crediting {
            for agent_id in self.state.agent_ids() {
                let amount = self
                    .state
                    .agent_mut(&agent_id)
                    .ok_or_else(|| TickError::UnknownAgent(agent_id.clone()))?
                    .take_deferred_credits();
                if amount > 0 {
                    self.state
                        .agent_mut(&agent_id)
                        .expect("agent exists")
                        .credit(amount);
                    self.emit(Event::DeferredCreditApplied {
                        tick,
                        agent_id: agent_id.clone(),
                        amount,
                    });
                    self.pending_releases
                        .push((agent_id, ReleaseReason::NewLiquidity));
                }
            }
        }
        // Also drains triggers left by phase-8 collateral posts.
        self.drain_releases(tick)
    }

    // ------------------------------------------------------------------
    // Phase 10: overdue scan
    // ------------------------------------------------------------------

    fn scan_overdue(&mut self, tick: usize) {
        let mut newly_overdue: Vec<TxId> = Vec::new();
        for agent_id in self.state.agent_ids() {
            if let Some(agent) = self.state.agent(&agent_id) {
                for tx_id in agent.queue1() {
                    let tx = self.state.tx(*tx_id);
                    if tx.is_live() && tx.is_past_deadline(tick) && !tx.is_overdue() {
                        newly_overdue.push(*tx_id);
                    }
                }
            }
        }
        for tx_id in self.state.queue2().to_vec() {
            let tx = self.state.tx(tx_id);
            if tx.is_live() && tx.is_past_deadline(tick) && !tx.is_overdue() {
                newly_overdue.push(tx_id);
            }
        }

        let penalty = self.settings.cost_rates.deadline_penalty;
        for tx_id in newly_overdue {
            self.state.tx_mut(tx_id).mark_overdue(tick);
            let (external, sender, deadline) = {
                let tx = self.state.tx(tx_id);
                (
                    tx.external_id().to_string(),
                    tx.sender_id().to_string(),
                    tx.deadline_tick(),
                )
            };
            self.tick_costs
                .entry(sender.clone())
                .or_default()
                .deadline_penalty += penalty;
            self.emit(Event::TransactionWentOverdue {
                tick,
                tx_id: external,
                agent_id: sender,
                deadline_tick: deadline,
            });
        }
    }

    // ------------------------------------------------------------------
    // Phase 11: cost accrual
    // ------------------------------------------------------------------

    fn accrue_costs(&mut self, tick: usize) -> Result<(), TickError> {
        let rates = self.settings.cost_rates.clone();
        for agent_id in self.state.agent_ids() {
            let mut costs = self
                .tick_costs
                .remove(&agent_id)
                .unwrap_or_default();

            let (credit_used, posted) = {
                let agent = self
                    .state
                    .agent(&agent_id)
                    .ok_or_else(|| TickError::UnknownAgent(agent_id.clone()))?;
                (agent.credit_used(), agent.posted_collateral())
            };
            costs.liquidity = add_cents(costs.liquidity, rates.liquidity_cost(credit_used)?)?;
            costs.collateral = add_cents(costs.collateral, rates.collateral_cost(posted)?)?;

            let mut delay = 0i64;
            if let Some(agent) = self.state.agent(&agent_id) {
                for tx_id in agent.queue1() {
                    let tx = self.state.tx(*tx_id);
                    delay =
                        add_cents(delay, rates.delay_cost(tx.remaining_amount(), tx.is_overdue())?)?;
                }
            }
            for tx_id in self.state.queue2_for_sender(&agent_id) {
                let tx = self.state.tx(tx_id);
                delay =
                    add_cents(delay, rates.delay_cost(tx.remaining_amount(), tx.is_overdue())?)?;
            }
            costs.delay = add_cents(costs.delay, delay)?;

            if !costs.is_zero() {
                self.state
                    .agent_mut(&agent_id)
                    .ok_or_else(|| TickError::UnknownAgent(agent_id.clone()))?
                    .costs_mut()
                    .add(&costs);
                self.day.costs += costs.total();
                self.emit(Event::CostAccrual {
                    tick,
                    agent_id,
                    costs,
                });
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Phase 12: end of day
    // ------------------------------------------------------------------

    fn end_of_day(&mut self, tick: usize) {
        let day = self.clock.current_day();
        let stats = self.day;
        self.emit(Event::EndOfDay {
            tick,
            day,
            settled_count: stats.settlements,
            settled_value: stats.settled_value,
            unsettled_q1: self.state.total_queue1_len(),
            unsettled_q2: self.state.queue2_len(),
            overdue_count: self.state.overdue_count(),
            day_costs: stats.costs,
        });
        for agent_id in self.state.agent_ids() {
            if let Some(agent) = self.state.agent_mut(&agent_id) {
                agent.reset_daily_limits();
            }
            // Restored limit capacity can unblock queued payments; the
            // wake-up is drained on the next tick's first cascade.
            if self.state.queue2_count_for_sender(&agent_id) > 0 {
                self.pending_releases
                    .push((agent_id, ReleaseReason::NewLiquidity));
            }
        }
        self.day = DayStats::default();
    }
}
