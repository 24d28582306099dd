//! Scenario configuration and validation.
//!
//! The engine consumes a validated [`Scenario`] object; file parsing (YAML,
//! JSON, CLI) is an external concern. Validation runs before any tick and
//! collects every violation into one structured error, so a bad scenario
//! never half-runs.

use crate::arrivals::{ArrivalBands, ArrivalConfig, ArrivalProfile};
use crate::costs::CostRates;
use crate::num::Ratio;
use crate::policy::{validate_policy, PolicyDef};
use crate::queues::{PriorityEscalation, Queue1Ordering};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ScenarioError {
    #[error("scenario validation failed with {} issue(s): {}", .0.len(), .0.join("; "))]
    Invalid(Vec<String>),

    #[error("unknown agent: {0}")]
    UnknownAgent(String),

    #[error("duplicate transaction id: {0}")]
    DuplicateTransactionId(String),
}

/// LSM configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LsmConfig {
    pub enable_bilateral: bool,
    pub enable_cycles: bool,
    /// Longest simple cycle to search for; valid range 3..=10.
    pub max_cycle_length: usize,
    /// Cap on cycles applied per tick.
    pub max_cycles_per_tick: usize,
}

impl Default for LsmConfig {
    fn default() -> Self {
        Self {
            enable_bilateral: true,
            enable_cycles: true,
            max_cycle_length: 4,
            max_cycles_per_tick: 10,
        }
    }
}

/// Collateral-manager settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollateralSettings {
    /// Ticks collateral must be held before a policy withdrawal.
    pub min_holding_ticks: usize,
    /// Post only when `liquidity_gap / pending_outflows` exceeds this.
    pub posting_threshold_pct: Ratio,
    /// Withdraw only when `excess_liquidity / pending_outflows` exceeds this.
    pub withdrawal_threshold_pct: Ratio,
}

impl Default for CollateralSettings {
    fn default() -> Self {
        Self {
            min_holding_ticks: 5,
            posting_threshold_pct: Ratio::new(1, 10).expect("const"),
            withdrawal_threshold_pct: Ratio::new(1, 5).expect("const"),
        }
    }
}

/// Global engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalSettings {
    #[serde(default)]
    pub queue1_ordering: Queue1Ordering,

    #[serde(default)]
    pub priority_escalation: Option<PriorityEscalation>,

    #[serde(default)]
    pub lsm: LsmConfig,

    #[serde(default)]
    pub cost_rates: CostRates,

    #[serde(default)]
    pub collateral: CollateralSettings,

    /// Strict phase order (queue pass, bilateral, multilateral) with a
    /// single release cascade at the end; otherwise cascades interleave
    /// with the LSM phases.
    #[serde(default)]
    pub algorithm_sequencing: bool,

    /// Attempt a bilateral check when a transaction enters Q2.
    #[serde(default)]
    pub entry_disposition_offsetting: bool,

    /// Credits accumulate during the tick and land at end of tick.
    #[serde(default)]
    pub deferred_crediting: bool,

    /// Day fraction at which `is_eod_rush` turns on, in [0, 1].
    #[serde(default = "default_eod_rush_threshold")]
    pub eod_rush_threshold: Ratio,

    /// Cap generated deadlines at the last tick of the arrival's day.
    #[serde(default)]
    pub deadline_cap_at_eod: bool,
}

fn default_eod_rush_threshold() -> Ratio {
    Ratio::new(4, 5).expect("const")
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            queue1_ordering: Queue1Ordering::Fifo,
            priority_escalation: None,
            lsm: LsmConfig::default(),
            cost_rates: CostRates::default(),
            collateral: CollateralSettings::default(),
            algorithm_sequencing: false,
            entry_disposition_offsetting: false,
            deferred_crediting: false,
            eod_rush_threshold: default_eod_rush_threshold(),
            deadline_cap_at_eod: false,
        }
    }
}

/// Per-agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSpec {
    pub id: String,
    pub opening_balance: i64,

    #[serde(default)]
    pub credit_limit: i64,

    #[serde(default)]
    pub posted_collateral: i64,

    #[serde(default)]
    pub collateral_haircut: Ratio,

    #[serde(default)]
    pub collateral_capacity: Option<i64>,

    /// Daily sending caps per counterparty.
    #[serde(default)]
    pub bilateral_limits: BTreeMap<String, i64>,

    /// Daily cap on total gross outflow.
    #[serde(default)]
    pub multilateral_limit: Option<i64>,

    #[serde(default)]
    pub arrival_config: Option<ArrivalConfig>,

    #[serde(default)]
    pub arrival_bands: Option<ArrivalBands>,

    #[serde(default)]
    pub policy: Option<PolicyDef>,
}

impl AgentSpec {
    pub fn new(id: &str, opening_balance: i64, credit_limit: i64) -> Self {
        Self {
            id: id.to_string(),
            opening_balance,
            credit_limit,
            posted_collateral: 0,
            collateral_haircut: Ratio::ZERO,
            collateral_capacity: None,
            bilateral_limits: BTreeMap::new(),
            multilateral_limit: None,
            arrival_config: None,
            arrival_bands: None,
            policy: None,
        }
    }

    pub fn arrival_profile(&self) -> Option<ArrivalProfile> {
        match (&self.arrival_config, &self.arrival_bands) {
            (Some(cfg), None) => Some(ArrivalProfile::Single(cfg.clone())),
            (None, Some(bands)) => Some(ArrivalProfile::Banded(bands.clone())),
            _ => None,
        }
    }
}

/// An out-of-band transaction arrival, injected by the control surface or
/// a scheduled scenario event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomArrival {
    /// Explicit external id; generated if absent.
    #[serde(default)]
    pub id: Option<String>,
    pub sender_id: String,
    pub receiver_id: String,
    pub amount: i64,
    #[serde(default = "default_priority")]
    pub priority: u8,
    /// Absolute deadline tick.
    pub deadline_tick: usize,
    #[serde(default)]
    pub divisible: bool,
}

fn default_priority() -> u8 {
    5
}

/// Scheduled external disturbances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScenarioEvent {
    /// Move funds between agents, bypassing settlement.
    DirectTransfer {
        from_agent: String,
        to_agent: String,
        amount: i64,
    },

    /// Inject a specific transaction into the sender's Q1.
    CustomTransactionArrival { arrival: CustomArrival },

    /// Unconditional collateral delta (not gated by hysteresis).
    CollateralAdjustment { agent: String, delta: i64 },

    /// Multiply every agent's arrival rate, relative to the base scenario.
    GlobalArrivalRateChange { multiplier: f64 },

    /// Multiply one agent's arrival rate, relative to the base scenario.
    AgentArrivalRateChange { agent: String, multiplier: f64 },

    /// Re-weight one counterparty in an agent's arrival profile.
    CounterpartyWeightChange {
        agent: String,
        counterparty: String,
        new_weight: f64,
        auto_balance_others: bool,
    },

    /// Scale deadline windows, relative to the base scenario.
    DeadlineWindowChange {
        min_ticks_multiplier: Option<f64>,
        max_ticks_multiplier: Option<f64>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventSchedule {
    OneTime { tick: usize },
    Repeating { start_tick: usize, interval: usize },
}

impl EventSchedule {
    pub fn should_fire(&self, tick: usize) -> bool {
        match self {
            EventSchedule::OneTime { tick: at } => tick == *at,
            EventSchedule::Repeating {
                start_tick,
                interval,
            } => tick >= *start_tick && (tick - start_tick) % interval == 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledEvent {
    pub event: ScenarioEvent,
    pub schedule: EventSchedule,
}

/// The complete validated input to [`crate::Orchestrator::new`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    pub ticks_per_day: usize,
    pub num_days: usize,
    pub rng_seed: u64,
    pub agents: Vec<AgentSpec>,

    #[serde(default)]
    pub settings: GlobalSettings,

    #[serde(default)]
    pub scenario_events: Vec<ScheduledEvent>,
}

impl Scenario {
    /// Minimal scenario for tests and examples: agents only, defaults
    /// everywhere else.
    pub fn with_agents(ticks_per_day: usize, num_days: usize, agents: Vec<AgentSpec>) -> Self {
        Self {
            ticks_per_day,
            num_days,
            rng_seed: 42,
            agents,
            settings: GlobalSettings::default(),
            scenario_events: Vec::new(),
        }
    }

    /// Full validation pass. Every violation is collected; nothing runs
    /// on a scenario that fails here.
    pub fn validate(&self) -> Result<(), ScenarioError> {
        let mut issues = Vec::new();

        if self.ticks_per_day == 0 {
            issues.push("ticks_per_day must be > 0".to_string());
        }
        if self.num_days == 0 {
            issues.push("num_days must be > 0".to_string());
        }
        if self.agents.is_empty() {
            issues.push("at least one agent is required".to_string());
        }

        let mut ids = BTreeSet::new();
        for spec in &self.agents {
            if !ids.insert(spec.id.as_str()) {
                issues.push(format!("duplicate agent id: {}", spec.id));
            }
        }

        for spec in &self.agents {
            let tag = &spec.id;
            if spec.credit_limit < 0 {
                issues.push(format!("{}: credit_limit must be >= 0", tag));
            }
            if spec.posted_collateral < 0 {
                issues.push(format!("{}: posted_collateral must be >= 0", tag));
            }
            if spec.collateral_haircut < Ratio::ZERO || spec.collateral_haircut > Ratio::ONE {
                issues.push(format!("{}: collateral_haircut must be within [0, 1]", tag));
            }
            if let Some(cap) = spec.collateral_capacity {
                if cap < spec.posted_collateral {
                    issues.push(format!(
                        "{}: collateral_capacity below opening posted_collateral",
                        tag
                    ));
                }
            }
            if spec.arrival_config.is_some() && spec.arrival_bands.is_some() {
                issues.push(format!(
                    "{}: arrival_config and arrival_bands are mutually exclusive",
                    tag
                ));
            }
            if let Some(cfg) = &spec.arrival_config {
                if !cfg.rate_per_tick.is_finite() || cfg.rate_per_tick < 0.0 {
                    issues.push(format!("{}: rate_per_tick must be finite and >= 0", tag));
                }
                self.check_weights(tag, &cfg.counterparty_weights, &ids, &mut issues);
            }
            if let Some(bands) = &spec.arrival_bands {
                for band in [&bands.urgent, &bands.normal, &bands.low]
                    .into_iter()
                    .flatten()
                {
                    if !band.rate_per_tick.is_finite() || band.rate_per_tick < 0.0 {
                        issues.push(format!("{}: rate_per_tick must be finite and >= 0", tag));
                    }
                    self.check_weights(tag, &band.counterparty_weights, &ids, &mut issues);
                }
            }
            for counterparty in spec.bilateral_limits.keys() {
                if !ids.contains(counterparty.as_str()) {
                    issues.push(format!(
                        "{}: bilateral limit references unknown counterparty {}",
                        tag, counterparty
                    ));
                }
            }
            if let Some(limit) = spec.multilateral_limit {
                if limit < 0 {
                    issues.push(format!("{}: multilateral_limit must be >= 0", tag));
                }
            }
            if let Some(policy) = &spec.policy {
                if let Err(errors) = validate_policy(policy) {
                    for e in errors {
                        issues.push(format!("{}: policy '{}': {}", tag, policy.policy_id, e));
                    }
                }
            }
        }

        let lsm = &self.settings.lsm;
        if !(3..=10).contains(&lsm.max_cycle_length) {
            issues.push("lsm.max_cycle_length must be within [3, 10]".to_string());
        }
        if lsm.max_cycles_per_tick == 0 {
            issues.push("lsm.max_cycles_per_tick must be >= 1".to_string());
        }

        let rush = self.settings.eod_rush_threshold;
        if rush < Ratio::ZERO || rush > Ratio::ONE {
            issues.push("eod_rush_threshold must be within [0, 1]".to_string());
        }

        for scheduled in &self.scenario_events {
            if let EventSchedule::Repeating { interval, .. } = scheduled.schedule {
                if interval == 0 {
                    issues.push("repeating scenario event interval must be > 0".to_string());
                }
            }
            for agent in scheduled.event.referenced_agents() {
                if !ids.contains(agent) {
                    issues.push(format!("scenario event references unknown agent {}", agent));
                }
            }
            if let ScenarioEvent::CustomTransactionArrival { arrival } = &scheduled.event {
                if arrival.amount <= 0 {
                    issues.push("custom arrival amount must be > 0".to_string());
                }
                if arrival.sender_id == arrival.receiver_id {
                    issues.push("custom arrival sender and receiver must differ".to_string());
                }
            }
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(ScenarioError::Invalid(issues))
        }
    }

    fn check_weights(
        &self,
        tag: &str,
        weights: &BTreeMap<String, f64>,
        ids: &BTreeSet<&str>,
        issues: &mut Vec<String>,
    ) {
        for (counterparty, weight) in weights {
            if !ids.contains(counterparty.as_str()) {
                issues.push(format!(
                    "{}: counterparty weight references unknown agent {}",
                    tag, counterparty
                ));
            }
            if *weight < 0.0 || !weight.is_finite() {
                issues.push(format!(
                    "{}: counterparty weight for {} must be finite and >= 0",
                    tag, counterparty
                ));
            }
        }
    }
}

impl ScenarioEvent {
    /// Agent ids this event targets, for validation.
    fn referenced_agents(&self) -> Vec<&str> {
        match self {
            ScenarioEvent::DirectTransfer {
                from_agent,
                to_agent,
                ..
            } => vec![from_agent, to_agent],
            ScenarioEvent::CustomTransactionArrival { arrival } => {
                vec![&arrival.sender_id, &arrival.receiver_id]
            }
            ScenarioEvent::CollateralAdjustment { agent, .. }
            | ScenarioEvent::AgentArrivalRateChange { agent, .. } => vec![agent],
            ScenarioEvent::CounterpartyWeightChange {
                agent,
                counterparty,
                ..
            } => vec![agent, counterparty],
            ScenarioEvent::GlobalArrivalRateChange { .. }
            | ScenarioEvent::DeadlineWindowChange { .. } => Vec::new(),
        }
    }

    /// Human-readable description for the `ScenarioEventApplied` payload.
    pub fn describe(&self) -> String {
        match self {
            ScenarioEvent::DirectTransfer {
                from_agent,
                to_agent,
                amount,
            } => format!("direct transfer {} -> {} of {}", from_agent, to_agent, amount),
            ScenarioEvent::CustomTransactionArrival { arrival } => format!(
                "custom arrival {} -> {} of {}",
                arrival.sender_id, arrival.receiver_id, arrival.amount
            ),
            ScenarioEvent::CollateralAdjustment { agent, delta } => {
                format!("collateral adjustment for {} of {}", agent, delta)
            }
            ScenarioEvent::GlobalArrivalRateChange { multiplier } => {
                format!("global arrival rate x{}", multiplier)
            }
            ScenarioEvent::AgentArrivalRateChange { agent, multiplier } => {
                format!("arrival rate for {} x{}", agent, multiplier)
            }
            ScenarioEvent::CounterpartyWeightChange {
                agent,
                counterparty,
                new_weight,
                ..
            } => format!(
                "counterparty weight {} -> {} set to {}",
                agent, counterparty, new_weight
            ),
            ScenarioEvent::DeadlineWindowChange {
                min_ticks_multiplier,
                max_ticks_multiplier,
            } => format!(
                "deadline window scaled (min x{:?}, max x{:?})",
                min_ticks_multiplier, max_ticks_multiplier
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arrivals::AmountDistribution;

    fn base_scenario() -> Scenario {
        Scenario::with_agents(
            100,
            1,
            vec![
                AgentSpec::new("BANK_A", 1_000_000, 0),
                AgentSpec::new("BANK_B", 1_000_000, 0),
            ],
        )
    }

    #[test]
    fn valid_scenario_passes() {
        assert!(base_scenario().validate().is_ok());
    }

    #[test]
    fn rejects_zero_ticks_and_days() {
        let mut s = base_scenario();
        s.ticks_per_day = 0;
        s.num_days = 0;
        let err = s.validate().unwrap_err();
        match err {
            ScenarioError::Invalid(issues) => assert_eq!(issues.len(), 2),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn rejects_duplicate_agents() {
        let mut s = base_scenario();
        s.agents.push(AgentSpec::new("BANK_A", 0, 0));
        assert!(matches!(s.validate(), Err(ScenarioError::Invalid(_))));
    }

    #[test]
    fn rejects_both_arrival_forms() {
        let mut s = base_scenario();
        s.agents[0].arrival_config = Some(ArrivalConfig {
            rate_per_tick: 1.0,
            amount: AmountDistribution::Uniform {
                min: 100,
                max: 200,
            },
            counterparty_weights: BTreeMap::new(),
            deadline_range: (1, 5),
            priority: Default::default(),
            divisible: false,
        });
        s.agents[0].arrival_bands = Some(ArrivalBands::default());
        let err = s.validate().unwrap_err();
        match err {
            ScenarioError::Invalid(issues) => {
                assert!(issues.iter().any(|i| i.contains("mutually exclusive")))
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn rejects_unknown_counterparty_weight() {
        let mut s = base_scenario();
        let mut weights = BTreeMap::new();
        weights.insert("BANK_Z".to_string(), 1.0);
        s.agents[0].arrival_config = Some(ArrivalConfig {
            rate_per_tick: 1.0,
            amount: AmountDistribution::Uniform {
                min: 100,
                max: 200,
            },
            counterparty_weights: weights,
            deadline_range: (1, 5),
            priority: Default::default(),
            divisible: false,
        });
        let err = s.validate().unwrap_err();
        match err {
            ScenarioError::Invalid(issues) => {
                assert!(issues.iter().any(|i| i.contains("BANK_Z")))
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn rejects_lsm_bounds() {
        let mut s = base_scenario();
        s.settings.lsm.max_cycle_length = 2;
        s.settings.lsm.max_cycles_per_tick = 0;
        let err = s.validate().unwrap_err();
        match err {
            ScenarioError::Invalid(issues) => assert_eq!(issues.len(), 2),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn rejects_bad_policy_with_context() {
        let mut s = base_scenario();
        s.agents[0].policy = Some(
            serde_json::from_str(
                r#"{
                "policy_id": "broken",
                "payment_tree": {
                    "node_id": "N1",
                    "type": "condition",
                    "condition": {"op": ">", "left": {"field": "ghost"}, "right": {"value": 0}},
                    "on_true": {"node_id": "A1", "type": "action", "action": "Release"},
                    "on_false": {"node_id": "A2", "type": "action", "action": "Hold"}
                }
            }"#,
            )
            .unwrap(),
        );
        let err = s.validate().unwrap_err();
        match err {
            ScenarioError::Invalid(issues) => {
                assert!(issues.iter().any(|i| i.contains("BANK_A") && i.contains("ghost")))
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn scenario_event_unknown_agent() {
        let mut s = base_scenario();
        s.scenario_events.push(ScheduledEvent {
            event: ScenarioEvent::DirectTransfer {
                from_agent: "BANK_A".to_string(),
                to_agent: "NOBODY".to_string(),
                amount: 1,
            },
            schedule: EventSchedule::OneTime { tick: 0 },
        });
        assert!(matches!(s.validate(), Err(ScenarioError::Invalid(_))));
    }

    #[test]
    fn schedules_fire_correctly() {
        let one = EventSchedule::OneTime { tick: 5 };
        assert!(!one.should_fire(4));
        assert!(one.should_fire(5));
        assert!(!one.should_fire(6));

        let rep = EventSchedule::Repeating {
            start_tick: 10,
            interval: 4,
        };
        assert!(!rep.should_fire(9));
        assert!(rep.should_fire(10));
        assert!(!rep.should_fire(12));
        assert!(rep.should_fire(14));
    }

    #[test]
    fn scenario_round_trips_through_json() {
        let s = base_scenario();
        let json = serde_json::to_string(&s).unwrap();
        let back: Scenario = serde_json::from_str(&json).unwrap();
        assert_eq!(back.agents.len(), 2);
        assert!(back.validate().is_ok());
    }
}
