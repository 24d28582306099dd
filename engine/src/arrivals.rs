//! Deterministic transaction arrival generation.
//!
//! For each agent, per tick, the generator draws a Poisson arrival count
//! and then, per arrival, amount → priority → counterparty → deadline, in
//! that fixed order, threading the single RNG. Agents are iterated in
//! scenario insertion order. Same seed + same configs => same arrivals.
//!
//! This module is the one place in the engine where floating point is
//! allowed; every sample is converted to integer cents (truncate toward
//! zero, minimum one cent) or an integer tick/priority on the way out.

use crate::clock::SimClock;
use crate::rng::DetRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Amount distributions. Parameters are in cents except where log-space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AmountDistribution {
    /// Inclusive range.
    Uniform { min: i64, max: i64 },
    Normal { mean: i64, std_dev: i64 },
    /// Log-space mean and deviation.
    LogNormal { mu: f64, sigma: f64 },
    Exponential { rate: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PriorityDistribution {
    Fixed { value: u8 },
    Uniform { min: u8, max: u8 },
    Categorical { values: Vec<u8>, weights: Vec<f64> },
}

impl Default for PriorityDistribution {
    fn default() -> Self {
        PriorityDistribution::Fixed { value: 5 }
    }
}

/// Arrival parameters for one agent (or one priority band).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArrivalConfig {
    /// Poisson lambda per tick.
    pub rate_per_tick: f64,

    pub amount: AmountDistribution,

    /// Counterparty weights. Empty means uniform over all other agents.
    #[serde(default)]
    pub counterparty_weights: BTreeMap<String, f64>,

    /// Deadline offset range in ticks from arrival, inclusive.
    pub deadline_range: (usize, usize),

    #[serde(default)]
    pub priority: PriorityDistribution,

    #[serde(default)]
    pub divisible: bool,
}

/// Priority-banded profile: urgent 8–10, normal 4–7, low 0–3. Bands are
/// drawn in that fixed order; each band's priority is uniform within the
/// band.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ArrivalBands {
    #[serde(default)]
    pub urgent: Option<BandConfig>,
    #[serde(default)]
    pub normal: Option<BandConfig>,
    #[serde(default)]
    pub low: Option<BandConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BandConfig {
    pub rate_per_tick: f64,
    pub amount: AmountDistribution,
    #[serde(default)]
    pub counterparty_weights: BTreeMap<String, f64>,
    pub deadline_range: (usize, usize),
    #[serde(default)]
    pub divisible: bool,
}

impl BandConfig {
    fn as_config(&self, band: (u8, u8)) -> ArrivalConfig {
        ArrivalConfig {
            rate_per_tick: self.rate_per_tick,
            amount: self.amount.clone(),
            counterparty_weights: self.counterparty_weights.clone(),
            deadline_range: self.deadline_range,
            priority: PriorityDistribution::Uniform {
                min: band.0,
                max: band.1,
            },
            divisible: self.divisible,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ArrivalProfile {
    Single(ArrivalConfig),
    Banded(ArrivalBands),
}

/// One drawn arrival, before the orchestrator assigns an id.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrivalDraw {
    pub receiver_id: String,
    pub amount: i64,
    pub priority: u8,
    pub deadline_tick: usize,
    pub divisible: bool,
}

/// Arrival generator for all agents.
///
/// Holds effective and base profiles separately so scenario-event
/// multipliers are always applied relative to the scenario as written and
/// never compound.
#[derive(Debug, Clone)]
pub struct ArrivalEngine {
    profiles: BTreeMap<String, ArrivalProfile>,
    base_profiles: BTreeMap<String, ArrivalProfile>,
    all_agent_ids: Vec<String>,
    deadline_cap_at_eod: bool,
}

impl ArrivalEngine {
    pub fn new(
        profiles: BTreeMap<String, ArrivalProfile>,
        all_agent_ids: Vec<String>,
        deadline_cap_at_eod: bool,
    ) -> Self {
        Self {
            base_profiles: profiles.clone(),
            profiles,
            all_agent_ids,
            deadline_cap_at_eod,
        }
    }

    /// Draw this tick's arrivals for one agent. The draw order per
    /// arrival is fixed: amount, priority, counterparty, deadline.
    pub fn generate_for_agent(
        &self,
        agent_id: &str,
        clock: &SimClock,
        rng: &mut DetRng,
    ) -> Vec<ArrivalDraw> {
        let profile = match self.profiles.get(agent_id) {
            Some(p) => p,
            None => return Vec::new(),
        };
        let mut draws = Vec::new();
        match profile {
            ArrivalProfile::Single(cfg) => {
                self.draw_from_config(agent_id, cfg, clock, rng, &mut draws)
            }
            ArrivalProfile::Banded(bands) => {
                // Fixed band order is part of the determinism contract.
                let resolved = [
                    bands.urgent.as_ref().map(|b| b.as_config((8, 10))),
                    bands.normal.as_ref().map(|b| b.as_config((4, 7))),
                    bands.low.as_ref().map(|b| b.as_config((0, 3))),
                ];
                for cfg in resolved.iter().flatten() {
                    self.draw_from_config(agent_id, cfg, clock, rng, &mut draws);
                }
            }
        }
        draws
    }

    fn draw_from_config(
        &self,
        sender_id: &str,
        cfg: &ArrivalConfig,
        clock: &SimClock,
        rng: &mut DetRng,
        out: &mut Vec<ArrivalDraw>,
    ) {
        let count = rng.poisson(cfg.rate_per_tick);
        for _ in 0..count {
            let amount = sample_amount(&cfg.amount, rng);
            let priority = sample_priority(&cfg.priority, rng);
            let receiver_id =
                select_counterparty(sender_id, &cfg.counterparty_weights, &self.all_agent_ids, rng);
            let deadline_tick = self.sample_deadline(cfg.deadline_range, clock, rng);
            out.push(ArrivalDraw {
                receiver_id,
                amount,
                priority,
                deadline_tick,
                divisible: cfg.divisible,
            });
        }
    }

    fn sample_deadline(
        &self,
        range: (usize, usize),
        clock: &SimClock,
        rng: &mut DetRng,
    ) -> usize {
        let (min_offset, max_offset) = range;
        let offset = rng.uniform_i64(min_offset as i64, max_offset.max(min_offset) as i64) as usize;
        let deadline = clock.current_tick() + offset;
        if self.deadline_cap_at_eod {
            deadline.min(clock.last_tick_of_current_day())
        } else {
            deadline
        }
    }

    // ------------------------------------------------------------------
    // Scenario-event mutation, always relative to base profiles
    // ------------------------------------------------------------------

    pub fn multiply_all_rates(&mut self, multiplier: f64) {
        let base = self.base_profiles.clone();
        for (agent_id, profile) in self.profiles.iter_mut() {
            if let Some(base_profile) = base.get(agent_id) {
                scale_rates(profile, base_profile, multiplier);
            }
        }
    }

    pub fn multiply_agent_rate(&mut self, agent_id: &str, multiplier: f64) {
        let base = self.base_profiles.get(agent_id).cloned();
        if let (Some(profile), Some(base_profile)) = (self.profiles.get_mut(agent_id), base) {
            scale_rates(profile, &base_profile, multiplier);
        }
    }

    /// Set one counterparty weight. With `auto_balance_others`, the other
    /// weights are rescaled so the total weight is preserved.
    pub fn set_counterparty_weight(
        &mut self,
        agent_id: &str,
        counterparty: &str,
        new_weight: f64,
        auto_balance_others: bool,
    ) {
        let others: Vec<String> = self
            .all_agent_ids
            .iter()
            .filter(|id| id.as_str() != agent_id)
            .cloned()
            .collect();
        if let Some(profile) = self.profiles.get_mut(agent_id) {
            for weights in profile_weights(profile) {
                // Uniform selection is an implicit all-ones table.
                if weights.is_empty() {
                    for other in &others {
                        weights.insert(other.clone(), 1.0);
                    }
                }
                let old = weights.get(counterparty).copied().unwrap_or(1.0);
                let rest: f64 = weights
                    .iter()
                    .filter(|(id, _)| id.as_str() != counterparty)
                    .map(|(_, w)| *w)
                    .sum();
                weights.insert(counterparty.to_string(), new_weight);
                if auto_balance_others && rest > 0.0 {
                    let target_rest = (old + rest - new_weight).max(0.0);
                    let scale = target_rest / rest;
                    for (id, w) in weights.iter_mut() {
                        if id.as_str() != counterparty {
                            *w *= scale;
                        }
                    }
                }
            }
        }
    }

    /// Scale deadline windows (relative to the base scenario), truncating
    /// to whole ticks with a floor of zero.
    pub fn scale_deadline_windows(&mut self, min_mult: Option<f64>, max_mult: Option<f64>) {
        let base = self.base_profiles.clone();
        for (agent_id, profile) in self.profiles.iter_mut() {
            let base_profile = match base.get(agent_id) {
                Some(b) => b,
                None => continue,
            };
            let ranges = profile_deadline_ranges(profile);
            let base_ranges: Vec<(usize, usize)> = {
                let mut b = base_profile.clone();
                profile_deadline_ranges(&mut b).iter().map(|r| **r).collect()
            };
            for (range, base_range) in ranges.into_iter().zip(base_ranges) {
                let min = match min_mult {
                    Some(m) => (base_range.0 as f64 * m) as usize,
                    None => base_range.0,
                };
                let max = match max_mult {
                    Some(m) => (base_range.1 as f64 * m) as usize,
                    None => base_range.1,
                };
                *range = (min, max.max(min));
            }
        }
    }

    pub fn profile(&self, agent_id: &str) -> Option<&ArrivalProfile> {
        self.profiles.get(agent_id)
    }
}

fn scale_rates(profile: &mut ArrivalProfile, base: &ArrivalProfile, multiplier: f64) {
    match (profile, base) {
        (ArrivalProfile::Single(cfg), ArrivalProfile::Single(base_cfg)) => {
            cfg.rate_per_tick = base_cfg.rate_per_tick * multiplier;
        }
        (ArrivalProfile::Banded(bands), ArrivalProfile::Banded(base_bands)) => {
            let pairs = [
                (&mut bands.urgent, &base_bands.urgent),
                (&mut bands.normal, &base_bands.normal),
                (&mut bands.low, &base_bands.low),
            ];
            for (band, base_band) in pairs {
                if let (Some(b), Some(bb)) = (band.as_mut(), base_band.as_ref()) {
                    b.rate_per_tick = bb.rate_per_tick * multiplier;
                }
            }
        }
        _ => {}
    }
}

fn profile_weights(profile: &mut ArrivalProfile) -> Vec<&mut BTreeMap<String, f64>> {
    match profile {
        ArrivalProfile::Single(cfg) => vec![&mut cfg.counterparty_weights],
        ArrivalProfile::Banded(bands) => [
            bands.urgent.as_mut(),
            bands.normal.as_mut(),
            bands.low.as_mut(),
        ]
        .into_iter()
        .flatten()
        .map(|b| &mut b.counterparty_weights)
        .collect(),
    }
}

fn profile_deadline_ranges(profile: &mut ArrivalProfile) -> Vec<&mut (usize, usize)> {
    match profile {
        ArrivalProfile::Single(cfg) => vec![&mut cfg.deadline_range],
        ArrivalProfile::Banded(bands) => [
            bands.urgent.as_mut(),
            bands.normal.as_mut(),
            bands.low.as_mut(),
        ]
        .into_iter()
        .flatten()
        .map(|b| &mut b.deadline_range)
        .collect(),
    }
}

/// Sample an amount in cents: truncate toward zero, minimum one cent.
fn sample_amount(distribution: &AmountDistribution, rng: &mut DetRng) -> i64 {
    match distribution {
        AmountDistribution::Uniform { min, max } => rng.uniform_i64(*min, (*max).max(*min)),
        AmountDistribution::Normal { mean, std_dev } => {
            let z = rng.standard_normal();
            let amount = *mean + (*std_dev as f64 * z) as i64;
            amount.max(1)
        }
        AmountDistribution::LogNormal { mu, sigma } => (rng.log_normal(*mu, *sigma) as i64).max(1),
        AmountDistribution::Exponential { rate } => (rng.exponential(*rate) as i64).max(1),
    }
}

fn sample_priority(distribution: &PriorityDistribution, rng: &mut DetRng) -> u8 {
    match distribution {
        PriorityDistribution::Fixed { value } => (*value).min(10),
        PriorityDistribution::Uniform { min, max } => {
            rng.uniform_i64(*min as i64, (*max).max(*min) as i64) as u8
        }
        PriorityDistribution::Categorical { values, weights } => {
            if values.is_empty() {
                return 5;
            }
            let total: f64 = weights.iter().sum();
            if total <= 0.0 {
                return values[0].min(10);
            }
            let mut target = rng.unit_f64() * total;
            for (value, weight) in values.iter().zip(weights) {
                target -= weight;
                if target <= 0.0 {
                    return (*value).min(10);
                }
            }
            values.last().copied().unwrap_or(5).min(10)
        }
    }
}

/// Weighted counterparty selection, sender excluded, weights normalized
/// over the remaining agents.
fn select_counterparty(
    sender_id: &str,
    weights: &BTreeMap<String, f64>,
    all_agent_ids: &[String],
    rng: &mut DetRng,
) -> String {
    let candidates: Vec<&String> = all_agent_ids
        .iter()
        .filter(|id| id.as_str() != sender_id)
        .collect();
    assert!(
        !candidates.is_empty(),
        "cannot draw a counterparty with a single agent"
    );

    if weights.is_empty() {
        let idx = rng.uniform_i64(0, candidates.len() as i64 - 1) as usize;
        return candidates[idx].clone();
    }

    let total: f64 = candidates
        .iter()
        .map(|id| weights.get(id.as_str()).copied().unwrap_or(1.0))
        .sum();
    let mut target = rng.unit_f64() * total;
    for id in &candidates {
        target -= weights.get(id.as_str()).copied().unwrap_or(1.0);
        if target <= 0.0 {
            return (*id).clone();
        }
    }
    candidates.last().unwrap().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agents() -> Vec<String> {
        vec!["BANK_A".to_string(), "BANK_B".to_string(), "BANK_C".to_string()]
    }

    fn single_profile(rate: f64) -> ArrivalProfile {
        ArrivalProfile::Single(ArrivalConfig {
            rate_per_tick: rate,
            amount: AmountDistribution::Uniform {
                min: 10_000,
                max: 20_000,
            },
            counterparty_weights: BTreeMap::new(),
            deadline_range: (5, 15),
            priority: PriorityDistribution::default(),
            divisible: false,
        })
    }

    fn engine(rate: f64, cap: bool) -> ArrivalEngine {
        let mut profiles = BTreeMap::new();
        profiles.insert("BANK_A".to_string(), single_profile(rate));
        ArrivalEngine::new(profiles, agents(), cap)
    }

    #[test]
    fn generation_is_deterministic() {
        let eng = engine(2.0, false);
        let clock = SimClock::new(100, 1);
        let mut rng1 = DetRng::new(42);
        let mut rng2 = DetRng::new(42);
        let a = eng.generate_for_agent("BANK_A", &clock, &mut rng1);
        let b = eng.generate_for_agent("BANK_A", &clock, &mut rng2);
        assert_eq!(a, b);
    }

    #[test]
    fn amounts_and_deadlines_stay_in_range() {
        let eng = engine(8.0, false);
        let clock = SimClock::new(100, 1);
        let mut rng = DetRng::new(7);
        let draws = eng.generate_for_agent("BANK_A", &clock, &mut rng);
        assert!(!draws.is_empty());
        for d in &draws {
            assert!((10_000..=20_000).contains(&d.amount));
            assert!((5..=15).contains(&d.deadline_tick));
            assert_ne!(d.receiver_id, "BANK_A");
        }
    }

    #[test]
    fn eod_cap_clamps_deadlines() {
        let eng = engine(8.0, true);
        let mut clock = SimClock::new(10, 2);
        for _ in 0..9 {
            clock.advance(); // last tick of day 0
        }
        let mut rng = DetRng::new(9);
        let draws = eng.generate_for_agent("BANK_A", &clock, &mut rng);
        for d in &draws {
            assert_eq!(d.deadline_tick, 9, "deadline must cap at day end");
        }
    }

    #[test]
    fn banded_profile_draws_band_priorities() {
        let band = BandConfig {
            rate_per_tick: 4.0,
            amount: AmountDistribution::Uniform {
                min: 1_000,
                max: 2_000,
            },
            counterparty_weights: BTreeMap::new(),
            deadline_range: (5, 10),
            divisible: false,
        };
        let mut profiles = BTreeMap::new();
        profiles.insert(
            "BANK_A".to_string(),
            ArrivalProfile::Banded(ArrivalBands {
                urgent: Some(band.clone()),
                normal: None,
                low: Some(band),
            }),
        );
        let eng = ArrivalEngine::new(profiles, agents(), false);
        let clock = SimClock::new(100, 1);
        let mut rng = DetRng::new(11);
        let draws = eng.generate_for_agent("BANK_A", &clock, &mut rng);
        assert!(!draws.is_empty());
        for d in &draws {
            assert!(
                (8..=10).contains(&d.priority) || d.priority <= 3,
                "priority {} outside configured bands",
                d.priority
            );
        }
    }

    #[test]
    fn rate_multipliers_do_not_compound() {
        let mut eng = engine(2.0, false);
        eng.multiply_all_rates(1.5);
        eng.multiply_all_rates(1.5);
        match eng.profile("BANK_A").unwrap() {
            ArrivalProfile::Single(cfg) => assert!((cfg.rate_per_tick - 3.0).abs() < 1e-12),
            _ => unreachable!(),
        }
    }

    #[test]
    fn weight_rebalancing_preserves_total() {
        let mut profiles = BTreeMap::new();
        let mut cfg = match single_profile(1.0) {
            ArrivalProfile::Single(c) => c,
            _ => unreachable!(),
        };
        cfg.counterparty_weights.insert("BANK_B".to_string(), 0.5);
        cfg.counterparty_weights.insert("BANK_C".to_string(), 0.5);
        profiles.insert("BANK_A".to_string(), ArrivalProfile::Single(cfg));
        let mut eng = ArrivalEngine::new(profiles, agents(), false);

        eng.set_counterparty_weight("BANK_A", "BANK_B", 0.8, true);
        match eng.profile("BANK_A").unwrap() {
            ArrivalProfile::Single(cfg) => {
                let total: f64 = cfg.counterparty_weights.values().sum();
                assert!((total - 1.0).abs() < 1e-9, "total weight drifted: {}", total);
                assert!((cfg.counterparty_weights["BANK_B"] - 0.8).abs() < 1e-12);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn weighted_selection_prefers_heavy_counterparty() {
        let mut weights = BTreeMap::new();
        weights.insert("BANK_B".to_string(), 10.0);
        weights.insert("BANK_C".to_string(), 1.0);
        let mut rng = DetRng::new(42);
        let ids = agents();
        let mut b = 0;
        let mut c = 0;
        for _ in 0..500 {
            match select_counterparty("BANK_A", &weights, &ids, &mut rng).as_str() {
                "BANK_B" => b += 1,
                "BANK_C" => c += 1,
                other => panic!("unexpected counterparty {}", other),
            }
        }
        assert!(b > c * 3, "weights ignored: b={} c={}", b, c);
    }
}
