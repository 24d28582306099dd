//! Deterministic RTGS/LSM settlement engine.
//!
//! A tick-driven simulation core for a Real-Time Gross Settlement system
//! augmented with a Liquidity-Saving Mechanism. Given a validated
//! [`Scenario`], the [`Orchestrator`] advances a simulated day in fixed
//! time steps and produces, for every tick, the exact sequence of
//! arrivals, policy decisions, settlements, collateral movements, cost
//! accruals, and end-of-day events.
//!
//! # Architecture
//!
//! - **num**: integer-cent arithmetic and exact rationals
//! - **rng**: seeded xorshift64* with explicit state threading
//! - **model**: domain records (Transaction arena, Agent, Event log)
//! - **policy**: JSON decision-tree DSL (validation + exact evaluator)
//! - **arrivals**: deterministic transaction generation
//! - **queues**: Q1/Q2 ordering and priority escalation
//! - **settlement**: RTGS admission + Q2 release cascade, LSM netting
//! - **collateral**: post/withdraw with hysteresis and holding period
//! - **costs**: five-category cost accrual
//! - **scenario**: validated configuration surface
//! - **engine**: the orchestrator and its tick loop
//!
//! # Critical Invariants
//!
//! 1. All money values are i64 cents; overflow is a fatal tick error
//! 2. All randomness flows through the seeded RNG owned by the orchestrator
//! 3. Same seed + same scenario => byte-identical event stream

pub mod arrivals;
pub mod clock;
pub mod collateral;
pub mod costs;
pub mod engine;
pub mod model;
pub mod num;
pub mod policy;
pub mod queues;
pub mod rng;
pub mod scenario;
pub mod settlement;

pub use clock::SimClock;
pub use costs::{CostBreakdown, CostRates, CostTotals};
pub use engine::{Orchestrator, TickError};
pub use model::{
    agent::Agent,
    event::{Event, EventLog},
    transaction::{Transaction, TxId, TxStatus},
};
pub use num::Ratio;
pub use rng::DetRng;
pub use scenario::{CustomArrival, Scenario, ScenarioError};
