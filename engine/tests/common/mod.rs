//! Shared helpers for the integration suite.

#![allow(dead_code)]

use rtgs_engine::model::event::Event;
use rtgs_engine::scenario::{
    AgentSpec, CustomArrival, EventSchedule, Scenario, ScenarioEvent, ScheduledEvent,
};
use rtgs_engine::Orchestrator;
use std::collections::BTreeSet;

/// Schedule an injected arrival at a tick.
pub fn inject_at(
    scenario: &mut Scenario,
    tick: usize,
    id: &str,
    sender: &str,
    receiver: &str,
    amount: i64,
    priority: u8,
    deadline_tick: usize,
) {
    scenario.scenario_events.push(ScheduledEvent {
        event: ScenarioEvent::CustomTransactionArrival {
            arrival: CustomArrival {
                id: Some(id.to_string()),
                sender_id: sender.to_string(),
                receiver_id: receiver.to_string(),
                amount,
                priority,
                deadline_tick,
                divisible: false,
            },
        },
        schedule: EventSchedule::OneTime { tick },
    });
}

pub fn two_banks(balance_a: i64, balance_b: i64) -> Scenario {
    Scenario::with_agents(
        100,
        1,
        vec![
            AgentSpec::new("BANK_A", balance_a, 0),
            AgentSpec::new("BANK_B", balance_b, 0),
        ],
    )
}

/// Event kinds in order, for shape assertions.
pub fn kinds(events: &[Event]) -> Vec<&'static str> {
    events.iter().map(|e| e.kind()).collect()
}

/// Assert `expected` appears within `actual` in order (other kinds may
/// interleave).
pub fn assert_kind_subsequence(actual: &[Event], expected: &[&str]) {
    let mut want = expected.iter();
    let mut next = want.next();
    for event in actual {
        if let Some(kind) = next {
            if event.kind() == *kind {
                next = want.next();
            }
        }
    }
    assert!(
        next.is_none(),
        "missing `{}` in event sequence: {:?}",
        next.unwrap(),
        kinds(actual)
    );
}

/// The universal per-tick invariants of the engine.
pub fn assert_invariants(orch: &Orchestrator, agent_ids: &[&str]) {
    let q2: BTreeSet<String> = orch.q2_contents().into_iter().collect();
    for id in agent_ids {
        let agent = orch.agent_state(id).expect("agent exists");
        assert!(
            agent.credit_used() <= agent.overdraft_cap(),
            "{}: credit used {} exceeds cap {}",
            id,
            agent.credit_used(),
            agent.overdraft_cap()
        );
        for tx in orch.queue1_contents(id) {
            assert!(
                !q2.contains(&tx),
                "{} appears in both Q1 and Q2",
                tx
            );
        }
    }
}

/// Conserved quantity: settlement balances plus pending deferred credits.
pub fn total_money(orch: &Orchestrator, agent_ids: &[&str]) -> i64 {
    agent_ids
        .iter()
        .map(|id| {
            let a = orch.agent_state(id).expect("agent exists");
            a.balance() + a.deferred_credits()
        })
        .sum()
}
