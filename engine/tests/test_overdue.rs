//! Overdue lifecycle: first-breach detection, the arrival==deadline
//! boundary, and settlement of overdue transactions.

mod common;

use common::*;
use rtgs_engine::model::event::Event;
use rtgs_engine::Orchestrator;

#[test]
fn deadline_equal_to_arrival_goes_overdue_next_tick() {
    let mut scenario = two_banks(0, 0);
    scenario.settings.lsm.enable_bilateral = false;
    scenario.settings.lsm.enable_cycles = false;
    inject_at(&mut scenario, 0, "tx1", "BANK_A", "BANK_B", 10_000, 5, 0);
    let mut orch = Orchestrator::new(scenario).unwrap();

    // Tick 0: still at its deadline, not overdue.
    let t0 = orch.tick().unwrap();
    assert!(t0.iter().all(|e| e.kind() != "TransactionWentOverdue"));

    // Tick 1: exactly one breach event.
    let t1 = orch.tick().unwrap();
    let breaches: Vec<&Event> = t1
        .iter()
        .filter(|e| e.kind() == "TransactionWentOverdue")
        .collect();
    assert_eq!(breaches.len(), 1);
    match breaches[0] {
        Event::TransactionWentOverdue {
            tx_id,
            deadline_tick,
            ..
        } => {
            assert_eq!(tx_id, "tx1");
            assert_eq!(*deadline_tick, 0);
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(orch.transaction("tx1").unwrap().overdue_since_tick(), Some(1));

    // Never again: the breach event is one-shot.
    for _ in 0..3 {
        let events = orch.tick().unwrap();
        assert!(events.iter().all(|e| e.kind() != "TransactionWentOverdue"));
    }
}

#[test]
fn overdue_settlement_emits_companion_event() {
    let mut scenario = two_banks(0, 0);
    scenario.settings.lsm.enable_bilateral = false;
    scenario.settings.lsm.enable_cycles = false;
    inject_at(&mut scenario, 0, "tx1", "BANK_A", "BANK_B", 10_000, 5, 1);
    // Funding arrives at tick 4, two ticks after the breach at tick 2.
    inject_at(&mut scenario, 4, "tx_fund", "BANK_B", "BANK_A", 10_000, 5, 99);
    scenario.agents[1].opening_balance = 10_000;
    let mut orch = Orchestrator::new(scenario).unwrap();

    for _ in 0..4 {
        orch.tick().unwrap();
    }
    let t4 = orch.tick().unwrap();
    let settled = t4
        .iter()
        .find(|e| e.kind() == "OverdueTransactionSettled")
        .expect("overdue settlement must be flagged");
    match settled {
        Event::OverdueTransactionSettled {
            tx_id,
            ticks_overdue,
            ..
        } => {
            assert_eq!(tx_id, "tx1");
            assert_eq!(*ticks_overdue, 2);
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert_kind_subsequence(&t4, &["Queue2LiquidityRelease", "OverdueTransactionSettled"]);
}

#[test]
fn q1_held_transactions_also_go_overdue() {
    let def: rtgs_engine::policy::PolicyDef = serde_json::from_str(
        r#"{
        "policy_id": "hold_all",
        "payment_tree": {"node_id": "A1", "type": "action", "action": "Hold"}
    }"#,
    )
    .unwrap();
    let mut scenario = two_banks(1_000_000, 0);
    scenario.agents[0].policy = Some(def);
    inject_at(&mut scenario, 0, "tx1", "BANK_A", "BANK_B", 10_000, 5, 2);
    let mut orch = Orchestrator::new(scenario).unwrap();

    for _ in 0..3 {
        let events = orch.tick().unwrap();
        assert!(events.iter().all(|e| e.kind() != "TransactionWentOverdue"));
    }
    let t3 = orch.tick().unwrap();
    assert!(t3.iter().any(|e| e.kind() == "TransactionWentOverdue"));
    // Still in Q1, never submitted.
    assert_eq!(orch.queue1_contents("BANK_A"), vec!["tx1".to_string()]);
}
