use std::sync::Arc;
use std::time::Duration;

use playbook_domain::ports::triggers::TriggerRecordStore;
use playbook_domain::triggers::{
    InMemoryTriggerRecordStore, SuppressReason, TriggerDecision, TriggerGate, TriggerGateConfig,
    TriggerInput, TriggerKey, TriggerStatus, TriggerType,
};

fn gate_with(store: &InMemoryTriggerRecordStore, in_flight_ttl: Duration) -> TriggerGate {
    TriggerGate::new(Arc::new(store.clone()), TriggerGateConfig { in_flight_ttl })
}

fn input(target_id: &str, content_hash: &str) -> TriggerInput {
    TriggerInput {
        key: TriggerKey::new(
            TriggerType::CatalogSync,
            "shop-1",
            "seo-title",
            target_id,
            content_hash,
        ),
        setting_enabled: true,
        plan_eligible: true,
    }
}

fn run_id(decision: &TriggerDecision) -> String {
    match decision {
        TriggerDecision::Allow { run_id, .. } => run_id.clone(),
        other => panic!("expected allow, got {other:?}"),
    }
}

#[tokio::test]
async fn repeated_trigger_is_in_flight() {
    let store = InMemoryTriggerRecordStore::new("test");
    let gate = gate_with(&store, Duration::from_secs(60));

    let first = gate.evaluate_trigger(&input("T1", "H1")).await.unwrap();
    assert!(matches!(first, TriggerDecision::Allow { retried: false, .. }));

    let second = gate.evaluate_trigger(&input("T1", "H1")).await.unwrap();
    assert_eq!(second, TriggerDecision::Suppress(SuppressReason::InFlight));
    assert_eq!(store.len(), 1);
}

#[tokio::test]
async fn succeeded_key_is_suppressed_until_content_changes() {
    let store = InMemoryTriggerRecordStore::new("test");
    let gate = gate_with(&store, Duration::from_secs(60));
    let trigger = input("T1", "H1");

    let run = run_id(&gate.evaluate_trigger(&trigger).await.unwrap());
    assert!(gate.mark_running(&trigger.key, &run).await.unwrap());
    assert!(gate.mark_succeeded(&trigger.key, &run).await.unwrap());

    let again = gate.evaluate_trigger(&trigger).await.unwrap();
    assert_eq!(
        again,
        TriggerDecision::Suppress(SuppressReason::IdempotentAlreadyDone)
    );

    let changed = gate.evaluate_trigger(&input("T1", "H2")).await.unwrap();
    assert!(matches!(changed, TriggerDecision::Allow { .. }));
    assert_eq!(store.len(), 2);
}

#[tokio::test]
async fn failed_record_is_requeued_on_the_same_key() {
    let store = InMemoryTriggerRecordStore::new("test");
    let gate = gate_with(&store, Duration::from_secs(60));
    let trigger = input("T1", "H1");

    let first = run_id(&gate.evaluate_trigger(&trigger).await.unwrap());
    assert!(gate.mark_running(&trigger.key, &first).await.unwrap());
    assert!(
        gate.mark_failed(&trigger.key, &first, "generation timed out")
            .await
            .unwrap()
    );
    let failed = store.get(&trigger.key).await.unwrap().unwrap();
    assert_eq!(failed.status, TriggerStatus::Failed);
    assert_eq!(failed.error_message.as_deref(), Some("generation timed out"));

    let retry = gate.evaluate_trigger(&trigger).await.unwrap();
    let TriggerDecision::Allow { run_id: second, retried } = retry else {
        panic!("expected retry to be allowed");
    };
    assert!(retried);
    assert_ne!(second, first);

    let record = store.get(&trigger.key).await.unwrap().unwrap();
    assert_eq!(record.status, TriggerStatus::Queued);
    assert_eq!(record.attempts, 2);
    assert_eq!(record.error_message, None);
    assert_eq!(store.len(), 1);
}

#[tokio::test]
async fn configuration_suppressions_create_no_record() {
    let store = InMemoryTriggerRecordStore::new("test");
    let gate = gate_with(&store, Duration::from_secs(60));

    let mut disabled = input("T1", "H1");
    disabled.setting_enabled = false;
    disabled.plan_eligible = false;
    assert_eq!(
        gate.evaluate_trigger(&disabled).await.unwrap(),
        TriggerDecision::Suppress(SuppressReason::SettingDisabled)
    );

    let mut ineligible = input("T1", "H1");
    ineligible.plan_eligible = false;
    assert_eq!(
        gate.evaluate_trigger(&ineligible).await.unwrap(),
        TriggerDecision::Suppress(SuppressReason::PlanIneligible)
    );
    assert!(store.is_empty());
}

#[tokio::test]
async fn concurrent_triggers_allow_exactly_one() {
    let store = InMemoryTriggerRecordStore::new("test");
    let gate = gate_with(&store, Duration::from_secs(60));

    let mut handles = Vec::new();
    for _ in 0..16 {
        let gate = gate.clone();
        handles.push(tokio::spawn(async move {
            gate.evaluate_trigger(&input("T1", "H1")).await.unwrap()
        }));
    }

    let mut allowed = 0;
    for handle in handles {
        match handle.await.unwrap() {
            TriggerDecision::Allow { .. } => allowed += 1,
            TriggerDecision::Suppress(reason) => assert_eq!(reason, SuppressReason::InFlight),
        }
    }
    assert_eq!(allowed, 1);
    assert_eq!(store.len(), 1);
}

#[tokio::test]
async fn abandoned_in_flight_record_is_reclaimed() {
    let store = InMemoryTriggerRecordStore::new("test");
    let gate = gate_with(&store, Duration::from_millis(10));
    let trigger = input("T1", "H1");

    let stale = run_id(&gate.evaluate_trigger(&trigger).await.unwrap());
    tokio::time::sleep(Duration::from_millis(20)).await;

    let reclaimed = gate.evaluate_trigger(&trigger).await.unwrap();
    let fresh = run_id(&reclaimed);
    assert_ne!(fresh, stale);

    assert!(!gate.mark_running(&trigger.key, &stale).await.unwrap());
    assert!(gate.mark_running(&trigger.key, &fresh).await.unwrap());
}

#[tokio::test]
async fn heartbeat_keeps_a_running_record_alive() {
    let store = InMemoryTriggerRecordStore::new("test");
    let gate = gate_with(&store, Duration::from_millis(50));
    let trigger = input("T1", "H1");

    let run = run_id(&gate.evaluate_trigger(&trigger).await.unwrap());
    assert!(gate.mark_running(&trigger.key, &run).await.unwrap());
    for _ in 0..4 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(gate.heartbeat(&trigger.key, &run).await.unwrap());
    }

    let again = gate.evaluate_trigger(&trigger).await.unwrap();
    assert_eq!(again, TriggerDecision::Suppress(SuppressReason::InFlight));
    assert!(gate.mark_succeeded(&trigger.key, &run).await.unwrap());
}

#[tokio::test]
async fn reclaimed_run_can_no_longer_heartbeat_or_finish() {
    let store = InMemoryTriggerRecordStore::new("test");
    let gate = gate_with(&store, Duration::from_millis(50));
    let trigger = input("T1", "H1");

    let stale = run_id(&gate.evaluate_trigger(&trigger).await.unwrap());
    assert!(gate.mark_running(&trigger.key, &stale).await.unwrap());
    tokio::time::sleep(Duration::from_millis(80)).await;

    let fresh = run_id(&gate.evaluate_trigger(&trigger).await.unwrap());
    assert_ne!(fresh, stale);

    assert!(!gate.heartbeat(&trigger.key, &stale).await.unwrap());
    assert!(!gate.mark_succeeded(&trigger.key, &stale).await.unwrap());
    let record = store.get(&trigger.key).await.unwrap().expect("record");
    assert_eq!(record.run_id, fresh);
    assert_eq!(record.status, TriggerStatus::Queued);
}
