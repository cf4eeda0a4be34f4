//! Archiver et moteur d'alertes branchés ensemble : reprise au démarrage,
//! tiers grossiers, rétention et notifications non délivrées

use std::sync::Arc;
use std::time::Duration;

use symbion_devkit::{RecordingSink, TestHarness, T0};
use symbion_telemetry::alerts::AlertEngine;
use symbion_telemetry::archiver::Archiver;
use symbion_telemetry::clock::ManualClock;
use symbion_telemetry::health::HealthTracker;
use symbion_telemetry::models::{Host, Sample, Tier, Timestamp, DAY_MS, HOUR_MS, MINUTE_MS};
use symbion_telemetry::store::TelemetryStore;

fn row(tier: Tier, ts: Timestamp, ram_used: i64) -> Sample {
    Sample {
        tier,
        host: "h1".into(),
        timestamp: ts,
        cpu: None,
        ram_used,
        swap_used: 0,
        net: Vec::new(),
        disks: Vec::new(),
    }
}

fn host() -> Host {
    Host {
        host: "h1".into(),
        ram_total: 1_000,
        swap_total: 0,
    }
}

async fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
    let polled = tokio::time::timeout(Duration::from_secs(10), async {
        while !done() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "timed out waiting for {what}");
}

#[tokio::test]
async fn test_alert_refused_by_the_sink_is_announced_later() {
    let mut harness = TestHarness::new().unwrap();
    let mut agents = vec![harness.agent("h1")];
    agents[0].set_ram_used_pct(96.0);

    harness.sink.set_failing(true);
    // evaluation errors stay inside the archiver task
    harness.run_agents(&mut agents, 2 * MINUTE_MS, 0.1).await.unwrap();
    assert!(harness.sink.texts().is_empty());
    assert_eq!(harness.engine.open_alerts().len(), 1);

    harness.sink.set_failing(false);
    harness.run_agents(&mut agents, 2 * MINUTE_MS, 0.1).await.unwrap();
    assert_eq!(
        harness.sink.texts(),
        vec!["h1 | New Alert: 96.0% RAM usage over 5 minutes"]
    );
}

#[tokio::test]
async fn test_evaluated_boundary_is_not_evaluated_again() {
    let mut harness = TestHarness::new().unwrap();
    let mut agents = vec![harness.agent("h1")];
    agents[0].set_ram_used_pct(96.0);
    harness.run_agents(&mut agents, 2 * MINUTE_MS, 0.1).await.unwrap();
    assert_eq!(harness.sink.batches().len(), 1);

    let last = T0 + 2 * MINUTE_MS;
    assert!(harness.engine.evaluate(last).await.unwrap().is_empty());
    assert!(harness.engine.evaluate(last - MINUTE_MS).await.unwrap().is_empty());
    assert_eq!(harness.sink.batches().len(), 1);
    assert_eq!(harness.engine.open_alerts().len(), 1);
}

#[tokio::test]
async fn test_two_hour_pass_and_archive_retention() {
    let mut harness = TestHarness::new().unwrap();
    let expiring = T0 - 31 * DAY_MS + MINUTE_MS;
    let kept = T0 - 31 * DAY_MS + 3 * HOUR_MS;
    harness
        .store
        .transaction(|tx| {
            tx.upsert_host(&host())?;
            let mut old = Vec::new();
            for tier in [Tier::OneMinute, Tier::TwentyMinutes, Tier::TwoHours] {
                old.push(row(tier, expiring, 100));
                old.push(row(tier, kept, 100));
            }
            tx.insert_full(&old)
        })
        .unwrap();

    let mut agents = vec![harness.agent("h1")];
    harness.run_agents(&mut agents, 2 * HOUR_MS, 0.3).await.unwrap();

    let (twenty, two_hours) = harness
        .store
        .transaction(|tx| {
            Ok((
                tx.range_query(Tier::TwentyMinutes, Some("h1"), T0, i64::MAX)?,
                tx.range_query(Tier::TwoHours, Some("h1"), T0, i64::MAX)?,
            ))
        })
        .unwrap();
    assert_eq!(twenty.len(), 6);
    assert_eq!(twenty[5].timestamp, T0 + 100 * MINUTE_MS);
    assert_eq!(two_hours.len(), 1);
    assert_eq!(two_hours[0].timestamp, T0);
    assert!(two_hours[0].cpu.is_some());

    for tier in [Tier::OneMinute, Tier::TwentyMinutes, Tier::TwoHours] {
        let old: Vec<Timestamp> = harness
            .store
            .transaction(|tx| tx.range_query(tier, Some("h1"), 0, T0 - DAY_MS))
            .unwrap()
            .iter()
            .map(|s| s.timestamp)
            .collect();
        assert_eq!(old, vec![kept], "{tier:?}");
    }
}

#[tokio::test]
async fn test_spawned_archiver_catches_up_and_evaluates_alerts() {
    let store = Arc::new(TelemetryStore::open_in_memory().unwrap());
    store
        .transaction(|tx| {
            tx.upsert_host(&host())?;
            let mut rows: Vec<Sample> = (1..=5).map(|i| row(Tier::OneMinute, T0 - i * MINUTE_MS, 960)).collect();
            rows.push(row(Tier::FiveSeconds, T0 + 500, 960));
            tx.insert_full(&rows)
        })
        .unwrap();

    let clock = Arc::new(ManualClock::new(T0 + 1_000));
    let sink = RecordingSink::new();
    let health = HealthTracker::new();
    let engine = Arc::new(AlertEngine::new(store.clone(), clock.clone(), Arc::new(sink.clone())));
    let archiver = Arc::new(
        Archiver::new(store.clone(), clock.clone())
            .with_alerts(engine.clone())
            .with_health(health.clone()),
    );
    let task = archiver.spawn();

    // minute preceding the start
    wait_until("startup pass", || health.last_archive() == Some(T0)).await;
    wait_until("ram notification", || sink.contains("RAM usage")).await;
    assert_eq!(engine.open_alerts().len(), 1);

    clock.set(T0 + MINUTE_MS + 1_000);
    wait_until("next minute pass", || health.last_archive() == Some(T0 + MINUTE_MS)).await;
    let minute = store
        .transaction(|tx| tx.range_query(Tier::OneMinute, Some("h1"), T0, i64::MAX))
        .unwrap();
    assert_eq!(minute.len(), 1);
    assert_eq!(minute[0].ram_used, 960);

    task.abort();
}
