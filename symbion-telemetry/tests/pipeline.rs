//! Bout-en-bout : payloads agents -> débits -> tiers -> alertes -> notifications

use symbion_devkit::{TestHarness, T0};
use symbion_telemetry::models::{Tier, MINUTE_MS};
use symbion_telemetry::query::{Metric, QueryError, Series};

#[tokio::test]
async fn test_three_payloads_give_three_cpu_points_first_absent() {
    let harness = TestHarness::new().unwrap();
    let mut agent = harness.agent("h1");
    for _ in 0..3 {
        harness.clock.advance(5_000);
        agent.step(5_000, 0.5);
        harness.send(&agent).await.unwrap();
    }

    let series = harness
        .query
        .series(Metric::Cpu, "h1", Tier::FiveSeconds, None, None)
        .await
        .unwrap();
    let Series::Cpu { points, .. } = series else {
        panic!("expected a cpu series");
    };
    let busy: Vec<Option<f64>> = points.iter().map(|p| p.busy).collect();
    assert_eq!(busy, vec![None, Some(50.0), Some(50.0)]);
    assert_eq!(points[1].io, Some(0.0));
}

#[tokio::test]
async fn test_net_and_disk_rates_reach_the_series() {
    let harness = TestHarness::new().unwrap();
    let mut agent = harness
        .agent("h1")
        .with_interface("eth0")
        .with_disk("sda1", "/", 10_000_000, 4_000_000)
        .with_disk("sda2", "/boot", 500_000, 100_000);
    for _ in 0..2 {
        harness.clock.advance(5_000);
        agent.step(5_000, 0.1);
        harness.send(&agent).await.unwrap();
    }

    let Series::Net { points, .. } = harness
        .query
        .series(Metric::Net, "h1", Tier::FiveSeconds, None, None)
        .await
        .unwrap()
    else {
        panic!("expected a net series");
    };
    assert!(points[0].interfaces.is_empty());
    let eth0 = &points[1].interfaces[0];
    assert_eq!(eth0.interface, "eth0");
    assert_eq!(eth0.in_bytes, Some(1_000));
    assert_eq!(eth0.out_packets, Some(5));

    let Series::DiskIo { points, .. } = harness
        .query
        .series(Metric::DiskIo, "h1", Tier::FiveSeconds, None, None)
        .await
        .unwrap()
    else {
        panic!("expected a disk-io series");
    };
    // /boot is never reported
    assert_eq!(points[1].devices.len(), 1);
    let sda1 = &points[1].devices[0];
    assert_eq!(sda1.device, "sda1");
    assert_eq!(sda1.read_speed, Some(51_200));
    assert_eq!(sda1.read_usage, Some(2.5));
    assert_eq!(sda1.write_usage, Some(7.5));

    let space = harness.query.disk_space("h1").await.unwrap();
    assert_eq!(space[0].total, 10_000_000 * 1024);
    assert_eq!(space[0].used_fraction, 0.4);
}

#[tokio::test]
async fn test_minute_rollups_and_live_retention() {
    let mut harness = TestHarness::new().unwrap();
    let mut agents = vec![harness.agent("h1")];
    harness.run_agents(&mut agents, 7 * MINUTE_MS, 0.2).await.unwrap();

    let (minutes, live, twenty) = harness
        .store
        .transaction(|tx| {
            Ok((
                tx.range_query(Tier::OneMinute, Some("h1"), 0, i64::MAX)?,
                tx.range_query(Tier::FiveSeconds, Some("h1"), 0, i64::MAX)?,
                tx.count_samples(Tier::TwentyMinutes, None)?,
            ))
        })
        .unwrap();

    assert_eq!(minutes.len(), 7);
    assert_eq!(minutes[0].timestamp, T0);
    // the first live sample has no CPU value and is left out of the mean
    assert_eq!(minutes[0].cpu.map(|c| c.busy), Some(2_000));
    assert!(live.iter().all(|s| s.timestamp >= T0 + 2 * MINUTE_MS));
    assert_eq!(twenty, 0);
}

#[tokio::test]
async fn test_ram_alert_notified_once_then_closed() {
    let mut harness = TestHarness::new().unwrap();
    let mut agents = vec![harness.agent("h1")];
    agents[0].set_ram_used_pct(96.0);
    harness.run_agents(&mut agents, 2 * MINUTE_MS, 0.1).await.unwrap();

    assert_eq!(
        harness.sink.texts(),
        vec!["h1 | New Alert: 96.0% RAM usage over 5 minutes"]
    );
    assert_eq!(harness.engine.open_alerts().len(), 1);

    agents[0].set_ram_used_pct(50.0);
    harness.run_agents(&mut agents, 6 * MINUTE_MS, 0.1).await.unwrap();

    let texts = harness.sink.texts();
    assert_eq!(texts.len(), 2, "{texts:?}");
    // closes as soon as the 5 minute mean drops under 70%, older 96% minutes included
    assert!(texts[1].starts_with("h1 | Closed Alert: RAM usage back to 6"), "{}", texts[1]);
    assert!(texts[1].ends_with("% over 5 minutes"));
    assert!(harness.engine.open_alerts().is_empty());
}

#[tokio::test]
async fn test_silent_host_escalates_then_recovers() {
    let mut harness = TestHarness::new().unwrap();
    let mut agents = vec![harness.agent("h1")];
    harness.run_agents(&mut agents, 65_000, 0.1).await.unwrap();

    harness.stay_silent(3 * MINUTE_MS).await.unwrap();
    // warning after 55s stays quiet, critical after 115s is announced
    assert_eq!(
        harness.sink.texts(),
        vec!["h1 | New Alert: No reports received in the last 115 seconds"]
    );

    harness.run_agents(&mut agents, 65_000, 0.1).await.unwrap();
    assert_eq!(
        harness.sink.texts().last().map(String::as_str),
        Some("h1 | Closed Alert: Report received 0 seconds ago")
    );
}

#[tokio::test]
async fn test_host_removal_cascades_and_notifies() {
    let mut harness = TestHarness::new().unwrap();
    let mut agents = vec![harness.agent("h1").with_interface("eth0"), harness.agent("h2")];
    harness.run_agents(&mut agents, 2 * MINUTE_MS, 0.1).await.unwrap();

    assert!(harness.ingestor.remove_host("h1").await.unwrap());
    assert!(harness.sink.contains("Removed host 'h1' and all associated data"));

    let (live, minutes, children) = harness
        .store
        .transaction(|tx| {
            Ok((
                tx.count_samples(Tier::FiveSeconds, Some("h1"))?,
                tx.count_samples(Tier::OneMinute, Some("h1"))?,
                tx.count_child_rows()?,
            ))
        })
        .unwrap();
    assert_eq!((live, minutes, children), (0, 0, (0, 0)));
    assert!(!harness.ingestor.handlers().knows_host("h1"));

    let hosts = harness.query.hosts().await.unwrap();
    assert_eq!(hosts.len(), 1);
    assert_eq!(hosts[0].host, "h2");
    assert!(matches!(
        harness.query.series(Metric::Ram, "h1", Tier::OneMinute, None, None).await,
        Err(QueryError::UnknownHost(_))
    ));

    // the host may come back, starting from a fresh counter snapshot
    let back = harness.send(&agents[0]).await.unwrap();
    assert_eq!(back.cpu, None);
}

#[tokio::test]
async fn test_agent_reboot_yields_absent_cpu_once() {
    let harness = TestHarness::new().unwrap();
    let mut agent = harness.agent("h1");
    for _ in 0..2 {
        harness.clock.advance(5_000);
        agent.step(5_000, 0.5);
        harness.send(&agent).await.unwrap();
    }
    agent.reboot();
    harness.clock.advance(5_000);
    agent.step(5_000, 0.5);
    assert_eq!(harness.send(&agent).await.unwrap().cpu, None);

    harness.clock.advance(5_000);
    agent.step(5_000, 0.5);
    assert_eq!(harness.send(&agent).await.unwrap().cpu.map(|c| c.busy), Some(5_000));
}
