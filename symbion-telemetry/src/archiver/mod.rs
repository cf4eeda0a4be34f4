/*!
 * ARCHIVER - Downsampling périodique et rétention des tiers
 *
 * RÔLE :
 * Sur chaque frontière d'horloge (1min, 20min, 2h), fusionne les échantillons
 * du tier fin vers le tier grossier puis purge ce qui a dépassé sa rétention.
 *
 * FONCTIONNEMENT :
 * - Boucle légère toutes les 500ms, qui ne fait que détecter les frontières
 * - Chaque passe tourne dans une tâche détachée, sur le pool bloquant, dans
 *   une seule transaction SQLite (lecture stable de la fenêtre source)
 * - Passes strictement imbriquées : 1min, puis 20min, puis 2h
 * - Une fois la passe écrite, la même tâche évalue les alertes sur cette frontière
 * - Au démarrage, la fenêtre précédente de chaque tier est rejouée : ce qu'un
 *   arrêt a laissé en suspens est archivé, sans doublon pour ce qui existe déjà
 *
 * ERREURS :
 * Un échec de passe est fatal : log puis arrêt du processus. Le redémarrage
 * est le chemin de reprise.
 */

pub mod boundary;
pub mod merge;

pub use boundary::{BoundaryTracker, PassPlan, Window};

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{error, info, info_span};

use crate::alerts::AlertEngine;
use crate::clock::SharedClock;
use crate::health::HealthTracker;
use crate::models::{Tier, Timestamp, DAY_MS, MINUTE_MS};
use crate::store::{StoreError, StoreTx, TelemetryStore};

/// Âge maximal des échantillons bruts
pub const LIVE_RETENTION_MS: i64 = 5 * MINUTE_MS;
/// Âge maximal des tiers 1min, 20min et 2h
pub const ARCHIVE_RETENTION_MS: i64 = 31 * DAY_MS;

const TICK: Duration = Duration::from_millis(500);

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
    #[error("archive task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassReport {
    pub boundary: Timestamp,
    /// Destination samples written per rollup, in pass order.
    pub written: Vec<(Tier, usize)>,
    pub deleted: usize,
}

pub struct Archiver {
    store: Arc<TelemetryStore>,
    clock: SharedClock,
    alerts: Option<Arc<AlertEngine>>,
    health: Option<HealthTracker>,
    pass_lock: AsyncMutex<()>,
}

impl Archiver {
    pub fn new(store: Arc<TelemetryStore>, clock: SharedClock) -> Self {
        Self {
            store,
            clock,
            alerts: None,
            health: None,
            pass_lock: AsyncMutex::new(()),
        }
    }

    pub fn with_alerts(mut self, engine: Arc<AlertEngine>) -> Self {
        self.alerts = Some(engine);
        self
    }

    pub fn with_health(mut self, health: HealthTracker) -> Self {
        self.health = Some(health);
        self
    }

    /// Démarre la boucle de scheduling
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        let mut tracker = BoundaryTracker::starting_at(self.clock.now_ms());
        info!("archiver started");

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(TICK);
            loop {
                interval.tick().await;
                let Some(plan) = tracker.advance(self.clock.now_ms()) else {
                    continue;
                };
                let archiver = self.clone();
                tokio::spawn(async move {
                    if let Err(e) = archiver.run_pass(plan).await {
                        error!(boundary = plan.boundary(), error = %e, "archiving failed, shutting down");
                        std::process::exit(1);
                    }
                    archiver.evaluate_alerts(plan.boundary()).await;
                });
            }
        })
    }

    /// Une passe ; jamais deux en parallèle
    pub async fn run_pass(&self, plan: PassPlan) -> Result<PassReport, ArchiveError> {
        let _guard = self.pass_lock.lock().await;
        let store = self.store.clone();
        let report = tokio::task::spawn_blocking(move || archive(&store, &plan)).await??;

        info!(
            boundary = report.boundary,
            written = ?report.written,
            deleted = report.deleted,
            "archive pass done"
        );
        if let Some(health) = &self.health {
            health.record_archive(report.boundary);
        }
        Ok(report)
    }

    /// Évaluation des alertes pour la minute archivée ; sans moteur, rien à faire
    pub async fn evaluate_alerts(&self, boundary: Timestamp) {
        if let Some(engine) = &self.alerts {
            engine.run(boundary).await;
        }
    }
}

pub fn archive(store: &TelemetryStore, plan: &PassPlan) -> Result<PassReport, StoreError> {
    let _span = info_span!("archive", boundary = plan.boundary()).entered();
    store.transaction(|tx| {
        let mut report = PassReport {
            boundary: plan.boundary(),
            ..PassReport::default()
        };
        for (from, to, window) in plan.rollups() {
            let written = rollup(tx, from, to, window)?;
            report.written.push((to, written));
            match to {
                Tier::OneMinute => {
                    report.deleted += tx.delete_older_than(&[Tier::FiveSeconds], window.end - LIVE_RETENTION_MS)?;
                }
                Tier::TwoHours => {
                    report.deleted += tx.delete_older_than(
                        &[Tier::OneMinute, Tier::TwentyMinutes, Tier::TwoHours],
                        window.end - ARCHIVE_RETENTION_MS,
                    )?;
                }
                _ => {}
            }
        }
        Ok(report)
    })
}

fn rollup(tx: &StoreTx<'_>, from: Tier, to: Tier, window: Window) -> Result<usize, StoreError> {
    let source = tx.range_query(from, None, window.start, window.end)?;
    // a replayed boundary keeps the rows already written
    let done = tx.hosts_with_sample_at(to, window.start)?;
    let merged: Vec<_> = merge::rollup(&source, to, window.start)
        .into_iter()
        .filter(|s| !done.contains(&s.host))
        .collect();
    tx.insert_full(&merged)?;
    Ok(merged.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::{CpuUsage, Host, Sample, HOUR_MS};

    const T0: Timestamp = 1_700_006_400_000;

    fn seeded() -> Arc<TelemetryStore> {
        let store = TelemetryStore::open_in_memory().unwrap();
        store
            .transaction(|tx| {
                tx.upsert_host(&Host {
                    host: "h1".into(),
                    ram_total: 1_000,
                    swap_total: 0,
                })
            })
            .unwrap();
        Arc::new(store)
    }

    fn sample(tier: Tier, ts: Timestamp, busy: i64) -> Sample {
        Sample {
            tier,
            host: "h1".into(),
            timestamp: ts,
            cpu: Some(CpuUsage { busy, io: 0, steal: 0 }),
            ram_used: 100,
            swap_used: 0,
            net: Vec::new(),
            disks: Vec::new(),
        }
    }

    fn plan(end: Timestamp) -> PassPlan {
        PassPlan {
            minute: Window { start: end - MINUTE_MS, end },
            twenty_minutes: None,
            two_hours: None,
        }
    }

    #[test]
    fn test_minute_pass_rolls_up_and_sweeps_live_tier() {
        let store = seeded();
        let boundary = T0 + 10 * MINUTE_MS;
        store
            .transaction(|tx| {
                tx.insert_full(&[
                    sample(Tier::FiveSeconds, boundary - 6 * MINUTE_MS, 1_000),
                    sample(Tier::FiveSeconds, boundary - 50_000, 2_000),
                    sample(Tier::FiveSeconds, boundary - 10_000, 4_000),
                    sample(Tier::FiveSeconds, boundary + 1_000, 9_000),
                ])
            })
            .unwrap();

        let report = archive(&store, &plan(boundary)).unwrap();
        assert_eq!(report.written, vec![(Tier::OneMinute, 1)]);
        assert_eq!(report.deleted, 1);

        let minute = store
            .transaction(|tx| tx.range_query(Tier::OneMinute, Some("h1"), 0, i64::MAX))
            .unwrap();
        assert_eq!(minute.len(), 1);
        assert_eq!(minute[0].timestamp, boundary - MINUTE_MS);
        assert_eq!(minute[0].cpu.map(|c| c.busy), Some(3_000));

        let live = store
            .transaction(|tx| tx.range_query(Tier::FiveSeconds, None, 0, i64::MAX))
            .unwrap();
        assert!(live.iter().all(|s| s.timestamp >= boundary - LIVE_RETENTION_MS));
        assert_eq!(live.len(), 3);
    }

    #[test]
    fn test_host_without_samples_gets_no_destination_row() {
        let store = seeded();
        let report = archive(&store, &plan(T0)).unwrap();
        assert_eq!(report.written, vec![(Tier::OneMinute, 0)]);
    }

    #[test]
    fn test_replayed_boundary_writes_nothing_twice() {
        let store = seeded();
        let boundary = T0 + MINUTE_MS;
        store
            .transaction(|tx| tx.insert_full(&[sample(Tier::FiveSeconds, boundary - 10_000, 1_000)]))
            .unwrap();

        archive(&store, &plan(boundary)).unwrap();
        let again = archive(&store, &plan(boundary)).unwrap();
        assert_eq!(again.written, vec![(Tier::OneMinute, 0)]);
        let count = store.transaction(|tx| tx.count_samples(Tier::OneMinute, None)).unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_day_boundary_sweeps_archive_tiers() {
        let store = seeded();
        let old = T0 - 32 * DAY_MS;
        store
            .transaction(|tx| {
                tx.insert_full(&[
                    sample(Tier::OneMinute, old, 1),
                    sample(Tier::TwentyMinutes, old, 1),
                    sample(Tier::TwoHours, old, 1),
                    sample(Tier::TwoHours, T0 - 30 * DAY_MS, 1),
                    sample(Tier::TwentyMinutes, T0 - HOUR_MS, 500),
                    sample(Tier::TwentyMinutes, T0 - 20 * MINUTE_MS, 1_500),
                ])
            })
            .unwrap();
        let full = PassPlan {
            minute: Window { start: T0 - MINUTE_MS, end: T0 },
            twenty_minutes: Some(Window { start: T0 - 20 * MINUTE_MS, end: T0 }),
            two_hours: Some(Window { start: T0 - 2 * HOUR_MS, end: T0 }),
        };
        let report = archive(&store, &full).unwrap();
        assert_eq!(
            report.written,
            vec![(Tier::OneMinute, 0), (Tier::TwentyMinutes, 0), (Tier::TwoHours, 1)]
        );

        let cutoff = T0 - ARCHIVE_RETENTION_MS;
        for tier in [Tier::OneMinute, Tier::TwentyMinutes, Tier::TwoHours] {
            let rows = store.transaction(|tx| tx.range_query(tier, None, 0, i64::MAX)).unwrap();
            assert!(rows.iter().all(|s| s.timestamp >= cutoff), "{tier} kept expired rows");
        }
        let two_hours = store
            .transaction(|tx| tx.range_query(Tier::TwoHours, None, T0 - 2 * HOUR_MS, T0))
            .unwrap();
        assert_eq!(two_hours[0].cpu.map(|c| c.busy), Some(1_000));
    }

    #[test]
    fn test_restart_archives_the_pending_minute() {
        let store = seeded();
        store
            .transaction(|tx| {
                tx.insert_full(&[
                    sample(Tier::FiveSeconds, T0 + 10_000, 1_000),
                    sample(Tier::FiveSeconds, T0 + 50_000, 3_000),
                ])
            })
            .unwrap();

        // stopped before the T0 + 1min pass, back 20s later
        let now = T0 + MINUTE_MS + 20_000;
        let plan = BoundaryTracker::starting_at(now).advance(now).unwrap();
        assert_eq!(plan.minute, Window { start: T0, end: T0 + MINUTE_MS });
        archive(&store, &plan).unwrap();

        let minute = store
            .transaction(|tx| tx.range_query(Tier::OneMinute, Some("h1"), 0, i64::MAX))
            .unwrap();
        assert_eq!(minute.len(), 1);
        assert_eq!(minute[0].timestamp, T0);
        assert_eq!(minute[0].cpu.map(|c| c.busy), Some(2_000));

        // a second restart in the same minute keeps the row as it is
        let again = BoundaryTracker::starting_at(now + 5_000).advance(now + 5_000).unwrap();
        assert_eq!(archive(&store, &again).unwrap().written[0], (Tier::OneMinute, 0));
    }

    #[tokio::test]
    async fn test_run_pass_reports_and_records_health() {
        let store = seeded();
        let clock = Arc::new(ManualClock::new(T0));
        let health = HealthTracker::new();
        let archiver = Archiver::new(store.clone(), clock).with_health(health.clone());
        store
            .transaction(|tx| tx.insert_full(&[sample(Tier::FiveSeconds, T0 - 5_000, 500)]))
            .unwrap();
        let report = archiver.run_pass(plan(T0)).await.unwrap();
        assert_eq!(report.boundary, T0);
        assert_eq!(health.last_archive(), Some(T0));
    }
}
