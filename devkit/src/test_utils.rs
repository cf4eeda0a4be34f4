/*!
Test Harness pour le pipeline télémétrie

Assemble un pipeline complet en mémoire, piloté par une horloge manuelle :
- les payloads sont ingérés à la date courante de l'horloge
- `tick()` rejoue ce que ferait l'archiver à la frontière courante : passe
  d'archivage puis évaluation des alertes, attendue (résultats déterministes)
- le premier `tick()` rattrape la minute précédant le démarrage, comme au
  lancement du service
*/

use anyhow::Result;
use std::sync::Arc;

use symbion_telemetry::alerts::AlertEngine;
use symbion_telemetry::archiver::{Archiver, BoundaryTracker, PassReport};
use symbion_telemetry::clock::{Clock, ManualClock};
use symbion_telemetry::health::HealthTracker;
use symbion_telemetry::ingest::{IngestError, Ingestor};
use symbion_telemetry::models::{Sample, Timestamp};
use symbion_telemetry::query::QueryService;
use symbion_telemetry::state::AppState;
use symbion_telemetry::store::TelemetryStore;

use crate::agent_stub::{AgentSimulator, RecordingSink};

/// Day-aligned start, so every boundary period starts fresh.
pub const T0: Timestamp = 1_700_006_400_000;
pub const AGENT_KEY: &str = "devkit-agent-key";
/// Agent reporting period
pub const REPORT_EVERY_MS: i64 = 5_000;

/// Harness de test du pipeline complet
pub struct TestHarness {
    pub store: Arc<TelemetryStore>,
    pub clock: Arc<ManualClock>,
    pub sink: RecordingSink,
    pub engine: Arc<AlertEngine>,
    pub ingestor: Arc<Ingestor>,
    pub query: Arc<QueryService>,
    pub health: HealthTracker,
    archiver: Archiver,
    tracker: BoundaryTracker,
}

impl TestHarness {
    /// Crée un pipeline vierge, horloge à `T0 + 1s`
    pub fn new() -> Result<Self> {
        env_logger::try_init().ok(); // Init logging pour tests

        let store = Arc::new(TelemetryStore::open_in_memory()?);
        let clock = Arc::new(ManualClock::new(T0 + 1_000));
        let sink = RecordingSink::new();
        let health = HealthTracker::new();

        let engine = Arc::new(AlertEngine::new(store.clone(), clock.clone(), Arc::new(sink.clone())));
        let ingestor = Arc::new(
            Ingestor::new(store.clone(), Some(AGENT_KEY.to_string()))
                .with_alerts(engine.clone())
                .with_health(health.clone()),
        );
        let query = Arc::new(QueryService::new(store.clone(), clock.clone()));
        let archiver = Archiver::new(store.clone(), clock.clone())
            .with_alerts(engine.clone())
            .with_health(health.clone());
        let tracker = BoundaryTracker::starting_at(T0 + 1_000);

        Ok(Self {
            store,
            clock,
            sink,
            engine,
            ingestor,
            query,
            health,
            archiver,
            tracker,
        })
    }

    pub fn agent(&self, host: &str) -> AgentSimulator {
        AgentSimulator::new(host, AGENT_KEY)
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now_ms()
    }

    /// État partagé pour monter le routeur HTTP sur ce pipeline
    pub fn app_state(&self) -> AppState {
        AppState {
            ingestor: self.ingestor.clone(),
            query: self.query.clone(),
            alerts: self.engine.clone(),
            health: self.health.clone(),
        }
    }

    /// Ingests the agent's current counters at the current clock date.
    pub async fn send(&self, agent: &AgentSimulator) -> Result<Sample, IngestError> {
        self.ingestor.ingest(agent.payload(self.now())).await
    }

    /// Runs the archive pass for the current boundary, if one was crossed,
    /// then the archiver's alert evaluation for that boundary.
    pub async fn tick(&mut self) -> Result<Option<PassReport>> {
        let Some(plan) = self.tracker.advance(self.now()) else {
            return Ok(None);
        };
        let report = self.archiver.run_pass(plan).await?;
        self.archiver.evaluate_alerts(plan.boundary()).await;
        log::info!("boundary {} archived: {:?}", report.boundary, report.written);
        Ok(Some(report))
    }

    /// Moves the clock forward by `ms` and ticks.
    pub async fn advance(&mut self, ms: i64) -> Result<Option<PassReport>> {
        self.clock.advance(ms);
        self.tick().await
    }

    /// Every agent reports each 5 seconds for `duration_ms` with the given CPU
    /// busy fraction; boundaries are processed as they are crossed.
    pub async fn run_agents(&mut self, agents: &mut [AgentSimulator], duration_ms: i64, busy: f64) -> Result<()> {
        let mut elapsed = 0;
        while elapsed < duration_ms {
            self.clock.advance(REPORT_EVERY_MS);
            elapsed += REPORT_EVERY_MS;
            for agent in agents.iter_mut() {
                agent.step(REPORT_EVERY_MS, busy);
                self.send(agent).await?;
            }
            self.tick().await?;
        }
        Ok(())
    }

    /// Lets time pass with no agent reporting.
    pub async fn stay_silent(&mut self, duration_ms: i64) -> Result<()> {
        let mut elapsed = 0;
        while elapsed < duration_ms {
            let step = REPORT_EVERY_MS.min(duration_ms - elapsed);
            elapsed += step;
            self.advance(step).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use symbion_telemetry::models::Tier;

    #[tokio::test]
    async fn test_harness_ingests_and_archives() {
        let mut harness = TestHarness::new().unwrap();
        let mut agents = vec![harness.agent("h1")];
        harness.run_agents(&mut agents, 65_000, 0.1).await.unwrap();

        let minute = harness
            .store
            .transaction(|tx| tx.count_samples(Tier::OneMinute, Some("h1")))
            .unwrap();
        assert_eq!(minute, 1);
        assert!(harness.health.last_archive().is_some());
        assert!(harness.sink.batches().is_empty());
    }

    #[tokio::test]
    async fn test_first_tick_catches_up_then_waits_for_the_minute() {
        let mut harness = TestHarness::new().unwrap();
        let catch_up = harness.tick().await.unwrap().unwrap();
        assert_eq!(catch_up.boundary, T0);
        assert!(harness.advance(10_000).await.unwrap().is_none());
        assert!(harness.advance(50_000).await.unwrap().is_some());
    }
}
