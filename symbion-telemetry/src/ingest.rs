/*!
 * INGESTION - Chemin d'écriture d'un payload agent
 *
 * FONCTIONNEMENT :
 * 1. Vérification de la clé agent (si configurée)
 * 2. Ordre strict par hôte : un horodatage <= au dernier accepté est rejeté
 * 3. Décodage des compteurs puis conversion en débits par les handlers
 * 4. Upsert de l'hôte + échantillon TIER0 avec ses lignes réseau/disque,
 *    dans une seule transaction
 * 5. Si l'écriture échoue, l'ordre et les relevés de l'hôte sont rendus :
 *    le même payload peut être renvoyé sans conflit
 *
 * La suppression d'un hôte passe aussi par ici : elle nettoie le stockage et
 * tout l'état en mémoire rattaché à ce nom.
 */

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::alerts::{AlertEngine, NotificationEntry};
use crate::counters::{CounterHandler, CounterHandlers};
use crate::health::HealthTracker;
use crate::models::{Host, Sample, Tier, Timestamp};
use crate::payload::{AgentPayload, ParsedPayload, PayloadError};
use crate::store::{StoreError, TelemetryStore};

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("invalid agent key for host '{0}'")]
    Unauthorized(String),
    #[error("malformed payload: {0}")]
    Payload(#[from] PayloadError),
    #[error("payload for '{host}' at {date} is not newer than {last}")]
    OutOfOrder {
        host: String,
        date: Timestamp,
        last: Timestamp,
    },
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
    #[error("ingest task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub struct Ingestor {
    store: Arc<TelemetryStore>,
    handlers: CounterHandlers,
    last_seen: DashMap<String, Timestamp>,
    agent_key: Option<String>,
    alerts: Option<Arc<AlertEngine>>,
    health: Option<HealthTracker>,
}

impl Ingestor {
    pub fn new(store: Arc<TelemetryStore>, agent_key: Option<String>) -> Self {
        Self {
            store,
            handlers: CounterHandlers::new(),
            last_seen: DashMap::new(),
            agent_key: agent_key.filter(|k| !k.is_empty()),
            alerts: None,
            health: None,
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

    pub fn handlers(&self) -> &CounterHandlers {
        &self.handlers
    }

    /// Hosts seen since startup.
    pub fn tracked_hosts(&self) -> usize {
        self.last_seen.len()
    }

    pub fn last_seen(&self, host: &str) -> Option<Timestamp> {
        self.last_seen.get(host).map(|e| *e.value())
    }

    /// Accepts one agent payload and returns the TIER0 sample that was stored.
    pub async fn ingest(&self, payload: AgentPayload) -> Result<Sample, IngestError> {
        let result = self.ingest_inner(payload).await;
        if let Some(health) = &self.health {
            match result {
                Ok(_) => health.record_accepted(),
                Err(_) => health.record_rejected(),
            }
        }
        result
    }

    async fn ingest_inner(&self, payload: AgentPayload) -> Result<Sample, IngestError> {
        self.check_key(&payload)?;
        let parsed = payload.parse()?;
        let previous = self.accept_order(&parsed.host, parsed.date)?;

        let sample = self.convert(&parsed);
        let host = Host {
            host: parsed.host.clone(),
            ram_total: parsed.ram.ram_total,
            swap_total: parsed.ram.swap_total,
        };

        let store = self.store.clone();
        let row = sample.clone();
        let written = tokio::task::spawn_blocking(move || {
            store.transaction(|tx| {
                tx.upsert_host(&host)?;
                tx.insert_full(std::slice::from_ref(&row))
            })
        })
        .await
        .map_err(IngestError::from)
        .and_then(|r| r.map_err(IngestError::from));
        if let Err(e) = written {
            self.rollback_order(&parsed.host, parsed.date, previous);
            return Err(e);
        }

        debug!(
            host = %sample.host,
            date = sample.timestamp,
            cpu = sample.cpu.is_some(),
            interfaces = sample.net.len(),
            disks = sample.disks.len(),
            "payload stored"
        );
        Ok(sample)
    }

    fn check_key(&self, payload: &AgentPayload) -> Result<(), IngestError> {
        match &self.agent_key {
            Some(expected) if *expected != payload.key => {
                warn!(host = %payload.host, "payload rejected: invalid agent key");
                Err(IngestError::Unauthorized(payload.host.clone()))
            }
            _ => Ok(()),
        }
    }

    /// Atomic per-host check-and-set of the last accepted date. Returns the
    /// date it replaced.
    fn accept_order(&self, host: &str, date: Timestamp) -> Result<Option<Timestamp>, IngestError> {
        match self.last_seen.entry(host.to_string()) {
            Entry::Occupied(mut e) => {
                let last = *e.get();
                if date <= last {
                    warn!(host, date, last, "out-of-order payload ignored");
                    return Err(IngestError::OutOfOrder {
                        host: host.to_string(),
                        date,
                        last,
                    });
                }
                e.insert(date);
                Ok(Some(last))
            }
            Entry::Vacant(e) => {
                e.insert(date);
                Ok(None)
            }
        }
    }

    // Un payload plus récent accepté entre-temps garde la main : rien à rendre
    fn rollback_order(&self, host: &str, date: Timestamp, previous: Option<Timestamp>) {
        let Entry::Occupied(mut e) = self.last_seen.entry(host.to_string()) else {
            return;
        };
        if *e.get() != date {
            return;
        }
        match previous {
            Some(last) => {
                e.insert(last);
            }
            None => {
                e.remove();
            }
        }
        // les relevés de ce payload ne doivent pas servir de base au suivant
        self.handlers.evict_host(host);
        warn!(host, date, "payload not stored, host ordering rolled back");
    }

    fn convert(&self, parsed: &ParsedPayload) -> Sample {
        let host = parsed.host.as_str();
        Sample {
            tier: Tier::FiveSeconds,
            host: host.to_string(),
            timestamp: parsed.date,
            cpu: self.handlers.cpu.handle(host, parsed.date, parsed.cpu),
            ram_used: parsed.ram.ram_used(),
            swap_used: parsed.ram.swap_used(),
            net: self.handlers.net.handle(host, parsed.date, parsed.net.clone()),
            disks: self.handlers.disk.handle(host, parsed.date, parsed.disk.clone()),
        }
    }

    /// Deletes `host` everywhere. Returns false when the store did not know it.
    pub async fn remove_host(&self, host: &str) -> Result<bool, IngestError> {
        let store = self.store.clone();
        let name = host.to_string();
        let removed = tokio::task::spawn_blocking(move || store.transaction(|tx| tx.remove_host(&name))).await??;

        self.handlers.evict_host(host);
        self.last_seen.remove(host);
        if let Some(engine) = &self.alerts {
            engine.evict_host(host);
        }
        if !removed {
            return Ok(false);
        }

        info!(host, "host removed");
        if let Some(engine) = &self.alerts {
            if let Err(e) = engine.sink().notify(&[NotificationEntry::host_removed(host)]).await {
                warn!(host, error = %e, "host removal notification failed");
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use crate::payload::DiskPayload;

    fn payload(host: &str, date: Timestamp, busy: i64, idle: i64) -> AgentPayload {
        AgentPayload {
            key: "secret".into(),
            host: host.into(),
            date,
            cpu: format!("{busy} 0 0 {idle} 0 0 0 0"),
            ram: "1000 400 200 200".into(),
            net: BTreeMap::new(),
            disk: DiskPayload::default(),
        }
    }

    fn ingestor() -> Ingestor {
        let store = Arc::new(TelemetryStore::open_in_memory().unwrap());
        Ingestor::new(store, Some("secret".into())).with_health(HealthTracker::new())
    }

    #[tokio::test]
    async fn test_first_payload_has_no_cpu_then_rates_follow() {
        let ingestor = ingestor();
        let first = ingestor.ingest(payload("h1", 10_000, 100, 100)).await.unwrap();
        assert_eq!(first.cpu, None);
        assert_eq!(first.ram_used, 600);

        let second = ingestor.ingest(payload("h1", 15_000, 150, 150)).await.unwrap();
        assert_eq!(second.cpu.map(|c| c.busy), Some(5_000));
        assert_eq!(ingestor.tracked_hosts(), 1);
    }

    #[tokio::test]
    async fn test_wrong_key_is_rejected() {
        let ingestor = ingestor();
        let mut bad = payload("h1", 10_000, 1, 1);
        bad.key = "nope".into();
        assert!(matches!(ingestor.ingest(bad).await, Err(IngestError::Unauthorized(_))));
        assert_eq!(ingestor.tracked_hosts(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_and_older_dates_rejected() {
        let ingestor = ingestor();
        ingestor.ingest(payload("h1", 10_000, 1, 1)).await.unwrap();
        assert!(matches!(
            ingestor.ingest(payload("h1", 10_000, 2, 2)).await,
            Err(IngestError::OutOfOrder { last: 10_000, .. })
        ));
        assert!(matches!(
            ingestor.ingest(payload("h1", 5_000, 2, 2)).await,
            Err(IngestError::OutOfOrder { .. })
        ));
        // another host has its own ordering
        assert!(ingestor.ingest(payload("h2", 5_000, 2, 2)).await.is_ok());
        assert_eq!(ingestor.last_seen("h1"), Some(10_000));
    }

    #[tokio::test]
    async fn test_malformed_payload_counted_as_rejected() {
        let health = HealthTracker::new();
        let store = Arc::new(TelemetryStore::open_in_memory().unwrap());
        let ingestor = Ingestor::new(store, None).with_health(health.clone());
        let mut bad = payload("h1", 10_000, 1, 1);
        bad.ram = "1 2".into();
        assert!(matches!(ingestor.ingest(bad).await, Err(IngestError::Payload(_))));
        let report = health.get_health(0);
        assert_eq!(report.payloads_rejected, 1);
        assert_eq!(report.payloads_accepted, 0);
    }

    #[tokio::test]
    async fn test_remove_host_clears_memory_state() {
        let ingestor = ingestor();
        ingestor.ingest(payload("h1", 10_000, 1, 1)).await.unwrap();
        assert!(ingestor.handlers().knows_host("h1"));

        assert!(ingestor.remove_host("h1").await.unwrap());
        assert!(!ingestor.handlers().knows_host("h1"));
        assert_eq!(ingestor.last_seen("h1"), None);
        assert!(!ingestor.remove_host("h1").await.unwrap());

        // a fresh first sample again
        let again = ingestor.ingest(payload("h1", 1_000, 5, 5)).await.unwrap();
        assert_eq!(again.cpu, None);
    }

    #[tokio::test]
    async fn test_failed_write_can_be_retried() {
        let store = Arc::new(TelemetryStore::open_in_memory().unwrap());
        let ingestor = Ingestor::new(store.clone(), Some("secret".into())).with_health(HealthTracker::new());
        ingestor.ingest(payload("h1", 5_000, 100, 100)).await.unwrap();

        // a row already sitting at the same date makes the insert fail
        let blocker = Sample {
            tier: Tier::FiveSeconds,
            host: "h1".into(),
            timestamp: 10_000,
            cpu: None,
            ram_used: 0,
            swap_used: 0,
            net: Vec::new(),
            disks: Vec::new(),
        };
        store.transaction(|tx| tx.insert_samples(&[blocker])).unwrap();
        assert!(matches!(
            ingestor.ingest(payload("h1", 10_000, 150, 150)).await,
            Err(IngestError::Store(_))
        ));
        assert_eq!(ingestor.last_seen("h1"), Some(5_000));
        assert!(!ingestor.handlers().knows_host("h1"));

        store
            .transaction(|tx| tx.delete_older_than(&[Tier::FiveSeconds], 10_001))
            .unwrap();
        let retried = ingestor.ingest(payload("h1", 10_000, 150, 150)).await.unwrap();
        assert_eq!(retried.timestamp, 10_000);
        assert_eq!(ingestor.last_seen("h1"), Some(10_000));
        let next = ingestor.ingest(payload("h1", 15_000, 200, 200)).await.unwrap();
        assert_eq!(next.cpu.map(|c| c.busy), Some(5_000));
    }

    #[tokio::test]
    async fn test_failed_first_write_forgets_the_host() {
        let store = Arc::new(TelemetryStore::open_in_memory().unwrap());
        let ingestor = Ingestor::new(store.clone(), None);
        store.transaction(|tx| {
            tx.upsert_host(&Host {
                host: "h1".into(),
                ram_total: 1000,
                swap_total: 200,
            })?;
            tx.insert_samples(&[Sample {
                tier: Tier::FiveSeconds,
                host: "h1".into(),
                timestamp: 10_000,
                cpu: None,
                ram_used: 0,
                swap_used: 0,
                net: Vec::new(),
                disks: Vec::new(),
            }])
        })
        .unwrap();

        assert!(ingestor.ingest(payload("h1", 10_000, 1, 1)).await.is_err());
        assert_eq!(ingestor.last_seen("h1"), None);
        assert_eq!(ingestor.tracked_hosts(), 0);
    }
}
