use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, info_span, Instrument};

use super::checks::{check_host, HostWindow, EVALUATION_WINDOW_MS};
use super::notify::{AlertSink, NotificationFilter, NotifyError};
use super::{AlertEvent, AlertEventKind, AlertLevel, AlertType, OpenAlert, Verdict};
use crate::clock::SharedClock;
use crate::models::{Tier, Timestamp};
use crate::state::{new_state, Shared};
use crate::store::{StoreError, TelemetryStore};

#[derive(Debug, thiserror::Error)]
pub enum AlertError {
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
    #[error("evaluation task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("notification failed: {0}")]
    Notify(#[from] NotifyError),
}

/// Alertes ouvertes, clé (host, type)
#[derive(Debug, Default)]
pub struct AlertBook {
    open: HashMap<(String, AlertType), OpenAlert>,
}

impl AlertBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applique un verdict ; retourne l'événement produit s'il y en a un
    pub fn apply(&mut self, host: &str, alert_type: AlertType, verdict: Verdict) -> Option<AlertEvent> {
        let key = (host.to_string(), alert_type);
        let current = self.open.get(&key).map(|a| a.level);
        match (current, verdict) {
            (None, Verdict::Raise { level, since, message }) => {
                let alert = OpenAlert {
                    host: host.to_string(),
                    alert_type,
                    since,
                    level,
                    message,
                };
                self.open.insert(key, alert.clone());
                Some(AlertEvent {
                    kind: AlertEventKind::Started,
                    alert,
                })
            }
            (None, _) => None,
            (Some(current), Verdict::Raise { level, message, .. }) => {
                let kind = match (current, level) {
                    (AlertLevel::Warning, AlertLevel::Critical) => AlertEventKind::Escalated,
                    (AlertLevel::Critical, AlertLevel::Warning) => AlertEventKind::DeEscalated,
                    _ => return None,
                };
                // la date de début d'origine est conservée
                let open = self.open.get_mut(&key)?;
                open.level = level;
                open.message = message;
                Some(AlertEvent {
                    kind,
                    alert: open.clone(),
                })
            }
            (Some(_), Verdict::Clear { message }) => {
                let mut alert = self.open.remove(&key)?;
                alert.message = message;
                Some(AlertEvent {
                    kind: AlertEventKind::Ended,
                    alert,
                })
            }
            (Some(_), Verdict::Unchanged) => None,
        }
    }

    pub fn evict_host(&mut self, host: &str) -> usize {
        let before = self.open.len();
        self.open.retain(|(h, _), _| h != host);
        before - self.open.len()
    }

    pub fn list(&self) -> Vec<OpenAlert> {
        let mut alerts: Vec<OpenAlert> = self.open.values().cloned().collect();
        alerts.sort_by(|a, b| (&a.host, a.alert_type).cmp(&(&b.host, b.alert_type)));
        alerts
    }
}

/// Règles après chaque minute archivée, événements filtrés vers le sink
pub struct AlertEngine {
    store: Arc<TelemetryStore>,
    clock: SharedClock,
    book: Shared<AlertBook>,
    filter: Shared<NotificationFilter>,
    sink: Arc<dyn AlertSink>,
    last_boundary: AsyncMutex<Option<Timestamp>>,
}

impl AlertEngine {
    pub fn new(store: Arc<TelemetryStore>, clock: SharedClock, sink: Arc<dyn AlertSink>) -> Self {
        Self {
            store,
            clock,
            book: new_state(AlertBook::new()),
            filter: new_state(NotificationFilter::new()),
            sink,
            last_boundary: AsyncMutex::new(None),
        }
    }

    pub fn open_alerts(&self) -> Vec<OpenAlert> {
        self.book.lock().list()
    }

    pub fn sink(&self) -> Arc<dyn AlertSink> {
        self.sink.clone()
    }

    pub fn evict_host(&self, host: &str) {
        let dropped = self.book.lock().evict_host(host);
        self.filter.lock().evict_host(host);
        debug!(host, dropped, "alert state evicted");
    }

    /// Évaluation déclenchée par l'archiver : les erreurs sont journalisées, jamais propagées
    pub async fn run(&self, boundary: Timestamp) {
        let span = info_span!("alerts", boundary);
        if let Err(e) = self.evaluate(boundary).instrument(span).await {
            error!(boundary, error = %e, "alert evaluation failed");
        }
    }

    /// Évalue la fenêtre close par `boundary`. Évaluations sérialisées, une
    /// frontière déjà évaluée est ignorée.
    pub async fn evaluate(&self, boundary: Timestamp) -> Result<Vec<AlertEvent>, AlertError> {
        let mut last = self.last_boundary.lock().await;
        if last.is_some_and(|b| b >= boundary) {
            debug!(boundary, "boundary already evaluated");
            return Ok(Vec::new());
        }

        info!("checking for alerts");
        let store = self.store.clone();
        let windows = tokio::task::spawn_blocking(move || load_windows(&store, boundary)).await??;
        let now = self.clock.now_ms();

        let events = {
            let mut book = self.book.lock();
            let mut events = Vec::new();
            for window in &windows {
                for (alert_type, verdict) in check_host(window, now) {
                    events.extend(book.apply(&window.host.host, alert_type, verdict));
                }
            }
            events
        };
        *last = Some(boundary);

        let open = self.book.lock().list();
        let selection = self.filter.lock().select(&events, &open, now);
        if selection.entries.is_empty() {
            info!(events = events.len(), "no alert to notify");
        } else {
            info!(events = events.len(), notified = selection.entries.len(), "notifying alert events");
            // non notifiée tant que le sink n'a pas accepté : reproposée au prochain passage
            self.sink.notify(&selection.entries).await?;
            self.filter.lock().commit(selection.announced, now);
        }
        Ok(events)
    }
}

fn load_windows(store: &TelemetryStore, boundary: Timestamp) -> Result<Vec<HostWindow>, StoreError> {
    store.transaction(|tx| {
        tx.hosts()?
            .into_iter()
            .map(|host| -> Result<HostWindow, StoreError> {
                let recent = tx.range_query(
                    Tier::OneMinute,
                    Some(&host.host),
                    boundary - EVALUATION_WINDOW_MS,
                    boundary,
                )?;
                let latest_live = tx
                    .latest_sample(Tier::FiveSeconds, &host.host)?
                    .map(|s| s.timestamp);
                Ok(HostWindow {
                    host,
                    recent,
                    latest_live,
                })
            })
            .collect()
    })
}
