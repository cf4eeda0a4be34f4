/*!
 * NOTIFICATIONS - Filtrage anti-bruit et envoi vers le canal d'alerte
 *
 * FILTRAGE (par lot d'événements d'une évaluation) :
 * - ESCALATED est notifié comme un nouveau STARTED
 * - STARTED n'est notifié qu'en CRITICAL
 * - DE_ESCALATED n'est jamais notifié
 * - ENDED est toujours notifié
 * - Une alerte déjà notifiée ne l'est pas à nouveau tant qu'elle reste ouverte,
 *   sauf "not reporting" qui peut être renotifié après une heure
 */

use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use tracing::{info, warn};

use super::{AlertEvent, AlertEventKind, AlertLevel, AlertType, OpenAlert};
use crate::models::{Timestamp, HOUR_MS};

pub const NOT_REPORTING_RENOTIFY_MS: i64 = HOUR_MS;

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("sink answered with status {0}")]
    Status(u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Color {
    Danger,
    Warning,
    Good,
}

/// Une ligne formatée pour le sink
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationEntry {
    pub text: String,
    pub color: Color,
    pub fallback: String,
}

impl NotificationEntry {
    pub fn new(text: String, color: Color) -> Self {
        let fallback = text.replace('*', "");
        Self { text, color, fallback }
    }

    pub fn from_event(kind: AlertEventKind, event: &AlertEvent) -> Self {
        let label = match kind {
            AlertEventKind::Started => "New Alert",
            AlertEventKind::Escalated => "Escalated Alert",
            AlertEventKind::DeEscalated => "De-Escalated Alert",
            AlertEventKind::Ended => "Closed Alert",
        };
        let color = match (kind, event.alert.level) {
            (AlertEventKind::Ended, _) => Color::Good,
            (_, AlertLevel::Critical) => Color::Danger,
            (_, AlertLevel::Warning) => Color::Warning,
        };
        Self::new(
            format!("*{}* | {}: {}", event.alert.host, label, event.alert.message),
            color,
        )
    }

    pub fn host_removed(host: &str) -> Self {
        Self::new(format!("Removed host '{host}' and all associated data"), Color::Good)
    }
}

/// Mémoire des notifications envoyées, clé (host, type)
#[derive(Debug, Default)]
pub struct NotificationFilter {
    logged: HashMap<(String, AlertType), Timestamp>,
}

/// Résultat de `select` : entrées à envoyer, et alertes à marquer notifiées
/// une fois le lot accepté
#[derive(Debug, Default)]
pub struct Selection {
    pub entries: Vec<NotificationEntry>,
    pub announced: Vec<(String, AlertType)>,
}

impl NotificationFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Filtre et ordonne les événements d'une évaluation.
    ///
    /// `open` : alertes encore ouvertes ; une alerte CRITICAL jamais notifiée
    /// (envoi précédent en échec) est reproposée comme nouvelle alerte.
    pub fn select(&mut self, events: &[AlertEvent], open: &[OpenAlert], now: Timestamp) -> Selection {
        let mut kept: Vec<(AlertEventKind, &AlertEvent)> = Vec::new();
        let mut announced = Vec::new();

        for event in events {
            let key = (event.alert.host.clone(), event.alert.alert_type);
            match event.kind {
                AlertEventKind::Started | AlertEventKind::Escalated => {
                    if event.alert.level != AlertLevel::Critical {
                        continue;
                    }
                    let allowed = match self.logged.get(&key) {
                        None => true,
                        Some(at) => {
                            event.alert.alert_type == AlertType::NotReporting && *at < now - NOT_REPORTING_RENOTIFY_MS
                        }
                    };
                    if allowed {
                        announced.push(key);
                        kept.push((AlertEventKind::Started, event));
                    }
                }
                AlertEventKind::DeEscalated => {}
                AlertEventKind::Ended => {
                    self.logged.remove(&key);
                    kept.push((AlertEventKind::Ended, event));
                }
            }
        }

        let retried: Vec<AlertEvent> = open
            .iter()
            .filter(|a| a.level == AlertLevel::Critical)
            .filter(|a| !self.logged.contains_key(&(a.host.clone(), a.alert_type)))
            .filter(|a| !events.iter().any(|e| e.alert.host == a.host && e.alert.alert_type == a.alert_type))
            .map(|a| AlertEvent {
                kind: AlertEventKind::Started,
                alert: a.clone(),
            })
            .collect();
        for event in &retried {
            announced.push((event.alert.host.clone(), event.alert.alert_type));
            kept.push((AlertEventKind::Started, event));
        }

        kept.sort_by(|(ka, a), (kb, b)| {
            (ka, a.alert.level, a.alert.alert_type, &a.alert.host).cmp(&(kb, b.alert.level, b.alert.alert_type, &b.alert.host))
        });
        Selection {
            entries: kept
                .into_iter()
                .map(|(kind, event)| NotificationEntry::from_event(kind, event))
                .collect(),
            announced,
        }
    }

    pub fn commit(&mut self, announced: Vec<(String, AlertType)>, now: Timestamp) {
        for key in announced {
            self.logged.insert(key, now);
        }
    }

    pub fn evict_host(&mut self, host: &str) {
        self.logged.retain(|(h, _), _| h != host);
    }
}

/// Outbound channel; implementations receive non-empty, ordered batches.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn notify(&self, entries: &[NotificationEntry]) -> Result<(), NotifyError>;
}

/// Webhook entrant Slack
#[derive(Debug, Clone)]
pub struct SlackSink {
    client: reqwest::Client,
    webhook_url: String,
    channel: Option<String>,
    username: Option<String>,
}

#[derive(Serialize)]
struct SlackAttachment<'a> {
    text: &'a str,
    color: Color,
    fallback: &'a str,
    mrkdwn_in: [&'static str; 1],
}

#[derive(Serialize)]
struct SlackMessage<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    channel: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    username: Option<&'a str>,
    attachments: Vec<SlackAttachment<'a>>,
}

impl SlackSink {
    pub fn new(webhook_url: impl Into<String>, channel: Option<String>, username: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            webhook_url: webhook_url.into(),
            channel,
            username,
        }
    }
}

#[async_trait]
impl AlertSink for SlackSink {
    async fn notify(&self, entries: &[NotificationEntry]) -> Result<(), NotifyError> {
        if entries.is_empty() {
            return Ok(());
        }
        let message = SlackMessage {
            channel: self.channel.as_deref(),
            username: self.username.as_deref(),
            attachments: entries
                .iter()
                .map(|e| SlackAttachment {
                    text: &e.text,
                    color: e.color,
                    fallback: &e.fallback,
                    mrkdwn_in: ["text"],
                })
                .collect(),
        };
        let response = self.client.post(&self.webhook_url).json(&message).send().await?;
        if !response.status().is_success() {
            warn!(status = %response.status(), "slack webhook rejected alert batch");
            return Err(NotifyError::Status(response.status().as_u16()));
        }
        info!(entries = entries.len(), "alert batch sent to slack");
        Ok(())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl AlertSink for LogSink {
    async fn notify(&self, entries: &[NotificationEntry]) -> Result<(), NotifyError> {
        for entry in entries {
            match entry.color {
                Color::Danger => warn!(alert = %entry.fallback, "alert"),
                _ => info!(alert = %entry.fallback, "alert"),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(kind: AlertEventKind, host: &str, alert_type: AlertType, level: AlertLevel) -> AlertEvent {
        AlertEvent {
            kind,
            alert: OpenAlert {
                host: host.into(),
                alert_type,
                since: 0,
                level,
                message: "*99.0%* load".into(),
            },
        }
    }

    /// Select, then commit as if the sink accepted the batch.
    fn delivered(filter: &mut NotificationFilter, events: &[AlertEvent], now: Timestamp) -> Vec<NotificationEntry> {
        let selection = filter.select(events, &[], now);
        filter.commit(selection.announced, now);
        selection.entries
    }

    #[test]
    fn test_warning_start_is_silent_but_end_is_notified() {
        let mut filter = NotificationFilter::new();
        let start = event(AlertEventKind::Started, "h1", AlertType::HighRamUsage, AlertLevel::Warning);
        assert!(delivered(&mut filter, &[start], 0).is_empty());

        let end = event(AlertEventKind::Ended, "h1", AlertType::HighRamUsage, AlertLevel::Warning);
        let entries = delivered(&mut filter, &[end], 60_000);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].text, "*h1* | Closed Alert: *99.0%* load");
        assert_eq!(entries[0].fallback, "h1 | Closed Alert: 99.0% load");
        assert_eq!(entries[0].color, Color::Good);
    }

    #[test]
    fn test_escalation_reads_as_new_alert_once() {
        let mut filter = NotificationFilter::new();
        let up = event(AlertEventKind::Escalated, "h1", AlertType::HighCpuLoad, AlertLevel::Critical);
        let entries = delivered(&mut filter, &[up.clone()], 0);
        assert_eq!(entries[0].text, "*h1* | New Alert: *99.0%* load");
        assert_eq!(entries[0].color, Color::Danger);

        let down = event(AlertEventKind::DeEscalated, "h1", AlertType::HighCpuLoad, AlertLevel::Warning);
        assert!(delivered(&mut filter, &[down], 60_000).is_empty());
        // still the same open alert
        assert!(delivered(&mut filter, &[up], 120_000).is_empty());
    }

    #[test]
    fn test_not_reporting_renotified_after_an_hour() {
        let mut filter = NotificationFilter::new();
        let start = event(AlertEventKind::Started, "h1", AlertType::NotReporting, AlertLevel::Critical);
        assert_eq!(delivered(&mut filter, &[start.clone()], 0).len(), 1);
        assert!(delivered(&mut filter, &[start.clone()], 30 * 60_000).is_empty());
        assert_eq!(delivered(&mut filter, &[start], HOUR_MS + 1).len(), 1);
    }

    #[test]
    fn test_undelivered_critical_is_offered_again() {
        let mut filter = NotificationFilter::new();
        let start = event(AlertEventKind::Started, "h1", AlertType::HighRamUsage, AlertLevel::Critical);

        // sink failed: nothing committed
        let failed = filter.select(&[start.clone()], &[start.alert.clone()], 0);
        assert_eq!(failed.entries.len(), 1);

        // next evaluation emits no event, the alert is still open
        let retry = filter.select(&[], &[start.alert.clone()], 60_000);
        assert_eq!(retry.entries.len(), 1);
        assert_eq!(retry.entries[0].fallback, "h1 | New Alert: 99.0% load");
        filter.commit(retry.announced, 60_000);

        assert!(filter.select(&[], &[start.alert.clone()], 120_000).entries.is_empty());
        let warning = OpenAlert {
            level: AlertLevel::Warning,
            ..start.alert.clone()
        };
        assert!(filter.select(&[], &[warning], 120_000).entries.is_empty());
    }

    #[test]
    fn test_escalation_after_failed_start_is_announced() {
        let mut filter = NotificationFilter::new();
        let start = event(AlertEventKind::Started, "h1", AlertType::HighRamUsage, AlertLevel::Critical);
        let _ = filter.select(&[start.clone()], &[start.alert.clone()], 0);

        let down = event(AlertEventKind::DeEscalated, "h1", AlertType::HighRamUsage, AlertLevel::Warning);
        let quiet = filter.select(&[down.clone()], &[down.alert.clone()], 60_000);
        assert!(quiet.entries.is_empty());

        let up = event(AlertEventKind::Escalated, "h1", AlertType::HighRamUsage, AlertLevel::Critical);
        let entries = delivered(&mut filter, &[up], 120_000);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].fallback, "h1 | New Alert: 99.0% load");
    }

    #[test]
    fn test_batch_sorted_by_kind_level_type_host() {
        let mut filter = NotificationFilter::new();
        let batch = vec![
            event(AlertEventKind::Ended, "a", AlertType::HighCpuLoad, AlertLevel::Warning),
            event(AlertEventKind::Started, "b", AlertType::HighRamUsage, AlertLevel::Critical),
            event(AlertEventKind::Started, "a", AlertType::HighRamUsage, AlertLevel::Critical),
            event(AlertEventKind::Started, "z", AlertType::NotReporting, AlertLevel::Critical),
        ];
        let texts: Vec<String> = delivered(&mut filter, &batch, 0).into_iter().map(|e| e.fallback).collect();
        assert_eq!(
            texts,
            vec![
                "z | New Alert: 99.0% load",
                "a | New Alert: 99.0% load",
                "b | New Alert: 99.0% load",
                "a | Closed Alert: 99.0% load",
            ]
        );
    }

    #[test]
    fn test_host_removed_entry() {
        let entry = NotificationEntry::host_removed("h1");
        assert_eq!(entry.text, "Removed host 'h1' and all associated data");
        assert_eq!(entry.color, Color::Good);
    }

    #[tokio::test]
    async fn test_log_sink_accepts_batches() {
        let sink = LogSink;
        let entries = vec![NotificationEntry::host_removed("h1")];
        assert!(sink.notify(&entries).await.is_ok());
    }
}
