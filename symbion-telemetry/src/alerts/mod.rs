/*!
 * ALERT ENGINE - Détection des pannes et machine à états avec hystérésis
 *
 * RÔLE :
 * À chaque frontière minute archivée, évalue pour chaque hôte quatre règles
 * indépendantes (silence, CPU, RAM, disque) sur les 5 dernières minutes.
 *
 * FONCTIONNEMENT :
 * - checks   : fonctions pures, verdict CRITICAL / WARNING / NONE / inchangé
 * - engine   : carte des alertes ouvertes (host, type) -> OpenAlert, émission
 *              des événements STARTED / ESCALATED / DE_ESCALATED / ENDED
 * - notify   : filtrage anti-bruit puis envoi groupé vers le sink (Slack, log)
 *
 * L'état des alertes vit uniquement en mémoire et repart de zéro au redémarrage.
 */

pub mod checks;
pub mod engine;
pub mod notify;

pub use engine::{AlertBook, AlertEngine, AlertError};
pub use notify::{AlertSink, Color, LogSink, NotificationEntry, NotificationFilter, NotifyError, Selection, SlackSink};

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::models::Timestamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertType {
    NotReporting,
    HighCpuLoad,
    HighRamUsage,
    HighDiskUsage,
}

impl AlertType {
    pub const ALL: [AlertType; 4] = [
        AlertType::NotReporting,
        AlertType::HighCpuLoad,
        AlertType::HighRamUsage,
        AlertType::HighDiskUsage,
    ];
}

impl fmt::Display for AlertType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AlertType::NotReporting => "not reporting",
            AlertType::HighCpuLoad => "high cpu load",
            AlertType::HighRamUsage => "high ram usage",
            AlertType::HighDiskUsage => "high disk usage",
        };
        f.write_str(name)
    }
}

/// Critical sorts before Warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertLevel {
    Critical,
    Warning,
}

/// Résultat d'une règle pour un hôte
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Condition active ; `since` est la date de début rapportée
    Raise {
        level: AlertLevel,
        since: Timestamp,
        message: String,
    },
    /// Condition levée
    Clear { message: String },
    /// Zone intermédiaire ou pas de données : on ne touche à rien
    Unchanged,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenAlert {
    pub host: String,
    pub alert_type: AlertType,
    pub since: Timestamp,
    pub level: AlertLevel,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertEventKind {
    Started,
    Escalated,
    DeEscalated,
    Ended,
}

/// État de l'alerte au moment de la transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertEvent {
    pub kind: AlertEventKind,
    pub alert: OpenAlert,
}
