/*!
 * MODÈLES TÉLÉMÉTRIE - Types partagés entre ingestion, stockage, archivage et alertes
 *
 * RÔLE :
 * Définit les niveaux de résolution (tiers), les échantillons par hôte et leurs
 * lignes réseau / disque associées.
 *
 * CONVENTIONS :
 * - Horodatages en millisecondes depuis epoch (i64)
 * - Valeurs CPU et usage disque en parts-pour-10000
 * - Débits en unités par seconde, espaces disque en octets
 */

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Epoch milliseconds.
pub type Timestamp = i64;

pub const SECOND_MS: i64 = 1_000;
pub const MINUTE_MS: i64 = 60 * SECOND_MS;
pub const HOUR_MS: i64 = 60 * MINUTE_MS;
pub const DAY_MS: i64 = 24 * HOUR_MS;

/// Résolution de stockage d'un échantillon
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Échantillons bruts, un par payload agent (~5s)
    FiveSeconds,
    OneMinute,
    TwentyMinutes,
    TwoHours,
}

impl Tier {
    pub const ALL: [Tier; 4] = [
        Tier::FiveSeconds,
        Tier::OneMinute,
        Tier::TwentyMinutes,
        Tier::TwoHours,
    ];

    /// Tag persisted in the `tier` column.
    pub fn tag(self) -> i64 {
        match self {
            Tier::FiveSeconds => 0,
            Tier::OneMinute => 1,
            Tier::TwentyMinutes => 2,
            Tier::TwoHours => 3,
        }
    }

    pub fn from_tag(tag: i64) -> Option<Tier> {
        Tier::ALL.into_iter().find(|t| t.tag() == tag)
    }

    pub fn period_ms(self) -> i64 {
        match self {
            Tier::FiveSeconds => 5 * SECOND_MS,
            Tier::OneMinute => MINUTE_MS,
            Tier::TwentyMinutes => 20 * MINUTE_MS,
            Tier::TwoHours => 2 * HOUR_MS,
        }
    }

    /// Fenêtre affichée par défaut quand une requête ne précise pas `from`/`to`
    pub fn default_window_ms(self) -> i64 {
        match self {
            Tier::FiveSeconds => 5 * MINUTE_MS,
            Tier::OneMinute => HOUR_MS,
            Tier::TwentyMinutes => DAY_MS,
            Tier::TwoHours => 7 * DAY_MS,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Tier::FiveSeconds => "5s",
            Tier::OneMinute => "1m",
            Tier::TwentyMinutes => "20m",
            Tier::TwoHours => "2h",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown tier: '{0}'")]
pub struct UnknownTier(pub String);

impl FromStr for Tier {
    type Err = UnknownTier;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "5s" | "live" | "0" => Ok(Tier::FiveSeconds),
            "1m" | "hour" | "1" => Ok(Tier::OneMinute),
            "20m" | "day" | "2" => Ok(Tier::TwentyMinutes),
            "2h" | "week" | "3" => Ok(Tier::TwoHours),
            _ => Err(UnknownTier(s.to_string())),
        }
    }
}

/// CPU usage split, parts-per-10000 of the elapsed ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuUsage {
    pub busy: i64,
    pub io: i64,
    pub steal: i64,
}

impl CpuUsage {
    pub fn load(&self) -> i64 {
        self.busy + self.io + self.steal
    }
}

/// Débits d'une interface réseau ; chaque champ est nul si le compteur a été réinitialisé
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NetSample {
    pub interface: String,
    pub in_bytes: Option<i64>,
    pub out_bytes: Option<i64>,
    pub in_packets: Option<i64>,
    pub out_packets: Option<i64>,
    pub in_errors: Option<i64>,
    pub out_errors: Option<i64>,
}

/// Valeurs d'un périphérique disque. `used`/`total` sont des jauges, toujours présentes.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DiskSample {
    pub device: String,
    pub read_usage: Option<i64>,
    pub write_usage: Option<i64>,
    pub read_speed: Option<i64>,
    pub write_speed: Option<i64>,
    pub used: i64,
    pub total: i64,
}

impl DiskSample {
    /// Read plus write usage, absent parts counted as zero.
    pub fn combined_usage(&self) -> i64 {
        self.read_usage.unwrap_or(0).saturating_add(self.write_usage.unwrap_or(0))
    }
}

/// One host snapshot at one tier, together with its interface and device rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    pub tier: Tier,
    pub host: String,
    pub timestamp: Timestamp,
    pub cpu: Option<CpuUsage>,
    pub ram_used: i64,
    pub swap_used: i64,
    #[serde(default)]
    pub net: Vec<NetSample>,
    #[serde(default)]
    pub disks: Vec<DiskSample>,
}

/// Dernières capacités connues d'un hôte (pas d'historique)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub host: String,
    pub ram_total: i64,
    pub swap_total: i64,
}
