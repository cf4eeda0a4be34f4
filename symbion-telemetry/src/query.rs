/*!
 * REQUÊTES - Chemin de lecture pour l'API
 *
 * - Séries par métrique (cpu, ram, net, disk-io) sur un tier et une fenêtre
 * - Liste des hôtes avec leurs dernières capacités connues
 * - Estimation du temps restant avant disque plein
 */

use serde::Serialize;
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

use crate::clock::SharedClock;
use crate::models::{NetSample, Sample, Tier, Timestamp, DAY_MS, HOUR_MS, SECOND_MS};
use crate::store::{StoreError, StoreTx, TelemetryStore};

/// Écart minimal entre deux relevés pour estimer un taux de remplissage
pub const MIN_FILL_SPAN_MS: i64 = 6 * HOUR_MS;

const FILL_REFERENCE_TIERS: [Tier; 2] = [Tier::FiveSeconds, Tier::OneMinute];

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error(transparent)]
    Tier(#[from] crate::models::UnknownTier),
    #[error("unknown metric '{0}'")]
    UnknownMetric(String),
    #[error("unknown host '{0}'")]
    UnknownHost(String),
    #[error("empty window: from {from} is not before to {to}")]
    EmptyWindow { from: Timestamp, to: Timestamp },
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
    #[error("query task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    Cpu,
    Ram,
    Net,
    DiskIo,
}

impl FromStr for Metric {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cpu" => Ok(Metric::Cpu),
            "ram" | "memory" => Ok(Metric::Ram),
            "net" | "network" => Ok(Metric::Net),
            "disk-io" | "disk_io" | "diskio" => Ok(Metric::DiskIo),
            _ => Err(QueryError::UnknownMetric(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CpuPoint {
    pub timestamp: Timestamp,
    pub busy: Option<f64>,
    pub io: Option<f64>,
    pub steal: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RamPoint {
    pub timestamp: Timestamp,
    pub ram_used: i64,
    pub swap_used: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct NetPoint {
    pub timestamp: Timestamp,
    pub interfaces: Vec<NetSample>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiskIoDevice {
    pub device: String,
    /// Percent of the interval spent reading.
    pub read_usage: Option<f64>,
    pub write_usage: Option<f64>,
    pub read_speed: Option<i64>,
    pub write_speed: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiskIoPoint {
    pub timestamp: Timestamp,
    pub devices: Vec<DiskIoDevice>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "metric", rename_all = "snake_case")]
pub enum Series {
    Cpu {
        host: String,
        tier: Tier,
        points: Vec<CpuPoint>,
    },
    Ram {
        host: String,
        tier: Tier,
        ram_total: i64,
        swap_total: i64,
        points: Vec<RamPoint>,
    },
    Net {
        host: String,
        tier: Tier,
        points: Vec<NetPoint>,
    },
    DiskIo {
        host: String,
        tier: Tier,
        points: Vec<DiskIoPoint>,
    },
}

impl Series {
    pub fn len(&self) -> usize {
        match self {
            Series::Cpu { points, .. } => points.len(),
            Series::Ram { points, .. } => points.len(),
            Series::Net { points, .. } => points.len(),
            Series::DiskIo { points, .. } => points.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HostSummary {
    pub host: String,
    pub ram_total: i64,
    pub swap_total: i64,
    pub last_sample: Option<Timestamp>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiskSpace {
    pub device: String,
    pub total: i64,
    pub used: i64,
    pub used_fraction: f64,
    pub seconds_to_full: Option<i64>,
    pub time_left: String,
}

/// Parts-per-10000 to percent.
fn percent(value: i64) -> f64 {
    value as f64 / 100.0
}

pub struct QueryService {
    store: Arc<TelemetryStore>,
    clock: SharedClock,
}

impl QueryService {
    pub fn new(store: Arc<TelemetryStore>, clock: SharedClock) -> Self {
        Self { store, clock }
    }

    /// `[from, to)` for a request. A missing `to` includes a sample stamped now,
    /// a missing `from` goes back the tier's default window.
    pub fn window(&self, tier: Tier, from: Option<Timestamp>, to: Option<Timestamp>) -> Result<(Timestamp, Timestamp), QueryError> {
        let span = tier.default_window_ms();
        let (from, to) = match to {
            Some(to) => (from.unwrap_or(to - span), to),
            None => {
                let now = self.clock.now_ms();
                (from.unwrap_or(now - span), now + 1)
            }
        };
        if from >= to {
            return Err(QueryError::EmptyWindow { from, to });
        }
        Ok((from, to))
    }

    pub async fn series(
        &self,
        metric: Metric,
        host: &str,
        tier: Tier,
        from: Option<Timestamp>,
        to: Option<Timestamp>,
    ) -> Result<Series, QueryError> {
        let (from, to) = self.window(tier, from, to)?;
        let store = self.store.clone();
        let name = host.to_string();
        let (known, samples) = tokio::task::spawn_blocking(move || {
            store.transaction(|tx| {
                let known = tx.host(&name)?;
                let samples = match known {
                    Some(_) => tx.range_query(tier, Some(&name), from, to)?,
                    None => Vec::new(),
                };
                Ok((known, samples))
            })
        })
        .await??;

        let known = known.ok_or_else(|| QueryError::UnknownHost(host.to_string()))?;
        debug!(host, ?tier, ?metric, from, to, samples = samples.len(), "series query");
        let host = known.host.clone();
        Ok(match metric {
            Metric::Cpu => Series::Cpu {
                host,
                tier,
                points: samples.iter().map(cpu_point).collect(),
            },
            Metric::Ram => Series::Ram {
                host,
                tier,
                ram_total: known.ram_total,
                swap_total: known.swap_total,
                points: samples
                    .iter()
                    .map(|s| RamPoint {
                        timestamp: s.timestamp,
                        ram_used: s.ram_used,
                        swap_used: s.swap_used,
                    })
                    .collect(),
            },
            Metric::Net => Series::Net {
                host,
                tier,
                points: samples
                    .into_iter()
                    .map(|s| NetPoint {
                        timestamp: s.timestamp,
                        interfaces: s.net,
                    })
                    .collect(),
            },
            Metric::DiskIo => Series::DiskIo {
                host,
                tier,
                points: samples.iter().map(disk_io_point).collect(),
            },
        })
    }

    pub async fn hosts(&self) -> Result<Vec<HostSummary>, QueryError> {
        let store = self.store.clone();
        let summaries = tokio::task::spawn_blocking(move || {
            store.transaction(|tx| {
                let last = tx.last_sample_times()?;
                Ok(tx
                    .hosts()?
                    .into_iter()
                    .map(|h| HostSummary {
                        last_sample: last.get(&h.host).copied(),
                        host: h.host,
                        ram_total: h.ram_total,
                        swap_total: h.swap_total,
                    })
                    .collect())
            })
        })
        .await??;
        Ok(summaries)
    }

    /// Per-device fill estimate from the samples nearest to now, one day ago and one week ago.
    pub async fn disk_space(&self, host: &str) -> Result<Vec<DiskSpace>, QueryError> {
        let now = self.clock.now_ms();
        let store = self.store.clone();
        let name = host.to_string();
        let found = tokio::task::spawn_blocking(move || store.transaction(|tx| disk_space_at(tx, &name, now))).await??;
        found.ok_or_else(|| QueryError::UnknownHost(host.to_string()))
    }
}

fn cpu_point(s: &Sample) -> CpuPoint {
    CpuPoint {
        timestamp: s.timestamp,
        busy: s.cpu.map(|c| percent(c.busy)),
        io: s.cpu.map(|c| percent(c.io)),
        steal: s.cpu.map(|c| percent(c.steal)),
    }
}

fn disk_io_point(s: &Sample) -> DiskIoPoint {
    DiskIoPoint {
        timestamp: s.timestamp,
        devices: s
            .disks
            .iter()
            .map(|d| DiskIoDevice {
                device: d.device.clone(),
                read_usage: d.read_usage.map(percent),
                write_usage: d.write_usage.map(percent),
                read_speed: d.read_speed,
                write_speed: d.write_speed,
            })
            .collect(),
    }
}

fn disk_space_at(tx: &StoreTx<'_>, host: &str, now: Timestamp) -> Result<Option<Vec<DiskSpace>>, StoreError> {
    if tx.host(host)?.is_none() {
        return Ok(None);
    }
    let Some(current) = tx.nearest_sample(&FILL_REFERENCE_TIERS, host, now)? else {
        return Ok(Some(Vec::new()));
    };
    let references: Vec<Sample> = [now - DAY_MS, now - 7 * DAY_MS]
        .into_iter()
        .map(|target| tx.nearest_sample(&FILL_REFERENCE_TIERS, host, target))
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .flatten()
        .collect();

    Ok(Some(
        current
            .disks
            .iter()
            .map(|disk| {
                let rate = references
                    .iter()
                    .filter_map(|past| fill_rate(&current, past, &disk.device))
                    .fold(None, |max: Option<f64>, r| Some(max.map_or(r, |m| m.max(r))));
                let seconds_to_full = rate
                    .filter(|r| *r > 0.0)
                    .map(|r| ((disk.total - disk.used) as f64 / r) as i64);
                DiskSpace {
                    device: disk.device.clone(),
                    total: disk.total,
                    used: disk.used,
                    used_fraction: if disk.total > 0 {
                        disk.used as f64 / disk.total as f64
                    } else {
                        0.0
                    },
                    seconds_to_full,
                    time_left: format_time_left(seconds_to_full),
                }
            })
            .collect(),
    ))
}

/// Bytes per second between `past` and `current` for `device`, if the span is long enough.
fn fill_rate(current: &Sample, past: &Sample, device: &str) -> Option<f64> {
    let span = current.timestamp - past.timestamp;
    if span < MIN_FILL_SPAN_MS {
        return None;
    }
    let now_used = current.disks.iter().find(|d| d.device == device)?.used;
    let then_used = past.disks.iter().find(|d| d.device == device)?.used;
    Some((now_used - then_used) as f64 / (span / SECOND_MS) as f64)
}

pub fn format_time_left(seconds: Option<i64>) -> String {
    const MINUTE: i64 = 60;
    const HOUR: i64 = 60 * MINUTE;
    const DAY: i64 = 24 * HOUR;

    let Some(s) = seconds else {
        return "More than a year".to_string();
    };
    if s < 0 || s > 365 * DAY {
        "More than a year".to_string()
    } else if s > 60 * DAY {
        format!("{} months", s / DAY / 30)
    } else if s > 14 * DAY {
        format!("{} weeks", s / DAY / 7)
    } else if s > 2 * DAY {
        format!("{} days", s / DAY)
    } else if s > 2 * HOUR {
        format!("{} hours", s / HOUR)
    } else if s > 2 * MINUTE {
        format!("{} minutes", s / MINUTE)
    } else {
        format!("{s} seconds")
    }
}
