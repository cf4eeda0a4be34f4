//! Règles d'alerte, sans état.
//!
//! Unités : CPU et usage disque en parts-pour-10000, RAM en pourcentage.

use crate::models::{Host, Sample, Timestamp, MINUTE_MS, SECOND_MS};

use super::{AlertLevel, AlertType, Verdict};

pub const NOT_REPORTING_WARNING_MS: i64 = 30 * SECOND_MS;
pub const NOT_REPORTING_CRITICAL_MS: i64 = 60 * SECOND_MS;
pub const EVALUATION_WINDOW_MS: i64 = 5 * MINUTE_MS;

pub const CPU_CRITICAL: f64 = 9_900.0;
pub const CPU_WARNING: f64 = 9_990.0;
pub const CPU_CLEAR: f64 = 7_000.0;

pub const RAM_CRITICAL_PCT: f64 = 95.0;
pub const RAM_WARNING_PCT: f64 = 90.0;
pub const RAM_CLEAR_PCT: f64 = 70.0;

pub const DISK_CRITICAL: f64 = 9_750.0;
pub const DISK_WARNING: f64 = 9_000.0;
pub const DISK_CLEAR: f64 = 7_000.0;

/// Données sur lesquelles un hôte est jugé
#[derive(Debug, Clone)]
pub struct HostWindow {
    pub host: Host,
    /// Échantillons 1min de la fenêtre glissante, croissants
    pub recent: Vec<Sample>,
    pub latest_live: Option<Timestamp>,
}

fn raise(level: AlertLevel, since: Timestamp, message: String) -> Verdict {
    Verdict::Raise { level, since, message }
}

fn mean(values: &[f64]) -> Option<f64> {
    (!values.is_empty()).then(|| values.iter().sum::<f64>() / values.len() as f64)
}

fn last_two<T>(values: &[T]) -> &[T] {
    &values[values.len().saturating_sub(2)..]
}

pub fn not_reporting(latest_live: Option<Timestamp>, now: Timestamp) -> Verdict {
    match latest_live {
        None => raise(
            AlertLevel::Critical,
            now - EVALUATION_WINDOW_MS,
            "No reports received in the last 5 minutes".to_string(),
        ),
        Some(last) => {
            let age_secs = (now - last) / SECOND_MS;
            if last < now - NOT_REPORTING_CRITICAL_MS {
                raise(
                    AlertLevel::Critical,
                    last,
                    format!("No reports received in the last {age_secs} seconds"),
                )
            } else if last < now - NOT_REPORTING_WARNING_MS {
                raise(
                    AlertLevel::Warning,
                    last,
                    format!("No reports received in the last {age_secs} seconds"),
                )
            } else {
                Verdict::Clear {
                    message: format!("Report received {age_secs} seconds ago"),
                }
            }
        }
    }
}

pub fn cpu_load(recent: &[Sample]) -> Verdict {
    let Some(five) = mean(
        &recent
            .iter()
            .filter_map(|s| s.cpu.map(|c| c.load() as f64))
            .collect::<Vec<_>>(),
    ) else {
        return Verdict::Unchanged;
    };
    // absent readings weigh as zero on the short window
    let tail = last_two(recent);
    let two = mean(
        &tail
            .iter()
            .map(|s| s.cpu.map_or(0.0, |c| c.load() as f64))
            .collect::<Vec<_>>(),
    )
    .unwrap_or(0.0);

    if five > CPU_CRITICAL {
        raise(
            AlertLevel::Critical,
            recent[0].timestamp,
            format!("*{:.1}%* CPU load over 5 minutes", five / 100.0),
        )
    } else if two > CPU_WARNING {
        raise(
            AlertLevel::Warning,
            tail[0].timestamp,
            format!("*{:.1}%* CPU load over 2 minutes", two / 100.0),
        )
    } else if five < CPU_CLEAR {
        Verdict::Clear {
            message: format!("CPU load back to *{:.1}%* over 5 minutes", five / 100.0),
        }
    } else {
        Verdict::Unchanged
    }
}

pub fn ram_usage(recent: &[Sample], ram_total: i64) -> Verdict {
    if recent.is_empty() || ram_total <= 0 {
        return Verdict::Unchanged;
    }
    let used = recent.iter().map(|s| s.ram_used as f64).sum::<f64>() / recent.len() as f64;
    let pct = used / ram_total as f64 * 100.0;
    let since = recent[0].timestamp;

    if pct > RAM_CRITICAL_PCT {
        raise(AlertLevel::Critical, since, format!("*{pct:.1}%* RAM usage over 5 minutes"))
    } else if pct > RAM_WARNING_PCT {
        raise(AlertLevel::Warning, since, format!("*{pct:.1}%* RAM usage over 5 minutes"))
    } else if pct < RAM_CLEAR_PCT {
        Verdict::Clear {
            message: format!("RAM usage back to *{pct:.1}%* over 5 minutes"),
        }
    } else {
        Verdict::Unchanged
    }
}

pub fn disk_usage(recent: &[Sample]) -> Verdict {
    // (date, mean read+write usage across devices) per sample carrying disk rows
    let mut per_sample: Vec<(Timestamp, f64)> = recent
        .iter()
        .filter(|s| !s.disks.is_empty())
        .map(|s| {
            let total: f64 = s.disks.iter().map(|d| d.combined_usage() as f64).sum();
            (s.timestamp, total / s.disks.len() as f64)
        })
        .collect();
    per_sample.sort_by_key(|(ts, _)| *ts);

    let usages: Vec<f64> = per_sample.iter().map(|(_, u)| *u).collect();
    let Some(five) = mean(&usages) else {
        return Verdict::Unchanged;
    };
    let two = mean(last_two(&usages)).unwrap_or(five);

    if two > DISK_CRITICAL {
        raise(
            AlertLevel::Critical,
            last_two(&per_sample)[0].0,
            format!("*{:.1}%* disk usage over 2 minutes", two / 100.0),
        )
    } else if five > DISK_WARNING {
        raise(
            AlertLevel::Warning,
            per_sample[0].0,
            format!("*{:.1}%* disk usage over 5 minutes", five / 100.0),
        )
    } else if five < DISK_CLEAR {
        Verdict::Clear {
            message: format!("Disk usage back to *{:.1}%* over 5 minutes", five / 100.0),
        }
    } else {
        Verdict::Unchanged
    }
}

pub fn check_host(window: &HostWindow, now: Timestamp) -> [(AlertType, Verdict); 4] {
    [
        (AlertType::NotReporting, not_reporting(window.latest_live, now)),
        (AlertType::HighCpuLoad, cpu_load(&window.recent)),
        (AlertType::HighRamUsage, ram_usage(&window.recent, window.host.ram_total)),
        (AlertType::HighDiskUsage, disk_usage(&window.recent)),
    ]
}
