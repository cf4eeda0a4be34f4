use std::collections::{BTreeSet, HashMap};

use super::{CounterHandler, SnapshotCache};
use crate::models::{DiskSample, Timestamp};
use crate::payload::{DfEntry, DiskCounters, DiskStatsEntry};

pub const SECTOR_SIZE: i64 = 512;

/// Points de montage jamais reportés
pub const IGNORED_MOUNTS: &[&str] = &["/boot"];

/// Joins df space gauges with diskstats I/O counters per device.
#[derive(Debug)]
pub struct DiskHandler {
    pub(crate) snapshots: SnapshotCache<DiskCounters>,
}

impl Default for DiskHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl DiskHandler {
    pub fn new() -> Self {
        Self {
            snapshots: SnapshotCache::new("disk"),
        }
    }
}

impl CounterHandler for DiskHandler {
    type Raw = DiskCounters;
    type Rate = Vec<DiskSample>;

    fn handle(&self, host: &str, timestamp: Timestamp, raw: DiskCounters) -> Vec<DiskSample> {
        match self.snapshots.swap(host, timestamp, raw.clone()) {
            Some((elapsed, previous)) => disk_samples(elapsed, &previous, &raw),
            None => Vec::new(),
        }
    }

    fn evict(&self, host: &str) {
        self.snapshots.evict(host);
    }
}

fn known_devices(counters: &DiskCounters) -> BTreeSet<&str> {
    let stats: BTreeSet<&str> = counters.stats.iter().map(|s| s.device.as_str()).collect();
    counters
        .df
        .iter()
        .map(|d| d.filesystem.as_str())
        .filter(|fs| stats.contains(fs))
        .collect()
}

fn non_negative(delta: i64) -> Option<i64> {
    (delta >= 0).then_some(delta)
}

/// Samples for devices present in both snapshots; negative deltas null only what they feed.
pub fn disk_samples(elapsed_ms: i64, from: &DiskCounters, to: &DiskCounters) -> Vec<DiskSample> {
    let seconds = elapsed_ms as f64 / 1000.0;
    let before = known_devices(from);
    let devices = known_devices(to).into_iter().filter(|d| before.contains(d));

    let df: HashMap<&str, &DfEntry> = to.df.iter().map(|d| (d.filesystem.as_str(), d)).collect();
    let stats_from: HashMap<&str, &DiskStatsEntry> = from.stats.iter().map(|s| (s.device.as_str(), s)).collect();
    let stats_to: HashMap<&str, &DiskStatsEntry> = to.stats.iter().map(|s| (s.device.as_str(), s)).collect();

    devices
        .filter_map(|device| {
            let space = df.get(device)?;
            if IGNORED_MOUNTS.contains(&space.mounted_on.as_str()) {
                return None;
            }
            let (a, b) = (stats_from.get(device)?, stats_to.get(device)?);

            let busy_fraction = non_negative(b.ms_io - a.ms_io).map(|ms| ms as f64 / elapsed_ms as f64);
            let read = non_negative(b.sectors_read - a.sectors_read);
            let written = non_negative(b.sectors_written - a.sectors_written);

            let (read_usage, write_usage) = match (busy_fraction, read, written) {
                (Some(busy), Some(r), Some(w)) => {
                    let touched = r as f64 + w as f64;
                    if touched == 0.0 {
                        (Some(0), Some(0))
                    } else {
                        (
                            Some((10_000.0 * busy * r as f64 / touched) as i64),
                            Some((10_000.0 * busy * w as f64 / touched) as i64),
                        )
                    }
                }
                _ => (None, None),
            };

            Some(DiskSample {
                device: device.to_string(),
                read_usage,
                write_usage,
                read_speed: read.map(|s| (s as f64 * SECTOR_SIZE as f64 / seconds) as i64),
                write_speed: written.map(|s| (s as f64 * SECTOR_SIZE as f64 / seconds) as i64),
                used: space.used_kib * 1024,
                total: space.blocks_kib * 1024,
            })
        })
        .collect()
}
