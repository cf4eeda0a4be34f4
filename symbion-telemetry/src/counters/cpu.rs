use tracing::debug;

use super::{CounterHandler, SnapshotCache};
use crate::models::{CpuUsage, Timestamp};
use crate::payload::CpuCounters;

/// Converts /proc/stat jiffies into busy/io/steal shares.
#[derive(Debug)]
pub struct CpuHandler {
    pub(crate) snapshots: SnapshotCache<CpuCounters>,
}

impl Default for CpuHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuHandler {
    pub fn new() -> Self {
        Self {
            snapshots: SnapshotCache::new("cpu"),
        }
    }
}

impl CounterHandler for CpuHandler {
    type Raw = CpuCounters;
    type Rate = Option<CpuUsage>;

    fn handle(&self, host: &str, timestamp: Timestamp, raw: CpuCounters) -> Option<CpuUsage> {
        let (_, previous) = self.snapshots.swap(host, timestamp, raw)?;
        let usage = cpu_usage(&previous, &raw);
        if usage.is_none() {
            debug!(host, "cpu counters reset, no usage for this interval");
        }
        usage
    }

    fn evict(&self, host: &str) {
        self.snapshots.evict(host);
    }
}

/// Usage between two snapshots, `None` on any counter reset or an empty interval.
pub fn cpu_usage(from: &CpuCounters, to: &CpuCounters) -> Option<CpuUsage> {
    let reset = from
        .as_array()
        .iter()
        .zip(to.as_array().iter())
        .any(|(a, b)| a > b);
    if reset {
        return None;
    }

    // i128 : les compteurs valides vont jusqu'à i64::MAX
    let busy = to.busy() - from.busy();
    let idle = (to.idle - from.idle) as i128;
    let io = (to.iowait - from.iowait) as i128;
    let steal = (to.steal - from.steal) as i128;
    let total = busy + idle + io + steal;
    if total <= 0 {
        return None;
    }

    // each part is at most `total`, so every share fits in 0..=10_000
    let share = |part: i128| (part * 10_000 / total) as i64;
    Some(CpuUsage {
        busy: share(busy),
        io: share(io),
        steal: share(steal),
    })
}
