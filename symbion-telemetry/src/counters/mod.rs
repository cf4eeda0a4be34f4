/*!
 * HANDLERS DE COMPTEURS - Conversion compteurs cumulés -> débits instantanés
 *
 * RÔLE :
 * Chaque famille (CPU, réseau, disque) garde en mémoire, par hôte, le dernier
 * relevé brut et son horodatage. Un nouveau relevé remplace toujours l'ancien ;
 * le débit n'est calculé que si l'ancien relevé existe et date de moins de 60s.
 *
 * CONCURRENCE :
 * DashMap par famille, clé = hostname. Le remplacement est atomique par clé,
 * sans contention entre hôtes.
 */

pub mod cpu;
pub mod disk;
pub mod net;

pub use cpu::CpuHandler;
pub use disk::DiskHandler;
pub use net::NetHandler;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

use crate::models::Timestamp;

/// Ancienneté maximale du relevé précédent
pub const MAX_SNAPSHOT_AGE_MS: i64 = 60_000;

/// Shared contract of the three converters.
pub trait CounterHandler: Send + Sync {
    type Raw;
    type Rate;

    fn handle(&self, host: &str, timestamp: Timestamp, raw: Self::Raw) -> Self::Rate;

    /// Drops the stored snapshot of `host`.
    fn evict(&self, host: &str);
}

/// Last raw snapshot per host.
#[derive(Debug)]
pub(crate) struct SnapshotCache<T> {
    family: &'static str,
    entries: DashMap<String, (Timestamp, T)>,
}

impl<T> SnapshotCache<T> {
    pub(crate) fn new(family: &'static str) -> Self {
        Self {
            family,
            entries: DashMap::new(),
        }
    }

    /// Stores `counters` and returns `(elapsed_ms, previous)` when the previous
    /// snapshot can serve as the start of a rate interval. A snapshot older than
    /// the stored one is dropped and the stored one kept.
    pub(crate) fn swap(&self, host: &str, timestamp: Timestamp, counters: T) -> Option<(i64, T)> {
        let mut entry = match self.entries.entry(host.to_string()) {
            Entry::Vacant(vacant) => {
                vacant.insert((timestamp, counters));
                debug!(family = self.family, host, "first snapshot, no rate yet");
                return None;
            }
            Entry::Occupied(entry) => entry,
        };

        let elapsed = timestamp - entry.get().0;
        if elapsed <= 0 {
            debug!(family = self.family, host, elapsed, "non-increasing timestamp, snapshot kept");
            return None;
        }
        let (_, previous) = entry.insert((timestamp, counters));
        if elapsed > MAX_SNAPSHOT_AGE_MS {
            debug!(family = self.family, host, elapsed, "previous snapshot is stale");
            return None;
        }
        Some((elapsed, previous))
    }

    pub(crate) fn evict(&self, host: &str) {
        self.entries.remove(host);
    }

    pub(crate) fn contains(&self, host: &str) -> bool {
        self.entries.contains_key(host)
    }
}

/// Les trois convertisseurs, construits une fois au démarrage et partagés
#[derive(Debug)]
pub struct CounterHandlers {
    pub cpu: CpuHandler,
    pub net: NetHandler,
    pub disk: DiskHandler,
}

impl Default for CounterHandlers {
    fn default() -> Self {
        Self::new()
    }
}

impl CounterHandlers {
    pub fn new() -> Self {
        Self {
            cpu: CpuHandler::new(),
            net: NetHandler::new(),
            disk: DiskHandler::new(),
        }
    }

    pub fn evict_host(&self, host: &str) {
        self.cpu.evict(host);
        self.net.evict(host);
        self.disk.evict(host);
    }

    pub fn knows_host(&self, host: &str) -> bool {
        self.cpu.snapshots.contains(host) || self.net.snapshots.contains(host) || self.disk.snapshots.contains(host)
    }
}

/// `delta / seconds` truncated, `None` when the counter went backwards.
pub(crate) fn rate(from: i64, to: i64, seconds: f64) -> Option<i64> {
    let delta = to - from;
    if delta < 0 {
        return None;
    }
    Some((delta as f64 / seconds) as i64)
}
