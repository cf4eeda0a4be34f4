/*!
 * TIME-SERIES STORE - Persistance SQLite des échantillons multi-résolution
 *
 * RÔLE :
 * Stocke les échantillons par hôte sur quatre tiers (5s, 1min, 20min, 2h),
 * les lignes réseau par interface et disque par périphérique rattachées à un
 * échantillon, et les capacités connues de chaque hôte.
 *
 * FONCTIONNEMENT :
 * - Une connexion unique protégée par un Mutex parking_lot
 * - Toute lecture/écriture passe par `transaction()` : un échantillon et ses
 *   lignes filles sont visibles ensemble ou pas du tout
 * - Suppression d'un hôte = cascade sur tous les tiers et sous-tables
 */

mod schema;

pub use schema::SCHEMA_VERSION;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::{debug, debug_span, info};

use crate::models::{CpuUsage, DiskSample, Host, NetSample, Sample, Tier, Timestamp};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("storage schema version {found} is newer than supported version {supported}")]
    UnsupportedVersion { found: u32, supported: u32 },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub struct TelemetryStore {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for TelemetryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryStore").finish_non_exhaustive()
    }
}

impl TelemetryStore {
    /// Ouvre (ou crée) la base et applique les migrations manquantes
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        let store = Self::init(conn)?;
        info!(path = %path.display(), "telemetry store opened");
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(mut conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        schema::migrate(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// `f` dans une transaction SQLite ; toute erreur annule l'ensemble
    pub fn transaction<T>(&self, f: impl FnOnce(&StoreTx<'_>) -> Result<T, StoreError>) -> Result<T, StoreError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let out = f(&StoreTx { conn: &tx })?;
        tx.commit()?;
        Ok(out)
    }

    pub fn schema_version(&self) -> Result<u32, StoreError> {
        schema::current_version(&self.conn.lock())
    }
}

pub struct StoreTx<'a> {
    conn: &'a Connection,
}

const SAMPLE_COLUMNS: &str = "id, tier, host, ts, cpu_busy, cpu_io, cpu_steal, ram_used, swap_used";

fn sample_from_row(row: &Row<'_>) -> rusqlite::Result<(i64, Sample)> {
    let tag: i64 = row.get(1)?;
    let tier = Tier::from_tag(tag).ok_or(rusqlite::Error::IntegralValueOutOfRange(1, tag))?;
    let busy: Option<i64> = row.get(4)?;
    let io: Option<i64> = row.get(5)?;
    let steal: Option<i64> = row.get(6)?;
    let cpu = match (busy, io, steal) {
        (Some(busy), Some(io), Some(steal)) => Some(CpuUsage { busy, io, steal }),
        _ => None,
    };
    Ok((
        row.get(0)?,
        Sample {
            tier,
            host: row.get(2)?,
            timestamp: row.get(3)?,
            cpu,
            ram_used: row.get(7)?,
            swap_used: row.get(8)?,
            net: Vec::new(),
            disks: Vec::new(),
        },
    ))
}

fn tier_list(tiers: &[Tier]) -> String {
    tiers
        .iter()
        .map(|t| t.tag().to_string())
        .collect::<Vec<_>>()
        .join(",")
}

impl StoreTx<'_> {
    pub fn upsert_host(&self, host: &Host) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO hosts (host, ram_total, swap_total) VALUES (?1, ?2, ?3)
             ON CONFLICT(host) DO UPDATE SET ram_total = excluded.ram_total, swap_total = excluded.swap_total",
            params![host.host, host.ram_total, host.swap_total],
        )?;
        Ok(())
    }

    pub fn hosts(&self) -> Result<Vec<Host>, StoreError> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT host, ram_total, swap_total FROM hosts ORDER BY host")?;
        let rows = stmt.query_map([], |row| {
            Ok(Host {
                host: row.get(0)?,
                ram_total: row.get(1)?,
                swap_total: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn host(&self, host: &str) -> Result<Option<Host>, StoreError> {
        Ok(self
            .conn
            .query_row(
                "SELECT host, ram_total, swap_total FROM hosts WHERE host = ?1",
                [host],
                |row| {
                    Ok(Host {
                        host: row.get(0)?,
                        ram_total: row.get(1)?,
                        swap_total: row.get(2)?,
                    })
                },
            )
            .optional()?)
    }

    /// Deletes the host; samples of every tier and their rows follow by cascade.
    pub fn remove_host(&self, host: &str) -> Result<bool, StoreError> {
        let removed = self.conn.execute("DELETE FROM hosts WHERE host = ?1", [host])?;
        Ok(removed > 0)
    }

    /// Lignes `samples` seules ; ids dans l'ordre d'entrée
    pub fn insert_samples(&self, samples: &[Sample]) -> Result<Vec<i64>, StoreError> {
        let mut stmt = self.conn.prepare_cached(
            "INSERT INTO samples (tier, host, ts, cpu_busy, cpu_io, cpu_steal, ram_used, swap_used)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )?;
        let mut ids = Vec::with_capacity(samples.len());
        for s in samples {
            stmt.execute(params![
                s.tier.tag(),
                s.host,
                s.timestamp,
                s.cpu.map(|c| c.busy),
                s.cpu.map(|c| c.io),
                s.cpu.map(|c| c.steal),
                s.ram_used,
                s.swap_used,
            ])?;
            ids.push(self.conn.last_insert_rowid());
        }
        Ok(ids)
    }

    pub fn insert_net_rows(&self, sample_id: i64, rows: &[NetSample]) -> Result<(), StoreError> {
        let mut stmt = self.conn.prepare_cached(
            "INSERT INTO net_samples (sample_id, interface, in_bytes, out_bytes, in_packets, out_packets, in_errors, out_errors)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )?;
        for n in rows {
            stmt.execute(params![
                sample_id,
                n.interface,
                n.in_bytes,
                n.out_bytes,
                n.in_packets,
                n.out_packets,
                n.in_errors,
                n.out_errors,
            ])?;
        }
        Ok(())
    }

    pub fn insert_disk_rows(&self, sample_id: i64, rows: &[DiskSample]) -> Result<(), StoreError> {
        let mut stmt = self.conn.prepare_cached(
            "INSERT INTO disk_samples (sample_id, device, read_usage, write_usage, read_speed, write_speed, used, total)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )?;
        for d in rows {
            stmt.execute(params![
                sample_id,
                d.device,
                d.read_usage,
                d.write_usage,
                d.read_speed,
                d.write_speed,
                d.used,
                d.total,
            ])?;
        }
        Ok(())
    }

    pub fn insert_full(&self, samples: &[Sample]) -> Result<Vec<i64>, StoreError> {
        let ids = self.insert_samples(samples)?;
        for (id, sample) in ids.iter().zip(samples) {
            self.insert_net_rows(*id, &sample.net)?;
            self.insert_disk_rows(*id, &sample.disks)?;
        }
        Ok(ids)
    }

    /// Samples of `tier` in `[from, to)`, ascending, with their child rows.
    pub fn range_query(
        &self,
        tier: Tier,
        host: Option<&str>,
        from: Timestamp,
        to: Timestamp,
    ) -> Result<Vec<Sample>, StoreError> {
        let _span = debug_span!("range_query", %tier, host, from, to).entered();
        let filter = "tier = ?1 AND (?2 IS NULL OR host = ?2) AND ts >= ?3 AND ts < ?4";
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT {SAMPLE_COLUMNS} FROM samples WHERE {filter} ORDER BY ts, host"
        ))?;
        let rows = stmt
            .query_map(params![tier.tag(), host, from, to], sample_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        let scope = format!("SELECT id FROM samples WHERE {filter}");
        let mut net = self.net_rows(&scope, params![tier.tag(), host, from, to])?;
        let mut disks = self.disk_rows(&scope, params![tier.tag(), host, from, to])?;

        Ok(rows
            .into_iter()
            .map(|(id, mut sample)| {
                sample.net = net.remove(&id).unwrap_or_default();
                sample.disks = disks.remove(&id).unwrap_or_default();
                sample
            })
            .collect())
    }

    fn net_rows(&self, scope: &str, args: impl rusqlite::Params) -> Result<HashMap<i64, Vec<NetSample>>, StoreError> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT sample_id, interface, in_bytes, out_bytes, in_packets, out_packets, in_errors, out_errors
             FROM net_samples WHERE sample_id IN ({scope}) ORDER BY sample_id, interface"
        ))?;
        let mut out: HashMap<i64, Vec<NetSample>> = HashMap::new();
        let rows = stmt.query_map(args, |row| {
            Ok((
                row.get::<_, i64>(0)?,
                NetSample {
                    interface: row.get(1)?,
                    in_bytes: row.get(2)?,
                    out_bytes: row.get(3)?,
                    in_packets: row.get(4)?,
                    out_packets: row.get(5)?,
                    in_errors: row.get(6)?,
                    out_errors: row.get(7)?,
                },
            ))
        })?;
        for row in rows {
            let (id, n) = row?;
            out.entry(id).or_default().push(n);
        }
        Ok(out)
    }

    fn disk_rows(&self, scope: &str, args: impl rusqlite::Params) -> Result<HashMap<i64, Vec<DiskSample>>, StoreError> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "SELECT sample_id, device, read_usage, write_usage, read_speed, write_speed, used, total
             FROM disk_samples WHERE sample_id IN ({scope}) ORDER BY sample_id, device"
        ))?;
        let mut out: HashMap<i64, Vec<DiskSample>> = HashMap::new();
        let rows = stmt.query_map(args, |row| {
            Ok((
                row.get::<_, i64>(0)?,
                DiskSample {
                    device: row.get(1)?,
                    read_usage: row.get(2)?,
                    write_usage: row.get(3)?,
                    read_speed: row.get(4)?,
                    write_speed: row.get(5)?,
                    used: row.get(6)?,
                    total: row.get(7)?,
                },
            ))
        })?;
        for row in rows {
            let (id, d) = row?;
            out.entry(id).or_default().push(d);
        }
        Ok(out)
    }

    fn with_children(&self, found: Option<(i64, Sample)>) -> Result<Option<Sample>, StoreError> {
        let Some((id, mut sample)) = found else {
            return Ok(None);
        };
        let scope = "SELECT ?1";
        sample.net = self.net_rows(scope, [id])?.remove(&id).unwrap_or_default();
        sample.disks = self.disk_rows(scope, [id])?.remove(&id).unwrap_or_default();
        Ok(Some(sample))
    }

    /// Dernier échantillon de `host` sur `tier`, quel que soit son âge
    pub fn latest_sample(&self, tier: Tier, host: &str) -> Result<Option<Sample>, StoreError> {
        let found = self
            .conn
            .query_row(
                &format!("SELECT {SAMPLE_COLUMNS} FROM samples WHERE tier = ?1 AND host = ?2 ORDER BY ts DESC LIMIT 1"),
                params![tier.tag(), host],
                sample_from_row,
            )
            .optional()?;
        self.with_children(found)
    }

    /// Sample of `host` closest to `target` among `tiers`; on a tie the earlier one wins.
    pub fn nearest_sample(&self, tiers: &[Tier], host: &str, target: Timestamp) -> Result<Option<Sample>, StoreError> {
        let tiers = tier_list(tiers);
        let before = self
            .conn
            .query_row(
                &format!(
                    "SELECT {SAMPLE_COLUMNS} FROM samples WHERE tier IN ({tiers}) AND host = ?1 AND ts <= ?2
                     ORDER BY ts DESC LIMIT 1"
                ),
                params![host, target],
                sample_from_row,
            )
            .optional()?;
        let after = self
            .conn
            .query_row(
                &format!(
                    "SELECT {SAMPLE_COLUMNS} FROM samples WHERE tier IN ({tiers}) AND host = ?1 AND ts > ?2
                     ORDER BY ts ASC LIMIT 1"
                ),
                params![host, target],
                sample_from_row,
            )
            .optional()?;

        let nearest = match (before, after) {
            (Some(b), Some(a)) => {
                if target - b.1.timestamp <= a.1.timestamp - target {
                    Some(b)
                } else {
                    Some(a)
                }
            }
            (b, a) => b.or(a),
        };
        self.with_children(nearest)
    }

    pub fn delete_older_than(&self, tiers: &[Tier], cutoff: Timestamp) -> Result<usize, StoreError> {
        if tiers.is_empty() {
            return Ok(0);
        }
        let deleted = self.conn.execute(
            &format!("DELETE FROM samples WHERE tier IN ({}) AND ts < ?1", tier_list(tiers)),
            [cutoff],
        )?;
        debug!(tiers = %tier_list(tiers), cutoff, deleted, "retention sweep");
        Ok(deleted)
    }

    /// Hôtes ayant déjà un échantillon `tier` daté exactement `ts`
    pub fn hosts_with_sample_at(&self, tier: Tier, ts: Timestamp) -> Result<HashSet<String>, StoreError> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT host FROM samples WHERE tier = ?1 AND ts = ?2")?;
        let rows = stmt.query_map(params![tier.tag(), ts], |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Timestamp of the newest sample per host, across all tiers.
    pub fn last_sample_times(&self) -> Result<HashMap<String, Timestamp>, StoreError> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT host, MAX(ts) FROM samples GROUP BY host")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, Timestamp>(1)?)))?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn count_samples(&self, tier: Tier, host: Option<&str>) -> Result<usize, StoreError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM samples WHERE tier = ?1 AND (?2 IS NULL OR host = ?2)",
            params![tier.tag(), host],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn count_child_rows(&self) -> Result<(usize, usize), StoreError> {
        let net: i64 = self.conn.query_row("SELECT COUNT(*) FROM net_samples", [], |r| r.get(0))?;
        let disk: i64 = self.conn.query_row("SELECT COUNT(*) FROM disk_samples", [], |r| r.get(0))?;
        Ok((net as usize, disk as usize))
    }
}
