//! Schéma SQLite et migrations versionnées.
//!
//! Les quatre tiers partagent la table `samples` (colonne `tier`). Chaque
//! migration est appliquée une seule fois, dans l'ordre, et n'efface jamais de
//! données existantes.

use rusqlite::Connection;
use tracing::info;

use super::StoreError;

const VERSION_TABLE: &str = "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);";

const V1_INITIAL: &str = r#"
CREATE TABLE IF NOT EXISTS hosts (
    host        TEXT PRIMARY KEY,
    ram_total   INTEGER NOT NULL CHECK (ram_total >= 0),
    swap_total  INTEGER NOT NULL CHECK (swap_total >= 0)
);

CREATE TABLE IF NOT EXISTS samples (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    tier        INTEGER NOT NULL CHECK (tier BETWEEN 0 AND 3),
    host        TEXT NOT NULL REFERENCES hosts(host) ON DELETE CASCADE,
    ts          INTEGER NOT NULL,
    cpu_busy    INTEGER CHECK (cpu_busy BETWEEN 0 AND 10000),
    cpu_io      INTEGER CHECK (cpu_io BETWEEN 0 AND 10000),
    cpu_steal   INTEGER CHECK (cpu_steal BETWEEN 0 AND 10000),
    ram_used    INTEGER NOT NULL CHECK (ram_used >= 0),
    swap_used   INTEGER NOT NULL CHECK (swap_used >= 0),
    CHECK ((cpu_busy IS NULL) = (cpu_io IS NULL) AND (cpu_io IS NULL) = (cpu_steal IS NULL))
);

CREATE UNIQUE INDEX IF NOT EXISTS samples_tier_host_ts ON samples (tier, host, ts);

CREATE TABLE IF NOT EXISTS net_samples (
    sample_id   INTEGER NOT NULL REFERENCES samples(id) ON DELETE CASCADE,
    interface   TEXT NOT NULL,
    in_bytes    INTEGER CHECK (in_bytes >= 0),
    out_bytes   INTEGER CHECK (out_bytes >= 0),
    in_packets  INTEGER CHECK (in_packets >= 0),
    out_packets INTEGER CHECK (out_packets >= 0),
    in_errors   INTEGER CHECK (in_errors >= 0),
    out_errors  INTEGER CHECK (out_errors >= 0),
    UNIQUE (sample_id, interface)
);

CREATE TABLE IF NOT EXISTS disk_samples (
    sample_id   INTEGER NOT NULL REFERENCES samples(id) ON DELETE CASCADE,
    device      TEXT NOT NULL,
    read_usage  INTEGER CHECK (read_usage >= 0),
    write_usage INTEGER CHECK (write_usage >= 0),
    read_speed  INTEGER CHECK (read_speed >= 0),
    write_speed INTEGER CHECK (write_speed >= 0),
    used        INTEGER NOT NULL CHECK (used >= 0),
    total       INTEGER NOT NULL CHECK (total >= 0),
    UNIQUE (sample_id, device)
);
"#;

// retention sweeps filter on (tier, ts) without a host
const V2_RETENTION_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS samples_tier_ts ON samples (tier, ts);
CREATE INDEX IF NOT EXISTS net_samples_sample ON net_samples (sample_id);
CREATE INDEX IF NOT EXISTS disk_samples_sample ON disk_samples (sample_id);
"#;

const MIGRATIONS: &[&str] = &[V1_INITIAL, V2_RETENTION_INDEX];

pub const SCHEMA_VERSION: u32 = MIGRATIONS.len() as u32;

pub(crate) fn current_version(conn: &Connection) -> Result<u32, StoreError> {
    conn.execute_batch(VERSION_TABLE)?;
    let version: Option<u32> = conn.query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))?;
    Ok(version.unwrap_or(0))
}

/// Migrations en attente ; retourne la version atteinte
pub(crate) fn migrate(conn: &mut Connection) -> Result<u32, StoreError> {
    let found = current_version(conn)?;
    if found > SCHEMA_VERSION {
        return Err(StoreError::UnsupportedVersion {
            found,
            supported: SCHEMA_VERSION,
        });
    }

    let tx = conn.transaction()?;
    for (idx, ddl) in MIGRATIONS.iter().enumerate().skip(found as usize) {
        let version = idx as u32 + 1;
        tx.execute_batch(ddl)?;
        tx.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])?;
        info!(version, "applied storage migration");
    }
    tx.commit()?;

    Ok(SCHEMA_VERSION)
}
