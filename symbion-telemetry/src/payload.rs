/*!
 * PAYLOAD AGENT - Décodage des compteurs bruts envoyés par les agents
 *
 * RÔLE :
 * Les agents publient des tableaux texte issus de /proc/stat, /proc/meminfo,
 * /proc/net/dev, df et /proc/diskstats. Ce module les transforme une seule fois,
 * à la frontière, en structures typées. Toute entrée mal formée devient une
 * `PayloadError` : aucun parsing paresseux plus loin dans le pipeline.
 */

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::models::Timestamp;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PayloadError {
    #[error("{0} must not be blank")]
    Blank(&'static str),
    #[error("{what}: expected {expected} fields, found {found}")]
    FieldCount {
        what: &'static str,
        expected: &'static str,
        found: usize,
    },
    #[error("{what}: invalid counter value '{value}'")]
    InvalidNumber { what: &'static str, value: String },
}

/// Payload JSON tel que reçu (HTTP ou MQTT)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentPayload {
    pub key: String,
    pub host: String,
    pub date: Timestamp,
    /// user nice system idle iowait irq softirq [steal guest guest_nice]
    pub cpu: String,
    /// ramTotal ramFree swapTotal swapFree
    pub ram: String,
    /// interface -> 16 compteurs /proc/net/dev
    #[serde(default)]
    pub net: BTreeMap<String, String>,
    #[serde(default)]
    pub disk: DiskPayload,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiskPayload {
    #[serde(default)]
    pub df: Vec<String>,
    #[serde(default)]
    pub diskstats: Vec<String>,
}

/// Cumulative jiffies from the first `cpu` line of /proc/stat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CpuCounters {
    pub user: i64,
    pub nice: i64,
    pub system: i64,
    pub idle: i64,
    pub iowait: i64,
    pub irq: i64,
    pub softirq: i64,
    pub steal: i64,
    pub guest: i64,
    pub guest_nice: i64,
}

impl CpuCounters {
    /// Everything that is neither idle, io-wait nor steal. Summed in i128 so
    /// that any valid counter set fits.
    pub fn busy(&self) -> i128 {
        [self.user, self.nice, self.system, self.irq, self.softirq, self.guest, self.guest_nice]
            .iter()
            .map(|v| *v as i128)
            .sum()
    }

    pub fn as_array(&self) -> [i64; 10] {
        [
            self.user,
            self.nice,
            self.system,
            self.idle,
            self.iowait,
            self.irq,
            self.softirq,
            self.steal,
            self.guest,
            self.guest_nice,
        ]
    }
}

/// Jauges mémoire en octets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RamGauges {
    pub ram_total: i64,
    pub ram_free: i64,
    pub swap_total: i64,
    pub swap_free: i64,
}

impl RamGauges {
    pub fn ram_used(&self) -> i64 {
        (self.ram_total - self.ram_free).max(0)
    }

    pub fn swap_used(&self) -> i64 {
        (self.swap_total - self.swap_free).max(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NetCounters {
    pub in_bytes: i64,
    pub in_packets: i64,
    pub in_errors: i64,
    pub out_bytes: i64,
    pub out_packets: i64,
    pub out_errors: i64,
}

/// One `df -T` line. Sizes in KiB.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DfEntry {
    pub filesystem: String,
    pub fs_type: String,
    pub blocks_kib: i64,
    pub used_kib: i64,
    pub available_kib: i64,
    pub mounted_on: String,
}

/// One /proc/diskstats line, only the counters the pipeline consumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskStatsEntry {
    pub device: String,
    pub reads: i64,
    pub sectors_read: i64,
    pub writes: i64,
    pub sectors_written: i64,
    pub ms_io: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DiskCounters {
    pub df: Vec<DfEntry>,
    pub stats: Vec<DiskStatsEntry>,
}

/// Payload entièrement décodé, prêt pour les handlers de compteurs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedPayload {
    pub host: String,
    pub date: Timestamp,
    pub cpu: CpuCounters,
    pub ram: RamGauges,
    pub net: BTreeMap<String, NetCounters>,
    pub disk: DiskCounters,
}

impl AgentPayload {
    pub fn parse(&self) -> Result<ParsedPayload, PayloadError> {
        if self.host.trim().is_empty() {
            return Err(PayloadError::Blank("host"));
        }

        let net = self
            .net
            .iter()
            .map(|(iface, raw)| -> Result<_, PayloadError> { Ok((iface.clone(), parse_net(raw)?)) })
            .collect::<Result<BTreeMap<_, _>, PayloadError>>()?;

        Ok(ParsedPayload {
            host: self.host.trim().to_string(),
            date: self.date,
            cpu: parse_cpu(&self.cpu)?,
            ram: parse_ram(&self.ram)?,
            net,
            disk: DiskCounters {
                df: self.disk.df.iter().map(|l| parse_df(l)).collect::<Result<_, _>>()?,
                stats: self
                    .disk
                    .diskstats
                    .iter()
                    .map(|l| parse_diskstats(l))
                    .collect::<Result<_, _>>()?,
            },
        })
    }
}

fn number(what: &'static str, raw: &str) -> Result<i64, PayloadError> {
    raw.parse::<i64>()
        .ok()
        .filter(|v| *v >= 0)
        .ok_or_else(|| PayloadError::InvalidNumber {
            what,
            value: raw.to_string(),
        })
}

/// A KiB size that still fits an i64 once converted to bytes.
fn kib(what: &'static str, raw: &str) -> Result<i64, PayloadError> {
    let value = number(what, raw)?;
    value.checked_mul(1024).map(|_| value).ok_or_else(|| PayloadError::InvalidNumber {
        what,
        value: raw.to_string(),
    })
}

fn numbers(what: &'static str, fields: &[&str]) -> Result<Vec<i64>, PayloadError> {
    fields.iter().map(|f| number(what, f)).collect()
}

pub fn parse_cpu(raw: &str) -> Result<CpuCounters, PayloadError> {
    let fields: Vec<&str> = raw.split_whitespace().collect();
    if !(7..=10).contains(&fields.len()) {
        return Err(PayloadError::FieldCount {
            what: "cpu",
            expected: "7 to 10",
            found: fields.len(),
        });
    }
    let mut v = numbers("cpu", &fields)?;
    v.resize(10, 0);
    Ok(CpuCounters {
        user: v[0],
        nice: v[1],
        system: v[2],
        idle: v[3],
        iowait: v[4],
        irq: v[5],
        softirq: v[6],
        steal: v[7],
        guest: v[8],
        guest_nice: v[9],
    })
}

pub fn parse_ram(raw: &str) -> Result<RamGauges, PayloadError> {
    let fields: Vec<&str> = raw.split_whitespace().collect();
    if fields.len() != 4 {
        return Err(PayloadError::FieldCount {
            what: "ram",
            expected: "4",
            found: fields.len(),
        });
    }
    let v = numbers("ram", &fields)?;
    Ok(RamGauges {
        ram_total: v[0],
        ram_free: v[1],
        swap_total: v[2],
        swap_free: v[3],
    })
}

pub fn parse_net(raw: &str) -> Result<NetCounters, PayloadError> {
    let fields: Vec<&str> = raw.split_whitespace().collect();
    if fields.len() != 16 {
        return Err(PayloadError::FieldCount {
            what: "net",
            expected: "16",
            found: fields.len(),
        });
    }
    let v = numbers("net", &fields)?;
    // réception 0..8, émission 8..16
    Ok(NetCounters {
        in_bytes: v[0],
        in_packets: v[1],
        in_errors: v[2],
        out_bytes: v[8],
        out_packets: v[9],
        out_errors: v[10],
    })
}

pub fn parse_df(raw: &str) -> Result<DfEntry, PayloadError> {
    let fields: Vec<&str> = raw.split_whitespace().collect();
    if fields.len() != 7 {
        return Err(PayloadError::FieldCount {
            what: "disk df",
            expected: "7",
            found: fields.len(),
        });
    }
    let filesystem = fields[0].strip_prefix("/dev/").unwrap_or(fields[0]);
    Ok(DfEntry {
        filesystem: filesystem.to_string(),
        fs_type: fields[1].to_string(),
        blocks_kib: kib("disk df", fields[2])?,
        used_kib: kib("disk df", fields[3])?,
        available_kib: kib("disk df", fields[4])?,
        mounted_on: fields[6].to_string(),
    })
}

pub fn parse_diskstats(raw: &str) -> Result<DiskStatsEntry, PayloadError> {
    let fields: Vec<&str> = raw.split_whitespace().collect();
    if fields.len() != 14 {
        return Err(PayloadError::FieldCount {
            what: "disk stats",
            expected: "14",
            found: fields.len(),
        });
    }
    let counter = |idx: usize| number("disk stats", fields[idx]);
    Ok(DiskStatsEntry {
        device: fields[2].to_string(),
        reads: counter(3)?,
        sectors_read: counter(5)?,
        writes: counter(7)?,
        sectors_written: counter(9)?,
        ms_io: counter(12)?,
    })
}
