/*!
Agent simulé et sink enregistreur

Permet de tester le pipeline sans agent réel ni webhook Slack :
- `AgentSimulator` fait avancer des compteurs /proc cumulés et produit les payloads
- `RecordingSink` garde chaque lot de notifications pour les assertions
*/

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use symbion_telemetry::alerts::{AlertSink, NotificationEntry, NotifyError};
use symbion_telemetry::payload::{AgentPayload, DiskPayload};
use symbion_telemetry::Timestamp;

/// Kernel ticks per second used to turn elapsed time into jiffies.
pub const TICKS_PER_SECOND: i64 = 100;

#[derive(Debug, Clone)]
struct SimDisk {
    device: String,
    mount: String,
    total_kib: i64,
    used_kib: i64,
    reads: i64,
    sectors_read: i64,
    writes: i64,
    sectors_written: i64,
    ms_io: i64,
}

/// Agent dont les compteurs avancent à la demande
#[derive(Debug, Clone)]
pub struct AgentSimulator {
    pub host: String,
    pub key: String,
    /// user nice system idle iowait irq softirq steal
    cpu: [i64; 8],
    ram_total: i64,
    ram_used: i64,
    swap_total: i64,
    swap_used: i64,
    interfaces: BTreeMap<String, [i64; 16]>,
    disks: Vec<SimDisk>,
}

impl AgentSimulator {
    /// 8 GiB de RAM dont 2 utilisés, 1 GiB de swap libre
    pub fn new<S: Into<String>>(host: S, key: S) -> Self {
        Self {
            host: host.into(),
            key: key.into(),
            cpu: [1_000, 0, 500, 50_000, 100, 0, 10, 0],
            ram_total: 8 << 30,
            ram_used: 2 << 30,
            swap_total: 1 << 30,
            swap_used: 0,
            interfaces: BTreeMap::new(),
            disks: Vec::new(),
        }
    }

    pub fn with_interface(mut self, name: &str) -> Self {
        self.interfaces.insert(name.to_string(), [0; 16]);
        self
    }

    /// Sizes in KiB, as df reports them.
    pub fn with_disk(mut self, device: &str, mount: &str, total_kib: i64, used_kib: i64) -> Self {
        self.disks.push(SimDisk {
            device: device.to_string(),
            mount: mount.to_string(),
            total_kib,
            used_kib,
            reads: 0,
            sectors_read: 0,
            writes: 0,
            sectors_written: 0,
            ms_io: 0,
        });
        self
    }

    pub fn set_ram_used_pct(&mut self, pct: f64) {
        self.ram_used = (self.ram_total as f64 * pct / 100.0) as i64;
    }

    pub fn set_disk_used(&mut self, device: &str, used_kib: i64) {
        if let Some(disk) = self.disks.iter_mut().find(|d| d.device == device) {
            disk.used_kib = used_kib;
        }
    }

    /// Simule un redémarrage : tous les compteurs cumulés repartent de zéro
    pub fn reboot(&mut self) {
        self.cpu = [0; 8];
        for counters in self.interfaces.values_mut() {
            *counters = [0; 16];
        }
        for disk in &mut self.disks {
            disk.reads = 0;
            disk.sectors_read = 0;
            disk.writes = 0;
            disk.sectors_written = 0;
            disk.ms_io = 0;
        }
    }

    /// Advances every counter by `elapsed_ms`, with `busy` (0.0..=1.0) of the
    /// CPU ticks spent in user time and the rest idle.
    pub fn step(&mut self, elapsed_ms: i64, busy: f64) {
        let ticks = elapsed_ms * TICKS_PER_SECOND / 1_000;
        let busy_ticks = (ticks as f64 * busy.clamp(0.0, 1.0)).round() as i64;
        self.cpu[0] += busy_ticks;
        self.cpu[3] += ticks - busy_ticks;

        let secs = elapsed_ms / 1_000;
        for counters in self.interfaces.values_mut() {
            counters[0] += 1_000 * secs;
            counters[1] += 10 * secs;
            counters[8] += 500 * secs;
            counters[9] += 5 * secs;
        }
        for disk in &mut self.disks {
            disk.reads += 10 * secs;
            disk.sectors_read += 100 * secs;
            disk.writes += 30 * secs;
            disk.sectors_written += 300 * secs;
            disk.ms_io += elapsed_ms / 10;
        }
    }

    pub fn payload(&self, date: Timestamp) -> AgentPayload {
        AgentPayload {
            key: self.key.clone(),
            host: self.host.clone(),
            date,
            cpu: join(&self.cpu),
            ram: format!(
                "{} {} {} {}",
                self.ram_total,
                self.ram_total - self.ram_used,
                self.swap_total,
                self.swap_total - self.swap_used
            ),
            net: self
                .interfaces
                .iter()
                .map(|(name, counters)| (name.clone(), join(counters)))
                .collect(),
            disk: DiskPayload {
                df: self
                    .disks
                    .iter()
                    .map(|d| {
                        let pct = if d.total_kib > 0 { d.used_kib * 100 / d.total_kib } else { 0 };
                        format!(
                            "/dev/{} ext4 {} {} {} {}% {}",
                            d.device,
                            d.total_kib,
                            d.used_kib,
                            d.total_kib - d.used_kib,
                            pct,
                            d.mount
                        )
                    })
                    .collect(),
                diskstats: self
                    .disks
                    .iter()
                    .map(|d| {
                        format!(
                            "8 0 {} {} 0 {} 0 {} 0 {} 0 0 {} 0",
                            d.device, d.reads, d.sectors_read, d.writes, d.sectors_written, d.ms_io
                        )
                    })
                    .collect(),
            },
        }
    }

    /// Payload as the agent would publish it on HTTP or MQTT.
    pub fn payload_json(&self, date: Timestamp) -> serde_json::Value {
        serde_json::to_value(self.payload(date)).unwrap_or(serde_json::Value::Null)
    }
}

fn join(values: &[i64]) -> String {
    values.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(" ")
}

/// Sink qui enregistre les lots de notifications
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    batches: Arc<Mutex<Vec<Vec<NotificationEntry>>>>,
    failing: Arc<AtomicBool>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, every batch is rejected as a webhook would with a 503.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    pub fn batches(&self) -> Vec<Vec<NotificationEntry>> {
        self.batches.lock().clone()
    }

    /// Fallback texts of every recorded entry, in delivery order.
    pub fn texts(&self) -> Vec<String> {
        self.batches
            .lock()
            .iter()
            .flatten()
            .map(|e| e.fallback.clone())
            .collect()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.texts().iter().any(|t| t.contains(needle))
    }

    pub fn clear(&self) {
        self.batches.lock().clear();
    }
}

#[async_trait]
impl AlertSink for RecordingSink {
    async fn notify(&self, entries: &[NotificationEntry]) -> Result<(), NotifyError> {
        if self.failing.load(Ordering::Relaxed) {
            log::warn!("[MOCK] sink rejecting {} entries", entries.len());
            return Err(NotifyError::Status(503));
        }
        log::info!("[MOCK] recorded {} notification(s)", entries.len());
        self.batches.lock().push(entries.to_vec());
        Ok(())
    }
}
