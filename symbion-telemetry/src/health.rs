use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// État du service exposé sur /system/health
#[derive(Debug, Serialize, Deserialize)]
pub struct TelemetryHealth {
    pub uptime_seconds: u64,
    pub hosts_tracked: u32,
    pub payloads_accepted: u64,
    pub payloads_rejected: u64,
    /// Dernière frontière archivée (epoch ms)
    pub last_archive_boundary: Option<i64>,
    pub memory_usage_mb: f32,
    pub mqtt_status: String,
    pub mqtt_reconnects: u32,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    accepted: Arc<AtomicU64>,
    rejected: Arc<AtomicU64>,
    last_archive: Arc<AtomicI64>,
    mqtt_reconnects: Arc<AtomicU32>,
    mqtt_status: Arc<parking_lot::Mutex<String>>,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            accepted: Arc::new(AtomicU64::new(0)),
            rejected: Arc::new(AtomicU64::new(0)),
            last_archive: Arc::new(AtomicI64::new(i64::MIN)),
            mqtt_reconnects: Arc::new(AtomicU32::new(0)),
            mqtt_status: Arc::new(parking_lot::Mutex::new("disabled".to_string())),
        }
    }

    pub fn record_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_archive(&self, boundary: i64) {
        self.last_archive.fetch_max(boundary, Ordering::Relaxed);
    }

    pub fn last_archive(&self) -> Option<i64> {
        let v = self.last_archive.load(Ordering::Relaxed);
        (v != i64::MIN).then_some(v)
    }

    pub fn mark_mqtt_connecting(&self) {
        *self.mqtt_status.lock() = "connecting".to_string();
    }

    pub fn mark_mqtt_connected(&self) {
        *self.mqtt_status.lock() = "connected".to_string();
    }

    pub fn increment_reconnects(&self) {
        self.mqtt_reconnects.fetch_add(1, Ordering::Relaxed);
        *self.mqtt_status.lock() = "reconnecting".to_string();
    }

    pub fn get_health(&self, hosts_tracked: usize) -> TelemetryHealth {
        TelemetryHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            hosts_tracked: hosts_tracked as u32,
            payloads_accepted: self.accepted.load(Ordering::Relaxed),
            payloads_rejected: self.rejected.load(Ordering::Relaxed),
            last_archive_boundary: self.last_archive(),
            memory_usage_mb: get_memory_usage_mb(),
            mqtt_status: self.mqtt_status.lock().clone(),
            mqtt_reconnects: self.mqtt_reconnects.load(Ordering::Relaxed),
        }
    }
}

fn get_memory_usage_mb() -> f32 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            let rss_kb = status
                .lines()
                .find(|l| l.starts_with("VmRSS:"))
                .and_then(|l| l.split_whitespace().nth(1))
                .and_then(|kb| kb.parse::<u64>().ok());
            if let Some(kb) = rss_kb {
                return kb as f32 / 1024.0;
            }
        }
    }
    0.0
}
