use std::collections::BTreeMap;

use super::{rate, CounterHandler, SnapshotCache};
use crate::models::{NetSample, Timestamp};
use crate::payload::NetCounters;

/// Per-interface /proc/net/dev counters to per-second rates.
#[derive(Debug)]
pub struct NetHandler {
    pub(crate) snapshots: SnapshotCache<BTreeMap<String, NetCounters>>,
}

impl Default for NetHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl NetHandler {
    pub fn new() -> Self {
        Self {
            snapshots: SnapshotCache::new("net"),
        }
    }
}

impl CounterHandler for NetHandler {
    type Raw = BTreeMap<String, NetCounters>;
    type Rate = Vec<NetSample>;

    fn handle(&self, host: &str, timestamp: Timestamp, raw: Self::Raw) -> Vec<NetSample> {
        let Some((elapsed, previous)) = self.snapshots.swap(host, timestamp, raw.clone()) else {
            return Vec::new();
        };
        let seconds = elapsed as f64 / 1000.0;

        // seules les interfaces présentes dans les deux relevés
        raw.iter()
            .filter_map(|(iface, to)| {
                let from = previous.get(iface)?;
                Some(NetSample {
                    interface: iface.clone(),
                    in_bytes: rate(from.in_bytes, to.in_bytes, seconds),
                    out_bytes: rate(from.out_bytes, to.out_bytes, seconds),
                    in_packets: rate(from.in_packets, to.in_packets, seconds),
                    out_packets: rate(from.out_packets, to.out_packets, seconds),
                    in_errors: rate(from.in_errors, to.in_errors, seconds),
                    out_errors: rate(from.out_errors, to.out_errors, seconds),
                })
            })
            .collect()
    }

    fn evict(&self, host: &str) {
        self.snapshots.evict(host);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iface(in_bytes: i64, out_bytes: i64) -> NetCounters {
        NetCounters {
            in_bytes,
            out_bytes,
            in_packets: in_bytes / 100,
            out_packets: out_bytes / 100,
            ..NetCounters::default()
        }
    }

    #[test]
    fn test_rates_only_for_interfaces_seen_twice() {
        let handler = NetHandler::new();
        let first = BTreeMap::from([("eth0".to_string(), iface(1_000, 2_000))]);
        assert!(handler.handle("h1", 0, first).is_empty());

        let second = BTreeMap::from([
            ("eth0".to_string(), iface(6_000, 4_500)),
            ("wlan0".to_string(), iface(10, 10)),
        ]);
        let rates = handler.handle("h1", 5_000, second);
        assert_eq!(rates.len(), 1);
        assert_eq!(rates[0].interface, "eth0");
        assert_eq!(rates[0].in_bytes, Some(1_000));
        assert_eq!(rates[0].out_bytes, Some(500));
        assert_eq!(rates[0].in_errors, Some(0));
    }

    #[test]
    fn test_reset_nulls_only_affected_field() {
        let handler = NetHandler::new();
        handler.handle("h1", 0, BTreeMap::from([("eth0".to_string(), iface(5_000, 5_000))]));
        let rates = handler.handle("h1", 5_000, BTreeMap::from([("eth0".to_string(), iface(100, 10_000))]));
        assert_eq!(rates[0].in_bytes, None);
        assert_eq!(rates[0].in_packets, None);
        assert_eq!(rates[0].out_bytes, Some(1_000));
    }
}
