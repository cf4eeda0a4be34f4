//! Fusion d'échantillons fins en un échantillon grossier.
//!
//! Sans effet de bord : tout est calculé en mémoire avant l'insertion groupée.

use std::collections::BTreeMap;

use crate::models::{CpuUsage, DiskSample, NetSample, Sample, Tier, Timestamp};

/// Mean of the present values truncated to an integer, `None` when nothing is present.
pub fn mean_of_present<I>(values: I) -> Option<i64>
where
    I: IntoIterator<Item = Option<i64>>,
{
    let (sum, count) = values
        .into_iter()
        .flatten()
        .fold((0i128, 0i128), |(sum, count), v| (sum + v as i128, count + 1));
    (count > 0).then(|| (sum / count) as i64)
}

/// Fusion de la fenêtre, un échantillon destination par hôte
pub fn rollup(source: &[Sample], destination: Tier, window_start: Timestamp) -> Vec<Sample> {
    let mut by_host: BTreeMap<&str, Vec<&Sample>> = BTreeMap::new();
    for sample in source {
        by_host.entry(sample.host.as_str()).or_default().push(sample);
    }
    by_host
        .into_iter()
        .filter_map(|(host, mut samples)| {
            samples.sort_by_key(|s| s.timestamp);
            merge_host(host, &samples, destination, window_start)
        })
        .collect()
}

/// `samples` must be in ascending time order; the last one provides disk space gauges.
pub fn merge_host(host: &str, samples: &[&Sample], destination: Tier, window_start: Timestamp) -> Option<Sample> {
    if samples.is_empty() {
        return None;
    }

    let cpu_values: Vec<CpuUsage> = samples.iter().filter_map(|s| s.cpu).collect();
    let cpu = match (
        mean_of_present(cpu_values.iter().map(|c| Some(c.busy))),
        mean_of_present(cpu_values.iter().map(|c| Some(c.io))),
        mean_of_present(cpu_values.iter().map(|c| Some(c.steal))),
    ) {
        (Some(busy), Some(io), Some(steal)) => Some(CpuUsage { busy, io, steal }),
        _ => None,
    };

    Some(Sample {
        tier: destination,
        host: host.to_string(),
        timestamp: window_start,
        cpu,
        ram_used: mean_of_present(samples.iter().map(|s| Some(s.ram_used))).unwrap_or(0),
        swap_used: mean_of_present(samples.iter().map(|s| Some(s.swap_used))).unwrap_or(0),
        net: merge_net(samples),
        disks: merge_disks(samples),
    })
}

fn merge_net(samples: &[&Sample]) -> Vec<NetSample> {
    let mut by_iface: BTreeMap<&str, Vec<&NetSample>> = BTreeMap::new();
    for n in samples.iter().flat_map(|s| s.net.iter()) {
        by_iface.entry(n.interface.as_str()).or_default().push(n);
    }
    by_iface
        .into_iter()
        .map(|(iface, rows)| {
            let mean = |field: fn(&NetSample) -> Option<i64>| mean_of_present(rows.iter().map(|&r| field(r)));
            NetSample {
                interface: iface.to_string(),
                in_bytes: mean(|r| r.in_bytes),
                out_bytes: mean(|r| r.out_bytes),
                in_packets: mean(|r| r.in_packets),
                out_packets: mean(|r| r.out_packets),
                in_errors: mean(|r| r.in_errors),
                out_errors: mean(|r| r.out_errors),
            }
        })
        .collect()
}

fn merge_disks(samples: &[&Sample]) -> Vec<DiskSample> {
    let mut by_device: BTreeMap<&str, Vec<&DiskSample>> = BTreeMap::new();
    for d in samples.iter().flat_map(|s| s.disks.iter()) {
        by_device.entry(d.device.as_str()).or_default().push(d);
    }
    by_device
        .into_iter()
        .filter_map(|(device, rows)| {
            // jauges : dernière valeur de la fenêtre
            let last = rows.last()?;
            let mean = |field: fn(&DiskSample) -> Option<i64>| mean_of_present(rows.iter().map(|&r| field(r)));
            Some(DiskSample {
                device: device.to_string(),
                read_usage: mean(|r| r.read_usage),
                write_usage: mean(|r| r.write_usage),
                read_speed: mean(|r| r.read_speed),
                write_speed: mean(|r| r.write_speed),
                used: last.used,
                total: last.total,
            })
        })
        .collect()
}
