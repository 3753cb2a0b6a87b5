//! XID error scanning (from dmesg)
//!
//! The driver logs XID errors to the kernel ring buffer as
//! `NVRM: Xid (PCI:0000:3b:00): 79, pid=..., ...`. The scanner keeps a
//! per-device cursor so each logged XID is reported once.

use std::collections::HashMap;
use std::process::Command;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, trace};

static XID_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"NVRM: Xid \(PCI:([^)]+)\): (\d+),").expect("XID pattern is valid")
});

/// Reduce a PCI address to `bus:device`, lowercase.
///
/// Accepts both the NVML form (`00000000:3B:00.0`) and the kernel log
/// form (`0000:3b:00`).
pub fn normalize_bus_id(bus_id: &str) -> String {
    let lower = bus_id.trim().to_ascii_lowercase();
    let mut parts = lower.rsplit(':');
    let device = parts.next().unwrap_or_default();
    let device = device.split('.').next().unwrap_or_default();
    match parts.next() {
        Some(bus) => format!("{}:{}", bus, device),
        None => device.to_string(),
    }
}

/// Parse `(bus id, xid)` pairs in log order
pub fn parse_xids(log: &str) -> Vec<(String, u32)> {
    XID_PATTERN
        .captures_iter(log)
        .filter_map(|cap| {
            let code = cap[2].parse::<u32>().ok()?;
            Some((normalize_bus_id(&cap[1]), code))
        })
        .collect()
}

/// Incremental XID reader over successive kernel log snapshots
#[derive(Debug)]
pub struct XidScanner {
    /// gpu id by normalized bus id
    devices: HashMap<String, u32>,
    /// XIDs already seen per bus id
    seen: HashMap<String, usize>,
    primed: bool,
}

impl XidScanner {
    /// `devices` maps device ids to their PCI bus id
    pub fn new<I, S>(devices: I) -> Self
    where
        I: IntoIterator<Item = (u32, S)>,
        S: AsRef<str>,
    {
        Self {
            devices: devices
                .into_iter()
                .map(|(gpu_id, bus)| (normalize_bus_id(bus.as_ref()), gpu_id))
                .collect(),
            seen: HashMap::new(),
            primed: false,
        }
    }

    /// New XIDs per device since the previous snapshot.
    ///
    /// The first snapshot only sets the baseline. Entries for unknown bus
    /// ids are ignored.
    pub fn scan(&mut self, log: &str) -> HashMap<u32, Vec<u32>> {
        let mut per_bus: HashMap<String, Vec<u32>> = HashMap::new();
        for (bus, code) in parse_xids(log) {
            per_bus.entry(bus).or_default().push(code);
        }

        let mut fresh: HashMap<u32, Vec<u32>> = HashMap::new();
        for (bus, codes) in per_bus {
            // ring buffer wrapped or was cleared
            let seen = self.seen.get(&bus).copied().unwrap_or(0).min(codes.len());
            self.seen.insert(bus.clone(), codes.len());

            if !self.primed {
                continue;
            }
            if let Some(&gpu_id) = self.devices.get(&bus) {
                if codes.len() > seen {
                    fresh.entry(gpu_id).or_default().extend(&codes[seen..]);
                }
            } else {
                trace!(bus = %bus, "XID for a device outside the group");
            }
        }

        self.primed = true;
        fresh
    }
}

/// Read the kernel ring buffer; `None` if dmesg is unavailable
pub fn read_kernel_log() -> Option<String> {
    match Command::new("dmesg").output() {
        Ok(output) if output.status.success() => {
            Some(String::from_utf8_lossy(&output.stdout).into_owned())
        }
        Ok(_) => {
            debug!("dmesg command failed, skipping XID scan");
            None
        }
        Err(e) => {
            debug!(error = %e, "dmesg unavailable, skipping XID scan");
            None
        }
    }
}
