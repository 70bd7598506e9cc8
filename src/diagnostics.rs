//! Best-effort diagnostics.
//!
//! Diagnostics must never abort a run: a failing probe is logged with its
//! whole error chain and the caller carries on.
use std::fmt::Debug;
use tch::Device;
use tracing::{info, warn};

/// Runs `probe`, logging its outcome. Errors are logged and discarded.
pub fn best_effort<T, F>(what: &str, probe: F) -> Option<T>
where
    T: Debug,
    F: FnOnce() -> anyhow::Result<T>,
{
    match probe() {
        Ok(value) => {
            info!("{what}: {value:?}");
            Some(value)
        }
        Err(err) => {
            warn!("{what} unavailable: {err:?}");
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryStats {
    /// Resident set size of the process, in kB.
    pub resident_kb: u64,
    /// Peak resident set size of the process, in kB.
    pub peak_resident_kb: u64,
    pub cuda_devices: i64,
}

fn status_field(status: &str, field: &str) -> anyhow::Result<u64> {
    let line = status
        .lines()
        .find_map(|line| line.strip_prefix(field)?.strip_prefix(':'))
        .ok_or_else(|| anyhow::anyhow!("no {field} entry in the process status"))?;
    let value = line.trim().trim_end_matches("kB").trim();
    Ok(value.parse()?)
}

/// Memory usage of the current process as reported by procfs.
pub fn memory_stats(device: Device) -> anyhow::Result<MemoryStats> {
    let status = std::fs::read_to_string("/proc/self/status")?;
    let cuda_devices = match device {
        Device::Cuda(_) => tch::Cuda::device_count(),
        _ => 0,
    };
    Ok(MemoryStats {
        resident_kb: status_field(&status, "VmRSS")?,
        peak_resident_kb: status_field(&status, "VmHWM")?,
        cuda_devices,
    })
}
