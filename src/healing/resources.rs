use serde::Serialize;
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};
use sysinfo::{Disks, System};

use crate::error::Result;
use crate::logging::LOG_FILE_PREFIX;

/// Host usage in percent
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq)]
pub struct ResourceUsage {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
}

impl ResourceUsage {
    /// Name and value of the first reading above `threshold`
    pub fn first_over(&self, threshold: f64) -> Option<(&'static str, f64)> {
        [
            ("cpu", self.cpu_percent),
            ("memory", self.memory_percent),
            ("disk", self.disk_percent),
        ]
        .into_iter()
        .find(|(_, value)| *value > threshold)
    }
}

/// Samples CPU, memory and root-disk usage
///
/// CPU usage is measured between consecutive samples, so the first reading
/// after construction may be zero.
pub struct ResourceMonitor {
    system: Mutex<System>,
}

impl Default for ResourceMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceMonitor {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu();
        system.refresh_memory();
        Self {
            system: Mutex::new(system),
        }
    }

    pub fn sample(&self) -> ResourceUsage {
        let mut system = self.system.lock().unwrap_or_else(|p| p.into_inner());
        system.refresh_cpu();
        system.refresh_memory();

        let total_memory = system.total_memory();
        let memory_percent = if total_memory > 0 {
            system.used_memory() as f64 / total_memory as f64 * 100.0
        } else {
            0.0
        };

        ResourceUsage {
            cpu_percent: system.global_cpu_info().cpu_usage() as f64,
            memory_percent,
            disk_percent: root_disk_percent(),
        }
    }
}

fn root_disk_percent() -> f64 {
    let disks = Disks::new_with_refreshed_list();
    let usage = |total: u64, available: u64| {
        if total == 0 {
            0.0
        } else {
            (total - available.min(total)) as f64 / total as f64 * 100.0
        }
    };

    let root = disks.list().iter().find(|d| d.mount_point() == Path::new("/"));
    match root {
        Some(disk) => usage(disk.total_space(), disk.available_space()),
        None => disks
            .list()
            .iter()
            .map(|d| usage(d.total_space(), d.available_space()))
            .fold(0.0, f64::max),
    }
}

/// Delete this process's rolled log files (`tradefleet.log*`) in `dir` last
/// modified more than `retention` ago; returns how many were removed
///
/// A file that cannot be inspected or removed is logged and skipped.
pub async fn cleanup_old_logs(dir: &Path, retention: Duration) -> Result<usize> {
    if !tokio::fs::try_exists(dir).await? {
        return Ok(0);
    }

    let cutoff = SystemTime::now()
        .checked_sub(retention)
        .unwrap_or(SystemTime::UNIX_EPOCH);
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut deleted = 0;

    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_name().to_string_lossy().starts_with(LOG_FILE_PREFIX) {
            continue;
        }
        match remove_if_older(&entry, cutoff).await {
            Ok(true) => deleted += 1,
            Ok(false) => {}
            Err(e) => tracing::warn!("Disk cleanup skipped {}: {}", entry.path().display(), e),
        }
    }

    tracing::info!("Disk cleanup: deleted {} old log files", deleted);
    Ok(deleted)
}

async fn remove_if_older(entry: &tokio::fs::DirEntry, cutoff: SystemTime) -> std::io::Result<bool> {
    let metadata = entry.metadata().await?;
    if !metadata.is_file() || metadata.modified()? >= cutoff {
        return Ok(false);
    }
    tokio::fs::remove_file(entry.path()).await?;
    Ok(true)
}
