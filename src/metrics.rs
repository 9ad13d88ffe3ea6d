use crate::{config::ConfigStore, util::fs::directory_size};
use serde::Serialize;
use std::{fmt, path::Path, sync::Arc, time::Duration};

#[derive(Serialize, Clone, Copy, PartialEq, Debug, Default)]
pub struct StorageInfo {
    pub total_space: u64,
    pub used_space: u64,
    pub available_space: u64,
    pub usage_percentage: f64,
    pub recordings_size: u64,
    pub snapshots_size: u64,
    pub low_space_warning: bool,
}

#[derive(Serialize, Clone, Copy, PartialEq, Debug, Default)]
pub struct PerformanceMetrics {
    pub memory_percent: f64,
    pub error_rate: f64,
    pub average_response_time_seconds: f64,
    pub active_connections: usize,
    pub task_count: usize,
}

// Collectors tolerate underlying failures and fall back to zero instead of
// propagating, so health reporting keeps working on degraded hosts.
pub struct SystemMetricsCollector {
    config_store: Arc<ConfigStore>,
}
impl SystemMetricsCollector {
    pub fn new(config_store: Arc<ConfigStore>) -> Self {
        Self { config_store }
    }

    fn filesystem_root(path: &Path) -> &Path {
        // statvfs needs an existing path; walk up until one exists
        let mut candidate = path;
        loop {
            if candidate.exists() {
                return candidate;
            }
            candidate = match candidate.parent() {
                Some(parent) => parent,
                None => return Path::new("/"),
            };
        }
    }

    pub async fn storage_info(&self) -> StorageInfo {
        let config = self.config_store.snapshot();

        let root = config.recordings.recordings_path.clone();
        let root = Self::filesystem_root(&root).to_path_buf();

        let total_space = fs4::total_space(&root).unwrap_or(0);
        let available_space = fs4::available_space(&root).unwrap_or(0);
        let used_space = total_space.saturating_sub(available_space);

        let usage_percentage = if total_space > 0 {
            (used_space as f64 / total_space as f64) * 100.0
        } else {
            0.0
        };

        let recordings_size = directory_size(&config.recordings.recordings_path)
            .await
            .unwrap_or(0);
        let snapshots_size = directory_size(&config.snapshots.snapshots_path)
            .await
            .unwrap_or(0);

        StorageInfo {
            total_space,
            used_space,
            available_space,
            usage_percentage,
            recordings_size,
            snapshots_size,
            low_space_warning: usage_percentage >= config.health.storage_warn_percent,
        }
    }

    pub fn cpu_load_average(&self) -> f64 {
        std::fs::read_to_string("/proc/loadavg")
            .ok()
            .and_then(|content| parse_loadavg(&content))
            .unwrap_or(0.0)
    }
    pub fn memory_usage_percent(&self) -> f64 {
        std::fs::read_to_string("/proc/meminfo")
            .ok()
            .and_then(|content| parse_meminfo_percent(&content))
            .unwrap_or(0.0)
    }

    pub fn performance(
        &self,
        requests_total: u64,
        errors_total: u64,
        average_response_time: Duration,
        active_connections: usize,
        task_count: usize,
    ) -> PerformanceMetrics {
        let error_rate = if requests_total > 0 {
            errors_total as f64 / requests_total as f64
        } else {
            0.0
        };

        PerformanceMetrics {
            memory_percent: self.memory_usage_percent(),
            error_rate,
            average_response_time_seconds: average_response_time.as_secs_f64(),
            active_connections,
            task_count,
        }
    }
}
impl fmt::Display for SystemMetricsCollector {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "SystemMetricsCollector")
    }
}

fn parse_loadavg(content: &str) -> Option<f64> {
    content.split_whitespace().next()?.parse().ok()
}

fn parse_meminfo_percent(content: &str) -> Option<f64> {
    let mut total_kb: Option<f64> = None;
    let mut available_kb: Option<f64> = None;

    for line in content.lines() {
        let mut fields = line.split_whitespace();
        match fields.next() {
            Some("MemTotal:") => total_kb = fields.next()?.parse().ok(),
            Some("MemAvailable:") => available_kb = fields.next()?.parse().ok(),
            _ => {}
        }
    }

    let total_kb = total_kb?;
    let available_kb = available_kb?;
    if total_kb <= 0.0 {
        return None;
    }

    Some((1.0 - available_kb / total_kb) * 100.0)
}
