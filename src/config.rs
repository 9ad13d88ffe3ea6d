use crate::errors::ConfigError;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use std::{net::IpAddr, path::PathBuf, time::Duration};

type DurationSeconds = serde_with::DurationSecondsWithFrac<f64>;

#[serde_as]
#[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
#[serde(default, deny_unknown_fields)]
pub struct GatewayConfig {
    pub host: String,
    pub api_port: u16,
    pub rtsp_port: u16,
    pub username: Option<String>,
    pub password: Option<String>,

    #[serde_as(as = "DurationSeconds")]
    pub request_timeout: Duration,
    pub retry_attempts: usize,
    #[serde_as(as = "DurationSeconds")]
    pub retry_delay: Duration,
    pub backoff_base_multiplier: f64,
    pub backoff_jitter_range: (f64, f64),

    pub max_idle_connections: usize,
    pub max_idle_connections_per_host: usize,
    #[serde_as(as = "DurationSeconds")]
    pub idle_connection_timeout: Duration,

    // when set, recordPath/recordFormat are pushed into the gateway global
    // configuration at startup
    pub override_gateway_paths: bool,
}
impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            api_port: 9997,
            rtsp_port: 8554,
            username: None,
            password: None,

            request_timeout: Duration::from_secs(10),
            retry_attempts: 3,
            retry_delay: Duration::from_secs(1),
            backoff_base_multiplier: 2.0,
            backoff_jitter_range: (0.9, 1.1),

            max_idle_connections: 16,
            max_idle_connections_per_host: 8,
            idle_connection_timeout: Duration::from_secs(90),

            override_gateway_paths: false,
        }
    }
}

#[serde_as]
#[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
#[serde(default, deny_unknown_fields)]
pub struct MonitorConfig {
    #[serde_as(as = "DurationSeconds")]
    pub poll_interval: Duration,
    pub device_directory: PathBuf,
}
impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            device_directory: PathBuf::from("/dev"),
        }
    }
}

#[serde_as]
#[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
#[serde(default, deny_unknown_fields)]
pub struct StreamsConfig {
    // rendered with {device} and {url} placeholders
    pub run_on_demand_template: String,
    pub run_on_demand_restart: bool,
    #[serde_as(as = "DurationSeconds")]
    pub on_demand_start_timeout: Duration,
    #[serde_as(as = "DurationSeconds")]
    pub on_demand_close_after: Duration,
}
impl Default for StreamsConfig {
    fn default() -> Self {
        Self {
            run_on_demand_template: "/usr/bin/ffmpeg -f v4l2 -i {device} \
                -c:v libx264 -preset ultrafast -tune zerolatency -f rtsp {url}"
                .to_owned(),
            run_on_demand_restart: true,
            on_demand_start_timeout: Duration::from_secs(10),
            on_demand_close_after: Duration::from_secs(60),
        }
    }
}

#[serde_as]
#[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
#[serde(default, deny_unknown_fields)]
pub struct RecordingsConfig {
    pub recordings_path: PathBuf,
    pub format: String,
    #[serde_as(as = "DurationSeconds")]
    pub segment_duration: Duration,
    #[serde_as(as = "DurationSeconds")]
    pub part_duration: Duration,
    // zero keeps segments until cleanup removes them
    #[serde_as(as = "DurationSeconds")]
    pub delete_after: Duration,

    pub retention_enabled: bool,
    #[serde_as(as = "DurationSeconds")]
    pub cleanup_max_age: Duration,
    pub cleanup_max_count: usize,
}
impl Default for RecordingsConfig {
    fn default() -> Self {
        Self {
            recordings_path: PathBuf::from("/var/lib/cameractl/recordings"),
            format: "fmp4".to_owned(),
            segment_duration: Duration::from_secs(3600),
            part_duration: Duration::from_secs(1),
            delete_after: Duration::ZERO,

            retention_enabled: true,
            cleanup_max_age: Duration::from_secs(7 * 24 * 3600),
            cleanup_max_count: 1000,
        }
    }
}

#[serde_as]
#[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
#[serde(default, deny_unknown_fields)]
pub struct SnapshotsConfig {
    pub snapshots_path: PathBuf,
    pub quality: u8,
    pub max_width: Option<u32>,
    #[serde_as(as = "DurationSeconds")]
    pub capture_timeout: Duration,

    pub retention_enabled: bool,
    #[serde_as(as = "DurationSeconds")]
    pub cleanup_max_age: Duration,
    pub cleanup_max_count: usize,
}
impl Default for SnapshotsConfig {
    fn default() -> Self {
        Self {
            snapshots_path: PathBuf::from("/var/lib/cameractl/snapshots"),
            quality: 85,
            max_width: None,
            capture_timeout: Duration::from_secs(5),

            retention_enabled: true,
            cleanup_max_age: Duration::from_secs(7 * 24 * 3600),
            cleanup_max_count: 1000,
        }
    }
}

#[serde_as]
#[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
#[serde(default, deny_unknown_fields)]
pub struct HealthConfig {
    #[serde_as(as = "DurationSeconds")]
    pub check_interval: Duration,
    pub failure_threshold: usize,
    #[serde_as(as = "DurationSeconds")]
    pub recovery_timeout: Duration,
    pub recovery_confirmation_threshold: usize,
    pub backoff_base_multiplier: f64,
    pub backoff_jitter_range: (f64, f64),
    #[serde_as(as = "DurationSeconds")]
    pub max_backoff_interval: Duration,

    #[serde_as(as = "DurationSeconds")]
    pub notification_debounce: Duration,

    pub storage_warn_percent: f64,
    pub storage_block_percent: f64,

    pub memory_warn_percent: f64,
    pub error_rate_warn: f64,
    #[serde_as(as = "DurationSeconds")]
    pub response_time_warn: Duration,
    pub active_connections_warn: usize,
    pub task_count_warn: usize,
}
impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(5),
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(30),
            recovery_confirmation_threshold: 2,
            backoff_base_multiplier: 2.0,
            backoff_jitter_range: (0.9, 1.1),
            max_backoff_interval: Duration::from_secs(300),

            notification_debounce: Duration::from_secs(30),

            storage_warn_percent: 85.0,
            storage_block_percent: 95.0,

            memory_warn_percent: 90.0,
            error_rate_warn: 0.05,
            response_time_warn: Duration::from_secs(1),
            active_connections_warn: 100,
            task_count_warn: 1000,
        }
    }
}

#[serde_as]
#[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
#[serde(default, deny_unknown_fields)]
pub struct DiscoveryConfig {
    pub enabled: bool,
    #[serde_as(as = "DurationSeconds")]
    pub scan_interval: Duration,
    #[serde_as(as = "DurationSeconds")]
    pub scan_timeout: Duration,
    pub max_concurrent_probes: usize,

    pub known_ips: Vec<IpAddr>,
    pub cidr_ranges: Vec<String>,

    pub skydio_ports: Vec<u16>,
    pub skydio_paths: Vec<String>,
    pub generic_ports: Vec<u16>,
    pub generic_paths: Vec<String>,
}
impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            scan_interval: Duration::from_secs(300),
            scan_timeout: Duration::from_secs(2),
            max_concurrent_probes: 64,

            known_ips: Vec::new(),
            cidr_ranges: Vec::new(),

            skydio_ports: vec![554],
            skydio_paths: vec!["/skydio".to_owned()],
            generic_ports: vec![554, 8554],
            generic_paths: vec!["/".to_owned(), "/stream".to_owned()],
        }
    }
}

#[serde_as]
#[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
#[serde(default, deny_unknown_fields)]
pub struct LifecycleConfig {
    #[serde_as(as = "DurationSeconds")]
    pub shutdown_timeout: Duration,
    #[serde_as(as = "DurationSeconds")]
    pub readiness_poll_interval: Duration,
}
impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout: Duration::from_secs(30),
            readiness_poll_interval: Duration::from_millis(100),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Debug, Default)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub gateway: GatewayConfig,
    pub monitor: MonitorConfig,
    pub streams: StreamsConfig,
    pub recordings: RecordingsConfig,
    pub snapshots: SnapshotsConfig,
    pub health: HealthConfig,
    pub discovery: DiscoveryConfig,
    pub lifecycle: LifecycleConfig,
}
impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=100.0).contains(&self.health.storage_warn_percent) {
            return Err(ConfigError {
                field: "health.storage_warn_percent".to_owned(),
                message: "must be within 0..=100".to_owned(),
            });
        }
        if !(0.0..=100.0).contains(&self.health.storage_block_percent) {
            return Err(ConfigError {
                field: "health.storage_block_percent".to_owned(),
                message: "must be within 0..=100".to_owned(),
            });
        }
        if self.health.storage_warn_percent > self.health.storage_block_percent {
            return Err(ConfigError {
                field: "health.storage_warn_percent".to_owned(),
                message: "must not exceed storage_block_percent".to_owned(),
            });
        }
        if self.health.failure_threshold == 0 {
            return Err(ConfigError {
                field: "health.failure_threshold".to_owned(),
                message: "must be positive".to_owned(),
            });
        }
        if self.health.backoff_base_multiplier < 1.0 {
            return Err(ConfigError {
                field: "health.backoff_base_multiplier".to_owned(),
                message: "must be >= 1.0".to_owned(),
            });
        }
        if !self.streams.run_on_demand_template.contains("{device}")
            && !self.streams.run_on_demand_template.contains("{url}")
        {
            return Err(ConfigError {
                field: "streams.run_on_demand_template".to_owned(),
                message: "must reference {device} or {url}".to_owned(),
            });
        }
        if self.snapshots.quality == 0 || self.snapshots.quality > 100 {
            return Err(ConfigError {
                field: "snapshots.quality".to_owned(),
                message: "must be within 1..=100".to_owned(),
            });
        }

        Ok(())
    }
}

// Shared configuration handle. Readers copy under a short read lock;
// updates validate before swapping.
#[derive(Debug)]
pub struct ConfigStore {
    inner: RwLock<Config>,
}
impl ConfigStore {
    pub fn new(config: Config) -> Result<Self, ConfigError> {
        config.validate()?;

        let inner = RwLock::new(config);

        Ok(Self { inner })
    }

    pub fn snapshot(&self) -> Config {
        self.inner.read().clone()
    }

    pub fn update(
        &self,
        config: Config,
    ) -> Result<(), ConfigError> {
        config.validate()?;

        *self.inner.write() = config;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn threshold_ordering_enforced() {
        let mut config = Config::default();
        config.health.storage_warn_percent = 96.0;
        config.health.storage_block_percent = 95.0;

        let error = config.validate().unwrap_err();
        assert_eq!(error.field, "health.storage_warn_percent");
    }

    #[test]
    fn quality_bounds_enforced() {
        let mut config = Config::default();
        config.snapshots.quality = 0;
        assert!(config.validate().is_err());

        config.snapshots.quality = 101;
        assert!(config.validate().is_err());

        config.snapshots.quality = 100;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn store_rejects_invalid_update() {
        let store = ConfigStore::new(Config::default()).unwrap();

        let mut broken = store.snapshot();
        broken.health.failure_threshold = 0;
        assert!(store.update(broken).is_err());

        // original config still in place
        assert_eq!(store.snapshot().health.failure_threshold, 3);
    }

    #[test]
    fn serde_round_trip_with_durations() {
        let config = Config::default();
        let serialized = serde_json::to_string(&config).unwrap();
        let deserialized: Config = serde_json::from_str(&serialized).unwrap();
        assert_eq!(config, deserialized);
    }
}
