use super::capture::Capturer;
use crate::{
    config::ConfigStore,
    datatypes::{camera_id::CameraId, device_path::DevicePath},
    errors::ControllerError,
    paths::manager::PathManager,
    recordings::manager::CleanupResult,
    streams::{StreamManager, StreamUseCase},
    util::fs::{ensure_directory, list_files_by_mtime_desc},
};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::{
    collections::HashMap,
    fmt,
    path::PathBuf,
    sync::Arc,
    time::{Duration, SystemTime},
};
use tokio::fs;

#[derive(Serialize, Clone, Copy, PartialEq, Eq, Debug)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotTier {
    GatewayPath,
    DirectDevice,
    OnDemandPath,
}
impl SnapshotTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GatewayPath => "gateway_path",
            Self::DirectDevice => "direct_device",
            Self::OnDemandPath => "on_demand_path",
        }
    }
}

// Immutable once captured.
#[derive(Serialize, Clone, PartialEq, Debug)]
pub struct Snapshot {
    pub id: String,
    pub device: CameraId,
    pub path: String,
    pub file_path: PathBuf,
    pub size: u64,
    pub created: DateTime<Utc>,
    pub tier_used: SnapshotTier,
}

#[derive(Serialize, Clone, PartialEq, Debug)]
pub struct SnapshotSettings {
    pub quality: u8,
    pub max_width: Option<u32>,
    pub capture_timeout_seconds: f64,
}

#[derive(Serialize, Clone, PartialEq, Debug)]
pub struct SnapshotFileInfo {
    pub file_name: String,
    pub size: u64,
    pub modified_seconds_ago: u64,
}

#[derive(Serialize, Clone, PartialEq, Debug)]
pub struct SnapshotsListResponse {
    pub files: Vec<SnapshotFileInfo>,
    pub total: usize,
    pub limit: usize,
    pub offset: usize,
}

// Tiered capture: a ready gateway path is preferred, then the local device
// directly, then an ephemeral on-demand path. The first tier that yields a
// non-empty image wins; the fallback never retries within a tier.
pub struct SnapshotManager {
    path_manager: Arc<PathManager>,
    stream_manager: Arc<StreamManager>,
    config_store: Arc<ConfigStore>,
    capturer: Arc<dyn Capturer>,

    snapshots: parking_lot::Mutex<HashMap<String, Snapshot>>,
    settings: RwLock<SnapshotSettings>,
}
impl SnapshotManager {
    pub fn new(
        path_manager: Arc<PathManager>,
        stream_manager: Arc<StreamManager>,
        config_store: Arc<ConfigStore>,
        capturer: Arc<dyn Capturer>,
    ) -> Self {
        let snapshots_config = config_store.snapshot().snapshots;
        let settings = RwLock::new(SnapshotSettings {
            quality: snapshots_config.quality,
            max_width: snapshots_config.max_width,
            capture_timeout_seconds: snapshots_config.capture_timeout.as_secs_f64(),
        });

        Self {
            path_manager,
            stream_manager,
            config_store,
            capturer,

            snapshots: parking_lot::Mutex::new(HashMap::new()),
            settings,
        }
    }

    fn capture_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.settings.read().capture_timeout_seconds)
    }

    pub async fn take_snapshot(
        &self,
        camera: &CameraId,
    ) -> Result<Snapshot, ControllerError> {
        if camera.as_str().trim().is_empty() {
            return Err(ControllerError::InvalidInput(
                "device must not be empty".to_owned(),
            ));
        }

        // identity conversion happens once, here
        let device_path = self.path_manager.device_path_for_camera(camera);
        let stream_name = self
            .stream_manager
            .generate_stream_name(camera, StreamUseCase::Viewing);

        let created = Utc::now();
        let snapshot_id = format!(
            "snap_{}",
            created.timestamp_nanos_opt().unwrap_or_default()
        );

        let snapshots_path = self.config_store.snapshot().snapshots.snapshots_path;
        ensure_directory(&snapshots_path)
            .await
            .map_err(|error| ControllerError::StorageUnavailable(format!("{error:#}")))?;

        let file_path =
            snapshots_path.join(format!("{}_{}.jpg", device_path.file_stem(), snapshot_id));

        let tier_used = self
            .capture_tiers(&device_path, &stream_name, &file_path)
            .await?;

        let size = fs::metadata(&file_path)
            .await
            .map(|metadata| metadata.len())
            .unwrap_or(0);

        let snapshot = Snapshot {
            id: snapshot_id.clone(),
            device: camera.clone(),
            path: stream_name,
            file_path,
            size,
            created,
            tier_used,
        };

        self.snapshots
            .lock()
            .insert(snapshot_id, snapshot.clone());

        log::info!(
            "{}: captured {} via {}",
            self,
            snapshot.id,
            tier_used.as_str()
        );
        Ok(snapshot)
    }

    async fn capture_tiers(
        &self,
        device_path: &DevicePath,
        stream_name: &str,
        file_path: &std::path::Path,
    ) -> Result<SnapshotTier, ControllerError> {
        let timeout = self.capture_timeout();
        let mut attempts: Vec<(SnapshotTier, String)> = Vec::new();

        // tier 1: ready gateway path
        let path_ready = match self.path_manager.get_path(stream_name).await {
            Ok(path) => path.ready,
            Err(ControllerError::NotFound { .. }) => false,
            Err(error) => {
                log::warn!("{}: gateway tier probe failed: {}", self, error);
                false
            }
        };
        if path_ready {
            let url = self.stream_manager.generate_stream_url(stream_name);
            match self.capturer.capture_rtsp(&url, file_path, timeout).await {
                Ok(()) => return Ok(SnapshotTier::GatewayPath),
                Err(error) => {
                    attempts.push((SnapshotTier::GatewayPath, format!("{error:#}")));
                }
            }
        }

        // tier 2: local device, bypassing the gateway
        if device_path.is_local() {
            match self
                .capturer
                .capture_device(device_path.as_str(), file_path, timeout)
                .await
            {
                Ok(()) => return Ok(SnapshotTier::DirectDevice),
                Err(error) => {
                    attempts.push((SnapshotTier::DirectDevice, format!("{error:#}")));
                }
            }
        }

        // tier 3: ephemeral on-demand path, released afterwards
        let on_demand_result = self
            .capture_on_demand(device_path, stream_name, file_path)
            .await;
        match on_demand_result {
            Ok(()) => return Ok(SnapshotTier::OnDemandPath),
            Err(error) => {
                attempts.push((SnapshotTier::OnDemandPath, format!("{error:#}")));
            }
        }

        let detail = attempts
            .iter()
            .map(|(tier, error)| format!("{}: {}", tier.as_str(), error))
            .collect::<Vec<_>>()
            .join("; ");
        Err(ControllerError::Internal(anyhow::anyhow!(
            "all snapshot tiers failed: {detail}"
        )))
    }

    async fn capture_on_demand(
        &self,
        device_path: &DevicePath,
        stream_name: &str,
        file_path: &std::path::Path,
    ) -> Result<(), ControllerError> {
        let streams_config = self.config_store.snapshot().streams;

        let conf = self.stream_manager.on_demand_conf(device_path, stream_name);
        self.path_manager.create_path(stream_name, &conf).await?;

        // accessing the stream starts the on-demand source, so the capture
        // window covers the start timeout as well
        let timeout = streams_config.on_demand_start_timeout + self.capture_timeout();
        let url = self.stream_manager.generate_stream_url(stream_name);
        let capture_result = self.capturer.capture_rtsp(&url, file_path, timeout).await;

        // release the ephemeral path regardless of the capture outcome
        if let Err(error) = self.path_manager.delete_path(stream_name).await {
            log::warn!(
                "{}: on-demand path release failed for {}: {}",
                self,
                stream_name,
                error
            );
        }

        capture_result.map_err(ControllerError::Internal)
    }

    pub fn get_snapshot(
        &self,
        snapshot_id: &str,
    ) -> Result<Snapshot, ControllerError> {
        self.snapshots
            .lock()
            .get(snapshot_id)
            .cloned()
            .ok_or_else(|| ControllerError::NotFound {
                kind: "snapshot",
                name: snapshot_id.to_owned(),
            })
    }
    pub fn list_snapshots(&self) -> Vec<Snapshot> {
        let mut snapshots = self
            .snapshots
            .lock()
            .values()
            .cloned()
            .collect::<Vec<Snapshot>>();
        snapshots.sort_by(|left, right| right.created.cmp(&left.created));
        snapshots
    }
    pub async fn delete_snapshot(
        &self,
        snapshot_id: &str,
    ) -> Result<(), ControllerError> {
        let snapshot = match self.snapshots.lock().remove(snapshot_id) {
            Some(snapshot) => snapshot,
            None => {
                return Err(ControllerError::NotFound {
                    kind: "snapshot",
                    name: snapshot_id.to_owned(),
                });
            }
        };

        if let Err(error) = fs::remove_file(&snapshot.file_path).await {
            log::warn!(
                "{}: delete_snapshot: {:?}: {}",
                self,
                snapshot.file_path,
                error
            );
        }

        Ok(())
    }

    pub async fn snapshots_list(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<SnapshotsListResponse, ControllerError> {
        let snapshots_path = self.config_store.snapshot().snapshots.snapshots_path;

        let entries = list_files_by_mtime_desc(&snapshots_path)
            .await
            .map_err(ControllerError::Internal)?;

        let total = entries.len();
        let now = SystemTime::now();
        let files = entries
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|entry| SnapshotFileInfo {
                file_name: entry
                    .path
                    .file_name()
                    .map(|name| name.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                size: entry.size,
                modified_seconds_ago: now
                    .duration_since(entry.modified)
                    .unwrap_or(Duration::ZERO)
                    .as_secs(),
            })
            .collect();

        Ok(SnapshotsListResponse {
            files,
            total,
            limit,
            offset,
        })
    }
    pub async fn snapshot_file_info(
        &self,
        file_name: &str,
    ) -> Result<SnapshotFileInfo, ControllerError> {
        let snapshots_path = self.config_store.snapshot().snapshots.snapshots_path;
        let path = snapshots_path.join(file_name);

        let metadata = match fs::metadata(&path).await {
            Ok(metadata) => metadata,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Err(ControllerError::NotFound {
                    kind: "snapshot",
                    name: file_name.to_owned(),
                });
            }
            Err(error) => return Err(ControllerError::Internal(error.into())),
        };

        Ok(SnapshotFileInfo {
            file_name: file_name.to_owned(),
            size: metadata.len(),
            modified_seconds_ago: metadata
                .modified()
                .ok()
                .and_then(|modified| SystemTime::now().duration_since(modified).ok())
                .unwrap_or(Duration::ZERO)
                .as_secs(),
        })
    }

    pub async fn cleanup_old_snapshots(
        &self,
        max_age: Duration,
        max_count: usize,
    ) -> Result<CleanupResult, ControllerError> {
        let snapshots_config = self.config_store.snapshot().snapshots;
        if !snapshots_config.retention_enabled {
            return Err(ControllerError::PolicyViolation(
                "snapshot retention is disabled".to_owned(),
            ));
        }

        let mut entries = list_files_by_mtime_desc(&snapshots_config.snapshots_path)
            .await
            .map_err(ControllerError::Internal)?;
        entries.reverse(); // oldest first

        let now = SystemTime::now();
        let mut remaining = entries.len();
        let mut deleted_count: usize = 0;
        let mut total_size: u64 = 0;

        for entry in entries {
            let over_count = max_count != 0 && remaining > max_count;
            let over_age = !max_age.is_zero()
                && now
                    .duration_since(entry.modified)
                    .map(|age| age > max_age)
                    .unwrap_or(false);
            if !over_count && !over_age {
                break;
            }

            match fs::remove_file(&entry.path).await {
                Ok(()) => {
                    deleted_count += 1;
                    total_size += entry.size;
                }
                Err(error) => {
                    log::warn!("{}: cleanup: {:?}: {}", self, entry.path, error);
                }
            }
            remaining -= 1;
        }

        Ok(CleanupResult {
            deleted_count,
            total_size,
            message: format!("removed {deleted_count} snapshots ({total_size} bytes)"),
        })
    }

    pub fn settings(&self) -> SnapshotSettings {
        self.settings.read().clone()
    }
    pub fn update_settings(
        &self,
        settings: SnapshotSettings,
    ) -> Result<(), ControllerError> {
        if settings.quality == 0 || settings.quality > 100 {
            return Err(ControllerError::InvalidInput(
                "quality must be within 1..=100".to_owned(),
            ));
        }
        if settings.capture_timeout_seconds <= 0.0 {
            return Err(ControllerError::InvalidInput(
                "capture timeout must be positive".to_owned(),
            ));
        }

        *self.settings.write() = settings;
        Ok(())
    }
}
impl fmt::Display for SnapshotManager {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "SnapshotManager")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::Config,
        gateway::{client::Client, mock::MockGateway},
        monitor::testing::ManualMonitor,
        snapshots::capture::testing::StubCapturer,
    };
    use std::sync::atomic::Ordering;

    fn manager_for(
        mock: &MockGateway,
        snapshots_path: PathBuf,
    ) -> (SnapshotManager, Arc<StubCapturer>) {
        let mut config = Config::default();
        config.gateway.api_port = mock.port();
        config.gateway.retry_attempts = 1;
        config.gateway.retry_delay = Duration::from_millis(1);
        config.snapshots.snapshots_path = snapshots_path;

        let config_store = Arc::new(ConfigStore::new(config.clone()).unwrap());
        let client = Arc::new(Client::new(&config.gateway).unwrap());
        let monitor = Arc::new(ManualMonitor::new());
        let path_manager = Arc::new(PathManager::new(
            client,
            config_store.clone(),
            monitor,
        ));
        let stream_manager = Arc::new(StreamManager::new(
            path_manager.clone(),
            config_store.clone(),
        ));
        let capturer = Arc::new(StubCapturer::new());

        let manager = SnapshotManager::new(
            path_manager,
            stream_manager,
            config_store,
            capturer.clone(),
        );
        (manager, capturer)
    }

    #[tokio::test]
    async fn direct_device_tier_when_no_gateway_path() {
        let mock = MockGateway::start().await;
        let temporary = tempfile::tempdir().unwrap();
        let (manager, capturer) = manager_for(&mock, temporary.path().to_path_buf());

        // no path stubbed: tier 1 probe sees 404
        let snapshot = manager
            .take_snapshot(&CameraId::from("camera1"))
            .await
            .unwrap();

        assert_eq!(snapshot.tier_used, SnapshotTier::DirectDevice);
        assert_eq!(capturer.rtsp_calls.load(Ordering::Relaxed), 0);
        assert!(snapshot.file_path.exists());
        let file_name = snapshot.file_path.file_name().unwrap().to_str().unwrap();
        assert!(file_name.starts_with("video1_"));
        assert!(file_name.ends_with(".jpg"));
        assert!(snapshot.size > 0);
    }

    #[tokio::test]
    async fn gateway_tier_preferred_when_path_ready() {
        let mock = MockGateway::start().await;
        let temporary = tempfile::tempdir().unwrap();
        let (manager, capturer) = manager_for(&mock, temporary.path().to_path_buf());

        mock.stub(
            "GET",
            "/v3/paths/get/camera0",
            200,
            r#"{"name": "camera0", "ready": true}"#,
        );

        let snapshot = manager
            .take_snapshot(&CameraId::from("camera0"))
            .await
            .unwrap();

        assert_eq!(snapshot.tier_used, SnapshotTier::GatewayPath);
        assert_eq!(capturer.device_calls.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn on_demand_tier_for_external_sources() {
        let mock = MockGateway::start().await;
        let temporary = tempfile::tempdir().unwrap();
        let (manager, _capturer) = manager_for(&mock, temporary.path().to_path_buf());

        let external = CameraId::from("external-stream");
        mock.stub("POST", "/v3/config/paths/add/external-stream", 200, "");
        mock.stub("DELETE", "/v3/config/paths/delete/external-stream", 200, "");

        let snapshot = manager.take_snapshot(&external).await.unwrap();
        assert_eq!(snapshot.tier_used, SnapshotTier::OnDemandPath);

        // the ephemeral path was created and released
        assert_eq!(
            mock.request_count("POST", "/v3/config/paths/add/external-stream"),
            1
        );
        assert_eq!(
            mock.request_count("DELETE", "/v3/config/paths/delete/external-stream"),
            1
        );
    }

    #[tokio::test]
    async fn all_tiers_failing_is_an_error() {
        let mock = MockGateway::start().await;
        let temporary = tempfile::tempdir().unwrap();
        let (manager, capturer) = manager_for(&mock, temporary.path().to_path_buf());

        capturer.fail_rtsp.store(true, Ordering::Relaxed);
        capturer.fail_device.store(true, Ordering::Relaxed);
        mock.stub("POST", "/v3/config/paths/add/camera0", 200, "");
        mock.stub("DELETE", "/v3/config/paths/delete/camera0", 200, "");

        let error = manager
            .take_snapshot(&CameraId::from("camera0"))
            .await
            .unwrap_err();
        assert!(format!("{error}").contains("all snapshot tiers failed"));
    }

    #[tokio::test]
    async fn empty_device_is_invalid_input() {
        let mock = MockGateway::start().await;
        let temporary = tempfile::tempdir().unwrap();
        let (manager, _capturer) = manager_for(&mock, temporary.path().to_path_buf());

        let error = manager
            .take_snapshot(&CameraId::from(" "))
            .await
            .unwrap_err();
        assert!(matches!(error, ControllerError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn registry_get_list_delete() {
        let mock = MockGateway::start().await;
        let temporary = tempfile::tempdir().unwrap();
        let (manager, _capturer) = manager_for(&mock, temporary.path().to_path_buf());

        let first = manager
            .take_snapshot(&CameraId::from("camera1"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = manager
            .take_snapshot(&CameraId::from("camera1"))
            .await
            .unwrap();

        assert_eq!(manager.get_snapshot(&first.id).unwrap().id, first.id);

        let listed = manager.list_snapshots();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, second.id); // newest first

        manager.delete_snapshot(&first.id).await.unwrap();
        assert!(!first.file_path.exists());
        assert!(matches!(
            manager.get_snapshot(&first.id),
            Err(ControllerError::NotFound { .. })
        ));
        let repeat_delete = manager.delete_snapshot(&first.id).await;
        assert!(matches!(
            repeat_delete,
            Err(ControllerError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn snapshot_file_info_not_found() {
        let mock = MockGateway::start().await;
        let temporary = tempfile::tempdir().unwrap();
        let (manager, _capturer) = manager_for(&mock, temporary.path().to_path_buf());

        let error = manager.snapshot_file_info("missing.jpg").await.unwrap_err();
        assert!(matches!(error, ControllerError::NotFound { .. }));
    }

    #[tokio::test]
    async fn settings_update_validates() {
        let mock = MockGateway::start().await;
        let temporary = tempfile::tempdir().unwrap();
        let (manager, _capturer) = manager_for(&mock, temporary.path().to_path_buf());

        let mut settings = manager.settings();
        assert_eq!(settings.quality, 85);

        settings.quality = 0;
        assert!(manager.update_settings(settings.clone()).is_err());

        settings.quality = 70;
        manager.update_settings(settings).unwrap();
        assert_eq!(manager.settings().quality, 70);
    }
}
