use super::session::{ActiveRecording, ContinuityState, RecordingSession, SessionStatus};
use crate::{
    config::ConfigStore,
    datatypes::{camera_id::CameraId, device_path::DevicePath},
    errors::ControllerError,
    gateway::types::{PathConf, wire_duration},
    paths::manager::PathManager,
    streams::{StreamManager, StreamUseCase},
    util::fs::{FileEntry, list_files_by_mtime_desc},
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::{
    collections::HashMap,
    fmt,
    sync::Arc,
    time::{Duration, SystemTime},
};
use tokio::fs;

#[derive(Serialize, Clone, PartialEq, Debug)]
pub struct RecordingFileInfo {
    pub file_name: String,
    pub size: u64,
    pub modified_seconds_ago: u64,
}

#[derive(Serialize, Clone, PartialEq, Debug)]
pub struct RecordingsListResponse {
    pub files: Vec<RecordingFileInfo>,
    pub total: usize,
    pub limit: usize,
    pub offset: usize,
}

// Partial success is visible: the result reports what was removed even when
// individual deletions failed.
#[derive(Serialize, Clone, PartialEq, Debug)]
pub struct CleanupResult {
    pub deleted_count: usize,
    pub total_size: u64,
    pub message: String,
}

// Recording is driven by configuring the gateway path; rotation, segment
// naming and file writing stay on the gateway side. This manager owns the
// session state machine and the active-recording registry.
pub struct RecordingManager {
    path_manager: Arc<PathManager>,
    stream_manager: Arc<StreamManager>,
    config_store: Arc<ConfigStore>,

    sessions: Mutex<HashMap<String, RecordingSession>>,
    active: Mutex<HashMap<DevicePath, ActiveRecording>>,
}
impl RecordingManager {
    pub fn new(
        path_manager: Arc<PathManager>,
        stream_manager: Arc<StreamManager>,
        config_store: Arc<ConfigStore>,
    ) -> Self {
        Self {
            path_manager,
            stream_manager,
            config_store,

            sessions: Mutex::new(HashMap::new()),
            active: Mutex::new(HashMap::new()),
        }
    }

    fn record_conf(
        &self,
        camera: &CameraId,
        enabled: bool,
    ) -> PathConf {
        let recordings = self.config_store.snapshot().recordings;

        let mut conf = PathConf {
            record: Some(enabled),
            ..Default::default()
        };
        if enabled {
            conf.record_format = Some(recordings.format.clone());
            conf.record_path = Some(format!(
                "{}/{}_%Y-%m-%d_%H-%M-%S-%f",
                recordings.recordings_path.display(),
                camera,
            ));
            conf.record_part_duration = Some(wire_duration(recordings.part_duration));
            conf.record_segment_duration = Some(wire_duration(recordings.segment_duration));
            if !recordings.delete_after.is_zero() {
                conf.record_delete_after = Some(wire_duration(recordings.delete_after));
            }
        }
        conf
    }

    // A second start on a device with an active session is an error, not an
    // idempotent no-op.
    pub async fn start_recording(
        &self,
        camera: &CameraId,
    ) -> Result<RecordingSession, ControllerError> {
        if camera.as_str().trim().is_empty() {
            return Err(ControllerError::InvalidInput(
                "device must not be empty".to_owned(),
            ));
        }

        let device_path = self.path_manager.device_path_for_camera(camera);
        let stream_name = self
            .stream_manager
            .generate_stream_name(camera, StreamUseCase::Recording);

        let start_time = Utc::now();
        let start_nanos = start_time.timestamp_nanos_opt().unwrap_or_default();
        let session_id = format!("rec_{}_{}", device_path, start_nanos);
        let continuity_id = format!("{}_{}", camera, start_time.format("%Y%m%d%H%M%S%f"));

        let recordings_config = self.config_store.snapshot().recordings;
        let session = RecordingSession {
            id: session_id.clone(),
            device: camera.clone(),
            device_path: device_path.clone(),
            path: stream_name.clone(),
            status: SessionStatus::Starting,
            state: ContinuityState::Recording,
            continuity_id,
            segments: Vec::new(),
            start_time,
            end_time: None,
            duration_seconds: 0.0,
            file_size: 0,
            file_path: recordings_config.recordings_path.clone(),
            format: recordings_config.format.clone(),
        };

        // reserve the device slot before touching the gateway, so two
        // concurrent starts cannot both proceed
        {
            let mut active = self.active.lock();
            if active.contains_key(&device_path) {
                return Err(ControllerError::AlreadyExists {
                    kind: "recording",
                    name: camera.as_str().to_owned(),
                });
            }
            active.insert(
                device_path.clone(),
                ActiveRecording {
                    session_id: session_id.clone(),
                    start_time,
                    stream_name: stream_name.clone(),
                    status: SessionStatus::Starting,
                },
            );
        }
        self.sessions.lock().insert(session_id.clone(), session);

        let result: Result<(), ControllerError> = async {
            // the path must exist before recording can be enabled on it
            let on_demand_conf = self.stream_manager.on_demand_conf(&device_path, &stream_name);
            self.path_manager
                .create_path(&stream_name, &on_demand_conf)
                .await?;

            self.path_manager
                .patch_path(&stream_name, &self.record_conf(camera, true))
                .await?;

            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                let session = {
                    let mut sessions = self.sessions.lock();
                    let session = sessions.get_mut(&session_id).unwrap();
                    session.transition(SessionStatus::Recording);
                    session.clone()
                };
                if let Some(active) = self.active.lock().get_mut(&device_path) {
                    active.status = SessionStatus::Recording;
                }

                log::info!("{}: recording started: {}", self, session_id);
                Ok(session)
            }
            Err(error) => {
                // release the reservation; the session record goes with it
                self.active.lock().remove(&device_path);
                if let Some(mut session) = self.sessions.lock().remove(&session_id) {
                    session.transition(SessionStatus::Error);
                }

                log::error!("{}: recording start failed: {}: {}", self, session_id, error);
                Err(error)
            }
        }
    }

    pub async fn stop_recording(
        &self,
        camera: &CameraId,
    ) -> Result<RecordingSession, ControllerError> {
        if camera.as_str().trim().is_empty() {
            return Err(ControllerError::InvalidInput(
                "device must not be empty".to_owned(),
            ));
        }

        let device_path = self.path_manager.device_path_for_camera(camera);

        let active = match self.active.lock().get(&device_path) {
            Some(active) => active.clone(),
            None => {
                return Err(ControllerError::NotFound {
                    kind: "recording",
                    name: camera.as_str().to_owned(),
                });
            }
        };

        {
            let mut sessions = self.sessions.lock();
            if let Some(session) = sessions.get_mut(&active.session_id) {
                session.transition(SessionStatus::Stopping);
            }
        }

        // a failed disable still stops the session locally; the recovery
        // supervisor reconciles gateway drift later
        if let Err(error) = self
            .path_manager
            .patch_path(&active.stream_name, &self.record_conf(camera, false))
            .await
        {
            log::error!(
                "{}: stop_recording: gateway disable failed for {}: {}",
                self,
                active.stream_name,
                error
            );
        }

        let (segments, file_size) = self.session_files(camera, active.start_time).await;

        let end_time = Utc::now();
        let mut session = {
            let mut sessions = self.sessions.lock();
            match sessions.remove(&active.session_id) {
                Some(session) => session,
                None => {
                    return Err(ControllerError::NotFound {
                        kind: "session",
                        name: active.session_id.clone(),
                    });
                }
            }
        };
        session.transition(SessionStatus::Stopped);
        session.end_time = Some(end_time);
        session.duration_seconds = (end_time - session.start_time)
            .to_std()
            .unwrap_or(Duration::ZERO)
            .as_secs_f64();
        session.segments = segments;
        session.file_size = file_size;

        self.active.lock().remove(&device_path);

        log::info!("{}: recording stopped: {}", self, session.id);
        Ok(session)
    }

    // Segments written by earlier sessions of the same camera share the
    // naming prefix, so only files modified within this session's window
    // are attributed to it.
    async fn session_files(
        &self,
        camera: &CameraId,
        started: DateTime<Utc>,
    ) -> (Vec<String>, u64) {
        let recordings_path = self.config_store.snapshot().recordings.recordings_path;
        let started = SystemTime::from(started);

        let entries = match list_files_by_mtime_desc(&recordings_path).await {
            Ok(entries) => entries,
            Err(error) => {
                log::warn!("{}: session_files: {:?}", self, error);
                return (Vec::new(), 0);
            }
        };

        let prefix = format!("{camera}_");
        let mut segments = Vec::new();
        let mut file_size: u64 = 0;
        for entry in entries {
            if entry.modified < started {
                continue;
            }

            let file_name = match entry.path.file_name().and_then(|name| name.to_str()) {
                Some(file_name) => file_name.to_owned(),
                None => continue,
            };
            if !file_name.starts_with(&prefix) {
                continue;
            }
            file_size += entry.size;
            segments.push(file_name);
        }
        segments.reverse(); // oldest first

        (segments, file_size)
    }

    pub fn active_recordings(&self) -> HashMap<CameraId, ActiveRecording> {
        self.active
            .lock()
            .iter()
            .map(|(device_path, active)| {
                (
                    self.path_manager.camera_for_device_path(device_path),
                    active.clone(),
                )
            })
            .collect()
    }
    pub fn session(
        &self,
        session_id: &str,
    ) -> Option<RecordingSession> {
        self.sessions.lock().get(session_id).cloned()
    }

    pub async fn recordings_list(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<RecordingsListResponse, ControllerError> {
        let recordings_path = self.config_store.snapshot().recordings.recordings_path;

        let entries = list_files_by_mtime_desc(&recordings_path)
            .await
            .map_err(ControllerError::Internal)?;

        let total = entries.len();
        let now = SystemTime::now();
        let files = entries
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|entry| file_info(&entry, now))
            .collect();

        Ok(RecordingsListResponse {
            files,
            total,
            limit,
            offset,
        })
    }

    // Deletes oldest-first by mtime until both bounds hold. A zero bound
    // disables that bound.
    pub async fn cleanup_old_recordings(
        &self,
        max_age: Duration,
        max_count: usize,
    ) -> Result<CleanupResult, ControllerError> {
        let recordings = self.config_store.snapshot().recordings;
        if !recordings.retention_enabled {
            return Err(ControllerError::PolicyViolation(
                "recording retention is disabled".to_owned(),
            ));
        }

        let mut entries = list_files_by_mtime_desc(&recordings.recordings_path)
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
            message: format!("removed {deleted_count} recordings ({total_size} bytes)"),
        })
    }

    // Forces a segment boundary by toggling recording on the path.
    pub async fn rotate_recording_file(
        &self,
        session_id: &str,
    ) -> Result<(), ControllerError> {
        let session = match self.session(session_id) {
            Some(session) => session,
            None => {
                return Err(ControllerError::NotFound {
                    kind: "session",
                    name: session_id.to_owned(),
                });
            }
        };

        self.path_manager
            .patch_path(&session.path, &self.record_conf(&session.device, false))
            .await?;
        self.path_manager
            .patch_path(&session.path, &self.record_conf(&session.device, true))
            .await?;

        log::info!("{}: rotated recording for {}", self, session_id);
        Ok(())
    }

    pub async fn stop_all_recordings(&self) -> Vec<ControllerError> {
        let cameras = self
            .active_recordings()
            .into_keys()
            .collect::<Vec<CameraId>>();

        let mut errors = Vec::new();
        for camera in cameras {
            if let Err(error) = self.stop_recording(&camera).await {
                errors.push(error);
            }
        }
        errors
    }
}
impl fmt::Display for RecordingManager {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "RecordingManager")
    }
}

fn file_info(
    entry: &FileEntry,
    now: SystemTime,
) -> RecordingFileInfo {
    RecordingFileInfo {
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
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::Config, gateway::client::Client, gateway::mock::MockGateway,
        monitor::testing::ManualMonitor,
    };

    fn manager_for(
        mock: &MockGateway,
        recordings_path: std::path::PathBuf,
    ) -> (RecordingManager, Arc<ConfigStore>) {
        let mut config = Config::default();
        config.gateway.api_port = mock.port();
        config.gateway.retry_attempts = 1;
        config.gateway.retry_delay = Duration::from_millis(1);
        config.recordings.recordings_path = recordings_path;

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

        let manager = RecordingManager::new(path_manager, stream_manager, config_store.clone());
        (manager, config_store)
    }

    fn stub_happy_gateway(mock: &MockGateway) {
        mock.stub("POST", "/v3/config/paths/add/camera0", 200, "");
        mock.stub("PATCH", "/v3/config/paths/patch/camera0", 200, "");
    }

    #[tokio::test]
    async fn start_stop_lifecycle() {
        let mock = MockGateway::start().await;
        let temporary = tempfile::tempdir().unwrap();
        let (manager, _config_store) = manager_for(&mock, temporary.path().to_path_buf());
        stub_happy_gateway(&mock);

        let camera = CameraId::from("camera0");

        let session = manager.start_recording(&camera).await.unwrap();
        assert_eq!(session.status, SessionStatus::Recording);
        assert_eq!(session.device, camera);
        assert_eq!(session.device_path, DevicePath::from("/dev/video0"));

        let active = manager.active_recordings();
        assert!(active.contains_key(&camera));
        assert_eq!(active[&camera].status, SessionStatus::Recording);

        tokio::time::sleep(Duration::from_millis(10)).await;

        let stopped = manager.stop_recording(&camera).await.unwrap();
        assert_eq!(stopped.status, SessionStatus::Stopped);
        assert!(stopped.duration_seconds > 0.0);
        assert!(stopped.end_time.is_some());

        assert!(manager.active_recordings().is_empty());

        // the enable-record patch carries the recording knobs
        let recorded = mock.requests();
        let enable_patch = recorded
            .iter()
            .find(|request| {
                request.path == "/v3/config/paths/patch/camera0"
                    && request.body.contains("\"record\":true")
            })
            .unwrap();
        let body: serde_json::Value = serde_json::from_str(&enable_patch.body).unwrap();
        assert_eq!(body["recordFormat"], "fmp4");
        assert!(body["recordPath"].as_str().unwrap().contains("camera0_"));
    }

    #[tokio::test]
    async fn second_start_on_same_device_is_rejected() {
        let mock = MockGateway::start().await;
        let temporary = tempfile::tempdir().unwrap();
        let (manager, _config_store) = manager_for(&mock, temporary.path().to_path_buf());
        stub_happy_gateway(&mock);

        let camera = CameraId::from("camera0");
        manager.start_recording(&camera).await.unwrap();

        let error = manager.start_recording(&camera).await.unwrap_err();
        assert!(matches!(
            error,
            ControllerError::AlreadyExists {
                kind: "recording",
                ..
            }
        ));

        // the original session is untouched
        assert_eq!(manager.active_recordings().len(), 1);
    }

    #[tokio::test]
    async fn restart_yields_distinct_session_ids_and_no_active_leftover() {
        let mock = MockGateway::start().await;
        let temporary = tempfile::tempdir().unwrap();
        let (manager, _config_store) = manager_for(&mock, temporary.path().to_path_buf());
        stub_happy_gateway(&mock);

        let camera = CameraId::from("camera0");

        let first = manager.start_recording(&camera).await.unwrap();
        manager.stop_recording(&camera).await.unwrap();
        let second = manager.start_recording(&camera).await.unwrap();
        manager.stop_recording(&camera).await.unwrap();

        assert_ne!(first.id, second.id);
        assert!(manager.active_recordings().is_empty());
    }

    #[tokio::test]
    async fn stop_attributes_only_this_sessions_segments() {
        let mock = MockGateway::start().await;
        let temporary = tempfile::tempdir().unwrap();
        let (manager, _config_store) = manager_for(&mock, temporary.path().to_path_buf());
        stub_happy_gateway(&mock);

        let camera = CameraId::from("camera0");

        manager.start_recording(&camera).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        fs::write(temporary.path().join("camera0_first.mp4"), b"aaaa")
            .await
            .unwrap();
        let first = manager.stop_recording(&camera).await.unwrap();
        assert_eq!(first.segments, vec!["camera0_first.mp4"]);
        assert_eq!(first.file_size, 4);

        tokio::time::sleep(Duration::from_millis(20)).await;

        manager.start_recording(&camera).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        fs::write(temporary.path().join("camera0_second.mp4"), b"bbbbbb")
            .await
            .unwrap();
        let second = manager.stop_recording(&camera).await.unwrap();

        // the first session's file keeps its old mtime and stays out
        assert_eq!(second.segments, vec!["camera0_second.mp4"]);
        assert_eq!(second.file_size, 6);
    }

    #[tokio::test]
    async fn start_failure_releases_reservation() {
        let mock = MockGateway::start().await;
        let temporary = tempfile::tempdir().unwrap();
        let (manager, _config_store) = manager_for(&mock, temporary.path().to_path_buf());

        mock.stub("POST", "/v3/config/paths/add/camera0", 200, "");
        mock.stub(
            "PATCH",
            "/v3/config/paths/patch/camera0",
            400,
            r#"{"error": "bad path configuration"}"#,
        );

        let camera = CameraId::from("camera0");
        assert!(manager.start_recording(&camera).await.is_err());
        assert!(manager.active_recordings().is_empty());

        // the device is free for another attempt
        stub_happy_gateway(&mock);
        manager.start_recording(&camera).await.unwrap();
    }

    #[tokio::test]
    async fn stop_without_active_recording_is_not_found() {
        let mock = MockGateway::start().await;
        let temporary = tempfile::tempdir().unwrap();
        let (manager, _config_store) = manager_for(&mock, temporary.path().to_path_buf());

        let error = manager
            .stop_recording(&CameraId::from("camera0"))
            .await
            .unwrap_err();
        assert!(matches!(
            error,
            ControllerError::NotFound {
                kind: "recording",
                ..
            }
        ));
    }

    #[tokio::test]
    async fn empty_device_is_invalid_input() {
        let mock = MockGateway::start().await;
        let temporary = tempfile::tempdir().unwrap();
        let (manager, _config_store) = manager_for(&mock, temporary.path().to_path_buf());

        let error = manager
            .start_recording(&CameraId::from("  "))
            .await
            .unwrap_err();
        assert!(matches!(error, ControllerError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn recordings_list_paginates_newest_first() {
        let mock = MockGateway::start().await;
        let temporary = tempfile::tempdir().unwrap();
        let (manager, _config_store) = manager_for(&mock, temporary.path().to_path_buf());

        for name in ["camera0_a.mp4", "camera0_b.mp4", "camera0_c.mp4"] {
            fs::write(temporary.path().join(name), b"data").await.unwrap();
            tokio::time::sleep(Duration::from_millis(15)).await;
        }

        let page = manager.recordings_list(2, 0).await.unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(page.files.len(), 2);
        assert_eq!(page.files[0].file_name, "camera0_c.mp4");

        let rest = manager.recordings_list(2, 2).await.unwrap();
        assert_eq!(rest.files.len(), 1);
        assert_eq!(rest.files[0].file_name, "camera0_a.mp4");
    }

    #[tokio::test]
    async fn cleanup_honors_count_bound_oldest_first() {
        let mock = MockGateway::start().await;
        let temporary = tempfile::tempdir().unwrap();
        let (manager, _config_store) = manager_for(&mock, temporary.path().to_path_buf());

        for name in ["one.mp4", "two.mp4", "three.mp4"] {
            fs::write(temporary.path().join(name), b"data").await.unwrap();
            tokio::time::sleep(Duration::from_millis(15)).await;
        }

        let result = manager
            .cleanup_old_recordings(Duration::ZERO, 1)
            .await
            .unwrap();
        assert_eq!(result.deleted_count, 2);
        assert_eq!(result.total_size, 8);

        let remaining = list_files_by_mtime_desc(temporary.path()).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].path.file_name().unwrap(), "three.mp4");
    }

    #[tokio::test]
    async fn cleanup_with_retention_disabled_is_a_policy_violation() {
        let mock = MockGateway::start().await;
        let temporary = tempfile::tempdir().unwrap();
        let (manager, _config_store) = manager_for(&mock, temporary.path().to_path_buf());

        fs::write(temporary.path().join("keep.mp4"), b"data")
            .await
            .unwrap();

        let mut config = _config_store.snapshot();
        config.recordings.retention_enabled = false;
        _config_store.update(config).unwrap();

        let error = manager
            .cleanup_old_recordings(Duration::ZERO, 0)
            .await
            .unwrap_err();
        assert!(matches!(error, ControllerError::PolicyViolation(_)));

        // no side effects
        let remaining = list_files_by_mtime_desc(temporary.path()).await.unwrap();
        assert_eq!(remaining.len(), 1);
    }

    #[tokio::test]
    async fn rotate_toggles_record_flag() {
        let mock = MockGateway::start().await;
        let temporary = tempfile::tempdir().unwrap();
        let (manager, _config_store) = manager_for(&mock, temporary.path().to_path_buf());
        stub_happy_gateway(&mock);

        let camera = CameraId::from("camera0");
        let session = manager.start_recording(&camera).await.unwrap();

        manager.rotate_recording_file(&session.id).await.unwrap();

        let patches = mock
            .requests()
            .into_iter()
            .filter(|request| request.path == "/v3/config/paths/patch/camera0")
            .collect::<Vec<_>>();
        // start enable + rotate disable + rotate enable
        assert_eq!(patches.len(), 3);
        assert!(patches[1].body.contains("\"record\":false"));
        assert!(patches[2].body.contains("\"record\":true"));
    }
}
