pub mod readiness;

use self::readiness::{ReadinessEvent, ReadinessWatcher};
use crate::{
    config::{Config, ConfigStore},
    connections::{ConnectionHealth, ConnectionMetrics, RtspConnectionManager},
    datatypes::camera_id::CameraId,
    discovery::{DiscoveryResult, ExternalStream, ExternalStreamDiscovery},
    errors::ControllerError,
    gateway::{
        client::Client,
        types::{GlobalConfPatch, RtspConn, RtspConnList, RtspSession, RtspSessionList},
    },
    health::{
        monitor::{HealthMonitor, HealthStatus},
        notifications::{HealthNotification, HealthNotificationManager},
    },
    metrics::{StorageInfo, SystemMetricsCollector},
    monitor::CameraMonitor,
    paths::{
        integration::PathIntegration,
        manager::{CameraListResponse, CameraStatusResponse, PathManager},
    },
    recordings::{
        manager::{CleanupResult, RecordingManager, RecordingsListResponse},
        session::{ActiveRecording, RecordingSession},
    },
    recovery::{PathErrorNotification, PathErrorRecovery, PathErrorSeverity},
    snapshots::{
        capture::Capturer,
        manager::{
            Snapshot, SnapshotManager, SnapshotFileInfo, SnapshotSettings,
            SnapshotsListResponse,
        },
    },
    streams::{StreamInfo, StreamManager},
    util::{
        async_flag,
        runnable::{Exited, Runnable},
    },
    version::VersionInfo,
};
use anyhow::Error;
use futures::{FutureExt, select};
use parking_lot::Mutex;
use serde::Serialize;
use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::task::JoinHandle;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ControllerOptions {
    pub enable_path_integration: bool,
}
impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            enable_path_integration: true,
        }
    }
}

#[derive(Serialize, Clone, Copy, PartialEq, Eq, Debug)]
pub struct ReadinessState {
    pub ready: bool,
    pub running: bool,
    pub monitor_ready: bool,
    pub health_healthy: bool,
}

struct RunningTasks {
    exit_flag_sender: async_flag::Sender,
    join_handles: Vec<(&'static str, JoinHandle<Exited>)>,
}

// Central coordinator: composes the subsystems, owns the running state and
// the supervised task set, and exposes the device-oriented façade. The
// running flag is the authority; every public operation checks it first.
pub struct Controller {
    config_store: Arc<ConfigStore>,
    client: Arc<Client>,
    monitor: Arc<dyn CameraMonitor>,

    path_manager: Arc<PathManager>,
    path_integration: Option<Arc<PathIntegration>>,
    stream_manager: Arc<StreamManager>,
    recording_manager: Arc<RecordingManager>,
    snapshot_manager: Arc<SnapshotManager>,
    connection_manager: Arc<RtspConnectionManager>,
    external_discovery: Option<Arc<ExternalStreamDiscovery>>,
    health_monitor: Arc<HealthMonitor>,
    notifications: Arc<HealthNotificationManager>,
    metrics_collector: Arc<SystemMetricsCollector>,
    path_error_recovery: Arc<PathErrorRecovery>,
    readiness: Arc<ReadinessWatcher>,

    running: Arc<AtomicBool>,
    tasks: Mutex<Option<RunningTasks>>,
}
impl Controller {
    pub fn new(
        config: Config,
        monitor: Arc<dyn CameraMonitor>,
        capturer: Arc<dyn Capturer>,
        options: ControllerOptions,
    ) -> Result<Arc<Self>, Error> {
        let health_config = config.health.clone();
        let discovery_enabled = config.discovery.enabled;

        let config_store = Arc::new(ConfigStore::new(config)?);
        let client = Arc::new(Client::new(&config_store.snapshot().gateway)?);

        let notifications = Arc::new(HealthNotificationManager::new(&health_config));
        let health_monitor = Arc::new(HealthMonitor::new(
            client.clone(),
            config_store.clone(),
            notifications.clone(),
        ));

        let path_manager = Arc::new(PathManager::new(
            client.clone(),
            config_store.clone(),
            monitor.clone(),
        ));
        let stream_manager = Arc::new(StreamManager::new(
            path_manager.clone(),
            config_store.clone(),
        ));
        let recording_manager = Arc::new(RecordingManager::new(
            path_manager.clone(),
            stream_manager.clone(),
            config_store.clone(),
        ));
        let snapshot_manager = Arc::new(SnapshotManager::new(
            path_manager.clone(),
            stream_manager.clone(),
            config_store.clone(),
            capturer,
        ));
        let connection_manager = Arc::new(RtspConnectionManager::new(client.clone()));

        let path_integration = options.enable_path_integration.then(|| {
            Arc::new(PathIntegration::new(
                path_manager.clone(),
                stream_manager.clone(),
                monitor.clone(),
            ))
        });
        let external_discovery =
            discovery_enabled.then(|| Arc::new(ExternalStreamDiscovery::new(config_store.clone())));

        let metrics_collector = Arc::new(SystemMetricsCollector::new(config_store.clone()));
        let path_error_recovery = Arc::new(PathErrorRecovery::new(
            path_manager.clone(),
            notifications.clone(),
            5,
            Duration::from_secs(1),
        ));

        let running = Arc::new(AtomicBool::new(false));

        let readiness = {
            let running = running.clone();
            let monitor = monitor.clone();
            let health_monitor = health_monitor.clone();
            Arc::new(ReadinessWatcher::new(
                config_store.snapshot().lifecycle.readiness_poll_interval,
                move || {
                    running.load(Ordering::Relaxed)
                        && monitor.is_ready()
                        && health_monitor.is_healthy()
                },
            ))
        };

        Ok(Arc::new(Self {
            config_store,
            client,
            monitor,

            path_manager,
            path_integration,
            stream_manager,
            recording_manager,
            snapshot_manager,
            connection_manager,
            external_discovery,
            health_monitor,
            notifications,
            metrics_collector,
            path_error_recovery,
            readiness,

            running,
            tasks: Mutex::new(None),
        }))
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
    fn ensure_running(&self) -> Result<(), ControllerError> {
        if !self.is_running() {
            return Err(ControllerError::NotRunning);
        }
        Ok(())
    }

    pub fn has_external_discovery(&self) -> bool {
        self.external_discovery.is_some()
    }
    pub fn has_path_integration(&self) -> bool {
        self.path_integration.is_some()
    }
    fn external_discovery(&self) -> Result<&Arc<ExternalStreamDiscovery>, ControllerError> {
        self.external_discovery
            .as_ref()
            .ok_or(ControllerError::NotConfigured("external_discovery"))
    }

    pub async fn start(&self) -> Result<(), ControllerError> {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ControllerError::AlreadyExists {
                kind: "controller",
                name: "running".to_owned(),
            });
        }

        let config = self.config_store.snapshot();

        // flag-gated: push recording defaults into the gateway global
        // configuration
        if config.gateway.override_gateway_paths {
            let patch = GlobalConfPatch {
                record_path: Some(format!(
                    "{}/%path_%Y-%m-%d_%H-%M-%S-%f",
                    config.recordings.recordings_path.display()
                )),
                record_format: Some(config.recordings.format.clone()),
            };
            if let Err(error) = self.client.global_config_patch(&patch).await {
                log::warn!("{}: gateway global config override failed: {:#}", self, error);
            }
        }

        let (exit_flag_sender, exit_flag) = async_flag::pair();
        let mut join_handles: Vec<(&'static str, JoinHandle<Exited>)> = Vec::new();

        // startup order: health monitor, camera monitor, path integration,
        // then the watchers
        {
            let health_monitor = self.health_monitor.clone();
            let exit_flag = exit_flag.clone();
            join_handles.push((
                "health-monitor",
                tokio::spawn(async move { Runnable::run(&*health_monitor, exit_flag).await }),
            ));
        }
        {
            let monitor = self.monitor.clone();
            let exit_flag = exit_flag.clone();
            join_handles.push((
                "camera-monitor",
                tokio::spawn(async move { monitor.as_runnable().run(exit_flag).await }),
            ));
        }
        if let Some(path_integration) = self.path_integration.as_ref() {
            let path_integration = path_integration.clone();
            let exit_flag = exit_flag.clone();
            join_handles.push((
                "path-integration",
                tokio::spawn(async move { Runnable::run(&*path_integration, exit_flag).await }),
            ));
        }
        {
            let readiness = self.readiness.clone();
            let exit_flag = exit_flag.clone();
            join_handles.push((
                "readiness-watcher",
                tokio::spawn(async move { Runnable::run(&*readiness, exit_flag).await }),
            ));
        }
        if let Some(external_discovery) = self.external_discovery.as_ref() {
            let external_discovery = external_discovery.clone();
            let exit_flag = exit_flag.clone();
            join_handles.push((
                "external-discovery",
                tokio::spawn(async move { Runnable::run(&*external_discovery, exit_flag).await }),
            ));
        }
        {
            let path_error_recovery = self.path_error_recovery.clone();
            let exit_flag = exit_flag.clone();
            join_handles.push((
                "path-error-recovery",
                tokio::spawn(async move { Runnable::run(&*path_error_recovery, exit_flag).await }),
            ));
        }
        {
            let supervised_tasks = join_handles.len() + 1;
            let config_store = self.config_store.clone();
            let client = self.client.clone();
            let metrics_collector = self.metrics_collector.clone();
            let notifications = self.notifications.clone();
            join_handles.push((
                "threshold-watcher",
                tokio::spawn(thresholds_run(
                    config_store,
                    client,
                    metrics_collector,
                    notifications,
                    supervised_tasks,
                    exit_flag,
                )),
            ));
        }

        *self.tasks.lock() = Some(RunningTasks {
            exit_flag_sender,
            join_handles,
        });

        log::info!("{}: started", self);
        Ok(())
    }

    // Shutdown: flip the running flag, stop recordings best-effort, signal
    // the exit flag, then join every supervised task within the budget.
    // Errors are collected and logged; stop still completes.
    pub async fn stop(&self) -> Result<(), ControllerError> {
        if self
            .running
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ControllerError::NotRunning);
        }

        let shutdown_timeout = self.config_store.snapshot().lifecycle.shutdown_timeout;

        for error in self.recording_manager.stop_all_recordings().await {
            log::warn!("{}: stop: recording stop failed: {}", self, error);
        }

        let tasks = self.tasks.lock().take();
        let tasks = match tasks {
            Some(tasks) => tasks,
            None => return Ok(()),
        };

        tasks.exit_flag_sender.signal();

        if let Some(external_discovery) = self.external_discovery.as_ref() {
            if let Err(error) = external_discovery.wait_idle(shutdown_timeout).await {
                log::warn!("{}: stop: {:#}", self, error);
            }
        }

        let deadline = tokio::time::Instant::now() + shutdown_timeout;
        for (name, join_handle) in tasks.join_handles {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match tokio::time::timeout(remaining, join_handle).await {
                Ok(Ok(Exited)) => {}
                Ok(Err(error)) => {
                    log::error!("{}: stop: {} panicked: {}", self, name, error);
                }
                Err(_elapsed) => {
                    log::error!(
                        "{}: stop: {} did not exit within the shutdown budget",
                        self,
                        name
                    );
                }
            }
        }

        log::info!("{}: stopped", self);
        Ok(())
    }

    // readiness
    //
    // Subscriptions are allowed before start; the event fires on the first
    // global-ready transition.
    pub fn is_ready(&self) -> bool {
        self.is_running() && self.monitor.is_ready() && self.health_monitor.is_healthy()
    }
    pub fn readiness_state(&self) -> ReadinessState {
        ReadinessState {
            ready: self.is_ready(),
            running: self.is_running(),
            monitor_ready: self.monitor.is_ready(),
            health_healthy: self.health_monitor.is_healthy(),
        }
    }
    pub fn subscribe_readiness(&self) -> tokio::sync::mpsc::Receiver<ReadinessEvent> {
        self.readiness.subscribe()
    }
    pub fn subscribe_notifications(
        &self,
    ) -> futures::channel::mpsc::UnboundedReceiver<HealthNotification> {
        self.notifications.subscribe()
    }

    // cameras
    pub async fn camera_list(&self) -> Result<CameraListResponse, ControllerError> {
        self.ensure_running()?;
        self.path_manager.camera_list().await
    }
    pub async fn camera_status(
        &self,
        camera: &CameraId,
    ) -> Result<CameraStatusResponse, ControllerError> {
        self.ensure_running()?;
        self.path_manager.camera_status(camera).await
    }

    // Gateway-mutating operations short-circuit while the breaker is open
    // instead of piling more traffic onto a failing gateway.
    fn ensure_gateway_available(&self) -> Result<(), ControllerError> {
        if self.health_monitor.is_circuit_open() {
            return Err(ControllerError::CircuitOpen);
        }
        Ok(())
    }

    fn validate_camera(
        &self,
        camera: &CameraId,
    ) -> Result<(), ControllerError> {
        if camera.as_str().trim().is_empty() {
            return Err(ControllerError::InvalidInput(
                "device must not be empty".to_owned(),
            ));
        }
        if camera.is_canonical() && !self.path_manager.validate_camera_device(camera) {
            return Err(ControllerError::NotFound {
                kind: "camera",
                name: camera.as_str().to_owned(),
            });
        }
        Ok(())
    }

    // streams
    pub async fn start_stream(
        &self,
        camera: &CameraId,
    ) -> Result<StreamInfo, ControllerError> {
        self.ensure_running()?;
        self.validate_camera(camera)?;
        self.ensure_gateway_available()?;

        let device_path = self.path_manager.device_path_for_camera(camera);
        self.stream_manager.start_stream(&device_path).await
    }
    pub async fn stop_stream(
        &self,
        camera: &CameraId,
    ) -> Result<(), ControllerError> {
        self.ensure_running()?;
        self.stream_manager.stop_stream(camera).await
    }

    // recordings
    pub async fn start_recording(
        &self,
        camera: &CameraId,
    ) -> Result<RecordingSession, ControllerError> {
        self.ensure_running()?;
        self.validate_camera(camera)?;
        self.ensure_gateway_available()?;
        self.recording_manager.start_recording(camera).await
    }
    pub async fn stop_recording(
        &self,
        camera: &CameraId,
    ) -> Result<RecordingSession, ControllerError> {
        self.ensure_running()?;
        self.recording_manager.stop_recording(camera).await
    }
    pub fn active_recordings(
        &self,
    ) -> Result<HashMap<CameraId, ActiveRecording>, ControllerError> {
        self.ensure_running()?;
        Ok(self.recording_manager.active_recordings())
    }
    pub fn recording_session(
        &self,
        session_id: &str,
    ) -> Result<RecordingSession, ControllerError> {
        self.ensure_running()?;
        self.recording_manager
            .session(session_id)
            .ok_or_else(|| ControllerError::NotFound {
                kind: "session",
                name: session_id.to_owned(),
            })
    }
    pub async fn recordings_list(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<RecordingsListResponse, ControllerError> {
        self.ensure_running()?;
        self.recording_manager.recordings_list(limit, offset).await
    }
    pub async fn cleanup_old_recordings(
        &self,
        max_age: Duration,
        max_count: usize,
    ) -> Result<CleanupResult, ControllerError> {
        self.ensure_running()?;
        self.recording_manager
            .cleanup_old_recordings(max_age, max_count)
            .await
    }
    pub async fn rotate_recording_file(
        &self,
        session_id: &str,
    ) -> Result<(), ControllerError> {
        self.ensure_running()?;
        self.ensure_gateway_available()?;
        self.recording_manager
            .rotate_recording_file(session_id)
            .await
    }

    // snapshots
    pub async fn take_snapshot(
        &self,
        camera: &CameraId,
    ) -> Result<Snapshot, ControllerError> {
        self.ensure_running()?;
        self.validate_camera(camera)?;
        self.snapshot_manager.take_snapshot(camera).await
    }
    pub fn get_snapshot(
        &self,
        snapshot_id: &str,
    ) -> Result<Snapshot, ControllerError> {
        self.ensure_running()?;
        self.snapshot_manager.get_snapshot(snapshot_id)
    }
    pub fn list_snapshots(&self) -> Result<Vec<Snapshot>, ControllerError> {
        self.ensure_running()?;
        Ok(self.snapshot_manager.list_snapshots())
    }
    pub async fn delete_snapshot(
        &self,
        snapshot_id: &str,
    ) -> Result<(), ControllerError> {
        self.ensure_running()?;
        self.snapshot_manager.delete_snapshot(snapshot_id).await
    }
    pub async fn snapshots_list(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<SnapshotsListResponse, ControllerError> {
        self.ensure_running()?;
        self.snapshot_manager.snapshots_list(limit, offset).await
    }
    pub async fn snapshot_file_info(
        &self,
        file_name: &str,
    ) -> Result<SnapshotFileInfo, ControllerError> {
        self.ensure_running()?;
        self.snapshot_manager.snapshot_file_info(file_name).await
    }
    pub async fn cleanup_old_snapshots(
        &self,
        max_age: Duration,
        max_count: usize,
    ) -> Result<CleanupResult, ControllerError> {
        self.ensure_running()?;
        self.snapshot_manager
            .cleanup_old_snapshots(max_age, max_count)
            .await
    }
    pub fn snapshot_settings(&self) -> Result<SnapshotSettings, ControllerError> {
        self.ensure_running()?;
        Ok(self.snapshot_manager.settings())
    }
    pub fn update_snapshot_settings(
        &self,
        settings: SnapshotSettings,
    ) -> Result<(), ControllerError> {
        self.ensure_running()?;
        self.snapshot_manager.update_settings(settings)
    }

    // external discovery
    pub async fn discover_external_streams(
        &self,
    ) -> Result<DiscoveryResult, ControllerError> {
        self.ensure_running()?;
        let discovery = self.external_discovery()?;

        let exit_flag = {
            let tasks = self.tasks.lock();
            match tasks.as_ref() {
                Some(tasks) => tasks.exit_flag_sender.receiver(),
                None => async_flag::pair().1,
            }
        };

        discovery.discover(exit_flag).await
    }
    pub fn external_streams(&self) -> Result<Vec<ExternalStream>, ControllerError> {
        self.ensure_running()?;
        Ok(self.external_discovery()?.streams())
    }
    pub fn get_external_stream(
        &self,
        url: &str,
    ) -> Result<ExternalStream, ControllerError> {
        self.ensure_running()?;
        self.external_discovery()?
            .get_stream(url)
            .ok_or_else(|| ControllerError::NotFound {
                kind: "external stream",
                name: url.to_owned(),
            })
    }
    pub fn add_external_stream(
        &self,
        stream: ExternalStream,
    ) -> Result<(), ControllerError> {
        self.ensure_running()?;
        self.external_discovery()?.add_stream(stream)
    }
    pub fn remove_external_stream(
        &self,
        url: &str,
    ) -> Result<ExternalStream, ControllerError> {
        self.ensure_running()?;
        self.external_discovery()?.remove_stream(url)
    }

    // connections
    pub async fn list_rtsp_connections(
        &self,
        items_per_page: Option<usize>,
        page: Option<usize>,
    ) -> Result<RtspConnList, ControllerError> {
        self.ensure_running()?;
        self.connection_manager
            .list_connections(items_per_page, page)
            .await
    }
    pub async fn get_rtsp_connection(
        &self,
        id: &str,
    ) -> Result<RtspConn, ControllerError> {
        self.ensure_running()?;
        self.connection_manager.get_connection(id).await
    }
    pub async fn list_rtsp_sessions(
        &self,
        items_per_page: Option<usize>,
        page: Option<usize>,
    ) -> Result<RtspSessionList, ControllerError> {
        self.ensure_running()?;
        self.connection_manager
            .list_sessions(items_per_page, page)
            .await
    }
    pub async fn get_rtsp_session(
        &self,
        id: &str,
    ) -> Result<RtspSession, ControllerError> {
        self.ensure_running()?;
        self.connection_manager.get_session(id).await
    }
    pub async fn kick_rtsp_session(
        &self,
        id: &str,
    ) -> Result<(), ControllerError> {
        self.ensure_running()?;
        self.ensure_gateway_available()?;
        self.connection_manager.kick_session(id).await
    }
    pub async fn connection_health(&self) -> Result<ConnectionHealth, ControllerError> {
        self.ensure_running()?;
        self.connection_manager.health().await
    }
    pub async fn connection_metrics(&self) -> Result<ConnectionMetrics, ControllerError> {
        self.ensure_running()?;
        self.connection_manager.metrics().await
    }

    // health, storage, configuration
    pub fn health_status(&self) -> Result<HealthStatus, ControllerError> {
        self.ensure_running()?;
        Ok(self.health_monitor.status())
    }
    pub fn health_metrics(
        &self,
    ) -> Result<HashMap<String, serde_json::Value>, ControllerError> {
        self.ensure_running()?;
        Ok(self.health_monitor.metrics())
    }
    pub async fn storage_info(&self) -> Result<StorageInfo, ControllerError> {
        self.ensure_running()?;
        Ok(self.metrics_collector.storage_info().await)
    }
    pub fn update_config(
        &self,
        config: Config,
    ) -> Result<(), ControllerError> {
        self.ensure_running()?;
        self.config_store
            .update(config)
            .map_err(|error| ControllerError::ConfigInvalid(error.to_string()))
    }
    pub fn version(&self) -> VersionInfo {
        VersionInfo::collect()
    }

    pub fn report_path_error(
        &self,
        path: &str,
        severity: PathErrorSeverity,
        message: &str,
    ) -> Result<(), ControllerError> {
        self.ensure_running()?;

        let mut sender = self.path_error_recovery.sender();
        if let Err(error) = sender.try_send(PathErrorNotification {
            path: path.to_owned(),
            severity,
            message: message.to_owned(),
        }) {
            log::warn!("{}: path error channel saturated: {}", self, error);
        }
        Ok(())
    }
    pub fn is_path_disabled(
        &self,
        path: &str,
    ) -> bool {
        self.path_error_recovery.is_path_disabled(path)
    }
}
impl fmt::Display for Controller {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "Controller")
    }
}

// Periodic storage/performance threshold evaluation; emissions are debounced
// by the notification manager.
async fn thresholds_run(
    config_store: Arc<ConfigStore>,
    client: Arc<Client>,
    metrics_collector: Arc<SystemMetricsCollector>,
    notifications: Arc<HealthNotificationManager>,
    supervised_tasks: usize,
    mut exit_flag: async_flag::Receiver,
) -> Exited {
    loop {
        let health_config = config_store.snapshot().health;

        let storage = metrics_collector.storage_info().await;
        notifications.check_storage_thresholds(&storage, &health_config);

        let client_metrics = client.metrics();
        let performance = metrics_collector.performance(
            client_metrics.requests_total,
            client_metrics.errors_total,
            client_metrics.average_response_time,
            0,
            supervised_tasks,
        );
        notifications.check_performance_thresholds(&performance, &health_config);

        select! {
            () = tokio::time::sleep(health_config.check_interval).fuse() => {},
            () = exit_flag => break,
        }
    }

    Exited
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        datatypes::device_path::DevicePath,
        gateway::mock::MockGateway,
        monitor::testing::ManualMonitor,
        recordings::session::SessionStatus,
        snapshots::capture::testing::StubCapturer,
    };

    const PATHS_EMPTY: &str = r#"{"itemCount": 0, "pageCount": 0, "items": []}"#;

    struct Fixture {
        controller: Arc<Controller>,
        monitor: Arc<ManualMonitor>,
        mock: MockGateway,
        _temporary: tempfile::TempDir,
    }

    async fn fixture(discovery_enabled: bool) -> Fixture {
        let mock = MockGateway::start().await;
        let temporary = tempfile::tempdir().unwrap();

        let mut config = Config::default();
        config.gateway.api_port = mock.port();
        config.gateway.retry_attempts = 1;
        config.gateway.retry_delay = Duration::from_millis(1);
        config.recordings.recordings_path = temporary.path().join("recordings");
        config.snapshots.snapshots_path = temporary.path().join("snapshots");
        config.health.check_interval = Duration::from_millis(20);
        config.lifecycle.readiness_poll_interval = Duration::from_millis(10);
        config.lifecycle.shutdown_timeout = Duration::from_secs(2);
        config.discovery.enabled = discovery_enabled;

        let monitor = Arc::new(ManualMonitor::new());
        let capturer = Arc::new(StubCapturer::new());

        let controller = Controller::new(
            config,
            monitor.clone(),
            capturer,
            ControllerOptions::default(),
        )
        .unwrap();

        Fixture {
            controller,
            monitor,
            mock,
            _temporary: temporary,
        }
    }

    #[tokio::test]
    async fn operations_require_running_state() {
        let fixture = fixture(false).await;
        let controller = &fixture.controller;

        assert!(matches!(
            controller.camera_list().await,
            Err(ControllerError::NotRunning)
        ));
        assert!(matches!(
            controller.start_recording(&CameraId::from("camera0")).await,
            Err(ControllerError::NotRunning)
        ));
        assert!(matches!(
            controller.take_snapshot(&CameraId::from("camera0")).await,
            Err(ControllerError::NotRunning)
        ));
        assert!(matches!(
            controller.health_status(),
            Err(ControllerError::NotRunning)
        ));
        assert!(matches!(
            controller.stop().await,
            Err(ControllerError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn start_stop_lifecycle() {
        let fixture = fixture(false).await;
        let controller = &fixture.controller;
        fixture.mock.stub("GET", "/v3/paths/list", 200, PATHS_EMPTY);

        controller.start().await.unwrap();
        assert!(controller.is_running());

        // double start is rejected
        assert!(matches!(
            controller.start().await,
            Err(ControllerError::AlreadyExists { .. })
        ));

        controller.stop().await.unwrap();
        assert!(!controller.is_running());

        // after stop, operations gate again and a second stop errors
        assert!(matches!(
            controller.camera_list().await,
            Err(ControllerError::NotRunning)
        ));
        assert!(matches!(
            controller.stop().await,
            Err(ControllerError::NotRunning)
        ));
    }

    #[tokio::test]
    async fn happy_path_recording_scenario() {
        let fixture = fixture(false).await;
        let controller = &fixture.controller;
        let mock = &fixture.mock;

        mock.stub("GET", "/v3/paths/list", 200, PATHS_EMPTY);
        mock.stub("POST", "/v3/config/paths/add/camera0", 200, "");
        mock.stub("PATCH", "/v3/config/paths/patch/camera0", 200, "");
        mock.stub("DELETE", "/v3/config/paths/delete/camera0", 200, "");

        controller.start().await.unwrap();
        fixture.monitor.attach(DevicePath::from("/dev/video0"));
        fixture.monitor.set_ready(true);

        let camera = CameraId::from("camera0");
        let session = controller.start_recording(&camera).await.unwrap();
        assert_eq!(session.device, camera);
        assert_eq!(session.status, SessionStatus::Recording);

        let active = controller.active_recordings().unwrap();
        assert!(active.contains_key(&camera));

        tokio::time::sleep(Duration::from_millis(10)).await;

        let stopped = controller.stop_recording(&camera).await.unwrap();
        assert!(stopped.duration_seconds > 0.0);
        assert!(controller.active_recordings().unwrap().is_empty());

        controller.stop().await.unwrap();
    }

    #[tokio::test]
    async fn unknown_canonical_camera_is_not_found() {
        let fixture = fixture(false).await;
        let controller = &fixture.controller;
        fixture.mock.stub("GET", "/v3/paths/list", 200, PATHS_EMPTY);

        controller.start().await.unwrap();

        let error = controller
            .start_recording(&CameraId::from("camera7"))
            .await
            .unwrap_err();
        assert!(matches!(
            error,
            ControllerError::NotFound { kind: "camera", .. }
        ));

        controller.stop().await.unwrap();
    }

    #[tokio::test]
    async fn readiness_emits_once_per_transition() {
        let fixture = fixture(false).await;
        let controller = &fixture.controller;
        fixture.mock.stub("GET", "/v3/paths/list", 200, PATHS_EMPTY);

        // subscribe before start
        let mut events = controller.subscribe_readiness();
        assert!(!controller.is_ready());

        controller.start().await.unwrap();
        fixture.monitor.set_ready(true);

        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(event.ready);
        assert!(controller.is_ready());
        assert!(controller.readiness_state().health_healthy);

        // force an unready/ready cycle: exactly one more event
        fixture.monitor.set_ready(false);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!controller.is_ready());

        fixture.monitor.set_ready(true);
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(event.ready);
        assert!(events.try_recv().is_err());

        controller.stop().await.unwrap();
    }

    #[tokio::test]
    async fn discovery_not_configured_yields_structured_error() {
        let fixture = fixture(false).await;
        let controller = &fixture.controller;
        fixture.mock.stub("GET", "/v3/paths/list", 200, PATHS_EMPTY);

        controller.start().await.unwrap();
        assert!(!controller.has_external_discovery());

        assert!(matches!(
            controller.discover_external_streams().await,
            Err(ControllerError::NotConfigured("external_discovery"))
        ));
        assert!(matches!(
            controller.external_streams(),
            Err(ControllerError::NotConfigured("external_discovery"))
        ));

        controller.stop().await.unwrap();
    }

    #[tokio::test]
    async fn open_circuit_short_circuits_gateway_mutations() {
        let fixture = fixture(false).await;
        let controller = &fixture.controller;

        // every probe fails; the breaker opens after the failure threshold
        fixture
            .mock
            .stub("GET", "/v3/paths/list", 500, r#"{"error": "boom"}"#);

        controller.start().await.unwrap();
        fixture.monitor.attach(DevicePath::from("/dev/video0"));

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while !controller.health_monitor.is_circuit_open() {
            assert!(tokio::time::Instant::now() < deadline, "breaker never opened");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let error = controller
            .start_recording(&CameraId::from("camera0"))
            .await
            .unwrap_err();
        assert!(matches!(error, ControllerError::CircuitOpen));

        controller.stop().await.unwrap();
    }

    #[tokio::test]
    async fn snapshot_through_facade() {
        let fixture = fixture(false).await;
        let controller = &fixture.controller;
        fixture.mock.stub("GET", "/v3/paths/list", 200, PATHS_EMPTY);

        controller.start().await.unwrap();
        fixture.monitor.attach(DevicePath::from("/dev/video1"));

        let snapshot = controller
            .take_snapshot(&CameraId::from("camera1"))
            .await
            .unwrap();
        assert!(snapshot.file_path.exists());

        let fetched = controller.get_snapshot(&snapshot.id).unwrap();
        assert_eq!(fetched.id, snapshot.id);

        controller.stop().await.unwrap();
    }

    #[tokio::test]
    async fn version_is_populated() {
        let fixture = fixture(false).await;
        let version = fixture.controller.version();
        assert!(!version.version.is_empty());
    }

    #[tokio::test]
    async fn update_config_validates() {
        let fixture = fixture(false).await;
        let controller = &fixture.controller;
        fixture.mock.stub("GET", "/v3/paths/list", 200, PATHS_EMPTY);

        controller.start().await.unwrap();

        let mut config = controller.config_store.snapshot();
        config.health.failure_threshold = 0;
        assert!(matches!(
            controller.update_config(config),
            Err(ControllerError::ConfigInvalid(_))
        ));

        controller.stop().await.unwrap();
    }
}
