use crate::{
    datatypes::{camera_id::CameraId, device_path::DevicePath},
    health::notifications::{HealthNotificationManager, NotificationComponent, NotificationSeverity},
    paths::manager::PathManager,
    streams::StreamManager,
    util::{
        async_flag,
        runnable::{Exited, Runnable},
    },
};
use anyhow::Error;
use async_trait::async_trait;
use atomic_refcell::AtomicRefCell;
use futures::{
    FutureExt, StreamExt,
    channel::mpsc,
    select,
    stream::FuturesUnordered,
};
use parking_lot::Mutex;
use std::{collections::HashSet, fmt, future::Future, sync::Arc, time::Duration};

const NOTIFICATION_CHANNEL_CAPACITY: usize = 64;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PathErrorSeverity {
    Info,
    Warning,
    Critical,
}

#[derive(Clone, PartialEq, Debug)]
pub struct PathErrorNotification {
    pub path: String,
    pub severity: PathErrorSeverity,
    pub message: String,
}

#[derive(Clone, Debug)]
pub struct RecoveryContext {
    pub camera: CameraId,
    pub device_path: DevicePath,
}

#[async_trait]
pub trait RecoveryStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn recovery_delay(&self) -> Duration;
    fn can_recover(
        &self,
        error: &Error,
    ) -> bool;
    async fn recover(
        &self,
        context: &RecoveryContext,
        error: &Error,
    ) -> Result<(), Error>;
}

// Runs the operation once; on a recoverable failure, lets the strategy
// repair state and retries exactly once.
pub async fn attempt_with_recovery<T, F, Fut>(
    strategy: &dyn RecoveryStrategy,
    context: &RecoveryContext,
    operation: F,
) -> Result<T, Error>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let error = match operation().await {
        Ok(value) => return Ok(value),
        Err(error) => error,
    };

    if !strategy.can_recover(&error) {
        return Err(error);
    }

    log::warn!(
        "recovery strategy {} engaging after: {:#}",
        strategy.name(),
        error
    );
    tokio::time::sleep(strategy.recovery_delay()).await;
    strategy.recover(context, &error).await?;

    operation().await
}

const RECORDING_RECOVERY_TRIGGERS: &[&str] = &[
    "path not found",
    "already exists",
    "404",
    "409",
    "keepalive",
    "RTSP",
    "path creation",
];

// Repairs recording failures whose root cause is path drift on the gateway:
// the path is recreated (idempotently), then the caller retries once.
pub struct RecordingRecovery {
    path_manager: Arc<PathManager>,
    stream_manager: Arc<StreamManager>,
}
impl RecordingRecovery {
    pub fn new(
        path_manager: Arc<PathManager>,
        stream_manager: Arc<StreamManager>,
    ) -> Self {
        Self {
            path_manager,
            stream_manager,
        }
    }
}
#[async_trait]
impl RecoveryStrategy for RecordingRecovery {
    fn name(&self) -> &'static str {
        "recording_recovery"
    }
    fn recovery_delay(&self) -> Duration {
        Duration::from_secs(1)
    }

    fn can_recover(
        &self,
        error: &Error,
    ) -> bool {
        let message = format!("{error:#}");
        RECORDING_RECOVERY_TRIGGERS
            .iter()
            .any(|trigger| message.contains(trigger))
    }

    async fn recover(
        &self,
        context: &RecoveryContext,
        _error: &Error,
    ) -> Result<(), Error> {
        let name = context.camera.as_str();
        let conf = self
            .stream_manager
            .on_demand_conf(&context.device_path, name);

        self.path_manager
            .create_path(name, &conf)
            .await
            .map_err(|error| anyhow::anyhow!("{error}"))?;

        Ok(())
    }
}

// Supervisor draining path-error notifications. Critical errors disable the
// path and raise an admin notification; warnings get bounded
// exponential-backoff monitoring that either confirms recovery or escalates;
// info is logged only.
pub struct PathErrorRecovery {
    path_manager: Arc<PathManager>,
    notifications: Arc<HealthNotificationManager>,

    sender: mpsc::Sender<PathErrorNotification>,
    receiver: AtomicRefCell<mpsc::Receiver<PathErrorNotification>>,

    disabled_paths: Mutex<HashSet<String>>,

    monitor_max_retries: usize,
    monitor_base_delay: Duration,
}
impl PathErrorRecovery {
    pub fn new(
        path_manager: Arc<PathManager>,
        notifications: Arc<HealthNotificationManager>,
        monitor_max_retries: usize,
        monitor_base_delay: Duration,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(NOTIFICATION_CHANNEL_CAPACITY);
        let receiver = AtomicRefCell::new(receiver);

        Self {
            path_manager,
            notifications,

            sender,
            receiver,

            disabled_paths: Mutex::new(HashSet::new()),

            monitor_max_retries,
            monitor_base_delay,
        }
    }

    pub fn sender(&self) -> mpsc::Sender<PathErrorNotification> {
        self.sender.clone()
    }

    pub fn is_path_disabled(
        &self,
        path: &str,
    ) -> bool {
        self.disabled_paths.lock().contains(path)
    }
    pub fn enable_path(
        &self,
        path: &str,
    ) {
        self.disabled_paths.lock().remove(path);
    }

    fn escalate_critical(
        &self,
        path: &str,
        message: &str,
    ) {
        self.disabled_paths.lock().insert(path.to_owned());

        self.notifications.notify(
            NotificationComponent::Health,
            NotificationSeverity::Critical,
            "path_error_critical",
            format!("path {path} disabled: {message}"),
            serde_json::json!({"path": path}),
        );
        log::error!("{}: path {} disabled: {}", self, path, message);
    }

    // Bounded backoff probe of the failing path. Returns the escalation
    // payload if the path never came back.
    async fn monitor_path(
        &self,
        notification: PathErrorNotification,
    ) -> Option<PathErrorNotification> {
        for attempt in 0..self.monitor_max_retries {
            let delay = self.monitor_base_delay * 2u32.pow(attempt as u32);
            tokio::time::sleep(delay).await;

            if self.path_manager.path_exists(&notification.path).await {
                log::info!(
                    "{}: path {} recovered after {} attempts",
                    self,
                    notification.path,
                    attempt + 1
                );
                return None;
            }
        }

        Some(notification)
    }

    async fn run(
        &self,
        mut exit_flag: async_flag::Receiver,
    ) -> Exited {
        let mut receiver = self.receiver.borrow_mut();
        let mut monitors = FuturesUnordered::new();

        loop {
            select! {
                notification = receiver.next() => {
                    let notification = match notification {
                        Some(notification) => notification,
                        None => break,
                    };

                    match notification.severity {
                        PathErrorSeverity::Info => {
                            log::info!(
                                "{}: path {}: {}",
                                self,
                                notification.path,
                                notification.message
                            );
                        }
                        PathErrorSeverity::Warning => {
                            monitors.push(self.monitor_path(notification));
                        }
                        PathErrorSeverity::Critical => {
                            self.escalate_critical(
                                &notification.path,
                                &notification.message,
                            );
                        }
                    }
                },
                escalation = monitors.select_next_some() => {
                    if let Some(notification) = escalation {
                        self.escalate_critical(
                            &notification.path,
                            &format!(
                                "did not recover after {} attempts: {}",
                                self.monitor_max_retries, notification.message
                            ),
                        );
                    }
                },
                () = exit_flag => break,
            }
        }

        Exited
    }
}
#[async_trait]
impl Runnable for PathErrorRecovery {
    async fn run(
        &self,
        exit_flag: async_flag::Receiver,
    ) -> Exited {
        self.run(exit_flag).await
    }
}
impl fmt::Display for PathErrorRecovery {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "PathErrorRecovery")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{Config, ConfigStore, HealthConfig},
        gateway::{client::Client, mock::MockGateway},
        monitor::testing::ManualMonitor,
    };
    use futures::SinkExt;

    struct Fixture {
        path_manager: Arc<PathManager>,
        stream_manager: Arc<StreamManager>,
        notifications: Arc<HealthNotificationManager>,
    }

    fn fixture_for(mock: &MockGateway) -> Fixture {
        let mut config = Config::default();
        config.gateway.api_port = mock.port();
        config.gateway.retry_attempts = 1;
        config.gateway.retry_delay = Duration::from_millis(1);
        config.health = HealthConfig {
            notification_debounce: Duration::from_millis(1),
            ..HealthConfig::default()
        };

        let config_store = Arc::new(ConfigStore::new(config.clone()).unwrap());
        let client = Arc::new(Client::new(&config.gateway).unwrap());
        let monitor = Arc::new(ManualMonitor::new());
        let path_manager = Arc::new(PathManager::new(
            client,
            config_store.clone(),
            monitor,
        ));
        let stream_manager = Arc::new(StreamManager::new(path_manager.clone(), config_store));
        let notifications = Arc::new(HealthNotificationManager::new(&config.health));

        Fixture {
            path_manager,
            stream_manager,
            notifications,
        }
    }

    #[tokio::test]
    async fn recording_recovery_trigger_matching() {
        let mock = MockGateway::start().await;
        let fixture = fixture_for(&mock);
        let strategy =
            RecordingRecovery::new(fixture.path_manager, fixture.stream_manager);

        assert!(strategy.can_recover(&anyhow::anyhow!("gateway said: path not found")));
        assert!(strategy.can_recover(&anyhow::anyhow!("code 409 conflict")));
        assert!(strategy.can_recover(&anyhow::anyhow!("RTSP handshake refused")));
        assert!(!strategy.can_recover(&anyhow::anyhow!("disk full")));
    }

    #[tokio::test]
    async fn attempt_with_recovery_retries_once_after_repair() {
        let mock = MockGateway::start().await;
        let fixture = fixture_for(&mock);
        let strategy = RecordingRecovery {
            path_manager: fixture.path_manager,
            stream_manager: fixture.stream_manager,
        };

        mock.stub("POST", "/v3/config/paths/add/camera0", 200, "");

        let context = RecoveryContext {
            camera: CameraId::from("camera0"),
            device_path: DevicePath::from("/dev/video0"),
        };

        let attempts = std::sync::atomic::AtomicUsize::new(0);
        let result = attempt_with_recovery(&strategy, &context, || {
            let attempt = attempts.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            async move {
                if attempt == 0 {
                    Err(anyhow::anyhow!("path not found"))
                } else {
                    Ok(42)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(result, 42);
        assert_eq!(attempts.load(std::sync::atomic::Ordering::Relaxed), 2);
        assert_eq!(mock.request_count("POST", "/v3/config/paths/add/camera0"), 1);
    }

    #[tokio::test]
    async fn unrecoverable_errors_are_not_retried() {
        let mock = MockGateway::start().await;
        let fixture = fixture_for(&mock);
        let strategy =
            RecordingRecovery::new(fixture.path_manager, fixture.stream_manager);

        let context = RecoveryContext {
            camera: CameraId::from("camera0"),
            device_path: DevicePath::from("/dev/video0"),
        };

        let attempts = std::sync::atomic::AtomicUsize::new(0);
        let result: Result<(), Error> = attempt_with_recovery(&strategy, &context, || {
            attempts.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            async { Err(anyhow::anyhow!("disk full")) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(std::sync::atomic::Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn critical_notification_disables_the_path() {
        let mock = MockGateway::start().await;
        let fixture = fixture_for(&mock);
        let recovery = Arc::new(PathErrorRecovery::new(
            fixture.path_manager,
            fixture.notifications.clone(),
            2,
            Duration::from_millis(5),
        ));
        let mut health_notifications = fixture.notifications.subscribe();

        let (exit_sender, exit_flag) = async_flag::pair();
        let runner = {
            let recovery = recovery.clone();
            tokio::spawn(async move { recovery.run(exit_flag).await })
        };

        recovery
            .sender()
            .send(PathErrorNotification {
                path: "camera0".to_owned(),
                severity: PathErrorSeverity::Critical,
                message: "keepalive lost".to_owned(),
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(recovery.is_path_disabled("camera0"));

        let notification = health_notifications.try_next().unwrap().unwrap();
        assert_eq!(notification.status, "path_error_critical");

        recovery.enable_path("camera0");
        assert!(!recovery.is_path_disabled("camera0"));

        exit_sender.signal();
        runner.await.unwrap();
    }

    #[tokio::test]
    async fn warning_escalates_when_the_path_never_recovers() {
        let mock = MockGateway::start().await;
        let fixture = fixture_for(&mock);
        let recovery = Arc::new(PathErrorRecovery::new(
            fixture.path_manager,
            fixture.notifications.clone(),
            2,
            Duration::from_millis(5),
        ));

        // no stub for the path: every probe sees 404
        let (exit_sender, exit_flag) = async_flag::pair();
        let runner = {
            let recovery = recovery.clone();
            tokio::spawn(async move { recovery.run(exit_flag).await })
        };

        recovery
            .sender()
            .send(PathErrorNotification {
                path: "camera3".to_owned(),
                severity: PathErrorSeverity::Warning,
                message: "path creation failed".to_owned(),
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(recovery.is_path_disabled("camera3"));

        exit_sender.signal();
        runner.await.unwrap();
    }

    #[tokio::test]
    async fn warning_clears_when_the_path_recovers() {
        let mock = MockGateway::start().await;
        let fixture = fixture_for(&mock);
        let recovery = Arc::new(PathErrorRecovery::new(
            fixture.path_manager,
            fixture.notifications.clone(),
            3,
            Duration::from_millis(5),
        ));

        mock.stub(
            "GET",
            "/v3/paths/get/camera4",
            200,
            r#"{"name": "camera4", "ready": true}"#,
        );

        let (exit_sender, exit_flag) = async_flag::pair();
        let runner = {
            let recovery = recovery.clone();
            tokio::spawn(async move { recovery.run(exit_flag).await })
        };

        recovery
            .sender()
            .send(PathErrorNotification {
                path: "camera4".to_owned(),
                severity: PathErrorSeverity::Warning,
                message: "transient".to_owned(),
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!recovery.is_path_disabled("camera4"));

        exit_sender.signal();
        runner.await.unwrap();
    }
}
