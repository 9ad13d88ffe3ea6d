use crate::{
    datatypes::device_path::DevicePath,
    errors::ControllerError,
    monitor::{CameraEvent, CameraMonitor},
    paths::manager::PathManager,
    streams::StreamManager,
    util::{
        async_flag,
        runnable::{Exited, Runnable},
    },
};
use async_trait::async_trait;
use atomic_refcell::AtomicRefCell;
use futures::{FutureExt, StreamExt, channel::mpsc, select};
use std::{fmt, sync::Arc, time::Duration};

const RECONCILE_INTERVAL: Duration = Duration::from_secs(60);

// Glue between the camera monitor and the path manager: attached devices get
// a configured gateway path, detached devices lose theirs. Reconciliation is
// idempotent; a periodic sweep repairs anything missed between events.
pub struct PathIntegration {
    path_manager: Arc<PathManager>,
    stream_manager: Arc<StreamManager>,
    monitor: Arc<dyn CameraMonitor>,

    events: AtomicRefCell<mpsc::UnboundedReceiver<CameraEvent>>,
}
impl PathIntegration {
    pub fn new(
        path_manager: Arc<PathManager>,
        stream_manager: Arc<StreamManager>,
        monitor: Arc<dyn CameraMonitor>,
    ) -> Self {
        let events = AtomicRefCell::new(monitor.subscribe());

        Self {
            path_manager,
            stream_manager,
            monitor,

            events,
        }
    }

    async fn handle_attached(
        &self,
        device_path: &DevicePath,
    ) -> Result<(), ControllerError> {
        let camera = self.path_manager.camera_for_device_path(device_path);
        let name = camera.as_str().to_owned();

        let conf = self.stream_manager.on_demand_conf(device_path, &name);
        self.path_manager.create_path(&name, &conf).await?;

        log::info!("{}: path configured for {}", self, device_path);
        Ok(())
    }
    async fn handle_detached(
        &self,
        device_path: &DevicePath,
    ) -> Result<(), ControllerError> {
        let camera = self.path_manager.camera_for_device_path(device_path);

        match self.path_manager.delete_path(camera.as_str()).await {
            Ok(()) => {
                log::info!("{}: path removed for {}", self, device_path);
                Ok(())
            }
            // spurious detach with no path present is a no-op
            Err(ControllerError::NotFound { .. }) => Ok(()),
            Err(error) => Err(error),
        }
    }

    async fn handle_event(
        &self,
        event: CameraEvent,
    ) {
        let result = match &event {
            CameraEvent::Attached(device_path) => self.handle_attached(device_path).await,
            CameraEvent::Detached(device_path) => self.handle_detached(device_path).await,
        };

        if let Err(error) = result {
            log::error!("{}: {:?}: {}", self, event, error);
        }
    }

    pub async fn reconcile_all(&self) {
        for device_path in self.monitor.devices() {
            if let Err(error) = self.handle_attached(&device_path).await {
                log::error!("{}: reconcile {}: {}", self, device_path, error);
            }
        }
    }

    async fn run(
        &self,
        mut exit_flag: async_flag::Receiver,
    ) -> Exited {
        self.reconcile_all().await;

        let mut events = self.events.borrow_mut();
        loop {
            select! {
                event = events.next() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        // monitor went away; fall back to periodic sweeps
                        select! {
                            () = tokio::time::sleep(RECONCILE_INTERVAL).fuse() => {},
                            () = exit_flag => break,
                        }
                        self.reconcile_all().await;
                    }
                },
                () = tokio::time::sleep(RECONCILE_INTERVAL).fuse() => {
                    self.reconcile_all().await;
                },
                () = exit_flag => break,
            }
        }

        Exited
    }
}
#[async_trait]
impl Runnable for PathIntegration {
    async fn run(
        &self,
        exit_flag: async_flag::Receiver,
    ) -> Exited {
        self.run(exit_flag).await
    }
}
impl fmt::Display for PathIntegration {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "PathIntegration")
    }
}
