use crate::{
    config::{ConfigStore, GatewayConfig},
    datatypes::{camera_id::CameraId, device_path::DevicePath},
    errors::ControllerError,
    gateway::types::{Path, PathConf, wire_duration},
    paths::manager::PathManager,
};
use serde::Serialize;
use std::{fmt, sync::Arc};

pub fn rtsp_stream_url(
    gateway: &GatewayConfig,
    name: &str,
) -> String {
    format!("rtsp://{}:{}/{}", gateway.host, gateway.rtsp_port, name)
}

// One gateway path serves every operation on a camera, so both use cases
// resolve to the same canonical name. This eliminates duplicate streams for
// concurrent viewing and recording.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum StreamUseCase {
    Recording,
    Viewing,
}

#[derive(Serialize, Clone, PartialEq, Debug)]
pub struct StreamInfo {
    pub name: String,
    pub url: String,
    pub ready: bool,
}

pub struct StreamManager {
    path_manager: Arc<PathManager>,
    config_store: Arc<ConfigStore>,
}
impl StreamManager {
    pub fn new(
        path_manager: Arc<PathManager>,
        config_store: Arc<ConfigStore>,
    ) -> Self {
        Self {
            path_manager,
            config_store,
        }
    }

    pub fn generate_stream_name(
        &self,
        camera: &CameraId,
        _use_case: StreamUseCase,
    ) -> String {
        camera.as_str().to_owned()
    }
    pub fn generate_stream_url(
        &self,
        name: &str,
    ) -> String {
        let gateway = self.config_store.snapshot().gateway;
        rtsp_stream_url(&gateway, name)
    }

    fn render_run_on_demand(
        template: &str,
        device_path: &DevicePath,
        url: &str,
    ) -> String {
        template
            .replace("{device}", device_path.as_str())
            .replace("{url}", url)
    }

    // On-demand path configuration for the device: local devices get a
    // runOnDemand bridge command, external sources are handed to the gateway
    // as an on-demand source.
    pub fn on_demand_conf(
        &self,
        device_path: &DevicePath,
        name: &str,
    ) -> PathConf {
        let config = self.config_store.snapshot();

        let mut conf = PathConf::default();
        if device_path.is_local() {
            let publish_url = rtsp_stream_url(&config.gateway, name);
            conf.run_on_demand = Some(Self::render_run_on_demand(
                &config.streams.run_on_demand_template,
                device_path,
                &publish_url,
            ));
            conf.run_on_demand_restart = Some(config.streams.run_on_demand_restart);
            conf.run_on_demand_start_timeout =
                Some(wire_duration(config.streams.on_demand_start_timeout));
            conf.run_on_demand_close_after =
                Some(wire_duration(config.streams.on_demand_close_after));
        } else {
            conf.source = Some(device_path.as_str().to_owned());
            conf.source_on_demand = Some(true);
            conf.source_on_demand_start_timeout =
                Some(wire_duration(config.streams.on_demand_start_timeout));
            conf.source_on_demand_close_after =
                Some(wire_duration(config.streams.on_demand_close_after));
        }
        conf
    }

    // Ensures an on-demand path exists for the device. On-demand paths come
    // up when first accessed, so readiness is reported optimistically
    // instead of blocking on the first consumer.
    pub async fn start_stream(
        &self,
        device_path: &DevicePath,
    ) -> Result<StreamInfo, ControllerError> {
        let camera = self.path_manager.camera_for_device_path(device_path);
        let name = self.generate_stream_name(&camera, StreamUseCase::Viewing);

        let conf = self.on_demand_conf(device_path, &name);
        self.path_manager.create_path(&name, &conf).await?;

        Ok(StreamInfo {
            url: self.generate_stream_url(&name),
            name,
            ready: true,
        })
    }
    pub async fn stop_stream(
        &self,
        camera: &CameraId,
    ) -> Result<(), ControllerError> {
        let name = self.generate_stream_name(camera, StreamUseCase::Viewing);

        match self.path_manager.delete_path(&name).await {
            Ok(()) => Ok(()),
            Err(ControllerError::NotFound { .. }) => Ok(()),
            Err(error) => Err(error),
        }
    }

    pub async fn list_streams(&self) -> Result<Vec<Path>, ControllerError> {
        self.path_manager.list_paths().await
    }
    pub async fn get_stream(
        &self,
        name: &str,
    ) -> Result<Path, ControllerError> {
        self.path_manager.get_path(name).await
    }
    pub async fn create_stream(
        &self,
        name: &str,
        source: &str,
    ) -> Result<(), ControllerError> {
        let conf = PathConf {
            source: Some(source.to_owned()),
            ..Default::default()
        };
        self.path_manager.create_path(name, &conf).await
    }
    pub async fn delete_stream(
        &self,
        name: &str,
    ) -> Result<(), ControllerError> {
        self.path_manager.delete_path(name).await
    }
}
impl fmt::Display for StreamManager {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "StreamManager")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::Config, gateway::client::Client, gateway::mock::MockGateway,
        monitor::testing::ManualMonitor,
    };
    use std::time::Duration;

    fn manager_for(mock: &MockGateway) -> StreamManager {
        let mut config = Config::default();
        config.gateway.api_port = mock.port();
        config.gateway.retry_attempts = 1;
        config.gateway.retry_delay = Duration::from_millis(1);

        let config_store = Arc::new(ConfigStore::new(config.clone()).unwrap());
        let client = Arc::new(Client::new(&config.gateway).unwrap());
        let monitor = Arc::new(ManualMonitor::new());
        let path_manager = Arc::new(PathManager::new(
            client,
            config_store.clone(),
            monitor,
        ));

        StreamManager::new(path_manager, config_store)
    }

    fn offline_manager() -> StreamManager {
        let config = Config::default();
        let config_store = Arc::new(ConfigStore::new(config.clone()).unwrap());
        let client = Arc::new(Client::new(&config.gateway).unwrap());
        let monitor = Arc::new(ManualMonitor::new());
        let path_manager = Arc::new(PathManager::new(
            client,
            config_store.clone(),
            monitor,
        ));

        StreamManager::new(path_manager, config_store)
    }

    #[test]
    fn single_path_policy_for_both_use_cases() {
        let manager = offline_manager();
        let camera = CameraId::from("camera0");

        assert_eq!(
            manager.generate_stream_name(&camera, StreamUseCase::Recording),
            manager.generate_stream_name(&camera, StreamUseCase::Viewing),
        );
        assert_eq!(
            manager.generate_stream_name(&camera, StreamUseCase::Viewing),
            "camera0"
        );
    }

    #[test]
    fn stream_url_shape() {
        let manager = offline_manager();
        assert_eq!(
            manager.generate_stream_url("camera3"),
            "rtsp://127.0.0.1:8554/camera3"
        );
    }

    #[test]
    fn on_demand_conf_for_local_device_renders_bridge_command() {
        let manager = offline_manager();

        let conf = manager.on_demand_conf(&DevicePath::from("/dev/video0"), "camera0");
        let run_on_demand = conf.run_on_demand.unwrap();
        assert!(run_on_demand.contains("/dev/video0"));
        assert!(run_on_demand.contains("rtsp://127.0.0.1:8554/camera0"));
        assert_eq!(conf.run_on_demand_restart, Some(true));
        assert!(conf.source.is_none());
    }

    #[test]
    fn on_demand_conf_for_external_source_uses_source_on_demand() {
        let manager = offline_manager();

        let conf = manager.on_demand_conf(
            &DevicePath::from("rtsp://10.0.0.5:554/live"),
            "external-stream",
        );
        assert_eq!(conf.source.as_deref(), Some("rtsp://10.0.0.5:554/live"));
        assert_eq!(conf.source_on_demand, Some(true));
        assert!(conf.run_on_demand.is_none());
    }

    #[tokio::test]
    async fn start_stream_provisions_path_and_reports_ready() {
        let mock = MockGateway::start().await;
        let manager = manager_for(&mock);

        mock.stub("POST", "/v3/config/paths/add/camera0", 200, "");

        let info = manager
            .start_stream(&DevicePath::from("/dev/video0"))
            .await
            .unwrap();
        assert_eq!(info.name, "camera0");
        assert!(info.ready);
        assert_eq!(info.url, "rtsp://127.0.0.1:8554/camera0");

        let recorded = mock.requests();
        let request = recorded
            .iter()
            .find(|request| request.path == "/v3/config/paths/add/camera0")
            .unwrap();
        let body: serde_json::Value = serde_json::from_str(&request.body).unwrap();
        assert!(
            body["runOnDemand"]
                .as_str()
                .unwrap()
                .contains("/dev/video0")
        );
    }

    #[tokio::test]
    async fn stop_stream_is_idempotent() {
        let mock = MockGateway::start().await;
        let manager = manager_for(&mock);

        // no stub: delete yields 404, which stop treats as done
        manager
            .stop_stream(&CameraId::from("camera0"))
            .await
            .unwrap();
    }
}
