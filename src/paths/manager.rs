use crate::{
    config::ConfigStore,
    datatypes::{camera_id::CameraId, device_path::DevicePath},
    errors::{ControllerError, GatewayError},
    gateway::{
        client::Client,
        types::{NamedPathConf, Path, PathConf},
    },
    monitor::CameraMonitor,
    streams::rtsp_stream_url,
};
use anyhow::Error;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{collections::HashMap, fmt, sync::Arc};

const LIST_PAGE_SIZE: usize = 100;

#[derive(Serialize, Clone, Copy, PartialEq, Eq, Debug)]
#[serde(rename_all = "UPPERCASE")]
pub enum CameraStatus {
    Connected,
    Disconnected,
}

#[derive(Serialize, Clone, PartialEq, Debug)]
pub struct CameraStreams {
    pub rtsp: String,
}

#[derive(Serialize, Clone, PartialEq, Debug)]
pub struct CameraSummary {
    pub camera: CameraId,
    pub status: CameraStatus,
    pub ready: bool,
    pub streams: CameraStreams,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub readers: usize,
}

#[derive(Serialize, Clone, PartialEq, Debug)]
pub struct CameraListResponse {
    pub cameras: Vec<CameraSummary>,
    pub total: usize,
    pub connected: usize,
}

#[derive(Serialize, Clone, PartialEq, Debug)]
pub struct CameraStatusResponse {
    pub camera: CameraId,
    pub status: CameraStatus,
    pub ready: bool,
    pub ready_time: Option<DateTime<Utc>>,
    pub streams: CameraStreams,
    pub tracks: Vec<String>,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub readers: usize,
}

// Owner of the CameraId <-> DevicePath mapping and of all traffic against
// the gateway /paths surface. Every other component converts identities
// through this type instead of keeping its own mapping.
pub struct PathManager {
    client: Arc<Client>,
    config_store: Arc<ConfigStore>,
    monitor: Arc<dyn CameraMonitor>,
}
impl PathManager {
    pub fn new(
        client: Arc<Client>,
        config_store: Arc<ConfigStore>,
        monitor: Arc<dyn CameraMonitor>,
    ) -> Self {
        Self {
            client,
            config_store,
            monitor,
        }
    }

    // identity mapping
    //
    // Canonical identifiers map bijectively (`cameraN` <-> `/dev/videoN`);
    // anything else passes through unchanged, which is what external RTSP
    // sources rely on.
    pub fn camera_for_device_path(
        &self,
        device_path: &DevicePath,
    ) -> CameraId {
        match device_path.index() {
            Some(index) => CameraId::from_index(index),
            None => CameraId::new(device_path.as_str().to_owned()),
        }
    }
    pub fn device_path_for_camera(
        &self,
        camera: &CameraId,
    ) -> DevicePath {
        match camera.index() {
            Some(index) => DevicePath::from_index(index),
            None => DevicePath::new(camera.as_str().to_owned()),
        }
    }

    // A canonical camera must be present in the monitor inventory; opaque
    // identifiers (external sources) are accepted as-is.
    pub fn validate_camera_device(
        &self,
        camera: &CameraId,
    ) -> bool {
        if camera.as_str().trim().is_empty() {
            return false;
        }
        if !camera.is_canonical() {
            return true;
        }

        let device_path = self.device_path_for_camera(camera);
        self.monitor.devices().contains(&device_path)
    }

    pub fn validate_path_name(
        &self,
        name: &str,
    ) -> Result<(), ControllerError> {
        if name.trim().is_empty() {
            return Err(ControllerError::InvalidInput(
                "path name must not be empty".to_owned(),
            ));
        }
        if name.contains(['/', '\\']) {
            return Err(ControllerError::InvalidInput(format!(
                "path name must not contain separators: {name}"
            )));
        }
        if !name
            .chars()
            .all(|character| character.is_ascii_alphanumeric() || matches!(character, '_' | '-'))
        {
            return Err(ControllerError::InvalidInput(format!(
                "path name contains characters outside the gateway charset: {name}"
            )));
        }

        Ok(())
    }

    // gateway /paths surface
    pub async fn list_paths(&self) -> Result<Vec<Path>, ControllerError> {
        let mut paths = Vec::new();

        let mut page: usize = 0;
        loop {
            let list = self
                .client
                .paths_list(Some(LIST_PAGE_SIZE), Some(page))
                .await
                .map_err(|error| gateway_error("path", "*", error))?;

            paths.extend(list.items);

            page += 1;
            if page as u64 >= list.page_count {
                break;
            }
        }

        Ok(paths)
    }
    pub async fn list_path_configs(&self) -> Result<Vec<NamedPathConf>, ControllerError> {
        let mut confs = Vec::new();

        let mut page: usize = 0;
        loop {
            let list = self
                .client
                .path_configs_list(Some(LIST_PAGE_SIZE), Some(page))
                .await
                .map_err(|error| gateway_error("path", "*", error))?;

            confs.extend(list.items);

            page += 1;
            if page as u64 >= list.page_count {
                break;
            }
        }

        Ok(confs)
    }
    pub async fn get_path(
        &self,
        name: &str,
    ) -> Result<Path, ControllerError> {
        self.validate_path_name(name)?;

        self.client
            .path_get(name)
            .await
            .map_err(|error| gateway_error("path", name, error))
    }
    pub async fn path_exists(
        &self,
        name: &str,
    ) -> bool {
        match self.client.path_get(name).await {
            Ok(_) => true,
            Err(error) => {
                if error
                    .downcast_ref::<GatewayError>()
                    .is_none_or(|gateway_error| gateway_error.code != 404)
                {
                    log::warn!("{}: path_exists({}): {:?}", self, name, error);
                }
                false
            }
        }
    }

    // Creates the path, or accepts an existing one with the same source.
    // An existing path with a different source is a conflict.
    pub async fn create_path(
        &self,
        name: &str,
        conf: &PathConf,
    ) -> Result<(), ControllerError> {
        self.validate_path_name(name)?;

        let error = match self.client.path_config_add(name, conf).await {
            Ok(()) => return Ok(()),
            Err(error) => error,
        };

        let conflict = error
            .downcast_ref::<GatewayError>()
            .is_some_and(|gateway_error| matches!(gateway_error.code, 400 | 409));
        if !conflict {
            return Err(gateway_error("path", name, error));
        }

        let existing = self
            .client
            .path_config_get(name)
            .await
            .map_err(|error| gateway_error("path", name, error))?;
        if existing.source == conf.source {
            return Ok(());
        }

        Err(ControllerError::AlreadyExists {
            kind: "path",
            name: name.to_owned(),
        })
    }
    pub async fn patch_path(
        &self,
        name: &str,
        conf: &PathConf,
    ) -> Result<(), ControllerError> {
        self.validate_path_name(name)?;

        self.client
            .path_config_patch(name, conf)
            .await
            .map_err(|error| gateway_error("path", name, error))
    }
    pub async fn delete_path(
        &self,
        name: &str,
    ) -> Result<(), ControllerError> {
        self.validate_path_name(name)?;

        self.client
            .path_config_delete(name)
            .await
            .map_err(|error| gateway_error("path", name, error))
    }

    // API projections
    pub async fn camera_list(&self) -> Result<CameraListResponse, ControllerError> {
        let gateway_config = self.config_store.snapshot().gateway;

        let runtime_paths = self
            .list_paths()
            .await?
            .into_iter()
            .map(|path| (path.name.clone(), path))
            .collect::<HashMap<String, Path>>();

        let mut cameras = Vec::new();

        for device_path in self.monitor.devices() {
            let camera = self.camera_for_device_path(&device_path);
            let runtime = runtime_paths.get(camera.as_str());

            let ready = runtime.map(|path| path.ready).unwrap_or(false);
            cameras.push(CameraSummary {
                status: if ready {
                    CameraStatus::Connected
                } else {
                    CameraStatus::Disconnected
                },
                ready,
                streams: CameraStreams {
                    rtsp: rtsp_stream_url(&gateway_config, camera.as_str()),
                },
                bytes_received: runtime.map(|path| path.bytes_received).unwrap_or(0),
                bytes_sent: runtime.map(|path| path.bytes_sent).unwrap_or(0),
                readers: runtime.map(|path| path.readers.len()).unwrap_or(0),
                camera,
            });
        }

        cameras.sort_by(|left, right| left.camera.as_str().cmp(right.camera.as_str()));

        let total = cameras.len();
        let connected = cameras
            .iter()
            .filter(|camera| camera.status == CameraStatus::Connected)
            .count();

        Ok(CameraListResponse {
            cameras,
            total,
            connected,
        })
    }
    pub async fn camera_status(
        &self,
        camera: &CameraId,
    ) -> Result<CameraStatusResponse, ControllerError> {
        if camera.as_str().trim().is_empty() {
            return Err(ControllerError::InvalidInput(
                "device must not be empty".to_owned(),
            ));
        }

        let gateway_config = self.config_store.snapshot().gateway;

        let path = match self.get_path(camera.as_str()).await {
            Ok(path) => Some(path),
            Err(ControllerError::NotFound { .. }) => None,
            Err(error) => return Err(error),
        };

        let ready = path.as_ref().map(|path| path.ready).unwrap_or(false);
        Ok(CameraStatusResponse {
            camera: camera.clone(),
            status: if ready {
                CameraStatus::Connected
            } else {
                CameraStatus::Disconnected
            },
            ready,
            ready_time: path.as_ref().and_then(|path| path.ready_time),
            streams: CameraStreams {
                rtsp: rtsp_stream_url(&gateway_config, camera.as_str()),
            },
            tracks: path.as_ref().map(|path| path.tracks.clone()).unwrap_or_default(),
            bytes_received: path.as_ref().map(|path| path.bytes_received).unwrap_or(0),
            bytes_sent: path.as_ref().map(|path| path.bytes_sent).unwrap_or(0),
            readers: path.as_ref().map(|path| path.readers.len()).unwrap_or(0),
        })
    }
}
impl fmt::Display for PathManager {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "PathManager")
    }
}

pub(crate) fn gateway_error(
    kind: &'static str,
    name: &str,
    error: Error,
) -> ControllerError {
    match error.downcast::<GatewayError>() {
        Ok(gateway_error) if gateway_error.code == 404 => ControllerError::NotFound {
            kind,
            name: name.to_owned(),
        },
        Ok(gateway_error) => ControllerError::GatewayUnavailable(gateway_error),
        Err(error) => ControllerError::Internal(error),
    }
}
