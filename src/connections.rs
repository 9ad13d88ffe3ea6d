use crate::{
    errors::ControllerError,
    gateway::{
        client::Client,
        types::{RtspConn, RtspConnList, RtspSession, RtspSessionList},
    },
    paths::manager::gateway_error,
};
use serde::Serialize;
use std::{fmt, sync::Arc};

#[derive(Serialize, Clone, PartialEq, Debug)]
pub struct ConnectionHealth {
    pub status: String,
    pub connections: u64,
    pub sessions: u64,
}

#[derive(Serialize, Clone, PartialEq, Debug)]
pub struct ConnectionMetrics {
    pub connections: u64,
    pub sessions: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
}

// Thin aggregation over the gateway's connection/session inventory. No local
// state beyond the client reference.
pub struct RtspConnectionManager {
    client: Arc<Client>,
}
impl RtspConnectionManager {
    pub fn new(client: Arc<Client>) -> Self {
        Self { client }
    }

    pub async fn list_connections(
        &self,
        items_per_page: Option<usize>,
        page: Option<usize>,
    ) -> Result<RtspConnList, ControllerError> {
        self.client
            .rtsp_connections_list(items_per_page, page)
            .await
            .map_err(|error| gateway_error("connection", "*", error))
    }
    pub async fn get_connection(
        &self,
        id: &str,
    ) -> Result<RtspConn, ControllerError> {
        self.client
            .rtsp_connection_get(id)
            .await
            .map_err(|error| gateway_error("connection", id, error))
    }

    pub async fn list_sessions(
        &self,
        items_per_page: Option<usize>,
        page: Option<usize>,
    ) -> Result<RtspSessionList, ControllerError> {
        self.client
            .rtsp_sessions_list(items_per_page, page)
            .await
            .map_err(|error| gateway_error("session", "*", error))
    }
    pub async fn get_session(
        &self,
        id: &str,
    ) -> Result<RtspSession, ControllerError> {
        self.client
            .rtsp_session_get(id)
            .await
            .map_err(|error| gateway_error("session", id, error))
    }
    pub async fn kick_session(
        &self,
        id: &str,
    ) -> Result<(), ControllerError> {
        self.client
            .rtsp_session_kick(id)
            .await
            .map_err(|error| gateway_error("session", id, error))
    }

    pub async fn health(&self) -> Result<ConnectionHealth, ControllerError> {
        let connections = self.list_connections(Some(1), None).await?;
        let sessions = self.list_sessions(Some(1), None).await?;

        Ok(ConnectionHealth {
            status: "healthy".to_owned(),
            connections: connections.item_count,
            sessions: sessions.item_count,
        })
    }
    pub async fn metrics(&self) -> Result<ConnectionMetrics, ControllerError> {
        let connections = self.list_connections(None, None).await?;
        let sessions = self.list_sessions(None, None).await?;

        Ok(ConnectionMetrics {
            connections: connections.item_count,
            sessions: sessions.item_count,
            bytes_received: connections
                .items
                .iter()
                .map(|connection| connection.bytes_received)
                .sum(),
            bytes_sent: connections
                .items
                .iter()
                .map(|connection| connection.bytes_sent)
                .sum(),
        })
    }
}
impl fmt::Display for RtspConnectionManager {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "RtspConnectionManager")
    }
}
