use super::types::{
    GlobalConfPatch, Path, PathConf, PathConfList, PathList, RtspConn, RtspConnList,
    RtspSession, RtspSessionList,
};
use crate::{config::GatewayConfig, errors::GatewayError, errors::categorize};
use anyhow::{Context, Error, bail};
use bytes::Bytes;
use http::{
    Method, Uri,
    uri::{self, Authority, PathAndQuery, Scheme},
};
use rand::{RngExt, rng};
use serde::de::DeserializeOwned;
use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ClientMetrics {
    pub requests_total: u64,
    pub errors_total: u64,
    pub average_response_time: Duration,
}

#[derive(Debug, Default)]
struct MetricsCells {
    requests_total: AtomicU64,
    errors_total: AtomicU64,
    response_time_total_ms: AtomicU64,
}

// HTTP client for the gateway /v3 control surface. Safe for concurrent use;
// the pool is bounded by the gateway configuration.
#[derive(Debug)]
pub struct Client {
    authority: Authority,
    username: Option<String>,
    password: Option<String>,

    retry_attempts: usize,
    retry_delay: Duration,
    backoff_base_multiplier: f64,
    backoff_jitter_range: (f64, f64),

    reqwest_client: reqwest::Client,

    metrics: MetricsCells,
}
impl Client {
    pub fn new(config: &GatewayConfig) -> Result<Self, Error> {
        let authority: Authority = format!("{}:{}", config.host, config.api_port)
            .parse()
            .context("authority")?;

        let reqwest_client = reqwest::ClientBuilder::new()
            .pool_max_idle_per_host(config.max_idle_connections_per_host)
            .pool_idle_timeout(config.idle_connection_timeout)
            .timeout(config.request_timeout)
            .build()
            .context("reqwest_client")?;

        Ok(Self {
            authority,
            username: config.username.clone(),
            password: config.password.clone(),

            retry_attempts: config.retry_attempts,
            retry_delay: config.retry_delay,
            backoff_base_multiplier: config.backoff_base_multiplier,
            backoff_jitter_range: config.backoff_jitter_range,

            reqwest_client,

            metrics: MetricsCells::default(),
        })
    }

    pub fn metrics(&self) -> ClientMetrics {
        let requests_total = self.metrics.requests_total.load(Ordering::Relaxed);
        let errors_total = self.metrics.errors_total.load(Ordering::Relaxed);
        let response_time_total_ms = self.metrics.response_time_total_ms.load(Ordering::Relaxed);

        let average_response_time = if requests_total > 0 {
            Duration::from_millis(response_time_total_ms / requests_total)
        } else {
            Duration::ZERO
        };

        ClientMetrics {
            requests_total,
            errors_total,
            average_response_time,
        }
    }

    fn url_build(
        &self,
        path_and_query: &PathAndQuery,
    ) -> Uri {
        uri::Builder::new()
            .scheme(Scheme::HTTP)
            .authority(self.authority.clone())
            .path_and_query(path_and_query.clone())
            .build()
            .unwrap()
    }

    async fn request_once(
        &self,
        operation: &'static str,
        method: &Method,
        path_and_query: &PathAndQuery,
        body: Option<&serde_json::Value>,
    ) -> Result<Bytes, Error> {
        let mut request = self
            .reqwest_client
            .request(
                method.clone(),
                self.url_build(path_and_query).to_string().as_str(),
            )
            .header(http::header::ACCEPT, "application/json");

        if let Some(username) = self.username.as_ref() {
            request = request.basic_auth(username, self.password.as_deref());
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.context("send")?;

        let status = response.status();
        let response = response.bytes().await.context("bytes")?;

        if !status.is_success() {
            let message = String::from_utf8_lossy(&response).into_owned();
            let details = serde_json::from_slice::<serde_json::Value>(&response).ok();
            return Err(GatewayError {
                operation: operation.to_owned(),
                code: status.as_u16(),
                message,
                details,
            }
            .into());
        }

        Ok(response)
    }

    fn retry_backoff(
        &self,
        attempt: usize,
    ) -> Duration {
        let backoff = self
            .retry_delay
            .mul_f64(self.backoff_base_multiplier.powi(attempt as i32));
        let (jitter_min, jitter_max) = self.backoff_jitter_range;
        backoff.mul_f64(rng().random_range(jitter_min..=jitter_max))
    }

    async fn request(
        &self,
        operation: &'static str,
        method: Method,
        path_and_query: PathAndQuery,
        body: Option<serde_json::Value>,
    ) -> Result<Bytes, Error> {
        let mut attempt: usize = 0;
        loop {
            let started = Instant::now();
            let result = self
                .request_once(operation, &method, &path_and_query, body.as_ref())
                .await;

            self.metrics.requests_total.fetch_add(1, Ordering::Relaxed);
            self.metrics.response_time_total_ms.fetch_add(
                started.elapsed().as_millis() as u64,
                Ordering::Relaxed,
            );

            let error = match result {
                Ok(response) => return Ok(response),
                Err(error) => error,
            };
            self.metrics.errors_total.fetch_add(1, Ordering::Relaxed);

            let classification = categorize(&error);
            if !classification.retryable || attempt + 1 >= self.retry_attempts.max(1) {
                return Err(error).context(operation);
            }

            let backoff = self.retry_backoff(attempt);
            log::warn!(
                "{}: {} failed (attempt {}), retrying in {:?}: {:#}",
                self,
                operation,
                attempt + 1,
                backoff,
                error,
            );
            tokio::time::sleep(backoff).await;

            attempt += 1;
        }
    }

    async fn request_json<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        method: Method,
        path_and_query: PathAndQuery,
        body: Option<serde_json::Value>,
    ) -> Result<T, Error> {
        let response = self
            .request(operation, method, path_and_query, body)
            .await?;

        if response.is_empty() || response.as_ref() == b"null" {
            bail!("{}: empty response body", operation);
        }

        let output = serde_json::from_slice::<T>(&response).context("from_slice")?;
        Ok(output)
    }
    async fn request_empty(
        &self,
        operation: &'static str,
        method: Method,
        path_and_query: PathAndQuery,
        body: Option<serde_json::Value>,
    ) -> Result<(), Error> {
        let _ = self
            .request(operation, method, path_and_query, body)
            .await?;
        Ok(())
    }

    pub async fn paths_list(
        &self,
        items_per_page: Option<usize>,
        page: Option<usize>,
    ) -> Result<PathList, Error> {
        let path_and_query = paginated("/v3/paths/list", items_per_page, page)?;

        self.request_json("paths_list", Method::GET, path_and_query, None)
            .await
    }
    pub async fn path_get(
        &self,
        name: &str,
    ) -> Result<Path, Error> {
        let path_and_query: PathAndQuery = format!("/v3/paths/get/{name}")
            .parse()
            .context("path_and_query")?;

        self.request_json("path_get", Method::GET, path_and_query, None)
            .await
    }

    pub async fn path_configs_list(
        &self,
        items_per_page: Option<usize>,
        page: Option<usize>,
    ) -> Result<PathConfList, Error> {
        let path_and_query = paginated("/v3/config/paths/list", items_per_page, page)?;

        self.request_json("path_configs_list", Method::GET, path_and_query, None)
            .await
    }
    pub async fn path_config_get(
        &self,
        name: &str,
    ) -> Result<PathConf, Error> {
        let path_and_query: PathAndQuery = format!("/v3/config/paths/get/{name}")
            .parse()
            .context("path_and_query")?;

        self.request_json("path_config_get", Method::GET, path_and_query, None)
            .await
    }
    pub async fn path_config_add(
        &self,
        name: &str,
        conf: &PathConf,
    ) -> Result<(), Error> {
        let path_and_query: PathAndQuery = format!("/v3/config/paths/add/{name}")
            .parse()
            .context("path_and_query")?;
        let body = serde_json::to_value(conf).context("to_value")?;

        self.request_empty("path_config_add", Method::POST, path_and_query, Some(body))
            .await
    }
    pub async fn path_config_patch(
        &self,
        name: &str,
        conf: &PathConf,
    ) -> Result<(), Error> {
        let path_and_query: PathAndQuery = format!("/v3/config/paths/patch/{name}")
            .parse()
            .context("path_and_query")?;
        let body = serde_json::to_value(conf).context("to_value")?;

        self.request_empty(
            "path_config_patch",
            Method::PATCH,
            path_and_query,
            Some(body),
        )
        .await
    }
    pub async fn path_config_delete(
        &self,
        name: &str,
    ) -> Result<(), Error> {
        let path_and_query: PathAndQuery = format!("/v3/config/paths/delete/{name}")
            .parse()
            .context("path_and_query")?;

        self.request_empty("path_config_delete", Method::DELETE, path_and_query, None)
            .await
    }

    pub async fn global_config_patch(
        &self,
        patch: &GlobalConfPatch,
    ) -> Result<(), Error> {
        let body = serde_json::to_value(patch).context("to_value")?;

        self.request_empty(
            "global_config_patch",
            Method::PATCH,
            PathAndQuery::from_static("/v3/config/global/patch"),
            Some(body),
        )
        .await
    }
    pub async fn global_config_get(&self) -> Result<serde_json::Value, Error> {
        self.request_json(
            "global_config_get",
            Method::GET,
            PathAndQuery::from_static("/v3/config/global/get"),
            None,
        )
        .await
    }

    pub async fn rtsp_connections_list(
        &self,
        items_per_page: Option<usize>,
        page: Option<usize>,
    ) -> Result<RtspConnList, Error> {
        let path_and_query = paginated("/v3/rtspconns/list", items_per_page, page)?;

        self.request_json("rtsp_connections_list", Method::GET, path_and_query, None)
            .await
    }
    pub async fn rtsp_connection_get(
        &self,
        id: &str,
    ) -> Result<RtspConn, Error> {
        let path_and_query: PathAndQuery = format!("/v3/rtspconns/get/{id}")
            .parse()
            .context("path_and_query")?;

        self.request_json("rtsp_connection_get", Method::GET, path_and_query, None)
            .await
    }
    pub async fn rtsp_sessions_list(
        &self,
        items_per_page: Option<usize>,
        page: Option<usize>,
    ) -> Result<RtspSessionList, Error> {
        let path_and_query = paginated("/v3/rtspsessions/list", items_per_page, page)?;

        self.request_json("rtsp_sessions_list", Method::GET, path_and_query, None)
            .await
    }
    pub async fn rtsp_session_get(
        &self,
        id: &str,
    ) -> Result<RtspSession, Error> {
        let path_and_query: PathAndQuery = format!("/v3/rtspsessions/get/{id}")
            .parse()
            .context("path_and_query")?;

        self.request_json("rtsp_session_get", Method::GET, path_and_query, None)
            .await
    }
    pub async fn rtsp_session_kick(
        &self,
        id: &str,
    ) -> Result<(), Error> {
        let path_and_query: PathAndQuery = format!("/v3/rtspsessions/kick/{id}")
            .parse()
            .context("path_and_query")?;

        self.request_empty("rtsp_session_kick", Method::POST, path_and_query, None)
            .await
    }

    // The gateway exposes no dedicated health endpoint; the cheapest
    // authenticated list is the probe.
    pub async fn health_probe(&self) -> Result<(), Error> {
        let _ = self.paths_list(Some(1), None).await?;
        Ok(())
    }
}
impl fmt::Display for Client {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "GatewayClient({})", self.authority)
    }
}

fn paginated(
    base: &'static str,
    items_per_page: Option<usize>,
    page: Option<usize>,
) -> Result<PathAndQuery, Error> {
    let mut query = Vec::new();
    if let Some(items_per_page) = items_per_page {
        query.push(format!("itemsPerPage={items_per_page}"));
    }
    if let Some(page) = page {
        query.push(format!("page={page}"));
    }

    let path_and_query = if query.is_empty() {
        PathAndQuery::from_static(base)
    } else {
        format!("{}?{}", base, query.join("&"))
            .parse()
            .context("path_and_query")?
    };

    Ok(path_and_query)
}
