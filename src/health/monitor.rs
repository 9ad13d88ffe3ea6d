use super::{
    breaker::{BreakerState, CircuitBreaker},
    notifications::HealthNotificationManager,
};
use crate::{
    config::ConfigStore,
    gateway::client::Client,
    util::{
        async_flag,
        runnable::{Exited, Runnable},
    },
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
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
    time::Instant,
};

#[derive(Serialize, Clone, PartialEq, Debug)]
pub struct HealthStatus {
    pub status: String,
    pub last_check: Option<DateTime<Utc>>,
    pub components: HashMap<String, String>,
    pub circuit_breaker_state: String,
    pub failure_count: usize,
    pub metrics: serde_json::Value,
}

// Periodic gateway probe feeding the circuit breaker. The breaker is only
// mutated here; readers get snapshots.
pub struct HealthMonitor {
    client: Arc<Client>,
    config_store: Arc<ConfigStore>,
    notifications: Arc<HealthNotificationManager>,

    breaker: Mutex<CircuitBreaker>,
    is_healthy: AtomicBool,
    last_check: Mutex<Option<DateTime<Utc>>>,
}
impl HealthMonitor {
    pub fn new(
        client: Arc<Client>,
        config_store: Arc<ConfigStore>,
        notifications: Arc<HealthNotificationManager>,
    ) -> Self {
        let breaker = CircuitBreaker::new(&config_store.snapshot().health);

        Self {
            client,
            config_store,
            notifications,

            breaker: Mutex::new(breaker),
            is_healthy: AtomicBool::new(false),
            last_check: Mutex::new(None),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.is_healthy.load(Ordering::Relaxed)
    }
    pub fn is_circuit_open(&self) -> bool {
        self.breaker.lock().state() == BreakerState::Open
    }

    fn status_label(
        &self,
        breaker_state: BreakerState,
        checked: bool,
    ) -> &'static str {
        if !checked {
            return "starting";
        }
        match breaker_state {
            BreakerState::Open => "unhealthy",
            BreakerState::HalfOpen => "degraded",
            BreakerState::Closed => {
                if self.is_healthy() {
                    "healthy"
                } else {
                    "degraded"
                }
            }
        }
    }

    pub fn status(&self) -> HealthStatus {
        let snapshot = self.breaker.lock().snapshot();
        let last_check = *self.last_check.lock();

        let status = self
            .status_label(snapshot.state, last_check.is_some())
            .to_owned();

        let mut components = HashMap::new();
        components.insert(
            "gateway".to_owned(),
            if self.is_healthy() {
                "healthy".to_owned()
            } else {
                "unhealthy".to_owned()
            },
        );

        let client_metrics = self.client.metrics();
        HealthStatus {
            status,
            last_check,
            components,
            circuit_breaker_state: snapshot.state.as_str().to_owned(),
            failure_count: snapshot.failure_count,
            metrics: serde_json::json!({
                "requests_total": client_metrics.requests_total,
                "errors_total": client_metrics.errors_total,
                "average_response_time_ms":
                    client_metrics.average_response_time.as_millis() as u64,
            }),
        }
    }

    pub fn metrics(&self) -> HashMap<String, serde_json::Value> {
        let snapshot = self.breaker.lock().snapshot();
        let client_metrics = self.client.metrics();

        let mut metrics = HashMap::new();
        metrics.insert(
            "circuit_breaker_state".to_owned(),
            serde_json::Value::from(snapshot.state.as_str()),
        );
        metrics.insert(
            "failure_count".to_owned(),
            serde_json::Value::from(snapshot.failure_count),
        );
        metrics.insert(
            "consecutive_successes".to_owned(),
            serde_json::Value::from(snapshot.consecutive_successes),
        );
        metrics.insert(
            "requests_total".to_owned(),
            serde_json::Value::from(client_metrics.requests_total),
        );
        metrics.insert(
            "errors_total".to_owned(),
            serde_json::Value::from(client_metrics.errors_total),
        );
        metrics
    }

    pub async fn probe_once(&self) {
        {
            let mut breaker = self.breaker.lock();
            if !breaker.allow_probe(Instant::now()) {
                return;
            }
        }

        let result = self.client.health_probe().await;

        let (state, healthy) = {
            let mut breaker = self.breaker.lock();
            match result.as_ref() {
                Ok(()) => breaker.record_success(),
                Err(_) => breaker.record_failure(Instant::now()),
            }
            let state = breaker.state();
            (state, result.is_ok() && state == BreakerState::Closed)
        };
        self.is_healthy.store(healthy, Ordering::Relaxed);
        *self.last_check.lock() = Some(Utc::now());

        if let Err(error) = result {
            log::warn!("{}: gateway probe failed: {:#}", self, error);
        }

        let status = self.status_label(state, true);
        self.notifications
            .forward_health_status(status, format!("gateway health: {status}"));
    }

    async fn run(
        &self,
        mut exit_flag: async_flag::Receiver,
    ) -> Exited {
        loop {
            self.probe_once().await;

            let check_interval = self.config_store.snapshot().health.check_interval;
            select! {
                () = tokio::time::sleep(check_interval).fuse() => {},
                () = exit_flag => break,
            }
        }

        Exited
    }
}
#[async_trait]
impl Runnable for HealthMonitor {
    async fn run(
        &self,
        exit_flag: async_flag::Receiver,
    ) -> Exited {
        self.run(exit_flag).await
    }
}
impl fmt::Display for HealthMonitor {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "HealthMonitor")
    }
}
