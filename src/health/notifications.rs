use crate::metrics::{PerformanceMetrics, StorageInfo};
use crate::config::HealthConfig;
use chrono::{DateTime, Utc};
use futures::channel::mpsc;
use parking_lot::Mutex;
use serde::Serialize;
use std::{
    fmt,
    sync::atomic::{AtomicI32, AtomicI64, Ordering},
    time::Duration,
};

#[derive(Serialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
#[serde(rename_all = "lowercase")]
pub enum NotificationSeverity {
    Normal,
    Warning,
    Critical,
}
impl NotificationSeverity {
    pub fn code(&self) -> i32 {
        match self {
            Self::Normal => 0,
            Self::Warning => 1,
            Self::Critical => 2,
        }
    }

    // Unknown strings map to warning, never normal, so unclassified
    // conditions surface instead of being ignored.
    pub fn from_status(status: &str) -> Self {
        match status {
            "normal" | "healthy" | "ok" => Self::Normal,
            "critical" | "unhealthy" => Self::Critical,
            "warning" | "degraded" => Self::Warning,
            _ => Self::Warning,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum NotificationComponent {
    Storage,
    Performance,
    Health,
}
impl NotificationComponent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Storage => "storage",
            Self::Performance => "performance",
            Self::Health => "health",
        }
    }
}

#[derive(Serialize, Clone, PartialEq, Debug)]
pub struct HealthNotification {
    pub component: &'static str,
    pub severity: NotificationSeverity,
    pub status: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

// Per-family debounce state. Both cells are plain atomics so a state-change
// update can replace status and time without locking; a lost CAS means
// another emitter won and the duplicate is dropped silently.
#[derive(Debug)]
struct DebounceCell {
    last_time_ns: AtomicI64,
    last_status: AtomicI32,
}
impl DebounceCell {
    fn new() -> Self {
        Self {
            last_time_ns: AtomicI64::new(0),
            last_status: AtomicI32::new(NotificationSeverity::Normal.code()),
        }
    }
}

pub struct HealthNotificationManager {
    debounce: Duration,

    storage: DebounceCell,
    performance: DebounceCell,
    health: DebounceCell,

    subscribers: Mutex<Vec<mpsc::UnboundedSender<HealthNotification>>>,
}
impl HealthNotificationManager {
    pub fn new(config: &HealthConfig) -> Self {
        Self {
            debounce: config.notification_debounce,

            storage: DebounceCell::new(),
            performance: DebounceCell::new(),
            health: DebounceCell::new(),

            subscribers: Mutex::new(Vec::new()),
        }
    }

    fn cell(
        &self,
        component: NotificationComponent,
    ) -> &DebounceCell {
        match component {
            NotificationComponent::Storage => &self.storage,
            NotificationComponent::Performance => &self.performance,
            NotificationComponent::Health => &self.health,
        }
    }

    // Time-gated for repeats of the same status; CAS-protected for status
    // transitions, so at most one concurrent caller wins each transition.
    // Repeats of an ongoing condition still come through once per debounce
    // window.
    pub fn should_notify(
        &self,
        component: NotificationComponent,
        severity: NotificationSeverity,
        now_ns: i64,
    ) -> bool {
        let cell = self.cell(component);

        let last_status = cell.last_status.load(Ordering::Acquire);
        let status = severity.code();

        if status != last_status {
            let won = cell
                .last_status
                .compare_exchange(last_status, status, Ordering::AcqRel, Ordering::Acquire)
                .is_ok();
            if won {
                cell.last_time_ns.store(now_ns, Ordering::Release);
            }
            return won;
        }

        let last_time_ns = cell.last_time_ns.load(Ordering::Acquire);
        if now_ns.saturating_sub(last_time_ns) < self.debounce.as_nanos() as i64 {
            return false;
        }
        cell.last_time_ns
            .compare_exchange(last_time_ns, now_ns, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<HealthNotification> {
        let (sender, receiver) = mpsc::unbounded();
        self.subscribers.lock().push(sender);
        receiver
    }
    fn broadcast(
        &self,
        notification: HealthNotification,
    ) {
        log::info!(
            "{}: {} {}: {}",
            self,
            notification.component,
            notification.status,
            notification.message
        );
        self.subscribers
            .lock()
            .retain(|subscriber| subscriber.unbounded_send(notification.clone()).is_ok());
    }

    pub fn notify(
        &self,
        component: NotificationComponent,
        severity: NotificationSeverity,
        status: &str,
        message: String,
        payload: serde_json::Value,
    ) -> bool {
        let now = Utc::now();
        let now_ns = now.timestamp_nanos_opt().unwrap_or_default();
        if !self.should_notify(component, severity, now_ns) {
            return false;
        }

        self.broadcast(HealthNotification {
            component: component.as_str(),
            severity,
            status: status.to_owned(),
            message,
            timestamp: now,
            payload,
        });
        true
    }

    pub fn check_storage_thresholds(
        &self,
        storage: &StorageInfo,
        config: &HealthConfig,
    ) -> bool {
        let (severity, status, threshold) =
            if storage.usage_percentage >= config.storage_block_percent {
                (
                    NotificationSeverity::Critical,
                    "storage_critical",
                    config.storage_block_percent,
                )
            } else if storage.usage_percentage >= config.storage_warn_percent {
                (
                    NotificationSeverity::Warning,
                    "storage_warning",
                    config.storage_warn_percent,
                )
            } else {
                (NotificationSeverity::Normal, "storage_normal", 0.0)
            };

        self.notify(
            NotificationComponent::Storage,
            severity,
            status,
            format!(
                "storage usage {:.1}% (threshold {:.1}%)",
                storage.usage_percentage, threshold
            ),
            serde_json::json!({
                "usage_percentage": storage.usage_percentage,
                "threshold": threshold,
                "available_space": storage.available_space,
                "total_space": storage.total_space,
                "severity": severity,
                "reason": status,
            }),
        )
    }

    pub fn check_performance_thresholds(
        &self,
        metrics: &PerformanceMetrics,
        config: &HealthConfig,
    ) -> bool {
        // each offending metric keeps its own status label; the family's
        // debounce cell is shared
        let mut offending: Vec<&'static str> = Vec::new();
        if metrics.memory_percent >= config.memory_warn_percent {
            offending.push("memory_pressure");
        }
        if metrics.error_rate >= config.error_rate_warn {
            offending.push("high_error_rate");
        }
        if metrics.average_response_time_seconds >= config.response_time_warn.as_secs_f64() {
            offending.push("slow_response_time");
        }
        if metrics.active_connections >= config.active_connections_warn {
            offending.push("connection_overload");
        }
        if metrics.task_count >= config.task_count_warn {
            offending.push("task_leak_warning");
        }

        let (severity, status) = match offending.first() {
            Some(first) => (NotificationSeverity::Warning, *first),
            None => (NotificationSeverity::Normal, "performance_normal"),
        };

        self.notify(
            NotificationComponent::Performance,
            severity,
            status,
            format!("performance status: {}", offending.join(", ")),
            serde_json::json!({
                "offending": offending,
                "metrics": metrics,
            }),
        )
    }

    // Health family notifications are forwarded verbatim from the monitor.
    pub fn forward_health_status(
        &self,
        status: &str,
        message: String,
    ) -> bool {
        self.notify(
            NotificationComponent::Health,
            NotificationSeverity::from_status(status),
            status,
            message,
            serde_json::Value::Null,
        )
    }
}
impl fmt::Display for HealthNotificationManager {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "HealthNotificationManager")
    }
}
