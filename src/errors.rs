use crate::datatypes::device_path::DevicePath;
use chrono::{DateTime, Utc};
use std::{collections::HashMap, fmt, time::Duration};
use thiserror::Error;

#[derive(derive_more::Display, Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum ErrorCategory {
    #[display("system")]
    System,
    #[display("network")]
    Network,
    #[display("resource")]
    Resource,
    #[display("validation")]
    Validation,
    #[display("security")]
    Security,
    #[display("timeout")]
    Timeout,
    #[display("recovery")]
    Recovery,
}
impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Network => "network",
            Self::Resource => "resource",
            Self::Validation => "validation",
            Self::Security => "security",
            Self::Timeout => "timeout",
            Self::Recovery => "recovery",
        }
    }
}

#[derive(derive_more::Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum ErrorSeverity {
    #[display("low")]
    Low,
    #[display("medium")]
    Medium,
    #[display("high")]
    High,
    #[display("critical")]
    Critical,
}
impl ErrorSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

// Typed domain errors. Identity comparison goes by key fields, not by
// message text, so retries and recovery matching stay stable across
// message wording changes.

#[derive(Error, Clone, Debug)]
#[error("gateway operation {operation} failed with code {code}: {message}")]
pub struct GatewayError {
    pub operation: String,
    pub code: u16,
    pub message: String,
    pub details: Option<serde_json::Value>,
}
impl PartialEq for GatewayError {
    fn eq(
        &self,
        other: &Self,
    ) -> bool {
        self.operation == other.operation && self.code == other.code
    }
}
impl Eq for GatewayError {}

#[derive(Error, Clone, Debug)]
#[error("circuit breaker is {state}")]
pub struct CircuitBreakerError {
    pub state: String,
    pub retry_after: Option<Duration>,
}
impl PartialEq for CircuitBreakerError {
    fn eq(
        &self,
        other: &Self,
    ) -> bool {
        self.state == other.state
    }
}
impl Eq for CircuitBreakerError {}

#[derive(Error, Clone, Debug)]
#[error("stream operation {operation} failed for {device}: {message}")]
pub struct StreamError {
    pub device: DevicePath,
    pub operation: String,
    pub message: String,
}
impl PartialEq for StreamError {
    fn eq(
        &self,
        other: &Self,
    ) -> bool {
        self.device == other.device && self.operation == other.operation
    }
}
impl Eq for StreamError {}

#[derive(Error, Clone, Debug)]
#[error("path operation {operation} failed for {path}: {message}")]
pub struct PathError {
    pub path: String,
    pub operation: String,
    pub message: String,
}
impl PartialEq for PathError {
    fn eq(
        &self,
        other: &Self,
    ) -> bool {
        self.path == other.path && self.operation == other.operation
    }
}
impl Eq for PathError {}

#[derive(Error, Clone, Debug)]
#[error("recording operation {operation} failed for {device}: {message}")]
pub struct RecordingError {
    pub device: DevicePath,
    pub operation: String,
    pub message: String,
}
impl PartialEq for RecordingError {
    fn eq(
        &self,
        other: &Self,
    ) -> bool {
        self.device == other.device && self.operation == other.operation
    }
}
impl Eq for RecordingError {}

#[derive(Error, Clone, Debug)]
#[error("capture process failed (exit code {exit_code:?}): {stderr}")]
pub struct CaptureError {
    pub command: String,
    pub exit_code: Option<i32>,
    pub stderr: String,
}
impl PartialEq for CaptureError {
    fn eq(
        &self,
        other: &Self,
    ) -> bool {
        self.command == other.command && self.exit_code == other.exit_code
    }
}
impl Eq for CaptureError {}

#[derive(Error, Clone, PartialEq, Eq, Debug)]
#[error("configuration field {field} invalid: {message}")]
pub struct ConfigError {
    pub field: String,
    pub message: String,
}

// Façade error surface. Each kind carries a stable category string the
// outer RPC layer translates into numeric codes.
#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("controller is not running")]
    NotRunning,

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("{kind} already exists: {name}")]
    AlreadyExists { kind: &'static str, name: String },

    #[error("gateway unavailable: {0}")]
    GatewayUnavailable(#[from] GatewayError),

    #[error("gateway circuit breaker is open")]
    CircuitOpen,

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("policy violation: {0}")]
    PolicyViolation(String),

    #[error("configuration invalid: {0}")]
    ConfigInvalid(String),

    #[error("component not configured: {0}")]
    NotConfigured(&'static str),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}
impl ControllerError {
    pub fn category(&self) -> &'static str {
        match self {
            Self::NotRunning => "controller_not_running",
            Self::InvalidInput(_) => "invalid_input",
            Self::NotFound { .. } => "not_found",
            Self::AlreadyExists { .. } => "already_exists",
            Self::GatewayUnavailable(_) => "gateway_unavailable",
            Self::CircuitOpen => "circuit_open",
            Self::StorageUnavailable(_) => "storage_unavailable",
            Self::PolicyViolation(_) => "policy_violation",
            Self::ConfigInvalid(_) => "configuration_invalid",
            Self::NotConfigured(_) => "not_configured",
            Self::Internal(_) => "internal",
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Classification {
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    pub retryable: bool,
    pub recoverable: bool,
}

// First match wins: typed identity, then message substrings, then the
// system/medium default.
pub fn categorize(error: &anyhow::Error) -> Classification {
    if let Some(gateway_error) = error.downcast_ref::<GatewayError>() {
        return match gateway_error.code {
            408 => Classification {
                category: ErrorCategory::Timeout,
                severity: ErrorSeverity::Medium,
                retryable: true,
                recoverable: true,
            },
            404 => Classification {
                category: ErrorCategory::Resource,
                severity: ErrorSeverity::Low,
                retryable: false,
                recoverable: true,
            },
            409 => Classification {
                category: ErrorCategory::Resource,
                severity: ErrorSeverity::Low,
                retryable: false,
                recoverable: true,
            },
            401 | 403 => Classification {
                category: ErrorCategory::Security,
                severity: ErrorSeverity::High,
                retryable: false,
                recoverable: false,
            },
            code if code >= 500 => Classification {
                category: ErrorCategory::Network,
                severity: ErrorSeverity::High,
                retryable: true,
                recoverable: true,
            },
            _ => Classification {
                category: ErrorCategory::Network,
                severity: ErrorSeverity::Medium,
                retryable: false,
                recoverable: true,
            },
        };
    }
    if error.downcast_ref::<CircuitBreakerError>().is_some() {
        return Classification {
            category: ErrorCategory::Recovery,
            severity: ErrorSeverity::High,
            retryable: false,
            recoverable: true,
        };
    }
    if error.downcast_ref::<CaptureError>().is_some() {
        return Classification {
            category: ErrorCategory::System,
            severity: ErrorSeverity::Medium,
            retryable: true,
            recoverable: true,
        };
    }
    if error.downcast_ref::<ConfigError>().is_some() {
        return Classification {
            category: ErrorCategory::Validation,
            severity: ErrorSeverity::High,
            retryable: false,
            recoverable: false,
        };
    }
    if error.downcast_ref::<PathError>().is_some()
        || error.downcast_ref::<StreamError>().is_some()
        || error.downcast_ref::<RecordingError>().is_some()
    {
        return Classification {
            category: ErrorCategory::Network,
            severity: ErrorSeverity::Medium,
            retryable: true,
            recoverable: true,
        };
    }

    let message = format!("{error:#}").to_lowercase();
    if message.contains("timeout") || message.contains("timed out") {
        return Classification {
            category: ErrorCategory::Timeout,
            severity: ErrorSeverity::Medium,
            retryable: true,
            recoverable: true,
        };
    }
    if message.contains("not found") {
        return Classification {
            category: ErrorCategory::Resource,
            severity: ErrorSeverity::Low,
            retryable: false,
            recoverable: true,
        };
    }
    if message.contains("permission") {
        return Classification {
            category: ErrorCategory::Security,
            severity: ErrorSeverity::High,
            retryable: false,
            recoverable: false,
        };
    }
    if message.contains("network") || message.contains("connection") {
        return Classification {
            category: ErrorCategory::Network,
            severity: ErrorSeverity::Medium,
            retryable: true,
            recoverable: true,
        };
    }
    if message.contains("invalid") {
        return Classification {
            category: ErrorCategory::Validation,
            severity: ErrorSeverity::Low,
            retryable: false,
            recoverable: false,
        };
    }

    Classification {
        category: ErrorCategory::System,
        severity: ErrorSeverity::Medium,
        retryable: false,
        recoverable: true,
    }
}

// Base error enriched with classification, metadata and recovery hints.
#[derive(Debug)]
pub struct EnhancedError {
    pub base: anyhow::Error,
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    pub retryable: bool,
    pub recoverable: bool,
    pub metadata: HashMap<String, String>,
    pub timestamp: DateTime<Utc>,
    pub trace_id: Option<String>,
    pub suggested_recovery: Vec<String>,
}
impl EnhancedError {
    pub fn new(base: anyhow::Error) -> Self {
        let classification = categorize(&base);

        Self {
            base,
            category: classification.category,
            severity: classification.severity,
            retryable: classification.retryable,
            recoverable: classification.recoverable,
            metadata: HashMap::new(),
            timestamp: Utc::now(),
            trace_id: None,
            suggested_recovery: Vec::new(),
        }
    }

    pub fn with_metadata(
        mut self,
        key: &str,
        value: impl ToString,
    ) -> Self {
        self.metadata.insert(key.to_owned(), value.to_string());
        self
    }
    pub fn with_trace_id(
        mut self,
        trace_id: String,
    ) -> Self {
        self.trace_id = Some(trace_id);
        self
    }
    pub fn with_suggested_recovery(
        mut self,
        operation: &str,
    ) -> Self {
        self.suggested_recovery.push(operation.to_owned());
        self
    }
}
impl fmt::Display for EnhancedError {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "[{}/{}] {:#}", self.category, self.severity, self.base)
    }
}
impl std::error::Error for EnhancedError {}
