use crate::datatypes::{camera_id::CameraId, device_path::DevicePath};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;

#[derive(Serialize, Clone, Copy, PartialEq, Eq, Debug)]
#[serde(rename_all = "UPPERCASE")]
pub enum SessionStatus {
    Starting,
    Recording,
    Stopping,
    Stopped,
    Error,
}
impl SessionStatus {
    // Transitions are forward-only; any state may fall into Error.
    pub fn can_transition_to(
        self,
        next: Self,
    ) -> bool {
        if next == Self::Error {
            return true;
        }

        matches!(
            (self, next),
            (Self::Starting, Self::Recording)
                | (Self::Recording, Self::Stopping)
                | (Self::Stopping, Self::Stopped)
        )
    }
}

// Persistent continuity view of the session, kept alongside the lifecycle
// status so segment continuation survives rotation boundaries.
#[derive(Serialize, Clone, Copy, PartialEq, Eq, Debug)]
#[serde(rename_all = "lowercase")]
pub enum ContinuityState {
    Recording,
    Paused,
    Stopped,
    Error,
}

#[derive(Serialize, Clone, Debug)]
pub struct RecordingSession {
    pub id: String,
    pub device: CameraId,
    pub device_path: DevicePath,
    pub path: String,
    pub status: SessionStatus,
    pub state: ContinuityState,
    pub continuity_id: String,
    pub segments: Vec<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub duration_seconds: f64,
    pub file_size: u64,
    pub file_path: PathBuf,
    pub format: String,
}
impl RecordingSession {
    pub fn transition(
        &mut self,
        next: SessionStatus,
    ) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }

        self.status = next;
        self.state = match next {
            SessionStatus::Starting | SessionStatus::Recording => ContinuityState::Recording,
            SessionStatus::Stopping | SessionStatus::Stopped => ContinuityState::Stopped,
            SessionStatus::Error => ContinuityState::Error,
        };

        true
    }
}

// Lightweight projection keyed by DevicePath; at most one per device.
#[derive(Serialize, Clone, PartialEq, Debug)]
pub struct ActiveRecording {
    pub session_id: String,
    pub start_time: DateTime<Utc>,
    pub stream_name: String,
    pub status: SessionStatus,
}
