use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

// Durations cross the wire in the gateway's own notation ("10s", "500ms").
pub fn wire_duration(duration: Duration) -> String {
    if duration.subsec_millis() != 0 {
        format!("{}ms", duration.as_millis())
    } else {
        format!("{}s", duration.as_secs())
    }
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
#[serde(rename_all = "camelCase")]
pub struct PathList {
    pub item_count: u64,
    pub page_count: u64,
    pub items: Vec<Path>,
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
#[serde(rename_all = "camelCase")]
pub struct PathSource {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub id: String,
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
#[serde(rename_all = "camelCase")]
pub struct PathReader {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub id: String,
}

// Runtime view of a named route on the gateway.
#[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Path {
    pub name: String,
    #[serde(default)]
    pub conf_name: Option<String>,
    #[serde(default)]
    pub source: Option<PathSource>,
    #[serde(default)]
    pub ready: bool,
    #[serde(default)]
    pub ready_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tracks: Vec<String>,
    #[serde(default)]
    pub bytes_received: u64,
    #[serde(default)]
    pub bytes_sent: u64,
    #[serde(default)]
    pub readers: Vec<PathReader>,
}

// Write-only path configuration pushed toward the gateway. Unset fields are
// skipped so a PATCH only touches what it names.
#[derive(Serialize, Deserialize, Clone, PartialEq, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct PathConf {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_on_demand: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_on_demand_start_timeout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_on_demand_close_after: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_on_demand: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_on_demand_restart: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_on_demand_start_timeout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_on_demand_close_after: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub publish_user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub publish_pass: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_pass: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub record: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_part_duration: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_segment_duration: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_delete_after: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
pub struct NamedPathConf {
    pub name: String,
    #[serde(flatten)]
    pub conf: PathConf,
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
#[serde(rename_all = "camelCase")]
pub struct PathConfList {
    pub item_count: u64,
    pub page_count: u64,
    pub items: Vec<NamedPathConf>,
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct GlobalConfPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record_format: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
#[serde(rename_all = "camelCase")]
pub struct RtspConnList {
    pub item_count: u64,
    pub page_count: u64,
    pub items: Vec<RtspConn>,
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
#[serde(rename_all = "camelCase")]
pub struct RtspConn {
    pub id: String,
    #[serde(default)]
    pub created: Option<DateTime<Utc>>,
    #[serde(default)]
    pub remote_addr: String,
    #[serde(default)]
    pub bytes_received: u64,
    #[serde(default)]
    pub bytes_sent: u64,
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
#[serde(rename_all = "camelCase")]
pub struct RtspSessionList {
    pub item_count: u64,
    pub page_count: u64,
    pub items: Vec<RtspSession>,
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
#[serde(rename_all = "camelCase")]
pub struct RtspSession {
    pub id: String,
    #[serde(default)]
    pub created: Option<DateTime<Utc>>,
    #[serde(default)]
    pub remote_addr: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub transport: Option<String>,
    #[serde(default)]
    pub bytes_received: u64,
    #[serde(default)]
    pub bytes_sent: u64,
}
