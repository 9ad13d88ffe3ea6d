use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{fmt, sync::LazyLock};

static CAMERA_ID_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^camera([0-9]+)$").unwrap());

// Externally visible camera identifier. Canonical form is `cameraN`; any
// other string is carried through opaquely (external RTSP sources reuse this
// type at the API boundary).
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Hash, Debug)]
#[serde(transparent)]
pub struct CameraId {
    inner: String,
}
impl CameraId {
    pub fn new(inner: String) -> Self {
        Self { inner }
    }
    pub fn from_index(index: usize) -> Self {
        Self {
            inner: format!("camera{index}"),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.inner
    }

    pub fn index(&self) -> Option<usize> {
        let captures = CAMERA_ID_PATTERN.captures(&self.inner)?;
        captures.get(1).unwrap().as_str().parse().ok()
    }
    pub fn is_canonical(&self) -> bool {
        CAMERA_ID_PATTERN.is_match(&self.inner)
    }
}
impl fmt::Display for CameraId {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(&self.inner)
    }
}
impl From<&str> for CameraId {
    fn from(inner: &str) -> Self {
        Self::new(inner.to_owned())
    }
}
