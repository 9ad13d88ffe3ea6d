use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{fmt, sync::LazyLock};

static DEVICE_PATH_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/dev/video([0-9]+)$").unwrap());

// Internal device identifier. Canonical form is `/dev/videoN` for local
// video devices; external sources use an opaque string (usually their RTSP
// URL) which is carried through unchanged.
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Hash, Debug)]
#[serde(transparent)]
pub struct DevicePath {
    inner: String,
}
impl DevicePath {
    pub fn new(inner: String) -> Self {
        Self { inner }
    }
    pub fn from_index(index: usize) -> Self {
        Self {
            inner: format!("/dev/video{index}"),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.inner
    }

    pub fn index(&self) -> Option<usize> {
        let captures = DEVICE_PATH_PATTERN.captures(&self.inner)?;
        captures.get(1).unwrap().as_str().parse().ok()
    }
    pub fn is_local(&self) -> bool {
        DEVICE_PATH_PATTERN.is_match(&self.inner)
    }

    // `video3` for `/dev/video3`, last path component otherwise. Used for
    // on-disk snapshot naming.
    pub fn file_stem(&self) -> String {
        self.inner
            .rsplit(['/', ':'])
            .next()
            .unwrap_or(&self.inner)
            .to_owned()
    }
}
impl fmt::Display for DevicePath {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(&self.inner)
    }
}
impl From<&str> for DevicePath {
    fn from(inner: &str) -> Self {
        Self::new(inner.to_owned())
    }
}
