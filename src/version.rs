use serde::Serialize;

// Build-injected constants; the SERVICE_* environment variables override
// them at runtime for introspection.
const VERSION: &str = env!("CARGO_PKG_VERSION");
const BUILD_DATE: Option<&str> = option_env!("BUILD_DATE");
const GIT_COMMIT: Option<&str> = option_env!("GIT_COMMIT");

#[derive(Serialize, Clone, PartialEq, Eq, Debug)]
pub struct VersionInfo {
    pub version: String,
    pub build_date: String,
    pub git_commit: String,
}
impl VersionInfo {
    pub fn collect() -> Self {
        let version =
            std::env::var("SERVICE_VERSION").unwrap_or_else(|_| VERSION.to_owned());
        let build_date = std::env::var("SERVICE_BUILD_DATE")
            .unwrap_or_else(|_| BUILD_DATE.unwrap_or("unknown").to_owned());
        let git_commit = std::env::var("SERVICE_GIT_COMMIT")
            .unwrap_or_else(|_| GIT_COMMIT.unwrap_or("unknown").to_owned());

        Self {
            version,
            build_date,
            git_commit,
        }
    }
}
