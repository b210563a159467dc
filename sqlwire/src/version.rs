//! Version information for sqlwire.

/// sqlwire version from Cargo.toml
pub const SQLWIRE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Version information reported by a running worker.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct VersionInfo {
    /// Version of the supervisor library.
    pub sqlwire: &'static str,
    /// Version the worker announced in its Ready frame, once known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,
}

impl Default for VersionInfo {
    fn default() -> Self {
        Self {
            sqlwire: SQLWIRE_VERSION,
            worker: None,
        }
    }
}

impl VersionInfo {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_worker(mut self, version: String) -> Self {
        self.worker = Some(version);
        self
    }

    /// Whether the worker runs the same build as this process.
    pub fn matches(&self) -> bool {
        self.worker.as_deref().is_none_or(|w| w == self.sqlwire)
    }
}
