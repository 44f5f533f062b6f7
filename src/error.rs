//! Structured error types for the orchestrator core.
//!
//! Mirrors the error-kind table: each variant carries exactly what its
//! caller needs to decide a retry/backoff policy, never a bare string blob.

use std::fmt;

/// A single failed request to an upstream Radarr/Sonarr instance.
///
/// One variant covers every upstream failure mode; callers distinguish them
/// by inspecting `message`/`hint` rather than matching sub-types, mirroring
/// the original `ArrRequestError`.
#[derive(Debug, Clone)]
pub struct ArrRequestError {
    pub app: String,
    pub base_url: String,
    pub method: String,
    pub path: String,
    pub message: String,
    pub hint: Option<String>,
}

impl ArrRequestError {
    pub fn new(
        app: impl Into<String>,
        base_url: impl Into<String>,
        method: impl Into<String>,
        path: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            app: app.into(),
            base_url: base_url.into(),
            method: method.into(),
            path: path.into(),
            message: message.into(),
            hint: None,
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    /// Best-effort `host:port` extraction without pulling in a URL crate
    /// just for display formatting.
    fn host_port(&self) -> String {
        let without_scheme = self
            .base_url
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(&self.base_url);
        without_scheme
            .split(['/', '?'])
            .next()
            .unwrap_or(without_scheme)
            .to_string()
    }
}

impl fmt::Display for ArrRequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} request failed ({} {} {}): {}.",
            self.app,
            self.host_port(),
            self.method,
            self.path,
            self.message
        )?;
        if let Some(hint) = &self.hint {
            write!(f, " Hint: {hint}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ArrRequestError {}

/// Errors raised by the persistent store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("failed to serialize stats: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed YAML in config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

/// Top level error for the engine's orchestration of a single cycle.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("upstream unreachable: {0}")]
    UpstreamUnreachable(#[source] ArrRequestError),
    #[error("upstream returned an error status: {0}")]
    UpstreamHttp(#[source] ArrRequestError),
    #[error("upstream returned invalid JSON: {0}")]
    UpstreamBadJson(#[source] ArrRequestError),
    #[error("store failure: {0}")]
    Store(#[from] StoreError),
}

impl From<ArrRequestError> for EngineError {
    fn from(err: ArrRequestError) -> Self {
        // Classification by message shape, matching how arr.py produces these
        // three categories out of a single exception type.
        if err.message.starts_with("HTTP ") {
            EngineError::UpstreamHttp(err)
        } else if err.message.starts_with("Invalid JSON") {
            EngineError::UpstreamBadJson(err)
        } else {
            EngineError::UpstreamUnreachable(err)
        }
    }
}
