//! Error types for the deployment daemon

use std::time::Duration;

use thiserror::Error;

/// Main error type for dropletd.
///
/// Every variant is fatal for the deployment that produced it. Certificate
/// problems are deliberately absent: they are reported as
/// [`CertificateOutcome`](crate::deploy::certs::CertificateOutcome) values and
/// never abort a pipeline.
#[derive(Error, Debug)]
pub enum DeployError {
    #[error("Source error: {0}")]
    Source(String),

    #[error("Build error: {0}")]
    Build(String),

    #[error("Artifact missing: {0}")]
    ArtifactMissing(String),

    #[error("Proxy configuration error: {0}")]
    ProxyConfig(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Command `{command}` failed: {reason}")]
    CommandFailed { command: String, reason: String },

    #[error("Command `{command}` timed out after {}s", .duration.as_secs())]
    Timeout { command: String, duration: Duration },

    #[error("Deployment canceled")]
    Canceled,

    #[error("Invalid site: {0}")]
    InvalidSite(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Shutdown error: {0}")]
    Shutdown(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DeployError {
    /// Whether the error comes from the deployment's cancellation signal
    pub fn is_canceled(&self) -> bool {
        matches!(self, DeployError::Canceled)
    }

    /// Rewrap command failures (non-zero exit, spawn failure) into the taxonomy
    /// of the step that ran them. Timeouts and cancellation pass through.
    pub fn within(self, wrap: fn(String) -> DeployError) -> DeployError {
        match self {
            DeployError::Timeout { .. } | DeployError::Canceled => self,
            DeployError::CommandFailed { .. } | DeployError::Io(_) => wrap(self.to_string()),
            other => other,
        }
    }
}
