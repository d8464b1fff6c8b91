//! Deployment models

use std::time::Duration;

use chrono::Utc;
use deploy_api::{DeploymentReport, DeploymentStatus};
use serde::{Deserialize, Serialize};

/// Commit subject reported when the real one cannot be read
pub const DEFAULT_COMMIT_MESSAGE: &str = "Manual deployment";

/// How a deployment ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentOutcome {
    Succeeded,
    Failed,
    Canceled,
}

/// Output of one deployment, produced exactly once per pipeline run
#[derive(Debug, Clone)]
pub struct DeploymentResult {
    pub outcome: DeploymentOutcome,

    /// `true` only for [`DeploymentOutcome::Succeeded`]
    pub success: bool,

    /// Wall-clock duration
    pub duration: Duration,

    /// Full transcript, one line per log append
    pub log: String,

    /// Latest commit subject, or [`DEFAULT_COMMIT_MESSAGE`]
    pub commit_message: String,

    /// Port the backend process listens on, when one was started
    pub port: Option<u16>,

    /// Fatal error message, if any
    pub error: Option<String>,
}

impl DeploymentResult {
    /// Duration formatted for display
    pub fn duration_display(&self) -> String {
        crate::utils::format_duration(self.duration)
    }

    /// Convert into the report written back to the queue
    pub fn to_report(&self, deployment_id: &str) -> DeploymentReport {
        DeploymentReport {
            deployment_id: deployment_id.to_string(),
            status: match self.outcome {
                DeploymentOutcome::Succeeded => DeploymentStatus::Success,
                DeploymentOutcome::Failed => DeploymentStatus::Failed,
                DeploymentOutcome::Canceled => DeploymentStatus::Canceled,
            },
            duration: self.duration_display(),
            build_log: self.log.clone(),
            message: self.commit_message.clone(),
            port: self.port,
            error: self.error.clone(),
            completed_at: Utc::now(),
        }
    }
}
