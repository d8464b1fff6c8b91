//! Per-deployment execution context: transcript, progress, cancellation

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::errors::DeployError;
use crate::models::deployment::DeploymentResult;

/// Number of progress units a pipeline run is divided into
pub const TOTAL_STEPS: u8 = 7;

const REDACTED: &str = "***";

/// Receives everything a live viewer of a deployment needs.
///
/// Callbacks are invoked synchronously from the pipeline, in the order the
/// pipeline produced them, so implementations should return quickly.
pub trait DeploymentObserver: Send + Sync {
    /// The deployment left the queue and its pipeline is starting
    fn on_started(&self) {}

    /// A transcript line was appended
    fn on_log(&self, line: &str);

    /// Progress moved to `completed` out of `total` units
    fn on_progress(&self, _completed: u8, _total: u8) {}

    /// A port was allocated for a backend that did not have one
    fn on_port_assigned(&self, _port: u16) {}

    /// The deployment finished
    fn on_finished(&self, _result: &DeploymentResult) {}
}

/// Observer that ignores everything
pub struct NoopObserver;

impl DeploymentObserver for NoopObserver {
    fn on_log(&self, _line: &str) {}
}

/// Mutable state owned by exactly one in-flight deployment
pub struct ExecutionContext {
    site_name: String,
    lines: Mutex<Vec<String>>,
    secrets: Vec<String>,
    step: AtomicU8,
    cancel: CancellationToken,
    observer: Arc<dyn DeploymentObserver>,
}

impl ExecutionContext {
    pub fn new(
        site_name: impl Into<String>,
        cancel: CancellationToken,
        observer: Arc<dyn DeploymentObserver>,
    ) -> Self {
        Self {
            site_name: site_name.into(),
            lines: Mutex::new(Vec::new()),
            secrets: Vec::new(),
            step: AtomicU8::new(0),
            cancel,
            observer,
        }
    }

    /// Context with no observer and a fresh cancellation token
    pub fn detached(site_name: impl Into<String>) -> Self {
        Self::new(site_name, CancellationToken::new(), Arc::new(NoopObserver))
    }

    /// Register a value that must never appear in the transcript
    pub fn with_secret(mut self, secret: &str) -> Self {
        if !secret.is_empty() {
            self.secrets.push(secret.to_string());
        }
        self
    }

    /// Append a line to the transcript and forward it to the observer before
    /// returning.
    pub fn log(&self, message: impl AsRef<str>) {
        let line = self.redact(message.as_ref());
        info!(site = %self.site_name, "{}", line);
        {
            let mut lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
            lines.push(line.clone());
        }
        self.observer.on_log(&line);
    }

    /// Replace every registered secret in `message`
    pub fn redact(&self, message: &str) -> String {
        let mut line = message.to_string();
        for secret in &self.secrets {
            if line.contains(secret.as_str()) {
                line = line.replace(secret.as_str(), REDACTED);
            }
        }
        line
    }

    /// Full transcript joined by newlines
    pub fn transcript(&self) -> String {
        let lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        lines.join("\n")
    }

    /// Snapshot of the transcript lines
    pub fn lines(&self) -> Vec<String> {
        let lines = self.lines.lock().unwrap_or_else(|e| e.into_inner());
        lines.clone()
    }

    /// Record progress and notify the observer when it changes
    pub fn set_step(&self, completed: u8) {
        let completed = completed.min(TOTAL_STEPS);
        if self.step.swap(completed, Ordering::SeqCst) != completed {
            self.observer.on_progress(completed, TOTAL_STEPS);
        }
    }

    pub fn observer(&self) -> &Arc<dyn DeploymentObserver> {
        &self.observer
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Fail with [`DeployError::Canceled`] once cancellation was requested
    pub fn check_canceled(&self) -> Result<(), DeployError> {
        if self.is_canceled() {
            return Err(DeployError::Canceled);
        }
        Ok(())
    }
}
