//! Spool directory worker
//!
//! Polls a directory for deployment requests dropped in by the control plane:
//!
//! - `<id>.json` a `DeploymentRequest`, claimed by renaming it to
//!   `<id>.claimed.json`
//! - `<id>.status.json` a `DeploymentState`: `queued` once claimed,
//!   `building` when a deployer slot picks it up, then the final status
//! - `<id>.log` transcript lines, appended as they happen
//! - `<id>.port` a port allocated for a backend
//! - `<id>.result.json` the final `DeploymentReport`
//! - `<id>.cancel` created by the control plane to cancel `<id>`

use std::collections::HashMap;
use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use deploy_api::{DeploymentReport, DeploymentRequest, DeploymentState, DeploymentStatus};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::deploy::context::DeploymentObserver;
use crate::errors::DeployError;
use crate::filesys::dir::Dir;
use crate::models::deployment::{DeploymentResult, DEFAULT_COMMIT_MESSAGE};
use crate::models::site::SiteSpec;
use crate::workers::deployer::DeploymentJob;

const REQUEST_EXT: &str = ".json";
const CLAIMED_EXT: &str = ".claimed.json";
const RESULT_EXT: &str = ".result.json";
const STATUS_EXT: &str = ".status.json";

type InFlight = Arc<Mutex<HashMap<String, CancellationToken>>>;

/// Spool worker options
#[derive(Debug, Clone)]
pub struct Options {
    /// Directory to watch
    pub spool_dir: PathBuf,

    /// Polling interval
    pub interval: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            spool_dir: PathBuf::from("/opt/dropletd/spool"),
            interval: Duration::from_secs(2),
        }
    }
}

/// Files belonging to one request
#[derive(Debug, Clone)]
pub struct SpoolEntry {
    dir: PathBuf,
    id: String,
}

impl SpoolEntry {
    pub fn new(dir: impl Into<PathBuf>, id: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            id: id.into(),
        }
    }

    fn path(&self, ext: &str) -> PathBuf {
        self.dir.join(format!("{}{}", self.id, ext))
    }

    pub fn request(&self) -> PathBuf {
        self.path(REQUEST_EXT)
    }

    pub fn claimed(&self) -> PathBuf {
        self.path(CLAIMED_EXT)
    }

    pub fn status(&self) -> PathBuf {
        self.path(STATUS_EXT)
    }

    pub fn log(&self) -> PathBuf {
        self.path(".log")
    }

    pub fn port(&self) -> PathBuf {
        self.path(".port")
    }

    pub fn result(&self) -> PathBuf {
        self.path(RESULT_EXT)
    }

    pub fn cancel(&self) -> PathBuf {
        self.path(".cancel")
    }
}

/// Request id of a spool file name, if it is an unclaimed request
fn request_id(file_name: &str) -> Option<&str> {
    if [CLAIMED_EXT, RESULT_EXT, STATUS_EXT]
        .iter()
        .any(|ext| file_name.ends_with(ext))
    {
        return None;
    }
    file_name
        .strip_suffix(REQUEST_EXT)
        .filter(|id| !id.is_empty() && !id.starts_with('.'))
}

/// Run the spool worker
pub async fn run<S, F>(
    options: &Options,
    jobs: mpsc::Sender<DeploymentJob>,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!("Spool worker starting...");

    let spool = Dir::new(options.spool_dir.clone());
    if let Err(e) = spool.create().await {
        error!("Unable to create spool directory {}: {}", spool.path().display(), e);
        return;
    }
    if let Err(e) = recover_interrupted(&spool).await {
        warn!("Unable to recover interrupted deployments: {}", e);
    }

    let in_flight: InFlight = Arc::new(Mutex::new(HashMap::new()));

    loop {
        if let Err(e) = poll_once(&spool, &jobs, &in_flight).await {
            error!("Spool poll failed: {}", e);
        }

        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Spool worker shutting down...");
                return;
            }
            _ = sleep_fn(options.interval) => {
                // Continue with poll
            }
        }
    }
}

/// Claim new requests and forward cancellations
pub async fn poll_once(
    spool: &Dir,
    jobs: &mpsc::Sender<DeploymentJob>,
    in_flight: &InFlight,
) -> Result<(), DeployError> {
    for path in spool.list_files().await? {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(id) = request_id(name) else {
            continue;
        };
        let entry = SpoolEntry::new(spool.path(), id);
        if let Err(e) = claim(&entry, jobs, in_flight).await {
            error!(id = %entry.id, "Unable to claim deployment request: {}", e);
        }
    }

    let active: Vec<(String, CancellationToken)> = {
        let in_flight = in_flight.lock().unwrap_or_else(|e| e.into_inner());
        in_flight.iter().map(|(id, t)| (id.clone(), t.clone())).collect()
    };
    for (id, token) in active {
        let entry = SpoolEntry::new(spool.path(), id);
        if entry.cancel().exists() && !token.is_cancelled() {
            info!(id = %entry.id, "Cancel requested");
            token.cancel();
        }
    }
    Ok(())
}

async fn claim(
    entry: &SpoolEntry,
    jobs: &mpsc::Sender<DeploymentJob>,
    in_flight: &InFlight,
) -> Result<(), DeployError> {
    tokio::fs::rename(entry.request(), entry.claimed()).await?;
    debug!(id = %entry.id, "Claimed deployment request");

    let contents = tokio::fs::read_to_string(entry.claimed()).await?;
    let request: DeploymentRequest = match serde_json::from_str(&contents) {
        Ok(request) => request,
        Err(e) => {
            write_rejection(entry, &format!("Malformed deployment request: {}", e));
            return Ok(());
        }
    };

    write_state(entry, &request.deployment_id, DeploymentStatus::Queued, None, None);

    let log = match open_log(&entry.log()) {
        Ok(file) => Some(file),
        Err(e) => {
            warn!(id = %entry.id, "Unable to open spool log: {}", e);
            None
        }
    };

    let cancel = CancellationToken::new();
    if entry.cancel().exists() {
        cancel.cancel();
    }
    {
        let mut in_flight = in_flight.lock().unwrap_or_else(|e| e.into_inner());
        in_flight.insert(entry.id.clone(), cancel.clone());
    }

    let observer = Arc::new(SpoolObserver {
        entry: entry.clone(),
        deployment_id: request.deployment_id.clone(),
        in_flight: in_flight.clone(),
        log: Mutex::new(log),
        started_at: Mutex::new(None),
    });
    let job = DeploymentJob {
        site: SiteSpec::from(request),
        cancel,
        observer,
    };

    if jobs.send(job).await.is_err() {
        return Err(DeployError::Internal("deployer worker is gone".to_string()));
    }
    Ok(())
}

/// Claimed requests without a result were interrupted by a daemon restart
async fn recover_interrupted(spool: &Dir) -> Result<(), DeployError> {
    for path in spool.list_files().await? {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(id) = name.strip_suffix(CLAIMED_EXT) else {
            continue;
        };
        let entry = SpoolEntry::new(spool.path(), id);
        if !entry.result().exists() {
            warn!(id = %id, "Deployment interrupted by restart");
            write_rejection(&entry, "Deployment interrupted by daemon restart");
        }
    }
    Ok(())
}

fn write_rejection(entry: &SpoolEntry, message: &str) {
    let report = DeploymentReport {
        deployment_id: entry.id.clone(),
        status: DeploymentStatus::Failed,
        duration: "0s".to_string(),
        build_log: format!("❌ Deploy failed: {}", message),
        message: DEFAULT_COMMIT_MESSAGE.to_string(),
        port: None,
        error: Some(message.to_string()),
        completed_at: Utc::now(),
    };
    write_state(
        entry,
        &entry.id,
        DeploymentStatus::Failed,
        None,
        Some(report.completed_at),
    );
    write_json(&entry.result(), &report);
}

fn write_state(
    entry: &SpoolEntry,
    deployment_id: &str,
    status: DeploymentStatus,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
) {
    let state = DeploymentState {
        deployment_id: deployment_id.to_string(),
        status,
        started_at,
        completed_at,
    };
    write_json(&entry.status(), &state);
}

fn open_log(path: &Path) -> std::io::Result<std::fs::File> {
    std::fs::OpenOptions::new().create(true).append(true).open(path)
}

/// Replace `path` by rename so readers never see a partial document
fn write_json<T: Serialize>(path: &Path, value: &T) {
    let written = serde_json::to_vec_pretty(value)
        .map_err(DeployError::from)
        .and_then(|bytes| {
            let tmp = path.with_extension("tmp");
            std::fs::write(&tmp, bytes)?;
            std::fs::rename(&tmp, path)?;
            Ok(())
        });
    if let Err(e) = written {
        error!("Unable to write {}: {}", path.display(), e);
    }
}

/// Mirrors one deployment into its spool files
struct SpoolObserver {
    entry: SpoolEntry,
    deployment_id: String,
    in_flight: InFlight,
    /// Transcript file, held open for the whole deployment
    log: Mutex<Option<std::fs::File>>,
    started_at: Mutex<Option<DateTime<Utc>>>,
}

impl DeploymentObserver for SpoolObserver {
    fn on_started(&self) {
        let started_at = Utc::now();
        *self.started_at.lock().unwrap_or_else(|e| e.into_inner()) = Some(started_at);
        write_state(
            &self.entry,
            &self.deployment_id,
            DeploymentStatus::Building,
            Some(started_at),
            None,
        );
    }

    fn on_log(&self, line: &str) {
        let mut log = self.log.lock().unwrap_or_else(|e| e.into_inner());
        if log.is_none() {
            *log = open_log(&self.entry.log()).ok();
        }
        let appended = match log.as_mut() {
            Some(file) => writeln!(file, "{}", line),
            None => Err(std::io::Error::other("log file unavailable")),
        };
        if let Err(e) = appended {
            warn!(id = %self.entry.id, "Unable to append to spool log: {}", e);
        }
    }

    fn on_port_assigned(&self, port: u16) {
        if let Err(e) = std::fs::write(self.entry.port(), port.to_string()) {
            warn!(id = %self.entry.id, "Unable to record port: {}", e);
        }
    }

    fn on_finished(&self, result: &DeploymentResult) {
        let report = result.to_report(&self.deployment_id);
        let started_at = *self.started_at.lock().unwrap_or_else(|e| e.into_inner());
        write_state(
            &self.entry,
            &self.deployment_id,
            report.status,
            started_at,
            Some(report.completed_at),
        );
        write_json(&self.entry.result(), &report);
        self.log.lock().unwrap_or_else(|e| e.into_inner()).take();
        let _ = std::fs::remove_file(self.entry.cancel());
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        in_flight.remove(&self.entry.id);
    }
}
