//! Deployment worker
//!
//! Receives jobs over a channel and runs each one as its own task. A
//! semaphore bounds how many pipelines run at once; deployments of the same
//! domain are additionally serialized by the pipeline itself.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::deploy::context::DeploymentObserver;
use crate::deploy::pipeline::Pipeline;
use crate::models::site::SiteSpec;

/// Deployer worker options
#[derive(Debug, Clone)]
pub struct Options {
    /// Pipelines allowed to run at the same time
    pub max_concurrent: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self { max_concurrent: 4 }
    }
}

/// One queued deployment
pub struct DeploymentJob {
    pub site: SiteSpec,
    pub cancel: CancellationToken,
    pub observer: Arc<dyn DeploymentObserver>,
}

/// Run the deployer worker until shutdown or until every sender is gone.
/// On shutdown, in-flight deployments are canceled and awaited.
pub async fn run(
    options: &Options,
    pipeline: Arc<Pipeline>,
    mut jobs: mpsc::Receiver<DeploymentJob>,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) {
    info!("Deployer worker starting...");

    let semaphore = Arc::new(Semaphore::new(options.max_concurrent.max(1)));
    let mut in_flight: Vec<(CancellationToken, JoinHandle<()>)> = Vec::new();

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Deployer worker shutting down...");
                break;
            }
            job = jobs.recv() => {
                let Some(job) = job else {
                    debug!("Job channel closed");
                    break;
                };
                in_flight.retain(|(_, handle)| !handle.is_finished());
                let cancel = job.cancel.clone();
                let handle = spawn_job(job, pipeline.clone(), semaphore.clone());
                in_flight.push((cancel, handle));
            }
        }
    }

    let pending: Vec<JoinHandle<()>> = in_flight
        .into_iter()
        .filter(|(_, handle)| !handle.is_finished())
        .map(|(cancel, handle)| {
            cancel.cancel();
            handle
        })
        .collect();
    if !pending.is_empty() {
        info!(count = pending.len(), "Canceling in-flight deployments...");
    }
    for result in futures::future::join_all(pending).await {
        if let Err(e) = result {
            warn!(error = %e, "deployment task ended abnormally");
        }
    }
}

fn spawn_job(job: DeploymentJob, pipeline: Arc<Pipeline>, semaphore: Arc<Semaphore>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let DeploymentJob {
            site,
            cancel,
            observer,
        } = job;

        // A job canceled while queued still runs, so that it reports a
        // canceled result without touching the host.
        let _permit = tokio::select! {
            permit = semaphore.acquire_owned() => permit.ok(),
            _ = cancel.cancelled() => None,
        };

        info!(site = %site.name, domain = %site.domain, "Starting deployment");
        observer.on_started();
        let result = pipeline.deploy(&site, cancel, observer).await;
        info!(
            site = %site.name,
            outcome = ?result.outcome,
            duration = %result.duration_display(),
            "Deployment finished"
        );
    })
}
