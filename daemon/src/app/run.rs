//! Main application run loop

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::app::options::{AppOptions, LifecycleOptions};
use crate::deploy::pipeline::Pipeline;
use crate::errors::DeployError;
use crate::workers::deployer::{self, DeploymentJob};
use crate::workers::spool;

/// Run the deployment daemon until `shutdown_signal` resolves
pub async fn run(
    version: String,
    options: AppOptions,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(), DeployError> {
    info!("Initializing dropletd {}...", version);

    // Create shutdown channel
    let (shutdown_tx, _shutdown_rx): (broadcast::Sender<()>, _) = broadcast::channel(1);
    let mut shutdown_manager = ShutdownManager::new(shutdown_tx.clone(), options.lifecycle.clone());

    let jobs = match init(&options, shutdown_tx.clone(), &mut shutdown_manager).await {
        Ok(jobs) => jobs,
        Err(e) => {
            error!("Failed to start dropletd: {}", e);
            shutdown_manager.shutdown().await?;
            return Err(e);
        }
    };

    shutdown_signal.await;
    info!("Shutdown signal received, shutting down...");

    // Shutdown
    drop(jobs);
    drop(shutdown_tx);
    shutdown_manager.shutdown().await
}

// =============================== INITIALIZATION ================================== //

async fn init(
    options: &AppOptions,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_manager: &mut ShutdownManager,
) -> Result<mpsc::Sender<DeploymentJob>, DeployError> {
    let pipeline = Arc::new(Pipeline::from_settings(&options.settings)?);
    let (jobs_tx, jobs_rx) = mpsc::channel(options.lifecycle.job_queue_capacity.max(1));

    init_deployer_worker(
        options.deployer.clone(),
        pipeline,
        jobs_rx,
        shutdown_manager,
        shutdown_tx.subscribe(),
    )
    .await?;

    if options.enable_spool_worker {
        init_spool_worker(
            options.spool.clone(),
            jobs_tx.clone(),
            shutdown_manager,
            shutdown_tx.subscribe(),
        )
        .await?;
    }

    Ok(jobs_tx)
}

async fn init_deployer_worker(
    options: deployer::Options,
    pipeline: Arc<Pipeline>,
    jobs: mpsc::Receiver<DeploymentJob>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DeployError> {
    info!("Initializing deployer worker...");

    let deployer_handle = tokio::spawn(async move {
        deployer::run(
            &options,
            pipeline,
            jobs,
            Box::pin(async move {
                let _ = shutdown_rx.recv().await;
            }),
        )
        .await;
    });

    shutdown_manager.with_deployer_worker_handle(deployer_handle)?;
    Ok(())
}

async fn init_spool_worker(
    options: spool::Options,
    jobs: mpsc::Sender<DeploymentJob>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DeployError> {
    info!("Initializing spool worker on {}...", options.spool_dir.display());

    let spool_handle = tokio::spawn(async move {
        spool::run(
            &options,
            jobs,
            tokio::time::sleep,
            Box::pin(async move {
                let _ = shutdown_rx.recv().await;
            }),
        )
        .await;
    });

    shutdown_manager.with_spool_worker_handle(spool_handle)?;
    Ok(())
}

// ================================= SHUTDOWN ===================================== //

struct ShutdownManager {
    shutdown_tx: broadcast::Sender<()>,
    lifecycle_options: LifecycleOptions,
    spool_worker_handle: Option<JoinHandle<()>>,
    deployer_worker_handle: Option<JoinHandle<()>>,
}

impl ShutdownManager {
    pub fn new(shutdown_tx: broadcast::Sender<()>, lifecycle_options: LifecycleOptions) -> Self {
        Self {
            shutdown_tx,
            lifecycle_options,
            spool_worker_handle: None,
            deployer_worker_handle: None,
        }
    }

    pub fn with_spool_worker_handle(&mut self, handle: JoinHandle<()>) -> Result<(), DeployError> {
        if self.spool_worker_handle.is_some() {
            return Err(DeployError::Shutdown("spool_handle already set".to_string()));
        }
        self.spool_worker_handle = Some(handle);
        Ok(())
    }

    pub fn with_deployer_worker_handle(&mut self, handle: JoinHandle<()>) -> Result<(), DeployError> {
        if self.deployer_worker_handle.is_some() {
            return Err(DeployError::Shutdown("deployer_handle already set".to_string()));
        }
        self.deployer_worker_handle = Some(handle);
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), DeployError> {
        let _ = self.shutdown_tx.send(());

        match tokio::time::timeout(
            self.lifecycle_options.max_shutdown_delay,
            self.shutdown_impl(),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                error!(
                    "Shutdown timed out after {:?}, forcing shutdown...",
                    self.lifecycle_options.max_shutdown_delay
                );
                std::process::exit(1);
            }
        }
    }

    async fn shutdown_impl(&mut self) -> Result<(), DeployError> {
        info!("Shutting down dropletd...");

        // 1. Spool worker, so nothing new gets claimed
        if let Some(handle) = self.spool_worker_handle.take() {
            handle.await.map_err(|e| DeployError::Shutdown(e.to_string()))?;
        }

        // 2. Deployer worker, cancels and waits for in-flight deployments
        if let Some(handle) = self.deployer_worker_handle.take() {
            handle.await.map_err(|e| DeployError::Shutdown(e.to_string()))?;
        }

        info!("Shutdown complete");
        Ok(())
    }
}
