//! Application configuration options

use std::time::Duration;

use crate::storage::settings::Settings;
use crate::workers::{deployer, spool};

/// Main application options
#[derive(Debug, Clone)]
pub struct AppOptions {
    /// Lifecycle configuration
    pub lifecycle: LifecycleOptions,

    /// Daemon settings the pipeline is built from
    pub settings: Settings,

    /// Enable the spool directory worker
    pub enable_spool_worker: bool,

    /// Deployer worker options
    pub deployer: deployer::Options,

    /// Spool worker options
    pub spool: spool::Options,
}

impl AppOptions {
    /// Options derived from the settings file
    pub fn from_settings(settings: Settings) -> Self {
        let deployer = deployer::Options {
            max_concurrent: settings.workers.max_concurrent_deployments,
        };
        let spool = spool::Options {
            spool_dir: settings.paths.spool_dir.clone(),
            interval: Duration::from_secs(settings.workers.spool_poll_interval_secs.max(1)),
        };
        Self {
            lifecycle: LifecycleOptions::default(),
            settings,
            enable_spool_worker: true,
            deployer,
            spool,
        }
    }
}

impl Default for AppOptions {
    fn default() -> Self {
        Self::from_settings(Settings::default())
    }
}

/// Lifecycle options for the daemon
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Maximum delay for graceful shutdown. In-flight deployments are
    /// canceled first, so this mostly covers process group teardown.
    pub max_shutdown_delay: Duration,

    /// Capacity of the job queue between the spool and the deployer
    pub job_queue_capacity: usize,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            max_shutdown_delay: Duration::from_secs(30),
            job_queue_capacity: 64,
        }
    }
}
