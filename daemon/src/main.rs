//! dropletd - Entry Point
//!
//! Push-to-deploy host daemon. Picks deployment requests up from the spool
//! directory, or runs a single request in the foreground with `--deploy`.

use std::collections::HashMap;
use std::env;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use colored::Colorize;
use deploy_api::DeploymentRequest;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use dropletd::app::options::AppOptions;
use dropletd::app::run::run;
use dropletd::deploy::context::DeploymentObserver;
use dropletd::deploy::pipeline::Pipeline;
use dropletd::filesys::file::File;
use dropletd::logs::{init_logging, LogOptions};
use dropletd::models::deployment::{DeploymentOutcome, DeploymentResult};
use dropletd::models::site::SiteSpec;
use dropletd::storage::layout::StorageLayout;
use dropletd::storage::settings::Settings;
use dropletd::utils::version_info;

#[tokio::main]
async fn main() {
    // Parse command line arguments
    let args: Vec<String> = env::args().collect();
    let mut cli_args: HashMap<String, String> = HashMap::new();

    for arg in args.iter().skip(1) {
        if let Some((key, value)) = arg.split_once('=') {
            // Handle --key=value format
            let clean_key = key.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), value.to_string());
        } else if arg.starts_with("--") {
            // Handle standalone flags like --version
            let clean_key = arg.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), "true".to_string());
        }
    }

    // Print version and exit
    let version = version_info();
    if cli_args.contains_key("version") {
        match serde_json::to_string_pretty(&version) {
            Ok(json) => println!("{}", json),
            Err(_) => println!("{}", version.version),
        }
        return;
    }

    // Environment overrides such as RUST_LOG may live in a local .env file
    dotenvy::dotenv().ok();

    // Retrieve the settings file
    let settings_file = match cli_args.get("config") {
        Some(path) => File::new(path),
        None => StorageLayout::default().settings_file(),
    };
    let mut settings = match Settings::load(&settings_file).await {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Unable to read settings file: {}", e);
            std::process::exit(1);
        }
    };
    if let Some(level) = cli_args.get("log-level") {
        match level.parse() {
            Ok(level) => settings.log_level = level,
            Err(e) => {
                eprintln!("{}", e);
                std::process::exit(1);
            }
        }
    }

    // Initialize logging
    let log_options = LogOptions {
        log_level: settings.log_level,
        file: settings.log_to_file,
        log_dir: settings.paths.logs_dir().path().to_path_buf(),
        json_format: settings.log_json,
        ..Default::default()
    };
    let _log_guard = match init_logging(log_options) {
        Ok(guard) => guard,
        Err(e) => {
            println!("Failed to initialize logging: {e}");
            None
        }
    };

    // Deploy a single request in the foreground
    if let Some(request_file) = cli_args.get("deploy") {
        let succeeded = match deploy_once(&settings, Path::new(request_file)).await {
            Ok(succeeded) => succeeded,
            Err(e) => {
                eprintln!("{} {:#}", "error:".red().bold(), e);
                false
            }
        };
        if !succeeded {
            std::process::exit(1);
        }
        return;
    }

    // Run the daemon
    let options = AppOptions::from_settings(settings);
    info!("Running dropletd with options: {:?}", options);
    let result = run(version.version, options, await_shutdown_signal()).await;
    if let Err(e) = result {
        error!("Failed to run dropletd: {e}");
        std::process::exit(1);
    }
}

/// Run one deployment request and stream its transcript to the terminal
async fn deploy_once(settings: &Settings, request_file: &Path) -> anyhow::Result<bool> {
    let request = read_request(request_file).await?;
    let pipeline = Pipeline::from_settings(settings).context("unable to build the pipeline")?;

    println!(
        "{} {} ({})",
        "Deploying".bold(),
        request.site_name,
        request.deployment_id.dimmed()
    );

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Ctrl+C received, canceling deployment...");
            ctrl_c.cancel();
        }
    });

    let site = SiteSpec::from(request);
    let result = pipeline.deploy(&site, cancel, Arc::new(ConsoleObserver)).await;
    Ok(result.success)
}

/// Read a request file. The deployment id is optional on the command line
/// and generated when absent.
async fn read_request(path: &Path) -> anyhow::Result<DeploymentRequest> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("unable to read {}", path.display()))?;
    let mut value: serde_json::Value = serde_json::from_str(&contents)
        .with_context(|| format!("{} is not valid JSON", path.display()))?;

    if let Some(object) = value.as_object_mut() {
        let missing = object
            .get("deploymentId")
            .and_then(|id| id.as_str())
            .map_or(true, str::is_empty);
        if missing {
            object.insert(
                "deploymentId".to_string(),
                uuid::Uuid::new_v4().to_string().into(),
            );
        }
    }

    serde_json::from_value(value)
        .with_context(|| format!("{} is not a deployment request", path.display()))
}

/// Prints the transcript as it is produced
struct ConsoleObserver;

impl DeploymentObserver for ConsoleObserver {
    fn on_log(&self, line: &str) {
        if line.starts_with('✅') {
            println!("{}", line.green().bold());
        } else if line.starts_with('❌') {
            println!("{}", line.red().bold());
        } else if line.starts_with('🛑') || line.starts_with("SSL warning") {
            println!("{}", line.yellow());
        } else if line.starts_with("    ") {
            println!("{}", line.dimmed());
        } else {
            println!("{}", line);
        }
    }

    fn on_progress(&self, completed: u8, total: u8) {
        println!("{}", format!("[{}/{}]", completed, total).cyan());
    }

    fn on_port_assigned(&self, port: u16) {
        println!("{} {}", "Port:".bold(), port);
    }

    fn on_finished(&self, result: &DeploymentResult) {
        let summary = format!(
            "{:?} in {} ({})",
            result.outcome,
            result.duration_display(),
            result.commit_message
        );
        match result.outcome {
            DeploymentOutcome::Succeeded => println!("{}", summary.green()),
            DeploymentOutcome::Failed => println!("{}", summary.red()),
            DeploymentOutcome::Canceled => println!("{}", summary.yellow()),
        }
    }
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let (mut sigterm, mut sigint) = match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
            _ => {
                error!("Unable to install signal handlers, falling back to Ctrl+C");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down...");
            }
            _ = sigint.recv() => {
                info!("SIGINT received, shutting down...");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl+C received, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
        }
        info!("Ctrl+C received, shutting down...");
    }
}
