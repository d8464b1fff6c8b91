//! Process supervisor: one long-running backend instance per domain
//!
//! The supervisor is queried live on every call; nothing here keeps a copy
//! of its process table.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::deploy::context::ExecutionContext;
use crate::deploy::runner::{CommandRunner, CommandSpec};
use crate::errors::DeployError;
use crate::storage::settings::{SupervisorSettings, TimeoutSettings};

/// Environment variable carrying the assigned port
pub const PORT_VAR: &str = "PORT";

/// Everything needed to (re)start a managed process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessSpec {
    /// Logical name, the site's domain
    pub name: String,
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: BTreeMap<String, String>,
}

impl ProcessSpec {
    pub fn port(&self) -> Option<u16> {
        self.env.get(PORT_VAR).and_then(|p| p.parse().ok())
    }
}

/// A process as reported by the supervisor
#[derive(Debug, Clone)]
pub struct ManagedProcess {
    pub name: String,
    pub pid: Option<u32>,
    pub status: String,

    /// Value of the process's `PORT` variable
    pub port: Option<u16>,

    /// Definition the process can be restarted from, when the supervisor
    /// exposes enough to rebuild it
    pub spec: Option<ProcessSpec>,
}

#[async_trait]
pub trait ProcessSupervisor: Send + Sync {
    /// All processes the supervisor manages
    async fn list(&self, ctx: &ExecutionContext) -> Result<Vec<ManagedProcess>, DeployError>;

    /// Stop and forget the process named `name`. Returns whether one existed.
    async fn stop(&self, ctx: &ExecutionContext, name: &str) -> Result<bool, DeployError>;

    /// Start a new process from `spec`
    async fn start(&self, ctx: &ExecutionContext, spec: &ProcessSpec) -> Result<(), DeployError>;

    /// Persist the process table so it survives restarts
    async fn save(&self, ctx: &ExecutionContext) -> Result<(), DeployError>;
}

/// Build the process definition for a backend: the start command split into
/// program and arguments, the environment blob, and `PORT` on top.
pub fn process_spec(
    name: &str,
    start_command: &str,
    cwd: PathBuf,
    env: BTreeMap<String, String>,
    port: u16,
) -> Result<ProcessSpec, DeployError> {
    let argv = crate::utils::split_command_line(start_command)
        .map_err(|e| DeployError::InvalidSite(format!("start command: {}", e)))?;
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| DeployError::InvalidSite("start command is empty".to_string()))?;

    let mut env = env;
    env.insert(PORT_VAR.to_string(), port.to_string());

    Ok(ProcessSpec {
        name: name.to_string(),
        program: program.clone(),
        args: args.to_vec(),
        cwd,
        env,
    })
}

/// Stop whatever runs under `spec.name`, then start `spec`.
///
/// If the start fails, the previous instance is started again from the
/// definition captured before the stop. The deployment still fails.
pub async fn replace(
    supervisor: &dyn ProcessSupervisor,
    ctx: &ExecutionContext,
    spec: &ProcessSpec,
) -> Result<(), DeployError> {
    let previous = match supervisor.list(ctx).await {
        Ok(processes) => processes
            .into_iter()
            .find(|p| p.name == spec.name)
            .and_then(|p| p.spec),
        Err(e) if e.is_canceled() => return Err(e),
        Err(e) => {
            debug!(error = %e, "could not list processes before replace");
            None
        }
    };

    ctx.check_canceled()?;
    let stopped = supervisor
        .stop(ctx, &spec.name)
        .await
        .map_err(|e| e.within(DeployError::Process))?;
    if stopped {
        ctx.log(format!("Stopped previous instance of {}", spec.name));
    }

    ctx.log(format!(
        "Starting {} on port {}...",
        spec.name,
        spec.port().map(|p| p.to_string()).unwrap_or_else(|| "?".to_string())
    ));
    if let Err(err) = supervisor.start(ctx, spec).await {
        if err.is_canceled() {
            return Err(err);
        }
        if let Some(previous) = previous {
            ctx.log("Start failed, restoring previous instance...");
            match supervisor.start(ctx, &previous).await {
                Ok(()) => ctx.log("Previous instance restored"),
                Err(e) => ctx.log(format!("Could not restore previous instance: {}", e)),
            }
        }
        return Err(err.within(DeployError::Process));
    }

    if let Err(e) = supervisor.save(ctx).await {
        if e.is_canceled() {
            return Err(e);
        }
        warn!(error = %e, "could not persist process table");
        ctx.log(format!("Warning: could not persist process table: {}", e));
    }
    ctx.log(format!("{} is running", spec.name));
    Ok(())
}

/// pm2 as the process supervisor
#[derive(Debug, Clone)]
pub struct Pm2Supervisor {
    runner: CommandRunner,
    command: String,
    timeout: Duration,
}

impl Pm2Supervisor {
    pub fn new(runner: CommandRunner, settings: &SupervisorSettings, timeouts: &TimeoutSettings) -> Self {
        Self {
            runner,
            command: settings.command.clone(),
            timeout: timeouts.supervisor_timeout(),
        }
    }

    fn pm2(&self) -> CommandSpec {
        CommandSpec::new(self.command.as_str()).timeout(self.timeout)
    }
}

#[async_trait]
impl ProcessSupervisor for Pm2Supervisor {
    async fn list(&self, ctx: &ExecutionContext) -> Result<Vec<ManagedProcess>, DeployError> {
        let out = self.runner.output(ctx, &self.pm2().arg("jlist")).await?;
        parse_jlist(&out)
    }

    async fn stop(&self, ctx: &ExecutionContext, name: &str) -> Result<bool, DeployError> {
        let exists = self.list(ctx).await?.iter().any(|p| p.name == name);
        if !exists {
            return Ok(false);
        }
        self.runner.run(ctx, &self.pm2().args(["delete", name])).await?;
        Ok(true)
    }

    async fn start(&self, ctx: &ExecutionContext, spec: &ProcessSpec) -> Result<(), DeployError> {
        let cwd = spec.cwd.to_string_lossy().to_string();
        let mut cmd = self
            .pm2()
            .args(["start", spec.program.as_str()])
            .args(["--name", spec.name.as_str(), "--cwd", cwd.as_str(), "--update-env"])
            .current_dir(&spec.cwd)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        if !spec.args.is_empty() {
            cmd = cmd.arg("--").args(spec.args.iter().map(String::as_str));
        }
        self.runner.run(ctx, &cmd).await
    }

    async fn save(&self, ctx: &ExecutionContext) -> Result<(), DeployError> {
        self.runner.run(ctx, &self.pm2().arg("save")).await
    }
}

#[derive(Debug, Deserialize)]
struct Pm2Entry {
    name: String,
    #[serde(default)]
    pid: Option<u32>,
    #[serde(default)]
    pm2_env: Option<Pm2Env>,
}

#[derive(Debug, Default, Deserialize)]
struct Pm2Env {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    pm_exec_path: Option<String>,
    #[serde(default)]
    pm_cwd: Option<String>,
    #[serde(default)]
    args: Option<Value>,
    #[serde(default)]
    env: Option<BTreeMap<String, Value>>,
    #[serde(default, rename = "PORT")]
    port: Option<Value>,
}

/// Parse `pm2 jlist` output. pm2 prints banners such as `[PM2] Spawning
/// daemon` before the JSON array when it starts its daemon.
fn parse_jlist(out: &str) -> Result<Vec<ManagedProcess>, DeployError> {
    let Some(start) = out.find("[{").or_else(|| out.find("[]")) else {
        return Ok(Vec::new());
    };
    let entries: Vec<Pm2Entry> = serde_json::from_str(out[start..].trim_end())?;

    Ok(entries
        .into_iter()
        .map(|entry| {
            let pm2_env = entry.pm2_env.unwrap_or_default();
            let env: BTreeMap<String, String> = pm2_env
                .env
                .unwrap_or_default()
                .into_iter()
                .filter_map(|(k, v)| value_to_string(&v).map(|v| (k, v)))
                .collect();
            let port = env
                .get(PORT_VAR)
                .and_then(|p| p.parse().ok())
                .or_else(|| pm2_env.port.as_ref().and_then(value_to_string).and_then(|p| p.parse().ok()));

            let spec = match (pm2_env.pm_exec_path, pm2_env.pm_cwd) {
                (Some(program), Some(cwd)) => Some(ProcessSpec {
                    name: entry.name.clone(),
                    program,
                    args: args_from_value(pm2_env.args.as_ref()),
                    cwd: PathBuf::from(cwd),
                    env,
                }),
                _ => None,
            };

            ManagedProcess {
                name: entry.name,
                pid: entry.pid.filter(|p| *p != 0),
                status: pm2_env.status.unwrap_or_else(|| "unknown".to_string()),
                port,
                spec,
            }
        })
        .collect())
}

fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn args_from_value(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items.iter().filter_map(value_to_string).collect(),
        Some(Value::String(s)) => crate::utils::split_command_line(s).unwrap_or_default(),
        _ => Vec::new(),
    }
}
