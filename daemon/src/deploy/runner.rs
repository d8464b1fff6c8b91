//! Command runner.
//!
//! Spawns every command in its own process group, streams stdout/stderr line
//! by line into the deployment transcript, and enforces timeouts and
//! cancellation by terminating the whole group.

use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::deploy::context::ExecutionContext;
use crate::errors::DeployError;

/// Grace period between SIGTERM and SIGKILL
const GRACE_PERIOD: Duration = Duration::from_secs(5);

/// How long to keep reading buffered output once the process has exited
const DRAIN_PERIOD: Duration = Duration::from_secs(5);

/// Indentation of command output inside the transcript
const OUTPUT_INDENT: &str = "    ";

/// A command to run: a program with discrete arguments, never a string that
/// gets re-parsed, except for [`CommandSpec::shell`].
#[derive(Debug, Clone)]
pub struct CommandSpec {
    program: String,
    args: Vec<String>,
    label: Option<String>,
    cwd: Option<PathBuf>,
    envs: Vec<(String, String)>,
    timeout: Option<Duration>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            label: None,
            args: Vec::new(),
            cwd: None,
            envs: Vec::new(),
            timeout: None,
        }
    }

    /// Run a command line through `sh -c`. Only for caller-supplied build
    /// commands, which are shell snippets by definition.
    pub fn shell(command_line: impl Into<String>) -> Self {
        let command_line = command_line.into();
        Self {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), command_line.clone()],
            label: Some(command_line),
            cwd: None,
            envs: Vec::new(),
            timeout: None,
        }
    }

    /// Build from an argument vector such as `["nginx", "-t"]`
    pub fn from_argv(argv: &[String]) -> Result<Self, DeployError> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| DeployError::Config("empty command".to_string()))?;
        Ok(Self::new(program.clone()).args(args.iter().cloned()))
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for arg in args {
            self = self.arg(arg);
        }
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (key, value) in vars {
            self.envs.push((key.into(), value.into()));
        }
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Replace the label used in logs and errors, e.g. to keep a credential
    /// carried in an argument out of them
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    /// Label used in logs and errors
    pub fn display(&self) -> String {
        match &self.label {
            Some(label) => label.clone(),
            None if self.args.is_empty() => self.program.clone(),
            None => format!("{} {}", self.program, self.args.join(" ")),
        }
    }
}

enum Exit {
    Completed(std::io::Result<ExitStatus>),
    TimedOut,
    Canceled,
}

/// Executes [`CommandSpec`]s on behalf of one deployment
#[derive(Debug, Clone)]
pub struct CommandRunner {
    grace: Duration,
}

impl CommandRunner {
    pub fn new() -> Self {
        Self { grace: GRACE_PERIOD }
    }

    /// Runner with a custom SIGTERM to SIGKILL grace period
    pub fn with_grace(grace: Duration) -> Self {
        Self { grace }
    }

    /// Run a command, streaming stdout and stderr into the transcript.
    /// Succeeds only on exit status zero.
    pub async fn run(&self, ctx: &ExecutionContext, spec: &CommandSpec) -> Result<(), DeployError> {
        self.execute(ctx, spec, false).await.map(|_| ())
    }

    /// Run a command and return its stdout. Stderr still goes to the
    /// transcript.
    pub async fn output(&self, ctx: &ExecutionContext, spec: &CommandSpec) -> Result<String, DeployError> {
        self.execute(ctx, spec, true).await
    }

    async fn execute(
        &self,
        ctx: &ExecutionContext,
        spec: &CommandSpec,
        capture_stdout: bool,
    ) -> Result<String, DeployError> {
        ctx.check_canceled()?;
        let label = spec.display();
        debug!(command = %label, cwd = ?spec.cwd, "running command");

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.cwd {
            cmd.current_dir(dir);
        }
        for (key, value) in &spec.envs {
            cmd.env(key, value);
        }
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| DeployError::CommandFailed {
            command: label.clone(),
            reason: format!("failed to start: {}", e),
        })?;
        let pid = child.id();

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DeployError::Internal("stdout not piped".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| DeployError::Internal("stderr not piped".to_string()))?;

        let mut stdout = OutputStream::new(stdout);
        let mut stderr = OutputStream::new(stderr);
        let mut captured = String::new();

        let timeout = spec.timeout;
        let deadline = async move {
            match timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(deadline);

        // One exit reason per command: whichever branch wins the select is the
        // only outcome ever reported.
        let exit = loop {
            tokio::select! {
                biased;
                status = child.wait() => break Exit::Completed(status),
                _ = ctx.cancel_token().cancelled() => break Exit::Canceled,
                _ = &mut deadline => break Exit::TimedOut,
                Some(line) = stdout.next_line(), if stdout.open => {
                    forward_stdout(ctx, line, capture_stdout, &mut captured)
                }
                Some(line) = stderr.next_line(), if stderr.open => forward_line(ctx, &line),
            }
        };

        match exit {
            Exit::Completed(status) => {
                let drain = async {
                    while let Some(line) = stdout.next_line().await {
                        forward_stdout(ctx, line, capture_stdout, &mut captured);
                    }
                    while let Some(line) = stderr.next_line().await {
                        forward_line(ctx, &line);
                    }
                };
                if tokio::time::timeout(DRAIN_PERIOD, drain).await.is_err() {
                    debug!(command = %label, "output still open after exit, detaching");
                }

                match status {
                    Ok(status) if status.success() => Ok(captured),
                    Ok(status) => Err(DeployError::CommandFailed {
                        command: label.clone(),
                        reason: status.to_string(),
                    }),
                    Err(e) => Err(DeployError::CommandFailed {
                        command: label.clone(),
                        reason: e.to_string(),
                    }),
                }
            }
            Exit::TimedOut => {
                let duration = spec.timeout.unwrap_or_default();
                warn!(command = %label, timeout_secs = duration.as_secs(), "command timed out");
                terminate_process_group(&mut child, pid, self.grace).await;
                Err(DeployError::Timeout {
                    command: label.clone(),
                    duration,
                })
            }
            Exit::Canceled => {
                warn!(command = %label, "command canceled");
                terminate_process_group(&mut child, pid, self.grace).await;
                Err(DeployError::Canceled)
            }
        }
    }
}

impl Default for CommandRunner {
    fn default() -> Self {
        Self::new()
    }
}

/// One output pipe of a child, split into lines.
///
/// Bytes are read raw so output that is not valid UTF-8 is logged lossily
/// instead of closing the pipe. A read interrupted by another `select!`
/// branch keeps its partial bytes in `buf` and resumes on the next call.
struct OutputStream<R> {
    reader: BufReader<R>,
    buf: Vec<u8>,
    open: bool,
}

impl<R: AsyncRead + Unpin> OutputStream<R> {
    fn new(inner: R) -> Self {
        Self {
            reader: BufReader::new(inner),
            buf: Vec::new(),
            open: true,
        }
    }

    /// Next line without its terminator, `None` once the pipe is closed
    async fn next_line(&mut self) -> Option<String> {
        if !self.open {
            return None;
        }
        match self.reader.read_until(b'\n', &mut self.buf).await {
            Ok(0) => {
                self.open = false;
                None
            }
            Ok(_) => {
                let line = String::from_utf8_lossy(&self.buf)
                    .trim_end_matches(['\n', '\r'])
                    .to_string();
                self.buf.clear();
                Some(line)
            }
            Err(e) => {
                debug!(error = %e, "output pipe failed");
                self.open = false;
                None
            }
        }
    }
}

fn forward_line(ctx: &ExecutionContext, line: &str) {
    let line = line.trim_end();
    if !line.trim().is_empty() {
        ctx.log(format!("{}{}", OUTPUT_INDENT, line));
    }
}

fn forward_stdout(ctx: &ExecutionContext, line: String, capture: bool, captured: &mut String) {
    if capture {
        captured.push_str(&line);
        captured.push('\n');
    } else {
        forward_line(ctx, &line);
    }
}

/// Terminate every process in the child's group: SIGTERM, wait for the
/// leader up to `grace`, then SIGKILL whatever is left and reap the leader.
#[cfg(unix)]
async fn terminate_process_group(child: &mut Child, pid: Option<u32>, grace: Duration) {
    use nix::errno::Errno;
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    let Some(pid) = pid else {
        let _ = child.kill().await;
        return;
    };
    let pgid = Pid::from_raw(pid as i32);

    if let Err(e) = signal::killpg(pgid, Signal::SIGTERM) {
        if e != Errno::ESRCH {
            warn!(pid, error = ?e, "SIGTERM to process group failed");
        }
    }

    let deadline = tokio::time::Instant::now() + grace;
    while tokio::time::Instant::now() < deadline {
        if child.try_wait().ok().flatten().is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // Members of the group may outlive the leader; kill them regardless.
    if let Err(e) = signal::killpg(pgid, Signal::SIGKILL) {
        if e != Errno::ESRCH {
            warn!(pid, error = ?e, "SIGKILL to process group failed");
        }
    }

    let _ = child.wait().await;
}

#[cfg(not(unix))]
async fn terminate_process_group(child: &mut Child, _pid: Option<u32>, _grace: Duration) {
    let _ = child.kill().await;
    let _ = child.wait().await;
}
