//! Shared fixtures: a local git remote, a sandboxed host layout and an
//! in-memory process supervisor

#![allow(dead_code)]

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::TempDir;

use dropletd::deploy::certs::{CertificateProvisioner, DnsResolver, PublicIpLookup};
use dropletd::deploy::context::{DeploymentObserver, ExecutionContext};
use dropletd::deploy::pipeline::Pipeline;
use dropletd::deploy::runner::CommandRunner;
use dropletd::deploy::supervisor::{ManagedProcess, ProcessSpec, ProcessSupervisor};
use dropletd::errors::DeployError;
use dropletd::models::deployment::DeploymentResult;
use dropletd::storage::layout::StorageLayout;
use dropletd::storage::settings::Settings;

pub const PUBLIC_IP: &str = "203.0.113.1";
pub const OTHER_IP: &str = "198.51.100.7";

/// Sandboxed host plus a bare remote under one temporary directory
pub struct Fixture {
    pub tmp: TempDir,
    pub settings: Settings,
}

impl Fixture {
    pub fn new() -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let mut settings = Settings::default();
        settings.paths = StorageLayout::sandboxed(tmp.path().join("host"));
        settings.source.git_host = format!("file://{}", tmp.path().join("remote").display());
        settings.proxy.validate_command = vec!["true".to_string()];
        settings.proxy.reload_command = vec!["true".to_string()];
        settings.ports.probe_listeners = false;
        settings.certificates.certbot_command = "true".to_string();
        Self { tmp, settings }
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.settings.paths
    }

    /// Create `acme/<name>` on the local remote with `files` committed to
    /// `main`
    pub fn repo(&self, name: &str, files: &[(&str, &str)]) -> GitRepo {
        let bare = self.tmp.path().join("remote/acme").join(format!("{}.git", name));
        let work = self.tmp.path().join("work").join(name);
        std::fs::create_dir_all(&bare).unwrap();
        std::fs::create_dir_all(&work).unwrap();

        git(&bare, &["init", "--bare", "--initial-branch=main"]);
        git(&work, &["init", "--initial-branch=main"]);

        let repo = GitRepo { bare, work };
        repo.commit(files, "Initial commit");
        repo
    }

    /// Pipeline over the sandbox whose DNS does not point at this host
    pub fn pipeline(&self, supervisor: Arc<MemorySupervisor>) -> Pipeline {
        self.pipeline_with_dns(supervisor, OTHER_IP)
    }

    pub fn pipeline_with_dns(&self, supervisor: Arc<MemorySupervisor>, resolves_to: &str) -> Pipeline {
        let runner = CommandRunner::new();
        let certs = CertificateProvisioner::new(
            runner.clone(),
            &self.settings.certificates,
            &self.settings.timeouts,
            Arc::new(FixedIp(PUBLIC_IP.parse().unwrap())),
            Arc::new(FixedDns(vec![resolves_to.parse().unwrap()])),
        );
        Pipeline::new(&self.settings, runner, supervisor, certs)
    }
}

/// Working copy pushing to a bare remote
pub struct GitRepo {
    pub bare: PathBuf,
    pub work: PathBuf,
}

impl GitRepo {
    pub fn commit(&self, files: &[(&str, &str)], message: &str) {
        for (path, contents) in files {
            let path = self.work.join(path);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, contents).unwrap();
        }
        git(&self.work, &["add", "-A"]);
        git(
            &self.work,
            &[
                "-c",
                "user.name=Acme",
                "-c",
                "user.email=dev@acme.dev",
                "commit",
                "--allow-empty",
                "-m",
                message,
            ],
        );
        git(&self.work, &["push", self.bare.to_str().unwrap(), "HEAD:refs/heads/main"]);
    }
}

pub fn git(dir: &Path, args: &[&str]) {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .env("GIT_CONFIG_NOSYSTEM", "1")
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
}

struct FixedIp(IpAddr);

#[async_trait]
impl PublicIpLookup for FixedIp {
    async fn public_ip(&self) -> Result<IpAddr, DeployError> {
        Ok(self.0)
    }
}

struct FixedDns(Vec<IpAddr>);

#[async_trait]
impl DnsResolver for FixedDns {
    async fn resolve(&self, _domain: &str) -> Result<Vec<IpAddr>, DeployError> {
        Ok(self.0.clone())
    }
}

/// Supervisor keeping its table in memory
#[derive(Default)]
pub struct MemorySupervisor {
    pub processes: Mutex<Vec<ProcessSpec>>,
}

impl MemorySupervisor {
    pub fn names(&self) -> Vec<String> {
        self.processes.lock().unwrap().iter().map(|p| p.name.clone()).collect()
    }
}

#[async_trait]
impl ProcessSupervisor for MemorySupervisor {
    async fn list(&self, _ctx: &ExecutionContext) -> Result<Vec<ManagedProcess>, DeployError> {
        Ok(self
            .processes
            .lock()
            .unwrap()
            .iter()
            .map(|spec| ManagedProcess {
                name: spec.name.clone(),
                pid: Some(1),
                status: "online".to_string(),
                port: spec.port(),
                spec: Some(spec.clone()),
            })
            .collect())
    }

    async fn stop(&self, _ctx: &ExecutionContext, name: &str) -> Result<bool, DeployError> {
        let mut processes = self.processes.lock().unwrap();
        let before = processes.len();
        processes.retain(|p| p.name != name);
        Ok(processes.len() != before)
    }

    async fn start(&self, _ctx: &ExecutionContext, spec: &ProcessSpec) -> Result<(), DeployError> {
        self.processes.lock().unwrap().push(spec.clone());
        Ok(())
    }

    async fn save(&self, _ctx: &ExecutionContext) -> Result<(), DeployError> {
        Ok(())
    }
}

/// Observer recording every callback
#[derive(Default)]
pub struct RecordingObserver {
    pub lines: Mutex<Vec<String>>,
    pub progress: Mutex<Vec<u8>>,
    pub ports: Mutex<Vec<u16>>,
    pub finished: Mutex<usize>,
}

impl DeploymentObserver for RecordingObserver {
    fn on_log(&self, line: &str) {
        self.lines.lock().unwrap().push(line.to_string());
    }

    fn on_progress(&self, completed: u8, _total: u8) {
        self.progress.lock().unwrap().push(completed);
    }

    fn on_port_assigned(&self, port: u16) {
        self.ports.lock().unwrap().push(port);
    }

    fn on_finished(&self, _result: &DeploymentResult) {
        *self.finished.lock().unwrap() += 1;
    }
}

/// Index of the first transcript line starting with `prefix`
pub fn line_index(log: &str, prefix: &str) -> usize {
    log.lines()
        .position(|line| line.starts_with(prefix))
        .unwrap_or_else(|| panic!("no line starting with {:?} in:\n{}", prefix, log))
}
