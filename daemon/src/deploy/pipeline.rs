//! Deployment orchestrator.
//!
//! Runs the steps of one deployment in order, drives the pipeline FSM, keeps
//! progress in the execution context and turns the outcome into exactly one
//! [`DeploymentResult`]. Best-effort cleanup runs after every deployment.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::Utc;
use secrecy::ExposeSecret;
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::deploy::artifact;
use crate::deploy::build::BuildExecutor;
use crate::deploy::certs::CertificateProvisioner;
use crate::deploy::context::{DeploymentObserver, ExecutionContext};
use crate::deploy::env;
use crate::deploy::fsm::{PipelineEvent, PipelineFsm};
use crate::deploy::ports::PortAllocator;
use crate::deploy::proxy::{self, ProxyConfigurator};
use crate::deploy::runner::CommandRunner;
use crate::deploy::source::SourceSynchronizer;
use crate::deploy::supervisor::{self, Pm2Supervisor, ProcessSupervisor};
use crate::errors::DeployError;
use crate::filesys::dir::Dir;
use crate::models::deployment::{DeploymentOutcome, DeploymentResult, DEFAULT_COMMIT_MESSAGE};
use crate::models::site::SiteSpec;
use crate::storage::layout::StorageLayout;
use crate::storage::settings::Settings;
use crate::utils::format_duration;

type DomainLock = Arc<tokio::sync::Mutex<()>>;
type DomainLocks = Mutex<HashMap<String, DomainLock>>;

/// Held for the whole deployment of one domain. The domain leaves the lock
/// table once nobody holds or waits for its lock.
#[derive(Debug)]
struct DomainGuard<'a> {
    locks: &'a DomainLocks,
    domain: String,
    lock: DomainLock,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for DomainGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        forget_unused_lock(self.locks, &self.domain, &self.lock);
    }
}

/// Remove `domain` when `lock` is referenced only by the table and the caller
fn forget_unused_lock(locks: &DomainLocks, domain: &str, lock: &DomainLock) {
    let mut locks = locks.lock().unwrap_or_else(|e| e.into_inner());
    let ours = locks.get(domain).is_some_and(|l| Arc::ptr_eq(l, lock));
    if ours && Arc::strong_count(lock) == 2 {
        locks.remove(domain);
    }
}

/// Values collected while the steps run
struct RunState {
    commit_message: String,
    port: Option<u16>,
}

pub struct Pipeline {
    layout: StorageLayout,
    source: SourceSynchronizer,
    builder: BuildExecutor,
    ports: PortAllocator,
    supervisor: Arc<dyn ProcessSupervisor>,
    proxy: ProxyConfigurator,
    certs: CertificateProvisioner,
    keep_transcripts: usize,
    domain_locks: DomainLocks,
}

impl Pipeline {
    pub fn new(
        settings: &Settings,
        runner: CommandRunner,
        supervisor: Arc<dyn ProcessSupervisor>,
        certs: CertificateProvisioner,
    ) -> Self {
        Self {
            layout: settings.paths.clone(),
            source: SourceSynchronizer::new(runner.clone(), &settings.source, &settings.timeouts),
            builder: BuildExecutor::new(runner.clone(), &settings.timeouts),
            ports: PortAllocator::new(&settings.ports),
            supervisor,
            proxy: ProxyConfigurator::new(
                runner,
                settings.paths.clone(),
                &settings.proxy,
                &settings.timeouts,
            ),
            certs,
            keep_transcripts: settings.transcripts.keep,
            domain_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Pipeline backed by pm2, the configured IP lookup service and the
    /// system resolver
    pub fn from_settings(settings: &Settings) -> Result<Self, DeployError> {
        let runner = CommandRunner::new();
        let supervisor = Arc::new(Pm2Supervisor::new(
            runner.clone(),
            &settings.supervisor,
            &settings.timeouts,
        ));
        let certs = CertificateProvisioner::from_settings(
            runner.clone(),
            &settings.certificates,
            &settings.timeouts,
        )?;
        Ok(Self::new(settings, runner, supervisor, certs))
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    /// Deploy `site`. Never fails: every outcome, cancellation included, is
    /// reported through the returned result, which is also handed to the
    /// observer.
    pub async fn deploy(
        &self,
        site: &SiteSpec,
        cancel: CancellationToken,
        observer: Arc<dyn DeploymentObserver>,
    ) -> DeploymentResult {
        let started = Instant::now();
        let mut ctx = ExecutionContext::new(site.name.clone(), cancel, observer);
        if let Some(token) = &site.access_token {
            ctx = ctx.with_secret(token.expose_secret());
        }

        let mut fsm = PipelineFsm::new(site.is_backend());
        let mut state = RunState {
            commit_message: DEFAULT_COMMIT_MESSAGE.to_string(),
            port: site.port,
        };

        let outcome = self.run(&ctx, site, &mut fsm, &mut state).await;
        let duration = started.elapsed();

        let (outcome, error) = match outcome {
            Ok(()) => {
                let _ = fsm.process(PipelineEvent::Complete);
                ctx.set_step(fsm.completed());
                ctx.log(format!("✅ Deployed successfully in {}", format_duration(duration)));
                info!(site = %site.name, domain = %site.domain, "deployment succeeded");
                (DeploymentOutcome::Succeeded, None)
            }
            Err(e) if e.is_canceled() => {
                let _ = fsm.process(PipelineEvent::Cancel);
                ctx.log("🛑 Deployment canceled");
                warn!(site = %site.name, state = ?fsm.state(), "deployment canceled");
                (DeploymentOutcome::Canceled, Some(e.to_string()))
            }
            Err(e) => {
                let message = ctx.redact(&e.to_string());
                let _ = fsm.process(PipelineEvent::Fail(message.clone()));
                ctx.set_step(fsm.completed());
                ctx.log(format!("❌ Deploy failed: {}", message));
                error!(site = %site.name, error = %message, "deployment failed");
                (DeploymentOutcome::Failed, Some(message))
            }
        };

        self.cleanup(&ctx, site).await;

        let result = DeploymentResult {
            outcome,
            success: outcome == DeploymentOutcome::Succeeded,
            duration,
            log: ctx.transcript(),
            commit_message: if outcome == DeploymentOutcome::Succeeded {
                state.commit_message
            } else {
                DEFAULT_COMMIT_MESSAGE.to_string()
            },
            port: state.port.filter(|_| site.is_backend()),
            error,
        };
        ctx.observer().on_finished(&result);
        result
    }

    async fn run(
        &self,
        ctx: &ExecutionContext,
        site: &SiteSpec,
        fsm: &mut PipelineFsm,
        state: &mut RunState,
    ) -> Result<(), DeployError> {
        site.validate()?;
        let _domain_guard = self.lock_domain(ctx, &site.domain).await?;
        ctx.check_canceled()?;
        ctx.log(format!("Deploying {} to {}", site.name, site.domain));

        let tree = self.layout.repo_dir(&site.id);

        enter(ctx, fsm, PipelineEvent::SyncSource)?;
        state.commit_message = self
            .source
            .sync(ctx, &site.repo, &site.branch, site.access_token.as_ref(), &tree)
            .await?;

        enter(ctx, fsm, PipelineEvent::InjectEnv)?;
        env::write_env_file(ctx, &tree, site.env_vars.as_deref()).await?;

        enter(ctx, fsm, PipelineEvent::Build)?;
        self.builder
            .build(ctx, site.build_command.as_deref(), &tree)
            .await?;

        enter(ctx, fsm, PipelineEvent::ResolveArtifact)?;
        let artifact = artifact::resolve(ctx, &tree, &site.output_dir).await?;

        let vhost = if site.is_backend() {
            enter(ctx, fsm, PipelineEvent::StartProcess)?;
            let port = self.start_backend(ctx, site, &tree, &artifact, state).await?;
            proxy::render_proxy(&site.domain, port)
        } else {
            let site_dir = self.layout.site_dir(&site.domain);
            artifact::publish(ctx, &artifact, &site_dir).await?;
            proxy::render_static(&site.domain, site_dir.path())
        };

        enter(ctx, fsm, PipelineEvent::ConfigureProxy)?;
        self.proxy.install(ctx, &site.domain, &vhost).await?;

        enter(ctx, fsm, PipelineEvent::ProvisionCertificate)?;
        let certificate = self.certs.provision(ctx, &site.domain).await?;
        debug!(domain = %site.domain, outcome = ?certificate, "certificate step finished");

        Ok(())
    }

    async fn start_backend(
        &self,
        ctx: &ExecutionContext,
        site: &SiteSpec,
        tree: &Dir,
        app_dir: &Dir,
        state: &mut RunState,
    ) -> Result<u16, DeployError> {
        let port = match site.port {
            Some(port) => {
                ctx.log(format!("Using assigned port {}", port));
                port
            }
            None => {
                let port = self.ports.allocate(ctx, self.supervisor.as_ref()).await?;
                ctx.log(format!("Assigned port {}", port));
                ctx.observer().on_port_assigned(port);
                port
            }
        };
        state.port = Some(port);

        let vars = match site.env_vars.as_deref() {
            Some(blob) => {
                if app_dir.path() != tree.path() {
                    app_dir.file(env::ENV_FILE).write_string(blob).await?;
                }
                env::parse_env_blob(blob)?
            }
            None => BTreeMap::new(),
        };

        let spec = supervisor::process_spec(
            &site.domain,
            &site.start_command,
            app_dir.path().to_path_buf(),
            vars,
            port,
        )?;
        supervisor::replace(self.supervisor.as_ref(), ctx, &spec).await?;
        Ok(port)
    }

    /// Serialize deployments of the same domain. Waiting gives way to
    /// cancellation.
    async fn lock_domain(
        &self,
        ctx: &ExecutionContext,
        domain: &str,
    ) -> Result<DomainGuard<'_>, DeployError> {
        let lock = {
            let mut locks = self.domain_locks.lock().unwrap_or_else(|e| e.into_inner());
            locks.entry(domain.to_string()).or_default().clone()
        };

        let guard = match lock.clone().try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                ctx.log(format!(
                    "Waiting for another deployment of {} to finish...",
                    domain
                ));
                let acquired = tokio::select! {
                    biased;
                    _ = ctx.cancel_token().cancelled() => None,
                    guard = lock.clone().lock_owned() => Some(guard),
                };
                match acquired {
                    Some(guard) => guard,
                    None => {
                        forget_unused_lock(&self.domain_locks, domain, &lock);
                        return Err(DeployError::Canceled);
                    }
                }
            }
        };

        Ok(DomainGuard {
            locks: &self.domain_locks,
            domain: domain.to_string(),
            lock,
            guard: Some(guard),
        })
    }

    /// Archive the transcript and drop build caches. Failures are logged
    /// and otherwise ignored.
    async fn cleanup(&self, ctx: &ExecutionContext, site: &SiteSpec) {
        if site.validate().is_err() {
            return;
        }
        if let Err(e) = self.archive_transcript(ctx, site).await {
            warn!(site = %site.name, error = %e, "could not archive transcript");
        }

        let cache = self
            .layout
            .repo_dir(&site.id)
            .subdir("node_modules")
            .subdir(".cache");
        if let Err(e) = cache.delete().await {
            debug!(site = %site.name, error = %e, "could not remove build cache");
        }
    }

    async fn archive_transcript(&self, ctx: &ExecutionContext, site: &SiteSpec) -> Result<(), DeployError> {
        let dir = self.layout.transcripts_dir(&site.id);
        let name = format!("{}.log", Utc::now().format("%Y%m%dT%H%M%S%.3fZ"));
        dir.file(&name).write_string(&ctx.transcript()).await?;

        let files = dir.list_files().await?;
        let excess = files.len().saturating_sub(self.keep_transcripts);
        for old in &files[..excess] {
            tokio::fs::remove_file(old).await?;
        }
        Ok(())
    }
}

/// Check cancellation, then move the FSM into the next step and publish
/// progress
fn enter(ctx: &ExecutionContext, fsm: &mut PipelineFsm, event: PipelineEvent) -> Result<(), DeployError> {
    ctx.check_canceled()?;
    fsm.process(event).map_err(DeployError::Internal)?;
    ctx.set_step(fsm.completed());
    Ok(())
}
