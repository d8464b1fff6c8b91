//! Certificate provisioner.
//!
//! Issuance is attempted only when the domain already resolves to this host.
//! Nothing in here fails a deployment: every problem ends up as a
//! [`CertificateOutcome`] and a warning line in the transcript. The only error
//! returned is cancellation.

use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::deploy::context::ExecutionContext;
use crate::deploy::runner::{CommandRunner, CommandSpec};
use crate::errors::DeployError;
use crate::storage::settings::{CertificateSettings, TimeoutSettings};

const LOOKUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Finds the host's public address
#[async_trait]
pub trait PublicIpLookup: Send + Sync {
    async fn public_ip(&self) -> Result<IpAddr, DeployError>;
}

/// Resolves a domain's A records
#[async_trait]
pub trait DnsResolver: Send + Sync {
    async fn resolve(&self, domain: &str) -> Result<Vec<IpAddr>, DeployError>;
}

/// Public IP from a plain-text lookup service such as api.ipify.org
pub struct HttpIpLookup {
    client: reqwest::Client,
    url: String,
}

impl HttpIpLookup {
    pub fn new(url: impl Into<String>) -> Result<Self, DeployError> {
        let client = reqwest::Client::builder().timeout(LOOKUP_TIMEOUT).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl PublicIpLookup for HttpIpLookup {
    async fn public_ip(&self) -> Result<IpAddr, DeployError> {
        let body = self
            .client
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        body.trim()
            .parse()
            .map_err(|_| DeployError::Internal(format!("unexpected IP lookup response `{}`", body.trim())))
    }
}

/// A records through the system resolver
pub struct SystemResolver;

#[async_trait]
impl DnsResolver for SystemResolver {
    async fn resolve(&self, domain: &str) -> Result<Vec<IpAddr>, DeployError> {
        let mut ips: Vec<IpAddr> = tokio::net::lookup_host((domain, 80))
            .await?
            .map(|addr| addr.ip())
            .filter(IpAddr::is_ipv4)
            .collect();
        ips.sort();
        ips.dedup();
        Ok(ips)
    }
}

/// What happened during the certificate step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CertificateOutcome {
    Issued,
    Disabled,
    DnsMismatch {
        public_ip: IpAddr,
        resolved: Vec<IpAddr>,
    },
    LookupFailed(String),
    IssuanceFailed(String),
}

impl CertificateOutcome {
    pub fn is_issued(&self) -> bool {
        matches!(self, CertificateOutcome::Issued)
    }
}

pub struct CertificateProvisioner {
    runner: CommandRunner,
    settings: CertificateSettings,
    timeout: Duration,
    ip_lookup: Arc<dyn PublicIpLookup>,
    resolver: Arc<dyn DnsResolver>,
}

impl CertificateProvisioner {
    pub fn new(
        runner: CommandRunner,
        settings: &CertificateSettings,
        timeouts: &TimeoutSettings,
        ip_lookup: Arc<dyn PublicIpLookup>,
        resolver: Arc<dyn DnsResolver>,
    ) -> Self {
        Self {
            runner,
            settings: settings.clone(),
            timeout: timeouts.certificate_timeout(),
            ip_lookup,
            resolver,
        }
    }

    /// Provisioner using the configured lookup service and the system
    /// resolver
    pub fn from_settings(
        runner: CommandRunner,
        settings: &CertificateSettings,
        timeouts: &TimeoutSettings,
    ) -> Result<Self, DeployError> {
        let ip_lookup = HttpIpLookup::new(settings.ip_lookup_url.clone())?;
        Ok(Self::new(
            runner,
            settings,
            timeouts,
            Arc::new(ip_lookup),
            Arc::new(SystemResolver),
        ))
    }

    pub async fn provision(
        &self,
        ctx: &ExecutionContext,
        domain: &str,
    ) -> Result<CertificateOutcome, DeployError> {
        if !self.settings.enabled {
            ctx.log("SSL setup disabled, skipping");
            return Ok(CertificateOutcome::Disabled);
        }
        ctx.log("Setting up SSL...");

        let public_ip = match cancelable(ctx, self.ip_lookup.public_ip()).await? {
            Ok(ip) => ip,
            Err(e) => return Ok(lookup_failed(ctx, format!("could not determine public IP: {}", e))),
        };
        let resolved = match cancelable(ctx, self.resolver.resolve(domain)).await? {
            Ok(ips) => ips,
            Err(e) => return Ok(lookup_failed(ctx, format!("could not resolve {}: {}", domain, e))),
        };

        if !resolved.contains(&public_ip) {
            let listed = resolved
                .iter()
                .map(IpAddr::to_string)
                .collect::<Vec<_>>()
                .join(", ");
            ctx.log(format!(
                "SSL warning: DNS for {} does not point to this server ({}), it resolves to [{}]. Skipping certificate (site will still work on HTTP)",
                domain, public_ip, listed
            ));
            return Ok(CertificateOutcome::DnsMismatch {
                public_ip,
                resolved,
            });
        }

        let email = self
            .settings
            .email
            .clone()
            .unwrap_or_else(|| format!("admin@{}", domain));
        let certbot = CommandSpec::new(self.settings.certbot_command.as_str())
            .args(["--nginx", "-d", domain])
            .args(["--non-interactive", "--agree-tos", "--email", email.as_str()])
            .args(["--redirect", "--keep-until-expiring"])
            .timeout(self.timeout);

        match self.runner.run(ctx, &certbot).await {
            Ok(()) => {
                info!(domain = %domain, "certificate installed");
                ctx.log("SSL certificate installed");
                Ok(CertificateOutcome::Issued)
            }
            Err(e) if e.is_canceled() => Err(e),
            Err(e) => {
                warn!(domain = %domain, error = %e, "certificate issuance failed");
                ctx.log(format!("SSL warning: {} (site will still work on HTTP)", e));
                Ok(CertificateOutcome::IssuanceFailed(e.to_string()))
            }
        }
    }
}

fn lookup_failed(ctx: &ExecutionContext, reason: String) -> CertificateOutcome {
    warn!(reason = %reason, "certificate lookup failed");
    ctx.log(format!("SSL warning: {} (site will still work on HTTP)", reason));
    CertificateOutcome::LookupFailed(reason)
}

/// Race `fut` against the deployment's cancellation signal
async fn cancelable<T>(
    ctx: &ExecutionContext,
    fut: impl Future<Output = T>,
) -> Result<T, DeployError> {
    tokio::select! {
        biased;
        _ = ctx.cancel_token().cancelled() => Err(DeployError::Canceled),
        value = fut => Ok(value),
    }
}
