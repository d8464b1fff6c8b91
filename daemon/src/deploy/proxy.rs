//! Reverse proxy configurator (nginx virtual hosts)

use std::path::Path;
use std::time::Duration;

use tracing::{info, warn};

use crate::deploy::context::ExecutionContext;
use crate::deploy::runner::{CommandRunner, CommandSpec};
use crate::errors::DeployError;
use crate::storage::layout::StorageLayout;
use crate::storage::settings::{ProxySettings, TimeoutSettings};

const SECURITY_HEADERS: &str = r#"    # Security headers
    add_header X-Frame-Options "SAMEORIGIN" always;
    add_header X-Content-Type-Options "nosniff" always;
    add_header X-XSS-Protection "1; mode=block" always;
"#;

/// Virtual host serving `root` as a single-page application
pub fn render_static(domain: &str, root: &Path) -> String {
    format!(
        r#"server {{
    listen 80;
    server_name {domain};

    root {root};
    index index.html;

    location / {{
        try_files $uri $uri/ /index.html;
    }}

    # Cache static assets
    location ~* \.(js|css|png|jpg|jpeg|gif|ico|svg|woff|woff2|ttf|eot)$ {{
        expires 30d;
        add_header Cache-Control "public, immutable";
    }}

{headers}}}
"#,
        domain = domain,
        root = root.display(),
        headers = SECURITY_HEADERS,
    )
}

/// Virtual host proxying to a backend on the loopback interface
pub fn render_proxy(domain: &str, port: u16) -> String {
    format!(
        r#"server {{
    listen 80;
    server_name {domain};

    location / {{
        proxy_pass http://127.0.0.1:{port};
        proxy_http_version 1.1;
        proxy_set_header Upgrade $http_upgrade;
        proxy_set_header Connection "upgrade";
        proxy_set_header Host $host;
        proxy_set_header X-Real-IP $remote_addr;
        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;
        proxy_set_header X-Forwarded-Proto $scheme;
        proxy_cache_bypass $http_upgrade;
    }}

{headers}}}
"#,
        domain = domain,
        port = port,
        headers = SECURITY_HEADERS,
    )
}

/// Installs virtual hosts and reloads the proxy
#[derive(Debug, Clone)]
pub struct ProxyConfigurator {
    runner: CommandRunner,
    layout: StorageLayout,
    validate_command: Vec<String>,
    reload_command: Vec<String>,
    timeout: Duration,
}

impl ProxyConfigurator {
    pub fn new(
        runner: CommandRunner,
        layout: StorageLayout,
        settings: &ProxySettings,
        timeouts: &TimeoutSettings,
    ) -> Self {
        Self {
            runner,
            layout,
            validate_command: settings.validate_command.clone(),
            reload_command: settings.reload_command.clone(),
            timeout: timeouts.proxy_timeout(),
        }
    }

    /// Write `config` for `domain`, enable it, validate the whole proxy
    /// configuration and reload. An unchanged file is left untouched. If
    /// validation fails, the previous file is put back.
    pub async fn install(
        &self,
        ctx: &ExecutionContext,
        domain: &str,
        config: &str,
    ) -> Result<(), DeployError> {
        ctx.log("Configuring Nginx...");
        let file = self.layout.available_config(domain);
        let previous = if file.exists().await {
            Some(file.read_string().await?)
        } else {
            None
        };

        if previous.as_deref() == Some(config) {
            ctx.log("Virtual host unchanged");
        } else {
            file.write_atomic(config.as_bytes())
                .await
                .map_err(|e| DeployError::ProxyConfig(e.to_string()))?;
        }

        let link = self.layout.enabled_link(domain);
        let linked = link
            .symlink_to(file.path())
            .await
            .map_err(|e| DeployError::ProxyConfig(e.to_string()))?;
        if linked {
            info!(domain = %domain, "virtual host enabled");
        }

        if let Err(err) = self.run(ctx, &self.validate_command).await {
            if !err.is_canceled() && previous.as_deref() != Some(config) {
                self.roll_back(ctx, domain, previous.as_deref(), linked).await;
            }
            return Err(err);
        }
        self.run(ctx, &self.reload_command).await?;

        ctx.log("Nginx configured and reloaded");
        Ok(())
    }

    async fn run(&self, ctx: &ExecutionContext, argv: &[String]) -> Result<(), DeployError> {
        let spec = CommandSpec::from_argv(argv)?.timeout(self.timeout);
        self.runner
            .run(ctx, &spec)
            .await
            .map_err(|e| e.within(DeployError::ProxyConfig))
    }

    async fn roll_back(&self, ctx: &ExecutionContext, domain: &str, previous: Option<&str>, linked: bool) {
        ctx.log("Configuration rejected, restoring previous virtual host");
        let file = self.layout.available_config(domain);
        let restored = match previous {
            Some(contents) => file.write_atomic(contents.as_bytes()).await,
            None => file.delete().await,
        };
        if let Err(e) = restored {
            warn!(domain = %domain, error = %e, "could not restore virtual host");
        }
        if linked {
            if let Err(e) = self.layout.enabled_link(domain).delete().await {
                warn!(domain = %domain, error = %e, "could not remove enable link");
            }
        }
    }
}
