//! Build executor: dependency install and the site's build command

use std::fmt;
use std::path::Path;
use std::time::Duration;

use tracing::debug;

use crate::deploy::context::ExecutionContext;
use crate::deploy::runner::{CommandRunner, CommandSpec};
use crate::errors::DeployError;
use crate::filesys::dir::Dir;
use crate::storage::settings::TimeoutSettings;

/// Manifest whose presence triggers dependency installation
const MANIFEST: &str = "package.json";

/// Package manager selected from the lockfile in the working tree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageManager {
    Pnpm,
    Yarn,
    Npm,
}

impl PackageManager {
    /// pnpm lockfile wins over yarn's, npm is the fallback
    pub fn detect(tree: &Path) -> Self {
        if tree.join("pnpm-lock.yaml").exists() {
            PackageManager::Pnpm
        } else if tree.join("yarn.lock").exists() {
            PackageManager::Yarn
        } else {
            PackageManager::Npm
        }
    }

    pub fn program(&self) -> &'static str {
        match self {
            PackageManager::Pnpm => "pnpm",
            PackageManager::Yarn => "yarn",
            PackageManager::Npm => "npm",
        }
    }
}

impl fmt::Display for PackageManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.program())
    }
}

#[derive(Debug, Clone)]
pub struct BuildExecutor {
    runner: CommandRunner,
    install_timeout: Duration,
    build_timeout: Duration,
}

impl BuildExecutor {
    pub fn new(runner: CommandRunner, timeouts: &TimeoutSettings) -> Self {
        Self {
            runner,
            install_timeout: timeouts.install_timeout(),
            build_timeout: timeouts.build_timeout(),
        }
    }

    /// Install dependencies and run `build_command` in `tree`. Without a
    /// build command this is a no-op.
    pub async fn build(
        &self,
        ctx: &ExecutionContext,
        build_command: Option<&str>,
        tree: &Dir,
    ) -> Result<(), DeployError> {
        let Some(command) = build_command.map(str::trim).filter(|c| !c.is_empty()) else {
            ctx.log("No build command configured, skipping build");
            return Ok(());
        };

        self.install(ctx, tree).await?;

        ctx.check_canceled()?;
        ctx.log(format!("Running build: {}", command));
        let spec = CommandSpec::shell(command)
            .current_dir(tree.path())
            .timeout(self.build_timeout);
        self.runner
            .run(ctx, &spec)
            .await
            .map_err(|e| e.within(DeployError::Build))?;
        ctx.log("Build complete");
        Ok(())
    }

    async fn install(&self, ctx: &ExecutionContext, tree: &Dir) -> Result<(), DeployError> {
        if !tree.file(MANIFEST).exists().await {
            ctx.log(format!(
                "No {} found in root. Skipping auto-install (assuming build command handles it)...",
                MANIFEST
            ));
            return Ok(());
        }

        let manager = PackageManager::detect(tree.path());
        debug!(manager = %manager, "detected package manager");
        ctx.log(format!("Installing dependencies with {}...", manager));
        let spec = CommandSpec::new(manager.program())
            .arg("install")
            .current_dir(tree.path())
            .timeout(self.install_timeout);
        self.runner
            .run(ctx, &spec)
            .await
            .map_err(|e| e.within(DeployError::Build))
    }
}
