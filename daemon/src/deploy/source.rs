//! Source synchronizer: clone or update a site's working tree

use std::path::Path;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use tracing::{debug, info};
use url::Url;

use crate::deploy::context::ExecutionContext;
use crate::deploy::runner::{CommandRunner, CommandSpec};
use crate::errors::DeployError;
use crate::filesys::dir::Dir;
use crate::models::deployment::DEFAULT_COMMIT_MESSAGE;
use crate::storage::settings::{SourceSettings, TimeoutSettings};

/// User name the code host expects for token authentication
const TOKEN_USER: &str = "x-access-token";

/// Clones and updates working trees
#[derive(Debug, Clone)]
pub struct SourceSynchronizer {
    runner: CommandRunner,
    git_host: String,
    clone_timeout: Duration,
    fetch_timeout: Duration,
}

impl SourceSynchronizer {
    pub fn new(runner: CommandRunner, source: &SourceSettings, timeouts: &TimeoutSettings) -> Self {
        Self {
            runner,
            git_host: source.git_host.trim_end_matches('/').to_string(),
            clone_timeout: timeouts.clone_timeout(),
            fetch_timeout: timeouts.fetch_timeout(),
        }
    }

    /// Bring `tree` to the tip of `branch` and return the latest commit
    /// subject.
    pub async fn sync(
        &self,
        ctx: &ExecutionContext,
        repo: &str,
        branch: &str,
        token: Option<&SecretString>,
        tree: &Dir,
    ) -> Result<String, DeployError> {
        let clean_url = normalize_repo(repo, &self.git_host)?;
        let remote_url = token
            .and_then(|t| authenticated_url(&clean_url, t.expose_secret(), &self.git_host))
            .unwrap_or_else(|| clean_url.clone());

        if tree.path().join(".git").exists() {
            ctx.log(format!("Updating {} ({})...", repo, branch));
            self.update(ctx, &clean_url, &remote_url, branch, tree.path())
                .await
                .map_err(|e| e.within(DeployError::Source))?;
        } else {
            ctx.log(format!("Cloning {} ({})...", repo, branch));
            if tree.exists().await {
                debug!(path = %tree.path().display(), "removing stale non-git working tree");
                tree.delete().await?;
            }
            if let Some(parent) = tree.path().parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            self.clone_fresh(ctx, &clean_url, &remote_url, branch, tree.path())
                .await
                .map_err(|e| e.within(DeployError::Source))?;
        }
        ctx.log("Repository ready");

        let subject = self.commit_subject(ctx, tree.path()).await;
        info!(repo = %repo, branch = %branch, commit = %subject, "working tree synced");
        Ok(subject)
    }

    async fn update(
        &self,
        ctx: &ExecutionContext,
        clean_url: &str,
        remote_url: &str,
        branch: &str,
        tree: &Path,
    ) -> Result<(), DeployError> {
        let fetch = self.fetch_command(remote_url, branch, tree);
        self.runner.run(ctx, &fetch).await?;

        let tip = format!("origin/{}", branch);
        let reset = git(tree)
            .args(["reset", "--hard", tip.as_str()])
            .timeout(self.fetch_timeout);
        self.runner.run(ctx, &reset).await?;

        self.set_origin(ctx, clean_url, tree).await
    }

    /// Fetch straight from the (possibly token-bearing) URL so the
    /// credential never lands in .git/config
    fn fetch_command(&self, remote_url: &str, branch: &str, tree: &Path) -> CommandSpec {
        let refspec = format!("+refs/heads/{0}:refs/remotes/origin/{0}", branch);
        git(tree)
            .args(["fetch", "--depth", "1", "--"])
            .args([remote_url, refspec.as_str()])
            .label(format!("git fetch origin {}", branch))
            .timeout(self.fetch_timeout)
    }

    async fn clone_fresh(
        &self,
        ctx: &ExecutionContext,
        clean_url: &str,
        remote_url: &str,
        branch: &str,
        tree: &Path,
    ) -> Result<(), DeployError> {
        let target = tree.to_string_lossy().to_string();
        let clone = CommandSpec::new("git")
            .args(["clone", "--depth", "1", "--branch", branch, "--single-branch", "--"])
            .args([remote_url, target.as_str()])
            .label(format!("git clone {} {}", clean_url, target))
            .timeout(self.clone_timeout);
        self.runner.run(ctx, &clone).await?;

        self.set_origin(ctx, clean_url, tree).await
    }

    async fn set_origin(&self, ctx: &ExecutionContext, clean_url: &str, tree: &Path) -> Result<(), DeployError> {
        let set_url = git(tree)
            .args(["remote", "set-url", "origin", clean_url])
            .timeout(self.fetch_timeout);
        self.runner.run(ctx, &set_url).await
    }

    async fn commit_subject(&self, ctx: &ExecutionContext, tree: &Path) -> String {
        let log = git(tree)
            .args(["log", "-1", "--pretty=%s"])
            .timeout(self.fetch_timeout);
        match self.runner.output(ctx, &log).await {
            Ok(out) if !out.trim().is_empty() => out.trim().to_string(),
            Ok(_) => DEFAULT_COMMIT_MESSAGE.to_string(),
            Err(e) => {
                debug!(error = %e, "could not read commit subject");
                DEFAULT_COMMIT_MESSAGE.to_string()
            }
        }
    }
}

fn git(tree: &Path) -> CommandSpec {
    CommandSpec::new("git").current_dir(tree)
}

/// Expand `owner/repo` shorthand against `git_host` and make sure a full URL
/// ends in exactly one `.git`.
pub fn normalize_repo(repo: &str, git_host: &str) -> Result<String, DeployError> {
    let repo = repo.trim().trim_end_matches('/');
    let base = repo.strip_suffix(".git").unwrap_or(repo);

    if base.contains("://") || base.starts_with("git@") {
        return Ok(format!("{}.git", base));
    }

    let mut parts = base.split('/');
    let valid = match (parts.next(), parts.next(), parts.next()) {
        (Some(owner), Some(name), None) => is_repo_segment(owner) && is_repo_segment(name),
        _ => false,
    };
    if !valid {
        return Err(DeployError::InvalidSite(format!(
            "`{}` is neither a URL nor owner/repo",
            repo
        )));
    }
    Ok(format!("{}/{}.git", git_host.trim_end_matches('/'), base))
}

fn is_repo_segment(segment: &str) -> bool {
    !segment.is_empty()
        && !segment.starts_with(['.', '-'])
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Embed `token` into `url` when, and only when, the URL points at the
/// configured code host over HTTP(S).
pub fn authenticated_url(url: &str, token: &str, git_host: &str) -> Option<String> {
    if token.is_empty() {
        return None;
    }
    let host = Url::parse(git_host).ok()?;
    let mut url = Url::parse(url).ok()?;
    if !matches!(url.scheme(), "https" | "http") || url.host_str() != host.host_str() || url.host_str().is_none() {
        return None;
    }
    url.set_username(TOKEN_USER).ok()?;
    url.set_password(Some(token)).ok()?;
    Some(url.to_string())
}
