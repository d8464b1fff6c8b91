//! Site models

use deploy_api::DeploymentRequest;
use secrecy::SecretString;

use crate::errors::DeployError;

pub use deploy_api::SiteKind;

/// Start command used for backend sites that do not configure one
pub const DEFAULT_START_COMMAND: &str = "npm start";

/// Output directory meaning "the whole working tree"
pub const DEFAULT_OUTPUT_DIR: &str = ".";

/// Immutable input to one deployment
#[derive(Debug, Clone)]
pub struct SiteSpec {
    /// Site identifier, names the working tree
    pub id: String,

    /// Display name
    pub name: String,

    /// Public domain, already normalized (see [`normalize_domain`])
    pub domain: String,

    /// `owner/repo` shorthand or a full clone URL
    pub repo: String,

    /// Branch to deploy
    pub branch: String,

    /// Static or backend
    pub kind: SiteKind,

    /// Build command run verbatim in the working tree
    pub build_command: Option<String>,

    /// Build output directory, relative to the working tree
    pub output_dir: String,

    /// Backend start command
    pub start_command: String,

    /// Port assigned by a previous deployment
    pub port: Option<u16>,

    /// Short-lived code host token
    pub access_token: Option<SecretString>,

    /// Environment variables in dotenv form, written verbatim to `.env`
    pub env_vars: Option<String>,
}

impl SiteSpec {
    /// Static site with defaults for everything but the essentials
    pub fn new(
        id: impl Into<String>,
        domain: impl Into<String>,
        repo: impl Into<String>,
        branch: impl Into<String>,
    ) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            domain: domain.into(),
            repo: repo.into(),
            branch: branch.into(),
            kind: SiteKind::Static,
            build_command: None,
            output_dir: DEFAULT_OUTPUT_DIR.to_string(),
            start_command: DEFAULT_START_COMMAND.to_string(),
            port: None,
            access_token: None,
            env_vars: None,
        }
    }

    pub fn is_backend(&self) -> bool {
        self.kind == SiteKind::Backend
    }

    /// Check every field that ends up in a path, a URL or an argument vector
    pub fn validate(&self) -> Result<(), DeployError> {
        if self.id.is_empty() || !self.id.chars().all(is_id_char) {
            return Err(DeployError::InvalidSite(format!(
                "site id `{}` may only contain letters, digits, `-` and `_`",
                self.id
            )));
        }
        validate_domain(&self.domain)?;
        validate_branch(&self.branch)?;
        if self.repo.trim().is_empty() {
            return Err(DeployError::InvalidSite("repository is empty".to_string()));
        }
        if self.output_dir.split('/').any(|part| part == "..") || self.output_dir.starts_with('/') {
            return Err(DeployError::InvalidSite(format!(
                "output directory `{}` must stay inside the repository",
                self.output_dir
            )));
        }
        if self.is_backend() && self.start_command.trim().is_empty() {
            return Err(DeployError::InvalidSite(
                "backend sites require a start command".to_string(),
            ));
        }
        Ok(())
    }
}

impl From<DeploymentRequest> for SiteSpec {
    fn from(request: DeploymentRequest) -> Self {
        Self {
            id: request.site_id,
            name: request.site_name,
            domain: normalize_domain(&request.domain),
            repo: request.repo,
            branch: request.branch,
            kind: request.kind,
            build_command: request.build_command.filter(|c| !c.trim().is_empty()),
            output_dir: request
                .output_dir
                .filter(|d| !d.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_OUTPUT_DIR.to_string()),
            start_command: request
                .start_command
                .filter(|c| !c.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_START_COMMAND.to_string()),
            port: request.port,
            access_token: request
                .github_token
                .filter(|t| !t.is_empty())
                .map(SecretString::from),
            env_vars: request.env_vars.filter(|e| !e.is_empty()),
        }
    }
}

fn is_id_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_'
}

/// Strip any scheme and trailing slashes from a configured domain
pub fn normalize_domain(domain: &str) -> String {
    let domain = domain.trim();
    let domain = domain
        .strip_prefix("https://")
        .or_else(|| domain.strip_prefix("http://"))
        .unwrap_or(domain);
    domain.trim_end_matches('/').to_ascii_lowercase()
}

fn validate_domain(domain: &str) -> Result<(), DeployError> {
    let valid = !domain.is_empty()
        && domain.len() <= 253
        && !domain.starts_with(['.', '-'])
        && !domain.contains("..")
        && domain
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-');
    if !valid {
        return Err(DeployError::InvalidSite(format!(
            "`{}` is not a valid domain",
            domain
        )));
    }
    Ok(())
}

fn validate_branch(branch: &str) -> Result<(), DeployError> {
    let valid = !branch.is_empty()
        && !branch.starts_with('-')
        && !branch.contains("..")
        && !branch.chars().any(|c| c.is_whitespace() || c.is_control());
    if !valid {
        return Err(DeployError::InvalidSite(format!(
            "`{}` is not a valid branch name",
            branch
        )));
    }
    Ok(())
}
