//! Settings file management

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::DeployError;
use crate::filesys::file::File;
use crate::logs::LogLevel;
use crate::storage::layout::StorageLayout;

/// Daemon settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Emit logs as JSON
    #[serde(default)]
    pub log_json: bool,

    /// Also write rotated log files under the base directory
    #[serde(default)]
    pub log_to_file: bool,

    /// Host paths
    #[serde(default)]
    pub paths: StorageLayout,

    /// Per-command timeouts
    #[serde(default)]
    pub timeouts: TimeoutSettings,

    /// Source checkout settings
    #[serde(default)]
    pub source: SourceSettings,

    /// Backend port allocation
    #[serde(default)]
    pub ports: PortSettings,

    /// Reverse proxy commands
    #[serde(default)]
    pub proxy: ProxySettings,

    /// Certificate issuance
    #[serde(default)]
    pub certificates: CertificateSettings,

    /// Process supervisor
    #[serde(default)]
    pub supervisor: SupervisorSettings,

    /// Transcript archive
    #[serde(default)]
    pub transcripts: TranscriptSettings,

    /// Worker configuration
    #[serde(default)]
    pub workers: WorkerSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_json: false,
            log_to_file: false,
            paths: StorageLayout::default(),
            timeouts: TimeoutSettings::default(),
            source: SourceSettings::default(),
            ports: PortSettings::default(),
            proxy: ProxySettings::default(),
            certificates: CertificateSettings::default(),
            supervisor: SupervisorSettings::default(),
            transcripts: TranscriptSettings::default(),
            workers: WorkerSettings::default(),
        }
    }
}

impl Settings {
    /// Load settings from a file. A missing file yields defaults; a malformed
    /// one is an error.
    pub async fn load(file: &File) -> Result<Self, DeployError> {
        if !file.exists().await {
            return Ok(Self::default());
        }
        file.read_json::<Settings>()
            .await
            .map_err(|e| DeployError::Config(format!("{}: {}", file.path().display(), e)))
    }
}

/// Command timeouts, in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    pub clone: u64,
    pub fetch: u64,
    pub install: u64,
    pub build: u64,
    pub proxy: u64,
    pub supervisor: u64,
    pub certificate: u64,
}

impl TimeoutSettings {
    pub fn clone_timeout(&self) -> Duration {
        Duration::from_secs(self.clone)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch)
    }

    pub fn install_timeout(&self) -> Duration {
        Duration::from_secs(self.install)
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build)
    }

    pub fn proxy_timeout(&self) -> Duration {
        Duration::from_secs(self.proxy)
    }

    pub fn supervisor_timeout(&self) -> Duration {
        Duration::from_secs(self.supervisor)
    }

    pub fn certificate_timeout(&self) -> Duration {
        Duration::from_secs(self.certificate)
    }
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            clone: 120,
            fetch: 60,
            install: 300,
            build: 300,
            proxy: 60,
            supervisor: 60,
            certificate: 120,
        }
    }
}

/// Source checkout settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceSettings {
    /// Code host used to expand `owner/repo` shorthand. Access tokens are
    /// only ever sent to this host.
    pub git_host: String,
}

impl Default for SourceSettings {
    fn default() -> Self {
        Self {
            git_host: "https://github.com".to_string(),
        }
    }
}

/// Port allocation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortSettings {
    /// First port handed out to backend processes
    pub base_port: u16,

    /// Also skip ports that something on the host is already listening on
    pub probe_listeners: bool,
}

impl Default for PortSettings {
    fn default() -> Self {
        Self {
            base_port: 3001,
            probe_listeners: true,
        }
    }
}

/// Reverse proxy commands, as argument vectors
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySettings {
    pub validate_command: Vec<String>,
    pub reload_command: Vec<String>,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            validate_command: vec!["nginx".to_string(), "-t".to_string()],
            reload_command: vec![
                "systemctl".to_string(),
                "reload".to_string(),
                "nginx".to_string(),
            ],
        }
    }
}

/// Certificate issuance settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CertificateSettings {
    /// Attempt issuance at all
    pub enabled: bool,

    /// Registration email; `admin@<domain>` when unset
    pub email: Option<String>,

    /// Service answering with the host's public IP as plain text
    pub ip_lookup_url: String,

    /// certbot executable
    pub certbot_command: String,
}

impl Default for CertificateSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            email: None,
            ip_lookup_url: "https://api.ipify.org".to_string(),
            certbot_command: "certbot".to_string(),
        }
    }
}

/// Process supervisor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorSettings {
    /// pm2 executable
    pub command: String,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            command: "pm2".to_string(),
        }
    }
}

/// Transcript archive settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscriptSettings {
    /// Archived transcripts kept per site
    pub keep: usize,
}

impl Default for TranscriptSettings {
    fn default() -> Self {
        Self { keep: 20 }
    }
}

/// Worker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Deployments running at the same time (different domains)
    pub max_concurrent_deployments: usize,

    /// Spool directory polling interval in seconds
    pub spool_poll_interval_secs: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            max_concurrent_deployments: 4,
            spool_poll_interval_secs: 2,
        }
    }
}
