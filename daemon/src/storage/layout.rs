//! Host storage layout

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::filesys::dir::Dir;
use crate::filesys::file::File;

/// Where dropletd keeps its state and where it writes host configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageLayout {
    /// Base directory for daemon-owned state
    pub base_dir: PathBuf,

    /// Working trees, one per site id
    pub repos_dir: PathBuf,

    /// Published static sites, one per domain
    pub web_root: PathBuf,

    /// Rendered virtual hosts
    pub sites_available: PathBuf,

    /// Enable symlinks pointing into `sites_available`
    pub sites_enabled: PathBuf,

    /// Queued request files picked up by the spool worker
    pub spool_dir: PathBuf,
}

impl StorageLayout {
    /// Layout with every daemon-owned directory under `base_dir`, and nginx
    /// directories at their standard locations
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        Self {
            repos_dir: base_dir.join("repos"),
            spool_dir: base_dir.join("spool"),
            web_root: PathBuf::from("/var/www"),
            sites_available: PathBuf::from("/etc/nginx/sites-available"),
            sites_enabled: PathBuf::from("/etc/nginx/sites-enabled"),
            base_dir,
        }
    }

    /// Layout rooted entirely under one directory, nginx directories included
    pub fn sandboxed(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            base_dir: root.clone(),
            repos_dir: root.join("repos"),
            web_root: root.join("www"),
            sites_available: root.join("nginx/sites-available"),
            sites_enabled: root.join("nginx/sites-enabled"),
            spool_dir: root.join("spool"),
        }
    }

    /// Get the settings file path
    pub fn settings_file(&self) -> File {
        File::new(self.base_dir.join("settings.json"))
    }

    /// Get the working tree for a site
    pub fn repo_dir(&self, site_id: &str) -> Dir {
        Dir::new(self.repos_dir.join(site_id))
    }

    /// Get the published directory of a static site
    pub fn site_dir(&self, domain: &str) -> Dir {
        Dir::new(self.web_root.join(domain))
    }

    /// Get the rendered virtual host file of a domain
    pub fn available_config(&self, domain: &str) -> File {
        File::new(self.sites_available.join(domain))
    }

    /// Get the enable symlink of a domain
    pub fn enabled_link(&self, domain: &str) -> File {
        File::new(self.sites_enabled.join(domain))
    }

    /// Get the logs directory
    pub fn logs_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("logs"))
    }

    /// Get the transcript archive of a site
    pub fn transcripts_dir(&self, site_id: &str) -> Dir {
        Dir::new(self.base_dir.join("transcripts").join(site_id))
    }

    /// Get the spool directory
    pub fn spool_dir(&self) -> Dir {
        Dir::new(self.spool_dir.clone())
    }
}

impl Default for StorageLayout {
    fn default() -> Self {
        Self::new("/opt/dropletd")
    }
}
