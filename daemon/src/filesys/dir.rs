//! Directory operations

use std::path::{Path, PathBuf};

use tokio::fs;

use crate::errors::DeployError;
use crate::filesys::file::File;

/// A directory wrapper with path
#[derive(Debug, Clone)]
pub struct Dir {
    path: PathBuf,
}

impl Dir {
    /// Create a new directory reference
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Get the directory path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check if the directory exists
    pub async fn exists(&self) -> bool {
        fs::metadata(&self.path)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }

    /// Create the directory (and parents)
    pub async fn create(&self) -> Result<(), DeployError> {
        fs::create_dir_all(&self.path).await?;
        Ok(())
    }

    /// Delete the directory and all contents
    pub async fn delete(&self) -> Result<(), DeployError> {
        if self.exists().await {
            fs::remove_dir_all(&self.path).await?;
        }
        Ok(())
    }

    /// Whether the directory has no entries at all
    pub async fn is_empty(&self) -> Result<bool, DeployError> {
        let mut entries = fs::read_dir(&self.path).await?;
        Ok(entries.next_entry().await?.is_none())
    }

    /// List files in the directory
    pub async fn list_files(&self) -> Result<Vec<PathBuf>, DeployError> {
        let mut files = Vec::new();
        let mut entries = fs::read_dir(&self.path).await?;

        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                files.push(entry.path());
            }
        }

        files.sort();
        Ok(files)
    }

    /// Get a file within this directory
    pub fn file(&self, name: &str) -> File {
        File::new(self.path.join(name))
    }

    /// Get a subdirectory
    pub fn subdir(&self, name: &str) -> Dir {
        Dir::new(self.path.join(name))
    }

    /// Make `dest` an exact copy of this directory: previous contents of
    /// `dest` are removed, entries named in `exclude` are skipped at every
    /// level. Symlinks are recreated, not followed.
    pub async fn mirror_to(&self, dest: &Dir, exclude: &[&str]) -> Result<u64, DeployError> {
        dest.delete().await?;
        dest.create().await?;

        let mut copied = 0;
        let mut stack = vec![(self.path.clone(), dest.path.clone())];

        while let Some((from, to)) = stack.pop() {
            let mut entries = fs::read_dir(&from).await?;
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name();
                if exclude.iter().any(|e| name == *e) {
                    continue;
                }

                let src = entry.path();
                let dst = to.join(&name);
                let file_type = entry.file_type().await?;

                if file_type.is_dir() {
                    fs::create_dir_all(&dst).await?;
                    stack.push((src, dst));
                } else if file_type.is_symlink() {
                    let link = fs::read_link(&src).await?;
                    fs::symlink(link, &dst).await?;
                } else {
                    fs::copy(&src, &dst).await?;
                    copied += 1;
                }
            }
        }

        Ok(copied)
    }

    /// Sibling of this directory named `.<name>.<suffix>`
    fn sibling(&self, suffix: &str) -> Dir {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        Dir::new(self.path.with_file_name(format!(".{}.{}", name, suffix)))
    }

    /// Replace this directory with a mirror of `source`. The copy is staged
    /// next to it and swapped in by rename, so a failed copy leaves the
    /// current contents untouched.
    pub async fn replace_with_mirror_of(
        &self,
        source: &Dir,
        exclude: &[&str],
    ) -> Result<u64, DeployError> {
        let staging = self.sibling("new");
        let copied = match source.mirror_to(&staging, exclude).await {
            Ok(copied) => copied,
            Err(e) => {
                staging.delete().await?;
                return Err(e);
            }
        };

        let previous = self.sibling("old");
        previous.delete().await?;
        if self.exists().await {
            fs::rename(&self.path, &previous.path).await?;
        }
        if let Err(e) = fs::rename(&staging.path, &self.path).await {
            if previous.exists().await {
                fs::rename(&previous.path, &self.path).await?;
            }
            staging.delete().await?;
            return Err(e.into());
        }
        previous.delete().await?;
        Ok(copied)
    }
}
