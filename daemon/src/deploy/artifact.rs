//! Artifact resolver and static publication

use tracing::info;

use crate::deploy::context::ExecutionContext;
use crate::errors::DeployError;
use crate::filesys::dir::Dir;
use crate::models::site::DEFAULT_OUTPUT_DIR;

/// Probed in order when the configured output directory does not exist
pub const FALLBACK_DIRS: [&str; 4] = ["dist", "build", "out", "public"];

/// Never published to the web root
const PUBLISH_EXCLUDES: [&str; 3] = [".git", ".env", "node_modules"];

/// Locate the directory holding the build output.
///
/// The default output directory (`.`) is the working tree itself. Any other
/// configured directory must exist and be non-empty, or be substituted by the
/// first existing entry of [`FALLBACK_DIRS`].
pub async fn resolve(
    ctx: &ExecutionContext,
    tree: &Dir,
    output_dir: &str,
) -> Result<Dir, DeployError> {
    let configured = output_dir
        .trim()
        .trim_start_matches("./")
        .trim_end_matches('/');
    if configured.is_empty() || configured == DEFAULT_OUTPUT_DIR {
        return Ok(Dir::new(tree.path()));
    }

    let dir = tree.subdir(configured);
    if dir.exists().await {
        return ensure_not_empty(dir, configured).await;
    }

    for candidate in FALLBACK_DIRS.iter().filter(|c| **c != configured) {
        let dir = tree.subdir(candidate);
        if dir.exists().await {
            ctx.log(format!(
                "Output directory '{}' not found, using '{}' instead",
                configured, candidate
            ));
            return ensure_not_empty(dir, candidate).await;
        }
    }

    Err(DeployError::ArtifactMissing(format!(
        "output directory '{}' not found, and none of {} exist",
        configured,
        FALLBACK_DIRS.join(", ")
    )))
}

async fn ensure_not_empty(dir: Dir, name: &str) -> Result<Dir, DeployError> {
    if dir.is_empty().await? {
        return Err(DeployError::ArtifactMissing(format!(
            "output directory '{}' is empty",
            name
        )));
    }
    Ok(dir)
}

/// Replace the contents of `site_dir` with the artifact. On failure the
/// previously published files stay in place.
pub async fn publish(
    ctx: &ExecutionContext,
    artifact: &Dir,
    site_dir: &Dir,
) -> Result<(), DeployError> {
    ctx.log(format!("Publishing {}...", artifact.path().display()));
    let copied = site_dir
        .replace_with_mirror_of(artifact, &PUBLISH_EXCLUDES)
        .await?;
    info!(files = copied, dest = %site_dir.path().display(), "artifact published");
    ctx.log(format!("Files deployed to {}", site_dir.path().display()));
    Ok(())
}
