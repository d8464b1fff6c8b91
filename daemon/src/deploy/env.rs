//! Environment file injection

use std::collections::BTreeMap;

use crate::deploy::context::ExecutionContext;
use crate::errors::DeployError;
use crate::filesys::dir::Dir;

/// Name of the environment file written into the working tree
pub const ENV_FILE: &str = ".env";

/// Write the caller's environment blob verbatim into `dir`. Returns whether
/// anything was written.
pub async fn write_env_file(
    ctx: &ExecutionContext,
    dir: &Dir,
    blob: Option<&str>,
) -> Result<bool, DeployError> {
    let Some(blob) = blob.filter(|b| !b.trim().is_empty()) else {
        return Ok(false);
    };
    ctx.log("Injecting stored .env variables...");
    dir.file(ENV_FILE).write_string(blob).await?;
    Ok(true)
}

/// Parse a dotenv blob into key/value pairs
pub fn parse_env_blob(blob: &str) -> Result<BTreeMap<String, String>, DeployError> {
    let mut vars = BTreeMap::new();
    for item in dotenvy::from_read_iter(blob.as_bytes()) {
        let (key, value) = item.map_err(|e| {
            DeployError::InvalidSite(format!("malformed environment variables: {}", e))
        })?;
        vars.insert(key, value);
    }
    Ok(vars)
}
