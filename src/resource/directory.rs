//! Directory resource

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use declarative::{Context, Lifecycle, Phase};
use serde_json::{Value, json};
use std::io::ErrorKind;
use std::path::Path;
use tokio::fs;

use super::{display, path_prop};

pub const TYPE: &str = "fs::Directory";

/// A directory at `path`, created with its parents
///
/// Props: `path` (immutable), `mode` (optional octal string, unix only).
/// Deleting only removes the directory when it is empty.
pub struct Directory;

#[async_trait]
impl Lifecycle for Directory {
    async fn run(&self, ctx: &Context, _id: &str, props: &Value) -> Result<Value> {
        let path = path_prop(props, "path", None)?;
        match ctx.phase() {
            Phase::Create | Phase::Update => {
                fs::create_dir_all(&path)
                    .await
                    .with_context(|| format!("Failed to create directory: {}", path.display()))?;
                if let Some(mode) = props.get("mode").and_then(Value::as_str) {
                    set_mode(&path, mode).await?;
                }
                Ok(json!({ "id": display(&path) }))
            }
            Phase::Delete => {
                match fs::remove_dir(&path).await {
                    Ok(()) => log::debug!("Removed directory {}", path.display()),
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => {
                        return Err(e).with_context(|| {
                            format!("Failed to remove directory: {}", path.display())
                        });
                    }
                }
                Ok(Value::Null)
            }
        }
    }
}

#[cfg(unix)]
async fn set_mode(path: &Path, mode: &str) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let bits = u32::from_str_radix(mode, 8).with_context(|| format!("Invalid mode '{mode}'"))?;
    fs::set_permissions(path, std::fs::Permissions::from_mode(bits))
        .await
        .with_context(|| format!("Failed to set mode {mode} on {}", path.display()))
}

#[cfg(not(unix))]
async fn set_mode(path: &Path, mode: &str) -> Result<()> {
    log::warn!("Ignoring mode {mode} for {}: not supported on this platform", path.display());
    Ok(())
}
