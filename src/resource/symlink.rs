//! Symlink resource

use anyhow::{Context as _, Result, bail};
use async_trait::async_trait;
use declarative::{Context, Lifecycle, Phase};
use serde_json::{Value, json};
use std::fs;
use std::path::{Path, PathBuf};

use super::{display, path_prop};

pub const TYPE: &str = "fs::Symlink";

/// A symlink at `target` pointing to `source`
///
/// Props: `target` (immutable), `source`. A wrong symlink is replaced; a
/// regular file in the way is never touched.
pub struct Symlink;

#[derive(Debug)]
enum LinkState {
    Missing,
    Correct,
    WrongTarget(PathBuf),
    FileExists,
}

#[async_trait]
impl Lifecycle for Symlink {
    async fn run(&self, ctx: &Context, id: &str, props: &Value) -> Result<Value> {
        let source = path_prop(props, "source", None)?;
        let target = path_prop(props, "target", None)?;
        let phase = ctx.phase();
        let id = id.to_string();

        // std::fs symlink calls are blocking
        tokio::task::spawn_blocking(move || match phase {
            Phase::Create | Phase::Update => {
                ensure_link(&id, &source, &target)?;
                Ok(json!({ "id": display(&target), "source": display(&source) }))
            }
            Phase::Delete => {
                remove_link(&id, &target)?;
                Ok(Value::Null)
            }
        })
        .await
        .context("Symlink task panicked")?
    }
}

fn ensure_link(id: &str, source: &Path, target: &Path) -> Result<()> {
    match check_current(source, target)? {
        LinkState::Correct => {
            log::debug!("{id}: {} already links to {}", target.display(), source.display());
            Ok(())
        }
        LinkState::Missing => create_symlink(source, target),
        LinkState::WrongTarget(actual) => {
            log::info!(
                "{id}: relinking {} from {} to {}",
                target.display(),
                actual.display(),
                source.display()
            );
            create_symlink(source, target)
        }
        LinkState::FileExists => bail!(
            "Refusing to replace existing file at {} with a symlink",
            target.display()
        ),
    }
}

fn remove_link(id: &str, target: &Path) -> Result<()> {
    if target.is_symlink() {
        fs::remove_file(target)
            .with_context(|| format!("Failed to remove symlink: {}", target.display()))?;
        log::debug!("{id}: removed symlink {}", target.display());
    } else if target.exists() {
        log::warn!("{id}: {} is not a symlink, leaving it in place", target.display());
    }
    Ok(())
}

fn check_current(source: &Path, target: &Path) -> Result<LinkState> {
    if !target.is_symlink() {
        return Ok(if target.exists() {
            LinkState::FileExists
        } else {
            LinkState::Missing
        });
    }

    let link = fs::read_link(target).context("Failed to read symlink")?;
    let expected = source.canonicalize().unwrap_or_else(|_| source.to_path_buf());
    let actual = if link.is_absolute() {
        link.canonicalize().unwrap_or(link)
    } else {
        target
            .parent()
            .map(|p| p.join(&link))
            .and_then(|p| p.canonicalize().ok())
            .unwrap_or(link)
    };

    if expected == actual {
        Ok(LinkState::Correct)
    } else {
        Ok(LinkState::WrongTarget(actual))
    }
}

fn create_symlink(source: &Path, target: &Path) -> Result<()> {
    if !source.exists() {
        bail!("Source does not exist: {}", source.display());
    }
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create parent directory: {}", parent.display()))?;
    }
    if target.is_symlink() {
        fs::remove_file(target)
            .with_context(|| format!("Failed to remove existing symlink: {}", target.display()))?;
    }

    #[cfg(unix)]
    std::os::unix::fs::symlink(source, target).with_context(|| {
        format!("Failed to create symlink: {} -> {}", target.display(), source.display())
    })?;

    #[cfg(windows)]
    {
        use std::os::windows::fs::{symlink_dir, symlink_file};

        if source.is_dir() {
            // Junctions need no admin rights
            if let Err(e) = junction::create(source, target) {
                log::debug!("Junction creation failed ({e}), trying symlink_dir");
                symlink_dir(source, target).with_context(|| {
                    format!(
                        "Failed to create directory symlink: {} -> {}",
                        target.display(),
                        source.display()
                    )
                })?;
            }
        } else {
            symlink_file(source, target).with_context(|| {
                format!(
                    "Failed to create file symlink: {} -> {}",
                    target.display(),
                    source.display()
                )
            })?;
        }
    }

    #[cfg(not(any(unix, windows)))]
    bail!("Symlinks not supported on this platform");

    Ok(())
}
