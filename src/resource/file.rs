//! File resource with content digests

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use declarative::retry::{LogCallback, RetryConfig, with_retry};
use declarative::{Context, Lifecycle, Phase};
use serde_json::{Value, json};
use std::io::ErrorKind;
use std::path::Path;
use tokio::fs;

use super::{display, path_prop};

pub const TYPE: &str = "fs::File";

/// A file with literal content
///
/// Props: `path` (immutable), `content` (defaults to empty), `dir` (optional
/// base for a relative `path`, usually a reference to an `fs::Directory`).
/// Output carries the blake3 digest and size of the written content.
#[derive(Debug, Clone, Default)]
pub struct File {
    retry: RetryConfig,
}

impl File {
    async fn write(&self, path: &Path, content: &str) -> Result<()> {
        with_retry(&self.retry, Some(&LogCallback), is_transient, || {
            write_atomic(path, content)
        })
        .await
    }
}

#[async_trait]
impl Lifecycle for File {
    async fn run(&self, ctx: &Context, _id: &str, props: &Value) -> Result<Value> {
        let base = props.get("dir").and_then(Value::as_str);
        let path = path_prop(props, "path", base)?;
        let content = props.get("content").and_then(Value::as_str).unwrap_or("");

        match ctx.phase() {
            Phase::Create | Phase::Update => {
                let wanted = digest(content.as_bytes());
                // Re-running a create after a lost state write must not rewrite
                let current = match fs::read(&path).await {
                    Ok(bytes) => Some(digest(&bytes)),
                    Err(e) if e.kind() == ErrorKind::NotFound => None,
                    Err(e) => {
                        return Err(e)
                            .with_context(|| format!("Failed to read file: {}", path.display()));
                    }
                };
                if current.as_deref() == Some(wanted.as_str()) {
                    log::debug!("{} already up to date", path.display());
                } else {
                    self.write(&path, content).await?;
                }
                Ok(json!({
                    "id": display(&path),
                    "digest": wanted,
                    "size": content.len(),
                }))
            }
            Phase::Delete => {
                match fs::remove_file(&path).await {
                    Ok(()) => log::debug!("Removed file {}", path.display()),
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => {
                        return Err(e)
                            .with_context(|| format!("Failed to remove file: {}", path.display()));
                    }
                }
                Ok(Value::Null)
            }
        }
    }
}

/// Hex blake3 digest
pub fn digest(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}

async fn write_atomic(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create parent directory: {}", parent.display()))?;
    }
    let file_name = path
        .file_name()
        .with_context(|| format!("Not a file path: {}", path.display()))?;
    let tmp = path.with_file_name(format!(".{}.tmp", file_name.to_string_lossy()));

    fs::write(&tmp, content)
        .await
        .with_context(|| format!("Failed to write file: {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .await
        .with_context(|| format!("Failed to move file into place: {}", path.display()))?;
    Ok(())
}

fn is_transient(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|e| e.downcast_ref::<std::io::Error>())
        .any(|e| {
            matches!(
                e.kind(),
                ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use declarative::ResourceType;
    use tempfile::TempDir;

    fn ty() -> ResourceType {
        ResourceType::new(TYPE).unwrap()
    }

    #[tokio::test]
    async fn test_create_update_delete() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("hello.txt");
        let v1 = json!({ "path": display(&path), "content": "one" });

        let output = File::default()
            .run(&Context::create("dev", ty()), "hello", &v1)
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "one");
        assert_eq!(output["digest"], digest(b"one"));
        assert_eq!(output["size"], 3);

        let v2 = json!({ "path": display(&path), "content": "two" });
        let update = Context::with_prior("dev", ty(), Phase::Update, v1.clone(), output.clone());
        let output = File::default().run(&update, "hello", &v2).await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "two");
        assert_eq!(output["digest"], digest(b"two"));

        let delete = Context::with_prior("dev", ty(), Phase::Delete, v2.clone(), output);
        File::default().run(&delete, "hello", &v2).await.unwrap();
        assert!(!path.exists());
        File::default().run(&delete, "hello", &v2).await.unwrap();
    }

    #[tokio::test]
    async fn test_relative_path_uses_dir() {
        let tmp = TempDir::new().unwrap();
        let props = json!({ "dir": display(tmp.path()), "path": "notes.md" });

        let output = File::default()
            .run(&Context::create("dev", ty()), "notes", &props)
            .await
            .unwrap();
        assert_eq!(output["id"], display(&tmp.path().join("notes.md")));
        assert_eq!(std::fs::read_to_string(tmp.path().join("notes.md")).unwrap(), "");
    }

    #[tokio::test]
    async fn test_create_adopts_matching_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("same.txt");
        std::fs::write(&path, "same").unwrap();
        let before = std::fs::metadata(&path).unwrap().modified().unwrap();

        let props = json!({ "path": display(&path), "content": "same" });
        File::default()
            .run(&Context::create("dev", ty()), "same", &props)
            .await
            .unwrap();

        let after = std::fs::metadata(&path).unwrap().modified().unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_is_transient() {
        let interrupted = anyhow::Error::new(std::io::Error::from(ErrorKind::Interrupted));
        assert!(is_transient(&interrupted.context("write")));
        let denied = anyhow::Error::new(std::io::Error::from(ErrorKind::PermissionDenied));
        assert!(!is_transient(&denied));
    }
}
