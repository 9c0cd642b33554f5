//! Built-in resource types
//!
//! Every type is a lifecycle function over the local filesystem:
//! - `fs::Directory` - a directory, optionally with a unix mode
//! - `fs::File` - a file with literal content, digested with blake3
//! - `fs::Symlink` - a symlink from `target` to `source`
//!
//! Paths go through [`crate::paths::expand`], so `~` and `$VARS` work.

pub mod directory;
pub mod file;
pub mod symlink;

use anyhow::{Context as _, Result};
use declarative::{Registry, ResourceDefinition};
use serde_json::Value;
use std::path::{Path, PathBuf};

pub use directory::Directory;
pub use file::File;
pub use symlink::Symlink;

/// Registry with every built-in type defined
pub fn registry() -> Result<Registry> {
    let mut registry = Registry::new();
    registry.register(ResourceDefinition::new(directory::TYPE, Directory)?.with_immutable(["path"]))?;
    registry.register(ResourceDefinition::new(file::TYPE, File::default())?.with_immutable(["path"]))?;
    registry.register(ResourceDefinition::new(symlink::TYPE, Symlink)?.with_immutable(["target"]))?;
    Ok(registry)
}

/// String prop that must be present
pub(crate) fn required_str<'a>(props: &'a Value, field: &str) -> Result<&'a str> {
    props
        .get(field)
        .and_then(Value::as_str)
        .with_context(|| format!("missing string prop '{field}'"))
}

/// Expanded path prop, joined onto `base` when relative
pub(crate) fn path_prop(props: &Value, field: &str, base: Option<&str>) -> Result<PathBuf> {
    let path = crate::paths::expand(required_str(props, field)?);
    match base {
        Some(base) if path.is_relative() => Ok(crate::paths::expand(base).join(path)),
        _ => Ok(path),
    }
}

pub(crate) fn display(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use declarative::{DesiredGraph, Declaration, MemoryStore, Orchestrator, Outcome, Scope, StateStore};
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn test_registry_types() {
        let registry = registry().unwrap();
        let types: Vec<_> = registry.types().iter().map(|t| t.as_str()).collect();
        assert_eq!(types, vec!["fs::Directory", "fs::File", "fs::Symlink"]);
    }

    #[test]
    fn test_path_prop() {
        let props = json!({"path": "notes.txt", "abs": "/etc/hosts"});
        assert_eq!(
            path_prop(&props, "path", Some("/tmp/base")).unwrap(),
            PathBuf::from("/tmp/base/notes.txt")
        );
        assert_eq!(
            path_prop(&props, "abs", Some("/tmp/base")).unwrap(),
            PathBuf::from("/etc/hosts")
        );
        assert!(path_prop(&props, "missing", None).is_err());
    }

    #[tokio::test]
    async fn test_apply_and_destroy_tree() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("project");
        let desired = DesiredGraph::new()
            .with(
                Declaration::new(
                    "readme",
                    file::TYPE,
                    json!({"dir": {"$ref": "project"}, "path": "README", "content": "hi\n"}),
                )
                .unwrap(),
            )
            .unwrap()
            .with(Declaration::new("project", directory::TYPE, json!({"path": display(&root)})).unwrap())
            .unwrap();

        let store = Arc::new(MemoryStore::new());
        let orchestrator = Orchestrator::new(
            Arc::new(registry().unwrap()),
            Arc::clone(&store) as Arc<dyn StateStore>,
        );
        let mut scope = Scope::new("dev");

        let result = orchestrator.apply(&mut scope, &desired).await.unwrap();
        assert!(result.is_success());
        assert_eq!(std::fs::read_to_string(root.join("README")).unwrap(), "hi\n");
        assert_eq!(scope.ids(), vec!["project", "readme"]);

        let again = orchestrator.apply(&mut scope, &desired).await.unwrap();
        assert!(again.outcomes.iter().all(|o| matches!(o.outcome, Outcome::Noop)));

        let destroyed = orchestrator.destroy(&mut scope).await.unwrap();
        assert!(destroyed.is_success());
        assert!(!root.exists());
        assert!(store.list("dev").await.unwrap().is_empty());
    }
}
