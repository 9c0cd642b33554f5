//! Manifest loading
//!
//! A manifest names a scope and declares its resources:
//!
//! ```toml
//! [scope]
//! name = "dev"
//! concurrency = 4
//!
//! [[resource]]
//! id = "logs"
//! type = "fs::Directory"
//! props = { path = "/tmp/provision/logs" }
//!
//! [[resource]]
//! id = "readme"
//! type = "fs::File"
//! props = { path = "/tmp/provision/logs/README", content = "hello", dir = { "$ref" = "logs" } }
//! ```

use anyhow::{Context, Result, bail};
use declarative::{Declaration, DesiredGraph, RunOptions};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Parsed manifest file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub scope: ScopeConfig,
    #[serde(default, rename = "resource")]
    pub resources: Vec<ResourceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScopeConfig {
    pub name: String,
    /// Maximum parallel invocations
    #[serde(default)]
    pub concurrency: Option<usize>,
    /// Default invocation timeout
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Where state is kept; defaults to the provision state directory
    #[serde(default)]
    pub state_dir: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceConfig {
    pub id: String,
    #[serde(rename = "type")]
    pub resource_type: String,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default = "empty_props")]
    pub props: Value,
}

fn empty_props() -> Value {
    Value::Object(serde_json::Map::new())
}

impl Manifest {
    /// Load a manifest from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Could not read manifest {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid manifest {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let manifest: Self = toml::from_str(content).context("Failed to parse TOML")?;
        if manifest.scope.name.trim().is_empty() {
            bail!("scope.name must not be empty");
        }
        if manifest.scope.concurrency == Some(0) {
            bail!("scope.concurrency must be at least 1");
        }
        Ok(manifest)
    }

    /// Build the desired graph in declaration order
    pub fn desired(&self) -> Result<DesiredGraph> {
        let mut graph = DesiredGraph::new();
        for resource in &self.resources {
            if !resource.props.is_object() {
                bail!("props of '{}' must be a table", resource.id);
            }
            let mut declaration =
                Declaration::new(&resource.id, &resource.resource_type, resource.props.clone())
                    .with_context(|| format!("Invalid resource '{}'", resource.id))?;
            if let Some(secs) = resource.timeout_secs {
                declaration = declaration.with_timeout(Duration::from_secs(secs));
            }
            graph.add(declaration)?;
        }
        Ok(graph)
    }

    /// Run options, with `jobs` from the command line taking precedence
    pub fn run_options(&self, jobs: Option<usize>) -> RunOptions {
        let defaults = RunOptions::default();
        RunOptions {
            concurrency: jobs
                .or(self.scope.concurrency)
                .unwrap_or(defaults.concurrency),
            timeout: self.scope.timeout_secs.map(Duration::from_secs),
        }
    }

    /// State directory for this manifest
    pub fn state_dir(&self) -> Result<PathBuf> {
        match &self.scope.state_dir {
            Some(dir) => Ok(crate::paths::expand(dir)),
            None => crate::paths::state_dir(),
        }
    }
}
