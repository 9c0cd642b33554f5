//! File-backed state store
//!
//! Layout: `<root>/<scope>/<id>.json`, one record per file. Ids are
//! percent-encoded so any id maps to a single file name. Writes go to a
//! temporary file first and are renamed into place.

use async_trait::async_trait;
use declarative::{Error as StoreError, StateRecord, StateStore};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;

type StoreResult<T> = declarative::Result<T>;

const RECORD_EXT: &str = "json";

/// State store keeping one JSON file per resource instance
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn scope_dir(&self, scope: &str) -> PathBuf {
        self.root.join(encode(scope))
    }

    fn record_path(&self, scope: &str, id: &str) -> PathBuf {
        self.scope_dir(scope)
            .join(format!("{}.{RECORD_EXT}", encode(id)))
    }

    /// Scopes that currently have a directory under the root
    pub async fn scopes(&self) -> StoreResult<Vec<String>> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error("read", &self.root, &e)),
        };

        let mut scopes = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| io_error("read", &self.root, &e))?
        {
            let is_dir = entry.file_type().await.is_ok_and(|t| t.is_dir());
            if is_dir && let Some(name) = entry.file_name().to_str().and_then(decode) {
                scopes.push(name);
            }
        }
        scopes.sort();
        Ok(scopes)
    }
}

#[async_trait]
impl StateStore for FileStore {
    async fn get(&self, scope: &str, id: &str) -> StoreResult<Option<StateRecord>> {
        let path = self.record_path(scope, id);
        match fs::read_to_string(&path).await {
            Ok(content) => parse_record(&path, &content).map(Some),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error("read", &path, &e)),
        }
    }

    async fn put(&self, scope: &str, record: &StateRecord) -> StoreResult<()> {
        if record.id.is_empty() {
            return Err(StoreError::Store("record id must not be empty".into()));
        }
        let dir = self.scope_dir(scope);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| io_error("create", &dir, &e))?;

        let path = self.record_path(scope, &record.id);
        let tmp = dir.join(format!(".{}.tmp", encode(&record.id)));
        let content = serde_json::to_string_pretty(record)
            .map_err(|e| StoreError::Store(format!("serialize '{}': {e}", record.id)))?;

        fs::write(&tmp, content)
            .await
            .map_err(|e| io_error("write", &tmp, &e))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| io_error("rename", &path, &e))?;

        log::debug!("Saved state record {}", path.display());
        Ok(())
    }

    async fn remove(&self, scope: &str, id: &str) -> StoreResult<()> {
        let path = self.record_path(scope, id);
        match fs::remove_file(&path).await {
            Ok(()) => log::debug!("Removed state record {}", path.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(io_error("remove", &path, &e)),
        }
        // Drop the scope directory once it is empty
        let dir = self.scope_dir(scope);
        match fs::remove_dir(&dir).await {
            Ok(()) => log::debug!("Removed empty scope directory {}", dir.display()),
            Err(e) if is_expected_cleanup(e.kind()) => {}
            Err(e) => log::debug!("Keeping scope directory {}: {e}", dir.display()),
        }
        Ok(())
    }

    async fn list(&self, scope: &str) -> StoreResult<Vec<StateRecord>> {
        let dir = self.scope_dir(scope);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error("read", &dir, &e)),
        };

        let mut records = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| io_error("read", &dir, &e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXT) {
                continue;
            }
            let content = fs::read_to_string(&path)
                .await
                .map_err(|e| io_error("read", &path, &e))?;
            records.push(parse_record(&path, &content)?);
        }
        records.sort_by_key(|r| r.sequence);
        Ok(records)
    }
}

/// Errors that mean the scope directory still has records or is already gone
fn is_expected_cleanup(kind: ErrorKind) -> bool {
    matches!(kind, ErrorKind::DirectoryNotEmpty | ErrorKind::NotFound)
}

fn parse_record(path: &Path, content: &str) -> StoreResult<StateRecord> {
    serde_json::from_str(content)
        .map_err(|e| StoreError::Store(format!("invalid record {}: {e}", path.display())))
}

fn io_error(action: &str, path: &Path, err: &std::io::Error) -> StoreError {
    StoreError::Store(format!("failed to {action} {}: {err}", path.display()))
}

/// Percent-encode everything except `[A-Za-z0-9_-]`
fn encode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'-' {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

fn decode(encoded: &str) -> Option<String> {
    let bytes = encoded.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = encoded.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}
