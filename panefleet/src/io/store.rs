//! Named-record storage for persisted state.
//!
//! Registry records, the restart breadcrumb, resize markers and the mobile flag
//! are all small named blobs. [`StateStore`] lets the orchestration code stay
//! agnostic of where they live; [`FsStore`] writes files atomically (temp file +
//! rename) and [`MemoryStore`] backs tests.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::debug;

use crate::sync::lock;

/// Storage for named text records.
pub trait StateStore: Send + Sync {
    /// Read a record. Missing records are `Ok(None)`.
    fn read(&self, name: &str) -> Result<Option<String>>;
    /// Create or replace a record.
    fn write(&self, name: &str, contents: &str) -> Result<()>;
    /// Remove a record. Returns whether it existed.
    fn remove(&self, name: &str) -> Result<bool>;
    /// Names of all records ending with `suffix`, sorted.
    fn list(&self, suffix: &str) -> Result<Vec<String>>;

    fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.read(name)?.is_some())
    }
}

/// Serialize `value` to pretty-printed JSON with trailing newline.
pub fn to_json<T: Serialize>(value: &T) -> Result<String> {
    let mut payload = serde_json::to_string_pretty(value).context("serialize json")?;
    payload.push('\n');
    Ok(payload)
}

/// Directory-backed store. Record names are file names inside `root`.
#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

impl StateStore for FsStore {
    fn read(&self, name: &str) -> Result<Option<String>> {
        let path = self.path(name);
        match fs::read_to_string(&path) {
            Ok(contents) => Ok(Some(contents)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("read {}", path.display())),
        }
    }

    fn write(&self, name: &str, contents: &str) -> Result<()> {
        write_atomic(&self.path(name), contents)
    }

    fn remove(&self, name: &str) -> Result<bool> {
        let path = self.path(name);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err).with_context(|| format!("remove {}", path.display())),
        }
    }

    fn list(&self, suffix: &str) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("list {}", self.root.display()));
            }
        };
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.with_context(|| format!("list {}", self.root.display()))?;
            if let Some(name) = entry.file_name().to_str()
                && name.ends_with(suffix)
            {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }
}

/// Atomically write `contents` to `path` (temp file + rename).
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut tmp_name = path
        .file_name()
        .with_context(|| format!("path missing file name {}", path.display()))?
        .to_os_string();
    tmp_name.push(format!(".{}.tmp", std::process::id()));
    let tmp_path = parent.join(tmp_name);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    debug!(path = %path.display(), bytes = contents.len(), "wrote record");
    Ok(())
}

/// In-memory store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStore {
    fn read(&self, name: &str) -> Result<Option<String>> {
        Ok(lock(&self.records).get(name).cloned())
    }

    fn write(&self, name: &str, contents: &str) -> Result<()> {
        lock(&self.records).insert(name.to_string(), contents.to_string());
        Ok(())
    }

    fn remove(&self, name: &str) -> Result<bool> {
        Ok(lock(&self.records).remove(name).is_some())
    }

    fn list(&self, suffix: &str) -> Result<Vec<String>> {
        Ok(lock(&self.records)
            .keys()
            .filter(|name| name.ends_with(suffix))
            .cloned()
            .collect())
    }
}
