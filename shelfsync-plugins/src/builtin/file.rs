//! `file` plugin: mirrors a subscription's items into a directory.
//!
//! Layout: `<directory>/<subscription id>/<item key>.<extension>`, one
//! pretty-printed JSON document per item, plus `.manifest.json` holding the
//! SHA-256 of every written item.
//!
//! ## Write protocol
//!
//! 1. Serialise the item payload.
//! 2. Hash it; skip the write if the manifest already records that digest.
//! 3. Write `<path>.tmp`, then rename over `<path>`.
//! 4. Record the digest; save the manifest atomically once per session.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use shelfsync_core::{PluginOptions, SyncSession};

use crate::error::{io_err, PluginError};
use crate::plugin::{Parameter, Plugin};

const NAME: &str = "file";
pub const MANIFEST_FILE: &str = ".manifest.json";

/// Outcome of one item write or removal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteResult {
    Written { path: PathBuf },
    /// Payload hash matches the manifest.
    Unchanged { path: PathBuf },
    Removed { path: PathBuf },
}

/// Per-subscription record of written items.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub synced_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub version: u64,
    /// Item key to SHA-256 hex digest of the written document.
    #[serde(default)]
    pub files: BTreeMap<String, String>,
}

impl Manifest {
    pub fn load(dir: &Path) -> Result<Self, PluginError> {
        let path = dir.join(MANIFEST_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
        Ok(serde_json::from_str(&contents)?)
    }

    fn save(&self, dir: &Path) -> Result<(), PluginError> {
        let path = dir.join(MANIFEST_FILE);
        let json = serde_json::to_string_pretty(self)?;
        write_atomic(&path, json.as_bytes())
    }
}

pub struct FilePlugin {
    parameters: Vec<Parameter>,
}

impl FilePlugin {
    pub fn new() -> Self {
        Self {
            parameters: vec![
                Parameter::new("directory")
                    .mandatory()
                    .describe("root directory; each subscription gets a subdirectory"),
                Parameter::new("extension")
                    .default_value("json")
                    .validate("^[A-Za-z0-9]+$")
                    .describe("file extension for item documents"),
            ],
        }
    }
}

impl Default for FilePlugin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Plugin for FilePlugin {
    fn name(&self) -> &str {
        NAME
    }

    fn description(&self) -> Option<&str> {
        Some("Writes every created or updated item to a JSON file and removes deleted ones. Unchanged items are not rewritten.")
    }

    fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }

    async fn process(
        &self,
        session: &SyncSession,
        options: &PluginOptions,
    ) -> Result<(), PluginError> {
        let root = options
            .get("directory")
            .and_then(Value::as_str)
            .filter(|d| !d.is_empty())
            .ok_or_else(|| PluginError::failed(NAME, "option 'directory' is not a string"))?;
        let extension = options
            .get("extension")
            .and_then(Value::as_str)
            .unwrap_or("json")
            .to_string();
        let dir = PathBuf::from(root).join(&session.subscription.id.0);
        let session = session.clone();

        let results = tokio::task::spawn_blocking(move || mirror(&dir, &extension, &session))
            .await
            .map_err(|e| PluginError::failed(NAME, e.to_string()))??;

        let written = results
            .iter()
            .filter(|r| matches!(r, WriteResult::Written { .. }))
            .count();
        tracing::debug!(written, total = results.len(), "file plugin finished");
        Ok(())
    }
}

/// Apply one session to `dir`. Blocking.
pub fn mirror(
    dir: &Path,
    extension: &str,
    session: &SyncSession,
) -> Result<Vec<WriteResult>, PluginError> {
    std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
    let mut manifest = Manifest::load(dir)?;
    let mut results = Vec::new();

    for (key, item) in session.changed_items() {
        let path = item_path(dir, key, extension)?;
        let mut body = serde_json::to_string_pretty(item)?;
        body.push('\n');
        let digest = hex::encode(Sha256::digest(body.as_bytes()));

        if manifest.files.get(key) == Some(&digest) && path.exists() {
            tracing::trace!(path = %path.display(), "unchanged");
            results.push(WriteResult::Unchanged { path });
            continue;
        }
        write_atomic(&path, body.as_bytes())?;
        manifest.files.insert(key.to_string(), digest);
        results.push(WriteResult::Written { path });
    }

    for key in &session.deleted {
        let path = item_path(dir, key, extension)?;
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(io_err(&path, e)),
        }
        manifest.files.remove(key);
        results.push(WriteResult::Removed { path });
    }

    manifest.version = session.version;
    manifest.synced_at = Some(Utc::now());
    manifest.save(dir)?;
    Ok(results)
}

fn item_path(dir: &Path, key: &str, extension: &str) -> Result<PathBuf, PluginError> {
    let unsafe_key = key.is_empty()
        || key.starts_with('.')
        || key.contains(['/', '\\'])
        || key.contains('\0');
    if unsafe_key {
        return Err(PluginError::failed(
            NAME,
            format!("item key '{key}' cannot be used as a file name"),
        ));
    }
    Ok(dir.join(format!("{key}.{extension}")))
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), PluginError> {
    let tmp = PathBuf::from(format!("{}.tmp", path.display()));
    std::fs::write(&tmp, bytes).map_err(|e| io_err(&tmp, e))?;
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(io_err(path, e));
    }
    Ok(())
}
