//! YAML-on-disk implementation of [`Store`].
//!
//! # Storage layout
//!
//! ```text
//! ~/.shelfsync/
//!   store/
//!     <namespace>/                          (mode 0700)
//!       subscriptions.yaml                  (set of subscription ids)
//!       subscription.<id>.yaml              (hash — mode 0600)
//!       subscription.<id>.items.yaml        (set of known item keys)
//! ```
//!
//! `:` in store keys becomes `.` in file names. Writes follow the same
//! serialize → `.yaml.tmp` sibling → `chmod 0600` → `rename` flow as every
//! other shelfsync file, so a crash never leaves a half-written document.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::config::root_at;
use crate::error::{io_err, StoreError};
use crate::store::{merge_fields, update_members, Document, Fields, Store};

/// `<home>/.shelfsync/store/<namespace>/`
pub fn namespace_dir_at(home: &Path, namespace: &str) -> PathBuf {
    root_at(home).join("store").join(namespace)
}

/// File-backed store rooted at one namespace directory.
#[derive(Clone)]
pub struct FileStore {
    dir: PathBuf,
    // Serialises read-modify-write cycles within this process.
    write_lock: Arc<Mutex<()>>,
}

impl FileStore {
    /// Open (creating if needed) the namespace directory under `home`.
    pub fn open_at(home: &Path, namespace: &str) -> Result<Self, StoreError> {
        if namespace.is_empty() || namespace.contains(['/', '\\']) || namespace == ".." {
            return Err(StoreError::InvalidKey(namespace.to_string()));
        }
        let dir = namespace_dir_at(home, namespace);
        if !dir.exists() {
            std::fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
            set_dir_permissions(&dir)?;
        }
        Ok(Self {
            dir,
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `<dir>/<key with ':' → '.'>.yaml`. No I/O.
    pub fn document_path(&self, key: &str) -> Result<PathBuf, StoreError> {
        if key.is_empty()
            || key.contains(['/', '\\'])
            || key.starts_with('.')
            || key.contains("..")
        {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        Ok(self.dir.join(format!("{}.yaml", key.replace(':', "."))))
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    {
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|err| StoreError::Join(err.to_string()))?
    }

    async fn modify<F>(&self, key: &str, f: F) -> Result<(), StoreError>
    where
        F: FnOnce(Option<Document>) -> Result<Option<Document>, StoreError> + Send + 'static,
    {
        let path = self.document_path(key)?;
        let _guard = self.write_lock.lock().await;
        self.blocking(move || {
            let current = load_document(&path)?;
            match f(current)? {
                Some(doc) => save_document(&path, &doc),
                None => remove_document(&path),
            }
        })
        .await
    }

    async fn load(&self, key: &str) -> Result<Option<Document>, StoreError> {
        let path = self.document_path(key)?;
        self.blocking(move || load_document(&path)).await
    }
}

#[async_trait]
impl Store for FileStore {
    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.document_path(key)?.exists())
    }

    async fn read(&self, key: &str) -> Result<Option<Fields>, StoreError> {
        self.load(key)
            .await?
            .map(|doc| doc.into_fields(key))
            .transpose()
    }

    async fn write(&self, key: &str, fields: Fields) -> Result<(), StoreError> {
        let owned = key.to_string();
        self.modify(key, move |current| merge_fields(&owned, current, fields).map(Some))
            .await
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.modify(key, |_| Ok(None)).await
    }

    async fn set_add(&self, key: &str, members: &[String]) -> Result<(), StoreError> {
        let owned = key.to_string();
        let members = members.to_vec();
        self.modify(key, move |current| {
            update_members(&owned, current, &members, true)
        })
        .await
    }

    async fn set_remove(&self, key: &str, members: &[String]) -> Result<(), StoreError> {
        let owned = key.to_string();
        let members = members.to_vec();
        self.modify(key, move |current| {
            update_members(&owned, current, &members, false)
        })
        .await
    }

    async fn set_members(&self, key: &str) -> Result<BTreeSet<String>, StoreError> {
        match self.load(key).await? {
            Some(doc) => doc.into_members(key),
            None => Ok(BTreeSet::new()),
        }
    }
}

// ---------------------------------------------------------------------------
// Blocking document I/O
// ---------------------------------------------------------------------------

fn load_document(path: &Path) -> Result<Option<Document>, StoreError> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = std::fs::read_to_string(path).map_err(|e| io_err(path, e))?;
    serde_yaml::from_str(&contents)
        .map(Some)
        .map_err(|source| StoreError::Parse {
            path: path.to_path_buf(),
            source,
        })
}

fn save_document(path: &Path, doc: &Document) -> Result<(), StoreError> {
    let tmp = path.with_extension("yaml.tmp");
    let yaml = serde_yaml::to_string(doc)?;
    std::fs::write(&tmp, yaml).map_err(|e| io_err(&tmp, e))?;
    set_file_permissions(&tmp)?;
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(io_err(path, e));
    }
    Ok(())
}

fn remove_document(path: &Path) -> Result<(), StoreError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(path, err)),
    }
}

#[cfg(unix)]
fn set_dir_permissions(path: &Path) -> Result<(), StoreError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
        .map_err(|e| io_err(path, e))
}
#[cfg(not(unix))]
fn set_dir_permissions(_path: &Path) -> Result<(), StoreError> {
    Ok(())
}

#[cfg(unix)]
fn set_file_permissions(path: &Path) -> Result<(), StoreError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .map_err(|e| io_err(path, e))
}
#[cfg(not(unix))]
fn set_file_permissions(_path: &Path) -> Result<(), StoreError> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
