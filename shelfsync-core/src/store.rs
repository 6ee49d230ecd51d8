//! Key/value storage contract.
//!
//! Two kinds of values live under a key: a *hash* (string fields) and a
//! *set* (unique string members). Keys are relative to the namespace the
//! store was opened with.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::StoreError;

/// Field map of a hash value.
pub type Fields = BTreeMap<String, String>;

/// A stored value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Document {
    Hash {
        #[serde(default)]
        fields: Fields,
    },
    Set {
        #[serde(default)]
        members: BTreeSet<String>,
    },
}

impl Document {
    fn kind(&self) -> &'static str {
        match self {
            Document::Hash { .. } => "hash",
            Document::Set { .. } => "set",
        }
    }

    pub(crate) fn into_fields(self, key: &str) -> Result<Fields, StoreError> {
        match self {
            Document::Hash { fields } => Ok(fields),
            other => Err(wrong_type(key, "hash", &other)),
        }
    }

    pub(crate) fn into_members(self, key: &str) -> Result<BTreeSet<String>, StoreError> {
        match self {
            Document::Set { members } => Ok(members),
            other => Err(wrong_type(key, "set", &other)),
        }
    }
}

fn wrong_type(key: &str, expected: &'static str, actual: &Document) -> StoreError {
    StoreError::WrongType {
        key: key.to_string(),
        expected,
        actual: actual.kind(),
    }
}

/// Merge `fields` into the hash stored at `key` (creating it if absent).
pub(crate) fn merge_fields(
    key: &str,
    current: Option<Document>,
    fields: Fields,
) -> Result<Document, StoreError> {
    let mut merged = match current {
        Some(doc) => doc.into_fields(key)?,
        None => Fields::new(),
    };
    merged.extend(fields);
    Ok(Document::Hash { fields: merged })
}

/// Apply a membership change to the set stored at `key`.
///
/// Returns `None` when the resulting set is empty.
pub(crate) fn update_members(
    key: &str,
    current: Option<Document>,
    members: &[String],
    add: bool,
) -> Result<Option<Document>, StoreError> {
    let mut set = match current {
        Some(doc) => doc.into_members(key)?,
        None => BTreeSet::new(),
    };
    for member in members {
        if add {
            set.insert(member.clone());
        } else {
            set.remove(member);
        }
    }
    if set.is_empty() {
        Ok(None)
    } else {
        Ok(Some(Document::Set { members: set }))
    }
}

/// Abstract persistent key/value service used to hold subscriptions.
#[async_trait]
pub trait Store: Send + Sync {
    /// Membership test for `key`.
    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Multi-field read of the hash at `key`; `None` if the key is absent.
    async fn read(&self, key: &str) -> Result<Option<Fields>, StoreError>;

    /// Multi-field write; merges into any existing hash at `key`.
    async fn write(&self, key: &str, fields: Fields) -> Result<(), StoreError>;

    /// Remove `key` and whatever it holds. Absent keys are not an error.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    async fn set_add(&self, key: &str, members: &[String]) -> Result<(), StoreError>;

    async fn set_remove(&self, key: &str, members: &[String]) -> Result<(), StoreError>;

    /// Members of the set at `key`; empty if absent.
    async fn set_members(&self, key: &str) -> Result<BTreeSet<String>, StoreError>;

    /// Release connections held by the store.
    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// In-memory store for local development and unit tests.
#[derive(Clone, Default)]
pub struct MemoryStore {
    docs: Arc<Mutex<HashMap<String, Document>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every key currently stored (primarily for tests).
    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.docs.lock().await.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.docs.lock().await.contains_key(key))
    }

    async fn read(&self, key: &str) -> Result<Option<Fields>, StoreError> {
        let docs = self.docs.lock().await;
        docs.get(key)
            .cloned()
            .map(|doc| doc.into_fields(key))
            .transpose()
    }

    async fn write(&self, key: &str, fields: Fields) -> Result<(), StoreError> {
        let mut docs = self.docs.lock().await;
        let merged = merge_fields(key, docs.get(key).cloned(), fields)?;
        docs.insert(key.to_string(), merged);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.docs.lock().await.remove(key);
        Ok(())
    }

    async fn set_add(&self, key: &str, members: &[String]) -> Result<(), StoreError> {
        let mut docs = self.docs.lock().await;
        match update_members(key, docs.get(key).cloned(), members, true)? {
            Some(doc) => docs.insert(key.to_string(), doc),
            None => docs.remove(key),
        };
        Ok(())
    }

    async fn set_remove(&self, key: &str, members: &[String]) -> Result<(), StoreError> {
        let mut docs = self.docs.lock().await;
        match update_members(key, docs.get(key).cloned(), members, false)? {
            Some(doc) => docs.insert(key.to_string(), doc),
            None => docs.remove(key),
        };
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<BTreeSet<String>, StoreError> {
        let docs = self.docs.lock().await;
        match docs.get(key).cloned() {
            Some(doc) => doc.into_members(key),
            None => Ok(BTreeSet::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> Fields {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn write_merges_fields() {
        let store = MemoryStore::new();
        store.write("h", fields(&[("a", "1"), ("b", "2")])).await.unwrap();
        store.write("h", fields(&[("b", "3")])).await.unwrap();
        let read = store.read("h").await.unwrap().expect("present");
        assert_eq!(read, fields(&[("a", "1"), ("b", "3")]));
    }

    #[tokio::test]
    async fn sets_add_remove_and_vanish_when_empty() {
        let store = MemoryStore::new();
        store
            .set_add("s", &["x".to_string(), "y".to_string()])
            .await
            .unwrap();
        assert_eq!(store.set_members("s").await.unwrap().len(), 2);
        store
            .set_remove("s", &["x".to_string(), "y".to_string()])
            .await
            .unwrap();
        assert!(!store.exists("s").await.unwrap());
        assert!(store.set_members("s").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn type_mismatch_is_reported() {
        let store = MemoryStore::new();
        store.set_add("k", &["m".to_string()]).await.unwrap();
        let err = store.read("k").await.unwrap_err();
        assert!(matches!(err, StoreError::WrongType { expected: "hash", .. }));
    }
}
