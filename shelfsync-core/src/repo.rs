//! Subscription persistence on top of a [`Store`].
//!
//! # Key layout
//!
//! | Key                          | Kind | Contents                                  |
//! |------------------------------|------|-------------------------------------------|
//! | `subscriptions`              | set  | every subscription id                     |
//! | `subscription:<id>`          | hash | `url`, `key`, `version`, `plugins`, times |
//! |                              |      | (`synced_at` once a sync has committed)   |
//! | `subscription:<id>:items`    | set  | item keys known after the last commit     |
//!
//! The known-key set is what sync classification compares a fresh
//! change-set against; it advances in the same commit step as `version`.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::{CoreError, StoreError};
use crate::store::{Fields, Store};
use crate::types::{parse_url, PluginBinding, Subscription, SubscriptionId};

/// Set of every subscription id.
pub const SUBSCRIPTIONS_KEY: &str = "subscriptions";

/// Record fields only [`SubscriptionRepo::commit`] (or the first save) writes.
const COMMITTED_FIELDS: &[&str] = &["version", "synced_at", "created_at"];

pub fn record_key(id: &SubscriptionId) -> String {
    format!("subscription:{id}")
}

pub fn items_key(id: &SubscriptionId) -> String {
    format!("subscription:{id}:items")
}

/// Loads, saves and commits subscriptions.
#[derive(Clone)]
pub struct SubscriptionRepo {
    store: Arc<dyn Store>,
}

impl SubscriptionRepo {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub async fn exists(&self, id: &SubscriptionId) -> Result<bool, CoreError> {
        Ok(self.store.exists(&record_key(id)).await?)
    }

    /// Load one subscription; [`CoreError::NotFound`] if absent.
    pub async fn load(&self, id: &SubscriptionId) -> Result<Subscription, CoreError> {
        let key = record_key(id);
        match self.store.read(&key).await? {
            Some(fields) => Ok(from_fields(id, &key, fields)?),
            None => Err(CoreError::NotFound { id: id.clone() }),
        }
    }

    /// Load every subscription, ordered by id.
    ///
    /// Ids listed in the index whose record has gone missing are skipped.
    pub async fn load_all(&self) -> Result<Vec<Subscription>, CoreError> {
        let ids = self.store.set_members(SUBSCRIPTIONS_KEY).await?;
        let mut subscriptions = Vec::with_capacity(ids.len());
        for id in ids {
            let id = SubscriptionId::from(id);
            match self.load(&id).await {
                Ok(sub) => subscriptions.push(sub),
                Err(CoreError::NotFound { id }) => {
                    tracing::warn!(subscription = %id, "indexed subscription has no record; skipping");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(subscriptions)
    }

    /// Persist the record and index it.
    ///
    /// For a record that already exists only the caller-owned fields (`url`,
    /// `key`, `plugins`, `updated_at`) are written. `version`, `synced_at`
    /// and `created_at` stay as stored, so a save can never move a
    /// subscription behind a concurrent [`commit`](Self::commit).
    pub async fn save(&self, subscription: &Subscription) -> Result<(), CoreError> {
        let key = record_key(&subscription.id);
        let mut fields = to_fields(subscription)?;
        if self.store.exists(&key).await? {
            for field in COMMITTED_FIELDS {
                fields.remove(*field);
            }
        }
        self.store.write(&key, fields).await?;
        self.store
            .set_add(SUBSCRIPTIONS_KEY, &[subscription.id.0.clone()])
            .await?;
        Ok(())
    }

    /// Remove the record, its known-key set and its index entry.
    pub async fn destroy(&self, id: &SubscriptionId) -> Result<(), CoreError> {
        self.store.delete(&items_key(id)).await?;
        self.store.delete(&record_key(id)).await?;
        self.store
            .set_remove(SUBSCRIPTIONS_KEY, &[id.0.clone()])
            .await?;
        Ok(())
    }

    /// Item keys known as of the last committed version.
    pub async fn known_keys(&self, id: &SubscriptionId) -> Result<BTreeSet<String>, CoreError> {
        Ok(self.store.set_members(&items_key(id)).await?)
    }

    /// Advance `subscription` to `version`, folding the attempt's created
    /// keys into (and deleted keys out of) the known-key set.
    ///
    /// The key set is written before `version`: a crash in between makes the
    /// next attempt redeliver the same diff with created keys reported as
    /// updated, never lose one.
    pub async fn commit(
        &self,
        subscription: &mut Subscription,
        version: u64,
        created: &[String],
        deleted: &[String],
    ) -> Result<(), CoreError> {
        if version < subscription.version {
            return Err(CoreError::Validation(format!(
                "refusing to move subscription '{}' from version {} back to {version}",
                subscription.id, subscription.version
            )));
        }

        let items = items_key(&subscription.id);
        if !created.is_empty() {
            self.store.set_add(&items, created).await?;
        }
        if !deleted.is_empty() {
            self.store.set_remove(&items, deleted).await?;
        }

        let now = Utc::now();
        let mut fields = Fields::new();
        fields.insert("version".to_string(), version.to_string());
        fields.insert("updated_at".to_string(), now.to_rfc3339());
        fields.insert("synced_at".to_string(), now.to_rfc3339());
        self.store
            .write(&record_key(&subscription.id), fields)
            .await?;

        subscription.version = version;
        subscription.updated_at = now;
        subscription.synced_at = Some(now);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Field encoding
// ---------------------------------------------------------------------------

fn to_fields(subscription: &Subscription) -> Result<Fields, CoreError> {
    let plugins = serde_json::to_string(&subscription.plugins).map_err(|e| StoreError::Corrupt {
        key: record_key(&subscription.id),
        field: "plugins".to_string(),
        reason: e.to_string(),
    })?;

    let mut fields = Fields::new();
    fields.insert("url".to_string(), subscription.url.clone());
    fields.insert(
        "key".to_string(),
        subscription.key.clone().unwrap_or_default(),
    );
    fields.insert("version".to_string(), subscription.version.to_string());
    fields.insert("plugins".to_string(), plugins);
    fields.insert(
        "created_at".to_string(),
        subscription.created_at.to_rfc3339(),
    );
    fields.insert(
        "updated_at".to_string(),
        subscription.updated_at.to_rfc3339(),
    );
    if let Some(synced_at) = subscription.synced_at {
        fields.insert("synced_at".to_string(), synced_at.to_rfc3339());
    }
    Ok(fields)
}

fn from_fields(id: &SubscriptionId, key: &str, fields: Fields) -> Result<Subscription, StoreError> {
    let corrupt = |field: &str, reason: String| StoreError::Corrupt {
        key: key.to_string(),
        field: field.to_string(),
        reason,
    };
    let get = |field: &str| {
        fields
            .get(field)
            .cloned()
            .ok_or_else(|| corrupt(field, "missing".to_string()))
    };

    let url = get("url")?;
    let (pathname, params) = parse_url(&url).map_err(|e| corrupt("url", e.to_string()))?;
    let version = get("version")?
        .parse::<u64>()
        .map_err(|e| corrupt("version", e.to_string()))?;
    let plugins: Vec<PluginBinding> = match fields.get("plugins") {
        Some(raw) if !raw.is_empty() => {
            serde_json::from_str(raw).map_err(|e| corrupt("plugins", e.to_string()))?
        }
        _ => Vec::new(),
    };
    let optional_timestamp = |field: &str| -> Result<Option<DateTime<Utc>>, StoreError> {
        fields
            .get(field)
            .map(|raw| {
                DateTime::parse_from_rfc3339(raw)
                    .map(|t| t.with_timezone(&Utc))
                    .map_err(|e| corrupt(field, e.to_string()))
            })
            .transpose()
    };
    let timestamp = |field: &str| -> Result<DateTime<Utc>, StoreError> {
        Ok(optional_timestamp(field)?.unwrap_or_else(Utc::now))
    };

    Ok(Subscription {
        id: id.clone(),
        url,
        pathname,
        params,
        key: fields.get("key").filter(|k| !k.is_empty()).cloned(),
        version,
        plugins,
        created_at: timestamp("created_at")?,
        updated_at: timestamp("updated_at")?,
        synced_at: optional_timestamp("synced_at")?,
    })
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::SubscriptionInput;

    fn repo() -> (MemoryStore, SubscriptionRepo) {
        let store = MemoryStore::new();
        let repo = SubscriptionRepo::new(Arc::new(store.clone()));
        (store, repo)
    }

    fn sub(url: &str) -> Subscription {
        Subscription::from_input(SubscriptionInput {
            url: url.to_string(),
            key: Some("k".to_string()),
            plugins: vec![PluginBinding::new("logger").with_option("level", "debug")],
            ..Default::default()
        })
        .expect("valid")
    }

    #[tokio::test]
    async fn save_and_load_roundtrip() {
        let (_store, repo) = repo();
        let original = sub("https://x.org/users/1?tag=a");
        repo.save(&original).await.unwrap();

        let loaded = repo.load(&original.id).await.unwrap();
        assert_eq!(loaded.url, original.url);
        assert_eq!(loaded.pathname, "/users/1");
        assert_eq!(loaded.params.get("tag").map(String::as_str), Some("a"));
        assert_eq!(loaded.key.as_deref(), Some("k"));
        assert_eq!(loaded.plugins, original.plugins);
        assert_eq!(loaded.version, 0);
    }

    #[tokio::test]
    async fn load_missing_is_not_found() {
        let (_store, repo) = repo();
        let err = repo.load(&SubscriptionId::from("nope")).await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn destroy_removes_every_key() {
        let (store, repo) = repo();
        let mut s = sub("https://x.org/users/1");
        repo.save(&s).await.unwrap();
        repo.commit(&mut s, 3, &["a".to_string()], &[]).await.unwrap();
        repo.destroy(&s.id).await.unwrap();
        assert!(store.keys().await.is_empty());
        assert!(repo.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn commit_advances_version_and_known_keys() {
        let (_store, repo) = repo();
        let mut s = sub("https://x.org/users/1");
        repo.save(&s).await.unwrap();

        repo.commit(&mut s, 5, &["a".to_string(), "b".to_string()], &[])
            .await
            .unwrap();
        repo.commit(&mut s, 7, &["c".to_string()], &["a".to_string()])
            .await
            .unwrap();

        assert_eq!(s.version, 7);
        assert_eq!(repo.load(&s.id).await.unwrap().version, 7);
        let known: Vec<String> = repo.known_keys(&s.id).await.unwrap().into_iter().collect();
        assert_eq!(known, vec!["b".to_string(), "c".to_string()]);
    }

    #[tokio::test]
    async fn save_never_rewinds_a_committed_version() {
        let (_store, repo) = repo();
        let mut s = sub("https://x.org/users/1");
        repo.save(&s).await.unwrap();
        let stale = repo.load(&s.id).await.unwrap();
        repo.commit(&mut s, 7, &["a".to_string()], &[]).await.unwrap();

        let mut replaced = stale.clone();
        replaced.plugins.clear();
        repo.save(&replaced).await.unwrap();

        let loaded = repo.load(&s.id).await.unwrap();
        assert_eq!(loaded.version, 7);
        assert!(loaded.synced_at.is_some());
        assert_eq!(loaded.created_at, stale.created_at);
        assert!(loaded.plugins.is_empty());
    }

    #[tokio::test]
    async fn commit_marks_the_subscription_synced_even_at_version_zero() {
        let (_store, repo) = repo();
        let mut s = sub("https://x.org/users/1");
        repo.save(&s).await.unwrap();
        assert!(repo.load(&s.id).await.unwrap().never_synced());

        repo.commit(&mut s, 0, &[], &[]).await.unwrap();
        assert!(!s.never_synced());
        let loaded = repo.load(&s.id).await.unwrap();
        assert_eq!(loaded.version, 0);
        assert!(!loaded.never_synced());
    }

    #[tokio::test]
    async fn commit_refuses_to_go_backwards() {
        let (_store, repo) = repo();
        let mut s = sub("https://x.org/users/1");
        repo.save(&s).await.unwrap();
        repo.commit(&mut s, 9, &[], &[]).await.unwrap();
        let err = repo.commit(&mut s, 4, &[], &[]).await.unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
        assert_eq!(repo.load(&s.id).await.unwrap().version, 9);
    }

    #[tokio::test]
    async fn load_all_skips_dangling_index_entries() {
        let (store, repo) = repo();
        let s = sub("https://x.org/users/1");
        repo.save(&s).await.unwrap();
        store
            .set_add(SUBSCRIPTIONS_KEY, &["ghost".to_string()])
            .await
            .unwrap();
        let all = repo.load_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, s.id);
    }
}
