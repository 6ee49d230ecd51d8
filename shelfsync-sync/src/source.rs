//! The remote source collaborator: where versions and change-sets come from.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use shelfsync_core::{Subscription, SubscriptionId};

use crate::error::SyncError;

/// One entry of a remote change-set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RemoteEntry {
    /// Deletion marker. Never carries a payload.
    Deleted { key: String, deleted: bool },
    Live { key: String, data: Value },
}

impl RemoteEntry {
    pub fn live(key: impl Into<String>, data: Value) -> Self {
        RemoteEntry::Live {
            key: key.into(),
            data,
        }
    }

    pub fn deleted(key: impl Into<String>) -> Self {
        RemoteEntry::Deleted {
            key: key.into(),
            deleted: true,
        }
    }

    pub fn key(&self) -> &str {
        match self {
            RemoteEntry::Deleted { key, .. } | RemoteEntry::Live { key, .. } => key,
        }
    }
}

/// Everything that changed remotely since a given version.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    /// Remote version the change-set brings the subscription to.
    pub version: u64,
    /// Entries in delivery order.
    pub entries: Vec<RemoteEntry>,
}

/// Remote library access.
///
/// Implementations map "resource permanently gone" to
/// [`SyncError::Removed`]; everything else is treated as transient.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// Current remote version of the subscription's library.
    async fn version(&self, subscription: &Subscription) -> Result<u64, SyncError>;

    /// Every entry changed after `since`.
    async fn changes(&self, subscription: &Subscription, since: u64)
        -> Result<ChangeSet, SyncError>;
}

// ---------------------------------------------------------------------------
// In-memory source
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Library {
    version: u64,
    /// `(version, entry)` in delivery order.
    log: Vec<(u64, RemoteEntry)>,
    removed: bool,
    fetches: usize,
}

/// A [`RemoteSource`] serving per-subscription libraries held in memory.
///
/// Every [`push`](MemorySource::push) bumps the library version by one and
/// tags the entry with it; [`changes`](RemoteSource::changes) returns every
/// entry tagged after `since`.
#[derive(Clone, Default)]
pub struct MemorySource {
    libraries: Arc<Mutex<HashMap<SubscriptionId, Library>>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SubscriptionId, Library>> {
        self.libraries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Set the library version without recording an entry.
    pub fn set_version(&self, id: &SubscriptionId, version: u64) {
        self.lock().entry(id.clone()).or_default().version = version;
    }

    /// Record `entry` at the next version and return that version.
    pub fn push(&self, id: &SubscriptionId, entry: RemoteEntry) -> u64 {
        let mut libraries = self.lock();
        let library = libraries.entry(id.clone()).or_default();
        library.version += 1;
        library.log.push((library.version, entry));
        library.version
    }

    /// Make every later request for `id` report the library as gone.
    pub fn remove(&self, id: &SubscriptionId) {
        self.lock().entry(id.clone()).or_default().removed = true;
    }

    /// Number of change-set fetches served for `id`.
    pub fn fetches(&self, id: &SubscriptionId) -> usize {
        self.lock().get(id).map_or(0, |l| l.fetches)
    }
}

#[async_trait]
impl RemoteSource for MemorySource {
    async fn version(&self, subscription: &Subscription) -> Result<u64, SyncError> {
        let libraries = self.lock();
        match libraries.get(&subscription.id) {
            Some(library) if library.removed => Err(SyncError::Removed {
                id: subscription.id.clone(),
            }),
            Some(library) => Ok(library.version),
            None => Ok(0),
        }
    }

    async fn changes(
        &self,
        subscription: &Subscription,
        since: u64,
    ) -> Result<ChangeSet, SyncError> {
        let mut libraries = self.lock();
        let library = libraries.entry(subscription.id.clone()).or_default();
        if library.removed {
            return Err(SyncError::Removed {
                id: subscription.id.clone(),
            });
        }
        library.fetches += 1;
        Ok(ChangeSet {
            version: library.version,
            entries: library
                .log
                .iter()
                .filter(|(v, _)| *v > since)
                .map(|(_, e)| e.clone())
                .collect(),
        })
    }
}
