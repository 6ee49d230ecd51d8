//! The sync engine: one attempt per call, committed or aborted.
//!
//! ```text
//! check ──(unchanged)──────────────────────────────► done (no commit)
//!   │
//!   ├──(skip)───────────────────────────────────────► commit
//!   │
//!   └─► fetch & classify ─► dispatch (sequential) ──► commit
//!                               │
//!                               └──(plugin fails)───► aborted
//! ```
//!
//! An aborted attempt leaves the stored version and known-key set untouched,
//! so the next attempt recomputes and redelivers the same diff. A remote
//! reporting a version below the committed one aborts before anything is
//! fetched or dispatched.

use std::sync::Arc;

use shelfsync_core::{Subscription, SubscriptionRepo, SyncSession};
use shelfsync_plugins::{ConfiguredPlugin, PluginRegistry};

use crate::classify::classify;
use crate::error::SyncError;
use crate::source::RemoteSource;

#[derive(Clone)]
pub struct SyncEngine {
    source: Arc<dyn RemoteSource>,
    plugins: Arc<PluginRegistry>,
    repo: SubscriptionRepo,
}

impl SyncEngine {
    pub fn new(
        source: Arc<dyn RemoteSource>,
        plugins: Arc<PluginRegistry>,
        repo: SubscriptionRepo,
    ) -> Self {
        Self {
            source,
            plugins,
            repo,
        }
    }

    pub fn plugins(&self) -> &Arc<PluginRegistry> {
        &self.plugins
    }

    pub fn repo(&self) -> &SubscriptionRepo {
        &self.repo
    }

    /// Run one attempt for `subscription`.
    ///
    /// On success `subscription.version` holds the committed version and the
    /// returned session describes what was delivered. With `skip` the
    /// subscription is fast-forwarded to the remote version without fetching
    /// items or invoking plugins.
    pub async fn sync(
        &self,
        subscription: &mut Subscription,
        skip: bool,
    ) -> Result<SyncSession, SyncError> {
        let id = subscription.id.clone();
        let previous = subscription.version;

        // Check
        let remote = self.source.version(subscription).await?;
        if remote < previous {
            return Err(SyncError::VersionRegressed {
                id,
                stored: previous,
                remote,
            });
        }
        let mut session = SyncSession::new(subscription.clone());
        session.version = remote;
        if remote == previous && !subscription.never_synced() {
            tracing::debug!(subscription = %id, version = previous, "remote unchanged");
            return Ok(session);
        }
        session.modified = true;

        // Fast-forward
        if skip {
            self.repo.commit(subscription, remote, &[], &[]).await?;
            tracing::info!(subscription = %id, from = previous, to = remote, "fast-forwarded");
            session.subscription = subscription.clone();
            return Ok(session);
        }

        // Fetch & classify
        let changes = self.source.changes(subscription, previous).await?;
        session.version = changes.version.max(remote);
        let known = self.repo.known_keys(&id).await?;
        classify(&mut session, changes.entries, &known);

        // Dispatch
        let chain = self.plugins.configure(&subscription.plugins)?;
        dispatch(&chain, &session).await?;

        // Commit
        self.repo
            .commit(
                subscription,
                session.version,
                &session.created,
                &session.deleted,
            )
            .await?;
        tracing::info!(
            subscription = %id,
            from = previous,
            to = session.version,
            created = session.created.len(),
            updated = session.updated.len(),
            deleted = session.deleted.len(),
            "sync committed"
        );
        session.subscription = subscription.clone();
        Ok(session)
    }
}

/// Invoke each plugin in order; the first failure stops the chain.
async fn dispatch(chain: &[ConfiguredPlugin], session: &SyncSession) -> Result<(), SyncError> {
    for plugin in chain {
        tracing::debug!(
            subscription = %session.subscription.id,
            plugin = plugin.name(),
            "dispatching"
        );
        plugin.process(session).await?;
    }
    Ok(())
}
