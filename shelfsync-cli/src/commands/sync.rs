//! `shelfsync sync` — run (or queue) sync attempts.

use std::collections::BTreeSet;

use anyhow::{bail, Context, Result};
use clap::Args;

use shelfsync_core::{SubscriptionId, SyncSession};
use shelfsync_daemon::{request_sync, DaemonError, SyncRequest};

use super::{home, offline};

/// Arguments for `shelfsync sync`.
#[derive(Args, Debug)]
pub struct SyncArgs {
    /// Subscription to sync (omit when using `--all`).
    pub id: Option<String>,

    /// Sync every subscription.
    #[arg(long, conflicts_with = "id")]
    pub all: bool,

    /// Fast-forward to the remote version without running plugins.
    #[arg(long)]
    pub skip: bool,
}

impl SyncArgs {
    pub fn run(self) -> Result<()> {
        let home = home()?;
        let request = match (self.id, self.all) {
            (_, true) => SyncRequest::all(),
            (Some(id), false) => SyncRequest::one(id),
            (None, false) => bail!("provide a subscription id or use --all"),
        }
        .skip(self.skip);

        match request_sync(&home, request.clone()) {
            Ok(job) => {
                println!("queued sync job {} on the daemon", job["job"]);
                return Ok(());
            }
            Err(DaemonError::DaemonNotRunning { .. }) => {}
            Err(err) => return Err(err).context("failed to queue sync"),
        }

        let (requested, sessions) = offline(&home, |controller| async move {
            let requested: Vec<SubscriptionId> = match &request.id {
                Some(id) if !request.all => vec![id.clone()],
                _ => controller
                    .repo()
                    .load_all()
                    .await?
                    .into_iter()
                    .map(|s| s.id)
                    .collect(),
            };
            let sessions = controller.synchronize(request).await?;
            Ok((requested, sessions))
        })
        .context("sync failed")?;

        if requested.is_empty() {
            println!("No subscriptions. Run `shelfsync subscribe <url>` first.");
            return Ok(());
        }
        for session in &sessions {
            print_session(session);
        }
        let synced: BTreeSet<&SubscriptionId> =
            sessions.iter().map(|s| &s.subscription.id).collect();
        let missed: Vec<&SubscriptionId> =
            requested.iter().filter(|id| !synced.contains(id)).collect();
        for id in &missed {
            println!("✗ '{id}' not synchronized (remote unavailable, removed, or a plugin failed)");
        }
        if !missed.is_empty() && sessions.is_empty() {
            bail!("no subscription was synchronized");
        }
        Ok(())
    }
}

fn print_session(session: &SyncSession) {
    let id = &session.subscription.id;
    if !session.modified {
        println!("· '{id}' unchanged at v{}", session.version);
        return;
    }
    if session.is_empty() {
        println!("✓ '{id}' now at v{}", session.version);
        return;
    }
    println!(
        "✓ '{id}' synced to v{} ({} created, {} updated, {} deleted)",
        session.version,
        session.created.len(),
        session.updated.len(),
        session.deleted.len()
    );
}
