//! `shelfsync list` — show subscriptions and their versions.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Args;
use tabled::{settings::Style, Table, Tabled};

use shelfsync_daemon::{request_list, DaemonError, SubscriptionSummary};

use super::{home, offline};

/// Arguments for `shelfsync list`.
#[derive(Args, Debug)]
pub struct ListArgs {
    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Tabled)]
struct SubscriptionRow {
    #[tabled(rename = "id")]
    id: String,
    #[tabled(rename = "topic")]
    topic: String,
    #[tabled(rename = "version")]
    version: u64,
    #[tabled(rename = "plugins")]
    plugins: String,
    #[tabled(rename = "updated")]
    updated: String,
}

impl ListArgs {
    pub fn run(self) -> Result<()> {
        let home = home()?;
        let summaries = match request_list(&home) {
            Ok(summaries) => summaries,
            Err(DaemonError::DaemonNotRunning { .. }) => offline(&home, |controller| async move {
                let all = controller.repo().load_all().await?;
                Ok(all.iter().map(SubscriptionSummary::from).collect::<Vec<_>>())
            })
            .context("failed to load subscriptions")?,
            Err(err) => return Err(err).context("failed to list subscriptions"),
        };

        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&summaries)
                    .context("failed to serialize subscriptions")?
            );
            return Ok(());
        }

        if summaries.is_empty() {
            println!("No subscriptions. Run `shelfsync subscribe <url>` first.");
            return Ok(());
        }

        let rows: Vec<SubscriptionRow> = summaries
            .into_iter()
            .map(|summary| SubscriptionRow {
                id: summary.id.to_string(),
                topic: summary.topic,
                version: summary.version,
                plugins: if summary.plugins.is_empty() {
                    "-".to_string()
                } else {
                    summary.plugins.join(" → ")
                },
                updated: format_age(summary.updated_at, Utc::now()),
            })
            .collect();
        let count = rows.len();
        let mut table = Table::new(rows);
        table.with(Style::rounded());
        println!("{table}");
        println!("{count} subscription(s)");
        Ok(())
    }
}

fn format_age(timestamp: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let secs = now.signed_duration_since(timestamp).num_seconds().max(0);
    match secs {
        0..=59 => format!("{secs}s ago"),
        60..=3_599 => format!("{}m ago", secs / 60),
        3_600..=86_399 => format!("{}h ago", secs / 3_600),
        _ => format!("{}d ago", secs / 86_400),
    }
}
