//! `shelfsync subscribe` / `shelfsync unsubscribe`.

use std::str::FromStr;

use anyhow::{Context, Result};
use clap::Args;

use shelfsync_core::{PluginBinding, SubscriptionId, SubscriptionInput};
use shelfsync_daemon::{request_subscribe, request_unsubscribe, DaemonError, SubscriptionSummary};

use super::{home, offline};

/// `name[:key=value,...]`, e.g. `file:directory=/srv/shelf,extension=md`.
#[derive(Debug, Clone)]
pub struct PluginArg(pub PluginBinding);

impl FromStr for PluginArg {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (name, options) = match s.split_once(':') {
            Some((name, options)) => (name, Some(options)),
            None => (s, None),
        };
        if name.trim().is_empty() {
            return Err(format!("missing plugin name in '{s}'"));
        }
        let mut binding = PluginBinding::new(name.trim());
        for pair in options.into_iter().flat_map(|o| o.split(',')) {
            if pair.trim().is_empty() {
                continue;
            }
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| format!("expected key=value, got '{pair}'"))?;
            binding = binding.with_option(key.trim(), value.trim());
        }
        Ok(Self(binding))
    }
}

/// Arguments for `shelfsync subscribe`.
#[derive(Args, Debug)]
pub struct SubscribeArgs {
    /// Library URL, e.g. `https://api.zotero.org/users/123/items`.
    pub url: String,

    /// API key sent as a bearer token.
    #[arg(long)]
    pub key: Option<String>,

    /// Explicit id; derived from the URL and key when omitted.
    #[arg(long)]
    pub id: Option<String>,

    /// Plugin to run on every sync, in order (`name[:key=value,...]`).
    #[arg(long = "plugin", value_name = "PLUGIN")]
    pub plugins: Vec<PluginArg>,
}

impl SubscribeArgs {
    pub fn run(self) -> Result<()> {
        let home = home()?;
        let input = SubscriptionInput {
            id: self.id.map(SubscriptionId::from),
            url: self.url,
            key: self.key,
            plugins: self.plugins.into_iter().map(|p| p.0).collect(),
        };

        match request_subscribe(&home, input.clone()) {
            Ok(summary) => {
                print_subscribed(&summary);
                println!("  first sync queued on the daemon");
            }
            Err(DaemonError::DaemonNotRunning { .. }) => {
                let subscription = offline(&home, |controller| async move {
                    Ok(controller.subscribe(input).await?)
                })
                .context("subscribe failed")?;
                print_subscribed(&SubscriptionSummary::from(&subscription));
                println!("  daemon not running; first sync runs when it starts or on `shelfsync sync`");
            }
            Err(err) => return Err(err).context("subscribe failed"),
        }
        Ok(())
    }
}

fn print_subscribed(summary: &SubscriptionSummary) {
    println!("✓ subscribed '{}' ({})", summary.id, summary.url);
}

/// Arguments for `shelfsync unsubscribe`.
#[derive(Args, Debug)]
pub struct UnsubscribeArgs {
    pub id: String,
}

impl UnsubscribeArgs {
    pub fn run(self) -> Result<()> {
        let home = home()?;
        let id = SubscriptionId::from(self.id);

        match request_unsubscribe(&home, id.clone()) {
            Ok(()) => {}
            Err(DaemonError::DaemonNotRunning { .. }) => {
                let target = id.clone();
                offline(&home, |controller| async move {
                    controller.unsubscribe(&target).await?;
                    Ok(())
                })
                .with_context(|| format!("unsubscribe failed for '{id}'"))?;
            }
            Err(err) => return Err(err).with_context(|| format!("unsubscribe failed for '{id}'")),
        }
        println!("✓ unsubscribed '{id}'");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    #[test]
    fn plugin_arg_parses_options() {
        let arg: PluginArg = "file:directory=/srv/shelf, extension=md".parse().unwrap();
        assert_eq!(arg.0.name, "file");
        assert_eq!(arg.0.options["directory"], Value::from("/srv/shelf"));
        assert_eq!(arg.0.options["extension"], Value::from("md"));

        let bare: PluginArg = "logger".parse().unwrap();
        assert!(bare.0.options.is_empty());
    }

    #[test]
    fn plugin_arg_rejects_garbage() {
        assert!("file:directory".parse::<PluginArg>().is_err());
        assert!(":level=info".parse::<PluginArg>().is_err());
    }
}
