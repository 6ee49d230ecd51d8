use async_trait::async_trait;
use serde_json::Value;

use shelfsync_core::{PluginOptions, SyncSession};

use crate::error::PluginError;
use crate::plugin::{Parameter, Plugin};

/// Logs a one-line summary of each session through `tracing`.
pub struct LoggerPlugin {
    parameters: Vec<Parameter>,
}

impl LoggerPlugin {
    pub fn new() -> Self {
        Self {
            parameters: vec![Parameter::new("level")
                .default_value("info")
                .validate("^(trace|debug|info|warn|error)$")
                .describe("tracing level used for the summary line")],
        }
    }
}

impl Default for LoggerPlugin {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Plugin for LoggerPlugin {
    fn name(&self) -> &str {
        "logger"
    }

    fn description(&self) -> Option<&str> {
        Some("Logs created, updated and deleted item counts for every sync. Useful for debugging plugin chains.")
    }

    fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }

    async fn process(
        &self,
        session: &SyncSession,
        options: &PluginOptions,
    ) -> Result<(), PluginError> {
        let level = options
            .get("level")
            .and_then(Value::as_str)
            .unwrap_or("info");

        macro_rules! summary {
            ($lvl:ident) => {
                tracing::$lvl!(
                    subscription = %session.subscription.id,
                    version = session.version,
                    created = session.created.len(),
                    updated = session.updated.len(),
                    deleted = session.deleted.len(),
                    "sync session"
                )
            };
        }

        match level {
            "trace" => summary!(trace),
            "debug" => summary!(debug),
            "warn" => summary!(warn),
            "error" => summary!(error),
            _ => summary!(info),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shelfsync_core::{Subscription, SubscriptionInput};

    #[tokio::test]
    async fn logs_without_failing() {
        let sub = Subscription::from_input(SubscriptionInput {
            url: "https://api.example.org/groups/7".to_string(),
            ..Default::default()
        })
        .expect("sub");
        let mut options = PluginOptions::new();
        options.insert("level".to_string(), Value::from("debug"));
        LoggerPlugin::new()
            .process(&SyncSession::new(sub), &options)
            .await
            .expect("logger never fails");
    }
}
