//! The plugin capability contract.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use shelfsync_core::{PluginOptions, SyncSession};

use crate::error::PluginError;

/// A declared plugin parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub name: String,
    #[serde(default)]
    pub mandatory: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    /// Regular expression a non-empty value must match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Parameter {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mandatory: false,
            default: None,
            validate: None,
            description: None,
        }
    }

    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn validate(mut self, pattern: impl Into<String>) -> Self {
        self.validate = Some(pattern.into());
        self
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// A named, stateless output plugin.
///
/// Per-subscription state lives in the options passed to [`Plugin::process`],
/// never in the plugin itself; one instance serves every subscription.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> Option<&str> {
        None
    }

    fn parameters(&self) -> &[Parameter] {
        &[]
    }

    /// Replay `session` to the plugin's back-end. Resolves or rejects once.
    async fn process(
        &self,
        session: &SyncSession,
        options: &PluginOptions,
    ) -> Result<(), PluginError>;
}

/// Catalogue entry for a registered plugin.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PluginInfo {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// True iff the plugin declares at least one parameter.
    pub configurable: bool,
    pub parameters: Vec<Parameter>,
}

impl PluginInfo {
    pub fn of(plugin: &dyn Plugin) -> Self {
        Self {
            name: plugin.name().to_string(),
            summary: plugin.description().map(summarize),
            configurable: !plugin.parameters().is_empty(),
            parameters: plugin.parameters().to_vec(),
        }
    }
}

/// First sentence (or first line) of a description.
pub fn summarize(description: &str) -> String {
    let text = description.trim();
    for (idx, ch) in text.char_indices() {
        if ch == '\n' {
            return text[..idx].trim_end().to_string();
        }
        if matches!(ch, '.' | '!' | '?') {
            let end = idx + ch.len_utf8();
            if text[end..].chars().next().map_or(true, char::is_whitespace) {
                return text[..end].to_string();
            }
        }
    }
    text.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_is_first_sentence() {
        assert_eq!(
            summarize("Writes items to disk. Deleted items are removed."),
            "Writes items to disk."
        );
        assert_eq!(summarize("  Version 1.5 support! More text"), "Version 1.5 support!");
        assert_eq!(summarize("No terminator"), "No terminator");
        assert_eq!(summarize("First line\nsecond line."), "First line");
    }

    #[test]
    fn parameter_builder() {
        let p = Parameter::new("level")
            .default_value("info")
            .validate("^(debug|info)$")
            .describe("Log level.");
        assert!(!p.mandatory);
        assert_eq!(p.default, Some(Value::from("info")));
        assert_eq!(p.validate.as_deref(), Some("^(debug|info)$"));
    }
}
