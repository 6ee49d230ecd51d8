//! Plugin registry: registration, per-subscription configuration, catalogue.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use regex::Regex;
use serde_json::Value;

use shelfsync_core::{PluginBinding, PluginOptions, SyncSession};

use crate::builtin;
use crate::descriptor::PluginDescriptor;
use crate::error::PluginError;
use crate::plugin::{Plugin, PluginInfo};

struct Registered {
    plugin: Arc<dyn Plugin>,
    /// Compiled `validate` patterns, keyed by parameter name.
    patterns: HashMap<String, Regex>,
}

/// Every plugin known to this process, by name.
#[derive(Default)]
pub struct PluginRegistry {
    entries: BTreeMap<String, Registered>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the built-in `logger` and `file` plugins.
    pub fn with_builtins() -> Result<Self, PluginError> {
        let mut registry = Self::new();
        for plugin in builtin::all() {
            registry.register(plugin)?;
        }
        Ok(registry)
    }

    /// Register a descriptor-defined plugin.
    ///
    /// Fails with [`PluginError::Validation`] if the name or the process
    /// operation is missing.
    pub fn add(&mut self, descriptor: PluginDescriptor) -> Result<(), PluginError> {
        let plugin = descriptor.build()?;
        self.register(Arc::new(plugin))
    }

    /// Register a plugin implementation. An existing entry with the same name
    /// is replaced.
    pub fn register(&mut self, plugin: Arc<dyn Plugin>) -> Result<(), PluginError> {
        let name = plugin.name().trim().to_string();
        if name.is_empty() {
            return Err(PluginError::Validation("plugin has no name".to_string()));
        }

        let mut patterns = HashMap::new();
        for parameter in plugin.parameters() {
            if parameter.name.trim().is_empty() {
                return Err(PluginError::Validation(format!(
                    "plugin '{name}' declares a parameter without a name"
                )));
            }
            if let Some(pattern) = &parameter.validate {
                let regex = Regex::new(pattern).map_err(|e| {
                    PluginError::Validation(format!(
                        "plugin '{name}' parameter '{}' has an invalid pattern: {e}",
                        parameter.name
                    ))
                })?;
                patterns.insert(parameter.name.clone(), regex);
            }
        }

        if self.entries.contains_key(&name) {
            tracing::warn!(plugin = %name, "plugin re-registered; replacing previous definition");
        } else {
            tracing::debug!(plugin = %name, "plugin registered");
        }
        self.entries.insert(name, Registered { plugin, patterns });
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Plugin>> {
        self.entries.get(name).map(|r| Arc::clone(&r.plugin))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Catalogue of every registered plugin, ordered by name.
    pub fn list(&self) -> Vec<PluginInfo> {
        self.entries
            .values()
            .map(|r| PluginInfo::of(r.plugin.as_ref()))
            .collect()
    }

    /// Configure `name` with `options`.
    ///
    /// For each declared parameter: a mandatory parameter that is absent
    /// fails; an absent parameter with a default takes the default; a
    /// non-empty value with a `validate` pattern must match it. Options the
    /// plugin does not declare pass through untouched.
    pub fn use_plugin(
        &self,
        name: &str,
        options: &PluginOptions,
    ) -> Result<ConfiguredPlugin, PluginError> {
        let registered = self
            .entries
            .get(name)
            .ok_or_else(|| PluginError::Unknown(name.to_string()))?;

        let mut resolved = options.clone();
        for parameter in registered.plugin.parameters() {
            let present = resolved
                .get(&parameter.name)
                .filter(|value| !value.is_null())
                .cloned();

            let value = match (present, &parameter.default) {
                (Some(value), _) => value,
                (None, _) if parameter.mandatory => {
                    return Err(PluginError::Configuration {
                        plugin: name.to_string(),
                        parameter: parameter.name.clone(),
                        reason: "mandatory parameter is missing".to_string(),
                    });
                }
                (None, Some(default)) => {
                    resolved.insert(parameter.name.clone(), default.clone());
                    default.clone()
                }
                (None, None) => continue,
            };

            if let Some(regex) = registered.patterns.get(&parameter.name) {
                let text = option_text(&value);
                if !text.is_empty() && !regex.is_match(&text) {
                    return Err(PluginError::Configuration {
                        plugin: name.to_string(),
                        parameter: parameter.name.clone(),
                        reason: format!("value '{text}' does not match '{}'", regex.as_str()),
                    });
                }
            }
        }

        Ok(ConfiguredPlugin {
            plugin: Arc::clone(&registered.plugin),
            options: resolved,
        })
    }

    /// Configure a subscription's whole plugin chain, preserving order.
    pub fn configure(&self, bindings: &[PluginBinding]) -> Result<Vec<ConfiguredPlugin>, PluginError> {
        bindings
            .iter()
            .map(|binding| self.use_plugin(&binding.name, &binding.options))
            .collect()
    }
}

/// Textual form of an option value for pattern matching.
fn option_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// A plugin paired with its resolved options for one subscription.
#[derive(Clone)]
pub struct ConfiguredPlugin {
    plugin: Arc<dyn Plugin>,
    options: PluginOptions,
}

impl ConfiguredPlugin {
    pub fn name(&self) -> &str {
        self.plugin.name()
    }

    pub fn options(&self) -> &PluginOptions {
        &self.options
    }

    pub async fn process(&self, session: &SyncSession) -> Result<(), PluginError> {
        self.plugin.process(session, &self.options).await
    }
}

impl std::fmt::Debug for ConfiguredPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfiguredPlugin")
            .field("name", &self.plugin.name())
            .field("options", &self.options)
            .finish()
    }
}
