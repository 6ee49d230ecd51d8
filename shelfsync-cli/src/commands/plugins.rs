//! `shelfsync plugins` — list registered output plugins.

use anyhow::{Context, Result};
use clap::Args;
use tabled::{settings::Style, Table, Tabled};

use shelfsync_plugins::{Parameter, PluginRegistry};

/// Arguments for `shelfsync plugins`.
#[derive(Args, Debug)]
pub struct PluginsArgs {
    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Tabled)]
struct PluginRow {
    #[tabled(rename = "plugin")]
    name: String,
    #[tabled(rename = "summary")]
    summary: String,
    #[tabled(rename = "parameters")]
    parameters: String,
}

impl PluginsArgs {
    pub fn run(self) -> Result<()> {
        let registry = PluginRegistry::with_builtins().context("failed to load built-in plugins")?;
        let plugins = registry.list();

        if self.json {
            println!(
                "{}",
                serde_json::to_string_pretty(&plugins).context("failed to serialize plugins")?
            );
            return Ok(());
        }

        let rows: Vec<PluginRow> = plugins
            .into_iter()
            .map(|info| PluginRow {
                name: info.name,
                summary: info.summary.unwrap_or_default(),
                parameters: if info.configurable {
                    info.parameters.iter().map(describe).collect::<Vec<_>>().join(", ")
                } else {
                    "-".to_string()
                },
            })
            .collect();
        let mut table = Table::new(rows);
        table.with(Style::rounded());
        println!("{table}");
        Ok(())
    }
}

fn describe(parameter: &Parameter) -> String {
    match (&parameter.default, parameter.mandatory) {
        (_, true) => format!("{}*", parameter.name),
        (Some(default), false) => format!("{}={default}", parameter.name),
        (None, false) => parameter.name.clone(),
    }
}
