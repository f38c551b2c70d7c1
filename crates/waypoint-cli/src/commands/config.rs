//! Config command.

use std::path::Path;

use anyhow::Result;
use waypoint_core::Config;

use crate::ui;

/// Config subcommand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigAction {
    /// Print the effective configuration.
    Show,
    /// Load and validate the configuration.
    Validate,
    /// Print the config file path.
    Path,
}

/// Run the config command.
pub fn run_config(path: Option<&Path>, action: ConfigAction) -> Result<()> {
    let config_path = path.map_or_else(Config::default_path, Path::to_path_buf);

    match action {
        ConfigAction::Path => {
            println!("{}", config_path.display());
        }
        ConfigAction::Validate => {
            if !config_path.exists() {
                ui::warning(&format!("Config file not found: {}", config_path.display()));
                ui::info("Defaults will be used");
                return Ok(());
            }
            match Config::load(&config_path) {
                Ok(_) => ui::success("Configuration is valid"),
                Err(e) => {
                    ui::error(&e.to_string());
                    anyhow::bail!("Invalid configuration");
                }
            }
        }
        ConfigAction::Show => {
            let mut config = super::load_config(path)?;
            if config.llm.api_key.is_some() {
                config.llm.api_key = Some("********".to_string());
            }
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
