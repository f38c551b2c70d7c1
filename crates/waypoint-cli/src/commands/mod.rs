//! CLI command implementations.

pub mod config;
pub mod history;
pub mod run;
pub mod validate;

pub use config::run_config;
pub use history::run_history;
pub use run::run_plan;
pub use validate::run_validate;

use std::path::Path;

use anyhow::{Context, Result};
use waypoint_core::Config;
use waypoint_core::types::{Plan, Step};

/// Load the config at `path`, or the default config.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::load(path)
            .with_context(|| format!("Failed to load config {}", path.display())),
        None => Config::load_default().context("Failed to load default config"),
    }
}

/// Read a plan file.
pub fn load_plan(path: &Path) -> Result<Plan> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read plan {}", path.display()))?;
    parse_plan(&content).with_context(|| format!("Invalid plan file {}", path.display()))
}

/// Parse plan text: a JSON5 array of steps, or an object with a `steps` array.
pub fn parse_plan(content: &str) -> Result<Plan> {
    let value: serde_json::Value = json5::from_str(content)?;
    let steps = match value {
        serde_json::Value::Object(mut map) => map
            .remove("steps")
            .context("Plan object has no \"steps\" field")?,
        other => other,
    };
    let steps: Vec<Step> = serde_json::from_value(steps)?;
    Ok(Plan::new(steps))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_plan_array() {
        let plan = parse_plan(
            r#"[
                // comments are fine
                { tool: "echo", params: { message: "hi" } },
                { tool: "shell", params: { command: "ls" }, timeoutMs: 500 },
            ]"#,
        )
        .unwrap();
        assert_eq!(plan.len(), 2);
        assert_eq!(plan.steps()[1].timeout_ms, Some(500));
    }

    #[test]
    fn test_parse_plan_object() {
        let plan = parse_plan(r#"{ steps: [{ tool: "echo" }] }"#).unwrap();
        assert_eq!(plan.steps()[0].tool, "echo");
        assert!(plan.steps()[0].params.is_object());
    }

    #[test]
    fn test_parse_plan_rejects_other_shapes() {
        assert!(parse_plan(r#"{ plan: [] }"#).is_err());
        assert!(parse_plan("42").is_err());
    }
}
