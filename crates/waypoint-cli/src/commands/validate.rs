//! Validate command - check a plan file without running it.

use std::path::Path;

use anyhow::Result;
use waypoint_core::validate_plan;
use waypoint_executor::capability::CapabilityRegistry;

use crate::ui;

/// Run the validate command.
pub fn run_validate(path: &Path) -> Result<()> {
    let plan = super::load_plan(path)?;
    ui::header(&format!("Plan {}", path.display()));

    if let Err(e) = validate_plan(&plan) {
        ui::error(&e.to_string());
        anyhow::bail!("Plan is invalid");
    }

    let registry = CapabilityRegistry::with_builtins();
    let mut unknown = 0;
    for (index, step) in plan.steps().iter().enumerate() {
        ui::step(index + 1, plan.len(), step.display_title());
        if registry.get(&step.tool).is_none() {
            unknown += 1;
            ui::warning(&format!("  '{}' is not a built-in capability", step.tool));
        }
    }

    println!();
    if unknown == 0 {
        ui::success(&format!("{} step(s), all capabilities available", plan.len()));
    } else {
        ui::warning(&format!(
            "{} step(s), {unknown} use capabilities that must be registered by the host",
            plan.len()
        ));
    }
    Ok(())
}
