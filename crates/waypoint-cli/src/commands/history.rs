//! History command - show recorded validations, corrections and events.

use std::path::PathBuf;

use anyhow::{Context, Result};
use waypoint_core::{HistoryKind, HistoryStore, TaskId};

use crate::ui;

/// History command arguments.
#[derive(Debug, Clone)]
pub struct HistoryArgs {
    /// Config file override.
    pub config: Option<PathBuf>,
    /// Task to show; lists tasks when `None`.
    pub task_id: Option<String>,
    /// Record kind filter.
    pub kind: Option<String>,
    /// JSON output.
    pub json: bool,
}

fn parse_kind(kind: &str) -> Result<HistoryKind> {
    match kind {
        "validation" => Ok(HistoryKind::Validation),
        "correction" => Ok(HistoryKind::Correction),
        "streaming" => Ok(HistoryKind::Streaming),
        other => anyhow::bail!("Unknown history kind '{other}'"),
    }
}

/// Run the history command.
pub fn run_history(args: &HistoryArgs) -> Result<()> {
    let config = super::load_config(args.config.as_deref())?;
    let path = config.history_path();
    if !path.exists() {
        ui::warning(&format!("No history at {}", path.display()));
        ui::info("Set history.enabled in the config to record runs");
        return Ok(());
    }
    let store = HistoryStore::open(&path)
        .with_context(|| format!("Failed to open history at {}", path.display()))?;

    let Some(task_id) = &args.task_id else {
        let tasks = store.list_tasks()?;
        if tasks.is_empty() {
            ui::info("No tasks recorded");
        }
        for task in tasks {
            println!("{task}");
        }
        return Ok(());
    };

    let task_id = TaskId::new(task_id.clone());
    let events = match args.kind.as_deref() {
        Some(kind) => store.events_of_kind(&task_id, parse_kind(kind)?)?,
        None => store.events_for(&task_id)?,
    };

    if args.json {
        for event in &events {
            println!("{}", serde_json::to_string(event)?);
        }
        return Ok(());
    }

    ui::header(&format!("Task {task_id}"));
    if events.is_empty() {
        ui::info("No records");
    }
    for event in &events {
        let summary = summarize(event.kind, &event.payload);
        println!(
            "  {} {:<10} {}",
            event.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
            event.kind.as_str(),
            summary
        );
    }
    Ok(())
}

fn summarize(kind: HistoryKind, payload: &serde_json::Value) -> String {
    let field = |key: &str| payload.get(key).map(ToString::to_string).unwrap_or_default();
    match kind {
        HistoryKind::Validation => format!(
            "step {} passed={} recommendation={}",
            field("stepIndex"),
            field("passed"),
            field("recommendation")
        ),
        HistoryKind::Correction => format!(
            "attempt {} strategy={} source={}",
            field("attempt"),
            field("strategy"),
            field("source")
        ),
        HistoryKind::Streaming => payload
            .get("event")
            .and_then(|e| e.get("type"))
            .and_then(serde_json::Value::as_str)
            .unwrap_or("event")
            .to_string(),
    }
}
