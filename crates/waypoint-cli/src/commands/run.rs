//! Run command - execute a plan with checkpoints and self-correction.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use futures::StreamExt;

use waypoint_core::{ApiKey, Config, HistoryStore};
use waypoint_executor::context::RuntimeContext;
use waypoint_executor::correction::{CorrectionOptions, CorrectionReport, CorrectionStatus};
use waypoint_executor::llm::LlmClient;
use waypoint_executor::streaming::StreamingManager;
use waypoint_providers::OpenAIProvider;

use crate::ui::{self, PlanProgress};

/// Run command arguments.
#[derive(Debug, Clone)]
pub struct RunArgs {
    /// Plan file.
    pub plan: PathBuf,
    /// Config file override.
    pub config: Option<PathBuf>,
    /// Maximum whole-plan attempts.
    pub max_retries: Option<u32>,
    /// Per-step timeout.
    pub timeout_ms: Option<u64>,
    /// Strict checkpoints.
    pub strict: bool,
    /// Disable the LLM.
    pub no_llm: bool,
    /// JSON output.
    pub json: bool,
}

/// Run the plan command.
pub async fn run_plan(args: RunArgs) -> Result<()> {
    let mut config = super::load_config(args.config.as_deref())?;
    if let Some(max_retries) = args.max_retries {
        config.correction.max_retries = max_retries;
    }
    if let Some(timeout_ms) = args.timeout_ms {
        config.executor.timeout_ms = timeout_ms;
    }
    if args.strict {
        config.checkpoint.strict = true;
    }
    config.validate()?;

    let plan = super::load_plan(&args.plan)?;
    let total_steps = plan.len();

    let runtime = build_runtime(&config, !args.no_llm)?;
    let manager = Arc::new(StreamingManager::new(runtime));
    let mut events = Box::pin(manager.subscribe());

    let (task, handle) = manager.run_plan(plan, CorrectionOptions::from_config(&config))?;
    let task_id = task.id().clone();
    tracing::debug!(task_id = %task_id, "Plan dispatched");

    let progress = (!args.json).then(|| {
        ui::header(&format!("Running {}", args.plan.display()));
        ui::kv("Task", &task_id.to_string());
        PlanProgress::new(total_steps)
    });

    loop {
        tokio::select! {
            event = events.next() => {
                let Some(event) = event else { break };
                let terminal = event.event.is_terminal();
                match &progress {
                    Some(progress) => progress.handle(&event),
                    None => println!("{}", serde_json::to_string(&event)?),
                }
                if terminal {
                    break;
                }
            }
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl-C")?;
                if manager.cancel(&task_id, "Interrupted by user")? && progress.is_some() {
                    ui::warning("Interrupted, finishing the current step...");
                }
            }
        }
    }

    let report = handle.await.context("Plan task panicked")?;

    if args.json {
        println!("{}", serde_json::to_string(&report)?);
    } else {
        print_report(&report);
    }

    match report.status {
        CorrectionStatus::Succeeded => Ok(()),
        CorrectionStatus::Failed => anyhow::bail!("Plan failed after {} attempt(s)", report.attempts),
        CorrectionStatus::Cancelled => anyhow::bail!(
            "Plan cancelled: {}",
            report.error.as_deref().unwrap_or("no reason given")
        ),
    }
}

/// Wire up the LLM and history store the config asks for.
fn build_runtime(config: &Config, use_llm: bool) -> Result<Arc<RuntimeContext>> {
    let mut builder = RuntimeContext::builder().config(config.clone());

    if use_llm {
        match ApiKey::resolve(config.llm.api_key.as_deref()) {
            Some(key) => {
                let provider = match &config.llm.base_url {
                    Some(url) => OpenAIProvider::with_base_url(key, url.clone()),
                    None => OpenAIProvider::new(key),
                };
                builder = builder.llm(LlmClient::new(Arc::new(provider), &config.llm));
            }
            None => tracing::info!("No API key configured, LLM features disabled"),
        }
    }

    if config.history.enabled {
        let path = config.history_path();
        let store = HistoryStore::open(&path)
            .with_context(|| format!("Failed to open history at {}", path.display()))?;
        builder = builder.history(Arc::new(store));
    }

    Ok(builder.build())
}

fn print_report(report: &CorrectionReport) {
    println!();
    match report.status {
        CorrectionStatus::Succeeded => ui::success(&format!(
            "Plan succeeded after {} attempt(s)",
            report.attempts
        )),
        CorrectionStatus::Failed => ui::error(&format!(
            "Plan failed after {} attempt(s)",
            report.attempts
        )),
        CorrectionStatus::Cancelled => ui::warning("Plan cancelled"),
    }

    for correction in &report.corrections {
        ui::info(&format!(
            "Attempt {}: {} ({}) -> {}",
            correction.attempt,
            correction.diagnosis.pattern,
            correction.diagnosis.reason,
            correction.strategy
        ));
        for change in &correction.changes {
            println!("    {change}");
        }
    }

    if let Some(last) = &report.result {
        for result in &last.failed_steps {
            ui::kv(
                &format!("Step {} ({})", result.step_index + 1, result.tool),
                result.error.as_deref().unwrap_or("unknown error"),
            );
        }
    }
}
