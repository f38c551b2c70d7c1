//! Waypoint CLI - run agent plans with checkpoints and self-correction.

mod commands;
mod ui;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};
use waypoint_core::LogFormat;

#[derive(Parser)]
#[command(name = "waypoint")]
#[command(about = "Waypoint - self-correcting plan execution for AI agents")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (default: ~/.waypoint/waypoint.json)
    #[arg(long, global = true, env = "WAYPOINT_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a plan file
    Run {
        /// Plan file (JSON5: an array of steps or {"steps": [...]})
        plan: PathBuf,

        /// Maximum whole-plan attempts
        #[arg(long)]
        max_retries: Option<u32>,

        /// Per-step timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Treat every checkpoint rule as critical
        #[arg(long)]
        strict: bool,

        /// Do not use the LLM for diagnosis, quality or regeneration
        #[arg(long)]
        no_llm: bool,

        /// Print progress events and the final report as JSON lines
        #[arg(long)]
        json: bool,
    },

    /// Check a plan file without running it
    Validate {
        /// Plan file
        plan: PathBuf,
    },

    /// Configuration
    Config {
        #[command(subcommand)]
        action: Option<ConfigCommands>,
    },

    /// Show recorded history
    History {
        /// Task id (lists recorded tasks when omitted)
        task_id: Option<String>,

        /// Only this record kind: validation, correction or streaming
        #[arg(long)]
        kind: Option<String>,

        /// Print records as JSON lines
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Show the effective configuration
    Show,

    /// Validate configuration
    Validate,

    /// Print the config file path
    Path,
}

fn init_tracing(verbose: bool, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Pretty => registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .init(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logging settings come from the config when it loads; a broken config is
    // reported by the command itself.
    let settings = commands::load_config(cli.config.as_deref())
        .map(|c| c.settings)
        .unwrap_or_default();
    init_tracing(cli.verbose || settings.debug, settings.log_format);

    match cli.command {
        Commands::Run {
            plan,
            max_retries,
            timeout_ms,
            strict,
            no_llm,
            json,
        } => {
            let args = commands::run::RunArgs {
                plan,
                config: cli.config,
                max_retries,
                timeout_ms,
                strict,
                no_llm,
                json,
            };
            commands::run_plan(args).await?;
        }

        Commands::Validate { plan } => {
            commands::run_validate(&plan)?;
        }

        Commands::Config { action } => {
            let action = match action {
                Some(ConfigCommands::Validate) => commands::config::ConfigAction::Validate,
                Some(ConfigCommands::Path) => commands::config::ConfigAction::Path,
                Some(ConfigCommands::Show) | None => commands::config::ConfigAction::Show,
            };
            commands::run_config(cli.config.as_deref(), action)?;
        }

        Commands::History {
            task_id,
            kind,
            json,
        } => {
            let args = commands::history::HistoryArgs {
                config: cli.config,
                task_id,
                kind,
                json,
            };
            commands::run_history(&args)?;
        }
    }

    Ok(())
}
