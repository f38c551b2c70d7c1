//! Progress bar driven by task events.

use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use waypoint_executor::streaming::{ProgressEvent, ProgressKind};

/// Renders one task's progress events.
pub struct PlanProgress {
    bar: ProgressBar,
}

impl PlanProgress {
    /// Create a bar for a plan of `total_steps` steps.
    pub fn new(total_steps: usize) -> Self {
        let bar = ProgressBar::new(total_steps as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} steps {msg}")
        {
            bar.set_style(style.progress_chars("█▓▒░  "));
        }
        bar.enable_steady_tick(Duration::from_millis(120));
        bar.set_message("starting");
        Self { bar }
    }

    /// Apply one event to the bar.
    pub fn handle(&self, event: &ProgressEvent) {
        match &event.event {
            ProgressKind::Started { total_steps } => {
                self.bar.set_length(*total_steps as u64);
            }
            ProgressKind::Progress {
                step,
                total_steps,
                message,
                ..
            } => {
                self.bar.set_length(*total_steps as u64);
                self.bar.set_position(*step as u64);
                self.bar.set_message(message.clone());
            }
            ProgressKind::Milestone { name, data } => {
                let detail = match name.as_str() {
                    "correction" => format!(
                        "correction: {} -> {}",
                        data["pattern"].as_str().unwrap_or("unknown"),
                        data["strategy"].as_str().unwrap_or("retry")
                    ),
                    "attempt_started" => format!("attempt {}", data["attempt"]),
                    other => other.to_string(),
                };
                self.bar.println(format!("  ↻ {detail}"));
            }
            ProgressKind::Result { .. } => {}
            ProgressKind::Completed { duration_ms, .. } => {
                self.bar
                    .finish_with_message(format!("done in {duration_ms}ms"));
            }
            ProgressKind::Failed { error, .. } => {
                let first_line = error.lines().next().unwrap_or_default().to_string();
                self.bar.abandon_with_message(first_line);
            }
            ProgressKind::Cancelled { reason } => {
                self.bar.abandon_with_message(format!("cancelled: {reason}"));
            }
        }
    }
}
