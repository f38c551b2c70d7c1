//! Sandboxed step execution.
//!
//! One step runs as: snapshot the file it mutates, race the capability call
//! against its deadline, retry transient failures with exponential backoff,
//! validate the result's structure, then discard or roll back the snapshot.

mod error;
pub mod retry;
pub mod snapshot;
pub mod validators;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use waypoint_core::config::ExecutorConfig;
use waypoint_core::types::Step;

use crate::capability::{CapabilityContext, CapabilityError};
use crate::context::RuntimeContext;
use crate::template;

pub use error::{StepError, StepFault};
pub use snapshot::{PathLocks, Snapshot, SnapshotKind};

/// Param keys naming the file a mutating step writes.
const TARGET_PATH_KEYS: &[&str] = &["path", "file_path", "filePath", "output_path"];

/// A successfully executed step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSuccess {
    /// Capability result.
    pub value: serde_json::Value,
    /// Wall time across all invocations and backoff.
    #[serde(with = "waypoint_core::types::duration_ms")]
    pub duration: Duration,
    /// Invocations made.
    pub attempts: u32,
}

/// How a step ended, short of a fault.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// The capability returned a valid result in time.
    Succeeded(StepSuccess),
    /// Cancellation was observed before the step could finish.
    Cancelled {
        /// Cancellation reason.
        reason: String,
    },
}

/// Executes single steps against the runtime's capability registry.
#[derive(Clone)]
pub struct StepExecutor {
    runtime: Arc<RuntimeContext>,
}

impl StepExecutor {
    /// Create an executor.
    #[must_use]
    pub const fn new(runtime: Arc<RuntimeContext>) -> Self {
        Self { runtime }
    }

    /// Execute one step with snapshot, timeout, retry and validation.
    ///
    /// Placeholders in the step's params are resolved from the previous
    /// step's result in `ctx` before dispatch.
    ///
    /// # Errors
    ///
    /// Returns a [`StepError`] naming the capability once retries are
    /// exhausted or a terminal failure occurs. Any snapshot has been rolled
    /// back by then.
    pub async fn execute_safely(
        &self,
        step: &Step,
        ctx: &CapabilityContext,
        config: &ExecutorConfig,
    ) -> Result<StepOutcome, StepError> {
        let token = &ctx.cancellation;
        if let Some(reason) = token.reason() {
            return Ok(StepOutcome::Cancelled {
                reason: reason.to_string(),
            });
        }

        let started = Instant::now();
        let fail = |attempts, fault| StepError {
            tool: step.tool.clone(),
            attempts,
            fault,
            duration: started.elapsed(),
        };

        let capability = self
            .runtime
            .capabilities()
            .get(&step.tool)
            .cloned()
            .ok_or_else(|| fail(0, CapabilityError::NotFound(step.tool.clone()).into()))?;

        let params = ctx
            .previous_result()
            .map_or_else(|| step.params.clone(), |prev| template::resolve(&step.params, prev));

        let snapshot = if config.enable_snapshot && capability.mutates_files() {
            match target_path(&params, ctx) {
                Some(path) => {
                    let guard = tokio::select! {
                        guard = self.runtime.path_locks().lock(&path) => guard,
                        () = token.cancelled() => {
                            return Ok(StepOutcome::Cancelled {
                                reason: token.reason().unwrap_or_default().to_string(),
                            });
                        }
                    };
                    Snapshot::capture(&path, config.snapshot_dir.as_deref(), Some(guard))
                        .await
                        .map_err(|e| {
                            fail(
                                0,
                                CapabilityError::with_code(
                                    "ESNAPSHOT",
                                    format!("Could not snapshot '{}': {e}", path.display()),
                                )
                                .into(),
                            )
                        })?
                }
                None => Snapshot::none(),
            }
        } else {
            Snapshot::none()
        };

        let timeout_ms = step.timeout_ms.unwrap_or(config.timeout_ms);
        let deadline = Duration::from_millis(timeout_ms);
        let max_attempts = step.retries.unwrap_or(config.max_retries).saturating_add(1);
        let retry_delay_ms = step
            .metadata
            .get("retryDelayMs")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(config.retry_delay_ms);
        let mut attempt = 0;

        let fault = loop {
            attempt += 1;
            tracing::debug!(tool = %step.tool, step = ctx.step_index, attempt, "Invoking capability");

            let call_started = Instant::now();
            let raced = tokio::time::timeout(deadline, capability.invoke(&params, ctx)).await;
            let elapsed = call_started.elapsed();

            // Whatever the call returned, a cancelled step reports nothing.
            if let Some(reason) = token.reason() {
                let reason = reason.to_string();
                rollback(snapshot, &step.tool).await;
                return Ok(StepOutcome::Cancelled { reason });
            }

            let fault = match raced {
                // A result that lands on the deadline is late.
                Ok(Ok(_)) | Err(_) if elapsed >= deadline => StepFault::Timeout { timeout_ms },
                Ok(Ok(value)) => {
                    let validated = if config.enable_validation {
                        self.runtime.validators().validate(step, &value)
                    } else {
                        Ok(())
                    };
                    match validated {
                        Ok(()) => {
                            if let Err(e) = snapshot.discard() {
                                tracing::warn!(tool = %step.tool, error = %e, "Failed to discard snapshot");
                            }
                            return Ok(StepOutcome::Succeeded(StepSuccess {
                                value,
                                duration: started.elapsed(),
                                attempts: attempt,
                            }));
                        }
                        Err(reason) => break StepFault::Validation(reason),
                    }
                }
                Err(_) => StepFault::Timeout { timeout_ms },
                Ok(Err(e)) if retry::is_retryable(&e) => match e {
                    CapabilityError::Failed { message, code } => StepFault::Transient { message, code },
                    other => StepFault::Capability(other),
                },
                Ok(Err(e)) => break StepFault::Capability(e),
            };

            if attempt >= max_attempts {
                break fault;
            }

            let delay = retry::backoff_delay(retry_delay_ms, attempt);
            tracing::info!(
                tool = %step.tool,
                step = ctx.step_index,
                attempt,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %fault,
                "Retrying step after transient failure"
            );

            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = token.cancelled() => {
                    rollback(snapshot, &step.tool).await;
                    return Ok(StepOutcome::Cancelled {
                        reason: token.reason().unwrap_or_default().to_string(),
                    });
                }
            }
        };

        tracing::warn!(tool = %step.tool, step = ctx.step_index, attempts = attempt, error = %fault, "Step failed");
        rollback(snapshot, &step.tool).await;
        Err(fail(attempt, fault))
    }
}

/// Roll back a snapshot; failures are logged and never replace the step's error.
async fn rollback(snapshot: Snapshot, tool: &str) {
    let path = snapshot.original_path().map(PathBuf::from);
    if let Err(e) = snapshot.rollback().await {
        tracing::warn!(
            tool = %tool,
            path = ?path,
            error = %e,
            "Snapshot rollback failed"
        );
    }
}

fn target_path(params: &serde_json::Value, ctx: &CapabilityContext) -> Option<PathBuf> {
    TARGET_PATH_KEYS
        .iter()
        .find_map(|k| params.get(*k).and_then(serde_json::Value::as_str))
        .or_else(|| ctx.get("target_path").and_then(serde_json::Value::as_str))
        .filter(|p| !p.is_empty())
        .map(PathBuf::from)
}
