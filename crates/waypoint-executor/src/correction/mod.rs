//! Self-correcting whole-plan execution.
//!
//! Each attempt runs every step of the current plan in order. A failed
//! attempt is diagnosed, the plan is replaced by a corrected one, and the
//! next attempt starts, until an attempt succeeds or the attempt budget is
//! spent.

pub mod diagnosis;
pub mod strategy;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use waypoint_core::config::{Config, ExecutorConfig};
use waypoint_core::history::HistoryKind;
use waypoint_core::types::{ExecutionResult, Plan, PlanExecutionReport, Step, TaskId};
use waypoint_core::validation::validate_plan;

use crate::cancel::CancellationToken;
use crate::capability::CapabilityContext;
use crate::checkpoint::{CheckpointOptions, CheckpointValidator};
use crate::context::RuntimeContext;
use crate::executor::{StepExecutor, StepOutcome};
use crate::llm::{LlmClient, prompt, truncate_for_prompt};

pub use diagnosis::{Diagnosis, DiagnosisSource, diagnose};
pub use strategy::StrategyInput;

/// How a correction's plan was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrectionSource {
    /// A strategy from the built-in table.
    Strategy,
    /// A replacement plan written by the LLM.
    Llm,
    /// No change could be made; the same plan is retried.
    Unchanged,
}

/// One plan replacement made after a failed attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Correction {
    /// Attempt whose failure this corrects.
    pub attempt: u32,
    /// Strategy that was applied.
    pub strategy: String,
    /// Diagnosis the strategy was chosen from.
    pub diagnosis: Diagnosis,
    /// How the new plan was produced.
    pub source: CorrectionSource,
    /// Plan for the next attempt.
    pub new_plan: Plan,
    /// Human-readable changes.
    pub changes: Vec<String>,
}

/// Terminal status of a corrected execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrectionStatus {
    /// An attempt succeeded.
    Succeeded,
    /// The attempt budget ran out.
    Failed,
    /// Cancellation was observed.
    Cancelled,
}

/// Final result of [`SelfCorrectionController::execute_with_correction`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CorrectionReport {
    /// Terminal status.
    pub status: CorrectionStatus,
    /// Whether the last attempt succeeded.
    pub success: bool,
    /// Report of the last attempt.
    pub result: Option<PlanExecutionReport>,
    /// Reports of every attempt, in order.
    pub reports: Vec<PlanExecutionReport>,
    /// Attempts made.
    pub attempts: u32,
    /// Corrections applied between attempts.
    pub corrections: Vec<Correction>,
    /// Failure or cancellation reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Plan of the last attempt.
    pub final_plan: Plan,
}

impl CorrectionReport {
    /// Successful results of the last attempt.
    #[must_use]
    pub fn values(&self) -> Vec<&serde_json::Value> {
        self.result
            .iter()
            .flat_map(|r| r.results.iter())
            .filter_map(|r| r.value.as_ref())
            .collect()
    }
}

/// Hooks for observing a corrected execution.
pub trait CorrectionObserver: Send + Sync {
    /// An attempt is about to start.
    fn on_attempt_started(&self, _attempt: u32, _plan: &Plan) {}

    /// A step is about to be dispatched.
    fn on_step_started(&self, _attempt: u32, _index: usize, _step: &Step) {}

    /// A step finished.
    fn on_step_finished(&self, _attempt: u32, _result: &ExecutionResult) {}

    /// A correction was applied.
    fn on_correction(&self, _correction: &Correction) {}
}

/// Observer that ignores everything.
pub struct NoopObserver;

impl CorrectionObserver for NoopObserver {}

/// Options for one corrected execution.
#[derive(Debug, Clone)]
pub struct CorrectionOptions {
    /// Maximum whole-plan attempts (0 is treated as 1).
    pub max_retries: u32,
    /// Ask the LLM for a replacement plan when no strategy applies.
    pub llm_fallback: bool,
    /// Step executor settings.
    pub executor: ExecutorConfig,
    /// Checkpoint settings; `None` skips checkpoint validation.
    pub checkpoint: Option<CheckpointOptions>,
    /// Task the execution belongs to.
    pub task_id: Option<TaskId>,
    /// Values handed to every capability (e.g. `target_path`).
    pub values: serde_json::Map<String, serde_json::Value>,
}

impl CorrectionOptions {
    /// Options derived from configuration.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_retries: config.correction.max_retries,
            llm_fallback: config.correction.llm_fallback,
            executor: config.executor.clone(),
            checkpoint: config
                .checkpoint
                .enabled
                .then(|| CheckpointOptions::from(&config.checkpoint)),
            task_id: None,
            values: serde_json::Map::new(),
        }
    }

    /// Attach a task id.
    #[must_use]
    pub fn for_task(mut self, task_id: TaskId) -> Self {
        self.checkpoint = self.checkpoint.map(|c| c.for_task(task_id.clone()));
        self.task_id = Some(task_id);
        self
    }
}

impl Default for CorrectionOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

const REGENERATE_SYSTEM_PROMPT: &str = "You repair failed automation plans. \
A plan is a JSON array of steps, each {\"tool\": string, \"params\": object, \"title\": string}. \
Reply with JSON only: the complete replacement plan as an array of steps.";

/// Drives attempts, diagnosis and correction for one plan.
#[derive(Clone)]
pub struct SelfCorrectionController {
    runtime: Arc<RuntimeContext>,
    executor: StepExecutor,
    validator: CheckpointValidator,
}

enum AttemptEnd {
    Finished(PlanExecutionReport),
    Cancelled(PlanExecutionReport, String),
}

impl SelfCorrectionController {
    /// Create a controller.
    #[must_use]
    pub fn new(runtime: Arc<RuntimeContext>) -> Self {
        Self {
            executor: StepExecutor::new(Arc::clone(&runtime)),
            validator: CheckpointValidator::new(Arc::clone(&runtime)),
            runtime,
        }
    }

    /// Execute `plan`, correcting and retrying until it succeeds or the
    /// attempt budget is spent.
    pub async fn execute_with_correction(
        &self,
        plan: Plan,
        token: &CancellationToken,
        options: &CorrectionOptions,
        observer: &dyn CorrectionObserver,
    ) -> CorrectionReport {
        let max_attempts = options.max_retries.max(1);
        let mut plan = plan;
        let mut reports: Vec<PlanExecutionReport> = Vec::new();
        let mut corrections: Vec<Correction> = Vec::new();
        let mut attempts = 0;

        let finish = |status: CorrectionStatus,
                      plan: Plan,
                      reports: Vec<PlanExecutionReport>,
                      corrections: Vec<Correction>,
                      attempts: u32,
                      error: Option<String>| {
            CorrectionReport {
                status,
                success: status == CorrectionStatus::Succeeded,
                result: reports.last().cloned(),
                reports,
                attempts,
                corrections,
                error,
                final_plan: plan,
            }
        };

        while attempts < max_attempts {
            if let Some(reason) = token.reason() {
                let reason = reason.to_string();
                return finish(CorrectionStatus::Cancelled, plan, reports, corrections, attempts, Some(reason));
            }

            attempts += 1;
            tracing::info!(
                task_id = ?options.task_id,
                attempt = attempts,
                steps = plan.len(),
                "Starting plan attempt"
            );
            observer.on_attempt_started(attempts, &plan);

            let report = match self.run_attempt(attempts, &plan, token, options, observer).await {
                AttemptEnd::Finished(report) => report,
                AttemptEnd::Cancelled(report, reason) => {
                    reports.push(report);
                    return finish(CorrectionStatus::Cancelled, plan, reports, corrections, attempts, Some(reason));
                }
            };

            if let Some(reason) = token.reason() {
                let reason = reason.to_string();
                reports.push(report);
                return finish(CorrectionStatus::Cancelled, plan, reports, corrections, attempts, Some(reason));
            }

            if report.is_success() {
                tracing::info!(task_id = ?options.task_id, attempt = attempts, "Plan succeeded");
                reports.push(report);
                return finish(CorrectionStatus::Succeeded, plan, reports, corrections, attempts, None);
            }

            tracing::warn!(
                task_id = ?options.task_id,
                attempt = attempts,
                failed = report.failed_count(),
                "Plan attempt failed"
            );

            if attempts < max_attempts {
                let correction = self.correct(attempts, &plan, &report, options).await;
                if let Some(task_id) = &options.task_id {
                    match serde_json::to_value(&correction) {
                        Ok(payload) => self.runtime.record(task_id, HistoryKind::Correction, payload),
                        Err(e) => tracing::warn!(error = %e, "Failed to serialize correction"),
                    }
                }
                observer.on_correction(&correction);
                plan = correction.new_plan.clone();
                corrections.push(correction);
            }
            reports.push(report);
        }

        let summary = reports
            .last()
            .map(PlanExecutionReport::error_summary)
            .unwrap_or_default();
        let error = format!("Plan failed after {attempts} attempt(s):\n{summary}");
        tracing::error!(task_id = ?options.task_id, attempts, "Plan failed, attempts exhausted");
        finish(CorrectionStatus::Failed, plan, reports, corrections, attempts, Some(error))
    }

    /// Run every step of `plan` once.
    async fn run_attempt(
        &self,
        attempt: u32,
        plan: &Plan,
        token: &CancellationToken,
        options: &CorrectionOptions,
        observer: &dyn CorrectionObserver,
    ) -> AttemptEnd {
        let mut results = Vec::with_capacity(plan.len());
        let mut previous: Vec<Option<serde_json::Value>> = Vec::with_capacity(plan.len());

        for (index, step) in plan.steps().iter().enumerate() {
            if let Some(reason) = token.reason() {
                let reason = reason.to_string();
                return AttemptEnd::Cancelled(PlanExecutionReport::from_results(attempt, results), reason);
            }

            observer.on_step_started(attempt, index, step);
            let ctx = CapabilityContext {
                task_id: options.task_id.clone(),
                step_index: index,
                previous: previous.clone(),
                values: options.values.clone(),
                cancellation: token.clone(),
            };

            let result = match self.executor.execute_safely(step, &ctx, &options.executor).await {
                Ok(StepOutcome::Succeeded(success)) => {
                    let rejection = match &options.checkpoint {
                        Some(checkpoint) => {
                            let outcome = self
                                .validator
                                .validate_checkpoint(index, Some(&success.value), plan, checkpoint)
                                .await;
                            (!outcome.passed)
                                .then(|| format!("Checkpoint failed: {}", outcome.failures().join("; ")))
                        }
                        None => None,
                    };
                    match rejection {
                        Some(error) => ExecutionResult::failed(index, &step.tool, error, success.duration),
                        None => ExecutionResult::succeeded(index, &step.tool, success.value, success.duration),
                    }
                }
                Ok(StepOutcome::Cancelled { reason }) => {
                    return AttemptEnd::Cancelled(PlanExecutionReport::from_results(attempt, results), reason);
                }
                Err(e) => ExecutionResult::failed(index, &step.tool, e.to_string(), e.duration),
            };

            previous.push(result.value.clone());
            observer.on_step_finished(attempt, &result);
            results.push(result);
        }

        AttemptEnd::Finished(PlanExecutionReport::from_results(attempt, results))
    }

    /// Diagnose a failed attempt and build the plan for the next one.
    async fn correct(
        &self,
        attempt: u32,
        plan: &Plan,
        report: &PlanExecutionReport,
        options: &CorrectionOptions,
    ) -> Correction {
        let llm = self.runtime.llm().filter(|_| options.llm_fallback);
        let error_text = report.error_summary();
        let diagnosis = diagnose(&error_text, llm).await;

        let input = StrategyInput {
            plan,
            report,
            executor: &options.executor,
        };

        let (source, new_plan, changes) = if let Some((new_plan, changes)) =
            strategy::apply(&diagnosis.strategy, &input)
        {
            (CorrectionSource::Strategy, new_plan, changes)
        } else if let Some(new_plan) = match llm {
            Some(llm) => regenerate_plan(llm, plan, &error_text).await,
            None => None,
        } {
            let changes = vec![format!(
                "Replaced plan with {} LLM-generated step(s)",
                new_plan.len()
            )];
            (CorrectionSource::Llm, new_plan, changes)
        } else {
            (
                CorrectionSource::Unchanged,
                plan.clone(),
                vec!["No applicable correction, retrying the same plan".to_string()],
            )
        };

        tracing::info!(
            attempt,
            pattern = %diagnosis.pattern,
            strategy = %diagnosis.strategy,
            source = ?source,
            "Plan corrected"
        );

        Correction {
            attempt,
            strategy: diagnosis.strategy.clone(),
            diagnosis,
            source,
            new_plan,
            changes,
        }
    }
}

/// Ask the LLM for a complete replacement plan; `None` if unusable.
async fn regenerate_plan(llm: &LlmClient, plan: &Plan, error_text: &str) -> Option<Plan> {
    let plan_json = serde_json::to_string_pretty(plan.steps()).ok()?;
    let user = format!(
        "Plan:\n{}\n\nErrors:\n{}",
        truncate_for_prompt(&plan_json, 8_000),
        truncate_for_prompt(error_text, 4_000)
    );
    let steps: Vec<Step> = llm.complete_json(prompt(REGENERATE_SYSTEM_PROMPT, user), None).await?;
    let new_plan = Plan::new(steps);

    match validate_plan(&new_plan) {
        Ok(()) => Some(new_plan),
        Err(e) => {
            tracing::warn!(error = %e, "LLM replacement plan rejected");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use serde_json::json;

    use crate::capability::{Capability, CapabilityError, CapabilityRegistry};
    use crate::llm::testing::ScriptedProvider;
    use waypoint_core::config::LlmConfig;

    /// Fails until called `succeed_on` times.
    struct Stubborn {
        name: &'static str,
        succeed_on: u32,
        error: &'static str,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Capability for Stubborn {
        fn name(&self) -> &str {
            self.name
        }

        fn description(&self) -> &str {
            "fails a few times"
        }

        async fn invoke(
            &self,
            _params: &serde_json::Value,
            _ctx: &CapabilityContext,
        ) -> Result<serde_json::Value, CapabilityError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n >= self.succeed_on {
                Ok(json!({"ok": true}))
            } else {
                Err(CapabilityError::failed(self.error))
            }
        }
    }

    fn controller(capabilities: Vec<Arc<dyn Capability>>, llm: Option<LlmClient>) -> SelfCorrectionController {
        let mut registry = CapabilityRegistry::with_builtins();
        for c in capabilities {
            registry.register(c);
        }
        let mut builder = RuntimeContext::builder().capabilities(registry);
        if let Some(llm) = llm {
            builder = builder.llm(llm);
        }
        SelfCorrectionController::new(builder.build())
    }

    fn options(max_retries: u32) -> CorrectionOptions {
        CorrectionOptions {
            max_retries,
            checkpoint: None,
            executor: ExecutorConfig {
                max_retries: 0,
                retry_delay_ms: 1,
                ..ExecutorConfig::default()
            },
            ..CorrectionOptions::default()
        }
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl CorrectionObserver for Recorder {
        fn on_attempt_started(&self, attempt: u32, _plan: &Plan) {
            self.events.lock().unwrap().push(format!("attempt {attempt}"));
        }

        fn on_step_finished(&self, _attempt: u32, result: &ExecutionResult) {
            self.events
                .lock()
                .unwrap()
                .push(format!("step {} {}", result.step_index, result.success));
        }

        fn on_correction(&self, correction: &Correction) {
            self.events
                .lock()
                .unwrap()
                .push(format!("correction {}", correction.strategy));
        }
    }

    #[tokio::test]
    async fn test_first_attempt_success() {
        let ctl = controller(vec![], None);
        let plan = Plan::new(vec![Step::new("echo", json!({"a": 1}))]);

        let report = ctl
            .execute_with_correction(plan, &CancellationToken::new(), &options(3), &NoopObserver)
            .await;

        assert!(report.success);
        assert_eq!(report.status, CorrectionStatus::Succeeded);
        assert_eq!(report.attempts, 1);
        assert!(report.corrections.is_empty());
        assert_eq!(report.values(), vec![&json!({"a": 1})]);
    }

    #[tokio::test]
    async fn test_all_steps_run_even_after_failure() {
        let ctl = controller(
            vec![Arc::new(Stubborn { name: "broken", succeed_on: u32::MAX, error: "weird", calls: AtomicU32::new(0) })],
            None,
        );
        let plan = Plan::new(vec![Step::new("broken", json!({})), Step::new("echo", json!({}))]);
        let recorder = Recorder::default();

        let report = ctl
            .execute_with_correction(plan, &CancellationToken::new(), &options(2), &recorder)
            .await;

        assert!(!report.success);
        assert_eq!(report.attempts, 2);
        assert_eq!(report.corrections.len(), 1);
        assert_eq!(report.corrections[0].source, CorrectionSource::Unchanged);
        let last = report.result.as_ref().unwrap();
        assert_eq!(last.total_steps, 2);
        assert_eq!(last.success_count + last.failed_count(), last.total_steps);
        assert!(report.error.as_deref().unwrap().contains("weird"));
        assert_eq!(
            *recorder.events.lock().unwrap(),
            vec![
                "attempt 1", "step 0 false", "step 1 true", "correction retry",
                "attempt 2", "step 0 false", "step 1 true",
            ]
        );
    }

    #[tokio::test]
    async fn test_zero_budget_still_attempts_once() {
        let ctl = controller(
            vec![Arc::new(Stubborn { name: "broken", succeed_on: u32::MAX, error: "weird", calls: AtomicU32::new(0) })],
            None,
        );
        let report = ctl
            .execute_with_correction(
                Plan::new(vec![Step::new("broken", json!({}))]),
                &CancellationToken::new(),
                &options(0),
                &NoopObserver,
            )
            .await;
        assert_eq!(report.attempts, 1);
        assert!(report.corrections.is_empty());
    }

    #[tokio::test]
    async fn test_llm_regenerates_plan() {
        let llm = LlmClient::new(
            Arc::new(ScriptedProvider::new(vec![
                Ok(r#"{"pattern": "bad_tool", "reason": "wrong tool", "strategy": "replace_tool"}"#),
                Ok(r#"[{"tool": "echo", "params": {"fixed": true}}]"#),
            ])),
            &LlmConfig::default(),
        );
        let ctl = controller(
            vec![Arc::new(Stubborn { name: "broken", succeed_on: u32::MAX, error: "weird", calls: AtomicU32::new(0) })],
            Some(llm),
        );

        let report = ctl
            .execute_with_correction(
                Plan::new(vec![Step::new("broken", json!({}))]),
                &CancellationToken::new(),
                &options(2),
                &NoopObserver,
            )
            .await;

        assert!(report.success);
        assert_eq!(report.corrections[0].source, CorrectionSource::Llm);
        assert_eq!(report.corrections[0].diagnosis.source, DiagnosisSource::Llm);
        assert_eq!(report.final_plan.get(0).unwrap().tool, "echo");
    }

    #[tokio::test]
    async fn test_strategy_correction_recovers() {
        let ctl = controller(
            vec![Arc::new(Stubborn {
                name: "render",
                succeed_on: 2,
                error: "Invalid parameter: width",
                calls: AtomicU32::new(0),
            })],
            None,
        );

        let report = ctl
            .execute_with_correction(
                Plan::new(vec![Step::new("render", json!({"width": -1}))]),
                &CancellationToken::new(),
                &options(3),
                &NoopObserver,
            )
            .await;

        assert!(report.success);
        assert_eq!(report.attempts, 2);
        assert_eq!(report.corrections[0].strategy, "regenerate_params");
        assert!(report.final_plan.get(0).unwrap().flag("regenerate"));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let ctl = controller(vec![], None);
        let token = CancellationToken::new();
        token.cancel("user");

        let report = ctl
            .execute_with_correction(
                Plan::new(vec![Step::new("echo", json!({}))]),
                &token,
                &options(3),
                &NoopObserver,
            )
            .await;

        assert_eq!(report.status, CorrectionStatus::Cancelled);
        assert!(!report.success);
        assert_eq!(report.attempts, 0);
        assert_eq!(report.error.as_deref(), Some("user"));
    }

    #[tokio::test]
    async fn test_checkpoint_rejection_fails_step() {
        let ctl = controller(vec![], None);
        let opts = CorrectionOptions {
            checkpoint: Some(CheckpointOptions::default()),
            ..options(1)
        };

        // echo returns its params; `success: false` fails the completeness rule.
        let report = ctl
            .execute_with_correction(
                Plan::new(vec![Step::new("echo", json!({"success": false}))]),
                &CancellationToken::new(),
                &opts,
                &NoopObserver,
            )
            .await;

        assert!(!report.success);
        let failed = &report.result.unwrap().failed_steps[0];
        assert!(failed.error.as_deref().unwrap().starts_with("Checkpoint failed"));
    }

    /// Fails after `delay_ms`.
    struct Lagging {
        delay_ms: u64,
    }

    #[async_trait]
    impl Capability for Lagging {
        fn name(&self) -> &str {
            "lagging"
        }

        fn description(&self) -> &str {
            "fails slowly"
        }

        async fn invoke(
            &self,
            _params: &serde_json::Value,
            _ctx: &CapabilityContext,
        ) -> Result<serde_json::Value, CapabilityError> {
            tokio::time::sleep(std::time::Duration::from_millis(self.delay_ms)).await;
            Err(CapabilityError::failed("gave up"))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_step_keeps_its_duration() {
        let ctl = controller(vec![Arc::new(Lagging { delay_ms: 30 })], None);

        let report = ctl
            .execute_with_correction(
                Plan::new(vec![Step::new("lagging", json!({}))]),
                &CancellationToken::new(),
                &options(1),
                &NoopObserver,
            )
            .await;

        let failed = &report.result.unwrap().failed_steps[0];
        assert!(failed.duration >= std::time::Duration::from_millis(30));
    }

    /// Cancels the token as soon as a step finishes.
    struct CancelOnFinish {
        token: CancellationToken,
    }

    impl CorrectionObserver for CancelOnFinish {
        fn on_step_finished(&self, _attempt: u32, _result: &ExecutionResult) {
            self.token.cancel("late");
        }
    }

    #[tokio::test]
    async fn test_cancel_after_last_step_is_not_success() {
        let ctl = controller(vec![], None);
        let token = CancellationToken::new();
        let observer = CancelOnFinish { token: token.clone() };

        let report = ctl
            .execute_with_correction(
                Plan::new(vec![Step::new("echo", json!({"a": 1}))]),
                &token,
                &options(3),
                &observer,
            )
            .await;

        assert_eq!(report.status, CorrectionStatus::Cancelled);
        assert!(!report.success);
        assert_eq!(report.attempts, 1);
        assert_eq!(report.error.as_deref(), Some("late"));
    }
}
